use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Composite channel identifier, `type:id` (e.g. `messaging:general`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct Cid {
    channel_type: String,
    channel_id: String,
}

impl Cid {
    pub fn new(channel_type: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            channel_type: channel_type.into(),
            channel_id: channel_id.into(),
        }
    }

    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel_type, self.channel_id)
    }
}

impl FromStr for Cid {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((channel_type, channel_id))
                if !channel_type.is_empty() && !channel_id.is_empty() =>
            {
                Ok(Self::new(channel_type, channel_id))
            }
            _ => Err(CoreError::InvalidCid(s.to_string())),
        }
    }
}

impl TryFrom<String> for Cid {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Cid> for String {
    fn from(cid: Cid) -> Self {
        cid.to_string()
    }
}

/// Connection state of the realtime transport, as seen by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionStatus {
    pub fn is_online(self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}
