//! Cursor pagination for message lists and offset pagination for channel
//! lists, plus the pure merge logic applied to freshly-selected candidates.

use serde::{Deserialize, Serialize};

use crate::models::{Channel, Message};
use crate::query::{QuerySort, SortDirection};

/// Cursor direction relative to a known message id.  Never more than one
/// direction is active per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pagination {
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
}

impl Pagination {
    /// Paging toward newer messages.
    pub fn is_forward(self) -> bool {
        matches!(self, Pagination::GreaterThan | Pagination::GreaterThanOrEqual)
    }

    /// Whether the cursor message itself is part of the result.
    pub fn is_inclusive(self) -> bool {
        matches!(
            self,
            Pagination::GreaterThanOrEqual | Pagination::LessThanOrEqual
        )
    }
}

/// Cursor anchored at a message id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCursor {
    pub direction: Pagination,
    pub message_id: String,
}

/// Pagination request for a single channel's message list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnyChannelPaginationRequest {
    pub limit: usize,
    pub cursor: Option<MessageCursor>,
}

impl AnyChannelPaginationRequest {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            cursor: None,
        }
    }

    /// Same request anchored at `message_id` in the given direction.
    pub fn with_cursor(self, direction: Pagination, message_id: impl Into<String>) -> Self {
        Self {
            cursor: Some(MessageCursor {
                direction,
                message_id: message_id.into(),
            }),
            ..self
        }
    }
}

impl Default for AnyChannelPaginationRequest {
    fn default() -> Self {
        Self::with_limit(30)
    }
}

/// Offset pagination for channel-list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryChannelsPaginationRequest {
    pub offset: usize,
    pub limit: usize,
    /// How many of each channel's most recent messages the server includes.
    pub message_limit: usize,
}

impl QueryChannelsPaginationRequest {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit,
            message_limit: 10,
        }
    }

    pub fn with_message_limit(self, message_limit: usize) -> Self {
        Self {
            message_limit,
            ..self
        }
    }

    pub fn is_first_page(&self) -> bool {
        self.offset == 0
    }
}

impl Default for QueryChannelsPaginationRequest {
    fn default() -> Self {
        Self::new(0, 30)
    }
}

/// Apply a message pagination request to a candidate set.
///
/// Candidates are ordered ascending by creation time; the returned slice is
/// always chronological.  With a forward cursor the `limit` messages directly
/// after (or at, when inclusive) the cursor are kept; with a backward cursor
/// the `limit` messages directly before it.  Without a cursor the newest
/// `limit` messages are returned.  An unknown cursor id yields an empty
/// result.
pub fn paginate_messages(
    mut candidates: Vec<Message>,
    request: &AnyChannelPaginationRequest,
) -> Vec<Message> {
    candidates.sort_by(|a, b| {
        a.created_time()
            .cmp(&b.created_time())
            .then_with(|| a.id.cmp(&b.id))
    });

    let cursor = match &request.cursor {
        None => {
            let skip = candidates.len().saturating_sub(request.limit);
            return candidates.split_off(skip);
        }
        Some(cursor) => cursor,
    };

    let pos = match candidates.iter().position(|m| m.id == cursor.message_id) {
        Some(pos) => pos,
        None => return Vec::new(),
    };

    let mut side: Vec<Message> = match cursor.direction {
        Pagination::GreaterThan => candidates.split_off(pos + 1),
        Pagination::GreaterThanOrEqual => candidates.split_off(pos),
        Pagination::LessThan => {
            candidates.truncate(pos);
            candidates
        }
        Pagination::LessThanOrEqual => {
            candidates.truncate(pos + 1);
            candidates
        }
    };

    if cursor.direction.is_forward() {
        side.truncate(request.limit);
    } else {
        let skip = side.len().saturating_sub(request.limit);
        side.drain(..skip);
    }
    side
}

/// Sort channels by a derived comparator, then apply offset/limit.
///
/// Comparison runs through the sort specs in order; unknown fields fall back
/// to the channel's extra-data map and otherwise compare equal.
pub fn paginate_channels(
    mut channels: Vec<Channel>,
    sort: &QuerySort,
    request: &QueryChannelsPaginationRequest,
) -> Vec<Channel> {
    channels.sort_by(|a, b| compare_channels(a, b, sort));
    channels
        .into_iter()
        .skip(request.offset)
        .take(request.limit)
        .collect()
}

fn compare_channels(a: &Channel, b: &Channel, sort: &QuerySort) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    for spec in &sort.fields {
        let ord = match spec.field.as_str() {
            "last_message_at" => a.last_message_at.cmp(&b.last_message_at),
            "created_at" => a.created_at.cmp(&b.created_at),
            "updated_at" => a.updated_at.cmp(&b.updated_at),
            "member_count" => a.member_count().cmp(&b.member_count()),
            "unread_count" => a.unread_count.cmp(&b.unread_count),
            "name" => a.name.cmp(&b.name),
            "cid" => a.cid.cmp(&b.cid),
            field => compare_extra(a, b, field),
        };
        let ord = match spec.direction {
            SortDirection::Ascending => ord,
            SortDirection::Descending => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn compare_extra(a: &Channel, b: &Channel, field: &str) -> std::cmp::Ordering {
    use serde_json::Value;
    use std::cmp::Ordering;

    match (a.extra_data.get(field), b.extra_data.get(field)) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Cid;
    use chrono::{TimeZone, Utc};

    fn message(id: &str, secs: i64) -> Message {
        let mut msg = Message::new_local(
            Cid::new("messaging", "general"),
            "u1",
            "text",
            vec![],
            Utc.timestamp_opt(secs, 0).unwrap(),
        );
        msg.id = id.to_string();
        msg
    }

    fn five() -> Vec<Message> {
        // shuffled on purpose; pagination must sort first
        vec![
            message("m3", 30),
            message("m1", 10),
            message("m5", 50),
            message("m2", 20),
            message("m4", 40),
        ]
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn greater_than_returns_adjacent_newer() {
        let request =
            AnyChannelPaginationRequest::with_limit(1).with_cursor(Pagination::GreaterThan, "m2");
        assert_eq!(ids(&paginate_messages(five(), &request)), ["m3"]);
    }

    #[test]
    fn less_than_or_equal_returns_chronological() {
        let request = AnyChannelPaginationRequest::with_limit(2)
            .with_cursor(Pagination::LessThanOrEqual, "m3");
        assert_eq!(ids(&paginate_messages(five(), &request)), ["m2", "m3"]);
    }

    #[test]
    fn less_than_excludes_cursor() {
        let request =
            AnyChannelPaginationRequest::with_limit(2).with_cursor(Pagination::LessThan, "m3");
        assert_eq!(ids(&paginate_messages(five(), &request)), ["m1", "m2"]);
    }

    #[test]
    fn greater_than_or_equal_includes_cursor() {
        let request = AnyChannelPaginationRequest::with_limit(2)
            .with_cursor(Pagination::GreaterThanOrEqual, "m4");
        assert_eq!(ids(&paginate_messages(five(), &request)), ["m4", "m5"]);
    }

    #[test]
    fn no_cursor_returns_newest_in_chronological_order() {
        let request = AnyChannelPaginationRequest::with_limit(2);
        assert_eq!(ids(&paginate_messages(five(), &request)), ["m4", "m5"]);
    }

    #[test]
    fn unknown_cursor_yields_empty() {
        let request =
            AnyChannelPaginationRequest::with_limit(2).with_cursor(Pagination::GreaterThan, "nope");
        assert!(paginate_messages(five(), &request).is_empty());
    }

    #[test]
    fn limit_larger_than_side_returns_whole_side() {
        let request =
            AnyChannelPaginationRequest::with_limit(10).with_cursor(Pagination::LessThan, "m3");
        assert_eq!(ids(&paginate_messages(five(), &request)), ["m1", "m2"]);
    }

    fn channel(id: &str, last_message_secs: Option<i64>, unread: u64) -> Channel {
        let mut ch = Channel::new(Cid::new("messaging", id));
        ch.last_message_at = last_message_secs.map(|s| Utc.timestamp_opt(s, 0).unwrap());
        ch.unread_count = unread;
        ch
    }

    #[test]
    fn channels_sorted_then_offset_then_limit() {
        let channels = vec![
            channel("a", Some(10), 0),
            channel("b", Some(30), 0),
            channel("c", Some(20), 0),
            channel("d", None, 0),
        ];
        let sort = QuerySort::new().desc("last_message_at");
        let request = QueryChannelsPaginationRequest::new(1, 2);

        let page = paginate_channels(channels, &sort, &request);
        let cids: Vec<String> = page.iter().map(|c| c.cid.to_string()).collect();
        assert_eq!(cids, ["messaging:c", "messaging:a"]);
    }

    #[test]
    fn channel_sort_breaks_ties_with_later_fields() {
        let channels = vec![
            channel("a", Some(10), 2),
            channel("b", Some(10), 5),
        ];
        let sort = QuerySort::new().desc("last_message_at").desc("unread_count");
        let request = QueryChannelsPaginationRequest::new(0, 10);

        let page = paginate_channels(channels, &sort, &request);
        assert_eq!(page[0].cid.channel_id(), "b");
    }
}
