//! Channel repository.  The channels table persists channel data only;
//! messages live in their own table and are re-attached by the state layer.

use rusqlite::{params, OptionalExtension};

use palaver_core::{Channel, Cid, SyncStatus};

use crate::database::Database;
use crate::error::Result;
use crate::repository::{
    conversion_error, json_from_sql, json_to_sql, ts_from_sql, ts_to_sql, ChatStore,
};

const CHANNEL_COLUMNS: &str = "cid, channel_type, channel_id, name, image, created_by_id, \
     created_at, updated_at, deleted_at, last_message_at, members, reads, unread_count, \
     config, sync_status, extra_data";

impl Database {
    /// Insert-or-replace a batch of channels atomically.
    pub fn upsert_channels(&mut self, channels: &[Channel]) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT OR REPLACE INTO channels ({CHANNEL_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
            ))?;
            for channel in channels {
                stmt.execute(params![
                    channel.cid.to_string(),
                    channel.cid.channel_type(),
                    channel.cid.channel_id(),
                    channel.name,
                    channel.image,
                    channel.created_by_id,
                    ts_to_sql(&channel.created_at),
                    ts_to_sql(&channel.updated_at),
                    ts_to_sql(&channel.deleted_at),
                    ts_to_sql(&channel.last_message_at),
                    json_to_sql(10, &channel.members)?,
                    json_to_sql(11, &channel.reads)?,
                    channel.unread_count as i64,
                    json_to_sql(13, &channel.config)?,
                    channel.sync_status.code(),
                    json_to_sql(15, &channel.extra_data)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn select_channel(&self, cid: &Cid) -> Result<Option<Channel>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE cid = ?1"),
                params![cid.to_string()],
                row_to_channel,
            )
            .optional()?)
    }

    pub fn select_channels(&self, cids: &[Cid]) -> Result<Vec<Channel>> {
        let mut channels = Vec::with_capacity(cids.len());
        for cid in cids {
            if let Some(channel) = self.select_channel(cid)? {
                channels.push(channel);
            }
        }
        Ok(channels)
    }

    /// Channels in the given sync state, oldest first -- retry order.
    pub fn select_channels_by_sync_status(&self, status: SyncStatus) -> Result<Vec<Channel>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels
             WHERE sync_status = ?1
             ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map(params![status.code()], row_to_channel)?;

        let mut channels = Vec::new();
        for row in rows {
            channels.push(row?);
        }
        Ok(channels)
    }

    pub fn delete_channel(&self, cid: &Cid) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM channels WHERE cid = ?1",
            params![cid.to_string()],
        )?;
        Ok(affected > 0)
    }

    pub fn clear_channels(&self) -> Result<()> {
        self.conn().execute("DELETE FROM channels", [])?;
        Ok(())
    }
}

impl ChatStore {
    pub fn insert_channel(&self, channel: Channel) -> Result<()> {
        self.insert_channels(vec![channel])
    }

    /// Persist channels; member user copies are routed through the user
    /// repository so a user showing up in many channels shares one cache
    /// entry.
    pub fn insert_channels(&self, channels: Vec<Channel>) -> Result<()> {
        if channels.is_empty() {
            return Ok(());
        }
        let users: Vec<_> = channels
            .iter()
            .flat_map(|c| c.members.iter().map(|m| m.user.clone()))
            .collect();
        self.insert_users(users)?;
        self.with_db_mut(|db| db.upsert_channels(&channels))
    }

    pub fn select_channel(&self, cid: &Cid) -> Result<Option<Channel>> {
        self.with_db(|db| db.select_channel(cid))
    }

    pub fn select_channels(&self, cids: &[Cid]) -> Result<Vec<Channel>> {
        self.with_db(|db| db.select_channels(cids))
    }

    pub fn select_channels_by_sync_status(&self, status: SyncStatus) -> Result<Vec<Channel>> {
        self.with_db(|db| db.select_channels_by_sync_status(status))
    }

    pub fn delete_channel(&self, cid: &Cid) -> Result<bool> {
        self.with_db(|db| db.delete_channel(cid))
    }
}

fn row_to_channel(row: &rusqlite::Row<'_>) -> rusqlite::Result<Channel> {
    let cid: String = row.get(0)?;
    let cid = cid.parse::<Cid>().map_err(|e| conversion_error(0, e))?;

    let sync_code: i64 = row.get(14)?;
    let sync_status = SyncStatus::from_code(sync_code).map_err(|e| conversion_error(14, e))?;

    Ok(Channel {
        cid,
        name: row.get(3)?,
        image: row.get(4)?,
        created_by_id: row.get(5)?,
        created_at: ts_from_sql(6, row.get(6)?)?,
        updated_at: ts_from_sql(7, row.get(7)?)?,
        deleted_at: ts_from_sql(8, row.get(8)?)?,
        last_message_at: ts_from_sql(9, row.get(9)?)?,
        members: json_from_sql(10, row.get(10)?)?,
        reads: json_from_sql(11, row.get(11)?)?,
        unread_count: row.get::<_, i64>(12)? as u64,
        messages: Vec::new(),
        config: json_from_sql(13, row.get(13)?)?,
        sync_status,
        extra_data: json_from_sql(15, row.get(15)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use palaver_core::{Member, User};

    fn store() -> ChatStore {
        ChatStore::new(Database::open_in_memory().unwrap())
    }

    fn channel(id: &str) -> Channel {
        let mut channel = Channel::new(Cid::new("messaging", id));
        channel.name = format!("#{id}");
        channel.created_at = Some(Utc.timestamp_opt(100, 0).unwrap());
        channel
    }

    #[test]
    fn upsert_round_trip() {
        let store = store();
        store.insert_channel(channel("general")).unwrap();

        let got = store
            .select_channel(&Cid::new("messaging", "general"))
            .unwrap()
            .unwrap();
        assert_eq!(got.name, "#general");
        assert!(got.messages.is_empty());
    }

    #[test]
    fn upsert_same_cid_replaces() {
        let store = store();
        store.insert_channel(channel("general")).unwrap();
        let mut renamed = channel("general");
        renamed.name = "#renamed".into();
        store.insert_channel(renamed).unwrap();

        let got = store
            .select_channel(&Cid::new("messaging", "general"))
            .unwrap()
            .unwrap();
        assert_eq!(got.name, "#renamed");
    }

    #[test]
    fn member_users_reach_the_user_repository() {
        let store = store();
        let mut ch = channel("general");
        let mut user = User::new("u9");
        user.name = "Grace".into();
        ch.members.push(Member::new(user));
        store.insert_channel(ch).unwrap();

        assert_eq!(store.get_user("u9").unwrap().unwrap().name, "Grace");
    }

    #[test]
    fn offline_created_channels_are_retry_candidates() {
        let store = store();
        let mut ch = channel("draft");
        ch.sync_status = SyncStatus::SyncNeeded;
        store.insert_channel(ch).unwrap();

        let pending = store
            .select_channels_by_sync_status(SyncStatus::SyncNeeded)
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].cid.channel_id(), "draft");
    }
}
