//! Message repository.

use rusqlite::{params, OptionalExtension};

use palaver_core::{
    paginate_messages, AnyChannelPaginationRequest, Cid, Message, SyncStatus,
};

use crate::database::Database;
use crate::error::Result;
use crate::repository::{
    conversion_error, json_from_sql, json_to_sql, ts_from_sql, ts_to_sql, ChatStore,
};

const MESSAGE_COLUMNS: &str = "id, cid, text, user_id, attachments, sync_status, created_at, \
     created_locally_at, updated_at, updated_locally_at, deleted_at, own_reactions, \
     reaction_counts, mentioned_user_ids, parent_id, reply_count, poll, extra_data";

impl Database {
    /// Insert-or-replace a batch of messages atomically.
    pub fn upsert_messages(&mut self, messages: &[Message]) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT OR REPLACE INTO messages ({MESSAGE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
            ))?;
            for message in messages {
                stmt.execute(params![
                    message.id,
                    message.cid.as_ref().map(|c| c.to_string()),
                    message.text,
                    message.user_id,
                    json_to_sql(4, &message.attachments)?,
                    message.sync_status.code(),
                    ts_to_sql(&message.created_at),
                    ts_to_sql(&message.created_locally_at),
                    ts_to_sql(&message.updated_at),
                    ts_to_sql(&message.updated_locally_at),
                    ts_to_sql(&message.deleted_at),
                    json_to_sql(11, &message.own_reactions)?,
                    json_to_sql(12, &message.reaction_counts)?,
                    json_to_sql(13, &message.mentioned_user_ids)?,
                    message.parent_id,
                    message.reply_count as i64,
                    message
                        .poll
                        .as_ref()
                        .map(|p| json_to_sql(16, p))
                        .transpose()?,
                    json_to_sql(17, &message.extra_data)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn select_message(&self, id: &str) -> Result<Option<Message>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
                row_to_message,
            )
            .optional()?)
    }

    pub fn select_messages(&self, ids: &[String]) -> Result<Vec<Message>> {
        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(message) = self.select_message(id)? {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    /// All messages of a channel, ascending by creation time.
    pub fn select_messages_for_cid(&self, cid: &Cid) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE cid = ?1
             ORDER BY coalesce(created_at, created_locally_at) ASC"
        ))?;
        let rows = stmt.query_map(params![cid.to_string()], row_to_message)?;
        collect(rows)
    }

    /// Replies of a thread, ascending by creation time.
    pub fn select_messages_for_thread(&self, parent_id: &str) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE parent_id = ?1
             ORDER BY coalesce(created_at, created_locally_at) ASC"
        ))?;
        let rows = stmt.query_map(params![parent_id], row_to_message)?;
        collect(rows)
    }

    /// Messages in the given sync state, oldest first -- retry order.
    pub fn select_messages_by_sync_status(&self, status: SyncStatus) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE sync_status = ?1
             ORDER BY coalesce(created_at, created_locally_at) ASC"
        ))?;
        let rows = stmt.query_map(params![status.code()], row_to_message)?;
        collect(rows)
    }

    pub fn delete_message(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM messages WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    pub fn clear_messages(&self) -> Result<()> {
        self.conn().execute("DELETE FROM messages", [])?;
        Ok(())
    }
}

impl ChatStore {
    pub fn insert_message(&self, message: Message) -> Result<()> {
        self.insert_messages(vec![message])
    }

    /// Persist messages; denormalized sender copies are routed through the
    /// user repository so the cache stays warm.
    pub fn insert_messages(&self, messages: Vec<Message>) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let users: Vec<_> = messages.iter().filter_map(|m| m.user.clone()).collect();
        self.insert_users(users)?;
        self.with_db_mut(|db| db.upsert_messages(&messages))
    }

    pub fn select_message(&self, id: &str) -> Result<Option<Message>> {
        let message = self.with_db(|db| db.select_message(id))?;
        message.map(|m| self.enrich_message(m)).transpose()
    }

    /// Channel page: select candidates, then apply the pure pagination merge.
    pub fn select_messages_for_channel(
        &self,
        cid: &Cid,
        request: &AnyChannelPaginationRequest,
    ) -> Result<Vec<Message>> {
        let candidates = self.with_db(|db| db.select_messages_for_cid(cid))?;
        paginate_messages(candidates, request)
            .into_iter()
            .map(|m| self.enrich_message(m))
            .collect()
    }

    pub fn select_thread_replies(&self, parent_id: &str) -> Result<Vec<Message>> {
        self.with_db(|db| db.select_messages_for_thread(parent_id))?
            .into_iter()
            .map(|m| self.enrich_message(m))
            .collect()
    }

    pub fn select_messages_by_sync_status(&self, status: SyncStatus) -> Result<Vec<Message>> {
        self.with_db(|db| db.select_messages_by_sync_status(status))
    }

    pub fn delete_message(&self, id: &str) -> Result<bool> {
        self.with_db(|db| db.delete_message(id))
    }

    /// Refresh the denormalized sender copy from the user repository.
    fn enrich_message(&self, mut message: Message) -> Result<Message> {
        if !message.user_id.is_empty() {
            message.user = self.get_user(&message.user_id)?;
        }
        Ok(message)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let cid: Option<String> = row.get(1)?;
    let cid = cid
        .map(|s| s.parse::<Cid>().map_err(|e| conversion_error(1, e)))
        .transpose()?;

    let sync_code: i64 = row.get(5)?;
    let sync_status = SyncStatus::from_code(sync_code).map_err(|e| conversion_error(5, e))?;

    let poll: Option<String> = row.get(16)?;
    let poll = poll.map(|s| json_from_sql(16, s)).transpose()?;

    Ok(Message {
        id: row.get(0)?,
        cid,
        text: row.get(2)?,
        user_id: row.get(3)?,
        user: None,
        attachments: json_from_sql(4, row.get(4)?)?,
        sync_status,
        created_at: ts_from_sql(6, row.get(6)?)?,
        created_locally_at: ts_from_sql(7, row.get(7)?)?,
        updated_at: ts_from_sql(8, row.get(8)?)?,
        updated_locally_at: ts_from_sql(9, row.get(9)?)?,
        deleted_at: ts_from_sql(10, row.get(10)?)?,
        own_reactions: json_from_sql(11, row.get(11)?)?,
        reaction_counts: json_from_sql(12, row.get(12)?)?,
        mentioned_user_ids: json_from_sql(13, row.get(13)?)?,
        parent_id: row.get(14)?,
        reply_count: row.get::<_, i64>(15)? as u64,
        poll,
        extra_data: json_from_sql(17, row.get(17)?)?,
    })
}

fn collect(
    rows: impl Iterator<Item = rusqlite::Result<Message>>,
) -> Result<Vec<Message>> {
    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    Ok(messages)
}
