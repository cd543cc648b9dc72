//! Reaction repository.  Rows are keyed by (message id, user id, kind); a
//! locally-deleted reaction keeps its row with `deleted_at` set until the
//! deletion is confirmed remotely.

use rusqlite::{params, OptionalExtension};

use palaver_core::{Reaction, SyncStatus};

use crate::database::Database;
use crate::error::Result;
use crate::repository::{
    conversion_error, json_from_sql, json_to_sql, ts_from_sql, ts_to_sql, ChatStore,
};

const REACTION_COLUMNS: &str =
    "message_id, user_id, kind, score, sync_status, created_at, updated_at, deleted_at, extra_data";

impl Database {
    /// Insert-or-replace a batch of reactions atomically.
    pub fn upsert_reactions(&mut self, reactions: &[Reaction]) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT OR REPLACE INTO reactions ({REACTION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ))?;
            for reaction in reactions {
                stmt.execute(params![
                    reaction.message_id,
                    reaction.user_id,
                    reaction.kind,
                    reaction.score as i64,
                    reaction.sync_status.code(),
                    ts_to_sql(&reaction.created_at),
                    ts_to_sql(&reaction.updated_at),
                    ts_to_sql(&reaction.deleted_at),
                    json_to_sql(8, &reaction.extra_data)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn select_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        kind: &str,
    ) -> Result<Option<Reaction>> {
        Ok(self
            .conn()
            .query_row(
                &format!(
                    "SELECT {REACTION_COLUMNS} FROM reactions
                     WHERE message_id = ?1 AND user_id = ?2 AND kind = ?3"
                ),
                params![message_id, user_id, kind],
                row_to_reaction,
            )
            .optional()?)
    }

    /// Live (not locally-deleted) reactions of a message.
    pub fn select_reactions_for_message(&self, message_id: &str) -> Result<Vec<Reaction>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {REACTION_COLUMNS} FROM reactions
             WHERE message_id = ?1 AND deleted_at IS NULL
             ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map(params![message_id], row_to_reaction)?;
        collect(rows)
    }

    /// Reactions in the given sync state, oldest first -- retry order.
    pub fn select_reactions_by_sync_status(&self, status: SyncStatus) -> Result<Vec<Reaction>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {REACTION_COLUMNS} FROM reactions
             WHERE sync_status = ?1
             ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map(params![status.code()], row_to_reaction)?;
        collect(rows)
    }

    pub fn delete_reaction(&self, message_id: &str, user_id: &str, kind: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND kind = ?3",
            params![message_id, user_id, kind],
        )?;
        Ok(affected > 0)
    }

    pub fn clear_reactions(&self) -> Result<()> {
        self.conn().execute("DELETE FROM reactions", [])?;
        Ok(())
    }
}

impl ChatStore {
    pub fn insert_reaction(&self, reaction: Reaction) -> Result<()> {
        self.insert_reactions(vec![reaction])
    }

    pub fn insert_reactions(&self, reactions: Vec<Reaction>) -> Result<()> {
        if reactions.is_empty() {
            return Ok(());
        }
        self.with_db_mut(|db| db.upsert_reactions(&reactions))
    }

    pub fn select_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        kind: &str,
    ) -> Result<Option<Reaction>> {
        self.with_db(|db| db.select_reaction(message_id, user_id, kind))
    }

    pub fn select_reactions_for_message(&self, message_id: &str) -> Result<Vec<Reaction>> {
        self.with_db(|db| db.select_reactions_for_message(message_id))
    }

    pub fn select_reactions_by_sync_status(&self, status: SyncStatus) -> Result<Vec<Reaction>> {
        self.with_db(|db| db.select_reactions_by_sync_status(status))
    }

    pub fn delete_reaction(&self, message_id: &str, user_id: &str, kind: &str) -> Result<bool> {
        self.with_db(|db| db.delete_reaction(message_id, user_id, kind))
    }
}

fn row_to_reaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<Reaction> {
    let sync_code: i64 = row.get(4)?;
    let sync_status = SyncStatus::from_code(sync_code).map_err(|e| conversion_error(4, e))?;

    Ok(Reaction {
        message_id: row.get(0)?,
        user_id: row.get(1)?,
        kind: row.get(2)?,
        score: row.get::<_, i64>(3)? as u64,
        sync_status,
        created_at: ts_from_sql(5, row.get(5)?)?,
        updated_at: ts_from_sql(6, row.get(6)?)?,
        deleted_at: ts_from_sql(7, row.get(7)?)?,
        extra_data: json_from_sql(8, row.get(8)?)?,
    })
}

fn collect(
    rows: impl Iterator<Item = rusqlite::Result<Reaction>>,
) -> Result<Vec<Reaction>> {
    let mut reactions = Vec::new();
    for row in rows {
        reactions.push(row?);
    }
    Ok(reactions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn store() -> ChatStore {
        ChatStore::new(Database::open_in_memory().unwrap())
    }

    fn reaction(message_id: &str, user_id: &str, kind: &str, secs: i64) -> Reaction {
        let mut reaction = Reaction::new(message_id, user_id, kind);
        reaction.created_at = Some(Utc.timestamp_opt(secs, 0).unwrap());
        reaction
    }

    #[test]
    fn keyed_by_message_user_and_kind() {
        let store = store();
        store.insert_reaction(reaction("m1", "u1", "like", 10)).unwrap();
        store.insert_reaction(reaction("m1", "u1", "love", 11)).unwrap();
        store.insert_reaction(reaction("m1", "u2", "like", 12)).unwrap();
        // same key again: replaced, not duplicated
        store.insert_reaction(reaction("m1", "u1", "like", 13)).unwrap();

        let all = store.select_reactions_for_message("m1").unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn locally_deleted_reactions_are_hidden_but_kept() {
        let store = store();
        let mut r = reaction("m1", "u1", "like", 10);
        r.deleted_at = Some(Utc.timestamp_opt(20, 0).unwrap());
        store.insert_reaction(r).unwrap();

        assert!(store.select_reactions_for_message("m1").unwrap().is_empty());
        assert!(store.select_reaction("m1", "u1", "like").unwrap().is_some());
    }

    #[test]
    fn sync_needed_selected_oldest_first() {
        let store = store();
        store.insert_reaction(reaction("m2", "u1", "like", 20)).unwrap();
        store.insert_reaction(reaction("m1", "u1", "like", 10)).unwrap();

        let pending = store
            .select_reactions_by_sync_status(SyncStatus::SyncNeeded)
            .unwrap();
        assert_eq!(pending[0].message_id, "m1");
        assert_eq!(pending[1].message_id, "m2");
    }
}
