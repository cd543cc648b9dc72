//! Sync-state repository: one recovery checkpoint row per user.

use rusqlite::{params, OptionalExtension};

use palaver_core::{Cid, SyncState};

use crate::database::Database;
use crate::error::Result;
use crate::repository::{json_from_sql, json_to_sql, ts_from_sql, ts_to_sql, ChatStore};

impl Database {
    pub fn upsert_sync_state(&self, state: &SyncState) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO sync_state (user_id, active_cids, last_synced_at)
             VALUES (?1, ?2, ?3)",
            params![
                state.user_id,
                json_to_sql(1, &state.active_cids)?,
                ts_to_sql(&state.last_synced_at),
            ],
        )?;
        Ok(())
    }

    pub fn select_sync_state(&self, user_id: &str) -> Result<Option<SyncState>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT user_id, active_cids, last_synced_at
                 FROM sync_state WHERE user_id = ?1",
                params![user_id],
                row_to_sync_state,
            )
            .optional()?)
    }

    pub fn clear_sync_state(&self) -> Result<()> {
        self.conn().execute("DELETE FROM sync_state", [])?;
        Ok(())
    }
}

impl ChatStore {
    pub fn insert_sync_state(&self, state: SyncState) -> Result<()> {
        self.with_db(|db| db.upsert_sync_state(&state))
    }

    pub fn select_sync_state(&self, user_id: &str) -> Result<Option<SyncState>> {
        self.with_db(|db| db.select_sync_state(user_id))
    }
}

fn row_to_sync_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncState> {
    let active_cids: Vec<Cid> = json_from_sql(1, row.get(1)?)?;
    Ok(SyncState {
        user_id: row.get(0)?,
        active_cids,
        last_synced_at: ts_from_sql(2, row.get(2)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn round_trip_and_replace() {
        let store = ChatStore::new(Database::open_in_memory().unwrap());
        let mut state = SyncState::new("u1");
        state.active_cids = vec![Cid::new("messaging", "a"), Cid::new("messaging", "b")];
        store.insert_sync_state(state.clone()).unwrap();

        state.last_synced_at = Some(Utc.timestamp_opt(500, 0).unwrap());
        state.active_cids.pop();
        store.insert_sync_state(state.clone()).unwrap();

        let got = store.select_sync_state("u1").unwrap().unwrap();
        assert_eq!(got, state);
        assert!(store.select_sync_state("other").unwrap().is_none());
    }
}
