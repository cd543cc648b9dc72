//! Saved channel-list query repository.  Rows are keyed by the deterministic
//! (filter, sort) hash, so semantically identical queries share one record.

use rusqlite::{params, OptionalExtension};

use palaver_core::{Cid, FilterObject, QueryChannelsSpec, QuerySort};

use crate::database::Database;
use crate::error::Result;
use crate::repository::{json_from_sql, json_to_sql, ChatStore};

impl Database {
    pub fn upsert_query_spec(&self, spec: &QueryChannelsSpec) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO query_specs (id, filter, sort, cids)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                spec.id,
                json_to_sql(1, &spec.filter)?,
                json_to_sql(2, &spec.sort)?,
                json_to_sql(3, &spec.cids)?,
            ],
        )?;
        Ok(())
    }

    pub fn select_query_spec(&self, id: &str) -> Result<Option<QueryChannelsSpec>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, filter, sort, cids FROM query_specs WHERE id = ?1",
                params![id],
                row_to_query_spec,
            )
            .optional()?)
    }

    pub fn clear_query_specs(&self) -> Result<()> {
        self.conn().execute("DELETE FROM query_specs", [])?;
        Ok(())
    }
}

impl ChatStore {
    pub fn insert_query_spec(&self, spec: QueryChannelsSpec) -> Result<()> {
        self.with_db(|db| db.upsert_query_spec(&spec))
    }

    pub fn select_query_spec(&self, id: &str) -> Result<Option<QueryChannelsSpec>> {
        self.with_db(|db| db.select_query_spec(id))
    }
}

fn row_to_query_spec(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueryChannelsSpec> {
    let filter: FilterObject = json_from_sql(1, row.get(1)?)?;
    let sort: QuerySort = json_from_sql(2, row.get(2)?)?;
    let cids: Vec<Cid> = json_from_sql(3, row.get(3)?)?;
    Ok(QueryChannelsSpec {
        id: row.get(0)?,
        filter,
        sort,
        cids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semantically_equal_queries_share_a_row() {
        let store = ChatStore::new(Database::open_in_memory().unwrap());

        let mut first =
            QueryChannelsSpec::new(FilterObject::eq("type", "messaging"), QuerySort::new());
        first.cids = vec![Cid::new("messaging", "a")];
        store.insert_query_spec(first.clone()).unwrap();

        // same (filter, sort) built elsewhere: same id, row replaced
        let mut second =
            QueryChannelsSpec::new(FilterObject::eq("type", "messaging"), QuerySort::new());
        second.cids = vec![Cid::new("messaging", "a"), Cid::new("messaging", "b")];
        store.insert_query_spec(second.clone()).unwrap();

        let got = store.select_query_spec(&first.id).unwrap().unwrap();
        assert_eq!(got.cids.len(), 2);
    }

    #[test]
    fn different_sort_is_a_different_row() {
        let store = ChatStore::new(Database::open_in_memory().unwrap());
        let filter = FilterObject::eq("type", "messaging");
        let plain = QueryChannelsSpec::new(filter.clone(), QuerySort::new());
        let sorted =
            QueryChannelsSpec::new(filter, QuerySort::new().desc("last_message_at"));

        store.insert_query_spec(plain.clone()).unwrap();
        store.insert_query_spec(sorted.clone()).unwrap();

        assert_ne!(plain.id, sorted.id);
        assert!(store.select_query_spec(&plain.id).unwrap().is_some());
        assert!(store.select_query_spec(&sorted.id).unwrap().is_some());
    }
}
