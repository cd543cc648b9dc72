//! User repository: durable rows plus the write-through LRU cache.

use rusqlite::{params, OptionalExtension};

use palaver_core::User;

use crate::database::Database;
use crate::error::Result;
use crate::repository::{json_from_sql, json_to_sql, ts_from_sql, ts_to_sql, ChatStore};

impl Database {
    /// Insert-or-replace a batch of users atomically.
    pub fn upsert_users(&mut self, users: &[User]) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO users
                 (id, name, image, role, created_at, updated_at, last_active,
                  invisible, banned, extra_data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for user in users {
                stmt.execute(params![
                    user.id,
                    user.name,
                    user.image,
                    user.role,
                    ts_to_sql(&user.created_at),
                    ts_to_sql(&user.updated_at),
                    ts_to_sql(&user.last_active),
                    user.invisible as i64,
                    user.banned as i64,
                    json_to_sql(9, &user.extra_data)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn select_user(&self, id: &str) -> Result<Option<User>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, name, image, role, created_at, updated_at, last_active,
                        invisible, banned, extra_data
                 FROM users WHERE id = ?1",
                params![id],
                row_to_user,
            )
            .optional()?)
    }

    pub fn select_users(&self, ids: &[String]) -> Result<Vec<User>> {
        let mut users = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(user) = self.select_user(id)? {
                users.push(user);
            }
        }
        Ok(users)
    }

    pub fn clear_users(&self) -> Result<()> {
        self.conn().execute("DELETE FROM users", [])?;
        Ok(())
    }
}

impl ChatStore {
    pub fn insert_user(&self, user: User) -> Result<()> {
        self.insert_users(vec![user])
    }

    /// Upsert users, cache first so repeated reads of hot profiles never hit
    /// storage, then the durable rows, then the latest-users live view.
    pub fn insert_users(&self, users: Vec<User>) -> Result<()> {
        if users.is_empty() {
            return Ok(());
        }
        self.with_user_cache(|cache| {
            for user in &users {
                cache.insert(user.id.clone(), user.clone());
            }
        });
        self.with_db_mut(|db| db.upsert_users(&users))?;
        self.publish_latest_users();
        Ok(())
    }

    /// Fetch a user by id (or the `"me"` alias).  Cache hits skip storage;
    /// misses populate the cache.
    pub fn get_user(&self, id: &str) -> Result<Option<User>> {
        let Some(id) = self.resolve_user_id(id) else {
            return Ok(None);
        };

        if let Some(user) = self.with_user_cache(|cache| cache.get(&id).cloned()) {
            return Ok(Some(user));
        }

        let user = self.with_db(|db| db.select_user(&id))?;
        if let Some(user) = &user {
            self.with_user_cache(|cache| cache.insert(user.id.clone(), user.clone()));
        }
        Ok(user)
    }

    pub fn get_users(&self, ids: &[String]) -> Result<Vec<User>> {
        let mut users = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(user) = self.get_user(id)? {
                users.push(user);
            }
        }
        Ok(users)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        name: row.get(1)?,
        image: row.get(2)?,
        role: row.get(3)?,
        created_at: ts_from_sql(4, row.get(4)?)?,
        updated_at: ts_from_sql(5, row.get(5)?)?,
        last_active: ts_from_sql(6, row.get(6)?)?,
        invisible: row.get::<_, i64>(7)? != 0,
        banned: row.get::<_, i64>(8)? != 0,
        extra_data: json_from_sql(9, row.get(9)?)?,
    })
}
