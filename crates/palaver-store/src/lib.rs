//! # palaver-store
//!
//! Local durable mirror of the chat domain, backed by SQLite.
//!
//! The crate exposes two layers: a synchronous [`Database`] handle wrapping a
//! `rusqlite::Connection` with typed CRUD helpers per entity kind, and the
//! [`ChatStore`] repository facade that serializes storage access, keeps the
//! bounded user cache write-through, and publishes the latest-users live
//! view.

pub mod cache;
pub mod channels;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod query_specs;
pub mod reactions;
pub mod repository;
pub mod sync_state;
pub mod users;

mod error;

pub use cache::LruCache;
pub use database::Database;
pub use error::StoreError;
pub use repository::ChatStore;
