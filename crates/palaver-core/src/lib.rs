//! # palaver-core
//!
//! Domain model shared by every other crate: entities, identifier newtypes,
//! the sync-status and upload state machines, pagination requests with their
//! pure merge logic, and the query-spec identity hash.
//!
//! Nothing in this crate performs I/O.  Persistence lives in `palaver-store`,
//! network access behind the `palaver-transport` boundary.

pub mod models;
pub mod pagination;
pub mod query;
pub mod sync_status;
pub mod types;

mod error;

pub use error::CoreError;
pub use models::*;
pub use pagination::{
    paginate_channels, paginate_messages, AnyChannelPaginationRequest, MessageCursor, Pagination,
    QueryChannelsPaginationRequest,
};
pub use query::{FilterObject, QueryChannelsSpec, QuerySort, SortDirection, SortSpec};
pub use sync_status::{SyncStatus, UploadState};
pub use types::{Cid, ConnectionStatus};
