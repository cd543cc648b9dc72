//! # palaver-client
//!
//! The session-scoped engine tying the other crates together: observable
//! per-channel/thread/query state containers, the merge logic that decides
//! how inbound data updates them, the active-entities registry, the
//! attachment upload pipeline, and the sync manager that reconciles local
//! and remote state after connectivity loss.
//!
//! There is no ambient global state: everything hangs off an explicitly
//! constructed [`ChatSession`].

pub mod events;
pub mod logic;
pub mod registry;
pub mod session;
pub mod state;
pub mod sync;
pub mod uploader;

mod error;

pub use error::ChatError;
pub use registry::ActiveEntities;
pub use session::{ChatSession, SessionConfig};
pub use sync::SyncManager;
pub use uploader::AttachmentUploader;

use tracing_subscriber::{fmt, EnvFilter};

/// Install the default tracing subscriber for applications embedding the
/// engine.  Honors `RUST_LOG`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("palaver_client=debug,palaver_store=info,palaver_transport=info,warn")
    });

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
