mod config;
mod crawler;
mod listing;
mod mirror;
mod probe;
mod sync;

pub use config::{OnError, SiteConfig, SyncConfig};
pub use crawler::{sync_site, FileTask, SyncSummary};
pub use listing::{Listing, NodeKind, RemoteNode};
pub use mirror::{local_path, publish, WriteJob};
pub use probe::last_modified;
pub use sync::{decide, local_mtime, Decision};

pub use anyhow;
