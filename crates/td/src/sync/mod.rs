//! Bidirectional sync: transport, engine, remote-event application, snapshot
//! bootstrap, and the auto-sync scheduler.

pub mod apply;
pub mod auth;
pub mod auto;
pub mod engine;
pub mod snapshot;
pub mod transport;

pub use engine::{PullOutcome, PushOutcome, SyncEngine, PULL_PAGE_SIZE, PUSH_BATCH_SIZE};
pub use snapshot::BootstrapOutcome;
pub use transport::{HttpTransport, SyncTransport};
