//! td application crate: the SQLite store, session manager, workflow
//! application, and the sync engine with its auto-sync scheduler.
//!
//! The command layer in `main.rs` is a thin shell over this library; every
//! operation here is callable (and tested) without a terminal.

pub mod db;
pub mod project;
pub mod session;
pub mod sync;
pub mod workflow;

pub use db::Store;
pub use session::SessionManager;
pub use sync::{auto::AutoSync, engine::SyncEngine, transport::SyncTransport};
