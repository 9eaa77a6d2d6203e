//! Auto-sync scheduler: debounce, in-flight guard, CLI hooks.
//!
//! One handle lives for the length of a CLI invocation and is passed
//! explicitly to the hooks; there is no global state and no background
//! thread. The startup hook never touches the debounce stamp, so the
//! post-mutation hook still fires for the very next mutation. Every failure
//! inside auto-sync is traced at debug level and swallowed: auto-sync must
//! never change the parent command's exit code.

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    },
    time::Instant,
};

use td_core::{Result, SyncSettings};
use tracing::debug;

use super::{engine::SyncEngine, transport::SyncTransport};
use crate::db::sync_rows;

/// Commands the startup hook never syncs in front of.
pub const SKIP_COMMANDS: &[&str] = &["sync", "auth", "login", "version", "help"];

/// Commands that mutate the store and trigger the post-mutation hook.
pub const MUTATING_COMMANDS: &[&str] = &[
    "init", "create", "update", "edit", "delete", "restore", "start", "unstart", "close",
    "review", "approve", "reject", "block", "unblock", "reopen", "handoff", "log", "comment",
    "note", "board", "dep", "ws", "monitor", "undo", "import", "epic", "task", "focus",
    "unfocus", "link", "unlink",
];

/// Process-scoped auto-sync state.
#[derive(Debug)]
pub struct AutoSync {
    settings: SyncSettings,
    /// Debounce stamp; only the post-mutation hook writes it.
    last_auto_sync_at: Mutex<Option<Instant>>,
    /// 1 while a sync runs; entered with compare-and-swap.
    in_flight: AtomicU32,
}

impl AutoSync {
    /// Build a handle with the given settings.
    #[must_use]
    pub const fn new(settings: SyncSettings) -> Self {
        Self {
            settings,
            last_auto_sync_at: Mutex::new(None),
            in_flight: AtomicU32::new(0),
        }
    }

    /// Classify a command name as mutating.
    #[must_use]
    pub fn is_mutating_command(command: &str) -> bool {
        MUTATING_COMMANDS.contains(&command)
    }

    /// Startup hook: sync before the command runs, unless the command is in
    /// the skip set. Deliberately leaves the debounce stamp untouched.
    pub async fn on_startup<T: SyncTransport>(
        &self,
        command: &str,
        engine: &SyncEngine<T>,
        session_id: &str,
    ) {
        if !self.settings.enabled || !self.settings.on_start_enabled {
            return;
        }
        if SKIP_COMMANDS.contains(&command) {
            return;
        }
        self.auto_sync_once(engine, session_id).await;
    }

    /// Post-mutation hook: debounced sync after a mutating command.
    pub async fn on_after_mutation<T: SyncTransport>(
        &self,
        engine: &SyncEngine<T>,
        session_id: &str,
    ) {
        {
            let Ok(mut stamp) = self.last_auto_sync_at.lock() else {
                return;
            };
            if let Some(last) = *stamp {
                if last.elapsed() < self.settings.debounce {
                    debug!("auto-sync debounced");
                    return;
                }
            }
            *stamp = Some(Instant::now());
        }
        self.auto_sync_once(engine, session_id).await;
    }

    /// One guarded sync pass. Returns immediately when a pass is already in
    /// flight. Every error is logged at debug level and swallowed.
    pub async fn auto_sync_once<T: SyncTransport>(
        &self,
        engine: &SyncEngine<T>,
        session_id: &str,
    ) {
        if self
            .in_flight
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("auto-sync already in flight");
            return;
        }
        if let Err(e) = self.run(engine, session_id).await {
            debug!(error = %e, "auto-sync failed");
        }
        self.in_flight.store(0, Ordering::SeqCst);
    }

    async fn run<T: SyncTransport>(
        &self,
        engine: &SyncEngine<T>,
        session_id: &str,
    ) -> Result<()> {
        if !self.settings.enabled {
            return Ok(());
        }
        if !engine.transport().has_credentials() {
            debug!("auto-sync skipped: not authenticated");
            return Ok(());
        }
        let mut conn = engine.store().acquire().await?;
        let state = sync_rows::get_state(&mut conn).await?;
        drop(conn);
        let Some(state) = state else {
            debug!("auto-sync skipped: not linked");
            return Ok(());
        };
        if state.sync_disabled {
            debug!("auto-sync skipped: sync disabled");
            return Ok(());
        }

        engine.push_once(session_id).await?;
        if self.settings.pull_enabled {
            engine.pull_once().await?;
        }
        Ok(())
    }

    /// The debounce stamp, for introspection and tests.
    #[must_use]
    pub fn last_auto_sync_at(&self) -> Option<Instant> {
        self.last_auto_sync_at.lock().ok().and_then(|g| *g)
    }

    /// True while a pass is running.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) == 1
    }

    /// Seize the in-flight flag without running a sync, as a racing pass
    /// would. Returns false when already held.
    pub fn seize_in_flight(&self) -> bool {
        self.in_flight
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Release a flag taken with [`Self::seize_in_flight`].
    pub fn release_in_flight(&self) {
        self.in_flight.store(0, Ordering::SeqCst);
    }
}
