//! Session manager: stable identity per (branch, agent fingerprint).
//!
//! `get_or_create` is the only entry point ordinary commands use. It re-uses
//! the latest session for the current key while it is fresh, and rotates
//! otherwise: a new id is minted, the old row keeps its frozen
//! `last_activity`, and the new row records where it came from. Session
//! creation is journaled like any other mutation so peers learn about it.

use chrono::{Duration, Utc};
use td_core::{
    session::{can_reuse, AgentKind, Fingerprint, SESSION_ENV_OVERRIDE},
    ActionKind, EntityKind, Result, Session,
};

use crate::db::{actionlog, sessions, Store};

/// A session idle longer than this rotates instead of resuming.
pub const IDLE_WINDOW_HOURS: i64 = 8;

/// Sessions idle longer than this are deleted by cleanup.
pub const CLEANUP_HORIZON_DAYS: i64 = 30;

/// Session operations over a store.
#[derive(Debug, Clone)]
pub struct SessionManager {
    store: Store,
}

impl SessionManager {
    /// Wrap a store.
    #[must_use]
    pub const fn new(store: Store) -> Self {
        Self { store }
    }

    /// Current session for (branch, fingerprint), creating or rotating as
    /// needed. `is_new` is true only on the call that created the row.
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` on store failure.
    pub async fn get_or_create(&self, branch: &str) -> Result<Session> {
        let fingerprint = resolve_fingerprint();
        self.get_or_create_with(branch, &fingerprint).await
    }

    /// As [`Self::get_or_create`], with an explicit fingerprint (tests).
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` on store failure.
    pub async fn get_or_create_with(
        &self,
        branch: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Session> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        let existing =
            sessions::latest_for_key(&mut tx, branch, &fingerprint.as_key()).await?;
        if let Some(current) = existing {
            if can_reuse(
                &current,
                branch,
                fingerprint,
                Duration::hours(IDLE_WINDOW_HOURS),
                now,
            ) {
                sessions::touch(&mut tx, &current.id, now).await?;
                tx.commit()
                    .await
                    .map_err(|e| td_core::Error::database(e.to_string()))?;
                let mut refreshed = current;
                refreshed.last_activity = now;
                return Ok(refreshed);
            }
            // Stale: rotate, freezing the old row's last_activity.
            let next = current.rotate_into(branch, fingerprint);
            self.insert_journaled(&mut tx, &next, ActionKind::SessionStarted)
                .await?;
            tx.commit()
                .await
                .map_err(|e| td_core::Error::database(e.to_string()))?;
            return Ok(next);
        }

        let session = Session::create(branch, fingerprint);
        self.insert_journaled(&mut tx, &session, ActionKind::SessionCreated)
            .await?;
        tx.commit()
            .await
            .map_err(|e| td_core::Error::database(e.to_string()))?;
        Ok(session)
    }

    /// Force a rotation regardless of freshness (`td session new`).
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` on store failure.
    pub async fn rotate(&self, branch: &str) -> Result<Session> {
        let fingerprint = resolve_fingerprint();
        let mut tx = self.store.begin().await?;

        let previous =
            sessions::latest_for_key(&mut tx, branch, &fingerprint.as_key()).await?;
        let next = previous.as_ref().map_or_else(
            || Session::create(branch, &fingerprint),
            |p| p.rotate_into(branch, &fingerprint),
        );
        self.insert_journaled(&mut tx, &next, ActionKind::SessionCreated)
            .await?;
        tx.commit()
            .await
            .map_err(|e| td_core::Error::database(e.to_string()))?;
        Ok(next)
    }

    /// Delete sessions idle past the cleanup horizon. Historical action-log
    /// attribution keeps the defunct ids.
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` on store failure.
    pub async fn cleanup(&self, current_id: &str) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(CLEANUP_HORIZON_DAYS);
        let mut conn = self.store.acquire().await?;
        sessions::delete_stale(&mut conn, cutoff, current_id).await
    }

    async fn insert_journaled(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        session: &Session,
        action: ActionKind,
    ) -> Result<()> {
        sessions::insert(tx, session).await?;
        let data = serde_json::to_value(session)?;
        actionlog::append(
            tx,
            &session.id,
            action,
            &EntityKind::WorkSessions,
            &session.id,
            None,
            Some(&data),
            session.started_at,
        )
        .await?;
        Ok(())
    }
}

/// Fingerprint for this invocation: the `TD_SESSION_ID` override when set,
/// otherwise the parent process inspected via sysinfo.
#[must_use]
pub fn resolve_fingerprint() -> Fingerprint {
    if let Ok(id) = std::env::var(SESSION_ENV_OVERRIDE) {
        let id = id.trim();
        if !id.is_empty() {
            return Fingerprint::Override(id.to_string());
        }
    }
    parent_process_fingerprint().unwrap_or(Fingerprint::Process {
        agent: AgentKind::Unknown,
        pid: std::process::id(),
    })
}

fn parent_process_fingerprint() -> Option<Fingerprint> {
    use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};

    let system = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::new()),
    );
    let me = system.process(Pid::from_u32(std::process::id()))?;
    let parent_pid = me.parent()?;
    let parent = system.process(parent_pid)?;
    Some(Fingerprint::Process {
        agent: AgentKind::from_process_name(parent.name()),
        pid: parent_pid.as_u32(),
    })
}

#[cfg(test)]
mod tests {
    use serial_test::serial;
    use td_core::session::SESSION_ENV_OVERRIDE;

    use super::*;
    use crate::db::test_util::temp_store;

    fn fp(pid: u32) -> Fingerprint {
        Fingerprint::Process {
            agent: AgentKind::Claude,
            pid,
        }
    }

    #[test]
    fn test_first_call_creates_and_journals() {
        tokio_test::block_on(async {
            let (store, _dir) = temp_store().await;
            let manager = SessionManager::new(store.clone());

            let session = manager.get_or_create_with("main", &fp(1)).await.unwrap();
            assert!(session.is_new);

            let mut conn = store.acquire().await.unwrap();
            let pending = actionlog::pending_events(&mut conn, |_| true).await.unwrap();
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].action, ActionKind::SessionCreated);
            assert_eq!(pending[0].session_id, session.id);
        });
    }

    #[test]
    fn test_second_call_reuses() {
        tokio_test::block_on(async {
            let (store, _dir) = temp_store().await;
            let manager = SessionManager::new(store);

            let first = manager.get_or_create_with("main", &fp(1)).await.unwrap();
            let second = manager.get_or_create_with("main", &fp(1)).await.unwrap();
            assert_eq!(first.id, second.id);
            assert!(!second.is_new);
        });
    }

    #[test]
    fn test_branch_change_rotates() {
        tokio_test::block_on(async {
            let (store, _dir) = temp_store().await;
            let manager = SessionManager::new(store);

            let first = manager.get_or_create_with("main", &fp(1)).await.unwrap();
            let second = manager
                .get_or_create_with("feature/x", &fp(1))
                .await
                .unwrap();
            assert_ne!(first.id, second.id);
            assert!(second.is_new);
            // Different key, so the new row starts a fresh chain.
            assert!(second.previous_session_id.is_none());
        });
    }

    #[test]
    fn test_fingerprint_change_rotates() {
        tokio_test::block_on(async {
            let (store, _dir) = temp_store().await;
            let manager = SessionManager::new(store);

            let first = manager.get_or_create_with("main", &fp(1)).await.unwrap();
            let second = manager.get_or_create_with("main", &fp(2)).await.unwrap();
            assert_ne!(first.id, second.id);
        });
    }

    #[test]
    #[serial]
    fn test_forced_rotation_links_previous() {
        tokio_test::block_on(async {
            let (store, _dir) = temp_store().await;
            let manager = SessionManager::new(store);

            std::env::remove_var(SESSION_ENV_OVERRIDE);
            let first = manager.get_or_create_with("main", &fp(1)).await.unwrap();

            // rotate() resolves the live fingerprint, so pin it via env.
            std::env::set_var(SESSION_ENV_OVERRIDE, "pin");
            let pinned = manager.get_or_create("main").await.unwrap();
            let rotated = manager.rotate("main").await.unwrap();
            std::env::remove_var(SESSION_ENV_OVERRIDE);

            assert_ne!(rotated.id, pinned.id);
            assert_eq!(
                rotated.previous_session_id.as_deref(),
                Some(pinned.id.as_str())
            );
            assert_ne!(rotated.id, first.id);
        });
    }

    #[test]
    #[serial]
    fn test_env_override_fingerprint() {
        std::env::set_var(SESSION_ENV_OVERRIDE, "ci-worker-3");
        let fingerprint = resolve_fingerprint();
        std::env::remove_var(SESSION_ENV_OVERRIDE);
        assert_eq!(fingerprint, Fingerprint::Override("ci-worker-3".to_string()));
    }
}
