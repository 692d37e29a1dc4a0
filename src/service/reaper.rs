//! TTL enforcement
//!
//! Periodically deletes expired sandboxes and sessions. Sessions cascade
//! into their sandbox on deletion, and the sandbox sweep also catches
//! session sandboxes directly, so either path alone converges.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use crate::service::sandbox::SandboxManager;
use crate::service::session::SessionService;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);
const MIN_INTERVAL: Duration = Duration::from_secs(60);

pub struct Reaper {
    manager: Arc<dyn SandboxManager>,
    sessions: Arc<SessionService>,
    interval: Duration,
}

impl Reaper {
    pub fn new(
        manager: Arc<dyn SandboxManager>,
        sessions: Arc<SessionService>,
        interval: Duration,
    ) -> Self {
        Self {
            manager,
            sessions,
            interval: Self::effective_interval(interval),
        }
    }

    fn effective_interval(interval: Duration) -> Duration {
        if interval.is_zero() {
            DEFAULT_INTERVAL
        } else {
            interval.max(MIN_INTERVAL)
        }
    }

    /// Run until the shutdown channel fires. The first sweep happens
    /// immediately on start.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "reaper started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep().await,
                _ = shutdown.changed() => {
                    info!("reaper stopped");
                    return;
                }
            }
        }
    }

    /// One sweep over both entity kinds; failures are logged and the
    /// iteration continues.
    pub async fn sweep(&self) {
        match self.manager.expired().await {
            Ok(sandboxes) => {
                for sandbox in sandboxes {
                    info!(
                        sandbox_id = sandbox.id,
                        user = sandbox.user_id,
                        expired_at = %sandbox.expires_at,
                        "deleting expired sandbox"
                    );
                    if let Err(e) = self.manager.delete(&sandbox.id).await {
                        error!(sandbox_id = sandbox.id, error = %e, "failed to delete expired sandbox");
                    }
                }
            }
            Err(e) => error!(error = %e, "failed to list expired sandboxes"),
        }

        match self.sessions.expired().await {
            Ok(sessions) => {
                for session in sessions {
                    info!(session_id = session.id, "deleting expired session");
                    if let Err(e) = self.sessions.delete(&session.id).await {
                        error!(session_id = session.id, error = %e, "failed to delete expired session");
                    }
                }
            }
            Err(e) => error!(error = %e, "failed to list expired sessions"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::str::FromStr;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

    use super::*;
    use crate::domain::sandbox::{CreateOptions, ListFilters, Sandbox, SandboxStatus};
    use crate::domain::session::{Session, SessionStatus};
    use crate::error::{Error, Result};
    use crate::infra::sqlite::Repository;
    use crate::service::catalog::TemplateCatalog;

    /// Manager stub whose `expired` hands out canned sandboxes and whose
    /// `delete` records calls, failing on demand.
    #[derive(Default)]
    struct SweepManager {
        expired: Mutex<Vec<Sandbox>>,
        deleted: Mutex<Vec<String>>,
        fail_delete_for: Option<String>,
    }

    fn expired_sandbox(id: &str) -> Sandbox {
        let now = Utc::now();
        Sandbox {
            id: id.to_string(),
            template_id: "t".to_string(),
            user_id: "u".to_string(),
            status: SandboxStatus::Running,
            status_message: None,
            container_id: String::new(),
            created_at: now - chrono::Duration::hours(2),
            started_at: None,
            expires_at: now - chrono::Duration::hours(1),
            services: HashMap::new(),
            endpoints: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    #[async_trait]
    impl SandboxManager for SweepManager {
        async fn create(&self, _: &str, _: &str, _: CreateOptions) -> Result<Sandbox> {
            unreachable!("reaper never creates")
        }

        async fn get(&self, id: &str) -> Result<Sandbox> {
            Err(Error::SandboxNotFound(id.to_string()))
        }

        async fn stop(&self, _: &str) -> Result<()> {
            Ok(())
        }

        async fn delete(&self, id: &str) -> Result<()> {
            if self.fail_delete_for.as_deref() == Some(id) {
                return Err(Error::Runtime("daemon unreachable".to_string()));
            }
            self.deleted.lock().expect("lock").push(id.to_string());
            Ok(())
        }

        async fn list(&self, _: &ListFilters) -> Result<Vec<Sandbox>> {
            Ok(Vec::new())
        }

        async fn extend_ttl(&self, _: &str, _: Duration) -> Result<()> {
            Ok(())
        }

        async fn logs(&self, _: &str, _: usize) -> Result<String> {
            Ok(String::new())
        }

        async fn expired(&self) -> Result<Vec<Sandbox>> {
            Ok(self.expired.lock().expect("lock").clone())
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    async fn test_repo() -> Arc<Repository> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .expect("options")
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .expect("pool");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("migrations");
        Arc::new(Repository::new(pool))
    }

    #[tokio::test]
    async fn sweep_deletes_expired_sandboxes_and_sessions() {
        let manager = Arc::new(SweepManager::default());
        manager
            .expired
            .lock()
            .expect("lock")
            .push(expired_sandbox("aaaaaaaaaaaa"));

        let repository = test_repo().await;
        let now = Utc::now();
        let session = Session {
            id: "expired-session".to_string(),
            token: "tok".to_string(),
            template_id: "t".to_string(),
            status: SessionStatus::Active,
            status_message: None,
            env: HashMap::new(),
            metadata: HashMap::new(),
            ttl_seconds: 60,
            sandbox_id: Some("bbbbbbbbbbbb".to_string()),
            created_at: now - chrono::Duration::hours(2),
            activated_at: Some(now - chrono::Duration::hours(2)),
            expires_at: Some(now - chrono::Duration::hours(1)),
            created_by: None,
        };
        repository.create_session(&session).await.expect("seed session");

        let sessions = Arc::new(SessionService::new(
            repository.clone(),
            manager.clone(),
            Arc::new(TemplateCatalog::new()),
        ));

        let reaper = Reaper::new(manager.clone(), sessions, Duration::from_secs(60));
        reaper.sweep().await;

        // The expired sandbox and the session's sandbox are both deleted
        let deleted = manager.deleted.lock().expect("lock").clone();
        assert!(deleted.contains(&"aaaaaaaaaaaa".to_string()));
        assert!(deleted.contains(&"bbbbbbbbbbbb".to_string()));

        // The session row is gone
        let gone = repository.get_session("expired-session").await;
        assert!(matches!(gone, Err(Error::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn sweep_continues_past_individual_failures() {
        let manager = Arc::new(SweepManager {
            fail_delete_for: Some("aaaaaaaaaaaa".to_string()),
            ..Default::default()
        });
        {
            let mut expired = manager.expired.lock().expect("lock");
            expired.push(expired_sandbox("aaaaaaaaaaaa"));
            expired.push(expired_sandbox("cccccccccccc"));
        }

        let repository = test_repo().await;
        let sessions = Arc::new(SessionService::new(
            repository,
            manager.clone(),
            Arc::new(TemplateCatalog::new()),
        ));

        let reaper = Reaper::new(manager.clone(), sessions, Duration::from_secs(60));
        reaper.sweep().await;

        let deleted = manager.deleted.lock().expect("lock").clone();
        assert_eq!(deleted, vec!["cccccccccccc".to_string()]);
    }

    #[test]
    fn zero_interval_falls_back_to_default() {
        // Constructor-only check; the running loop is exercised operationally
        assert_eq!(Reaper::effective_interval(Duration::ZERO), DEFAULT_INTERVAL);
        assert_eq!(
            Reaper::effective_interval(Duration::from_secs(5)),
            MIN_INTERVAL
        );
        assert_eq!(
            Reaper::effective_interval(Duration::from_secs(600)),
            Duration::from_secs(600)
        );
    }
}
