//! Deferred session management
//!
//! Sessions decouple allocation from activation: an orchestrator creates a
//! session and hands out its join token; the sandbox is provisioned only
//! when the token is first presented. The `ready -> provisioning` transition
//! is a store-level compare-and-set, which is what makes concurrent
//! activations produce exactly one sandbox.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::sandbox::CreateOptions;
use crate::domain::session::{self, Session, SessionStatus};
use crate::error::{Error, Result};
use crate::infra::sqlite::Repository;
use crate::service::catalog::TemplateCatalog;
use crate::service::sandbox::SandboxManager;

/// Parameters for creating a session
#[derive(Debug, Clone, Default)]
pub struct CreateSessionParams {
    pub template_id: String,
    pub ttl_seconds: i64,
    pub env: HashMap<String, String>,
    pub metadata: HashMap<String, String>,
    pub created_by: Option<String>,
}

pub struct SessionService {
    repository: Arc<Repository>,
    manager: Arc<dyn SandboxManager>,
    catalog: Arc<TemplateCatalog>,
}

impl SessionService {
    pub fn new(
        repository: Arc<Repository>,
        manager: Arc<dyn SandboxManager>,
        catalog: Arc<TemplateCatalog>,
    ) -> Self {
        Self {
            repository,
            manager,
            catalog,
        }
    }

    /// Create a session in `ready` with a fresh join token. The TTL does
    /// not start until activation.
    pub async fn create(&self, params: CreateSessionParams) -> Result<Session> {
        if self.catalog.get(&params.template_id).is_none() {
            return Err(Error::TemplateNotFound(params.template_id));
        }

        let session = Session {
            id: Uuid::new_v4().to_string(),
            token: session::generate_token()?,
            template_id: params.template_id,
            status: SessionStatus::Ready,
            status_message: None,
            env: params.env,
            metadata: params.metadata,
            ttl_seconds: params.ttl_seconds,
            sandbox_id: None,
            created_at: Utc::now(),
            activated_at: None,
            expires_at: None,
            created_by: params.created_by,
        };

        self.repository.create_session(&session).await?;

        info!(
            session_id = session.id,
            template = session.template_id,
            ttl_seconds = session.ttl_seconds,
            "session created"
        );

        Ok(session)
    }

    /// Activate a session by token; idempotent. Repeat calls observe the
    /// current state instead of provisioning a second sandbox.
    pub async fn activate(&self, token: &str) -> Result<Session> {
        let session = self.repository.get_session_by_token(token).await?;

        match session.status {
            SessionStatus::Active | SessionStatus::Provisioning => return Ok(session),
            status if status.is_terminal() => {
                return Err(Error::SessionNotReady(session.id));
            }
            _ => {}
        }

        let won = self
            .repository
            .transition_session(&session.id, SessionStatus::Ready, SessionStatus::Provisioning)
            .await?;
        if !won {
            // A concurrent activation claimed the transition; report
            // whatever state it has reached.
            return self.repository.get_session_by_token(token).await;
        }

        let mut session = session;
        session.status = SessionStatus::Provisioning;

        let opts = CreateOptions {
            ttl: Some(Duration::from_secs(session.ttl_seconds.max(0) as u64)),
            env: session.env.clone(),
            metadata: session.metadata.clone(),
        };

        match self
            .manager
            .create(&session.template_id, &session.id, opts)
            .await
        {
            Ok(sandbox) => {
                let now = Utc::now();
                session.sandbox_id = Some(sandbox.id.clone());
                session.activated_at = Some(now);
                session.expires_at = Some(now + chrono::Duration::seconds(session.ttl_seconds));
                session.status = SessionStatus::Active;
                self.repository.update_session(&session).await?;

                info!(
                    session_id = session.id,
                    sandbox_id = sandbox.id,
                    "session activated"
                );
                Ok(session)
            }
            Err(e) => {
                session.status = SessionStatus::Failed;
                session.status_message = Some(format!("sandbox creation failed: {e}"));
                if let Err(update_err) = self.repository.update_session(&session).await {
                    error!(
                        session_id = session.id,
                        error = %update_err,
                        "failed to persist session failure"
                    );
                }
                Err(e)
            }
        }
    }

    /// Delete a session; a bound sandbox is deleted first (best-effort).
    pub async fn delete(&self, id: &str) -> Result<()> {
        let session = self.repository.get_session(id).await?;

        if let Some(sandbox_id) = &session.sandbox_id {
            if let Err(e) = self.manager.delete(sandbox_id).await {
                warn!(session_id = id, sandbox_id, error = %e, "failed to delete session sandbox");
            }
        }

        self.repository.delete_session(id).await?;

        info!(session_id = id, "session deleted");
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Session> {
        self.repository.get_session(id).await
    }

    pub async fn get_by_token(&self, token: &str) -> Result<Session> {
        self.repository.get_session_by_token(token).await
    }

    pub async fn list(
        &self,
        status: Option<SessionStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Session>> {
        self.repository.list_sessions(status, limit, offset).await
    }

    pub async fn expired(&self) -> Result<Vec<Session>> {
        self.repository.expired_sessions().await
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

    use super::*;
    use crate::domain::sandbox::{ListFilters, Sandbox, SandboxStatus};
    use crate::domain::template::{Commands, Resources, Template};

    /// Manager stub: creates instantly, records calls, optionally fails.
    #[derive(Default)]
    struct StubManager {
        created: AtomicUsize,
        deleted: Mutex<Vec<String>>,
        fail_create: bool,
    }

    #[async_trait]
    impl SandboxManager for StubManager {
        async fn create(
            &self,
            template_id: &str,
            user_id: &str,
            _opts: CreateOptions,
        ) -> Result<Sandbox> {
            if self.fail_create {
                return Err(Error::Runtime("image pull refused".to_string()));
            }
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            let now = Utc::now();
            Ok(Sandbox {
                id: format!("stub{n:08x}"),
                template_id: template_id.to_string(),
                user_id: user_id.to_string(),
                status: SandboxStatus::Pending,
                status_message: None,
                container_id: String::new(),
                created_at: now,
                started_at: None,
                expires_at: now + chrono::Duration::hours(1),
                services: HashMap::new(),
                endpoints: HashMap::new(),
                metadata: HashMap::new(),
            })
        }

        async fn get(&self, id: &str) -> Result<Sandbox> {
            Err(Error::SandboxNotFound(id.to_string()))
        }

        async fn stop(&self, _id: &str) -> Result<()> {
            Ok(())
        }

        async fn delete(&self, id: &str) -> Result<()> {
            self.deleted.lock().expect("lock").push(id.to_string());
            Ok(())
        }

        async fn list(&self, _filters: &ListFilters) -> Result<Vec<Sandbox>> {
            Ok(Vec::new())
        }

        async fn extend_ttl(&self, _id: &str, _duration: Duration) -> Result<()> {
            Ok(())
        }

        async fn logs(&self, _id: &str, _tail: usize) -> Result<String> {
            Ok(String::new())
        }

        async fn expired(&self) -> Result<Vec<Sandbox>> {
            Ok(Vec::new())
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    async fn test_service(manager: Arc<StubManager>) -> SessionService {
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

        let catalog = TemplateCatalog::new();
        catalog.add(Template {
            name: "backend-python".to_string(),
            description: String::new(),
            base_image: "python:3.12-slim".to_string(),
            services: Vec::new(),
            resources: Resources::default(),
            env: HashMap::new(),
            ttl_seconds: 3600,
            expose: Vec::new(),
            volumes: Vec::new(),
            commands: Commands::default(),
            labels: HashMap::new(),
        });

        SessionService::new(
            Arc::new(Repository::new(pool)),
            manager,
            Arc::new(catalog),
        )
    }

    fn params() -> CreateSessionParams {
        CreateSessionParams {
            template_id: "backend-python".to_string(),
            ttl_seconds: 3600,
            env: HashMap::new(),
            metadata: HashMap::new(),
            created_by: Some("ci".to_string()),
        }
    }

    #[tokio::test]
    async fn create_starts_ready_without_deadline() {
        let service = test_service(Arc::new(StubManager::default())).await;

        let session = service.create(params()).await.expect("create");
        assert_eq!(session.status, SessionStatus::Ready);
        assert_eq!(session.token.len(), 48);
        assert!(session.activated_at.is_none());
        assert!(session.expires_at.is_none());
        assert!(session.sandbox_id.is_none());
        assert_eq!(session.created_by.as_deref(), Some("ci"));
    }

    #[tokio::test]
    async fn create_rejects_unknown_template() {
        let service = test_service(Arc::new(StubManager::default())).await;

        let result = service
            .create(CreateSessionParams {
                template_id: "nope".to_string(),
                ..params()
            })
            .await;
        assert!(matches!(result, Err(Error::TemplateNotFound(_))));
    }

    #[tokio::test]
    async fn activate_binds_one_sandbox_and_is_idempotent() {
        let manager = Arc::new(StubManager::default());
        let service = test_service(manager.clone()).await;

        let session = service.create(params()).await.expect("create");

        let first = service.activate(&session.token).await.expect("activate");
        assert_eq!(first.status, SessionStatus::Active);
        assert!(first.activated_at.is_some());
        assert!(first.expires_at.is_some());
        let sandbox_id = first.sandbox_id.clone().expect("sandbox bound");

        // Second activation observes, never re-provisions
        let second = service.activate(&session.token).await.expect("activate");
        assert_eq!(second.status, SessionStatus::Active);
        assert_eq!(second.sandbox_id.as_deref(), Some(sandbox_id.as_str()));
        assert_eq!(manager.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_activations_create_exactly_one_sandbox() {
        let manager = Arc::new(StubManager::default());
        let service = Arc::new(test_service(manager.clone()).await);

        let session = service.create(params()).await.expect("create");

        let a = {
            let service = service.clone();
            let token = session.token.clone();
            tokio::spawn(async move { service.activate(&token).await })
        };
        let b = {
            let service = service.clone();
            let token = session.token.clone();
            tokio::spawn(async move { service.activate(&token).await })
        };

        let a = a.await.expect("join").expect("activate");
        let b = b.await.expect("join").expect("activate");

        assert_eq!(manager.created.load(Ordering::SeqCst), 1);
        // At least one caller sees the bound sandbox; neither sees a second one
        for result in [&a, &b] {
            if let Some(id) = &result.sandbox_id {
                assert!(id.starts_with("stub"));
            }
        }

        let settled = service.get_by_token(&session.token).await.expect("get");
        assert_eq!(settled.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn failed_provisioning_marks_session_failed() {
        let manager = Arc::new(StubManager {
            fail_create: true,
            ..Default::default()
        });
        let service = test_service(manager).await;

        let session = service.create(params()).await.expect("create");
        let result = service.activate(&session.token).await;
        assert!(result.is_err());

        let failed = service.get_by_token(&session.token).await.expect("get");
        assert_eq!(failed.status, SessionStatus::Failed);
        assert!(failed
            .status_message
            .as_deref()
            .is_some_and(|m| m.contains("sandbox creation failed")));

        // Terminal sessions refuse further activation
        let again = service.activate(&session.token).await;
        assert!(matches!(again, Err(Error::SessionNotReady(_))));
    }

    #[tokio::test]
    async fn delete_cascades_into_bound_sandbox() {
        let manager = Arc::new(StubManager::default());
        let service = test_service(manager.clone()).await;

        let session = service.create(params()).await.expect("create");
        let active = service.activate(&session.token).await.expect("activate");
        let sandbox_id = active.sandbox_id.expect("sandbox bound");

        service.delete(&session.id).await.expect("delete");
        assert_eq!(
            manager.deleted.lock().expect("lock").as_slice(),
            &[sandbox_id]
        );

        let gone = service.get(&session.id).await;
        assert!(matches!(gone, Err(Error::SessionNotFound(_))));

        // Second delete reports not found
        let again = service.delete(&session.id).await;
        assert!(matches!(again, Err(Error::SessionNotFound(_))));
    }
}
