//! SQLite persistence layer
//!
//! The store is the single source of truth for sandboxes, services,
//! sessions, and API clients. Components read freshly and persist every
//! transition; no state is cached in process.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};

use crate::domain::client::ApiClient;
use crate::domain::sandbox::{
    ListFilters, Sandbox, SandboxStatus, ServiceCredentials, ServiceInstance,
};
use crate::domain::session::{Session, SessionStatus};
use crate::error::{Error, Result};

const DEFAULT_PAGE_SIZE: i64 = 50;

/// Timestamps are stored as fixed-precision RFC 3339 text so the expiry
/// predicates can compare lexicographically in SQL.
fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::Database(format!("invalid timestamp {s:?}: {e}")))
}

fn parse_opt_ts(s: &Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(|v| parse_ts(v)).transpose()
}

fn parse_json<T: serde::de::DeserializeOwned + Default>(s: &str) -> Result<T> {
    if s.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(s).map_err(|e| Error::Database(format!("invalid JSON column: {e}")))
}

/// Database row for sandbox
#[derive(Debug, FromRow)]
struct SandboxRow {
    id: String,
    template_id: String,
    user_id: String,
    status: String,
    status_message: Option<String>,
    container_id: Option<String>,
    created_at: String,
    started_at: Option<String>,
    expires_at: String,
    metadata: String,
    endpoints: String,
}

impl TryFrom<SandboxRow> for Sandbox {
    type Error = Error;

    fn try_from(row: SandboxRow) -> Result<Self> {
        let status = SandboxStatus::parse(&row.status)
            .ok_or_else(|| Error::Database(format!("invalid sandbox status: {}", row.status)))?;

        Ok(Sandbox {
            id: row.id,
            template_id: row.template_id,
            user_id: row.user_id,
            status,
            status_message: row.status_message,
            container_id: row.container_id.unwrap_or_default(),
            created_at: parse_ts(&row.created_at)?,
            started_at: parse_opt_ts(&row.started_at)?,
            expires_at: parse_ts(&row.expires_at)?,
            services: HashMap::new(),
            endpoints: parse_json(&row.endpoints)?,
            metadata: parse_json(&row.metadata)?,
        })
    }
}

/// Database row for service instance
#[derive(Debug, FromRow)]
struct ServiceRow {
    service_name: String,
    service_type: String,
    status: String,
    credentials: Option<String>,
    created_at: String,
}

impl TryFrom<ServiceRow> for ServiceInstance {
    type Error = Error;

    fn try_from(row: ServiceRow) -> Result<Self> {
        let credentials: Option<ServiceCredentials> = row
            .credentials
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| Error::Database(format!("invalid credentials column: {e}")))?;

        Ok(ServiceInstance {
            name: row.service_name,
            service_type: row.service_type,
            status: row.status,
            credentials,
            created_at: parse_ts(&row.created_at)?,
        })
    }
}

/// Database row for session
#[derive(Debug, FromRow)]
struct SessionRow {
    id: String,
    token: String,
    template_id: String,
    status: String,
    status_message: Option<String>,
    env: String,
    metadata: String,
    ttl_seconds: i64,
    sandbox_id: Option<String>,
    created_at: String,
    activated_at: Option<String>,
    expires_at: Option<String>,
    created_by: Option<String>,
}

impl TryFrom<SessionRow> for Session {
    type Error = Error;

    fn try_from(row: SessionRow) -> Result<Self> {
        let status = SessionStatus::parse(&row.status)
            .ok_or_else(|| Error::Database(format!("invalid session status: {}", row.status)))?;

        Ok(Session {
            id: row.id,
            token: row.token,
            template_id: row.template_id,
            status,
            status_message: row.status_message,
            env: parse_json(&row.env)?,
            metadata: parse_json(&row.metadata)?,
            ttl_seconds: row.ttl_seconds,
            sandbox_id: row.sandbox_id,
            created_at: parse_ts(&row.created_at)?,
            activated_at: parse_opt_ts(&row.activated_at)?,
            expires_at: parse_opt_ts(&row.expires_at)?,
            created_by: row.created_by,
        })
    }
}

/// Database row for API client
#[derive(Debug, FromRow)]
struct ClientRow {
    id: i64,
    name: String,
    api_key: String,
    is_active: bool,
    created_at: String,
    last_used_at: Option<String>,
    permissions: String,
    metadata: String,
}

impl TryFrom<ClientRow> for ApiClient {
    type Error = Error;

    fn try_from(row: ClientRow) -> Result<Self> {
        Ok(ApiClient {
            id: row.id,
            name: row.name,
            api_key: row.api_key,
            is_active: row.is_active,
            created_at: parse_ts(&row.created_at)?,
            last_used_at: parse_opt_ts(&row.last_used_at)?,
            permissions: parse_json(&row.permissions)?,
            metadata: parse_json(&row.metadata)?,
        })
    }
}

const SANDBOX_COLUMNS: &str = "id, template_id, user_id, status, status_message, container_id, created_at, started_at, expires_at, metadata, endpoints";
const SESSION_COLUMNS: &str = "id, token, template_id, status, status_message, env, metadata, ttl_seconds, sandbox_id, created_at, activated_at, expires_at, created_by";

/// Repository for all persistent state
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Create a new repository with the given pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the database connection pool and run migrations
    pub async fn init(database_dsn: &str) -> anyhow::Result<SqlitePool> {
        // Ensure parent directory exists for file-backed databases
        if let Some(path) = database_dsn.strip_prefix("sqlite:") {
            if let Some(path) = path.split('?').next() {
                if path != ":memory:" {
                    if let Some(parent) = std::path::Path::new(path).parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_dsn)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(pool)
    }

    /// Check database connectivity
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Close the connection pool
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // --- Sandboxes ---

    /// Insert a new sandbox row
    pub async fn create_sandbox(&self, sb: &Sandbox) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sandboxes (id, template_id, user_id, status, status_message, container_id, created_at, started_at, expires_at, metadata, endpoints)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&sb.id)
        .bind(&sb.template_id)
        .bind(&sb.user_id)
        .bind(sb.status.as_str())
        .bind(&sb.status_message)
        .bind((!sb.container_id.is_empty()).then_some(&sb.container_id))
        .bind(fmt_ts(&sb.created_at))
        .bind(sb.started_at.as_ref().map(fmt_ts))
        .bind(fmt_ts(&sb.expires_at))
        .bind(serde_json::to_string(&sb.metadata)?)
        .bind(serde_json::to_string(&sb.endpoints)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a sandbox by ID, services eagerly attached
    pub async fn get_sandbox(&self, id: &str) -> Result<Sandbox> {
        let row: SandboxRow = sqlx::query_as(&format!(
            "SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::SandboxNotFound(id.to_string()))?;

        let mut sandbox: Sandbox = row.try_into()?;
        sandbox.services = self.service_map(&sandbox.id).await?;
        Ok(sandbox)
    }

    /// Update a sandbox row (all mutable columns)
    pub async fn update_sandbox(&self, sb: &Sandbox) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sandboxes
            SET status = ?, status_message = ?, container_id = ?, started_at = ?, expires_at = ?, metadata = ?, endpoints = ?
            WHERE id = ?
            "#,
        )
        .bind(sb.status.as_str())
        .bind(&sb.status_message)
        .bind((!sb.container_id.is_empty()).then_some(&sb.container_id))
        .bind(sb.started_at.as_ref().map(fmt_ts))
        .bind(fmt_ts(&sb.expires_at))
        .bind(serde_json::to_string(&sb.metadata)?)
        .bind(serde_json::to_string(&sb.endpoints)?)
        .bind(&sb.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::SandboxNotFound(sb.id.clone()));
        }

        Ok(())
    }

    /// Delete a sandbox row; service rows cascade
    pub async fn delete_sandbox(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM sandboxes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::SandboxNotFound(id.to_string()));
        }

        Ok(())
    }

    /// List sandboxes matching filters, newest first
    pub async fn list_sandboxes(&self, filters: &ListFilters) -> Result<Vec<Sandbox>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE 1=1"
        ));

        if let Some(user_id) = &filters.user_id {
            qb.push(" AND user_id = ").push_bind(user_id);
        }
        if let Some(template_id) = &filters.template_id {
            qb.push(" AND template_id = ").push_bind(template_id);
        }
        if let Some(status) = filters.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }

        qb.push(" ORDER BY created_at DESC");

        let limit = if filters.limit > 0 {
            filters.limit
        } else {
            DEFAULT_PAGE_SIZE
        };
        qb.push(" LIMIT ").push_bind(limit);
        if filters.offset > 0 {
            qb.push(" OFFSET ").push_bind(filters.offset);
        }

        let rows: Vec<SandboxRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        self.attach_services(rows).await
    }

    /// Non-terminal sandboxes whose TTL has elapsed
    pub async fn expired_sandboxes(&self) -> Result<Vec<Sandbox>> {
        let rows: Vec<SandboxRow> = sqlx::query_as(&format!(
            r#"
            SELECT {SANDBOX_COLUMNS} FROM sandboxes
            WHERE status NOT IN ('stopped', 'failed', 'expired')
              AND expires_at < ?
            ORDER BY expires_at ASC
            "#
        ))
        .bind(fmt_ts(&Utc::now()))
        .fetch_all(&self.pool)
        .await?;

        self.attach_services(rows).await
    }

    async fn attach_services(&self, rows: Vec<SandboxRow>) -> Result<Vec<Sandbox>> {
        let mut sandboxes = Vec::with_capacity(rows.len());
        for row in rows {
            let mut sandbox: Sandbox = row.try_into()?;
            sandbox.services = self.service_map(&sandbox.id).await?;
            sandboxes.push(sandbox);
        }
        Ok(sandboxes)
    }

    async fn service_map(&self, sandbox_id: &str) -> Result<HashMap<String, ServiceInstance>> {
        Ok(self
            .services(sandbox_id)
            .await?
            .into_iter()
            .map(|svc| (svc.name.clone(), svc))
            .collect())
    }

    // --- Services ---

    /// Insert or update a service instance for a sandbox
    pub async fn upsert_service(&self, sandbox_id: &str, svc: &ServiceInstance) -> Result<()> {
        let credentials = svc
            .credentials
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO sandbox_services (sandbox_id, service_name, service_type, status, credentials, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (sandbox_id, service_name) DO UPDATE
            SET status = excluded.status, credentials = excluded.credentials
            "#,
        )
        .bind(sandbox_id)
        .bind(&svc.name)
        .bind(&svc.service_type)
        .bind(&svc.status)
        .bind(credentials)
        .bind(fmt_ts(&svc.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// All service instances of a sandbox
    pub async fn services(&self, sandbox_id: &str) -> Result<Vec<ServiceInstance>> {
        let rows: Vec<ServiceRow> = sqlx::query_as(
            r#"
            SELECT service_name, service_type, status, credentials, created_at
            FROM sandbox_services
            WHERE sandbox_id = ?
            "#,
        )
        .bind(sandbox_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|row| row.try_into()).collect()
    }

    /// Update a service instance's status and credentials
    pub async fn update_service(&self, sandbox_id: &str, svc: &ServiceInstance) -> Result<()> {
        let credentials = svc
            .credentials
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE sandbox_services
            SET status = ?, credentials = ?
            WHERE sandbox_id = ? AND service_name = ?
            "#,
        )
        .bind(&svc.status)
        .bind(credentials)
        .bind(sandbox_id)
        .bind(&svc.name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::Database(format!(
                "service not found: {sandbox_id}/{}",
                svc.name
            )));
        }

        Ok(())
    }

    /// Remove all service rows of a sandbox
    pub async fn delete_services(&self, sandbox_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sandbox_services WHERE sandbox_id = ?")
            .bind(sandbox_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // --- Sessions ---

    /// Insert a new session row
    pub async fn create_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (id, token, template_id, status, status_message, env, metadata, ttl_seconds, sandbox_id, created_at, activated_at, expires_at, created_by)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.token)
        .bind(&session.template_id)
        .bind(session.status.as_str())
        .bind(&session.status_message)
        .bind(serde_json::to_string(&session.env)?)
        .bind(serde_json::to_string(&session.metadata)?)
        .bind(session.ttl_seconds)
        .bind(&session.sandbox_id)
        .bind(fmt_ts(&session.created_at))
        .bind(session.activated_at.as_ref().map(fmt_ts))
        .bind(session.expires_at.as_ref().map(fmt_ts))
        .bind(&session.created_by)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a session by ID
    pub async fn get_session(&self, id: &str) -> Result<Session> {
        self.session_by_column("id", id).await
    }

    /// Get a session by its join token
    pub async fn get_session_by_token(&self, token: &str) -> Result<Session> {
        self.session_by_column("token", token).await
    }

    async fn session_by_column(&self, column: &str, value: &str) -> Result<Session> {
        let row: SessionRow = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE {column} = ?"
        ))
        .bind(value)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::SessionNotFound(value.to_string()))?;

        row.try_into()
    }

    /// Update a session row
    pub async fn update_session(&self, session: &Session) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET status = ?, status_message = ?, sandbox_id = ?, activated_at = ?, expires_at = ?, env = ?, metadata = ?
            WHERE id = ?
            "#,
        )
        .bind(session.status.as_str())
        .bind(&session.status_message)
        .bind(&session.sandbox_id)
        .bind(session.activated_at.as_ref().map(fmt_ts))
        .bind(session.expires_at.as_ref().map(fmt_ts))
        .bind(serde_json::to_string(&session.env)?)
        .bind(serde_json::to_string(&session.metadata)?)
        .bind(&session.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::SessionNotFound(session.id.clone()));
        }

        Ok(())
    }

    /// Compare-and-set on the status column. Returns false when the row is
    /// no longer in `from`; the uniqueness of this transition is what makes
    /// concurrent activations idempotent.
    pub async fn transition_session(
        &self,
        id: &str,
        from: SessionStatus,
        to: SessionStatus,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE sessions SET status = ? WHERE id = ? AND status = ?")
            .bind(to.as_str())
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a session row
    pub async fn delete_session(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::SessionNotFound(id.to_string()));
        }

        Ok(())
    }

    /// List sessions, newest first, optional status filter
    pub async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Session>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE 1=1"
        ));

        if let Some(status) = status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }

        qb.push(" ORDER BY created_at DESC");

        let limit = if limit > 0 { limit } else { DEFAULT_PAGE_SIZE };
        qb.push(" LIMIT ").push_bind(limit);
        if offset > 0 {
            qb.push(" OFFSET ").push_bind(offset);
        }

        let rows: Vec<SessionRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(|row| row.try_into()).collect()
    }

    /// Active sessions whose TTL has elapsed
    pub async fn expired_sessions(&self) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {SESSION_COLUMNS} FROM sessions
            WHERE status = 'active'
              AND expires_at < ?
            ORDER BY expires_at ASC
            "#
        ))
        .bind(fmt_ts(&Utc::now()))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|row| row.try_into()).collect()
    }

    // --- API clients ---

    /// Look up a client by API key. `None` means unknown key, distinct
    /// from an I/O failure.
    pub async fn client_by_api_key(&self, api_key: &str) -> Result<Option<ApiClient>> {
        let row: Option<ClientRow> = sqlx::query_as(
            r#"
            SELECT id, name, api_key, is_active, created_at, last_used_at, permissions, metadata
            FROM api_clients
            WHERE api_key = ?
            "#,
        )
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.try_into()).transpose()
    }

    /// Record a client's last use
    pub async fn touch_client_last_used(&self, api_key: &str) -> Result<()> {
        sqlx::query("UPDATE api_clients SET last_used_at = ? WHERE api_key = ?")
            .bind(fmt_ts(&Utc::now()))
            .bind(api_key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    async fn create_test_repo() -> Repository {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .expect("options")
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .expect("failed to create test pool");

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("failed to run migrations");

        Repository::new(pool)
    }

    fn sample_sandbox(id: &str) -> Sandbox {
        let now = Utc::now();
        Sandbox {
            id: id.to_string(),
            template_id: "backend-python".to_string(),
            user_id: "u1".to_string(),
            status: SandboxStatus::Pending,
            status_message: None,
            container_id: String::new(),
            created_at: now,
            started_at: None,
            expires_at: now + Duration::hours(1),
            services: HashMap::new(),
            endpoints: HashMap::new(),
            metadata: HashMap::from([("team".to_string(), "core".to_string())]),
        }
    }

    fn sample_session(id: &str, token: &str) -> Session {
        Session {
            id: id.to_string(),
            token: token.to_string(),
            template_id: "backend-python".to_string(),
            status: SessionStatus::Ready,
            status_message: None,
            env: HashMap::new(),
            metadata: HashMap::new(),
            ttl_seconds: 3600,
            sandbox_id: None,
            created_at: Utc::now(),
            activated_at: None,
            expires_at: None,
            created_by: Some("ci".to_string()),
        }
    }

    #[tokio::test]
    async fn create_and_get_sandbox() {
        let repo = create_test_repo().await;

        let sandbox = sample_sandbox("a1b2c3d4e5f6");
        repo.create_sandbox(&sandbox).await.expect("create");

        let fetched = repo.get_sandbox("a1b2c3d4e5f6").await.expect("get");
        assert_eq!(fetched.id, sandbox.id);
        assert_eq!(fetched.status, SandboxStatus::Pending);
        assert_eq!(fetched.metadata.get("team").map(String::as_str), Some("core"));
        assert!(fetched.services.is_empty());
        assert!(fetched.container_id.is_empty());
    }

    #[tokio::test]
    async fn get_missing_sandbox_is_not_found() {
        let repo = create_test_repo().await;
        let result = repo.get_sandbox("missing000000").await;
        assert!(matches!(result, Err(Error::SandboxNotFound(_))));
    }

    #[tokio::test]
    async fn update_sandbox_status_and_container() {
        let repo = create_test_repo().await;

        let mut sandbox = sample_sandbox("0123456789ab");
        repo.create_sandbox(&sandbox).await.expect("create");

        sandbox.status = SandboxStatus::Running;
        sandbox.container_id = "deadbeef".to_string();
        sandbox.started_at = Some(Utc::now());
        sandbox
            .endpoints
            .insert("http".to_string(), "http://0123456789ab.sandbox.local".to_string());
        repo.update_sandbox(&sandbox).await.expect("update");

        let fetched = repo.get_sandbox("0123456789ab").await.expect("get");
        assert_eq!(fetched.status, SandboxStatus::Running);
        assert_eq!(fetched.container_id, "deadbeef");
        assert!(fetched.started_at.is_some());
        assert_eq!(fetched.endpoints.len(), 1);
    }

    #[tokio::test]
    async fn services_upsert_join_and_cascade() {
        let repo = create_test_repo().await;

        let sandbox = sample_sandbox("cafebabe0001");
        repo.create_sandbox(&sandbox).await.expect("create");

        let svc = ServiceInstance {
            name: "postgres".to_string(),
            service_type: "postgres".to_string(),
            status: "ready".to_string(),
            credentials: Some(ServiceCredentials {
                host: "localhost".to_string(),
                port: 5432,
                username: "sandbox_user_cafebabe0001".to_string(),
                password: "0123456789abcdef".to_string(),
                database: "sandbox_cafebabe0001".to_string(),
                ..Default::default()
            }),
            created_at: Utc::now(),
        };
        repo.upsert_service("cafebabe0001", &svc).await.expect("upsert");

        // Upsert on the same (sandbox, name) updates rather than duplicates
        let mut updated = svc.clone();
        updated.status = "degraded".to_string();
        repo.upsert_service("cafebabe0001", &updated)
            .await
            .expect("upsert again");

        let fetched = repo.get_sandbox("cafebabe0001").await.expect("get");
        assert_eq!(fetched.services.len(), 1);
        let joined = &fetched.services["postgres"];
        assert_eq!(joined.status, "degraded");
        let creds = joined.credentials.as_ref().expect("credentials");
        assert_eq!(creds.database, "sandbox_cafebabe0001");
        assert_eq!(creds.password.len(), 16);

        // Deleting the sandbox cascades into its service rows
        repo.delete_sandbox("cafebabe0001").await.expect("delete");
        let services = repo.services("cafebabe0001").await.expect("services");
        assert!(services.is_empty());
    }

    #[tokio::test]
    async fn update_and_bulk_delete_services() {
        let repo = create_test_repo().await;

        let sandbox = sample_sandbox("0a0b0c0d0e0f");
        repo.create_sandbox(&sandbox).await.expect("create");

        let mut svc = ServiceInstance {
            name: "redis".to_string(),
            service_type: "redis".to_string(),
            status: "ready".to_string(),
            credentials: None,
            created_at: Utc::now(),
        };
        repo.upsert_service("0a0b0c0d0e0f", &svc).await.expect("upsert");

        svc.status = "gone".to_string();
        svc.credentials = Some(ServiceCredentials {
            host: "cache.internal".to_string(),
            port: 6379,
            prefix: "sandbox:0a0b0c0d0e0f:".to_string(),
            ..Default::default()
        });
        repo.update_service("0a0b0c0d0e0f", &svc).await.expect("update");

        let services = repo.services("0a0b0c0d0e0f").await.expect("services");
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].status, "gone");
        assert_eq!(
            services[0].credentials.as_ref().expect("credentials").prefix,
            "sandbox:0a0b0c0d0e0f:"
        );

        // Updating an absent service is an error
        let missing = ServiceInstance {
            name: "mongo".to_string(),
            ..svc.clone()
        };
        assert!(repo.update_service("0a0b0c0d0e0f", &missing).await.is_err());

        repo.delete_services("0a0b0c0d0e0f").await.expect("delete all");
        let services = repo.services("0a0b0c0d0e0f").await.expect("services");
        assert!(services.is_empty());
    }

    #[tokio::test]
    async fn delete_twice_is_not_found() {
        let repo = create_test_repo().await;

        let sandbox = sample_sandbox("feedface0002");
        repo.create_sandbox(&sandbox).await.expect("create");

        repo.delete_sandbox("feedface0002").await.expect("first delete");
        let result = repo.delete_sandbox("feedface0002").await;
        assert!(matches!(result, Err(Error::SandboxNotFound(_))));
    }

    #[tokio::test]
    async fn list_filters_and_pagination() {
        let repo = create_test_repo().await;

        for (id, user) in [("aaaaaaaaaaa1", "u1"), ("aaaaaaaaaaa2", "u1"), ("aaaaaaaaaaa3", "u2")] {
            let mut sandbox = sample_sandbox(id);
            sandbox.user_id = user.to_string();
            repo.create_sandbox(&sandbox).await.expect("create");
        }

        let all = repo
            .list_sandboxes(&ListFilters::default())
            .await
            .expect("list");
        assert_eq!(all.len(), 3);

        let u1 = repo
            .list_sandboxes(&ListFilters {
                user_id: Some("u1".to_string()),
                ..Default::default()
            })
            .await
            .expect("list");
        assert_eq!(u1.len(), 2);

        let paged = repo
            .list_sandboxes(&ListFilters {
                limit: 2,
                offset: 2,
                ..Default::default()
            })
            .await
            .expect("list");
        assert_eq!(paged.len(), 1);

        // Offset past the end yields an empty page
        let beyond = repo
            .list_sandboxes(&ListFilters {
                limit: 10,
                offset: 10,
                ..Default::default()
            })
            .await
            .expect("list");
        assert!(beyond.is_empty());

        let none = repo
            .list_sandboxes(&ListFilters {
                status: Some(SandboxStatus::Running),
                ..Default::default()
            })
            .await
            .expect("list");
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn expired_sandboxes_excludes_terminal_and_future() {
        let repo = create_test_repo().await;

        let mut expired = sample_sandbox("bbbbbbbbbbb1");
        expired.status = SandboxStatus::Running;
        expired.expires_at = Utc::now() - Duration::minutes(5);
        repo.create_sandbox(&expired).await.expect("create");

        let mut stopped = sample_sandbox("bbbbbbbbbbb2");
        stopped.status = SandboxStatus::Stopped;
        stopped.expires_at = Utc::now() - Duration::minutes(5);
        repo.create_sandbox(&stopped).await.expect("create");

        let fresh = sample_sandbox("bbbbbbbbbbb3");
        repo.create_sandbox(&fresh).await.expect("create");

        let result = repo.expired_sandboxes().await.expect("expired");
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id, "bbbbbbbbbbb1");
    }

    #[tokio::test]
    async fn session_round_trip_and_token_lookup() {
        let repo = create_test_repo().await;

        let session = sample_session(
            "11111111-2222-3333-4444-555555555555",
            "aaaabbbbccccddddeeeeffff0000111122223333444455",
        );
        repo.create_session(&session).await.expect("create");

        let by_token = repo
            .get_session_by_token(&session.token)
            .await
            .expect("get by token");
        assert_eq!(by_token.id, session.id);
        assert_eq!(by_token.status, SessionStatus::Ready);
        assert_eq!(by_token.ttl_seconds, 3600);
        assert_eq!(by_token.created_by.as_deref(), Some("ci"));

        let missing = repo.get_session_by_token("nope").await;
        assert!(matches!(missing, Err(Error::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn session_transition_is_a_one_shot_cas() {
        let repo = create_test_repo().await;

        let session = sample_session("cas-session", "cas-token");
        repo.create_session(&session).await.expect("create");

        let won = repo
            .transition_session("cas-session", SessionStatus::Ready, SessionStatus::Provisioning)
            .await
            .expect("transition");
        assert!(won);

        // Second CAS from `ready` loses: the row already moved on
        let lost = repo
            .transition_session("cas-session", SessionStatus::Ready, SessionStatus::Provisioning)
            .await
            .expect("transition");
        assert!(!lost);

        let fetched = repo.get_session("cas-session").await.expect("get");
        assert_eq!(fetched.status, SessionStatus::Provisioning);
    }

    #[tokio::test]
    async fn expired_sessions_only_active_past_deadline() {
        let repo = create_test_repo().await;

        let mut active_expired = sample_session("s1", "t1");
        active_expired.status = SessionStatus::Active;
        active_expired.activated_at = Some(Utc::now() - Duration::hours(2));
        active_expired.expires_at = Some(Utc::now() - Duration::hours(1));
        repo.create_session(&active_expired).await.expect("create");

        let mut active_fresh = sample_session("s2", "t2");
        active_fresh.status = SessionStatus::Active;
        active_fresh.expires_at = Some(Utc::now() + Duration::hours(1));
        repo.create_session(&active_fresh).await.expect("create");

        // Ready sessions have no deadline and never expire
        let ready = sample_session("s3", "t3");
        repo.create_session(&ready).await.expect("create");

        let expired = repo.expired_sessions().await.expect("expired");
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "s1");
    }

    #[tokio::test]
    async fn list_sessions_by_status() {
        let repo = create_test_repo().await;

        repo.create_session(&sample_session("l1", "lt1")).await.expect("create");
        let mut failed = sample_session("l2", "lt2");
        failed.status = SessionStatus::Failed;
        repo.create_session(&failed).await.expect("create");

        let ready = repo
            .list_sessions(Some(SessionStatus::Ready), 0, 0)
            .await
            .expect("list");
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "l1");

        let all = repo.list_sessions(None, 0, 0).await.expect("list");
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn client_lookup_and_touch() {
        let repo = create_test_repo().await;

        sqlx::query(
            r#"
            INSERT INTO api_clients (name, api_key, is_active, created_at, permissions)
            VALUES ('ci', 'sk_live_abc123', 1, ?, '["sandboxes:*"]')
            "#,
        )
        .bind(fmt_ts(&Utc::now()))
        .execute(&repo.pool)
        .await
        .expect("seed client");

        let client = repo
            .client_by_api_key("sk_live_abc123")
            .await
            .expect("lookup")
            .expect("client exists");
        assert_eq!(client.name, "ci");
        assert!(client.is_active);
        assert!(client.has_permission("sandboxes:read"));
        assert!(client.last_used_at.is_none());

        repo.touch_client_last_used("sk_live_abc123")
            .await
            .expect("touch");

        let touched = repo
            .client_by_api_key("sk_live_abc123")
            .await
            .expect("lookup")
            .expect("client exists");
        assert!(touched.last_used_at.is_some());

        let unknown = repo.client_by_api_key("sk_unknown").await.expect("lookup");
        assert!(unknown.is_none());
    }
}
