//! PostgreSQL service provider
//!
//! Provisions a dedicated database owned by a freshly created role for each
//! sandbox. Identifiers derive from the 12-hex sandbox id, so they are safe
//! to interpolate; the password is hex.

use std::str::FromStr;

use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tracing::{info, warn};

use crate::domain::sandbox::ServiceCredentials;
use crate::error::{Error, Result};
use crate::service::provider::ServiceProvider;

const PASSWORD_LENGTH: usize = 16;

pub struct PostgresProvider {
    pool: PgPool,
    host: String,
    port: u16,
}

impl PostgresProvider {
    /// Create a provider over an admin connection. The pool connects
    /// lazily; reachability is reported by `health_check`.
    pub fn new(admin_dsn: &str) -> Result<Self> {
        let options = PgConnectOptions::from_str(admin_dsn)
            .map_err(|e| Error::Service(format!("invalid postgres DSN: {e}")))?;

        let host = options.get_host().to_string();
        let port = options.get_port();

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy_with(options);

        Ok(Self { pool, host, port })
    }
}

fn database_name(sandbox_id: &str) -> String {
    format!("sandbox_{}", sandbox_id.replace('-', "_"))
}

fn role_name(sandbox_id: &str) -> String {
    format!("sandbox_user_{}", sandbox_id.replace('-', "_"))
}

/// 16 bytes of OS randomness, hex-encoded, truncated. Generation failure
/// fails the provision; credentials are never synthesized deterministically.
fn generate_password() -> Result<String> {
    let mut bytes = [0u8; PASSWORD_LENGTH];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| Error::Service(format!("password generation failed: {e}")))?;
    Ok(hex::encode(bytes)[..PASSWORD_LENGTH].to_string())
}

#[async_trait]
impl ServiceProvider for PostgresProvider {
    fn service_type(&self) -> &str {
        "postgres"
    }

    async fn provision(&self, sandbox_id: &str, _service_name: &str) -> Result<ServiceCredentials> {
        let database = database_name(sandbox_id);
        let role = role_name(sandbox_id);
        let password = generate_password()?;

        info!(
            sandbox_id,
            database, role, "provisioning postgres database"
        );

        sqlx::query(&format!("CREATE USER {role} WITH PASSWORD '{password}'"))
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Service(format!("failed to create role: {e}")))?;

        if let Err(e) = sqlx::query(&format!("CREATE DATABASE {database} OWNER {role}"))
            .execute(&self.pool)
            .await
        {
            // Compensate the role so a retry starts clean
            if let Err(drop_err) = sqlx::query(&format!("DROP USER IF EXISTS {role}"))
                .execute(&self.pool)
                .await
            {
                warn!(error = %drop_err, role, "failed to drop role after database error");
            }
            return Err(Error::Service(format!("failed to create database: {e}")));
        }

        if let Err(e) =
            sqlx::query(&format!("GRANT ALL PRIVILEGES ON DATABASE {database} TO {role}"))
                .execute(&self.pool)
                .await
        {
            warn!(error = %e, database, "failed to grant privileges");
        }

        let uri = format!(
            "postgres://{role}:{password}@{}:{}/{database}?sslmode=disable",
            self.host, self.port
        );

        Ok(ServiceCredentials {
            host: self.host.clone(),
            port: self.port,
            username: role,
            password,
            database,
            uri,
            ..Default::default()
        })
    }

    async fn deprovision(&self, sandbox_id: &str, _service_name: &str) -> Result<()> {
        let database = database_name(sandbox_id);
        let role = role_name(sandbox_id);

        info!(
            sandbox_id,
            database, role, "deprovisioning postgres database"
        );

        // Terminate open connections so the drop does not block
        let terminate = format!(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE datname = '{database}' AND pid <> pg_backend_pid()"
        );
        if let Err(e) = sqlx::query(&terminate).execute(&self.pool).await {
            warn!(error = %e, database, "failed to terminate backends");
        }

        if let Err(e) = sqlx::query(&format!("DROP DATABASE IF EXISTS {database}"))
            .execute(&self.pool)
            .await
        {
            warn!(error = %e, database, "failed to drop database");
        }

        if let Err(e) = sqlx::query(&format!("DROP USER IF EXISTS {role}"))
            .execute(&self.pool)
            .await
        {
            warn!(error = %e, role, "failed to drop role");
        }

        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Service(format!("postgres health check failed: {e}")))?;
        Ok(())
    }
}
