//! Redis service provider
//!
//! Redis has no per-tenant isolation, so each sandbox gets a unique key
//! prefix instead. Provision writes a marker key under the prefix;
//! deprovision scans and deletes everything that matches it.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{info, warn};

use crate::domain::sandbox::ServiceCredentials;
use crate::error::{Error, Result};
use crate::service::provider::ServiceProvider;

const SCAN_BATCH: usize = 100;

pub struct RedisProvider {
    conn: ConnectionManager,
    host: String,
    port: u16,
    password: String,
}

impl RedisProvider {
    pub async fn new(address: &str, password: &str) -> Result<Self> {
        let url = if password.is_empty() {
            format!("redis://{address}")
        } else {
            format!("redis://:{password}@{address}")
        };

        let client = redis::Client::open(url)
            .map_err(|e| Error::Service(format!("invalid redis address: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| Error::Service(format!("failed to connect to redis: {e}")))?;

        let (host, port) = match address.split_once(':') {
            Some((host, port)) => (host.to_string(), port.parse().unwrap_or(6379)),
            None => (address.to_string(), 6379),
        };

        Ok(Self {
            conn,
            host,
            port,
            password: password.to_string(),
        })
    }
}

fn key_prefix(sandbox_id: &str) -> String {
    format!("sandbox:{}:", sandbox_id.replace('-', "_"))
}

#[async_trait]
impl ServiceProvider for RedisProvider {
    fn service_type(&self) -> &str {
        "redis"
    }

    async fn provision(&self, sandbox_id: &str, _service_name: &str) -> Result<ServiceCredentials> {
        let prefix = key_prefix(sandbox_id);

        info!(sandbox_id, prefix, "provisioning redis namespace");

        // Marker key tracks which namespaces exist
        let marker = format!("{prefix}__provisioned__");
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(&marker)
            .arg("1")
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Service(format!("failed to provision redis namespace: {e}")))?;

        let uri = if self.password.is_empty() {
            format!("redis://{}:{}", self.host, self.port)
        } else {
            format!("redis://:{}@{}:{}", self.password, self.host, self.port)
        };

        Ok(ServiceCredentials {
            host: self.host.clone(),
            port: self.port,
            password: self.password.clone(),
            prefix,
            uri,
            ..Default::default()
        })
    }

    async fn deprovision(&self, sandbox_id: &str, _service_name: &str) -> Result<()> {
        let prefix = key_prefix(sandbox_id);
        let pattern = format!("{prefix}*");

        info!(sandbox_id, prefix, "deprovisioning redis namespace");

        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut deleted = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| Error::Service(format!("failed to scan keys: {e}")))?;

            if !keys.is_empty() {
                let removed: std::result::Result<(), redis::RedisError> =
                    redis::cmd("DEL").arg(&keys).query_async(&mut conn).await;
                if let Err(e) = removed {
                    warn!(error = %e, "failed to delete some keys");
                }
                deleted += keys.len();
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        info!(sandbox_id, deleted, "redis namespace deprovisioned");
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Service(format!("redis health check failed: {e}")))?;
        Ok(())
    }
}
