//! Sandbox domain model

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sandbox lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    /// Row exists, provisioning has not finished
    Pending,
    /// Container started, services provisioned
    Running,
    /// Stopped by request; resources retained until delete
    Stopped,
    /// Provisioning or runtime error; message carries the cause
    Failed,
    /// TTL elapsed
    Expired,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxStatus::Pending => "pending",
            SandboxStatus::Running => "running",
            SandboxStatus::Stopped => "stopped",
            SandboxStatus::Failed => "failed",
            SandboxStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SandboxStatus::Pending),
            "running" => Some(SandboxStatus::Running),
            "stopped" => Some(SandboxStatus::Stopped),
            "failed" => Some(SandboxStatus::Failed),
            "expired" => Some(SandboxStatus::Expired),
            _ => None,
        }
    }

    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SandboxStatus::Stopped | SandboxStatus::Failed | SandboxStatus::Expired
        )
    }
}

/// Connection credentials for a provisioned service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceCredentials {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub database: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prefix: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uri: String,
}

/// An auxiliary resource provisioned for one sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<ServiceCredentials>,
    pub created_at: DateTime<Utc>,
}

/// Sandbox entity. Observable from the moment the row is written,
/// before any container exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: String,
    pub template_id: String,
    pub user_id: String,
    pub status: SandboxStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub services: HashMap<String, ServiceInstance>,
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Sandbox {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Filters for listing sandboxes
#[derive(Debug, Clone, Default)]
pub struct ListFilters {
    pub user_id: Option<String>,
    pub template_id: Option<String>,
    pub status: Option<SandboxStatus>,
    pub limit: i64,
    pub offset: i64,
}

/// Optional parameters for sandbox creation
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub ttl: Option<Duration>,
    pub env: HashMap<String, String>,
    pub metadata: HashMap<String, String>,
}
