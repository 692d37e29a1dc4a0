//! Deferred sandbox sessions
//!
//! A session is a pre-allocated intent to run a sandbox. It is created by an
//! orchestrator and activated when its join token is first presented; the
//! TTL starts at activation, not at creation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, waiting for the join token to be presented
    Ready,
    /// Token presented, sandbox starting
    Provisioning,
    /// Sandbox running, TTL ticking
    Active,
    /// TTL elapsed
    Expired,
    /// Error during provisioning
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Ready => "ready",
            SessionStatus::Provisioning => "provisioning",
            SessionStatus::Active => "active",
            SessionStatus::Expired => "expired",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ready" => Some(SessionStatus::Ready),
            "provisioning" => Some(SessionStatus::Provisioning),
            "active" => Some(SessionStatus::Active),
            "expired" => Some(SessionStatus::Expired),
            "failed" => Some(SessionStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Expired | SessionStatus::Failed)
    }
}

/// Session entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub token: String,
    pub template_id: String,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub ttl_seconds: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

/// Generate a join token: 24 bytes of OS randomness, hex-encoded to
/// 48 characters. The token is the sole authenticator for the public
/// session endpoints, so generation failure is an error, never a
/// weaker fallback.
pub fn generate_token() -> Result<String> {
    let mut bytes = [0u8; 24];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| Error::Internal(format!("token generation failed: {e}")))?;
    Ok(hex::encode(bytes))
}
