//! API client credentials

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An authenticated API client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiClient {
    pub id: i64,
    pub name: String,
    /// Never serialized
    #[serde(skip_serializing, default)]
    pub api_key: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    pub permissions: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ApiClient {
    /// Check a permission against the client's grants.
    ///
    /// Match rule: exact, or `prefix:*` matching any `prefix:…`, or the
    /// global `*`. Inactive clients hold no permissions.
    pub fn has_permission(&self, required: &str) -> bool {
        if !self.is_active {
            return false;
        }

        self.permissions.iter().any(|perm| {
            if perm == required || perm == "*" {
                return true;
            }
            if let Some(prefix) = perm.strip_suffix('*') {
                return perm.ends_with(":*") && required.starts_with(prefix);
            }
            false
        })
    }

    /// First 8 characters of the key, for logging.
    pub fn masked_key(&self) -> String {
        if self.api_key.len() < 8 {
            "***".to_string()
        } else {
            format!("{}...", &self.api_key[..8])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(perms: &[&str], active: bool) -> ApiClient {
        ApiClient {
            id: 1,
            name: "test".to_string(),
            api_key: "sk_test_0123456789".to_string(),
            is_active: active,
            created_at: Utc::now(),
            last_used_at: None,
            permissions: perms.iter().map(|p| p.to_string()).collect(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn exact_match() {
        let c = client(&["sandboxes:read"], true);
        assert!(c.has_permission("sandboxes:read"));
        assert!(!c.has_permission("sandboxes:write"));
    }

    #[test]
    fn domain_wildcard_matches_only_its_domain() {
        let c = client(&["sandboxes:*"], true);
        assert!(c.has_permission("sandboxes:read"));
        assert!(c.has_permission("sandboxes:write"));
        assert!(!c.has_permission("sessions:read"));
        assert!(!c.has_permission("templates:read"));
    }

    #[test]
    fn global_wildcard_matches_everything() {
        let c = client(&["*"], true);
        assert!(c.has_permission("sandboxes:read"));
        assert!(c.has_permission("sessions:write"));
        assert!(c.has_permission("anything:at-all"));
    }

    #[test]
    fn inactive_client_has_no_permissions() {
        let c = client(&["*"], false);
        assert!(!c.has_permission("sandboxes:read"));
    }

    #[test]
    fn masked_key_is_prefix_only() {
        let c = client(&[], true);
        assert_eq!(c.masked_key(), "sk_test_...");
        let short = ApiClient {
            api_key: "abc".to_string(),
            ..client(&[], true)
        };
        assert_eq!(short.masked_key(), "***");
    }
}
