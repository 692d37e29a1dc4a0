//! Sandbox templates and the hierarchical catalog

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A declarative sandbox template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub base_image: String,
    /// Service names to provision, in order
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Default sandbox lifetime in seconds
    pub ttl_seconds: u64,
    #[serde(default)]
    pub expose: Vec<Port>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub commands: Commands,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Template {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

/// Resource hints for the container runtime
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub cpu_limit: String,
    #[serde(default)]
    pub memory_limit: String,
    #[serde(default)]
    pub cpu_request: String,
    #[serde(default)]
    pub memory_request: String,
    #[serde(default)]
    pub disk_limit: String,
}

/// An exposed container port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port {
    pub container: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub public: bool,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

impl Port {
    /// Symbolic name, falling back to the port number.
    pub fn symbolic_name(&self) -> String {
        if self.name.is_empty() {
            format!("port-{}", self.container)
        } else {
            self.name.clone()
        }
    }
}

/// A volume mount
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub mount_path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Lifecycle commands
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Commands {
    #[serde(default)]
    pub init: Vec<String>,
    #[serde(default)]
    pub start: Vec<String>,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub healthcheck: String,
}

// Catalog hierarchy: domain -> project -> task. Field names keep the
// original camelCase wire format consumed by the browser UI.

/// A top-level catalog category
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogDomain {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "projectsCount")]
    pub projects_count: usize,
    #[serde(rename = "tasksCount")]
    pub tasks_count: usize,
}

/// A project within a domain; doubles as a template alias `domain/project`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogProject {
    pub id: String,
    #[serde(rename = "domainId")]
    pub domain_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "tasksCount")]
    pub tasks_count: usize,
}

/// A task within a project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogTask {
    pub id: String,
    pub code: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub difficulty: String,
    #[serde(rename = "requiredLevel")]
    pub required_level: Option<String>,
    #[serde(rename = "timeLimit")]
    pub time_limit: i64,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(rename = "domainId")]
    pub domain_id: String,
    #[serde(rename = "projectId")]
    pub project_id: String,
}
