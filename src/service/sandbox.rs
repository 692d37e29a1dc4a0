//! Sandbox lifecycle management
//!
//! `Create` persists a pending row and returns; a detached task drives the
//! provisioning pipeline (services in template order, image, container) and
//! records the outcome on the row. `Delete` is the universal compensator
//! and works from any state, including half-provisioned failures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::domain::sandbox::{
    CreateOptions, ListFilters, Sandbox, SandboxStatus, ServiceInstance,
};
use crate::domain::template::Template;
use crate::error::{Error, Result};
use crate::infra::docker::{CreateContainerOpts, DockerManager, ExecStream};
use crate::infra::sqlite::Repository;
use crate::service::catalog::TemplateCatalog;
use crate::service::provider::ProviderRegistry;

const DEFAULT_TTL: Duration = Duration::from_secs(3600);
const STOP_TIMEOUT_SECS: i64 = 30;
const DELETE_STOP_TIMEOUT_SECS: i64 = 10;
/// In-container mount point of the per-sandbox auxiliary volume; keeps
/// shell history and tool credentials across container restarts.
const HOME_VOLUME_MOUNT: &str = "/root";

/// Capability set of the sandbox manager
#[async_trait]
pub trait SandboxManager: Send + Sync {
    async fn create(&self, template_id: &str, user_id: &str, opts: CreateOptions)
        -> Result<Sandbox>;
    async fn get(&self, id: &str) -> Result<Sandbox>;
    async fn stop(&self, id: &str) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn list(&self, filters: &ListFilters) -> Result<Vec<Sandbox>>;
    async fn extend_ttl(&self, id: &str, duration: Duration) -> Result<()>;
    async fn logs(&self, id: &str, tail: usize) -> Result<String>;
    async fn expired(&self) -> Result<Vec<Sandbox>>;
    async fn ping(&self) -> Result<()>;
}

/// Docker-backed sandbox manager. The store is the single source of truth;
/// every operation reads the row fresh and persists its transition.
#[derive(Clone)]
pub struct SandboxService {
    repository: Arc<Repository>,
    docker: Arc<DockerManager>,
    registry: Arc<ProviderRegistry>,
    catalog: Arc<TemplateCatalog>,
    config: Arc<Config>,
}

impl SandboxService {
    pub fn new(
        repository: Arc<Repository>,
        docker: Arc<DockerManager>,
        registry: Arc<ProviderRegistry>,
        catalog: Arc<TemplateCatalog>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            repository,
            docker,
            registry,
            catalog,
            config,
        }
    }

    /// Open an interactive exec on the sandbox's container
    pub async fn exec_attach(&self, container_id: &str) -> Result<(String, ExecStream)> {
        self.docker.exec_attach(container_id).await
    }

    /// Resize an exec's TTY
    pub async fn exec_resize(&self, exec_id: &str, rows: u16, cols: u16) -> Result<()> {
        self.docker.exec_resize(exec_id, rows, cols).await
    }

    /// Exit code of a finished exec, if known
    pub async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>> {
        self.docker.exec_exit_code(exec_id).await
    }

    /// Async provisioning pipeline. Runs detached from the creating
    /// request; every failure is captured on the row, nothing panics.
    async fn provision(&self, mut sandbox: Sandbox, template: Template, extra_env: HashMap<String, String>) {
        for service_name in &template.services {
            let provider = match self.registry.get(service_name) {
                Some(provider) => provider,
                None => {
                    self.fail(&sandbox.id, format!("unknown service: {service_name}"))
                        .await;
                    return;
                }
            };

            let credentials = match provider.provision(&sandbox.id, service_name).await {
                Ok(credentials) => credentials,
                Err(e) => {
                    // No rollback here: Delete compensates for everything
                    // provisioned so far.
                    self.fail(
                        &sandbox.id,
                        format!("failed to provision {service_name}: {e}"),
                    )
                    .await;
                    return;
                }
            };

            let instance = ServiceInstance {
                name: service_name.clone(),
                service_type: service_name.clone(),
                status: "ready".to_string(),
                credentials: Some(credentials),
                created_at: Utc::now(),
            };

            if let Err(e) = self.repository.upsert_service(&sandbox.id, &instance).await {
                self.fail(
                    &sandbox.id,
                    format!("failed to record service {service_name}: {e}"),
                )
                .await;
                return;
            }

            sandbox.services.insert(service_name.clone(), instance);
        }

        if let Err(e) = self
            .docker
            .ensure_image(&template.base_image, self.config.pull_policy)
            .await
        {
            self.fail(&sandbox.id, format!("failed to pull image: {e}"))
                .await;
            return;
        }

        let env = build_env(&sandbox, &template, &extra_env);
        let (labels, endpoints) = build_labels_and_endpoints(&sandbox, &template, &self.config);

        let opts = CreateContainerOpts {
            name: format!("sandbox-{}", sandbox.id),
            image: template.base_image.clone(),
            env,
            exposed_ports: template
                .expose
                .iter()
                .map(|p| format!("{}/{}", p.container, p.protocol))
                .collect(),
            labels,
            binds: volume_binds(&sandbox.id, &template),
            network: Some(self.config.container_network.clone()),
            memory: parse_memory_limit(&template.resources.memory_limit),
            nano_cpus: parse_cpu_limit(&template.resources.cpu_limit),
        };

        let container_id = match self.docker.create_container(opts).await {
            Ok(id) => id,
            Err(e) => {
                self.fail(&sandbox.id, format!("failed to create container: {e}"))
                    .await;
                return;
            }
        };

        sandbox.container_id = container_id.clone();
        sandbox.endpoints = endpoints;
        if let Err(e) = self.repository.update_sandbox(&sandbox).await {
            self.fail(&sandbox.id, format!("failed to record container: {e}"))
                .await;
            return;
        }

        if let Err(e) = self.docker.start_container(&container_id).await {
            self.fail(&sandbox.id, format!("failed to start container: {e}"))
                .await;
            return;
        }

        sandbox.status = SandboxStatus::Running;
        sandbox.started_at = Some(Utc::now());
        sandbox.status_message = None;
        if let Err(e) = self.repository.update_sandbox(&sandbox).await {
            error!(sandbox_id = sandbox.id, error = %e, "failed to persist running state");
            return;
        }

        info!(sandbox_id = sandbox.id, container_id, "sandbox running");
    }

    /// Record a provisioning failure on the row. A concurrent Delete may
    /// have removed the row already; that is not an error.
    async fn fail(&self, id: &str, message: String) {
        error!(sandbox_id = id, message, "sandbox provisioning failed");

        match self.repository.get_sandbox(id).await {
            Ok(mut sandbox) => {
                if sandbox.is_terminal() {
                    return;
                }
                sandbox.status = SandboxStatus::Failed;
                sandbox.status_message = Some(message);
                if let Err(e) = self.repository.update_sandbox(&sandbox).await {
                    error!(sandbox_id = id, error = %e, "failed to persist failure");
                }
            }
            Err(Error::SandboxNotFound(_)) => {}
            Err(e) => error!(sandbox_id = id, error = %e, "failed to load sandbox"),
        }
    }
}

#[async_trait]
impl SandboxManager for SandboxService {
    async fn create(
        &self,
        template_id: &str,
        user_id: &str,
        opts: CreateOptions,
    ) -> Result<Sandbox> {
        let template = self
            .catalog
            .get(template_id)
            .ok_or_else(|| Error::TemplateNotFound(template_id.to_string()))?;

        let id = short_id();
        let ttl = opts.ttl.unwrap_or_else(|| {
            if template.ttl_seconds > 0 {
                template.ttl()
            } else {
                DEFAULT_TTL
            }
        });

        let now = Utc::now();
        let sandbox = Sandbox {
            id: id.clone(),
            template_id: template_id.to_string(),
            user_id: user_id.to_string(),
            status: SandboxStatus::Pending,
            status_message: None,
            container_id: String::new(),
            created_at: now,
            started_at: None,
            expires_at: now
                + chrono::Duration::from_std(ttl)
                    .unwrap_or_else(|_| chrono::Duration::hours(1)),
            services: HashMap::new(),
            endpoints: HashMap::new(),
            metadata: opts.metadata,
        };

        self.repository.create_sandbox(&sandbox).await?;

        // Detached from the caller: the HTTP response returns while the
        // image may still be pulling.
        let service = self.clone();
        let task_sandbox = sandbox.clone();
        tokio::spawn(async move {
            service.provision(task_sandbox, template, opts.env).await;
        });

        info!(
            sandbox_id = id,
            template = template_id,
            user = user_id,
            expires_at = %sandbox.expires_at,
            "sandbox created"
        );

        Ok(sandbox)
    }

    async fn get(&self, id: &str) -> Result<Sandbox> {
        self.repository.get_sandbox(id).await
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let mut sandbox = self.repository.get_sandbox(id).await?;

        if sandbox.is_terminal() {
            return Err(Error::SandboxStopped(id.to_string()));
        }

        if !sandbox.container_id.is_empty() {
            if let Err(e) = self
                .docker
                .stop_container(&sandbox.container_id, STOP_TIMEOUT_SECS)
                .await
            {
                warn!(sandbox_id = id, error = %e, "failed to stop container");
            }
        }

        sandbox.status = SandboxStatus::Stopped;
        self.repository.update_sandbox(&sandbox).await?;

        info!(sandbox_id = id, "sandbox stopped");
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let sandbox = self.repository.get_sandbox(id).await?;

        if !sandbox.container_id.is_empty() {
            if let Err(e) = self
                .docker
                .stop_container(&sandbox.container_id, DELETE_STOP_TIMEOUT_SECS)
                .await
            {
                warn!(sandbox_id = id, error = %e, "failed to stop container");
            }
            if let Err(e) = self
                .docker
                .remove_container(&sandbox.container_id, true)
                .await
            {
                warn!(sandbox_id = id, error = %e, "failed to remove container");
            }
        }

        for name in volume_names(id, self.catalog.get(&sandbox.template_id).as_ref()) {
            if let Err(e) = self.docker.remove_volume(&name).await {
                // The volume never exists when provisioning failed early
                tracing::debug!(sandbox_id = id, volume = name, error = %e, "volume not removed");
            }
        }

        for service_name in sandbox.services.keys() {
            match self.registry.get(service_name) {
                Some(provider) => {
                    if let Err(e) = provider.deprovision(id, service_name).await {
                        warn!(
                            sandbox_id = id,
                            service = service_name,
                            error = %e,
                            "failed to deprovision service"
                        );
                    }
                }
                None => warn!(
                    sandbox_id = id,
                    service = service_name,
                    "no provider registered for service"
                ),
            }
        }

        self.repository.delete_sandbox(id).await?;

        info!(sandbox_id = id, "sandbox deleted");
        Ok(())
    }

    async fn list(&self, filters: &ListFilters) -> Result<Vec<Sandbox>> {
        self.repository.list_sandboxes(filters).await
    }

    async fn extend_ttl(&self, id: &str, duration: Duration) -> Result<()> {
        let mut sandbox = self.repository.get_sandbox(id).await?;

        if sandbox.is_terminal() {
            return Err(Error::SandboxStopped(id.to_string()));
        }

        sandbox.expires_at = sandbox.expires_at
            + chrono::Duration::from_std(duration)
                .map_err(|e| Error::InvalidRequest(format!("invalid duration: {e}")))?;
        self.repository.update_sandbox(&sandbox).await?;

        info!(sandbox_id = id, expires_at = %sandbox.expires_at, "sandbox TTL extended");
        Ok(())
    }

    async fn logs(&self, id: &str, tail: usize) -> Result<String> {
        let sandbox = self.repository.get_sandbox(id).await?;

        if sandbox.container_id.is_empty() {
            return Ok(String::new());
        }

        self.docker.logs(&sandbox.container_id, tail).await
    }

    async fn expired(&self) -> Result<Vec<Sandbox>> {
        self.repository.expired_sandboxes().await
    }

    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| Error::NotReady(format!("container runtime: {e}")))?;
        self.repository
            .ping()
            .await
            .map_err(|e| Error::NotReady(format!("store: {e}")))?;
        Ok(())
    }
}

/// 12 lowercase hex characters from a fresh UUID
fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// Build the container environment. Later entries win for duplicate keys,
/// so caller overrides go after template and service values.
fn build_env(
    sandbox: &Sandbox,
    template: &Template,
    extra_env: &HashMap<String, String>,
) -> Vec<String> {
    let mut env = Vec::new();

    let mut template_env: Vec<_> = template.env.iter().collect();
    template_env.sort();
    for (key, value) in template_env {
        env.push(format!("{key}={value}"));
    }

    let mut services: Vec<_> = sandbox.services.values().collect();
    services.sort_by(|a, b| a.name.cmp(&b.name));
    for service in services {
        let prefix = service.name.to_uppercase();
        if let Some(creds) = &service.credentials {
            env.push(format!("{prefix}_HOST={}", creds.host));
            env.push(format!("{prefix}_PORT={}", creds.port));
            for (suffix, value) in [
                ("USER", &creds.username),
                ("PASSWORD", &creds.password),
                ("DATABASE", &creds.database),
                ("URI", &creds.uri),
                ("PREFIX", &creds.prefix),
            ] {
                if !value.is_empty() {
                    env.push(format!("{prefix}_{suffix}={value}"));
                }
            }
        }
    }

    let mut extra: Vec<_> = extra_env.iter().collect();
    extra.sort();
    for (key, value) in extra {
        env.push(format!("{key}={value}"));
    }

    env.push(format!("SANDBOX_ID={}", sandbox.id));
    env.push(format!("SANDBOX_USER_ID={}", sandbox.user_id));

    env
}

/// Container labels plus the endpoint map for public ports. The `http`
/// port claims the bare sandbox hostname; every public port also gets a
/// `<id>-<name>` hostname.
fn build_labels_and_endpoints(
    sandbox: &Sandbox,
    template: &Template,
    config: &Config,
) -> (HashMap<String, String>, HashMap<String, String>) {
    let mut labels = HashMap::from([
        ("sandbox.id".to_string(), sandbox.id.clone()),
        ("sandbox.user".to_string(), sandbox.user_id.clone()),
        ("sandbox.template".to_string(), sandbox.template_id.clone()),
        ("sandbox.managed".to_string(), "true".to_string()),
    ]);
    for (key, value) in &template.labels {
        labels.insert(key.clone(), value.clone());
    }

    let mut endpoints = HashMap::new();
    if !config.proxy_enabled {
        return (labels, endpoints);
    }

    labels.insert("traefik.enable".to_string(), "true".to_string());
    let scheme = if config.proxy_cert_resolver.is_empty() {
        "http"
    } else {
        "https"
    };

    for port in template.expose.iter().filter(|p| p.public) {
        let name = port.symbolic_name();
        let host = if name == "http" {
            format!("{}.{}", sandbox.id, config.proxy_domain)
        } else {
            format!("{}-{}.{}", sandbox.id, name, config.proxy_domain)
        };
        let router = format!("sandbox-{}-{}", sandbox.id, name);

        labels.insert(
            format!("traefik.http.routers.{router}.rule"),
            format!("Host(`{host}`)"),
        );
        labels.insert(
            format!("traefik.http.services.{router}.loadbalancer.server.port"),
            port.container.to_string(),
        );
        if !config.proxy_cert_resolver.is_empty() {
            labels.insert(
                format!("traefik.http.routers.{router}.tls.certresolver"),
                config.proxy_cert_resolver.clone(),
            );
        }

        endpoints.insert(name, format!("{scheme}://{host}"));
    }

    (labels, endpoints)
}

/// Named volumes of a sandbox: the auxiliary home volume plus one per
/// template volume.
fn volume_names(sandbox_id: &str, template: Option<&Template>) -> Vec<String> {
    let mut names = vec![format!("sandbox-{sandbox_id}-home")];
    if let Some(template) = template {
        for volume in &template.volumes {
            names.push(format!("sandbox-{sandbox_id}-{}", volume.name));
        }
    }
    names
}

/// Memory hint (`512m`, `1g`, `262144k`, plain bytes) in bytes
fn parse_memory_limit(s: &str) -> Option<i64> {
    let s = s.trim().to_ascii_lowercase();
    if s.is_empty() {
        return None;
    }
    let (digits, multiplier) = if let Some(d) = s.strip_suffix('k') {
        (d, 1024)
    } else if let Some(d) = s.strip_suffix('m') {
        (d, 1024 * 1024)
    } else if let Some(d) = s.strip_suffix('g') {
        (d, 1024 * 1024 * 1024)
    } else {
        (s.as_str(), 1)
    };
    let value: i64 = digits.parse().ok()?;
    value.checked_mul(multiplier)
}

/// CPU hint (`1`, `0.5`, `2`) in nano-CPUs
fn parse_cpu_limit(s: &str) -> Option<i64> {
    let cpus: f64 = s.trim().parse().ok()?;
    if cpus <= 0.0 {
        return None;
    }
    Some((cpus * 1e9) as i64)
}

fn volume_binds(sandbox_id: &str, template: &Template) -> Vec<String> {
    let mut binds = vec![format!("sandbox-{sandbox_id}-home:{HOME_VOLUME_MOUNT}")];
    for volume in &template.volumes {
        let mode = if volume.read_only { ":ro" } else { "" };
        binds.push(format!(
            "sandbox-{sandbox_id}-{}:{}{mode}",
            volume.name, volume.mount_path
        ));
    }
    binds
}
