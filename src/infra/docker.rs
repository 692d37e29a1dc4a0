//! Docker management layer

use std::collections::HashMap;
use std::pin::Pin;

use bollard::{
    container::{
        Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
        StartContainerOptions, StopContainerOptions,
    },
    exec::{CreateExecOptions, ResizeExecOptions, StartExecResults},
    image::CreateImageOptions,
    models::{HostConfig, RestartPolicy, RestartPolicyNameEnum},
    volume::RemoveVolumeOptions,
    Docker,
};
use futures::{Stream, StreamExt};
use tokio::io::AsyncWrite;
use tracing::{debug, info};

use crate::config::PullPolicy;
use crate::error::{Error, Result};

/// Container creation options
#[derive(Debug, Clone, Default)]
pub struct CreateContainerOpts {
    /// Container name
    pub name: String,
    /// Image to use
    pub image: String,
    /// Environment variables as `KEY=VALUE`
    pub env: Vec<String>,
    /// Exposed ports as `<port>/<protocol>`
    pub exposed_ports: Vec<String>,
    /// Labels
    pub labels: HashMap<String, String>,
    /// Volume binds as `name:/path[:ro]`
    pub binds: Vec<String>,
    /// Network to attach
    pub network: Option<String>,
    /// Memory limit in bytes
    pub memory: Option<i64>,
    /// CPU limit in nano-CPUs (1e9 = one core)
    pub nano_cpus: Option<i64>,
}

/// The attached side of an interactive exec: a raw output stream plus a
/// writer into the exec's stdin. Safe to drive from separate tasks.
pub struct ExecStream {
    pub output:
        Pin<Box<dyn Stream<Item = std::result::Result<LogOutput, bollard::errors::Error>> + Send>>,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

/// Docker manager for container operations
pub struct DockerManager {
    client: Docker,
}

impl DockerManager {
    /// Create a new Docker manager. An empty socket path selects the
    /// platform defaults.
    pub fn new(socket_path: Option<&str>) -> Result<Self> {
        let client = match socket_path {
            Some(path) if !path.is_empty() => {
                Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)?
            }
            _ => Docker::connect_with_local_defaults()?,
        };

        Ok(Self { client })
    }

    /// Check if the Docker daemon is accessible
    pub async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map_err(|e| Error::Runtime(format!("docker ping failed: {e}")))?;
        Ok(())
    }

    /// Make sure the base image is present, honoring the pull policy.
    /// Pull progress is drained and discarded.
    pub async fn ensure_image(&self, image: &str, policy: PullPolicy) -> Result<()> {
        if policy == PullPolicy::Never {
            return Ok(());
        }

        let image_name = if image.contains(':') {
            image.to_string()
        } else {
            format!("{image}:latest")
        };

        if policy == PullPolicy::IfNotPresent
            && self.client.inspect_image(&image_name).await.is_ok()
        {
            debug!("image {} already present", image_name);
            return Ok(());
        }

        info!("pulling image {}", image_name);
        let options = CreateImageOptions {
            from_image: image_name.clone(),
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| Error::Runtime(format!("failed to pull image: {e}")))?;
        }

        info!("image {} pulled", image_name);
        Ok(())
    }

    /// Create a container configured for interactive terminal access:
    /// TTY on, stdin open and attached, no auto-remove, restarts disabled.
    pub async fn create_container(&self, opts: CreateContainerOpts) -> Result<String> {
        let exposed_ports: HashMap<String, HashMap<(), ()>> = opts
            .exposed_ports
            .iter()
            .map(|p| (p.clone(), HashMap::new()))
            .collect();

        let host_config = HostConfig {
            binds: if opts.binds.is_empty() {
                None
            } else {
                Some(opts.binds)
            },
            network_mode: opts.network,
            memory: opts.memory,
            nano_cpus: opts.nano_cpus,
            auto_remove: Some(false),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::NO),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        let config = Config {
            image: Some(opts.image),
            env: if opts.env.is_empty() {
                None
            } else {
                Some(opts.env)
            },
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            labels: if opts.labels.is_empty() {
                None
            } else {
                Some(opts.labels)
            },
            tty: Some(true),
            open_stdin: Some(true),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: opts.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(options), config)
            .await
            .map_err(|e| Error::Runtime(format!("failed to create container: {e}")))?;

        info!("container {} created with ID {}", opts.name, response.id);
        Ok(response.id)
    }

    /// Start a container
    pub async fn start_container(&self, id: &str) -> Result<()> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::Runtime(format!("failed to start container: {e}")))?;

        info!("container {} started", id);
        Ok(())
    }

    /// Gracefully stop a container within `timeout_secs`
    pub async fn stop_container(&self, id: &str, timeout_secs: i64) -> Result<()> {
        let options = StopContainerOptions { t: timeout_secs };

        self.client
            .stop_container(id, Some(options))
            .await
            .map_err(|e| Error::Runtime(format!("failed to stop container: {e}")))?;

        info!("container {} stopped", id);
        Ok(())
    }

    /// Remove a container
    pub async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };

        self.client
            .remove_container(id, Some(options))
            .await
            .map_err(|e| Error::Runtime(format!("failed to remove container: {e}")))?;

        info!("container {} removed", id);
        Ok(())
    }

    /// Remove a named volume
    pub async fn remove_volume(&self, name: &str) -> Result<()> {
        self.client
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await
            .map_err(|e| Error::Runtime(format!("failed to remove volume: {e}")))?;

        debug!("volume {} removed", name);
        Ok(())
    }

    /// Fetch the last `tail` lines of container output
    pub async fn logs(&self, id: &str, tail: usize) -> Result<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };

        let mut stream = self.client.logs(id, Some(options));
        let mut out = String::new();

        while let Some(result) = stream.next().await {
            let chunk = result.map_err(|e| Error::Runtime(format!("failed to read logs: {e}")))?;
            out.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
        }

        Ok(out)
    }

    /// Open an interactive exec in the container: a login shell on a TTY
    /// with stdin attached. Returns the exec ID and the duplex stream.
    pub async fn exec_attach(&self, container_id: &str) -> Result<(String, ExecStream)> {
        let exec = self
            .client
            .create_exec(
                container_id,
                CreateExecOptions {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    env: Some(vec![
                        "TERM=xterm-256color".to_string(),
                        "COLORTERM=truecolor".to_string(),
                    ]),
                    cmd: Some(vec!["/bin/bash".to_string(), "--login".to_string()]),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Error::Runtime(format!("failed to create exec: {e}")))?;

        match self.client.start_exec(&exec.id, None).await? {
            StartExecResults::Attached { output, input } => {
                Ok((exec.id, ExecStream { output, input }))
            }
            StartExecResults::Detached => {
                Err(Error::Runtime("exec started detached".to_string()))
            }
        }
    }

    /// Resize the exec's TTY. Some runtimes reject resizing an attached
    /// exec; callers log and continue.
    pub async fn exec_resize(&self, exec_id: &str, rows: u16, cols: u16) -> Result<()> {
        self.client
            .resize_exec(
                exec_id,
                ResizeExecOptions {
                    height: rows,
                    width: cols,
                },
            )
            .await
            .map_err(|e| Error::Runtime(format!("failed to resize exec: {e}")))?;

        Ok(())
    }

    /// Exit code of a finished exec, if known
    pub async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>> {
        let inspect = self
            .client
            .inspect_exec(exec_id)
            .await
            .map_err(|e| Error::Runtime(format!("failed to inspect exec: {e}")))?;

        Ok(inspect.exit_code)
    }
}
