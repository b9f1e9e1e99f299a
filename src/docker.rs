//! Docker container management for containerized viewers

use crate::config::BrowserConfig;
use crate::launcher::{wait_until_ready, PortPool};
use crate::registry::{LaunchError, ProcessHandle, ViewerFactory, ViewerProcess};
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures::future::BoxFuture;
use futures::StreamExt;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Mount point of the workspace inside viewer containers
const CONTAINER_WORKSPACE_DIR: &str = "/data";

/// Label carrying the owning session
const OWNER_LABEL: &str = "viewgate.owner";

/// Thin wrapper around the Docker API
pub struct DockerManager {
    client: Docker,
}

impl DockerManager {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. bollard's platform default socket
    pub async fn new(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host)?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host)?
        } else {
            Docker::connect_with_socket_defaults()
                .map_err(|e| anyhow::anyhow!("Cannot connect to Docker daemon: {}", e))?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. Ensure dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    /// Pull the image unless it exists locally
    pub async fn pull_image_if_missing(&self, image: &str) -> anyhow::Result<()> {
        if self.client.inspect_image(image).await.is_ok() {
            debug!(image, "Image exists locally, skipping pull");
            return Ok(());
        }

        info!(image, "Pulling Docker image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            let info = result.map_err(|e| anyhow::anyhow!("Failed to pull image '{}': {}", image, e))?;
            if let Some(error) = info.error {
                anyhow::bail!("Failed to pull image '{}': {}", image, error);
            }
        }

        info!(image, "Image pulled successfully");
        Ok(())
    }

    /// Create and start a viewer container, returning its id
    pub async fn start_viewer(&self, spec: &ContainerSpec<'_>) -> anyhow::Result<String> {
        self.pull_image_if_missing(spec.image).await?;

        let port_key = format!("{}/tcp", spec.container_port);
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some(spec.host.to_string()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        );

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            binds: Some(vec![format!(
                "{}:{}",
                spec.workspace.display(),
                CONTAINER_WORKSPACE_DIR
            )]),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image.to_string()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            labels: Some(HashMap::from([(OWNER_LABEL.to_string(), spec.owner.to_string())])),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(create_options), container_config)
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to create container '{}' from image '{}': {}",
                    spec.name, spec.image, e
                )
            })?;

        let container_id = response.id;
        self.client
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start container '{}': {}", spec.name, e))?;

        info!(
            container_id,
            container_name = %spec.name,
            image = spec.image,
            host_port = spec.host_port,
            "Started viewer container"
        );

        Ok(container_id)
    }

    /// Stop a container gracefully
    pub async fn stop_container(&self, container_id: &str, timeout: Duration) -> anyhow::Result<()> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };

        match self.client.stop_container(container_id, Some(options)).await {
            Ok(_) => {
                info!(container_id, "Stopped Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => {
                debug!(container_id, "Container already stopped or gone");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to stop container: {}", e)),
        }
    }

    /// Force kill a container
    pub async fn kill_container(&self, container_id: &str) -> anyhow::Result<()> {
        match self.client.kill_container::<String>(container_id, None).await {
            Ok(_) => {
                info!(container_id, "Killed Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => {
                debug!(container_id, "Container not running");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to kill container: {}", e)),
        }
    }

    /// Remove a container, logging rather than failing
    pub async fn remove_container(&self, container_id: &str) -> anyhow::Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.client.remove_container(container_id, Some(options)).await {
            Ok(_) => {
                debug!(container_id, "Removed Docker container");
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id, "Container not found");
            }
            Err(e) => {
                warn!(container_id, error = %e, "Failed to remove container");
            }
        }
        Ok(())
    }
}

/// Wrapper to share DockerManager across tasks
pub type SharedDockerManager = Arc<DockerManager>;

/// Everything needed to start one viewer container
pub struct ContainerSpec<'a> {
    pub name: String,
    pub image: &'a str,
    pub owner: &'a str,
    pub workspace: &'a Path,
    pub host: IpAddr,
    pub host_port: u16,
    pub container_port: u16,
}

/// Container name for a viewer: owner plus host port keeps it unique
pub fn container_name(owner: &str, host_port: u16) -> String {
    let owner: String = owner
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .take(36)
        .collect();
    format!("viewgate-{}-{}", owner, host_port)
}

/// Runs one container per viewer
pub struct DockerLauncher {
    config: BrowserConfig,
    host: IpAddr,
    ports: PortPool,
    docker: SharedDockerManager,
}

impl DockerLauncher {
    pub async fn connect(config: BrowserConfig) -> anyhow::Result<Self> {
        let host: IpAddr = config
            .host
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid browser host '{}': {}", config.host, e))?;
        let docker = Arc::new(DockerManager::new(config.docker_host.as_deref()).await?);
        let ports = PortPool::new(config.port_range);
        Ok(Self {
            config,
            host,
            ports,
            docker,
        })
    }

    async fn start(&self, owner: &str, workspace: &Path) -> Result<ViewerProcess, LaunchError> {
        let lease = self.ports.lease(self.host)?;
        let spec = ContainerSpec {
            name: container_name(owner, lease.port()),
            image: &self.config.image,
            owner,
            workspace,
            host: self.host,
            host_port: lease.port(),
            container_port: self.config.container_port,
        };

        // Leftover from a previous run with the same name
        let _ = self.docker.remove_container(&spec.name).await;

        let container_id = self
            .docker
            .start_viewer(&spec)
            .await
            .map_err(|e| LaunchError::Docker(e.to_string()))?;

        let address = SocketAddr::new(self.host, lease.port());
        let process = ViewerProcess::new(
            owner,
            workspace,
            address,
            ProcessHandle::Docker {
                container_id,
                docker: Arc::clone(&self.docker),
                lease,
            },
        );

        if let Some(timeout) = self.config.startup_timeout() {
            if let Err(e) = wait_until_ready(address, timeout).await {
                process.stop(self.config.shutdown_grace_period()).await;
                return Err(e);
            }
        }

        Ok(process)
    }
}

impl ViewerFactory for DockerLauncher {
    fn launch<'a>(
        &'a self,
        owner: &'a str,
        workspace: &'a Path,
    ) -> BoxFuture<'a, Result<ViewerProcess, LaunchError>> {
        Box::pin(self.start(owner, workspace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_name() {
        assert_eq!(container_name("abc-123", 9001), "viewgate-abc-123-9001");
        assert_eq!(container_name("a/b c", 9002), "viewgate-abc-9002");
    }

    #[test]
    fn test_container_name_truncates_owner() {
        let owner = "x".repeat(100);
        let name = container_name(&owner, 9000);
        assert_eq!(name.len(), "viewgate-".len() + 36 + "-9000".len());
    }

    #[test]
    fn test_invalid_docker_host() {
        let err = DockerManager::connect_to_host("ftp://example").unwrap_err();
        assert!(err.to_string().contains("Invalid docker_host"));
    }
}
