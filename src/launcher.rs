//! Viewer factories backed by local processes
//!
//! Each viewer gets a port leased from the configured range. The lease travels
//! with the process handle and returns the port when the viewer is stopped.

use crate::config::{BrowserConfig, BrowserMode};
use crate::docker::DockerLauncher;
use crate::registry::{LaunchError, ProcessHandle, ViewerFactory, ViewerProcess};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, info};

/// Broadway display `n` listens on port `8080 + n`
const BROADWAY_BASE_PORT: u16 = 8080;

/// Interval between readiness probes
const READY_POLL_INTERVAL_MS: u64 = 50;

/// Hands out ports from a fixed range
#[derive(Clone)]
pub struct PortPool {
    start: u16,
    end: u16,
    leased: Arc<Mutex<HashSet<u16>>>,
}

impl PortPool {
    pub fn new((start, end): (u16, u16)) -> Self {
        Self {
            start,
            end,
            leased: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Lease the first port that is neither leased nor bound by someone else
    pub fn lease(&self, host: IpAddr) -> Result<PortLease, LaunchError> {
        let mut leased = self.leased.lock();
        let port = (self.start..self.end)
            .find(|port| !leased.contains(port) && port_is_free(host, *port))
            .ok_or(LaunchError::NoFreePort {
                start: self.start,
                end: self.end,
            })?;
        leased.insert(port);
        debug!(port, "Port leased");

        Ok(PortLease {
            port,
            leased: Arc::clone(&self.leased),
        })
    }

    pub fn leased_count(&self) -> usize {
        self.leased.lock().len()
    }
}

fn port_is_free(host: IpAddr, port: u16) -> bool {
    std::net::TcpListener::bind((host, port)).is_ok()
}

/// A port reserved for one viewer; released on drop
pub struct PortLease {
    port: u16,
    leased: Arc<Mutex<HashSet<u16>>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.leased.lock().remove(&self.port);
        debug!(port = self.port, "Port released");
    }
}

/// Values substituted into command, args and env
pub struct Placeholders<'a> {
    pub port: u16,
    pub owner: &'a str,
    pub workspace: &'a Path,
}

impl Placeholders<'_> {
    pub fn display(&self) -> u16 {
        self.port.saturating_sub(BROADWAY_BASE_PORT)
    }

    pub fn expand(&self, template: &str) -> String {
        template
            .replace("{port}", &self.port.to_string())
            .replace("{display}", &self.display().to_string())
            .replace("{workspace}", &self.workspace.display().to_string())
            .replace("{owner}", self.owner)
    }
}

/// Spawns one local process (group) per viewer
pub struct NativeLauncher {
    config: BrowserConfig,
    host: IpAddr,
    ports: PortPool,
}

impl NativeLauncher {
    pub fn new(config: BrowserConfig) -> anyhow::Result<Self> {
        let host: IpAddr = config
            .host
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid browser host '{}': {}", config.host, e))?;
        let ports = PortPool::new(config.port_range);
        Ok(Self {
            config,
            host,
            ports,
        })
    }

    pub fn ports(&self) -> &PortPool {
        &self.ports
    }

    async fn spawn(&self, owner: &str, workspace: &Path) -> Result<ViewerProcess, LaunchError> {
        let lease = self.ports.lease(self.host)?;
        let vars = Placeholders {
            port: lease.port(),
            owner,
            workspace,
        };

        let command = vars.expand(&self.config.command);
        info!(owner, workspace = %workspace.display(), command = %command, port = lease.port(), "Starting viewer");

        let mut cmd = Command::new(&command);
        cmd.args(self.config.args.iter().map(|arg| vars.expand(arg)));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        for (key, value) in &self.config.env {
            cmd.env(key, vars.expand(value));
        }
        cmd.env("PORT", lease.port().to_string());

        // Own process group so helpers die with the viewer
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd
            .spawn()
            .map_err(|source| LaunchError::Spawn { command, source })?;
        let pid = child.id().unwrap_or(0);
        let address = SocketAddr::new(self.host, lease.port());
        info!(owner, pid, %address, "Viewer process spawned");

        let process = ViewerProcess::new(owner, workspace, address, ProcessHandle::Local { child, lease });

        if let Some(timeout) = self.config.startup_timeout() {
            if let Err(e) = wait_until_ready(address, timeout).await {
                process.stop(self.config.shutdown_grace_period()).await;
                return Err(e);
            }
        }

        Ok(process)
    }
}

impl ViewerFactory for NativeLauncher {
    fn launch<'a>(
        &'a self,
        owner: &'a str,
        workspace: &'a Path,
    ) -> BoxFuture<'a, Result<ViewerProcess, LaunchError>> {
        Box::pin(self.spawn(owner, workspace))
    }
}

/// Poll until the address accepts TCP connections
pub async fn wait_until_ready(address: SocketAddr, timeout: Duration) -> Result<(), LaunchError> {
    let start = Instant::now();
    loop {
        if TcpStream::connect(address).await.is_ok() {
            debug!(%address, waited_ms = start.elapsed().as_millis(), "Viewer accepts connections");
            return Ok(());
        }
        if start.elapsed() > timeout {
            return Err(LaunchError::NotReady { address, timeout });
        }
        tokio::time::sleep(Duration::from_millis(READY_POLL_INTERVAL_MS)).await;
    }
}

/// Build the factory selected by `browser.mode`
pub async fn factory_from_config(config: &BrowserConfig) -> anyhow::Result<Arc<dyn ViewerFactory>> {
    match config.mode {
        BrowserMode::Native => Ok(Arc::new(NativeLauncher::new(config.clone())?)),
        BrowserMode::Docker => Ok(Arc::new(DockerLauncher::connect(config.clone()).await?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn test_placeholders() {
        let vars = Placeholders {
            port: 9001,
            owner: "s1",
            workspace: Path::new("/data/a_workspace"),
        };
        assert_eq!(vars.display(), 921);
        assert_eq!(vars.expand("{workspace}/mets.xml"), "/data/a_workspace/mets.xml");
        assert_eq!(vars.expand(":{display}"), ":921");
        assert_eq!(vars.expand("--port={port} --owner={owner}"), "--port=9001 --owner=s1");
        assert_eq!(vars.expand("plain"), "plain");
    }

    #[test]
    fn test_port_pool_leases_distinct_ports() {
        let pool = PortPool::new((38100, 38110));
        let a = pool.lease(LOCALHOST).unwrap();
        let b = pool.lease(LOCALHOST).unwrap();
        assert_ne!(a.port(), b.port());
        assert_eq!(pool.leased_count(), 2);

        drop(a);
        assert_eq!(pool.leased_count(), 1);
    }

    #[test]
    fn test_port_pool_skips_bound_ports() {
        let listener = std::net::TcpListener::bind((LOCALHOST, 38120)).unwrap();
        let pool = PortPool::new((38120, 38122));
        let lease = pool.lease(LOCALHOST).unwrap();
        assert_eq!(lease.port(), 38121);
        drop(listener);
    }

    #[test]
    fn test_port_pool_exhausted() {
        let pool = PortPool::new((38130, 38131));
        let _lease = pool.lease(LOCALHOST).unwrap();
        let err = pool.lease(LOCALHOST).err().unwrap();
        assert!(matches!(err, LaunchError::NoFreePort { start: 38130, end: 38131 }));
    }

    #[tokio::test]
    async fn test_wait_until_ready() {
        let listener = tokio::net::TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let address = listener.local_addr().unwrap();
        assert!(wait_until_ready(address, Duration::from_secs(1)).await.is_ok());

        drop(listener);
        let err = wait_until_ready(address, Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, LaunchError::NotReady { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_native_launch_and_stop() {
        let config = BrowserConfig {
            port_range: (38140, 38150),
            command: "sleep".to_string(),
            args: vec!["30".to_string()],
            env: Default::default(),
            shutdown_grace_period_secs: 1,
            ..BrowserConfig::default()
        };
        let launcher = NativeLauncher::new(config).unwrap();

        let process = launcher
            .launch("s1", Path::new("/tmp"))
            .await
            .unwrap();
        assert!(process.is_running());
        assert_eq!(launcher.ports().leased_count(), 1);

        process.stop(Duration::from_secs(1)).await;
        assert!(!process.is_running());
        assert_eq!(launcher.ports().leased_count(), 0);
    }

    #[tokio::test]
    async fn test_native_launch_missing_command() {
        let config = BrowserConfig {
            port_range: (38150, 38160),
            command: "/nonexistent/viewer-binary".to_string(),
            ..BrowserConfig::default()
        };
        let launcher = NativeLauncher::new(config).unwrap();

        let err = launcher.launch("s1", Path::new("/tmp")).await.unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
        assert_eq!(launcher.ports().leased_count(), 0);
    }
}
