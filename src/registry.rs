//! Registry of running viewer processes
//!
//! The registry is the only place that knows whether a viewer is running for an
//! `(owner, workspace)` pair. Launches for the same pair are serialized so the
//! factory runs at most once; shutdown is idempotent because both ends of a
//! tunnel may race to request it.

use crate::docker::SharedDockerManager;
use crate::launcher::PortLease;
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Error starting a single viewer process
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("no free port in range {start}..{end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("docker: {0}")]
    Docker(String),

    #[error("viewer at {address} not ready after {}s", .timeout.as_secs())]
    NotReady { address: SocketAddr, timeout: Duration },

    #[error("{0}")]
    Other(String),
}

/// Error returned by [`ProcessRegistry::launch_or_reuse`]
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to launch viewer for {owner} at {}: {source}", .workspace.display())]
    ProcessLaunchFailed {
        owner: String,
        workspace: PathBuf,
        #[source]
        source: LaunchError,
    },
}

/// Creates viewer processes for the registry
pub trait ViewerFactory: Send + Sync {
    /// Start a viewer serving `workspace` on behalf of `owner`
    fn launch<'a>(
        &'a self,
        owner: &'a str,
        workspace: &'a Path,
    ) -> BoxFuture<'a, Result<ViewerProcess, LaunchError>>;
}

/// Handle to the OS resource behind a viewer
pub enum ProcessHandle {
    /// Local process spawned directly, leader of its own process group
    Local { child: Child, lease: PortLease },
    /// Docker container
    Docker {
        container_id: String,
        docker: SharedDockerManager,
        lease: PortLease,
    },
    /// Started and stopped by someone else
    Unmanaged,
}

impl ProcessHandle {
    fn has_exited(&mut self) -> bool {
        match self {
            ProcessHandle::Local { child, .. } => matches!(child.try_wait(), Ok(Some(_))),
            ProcessHandle::Docker { .. } | ProcessHandle::Unmanaged => false,
        }
    }

    async fn stop(self, grace_period: Duration) {
        match self {
            ProcessHandle::Local { mut child, lease } => {
                stop_local_process(&mut child, lease.port(), grace_period).await;
            }
            ProcessHandle::Docker {
                container_id,
                docker,
                lease,
            } => {
                if let Err(e) = docker.stop_container(&container_id, grace_period).await {
                    warn!(container_id, port = lease.port(), error = %e, "Error stopping container, forcing kill");
                    let _ = docker.kill_container(&container_id).await;
                }
                let _ = docker.remove_container(&container_id).await;
            }
            ProcessHandle::Unmanaged => {}
        }
    }
}

/// Send SIGTERM to the process group, SIGKILL after the grace period
async fn stop_local_process(child: &mut Child, port: u16, grace_period: Duration) {
    let pid = child.id();
    if let Some(pid) = pid {
        info!(pid, port, "Sending SIGTERM to viewer process group");

        #[cfg(unix)]
        unsafe {
            libc::kill(-(pid as i32), libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(port, ?status, "Viewer process exited");
        }
        Ok(Err(e)) => {
            warn!(port, error = %e, "Error waiting for viewer to exit");
        }
        Err(_) => {
            warn!(
                port,
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            #[cfg(unix)]
            {
                if let Some(pid) = pid {
                    unsafe {
                        libc::kill(-(pid as i32), libc::SIGKILL);
                    }
                }
            }
            let _ = child.kill().await;
        }
    }
}

/// One running viewer instance
pub struct ViewerProcess {
    id: Uuid,
    owner: String,
    workspace: PathBuf,
    address: SocketAddr,
    running: AtomicBool,
    handle: Mutex<Option<ProcessHandle>>,
}

impl ViewerProcess {
    pub fn new(
        owner: impl Into<String>,
        workspace: impl Into<PathBuf>,
        address: SocketAddr,
        handle: ProcessHandle,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            workspace: workspace.into(),
            address,
            running: AtomicBool::new(true),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// A viewer whose lifetime is managed outside this process
    pub fn unmanaged(
        owner: impl Into<String>,
        workspace: impl Into<PathBuf>,
        address: SocketAddr,
    ) -> Self {
        Self::new(owner, workspace, address, ProcessHandle::Unmanaged)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn key(&self) -> ViewerKey {
        ViewerKey::new(&self.owner, &self.workspace)
    }

    fn has_exited(&self) -> bool {
        self.handle
            .lock()
            .as_mut()
            .map(ProcessHandle::has_exited)
            .unwrap_or(true)
    }

    /// Flip to terminated; true only for the first caller
    fn mark_terminated(&self) -> bool {
        self.running.swap(false, Ordering::SeqCst)
    }

    /// Stop the OS resource. Used by factories to clean up failed launches.
    pub async fn stop(&self, grace_period: Duration) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.stop(grace_period).await;
        }
    }
}

impl std::fmt::Debug for ViewerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewerProcess")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("workspace", &self.workspace)
            .field("address", &self.address)
            .field("running", &self.is_running())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ViewerKey {
    owner: String,
    workspace: PathBuf,
}

impl ViewerKey {
    fn new(owner: &str, workspace: &Path) -> Self {
        Self {
            owner: owner.to_string(),
            workspace: workspace.to_path_buf(),
        }
    }
}

type LaunchLocks = DashMap<ViewerKey, Arc<tokio::sync::Mutex<()>>>;

/// A held reference to a key's launch lock. The map entry goes away with the
/// last holder, including when the launch is cancelled.
struct LaunchSlot<'a> {
    lock: Arc<tokio::sync::Mutex<()>>,
    locks: &'a LaunchLocks,
    key: &'a ViewerKey,
}

impl<'a> LaunchSlot<'a> {
    fn new(locks: &'a LaunchLocks, key: &'a ViewerKey) -> Self {
        let lock = locks.entry(key.clone()).or_default().clone();
        Self { lock, locks, key }
    }
}

impl Drop for LaunchSlot<'_> {
    fn drop(&mut self) {
        drop(std::mem::take(&mut self.lock));
        self.locks
            .remove_if(self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Tracks running viewers keyed by `(owner, workspace)`.
///
/// Constructed once at server start and shared behind an `Arc`;
/// [`stop_all`](ProcessRegistry::stop_all) tears it down at server stop.
pub struct ProcessRegistry {
    /// Running viewers
    running: Mutex<HashMap<ViewerKey, Arc<ViewerProcess>>>,
    /// Serializes launches per key so the factory runs once
    launch_locks: LaunchLocks,
    /// Grace period handed to stopping viewers
    grace_period: Duration,
}

impl ProcessRegistry {
    pub fn new(grace_period: Duration) -> Arc<Self> {
        Arc::new(Self {
            running: Mutex::new(HashMap::new()),
            launch_locks: DashMap::new(),
            grace_period,
        })
    }

    /// Return the running viewer for the pair, launching one if there is none
    pub async fn launch_or_reuse(
        &self,
        owner: &str,
        workspace: &Path,
        factory: &dyn ViewerFactory,
    ) -> Result<Arc<ViewerProcess>, RegistryError> {
        let key = ViewerKey::new(owner, workspace);
        let slot = LaunchSlot::new(&self.launch_locks, &key);
        let _launching = slot.lock.lock().await;
        self.launch_locked(&key, factory).await
    }

    async fn launch_locked(
        &self,
        key: &ViewerKey,
        factory: &dyn ViewerFactory,
    ) -> Result<Arc<ViewerProcess>, RegistryError> {
        let owner = key.owner.as_str();
        let workspace = key.workspace.as_path();

        if let Some(existing) = self.get(key) {
            if !existing.has_exited() {
                debug!(owner, workspace = %workspace.display(), address = %existing.address(), "Reusing running viewer");
                return Ok(existing);
            }
            warn!(owner, workspace = %workspace.display(), "Viewer exited on its own, relaunching");
            self.shutdown(&existing).await;
        }

        let process = factory.launch(owner, workspace).await.map_err(|source| {
            error!(owner, workspace = %workspace.display(), error = %source, "Failed to launch viewer");
            RegistryError::ProcessLaunchFailed {
                owner: owner.to_string(),
                workspace: workspace.to_path_buf(),
                source,
            }
        })?;

        let process = Arc::new(process);
        self.running.lock().insert(key.clone(), Arc::clone(&process));
        info!(
            owner,
            workspace = %workspace.display(),
            address = %process.address(),
            "Viewer launched"
        );

        Ok(process)
    }

    /// Mark the viewer terminated, forget it and stop it. Repeated calls are no-ops.
    pub async fn shutdown(&self, process: &ViewerProcess) {
        if !process.mark_terminated() {
            debug!(id = %process.id(), "Viewer already shut down");
            return;
        }

        {
            let key = process.key();
            let mut running = self.running.lock();
            if running.get(&key).is_some_and(|p| p.id() == process.id()) {
                running.remove(&key);
            }
        }

        info!(
            owner = process.owner(),
            workspace = %process.workspace().display(),
            address = %process.address(),
            "Shutting down viewer"
        );
        let handle = process.handle.lock().take();
        if let Some(handle) = handle {
            handle.stop(self.grace_period).await;
        }
    }

    /// The running viewer for the pair, if any
    pub fn lookup(&self, owner: &str, workspace: &Path) -> Option<Arc<ViewerProcess>> {
        self.get(&ViewerKey::new(owner, workspace))
    }

    pub fn is_running(&self, owner: &str, workspace: &Path) -> bool {
        self.lookup(owner, workspace).is_some()
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().len()
    }

    /// Stop every viewer (server stop)
    pub async fn stop_all(&self) {
        let processes: Vec<Arc<ViewerProcess>> = self.running.lock().values().cloned().collect();
        for process in processes {
            self.shutdown(&process).await;
        }
    }

    fn get(&self, key: &ViewerKey) -> Option<Arc<ViewerProcess>> {
        self.running
            .lock()
            .get(key)
            .filter(|p| p.is_running())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Hands out unmanaged viewers on consecutive ports
    struct CountingFactory {
        launches: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl CountingFactory {
        fn new() -> Self {
            Self {
                launches: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: false,
            }
        }

        fn launches(&self) -> usize {
            self.launches.load(Ordering::SeqCst)
        }
    }

    impl ViewerFactory for CountingFactory {
        fn launch<'a>(
            &'a self,
            owner: &'a str,
            workspace: &'a Path,
        ) -> BoxFuture<'a, Result<ViewerProcess, LaunchError>> {
            Box::pin(async move {
                let n = self.launches.fetch_add(1, Ordering::SeqCst) as u16;
                tokio::time::sleep(self.delay).await;
                if self.fail {
                    return Err(LaunchError::Other("boom".to_string()));
                }
                let address = SocketAddr::from(([127, 0, 0, 1], 9000 + n));
                Ok(ViewerProcess::unmanaged(owner, workspace, address))
            })
        }
    }

    fn registry() -> Arc<ProcessRegistry> {
        ProcessRegistry::new(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_launch_or_reuse_is_idempotent() {
        let registry = registry();
        let factory = CountingFactory::new();
        let ws = Path::new("/data/a_workspace");

        let first = registry.launch_or_reuse("s1", ws, &factory).await.unwrap();
        let second = registry.launch_or_reuse("s1", ws, &factory).await.unwrap();

        assert_eq!(first.address(), second.address());
        assert_eq!(first.id(), second.id());
        assert_eq!(factory.launches(), 1);
        assert_eq!(registry.running_count(), 1);
    }

    #[tokio::test]
    async fn test_distinct_owners_get_distinct_viewers() {
        let registry = registry();
        let factory = CountingFactory::new();
        let ws = Path::new("/data/a_workspace");

        let a = registry.launch_or_reuse("s1", ws, &factory).await.unwrap();
        let b = registry.launch_or_reuse("s2", ws, &factory).await.unwrap();

        assert_ne!(a.address(), b.address());
        assert_eq!(factory.launches(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_launches_run_factory_once() {
        let registry = registry();
        let factory = CountingFactory {
            delay: Duration::from_millis(50),
            ..CountingFactory::new()
        };
        let ws = Path::new("/data/a_workspace");

        let (a, b) = tokio::join!(
            registry.launch_or_reuse("s1", ws, &factory),
            registry.launch_or_reuse("s1", ws, &factory),
        );

        assert_eq!(a.unwrap().id(), b.unwrap().id());
        assert_eq!(factory.launches(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let registry = registry();
        let factory = CountingFactory::new();
        let ws = Path::new("/data/a_workspace");

        let process = registry.launch_or_reuse("s1", ws, &factory).await.unwrap();
        registry.shutdown(&process).await;
        registry.shutdown(&process).await;

        assert!(!process.is_running());
        assert!(!registry.is_running("s1", ws));
        assert_eq!(registry.running_count(), 0);
    }

    #[tokio::test]
    async fn test_relaunch_after_shutdown() {
        let registry = registry();
        let factory = CountingFactory::new();
        let ws = Path::new("/data/a_workspace");

        let first = registry.launch_or_reuse("s1", ws, &factory).await.unwrap();
        registry.shutdown(&first).await;
        let second = registry.launch_or_reuse("s1", ws, &factory).await.unwrap();

        assert_ne!(first.id(), second.id());
        assert!(second.is_running());
        assert_eq!(factory.launches(), 2);
    }

    #[tokio::test]
    async fn test_stale_shutdown_keeps_newer_viewer() {
        let registry = registry();
        let factory = CountingFactory::new();
        let ws = Path::new("/data/a_workspace");

        let first = registry.launch_or_reuse("s1", ws, &factory).await.unwrap();
        registry.shutdown(&first).await;
        let second = registry.launch_or_reuse("s1", ws, &factory).await.unwrap();
        registry.shutdown(&first).await;

        assert_eq!(registry.lookup("s1", ws).unwrap().id(), second.id());
    }

    #[tokio::test]
    async fn test_factory_failure() {
        let registry = registry();
        let factory = CountingFactory {
            fail: true,
            ..CountingFactory::new()
        };
        let ws = Path::new("/data/a_workspace");

        let err = registry.launch_or_reuse("s1", ws, &factory).await.unwrap_err();
        assert!(matches!(err, RegistryError::ProcessLaunchFailed { .. }));
        assert!(err.to_string().contains("boom"));
        assert_eq!(registry.running_count(), 0);
    }

    #[tokio::test]
    async fn test_launch_locks_released_after_shutdown() {
        let registry = registry();
        let factory = CountingFactory::new();
        let ws = Path::new("/data/a_workspace");

        for i in 0..200 {
            let owner = format!("session-{}", i);
            let process = registry.launch_or_reuse(&owner, ws, &factory).await.unwrap();
            registry.shutdown(&process).await;
        }

        assert_eq!(registry.running_count(), 0);
        assert!(registry.launch_locks.is_empty());
    }

    #[tokio::test]
    async fn test_launch_locks_released_after_concurrent_launches() {
        let registry = registry();
        let factory = CountingFactory {
            delay: Duration::from_millis(20),
            ..CountingFactory::new()
        };
        let ws = Path::new("/data/a_workspace");

        let (a, b, c) = tokio::join!(
            registry.launch_or_reuse("s1", ws, &factory),
            registry.launch_or_reuse("s1", ws, &factory),
            registry.launch_or_reuse("s1", ws, &factory),
        );

        assert_eq!(a.unwrap().id(), b.unwrap().id());
        assert!(c.is_ok());
        assert_eq!(factory.launches(), 1);
        assert!(registry.launch_locks.is_empty());
    }

    #[tokio::test]
    async fn test_launch_locks_released_when_launch_cancelled() {
        let registry = registry();
        let factory = CountingFactory {
            delay: Duration::from_millis(500),
            ..CountingFactory::new()
        };
        let ws = Path::new("/data/a_workspace");

        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            registry.launch_or_reuse("s1", ws, &factory),
        )
        .await;

        assert!(cancelled.is_err());
        assert!(registry.launch_locks.is_empty());
        assert_eq!(registry.running_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_all() {
        let registry = registry();
        let factory = CountingFactory::new();

        let a = registry
            .launch_or_reuse("s1", Path::new("/data/a"), &factory)
            .await
            .unwrap();
        let b = registry
            .launch_or_reuse("s1", Path::new("/data/b"), &factory)
            .await
            .unwrap();
        registry.stop_all().await;

        assert!(!a.is_running());
        assert!(!b.is_running());
        assert_eq!(registry.running_count(), 0);
    }
}
