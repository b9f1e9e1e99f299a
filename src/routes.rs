//! Session routing table
//!
//! Maps `(session, workspace)` to the viewer serving it. Entries are written when a
//! session opens a workspace and read on every later view request.

use crate::registry::ViewerProcess;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("no route for session '{session}' and workspace {}", .workspace.display())]
    NotFound { session: String, workspace: PathBuf },
}

/// A resolved route
#[derive(Debug, Clone)]
pub struct Route {
    /// Workspace path relative to the workspace root
    pub workspace: PathBuf,
    /// The viewer behind the route
    pub process: Arc<ViewerProcess>,
}

impl Route {
    pub fn address(&self) -> SocketAddr {
        self.process.address()
    }
}

/// Routes keyed by session, then workspace
#[derive(Default)]
pub struct RouteTable {
    routes: RwLock<HashMap<String, HashMap<PathBuf, Arc<ViewerProcess>>>>,
}

impl RouteTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert or overwrite the route for the key
    pub fn record(&self, session: &str, workspace: &Path, process: Arc<ViewerProcess>) {
        debug!(session, workspace = %workspace.display(), address = %process.address(), "Recording route");
        self.routes
            .write()
            .entry(session.to_string())
            .or_default()
            .insert(workspace.to_path_buf(), process);
    }

    /// Exact lookup. Routes to terminated viewers resolve as not found.
    pub fn resolve(&self, session: &str, workspace: &Path) -> Result<Route, RouteError> {
        let routes = self.routes.read();
        routes
            .get(session)
            .filter(|_| !session.is_empty())
            .and_then(|by_workspace| by_workspace.get(workspace))
            .filter(|process| process.is_running())
            .map(|process| Route {
                workspace: workspace.to_path_buf(),
                process: Arc::clone(process),
            })
            .ok_or_else(|| not_found(session, workspace))
    }

    /// Resolve the route whose workspace is the longest component prefix of `path`
    pub fn resolve_path(&self, session: &str, path: &Path) -> Result<Route, RouteError> {
        let routes = self.routes.read();
        routes
            .get(session)
            .filter(|_| !session.is_empty())
            .and_then(|by_workspace| {
                by_workspace
                    .iter()
                    .filter(|(workspace, process)| {
                        path.starts_with(workspace) && process.is_running()
                    })
                    .max_by_key(|(workspace, _)| workspace.components().count())
            })
            .map(|(workspace, process)| Route {
                workspace: workspace.clone(),
                process: Arc::clone(process),
            })
            .ok_or_else(|| not_found(session, path))
    }

    /// Drop the route if it still points at the given viewer instance
    pub fn invalidate(&self, session: &str, workspace: &Path, process_id: Uuid) {
        let mut routes = self.routes.write();
        let Some(by_workspace) = routes.get_mut(session) else {
            return;
        };
        if by_workspace
            .get(workspace)
            .is_some_and(|p| p.id() == process_id)
        {
            by_workspace.remove(workspace);
            debug!(session, workspace = %workspace.display(), "Route invalidated");
        }
        if by_workspace.is_empty() {
            routes.remove(session);
        }
    }

    /// Number of routes across all sessions
    pub fn len(&self) -> usize {
        self.routes.read().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn not_found(session: &str, workspace: &Path) -> RouteError {
    RouteError::NotFound {
        session: session.to_string(),
        workspace: workspace.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ProcessRegistry;
    use std::time::Duration;

    fn viewer(port: u16) -> Arc<ViewerProcess> {
        Arc::new(ViewerProcess::unmanaged(
            "s1",
            "/data/a_workspace",
            SocketAddr::from(([127, 0, 0, 1], port)),
        ))
    }

    #[test]
    fn test_resolve_without_record() {
        let table = RouteTable::new();
        let err = table.resolve("s1", Path::new("a_workspace")).unwrap_err();
        assert!(matches!(err, RouteError::NotFound { .. }));
    }

    #[test]
    fn test_record_then_resolve() {
        let table = RouteTable::new();
        let process = viewer(9001);
        table.record("s1", Path::new("a_workspace"), Arc::clone(&process));

        let route = table.resolve("s1", Path::new("a_workspace")).unwrap();
        assert_eq!(route.address(), process.address());
        assert!(table.resolve("s2", Path::new("a_workspace")).is_err());
        assert!(table.resolve("s1", Path::new("another")).is_err());
    }

    #[test]
    fn test_record_overwrites() {
        let table = RouteTable::new();
        table.record("s1", Path::new("a_workspace"), viewer(9001));
        table.record("s1", Path::new("a_workspace"), viewer(9002));

        let route = table.resolve("s1", Path::new("a_workspace")).unwrap();
        assert_eq!(route.address().port(), 9002);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_empty_session_is_not_found() {
        let table = RouteTable::new();
        table.record("", Path::new("a_workspace"), viewer(9001));
        assert!(table.resolve("", Path::new("a_workspace")).is_err());
    }

    #[tokio::test]
    async fn test_terminated_viewer_is_not_resolved() {
        let table = RouteTable::new();
        let registry = ProcessRegistry::new(Duration::from_secs(1));
        let process = viewer(9001);
        table.record("s1", Path::new("a_workspace"), Arc::clone(&process));

        registry.shutdown(&process).await;

        assert!(table.resolve("s1", Path::new("a_workspace")).is_err());
    }

    #[test]
    fn test_resolve_path_prefers_longest_workspace() {
        let table = RouteTable::new();
        table.record("s1", Path::new("nested"), viewer(9001));
        table.record("s1", Path::new("nested/workspace"), viewer(9002));

        let route = table
            .resolve_path("s1", Path::new("nested/workspace/broadway.js"))
            .unwrap();
        assert_eq!(route.workspace, PathBuf::from("nested/workspace"));
        assert_eq!(route.address().port(), 9002);

        let route = table.resolve_path("s1", Path::new("nested/other")).unwrap();
        assert_eq!(route.address().port(), 9001);

        assert!(table.resolve_path("s1", Path::new("nestedworkspace")).is_err());
    }

    #[test]
    fn test_invalidate_only_matching_instance() {
        let table = RouteTable::new();
        let old = viewer(9001);
        let new = viewer(9002);
        table.record("s1", Path::new("a_workspace"), Arc::clone(&new));

        table.invalidate("s1", Path::new("a_workspace"), old.id());
        assert!(table.resolve("s1", Path::new("a_workspace")).is_ok());

        table.invalidate("s1", Path::new("a_workspace"), new.id());
        assert!(table.resolve("s1", Path::new("a_workspace")).is_err());
        assert!(table.is_empty());
    }
}
