use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Viewer process settings
    #[serde(default)]
    pub browser: BrowserConfig,

    /// Job controller settings
    #[serde(default)]
    pub controller: ControllerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 5000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    /// Max time to wait for a viewer to answer a forwarded request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Max time to wait for the viewer's websocket handshake
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Close tunnels with no traffic for this long (0 disables)
    #[serde(default)]
    pub tunnel_idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn tunnel_idle_timeout(&self) -> Option<Duration> {
        (self.tunnel_idle_timeout_secs > 0)
            .then(|| Duration::from_secs(self.tunnel_idle_timeout_secs))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            pid_file: None,
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            tunnel_idle_timeout_secs: 0,
        }
    }
}

/// How viewer processes are started
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum BrowserMode {
    /// Local subprocess (default)
    #[default]
    Native,
    /// Docker container managed via Docker API
    Docker,
}

/// Configuration for the viewer processes
///
/// # Security Warning
///
/// In native mode the `command` and `args` fields are executed directly with the
/// permissions of the proxy process. Protect configuration files accordingly.
#[derive(Debug, Deserialize, Clone)]
pub struct BrowserConfig {
    /// Root directory that workspace paths are relative to
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,

    /// Ports handed out to viewers, start inclusive, end exclusive
    #[serde(default = "default_port_range")]
    pub port_range: (u16, u16),

    /// "native" (default) or "docker"
    #[serde(default)]
    pub mode: BrowserMode,

    /// Host the viewers listen on
    #[serde(default = "default_browser_host")]
    pub host: String,

    // === Native fields ===
    /// Command starting one viewer. Placeholders: {port} {display} {workspace} {owner}
    #[serde(default = "default_browser_command")]
    pub command: String,

    /// Arguments for the command, placeholders are expanded
    #[serde(default = "default_browser_args")]
    pub args: Vec<String>,

    /// Environment for the command, placeholders are expanded in values
    #[serde(default = "default_browser_env")]
    pub env: HashMap<String, String>,

    // === Docker fields ===
    /// Image to run in docker mode
    #[serde(default = "default_browser_image")]
    pub image: String,

    /// Port the viewer listens on inside the container
    #[serde(default = "default_container_port")]
    pub container_port: u16,

    /// Docker host URL (default: autodetect)
    pub docker_host: Option<String>,

    // === Common fields ===
    /// Wait until the viewer accepts connections before answering (0 disables)
    #[serde(default)]
    pub startup_timeout_secs: u64,

    /// Grace period between SIGTERM and SIGKILL / docker stop timeout
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl BrowserConfig {
    pub fn startup_timeout(&self) -> Option<Duration> {
        (self.startup_timeout_secs > 0).then(|| Duration::from_secs(self.startup_timeout_secs))
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Validate the viewer configuration
    pub fn validate(&self) -> Result<(), String> {
        let (start, end) = self.port_range;
        if start == 0 || start >= end {
            return Err(format!(
                "browser.port_range [{}, {}) is empty or starts at 0",
                start, end
            ));
        }

        if self.host.parse::<std::net::IpAddr>().is_err() {
            return Err(format!("browser.host '{}' is not an IP address", self.host));
        }

        match self.mode {
            BrowserMode::Native => {
                if self.command.trim().is_empty() {
                    return Err("browser.command must be set in native mode".to_string());
                }
            }
            BrowserMode::Docker => {
                if self.image.trim().is_empty() {
                    return Err("browser.image must be set in docker mode".to_string());
                }
                if self.container_port == 0 {
                    return Err("browser.container_port must not be 0".to_string());
                }
            }
        }

        Ok(())
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            workspace_dir: default_workspace_dir(),
            port_range: default_port_range(),
            mode: BrowserMode::default(),
            host: default_browser_host(),
            command: default_browser_command(),
            args: default_browser_args(),
            env: default_browser_env(),
            image: default_browser_image(),
            container_port: default_container_port(),
            docker_host: None,
            startup_timeout_secs: 0,
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

/// Where job descriptors live and how process status is queried
#[derive(Debug, Deserialize, Clone)]
pub struct ControllerConfig {
    /// Directory with one descriptor file per job
    #[serde(default = "default_job_dir")]
    pub job_dir: PathBuf,

    /// Controller host; empty means query processes locally
    #[serde(default)]
    pub host: String,

    /// SSH user for the controller host
    #[serde(default)]
    pub user: String,
}

impl ControllerConfig {
    pub fn is_remote(&self) -> bool {
        !self.host.trim().is_empty()
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            job_dir: default_job_dir(),
            host: String::new(),
            user: String::new(),
        }
    }
}

fn default_listen_port() -> u16 {
    5000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_request_timeout() -> u64 {
    30 // 30 seconds max for a viewer to respond
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from("/data")
}

fn default_port_range() -> (u16, u16) {
    (9000, 9100)
}

fn default_browser_host() -> String {
    "127.0.0.1".to_string()
}

fn default_browser_command() -> String {
    "browse-ocrd".to_string()
}

fn default_browser_args() -> Vec<String> {
    vec!["{workspace}/mets.xml".to_string()]
}

fn default_browser_env() -> HashMap<String, String> {
    HashMap::from([
        ("GDK_BACKEND".to_string(), "broadway".to_string()),
        ("BROADWAY_DISPLAY".to_string(), ":{display}".to_string()),
    ])
}

fn default_browser_image() -> String {
    "ocrd-browser:latest".to_string()
}

fn default_container_port() -> u16 {
    8085
}

fn default_shutdown_grace_period() -> u64 {
    5 // seconds between SIGTERM and SIGKILL
}

fn default_job_dir() -> PathBuf {
    PathBuf::from("/jobs")
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.browser.validate() {
            errors.push(e);
        }

        if self.server.request_timeout_secs == 0 {
            errors.push("server.request_timeout_secs must be greater than 0".to_string());
        }

        if self.server.connect_timeout_secs == 0 {
            errors.push("server.connect_timeout_secs must be greater than 0".to_string());
        }

        if self.controller.is_remote() && self.controller.user.trim().is_empty() {
            errors.push("controller.user is required when controller.host is set".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8080
bind = "127.0.0.1"
request_timeout_secs = 5
tunnel_idle_timeout_secs = 600

[browser]
workspace_dir = "/srv/workspaces"
port_range = [9000, 9010]
command = "broadway-viewer"
args = ["--port", "{port}", "{workspace}"]

[browser.env]
DISPLAY_NAME = ":{display}"

[controller]
job_dir = "/srv/jobs"
host = "controller.local"
user = "ocrd"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.request_timeout(), Duration::from_secs(5));
        assert_eq!(
            config.server.tunnel_idle_timeout(),
            Some(Duration::from_secs(600))
        );
        assert_eq!(config.browser.workspace_dir, PathBuf::from("/srv/workspaces"));
        assert_eq!(config.browser.port_range, (9000, 9010));
        assert_eq!(config.browser.mode, BrowserMode::Native);
        assert_eq!(config.browser.args, vec!["--port", "{port}", "{workspace}"]);
        assert_eq!(config.browser.env.len(), 1);
        assert!(config.controller.is_remote());
    }

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 5000);
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.tunnel_idle_timeout(), None);
    }

    #[test]
    fn test_default_browser_config() {
        let browser = BrowserConfig::default();
        assert_eq!(browser.port_range, (9000, 9100));
        assert_eq!(browser.mode, BrowserMode::Native);
        assert_eq!(browser.startup_timeout(), None);
        assert_eq!(browser.shutdown_grace_period(), Duration::from_secs(5));
        assert_eq!(browser.env.get("GDK_BACKEND"), Some(&"broadway".to_string()));
        assert!(browser.validate().is_ok());
    }

    #[test]
    fn test_docker_mode() {
        let toml = r#"
[browser]
mode = "docker"
image = "ocrd-browser:2024"
container_port = 8085
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.browser.mode, BrowserMode::Docker);
        assert_eq!(config.browser.image, "ocrd-browser:2024");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.server.port, 5000);
        assert_eq!(config.browser.workspace_dir, PathBuf::from("/data"));
        assert!(!config.controller.is_remote());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_port_range() {
        let toml = r#"
[browser]
port_range = [9100, 9000]
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("port_range"), "{}", err);
    }

    #[test]
    fn test_invalid_browser_host() {
        let browser = BrowserConfig {
            host: "localhost".to_string(),
            ..BrowserConfig::default()
        };
        assert!(browser.validate().unwrap_err().contains("browser.host"));
    }

    #[test]
    fn test_remote_controller_requires_user() {
        let toml = r#"
[controller]
host = "controller.local"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("controller.user"), "{}", err);
    }

    #[test]
    fn test_collects_multiple_errors() {
        let toml = r#"
[server]
request_timeout_secs = 0

[browser]
command = " "
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("browser.command"), "{}", err);
        assert!(err.contains("request_timeout_secs"), "{}", err);
    }
}
