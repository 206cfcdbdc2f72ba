use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Interpreter and document root
    #[serde(default)]
    pub cgi: CgiConfig,

    /// Concurrent run limits
    #[serde(default)]
    pub process: ProcessLimits,

    /// Waiting line limits
    #[serde(default)]
    pub queue: QueueLimits,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// HTTP port (default: 3000)
    #[serde(default = "default_listen_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
        }
    }
}

/// Interpreter settings
///
/// # Security Warning
///
/// `bin` is executed for every scripted request with the configured
/// arguments. Configuration files must only be writable by trusted users.
#[derive(Debug, Deserialize, Clone)]
pub struct CgiConfig {
    /// Interpreter binary (default: php-cgi)
    #[serde(default = "default_bin")]
    pub bin: String,

    /// Document root holding scripts and static files (default: current dir)
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// php.ini file or directory, passed as `-c <ini>`
    pub ini: Option<String>,

    /// Extra arguments appended after `-c <ini>`
    #[serde(default)]
    pub args: Vec<String>,

    /// URL suffix that marks a scripted page (default: .php)
    #[serde(default = "default_extension")]
    pub extension: String,

    /// Parent environment variables copied into every run
    #[serde(default = "default_pass_env")]
    pub pass_env: Vec<String>,

    /// SERVER_NAME for the CGI environment (default: host name)
    pub server_name: Option<String>,

    /// SERVER_PORT for the CGI environment (default: 80)
    #[serde(default = "default_server_port")]
    pub server_port: u16,

    /// Append the interpreter's stderr to the response body once it started
    #[serde(default)]
    pub forward_stderr: bool,

    /// Kill a running interpreter when its client disconnects
    #[serde(default)]
    pub kill_on_disconnect: bool,
}

impl Default for CgiConfig {
    fn default() -> Self {
        Self {
            bin: default_bin(),
            root: default_root(),
            ini: None,
            args: Vec::new(),
            extension: default_extension(),
            pass_env: default_pass_env(),
            server_name: None,
            server_port: default_server_port(),
            forward_stderr: false,
            kill_on_disconnect: false,
        }
    }
}

impl CgiConfig {
    /// Arguments passed to the interpreter on every run
    pub fn command_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(ref ini) = self.ini {
            args.push("-c".to_string());
            args.push(ini.clone());
        }
        args.extend(self.args.iter().cloned());
        args
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessLimits {
    /// Maximum interpreter processes running at once (default: 20)
    #[serde(default = "default_process_limit")]
    pub limit: usize,

    /// Milliseconds before a running process is killed (default: 60000)
    #[serde(default = "default_process_timeout")]
    pub timeout_ms: u64,
}

impl Default for ProcessLimits {
    fn default() -> Self {
        Self {
            limit: default_process_limit(),
            timeout_ms: default_process_timeout(),
        }
    }
}

impl ProcessLimits {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueLimits {
    /// Maximum requests waiting for a slot (default: 200, 0 disables waiting)
    #[serde(default = "default_queue_limit")]
    pub limit: usize,

    /// Milliseconds a request may wait before getting 503 (default: 600000)
    #[serde(default = "default_queue_timeout")]
    pub timeout_ms: u64,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            limit: default_queue_limit(),
            timeout_ms: default_queue_timeout(),
        }
    }
}

impl QueueLimits {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    3000
}

fn default_bin() -> String {
    "php-cgi".to_string()
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_extension() -> String {
    ".php".to_string()
}

fn default_pass_env() -> Vec<String> {
    vec!["PATH".to_string()]
}

fn default_server_port() -> u16 {
    80
}

fn default_process_limit() -> usize {
    20
}

fn default_process_timeout() -> u64 {
    60_000 // 1 minute
}

fn default_queue_limit() -> usize {
    200
}

fn default_queue_timeout() -> u64 {
    600_000 // 10 minutes
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

        if self.cgi.bin.trim().is_empty() {
            errors.push("cgi.bin must not be empty".to_string());
        }
        if !self.cgi.extension.starts_with('.') || self.cgi.extension.len() < 2 {
            errors.push(format!(
                "cgi.extension must look like '.php', got '{}'",
                self.cgi.extension
            ));
        }
        if self.process.limit == 0 {
            errors.push("process.limit must be greater than 0".to_string());
        }
        if self.process.timeout_ms == 0 {
            errors.push("process.timeout_ms must be greater than 0".to_string());
        }
        if self.queue.timeout_ms == 0 {
            errors.push("queue.timeout_ms must be greater than 0".to_string());
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
bind = "127.0.0.1"
port = 8080

[cgi]
bin = "/usr/bin/php-cgi"
root = "/srv/www"
ini = "/etc/php"
forward_stderr = true

[process]
limit = 4
timeout_ms = 1000

[queue]
limit = 1
timeout_ms = 2000
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.cgi.bin, "/usr/bin/php-cgi");
        assert_eq!(config.cgi.root, PathBuf::from("/srv/www"));
        assert!(config.cgi.forward_stderr);
        assert!(!config.cgi.kill_on_disconnect);
        assert_eq!(config.process.limit, 4);
        assert_eq!(config.process.timeout(), Duration::from_secs(1));
        assert_eq!(config.queue.limit, 1);
        assert_eq!(config.queue.timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.server.port, 3000);
        assert_eq!(config.cgi.bin, "php-cgi");
        assert_eq!(config.cgi.extension, ".php");
        assert_eq!(config.cgi.pass_env, vec!["PATH".to_string()]);
        assert_eq!(config.cgi.server_port, 80);
        assert_eq!(config.process.limit, 20);
        assert_eq!(config.process.timeout_ms, 60_000);
        assert_eq!(config.queue.limit, 200);
        assert_eq!(config.queue.timeout_ms, 600_000);
    }

    #[test]
    fn test_command_args_include_ini() {
        let mut cgi = CgiConfig::default();
        assert!(cgi.command_args().is_empty());

        cgi.ini = Some("/etc/php".to_string());
        cgi.args = vec!["-d".to_string(), "display_errors=1".to_string()];
        assert_eq!(
            cgi.command_args(),
            vec!["-c", "/etc/php", "-d", "display_errors=1"]
        );
    }

    #[test]
    fn test_queue_limit_zero_is_valid() {
        let config: Config = toml::from_str("[queue]\nlimit = 0\n").unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_multiple_errors() {
        let toml = r#"
[cgi]
bin = ""
extension = "php"

[process]
limit = 0
timeout_ms = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();

        assert!(err.contains("cgi.bin"));
        assert!(err.contains("cgi.extension"));
        assert!(err.contains("process.limit"));
        assert!(err.contains("process.timeout_ms"));
        assert!(!err.contains("queue.timeout_ms"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cgigate.toml");
        std::fs::write(&path, "[process]\nlimit = 2\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.process.limit, 2);

        std::fs::write(&path, "[process]\nlimit = 0\n").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
