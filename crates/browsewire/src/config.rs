//! Client configuration.
//!
//! Read once when a session is constructed and never mutated afterwards.
//! Defaults can be overridden with `with_*` builders or `BROWSEWIRE_*`
//! environment variables.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::optimizer::SnapshotPolicy;
use crate::session::SessionMode;

/// Environment flag telling the server to skip host dependency checks.
pub const SKIP_HOST_CHECK_ENV: &str = "PLAYWRIGHT_SKIP_VALIDATE_HOST_REQUIREMENTS";

const DEFAULT_PROGRAM: &str = "npx";
const DEFAULT_PACKAGE: &str = "@playwright/mcp@latest";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("server command must not be empty")]
    EmptyCommand,
}

/// Browser engine the server should drive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserFamily {
    #[default]
    Chromium,
    Chrome,
    Firefox,
    Webkit,
    Msedge,
}

impl BrowserFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chromium => "chromium",
            Self::Chrome => "chrome",
            Self::Firefox => "firefox",
            Self::Webkit => "webkit",
            Self::Msedge => "msedge",
        }
    }
}

impl FromStr for BrowserFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chromium" => Ok(Self::Chromium),
            "chrome" => Ok(Self::Chrome),
            "firefox" => Ok(Self::Firefox),
            "webkit" => Ok(Self::Webkit),
            "msedge" | "edge" => Ok(Self::Msedge),
            other => Err(format!("unknown browser family '{other}'")),
        }
    }
}

impl std::fmt::Display for BrowserFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fully resolved argument vector and environment for the server process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ServerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// `program arg arg ...` as typed on a shell, for logs and `Display`.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Identity of a session: configurations with the same key share one server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub headless: bool,
    pub browser: BrowserFamily,
    pub mode: SessionMode,
    pub command: ServerCommand,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub headless: bool,
    pub browser: BrowserFamily,
    pub snapshot_policy: SnapshotPolicy,
    /// Batches smaller than this gain nothing over single calls; an advisory is logged.
    pub batch_threshold: usize,
    pub metrics_enabled: bool,
    pub session_mode: SessionMode,
    /// Program plus leading arguments; browser and headless flags are appended.
    pub server_program: String,
    pub server_args: Vec<String>,
    /// Bound for page-action calls.
    pub call_timeout: Duration,
    /// Bound for administrative calls (close, tool listing).
    pub admin_timeout: Duration,
    /// Bound for the initialization handshake after spawn.
    pub setup_timeout: Duration,
    /// Grace period between SIGTERM and a hard kill.
    pub kill_grace: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            headless: true,
            browser: BrowserFamily::default(),
            snapshot_policy: SnapshotPolicy::default(),
            batch_threshold: 2,
            metrics_enabled: true,
            session_mode: SessionMode::default(),
            server_program: DEFAULT_PROGRAM.to_string(),
            server_args: vec![DEFAULT_PACKAGE.to_string()],
            call_timeout: Duration::from_secs(30),
            admin_timeout: Duration::from_secs(5),
            setup_timeout: Duration::from_secs(60),
            kill_grace: Duration::from_secs(3),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `BROWSEWIRE_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `BROWSEWIRE_*` key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("BROWSEWIRE_HEADLESS") {
            config.headless = parse_bool("BROWSEWIRE_HEADLESS", &v)?;
        }
        if let Some(v) = lookup("BROWSEWIRE_BROWSER") {
            config.browser = parse_with("BROWSEWIRE_BROWSER", &v)?;
        }
        if let Some(v) = lookup("BROWSEWIRE_SNAPSHOT_POLICY") {
            config.snapshot_policy = parse_with("BROWSEWIRE_SNAPSHOT_POLICY", &v)?;
        }
        if let Some(v) = lookup("BROWSEWIRE_BATCH_THRESHOLD") {
            config.batch_threshold = v.trim().parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::InvalidValue {
                    key: "BROWSEWIRE_BATCH_THRESHOLD",
                    value: v.clone(),
                    reason: e.to_string(),
                }
            })?;
        }
        if let Some(v) = lookup("BROWSEWIRE_METRICS") {
            config.metrics_enabled = parse_bool("BROWSEWIRE_METRICS", &v)?;
        }
        if let Some(v) = lookup("BROWSEWIRE_SESSION_MODE") {
            config.session_mode = parse_with("BROWSEWIRE_SESSION_MODE", &v)?;
        }
        if let Some(v) = lookup("BROWSEWIRE_SERVER_COMMAND") {
            config = config.with_server_command_line(&v)?;
        }
        if let Some(v) = lookup("BROWSEWIRE_CALL_TIMEOUT_SECS") {
            let secs: f64 = v.trim().parse().map_err(|e: std::num::ParseFloatError| {
                ConfigError::InvalidValue {
                    key: "BROWSEWIRE_CALL_TIMEOUT_SECS",
                    value: v.clone(),
                    reason: e.to_string(),
                }
            })?;
            config.call_timeout = Duration::try_from_secs_f64(secs).map_err(|e| {
                ConfigError::InvalidValue {
                    key: "BROWSEWIRE_CALL_TIMEOUT_SECS",
                    value: v.clone(),
                    reason: e.to_string(),
                }
            })?;
        }

        Ok(config)
    }

    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn with_browser(mut self, browser: BrowserFamily) -> Self {
        self.browser = browser;
        self
    }

    pub fn with_snapshot_policy(mut self, policy: SnapshotPolicy) -> Self {
        self.snapshot_policy = policy;
        self
    }

    pub fn with_batch_threshold(mut self, threshold: usize) -> Self {
        self.batch_threshold = threshold;
        self
    }

    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    pub fn with_session_mode(mut self, mode: SessionMode) -> Self {
        self.session_mode = mode;
        self
    }

    pub fn with_server(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.server_program = program.into();
        self.server_args = args;
        self
    }

    /// Split a whitespace-separated command line into program and leading args.
    pub fn with_server_command_line(self, line: &str) -> Result<Self, ConfigError> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or(ConfigError::EmptyCommand)?;
        Ok(self.with_server(program, parts.collect()))
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_admin_timeout(mut self, timeout: Duration) -> Self {
        self.admin_timeout = timeout;
        self
    }

    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Argument vector encoding browser family and headless mode, plus the
    /// host-check suppression flag.
    pub fn server_command(&self) -> ServerCommand {
        let mut cmd = ServerCommand::new(&self.server_program)
            .args(self.server_args.iter().cloned())
            .arg("--browser")
            .arg(self.browser.as_str());
        if self.headless {
            cmd = cmd.arg("--headless");
        }
        cmd.env(SKIP_HOST_CHECK_ENV, "1")
    }

    pub fn session_key(&self) -> SessionKey {
        SessionKey {
            headless: self.headless,
            browser: self.browser,
            mode: self.session_mode,
            command: self.server_command(),
        }
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

fn parse_with<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr<Err = String>,
{
    value.parse().map_err(|reason| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = ClientConfig::new();
        assert!(config.headless);
        assert_eq!(config.browser, BrowserFamily::Chromium);
        assert_eq!(config.snapshot_policy, SnapshotPolicy::Smart);
        assert_eq!(config.session_mode, SessionMode::AlwaysRun);
        assert_eq!(config.batch_threshold, 2);
        assert!(config.metrics_enabled);
        assert!(config.admin_timeout < config.call_timeout);
    }

    #[test]
    fn server_command_encodes_mode_and_browser() {
        let cmd = ClientConfig::new()
            .with_browser(BrowserFamily::Firefox)
            .server_command();
        assert_eq!(cmd.program, "npx");
        assert_eq!(
            cmd.args,
            vec!["@playwright/mcp@latest", "--browser", "firefox", "--headless"]
        );
        assert_eq!(
            cmd.env,
            vec![(SKIP_HOST_CHECK_ENV.to_string(), "1".to_string())]
        );

        let visible = ClientConfig::new().with_headless(false).server_command();
        assert!(!visible.args.iter().any(|a| a == "--headless"));
    }

    #[test]
    fn env_overrides() {
        let config = ClientConfig::from_lookup(lookup_from(&[
            ("BROWSEWIRE_HEADLESS", "false"),
            ("BROWSEWIRE_BROWSER", "webkit"),
            ("BROWSEWIRE_SNAPSHOT_POLICY", "final_only"),
            ("BROWSEWIRE_BATCH_THRESHOLD", "4"),
            ("BROWSEWIRE_METRICS", "off"),
            ("BROWSEWIRE_SESSION_MODE", "on-demand"),
            ("BROWSEWIRE_SERVER_COMMAND", "node ./server.js --port 0"),
            ("BROWSEWIRE_CALL_TIMEOUT_SECS", "2.5"),
        ]))
        .unwrap();

        assert!(!config.headless);
        assert_eq!(config.browser, BrowserFamily::Webkit);
        assert_eq!(config.snapshot_policy, SnapshotPolicy::FinalOnly);
        assert_eq!(config.batch_threshold, 4);
        assert!(!config.metrics_enabled);
        assert_eq!(config.session_mode, SessionMode::OnDemand);
        assert_eq!(config.server_program, "node");
        assert_eq!(config.server_args, vec!["./server.js", "--port", "0"]);
        assert_eq!(config.call_timeout, Duration::from_millis(2500));
    }

    #[test]
    fn invalid_env_values_are_errors() {
        let err = ClientConfig::from_lookup(lookup_from(&[("BROWSEWIRE_HEADLESS", "maybe")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "BROWSEWIRE_HEADLESS",
                ..
            }
        ));

        let err = ClientConfig::from_lookup(lookup_from(&[("BROWSEWIRE_BROWSER", "netscape")]))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid value 'netscape' for BROWSEWIRE_BROWSER: unknown browser family 'netscape'"
        );

        let err = ClientConfig::from_lookup(lookup_from(&[("BROWSEWIRE_SERVER_COMMAND", "  ")]))
            .unwrap_err();
        assert_eq!(err, ConfigError::EmptyCommand);
    }

    #[test]
    fn session_key_distinguishes_configurations() {
        let a = ClientConfig::new().session_key();
        let b = ClientConfig::new().with_headless(false).session_key();
        let c = ClientConfig::new()
            .with_snapshot_policy(SnapshotPolicy::Never)
            .session_key();
        assert_ne!(a, b);
        // Policy is a client-side concern and does not change the server identity.
        assert_eq!(a, c);
    }

    #[test]
    fn browser_family_roundtrips_through_serde() {
        assert_eq!(
            serde_json::from_str::<BrowserFamily>("\"msedge\"").unwrap(),
            BrowserFamily::Msedge
        );
        assert_eq!("Edge".parse::<BrowserFamily>().unwrap(), BrowserFamily::Msedge);
    }
}
