//! Agent configuration: structs, loading, and validation.
//!
//! Sources, later ones winning:
//!
//! 1. built-in defaults
//! 2. the YAML file (`/etc/fwsync/config.yaml` unless `--config` is given); a
//!    missing file is not an error
//! 3. the legacy `KEY=value` env file (`/etc/fwsync/env`), which may set
//!    `PROJECT_ID`, `FIREWALL_ID` and `PUBLIC_IP`
//! 4. process environment variables (see [`Config::apply_env`])
//!
//! The merged result is validated once; an invalid configuration aborts
//! startup before any loop runs.

use crate::core::rule::CaseFolding;
use crate::elevation::ElevationMethod;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/fwsync/config.yaml";
pub const LEGACY_ENV_PATH: &str = "/etc/fwsync/env";

const DEFAULT_ENDPOINT: &str = "https://api.latitude.sh/agent/ping";
const DEFAULT_UFW_BINARY: &str = "/usr/sbin/ufw";
const DEFAULT_OUTPUT_FILE: &str = "/var/lib/fwsync/firewall.json";
const DEFAULT_AUDIT_PATH: &str = "/var/log/fwsync/audit.log";

// ── Config errors ──────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parse error: {0}")]
    Yaml(String),

    #[error("validation error: {field}: {message}")]
    Validation { field: String, message: String },

    #[error("invalid value '{value}' for {field}: expected {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Yaml(e.to_string())
    }
}

fn validation(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.to_string(),
        message: message.into(),
    }
}

// ── Durations ──────────────────────────────────────────────────────

/// Parses durations such as `500ms`, `30s`, `5m`, `1h` or `1m30s`.
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = Duration::ZERO;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            return Err(format!("expected a number in '{text}'"));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| format!("number too large in '{text}'"))?;
        rest = &rest[digits..];

        let unit_len = rest
            .bytes()
            .take_while(u8::is_ascii_alphabetic)
            .count();
        let part = match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.saturating_mul(60)),
            "h" => Duration::from_secs(value.saturating_mul(3600)),
            "" => return Err(format!("missing unit in '{text}' (use ms, s, m or h)")),
            other => return Err(format!("unknown unit '{other}' in '{text}'")),
        };
        total = total.saturating_add(part);
        rest = &rest[unit_len..];
    }
    Ok(total)
}

/// Formats a duration back into the config notation.
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis % 1000 != 0 {
        return format!("{millis}ms");
    }
    let secs = duration.as_secs();
    if secs != 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs != 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

/// A duration written as a string with a unit suffix in the config file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigDuration(pub Duration);

impl ConfigDuration {
    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn get(self) -> Duration {
        self.0
    }
}

impl fmt::Display for ConfigDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_duration(self.0))
    }
}

impl FromStr for ConfigDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_duration(s).map(Self)
    }
}

impl Serialize for ConfigDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ConfigDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

// ── Logging enums ──────────────────────────────────────────────────

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

// ── Sections ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentSection {
    /// Reconciliation period
    pub interval: ConfigDuration,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            interval: ConfigDuration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiSection {
    pub endpoint: String,
    /// Optional; the ping endpoint also accepts unauthenticated requests
    pub bearer_token: Option<String>,
    pub project_id: String,
    pub firewall_id: String,
    /// Address reported to the control plane to select this host's rules
    pub public_ip: String,
    pub timeout: ConfigDuration,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            bearer_token: None,
            project_id: String::new(),
            firewall_id: String::new(),
            public_ip: String::new(),
            timeout: ConfigDuration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FirewallSection {
    /// When false, desired state is fetched and snapshotted but never applied
    pub enabled: bool,
    pub ufw_binary: PathBuf,
    pub case_sensitive: bool,
    /// Last-applied snapshot; `null` disables it
    pub output_file: Option<PathBuf>,
    pub elevation: ElevationMethod,
}

impl FirewallSection {
    pub fn folding(&self) -> CaseFolding {
        CaseFolding::from_case_sensitive(self.case_sensitive)
    }
}

impl Default for FirewallSection {
    fn default() -> Self {
        Self {
            enabled: true,
            ufw_binary: PathBuf::from(DEFAULT_UFW_BINARY),
            case_sensitive: false,
            output_file: Some(PathBuf::from(DEFAULT_OUTPUT_FILE)),
            elevation: ElevationMethod::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthSection {
    pub enabled: bool,
    pub interval: ConfigDuration,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: ConfigDuration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSection {
    pub level: LogLevel,
    pub format: LogFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuditSection {
    pub enabled: bool,
    pub path: PathBuf,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from(DEFAULT_AUDIT_PATH),
        }
    }
}

// ── Top-level config ───────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub agent: AgentSection,
    pub api: ApiSection,
    pub firewall: FirewallSection,
    pub health: HealthSection,
    pub logging: LoggingSection,
    pub audit: AuditSection,
}

impl Config {
    /// Loads, merges and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Err` if a present file cannot be read or parsed, an
    /// environment override is malformed, or validation fails.
    pub fn load(path: &Path, legacy_env: &Path) -> Result<Self, ConfigError> {
        let mut config = match read_optional(path)? {
            Some(content) => Self::from_yaml(&content)?,
            None => Self::default(),
        };

        if let Some(content) = read_optional(legacy_env)? {
            config.apply_legacy_env(&content);
        }

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a YAML document; absent sections and fields take defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Applies a legacy `KEY=value` env file. Blank lines, comments and
    /// unknown keys are ignored; values may be quoted.
    pub fn apply_legacy_env(&mut self, content: &str) {
        for line in content.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
            match key.trim() {
                "PROJECT_ID" => self.api.project_id = value.to_string(),
                "FIREWALL_ID" => self.api.firewall_id = value.to_string(),
                "PUBLIC_IP" => self.api.public_ip = value.to_string(),
                _ => {}
            }
        }
    }

    /// Applies environment overrides. Empty values are ignored.
    ///
    /// | Variable            | Field                  |
    /// |---------------------|------------------------|
    /// | `FWSYNC_AUTH_TOKEN` | `api.bearer_token`     |
    /// | `PROJECT_ID`        | `api.project_id`       |
    /// | `FIREWALL_ID`       | `api.firewall_id`      |
    /// | `PUBLIC_IP`         | `api.public_ip`        |
    /// | `AGENT_INTERVAL`    | `agent.interval`       |
    /// | `LOG_LEVEL`         | `logging.level`        |
    /// | `UFW_BINARY`        | `firewall.ufw_binary`  |
    /// | `FIREWALL_ENABLED`  | `firewall.enabled`     |
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(token) = get("FWSYNC_AUTH_TOKEN") {
            self.api.bearer_token = Some(token);
        }
        if let Some(v) = get("PROJECT_ID") {
            self.api.project_id = v;
        }
        if let Some(v) = get("FIREWALL_ID") {
            self.api.firewall_id = v;
        }
        if let Some(v) = get("PUBLIC_IP") {
            self.api.public_ip = v;
        }
        if let Some(v) = get("AGENT_INTERVAL") {
            self.agent.interval = v.parse().map_err(|e: String| ConfigError::InvalidValue {
                field: "AGENT_INTERVAL".to_string(),
                value: v.clone(),
                expected: format!("a duration like 30s ({e})"),
            })?;
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.logging.level = v.parse().map_err(|_| ConfigError::InvalidValue {
                field: "LOG_LEVEL".to_string(),
                value: v.clone(),
                expected: "one of error, warn, info, debug, trace".to_string(),
            })?;
        }
        if let Some(v) = get("UFW_BINARY") {
            self.firewall.ufw_binary = PathBuf::from(v);
        }
        if let Some(v) = get("FIREWALL_ENABLED") {
            self.firewall.enabled = parse_bool(&v).ok_or_else(|| ConfigError::InvalidValue {
                field: "FIREWALL_ENABLED".to_string(),
                value: v.clone(),
                expected: "true or false".to_string(),
            })?;
        }
        Ok(())
    }

    /// Validates the merged configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.project_id.trim().is_empty() {
            return Err(validation("api.project_id", "is required (or set PROJECT_ID)"));
        }
        if self.api.firewall_id.trim().is_empty() {
            return Err(validation("api.firewall_id", "is required (or set FIREWALL_ID)"));
        }

        let endpoint = reqwest::Url::parse(&self.api.endpoint)
            .map_err(|e| validation("api.endpoint", format!("not a valid URL: {e}")))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(validation("api.endpoint", "must be an http or https URL"));
        }

        if !self.api.public_ip.is_empty()
            && self.api.public_ip.parse::<std::net::IpAddr>().is_err()
        {
            return Err(validation(
                "api.public_ip",
                format!("'{}' is not an IP address", self.api.public_ip),
            ));
        }

        for (field, value) in [
            ("agent.interval", self.agent.interval),
            ("api.timeout", self.api.timeout),
            ("health.interval", self.health.interval),
        ] {
            if value.get().is_zero() {
                return Err(validation(field, "must be greater than zero"));
            }
        }

        if self.firewall.enabled {
            crate::core::verify::check_binary(&self.firewall.ufw_binary)
                .map_err(|e| validation("firewall.ufw_binary", e))?;
        }

        if self.audit.enabled && self.audit.path.as_os_str().is_empty() {
            return Err(validation("audit.path", "is required when audit is enabled"));
        }

        Ok(())
    }

    /// Return a copy of the config with the bearer token masked.
    #[must_use]
    pub fn sanitized(&self) -> Self {
        let mut sanitized = self.clone();
        if sanitized.api.bearer_token.is_some() {
            sanitized.api.bearer_token = Some("***".to_string());
        }
        sanitized
    }

    /// Renders the (sanitized) config as YAML.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(&self.sanitized())?)
    }
}

/// Reads a file, mapping "not found" to `None`.
fn read_optional(path: &Path) -> Result<Option<String>, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Boolean spellings accepted in environment variables.
fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" | "on" => Some(true),
        "0" | "f" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
