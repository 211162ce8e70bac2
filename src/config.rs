//! `recyconnect.toml` loading and layering.
//!
//! Precedence, lowest to highest: built-in defaults, the TOML file,
//! `RECYCONNECT_*` environment variables (a `.env` file is read first), then
//! CLI flags applied by the caller.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::market::accounts::AccountPolicy;
use crate::market::models::Role;
use crate::market::server::{ServerConfig, SuperuserSeed};

pub const CONFIG_FILE: &str = "recyconnect.toml";
pub const ENV_FILE: &str = ".env";
const ENV_PREFIX: &str = "RECYCONNECT_";

/// HTTP listener and storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Permissive CORS for a local front-end dev server.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".recyconnect/recyconnect.db")
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            dev_mode: false,
        }
    }
}

/// Registration, session and bootstrap-admin settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountsSection {
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: i64,
    /// Roles that are active immediately after registering.
    #[serde(default = "default_auto_approve_roles")]
    pub auto_approve_roles: Vec<Role>,
    #[serde(default)]
    pub superuser_email: Option<String>,
    /// Only read from the environment; never written back to disk.
    #[serde(default, skip_serializing)]
    pub superuser_password: Option<String>,
}

fn default_session_ttl_hours() -> i64 {
    AccountPolicy::default().session_ttl_hours
}

fn default_auto_approve_roles() -> Vec<Role> {
    AccountPolicy::default().auto_approve_roles
}

impl Default for AccountsSection {
    fn default() -> Self {
        Self {
            session_ttl_hours: default_session_ttl_hours(),
            auto_approve_roles: default_auto_approve_roles(),
            superuser_email: None,
            superuser_password: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("expected pretty or json, got {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Default filter directive; `RUST_LOG` wins when set.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Directory for a daily rolling log file, in addition to stderr.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            dir: None,
        }
    }
}

/// The complete recyconnect.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub accounts: AccountsSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from `path` if it exists, otherwise start from defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// File, then `.env`, then process environment.
    pub fn resolve(path: &Path) -> Result<Self, ConfigError> {
        load_env_file(Path::new(ENV_FILE))?;
        let mut config = Self::load_or_default(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `RECYCONNECT_*` overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.is_empty());

        if let Some(host) = var("HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("PORT") {
            self.server.port = parse_value("RECYCONNECT_PORT", &port)?;
        }
        if let Some(path) = var("DB_PATH") {
            self.server.db_path = PathBuf::from(path);
        }
        if let Some(dev) = var("DEV_MODE") {
            self.server.dev_mode = parse_bool("RECYCONNECT_DEV_MODE", &dev)?;
        }
        if let Some(ttl) = var("SESSION_TTL_HOURS") {
            self.accounts.session_ttl_hours = parse_value("RECYCONNECT_SESSION_TTL_HOURS", &ttl)?;
        }
        if let Some(roles) = var("AUTO_APPROVE_ROLES") {
            self.accounts.auto_approve_roles = roles
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(|r| parse_value("RECYCONNECT_AUTO_APPROVE_ROLES", r))
                .collect::<Result<_, _>>()?;
        }
        if let Some(email) = var("SUPERUSER_EMAIL") {
            self.accounts.superuser_email = Some(email);
        }
        if let Some(password) = var("SUPERUSER_PASSWORD") {
            self.accounts.superuser_password = Some(password);
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("LOG_FORMAT") {
            self.logging.format = parse_value("RECYCONNECT_LOG_FORMAT", &format)?;
        }
        if let Some(dir) = var("LOG_DIR") {
            self.logging.dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    /// Validate the configuration, returning a list of problems.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.server.host.trim().is_empty() {
            problems.push("server.host must not be empty".to_string());
        }
        if self.accounts.session_ttl_hours <= 0 {
            problems.push(format!(
                "accounts.session_ttl_hours must be positive, got {}",
                self.accounts.session_ttl_hours
            ));
        }
        if self.accounts.auto_approve_roles.contains(&Role::Admin) {
            problems.push("accounts.auto_approve_roles must not include admin".to_string());
        }
        match (
            &self.accounts.superuser_email,
            &self.accounts.superuser_password,
        ) {
            (Some(_), None) => problems.push(
                "accounts.superuser_email is set but RECYCONNECT_SUPERUSER_PASSWORD is not"
                    .to_string(),
            ),
            (None, Some(_)) => problems.push(
                "RECYCONNECT_SUPERUSER_PASSWORD is set but no superuser email is configured"
                    .to_string(),
            ),
            _ => {}
        }
        problems
    }

    pub fn account_policy(&self) -> AccountPolicy {
        AccountPolicy {
            session_ttl_hours: self.accounts.session_ttl_hours,
            auto_approve_roles: self.accounts.auto_approve_roles.clone(),
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        let superuser = match (
            &self.accounts.superuser_email,
            &self.accounts.superuser_password,
        ) {
            (Some(email), Some(password)) => Some(SuperuserSeed {
                email: email.clone(),
                password: password.clone(),
            }),
            _ => None,
        };
        ServerConfig {
            host: self.server.host.clone(),
            port: self.server.port,
            db_path: self.server.db_path.clone(),
            dev_mode: self.server.dev_mode,
            policy: self.account_policy(),
            superuser,
        }
    }

    /// Render as TOML, e.g. for `config show` or `config init`.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::InvalidValue {
            key: "config".to_string(),
            message: e.to_string(),
        })
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got {}", other),
        }),
    }
}

/// Export the variables in `path` without overriding ones already set.
/// A missing file is not an error; an unreadable or malformed one is.
pub fn load_env_file(path: &Path) -> Result<bool, ConfigError> {
    match dotenvy::from_path(path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "loaded environment file");
            Ok(true)
        }
        Err(e) if e.not_found() => Ok(false),
        Err(source) => Err(ConfigError::EnvFile {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_file_missing() {
        let dir = tempdir().unwrap();
        let config = AppConfig::load_or_default(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(
            config.accounts.auto_approve_roles,
            vec![Role::Household, Role::Buyer, Role::Recycler]
        );
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(
            &path,
            r#"
[server]
port = 9090

[accounts]
auto_approve_roles = ["household"]

[logging]
format = "json"
"#,
        )
        .unwrap();
        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.accounts.auto_approve_roles, vec![Role::Household]);
        assert_eq!(config.accounts.session_ttl_hours, 24 * 14);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "[server\nport = 1").unwrap();
        let err = AppConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed { .. }));
        assert!(err.to_string().contains(CONFIG_FILE));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = AppConfig::default();
        config
            .apply_env(env(&[
                ("RECYCONNECT_PORT", "8181"),
                ("RECYCONNECT_DEV_MODE", "yes"),
                ("RECYCONNECT_AUTO_APPROVE_ROLES", "buyer, recycler"),
                ("RECYCONNECT_SUPERUSER_EMAIL", "root@example.com"),
                ("RECYCONNECT_SUPERUSER_PASSWORD", "hunter22hunter"),
                ("RECYCONNECT_LOG_FORMAT", "JSON"),
                ("RECYCONNECT_HOST", ""),
            ]))
            .unwrap();
        assert_eq!(config.server.port, 8181);
        assert!(config.server.dev_mode);
        assert_eq!(config.server.host, "127.0.0.1", "empty values are ignored");
        assert_eq!(
            config.accounts.auto_approve_roles,
            vec![Role::Buyer, Role::Recycler]
        );
        assert_eq!(config.logging.format, LogFormat::Json);

        let server = config.server_config();
        assert_eq!(server.port, 8181);
        assert_eq!(server.superuser.unwrap().email, "root@example.com");
    }

    #[test]
    fn test_env_invalid_value() {
        let mut config = AppConfig::default();
        let err = config
            .apply_env(env(&[("RECYCONNECT_PORT", "eighty")]))
            .unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "RECYCONNECT_PORT"),
            other => panic!("Expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_reports_problems() {
        let mut config = AppConfig::default();
        config.accounts.session_ttl_hours = 0;
        config.accounts.auto_approve_roles.push(Role::Admin);
        config.accounts.superuser_email = Some("root@example.com".into());
        let problems = config.validate();
        assert_eq!(problems.len(), 3);
        assert!(config.server_config().superuser.is_none());
    }

    #[test]
    fn test_to_toml_omits_password() {
        let mut config = AppConfig::default();
        config.accounts.superuser_password = Some("do-not-print".into());
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("[server]"));
        assert!(!rendered.contains("do-not-print"));
    }

    #[test]
    fn test_env_file_missing_is_ignored() {
        let dir = tempdir().unwrap();
        assert!(!load_env_file(&dir.path().join(".env")).unwrap());
    }

    #[test]
    fn test_env_file_loads_variables() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".env");
        fs::write(&path, "RECYCONNECT_ENV_FILE_FIXTURE=from-file\n").unwrap();
        assert!(load_env_file(&path).unwrap());
        assert_eq!(
            std::env::var("RECYCONNECT_ENV_FILE_FIXTURE").as_deref(),
            Ok("from-file")
        );
    }

    #[test]
    fn test_malformed_env_file_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".env");
        fs::write(&path, "RECYCONNECT_BROKEN value without equals\n").unwrap();
        let err = load_env_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::EnvFile { .. }));
        assert!(err.to_string().contains(".env"));
    }
}
