use crate::logging::LogLevel;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs, io};

/// Configuration file looked up inside the configuration directory.
pub const CONFIG_FILENAME: &str = "msgauthrc";

/// Overrides the configuration directory.
pub const DIR_ENV: &str = "MSGAUTH_DIR";

/// When set to a non-empty value, a missing or unreadable configuration
/// file falls back to the built-in defaults instead of being fatal.
pub const TOLERATE_ENV: &str = "MSGAUTH_TOLERATE_UNCONFIGURED";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Mixed into every token digest.
    #[serde(default)]
    pub secret: String,

    /// Real delivery program and its base arguments.
    #[serde(default = "default_mail_prog", deserialize_with = "one_or_many")]
    pub mail_prog: Vec<String>,

    /// Appended to `mail_prog` for outbound mail only.
    #[serde(default, deserialize_with = "one_or_many")]
    pub extra_mail_args: Vec<String>,

    /// Domains whose confirmation notices are answered.
    #[serde(default = "default_confirm_domain", deserialize_with = "one_or_many")]
    pub confirm_domain: Vec<String>,

    /// Recipients whose mail gets an authentication token.
    #[serde(default = "default_token_recipient", deserialize_with = "one_or_many")]
    pub token_recipient: Vec<String>,

    /// Token lifetime in seconds.
    #[serde(default = "default_token_lifetime")]
    pub token_lifetime: u64,

    #[serde(default = "default_auth_field")]
    pub auth_field: String,

    /// Envelope sender used when replying to confirmation notices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation_address: Option<String>,

    /// Where token markers live; defaults to the configuration directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_dir: Option<PathBuf>,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Directory the configuration was loaded from.
    #[serde(skip)]
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_true")]
    pub stderr: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            stderr: true,
            file: None,
        }
    }
}

impl LoggingConfig {
    pub fn level(&self) -> Result<LogLevel, ConfigError> {
        self.level
            .parse()
            .map_err(|_| ConfigError::LogLevel(self.level.clone()))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            secret: String::new(),
            mail_prog: default_mail_prog(),
            extra_mail_args: Vec::new(),
            confirm_domain: default_confirm_domain(),
            token_recipient: default_token_recipient(),
            token_lifetime: default_token_lifetime(),
            auth_field: default_auth_field(),
            confirmation_address: None,
            token_dir: None,
            logging: LoggingConfig::default(),
            dir: Config::default_dir(),
        }
    }
}

/// Errors that can occur while loading or checking configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("\"{0}\" not a valid logging level")]
    LogLevel(String),
    #[error("mail_prog must name a program")]
    EmptyMailProg,
    #[error("\"{0}\" is not a valid header field name")]
    AuthField(String),
    #[error("failed to open log file {path}: {source}")]
    LogFile { path: PathBuf, source: io::Error },
}

impl Config {
    /// `~/.msgauth`
    pub fn default_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".msgauth")
    }

    pub fn dir_from_env() -> PathBuf {
        env::var_os(DIR_ENV)
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(Self::default_dir)
    }

    pub fn tolerate_from_env() -> bool {
        env::var_os(TOLERATE_ENV).is_some_and(|value| !value.is_empty())
    }

    /// Loads `msgauthrc` from `dir`. With `tolerate_unconfigured` a file
    /// that cannot be read yields the defaults; parse and validation
    /// errors are always returned.
    pub fn load(dir: &Path, tolerate_unconfigured: bool) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILENAME);
        log::trace!("config_file == {}", path.display());

        let mut config = match Self::load_from_file(&path) {
            Ok(config) => config,
            Err(ConfigError::Io { source, .. }) if tolerate_unconfigured => {
                log::debug!(
                    "Configuration file {} unreadable ({source}), using defaults",
                    path.display()
                );
                Self::default()
            }
            Err(e) => return Err(e),
        };
        config.dir = dir.to_path_buf();
        config.validate()?;

        log::trace!("option secret == {}...", truncate(&config.secret, 20));
        log::trace!("option mail_prog == {:?}", config.mail_prog);
        log::trace!("option confirm_domain == {:?}", config.confirm_domain);
        log::trace!("option token_recipient == {:?}", config.token_recipient);
        Ok(config)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(dir) = path.parent() {
            config.dir = dir.to_path_buf();
        }
        Ok(config)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.logging.level()?;
        if self.mail_prog.first().map_or(true, |prog| prog.is_empty()) {
            return Err(ConfigError::EmptyMailProg);
        }
        if !crate::message::is_field_name(&self.auth_field) {
            return Err(ConfigError::AuthField(self.auth_field.clone()));
        }
        Ok(())
    }

    pub fn token_dir(&self) -> PathBuf {
        match &self.token_dir {
            Some(dir) => expand_home(dir),
            None => self.dir.clone(),
        }
    }

    pub fn token_lifetime(&self) -> Duration {
        Duration::from_secs(self.token_lifetime)
    }

    pub fn is_token_recipient(&self, addr: &str) -> bool {
        self.token_recipient.iter().any(|r| r == addr)
    }

    pub fn is_confirm_domain(&self, domain: &str) -> bool {
        self.confirm_domain.iter().any(|d| d == domain)
    }

    /// Outbound delivery command: program, base arguments, extra
    /// arguments, then the caller's own arguments.
    pub fn outbound_command(&self, args: &[String]) -> Vec<String> {
        let mut command = self.mail_prog.clone();
        command.extend(self.extra_mail_args.iter().cloned());
        command.extend(args.iter().cloned());
        command
    }
}

/// Expands a leading `~` to the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
    })
}

fn default_mail_prog() -> Vec<String> {
    vec!["/var/qmail/bin/qmail-inject".to_string(), "-A".to_string()]
}

fn default_confirm_domain() -> Vec<String> {
    vec!["list.cr.yp.to".to_string()]
}

fn default_token_recipient() -> Vec<String> {
    vec![
        "qmail@list.cr.yp.to".to_string(),
        "log@list.cr.yp.to".to_string(),
        "dns@list.cr.yp.to".to_string(),
        "ezmlm@list.cr.yp.to".to_string(),
    ]
}

fn default_token_lifetime() -> u64 {
    3 * 86400
}

fn default_auth_field() -> String {
    "X-msgauth-token".to_string()
}

fn default_log_level() -> String {
    "WARN".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.mail_prog, vec!["/var/qmail/bin/qmail-inject", "-A"]);
        assert_eq!(config.token_lifetime, 259200);
        assert_eq!(config.auth_field, "X-msgauth-token");
        assert_eq!(config.token_recipient.len(), 4);
        assert_eq!(config.logging.level, "WARN");
        assert!(config.logging.stderr);
        assert!(config.confirmation_address.is_none());
    }

    #[test]
    fn test_parse_single_values_as_lists() {
        let config: Config = toml::from_str(
            r#"
secret = "sekrit"
mail_prog = "/usr/sbin/sendmail"
confirm_domain = "trusted.example"
token_recipient = ["list@example.org", "other@example.org"]
token_lifetime = 60
confirmation_address = "me@example.com"

[logging]
level = "TRACE"
stderr = false
file = "~/msgauth.log"
"#,
        )
        .unwrap();

        assert_eq!(config.mail_prog, vec!["/usr/sbin/sendmail"]);
        assert_eq!(config.confirm_domain, vec!["trusted.example"]);
        assert!(config.is_token_recipient("other@example.org"));
        assert!(!config.is_token_recipient("Other@example.org"));
        assert_eq!(config.token_lifetime(), Duration::from_secs(60));
        assert_eq!(config.confirmation_address.as_deref(), Some("me@example.com"));
        assert_eq!(config.logging.level().unwrap(), LogLevel::Trace);
        assert!(!config.logging.stderr);
    }

    #[test]
    fn test_load_missing_file_is_fatal_unless_tolerated() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Config::load(dir.path(), false),
            Err(ConfigError::Io { .. })
        ));

        let config = Config::load(dir.path(), true).unwrap();
        assert_eq!(config.dir, dir.path());
        assert_eq!(config.token_dir(), dir.path());
    }

    #[test]
    fn test_load_reads_config_directory() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILENAME),
            "secret = \"abc\"\nconfirm_domain = [\"a.example\", \"b.example\"]\n",
        )
        .unwrap();

        let config = Config::load(dir.path(), false).unwrap();
        assert_eq!(config.secret, "abc");
        assert!(config.is_confirm_domain("b.example"));
        assert!(!config.is_confirm_domain("sub.b.example"));
    }

    #[test]
    fn test_parse_errors_are_not_tolerated() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CONFIG_FILENAME), "secret = [").unwrap();
        assert!(matches!(
            Config::load(dir.path(), true),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = Config::default();
        config.logging.level = "LOUD".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::LogLevel(_))));

        let mut config = Config::default();
        config.mail_prog.clear();
        assert!(matches!(config.validate(), Err(ConfigError::EmptyMailProg)));

        let mut config = Config::default();
        config.auth_field = "X Token".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::AuthField(_))));
    }

    #[test]
    fn test_outbound_command_order() {
        let config = Config {
            mail_prog: vec!["inject".to_string(), "-A".to_string()],
            extra_mail_args: vec!["-x".to_string()],
            ..Config::default()
        };
        assert_eq!(
            config.outbound_command(&["rcpt@example.org".to_string()]),
            vec!["inject", "-A", "-x", "rcpt@example.org"]
        );
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        let config = Config {
            secret: "abc".to_string(),
            confirmation_address: Some("me@example.com".to_string()),
            ..Config::default()
        };
        config.to_file(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded.secret, "abc");
        assert_eq!(loaded.confirmation_address.as_deref(), Some("me@example.com"));
        assert_eq!(loaded.dir, dir.path());
    }

    #[test]
    fn test_expand_home() {
        let plain = Path::new("/var/log/msgauth.log");
        assert_eq!(expand_home(plain), plain);
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home(Path::new("~/x.log")), home.join("x.log"));
        }
    }
}
