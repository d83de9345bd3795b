//! Configuration loader and validator for the review-emails service.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub feed: Feed,
    pub email: Email,
    pub db: Db,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    /// Verbose developer mode: extra feed diagnostics in logs.
    #[serde(default)]
    pub is_dev: bool,
    pub poll_gap_seconds: u64,
    /// Delay between retries of a temporarily failed email send.
    pub temporary_mail_retry_seconds: u64,
}

/// Review-tool feed settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Feed {
    pub host: String,
    pub token: String,
    #[serde(default = "default_story_limit")]
    pub story_limit: u32,
    /// Optional static JSON file used instead of the HTTP feed. Implies the
    /// run-once worker.
    #[serde(default)]
    pub file: Option<String>,
}

fn default_story_limit() -> u32 {
    100
}

/// Outgoing mail settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Email {
    pub from_address: String,
    pub implementation: MailImplementation,
    /// Redirect every message to this address instead of its intended
    /// recipient. Debugging aid for testing with a single mailbox.
    #[serde(default)]
    pub send_to: Option<String>,
    #[serde(default)]
    pub smtp: Option<Smtp>,
    #[serde(default)]
    pub fs: Option<FsOutput>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MailImplementation {
    Fs,
    Smtp,
}

/// SMTP relay settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Smtp {
    pub host: String,
}

/// Filesystem mail output settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FsOutput {
    pub output_path: String,
}

/// Database settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Db {
    pub url: String,
}

impl Feed {
    /// Host with any trailing slash removed, suitable for URL joining.
    pub fn normalized_host(&self) -> &str {
        self.host.trim_end_matches('/')
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.poll_gap_seconds == 0 {
        return Err(ConfigError::Invalid("app.poll_gap_seconds must be > 0"));
    }

    if cfg.feed.file.is_none() {
        if cfg.feed.host.trim().is_empty() {
            return Err(ConfigError::Invalid("feed.host must be non-empty"));
        }
        if cfg.feed.token.trim().is_empty() {
            return Err(ConfigError::Invalid("feed.token must be non-empty"));
        }
        if cfg.feed.story_limit == 0 {
            return Err(ConfigError::Invalid("feed.story_limit must be > 0"));
        }
    }

    if cfg.email.from_address.trim().is_empty() {
        return Err(ConfigError::Invalid("email.from_address must be non-empty"));
    }
    match cfg.email.implementation {
        MailImplementation::Smtp => {
            let Some(smtp) = &cfg.email.smtp else {
                return Err(ConfigError::Invalid(
                    "email.smtp section is required for the smtp implementation",
                ));
            };
            if smtp.host.trim().is_empty() {
                return Err(ConfigError::Invalid("email.smtp.host must be non-empty"));
            }
        }
        MailImplementation::Fs => {
            let Some(fs_out) = &cfg.email.fs else {
                return Err(ConfigError::Invalid(
                    "email.fs section is required for the fs implementation",
                ));
            };
            if fs_out.output_path.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "email.fs.output_path must be non-empty",
                ));
            }
        }
    }

    if cfg.db.url.trim().is_empty() {
        return Err(ConfigError::Invalid("db.url must be non-empty"));
    }

    Ok(())
}

/// Returns an example YAML document, used as a config template and by tests.
pub fn example() -> &'static str {
    r#"app:
  is_dev: true
  poll_gap_seconds: 60
  temporary_mail_retry_seconds: 30

feed:
  host: "https://reviews.example.com"
  token: "api-REVIEW_FEED_TOKEN"
  story_limit: 100

email:
  from_address: "review-notifications@example.com"
  implementation: "fs"
  fs:
    output_path: "output"

db:
  url: "sqlite://./data/review-emails.db"
"#
}
