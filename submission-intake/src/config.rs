//! Storer configuration, loaded from yaml with environment substitution.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DeserializeFromStr, DurationSeconds, SerializeDisplay};

use crate::paths::StorerPaths;

const CONFIG_PATH_VARIABLE: &str = "SUBMISSION_INTAKE_CONFIG_PATH";
const DEFAULT_CONFIG_PATH: &str = "/etc/submission-intake/config.yml";

#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    pub storer: StorerConfig,
    /// Course id to the path of its configuration document
    #[serde(default)]
    pub courses: HashMap<String, PathBuf>,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

fn default_username() -> String {
    "vmchecker".to_owned()
}

/// Describes the host accepting submissions
#[derive(Debug, Serialize, Deserialize)]
pub struct StorerConfig {
    /// Directory holding the repository, index and lock files
    pub root: PathBuf,
    /// Where bundles are staged before dispatch, defaults to `<root>/tmp`
    #[serde(default)]
    pub tmp_dir: Option<PathBuf>,
    /// Account testers use to send results back
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Private key used to log in to testers
    pub ssh_identity: PathBuf,
    #[serde(default)]
    pub ssh_identity_password: Option<String>,
    /// Host keys trusted for testers that don't pin a fingerprint
    #[serde(default)]
    pub known_hosts: Option<PathBuf>,
}

impl StorerConfig {
    pub fn tmp_dir(&self) -> PathBuf {
        match &self.tmp_dir {
            Some(path) => path.clone(),
            None => StorerPaths::new(self.root.clone()).default_tmp_dir(),
        }
    }
}

#[serde_as]
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Seconds allowed to connect and authenticate to a tester
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    #[serde(default)]
    pub connect_timeout: Option<Duration>,
    /// Seconds allowed to upload one bundle
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    #[serde(default)]
    pub transfer_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, SerializeDisplay, strum::EnumString, DeserializeFromStr)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
    Disabled,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: LogLevel,
    pub log_to_console: bool,
    pub log_to_file: bool,
    /// If `log_to_file: true`, what is the directory to store logs?
    pub log_directory: PathBuf,
    pub log_as_json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_to_console: true,
            log_to_file: false,
            log_directory: "/var/log/submission-intake/".into(),
            log_as_json: false,
        }
    }
}

impl Config {
    /// Parse a configuration document after applying environment variables to it
    pub fn from_yaml(body: &str) -> Result<Self> {
        let body = environment_template::apply_env(body)?;
        Ok(serde_yaml::from_str(&body)?)
    }
}

pub async fn load_configuration(path: Option<PathBuf>) -> Result<Config> {
    // figure out which file path to use
    let path = match path {
        Some(path) => path,
        None => match std::env::var(CONFIG_PATH_VARIABLE) {
            Ok(path) => PathBuf::from(path),
            Err(std::env::VarError::NotPresent) => PathBuf::from(DEFAULT_CONFIG_PATH),
            Err(err) => return Err(err.into())
        }
    };

    let body = tokio::fs::read_to_string(&path).await
        .with_context(|| format!("Could not read configuration {}", path.to_string_lossy()))?;
    Config::from_yaml(&body)
        .with_context(|| format!("Could not parse configuration {}", path.to_string_lossy()))
}
