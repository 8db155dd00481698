//! Module for application configuration settings.
//!
//! Settings come from a TOML file, then from `DRIVEFS_*` environment variables, then from the
//! command line, each layer overriding the previous one.

use std::path::{Path, PathBuf};
use std::time::Duration;

use drivefs::fs::MountOptions;
use secrecy::{ExposeSecret as _, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Environment variable overriding `api.client-id`.
pub const CLIENT_ID_ENV: &str = "DRIVEFS_CLIENT_ID";
/// Environment variable overriding `api.client-secret`.
pub const CLIENT_SECRET_ENV: &str = "DRIVEFS_CLIENT_SECRET";

fn current_uid() -> u32 {
    nix::unistd::Uid::current().as_raw()
}

fn current_gid() -> u32 {
    nix::unistd::Gid::current().as_raw()
}

fn default_timeout() -> u64 {
    30
}

fn default_umask() -> u16 {
    0o022
}

fn empty_secret() -> SecretString {
    SecretString::from(String::new())
}

/// Connection settings for the remote drive.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ApiConfig {
    /// Base URL of the drive API.
    #[serde(default)]
    pub base_url: String,

    /// OAuth client identifier.
    #[serde(default)]
    pub client_id: String,

    /// OAuth client secret.
    #[serde(default = "empty_secret")]
    pub client_secret: SecretString,

    /// The remote directory tree to mount.
    #[serde(default)]
    pub directory_id: String,

    /// Per-request timeout, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            client_id: String::new(),
            client_secret: empty_secret(),
            directory_id: String::new(),
            timeout: default_timeout(),
        }
    }
}

/// How the filesystem is presented locally.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MountConfig {
    /// Reject every mutation with `EROFS`.
    #[serde(default)]
    pub read_only: bool,

    /// Let users other than the mounting user access the filesystem.
    #[serde(default)]
    pub allow_other: bool,

    /// Owner reported for every file. Defaults to the current user.
    #[serde(default = "current_uid")]
    pub uid: u32,

    /// Group reported for every file. Defaults to the current group.
    #[serde(default = "current_gid")]
    pub gid: u32,

    /// Mask applied to the default `0755`/`0644` permissions.
    #[serde(default = "default_umask")]
    pub umask: u16,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            read_only: false,
            allow_other: false,
            uid: current_uid(),
            gid: current_gid(),
            umask: default_umask(),
        }
    }
}

/// Application configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Remote drive settings.
    #[serde(default)]
    pub api: ApiConfig,

    /// Local presentation settings.
    #[serde(default)]
    pub mount: MountConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl Config {
    /// Validate the correctness of the configuration.
    ///
    /// Returns every problem found rather than stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.api.base_url.is_empty() {
            errors.push("api.base-url is required.".to_owned());
        } else if !(self.api.base_url.starts_with("https://")
            || self.api.base_url.starts_with("http://"))
        {
            errors.push(format!(
                "api.base-url '{}' must be an http(s) URL.",
                self.api.base_url
            ));
        }
        if self.api.client_id.is_empty() {
            errors.push(format!(
                "api.client-id is required (or set {CLIENT_ID_ENV})."
            ));
        }
        if self.api.client_secret.expose_secret().is_empty() {
            errors.push(format!(
                "api.client-secret is required (or set {CLIENT_SECRET_ENV})."
            ));
        }
        if self.api.directory_id.is_empty() {
            errors.push("api.directory-id is required.".to_owned());
        }
        if self.api.timeout == 0 {
            errors.push("api.timeout must be at least one second.".to_owned());
        }
        if self.mount.umask > 0o777 {
            errors.push(format!(
                "mount.umask {:#o} has bits outside 0o777.",
                self.mount.umask
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Returns config file paths in descending priority order.
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("drivefs").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("drivefs").join("config.toml"));
        }

        paths.push(PathBuf::from("/etc/drivefs/config.toml"));

        paths.dedup();
        paths
    }

    /// Loads config from a single TOML file.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    /// Load the explicit file if given, else the first file found on the search path, else the
    /// defaults (which only validate once the environment supplies the rest).
    pub fn load(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = external_config_path {
            return Self::load_from_file(path);
        }

        match Self::config_search_paths().into_iter().find(|p| p.exists()) {
            Some(path) => Self::load_from_file(&path),
            None => {
                debug!("No configuration file found, starting from defaults.");
                Ok(Self::default())
            }
        }
    }

    /// Apply `DRIVEFS_*` overrides, reading variables through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup(CLIENT_ID_ENV).filter(|v| !v.is_empty()) {
            debug!("client id taken from the environment");
            self.api.client_id = id;
        }
        if let Some(secret) = lookup(CLIENT_SECRET_ENV).filter(|v| !v.is_empty()) {
            debug!("client secret taken from the environment");
            self.api.client_secret = SecretString::from(secret);
        }
    }

    /// Settings for the drive client.
    pub fn client_config(&self) -> drive_api::ClientConfig {
        drive_api::ClientConfig {
            base_url: self.api.base_url.clone(),
            client_id: self.api.client_id.clone(),
            client_secret: self.api.client_secret.clone(),
            directory_id: self.api.directory_id.clone(),
        }
    }

    /// Per-request timeout for the drive client.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout)
    }

    /// Options shaping the mounted tree.
    pub fn mount_options(&self) -> MountOptions {
        MountOptions {
            read_only: self.mount.read_only,
            uid: self.mount.uid,
            gid: self.mount.gid,
            umask: self.mount.umask,
        }
    }
}
