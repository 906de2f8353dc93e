//! Broker configuration.
//!
//! Values are layered: built-in defaults, then an optional JSON file, then
//! `SMB_MANAGER_*` environment variables. Command-line flags are applied on
//! top by `main`.
//!
//! Paths that depend on the vlan (`socket_path`, `log_file`) stay `None`
//! until overridden, so changing the vlan at any layer moves them along.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::broker::registry::TeardownPolicy;
use crate::constants::{
    DEFAULT_BUFFER_SIZE, LOG_FILE_NAME, MANAGER_ROOT, MAX_BUFFER_SIZE, MAX_SOCK_PATH, MINIMUM_BUFFER_SIZE,
    SOCKET_SUFFIX,
};
use crate::permissions::{current_user_name, AccessPolicy};

/// Where log output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    /// Standard output (`-` on the command line).
    Stdout,
    /// Append to a file, rotating the previous one first.
    File(PathBuf),
}

/// Configuration for one broker instance.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    /// Namespace selecting the socket and log locations.
    pub vlan: String,
    /// Control socket path. Derived from `vlan` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
    /// Permitted users and groups (`u:name,g:gid,...`). Defaults to the
    /// current user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
    /// Board size used when a request carries a zero capacity hint.
    pub default_buffer_size: u64,
    /// Largest board a request may ask for.
    pub max_buffer_size: u64,
    /// Log file, or `-` for stdout. Derived from `vlan` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    /// What to do with channels nobody holds any more.
    pub teardown: TeardownPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            vlan: current_user_name().unwrap_or_else(|_| "default".to_string()),
            socket_path: None,
            permissions: None,
            default_buffer_size: DEFAULT_BUFFER_SIZE,
            max_buffer_size: MAX_BUFFER_SIZE,
            log_file: None,
            teardown: TeardownPolicy::default(),
        }
    }
}

impl BrokerConfig {
    /// Load defaults, then `path` if given, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("read config file {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parse config file {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `SMB_MANAGER_*` overrides looked up through `lookup`.
    ///
    /// Unparsable numeric or policy values are reported and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(vlan) = lookup("SMB_MANAGER_VLAN") {
            self.vlan = vlan;
        }

        if let Some(socket) = lookup("SMB_MANAGER_SOCKET") {
            self.socket_path = Some(PathBuf::from(socket));
        }

        if let Some(perms) = lookup("SMB_MANAGER_PERMISSIONS") {
            self.permissions = Some(perms);
        }

        if let Some(size) = lookup("SMB_MANAGER_BUFFER_SIZE") {
            match size.parse::<u64>() {
                Ok(size) => self.default_buffer_size = size,
                Err(_) => eprintln!("Warning: ignoring SMB_MANAGER_BUFFER_SIZE={size}"),
            }
        }

        if let Some(size) = lookup("SMB_MANAGER_MAX_BUFFER_SIZE") {
            match size.parse::<u64>() {
                Ok(size) => self.max_buffer_size = size,
                Err(_) => eprintln!("Warning: ignoring SMB_MANAGER_MAX_BUFFER_SIZE={size}"),
            }
        }

        if let Some(log_file) = lookup("SMB_MANAGER_LOG_FILE") {
            self.log_file = Some(PathBuf::from(log_file));
        }

        if let Some(teardown) = lookup("SMB_MANAGER_TEARDOWN") {
            match teardown.parse::<TeardownPolicy>() {
                Ok(policy) => self.teardown = policy,
                Err(e) => eprintln!("Warning: ignoring SMB_MANAGER_TEARDOWN: {e}"),
            }
        }
    }

    /// Directory holding this vlan's socket and log.
    pub fn vlan_dir(&self) -> PathBuf {
        Path::new(MANAGER_ROOT).join(&self.vlan)
    }

    /// Effective control socket path.
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| self.vlan_dir().join(SOCKET_SUFFIX))
    }

    /// Effective permission string.
    pub fn permissions(&self) -> String {
        self.permissions
            .clone()
            .unwrap_or_else(|| format!("u:{}", current_user_name().unwrap_or_else(|_| "root".to_string())))
    }

    /// Parsed access policy.
    pub fn access_policy(&self) -> Result<AccessPolicy> {
        let perms = self.permissions();
        AccessPolicy::parse(&perms).with_context(|| format!("invalid permissions '{perms}'"))
    }

    /// Effective log destination.
    pub fn log_target(&self) -> LogTarget {
        match &self.log_file {
            Some(path) if path.as_os_str() == "-" => LogTarget::Stdout,
            Some(path) => LogTarget::File(path.clone()),
            None => LogTarget::File(self.vlan_dir().join(LOG_FILE_NAME)),
        }
    }

    /// Check the combination of settings before the broker starts.
    ///
    /// `daemon` is whether the process is about to detach from its terminal.
    pub fn validate(&self, daemon: bool) -> Result<()> {
        if self.vlan.is_empty() || self.vlan.contains('/') {
            bail!("invalid vlan '{}'", self.vlan);
        }

        if self.default_buffer_size < MINIMUM_BUFFER_SIZE {
            bail!(
                "buffer size {} is below the minimum of {MINIMUM_BUFFER_SIZE} bytes",
                self.default_buffer_size
            );
        }

        if self.max_buffer_size < self.default_buffer_size {
            bail!(
                "max buffer size {} is below the default buffer size {}",
                self.max_buffer_size,
                self.default_buffer_size
            );
        }

        if daemon && self.log_target() == LogTarget::Stdout {
            bail!("--daemon requires a log file other than stdout");
        }

        let socket = self.socket_path();
        let len = socket.as_os_str().len();
        if len >= MAX_SOCK_PATH {
            bail!(
                "socket path too long ({len} >= {MAX_SOCK_PATH}): {}",
                socket.display()
            );
        }

        self.access_policy()?;
        Ok(())
    }
}
