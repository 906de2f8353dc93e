//! Log output setup.
//!
//! `env_logger` writes either to stdout or to a log file. The previous
//! run's file is kept next to it with a `.last` suffix.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::config::LogTarget;
use crate::constants::LOG_BACKUP_SUFFIX;

/// Path the previous log is moved to: `<path>.last`.
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(LOG_BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Create parent directories, rotate an existing log and open a fresh one.
pub fn prepare_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("create log dir: {}", parent.display()))?;
    }

    if path.exists() {
        let backup = backup_path(path);
        fs::rename(path, &backup)
            .with_context(|| format!("rotate log {} -> {}", path.display(), backup.display()))?;
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log file: {}", path.display()))
}

/// Install the global logger. `RUST_LOG` overrides the `info` default.
pub fn init(target: &LogTarget) -> Result<()> {
    let pipe = match target {
        LogTarget::Stdout => env_logger::Target::Stdout,
        LogTarget::File(path) => env_logger::Target::Pipe(Box::new(prepare_log_file(path)?)),
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(pipe)
        .format_timestamp_secs()
        .try_init()
        .context("install logger")
}
