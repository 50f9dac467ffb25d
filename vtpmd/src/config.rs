// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Configuration & CLI (C8): process arguments plus `TPM_PATH` resolved into
//! a single `Config` the rest of the daemon is assembled from.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use clap::Parser;

use crate::storage::KeyMaterial;

/// Command-line arguments for `vtpmd`.
#[derive(Debug, Parser)]
#[command(name = "vtpmd", about = "Software TPM emulator character device")]
pub struct Args {
    /// Character device name.
    #[arg(long, default_value = "vtpm")]
    pub name: String,

    /// Character device major number. Requires `--minor`.
    #[arg(long, requires = "minor")]
    pub major: Option<u32>,

    /// Character device minor number. Requires `--major`.
    #[arg(long, requires = "major")]
    pub minor: Option<u32>,

    /// User to drop privileges to after opening the device.
    #[arg(long)]
    pub runas: Option<String>,

    /// Path to a raw 32-byte at-rest encryption key.
    #[arg(long = "key-file")]
    pub key_file: Option<PathBuf>,

    /// Path to a raw 32-byte migration encryption key.
    #[arg(long = "migration-key-file")]
    pub migration_key_file: Option<PathBuf>,

    /// Increase log verbosity (`-v` = debug, `-vv` = trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Fully resolved daemon configuration: CLI flags plus environment.
pub struct Config {
    /// Character device name.
    pub device_name: String,
    /// Character device major number, if pinned.
    pub major: Option<u32>,
    /// Character device minor number, if pinned.
    pub minor: Option<u32>,
    /// Directory persisted TPM state blobs live under, resolved from `TPM_PATH`.
    pub tpm_storage_dir: PathBuf,
    /// User to drop privileges to in `init_done`, if configured.
    pub runas: Option<String>,
    /// At-rest encryption key, if configured.
    pub file_key: Option<KeyMaterial>,
    /// Migration encryption key, if configured.
    pub migration_key: Option<KeyMaterial>,
    /// Tracing verbosity level.
    pub log_level: tracing::Level,
}

/// Errors that can occur while assembling a `Config`. All are fatal: the
/// daemon has no device and no storage root to fall back to.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `TPM_PATH` was not set in the environment.
    #[error("TPM_PATH is not set")]
    MissingTpmPath,
    /// `TPM_PATH` exists but could not be created or has the wrong shape.
    #[error("failed to prepare TPM_PATH {path}: {source}")]
    TpmPathIo {
        /// The path that failed to prepare.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// A key file was given but could not be read as exactly 32 bytes.
    #[error("key file {path} must contain exactly 32 bytes")]
    BadKeyFile {
        /// The offending key file path.
        path: PathBuf,
    },
    /// A key file was given but could not be read at all.
    #[error("failed to read key file {path}: {source}")]
    KeyFileIo {
        /// The offending key file path.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
}

fn read_key(path: &PathBuf) -> Result<KeyMaterial, ConfigError> {
    let bytes = fs::read(path).map_err(|source| ConfigError::KeyFileIo {
        path: path.clone(),
        source,
    })?;
    bytes
        .try_into()
        .map_err(|_| ConfigError::BadKeyFile { path: path.clone() })
}

impl Config {
    /// Combine `args` with the process environment into a resolved `Config`.
    /// Creates `TPM_PATH` (mode `0775`) if it doesn't exist; fails if
    /// `TPM_PATH` itself is unset.
    pub fn from_args_and_env(args: Args) -> Result<Self, ConfigError> {
        let tpm_path = std::env::var_os("TPM_PATH").ok_or(ConfigError::MissingTpmPath)?;
        let tpm_storage_dir = PathBuf::from(tpm_path);

        if !tpm_storage_dir.exists() {
            fs::create_dir_all(&tpm_storage_dir).map_err(|source| ConfigError::TpmPathIo {
                path: tpm_storage_dir.clone(),
                source,
            })?;
            let perms = fs::Permissions::from_mode(0o775);
            fs::set_permissions(&tpm_storage_dir, perms).map_err(|source| ConfigError::TpmPathIo {
                path: tpm_storage_dir.clone(),
                source,
            })?;
        }

        let file_key = args.key_file.as_ref().map(read_key).transpose()?;
        let migration_key = args.migration_key_file.as_ref().map(read_key).transpose()?;

        let log_level = match args.verbose {
            0 => tracing::Level::INFO,
            1 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        };

        Ok(Self {
            device_name: args.name,
            major: args.major,
            minor: args.minor,
            tpm_storage_dir,
            runas: args.runas,
            file_key,
            migration_key,
            log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args {
            name: "vtpm".into(),
            major: None,
            minor: None,
            runas: None,
            key_file: None,
            migration_key_file: None,
            verbose: 0,
        }
    }

    // These tests mutate process-wide environment state, so they run
    // serially via a shared lock rather than risking cross-test races.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn creates_missing_tpm_path() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let storage_root = dir.path().join("nested").join("tpm");
        std::env::set_var("TPM_PATH", &storage_root);
        let config = Config::from_args_and_env(base_args()).unwrap();
        assert!(storage_root.is_dir());
        assert_eq!(config.tpm_storage_dir, storage_root);
        std::env::remove_var("TPM_PATH");
    }

    #[test]
    fn missing_tpm_path_env_is_fatal() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("TPM_PATH");
        assert!(matches!(
            Config::from_args_and_env(base_args()),
            Err(ConfigError::MissingTpmPath)
        ));
    }

    #[test]
    fn rejects_wrong_sized_key_file() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("TPM_PATH", dir.path());
        let key_path = dir.path().join("key");
        fs::write(&key_path, b"too-short").unwrap();
        let mut args = base_args();
        args.key_file = Some(key_path);
        assert!(matches!(
            Config::from_args_and_env(args),
            Err(ConfigError::BadKeyFile { .. })
        ));
        std::env::remove_var("TPM_PATH");
    }
}
