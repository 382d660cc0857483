// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

use crate::{counter::DEFAULT_COUNTER_INDEX, error::TpmError, hierarchy::ParentRef};
use std::{
    env,
    path::{Path, PathBuf},
};

pub const DEFAULT_DEVICE: &str = "/dev/tpmrm0";
pub const SOCKET_PREFIX: &str = "unix://";

pub const ENV_DEVICE: &str = "TPM2_U2F_DEVICE";
pub const ENV_PARENT: &str = "TPM2_U2F_PARENT";
pub const ENV_COUNTER: &str = "TPM2_U2F_COUNTER";
pub const ENV_RUNTIME_DIR: &str = "XDG_RUNTIME_DIR";

/// Where the TPM is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmTarget {
    /// A character device such as `/dev/tpmrm0`.
    Device(PathBuf),
    /// A unix domain socket, written as `unix://<path>`.
    Socket(PathBuf),
}

impl TpmTarget {
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.strip_prefix(SOCKET_PREFIX) {
            Some(path) => Self::Socket(PathBuf::from(path)),
            None => Self::Device(PathBuf::from(s)),
        }
    }
}

impl Default for TpmTarget {
    fn default() -> Self {
        Self::Device(PathBuf::from(DEFAULT_DEVICE))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub target: TpmTarget,
    /// Base directory for per-session scratch directories.
    pub runtime_dir: PathBuf,
    /// Parent used when the caller passes the default sentinel.
    pub parent: ParentRef,
    pub counter_index: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: TpmTarget::default(),
            runtime_dir: env::temp_dir(),
            parent: ParentRef::Default,
            counter_index: DEFAULT_COUNTER_INDEX,
        }
    }
}

/// Parses a hex string (with or without a "0x" prefix) into a u32.
///
/// # Errors
///
/// Returns `TpmError::Config` if the string is not a valid hex integer.
pub fn parse_hex_u32(s: &str) -> Result<u32, TpmError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u32::from_str_radix(digits, 16).map_err(|e| TpmError::Config(format!("'{s}': {e}")))
}

impl Config {
    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::Config` if a variable holds an invalid value.
    pub fn from_env() -> Result<Self, TpmError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads the configuration through a variable lookup function.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::Config` if a variable holds an invalid value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, TpmError> {
        let mut config = Self::default();
        let lookup = |key: &str| lookup(key).filter(|value| !value.is_empty());

        if let Some(target) = lookup(ENV_DEVICE) {
            config.target = TpmTarget::parse(&target);
        }
        if let Some(dir) = lookup(ENV_RUNTIME_DIR) {
            config.runtime_dir = PathBuf::from(dir);
        }
        if let Some(parent) = lookup(ENV_PARENT) {
            config.parent = ParentRef::from(parse_hex_u32(&parent)?);
        }
        if let Some(index) = lookup(ENV_COUNTER) {
            config.counter_index = parse_hex_u32(&index)?;
        }
        Ok(config)
    }

    #[must_use]
    pub fn with_target(mut self, target: TpmTarget) -> Self {
        self.target = target;
        self
    }

    #[must_use]
    pub fn with_runtime_dir(mut self, dir: &Path) -> Self {
        self.runtime_dir = dir.to_path_buf();
        self
    }
}
