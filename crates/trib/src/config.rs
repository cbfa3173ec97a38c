//! Layered configuration.
//!
//! Resolution order: built-in defaults, then the TOML file given with
//! `--config`, then environment variables and command line flags.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::ConnectOptions;
use crate::error::AdminError;
use crate::gossip::SignatureMode;
use crate::repair::RepairOptions;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TribConfig {
    /// AUTH password sent to every node. Empty means no AUTH.
    pub password: String,
    pub connect_timeout_ms: u64,
    pub command_timeout_ms: u64,
    /// How views are compared when checking convergence.
    pub signature: SignatureMode,
    pub repair: RepairConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    /// Wall-clock budget for one `fix` run.
    pub timeout_ms: u64,
    /// Repair passes before giving up.
    pub max_attempts: u32,
}

impl Default for TribConfig {
    fn default() -> Self {
        Self {
            password: String::new(),
            connect_timeout_ms: 10_000,
            command_timeout_ms: 5_000,
            signature: SignatureMode::Raw,
            repair: RepairConfig::default(),
        }
    }
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            max_attempts: 5,
        }
    }
}

impl TribConfig {
    /// Reads a TOML file. Missing keys keep their defaults; unknown keys
    /// are ignored.
    pub fn from_file(path: &Path) -> Result<Self, AdminError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            AdminError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        toml::from_str(&text)
            .map_err(|e| AdminError::Config(format!("invalid config {}: {e}", path.display())))
    }

    pub fn to_toml(&self) -> Result<String, AdminError> {
        toml::to_string_pretty(self).map_err(|e| AdminError::Config(e.to_string()))
    }

    /// Reads a password from `path`, trailing whitespace trimmed. Refuses
    /// to combine with a password that is already set.
    pub fn load_password_file(&mut self, path: &Path) -> Result<(), AdminError> {
        if !self.password.is_empty() {
            return Err(AdminError::Config(
                "--password and --password-file are mutually exclusive".into(),
            ));
        }
        let contents = std::fs::read_to_string(path).map_err(|e| {
            AdminError::Config(format!(
                "failed to read password file {}: {e}",
                path.display()
            ))
        })?;
        let password = contents.trim_end();
        if password.is_empty() {
            return Err(AdminError::Config(format!(
                "password file is empty: {}",
                path.display()
            )));
        }
        self.password = password.to_string();
        Ok(())
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            password: (!self.password.is_empty()).then(|| self.password.clone()),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            command_timeout: Duration::from_millis(self.command_timeout_ms),
        }
    }

    pub fn repair_options(&self) -> RepairOptions {
        RepairOptions {
            max_attempts: self.repair.max_attempts,
            timeout: Duration::from_millis(self.repair.timeout_ms),
            signature: self.signature,
            ..RepairOptions::default()
        }
    }
}
