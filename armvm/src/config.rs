//! Engine configuration.
//!
//! Every knob is a command line flag with an `ARMVM_*` environment fallback
//! and can also be loaded from a JSON file. Durations are in seconds.

use clap::{ArgAction, Args};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-operation timeouts, in seconds.
#[derive(Args, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Timeout of a create pass in seconds
    #[arg(
        long = "create-timeout",
        env = "ARMVM_CREATE_TIMEOUT",
        default_value = "2700"
    )]
    pub create: u64,

    /// Timeout of a read pass in seconds
    #[arg(
        long = "read-timeout",
        env = "ARMVM_READ_TIMEOUT",
        default_value = "300"
    )]
    pub read: u64,

    /// Timeout of an update pass in seconds
    #[arg(
        long = "update-timeout",
        env = "ARMVM_UPDATE_TIMEOUT",
        default_value = "2700"
    )]
    pub update: u64,

    /// Timeout of a delete pass in seconds
    #[arg(
        long = "delete-timeout",
        env = "ARMVM_DELETE_TIMEOUT",
        default_value = "2700"
    )]
    pub delete: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            create: 45 * 60,
            read: 5 * 60,
            update: 45 * 60,
            delete: 45 * 60,
        }
    }
}

impl Timeouts {
    pub fn create(&self) -> Duration {
        Duration::from_secs(self.create)
    }

    pub fn read(&self) -> Duration {
        Duration::from_secs(self.read)
    }

    pub fn update(&self) -> Duration {
        Duration::from_secs(self.update)
    }

    pub fn delete(&self) -> Duration {
        Duration::from_secs(self.delete)
    }
}

/// Provider-level behaviour toggles for virtual machines.
#[derive(Args, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualMachineFeatures {
    /// Skip the power-off before delete and force the deletion
    #[arg(long, env = "ARMVM_SKIP_SHUTDOWN_AND_FORCE_DELETE")]
    pub skip_shutdown_and_force_delete: bool,

    /// Let the guest shut down gracefully when powering off before delete
    #[arg(long, env = "ARMVM_GRACEFUL_SHUTDOWN")]
    pub graceful_shutdown: bool,

    /// Delete the OS disk after the instance is deleted
    #[arg(
        long,
        env = "ARMVM_DELETE_OS_DISK_ON_DELETION",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub delete_os_disk_on_deletion: bool,
}

impl Default for VirtualMachineFeatures {
    fn default() -> Self {
        Self {
            skip_shutdown_and_force_delete: false,
            graceful_shutdown: false,
            delete_os_disk_on_deletion: true,
        }
    }
}

/// Configuration of a reconciliation engine.
#[derive(Args, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    #[command(flatten)]
    pub timeouts: Timeouts,

    #[command(flatten)]
    pub features: VirtualMachineFeatures,

    /// Interval between polls of a long-running operation, in seconds
    #[arg(long, env = "ARMVM_POLL_INTERVAL", default_value = "10")]
    pub poll_interval: u64,

    /// Interval between reads while waiting for a deleted instance to disappear, in seconds
    #[arg(long, env = "ARMVM_DELETE_VERIFY_INTERVAL", default_value = "30")]
    pub delete_verify_interval: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            features: VirtualMachineFeatures::default(),
            poll_interval: 10,
            delete_verify_interval: 30,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    pub fn delete_verify_interval(&self) -> Duration {
        Duration::from_secs(self.delete_verify_interval)
    }

    /// Load from a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        engine: EngineConfig,
    }

    #[test]
    fn test_flag_defaults_match_default_impl() {
        let cli = Cli::try_parse_from(["armvm"]).unwrap();
        assert_eq!(cli.engine, EngineConfig::default());
        assert_eq!(cli.engine.timeouts.update(), Duration::from_secs(45 * 60));
        assert_eq!(cli.engine.timeouts.read(), Duration::from_secs(5 * 60));
    }

    #[test]
    fn test_flags_override() {
        let cli = Cli::try_parse_from([
            "armvm",
            "--delete-timeout",
            "60",
            "--graceful-shutdown",
            "--delete-os-disk-on-deletion",
            "false",
            "--poll-interval",
            "2",
        ])
        .unwrap();
        assert_eq!(cli.engine.timeouts.delete(), Duration::from_secs(60));
        assert!(cli.engine.features.graceful_shutdown);
        assert!(!cli.engine.features.delete_os_disk_on_deletion);
        assert_eq!(cli.engine.poll_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_json_partial_config() {
        let config = EngineConfig::from_json(
            r#"{"features": {"skip_shutdown_and_force_delete": true}, "timeouts": {"read": 30}}"#,
        )
        .unwrap();
        assert!(config.features.skip_shutdown_and_force_delete);
        assert!(config.features.delete_os_disk_on_deletion);
        assert_eq!(config.timeouts.read(), Duration::from_secs(30));
        assert_eq!(config.timeouts.create(), Duration::from_secs(45 * 60));
        assert_eq!(config.delete_verify_interval(), Duration::from_secs(30));
    }
}
