//! Test harness for reconciler integration tests
//!
//! Builds a reconciler wired to a seeded simulated control plane.

#![allow(dead_code)]

use std::sync::Arc;

use serde_json::json;

use armvm::audit::AuditLogger;
use armvm::config::VirtualMachineFeatures;
use armvm::desired::ConfigSnapshot;
use armvm::guard::LockTable;
use armvm::identity::ResourceIdentity;
use armvm::sim::{CallKind, SimulatedCloud};
use armvm::{EngineConfig, VirtualMachineReconciler};

pub const SUBSCRIPTION: &str = "11111111-2222-3333-4444-555555555555";
pub const RESOURCE_GROUP: &str = "rg-web";
pub const VM_NAME: &str = "web-01";
pub const OS_DISK_NAME: &str = "web-01-os";

pub fn identity() -> ResourceIdentity {
    ResourceIdentity::new(SUBSCRIPTION, RESOURCE_GROUP, VM_NAME)
}

/// A valid Windows VM on a managed OS disk.
pub fn base_config() -> ConfigSnapshot {
    let nic = format!(
        "/subscriptions/{SUBSCRIPTION}/resourceGroups/{RESOURCE_GROUP}/providers/Microsoft.Network/networkInterfaces/web-01-nic"
    );
    ConfigSnapshot::from_value(&json!({
        "name": VM_NAME,
        "resource_group_name": RESOURCE_GROUP,
        "location": "westeurope",
        "size": "Standard_F2",
        "admin_username": "adminuser",
        "admin_password": "P@ssw0rd1234!",
        "network_interface_ids": [nic],
        "os_disk": {
            "name": OS_DISK_NAME,
            "caching": "ReadWrite",
            "storage_account_type": "Standard_LRS",
            "disk_size_gb": 128,
        },
        "source_image_reference": {
            "publisher": "MicrosoftWindowsServer",
            "offer": "WindowsServer",
            "sku": "2019-Datacenter",
            "version": "latest",
        },
        "tags": {"env": "dev"},
    }))
}

/// The base VM on an ephemeral OS disk.
pub fn ephemeral_config() -> ConfigSnapshot {
    base_config()
        .with("os_disk.caching", "ReadOnly")
        .with("os_disk.diff_disk_settings.option", "Local")
        .without("os_disk.storage_account_type")
}

/// Engine configuration with short intervals; tests run on paused time.
pub fn engine_config() -> EngineConfig {
    EngineConfig {
        poll_interval: 1,
        delete_verify_interval: 1,
        ..EngineConfig::default()
    }
}

pub struct TestEnv {
    pub cloud: Arc<SimulatedCloud>,
    pub locks: LockTable,
    pub audit: AuditLogger,
    pub reconciler: VirtualMachineReconciler,
}

impl TestEnv {
    /// The base VM exists and is running.
    pub fn new() -> Self {
        Self::seeded(&base_config(), engine_config())
    }

    /// Nothing exists yet.
    pub fn empty() -> Self {
        Self::build(cloud(), engine_config())
    }

    pub fn with_features(features: VirtualMachineFeatures) -> Self {
        let config = EngineConfig {
            features,
            ..engine_config()
        };
        Self::seeded(&base_config(), config)
    }

    pub fn seeded(initial: &ConfigSnapshot, config: EngineConfig) -> Self {
        let cloud = cloud();
        cloud
            .seed_from_desired(&identity(), initial)
            .expect("initial configuration is valid");
        cloud.clear_calls();
        Self::build(cloud, config)
    }

    fn build(cloud: SimulatedCloud, config: EngineConfig) -> Self {
        let cloud = Arc::new(cloud);
        let locks = LockTable::new();
        let audit = AuditLogger::recording("armvm-test");
        let reconciler = VirtualMachineReconciler::new(
            SUBSCRIPTION,
            cloud.clone(),
            cloud.clone(),
            locks.clone(),
            config,
        )
        .with_audit(audit.clone());
        Self {
            cloud,
            locks,
            audit,
            reconciler,
        }
    }

    pub fn mutations(&self) -> Vec<CallKind> {
        self.cloud.mutations()
    }

    pub fn count(&self, kind: CallKind) -> usize {
        self.cloud.calls().iter().filter(|c| c.kind == kind).count()
    }
}

fn cloud() -> SimulatedCloud {
    SimulatedCloud::new().with_available_sizes(["Standard_F2", "Standard_F4"])
}
