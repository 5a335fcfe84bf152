//! Update planning.
//!
//! [`Planner`] turns a [`ChangeSet`] into a [`DisruptionPlan`]: which
//! disruptive operations are needed, the deferred disk operations, and the
//! partial update payload. Planning is pure; the few remote facts it needs
//! are passed in as [`HostFacts`].

use serde::Serialize;

use crate::classifier::{Classifier, DeferredKind, Disruption, Escalation, UpdateMode};
use crate::desired::{ChangeSet, DesiredState};
use crate::error::{ValidationError, Violations};
use crate::identity::DiskIdentity;
use crate::model::{DiskEncryption, DiskProperties, DiskUpdate, VirtualMachineUpdate};

/// A change applied to the OS disk rather than the instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum SubResourceOperation {
    ResizeOsDisk {
        disk: DiskIdentity,
        size_gb: i64,
    },
    SetOsDiskEncryptionSet {
        disk: DiskIdentity,
        disk_encryption_set_id: String,
    },
}

impl SubResourceOperation {
    pub fn disk(&self) -> &DiskIdentity {
        match self {
            Self::ResizeOsDisk { disk, .. } | Self::SetOsDiskEncryptionSet { disk, .. } => disk,
        }
    }

    pub fn payload(&self) -> DiskUpdate {
        match self {
            Self::ResizeOsDisk { size_gb, .. } => DiskUpdate {
                properties: DiskProperties {
                    disk_size_gb: Some(*size_gb),
                    encryption: None,
                },
            },
            Self::SetOsDiskEncryptionSet {
                disk_encryption_set_id,
                ..
            } => DiskUpdate {
                properties: DiskProperties {
                    disk_size_gb: None,
                    encryption: Some(DiskEncryption {
                        disk_encryption_set_id: Some(disk_encryption_set_id.clone()),
                    }),
                },
            },
        }
    }

    /// Short description for logs and the audit trail.
    pub fn describe(&self) -> String {
        match self {
            Self::ResizeOsDisk { size_gb, .. } => format!("size {size_gb} GB"),
            Self::SetOsDiskEncryptionSet {
                disk_encryption_set_id,
                ..
            } => format!("disk encryption set {disk_encryption_set_id}"),
        }
    }
}

/// What a single update pass has to do.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DisruptionPlan {
    /// Strongest disruption class among the changed attributes.
    pub disruption: Option<Disruption>,
    pub must_power_off: bool,
    pub must_deallocate: bool,
    /// Issued in order, after any disruption and before the main update.
    pub deferred: Vec<SubResourceOperation>,
    /// `None` when no in-place attribute changed.
    pub update: Option<VirtualMachineUpdate>,
}

impl DisruptionPlan {
    pub fn is_disruptive(&self) -> bool {
        self.must_power_off || self.must_deallocate
    }

    pub fn is_noop(&self) -> bool {
        !self.is_disruptive() && self.deferred.is_empty() && self.update.is_none()
    }
}

/// Remote facts planning depends on.
#[derive(Debug, Clone, Default)]
pub struct HostFacts {
    /// Sizes offered by the current host. `None` when not looked up.
    pub available_sizes: Option<Vec<String>>,
    /// The OS disk deferred operations are issued against.
    pub os_disk: Option<DiskIdentity>,
}

impl HostFacts {
    /// Case-insensitive; an unknown list counts as available.
    pub fn size_available(&self, size: &str) -> bool {
        match &self.available_sizes {
            Some(sizes) => sizes.iter().any(|s| s.eq_ignore_ascii_case(size)),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Planner {
    classifier: Classifier,
}

impl Planner {
    pub fn new(classifier: Classifier) -> Self {
        Self { classifier }
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Check the desired configuration and the changes against it. Needs no
    /// remote facts and runs before anything is read.
    pub fn validate(
        &self,
        desired: &dyn DesiredState,
        changes: &ChangeSet,
    ) -> Result<(), Violations> {
        let mut violations = match self.classifier.validate(desired) {
            Ok(()) => Violations::new(),
            Err(v) => v,
        };

        for path in changes.iter() {
            let mut rules = self.classifier.rules_for(path).peekable();
            if rules.peek().is_none() {
                violations.push(ValidationError::new(path, "is not a known attribute"));
                continue;
            }
            if let Some(rule) = rules.find(|r| r.is_create_only()) {
                violations.push(ValidationError::new(
                    rule.path,
                    "cannot be changed in place, the resource has to be replaced",
                ));
            }
        }

        if changes.touches("os_disk.disk_encryption_set_id")
            && !desired.has_value("os_disk.disk_encryption_set_id")
        {
            violations.push(ValidationError::new(
                "os_disk.disk_encryption_set_id",
                "cannot be removed once set",
            ));
        }

        violations.into_result()
    }

    /// Build the plan for `changes`.
    pub fn plan(
        &self,
        desired: &dyn DesiredState,
        changes: &ChangeSet,
        host: &HostFacts,
    ) -> Result<DisruptionPlan, Violations> {
        self.validate(desired, changes)?;

        let mut plan = DisruptionPlan::default();
        let mut update = VirtualMachineUpdate::default();
        let mut in_place = false;
        let mut violations = Violations::new();

        for rule in self
            .classifier
            .rules()
            .iter()
            .filter(|r| changes.touches(r.path))
        {
            let mut disruption = rule.disruption;
            if rule.escalation == Some(Escalation::DeallocateUnlessSizeAvailable) {
                let size = desired.get_non_empty_str(rule.path).unwrap_or_default();
                if !host.size_available(size) {
                    disruption = Disruption::PowerOffAndDeallocate;
                }
            }
            plan.disruption = plan.disruption.max(Some(disruption));
            plan.must_power_off |= disruption.requires_power_off();
            plan.must_deallocate |= disruption.requires_deallocate();

            match rule.mode {
                UpdateMode::InPlace(apply) => {
                    apply(desired, &mut update);
                    in_place = true;
                }
                UpdateMode::Deferred(kind) => match deferred(kind, desired, host) {
                    Ok(Some(op)) => plan.deferred.push(op),
                    Ok(None) => {}
                    Err(e) => violations.push(e),
                },
                UpdateMode::CreateOnly => {}
            }
        }
        violations.into_result()?;

        if in_place {
            plan.update = Some(update);
        }
        Ok(plan)
    }
}

fn deferred(
    kind: DeferredKind,
    desired: &dyn DesiredState,
    host: &HostFacts,
) -> Result<Option<SubResourceOperation>, ValidationError> {
    let disk = |path: &str| {
        host.os_disk
            .clone()
            .ok_or_else(|| ValidationError::new(path, "unable to determine the OS disk to update"))
    };

    match kind {
        DeferredKind::OsDiskSize => {
            let path = "os_disk.disk_size_gb";
            match desired.get_i64(path).filter(|s| *s > 0) {
                Some(size_gb) => Ok(Some(SubResourceOperation::ResizeOsDisk {
                    disk: disk(path)?,
                    size_gb,
                })),
                None => Ok(None),
            }
        }
        DeferredKind::OsDiskEncryptionSet => {
            let path = "os_disk.disk_encryption_set_id";
            match desired.get_non_empty_str(path) {
                Some(id) => Ok(Some(SubResourceOperation::SetOsDiskEncryptionSet {
                    disk: disk(path)?,
                    disk_encryption_set_id: id.to_string(),
                })),
                None => Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{Constraint, FieldRule};
    use crate::desired::ConfigSnapshot;
    use crate::identity::ResourceIdentity;
    use crate::payload;
    use serde_json::json;

    fn desired() -> ConfigSnapshot {
        ConfigSnapshot::from_value(&json!({
            "name": "web-01",
            "resource_group_name": "rg",
            "location": "westeurope",
            "size": "Standard_F2",
            "admin_username": "adminuser",
            "admin_password": "P@ssw0rd1234!",
            "network_interface_ids": ["/nic/web-01"],
            "os_disk": {
                "caching": "ReadWrite",
                "storage_account_type": "Standard_LRS",
                "disk_size_gb": 128
            },
            "source_image_reference": {
                "publisher": "MicrosoftWindowsServer",
                "offer": "WindowsServer",
                "sku": "2019-Datacenter",
                "version": "latest"
            },
            "tags": {"env": "dev"},
        }))
    }

    fn host() -> HostFacts {
        let vm = ResourceIdentity::new("0000", "rg", "web-01");
        HostFacts {
            available_sizes: None,
            os_disk: Some(vm.disk("web-01-os")),
        }
    }

    fn plan(desired: &ConfigSnapshot, changes: &[&str], host: &HostFacts) -> DisruptionPlan {
        Planner::default()
            .plan(desired, &ChangeSet::new(changes), host)
            .unwrap()
    }

    #[test]
    fn test_non_disruptive_changes() {
        let desired = desired()
            .with("tags", json!({"env": "prod"}))
            .with("license_type", "");
        let plan = plan(&desired, &["tags", "license_type", "patch_mode"], &host());

        assert!(!plan.must_power_off);
        assert!(!plan.must_deallocate);
        assert_eq!(plan.disruption, Some(Disruption::None));
        let update = plan.update.unwrap();
        assert_eq!(update.tags.unwrap()["env"], "prod");
        assert_eq!(update.properties.license_type.as_deref(), Some("None"));
        assert!(update.properties.hardware_profile.is_none());
    }

    #[test]
    fn test_size_on_current_host_powers_off_only() {
        let host = HostFacts {
            available_sizes: Some(vec!["standard_f4".to_string()]),
            ..host()
        };
        let plan = plan(&desired().with("size", "Standard_F4"), &["size"], &host);
        assert!(plan.must_power_off);
        assert!(!plan.must_deallocate);
    }

    #[test]
    fn test_size_unavailable_on_host_deallocates() {
        let host = HostFacts {
            available_sizes: Some(vec!["Standard_F2".to_string()]),
            ..host()
        };
        let plan = plan(&desired().with("size", "Standard_M64"), &["size"], &host);
        assert!(plan.must_power_off);
        assert!(plan.must_deallocate);
        let hardware = plan.update.unwrap().properties.hardware_profile.unwrap();
        assert_eq!(hardware.vm_size.as_deref(), Some("Standard_M64"));
    }

    #[test]
    fn test_disk_resize_is_deferred() {
        let resized = desired().with("os_disk.disk_size_gb", 256);
        let plan = plan(&resized, &["os_disk.disk_size_gb"], &host());
        assert!(plan.must_power_off);
        assert!(plan.must_deallocate);
        assert!(plan.update.is_none());
        assert_eq!(plan.deferred.len(), 1);
        assert_eq!(plan.deferred[0].disk().name(), "web-01-os");
        assert_eq!(
            plan.deferred[0].payload().properties.disk_size_gb,
            Some(256)
        );
    }

    #[test]
    fn test_disk_encryption_set_is_deferred() {
        let desired = desired().with("os_disk.disk_encryption_set_id", "/des/1");
        let plan = plan(&desired, &["os_disk.disk_encryption_set_id"], &host());

        assert!(plan.must_power_off);
        assert!(plan.must_deallocate);
        assert!(plan.update.is_none());
        assert_eq!(
            plan.deferred,
            vec![SubResourceOperation::SetOsDiskEncryptionSet {
                disk: host().os_disk.unwrap(),
                disk_encryption_set_id: "/des/1".to_string(),
            }]
        );
        assert_eq!(plan.deferred[0].describe(), "disk encryption set /des/1");
    }

    #[test]
    fn test_deferred_operations_follow_rule_order() {
        let desired = desired()
            .with("size", "Standard_F4")
            .with("os_disk.disk_encryption_set_id", "/des/1")
            .with("os_disk.disk_size_gb", 256);
        let plan = plan(
            &desired,
            &["os_disk.disk_encryption_set_id", "size", "os_disk.disk_size_gb"],
            &host(),
        );

        let kinds: Vec<String> = plan.deferred.iter().map(|op| op.describe()).collect();
        assert_eq!(kinds, vec!["size 256 GB", "disk encryption set /des/1"]);
        let hardware = plan.update.unwrap().properties.hardware_profile.unwrap();
        assert_eq!(hardware.vm_size.as_deref(), Some("Standard_F4"));
    }

    #[test]
    fn test_disk_resize_without_disk_identity() {
        let err = Planner::default()
            .plan(
                &desired().with("os_disk.disk_size_gb", 256),
                &ChangeSet::new(["os_disk.disk_size_gb"]),
                &HostFacts::default(),
            )
            .unwrap_err();
        assert!(err.mentions("os_disk.disk_size_gb"));
    }

    #[test]
    fn test_capacity_reservation_deallocates_without_power_off() {
        let plan = plan(
            &desired().with("capacity_reservation_group_id", "/crg/1"),
            &["capacity_reservation_group_id"],
            &host(),
        );
        assert!(!plan.must_power_off);
        assert!(plan.must_deallocate);
    }

    #[test]
    fn test_create_only_change_is_rejected() {
        let renamed = desired().with("admin_username", "root");
        let err = Planner::default()
            .validate(&renamed, &ChangeSet::new(["admin_username"]))
            .unwrap_err();
        assert!(err.mentions("admin_username"));

        let changes = ChangeSet::new(["os_disk.diff_disk_settings.option"]);
        let err = Planner::default()
            .validate(&desired(), &changes)
            .unwrap_err();
        assert!(err.mentions("os_disk.diff_disk_settings"));
    }

    #[test]
    fn test_unknown_attribute_is_rejected() {
        let err = Planner::default()
            .validate(&desired(), &ChangeSet::new(["flux_capacitor"]))
            .unwrap_err();
        assert!(err.mentions("flux_capacitor"));
    }

    #[test]
    fn test_removing_disk_encryption_set_is_rejected() {
        let changes = ChangeSet::new(["os_disk.disk_encryption_set_id"]);
        let err = Planner::default()
            .validate(&desired(), &changes)
            .unwrap_err();
        assert!(err.mentions("os_disk.disk_encryption_set_id"));
    }

    #[test]
    fn test_spot_fields_fail_validation() {
        let bid = desired().with("max_bid_price", 0.25);
        let err = Planner::default()
            .plan(&bid, &ChangeSet::new(["max_bid_price"]), &host())
            .unwrap_err();
        assert!(err.mentions("max_bid_price"));
    }

    #[test]
    fn test_empty_change_set_is_noop() {
        let plan = plan(&desired(), &[], &host());
        assert!(plan.is_noop());
        assert_eq!(plan.disruption, None);
    }

    static REBOOT_RULES: &[FieldRule] = &[FieldRule::in_place(
        "tags",
        Disruption::Reboot,
        payload::apply_tags,
    )];
    static NO_CONSTRAINTS: &[Constraint] = &[];

    #[test]
    fn test_reboot_class_needs_no_engine_action() {
        let planner = Planner::new(Classifier::new(REBOOT_RULES, NO_CONSTRAINTS));
        let plan = planner
            .plan(&desired(), &ChangeSet::new(["tags"]), &host())
            .unwrap();
        assert_eq!(plan.disruption, Some(Disruption::Reboot));
        assert!(!plan.is_disruptive());
        assert!(plan.update.is_some());
    }
}
