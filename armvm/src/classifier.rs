//! Field change classifier.
//!
//! Two static tables drive planning:
//! - [`FieldRule`]s map an attribute path to the disruption needed before a
//!   change to it can be applied, and to how it is applied.
//! - [`Constraint`]s describe allowed values and the relations between
//!   attributes. They are checked against the whole desired configuration.
//!
//! Both tables are plain data walked by [`Classifier`]; nothing here talks to
//! the remote system.

use std::time::Duration;

use serde::Serialize;

use crate::desired::{DesiredState, Unset, paths_overlap};
use crate::error::{ValidationError, Violations};
use crate::model::VirtualMachineUpdate;
use crate::payload;

/// Minimum service interruption before a change can be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disruption {
    None,
    /// The guest restarts on its own when the change lands.
    Reboot,
    PowerOff,
    /// Deallocate directly.
    Deallocate,
    /// Power off first, then deallocate.
    PowerOffAndDeallocate,
}

impl Disruption {
    pub fn requires_power_off(self) -> bool {
        matches!(self, Self::PowerOff | Self::PowerOffAndDeallocate)
    }

    pub fn requires_deallocate(self) -> bool {
        matches!(self, Self::Deallocate | Self::PowerOffAndDeallocate)
    }
}

/// Writes the desired value of an attribute into the update payload.
pub type Apply = fn(&dyn DesiredState, &mut VirtualMachineUpdate);

/// Changes applied against the OS disk instead of the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferredKind {
    OsDiskSize,
    OsDiskEncryptionSet,
}

#[derive(Debug, Clone, Copy)]
pub enum UpdateMode {
    InPlace(Apply),
    Deferred(DeferredKind),
    /// Can only be set at creation time.
    CreateOnly,
}

/// Host-dependent disruption increase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// Deallocate as well when the target size is not offered by the
    /// current host.
    DeallocateUnlessSizeAvailable,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    pub path: &'static str,
    pub disruption: Disruption,
    pub mode: UpdateMode,
    pub escalation: Option<Escalation>,
}

impl FieldRule {
    pub const fn in_place(path: &'static str, disruption: Disruption, apply: Apply) -> Self {
        Self {
            path,
            disruption,
            mode: UpdateMode::InPlace(apply),
            escalation: None,
        }
    }

    pub const fn deferred(path: &'static str, disruption: Disruption, kind: DeferredKind) -> Self {
        Self {
            path,
            disruption,
            mode: UpdateMode::Deferred(kind),
            escalation: None,
        }
    }

    pub const fn create_only(path: &'static str) -> Self {
        Self {
            path,
            disruption: Disruption::None,
            mode: UpdateMode::CreateOnly,
            escalation: None,
        }
    }

    pub const fn escalate(mut self, escalation: Escalation) -> Self {
        self.escalation = Some(escalation);
        self
    }

    pub fn is_create_only(&self) -> bool {
        matches!(self.mode, UpdateMode::CreateOnly)
    }
}

// ============================================================================
// Constraints
// ============================================================================

/// A condition on the desired configuration.
#[derive(Debug, Clone, Copy)]
pub enum Predicate {
    /// The attribute, or any attribute beneath it, has a non-zero value.
    IsSet(&'static str),
    Equals(&'static str, &'static str),
    /// Explicitly `true`.
    IsTrue(&'static str),
    /// `true` or unset, for attributes defaulting to `true`.
    NotFalse(&'static str),
    GreaterThan(&'static str, f64),
    Not(&'static Predicate),
    AnyOf(&'static [Predicate]),
}

impl Predicate {
    pub fn holds(&self, desired: &dyn DesiredState) -> bool {
        match *self {
            Self::IsSet(path) => desired.has_block(path),
            Self::Equals(path, value) => desired.get_str(path) == Some(value),
            Self::IsTrue(path) => desired.get_bool(path) == Some(true),
            Self::NotFalse(path) => desired.get_bool(path) != Some(false),
            Self::GreaterThan(path, bound) => desired.get_f64(path).is_some_and(|v| v > bound),
            Self::Not(inner) => !inner.holds(desired),
            Self::AnyOf(all) => all.iter().any(|p| p.holds(desired)),
        }
    }
}

pub type Check = fn(&dyn DesiredState) -> Option<String>;

/// A validation rule over one or more attributes.
#[derive(Debug, Clone, Copy)]
pub enum Constraint {
    /// String value, when set, must be one of `allowed`.
    OneOf {
        path: &'static str,
        allowed: &'static [&'static str],
    },
    IntBetween {
        path: &'static str,
        min: i64,
        max: i64,
    },
    FloatAtLeast {
        path: &'static str,
        min: f64,
    },
    /// ISO 8601 duration within `min..=max`.
    DurationBetween {
        path: &'static str,
        min: Duration,
        max: Duration,
    },
    MaxItems {
        path: &'static str,
        max: usize,
    },
    Required {
        path: &'static str,
    },
    ConflictsWith {
        path: &'static str,
        others: &'static [&'static str],
    },
    ExactlyOneOf {
        paths: &'static [&'static str],
    },
    /// When `when` holds, `then` must hold too.
    Implies {
        path: &'static str,
        when: Predicate,
        then: Predicate,
        message: &'static str,
    },
    Custom {
        path: &'static str,
        check: Check,
    },
}

impl Constraint {
    /// Append every violation of this constraint to `out`.
    pub fn check(&self, desired: &dyn DesiredState, out: &mut Violations) {
        match *self {
            Self::OneOf { path, allowed } => {
                if let Some(value) = desired.get_non_empty_str(path) {
                    if !allowed.contains(&value) {
                        out.push(ValidationError::new(
                            path,
                            format!("expected one of [{}], got {value:?}", allowed.join(", ")),
                        ));
                    }
                }
            }
            Self::IntBetween { path, min, max } => {
                if let Some(value) = desired.get_i64(path) {
                    if value < min || value > max {
                        out.push(ValidationError::new(
                            path,
                            format!("expected to be in the range ({min} - {max}), got {value}"),
                        ));
                    }
                }
            }
            Self::FloatAtLeast { path, min } => {
                if let Some(value) = desired.get_f64(path) {
                    if value < min {
                        out.push(ValidationError::new(
                            path,
                            format!("expected to be at least ({min}), got {value}"),
                        ));
                    }
                }
            }
            Self::DurationBetween { path, min, max } => {
                if let Some(value) = desired.get_non_empty_str(path) {
                    match parse_iso8601_duration(value) {
                        Some(d) if d >= min && d <= max => {}
                        Some(_) => out.push(ValidationError::new(
                            path,
                            format!(
                                "expected a duration between {} and {} minutes, got {value:?}",
                                min.as_secs() / 60,
                                max.as_secs() / 60
                            ),
                        )),
                        None => out.push(ValidationError::new(
                            path,
                            format!("expected an ISO 8601 duration, got {value:?}"),
                        )),
                    }
                }
            }
            Self::MaxItems { path, max } => {
                if let Some(items) = desired.get(path).and_then(|v| v.as_array()) {
                    if items.len() > max {
                        out.push(ValidationError::new(
                            path,
                            format!("expected at most {max} items, got {}", items.len()),
                        ));
                    }
                }
            }
            Self::Required { path } => {
                if !desired.has_block(path) {
                    out.push(ValidationError::new(path, "is required"));
                }
            }
            Self::ConflictsWith { path, others } => {
                if desired.has_block(path) {
                    for other in others.iter().filter(|o| desired.has_block(o)) {
                        out.push(ValidationError::new(
                            path,
                            format!("conflicts with `{other}`"),
                        ));
                    }
                }
            }
            Self::ExactlyOneOf { paths } => {
                let set = paths.iter().filter(|p| desired.has_block(p)).count();
                if set != 1 {
                    out.push(ValidationError::new(
                        paths.join(","),
                        format!("exactly one of `{}` must be specified", paths.join("`, `")),
                    ));
                }
            }
            Self::Implies {
                path,
                when,
                then,
                message,
            } => {
                if when.holds(desired) && !then.holds(desired) {
                    out.push(ValidationError::new(path, message));
                }
            }
            Self::Custom { path, check } => {
                if let Some(message) = check(desired) {
                    out.push(ValidationError::new(path, message));
                }
            }
        }
    }
}

/// Parse `P[nD]T[nH][nM][nS]`. Years, months and weeks are not accepted.
pub fn parse_iso8601_duration(value: &str) -> Option<Duration> {
    let rest = value.strip_prefix('P')?;
    let (days, time) = match rest.split_once('T') {
        Some((days, time)) => (days, Some(time)),
        None => (rest, None),
    };

    let mut secs: u64 = 0;
    if !days.is_empty() {
        let days: u64 = days.strip_suffix('D')?.parse().ok()?;
        secs = days.checked_mul(86_400)?;
    }
    if let Some(time) = time {
        if time.is_empty() {
            return None;
        }
        let mut number = String::new();
        for c in time.chars() {
            match c {
                '0'..='9' => number.push(c),
                'H' | 'M' | 'S' => {
                    let n: u64 = number.parse().ok()?;
                    number.clear();
                    let unit = match c {
                        'H' => 3600,
                        'M' => 60,
                        _ => 1,
                    };
                    secs = secs.checked_add(n.checked_mul(unit)?)?;
                }
                _ => return None,
            }
        }
        if !number.is_empty() {
            return None;
        }
    } else if days.is_empty() {
        return None;
    }
    Some(Duration::from_secs(secs))
}

// ============================================================================
// Classifier
// ============================================================================

/// Walks the rule and constraint tables for a desired configuration.
#[derive(Debug, Clone, Copy)]
pub struct Classifier {
    rules: &'static [FieldRule],
    constraints: &'static [Constraint],
    defaults: &'static [(&'static str, Unset)],
}

impl Default for Classifier {
    fn default() -> Self {
        Self::windows_virtual_machine()
    }
}

impl Classifier {
    pub const fn new(rules: &'static [FieldRule], constraints: &'static [Constraint]) -> Self {
        Self {
            rules,
            constraints,
            defaults: &[],
        }
    }

    pub const fn with_defaults(mut self, defaults: &'static [(&'static str, Unset)]) -> Self {
        self.defaults = defaults;
        self
    }

    pub const fn windows_virtual_machine() -> Self {
        Self::new(WINDOWS_VM_RULES, WINDOWS_VM_CONSTRAINTS)
            .with_defaults(WINDOWS_VM_DEFAULTS)
    }

    pub fn rules(&self) -> &'static [FieldRule] {
        self.rules
    }

    /// How unset attributes read back from the remote.
    pub fn defaults(&self) -> &'static [(&'static str, Unset)] {
        self.defaults
    }

    /// Rules touched by a change to `path`.
    pub fn rules_for<'a>(&'a self, path: &'a str) -> impl Iterator<Item = &'static FieldRule> + 'a {
        self.rules
            .iter()
            .filter(move |r| paths_overlap(r.path, path))
    }

    /// Strongest disruption required by a change to `path`, `None` for an
    /// unknown attribute.
    pub fn classify(&self, path: &str) -> Option<Disruption> {
        self.rules_for(path).map(|r| r.disruption).max()
    }

    /// Check every constraint, collecting all violations.
    pub fn validate(&self, desired: &dyn DesiredState) -> Result<(), Violations> {
        let mut violations = Violations::new();
        for constraint in self.constraints {
            constraint.check(desired, &mut violations);
        }
        violations.into_result()
    }
}

// ============================================================================
// Windows virtual machine tables
// ============================================================================

const PATCH_MODE: &str = "patch_mode";
const AUTOMATIC_BY_PLATFORM: &str = "AutomaticByPlatform";
const SECURITY_ENCRYPTION_TYPE: &str = "os_disk.security_encryption_type";
const DISK_WITH_VM_GUEST_STATE: &str = "DiskWithVMGuestState";

/// Images that support hotpatching.
pub const HOTPATCH_SKUS: &[&str] = &[
    "2022-datacenter-azure-edition-core",
    "2022-datacenter-azure-edition-core-smalldisk",
];

pub static WINDOWS_VM_RULES: &[FieldRule] = &[
    FieldRule::in_place(
        "additional_capabilities.ultra_ssd_enabled",
        Disruption::PowerOffAndDeallocate,
        payload::apply_additional_capabilities,
    ),
    FieldRule::in_place(
        "allow_extension_operations",
        Disruption::None,
        payload::apply_allow_extension_operations,
    ),
    FieldRule::in_place(
        "boot_diagnostics",
        Disruption::None,
        payload::apply_boot_diagnostics,
    ),
    FieldRule::in_place(
        "bypass_platform_safety_checks_on_user_schedule_enabled",
        Disruption::None,
        payload::apply_patch_settings,
    ),
    FieldRule::in_place(
        "capacity_reservation_group_id",
        Disruption::Deallocate,
        payload::apply_capacity_reservation_group,
    ),
    FieldRule::in_place(
        "dedicated_host_id",
        Disruption::Deallocate,
        payload::apply_dedicated_host,
    ),
    FieldRule::in_place(
        "dedicated_host_group_id",
        Disruption::Deallocate,
        payload::apply_dedicated_host_group,
    ),
    FieldRule::in_place(
        "encryption_at_host_enabled",
        Disruption::Deallocate,
        payload::apply_encryption_at_host,
    ),
    FieldRule::in_place(
        "extensions_time_budget",
        Disruption::None,
        payload::apply_extensions_time_budget,
    ),
    FieldRule::in_place(
        "gallery_application",
        Disruption::None,
        payload::apply_gallery_applications,
    ),
    FieldRule::in_place(
        "hotpatching_enabled",
        Disruption::None,
        payload::apply_patch_settings,
    ),
    FieldRule::in_place("identity", Disruption::None, payload::apply_identity),
    FieldRule::in_place(
        "license_type",
        Disruption::None,
        payload::apply_license_type,
    ),
    FieldRule::in_place(
        "max_bid_price",
        Disruption::PowerOffAndDeallocate,
        payload::apply_max_bid_price,
    ),
    FieldRule::in_place(
        "network_interface_ids",
        Disruption::PowerOffAndDeallocate,
        payload::apply_network_interfaces,
    ),
    FieldRule::in_place(
        "os_disk.caching",
        Disruption::PowerOffAndDeallocate,
        payload::apply_os_disk,
    ),
    FieldRule::in_place(
        "os_disk.write_accelerator_enabled",
        Disruption::PowerOffAndDeallocate,
        payload::apply_os_disk,
    ),
    FieldRule::deferred(
        "os_disk.disk_size_gb",
        Disruption::PowerOffAndDeallocate,
        DeferredKind::OsDiskSize,
    ),
    FieldRule::deferred(
        "os_disk.disk_encryption_set_id",
        Disruption::PowerOffAndDeallocate,
        DeferredKind::OsDiskEncryptionSet,
    ),
    FieldRule::in_place(
        "patch_assessment_mode",
        Disruption::None,
        payload::apply_patch_settings,
    ),
    FieldRule::in_place(PATCH_MODE, Disruption::None, payload::apply_patch_settings),
    FieldRule::in_place(
        "proximity_placement_group_id",
        Disruption::PowerOffAndDeallocate,
        payload::apply_proximity_placement_group,
    ),
    FieldRule::in_place(
        "reboot_setting",
        Disruption::None,
        payload::apply_patch_settings,
    ),
    FieldRule::in_place("size", Disruption::PowerOff, payload::apply_size)
        .escalate(Escalation::DeallocateUnlessSizeAvailable),
    FieldRule::in_place("tags", Disruption::None, payload::apply_tags),
    FieldRule::in_place(
        "termination_notification",
        Disruption::None,
        payload::apply_termination_notification,
    ),
    FieldRule::in_place("user_data", Disruption::None, payload::apply_user_data),
    // set at creation time only
    FieldRule::create_only("name"),
    FieldRule::create_only("resource_group_name"),
    FieldRule::create_only("location"),
    FieldRule::create_only("admin_username"),
    FieldRule::create_only("admin_password"),
    FieldRule::create_only("availability_set_id"),
    FieldRule::create_only("computer_name"),
    FieldRule::create_only("custom_data"),
    FieldRule::create_only("edge_zone"),
    FieldRule::create_only("enable_automatic_updates"),
    FieldRule::create_only("eviction_policy"),
    FieldRule::create_only("os_disk.name"),
    FieldRule::create_only("os_disk.storage_account_type"),
    FieldRule::create_only("os_disk.diff_disk_settings"),
    FieldRule::create_only("os_disk.secure_vm_disk_encryption_set_id"),
    FieldRule::create_only(SECURITY_ENCRYPTION_TYPE),
    FieldRule::create_only("platform_fault_domain"),
    FieldRule::create_only("priority"),
    FieldRule::create_only("provision_vm_agent"),
    FieldRule::create_only("secure_boot_enabled"),
    FieldRule::create_only("source_image_id"),
    FieldRule::create_only("source_image_reference"),
    FieldRule::create_only("timezone"),
    FieldRule::create_only("virtual_machine_scale_set_id"),
    FieldRule::create_only("vtpm_enabled"),
    FieldRule::create_only("zone"),
];

pub static WINDOWS_VM_DEFAULTS: &[(&str, Unset)] = &[
    ("admin_password", Unset::WriteOnly),
    ("allow_extension_operations", Unset::Bool(true)),
    ("computer_name", Unset::Computed),
    ("custom_data", Unset::WriteOnly),
    ("enable_automatic_updates", Unset::Bool(true)),
    ("extensions_time_budget", Unset::Str("PT1H30M")),
    ("identity.principal_id", Unset::Computed),
    ("max_bid_price", Unset::Number(-1.0)),
    ("os_disk.diff_disk_settings.placement", Unset::Str("CacheDisk")),
    ("os_disk.disk_size_gb", Unset::Computed),
    ("os_disk.name", Unset::Computed),
    ("patch_assessment_mode", Unset::Str("ImageDefault")),
    ("patch_mode", Unset::Str("AutomaticByOS")),
    ("platform_fault_domain", Unset::Number(-1.0)),
    ("priority", Unset::Str("Regular")),
    ("provision_vm_agent", Unset::Bool(true)),
    ("termination_notification.timeout", Unset::Str("PT5M")),
    ("virtual_machine_id", Unset::Computed),
];

pub static WINDOWS_VM_CONSTRAINTS: &[Constraint] = &[
    // allowed values
    Constraint::OneOf {
        path: "os_disk.caching",
        allowed: &["None", "ReadOnly", "ReadWrite"],
    },
    Constraint::OneOf {
        path: "os_disk.storage_account_type",
        allowed: &[
            "Premium_LRS",
            "Standard_LRS",
            "StandardSSD_LRS",
            "StandardSSD_ZRS",
            "Premium_ZRS",
        ],
    },
    Constraint::OneOf {
        path: SECURITY_ENCRYPTION_TYPE,
        allowed: &["VMGuestStateOnly", DISK_WITH_VM_GUEST_STATE],
    },
    Constraint::OneOf {
        path: "os_disk.diff_disk_settings.option",
        allowed: &["Local"],
    },
    Constraint::OneOf {
        path: "os_disk.diff_disk_settings.placement",
        allowed: &["CacheDisk", "ResourceDisk"],
    },
    Constraint::OneOf {
        path: "priority",
        allowed: &["Regular", "Spot"],
    },
    Constraint::OneOf {
        path: "eviction_policy",
        allowed: &["Deallocate", "Delete"],
    },
    Constraint::OneOf {
        path: "license_type",
        allowed: &["None", "Windows_Client", "Windows_Server"],
    },
    Constraint::OneOf {
        path: PATCH_MODE,
        allowed: &["Manual", "AutomaticByOS", AUTOMATIC_BY_PLATFORM],
    },
    Constraint::OneOf {
        path: "patch_assessment_mode",
        allowed: &["ImageDefault", AUTOMATIC_BY_PLATFORM],
    },
    Constraint::OneOf {
        path: "reboot_setting",
        allowed: &["Always", "IfRequired", "Never"],
    },
    Constraint::OneOf {
        path: "identity.type",
        allowed: &["SystemAssigned", "UserAssigned", "SystemAssigned, UserAssigned"],
    },
    // ranges
    Constraint::IntBetween {
        path: "os_disk.disk_size_gb",
        min: 0,
        max: 4095,
    },
    Constraint::FloatAtLeast {
        path: "max_bid_price",
        min: -1.0,
    },
    Constraint::IntBetween {
        path: "platform_fault_domain",
        min: -1,
        max: i64::MAX,
    },
    Constraint::MaxItems {
        path: "gallery_application",
        max: 100,
    },
    Constraint::DurationBetween {
        path: "extensions_time_budget",
        min: Duration::from_secs(15 * 60),
        max: Duration::from_secs(120 * 60),
    },
    Constraint::DurationBetween {
        path: "termination_notification.timeout",
        min: Duration::from_secs(5 * 60),
        max: Duration::from_secs(15 * 60),
    },
    // required
    Constraint::Required { path: "size" },
    Constraint::Required {
        path: "network_interface_ids",
    },
    // conflicts
    Constraint::ConflictsWith {
        path: "availability_set_id",
        others: &[
            "capacity_reservation_group_id",
            "virtual_machine_scale_set_id",
            "zone",
        ],
    },
    Constraint::ConflictsWith {
        path: "capacity_reservation_group_id",
        others: &["proximity_placement_group_id"],
    },
    Constraint::ConflictsWith {
        path: "dedicated_host_id",
        others: &["dedicated_host_group_id"],
    },
    Constraint::ConflictsWith {
        path: "os_disk.disk_encryption_set_id",
        others: &["os_disk.secure_vm_disk_encryption_set_id"],
    },
    Constraint::ExactlyOneOf {
        paths: &["source_image_id", "source_image_reference"],
    },
    Constraint::Implies {
        path: "platform_fault_domain",
        when: Predicate::GreaterThan("platform_fault_domain", -1.0),
        then: Predicate::IsSet("virtual_machine_scale_set_id"),
        message: "`virtual_machine_scale_set_id` is required when `platform_fault_domain` is set",
    },
    // spot
    Constraint::Implies {
        path: "eviction_policy",
        when: Predicate::IsSet("eviction_policy"),
        then: Predicate::Equals("priority", "Spot"),
        message: "an `eviction_policy` can only be specified when `priority` is set to `Spot`",
    },
    Constraint::Implies {
        path: "eviction_policy",
        when: Predicate::Equals("priority", "Spot"),
        then: Predicate::IsSet("eviction_policy"),
        message: "an `eviction_policy` must be specified when `priority` is set to `Spot`",
    },
    Constraint::Implies {
        path: "max_bid_price",
        when: Predicate::GreaterThan("max_bid_price", 0.0),
        then: Predicate::Equals("priority", "Spot"),
        message: "`max_bid_price` can only be configured when `priority` is set to `Spot`",
    },
    // patching
    Constraint::Implies {
        path: "reboot_setting",
        when: Predicate::IsSet("reboot_setting"),
        then: Predicate::Equals(PATCH_MODE, AUTOMATIC_BY_PLATFORM),
        message: "`reboot_setting` can only be set when `patch_mode` is `AutomaticByPlatform`",
    },
    Constraint::Implies {
        path: "bypass_platform_safety_checks_on_user_schedule_enabled",
        when: Predicate::IsTrue("bypass_platform_safety_checks_on_user_schedule_enabled"),
        then: Predicate::Equals(PATCH_MODE, AUTOMATIC_BY_PLATFORM),
        message: "`bypass_platform_safety_checks_on_user_schedule_enabled` can only be set to `true` when `patch_mode` is `AutomaticByPlatform`",
    },
    Constraint::Implies {
        path: PATCH_MODE,
        when: Predicate::Equals(PATCH_MODE, AUTOMATIC_BY_PLATFORM),
        then: Predicate::NotFalse("provision_vm_agent"),
        message: "when `patch_mode` is `AutomaticByPlatform` the `provision_vm_agent` field must be set to `true`",
    },
    Constraint::Implies {
        path: "patch_assessment_mode",
        when: Predicate::Equals("patch_assessment_mode", AUTOMATIC_BY_PLATFORM),
        then: Predicate::NotFalse("provision_vm_agent"),
        message: "when `patch_assessment_mode` is `AutomaticByPlatform` the `provision_vm_agent` field must be set to `true`",
    },
    Constraint::Implies {
        path: "allow_extension_operations",
        when: Predicate::NotFalse("allow_extension_operations"),
        then: Predicate::NotFalse("provision_vm_agent"),
        message: "`allow_extension_operations` cannot be set to `true` when `provision_vm_agent` is set to `false`",
    },
    Constraint::Implies {
        path: "hotpatching_enabled",
        when: Predicate::IsTrue("hotpatching_enabled"),
        then: Predicate::Equals(PATCH_MODE, AUTOMATIC_BY_PLATFORM),
        message: "`patch_mode` must be `AutomaticByPlatform` when `hotpatching_enabled` is `true`",
    },
    Constraint::Implies {
        path: "hotpatching_enabled",
        when: Predicate::IsTrue("hotpatching_enabled"),
        then: Predicate::NotFalse("provision_vm_agent"),
        message: "`provision_vm_agent` must be `true` when `hotpatching_enabled` is `true`",
    },
    Constraint::Custom {
        path: "hotpatching_enabled",
        check: check_hotpatch_image,
    },
    Constraint::Custom {
        path: "source_image_reference",
        check: check_hotpatch_image_patch_mode,
    },
    // confidential VM
    Constraint::Implies {
        path: "os_disk.secure_vm_disk_encryption_set_id",
        when: Predicate::IsSet("os_disk.secure_vm_disk_encryption_set_id"),
        then: Predicate::Equals(SECURITY_ENCRYPTION_TYPE, DISK_WITH_VM_GUEST_STATE),
        message: "`secure_vm_disk_encryption_set_id` can only be specified when `security_encryption_type` is set to `DiskWithVMGuestState`",
    },
    Constraint::Implies {
        path: "encryption_at_host_enabled",
        when: Predicate::IsTrue("encryption_at_host_enabled"),
        then: Predicate::Not(&Predicate::Equals(
            SECURITY_ENCRYPTION_TYPE,
            DISK_WITH_VM_GUEST_STATE,
        )),
        message: "`encryption_at_host_enabled` cannot be set to `true` when `os_disk.security_encryption_type` is set to `DiskWithVMGuestState`",
    },
    Constraint::Implies {
        path: "vtpm_enabled",
        when: Predicate::IsSet(SECURITY_ENCRYPTION_TYPE),
        then: Predicate::IsTrue("vtpm_enabled"),
        message: "`vtpm_enabled` must be set to `true` when `os_disk.security_encryption_type` is specified",
    },
    Constraint::Implies {
        path: "secure_boot_enabled",
        when: Predicate::Equals(SECURITY_ENCRYPTION_TYPE, DISK_WITH_VM_GUEST_STATE),
        then: Predicate::IsTrue("secure_boot_enabled"),
        message: "`secure_boot_enabled` must be set to `true` when `os_disk.security_encryption_type` is set to `DiskWithVMGuestState`",
    },
    // ephemeral OS disk
    Constraint::Implies {
        path: "os_disk.caching",
        when: Predicate::IsSet("os_disk.diff_disk_settings"),
        then: Predicate::Equals("os_disk.caching", "ReadOnly"),
        message: "`caching` must be set to `ReadOnly` when `diff_disk_settings` is specified",
    },
    // identity
    Constraint::Implies {
        path: "identity.identity_ids",
        when: Predicate::AnyOf(&[
            Predicate::Equals("identity.type", "UserAssigned"),
            Predicate::Equals("identity.type", "SystemAssigned, UserAssigned"),
        ]),
        then: Predicate::IsSet("identity.identity_ids"),
        message: "`identity_ids` must be specified when `type` includes `UserAssigned`",
    },
    Constraint::Implies {
        path: "identity.identity_ids",
        when: Predicate::Equals("identity.type", "SystemAssigned"),
        then: Predicate::Not(&Predicate::IsSet("identity.identity_ids")),
        message: "`identity_ids` can only be specified when `type` includes `UserAssigned`",
    },
];

fn is_hotpatch_image(desired: &dyn DesiredState) -> bool {
    desired.get_str("source_image_reference.publisher") == Some("MicrosoftWindowsServer")
        && desired.get_str("source_image_reference.offer") == Some("WindowsServer")
        && desired
            .get_str("source_image_reference.sku")
            .is_some_and(|sku| HOTPATCH_SKUS.contains(&sku))
}

fn check_hotpatch_image(desired: &dyn DesiredState) -> Option<String> {
    if desired.get_bool("hotpatching_enabled") == Some(true) && !is_hotpatch_image(desired) {
        return Some(format!(
            "`hotpatching_enabled` requires a hotpatch capable `source_image_reference` (sku one of [{}])",
            HOTPATCH_SKUS.join(", ")
        ));
    }
    None
}

fn check_hotpatch_image_patch_mode(desired: &dyn DesiredState) -> Option<String> {
    if is_hotpatch_image(desired) && desired.get_str(PATCH_MODE) != Some(AUTOMATIC_BY_PLATFORM) {
        return Some(
            "the hotpatch image requires `patch_mode` to be set to `AutomaticByPlatform`"
                .to_string(),
        );
    }
    None
}
