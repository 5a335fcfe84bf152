//! Mapping between desired attributes and the remote model.
//!
//! - `apply_*` write one attribute group into a partial update payload and
//!   are referenced from the classifier's rule table.
//! - [`build_create_payload`] assembles the full instance sent on create.
//! - [`observed_attributes`] flattens a fetched instance back into the
//!   attribute paths used by the desired state.

use std::collections::BTreeMap;

use serde_json::{Value, json};

use crate::desired::DesiredState;
use crate::error::{ValidationError, Violations};
use crate::identity::ResourceIdentity;
use crate::model::*;

const DEFAULT_EXTENSIONS_TIME_BUDGET: &str = "PT1H30M";
const DEFAULT_TERMINATION_TIMEOUT: &str = "PT5M";
const MAX_COMPUTER_NAME_LENGTH: usize = 15;

fn os_profile_mut(update: &mut VirtualMachineUpdate) -> &mut OsProfile {
    update
        .properties
        .os_profile
        .get_or_insert_with(OsProfile::default)
}

fn windows_configuration_mut(update: &mut VirtualMachineUpdate) -> &mut WindowsConfiguration {
    os_profile_mut(update)
        .windows_configuration
        .get_or_insert_with(WindowsConfiguration::default)
}

fn security_profile_mut(update: &mut VirtualMachineUpdate) -> &mut SecurityProfile {
    update
        .properties
        .security_profile
        .get_or_insert_with(SecurityProfile::default)
}

// ============================================================================
// In-place appliers
// ============================================================================

pub fn apply_additional_capabilities(
    desired: &dyn DesiredState,
    update: &mut VirtualMachineUpdate,
) {
    update.properties.additional_capabilities = Some(expand_additional_capabilities(desired));
}

pub fn apply_allow_extension_operations(
    desired: &dyn DesiredState,
    update: &mut VirtualMachineUpdate,
) {
    let allowed = desired
        .get_bool("allow_extension_operations")
        .unwrap_or(true);
    os_profile_mut(update).allow_extension_operations = Some(allowed);
}

pub fn apply_boot_diagnostics(desired: &dyn DesiredState, update: &mut VirtualMachineUpdate) {
    update.properties.diagnostics_profile = Some(expand_boot_diagnostics(desired));
}

pub fn apply_patch_settings(desired: &dyn DesiredState, update: &mut VirtualMachineUpdate) {
    windows_configuration_mut(update).patch_settings = Some(expand_patch_settings(desired));
}

pub fn apply_capacity_reservation_group(
    desired: &dyn DesiredState,
    update: &mut VirtualMachineUpdate,
) {
    update.properties.capacity_reservation = Some(CapacityReservationProfile {
        capacity_reservation_group: Some(SubResource::from_optional(
            desired.get_str("capacity_reservation_group_id"),
        )),
    });
}

pub fn apply_dedicated_host(desired: &dyn DesiredState, update: &mut VirtualMachineUpdate) {
    update.properties.host = Some(SubResource::from_optional(
        desired.get_str("dedicated_host_id"),
    ));
}

pub fn apply_dedicated_host_group(desired: &dyn DesiredState, update: &mut VirtualMachineUpdate) {
    update.properties.host_group = Some(SubResource::from_optional(
        desired.get_str("dedicated_host_group_id"),
    ));
}

pub fn apply_encryption_at_host(desired: &dyn DesiredState, update: &mut VirtualMachineUpdate) {
    let enabled = desired
        .get_bool("encryption_at_host_enabled")
        .unwrap_or(false);
    security_profile_mut(update).encryption_at_host = Some(enabled);
}

pub fn apply_extensions_time_budget(desired: &dyn DesiredState, update: &mut VirtualMachineUpdate) {
    update.properties.extensions_time_budget = Some(
        desired
            .get_non_empty_str("extensions_time_budget")
            .unwrap_or(DEFAULT_EXTENSIONS_TIME_BUDGET)
            .to_string(),
    );
}

pub fn apply_gallery_applications(desired: &dyn DesiredState, update: &mut VirtualMachineUpdate) {
    update.properties.application_profile = Some(ApplicationProfile {
        gallery_applications: expand_gallery_applications(desired),
    });
}

pub fn apply_identity(desired: &dyn DesiredState, update: &mut VirtualMachineUpdate) {
    update.identity = Some(expand_identity(desired).unwrap_or_else(|| ManagedIdentity {
        kind: "None".to_string(),
        ..Default::default()
    }));
}

/// An empty license type is sent as `"None"` so the remote clears it.
pub fn apply_license_type(desired: &dyn DesiredState, update: &mut VirtualMachineUpdate) {
    update.properties.license_type = Some(
        desired
            .get_non_empty_str("license_type")
            .unwrap_or("None")
            .to_string(),
    );
}

pub fn apply_max_bid_price(desired: &dyn DesiredState, update: &mut VirtualMachineUpdate) {
    update.properties.billing_profile = Some(BillingProfile {
        max_price: Some(desired.get_f64("max_bid_price").unwrap_or(-1.0)),
    });
}

pub fn apply_network_interfaces(desired: &dyn DesiredState, update: &mut VirtualMachineUpdate) {
    update.properties.network_profile = Some(expand_network_interfaces(desired));
}

/// Caching and write acceleration. Size and encryption set are applied to
/// the disk itself.
pub fn apply_os_disk(desired: &dyn DesiredState, update: &mut VirtualMachineUpdate) {
    let storage = update
        .properties
        .storage_profile
        .get_or_insert_with(StorageProfile::default);
    let os_disk = storage.os_disk.get_or_insert_with(OsDisk::default);
    os_disk.caching = desired
        .get_non_empty_str("os_disk.caching")
        .map(str::to_string);
    os_disk.write_accelerator_enabled = Some(
        desired
            .get_bool("os_disk.write_accelerator_enabled")
            .unwrap_or(false),
    );
}

pub fn apply_proximity_placement_group(
    desired: &dyn DesiredState,
    update: &mut VirtualMachineUpdate,
) {
    update.properties.proximity_placement_group = Some(SubResource::from_optional(
        desired.get_str("proximity_placement_group_id"),
    ));
}

pub fn apply_size(desired: &dyn DesiredState, update: &mut VirtualMachineUpdate) {
    update.properties.hardware_profile = Some(HardwareProfile {
        vm_size: desired.get_non_empty_str("size").map(str::to_string),
    });
}

pub fn apply_tags(desired: &dyn DesiredState, update: &mut VirtualMachineUpdate) {
    update.tags = Some(expand_tags(desired));
}

pub fn apply_termination_notification(
    desired: &dyn DesiredState,
    update: &mut VirtualMachineUpdate,
) {
    update.properties.scheduled_events_profile = Some(expand_termination_notification(desired));
}

pub fn apply_user_data(desired: &dyn DesiredState, update: &mut VirtualMachineUpdate) {
    let user_data = desired.get_str("user_data").unwrap_or_default();
    update.properties.user_data = Some(user_data.to_string());
}

// ============================================================================
// Expanders shared by create and update
// ============================================================================

fn expand_additional_capabilities(desired: &dyn DesiredState) -> AdditionalCapabilities {
    AdditionalCapabilities {
        ultra_ssd_enabled: Some(
            desired
                .get_bool("additional_capabilities.ultra_ssd_enabled")
                .unwrap_or(false),
        ),
    }
}

fn expand_boot_diagnostics(desired: &dyn DesiredState) -> DiagnosticsProfile {
    let enabled =
        desired.get("boot_diagnostics").is_some() || desired.has_block("boot_diagnostics");
    DiagnosticsProfile {
        boot_diagnostics: Some(BootDiagnostics {
            enabled: Some(enabled),
            storage_uri: if enabled {
                desired
                    .get_non_empty_str("boot_diagnostics.storage_account_uri")
                    .map(str::to_string)
            } else {
                None
            },
        }),
    }
}

fn expand_patch_settings(desired: &dyn DesiredState) -> PatchSettings {
    let patch_mode = desired
        .get_non_empty_str("patch_mode")
        .unwrap_or("AutomaticByOS");
    let automatic_by_platform_settings = (patch_mode == "AutomaticByPlatform").then(|| {
        AutomaticByPlatformSettings {
            reboot_setting: desired
                .get_non_empty_str("reboot_setting")
                .map(str::to_string),
            bypass_platform_safety_checks_on_user_schedule: Some(
                desired
                    .get_bool("bypass_platform_safety_checks_on_user_schedule_enabled")
                    .unwrap_or(false),
            ),
        }
    });
    PatchSettings {
        patch_mode: Some(patch_mode.to_string()),
        assessment_mode: Some(
            desired
                .get_non_empty_str("patch_assessment_mode")
                .unwrap_or("ImageDefault")
                .to_string(),
        ),
        enable_hotpatching: Some(desired.get_bool("hotpatching_enabled").unwrap_or(false)),
        automatic_by_platform_settings,
    }
}

fn expand_gallery_applications(desired: &dyn DesiredState) -> Vec<GalleryApplication> {
    let Some(Value::Array(items)) = desired.get("gallery_application") else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let version_id = item.get("version_id")?.as_str()?;
            Some(GalleryApplication {
                package_reference_id: version_id.to_string(),
                configuration_reference: item
                    .get("configuration_blob_uri")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
                order: Some(item.get("order").and_then(Value::as_i64).unwrap_or(0)),
                tags: item
                    .get("tag")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            })
        })
        .collect()
}

fn expand_identity(desired: &dyn DesiredState) -> Option<ManagedIdentity> {
    let kind = desired.get_non_empty_str("identity.type")?;
    let user_assigned_identities = desired
        .get_str_list("identity.identity_ids")
        .into_iter()
        .map(|id| (id, UserAssignedIdentity::default()))
        .collect();
    Some(ManagedIdentity {
        kind: kind.to_string(),
        user_assigned_identities,
        ..Default::default()
    })
}

fn expand_network_interfaces(desired: &dyn DesiredState) -> NetworkProfile {
    NetworkProfile {
        network_interfaces: desired
            .get_str_list("network_interface_ids")
            .into_iter()
            .enumerate()
            .map(|(i, id)| NetworkInterfaceReference {
                id,
                primary: Some(i == 0),
            })
            .collect(),
    }
}

fn expand_tags(desired: &dyn DesiredState) -> BTreeMap<String, String> {
    match desired.get("tags") {
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect(),
        _ => BTreeMap::new(),
    }
}

fn expand_termination_notification(desired: &dyn DesiredState) -> ScheduledEventsProfile {
    let enable = desired
        .get_bool("termination_notification.enabled")
        .unwrap_or(false);
    ScheduledEventsProfile {
        terminate_notification_profile: Some(TerminateNotificationProfile {
            enable: Some(enable),
            not_before_timeout: desired
                .get_non_empty_str("termination_notification.timeout")
                .map(str::to_string)
                .or_else(|| enable.then(|| DEFAULT_TERMINATION_TIMEOUT.to_string())),
        }),
    }
}

// ============================================================================
// Create payload
// ============================================================================

/// Assemble the full instance sent on create.
pub fn build_create_payload(
    id: &ResourceIdentity,
    desired: &dyn DesiredState,
) -> Result<VirtualMachine, Violations> {
    let mut violations = Violations::new();

    let location = desired.get_non_empty_str("location");
    if location.is_none() {
        violations.push(ValidationError::new("location", "is required"));
    }

    let computer_name = match desired.get_non_empty_str("computer_name") {
        Some(name) => name.to_string(),
        None if id.name().len() > MAX_COMPUTER_NAME_LENGTH => {
            violations.push(ValidationError::new(
                "computer_name",
                format!(
                    "unable to assume default computer name: `name` is longer than {MAX_COMPUTER_NAME_LENGTH} characters, specify `computer_name`"
                ),
            ));
            String::new()
        }
        None => id.name().to_string(),
    };
    violations.into_result()?;

    let properties = VirtualMachineProperties {
        hardware_profile: Some(HardwareProfile {
            vm_size: desired.get_non_empty_str("size").map(str::to_string),
        }),
        storage_profile: Some(StorageProfile {
            image_reference: Some(expand_image_reference(desired)),
            os_disk: Some(expand_os_disk_for_create(desired)),
            data_disks: Some(Vec::new()),
        }),
        os_profile: Some(OsProfile {
            computer_name: Some(computer_name),
            admin_username: desired
                .get_non_empty_str("admin_username")
                .map(str::to_string),
            admin_password: desired
                .get_non_empty_str("admin_password")
                .map(str::to_string),
            custom_data: desired.get_non_empty_str("custom_data").map(str::to_string),
            allow_extension_operations: Some(
                desired
                    .get_bool("allow_extension_operations")
                    .unwrap_or(true),
            ),
            windows_configuration: Some(WindowsConfiguration {
                provision_vm_agent: Some(desired.get_bool("provision_vm_agent").unwrap_or(true)),
                enable_automatic_updates: Some(
                    desired.get_bool("enable_automatic_updates").unwrap_or(true),
                ),
                time_zone: desired.get_non_empty_str("timezone").map(str::to_string),
                patch_settings: Some(expand_patch_settings(desired)),
            }),
        }),
        network_profile: Some(expand_network_interfaces(desired)),
        security_profile: expand_security_profile(desired),
        diagnostics_profile: Some(expand_boot_diagnostics(desired)),
        additional_capabilities: desired
            .has_block("additional_capabilities")
            .then(|| expand_additional_capabilities(desired)),
        application_profile: desired
            .has_block("gallery_application")
            .then(|| ApplicationProfile {
                gallery_applications: expand_gallery_applications(desired),
            }),
        scheduled_events_profile: Some(expand_termination_notification(desired)),
        billing_profile: (desired.get_str("priority") == Some("Spot")).then(|| BillingProfile {
            max_price: Some(desired.get_f64("max_bid_price").unwrap_or(-1.0)),
        }),
        availability_set: sub_resource(desired, "availability_set_id"),
        capacity_reservation: sub_resource(desired, "capacity_reservation_group_id").map(|group| {
            CapacityReservationProfile {
                capacity_reservation_group: Some(group),
            }
        }),
        host: sub_resource(desired, "dedicated_host_id"),
        host_group: sub_resource(desired, "dedicated_host_group_id"),
        proximity_placement_group: sub_resource(desired, "proximity_placement_group_id"),
        virtual_machine_scale_set: sub_resource(desired, "virtual_machine_scale_set_id"),
        platform_fault_domain: desired
            .get_i64("platform_fault_domain")
            .filter(|d| *d != -1),
        priority: Some(
            desired
                .get_non_empty_str("priority")
                .unwrap_or("Regular")
                .to_string(),
        ),
        eviction_policy: desired
            .get_non_empty_str("eviction_policy")
            .map(str::to_string),
        license_type: desired
            .get_non_empty_str("license_type")
            .map(str::to_string),
        extensions_time_budget: Some(
            desired
                .get_non_empty_str("extensions_time_budget")
                .unwrap_or(DEFAULT_EXTENSIONS_TIME_BUDGET)
                .to_string(),
        ),
        user_data: desired.get_non_empty_str("user_data").map(str::to_string),
        ..Default::default()
    };

    Ok(VirtualMachine {
        name: Some(id.name().to_string()),
        location: location.map(str::to_string),
        extended_location: desired
            .get_non_empty_str("edge_zone")
            .map(|zone| ExtendedLocation {
                name: zone.to_string(),
                kind: "EdgeZone".to_string(),
            }),
        identity: expand_identity(desired),
        zones: desired
            .get_non_empty_str("zone")
            .map(|zone| vec![zone.to_string()]),
        tags: Some(expand_tags(desired)),
        properties: Some(properties),
        ..Default::default()
    })
}

fn sub_resource(desired: &dyn DesiredState, path: &str) -> Option<SubResource> {
    desired.get_non_empty_str(path).map(SubResource::new)
}

fn expand_image_reference(desired: &dyn DesiredState) -> ImageReference {
    if let Some(id) = desired.get_non_empty_str("source_image_id") {
        return ImageReference {
            id: Some(id.to_string()),
            ..Default::default()
        };
    }
    let field = |name: &str| {
        desired
            .get_non_empty_str(&format!("source_image_reference.{name}"))
            .map(str::to_string)
    };
    ImageReference {
        id: None,
        publisher: field("publisher"),
        offer: field("offer"),
        sku: field("sku"),
        version: field("version"),
    }
}

fn expand_os_disk_for_create(desired: &dyn DesiredState) -> OsDisk {
    let security_profile = desired
        .get_non_empty_str("os_disk.security_encryption_type")
        .map(|kind| VmDiskSecurityProfile {
            security_encryption_type: Some(kind.to_string()),
            disk_encryption_set: sub_resource(desired, "os_disk.secure_vm_disk_encryption_set_id"),
        });

    let diff_disk_settings = desired
        .get_non_empty_str("os_disk.diff_disk_settings.option")
        .map(|option| DiffDiskSettings {
            option: Some(option.to_string()),
            placement: Some(
                desired
                    .get_non_empty_str("os_disk.diff_disk_settings.placement")
                    .unwrap_or("CacheDisk")
                    .to_string(),
            ),
        });

    OsDisk {
        name: desired
            .get_non_empty_str("os_disk.name")
            .map(str::to_string),
        caching: desired
            .get_non_empty_str("os_disk.caching")
            .map(str::to_string),
        create_option: Some("FromImage".to_string()),
        os_type: Some("Windows".to_string()),
        disk_size_gb: desired.get_i64("os_disk.disk_size_gb").filter(|s| *s > 0),
        write_accelerator_enabled: Some(
            desired
                .get_bool("os_disk.write_accelerator_enabled")
                .unwrap_or(false),
        ),
        diff_disk_settings,
        managed_disk: Some(ManagedDiskParameters {
            id: None,
            storage_account_type: desired
                .get_non_empty_str("os_disk.storage_account_type")
                .map(str::to_string),
            disk_encryption_set: sub_resource(desired, "os_disk.disk_encryption_set_id"),
            security_profile,
        }),
    }
}

/// Confidential VMs get `ConfidentialVM`; secure boot or vTPM alone give
/// `TrustedLaunch`.
fn expand_security_profile(desired: &dyn DesiredState) -> Option<SecurityProfile> {
    let secure_boot = desired.get_bool("secure_boot_enabled").unwrap_or(false);
    let vtpm = desired.get_bool("vtpm_enabled").unwrap_or(false);
    let encryption_at_host = desired.get_bool("encryption_at_host_enabled");

    let security_type = if desired.has_value("os_disk.security_encryption_type") {
        Some("ConfidentialVM")
    } else if secure_boot || vtpm {
        Some("TrustedLaunch")
    } else {
        None
    };

    if security_type.is_none() && encryption_at_host.is_none() {
        return None;
    }
    Some(SecurityProfile {
        encryption_at_host,
        security_type: security_type.map(str::to_string),
        uefi_settings: security_type.map(|_| UefiSettings {
            secure_boot_enabled: Some(secure_boot),
            v_tpm_enabled: Some(vtpm),
        }),
    })
}

// ============================================================================
// Observed state
// ============================================================================

struct Attributes(BTreeMap<String, Value>);

impl Attributes {
    fn put(&mut self, path: &str, value: Option<impl Into<Value>>) {
        if let Some(value) = value {
            self.0.insert(path.to_string(), value.into());
        }
    }

    fn put_ref(&mut self, path: &str, reference: Option<&SubResource>) {
        self.put(path, reference.and_then(|r| r.id.clone()));
    }
}

/// Flatten a fetched instance into desired-state attribute paths, filling
/// remote defaults. `os_disk` is the OS disk sub-resource, when found.
pub fn observed_attributes(
    id: &ResourceIdentity,
    vm: &VirtualMachine,
    os_disk: Option<&Disk>,
) -> BTreeMap<String, Value> {
    let mut out = Attributes(BTreeMap::new());
    let default_props = VirtualMachineProperties::default();
    let props = vm.properties.as_ref().unwrap_or(&default_props);

    out.put("name", Some(id.name()));
    out.put("resource_group_name", Some(id.resource_group()));
    out.put("location", vm.location.clone());
    out.put("zone", vm.zones.as_ref().and_then(|z| z.first().cloned()));
    out.put(
        "edge_zone",
        vm.extended_location.as_ref().map(|l| l.name.clone()),
    );
    out.put("tags", Some(json!(vm.tags.clone().unwrap_or_default())));
    out.put("virtual_machine_id", props.vm_id.clone());

    if let Some(identity) = &vm.identity {
        out.put("identity.type", Some(identity.kind.clone()));
        let ids: Vec<&String> = identity.user_assigned_identities.keys().collect();
        if !ids.is_empty() {
            out.put("identity.identity_ids", Some(json!(ids)));
        }
        out.put("identity.principal_id", identity.principal_id.clone());
    }

    out.put(
        "size",
        props
            .hardware_profile
            .as_ref()
            .and_then(|h| h.vm_size.clone()),
    );

    if let Some(os) = &props.os_profile {
        out.put("admin_username", os.admin_username.clone());
        out.put("computer_name", os.computer_name.clone());
        out.put("allow_extension_operations", os.allow_extension_operations);
        if let Some(windows) = &os.windows_configuration {
            out.put("provision_vm_agent", windows.provision_vm_agent);
            out.put("enable_automatic_updates", windows.enable_automatic_updates);
            out.put("timezone", windows.time_zone.clone());
            let patch = windows.patch_settings.clone().unwrap_or_default();
            out.put("patch_mode", patch.patch_mode);
            let assessment_mode = patch.assessment_mode.as_deref().unwrap_or("ImageDefault");
            out.put("patch_assessment_mode", Some(assessment_mode));
            out.put(
                "hotpatching_enabled",
                Some(patch.enable_hotpatching.unwrap_or(false)),
            );
            if let Some(abp) = patch.automatic_by_platform_settings {
                out.put("reboot_setting", abp.reboot_setting);
                out.put(
                    "bypass_platform_safety_checks_on_user_schedule_enabled",
                    abp.bypass_platform_safety_checks_on_user_schedule,
                );
            }
        }
    }

    if let Some(network) = &props.network_profile {
        let ids: Vec<&str> = network
            .network_interfaces
            .iter()
            .map(|n| n.id.as_str())
            .collect();
        out.put("network_interface_ids", Some(json!(ids)));
    }

    if let Some(storage) = &props.storage_profile {
        if let Some(image) = &storage.image_reference {
            if let Some(image_id) = &image.id {
                out.put("source_image_id", Some(image_id.clone()));
            } else {
                out.put("source_image_reference.publisher", image.publisher.clone());
                out.put("source_image_reference.offer", image.offer.clone());
                out.put("source_image_reference.sku", image.sku.clone());
                out.put("source_image_reference.version", image.version.clone());
            }
        }
        if let Some(disk) = &storage.os_disk {
            flatten_os_disk(&mut out, disk, os_disk);
        }
    }

    if let Some(security) = &props.security_profile {
        out.put("encryption_at_host_enabled", security.encryption_at_host);
        if let Some(uefi) = &security.uefi_settings {
            out.put("secure_boot_enabled", uefi.secure_boot_enabled);
            out.put("vtpm_enabled", uefi.v_tpm_enabled);
        }
    }

    if let Some(boot) = props
        .diagnostics_profile
        .as_ref()
        .and_then(|d| d.boot_diagnostics.as_ref())
        .filter(|b| b.enabled == Some(true))
    {
        out.put(
            "boot_diagnostics.storage_account_uri",
            Some(boot.storage_uri.clone().unwrap_or_default()),
        );
    }

    out.put(
        "additional_capabilities.ultra_ssd_enabled",
        props
            .additional_capabilities
            .as_ref()
            .and_then(|c| c.ultra_ssd_enabled),
    );

    if let Some(apps) = &props.application_profile {
        let apps: Vec<Value> = apps
            .gallery_applications
            .iter()
            .map(|app| {
                let configuration_blob_uri = app.configuration_reference.clone();
                json!({
                    "version_id": app.package_reference_id,
                    "configuration_blob_uri": configuration_blob_uri.unwrap_or_default(),
                    "order": app.order.unwrap_or(0),
                    "tag": app.tags.clone().unwrap_or_default(),
                })
            })
            .collect();
        out.put("gallery_application", Some(Value::Array(apps)));
    }

    if let Some(profile) = props
        .scheduled_events_profile
        .as_ref()
        .and_then(|p| p.terminate_notification_profile.as_ref())
    {
        out.put(
            "termination_notification.enabled",
            Some(profile.enable.unwrap_or(false)),
        );
        out.put(
            "termination_notification.timeout",
            Some(
                profile
                    .not_before_timeout
                    .clone()
                    .unwrap_or_else(|| DEFAULT_TERMINATION_TIMEOUT.to_string()),
            ),
        );
    }

    let priority = props
        .priority
        .clone()
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "Regular".to_string());
    out.put("priority", Some(priority));
    out.put("eviction_policy", props.eviction_policy.clone());
    out.put(
        "max_bid_price",
        Some(
            props
                .billing_profile
                .as_ref()
                .and_then(|b| b.max_price)
                .unwrap_or(-1.0),
        ),
    );
    out.put("license_type", props.license_type.clone());
    out.put(
        "extensions_time_budget",
        Some(
            props
                .extensions_time_budget
                .clone()
                .unwrap_or_else(|| DEFAULT_EXTENSIONS_TIME_BUDGET.to_string()),
        ),
    );
    out.put(
        "platform_fault_domain",
        Some(props.platform_fault_domain.unwrap_or(-1)),
    );
    out.put("user_data", props.user_data.clone());

    out.put_ref("availability_set_id", props.availability_set.as_ref());
    out.put_ref(
        "capacity_reservation_group_id",
        props
            .capacity_reservation
            .as_ref()
            .and_then(|c| c.capacity_reservation_group.as_ref()),
    );
    out.put_ref("dedicated_host_id", props.host.as_ref());
    out.put_ref("dedicated_host_group_id", props.host_group.as_ref());
    out.put_ref(
        "proximity_placement_group_id",
        props.proximity_placement_group.as_ref(),
    );
    out.put_ref(
        "virtual_machine_scale_set_id",
        props.virtual_machine_scale_set.as_ref(),
    );

    out.0
}

fn flatten_os_disk(out: &mut Attributes, disk: &OsDisk, sub_resource: Option<&Disk>) {
    let managed = disk.managed_disk.clone().unwrap_or_default();
    let sub_props = sub_resource.and_then(|d| d.properties.as_ref());

    out.put("os_disk.name", disk.name.clone());
    out.put("os_disk.caching", disk.caching.clone());
    out.put(
        "os_disk.write_accelerator_enabled",
        Some(disk.write_accelerator_enabled.unwrap_or(false)),
    );
    out.put(
        "os_disk.storage_account_type",
        managed.storage_account_type.clone().or_else(|| {
            sub_resource
                .and_then(|d| d.sku.as_ref())
                .and_then(|s| s.name.clone())
        }),
    );
    out.put(
        "os_disk.disk_size_gb",
        disk.disk_size_gb
            .or_else(|| sub_props.and_then(|p| p.disk_size_gb)),
    );
    out.put(
        "os_disk.disk_encryption_set_id",
        managed
            .disk_encryption_set
            .as_ref()
            .and_then(|s| s.id.clone())
            .or_else(|| {
                sub_props
                    .and_then(|p| p.encryption.as_ref())
                    .and_then(|e| e.disk_encryption_set_id.clone())
            }),
    );
    if let Some(security) = &managed.security_profile {
        out.put(
            "os_disk.security_encryption_type",
            security.security_encryption_type.clone(),
        );
        out.put(
            "os_disk.secure_vm_disk_encryption_set_id",
            security
                .disk_encryption_set
                .as_ref()
                .and_then(|s| s.id.clone()),
        );
    }
    if let Some(diff) = &disk.diff_disk_settings {
        out.put("os_disk.diff_disk_settings.option", diff.option.clone());
        out.put(
            "os_disk.diff_disk_settings.placement",
            diff.placement.clone(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desired::ConfigSnapshot;

    fn id() -> ResourceIdentity {
        ResourceIdentity::new("0000", "rg", "web-01")
    }

    fn desired() -> ConfigSnapshot {
        ConfigSnapshot::from_value(&json!({
            "location": "westeurope",
            "size": "Standard_F2",
            "admin_username": "adminuser",
            "admin_password": "P@ssw0rd1234!",
            "network_interface_ids": ["/nic/a", "/nic/b"],
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
            "tags": {"env": "prod"},
        }))
    }

    #[test]
    fn test_license_type_empty_becomes_none_on_update() {
        let mut update = VirtualMachineUpdate::default();
        apply_license_type(&desired().with("license_type", ""), &mut update);
        assert_eq!(update.properties.license_type.as_deref(), Some("None"));

        let mut update = VirtualMachineUpdate::default();
        apply_license_type(
            &desired().with("license_type", "Windows_Server"),
            &mut update,
        );
        assert_eq!(
            update.properties.license_type.as_deref(),
            Some("Windows_Server")
        );
    }

    #[test]
    fn test_license_type_empty_is_omitted_on_create() {
        let desired = desired().with("license_type", "");
        let vm = build_create_payload(&id(), &desired).unwrap();
        assert_eq!(vm.properties.unwrap().license_type, None);
    }

    #[test]
    fn test_cleared_host_sends_empty_reference() {
        let mut update = VirtualMachineUpdate::default();
        apply_dedicated_host(&desired(), &mut update);
        assert_eq!(update.properties.host, Some(SubResource::default()));
    }

    #[test]
    fn test_os_disk_update_excludes_size() {
        let mut update = VirtualMachineUpdate::default();
        apply_os_disk(&desired(), &mut update);
        let disk = update.properties.storage_profile.unwrap().os_disk.unwrap();
        assert_eq!(disk.caching.as_deref(), Some("ReadWrite"));
        assert_eq!(disk.disk_size_gb, None);
    }

    #[test]
    fn test_patch_settings_only_add_platform_settings_when_needed() {
        let mut update = VirtualMachineUpdate::default();
        apply_patch_settings(&desired(), &mut update);
        let settings = update
            .properties
            .os_profile
            .unwrap()
            .windows_configuration
            .unwrap()
            .patch_settings
            .unwrap();
        assert_eq!(settings.patch_mode.as_deref(), Some("AutomaticByOS"));
        assert_eq!(settings.assessment_mode.as_deref(), Some("ImageDefault"));
        assert!(settings.automatic_by_platform_settings.is_none());

        let mut update = VirtualMachineUpdate::default();
        apply_patch_settings(
            &desired()
                .with("patch_mode", "AutomaticByPlatform")
                .with("reboot_setting", "IfRequired"),
            &mut update,
        );
        let settings = update
            .properties
            .os_profile
            .unwrap()
            .windows_configuration
            .unwrap()
            .patch_settings
            .unwrap();
        let automatic = settings.automatic_by_platform_settings.unwrap();
        assert_eq!(automatic.reboot_setting.as_deref(), Some("IfRequired"));
    }

    #[test]
    fn test_create_payload_defaults() {
        let vm = build_create_payload(&id(), &desired()).unwrap();
        let props = vm.properties.unwrap();

        let os = props.os_profile.unwrap();
        assert_eq!(os.computer_name.as_deref(), Some("web-01"));
        assert_eq!(os.allow_extension_operations, Some(true));

        let nics = props.network_profile.unwrap().network_interfaces;
        assert_eq!(nics[0].primary, Some(true));
        assert_eq!(nics[1].primary, Some(false));

        let storage = props.storage_profile.unwrap();
        assert_eq!(storage.data_disks, Some(Vec::new()));
        assert_eq!(storage.os_disk.unwrap().disk_size_gb, Some(128));

        let termination = props
            .scheduled_events_profile
            .unwrap()
            .terminate_notification_profile
            .unwrap();
        assert_eq!(termination.enable, Some(false));

        assert_eq!(props.priority.as_deref(), Some("Regular"));
        assert!(props.billing_profile.is_none());
        assert!(props.security_profile.is_none());
    }

    #[test]
    fn test_long_name_needs_computer_name() {
        let long = ResourceIdentity::new("0000", "rg", "a-very-long-machine-name");
        let err = build_create_payload(&long, &desired()).unwrap_err();
        assert!(err.mentions("computer_name"));

        let named = desired().with("computer_name", "short");
        let vm = build_create_payload(&long, &named).unwrap();
        let os_profile = vm.properties.unwrap().os_profile.unwrap();
        assert_eq!(os_profile.computer_name.as_deref(), Some("short"));
    }

    #[test]
    fn test_security_type_derivation() {
        let secure_boot = desired().with("secure_boot_enabled", true);
        let trusted = build_create_payload(&id(), &secure_boot).unwrap();
        let profile = trusted.properties.unwrap().security_profile.unwrap();
        assert_eq!(profile.security_type.as_deref(), Some("TrustedLaunch"));

        let confidential = build_create_payload(
            &id(),
            &desired()
                .with("os_disk.security_encryption_type", "VMGuestStateOnly")
                .with("vtpm_enabled", true),
        )
        .unwrap();
        let props = confidential.properties.unwrap();
        assert_eq!(
            props.security_profile.unwrap().security_type.as_deref(),
            Some("ConfidentialVM")
        );
        let disk_security = props
            .storage_profile
            .unwrap()
            .os_disk
            .unwrap()
            .managed_disk
            .unwrap()
            .security_profile
            .unwrap();
        assert_eq!(
            disk_security.security_encryption_type.as_deref(),
            Some("VMGuestStateOnly")
        );
    }

    #[test]
    fn test_observed_defaults() {
        let vm = VirtualMachine {
            location: Some("westeurope".to_string()),
            properties: Some(VirtualMachineProperties {
                priority: Some(String::new()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let attrs = observed_attributes(&id(), &vm, None);
        assert_eq!(attrs["priority"], json!("Regular"));
        assert_eq!(attrs["max_bid_price"], json!(-1.0));
        assert_eq!(attrs["extensions_time_budget"], json!("PT1H30M"));
        assert_eq!(attrs["platform_fault_domain"], json!(-1));
        assert_eq!(attrs["name"], json!("web-01"));
    }

    #[test]
    fn test_observed_os_disk_filled_from_disk() {
        let vm = VirtualMachine {
            properties: Some(VirtualMachineProperties {
                storage_profile: Some(StorageProfile {
                    os_disk: Some(OsDisk {
                        name: Some("web-01-os".to_string()),
                        caching: Some("ReadWrite".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let disk = Disk {
            sku: Some(DiskSku {
                name: Some("Premium_LRS".to_string()),
            }),
            properties: Some(DiskProperties {
                disk_size_gb: Some(256),
                encryption: Some(DiskEncryption {
                    disk_encryption_set_id: Some("/des/1".to_string()),
                }),
            }),
            ..Default::default()
        };
        let attrs = observed_attributes(&id(), &vm, Some(&disk));
        assert_eq!(attrs["os_disk.storage_account_type"], json!("Premium_LRS"));
        assert_eq!(attrs["os_disk.disk_size_gb"], json!(256));
        assert_eq!(attrs["os_disk.disk_encryption_set_id"], json!("/des/1"));
    }

    #[test]
    fn test_create_then_observe_matches_desired() {
        let desired = desired();
        let vm = build_create_payload(&id(), &desired).unwrap();
        let observed = observed_attributes(&id(), &vm, None);
        for path in [
            "size",
            "location",
            "tags",
            "network_interface_ids",
            "os_disk.caching",
            "os_disk.disk_size_gb",
            "source_image_reference.sku",
        ] {
            assert_eq!(observed.get(path), desired.get(path), "{path}");
        }
    }
}
