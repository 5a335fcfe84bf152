//! Update pass integration tests
//!
//! Each test drives one update pass against the simulated control plane and
//! checks the ordered remote mutations it issued.

mod harness;

use serde_json::json;

use armvm::desired::ChangeSet;
use armvm::error::{ReconcileError, RemoteError};
use armvm::inspector::PowerState;
use armvm::reconciler::Reconciler;
use armvm::sim::CallKind;

use harness::{TestEnv, base_config, engine_config, ephemeral_config, identity};

#[tokio::test(start_paused = true)]
async fn test_tags_only_update_is_not_disruptive() {
    let env = TestEnv::new();
    let desired = base_config().with("tags", json!({"env": "prod"}));

    let observed = env
        .reconciler
        .update(&identity(), &desired, &ChangeSet::new(["tags"]))
        .await
        .unwrap();

    assert_eq!(env.mutations(), vec![CallKind::Update]);
    assert_eq!(observed.get("tags"), Some(&json!({"env": "prod"})));
    assert_eq!(observed.power_state(), PowerState::Running);
    assert_eq!(env.audit.messages(), vec!["VM updated: web-01"]);

    let sent = &env.cloud.mutating_calls()[0].detail;
    assert_eq!(sent["tags"], json!({"env": "prod"}));
    assert!(sent["properties"].get("hardwareProfile").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_resize_to_unavailable_size_deallocates() {
    let env = TestEnv::new();
    let desired = base_config().with("size", "Standard_D4s_v3");

    let observed = env
        .reconciler
        .update(&identity(), &desired, &ChangeSet::new(["size"]))
        .await
        .unwrap();

    assert_eq!(
        env.mutations(),
        vec![
            CallKind::PowerOff,
            CallKind::Deallocate,
            CallKind::Update,
            CallKind::Start
        ]
    );
    assert_eq!(observed.get("size"), Some(&json!("Standard_D4s_v3")));
    assert_eq!(
        env.cloud.power_state(&identity()),
        Some(PowerState::Running)
    );
    assert_eq!(env.count(CallKind::ListAvailableSizes), 1);
}

#[tokio::test(start_paused = true)]
async fn test_resize_within_host_only_powers_off() {
    let env = TestEnv::new();
    let desired = base_config().with("size", "standard_f4");

    env.reconciler
        .update(&identity(), &desired, &ChangeSet::new(["size"]))
        .await
        .unwrap();

    assert_eq!(
        env.mutations(),
        vec![CallKind::PowerOff, CallKind::Update, CallKind::Start]
    );
}

#[tokio::test(start_paused = true)]
async fn test_os_disk_resize_runs_between_deallocate_and_start() {
    let env = TestEnv::new();
    let desired = base_config().with("os_disk.disk_size_gb", 256);

    let observed = env
        .reconciler
        .update(
            &identity(),
            &desired,
            &ChangeSet::new(["os_disk.0.disk_size_gb"]),
        )
        .await
        .unwrap();

    assert_eq!(
        env.mutations(),
        vec![
            CallKind::PowerOff,
            CallKind::Deallocate,
            CallKind::DiskUpdate,
            CallKind::Start
        ]
    );
    assert_eq!(observed.get("os_disk.disk_size_gb"), Some(&json!(256)));
    assert_eq!(
        env.audit.messages(),
        vec![
            "VM powered off: web-01",
            "VM deallocated: web-01",
            "Disk updated: web-01-os (size 256 GB)",
            "VM started: web-01",
        ]
    );

    let disk = env.cloud.disk(&identity().disk("web-01-os")).unwrap();
    assert_eq!(disk.properties.unwrap().disk_size_gb, Some(256));
}

#[tokio::test(start_paused = true)]
async fn test_disk_encryption_set_runs_between_deallocate_and_start() {
    let env = TestEnv::new();
    let desired = base_config().with("os_disk.disk_encryption_set_id", "/des/1");

    let observed = env
        .reconciler
        .update(
            &identity(),
            &desired,
            &ChangeSet::new(["os_disk.disk_encryption_set_id"]),
        )
        .await
        .unwrap();

    assert_eq!(
        env.mutations(),
        vec![
            CallKind::PowerOff,
            CallKind::Deallocate,
            CallKind::DiskUpdate,
            CallKind::Start
        ]
    );
    assert_eq!(
        observed.get("os_disk.disk_encryption_set_id"),
        Some(&json!("/des/1"))
    );
    assert!(
        env.audit
            .messages()
            .contains(&"Disk updated: web-01-os (disk encryption set /des/1)".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn test_disk_size_and_encryption_set_in_one_pass() {
    let env = TestEnv::new();
    let desired = base_config()
        .with("os_disk.disk_size_gb", 256)
        .with("os_disk.disk_encryption_set_id", "/des/1");

    let observed = env
        .reconciler
        .update(
            &identity(),
            &desired,
            &ChangeSet::new(["os_disk.disk_encryption_set_id", "os_disk.disk_size_gb"]),
        )
        .await
        .unwrap();

    assert_eq!(
        env.mutations(),
        vec![
            CallKind::PowerOff,
            CallKind::Deallocate,
            CallKind::DiskUpdate,
            CallKind::DiskUpdate,
            CallKind::Start
        ]
    );
    let disk_updates: Vec<_> = env
        .cloud
        .mutating_calls()
        .into_iter()
        .filter(|c| c.kind == CallKind::DiskUpdate)
        .map(|c| c.detail)
        .collect();
    assert_eq!(disk_updates[0]["properties"]["diskSizeGB"], json!(256));
    assert_eq!(
        disk_updates[1]["properties"]["encryption"]["diskEncryptionSetId"],
        json!("/des/1")
    );
    assert_eq!(observed.get("os_disk.disk_size_gb"), Some(&json!(256)));
}

#[tokio::test(start_paused = true)]
async fn test_oversized_duration_is_a_validation_error() {
    let env = TestEnv::new();
    let desired = base_config().with("extensions_time_budget", "P999999999999999D");

    let err = env
        .reconciler
        .update(
            &identity(),
            &desired,
            &ChangeSet::new(["extensions_time_budget"]),
        )
        .await
        .unwrap_err();

    let violations = err.violations().unwrap();
    assert!(violations.mentions("extensions_time_budget"));
    assert!(env.cloud.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_ephemeral_os_disk_skips_deallocate() {
    let env = TestEnv::seeded(&ephemeral_config(), engine_config());
    let desired = ephemeral_config().with("size", "Standard_D4s_v3");

    env.reconciler
        .update(&identity(), &desired, &ChangeSet::new(["size"]))
        .await
        .unwrap();

    assert_eq!(
        env.mutations(),
        vec![CallKind::PowerOff, CallKind::Update, CallKind::Start]
    );
    assert_eq!(env.count(CallKind::DiskGet), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stopped_vm_is_not_powered_off_or_restarted() {
    let env = TestEnv::new();
    let vm = env.cloud.vm(&identity()).unwrap();
    env.cloud.insert_vm(&identity(), vm, PowerState::Stopped);
    let desired = base_config().with("size", "Standard_D4s_v3");

    env.reconciler
        .update(&identity(), &desired, &ChangeSet::new(["size"]))
        .await
        .unwrap();

    assert_eq!(
        env.mutations(),
        vec![CallKind::Deallocate, CallKind::Update]
    );
    assert_eq!(
        env.cloud.power_state(&identity()),
        Some(PowerState::Deallocated)
    );
}

#[tokio::test(start_paused = true)]
async fn test_deallocated_vm_needs_no_disruption() {
    let env = TestEnv::new();
    let vm = env.cloud.vm(&identity()).unwrap();
    env.cloud.insert_vm(&identity(), vm, PowerState::Deallocated);
    let desired = base_config().with("os_disk.disk_size_gb", 512);
    let resize = ChangeSet::new(["os_disk.disk_size_gb"]);

    env.reconciler
        .update(&identity(), &desired, &resize)
        .await
        .unwrap();

    assert_eq!(env.mutations(), vec![CallKind::DiskUpdate]);
}

#[tokio::test(start_paused = true)]
async fn test_empty_change_set_issues_no_mutations() {
    let env = TestEnv::new();

    let observed = env
        .reconciler
        .update(&identity(), &base_config(), &ChangeSet::empty())
        .await
        .unwrap();

    assert!(env.mutations().is_empty());
    assert_eq!(observed.get("size"), Some(&json!("Standard_F2")));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_configuration_makes_no_remote_calls() {
    let env = TestEnv::new();
    let desired = base_config().with("max_bid_price", 0.5);

    let err = env
        .reconciler
        .update(&identity(), &desired, &ChangeSet::new(["max_bid_price"]))
        .await
        .unwrap_err();

    let violations = err.violations().expect("validation error");
    assert!(violations.mentions("max_bid_price"));
    assert!(env.cloud.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_create_only_change_is_rejected() {
    let env = TestEnv::new();
    let desired = base_config().with("location", "northeurope");

    let err = env
        .reconciler
        .update(&identity(), &desired, &ChangeSet::new(["location"]))
        .await
        .unwrap_err();

    assert!(matches!(err, ReconcileError::Validation(ref v) if v.mentions("location")));
    assert!(env.cloud.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_missing_vm_is_not_found() {
    let env = TestEnv::empty();
    let desired = base_config().with("tags", json!({"env": "prod"}));

    let err = env
        .reconciler
        .update(&identity(), &desired, &ChangeSet::new(["tags"]))
        .await
        .unwrap_err();

    assert!(matches!(err, ReconcileError::NotFound { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_rejected_operation_is_remote_error() {
    let env = TestEnv::new();
    let busy = RemoteError::conflict("operation in progress");
    env.cloud.fail_next(CallKind::PowerOff, busy);
    let desired = base_config().with("size", "Standard_D4s_v3");

    let err = env
        .reconciler
        .update(&identity(), &desired, &ChangeSet::new(["size"]))
        .await
        .unwrap_err();

    match err {
        ReconcileError::Remote {
            operation, source, ..
        } => {
            assert_eq!(operation, "power off");
            assert_eq!(source.status, 409);
        }
        other => panic!("expected remote error, got {other:?}"),
    }
    assert_eq!(env.mutations(), vec![CallKind::PowerOff]);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_operation_times_out() {
    let mut config = engine_config();
    config.timeouts.update = 120;
    let env = TestEnv::seeded(&base_config(), config);
    env.cloud.stall(CallKind::Deallocate);
    let desired = base_config().with("size", "Standard_D4s_v3");

    let err = env
        .reconciler
        .update(&identity(), &desired, &ChangeSet::new(["size"]))
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert!(matches!(err, ReconcileError::Timeout { operation: "deallocate", .. }));
    // the instance was left stopped, nothing restarted it
    assert_eq!(
        env.mutations(),
        vec![CallKind::PowerOff, CallKind::Deallocate]
    );
}

#[tokio::test(start_paused = true)]
async fn test_sub_resource_failure_is_distinct() {
    let env = TestEnv::new();
    env.cloud.fail_next(
        CallKind::DiskUpdate,
        RemoteError::new(400, "BadRequest", "disk size cannot be decreased"),
    );
    let desired = base_config().with("os_disk.disk_size_gb", 256);
    let resize = ChangeSet::new(["os_disk.disk_size_gb"]);

    let err = env
        .reconciler
        .update(&identity(), &desired, &resize)
        .await
        .unwrap_err();

    match err {
        ReconcileError::SubResource { operation, id, .. } => {
            assert_eq!(operation, "update");
            assert!(id.ends_with("/disks/web-01-os"));
        }
        other => panic!("expected sub-resource error, got {other:?}"),
    }
    assert_eq!(
        env.mutations(),
        vec![CallKind::PowerOff, CallKind::Deallocate, CallKind::DiskUpdate]
    );
}

#[tokio::test(start_paused = true)]
async fn test_slow_operations_are_polled() {
    let env = TestEnv::new();
    env.cloud.set_operation_polls(5);
    let desired = base_config().with("size", "Standard_D4s_v3");

    env.reconciler
        .update(&identity(), &desired, &ChangeSet::new(["size"]))
        .await
        .unwrap();

    assert_eq!(
        env.cloud.power_state(&identity()),
        Some(PowerState::Running)
    );
    assert_eq!(env.mutations().len(), 4);
}
