//! VM reconciler - reconciles virtual machine configuration with the remote
//! control plane.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::Reconciler;
use super::phase::{Pass, Phase};
use crate::audit::AuditLogger;
use crate::classifier::Classifier;
use crate::clients::{
    DeallocateOptions, DeleteOptions, DiskClient, PowerOffOptions, VirtualMachineClient,
};
use crate::config::{EngineConfig, VirtualMachineFeatures};
use crate::desired::{ChangeSet, DesiredState};
use crate::error::{ReconcileError, RemoteError, Result, ValidationError, Violations};
use crate::guard::{LockTable, ResourceLease};
use crate::identity::ResourceIdentity;
use crate::inspector::{InstanceStateInspector, PowerState, RemoteInstanceState};
use crate::model::VirtualMachine;
use crate::operation::{Deadline, Pollable, WaitError, run_to_completion, within};
use crate::payload;
use crate::plan::{HostFacts, Planner};

/// What a delete pass does besides deleting the instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletePolicy {
    /// Do not power off before deleting.
    pub skip_shutdown: bool,
    /// Let the guest shut down when powering off.
    pub graceful_shutdown: bool,
    /// Ask the remote to force the deletion. Implies `skip_shutdown`.
    pub force_deletion: bool,
    /// Delete the OS disk once the instance is gone.
    pub delete_os_disk: bool,
}

impl From<&VirtualMachineFeatures> for DeletePolicy {
    fn from(features: &VirtualMachineFeatures) -> Self {
        Self {
            skip_shutdown: features.skip_shutdown_and_force_delete,
            graceful_shutdown: features.graceful_shutdown,
            force_deletion: features.skip_shutdown_and_force_delete,
            delete_os_disk: features.delete_os_disk_on_deletion,
        }
    }
}

/// State of a virtual machine as read back from the remote.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservedState {
    pub id: ResourceIdentity,
    /// Flattened attributes, keyed like the desired configuration.
    pub attributes: BTreeMap<String, Value>,
    pub instance: RemoteInstanceState,
    pub observed_at: DateTime<Utc>,
}

impl ObservedState {
    pub fn get(&self, path: &str) -> Option<&Value> {
        self.attributes.get(path)
    }

    pub fn power_state(&self) -> PowerState {
        self.instance.power_state
    }
}

/// VM reconciler that drives the remote compute and disk clients.
pub struct VirtualMachineReconciler {
    subscription: String,
    vms: Arc<dyn VirtualMachineClient>,
    disks: Arc<dyn DiskClient>,
    inspector: InstanceStateInspector,
    locks: LockTable,
    planner: Planner,
    config: EngineConfig,
    audit: AuditLogger,
}

impl VirtualMachineReconciler {
    pub fn new(
        subscription: impl Into<String>,
        vms: Arc<dyn VirtualMachineClient>,
        disks: Arc<dyn DiskClient>,
        locks: LockTable,
        config: EngineConfig,
    ) -> Self {
        Self {
            subscription: subscription.into(),
            inspector: InstanceStateInspector::new(vms.clone()),
            vms,
            disks,
            locks,
            planner: Planner::default(),
            config,
            audit: AuditLogger::new("armvm"),
        }
    }

    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.planner = Planner::new(classifier);
        self
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Delete policy derived from the configured features.
    pub fn delete_policy(&self) -> DeletePolicy {
        DeletePolicy::from(&self.config.features)
    }

    /// Identity of the machine described by `desired`.
    pub fn identity_for(&self, desired: &dyn DesiredState) -> Result<ResourceIdentity> {
        let mut violations = Violations::new();
        let name = desired.get_non_empty_str("name");
        let resource_group = desired.get_non_empty_str("resource_group_name");
        if name.is_none() {
            violations.push(ValidationError::new("name", "is required"));
        }
        if resource_group.is_none() {
            violations.push(ValidationError::new("resource_group_name", "is required"));
        }
        match (name, resource_group) {
            (Some(name), Some(rg)) => Ok(ResourceIdentity::new(&self.subscription, rg, name)),
            _ => Err(ReconcileError::Validation(violations)),
        }
    }

    async fn lock(&self, id: &ResourceIdentity, deadline: Deadline) -> Result<ResourceLease> {
        let started = Instant::now();
        tokio::time::timeout_at(deadline.instant(), self.locks.acquire(id.lock_key()))
            .await
            .map_err(|_| ReconcileError::Timeout {
                operation: "acquire lock for",
                id: id.to_string(),
                elapsed: started.elapsed(),
            })
    }

    /// A single remote read bounded by the pass deadline.
    async fn read_remote<T, F>(
        &self,
        operation: &'static str,
        id: &ResourceIdentity,
        deadline: Deadline,
        call: F,
    ) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, RemoteError>>,
    {
        match within(deadline, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(ReconcileError::remote(operation, id, source)),
            Err(elapsed) => Err(ReconcileError::Timeout {
                operation,
                id: id.to_string(),
                elapsed,
            }),
        }
    }

    /// Issue a mutation against the instance and poll it to completion.
    async fn mutate<F>(
        &self,
        operation: &'static str,
        id: &ResourceIdentity,
        deadline: Deadline,
        start: F,
    ) -> Result<()>
    where
        F: Future<Output = std::result::Result<Pollable, RemoteError>>,
    {
        info!(vm = %id.name(), "Starting {}", operation);
        run_to_completion(start, deadline, self.config.poll_interval())
            .await
            .map_err(|e| wait_error(operation, id, e, ReconcileError::remote))?;
        info!(vm = %id.name(), "Finished {}", operation);
        Ok(())
    }

    /// Read the instance, its live state and its OS disk.
    async fn observe(
        &self,
        id: &ResourceIdentity,
        deadline: Deadline,
    ) -> Result<Option<ObservedState>> {
        let read = self.vms.get(id);
        let Some(vm) = self.read_remote("read", id, deadline, read).await? else {
            return Ok(None);
        };
        let instance = self
            .read_remote(
                "read instance view of",
                id,
                deadline,
                self.inspector.current_state(id),
            )
            .await?;

        let disk = match vm.os_disk_identity() {
            Some(disk_id) => match within(deadline, self.disks.get(&disk_id)).await {
                Ok(Ok(disk)) => disk,
                Ok(Err(e)) if e.is_not_found() => None,
                Ok(Err(e)) => return Err(ReconcileError::sub_resource("read", &disk_id, e)),
                Err(elapsed) => {
                    return Err(ReconcileError::Timeout {
                        operation: "read",
                        id: disk_id.to_string(),
                        elapsed,
                    });
                }
            },
            None => None,
        };
        if disk.is_none() {
            debug!(vm = %id.name(), "OS disk not found, it is either ephemeral or unmanaged");
        }

        Ok(Some(ObservedState {
            id: id.clone(),
            attributes: payload::observed_attributes(id, &vm, disk.as_ref()),
            instance,
            observed_at: Utc::now(),
        }))
    }

    async fn verify(&self, id: &ResourceIdentity, deadline: Deadline) -> Result<ObservedState> {
        self.observe(id, deadline)
            .await?
            .ok_or_else(|| ReconcileError::NotFound { id: id.to_string() })
    }

    async fn run_create(
        &self,
        pass: &mut Pass<'_>,
        id: &ResourceIdentity,
        desired: &dyn DesiredState,
        deadline: Deadline,
    ) -> Result<ObservedState> {
        pass.enter(Phase::Precheck);
        self.planner.validate(desired, &ChangeSet::empty())?;
        if self
            .read_remote("read", id, deadline, self.vms.get(id))
            .await?
            .is_some()
        {
            return Err(ReconcileError::AlreadyExists { id: id.to_string() });
        }

        pass.enter(Phase::BuildPayload);
        let vm = payload::build_create_payload(id, desired)?;

        pass.enter(Phase::Creating);
        self.mutate("create", id, deadline, self.vms.create_or_update(id, vm))
            .await?;
        self.audit.vm_created(id);

        pass.enter(Phase::Verifying);
        self.verify(id, deadline).await
    }

    async fn run_update(
        &self,
        pass: &mut Pass<'_>,
        id: &ResourceIdentity,
        desired: &dyn DesiredState,
        changes: &ChangeSet,
        deadline: Deadline,
    ) -> Result<ObservedState> {
        pass.enter(Phase::Planning);
        self.planner.validate(desired, changes)?;

        if changes.is_empty() {
            debug!(vm = %id.name(), "No changes to apply");
            pass.enter(Phase::Verifying);
            return self.verify(id, deadline).await;
        }

        let existing = self
            .read_remote("read", id, deadline, self.vms.get(id))
            .await?
            .ok_or_else(|| ReconcileError::NotFound { id: id.to_string() })?;
        let state = self
            .read_remote(
                "read instance view of",
                id,
                deadline,
                self.inspector.current_state(id),
            )
            .await?;

        let available_sizes = if changes.touches("size") {
            Some(
                self.read_remote(
                    "list available sizes for",
                    id,
                    deadline,
                    self.vms.list_available_sizes(id),
                )
                .await?,
            )
        } else {
            None
        };
        let host = HostFacts {
            available_sizes,
            os_disk: existing.os_disk_identity().or_else(|| {
                desired
                    .get_non_empty_str("os_disk.name")
                    .map(|name| id.disk(name))
            }),
        };
        let plan = self.planner.plan(desired, changes, &host)?;

        let power = state.power_state;
        let was_running = power == PowerState::Running;
        let power_off = plan.must_power_off && power.needs_power_off();
        let mut deallocate = plan.must_deallocate && power.needs_deallocate();
        if plan.is_disruptive() && !(power_off || deallocate) {
            debug!(vm = %id.name(), power_state = power.as_str(), "Already in the required state");
        }
        if deallocate && existing.has_ephemeral_os_disk() {
            info!(vm = %id.name(), "OS disk is ephemeral, skipping deallocate");
            deallocate = false;
        }

        let mut disrupted = false;
        if power_off || deallocate {
            pass.enter(Phase::Disrupting);
            if power_off {
                let options = PowerOffOptions {
                    skip_guest_shutdown: false,
                };
                self.mutate("power off", id, deadline, self.vms.power_off(id, options))
                    .await?;
                self.audit.vm_powered_off(id);
                disrupted = true;
            }
            if deallocate {
                let options = DeallocateOptions { hibernate: false };
                self.mutate("deallocate", id, deadline, self.vms.deallocate(id, options))
                    .await?;
                self.audit.vm_deallocated(id);
                disrupted = true;
            }
        }

        pass.enter(Phase::Updating);
        for op in &plan.deferred {
            let change = op.describe();
            info!(vm = %id.name(), disk = %op.disk().name(), change = %change, "Updating OS disk");
            run_to_completion(
                self.disks.update(op.disk(), op.payload()),
                deadline,
                self.config.poll_interval(),
            )
            .await
            .map_err(|e| wait_error("update", op.disk(), e, ReconcileError::sub_resource))?;
            self.audit.disk_updated(op.disk(), id, &change);
        }

        if let Some(update) = plan.update {
            self.mutate("update", id, deadline, self.vms.update(id, update))
                .await?;
            self.audit.vm_updated(id);
        }

        if was_running && disrupted {
            pass.enter(Phase::Restoring);
            self.mutate("start", id, deadline, self.vms.start(id)).await?;
            self.audit.vm_started(id);
        }

        pass.enter(Phase::Verifying);
        self.verify(id, deadline).await
    }

    async fn run_delete(
        &self,
        pass: &mut Pass<'_>,
        id: &ResourceIdentity,
        policy: &DeletePolicy,
        deadline: Deadline,
    ) -> Result<()> {
        let read = self.vms.get(id);
        let Some(existing) = self.read_remote("read", id, deadline, read).await? else {
            info!(vm = %id.name(), "Virtual machine is already gone");
            return Ok(());
        };

        let provisioning_failed = existing
            .provisioning_state()
            .is_some_and(|s| s.eq_ignore_ascii_case("Failed"));
        if policy.skip_shutdown || policy.force_deletion {
            info!(vm = %id.name(), "Skipping shutdown before delete");
        } else if provisioning_failed {
            info!(vm = %id.name(), "Provisioning state is Failed, skipping shutdown before delete");
        } else {
            pass.enter(Phase::Disrupting);
            let options = PowerOffOptions {
                skip_guest_shutdown: !policy.graceful_shutdown,
            };
            self.mutate("power off", id, deadline, self.vms.power_off(id, options))
                .await?;
            self.audit.vm_powered_off(id);
        }

        pass.enter(Phase::Deleting);
        let options = DeleteOptions {
            force_deletion: policy.force_deletion.then_some(true),
        };
        self.mutate("delete", id, deadline, self.vms.delete(id, options))
            .await?;
        self.audit.vm_deleted(id);

        pass.enter(Phase::PostDeleteCleanup);
        if policy.delete_os_disk {
            self.delete_os_disk(id, &existing, deadline).await?;
        }

        pass.enter(Phase::VerifyingAbsence);
        self.wait_until_absent(id, deadline).await
    }

    async fn delete_os_disk(
        &self,
        id: &ResourceIdentity,
        existing: &VirtualMachine,
        deadline: Deadline,
    ) -> Result<()> {
        let Some(disk) = existing.os_disk_identity() else {
            warn!(vm = %id.name(), "Unable to determine the OS disk, skipping its deletion");
            return Ok(());
        };

        info!(vm = %id.name(), disk = %disk.name(), "Deleting OS disk");
        let poll = self.config.poll_interval();
        match run_to_completion(self.disks.delete(&disk), deadline, poll).await {
            Ok(()) => {
                self.audit.disk_deleted(&disk, id);
                Ok(())
            }
            Err(WaitError::Rejected(e)) if e.is_not_found() => {
                debug!(disk = %disk.name(), "OS disk was already deleted");
                Ok(())
            }
            Err(e) => Err(wait_error("delete", &disk, e, ReconcileError::sub_resource)),
        }
    }

    /// Re-read until the instance is reported absent. Remote errors are
    /// retried until the deadline.
    async fn wait_until_absent(&self, id: &ResourceIdentity, deadline: Deadline) -> Result<()> {
        let interval = self.config.delete_verify_interval();
        let started = Instant::now();
        let absent = tokio::time::timeout_at(deadline.instant(), async {
            loop {
                match self.vms.get(id).await {
                    Ok(None) => return,
                    Err(e) if e.is_not_found() => return,
                    Ok(Some(_)) => debug!(vm = %id.name(), "Still present, waiting for deletion"),
                    Err(e) => {
                        warn!(
                            vm = %id.name(),
                            error = %e,
                            "Failed to read while waiting for deletion"
                        )
                    }
                }
                tokio::time::sleep(interval).await;
            }
        })
        .await;

        absent.map_err(|_| ReconcileError::Timeout {
            operation: "verify deletion of",
            id: id.to_string(),
            elapsed: started.elapsed(),
        })
    }
}

fn wait_error<T: fmt::Display>(
    operation: &'static str,
    target: T,
    error: WaitError,
    rejected: fn(&'static str, T, RemoteError) -> ReconcileError,
) -> ReconcileError {
    match error {
        WaitError::Rejected(source) => rejected(operation, target, source),
        WaitError::TimedOut(elapsed) => ReconcileError::Timeout {
            operation,
            id: target.to_string(),
            elapsed,
        },
    }
}

#[async_trait]
impl Reconciler for VirtualMachineReconciler {
    type Status = ObservedState;
    type DeleteOptions = DeletePolicy;

    async fn create(&self, desired: &dyn DesiredState) -> Result<ObservedState> {
        let id = self.identity_for(desired)?;
        info!(vm = %id.name(), resource_group = %id.resource_group(), "Creating virtual machine");

        let deadline = Deadline::after(self.config.timeouts.create());
        let _lease = self.lock(&id, deadline).await?;
        let mut pass = Pass::begin(&id, "create");
        match self.run_create(&mut pass, &id, desired, deadline).await {
            Ok(observed) => {
                pass.finish();
                Ok(observed)
            }
            Err(e) => Err(pass.fail(e)),
        }
    }

    async fn read(&self, id: &ResourceIdentity) -> Result<Option<ObservedState>> {
        let deadline = Deadline::after(self.config.timeouts.read());
        let observed = self.observe(id, deadline).await?;
        if observed.is_none() {
            info!(vm = %id.name(), "Virtual machine was not found");
        }
        Ok(observed)
    }

    async fn update(
        &self,
        id: &ResourceIdentity,
        desired: &dyn DesiredState,
        changes: &ChangeSet,
    ) -> Result<ObservedState> {
        info!(vm = %id.name(), changes = changes.len(), "Updating virtual machine");

        let deadline = Deadline::after(self.config.timeouts.update());
        let _lease = self.lock(id, deadline).await?;
        let mut pass = Pass::begin(id, "update");
        match self.run_update(&mut pass, id, desired, changes, deadline).await {
            Ok(observed) => {
                pass.finish();
                Ok(observed)
            }
            Err(e) => Err(pass.fail(e)),
        }
    }

    async fn delete(&self, id: &ResourceIdentity, options: &DeletePolicy) -> Result<()> {
        info!(vm = %id.name(), "Deleting virtual machine");

        let deadline = Deadline::after(self.config.timeouts.delete());
        let _lease = self.lock(id, deadline).await?;
        let mut pass = Pass::begin(id, "delete");
        match self.run_delete(&mut pass, id, options, deadline).await {
            Ok(()) => {
                pass.finish();
                Ok(())
            }
            Err(e) => Err(pass.fail(e)),
        }
    }
}
