//! In-memory control plane.
//!
//! [`SimulatedCloud`] implements both client traits against a process-local
//! state. Every call is recorded; mutations take effect when their operation
//! completes. Failures, stalls and slow operations can be injected per call
//! kind. The binary uses it for dry runs, the tests for everything else.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::clients::{
    DeallocateOptions, DeleteOptions, DiskClient, PowerOffOptions, VirtualMachineClient,
};
use crate::desired::DesiredState;
use crate::error::{RemoteError, Violations};
use crate::identity::{DiskIdentity, ResourceIdentity};
use crate::inspector::PowerState;
use crate::model::{
    Disk, DiskEncryption, DiskProperties, DiskSku, DiskUpdate, InstanceView, InstanceViewStatus,
    SubResource, VirtualMachine, VirtualMachineUpdate,
};
use crate::operation::{LongRunningOperation, OperationStatus, Pollable};
use crate::payload;

/// Size of an OS disk created without an explicit size.
const DEFAULT_OS_DISK_SIZE_GB: i64 = 127;

/// Remote call kinds, as recorded in the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Get,
    InstanceView,
    CreateOrUpdate,
    Update,
    Delete,
    PowerOff,
    Deallocate,
    Start,
    ListAvailableSizes,
    DiskGet,
    DiskUpdate,
    DiskDelete,
}

impl CallKind {
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            Self::Get | Self::InstanceView | Self::ListAvailableSizes | Self::DiskGet
        )
    }
}

/// One recorded remote call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Call {
    pub kind: CallKind,
    /// Name of the instance or disk the call addressed.
    pub target: String,
    /// Payload or options sent with the call.
    #[serde(skip_serializing_if = "Value::is_null")]
    pub detail: Value,
}

impl Call {
    pub fn is_mutating(&self) -> bool {
        self.kind.is_mutating()
    }
}

#[derive(Debug, Clone)]
struct SimVm {
    vm: VirtualMachine,
    power: PowerState,
}

#[derive(Debug, Default)]
struct State {
    vms: BTreeMap<String, SimVm>,
    disks: BTreeMap<String, Disk>,
    available_sizes: Vec<String>,
    calls: Vec<Call>,
    failures: HashMap<CallKind, VecDeque<RemoteError>>,
    stalled: HashSet<CallKind>,
    operation_polls: u32,
    linger_reads: u32,
    /// Deleted instances still returned by GET, with the reads left.
    lingering: BTreeMap<String, (VirtualMachine, u32)>,
}

type Effect = Box<dyn FnOnce(&mut State) -> Result<(), RemoteError> + Send>;

struct SimOperation {
    state: Arc<Mutex<State>>,
    remaining: u32,
    stalled: bool,
    effect: Option<Effect>,
}

#[async_trait]
impl LongRunningOperation for SimOperation {
    async fn poll(&mut self) -> Result<OperationStatus, RemoteError> {
        if self.stalled {
            return Ok(OperationStatus::InProgress);
        }
        if self.remaining > 0 {
            self.remaining -= 1;
            return Ok(OperationStatus::InProgress);
        }
        let Some(effect) = self.effect.take() else {
            return Ok(OperationStatus::Succeeded);
        };
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(match effect(&mut state) {
            Ok(()) => OperationStatus::Succeeded,
            Err(e) => OperationStatus::Failed(e),
        })
    }
}

/// Simulated compute and disk control plane.
#[derive(Clone, Default)]
pub struct SimulatedCloud {
    state: Arc<Mutex<State>>,
}

impl SimulatedCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sizes offered by the host of every instance.
    pub fn with_available_sizes<I, S>(self, sizes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock().available_sizes = sizes.into_iter().map(Into::into).collect();
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_vm(&self, id: &ResourceIdentity, vm: VirtualMachine, power: PowerState) {
        self.lock().vms.insert(vm_key(id), SimVm { vm, power });
    }

    pub fn insert_disk(&self, id: &DiskIdentity, disk: Disk) {
        self.lock().disks.insert(disk_key(id), disk);
    }

    /// Materialize the instance `desired` describes, as if it had been
    /// created earlier. The instance is running.
    pub fn seed_from_desired(
        &self,
        id: &ResourceIdentity,
        desired: &dyn DesiredState,
    ) -> Result<(), Violations> {
        let vm = payload::build_create_payload(id, desired)?;
        materialize(&mut self.lock(), id, vm);
        Ok(())
    }

    /// Reject the next call of `kind` with `error`. Queued errors are
    /// returned in order.
    pub fn fail_next(&self, kind: CallKind, error: RemoteError) {
        let mut state = self.lock();
        state.failures.entry(kind).or_default().push_back(error);
    }

    /// Operations of `kind` are accepted but never complete.
    pub fn stall(&self, kind: CallKind) {
        self.lock().stalled.insert(kind);
    }

    /// Number of polls reporting in progress before an operation completes.
    pub fn set_operation_polls(&self, polls: u32) {
        self.lock().operation_polls = polls;
    }

    /// Deleted instances stay visible to this many more reads.
    pub fn linger_after_delete(&self, reads: u32) {
        self.lock().linger_reads = reads;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn mutating_calls(&self) -> Vec<Call> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.is_mutating())
            .cloned()
            .collect()
    }

    /// Kinds of the mutating calls, in order.
    pub fn mutations(&self) -> Vec<CallKind> {
        self.mutating_calls().into_iter().map(|c| c.kind).collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn vm(&self, id: &ResourceIdentity) -> Option<VirtualMachine> {
        self.lock().vms.get(&vm_key(id)).map(|v| v.vm.clone())
    }

    pub fn power_state(&self, id: &ResourceIdentity) -> Option<PowerState> {
        self.lock().vms.get(&vm_key(id)).map(|v| v.power)
    }

    pub fn disk(&self, id: &DiskIdentity) -> Option<Disk> {
        self.lock().disks.get(&disk_key(id)).cloned()
    }

    /// Record a call and pop an injected failure for it.
    fn record(
        &self,
        kind: CallKind,
        target: &str,
        detail: Value,
    ) -> Result<MutexGuard<'_, State>, RemoteError> {
        let mut state = self.lock();
        debug!(kind = ?kind, target, "Simulated call");
        state.calls.push(Call {
            kind,
            target: target.to_string(),
            detail,
        });
        match state.failures.get_mut(&kind).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(state),
        }
    }

    fn accept(&self, state: &State, kind: CallKind, effect: Effect) -> Pollable {
        Box::new(SimOperation {
            state: self.state.clone(),
            remaining: state.operation_polls,
            stalled: state.stalled.contains(&kind),
            effect: Some(effect),
        })
    }

    fn power_transition(
        &self,
        id: &ResourceIdentity,
        kind: CallKind,
        detail: Value,
        next: PowerState,
    ) -> Result<Pollable, RemoteError> {
        let state = self.record(kind, id.name(), detail)?;
        let key = vm_key(id);
        let vm = state.vms.get(&key).ok_or_else(|| missing(id))?;
        if kind == CallKind::Deallocate && vm.vm.has_ephemeral_os_disk() {
            return Err(RemoteError::new(
                409,
                "OperationNotAllowed",
                "deallocation is not supported for VMs using an ephemeral OS disk",
            ));
        }
        let effect: Effect = Box::new(move |state| {
            let vm = state
                .vms
                .get_mut(&key)
                .ok_or_else(|| RemoteError::not_found(key.clone()))?;
            vm.power = next;
            Ok(())
        });
        Ok(self.accept(&state, kind, effect))
    }
}

fn vm_key(id: &ResourceIdentity) -> String {
    id.to_string().to_ascii_lowercase()
}

fn disk_key(id: &DiskIdentity) -> String {
    id.to_string().to_ascii_lowercase()
}

fn missing(id: impl std::fmt::Display) -> RemoteError {
    RemoteError::not_found(format!("{id} was not found"))
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Store a freshly created instance and its managed OS disk.
fn materialize(state: &mut State, id: &ResourceIdentity, mut vm: VirtualMachine) {
    let ephemeral = vm.has_ephemeral_os_disk();
    vm.id = Some(id.to_string());
    let props = vm.properties.get_or_insert_with(Default::default);
    props.vm_id = Some(Uuid::new_v4().to_string());
    props.provisioning_state = Some("Succeeded".to_string());

    let os_disk = props
        .storage_profile
        .get_or_insert_with(Default::default)
        .os_disk
        .get_or_insert_with(Default::default);
    let name = os_disk
        .name
        .get_or_insert_with(|| format!("{}_OsDisk_1_{}", id.name(), Uuid::new_v4().simple()))
        .clone();
    let size = *os_disk.disk_size_gb.get_or_insert(DEFAULT_OS_DISK_SIZE_GB);

    if !ephemeral {
        let disk_id = id.disk(&name);
        let managed = os_disk.managed_disk.get_or_insert_with(Default::default);
        managed.id = Some(disk_id.to_string());
        let disk = Disk {
            id: Some(disk_id.to_string()),
            name: Some(name),
            sku: managed
                .storage_account_type
                .clone()
                .map(|sku| DiskSku { name: Some(sku) }),
            properties: Some(DiskProperties {
                disk_size_gb: Some(size),
                encryption: managed
                    .disk_encryption_set
                    .as_ref()
                    .and_then(|s| s.id.clone())
                    .map(|set| DiskEncryption {
                        disk_encryption_set_id: Some(set),
                    }),
            }),
        };
        state.disks.insert(disk_key(&disk_id), disk);
    }

    state.vms.insert(
        vm_key(id),
        SimVm {
            vm,
            power: PowerState::Running,
        },
    );
}

/// Merge a partial update into an instance. Tags and identity are replaced
/// whole; an empty object clears the section it targets.
fn merge_update(
    vm: &VirtualMachine,
    update: &VirtualMachineUpdate,
) -> Result<VirtualMachine, RemoteError> {
    let mut current = to_value(vm);
    let patch = to_value(update);
    if let (Value::Object(target), Value::Object(patch)) = (&mut current, patch) {
        for (key, value) in patch {
            match key.as_str() {
                "properties" => {
                    let entry = target
                        .entry(key)
                        .or_insert_with(|| Value::Object(Map::new()));
                    merge_value(entry, value);
                }
                _ => {
                    target.insert(key, value);
                }
            }
        }
    }
    serde_json::from_value(current)
        .map_err(|e| RemoteError::new(400, "InvalidRequestContent", e.to_string()))
}

fn merge_value(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match value {
                    Value::Object(inner) if inner.is_empty() => {
                        target.remove(&key);
                    }
                    Value::Object(_) => {
                        let entry = target
                            .entry(key)
                            .or_insert_with(|| Value::Object(Map::new()));
                        merge_value(entry, value);
                    }
                    other => {
                        target.insert(key, other);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}

#[async_trait]
impl VirtualMachineClient for SimulatedCloud {
    async fn get(&self, id: &ResourceIdentity) -> Result<Option<VirtualMachine>, RemoteError> {
        let mut state = self.record(CallKind::Get, id.name(), Value::Null)?;
        let key = vm_key(id);
        if let Some(vm) = state.vms.get(&key) {
            return Ok(Some(vm.vm.clone()));
        }
        match state.lingering.get_mut(&key) {
            Some((vm, reads)) if *reads > 0 => {
                *reads -= 1;
                Ok(Some(vm.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn instance_view(&self, id: &ResourceIdentity) -> Result<InstanceView, RemoteError> {
        let state = self.record(CallKind::InstanceView, id.name(), Value::Null)?;
        let vm = state.vms.get(&vm_key(id)).ok_or_else(|| missing(id))?;
        let mut statuses = Vec::new();
        if let Some(provisioning) = vm.vm.provisioning_state() {
            statuses.push(InstanceViewStatus::new(format!(
                "ProvisioningState/{}",
                provisioning.to_ascii_lowercase()
            )));
        }
        if vm.power != PowerState::Unknown {
            statuses.push(InstanceViewStatus::new(format!(
                "PowerState/{}",
                vm.power.as_str()
            )));
        }
        Ok(InstanceView { statuses })
    }

    async fn create_or_update(
        &self,
        id: &ResourceIdentity,
        payload: VirtualMachine,
    ) -> Result<Pollable, RemoteError> {
        let state = self.record(CallKind::CreateOrUpdate, id.name(), to_value(&payload))?;
        let id = id.clone();
        let effect: Effect = Box::new(move |state| {
            materialize(state, &id, payload);
            Ok(())
        });
        Ok(self.accept(&state, CallKind::CreateOrUpdate, effect))
    }

    async fn update(
        &self,
        id: &ResourceIdentity,
        payload: VirtualMachineUpdate,
    ) -> Result<Pollable, RemoteError> {
        let state = self.record(CallKind::Update, id.name(), to_value(&payload))?;
        if !state.vms.contains_key(&vm_key(id)) {
            return Err(missing(id));
        }
        let key = vm_key(id);
        let effect: Effect = Box::new(move |state| {
            let vm = state
                .vms
                .get_mut(&key)
                .ok_or_else(|| RemoteError::not_found(key.clone()))?;
            vm.vm = merge_update(&vm.vm, &payload)?;
            Ok(())
        });
        Ok(self.accept(&state, CallKind::Update, effect))
    }

    async fn delete(
        &self,
        id: &ResourceIdentity,
        options: DeleteOptions,
    ) -> Result<Pollable, RemoteError> {
        let state = self.record(CallKind::Delete, id.name(), to_value(&options))?;
        if !state.vms.contains_key(&vm_key(id)) {
            return Err(missing(id));
        }
        let key = vm_key(id);
        let effect: Effect = Box::new(move |state| {
            if let Some(vm) = state.vms.remove(&key) {
                let reads = state.linger_reads;
                if reads > 0 {
                    state.lingering.insert(key, (vm.vm, reads));
                }
            }
            Ok(())
        });
        Ok(self.accept(&state, CallKind::Delete, effect))
    }

    async fn power_off(
        &self,
        id: &ResourceIdentity,
        options: PowerOffOptions,
    ) -> Result<Pollable, RemoteError> {
        self.power_transition(
            id,
            CallKind::PowerOff,
            to_value(&options),
            PowerState::Stopped,
        )
    }

    async fn deallocate(
        &self,
        id: &ResourceIdentity,
        options: DeallocateOptions,
    ) -> Result<Pollable, RemoteError> {
        self.power_transition(
            id,
            CallKind::Deallocate,
            to_value(&options),
            PowerState::Deallocated,
        )
    }

    async fn start(&self, id: &ResourceIdentity) -> Result<Pollable, RemoteError> {
        self.power_transition(id, CallKind::Start, Value::Null, PowerState::Running)
    }

    async fn list_available_sizes(
        &self,
        id: &ResourceIdentity,
    ) -> Result<Vec<String>, RemoteError> {
        let state = self.record(CallKind::ListAvailableSizes, id.name(), Value::Null)?;
        if !state.vms.contains_key(&vm_key(id)) {
            return Err(missing(id));
        }
        Ok(state.available_sizes.clone())
    }
}

#[async_trait]
impl DiskClient for SimulatedCloud {
    async fn get(&self, id: &DiskIdentity) -> Result<Option<Disk>, RemoteError> {
        let state = self.record(CallKind::DiskGet, id.name(), Value::Null)?;
        Ok(state.disks.get(&disk_key(id)).cloned())
    }

    async fn update(
        &self,
        id: &DiskIdentity,
        payload: DiskUpdate,
    ) -> Result<Pollable, RemoteError> {
        let state = self.record(CallKind::DiskUpdate, id.name(), to_value(&payload))?;
        let key = disk_key(id);
        if !state.disks.contains_key(&key) {
            return Err(missing(id));
        }
        let attached_running = state.vms.values().any(|v| {
            v.power == PowerState::Running
                && v.vm
                    .os_disk_identity()
                    .is_some_and(|d| disk_key(&d) == key)
        });
        if attached_running {
            return Err(RemoteError::new(
                409,
                "OperationNotAllowed",
                "the disk is attached to a running VM",
            ));
        }

        let effect: Effect = Box::new(move |state| {
            let disk = state
                .disks
                .get_mut(&key)
                .ok_or_else(|| RemoteError::not_found(key.clone()))?;
            let props = disk.properties.get_or_insert_with(Default::default);
            if let Some(size) = payload.properties.disk_size_gb {
                props.disk_size_gb = Some(size);
            }
            if let Some(encryption) = payload.properties.encryption.clone() {
                props.encryption = Some(encryption);
            }

            // the attached instance reports the disk through its own model
            for vm in state.vms.values_mut() {
                if !vm.vm.os_disk_identity().is_some_and(|d| disk_key(&d) == key) {
                    continue;
                }
                let Some(os_disk) = vm
                    .vm
                    .properties
                    .as_mut()
                    .and_then(|p| p.storage_profile.as_mut())
                    .and_then(|s| s.os_disk.as_mut())
                else {
                    continue;
                };
                if let Some(size) = payload.properties.disk_size_gb {
                    os_disk.disk_size_gb = Some(size);
                }
                if let Some(set) = payload
                    .properties
                    .encryption
                    .as_ref()
                    .and_then(|e| e.disk_encryption_set_id.as_deref())
                {
                    if let Some(managed) = os_disk.managed_disk.as_mut() {
                        managed.disk_encryption_set = Some(SubResource::new(set));
                    }
                }
            }
            Ok(())
        });
        Ok(self.accept(&state, CallKind::DiskUpdate, effect))
    }

    async fn delete(&self, id: &DiskIdentity) -> Result<Pollable, RemoteError> {
        let state = self.record(CallKind::DiskDelete, id.name(), Value::Null)?;
        let key = disk_key(id);
        if !state.disks.contains_key(&key) {
            return Err(missing(id));
        }
        let effect: Effect = Box::new(move |state| {
            state.disks.remove(&key);
            Ok(())
        });
        Ok(self.accept(&state, CallKind::DiskDelete, effect))
    }
}
