//! Client trait for the virtual machine resource.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::RemoteError;
use crate::identity::ResourceIdentity;
use crate::model::{InstanceView, VirtualMachine, VirtualMachineUpdate};
use crate::operation::Pollable;

/// Options of a delete call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOptions {
    /// Sent only when forced deletion is requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_deletion: Option<bool>,
}

/// Options of a power-off call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerOffOptions {
    pub skip_guest_shutdown: bool,
}

/// Options of a deallocate call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeallocateOptions {
    pub hibernate: bool,
}

/// Operations on a single virtual machine.
///
/// Mutating calls return a handle that must be polled to completion.
#[async_trait]
pub trait VirtualMachineClient: Send + Sync {
    /// Get the instance. `Ok(None)` if it does not exist.
    async fn get(&self, id: &ResourceIdentity) -> Result<Option<VirtualMachine>, RemoteError>;

    /// Get the live provisioning and power statuses.
    async fn instance_view(&self, id: &ResourceIdentity) -> Result<InstanceView, RemoteError>;

    /// Create the instance, or replace it entirely.
    async fn create_or_update(
        &self,
        id: &ResourceIdentity,
        payload: VirtualMachine,
    ) -> Result<Pollable, RemoteError>;

    /// Apply a partial update.
    async fn update(
        &self,
        id: &ResourceIdentity,
        payload: VirtualMachineUpdate,
    ) -> Result<Pollable, RemoteError>;

    async fn delete(
        &self,
        id: &ResourceIdentity,
        options: DeleteOptions,
    ) -> Result<Pollable, RemoteError>;

    /// Stop the instance while keeping it on its host.
    async fn power_off(
        &self,
        id: &ResourceIdentity,
        options: PowerOffOptions,
    ) -> Result<Pollable, RemoteError>;

    /// Stop the instance and release its compute resources.
    async fn deallocate(
        &self,
        id: &ResourceIdentity,
        options: DeallocateOptions,
    ) -> Result<Pollable, RemoteError>;

    async fn start(&self, id: &ResourceIdentity) -> Result<Pollable, RemoteError>;

    /// Sizes the instance can be resized to without leaving its current host.
    async fn list_available_sizes(&self, id: &ResourceIdentity)
    -> Result<Vec<String>, RemoteError>;
}
