//! Reconcilers for remote resources.
//!
//! A reconciler converts desired configuration into create, read, update
//! and delete passes against the remote control plane. It holds no state
//! across passes; the remote system is the source of truth.

mod phase;
pub mod vm;

pub use phase::Phase;
pub use vm::{DeletePolicy, ObservedState, VirtualMachineReconciler};

use async_trait::async_trait;

use crate::desired::{ChangeSet, DesiredState};
use crate::error::Result;
use crate::identity::ResourceIdentity;

/// Trait for resource reconcilers.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// The observed state returned by passes.
    type Status: Send;
    /// Options of a delete pass.
    type DeleteOptions: Send + Sync;

    /// Create the resource. Fails if it already exists.
    async fn create(&self, desired: &dyn DesiredState) -> Result<Self::Status>;

    /// Read the resource. `Ok(None)` if it does not exist.
    async fn read(&self, id: &ResourceIdentity) -> Result<Option<Self::Status>>;

    /// Converge the resource towards `desired`, applying only `changes`.
    async fn update(
        &self,
        id: &ResourceIdentity,
        desired: &dyn DesiredState,
        changes: &ChangeSet,
    ) -> Result<Self::Status>;

    /// Delete the resource and wait until it is gone.
    async fn delete(&self, id: &ResourceIdentity, options: &Self::DeleteOptions) -> Result<()>;
}
