//! Client trait for managed disks.

use async_trait::async_trait;

use crate::error::RemoteError;
use crate::identity::DiskIdentity;
use crate::model::{Disk, DiskUpdate};
use crate::operation::Pollable;

/// Operations on a managed disk sub-resource.
#[async_trait]
pub trait DiskClient: Send + Sync {
    /// Get the disk. `Ok(None)` if it does not exist.
    async fn get(&self, id: &DiskIdentity) -> Result<Option<Disk>, RemoteError>;

    /// Apply a partial update to the disk.
    async fn update(&self, id: &DiskIdentity, payload: DiskUpdate) -> Result<Pollable, RemoteError>;

    async fn delete(&self, id: &DiskIdentity) -> Result<Pollable, RemoteError>;
}
