//! Resource addressing.
//!
//! Virtual machines and disks are addressed by ARM resource ids of the form
//! `/subscriptions/{sub}/resourceGroups/{rg}/providers/Microsoft.Compute/{type}/{name}`.

use crate::error::ReconcileError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind tag used for serial access lock keys of virtual machines.
pub const VIRTUAL_MACHINE_KIND: &str = "azurerm_virtual_machine";

const PROVIDER: &str = "Microsoft.Compute";

/// Immutable (subscription, resource group, name) triple of a virtual machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceIdentity {
    subscription: String,
    resource_group: String,
    name: String,
}

impl ResourceIdentity {
    pub fn new(
        subscription: impl Into<String>,
        resource_group: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            subscription: subscription.into(),
            resource_group: resource_group.into(),
            name: name.into(),
        }
    }

    /// Parse a virtual machine id.
    pub fn parse(id: &str) -> Result<Self, ReconcileError> {
        let (subscription, resource_group, name) = parse_compute_id(id, "virtualMachines")?;
        Ok(Self {
            subscription,
            resource_group,
            name,
        })
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub fn resource_group(&self) -> &str {
        &self.resource_group
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock_key(&self) -> LockKey {
        LockKey::new(VIRTUAL_MACHINE_KIND, &self.name)
    }

    /// A managed disk living next to this machine.
    pub fn disk(&self, name: impl Into<String>) -> DiskIdentity {
        DiskIdentity {
            subscription: self.subscription.clone(),
            resource_group: self.resource_group.clone(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/subscriptions/{}/resourceGroups/{}/providers/{PROVIDER}/virtualMachines/{}",
            self.subscription, self.resource_group, self.name
        )
    }
}

/// Id of a managed disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiskIdentity {
    subscription: String,
    resource_group: String,
    name: String,
}

impl DiskIdentity {
    pub fn parse(id: &str) -> Result<Self, ReconcileError> {
        let (subscription, resource_group, name) = parse_compute_id(id, "disks")?;
        Ok(Self {
            subscription,
            resource_group,
            name,
        })
    }

    pub fn resource_group(&self) -> &str {
        &self.resource_group
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for DiskIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/subscriptions/{}/resourceGroups/{}/providers/{PROVIDER}/disks/{}",
            self.subscription, self.resource_group, self.name
        )
    }
}

/// Key of the serial access guard: logical name plus resource kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    kind: &'static str,
    name: String,
}

impl LockKey {
    pub fn new(kind: &'static str, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

fn parse_compute_id(
    id: &str,
    resource_type: &str,
) -> Result<(String, String, String), ReconcileError> {
    let invalid = |reason: &str| ReconcileError::InvalidIdentity {
        id: id.to_string(),
        reason: reason.to_string(),
    };

    let segments: Vec<&str> = id.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() != 8 {
        return Err(invalid("expected 8 path segments"));
    }

    let expect = |index: usize, key: &str| -> Result<(), ReconcileError> {
        if segments[index].eq_ignore_ascii_case(key) {
            Ok(())
        } else {
            let got = segments[index];
            Err(invalid(&format!("expected segment {key:?}, got {got:?}")))
        }
    };
    expect(0, "subscriptions")?;
    expect(2, "resourceGroups")?;
    expect(4, "providers")?;
    expect(5, PROVIDER)?;
    expect(6, resource_type)?;

    Ok((
        segments[1].to_string(),
        segments[3].to_string(),
        segments[7].to_string(),
    ))
}
