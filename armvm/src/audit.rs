//! Audit trail of remote mutations.
//!
//! One event per completed mutation, emitted on the `audit` tracing target.
//! A recording logger additionally keeps the messages in memory.

use std::sync::{Arc, Mutex, PoisonError};

use crate::identity::{DiskIdentity, ResourceIdentity};

/// Audit logger for the reconciliation engine
#[derive(Clone, Default)]
pub struct AuditLogger {
    component: String,
    enabled: bool,
    recorded: Option<Arc<Mutex<Vec<String>>>>,
}

impl AuditLogger {
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            enabled: true,
            recorded: None,
        }
    }

    /// Create a noop audit logger (for testing)
    pub fn new_noop() -> Self {
        Self::default()
    }

    /// Create a logger that also keeps every message in memory.
    pub fn recording(component: &str) -> Self {
        Self {
            recorded: Some(Arc::new(Mutex::new(Vec::new()))),
            ..Self::new(component)
        }
    }

    /// Messages logged so far by a recording logger.
    pub fn messages(&self) -> Vec<String> {
        match &self.recorded {
            Some(recorded) => recorded
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            None => Vec::new(),
        }
    }

    fn log(&self, message: String, object_ids: Vec<String>) {
        if !self.enabled {
            return;
        }
        tracing::info!(
            target: "audit",
            component = %self.component,
            objects = ?object_ids,
            "{}",
            message
        );
        if let Some(recorded) = &self.recorded {
            recorded
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(message);
        }
    }

    fn vm_event(&self, event: &str, id: &ResourceIdentity) {
        self.log(format!("VM {event}: {}", id.name()), vec![id.to_string()]);
    }

    // VM events
    pub fn vm_created(&self, id: &ResourceIdentity) {
        self.vm_event("created", id);
    }

    pub fn vm_updated(&self, id: &ResourceIdentity) {
        self.vm_event("updated", id);
    }

    pub fn vm_powered_off(&self, id: &ResourceIdentity) {
        self.vm_event("powered off", id);
    }

    pub fn vm_deallocated(&self, id: &ResourceIdentity) {
        self.vm_event("deallocated", id);
    }

    pub fn vm_started(&self, id: &ResourceIdentity) {
        self.vm_event("started", id);
    }

    pub fn vm_deleted(&self, id: &ResourceIdentity) {
        self.vm_event("deleted", id);
    }

    // Disk events
    pub fn disk_updated(&self, disk: &DiskIdentity, vm: &ResourceIdentity, change: &str) {
        self.log(
            format!("Disk updated: {} ({})", disk.name(), change),
            vec![disk.to_string(), vm.to_string()],
        );
    }

    pub fn disk_deleted(&self, disk: &DiskIdentity, vm: &ResourceIdentity) {
        self.log(
            format!("Disk deleted: {}", disk.name()),
            vec![disk.to_string(), vm.to_string()],
        );
    }
}
