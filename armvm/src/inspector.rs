//! Instance-state inspector.
//!
//! Reads the instance view and normalizes its opaque status codes
//! (`PowerState/running`, `ProvisioningState/succeeded`, ...) so the engine
//! can skip disruptive operations that already happened.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::clients::VirtualMachineClient;
use crate::error::RemoteError;
use crate::identity::ResourceIdentity;
use crate::model::InstanceViewStatus;

/// Normalized power state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    Running,
    Stopping,
    Stopped,
    Deallocating,
    Deallocated,
    Unknown,
}

impl PowerState {
    pub fn from_code(code: &str) -> Self {
        match code.to_ascii_lowercase().as_str() {
            "running" | "starting" => Self::Running,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            "deallocating" => Self::Deallocating,
            "deallocated" => Self::Deallocated,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Deallocating => "deallocating",
            Self::Deallocated => "deallocated",
            Self::Unknown => "unknown",
        }
    }

    /// A power-off is still needed to reach at least `stopped`.
    pub fn needs_power_off(&self) -> bool {
        !matches!(self, Self::Stopped | Self::Deallocating | Self::Deallocated)
    }

    /// A deallocate is still needed to reach `deallocated`.
    pub fn needs_deallocate(&self) -> bool {
        !matches!(self, Self::Deallocated)
    }
}

/// Provisioning and power state read in one instance-view call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteInstanceState {
    pub provisioning_state: Option<String>,
    pub power_state: PowerState,
}

impl RemoteInstanceState {
    pub fn from_statuses(statuses: &[InstanceViewStatus]) -> Self {
        let mut state = Self {
            provisioning_state: None,
            power_state: PowerState::Unknown,
        };
        for code in statuses.iter().filter_map(|s| s.code.as_deref()) {
            if let Some((kind, value)) = code.split_once('/') {
                if kind.eq_ignore_ascii_case("PowerState") {
                    state.power_state = PowerState::from_code(value);
                } else if kind.eq_ignore_ascii_case("ProvisioningState") {
                    state.provisioning_state = Some(value.to_string());
                }
            }
        }
        state
    }
}

/// Reads live instance state. Results are never cached.
#[derive(Clone)]
pub struct InstanceStateInspector {
    client: Arc<dyn VirtualMachineClient>,
}

impl InstanceStateInspector {
    pub fn new(client: Arc<dyn VirtualMachineClient>) -> Self {
        Self { client }
    }

    pub async fn current_state(
        &self,
        id: &ResourceIdentity,
    ) -> Result<RemoteInstanceState, RemoteError> {
        let view = self.client.instance_view(id).await?;
        let state = RemoteInstanceState::from_statuses(&view.statuses);
        debug!(vm = %id.name(), power_state = state.power_state.as_str(), "Read instance view");
        Ok(state)
    }

    pub async fn current_power_state(
        &self,
        id: &ResourceIdentity,
    ) -> Result<PowerState, RemoteError> {
        Ok(self.current_state(id).await?.power_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statuses(codes: &[&str]) -> Vec<InstanceViewStatus> {
        codes.iter().map(|c| InstanceViewStatus::new(*c)).collect()
    }

    #[test]
    fn test_normalizes_codes() {
        let state = RemoteInstanceState::from_statuses(&statuses(&[
            "ProvisioningState/succeeded",
            "PowerState/deallocated",
        ]));
        assert_eq!(state.power_state, PowerState::Deallocated);
        assert_eq!(state.provisioning_state.as_deref(), Some("succeeded"));
    }

    #[test]
    fn test_unknown_codes() {
        let state = RemoteInstanceState::from_statuses(&statuses(&[
            "PowerState/hibernated",
            "OSState/generalized",
        ]));
        assert_eq!(state.power_state, PowerState::Unknown);
        assert_eq!(state.provisioning_state, None);

        assert_eq!(
            RemoteInstanceState::from_statuses(&[]).power_state,
            PowerState::Unknown
        );
    }

    #[test]
    fn test_starting_counts_as_running() {
        assert_eq!(PowerState::from_code("Starting"), PowerState::Running);
    }

    #[test]
    fn test_short_circuits() {
        assert!(PowerState::Running.needs_power_off());
        assert!(PowerState::Unknown.needs_power_off());
        assert!(!PowerState::Stopped.needs_power_off());
        assert!(PowerState::Stopped.needs_deallocate());
        assert!(!PowerState::Deallocating.needs_power_off());
        assert!(PowerState::Deallocating.needs_deallocate());
        assert!(!PowerState::Deallocated.needs_deallocate());
    }
}
