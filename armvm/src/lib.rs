//! armvm: reconciles declarative virtual machine configuration against a
//! remote compute control plane.
//!
//! A pass takes a desired configuration and the set of attributes that
//! changed, decides which disruptive operations the change needs, and drives
//! the remote through them in order:
//!
//! - [`classifier`] maps attributes to disruption classes and constraints
//! - [`plan`] turns a change set into a [`plan::DisruptionPlan`]
//! - [`reconciler`] executes create, read, update and delete passes
//! - [`clients`] are the seams to the remote; [`sim`] implements them in memory

pub mod audit;
pub mod classifier;
pub mod clients;
pub mod config;
pub mod desired;
pub mod error;
pub mod guard;
pub mod identity;
pub mod inspector;
pub mod model;
pub mod operation;
pub mod payload;
pub mod plan;
pub mod reconciler;
pub mod sim;

pub use config::EngineConfig;
pub use desired::{ChangeSet, ConfigSnapshot, DesiredState};
pub use error::{ReconcileError, RemoteError, Result};
pub use identity::ResourceIdentity;
pub use reconciler::{DeletePolicy, ObservedState, Reconciler, VirtualMachineReconciler};
