//! Clients for the remote control plane.
//!
//! The engine talks to two remote entities:
//! - compute: virtual machine lifecycle and power operations
//! - disk: the managed OS disk, updated and deleted separately
//!
//! Transport, wire format and authentication live behind these traits.

pub mod compute;
pub mod disk;

pub use compute::{DeallocateOptions, DeleteOptions, PowerOffOptions, VirtualMachineClient};
pub use disk::DiskClient;
