//! Single-instance coordination: the named mutex and the launch state
//! machine built on top of it and the IPC endpoint.

pub mod launch;
pub mod lock;

pub use launch::{coordinate, CoordinationOptions, LaunchOutcome, LaunchRequest};
pub use lock::{InstanceError, InstanceLock, MutexName};
