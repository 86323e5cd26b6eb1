//! GSPN asynchronous command-queue scheduler.
//!
//! A [`GspnDevice`] owns a fixed pool of command slots, a set of hardware
//! cores each with its own fill queue and fence timeline, and a single worker
//! thread that binds queued commands to free cores, triggers them, reaps them
//! when the hardware goes idle, and recovers cores that stay busy past their
//! execution deadline. Buffers, fences and registers are reached through the
//! collaborator traits in [`hal`]; [`sim`] provides in-process versions.
#![deny(missing_docs)]

/// Scheduler tunables.
pub mod config;
/// Core state machines and fill queues.
pub mod cores;
/// Long-lived device object and the ioctl boundary.
pub mod device;
/// Engine error type.
pub mod error;
/// Collaborator interfaces: buffers, fences and registers.
pub mod hal;
/// Command slots and frames.
pub mod kcmd;
/// Fixed-size command pool with empty and dissociation lists.
pub mod pool;
/// Enable rules, geometry validation, register programming and scaler coefficients.
pub mod program;
/// In-process collaborators used by tests and the daemon.
pub mod sim;
/// Notification primitives.
pub mod sync;

mod submit;
mod suspend;
mod worker;

pub use config::SchedulerConfig;
pub use device::{DeviceStats, GspnDevice, Occupancy, SuspendOutcome};
pub use error::{GspnError, Result};
