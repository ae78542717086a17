//! driverd - hotplug driver resolution daemon
//!
//! Enumerates PCI and USB devices, looks up the kernel modules that can drive
//! them and loads those modules. After startup it follows devd's event socket
//! and repeats the process for newly attached USB devices.
//!
//! ## Pipeline
//! device record -> driver database (linker hints fallback) -> load policy
//! (exclusions, hook veto, loaded check) -> kldload
//!
//! The matching engines live in their own crates: `driver-db` for the text
//! driver database and `pnp-hints` for the kernel linker hints.

// Core error handling
pub mod error;

pub mod config;

// External collaborators
pub mod command;
pub mod enumerate;
pub mod hooks;
pub mod ids;
pub mod kmod;
pub mod netstart;

// Resolution and load decisions
pub mod orchestrator;

// Event handling
pub mod daemon;
pub mod dispatcher;
pub mod event;

#[cfg(test)]
pub(crate) mod log_capture;

pub use config::DaemonConfig;
pub use daemon::Daemon;
pub use dispatcher::{Dispatcher, EventSource, ReconnectPolicy};
pub use error::DaemonError;
pub use event::DevdEvent;
pub use orchestrator::{Candidate, CandidateSource, LoadOutcome, LoadPolicy, Orchestrator, Resolver};

pub use driver_db::DriverDatabase;
pub use driverd_types::{BusKind, DeviceRecord, Interface};
pub use pnp_hints::HintsResolver;
