// Copyright the device gateway fleet contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Core of a distributed device session manager (see `SPEC_FULL.md`): per-node tracking of
//! which remotely connected devices are online against this node, with single-flight loading,
//! replacement, timeout, parent/child linkage, a lifecycle event bus, and the contract this
//! node needs from the rest of the cluster to answer "is device D online, and where?"
//!
//! Wire-level device protocols, the concrete gossip/membership transport, persistence,
//! configuration sourcing, logging setup, and metrics export are all external collaborators;
//! this crate only specifies the contracts it needs from them (`ClusterContract`,
//! `DeviceOperator`, `DeviceSession`).

mod config;
mod core;
mod device_id;
mod error;
mod events;
mod manager;
mod registry;
mod session;
mod session_ref;
mod sweeper;

#[cfg(test)]
mod tests;

pub use config::SessionManagerConfig;
pub use core::ComputeHook;
pub use device_id::DeviceId;
pub use error::SessionError;
pub use events::{EventBus, Handler, HandlerGuard};
pub use manager::SessionManager;
pub use session::{ClusterContract, DeviceOperator, DeviceSession, EventKind, SessionEvent, SessionInfo};
pub use session_ref::{BoxProducer, Computer, SessionResult};
