// Copyright the device gateway fleet contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::device_id::DeviceId;
use crate::error::SessionError;

/// The live connection state for one device on one node (§3). Transport-specific I/O,
/// wire-level device protocols, and persistence are all external to this trait: the core
/// only ever calls the handful of methods below.
#[async_trait]
pub trait DeviceSession: Debug + Send + Sync {
    /// Immutable key into the Local Registry.
    fn device_id(&self) -> &DeviceId;

    /// Liveness probe used by `getSession`'s gate and the Liveness Sweeper. Treated as "alive"
    /// if the underlying check is inconclusive -- see `checkSessionAlive`'s "empty means true".
    async fn is_alive(&self) -> bool;

    /// Tears down the underlying transport. Called at most once per session instance; callers
    /// must not invoke any other method on a session after calling this.
    fn close(&self);

    fn client_address(&self) -> Option<SocketAddr>;

    /// The device operator (directory service) this session should be written through to, or
    /// `None` for an anonymous/transient session that is tracked locally only.
    fn operator(&self) -> Option<Arc<dyn DeviceOperator>>;

    /// True if `other` should be considered a replacement for `self` rather than the same
    /// logical connection re-observed.
    fn is_changed(&self, other: &dyn DeviceSession) -> bool;

    /// If this session is a child session wrapping a parent device's session (spec.md's
    /// `isWrapFrom`/`unwrap`), the parent's device id. Rust has no safe generic
    /// downcast-by-kind, so the back-edge is named directly instead of exposed through an
    /// `unwrap(kind)` escape hatch -- see DESIGN.md Open Question (a).
    fn parent_device_id(&self) -> Option<DeviceId> {
        None
    }
}

/// `register` / `unregister` (§3).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventKind {
    Register,
    Unregister,
}

/// A lifecycle transition fanned out by the Event Bus (§4.4).
#[derive(Clone, Debug)]
pub struct SessionEvent {
    pub kind: EventKind,
    pub session: Arc<dyn DeviceSession>,
    /// "After this event the device is (re)known to be online on some other node."
    pub remote_exists: bool,
}

/// One row of a session enumeration (`getSessionInfo` / `remoteSessions`).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionInfo {
    pub device_id: DeviceId,
    pub server_id: String,
    pub client_address: Option<SocketAddr>,
}

/// The external device directory: records "device D is online at node N" for global lookup
/// (GLOSSARY). Only the calls the core makes against it are specified here.
#[async_trait]
pub trait DeviceOperator: Debug + Send + Sync {
    async fn online(
        &self,
        server_id: &str,
        device_id: &DeviceId,
        address: Option<SocketAddr>,
    ) -> Result<(), SessionError>;

    async fn offline(&self) -> Result<(), SessionError>;
}

/// The abstract interface the core requires from the cluster/gossip collaborator (§4.5). The
/// concrete membership transport is an external collaborator; this is only the contract the
/// core consumes from it.
#[async_trait]
pub trait ClusterContract: Debug + Send + Sync {
    /// Stable identifier of this node.
    fn current_server_id(&self) -> &str;

    /// Cheap cache/gossip-backed query: "does some node believe this device is online?"
    async fn remote_session_is_alive(&self, device_id: &DeviceId) -> bool;

    /// Authoritative version of the above; may probe peers directly.
    async fn check_remote_session_is_alive(&self, device_id: &DeviceId) -> bool;

    async fn remove_remote_session(&self, device_id: &DeviceId) -> Result<u64, SessionError>;

    async fn remote_total_sessions(&self) -> u64;

    /// Enumeration of sessions known to the cluster, optionally scoped to one server.
    async fn remote_sessions(&self, server_id: Option<&str>) -> Vec<SessionInfo>;

    /// "Does this device still exist on another node?", called during local close to decide
    /// whether `unregister` should be reported with `remote_exists = true`.
    async fn init_session_connection(&self, session: Arc<dyn DeviceSession>) -> bool;
}
