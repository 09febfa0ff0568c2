// Copyright the device gateway fleet contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).
//
// The public surface of the core (§4.6): the one type adapters reach for. Everything it does
// is delegation -- into the Local Registry, a `SessionRef`, the Event Bus, or the Cluster
// Contract -- which is why this file stays thin.

use std::sync::{Arc, Mutex as StdMutex};

use futures::stream::{self, BoxStream, StreamExt};

use crate::config::SessionManagerConfig;
use crate::core::{ComputeHook, ManagerCore};
use crate::device_id::DeviceId;
use crate::error::SessionError;
use crate::events::{Handler, HandlerGuard};
use crate::session::{ClusterContract, DeviceSession, SessionInfo};
use crate::session_ref::{BoxProducer, Computer, SessionResult};
use crate::sweeper::Sweeper;

/// `SessionManager` (§4.6). One instance per node; shared (it is cheap to `Clone`, being a
/// thin `Arc` wrapper) across every protocol adapter on that node.
#[derive(Clone)]
pub struct SessionManager {
    core: Arc<ManagerCore>,
    sweeper: Arc<StdMutex<Option<Sweeper>>>,
}

impl SessionManager {
    /// Builds a manager with the default (identity) `handleSessionCompute` hook. Call `init()`
    /// before relying on the Liveness Sweeper; the manager is otherwise usable immediately.
    pub fn new(config: SessionManagerConfig, cluster: Arc<dyn ClusterContract>) -> Self {
        Self::with_compute_hook(config, cluster, None)
    }

    /// Builds a manager with an injected `handleSessionCompute` strategy (spec.md §9's
    /// "subclass hook", rendered here as a constructor-time callback rather than a protected
    /// virtual method -- there is no subclassing story for a struct with no base class).
    pub fn with_compute_hook(
        config: SessionManagerConfig,
        cluster: Arc<dyn ClusterContract>,
        compute_hook: Option<ComputeHook>,
    ) -> Self {
        Self {
            core: ManagerCore::new(config, cluster, compute_hook),
            sweeper: Arc::new(StdMutex::new(None)),
        }
    }

    /// Starts the Liveness Sweeper. Idempotent: calling twice without an intervening
    /// `shutdown()` leaves the existing sweeper running untouched.
    pub fn init(&self) {
        let mut slot = self.sweeper.lock().unwrap();
        if slot.is_none() {
            *slot = Some(Sweeper::start(&self.core));
        }
    }

    /// Stops the sweeper. Outstanding session loads are not force-cancelled, only ignored
    /// (§5); the registry and every currently loaded session are left exactly as they are.
    pub fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().unwrap().take() {
            sweeper.shutdown();
        }
    }

    /// `listenEvent` (§4.4). Drop the returned guard to unsubscribe.
    pub fn listen_event(&self, handler: Handler) -> HandlerGuard {
        self.core.event_bus.listen_event(handler)
    }

    /// `getSession(deviceId, unregisterWhenNotAlive)` (§4.6). When `unregister_when_not_alive`
    /// is true, a dead session is evicted as a side effect and reported as absent rather than
    /// handed back to the caller.
    pub async fn get_session(
        &self,
        device_id: &DeviceId,
        unregister_when_not_alive: bool,
    ) -> SessionResult {
        let Some(session_ref) = self.core.registry.get(device_id) else {
            return Ok(None);
        };

        let outcome = session_ref.subscribe().await?;
        let Some(session) = outcome else {
            return Ok(None);
        };

        if unregister_when_not_alive && !self.core.check_session_alive(&session).await {
            session_ref.close(Some(session)).await;
            return Ok(None);
        }

        Ok(Some(session))
    }

    /// `getSessions()` (§4.6): every currently loaded local session. A Ref with no load yet
    /// resolved (or whose load failed) contributes nothing, the same "empty contributes
    /// nothing" behavior `Option::flatten` gives the abstract spec's flatMap.
    pub fn get_sessions(&self) -> Vec<Arc<dyn DeviceSession>> {
        self.core
            .registry
            .snapshot()
            .into_iter()
            .filter_map(|(_, session_ref)| session_ref.peek_loaded())
            .collect()
    }

    /// `compute(deviceId, creator?, updater?)` (§4.2 first form).
    pub async fn compute_with(
        &self,
        device_id: DeviceId,
        creator: Option<BoxProducer>,
        updater: Option<Computer>,
    ) -> SessionResult {
        let weak = Arc::downgrade(&self.core);
        let session_ref = self
            .core
            .registry
            .compute_if(&weak, device_id, creator, updater)
            .await;
        match session_ref {
            Some(session_ref) => session_ref.subscribe().await,
            None => Ok(None),
        }
    }

    /// `compute(deviceId, computer)` (§4.2 second form): unconditional install-or-replace.
    pub async fn compute(&self, device_id: DeviceId, computer: Computer) -> SessionResult {
        let weak = Arc::downgrade(&self.core);
        let session_ref = self.core.registry.compute(&weak, device_id, computer).await;
        session_ref.subscribe().await
    }

    /// `remove(deviceId, onlyLocal)` (§4.6): evict locally, and -- unless `only_local` -- ask
    /// the cluster to remove elsewhere too, summing both counts.
    pub async fn remove(&self, device_id: &DeviceId, only_local: bool) -> Result<u64, SessionError> {
        let mut removed = 0u64;
        if let Some(session_ref) = self.core.registry.get(device_id) {
            session_ref.close(None).await;
            removed += 1;
        }
        if !only_local {
            removed += self.core.cluster.remove_remote_session(device_id).await?;
        }
        Ok(removed)
    }

    /// `isAlive(deviceId, onlyLocal)` (§4.6): a cheap existence check, not a liveness probe.
    pub async fn is_alive(&self, device_id: &DeviceId, only_local: bool) -> bool {
        if self.core.registry.contains(device_id) {
            return true;
        }
        if only_local {
            return false;
        }
        self.core.cluster.remote_session_is_alive(device_id).await
    }

    /// `checkAlive(deviceId, onlyLocal)` (§4.6): stronger than `is_alive` -- requires the local
    /// session's operator write-through to actually succeed, keeping the directory record
    /// fresh, and falls back to the authoritative remote probe rather than the cheap one.
    pub async fn check_alive(&self, device_id: &DeviceId, only_local: bool) -> bool {
        if let Some(session_ref) = self.core.registry.get(device_id) {
            if let Some(session) = session_ref.peek_loaded() {
                if let Some(operator) = session.operator() {
                    let refreshed = operator
                        .online(
                            self.core.cluster.current_server_id(),
                            session.device_id(),
                            session.client_address(),
                        )
                        .await
                        .is_ok();
                    if refreshed {
                        return true;
                    }
                } else {
                    return true;
                }
            }
        }
        if only_local {
            return false;
        }
        self.core.cluster.check_remote_session_is_alive(device_id).await
    }

    /// `totalSessions(onlyLocal)` (§4.6).
    pub async fn total_sessions(&self, only_local: bool) -> u64 {
        let local = self.core.registry.len() as u64;
        if only_local {
            return local;
        }
        local + self.core.cluster.remote_total_sessions().await
    }

    /// `getSessionInfo(serverId?)` (§4.6): the local snapshot (scoped to `server_id` when it
    /// names a server other than this one, which yields nothing local) concatenated with the
    /// cluster's remote enumeration.
    pub async fn get_session_info(&self, server_id: Option<&str>) -> BoxStream<'static, SessionInfo> {
        let current = self.core.cluster.current_server_id().to_string();
        let include_local = server_id.map_or(true, |wanted| wanted == current);

        let local: Vec<SessionInfo> = if include_local {
            self.core
                .registry
                .snapshot()
                .into_iter()
                .filter_map(|(device_id, session_ref)| {
                    session_ref.peek_loaded().map(|session| SessionInfo {
                        device_id,
                        server_id: current.clone(),
                        client_address: session.client_address(),
                    })
                })
                .collect()
        } else {
            Vec::new()
        };

        let remote = self.core.cluster.remote_sessions(server_id).await;
        stream::iter(local.into_iter().chain(remote)).boxed()
    }
}
