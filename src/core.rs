// Copyright the device gateway fleet contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).
//
// Everything a `SessionRef` needs to reach back into: the registry it lives in, the event
// bus it publishes to, and the cluster/operator collaborators it writes through to (§4.5).
// Kept out of `manager.rs` so that `SessionRef` can hold a `Weak<ManagerCore>` without
// depending on the public-facing `SessionManager` type at all.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::config::SessionManagerConfig;
use crate::device_id::DeviceId;
use crate::error::SessionError;
use crate::events::EventBus;
use crate::registry::Registry;
use crate::session::{ClusterContract, DeviceSession, EventKind, SessionEvent};

/// The subclass hook of spec.md §9 ("Subclass hook `handleSessionCompute`"): a strategy
/// object injected at construction, given the previous session (if any) and the newly
/// loaded one, that may hand back a transformed session to install in place of the latter.
/// The default (`None`) is the identity transform.
pub type ComputeHook = Box<
    dyn Fn(Option<Arc<dyn DeviceSession>>, Arc<dyn DeviceSession>) -> BoxFuture<'static, Arc<dyn DeviceSession>>
        + Send
        + Sync,
>;

/// Everything shared between the public `SessionManager` handle, every `SessionRef`, and the
/// Liveness Sweeper. Never exposed outside the crate.
pub(crate) struct ManagerCore {
    pub(crate) config: SessionManagerConfig,
    pub(crate) registry: Registry,
    pub(crate) event_bus: Arc<EventBus>,
    pub(crate) cluster: Arc<dyn ClusterContract>,
    pub(crate) compute_hook: Option<ComputeHook>,
}

impl ManagerCore {
    pub(crate) fn new(
        config: SessionManagerConfig,
        cluster: Arc<dyn ClusterContract>,
        compute_hook: Option<ComputeHook>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: Registry::new(),
            event_bus: EventBus::new(),
            cluster,
            compute_hook,
        })
    }

    /// `checkSessionAlive` (§4.3): true iff the session reports itself alive. Our
    /// `DeviceSession::is_alive` is non-optional, so there is no "empty means true" case to
    /// translate -- the trait already collapses that to `true` at its own boundary.
    pub(crate) async fn check_session_alive(&self, session: &Arc<dyn DeviceSession>) -> bool {
        session.is_alive().await
    }

    /// `doRegister` (§4.1/§4.5): write-through to the operator if present, then fire
    /// `register` with whatever `remoteSessionIsAlive` currently reports.
    pub(crate) async fn write_through_register(
        &self,
        session: Arc<dyn DeviceSession>,
    ) -> Result<(), SessionError> {
        if let Some(operator) = session.operator() {
            operator
                .online(
                    self.cluster.current_server_id(),
                    session.device_id(),
                    session.client_address(),
                )
                .await?;
        }

        let remote_exists = self.cluster.remote_session_is_alive(session.device_id()).await;
        self.event_bus
            .fire_event(SessionEvent {
                kind: EventKind::Register,
                session,
                remote_exists,
            })
            .await;
        Ok(())
    }

    /// `handleSessionCompute(old, s)` (§4.1 step 3). Only the changed+operator-present branch
    /// closes `old` and write-throughs eagerly; the caller (`SessionRef::finish_loaded`) is
    /// told via the returned flag whether it must still close `old` itself (the generic
    /// identity-diff close of step 7, `afterLoaded`).
    pub(crate) async fn handle_session_compute(
        &self,
        old: Arc<dyn DeviceSession>,
        new: Arc<dyn DeviceSession>,
    ) -> Result<(Arc<dyn DeviceSession>, bool), SessionError> {
        if old.is_changed(new.as_ref()) {
            if let Some(operator) = new.operator() {
                old.close();
                operator
                    .online(
                        self.cluster.current_server_id(),
                        new.device_id(),
                        new.client_address(),
                    )
                    .await?;
                let transformed = match &self.compute_hook {
                    Some(hook) => hook(Some(old), new).await,
                    None => new,
                };
                return Ok((transformed, true));
            }
        }
        Ok((new, false))
    }

    /// Write-through on unregister (§4.5), including the documented same-tick re-register race
    /// (spec.md §9 Open Question (a), resolved in DESIGN.md): `contains` is a plain key check,
    /// not an identity compare against the session that just closed, so a fresh Ref installed
    /// for the same device id in the same tick is indistinguishable from "still registered
    /// elsewhere" here. We keep that behavior rather than paper over it with an identity check
    /// the original design never had.
    pub(crate) async fn write_through_unregister(&self, session: Arc<dyn DeviceSession>) {
        let device_id = session.device_id().clone();

        let remote_exists = if let Some(operator) = session.operator() {
            let exists_elsewhere = self.cluster.init_session_connection(session.clone()).await;
            if !exists_elsewhere && !self.registry.contains(&device_id) {
                if let Err(err) = operator.offline().await {
                    log::warn!("device operator offline() write-through failed for {device_id}: {err}");
                }
                false
            } else {
                true
            }
        } else {
            false
        };

        self.event_bus
            .fire_event(SessionEvent {
                kind: EventKind::Unregister,
                session,
                remote_exists,
            })
            .await;
    }

    /// `checkChildren` (§4.1 design note / scenario 6): probe each child's liveness after its
    /// parent is evicted. Errors from an individual child's probe/close never abort the sweep
    /// over the rest -- the same posture as the Liveness Sweeper itself (§4.3).
    pub(crate) async fn probe_children(self: &Arc<Self>, children: HashSet<DeviceId>) {
        for child_id in children {
            let Some(child_ref) = self.registry.get(&child_id) else {
                continue;
            };
            let Some(session) = child_ref.peek_loaded() else {
                continue;
            };
            if !self.check_session_alive(&session).await {
                child_ref.close(Some(session)).await;
            }
        }
    }
}
