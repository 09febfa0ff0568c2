// Copyright the device gateway fleet contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).
//
// The Liveness Sweeper (§4.3): a single periodic task that walks every locally loaded session
// and evicts the ones that no longer answer alive. Spawned onto the caller's runtime rather
// than a dedicated OS thread, the same "borrow, don't own, the executor" posture the teacher's
// `task_executor::Executor` takes toward background work it does not need exclusive control of.

use std::sync::{Arc, Weak};

use tokio::task::JoinHandle;

use crate::core::ManagerCore;

/// Handle to the running sweep task. Dropping or calling `shutdown` aborts it; in-flight
/// liveness probes are not force-cancelled, matching spec.md §5's cancellation guarantee that
/// shutdown disposes the scheduler without force-cancelling outstanding work.
pub(crate) struct Sweeper {
    join: JoinHandle<()>,
}

impl Sweeper {
    /// `init()`: starts the sweep loop on the ambient runtime at `session_check_interval`.
    pub(crate) fn start(core: &Arc<ManagerCore>) -> Self {
        let weak: Weak<ManagerCore> = Arc::downgrade(core);
        let interval = core.config.session_check_interval;
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so the first real sweep happens one
            // full interval after startup rather than right away.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(core) = weak.upgrade() else {
                    return;
                };
                sweep_once(&core).await;
            }
        });
        Self { join }
    }

    pub(crate) fn shutdown(self) {
        self.join.abort();
    }
}

/// One tick: scan every Ref with a loaded session, probe it, and evict the dead. A single
/// session's probe failing never halts the rest of the sweep (§4.3, §7).
async fn sweep_once(core: &Arc<ManagerCore>) {
    for (device_id, session_ref) in core.registry.snapshot() {
        let Some(session) = session_ref.peek_loaded() else {
            continue;
        };
        if !core.check_session_alive(&session).await {
            log::debug!("liveness sweep evicting session for device {device_id}: not alive");
            session_ref.close(Some(session)).await;
        }
    }
}
