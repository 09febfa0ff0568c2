// Copyright the device gateway fleet contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).
//
// Single-flight, replaceable load cell (§4.1). Adapted from the take-once producer slot plus
// broadcast `watch` channel of `async_value::AsyncValue` (see the upstream engine workspace's
// `async_value` crate) and from the RunToken-gated "does this completion still belong to the
// current generation" check in that workspace's `graph::entry::Entry::complete`.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::core::ManagerCore;
use crate::device_id::DeviceId;
use crate::error::SessionError;
use crate::session::DeviceSession;

/// `Ok(Some(session))` is a value, `Ok(None)` is the producer completing without emitting one,
/// `Err(_)` is a load failure or timeout. Mirrors the value/empty/error trichotomy of the
/// `await` slot in spec.md §3.
pub type SessionResult = Result<Option<Arc<dyn DeviceSession>>, SessionError>;

pub type BoxProducer = Box<dyn FnOnce() -> BoxFuture<'static, SessionResult> + Send>;

/// A mapper from "the currently loaded session, if any" to a new load. Used both by
/// `compute`'s unconditional form and, wrapped, by `compute`'s creator/updater form.
pub type Computer =
    Box<dyn FnOnce(Option<Arc<dyn DeviceSession>>) -> BoxFuture<'static, SessionResult> + Send>;

/// One take-once load and its broadcast slot. Replacing the pending load (`update`) swaps in
/// a fresh `Generation`; dropping the last strong reference to the old one closes its `tx`,
/// which is exactly the "signal empty to any prior subscribers that had already latched on"
/// behavior spec.md describes, with no separate cancellation-value channel required.
struct Generation {
    producer: Mutex<Option<BoxProducer>>,
    tx: watch::Sender<Option<SessionResult>>,
    abort: Mutex<Option<AbortHandle>>,
}

impl Generation {
    fn new(producer: BoxProducer) -> Arc<Self> {
        let (tx, _rx) = watch::channel(None);
        Arc::new(Self {
            producer: Mutex::new(Some(producer)),
            tx,
            abort: Mutex::new(None),
        })
    }
}

struct RefState {
    loaded: Option<Arc<dyn DeviceSession>>,
    children: HashSet<DeviceId>,
    generation: Arc<Generation>,
}

/// The registry's per-device cell (GLOSSARY: "Ref"). Owned by the Local Registry's map slot;
/// callers must not hold onto a `SessionRef` after it has been evicted (identity-based close
/// via `Registry::remove_if_matches` honours this).
pub(crate) struct SessionRef {
    device_id: DeviceId,
    core: Weak<ManagerCore>,
    state: Mutex<RefState>,
}

impl SessionRef {
    pub(crate) fn new(device_id: DeviceId, core: Weak<ManagerCore>, producer: BoxProducer) -> Arc<Self> {
        Arc::new(Self {
            device_id,
            core,
            state: Mutex::new(RefState {
                loaded: None,
                children: HashSet::new(),
                generation: Generation::new(producer),
            }),
        })
    }

    pub(crate) fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub(crate) fn peek_loaded(&self) -> Option<Arc<dyn DeviceSession>> {
        self.state.lock().loaded.clone()
    }

    pub(crate) fn add_child(&self, child: DeviceId) {
        self.state.lock().children.insert(child);
    }

    fn remove_child(&self, child: &DeviceId) {
        self.state.lock().children.remove(child);
    }

    /// The public subscribe point (`ref()`). On first subscription, atomically takes and
    /// starts the pending load; later subscribers (of the same generation) simply await the
    /// same broadcast slot, replaying the outcome if the load already completed.
    pub(crate) async fn subscribe(self: &Arc<Self>) -> SessionResult {
        let generation = self.state.lock().generation.clone();
        self.ensure_started(&generation);

        let mut rx = generation.tx.subscribe();
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                // The sender was dropped without ever sending: this generation was replaced
                // (or its task was aborted) out from under us. A waiter latched onto a
                // superseded slot observes empty, never a stale value.
                return Ok(None);
            }
        }
    }

    fn ensure_started(self: &Arc<Self>, generation: &Arc<Generation>) {
        let producer = generation.producer.lock().take();
        let Some(producer) = producer else {
            return;
        };
        let entry = self.clone();
        let generation2 = generation.clone();
        let join = tokio::spawn(async move {
            entry.run_generation(generation2, producer).await;
        });
        *generation.abort.lock() = Some(join.abort_handle());
    }

    /// Replace the pending load (`update`): cancels any running load, installs a fresh
    /// broadcast slot, and binds the new loader to `mapper(current loaded)`.
    pub(crate) async fn update(self: &Arc<Self>, mapper: Computer) {
        let old_generation = {
            let mut state = self.state.lock();
            let current = state.loaded.clone();
            let producer: BoxProducer = Box::new(move || mapper(current));
            std::mem::replace(&mut state.generation, Generation::new(producer))
        };
        if let Some(abort) = old_generation.abort.lock().take() {
            abort.abort();
        }
        // `old_generation` drops here (absent any still-running task holding a clone), which
        // drops its `tx` and unblocks any subscriber still waiting on it with `Ok(None)`.
    }

    fn still_current(&self, generation: &Arc<Generation>) -> bool {
        Arc::ptr_eq(&self.state.lock().generation, generation)
    }

    async fn run_generation(self: Arc<Self>, generation: Arc<Generation>, producer: BoxProducer) {
        let Some(core) = self.core.upgrade() else {
            return;
        };

        let outcome: SessionResult =
            match tokio::time::timeout(core.config.session_load_timeout, producer()).await {
                Ok(result) => result,
                Err(_elapsed) => Err(SessionError::LoadTimeout {
                    device_id: self.device_id.clone(),
                }),
            };

        match outcome {
            Ok(Some(session)) => self.finish_loaded(&core, session, &generation).await,
            Ok(None) => self.finish_empty(&core, &generation).await,
            Err(err) => self.finish_error(&core, err, &generation, false).await,
        }
    }

    async fn finish_loaded(
        self: &Arc<Self>,
        core: &Arc<ManagerCore>,
        session: Arc<dyn DeviceSession>,
        generation: &Arc<Generation>,
    ) {
        if let Some(parent_id) = session.parent_device_id() {
            if let Some(parent_ref) = core.registry.get(&parent_id) {
                parent_ref.add_child(self.device_id.clone());
            }
        }

        let previous = self.state.lock().loaded.clone();

        if previous.is_none() {
            if let Err(err) = core.write_through_register(session.clone()).await {
                self.finish_error(core, err, generation, false).await;
                return;
            }
            self.commit_loaded(session, generation).await;
            return;
        }

        match core.handle_session_compute(previous, session).await {
            Ok((transformed, already_closed)) => {
                self.commit_loaded_after_replace(transformed, already_closed, generation)
                    .await;
            }
            Err(err) => {
                // `handle_session_compute` only fails after it has already closed the prior
                // session (it closes `old` before attempting the fallible write-through), so
                // eviction here must not close it a second time.
                self.finish_error(core, err, generation, true).await;
            }
        }
    }

    async fn commit_loaded(self: &Arc<Self>, session: Arc<dyn DeviceSession>, generation: &Arc<Generation>) {
        if self.still_current(generation) {
            self.state.lock().loaded = Some(session.clone());
        }
        generation.tx.send_replace(Some(Ok(Some(session))));
    }

    async fn commit_loaded_after_replace(
        self: &Arc<Self>,
        transformed: Arc<dyn DeviceSession>,
        already_closed: bool,
        generation: &Arc<Generation>,
    ) {
        if self.still_current(generation) {
            let old = self.state.lock().loaded.replace(transformed.clone());
            if let Some(old) = old {
                if !already_closed && !Arc::ptr_eq(&old, &transformed) {
                    old.close();
                }
            }
        }
        generation.tx.send_replace(Some(Ok(Some(transformed))));
    }

    async fn finish_empty(self: &Arc<Self>, core: &Arc<ManagerCore>, generation: &Arc<Generation>) {
        if self.still_current(generation) {
            self.evict_current(core, false).await;
        }
        generation.tx.send_replace(Some(Ok(None)));
    }

    async fn finish_error(
        self: &Arc<Self>,
        core: &Arc<ManagerCore>,
        err: SessionError,
        generation: &Arc<Generation>,
        old_already_closed: bool,
    ) {
        if self.still_current(generation) {
            self.evict_current(core, old_already_closed).await;
        }
        generation.tx.send_replace(Some(Err(err)));
    }

    /// Shared tail of every full-eviction path (`loadEmpty`, `loadError`, explicit `close`):
    /// remove this Ref from the Local Registry, close and write-through-unregister the
    /// previously loaded session if any, unlink from the parent's `children`, and probe any
    /// children of our own (§4.1 steps 5-6, §4.5, scenario 6).
    async fn evict_current(self: &Arc<Self>, core: &Arc<ManagerCore>, already_closed: bool) {
        if !core.registry.remove_if_matches(&self.device_id, self) {
            // Already evicted (or replaced by a brand new Ref for the same device id); this
            // call is stale and must not double-fire the unregister write-through.
            return;
        }

        let (old, children) = {
            let mut state = self.state.lock();
            (state.loaded.take(), std::mem::take(&mut state.children))
        };

        if let Some(session) = old {
            if !already_closed {
                session.close();
            }
            if let Some(parent_id) = session.parent_device_id() {
                if let Some(parent_ref) = core.registry.get(&parent_id) {
                    parent_ref.remove_child(&self.device_id);
                }
            }
            core.write_through_unregister(session).await;
        }

        core.probe_children(children).await;
    }

    /// Evict (`close`). If `expected` is given, evicts only if it still matches the current
    /// `loaded` session; either way, eviction only takes effect while the Local Registry still
    /// points at this exact Ref (R1/R4).
    pub(crate) async fn close(self: &Arc<Self>, expected: Option<Arc<dyn DeviceSession>>) {
        let Some(core) = self.core.upgrade() else {
            return;
        };

        if let Some(exp) = &expected {
            let matches = matches!(&self.state.lock().loaded, Some(cur) if Arc::ptr_eq(cur, exp));
            if !matches {
                return;
            }
        }

        if let Some(abort) = self.state.lock().generation.abort.lock().take() {
            abort.abort();
        }

        self.evict_current(&core, false).await;
    }
}
