// Copyright the device gateway fleet contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::FutureExt;
use parking_lot::RwLock;

use crate::session::SessionEvent;

pub type Handler = Arc<dyn Fn(SessionEvent) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

/// An append-only fan-out of session lifecycle events (§4.4). Handlers are isolated from one
/// another: a handler that panics or never resolves does not stop its siblings from running,
/// mirroring the posture `task_executor::TailTasks::wait` takes toward failures of individual
/// background tasks.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<Vec<(u64, Handler)>>,
    next_id: AtomicU64,
}

/// Disposable returned by `listen_event`. Dropping it removes the handler; it need not be
/// polled or awaited.
pub struct HandlerGuard {
    id: u64,
    bus: Arc<EventBus>,
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        self.bus.handlers.write().retain(|(id, _)| *id != self.id);
    }
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Appends `handler`, preserving registration order; no handler may assume exclusivity.
    pub fn listen_event(self: &Arc<Self>, handler: Handler) -> HandlerGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.write().push((id, handler));
        HandlerGuard {
            id,
            bus: self.clone(),
        }
    }

    /// Walks the handler list in registration order, runs each handler, and isolates
    /// per-handler failures (logged, not propagated). Completes when all handlers complete.
    pub async fn fire_event(&self, event: SessionEvent) {
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();

        let mut joins = Vec::with_capacity(handlers.len());
        for handler in handlers {
            let event = event.clone();
            joins.push(tokio::spawn(async move {
                AssertUnwindSafe(handler(event)).catch_unwind().await
            }));
        }

        for join in joins {
            match join.await {
                Ok(Ok(())) => {}
                Ok(Err(_panic)) => {
                    log::error!("session event handler panicked; other handlers were unaffected");
                }
                Err(join_error) => {
                    log::error!("session event handler task failed: {join_error}");
                }
            }
        }
    }
}
