// Copyright the device gateway fleet contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).
//
// Fakes for the three collaborator traits plus scenario/property tests, in the same style as
// the upstream engine workspace's `graph::tests` (a single `tests.rs` alongside the module it
// exercises, built on `#[tokio::test]` and small local `Node`-style fakes).

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::StreamExt;

use crate::{
    ClusterContract, DeviceId, DeviceOperator, DeviceSession, EventKind, SessionError, SessionEvent,
    SessionInfo, SessionManager, SessionManagerConfig,
};
use crate::session_ref::{BoxProducer, SessionResult};

fn addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
}

struct FakeSession {
    id: DeviceId,
    alive: AtomicBool,
    closed: AtomicBool,
    changed: AtomicBool,
    address: Option<SocketAddr>,
    operator: Option<Arc<dyn DeviceOperator>>,
    parent: Option<DeviceId>,
}

impl FakeSession {
    fn new(id: &str, operator: Option<Arc<dyn DeviceOperator>>) -> Arc<Self> {
        Arc::new(Self {
            id: DeviceId::new(id),
            alive: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            changed: AtomicBool::new(true),
            address: Some(addr(1234)),
            operator,
            parent: None,
        })
    }

    fn with_parent(id: &str, operator: Option<Arc<dyn DeviceOperator>>, parent: DeviceId) -> Arc<Self> {
        let session = Self::new(id, operator);
        Arc::new(Self {
            parent: Some(parent),
            ..Arc::try_unwrap(session).unwrap_or_else(|_| unreachable!())
        })
    }

    fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for FakeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeSession").field("id", &self.id).finish()
    }
}

#[async_trait]
impl DeviceSession for FakeSession {
    fn device_id(&self) -> &DeviceId {
        &self.id
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn client_address(&self) -> Option<SocketAddr> {
        self.address
    }

    fn operator(&self) -> Option<Arc<dyn DeviceOperator>> {
        self.operator.clone()
    }

    fn is_changed(&self, _other: &dyn DeviceSession) -> bool {
        self.changed.load(Ordering::SeqCst)
    }

    fn parent_device_id(&self) -> Option<DeviceId> {
        self.parent.clone()
    }
}

#[derive(Default)]
struct FakeOperator {
    online_calls: Mutex<Vec<(String, DeviceId, Option<SocketAddr>)>>,
    offline_calls: AtomicUsize,
    fail_online: AtomicBool,
}

impl fmt::Debug for FakeOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeOperator").finish()
    }
}

impl FakeOperator {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn online_call_count(&self) -> usize {
        self.online_calls.lock().unwrap().len()
    }

    fn offline_call_count(&self) -> usize {
        self.offline_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceOperator for FakeOperator {
    async fn online(
        &self,
        server_id: &str,
        device_id: &DeviceId,
        address: Option<SocketAddr>,
    ) -> Result<(), SessionError> {
        if self.fail_online.load(Ordering::SeqCst) {
            return Err(SessionError::OperatorFailed {
                device_id: device_id.clone(),
                message: "forced failure".into(),
            });
        }
        self.online_calls
            .lock()
            .unwrap()
            .push((server_id.to_string(), device_id.clone(), address));
        Ok(())
    }

    async fn offline(&self) -> Result<(), SessionError> {
        self.offline_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
struct FakeCluster {
    server_id: String,
    remote_alive: AtomicBool,
    init_connection_elsewhere: AtomicBool,
    removed_remote: AtomicU64,
}

impl FakeCluster {
    fn new(server_id: &str) -> Arc<Self> {
        Arc::new(Self {
            server_id: server_id.to_string(),
            remote_alive: AtomicBool::new(false),
            init_connection_elsewhere: AtomicBool::new(false),
            removed_remote: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl ClusterContract for FakeCluster {
    fn current_server_id(&self) -> &str {
        &self.server_id
    }

    async fn remote_session_is_alive(&self, _device_id: &DeviceId) -> bool {
        self.remote_alive.load(Ordering::SeqCst)
    }

    async fn check_remote_session_is_alive(&self, _device_id: &DeviceId) -> bool {
        self.remote_alive.load(Ordering::SeqCst)
    }

    async fn remove_remote_session(&self, _device_id: &DeviceId) -> Result<u64, SessionError> {
        Ok(self.removed_remote.load(Ordering::SeqCst))
    }

    async fn remote_total_sessions(&self) -> u64 {
        0
    }

    async fn remote_sessions(&self, _server_id: Option<&str>) -> Vec<SessionInfo> {
        Vec::new()
    }

    async fn init_session_connection(&self, _session: Arc<dyn DeviceSession>) -> bool {
        self.init_connection_elsewhere.load(Ordering::SeqCst)
    }
}

fn producer_of(session: Arc<dyn DeviceSession>) -> BoxProducer {
    Box::new(move || Box::pin(async move { Ok(Some(session)) }))
}

fn producer_never_resolves() -> BoxProducer {
    Box::new(|| Box::pin(async move { futures::future::pending::<SessionResult>().await }))
}

fn event_sink() -> (Arc<Mutex<Vec<SessionEvent>>>, crate::Handler) {
    let events: Arc<Mutex<Vec<SessionEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let handler: crate::Handler = Arc::new(move |event: SessionEvent| {
        let sink = sink.clone();
        Box::pin(async move {
            sink.lock().unwrap().push(event);
        })
    });
    (events, handler)
}

fn manager_with(cluster: Arc<FakeCluster>, config: SessionManagerConfig) -> SessionManager {
    SessionManager::new(config, cluster)
}

/// Repeatedly advances the paused clock until `predicate` holds or a generous iteration
/// budget is exhausted, yielding between steps so spawned tasks woken by the timer get a
/// chance to run. Avoids a single `advance` call racing the executor's scheduling of the
/// task it just woke.
async fn advance_until(step: Duration, predicate: impl Fn() -> bool) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::advance(step).await;
        tokio::task::yield_now().await;
    }
    assert!(predicate(), "condition never became true after advancing time");
}

// Scenario 1: fresh register.
#[tokio::test]
async fn fresh_register_writes_through_and_fires_event() {
    let operator = FakeOperator::new();
    let cluster = FakeCluster::new("node-A");
    let manager = manager_with(cluster, SessionManagerConfig::default());
    let (events, handler) = event_sink();
    let _guard = manager.listen_event(handler);

    let device_id = DeviceId::new("dev-1");
    let session = FakeSession::new("dev-1", Some(operator.clone()));
    let session: Arc<dyn DeviceSession> = session;

    let result = manager
        .compute_with(device_id.clone(), Some(producer_of(session.clone())), None)
        .await
        .expect("load should succeed");
    let installed = result.expect("a session should have been installed");
    assert!(Arc::ptr_eq(&installed, &session));

    assert_eq!(operator.online_call_count(), 1);
    assert_eq!(events.lock().unwrap().len(), 1);
    assert_eq!(events.lock().unwrap()[0].kind, EventKind::Register);
    assert!(!events.lock().unwrap()[0].remote_exists);

    let fetched = manager
        .get_session(&device_id, false)
        .await
        .unwrap()
        .expect("session should be retrievable");
    assert!(Arc::ptr_eq(&fetched, &session));
}

// Scenario 2: replacement.
#[tokio::test]
async fn replacement_closes_prior_session_and_does_not_refire_register() {
    let operator = FakeOperator::new();
    let cluster = FakeCluster::new("node-A");
    let manager = manager_with(cluster, SessionManagerConfig::default());
    let (events, handler) = event_sink();
    let _guard = manager.listen_event(handler);

    let device_id = DeviceId::new("dev-1");
    let s1 = FakeSession::new("dev-1", Some(operator.clone()));
    manager
        .compute_with(device_id.clone(), Some(producer_of(s1.clone())), None)
        .await
        .unwrap();

    let s2 = FakeSession::new("dev-1", Some(operator.clone()));
    let s2_dyn: Arc<dyn DeviceSession> = s2.clone();
    let updated = manager
        .compute_with(
            device_id.clone(),
            None,
            Some(Box::new(move |_current| producer_of(s2_dyn.clone())())),
        )
        .await
        .unwrap()
        .expect("replacement should install a new session");

    assert!(Arc::ptr_eq(&updated, &(s2.clone() as Arc<dyn DeviceSession>)));
    assert!(s1.is_closed(), "prior session must be closed on replacement");
    assert_eq!(operator.online_call_count(), 2);

    let register_events: Vec<_> = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.kind == EventKind::Register)
        .count();
    assert_eq!(register_events, 1, "register must not be refired on replacement");
}

// Scenario 3: load timeout.
#[tokio::test(start_paused = true)]
async fn load_timeout_surfaces_error_and_evicts() {
    let cluster = FakeCluster::new("node-A");
    let config = SessionManagerConfig::new(Duration::from_millis(100), Duration::from_secs(30));
    let manager = manager_with(cluster, config);
    let device_id = DeviceId::new("dev-2");

    let manager2 = manager.clone();
    let id2 = device_id.clone();
    let handle = tokio::spawn(async move {
        manager2
            .compute_with(id2, Some(producer_never_resolves()), None)
            .await
    });

    tokio::time::advance(Duration::from_millis(150)).await;
    let result = handle.await.unwrap();
    assert!(matches!(result, Err(SessionError::LoadTimeout { .. })));

    let gone = manager.get_session(&device_id, false).await.unwrap();
    assert!(gone.is_none(), "a timed-out load must not remain addressable");
}

// Scenario 4: liveness sweep evicts a dead session.
#[tokio::test(start_paused = true)]
async fn liveness_sweep_evicts_dead_sessions() {
    let operator = FakeOperator::new();
    let cluster = FakeCluster::new("node-A");
    cluster.init_connection_elsewhere.store(false, Ordering::SeqCst);
    let config = SessionManagerConfig::new(Duration::from_secs(5), Duration::from_millis(50));
    let manager = manager_with(cluster, config);
    let (events, handler) = event_sink();
    let _guard = manager.listen_event(handler);

    let device_id = DeviceId::new("dev-3");
    let session = FakeSession::new("dev-3", Some(operator.clone()));
    manager
        .compute_with(device_id.clone(), Some(producer_of(session.clone())), None)
        .await
        .unwrap();
    session.set_alive(false);

    manager.init();
    advance_until(Duration::from_millis(20), || session.is_closed()).await;

    let gone = manager.get_session(&device_id, false).await.unwrap();
    assert!(gone.is_none());

    let fired = events.lock().unwrap();
    let unregister = fired
        .iter()
        .find(|e| e.kind == EventKind::Unregister)
        .expect("sweep eviction must fire unregister");
    assert!(!unregister.remote_exists);

    manager.shutdown();
}

// Scenario 5: remote-only remove.
#[tokio::test]
async fn remove_with_no_local_ref_delegates_to_cluster() {
    let cluster = FakeCluster::new("node-A");
    cluster.removed_remote.store(1, Ordering::SeqCst);
    let manager = manager_with(cluster, SessionManagerConfig::default());

    let removed = manager.remove(&DeviceId::new("dev-4"), false).await.unwrap();
    assert_eq!(removed, 1);
}

// Scenario 6: parent/child cascade.
#[tokio::test]
async fn evicting_parent_probes_and_evicts_dead_children() {
    let operator = FakeOperator::new();
    let cluster = FakeCluster::new("node-A");
    let manager = manager_with(cluster, SessionManagerConfig::default());

    let parent_id = DeviceId::new("parent-1");
    let parent = FakeSession::new("parent-1", Some(operator.clone()));
    manager
        .compute_with(parent_id.clone(), Some(producer_of(parent.clone())), None)
        .await
        .unwrap();

    let child_id = DeviceId::new("child-1");
    let child = FakeSession::with_parent("child-1", Some(operator.clone()), parent_id.clone());
    manager
        .compute_with(child_id.clone(), Some(producer_of(child.clone())), None)
        .await
        .unwrap();
    child.set_alive(false);

    manager.remove(&parent_id, true).await.unwrap();

    let child_gone = manager.get_session(&child_id, false).await.unwrap();
    assert!(child_gone.is_none(), "dead child must be evicted by the parent's eviction cascade");
}

// P7: compute-then-remove is a no-op on total session count.
#[tokio::test]
async fn compute_then_remove_restores_prior_state() {
    let cluster = FakeCluster::new("node-A");
    let manager = manager_with(cluster, SessionManagerConfig::default());
    let device_id = DeviceId::new("dev-7");

    let before = manager.get_sessions().len();
    let session = FakeSession::new("dev-7", None);
    manager
        .compute_with(device_id.clone(), Some(producer_of(session)), None)
        .await
        .unwrap();
    assert_eq!(manager.get_sessions().len(), before + 1);

    manager.remove(&device_id, true).await.unwrap();
    assert_eq!(manager.get_sessions().len(), before);
}

// P8: concurrent compute calls single-flight to one producer execution.
#[tokio::test]
async fn concurrent_compute_single_flights_the_producer() {
    let cluster = FakeCluster::new("node-A");
    let manager = manager_with(cluster, SessionManagerConfig::default());
    let device_id = DeviceId::new("dev-8");
    let runs = Arc::new(AtomicUsize::new(0));

    let make_creator = |runs: Arc<AtomicUsize>, tag: &'static str| -> BoxProducer {
        Box::new(move || {
            runs.fetch_add(1, Ordering::SeqCst);
            let session = FakeSession::new(tag, None);
            Box::pin(async move { Ok(Some(session as Arc<dyn DeviceSession>)) })
        })
    };

    let m1 = manager.clone();
    let id1 = device_id.clone();
    let runs1 = runs.clone();
    let h1 = tokio::spawn(async move {
        m1.compute_with(id1, Some(make_creator(runs1, "dev-8")), None).await
    });

    let m2 = manager.clone();
    let id2 = device_id.clone();
    let runs2 = runs.clone();
    let h2 = tokio::spawn(async move {
        m2.compute_with(id2, Some(make_creator(runs2, "dev-8")), None).await
    });

    let r1 = h1.await.unwrap().unwrap().unwrap();
    let r2 = h2.await.unwrap().unwrap().unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1, "only one producer should ever run");
    assert!(Arc::ptr_eq(&r1, &r2), "both callers must observe the same session identity");
}

// getSessionInfo concatenates the local snapshot with the remote enumeration.
#[tokio::test]
async fn get_session_info_concatenates_local_and_remote() {
    let cluster = FakeCluster::new("node-A");
    let manager = manager_with(cluster, SessionManagerConfig::default());
    let device_id = DeviceId::new("dev-9");
    let session = FakeSession::new("dev-9", None);
    manager
        .compute_with(device_id.clone(), Some(producer_of(session)), None)
        .await
        .unwrap();

    let info: Vec<SessionInfo> = manager.get_session_info(None).await.collect().await;
    assert!(info.iter().any(|i| i.device_id == device_id && i.server_id == "node-A"));
}

// isAlive is a cheap existence check, not a liveness probe: a local Ref is "alive" even if
// the underlying session would fail a real probe.
#[tokio::test]
async fn is_alive_does_not_probe_local_sessions() {
    let cluster = FakeCluster::new("node-A");
    let manager = manager_with(cluster, SessionManagerConfig::default());
    let device_id = DeviceId::new("dev-10");
    let session = FakeSession::new("dev-10", None);
    session.set_alive(false);
    manager
        .compute_with(device_id.clone(), Some(producer_of(session)), None)
        .await
        .unwrap();

    assert!(manager.is_alive(&device_id, true).await);
}
