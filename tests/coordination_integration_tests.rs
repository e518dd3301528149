//! Integration Tests for Leader Election and Maintenance
//!
//! Runs several electors against one in-memory lock table.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgcache::cache::{ExpiredItemRemover, MemoryCacheStore};
use pgcache::config::{ElectionConfig, MaintenanceConfig};
use pgcache::error::Result;
use pgcache::leadership::{
    spawn_event_logger, spawn_leader_elector, LeaderElector, LeadershipEvent, LeadershipState,
    LossReason,
};
use pgcache::lock::MemoryLockProvider;
use pgcache::tasks::{spawn_maintenance_task, MaintenanceGate, MaintenanceScheduler};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const KEY: i64 = 0x5eed;

// == Helper Functions ==

fn election_config() -> ElectionConfig {
    ElectionConfig {
        acquire_timeout: Duration::from_millis(100),
        heartbeat_interval: Duration::from_millis(20),
        voluntary_yield_interval: Duration::from_secs(3600),
        yield_window: Duration::from_millis(30),
        backoff_base: Duration::from_millis(10),
        backoff_max: Duration::from_millis(80),
        backoff_jitter: Duration::from_millis(5),
        error_retry_delay: Duration::from_millis(50),
    }
}

fn elector(provider: &MemoryLockProvider, id: &str, config: ElectionConfig) -> Arc<LeaderElector> {
    Arc::new(LeaderElector::new(
        Arc::new(LeadershipState::new(id)),
        Arc::new(provider.clone()),
        KEY,
        config,
    ))
}

async fn is_leader(node: &LeaderElector) -> bool {
    node.state()
        .snapshot(&CancellationToken::new())
        .await
        .unwrap()
        .is_leader
}

async fn count_leaders(nodes: &[Arc<LeaderElector>]) -> usize {
    let mut leaders = 0;
    for node in nodes {
        if is_leader(node).await {
            leaders += 1;
        }
    }
    leaders
}

fn drain(rx: &mut broadcast::Receiver<LeadershipEvent>) -> Vec<LeadershipEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Counts maintenance invocations per instance while delegating to a shared store.
struct CountingRemover {
    store: MemoryCacheStore,
    calls: AtomicU64,
}

impl CountingRemover {
    fn new(store: MemoryCacheStore) -> Arc<Self> {
        Arc::new(Self {
            store,
            calls: AtomicU64::new(0),
        })
    }

    fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExpiredItemRemover for CountingRemover {
    async fn delete_expired(&self, now: DateTime<Utc>, max_batch: u32) -> Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.store.delete_expired(now, max_batch).await
    }
}

/// Collects formatted log output for the current thread.
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::INFO)
        .finish();
    (buffer, tracing::subscriber::set_default(subscriber))
}

// == Election Scenarios ==

#[tokio::test]
async fn test_two_way_contention() {
    let provider = MemoryLockProvider::new();
    let a = elector(&provider, "node-a", election_config());
    let b = elector(&provider, "node-b", election_config());
    let cancel = CancellationToken::new();

    let (won_a, won_b) = tokio::join!(
        a.try_acquire_manager_role(&cancel),
        b.try_acquire_manager_role(&cancel)
    );
    let (won_a, won_b) = (won_a.unwrap(), won_b.unwrap());
    assert!(won_a ^ won_b, "exactly one contender wins");

    let (winner, loser) = if won_a { (a, b) } else { (b, a) };
    winner.release_manager_role(&cancel).await.unwrap();
    assert!(loser.try_acquire_manager_role(&cancel).await.unwrap());
    assert!(!is_leader(&winner).await);
}

#[tokio::test(start_paused = true)]
async fn test_mutual_exclusion_under_churn() {
    let provider = MemoryLockProvider::new();
    let config = ElectionConfig {
        voluntary_yield_interval: Duration::from_millis(60),
        yield_window: Duration::from_millis(15),
        ..election_config()
    };
    let nodes: Vec<_> = (0..5)
        .map(|n| elector(&provider, &format!("node-{}", n), config.clone()))
        .collect();
    let cancel = CancellationToken::new();
    let tasks: Vec<_> = nodes
        .iter()
        .map(|node| spawn_leader_elector(node.clone(), cancel.clone()))
        .collect();

    let mut observed_leader = false;
    for _ in 0..300 {
        // sample every node without yielding to the election loops
        let leaders = tokio::task::unconstrained(count_leaders(&nodes)).await;
        assert!(leaders <= 1, "{} instances claimed leadership at once", leaders);
        observed_leader |= leaders == 1;
        tokio::time::sleep(Duration::from_millis(7)).await;
    }
    assert!(observed_leader);

    cancel.cancel();
    for task in tasks {
        task.await.unwrap();
    }
    assert!(!provider.is_held(KEY));
}

#[tokio::test(start_paused = true)]
async fn test_failover_after_leader_shutdown() {
    let provider = MemoryLockProvider::new();
    let config = election_config();
    let a = elector(&provider, "node-a", config.clone());
    let b = elector(&provider, "node-b", config.clone());

    let cancel_a = CancellationToken::new();
    let cancel_b = CancellationToken::new();
    let task_a = spawn_leader_elector(a.clone(), cancel_a.clone());
    tokio::time::sleep(Duration::from_millis(5)).await;
    let task_b = spawn_leader_elector(b.clone(), cancel_b.clone());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(is_leader(&a).await);
    assert!(!is_leader(&b).await);

    cancel_a.cancel();
    task_a.await.unwrap();
    let released = Instant::now();

    let deadline = config.backoff_max + config.backoff_jitter + Duration::from_millis(20);
    while !is_leader(&b).await {
        assert!(released.elapsed() <= deadline, "failover took too long");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    cancel_b.cancel();
    task_b.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_voluntary_yield_then_reelection() {
    let provider = MemoryLockProvider::new();
    let config = ElectionConfig {
        voluntary_yield_interval: Duration::from_millis(100),
        ..election_config()
    };
    let node = elector(&provider, "node-a", config);
    let mut events = node.state().subscribe();
    let cancel = CancellationToken::new();
    let task = spawn_leader_elector(node.clone(), cancel.clone());

    tokio::time::sleep(Duration::from_millis(500)).await;
    cancel.cancel();
    task.await.unwrap();

    let events = drain(&mut events);
    let yielded_then_elected = events.windows(2).any(|pair| {
        pair[0].reason() == Some(LossReason::Voluntary) && pair[1].is_elected()
    });
    assert!(yielded_then_elected, "events: {:?}", events);
}

#[tokio::test(start_paused = true)]
async fn test_yield_hands_role_to_contender() {
    let provider = MemoryLockProvider::new();
    let config = ElectionConfig {
        voluntary_yield_interval: Duration::from_millis(100),
        yield_window: Duration::from_millis(200),
        ..election_config()
    };
    let a = elector(&provider, "node-a", config.clone());
    let b = elector(&provider, "node-b", config);
    let mut b_events = b.state().subscribe();
    let cancel = CancellationToken::new();

    let task_a = spawn_leader_elector(a.clone(), cancel.clone());
    tokio::time::sleep(Duration::from_millis(5)).await;
    let task_b = spawn_leader_elector(b.clone(), cancel.clone());

    tokio::time::sleep(Duration::from_millis(400)).await;
    cancel.cancel();
    task_a.await.unwrap();
    task_b.await.unwrap();

    assert!(
        drain(&mut b_events).iter().any(LeadershipEvent::is_elected),
        "contender never got a turn"
    );
}

#[tokio::test(start_paused = true)]
async fn test_permission_denied_never_leads() {
    let provider = MemoryLockProvider::new();
    provider.deny_permissions(true);
    let node = elector(&provider, "node-a", election_config());
    let mut events = node.state().subscribe();
    let cancel = CancellationToken::new();
    let task = spawn_leader_elector(node.clone(), cancel.clone());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!task.is_finished(), "the loop keeps retrying");
    assert!(!is_leader(&node).await);
    assert!(provider.acquire_calls() > 1);

    cancel.cancel();
    task.await.unwrap();
    assert!(drain(&mut events).is_empty());
}

#[tokio::test]
async fn test_permission_denied_logs_once_per_attempt() {
    let (logs, _guard) = capture_logs();
    let provider = MemoryLockProvider::new();
    provider.deny_permissions(true);
    let node = elector(&provider, "node-a", election_config());
    let cancel = CancellationToken::new();

    for _ in 0..4 {
        assert!(!node.try_acquire_manager_role(&cancel).await.unwrap());
    }

    let remediation_lines = logs
        .contents()
        .matches("Permission denied taking the maintenance advisory lock")
        .count();
    assert_eq!(remediation_lines, 4);
}

#[tokio::test(start_paused = true)]
async fn test_permission_fixed_live() {
    let provider = MemoryLockProvider::new();
    provider.deny_permissions(true);
    let node = elector(&provider, "node-a", election_config());
    let cancel = CancellationToken::new();
    let task = spawn_leader_elector(node.clone(), cancel.clone());

    tokio::time::sleep(Duration::from_millis(300)).await;
    provider.deny_permissions(false);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(is_leader(&node).await);

    cancel.cancel();
    task.await.unwrap();
}

// == Event Logging ==

#[tokio::test(start_paused = true)]
async fn test_shutdown_transition_is_logged() {
    let (logs, _guard) = capture_logs();
    let provider = MemoryLockProvider::new();
    let node = elector(&provider, "node-a", election_config());

    // wired as the binary does: the logger stops only after the elector
    let cancel = CancellationToken::new();
    let logger_cancel = CancellationToken::new();
    let logger = spawn_event_logger(node.state().subscribe(), logger_cancel.clone());
    let task = spawn_leader_elector(node.clone(), cancel.clone());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(is_leader(&node).await);

    cancel.cancel();
    task.await.unwrap();
    node.state().dispose();
    logger_cancel.cancel();
    logger.await.unwrap();

    let output = logs.contents();
    assert!(output.contains("Instance became maintenance manager"), "{}", output);
    assert!(
        output
            .lines()
            .any(|line| line.contains("Instance lost maintenance manager role")
                && line.contains("reason=shutdown")),
        "{}",
        output
    );
}

#[tokio::test]
async fn test_event_logger_drains_queued_transitions() {
    let (logs, _guard) = capture_logs();
    let state = LeadershipState::new("node-a");
    let cancel = CancellationToken::new();
    let logger_cancel = CancellationToken::new();
    let logger = spawn_event_logger(state.subscribe(), logger_cancel.clone());

    state.become_leader(Utc::now(), &cancel).await.unwrap();
    state
        .lose_leadership(Utc::now(), LossReason::Shutdown, &cancel)
        .await
        .unwrap();
    // cancelled before the logger task has had a chance to run
    logger_cancel.cancel();
    logger.await.unwrap();

    let output = logs.contents();
    assert!(output.contains("Instance became maintenance manager"), "{}", output);
    assert!(output.contains("reason=shutdown"), "{}", output);
}

// == Maintenance Gating ==

#[tokio::test(start_paused = true)]
async fn test_only_manager_runs_maintenance() {
    let provider = MemoryLockProvider::new();
    let a = elector(&provider, "node-a", election_config());
    let b = elector(&provider, "node-b", election_config());
    let cancel = CancellationToken::new();

    let store = MemoryCacheStore::new();
    let now = Utc::now();
    for n in 0..10 {
        store.insert(format!("stale{}", n), "v", Some(now - chrono::Duration::minutes(1)));
    }
    store.insert("fresh", "v", Some(now + chrono::Duration::hours(1)));

    let maintenance = MaintenanceConfig {
        interval: Duration::from_secs(1),
        batch_size: 4,
    };
    let remover_a = CountingRemover::new(store.clone());
    let remover_b = CountingRemover::new(store.clone());
    let scheduler_a = Arc::new(MaintenanceScheduler::new(
        MaintenanceGate::Leadership(a.state().clone()),
        remover_a.clone(),
        maintenance.clone(),
    ));
    let scheduler_b = Arc::new(MaintenanceScheduler::new(
        MaintenanceGate::Leadership(b.state().clone()),
        remover_b.clone(),
        maintenance,
    ));

    assert!(a.try_acquire_manager_role(&cancel).await.unwrap());
    assert!(!b.try_acquire_manager_role(&cancel).await.unwrap());

    let task_a = spawn_maintenance_task(scheduler_a, cancel.clone());
    let task_b = spawn_maintenance_task(scheduler_b, cancel.clone());

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    assert_eq!(remover_a.calls(), 3);
    assert_eq!(remover_b.calls(), 0);
    // 3 ticks of at most 4 rows cleared the 10 stale entries
    assert_eq!(store.len(), 1);
    assert!(store.contains("fresh"));

    a.release_manager_role(&cancel).await.unwrap();
    assert!(b.try_acquire_manager_role(&cancel).await.unwrap());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(remover_a.calls(), 3);
    assert_eq!(remover_b.calls(), 2);

    cancel.cancel();
    task_a.await.unwrap();
    task_b.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_uncoordinated_instances_all_run() {
    let store = MemoryCacheStore::new();
    let maintenance = MaintenanceConfig {
        interval: Duration::from_secs(1),
        batch_size: 10,
    };
    let cancel = CancellationToken::new();

    let removers: Vec<_> = (0..3).map(|_| CountingRemover::new(store.clone())).collect();
    let tasks: Vec<_> = removers
        .iter()
        .map(|remover| {
            let scheduler = Arc::new(MaintenanceScheduler::new(
                MaintenanceGate::Uncoordinated,
                remover.clone(),
                maintenance.clone(),
            ));
            spawn_maintenance_task(scheduler, cancel.clone())
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    for remover in &removers {
        assert_eq!(remover.calls(), 2);
    }

    cancel.cancel();
    for task in tasks {
        task.await.unwrap();
    }
}
