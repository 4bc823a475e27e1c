//! Adaptive pool scaling
//!
//! Sustained saturation grows a pool step by step up to its ceiling;
//! sustained idleness shrinks it back to the floor. Slot accounting is
//! checked after every step.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchyard::resilience::{
    ConnectionFactory, ConnectionPool, Lease, PoolConfig, ResilienceError, ScaleDecision,
    ScalingPolicy,
};

#[derive(Default)]
struct CountingFactory {
    created: AtomicUsize,
    closed: AtomicUsize,
}

#[async_trait]
impl ConnectionFactory<usize> for CountingFactory {
    async fn create(&self) -> Result<usize, ResilienceError> {
        Ok(self.created.fetch_add(1, Ordering::SeqCst))
    }

    async fn is_healthy(&self, _conn: &usize) -> bool {
        true
    }

    async fn close(&self, _conn: usize) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn pool_config() -> PoolConfig {
    PoolConfig {
        min_size: 2,
        max_size: 8,
        idle_timeout: None,
        max_lifetime: None,
        acquire_timeout: Duration::from_millis(50),
        scaling: ScalingPolicy {
            high_water: 0.8,
            low_water: 0.2,
            growth_factor: 1.5,
            evaluation_window: 3,
            history_capacity: 16,
        },
    }
}

fn assert_accounting(pool: &ConnectionPool<usize>) {
    let stats = pool.stats();
    assert_eq!(stats.idle + stats.in_use, stats.current_size, "{stats:?}");
    assert!(stats.current_size >= stats.min_size, "{stats:?}");
    assert!(stats.current_size <= stats.max_size, "{stats:?}");
    assert!(stats.cached <= stats.idle, "{stats:?}");
}

/// Sample a full evaluation window, then scale
async fn evaluate(pool: &ConnectionPool<usize>) -> ScaleDecision {
    for _ in 0..pool.config().scaling.evaluation_window {
        pool.sample_utilization();
    }
    let decision = pool.scale().await;
    assert_accounting(pool);
    decision
}

async fn lease_more(pool: &ConnectionPool<usize>, leases: &mut Vec<Lease<usize>>, n: usize) {
    for _ in 0..n {
        leases.push(pool.acquire().await.unwrap());
    }
    assert_accounting(pool);
}

#[tokio::test(start_paused = true)]
async fn test_pool_grows_to_max_and_shrinks_to_min() {
    let factory = Arc::new(CountingFactory::default());
    let pool = ConnectionPool::new("backend-a", factory.clone(), pool_config());
    assert_eq!(pool.stats().current_size, 2);
    assert_accounting(&pool);

    let mut leases = Vec::new();

    println!("Phase 1: sustained saturation");
    lease_more(&pool, &mut leases, 2).await;
    assert_eq!(evaluate(&pool).await, ScaleDecision::Grow { from: 2, to: 3 });

    lease_more(&pool, &mut leases, 1).await;
    assert_eq!(evaluate(&pool).await, ScaleDecision::Grow { from: 3, to: 5 });

    lease_more(&pool, &mut leases, 2).await;
    assert_eq!(evaluate(&pool).await, ScaleDecision::Grow { from: 5, to: 8 });

    lease_more(&pool, &mut leases, 3).await;
    assert_eq!(pool.stats().in_use, 8);
    assert_eq!(evaluate(&pool).await, ScaleDecision::Hold);

    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, ResilienceError::PoolExhausted { .. }));
    assert_accounting(&pool);

    println!("Phase 2: everything released, pool sits idle");
    for lease in leases.drain(..) {
        lease.release().await;
    }
    assert_eq!(pool.stats().cached, 8);
    assert_accounting(&pool);

    assert_eq!(evaluate(&pool).await, ScaleDecision::Shrink { from: 8, to: 5 });
    assert_eq!(pool.stats().cached, 5);
    assert_eq!(evaluate(&pool).await, ScaleDecision::Shrink { from: 5, to: 3 });
    assert_eq!(evaluate(&pool).await, ScaleDecision::Shrink { from: 3, to: 2 });
    assert_eq!(evaluate(&pool).await, ScaleDecision::Hold);
    assert_eq!(pool.stats().current_size, 2);

    assert_eq!(factory.created.load(Ordering::SeqCst), 8);
    assert_eq!(factory.closed.load(Ordering::SeqCst), 6);
}

#[tokio::test(start_paused = true)]
async fn test_mixed_utilization_holds() {
    let pool = ConnectionPool::new("backend-b", Arc::new(CountingFactory::default()), pool_config());
    let mut leases = Vec::new();
    lease_more(&pool, &mut leases, 2).await;

    pool.sample_utilization();
    pool.sample_utilization();
    leases.pop().unwrap().release().await;
    pool.sample_utilization();

    // Two saturated samples and one at 0.5 are not a sustained trend
    assert_eq!(pool.scale().await, ScaleDecision::Hold);
    assert_accounting(&pool);
}

#[tokio::test(start_paused = true)]
async fn test_scaling_waits_for_a_full_window_after_each_change() {
    let pool = ConnectionPool::new("backend-c", Arc::new(CountingFactory::default()), pool_config());
    let mut leases = Vec::new();
    lease_more(&pool, &mut leases, 2).await;
    assert_eq!(evaluate(&pool).await, ScaleDecision::Grow { from: 2, to: 3 });

    lease_more(&pool, &mut leases, 1).await;
    pool.sample_utilization();
    assert_eq!(pool.scale().await, ScaleDecision::Hold);
    pool.sample_utilization();
    pool.sample_utilization();
    assert_eq!(pool.scale().await, ScaleDecision::Grow { from: 3, to: 5 });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_leases_never_exceed_max() {
    let factory = Arc::new(CountingFactory::default());
    let mut config = pool_config();
    config.acquire_timeout = Duration::from_secs(5);
    let pool = Arc::new(ConnectionPool::new("backend-d", factory.clone(), config));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..32 {
        let pool = pool.clone();
        let peak = peak.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..10 {
                let lease = pool.acquire().await.unwrap();
                peak.fetch_max(pool.in_use(), Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
                lease.release().await;
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    println!("Peak concurrent leases: {}", peak.load(Ordering::SeqCst));
    assert!(peak.load(Ordering::SeqCst) <= 8);
    let stats = pool.stats();
    assert_eq!(stats.in_use, 0);
    assert_accounting(&pool);
    assert!(factory.created.load(Ordering::SeqCst) <= 8);
}
