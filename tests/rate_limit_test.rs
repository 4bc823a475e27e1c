//! Fair-share rate limiting
//!
//! Drives the limiter with synthetic instants so whole windows pass
//! instantly, then checks the gateway surfaces denials without touching
//! a backend.

mod common;

use common::MockBackend;
use std::sync::Arc;
use std::time::Duration;
use switchyard::audit::{CollectingSink, RateLimitDecision};
use switchyard::resilience::{
    Admission, AnomalyConfig, DenyReason, FairShareLimiter, LimiterConfig,
};
use switchyard::{Caller, DispatchRequest, Gateway, GatewayConfig, GatewayOptions, ServerSpec};
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(10);

fn limiter(capacity: u64) -> FairShareLimiter {
    FairShareLimiter::new(LimiterConfig {
        capacity,
        window: WINDOW,
        burst_factor: 1.5,
        anomaly: AnomalyConfig {
            enabled: false,
            ..AnomalyConfig::default()
        },
        ..LimiterConfig::default()
    })
}

/// Every tenant asks once per tick for `duration`
fn saturate(limiter: &FairShareLimiter, tenants: &[&str], start: Instant, duration: Duration) -> Instant {
    let tick = Duration::from_millis(10);
    let mut now = start;
    while now < start + duration {
        for tenant in tenants {
            limiter.admit_at(tenant, 1, now);
        }
        now += tick;
    }
    now
}

#[tokio::test]
async fn test_denied_tenant_is_admitted_after_retry_after() {
    let limiter = limiter(100);
    let t0 = Instant::now();

    for _ in 0..100 {
        assert_eq!(limiter.admit_at("acme", 1, t0), Admission::Allowed { burst: false });
    }
    let retry_after = match limiter.admit_at("acme", 1, t0) {
        Admission::Denied {
            retry_after,
            reason,
        } => {
            assert_eq!(reason, DenyReason::FairShareExceeded);
            retry_after
        }
        other => panic!("expected denial, got {other:?}"),
    };
    assert_eq!(retry_after, WINDOW);

    println!("Still denied just before retry_after");
    assert!(!limiter
        .admit_at("acme", 1, t0 + retry_after - Duration::from_millis(1))
        .is_allowed());

    println!("Admitted once retry_after has elapsed");
    assert!(limiter.admit_at("acme", 1, t0 + retry_after).is_allowed());
}

#[tokio::test]
async fn test_equal_tenants_converge_to_equal_share() {
    let limiter = limiter(100);
    let tenants = ["a", "b", "c", "d"];
    let t0 = Instant::now();

    saturate(&limiter, &tenants, t0, WINDOW * 3);

    // Fair share is 25; bursting may lift a tenant to 37
    for tenant in tenants {
        let consumed = limiter.usage(tenant).unwrap().consumed;
        println!("{tenant}: {consumed} admitted in the last window");
        assert!((25..=37).contains(&consumed), "{tenant} got {consumed}");
    }
}

#[tokio::test]
async fn test_weighted_tenant_gets_proportional_share() {
    let limiter = limiter(100);
    limiter.set_weight("gold", 2.0).unwrap();
    let tenants = ["gold", "a", "b"];
    let t0 = Instant::now();

    let now = saturate(&limiter, &tenants, t0, WINDOW * 3);
    assert_eq!(limiter.fair_share_at("gold", now), 50.0);
    assert_eq!(limiter.fair_share_at("a", now), 25.0);

    let gold = limiter.usage("gold").unwrap().consumed;
    let a = limiter.usage("a").unwrap().consumed;
    let b = limiter.usage("b").unwrap().consumed;
    println!("gold={gold} a={a} b={b}");
    assert!((50..=75).contains(&gold));
    assert!((25..=37).contains(&a));
    assert!((25..=37).contains(&b));
    assert!(gold > a && gold > b);
}

#[tokio::test]
async fn test_quiet_tenant_earns_burst_tokens() {
    let limiter = limiter(100);
    let t0 = Instant::now();
    for _ in 0..10 {
        assert!(limiter.admit_at("acme", 1, t0).is_allowed());
    }

    // Half a window below the share accrues half a window of tokens
    let later = t0 + WINDOW / 2;
    let mut plain = 0;
    let mut burst = 0;
    loop {
        match limiter.admit_at("acme", 1, later) {
            Admission::Allowed { burst: false } => plain += 1,
            Admission::Allowed { burst: true } => burst += 1,
            Admission::Denied { retry_after, .. } => {
                assert!(retry_after > Duration::ZERO && retry_after <= WINDOW);
                break;
            }
        }
    }
    assert_eq!(plain, 90);
    assert_eq!(burst, 50);
}

#[tokio::test]
async fn test_sustained_tenant_stays_at_share_every_window() {
    let limiter = limiter(100);
    let t0 = Instant::now();
    let tick = Duration::from_millis(10);

    // Window 0 may burst on tokens saved before the tenant first reached
    // its share; every later window is capped at the share itself
    for window in 0..10u32 {
        let start = t0 + WINDOW * window;
        let (mut admitted, mut bursts) = (0, 0);
        let mut now = start;
        while now < start + WINDOW {
            if let Admission::Allowed { burst } = limiter.admit_at("acme", 1, now) {
                admitted += 1;
                if burst {
                    bursts += 1;
                }
            }
            now += tick;
        }
        println!("window {window}: {admitted} admitted, {bursts} on burst tokens");
        if window > 0 {
            assert_eq!(bursts, 0, "window {window}");
            assert!(admitted <= 100, "window {window} admitted {admitted}");
        }
    }
}

#[tokio::test]
async fn test_anomaly_guard_blocks_one_key_only() {
    let limiter = FairShareLimiter::new(LimiterConfig {
        capacity: 100_000,
        window: WINDOW,
        anomaly: AnomalyConfig {
            enabled: true,
            sub_window: Duration::from_secs(1),
            ceiling: 20,
            block_duration: Duration::from_secs(30),
        },
        ..LimiterConfig::default()
    });
    let t0 = Instant::now();

    for _ in 0..20 {
        assert!(limiter.admit_at("noisy", 1, t0).is_allowed());
    }
    assert_eq!(
        limiter.admit_at("noisy", 1, t0),
        Admission::Denied {
            retry_after: Duration::from_secs(30),
            reason: DenyReason::Blocked,
        }
    );
    assert!(limiter.admit_at("quiet", 1, t0).is_allowed());

    let mid = t0 + Duration::from_secs(10);
    assert_eq!(
        limiter.admit_at("noisy", 1, mid),
        Admission::Denied {
            retry_after: Duration::from_secs(20),
            reason: DenyReason::Blocked,
        }
    );
    assert!(limiter
        .admit_at("noisy", 1, t0 + Duration::from_secs(31))
        .is_allowed());
}

#[tokio::test]
async fn test_idle_tenants_are_collected() {
    let limiter = FairShareLimiter::new(LimiterConfig {
        tenant_idle_ttl: Duration::from_secs(60),
        ..LimiterConfig::default()
    });
    let t0 = Instant::now();
    limiter.admit_at("a", 1, t0);
    limiter.admit_at("b", 1, t0 + Duration::from_secs(50));
    assert_eq!(limiter.tenant_count(), 2);

    assert_eq!(limiter.collect_idle_at(t0 + Duration::from_secs(61)), 1);
    assert_eq!(limiter.tenant_count(), 1);
    assert!(limiter.usage("a").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_gateway_denial_never_reaches_backend() {
    let backend = MockBackend::start("a").await;
    let mut config = GatewayConfig::default();
    config.health.enabled = false;
    config.rate_limit.capacity = 2;
    config.rate_limit.burst_factor = 1.0;
    config.servers = vec![ServerSpec::new(backend.endpoint())
        .with_id("a")
        .with_capability("search")];

    let sink = Arc::new(CollectingSink::new());
    let gateway = Gateway::start(
        config,
        GatewayOptions {
            audit_sink: Some(sink.clone()),
            ..GatewayOptions::default()
        },
    )
    .unwrap();

    let request = || DispatchRequest::new(Caller::tenant("acme"), "search", "tools/call");
    gateway.router().dispatch(request()).await.unwrap();
    gateway.router().dispatch(request()).await.unwrap();
    let err = gateway.router().dispatch(request()).await.unwrap_err();
    assert_eq!(err.code(), "RATE_LIMIT_EXCEEDED");
    let retry_after = err.retry_after().unwrap();
    assert!(retry_after > Duration::ZERO);
    assert_eq!(backend.calls(), 2);

    println!("Another tenant keeps its own share");
    let other = DispatchRequest::new(Caller::tenant("globex"), "search", "tools/call");
    gateway.router().dispatch(other).await.unwrap();
    assert_eq!(backend.calls(), 3);

    gateway.shutdown().await;
    let events = sink.events();
    assert_eq!(events.len(), 4);
    let denied: Vec<_> = events
        .iter()
        .filter(|e| e.rate_limit == RateLimitDecision::Denied)
        .collect();
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].tenant, "acme");
    assert_eq!(denied[0].attempts, 0);
    assert!(denied[0].server_id.is_none());
}
