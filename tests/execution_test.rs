//! End-to-end behaviour of `Conduit` against in-memory nodes

mod common;

use common::{test_config, transient, MockCluster};
use conduit::balancer::autoscaler::ScalingAction;
use conduit::codec::JsonCodec;
use conduit::{CallOptions, CallSpec, Conduit, ConduitError};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const A: &str = "http://node-a";
const B: &str = "http://node-b";
const C: &str = "http://node-c";

#[tokio::test(start_paused = true)]
async fn test_concurrent_identical_calls_share_one_execution() {
    let cluster = MockCluster::new();
    let node = cluster.node(A);
    node.set_delay(Duration::from_millis(50));
    let conduit = Conduit::connect(test_config(&[A]), cluster.factory())
        .await
        .unwrap();

    let calls = (0..10).map(|_| conduit.execute("getSlot", vec![], CallOptions::default()));
    let results = futures::future::join_all(calls).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(node.calls_to("getSlot"), 1, "identical calls should coalesce");
    let metrics = conduit.metrics();
    assert_eq!(metrics.total_requests, 10);
    assert_eq!(metrics.coalesced_requests, 9);
    assert_eq!(metrics.successful_executions, 1);

    // Served from cache now
    conduit
        .execute("getSlot", vec![], CallOptions::default())
        .await
        .unwrap();
    assert_eq!(node.calls_to("getSlot"), 1);
    assert_eq!(conduit.metrics().cache_hits, 1);

    conduit.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried_on_the_connection() {
    let cluster = MockCluster::new();
    let node = cluster.node(A);
    node.script([Err(transient()), Err(transient()), Ok(json!(42))]);
    let conduit = Conduit::connect(test_config(&[A]), cluster.factory())
        .await
        .unwrap();

    let result = conduit
        .execute("getBalance", vec![json!("addr")], CallOptions::default())
        .await
        .unwrap();

    assert_eq!(result, json!(42));
    assert_eq!(node.calls_to("getBalance"), 3);
    assert_eq!(conduit.metrics().failed_executions, 0);

    conduit.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_fail_over_to_next_instance() {
    let cluster = MockCluster::new();
    let a = cluster.node(A);
    a.down.store(true, std::sync::atomic::Ordering::SeqCst);
    let conduit = Conduit::connect(test_config(&[A, B]), cluster.factory())
        .await
        .unwrap();

    for _ in 0..2 {
        let result = conduit
            .execute("getSlot", vec![], CallOptions::new().uncached())
            .await
            .unwrap();
        assert_eq!(result["endpoint"], B);
    }

    assert!(
        a.calls_to("getSlot") >= 3,
        "the first instance should use every retry before failing over"
    );

    conduit.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failure_on_connection_is_reported_over_capacity_errors() {
    let cluster = MockCluster::new();
    let a = cluster.node(A);
    a.down.store(true, std::sync::atomic::Ordering::SeqCst);
    let mut config = test_config(&[A]);
    config.pool.max_connections = 1;
    // Enough retries to open the connection's breaker mid-call
    config.retry.max_attempts = 8;
    let threshold = config.breaker.failure_threshold;
    let conduit = Conduit::connect(config, cluster.factory()).await.unwrap();

    let err = conduit
        .execute("getSlot", vec![], CallOptions::new().uncached())
        .await
        .unwrap_err();

    match &err {
        ConduitError::Failed { endpoint, attempts, .. } => {
            assert_eq!(endpoint, A);
            assert_eq!(*attempts, threshold);
        }
        other => panic!("expected a failure with context, got {other:?}"),
    }
    assert!(matches!(err.root_cause(), ConduitError::CircuitOpen(_)), "got {err:?}");
    assert_eq!(a.calls_to("getSlot"), threshold as usize);

    conduit.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_single_instance_recovers_after_short_outage() {
    let cluster = MockCluster::new();
    let a = cluster.node(A);
    let mut config = test_config(&[A]);
    config.pool.max_connections = 1;
    config.balancer.max_attempts = 1;
    let conduit = Conduit::connect(config, cluster.factory()).await.unwrap();

    a.down.store(true, std::sync::atomic::Ordering::SeqCst);
    let err = conduit
        .execute("getSlot", vec![], CallOptions::new().uncached())
        .await
        .unwrap_err();
    assert!(
        matches!(&err, ConduitError::Failed { endpoint, attempts: 3, .. } if endpoint == A),
        "got {err:?}"
    );

    a.down.store(false, std::sync::atomic::Ordering::SeqCst);
    let calls_before = a.calls_to("getSlot");
    let result = conduit
        .execute("getSlot", vec![], CallOptions::new().uncached())
        .await
        .unwrap();
    assert_eq!(result["endpoint"], A);
    assert_eq!(a.calls_to("getSlot"), calls_before + 1);

    // The connection is scored as healthy again
    let details = conduit.details();
    let score = details[0].connections[0].health_score;
    assert!(score > 50.0, "score {score}");

    conduit.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_waiter_deadline_carries_context() {
    let cluster = MockCluster::new();
    cluster.node(A).set_delay(Duration::from_secs(5));
    let conduit = Conduit::connect(test_config(&[A]), cluster.factory())
        .await
        .unwrap();

    let leader = conduit.clone();
    tokio::spawn(async move {
        let _ = leader.execute("getSlot", vec![], CallOptions::default()).await;
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let err = conduit
        .execute(
            "getSlot",
            vec![],
            CallOptions::new().with_deadline(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();

    match &err {
        ConduitError::Failed { attempts: 0, cause, .. } => {
            assert_eq!(**cause, ConduitError::Timeout(Duration::from_millis(100)));
        }
        other => panic!("expected a failure with context, got {other:?}"),
    }

    conduit.shutdown().await;
}

#[tokio::test]
async fn test_permanent_remote_error_is_not_retried() {
    let cluster = MockCluster::new();
    let a = cluster.node(A);
    let b = cluster.node(B);
    let invalid = ConduitError::Remote {
        code: -32602,
        message: "invalid params".into(),
        transient: false,
    };
    a.script([Err(invalid.clone())]);
    b.script([Err(invalid)]);
    let conduit = Conduit::connect(test_config(&[A, B]), cluster.factory())
        .await
        .unwrap();

    let err = conduit
        .execute("getAccountInfo", vec![json!("bad")], CallOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, ConduitError::Failed { attempts: 1, .. }), "got {err:?}");
    assert!(matches!(err.root_cause(), ConduitError::Remote { code: -32602, .. }));
    assert_eq!(a.calls() + b.calls(), 1);

    let metrics = conduit.metrics();
    assert_eq!(metrics.failed_executions, 1);
    assert_eq!(metrics.errors.remote, 1);
    assert_eq!(conduit.cache_stats().entries, 0, "failures are never cached");

    conduit.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_deadline_bounds_a_slow_call() {
    let cluster = MockCluster::new();
    cluster.node(A).set_delay(Duration::from_secs(5));
    let conduit = Conduit::connect(test_config(&[A]), cluster.factory())
        .await
        .unwrap();

    let err = conduit
        .execute(
            "getSlot",
            vec![],
            CallOptions::new().with_deadline(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err.root_cause(), ConduitError::Timeout(_)), "got {err:?}");

    conduit.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_instance_is_routed_around() {
    let cluster = MockCluster::new();
    let a = cluster.node(A);
    let conduit = Conduit::connect(test_config(&[A, B]), cluster.factory())
        .await
        .unwrap();

    a.down.store(true, std::sync::atomic::Ordering::SeqCst);
    for _ in 0..conduit.config().balancer.unhealthy_threshold {
        conduit.balancer().health_check_all().await;
    }

    let details = conduit.details();
    let a_detail = details.iter().find(|d| d.endpoint == A).unwrap();
    assert!(!a_detail.healthy);
    assert!(!a_detail.is_routable());

    for _ in 0..4 {
        let result = conduit
            .execute("getSlot", vec![], CallOptions::new().uncached())
            .await
            .unwrap();
        assert_eq!(result["endpoint"], B);
    }
    assert_eq!(a.calls_to("getSlot"), 0);
    assert_eq!(conduit.metrics().healthy_instances, 1);

    // Recovery on the next successful probe
    a.down.store(false, std::sync::atomic::Ordering::SeqCst);
    conduit.balancer().health_check_all().await;
    assert_eq!(conduit.metrics().healthy_instances, 2);

    conduit.shutdown().await;
}

#[tokio::test]
async fn test_batch_preserves_order_and_dedups() {
    let cluster = MockCluster::new();
    let node = cluster.node(A);
    let conduit = Conduit::connect(test_config(&[A]), cluster.factory())
        .await
        .unwrap();

    let results = conduit
        .batch_execute(vec![
            CallSpec::new("getBalance", vec![json!("a")]),
            CallSpec::new("getBalance", vec![json!("b")]),
            CallSpec::new("getBalance", vec![json!("a")]),
        ])
        .await;

    assert_eq!(results.len(), 3);
    let params: Vec<_> = results
        .iter()
        .map(|r| r.as_ref().unwrap()["params"][0].clone())
        .collect();
    assert_eq!(params, vec![json!("a"), json!("b"), json!("a")]);
    assert_eq!(node.calls_to("getBalance"), 2);

    conduit.shutdown().await;
}

#[tokio::test]
async fn test_warmup_populates_cache() {
    let cluster = MockCluster::new();
    let node = cluster.node(A);
    let mut config = test_config(&[A]);
    config.warmup_methods = vec!["getHealth".into(), "getVersion".into()];
    let conduit = Conduit::connect(config, cluster.factory()).await.unwrap();

    let report = conduit.warmup().await;
    assert_eq!(report.succeeded.len(), 2);
    assert!(report.failed.is_empty());
    assert_eq!(conduit.cache_stats().entries, 2);

    conduit
        .execute("getVersion", vec![], CallOptions::default())
        .await
        .unwrap();
    assert_eq!(node.calls_to("getVersion"), 1);

    conduit.shutdown().await;
}

#[tokio::test]
async fn test_typed_decode() {
    #[derive(Debug, Deserialize)]
    struct Echo {
        method: String,
        params: Vec<u64>,
    }

    let cluster = MockCluster::new();
    let conduit = Conduit::connect(test_config(&[A]), cluster.factory())
        .await
        .unwrap();

    let echo: Echo = conduit
        .execute_with_codec(
            &JsonCodec::<Echo>::new(),
            "getBlock",
            vec![json!(7)],
            CallOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(echo.method, "getBlock");
    assert_eq!(echo.params, vec![7]);

    conduit.shutdown().await;
}

#[tokio::test]
async fn test_details_list_connections() {
    let cluster = MockCluster::new();
    let conduit = Conduit::connect(test_config(&[A, B]), cluster.factory())
        .await
        .unwrap();
    conduit
        .execute("getSlot", vec![], CallOptions::default())
        .await
        .unwrap();

    let details = conduit.details();
    assert_eq!(details.len(), 2);
    for detail in &details {
        assert!(detail.is_routable());
        assert!(!detail.connections.is_empty());
        for conn in &detail.connections {
            assert_eq!(conn.endpoint, detail.endpoint);
            assert!(!conn.in_use);
            assert!(conn.last_used <= chrono::Utc::now());
        }
    }
    let served: u64 = details.iter().map(|d| d.request_count).sum();
    assert_eq!(served, 1);

    conduit.shutdown().await;
}

#[tokio::test]
async fn test_autoscale_follows_resource_usage() {
    let cluster = MockCluster::new();
    let mut config = test_config(&[A, B]);
    config.standby_endpoints = vec![C.to_string()];
    config.autoscale.enabled = true;
    config.autoscale.min_instances = 1;
    config.autoscale.max_instances = 3;
    let conduit = Conduit::connect(config, cluster.factory()).await.unwrap();
    assert_eq!(conduit.scheduler_stats().unwrap().capacity, 8);

    for detail in conduit.details() {
        assert!(conduit.report_resource_usage(&detail.id, 95.0, 40.0));
    }
    match conduit.autoscale_now().await.unwrap() {
        ScalingAction::Added { endpoint, .. } => assert_eq!(endpoint, C),
        other => panic!("expected scale up, got {other:?}"),
    }
    assert_eq!(conduit.balancer().instance_count(), 3);
    assert_eq!(conduit.scheduler_stats().unwrap().capacity, 12);

    for detail in conduit.details() {
        conduit.report_resource_usage(&detail.id, 10.0, 10.0);
    }
    assert!(matches!(
        conduit.autoscale_now().await.unwrap(),
        ScalingAction::Removed { .. }
    ));
    assert_eq!(conduit.balancer().instance_count(), 2);
    assert_eq!(conduit.scheduler_stats().unwrap().capacity, 8);

    let stats = conduit.autoscaler_stats().unwrap();
    assert_eq!(stats.scale_ups, 1);
    assert_eq!(stats.scale_downs, 1);

    conduit.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_forces_busy_connections_after_drain_timeout() {
    let cluster = MockCluster::new();
    cluster.node(A).set_delay(Duration::from_secs(5));
    let conduit = Conduit::connect(test_config(&[A]), cluster.factory())
        .await
        .unwrap();

    let in_flight = conduit.clone();
    tokio::spawn(async move {
        let _ = in_flight
            .execute("getSlot", vec![], CallOptions::default())
            .await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = conduit.shutdown().await;
    assert!(!report.drained);
    assert_eq!(report.forced_connections, 1);
    assert!(conduit.is_shut_down());

    let err = conduit
        .execute("getSlot", vec![], CallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, ConduitError::ShutDown);

    let again = conduit.shutdown().await;
    assert!(again.drained);
    assert_eq!(again.closed_connections, 0);
}
