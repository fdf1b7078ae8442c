//! In-memory nodes for driving `Conduit` without a network

#![allow(dead_code)]

use async_trait::async_trait;
use conduit::transport::{Connection, Transport, TransportFactory};
use conduit::{ConduitConfig, ConduitError, Result};
use conduit_core_resilience::{ConnectionFactory, ResilienceError};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Behaviour of one fake endpoint, shared by all its connections
#[derive(Default)]
pub struct MockNode {
    pub calls: AtomicUsize,
    pub down: AtomicBool,
    delay_ms: AtomicUsize,
    scripted: Mutex<VecDeque<Result<Value>>>,
    methods: Mutex<Vec<String>>,
}

impl MockNode {
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    /// Queue outcomes returned before falling back to the default echo
    pub fn script(&self, outcomes: impl IntoIterator<Item = Result<Value>>) {
        self.scripted.lock().unwrap().extend(outcomes);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_to(&self, method: &str) -> usize {
        self.methods
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.as_str() == method)
            .count()
    }
}

struct MockTransport {
    endpoint: String,
    node: Arc<MockNode>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn call(&self, method: &str, params: &[Value]) -> Result<Value> {
        self.node.calls.fetch_add(1, Ordering::SeqCst);
        self.node.methods.lock().unwrap().push(method.to_string());

        let delay = self.node.delay_ms.load(Ordering::SeqCst) as u64;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.node.down.load(Ordering::SeqCst) {
            return Err(ConduitError::Transport("connection refused".into()));
        }
        let scripted = self.node.scripted.lock().unwrap().pop_front();
        match scripted {
            Some(outcome) => outcome,
            None => Ok(json!({
                "endpoint": self.endpoint,
                "method": method,
                "params": params,
            })),
        }
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Factory handing out connections to named mock nodes
#[derive(Default)]
pub struct MockCluster {
    nodes: Mutex<HashMap<String, Arc<MockNode>>>,
}

impl MockCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn node(&self, endpoint: &str) -> Arc<MockNode> {
        Arc::clone(
            self.nodes
                .lock()
                .unwrap()
                .entry(endpoint.to_string())
                .or_default(),
        )
    }

    pub fn factory(self: &Arc<Self>) -> Arc<TransportFactory> {
        Arc::clone(self) as Arc<TransportFactory>
    }
}

#[async_trait]
impl ConnectionFactory<Connection> for MockCluster {
    async fn create(&self, endpoint: &str) -> std::result::Result<Connection, ResilienceError> {
        Ok(Arc::new(MockTransport {
            endpoint: endpoint.to_string(),
            node: self.node(endpoint),
        }))
    }
}

/// Small pools, fast retries and short drains
pub fn test_config(endpoints: &[&str]) -> ConduitConfig {
    let mut config = ConduitConfig::default();
    config.endpoints = endpoints.iter().map(|e| e.to_string()).collect();
    config.pool.min_connections = 1;
    config.pool.max_connections = 4;
    config.pool.acquire_timeout_ms = 500;
    config.retry.max_attempts = 3;
    config.retry.base_delay_ms = 100;
    config.balancer.acquire_timeout_ms = 500;
    config.balancer.poll_interval_ms = 10;
    config.drain_timeout_ms = 200;
    config
}

pub fn transient() -> ConduitError {
    ConduitError::Transport("connection reset".into())
}
