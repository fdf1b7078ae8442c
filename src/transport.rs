/*!
 * Transport capability and the JSON-RPC over HTTP transport
 *
 * The execution layer never binds to per-method APIs. Every remote call goes
 * through `Transport::call(method, params)`, and pooled connections are
 * `Arc<dyn Transport>` handles produced by a `ConnectionFactory`.
 */

use async_trait::async_trait;
use conduit_core_resilience::{ConnectionFactory, ResilienceError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ConduitError, Result};

/// A logical connection to one remote endpoint
#[async_trait]
pub trait Transport: Send + Sync {
    /// Invoke `method` with positional `params` and return the raw result
    async fn call(&self, method: &str, params: &[Value]) -> Result<Value>;

    /// Endpoint this transport talks to
    fn endpoint(&self) -> &str;
}

/// Pooled connection handle
pub type Connection = Arc<dyn Transport>;

/// Factory producing pooled connections
pub type TransportFactory = dyn ConnectionFactory<Connection>;

/// JSON-RPC 2.0 request envelope
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub jsonrpc: &'a str,
    pub id: u64,
    pub method: &'a str,
    pub params: &'a [Value],
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// JSON-RPC 2.0 response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// Server-defined error codes (`-32099..=-32000`) signal node-side conditions
/// such as lagging or overload, which clear on their own.
pub fn is_transient_rpc_code(code: i64) -> bool {
    (-32099..=-32000).contains(&code)
}

impl From<JsonRpcError> for ConduitError {
    fn from(err: JsonRpcError) -> Self {
        ConduitError::Remote {
            code: err.code,
            message: err.message,
            transient: is_transient_rpc_code(err.code),
        }
    }
}

/// Map a non-success HTTP status to an error
///
/// Throttling and server errors are connection-level failures; other client
/// errors mean the request itself was rejected.
pub fn classify_http_status(status: u16) -> ConduitError {
    if status == 429 || status >= 500 {
        ConduitError::Transport(format!("HTTP {}", status))
    } else {
        ConduitError::Remote {
            code: i64::from(status),
            message: format!("HTTP {}", status),
            transient: false,
        }
    }
}

/// Extract the result from a decoded JSON-RPC response
pub fn into_result(response: JsonRpcResponse) -> Result<Value> {
    if let Some(error) = response.error {
        return Err(error.into());
    }
    response
        .result
        .ok_or_else(|| ConduitError::Codec("response missing result".to_string()))
}

/// JSON-RPC over HTTP, one HTTP client per logical connection
#[derive(Debug)]
pub struct HttpTransport {
    endpoint: String,
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, connect_timeout: Duration) -> Result<Self> {
        let endpoint = endpoint.into();
        reqwest::Url::parse(&endpoint)
            .map_err(|e| ConduitError::Config(format!("invalid endpoint '{}': {}", endpoint, e)))?;
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .pool_max_idle_per_host(1)
            .build()
            .map_err(|e| ConduitError::Transport(e.to_string()))?;
        Ok(Self {
            endpoint,
            client,
            next_id: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(&self, method: &str, params: &[Value]) -> Result<Value> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| ConduitError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_http_status(status.as_u16()));
        }

        let body: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| ConduitError::Codec(e.to_string()))?;
        into_result(body)
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Opens `HttpTransport` connections for the pool
#[derive(Debug, Clone)]
pub struct HttpTransportFactory {
    connect_timeout: Duration,
}

impl HttpTransportFactory {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for HttpTransportFactory {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl ConnectionFactory<Connection> for HttpTransportFactory {
    async fn create(&self, endpoint: &str) -> std::result::Result<Connection, ResilienceError> {
        HttpTransport::new(endpoint, self.connect_timeout)
            .map(|transport| Arc::new(transport) as Connection)
            .map_err(|e| ResilienceError::ConnectFailed {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_envelope_shape() {
        let params = vec![json!("abc"), json!({"commitment": "finalized"})];
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: 7,
            method: "getBalance",
            params: &params,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "jsonrpc": "2.0",
                "id": 7,
                "method": "getBalance",
                "params": ["abc", {"commitment": "finalized"}]
            })
        );
    }

    #[test]
    fn test_response_with_result() {
        let response: JsonRpcResponse =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 1, "result": 42})).unwrap();
        assert_eq!(into_result(response).unwrap(), json!(42));
    }

    #[test]
    fn test_response_with_error() {
        let response: JsonRpcResponse = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32005, "message": "Node is behind"}
        }))
        .unwrap();

        let err = into_result(response).unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, ConduitError::Remote { code: -32005, .. }));
    }

    #[test]
    fn test_invalid_params_is_permanent() {
        let err: ConduitError = JsonRpcError {
            code: -32602,
            message: "Invalid params".to_string(),
            data: None,
        }
        .into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_response_missing_result() {
        let response: JsonRpcResponse =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 1})).unwrap();
        assert!(matches!(
            into_result(response),
            Err(ConduitError::Codec(_))
        ));
    }

    #[test]
    fn test_http_status_classification() {
        assert!(classify_http_status(503).is_retryable());
        assert!(classify_http_status(429).trips_breaker());
        assert!(!classify_http_status(404).is_retryable());
    }

    #[tokio::test]
    async fn test_factory_rejects_invalid_endpoint() {
        let factory = HttpTransportFactory::default();
        let err = factory.create("not a url").await.err().unwrap();
        assert!(matches!(err, ResilienceError::ConnectFailed { .. }));

        let conn = factory.create("http://127.0.0.1:8899").await.unwrap();
        assert_eq!(conn.endpoint(), "http://127.0.0.1:8899");
    }
}
