/*!
 * Result decoding through a caller-supplied codec
 */

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::marker::PhantomData;

use crate::error::{ConduitError, Result};

/// Turns a raw result into the caller's type
///
/// Decoding happens after caching and coalescing, so every waiter on a shared
/// call decodes the same raw value with its own codec.
pub trait Codec: Send + Sync {
    type Output: Send + 'static;

    fn decode(&self, method: &str, raw: &Value) -> Result<Self::Output>;
}

/// Passes raw values through untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    type Output = Value;

    fn decode(&self, _method: &str, raw: &Value) -> Result<Value> {
        Ok(raw.clone())
    }
}

/// Deserializes results with serde
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned + Send + 'static> Codec for JsonCodec<T> {
    type Output = T;

    fn decode(&self, method: &str, raw: &Value) -> Result<T> {
        T::deserialize(raw)
            .map_err(|e| ConduitError::Codec(format!("failed to decode {} result: {}", method, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct Version {
        solana_core: String,
        feature_set: u64,
    }

    #[test]
    fn test_json_codec_decodes() {
        let codec = JsonCodec::<Version>::new();
        let decoded = codec
            .decode(
                "getVersion",
                &json!({"solanaCore": "1.18.0", "featureSet": 42}),
            )
            .unwrap();
        assert_eq!(decoded.solana_core, "1.18.0");
        assert_eq!(decoded.feature_set, 42);
    }

    #[test]
    fn test_json_codec_error_is_permanent() {
        let codec = JsonCodec::<u64>::new();
        let err = codec.decode("getSlot", &json!("not a number")).unwrap_err();
        assert!(matches!(err, ConduitError::Codec(_)));
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("getSlot"));
    }

    #[test]
    fn test_raw_codec_passthrough() {
        let raw = json!({"slot": 1});
        assert_eq!(RawCodec.decode("getSlot", &raw).unwrap(), raw);
    }
}
