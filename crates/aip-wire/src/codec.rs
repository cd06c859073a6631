//! Message codec registry.
//!
//! Maps a payload type name to the functions that put it on the wire and
//! take it off again. A runtime owns one registry; sending or receiving a type
//! that was never registered fails with [`AipError::CodecNotFound`].

use aip_types::error::{AipError, AipResult};
use aip_types::message::{AnyPayload, Payload};
use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

/// Type-erased encoder/decoder for one payload type.
pub trait PayloadCodec: Send + Sync {
    fn type_name(&self) -> &str;
    fn encode(&self, value: &(dyn Any + Send)) -> AipResult<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> AipResult<Box<dyn Any + Send>>;
}

/// JSON codec for any [`Payload`].
pub struct JsonCodec<T>(PhantomData<fn() -> T>);

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Payload> PayloadCodec for JsonCodec<T> {
    fn type_name(&self) -> &str {
        T::TYPE_NAME
    }

    fn encode(&self, value: &(dyn Any + Send)) -> AipResult<Vec<u8>> {
        let value = value.downcast_ref::<T>().ok_or_else(|| AipError::Codec {
            type_name: T::TYPE_NAME.to_string(),
            reason: "value does not match registered type".to_string(),
        })?;
        serde_json::to_vec(value).map_err(|e| AipError::Codec {
            type_name: T::TYPE_NAME.to_string(),
            reason: e.to_string(),
        })
    }

    fn decode(&self, bytes: &[u8]) -> AipResult<Box<dyn Any + Send>> {
        let value: T = serde_json::from_slice(bytes).map_err(|e| AipError::Codec {
            type_name: T::TYPE_NAME.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Box::new(value))
    }
}

/// Process-local table of payload codecs.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    codecs: Arc<RwLock<HashMap<String, Arc<dyn PayloadCodec>>>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a codec; a later registration for the same name replaces it.
    pub fn register(&self, codec: Arc<dyn PayloadCodec>) {
        let mut codecs = self.codecs.write().unwrap_or_else(|e| e.into_inner());
        codecs.insert(codec.type_name().to_string(), codec);
    }

    /// Register the JSON codec for `T`.
    pub fn register_json<T: Payload>(&self) {
        self.register(Arc::new(JsonCodec::<T>::new()));
    }

    pub fn contains(&self, type_name: &str) -> bool {
        let codecs = self.codecs.read().unwrap_or_else(|e| e.into_inner());
        codecs.contains_key(type_name)
    }

    /// Registered type names, sorted.
    pub fn type_names(&self) -> Vec<String> {
        let codecs = self.codecs.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = codecs.keys().cloned().collect();
        names.sort();
        names
    }

    fn lookup(&self, type_name: &str) -> AipResult<Arc<dyn PayloadCodec>> {
        let codecs = self.codecs.read().unwrap_or_else(|e| e.into_inner());
        codecs
            .get(type_name)
            .cloned()
            .ok_or_else(|| AipError::CodecNotFound(type_name.to_string()))
    }

    /// Encode a typed payload.
    pub fn encode<T: Payload>(&self, payload: &T) -> AipResult<Vec<u8>> {
        self.lookup(T::TYPE_NAME)?.encode(payload)
    }

    /// Encode a type-erased payload.
    pub fn encode_any(&self, payload: &AnyPayload) -> AipResult<Vec<u8>> {
        self.lookup(payload.type_name())?.encode(payload.as_any())
    }

    /// Decode `bytes` as the payload registered under `type_name`.
    pub fn decode(&self, type_name: &str, bytes: &[u8]) -> AipResult<AnyPayload> {
        let value = self.lookup(type_name)?.decode(bytes)?;
        Ok(AnyPayload::from_boxed(type_name, value))
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aip_types::message::Interaction;
    use aip_types::tool::{FunctionCall, FunctionExecutionResult};

    #[test]
    fn test_unregistered_type_fails_fast() {
        let registry = CodecRegistry::new();
        let call = FunctionCall::new("echo", &serde_json::json!({}));
        match registry.encode(&call) {
            Err(AipError::CodecNotFound(name)) => assert_eq!(name, "FunctionCall"),
            other => panic!("Expected CodecNotFound, got {other:?}"),
        }
        assert!(matches!(
            registry.decode("FunctionCall", b"{}"),
            Err(AipError::CodecNotFound(_))
        ));
    }

    #[test]
    fn test_encode_decode_registered() {
        let registry = CodecRegistry::new();
        registry.register_json::<FunctionCall>();
        registry.register_json::<Interaction>();
        assert_eq!(
            registry.type_names(),
            vec!["FunctionCall".to_string(), "InteractionMessage".to_string()]
        );

        let bytes = registry.encode(&Interaction::list_tools()).unwrap();
        let decoded = registry.decode("InteractionMessage", &bytes).unwrap();
        assert_eq!(
            decoded.downcast::<Interaction>().unwrap(),
            Interaction::list_tools()
        );
    }

    #[test]
    fn test_decode_garbage_is_codec_error() {
        let registry = CodecRegistry::new();
        registry.register_json::<FunctionExecutionResult>();
        match registry.decode("FunctionExecutionResult", b"not json") {
            Err(AipError::Codec { type_name, .. }) => {
                assert_eq!(type_name, "FunctionExecutionResult")
            }
            other => panic!("Expected Codec error, got {other:?}"),
        }
    }

    #[test]
    fn test_registries_are_independent() {
        let a = CodecRegistry::new();
        let b = CodecRegistry::new();
        a.register_json::<FunctionCall>();
        assert!(a.contains("FunctionCall"));
        assert!(!b.contains("FunctionCall"));

        let shared = a.clone();
        assert!(shared.contains("FunctionCall"));
    }
}
