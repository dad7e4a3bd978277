//! Payload codec traits.
//!
//! Workflow inputs, results, and decoded-future payloads cross the
//! runtime boundary as [`Bytes`]. The traits here express
//! "serialize-from" and "deserialize-into" as capabilities of a codec
//! for a given value type, so a type mismatch is a trait-bound failure
//! at the call site instead of a runtime shape check; what remains at
//! runtime (a payload that fails to decode) is returned as an ordinary
//! error.
//!
//! To implement a codec, implement `Encoder`/`Decoder` (empty impls are
//! fine) and provide `sealed::EncodeValue<T>` / `sealed::DecodeValue<T>`
//! with whatever bounds the format needs.

use anyhow::Result;
use bytes::Bytes;

/// Helper traits carrying the per-type bounds of a codec implementation.
pub mod sealed {
    use super::*;

    /// Serialize a `T` into a payload.
    pub trait EncodeValue<T>: Send + Sync + 'static {
        fn encode_value(&self, value: &T) -> Result<Bytes>;
    }

    /// Deserialize a `T` out of a payload.
    pub trait DecodeValue<T>: Send + Sync + 'static {
        fn decode_value(&self, bytes: Bytes) -> Result<T>;
    }
}

/// A serializer for every type it has a [`sealed::EncodeValue`] impl for.
pub trait Encoder: Send + Sync + 'static {
    fn encode<T>(&self, value: &T) -> Result<Bytes>
    where
        Self: sealed::EncodeValue<T>,
    {
        sealed::EncodeValue::encode_value(self, value)
    }
}

/// A deserializer for every type it has a [`sealed::DecodeValue`] impl for.
pub trait Decoder: Send + Sync + 'static {
    fn decode<T>(&self, bytes: Bytes) -> Result<T>
    where
        Self: sealed::DecodeValue<T>,
    {
        sealed::DecodeValue::decode_value(self, bytes)
    }
}

/// A codec both serializes and deserializes.
pub trait Codec: Encoder + Decoder {}

impl<C> Codec for C where C: Encoder + Decoder {}

// Arc-wrapped codecs are codecs too, so a shared codec can be handed to
// registries and futures without unwrapping.
impl<C, T> sealed::EncodeValue<T> for std::sync::Arc<C>
where
    C: sealed::EncodeValue<T>,
{
    fn encode_value(&self, value: &T) -> Result<Bytes> {
        (**self).encode_value(value)
    }
}

impl<C, T> sealed::DecodeValue<T> for std::sync::Arc<C>
where
    C: sealed::DecodeValue<T>,
{
    fn decode_value(&self, bytes: Bytes) -> Result<T> {
        (**self).decode_value(bytes)
    }
}

impl<C> Encoder for std::sync::Arc<C> where C: Encoder {}

impl<C> Decoder for std::sync::Arc<C> where C: Decoder {}
