//! Payload encodings.
//!
//! A log is generic over its value type `T`; an [`Encoding<T>`] turns values
//! into payload bytes and back. The encoding is supplied at runtime (through
//! `LogOptions` or `Entry::init`) rather than looked up in a global registry.

use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::LogError;

/// Converts log values to and from payload bytes.
pub trait Encoding<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<Vec<u8>, LogError>;

    fn decode(&self, bytes: &[u8]) -> Result<T, LogError>;
}

/// Identity encoding for raw byte values.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesEncoding;

impl Encoding<Vec<u8>> for BytesEncoding {
    fn encode(&self, value: &Vec<u8>) -> Result<Vec<u8>, LogError> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>, LogError> {
        Ok(bytes.to_vec())
    }
}

/// UTF-8 string values.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringEncoding;

impl Encoding<String> for StringEncoding {
    fn encode(&self, value: &String) -> Result<Vec<u8>, LogError> {
        Ok(value.as_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<String, LogError> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| LogError::Serialization(format!("payload is not utf-8: {e}")))
    }
}

/// Any serde value, encoded with postcard.
pub struct PostcardEncoding<T>(PhantomData<fn() -> T>);

impl<T> PostcardEncoding<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for PostcardEncoding<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for PostcardEncoding<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for PostcardEncoding<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PostcardEncoding<{}>", std::any::type_name::<T>())
    }
}

impl<T> Encoding<T> for PostcardEncoding<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>, LogError> {
        Ok(postcard::to_allocvec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, LogError> {
        Ok(postcard::from_bytes(bytes)?)
    }
}
