//! Key and value deserializers applied by the client adapter

use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use thiserror::Error;

/// Why a record key or value could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeserializationError {
    /// Payload was null but a value is required
    #[error("null payload")]
    NullPayload,

    /// Payload is not valid UTF-8
    #[error("invalid utf-8: {0}")]
    Utf8(String),

    /// Payload is not valid JSON for the target type
    #[error("invalid json: {0}")]
    Json(String),
}

/// Turns raw record bytes into `T`
pub trait Deserializer<T>: Send + Sync + 'static {
    /// Decode `data`; `None` for a null key or tombstone value
    fn deserialize(&self, data: Option<&[u8]>) -> Result<T, DeserializationError>;
}

/// Ignores the bytes entirely
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreDeserializer;

impl Deserializer<()> for IgnoreDeserializer {
    fn deserialize(&self, _data: Option<&[u8]>) -> Result<(), DeserializationError> {
        Ok(())
    }
}

/// Copies the raw bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesDeserializer;

impl Deserializer<Option<Vec<u8>>> for BytesDeserializer {
    fn deserialize(&self, data: Option<&[u8]>) -> Result<Option<Vec<u8>>, DeserializationError> {
        Ok(data.map(<[u8]>::to_vec))
    }
}

/// UTF-8 text
#[derive(Debug, Clone, Copy, Default)]
pub struct StringDeserializer;

impl Deserializer<String> for StringDeserializer {
    fn deserialize(&self, data: Option<&[u8]>) -> Result<String, DeserializationError> {
        let data = data.ok_or(DeserializationError::NullPayload)?;
        std::str::from_utf8(data)
            .map(str::to_owned)
            .map_err(|e| DeserializationError::Utf8(e.to_string()))
    }
}

impl Deserializer<Option<String>> for StringDeserializer {
    fn deserialize(&self, data: Option<&[u8]>) -> Result<Option<String>, DeserializationError> {
        match data {
            Some(_) => Deserializer::<String>::deserialize(self, data).map(Some),
            None => Ok(None),
        }
    }
}

/// JSON into any `DeserializeOwned` type
pub struct JsonDeserializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonDeserializer<T> {
    /// Create a JSON deserializer
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonDeserializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonDeserializer<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned + 'static> Deserializer<T> for JsonDeserializer<T> {
    fn deserialize(&self, data: Option<&[u8]>) -> Result<T, DeserializationError> {
        let data = data.ok_or(DeserializationError::NullPayload)?;
        serde_json::from_slice(data).map_err(|e| DeserializationError::Json(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Alert {
        message: String,
        #[serde(rename = "@timestamp")]
        timestamp: String,
    }

    #[test]
    fn test_string_deserializer() {
        let value: String = StringDeserializer.deserialize(Some(&b"hello"[..])).unwrap();
        assert_eq!(value, "hello");

        let err = Deserializer::<String>::deserialize(&StringDeserializer, Some(&[0xffu8, 0xfe][..]))
            .unwrap_err();
        assert!(matches!(err, DeserializationError::Utf8(_)));

        let err = Deserializer::<String>::deserialize(&StringDeserializer, None).unwrap_err();
        assert_eq!(err, DeserializationError::NullPayload);

        let key: Option<String> = StringDeserializer.deserialize(None).unwrap();
        assert_eq!(key, None);
    }

    #[test]
    fn test_json_deserializer() {
        let payload = br#"{"message": "disk full", "@timestamp": "2024-01-01T00:00:00Z"}"#;
        let alert: Alert = JsonDeserializer::new().deserialize(Some(&payload[..])).unwrap();
        assert_eq!(alert.message, "disk full");
        assert_eq!(alert.timestamp, "2024-01-01T00:00:00Z");

        let err = JsonDeserializer::<Alert>::new()
            .deserialize(Some(&b"{not json"[..]))
            .unwrap_err();
        assert!(matches!(err, DeserializationError::Json(_)));
    }

    #[test]
    fn test_bytes_and_ignore() {
        assert_eq!(BytesDeserializer.deserialize(Some(&b"ab"[..])).unwrap(), Some(b"ab".to_vec()));
        assert_eq!(BytesDeserializer.deserialize(None).unwrap(), None);
        assert!(IgnoreDeserializer.deserialize(Some(&b"anything"[..])).is_ok());
    }
}
