// Payload Envelopes
//
// Deltas and agent signatures cross the storage boundary untyped.
// An envelope pairs the serialized payload with a type header so
// engines can filter on it and readers can resolve it back.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Platform recorded for payloads produced by this crate.
pub const RUST_PLATFORM: &str = "rust";

/// Type discriminator stored alongside every payload.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DataType {
    pub platform: String,
    pub name: String,
}

impl DataType {
    pub fn new(platform: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            name: name.into(),
        }
    }

    pub fn rust(name: impl Into<String>) -> Self {
        Self::new(RUST_PLATFORM, name)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.platform, self.name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: DataType, found: DataType },
}

/// Anything that can be sealed into an [`Envelope`].
pub trait Payload: Serialize {
    fn data_type(&self) -> DataType;
}

/// A payload staged onto a stream.
///
/// A delta carrying a message key is appended at most once per stream.
pub trait Delta: Payload {
    fn message_key(&self) -> Option<String> {
        None
    }
}

/// Serialized payload plus its type header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub data_type: DataType,
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn from_parts(data_type: DataType, data: serde_json::Value) -> Self {
        Self { data_type, data }
    }

    pub fn seal<P: Payload + ?Sized>(payload: &P) -> Result<Self, EnvelopeError> {
        Ok(Self {
            data_type: payload.data_type(),
            data: serde_json::to_value(payload)?,
        })
    }

    pub fn open<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        Ok(T::deserialize(&self.data)?)
    }

    /// Like [`Envelope::open`], but first checks the type header.
    pub fn open_expecting<T: DeserializeOwned>(
        &self,
        expected: &DataType,
    ) -> Result<T, EnvelopeError> {
        if &self.data_type != expected {
            return Err(EnvelopeError::TypeMismatch {
                expected: expected.clone(),
                found: self.data_type.clone(),
            });
        }
        self.open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct ItemAdded {
        sku: u32,
        quantity: u32,
    }

    impl Payload for ItemAdded {
        fn data_type(&self) -> DataType {
            DataType::rust("cart.item-added")
        }
    }

    #[test]
    fn sealed_payload_opens_to_the_same_value() {
        let item = ItemAdded { sku: 42, quantity: 2 };
        let envelope = Envelope::seal(&item).unwrap();

        assert_eq!(envelope.data_type, DataType::rust("cart.item-added"));
        let opened: ItemAdded = envelope
            .open_expecting(&DataType::rust("cart.item-added"))
            .unwrap();
        assert_eq!(opened, item);
    }

    #[test]
    fn wrong_type_header_is_rejected() {
        let envelope = Envelope::seal(&ItemAdded { sku: 1, quantity: 1 }).unwrap();

        let err = envelope
            .open_expecting::<ItemAdded>(&DataType::rust("cart.item-removed"))
            .unwrap_err();

        assert!(matches!(err, EnvelopeError::TypeMismatch { .. }));
    }
}
