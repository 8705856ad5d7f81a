//! Pluggable codecs for [`Value`]s.
//!
//! Two serializers are provided: [`BinarySerializer`], an opaque compact
//! encoding covering every value natively, and [`JsonSerializer`], a
//! canonical tagged JSON encoding that can be extended with
//! [`ValueExtension`]s. Both consult a [`TypeRegistry`] when decoding
//! named tuples, errors and self-describing objects.

use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

use serde::Deserialize;

use crate::models::Value;
use crate::{BandsawError, Result};

pub mod binary;
pub mod extensions;
pub mod json;
pub mod types;

pub use binary::BinarySerializer;
pub use extensions::ValueExtension;
pub use json::JsonSerializer;
pub use types::TypeRegistry;

/// Codec that writes and reads [`Value`]s.
pub trait Serializer: Send + Sync + fmt::Debug {
    /// Short name used in logs and settings.
    fn name(&self) -> &'static str;

    /// Encode `value` into `writer`.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Serialization` if the value cannot be encoded,
    /// or `BandsawError::Io` if writing fails.
    fn serialize(&self, value: &Value, writer: &mut dyn Write) -> Result<()>;

    /// Decode one value from `reader`.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Serialization` for malformed input,
    /// `BandsawError::UnknownType` for unregistered object types, or
    /// `BandsawError::Io` if reading fails.
    fn deserialize(&self, reader: &mut dyn Read) -> Result<Value>;

    /// Encode `value` into a fresh buffer.
    ///
    /// # Errors
    ///
    /// Same as [`Serializer::serialize`].
    fn to_bytes(&self, value: &Value) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.serialize(value, &mut buffer)?;
        Ok(buffer)
    }

    /// Decode a value from a byte slice.
    ///
    /// # Errors
    ///
    /// Same as [`Serializer::deserialize`].
    fn from_bytes(&self, mut bytes: &[u8]) -> Result<Value> {
        self.deserialize(&mut bytes)
    }
}

/// Serializer selection in settings files.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SerializerKind {
    /// Canonical tagged JSON.
    #[default]
    Json,
    /// Compact opaque binary.
    Binary,
}

impl SerializerKind {
    /// Build the selected serializer over `registry`.
    #[must_use]
    pub fn build(self, registry: Arc<TypeRegistry>) -> Arc<dyn Serializer> {
        match self {
            Self::Json => Arc::new(JsonSerializer::new(registry)),
            Self::Binary => Arc::new(BinarySerializer::new(registry)),
        }
    }
}

pub(crate) fn read_to_end(reader: &mut dyn Read) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    reader
        .read_to_end(&mut buffer)
        .map_err(|err| BandsawError::Io(format!("failed to read serialized value: {err}")))?;
    Ok(buffer)
}

pub(crate) fn write_all(writer: &mut dyn Write, bytes: &[u8]) -> Result<()> {
    writer
        .write_all(bytes)
        .map_err(|err| BandsawError::Io(format!("failed to write serialized value: {err}")))
}
