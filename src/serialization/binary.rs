//! Opaque binary codec.

use std::io::{Read, Write};
use std::sync::Arc;

use crate::models::Value;
use crate::serialization::{read_to_end, write_all, Serializer, TypeRegistry};
use crate::Result;

/// Compact `postcard` encoding of [`Value`].
///
/// Covers every value natively, including non-finite floats, but the output
/// is only readable by this codec.
#[derive(Debug, Clone)]
pub struct BinarySerializer {
    registry: Arc<TypeRegistry>,
}

impl BinarySerializer {
    /// Create a codec that checks decoded values against `registry`.
    #[must_use]
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self { registry }
    }
}

impl Default for BinarySerializer {
    fn default() -> Self {
        Self::new(Arc::new(TypeRegistry::new()))
    }
}

impl Serializer for BinarySerializer {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn serialize(&self, value: &Value, writer: &mut dyn Write) -> Result<()> {
        let bytes = postcard::to_allocvec(value)?;
        write_all(writer, &bytes)
    }

    fn deserialize(&self, reader: &mut dyn Read) -> Result<Value> {
        let bytes = read_to_end(reader)?;
        let value: Value = postcard::from_bytes(&bytes)?;
        self.registry.resolve_value(value)
    }
}
