//! Canonical tagged JSON codec.
//!
//! Output is byte-identical for equal inputs: object keys are sorted and no
//! whitespace is emitted. Values without a JSON counterpart are written as
//! `{"__bandsaw__": <tag>, "value": <form>}` by the [`ValueExtension`] that
//! claims them.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

use serde_json::{Map, Number, Value as Json};

use crate::models::Value;
use crate::serialization::extensions::{
    BytesExtension, ExceptionExtension, ObjectExtension, TupleExtension, ValueExtension,
};
use crate::serialization::{read_to_end, write_all, Serializer, TypeRegistry};
use crate::{BandsawError, Result};

/// Reserved key marking an extension-encoded value.
pub const TAG_KEY: &str = "__bandsaw__";
/// Key holding the extension's form next to [`TAG_KEY`].
pub const FORM_KEY: &str = "value";

/// JSON codec with deterministic output and pluggable extensions.
#[derive(Debug, Clone)]
pub struct JsonSerializer {
    registry: Arc<TypeRegistry>,
    extensions: Vec<Arc<dyn ValueExtension>>,
}

impl JsonSerializer {
    /// Create a codec with the built-in extensions for bytes, tuples, errors
    /// and self-describing objects.
    #[must_use]
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self {
            registry,
            extensions: vec![
                Arc::new(BytesExtension),
                Arc::new(TupleExtension),
                Arc::new(ExceptionExtension),
                Arc::new(ObjectExtension),
            ],
        }
    }

    /// Add an extension. Later extensions are consulted before earlier ones,
    /// so a custom extension can take over values a built-in would handle.
    #[must_use]
    pub fn with_extension(mut self, extension: Arc<dyn ValueExtension>) -> Self {
        self.extensions.insert(0, extension);
        self
    }

    /// Registry used to bind decoded types.
    #[must_use]
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Convert a value into its JSON form.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Serialization` for non-finite floats, maps using
    /// the reserved tag key, or values no extension can handle.
    pub fn to_json(&self, value: &Value) -> Result<Json> {
        if let Some(extension) = self
            .extensions
            .iter()
            .find(|extension| extension.can_serialize(value))
        {
            let form = extension.serialize_value(value, self)?;
            let mut tagged = Map::new();
            tagged.insert(TAG_KEY.to_owned(), Json::String(extension.tag().to_owned()));
            tagged.insert(FORM_KEY.to_owned(), form);
            return Ok(Json::Object(tagged));
        }

        match value {
            Value::Null => Ok(Json::Null),
            Value::Bool(flag) => Ok(Json::Bool(*flag)),
            Value::Int(number) => Ok(Json::Number(Number::from(*number))),
            Value::Float(number) => {
                Number::from_f64(*number).map(Json::Number).ok_or_else(|| {
                    BandsawError::Serialization(format!(
                        "out of range float value {number} is not allowed"
                    ))
                })
            }
            Value::Str(text) => Ok(Json::String(text.clone())),
            Value::List(items) => Ok(Json::Array(
                items
                    .iter()
                    .map(|item| self.to_json(item))
                    .collect::<Result<_>>()?,
            )),
            Value::Map(map) => {
                if map.contains_key(TAG_KEY) {
                    return Err(BandsawError::Serialization(format!(
                        "map key '{TAG_KEY}' is reserved"
                    )));
                }
                let mut object = Map::new();
                for (key, item) in map {
                    object.insert(key.clone(), self.to_json(item)?);
                }
                Ok(Json::Object(object))
            }
            other => Err(BandsawError::Serialization(format!(
                "no extension can serialize {}",
                other.kind()
            ))),
        }
    }

    /// Convert a JSON form back into a value.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Serialization` for unknown tags or malformed
    /// forms, and `BandsawError::UnknownType` for unregistered objects.
    pub fn from_json(&self, json: Json) -> Result<Value> {
        match json {
            Json::Null => Ok(Value::Null),
            Json::Bool(flag) => Ok(Value::Bool(flag)),
            Json::Number(number) => {
                if let Some(int) = number.as_i64() {
                    Ok(Value::Int(int))
                } else if number.is_u64() {
                    Err(BandsawError::Serialization(format!(
                        "integer {number} does not fit into i64"
                    )))
                } else {
                    number.as_f64().map(Value::Float).ok_or_else(|| {
                        BandsawError::Serialization(format!("invalid number {number}"))
                    })
                }
            }
            Json::String(text) => Ok(Value::Str(text)),
            Json::Array(items) => Ok(Value::List(
                items
                    .into_iter()
                    .map(|item| self.from_json(item))
                    .collect::<Result<_>>()?,
            )),
            Json::Object(mut object) => {
                if let Some(tag) = object.remove(TAG_KEY) {
                    let tag = tag.as_str().map(ToOwned::to_owned).ok_or_else(|| {
                        BandsawError::Serialization("type tag must be a string".into())
                    })?;
                    let extension = self
                        .extensions
                        .iter()
                        .find(|extension| extension.tag() == tag)
                        .ok_or_else(|| {
                            BandsawError::Serialization(format!("unknown type tag '{tag}'"))
                        })?;
                    let form = object.remove(FORM_KEY).ok_or_else(|| {
                        BandsawError::Serialization(format!("tagged value '{tag}' has no form"))
                    })?;
                    return extension.deserialize_value(form, self);
                }
                let mut map = BTreeMap::new();
                for (key, item) in object {
                    map.insert(key, self.from_json(item)?);
                }
                Ok(Value::Map(map))
            }
        }
    }

    /// Encode `value` as canonical JSON bytes.
    ///
    /// # Errors
    ///
    /// Same as [`JsonSerializer::to_json`].
    pub fn to_canonical_bytes(&self, value: &Value) -> Result<Vec<u8>> {
        let json = self.to_json(value)?;
        let mut out = String::new();
        write_canonical(&json, &mut out)?;
        Ok(out.into_bytes())
    }
}

impl Default for JsonSerializer {
    fn default() -> Self {
        Self::new(Arc::new(TypeRegistry::new()))
    }
}

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize(&self, value: &Value, writer: &mut dyn Write) -> Result<()> {
        let bytes = self.to_canonical_bytes(value)?;
        write_all(writer, &bytes)
    }

    fn deserialize(&self, reader: &mut dyn Read) -> Result<Value> {
        let bytes = read_to_end(reader)?;
        let json: Json = serde_json::from_slice(&bytes)?;
        self.from_json(json)
    }
}

/// Write JSON with sorted object keys and no whitespace.
fn write_canonical(json: &Json, out: &mut String) -> Result<()> {
    match json {
        Json::Null => out.push_str("null"),
        Json::Bool(flag) => out.push_str(if *flag { "true" } else { "false" }),
        Json::Number(number) => out.push_str(&number.to_string()),
        Json::String(text) => out.push_str(&serde_json::to_string(text)?),
        Json::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        Json::Object(object) => {
            let sorted: BTreeMap<&String, &Json> = object.iter().collect();
            out.push('{');
            for (index, (key, item)) in sorted.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(item, out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}
