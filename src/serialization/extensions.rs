//! Extension points of the JSON codec and its built-in extensions.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::{Map, Value as Json};
use tracing::debug;

use crate::models::{ExceptionValue, NamedTupleType, ObjectValue, Tuple, Value};
use crate::serialization::json::JsonSerializer;
use crate::{BandsawError, Result};

/// Capability that teaches [`JsonSerializer`] about additional values.
pub trait ValueExtension: Send + Sync + fmt::Debug {
    /// Tag written next to the form; must be unique per codec.
    fn tag(&self) -> &str;

    /// Whether this extension encodes `value`.
    fn can_serialize(&self, value: &Value) -> bool;

    /// Produce the JSON form of `value`.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Serialization` if `value` cannot be encoded.
    fn serialize_value(&self, value: &Value, codec: &JsonSerializer) -> Result<Json>;

    /// Rebuild a value from its JSON form.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Serialization` for malformed forms.
    fn deserialize_value(&self, form: Json, codec: &JsonSerializer) -> Result<Value>;
}

fn take(form: &mut Map<String, Json>, key: &str, tag: &str) -> Result<Json> {
    form.remove(key)
        .ok_or_else(|| BandsawError::Serialization(format!("{tag} form misses '{key}'")))
}

fn take_string(form: &mut Map<String, Json>, key: &str, tag: &str) -> Result<String> {
    match take(form, key, tag)? {
        Json::String(text) => Ok(text),
        _ => Err(BandsawError::Serialization(format!(
            "{tag} form field '{key}' must be a string"
        ))),
    }
}

fn take_array(form: &mut Map<String, Json>, key: &str, tag: &str) -> Result<Vec<Json>> {
    match take(form, key, tag)? {
        Json::Array(items) => Ok(items),
        _ => Err(BandsawError::Serialization(format!(
            "{tag} form field '{key}' must be an array"
        ))),
    }
}

fn into_object(form: Json, tag: &str) -> Result<Map<String, Json>> {
    match form {
        Json::Object(object) => Ok(object),
        _ => Err(BandsawError::Serialization(format!(
            "{tag} form must be an object"
        ))),
    }
}

fn encode_items(items: &[Value], codec: &JsonSerializer) -> Result<Json> {
    Ok(Json::Array(
        items
            .iter()
            .map(|item| codec.to_json(item))
            .collect::<Result<_>>()?,
    ))
}

fn decode_items(items: Vec<Json>, codec: &JsonSerializer) -> Result<Vec<Value>> {
    items.into_iter().map(|item| codec.from_json(item)).collect()
}

/// Raw bytes as base64 text.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesExtension;

impl ValueExtension for BytesExtension {
    fn tag(&self) -> &str {
        "bytes"
    }

    fn can_serialize(&self, value: &Value) -> bool {
        matches!(value, Value::Bytes(_))
    }

    fn serialize_value(&self, value: &Value, _codec: &JsonSerializer) -> Result<Json> {
        match value {
            Value::Bytes(bytes) => Ok(Json::String(BASE64_STANDARD.encode(bytes))),
            other => Err(BandsawError::Serialization(format!(
                "bytes extension cannot encode {}",
                other.kind()
            ))),
        }
    }

    fn deserialize_value(&self, form: Json, _codec: &JsonSerializer) -> Result<Value> {
        let text = form
            .as_str()
            .ok_or_else(|| BandsawError::Serialization("bytes form must be a string".into()))?;
        BASE64_STANDARD
            .decode(text)
            .map(Value::Bytes)
            .map_err(|err| BandsawError::Serialization(format!("invalid base64: {err}")))
    }
}

/// Plain and named tuples as `{kind, items, [name, fields, module]}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TupleExtension;

impl ValueExtension for TupleExtension {
    fn tag(&self) -> &str {
        "tuple"
    }

    fn can_serialize(&self, value: &Value) -> bool {
        matches!(value, Value::Tuple(_))
    }

    fn serialize_value(&self, value: &Value, codec: &JsonSerializer) -> Result<Json> {
        let Value::Tuple(tuple) = value else {
            return Err(BandsawError::Serialization(format!(
                "tuple extension cannot encode {}",
                value.kind()
            )));
        };
        let mut form = Map::new();
        form.insert("items".into(), encode_items(&tuple.items, codec)?);
        match &tuple.kind {
            None => {
                form.insert("kind".into(), Json::String("tuple".into()));
            }
            Some(kind) => {
                form.insert("kind".into(), Json::String("namedtuple".into()));
                form.insert("name".into(), Json::String(kind.name.clone()));
                form.insert("module".into(), Json::String(kind.module.clone()));
                form.insert(
                    "fields".into(),
                    Json::Array(kind.fields.iter().cloned().map(Json::String).collect()),
                );
            }
        }
        Ok(Json::Object(form))
    }

    fn deserialize_value(&self, form: Json, codec: &JsonSerializer) -> Result<Value> {
        let mut form = into_object(form, "tuple")?;
        let items = decode_items(take_array(&mut form, "items", "tuple")?, codec)?;
        match take_string(&mut form, "kind", "tuple")?.as_str() {
            "tuple" => Ok(Value::Tuple(Tuple::plain(items))),
            "namedtuple" => {
                let name = take_string(&mut form, "name", "tuple")?;
                let module = take_string(&mut form, "module", "tuple")?;
                let fields = take_array(&mut form, "fields", "tuple")?
                    .into_iter()
                    .map(|field| match field {
                        Json::String(field) => Ok(field),
                        _ => Err(BandsawError::Serialization(
                            "named tuple fields must be strings".into(),
                        )),
                    })
                    .collect::<Result<Vec<_>>>()?;
                let decoded = NamedTupleType {
                    name,
                    module,
                    fields,
                    synthesized: false,
                };
                let kind = codec.registry().resolve_named_tuple(decoded);
                Ok(Value::Tuple(Tuple::named(kind, items)?))
            }
            other => Err(BandsawError::Serialization(format!(
                "unknown tuple kind '{other}'"
            ))),
        }
    }
}

/// Errors as `{type, module, args}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExceptionExtension;

impl ValueExtension for ExceptionExtension {
    fn tag(&self) -> &str {
        "exception"
    }

    fn can_serialize(&self, value: &Value) -> bool {
        matches!(value, Value::Exception(_))
    }

    fn serialize_value(&self, value: &Value, codec: &JsonSerializer) -> Result<Json> {
        let Value::Exception(exception) = value else {
            return Err(BandsawError::Serialization(format!(
                "exception extension cannot encode {}",
                value.kind()
            )));
        };
        let mut form = Map::new();
        form.insert("type".into(), Json::String(exception.type_name.clone()));
        form.insert("module".into(), Json::String(exception.module.clone()));
        form.insert("args".into(), encode_items(&exception.args, codec)?);
        Ok(Json::Object(form))
    }

    fn deserialize_value(&self, form: Json, codec: &JsonSerializer) -> Result<Value> {
        let mut form = into_object(form, "exception")?;
        let type_name = take_string(&mut form, "type", "exception")?;
        let module = take_string(&mut form, "module", "exception")?;
        let args = decode_items(take_array(&mut form, "args", "exception")?, codec)?;
        if !codec.registry().knows_exception(&module, &type_name) {
            debug!(
                exception = format!("{module}.{type_name}"),
                "error type not registered, keeping best-effort form"
            );
        }
        Ok(Value::Exception(ExceptionValue::new(&module, &type_name, args)))
    }
}

/// Self-describing objects as `{type, module, serialized}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectExtension;

impl ValueExtension for ObjectExtension {
    fn tag(&self) -> &str {
        "object"
    }

    fn can_serialize(&self, value: &Value) -> bool {
        matches!(value, Value::Object(_))
    }

    fn serialize_value(&self, value: &Value, codec: &JsonSerializer) -> Result<Json> {
        let Value::Object(object) = value else {
            return Err(BandsawError::Serialization(format!(
                "object extension cannot encode {}",
                value.kind()
            )));
        };
        let mut form = Map::new();
        form.insert("type".into(), Json::String(object.type_name.clone()));
        form.insert("module".into(), Json::String(object.module.clone()));
        form.insert("serialized".into(), codec.to_json(&object.serialized)?);
        Ok(Json::Object(form))
    }

    fn deserialize_value(&self, form: Json, codec: &JsonSerializer) -> Result<Value> {
        let mut form = into_object(form, "object")?;
        let type_name = take_string(&mut form, "type", "object")?;
        let module = take_string(&mut form, "module", "object")?;
        let serialized = codec.from_json(take(&mut form, "serialized", "object")?)?;
        let object = ObjectValue {
            type_name,
            module,
            serialized: Box::new(serialized),
        };
        codec.registry().check_object(&object)?;
        Ok(Value::Object(object))
    }
}
