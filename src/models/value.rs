//! Dynamic value model carried through sessions and serializers.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::{BandsawError, Result};

/// A dynamically typed value that every serializer can round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    /// Absence of a value.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Ordered list.
    List(Vec<Value>),
    /// String-keyed mapping with sorted keys.
    Map(BTreeMap<String, Value>),
    /// Plain or named tuple.
    Tuple(Tuple),
    /// Captured error.
    Exception(ExceptionValue),
    /// Self-describing user value.
    Object(ObjectValue),
}

impl Value {
    /// Short name of the variant, used in error messages.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Tuple(_) => "tuple",
            Self::Exception(_) => "exception",
            Self::Object(_) => "object",
        }
    }

    /// Borrow the string content, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value),
            _ => None,
        }
    }

    /// Integer content, if this is an integer.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Boolean content, if this is a boolean.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Borrow the list items, if this is a list.
    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Borrow the mapping, if this is a map.
    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Look up `key` in a map value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|map| map.get(key))
    }

    /// Remove and return `key` from a map value, failing when it is absent.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Serialization` if the value is not a map or the
    /// key is missing.
    pub fn take_field(&mut self, key: &str) -> Result<Value> {
        match self {
            Self::Map(map) => map.remove(key).ok_or_else(|| {
                BandsawError::Serialization(format!("missing field '{key}'"))
            }),
            other => Err(BandsawError::Serialization(format!(
                "expected map with field '{key}', found {}",
                other.kind()
            ))),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self::Map(map)
    }
}

impl From<Tuple> for Value {
    fn from(tuple: Tuple) -> Self {
        Self::Tuple(tuple)
    }
}

impl From<ExceptionValue> for Value {
    fn from(exception: ExceptionValue) -> Self {
        Self::Exception(exception)
    }
}

impl From<ObjectValue> for Value {
    fn from(object: ObjectValue) -> Self {
        Self::Object(object)
    }
}

/// Join a module path and a type name into a qualified name.
#[must_use]
pub fn qualified_name(module: &str, type_name: &str) -> String {
    format!("{module}.{type_name}")
}

/// Type information of a named tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NamedTupleType {
    /// Type name.
    pub name: String,
    /// Module the type is defined in.
    pub module: String,
    /// Field names in positional order.
    pub fields: Vec<String>,
    /// Set when the decoder had no registered type and rebuilt an equivalent.
    #[serde(default)]
    pub synthesized: bool,
}

impl NamedTupleType {
    /// Describe a named tuple type.
    #[must_use]
    pub fn new(module: &str, name: &str, fields: &[&str]) -> Self {
        Self {
            name: name.to_owned(),
            module: module.to_owned(),
            fields: fields.iter().map(|field| (*field).to_owned()).collect(),
            synthesized: false,
        }
    }

    /// `module.name` of this type.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        qualified_name(&self.module, &self.name)
    }
}

/// A plain tuple, or a named tuple when `kind` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Tuple {
    /// Named-tuple type, `None` for plain tuples.
    pub kind: Option<NamedTupleType>,
    /// Positional items.
    pub items: Vec<Value>,
}

impl Tuple {
    /// Build a plain tuple.
    #[must_use]
    pub fn plain(items: Vec<Value>) -> Self {
        Self { kind: None, items }
    }

    /// Build a named tuple, checking that every field gets exactly one item.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Serialization` when the item count does not
    /// match the field count.
    pub fn named(kind: NamedTupleType, items: Vec<Value>) -> Result<Self> {
        if kind.fields.len() != items.len() {
            return Err(BandsawError::Serialization(format!(
                "named tuple {} has {} fields but {} items",
                kind.qualified_name(),
                kind.fields.len(),
                items.len()
            )));
        }
        Ok(Self {
            kind: Some(kind),
            items,
        })
    }

    /// Look up an item of a named tuple by field name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        let kind = self.kind.as_ref()?;
        let index = kind.fields.iter().position(|field| field == name)?;
        self.items.get(index)
    }
}

/// A captured error: its type, module and arguments.
///
/// Backtraces and other attributes are not kept, so reconstruction is
/// best-effort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ExceptionValue {
    /// Error type name.
    pub type_name: String,
    /// Module path of the error type.
    pub module: String,
    /// Arguments the error was created with.
    pub args: Vec<Value>,
}

impl ExceptionValue {
    /// Describe an error by module, type name and arguments.
    #[must_use]
    pub fn new(module: &str, type_name: &str, args: Vec<Value>) -> Self {
        Self {
            type_name: type_name.to_owned(),
            module: module.to_owned(),
            args,
        }
    }

    /// Capture a Rust error, using its type path and display message.
    #[must_use]
    pub fn from_error<E: std::error::Error + 'static>(err: &E) -> Self {
        let full = std::any::type_name::<E>();
        let path = full.split('<').next().unwrap_or(full);
        let (module, type_name) = path.rsplit_once("::").unwrap_or(("", path));
        Self::new(module, type_name, vec![Value::Str(err.to_string())])
    }

    /// `module.type` of the error.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        qualified_name(&self.module, &self.type_name)
    }
}

impl Display for ExceptionValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.type_name)?;
        let messages: Vec<String> = self
            .args
            .iter()
            .map(|arg| match arg {
                Value::Str(text) => text.clone(),
                other => format!("{other:?}"),
            })
            .collect();
        if !messages.is_empty() {
            write!(f, ": {}", messages.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for ExceptionValue {}

/// A user value stored by its type name and self-produced serialized form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ObjectValue {
    /// Type name.
    pub type_name: String,
    /// Module of the type.
    pub module: String,
    /// Form returned by [`SerializableValue::serialized`].
    pub serialized: Box<Value>,
}

impl ObjectValue {
    /// Wrap a typed value.
    #[must_use]
    pub fn from_typed<T: SerializableValue>(value: &T) -> Self {
        Self {
            type_name: T::TYPE_NAME.to_owned(),
            module: T::MODULE.to_owned(),
            serialized: Box::new(value.serialized()),
        }
    }

    /// Reconstruct the typed value.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Serialization` if the object holds a different
    /// type, or whatever `T::deserialize` fails with.
    pub fn to_typed<T: SerializableValue>(&self) -> Result<T> {
        if self.type_name != T::TYPE_NAME || self.module != T::MODULE {
            return Err(BandsawError::Serialization(format!(
                "expected object {}, found {}",
                qualified_name(T::MODULE, T::TYPE_NAME),
                self.qualified_name()
            )));
        }
        T::deserialize((*self.serialized).clone())
    }

    /// `module.type` of the object.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        qualified_name(&self.module, &self.type_name)
    }
}

/// A type that describes itself as a [`Value`] and can be rebuilt from it.
pub trait SerializableValue: Sized {
    /// Type name recorded in the serialized object.
    const TYPE_NAME: &'static str;
    /// Module recorded in the serialized object.
    const MODULE: &'static str;

    /// Produce the serialized form of `self`.
    fn serialized(&self) -> Value;

    /// Rebuild a value from its serialized form.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Serialization` if `value` is malformed.
    fn deserialize(value: Value) -> Result<Self>;
}

/// Unwrap a value that must be an object of type `T`.
///
/// # Errors
///
/// Returns `BandsawError::Serialization` if `value` is not an object of `T`.
pub fn expect_object<T: SerializableValue>(value: &Value) -> Result<T> {
    match value {
        Value::Object(object) => object.to_typed(),
        other => Err(BandsawError::Serialization(format!(
            "expected object {}, found {}",
            qualified_name(T::MODULE, T::TYPE_NAME),
            other.kind()
        ))),
    }
}
