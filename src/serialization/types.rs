//! Registry of the types a decoder is allowed to rebuild.
//!
//! Decoders never guess types from names. Errors, named tuples and
//! self-describing objects are registered by qualified name up front, and
//! decoded values are checked against this registry.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::models::value::{qualified_name, SerializableValue};
use crate::models::{Context, Execution, NamedTupleType, ObjectValue, TaskResult, Tuple, Value};
use crate::moderator::ModeratorState;
use crate::task::TaskRef;
use crate::{BandsawError, Result};

type ObjectCheck = Arc<dyn Fn(&Value) -> Result<()> + Send + Sync>;

/// Known errors, named tuples and object types, keyed by `module.Type`.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    exceptions: BTreeSet<String>,
    named_tuples: BTreeMap<String, NamedTupleType>,
    objects: BTreeMap<String, ObjectCheck>,
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("exceptions", &self.exceptions)
            .field("named_tuples", &self.named_tuples.keys().collect::<Vec<_>>())
            .field("objects", &self.objects.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TypeRegistry {
    /// Registry that knows the crate's own session types.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register_object::<TaskRef>();
        registry.register_object::<Execution>();
        registry.register_object::<Context>();
        registry.register_object::<TaskResult>();
        registry.register_object::<ModeratorState>();
        registry.register_error::<BandsawError>();
        registry
    }

    /// Registry without any registered type.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Register an error type by module and name.
    pub fn register_exception(&mut self, module: &str, type_name: &str) -> &mut Self {
        self.exceptions.insert(qualified_name(module, type_name));
        self
    }

    /// Register a Rust error type under the name [`ExceptionValue::from_error`]
    /// records for it.
    ///
    /// [`ExceptionValue::from_error`]: crate::models::ExceptionValue::from_error
    pub fn register_error<E: std::error::Error + 'static>(&mut self) -> &mut Self {
        let full = std::any::type_name::<E>();
        let path = full.split('<').next().unwrap_or(full);
        let (module, type_name) = path.rsplit_once("::").unwrap_or(("", path));
        self.register_exception(module, type_name)
    }

    /// Register a named tuple type.
    pub fn register_named_tuple(&mut self, kind: NamedTupleType) -> &mut Self {
        let kind = NamedTupleType {
            synthesized: false,
            ..kind
        };
        self.named_tuples.insert(kind.qualified_name(), kind);
        self
    }

    /// Register a self-describing object type.
    pub fn register_object<T: SerializableValue + 'static>(&mut self) -> &mut Self {
        let check: ObjectCheck =
            Arc::new(|serialized: &Value| T::deserialize(serialized.clone()).map(|_| ()));
        self.objects
            .insert(qualified_name(T::MODULE, T::TYPE_NAME), check);
        self
    }

    /// Whether the error type `module.type_name` is registered.
    #[must_use]
    pub fn knows_exception(&self, module: &str, type_name: &str) -> bool {
        self.exceptions.contains(&qualified_name(module, type_name))
    }

    /// Bind a decoded named-tuple type to its registered type.
    ///
    /// When no type with the same name and fields is registered an equivalent
    /// type is synthesized, so no data is lost.
    #[must_use]
    pub fn resolve_named_tuple(&self, decoded: NamedTupleType) -> NamedTupleType {
        match self.named_tuples.get(&decoded.qualified_name()) {
            Some(known) if known.fields == decoded.fields => known.clone(),
            _ => {
                debug!(
                    named_tuple = decoded.qualified_name(),
                    "named tuple type not registered, synthesizing"
                );
                NamedTupleType {
                    synthesized: true,
                    ..decoded
                }
            }
        }
    }

    /// Check a decoded object against its registered type.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::UnknownType` if the type is not registered, or
    /// the type's own decoding error if the serialized form is invalid.
    pub fn check_object(&self, object: &ObjectValue) -> Result<()> {
        let name = object.qualified_name();
        let check = self
            .objects
            .get(&name)
            .ok_or_else(|| BandsawError::UnknownType(name.clone()))?;
        check(&object.serialized)
    }

    /// Walk a decoded value, binding named tuples and checking objects.
    ///
    /// # Errors
    ///
    /// Same as [`TypeRegistry::check_object`].
    pub fn resolve_value(&self, value: Value) -> Result<Value> {
        Ok(match value {
            Value::List(items) => Value::List(
                items
                    .into_iter()
                    .map(|item| self.resolve_value(item))
                    .collect::<Result<_>>()?,
            ),
            Value::Map(map) => Value::Map(
                map.into_iter()
                    .map(|(key, item)| Ok((key, self.resolve_value(item)?)))
                    .collect::<Result<_>>()?,
            ),
            Value::Tuple(tuple) => {
                let items = tuple
                    .items
                    .into_iter()
                    .map(|item| self.resolve_value(item))
                    .collect::<Result<Vec<_>>>()?;
                match tuple.kind {
                    Some(kind) => {
                        Value::Tuple(Tuple::named(self.resolve_named_tuple(kind), items)?)
                    }
                    None => Value::Tuple(Tuple::plain(items)),
                }
            }
            Value::Exception(mut exception) => {
                if !self.knows_exception(&exception.module, &exception.type_name) {
                    debug!(
                        exception = exception.qualified_name(),
                        "error type not registered, keeping best-effort form"
                    );
                }
                exception.args = exception
                    .args
                    .into_iter()
                    .map(|arg| self.resolve_value(arg))
                    .collect::<Result<_>>()?;
                Value::Exception(exception)
            }
            Value::Object(mut object) => {
                object.serialized = Box::new(self.resolve_value(*object.serialized)?);
                self.check_object(&object)?;
                Value::Object(object)
            }
            other => other,
        })
    }
}
