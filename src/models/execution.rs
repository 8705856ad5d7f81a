//! One concrete invocation of a task.

use std::collections::BTreeMap;

use crate::identifier::identifier_from_bytes;
use crate::models::value::{SerializableValue, Value};
use crate::serialization::json::JsonSerializer;
use crate::{BandsawError, Result};

/// The arguments of one task invocation and the id derived from them.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    execution_id: String,
    args: Vec<Value>,
    kwargs: BTreeMap<String, Value>,
}

impl Execution {
    /// Create an execution with an explicit id.
    #[must_use]
    pub fn new(
        execution_id: impl Into<String>,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            args,
            kwargs,
        }
    }

    /// Create an execution whose id is the content hash of its arguments.
    ///
    /// Identical arguments always yield the identical id because the
    /// arguments are hashed in their canonical JSON form.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Serialization` if an argument cannot be
    /// encoded canonically (e.g. a NaN float).
    pub fn derive(args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Result<Self> {
        let mut fields = BTreeMap::new();
        fields.insert("args".to_owned(), Value::List(args.clone()));
        fields.insert("kwargs".to_owned(), Value::Map(kwargs.clone()));
        let bytes = JsonSerializer::default().to_canonical_bytes(&Value::Map(fields))?;
        Ok(Self::new(identifier_from_bytes(&bytes), args, kwargs))
    }

    /// Id of this execution.
    #[must_use]
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Positional arguments.
    #[must_use]
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Keyword arguments.
    #[must_use]
    pub fn kwargs(&self) -> &BTreeMap<String, Value> {
        &self.kwargs
    }

    /// Positional argument at `index`.
    #[must_use]
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// Keyword argument `name`.
    #[must_use]
    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }
}

impl SerializableValue for Execution {
    const TYPE_NAME: &'static str = "Execution";
    const MODULE: &'static str = "bandsaw.execution";

    fn serialized(&self) -> Value {
        let mut fields = BTreeMap::new();
        fields.insert(
            "execution_id".to_owned(),
            Value::Str(self.execution_id.clone()),
        );
        fields.insert("args".to_owned(), Value::List(self.args.clone()));
        fields.insert("kwargs".to_owned(), Value::Map(self.kwargs.clone()));
        Value::Map(fields)
    }

    fn deserialize(mut value: Value) -> Result<Self> {
        let execution_id = match value.take_field("execution_id")? {
            Value::Str(id) => id,
            other => {
                return Err(BandsawError::Serialization(format!(
                    "execution_id must be a string, found {}",
                    other.kind()
                )))
            }
        };
        let args = match value.take_field("args")? {
            Value::List(items) => items,
            other => {
                return Err(BandsawError::Serialization(format!(
                    "execution args must be a list, found {}",
                    other.kind()
                )))
            }
        };
        let kwargs = match value.take_field("kwargs")? {
            Value::Map(map) => map,
            other => {
                return Err(BandsawError::Serialization(format!(
                    "execution kwargs must be a map, found {}",
                    other.kind()
                )))
            }
        };
        Ok(Self::new(execution_id, args, kwargs))
    }
}
