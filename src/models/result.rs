//! Outcome of a task execution.

use std::collections::BTreeMap;

use crate::models::value::{ExceptionValue, SerializableValue, Value};
use crate::{BandsawError, Result};

/// Either the value a task returned or the error it raised.
///
/// Any advice may replace the result wholesale; advices only ever see the
/// raw result, the call site decides whether to raise via
/// [`TaskResult::into_result`].
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
    /// The task returned a value.
    Value(Value),
    /// The task failed.
    Exception(ExceptionValue),
}

impl TaskResult {
    /// Result holding a value.
    #[must_use]
    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }

    /// Result holding an error.
    #[must_use]
    pub fn exception(exception: ExceptionValue) -> Self {
        Self::Exception(exception)
    }

    /// Whether the task failed.
    #[must_use]
    pub fn is_exception(&self) -> bool {
        matches!(self, Self::Exception(_))
    }

    /// Borrow the returned value, if any.
    #[must_use]
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::Exception(_) => None,
        }
    }

    /// Borrow the error, if any.
    #[must_use]
    pub fn as_exception(&self) -> Option<&ExceptionValue> {
        match self {
            Self::Exception(exception) => Some(exception),
            Self::Value(_) => None,
        }
    }

    /// Call-site view: the value, or the error raised again.
    ///
    /// # Errors
    ///
    /// Returns the captured [`ExceptionValue`] if the task failed.
    pub fn into_result(self) -> std::result::Result<Value, ExceptionValue> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Exception(exception) => Err(exception),
        }
    }
}

impl From<std::result::Result<Value, ExceptionValue>> for TaskResult {
    fn from(outcome: std::result::Result<Value, ExceptionValue>) -> Self {
        match outcome {
            Ok(value) => Self::Value(value),
            Err(exception) => Self::Exception(exception),
        }
    }
}

impl SerializableValue for TaskResult {
    const TYPE_NAME: &'static str = "Result";
    const MODULE: &'static str = "bandsaw.result";

    fn serialized(&self) -> Value {
        let mut fields = BTreeMap::new();
        match self {
            Self::Value(value) => {
                fields.insert("value".to_owned(), value.clone());
            }
            Self::Exception(exception) => {
                fields.insert(
                    "exception".to_owned(),
                    Value::Exception(exception.clone()),
                );
            }
        }
        Value::Map(fields)
    }

    fn deserialize(mut value: Value) -> Result<Self> {
        if value.get("exception").is_some() {
            return match value.take_field("exception")? {
                Value::Exception(exception) => Ok(Self::Exception(exception)),
                other => Err(BandsawError::Serialization(format!(
                    "result exception must be an exception, found {}",
                    other.kind()
                ))),
            };
        }
        Ok(Self::Value(value.take_field("value")?))
    }
}
