//! Units of work that can be advised.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::models::value::SerializableValue;
use crate::models::{ExceptionValue, Execution, TaskResult, Value};
use crate::{BandsawError, Result};

/// An opaque unit of work, reused across many executions.
///
/// Tasks are registered on a [`Configuration`](crate::config::Configuration)
/// and referenced by id inside saved sessions, so a resumed session finds the
/// same task in the resuming process.
pub trait Task: Send + Sync + fmt::Debug {
    /// Stable id of the task.
    fn task_id(&self) -> &str;

    /// Run the task for one execution. Failures are returned as
    /// [`TaskResult::Exception`], never raised.
    fn execute(&self, execution: &Execution) -> TaskResult;

    /// Per-task settings for the advice `advice`, e.g. `"ssh"`.
    fn advice_parameters(&self, _advice: &str) -> Option<&Value> {
        None
    }
}

type TaskFn = dyn Fn(&Execution) -> std::result::Result<Value, ExceptionValue> + Send + Sync;

/// A task backed by a closure.
#[derive(Clone)]
pub struct FnTask {
    task_id: String,
    body: Arc<TaskFn>,
    advice_parameters: BTreeMap<String, Value>,
}

impl FnTask {
    /// Wrap `body` as the task `task_id`.
    pub fn new<F>(task_id: impl Into<String>, body: F) -> Self
    where
        F: Fn(&Execution) -> std::result::Result<Value, ExceptionValue> + Send + Sync + 'static,
    {
        Self {
            task_id: task_id.into(),
            body: Arc::new(body),
            advice_parameters: BTreeMap::new(),
        }
    }

    /// Attach settings read by the advice `advice` when it advises this task.
    #[must_use]
    pub fn with_advice_parameters(mut self, advice: impl Into<String>, parameters: Value) -> Self {
        self.advice_parameters.insert(advice.into(), parameters);
        self
    }
}

impl fmt::Debug for FnTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTask")
            .field("task_id", &self.task_id)
            .field("advice_parameters", &self.advice_parameters)
            .finish_non_exhaustive()
    }
}

impl Task for FnTask {
    fn task_id(&self) -> &str {
        &self.task_id
    }

    fn execute(&self, execution: &Execution) -> TaskResult {
        (self.body)(execution).into()
    }

    fn advice_parameters(&self, advice: &str) -> Option<&Value> {
        self.advice_parameters.get(advice)
    }
}

/// Serialized reference to a registered task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRef {
    /// Id of the referenced task.
    pub task_id: String,
}

impl SerializableValue for TaskRef {
    const TYPE_NAME: &'static str = "Task";
    const MODULE: &'static str = "bandsaw.tasks";

    fn serialized(&self) -> Value {
        let mut fields = BTreeMap::new();
        fields.insert("task_id".to_owned(), Value::Str(self.task_id.clone()));
        Value::Map(fields)
    }

    fn deserialize(mut value: Value) -> Result<Self> {
        match value.take_field("task_id")? {
            Value::Str(task_id) => Ok(Self { task_id }),
            other => Err(BandsawError::Serialization(format!(
                "task_id must be a string, found {}",
                other.kind()
            ))),
        }
    }
}
