//! Identity of a session.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;

use crate::BandsawError;

/// The task, execution and run ids that together identify a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ids {
    /// Id of the advised task.
    pub task_id: String,
    /// Id of the execution of the task.
    pub execution_id: String,
    /// Id of the current run.
    pub run_id: String,
}

impl Ids {
    /// Combine the three ids.
    #[must_use]
    pub fn new(
        task_id: impl Into<String>,
        execution_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            execution_id: execution_id.into(),
            run_id: run_id.into(),
        }
    }

    /// The session id, the three ids joined by `_`.
    #[must_use]
    pub fn session_id(&self) -> String {
        format!("{}_{}_{}", self.task_id, self.execution_id, self.run_id)
    }

    /// Relative path `task/execution/run` derived from the ids.
    #[must_use]
    pub fn as_path(&self) -> PathBuf {
        PathBuf::from(&self.task_id)
            .join(&self.execution_id)
            .join(&self.run_id)
    }
}

impl Display for Ids {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.session_id())
    }
}

impl FromStr for Ids {
    type Err = BandsawError;

    /// Parse a session id, splitting from the right so the task id keeps any
    /// underscores. Ids with `_` in the execution or run part cannot be told
    /// apart from the joined form; saved sessions store the parts instead.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut parts = value.rsplitn(3, '_');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(run_id), Some(execution_id), Some(task_id))
                if !run_id.is_empty() && !execution_id.is_empty() && !task_id.is_empty() =>
            {
                Ok(Self::new(task_id, execution_id, run_id))
            }
            _ => Err(BandsawError::Serialization(format!(
                "invalid session id '{value}'"
            ))),
        }
    }
}
