//! Traversal state machine of an advice chain.
//!
//! The moderator decides which hook runs next: every `before` in chain
//! order, then the task, then every `after` in reverse order. Skipping ahead
//! before the task ran jumps straight to the `after` hooks of the advices
//! already entered, in reverse.

use std::collections::BTreeMap;

use crate::advice::{Advice, AdviceChain};
use crate::models::value::SerializableValue;
use crate::models::Value;
use crate::{BandsawError, Result};

/// Position of a moderator within its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// `before` hooks of advices `0..i` ran; advice `i` is next.
    RunningBefore(usize),
    /// All `before` hooks ran; the task is next.
    RunningTask,
    /// The task ran or was skipped; `after` hooks of advices `0..pending`
    /// are still due, highest index first.
    RunningAfter(usize),
    /// Every hook ran.
    Finished,
}

/// The step a call to [`Moderator::next`] asks the session to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Run `before` of the advice at this index.
    Before(usize),
    /// Execute the task.
    Task,
    /// Run `after` of the advice at this index.
    After(usize),
    /// Nothing left to run; the moderator is now finished.
    Finish,
}

/// Progress counters, the serialized form of a moderator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeratorState {
    /// Number of advices whose `before` ran or was skipped.
    pub before_called: usize,
    /// Number of advices whose `after` ran.
    pub after_called: usize,
    /// Whether the task ran or was skipped.
    pub task_called: bool,
    /// Whether every hook ran.
    pub is_finished: bool,
    /// Length of the chain the counters refer to.
    pub advice_count: usize,
}

fn counter(value: &mut Value, key: &str) -> Result<usize> {
    match value.take_field(key)? {
        Value::Int(count) => usize::try_from(count).map_err(|_| {
            BandsawError::Serialization(format!("moderator counter '{key}' is negative"))
        }),
        other => Err(BandsawError::Serialization(format!(
            "moderator counter '{key}' must be an int, found {}",
            other.kind()
        ))),
    }
}

fn flag(value: &mut Value, key: &str) -> Result<bool> {
    match value.take_field(key)? {
        Value::Bool(flag) => Ok(flag),
        other => Err(BandsawError::Serialization(format!(
            "moderator flag '{key}' must be a bool, found {}",
            other.kind()
        ))),
    }
}

fn int(count: usize) -> Value {
    Value::Int(i64::try_from(count).unwrap_or(i64::MAX))
}

impl SerializableValue for ModeratorState {
    const TYPE_NAME: &'static str = "Moderator";
    const MODULE: &'static str = "bandsaw.session";

    fn serialized(&self) -> Value {
        let mut fields = BTreeMap::new();
        fields.insert("before_called".to_owned(), int(self.before_called));
        fields.insert("after_called".to_owned(), int(self.after_called));
        fields.insert("task_called".to_owned(), Value::Bool(self.task_called));
        fields.insert("is_finished".to_owned(), Value::Bool(self.is_finished));
        fields.insert("advice_count".to_owned(), int(self.advice_count));
        Value::Map(fields)
    }

    fn deserialize(mut value: Value) -> Result<Self> {
        Ok(Self {
            before_called: counter(&mut value, "before_called")?,
            after_called: counter(&mut value, "after_called")?,
            task_called: flag(&mut value, "task_called")?,
            is_finished: flag(&mut value, "is_finished")?,
            advice_count: counter(&mut value, "advice_count")?,
        })
    }
}

/// Tracks which hooks of a chain already ran.
#[derive(Debug, Clone)]
pub struct Moderator {
    chain: AdviceChain,
    stage: Stage,
}

impl Moderator {
    /// Start a fresh traversal of `chain`.
    #[must_use]
    pub fn new(chain: AdviceChain) -> Self {
        let stage = if chain.is_empty() {
            Stage::RunningTask
        } else {
            Stage::RunningBefore(0)
        };
        Self { chain, stage }
    }

    /// Rebuild a moderator from saved counters, re-bound to `chain`.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::IllegalState` if the counters do not describe
    /// a reachable position in `chain`.
    pub fn from_state(state: ModeratorState, chain: AdviceChain) -> Result<Self> {
        let count = chain.len();
        let invalid = |reason: &str| {
            Err(BandsawError::IllegalState(format!(
                "moderator state {state:?} does not fit chain of {count} advices: {reason}"
            )))
        };
        if state.advice_count != count {
            return invalid("chain length changed");
        }
        if state.before_called > count || state.after_called > count {
            return invalid("counter out of range");
        }
        let stage = if state.is_finished {
            if !state.task_called || state.after_called != count {
                return invalid("finished before all hooks ran");
            }
            Stage::Finished
        } else if state.task_called {
            if state.before_called != count {
                return invalid("task ran before all before hooks");
            }
            Stage::RunningAfter(count - state.after_called)
        } else if state.after_called != 0 {
            return invalid("after hooks ran before the task");
        } else if state.before_called == count {
            Stage::RunningTask
        } else {
            Stage::RunningBefore(state.before_called)
        };
        Ok(Self { chain, stage })
    }

    /// Current counters.
    #[must_use]
    pub fn state(&self) -> ModeratorState {
        let count = self.chain.len();
        let (before_called, after_called, task_called, is_finished) = match self.stage {
            Stage::RunningBefore(next) => (next, 0, false, false),
            Stage::RunningTask => (count, 0, false, false),
            Stage::RunningAfter(pending) => (count, count - pending, true, false),
            Stage::Finished => (count, count, true, true),
        };
        ModeratorState {
            before_called,
            after_called,
            task_called,
            is_finished,
            advice_count: count,
        }
    }

    /// Current stage.
    #[must_use]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// The chain being traversed.
    #[must_use]
    pub fn chain(&self) -> &AdviceChain {
        &self.chain
    }

    /// Whether every hook ran.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.stage == Stage::Finished
    }

    /// Advance and return the step to perform.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::IllegalState` once finished; the state is not
    /// changed in that case.
    pub fn next(&mut self) -> Result<Phase> {
        let count = self.chain.len();
        let (stage, phase) = match self.stage {
            Stage::RunningBefore(index) if index + 1 < count => {
                (Stage::RunningBefore(index + 1), Phase::Before(index))
            }
            Stage::RunningBefore(index) => (Stage::RunningTask, Phase::Before(index)),
            Stage::RunningTask => (Stage::RunningAfter(count), Phase::Task),
            Stage::RunningAfter(0) => (Stage::Finished, Phase::Finish),
            Stage::RunningAfter(pending) => {
                (Stage::RunningAfter(pending - 1), Phase::After(pending - 1))
            }
            Stage::Finished => {
                return Err(BandsawError::IllegalState(
                    "session already finished advising".into(),
                ))
            }
        };
        self.stage = stage;
        Ok(phase)
    }

    /// Jump to the `after` hooks of the advices already entered.
    ///
    /// Before the task ran this skips the task and every advice whose
    /// `before` has not run yet. Afterwards it leaves the position unchanged.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::IllegalState` once finished.
    pub fn skip(&mut self) -> Result<()> {
        self.stage = match self.stage {
            Stage::RunningBefore(entered) => Stage::RunningAfter(entered),
            Stage::RunningTask => Stage::RunningAfter(self.chain.len()),
            Stage::RunningAfter(pending) => Stage::RunningAfter(pending),
            Stage::Finished => {
                return Err(BandsawError::IllegalState(
                    "cannot skip, session already finished advising".into(),
                ))
            }
        };
        Ok(())
    }

    /// Index of the advice currently holding control, if any.
    #[must_use]
    pub fn current_index(&self) -> Option<usize> {
        let count = self.chain.len();
        match self.stage {
            Stage::RunningBefore(next) => next.checked_sub(1),
            Stage::RunningTask => count.checked_sub(1),
            Stage::RunningAfter(pending) if pending < count => Some(pending),
            Stage::RunningAfter(_) | Stage::Finished => None,
        }
    }

    /// The advice currently holding control, if any.
    #[must_use]
    pub fn current_advice(&self) -> Option<&dyn Advice> {
        self.current_index()
            .and_then(|index| self.chain.get(index))
            .map(|advice| &**advice)
    }
}
