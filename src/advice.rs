//! Interceptors applied around a task execution.

use std::fmt;
use std::sync::Arc;

use crate::models::TaskResult;
use crate::session::Session;
use crate::Result;

/// Ordered advices applied to an execution.
pub type AdviceChain = Arc<[Arc<dyn Advice>]>;

/// What the session should do after an advice hook returns.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Continue with the next advice or the task.
    Proceed,
    /// Replace the result and skip ahead.
    ///
    /// Before the task ran, the task and every later advice are skipped and
    /// the `after` hooks of the advices already entered run in reverse.
    /// After the task ran, only the result is replaced.
    Conclude(TaskResult),
    /// Skip ahead like [`Instruction::Conclude`] but keep the current result.
    Skip,
    /// Stop driving the session here; it continues elsewhere.
    ///
    /// Only valid while a session is resumed out of process. Returned while
    /// [`Session::initiate`] drives the chain, it fails as a misbehaving
    /// advice.
    Suspend,
}

/// Interceptor with hooks before and after the task runs.
///
/// `before` hooks run in chain order, `after` hooks in reverse order.
pub trait Advice: Send + Sync + fmt::Debug {
    /// Name used in logs and error messages.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Called before the task executes.
    ///
    /// # Errors
    ///
    /// Any error aborts the session and is returned to the caller.
    fn before(&self, _session: &mut Session) -> Result<Instruction> {
        Ok(Instruction::Proceed)
    }

    /// Called after the task executed or was skipped.
    ///
    /// # Errors
    ///
    /// Any error aborts the session and is returned to the caller.
    fn after(&self, _session: &mut Session) -> Result<Instruction> {
        Ok(Instruction::Proceed)
    }
}

/// Hooks around the whole advising of a session.
pub trait Extension: Send + Sync + fmt::Debug {
    /// Called before the first advice runs.
    ///
    /// # Errors
    ///
    /// Any error aborts the session before advising starts.
    fn on_session_created(&self, _session: &mut Session) -> Result<()> {
        Ok(())
    }

    /// Called after all advices ran.
    ///
    /// # Errors
    ///
    /// Any error is returned instead of the session result.
    fn on_session_finished(&self, _session: &mut Session) -> Result<()> {
        Ok(())
    }
}
