//! Configuration shipped with the `bandsaw` binary.
//!
//! Tasks:
//! - `echo` returns its single argument, or all arguments as a list.
//! - `fail` fails with `TaskFailed` carrying its first argument.
//! - `pid` returns the id of the process that ran it.
//! - `executable` returns the path of the executable that ran it.
//! - `modules` lists the distribution modules visible to it, or returns
//!   null outside a worker.
//!
//! Chains:
//! - `default` runs the task unadvised.
//! - `traced` wraps the task in two [`Trace`] advices.
//! - `subprocess` runs the task in a child process between two traces.
//! - `ssh` runs the task on the `remotes` of the settings between two
//!   traces.

use std::sync::Arc;

use tracing::debug;

use crate::advice::{Advice, Instruction};
use crate::advices::{SshAdvice, SubprocessAdvice};
use crate::config::{Configuration, Registry, Settings};
use crate::distribution::MODULE_PATH_ENV;
use crate::models::{ExceptionValue, Value};
use crate::session::Session;
use crate::task::FnTask;
use crate::Result;

/// Name of the built-in configuration.
pub const NAME: &str = "bandsaw.builtin";

/// Environment variable naming a settings file for the built-in
/// configuration.
pub const SETTINGS_ENV: &str = "BANDSAW_SETTINGS";

/// Context key the [`Trace`] advice appends to.
pub const TRACE_KEY: &str = "trace";

/// Records `<label>.before` and `<label>.after` in the session context.
#[derive(Debug, Clone)]
pub struct Trace {
    label: String,
}

impl Trace {
    /// Create a trace advice.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl Advice for Trace {
    fn name(&self) -> &str {
        &self.label
    }

    fn before(&self, session: &mut Session) -> Result<Instruction> {
        debug!(label = %self.label, "trace before");
        session
            .context_mut()
            .push(TRACE_KEY, format!("{}.before", self.label))?;
        Ok(Instruction::Proceed)
    }

    fn after(&self, session: &mut Session) -> Result<Instruction> {
        debug!(label = %self.label, "trace after");
        session
            .context_mut()
            .push(TRACE_KEY, format!("{}.after", self.label))?;
        Ok(Instruction::Proceed)
    }
}

fn list_modules() -> std::result::Result<Value, ExceptionValue> {
    let Some(dir) = std::env::var_os(MODULE_PATH_ENV) else {
        return Ok(Value::Null);
    };
    let entries = std::fs::read_dir(&dir).map_err(|err| ExceptionValue::from_error(&err))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| ExceptionValue::from_error(&err))?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(Value::List(names.into_iter().map(Value::Str).collect()))
}

/// Build the built-in configuration.
///
/// # Errors
///
/// Returns `BandsawError::Config` if `settings` name modules that do not
/// exist, or `BandsawError::Io` if the temp root cannot be created.
pub fn configuration(settings: &Settings) -> Result<Configuration> {
    let ssh = settings
        .remotes
        .iter()
        .fold(SshAdvice::new(), |advice, (name, remote)| {
            advice.with_remote(name.clone(), remote.clone())
        });
    let mut configuration = Configuration::with_settings(NAME, settings)?;
    configuration
        .add_task(FnTask::new("echo", |execution| match execution.args() {
            [single] => Ok(single.clone()),
            args => Ok(Value::List(args.to_vec())),
        }))
        .add_task(FnTask::new("fail", |execution| {
            let message = execution
                .arg(0)
                .cloned()
                .unwrap_or_else(|| Value::from("task failed"));
            Err(ExceptionValue::new(NAME, "TaskFailed", vec![message]))
        }))
        .add_task(FnTask::new("pid", |_| {
            Ok(Value::Int(i64::from(std::process::id())))
        }))
        .add_task(FnTask::new("executable", |_| {
            let path = std::env::current_exe().map_err(|err| ExceptionValue::from_error(&err))?;
            Ok(Value::Str(path.display().to_string()))
        }))
        .add_task(FnTask::new("modules", |_| list_modules()))
        .add_advice_chain(
            "traced",
            vec![
                Arc::new(Trace::new("outer")) as Arc<dyn Advice>,
                Arc::new(Trace::new("inner")),
            ],
        )
        .add_advice_chain(
            "subprocess",
            vec![
                Arc::new(Trace::new("parent")) as Arc<dyn Advice>,
                Arc::new(SubprocessAdvice::new()),
                Arc::new(Trace::new("child")),
            ],
        )
        .add_advice_chain(
            "ssh",
            vec![
                Arc::new(Trace::new("parent")) as Arc<dyn Advice>,
                Arc::new(ssh),
                Arc::new(Trace::new("child")),
            ],
        )
        .register_types(|types| {
            types.register_exception(NAME, "TaskFailed");
        });
    Ok(configuration)
}

/// Registry holding the built-in configuration.
///
/// Settings are read from the file named by [`SETTINGS_ENV`] when set.
#[must_use]
pub fn registry() -> Registry {
    let mut registry = Registry::new();
    registry.register(NAME, || {
        let settings = match std::env::var_os(SETTINGS_ENV) {
            Some(path) => Settings::load_from_path(path)?,
            None => Settings::default(),
        };
        configuration(&settings)
    });
    registry
}
