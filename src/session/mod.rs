//! Portable state of one advised execution and the loop that drives it.
//!
//! A session owns the execution, the context, the result, the attachments
//! and the moderator tracking chain progress. It can be saved at any point
//! mid-chain and restored in another process, where the configuration and
//! the advice chain are looked up again by name.

mod archive;

use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, info_span, warn};

use crate::advice::Instruction;
use crate::config::{Configuration, Registry, DEFAULT_CHAIN};
use crate::distribution::DistributionArchive;
use crate::models::value::expect_object;
use crate::models::{Attachments, Context, Execution, Ids, ObjectValue, TaskResult, Value};
use crate::moderator::{Moderator, ModeratorState, Phase};
use crate::serialization::Serializer;
use crate::task::{Task, TaskRef};
use crate::{BandsawError, Result};

use archive::{
    ArchiveParts, ArchiveWriter, SessionHeader, CONTEXT_ENTRY, EXECUTION_ENTRY, MODERATOR_ENTRY,
    RESULT_ENTRY, TASK_ENTRY,
};

/// Outcome of driving a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// More steps are due.
    Running,
    /// An advice suspended the session; it continues elsewhere.
    Suspended,
    /// Every hook ran.
    Finished,
}

/// Full portable state of one in-flight or suspended advised execution.
pub struct Session {
    registry: Arc<Registry>,
    configuration: Arc<Configuration>,
    advice_chain: String,
    task: Arc<dyn Task>,
    execution: Execution,
    context: Context,
    result: Option<TaskResult>,
    attachments: Attachments,
    moderator: Option<Moderator>,
    ids: Ids,
    temp_dir: Option<PathBuf>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("configuration", &self.configuration.name())
            .field("advice_chain", &self.advice_chain)
            .field("ids", &self.ids)
            .field("context", &self.context)
            .field("result", &self.result)
            .field("stage", &self.moderator.as_ref().map(Moderator::stage))
            .finish_non_exhaustive()
    }
}

struct Decoded {
    configuration: Arc<Configuration>,
    advice_chain: String,
    task: Arc<dyn Task>,
    execution: Execution,
    context: Context,
    result: Option<TaskResult>,
    attachments: Attachments,
    moderator: Option<Moderator>,
    ids: Ids,
}

impl Session {
    /// Create a session advising `task` for `execution` with the default
    /// chain.
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        configuration: Arc<Configuration>,
        task: Arc<dyn Task>,
        execution: Execution,
    ) -> Self {
        let ids = Ids::new(
            task.task_id(),
            execution.execution_id(),
            registry.run_id(),
        );
        Self {
            registry,
            configuration,
            advice_chain: DEFAULT_CHAIN.to_owned(),
            task,
            execution,
            context: Context::new(),
            result: None,
            attachments: Attachments::new(),
            moderator: None,
            ids,
            temp_dir: None,
        }
    }

    /// Create a session for a task registered on a named configuration.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::UnknownConfiguration` or
    /// `BandsawError::UnknownTask` if either lookup fails.
    pub fn for_task(
        registry: Arc<Registry>,
        configuration: &str,
        task_id: &str,
        execution: Execution,
    ) -> Result<Self> {
        let configuration = registry.load(configuration)?;
        let task = configuration.task(task_id)?;
        Ok(Self::new(registry, configuration, task, execution))
    }

    /// Use the advice chain `name` instead of the default chain.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::UnknownChain` if the configuration has no such
    /// chain, or `BandsawError::IllegalState` once advising started.
    pub fn with_advice_chain(mut self, name: &str) -> Result<Self> {
        if self.moderator.is_some() {
            return Err(BandsawError::IllegalState(
                "advice chain cannot change once advising started".into(),
            ));
        }
        self.configuration.advice_chain(name)?;
        name.clone_into(&mut self.advice_chain);
        Ok(self)
    }

    /// Run the extensions, drive the whole chain and return the result.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::IllegalState` if the session was already
    /// initiated or finished without a result,
    /// `BandsawError::MisbehavingAdvice` if an advice suspends the session,
    /// and any error raised by an advice or extension.
    pub fn initiate(&mut self) -> Result<TaskResult> {
        let span = info_span!("session.initiate", session_id = %self.ids);
        let _guard = span.enter();
        self.start()?;

        if self.resume()? == Progress::Suspended {
            let advice = self
                .moderator
                .as_ref()
                .and_then(Moderator::current_advice)
                .map_or_else(|| "<none>".to_owned(), |advice| advice.name().to_owned());
            warn!(advice = %advice, "advice suspended a session that was not resumed");
            return Err(BandsawError::MisbehavingAdvice(format!(
                "advice {advice} suspended session {} while initiating",
                self.ids
            )));
        }

        let configuration = Arc::clone(&self.configuration);
        for extension in configuration.extensions() {
            extension.on_session_finished(self)?;
        }

        self.result.clone().ok_or_else(|| {
            BandsawError::IllegalState(format!("session {} finished without a result", self.ids))
        })
    }

    /// Run the creation hooks of the extensions and position a fresh
    /// moderator before the first advice, without running any step.
    ///
    /// [`Session::initiate`] calls this itself; use it directly to drive the
    /// chain step by step with [`Session::proceed`].
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::IllegalState` if the session was already
    /// started, and any error raised by an extension.
    pub fn start(&mut self) -> Result<()> {
        if self.moderator.is_some() {
            return Err(BandsawError::IllegalState(format!(
                "session {} already initiated",
                self.ids
            )));
        }
        let configuration = Arc::clone(&self.configuration);
        for extension in configuration.extensions() {
            extension.on_session_created(self)?;
        }
        let chain = configuration.advice_chain(&self.advice_chain)?;
        info!(advice_chain = %self.advice_chain, advices = chain.len(), "advising task");
        self.moderator = Some(Moderator::new(chain));
        Ok(())
    }

    /// Drive the chain until it finishes or an advice suspends it.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::IllegalState` if the session was never
    /// initiated or already finished, and any error raised by an advice.
    pub fn resume(&mut self) -> Result<Progress> {
        let span = info_span!("session.resume", session_id = %self.ids);
        let _guard = span.enter();
        loop {
            match self.proceed()? {
                Progress::Running => {}
                progress => return Ok(progress),
            }
        }
    }

    /// Run exactly one step of the chain.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::IllegalState` if the session was never
    /// initiated or already finished, and any error raised by an advice.
    pub fn proceed(&mut self) -> Result<Progress> {
        let moderator = self.moderator_mut()?;
        let phase = moderator.next()?;
        let chain = Arc::clone(moderator.chain());
        match phase {
            Phase::Before(index) => {
                let advice = Arc::clone(&chain[index]);
                debug!(advice = advice.name(), index, "before");
                let instruction = advice.before(self)?;
                self.apply(instruction)
            }
            Phase::Task => {
                debug!(task_id = self.task.task_id(), "executing task");
                let result = self.task.execute(&self.execution);
                if let TaskResult::Exception(exception) = &result {
                    info!(error = %exception, "task failed");
                }
                self.result = Some(result);
                Ok(Progress::Running)
            }
            Phase::After(index) => {
                let advice = Arc::clone(&chain[index]);
                debug!(advice = advice.name(), index, "after");
                let instruction = advice.after(self)?;
                self.apply(instruction)
            }
            Phase::Finish => {
                debug!(session_id = %self.ids, "advising finished");
                Ok(Progress::Finished)
            }
        }
    }

    /// Replace the result and skip to the `after` hooks of the advices
    /// already entered.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::IllegalState` if the session was never
    /// initiated or already finished.
    pub fn conclude(&mut self, result: TaskResult) -> Result<()> {
        self.moderator_mut()?.skip()?;
        self.result = Some(result);
        Ok(())
    }

    fn apply(&mut self, instruction: Instruction) -> Result<Progress> {
        match instruction {
            Instruction::Proceed => Ok(Progress::Running),
            Instruction::Conclude(result) => {
                self.conclude(result)?;
                Ok(Progress::Running)
            }
            Instruction::Skip => {
                self.moderator_mut()?.skip()?;
                Ok(Progress::Running)
            }
            Instruction::Suspend => Ok(Progress::Suspended),
        }
    }

    fn moderator_mut(&mut self) -> Result<&mut Moderator> {
        let ids = &self.ids;
        self.moderator.as_mut().ok_or_else(|| {
            BandsawError::IllegalState(format!("session {ids} was not initiated"))
        })
    }

    /// Write the whole session as a tar archive.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Serialization` if a part cannot be encoded, or
    /// `BandsawError::Io` if writing fails.
    pub fn save(&self, writer: impl Write) -> Result<()> {
        let serializer = self.serializer();
        let encode = |value: Value| serializer.to_bytes(&value);

        let mut archive = ArchiveWriter::new(writer);
        archive.header(&SessionHeader {
            configuration: self.configuration.name().to_owned(),
            advice_chain: self.advice_chain.clone(),
            ids: self.ids.session_id(),
            run_id: self.ids.run_id.clone(),
        })?;
        let task = TaskRef {
            task_id: self.task.task_id().to_owned(),
        };
        archive.entry(TASK_ENTRY, &encode(ObjectValue::from_typed(&task).into())?)?;
        archive.entry(
            EXECUTION_ENTRY,
            &encode(ObjectValue::from_typed(&self.execution).into())?,
        )?;
        archive.entry(
            CONTEXT_ENTRY,
            &encode(ObjectValue::from_typed(&self.context).into())?,
        )?;
        let result = self
            .result
            .as_ref()
            .map_or(Value::Null, |result| ObjectValue::from_typed(result).into());
        archive.entry(RESULT_ENTRY, &encode(result)?)?;
        let moderator = self.moderator.as_ref().map_or(Value::Null, |moderator| {
            ObjectValue::from_typed(&moderator.state()).into()
        });
        archive.entry(MODERATOR_ENTRY, &encode(moderator)?)?;
        archive.attachments(&self.attachments)?;
        archive.finish()?;
        debug!(session_id = %self.ids, serializer = serializer.name(), "session saved");
        Ok(())
    }

    /// Replace this session's state with a saved one.
    ///
    /// The configuration is looked up again by name and the moderator is
    /// re-bound to the named chain. Nothing changes if decoding fails.
    ///
    /// # Errors
    ///
    /// Returns lookup errors for the configuration, chain or task,
    /// `BandsawError::Serialization` for malformed archives, and
    /// `BandsawError::IllegalState` for progress counters that do not fit
    /// the chain.
    pub fn restore(&mut self, reader: impl Read) -> Result<()> {
        let decoded = Self::decode(&self.registry, reader)?;
        if decoded.ids != self.ids || decoded.configuration.name() != self.configuration.name() {
            self.temp_dir = None;
        }
        self.configuration = decoded.configuration;
        self.advice_chain = decoded.advice_chain;
        self.task = decoded.task;
        self.execution = decoded.execution;
        self.context = decoded.context;
        self.result = decoded.result;
        self.attachments = decoded.attachments;
        self.moderator = decoded.moderator;
        self.ids = decoded.ids;
        debug!(session_id = %self.ids, "session restored");
        Ok(())
    }

    /// Build a session from a saved archive.
    ///
    /// # Errors
    ///
    /// Same as [`Session::restore`].
    pub fn load(registry: Arc<Registry>, reader: impl Read) -> Result<Self> {
        let decoded = Self::decode(&registry, reader)?;
        debug!(session_id = %decoded.ids, "session loaded");
        Ok(Self {
            registry,
            configuration: decoded.configuration,
            advice_chain: decoded.advice_chain,
            task: decoded.task,
            execution: decoded.execution,
            context: decoded.context,
            result: decoded.result,
            attachments: decoded.attachments,
            moderator: decoded.moderator,
            ids: decoded.ids,
            temp_dir: None,
        })
    }

    fn decode(registry: &Registry, reader: impl Read) -> Result<Decoded> {
        let parts = ArchiveParts::read(reader)?;
        let header = parts.header()?;
        let configuration = registry.load(&header.configuration)?;
        let serializer = configuration.serializer();
        let decode = |name: &str| -> Result<Value> { serializer.from_bytes(parts.entry(name)?) };

        let task_ref: TaskRef = expect_object(&decode(TASK_ENTRY)?)?;
        let task = configuration.task(&task_ref.task_id)?;
        let execution: Execution = expect_object(&decode(EXECUTION_ENTRY)?)?;
        let context: Context = expect_object(&decode(CONTEXT_ENTRY)?)?;
        let result = match decode(RESULT_ENTRY)? {
            Value::Null => None,
            value => Some(expect_object::<TaskResult>(&value)?),
        };
        let moderator = match decode(MODERATOR_ENTRY)? {
            Value::Null => None,
            value => {
                let state: ModeratorState = expect_object(&value)?;
                let chain = configuration.advice_chain(&header.advice_chain)?;
                Some(Moderator::from_state(state, chain)?)
            }
        };
        let ids = Ids::new(task_ref.task_id, execution.execution_id(), header.run_id);
        if ids.session_id() != header.ids {
            return Err(BandsawError::Serialization(format!(
                "session id '{}' does not match its parts '{ids}'",
                header.ids
            )));
        }
        let attachments = parts.attachments()?;

        Ok(Decoded {
            configuration,
            advice_chain: header.advice_chain,
            task,
            execution,
            context,
            result,
            attachments,
            moderator,
            ids,
        })
    }

    /// Ids of this session.
    #[must_use]
    pub fn ids(&self) -> &Ids {
        &self.ids
    }

    /// Id of this session.
    #[must_use]
    pub fn session_id(&self) -> String {
        self.ids.session_id()
    }

    /// Run id this session was created in.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.ids.run_id
    }

    /// Per-session directory under the configuration's temp root, created
    /// on first use. Removing its content is up to the advices using it.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Io` if the directory cannot be created.
    pub fn temp_dir(&mut self) -> Result<PathBuf> {
        if let Some(dir) = &self.temp_dir {
            return Ok(dir.clone());
        }
        let dir = self
            .configuration
            .temp_root()
            .join("sessions")
            .join(self.ids.as_path());
        fs::create_dir_all(&dir).map_err(|err| {
            BandsawError::Io(format!("cannot create {}: {err}", dir.display()))
        })?;
        self.temp_dir = Some(dir.clone());
        Ok(dir)
    }

    /// Serializer of the session's configuration.
    #[must_use]
    pub fn serializer(&self) -> Arc<dyn Serializer> {
        self.configuration.serializer()
    }

    /// Distribution archive of the session's configuration.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Distribution` if the archive cannot be built.
    pub fn distribution_archive(&self) -> Result<Arc<DistributionArchive>> {
        self.configuration.distribution_archive()
    }

    /// Registry the session resolves configurations with.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Configuration of the session.
    #[must_use]
    pub fn configuration(&self) -> &Arc<Configuration> {
        &self.configuration
    }

    /// Name of the advice chain in use.
    #[must_use]
    pub fn advice_chain(&self) -> &str {
        &self.advice_chain
    }

    /// The advised task.
    #[must_use]
    pub fn task(&self) -> &Arc<dyn Task> {
        &self.task
    }

    /// The execution being advised.
    #[must_use]
    pub fn execution(&self) -> &Execution {
        &self.execution
    }

    /// Context shared by the advices.
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Mutable context shared by the advices.
    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    /// Current result, `None` until the task ran or an advice concluded.
    #[must_use]
    pub fn result(&self) -> Option<&TaskResult> {
        self.result.as_ref()
    }

    /// Replace the current result without changing chain progress.
    pub fn set_result(&mut self, result: TaskResult) {
        self.result = Some(result);
    }

    /// Files attached to the session.
    #[must_use]
    pub fn attachments(&self) -> &Attachments {
        &self.attachments
    }

    /// Mutable access to the attachments.
    pub fn attachments_mut(&mut self) -> &mut Attachments {
        &mut self.attachments
    }

    /// Chain progress, `None` before [`Session::initiate`].
    #[must_use]
    pub fn moderator(&self) -> Option<&Moderator> {
        self.moderator.as_ref()
    }
}
