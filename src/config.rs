//! Settings parsing, advising configurations and the registry that loads
//! them by name.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tempfile::TempDir;
use tracing::{debug, info};
use uuid::Uuid;

use crate::advice::{Advice, AdviceChain, Extension};
use crate::advices::Remote;
use crate::distribution::DistributionArchive;
use crate::serialization::{Serializer, SerializerKind, TypeRegistry};
use crate::task::Task;
use crate::{BandsawError, Result};

/// Name of the advice chain every configuration starts with.
pub const DEFAULT_CHAIN: &str = "default";

/// Optional knobs of a configuration, parsed from TOML.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Settings {
    /// Parent directory of the temporary root; the system temp dir if unset.
    #[serde(default)]
    pub temp_root: Option<PathBuf>,
    /// Serializer used for sessions.
    #[serde(default)]
    pub serializer: SerializerKind,
    /// Glob patterns of extra files bundled into the distribution archive.
    #[serde(default)]
    pub modules: Vec<String>,
    /// Executable bundled into the distribution archive to resume sessions
    /// out of process; the current executable if unset.
    #[serde(default)]
    pub launcher: Option<PathBuf>,
    /// Machines sessions can be moved to, by name.
    #[serde(default)]
    pub remotes: BTreeMap<String, Remote>,
}

impl Settings {
    /// Load and validate settings from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Config` if the file cannot be read, contains
    /// invalid TOML, or fails validation.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| BandsawError::Config(format!("failed to read settings: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse settings from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut settings: Self = toml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Expand the module patterns into the files they match.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Config` for invalid patterns or patterns that
    /// match nothing.
    pub fn expand_modules(&self) -> Result<Vec<PathBuf>> {
        let mut modules = Vec::new();
        for pattern in &self.modules {
            let matches = glob::glob(pattern).map_err(|err| {
                BandsawError::Config(format!("invalid module pattern '{pattern}': {err}"))
            })?;
            let before = modules.len();
            for entry in matches {
                let path = entry.map_err(|err| {
                    BandsawError::Config(format!("cannot read module '{pattern}': {err}"))
                })?;
                modules.push(path);
            }
            if modules.len() == before {
                return Err(BandsawError::Config(format!(
                    "module pattern '{pattern}' matches no files"
                )));
            }
        }
        Ok(modules)
    }

    fn validate(&mut self) -> Result<()> {
        if let Some(root) = &self.temp_root {
            let canonical = root
                .canonicalize()
                .map_err(|err| BandsawError::Config(format!("temp_root invalid: {err}")))?;
            if !canonical.is_dir() {
                return Err(BandsawError::Config(format!(
                    "temp_root is not a directory: {}",
                    canonical.display()
                )));
            }
            self.temp_root = Some(canonical);
        }
        if let Some(launcher) = &self.launcher {
            if !launcher.is_file() {
                return Err(BandsawError::Config(format!(
                    "launcher is not a file: {}",
                    launcher.display()
                )));
            }
        }
        for (name, remote) in &self.remotes {
            remote
                .validate()
                .map_err(|err| BandsawError::Config(format!("remote '{name}': {err}")))?;
        }
        Ok(())
    }
}

enum SerializerChoice {
    Builtin(SerializerKind),
    Custom(Arc<dyn Serializer>),
}

/// Everything needed to advise tasks: advice chains, tasks, extensions,
/// serializer and distribution settings.
///
/// A configuration owns a temporary root directory that is removed when the
/// configuration is dropped.
pub struct Configuration {
    name: String,
    chains: HashMap<String, AdviceChain>,
    tasks: HashMap<String, Arc<dyn Task>>,
    extensions: Vec<Arc<dyn Extension>>,
    types: Arc<TypeRegistry>,
    serializer: SerializerChoice,
    modules: Vec<PathBuf>,
    launcher: Option<PathBuf>,
    temp_dir: TempDir,
    archive: Mutex<Option<Arc<DistributionArchive>>>,
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut chains: Vec<&String> = self.chains.keys().collect();
        chains.sort();
        let mut tasks: Vec<&String> = self.tasks.keys().collect();
        tasks.sort();
        f.debug_struct("Configuration")
            .field("name", &self.name)
            .field("chains", &chains)
            .field("tasks", &tasks)
            .field("extensions", &self.extensions.len())
            .field("modules", &self.modules)
            .field("temp_root", &self.temp_dir.path())
            .finish_non_exhaustive()
    }
}

impl Configuration {
    /// Create a configuration with default settings.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Io` if the temporary root cannot be created.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        Self::with_settings(name, &Settings::default())
    }

    /// Create a configuration from settings.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Config` if module patterns cannot be expanded,
    /// or `BandsawError::Io` if the temporary root cannot be created.
    pub fn with_settings(name: impl Into<String>, settings: &Settings) -> Result<Self> {
        let name = name.into();
        let mut builder = tempfile::Builder::new();
        builder.prefix("bandsaw-");
        let temp_dir = match &settings.temp_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(|err| BandsawError::Io(format!("failed to create temp root: {err}")))?;
        debug!(configuration = %name, temp_root = %temp_dir.path().display(), "temp root created");

        let mut chains = HashMap::new();
        chains.insert(DEFAULT_CHAIN.to_owned(), AdviceChain::from(Vec::new()));

        Ok(Self {
            name,
            chains,
            tasks: HashMap::new(),
            extensions: Vec::new(),
            types: Arc::new(TypeRegistry::new()),
            serializer: SerializerChoice::Builtin(settings.serializer),
            modules: settings.expand_modules()?,
            launcher: settings.launcher.clone(),
            temp_dir,
            archive: Mutex::new(None),
        })
    }

    /// Name the configuration is registered under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register an advice chain; a chain with the same name is replaced.
    pub fn add_advice_chain(
        &mut self,
        name: impl Into<String>,
        advices: Vec<Arc<dyn Advice>>,
    ) -> &mut Self {
        self.chains.insert(name.into(), advices.into());
        self
    }

    /// Look up an advice chain.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::UnknownChain` if no chain has that name.
    pub fn advice_chain(&self, name: &str) -> Result<AdviceChain> {
        self.chains.get(name).cloned().ok_or_else(|| {
            BandsawError::UnknownChain(format!("'{name}' in configuration '{}'", self.name))
        })
    }

    /// Register a task under its id; a task with the same id is replaced.
    pub fn add_task(&mut self, task: impl Task + 'static) -> &mut Self {
        self.tasks.insert(task.task_id().to_owned(), Arc::new(task));
        self
    }

    /// Look up a task.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::UnknownTask` if no task has that id.
    pub fn task(&self, task_id: &str) -> Result<Arc<dyn Task>> {
        self.tasks.get(task_id).cloned().ok_or_else(|| {
            BandsawError::UnknownTask(format!("'{task_id}' in configuration '{}'", self.name))
        })
    }

    /// Add an extension called around every session.
    pub fn add_extension(&mut self, extension: Arc<dyn Extension>) -> &mut Self {
        self.extensions.push(extension);
        self
    }

    /// Extensions in registration order.
    #[must_use]
    pub fn extensions(&self) -> &[Arc<dyn Extension>] {
        &self.extensions
    }

    /// Types known to decoders.
    #[must_use]
    pub fn types(&self) -> Arc<TypeRegistry> {
        Arc::clone(&self.types)
    }

    /// Register additional decodable types.
    ///
    /// A custom serializer set earlier keeps the registry it was built with.
    pub fn register_types(&mut self, register: impl FnOnce(&mut TypeRegistry)) -> &mut Self {
        register(Arc::make_mut(&mut self.types));
        self
    }

    /// Use one of the built-in serializers.
    pub fn set_serializer_kind(&mut self, kind: SerializerKind) -> &mut Self {
        self.serializer = SerializerChoice::Builtin(kind);
        self
    }

    /// Use a custom serializer.
    pub fn set_serializer(&mut self, serializer: Arc<dyn Serializer>) -> &mut Self {
        self.serializer = SerializerChoice::Custom(serializer);
        self
    }

    /// The active serializer.
    #[must_use]
    pub fn serializer(&self) -> Arc<dyn Serializer> {
        match &self.serializer {
            SerializerChoice::Builtin(kind) => kind.build(self.types()),
            SerializerChoice::Custom(serializer) => Arc::clone(serializer),
        }
    }

    /// Bundle an extra file or directory into the distribution archive.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Config` if `path` does not exist.
    pub fn add_module(&mut self, path: impl Into<PathBuf>) -> Result<&mut Self> {
        let path = path.into();
        if !path.exists() {
            return Err(BandsawError::Config(format!(
                "module does not exist: {}",
                path.display()
            )));
        }
        self.modules.push(path);
        Ok(self)
    }

    /// Extra files bundled into the distribution archive.
    #[must_use]
    pub fn modules(&self) -> &[PathBuf] {
        &self.modules
    }

    /// Use `launcher` to resume sessions out of process.
    pub fn set_launcher(&mut self, launcher: impl Into<PathBuf>) -> &mut Self {
        self.launcher = Some(launcher.into());
        self
    }

    /// Executable bundled into the distribution archive.
    ///
    /// Without an explicit launcher this is the current executable, which
    /// must then hand worker invocations to [`crate::worker::main`].
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Config` if no launcher is set and the current
    /// executable cannot be determined.
    pub fn launcher(&self) -> Result<PathBuf> {
        match &self.launcher {
            Some(launcher) => Ok(launcher.clone()),
            None => std::env::current_exe().map_err(|err| {
                BandsawError::Config(format!("cannot determine current executable: {err}"))
            }),
        }
    }

    /// Temporary root directory, removed with the configuration.
    #[must_use]
    pub fn temp_root(&self) -> &Path {
        self.temp_dir.path()
    }

    /// The distribution archive of this configuration, built on first use
    /// and cached afterwards.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Distribution` if the archive cannot be built.
    pub fn distribution_archive(&self) -> Result<Arc<DistributionArchive>> {
        let mut cached = self
            .archive
            .lock()
            .map_err(|_| BandsawError::IllegalState("distribution cache poisoned".into()))?;
        if let Some(archive) = cached.as_ref() {
            return Ok(Arc::clone(archive));
        }
        let archive = Arc::new(DistributionArchive::create(self)?);
        *cached = Some(Arc::clone(&archive));
        Ok(archive)
    }
}

type Loader = Box<dyn Fn() -> Result<Configuration> + Send + Sync>;

/// Loads configurations by name, once, and caches them.
///
/// The registry also carries the run id shared by every session of this
/// process.
pub struct Registry {
    loaders: HashMap<String, Loader>,
    cache: Mutex<HashMap<String, Arc<Configuration>>>,
    run_id: String,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("configurations", &self.names())
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Create an empty registry with a fresh run id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            loaders: HashMap::new(),
            cache: Mutex::new(HashMap::new()),
            run_id: Uuid::new_v4().simple().to_string(),
        }
    }

    /// Replace the run id, e.g. with the one a parent process passed down.
    #[must_use]
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    /// Run id of this process.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Register how to build the configuration `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, loader: F) -> &mut Self
    where
        F: Fn() -> Result<Configuration> + Send + Sync + 'static,
    {
        self.loaders.insert(name.into(), Box::new(loader));
        self
    }

    /// Names of all registered configurations, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.loaders.keys().cloned().collect();
        names.sort();
        names
    }

    /// Load the configuration `name`, building it on first use.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::UnknownConfiguration` if nothing is registered
    /// under `name`, `BandsawError::Config` if the loader builds a
    /// configuration with another name, or the loader's own error.
    pub fn load(&self, name: &str) -> Result<Arc<Configuration>> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| BandsawError::IllegalState("configuration cache poisoned".into()))?;
        if let Some(configuration) = cache.get(name) {
            return Ok(Arc::clone(configuration));
        }
        let loader = self
            .loaders
            .get(name)
            .ok_or_else(|| BandsawError::UnknownConfiguration(name.to_owned()))?;
        let configuration = loader()?;
        if configuration.name() != name {
            return Err(BandsawError::Config(format!(
                "loader for '{name}' built configuration '{}'",
                configuration.name()
            )));
        }
        info!(configuration = name, "configuration loaded");
        let configuration = Arc::new(configuration);
        cache.insert(name.to_owned(), Arc::clone(&configuration));
        Ok(configuration)
    }
}
