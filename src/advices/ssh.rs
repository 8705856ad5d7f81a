//! Advice that continues a session on another machine.
//!
//! Works like [`SubprocessAdvice`](super::SubprocessAdvice) with a copy
//! step in between: the saved session, the distribution archive and its
//! bundled executable are copied into a per-execution directory on the
//! remote, the executable resumes the session there, and the output is
//! copied back and restored. Transfers go through a [`RemoteBackend`];
//! [`SshCommandLineBackend`] drives the `ssh` and `scp` tools.
//!
//! Authentication is left to the SSH setup of the machine; a [`Remote`] can
//! only name a key file.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, info_span, warn};

use crate::advice::{Advice, Instruction};
use crate::models::Value;
use crate::session::Session;
use crate::worker::WORKER_ENV;
use crate::{BandsawError, Result};

/// Remote used when a task names none.
pub const DEFAULT_REMOTE: &str = "default";

/// Key of the task advice parameters read by [`SshAdvice`].
///
/// A task selects a remote with `{"remote": "<name>"}` under this key.
pub const PARAMETERS_KEY: &str = "ssh";

const EXECUTABLE_NAME: &str = "__main__";

fn default_port() -> u16 {
    22
}

fn default_directory() -> PathBuf {
    PathBuf::from("/tmp")
}

/// A machine sessions can be moved to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Remote {
    /// Host name or address.
    pub host: String,
    /// SSH port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Login user; the SSH default if unset.
    #[serde(default)]
    pub user: Option<String>,
    /// Private key used to log in.
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Executable on the remote that resumes sessions. The executable
    /// bundled in the distribution archive is copied over if unset.
    #[serde(default)]
    pub executable: Option<PathBuf>,
    /// Remote directory holding the per-execution exchange directories.
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
}

impl Remote {
    /// Remote `host` with default port, user and directory.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            user: None,
            key_file: None,
            executable: None,
            directory: default_directory(),
        }
    }

    /// Use another SSH port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Log in as `user`.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Log in with the key in `key_file`.
    #[must_use]
    pub fn with_key_file(mut self, key_file: impl Into<PathBuf>) -> Self {
        self.key_file = Some(key_file.into());
        self
    }

    /// Resume sessions with an executable already present on the remote.
    #[must_use]
    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = Some(executable.into());
        self
    }

    /// Keep exchange directories below `directory` on the remote.
    #[must_use]
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }

    /// SSH destination, `user@host` or `host`.
    #[must_use]
    pub fn login(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }

    /// Check the definition.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Config` for an empty host or port 0.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(BandsawError::Config("remote host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(BandsawError::Config(format!(
                "remote {} has invalid port 0",
                self.host
            )));
        }
        Ok(())
    }
}

/// Moves files to and from a remote and runs commands there.
///
/// Implementations must export [`WORKER_ENV`] to the processes started by
/// [`RemoteBackend::execute`].
pub trait RemoteBackend: Send + Sync + fmt::Debug {
    /// Create `path` and its parents on the remote.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Remote` if the directory cannot be created.
    fn create_dir(&self, remote: &Remote, path: &Path) -> Result<()>;

    /// Copy the local file `local` to `remote_path`.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Remote` if the copy fails.
    fn copy_to_remote(&self, remote: &Remote, local: &Path, remote_path: &Path) -> Result<()>;

    /// Copy the remote file `remote_path` to `local`.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Remote` if the copy fails.
    fn copy_from_remote(&self, remote: &Remote, remote_path: &Path, local: &Path) -> Result<()>;

    /// Run `executable` with `args` on the remote and wait for it.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Remote` if the command cannot be started or
    /// exits unsuccessfully.
    fn execute(&self, remote: &Remote, executable: &Path, args: &[OsString]) -> Result<()>;

    /// Remove `path` and everything below it on the remote.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Remote` if the removal fails.
    fn delete_dir(&self, remote: &Remote, path: &Path) -> Result<()>;
}

/// Backend calling the `ssh` and `scp` command line tools.
#[derive(Debug, Clone, Copy, Default)]
pub struct SshCommandLineBackend;

impl SshCommandLineBackend {
    fn ssh(remote: &Remote) -> Command {
        let mut command = Command::new("ssh");
        command.arg("-p").arg(remote.port.to_string());
        if let Some(key_file) = &remote.key_file {
            command.arg("-i").arg(key_file);
        }
        command.arg(remote.login());
        command
    }

    fn scp(remote: &Remote) -> Command {
        let mut command = Command::new("scp");
        command.arg("-P").arg(remote.port.to_string());
        if let Some(key_file) = &remote.key_file {
            command.arg("-i").arg(key_file);
        }
        command
    }

    fn remote_path(remote: &Remote, path: &Path) -> String {
        format!("{}:{}", remote.login(), path.display())
    }

    fn run(mut command: Command) -> Result<()> {
        debug!(command = ?command, "running remote command");
        let status = command
            .stdin(Stdio::null())
            .status()
            .map_err(|err| BandsawError::Remote(format!("failed to run {command:?}: {err}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(BandsawError::Remote(format!(
                "{command:?} exited with {status}"
            )))
        }
    }
}

impl RemoteBackend for SshCommandLineBackend {
    fn create_dir(&self, remote: &Remote, path: &Path) -> Result<()> {
        let mut command = Self::ssh(remote);
        command.arg("mkdir").arg("-p").arg(path);
        Self::run(command)
    }

    fn copy_to_remote(&self, remote: &Remote, local: &Path, remote_path: &Path) -> Result<()> {
        let mut command = Self::scp(remote);
        command
            .arg(local)
            .arg(Self::remote_path(remote, remote_path));
        Self::run(command)
    }

    fn copy_from_remote(&self, remote: &Remote, remote_path: &Path, local: &Path) -> Result<()> {
        let mut command = Self::scp(remote);
        command
            .arg(Self::remote_path(remote, remote_path))
            .arg(local);
        Self::run(command)
    }

    fn execute(&self, remote: &Remote, executable: &Path, args: &[OsString]) -> Result<()> {
        let mut command = Self::ssh(remote);
        command
            .arg("env")
            .arg(format!("{WORKER_ENV}=1"))
            .arg(executable)
            .args(args);
        Self::run(command)
    }

    fn delete_dir(&self, remote: &Remote, path: &Path) -> Result<()> {
        let mut command = Self::ssh(remote);
        command.arg("rm").arg("-Rf").arg(path);
        Self::run(command)
    }
}

/// Resumes the rest of the chain on a remote machine.
///
/// The remote is picked by the task's `ssh` advice parameters and falls
/// back to [`DEFAULT_REMOTE`].
#[derive(Debug, Clone)]
pub struct SshAdvice {
    directory: Option<PathBuf>,
    remotes: BTreeMap<String, Remote>,
    backend: Arc<dyn RemoteBackend>,
}

impl Default for SshAdvice {
    fn default() -> Self {
        Self::new()
    }
}

impl SshAdvice {
    /// Advice using the `ssh` command line tools and no remotes.
    #[must_use]
    pub fn new() -> Self {
        Self {
            directory: None,
            remotes: BTreeMap::new(),
            backend: Arc::new(SshCommandLineBackend),
        }
    }

    /// Use another transfer backend.
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn RemoteBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Keep local exchange files in `directory` instead of the session's
    /// temporary directory.
    #[must_use]
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    /// Add a remote; a remote with the same name is replaced.
    #[must_use]
    pub fn with_remote(mut self, name: impl Into<String>, remote: Remote) -> Self {
        self.remotes.insert(name.into(), remote);
        self
    }

    /// Known remotes by name.
    #[must_use]
    pub fn remotes(&self) -> &BTreeMap<String, Remote> {
        &self.remotes
    }

    fn remote_for(&self, session: &Session) -> Result<&Remote> {
        let name = session
            .task()
            .advice_parameters(PARAMETERS_KEY)
            .and_then(|parameters| parameters.get("remote"))
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_REMOTE);
        self.remotes
            .get(name)
            .ok_or_else(|| BandsawError::Config(format!("no remote named '{name}'")))
    }

    fn exchange_dir(&self, session: &mut Session) -> Result<PathBuf> {
        match &self.directory {
            Some(dir) => {
                fs::create_dir_all(dir).map_err(|err| {
                    BandsawError::Io(format!("cannot create {}: {err}", dir.display()))
                })?;
                Ok(dir.clone())
            }
            None => session.temp_dir(),
        }
    }
}

fn io_error(action: &str, path: &Path, err: &std::io::Error) -> BandsawError {
    BandsawError::Io(format!("failed to {action} {}: {err}", path.display()))
}

impl Advice for SshAdvice {
    fn name(&self) -> &str {
        "SshAdvice"
    }

    fn before(&self, session: &mut Session) -> Result<Instruction> {
        let span = info_span!("ssh", session_id = %session.ids());
        let _guard = span.enter();

        let remote = self.remote_for(session)?.clone();
        let dir = self.exchange_dir(session)?;
        let session_id = session.session_id();
        let input_name = format!("session-{session_id}-in.session");
        let output_name = format!("session-{session_id}-out.session");
        let input = dir.join(&input_name);
        let output = dir.join(&output_name);

        let file = File::create(&input).map_err(|err| io_error("create", &input, &err))?;
        session.save(BufWriter::new(file))?;

        let run_dir = remote.directory.join(session.execution().execution_id());
        info!(host = %remote.host, run_dir = %run_dir.display(), "creating remote run directory");
        self.backend.create_dir(&remote, &run_dir)?;

        let archive = session.distribution_archive()?;
        let archive_path = archive.path()?.to_path_buf();
        let archive_name = archive_path.file_name().ok_or_else(|| {
            BandsawError::Distribution(format!("invalid archive path {}", archive_path.display()))
        })?;
        let remote_archive = run_dir.join(archive_name);
        info!(host = %remote.host, "copying distribution archive");
        self.backend
            .copy_to_remote(&remote, &archive_path, &remote_archive)?;

        let executable = match &remote.executable {
            Some(executable) => executable.clone(),
            None => {
                let remote_executable = run_dir.join(EXECUTABLE_NAME);
                self.backend
                    .copy_to_remote(&remote, &archive.executable()?, &remote_executable)?;
                remote_executable
            }
        };

        let remote_input = run_dir.join(&input_name);
        let remote_output = run_dir.join(&output_name);
        self.backend.copy_to_remote(&remote, &input, &remote_input)?;

        info!(host = %remote.host, executable = %executable.display(), "resuming session remotely");
        let args: Vec<OsString> = vec![
            remote_archive.into_os_string(),
            OsStr::new("--input").to_owned(),
            remote_input.into_os_string(),
            OsStr::new("--output").to_owned(),
            remote_output.clone().into_os_string(),
            OsStr::new("--run-id").to_owned(),
            OsString::from(session.run_id()),
        ];
        if let Err(err) = self.backend.execute(&remote, &executable, &args) {
            warn!(%err, "remote process failed, keeping exchange files");
            return Err(BandsawError::Remote(format!(
                "resuming on {} failed: {err}; input {} kept",
                remote.host,
                input.display()
            )));
        }

        self.backend
            .copy_from_remote(&remote, &remote_output, &output)?;
        info!(host = %remote.host, run_dir = %run_dir.display(), "removing remote run directory");
        self.backend.delete_dir(&remote, &run_dir)?;

        let output_file = File::open(&output).map_err(|err| io_error("open", &output, &err))?;
        session.restore(BufReader::new(output_file))?;
        fs::remove_file(&input).map_err(|err| io_error("remove", &input, &err))?;
        fs::remove_file(&output).map_err(|err| io_error("remove", &output, &err))?;
        Ok(Instruction::Proceed)
    }

    fn after(&self, _session: &mut Session) -> Result<Instruction> {
        Ok(Instruction::Suspend)
    }
}
