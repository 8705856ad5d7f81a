//! Advice that continues a session in a freshly spawned process.
//!
//! The parent saves the session, starts the executable bundled in the
//! configuration's distribution archive and blocks until the child exits.
//! The child resumes the remaining chain, including the task, and hands
//! control back by suspending in this advice's `after` hook. The parent then
//! restores the child's output and continues with the remaining `after`
//! hooks.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{info, info_span, warn};

use crate::advice::{Advice, Instruction};
use crate::session::Session;
use crate::worker::WORKER_ENV;
use crate::{BandsawError, Result};

/// Resumes the rest of the chain in a subprocess.
///
/// Nothing bounds the wait: a child that never exits blocks the session.
#[derive(Debug, Clone, Default)]
pub struct SubprocessAdvice {
    env: Vec<(String, String)>,
}

impl SubprocessAdvice {
    /// Create the advice.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an environment variable for the child process.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

fn io_error(action: &str, path: &Path, err: &std::io::Error) -> BandsawError {
    BandsawError::Io(format!("failed to {action} {}: {err}", path.display()))
}

fn exchange_file(dir: &Path, prefix: &str) -> Result<(File, PathBuf)> {
    tempfile::Builder::new()
        .prefix(prefix)
        .suffix(".session")
        .tempfile_in(dir)
        .map_err(|err| io_error("create exchange file in", dir, &err))?
        .keep()
        .map_err(|err| io_error("keep exchange file in", dir, &err.error))
}

impl Advice for SubprocessAdvice {
    fn name(&self) -> &str {
        "SubprocessAdvice"
    }

    fn before(&self, session: &mut Session) -> Result<Instruction> {
        let span = info_span!("subprocess", session_id = %session.ids());
        let _guard = span.enter();

        let dir = session.temp_dir()?;
        let (input_file, input) = exchange_file(&dir, "input-")?;
        session.save(BufWriter::new(input_file))?;
        let (_, output) = exchange_file(&dir, "output-")?;

        let archive = session.distribution_archive()?;
        let archive_path = archive.path()?;
        let launcher = archive.executable()?;

        info!(
            launcher = %launcher.display(),
            archive = %archive_path.display(),
            "resuming session in subprocess"
        );
        let status = Command::new(&launcher)
            .arg(archive_path)
            .arg("--input")
            .arg(&input)
            .arg("--output")
            .arg(&output)
            .arg("--run-id")
            .arg(session.run_id())
            .env(WORKER_ENV, "1")
            .envs(self.env.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|err| {
                BandsawError::Subprocess(format!(
                    "failed to spawn {}: {err}",
                    launcher.display()
                ))
            })?;

        if !status.success() {
            warn!(exit_status = %status, "subprocess failed, keeping exchange files");
            return Err(BandsawError::Subprocess(format!(
                "{} exited with {status}; input {} and output {} kept",
                launcher.display(),
                input.display(),
                output.display()
            )));
        }
        info!(exit_status = %status, "subprocess finished");

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
