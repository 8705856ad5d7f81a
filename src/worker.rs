//! Child side of out-of-process resumption.
//!
//! The worker reads a saved session, resumes it until it finishes or hands
//! control back, and writes the result to the output file. A failure leaves
//! the output untouched and surfaces as a non-zero exit of the binary.
//!
//! Sessions are resumed by the executable bundled in the distribution
//! archive, which is the launcher of the configuration. A program that
//! advises its own configurations out of process must therefore dispatch to
//! [`main`] when it is started as a worker:
//!
//! ```no_run
//! use bandsaw::config::Registry;
//!
//! fn registry() -> Registry {
//!     // register the program's configurations here
//!     Registry::new()
//! }
//!
//! fn main() -> bandsaw::Result<()> {
//!     if bandsaw::worker::is_worker_process() {
//!         return bandsaw::worker::main(registry());
//!     }
//!     // regular program
//!     Ok(())
//! }
//! ```

use std::ffi::OsString;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::sync::Arc;

use clap::error::ErrorKind;
use clap::{Args, Parser, ValueEnum};
use tempfile::TempDir;
use tracing::{debug, error, info, info_span};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Registry;
use crate::distribution::{read_manifest, unpack_modules, MODULE_PATH_ENV};
use crate::session::{Progress, Session};
use crate::{BandsawError, Result};

/// Environment variable set for every process started to resume a session.
pub const WORKER_ENV: &str = "BANDSAW_WORKER";

/// Whether this process was started to resume a session.
#[must_use]
pub fn is_worker_process() -> bool {
    std::env::var_os(WORKER_ENV).is_some()
}

/// Log output format of a worker.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, ValueEnum)]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Arguments passed by the parent process.
#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct WorkerArgs {
    /// Distribution archive the session belongs to.
    pub archive: PathBuf,
    /// Saved session to resume.
    #[arg(long)]
    pub input: PathBuf,
    /// File receiving the resumed session.
    #[arg(long)]
    pub output: PathBuf,
    /// Run id of the parent, reused for every session of this process.
    #[arg(long)]
    pub run_id: Option<String>,
}

#[derive(Debug, Parser)]
#[command(name = "bandsaw", about = "Resume a saved bandsaw session", version, long_about = None)]
struct Cli {
    #[command(flatten)]
    worker: WorkerArgs,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

/// Parse the process arguments and resume the session they name.
///
/// # Errors
///
/// Returns `BandsawError::Config` for invalid arguments and any error of
/// [`run`].
pub fn main(registry: Registry) -> Result<()> {
    main_from(registry, std::env::args_os())
}

/// Like [`main`] with explicit arguments, the first being the program name.
///
/// Help and version requests are printed and succeed.
///
/// # Errors
///
/// Returns `BandsawError::Config` for invalid arguments and any error of
/// [`run`].
pub fn main_from<I, T>(registry: Registry, args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            return err
                .print()
                .map_err(|err| BandsawError::Io(format!("failed to print usage: {err}")));
        }
        Err(err) => return Err(BandsawError::Config(err.to_string())),
    };
    init_tracing(cli.log_format);
    info!(archive = %cli.worker.archive.display(), "bandsaw worker starting");

    match run(registry, &cli.worker) {
        Ok(progress) => {
            info!(?progress, "bandsaw worker done");
            Ok(())
        }
        Err(err) => {
            error!(%err, "bandsaw worker failed");
            Err(err)
        }
    }
}

fn init_tracing(log_format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    let installed = match log_format {
        LogFormat::Text => subscriber.try_init(),
        LogFormat::Json => subscriber.json().try_init(),
    };
    if let Err(err) = installed {
        debug!(%err, "keeping the installed tracing subscriber");
    }
}

/// Resume the session in `args.input` and save it to `args.output`.
///
/// # Errors
///
/// Returns `BandsawError::Distribution` if the archive is unreadable or was
/// built for another configuration, `BandsawError::Io` for exchange file
/// failures, and any error raised while resuming.
pub fn run(registry: Registry, args: &WorkerArgs) -> Result<Progress> {
    let span = info_span!("worker", archive = %args.archive.display());
    let _guard = span.enter();

    let registry = Arc::new(match &args.run_id {
        Some(run_id) => registry.with_run_id(run_id.clone()),
        None => registry,
    });

    let manifest = read_manifest(&args.archive)?;
    let scratch = TempDir::new()
        .map_err(|err| BandsawError::Io(format!("failed to create worker dir: {err}")))?;
    let modules = unpack_modules(&args.archive, scratch.path())?;
    std::env::set_var(MODULE_PATH_ENV, &modules);
    info!(
        configuration = %manifest.configuration,
        modules = manifest.modules.len(),
        "distribution unpacked"
    );

    let input = File::open(&args.input).map_err(|err| {
        BandsawError::Io(format!("cannot open {}: {err}", args.input.display()))
    })?;
    let mut session = Session::load(registry, BufReader::new(input))?;
    if session.configuration().name() != manifest.configuration {
        return Err(BandsawError::Distribution(format!(
            "archive built for '{}' cannot resume a session of '{}'",
            manifest.configuration,
            session.configuration().name()
        )));
    }

    let progress = session.resume()?;
    info!(session_id = %session.ids(), ?progress, "session resumed");

    let output = File::create(&args.output).map_err(|err| {
        BandsawError::Io(format!("cannot create {}: {err}", args.output.display()))
    })?;
    session.save(BufWriter::new(output))?;
    Ok(progress)
}
