//! Self-contained bundle used to resume sessions in a new process.
//!
//! The archive is a tar file holding the launcher executable as
//! `__main__`, a `manifest.json` and every distribution module under
//! `modules/`. Children are started from the extracted `__main__`, receive
//! the archive path on their command line, read the manifest and unpack the
//! modules before resuming.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, info_span};

use crate::config::Configuration;
use crate::identifier::identifier_from_bytes;
use crate::{BandsawError, Result};

/// Environment variable pointing at the unpacked modules in a child.
pub const MODULE_PATH_ENV: &str = "BANDSAW_MODULE_PATH";

const MAIN_ENTRY: &str = "__main__";
const MANIFEST_ENTRY: &str = "manifest.json";
const MODULES_DIR: &str = "modules";

/// Description of an archive's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Configuration the archive was built for.
    pub configuration: String,
    /// Names of the bundled modules below `modules/`.
    pub modules: Vec<String>,
    /// Build time.
    pub built_at: DateTime<Utc>,
}

fn distribution_error(action: &str, path: &Path, err: &std::io::Error) -> BandsawError {
    BandsawError::Distribution(format!("failed to {action} {}: {err}", path.display()))
}

fn module_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| {
            BandsawError::Distribution(format!("module has no file name: {}", path.display()))
        })
}

/// A built distribution archive on disk.
#[derive(Debug)]
pub struct DistributionArchive {
    path: PathBuf,
    configuration: String,
    launcher: PathBuf,
    modules: Vec<PathBuf>,
    build_lock: Mutex<()>,
}

impl DistributionArchive {
    /// Build the archive for `configuration` inside its temp root.
    ///
    /// The file name is derived from the configuration name, the launcher
    /// and the modules, so equal inputs map to the same file.
    pub(crate) fn create(configuration: &Configuration) -> Result<Self> {
        let launcher = configuration.launcher()?;
        let mut identity = configuration.name().as_bytes().to_vec();
        identity.push(0);
        identity.extend_from_slice(launcher.to_string_lossy().as_bytes());
        for module in configuration.modules() {
            identity.push(0);
            identity.extend_from_slice(module.to_string_lossy().as_bytes());
        }
        let identifier = identifier_from_bytes(&identity);
        let path = configuration
            .temp_root()
            .join("distribution")
            .join(format!("{}.tar", &identifier[..16]));

        let archive = Self {
            path,
            configuration: configuration.name().to_owned(),
            launcher,
            modules: configuration.modules().to_vec(),
            build_lock: Mutex::new(()),
        };
        archive.build()?;
        Ok(archive)
    }

    /// Path of the archive, rebuilt first if the file was removed.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Distribution` if a rebuild fails.
    pub fn path(&self) -> Result<&Path> {
        if !self.path.is_file() {
            info!(archive = %self.path.display(), "distribution archive missing, rebuilding");
            self.build()?;
        }
        Ok(&self.path)
    }

    /// The bundled `__main__` executable, extracted next to the archive on
    /// first use. Rebuilding the archive discards the extracted copy.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Distribution` if the archive cannot be rebuilt
    /// or the executable cannot be extracted.
    pub fn executable(&self) -> Result<PathBuf> {
        let archive = self.path()?.to_path_buf();
        let _lock = self
            .build_lock
            .lock()
            .map_err(|_| BandsawError::IllegalState("distribution build lock poisoned".into()))?;
        let target = self.extract_dir().join(MAIN_ENTRY);
        if target.is_file() {
            return Ok(target);
        }
        extract_executable(&archive, &self.extract_dir())
    }

    fn extract_dir(&self) -> PathBuf {
        self.path.with_extension("")
    }

    /// Configuration the archive belongs to.
    #[must_use]
    pub fn configuration(&self) -> &str {
        &self.configuration
    }

    /// Bundled modules.
    #[must_use]
    pub fn modules(&self) -> &[PathBuf] {
        &self.modules
    }

    fn build(&self) -> Result<()> {
        let span = info_span!("distribution.build", archive = %self.path.display());
        let _guard = span.enter();
        let _lock = self
            .build_lock
            .lock()
            .map_err(|_| BandsawError::IllegalState("distribution build lock poisoned".into()))?;
        if self.path.is_file() {
            return Ok(());
        }

        let dir = self.path.parent().ok_or_else(|| {
            BandsawError::Distribution(format!("invalid archive path {}", self.path.display()))
        })?;
        fs::create_dir_all(dir).map_err(|err| distribution_error("create", dir, &err))?;

        let mut file =
            NamedTempFile::new_in(dir).map_err(|err| distribution_error("create", dir, &err))?;
        let mut builder = tar::Builder::new(file.as_file_mut());
        builder
            .append_path_with_name(&self.launcher, MAIN_ENTRY)
            .map_err(|err| distribution_error("bundle", &self.launcher, &err))?;

        let mut names = Vec::with_capacity(self.modules.len());
        for module in &self.modules {
            let name = module_name(module)?;
            let entry = format!("{MODULES_DIR}/{name}");
            let appended = if module.is_dir() {
                builder.append_dir_all(&entry, module)
            } else {
                builder.append_path_with_name(module, &entry)
            };
            appended.map_err(|err| distribution_error("bundle", module, &err))?;
            names.push(name);
        }

        let manifest = Manifest {
            configuration: self.configuration.clone(),
            modules: names,
            built_at: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&manifest)?;
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(u64::try_from(manifest.built_at.timestamp()).unwrap_or_default());
        builder
            .append_data(&mut header, MANIFEST_ENTRY, bytes.as_slice())
            .map_err(|err| distribution_error("write manifest into", &self.path, &err))?;
        builder
            .into_inner()
            .map_err(|err| distribution_error("finish", &self.path, &err))?;

        file.persist(&self.path)
            .map_err(|err| distribution_error("persist", &self.path, &err.error))?;
        let extracted = self.extract_dir();
        if extracted.exists() {
            fs::remove_dir_all(&extracted)
                .map_err(|err| distribution_error("remove", &extracted, &err))?;
        }
        info!(modules = self.modules.len(), "distribution archive built");
        Ok(())
    }
}

/// Read the manifest of a distribution archive.
///
/// # Errors
///
/// Returns `BandsawError::Distribution` if the archive cannot be read or has
/// no manifest.
pub fn read_manifest(archive: &Path) -> Result<Manifest> {
    let file = File::open(archive).map_err(|err| distribution_error("open", archive, &err))?;
    let mut tar = tar::Archive::new(file);
    let entries = tar
        .entries()
        .map_err(|err| distribution_error("read", archive, &err))?;
    for entry in entries {
        let mut entry = entry.map_err(|err| distribution_error("read", archive, &err))?;
        let path = entry
            .path()
            .map_err(|err| distribution_error("read", archive, &err))?
            .into_owned();
        if path == Path::new(MANIFEST_ENTRY) {
            let mut raw = String::new();
            entry
                .read_to_string(&mut raw)
                .map_err(|err| distribution_error("read manifest of", archive, &err))?;
            return Ok(serde_json::from_str(&raw)?);
        }
    }
    Err(BandsawError::Distribution(format!(
        "{} has no manifest",
        archive.display()
    )))
}

/// Extract the bundled `__main__` of `archive` into `dest` as an executable
/// file and return its path.
///
/// # Errors
///
/// Returns `BandsawError::Distribution` if the archive has no `__main__` or
/// writing the file fails.
pub fn extract_executable(archive: &Path, dest: &Path) -> Result<PathBuf> {
    let file = File::open(archive).map_err(|err| distribution_error("open", archive, &err))?;
    let mut tar = tar::Archive::new(file);
    let entries = tar
        .entries()
        .map_err(|err| distribution_error("read", archive, &err))?;
    for entry in entries {
        let mut entry = entry.map_err(|err| distribution_error("read", archive, &err))?;
        let path = entry
            .path()
            .map_err(|err| distribution_error("read", archive, &err))?
            .into_owned();
        if path != Path::new(MAIN_ENTRY) {
            continue;
        }
        fs::create_dir_all(dest).map_err(|err| distribution_error("create", dest, &err))?;
        let target = dest.join(MAIN_ENTRY);
        let mut temp =
            NamedTempFile::new_in(dest).map_err(|err| distribution_error("create", dest, &err))?;
        io::copy(&mut entry, temp.as_file_mut())
            .map_err(|err| distribution_error("extract executable of", archive, &err))?;
        make_executable(temp.path())?;
        // The handle must be closed before the file is executed.
        drop(
            temp.persist(&target)
                .map_err(|err| distribution_error("persist", &target, &err.error))?,
        );
        debug!(executable = %target.display(), "executable extracted");
        return Ok(target);
    }
    Err(BandsawError::Distribution(format!(
        "{} has no {MAIN_ENTRY}",
        archive.display()
    )))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .map_err(|err| distribution_error("set permissions of", path, &err))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Unpack the bundled modules of `archive` below `dest` and return the
/// directory holding them.
///
/// # Errors
///
/// Returns `BandsawError::Distribution` if reading or unpacking fails.
pub fn unpack_modules(archive: &Path, dest: &Path) -> Result<PathBuf> {
    let file = File::open(archive).map_err(|err| distribution_error("open", archive, &err))?;
    let mut tar = tar::Archive::new(file);
    let entries = tar
        .entries()
        .map_err(|err| distribution_error("read", archive, &err))?;
    let mut unpacked = 0_usize;
    for entry in entries {
        let mut entry = entry.map_err(|err| distribution_error("read", archive, &err))?;
        let in_modules = entry
            .path()
            .map_err(|err| distribution_error("read", archive, &err))?
            .starts_with(MODULES_DIR);
        if in_modules {
            entry
                .unpack_in(dest)
                .map_err(|err| distribution_error("unpack", archive, &err))?;
            unpacked += 1;
        }
    }
    let modules = dest.join(MODULES_DIR);
    fs::create_dir_all(&modules).map_err(|err| distribution_error("create", &modules, &err))?;
    debug!(entries = unpacked, dest = %modules.display(), "modules unpacked");
    Ok(modules)
}
