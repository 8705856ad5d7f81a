//! Tar container holding one saved session.
//!
//! Layout:
//!
//! ```text
//! session.json          {"configuration", "advice_chain", "ids", "run_id"}
//! task.dat              serialized task reference
//! execution.dat         serialized execution
//! context.dat           serialized context
//! result.dat            serialized result, null before the task ran
//! moderator.dat         serialized progress counters, null before initiate
//! attachments/<name>    raw attachment bytes
//! ```

use std::collections::BTreeMap;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::models::Attachments;
use crate::{BandsawError, Result};

pub(crate) const SESSION_ENTRY: &str = "session.json";
pub(crate) const TASK_ENTRY: &str = "task.dat";
pub(crate) const EXECUTION_ENTRY: &str = "execution.dat";
pub(crate) const CONTEXT_ENTRY: &str = "context.dat";
pub(crate) const RESULT_ENTRY: &str = "result.dat";
pub(crate) const MODERATOR_ENTRY: &str = "moderator.dat";
const ATTACHMENTS_PREFIX: &str = "attachments/";

/// Plain JSON header naming what the serialized parts belong to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SessionHeader {
    pub configuration: String,
    pub advice_chain: String,
    pub ids: String,
    pub run_id: String,
}

fn io_error(action: &str, err: &std::io::Error) -> BandsawError {
    BandsawError::Io(format!("failed to {action} session archive: {err}"))
}

/// Writes entries of a session archive in order.
pub(crate) struct ArchiveWriter<W: Write> {
    builder: tar::Builder<W>,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            builder: tar::Builder::new(writer),
        }
    }

    pub fn header(&mut self, header: &SessionHeader) -> Result<()> {
        let bytes = serde_json::to_vec(header)?;
        self.entry(SESSION_ENTRY, &bytes)
    }

    pub fn entry(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        self.builder
            .append_data(&mut header, name, bytes)
            .map_err(|err| io_error("write", &err))
    }

    pub fn attachments(&mut self, attachments: &Attachments) -> Result<()> {
        for (name, attachment) in attachments.iter() {
            let mut header = tar::Header::new_gnu();
            header.set_size(attachment.size()?);
            header.set_mode(0o644);
            self.builder
                .append_data(
                    &mut header,
                    format!("{ATTACHMENTS_PREFIX}{name}"),
                    attachment.open()?,
                )
                .map_err(|err| io_error("write", &err))?;
        }
        Ok(())
    }

    pub fn finish(self) -> Result<()> {
        let mut writer = self
            .builder
            .into_inner()
            .map_err(|err| io_error("finish", &err))?;
        writer.flush().map_err(|err| io_error("flush", &err))
    }
}

/// All entries of a session archive, read into memory.
#[derive(Debug, Default)]
pub(crate) struct ArchiveParts {
    entries: BTreeMap<String, Vec<u8>>,
}

impl ArchiveParts {
    pub fn read(reader: impl Read) -> Result<Self> {
        let mut archive = tar::Archive::new(reader);
        let mut entries = BTreeMap::new();
        for entry in archive.entries().map_err(|err| io_error("read", &err))? {
            let mut entry = entry.map_err(|err| io_error("read", &err))?;
            let path = entry
                .path()
                .map_err(|err| io_error("read", &err))?
                .to_string_lossy()
                .into_owned();
            let mut content = Vec::new();
            entry
                .read_to_end(&mut content)
                .map_err(|err| io_error("read", &err))?;
            entries.insert(path, content);
        }
        Ok(Self { entries })
    }

    pub fn header(&self) -> Result<SessionHeader> {
        Ok(serde_json::from_slice(self.entry(SESSION_ENTRY)?)?)
    }

    pub fn entry(&self, name: &str) -> Result<&[u8]> {
        self.entries
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| BandsawError::Serialization(format!("session archive misses {name}")))
    }

    pub fn attachments(&self) -> Result<Attachments> {
        let mut attachments = Attachments::new();
        for (path, content) in &self.entries {
            if let Some(name) = path.strip_prefix(ATTACHMENTS_PREFIX) {
                attachments.insert_archived(name, content.clone())?;
            }
        }
        Ok(attachments)
    }
}
