//! Files attached to a session.
//!
//! Attachments can only be added, never replaced or removed. Names must be
//! plain file names without directories because each attachment is stored
//! as `attachments/<name>` inside the session archive.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use crate::{BandsawError, Result};

/// A single attached file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachment {
    /// A file on the local file system.
    File(PathBuf),
    /// Content loaded from a session archive.
    Archived(Vec<u8>),
}

impl Attachment {
    /// Open the attachment for reading.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Io` if a file-backed attachment cannot be
    /// opened.
    pub fn open(&self) -> Result<Box<dyn Read + '_>> {
        match self {
            Self::File(path) => {
                let file = File::open(path).map_err(|err| {
                    BandsawError::Io(format!(
                        "cannot open attachment {}: {err}",
                        path.display()
                    ))
                })?;
                Ok(Box::new(file))
            }
            Self::Archived(content) => Ok(Box::new(Cursor::new(content.as_slice()))),
        }
    }

    /// Size of the attachment in bytes.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Io` if a file-backed attachment cannot be
    /// inspected.
    pub fn size(&self) -> Result<u64> {
        match self {
            Self::File(path) => std::fs::metadata(path)
                .map(|meta| meta.len())
                .map_err(|err| {
                    BandsawError::Io(format!(
                        "cannot stat attachment {}: {err}",
                        path.display()
                    ))
                }),
            Self::Archived(content) => Ok(content.len() as u64),
        }
    }

    /// Read the whole attachment into memory.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Io` if reading fails.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.open()?
            .read_to_end(&mut buffer)
            .map_err(|err| BandsawError::Io(format!("cannot read attachment: {err}")))?;
        Ok(buffer)
    }
}

/// Append-only mapping of attachment names to files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attachments {
    items: BTreeMap<String, Attachment>,
}

impl Attachments {
    /// Create an empty container.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an existing file under `name`.
    ///
    /// # Errors
    ///
    /// Returns `BandsawError::Attachment` if `name` is already taken or is
    /// not a plain file name, or if `path` does not exist or is not a file.
    pub fn insert(&mut self, name: &str, path: impl AsRef<Path>) -> Result<()> {
        self.check_name(name)?;
        let path = path.as_ref();
        if !path.exists() {
            return Err(BandsawError::Attachment(format!(
                "file does not exist: {}",
                path.display()
            )));
        }
        if !path.is_file() {
            return Err(BandsawError::Attachment(format!(
                "path is not a file: {}",
                path.display()
            )));
        }
        self.items
            .insert(name.to_owned(), Attachment::File(path.to_path_buf()));
        Ok(())
    }

    /// Add content that was read back from a session archive.
    ///
    /// # Errors
    ///
    /// Same name rules as [`Attachments::insert`].
    pub fn insert_archived(&mut self, name: &str, content: Vec<u8>) -> Result<()> {
        self.check_name(name)?;
        self.items
            .insert(name.to_owned(), Attachment::Archived(content));
        Ok(())
    }

    /// Look up an attachment.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Attachment> {
        self.items.get(name)
    }

    /// Whether an attachment with `name` exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.items.contains_key(name)
    }

    /// Number of attachments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether there are no attachments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterate over attachments in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Attachment)> {
        self.items.iter()
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(BandsawError::Attachment(format!(
                "invalid attachment name '{name}'"
            )));
        }
        if self.items.contains_key(name) {
            return Err(BandsawError::Attachment(format!(
                "attachment '{name}' does already exist"
            )));
        }
        Ok(())
    }
}
