//! Error types shared across the crate.

use std::fmt::{Display, Formatter};

/// Shared crate result type.
pub type Result<T> = std::result::Result<T, BandsawError>;

/// Error enumeration covering every failure mode of advising a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BandsawError {
    /// Settings parsing or configuration validation failure.
    Config(String),
    /// No configuration is registered under the requested name.
    UnknownConfiguration(String),
    /// The configuration has no advice chain with the requested name.
    UnknownChain(String),
    /// The configuration has no task with the requested id.
    UnknownTask(String),
    /// A moderator transition was requested in a state that forbids it.
    IllegalState(String),
    /// An advice stopped the chain without handing control back.
    MisbehavingAdvice(String),
    /// Value encoding or decoding failure.
    Serialization(String),
    /// A decoded value names a type that was never registered.
    UnknownType(String),
    /// Attachment insertion or lookup failure.
    Attachment(String),
    /// Distribution archive build or unpack failure.
    Distribution(String),
    /// Out-of-process resumption failed.
    Subprocess(String),
    /// Transfer to or execution on a remote machine failed.
    Remote(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for BandsawError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::UnknownConfiguration(msg) => write!(f, "unknown configuration: {msg}"),
            Self::UnknownChain(msg) => write!(f, "unknown advice chain: {msg}"),
            Self::UnknownTask(msg) => write!(f, "unknown task: {msg}"),
            Self::IllegalState(msg) => write!(f, "illegal state: {msg}"),
            Self::MisbehavingAdvice(msg) => write!(f, "misbehaving advice: {msg}"),
            Self::Serialization(msg) => write!(f, "serialization: {msg}"),
            Self::UnknownType(msg) => write!(f, "unknown type: {msg}"),
            Self::Attachment(msg) => write!(f, "attachment: {msg}"),
            Self::Distribution(msg) => write!(f, "distribution: {msg}"),
            Self::Subprocess(msg) => write!(f, "subprocess: {msg}"),
            Self::Remote(msg) => write!(f, "remote: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for BandsawError {}

impl From<toml::de::Error> for BandsawError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid settings: {err}"))
    }
}

impl From<serde_json::Error> for BandsawError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("invalid json: {err}"))
    }
}

impl From<postcard::Error> for BandsawError {
    fn from(err: postcard::Error) -> Self {
        Self::Serialization(format!("invalid binary encoding: {err}"))
    }
}
