//! Ready-made advices.

pub mod ssh;
pub mod subprocess;

pub use ssh::{Remote, RemoteBackend, SshAdvice, SshCommandLineBackend};
pub use subprocess::SubprocessAdvice;
