#![forbid(unsafe_code)]

//! Advise task executions with interceptor chains and resume suspended
//! sessions in another process.

pub mod advice;
pub mod advices;
pub mod builtin;
pub mod config;
pub mod distribution;
pub mod errors;
pub mod identifier;
pub mod models;
pub mod moderator;
pub mod serialization;
pub mod session;
pub mod task;
pub mod worker;

pub use errors::{BandsawError, Result};
