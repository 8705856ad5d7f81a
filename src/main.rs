#![forbid(unsafe_code)]

//! `bandsaw` resumes a saved session of the built-in configuration out of
//! process.
//!
//! Started by `SubprocessAdvice` as
//! `bandsaw <archive> --input <file> --output <file> --run-id <id>`.

use bandsaw::{builtin, worker, Result};

fn main() -> Result<()> {
    worker::main(builtin::registry())
}
