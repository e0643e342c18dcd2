//! Recipe-driven test harness for console executables.
//!
//! A recipe names an executable and a set of test cases. Each case runs the
//! executable in its own working directory with the configured arguments,
//! input and environment; its output streams, exit code and produced files
//! are then compared against expectations.

pub mod capture;
pub mod env;
pub mod error;
pub mod executor;
pub mod extra;
pub mod loader;
pub mod matcher;
pub mod record;
pub mod report;
pub mod runner;
pub mod schema;

pub use error::{Error, ErrorKind, Result};
