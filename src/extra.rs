//! Pluggable checks run after the built-in comparisons.
//!
//! A test case lists extra tests by reference. Each reference resolves to an
//! [`ExtraTest`] registered in-process under that exact name, or else to a
//! [`CommandCheck`] that runs the referenced file as a program.

use crate::capture::{self, ProcessTable};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

/// Timeout for a command-based check.
const COMMAND_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// A file the program was expected to produce, as read after the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    pub path: PathBuf,
    /// `None` if the file did not exist.
    pub content: Option<Vec<u8>>,
}

/// Everything an extra test may inspect about a finished run.
#[derive(Debug, Clone, Copy)]
pub struct ExtraTestContext<'a> {
    pub test_name: &'a str,
    pub workdir: &'a Path,
    pub recipe_dir: &'a Path,
    pub return_code: Option<i32>,
    pub stdout: &'a [u8],
    pub stderr: &'a [u8],
    pub output_files: &'a [OutputFile],
    pub processes: &'a ProcessTable,
}

/// Outcome of an extra test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub passed: bool,
    pub message: Option<String>,
}

impl Verdict {
    pub fn pass() -> Self {
        Self {
            passed: true,
            message: None,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: Some(message.into()),
        }
    }
}

/// A verdict-producing check over a finished run.
pub trait ExtraTest: Send + Sync {
    fn evaluate(&self, ctx: &ExtraTestContext<'_>) -> Verdict;
}

impl<F> ExtraTest for F
where
    F: Fn(&ExtraTestContext<'_>) -> Verdict + Send + Sync,
{
    fn evaluate(&self, ctx: &ExtraTestContext<'_>) -> Verdict {
        self(ctx)
    }
}

/// Named in-process checks.
#[derive(Default, Clone)]
pub struct ExtraTestRegistry {
    checks: HashMap<String, Arc<dyn ExtraTest>>,
}

impl ExtraTestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a check under `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, check: impl ExtraTest + 'static) {
        self.checks.insert(name.into(), Arc::new(check));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.checks.contains_key(name)
    }

    /// Resolve a reference declared in a recipe.
    pub fn resolve(&self, reference: &str, recipe_dir: &Path) -> Arc<dyn ExtraTest> {
        match self.checks.get(reference) {
            Some(check) => Arc::clone(check),
            None => Arc::new(CommandCheck::new(recipe_dir.join(reference))),
        }
    }
}

/// Runs an external program as a check.
///
/// The program runs in the working directory of the test and receives the
/// run as a JSON document on stdin, plus `CONTEST_TEST_NAME` and
/// `CONTEST_WORKDIR` in its environment. Exit status 0 passes; anything the
/// program prints becomes the verdict message.
#[derive(Debug, Clone)]
pub struct CommandCheck {
    program: PathBuf,
    timeout: Duration,
}

/// JSON document written to a command check's stdin.
#[derive(Serialize)]
struct CheckInput<'a> {
    test_name: &'a str,
    workdir: String,
    return_code: Option<i32>,
    stdout: String,
    stderr: String,
    output_files: Vec<CheckFile>,
}

#[derive(Serialize)]
struct CheckFile {
    path: String,
    content: Option<String>,
}

impl CommandCheck {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: COMMAND_CHECK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn input(ctx: &ExtraTestContext<'_>, workdir: &Path) -> serde_json::Result<String> {
        let input = CheckInput {
            test_name: ctx.test_name,
            workdir: workdir.display().to_string(),
            return_code: ctx.return_code,
            stdout: String::from_utf8_lossy(ctx.stdout).into_owned(),
            stderr: String::from_utf8_lossy(ctx.stderr).into_owned(),
            output_files: ctx
                .output_files
                .iter()
                .map(|f| CheckFile {
                    path: f.path.display().to_string(),
                    content: f
                        .content
                        .as_deref()
                        .map(|c| String::from_utf8_lossy(c).into_owned()),
                })
                .collect(),
        };
        serde_json::to_string(&input)
    }
}

impl ExtraTest for CommandCheck {
    fn evaluate(&self, ctx: &ExtraTestContext<'_>) -> Verdict {
        if !self.program.is_file() {
            return Verdict::fail(format!("extra test not found: {}", self.program.display()));
        }

        // Checks run inside the working directory and see it as an absolute path.
        let workdir =
            std::path::absolute(ctx.workdir).unwrap_or_else(|_| ctx.workdir.to_path_buf());
        let input = match Self::input(ctx, &workdir) {
            Ok(input) => input,
            Err(e) => return Verdict::fail(format!("failed to encode check input: {e}")),
        };

        tracing::debug!(program = %self.program.display(), "running extra test");
        let child = Command::new(&self.program)
            .current_dir(&workdir)
            .env("CONTEST_TEST_NAME", ctx.test_name)
            .env("CONTEST_WORKDIR", &workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                return Verdict::fail(format!(
                    "failed to run extra test {}: {e}",
                    self.program.display()
                ));
            }
        };

        let captured = match capture::run(child, vec![input], Some(self.timeout), ctx.processes) {
            Ok(captured) => captured,
            Err(e) => return Verdict::fail(format!("extra test {}: {e}", self.program.display())),
        };
        if captured.timed_out {
            return Verdict::fail(format!(
                "extra test timed out after {}s",
                self.timeout.as_secs_f64()
            ));
        }

        let mut message = String::from_utf8_lossy(&captured.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&captured.stderr);
        let stderr = stderr.trim();
        if !stderr.is_empty() {
            if !message.is_empty() {
                message.push('\n');
            }
            message.push_str(stderr);
        }

        match captured.exit_code {
            Some(0) => Verdict {
                passed: true,
                message: (!message.is_empty()).then_some(message),
            },
            code => {
                if message.is_empty() {
                    message = match code {
                        Some(code) => format!("exited with code {code}"),
                        None => "terminated by signal".to_string(),
                    };
                }
                Verdict::fail(message)
            }
        }
    }
}
