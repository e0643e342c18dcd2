//! Execution of a single test case.
//!
//! A case moves through `prepare → spawn → execute → collect → evaluate`.
//! Errors stop the case at the stage they occur and are recorded on the
//! result; they never escape to the caller.

use crate::capture::{self, Captured, ProcessTable};
use crate::env::EnvSnapshot;
use crate::error::{Error, ErrorKind, Result};
use crate::extra::{ExtraTestContext, ExtraTestRegistry, OutputFile};
use crate::matcher::{self, MatchResult};
use crate::schema::{OutputFileCheck, Recipe, TestCase};
use serde::Serialize;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Timeout used when neither the case, the recipe nor the caller sets one.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Directory under the recipe directory holding per-test working directories.
pub const DEFAULT_OUTPUT_DIR: &str = "test_output";

/// Lifecycle stage of a test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Prepare,
    Spawn,
    Execute,
    Collect,
    Evaluate,
    Done,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Prepare => "prepare",
            Stage::Spawn => "spawn",
            Stage::Execute => "execute",
            Stage::Collect => "collect",
            Stage::Evaluate => "evaluate",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

/// Result of one checked dimension of a test case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckOutcome {
    /// `return-code`, `stdout`, `stderr`, `ofstream:<path>` or `extra-test:<ref>`.
    pub dimension: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CheckOutcome {
    fn from_match(dimension: impl Into<String>, result: MatchResult) -> Self {
        Self {
            dimension: dimension.into(),
            passed: result.passed,
            message: result.diff,
        }
    }
}

/// A harness error that stopped or failed a test case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaseError {
    pub kind: ErrorKind,
    pub stage: Stage,
    pub message: String,
}

impl CaseError {
    fn new(stage: Stage, error: &Error) -> Self {
        Self {
            kind: error.kind(),
            stage,
            message: error.to_string(),
        }
    }
}

impl std::fmt::Display for CaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} during {}: {}", self.kind, self.stage, self.message)
    }
}

/// Result of running a single test case.
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub name: String,
    pub passed: bool,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
    /// Last stage reached.
    pub stage: Stage,
    pub checks: Vec<CheckOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CaseError>,
    pub return_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    pub timed_out: bool,
    #[serde(serialize_with = "serialize_lossy")]
    pub stdout: Vec<u8>,
    #[serde(serialize_with = "serialize_lossy")]
    pub stderr: Vec<u8>,
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

fn serialize_lossy<S>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}

impl TestResult {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            duration: Duration::ZERO,
            stage: Stage::Prepare,
            checks: Vec::new(),
            error: None,
            return_code: None,
            signal: None,
            timed_out: false,
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    /// One line per problem: the harness error first, then failed checks.
    pub fn failures(&self) -> Vec<String> {
        let mut failures = Vec::new();
        if let Some(error) = &self.error {
            failures.push(error.to_string());
        }
        for check in self.checks.iter().filter(|c| !c.passed) {
            match &check.message {
                Some(message) => failures.push(format!("{}: {message}", check.dimension)),
                None => failures.push(format!("{}: failed", check.dimension)),
            }
        }
        failures
    }

    pub fn check(&self, dimension: &str) -> Option<&CheckOutcome> {
        self.checks.iter().find(|c| c.dimension == dimension)
    }
}

/// Shared, read-only settings for executing the cases of one recipe.
pub struct Executor<'a> {
    recipe: &'a Recipe,
    recipe_dir: PathBuf,
    output_root: PathBuf,
    default_timeout: Duration,
    env: &'a EnvSnapshot,
    extra_tests: &'a ExtraTestRegistry,
    processes: ProcessTable,
}

impl<'a> Executor<'a> {
    pub fn new(
        recipe: &'a Recipe,
        recipe_dir: &Path,
        env: &'a EnvSnapshot,
        extra_tests: &'a ExtraTestRegistry,
    ) -> Self {
        Self {
            recipe,
            recipe_dir: recipe_dir.to_path_buf(),
            output_root: recipe_dir.join(DEFAULT_OUTPUT_DIR),
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            env,
            extra_tests,
            processes: ProcessTable::new(),
        }
    }

    /// Root under which each case gets `<root>/<test name>`.
    pub fn with_output_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.output_root = root.into();
        self
    }

    /// Timeout for cases where neither the case nor the recipe sets one.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Track children in `table` so they can be terminated from elsewhere.
    pub fn with_processes(mut self, table: ProcessTable) -> Self {
        self.processes = table;
        self
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    pub fn workdir(&self, name: &str) -> PathBuf {
        self.output_root.join(name)
    }

    /// Run one test case to completion.
    pub fn execute(&self, name: &str, case: &TestCase) -> TestResult {
        let span = tracing::info_span!("test", name);
        let _enter = span.enter();
        tracing::info!("starting");

        let start = Instant::now();
        let mut result = TestResult::new(name);
        if let Err(e) = self.run_stages(name, case, &mut result) {
            tracing::debug!(stage = %result.stage, "test case aborted: {e}");
            let error = CaseError::new(result.stage, &e);
            // A timeout recorded during execution stays the primary error.
            if result.error.is_some() {
                result.checks.push(CheckOutcome {
                    dimension: result.stage.to_string(),
                    passed: false,
                    message: Some(error.to_string()),
                });
            } else {
                result.error = Some(error);
            }
        }
        result.duration = start.elapsed();
        result.passed = result.error.is_none() && result.checks.iter().all(|c| c.passed);

        tracing::info!(passed = result.passed, duration = ?result.duration, "finished");
        result
    }

    fn run_stages(&self, name: &str, case: &TestCase, result: &mut TestResult) -> Result<()> {
        result.stage = Stage::Prepare;
        let workdir = self.prepare(name, case)?;

        result.stage = Stage::Spawn;
        let child = self.spawn(case, &workdir)?;

        result.stage = Stage::Execute;
        let timeout = self.timeout(case);
        let captured = capture::run(child, stdin_lines(case), Some(timeout), &self.processes)?;
        self.record_capture(&captured, result);
        if captured.timed_out {
            // Output is still evaluated for diagnosis.
            result.error = Some(CaseError::new(Stage::Execute, &Error::Timeout(timeout)));
        }

        result.stage = Stage::Collect;
        let output_files = collect_output_files(&case.ofstreams, &workdir);

        result.stage = Stage::Evaluate;
        self.evaluate(name, case, &workdir, &output_files, result)?;

        result.stage = Stage::Done;
        Ok(())
    }

    fn record_capture(&self, captured: &Captured, result: &mut TestResult) {
        result.return_code = captured.exit_code;
        result.signal = captured.signal;
        result.timed_out = captured.timed_out;
        result.stdout = captured.stdout.clone();
        result.stderr = captured.stderr.clone();
    }

    fn timeout(&self, case: &TestCase) -> Duration {
        case.timeout
            .or(self.recipe.timeout)
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout)
    }

    /// Create a fresh working directory and copy resources into it.
    fn prepare(&self, name: &str, case: &TestCase) -> Result<PathBuf> {
        check_test_name(name)?;
        let workdir = self.workdir(name);

        if workdir.exists() {
            tracing::debug!(path = %workdir.display(), "removing previous working directory");
            fs::remove_dir_all(&workdir).map_err(|source| Error::WorkDir {
                path: workdir.clone(),
                source,
            })?;
        }
        fs::create_dir_all(&workdir).map_err(|source| Error::WorkDir {
            path: workdir.clone(),
            source,
        })?;

        for resource in &case.resources {
            let src = self.recipe_dir.join(&resource.src);
            if !src.exists() {
                return Err(Error::MissingResource { path: src });
            }
            let dst = workdir.join(resource.destination());
            tracing::debug!(src = %src.display(), dst = %dst.display(), "copying resource");
            copy_resource(&src, &dst).map_err(|source| Error::CopyResource {
                src: src.clone(),
                dst: dst.clone(),
                source,
            })?;
        }

        Ok(workdir)
    }

    fn spawn(&self, case: &TestCase, workdir: &Path) -> Result<std::process::Child> {
        let executable = case.executable.as_deref().unwrap_or(&self.recipe.executable);
        let (program, leading) = resolve_executable(executable, &self.recipe_dir)?;
        let env = self.env.resolve(case.scrub_env, &case.env)?;

        tracing::debug!(
            program = %program,
            args = ?leading.iter().chain(&case.argv).collect::<Vec<_>>(),
            cwd = %workdir.display(),
            "spawning"
        );

        Command::new(&program)
            .args(&leading)
            .args(&case.argv)
            .current_dir(workdir)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| Error::Spawn { program, source })
    }

    fn evaluate(
        &self,
        name: &str,
        case: &TestCase,
        workdir: &Path,
        output_files: &[OutputFile],
        result: &mut TestResult,
    ) -> Result<()> {
        if let Some(expected) = case.return_code {
            let outcome = check_return_code(expected, result);
            result.checks.push(outcome);
        }

        if let Some(expected) = &case.stdout {
            let outcome = matcher::evaluate(expected, &result.stdout, &self.recipe_dir)?;
            result.checks.push(CheckOutcome::from_match("stdout", outcome));
        }

        if let Some(expected) = &case.stderr {
            let outcome = matcher::evaluate(expected, &result.stderr, &self.recipe_dir)?;
            result.checks.push(CheckOutcome::from_match("stderr", outcome));
        }

        for (check, file) in case.ofstreams.iter().zip(output_files) {
            let outcome = self.check_output_file(check, file)?;
            result.checks.push(outcome);
        }

        if !case.extra_tests.is_empty() {
            let ctx = ExtraTestContext {
                test_name: name,
                workdir,
                recipe_dir: &self.recipe_dir,
                return_code: result.return_code,
                stdout: &result.stdout,
                stderr: &result.stderr,
                output_files,
                processes: &self.processes,
            };
            let mut outcomes = Vec::with_capacity(case.extra_tests.len());
            for reference in &case.extra_tests {
                let verdict = self
                    .extra_tests
                    .resolve(reference, &self.recipe_dir)
                    .evaluate(&ctx);
                outcomes.push(CheckOutcome {
                    dimension: format!("extra-test:{reference}"),
                    passed: verdict.passed,
                    message: verdict.message,
                });
            }
            result.checks.extend(outcomes);
        }

        Ok(())
    }

    fn check_output_file(&self, check: &OutputFileCheck, file: &OutputFile) -> Result<CheckOutcome> {
        let dimension = format!("ofstream:{}", check.test_file.display());

        if let Some(expect_exists) = check.exists {
            let exists = file.path.exists();
            let message = match (expect_exists, exists) {
                (true, false) => Some(format!("expected file to exist: {}", file.path.display())),
                (false, true) => Some(format!("expected file not to exist: {}", file.path.display())),
                _ => None,
            };
            return Ok(CheckOutcome {
                dimension,
                passed: message.is_none(),
                message,
            });
        }

        let Some(content) = &file.content else {
            return Ok(CheckOutcome {
                dimension,
                passed: false,
                message: Some(format!("file not found: {}", file.path.display())),
            });
        };

        let expected = check.stream_match();
        let outcome = if check.binary {
            matcher::evaluate_binary(&expected, content, &self.recipe_dir)?
        } else {
            matcher::evaluate_structured(&expected, content, &self.recipe_dir)?
        };
        Ok(CheckOutcome::from_match(dimension, outcome))
    }
}

fn check_return_code(expected: i32, result: &TestResult) -> CheckOutcome {
    let message = match (result.return_code, result.signal) {
        (Some(actual), _) if actual == expected => None,
        (Some(actual), _) => Some(format!("expected {expected}, got {actual}")),
        (None, Some(signal)) => Some(format!("expected {expected}, terminated by signal {signal}")),
        (None, None) => Some(format!("expected {expected}, process did not exit normally")),
    };
    CheckOutcome {
        dimension: "return-code".to_string(),
        passed: message.is_none(),
        message,
    }
}

fn stdin_lines(case: &TestCase) -> Vec<String> {
    case.stdin.as_ref().map(|s| s.lines()).unwrap_or_default()
}

/// Read every output file that needs its content.
///
/// Files with an `exists` check are only stat'ed later, so they are not read.
fn collect_output_files(checks: &[OutputFileCheck], workdir: &Path) -> Vec<OutputFile> {
    checks
        .iter()
        .map(|check| {
            let path = check.resolve(workdir);
            let content = if check.exists.is_some() {
                None
            } else {
                match fs::read(&path) {
                    Ok(content) => Some(content),
                    Err(e) => {
                        tracing::debug!(path = %path.display(), "output file unreadable: {e}");
                        None
                    }
                }
            };
            OutputFile { path, content }
        })
        .collect()
}

/// Reject names that would place the working directory outside the output root.
pub fn check_test_name(name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(Error::InvalidRecipe(format!(
            "test case name cannot be used as a directory name: {name:?}"
        ))),
    }
}

/// Split an executable string into a program and its leading arguments.
///
/// The program is made absolute when it names a file relative to the recipe
/// directory. Otherwise, when it is a launcher whose first argument names
/// such a file (`python3 main.py`), that argument is made absolute instead,
/// and the program is left for `PATH` lookup.
pub fn resolve_executable(executable: &str, recipe_dir: &Path) -> Result<(String, Vec<String>)> {
    let mut tokens = executable.split_whitespace().map(str::to_string);
    let Some(mut program) = tokens.next() else {
        return Err(Error::InvalidRecipe("executable is empty".to_string()));
    };
    let mut leading: Vec<String> = tokens.collect();

    let local = recipe_dir.join(&program);
    if local.is_file() {
        program = local.display().to_string();
    } else if let Some(script) = leading.first_mut() {
        let local = recipe_dir.join(&*script);
        if local.is_file() {
            *script = local.display().to_string();
        }
    }
    Ok((program, leading))
}

/// Copy a file, or a directory recursively, creating parent directories.
fn copy_resource(src: &Path, dst: &Path) -> std::io::Result<()> {
    if src.is_dir() {
        fs::create_dir_all(dst)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_resource(&entry.path(), &dst.join(entry.file_name()))?;
        }
        return Ok(());
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dst).map(|_| ())
}
