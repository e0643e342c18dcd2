//! Test suite runner.
//!
//! Selects test cases by name, runs them sequentially or on a bounded pool
//! of worker threads, and collects results in declaration order.

use crate::capture::ProcessTable;
use crate::env::EnvSnapshot;
use crate::executor::{Executor, TestResult};
use crate::extra::ExtraTestRegistry;
use crate::schema::Recipe;
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Name filter built from inclusion and exclusion patterns.
///
/// Patterns are unanchored searches. With no inclusion patterns every name
/// is included; exclusion patterns are applied afterwards.
#[derive(Debug, Clone, Default)]
pub struct TestFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl TestFilter {
    pub fn new<I, E>(include: I, exclude: E) -> Result<Self, regex::Error>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        E: IntoIterator,
        E::Item: AsRef<str>,
    {
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    pub fn matches(&self, name: &str) -> bool {
        let included = self.include.is_empty() || self.include.iter().any(|re| re.is_match(name));
        included && !self.exclude.iter().any(|re| re.is_match(name))
    }
}

fn compile<I>(patterns: I) -> Result<Vec<Regex>, regex::Error>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    patterns.into_iter().map(|p| Regex::new(p.as_ref())).collect()
}

/// Settings for a suite run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Maximum number of test cases run at once.
    pub jobs: usize,
    /// Timeout for cases where neither the case nor the recipe sets one.
    pub timeout: Option<Duration>,
    /// Root for working directories (default `<recipe dir>/test_output`).
    pub output_dir: Option<PathBuf>,
    pub filter: TestFilter,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            jobs: 1,
            timeout: None,
            output_dir: None,
            filter: TestFilter::default(),
        }
    }
}

/// Result of running a recipe.
#[derive(Debug, Serialize)]
pub struct SuiteResult {
    pub tests: Vec<TestResult>,
    /// Cases excluded by the name filter.
    pub filtered_out: usize,
    /// The run was interrupted before every selected case finished.
    pub cancelled: bool,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

impl SuiteResult {
    pub fn passed(&self) -> usize {
        self.tests.iter().filter(|t| t.passed).count()
    }

    pub fn failed(&self) -> usize {
        self.tests.len() - self.passed()
    }

    /// Every run case passed and the run was not interrupted.
    pub fn success(&self) -> bool {
        !self.cancelled && self.tests.iter().all(|t| t.passed)
    }
}

/// Run the selected test cases of a recipe.
pub fn run_recipe(
    recipe: &Recipe,
    recipe_dir: &Path,
    options: &RunOptions,
    env: &EnvSnapshot,
    extra_tests: &ExtraTestRegistry,
    processes: &ProcessTable,
) -> SuiteResult {
    let start = Instant::now();

    let mut executor =
        Executor::new(recipe, recipe_dir, env, extra_tests).with_processes(processes.clone());
    if let Some(dir) = &options.output_dir {
        executor = executor.with_output_root(dir);
    }
    if let Some(timeout) = options.timeout {
        executor = executor.with_default_timeout(timeout);
    }

    let selected: Vec<_> = recipe
        .test_cases
        .iter()
        .filter(|(name, _)| options.filter.matches(name))
        .collect();
    let filtered_out = recipe.test_cases.len() - selected.len();
    tracing::debug!(selected = selected.len(), filtered_out, "selected test cases");

    let jobs = options.jobs.max(1).min(selected.len().max(1));
    let tests = if jobs == 1 {
        let mut tests = Vec::with_capacity(selected.len());
        for (name, case) in &selected {
            if processes.is_cancelled() {
                break;
            }
            tests.push(executor.execute(name, case));
        }
        tests
    } else {
        // Workers pull the next index; results are put back in order.
        let next = AtomicUsize::new(0);
        let slots: Mutex<Vec<Option<TestResult>>> =
            Mutex::new((0..selected.len()).map(|_| None).collect());

        thread::scope(|s| {
            for _ in 0..jobs {
                s.spawn(|| {
                    loop {
                        if processes.is_cancelled() {
                            break;
                        }
                        let index = next.fetch_add(1, Ordering::SeqCst);
                        let Some((name, case)) = selected.get(index) else {
                            break;
                        };
                        let result = executor.execute(name, case);
                        slots.lock().unwrap_or_else(|e| e.into_inner())[index] = Some(result);
                    }
                });
            }
        });

        slots
            .into_inner()
            .unwrap_or_else(|e| e.into_inner())
            .into_iter()
            .flatten()
            .collect()
    };

    SuiteResult {
        tests,
        filtered_out,
        cancelled: processes.is_cancelled(),
        duration: start.elapsed(),
    }
}
