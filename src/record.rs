//! Recording mode: turn one interactive run of a program into a test case.
//!
//! The command runs in the recipe directory. Every line typed on the
//! harness's stdin is forwarded to the program and remembered; stdout,
//! stderr and the exit code are captured. Files the program creates are
//! renamed to `contest_<file>` and become output file baselines.

use crate::capture::{self, POLL_INTERVAL, READER_GRACE};
use crate::executor::check_test_name;
use crate::loader::{self, LoadError};
use crate::schema::{ExpectedStream, OutputFileCheck, Recipe, StdinSpec, TestCase};
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::{ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Instant;

/// Prefix given to recorded output file baselines.
pub const BASELINE_PREFIX: &str = "contest_";

/// Error type for recording.
#[derive(thiserror::Error, Debug)]
pub enum RecordError {
    #[error("no command given")]
    EmptyCommand,
    #[error("invalid test case name: {0:?}")]
    InvalidName(String),
    #[error("{0} is already a test case, choose a new name")]
    DuplicateName(String),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// What to record and where to put it.
#[derive(Debug, Clone)]
pub struct RecordOptions {
    /// Name of the new test case.
    pub name: String,
    /// Program and arguments.
    pub command: Vec<String>,
    /// Directory the program runs in; also the recipe directory.
    pub dir: PathBuf,
    /// Recipe file, relative to `dir` unless absolute.
    pub recipe: PathBuf,
}

/// A recorded test case and where it was written.
#[derive(Debug)]
pub struct Recording {
    pub case: TestCase,
    pub recipe_path: PathBuf,
    /// Baseline files created from the program's output files.
    pub baselines: Vec<PathBuf>,
}

/// Run the command once, forwarding `input` line by line, and append the
/// resulting test case to the recipe (creating it if needed).
pub fn record<R>(options: &RecordOptions, input: R) -> Result<Recording, RecordError>
where
    R: BufRead + Send + 'static,
{
    let Some((program, args)) = options.command.split_first() else {
        return Err(RecordError::EmptyCommand);
    };
    if check_test_name(&options.name).is_err() {
        return Err(RecordError::InvalidName(options.name.clone()));
    }

    let recipe_path = options.dir.join(&options.recipe);
    let existing = if recipe_path.exists() {
        let recipe = loader::load_recipe(&recipe_path)?;
        if recipe.test_cases.contains_key(&options.name) {
            return Err(RecordError::DuplicateName(options.name.clone()));
        }
        Some(recipe)
    } else {
        None
    };

    let before = list_files(&options.dir)?;

    tracing::debug!(command = ?options.command, "recording");
    let mut child = Command::new(program)
        .args(args)
        .current_dir(&options.dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| RecordError::Spawn {
            program: program.clone(),
            source,
        })?;

    let stdout = child.stdout.take().map(capture::spawn_reader);
    let stderr = child.stderr.take().map(capture::spawn_reader);
    let mut forwarder = Forwarder::new(child.stdin.take(), spawn_line_reader(input));

    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        forwarder.step();
    };
    let stdin_lines = forwarder.finish();

    let deadline = Instant::now() + READER_GRACE;
    let stdout = capture::collect(stdout, deadline);
    let stderr = capture::collect(stderr, deadline);

    let after = list_files(&options.dir)?;
    let mut case = TestCase {
        return_code: status.code(),
        argv: args.to_vec(),
        ..Default::default()
    };
    if !stdin_lines.is_empty() {
        case.stdin = Some(StdinSpec::Lines(stdin_lines));
    }
    if !stdout.is_empty() {
        case.stdout = Some(ExpectedStream::Text(
            String::from_utf8_lossy(&stdout).into_owned(),
        ));
    }
    if !stderr.is_empty() {
        case.stderr = Some(ExpectedStream::Text(
            String::from_utf8_lossy(&stderr).into_owned(),
        ));
    }

    let mut baselines = Vec::new();
    for new_file in after.difference(&before) {
        if options.dir.join(new_file) == recipe_path {
            continue;
        }
        let baseline = baseline_path(new_file);
        tracing::debug!(file = %new_file.display(), baseline = %baseline.display(), "saving baseline");
        fs::rename(options.dir.join(new_file), options.dir.join(&baseline))?;
        case.ofstreams.push(OutputFileCheck {
            test_file: new_file.clone(),
            exists: None,
            binary: false,
            text: None,
            file: Some(baseline.clone()),
            empty: None,
            start: None,
            count: None,
        });
        baselines.push(baseline);
    }

    let mut recipe = match existing {
        Some(recipe) => {
            if *program != recipe.executable {
                case.executable = Some(program.clone());
            }
            recipe
        }
        None => Recipe {
            executable: program.clone(),
            ..Default::default()
        },
    };
    recipe.test_cases.insert(options.name.clone(), case.clone());
    loader::save_recipe(&recipe_path, &recipe)?;
    tracing::info!(name = %options.name, recipe = %recipe_path.display(), "recorded test case");

    Ok(Recording {
        case,
        recipe_path,
        baselines,
    })
}

/// Forwards input lines to the program and remembers those delivered.
struct Forwarder {
    stdin: Option<ChildStdin>,
    lines: Option<Receiver<String>>,
    recorded: Vec<String>,
}

impl Forwarder {
    fn new(stdin: Option<ChildStdin>, lines: Receiver<String>) -> Self {
        Self {
            stdin,
            lines: Some(lines),
            recorded: Vec::new(),
        }
    }

    /// Forward at most one line, waiting up to one poll interval for it.
    fn step(&mut self) {
        let Some(lines) = &self.lines else {
            thread::sleep(POLL_INTERVAL);
            return;
        };
        match lines.recv_timeout(POLL_INTERVAL) {
            Ok(line) => {
                let Some(pipe) = self.stdin.as_mut() else {
                    return;
                };
                let written = pipe
                    .write_all(line.as_bytes())
                    .and_then(|()| pipe.write_all(b"\n"))
                    .and_then(|()| pipe.flush());
                match written {
                    Ok(()) => self.recorded.push(line),
                    Err(e) => {
                        tracing::debug!("stopped forwarding input: {e}");
                        self.stdin = None;
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                // End of input: close the program's stdin.
                self.lines = None;
                self.stdin = None;
            }
        }
    }

    fn finish(self) -> Vec<String> {
        self.recorded
    }
}

/// Read lines on a background thread.
///
/// The thread is never joined; a terminal read may block past the end of
/// the recording.
fn spawn_line_reader<R: BufRead + Send + 'static>(input: R) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in input.lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn baseline_path(file: &Path) -> PathBuf {
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let baseline = format!("{BASELINE_PREFIX}{name}");
    match file.parent() {
        Some(parent) => parent.join(baseline),
        None => PathBuf::from(baseline),
    }
}

/// All regular files under `root`, relative to it.
fn list_files(root: &Path) -> io::Result<BTreeSet<PathBuf>> {
    let mut files = BTreeSet::new();
    collect_files(root, root, &mut files)?;
    Ok(files)
}

fn collect_files(root: &Path, dir: &Path, files: &mut BTreeSet<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(root, &path, files)?;
        } else if file_type.is_file()
            && let Ok(relative) = path.strip_prefix(root)
        {
            files.insert(relative.to_path_buf());
        }
    }
    Ok(())
}
