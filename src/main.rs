use clap::{Parser, Subcommand};
use contest::capture::ProcessTable;
use contest::env::EnvSnapshot;
use contest::extra::ExtraTestRegistry;
use contest::loader::{self, DEFAULT_RECIPE_FILENAME};
use contest::record::{self, RecordOptions};
use contest::report::{self, OutputFormat};
use contest::runner::{self, RunOptions, TestFilter};
use contest::schema;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::thread;
use std::time::Duration;
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Every run case passed.
const EXIT_SUCCESS: u8 = 0;
/// At least one case failed.
const EXIT_FAILURE: u8 = 1;
/// The command line or the recipe could not be used.
const EXIT_USAGE: u8 = 2;
/// The run was interrupted by a signal.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "contest")]
#[command(about = "A recipe-driven test harness for console executables")]
#[command(version)]
struct Cli {
    /// Enable debug logging (and show captured output of failed tests)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the test cases of a recipe
    Run {
        /// Path to the recipe file
        recipe: PathBuf,
        /// Only run tests whose name matches one of these regexes
        #[arg(long = "filter", visible_alias = "filters", num_args = 1..)]
        filters: Vec<String>,
        /// Skip tests whose name matches one of these regexes
        #[arg(long = "exclude", visible_alias = "exclude-filters", num_args = 1..)]
        excludes: Vec<String>,
        /// Number of test cases run concurrently
        #[arg(short, long, default_value_t = 1)]
        jobs: usize,
        /// Timeout in seconds for cases that do not set one
        #[arg(long)]
        timeout: Option<u64>,
        /// Directory for per-test working directories (default: <recipe dir>/test_output)
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Output format
        #[arg(short, long, default_value = "human")]
        format: OutputFormat,
    },
    /// Check a recipe without running it
    Validate {
        /// Path to the recipe file
        recipe: PathBuf,
    },
    /// Record one run of a command as a new test case
    Record {
        /// Name of the new test case
        #[arg(long)]
        name: String,
        /// Recipe to append to (created if missing)
        #[arg(long, default_value = DEFAULT_RECIPE_FILENAME)]
        recipe: PathBuf,
        /// Command and arguments to record
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Output the recipe schema
    Schema,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match cli.command {
        Command::Run {
            recipe,
            filters,
            excludes,
            jobs,
            timeout,
            output_dir,
            format,
        } => {
            let filter = match TestFilter::new(&filters, &excludes) {
                Ok(filter) => filter,
                Err(e) => {
                    eprintln!("Error: invalid filter: {e}");
                    return ExitCode::from(EXIT_USAGE);
                }
            };
            let options = RunOptions {
                jobs,
                timeout: timeout.map(Duration::from_secs),
                output_dir,
                filter,
            };
            run(&recipe, &options, format, cli.verbose)
        }
        Command::Validate { recipe } => validate(&recipe),
        Command::Record {
            name,
            recipe,
            command,
        } => {
            let dir = match std::env::current_dir() {
                Ok(dir) => dir,
                Err(e) => {
                    eprintln!("Error: cannot determine current directory: {e}");
                    return ExitCode::from(EXIT_USAGE);
                }
            };
            let options = RecordOptions {
                name,
                command,
                dir,
                recipe,
            };
            match record::record(&options, std::io::BufReader::new(std::io::stdin())) {
                Ok(recording) => {
                    println!(
                        "Recorded {} in {}",
                        options.name,
                        recording.recipe_path.display()
                    );
                    for baseline in &recording.baselines {
                        println!("  baseline: {}", baseline.display());
                    }
                    EXIT_SUCCESS
                }
                Err(e) => {
                    eprintln!("Error: {e}");
                    EXIT_FAILURE
                }
            }
        }
        Command::Schema => {
            let schema = schema::generate_schema();
            match serde_json::to_string_pretty(&schema) {
                Ok(json) => {
                    println!("{json}");
                    EXIT_SUCCESS
                }
                Err(e) => {
                    eprintln!("Error: failed to serialize schema: {e}");
                    EXIT_FAILURE
                }
            }
        }
    };

    ExitCode::from(code)
}

fn init_tracing(verbose: bool) {
    let level = if verbose {
        tracing_subscriber::filter::LevelFilter::DEBUG
    } else {
        tracing_subscriber::filter::LevelFilter::WARN
    };
    let filter = tracing_subscriber::filter::Targets::new().with_default(level);

    let stderr_log_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .without_time()
        .with_filter(filter);

    if let Err(e) = tracing_subscriber::registry()
        .with(stderr_log_layer)
        .try_init()
    {
        eprintln!("warning: failed to initialize logging: {e}");
    }
}

fn run(recipe_path: &Path, options: &RunOptions, format: OutputFormat, verbose: bool) -> u8 {
    let recipe = match loader::load_recipe(recipe_path) {
        Ok(recipe) => recipe,
        Err(e) => {
            eprintln!("Error loading {}: {e}", recipe_path.display());
            return EXIT_USAGE;
        }
    };
    let recipe_dir = loader::recipe_dir(recipe_path);

    let env = EnvSnapshot::capture();
    let extra_tests = ExtraTestRegistry::new();
    let processes = ProcessTable::new();
    spawn_signal_handler(processes.clone());

    let result = runner::run_recipe(
        &recipe,
        &recipe_dir,
        options,
        &env,
        &extra_tests,
        &processes,
    );

    let label = recipe_path.display().to_string();
    match report::render(format, &label, &result, verbose) {
        Ok(output) => print!("{output}"),
        Err(e) => {
            eprintln!("Error: failed to format report: {e}");
            return EXIT_FAILURE;
        }
    }

    if result.cancelled {
        EXIT_INTERRUPTED
    } else if result.success() {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    }
}

fn validate(recipe_path: &Path) -> u8 {
    let recipe = match loader::load_recipe(recipe_path) {
        Ok(recipe) => recipe,
        Err(e) => {
            eprintln!("✗ {}: {e}", recipe_path.display());
            return EXIT_USAGE;
        }
    };

    let problems = loader::check_recipe(&recipe, &loader::recipe_dir(recipe_path), &[]);
    if problems.is_empty() {
        println!(
            "✓ {} ({} test cases)",
            recipe_path.display(),
            recipe.test_cases.len()
        );
        return EXIT_SUCCESS;
    }

    eprintln!("✗ {}", recipe_path.display());
    for problem in &problems {
        eprintln!("  {problem}");
    }
    eprintln!("\n{} problem(s) found", problems.len());
    EXIT_FAILURE
}

/// Kill running test processes on SIGINT or SIGTERM.
fn spawn_signal_handler(processes: ProcessTable) {
    thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::warn!("signal handling unavailable: {e}");
                return;
            }
        };
        runtime.block_on(wait_for_signal());
        processes.terminate_all();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            tracing::warn!("cannot listen for SIGTERM: {e}");
            interrupted().await;
            return;
        }
    };
    tokio::select! {
        _ = interrupted() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    interrupted().await;
}

/// Resolves on Ctrl-C; never resolves if Ctrl-C cannot be observed.
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("cannot listen for SIGINT: {e}");
        std::future::pending::<()>().await;
    }
}
