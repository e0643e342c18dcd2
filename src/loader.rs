//! Recipe file loader.
//!
//! Loads, validates and writes recipe files. The format is chosen by file
//! extension: `.yaml`/`.yml` or `.toml`.

use crate::executor::{check_test_name, resolve_executable};
use crate::schema::{ExpectedStream, Recipe, StreamMatch};
use std::path::{Path, PathBuf};

/// Error type for recipe loading operations.
#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    /// Failed to read or write the file.
    #[error("failed to access file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse or emit YAML.
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    /// Failed to parse TOML.
    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),
    /// Failed to emit TOML.
    #[error("failed to write TOML: {0}")]
    TomlWrite(#[from] toml::ser::Error),
    /// Unsupported file extension.
    #[error("unsupported file format: {0} (expected .yaml, .yml, or .toml)")]
    UnsupportedFormat(String),
}

/// File name used when recording into the current directory.
pub const DEFAULT_RECIPE_FILENAME: &str = "contest_recipe.yaml";

enum Format {
    Yaml,
    Toml,
}

fn format_of(path: &Path) -> Result<Format, LoadError> {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "yaml" | "yml" => Ok(Format::Yaml),
        "toml" => Ok(Format::Toml),
        other => Err(LoadError::UnsupportedFormat(other.to_string())),
    }
}

/// Load a recipe from a file path.
pub fn load_recipe(path: &Path) -> Result<Recipe, LoadError> {
    let format = format_of(path)?;
    let contents = std::fs::read_to_string(path)?;

    match format {
        Format::Yaml => Ok(serde_yaml::from_str(&contents)?),
        Format::Toml => Ok(toml::from_str(&contents)?),
    }
}

/// Write a recipe to a file path, replacing its contents.
pub fn save_recipe(path: &Path, recipe: &Recipe) -> Result<(), LoadError> {
    let contents = match format_of(path)? {
        Format::Yaml => serde_yaml::to_string(recipe)?,
        Format::Toml => toml::to_string(recipe)?,
    };
    std::fs::write(path, contents)?;
    Ok(())
}

/// Directory that relative paths in a recipe are resolved against.
pub fn recipe_dir(path: &Path) -> PathBuf {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::path::absolute(&dir).unwrap_or(dir)
}

/// Check a loaded recipe for problems that parsing cannot catch.
///
/// Returns one message per problem, prefixed by the test case it belongs to.
/// Extra tests named in `registered` are not looked up on disk.
pub fn check_recipe(recipe: &Recipe, recipe_dir: &Path, registered: &[&str]) -> Vec<String> {
    let mut problems = Vec::new();

    if let Err(e) = resolve_executable(&recipe.executable, recipe_dir) {
        problems.push(format!("recipe: {e}"));
    }

    for (name, case) in &recipe.test_cases {
        let mut problem = |message: String| problems.push(format!("{name}: {message}"));

        if let Err(e) = check_test_name(name) {
            problem(e.to_string());
        }

        if let Some(executable) = &case.executable
            && executable.trim().is_empty()
        {
            problem("executable is empty".to_string());
        }

        for resource in &case.resources {
            let src = recipe_dir.join(&resource.src);
            if !src.exists() {
                problem(format!("resource not found: {}", src.display()));
            }
        }

        for (label, stream) in [("stdout", &case.stdout), ("stderr", &case.stderr)] {
            if let Some(ExpectedStream::Structured(m)) = stream {
                check_stream_match(m, recipe_dir, &mut |message| {
                    problem(format!("{label}: {message}"))
                });
            }
        }

        for check in &case.ofstreams {
            let label = format!("ofstream {}", check.test_file.display());
            if check.exists.is_some() && (check.text.is_some() || check.file.is_some()) {
                problem(format!("{label}: `exists` ignores `text` and `file`"));
            }
            check_stream_match(&check.stream_match(), recipe_dir, &mut |message| {
                problem(format!("{label}: {message}"))
            });
        }

        for reference in &case.extra_tests {
            if !registered.contains(&reference.as_str()) && !recipe_dir.join(reference).is_file() {
                problem(format!("extra test not found: {reference}"));
            }
        }
    }

    problems
}

fn check_stream_match(m: &StreamMatch, recipe_dir: &Path, problem: &mut dyn FnMut(String)) {
    if m.text.is_some() && m.file.is_some() {
        problem("`text` and `file` cannot both be given".to_string());
    }
    if let Some(file) = &m.file {
        let path = recipe_dir.join(file);
        if !path.is_file() {
            problem(format!("reference file not found: {}", path.display()));
        }
    }
}
