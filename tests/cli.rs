//! Integration tests for the contest command line.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::time::Instant;
use tempfile::TempDir;

fn contest_cmd() -> Command {
    Command::new(env!("CARGO_BIN_EXE_contest"))
}

/// Write a recipe into a fresh temp directory.
fn recipe_dir(recipe: &str) -> TempDir {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("recipe.yaml"), recipe).unwrap();
    temp_dir
}

fn run_recipe(dir: &Path, args: &[&str]) -> Output {
    contest_cmd()
        .arg("run")
        .arg(dir.join("recipe.yaml"))
        .args(args)
        .output()
        .unwrap()
}

fn describe(output: &Output) -> String {
    format!(
        "status: {:?}\nstdout: {}\nstderr: {}",
        output.status,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

const GREETER: &str = r#"
executable: sh
test-cases:
  greets:
    argv: [-c, 'read name; echo "Hello $name"']
    stdin: Bob
    stdout: "Hello Bob\n"
    return-code: 0
  counts_lines:
    argv: [-c, 'printf "a\nb\nc\nd\ne\n"']
    stdout:
      text: "x\nb\nc\ny\n"
      start: 1
      count: 2
  writes_file:
    argv: [-c, 'echo 42 > answer.txt']
    ofstreams:
      - test-file: answer.txt
        text: "42\n"
      - test-file: other.txt
        exists: false
"#;

#[test]
fn test_passing_recipe_exits_zero() {
    let dir = recipe_dir(GREETER);
    let output = run_recipe(dir.path(), &[]);

    assert_eq!(output.status.code(), Some(0), "{}", describe(&output));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("✓ greets"));
    assert!(stdout.contains("✓ counts_lines"));
    assert!(stdout.contains("3 passed, 0 failed"));
    assert!(dir.path().join("test_output/writes_file/answer.txt").exists());
}

#[test]
fn test_failing_case_exits_one() {
    let dir = recipe_dir(
        r#"
executable: sh
test-cases:
  wrong_output:
    argv: [-c, 'echo actual']
    stdout: "expected\n"
  fine:
    argv: [-c, 'exit 0']
    return-code: 0
"#,
    );
    let output = run_recipe(dir.path(), &[]);

    assert_eq!(output.status.code(), Some(1), "{}", describe(&output));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("✗ wrong_output"));
    assert!(stdout.contains("expected: \"expected\""));
    assert!(stdout.contains("received: \"actual\""));
    assert!(stdout.contains("1 passed, 1 failed"));
}

#[test]
fn test_window_slices_expected_text_too() {
    let dir = recipe_dir(
        r#"
executable: sh
test-cases:
  window_only_text:
    argv: [-c, 'printf "a\nb\nc\nd\n"']
    stdout:
      text: "b\nc\n"
      start: 1
      count: 2
"#,
    );
    let output = run_recipe(dir.path(), &[]);

    assert_eq!(output.status.code(), Some(1), "{}", describe(&output));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("✗ window_only_text"));
    assert!(stdout.contains("line 2 (window index 0) differs"));
    assert!(stdout.contains("expected: \"c\""));
    assert!(stdout.contains("received: \"b\""));
}

#[test]
fn test_filters_select_cases() {
    let recipe = r#"
executable: sh
test-cases:
  foo_tracking:
    argv: [-c, 'true']
  bar:
    argv: [-c, 'true']
  foo_other:
    argv: [-c, 'true']
"#;
    let dir = recipe_dir(recipe);

    let output = run_recipe(dir.path(), &["--filter", "tracking", "--format", "json"]);
    assert_eq!(output.status.code(), Some(0), "{}", describe(&output));
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let names: Vec<_> = json["tests"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["foo_tracking"]);
    assert_eq!(json["filtered_out"], 2);

    let output = run_recipe(dir.path(), &["--exclude-filters", "foo", "--format", "json"]);
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["tests"].as_array().unwrap().len(), 1);
    assert_eq!(json["tests"][0]["name"], "bar");
}

#[test]
fn test_invalid_filter_is_usage_error() {
    let dir = recipe_dir(GREETER);
    let output = run_recipe(dir.path(), &["--filter", "("]);
    assert_eq!(output.status.code(), Some(2), "{}", describe(&output));
}

#[test]
fn test_unloadable_recipe_is_usage_error() {
    let dir = recipe_dir("executable: [unclosed");
    let output = run_recipe(dir.path(), &[]);
    assert_eq!(output.status.code(), Some(2), "{}", describe(&output));
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid YAML"));
}

#[test]
fn test_timeout_from_command_line() {
    let dir = recipe_dir(
        r#"
executable: sleep
test-cases:
  hangs:
    argv: [30]
"#,
    );
    let start = Instant::now();
    let output = run_recipe(dir.path(), &["--timeout", "1", "--format", "json"]);

    assert!(start.elapsed().as_secs() < 15);
    assert_eq!(output.status.code(), Some(1), "{}", describe(&output));
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["tests"][0]["timed_out"], true);
    assert_eq!(json["tests"][0]["error"]["kind"], "execution");
}

#[test]
fn test_parallel_jobs_keep_declaration_order() {
    let dir = recipe_dir(
        r#"
executable: sh
test-cases:
  first:
    argv: [-c, 'sleep 0.3']
  second:
    argv: [-c, 'sleep 0.3']
  third:
    argv: [-c, 'sleep 0.3']
"#,
    );
    let start = Instant::now();
    let output = run_recipe(dir.path(), &["--jobs", "3", "--format", "json"]);
    let elapsed = start.elapsed();

    assert_eq!(output.status.code(), Some(0), "{}", describe(&output));
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let names: Vec<_> = json["tests"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["first", "second", "third"]);
    // Serial execution would take at least 0.9s.
    assert!(
        elapsed.as_secs_f64() < 0.85,
        "Cases took {:.2}s to run with --jobs 3",
        elapsed.as_secs_f64()
    );
}

#[test]
fn test_junit_output() {
    let dir = recipe_dir(GREETER);
    let output = run_recipe(dir.path(), &["--format", "junit"]);

    assert_eq!(output.status.code(), Some(0), "{}", describe(&output));
    let xml = String::from_utf8_lossy(&output.stdout);
    assert!(xml.contains("<testsuites tests=\"3\" failures=\"0\" errors=\"0\""));
    assert!(xml.contains("<testcase name=\"greets\""));
}

#[test]
fn test_output_dir_option() {
    let dir = recipe_dir(GREETER);
    let out = TempDir::new().unwrap();
    let output = run_recipe(
        dir.path(),
        &["--output-dir", out.path().to_str().unwrap()],
    );

    assert_eq!(output.status.code(), Some(0), "{}", describe(&output));
    assert!(out.path().join("writes_file/answer.txt").exists());
    assert!(!dir.path().join("test_output").exists());
}

#[test]
fn test_validate() {
    let dir = recipe_dir(GREETER);
    let output = contest_cmd()
        .arg("validate")
        .arg(dir.path().join("recipe.yaml"))
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0), "{}", describe(&output));
    assert!(String::from_utf8_lossy(&output.stdout).contains("(3 test cases)"));

    let bad = recipe_dir(
        r#"
executable: prog
test-cases:
  needs_data:
    resources:
      - src: data.txt
"#,
    );
    let output = contest_cmd()
        .arg("validate")
        .arg(bad.path().join("recipe.yaml"))
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1), "{}", describe(&output));
    assert!(String::from_utf8_lossy(&output.stderr).contains("needs_data: resource not found"));
}

#[test]
fn test_schema_is_json() {
    let output = contest_cmd().arg("schema").output().unwrap();
    assert!(output.status.success());
    let schema: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(schema["properties"]["test-cases"].is_object());
}

#[test]
fn test_record_then_run() {
    let dir = TempDir::new().unwrap();
    let mut child = contest_cmd()
        .current_dir(dir.path())
        .args(["record", "--name", "shout", "--", "sh", "-c"])
        .arg("read word; echo \"$word!\"; echo \"$word\" > word.txt")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child.stdin.take().unwrap().write_all(b"hey\n").unwrap();
    let output = child.wait_with_output().unwrap();
    assert_eq!(output.status.code(), Some(0), "{}", describe(&output));

    let recipe_path = dir.path().join("contest_recipe.yaml");
    let recipe = fs::read_to_string(&recipe_path).unwrap();
    assert!(recipe.contains("shout:"), "recipe: {recipe}");
    assert!(dir.path().join("contest_word.txt").exists());

    let output = contest_cmd()
        .arg("run")
        .arg(&recipe_path)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0), "{}", describe(&output));
    assert!(String::from_utf8_lossy(&output.stdout).contains("✓ shout"));
}
