//! Report formatting for suite results.

use crate::executor::TestResult;
use crate::runner::SuiteResult;
use std::fmt::Write as _;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable output with checkmarks
    #[default]
    Human,
    /// Machine-readable JSON output
    Json,
    /// JUnit XML output for CI systems
    Junit,
}

/// Render a suite result. `label` names the recipe in the report.
pub fn render(
    format: OutputFormat,
    label: &str,
    result: &SuiteResult,
    verbose: bool,
) -> serde_json::Result<String> {
    match format {
        OutputFormat::Human => Ok(format_human(label, result, verbose)),
        OutputFormat::Json => format_json(label, result),
        OutputFormat::Junit => Ok(format_junit_xml(label, result)),
    }
}

/// Format results as ✓/✗ lines followed by a summary.
pub fn format_human(label: &str, result: &SuiteResult, verbose: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\n{label}");

    for test in &result.tests {
        if test.passed {
            let _ = writeln!(out, "  ✓ {} ({:.2?})", test.name, test.duration);
            continue;
        }
        let _ = writeln!(out, "  ✗ {} ({:.2?})", test.name, test.duration);
        for failure in test.failures() {
            for line in failure.lines() {
                let _ = writeln!(out, "    {line}");
            }
        }
        if verbose {
            write_stream(&mut out, "stdout", &test.stdout);
            write_stream(&mut out, "stderr", &test.stderr);
        }
    }

    let _ = write!(out, "\n{} passed, {} failed", result.passed(), result.failed());
    if result.filtered_out > 0 {
        let _ = write!(out, ", {} filtered out", result.filtered_out);
    }
    if result.cancelled {
        out.push_str(" (interrupted)");
    }
    out.push('\n');
    out
}

fn write_stream(out: &mut String, name: &str, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    let _ = writeln!(out, "    {name}:");
    for line in String::from_utf8_lossy(bytes).lines() {
        let _ = writeln!(out, "      | {line}");
    }
}

/// Format results as a JSON document.
pub fn format_json(label: &str, result: &SuiteResult) -> serde_json::Result<String> {
    let output = serde_json::json!({
        "recipe": label,
        "passed": result.passed(),
        "failed": result.failed(),
        "filtered_out": result.filtered_out,
        "cancelled": result.cancelled,
        "duration": result.duration.as_secs_f64(),
        "tests": result.tests,
    });
    serde_json::to_string_pretty(&output)
}

/// Format results as JUnit XML.
///
/// Harness errors are reported as `<error>`, failed checks as `<failure>`.
pub fn format_junit_xml(label: &str, result: &SuiteResult) -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");

    let tests = result.tests.len();
    let errors = result.tests.iter().filter(|t| t.error.is_some()).count();
    let failures = result
        .tests
        .iter()
        .filter(|t| !t.passed && t.error.is_none())
        .count();
    let time = result.duration.as_secs_f64();
    let timestamp = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S");

    let _ = writeln!(
        xml,
        "<testsuites tests=\"{tests}\" failures=\"{failures}\" errors=\"{errors}\" time=\"{time:.3}\">"
    );
    let _ = writeln!(
        xml,
        "  <testsuite name=\"{}\" tests=\"{tests}\" failures=\"{failures}\" errors=\"{errors}\" skipped=\"{}\" time=\"{time:.3}\" timestamp=\"{timestamp}\">",
        escape_xml(label),
        result.filtered_out,
    );

    for test in &result.tests {
        write_testcase(&mut xml, label, test);
    }

    xml.push_str("  </testsuite>\n");
    xml.push_str("</testsuites>\n");
    xml
}

fn write_testcase(xml: &mut String, label: &str, test: &TestResult) {
    let _ = writeln!(
        xml,
        "    <testcase name=\"{}\" classname=\"{}\" time=\"{:.3}\">",
        escape_xml(&test.name),
        escape_xml(label),
        test.duration.as_secs_f64()
    );

    if !test.passed {
        let failures = test.failures();
        let message = failures.first().map(String::as_str).unwrap_or("Test failed");
        let element = if test.error.is_some() { "error" } else { "failure" };
        let _ = writeln!(xml, "      <{element} message=\"{}\">", escape_xml(message));
        for failure in &failures {
            let _ = writeln!(xml, "{}", escape_xml(failure));
        }
        let _ = writeln!(xml, "      </{element}>");
    }

    if !test.stdout.is_empty() {
        let _ = writeln!(
            xml,
            "      <system-out>{}</system-out>",
            escape_xml(&String::from_utf8_lossy(&test.stdout))
        );
    }
    if !test.stderr.is_empty() {
        let _ = writeln!(
            xml,
            "      <system-err>{}</system-err>",
            escape_xml(&String::from_utf8_lossy(&test.stderr))
        );
    }

    xml.push_str("    </testcase>\n");
}

/// Escape special XML characters.
fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
