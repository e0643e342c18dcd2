//! Match engine: compares expected output against captured bytes.
//!
//! Text comparison is line oriented. Lines are split on `\n`; a trailing
//! newline does not produce an extra empty line and a trailing `\r` is
//! dropped from every line. The same splitting is used for inline text,
//! line lists, reference files and actual output.

use crate::error::{Error, Result};
use crate::schema::{ExpectedStream, StreamMatch};
use std::borrow::Cow;
use std::fmt::Write as _;
use std::path::Path;

/// Outcome of a single comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    pub passed: bool,
    /// Human readable description of the mismatch.
    pub diff: Option<String>,
}

impl MatchResult {
    pub fn pass() -> Self {
        Self {
            passed: true,
            diff: None,
        }
    }

    pub fn fail(diff: impl Into<String>) -> Self {
        Self {
            passed: false,
            diff: Some(diff.into()),
        }
    }
}

/// Split content into lines without decoding it.
pub fn split_lines(content: &[u8]) -> Vec<&[u8]> {
    if content.is_empty() {
        return Vec::new();
    }
    content
        .strip_suffix(b"\n")
        .unwrap_or(content)
        .split(|b| *b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .collect()
}

/// Evaluate an expected stream against actual output.
///
/// `base_dir` is the directory file references are resolved against.
pub fn evaluate(expected: &ExpectedStream, actual: &[u8], base_dir: &Path) -> Result<MatchResult> {
    match expected {
        ExpectedStream::Text(text) => Ok(compare_lines(
            &split_lines(text.as_bytes()),
            &split_lines(actual),
            None,
        )),
        ExpectedStream::Lines(lines) => {
            let expected: Vec<&[u8]> = lines.iter().map(String::as_bytes).collect();
            Ok(compare_lines(&expected, &split_lines(actual), None))
        }
        ExpectedStream::Structured(m) => evaluate_structured(m, actual, base_dir),
    }
}

/// Evaluate the structured form against actual output as text.
pub fn evaluate_structured(m: &StreamMatch, actual: &[u8], base_dir: &Path) -> Result<MatchResult> {
    if let Some(result) = check_empty(m, actual) {
        return Ok(result);
    }

    let expected = resolve_expected(m, base_dir)?;
    let expected_lines = split_lines(&expected);
    let actual_lines = split_lines(actual);

    if !m.has_window() {
        return Ok(compare_lines(&expected_lines, &actual_lines, None));
    }

    let start = m.start.unwrap_or(0);
    tracing::debug!(start, count = ?m.count, "comparing line window");
    Ok(compare_lines(
        window(&expected_lines, m.start, m.count),
        window(&actual_lines, m.start, m.count),
        Some(start),
    ))
}

/// Evaluate the structured form against actual content as raw bytes.
pub fn evaluate_binary(m: &StreamMatch, actual: &[u8], base_dir: &Path) -> Result<MatchResult> {
    if let Some(result) = check_empty(m, actual) {
        return Ok(result);
    }
    if m.has_window() {
        tracing::warn!("start/count are ignored for binary comparisons");
    }

    let expected = resolve_expected(m, base_dir)?;
    if *expected == *actual {
        return Ok(MatchResult::pass());
    }

    let offset = expected
        .iter()
        .zip(actual)
        .position(|(e, a)| e != a)
        .unwrap_or_else(|| expected.len().min(actual.len()));
    Ok(MatchResult::fail(format!(
        "binary content differs at byte {offset} (expected {} bytes, got {} bytes)",
        expected.len(),
        actual.len()
    )))
}

/// Presence/absence check; `None` when the `empty` flag is not set.
fn check_empty(m: &StreamMatch, actual: &[u8]) -> Option<MatchResult> {
    let expect_empty = m.empty?;
    Some(match (expect_empty, actual.is_empty()) {
        (true, true) | (false, false) => MatchResult::pass(),
        (true, false) => MatchResult::fail(format!(
            "expected no output, got {} bytes",
            actual.len()
        )),
        (false, true) => MatchResult::fail("expected output, got none"),
    })
}

/// Expected content of a structured match: inline text, a reference file, or
/// nothing at all (which expects empty content).
fn resolve_expected<'a>(m: &'a StreamMatch, base_dir: &Path) -> Result<Cow<'a, [u8]>> {
    match (&m.text, &m.file) {
        (Some(_), Some(_)) => Err(Error::InvalidRecipe(
            "`text` and `file` cannot both be given".to_string(),
        )),
        (Some(text), None) => Ok(Cow::Borrowed(text.as_bytes())),
        (None, Some(file)) => {
            let path = base_dir.join(file);
            tracing::debug!(path = %path.display(), "reading expected content");
            std::fs::read(&path)
                .map(Cow::Owned)
                .map_err(|source| Error::ReferenceFile { path, source })
        }
        (None, None) => Ok(Cow::Borrowed(&[][..])),
    }
}

/// Restrict lines to `[start, start + count)`, clamped to the available lines.
fn window<'a, 'b>(lines: &'a [&'b [u8]], start: Option<usize>, count: Option<usize>) -> &'a [&'b [u8]] {
    let start = start.unwrap_or(0).min(lines.len());
    let end = match count {
        Some(count) => start.saturating_add(count).min(lines.len()),
        None => lines.len(),
    };
    &lines[start..end]
}

/// Compare two line slices byte for byte, including length.
///
/// `window_start` is the absolute index of the first line when a window was
/// requested, so diagnostics can name both positions. Lines are decoded
/// lossily only to render the diagnostic.
fn compare_lines(expected: &[&[u8]], actual: &[&[u8]], window_start: Option<usize>) -> MatchResult {
    let position = |index: usize| match window_start {
        Some(start) => format!("line {} (window index {index})", start + index + 1),
        None => format!("line {}", index + 1),
    };

    for (index, (e, a)) in expected.iter().zip(actual).enumerate() {
        if e != a {
            let (e, a) = (String::from_utf8_lossy(e), String::from_utf8_lossy(a));
            let column = first_difference(&e, &a);
            let mut diff = format!("{} differs\n", position(index));
            let _ = writeln!(diff, "  expected: \"{e}\"");
            let _ = writeln!(diff, "  received: \"{a}\"");
            let _ = write!(diff, "{}^", " ".repeat(13 + column));
            return MatchResult::fail(diff);
        }
    }

    if expected.len() == actual.len() {
        return MatchResult::pass();
    }

    let index = expected.len().min(actual.len());
    let diff = if expected.len() > actual.len() {
        format!(
            "expected {} lines, received {}; missing {}: \"{}\"",
            expected.len(),
            actual.len(),
            position(index),
            String::from_utf8_lossy(expected[index])
        )
    } else {
        format!(
            "expected {} lines, received {}; unexpected {}: \"{}\"",
            expected.len(),
            actual.len(),
            position(index),
            String::from_utf8_lossy(actual[index])
        )
    };
    MatchResult::fail(diff)
}

/// Character column of the first difference between two strings.
fn first_difference(a: &str, b: &str) -> usize {
    a.chars()
        .zip(b.chars())
        .position(|(x, y)| x != y)
        .unwrap_or_else(|| a.chars().count().min(b.chars().count()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn text(s: &str) -> ExpectedStream {
        ExpectedStream::Text(s.to_string())
    }

    fn lines(l: &[&str]) -> ExpectedStream {
        ExpectedStream::Lines(l.iter().map(|s| s.to_string()).collect())
    }

    fn structured(m: StreamMatch) -> ExpectedStream {
        ExpectedStream::Structured(m)
    }

    fn eval(expected: &ExpectedStream, actual: &str) -> MatchResult {
        evaluate(expected, actual.as_bytes(), Path::new(".")).unwrap()
    }

    // ==================== Raw Text / Lines ====================

    #[test]
    fn identical_text_passes() {
        assert!(eval(&text("hello\nworld\n"), "hello\nworld\n").passed);
    }

    #[test]
    fn differing_line_is_identified() {
        let result = eval(&text("a\nb\nc\n"), "a\nx\nc\n");
        assert!(!result.passed);
        let diff = result.diff.unwrap();
        assert!(diff.starts_with("line 2 differs"), "diff: {diff}");
        assert!(diff.contains("expected: \"b\""));
        assert!(diff.contains("received: \"x\""));
    }

    #[test]
    fn caret_points_at_first_differing_column() {
        let result = eval(&text("Hello Bob"), "Hello Rob");
        let diff = result.diff.unwrap();
        let caret_line = diff.lines().last().unwrap();
        assert_eq!(caret_line.find('^'), Some(13 + 6));
    }

    #[test]
    fn identical_lines_pass() {
        assert!(eval(&lines(&["one", "two"]), "one\ntwo\n").passed);
    }

    #[test]
    fn extra_actual_line_fails() {
        let result = eval(&lines(&["one"]), "one\ntwo\n");
        assert!(!result.passed);
        assert!(result.diff.unwrap().contains("unexpected line 2: \"two\""));
    }

    #[test]
    fn missing_actual_line_fails() {
        let result = eval(&text("one\ntwo\n"), "one\n");
        assert!(!result.passed);
        assert!(result.diff.unwrap().contains("missing line 2: \"two\""));
    }

    #[test]
    fn trailing_newline_is_not_a_line() {
        assert!(eval(&text("done"), "done\n").passed);
        assert!(eval(&text("done\n"), "done").passed);
    }

    #[test]
    fn blank_lines_are_significant() {
        assert!(!eval(&text("a\nb\n"), "a\n\nb\n").passed);
    }

    #[test]
    fn crlf_matches_lf() {
        assert!(eval(&text("a\nb\n"), "a\r\nb\r\n").passed);
    }

    #[test]
    fn carriage_return_stripped_without_trailing_newline() {
        assert!(eval(&text("a"), "a\r").passed);
        assert!(eval(&text("a\nb"), "a\r\nb\r").passed);
    }

    #[test]
    fn split_lines_handles_empty_and_blank_content() {
        assert!(split_lines(b"").is_empty());
        assert_eq!(split_lines(b"\n"), vec![&b""[..]]);
        assert_eq!(split_lines(b"a\n\nb"), vec![&b"a"[..], &b""[..], &b"b"[..]]);
    }

    #[test]
    fn differing_invalid_utf8_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("expected.txt"), b"ok\xff\n").unwrap();
        let m = StreamMatch {
            file: Some(PathBuf::from("expected.txt")),
            ..Default::default()
        };
        let result = evaluate_structured(&m, b"ok\xfe\n", dir.path()).unwrap();
        assert!(!result.passed);
        assert!(result.diff.unwrap().starts_with("line 1 differs"));

        let result = evaluate_structured(&m, b"ok\xff\n", dir.path()).unwrap();
        assert!(result.passed, "failures: {:?}", result.diff);
    }

    #[test]
    fn empty_expected_text_requires_empty_output() {
        assert!(eval(&text(""), "").passed);
        assert!(!eval(&text(""), "something\n").passed);
    }

    // ==================== Empty Flag ====================

    #[test]
    fn empty_true_ignores_other_fields() {
        let m = StreamMatch {
            text: Some("ignored".to_string()),
            file: Some(PathBuf::from("does/not/exist.txt")),
            empty: Some(true),
            ..Default::default()
        };
        assert!(eval(&structured(m.clone()), "").passed);
        let result = eval(&structured(m), "x");
        assert!(!result.passed);
        assert!(result.diff.unwrap().contains("expected no output"));
    }

    #[test]
    fn empty_false_requires_output() {
        let m = StreamMatch {
            empty: Some(false),
            ..Default::default()
        };
        assert!(eval(&structured(m.clone()), "anything").passed);
        assert!(!eval(&structured(m), "").passed);
    }

    // ==================== Windowing ====================

    #[test]
    fn window_compares_same_slice_of_both_sides() {
        let m = StreamMatch {
            text: Some("a\nb\nc\nd\ne\n".to_string()),
            start: Some(1),
            count: Some(2),
            ..Default::default()
        };
        assert!(eval(&structured(m.clone()), "a\nb\nc\nd\ne\n").passed);

        let result = eval(&structured(m.clone()), "a\nb\nx\nd\ne\n");
        assert!(!result.passed);
        assert!(
            result.diff.unwrap().starts_with("line 3 (window index 1) differs"),
        );

        // Lines outside the window are not compared.
        assert!(eval(&structured(m), "z\nb\nc\nz\nz\nz\n").passed);
    }

    #[test]
    fn window_start_only_runs_to_end() {
        let m = StreamMatch {
            text: Some("header\nbody\n".to_string()),
            start: Some(1),
            ..Default::default()
        };
        assert!(eval(&structured(m.clone()), "other header\nbody\n").passed);
        assert!(!eval(&structured(m), "other header\nbody\nextra\n").passed);
    }

    #[test]
    fn window_past_end_is_empty_not_error() {
        let m = StreamMatch {
            text: Some("a\n".to_string()),
            start: Some(10),
            count: Some(3),
            ..Default::default()
        };
        assert!(eval(&structured(m), "a\nb\n").passed);
    }

    #[test]
    fn window_count_only_takes_prefix() {
        let m = StreamMatch {
            text: Some("first\n".to_string()),
            count: Some(1),
            ..Default::default()
        };
        // The expected side only has one line; the actual side is cut to one.
        assert!(eval(&structured(m), "first\nsecond\n").passed);
    }

    // ==================== File References ====================

    #[test]
    fn file_reference_resolves_against_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("expected.txt"), "from file\n").unwrap();
        let m = StreamMatch {
            file: Some(PathBuf::from("expected.txt")),
            ..Default::default()
        };
        let result = evaluate(&structured(m), b"from file\n", dir.path()).unwrap();
        assert!(result.passed);
    }

    #[test]
    fn unreadable_file_reference_is_config_error() {
        let m = StreamMatch {
            file: Some(PathBuf::from("missing.txt")),
            ..Default::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let err = evaluate(&structured(m), b"", dir.path()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
        assert!(err.to_string().contains("missing.txt"));
    }

    #[test]
    fn text_and_file_together_is_config_error() {
        let m = StreamMatch {
            text: Some("a".to_string()),
            file: Some(PathBuf::from("a.txt")),
            ..Default::default()
        };
        let err = evaluate(&structured(m), b"a", Path::new(".")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn structured_without_content_expects_empty() {
        assert!(eval(&structured(StreamMatch::default()), "").passed);
        assert!(!eval(&structured(StreamMatch::default()), "x\n").passed);
    }

    // ==================== Binary ====================

    #[test]
    fn binary_compares_exact_bytes() {
        let m = StreamMatch {
            text: Some("a\r\nb".to_string()),
            ..Default::default()
        };
        assert!(evaluate_binary(&m, b"a\r\nb", Path::new(".")).unwrap().passed);

        // CRLF normalization does not apply to binary comparisons.
        let result = evaluate_binary(&m, b"a\nb", Path::new(".")).unwrap();
        assert!(!result.passed);
        assert!(result.diff.unwrap().contains("at byte 1"));
    }

    #[test]
    fn binary_length_mismatch_reports_common_prefix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blob.bin"), [0u8, 1, 2, 3]).unwrap();
        let m = StreamMatch {
            file: Some(PathBuf::from("blob.bin")),
            ..Default::default()
        };
        let result = evaluate_binary(&m, &[0, 1, 2], dir.path()).unwrap();
        assert!(!result.passed);
        assert_eq!(
            result.diff.unwrap(),
            "binary content differs at byte 3 (expected 4 bytes, got 3 bytes)"
        );
    }

    #[test]
    fn binary_respects_empty_flag() {
        let m = StreamMatch {
            empty: Some(true),
            ..Default::default()
        };
        assert!(evaluate_binary(&m, b"", Path::new(".")).unwrap().passed);
        assert!(!evaluate_binary(&m, b"\0", Path::new(".")).unwrap().passed);
    }
}
