//! Schema definitions for contest recipes.
//!
//! A recipe names the executable under test and an ordered set of test
//! cases. Recipes are written in YAML (or TOML) and deserialized into these
//! types before anything is run.

use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Root document of a recipe file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub struct Recipe {
    /// Executable used by every test case unless overridden.
    ///
    /// May include a launcher, e.g. `python3 main.py`; the string is split on
    /// whitespace and the remaining tokens become leading arguments.
    pub executable: String,

    /// Default timeout in seconds for every test case.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Test cases keyed by their unique name, in declaration order.
    #[serde(default, deserialize_with = "unique_test_cases")]
    #[schemars(with = "IndexMap<String, TestCase>")]
    pub test_cases: IndexMap<String, TestCase>,
}

/// A single named scenario: inputs, environment and expected outputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct TestCase {
    /// Executable override for this case.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,

    /// Start from an empty environment instead of inheriting the ambient one.
    #[serde(default, skip_serializing_if = "is_false")]
    pub scrub_env: bool,

    /// Environment variables set for this case (wins over the ambient environment).
    #[serde(
        default,
        deserialize_with = "scalar_string_map",
        skip_serializing_if = "IndexMap::is_empty"
    )]
    #[schemars(with = "IndexMap<String, String>")]
    pub env: IndexMap<String, String>,

    /// Files or directories copied into the working directory before the run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Resource>,

    /// Command line arguments.
    #[serde(
        default,
        deserialize_with = "scalar_strings",
        skip_serializing_if = "Vec::is_empty"
    )]
    #[schemars(with = "Vec<String>")]
    pub argv: Vec<String>,

    /// Standard input fed to the program, one line at a time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<StdinSpec>,

    /// Timeout in seconds (overrides the recipe default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Expected exit code.
    #[serde(default, alias = "returncode", skip_serializing_if = "Option::is_none")]
    pub return_code: Option<i32>,

    /// Expected standard output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<ExpectedStream>,

    /// Expected standard error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<ExpectedStream>,

    /// Files the program is expected to produce.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ofstreams: Vec<OutputFileCheck>,

    /// References to additional checks run after the built-in comparisons.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_tests: Vec<String>,
}

/// A resource copy directive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Resource {
    /// Source path, relative to the recipe directory.
    pub src: PathBuf,

    /// Destination path, relative to the working directory.
    /// Defaults to the file name of `src`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<PathBuf>,
}

impl Resource {
    /// Destination relative to the working directory.
    pub fn destination(&self) -> PathBuf {
        match &self.dst {
            Some(dst) => dst.clone(),
            None => self
                .src
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| self.src.clone()),
        }
    }
}

/// Standard input: a text block or an explicit sequence of lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum StdinSpec {
    /// A block of text; each line is written separately.
    Text(
        #[serde(deserialize_with = "scalar_string")]
        #[schemars(with = "String")]
        String,
    ),
    /// Lines written one by one, flushing in between.
    Lines(
        #[serde(deserialize_with = "scalar_strings")]
        #[schemars(with = "Vec<String>")]
        Vec<String>,
    ),
}

impl StdinSpec {
    /// The lines to write, without terminators.
    pub fn lines(&self) -> Vec<String> {
        match self {
            StdinSpec::Text(text) => text.lines().map(str::to_owned).collect(),
            StdinSpec::Lines(lines) => lines.clone(),
        }
    }
}

/// Expected content of an output stream.
///
/// The form is chosen by the shape of the value: a string, a list of lines,
/// or a mapping with matching options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum ExpectedStream {
    /// Exact text.
    Text(
        #[serde(deserialize_with = "scalar_string")]
        #[schemars(with = "String")]
        String,
    ),
    /// Exact lines.
    Lines(
        #[serde(deserialize_with = "scalar_strings")]
        #[schemars(with = "Vec<String>")]
        Vec<String>,
    ),
    /// Structured match with windowing and file references.
    Structured(StreamMatch),
}

/// Structured matching options for a stream or file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct StreamMatch {
    /// Inline expected text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// File holding the expected text, relative to the recipe directory.
    #[serde(default, alias = "base-file", skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    /// Presence check only: `true` expects no output, `false` expects some.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty: Option<bool>,

    /// First line (0-based) of the compared window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<usize>,

    /// Number of lines in the compared window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

impl StreamMatch {
    pub fn has_window(&self) -> bool {
        self.start.is_some() || self.count.is_some()
    }
}

/// Expected state of a file produced by the program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct OutputFileCheck {
    /// File to check, absolute or relative to the working directory.
    pub test_file: PathBuf,

    /// Only check presence (`true`) or absence (`false`) of the file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exists: Option<bool>,

    /// Compare raw bytes instead of lines.
    #[serde(default, skip_serializing_if = "is_false")]
    pub binary: bool,

    /// Inline expected text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// File holding the expected content, relative to the recipe directory.
    #[serde(default, alias = "base-file", skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    /// Presence check on the file content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty: Option<bool>,

    /// First line (0-based) of the compared window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<usize>,

    /// Number of lines in the compared window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

impl OutputFileCheck {
    /// The content expectation of this check, as a stream match.
    pub fn stream_match(&self) -> StreamMatch {
        StreamMatch {
            text: self.text.clone(),
            file: self.file.clone(),
            empty: self.empty,
            start: self.start,
            count: self.count,
        }
    }

    /// Resolve the checked path against a working directory.
    pub fn resolve(&self, workdir: &Path) -> PathBuf {
        workdir.join(&self.test_file)
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A YAML/TOML scalar accepted where a string is expected.
#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<Scalar> for String {
    fn from(scalar: Scalar) -> String {
        match scalar {
            Scalar::Str(s) => s,
            Scalar::Int(i) => i.to_string(),
            Scalar::Float(f) => f.to_string(),
            Scalar::Bool(b) => b.to_string(),
        }
    }
}

fn scalar_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Scalar::deserialize(deserializer).map(String::from)
}

fn scalar_strings<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = Vec::<Scalar>::deserialize(deserializer)?;
    Ok(values.into_iter().map(String::from).collect())
}

fn scalar_string_map<'de, D>(deserializer: D) -> Result<IndexMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = IndexMap::<String, Scalar>::deserialize(deserializer)?;
    Ok(values.into_iter().map(|(k, v)| (k, v.into())).collect())
}

/// Deserialize the test case mapping, rejecting repeated names.
fn unique_test_cases<'de, D>(deserializer: D) -> Result<IndexMap<String, TestCase>, D::Error>
where
    D: Deserializer<'de>,
{
    struct UniqueCases;

    impl<'de> Visitor<'de> for UniqueCases {
        type Value = IndexMap<String, TestCase>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a mapping of test names to test cases")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut cases = IndexMap::new();
            while let Some((name, case)) = map.next_entry::<String, TestCase>()? {
                if cases.contains_key(&name) {
                    return Err(de::Error::custom(format!("duplicate test case name: {name}")));
                }
                cases.insert(name, case);
            }
            Ok(cases)
        }
    }

    deserializer.deserialize_map(UniqueCases)
}

/// Generate the JSON Schema for recipe files.
pub fn generate_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(Recipe)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Recipe {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn parse_minimal_recipe() {
        let recipe = parse(
            r#"
executable: main.exe
test-cases:
  hello:
    return-code: 0
"#,
        );
        assert_eq!(recipe.executable, "main.exe");
        assert_eq!(recipe.test_cases.len(), 1);
        assert_eq!(recipe.test_cases["hello"].return_code, Some(0));
    }

    #[test]
    fn test_cases_keep_declaration_order() {
        let recipe = parse(
            r#"
executable: prog
test-cases:
  zeta: {}
  alpha: {}
  mid: {}
"#,
        );
        let names: Vec<_> = recipe.test_cases.keys().cloned().collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn parse_full_test_case() {
        let recipe = parse(
            r#"
executable: python3 main.py
timeout: 5
test-cases:
  greet:
    executable: ./other
    scrub-env: true
    env:
      GREETING: hi
      LEVEL: 3
    resources:
      - src: data/input.txt
        dst: input.txt
    argv: [--name, 42]
    stdin:
      - Bob
      - 7
    timeout: 2
    return-code: 1
    stdout: "Hello Bob\n"
    stderr:
      empty: true
    ofstreams:
      - test-file: out.txt
        base-file: expected/out.txt
    extra-tests:
      - checks/extra.sh
"#,
        );
        assert_eq!(recipe.timeout, Some(5));
        let case = &recipe.test_cases["greet"];
        assert_eq!(case.executable.as_deref(), Some("./other"));
        assert!(case.scrub_env);
        assert_eq!(case.env["LEVEL"], "3");
        assert_eq!(case.resources[0].destination(), PathBuf::from("input.txt"));
        assert_eq!(case.argv, vec!["--name", "42"]);
        assert_eq!(
            case.stdin,
            Some(StdinSpec::Lines(vec!["Bob".to_string(), "7".to_string()]))
        );
        assert_eq!(case.timeout, Some(2));
        assert_eq!(case.return_code, Some(1));
        assert_eq!(
            case.stdout,
            Some(ExpectedStream::Text("Hello Bob\n".to_string()))
        );
        match &case.stderr {
            Some(ExpectedStream::Structured(m)) => assert_eq!(m.empty, Some(true)),
            other => panic!("Expected structured match, got {other:?}"),
        }
        assert_eq!(
            case.ofstreams[0].file,
            Some(PathBuf::from("expected/out.txt"))
        );
        assert_eq!(case.extra_tests, vec!["checks/extra.sh"]);
    }

    #[test]
    fn expected_stream_forms_are_chosen_by_shape() {
        let recipe = parse(
            r#"
executable: prog
test-cases:
  text:
    stdout: "a\nb\n"
  lines:
    stdout: [a, b]
  structured:
    stdout:
      file: expected.txt
      start: 1
      count: 2
"#,
        );
        assert!(matches!(
            recipe.test_cases["text"].stdout,
            Some(ExpectedStream::Text(_))
        ));
        assert!(matches!(
            recipe.test_cases["lines"].stdout,
            Some(ExpectedStream::Lines(ref l)) if l.len() == 2
        ));
        match &recipe.test_cases["structured"].stdout {
            Some(ExpectedStream::Structured(m)) => {
                assert_eq!(m.file, Some(PathBuf::from("expected.txt")));
                assert_eq!(m.start, Some(1));
                assert_eq!(m.count, Some(2));
                assert!(m.has_window());
            }
            other => panic!("Expected structured match, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_test_case_names_are_rejected() {
        let result: Result<Recipe, _> = serde_yaml::from_str(
            r#"
executable: prog
test-cases:
  same: {}
  same: {}
"#,
        );
        let err = result.unwrap_err().to_string();
        assert!(err.contains("duplicate"), "unexpected error: {err}");
    }

    #[test]
    fn stdin_text_block_splits_into_lines() {
        let stdin = StdinSpec::Text("one\ntwo\n".to_string());
        assert_eq!(stdin.lines(), vec!["one", "two"]);
    }

    #[test]
    fn unknown_test_case_field_is_rejected() {
        let result: Result<Recipe, _> = serde_yaml::from_str(
            r#"
executable: prog
test-cases:
  typo:
    retrun-code: 0
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn unknown_structured_option_is_rejected() {
        let result: Result<Recipe, _> = serde_yaml::from_str(
            r#"
executable: prog
test-cases:
  bad:
    stdout:
      contains: hello
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn output_file_check_resolves_relative_paths() {
        let check = OutputFileCheck {
            test_file: PathBuf::from("out/result.txt"),
            exists: None,
            binary: false,
            text: Some("x".to_string()),
            file: None,
            empty: None,
            start: Some(1),
            count: None,
        };
        assert_eq!(
            check.resolve(Path::new("/work")),
            PathBuf::from("/work/out/result.txt")
        );
        let m = check.stream_match();
        assert_eq!(m.text.as_deref(), Some("x"));
        assert_eq!(m.start, Some(1));
    }

    #[test]
    fn recipe_round_trips_through_yaml() {
        let mut recipe = Recipe {
            executable: "prog".to_string(),
            ..Default::default()
        };
        recipe.test_cases.insert(
            "first".to_string(),
            TestCase {
                argv: vec!["x".to_string()],
                stdout: Some(ExpectedStream::Text("out\n".to_string())),
                return_code: Some(0),
                ..Default::default()
            },
        );
        let yaml = serde_yaml::to_string(&recipe).unwrap();
        assert!(yaml.contains("return-code: 0"));
        assert!(!yaml.contains("scrub-env"));
        assert_eq!(parse(&yaml), recipe);
    }

    #[test]
    fn schema_mentions_test_cases() {
        let schema = serde_json::to_string(&generate_schema()).unwrap();
        assert!(schema.contains("test-cases"));
        assert!(schema.contains("ofstreams"));
    }
}
