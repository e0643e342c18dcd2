//! Ambient environment snapshot and per-case environment resolution.

use crate::error::{Error, Result};
use indexmap::IndexMap;
use std::collections::HashMap;

/// The process environment captured once at startup.
///
/// The snapshot is never mutated; each test case builds its own copy.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    /// Capture the current process environment.
    ///
    /// Variables whose name or value is not valid Unicode are skipped.
    pub fn capture() -> Self {
        let vars = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        Self { vars }
    }

    /// Build a snapshot from explicit pairs.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Resolve the environment a test case runs with.
    ///
    /// Starts from the snapshot (or nothing when `scrub` is set), then applies
    /// the case variables in order. Values may reference `${VAR}`; names are
    /// looked up among the case variables resolved so far, then the snapshot.
    pub fn resolve(
        &self,
        scrub: bool,
        case_env: &IndexMap<String, String>,
    ) -> Result<HashMap<String, String>> {
        let mut env = if scrub {
            HashMap::new()
        } else {
            self.vars.clone()
        };
        let mut resolved = HashMap::with_capacity(case_env.len());
        for (key, value) in case_env {
            let value = interpolate_with(value, &resolved, self)?;
            resolved.insert(key.clone(), value.clone());
            env.insert(key.clone(), value);
        }
        Ok(env)
    }
}

/// Interpolate `${VAR}` references in a string against the snapshot.
pub fn interpolate(s: &str, snapshot: &EnvSnapshot) -> Result<String> {
    interpolate_with(s, &HashMap::new(), snapshot)
}

/// Interpolate `${VAR}` references, checking `local` before the snapshot.
///
/// `$$` produces a literal `$`.
pub fn interpolate_with(
    s: &str,
    local: &HashMap<String, String>,
    snapshot: &EnvSnapshot,
) -> Result<String> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }
        match chars.peek() {
            Some('$') => {
                chars.next();
                result.push('$');
            }
            Some('{') => {
                chars.next();
                let mut var_name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => var_name.push(c),
                        None => {
                            return Err(Error::Interpolation(format!(
                                "unclosed variable reference: ${{{var_name}"
                            )));
                        }
                    }
                }
                let value = local
                    .get(&var_name)
                    .map(String::as_str)
                    .or_else(|| snapshot.get(&var_name))
                    .ok_or_else(|| {
                        Error::Interpolation(format!(
                            "environment variable '{var_name}' is not set"
                        ))
                    })?;
                result.push_str(value);
            }
            _ => result.push('$'),
        }
    }

    Ok(result)
}
