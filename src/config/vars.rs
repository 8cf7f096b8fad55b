//! Environment variable interpolation for config files.
//!
//! `${VAR}` is replaced by the variable's value and fails if it is unset.
//! `${VAR:-fallback}` uses `fallback` when the variable is unset or empty.
//! `$$` produces a literal `$`.

use regex::{Captures, Regex};
use std::env;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .expect("placeholder pattern is valid")
});

/// Substitute every placeholder in `input`.
///
/// All problems are collected so a config with several missing variables
/// reports them together.
pub fn interpolate(input: &str) -> Result<String, Vec<String>> {
    let mut problems = Vec::new();

    let text = PLACEHOLDER.replace_all(input, |caps: &Captures| {
        let Some(name) = caps.get(1).map(|m| m.as_str()) else {
            return "$".to_string();
        };
        let fallback = caps.get(2).map(|m| m.as_str());

        match (env::var(name), fallback) {
            (Ok(value), _) if value.contains(['\n', '\r']) => {
                problems.push(format!("variable '{name}' contains a line break"));
                String::new()
            }
            (Ok(value), Some(fallback)) if value.is_empty() => fallback.to_string(),
            (Ok(value), _) => value,
            (Err(_), Some(fallback)) => fallback.to_string(),
            (Err(_), None) => {
                problems.push(format!("variable '{name}' is not set"));
                String::new()
            }
        }
    });

    if problems.is_empty() {
        Ok(text.into_owned())
    } else {
        Err(problems)
    }
}
