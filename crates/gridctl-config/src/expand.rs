//! `${VAR}` / `${VAR:-default}` environment expansion for stack files.

use std::sync::OnceLock;

use regex::{Captures, Regex};

fn var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("env placeholder pattern is valid")
    })
}

/// Expand placeholders against the process environment. An unset variable
/// without a default expands to the empty string.
pub fn expand_str(input: &str) -> String {
    expand_with(input, |name| std::env::var(name).ok())
}

/// Expand placeholders with an explicit lookup (testable without touching
/// the process environment).
pub fn expand_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    var_pattern()
        .replace_all(input, |caps: &Captures<'_>| {
            let name = &caps[1];
            match lookup(name) {
                Some(value) => value,
                None => caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
            }
        })
        .into_owned()
}
