//! Secret redaction applied to every log record before it enters the ring
//! buffer. String-based so it can run on already-formatted messages.

use std::sync::OnceLock;

use regex::Regex;

pub const REDACTED: &str = "[REDACTED]";

struct RedactionPatterns {
    api_key: Regex,
    bearer: Regex,
    secret_kv: Regex,
}

fn build_patterns() -> Option<RedactionPatterns> {
    Some(RedactionPatterns {
        api_key: Regex::new(r"(?i)\b(?:sk|key)-[a-z0-9][a-z0-9_-]{7,}\b").ok()?,
        bearer: Regex::new(r"(?i)\bBearer\s+[A-Za-z0-9._~+/\-]+=*").ok()?,
        secret_kv: Regex::new(
            r#"(?ix)
            \b(?:password|passwd|pwd|secret|client_secret|api[_-]?key|token|access_token|auth(?:orization)?)\b
            \s*[:=]\s*
            (?:
                "(?:\\.|[^"])*"
                |
                '(?:\\.|[^'])*'
                |
                [^\s,}]+
            )
            "#,
        )
        .ok()?,
    })
}

fn patterns() -> Option<&'static RedactionPatterns> {
    static PATTERNS: OnceLock<Option<RedactionPatterns>> = OnceLock::new();
    PATTERNS.get_or_init(build_patterns).as_ref()
}

/// Whether an attribute key names secret material.
pub fn is_sensitive_key(key: &str) -> bool {
    let normalized: String = key
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect();
    matches!(
        normalized.as_str(),
        "password"
            | "passwd"
            | "pwd"
            | "secret"
            | "clientsecret"
            | "apikey"
            | "token"
            | "accesstoken"
            | "authorization"
            | "auth"
            | "bearer"
            | "credential"
            | "credentials"
    )
}

/// Mask token-shaped substrings and `secret = value` pairs in free text.
pub fn redact_text(input: &str) -> String {
    let Some(patterns) = patterns() else {
        return input.to_string();
    };

    let mut out = input.to_string();
    for pattern in [&patterns.api_key, &patterns.bearer, &patterns.secret_kv] {
        out = pattern.replace_all(&out, REDACTED).into_owned();
    }
    out
}
