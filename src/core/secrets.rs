//! Credential-shaped pattern detection
//!
//! A best-effort scan for values that look like access keys or tokens. It is a
//! guard against pasting credentials into a pipeline description or a log
//! line, not a detector anyone should rely on.

use regex::Regex;
use std::sync::OnceLock;

/// A credential shape and the regex that recognises it
struct SecretPattern {
    kind: &'static str,
    regex: Regex,
}

fn patterns() -> &'static [SecretPattern] {
    static PATTERNS: OnceLock<Vec<SecretPattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            ("an AWS access key id", r"\b(AKIA|ASIA)[0-9A-Z]{16}\b"),
            (
                "an AWS secret access key assignment",
                r"(?i)aws_secret_access_key\s*[=:]\s*\S{16,}",
            ),
            ("a bearer token", r"(?i)\bbearer\s+[A-Za-z0-9\-._~+/]{16,}=*"),
            ("a GitHub token", r"\b(ghp|gho|ghs|ghu|ghr)_[A-Za-z0-9]{30,}\b"),
            ("a GitHub token", r"\bgithub_pat_[A-Za-z0-9_]{40,}\b"),
            ("a private key", r"-----BEGIN ([A-Z]+ )?PRIVATE KEY-----"),
        ]
        .into_iter()
        .filter_map(|(kind, pattern)| {
            // Patterns are literals above; a bad one is skipped rather than aborting the scan
            Regex::new(pattern).ok().map(|regex| SecretPattern { kind, regex })
        })
        .collect()
    })
}

/// Return the kind of credential `value` looks like, if any
pub fn detect(value: &str) -> Option<&'static str> {
    patterns()
        .iter()
        .find(|p| p.regex.is_match(value))
        .map(|p| p.kind)
}

/// Replace every credential-shaped substring with `[REDACTED]`
pub fn redact(text: &str) -> String {
    let mut redacted = text.to_string();
    for pattern in patterns() {
        redacted = pattern
            .regex
            .replace_all(&redacted, "[REDACTED]")
            .into_owned();
    }
    redacted
}
