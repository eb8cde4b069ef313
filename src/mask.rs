//! Sensitive-data masking for persisted payloads and error bodies.
//!
//! Everything that crosses the audit/store boundary or is echoed back in an
//! error payload goes through here first, so a credential embedded in an
//! upstream error body never reaches disk or a client.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// Replacement for masked spans.
const MASK: &str = "***";

/// Token shapes that are always masked wherever they appear in a string.
static TOKEN_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // GitHub tokens (classic and fine-grained)
        r"gh[pousr]_[A-Za-z0-9]{20,}",
        r"github_pat_[A-Za-z0-9_]{20,}",
        // OpenAI / Anthropic style API keys
        r"sk-[A-Za-z0-9\-_]{16,}",
        // Bearer headers
        r"(?i)bearer\s+[A-Za-z0-9\-._~+/]{8,}=*",
        // key=value / key: value assignments for secret-ish keys
        r#"(?i)(api[-_]?key|token|secret|password|authorization)["']?\s*[:=]\s*["']?[^\s"',}]{4,}"#,
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static mask pattern must compile"))
    .collect()
});

/// JSON keys whose values are masked wholesale regardless of shape.
const SECRET_KEYS: &[&str] = &[
    "api_key",
    "apikey",
    "authorization",
    "password",
    "secret",
    "token",
    "access_token",
];

/// Mask token-shaped spans inside a string.
pub fn mask_string(input: &str) -> String {
    let mut out = input.to_string();
    for re in TOKEN_PATTERNS.iter() {
        out = re.replace_all(&out, MASK).into_owned();
    }
    out
}

/// Recursively mask a JSON value: secret-named keys are replaced entirely,
/// every string value is run through [`mask_string`].
pub fn mask_json(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(mask_string(s)),
        Value::Array(items) => Value::Array(items.iter().map(mask_json).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    if SECRET_KEYS.contains(&k.to_ascii_lowercase().as_str()) {
                        (k.clone(), Value::String(MASK.to_string()))
                    } else {
                        (k.clone(), mask_json(v))
                    }
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn masks_github_tokens() {
        let masked = mask_string("push failed: ghp_abcdefghijklmnopqrstuv1234 rejected");
        assert!(!masked.contains("ghp_"));
        assert!(masked.contains("***"));
    }

    #[test]
    fn masks_bearer_headers() {
        let masked = mask_string("Authorization: Bearer abc123def456ghi789");
        assert!(!masked.contains("abc123def456ghi789"));
    }

    #[test]
    fn masks_key_value_assignments() {
        let masked = mask_string("failed with api_key=supersecretvalue in request");
        assert!(!masked.contains("supersecretvalue"));
    }

    #[test]
    fn leaves_plain_text_alone() {
        let s = "Codex CLI exited with code 1";
        assert_eq!(mask_string(s), s);
    }

    #[test]
    fn masks_secret_keys_in_json() {
        let masked = mask_json(&json!({
            "repo": "octo/repo",
            "token": "ghp_abcdefghijklmnopqrstuv1234",
            "nested": {"password": "hunter2", "note": "ok"},
            "list": ["sk-abcdefghijklmnopqr"],
        }));

        assert_eq!(masked["token"], "***");
        assert_eq!(masked["nested"]["password"], "***");
        assert_eq!(masked["repo"], "octo/repo");
        assert_eq!(masked["nested"]["note"], "ok");
        assert_eq!(masked["list"][0], "***");
    }
}
