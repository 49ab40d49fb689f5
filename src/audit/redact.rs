//! Secret redaction for recorded commands.

use std::sync::LazyLock;

use regex::Regex;

const REDACTED: &str = "[REDACTED]";

/// Flags whose value is always a secret.
const SECRET_FLAGS: &[&str] = &[
    "--password",
    "--passwd",
    "--new-password",
    "--secret",
    "--token",
    "--api-key",
    "--apikey",
    "--passphrase",
];

/// Flags whose value is a secret only when the command handles credentials.
const CONTEXT_FLAGS: &[&str] = &["--value", "-p"];

const CREDENTIAL_HINTS: &[&str] = &["pass", "secret", "token", "credential", "key"];

static SECRET_PAIRS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (
            r"(?i)\b([a-z0-9_.\-]*(?:password|passwd|secret|token|api[_-]?key)[a-z0-9_.\-]*)\s*([=:])\s*[^\s&]+",
            "${1}${2}[REDACTED]",
        ),
        (r"(?i)\b(bearer)\s+\S+", "${1} [REDACTED]"),
    ]
    .into_iter()
    .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
    .collect()
});

/// Replace secret values in a command line before it is written anywhere.
pub fn redact_command(command: &str) -> String {
    let tokens: Vec<&str> = command.split_whitespace().collect();
    let credential_context = tokens.iter().any(|t| {
        let lower = t.to_ascii_lowercase();
        CREDENTIAL_HINTS.iter().any(|h| lower.contains(h))
    });

    let mut out: Vec<String> = Vec::with_capacity(tokens.len());
    let mut redact_next = false;
    for token in tokens {
        if redact_next {
            out.push(REDACTED.to_string());
            redact_next = false;
            continue;
        }

        let lower = token.to_ascii_lowercase();
        let is_secret_flag = |flag: &str| {
            SECRET_FLAGS.contains(&flag) || (credential_context && CONTEXT_FLAGS.contains(&flag))
        };

        match lower.split_once('=') {
            Some((flag, _)) if flag.starts_with('-') && is_secret_flag(flag) => {
                let prefix_len = flag.len();
                out.push(format!("{}={REDACTED}", &token[..prefix_len]));
            }
            _ if is_secret_flag(&lower) => {
                out.push(token.to_string());
                redact_next = true;
            }
            _ => out.push(token.to_string()),
        }
    }

    let mut joined = out.join(" ");
    for (re, replacement) in SECRET_PAIRS.iter() {
        joined = re.replace_all(&joined, *replacement).into_owned();
    }
    joined
}

/// Replace string values under secret-looking keys in a JSON payload.
pub fn redact_json(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| {
                let lower = k.to_ascii_lowercase();
                let secret = CREDENTIAL_HINTS.iter().any(|h| lower.contains(h));
                let v = if secret && !v.is_object() && !v.is_array() {
                    serde_json::Value::String(REDACTED.to_string())
                } else {
                    redact_json(v)
                };
                (k.clone(), v)
            })
            .collect::<serde_json::Map<_, _>>()
            .into(),
        serde_json::Value::Array(items) => items.iter().map(redact_json).collect(),
        other => other.clone(),
    }
}
