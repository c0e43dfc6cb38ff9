//! Sanitizing failure causes before they are persisted as `last_error`.
//!
//! `last_error` is read by operators and alerting. It must never carry
//! signatures, credentials or the nested cause chain of a handler error.

/// Upper bound for a stored diagnostic, in characters.
pub const MAX_ERROR_LEN: usize = 500;

const SECRET_KEYS: [&str; 8] = [
    "signature",
    "secret",
    "password",
    "passwd",
    "token",
    "api_key",
    "apikey",
    "authorization",
];

const REDACTED: &str = "[redacted]";

/// Render a handler error into a short, secret-free diagnostic.
///
/// Only the outermost message is used; `anyhow`'s `Display` does not include
/// the `source()` chain.
pub fn sanitize_error(err: &anyhow::Error) -> String {
    sanitize_message(&err.to_string())
}

/// Sanitize an arbitrary diagnostic string.
pub fn sanitize_message(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();

    let redacted = redact_secrets(cleaned.trim());
    truncate(&redacted, MAX_ERROR_LEN)
}

fn redact_secrets(message: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut redact_next = false;

    for word in message.split(' ') {
        let lower = word.to_ascii_lowercase();

        if lower == "bearer" || lower == "basic" {
            out.push(word.to_string());
            redact_next = true;
            continue;
        }

        if redact_next {
            out.push(REDACTED.to_string());
            redact_next = false;
            continue;
        }

        match word.find(['=', ':']) {
            Some(pos) if is_secret_key(&lower[..pos]) => {
                let (key, rest) = word.split_at(pos + 1);
                if rest.is_empty() {
                    // `password: hunter2`: the value is the next word.
                    out.push(key.to_string());
                    redact_next = true;
                } else {
                    out.push(format!("{key}{REDACTED}"));
                }
            }
            _ => out.push(word.to_string()),
        }
    }

    out.join(" ")
}

fn is_secret_key(key: &str) -> bool {
    let key = key.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '_');
    !key.is_empty() && SECRET_KEYS.iter().any(|secret| key.contains(secret))
}

fn truncate(message: &str, max_chars: usize) -> String {
    if message.chars().count() <= max_chars {
        return message.to_string();
    }
    let mut cut: String = message.chars().take(max_chars.saturating_sub(3)).collect();
    cut.push_str("...");
    cut
}
