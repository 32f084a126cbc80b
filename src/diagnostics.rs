/// Classify a run failure message into a normalized diagnostics category.
#[must_use]
pub fn classify_failure_category(message: &str) -> &'static str {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("timed out") || lowered.contains("timeout") {
        "timeout"
    } else if lowered.contains("heartbeat") {
        "orphaned"
    } else if lowered.contains("spawn") || lowered.contains("no such file") {
        "launch_failure"
    } else if lowered.contains("signal") {
        "killed"
    } else {
        "exit_failure"
    }
}

/// Redact sensitive `key=value` tokens (API keys, passwords, etc.) from a message.
#[must_use]
pub fn redact_sensitive(message: &str) -> String {
    if !message.contains('=') {
        return message.to_string();
    }
    message
        .split(' ')
        .map(redact_token)
        .collect::<Vec<_>>()
        .join(" ")
}

#[must_use]
fn redact_token(token: &str) -> String {
    token.split_once('=').map_or_else(
        || token.to_string(),
        |(key, _)| {
            let normalized = key.to_ascii_lowercase();
            if ["token", "password", "secret", "api_key", "database_url", "credential"]
                .iter()
                .any(|sensitive| normalized.contains(sensitive))
            {
                format!("{key}=<redacted>")
            } else {
                token.to_string()
            }
        },
    )
}
