use crate::cli::OutputFormat;
use runengine::error::get_error_info;
use runengine::EngineError;
use serde_json::{json, Value};

pub fn emit_output(output: &OutputFormat, command: &str, payload: Value) {
    match output {
        OutputFormat::Text => payload
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| println!("{payload:#}"), |msg| println!("{msg}")),
        OutputFormat::Json => println!(
            "{}",
            json!({
                "command": command,
                "status": "ok",
                "payload": payload,
            })
        ),
    }
}

/// One line of a followed event stream.
pub fn emit_line(output: &OutputFormat, line: &Value) {
    match output {
        OutputFormat::Json => println!("{line}"),
        OutputFormat::Text => println!(
            "#{} {} [{}] {}",
            line["sequence"],
            line["event_type"].as_str().unwrap_or_default(),
            line["state"].as_str().unwrap_or_default(),
            line.get("detail").map_or_else(String::new, Value::to_string),
        ),
    }
}

pub fn emit_error(output: &OutputFormat, command: &str, error: &EngineError) {
    match output {
        OutputFormat::Text => {
            eprintln!("error[{}]: {error}", error.code());
            if let Some((_, fix)) = get_error_info(error.code()) {
                eprintln!("  fix: {fix}");
            }
        }
        OutputFormat::Json => println!("{}", error_envelope(command, error)),
    }
}

pub fn error_envelope(command: &str, error: &EngineError) -> Value {
    let (description, fix) = get_error_info(error.code()).unwrap_or(("", ""));
    let mut body = json!({
        "code": error.code(),
        "message": error.to_string(),
        "description": description,
        "fix": fix,
        "retryable": error.is_retryable(),
    });
    if let EngineError::Saturated {
        queue_size,
        max_concurrency,
        retry_after_ms,
    } = error
    {
        body["queue_size"] = json!(queue_size);
        body["max_concurrency"] = json!(max_concurrency);
        body["retry_after_ms"] = json!(retry_after_ms);
    }
    json!({
        "command": command,
        "status": "error",
        "error": body,
    })
}

#[cfg(test)]
mod tests {
    use super::error_envelope;
    use runengine::EngineError;

    #[test]
    fn saturation_envelope_carries_backpressure_hints() {
        let envelope = error_envelope(
            "submit",
            &EngineError::Saturated {
                queue_size: 6,
                max_concurrency: 2,
                retry_after_ms: 1_500,
            },
        );

        assert_eq!(envelope["status"], "error");
        assert_eq!(envelope["error"]["code"], "SATURATED");
        assert_eq!(envelope["error"]["retryable"], true);
        assert_eq!(envelope["error"]["queue_size"], 6);
        assert_eq!(envelope["error"]["retry_after_ms"], 1_500);
    }

    #[test]
    fn not_found_envelope_has_a_fix_and_no_hints() {
        let envelope = error_envelope("status", &EngineError::NotFound("run x".to_string()));

        assert_eq!(envelope["error"]["code"], "NOTFOUND");
        assert_eq!(envelope["error"]["retryable"], false);
        assert!(envelope["error"]["fix"].as_str().is_some_and(|fix| !fix.is_empty()));
        assert!(envelope["error"].get("retry_after_ms").is_none());
    }
}
