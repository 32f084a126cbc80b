use crate::types::ExtractionPhase;
use serde::Deserialize;
use serde_json::Value;

/// Structured messages an entry point may print on stdout, one JSON object per line.
///
/// ```text
/// {"engine_event":"phase_complete","phase":"mapping","artifact":{...}}
/// {"engine_event":"summary","summary":{"rows":12}}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "engine_event", rename_all = "snake_case")]
pub enum EngineMessage {
    PhaseComplete {
        phase: ExtractionPhase,
        #[serde(default)]
        artifact: Value,
    },
    Summary {
        summary: Value,
    },
}

/// Lines that are not engine messages are ordinary output.
#[must_use]
pub fn parse_engine_message(line: &str) -> Option<EngineMessage> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') || !trimmed.contains("engine_event") {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

#[cfg(test)]
mod tests {
    use super::{parse_engine_message, EngineMessage};
    use crate::types::ExtractionPhase;
    use serde_json::json;

    #[test]
    fn phase_and_summary_messages_are_recognised() {
        assert_eq!(
            parse_engine_message(r#"{"engine_event":"phase_complete","phase":"mapping","artifact":{"rows":3}}"#),
            Some(EngineMessage::PhaseComplete {
                phase: ExtractionPhase::Mapping,
                artifact: json!({"rows": 3}),
            })
        );
        assert_eq!(
            parse_engine_message(r#"  {"engine_event":"summary","summary":{"ok":true}}"#),
            Some(EngineMessage::Summary {
                summary: json!({"ok": true})
            })
        );
    }

    #[test]
    fn ordinary_and_malformed_lines_are_plain_output() {
        assert_eq!(parse_engine_message("parsed page 1"), None);
        assert_eq!(parse_engine_message(r#"{"level":"info"}"#), None);
        assert_eq!(
            parse_engine_message(r#"{"engine_event":"phase_complete","phase":"teleport"}"#),
            None
        );
    }
}
