use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn from_uuid(value: Uuid) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<&str> for RunId {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, String> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| format!("Invalid run id '{s}': {e}"))
    }
}

/// Identifier of an immutable configuration snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigurationVersionId(String);

impl ConfigurationVersionId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn value(&self) -> &str {
        &self.0
    }

    /// Version ids double as directory names, so path separators and
    /// dot-segments are refused.
    #[must_use]
    pub fn is_path_safe(&self) -> bool {
        !self.0.is_empty()
            && self.0 != "."
            && self.0 != ".."
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    }
}

impl fmt::Display for ConfigurationVersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigurationVersionId, RunId};

    #[test]
    fn run_id_parses_its_display_form() {
        let id = RunId::generate();
        assert_eq!(RunId::try_from(id.to_string().as_str()), Ok(id));
        assert!(RunId::try_from("not-a-uuid").is_err());
    }

    #[test]
    fn version_ids_with_path_segments_are_unsafe() {
        assert!(ConfigurationVersionId::new("invoices-v3.1_rc").is_path_safe());
        assert!(!ConfigurationVersionId::new("../etc").is_path_safe());
        assert!(!ConfigurationVersionId::new("a/b").is_path_safe());
        assert!(!ConfigurationVersionId::new("..").is_path_safe());
        assert!(!ConfigurationVersionId::new("").is_path_safe());
    }
}
