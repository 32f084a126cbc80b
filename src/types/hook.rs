use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Lifecycle stages in their only legal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookStage {
    OnActivate,
    OnJobStart,
    OnAfterExtract,
    AfterMapping,
    AfterTransform,
    AfterValidate,
    OnJobEnd,
}

impl HookStage {
    /// Stages driven by a run, in order. `on_activate` belongs to activation.
    pub const RUN_STAGES: [Self; 6] = [
        Self::OnJobStart,
        Self::OnAfterExtract,
        Self::AfterMapping,
        Self::AfterTransform,
        Self::AfterValidate,
        Self::OnJobEnd,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::OnActivate => "on_activate",
            Self::OnJobStart => "on_job_start",
            Self::OnAfterExtract => "on_after_extract",
            Self::AfterMapping => "after_mapping",
            Self::AfterTransform => "after_transform",
            Self::AfterValidate => "after_validate",
            Self::OnJobEnd => "on_job_end",
        }
    }

    #[must_use]
    pub const fn next(&self) -> Option<Self> {
        match self {
            Self::OnActivate => None,
            Self::OnJobStart => Some(Self::OnAfterExtract),
            Self::OnAfterExtract => Some(Self::AfterMapping),
            Self::AfterMapping => Some(Self::AfterTransform),
            Self::AfterTransform => Some(Self::AfterValidate),
            Self::AfterValidate => Some(Self::OnJobEnd),
            Self::OnJobEnd => None,
        }
    }
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for HookStage {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, String> {
        match s {
            "on_activate" => Ok(Self::OnActivate),
            "on_job_start" => Ok(Self::OnJobStart),
            "on_after_extract" => Ok(Self::OnAfterExtract),
            "after_mapping" => Ok(Self::AfterMapping),
            "after_transform" => Ok(Self::AfterTransform),
            "after_validate" => Ok(Self::AfterValidate),
            "on_job_end" => Ok(Self::OnJobEnd),
            _ => Err(format!("Unknown hook stage: {s}")),
        }
    }
}

/// Extraction phases reported by the engine process; each completes into one hook stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionPhase {
    Extract,
    Mapping,
    Transform,
    Validate,
}

impl ExtractionPhase {
    #[must_use]
    pub const fn hook_stage(&self) -> HookStage {
        match self {
            Self::Extract => HookStage::OnAfterExtract,
            Self::Mapping => HookStage::AfterMapping,
            Self::Transform => HookStage::AfterTransform,
            Self::Validate => HookStage::AfterValidate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookAnnotation {
    pub stage: HookStage,
    pub hook_name: String,
    pub annotated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}
