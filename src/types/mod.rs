mod environment;
mod event;
mod hook;
mod identifiers;
mod run;

pub use environment::{
    ActivationFailure, ActivationHookResult, ActivationState, BuildStep, ConfigurationEnvironment,
};
pub use event::{NewRunEvent, RunEvent, RunEventType};
pub use hook::{ExtractionPhase, HookAnnotation, HookStage};
pub use identifiers::{ConfigurationVersionId, RunId};
pub use run::{Run, RunMode, RunOutcome, RunState, RunStatusView, SubmitRequest};
