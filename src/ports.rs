//! Seams between the engine and the things it drives.

use crate::configuration::ConfigurationVersion;
use crate::error::Result;
use crate::types::{ConfigurationVersionId, NewRunEvent};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;

pub type PortFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Resolves configuration version ids to immutable snapshots.
pub trait ConfigurationSource: Send + Sync {
    fn load<'a>(&'a self, id: &'a ConfigurationVersionId)
        -> PortFuture<'a, ConfigurationVersion>;
}

/// Creates and populates an isolated interpreter environment.
///
/// Each step returns its captured output; a failing step returns
/// `EngineError::Execution` carrying that output.
pub trait EnvironmentInstaller: Send + Sync {
    fn create_environment<'a>(&'a self, target: &'a Path) -> PortFuture<'a, String>;

    fn install_dependencies<'a>(
        &'a self,
        target: &'a Path,
        dependency_manifest: &'a Path,
    ) -> PortFuture<'a, String>;

    fn freeze<'a>(&'a self, target: &'a Path) -> PortFuture<'a, Vec<String>>;
}

/// Receives the events a run produces while it executes.
pub trait RunEventSink: Send + Sync {
    fn emit(&self, event: NewRunEvent) -> PortFuture<'_, ()>;
}
