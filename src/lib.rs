#![forbid(unsafe_code)]

pub mod config;
pub mod configuration;
pub mod db;
pub mod diagnostics;
pub mod environment;
pub mod error;
pub mod hooks;
pub mod ports;
pub mod process;
pub mod queue;
pub mod runner;
pub mod timing;
pub mod types;

pub use config::{load_config, EngineConfig};
pub use configuration::{ConfigurationManifest, ConfigurationVersion, DirectoryConfigurationSource};
pub use db::RunStore;
pub use environment::{EnvironmentBuilder, PythonVenvInstaller};
pub use error::{EngineError, Result};
pub use hooks::{ArtifactSnapshot, Hook, HookContext, HookPipeline, HookRegistry};
pub use queue::{CancelAck, QueueManager, RecoveryReport};
pub use runner::{CancelSignal, ExecutionRunner, RunnerSettings};
pub use types::*;
