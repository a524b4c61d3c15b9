//! Sandboxed execution core: language profiles, workspace materialization,
//! direct and container backends, and the executor that ties them together.

pub mod backend;
pub mod config;
pub mod error;
pub mod executor;
pub mod profiles;
pub mod workspace;

pub use backend::{create_backend, Backend, CommandPlan, DirectBackend, DockerBackend, ExecutionContext};
pub use config::{BackendKind, ResourceLimits, SandboxSettings};
pub use error::SandboxError;
pub use executor::SandboxExecutor;
pub use profiles::{LanguageProfile, LanguageProfiles};
pub use workspace::{validate_request, Workspace};
