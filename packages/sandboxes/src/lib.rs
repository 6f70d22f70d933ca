// ABOUTME: Sandbox lifecycle management for Bridgekit
// ABOUTME: Provisions remote sandboxes, bootstraps their service stack, and keeps them alive

pub mod assets;
pub mod backend;
pub mod bootstrap;
pub mod env;
pub mod error;
pub mod http_backend;
pub mod keepalive;
pub mod manager;
pub mod probe;
pub mod types;

// Re-export commonly used types
pub use backend::{
    AllocateSpec, BlockingSandboxBackend, BlockingSandboxHandle, CommandOutput, ExecOptions,
    OffloadedBackend, SandboxBackend, SandboxHandle,
};
pub use error::{Result, SandboxError};
pub use http_backend::HttpBackend;
pub use manager::SandboxManager;
pub use probe::ReadinessProber;
pub use types::{
    CreateOptions, CreateOutcome, ReadinessResult, SandboxConfig, SandboxStatus, SandboxSummary,
    ServiceStatus, StopOutcome,
};
