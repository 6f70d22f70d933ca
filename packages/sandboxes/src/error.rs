// ABOUTME: Error types for sandbox lifecycle operations
// ABOUTME: Covers provisioning, bootstrap, registry, and asset failures

use thiserror::Error;

/// Main error type for sandbox lifecycle operations
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Backend allocation failed; fatal and never retried at this layer
    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    /// The bootstrap script itself failed to launch inside the sandbox
    #[error("Bootstrap failed: {0}")]
    BootstrapFailed(String),

    /// No template reference was provided explicitly or via the environment
    #[error("Template id is required (provide one explicitly or set BRIDGEKIT_TEMPLATE_ID)")]
    MissingTemplate,

    /// Caller reused a logical identifier that already has a live record
    #[error("Sandbox {0} already exists")]
    RegistryConflict(String),

    /// No live record for the given logical identifier
    #[error("Sandbox {0} not found")]
    SandboxNotFound(String),

    /// A mandatory bootstrap artifact has no content source at all
    #[error("Bootstrap asset not available: {0}")]
    AssetUnavailable(String),

    /// Remote execution backend reported an error
    #[error("Backend error: {0}")]
    Backend(String),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Type alias for Results that return SandboxError
pub type Result<T> = std::result::Result<T, SandboxError>;
