// ABOUTME: Core type definitions for sandbox lifecycle management
// ABOUTME: Defines configuration, derived environments, probe results, and caller-facing outcomes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Configuration for a sandbox session.
///
/// Immutable after the manager is constructed. The template reference is
/// mandatory: an empty `template_id` is resolved from `BRIDGEKIT_TEMPLATE_ID`
/// at manager construction, and construction fails if both are absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Template reference understood by the provisioning backend
    pub template_id: String,
    /// Coarse sandbox lifetime enforced by the backend, in seconds
    pub timeout_seconds: u64,
    /// Metadata forwarded to the backend on allocation
    pub metadata: Option<HashMap<String, String>>,
    /// Bearer token the bridge service requires on its API
    pub auth_token: String,
    /// Port the bridge service listens on inside the sandbox
    pub port: u16,
    /// Bind host for the bridge service
    pub host: String,
    /// Prefer the secure (TLS) public endpoint
    pub secure: bool,
    /// Request internet egress for the sandbox
    pub allow_internet: bool,
    /// Probe the plain-protocol candidate URL in addition to the secure one
    pub probe_plain: bool,
    /// Service keepalive period in seconds (0 disables, floored to 5)
    pub keepalive_interval_secs: u64,
    /// Platform keepalive period in seconds (0 disables, floored to 10)
    pub platform_keepalive_interval_secs: u64,
    /// Skip the GUI/remote-desktop bootstrap entirely
    pub headless: bool,
    /// X display identifier, e.g. ":99"
    pub display: String,
    /// Xvfb geometry string, e.g. "1920x1080x24"
    pub xvfb_resolution: String,
    /// VNC server port
    pub vnc_port: u16,
    /// noVNC websocket port
    pub novnc_port: u16,
    /// URL path prefix the reverse proxy serves noVNC under
    pub novnc_path: String,
    /// noVNC web root inside the sandbox
    pub novnc_webroot: String,
    /// VNC password; `None` falls back to the auth token, empty string
    /// means no password is configured
    pub vnc_password: Option<String>,
    /// Optional base URL bootstrap artifacts are fetched from before
    /// falling back to local content
    pub asset_base_url: Option<String>,
    /// Optional local directory overriding the packaged artifacts
    pub asset_dir: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            template_id: String::new(),
            timeout_seconds: 3600,
            metadata: None,
            auth_token: "demo-token".to_string(),
            port: 3000,
            host: "127.0.0.1".to_string(),
            secure: true,
            allow_internet: true,
            probe_plain: true,
            keepalive_interval_secs: 60,
            platform_keepalive_interval_secs: 120,
            headless: false,
            display: ":99".to_string(),
            xvfb_resolution: "1920x1080x24".to_string(),
            vnc_port: 5900,
            novnc_port: 6080,
            novnc_path: "/novnc/".to_string(),
            novnc_webroot: "/usr/share/novnc".to_string(),
            vnc_password: Some(String::new()),
            asset_base_url: None,
            asset_dir: None,
        }
    }
}

impl SandboxConfig {
    /// Normalize derived fields (currently the noVNC path trailing slash)
    pub fn normalize(&mut self) {
        if !self.novnc_path.ends_with('/') {
            self.novnc_path.push('/');
        }
    }

    /// Compatibility shim: infer headless operation from a template name.
    ///
    /// The explicit `headless` flag is the primary mechanism; this helper
    /// only exists for callers migrating from setups where the template
    /// name ("...-headless", "...-simple") was the sole signal.
    pub fn headless_from_template_name(template_id: &str) -> bool {
        let name = template_id.to_ascii_lowercase();
        name.contains("headless") || name.contains("simple")
    }
}

/// Environment variable sets derived from a [`SandboxConfig`].
///
/// Deterministic for a given config; derived once per bootstrap run and
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEnvironment {
    /// Variables common to every in-sandbox command
    pub base: HashMap<String, String>,
    /// Full launch environment for the bootstrap script (GUI stack included)
    pub service: HashMap<String, String>,
    /// Launch environment for the bridge service
    pub bridge: HashMap<String, String>,
}

impl ServiceEnvironment {
    /// Derive all environment sets from the configuration
    pub fn derive(config: &SandboxConfig) -> Self {
        let (width, height) = split_resolution(&config.xvfb_resolution);
        let vnc_password = config
            .vnc_password
            .clone()
            .unwrap_or_else(|| config.auth_token.clone());

        let mut base = HashMap::new();
        base.insert("AUTH_TOKEN".to_string(), config.auth_token.clone());
        base.insert("PORT".to_string(), config.port.to_string());
        base.insert("HOST".to_string(), config.host.clone());
        base.insert(
            "NPM_CI_ALWAYS".to_string(),
            std::env::var("NPM_CI_ALWAYS").unwrap_or_else(|_| "0".to_string()),
        );

        let mut service = base.clone();
        service.insert("DISPLAY".to_string(), config.display.clone());
        service.insert("XVFB_DISPLAY".to_string(), config.display.clone());
        service.insert("XVFB_RESOLUTION".to_string(), config.xvfb_resolution.clone());
        service.insert("XVFB_WIDTH".to_string(), width);
        service.insert("XVFB_HEIGHT".to_string(), height);
        service.insert("VNC_PORT".to_string(), config.vnc_port.to_string());
        service.insert("NOVNC_PORT".to_string(), config.novnc_port.to_string());
        service.insert("NOVNC_WEBROOT".to_string(), config.novnc_webroot.clone());
        service.insert("VNC_PASSWORD".to_string(), vnc_password);

        let mut bridge = base.clone();
        bridge.insert("LOG_LEVEL".to_string(), "info".to_string());

        Self {
            base,
            service,
            bridge,
        }
    }
}

/// Extract numeric width and height from an Xvfb geometry string
/// (e.g. "1920x1080x24"), falling back to 1920x1080 for malformed input.
pub fn split_resolution(resolution: &str) -> (String, String) {
    let lowered = resolution.to_ascii_lowercase();
    let mut it = lowered.split('x');

    let digits = |s: Option<&str>, fallback: &str| -> String {
        let filtered: String = s
            .unwrap_or("")
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect();
        if filtered.is_empty() {
            fallback.to_string()
        } else {
            filtered
        }
    };

    let width = digits(it.next(), "1920");
    let height = digits(it.next(), "1080");
    (width, height)
}

/// Lifecycle status of a managed sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxStatus::Running => "running",
            SandboxStatus::Stopping => "stopping",
            SandboxStatus::Stopped => "stopped",
            SandboxStatus::Failed => "failed",
        }
    }
}

/// Status of an individual in-sandbox service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Running,
    Disabled,
}

/// Outcome of a readiness probe cycle. Transient, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessResult {
    /// The secure candidate answered 200 on /health
    pub secure_ok: bool,
    /// The plain candidate answered 200 on /health
    pub plain_ok: bool,
    /// The URL selected as canonical, if any candidate was healthy
    pub healthy_url: Option<String>,
}

impl ReadinessResult {
    pub fn unreachable() -> Self {
        Self {
            secure_ok: false,
            plain_ok: false,
            healthy_url: None,
        }
    }

    pub fn any_ok(&self) -> bool {
        self.secure_ok || self.plain_ok
    }
}

/// Per-service status snapshot assembled for the caller.
///
/// A read-only projection; optional fields are omitted from the JSON
/// rendering when they do not apply to a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub status: ServiceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires_password: Option<bool>,
}

impl ServiceDescriptor {
    /// A descriptor with the given status and every optional field unset
    pub fn bare(status: ServiceStatus) -> Self {
        Self {
            url: None,
            port: None,
            status,
            pid: None,
            display: None,
            resolution: None,
            path: None,
            auth_token: None,
            password_hint: None,
            requires_password: None,
        }
    }
}

/// Security metadata included in a successful create outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityInfo {
    pub secure: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

/// Probe flags reported to the caller
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ProbeFlags {
    pub secure_ok: bool,
    pub plain_ok: bool,
}

/// Structured result of a `create_sandbox` call.
///
/// A failed create still produces an outcome (`success = false` with an
/// error message) so batch callers can continue with other sandboxes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOutcome {
    pub success: bool,
    pub sandbox_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_sandbox_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub novnc_url: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub services: HashMap<String, ServiceDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<SecurityInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internet_access: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probes: Option<ProbeFlags>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CreateOutcome {
    /// Build a failure outcome carrying the logical id and error description
    pub fn failure<E: ToString>(sandbox_id: impl Into<String>, error: E) -> Self {
        Self {
            success: false,
            sandbox_id: sandbox_id.into(),
            backend_sandbox_id: None,
            public_url: None,
            fallback_url: None,
            novnc_url: None,
            services: HashMap::new(),
            security: None,
            created_at: None,
            timeout_seconds: None,
            internet_access: None,
            probes: None,
            error: Some(error.to_string()),
        }
    }
}

/// Structured result of a `stop_sandbox` call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopOutcome {
    pub success: bool,
    pub sandbox_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StopOutcome {
    pub fn not_found(sandbox_id: impl Into<String>) -> Self {
        let sandbox_id = sandbox_id.into();
        Self {
            success: false,
            error: Some(format!("Sandbox {} not found", sandbox_id)),
            message: None,
            sandbox_id,
        }
    }
}

/// Read-only snapshot of one live sandbox, as returned by `list_sandboxes`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSummary {
    pub sandbox_id: String,
    pub backend_sandbox_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    pub status: SandboxStatus,
    pub created_at: DateTime<Utc>,
}

/// Per-call options for `create_sandbox`
#[derive(Debug, Clone, Copy)]
pub struct CreateOptions {
    /// Request internet egress for the sandbox
    pub enable_internet: bool,
    /// Block until the readiness prober has run (or its budget is spent)
    pub wait_for_ready: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            enable_internet: true,
            wait_for_ready: true,
        }
    }
}
