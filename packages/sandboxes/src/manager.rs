// ABOUTME: Sandbox lifecycle manager: create, list, stop, and the live-sandbox registry
// ABOUTME: Coordinates provisioning, bootstrap, readiness probing, keepalives, and teardown

use crate::assets::AssetCatalog;
use crate::backend::{public_url, AllocateSpec, ExecOptions, SandboxBackend, SandboxHandle};
use crate::bootstrap::{ServiceBootstrap, BRIDGE_DIR};
use crate::env::{apply_env_overrides, resolve_template_id};
use crate::error::{Result, SandboxError};
use crate::keepalive::{
    clamp_platform_interval, clamp_service_interval, spawn_platform_keepalive,
    spawn_service_keepalive, KeepaliveHandle,
};
use crate::probe::ReadinessProber;
use crate::types::{
    CreateOptions, CreateOutcome, ProbeFlags, SandboxConfig, SandboxStatus, SandboxSummary,
    SecurityInfo, ServiceDescriptor, ServiceEnvironment, ServiceStatus, StopOutcome,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// One live sandbox tracked by the registry.
///
/// The liveness token is shared with the keepalive loops as a `Weak`;
/// dropping the record (on removal) lets any still-running loop observe
/// that its sandbox is gone and exit.
struct SandboxRecord {
    handle: Arc<dyn SandboxHandle>,
    process_handles: HashMap<String, Option<u32>>,
    env: ServiceEnvironment,
    public_url: Option<String>,
    status: SandboxStatus,
    created_at: DateTime<Utc>,
    keepalive: Option<KeepaliveHandle>,
    platform_keepalive: Option<KeepaliveHandle>,
    // Held only so its drop signals the keepalive loops
    _liveness: Arc<()>,
}

/// Orchestrates the full sandbox lifecycle against a provisioning backend.
///
/// Configuration is resolved once at construction: environment overrides
/// are applied and the template reference is made concrete, failing
/// construction before any backend call when none is available.
pub struct SandboxManager {
    config: SandboxConfig,
    backend: Arc<dyn SandboxBackend>,
    assets: AssetCatalog,
    prober: Arc<ReadinessProber>,
    records: Arc<RwLock<HashMap<String, SandboxRecord>>>,
}

impl SandboxManager {
    pub fn new(mut config: SandboxConfig, backend: Arc<dyn SandboxBackend>) -> Result<Self> {
        config.normalize();
        apply_env_overrides(&mut config);
        config.template_id = resolve_template_id(&config)?;

        let assets = AssetCatalog::from_config(&config)?;
        let prober = Arc::new(ReadinessProber::new()?);

        Ok(Self {
            config,
            backend,
            assets,
            prober,
            records: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Replace the readiness prober (tests shrink its retry budget)
    pub fn with_prober(mut self, prober: ReadinessProber) -> Self {
        self.prober = Arc::new(prober);
        self
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Create and bootstrap a sandbox.
    ///
    /// Always returns an outcome: failures are reported with
    /// `success = false` and an error message rather than an `Err`, so
    /// batch callers can keep going.
    ///
    /// # Arguments
    /// * `sandbox_id` - Logical identifier; generated when absent. Reusing
    ///   an identifier with a live record is a conflict, detected before
    ///   any backend allocation.
    /// * `options` - Per-call internet and readiness-wait flags
    pub async fn create_sandbox(
        &self,
        sandbox_id: Option<&str>,
        options: CreateOptions,
    ) -> CreateOutcome {
        let logical_id = {
            let records = self.records.read().await;
            match sandbox_id {
                Some(id) => {
                    if records.contains_key(id) {
                        let err = SandboxError::RegistryConflict(id.to_string());
                        warn!("{}", err);
                        return CreateOutcome::failure(id, err);
                    }
                    id.to_string()
                }
                None => unique_id(|candidate| records.contains_key(candidate)),
            }
        };

        match self.provision_and_bootstrap(&logical_id, options).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Failed to create sandbox {}: {}", logical_id, e);
                CreateOutcome::failure(logical_id, e)
            }
        }
    }

    async fn provision_and_bootstrap(
        &self,
        logical_id: &str,
        options: CreateOptions,
    ) -> Result<CreateOutcome> {
        info!(
            "Creating sandbox {} with template {}",
            logical_id, self.config.template_id
        );

        let spec = AllocateSpec {
            template: self.config.template_id.clone(),
            timeout_seconds: self.config.timeout_seconds,
            metadata: self.config.metadata.clone(),
            secure: self.config.secure,
            allow_internet: options.enable_internet,
        };
        let handle = self.backend.allocate(&spec).await?;
        info!("Sandbox allocated (backend id {})", handle.id());

        let bootstrap = ServiceBootstrap::new(&self.config, &self.assets);
        let outcome = match bootstrap.run(handle.as_ref()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Bootstrap failed; cleaning up sandbox {}", handle.id());
                if let Err(cleanup) = handle.terminate().await {
                    warn!("Cleanup after failed bootstrap also failed: {}", cleanup);
                }
                return Err(e);
            }
        };

        let secure_url = public_url(handle.as_ref(), true)?;
        let plain_url = public_url(handle.as_ref(), false)?;

        let mut probes = ProbeFlags::default();
        let mut healthy_url = None;
        if options.wait_for_ready {
            info!("Waiting for services to answer on /health");
            let plain_candidate = self.config.probe_plain.then_some(plain_url.as_str());
            let readiness = self.prober.wait_until_ready(&secure_url, plain_candidate).await;
            probes = ProbeFlags {
                secure_ok: readiness.secure_ok,
                plain_ok: readiness.plain_ok,
            };
            healthy_url = readiness.healthy_url;
        }

        // Without a probe verdict, fall back to the configured preference
        let chosen_url = match healthy_url {
            Some(url) => url,
            None if self.config.secure => secure_url.clone(),
            None => plain_url.clone(),
        };
        let fallback_url = if chosen_url == secure_url {
            plain_url.clone()
        } else {
            secure_url.clone()
        };

        let novnc_url = (!self.config.headless).then(|| {
            format!(
                "{}{}vnc.html",
                chosen_url.trim_end_matches('/'),
                self.config.novnc_path
            )
        });

        let services = build_services(
            &self.config,
            &chosen_url,
            novnc_url.as_deref(),
            &outcome.handles,
        );
        let security = SecurityInfo {
            secure: self.config.secure,
            access_token: handle.access_token(),
        };
        let created_at = Utc::now();

        let liveness = Arc::new(());
        let record = SandboxRecord {
            handle: Arc::clone(&handle),
            process_handles: outcome.handles,
            env: outcome.env,
            public_url: Some(chosen_url.clone()),
            status: SandboxStatus::Running,
            created_at,
            keepalive: None,
            platform_keepalive: None,
            _liveness: Arc::clone(&liveness),
        };
        self.records
            .write()
            .await
            .insert(logical_id.to_string(), record);

        self.start_keepalives(logical_id, &handle, &secure_url, &plain_url, &liveness)
            .await;

        info!("Sandbox {} ready at {}", logical_id, chosen_url);
        Ok(CreateOutcome {
            success: true,
            sandbox_id: logical_id.to_string(),
            backend_sandbox_id: Some(handle.id().to_string()),
            public_url: Some(chosen_url.clone()),
            fallback_url: (fallback_url != chosen_url).then_some(fallback_url),
            novnc_url,
            services,
            security: Some(security),
            created_at: Some(created_at),
            timeout_seconds: Some(self.config.timeout_seconds),
            internet_access: Some(options.enable_internet),
            probes: Some(probes),
            error: None,
        })
    }

    async fn start_keepalives(
        &self,
        logical_id: &str,
        handle: &Arc<dyn SandboxHandle>,
        secure_url: &str,
        plain_url: &str,
        liveness: &Arc<()>,
    ) {
        let mut records = self.records.write().await;
        let record = match records.get_mut(logical_id) {
            Some(record) => record,
            None => return,
        };

        if self.config.keepalive_interval_secs > 0 {
            let plain = self
                .config
                .probe_plain
                .then(|| plain_url.to_string());
            record.keepalive = Some(spawn_service_keepalive(
                logical_id.to_string(),
                Arc::clone(&self.prober),
                secure_url.to_string(),
                plain,
                clamp_service_interval(self.config.keepalive_interval_secs),
                Arc::downgrade(liveness),
            ));
        }
        if self.config.platform_keepalive_interval_secs > 0 {
            record.platform_keepalive = Some(spawn_platform_keepalive(
                logical_id.to_string(),
                Arc::clone(handle),
                clamp_platform_interval(self.config.platform_keepalive_interval_secs),
                Arc::downgrade(liveness),
            ));
        }
    }

    /// Read-only snapshot of every live sandbox
    pub async fn list_sandboxes(&self) -> Vec<SandboxSummary> {
        let records = self.records.read().await;
        records
            .iter()
            .map(|(id, record)| SandboxSummary {
                sandbox_id: id.clone(),
                backend_sandbox_id: record.handle.id().to_string(),
                public_url: record.public_url.clone(),
                status: record.status,
                created_at: record.created_at,
            })
            .collect()
    }

    /// Last-known launch environment for a sandbox, kept for audit
    pub async fn sandbox_environment(&self, sandbox_id: &str) -> Option<ServiceEnvironment> {
        let records = self.records.read().await;
        records.get(sandbox_id).map(|record| record.env.clone())
    }

    /// Recorded per-service process ids for a sandbox (values may be
    /// unknown where the backend exposes no process handle)
    pub async fn service_handles(&self, sandbox_id: &str) -> Option<HashMap<String, Option<u32>>> {
        let records = self.records.read().await;
        records
            .get(sandbox_id)
            .map(|record| record.process_handles.clone())
    }

    /// Snapshot of one sandbox, if live
    pub async fn get_sandbox(&self, sandbox_id: &str) -> Option<SandboxSummary> {
        let records = self.records.read().await;
        records.get(sandbox_id).map(|record| SandboxSummary {
            sandbox_id: sandbox_id.to_string(),
            backend_sandbox_id: record.handle.id().to_string(),
            public_url: record.public_url.clone(),
            status: record.status,
            created_at: record.created_at,
        })
    }

    /// Tear a sandbox down: cancel keepalives, stop every known service
    /// (best-effort), terminate the backend sandbox, remove the record.
    ///
    /// Stopping an unknown identifier is a clean "not found" result, so a
    /// second stop for the same identifier is always safe.
    pub async fn stop_sandbox(&self, sandbox_id: &str) -> StopOutcome {
        let (handle, keepalive, platform_keepalive) = {
            let mut records = self.records.write().await;
            let record = match records.get_mut(sandbox_id) {
                Some(record) => record,
                None => return StopOutcome::not_found(sandbox_id),
            };
            record.status = SandboxStatus::Stopping;
            (
                Arc::clone(&record.handle),
                record.keepalive.take(),
                record.platform_keepalive.take(),
            )
        };

        info!("Stopping sandbox {}", sandbox_id);
        if let Some(task) = keepalive {
            task.cancel();
        }
        if let Some(task) = platform_keepalive {
            task.cancel();
        }

        for command in stop_commands(&self.config.display) {
            if let Err(e) = handle
                .execute(&command, ExecOptions::in_dir("/home/user"))
                .await
            {
                warn!("Stop command failed (continuing): {}", e);
            }
        }

        let terminate_error = match handle.terminate().await {
            Ok(()) => None,
            Err(e) => {
                error!("Failed to terminate sandbox {}: {}", sandbox_id, e);
                Some(e.to_string())
            }
        };

        {
            let mut records = self.records.write().await;
            if let Some(record) = records.get_mut(sandbox_id) {
                record.status = if terminate_error.is_none() {
                    SandboxStatus::Stopped
                } else {
                    SandboxStatus::Failed
                };
            }
            records.remove(sandbox_id);
        }

        match terminate_error {
            None => StopOutcome {
                success: true,
                sandbox_id: sandbox_id.to_string(),
                message: Some(format!("Sandbox {} stopped successfully", sandbox_id)),
                error: None,
            },
            Some(error) => StopOutcome {
                success: false,
                sandbox_id: sandbox_id.to_string(),
                message: None,
                error: Some(error),
            },
        }
    }

    /// Stop every live sandbox, collecting one outcome per sandbox
    pub async fn stop_all_sandboxes(&self) -> Vec<StopOutcome> {
        let ids: Vec<String> = {
            let records = self.records.read().await;
            records.keys().cloned().collect()
        };

        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            outcomes.push(self.stop_sandbox(&id).await);
        }
        outcomes
    }
}

/// Generate a logical identifier unique among live records
fn unique_id<F: Fn(&str) -> bool>(taken: F) -> String {
    let base = format!("sandbox_{}", Utc::now().format("%Y%m%d_%H%M%S"));
    if !taken(&base) {
        return base;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{}_{}", base, n);
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

fn password_hint(config: &SandboxConfig) -> (&'static str, bool) {
    match &config.vnc_password {
        None => ("auth_token", true),
        Some(password) if password.is_empty() => ("none", false),
        Some(_) => ("custom", true),
    }
}

/// Assemble the per-service status map for the caller. GUI-adjacent
/// services report as disabled in headless mode.
fn build_services(
    config: &SandboxConfig,
    chosen_url: &str,
    novnc_url: Option<&str>,
    handles: &HashMap<String, Option<u32>>,
) -> HashMap<String, ServiceDescriptor> {
    let pid_of = |name: &str| handles.get(name).copied().flatten();
    let proxy_port = if chosen_url.starts_with("https") { 443 } else { 80 };
    let mut services = HashMap::new();

    services.insert(
        "nginx".to_string(),
        ServiceDescriptor {
            url: Some(chosen_url.to_string()),
            port: Some(proxy_port),
            pid: pid_of("nginx"),
            ..ServiceDescriptor::bare(ServiceStatus::Running)
        },
    );
    services.insert(
        "bridge".to_string(),
        ServiceDescriptor {
            url: Some(format!("{}/bridge", chosen_url)),
            port: Some(config.port),
            auth_token: Some(config.auth_token.clone()),
            pid: pid_of("bridge"),
            ..ServiceDescriptor::bare(ServiceStatus::Running)
        },
    );

    let gui_status = if config.headless {
        ServiceStatus::Disabled
    } else {
        ServiceStatus::Running
    };
    let (hint, requires_password) = password_hint(config);

    services.insert(
        "chrome_devtools".to_string(),
        ServiceDescriptor {
            port: Some(9222),
            display: Some(config.display.clone()),
            pid: pid_of("chrome"),
            ..ServiceDescriptor::bare(gui_status)
        },
    );
    services.insert(
        "virtual_display".to_string(),
        ServiceDescriptor {
            display: Some(config.display.clone()),
            resolution: Some(config.xvfb_resolution.clone()),
            ..ServiceDescriptor::bare(gui_status)
        },
    );
    services.insert(
        "vnc".to_string(),
        ServiceDescriptor {
            port: Some(config.vnc_port),
            password_hint: Some(hint.to_string()),
            ..ServiceDescriptor::bare(gui_status)
        },
    );
    services.insert(
        "novnc".to_string(),
        ServiceDescriptor {
            url: novnc_url.map(|u| u.to_string()),
            port: Some(config.novnc_port),
            path: Some(config.novnc_path.clone()),
            password_hint: Some(hint.to_string()),
            requires_password: Some(requires_password),
            ..ServiceDescriptor::bare(gui_status)
        },
    );

    services
}

/// The fixed teardown command sequence: stop each service via its pid
/// file when recorded, else pattern-kill by process signature.
fn stop_commands(display: &str) -> Vec<String> {
    vec![
        format!(
            "bash -lc 'if [ -f {dir}/bridge.pid ]; then kill $(cat {dir}/bridge.pid) 2>/dev/null || true; rm -f {dir}/bridge.pid; else pkill -f \"npm run start\" 2>/dev/null || true; fi'",
            dir = BRIDGE_DIR
        ),
        "sudo nginx -s quit".to_string(),
        "bash -lc 'if [ -f /home/user/chrome.pid ]; then kill $(cat /home/user/chrome.pid) 2>/dev/null || true; rm -f /home/user/chrome.pid; else pkill -f -- \"--remote-debugging-port=9222\" 2>/dev/null || true; fi'".to_string(),
        "bash -lc 'if [ -f /home/user/novnc.pid ]; then kill $(cat /home/user/novnc.pid) 2>/dev/null || true; rm -f /home/user/novnc.pid; else pkill -f websockify 2>/dev/null || true; fi'".to_string(),
        "bash -lc 'if [ -f /home/user/x11vnc.pid ]; then kill $(cat /home/user/x11vnc.pid) 2>/dev/null || true; rm -f /home/user/x11vnc.pid; else pkill -f x11vnc 2>/dev/null || true; fi'".to_string(),
        "bash -lc 'if [ -f /home/user/fluxbox.pid ]; then kill $(cat /home/user/fluxbox.pid) 2>/dev/null || true; rm -f /home/user/fluxbox.pid; else pkill -x fluxbox 2>/dev/null || true; fi'".to_string(),
        format!(
            "bash -lc 'if [ -f /home/user/xvfb.pid ]; then kill $(cat /home/user/xvfb.pid) 2>/dev/null || true; rm -f /home/user/xvfb.pid; else pkill -f \"Xvfb {}\" 2>/dev/null || true; fi'",
            display
        ),
    ]
}
