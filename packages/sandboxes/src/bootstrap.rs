// ABOUTME: Ordered bootstrap pipeline that takes a fresh sandbox to a serving state
// ABOUTME: Stages are idempotent; only script and service launch failures are fatal

use crate::assets::{AssetCatalog, DEVTOOLS_WRAPPER, NGINX_CONF, SERVERS_MANIFEST, STARTUP_SCRIPT};
use crate::backend::{ExecOptions, SandboxHandle};
use crate::error::{Result, SandboxError};
use crate::types::{SandboxConfig, ServiceEnvironment};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Working directory of the bridge service inside the sandbox
pub const BRIDGE_DIR: &str = "/home/user/bridge";
const HOME_DIR: &str = "/home/user";

/// Delay after launching the bootstrap script, giving services time to bind
const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(5);

/// Known service names, in teardown order
pub const SERVICE_NAMES: [&str; 7] = [
    "bridge", "nginx", "chrome", "novnc", "x11vnc", "fluxbox", "xvfb",
];

/// What the pipeline produced: per-service process ids (where known) and
/// the environment the launches used, for audit and response assembly.
#[derive(Debug)]
pub struct BootstrapOutcome {
    pub handles: HashMap<String, Option<u32>>,
    pub env: ServiceEnvironment,
}

/// Runs the bootstrap pipeline against one sandbox.
///
/// Stage order is fixed: bridge env file, proxy config push, then either
/// the headless shortcut (GUI processes killed, proxy and bridge ensured)
/// or the full GUI path (bootstrap script upload and launch, helper
/// uploads, bridge launch guard).
pub struct ServiceBootstrap<'a> {
    config: &'a SandboxConfig,
    assets: &'a AssetCatalog,
    settle_delay: Duration,
}

impl<'a> ServiceBootstrap<'a> {
    pub fn new(config: &'a SandboxConfig, assets: &'a AssetCatalog) -> Self {
        Self {
            config,
            assets,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }

    /// Override the post-launch settle delay (tests use zero)
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub async fn run(&self, handle: &dyn SandboxHandle) -> Result<BootstrapOutcome> {
        let env = ServiceEnvironment::derive(self.config);
        let mut handles: HashMap<String, Option<u32>> = SERVICE_NAMES
            .iter()
            .map(|name| (name.to_string(), None))
            .collect();

        self.write_bridge_env(handle, &env).await?;
        self.push_proxy_config(handle).await;

        if self.config.headless {
            info!("Headless mode: skipping GUI bootstrap");
            self.kill_gui_processes(handle).await;
            self.ensure_proxy(handle).await;
            self.ensure_bridge(handle, &env).await;
            return Ok(BootstrapOutcome { handles, env });
        }

        self.upload_startup_script(handle).await?;
        self.upload_helpers(handle, &env).await;
        self.launch_startup_script(handle, &env).await?;
        self.ensure_bridge(handle, &env).await;

        handles.insert("startup".to_string(), None);
        Ok(BootstrapOutcome { handles, env })
    }

    /// Stage 1: bridge working directory and shell-quoted environment file
    async fn write_bridge_env(
        &self,
        handle: &dyn SandboxHandle,
        env: &ServiceEnvironment,
    ) -> Result<()> {
        debug!("Writing bridge environment file");
        let mkdir = format!("mkdir -p {}", BRIDGE_DIR);
        let output = handle
            .execute(&mkdir, ExecOptions::in_dir(HOME_DIR).with_env(env.base.clone()))
            .await?;
        if !output.success() {
            return Err(SandboxError::BootstrapFailed(format!(
                "could not create bridge directory: {}",
                output.stderr
            )));
        }

        let contents = render_env_file(self.config);
        handle
            .write_file(&format!("{}/.env", BRIDGE_DIR), &contents)
            .await?;
        Ok(())
    }

    /// Stage 2: push the reverse proxy config and apply it when the proxy
    /// is already up. Best-effort; the image default stays otherwise.
    async fn push_proxy_config(&self, handle: &dyn SandboxHandle) {
        let conf = match self.assets.fetch(NGINX_CONF).await {
            Ok(conf) => conf,
            Err(e) => {
                warn!("Proxy config unavailable, keeping image default: {}", e);
                return;
            }
        };

        if let Err(e) = handle
            .write_file(&format!("{}/nginx.conf.tmp", HOME_DIR), &conf)
            .await
        {
            warn!("Failed to push proxy config: {}", e);
            return;
        }

        let apply = "bash -lc 'set -e; \
             sudo cp /home/user/nginx.conf.tmp /etc/nginx/sites-available/default; \
             if pgrep -x nginx >/dev/null; then \
               sudo nginx -t && sudo nginx -s reload; \
             else echo nginx not running yet; fi'";
        self.run_best_effort(handle, apply, None, "apply proxy config")
            .await;
    }

    /// Headless stage: any GUI processes left over from a previous run are
    /// killed outright, failures ignored.
    async fn kill_gui_processes(&self, handle: &dyn SandboxHandle) {
        let kills = [
            "bash -lc 'pkill -f -- \"--remote-debugging-port=9222\" 2>/dev/null || true'".to_string(),
            "bash -lc 'pkill -f websockify 2>/dev/null || true'".to_string(),
            "bash -lc 'pkill -f x11vnc 2>/dev/null || true'".to_string(),
            "bash -lc 'pkill -x fluxbox 2>/dev/null || true'".to_string(),
            format!(
                "bash -lc 'pkill -f \"Xvfb {}\" 2>/dev/null || true'",
                self.config.display
            ),
        ];
        for cmd in &kills {
            self.run_best_effort(handle, cmd, None, "kill GUI process")
                .await;
        }
    }

    async fn ensure_proxy(&self, handle: &dyn SandboxHandle) {
        self.run_best_effort(
            handle,
            "bash -lc 'pgrep -x nginx >/dev/null || sudo nginx'",
            None,
            "ensure reverse proxy",
        )
        .await;
    }

    /// Stage 4: make sure the bootstrap script exists inside the sandbox,
    /// uploading our copy over any existing one. Fatal when no content
    /// source can supply it.
    async fn upload_startup_script(&self, handle: &dyn SandboxHandle) -> Result<()> {
        let script = self.assets.fetch(STARTUP_SCRIPT).await?;
        info!("Uploading bootstrap script (overwriting existing copy)");
        handle
            .write_file(&format!("{}/{}", HOME_DIR, STARTUP_SCRIPT), &script)
            .await?;
        Ok(())
    }

    /// Stage 5: helper wrapper and service descriptor, both optional
    async fn upload_helpers(&self, handle: &dyn SandboxHandle, env: &ServiceEnvironment) {
        match self.assets.fetch(DEVTOOLS_WRAPPER).await {
            Ok(wrapper) => {
                if let Err(e) = handle
                    .write_file(&format!("{}/{}", HOME_DIR, DEVTOOLS_WRAPPER), &wrapper)
                    .await
                {
                    warn!("Failed to upload devtools wrapper: {}", e);
                } else {
                    self.run_best_effort(
                        handle,
                        &format!("bash -lc 'chmod +x {}/{}'", HOME_DIR, DEVTOOLS_WRAPPER),
                        None,
                        "chmod devtools wrapper",
                    )
                    .await;
                }
            }
            Err(e) => warn!("Devtools wrapper unavailable: {}", e),
        }

        match self.assets.fetch(SERVERS_MANIFEST).await {
            Ok(manifest) => {
                self.run_best_effort(
                    handle,
                    "mkdir -p /home/user/.config/bridge",
                    Some(env.base.clone()),
                    "create descriptor directory",
                )
                .await;
                if let Err(e) = handle
                    .write_file("/home/user/.config/bridge/servers.json", &manifest)
                    .await
                {
                    warn!("Failed to upload service descriptor: {}", e);
                }
            }
            Err(e) => warn!("Service descriptor unavailable: {}", e),
        }
    }

    /// Stage 6: launch the bootstrap script detached, guarded by its pid
    /// file. This is the one fatal launch in the pipeline.
    async fn launch_startup_script(
        &self,
        handle: &dyn SandboxHandle,
        env: &ServiceEnvironment,
    ) -> Result<()> {
        self.run_best_effort(
            handle,
            &format!("bash -lc 'chmod +x {}/{}'", HOME_DIR, STARTUP_SCRIPT),
            None,
            "chmod bootstrap script",
        )
        .await;

        info!("Launching bootstrap script");
        let launch = "bash -lc '\
             if [ -f /home/user/startup_sh.pid ] && kill -0 $(cat /home/user/startup_sh.pid) 2>/dev/null; then \
               echo startup script already running; \
             else \
               nohup /home/user/startup.sh > /home/user/startup.log 2>&1 & \
               echo $! > /home/user/startup_sh.pid; \
             fi'";
        let output = handle
            .execute(
                launch,
                ExecOptions::in_dir(HOME_DIR).with_env(env.service.clone()),
            )
            .await
            .map_err(|e| SandboxError::BootstrapFailed(e.to_string()))?;
        if !output.success() {
            return Err(SandboxError::BootstrapFailed(format!(
                "bootstrap script launch exited {}: {}",
                output.exit_code, output.stderr
            )));
        }

        if !self.settle_delay.is_zero() {
            debug!("Allowing services {:?} to settle", self.settle_delay);
            tokio::time::sleep(self.settle_delay).await;
        }
        Ok(())
    }

    /// Stage 7: start the bridge service only if its port is not already
    /// answering, with an idempotent dependency guard first.
    async fn ensure_bridge(&self, handle: &dyn SandboxHandle, env: &ServiceEnvironment) {
        let port = self.config.port;
        info!("Ensuring bridge service is running on port {}", port);

        let probe = format!(
            "bash -lc \"code=$(curl -s -o /dev/null -w '%{{http_code}}' http://127.0.0.1:{}/health || true); echo $code\"",
            port
        );
        let listening = match handle.execute(&probe, ExecOptions::in_dir(HOME_DIR)).await {
            Ok(output) => output.stdout.contains("200"),
            Err(_) => false,
        };
        if listening {
            info!("Port {} already listening; skipping bridge launch", port);
            return;
        }

        let dep_guard = format!(
            "bash -lc 'set -e; cd {}; \
             FORCE=${{NPM_CI_ALWAYS:-0}}; \
             if [ \"$FORCE\" = \"1\" ] || [ ! -d node_modules ] || [ package-lock.json -nt node_modules ] || [ package.json -nt node_modules ]; then \
               npm ci --no-audit || npm install --no-audit; \
             else \
               echo dependencies up to date; \
             fi'",
            BRIDGE_DIR
        );
        self.run_best_effort(handle, &dep_guard, Some(env.base.clone()), "dependency guard")
            .await;

        let launch = format!(
            "bash -lc 'set -e; cd {}; \
             nohup npm run start > start.log 2>&1 & echo $! > bridge.pid'",
            BRIDGE_DIR
        );
        match handle
            .execute(
                &launch,
                ExecOptions::in_dir(HOME_DIR).with_env(env.bridge.clone()),
            )
            .await
        {
            Ok(output) if output.success() => {}
            Ok(output) => warn!(
                "Bridge launch exited {}: {}",
                output.exit_code, output.stderr
            ),
            Err(e) => warn!("Bridge launch failed: {}", e),
        }
    }

    async fn run_best_effort(
        &self,
        handle: &dyn SandboxHandle,
        command: &str,
        env: Option<HashMap<String, String>>,
        what: &str,
    ) {
        let mut options = ExecOptions::in_dir(HOME_DIR);
        if let Some(env) = env {
            options = options.with_env(env);
        }
        match handle.execute(command, options).await {
            Ok(output) if output.success() => {}
            Ok(output) => warn!("Failed to {}: {}", what, output.stderr),
            Err(e) => warn!("Failed to {}: {}", what, e),
        }
    }
}

/// Render the bridge `.env` file. Values are single-quoted so tokens
/// containing `#`, spaces, or `=` survive naive parsers.
fn render_env_file(config: &SandboxConfig) -> String {
    format!(
        "AUTH_TOKEN={}\nPORT={}\nHOST={}\nLOG_LEVEL={}\n",
        shell_quote(&config.auth_token),
        shell_quote(&config.port.to_string()),
        shell_quote(&config.host),
        shell_quote("info"),
    )
}

/// Single-quote a value for shell consumption, escaping embedded quotes
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}
