// ABOUTME: Integration tests for the service bootstrap pipeline
// ABOUTME: Verifies stage ordering, uploads, and launch guards against a scripted handle

mod common;

use bridgekit_sandboxes::assets::AssetCatalog;
use bridgekit_sandboxes::bootstrap::ServiceBootstrap;
use bridgekit_sandboxes::{AllocateSpec, SandboxBackend, SandboxConfig};
use common::ScriptedBackend;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn spec() -> AllocateSpec {
    AllocateSpec {
        template: "tmpl-test".to_string(),
        timeout_seconds: 600,
        metadata: None,
        secure: true,
        allow_internet: true,
    }
}

#[tokio::test]
async fn full_pipeline_uploads_and_launches_in_order() {
    let (backend, state) = ScriptedBackend::new();
    let handle = backend.allocate(&spec()).await.unwrap();

    let config = SandboxConfig {
        template_id: "tmpl-test".to_string(),
        auth_token: "boot-token".to_string(),
        ..Default::default()
    };
    let assets = AssetCatalog::from_config(&config).unwrap();
    let outcome = ServiceBootstrap::new(&config, &assets)
        .with_settle_delay(Duration::ZERO)
        .run(handle.as_ref())
        .await
        .unwrap();

    let files = state.recorded_files();
    let file_paths: Vec<&str> = files.iter().map(|(p, _)| p.as_str()).collect();
    assert!(file_paths.contains(&"/home/user/bridge/.env"));
    assert!(file_paths.contains(&"/home/user/nginx.conf.tmp"));
    assert!(file_paths.contains(&"/home/user/startup.sh"));
    assert!(file_paths.contains(&"/home/user/chrome-devtools-wrapper.sh"));
    assert!(file_paths.contains(&"/home/user/.config/bridge/servers.json"));

    // Env file values are shell-quoted
    let env_file = &files
        .iter()
        .find(|(p, _)| p.ends_with("/.env"))
        .unwrap()
        .1;
    assert!(env_file.contains("AUTH_TOKEN='boot-token'"));
    assert!(env_file.contains("LOG_LEVEL='info'"));

    let commands = state.recorded_commands();
    let position = |needle: &str| {
        commands
            .iter()
            .position(|c| c.contains(needle))
            .unwrap_or_else(|| panic!("no command containing '{}': {:?}", needle, commands))
    };

    let launch = position("startup_sh.pid");
    let probe = position("/health");
    let bridge_launch = position("bridge.pid");
    assert!(position("mkdir -p /home/user/bridge") < launch);
    assert!(launch < probe, "health probe must follow the script launch");
    assert!(probe < bridge_launch);
    assert!(commands.iter().any(|c| c.contains("npm ci --no-audit")));

    // Every known service has a handle slot, even when the pid is unknown
    for name in ["bridge", "nginx", "chrome", "novnc", "x11vnc", "fluxbox", "xvfb"] {
        assert!(outcome.handles.contains_key(name), "missing handle {}", name);
    }
    assert_eq!(outcome.env.service.get("VNC_PASSWORD").unwrap(), "");
}

#[tokio::test]
async fn bridge_launch_skipped_when_already_listening() {
    let (backend, state) = ScriptedBackend::new();
    let handle = backend.allocate(&spec()).await.unwrap();
    state.bridge_listening.store(true, Ordering::SeqCst);

    let config = SandboxConfig {
        template_id: "tmpl-test".to_string(),
        ..Default::default()
    };
    let assets = AssetCatalog::from_config(&config).unwrap();
    ServiceBootstrap::new(&config, &assets)
        .with_settle_delay(Duration::ZERO)
        .run(handle.as_ref())
        .await
        .unwrap();

    let commands = state.recorded_commands();
    assert!(
        !commands.iter().any(|c| c.contains("bridge.pid")),
        "bridge must not be relaunched when its port answers: {:?}",
        commands
    );
    assert!(!commands.iter().any(|c| c.contains("npm ci")));
}

#[tokio::test]
async fn headless_run_kills_gui_processes_and_ensures_core_services() {
    let (backend, state) = ScriptedBackend::new();
    let handle = backend.allocate(&spec()).await.unwrap();

    let config = SandboxConfig {
        template_id: "tmpl-test".to_string(),
        headless: true,
        ..Default::default()
    };
    let assets = AssetCatalog::from_config(&config).unwrap();
    ServiceBootstrap::new(&config, &assets)
        .with_settle_delay(Duration::ZERO)
        .run(handle.as_ref())
        .await
        .unwrap();

    let commands = state.recorded_commands();
    assert!(commands.iter().any(|c| c.contains("pkill -f websockify")));
    assert!(commands.iter().any(|c| c.contains("pkill -f x11vnc")));
    assert!(commands.iter().any(|c| c.contains("Xvfb :99")));
    assert!(commands
        .iter()
        .any(|c| c.contains("pgrep -x nginx >/dev/null || sudo nginx")));
    assert!(
        !commands.iter().any(|c| c.contains("startup_sh.pid")),
        "GUI bootstrap script must not launch in headless mode"
    );

    // The bridge env file is still written
    let files = state.recorded_files();
    assert!(files.iter().any(|(p, _)| p == "/home/user/bridge/.env"));
}

#[tokio::test]
async fn fatal_launch_failure_propagates() {
    let (backend, state) = ScriptedBackend::new();
    let handle = backend.allocate(&spec()).await.unwrap();
    state.fail_commands_matching("startup_sh.pid");

    let config = SandboxConfig {
        template_id: "tmpl-test".to_string(),
        ..Default::default()
    };
    let assets = AssetCatalog::from_config(&config).unwrap();
    let err = ServiceBootstrap::new(&config, &assets)
        .with_settle_delay(Duration::ZERO)
        .run(handle.as_ref())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Bootstrap failed"));
}
