// ABOUTME: Integration tests for the sandbox lifecycle manager
// ABOUTME: Exercises create/stop flows against a scripted in-memory backend

mod common;

use bridgekit_sandboxes::{
    CreateOptions, SandboxConfig, SandboxError, SandboxManager, ServiceStatus,
};
use common::ScriptedBackend;
use std::sync::Arc;

fn test_config() -> SandboxConfig {
    SandboxConfig {
        template_id: "tmpl-test".to_string(),
        // Background loops are covered separately; keep tests deterministic
        keepalive_interval_secs: 0,
        platform_keepalive_interval_secs: 0,
        ..Default::default()
    }
}

fn no_wait() -> CreateOptions {
    CreateOptions {
        enable_internet: true,
        wait_for_ready: false,
    }
}

#[tokio::test]
async fn missing_template_fails_before_any_backend_call() {
    std::env::remove_var("BRIDGEKIT_TEMPLATE_ID");
    let (backend, state) = ScriptedBackend::new();
    let config = SandboxConfig {
        template_id: String::new(),
        ..test_config()
    };

    let err = match SandboxManager::new(config, Arc::new(backend)) {
        Ok(_) => panic!("construction must fail without a template reference"),
        Err(e) => e,
    };
    assert!(matches!(err, SandboxError::MissingTemplate));
    assert_eq!(state.allocation_count(), 0, "backend must not be touched");
}

#[tokio::test]
async fn duplicate_identifier_conflicts_without_second_allocation() {
    let (backend, state) = ScriptedBackend::new();
    let config = SandboxConfig {
        headless: true,
        ..test_config()
    };
    let manager = SandboxManager::new(config, Arc::new(backend)).unwrap();

    let first = manager.create_sandbox(Some("dup"), no_wait()).await;
    assert!(first.success, "first create failed: {:?}", first.error);
    assert_eq!(state.allocation_count(), 1);

    let second = manager.create_sandbox(Some("dup"), no_wait()).await;
    assert!(!second.success);
    assert!(
        second.error.as_deref().unwrap_or("").contains("already exists"),
        "unexpected error: {:?}",
        second.error
    );
    assert_eq!(
        state.allocation_count(),
        1,
        "conflicting create must not allocate a second sandbox"
    );
}

#[tokio::test]
async fn generated_identifiers_are_unique_among_live_records() {
    let (backend, _state) = ScriptedBackend::new();
    let config = SandboxConfig {
        headless: true,
        ..test_config()
    };
    let manager = SandboxManager::new(config, Arc::new(backend)).unwrap();

    let first = manager.create_sandbox(None, no_wait()).await;
    let second = manager.create_sandbox(None, no_wait()).await;
    assert!(first.success && second.success);
    assert_ne!(first.sandbox_id, second.sandbox_id);
    assert!(first.sandbox_id.starts_with("sandbox_"));
}

#[tokio::test]
async fn stop_unknown_sandbox_reports_not_found() {
    let (backend, _state) = ScriptedBackend::new();
    let manager = SandboxManager::new(test_config(), Arc::new(backend)).unwrap();

    let outcome = manager.stop_sandbox("ghost").await;
    assert!(!outcome.success);
    assert!(
        outcome.error.as_deref().unwrap_or("").contains("not found"),
        "unexpected error: {:?}",
        outcome.error
    );
}

#[tokio::test]
async fn headless_create_skips_gui_bootstrap_end_to_end() {
    let (backend, state) = ScriptedBackend::new();
    let config = SandboxConfig {
        headless: true,
        timeout_seconds: 600,
        port: 3000,
        ..test_config()
    };
    let manager = SandboxManager::new(config, Arc::new(backend)).unwrap();

    let outcome = manager.create_sandbox(Some("s1"), no_wait()).await;
    assert!(outcome.success, "create failed: {:?}", outcome.error);
    assert_eq!(outcome.backend_sandbox_id.as_deref(), Some("bk-1"));
    assert_eq!(
        outcome.public_url.as_deref(),
        Some("https://443-bk-1.example.test")
    );
    assert_eq!(outcome.timeout_seconds, Some(600));
    assert!(outcome.novnc_url.is_none(), "headless mode has no noVNC URL");

    // The GUI bootstrap script is never uploaded or launched
    let commands = state.recorded_commands();
    assert!(
        !commands.iter().any(|c| c.contains("startup.sh")),
        "GUI bootstrap ran in headless mode: {:?}",
        commands
    );
    let files = state.recorded_files();
    assert!(files.iter().any(|(path, _)| path.ends_with("/.env")));
    assert!(!files.iter().any(|(path, _)| path.contains("startup.sh")));

    // Remote-desktop services report as disabled, core services as running
    for name in ["chrome_devtools", "virtual_display", "vnc", "novnc"] {
        assert_eq!(
            outcome.services[name].status,
            ServiceStatus::Disabled,
            "{} should be disabled",
            name
        );
    }
    assert_eq!(outcome.services["nginx"].status, ServiceStatus::Running);
    assert_eq!(outcome.services["bridge"].status, ServiceStatus::Running);

    // Stop removes the record
    let stopped = manager.stop_sandbox("s1").await;
    assert!(stopped.success, "stop failed: {:?}", stopped.error);
    assert!(manager.list_sandboxes().await.is_empty());
    assert_eq!(state.termination_count(), 1);
}

#[tokio::test]
async fn teardown_continues_past_failing_stop_commands() {
    let (backend, state) = ScriptedBackend::new();
    let config = SandboxConfig {
        headless: true,
        ..test_config()
    };
    let manager = SandboxManager::new(config, Arc::new(backend)).unwrap();

    let outcome = manager.create_sandbox(Some("s1"), no_wait()).await;
    assert!(outcome.success);

    // One teardown command always fails; the rest must still run
    state.fail_commands_matching("nginx -s quit");
    let commands_before = state.recorded_commands().len();

    let stopped = manager.stop_sandbox("s1").await;
    assert!(stopped.success, "stop failed: {:?}", stopped.error);
    assert_eq!(state.termination_count(), 1);
    assert!(manager.list_sandboxes().await.is_empty());

    let stop_commands: Vec<String> = state
        .recorded_commands()
        .into_iter()
        .skip(commands_before)
        .collect();
    assert_eq!(stop_commands.len(), 7, "all stop commands must be attempted");
    assert!(stop_commands.last().unwrap().contains("Xvfb"));

    // Second stop is a clean no-op
    let again = manager.stop_sandbox("s1").await;
    assert!(!again.success);
    assert!(again.error.as_deref().unwrap_or("").contains("not found"));
}

#[tokio::test]
async fn stop_all_covers_every_live_sandbox() {
    let (backend, state) = ScriptedBackend::new();
    let config = SandboxConfig {
        headless: true,
        ..test_config()
    };
    let manager = SandboxManager::new(config, Arc::new(backend)).unwrap();

    assert!(manager.create_sandbox(Some("a"), no_wait()).await.success);
    assert!(manager.create_sandbox(Some("b"), no_wait()).await.success);
    assert_eq!(manager.list_sandboxes().await.len(), 2);

    let outcomes = manager.stop_all_sandboxes().await;
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o.success));
    assert!(manager.list_sandboxes().await.is_empty());
    assert_eq!(state.termination_count(), 2);
}

#[tokio::test]
async fn record_keeps_environment_and_handles_for_audit() {
    let (backend, _state) = ScriptedBackend::new();
    let config = SandboxConfig {
        headless: true,
        auth_token: "audit-token".to_string(),
        ..test_config()
    };
    let manager = SandboxManager::new(config, Arc::new(backend)).unwrap();

    assert!(manager.create_sandbox(Some("s1"), no_wait()).await.success);

    let env = manager.sandbox_environment("s1").await.unwrap();
    assert_eq!(env.base.get("AUTH_TOKEN").unwrap(), "audit-token");

    let handles = manager.service_handles("s1").await.unwrap();
    assert!(handles.contains_key("bridge"));
    assert!(handles.contains_key("nginx"));

    let summary = manager.get_sandbox("s1").await.unwrap();
    assert_eq!(summary.backend_sandbox_id, "bk-1");
}
