// ABOUTME: Shared test doubles for lifecycle and bootstrap integration tests
// ABOUTME: ScriptedBackend records every command and file write, with optional fault injection

#![allow(dead_code)]

use async_trait::async_trait;
use bridgekit_sandboxes::{
    AllocateSpec, CommandOutput, ExecOptions, Result, SandboxBackend, SandboxError, SandboxHandle,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Observable state shared between a test and its scripted backend
#[derive(Default)]
pub struct BackendState {
    pub commands: Mutex<Vec<String>>,
    pub files: Mutex<Vec<(String, String)>>,
    pub allocations: AtomicUsize,
    pub terminations: AtomicUsize,
    /// Commands containing this substring fail with a backend error
    pub fail_command_pattern: Mutex<Option<String>>,
    pub fail_terminate: AtomicBool,
    /// Makes the in-sandbox bridge health probe report 200
    pub bridge_listening: AtomicBool,
}

impl BackendState {
    pub fn allocation_count(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    pub fn termination_count(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    pub fn recorded_commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn recorded_files(&self) -> Vec<(String, String)> {
        self.files.lock().unwrap().clone()
    }

    pub fn fail_commands_matching(&self, pattern: &str) {
        *self.fail_command_pattern.lock().unwrap() = Some(pattern.to_string());
    }
}

/// In-memory backend that hands out scripted handles
pub struct ScriptedBackend {
    state: Arc<BackendState>,
}

impl ScriptedBackend {
    pub fn new() -> (Self, Arc<BackendState>) {
        let state = Arc::new(BackendState::default());
        (
            Self {
                state: Arc::clone(&state),
            },
            state,
        )
    }
}

#[async_trait]
impl SandboxBackend for ScriptedBackend {
    async fn allocate(&self, _spec: &AllocateSpec) -> Result<Arc<dyn SandboxHandle>> {
        let n = self.state.allocations.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(ScriptedHandle {
            id: format!("bk-{}", n),
            state: Arc::clone(&self.state),
        }))
    }
}

pub struct ScriptedHandle {
    id: String,
    state: Arc<BackendState>,
}

#[async_trait]
impl SandboxHandle for ScriptedHandle {
    fn id(&self) -> &str {
        &self.id
    }

    fn access_token(&self) -> Option<String> {
        Some("scripted-access-token".to_string())
    }

    async fn execute(&self, command: &str, _options: ExecOptions) -> Result<CommandOutput> {
        self.state
            .commands
            .lock()
            .unwrap()
            .push(command.to_string());

        let should_fail = self
            .state
            .fail_command_pattern
            .lock()
            .unwrap()
            .as_ref()
            .map(|pattern| command.contains(pattern.as_str()))
            .unwrap_or(false);
        if should_fail {
            return Err(SandboxError::Backend(format!(
                "injected failure for: {}",
                command
            )));
        }

        // The in-sandbox health probe decides whether bootstrap launches
        // the bridge service; default is "not listening".
        let stdout = if command.contains("/health") {
            if self.state.bridge_listening.load(Ordering::SeqCst) {
                "200\n".to_string()
            } else {
                "000\n".to_string()
            }
        } else {
            String::new()
        };
        Ok(CommandOutput {
            stdout,
            stderr: String::new(),
            exit_code: 0,
        })
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        self.state
            .files
            .lock()
            .unwrap()
            .push((path.to_string(), content.to_string()));
        Ok(())
    }

    async fn terminate(&self) -> Result<()> {
        self.state.terminations.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_terminate.load(Ordering::SeqCst) {
            return Err(SandboxError::Backend("injected terminate failure".to_string()));
        }
        Ok(())
    }

    fn public_host(&self, port: u16) -> Result<String> {
        Ok(format!("{}-{}.example.test", port, self.id))
    }
}
