// ABOUTME: Provisioning adapter traits over remote sandbox backends
// ABOUTME: Normalizes async and blocking backend shapes into one awaitable contract

use crate::error::{Result, SandboxError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Allocation parameters forwarded to the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateSpec {
    pub template: String,
    pub timeout_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
    pub secure: bool,
    pub allow_internet: bool,
}

/// Options for a single remote command execution
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub cwd: Option<String>,
    pub env: Option<HashMap<String, String>>,
    pub background: bool,
}

impl ExecOptions {
    pub fn in_dir(cwd: impl Into<String>) -> Self {
        Self {
            cwd: Some(cwd.into()),
            ..Default::default()
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }
}

/// Captured result of a remote command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A live sandbox allocated by a backend.
///
/// Everything the lifecycle manager does to a sandbox goes through this
/// trait: command execution, file upload, public-host lookup, termination.
#[async_trait]
pub trait SandboxHandle: Send + Sync {
    /// Backend-assigned sandbox identifier
    fn id(&self) -> &str;

    /// Access token issued by the backend, if any
    fn access_token(&self) -> Option<String> {
        None
    }

    /// Run a command inside the sandbox
    async fn execute(&self, command: &str, options: ExecOptions) -> Result<CommandOutput>;

    /// Write a file inside the sandbox
    async fn write_file(&self, path: &str, content: &str) -> Result<()>;

    /// Terminate the sandbox
    async fn terminate(&self) -> Result<()>;

    /// Externally reachable hostname for a given in-sandbox port
    fn public_host(&self, port: u16) -> Result<String>;
}

/// A remote sandbox provisioning backend with an async API
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    async fn allocate(&self, spec: &AllocateSpec) -> Result<Arc<dyn SandboxHandle>>;
}

/// Blocking-shaped counterpart of [`SandboxHandle`].
///
/// Some backend client libraries only offer synchronous calls; they
/// implement this trait and get wrapped by [`OffloadedBackend`] so the
/// orchestrator never blocks the scheduler.
pub trait BlockingSandboxHandle: Send + Sync + 'static {
    fn id(&self) -> String;
    fn access_token(&self) -> Option<String> {
        None
    }
    fn execute(&self, command: &str, options: ExecOptions) -> Result<CommandOutput>;
    fn write_file(&self, path: &str, content: &str) -> Result<()>;
    fn terminate(&self) -> Result<()>;
    fn public_host(&self, port: u16) -> Result<String>;
}

/// Blocking-shaped counterpart of [`SandboxBackend`]
pub trait BlockingSandboxBackend: Send + Sync + 'static {
    fn allocate(&self, spec: &AllocateSpec) -> Result<Box<dyn BlockingSandboxHandle>>;
}

/// Adapter that offloads every call of a blocking backend onto
/// `spawn_blocking`, presenting the uniform async contract.
///
/// Selected once at startup; business logic never branches on the
/// underlying backend shape.
pub struct OffloadedBackend<B: BlockingSandboxBackend> {
    inner: Arc<B>,
}

impl<B: BlockingSandboxBackend> OffloadedBackend<B> {
    pub fn new(backend: B) -> Self {
        Self {
            inner: Arc::new(backend),
        }
    }
}

#[async_trait]
impl<B: BlockingSandboxBackend> SandboxBackend for OffloadedBackend<B> {
    async fn allocate(&self, spec: &AllocateSpec) -> Result<Arc<dyn SandboxHandle>> {
        let inner = Arc::clone(&self.inner);
        let spec = spec.clone();
        let handle = run_blocking(move || inner.allocate(&spec)).await?;
        Ok(Arc::new(OffloadedHandle::new(handle)))
    }
}

/// Async wrapper around a blocking sandbox handle
pub struct OffloadedHandle {
    inner: Arc<dyn BlockingSandboxHandle>,
    id: String,
}

impl OffloadedHandle {
    fn new(handle: Box<dyn BlockingSandboxHandle>) -> Self {
        let inner: Arc<dyn BlockingSandboxHandle> = Arc::from(handle);
        let id = inner.id();
        Self { inner, id }
    }
}

#[async_trait]
impl SandboxHandle for OffloadedHandle {
    fn id(&self) -> &str {
        &self.id
    }

    fn access_token(&self) -> Option<String> {
        self.inner.access_token()
    }

    async fn execute(&self, command: &str, options: ExecOptions) -> Result<CommandOutput> {
        let inner = Arc::clone(&self.inner);
        let command = command.to_string();
        run_blocking(move || inner.execute(&command, options)).await
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let path = path.to_string();
        let content = content.to_string();
        run_blocking(move || inner.write_file(&path, &content)).await
    }

    async fn terminate(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        run_blocking(move || inner.terminate()).await
    }

    fn public_host(&self, port: u16) -> Result<String> {
        self.inner.public_host(port)
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SandboxError::Backend(format!("blocking backend task failed: {}", e)))?
}

/// Build the public URL for a sandbox, trying the port matching the
/// requested scheme first and falling back to the alternate mapping when
/// the backend has no hostname for it.
pub fn public_url(handle: &dyn SandboxHandle, secure: bool) -> Result<String> {
    let (port, scheme) = if secure { (443, "https") } else { (80, "http") };
    match handle.public_host(port) {
        Ok(hostname) => Ok(format!("{}://{}", scheme, hostname)),
        Err(_) => {
            let (alt_port, alt_scheme) = if secure { (80, "http") } else { (443, "https") };
            let hostname = handle.public_host(alt_port)?;
            Ok(format!("{}://{}", alt_scheme, hostname))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBlockingHandle {
        calls: Arc<AtomicUsize>,
    }

    impl BlockingSandboxHandle for CountingBlockingHandle {
        fn id(&self) -> String {
            "blocking-1".to_string()
        }

        fn execute(&self, command: &str, _options: ExecOptions) -> Result<CommandOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(CommandOutput {
                stdout: command.to_string(),
                stderr: String::new(),
                exit_code: 0,
            })
        }

        fn write_file(&self, _path: &str, _content: &str) -> Result<()> {
            Ok(())
        }

        fn terminate(&self) -> Result<()> {
            Ok(())
        }

        fn public_host(&self, port: u16) -> Result<String> {
            if port == 443 {
                Ok(format!("{}-blocking-1.example.dev", port))
            } else {
                Err(SandboxError::Backend("no mapping".to_string()))
            }
        }
    }

    struct CountingBlockingBackend {
        calls: Arc<AtomicUsize>,
    }

    impl BlockingSandboxBackend for CountingBlockingBackend {
        fn allocate(&self, _spec: &AllocateSpec) -> Result<Box<dyn BlockingSandboxHandle>> {
            Ok(Box::new(CountingBlockingHandle {
                calls: Arc::clone(&self.calls),
            }))
        }
    }

    #[tokio::test]
    async fn offloaded_backend_round_trips_calls() {
        let calls = Arc::new(AtomicUsize::new(0));
        let backend = OffloadedBackend::new(CountingBlockingBackend {
            calls: Arc::clone(&calls),
        });

        let spec = AllocateSpec {
            template: "tmpl".to_string(),
            timeout_seconds: 60,
            metadata: None,
            secure: true,
            allow_internet: true,
        };
        let handle = backend.allocate(&spec).await.unwrap();
        assert_eq!(handle.id(), "blocking-1");

        let out = handle.execute("echo hi", ExecOptions::default()).await.unwrap();
        assert_eq!(out.stdout, "echo hi");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn public_url_falls_back_to_alternate_port() {
        let backend = OffloadedBackend::new(CountingBlockingBackend {
            calls: Arc::new(AtomicUsize::new(0)),
        });
        let spec = AllocateSpec {
            template: "tmpl".to_string(),
            timeout_seconds: 60,
            metadata: None,
            secure: true,
            allow_internet: true,
        };
        let handle = backend.allocate(&spec).await.unwrap();

        // Secure mapping exists
        let url = public_url(handle.as_ref(), true).unwrap();
        assert_eq!(url, "https://443-blocking-1.example.dev");

        // Plain mapping is missing, so the secure one is used instead
        let url = public_url(handle.as_ref(), false).unwrap();
        assert_eq!(url, "https://443-blocking-1.example.dev");
    }
}
