// ABOUTME: Concrete provisioning adapter for an HTTP control-plane API
// ABOUTME: Talks to a remote sandbox service (allocate/exec/files/terminate) via reqwest

use crate::backend::{AllocateSpec, CommandOutput, ExecOptions, SandboxBackend, SandboxHandle};
use crate::error::{Result, SandboxError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
// Remote commands (dependency installs in particular) can run for minutes.
const EXEC_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Deserialize)]
struct AllocateResponse {
    sandbox_id: String,
    /// Domain public hostnames are minted under, e.g. "sandbox.example.dev"
    domain: String,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct ExecRequest<'a> {
    command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cwd: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    env: Option<&'a HashMap<String, String>>,
    background: bool,
}

#[derive(Debug, Serialize)]
struct FileWriteRequest<'a> {
    path: &'a str,
    content: &'a str,
}

/// Backend adapter for an E2B-style sandbox control plane.
///
/// Public hostnames follow the `{port}-{sandbox_id}.{domain}` convention,
/// so `public_host` needs no network round trip.
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(EXEC_REQUEST_TIMEOUT)
            .connect_timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.api_key)
    }
}

#[async_trait]
impl SandboxBackend for HttpBackend {
    async fn allocate(&self, spec: &AllocateSpec) -> Result<Arc<dyn SandboxHandle>> {
        let url = format!("{}/v1/sandboxes", self.base_url);
        debug!("Allocating sandbox (template={})", spec.template);

        let response = self
            .client
            .post(&url)
            .header("Authorization", self.auth_header())
            .json(spec)
            .send()
            .await
            .map_err(|e| SandboxError::Provisioning(e.to_string()))?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                let allocated: AllocateResponse = response
                    .json()
                    .await
                    .map_err(|e| SandboxError::Provisioning(e.to_string()))?;
                debug!("Allocated sandbox {}", allocated.sandbox_id);
                Ok(Arc::new(HttpSandboxHandle {
                    client: self.client.clone(),
                    base_url: self.base_url.clone(),
                    api_key: self.api_key.clone(),
                    sandbox_id: allocated.sandbox_id,
                    domain: allocated.domain,
                    access_token: allocated.access_token,
                }))
            }
            status => {
                let body = response.text().await.unwrap_or_else(|_| status.to_string());
                error!("Sandbox allocation failed ({}): {}", status, body);
                Err(SandboxError::Provisioning(body))
            }
        }
    }
}

/// Handle for one sandbox on the HTTP control plane
pub struct HttpSandboxHandle {
    client: Client,
    base_url: String,
    api_key: String,
    sandbox_id: String,
    domain: String,
    access_token: Option<String>,
}

impl HttpSandboxHandle {
    fn sandbox_url(&self, suffix: &str) -> String {
        format!(
            "{}/v1/sandboxes/{}/{}",
            self.base_url, self.sandbox_id, suffix
        )
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.api_key)
    }
}

#[async_trait]
impl SandboxHandle for HttpSandboxHandle {
    fn id(&self) -> &str {
        &self.sandbox_id
    }

    fn access_token(&self) -> Option<String> {
        self.access_token.clone()
    }

    async fn execute(&self, command: &str, options: ExecOptions) -> Result<CommandOutput> {
        let request = ExecRequest {
            command,
            cwd: options.cwd.as_deref(),
            env: options.env.as_ref(),
            background: options.background,
        };

        let response = self
            .client
            .post(self.sandbox_url("commands"))
            .header("Authorization", self.auth_header())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_else(|_| status.to_string());
            return Err(SandboxError::Backend(format!(
                "command failed ({}): {}",
                status, body
            )));
        }

        Ok(response.json::<CommandOutput>().await?)
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let request = FileWriteRequest { path, content };
        let response = self
            .client
            .put(self.sandbox_url("files"))
            .header("Authorization", self.auth_header())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_else(|_| status.to_string());
            return Err(SandboxError::Backend(format!(
                "file write failed ({}): {}",
                status, body
            )));
        }
        Ok(())
    }

    async fn terminate(&self) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}/v1/sandboxes/{}", self.base_url, self.sandbox_id))
            .header("Authorization", self.auth_header())
            .send()
            .await?;

        // A sandbox the platform already reclaimed is not an error
        if response.status() == StatusCode::NOT_FOUND {
            debug!("Sandbox {} already gone", self.sandbox_id);
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(SandboxError::Backend(format!(
                "terminate failed: {}",
                response.status()
            )));
        }
        Ok(())
    }

    fn public_host(&self, port: u16) -> Result<String> {
        Ok(format!("{}-{}.{}", port, self.sandbox_id, self.domain))
    }
}
