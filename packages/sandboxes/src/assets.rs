// ABOUTME: Bootstrap artifact catalog with remote, local, and packaged sources
// ABOUTME: Remote fetch is tried first when configured, silently falling back to local content

use crate::error::{Result, SandboxError};
use crate::types::SandboxConfig;
use reqwest::Client;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// Bootstrap script that brings up the GUI/remote-desktop stack
pub const STARTUP_SCRIPT: &str = "startup.sh";
/// Reverse proxy configuration pushed into the sandbox
pub const NGINX_CONF: &str = "nginx.conf";
/// Helper wrapper that launches the browser with a devtools endpoint
pub const DEVTOOLS_WRAPPER: &str = "chrome-devtools-wrapper.sh";
/// Service descriptor document consumed by the bridge service
pub const SERVERS_MANIFEST: &str = "servers.json";

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves bootstrap artifacts by name.
///
/// Resolution order: configured remote base URL (if any), then a local
/// override directory (if any), then the content packaged into this crate.
/// Remote and local failures fall through silently; an artifact with no
/// source at all is an [`SandboxError::AssetUnavailable`].
pub struct AssetCatalog {
    base_url: Option<String>,
    local_dir: Option<PathBuf>,
    client: Client,
}

impl AssetCatalog {
    pub fn from_config(config: &SandboxConfig) -> Result<Self> {
        let client = Client::builder().timeout(FETCH_TIMEOUT).build()?;
        Ok(Self {
            base_url: config
                .asset_base_url
                .as_ref()
                .map(|u| u.trim_end_matches('/').to_string()),
            local_dir: config.asset_dir.clone(),
            client,
        })
    }

    /// Resolve one artifact to its content
    pub async fn fetch(&self, name: &str) -> Result<String> {
        if let Some(content) = self.fetch_remote(name).await {
            return Ok(content);
        }
        if let Some(content) = self.read_local(name) {
            return Ok(content);
        }
        match packaged(name) {
            Some(content) => Ok(content.to_string()),
            None => Err(SandboxError::AssetUnavailable(name.to_string())),
        }
    }

    async fn fetch_remote(&self, name: &str) -> Option<String> {
        let base = self.base_url.as_ref()?;
        let url = format!("{}/{}", base, name);
        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => match response.text().await {
                Ok(body) if !body.trim().is_empty() => {
                    debug!("Fetched {} from {}", name, url);
                    Some(body)
                }
                Ok(_) => {
                    warn!("Remote artifact {} is empty; falling back", url);
                    None
                }
                Err(e) => {
                    warn!("Failed reading remote artifact {}: {}", url, e);
                    None
                }
            },
            Ok(response) => {
                warn!(
                    "Remote artifact {} returned {}; falling back",
                    url,
                    response.status()
                );
                None
            }
            Err(e) => {
                warn!("Failed fetching remote artifact {}: {}", url, e);
                None
            }
        }
    }

    fn read_local(&self, name: &str) -> Option<String> {
        let dir = self.local_dir.as_ref()?;
        let path = dir.join(name);
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                debug!("Loaded {} from {}", name, path.display());
                Some(content)
            }
            Err(_) => None,
        }
    }
}

/// Content compiled into the crate, used when no other source applies
fn packaged(name: &str) -> Option<&'static str> {
    match name {
        STARTUP_SCRIPT => Some(include_str!("../assets/startup.sh")),
        NGINX_CONF => Some(include_str!("../assets/nginx.conf")),
        DEVTOOLS_WRAPPER => Some(include_str!("../assets/chrome-devtools-wrapper.sh")),
        SERVERS_MANIFEST => Some(include_str!("../assets/servers.json")),
        _ => None,
    }
}
