// ABOUTME: Bridgekit CLI entrypoint: runs a sandbox session or probes endpoints
// ABOUTME: Holds created sandboxes open until interrupted, then tears them down

use anyhow::Context;
use bridgekit_sandboxes::{
    CreateOptions, HttpBackend, ReadinessProber, SandboxConfig, SandboxManager,
};
use clap::{Parser, Subcommand};
use colored::*;
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bridgekit")]
#[command(about = "Bridgekit - ephemeral sandbox lifecycle manager")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a sandbox, keep it alive, and stop it on Ctrl+C
    Run {
        /// Logical sandbox identifier (generated when omitted)
        #[arg(long)]
        id: Option<String>,
        /// Template reference (falls back to BRIDGEKIT_TEMPLATE_ID)
        #[arg(long)]
        template_id: Option<String>,
        /// Skip the GUI/remote-desktop bootstrap
        #[arg(long)]
        headless: bool,
        /// Sandbox lifetime in seconds
        #[arg(long, default_value = "3600")]
        timeout: u64,
        /// Bridge service port inside the sandbox
        #[arg(long, default_value = "3000")]
        port: u16,
        /// Bearer token the bridge API requires
        #[arg(long)]
        auth_token: Option<String>,
        /// Do not wait for the readiness probe before reporting
        #[arg(long)]
        no_wait: bool,
        /// Disable internet egress for the sandbox
        #[arg(long)]
        no_internet: bool,
        /// Prefer the plain-transport public endpoint
        #[arg(long)]
        insecure: bool,
    },
    /// Probe candidate public URLs for a serving health endpoint
    Probe {
        /// Secure (TLS) candidate URL
        #[arg(long)]
        secure_url: String,
        /// Plain candidate URL (omit to probe the secure URL only)
        #[arg(long)]
        plain_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            id,
            template_id,
            headless,
            timeout,
            port,
            auth_token,
            no_wait,
            no_internet,
            insecure,
        } => {
            let mut config = SandboxConfig {
                timeout_seconds: timeout,
                port,
                headless,
                secure: !insecure,
                ..Default::default()
            };
            if let Some(template_id) = template_id {
                config.template_id = template_id;
            }
            if let Some(auth_token) = auth_token {
                config.auth_token = auth_token;
            }

            let options = CreateOptions {
                enable_internet: !no_internet,
                wait_for_ready: !no_wait,
            };
            run_session(config, id.as_deref(), options).await
        }
        Commands::Probe {
            secure_url,
            plain_url,
        } => {
            let prober = ReadinessProber::new()?;
            let result = prober.probe_once(&secure_url, plain_url.as_deref()).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.any_ok() {
                process::exit(1);
            }
            Ok(())
        }
    }
}

async fn run_session(
    config: SandboxConfig,
    id: Option<&str>,
    options: CreateOptions,
) -> anyhow::Result<()> {
    let api_url = std::env::var("BRIDGEKIT_API_URL")
        .context("BRIDGEKIT_API_URL must point at the sandbox control plane")?;
    let api_key =
        std::env::var("BRIDGEKIT_API_KEY").context("BRIDGEKIT_API_KEY must be set")?;
    let backend = HttpBackend::new(api_url, api_key)?;
    let manager = SandboxManager::new(config, Arc::new(backend))?;

    let outcome = manager.create_sandbox(id, options).await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if !outcome.success {
        eprintln!("{}", "Sandbox creation failed".red());
        process::exit(1);
    }

    if let Some(url) = &outcome.public_url {
        println!("{} {}", "Sandbox running at".green(), url);
    }
    println!("Press Ctrl+C to stop the sandbox");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    println!("{}", "Stopping sandbox...".yellow());
    let stopped = manager.stop_sandbox(&outcome.sandbox_id).await;
    println!("{}", serde_json::to_string_pretty(&stopped)?);
    if !stopped.success {
        process::exit(1);
    }
    Ok(())
}
