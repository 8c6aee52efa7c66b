//! Access Engine CLI
//!
//! # Usage
//! ```bash
//! # Seed admin credentials, tier policies and the AppRole into Vault
//! access-engine --config access-engine.toml seed
//!
//! # Reconcile every configured platform
//! access-engine reconcile --output json
//!
//! # Reconcile one platform only
//! access-engine reconcile --platform gitea
//!
//! # Check which platforms answer their health endpoint
//! access-engine probe
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use lornu_access::adapters::build_adapter;
use lornu_access::reconciler::build_http_client;
use lornu_access::{
    run_reconciliation, AccessConfig, ReadinessProber, SecretStore, Seeder, VaultClient,
};

// ============================================================
// CLI Definition
// ============================================================

#[derive(Parser)]
#[command(name = "access-engine")]
#[command(about = "Lornu AI Access Engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration
    #[arg(long, env = "ACCESS_ENGINE_CONFIG", default_value = "access-engine.toml")]
    config: String,

    /// Secret store address (overrides the config file)
    #[arg(long, env = "VAULT_ADDR")]
    vault_addr: Option<String>,

    /// Static secret store token
    #[arg(long, env = "VAULT_TOKEN", hide_env_values = true)]
    vault_token: Option<String>,

    /// AppRole role id, used when no token is given
    #[arg(long, env = "VAULT_ROLE_ID")]
    role_id: Option<String>,

    /// AppRole secret id
    #[arg(long, env = "VAULT_SECRET_ID", hide_env_values = true)]
    secret_id: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Write admin credentials, tier policies and the machine-auth role
    Seed,

    /// Drive every platform to the three-tier access model
    Reconcile {
        /// Only reconcile the named platforms (repeatable)
        #[arg(long = "platform")]
        platforms: Vec<String>,

        #[arg(long, value_enum, default_value = "table")]
        output: OutputFormat,

        /// Maximum platforms reconciled at once
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Probe each platform's health endpoint once per interval until ready
    Probe,
}

// ============================================================
// Main Entry Point
// ============================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs)?;

    let mut config = AccessConfig::from_file(&cli.config)?;
    apply_overrides(&mut config, &cli);

    match cli.command {
        Commands::Seed => {
            let vault = Arc::new(connect_vault(&config).await?);
            let store = Arc::new(SecretStore::new(vault.clone()));
            let report = Seeder::new(store, vault)
                .seed(&config)
                .await
                .context("Seeding the secret store failed")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Reconcile {
            platforms,
            output,
            concurrency,
        } => {
            config.retain_platforms(&platforms);
            if config.platforms.is_empty() {
                bail!("no platform matches the requested filter");
            }
            if concurrency.is_some() {
                config.concurrency = concurrency;
            }

            let vault = connect_vault(&config).await?;
            let store = Arc::new(SecretStore::new(Arc::new(vault)));
            let report = run_reconciliation(&config, store).await?;

            match output {
                OutputFormat::Table => print!("{}", report.display()),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
            if !report.all_converged() {
                warn!("Some platforms did not converge; re-run once they are healthy");
            }
        }

        Commands::Probe => {
            let http = build_http_client(config.request_timeout())
                .context("Failed to create HTTP client")?;
            let prober = ReadinessProber::new(http, &config.readiness);

            let probes = config.platforms.iter().map(|platform| {
                let prober = &prober;
                async move {
                    let url = build_adapter(platform).probe_url();
                    let readiness = prober.await_ready(&url).await;
                    (platform.name.clone(), url, readiness)
                }
            });

            println!("\n{:<16} {:<48} {:<10}", "PLATFORM", "PROBE URL", "READY");
            println!("{}", "-".repeat(76));
            for (name, url, readiness) in join_all(probes).await {
                println!(
                    "{:<16} {:<48} {:<10}",
                    name,
                    url,
                    if readiness.is_ready() { "yes" } else { "no" }
                );
            }
        }
    }

    Ok(())
}

fn init_logging(verbose: bool, json: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if json {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

/// Command-line and environment values win over the config file
fn apply_overrides(config: &mut AccessConfig, cli: &Cli) {
    if let Some(addr) = &cli.vault_addr {
        config.secret_store.address = addr.clone();
    }
    if let Some(token) = &cli.vault_token {
        config.secret_store.token = Some(token.clone());
    }
    if let Some(role_id) = &cli.role_id {
        config.secret_store.role_id = Some(role_id.clone());
    }
    if let Some(secret_id) = &cli.secret_id {
        config.secret_store.secret_id = Some(secret_id.clone());
    }
}

/// Token auth when a token is configured, AppRole login otherwise
async fn connect_vault(config: &AccessConfig) -> Result<VaultClient> {
    let http = build_http_client(config.request_timeout()).context("Failed to create HTTP client")?;
    let store = &config.secret_store;

    if let Some(token) = &store.token {
        info!(address = %store.address, "🔐 Using token auth for the secret store");
        return Ok(VaultClient::new(http, &store.address, &store.mount, token.clone()));
    }

    match (&store.role_id, &store.secret_id) {
        (Some(role_id), Some(secret_id)) => {
            info!(address = %store.address, "🔐 Logging in to the secret store via AppRole");
            VaultClient::login_approle(http, &store.address, &store.mount, role_id, secret_id)
                .await
                .context("AppRole login failed")
        }
        _ => bail!("no secret store credentials: set VAULT_TOKEN or VAULT_ROLE_ID and VAULT_SECRET_ID"),
    }
}
