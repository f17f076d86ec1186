//! Bot OAuth helper
//!
//! One-shot operator tool that:
//! 1. Resolves the bot's credentials through the secret chain
//! 2. Generates a PKCE authorization URL for the bot account
//! 3. Receives the browser redirect on a local listener and exchanges the code
//! 4. Writes and later refreshes the persisted token file

mod commands;
mod config;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::Context;
use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "bot-auth", author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML config (falls back to CONFIG_PATH, then bot-auth.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a PKCE pair and print the authorization URL
    Authorize {
        /// Print the verifier and state instead of saving them to the dotenv file
        #[arg(long)]
        no_persist: bool,
    },
    /// Wait for the redirect of a previously generated URL and exchange the code
    Callback,
    /// Authorize and wait for the redirect in one run
    Login,
    /// Refresh the access token if it is about to expire
    Refresh {
        /// Refresh when the token expires within this many seconds
        #[arg(long, default_value_t = 300)]
        threshold_secs: u64,
    },
    /// Resolve the required secrets and show where each one came from
    Check {
        /// Secret that must resolve (repeatable; defaults to TW_CLIENT_ID and OAUTH2_USER_ACCESS_TOKEN)
        #[arg(long = "require", value_name = "NAME")]
        require: Vec<String>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

/// Initialize tracing with LOG_LEVEL / RUST_LOG support. Logs go to stderr so
/// stdout carries only operator-facing output.
fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    if let Err(e) = run(cli).await {
        error!(error = %format!("{e:#}"), "bot-auth failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let (config, loaded_from) = Config::load_resolved(cli.config.as_deref())?;
    match &loaded_from {
        Some(path) => info!(path = %path.display(), "configuration loaded"),
        None => info!("no config file found, using defaults"),
    }

    // Tokens written by login/refresh are readable through the chain
    let token_file = bot_secrets::DotenvBackend::load_if_present(&config.storage.token_file)
        .await
        .context("failed to read token file")?;
    let chain = bot_secrets::SecretChain::from_process(config::secret_defaults())
        .await
        .context("failed to initialize secret backends")?
        .with_read_only_file(token_file);
    let http = reqwest::Client::builder()
        .timeout(config.oauth.request_timeout())
        .build()
        .context("failed to build HTTP client")?;

    let ctx = Context {
        config,
        chain,
        http,
    };

    match cli.command {
        Commands::Authorize { no_persist } => commands::authorize(&ctx, no_persist).await,
        Commands::Callback => commands::callback(&ctx).await,
        Commands::Login => commands::login(&ctx).await,
        Commands::Refresh { threshold_secs } => {
            commands::refresh(&ctx, Duration::from_secs(threshold_secs)).await
        }
        Commands::Check { require } => commands::check(&ctx, &require).await,
    }
}
