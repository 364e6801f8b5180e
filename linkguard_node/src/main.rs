use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use linkguard_node::{
    api::{ApiServer, AppState},
    config::{Config, LogFormat},
    crypto::{KeyExchange, OriginVerifier, KEY_BITS},
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "LinkGuard ban-evasion cluster node", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the ingest and operator listeners (default)
    Serve,
    /// Generate an RSA key pair for the node
    Keygen {
        /// Directory receiving private_key.pem and public_key.pem
        #[arg(short, long, default_value = "keys")]
        out: PathBuf,
        /// Modulus size in bits
        #[arg(long, default_value_t = KEY_BITS)]
        bits: usize,
    },
    /// Print the claim hash the backend must send for an account id
    SignClaim {
        #[arg(long)]
        account_id: String,
    },
    /// Write a config file with every default filled in
    InitConfig {
        #[arg(short, long, default_value = "config.toml")]
        out: PathBuf,
    },
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(Some(&cli.config))
        .with_context(|| format!("Failed to load configuration from {:?}", cli.config))?;
    init_tracing(&config);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            config.validate().context("Invalid configuration")?;
            info!("Starting LinkGuard node v{}", env!("CARGO_PKG_VERSION"));

            let state = Arc::new(AppState::from_config(&config)?);
            ApiServer::new(config, state)
                .start(shutdown_signal())
                .await?;
        }
        Commands::Keygen { out, bits } => {
            info!("Generating {}-bit RSA key pair", bits);
            let keys = KeyExchange::generate(bits)?;
            let (private_path, public_path) = keys.save(&out)?;
            println!("Private key: {}", private_path.display());
            println!("Public key:  {}", public_path.display());
        }
        Commands::SignClaim { account_id } => {
            if config.secrets.server_secret.is_empty() {
                bail!("secrets.server_secret is not configured");
            }
            let verifier = OriginVerifier::new(&config.secrets.server_secret);
            println!("{}", verifier.sign(&account_id)?);
        }
        Commands::InitConfig { out } => {
            if out.exists() {
                bail!("Refusing to overwrite {:?}", out);
            }
            Config::default().to_file(&out)?;
            println!("Wrote default configuration to {}", out.display());
        }
    }

    Ok(())
}
