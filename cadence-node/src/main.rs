//! Cadence validator node

use anyhow::Context;
use cadence_node::node::load_identity;
use cadence_node::{Node, NodeConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cadence-node")]
#[command(about = "Cadence validator node")]
struct Cli {
    /// Config file (default: <config dir>/cadence/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node
    Run,

    /// Apply database migrations and exit
    Migrate {
        /// Drop every table first; refused once blocks have been committed
        #[arg(long)]
        down_first: bool,
    },

    /// Print the addresses derived from the delegate key
    Identity,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = NodeConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Run => {
            let node = Node::build(config).await.context("starting node")?;
            node.run().await?;
        }

        Commands::Migrate { down_first } => {
            let url = config
                .database
                .url
                .as_ref()
                .context("database.url or CADENCE_DATABASE_URL must be set to migrate")?;
            let store = cadence_consensus::PgStore::connect(
                secrecy::ExposeSecret::expose_secret(url),
                config.database.max_connections,
            )
            .await?;
            store.migrate(down_first).await?;
            tracing::info!(down_first, "Migrations applied");
        }

        Commands::Identity => {
            let identity = load_identity(&config)?;
            println!("eth address:       {}", identity.eth_address());
            println!("consensus address: {}", identity.comet_address());
            println!("consensus pub key: {}", hex::encode(identity.consensus_public_key()));
        }
    }

    Ok(())
}
