//! Operator CLI for a design hub.
//!
//! # Responsibility
//! - Open the hub described by a TOML config and run one administrative
//!   command against it.
//! - Keep output line-oriented so it can be grepped in scripts.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use designhub_core::{core_version, init_logging, DesignHub, DeveloperId, HubConfig};
use log::info;
use std::path::PathBuf;

/// Design hub administration
#[derive(Parser, Debug)]
#[command(name = "designhub")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Hub config file; defaults are used when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register every configured store as a data store, optionally creating an application
    Init {
        /// Application to create
        #[arg(long)]
        app: Option<String>,
        /// Owner recorded on the new application
        #[arg(long, default_value = "admin")]
        owner: String,
    },
    /// Print applications, artifact counts and live checkouts
    Status,
    /// Drop every checkout and staged edit of a developer
    Release {
        #[arg(long)]
        developer: DeveloperId,
    },
    /// Print the core version
    Version,
}

fn load_config(path: Option<&PathBuf>) -> Result<HubConfig> {
    match path {
        Some(path) => HubConfig::load(path).with_context(|| format!("loading {}", path.display())),
        None => Ok(HubConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Command::Version = cli.command {
        println!("designhub_core version={}", core_version());
        return Ok(());
    }

    let config = load_config(cli.config.as_ref())?;
    if let Some(dir) = &config.logging.dir {
        init_logging(config.logging.level, dir, true).context("starting logging")?;
    }
    let hub = DesignHub::from_config(&config).context("opening hub")?;

    match cli.command {
        Command::Init { app, owner } => {
            for store in &config.stores {
                let id = hub.register_data_store(&store.name, "sqlite").await?;
                println!("data_store name={} id={}", store.name, id);
            }
            if let Some(name) = app {
                let app = hub.create_application(&name, &owner).await?;
                println!("application name={} id={}", app.name, app.id);
            }
            info!("event=cli_init module=cli status=ok stores={}", config.stores.len());
        }
        Command::Status => {
            let status = hub.status().await?;
            for app in &status.applications {
                println!("application id={} name={} owner={}", app.id, app.name, app.owner);
            }
            for (kind, count) in &status.artifact_counts {
                println!("artifacts kind={kind} count={count}");
            }
            for checkout in &status.checkouts {
                println!(
                    "checkout key={} developer={} name={} version={}",
                    checkout.key, checkout.developer, checkout.developer_name, checkout.version
                );
            }
            println!("stores {}", status.stores.join(","));
        }
        Command::Release { developer } => {
            let (released, dropped) = hub.release_developer(developer).await?;
            println!("released checkouts={released} staged={dropped}");
        }
        Command::Version => {}
    }
    Ok(())
}
