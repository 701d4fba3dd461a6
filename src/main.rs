use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use pxedhcp::models::Id;
use pxedhcp::{Address, Config, DhcpServer, MemoryStore, Pool, Repository, Result};

#[derive(Parser)]
#[command(name = "pxedhcp")]
#[command(author, version, about = "DHCP engine for PXE provisioning", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    Run,
    ShowConfig,
    ListPools,
    ListLeases,
    /// Print the next free address of a pool
    NextFree {
        pool_id: Id,
    },
    CleanupLeases,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting DHCP server with config: {:?}", cli.config);
            let store = Arc::new(MemoryStore::open(&config.database_file).await?);
            let server = DhcpServer::new(config, Arc::clone(&store));

            let result = tokio::select! {
                result = server.run() => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal, stopping server...");
                    Ok(())
                }
            };

            if let Err(error) = store.flush().await {
                tracing::error!("Failed to save database on shutdown: {}", error);
            }
            result
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::ListPools => {
            let store = MemoryStore::open(&config.database_file).await?;
            let pools = store.find::<Pool, _>(|_| true).await?;

            if pools.is_empty() {
                println!("No pools configured.");
            } else {
                println!(
                    "{:<4} {:<16} {:<18} {:<34} {:<16} {:<8}",
                    "ID", "Name", "Network", "Range", "Gateway", "Lease"
                );
                println!("{}", "-".repeat(100));

                for pool in pools {
                    println!(
                        "{:<4} {:<16} {:<18} {:<34} {:<16} {:<8}",
                        pool.id,
                        pool.name,
                        format!("{}/{}", pool.network(), pool.netmask),
                        format!("{} - {}", pool.start_address, pool.end_address),
                        pool.gateway,
                        format!("{}s", pool.lease_duration())
                    );
                }
            }

            Ok(())
        }
        Commands::ListLeases => {
            let store = MemoryStore::open(&config.database_file).await?;
            let addresses = store.find::<Address, _>(|_| true).await?;

            if addresses.is_empty() {
                println!("No addresses recorded.");
            } else {
                println!(
                    "{:<16} {:<18} {:<24} {:<9} {:<10}",
                    "IP Address", "MAC", "Hostname", "Reserved", "Remaining"
                );
                println!("{}", "-".repeat(81));

                for address in addresses {
                    let remaining = address.remaining_seconds();
                    let remaining_str = if remaining > 0 {
                        format!("{}s", remaining)
                    } else {
                        "expired".to_string()
                    };

                    println!(
                        "{:<16} {:<18} {:<24} {:<9} {:<10}",
                        address.ip,
                        if address.mac.is_empty() { "-" } else { address.mac.as_str() },
                        address.hostname,
                        if address.reserved { "yes" } else { "no" },
                        remaining_str
                    );
                }
            }

            Ok(())
        }
        Commands::NextFree { pool_id } => {
            let store = MemoryStore::open(&config.database_file).await?;
            let pool: Pool = store.get(pool_id).await?;
            let snapshot = store.snapshot(pool).await?;
            println!("{}", snapshot.next()?);
            Ok(())
        }
        Commands::CleanupLeases => {
            let store = MemoryStore::open(&config.database_file).await?;
            let count = store.cleanup_stale_addresses().await?;
            println!("Cleaned up {} stale address record(s).", count);
            Ok(())
        }
    }
}
