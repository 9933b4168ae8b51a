use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::application::{AggregationLoader, LedgerService, SnapshotCache};
use crate::config::LedgerConfig;
use crate::domain::{Coins, MerchId, UserId};
use crate::storage::{ScanIsolation, SqliteStore};

/// Coinledger - coin balances, transfers and merch purchases
#[derive(Parser)]
#[command(name = "coinledger")]
#[command(about = "A transactional coin ledger with a snapshot read cache")]
#[command(version)]
pub struct Cli {
    /// Database file path (overrides the config file)
    #[arg(short, long, global = true)]
    pub database: Option<String>,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Read the three snapshot scans inside one transaction
    #[arg(long, global = true)]
    pub consistent_scans: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new database
    Init,

    /// User management commands
    #[command(subcommand)]
    User(UserCommands),

    /// Transfer coins between users
    Transfer {
        /// Number of coins to move
        amount: Coins,

        /// Sender user id
        #[arg(long)]
        from: UserId,

        /// Receiver user id
        #[arg(long)]
        to: UserId,
    },

    /// Buy merch with a user's coins
    Purchase {
        /// Buyer user id
        #[arg(long)]
        user: UserId,

        /// Merch id (see `merch`)
        #[arg(long)]
        merch: MerchId,

        /// Number of items
        #[arg(long, default_value = "1")]
        count: i64,
    },

    /// List the merch catalogue
    Merch,

    /// Build one snapshot and show a user's cached history
    Snapshot {
        /// User id
        user_id: UserId,
    },

    /// Export a fresh snapshot to CSV or JSON
    Export {
        /// What to export: balances, operations, purchases, full
        #[arg(value_name = "TYPE")]
        export_type: String,

        /// Output file (omit for stdout)
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Keep the snapshot cache refreshed until interrupted
    Serve {
        /// Seconds between refreshes (overrides the config file)
        #[arg(long)]
        interval: Option<u64>,
    },
}

#[derive(Subcommand)]
pub enum UserCommands {
    /// Create a new user
    Create {
        /// User name
        name: String,

        /// Opaque password, stored as given
        #[arg(long)]
        password: String,

        /// Initial balance in coins
        #[arg(long, default_value = "1000")]
        balance: Coins,
    },

    /// Show a user's current balance, read from the store
    Show {
        /// User id
        id: UserId,
    },
}

impl Cli {
    /// Resolve configuration: file (or defaults), then command-line overrides.
    pub fn config(&self) -> Result<LedgerConfig> {
        let mut config = match &self.config {
            Some(path) => LedgerConfig::from_toml_file(path)?,
            None => LedgerConfig::default(),
        };
        if let Some(database) = &self.database {
            config.database_url = LedgerConfig::for_database_path(database).database_url;
        }
        if self.consistent_scans {
            config.scan_isolation = ScanIsolation::Snapshot;
        }
        config.validate()?;
        Ok(config)
    }

    pub async fn run(self) -> Result<()> {
        let config = self.config()?;
        let cancel = cancel_on_ctrl_c();

        match self.command {
            Commands::Init => {
                LedgerService::<SqliteStore>::init(&config).await?;
                println!("Database initialized: {}", config.database_url);
            }

            Commands::User(user_cmd) => {
                let service = LedgerService::<SqliteStore>::connect(&config).await?;
                run_user_command(&service, &cancel, user_cmd).await?;
            }

            Commands::Transfer { amount, from, to } => {
                let service = LedgerService::<SqliteStore>::connect(&config).await?;
                let operation = service.transfer(&cancel, from, to, amount).await?;
                println!(
                    "Transferred {} coins: {} -> {} (operation {})",
                    operation.amount, operation.from_user, operation.to_user, operation.operation_id
                );
            }

            Commands::Purchase { user, merch, count } => {
                let service = LedgerService::<SqliteStore>::connect(&config).await?;
                let item = service.get_merch(&cancel, merch).await?;
                let purchase = service.purchase_merch(&cancel, user, merch, count).await?;
                println!(
                    "User {} bought {} x {} for {} coins (purchase {})",
                    purchase.user_id,
                    purchase.amount,
                    item.merch_type,
                    item.price * purchase.amount,
                    purchase.purchase_id
                );
            }

            Commands::Merch => {
                let service = LedgerService::<SqliteStore>::connect(&config).await?;
                let items = service.list_merch(&cancel).await?;
                println!("{:<6} {:<14} {:>8}", "ID", "TYPE", "PRICE");
                println!("{}", "-".repeat(30));
                for item in items {
                    println!("{:<6} {:<14} {:>8}", item.merch_id, item.merch_type, item.price);
                }
            }

            Commands::Snapshot { user_id } => {
                let cache = build_snapshot(&config).await?;
                match cache.get(user_id) {
                    Some(info) => println!("{}", serde_json::to_string_pretty(&info)?),
                    None => anyhow::bail!("User {} not found in snapshot", user_id),
                }
            }

            Commands::Export {
                export_type,
                output,
            } => {
                let cache = build_snapshot(&config).await?;
                run_export_command(&cache, &export_type, output.as_deref())?;
            }

            Commands::Serve { interval } => {
                let store = Arc::new(
                    SqliteStore::connect(&config.database_url, config.max_connections).await?,
                );
                let loader = AggregationLoader::from_config(Arc::clone(&store), &config);
                let interval = interval
                    .map(std::time::Duration::from_secs)
                    .unwrap_or_else(|| config.refresh_interval());

                let cache = Arc::new(SnapshotCache::new());
                let refresher = cache.spawn_refresher(loader, interval, cancel.clone());

                cancel.cancelled().await;
                refresher.await.context("Snapshot refresher panicked")?;
                store.close().await;
                println!("Stopped after {} refreshes", cache.snapshot().generation());
            }
        }

        Ok(())
    }
}

/// A token that fires when the process receives Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            on_signal.cancel();
        }
    });
    cancel
}

/// Run a single refresh cycle against the configured database.
async fn build_snapshot(config: &LedgerConfig) -> Result<SnapshotCache> {
    let store = Arc::new(SqliteStore::connect(&config.database_url, config.max_connections).await?);
    let loader = AggregationLoader::from_config(store, config);
    let cache = SnapshotCache::new();
    cache.refresh(&loader).await?;
    Ok(cache)
}

async fn run_user_command(
    service: &LedgerService<SqliteStore>,
    cancel: &CancellationToken,
    cmd: UserCommands,
) -> Result<()> {
    match cmd {
        UserCommands::Create {
            name,
            password,
            balance,
        } => {
            let user = service.create_user(cancel, name, password, balance).await?;
            println!("Created user: {} (id {})", user.name, user.user_id);
        }

        UserCommands::Show { id } => {
            let user = service.get_user(cancel, id).await?;
            println!("User: {}", user.name);
            println!("  ID:       {}", user.user_id);
            println!("  Balance:  {}", user.balance);
        }
    }
    Ok(())
}

fn run_export_command(cache: &SnapshotCache, export_type: &str, output: Option<&str>) -> Result<()> {
    use crate::io::Exporter;
    use std::fs::File;
    use std::io::{Write, stdout};

    let snapshot = cache.snapshot();
    let exporter = Exporter::new(&snapshot);

    // Determine output writer
    let writer: Box<dyn Write> = match output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create output file: {}", path))?;
            Box::new(file)
        }
        None => Box::new(stdout()),
    };

    let (count, what) = match export_type {
        "balances" => (exporter.export_balances_csv(writer)?, "balances"),
        "operations" => (exporter.export_operations_csv(writer)?, "operations"),
        "purchases" => (exporter.export_purchases_csv(writer)?, "purchases"),
        "full" => (exporter.export_full_json(writer)?, "users"),
        _ => {
            anyhow::bail!(
                "Invalid export type '{}'. Valid types: balances, operations, purchases, full",
                export_type
            );
        }
    };

    if output.is_some() {
        eprintln!("Exported {} {}", count, what);
    }
    Ok(())
}
