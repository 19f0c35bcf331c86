use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use finca_core::{PriceNormalizer, PriceReading, ReadingSource};
use finca_queue::{DrainReport, OfflineQueue, QueueHandlerError, SubmitOutcome};
use finca_storage::{FileKeyValueStore, PgDocumentStore, PriceStore};
use finca_sync::{open_document_store, StoreBackend, SyncConfig};
use tracing::info;

mod logging;

use logging::LoggingConfig;

#[derive(Debug, Parser)]
#[command(name = "finca-cli")]
#[command(about = "Farm price sync and offline write queue")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the daily scheduled sync once: scrape, persist, alert.
    Scrape,
    /// Answer one on-demand price request and print the response body.
    Price {
        #[arg(long)]
        force: bool,
    },
    /// Run the cron scheduler until ctrl-c.
    Schedule,
    Serve {
        #[arg(long, env = "FINCA_WEB_PORT", default_value_t = 8000)]
        port: u16,
    },
    Latest,
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Recent scheduled-job failures.
    Errors {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Record a manual reading, writing directly or queueing it for later.
    Record {
        #[arg(long)]
        price: f64,
        /// Treat the backend as unreachable and queue the write.
        #[arg(long)]
        offline: bool,
    },
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Create the Postgres document table.
    Migrate,
}

#[derive(Debug, Subcommand)]
enum QueueCommands {
    Status,
    Drain,
}

#[tokio::main]
async fn main() -> Result<()> {
    LoggingConfig::from_env().init();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Scrape) {
        Commands::Scrape => {
            let service = finca_sync::build_service_from_config(&config).await?;
            let outcome = service.run_scheduled().await;
            println!("{outcome:?}");
        }
        Commands::Price { force } => {
            let service = finca_sync::build_service_from_config(&config).await?;
            let outcome = service.handle_request(force).await;
            if let Some(task) = outcome.persist_task {
                task.await.context("waiting for reading persistence")?;
            }
            println!("{}", serde_json::to_string_pretty(&outcome.response)?);
        }
        Commands::Schedule => finca_sync::run_scheduler_until_shutdown(&config).await?,
        Commands::Serve { port } => finca_web::serve(&config, port).await?,
        Commands::Latest => {
            let store = price_store(&config).await?;
            match store.latest().await? {
                Some(reading) => println!("{}", serde_json::to_string_pretty(&reading)?),
                None => println!("no readings yet"),
            }
        }
        Commands::History { limit } => {
            let store = price_store(&config).await?;
            for reading in store.recent(limit).await? {
                println!(
                    "{}  {} {} {}  ({})",
                    reading.captured_at.to_rfc3339(),
                    reading.price,
                    reading.currency,
                    reading.unit.describe(),
                    reading.source.as_str()
                );
            }
        }
        Commands::Errors { limit } => {
            let documents = open_document_store(&config).await?;
            let log = finca_storage::ErrorLog::new(documents);
            for entry in log.recent(limit).await? {
                println!(
                    "{}  {}{}  {}",
                    entry.captured_at.to_rfc3339(),
                    entry.category.as_str(),
                    entry.kind.map(|k| format!("/{k}")).unwrap_or_default(),
                    entry.message
                );
            }
        }
        Commands::Record { price, offline } => {
            let outcome = record(&config, price, offline).await?;
            let op = outcome.operation();
            if outcome.is_queued() {
                println!("queued {} ({})", op.op_id, op.op_type);
            } else {
                println!("recorded {}", op.op_id);
            }
        }
        Commands::Queue { command } => {
            let queue = open_queue(&config).await?;
            match command {
                QueueCommands::Status => {
                    let status = queue.status();
                    println!("pending: {}", status.pending);
                    for (op_type, count) in queue.pending_by_type().await? {
                        println!("  {op_type}: {count}");
                    }
                }
                QueueCommands::Drain => {
                    let report = drain(&config, &queue).await?;
                    println!(
                        "delivered {} remaining {}",
                        report.delivered, report.remaining
                    );
                    for failure in report.failures {
                        match failure.op_id {
                            Some(op_id) => println!("  blocked {} at {op_id}: {}", failure.op_type, failure.error),
                            None => println!("  blocked {}: {}", failure.op_type, failure.error),
                        }
                    }
                }
            }
        }
        Commands::Migrate => {
            if config.store != StoreBackend::Postgres {
                println!("store backend is {}; nothing to migrate", config.store.as_str());
                return Ok(());
            }
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for migrate")?;
            let pg = PgDocumentStore::connect(url).await?;
            pg.ensure_schema().await?;
            println!("schema ready");
        }
    }

    Ok(())
}

async fn price_store(config: &SyncConfig) -> Result<PriceStore> {
    Ok(PriceStore::new(open_document_store(config).await?))
}

async fn open_queue(config: &SyncConfig) -> Result<OfflineQueue> {
    let storage = FileKeyValueStore::new(config.data_dir.join("queue"));
    OfflineQueue::open(Arc::new(storage))
        .await
        .context("opening offline queue")
}

/// Replays `price-write` operations into the price store. The reading is
/// stamped when it is appended; the queue keeps the submit time.
async fn register_price_writes(config: &SyncConfig, queue: &OfflineQueue) -> Result<()> {
    let store = price_store(config).await?;
    queue.register_typed::<PriceReading, _, _>(move |op_id, mut reading| {
        let store = store.clone();
        async move {
            reading.captured_at = Utc::now();
            let id = store.append(&reading).await.map_err(QueueHandlerError::new)?;
            info!(%op_id, document_id = %id, "manual reading written");
            Ok(())
        }
    });
    Ok(())
}

async fn record(config: &SyncConfig, price: f64, offline: bool) -> Result<SubmitOutcome> {
    let reading = PriceNormalizer::new(config.unit, &config.currency).normalize(
        price,
        ReadingSource::Manual,
        Utc::now(),
    )?;
    let queue = open_queue(config).await?;
    register_price_writes(config, &queue).await?;
    if offline {
        queue.set_offline();
    }
    Ok(queue.submit_typed(&reading).await?)
}

async fn drain(config: &SyncConfig, queue: &OfflineQueue) -> Result<DrainReport> {
    register_price_writes(config, queue).await?;
    Ok(queue.set_online().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn file_config(dir: &tempfile::TempDir) -> SyncConfig {
        SyncConfig {
            store: StoreBackend::File,
            data_dir: dir.path().to_path_buf(),
            ..SyncConfig::default()
        }
    }

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
        let cli = Cli::try_parse_from(["finca-cli", "record", "--price", "520", "--offline"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Record { offline: true, .. })));
    }

    #[tokio::test]
    async fn offline_record_is_queued_then_drained_into_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = file_config(&dir);

        let outcome = record(&config, 520.0, true).await.unwrap();
        assert!(outcome.is_queued());
        assert!(price_store(&config).await.unwrap().latest().await.unwrap().is_none());

        let queue = open_queue(&config).await.unwrap();
        assert_eq!(queue.status().pending, 1);
        let report = drain(&config, &queue).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.remaining, 0);

        let latest = price_store(&config).await.unwrap().latest().await.unwrap().unwrap();
        assert_eq!(latest.price.to_string(), "520");
        assert_eq!(latest.source, ReadingSource::Manual);
    }

    #[tokio::test]
    async fn drained_reading_is_stamped_at_append_time() {
        let dir = tempfile::tempdir().unwrap();
        let config = file_config(&dir);

        let outcome = record(&config, 510.0, true).await.unwrap();
        let enqueued_at = outcome.operation().enqueued_at;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let before_drain = Utc::now();

        let queue = open_queue(&config).await.unwrap();
        drain(&config, &queue).await.unwrap();

        let latest = price_store(&config).await.unwrap().latest().await.unwrap().unwrap();
        assert!(latest.captured_at >= before_drain);
        assert!(latest.captured_at > enqueued_at);
    }

    #[tokio::test]
    async fn online_record_writes_directly() {
        let dir = tempfile::tempdir().unwrap();
        let config = file_config(&dir);
        let outcome = record(&config, 480.5, false).await.unwrap();
        assert!(!outcome.is_queued());
        assert_eq!(open_queue(&config).await.unwrap().status().pending, 0);
        assert!(price_store(&config).await.unwrap().latest().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn negative_manual_price_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(record(&file_config(&dir), -1.0, false).await.is_err());
    }
}
