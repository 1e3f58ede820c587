use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::json;

use vocab_client::db::{KeyValueStore, SqliteKvStore};
use vocab_client::sync::{HttpRemoteStore, RemoteStore};
use vocab_client::{telemetry, ClientConfig, PersistentStore, ProgressService, SyncQueue};
use vocab_core::clock::{Clock, SystemClock};

#[derive(Parser, Debug)]
#[command(name = "vocab-sync")]
#[command(about = "Maintain local vocabulary progress and its cloud sync queue", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the stored snapshot summary and sync queue state
    Status,

    /// Record one review
    Review {
        item_id: String,
        /// Recall quality, 0-5
        quality: u8,
    },

    /// Write the current snapshot to a file
    Export { path: PathBuf },

    /// Restore a snapshot from an exported (or damaged) file
    Import { path: PathBuf },

    /// Repair the stored snapshot in place
    Recover,

    /// Drain the sync queue against the remote store
    Flush,
}

struct Runtime {
    config: ClientConfig,
    clock: Arc<dyn Clock>,
    store: PersistentStore,
    queue: SyncQueue,
    has_remote: bool,
}

impl Runtime {
    async fn open(config: ClientConfig) -> anyhow::Result<Self> {
        let kv: Arc<dyn KeyValueStore> = Arc::new(
            SqliteKvStore::open(config.db_path())
                .with_context(|| format!("opening {}", config.db_path().display()))?,
        );
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::default());
        let store = PersistentStore::new(kv, clock.clone(), config.store.clone());

        let remote: Option<Arc<dyn RemoteStore>> = config.remote_url.as_deref().map(|url| {
            Arc::new(HttpRemoteStore::new(url, config.remote_token.clone())) as Arc<dyn RemoteStore>
        });
        let has_remote = remote.is_some();
        let queue = SyncQueue::new(
            config.sync.clone(),
            clock.clone(),
            Some(store.clone()),
            remote,
            false,
        );
        queue.restore().await;

        Ok(Self {
            config,
            clock,
            store,
            queue,
            has_remote,
        })
    }

    fn progress(&self) -> ProgressService {
        let queue = self.has_remote.then(|| self.queue.clone());
        ProgressService::open(
            self.store.clone(),
            queue,
            self.clock.clone(),
            self.config.progress.clone(),
        )
    }
}

/// Wait out a background pass, then run one of our own before exiting.
async fn drain(queue: &SyncQueue) {
    while queue.is_online() && queue.process_queue().await.skipped {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ClientConfig::from_env()?;
    telemetry::init();

    let rt = Runtime::open(config).await?;
    let key = rt.config.progress.store_key.clone();

    match cli.command {
        Command::Status => {
            let progress = rt.progress();
            let snapshot = progress.snapshot();
            let status = rt.queue.status().await;
            let summary = json!({
                "items": snapshot.progress.len(),
                "due": progress.due_items().len(),
                "xp": snapshot.stats.xp,
                "level": snapshot.stats.level,
                "streak": snapshot.stats.streak,
                "schemaVersion": snapshot.schema_version,
                "backups": rt.store.list_backups(&key)?.len(),
                "queue": status,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Review { item_id, quality } => {
            rt.queue.set_online(rt.has_remote).await;
            let mut progress = rt.progress();
            let outcome = progress.submit_review(&item_id, quality).await?;
            println!(
                "{}: next review in {} day(s), ease {:.2}, +{} xp",
                item_id, outcome.card.interval, outcome.card.ease_factor, outcome.xp_gained
            );
            progress.flush();
            drain(&rt.queue).await;
        }
        Command::Export { path } => {
            let progress = rt.progress();
            rt.store.export_to_file(&path, progress.snapshot())?;
            println!("exported to {}", path.display());
        }
        Command::Import { path } => {
            let result = rt.store.import_file(&path)?;
            for warning in &result.warnings {
                eprintln!("warning: {warning}");
            }
            let Some(data) = result.recovered_data else {
                bail!("import failed: {}", result.errors.join("; "));
            };
            rt.store.save(&key, &data.state);
            if !rt.store.flush() {
                bail!("imported snapshot could not be written");
            }
            println!("{}", serde_json::to_string_pretty(&result.lost_data)?);
        }
        Command::Recover => {
            let result = rt.store.recover_key(&key)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                bail!("recovery failed");
            }
        }
        Command::Flush => {
            if !rt.has_remote {
                bail!("VOCAB_REMOTE_URL is not set");
            }
            rt.queue.set_online(true).await;
            let status = rt.queue.status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    rt.store.flush();
    Ok(())
}
