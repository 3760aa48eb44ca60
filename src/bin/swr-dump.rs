use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Context;
use clap::Parser;
use swr_cache::network::Offline;
use swr_cache::storage::FileStorage;
use swr_cache::storage::LocalStorage;
use swr_cache::storage::MemoryStorage;
use swr_cache::table::TableConfig;
use swr_cache::table::TableDescriptor;
use swr_cache::table::TableSet;
use swr_cache::types::StoreEvent;
use swr_cache::Store;
use tracing::info;

/// Fill a cache from a demo fixture and export it as a dump.
#[derive(Debug, Clone, Parser)]
#[clap(about, version, author, name = "swr-dump")]
struct Cli {
    /// JSON file with an array of table descriptions.
    #[clap(long, env = "SWR_TABLES")]
    tables: PathBuf,

    /// JSON object mapping table names to their records.
    #[clap(long, env = "SWR_FIXTURE")]
    fixture: PathBuf,

    /// Persist the cache in this file instead of memory.
    #[clap(long, env = "SWR_CACHE_FILE")]
    cache_file: Option<PathBuf>,

    #[clap(long, default_value_t = 1)]
    layout_version: u32,

    /// Where to write the dump. Standard output if omitted.
    #[clap(long, short)]
    output: Option<PathBuf>,

    /// Host name recorded for the session.
    #[clap(long, default_value = "demo")]
    host: String,
}

fn setup_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()?;

    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &PathBuf) -> anyhow::Result<T> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parsing {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_tracing()?;

    let configs: Vec<TableConfig> = read_json(&cli.tables).await?;
    let fixture: serde_json::Value = read_json(&cli.fixture).await?;
    let tables = TableSet::new(configs.into_iter().map(TableDescriptor::from).collect())?;

    let storage: Arc<dyn LocalStorage> = match cli.cache_file {
        Some(ref path) => Arc::new(FileStorage::load(path).await?),
        None => Arc::new(MemoryStorage::new()),
    };

    let store = Store::builder()
        .tables(tables)
        .fetcher(Arc::new(Offline))
        .storage(storage)
        .layout_version(cli.layout_version)
        .build()
        .map_err(|err| anyhow!("{err}"))?;

    let mut events = store.subscribe();
    let progress = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let StoreEvent::DumpProgress { table, done, total } = event {
                info!("[{done}/{total}] {table}");
            }
        }
    });

    store.enable_demo_mode(fixture);
    store.reconnect(&cli.host).await?;
    let dump = store.dump().await?;
    store.dispose();
    progress.abort();

    let json = serde_json::to_string_pretty(&dump)?;
    match cli.output {
        Some(ref path) => tokio::fs::write(path, json)
            .await
            .with_context(|| format!("writing {}", path.display()))?,
        None => println!("{json}"),
    }

    Ok(())
}
