/// chatsync-inspect - dump a thread's cached messages
use chatsync_core::sequence::MessageIndex;
use chatsync_core::{Config, LocalStore, SledStore};
use std::env;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_LIMIT: usize = 50;

struct InspectArgs {
    thread_id: String,
    data_dir: Option<PathBuf>,
    limit: usize,
}

impl InspectArgs {
    fn from_args(args: &[String]) -> anyhow::Result<Self> {
        if args.len() < 2 {
            anyhow::bail!(
                "Usage: {} <thread_id> [--data-dir <path>] [--limit <n>]",
                args.first().map(String::as_str).unwrap_or("chatsync-inspect")
            );
        }

        let mut data_dir = None;
        let mut limit = DEFAULT_LIMIT;
        let mut i = 2;
        while i < args.len() {
            match args[i].as_str() {
                "--data-dir" => {
                    let path = args
                        .get(i + 1)
                        .ok_or_else(|| anyhow::anyhow!("--data-dir requires a path argument"))?;
                    data_dir = Some(PathBuf::from(path));
                    i += 2;
                }
                "--limit" => {
                    let n = args
                        .get(i + 1)
                        .ok_or_else(|| anyhow::anyhow!("--limit requires a number"))?;
                    limit = n
                        .parse()
                        .map_err(|_| anyhow::anyhow!("--limit must be a positive number"))?;
                    i += 2;
                }
                other => anyhow::bail!("Unknown argument: {}", other),
            }
        }

        Ok(Self {
            thread_id: args[1].clone(),
            data_dir,
            limit,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays valid JSON
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    let opts = InspectArgs::from_args(&args)?;

    let mut config = Config::from_env()?;
    if let Some(dir) = opts.data_dir {
        config.data_dir = dir;
    }

    let store = SledStore::from_config(&config);
    store.ensure_schema().await?;
    let cached = store.load_messages(&opts.thread_id).await;
    store.close().await?;

    let mut index = MessageIndex::new();
    for message in cached? {
        index.replace(message);
    }
    let sequence = index.snapshot();
    info!(
        "Thread {}: {} cached messages in {:?}",
        opts.thread_id,
        sequence.len(),
        store.path()
    );

    let shown: Vec<_> = sequence.iter().take(opts.limit).collect();
    println!("{}", serde_json::to_string_pretty(&shown)?);
    Ok(())
}
