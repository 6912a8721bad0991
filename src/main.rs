use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use video_cache::{Error, Quality, Result, VideoCache, VideoCacheConfig};

#[derive(Parser, Debug)]
#[command(name = "video_cache", about = "Persistent video cache and chunked streaming", version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the cache directory
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the URI a player should open for each source
    Resolve {
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Download sources into the cache
    Preload {
        #[arg(required = true)]
        urls: Vec<String>,

        /// Parallel downloads for this batch
        #[arg(short = 'j', long, default_value = "2")]
        concurrency: usize,
    },
    /// Walk a source chunk by chunk the way a player would
    Stream {
        video_id: String,
        url: String,

        #[arg(short, long)]
        quality: Option<Quality>,

        /// Stop after this many chunks
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print cache metrics as JSON
    Stats,
    /// Delete every cached file
    Clear,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Application error: {}", e);
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = match &args.config {
        Some(path) => VideoCacheConfig::from_file(path)?,
        None => VideoCacheConfig::default(),
    };
    if let Some(dir) = args.cache_dir {
        config.cache.cache_dir = dir;
    }

    let cache = VideoCache::init(config).await?;
    let outcome = execute(&cache, args.command).await;
    cache.shutdown().await;
    outcome
}

async fn execute(cache: &VideoCache, command: Command) -> Result<()> {
    match command {
        Command::Resolve { urls } => {
            for url in &urls {
                let source = cache.resolver().resolve(url).await;
                let tag = if source.cached { "cache" } else { "network" };
                println!("{tag}\t{}", source.uri);
            }
            // Let the background downloads finish before exiting.
            cache.store().flush().await;
        }
        Command::Preload { urls, concurrency } => {
            let requested = urls.len();
            cache.store().preload(urls, concurrency);
            cache.store().flush().await;
            info!(
                requested,
                cached = cache.store().len(),
                "Preload finished"
            );
        }
        Command::Stream {
            video_id,
            url,
            quality,
            limit,
        } => {
            let quality = quality.unwrap_or(cache.config().chunk.default_quality);
            let engine = cache.engine();
            let session = engine.initialize_stream(&video_id, &url, quality).await?;
            let total = limit.map_or(session.total_chunks, |l| l.min(session.total_chunks));

            for index in 0..total {
                engine.update_current_chunk(&video_id, index);
                match engine.get_chunk(&video_id, index).await {
                    Ok(Some(chunk)) => println!(
                        "chunk {index}\t{:.2}s-{:.2}s\t{} bytes",
                        chunk.start_offset,
                        chunk.end_offset,
                        chunk.payload_len()
                    ),
                    Ok(None) => break,
                    Err(e) => warn!(video_id, index, error = %e, "Chunk failed"),
                }
            }

            if let Some(info) = engine.cleanup_stream(&video_id) {
                info!(
                    video_id,
                    chunks = info.total_chunks,
                    quality = %info.quality,
                    "Stream finished"
                );
            }
        }
        Command::Stats => {
            let metrics = cache.performance_metrics();
            let json = serde_json::to_string_pretty(&metrics)
                .map_err(|e| Error::Config(format!("failed to encode metrics: {e}")))?;
            println!("{json}");
        }
        Command::Clear => {
            let removed = cache.store().len();
            cache.store().clear().await;
            println!("removed {removed} entries");
        }
    }
    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "video_cache=debug"
    } else {
        "video_cache=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}
