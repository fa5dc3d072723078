//! S3 Upload Stream - stream stdin or a file to an S3 object

use anyhow::Context;
use clap::Parser;
use s3_upload_stream::{
    config::Config, InMemoryBackend, ObjectBackend, PartUploadPool, S3Backend, UploadStream,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

const READ_CHUNK: usize = 64 * 1024;

/// Stream data to an S3 object without holding the whole object in memory
#[derive(Parser, Debug)]
#[command(name = "s3-upload-stream")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Object key to write
    #[arg(short, long)]
    key: String,

    /// Input file, or "-" for stdin
    #[arg(short, long, default_value = "-")]
    input: String,

    /// Upload to an in-memory backend instead of S3
    #[arg(long)]
    dry_run: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting S3 Upload Stream v{}", s3_upload_stream::VERSION);

    // Load configuration
    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    info!("Loaded configuration from {:?}", args.config);

    let backend: Arc<dyn ObjectBackend> = if args.dry_run {
        info!("Dry run, uploading to in-memory backend");
        Arc::new(InMemoryBackend::new())
    } else {
        Arc::new(S3Backend::from_config(&config.backend)?)
    };
    let pool = Arc::new(PartUploadPool::new(config.upload.concurrency));

    let mut stream = UploadStream::new(
        &config.backend.bucket,
        &args.key,
        backend,
        pool,
        &config.upload,
    )?;

    let mut input: Box<dyn AsyncRead + Unpin> = if args.input == "-" {
        Box::new(tokio::io::stdin())
    } else {
        let file = tokio::fs::File::open(&args.input)
            .await
            .with_context(|| format!("failed to open {}", args.input))?;
        Box::new(file)
    };

    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = match input.read(&mut chunk).await {
            Ok(n) => n,
            Err(e) => {
                if let Err(abort_err) = stream.abort().await {
                    error!(error = %abort_err, "Failed to abandon upload");
                }
                return Err(anyhow::Error::new(e).context("failed to read input"));
            }
        };
        if n == 0 {
            break;
        }
        stream.write(&chunk[..n]).await?;
    }
    stream.close().await?;

    info!(
        bucket = %config.backend.bucket,
        key = %args.key,
        bytes = stream.bytes_written(),
        strategy = ?stream.strategy(),
        "Upload complete"
    );
    println!("{}", stream.content_hash().unwrap_or_default());

    Ok(())
}
