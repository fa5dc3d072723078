//! S3 Upload Stream Library
//!
//! Streams objects of unknown length to S3-compatible storage without
//! holding them in memory.
//!
//! # Features
//!
//! - **Adaptive**: small objects use one PutObject, large ones switch to multipart
//! - **Bounded**: only one partition is buffered, in a scratch file
//! - **Concurrent**: parts upload through a shared, bounded worker pool
//! - **Clean failures**: any error aborts the multipart session
//!
//! # Example
//!
//! ```no_run
//! use s3_upload_stream::{Config, PartUploadPool, S3Backend, UploadStream};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let backend = Arc::new(S3Backend::from_config(&config.backend)?);
//!     let pool = Arc::new(PartUploadPool::new(config.upload.concurrency));
//!
//!     let mut stream = UploadStream::new(
//!         &config.backend.bucket,
//!         "logs/today.log",
//!         backend,
//!         pool,
//!         &config.upload,
//!     )?;
//!     stream.write(b"line 1\n").await?;
//!     stream.close().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod metrics;
pub mod s3;
pub mod upload;

// Re-export commonly used types
pub use config::Config;
pub use s3::{InMemoryBackend, ObjectBackend, S3Backend};
pub use upload::{PartUploadPool, UploadError, UploadStream};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
