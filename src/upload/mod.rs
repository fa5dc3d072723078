//! Upload module
//!
//! Streams an object of unknown length to the backend. Small objects go out
//! in a single PutObject; once the buffered data crosses the partition size
//! the stream switches to a multipart upload whose parts are sent by a
//! bounded worker pool.
//!
//! # Components
//!
//! - [`scratch::ScratchBuffer`] - file-backed buffer for one partition
//! - [`pool::PartUploadPool`] - bounded executor for part uploads
//! - [`multipart::MultipartUploader`] - multipart session and part bookkeeping
//! - [`stream::UploadStream`] - the sequential write surface
//! - [`blocking::BlockingUploadStream`] - `std::io::Write` over a runtime handle

use crate::config::ConfigError;
use crate::s3::BackendError;
use thiserror::Error;

pub mod blocking;
pub mod multipart;
pub mod pool;
pub mod scratch;
pub mod stream;

pub use blocking::BlockingUploadStream;
pub use multipart::{MultipartUploader, MAX_PARTS};
pub use pool::{PartUploadPool, PendingUpload, TaskOutcome};
pub use scratch::{ScratchBuffer, Segment};
pub use stream::{StreamState, Strategy, UploadStream};

/// Why a part upload did not produce an ETag
#[derive(Error, Debug)]
pub enum PartFailure {
    #[error("{0}")]
    Backend(BackendError),

    #[error("upload task crashed: {0}")]
    Crashed(String),

    #[error("upload task cancelled by pool shutdown")]
    Cancelled,
}

/// Upload errors
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Local buffer error: {0}")]
    LocalBuffer(#[from] std::io::Error),

    #[error("Failed to initiate multipart upload for {bucket}/{key}: {source}")]
    Initiation {
        bucket: String,
        key: String,
        #[source]
        source: BackendError,
    },

    #[error("Upload of part {part_number} failed: {cause}")]
    PartUpload {
        part_number: u32,
        #[source]
        cause: PartFailure,
    },

    #[error("Failed to complete multipart upload {upload_id}: {source}")]
    Completion {
        upload_id: String,
        #[source]
        source: BackendError,
    },

    #[error("Failed to put object: {0}")]
    PutObject(#[source] BackendError),

    #[error("Failed to abort multipart upload {upload_id}: {source}")]
    Abort {
        upload_id: String,
        #[source]
        source: BackendError,
    },

    #[error("Multipart upload exceeds {0} parts")]
    PartLimitExceeded(u32),

    #[error("No multipart upload session")]
    NoSession,

    #[error("Multipart upload has no parts to complete")]
    NoParts,

    #[error("Stream failed earlier and accepts no more operations")]
    StreamFailed,

    #[error("Stream is closed")]
    StreamClosed,

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}
