//! Object storage backend module
//!
//! Defines the capability the upload engine consumes from an S3-compatible
//! store, plus the implementations shipped with the crate.
//!
//! # Implementations
//!
//! - [`S3Backend`] - AWS SDK client for S3 and S3-compatible endpoints
//! - [`InMemoryBackend`] - in-process store that records every call
//!
//! # Example
//!
//! ```no_run
//! use s3_upload_stream::s3::{ObjectBackend, S3Backend};
//! use s3_upload_stream::config::S3Config;
//! use bytes::Bytes;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = S3Config {
//!     bucket: "my-bucket".to_string(),
//!     region: "us-east-1".to_string(),
//!     endpoint: None,
//!     access_key: Some("access-key".to_string()),
//!     secret_key: Some("secret-key".to_string()),
//! };
//! let backend = S3Backend::from_config(&config)?;
//!
//! let etag = backend
//!     .put_object("my-bucket", "hello.txt", Bytes::from("Hello, World!"))
//!     .await?;
//! println!("ETag: {}", etag);
//! # Ok(())
//! # }
//! ```
//!
//! # Tracing
//!
//! | Operation | Span Name |
//! |-----------|-----------|
//! | PutObject | `s3.put_object` |
//! | CreateMultipartUpload | `s3.create_multipart_upload` |
//! | UploadPart | `s3.upload_part` |
//! | CompleteMultipartUpload | `s3.complete_multipart_upload` |
//! | AbortMultipartUpload | `s3.abort_multipart_upload` |

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub mod client;
pub mod credentials;
pub mod memory;

pub use client::S3Backend;
pub use credentials::{Credentials, CredentialsError, CredentialsProvider};
pub use memory::{BackendCall, FailurePoint, InMemoryBackend};

/// Backend errors
///
/// Every backend call is a single attempt; a returned error is terminal for
/// that call.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Request error: {0}")]
    RequestError(String),

    #[error("Response error: {0}")]
    ResponseError(String),

    #[error("Response missing {0}")]
    MissingField(&'static str),
}

/// Completed part info
///
/// The backend-assigned tag of one uploaded part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Object storage capability consumed by the upload engine
///
/// `upload_part` must be safe to call concurrently for different part
/// numbers of the same upload id.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Start a multipart upload, returning the backend's upload id
    async fn initiate_multipart_upload(&self, bucket: &str, key: &str)
        -> Result<String, BackendError>;

    /// Upload one part, returning its ETag
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        payload: Bytes,
    ) -> Result<String, BackendError>;

    /// Complete a multipart upload from parts ordered by part number,
    /// returning the object's ETag
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<String, BackendError>;

    /// Abort a multipart upload. Repeated aborts are harmless.
    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), BackendError>;

    /// Write a whole object in one call, returning its ETag
    async fn put_object(&self, bucket: &str, key: &str, payload: Bytes)
        -> Result<String, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_display() {
        let err = BackendError::MissingField("UploadId");
        assert_eq!(err.to_string(), "Response missing UploadId");

        let err = BackendError::RequestError("connection reset".into());
        assert_eq!(err.to_string(), "Request error: connection reset");
    }

    #[tokio::test]
    async fn test_mock_backend_put_object() {
        let mut mock = MockObjectBackend::new();
        mock.expect_put_object()
            .times(1)
            .returning(|_, _, payload| Ok(format!("\"{}\"", payload.len())));

        let etag = mock
            .put_object("bucket", "key", Bytes::from_static(b"abc"))
            .await
            .unwrap();
        assert_eq!(etag, "\"3\"");
    }
}
