//! Upload stream
//!
//! Sequential write surface over one object. Bytes accumulate in a
//! [`ScratchBuffer`]; the first time the buffer reaches the partition size
//! the stream opens a multipart session and from then on every full
//! partition becomes a part. A stream closed before that point writes the
//! object with a single PutObject.
//!
//! ```text
//! UNDECIDED --(partition full)--> MULTIPART --(close)--> CLOSED
//! UNDECIDED --(close)--> SINGLE_PUT --> CLOSED
//! ```
//!
//! Any terminal error aborts an open session; the stream then refuses
//! further writes and the content hash stays unset. A part that fails in
//! the background is noticed at the next partition boundary at the latest.
//! [`UploadStream::abort`] abandons an upload on purpose.
//!
//! # Example
//!
//! ```no_run
//! use s3_upload_stream::config::UploadConfig;
//! use s3_upload_stream::s3::InMemoryBackend;
//! use s3_upload_stream::upload::{PartUploadPool, UploadStream};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = Arc::new(InMemoryBackend::new());
//! let pool = Arc::new(PartUploadPool::new(4));
//!
//! let mut stream = UploadStream::new(
//!     "my-bucket",
//!     "data/large.bin",
//!     backend,
//!     pool,
//!     &UploadConfig::default(),
//! )?;
//! stream.write(b"Hello, World!").await?;
//! stream.close().await?;
//!
//! println!("ETag: {:?}", stream.content_hash());
//! # Ok(())
//! # }
//! ```

use super::multipart::MultipartUploader;
use super::pool::PartUploadPool;
use super::scratch::ScratchBuffer;
use super::UploadError;
use crate::config::UploadConfig;
use crate::metrics;
use crate::s3::ObjectBackend;
use std::sync::Arc;
use std::time::Instant;

/// Upload strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Nothing decided yet; the buffer has never reached the partition size
    Undecided,
    /// Closed below the partition size; written with one PutObject
    SinglePut,
    /// The partition size was reached; a multipart session exists
    Multipart,
}

impl Strategy {
    fn as_str(self) -> &'static str {
        match self {
            Strategy::Undecided => "undecided",
            Strategy::SinglePut => "single_put",
            Strategy::Multipart => "multipart",
        }
    }
}

/// Stream lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Accepting writes
    Open,
    /// A terminal error occurred; only `close` is accepted
    Failed,
    /// Closed or aborted; no further operations have any effect
    Closed,
}

/// Streaming object upload
pub struct UploadStream {
    bucket: String,
    key: String,
    partition_size: usize,
    backend: Arc<dyn ObjectBackend>,
    buffer: Option<ScratchBuffer>,
    uploader: MultipartUploader,
    strategy: Strategy,
    state: StreamState,
    content_hash: Option<String>,
    content_sha256: Option<String>,
    bytes_written: u64,
    started: Instant,
}

impl UploadStream {
    /// Create a stream for `bucket`/`key`
    ///
    /// Fails if the configuration is invalid or the scratch file cannot be
    /// created.
    pub fn new(
        bucket: impl Into<String>,
        key: impl Into<String>,
        backend: Arc<dyn ObjectBackend>,
        pool: Arc<PartUploadPool>,
        config: &UploadConfig,
    ) -> Result<Self, UploadError> {
        config.validate()?;

        let bucket = bucket.into();
        let key = key.into();
        let buffer = ScratchBuffer::new(config.scratch_dir.as_deref())?;
        let uploader = MultipartUploader::new(Arc::clone(&backend), pool, &*bucket, &*key);

        tracing::debug!(
            bucket = %bucket,
            key = %key,
            partition_size = %config.partition_size,
            scratch = %buffer.path().display(),
            "Opened upload stream"
        );

        Ok(Self {
            bucket,
            key,
            partition_size: config.partition_bytes(),
            backend,
            buffer: Some(buffer),
            uploader,
            strategy: Strategy::Undecided,
            state: StreamState::Open,
            content_hash: None,
            content_sha256: None,
            bytes_written: 0,
            started: Instant::now(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Backend ETag of the committed object; `None` until a successful close
    pub fn content_hash(&self) -> Option<&str> {
        self.content_hash.as_deref()
    }

    /// Hex SHA-256 of the committed object, computed locally
    pub fn content_sha256(&self) -> Option<&str> {
        self.content_sha256.as_deref()
    }

    /// Next part number to be assigned (1-based)
    pub fn part_number(&self) -> u32 {
        self.uploader.part_number()
    }

    /// Total bytes accepted by `write`
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Write one byte
    pub async fn write_byte(&mut self, byte: u8) -> Result<(), UploadError> {
        self.write(&[byte]).await
    }

    /// Write all of `buf`
    ///
    /// Input spanning several partition boundaries is split into full
    /// partitions plus a buffered remainder.
    pub async fn write(&mut self, buf: &[u8]) -> Result<(), UploadError> {
        self.ensure_open()?;

        let mut remaining = buf;
        while !remaining.is_empty() {
            let buffered = self.buffer_mut()?.size_in_bytes();
            let take = (self.partition_size - buffered).min(remaining.len());
            let (chunk, rest) = remaining.split_at(take);

            if let Err(e) = self.buffer_mut()?.append(chunk) {
                return Err(self.fail(e.into()).await);
            }
            self.bytes_written += take as u64;
            remaining = rest;

            if self.buffer_mut()?.size_in_bytes() >= self.partition_size {
                if let Err(e) = self.on_partition_full().await {
                    return Err(self.fail(e).await);
                }
            }
        }
        Ok(())
    }

    /// Push buffered bytes to the backend and wait for every part so far
    ///
    /// Does nothing before the stream has switched to multipart.
    pub async fn flush(&mut self) -> Result<(), UploadError> {
        self.ensure_open()?;
        if self.strategy != Strategy::Multipart {
            return Ok(());
        }

        if let Err(e) = self.flush_parts().await {
            return Err(self.fail(e).await);
        }
        Ok(())
    }

    /// Commit the object
    ///
    /// Calling `close` again after it returned is a no-op.
    pub async fn close(&mut self) -> Result<(), UploadError> {
        match self.state {
            StreamState::Closed => return Ok(()),
            StreamState::Failed => {
                self.state = StreamState::Closed;
                self.release_buffer();
                return Err(UploadError::StreamFailed);
            }
            StreamState::Open => {}
        }
        self.state = StreamState::Closed;

        let result = match self.finalize().await {
            Ok(etag) => {
                self.content_sha256 = self.buffer.as_ref().map(|b| b.object_sha256());
                metrics::record_upload(
                    self.strategy.as_str(),
                    true,
                    self.bytes_written,
                    self.started.elapsed().as_secs_f64(),
                );
                tracing::info!(
                    bucket = %self.bucket,
                    key = %self.key,
                    strategy = self.strategy.as_str(),
                    bytes = self.bytes_written,
                    etag = %etag,
                    "Upload stream committed"
                );
                self.content_hash = Some(etag);
                Ok(())
            }
            Err(e) => Err(self.fail(e).await),
        };

        self.release_buffer();
        result
    }

    /// Abandon the upload
    ///
    /// Waits for in-flight parts, aborts the session if one exists and
    /// discards buffered bytes. Nothing is committed. The stream is closed
    /// afterwards, so a later `close` or `abort` is a no-op.
    pub async fn abort(&mut self) -> Result<(), UploadError> {
        if self.state == StreamState::Closed {
            return Ok(());
        }
        let failed = self.state == StreamState::Failed;
        self.state = StreamState::Closed;
        self.release_buffer();

        tracing::warn!(
            bucket = %self.bucket,
            key = %self.key,
            bytes = self.bytes_written,
            "Upload stream aborted"
        );

        let result = self.uploader.abort().await;
        if !failed {
            metrics::record_upload(
                self.strategy.as_str(),
                false,
                self.bytes_written,
                self.started.elapsed().as_secs_f64(),
            );
        }
        result
    }

    // ========================================================================
    // Private helpers
    // ========================================================================

    fn ensure_open(&self) -> Result<(), UploadError> {
        match self.state {
            StreamState::Open => Ok(()),
            StreamState::Failed => Err(UploadError::StreamFailed),
            StreamState::Closed => Err(UploadError::StreamClosed),
        }
    }

    fn buffer_mut(&mut self) -> Result<&mut ScratchBuffer, UploadError> {
        self.buffer.as_mut().ok_or(UploadError::StreamClosed)
    }

    fn release_buffer(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            buffer.release();
        }
    }

    async fn on_partition_full(&mut self) -> Result<(), UploadError> {
        if self.strategy == Strategy::Undecided {
            self.uploader.initiate().await?;
            self.strategy = Strategy::Multipart;
        }
        self.uploader.check_finished().await?;
        self.submit_buffered().await
    }

    async fn submit_buffered(&mut self) -> Result<(), UploadError> {
        let segment = self.buffer_mut()?.drain_for_upload()?;
        tracing::debug!(
            bytes = segment.data.len(),
            sha256 = %segment.sha256,
            "Drained scratch buffer"
        );
        self.uploader.submit_part(segment.data).await?;
        Ok(())
    }

    async fn flush_parts(&mut self) -> Result<(), UploadError> {
        if !self.buffer_mut()?.is_empty() {
            self.submit_buffered().await?;
        }
        self.uploader.await_all().await?;
        Ok(())
    }

    async fn finalize(&mut self) -> Result<String, UploadError> {
        match self.strategy {
            Strategy::Undecided | Strategy::SinglePut => {
                self.strategy = Strategy::SinglePut;
                let segment = self.buffer_mut()?.drain_for_upload()?;
                self.backend
                    .put_object(&self.bucket, &self.key, segment.data)
                    .await
                    .map_err(UploadError::PutObject)
            }
            Strategy::Multipart => {
                self.flush_parts().await?;
                self.uploader.complete().await
            }
        }
    }

    /// Record a terminal error, aborting any open session
    ///
    /// Abort failures are logged; the triggering error is returned.
    async fn fail(&mut self, err: UploadError) -> UploadError {
        if self.state == StreamState::Open {
            self.state = StreamState::Failed;
        }

        tracing::error!(
            bucket = %self.bucket,
            key = %self.key,
            error = %err,
            "Upload stream failed"
        );

        if let Err(abort_err) = self.uploader.abort().await {
            tracing::error!(
                error = %abort_err,
                original_error = %err,
                "Failed to abort multipart upload"
            );
        }

        metrics::record_upload(
            self.strategy.as_str(),
            false,
            self.bytes_written,
            self.started.elapsed().as_secs_f64(),
        );
        err
    }
}

impl Drop for UploadStream {
    fn drop(&mut self) {
        if self.state != StreamState::Open {
            return;
        }
        let Some((upload_id, pending)) = self.uploader.detach() else {
            return;
        };

        tracing::warn!(
            bucket = %self.bucket,
            key = %self.key,
            upload_id = %upload_id,
            "Upload stream dropped without close"
        );

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(upload_id = %upload_id, "No runtime to abort multipart upload");
            return;
        };

        let backend = Arc::clone(&self.backend);
        let bucket = self.bucket.clone();
        let key = self.key.clone();
        handle.spawn(async move {
            for part in pending {
                let _ = part.resolve().await;
            }
            if let Err(e) = backend.abort_multipart_upload(&bucket, &key, &upload_id).await {
                tracing::error!(
                    upload_id = %upload_id,
                    error = %e,
                    "Failed to abort multipart upload of dropped stream"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ByteSize;
    use crate::s3::{BackendCall, BackendError, FailurePoint, InMemoryBackend, MockObjectBackend};
    use std::time::Duration;

    const PARTITION: usize = 16;

    fn config(dir: &tempfile::TempDir) -> UploadConfig {
        UploadConfig {
            partition_size: ByteSize(PARTITION as u64),
            concurrency: 2,
            scratch_dir: Some(dir.path().to_path_buf()),
        }
    }

    fn stream(backend: Arc<dyn ObjectBackend>, dir: &tempfile::TempDir) -> UploadStream {
        UploadStream::new(
            "bucket",
            "key",
            backend,
            Arc::new(PartUploadPool::new(2)),
            &config(dir),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_write_byte_uses_single_put() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockObjectBackend::new();
        mock.expect_put_object()
            .withf(|bucket, key, payload| {
                bucket == "bucket" && key == "key" && payload.as_ref() == [1u8]
            })
            .times(1)
            .returning(|_, _, _| Ok("putTag".into()));
        mock.expect_initiate_multipart_upload().never();
        mock.expect_complete_multipart_upload().never();

        let mut stream = stream(Arc::new(mock), &dir);
        stream.write_byte(1).await.unwrap();
        stream.close().await.unwrap();

        assert_eq!(stream.content_hash(), Some("putTag"));
        assert_eq!(stream.strategy(), Strategy::SinglePut);
        assert_eq!(stream.part_number(), 1);
    }

    #[tokio::test]
    async fn test_empty_stream_puts_empty_object() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockObjectBackend::new();
        mock.expect_put_object()
            .withf(|_, _, payload| payload.is_empty())
            .times(1)
            .returning(|_, _, _| Ok("putTag".into()));

        let mut stream = stream(Arc::new(mock), &dir);
        stream.close().await.unwrap();
        assert_eq!(stream.content_hash(), Some("putTag"));
    }

    #[tokio::test]
    async fn test_flush_before_any_write_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(InMemoryBackend::new());

        let mut stream = stream(backend.clone(), &dir);
        stream.flush().await.unwrap();
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_partition_plus_one_uses_two_parts() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(InMemoryBackend::new());

        let mut stream = stream(backend.clone(), &dir);
        assert_eq!(stream.part_number(), 1);
        stream.write(&[7u8; PARTITION + 1]).await.unwrap();
        assert_eq!(stream.part_number(), 2);
        assert_eq!(stream.strategy(), Strategy::Multipart);

        stream.close().await.unwrap();
        assert_eq!(stream.part_number(), 3);

        let mut parts: Vec<(u32, usize)> = backend
            .calls()
            .iter()
            .filter_map(|c| match c {
                BackendCall::UploadPart {
                    part_number, size, ..
                } => Some((*part_number, *size)),
                _ => None,
            })
            .collect();
        parts.sort();
        assert_eq!(parts, vec![(1, PARTITION), (2, 1)]);

        let object = backend.object("bucket", "key").unwrap();
        assert_eq!(stream.content_hash(), Some(object.etag.as_str()));
        assert_eq!(object.data.len(), PARTITION + 1);
    }

    #[tokio::test]
    async fn test_exact_multiple_submits_no_empty_part() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(InMemoryBackend::new());

        let mut stream = stream(backend.clone(), &dir);
        stream.write(&[1u8; PARTITION * 2]).await.unwrap();
        stream.close().await.unwrap();

        assert_eq!(stream.part_number(), 3);
        assert_eq!(
            backend.count(|c| matches!(c, BackendCall::UploadPart { size: 0, .. })),
            0
        );
        assert!(backend.calls().contains(&BackendCall::CompleteMultipartUpload {
            upload_id: "upload-1".into(),
            part_numbers: vec![1, 2],
        }));
    }

    #[tokio::test]
    async fn test_local_digest_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(InMemoryBackend::new());

        let mut stream = stream(backend, &dir);
        stream.write(b"hello").await.unwrap();
        assert!(stream.content_sha256().is_none());
        stream.close().await.unwrap();

        assert_eq!(
            stream.content_sha256(),
            Some("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
        );
        assert_eq!(stream.bytes_written(), 5);
    }

    #[tokio::test]
    async fn test_initiation_failure_fails_write_without_abort() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(InMemoryBackend::new());
        backend.fail_on(FailurePoint::Initiate);

        let mut stream = stream(backend.clone(), &dir);
        let err = stream.write(&[0u8; PARTITION]).await.unwrap_err();
        assert!(matches!(err, UploadError::Initiation { .. }));
        assert_eq!(stream.state(), StreamState::Failed);

        assert!(matches!(
            stream.write(b"more").await,
            Err(UploadError::StreamFailed)
        ));
        assert!(matches!(stream.close().await, Err(UploadError::StreamFailed)));
        assert_eq!(
            backend.count(|c| matches!(c, BackendCall::AbortMultipartUpload { .. })),
            0
        );
        assert!(stream.content_hash().is_none());
    }

    #[tokio::test]
    async fn test_put_failure_leaves_hash_unset() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockObjectBackend::new();
        mock.expect_put_object()
            .times(1)
            .returning(|_, _, _| Err(BackendError::ResponseError("InternalError".into())));
        mock.expect_abort_multipart_upload().never();

        let mut stream = stream(Arc::new(mock), &dir);
        stream.write(b"small").await.unwrap();
        assert!(matches!(
            stream.close().await,
            Err(UploadError::PutObject(_))
        ));
        assert!(stream.content_hash().is_none());
        assert!(stream.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = stream(Arc::new(InMemoryBackend::new()), &dir);
        stream.close().await.unwrap();

        assert!(matches!(
            stream.write(b"late").await,
            Err(UploadError::StreamClosed)
        ));
        assert!(matches!(stream.flush().await, Err(UploadError::StreamClosed)));
    }

    #[tokio::test]
    async fn test_scratch_file_removed_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = stream(Arc::new(InMemoryBackend::new()), &dir);
        stream.write(b"data").await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        stream.close().await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.partition_size = ByteSize(0);

        let result = UploadStream::new(
            "bucket",
            "key",
            Arc::new(InMemoryBackend::new()),
            Arc::new(PartUploadPool::new(1)),
            &config,
        );
        assert!(matches!(result, Err(UploadError::Config(_))));
    }

    #[tokio::test]
    async fn test_drop_with_open_session_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(InMemoryBackend::new());

        let mut stream = stream(backend.clone(), &dir);
        stream.write(&[0u8; PARTITION]).await.unwrap();
        stream.flush().await.unwrap();
        drop(stream);

        for _ in 0..100 {
            if backend.open_uploads() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(backend.open_uploads(), 0);
        assert!(backend.object("bucket", "key").is_none());
    }

    #[tokio::test]
    async fn test_drop_waits_for_in_flight_part_before_abort() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(InMemoryBackend::new());
        backend.delay_part(1, Duration::from_millis(100));

        let mut stream = stream(backend.clone(), &dir);
        stream.write(&[0u8; PARTITION]).await.unwrap();
        drop(stream);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            backend.count(|c| matches!(c, BackendCall::AbortMultipartUpload { .. })),
            0
        );
        assert_eq!(backend.open_uploads(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            backend.count(|c| matches!(c, BackendCall::AbortMultipartUpload { .. })),
            1
        );
        assert_eq!(backend.open_uploads(), 0);
    }

    #[tokio::test]
    async fn test_abort_discards_multipart_upload() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(InMemoryBackend::new());

        let mut stream = stream(backend.clone(), &dir);
        stream.write(&[3u8; PARTITION + 1]).await.unwrap();
        stream.abort().await.unwrap();

        assert_eq!(stream.state(), StreamState::Closed);
        assert_eq!(
            backend.count(|c| matches!(c, BackendCall::AbortMultipartUpload { .. })),
            1
        );
        assert_eq!(
            backend.count(|c| matches!(c, BackendCall::CompleteMultipartUpload { .. })),
            0
        );
        assert_eq!(backend.open_uploads(), 0);
        assert!(backend.object("bucket", "key").is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        assert!(matches!(
            stream.write(b"late").await,
            Err(UploadError::StreamClosed)
        ));
        assert!(stream.close().await.is_ok());
        assert!(stream.abort().await.is_ok());
        assert!(stream.content_hash().is_none());
    }

    #[tokio::test]
    async fn test_abort_before_multipart_makes_no_calls() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockObjectBackend::new();
        mock.expect_put_object().never();
        mock.expect_abort_multipart_upload().never();

        let mut stream = stream(Arc::new(mock), &dir);
        stream.write(b"small").await.unwrap();
        stream.abort().await.unwrap();

        assert_eq!(stream.state(), StreamState::Closed);
        assert!(stream.content_hash().is_none());
    }

    #[tokio::test]
    async fn test_local_buffer_failure_mid_session_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(InMemoryBackend::new());

        let mut stream = stream(backend.clone(), &dir);
        stream.write(&[0u8; PARTITION]).await.unwrap();
        stream.flush().await.unwrap();
        stream.buffer.as_mut().unwrap().fail_next_drain();

        let err = stream.write(&[1u8; PARTITION]).await.unwrap_err();
        assert!(matches!(err, UploadError::LocalBuffer(_)));
        assert_eq!(stream.state(), StreamState::Failed);
        assert_eq!(
            backend.count(|c| matches!(c, BackendCall::AbortMultipartUpload { .. })),
            1
        );
        assert_eq!(backend.open_uploads(), 0);

        assert!(matches!(stream.close().await, Err(UploadError::StreamFailed)));
        assert!(stream.content_hash().is_none());
        assert!(backend.object("bucket", "key").is_none());
    }
}
