//! Multipart upload coordinator
//!
//! Owns one server-side multipart session: its upload id, the part-number
//! counter and the ordered list of part handles. Parts are handed to the
//! worker pool in increasing part-number order and the final part list is
//! assembled by part number, whatever order the uploads finish in.

use super::pool::{PartUploadPool, PendingUpload, TaskOutcome};
use super::{PartFailure, UploadError};
use crate::metrics;
use crate::s3::{BackendError, CompletedPart, ObjectBackend};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;

/// Maximum parts allowed - S3 limit
pub const MAX_PARTS: u32 = 10_000;

pub(crate) type PartHandle = PendingUpload<Result<CompletedPart, BackendError>>;

/// Multipart upload coordinator
pub struct MultipartUploader {
    backend: Arc<dyn ObjectBackend>,
    pool: Arc<PartUploadPool>,
    bucket: String,
    key: String,
    upload_id: Option<String>,
    next_part_number: u32,
    pending: Vec<PartHandle>,
    completed: Vec<CompletedPart>,
}

impl MultipartUploader {
    pub fn new(
        backend: Arc<dyn ObjectBackend>,
        pool: Arc<PartUploadPool>,
        bucket: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            pool,
            bucket: bucket.into(),
            key: key.into(),
            upload_id: None,
            next_part_number: 1,
            pending: Vec::new(),
            completed: Vec::new(),
        }
    }

    /// Upload id of the open session
    pub fn upload_id(&self) -> Option<&str> {
        self.upload_id.as_deref()
    }

    pub fn has_session(&self) -> bool {
        self.upload_id.is_some()
    }

    /// Next part number to be assigned (1-based)
    pub fn part_number(&self) -> u32 {
        self.next_part_number
    }

    /// Parts confirmed by the last [`await_all`](Self::await_all)
    pub fn completed_parts(&self) -> &[CompletedPart] {
        &self.completed
    }

    /// Parts submitted but not yet awaited
    pub fn pending_parts(&self) -> usize {
        self.pending.len()
    }

    /// Start the multipart session; does nothing if one is already open
    #[tracing::instrument(
        name = "upload.multipart.initiate",
        skip(self),
        fields(s3.bucket = %self.bucket, s3.key = %self.key),
        err
    )]
    pub async fn initiate(&mut self) -> Result<(), UploadError> {
        if self.upload_id.is_some() {
            return Ok(());
        }

        let upload_id = self
            .backend
            .initiate_multipart_upload(&self.bucket, &self.key)
            .await
            .map_err(|source| UploadError::Initiation {
                bucket: self.bucket.clone(),
                key: self.key.clone(),
                source,
            })?;

        tracing::info!(upload_id = %upload_id, "Initiated multipart upload");
        self.upload_id = Some(upload_id);
        Ok(())
    }

    /// Hand a part to the worker pool, returning its part number
    ///
    /// Returns once the pool has accepted the task, not when the upload
    /// finishes.
    pub async fn submit_part(&mut self, payload: Bytes) -> Result<u32, UploadError> {
        let upload_id = self.upload_id.clone().ok_or(UploadError::NoSession)?;
        if self.next_part_number > MAX_PARTS {
            return Err(UploadError::PartLimitExceeded(MAX_PARTS));
        }

        let part_number = self.next_part_number;
        self.next_part_number += 1;

        let backend = Arc::clone(&self.backend);
        let bucket = self.bucket.clone();
        let key = self.key.clone();
        let size = payload.len();

        let handle = self
            .pool
            .submit(part_number, async move {
                let start = Instant::now();
                let result = backend
                    .upload_part(&bucket, &key, &upload_id, part_number, payload)
                    .await;
                metrics::record_part_upload(size, start.elapsed().as_secs_f64(), result.is_ok());
                result.map(|etag| CompletedPart { part_number, etag })
            })
            .await;

        tracing::debug!(part_number, bytes = size, "Submitted part");
        self.pending.push(handle);
        Ok(part_number)
    }

    /// Collect parts whose upload already finished, without waiting
    ///
    /// Reports the lowest-numbered failure among them. Unfinished parts stay
    /// pending.
    pub async fn check_finished(&mut self) -> Result<(), UploadError> {
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|handle| handle.is_finished());
        self.pending = running;

        match self.collect(finished).await {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Wait for every submitted part
    ///
    /// All handles are drained even after a failure; the error reported is
    /// the failure with the lowest part number.
    pub async fn await_all(&mut self) -> Result<&[CompletedPart], UploadError> {
        let pending = std::mem::take(&mut self.pending);
        match self.collect(pending).await {
            Some(err) => Err(err),
            None => Ok(&self.completed),
        }
    }

    /// Resolve handles in submission order, keeping the first failure
    async fn collect(&mut self, handles: Vec<PartHandle>) -> Option<UploadError> {
        let mut first_failure = None;

        for handle in handles {
            let part_number = handle.part_number();
            let cause = match handle.resolve().await {
                TaskOutcome::Completed(Ok(part)) => {
                    self.completed.push(part);
                    continue;
                }
                TaskOutcome::Completed(Err(e)) => PartFailure::Backend(e),
                TaskOutcome::Failed(message) => PartFailure::Crashed(message),
                TaskOutcome::CancelledForShutdown => PartFailure::Cancelled,
            };

            tracing::warn!(part_number, error = %cause, "Part upload failed");
            if first_failure.is_none() {
                first_failure = Some(UploadError::PartUpload { part_number, cause });
            }
        }

        first_failure
    }

    /// Complete the session, returning the object's ETag
    #[tracing::instrument(
        name = "upload.multipart.complete",
        skip(self),
        fields(
            s3.bucket = %self.bucket,
            s3.key = %self.key,
            upload_id = ?self.upload_id
        ),
        err
    )]
    pub async fn complete(&mut self) -> Result<String, UploadError> {
        let upload_id = self.upload_id.clone().ok_or(UploadError::NoSession)?;
        if !self.pending.is_empty() {
            self.await_all().await?;
        }
        if self.completed.is_empty() {
            return Err(UploadError::NoParts);
        }

        let mut parts = self.completed.clone();
        parts.sort_by_key(|p| p.part_number);
        let parts_count = parts.len();

        let etag = self
            .backend
            .complete_multipart_upload(&self.bucket, &self.key, &upload_id, parts)
            .await
            .map_err(|source| UploadError::Completion {
                upload_id: upload_id.clone(),
                source,
            })?;

        self.upload_id = None;
        tracing::info!(
            upload_id = %upload_id,
            parts = parts_count,
            etag = %etag,
            "Completed multipart upload"
        );
        Ok(etag)
    }

    /// Abort the session
    ///
    /// Waits for in-flight parts first so none lands after the abort. Without
    /// a session this makes no backend call.
    #[tracing::instrument(
        name = "upload.multipart.abort",
        skip(self),
        fields(s3.bucket = %self.bucket, s3.key = %self.key),
        err
    )]
    pub async fn abort(&mut self) -> Result<(), UploadError> {
        let Some(upload_id) = self.upload_id.take() else {
            return Ok(());
        };

        for handle in std::mem::take(&mut self.pending) {
            let _ = handle.resolve().await;
        }

        tracing::warn!(upload_id = %upload_id, "Aborting multipart upload");
        let result = self
            .backend
            .abort_multipart_upload(&self.bucket, &self.key, &upload_id)
            .await;
        metrics::record_abort(result.is_ok());

        result.map_err(|source| UploadError::Abort { upload_id, source })
    }

    /// Detach the open session and its in-flight parts without aborting
    pub(crate) fn detach(&mut self) -> Option<(String, Vec<PartHandle>)> {
        let upload_id = self.upload_id.take()?;
        Some((upload_id, std::mem::take(&mut self.pending)))
    }
}
