//! In-memory backend
//!
//! Keeps objects and open multipart uploads in process memory, records every
//! call in the order it was made, and can be told to fail specific calls.
//! ETags are derived from content, so identical bytes split at identical part
//! boundaries always produce the same object ETag.

use super::{BackendError, CompletedPart, ObjectBackend};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

/// One recorded backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    InitiateMultipartUpload {
        bucket: String,
        key: String,
    },
    UploadPart {
        upload_id: String,
        part_number: u32,
        size: usize,
    },
    CompleteMultipartUpload {
        upload_id: String,
        part_numbers: Vec<u32>,
    },
    AbortMultipartUpload {
        upload_id: String,
    },
    PutObject {
        bucket: String,
        key: String,
        size: usize,
    },
}

/// A call that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    Initiate,
    UploadPart(u32),
    Complete,
    Abort,
    Put,
}

/// A committed object
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub etag: String,
}

struct OpenUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Default)]
struct State {
    calls: Vec<BackendCall>,
    failures: HashSet<FailurePoint>,
    part_delays: HashMap<u32, Duration>,
    uploads: HashMap<String, OpenUpload>,
    objects: HashMap<(String, String), StoredObject>,
    next_upload: u64,
    in_flight_parts: usize,
    max_in_flight_parts: usize,
}

/// In-memory object backend
#[derive(Default)]
pub struct InMemoryBackend {
    state: Mutex<State>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every future call at `point` fail
    pub fn fail_on(&self, point: FailurePoint) {
        self.state.lock().failures.insert(point);
    }

    /// Delay the upload of one part number
    pub fn delay_part(&self, part_number: u32, delay: Duration) {
        self.state.lock().part_delays.insert(part_number, delay);
    }

    /// All calls made so far, in order
    pub fn calls(&self) -> Vec<BackendCall> {
        self.state.lock().calls.clone()
    }

    /// Number of recorded calls matching a predicate
    pub fn count(&self, predicate: impl Fn(&BackendCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    /// Committed object at `bucket`/`key`
    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.state
            .lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Number of multipart uploads initiated but neither completed nor aborted
    pub fn open_uploads(&self) -> usize {
        self.state.lock().uploads.len()
    }

    /// Highest number of `upload_part` calls observed running at once
    pub fn max_concurrent_part_uploads(&self) -> usize {
        self.state.lock().max_in_flight_parts
    }

    fn check(state: &State, point: FailurePoint) -> Result<(), BackendError> {
        if state.failures.contains(&point) {
            return Err(BackendError::ResponseError(format!(
                "injected failure at {:?}",
                point
            )));
        }
        Ok(())
    }

    fn etag_of(data: &[u8]) -> String {
        let digest = hex::encode(Sha256::digest(data));
        format!("\"{}\"", &digest[..32])
    }
}

#[async_trait]
impl ObjectBackend for InMemoryBackend {
    async fn initiate_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<String, BackendError> {
        let mut state = self.state.lock();
        state.calls.push(BackendCall::InitiateMultipartUpload {
            bucket: bucket.to_string(),
            key: key.to_string(),
        });
        Self::check(&state, FailurePoint::Initiate)?;

        state.next_upload += 1;
        let upload_id = format!("upload-{}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            OpenUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        payload: Bytes,
    ) -> Result<String, BackendError> {
        let delay = {
            let mut state = self.state.lock();
            state.calls.push(BackendCall::UploadPart {
                upload_id: upload_id.to_string(),
                part_number,
                size: payload.len(),
            });
            state.in_flight_parts += 1;
            state.max_in_flight_parts = state.max_in_flight_parts.max(state.in_flight_parts);
            state.part_delays.get(&part_number).copied()
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.in_flight_parts -= 1;
        Self::check(&state, FailurePoint::UploadPart(part_number))?;

        let etag = Self::etag_of(&payload);
        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| BackendError::ResponseError(format!("NoSuchUpload: {}", upload_id)))?;
        upload.parts.insert(part_number, (etag.clone(), payload));
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<String, BackendError> {
        let mut state = self.state.lock();
        state.calls.push(BackendCall::CompleteMultipartUpload {
            upload_id: upload_id.to_string(),
            part_numbers: parts.iter().map(|p| p.part_number).collect(),
        });
        Self::check(&state, FailurePoint::Complete)?;

        if parts.is_empty() {
            return Err(BackendError::ResponseError("MalformedXML: no parts".into()));
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(BackendError::ResponseError("InvalidPartOrder".into()));
        }

        let upload = state
            .uploads
            .get(upload_id)
            .ok_or_else(|| BackendError::ResponseError(format!("NoSuchUpload: {}", upload_id)))?;

        let mut data = BytesMut::new();
        let mut etags = String::new();
        for part in &parts {
            match upload.parts.get(&part.part_number) {
                Some((etag, bytes)) if *etag == part.etag => {
                    data.extend_from_slice(bytes);
                    etags.push_str(etag);
                }
                _ => {
                    return Err(BackendError::ResponseError(format!(
                        "InvalidPart: {}",
                        part.part_number
                    )))
                }
            }
        }

        let digest = hex::encode(Sha256::digest(etags.as_bytes()));
        let etag = format!("\"{}-{}\"", &digest[..32], parts.len());

        if let Some(upload) = state.uploads.remove(upload_id) {
            state.objects.insert(
                (upload.bucket, upload.key),
                StoredObject {
                    data: data.freeze(),
                    etag: etag.clone(),
                },
            );
        }
        Ok(etag)
    }

    async fn abort_multipart_upload(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.calls.push(BackendCall::AbortMultipartUpload {
            upload_id: upload_id.to_string(),
        });
        Self::check(&state, FailurePoint::Abort)?;
        state.uploads.remove(upload_id);
        Ok(())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        payload: Bytes,
    ) -> Result<String, BackendError> {
        let mut state = self.state.lock();
        state.calls.push(BackendCall::PutObject {
            bucket: bucket.to_string(),
            key: key.to_string(),
            size: payload.len(),
        });
        Self::check(&state, FailurePoint::Put)?;

        let etag = Self::etag_of(&payload);
        state.objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data: payload,
                etag: etag.clone(),
            },
        );
        Ok(etag)
    }
}
