//! AWS SDK backend
//!
//! [`ObjectBackend`] implementation over `aws-sdk-s3`. Works against AWS S3
//! and S3-compatible stores (MinIO, RustFS, Ceph RGW) through a custom
//! endpoint with path-style addressing.
//!
//! The SDK retry layer is disabled: each call is a single attempt and a
//! failure is reported to the caller as-is.

use super::credentials::{CredentialsError, CredentialsProvider};
use super::{BackendError, CompletedPart, ObjectBackend};
use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as SdkCompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;

impl From<CredentialsError> for BackendError {
    fn from(err: CredentialsError) -> Self {
        BackendError::ConfigError(err.to_string())
    }
}

/// S3 backend
pub struct S3Backend {
    client: Client,
    region: String,
    endpoint: Option<String>,
}

impl S3Backend {
    /// Create a backend from configuration
    ///
    /// Credentials are resolved from the configuration first, then from the
    /// `AWS_*` environment variables.
    pub fn from_config(config: &S3Config) -> Result<Self, BackendError> {
        if config.region.trim().is_empty() {
            return Err(BackendError::ConfigError("region must not be empty".into()));
        }

        let credentials = CredentialsProvider::resolve(config)?;

        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials.into_sdk())
            .retry_config(RetryConfig::disabled());

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            region: config.region.clone(),
            endpoint: config.endpoint.clone(),
        })
    }

    /// Get the region
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Get the endpoint URL
    pub fn endpoint(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", self.region))
    }
}

fn map_sdk_error<E, R>(err: SdkError<E, R>) -> BackendError
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(&err).to_string();
    match err {
        SdkError::ServiceError(_) => BackendError::ResponseError(message),
        _ => BackendError::RequestError(message),
    }
}

fn to_sdk_part_number(part_number: u32) -> Result<i32, BackendError> {
    i32::try_from(part_number)
        .map_err(|_| BackendError::RequestError(format!("part number {} out of range", part_number)))
}

#[async_trait]
impl ObjectBackend for S3Backend {
    #[tracing::instrument(
        name = "s3.create_multipart_upload",
        skip(self),
        fields(
            s3.bucket = %bucket,
            s3.key = %key,
            s3.upload_id = tracing::field::Empty
        ),
        err
    )]
    async fn initiate_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<String, BackendError> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(map_sdk_error)?;

        let upload_id = output
            .upload_id()
            .ok_or(BackendError::MissingField("UploadId"))?
            .to_string();

        tracing::Span::current().record("s3.upload_id", upload_id.as_str());
        Ok(upload_id)
    }

    #[tracing::instrument(
        name = "s3.upload_part",
        skip(self, payload),
        fields(
            s3.bucket = %bucket,
            s3.key = %key,
            s3.upload_id = %upload_id,
            s3.part_number = part_number,
            upload.bytes = payload.len(),
            s3.etag = tracing::field::Empty
        ),
        err
    )]
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        payload: Bytes,
    ) -> Result<String, BackendError> {
        let output = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(to_sdk_part_number(part_number)?)
            .body(ByteStream::from(payload))
            .send()
            .await
            .map_err(map_sdk_error)?;

        let etag = output
            .e_tag()
            .ok_or(BackendError::MissingField("ETag"))?
            .to_string();

        tracing::Span::current().record("s3.etag", etag.as_str());
        Ok(etag)
    }

    #[tracing::instrument(
        name = "s3.complete_multipart_upload",
        skip(self, parts),
        fields(
            s3.bucket = %bucket,
            s3.key = %key,
            s3.upload_id = %upload_id,
            parts_count = parts.len(),
            s3.etag = tracing::field::Empty
        ),
        err
    )]
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<String, BackendError> {
        let sdk_parts = parts
            .into_iter()
            .map(|part| {
                Ok(SdkCompletedPart::builder()
                    .part_number(to_sdk_part_number(part.part_number)?)
                    .e_tag(part.etag)
                    .build())
            })
            .collect::<Result<Vec<_>, BackendError>>()?;

        let output = self
            .client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(sdk_parts))
                    .build(),
            )
            .send()
            .await
            .map_err(map_sdk_error)?;

        let etag = output
            .e_tag()
            .ok_or(BackendError::MissingField("ETag"))?
            .to_string();

        tracing::Span::current().record("s3.etag", etag.as_str());
        Ok(etag)
    }

    #[tracing::instrument(
        name = "s3.abort_multipart_upload",
        skip(self),
        fields(s3.bucket = %bucket, s3.key = %key, s3.upload_id = %upload_id),
        err
    )]
    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), BackendError> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(())
    }

    #[tracing::instrument(
        name = "s3.put_object",
        skip(self, payload),
        fields(
            s3.bucket = %bucket,
            s3.key = %key,
            upload.bytes = payload.len(),
            s3.etag = tracing::field::Empty
        ),
        err
    )]
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        payload: Bytes,
    ) -> Result<String, BackendError> {
        let output = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(payload))
            .send()
            .await
            .map_err(map_sdk_error)?;

        let etag = output
            .e_tag()
            .ok_or(BackendError::MissingField("ETag"))?
            .to_string();

        tracing::Span::current().record("s3.etag", etag.as_str());
        Ok(etag)
    }
}
