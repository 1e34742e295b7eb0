use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::SdkError,
    presigning::PresigningConfig,
    primitives::ByteStream,
    Client,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::{config::StorageConfig, BlobStore, ObjectMeta, PresignedRequest};

#[derive(Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
}

impl S3Storage {
    pub async fn new(config: StorageConfig) -> Result<Self> {
        debug!(
            bucket = %config.bucket,
            endpoint = ?config.endpoint,
            "Initializing S3 storage"
        );

        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "cumulus-storage",
        );

        let shared = aws_config::from_env()
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;

        let mut s3_config_builder =
            aws_sdk_s3::config::Builder::from(&shared).force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!("Storage client initialized for bucket: {}", config.bucket);

        Ok(Self {
            client,
            bucket: config.bucket,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

fn to_chrono(dt: Option<&aws_sdk_s3::primitives::DateTime>) -> DateTime<Utc> {
    dt.and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos()))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

fn is_not_found<E>(err: &SdkError<E>) -> bool {
    match err {
        SdkError::ServiceError(service_err) => service_err.raw().status().as_u16() == 404,
        _ => false,
    }
}

#[async_trait]
impl BlobStore for S3Storage {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Bytes> {
        debug!("Downloading from s3://{}/{}", self.bucket, key);

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to download from S3: {}", key))?;

        let data = response
            .body
            .collect()
            .await
            .context("Failed to read S3 response body")?
            .into_bytes();

        debug!("Downloaded {} bytes from s3://{}/{}", data.len(), self.bucket, key);

        Ok(data)
    }

    #[instrument(skip(self, data), fields(size = data.len()))]
    async fn put(&self, key: &str, data: Bytes, content_type: Option<&str>) -> Result<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data));

        if let Some(ct) = content_type {
            request = request.content_type(ct);
        }

        request
            .send()
            .await
            .with_context(|| format!("Failed to upload to S3: {}", key))?;

        info!("Uploaded s3://{}/{}", self.bucket, key);

        Ok(())
    }

    #[instrument(skip(self))]
    async fn copy(&self, source: &str, dest: &str) -> Result<()> {
        let copy_source = format!("{}/{}", self.bucket, source);

        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(&copy_source)
            .key(dest)
            .send()
            .await
            .with_context(|| format!("Failed to copy S3 object {} to {}", source, dest))?;

        debug!("Copied s3://{}/{} to {}", self.bucket, source, dest);

        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to delete from S3: {}", key))?;

        debug!("Deleted s3://{}/{}", self.bucket, key);

        Ok(())
    }

    #[instrument(skip(self))]
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => Ok(Some(ObjectMeta {
                key: key.to_string(),
                size: response.content_length().unwrap_or(0),
                last_modified: to_chrono(response.last_modified()),
            })),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(anyhow!("Failed to check S3 object {}: {}", key, err)),
        }
    }

    #[instrument(skip(self))]
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut results = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);

            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let output = request
                .send()
                .await
                .with_context(|| format!("Failed to list S3 objects under {}", prefix))?;

            for obj in output.contents() {
                if let Some(key) = obj.key() {
                    results.push(ObjectMeta {
                        key: key.to_string(),
                        size: obj.size().unwrap_or(0),
                        last_modified: to_chrono(obj.last_modified()),
                    });
                }
            }

            if output.is_truncated() == Some(true) {
                continuation_token = output.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }

        debug!("Listed {} objects under s3://{}/{}", results.len(), self.bucket, prefix);

        Ok(results)
    }

    #[instrument(skip(self))]
    async fn presign_get(
        &self,
        key: &str,
        expires_in: Duration,
        content_type: Option<&str>,
    ) -> Result<String> {
        let presigning_config = PresigningConfig::expires_in(expires_in)
            .context("Failed to create presigning config")?;

        let mut request = self.client.get_object().bucket(&self.bucket).key(key);
        if let Some(ct) = content_type {
            request = request.response_content_type(ct);
        }

        let presigned = request
            .presigned(presigning_config)
            .await
            .context("Failed to generate presigned URL")?;

        Ok(presigned.uri().to_string())
    }

    #[instrument(skip(self))]
    async fn presign_upload(&self, key: &str, expires_in: Duration) -> Result<PresignedRequest> {
        let presigning_config = PresigningConfig::expires_in(expires_in)
            .context("Failed to create presigning config")?;

        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .context("Failed to generate presigned upload")?;

        Ok(PresignedRequest {
            url: presigned.uri().to_string(),
            method: presigned.method().to_string(),
            headers: presigned
                .headers()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        })
    }
}
