use std::time::Duration;

use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;

use super::{validate_key, BlobStore, BlobStoreError};

/// A blob store over an S3-compatible bucket.
#[derive(Clone)]
pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3BlobStore {
    /// Builds a client for the given bucket.
    ///
    /// A custom `endpoint` switches the client to path-style addressing, which
    /// is what most S3-compatible providers expect.
    pub async fn new(
        bucket: String,
        region: String,
        endpoint: Option<String>,
        access_key_id: String,
        secret_access_key: String,
    ) -> Self {
        let credentials = Credentials::new(
            access_key_id,
            secret_access_key,
            None,
            None,
            "repub-s3-static-provider",
        );
        let mut loader = aws_config::from_env()
            .region(Region::new(region))
            .credentials_provider(credentials);
        let path_style = endpoint.is_some();
        if let Some(endpoint) = &endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let config = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&config)
            .force_path_style(path_style)
            .build();

        Self {
            client: aws_sdk_s3::Client::from_conf(s3_config),
            bucket,
        }
    }

    fn transient(e: impl std::fmt::Display) -> BlobStoreError {
        BlobStoreError::Transient(e.to_string())
    }
}

#[axum::async_trait]
impl BlobStore for S3BlobStore {
    async fn ensure_ready(&self) -> Result<(), BlobStoreError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| {
                Self::transient(format!(
                    "bucket `{bucket}` is not accessible: {e}",
                    bucket = self.bucket
                ))
            })
    }

    async fn put_archive(&self, key: &str, bytes: &[u8]) -> Result<(), BlobStoreError> {
        validate_key(key)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/octet-stream")
            .body(ByteStream::from(bytes.to_vec()))
            .send()
            .await
            .map(|_| ())
            .map_err(Self::transient)
    }

    async fn get_archive(&self, key: &str) -> Result<Bytes, BlobStoreError> {
        validate_key(key)?;
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    BlobStoreError::NotFound(key.to_string())
                } else {
                    Self::transient(service_error)
                }
            })?;
        object
            .body
            .collect()
            .await
            .map(|data| data.into_bytes())
            .map_err(Self::transient)
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobStoreError> {
        validate_key(key)?;
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(Self::transient(service_error))
                }
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        validate_key(key)?;
        // DeleteObject succeeds for absent keys, which is exactly the
        // idempotence we need.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map(|_| ())
            .map_err(Self::transient)
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, BlobStoreError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }
            let response = request.send().await.map_err(Self::transient)?;
            for object in response.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }
            match response.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(keys)
    }

    async fn presigned_get_url(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<String>, BlobStoreError> {
        validate_key(key)?;
        let config = PresigningConfig::builder()
            .expires_in(ttl)
            .build()
            .map_err(|e| Self::transient(format!("cannot build presigning config: {e}")))?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(config)
            .await
            .map_err(Self::transient)?;
        Ok(Some(presigned.uri().to_string()))
    }
}
