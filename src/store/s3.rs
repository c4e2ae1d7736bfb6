//! S3 (or S3-compatible) blob store holding one object per cache key.

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::{debug, info, instrument};

use super::BlobStore;
use crate::config::S3Config;

pub struct S3BlobStore {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3BlobStore {
    pub fn new(client: Client, bucket: String, prefix: String) -> Self {
        Self {
            client,
            bucket,
            prefix,
        }
    }

    /// Build a client from the ambient AWS environment plus the config
    /// section (custom endpoint for MinIO-style stores, path-style access).
    pub async fn from_config(config: &S3Config) -> Result<Self> {
        let mut loader = aws_config::from_env()
            .region(aws_config::Region::new(config.region.clone()));
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let aws_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
            .force_path_style(config.force_path_style)
            .build();
        let client = Client::from_conf(s3_config);

        info!(
            bucket = %config.bucket,
            region = %config.region,
            prefix = %config.prefix,
            "S3 blob store initialised"
        );
        Ok(Self::new(
            client,
            config.bucket.clone(),
            config.prefix.clone(),
        ))
    }

    fn object_key(&self, path: &str) -> String {
        format!("{}{}", self.prefix, path)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self, bytes), fields(bucket = %self.bucket))]
    async fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        let key = self.object_key(path);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type(content_type)
            .body(ByteStream::from(bytes.to_vec()))
            .send()
            .await
            .context("S3 PutObject")?;
        debug!(%key, bytes = bytes.len(), "blob uploaded");
        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn get(&self, path: &str) -> Result<Bytes> {
        let key = self.object_key(path);
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .context("S3 GetObject")?;

        let bytes = resp
            .body
            .collect()
            .await
            .context("read S3 GetObject body")?
            .into_bytes();
        debug!(%key, bytes = bytes.len(), "blob downloaded");
        Ok(bytes)
    }
}
