use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use std::sync::Arc;
use tracing::{debug, info};

use super::codec::{decode_rows, encode_rows};
use super::{WindowStore, is_window_key, window_key};
use crate::events::AircraftEvent;
use crate::window::ClosedWindow;

/// Window store backed by an S3 bucket
///
/// `PutObject` replaces an existing object atomically, which gives the same
/// idempotent-overwrite behaviour as the filesystem store.
#[derive(Clone)]
pub struct S3WindowStore {
    client: Arc<aws_sdk_s3::Client>,
    bucket: String,
    prefix: String,
}

impl S3WindowStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: String, prefix: String) -> Self {
        Self {
            client: Arc::new(client),
            bucket,
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    /// Build a store using credentials and region from the environment
    pub async fn from_env(bucket: String, prefix: String) -> Self {
        info!(
            "Initializing S3 client for window storage in bucket: {}/{}",
            bucket, prefix
        );
        let config = aws_config::load_from_env().await;
        Self::new(aws_sdk_s3::Client::new(&config), bucket, prefix)
    }
}

#[async_trait]
impl WindowStore for S3WindowStore {
    async fn put_window(&self, window: &ClosedWindow) -> Result<String> {
        let key = window_key(&self.prefix, window.window_end());
        let events = window.events.clone();
        let payload = tokio::task::spawn_blocking(move || encode_rows(&events)).await??;
        let size = payload.len();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type("application/zstd")
            .body(ByteStream::from(payload))
            .send()
            .await
            .context(format!("Failed to upload s3://{}/{}", self.bucket, key))?;

        metrics::counter!("storage.s3.bytes_uploaded_total").increment(size as u64);
        info!(
            "Uploaded {} records to s3://{}/{}",
            window.event_count(),
            self.bucket,
            key
        );
        Ok(key)
    }

    async fn list_window_keys(&self) -> Result<Vec<String>> {
        let list_prefix = if self.prefix.is_empty() {
            "date=".to_string()
        } else {
            format!("{}/date=", self.prefix)
        };

        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;
        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&list_prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .context(format!(
                    "Failed to list s3://{}/{}",
                    self.bucket, list_prefix
                ))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .filter(|key| is_window_key(&self.prefix, key))
                    .map(str::to_string),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }

        keys.sort();
        debug!(
            "Found {} window batches in s3://{}/{}",
            keys.len(),
            self.bucket,
            list_prefix
        );
        Ok(keys)
    }

    async fn get_window(&self, key: &str) -> Result<Vec<AircraftEvent>> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context(format!("Failed to fetch s3://{}/{}", self.bucket, key))?;

        let bytes = object
            .body
            .collect()
            .await
            .context("Failed to read S3 object body")?
            .into_bytes();

        tokio::task::spawn_blocking(move || decode_rows(&bytes)).await?
    }

    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }
}
