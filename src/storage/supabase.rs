use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

use super::{ObjectStore, StorageError};
use crate::config::SupabaseConfig;

/// Supabase storage bucket accessed with the service role key.
pub struct SupabaseStorage {
    client: reqwest::Client,
    base_url: String,
    service_key: String,
    bucket: String,
}

impl SupabaseStorage {
    pub fn new(config: &SupabaseConfig) -> Result<Self, StorageError> {
        if config.url.is_empty() || config.service_role_key.is_empty() {
            return Err(StorageError::NotConfigured(
                "SUPABASE_URL and SUPABASE_SERVICE_ROLE_KEY are required",
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;

        info!(
            "Initialized Supabase storage for bucket {}",
            config.audio_bucket
        );

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            service_key: config.service_role_key.clone(),
            bucket: config.audio_bucket.clone(),
        })
    }

    pub fn object_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{}",
            self.base_url,
            self.bucket,
            path.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl ObjectStore for SupabaseStorage {
    fn name(&self) -> &'static str {
        "supabase"
    }

    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let size = bytes.len();
        let response = self
            .client
            .post(self.object_url(path))
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header("x-upsert", "true")
            .body(bytes)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Status {
                status: status.as_u16(),
                body,
            });
        }

        debug!("Uploaded {} bytes to {}/{}", size, self.bucket, path);
        Ok(path.to_string())
    }
}
