use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::ImageFormat;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use std::time::Duration;
use uuid::Uuid;

use super::truncate;

/// Location of an uploaded artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredArtifact {
    pub path: String,
    pub url: String,
    pub content_type: String,
    pub byte_len: usize,
}

/// Durable object storage for generated images.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Put `bytes` at the deterministic key for `user_id` and `timestamp`.
    /// The put either lands whole or not at all.
    async fn upload(
        &self,
        user_id: Uuid,
        timestamp: DateTime<Utc>,
        bytes: &[u8],
    ) -> Result<StoredArtifact, StorageError>;
}

/// File extension and content type for image bytes. Unknown formats are
/// stored as PNG, which is what the endpoints produce by default.
pub fn sniff_format(bytes: &[u8]) -> (&'static str, &'static str) {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Jpeg) => ("jpg", "image/jpeg"),
        Ok(ImageFormat::WebP) => ("webp", "image/webp"),
        _ => ("png", "image/png"),
    }
}

/// `{user_id}/{timestamp}.{ext}` with the timestamp in microseconds since the
/// epoch.
pub fn artifact_key(user_id: Uuid, timestamp: DateTime<Utc>, extension: &str) -> String {
    format!("{}/{}.{}", user_id, timestamp.timestamp_micros(), extension)
}

/// Client for S3-compatible object storage (R2, MinIO, S3).
pub struct S3ArtifactStore {
    bucket: Box<Bucket>,
    public_base_url: String,
    timeout: Duration,
}

impl S3ArtifactStore {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
        public_base_url: &str,
        timeout: Duration,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: region.to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?
            .with_path_style();

        Ok(Self {
            bucket,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn upload(
        &self,
        user_id: Uuid,
        timestamp: DateTime<Utc>,
        bytes: &[u8],
    ) -> Result<StoredArtifact, StorageError> {
        let (extension, content_type) = sniff_format(bytes);
        let key = artifact_key(user_id, timestamp, extension);

        let response = tokio::time::timeout(
            self.timeout,
            self.bucket.put_object_with_content_type(&key, bytes, content_type),
        )
        .await
        .map_err(|_| StorageError::Timeout)?
        .map_err(StorageError::S3)?;

        let status = response.status_code();
        if !(200..300).contains(&status) {
            let body = response.as_str().unwrap_or_default().to_string();
            return Err(StorageError::from_status(status, body));
        }

        tracing::debug!(key = %key, bytes = bytes.len(), "Artifact uploaded");

        Ok(StoredArtifact {
            url: self.public_url(&key),
            path: key,
            content_type: content_type.to_string(),
            byte_len: bytes.len(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Upload timed out")]
    Timeout,

    #[error("Storage permission denied (HTTP {status})")]
    PermissionDenied { status: u16 },

    #[error("Storage quota exceeded (HTTP {status})")]
    QuotaExceeded { status: u16 },

    #[error("Upload rejected (HTTP {status}): {detail}")]
    Rejected { status: u16, detail: String },

    #[error("Storage configuration error: {0}")]
    Config(String),
}

impl StorageError {
    pub fn from_status(status: u16, body: String) -> Self {
        if body.contains("QuotaExceeded") || status == 507 {
            StorageError::QuotaExceeded { status }
        } else if body.contains("AccessDenied") || status == 401 || status == 403 {
            StorageError::PermissionDenied { status }
        } else {
            StorageError::Rejected {
                status,
                detail: truncate(body, 300),
            }
        }
    }

    /// Quota and permission problems will not fix themselves; anything else
    /// is treated as a hiccup.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            StorageError::PermissionDenied { .. }
                | StorageError::QuotaExceeded { .. }
                | StorageError::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
    const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0, 0, 0, 0];

    #[test]
    fn key_is_deterministic_per_user_and_timestamp() {
        let user = Uuid::parse_str("8f14e45f-ceea-467f-a0e6-1a2b3c4d5e6f").unwrap();
        let ts = Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).unwrap();

        let key = artifact_key(user, ts, "png");
        assert_eq!(key, format!("{user}/1790856000000000.png"));
        assert_eq!(key, artifact_key(user, ts, "png"));
    }

    #[test]
    fn format_sniffing_picks_extension() {
        assert_eq!(sniff_format(PNG_MAGIC), ("png", "image/png"));
        assert_eq!(sniff_format(JPEG_MAGIC), ("jpg", "image/jpeg"));
        assert_eq!(sniff_format(b"not an image"), ("png", "image/png"));
    }

    #[test]
    fn quota_and_permission_errors_are_fatal() {
        assert!(!StorageError::from_status(403, String::new()).is_retryable());
        assert!(!StorageError::from_status(507, String::new()).is_retryable());
        assert!(!StorageError::from_status(
            400,
            "<Error><Code>QuotaExceeded</Code></Error>".to_string()
        )
        .is_retryable());
        assert!(!StorageError::from_status(
            400,
            "<Error><Code>AccessDenied</Code></Error>".to_string()
        )
        .is_retryable());
    }

    #[test]
    fn other_upload_errors_are_retryable() {
        assert!(StorageError::from_status(500, String::new()).is_retryable());
        assert!(StorageError::from_status(503, "SlowDown".to_string()).is_retryable());
        assert!(StorageError::Timeout.is_retryable());
    }
}
