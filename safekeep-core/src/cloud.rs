/*!
Cloud upload collaborator.

After a backup completes, its final artifact may be copied to object storage.
The upload is opportunistic: it runs under a bounded retry policy and an
overall deadline, and its failure never changes the outcome of the backup.
*/

use async_trait::async_trait;
use safekeep_retry::{with_policy_and_timeout, RetryError, RetryPolicy, RetryResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::{BackupError, Result};

/// Key prefix for uploaded artifacts
pub const CLOUD_KEY_PREFIX: &str = "backups";

/// One upload attempt to a remote object store
///
/// Implementations report failures as [`RetryError::Transient`] when another
/// attempt may succeed and [`RetryError::Permanent`] otherwise.
#[async_trait]
pub trait CloudUploader: Send + Sync {
    /// Upload the file at `local_path` under `key`
    async fn upload(&self, local_path: &Path, key: &str) -> RetryResult<()>;

    /// Backend name for logs
    fn backend_name(&self) -> &str;
}

/// Object key for an artifact file name
pub fn cloud_key_for(file_name: &str) -> String {
    format!("{CLOUD_KEY_PREFIX}/{file_name}")
}

/// Uploads artifacts with retry and a deadline
#[derive(Clone)]
pub struct CloudSync {
    uploader: Arc<dyn CloudUploader>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl CloudSync {
    pub fn new(uploader: Arc<dyn CloudUploader>, timeout: Duration) -> Self {
        Self {
            uploader,
            policy: RetryPolicy::upload(),
            timeout,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn backend_name(&self) -> &str {
        self.uploader.backend_name()
    }

    /// Upload `local_path`, returning the object key on success
    ///
    /// # Errors
    /// * `BackupError::Timeout` - If all attempts together exceed the deadline
    /// * `BackupError::Upload` - If the upload failed permanently or ran out of attempts
    pub async fn upload_artifact(&self, local_path: &Path) -> Result<String> {
        let file_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| {
                BackupError::upload(format!("{} has no file name", local_path.display()))
            })?;
        let key = cloud_key_for(&file_name);

        debug!(
            backend = self.uploader.backend_name(),
            key = %key,
            "Uploading artifact"
        );

        let uploader = Arc::clone(&self.uploader);
        let path: PathBuf = local_path.to_path_buf();
        let attempt_key = key.clone();
        let result = with_policy_and_timeout(
            "upload_artifact",
            self.policy.clone(),
            self.timeout,
            move |_attempt| {
                let uploader = Arc::clone(&uploader);
                let path = path.clone();
                let key = attempt_key.clone();
                Box::pin(async move { uploader.upload(&path, &key).await })
            },
        )
        .await;

        match result {
            Ok(()) => {
                info!(
                    backend = self.uploader.backend_name(),
                    key = %key,
                    "Artifact uploaded"
                );
                Ok(key)
            }
            Err(RetryError::TimedOut { timeout, .. }) => Err(BackupError::Timeout(format!(
                "upload of {key} exceeded {}s",
                timeout.as_secs()
            ))),
            Err(e) => Err(BackupError::upload(e.to_string())),
        }
    }
}

/// Uploader keeping objects in memory
///
/// Can be told to fail a number of attempts transiently or to stall, which
/// makes it useful for exercising the retry and deadline paths.
#[derive(Debug, Default)]
pub struct MemoryUploader {
    objects: std::sync::Mutex<std::collections::BTreeMap<String, Vec<u8>>>,
    transient_failures: std::sync::atomic::AtomicUsize,
    stall: Option<Duration>,
    attempts: std::sync::atomic::AtomicUsize,
}

impl MemoryUploader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` attempts with a transient error
    pub fn failing_times(self, count: usize) -> Self {
        self.transient_failures
            .store(count, std::sync::atomic::Ordering::SeqCst);
        self
    }

    /// Sleep for `delay` before every attempt
    pub fn stalling(mut self, delay: Duration) -> Self {
        self.stall = Some(delay);
        self
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().ok()?.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl CloudUploader for MemoryUploader {
    async fn upload(&self, local_path: &Path, key: &str) -> RetryResult<()> {
        use std::sync::atomic::Ordering;

        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.stall {
            tokio::time::sleep(delay).await;
        }

        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(RetryError::Transient {
                operation: "memory_upload",
                source: "simulated outage".into(),
            });
        }

        let data = tokio::fs::read(local_path)
            .await
            .map_err(|e| RetryError::Permanent {
                operation: "memory_upload",
                source: Box::new(e),
            })?;
        self.objects
            .lock()
            .map_err(|_| RetryError::Permanent {
                operation: "memory_upload",
                source: "object map poisoned".into(),
            })?
            .insert(key.to_string(), data);
        Ok(())
    }

    fn backend_name(&self) -> &str {
        "memory"
    }
}

#[cfg(feature = "s3")]
pub use s3::S3Uploader;

#[cfg(feature = "s3")]
mod s3 {
    use super::*;
    use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
    use aws_sdk_s3::primitives::ByteStream;
    use aws_sdk_s3::Client as S3Client;
    use tracing::error;

    /// Amazon S3 uploader
    ///
    /// Credentials come from the standard AWS provider chain (environment,
    /// shared credentials file, instance or task roles).
    #[derive(Debug, Clone)]
    pub struct S3Uploader {
        client: S3Client,
        bucket: String,
    }

    impl S3Uploader {
        /// Build an uploader for `bucket` from the ambient AWS configuration
        pub async fn from_env<S: Into<String>>(bucket: S) -> Result<Self> {
            let sdk_config =
                aws_config::defaults(aws_config::BehaviorVersion::latest()).load().await;
            if sdk_config.credentials_provider().is_none() {
                return Err(BackupError::upload(
                    "AWS credentials not found. Set AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY and AWS_REGION",
                ));
            }
            let bucket = bucket.into();
            info!(bucket = %bucket, "Initialized S3 uploader");
            Ok(Self {
                client: S3Client::new(&sdk_config),
                bucket,
            })
        }

        pub fn with_client<S: Into<String>>(client: S3Client, bucket: S) -> Self {
            Self {
                client,
                bucket: bucket.into(),
            }
        }

        pub fn bucket(&self) -> &str {
            &self.bucket
        }
    }

    fn map_s3_error<E>(op: &'static str, error: SdkError<E>, key: &str) -> RetryError
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    {
        let transient = |msg: String| RetryError::Transient {
            operation: op,
            source: Box::new(std::io::Error::other(msg)),
        };
        let permanent = |msg: String| RetryError::Permanent {
            operation: op,
            source: Box::new(std::io::Error::other(msg)),
        };

        match &error {
            SdkError::DispatchFailure(e) => {
                transient(format!("S3 {op} request failed to dispatch: {e:?}"))
            }
            SdkError::TimeoutError(_) => transient(format!("S3 {op} request timed out (key: {key})")),
            SdkError::ResponseError(e) => transient(format!("S3 {op} response error: {e:?}")),
            SdkError::ServiceError(service_err) => {
                let code = service_err.err().code().unwrap_or("Unknown");
                let message = service_err.err().message().unwrap_or("Unknown error");
                match code {
                    "InternalError" | "SlowDown" | "ServiceUnavailable" | "RequestTimeout" => {
                        transient(format!("S3 service error ({code}): {message}"))
                    }
                    "NoSuchBucket" => permanent("S3 bucket not found".to_string()),
                    "AccessDenied" | "Forbidden" => permanent(
                        "Access denied to S3 (check credentials and permissions)".to_string(),
                    ),
                    _ => permanent(format!("S3 service error ({code}): {message}")),
                }
            }
            _ => permanent(format!("S3 {op} failed: {error:?}")),
        }
    }

    #[async_trait]
    impl CloudUploader for S3Uploader {
        async fn upload(&self, local_path: &Path, key: &str) -> RetryResult<()> {
            let body = ByteStream::from_path(local_path)
                .await
                .map_err(|e| RetryError::Permanent {
                    operation: "put_object",
                    source: Box::new(e),
                })?;

            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(body)
                .send()
                .await
                .map_err(|e| {
                    let mapped = map_s3_error("put_object", e, key);
                    error!(bucket = %self.bucket, key = %key, error = %mapped, "S3 upload attempt failed");
                    mapped
                })?;
            Ok(())
        }

        fn backend_name(&self) -> &str {
            "s3"
        }
    }
}
