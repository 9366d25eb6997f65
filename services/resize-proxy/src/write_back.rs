use crate::config::{S3Config, WriteBackConfig};
use anyhow::{bail, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while persisting a variant
#[derive(Debug, Error)]
pub enum WriteBackError {
    #[error("No object key left after stripping prefix from {0}")]
    EmptyKey(String),

    #[error("Failed to upload {key}: {source}")]
    Upload {
        key: String,
        #[source]
        source: BoxError,
    },

    #[error("No upload ID returned for {0}")]
    MissingUploadId(String),
}

impl WriteBackError {
    fn upload(key: &str, source: impl Into<BoxError>) -> Self {
        Self::Upload {
            key: key.to_string(),
            source: source.into(),
        }
    }
}

/// Durable storage for generated variants.
///
/// `key` is the logical request path; mapping it to a storage identifier is the
/// implementation's job.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<(), WriteBackError>;
}

/// S3 backend for variant write-back
pub struct S3Store {
    client: S3Client,
    bucket: String,
    key_prefix: String,
    config: S3Config,
}

impl S3Store {
    /// Create a new S3 store. `origin_base` locates the bucket in request paths.
    pub async fn new(config: &S3Config, origin_base: &Url) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        match (&config.access_key_id, &config.secret_access_key) {
            (Some(access_key), Some(secret_key)) => {
                loader = loader.credentials_provider(Credentials::new(
                    access_key,
                    secret_key,
                    None,
                    None,
                    "resize-proxy-static",
                ));
            }
            (None, None) => {}
            _ => bail!("s3.access_key_id and s3.secret_access_key must be set together"),
        }

        let aws_config = loader.load().await;
        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());
        let key_prefix = config.effective_key_prefix(origin_base);

        info!(
            bucket = %config.bucket,
            region = %config.region,
            key_prefix = %key_prefix,
            "S3 store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            key_prefix,
            config: config.clone(),
        })
    }

    /// Simple single-part upload for small files
    async fn simple_upload(
        &self,
        s3_key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), WriteBackError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(s3_key)
            .body(ByteStream::from(data))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| WriteBackError::upload(s3_key, e))?;

        Ok(())
    }

    /// Multipart upload for large files
    async fn multipart_upload(
        &self,
        s3_key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), WriteBackError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(s3_key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| WriteBackError::upload(s3_key, e))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| WriteBackError::MissingUploadId(s3_key.to_string()))?;

        match self.upload_parts(s3_key, upload_id, data).await {
            Ok(parts) => {
                let completed_upload = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();

                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(s3_key)
                    .upload_id(upload_id)
                    .multipart_upload(completed_upload)
                    .send()
                    .await
                    .map_err(|e| WriteBackError::upload(s3_key, e))?;

                Ok(())
            }
            Err(e) => {
                // Leave no orphaned parts behind
                if let Err(abort_error) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(s3_key)
                    .upload_id(upload_id)
                    .send()
                    .await
                {
                    warn!(s3_key = %s3_key, error = %abort_error, "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        s3_key: &str,
        upload_id: &str,
        data: Bytes,
    ) -> Result<Vec<CompletedPart>, WriteBackError> {
        let part_size = self.config.part_size_bytes;
        let mut completed_parts = Vec::new();
        let mut part_number = 1;
        let mut offset = 0;

        while offset < data.len() {
            let end = (offset + part_size).min(data.len());

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(s3_key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(data.slice(offset..end)))
                .send()
                .await
                .map_err(|e| WriteBackError::upload(s3_key, e))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );

            part_number += 1;
            offset = end;
        }

        Ok(completed_parts)
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip(self, data), fields(size_bytes = data.len()))]
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<(), WriteBackError> {
        let s3_key = object_key(&self.key_prefix, key)?;

        debug!(bucket = %self.bucket, s3_key = %s3_key, "Uploading variant to S3");

        if data.len() > self.config.multipart_threshold_bytes {
            self.multipart_upload(&s3_key, data, content_type).await
        } else {
            self.simple_upload(&s3_key, data, content_type).await
        }
    }
}

/// Map a request path to an object key.
///
/// `/images/cat.jpg_200` with prefix `/images/` becomes `cat.jpg_200`.
pub fn object_key(prefix: &str, path: &str) -> Result<String, WriteBackError> {
    let key = path
        .strip_prefix(prefix)
        .unwrap_or(path)
        .trim_start_matches('/');

    if key.is_empty() {
        return Err(WriteBackError::EmptyKey(path.to_string()));
    }

    Ok(key.to_string())
}

/// One variant waiting to be persisted
#[derive(Debug, Clone)]
pub struct WriteBackJob {
    pub key: String,
    pub data: Bytes,
    pub content_type: String,
}

/// Cheap handle for scheduling write-backs from request handlers
#[derive(Clone)]
pub struct WriteBackHandle {
    sender: mpsc::Sender<WriteBackJob>,
}

impl WriteBackHandle {
    /// Queue a job without waiting. Returns `false` when the job was dropped.
    pub fn schedule(&self, job: WriteBackJob) -> bool {
        match self.sender.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                warn!(key = %job.key, "Write-back queue full, dropping variant");
                metrics::counter!("resize_proxy.write_back.dropped").increment(1);
                false
            }
            Err(TrySendError::Closed(job)) => {
                warn!(key = %job.key, "Write-back queue closed, dropping variant");
                metrics::counter!("resize_proxy.write_back.dropped").increment(1);
                false
            }
        }
    }
}

/// Bounded pool persisting variants off the request path
pub struct WriteBackQueue {
    handle: WriteBackHandle,
    dispatcher: JoinHandle<()>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl WriteBackQueue {
    /// Spawn the dispatcher. Must be called inside a tokio runtime.
    pub fn start(store: Arc<dyn ObjectStore>, config: &WriteBackConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();

        let dispatcher = Dispatcher {
            receiver,
            store,
            permits: Arc::new(Semaphore::new(config.concurrency)),
            tracker: tracker.clone(),
        };
        let dispatcher = tokio::spawn(dispatcher.run(shutdown.clone()));

        info!(
            concurrency = config.concurrency,
            queue_capacity = config.queue_capacity,
            "Write-back queue started"
        );

        Self {
            handle: WriteBackHandle { sender },
            dispatcher,
            tracker,
            shutdown,
        }
    }

    pub fn handle(&self) -> WriteBackHandle {
        self.handle.clone()
    }

    /// Stop accepting jobs and wait for queued and in-flight ones.
    ///
    /// Returns `false` if `timeout` elapsed first; unfinished uploads are then
    /// abandoned with the runtime.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        self.shutdown.cancel();

        let dispatcher = self.dispatcher;
        let tracker = self.tracker.clone();
        let drain = async move {
            if let Err(e) = dispatcher.await {
                error!(error = %e, "Write-back dispatcher failed");
            }
            tracker.close();
            tracker.wait().await;
        };

        match tokio::time::timeout(timeout, drain).await {
            Ok(()) => {
                info!("Write-back queue drained");
                true
            }
            Err(_) => {
                warn!(
                    pending = self.tracker.len(),
                    timeout_secs = timeout.as_secs_f64(),
                    "Write-back drain timed out"
                );
                false
            }
        }
    }
}

struct Dispatcher {
    receiver: mpsc::Receiver<WriteBackJob>,
    store: Arc<dyn ObjectStore>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl Dispatcher {
    async fn run(self, shutdown: CancellationToken) {
        let Dispatcher {
            mut receiver,
            store,
            permits,
            tracker,
        } = self;

        loop {
            tokio::select! {
                job = receiver.recv() => match job {
                    Some(job) => launch(&permits, &tracker, &store, job).await,
                    None => break,
                },
                _ = shutdown.cancelled() => {
                    // Refuse new jobs but still run the ones already queued
                    receiver.close();
                    while let Some(job) = receiver.recv().await {
                        launch(&permits, &tracker, &store, job).await;
                    }
                    break;
                }
            }
        }
    }
}

/// Wait for a free slot, then run the upload as a tracked task
async fn launch(
    permits: &Arc<Semaphore>,
    tracker: &TaskTracker,
    store: &Arc<dyn ObjectStore>,
    job: WriteBackJob,
) {
    let permit = match permits.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(e) => {
            error!(error = %e, key = %job.key, "Write-back semaphore closed");
            return;
        }
    };

    let store = store.clone();
    tracker.spawn(async move {
        let _permit = permit;
        persist(store.as_ref(), job).await;
    });
}

async fn persist(store: &dyn ObjectStore, job: WriteBackJob) {
    let size_bytes = job.data.len();

    match store.put(&job.key, job.data, &job.content_type).await {
        Ok(()) => {
            info!(key = %job.key, size_bytes, "Variant written back");
            metrics::counter!("resize_proxy.write_back.completed").increment(1);
        }
        Err(e) => {
            error!(key = %job.key, error = %e, "Variant write-back failed");
            metrics::counter!("resize_proxy.write_back.failed").increment(1);
        }
    }
}

/// In-memory store for tests
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct MemoryStore {
        objects: Mutex<Vec<WriteBackJob>>,
    }

    impl MemoryStore {
        pub(crate) fn stored(&self) -> Vec<WriteBackJob> {
            self.objects.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn put(
            &self,
            key: &str,
            data: Bytes,
            content_type: &str,
        ) -> Result<(), WriteBackError> {
            self.objects.lock().unwrap().push(WriteBackJob {
                key: key.to_string(),
                data,
                content_type: content_type.to_string(),
            });
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryStore;
    use super::*;

    fn job(key: &str) -> WriteBackJob {
        WriteBackJob {
            key: key.to_string(),
            data: Bytes::from_static(b"variant"),
            content_type: "image/png".to_string(),
        }
    }

    fn pool(concurrency: usize, queue_capacity: usize) -> WriteBackConfig {
        WriteBackConfig {
            enabled: true,
            concurrency,
            queue_capacity,
        }
    }

    #[test]
    fn test_object_key_strips_prefix() {
        assert_eq!(object_key("/images/", "/images/cat.jpg_200").unwrap(), "cat.jpg_200");
        assert_eq!(
            object_key("/images/", "/images/2024/cat.jpg_64").unwrap(),
            "2024/cat.jpg_64"
        );
    }

    #[test]
    fn test_object_key_without_prefix_trims_slash() {
        assert_eq!(object_key("/images/", "/thumbs/cat.jpg_200").unwrap(), "thumbs/cat.jpg_200");
    }

    #[test]
    fn test_object_key_rejects_empty() {
        assert!(matches!(
            object_key("/images/", "/images/"),
            Err(WriteBackError::EmptyKey(_))
        ));
    }

    #[tokio::test]
    async fn test_queue_drains_on_shutdown() {
        let store = Arc::new(MemoryStore::default());
        let queue = WriteBackQueue::start(store.clone(), &pool(2, 16));
        let handle = queue.handle();

        for key in ["/images/a.png_10", "/images/b.png_20", "/images/c.png_30"] {
            assert!(handle.schedule(job(key)));
        }

        assert!(queue.shutdown(Duration::from_secs(5)).await);

        let mut keys: Vec<_> = store.stored().into_iter().map(|j| j.key).collect();
        keys.sort();
        assert_eq!(keys, ["/images/a.png_10", "/images/b.png_20", "/images/c.png_30"]);
    }

    #[tokio::test]
    async fn test_schedule_after_shutdown_is_dropped() {
        let store = Arc::new(MemoryStore::default());
        let queue = WriteBackQueue::start(store.clone(), &pool(1, 4));
        let handle = queue.handle();

        assert!(queue.shutdown(Duration::from_secs(5)).await);
        assert!(!handle.schedule(job("/images/late.png_10")));
        assert!(store.stored().is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let store = Arc::new(MemoryStore::default());
        let queue = WriteBackQueue::start(store.clone(), &pool(1, 1));
        let handle = queue.handle();

        // Current-thread runtime: the dispatcher cannot run until we yield
        assert!(handle.schedule(job("/images/first.png_10")));
        assert!(!handle.schedule(job("/images/second.png_10")));

        assert!(queue.shutdown(Duration::from_secs(5)).await);
        assert_eq!(store.stored().len(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_is_absorbed() {
        let mut store = MockObjectStore::new();
        store
            .expect_put()
            .withf(|key, _, content_type| key == "/images/cat.jpg_200" && content_type == "image/jpeg")
            .times(1)
            .returning(|key, _, _| {
                Err(WriteBackError::upload(key, "bucket does not exist"))
            });

        let queue = WriteBackQueue::start(Arc::new(store), &pool(1, 4));
        assert!(queue.handle().schedule(WriteBackJob {
            key: "/images/cat.jpg_200".to_string(),
            data: Bytes::from_static(b"jpeg"),
            content_type: "image/jpeg".to_string(),
        }));

        assert!(queue.shutdown(Duration::from_secs(5)).await);
    }

    struct StalledStore;

    #[async_trait]
    impl ObjectStore for StalledStore {
        async fn put(&self, _: &str, _: Bytes, _: &str) -> Result<(), WriteBackError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_shutdown_times_out_on_stalled_store() {
        let queue = WriteBackQueue::start(Arc::new(StalledStore), &pool(1, 4));
        assert!(queue.handle().schedule(job("/images/slow.png_10")));

        assert!(!queue.shutdown(Duration::from_millis(50)).await);
    }
}
