// pgdrive-backup/src/backup/s3_upload.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;
use s3::types::{CompletedMultipartUpload, CompletedPart};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{StorageConfig, UploadSettings};
use crate::errors::{BackupError, Result};

/// S3 refuses part numbers above this.
const S3_MAX_PARTS: u32 = 10_000;

/// Server side of a resumable upload: one call per chunk, then a completion
/// call that yields the final remote object identifier.
#[async_trait]
pub trait ResumableUpload: Send {
    async fn send_chunk(&mut self, part_number: u32, data: &[u8]) -> std::result::Result<(), String>;
    async fn complete(&mut self) -> std::result::Result<String, String>;
    async fn abort(&mut self);
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn create_resumable_upload(
        &self,
        container: &str,
        object_name: &str,
    ) -> std::result::Result<Box<dyn ResumableUpload>, String>;

    /// Destination container used for every artifact in this run.
    fn container(&self) -> &str;

    fn object_name_for(&self, file_name: &str) -> String {
        file_name.to_string()
    }

    /// Most chunks a single upload may consist of.
    fn max_parts(&self) -> u32 {
        u32::MAX
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct UploadSession {
    pub container: String,
    pub object_name: String,
    pub artifact: PathBuf,
    pub progress: f64,
    pub state: UploadState,
    pub remote_object: Option<String>,
}

impl UploadSession {
    fn new(container: &str, object_name: &str, artifact: &Path) -> Self {
        UploadSession {
            container: container.to_string(),
            object_name: object_name.to_string(),
            artifact: artifact.to_path_buf(),
            progress: 0.0,
            state: UploadState::Pending,
            remote_object: None,
        }
    }

    /// Integer percent for the operator log. Stays below 100 until the
    /// service has acknowledged completion.
    pub fn percent(&self) -> u8 {
        let rounded = (self.progress * 100.0).round().clamp(0.0, 100.0) as u8;
        if self.state == UploadState::Succeeded {
            rounded
        } else {
            rounded.min(99)
        }
    }
}

/// Streams `artifact` to the store chunk by chunk. `on_progress` sees the
/// integer percent after every accepted chunk and once more after completion.
pub async fn upload_artifact<F>(
    store: &dyn RemoteStore,
    target: &str,
    artifact: &Path,
    settings: &UploadSettings,
    mut on_progress: F,
) -> (UploadSession, Result<String>)
where
    F: FnMut(u8) + Send,
{
    let file_name = artifact
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let object_name = store.object_name_for(&file_name);
    let mut session = UploadSession::new(store.container(), &object_name, artifact);

    let result = drive_upload(store, target, &mut session, settings, &mut on_progress).await;
    match &result {
        Ok(remote) => {
            session.state = UploadState::Succeeded;
            session.progress = 1.0;
            session.remote_object = Some(remote.clone());
            on_progress(100);
            info!(database = %target, remote = %remote, "Upload complete.");
        }
        Err(_) => session.state = UploadState::Failed,
    }
    (session, result)
}

async fn drive_upload<F>(
    store: &dyn RemoteStore,
    target: &str,
    session: &mut UploadSession,
    settings: &UploadSettings,
    on_progress: &mut F,
) -> Result<String>
where
    F: FnMut(u8) + Send,
{
    let mut file = File::open(&session.artifact)
        .await
        .map_err(|e| BackupError::upload(target, format!("Failed to open {}: {}", session.artifact.display(), e)))?;
    let total_bytes = file
        .metadata()
        .await
        .map_err(|e| BackupError::upload(target, format!("Failed to stat {}: {}", session.artifact.display(), e)))?
        .len();

    let mut upload = store
        .create_resumable_upload(&session.container, &session.object_name)
        .await
        .map_err(|e| BackupError::upload(target, format!("Failed to start resumable upload: {}", e)))?;
    session.state = UploadState::InProgress;

    let chunk_size = effective_chunk_size(settings.chunk_size, total_bytes, store.max_parts());
    if chunk_size != settings.chunk_size {
        info!(
            database = %target,
            configured = settings.chunk_size,
            chunk_size,
            "Raised chunk size to stay within {} parts",
            store.max_parts()
        );
    }

    match send_all_chunks(upload.as_mut(), target, &mut file, total_bytes, chunk_size, session, settings, on_progress)
        .await
    {
        Ok(()) => {}
        Err(e) => {
            upload.abort().await;
            return Err(e);
        }
    }

    match timeout(settings.chunk_timeout, upload.complete()).await {
        Ok(Ok(remote)) => Ok(remote),
        Ok(Err(e)) => {
            upload.abort().await;
            Err(BackupError::upload(target, format!("Completion was rejected: {}", e)))
        }
        Err(_) => {
            upload.abort().await;
            Err(BackupError::upload(
                target,
                format!("Completion timed out after {}s", settings.chunk_timeout.as_secs()),
            ))
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn send_all_chunks<F>(
    upload: &mut dyn ResumableUpload,
    target: &str,
    file: &mut File,
    total_bytes: u64,
    chunk_size: usize,
    session: &mut UploadSession,
    settings: &UploadSettings,
    on_progress: &mut F,
) -> Result<()>
where
    F: FnMut(u8) + Send,
{
    let mut buffer = vec![0u8; chunk_size];
    let mut sent_bytes: u64 = 0;
    let mut part_number: u32 = 1;

    loop {
        let filled = read_chunk(file, &mut buffer)
            .await
            .map_err(|e| BackupError::upload(target, format!("Failed to read {}: {}", session.artifact.display(), e)))?;

        // An empty file still needs one (empty) part.
        if filled == 0 && part_number > 1 {
            break;
        }

        send_chunk_with_retries(upload, target, part_number, &buffer[..filled], settings).await?;

        sent_bytes += filled as u64;
        session.progress = if total_bytes == 0 { 1.0 } else { sent_bytes as f64 / total_bytes as f64 };
        part_number += 1;
        on_progress(session.percent());

        if sent_bytes >= total_bytes {
            break;
        }
    }
    Ok(())
}

/// Grows the configured chunk size when the file would otherwise need more
/// than `max_parts` chunks.
fn effective_chunk_size(configured: usize, total_bytes: u64, max_parts: u32) -> usize {
    let needed = total_bytes.div_ceil(u64::from(max_parts.max(1)));
    let configured = configured.max(1);
    match usize::try_from(needed) {
        Ok(needed) => configured.max(needed),
        Err(_) => usize::MAX,
    }
}

async fn send_chunk_with_retries(
    upload: &mut dyn ResumableUpload,
    target: &str,
    part_number: u32,
    data: &[u8],
    settings: &UploadSettings,
) -> Result<()> {
    let attempts = settings.max_chunk_retries + 1;
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match timeout(settings.chunk_timeout, upload.send_chunk(part_number, data)).await {
            Ok(Ok(())) => {
                debug!(database = %target, part_number, bytes = data.len(), "Chunk accepted");
                return Ok(());
            }
            Ok(Err(e)) => last_error = e,
            Err(_) => {
                last_error = format!("timed out after {}s", settings.chunk_timeout.as_secs())
            }
        }
        if attempt < attempts {
            warn!(
                database = %target,
                part_number,
                attempt,
                "Chunk submission failed, retrying: {}",
                last_error
            );
        }
    }

    Err(BackupError::upload(
        target,
        format!("Chunk {} failed after {} attempts: {}", part_number, attempts, last_error),
    ))
}

/// Fills `buffer` as far as the file allows; returns the byte count.
async fn read_chunk(file: &mut File, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let n = file.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// S3-compatible object storage, uploaded through the multipart API.
pub struct S3Store {
    client: s3::Client,
    bucket_name: String,
    folder_prefix: Option<String>,
}

impl S3Store {
    pub async fn from_config(storage: &StorageConfig) -> Self {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(storage.region.clone()));
        if let Some(endpoint) = &storage.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        if let (Some(key_id), Some(secret)) = (&storage.access_key_id, &storage.secret_access_key) {
            loader = loader.credentials_provider(s3::config::Credentials::new(
                key_id,
                secret,
                None, // session_token
                None, // expiry
                "Static", // provider_name
            ));
        }
        let sdk_config = loader.load().await;

        S3Store {
            client: s3::Client::new(&sdk_config),
            bucket_name: storage.bucket_name.clone(),
            folder_prefix: storage.folder_prefix.clone(),
        }
    }
}

#[async_trait]
impl RemoteStore for S3Store {
    async fn create_resumable_upload(
        &self,
        container: &str,
        object_name: &str,
    ) -> std::result::Result<Box<dyn ResumableUpload>, String> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(container)
            .key(object_name)
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(|e| DisplayErrorContext(&e).to_string())?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| "CreateMultipartUpload returned no upload id".to_string())?
            .to_string();

        debug!(bucket = %container, key = %object_name, upload_id = %upload_id, "Started multipart upload");
        Ok(Box::new(S3MultipartUpload {
            client: self.client.clone(),
            bucket: container.to_string(),
            key: object_name.to_string(),
            upload_id,
            parts: Vec::new(),
        }))
    }

    fn container(&self) -> &str {
        &self.bucket_name
    }

    fn object_name_for(&self, file_name: &str) -> String {
        match &self.folder_prefix {
            Some(prefix) => format!("{}/{}", prefix, file_name),
            None => file_name.to_string(),
        }
    }

    fn max_parts(&self) -> u32 {
        S3_MAX_PARTS
    }
}

struct S3MultipartUpload {
    client: s3::Client,
    bucket: String,
    key: String,
    upload_id: String,
    parts: Vec<CompletedPart>,
}

#[async_trait]
impl ResumableUpload for S3MultipartUpload {
    async fn send_chunk(&mut self, part_number: u32, data: &[u8]) -> std::result::Result<(), String> {
        let part_number = i32::try_from(part_number)
            .map_err(|_| format!("part number {} out of range", part_number))?;
        let uploaded = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .part_number(part_number)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|e| DisplayErrorContext(&e).to_string())?;

        // A retried part replaces the earlier attempt.
        self.parts.retain(|p| p.part_number() != Some(part_number));
        self.parts.push(
            CompletedPart::builder()
                .set_e_tag(uploaded.e_tag().map(str::to_string))
                .part_number(part_number)
                .build(),
        );
        Ok(())
    }

    async fn complete(&mut self) -> std::result::Result<String, String> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(self.parts.clone()))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| DisplayErrorContext(&e).to_string())?;
        Ok(format!("s3://{}/{}", self.bucket, self.key))
    }

    async fn abort(&mut self) {
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .send()
            .await
        {
            warn!(
                "Failed to abort multipart upload {} for s3://{}/{}: {}",
                self.upload_id,
                self.bucket,
                self.key,
                DisplayErrorContext(&e)
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// What the fake store should do for each successive chunk call.
    #[derive(Debug, Clone)]
    pub enum ChunkBehavior {
        Accept,
        Fail(&'static str),
        Hang,
    }

    #[derive(Debug, Default)]
    pub struct FakeStoreLog {
        pub chunks: Vec<(u32, usize)>,
        pub completed: Vec<String>,
        pub aborted: Vec<String>,
    }

    #[derive(Default)]
    pub struct FakeStore {
        pub log: Arc<Mutex<FakeStoreLog>>,
        /// Per-object chunk script; anything not scripted is accepted.
        pub scripts: Mutex<Vec<(String, VecDeque<ChunkBehavior>)>>,
        pub reject_completion: bool,
        /// Chunks beyond this part number are refused.
        pub part_limit: Option<u32>,
    }

    impl FakeStore {
        pub fn script(&self, object_prefix: &str, behaviors: Vec<ChunkBehavior>) {
            self.scripts
                .lock()
                .unwrap()
                .push((object_prefix.to_string(), behaviors.into_iter().collect()));
        }
    }

    struct FakeUpload {
        object: String,
        script: VecDeque<ChunkBehavior>,
        log: Arc<Mutex<FakeStoreLog>>,
        reject_completion: bool,
        part_limit: Option<u32>,
    }

    #[async_trait]
    impl ResumableUpload for FakeUpload {
        async fn send_chunk(&mut self, part_number: u32, data: &[u8]) -> std::result::Result<(), String> {
            if self.part_limit.is_some_and(|limit| part_number > limit) {
                return Err(format!("part number {} exceeds the limit", part_number));
            }
            match self.script.pop_front().unwrap_or(ChunkBehavior::Accept) {
                ChunkBehavior::Accept => {
                    self.log.lock().unwrap().chunks.push((part_number, data.len()));
                    Ok(())
                }
                ChunkBehavior::Fail(reason) => Err(reason.to_string()),
                ChunkBehavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
            }
        }

        async fn complete(&mut self) -> std::result::Result<String, String> {
            if self.reject_completion {
                return Err("completion rejected".to_string());
            }
            self.log.lock().unwrap().completed.push(self.object.clone());
            Ok(format!("fake://{}", self.object))
        }

        async fn abort(&mut self) {
            self.log.lock().unwrap().aborted.push(self.object.clone());
        }
    }

    #[async_trait]
    impl RemoteStore for FakeStore {
        async fn create_resumable_upload(
            &self,
            container: &str,
            object_name: &str,
        ) -> std::result::Result<Box<dyn ResumableUpload>, String> {
            assert_eq!(container, "test-bucket");
            let mut scripts = self.scripts.lock().unwrap();
            let script = scripts
                .iter()
                .position(|(prefix, _)| object_name.starts_with(prefix.as_str()))
                .map(|i| scripts.remove(i).1)
                .unwrap_or_default();
            Ok(Box::new(FakeUpload {
                object: object_name.to_string(),
                script,
                log: self.log.clone(),
                reject_completion: self.reject_completion,
                part_limit: self.part_limit,
            }))
        }

        fn container(&self) -> &str {
            "test-bucket"
        }

        fn max_parts(&self) -> u32 {
            self.part_limit.unwrap_or(u32::MAX)
        }
    }

    fn settings(chunk_size: usize) -> UploadSettings {
        UploadSettings {
            chunk_size,
            max_chunk_retries: 2,
            chunk_timeout: Duration::from_millis(200),
            upload_timeout: None,
        }
    }

    fn write_artifact(dir: &Path, name: &str, len: usize) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, vec![7u8; len]).unwrap();
        path
    }

    #[tokio::test]
    async fn test_chunked_upload_reports_monotonic_progress_to_100() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let artifact = write_artifact(dir.path(), "orders_20240101_000000_backup.dump", 1000);
        let store = FakeStore::default();
        let mut seen = Vec::new();

        let (session, result) =
            upload_artifact(&store, "orders", &artifact, &settings(300), |p| seen.push(p)).await;

        assert_eq!(result?, "fake://orders_20240101_000000_backup.dump");
        assert_eq!(session.state, UploadState::Succeeded);
        assert_eq!(seen, vec![30, 60, 90, 99, 100]);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));

        let log = store.log.lock().unwrap();
        assert_eq!(log.chunks, vec![(1, 300), (2, 300), (3, 300), (4, 100)]);
        assert!(log.aborted.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_file_sends_single_empty_chunk() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let artifact = write_artifact(dir.path(), "empty_backup.dump", 0);
        let store = FakeStore::default();
        let mut seen = Vec::new();

        let (session, result) =
            upload_artifact(&store, "empty", &artifact, &settings(300), |p| seen.push(p)).await;

        assert!(result.is_ok());
        assert_eq!(session.percent(), 100);
        assert_eq!(seen, vec![99, 100]);
        assert_eq!(store.log.lock().unwrap().chunks, vec![(1, 0)]);
        Ok(())
    }

    #[tokio::test]
    async fn test_transient_chunk_failure_is_retried() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let artifact = write_artifact(dir.path(), "orders_backup.dump", 500);
        let store = FakeStore::default();
        store.script(
            "orders",
            vec![ChunkBehavior::Accept, ChunkBehavior::Fail("503 slow down"), ChunkBehavior::Hang],
        );

        let (session, result) =
            upload_artifact(&store, "orders", &artifact, &settings(300), |_| {}).await;

        assert!(result.is_ok());
        assert_eq!(session.state, UploadState::Succeeded);
        assert_eq!(store.log.lock().unwrap().chunks, vec![(1, 300), (2, 200)]);
        Ok(())
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_without_reaching_100() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let artifact = write_artifact(dir.path(), "orders_backup.dump", 900);
        let store = FakeStore::default();
        store.script(
            "orders",
            vec![
                ChunkBehavior::Accept,
                ChunkBehavior::Fail("reset by peer"),
                ChunkBehavior::Fail("reset by peer"),
                ChunkBehavior::Fail("reset by peer"),
            ],
        );
        let mut seen = Vec::new();

        let (session, result) =
            upload_artifact(&store, "orders", &artifact, &settings(300), |p| seen.push(p)).await;

        let err = result.unwrap_err();
        assert!(matches!(err, BackupError::Upload { .. }));
        assert!(err.to_string().contains("Chunk 2 failed after 3 attempts"));
        assert_eq!(session.state, UploadState::Failed);
        assert!(session.percent() < 100);
        assert_eq!(seen, vec![33]);
        assert_eq!(store.log.lock().unwrap().aborted, vec!["orders_backup.dump".to_string()]);
        assert!(artifact.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_hanging_chunk_times_out() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let artifact = write_artifact(dir.path(), "orders_backup.dump", 100);
        let store = FakeStore::default();
        store.script("orders", vec![ChunkBehavior::Hang, ChunkBehavior::Hang, ChunkBehavior::Hang]);

        let (session, result) =
            upload_artifact(&store, "orders", &artifact, &settings(300), |_| {}).await;

        assert!(result.unwrap_err().to_string().contains("timed out"));
        assert_eq!(session.state, UploadState::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn test_rejected_completion_is_upload_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let artifact = write_artifact(dir.path(), "orders_backup.dump", 100);
        let store = FakeStore { reject_completion: true, ..Default::default() };
        let mut seen = Vec::new();

        let (session, result) =
            upload_artifact(&store, "orders", &artifact, &settings(300), |p| seen.push(p)).await;

        assert!(matches!(result, Err(BackupError::Upload { .. })));
        assert_eq!(session.state, UploadState::Failed);
        assert_eq!(seen, vec![99]);
        assert_eq!(store.log.lock().unwrap().aborted, vec!["orders_backup.dump".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_chunk_size_grows_to_respect_part_limit() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let artifact = write_artifact(dir.path(), "orders_backup.dump", 1000);
        let store = FakeStore { part_limit: Some(4), ..Default::default() };

        let (session, result) =
            upload_artifact(&store, "orders", &artifact, &settings(100), |_| {}).await;

        assert!(result.is_ok());
        assert_eq!(session.state, UploadState::Succeeded);
        assert_eq!(
            store.log.lock().unwrap().chunks,
            vec![(1, 250), (2, 250), (3, 250), (4, 250)]
        );
        Ok(())
    }

    #[test]
    fn test_effective_chunk_size() {
        assert_eq!(effective_chunk_size(300, 1000, 10_000), 300);
        assert_eq!(effective_chunk_size(100, 1001, 4), 251);
        assert_eq!(effective_chunk_size(8 << 20, 100 << 30, S3_MAX_PARTS), 10_737_419);
        assert_eq!(effective_chunk_size(0, 0, 1), 1);
    }

    #[tokio::test]
    async fn test_missing_artifact_is_upload_error() {
        let store = FakeStore::default();
        let (session, result) = upload_artifact(
            &store,
            "orders",
            Path::new("/nonexistent/orders_backup.dump"),
            &settings(300),
            |_| {},
        )
        .await;

        assert!(matches!(result, Err(BackupError::Upload { .. })));
        assert_eq!(session.state, UploadState::Failed);
        assert!(store.log.lock().unwrap().chunks.is_empty());
    }

    #[test]
    fn test_percent_is_capped_until_success() {
        let mut session = UploadSession::new("b", "o", Path::new("/tmp/o"));
        session.state = UploadState::InProgress;
        session.progress = 0.996;
        assert_eq!(session.percent(), 99);
        session.state = UploadState::Succeeded;
        assert_eq!(session.percent(), 100);
    }
}
