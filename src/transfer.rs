//! Transfer engine
//!
//! Uploads, downloads and deletions across providers, with the refresh-once
//! policy on 401, per-provider download roots, explicit overwrite
//! confirmation and cancellation checked at every I/O boundary. Concurrent
//! jobs are allowed; identical concurrent requests are not
//! deduplicated; that is a caller responsibility.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::activity::{LogCategory, LogSink};
use crate::error::CloudError;
use crate::providers::types::{ProviderKind, RemoteFile};
use crate::providers::{CloudProvider, ProviderFactory};
use crate::token_refresher::{with_auth_retry, TokenSource};

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// Lifecycle of a transfer job
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Succeeded | TransferStatus::Failed)
    }
}

/// Ephemeral record of one transfer. Created on request, discarded once a
/// terminal status has been observed through [`TransferEngine::poll_job`];
/// never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct TransferJob {
    pub id: Uuid,
    pub direction: TransferDirection,
    pub local_path: Option<PathBuf>,
    pub remote_ref: String,
    pub status: TransferStatus,
    pub bytes_transferred: u64,
    pub error: Option<String>,
}

/// Upload/download/delete across providers
pub struct TransferEngine {
    providers: HashMap<ProviderKind, Arc<dyn CloudProvider>>,
    tokens: Arc<dyn TokenSource>,
    sink: Arc<dyn LogSink>,
    download_root: PathBuf,
    jobs: Mutex<HashMap<Uuid, TransferJob>>,
}

impl TransferEngine {
    pub fn new(tokens: Arc<dyn TokenSource>, sink: Arc<dyn LogSink>, download_root: PathBuf) -> Self {
        let providers = ProviderKind::all()
            .into_iter()
            .map(|kind| (kind, ProviderFactory::create(kind)))
            .collect();
        Self {
            providers,
            tokens,
            sink,
            download_root,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Replace a provider implementation (used by tests and custom setups)
    pub fn with_provider(mut self, provider: Arc<dyn CloudProvider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    fn provider(&self, kind: ProviderKind) -> Arc<dyn CloudProvider> {
        self.providers
            .get(&kind)
            .expect("factory registered every provider kind")
            .clone()
    }

    /// Deterministic destination directory for a provider's downloads
    pub fn download_dir(&self, kind: ProviderKind) -> PathBuf {
        self.download_root.join(kind.download_dir_name())
    }

    /// Upload a local file into a remote folder
    pub async fn upload(
        &self,
        kind: ProviderKind,
        local_path: &Path,
        dest_folder_id: &str,
        cancel: &CancellationToken,
    ) -> Result<RemoteFile, CloudError> {
        self.upload_inner(kind, local_path, dest_folder_id, cancel, None)
            .await
    }

    /// Download a remote file to `local_dir` (default: the provider's
    /// download root). Refuses to overwrite an existing file unless
    /// `overwrite` is set.
    pub async fn download(
        &self,
        kind: ProviderKind,
        remote_id: &str,
        local_dir: Option<&Path>,
        overwrite: bool,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, CloudError> {
        self.download_inner(kind, remote_id, local_dir, overwrite, cancel, None)
            .await
    }

    /// Delete a remote entry. Idempotent: an already-absent id is success,
    /// since the end state (absence) is achieved.
    pub async fn delete(&self, kind: ProviderKind, remote_id: &str) -> Result<(), CloudError> {
        let provider = self.provider(kind);
        let id = remote_id.to_string();

        let result = with_auth_retry(kind, &self.tokens, &self.sink, "delete", |token| {
            use secrecy::ExposeSecret;
            let provider = provider.clone();
            let id = id.clone();
            async move { provider.delete(token.expose_secret(), &id).await }
        })
        .await;

        match result {
            Ok(()) => {
                self.sink.record(
                    LogCategory::Transfer,
                    &kind.to_string(),
                    &format!("deleted {remote_id}"),
                );
                Ok(())
            }
            Err(CloudError::NotFound(_)) => {
                self.sink.record(
                    LogCategory::Transfer,
                    &kind.to_string(),
                    &format!("{remote_id} already absent, delete treated as success"),
                );
                Ok(())
            }
            Err(e) => {
                self.sink.record(
                    LogCategory::Transfer,
                    &kind.to_string(),
                    &format!("delete of {remote_id} failed: {e}"),
                );
                Err(e)
            }
        }
    }

    /// Fire-and-forget upload; progress is observed through [`poll_job`]
    pub fn start_upload(
        self: &Arc<Self>,
        kind: ProviderKind,
        local_path: PathBuf,
        dest_folder_id: String,
        cancel: CancellationToken,
    ) -> Uuid {
        let job_id = self.create_job(
            TransferDirection::Upload,
            Some(local_path.clone()),
            dest_folder_id.clone(),
        );
        let engine = self.clone();
        tokio::spawn(async move {
            engine.set_job_status(job_id, TransferStatus::Running);
            let result = engine
                .upload_inner(kind, &local_path, &dest_folder_id, &cancel, Some(job_id))
                .await;
            engine.finish_job(job_id, result.err().map(|e| e.to_string()));
        });
        job_id
    }

    /// Fire-and-forget download; progress is observed through [`poll_job`]
    pub fn start_download(
        self: &Arc<Self>,
        kind: ProviderKind,
        remote_id: String,
        overwrite: bool,
        cancel: CancellationToken,
    ) -> Uuid {
        let job_id = self.create_job(TransferDirection::Download, None, remote_id.clone());
        let engine = self.clone();
        tokio::spawn(async move {
            engine.set_job_status(job_id, TransferStatus::Running);
            let result = engine
                .download_inner(kind, &remote_id, None, overwrite, &cancel, Some(job_id))
                .await;
            engine.finish_job(job_id, result.err().map(|e| e.to_string()));
        });
        job_id
    }

    /// Snapshot a job. A job seen in a terminal state is removed: transfers
    /// are fire-and-forget by id, not persisted.
    pub fn poll_job(&self, id: Uuid) -> Option<TransferJob> {
        let mut jobs = self.jobs.lock().expect("job table lock poisoned");
        let job = jobs.get(&id)?.clone();
        if job.status.is_terminal() {
            jobs.remove(&id);
        }
        Some(job)
    }

    async fn upload_inner(
        &self,
        kind: ProviderKind,
        local_path: &Path,
        dest_folder_id: &str,
        cancel: &CancellationToken,
        job: Option<Uuid>,
    ) -> Result<RemoteFile, CloudError> {
        if cancel.is_cancelled() {
            return Err(CloudError::Cancelled);
        }
        let provider = self.provider(kind);
        let local = local_path.to_path_buf();
        let dest = dest_folder_id.to_string();

        let result = with_auth_retry(kind, &self.tokens, &self.sink, "upload", |token| {
            use secrecy::ExposeSecret;
            let provider = provider.clone();
            let local = local.clone();
            let dest = dest.clone();
            let cancel = cancel.clone();
            async move {
                provider
                    .upload(token.expose_secret(), &local, &dest, &cancel)
                    .await
            }
        })
        .await;

        match &result {
            Ok(file) => {
                if let Some(job_id) = job {
                    self.set_job_bytes(job_id, file.size);
                }
                self.sink.record(
                    LogCategory::Transfer,
                    &kind.to_string(),
                    &format!("uploaded {} to folder {dest_folder_id}", file.name),
                );
            }
            Err(e) => {
                self.sink.record(
                    LogCategory::Transfer,
                    &kind.to_string(),
                    &format!("upload of {local_path:?} failed: {e}"),
                );
            }
        }
        result
    }

    async fn download_inner(
        &self,
        kind: ProviderKind,
        remote_id: &str,
        local_dir: Option<&Path>,
        overwrite: bool,
        cancel: &CancellationToken,
        job: Option<Uuid>,
    ) -> Result<PathBuf, CloudError> {
        if cancel.is_cancelled() {
            return Err(CloudError::Cancelled);
        }
        let provider = self.provider(kind);
        let id = remote_id.to_string();

        let meta = with_auth_retry(kind, &self.tokens, &self.sink, "download", |token| {
            use secrecy::ExposeSecret;
            let provider = provider.clone();
            let id = id.clone();
            async move { provider.metadata(token.expose_secret(), &id).await }
        })
        .await?;

        // Folders are listable but never transferred as a unit
        if meta.is_folder {
            let e = CloudError::Unsupported(format!("{} is a folder", meta.name));
            self.sink.record(
                LogCategory::Transfer,
                &kind.to_string(),
                &format!("download of {remote_id} refused: {e}"),
            );
            return Err(e);
        }

        let dir = match local_dir {
            Some(dir) => dir.to_path_buf(),
            None => self.download_dir(kind),
        };
        tokio::fs::create_dir_all(&dir).await?;
        let dest = dir.join(&meta.name);

        // No silent overwrite: an existing file needs explicit confirmation
        if dest.exists() && !overwrite {
            return Err(CloudError::Conflict(format!(
                "{} already exists in {:?}; confirm overwrite to replace it",
                meta.name, dir
            )));
        }

        if let Some(job_id) = job {
            self.set_job_path(job_id, dest.clone());
        }

        let progress = |written: u64| {
            if let Some(job_id) = job {
                self.set_job_bytes(job_id, written);
            }
        };

        let written = with_auth_retry(kind, &self.tokens, &self.sink, "download", |token| {
            use secrecy::ExposeSecret;
            let provider = provider.clone();
            let id = id.clone();
            let dest = dest.clone();
            let cancel = cancel.clone();
            let progress = &progress;
            async move {
                provider
                    .download_to(token.expose_secret(), &id, &dest, &cancel, Some(progress))
                    .await
            }
        })
        .await;

        match written {
            Ok(bytes) => {
                self.sink.record(
                    LogCategory::Transfer,
                    &kind.to_string(),
                    &format!("downloaded {remote_id} to {dest:?} ({bytes} bytes)"),
                );
                Ok(dest)
            }
            Err(e) => {
                self.sink.record(
                    LogCategory::Transfer,
                    &kind.to_string(),
                    &format!("download of {remote_id} failed: {e}"),
                );
                Err(e)
            }
        }
    }

    fn create_job(
        &self,
        direction: TransferDirection,
        local_path: Option<PathBuf>,
        remote_ref: String,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let job = TransferJob {
            id,
            direction,
            local_path,
            remote_ref,
            status: TransferStatus::Queued,
            bytes_transferred: 0,
            error: None,
        };
        self.jobs
            .lock()
            .expect("job table lock poisoned")
            .insert(id, job);
        id
    }

    fn set_job_status(&self, id: Uuid, status: TransferStatus) {
        if let Some(job) = self.jobs.lock().expect("job table lock poisoned").get_mut(&id) {
            job.status = status;
        }
    }

    fn set_job_bytes(&self, id: Uuid, bytes: u64) {
        if let Some(job) = self.jobs.lock().expect("job table lock poisoned").get_mut(&id) {
            job.bytes_transferred = bytes;
        }
    }

    fn set_job_path(&self, id: Uuid, path: PathBuf) {
        if let Some(job) = self.jobs.lock().expect("job table lock poisoned").get_mut(&id) {
            job.local_path = Some(path);
        }
    }

    fn finish_job(&self, id: Uuid, error: Option<String>) {
        if let Some(job) = self.jobs.lock().expect("job table lock poisoned").get_mut(&id) {
            job.status = if error.is_none() {
                TransferStatus::Succeeded
            } else {
                TransferStatus::Failed
            };
            job.error = error;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::TracingSink;
    use crate::providers::types::{FilePage, ListOptions};
    use async_trait::async_trait;
    use secrecy::SecretString;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct CountingTokens {
        refreshes: AtomicU32,
    }

    impl CountingTokens {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                refreshes: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl TokenSource for CountingTokens {
        async fn ensure_fresh(&self, _kind: ProviderKind) -> Result<SecretString, CloudError> {
            Ok(SecretString::from("token-1".to_string()))
        }
        async fn refresh_now(&self, _kind: ProviderKind) -> Result<SecretString, CloudError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(SecretString::from("token-2".to_string()))
        }
    }

    /// In-memory provider: `file-1` is a small file, `folder-1` a folder,
    /// everything else is absent. Can reject the first N calls with 401.
    struct FakeProvider {
        reject_unauthorized: AtomicU32,
        upload_calls: AtomicU32,
    }

    impl FakeProvider {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                reject_unauthorized: AtomicU32::new(0),
                upload_calls: AtomicU32::new(0),
            })
        }

        fn rejecting_first(n: u32) -> Arc<Self> {
            Arc::new(Self {
                reject_unauthorized: AtomicU32::new(n),
                upload_calls: AtomicU32::new(0),
            })
        }

        fn gate(&self) -> Result<(), CloudError> {
            let remaining = self.reject_unauthorized.load(Ordering::SeqCst);
            if remaining > 0 {
                self.reject_unauthorized.store(remaining - 1, Ordering::SeqCst);
                return Err(CloudError::Unauthorized);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl CloudProvider for FakeProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Gdrive
        }

        async fn list_page(
            &self,
            _t: &str,
            _f: &str,
            _o: &ListOptions,
            _p: Option<&str>,
        ) -> Result<FilePage, CloudError> {
            Ok(FilePage::default())
        }

        async fn metadata(&self, _t: &str, id: &str) -> Result<RemoteFile, CloudError> {
            self.gate()?;
            match id {
                "file-1" => Ok(RemoteFile::file("file-1", "report.txt", 11)),
                "folder-1" => Ok(RemoteFile::folder("folder-1", "Projects")),
                other => Err(CloudError::NotFound(other.to_string())),
            }
        }

        async fn upload(
            &self,
            _t: &str,
            local_path: &Path,
            _d: &str,
            cancel: &CancellationToken,
        ) -> Result<RemoteFile, CloudError> {
            if cancel.is_cancelled() {
                return Err(CloudError::Cancelled);
            }
            self.upload_calls.fetch_add(1, Ordering::SeqCst);
            self.gate()?;
            let name = local_path.file_name().unwrap().to_string_lossy().to_string();
            Ok(RemoteFile::file("new-id", name, 5))
        }

        async fn download_to(
            &self,
            _t: &str,
            id: &str,
            dest: &Path,
            cancel: &CancellationToken,
            on_progress: Option<&(dyn Fn(u64) + Send + Sync)>,
        ) -> Result<u64, CloudError> {
            if cancel.is_cancelled() {
                return Err(CloudError::Cancelled);
            }
            self.gate()?;
            if id != "file-1" {
                return Err(CloudError::NotFound(id.to_string()));
            }
            tokio::fs::write(dest, b"hello world").await?;
            if let Some(progress) = on_progress {
                progress(11);
            }
            Ok(11)
        }

        async fn delete(&self, _t: &str, id: &str) -> Result<(), CloudError> {
            self.gate()?;
            match id {
                "file-1" => Ok(()),
                other => Err(CloudError::NotFound(other.to_string())),
            }
        }
    }

    fn engine_with(provider: Arc<FakeProvider>, root: &Path) -> Arc<TransferEngine> {
        Arc::new(
            TransferEngine::new(CountingTokens::new(), Arc::new(TracingSink), root.to_path_buf())
                .with_provider(provider),
        )
    }

    #[tokio::test]
    async fn test_delete_idempotent_on_missing_id() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(FakeProvider::new(), dir.path());

        // Absent both the first and the second time, success both times
        engine.delete(ProviderKind::Gdrive, "ghost").await.unwrap();
        engine.delete(ProviderKind::Gdrive, "ghost").await.unwrap();
    }

    #[tokio::test]
    async fn test_download_writes_to_provider_subfolder() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(FakeProvider::new(), dir.path());
        let cancel = CancellationToken::new();

        let path = engine
            .download(ProviderKind::Gdrive, "file-1", None, false, &cancel)
            .await
            .unwrap();

        assert_eq!(path, dir.path().join("Google Drive").join("report.txt"));
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_download_refuses_silent_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(FakeProvider::new(), dir.path());
        let cancel = CancellationToken::new();

        let path = engine
            .download(ProviderKind::Gdrive, "file-1", None, false, &cancel)
            .await
            .unwrap();

        match engine
            .download(ProviderKind::Gdrive, "file-1", None, false, &cancel)
            .await
        {
            Err(CloudError::Conflict(_)) => {}
            other => panic!("expected Conflict, got {other:?}"),
        }

        // Explicit confirmation replaces the file
        let replaced = engine
            .download(ProviderKind::Gdrive, "file-1", None, true, &cancel)
            .await
            .unwrap();
        assert_eq!(path, replaced);
    }

    #[tokio::test]
    async fn test_download_of_folder_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(FakeProvider::new(), dir.path());
        let cancel = CancellationToken::new();

        match engine
            .download(ProviderKind::Gdrive, "folder-1", None, false, &cancel)
            .await
        {
            Err(CloudError::Unsupported(_)) => {}
            other => panic!("expected Unsupported, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_before_send() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(FakeProvider::new(), dir.path());

        let cancel = CancellationToken::new();
        cancel.cancel();

        match engine
            .download(ProviderKind::Gdrive, "file-1", None, false, &cancel)
            .await
        {
            Err(CloudError::Cancelled) => {}
            other => panic!("expected Cancelled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_upload_retries_exactly_once_after_401() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FakeProvider::rejecting_first(1);
        let tokens = CountingTokens::new();
        let engine = Arc::new(
            TransferEngine::new(tokens.clone(), Arc::new(TracingSink), dir.path().to_path_buf())
                .with_provider(provider.clone()),
        );

        let local = dir.path().join("notes.txt");
        std::fs::write(&local, b"data!").unwrap();

        let cancel = CancellationToken::new();
        let uploaded = engine
            .upload(ProviderKind::Gdrive, &local, "root", &cancel)
            .await
            .unwrap();

        assert_eq!(uploaded.name, "notes.txt");
        assert_eq!(provider.upload_calls.load(Ordering::SeqCst), 2);
        assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_repeated_401_surfaces_after_single_retry() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FakeProvider::rejecting_first(10);
        let tokens = CountingTokens::new();
        let engine = Arc::new(
            TransferEngine::new(tokens.clone(), Arc::new(TracingSink), dir.path().to_path_buf())
                .with_provider(provider.clone()),
        );

        let local = dir.path().join("notes.txt");
        std::fs::write(&local, b"data!").unwrap();

        let cancel = CancellationToken::new();
        match engine
            .upload(ProviderKind::Gdrive, &local, "root", &cancel)
            .await
        {
            Err(CloudError::Unauthorized) => {}
            other => panic!("expected Unauthorized, got {other:?}"),
        }
        assert_eq!(provider.upload_calls.load(Ordering::SeqCst), 2);
        assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_job_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(FakeProvider::new(), dir.path());

        let job_id = engine.start_download(
            ProviderKind::Gdrive,
            "file-1".to_string(),
            false,
            CancellationToken::new(),
        );

        let mut last = None;
        for _ in 0..100 {
            match engine.poll_job(job_id) {
                Some(job) if job.status.is_terminal() => {
                    last = Some(job);
                    break;
                }
                Some(_) => tokio::time::sleep(Duration::from_millis(10)).await,
                None => panic!("job vanished before a terminal status was observed"),
            }
        }

        let job = last.expect("download did not finish in time");
        assert_eq!(job.status, TransferStatus::Succeeded);
        assert_eq!(job.bytes_transferred, 11);
        assert!(job.local_path.is_some());
        assert!(job.error.is_none());

        // Observing the terminal status destroyed the job
        assert!(engine.poll_job(job_id).is_none());
    }
}
