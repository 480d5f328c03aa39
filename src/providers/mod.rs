//! Cloud providers
//!
//! One unified abstraction over the three remote backends. All providers
//! implement the [`CloudProvider`] trait, so listing, navigation and
//! transfers work against GitHub, Google Drive and OneDrive through a single
//! interface.
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            CloudProvider trait              │
//! │   list_page, metadata, upload, download,    │
//! │                  delete                     │
//! └─────────────────────────────────────────────┘
//!                      │
//!          ┌───────────┼───────────┐
//!          ▼           ▼           ▼
//!      ┌────────┐ ┌─────────┐ ┌──────────┐
//!      │ GitHub │ │ GDrive  │ │ OneDrive │
//!      └────────┘ └─────────┘ └──────────┘
//! ```
//!
//! Providers are stateless: each call borrows the current access token for
//! its duration only. Token lifecycle belongs to `auth_flow` and
//! `token_refresher`.

pub mod github;
pub mod google_drive;
pub mod http_retry;
pub mod oauth2;
pub mod onedrive;
pub mod types;

pub use github::GithubProvider;
pub use google_drive::GoogleDriveProvider;
pub use onedrive::OneDriveProvider;
pub use types::{FilePage, ListOptions, ProviderKind, RemoteFile};

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::CloudError;

/// Unified cloud provider capability set
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Provider identifier
    fn kind(&self) -> ProviderKind;

    /// List one page of a folder's children (or of the shared-with-me view)
    async fn list_page(
        &self,
        access_token: &str,
        folder_id: &str,
        options: &ListOptions,
        page_token: Option<&str>,
    ) -> Result<FilePage, CloudError>;

    /// Fetch metadata for a single entry
    async fn metadata(&self, access_token: &str, remote_id: &str)
        -> Result<RemoteFile, CloudError>;

    /// Upload a local file into the given folder
    async fn upload(
        &self,
        access_token: &str,
        local_path: &Path,
        parent_id: &str,
        cancel: &CancellationToken,
    ) -> Result<RemoteFile, CloudError>;

    /// Stream a remote file's content to `dest`; returns bytes written
    async fn download_to(
        &self,
        access_token: &str,
        remote_id: &str,
        dest: &Path,
        cancel: &CancellationToken,
        on_progress: Option<&(dyn Fn(u64) + Send + Sync)>,
    ) -> Result<u64, CloudError>;

    /// Delete a remote entry. Absent ids surface as `NotFound`; the transfer
    /// engine treats that as success.
    async fn delete(&self, access_token: &str, remote_id: &str) -> Result<(), CloudError>;
}

/// Provider factory
pub struct ProviderFactory;

impl ProviderFactory {
    pub fn create(kind: ProviderKind) -> Arc<dyn CloudProvider> {
        match kind {
            ProviderKind::Github => Arc::new(GithubProvider::new()),
            ProviderKind::Gdrive => Arc::new(GoogleDriveProvider::new()),
            ProviderKind::Onedrive => Arc::new(OneDriveProvider::new()),
        }
    }
}

/// Turn a non-success response into a classified error
pub(crate) async fn error_from_response(
    kind: ProviderKind,
    response: reqwest::Response,
) -> CloudError {
    let status = response.status().as_u16();
    let retry_after = http_retry::parse_retry_after(&response);
    let body = response.text().await.unwrap_or_default();
    crate::error::classify(kind, status, &body, retry_after)
}

/// Stream a response body to a local file, honoring cancellation between
/// chunks. A cancelled or failed download removes the partial file.
pub(crate) async fn stream_to_file(
    response: reqwest::Response,
    dest: &Path,
    cancel: &CancellationToken,
    on_progress: Option<&(dyn Fn(u64) + Send + Sync)>,
) -> Result<u64, CloudError> {
    use futures_util::StreamExt;
    use tokio::io::AsyncWriteExt;

    let mut file = tokio::fs::File::create(dest).await?;
    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        if cancel.is_cancelled() {
            drop(file);
            let _ = tokio::fs::remove_file(dest).await;
            return Err(CloudError::Cancelled);
        }
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(dest).await;
                return Err(CloudError::Network(e.to_string()));
            }
        };
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
        if let Some(progress) = on_progress {
            progress(written);
        }
    }

    file.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_covers_all_kinds() {
        for kind in ProviderKind::all() {
            let provider = ProviderFactory::create(kind);
            assert_eq!(provider.kind(), kind);
        }
    }
}
