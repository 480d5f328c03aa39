//! Google Drive provider
//!
//! Implements [`CloudProvider`] on top of the Drive API v3: `files.list` with
//! continuation tokens, multipart upload, `alt=media` download.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::http_retry::{send_with_retry, HttpRetryConfig};
use super::types::{FilePage, ListOptions, ProviderKind, RemoteFile};
use super::{error_from_response, stream_to_file, CloudProvider};
use crate::error::CloudError;

const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
const UPLOAD_API_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const FILE_FIELDS: &str = "id,name,mimeType,size,modifiedTime,createdTime,parents,shared";

/// Drive file metadata from the API
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    mime_type: String,
    #[serde(default)]
    size: Option<String>,
    modified_time: Option<String>,
    created_time: Option<String>,
    #[serde(default)]
    parents: Vec<String>,
    #[serde(default)]
    shared: bool,
}

/// Drive file list response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

/// Google Drive provider
pub struct GoogleDriveProvider {
    client: reqwest::Client,
    retry: HttpRetryConfig,
}

impl GoogleDriveProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            retry: HttpRetryConfig::default(),
        }
    }

    fn to_remote_file(file: &DriveFile) -> RemoteFile {
        RemoteFile {
            id: file.id.clone(),
            name: file.name.clone(),
            mime_type: Some(file.mime_type.clone()),
            is_folder: file.mime_type == FOLDER_MIME,
            modified_at: file.modified_time.as_deref().and_then(parse_rfc3339),
            created_at: file.created_time.as_deref().and_then(parse_rfc3339),
            parent_id: file.parents.first().cloned(),
            shared: file.shared,
            size: file
                .size
                .as_ref()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
        }
    }
}

impl Default for GoogleDriveProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Build the `q` expression for a listing call
fn build_list_query(folder_id: &str, options: &ListOptions) -> String {
    let mut query = if options.shared_with_me {
        "sharedWithMe=true and trashed=false".to_string()
    } else {
        format!("'{}' in parents and trashed=false", escape(folder_id))
    };
    if let Some(ref filter) = options.name_filter {
        query.push_str(&format!(" and name contains '{}'", escape(filter)));
    }
    query
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

#[async_trait]
impl CloudProvider for GoogleDriveProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gdrive
    }

    async fn list_page(
        &self,
        access_token: &str,
        folder_id: &str,
        options: &ListOptions,
        page_token: Option<&str>,
    ) -> Result<FilePage, CloudError> {
        let query = build_list_query(folder_id, options);
        let page_size = options.effective_page_size(self.kind());

        let mut params = vec![
            ("q".to_string(), query),
            ("fields".to_string(), format!("files({FILE_FIELDS}),nextPageToken")),
            ("pageSize".to_string(), page_size.to_string()),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken".to_string(), token.to_string()));
        }

        let request = self
            .client
            .get(format!("{DRIVE_API_BASE}/files"))
            .query(&params)
            .bearer_auth(access_token)
            .build()
            .map_err(|e| CloudError::Network(e.to_string()))?;

        let response = send_with_retry(&self.client, request, &self.retry).await?;
        if !response.status().is_success() {
            return Err(error_from_response(self.kind(), response).await);
        }

        let list: DriveFileList = response
            .json()
            .await
            .map_err(|e| CloudError::Serialization(e.to_string()))?;

        Ok(FilePage {
            items: list.files.iter().map(Self::to_remote_file).collect(),
            next_page_token: list.next_page_token,
        })
    }

    async fn metadata(
        &self,
        access_token: &str,
        remote_id: &str,
    ) -> Result<RemoteFile, CloudError> {
        let request = self
            .client
            .get(format!("{DRIVE_API_BASE}/files/{remote_id}"))
            .query(&[("fields", FILE_FIELDS)])
            .bearer_auth(access_token)
            .build()
            .map_err(|e| CloudError::Network(e.to_string()))?;

        let response = send_with_retry(&self.client, request, &self.retry).await?;
        if !response.status().is_success() {
            return Err(error_from_response(self.kind(), response).await);
        }

        let file: DriveFile = response
            .json()
            .await
            .map_err(|e| CloudError::Serialization(e.to_string()))?;
        Ok(Self::to_remote_file(&file))
    }

    async fn upload(
        &self,
        access_token: &str,
        local_path: &Path,
        parent_id: &str,
        cancel: &CancellationToken,
    ) -> Result<RemoteFile, CloudError> {
        if cancel.is_cancelled() {
            return Err(CloudError::Cancelled);
        }

        let file_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| CloudError::InvalidConfig("upload path has no file name".to_string()))?;
        let content = tokio::fs::read(local_path).await?;
        let content_type = mime_guess::from_path(local_path)
            .first_or_octet_stream()
            .to_string();

        let metadata = serde_json::json!({
            "name": file_name,
            "parents": [parent_id],
        });

        // Multipart/related body: JSON metadata part followed by the content
        let boundary = "techcodex_boundary";
        let mut body = Vec::with_capacity(content.len() + 512);
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
        body.extend_from_slice(metadata.to_string().as_bytes());
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
        body.extend_from_slice(&content);
        body.extend_from_slice(format!("\r\n--{boundary}--").as_bytes());

        let request = self
            .client
            .post(format!("{UPLOAD_API_BASE}/files"))
            .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
            .bearer_auth(access_token)
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={boundary}"),
            )
            .body(body)
            .build()
            .map_err(|e| CloudError::Network(e.to_string()))?;

        let response = send_with_retry(&self.client, request, &self.retry).await?;
        if !response.status().is_success() {
            return Err(error_from_response(self.kind(), response).await);
        }

        let created: DriveFile = response
            .json()
            .await
            .map_err(|e| CloudError::Serialization(e.to_string()))?;

        info!("Uploaded {:?} to Drive folder {}", local_path, parent_id);
        Ok(Self::to_remote_file(&created))
    }

    async fn download_to(
        &self,
        access_token: &str,
        remote_id: &str,
        dest: &Path,
        cancel: &CancellationToken,
        on_progress: Option<&(dyn Fn(u64) + Send + Sync)>,
    ) -> Result<u64, CloudError> {
        if cancel.is_cancelled() {
            return Err(CloudError::Cancelled);
        }

        let request = self
            .client
            .get(format!("{DRIVE_API_BASE}/files/{remote_id}"))
            .query(&[("alt", "media")])
            .bearer_auth(access_token)
            .build()
            .map_err(|e| CloudError::Network(e.to_string()))?;

        let response = send_with_retry(&self.client, request, &self.retry).await?;
        if !response.status().is_success() {
            return Err(error_from_response(self.kind(), response).await);
        }

        let written = stream_to_file(response, dest, cancel, on_progress).await?;
        info!("Downloaded Drive file {} to {:?}", remote_id, dest);
        Ok(written)
    }

    async fn delete(&self, access_token: &str, remote_id: &str) -> Result<(), CloudError> {
        let request = self
            .client
            .delete(format!("{DRIVE_API_BASE}/files/{remote_id}"))
            .bearer_auth(access_token)
            .build()
            .map_err(|e| CloudError::Network(e.to_string()))?;

        let response = send_with_retry(&self.client, request, &self.retry).await?;
        if !response.status().is_success() {
            return Err(error_from_response(self.kind(), response).await);
        }

        info!("Deleted Drive file {}", remote_id);
        Ok(())
    }
}
