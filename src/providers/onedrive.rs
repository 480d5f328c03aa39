//! OneDrive provider
//!
//! Implements [`CloudProvider`] against the Microsoft Graph API: children
//! listing with `@odata.nextLink` continuation, shared-with-me view, simple
//! PUT upload and `/content` download.

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

const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";

/// OneDrive item metadata (Graph drive item)
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveItem {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    size: u64,
    last_modified_date_time: Option<String>,
    created_date_time: Option<String>,
    #[serde(default)]
    folder: Option<FolderFacet>,
    #[serde(default)]
    file: Option<FileFacet>,
    #[serde(default)]
    parent_reference: Option<ParentReference>,
    #[serde(default)]
    shared: Option<SharedFacet>,
    /// Present on shared-with-me results; carries the real item fields
    #[serde(default)]
    remote_item: Option<Box<DriveItem>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct FolderFacet {
    #[serde(default)]
    #[allow(dead_code)]
    child_count: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct FileFacet {
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParentReference {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SharedFacet {
    #[serde(default)]
    #[allow(dead_code)]
    scope: Option<String>,
}

/// Children listing response
#[derive(Debug, Deserialize)]
struct ChildrenResponse {
    #[serde(default)]
    value: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

/// OneDrive provider
pub struct OneDriveProvider {
    client: reqwest::Client,
    retry: HttpRetryConfig,
}

impl OneDriveProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            retry: HttpRetryConfig::default(),
        }
    }

    fn to_remote_file(item: &DriveItem) -> RemoteFile {
        // Shared-with-me rows wrap the actual item in the remoteItem facet
        if let Some(ref remote) = item.remote_item {
            let mut entry = Self::to_remote_file(remote);
            entry.shared = true;
            if entry.name.is_empty() {
                entry.name = item.name.clone().unwrap_or_default();
            }
            return entry;
        }

        RemoteFile {
            id: item.id.clone(),
            name: item.name.clone().unwrap_or_default(),
            mime_type: item.file.as_ref().and_then(|f| f.mime_type.clone()),
            is_folder: item.folder.is_some(),
            modified_at: item
                .last_modified_date_time
                .as_deref()
                .and_then(parse_rfc3339),
            created_at: item.created_date_time.as_deref().and_then(parse_rfc3339),
            parent_id: item.parent_reference.as_ref().and_then(|p| p.id.clone()),
            shared: item.shared.is_some(),
            size: item.size,
        }
    }
}

impl Default for OneDriveProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Graph addresses the root by name, everything else by item id
fn item_url(remote_id: &str) -> String {
    if remote_id == "root" {
        format!("{GRAPH_API_BASE}/me/drive/root")
    } else {
        format!("{GRAPH_API_BASE}/me/drive/items/{remote_id}")
    }
}

/// Resolve the URL for one listing page. Continuation tokens are the full
/// `@odata.nextLink` URL, so a token short-circuits everything else.
fn list_url(folder_id: &str, options: &ListOptions, page_token: Option<&str>, top: u32) -> String {
    if let Some(link) = page_token {
        return link.to_string();
    }
    if options.shared_with_me {
        format!("{GRAPH_API_BASE}/me/drive/sharedWithMe?$top={top}")
    } else {
        format!("{}/children?$top={top}", item_url(folder_id))
    }
}

/// Upload target: `/items/{parent}:/{name}:/content`, with the root addressed
/// by path form
fn upload_url(parent_id: &str, file_name: &str) -> String {
    let encoded = urlencoding::encode(file_name);
    if parent_id == "root" {
        format!("{GRAPH_API_BASE}/me/drive/root:/{encoded}:/content")
    } else {
        format!("{GRAPH_API_BASE}/me/drive/items/{parent_id}:/{encoded}:/content")
    }
}

#[async_trait]
impl CloudProvider for OneDriveProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Onedrive
    }

    async fn list_page(
        &self,
        access_token: &str,
        folder_id: &str,
        options: &ListOptions,
        page_token: Option<&str>,
    ) -> Result<FilePage, CloudError> {
        let top = options.effective_page_size(self.kind());
        let url = list_url(folder_id, options, page_token, top);

        let request = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .build()
            .map_err(|e| CloudError::Network(e.to_string()))?;

        let response = send_with_retry(&self.client, request, &self.retry).await?;
        if !response.status().is_success() {
            return Err(error_from_response(self.kind(), response).await);
        }

        let children: ChildrenResponse = response
            .json()
            .await
            .map_err(|e| CloudError::Serialization(e.to_string()))?;

        // Graph has no substring filter; apply it client-side
        let items = children
            .value
            .iter()
            .map(Self::to_remote_file)
            .map(|mut entry| {
                if options.shared_with_me {
                    entry.shared = true;
                }
                entry
            })
            .filter(|entry| options.matches_name(&entry.name))
            .collect();

        Ok(FilePage {
            items,
            next_page_token: children.next_link,
        })
    }

    async fn metadata(
        &self,
        access_token: &str,
        remote_id: &str,
    ) -> Result<RemoteFile, CloudError> {
        let request = self
            .client
            .get(item_url(remote_id))
            .bearer_auth(access_token)
            .build()
            .map_err(|e| CloudError::Network(e.to_string()))?;

        let response = send_with_retry(&self.client, request, &self.retry).await?;
        if !response.status().is_success() {
            return Err(error_from_response(self.kind(), response).await);
        }

        let item: DriveItem = response
            .json()
            .await
            .map_err(|e| CloudError::Serialization(e.to_string()))?;
        Ok(Self::to_remote_file(&item))
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

        let request = self
            .client
            .put(upload_url(parent_id, &file_name))
            .bearer_auth(access_token)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(content)
            .build()
            .map_err(|e| CloudError::Network(e.to_string()))?;

        let response = send_with_retry(&self.client, request, &self.retry).await?;
        if !response.status().is_success() {
            return Err(error_from_response(self.kind(), response).await);
        }

        let item: DriveItem = response
            .json()
            .await
            .map_err(|e| CloudError::Serialization(e.to_string()))?;

        info!("Uploaded {:?} to OneDrive folder {}", local_path, parent_id);
        Ok(Self::to_remote_file(&item))
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

        // Graph answers with a 302 to a pre-authenticated URL; reqwest follows it
        let request = self
            .client
            .get(format!("{}/content", item_url(remote_id)))
            .bearer_auth(access_token)
            .build()
            .map_err(|e| CloudError::Network(e.to_string()))?;

        let response = send_with_retry(&self.client, request, &self.retry).await?;
        if !response.status().is_success() {
            return Err(error_from_response(self.kind(), response).await);
        }

        let written = stream_to_file(response, dest, cancel, on_progress).await?;
        info!("Downloaded OneDrive item {} to {:?}", remote_id, dest);
        Ok(written)
    }

    async fn delete(&self, access_token: &str, remote_id: &str) -> Result<(), CloudError> {
        let request = self
            .client
            .delete(item_url(remote_id))
            .bearer_auth(access_token)
            .build()
            .map_err(|e| CloudError::Network(e.to_string()))?;

        let response = send_with_retry(&self.client, request, &self.retry).await?;
        if !response.status().is_success() {
            return Err(error_from_response(self.kind(), response).await);
        }

        info!("Deleted OneDrive item {}", remote_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_mapping_file() {
        let json = r#"{
            "id": "01ABCDEF",
            "name": "notes.txt",
            "size": 512,
            "lastModifiedDateTime": "2025-11-03T10:15:30Z",
            "createdDateTime": "2025-10-01T08:00:00Z",
            "file": {"mimeType": "text/plain"},
            "parentReference": {"id": "01ROOT"}
        }"#;
        let item: DriveItem = serde_json::from_str(json).unwrap();
        let entry = OneDriveProvider::to_remote_file(&item);

        assert_eq!(entry.id, "01ABCDEF");
        assert!(!entry.is_folder);
        assert_eq!(entry.mime_type.as_deref(), Some("text/plain"));
        assert_eq!(entry.size, 512);
        assert_eq!(entry.parent_id.as_deref(), Some("01ROOT"));
        assert!(!entry.shared);
    }

    #[test]
    fn test_item_mapping_shared_folder() {
        let json = r#"{
            "id": "01SHARED",
            "name": "Team Docs",
            "folder": {"childCount": 4},
            "shared": {"scope": "users"}
        }"#;
        let item: DriveItem = serde_json::from_str(json).unwrap();
        let entry = OneDriveProvider::to_remote_file(&item);
        assert!(entry.is_folder);
        assert!(entry.shared);
    }

    #[test]
    fn test_item_mapping_remote_item() {
        // sharedWithMe rows wrap the real item in remoteItem
        let json = r#"{
            "id": "01WRAPPER",
            "name": "shared.docx",
            "remoteItem": {
                "id": "01REMOTE",
                "name": "shared.docx",
                "size": 2048,
                "file": {"mimeType": "application/vnd.openxmlformats-officedocument.wordprocessingml.document"}
            }
        }"#;
        let item: DriveItem = serde_json::from_str(json).unwrap();
        let entry = OneDriveProvider::to_remote_file(&item);
        assert_eq!(entry.id, "01REMOTE");
        assert_eq!(entry.size, 2048);
        assert!(entry.shared);
    }

    #[test]
    fn test_list_url_variants() {
        let options = ListOptions::default();
        assert_eq!(
            list_url("root", &options, None, 100),
            "https://graph.microsoft.com/v1.0/me/drive/root/children?$top=100"
        );
        assert_eq!(
            list_url("01ABC", &options, None, 50),
            "https://graph.microsoft.com/v1.0/me/drive/items/01ABC/children?$top=50"
        );

        let shared = ListOptions {
            shared_with_me: true,
            ..Default::default()
        };
        assert_eq!(
            list_url("root", &shared, None, 100),
            "https://graph.microsoft.com/v1.0/me/drive/sharedWithMe?$top=100"
        );

        // A continuation token is the full next link
        let link = "https://graph.microsoft.com/v1.0/me/drive/items/01ABC/children?$skiptoken=xyz";
        assert_eq!(list_url("01ABC", &options, Some(link), 100), link);
    }

    #[test]
    fn test_upload_url_encodes_names() {
        assert_eq!(
            upload_url("root", "my file.txt"),
            "https://graph.microsoft.com/v1.0/me/drive/root:/my%20file.txt:/content"
        );
        assert!(upload_url("01ABC", "a.txt").contains("/items/01ABC:/a.txt:/content"));
    }

    #[test]
    fn test_children_response_next_link() {
        let json = r#"{"value": [], "@odata.nextLink": "https://graph.microsoft.com/v1.0/next"}"#;
        let children: ChildrenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(
            children.next_link.as_deref(),
            Some("https://graph.microsoft.com/v1.0/next")
        );
    }
}
