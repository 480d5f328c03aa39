//! Shared types for cloud providers
//!
//! Contains the provider identifiers, the unified remote file representation
//! and the listing option/page types used by every provider implementation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported cloud provider kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// GitHub (REST API v3, PAT or OAuth2)
    Github,
    /// Google Drive (Drive API v3, OAuth2)
    Gdrive,
    /// Microsoft OneDrive (Graph API, OAuth2)
    Onedrive,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Github => write!(f, "GitHub"),
            ProviderKind::Gdrive => write!(f, "Google Drive"),
            ProviderKind::Onedrive => write!(f, "OneDrive"),
        }
    }
}

impl ProviderKind {
    /// Identifier of the provider-defined root folder
    pub fn root_folder_id(&self) -> &'static str {
        match self {
            // GitHub's "root" is the authenticated user's repository list
            ProviderKind::Github => "",
            ProviderKind::Gdrive => "root",
            ProviderKind::Onedrive => "root",
        }
    }

    /// Largest page size the provider accepts on listing calls
    pub fn max_page_size(&self) -> u32 {
        match self {
            ProviderKind::Github => 100,
            ProviderKind::Gdrive => 100,
            ProviderKind::Onedrive => 200,
        }
    }

    /// Name of the per-provider download subfolder under the download root
    pub fn download_dir_name(&self) -> &'static str {
        match self {
            ProviderKind::Github => "GitHub",
            ProviderKind::Gdrive => "Google Drive",
            ProviderKind::Onedrive => "OneDrive",
        }
    }

    /// Stable lowercase slug used for storage account keys
    pub fn slug(&self) -> &'static str {
        match self {
            ProviderKind::Github => "github",
            ProviderKind::Gdrive => "gdrive",
            ProviderKind::Onedrive => "onedrive",
        }
    }

    pub fn all() -> [ProviderKind; 3] {
        [ProviderKind::Github, ProviderKind::Gdrive, ProviderKind::Onedrive]
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "github" => Ok(ProviderKind::Github),
            "gdrive" | "googledrive" | "drive" => Ok(ProviderKind::Gdrive),
            "onedrive" => Ok(ProviderKind::Onedrive),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

/// Unified representation of one entry returned by a listing
///
/// Entries form a tree per provider rooted at [`ProviderKind::root_folder_id`];
/// folders are navigated via parent/child edges, not ownership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFile {
    /// Provider-scoped opaque identifier, stable across listings
    pub id: String,
    pub name: String,
    pub mime_type: Option<String>,
    pub is_folder: bool,
    pub modified_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    /// Identifier of the containing folder, if the provider reports one
    pub parent_id: Option<String>,
    /// Whether the item is shared with (rather than owned by) the user
    pub shared: bool,
    /// Size in bytes (0 for folders)
    pub size: u64,
}

impl RemoteFile {
    /// Create a folder entry
    pub fn folder(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            mime_type: None,
            is_folder: true,
            modified_at: None,
            created_at: None,
            parent_id: None,
            shared: false,
            size: 0,
        }
    }

    /// Create a file entry
    pub fn file(id: impl Into<String>, name: impl Into<String>, size: u64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            mime_type: None,
            is_folder: false,
            modified_at: None,
            created_at: None,
            parent_id: None,
            shared: false,
            size,
        }
    }
}

/// Options for a listing call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListOptions {
    /// List the "shared with me" view instead of a folder's children
    pub shared_with_me: bool,
    /// Case-insensitive substring filter on entry names
    pub name_filter: Option<String>,
    /// Requested page size; clamped to the provider maximum
    pub page_size: u32,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            shared_with_me: false,
            name_filter: None,
            page_size: 100,
        }
    }
}

impl ListOptions {
    /// Page size actually sent to the provider (clamped, never zero)
    pub fn effective_page_size(&self, kind: ProviderKind) -> u32 {
        self.page_size.clamp(1, kind.max_page_size())
    }

    /// Apply the name filter client-side, for providers whose listing API
    /// cannot express a substring match.
    pub fn matches_name(&self, name: &str) -> bool {
        match &self.name_filter {
            Some(filter) => name.to_lowercase().contains(&filter.to_lowercase()),
            None => true,
        }
    }
}

/// One page of a listing
#[derive(Debug, Clone, Default)]
pub struct FilePage {
    pub items: Vec<RemoteFile>,
    /// Opaque continuation token; `None` when the listing is exhausted
    pub next_page_token: Option<String>,
}
