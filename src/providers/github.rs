//! GitHub provider
//!
//! Implements [`CloudProvider`] against the GitHub REST API. The repository
//! list acts as the provider root: repositories are folders, repository
//! contents are navigated through the contents API.
//!
//! Remote ids are encoded as `owner/repo` for a repository and
//! `owner/repo:path/in/tree` for an entry inside it.

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::http_retry::{send_with_retry, HttpRetryConfig};
use super::types::{FilePage, ListOptions, ProviderKind, RemoteFile};
use super::{error_from_response, stream_to_file, CloudProvider};
use crate::error::CloudError;

const GITHUB_API: &str = "https://api.github.com";
const USER_AGENT: &str = "techcodex-cloud";
const API_VERSION: &str = "2022-11-28";

/// Repository summary from `/user/repos`
#[derive(Debug, Deserialize)]
struct Repo {
    name: String,
    full_name: String,
    #[serde(default)]
    fork: bool,
    updated_at: Option<String>,
    created_at: Option<String>,
}

/// Entry from the contents API
#[derive(Debug, Deserialize)]
struct ContentEntry {
    name: String,
    path: String,
    sha: String,
    #[serde(default)]
    size: u64,
    #[serde(rename = "type")]
    entry_type: String,
}

#[derive(Debug, Deserialize)]
struct ContentWrapper {
    content: ContentEntry,
}

#[derive(Debug, Deserialize)]
struct GithubUser {
    login: String,
}

/// Where a remote id points within GitHub's tree
#[derive(Debug, Clone, PartialEq)]
enum Location {
    /// The authenticated user's repository list
    Root,
    /// A repository ("owner/repo")
    Repo(String),
    /// An entry inside a repository ("owner/repo", "path/in/tree")
    Entry(String, String),
}

fn parse_remote_id(remote_id: &str) -> Location {
    if remote_id.is_empty() {
        return Location::Root;
    }
    match remote_id.split_once(':') {
        Some((repo, path)) if !path.is_empty() => {
            Location::Entry(repo.to_string(), path.to_string())
        }
        Some((repo, _)) => Location::Repo(repo.to_string()),
        None => Location::Repo(remote_id.to_string()),
    }
}

fn entry_id(repo: &str, path: &str) -> String {
    format!("{repo}:{path}")
}

/// The contents API caps directories at 1000 entries and has no continuation
/// token; the repository list paginates via the `Link` header.
fn link_has_next(link_header: Option<&str>) -> bool {
    link_header
        .map(|value| value.contains("rel=\"next\""))
        .unwrap_or(false)
}

/// GitHub provider
pub struct GithubProvider {
    client: reqwest::Client,
    retry: HttpRetryConfig,
}

impl GithubProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            retry: HttpRetryConfig::default(),
        }
    }

    fn request(&self, method: reqwest::Method, url: String, token: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(token)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, CloudError> {
        let request = builder
            .build()
            .map_err(|e| CloudError::Network(e.to_string()))?;
        let response = send_with_retry(&self.client, request, &self.retry).await?;
        if !response.status().is_success() {
            return Err(error_from_response(ProviderKind::Github, response).await);
        }
        Ok(response)
    }

    fn repo_to_remote_file(repo: &Repo, shared: bool) -> RemoteFile {
        RemoteFile {
            id: repo.full_name.clone(),
            name: repo.name.clone(),
            mime_type: None,
            is_folder: true,
            modified_at: repo.updated_at.as_deref().and_then(parse_rfc3339),
            created_at: repo.created_at.as_deref().and_then(parse_rfc3339),
            parent_id: None,
            shared: shared || repo.fork,
            size: 0,
        }
    }

    fn content_to_remote_file(repo: &str, entry: &ContentEntry) -> RemoteFile {
        RemoteFile {
            id: entry_id(repo, &entry.path),
            name: entry.name.clone(),
            mime_type: mime_guess::from_path(&entry.name).first().map(|m| m.to_string()),
            is_folder: entry.entry_type == "dir",
            modified_at: None,
            created_at: None,
            parent_id: Some(repo.to_string()),
            shared: false,
            size: entry.size,
        }
    }

    /// Look up the blob sha for an existing path, if any
    async fn content_sha(&self, token: &str, repo: &str, path: &str) -> Result<Option<String>, CloudError> {
        let url = format!("{GITHUB_API}/repos/{repo}/contents/{path}");
        match self.send(self.request(reqwest::Method::GET, url, token)).await {
            Ok(response) => {
                let entry: ContentEntry = response
                    .json()
                    .await
                    .map_err(|e| CloudError::Serialization(e.to_string()))?;
                Ok(Some(entry.sha))
            }
            Err(CloudError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Validate a personal access token and return the account login.
    /// Used by the PAT login path instead of the redirect flow.
    pub async fn validate_token(&self, token: &str) -> Result<String, CloudError> {
        let response = self
            .send(self.request(reqwest::Method::GET, format!("{GITHUB_API}/user"), token))
            .await?;
        let user: GithubUser = response
            .json()
            .await
            .map_err(|e| CloudError::Serialization(e.to_string()))?;
        Ok(user.login)
    }

    /// Create a repository for the authenticated user.
    /// A duplicate name surfaces as `Conflict`.
    pub async fn create_repository(
        &self,
        token: &str,
        name: &str,
        private: bool,
        auto_init: bool,
    ) -> Result<RemoteFile, CloudError> {
        let body = serde_json::json!({
            "name": name,
            "private": private,
            "auto_init": auto_init,
        });
        let response = self
            .send(
                self.request(reqwest::Method::POST, format!("{GITHUB_API}/user/repos"), token)
                    .json(&body),
            )
            .await?;
        let repo: Repo = response
            .json()
            .await
            .map_err(|e| CloudError::Serialization(e.to_string()))?;

        info!("Created GitHub repository {}", repo.full_name);
        Ok(Self::repo_to_remote_file(&repo, false))
    }

    /// List branch names of a repository
    pub async fn list_branches(&self, token: &str, repo: &str) -> Result<Vec<String>, CloudError> {
        #[derive(Deserialize)]
        struct Branch {
            name: String,
        }
        let url = format!("{GITHUB_API}/repos/{repo}/branches?per_page=100");
        let response = self.send(self.request(reqwest::Method::GET, url, token)).await?;
        let branches: Vec<Branch> = response
            .json()
            .await
            .map_err(|e| CloudError::Serialization(e.to_string()))?;
        Ok(branches.into_iter().map(|b| b.name).collect())
    }

    async fn list_repos(
        &self,
        token: &str,
        options: &ListOptions,
        page_token: Option<&str>,
    ) -> Result<FilePage, CloudError> {
        let page: u32 = page_token.and_then(|t| t.parse().ok()).unwrap_or(1);
        let per_page = options.effective_page_size(ProviderKind::Github);
        let affiliation = if options.shared_with_me {
            "collaborator,organization_member"
        } else {
            "owner"
        };

        let url = format!(
            "{GITHUB_API}/user/repos?per_page={per_page}&page={page}&affiliation={affiliation}&sort=full_name"
        );
        let response = self.send(self.request(reqwest::Method::GET, url, token)).await?;

        let has_next = link_has_next(
            response
                .headers()
                .get(reqwest::header::LINK)
                .and_then(|v| v.to_str().ok()),
        );
        let repos: Vec<Repo> = response
            .json()
            .await
            .map_err(|e| CloudError::Serialization(e.to_string()))?;

        let items = repos
            .iter()
            .map(|r| Self::repo_to_remote_file(r, options.shared_with_me))
            .filter(|entry| options.matches_name(&entry.name))
            .collect();

        Ok(FilePage {
            items,
            next_page_token: has_next.then(|| (page + 1).to_string()),
        })
    }

    async fn list_contents(
        &self,
        token: &str,
        repo: &str,
        path: &str,
        options: &ListOptions,
    ) -> Result<FilePage, CloudError> {
        let url = if path.is_empty() {
            format!("{GITHUB_API}/repos/{repo}/contents/")
        } else {
            format!("{GITHUB_API}/repos/{repo}/contents/{path}")
        };
        let response = self.send(self.request(reqwest::Method::GET, url, token)).await?;
        let entries: Vec<ContentEntry> = response
            .json()
            .await
            .map_err(|e| CloudError::Serialization(e.to_string()))?;

        let items = entries
            .iter()
            .map(|e| Self::content_to_remote_file(repo, e))
            .filter(|entry| options.matches_name(&entry.name))
            .collect();

        Ok(FilePage {
            items,
            next_page_token: None,
        })
    }
}

impl Default for GithubProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_rfc3339(value: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&chrono::Utc))
}

#[async_trait]
impl CloudProvider for GithubProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Github
    }

    async fn list_page(
        &self,
        access_token: &str,
        folder_id: &str,
        options: &ListOptions,
        page_token: Option<&str>,
    ) -> Result<FilePage, CloudError> {
        match parse_remote_id(folder_id) {
            Location::Root => self.list_repos(access_token, options, page_token).await,
            Location::Repo(repo) => self.list_contents(access_token, &repo, "", options).await,
            Location::Entry(repo, path) => {
                self.list_contents(access_token, &repo, &path, options).await
            }
        }
    }

    async fn metadata(
        &self,
        access_token: &str,
        remote_id: &str,
    ) -> Result<RemoteFile, CloudError> {
        match parse_remote_id(remote_id) {
            Location::Root => Ok(RemoteFile::folder("", "Repositories")),
            Location::Repo(repo) => {
                let url = format!("{GITHUB_API}/repos/{repo}");
                let response = self
                    .send(self.request(reqwest::Method::GET, url, access_token))
                    .await?;
                let repo: Repo = response
                    .json()
                    .await
                    .map_err(|e| CloudError::Serialization(e.to_string()))?;
                Ok(Self::repo_to_remote_file(&repo, false))
            }
            Location::Entry(repo, path) => {
                let url = format!("{GITHUB_API}/repos/{repo}/contents/{path}");
                let response = self
                    .send(self.request(reqwest::Method::GET, url, access_token))
                    .await?;
                // A file answers with an object, a directory with an array
                let value: serde_json::Value = response
                    .json()
                    .await
                    .map_err(|e| CloudError::Serialization(e.to_string()))?;
                if value.is_array() {
                    let name = path.rsplit('/').next().unwrap_or(&path).to_string();
                    let mut entry = RemoteFile::folder(entry_id(&repo, &path), name);
                    entry.parent_id = Some(repo.clone());
                    Ok(entry)
                } else {
                    let entry: ContentEntry = serde_json::from_value(value)
                        .map_err(|e| CloudError::Serialization(e.to_string()))?;
                    Ok(Self::content_to_remote_file(&repo, &entry))
                }
            }
        }
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

        let (repo, dir) = match parse_remote_id(parent_id) {
            Location::Root => {
                return Err(CloudError::Unsupported(
                    "uploads go into a repository, not the repository list".to_string(),
                ))
            }
            Location::Repo(repo) => (repo, String::new()),
            Location::Entry(repo, path) => (repo, path),
        };
        let path = if dir.is_empty() {
            file_name.clone()
        } else {
            format!("{dir}/{file_name}")
        };

        let content = tokio::fs::read(local_path).await?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&content);

        // Updating an existing path requires its current blob sha
        let sha = self.content_sha(access_token, &repo, &path).await?;
        let mut body = serde_json::json!({
            "message": format!("Upload {file_name}"),
            "content": encoded,
        });
        if let Some(sha) = sha {
            body["sha"] = serde_json::Value::String(sha);
        }

        let url = format!("{GITHUB_API}/repos/{repo}/contents/{path}");
        let response = self
            .send(self.request(reqwest::Method::PUT, url, access_token).json(&body))
            .await?;
        let wrapper: ContentWrapper = response
            .json()
            .await
            .map_err(|e| CloudError::Serialization(e.to_string()))?;

        info!("Uploaded {:?} to {}", local_path, repo);
        Ok(Self::content_to_remote_file(&repo, &wrapper.content))
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

        let (repo, path) = match parse_remote_id(remote_id) {
            Location::Entry(repo, path) => (repo, path),
            _ => {
                return Err(CloudError::Unsupported(
                    "repositories are cloned, not downloaded as files".to_string(),
                ))
            }
        };

        // Raw media type instead of the JSON wrapper, so the body streams
        let builder = self
            .client
            .get(format!("{GITHUB_API}/repos/{repo}/contents/{path}"))
            .bearer_auth(access_token)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::ACCEPT, "application/vnd.github.raw+json")
            .header("X-GitHub-Api-Version", API_VERSION);
        let response = self.send(builder).await?;

        let written = stream_to_file(response, dest, cancel, on_progress).await?;
        info!("Downloaded {}:{} to {:?}", repo, path, dest);
        Ok(written)
    }

    async fn delete(&self, access_token: &str, remote_id: &str) -> Result<(), CloudError> {
        let (repo, path) = match parse_remote_id(remote_id) {
            Location::Entry(repo, path) => (repo, path),
            _ => {
                return Err(CloudError::Unsupported(
                    "repository deletion is managed on GitHub, not here".to_string(),
                ))
            }
        };

        let sha = self
            .content_sha(access_token, &repo, &path)
            .await?
            .ok_or_else(|| CloudError::NotFound(format!("{repo}:{path}")))?;

        let body = serde_json::json!({
            "message": format!("Delete {path}"),
            "sha": sha,
        });
        let url = format!("{GITHUB_API}/repos/{repo}/contents/{path}");
        self.send(
            self.request(reqwest::Method::DELETE, url, access_token)
                .json(&body),
        )
        .await?;

        info!("Deleted {}:{}", repo, path);
        Ok(())
    }
}
