//! Remote file index
//!
//! Paginated listing and folder navigation over one provider's tree. Listing
//! yields one page per call via the provider's continuation token; `list_all`
//! chains pages up to a hard cap. Nothing is cached across navigation; every
//! push, pop or filter change triggers a fresh listing call.

use std::sync::Arc;

use crate::activity::LogSink;
use crate::error::CloudError;
use crate::providers::types::{FilePage, ListOptions, RemoteFile};
use crate::providers::CloudProvider;
use crate::token_refresher::{with_auth_retry, TokenSource};

/// Upper bound on chained pages, guarding against providers that never
/// exhaust their continuation tokens.
pub const MAX_LIST_PAGES: u32 = 50;

/// One level of the navigation path
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub folder_id: String,
    pub label: String,
}

/// Stack of `(folder_id, label)` frames from the provider root down to the
/// current view. The root frame is never popped.
#[derive(Debug, Clone)]
pub struct NavigationState {
    frames: Vec<Frame>,
}

impl NavigationState {
    pub fn new(root_id: impl Into<String>, root_label: impl Into<String>) -> Self {
        Self {
            frames: vec![Frame {
                folder_id: root_id.into(),
                label: root_label.into(),
            }],
        }
    }

    pub fn push(&mut self, folder_id: impl Into<String>, label: impl Into<String>) {
        self.frames.push(Frame {
            folder_id: folder_id.into(),
            label: label.into(),
        });
    }

    /// Pop the top frame; a no-op returning `false` at the root
    pub fn pop(&mut self) -> bool {
        if self.frames.len() > 1 {
            self.frames.pop();
            true
        } else {
            false
        }
    }

    pub fn current(&self) -> &Frame {
        self.frames.last().expect("navigation stack never empty")
    }

    pub fn at_root(&self) -> bool {
        self.frames.len() == 1
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Human-readable breadcrumb path, e.g. `/Projects/2025`
    pub fn path(&self) -> String {
        if self.at_root() {
            return "/".to_string();
        }
        self.frames
            .iter()
            .skip(1)
            .map(|f| format!("/{}", f.label))
            .collect()
    }
}

/// Listing and navigation over one provider's remote tree
pub struct RemoteFileIndex {
    provider: Arc<dyn CloudProvider>,
    tokens: Arc<dyn TokenSource>,
    sink: Arc<dyn LogSink>,
    nav: NavigationState,
}

impl RemoteFileIndex {
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        tokens: Arc<dyn TokenSource>,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        let root = provider.kind().root_folder_id().to_string();
        Self {
            provider,
            tokens,
            sink,
            nav: NavigationState::new(root, "/"),
        }
    }

    pub fn navigation(&self) -> &NavigationState {
        &self.nav
    }

    /// Descend into a folder returned by a previous listing
    pub fn push(&mut self, folder: &RemoteFile) -> Result<(), CloudError> {
        if !folder.is_folder {
            return Err(CloudError::Unsupported(format!(
                "{} is not a folder",
                folder.name
            )));
        }
        self.nav.push(folder.id.clone(), folder.name.clone());
        Ok(())
    }

    /// Return to the parent folder; a no-op at the root
    pub fn pop(&mut self) -> bool {
        self.nav.pop()
    }

    /// Fetch one page of the current folder's listing
    pub async fn page(
        &self,
        options: &ListOptions,
        page_token: Option<&str>,
    ) -> Result<FilePage, CloudError> {
        let kind = self.provider.kind();
        let folder_id = self.nav.current().folder_id.clone();
        let token_owned = page_token.map(String::from);

        let result = with_auth_retry(kind, &self.tokens, &self.sink, "list", |token| {
            use secrecy::ExposeSecret;
            let provider = self.provider.clone();
            let folder_id = folder_id.clone();
            let options = options.clone();
            let page_token = token_owned.clone();
            async move {
                provider
                    .list_page(
                        token.expose_secret(),
                        &folder_id,
                        &options,
                        page_token.as_deref(),
                    )
                    .await
            }
        })
        .await;

        if let Err(ref e) = result {
            self.sink.record(
                crate::activity::LogCategory::Network,
                &kind.to_string(),
                &format!("listing of folder {folder_id} failed: {e}"),
            );
        }
        result
    }

    /// Fetch the complete listing of the current folder, transparently
    /// chaining continuation tokens. Stops with `PaginationLimitExceeded`
    /// after [`MAX_LIST_PAGES`] pages.
    pub async fn list_all(&self, options: &ListOptions) -> Result<Vec<RemoteFile>, CloudError> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let page = self.page(options, page_token.as_deref()).await?;
            items.extend(page.items);
            match page.next_page_token {
                None => return Ok(items),
                Some(token) => page_token = Some(token),
            }
        }

        Err(CloudError::PaginationLimitExceeded(MAX_LIST_PAGES))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::TracingSink;
    use crate::providers::types::ProviderKind;
    use async_trait::async_trait;
    use secrecy::SecretString;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_util::sync::CancellationToken;

    struct StaticTokens;

    #[async_trait]
    impl TokenSource for StaticTokens {
        async fn ensure_fresh(&self, _kind: ProviderKind) -> Result<SecretString, CloudError> {
            Ok(SecretString::from("token".to_string()))
        }
        async fn refresh_now(&self, _kind: ProviderKind) -> Result<SecretString, CloudError> {
            Ok(SecretString::from("token".to_string()))
        }
    }

    /// Serves `total` synthetic items in pages, using the item offset as the
    /// continuation token.
    struct PagedProvider {
        total: u32,
        shared: bool,
        endless: bool,
        calls: AtomicU32,
    }

    impl PagedProvider {
        fn new(total: u32) -> Self {
            Self {
                total,
                shared: false,
                endless: false,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl CloudProvider for PagedProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Gdrive
        }

        async fn list_page(
            &self,
            _access_token: &str,
            _folder_id: &str,
            options: &ListOptions,
            page_token: Option<&str>,
        ) -> Result<FilePage, CloudError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.endless {
                return Ok(FilePage {
                    items: vec![RemoteFile::file("loop", "loop.txt", 1)],
                    next_page_token: Some("again".to_string()),
                });
            }

            let offset: u32 = page_token.and_then(|t| t.parse().ok()).unwrap_or(0);
            let page_size = options.effective_page_size(self.kind());
            let end = (offset + page_size).min(self.total);

            let items = (offset..end)
                .map(|i| {
                    let mut file = RemoteFile::file(format!("id-{i}"), format!("file-{i}.txt"), 10);
                    file.shared = self.shared || options.shared_with_me;
                    file
                })
                .collect();

            Ok(FilePage {
                items,
                next_page_token: (end < self.total).then(|| end.to_string()),
            })
        }

        async fn metadata(&self, _t: &str, _id: &str) -> Result<RemoteFile, CloudError> {
            unimplemented!("not used by listing tests")
        }

        async fn upload(
            &self,
            _t: &str,
            _p: &Path,
            _d: &str,
            _c: &CancellationToken,
        ) -> Result<RemoteFile, CloudError> {
            unimplemented!("not used by listing tests")
        }

        async fn download_to(
            &self,
            _t: &str,
            _id: &str,
            _d: &Path,
            _c: &CancellationToken,
            _p: Option<&(dyn Fn(u64) + Send + Sync)>,
        ) -> Result<u64, CloudError> {
            unimplemented!("not used by listing tests")
        }

        async fn delete(&self, _t: &str, _id: &str) -> Result<(), CloudError> {
            unimplemented!("not used by listing tests")
        }
    }

    fn index_over(provider: Arc<PagedProvider>) -> RemoteFileIndex {
        RemoteFileIndex::new(provider, Arc::new(StaticTokens), Arc::new(TracingSink))
    }

    #[tokio::test]
    async fn test_pagination_completeness() {
        // N items across ceil(N / page_size) pages: all unique, none dropped
        for total in [0u32, 1, 100, 101, 500] {
            let provider = Arc::new(PagedProvider::new(total));
            let index = index_over(provider.clone());

            let items = index.list_all(&ListOptions::default()).await.unwrap();
            assert_eq!(items.len(), total as usize, "total={total}");

            let unique: std::collections::HashSet<_> = items.iter().map(|f| &f.id).collect();
            assert_eq!(unique.len(), total as usize, "duplicates for total={total}");

            let expected_calls = (total.div_ceil(100)).max(1);
            assert_eq!(provider.calls.load(Ordering::SeqCst), expected_calls);
        }
    }

    #[tokio::test]
    async fn test_shared_listing_spans_pages() {
        // 150 shared items with page_size 100 arrive in two pages, all shared
        let provider = Arc::new(PagedProvider::new(150));
        let index = index_over(provider.clone());

        let options = ListOptions {
            shared_with_me: true,
            page_size: 100,
            ..Default::default()
        };
        let items = index.list_all(&options).await.unwrap();

        assert_eq!(items.len(), 150);
        assert!(items.iter().all(|f| f.shared));
        assert!(items.iter().all(|f| !f.is_folder));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);

        let unique: std::collections::HashSet<_> = items.iter().map(|f| &f.id).collect();
        assert_eq!(unique.len(), 150);
    }

    #[tokio::test]
    async fn test_single_page_stops_at_token() {
        let provider = Arc::new(PagedProvider::new(250));
        let index = index_over(provider);

        let first = index.page(&ListOptions::default(), None).await.unwrap();
        assert_eq!(first.items.len(), 100);
        let token = first.next_page_token.unwrap();

        let second = index.page(&ListOptions::default(), Some(&token)).await.unwrap();
        assert_eq!(second.items.len(), 100);
        assert_eq!(second.items[0].id, "id-100");
    }

    #[tokio::test]
    async fn test_pathological_provider_hits_page_cap() {
        let provider = Arc::new(PagedProvider {
            total: 0,
            shared: false,
            endless: true,
            calls: AtomicU32::new(0),
        });
        let index = index_over(provider.clone());

        match index.list_all(&ListOptions::default()).await {
            Err(CloudError::PaginationLimitExceeded(MAX_LIST_PAGES)) => {}
            other => panic!("expected PaginationLimitExceeded, got {other:?}"),
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), MAX_LIST_PAGES);
    }

    #[tokio::test]
    async fn test_navigation_stack() {
        let provider = Arc::new(PagedProvider::new(0));
        let mut index = index_over(provider);

        assert!(index.navigation().at_root());
        assert_eq!(index.navigation().path(), "/");

        index.push(&RemoteFile::folder("a", "A")).unwrap();
        index.push(&RemoteFile::folder("b", "B")).unwrap();
        index.push(&RemoteFile::folder("c", "C")).unwrap();
        assert_eq!(index.navigation().path(), "/A/B/C");

        assert!(index.pop());
        assert!(index.pop());
        assert_eq!(index.navigation().current().folder_id, "a");

        // Back to the root, then popping becomes a no-op
        assert!(index.pop());
        assert!(!index.pop());
        assert!(index.navigation().at_root());
    }

    #[tokio::test]
    async fn test_push_rejects_files() {
        let provider = Arc::new(PagedProvider::new(0));
        let mut index = index_over(provider);

        let file = RemoteFile::file("f", "notes.txt", 10);
        match index.push(&file) {
            Err(CloudError::Unsupported(_)) => {}
            other => panic!("expected Unsupported, got {other:?}"),
        }
        assert!(index.navigation().at_root());
    }
}
