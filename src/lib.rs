// TechCodex Cloud - cloud identity and remote file sync core
// OAuth2 flows, encrypted credential storage, paginated remote listings and
// resilient transfers for GitHub, Google Drive and OneDrive.

//! The cloud layer shared by the TechCodex integrations.
//!
//! A UI action asks [`auth_flow::AuthFlowController`] for an authenticated
//! session; [`credential_store::CredentialStore`] supplies and validates the
//! persisted credential; [`token_refresher::TokenRefresher`] keeps the access
//! token fresh; [`file_index::RemoteFileIndex`] or
//! [`transfer::TransferEngine`] performs the remote operation; failures are
//! normalized into [`error::CloudError`] and the caller decides retry or
//! report.

pub mod activity;
pub mod auth_flow;
pub mod credential_store;
pub mod crypto;
pub mod error;
pub mod file_index;
pub mod providers;
pub mod settings;
pub mod token_refresher;
pub mod transfer;

pub use activity::{LogCategory, LogSink, TracingSink};
pub use auth_flow::{AuthFlowController, FlowRegistry, FlowState};
pub use credential_store::{Credential, CredentialStore};
pub use error::CloudError;
pub use file_index::{NavigationState, RemoteFileIndex, MAX_LIST_PAGES};
pub use providers::{
    CloudProvider, FilePage, GithubProvider, GoogleDriveProvider, ListOptions, OneDriveProvider,
    ProviderFactory, ProviderKind, RemoteFile,
};
pub use settings::{load_settings, save_settings, validate_settings, Settings};
pub use token_refresher::{TokenRefresher, TokenSource};
pub use transfer::{TransferEngine, TransferJob, TransferStatus};
