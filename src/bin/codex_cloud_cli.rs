//! TechCodex Cloud CLI: drive the cloud core from a terminal
//!
//! Usage:
//!   codex-cloud auth <provider> --client-id <id> --client-secret <secret>
//!   codex-cloud login-token <pat>            Authenticate GitHub with a PAT
//!   codex-cloud ls <provider> [--shared] [--filter name] [--all]
//!   codex-cloud upload <provider> <file> [--dest folder-id]
//!   codex-cloud download <provider> <remote-id> [--overwrite]
//!   codex-cloud rm <provider> <remote-id>
//!   codex-cloud logout <provider>
//!   codex-cloud status

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;

use techcodex_cloud::{
    load_settings, AuthFlowController, Credential, CredentialStore, ListOptions, ProviderFactory,
    ProviderKind, RemoteFileIndex, TokenRefresher, TracingSink, TransferEngine, TransferStatus,
};

#[derive(Parser)]
#[command(
    name = "codex-cloud",
    about = "TechCodex Cloud: GitHub, Google Drive and OneDrive from the terminal",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the OAuth2 authorization flow for a provider
    Auth {
        /// Provider: github, gdrive or onedrive
        provider: ProviderKind,
        /// OAuth client id issued by the provider
        #[arg(long)]
        client_id: String,
        /// OAuth client secret issued by the provider
        #[arg(long)]
        client_secret: String,
        /// Tenant id (OneDrive only, default "common")
        #[arg(long)]
        tenant: Option<String>,
    },
    /// Authenticate GitHub with a personal access token
    LoginToken {
        /// The personal access token
        token: String,
    },
    /// List a remote folder
    Ls {
        /// Provider: github, gdrive or onedrive
        provider: ProviderKind,
        /// Folder id (default: provider root)
        folder: Option<String>,
        /// Show the "shared with me" view
        #[arg(long)]
        shared: bool,
        /// Filter entries by name
        #[arg(long)]
        filter: Option<String>,
        /// Follow continuation tokens until the listing is exhausted
        #[arg(long)]
        all: bool,
    },
    /// Upload a local file
    Upload {
        provider: ProviderKind,
        /// Local file to upload
        file: PathBuf,
        /// Destination folder id (default: provider root)
        #[arg(long)]
        dest: Option<String>,
    },
    /// Download a remote file to the provider's download folder
    Download {
        provider: ProviderKind,
        /// Remote file id
        remote_id: String,
        /// Replace an existing local file of the same name
        #[arg(long)]
        overwrite: bool,
    },
    /// Delete a remote file
    Rm {
        provider: ProviderKind,
        /// Remote file id
        remote_id: String,
    },
    /// Forget the stored credentials for a provider
    Logout { provider: ProviderKind },
    /// Show which providers are authenticated
    Status,
}

struct App {
    store: Arc<CredentialStore>,
    controller: AuthFlowController,
    tokens: Arc<TokenRefresher>,
    engine: Arc<TransferEngine>,
}

impl App {
    fn new() -> Result<Self> {
        let sink = Arc::new(TracingSink);
        let settings = load_settings();

        // An explicit vault password wins over the OS keyring
        let store = match std::env::var("TECHCODEX_VAULT_PASSWORD") {
            Ok(password) => Arc::new(CredentialStore::open_vault(
                &techcodex_cloud::credential_store::default_store_dir()?,
                Some(&password),
                sink.clone(),
            )?),
            Err(_) => Arc::new(CredentialStore::open_default(sink.clone())?),
        };

        let controller = AuthFlowController::new(store.clone(), settings.clone(), sink.clone());
        let tokens = Arc::new(TokenRefresher::new(
            store.clone(),
            controller.registry(),
            sink.clone(),
            settings.redirect_port,
        ));
        let engine = Arc::new(TransferEngine::new(
            tokens.clone(),
            sink,
            settings.download_root.clone(),
        ));

        Ok(Self {
            store,
            controller,
            tokens,
            engine,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .init();

    let cli = Cli::parse();
    let app = App::new()?;

    match cli.command {
        Commands::Auth {
            provider,
            client_id,
            client_secret,
            tenant,
        } => {
            app.controller.save_profile(Credential::profile(
                provider,
                client_id,
                client_secret,
                Vec::new(),
                tenant,
            ))?;
            println!("Waiting for authorization in the browser...");
            app.controller
                .begin(provider, &CancellationToken::new())
                .await
                .with_context(|| format!("authorization for {provider} failed"))?;
            println!("{provider} connected.");
        }

        Commands::LoginToken { token } => {
            let login = app
                .controller
                .login_with_token(ProviderKind::Github, &token)
                .await?;
            println!("GitHub connected as {login}.");
        }

        Commands::Ls {
            provider,
            folder,
            shared,
            filter,
            all,
        } => {
            let mut index = RemoteFileIndex::new(
                ProviderFactory::create(provider),
                app.tokens.clone(),
                Arc::new(TracingSink),
            );
            if let Some(folder_id) = folder {
                index.push(&techcodex_cloud::RemoteFile::folder(folder_id, "folder"))?;
            }

            let options = ListOptions {
                shared_with_me: shared,
                name_filter: filter,
                ..Default::default()
            };

            let items = if all {
                index.list_all(&options).await?
            } else {
                index.page(&options, None).await?.items
            };

            for entry in &items {
                let marker = if entry.is_folder { "d" } else { "-" };
                let shared_marker = if entry.shared { "s" } else { "-" };
                let modified = entry
                    .modified_at
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}{} {:>10}  {:<16}  {}  [{}]",
                    marker, shared_marker, entry.size, modified, entry.name, entry.id
                );
            }
            println!("{} entries", items.len());
        }

        Commands::Upload {
            provider,
            file,
            dest,
        } => {
            let dest = dest.unwrap_or_else(|| provider.root_folder_id().to_string());
            let spinner = ProgressBar::new_spinner();
            spinner.set_message(format!("Uploading {}...", file.display()));
            spinner.enable_steady_tick(Duration::from_millis(100));

            let uploaded = app
                .engine
                .upload(provider, &file, &dest, &CancellationToken::new())
                .await?;
            spinner.finish_and_clear();
            println!("Uploaded {} [{}]", uploaded.name, uploaded.id);
        }

        Commands::Download {
            provider,
            remote_id,
            overwrite,
        } => {
            let job_id = app.engine.start_download(
                provider,
                remote_id,
                overwrite,
                CancellationToken::new(),
            );

            let bar = ProgressBar::new_spinner();
            bar.set_style(
                ProgressStyle::with_template("{spinner} {msg} {bytes}")
                    .expect("valid progress template"),
            );
            bar.enable_steady_tick(Duration::from_millis(100));

            let job = loop {
                match app.engine.poll_job(job_id) {
                    Some(job) if job.status.is_terminal() => break job,
                    Some(job) => {
                        bar.set_position(job.bytes_transferred);
                        bar.set_message("Downloading");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    None => anyhow::bail!("download job disappeared"),
                }
            };
            bar.finish_and_clear();

            match job.status {
                TransferStatus::Succeeded => println!(
                    "Downloaded to {} ({} bytes)",
                    job.local_path
                        .map(|p| p.display().to_string())
                        .unwrap_or_default(),
                    job.bytes_transferred
                ),
                _ => anyhow::bail!(job.error.unwrap_or_else(|| "download failed".to_string())),
            }
        }

        Commands::Rm {
            provider,
            remote_id,
        } => {
            app.engine.delete(provider, &remote_id).await?;
            println!("Deleted {remote_id}.");
        }

        Commands::Logout { provider } => {
            app.controller.logout(provider)?;
            println!("{provider} disconnected.");
        }

        Commands::Status => {
            for kind in ProviderKind::all() {
                let connected = app.store.has_credential(kind);
                println!(
                    "{:<14} {}",
                    kind.to_string(),
                    if connected { "connected" } else { "not connected" }
                );
            }
        }
    }

    Ok(())
}
