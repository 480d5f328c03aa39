// TechCodex Cloud secure credential store
// Dual-mode: OS keyring (preferred) + encrypted vault fallback (Argon2id + AES-256-GCM)
// Credentials are persisted only in encrypted form; plaintext lives in memory
// for the duration of the process and is discarded on logout.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::activity::{LogCategory, LogSink};
use crate::error::CloudError;
use crate::providers::types::ProviderKind;

const SERVICE_NAME: &str = "techcodex-cloud";
const VAULT_FILENAME: &str = "vault.db";
const MACHINE_KEY_FILENAME: &str = "vault.key";

/// Seconds subtracted from `expires_at` when judging freshness
pub const EXPIRY_SKEW_SECS: i64 = 60;

// ============ Credential Record ============

/// One credential record per provider: OAuth client configuration plus the
/// current token material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub provider: ProviderKind,
    pub client_id: String,
    pub client_secret: String,
    /// Ordered permission strings, joined with spaces on the wire
    pub scope: Vec<String>,
    /// Multi-tenant discriminator (OneDrive), default "common"
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// Client configuration captured before the first token exchange
    pub fn profile(
        provider: ProviderKind,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        scope: Vec<String>,
        tenant: Option<String>,
    ) -> Self {
        Self {
            provider,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            scope,
            tenant,
            access_token: String::new(),
            refresh_token: None,
            expires_at: None,
        }
    }

    /// A long-lived personal access token (GitHub); never refreshed locally
    pub fn personal_token(provider: ProviderKind, token: impl Into<String>) -> Self {
        Self {
            provider,
            client_id: String::new(),
            client_secret: String::new(),
            scope: Vec::new(),
            tenant: None,
            access_token: token.into(),
            refresh_token: None,
            expires_at: None,
        }
    }

    pub fn has_access_token(&self) -> bool {
        !self.access_token.is_empty()
    }

    /// PATs carry neither refresh token nor expiry; a 401 against one means
    /// re-authentication, not refresh.
    pub fn is_personal_token(&self) -> bool {
        self.has_access_token() && self.refresh_token.is_none() && self.expires_at.is_none()
    }

    /// Whether the access token expires within `skew_secs` from now.
    /// Tokens without an expiry are assumed valid.
    pub fn expires_within(&self, skew_secs: i64) -> bool {
        match self.expires_at {
            Some(at) => Utc::now() + Duration::seconds(skew_secs) >= at,
            None => false,
        }
    }

    pub fn scope_string(&self) -> String {
        self.scope.join(" ")
    }
}

// ============ Vault File Format ============

#[derive(Serialize, Deserialize)]
struct VaultFile {
    version: u32,
    salt: Vec<u8>,         // 32 bytes for Argon2id
    verify_nonce: Vec<u8>, // 12 bytes - nonce for verification token
    verify_data: Vec<u8>,  // encrypted marker for key verification
    entries: HashMap<String, VaultEntry>,
}

#[derive(Serialize, Deserialize, Clone)]
struct VaultEntry {
    nonce: Vec<u8>, // 12 bytes
    data: Vec<u8>,  // [ciphertext][tag 16B]
}

const VERIFY_MARKER: &[u8] = b"techcodex_vault_ok";

// ============ Credential Backend ============

enum Backend {
    OsKeyring,
    EncryptedVault {
        path: PathBuf,
        master_key: [u8; 32],
    },
}

// ============ Credential Store ============

/// Single writer of persisted credentials. Writes are serialized; encryption
/// and file I/O are the only sections under the lock.
pub struct CredentialStore {
    backend: Backend,
    sink: Arc<dyn LogSink>,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore").finish_non_exhaustive()
    }
}

impl CredentialStore {
    /// Try to create a store using the OS keyring. Returns None if the
    /// platform secret store is unavailable.
    pub fn with_keyring(sink: Arc<dyn LogSink>) -> Option<Self> {
        let entry = keyring::Entry::new(SERVICE_NAME, "__probe__").ok()?;
        match entry.get_password() {
            Ok(_) | Err(keyring::Error::NoEntry) => {}
            Err(keyring::Error::NoStorageAccess(_)) => return None,
            Err(keyring::Error::PlatformFailure(_)) => return None,
            Err(_) => {}
        }
        Some(Self {
            backend: Backend::OsKeyring,
            sink,
            write_lock: Mutex::new(()),
        })
    }

    /// Open (or initialize) the encrypted vault in `dir`.
    ///
    /// The vault key is derived from `password` when supplied, otherwise from
    /// a machine-bound secret generated on first use and kept next to the
    /// vault with owner-only permissions.
    pub fn open_vault(
        dir: &Path,
        password: Option<&str>,
        sink: Arc<dyn LogSink>,
    ) -> Result<Self, CloudError> {
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
            ensure_secure_permissions(dir)?;
        }
        let vault_path = dir.join(VAULT_FILENAME);

        let secret = match password {
            Some(p) => p.to_string(),
            None => machine_secret(dir)?,
        };

        if !vault_path.exists() {
            let salt = crate::crypto::random_bytes(32);
            let master_key =
                crate::crypto::derive_key(&secret, &salt).map_err(CloudError::Decryption)?;
            let verify_nonce = crate::crypto::random_bytes(12);
            let verify_data = crate::crypto::encrypt_aes_gcm(&master_key, &verify_nonce, VERIFY_MARKER)
                .map_err(CloudError::Decryption)?;

            let vault = VaultFile {
                version: 1,
                salt,
                verify_nonce,
                verify_data,
                entries: HashMap::new(),
            };
            write_vault_atomic(&vault_path, &vault)?;
            info!("Credential vault initialized at {:?}", vault_path);

            return Ok(Self {
                backend: Backend::EncryptedVault {
                    path: vault_path,
                    master_key,
                },
                sink,
                write_lock: Mutex::new(()),
            });
        }

        let vault = read_vault(&vault_path)?;
        let master_key =
            crate::crypto::derive_key(&secret, &vault.salt).map_err(CloudError::Decryption)?;

        // Verify the key before accepting it; a mismatch signals rotation or tampering
        if crate::crypto::decrypt_aes_gcm(&master_key, &vault.verify_nonce, &vault.verify_data)
            .is_err()
        {
            sink.record(
                LogCategory::Auth,
                "credential_store",
                "vault key verification failed (wrong key or tampered vault)",
            );
            return Err(CloudError::Decryption(
                "vault key verification failed".to_string(),
            ));
        }

        Ok(Self {
            backend: Backend::EncryptedVault {
                path: vault_path,
                master_key,
            },
            sink,
            write_lock: Mutex::new(()),
        })
    }

    /// Keyring when available, encrypted vault in the platform config dir
    /// otherwise.
    pub fn open_default(sink: Arc<dyn LogSink>) -> Result<Self, CloudError> {
        if let Some(store) = Self::with_keyring(sink.clone()) {
            return Ok(store);
        }
        let dir = default_store_dir()?;
        Self::open_vault(&dir, None, sink)
    }

    /// Persist a credential record for its provider
    pub fn save(&self, credential: &Credential) -> Result<(), CloudError> {
        let account = account_name(credential.provider);
        let json = serde_json::to_string(credential)
            .map_err(|e| CloudError::Serialization(e.to_string()))?;

        let _guard = self.write_lock.lock().expect("credential store lock poisoned");
        match &self.backend {
            Backend::OsKeyring => {
                let entry = keyring::Entry::new(SERVICE_NAME, &account)
                    .map_err(|e| CloudError::Keyring(e.to_string()))?;
                entry
                    .set_password(&json)
                    .map_err(|e| CloudError::Keyring(e.to_string()))?;
                info!("Credential stored in OS keyring: {}", account);
            }
            Backend::EncryptedVault { path, master_key } => {
                let mut vault = read_vault(path)?;
                let nonce = crate::crypto::random_bytes(12);
                let data = crate::crypto::encrypt_aes_gcm(master_key, &nonce, json.as_bytes())
                    .map_err(CloudError::Decryption)?;
                vault.entries.insert(account.clone(), VaultEntry { nonce, data });
                write_vault_atomic(path, &vault)?;
                info!("Credential stored in vault: {}", account);
            }
        }
        Ok(())
    }

    /// Load the credential for a provider.
    ///
    /// `NotFound` if the provider was never authenticated; `Decryption` when
    /// the stored ciphertext does not match the vault key.
    pub fn load(&self, provider: ProviderKind) -> Result<Credential, CloudError> {
        let account = account_name(provider);
        let json = match &self.backend {
            Backend::OsKeyring => {
                let entry = keyring::Entry::new(SERVICE_NAME, &account)
                    .map_err(|e| CloudError::Keyring(e.to_string()))?;
                entry.get_password().map_err(|e| match e {
                    keyring::Error::NoEntry => {
                        CloudError::NotFound(format!("no stored credential for {provider}"))
                    }
                    other => CloudError::Keyring(other.to_string()),
                })?
            }
            Backend::EncryptedVault { path, master_key } => {
                let vault = read_vault(path)?;
                let entry = vault.entries.get(&account).ok_or_else(|| {
                    CloudError::NotFound(format!("no stored credential for {provider}"))
                })?;
                let plaintext =
                    match crate::crypto::decrypt_aes_gcm(master_key, &entry.nonce, &entry.data) {
                        Ok(p) => p,
                        Err(e) => {
                            self.sink.record(
                                LogCategory::Auth,
                                "credential_store",
                                &format!("failed to decrypt credential for {provider}"),
                            );
                            return Err(CloudError::Decryption(e));
                        }
                    };
                String::from_utf8(plaintext).map_err(|e| CloudError::Decryption(e.to_string()))?
            }
        };

        serde_json::from_str(&json).map_err(|e| {
            self.sink.record(
                LogCategory::Auth,
                "credential_store",
                &format!("failed to parse stored credential for {provider}"),
            );
            CloudError::Serialization(e.to_string())
        })
    }

    /// Whether a credential exists for the provider
    pub fn has_credential(&self, provider: ProviderKind) -> bool {
        self.load(provider).is_ok()
    }

    /// Delete all persisted material for a provider. Used on logout;
    /// idempotent and irreversible.
    pub fn clear(&self, provider: ProviderKind) -> Result<(), CloudError> {
        let account = account_name(provider);

        let _guard = self.write_lock.lock().expect("credential store lock poisoned");
        match &self.backend {
            Backend::OsKeyring => {
                let entry = keyring::Entry::new(SERVICE_NAME, &account)
                    .map_err(|e| CloudError::Keyring(e.to_string()))?;
                match entry.delete_credential() {
                    Ok(()) | Err(keyring::Error::NoEntry) => {}
                    Err(e) => return Err(CloudError::Keyring(e.to_string())),
                }
                info!("Credential deleted from OS keyring: {}", account);
            }
            Backend::EncryptedVault { path, .. } => {
                let mut vault = read_vault(path)?;
                if vault.entries.remove(&account).is_some() {
                    // Shred the old blob so the removed ciphertext is not
                    // recoverable from the previous file contents.
                    let tmp = path.with_extension("db.tmp");
                    let data = serde_json::to_vec_pretty(&vault)
                        .map_err(|e| CloudError::Serialization(e.to_string()))?;
                    std::fs::write(&tmp, &data)?;
                    ensure_secure_permissions(&tmp)?;
                    secure_delete(path)?;
                    std::fs::rename(&tmp, path)?;
                    info!("Credential deleted from vault: {}", account);
                }
            }
        }
        Ok(())
    }
}

fn account_name(provider: ProviderKind) -> String {
    format!("oauth_{}", provider.slug())
}

/// Directory for the vault fallback: `<config dir>/techcodex`
pub fn default_store_dir() -> Result<PathBuf, CloudError> {
    let base = dirs::config_dir()
        .or_else(dirs::home_dir)
        .ok_or_else(|| CloudError::InvalidConfig("no config directory available".to_string()))?;
    Ok(base.join("techcodex"))
}

/// Load or create the machine-bound vault secret (random, owner-readable only)
fn machine_secret(dir: &Path) -> Result<String, CloudError> {
    let key_path = dir.join(MACHINE_KEY_FILENAME);
    if key_path.exists() {
        let bytes = std::fs::read(&key_path)?;
        return Ok(hex_encode(&bytes));
    }
    let bytes = crate::crypto::random_bytes(32);
    std::fs::write(&key_path, &bytes)?;
    ensure_secure_permissions(&key_path)?;
    Ok(hex_encode(&bytes))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn read_vault(path: &Path) -> Result<VaultFile, CloudError> {
    let data = std::fs::read(path)?;
    serde_json::from_slice(&data).map_err(|e| CloudError::Serialization(e.to_string()))
}

/// Write-temp-then-rename so a crash mid-write never corrupts the vault
fn write_vault_atomic(path: &Path, vault: &VaultFile) -> Result<(), CloudError> {
    let data =
        serde_json::to_vec_pretty(vault).map_err(|e| CloudError::Serialization(e.to_string()))?;
    let tmp = path.with_extension("db.tmp");
    std::fs::write(&tmp, &data)?;
    ensure_secure_permissions(&tmp)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Ensure owner-only file/directory permissions (0o600 files, 0o700 dirs on Unix)
pub fn ensure_secure_permissions(path: &Path) -> Result<(), CloudError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if path.is_dir() { 0o700 } else { 0o600 };
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Securely delete a file (overwrite with zeros, then random data, then remove)
pub fn secure_delete(path: &Path) -> Result<(), CloudError> {
    if path.exists() {
        let size = std::fs::metadata(path)?.len();
        if size > 0 {
            let zeros = vec![0u8; size as usize];
            std::fs::write(path, &zeros)?;
            let random = crate::crypto::random_bytes(size as usize);
            std::fs::write(path, &random)?;
        }
        std::fs::remove_file(path)?;
        warn!("Securely deleted: {:?}", path);
    }
    Ok(())
}
