//! Per-server credential persistence.
//!
//! Every server gets its own directory under the store root, named after a
//! sanitized form of the server name plus a short hash so that names which
//! sanitize to the same string never collide. Values are encrypted with
//! AES-256-GCM when a cipher is available and stored as plaintext otherwise.
//! Reads accept both forms.

use crate::types::{CredentialFile, InvalidationScope};
use crate::{OAuthError, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, trace, warn};

/// Keyring service holding the credential encryption key.
pub const KEYRING_SERVICE: &str = "mcp-fleet";
const KEYRING_USER: &str = "credential-encryption-key";
const NONCE_LEN: usize = 12;

/// Symmetric encryption applied to credential files at rest.
pub trait SecretCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// AES-256-GCM with a random nonce prepended to each ciphertext.
pub struct AesGcmCipher {
    key: [u8; 32],
}

impl AesGcmCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    /// Load the per-install key from the OS keyring, creating it on first use.
    pub fn from_keyring(service: &str) -> Result<Self> {
        let entry = keyring::Entry::new(service, KEYRING_USER)?;

        match entry.get_password() {
            Ok(encoded) => {
                let bytes = STANDARD
                    .decode(encoded.trim())
                    .map_err(|e| OAuthError::Storage(format!("Corrupt keyring key: {}", e)))?;
                let key: [u8; 32] = bytes.try_into().map_err(|_| {
                    OAuthError::Storage("Keyring key has the wrong length".to_string())
                })?;
                Ok(Self::new(key))
            }
            Err(keyring::Error::NoEntry) => {
                let cipher = Self::generate();
                entry.set_password(&STANDARD.encode(cipher.key))?;
                debug!("Created new credential encryption key in the OS keyring");
                Ok(cipher)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| OAuthError::Storage(format!("Failed to create cipher: {}", e)))
    }
}

impl SecretCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| OAuthError::Storage(format!("Encryption failed: {}", e)))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(OAuthError::Storage("Invalid encrypted data format".to_string()));
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher()?
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| OAuthError::Storage(format!("Decryption failed: {}", e)))
    }
}

/// File-backed store of OAuth client registrations, tokens and PKCE verifiers.
#[derive(Clone)]
pub struct CredentialStore {
    root: PathBuf,
    cipher: Option<Arc<dyn SecretCipher>>,
}

impl CredentialStore {
    /// Plaintext store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cipher: None,
        }
    }

    pub fn with_cipher(mut self, cipher: Arc<dyn SecretCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Store rooted at `root`, encrypted with the keyring-held key when
    /// `encrypt` is set and the keyring is reachable.
    pub fn open(root: impl Into<PathBuf>, encrypt: bool) -> Self {
        let store = Self::new(root);
        if !encrypt {
            return store;
        }

        match AesGcmCipher::from_keyring(KEYRING_SERVICE) {
            Ok(cipher) => store.with_cipher(Arc::new(cipher)),
            Err(e) => {
                warn!(
                    "Credential encryption unavailable ({}); OAuth credentials will be stored as plaintext",
                    e
                );
                store
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Directory holding every credential file for `server`.
    pub fn server_dir(&self, server: &str) -> PathBuf {
        self.root.join(namespace(server))
    }

    fn path(&self, server: &str, file: CredentialFile) -> PathBuf {
        self.server_dir(server).join(file.file_name())
    }

    /// Read a stored value. Missing or unreadable files are reported as absent.
    pub async fn read(&self, server: &str, file: CredentialFile) -> Option<String> {
        let path = self.path(server, file);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(server = %server, "Failed to read {}: {}", path.display(), e);
                return None;
            }
        };

        if let Some(cipher) = &self.cipher {
            if let Ok(plaintext) = cipher.decrypt(&bytes) {
                if let Ok(text) = String::from_utf8(plaintext) {
                    return Some(text);
                }
            }
        }

        match String::from_utf8(bytes) {
            Ok(text) => {
                trace!(server = %server, "Read plaintext credential file {}", file.file_name());
                Some(text)
            }
            Err(_) => {
                warn!(
                    server = %server,
                    "Credential file {} could not be decrypted; treating it as absent",
                    path.display()
                );
                None
            }
        }
    }

    pub async fn read_json<T: DeserializeOwned>(
        &self,
        server: &str,
        file: CredentialFile,
    ) -> Option<T> {
        let text = self.read(server, file).await?;
        match serde_json::from_str(&text) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(server = %server, "Ignoring malformed {}: {}", file.file_name(), e);
                None
            }
        }
    }

    /// Write a value, replacing the previous file atomically.
    pub async fn write(&self, server: &str, file: CredentialFile, contents: &str) -> Result<()> {
        let dir = self.server_dir(server);
        fs::create_dir_all(&dir).await.map_err(storage_error)?;

        let payload = match &self.cipher {
            Some(cipher) => cipher.encrypt(contents.as_bytes())?,
            None => contents.as_bytes().to_vec(),
        };

        let target = dir.join(file.file_name());
        let temp = dir.join(format!(".{}.{}.tmp", file.file_name(), uuid::Uuid::new_v4()));
        fs::write(&temp, &payload).await.map_err(storage_error)?;
        restrict_permissions(&temp).await;

        if let Err(e) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(storage_error(e));
        }

        trace!(server = %server, "Stored {}", file.file_name());
        Ok(())
    }

    pub async fn write_json<T: Serialize>(
        &self,
        server: &str,
        file: CredentialFile,
        value: &T,
    ) -> Result<()> {
        let text = serde_json::to_string_pretty(value)?;
        self.write(server, file, &text).await
    }

    /// Delete one file. Deleting a missing file is not an error.
    pub async fn delete(&self, server: &str, file: CredentialFile) -> Result<()> {
        match fs::remove_file(self.path(server, file)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error(e)),
        }
    }

    /// Names of the credential files currently stored for `server`.
    pub async fn list_files(&self, server: &str) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(self.server_dir(server)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage_error(e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(storage_error)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    pub async fn invalidate(&self, server: &str, scope: InvalidationScope) -> Result<()> {
        for file in scope.files() {
            self.delete(server, *file).await?;
        }
        debug!(server = %server, "Invalidated credentials ({:?})", scope);
        Ok(())
    }

    /// Remove the whole namespace for `server`.
    pub async fn remove_server(&self, server: &str) -> Result<()> {
        match fs::remove_dir_all(self.server_dir(server)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error(e)),
        }
    }
}

fn storage_error(e: std::io::Error) -> OAuthError {
    OAuthError::Storage(e.to_string())
}

/// Filesystem-safe, collision-free directory name for a server.
fn namespace(server: &str) -> String {
    let sanitized: String = server
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let hash = format!("{:x}", Sha256::digest(server.as_bytes()));
    format!("{}-{}", sanitized, &hash[..8])
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await {
        debug!("Could not restrict permissions on {}: {}", path.display(), e);
    }
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) {}
