//! Payload storage behind short-lived signed URLs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::clock::Clock;

type HmacSha256 = Hmac<Sha256>;

/// Lifetime of an upload URL handed out at creation.
pub const UPLOAD_URL_TTL_SECS: i64 = 900;
/// Lifetime of a download URL handed out after a successful reservation.
pub const DOWNLOAD_URL_TTL_SECS: i64 = 300;

const KEY_FILE: &str = "blob.key";

pub trait BlobStore: Send + Sync {
    fn issue_put_url(&self, key: &str, ttl_secs: i64) -> Result<String>;
    fn issue_get_url(&self, key: &str, ttl_secs: i64) -> Result<String>;
    /// Deleting a blob that does not exist succeeds.
    fn delete(&self, key: &str) -> Result<()>;
}

/// Blobs as files under `<data_dir>/blobs`, served by the `/blobs` routes.
pub struct LocalBlobStore {
    root: PathBuf,
    public_url: String,
    signing_key: Zeroizing<[u8; 32]>,
    clock: Arc<dyn Clock>,
}

impl LocalBlobStore {
    pub fn new(root: PathBuf, public_url: &str, signing_key: [u8; 32], clock: Arc<dyn Clock>) -> Self {
        Self {
            root,
            public_url: public_url.trim_end_matches('/').to_owned(),
            signing_key: Zeroizing::new(signing_key),
            clock,
        }
    }

    /// Open the blob directory inside `data_dir`, creating the signing key on first use.
    pub fn open(data_dir: &Path, public_url: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        let root = data_dir.join("blobs");
        std::fs::create_dir_all(&root).context("create blob dir")?;
        let key = load_or_create_key(data_dir)?;
        Ok(Self::new(root, public_url, key, clock))
    }

    /// Check a URL signature for `method` on `key`. Expired URLs never verify.
    pub fn verify(&self, method: &str, key: &str, expires: i64, signature: &str) -> bool {
        if expires <= self.clock.now() {
            return false;
        }
        let Ok(sig) = hex::decode(signature) else {
            return false;
        };
        match self.mac(method, key, expires) {
            Ok(mac) => mac.verify_slice(&sig).is_ok(),
            Err(_) => false,
        }
    }

    pub fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("create blob parent dir")?;
        }
        std::fs::write(&path, bytes).with_context(|| format!("write blob {key}"))?;
        debug!(key, size = bytes.len(), "stored blob");
        Ok(())
    }

    pub fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read blob {key}")),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn mac(&self, method: &str, key: &str, expires: i64) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.signing_key.as_slice())
            .map_err(|e| anyhow::anyhow!("hmac key: {e}"))?;
        mac.update(method.as_bytes());
        mac.update(b"\n");
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }

    fn signed_url(&self, method: &str, key: &str, ttl_secs: i64) -> Result<String> {
        validate_key(key)?;
        let expires = self.clock.now() + ttl_secs;
        let signature = hex::encode(self.mac(method, key, expires)?.finalize().into_bytes());
        Ok(format!(
            "{}/blobs/{key}?expires={expires}&signature={signature}",
            self.public_url
        ))
    }
}

impl BlobStore for LocalBlobStore {
    fn issue_put_url(&self, key: &str, ttl_secs: i64) -> Result<String> {
        self.signed_url("PUT", key, ttl_secs)
    }

    fn issue_get_url(&self, key: &str, ttl_secs: i64) -> Result<String> {
        self.signed_url("GET", key, ttl_secs)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(key, "deleted blob");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("delete blob {key}")),
        }
    }
}

/// Keys look like `files/<id>` with an id of ASCII letters, digits and hyphens.
fn validate_key(key: &str) -> Result<()> {
    let valid = key.strip_prefix("files/").is_some_and(|id| {
        !id.is_empty() && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    });
    if !valid {
        anyhow::bail!("invalid blob key: {key:?}");
    }
    Ok(())
}

fn load_or_create_key(data_dir: &Path) -> Result<[u8; 32]> {
    let key_path = data_dir.join(KEY_FILE);
    if key_path.exists() {
        let bytes = std::fs::read(&key_path).context("read blob.key")?;
        bytes.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!(
                "blob.key is corrupt (expected 32 bytes, got {})",
                bytes.len()
            )
        })
    } else {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        std::fs::write(&key_path, key).context("write blob.key")?;
        info!("generated new blob signing key");
        Ok(key)
    }
}
