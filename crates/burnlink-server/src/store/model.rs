use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Largest declared file size accepted at creation (500 MiB).
pub const MAX_FILE_SIZE_BYTES: u64 = 524_288_000;
/// Inline ciphertext limit for one-time and PIN text secrets.
pub const MAX_TEXT_LEN: usize = 10_000;
/// Inline ciphertext limit for multi-access (vault) text secrets.
pub const MAX_VAULT_TEXT_LEN: usize = 100_000;
const MAX_VAULT_SALT_LEN: usize = 50;
const MAX_ENCRYPTED_KEY_LEN: usize = 200;

pub const MIN_TTL_MINUTES: u64 = 5;
pub const MAX_TTL_MINUTES: u64 = 10_080;
const TTL_PRESETS: [(&str, i64); 3] = [("1h", 3_600), ("12h", 43_200), ("24h", 86_400)];

/// Rejected input. Never reaches the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    File,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    OneTime,
    Multi,
    Pin,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneTime => "one_time",
            Self::Multi => "multi",
            Self::Pin => "pin",
        }
    }
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the encrypted payload lives. Opaque ciphertext either way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Payload held by the blob store under `blob_key`.
    File { blob_key: String },
    /// Payload carried inline.
    Text { ciphertext: String },
}

/// PIN gate state. The PIN itself is never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct PinState {
    /// Hex Argon2id digest of the PIN.
    pub pin_hash: String,
    /// Hex salt used for `pin_hash`.
    pub salt: String,
    pub attempts_left: u32,
    pub locked_until: Option<i64>,
    pub session_started: Option<i64>,
    pub session_expires: Option<i64>,
}

impl PinState {
    pub fn is_locked(&self, now: i64) -> bool {
        matches!(self.locked_until, Some(until) if until > now)
    }

    /// A lockout was set and has run out.
    pub fn lockout_elapsed(&self, now: i64) -> bool {
        matches!(self.locked_until, Some(until) if until <= now)
    }

    pub fn session_active(&self, now: i64) -> bool {
        matches!(self.session_expires, Some(expires) if expires > now)
    }

    /// Seconds until the lockout ends, zero when not locked.
    pub fn retry_after(&self, now: i64) -> i64 {
        self.locked_until.map(|t| (t - now).max(0)).unwrap_or(0)
    }
}

/// Client-side encryption material for multi-access records. Never interpreted here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct VaultKeys {
    pub salt: String,
    pub encrypted_key: String,
}

/// Stored in redb as bincode-encoded bytes.
/// Only `store::kv::Mutation` changes the consumption fields after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRecord {
    pub id: String,
    pub payload: Payload,
    pub access_mode: AccessMode,
    /// Bytes for files, ciphertext length for text.
    pub file_size: u64,
    /// Unix timestamp (seconds) when the record was created.
    pub created_at: i64,
    /// Absolute expiry, never extended.
    pub expires_at: i64,
    pub downloaded: bool,
    pub downloaded_at: Option<i64>,
    /// Set while a one-time or PIN download is in flight.
    pub reserved_at: Option<i64>,
    /// Multi-access only.
    pub download_count: Option<u64>,
    pub last_downloaded_at: Option<i64>,
    pub report_count: u32,
    /// Hex SHA-256 of the uploader address.
    pub ip_hash: Option<String>,
    pub pin: Option<PinState>,
    pub vault: Option<VaultKeys>,
}

/// Access-mode specific input for a new record.
#[derive(Debug, Clone)]
pub enum DraftAccess {
    OneTime,
    Multi(VaultKeys),
    Pin { pin_hash: String, salt: String },
}

impl DraftAccess {
    pub fn mode(&self) -> AccessMode {
        match self {
            Self::OneTime => AccessMode::OneTime,
            Self::Multi(_) => AccessMode::Multi,
            Self::Pin { .. } => AccessMode::Pin,
        }
    }
}

#[derive(Debug, Clone)]
pub enum DraftContent {
    File { size: u64 },
    Text { ciphertext: String },
}

/// Everything needed to build a record except its id.
#[derive(Debug, Clone)]
pub struct RecordDraft {
    pub content: DraftContent,
    pub access: DraftAccess,
    pub ttl_seconds: i64,
    pub ip_hash: Option<String>,
}

impl SecretRecord {
    /// Validating constructor. `pin_max_attempts` seeds `attempts_left` for PIN records.
    pub fn new(
        id: &str,
        draft: &RecordDraft,
        now: i64,
        pin_max_attempts: u32,
    ) -> Result<Self, ValidationError> {
        if id.is_empty() {
            return Err(ValidationError::new("record id is required"));
        }
        if draft.ttl_seconds <= 0 {
            return Err(ValidationError::new("expiry must be in the future"));
        }

        let mode = draft.access.mode();
        let (payload, file_size) = match &draft.content {
            DraftContent::File { size } => {
                if *size > MAX_FILE_SIZE_BYTES {
                    return Err(ValidationError::new(format!(
                        "file size exceeds maximum limit ({} MB)",
                        MAX_FILE_SIZE_BYTES / 1_048_576
                    )));
                }
                (
                    Payload::File {
                        blob_key: blob_key_for(id),
                    },
                    *size,
                )
            }
            DraftContent::Text { ciphertext } => {
                if ciphertext.is_empty() {
                    return Err(ValidationError::new(
                        "encrypted_text is required for text secrets",
                    ));
                }
                let limit = if mode == AccessMode::Multi {
                    MAX_VAULT_TEXT_LEN
                } else {
                    MAX_TEXT_LEN
                };
                if ciphertext.len() > limit {
                    return Err(ValidationError::new("text secret too large"));
                }
                (
                    Payload::Text {
                        ciphertext: ciphertext.clone(),
                    },
                    ciphertext.len() as u64,
                )
            }
        };
        if file_size == 0 {
            return Err(ValidationError::new("file size must be positive"));
        }

        let (pin, vault, download_count) = match &draft.access {
            DraftAccess::OneTime => (None, None, None),
            DraftAccess::Multi(keys) => {
                validate_vault_keys(keys)?;
                (None, Some(keys.clone()), Some(0))
            }
            DraftAccess::Pin { pin_hash, salt } => {
                if pin_hash.is_empty() || salt.is_empty() {
                    return Err(ValidationError::new("PIN hash and salt are required"));
                }
                let state = PinState {
                    pin_hash: pin_hash.clone(),
                    salt: salt.clone(),
                    attempts_left: pin_max_attempts,
                    locked_until: None,
                    session_started: None,
                    session_expires: None,
                };
                (Some(state), None, None)
            }
        };

        Ok(Self {
            id: id.to_owned(),
            payload,
            access_mode: mode,
            file_size,
            created_at: now,
            expires_at: now + draft.ttl_seconds,
            downloaded: false,
            downloaded_at: None,
            reserved_at: None,
            download_count,
            last_downloaded_at: None,
            report_count: 0,
            ip_hash: draft.ip_hash.clone(),
            pin,
            vault,
        })
    }

    pub fn content_type(&self) -> ContentType {
        match self.payload {
            Payload::File { .. } => ContentType::File,
            Payload::Text { .. } => ContentType::Text,
        }
    }

    pub fn blob_key(&self) -> Option<&str> {
        match &self.payload {
            Payload::File { blob_key } => Some(blob_key),
            Payload::Text { .. } => None,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }

    /// Expired or consumed: eligible for the sweeper.
    pub fn is_finished(&self, now: i64) -> bool {
        self.is_expired(now) || self.downloaded
    }

    pub fn metadata(&self) -> ShareMetadata {
        let available = match self.access_mode {
            AccessMode::Multi => true,
            AccessMode::OneTime | AccessMode::Pin => !self.downloaded,
        };
        ShareMetadata {
            file_id: self.id.clone(),
            content_type: self.content_type(),
            file_size: self.file_size,
            available,
            expires_at: self.expires_at,
            access_mode: self.access_mode,
            salt: self.vault.as_ref().map(|v| v.salt.clone()),
            encrypted_key: self.vault.as_ref().map(|v| v.encrypted_key.clone()),
            download_count: match self.access_mode {
                AccessMode::Multi => Some(self.download_count.unwrap_or(0)),
                _ => None,
            },
        }
    }
}

/// Public view of a record. Never includes PIN material or inline ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareMetadata {
    pub file_id: String,
    pub content_type: ContentType,
    pub file_size: u64,
    pub available: bool,
    pub expires_at: i64,
    pub access_mode: AccessMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_count: Option<u64>,
}

/// Record lifetime as submitted: a preset (`"1h"`, `"12h"`, `"24h"`) or whole minutes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Ttl {
    Preset(String),
    Minutes(u64),
}

impl Ttl {
    pub fn as_seconds(&self) -> Result<i64, ValidationError> {
        match self {
            Self::Preset(p) => TTL_PRESETS
                .iter()
                .find(|(name, _)| name == p)
                .map(|(_, secs)| *secs)
                .ok_or_else(|| {
                    ValidationError::new(format!(
                        "TTL must be one of 1h, 12h, 24h or a number of minutes \
                         ({MIN_TTL_MINUTES}-{MAX_TTL_MINUTES})"
                    ))
                }),
            Self::Minutes(m) if *m < MIN_TTL_MINUTES => Err(ValidationError::new(format!(
                "custom TTL must be at least {MIN_TTL_MINUTES} minutes"
            ))),
            Self::Minutes(m) if *m > MAX_TTL_MINUTES => Err(ValidationError::new(format!(
                "custom TTL cannot exceed {MAX_TTL_MINUTES} minutes (7 days)"
            ))),
            Self::Minutes(m) => Ok(*m as i64 * 60),
        }
    }
}

/// Blob-store key for a file record.
pub fn blob_key_for(id: &str) -> String {
    format!("files/{id}")
}

/// Generate an id for one-time, multi-access and text records (UUID v4).
pub fn new_share_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Lowercase hyphenated UUID v4, the only shape `new_share_id` produces.
pub fn is_share_id(id: &str) -> bool {
    match uuid::Uuid::parse_str(id) {
        Ok(u) => u.get_version_num() == 4 && u.hyphenated().to_string() == id,
        Err(_) => false,
    }
}

/// Six ASCII digits.
pub fn is_pin_id(id: &str) -> bool {
    id.len() == 6 && id.bytes().all(|b| b.is_ascii_digit())
}

fn validate_vault_keys(keys: &VaultKeys) -> Result<(), ValidationError> {
    if keys.salt.is_empty() {
        return Err(ValidationError::new("salt is required for vault access"));
    }
    if keys.salt.len() > MAX_VAULT_SALT_LEN {
        return Err(ValidationError::new("invalid salt format"));
    }
    if keys.encrypted_key.is_empty() {
        return Err(ValidationError::new(
            "encrypted key is required for vault access",
        ));
    }
    if keys.encrypted_key.len() > MAX_ENCRYPTED_KEY_LEN {
        return Err(ValidationError::new("invalid encrypted key format"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_draft(size: u64, access: DraftAccess) -> RecordDraft {
        RecordDraft {
            content: DraftContent::File { size },
            access,
            ttl_seconds: 3600,
            ip_hash: None,
        }
    }

    fn vault() -> VaultKeys {
        VaultKeys {
            salt: "c2FsdHNhbHRzYWx0".into(),
            encrypted_key: "ZW5jcnlwdGVkLWtleQ==".into(),
        }
    }

    #[test]
    fn file_record_gets_blob_key_and_expiry() {
        let r = SecretRecord::new("abc", &file_draft(1024, DraftAccess::OneTime), 1_000, 3).unwrap();
        assert_eq!(r.blob_key(), Some("files/abc"));
        assert_eq!(r.content_type(), ContentType::File);
        assert_eq!(r.expires_at, 4_600);
        assert!(!r.downloaded);
        assert!(r.reserved_at.is_none());
        assert!(r.download_count.is_none());
    }

    #[test]
    fn zero_size_rejected() {
        let err = SecretRecord::new("a", &file_draft(0, DraftAccess::OneTime), 0, 3).unwrap_err();
        assert!(err.0.contains("positive"));
    }

    #[test]
    fn oversized_file_rejected() {
        let draft = file_draft(MAX_FILE_SIZE_BYTES + 1, DraftAccess::OneTime);
        assert!(SecretRecord::new("a", &draft, 0, 3).is_err());
    }

    #[test]
    fn expiry_must_be_in_future() {
        let mut draft = file_draft(10, DraftAccess::OneTime);
        draft.ttl_seconds = 0;
        assert!(SecretRecord::new("a", &draft, 0, 3).is_err());
    }

    #[test]
    fn text_size_is_ciphertext_length() {
        let draft = RecordDraft {
            content: DraftContent::Text {
                ciphertext: "x".repeat(42),
            },
            access: DraftAccess::OneTime,
            ttl_seconds: 60,
            ip_hash: None,
        };
        let r = SecretRecord::new("t", &draft, 0, 3).unwrap();
        assert_eq!(r.file_size, 42);
        assert_eq!(r.content_type(), ContentType::Text);
        assert!(r.blob_key().is_none());
    }

    #[test]
    fn text_limit_is_larger_for_vaults() {
        let text = "x".repeat(MAX_TEXT_LEN + 1);
        let mut draft = RecordDraft {
            content: DraftContent::Text { ciphertext: text },
            access: DraftAccess::OneTime,
            ttl_seconds: 60,
            ip_hash: None,
        };
        assert!(SecretRecord::new("t", &draft, 0, 3).is_err());
        draft.access = DraftAccess::Multi(vault());
        assert!(SecretRecord::new("t", &draft, 0, 3).is_ok());
    }

    #[test]
    fn empty_text_rejected() {
        let draft = RecordDraft {
            content: DraftContent::Text {
                ciphertext: String::new(),
            },
            access: DraftAccess::OneTime,
            ttl_seconds: 60,
            ip_hash: None,
        };
        assert!(SecretRecord::new("t", &draft, 0, 3).is_err());
    }

    #[test]
    fn multi_requires_keys() {
        let mut keys = vault();
        keys.encrypted_key.clear();
        let draft = file_draft(5, DraftAccess::Multi(keys));
        assert!(SecretRecord::new("m", &draft, 0, 3).is_err());

        let r = SecretRecord::new("m", &file_draft(5, DraftAccess::Multi(vault())), 0, 3).unwrap();
        assert_eq!(r.download_count, Some(0));
        assert_eq!(r.access_mode, AccessMode::Multi);
    }

    #[test]
    fn pin_requires_hash_and_salt() {
        let draft = file_draft(
            5,
            DraftAccess::Pin {
                pin_hash: String::new(),
                salt: "aa".into(),
            },
        );
        assert!(SecretRecord::new("123456", &draft, 0, 3).is_err());

        let draft = file_draft(
            5,
            DraftAccess::Pin {
                pin_hash: "bb".into(),
                salt: "aa".into(),
            },
        );
        let r = SecretRecord::new("123456", &draft, 0, 3).unwrap();
        let pin = r.pin.as_ref().unwrap();
        assert_eq!(pin.attempts_left, 3);
        assert!(pin.locked_until.is_none());
        assert!(pin.session_expires.is_none());
    }

    #[test]
    fn metadata_hides_pin_and_reports_vault() {
        let r = SecretRecord::new("m", &file_draft(5, DraftAccess::Multi(vault())), 0, 3).unwrap();
        let meta = r.metadata();
        assert!(meta.available);
        assert_eq!(meta.download_count, Some(0));
        assert!(meta.salt.is_some());

        let mut one = SecretRecord::new("o", &file_draft(5, DraftAccess::OneTime), 0, 3).unwrap();
        one.downloaded = true;
        let meta = one.metadata();
        assert!(!meta.available);
        assert!(meta.salt.is_none());
        assert!(meta.download_count.is_none());
    }

    #[test]
    fn ttl_presets_and_minutes() {
        assert_eq!(Ttl::Preset("1h".into()).as_seconds().unwrap(), 3_600);
        assert_eq!(Ttl::Preset("24h".into()).as_seconds().unwrap(), 86_400);
        assert!(Ttl::Preset("2h".into()).as_seconds().is_err());
        assert_eq!(Ttl::Minutes(5).as_seconds().unwrap(), 300);
        assert!(Ttl::Minutes(4).as_seconds().is_err());
        assert!(Ttl::Minutes(MAX_TTL_MINUTES + 1).as_seconds().is_err());
    }

    #[test]
    fn ttl_deserializes_from_string_or_number() {
        let t: Ttl = serde_json::from_str("\"12h\"").unwrap();
        assert_eq!(t, Ttl::Preset("12h".into()));
        let t: Ttl = serde_json::from_str("30").unwrap();
        assert_eq!(t, Ttl::Minutes(30));
    }

    #[test]
    fn id_shapes() {
        assert!(is_pin_id("012345"));
        assert!(!is_pin_id("12345"));
        assert!(!is_pin_id("12ab34"));
        let id = new_share_id();
        assert!(is_share_id(&id));
        assert!(!is_share_id(&id.to_uppercase()));
        assert!(!is_share_id("not-a-uuid"));
    }

    #[test]
    fn lockout_helpers() {
        let pin = PinState {
            pin_hash: "h".into(),
            salt: "s".into(),
            attempts_left: 0,
            locked_until: Some(100),
            session_started: None,
            session_expires: Some(50),
        };
        assert!(pin.is_locked(99));
        assert!(!pin.is_locked(100));
        assert!(pin.lockout_elapsed(100));
        assert_eq!(pin.retry_after(40), 60);
        assert_eq!(pin.retry_after(200), 0);
        assert!(pin.session_active(49));
        assert!(!pin.session_active(50));
    }
}
