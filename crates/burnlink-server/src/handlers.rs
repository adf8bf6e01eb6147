use std::net::SocketAddr;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::{
    blob::{BlobStore, DOWNLOAD_URL_TTL_SECS, UPLOAD_URL_TTL_SECS},
    engine::{Lifecycle, LifecycleError},
    store::model::{
        is_pin_id, is_share_id, AccessMode, ContentType, DraftAccess, DraftContent, Payload,
        RecordDraft, SecretRecord, Ttl, ValidationError, VaultKeys,
    },
    AppState,
};

// ── Errors ───────────────────────────────────────────────────────────────────

/// Everything a handler can fail with, rendered as `{"error", "code"}`.
#[derive(Debug)]
pub enum ApiError {
    Lifecycle(LifecycleError),
    Forbidden(&'static str),
    NotFound,
    Internal(anyhow::Error),
}

impl From<LifecycleError> for ApiError {
    fn from(e: LifecycleError) -> Self {
        Self::Lifecycle(e)
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        Self::Lifecycle(e.into())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e)
    }
}

/// HTTP status for each lifecycle failure.
pub fn status_for(err: &LifecycleError) -> StatusCode {
    match err {
        LifecycleError::Validation(_) => StatusCode::BAD_REQUEST,
        LifecycleError::IncorrectPin { .. } => StatusCode::UNAUTHORIZED,
        LifecycleError::SessionExpired => StatusCode::FORBIDDEN,
        LifecycleError::NotFound => StatusCode::NOT_FOUND,
        LifecycleError::Reserved => StatusCode::CONFLICT,
        LifecycleError::Expired | LifecycleError::AlreadyConsumed => StatusCode::GONE,
        LifecycleError::InvalidState(_) => StatusCode::UNPROCESSABLE_ENTITY,
        LifecycleError::Locked { .. } => StatusCode::LOCKED,
        LifecycleError::IdExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        LifecycleError::StoreUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Lifecycle(LifecycleError::StoreUnavailable(e)) | Self::Internal(e) => {
                internal_error(e)
            }
            Self::Lifecycle(err) => {
                let status = status_for(&err);
                let mut body = json!({"error": err.to_string(), "code": err.code()});
                match &err {
                    LifecycleError::IncorrectPin { attempts_left } => {
                        body["attempts_left"] = json!(attempts_left);
                    }
                    LifecycleError::Locked { retry_after_secs } => {
                        body["retry_after"] = json!(retry_after_secs);
                    }
                    _ => {}
                }
                let mut resp = (status, Json(body)).into_response();
                if let LifecycleError::Locked { retry_after_secs } = err {
                    if let Ok(v) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                        resp.headers_mut().insert(header::RETRY_AFTER, v);
                    }
                }
                resp
            }
            Self::Forbidden(msg) => (
                StatusCode::FORBIDDEN,
                Json(json!({"error": msg, "code": "forbidden"})),
            )
                .into_response(),
            Self::NotFound => (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "not found", "code": "not_found"})),
            )
                .into_response(),
        }
    }
}

fn internal_error(e: anyhow::Error) -> Response {
    tracing::error!(error = %e, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal server error", "code": "internal"})),
    )
        .into_response()
}

type ApiResult<T> = Result<T, ApiError>;

/// Run Argon2 PIN work on the blocking pool.
async fn off_runtime<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> Result<T, LifecycleError> + Send + 'static,
    T: Send + 'static,
{
    let result = tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| anyhow::anyhow!("PIN task failed: {e}"))?;
    Ok(result?)
}

// ── IP extraction ────────────────────────────────────────────────────────────

fn extract_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_owned();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let trimmed = real_ip.trim();
        if !trimmed.is_empty() {
            return trimmed.to_owned();
        }
    }
    addr.ip().to_string()
}

/// Uploader addresses are only ever stored hashed.
fn hash_ip(ip: &str) -> String {
    hex::encode(Sha256::digest(ip.as_bytes()))
}

// ── Id checks ────────────────────────────────────────────────────────────────

/// Any id the server could have issued: a UUID v4 or a six-digit PIN id.
fn check_id(id: &str) -> Result<(), ValidationError> {
    if is_share_id(id) || is_pin_id(id) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid share id"))
    }
}

fn check_pin_id(id: &str) -> Result<(), ValidationError> {
    if is_pin_id(id) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid PIN share id"))
    }
}

// ── Health / stats ───────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

pub async fn stats(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.statistics()?))
}

// ── Create ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    #[serde(default = "default_content_type")]
    pub content_type: ContentType,
    pub file_size: Option<u64>,
    pub encrypted_text: Option<String>,
    pub ttl: Ttl,
    #[serde(default = "default_access_mode")]
    pub access_mode: AccessMode,
    pub salt: Option<String>,
    pub encrypted_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PinCreateRequest {
    #[serde(default = "default_content_type")]
    pub content_type: ContentType,
    pub file_size: Option<u64>,
    pub encrypted_text: Option<String>,
    pub ttl: Ttl,
    pub pin: String,
}

fn default_content_type() -> ContentType {
    ContentType::File
}

fn default_access_mode() -> AccessMode {
    AccessMode::OneTime
}

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    pub file_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_url: Option<String>,
    /// PIN hashing salt, PIN shares only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    pub expires_at: i64,
}

fn draft_content(
    content_type: ContentType,
    file_size: Option<u64>,
    encrypted_text: Option<String>,
) -> Result<DraftContent, ValidationError> {
    match content_type {
        ContentType::File => file_size
            .map(|size| DraftContent::File { size })
            .ok_or_else(|| ValidationError::new("file_size is required for files")),
        ContentType::Text => encrypted_text
            .map(|ciphertext| DraftContent::Text { ciphertext })
            .ok_or_else(|| ValidationError::new("encrypted_text is required for text secrets")),
    }
}

fn created(state: &AppState, record: &SecretRecord) -> ApiResult<CreateResponse> {
    let upload_url = match record.blob_key() {
        Some(key) => Some(state.blobs.issue_put_url(key, UPLOAD_URL_TTL_SECS)?),
        None => None,
    };
    Ok(CreateResponse {
        file_id: record.id.clone(),
        upload_url,
        salt: record.pin.as_ref().map(|p| p.salt.clone()),
        expires_at: record.expires_at,
    })
}

pub async fn create_share(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<CreateRequest>,
) -> ApiResult<impl IntoResponse> {
    let access = match body.access_mode {
        AccessMode::OneTime => DraftAccess::OneTime,
        AccessMode::Multi => DraftAccess::Multi(VaultKeys {
            salt: body.salt.unwrap_or_default(),
            encrypted_key: body.encrypted_key.unwrap_or_default(),
        }),
        AccessMode::Pin => {
            return Err(ValidationError::new("PIN shares are created via /pin-shares").into())
        }
    };
    let draft = RecordDraft {
        content: draft_content(body.content_type, body.file_size, body.encrypted_text)?,
        access,
        ttl_seconds: body.ttl.as_seconds()?,
        ip_hash: Some(hash_ip(&extract_ip(&headers, &addr))),
    };

    let record = state.engine.create(&draft)?;
    Ok((StatusCode::CREATED, Json(created(&state, &record)?)))
}

pub async fn create_pin_share(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<PinCreateRequest>,
) -> ApiResult<impl IntoResponse> {
    let content = draft_content(body.content_type, body.file_size, body.encrypted_text)?;
    let ttl_seconds = body.ttl.as_seconds()?;
    let pin = body.pin;
    let access = off_runtime(move || Lifecycle::pin_access(&pin)).await?;
    let draft = RecordDraft {
        content,
        access,
        ttl_seconds,
        ip_hash: Some(hash_ip(&extract_ip(&headers, &addr))),
    };

    let record = state.engine.create(&draft)?;
    Ok((StatusCode::CREATED, Json(created(&state, &record)?)))
}

// ── Metadata ─────────────────────────────────────────────────────────────────

pub async fn get_share(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    check_id(&id)?;
    let record = state.engine.get(&id)?;
    Ok(Json(record.metadata()))
}

// ── Download ─────────────────────────────────────────────────────────────────

/// Payload handed to a downloader: a short-lived URL for files, ciphertext for text.
#[derive(Debug, Serialize)]
pub struct ContentResponse {
    pub file_id: String,
    pub content_type: ContentType,
    pub file_size: u64,
    pub access_mode: AccessMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_count: Option<u64>,
}

fn content(state: &AppState, record: &SecretRecord) -> ApiResult<ContentResponse> {
    let (download_url, encrypted_text) = match &record.payload {
        Payload::File { blob_key } => (
            Some(state.blobs.issue_get_url(blob_key, DOWNLOAD_URL_TTL_SECS)?),
            None,
        ),
        Payload::Text { ciphertext } => (None, Some(ciphertext.clone())),
    };
    Ok(ContentResponse {
        file_id: record.id.clone(),
        content_type: record.content_type(),
        file_size: record.file_size,
        access_mode: record.access_mode,
        download_url,
        encrypted_text,
        download_count: record.download_count,
    })
}

/// One-time shares are reserved, multi-access shares counted.
pub async fn download_share(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    check_id(&id)?;
    let mode = state.engine.get(&id)?.access_mode;
    let record = match mode {
        AccessMode::Multi => state.engine.vault_increment(&id)?,
        AccessMode::OneTime | AccessMode::Pin => state.engine.reserve(&id)?,
    };
    Ok(Json(content(&state, &record)?))
}

pub async fn confirm_share(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    check_id(&id)?;
    let record = state.engine.confirm_download(&id)?;
    Ok(Json(json!({
        "file_id": record.id,
        "downloaded": record.downloaded,
        "downloaded_at": record.downloaded_at,
    })))
}

// ── PIN ──────────────────────────────────────────────────────────────────────

pub async fn pin_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    check_pin_id(&id)?;
    let session = state.engine.pin_initiate_session(&id)?;
    Ok(Json(json!({
        "file_id": id,
        "attempts_left": session.attempts_left,
        "session_expires": session.session_expires,
    })))
}

#[derive(Deserialize)]
pub struct VerifyRequest {
    pub pin: String,
}

pub async fn pin_verify(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<VerifyRequest>,
) -> ApiResult<impl IntoResponse> {
    check_pin_id(&id)?;
    let engine = state.engine.clone();
    let record = off_runtime(move || engine.pin_verify(&id, &body.pin)).await?;
    Ok(Json(content(&state, &record)?))
}

// ── Report ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ReportRequest {
    pub reason: Option<String>,
}

/// The body is optional; an empty body is a report without a reason.
pub async fn report_share(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    check_id(&id)?;
    let req: ReportRequest = if body.is_empty() {
        ReportRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ValidationError::new(format!("invalid report body: {e}")))?
    };
    let count = state.engine.increment_report_count(&id)?;
    if let Some(reason) = req.reason.as_deref() {
        info!(id = %id, reason, "abuse report reason");
    }
    Ok(Json(json!({
        "message": "report submitted",
        "report_count": count,
    })))
}

// ── Blobs ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SignedQuery {
    pub expires: i64,
    pub signature: String,
}

pub async fn put_blob(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(q): Query<SignedQuery>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    if !state.blobs.verify("PUT", &key, q.expires, &q.signature) {
        warn!(key = %key, "rejected blob upload with bad signature");
        return Err(ApiError::Forbidden("invalid or expired upload URL"));
    }
    state.blobs.write(&key, &body)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_blob(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(q): Query<SignedQuery>,
) -> ApiResult<impl IntoResponse> {
    if !state.blobs.verify("GET", &key, q.expires, &q.signature) {
        return Err(ApiError::Forbidden("invalid or expired download URL"));
    }
    let bytes = state.blobs.read(&key)?.ok_or(ApiError::NotFound)?;
    debug!(key = %key, size = bytes.len(), "served blob");
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    ))
}
