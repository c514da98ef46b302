//! HTTP surface of the storage element.
//!
//! Routes under `/api/v1` sit behind two layers: the leader proxy (write
//! requests reaching a follower are streamed to the leader) and auth
//! (claims extraction + admission). Probes and `/metrics` are mounted
//! outside both.
//!
//! Downloads support a single byte range and checksum-based conditional
//! requests; bodies stream in bounded chunks in both directions.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tracing::info;
use uuid::Uuid;

use crate::attr_store::AttrStore;
use crate::auth::{auth_middleware, AuthContext};
use crate::config::Config;
use crate::election::ElectionState;
use crate::errors::{ApiError, ErrorBody, ErrorKind};
use crate::file_store::FileStore;
use crate::index::{Index, ListFilter};
use crate::metadata::{FileMetadata, FileStatus, RetentionPolicy};
use crate::metrics::Metrics;
use crate::mode::{load_mode_file, ModeFsm, ModeTransition, StorageMode};
use crate::proxy::{leader_proxy_middleware, ForwardClient};
use crate::reconcile::Reconciler;
use crate::service::{FilePatch, StorageInfo, StorageService, UploadRequest};
use crate::wal::Wal;

const DOWNLOAD_CHUNK: usize = 64 * 1024;

pub struct AppState {
    pub service: Arc<StorageService>,
    pub election: Arc<ElectionState>,
    pub forward_client: ForwardClient,
    pub reconciler: Arc<Reconciler>,
    pub metrics: Arc<Metrics>,
    pub config: Arc<Config>,
    pub ready: AtomicBool,
    pub shutting_down: AtomicBool,
}

impl AppState {
    /// Build the whole stack over the configured directories: WAL
    /// recovery, temp-file sweeps and the initial index build happen
    /// here, before any listener exists.
    pub async fn initialize(
        config: Arc<Config>,
        election: Arc<ElectionState>,
    ) -> anyhow::Result<Arc<Self>> {
        crate::attr_store::create_dir_restricted(&config.data_dir).await?;

        let metrics = Arc::new(Metrics::default());
        let file_store = FileStore::new(&config.data_dir);
        let attr_store = AttrStore::new(&config.data_dir);

        let wal = Arc::new(Wal::open(&config.wal_dir).await?);
        let rolled_back = wal.recover().await?;
        Metrics::add(&metrics.wal_recovered, rolled_back as u64);

        let swept = file_store.sweep_temp_files().await? + attr_store.sweep_temp_files().await?;
        if swept > 0 {
            info!(swept, "removed stale temp files from the data directory");
        }

        let index = Arc::new(Index::new());
        index.build_from_store(&attr_store).await?;

        // In replicated mode a published mode.json outranks the local
        // configuration; both roles converge on it.
        let initial_mode = match load_mode_file(&config.mode_file_path()).await {
            Ok(Some(data)) if config.replica_mode == crate::config::ReplicaMode::Replicated => {
                data.mode
            }
            _ => config.mode,
        };
        let fsm = Arc::new(ModeFsm::new(initial_mode));

        let service = Arc::new(StorageService::new(
            &config,
            file_store.clone(),
            attr_store.clone(),
            wal,
            index.clone(),
            fsm,
            metrics.clone(),
        ));

        let reconciler = Reconciler::new(
            file_store,
            attr_store,
            index,
            metrics.clone(),
            config.reconcile_interval,
        );

        let forward_client = ForwardClient::new(
            config.proxy_scheme(),
            config.proxy_tls_verify,
            config.ca_cert.as_deref(),
            config.client_timeout,
        )
        .map_err(|e| anyhow::anyhow!(e))?;

        Ok(Arc::new(AppState {
            service,
            election,
            forward_client,
            reconciler,
            metrics,
            config,
            ready: AtomicBool::new(true),
            shutting_down: AtomicBool::new(false),
        }))
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let upload_limit = state.config.max_file_size.saturating_add(1024 * 1024) as usize;
    // Streaming and maintenance endpoints run unbounded; everything else
    // answers within the configured request timeout.
    let timeout = TimeoutLayer::new(state.config.http_timeout);

    let api = Router::new()
        .route("/files/upload", post(upload_file).layer(DefaultBodyLimit::max(upload_limit)))
        .route("/files", get(list_files).layer(timeout.clone()))
        .route(
            "/files/:id",
            get(get_file)
                .patch(patch_file)
                .delete(delete_file)
                .layer(timeout.clone()),
        )
        .route("/files/:id/download", get(download_file))
        .route("/mode", get(get_mode).layer(timeout.clone()))
        .route("/mode/transition", post(transition_mode).layer(timeout.clone()))
        .route("/maintenance/reconcile", post(run_reconcile))
        .route("/maintenance/reconcile/last", get(last_reconcile))
        .route("/storage/info", get(storage_info).layer(timeout))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            leader_proxy_middleware,
        ));

    Router::new()
        .nest("/api/v1", api)
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/metrics", get(metrics_text))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

// ============================================================================
// File handlers
// ============================================================================

/// POST /api/v1/files/upload
///
/// Multipart form: scalar fields (`retention_policy`, `ttl_days`, `tags`,
/// `description`) must precede the final `file` field; the file part is
/// streamed to disk as it arrives.
async fn upload_file(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    ctx.require_write()?;

    let mut request = UploadRequest {
        uploaded_by: ctx.subject.clone(),
        content_type: "application/octet-stream".into(),
        ..Default::default()
    };

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::validation(format!("malformed multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                request.original_filename = field
                    .file_name()
                    .map(str::to_string)
                    .filter(|n| !n.is_empty())
                    .ok_or_else(|| ApiError::validation("file part carries no filename"))?;
                if let Some(ct) = field.content_type() {
                    request.content_type = ct.to_string();
                }

                let stream = Box::pin(futures::stream::unfold(field, |mut field| async move {
                    match field.chunk().await {
                        Ok(Some(bytes)) => Some((Ok(bytes), field)),
                        Ok(None) => None,
                        Err(e) => Some((Err(e), field)),
                    }
                }));

                let meta = state.service.upload(stream, request).await?;
                return Ok((StatusCode::CREATED, Json(meta)).into_response());
            }
            "retention_policy" => {
                let raw = read_text_field(&mut field).await?;
                request.retention_policy =
                    Some(raw.parse::<RetentionPolicy>().map_err(ApiError::validation)?);
            }
            "ttl_days" => {
                let raw = read_text_field(&mut field).await?;
                request.ttl_days = Some(
                    raw.parse::<u32>()
                        .map_err(|_| ApiError::validation(format!("invalid ttl_days: {raw}")))?,
                );
            }
            "tags" => {
                let raw = read_text_field(&mut field).await?;
                request.tags = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect::<BTreeSet<_>>();
            }
            "description" => {
                let raw = read_text_field(&mut field).await?;
                if !raw.is_empty() {
                    request.description = Some(raw);
                }
            }
            _ => {
                // Unknown parts are drained and ignored.
                while field
                    .chunk()
                    .await
                    .map_err(|e| ApiError::validation(format!("malformed multipart body: {e}")))?
                    .is_some()
                {}
            }
        }
    }

    Err(ApiError::validation("multipart body carries no file part"))
}

async fn read_text_field(field: &mut axum::extract::multipart::Field<'_>) -> Result<String, ApiError> {
    let mut out = String::new();
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| ApiError::validation(format!("malformed multipart body: {e}")))?
    {
        out.push_str(
            std::str::from_utf8(&chunk)
                .map_err(|_| ApiError::validation("form field is not valid UTF-8"))?,
        );
        if out.len() > 4096 {
            return Err(ApiError::validation("form field is too long"));
        }
    }
    Ok(out.trim().to_string())
}

/// GET /api/v1/files/{id}/download
///
/// Supports a single `Range: bytes=a-b` and `If-None-Match` against the
/// checksum ETag.
async fn download_file(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    ctx.require_read()?;
    let (meta, mut file) = state.service.open_download(id).await?;

    let etag = format!("\"{}\"", meta.checksum);
    if let Some(candidate) = headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()) {
        if candidate
            .split(',')
            .map(str::trim)
            .any(|c| c == etag || c == "*")
        {
            return Ok(Response::builder()
                .status(StatusCode::NOT_MODIFIED)
                .header(header::ETAG, &etag)
                .body(Body::empty())
                .unwrap_or_default());
        }
    }

    let range_header = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    if let Some(range_str) = range_header {
        let Some((start, end)) = parse_range_header(range_str, meta.size) else {
            let body = ErrorBody {
                code: ErrorKind::ValidationError,
                message: format!("unsatisfiable range {range_str} for {} bytes", meta.size),
            };
            return Ok((
                StatusCode::RANGE_NOT_SATISFIABLE,
                [(header::CONTENT_RANGE, format!("bytes */{}", meta.size))],
                Json(body),
            )
                .into_response());
        };

        file.seek(std::io::SeekFrom::Start(start))
            .await
            .map_err(|e| ApiError::internal(format!("seek failed: {e}")))?;
        let len = end - start + 1;
        Metrics::add(&state.metrics.bytes_downloaded, len);

        let stream = ReaderStream::with_capacity(file.take(len), DOWNLOAD_CHUNK);
        let response = Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_TYPE, &meta.content_type)
            .header(header::CONTENT_LENGTH, len)
            .header(
                header::CONTENT_RANGE,
                format!("bytes {start}-{end}/{}", meta.size),
            )
            .header(header::ACCEPT_RANGES, "bytes")
            .header(header::ETAG, &etag)
            .body(Body::from_stream(stream))
            .map_err(|e| ApiError::internal(format!("failed to build response: {e}")))?;
        return Ok(response);
    }

    Metrics::add(&state.metrics.bytes_downloaded, meta.size);
    let stream = ReaderStream::with_capacity(file, DOWNLOAD_CHUNK);
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, &meta.content_type)
        .header(header::CONTENT_LENGTH, meta.size)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::ETAG, &etag)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", meta.original_filename),
        )
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::internal(format!("failed to build response: {e}")))?;
    Ok(response)
}

/// Parse `Range: bytes=start-end`.
///
/// `bytes=a-` runs to the end of the file; suffix ranges (`bytes=-n`) are
/// not supported; `end` is clamped to the file size.
fn parse_range_header(range_str: &str, file_size: u64) -> Option<(u64, u64)> {
    let bytes_str = range_str.strip_prefix("bytes=")?;
    if bytes_str.contains(',') {
        return None;
    }
    let (start_str, end_str) = bytes_str.split_once('-')?;

    if start_str.is_empty() {
        return None;
    }
    let start: u64 = start_str.parse().ok()?;

    let end: u64 = if end_str.is_empty() {
        file_size.checked_sub(1)?
    } else {
        end_str.parse().ok()?
    };

    if start > end || start >= file_size {
        return None;
    }

    Some((start, std::cmp::min(end, file_size - 1)))
}

/// GET /api/v1/files/{id}
async fn get_file(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<FileMetadata>, ApiError> {
    ctx.require_read()?;
    Ok(Json(state.service.get_metadata(id).await?))
}

#[derive(Debug, Deserialize)]
struct PatchBody {
    description: Option<String>,
    tags: Option<BTreeSet<String>>,
    status: Option<FileStatus>,
}

/// PATCH /api/v1/files/{id}
async fn patch_file(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    Json(body): Json<PatchBody>,
) -> Result<Json<FileMetadata>, ApiError> {
    ctx.require_write()?;
    let patch = FilePatch {
        description: body.description,
        tags: body.tags,
        status: body.status,
    };
    Ok(Json(state.service.update(id, patch).await?))
}

/// DELETE /api/v1/files/{id}
async fn delete_file(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    ctx.require_write()?;
    state.service.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
    offset: Option<usize>,
    status: Option<String>,
    tag: Option<String>,
    uploaded_by: Option<String>,
}

#[derive(Debug, Serialize)]
struct ListResponse {
    files: Vec<FileMetadata>,
    total: usize,
    limit: usize,
    offset: usize,
}

const DEFAULT_LIST_LIMIT: usize = 100;
const MAX_LIST_LIMIT: usize = 1000;

/// GET /api/v1/files
async fn list_files(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>, ApiError> {
    ctx.require_read()?;

    let status = query
        .status
        .as_deref()
        .map(|s| s.parse::<FileStatus>().map_err(ApiError::validation))
        .transpose()?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .min(MAX_LIST_LIMIT);
    let offset = query.offset.unwrap_or(0);

    let filter = ListFilter {
        status,
        tag: query.tag,
        uploaded_by: query.uploaded_by,
        limit: Some(limit),
        offset,
    };
    let page = state.service.list(&filter).await?;
    Ok(Json(ListResponse {
        files: page.entries,
        total: page.total,
        limit,
        offset,
    }))
}

// ============================================================================
// Mode & maintenance handlers
// ============================================================================

#[derive(Debug, Serialize)]
struct ModeResponse {
    mode: StorageMode,
    history: Vec<ModeTransition>,
}

/// GET /api/v1/mode
async fn get_mode(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<ModeResponse>, ApiError> {
    ctx.require_read()?;
    let fsm = state.service.fsm();
    Ok(Json(ModeResponse {
        mode: fsm.current(),
        history: fsm.history(),
    }))
}

#[derive(Debug, Deserialize)]
struct TransitionRequest {
    target_mode: StorageMode,
    #[serde(default)]
    confirm: bool,
}

/// POST /api/v1/mode/transition
async fn transition_mode(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<TransitionRequest>,
) -> Result<Json<ModeTransition>, ApiError> {
    ctx.require_admin()?;
    let record = state
        .service
        .transition_mode(body.target_mode, body.confirm, &ctx.subject)
        .await?;
    Ok(Json(record))
}

/// POST /api/v1/maintenance/reconcile
async fn run_reconcile(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Response, ApiError> {
    ctx.require_admin()?;
    let report = state
        .reconciler
        .run_once()
        .await
        .map_err(|e| ApiError::internal(format!("reconcile failed: {e}")))?;
    Ok(Json(report).into_response())
}

/// GET /api/v1/maintenance/reconcile/last
async fn last_reconcile(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Response, ApiError> {
    ctx.require_admin()?;
    match state.reconciler.last_report().await {
        Some(report) => Ok(Json(report).into_response()),
        None => Err(ApiError::not_found("no reconciliation has run yet")),
    }
}

#[derive(Debug, Serialize)]
struct StorageInfoResponse {
    #[serde(flatten)]
    info: StorageInfo,
    role: crate::election::Role,
    is_leader: bool,
    leader_addr: String,
}

/// GET /api/v1/storage/info
async fn storage_info(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<StorageInfoResponse>, ApiError> {
    ctx.require_read()?;
    Ok(Json(StorageInfoResponse {
        info: state.service.storage_info().await,
        role: state.election.role(),
        is_leader: state.election.is_leader(),
        leader_addr: state.election.leader_addr(),
    }))
}

// ============================================================================
// Probes
// ============================================================================

/// GET /health/live
async fn health_live() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /health/ready
async fn health_ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let ready = state.ready.load(Ordering::SeqCst) && !state.shutting_down.load(Ordering::SeqCst);
    if ready {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// GET /metrics
async fn metrics_text(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.render_text(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_parsing_matches_contract() {
        // Standard range.
        assert_eq!(parse_range_header("bytes=0-99", 1024), Some((0, 99)));
        // Open-ended range.
        assert_eq!(parse_range_header("bytes=1000-", 2000), Some((1000, 1999)));
        // End clamped to the file size.
        assert_eq!(parse_range_header("bytes=0-99", 17), Some((0, 16)));
        // Suffix and multi ranges are unsupported.
        assert_eq!(parse_range_header("bytes=-500", 1000), None);
        assert_eq!(parse_range_header("bytes=0-1,5-9", 1000), None);
        // Out of bounds.
        assert_eq!(parse_range_header("bytes=2000-", 1000), None);
        assert_eq!(parse_range_header("bytes=5-2", 1000), None);
        // Zero-length file has no satisfiable range.
        assert_eq!(parse_range_header("bytes=0-", 0), None);
        // Not a byte range at all.
        assert_eq!(parse_range_header("lines=0-5", 1000), None);
    }
}
