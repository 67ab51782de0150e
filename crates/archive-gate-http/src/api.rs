//! Route handlers and wire types
//!
//! Each handler validates its input, then hands off to the gateway, which
//! enforces token, path and role checks before any filesystem access.

use crate::AppState;
use crate::error::ApiError;
use crate::extract::Caller;
use archive_gate::audit::{AuditEntry, AuditOperation};
use archive_gate::gateway::{StatusReport, UploadRequest};
use archive_gate::search::{ContentQuery, FileEntry, SearchMatch};
use archive_gate::{Error, RequestContext};
use axum::{
    Json,
    body::Body,
    extract::{
        Multipart, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{
        Uri,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::Response,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio_util::io::ReaderStream;

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Audit a request rejected before it reached the gateway
fn rejected(
    state: &AppState,
    caller: &RequestContext,
    operation: AuditOperation,
    uri: &Uri,
    detail: String,
) -> ApiError {
    state.gateway.audit().record(
        AuditEntry::new(operation, &caller.origin)
            .resource(uri.path())
            .failed(detail.clone()),
    );
    ApiError::new(Error::invalid(detail), uri.path())
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

// Request types
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoginRequest {
    pub identity: String,
    pub secret: String,
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub path: String,
    pub pattern: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadParams {
    pub file_path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentSearchRequest {
    pub file_path: String,
    pub search_term: String,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default)]
    pub whole_word: bool,
}

// Response types
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub identity: String,
    pub expires_in_seconds: i64,
    pub permissions: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct LogoutResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub files: Vec<FileEntry>,
    pub total_count: usize,
    pub truncated: bool,
    pub search_path: String,
    pub search_pattern: String,
    pub search_time_ms: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentSearchResponse {
    pub matches: Vec<SearchMatch>,
    pub total_matches: usize,
    pub truncated: bool,
    pub skipped_entries: usize,
    pub search_time_ms: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub success: bool,
    pub file_name: String,
    pub target_path: String,
    pub file_size: u64,
    pub uploaded_by: String,
    pub uploaded_at: DateTime<Utc>,
    pub message: String,
}

// Auth handlers
pub async fn login(
    State(state): State<AppState>,
    Caller(caller): Caller,
    uri: Uri,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> ApiResult<LoginResponse> {
    let Json(request) = payload.map_err(|e| {
        rejected(&state, &caller, AuditOperation::LoginFailure, &uri, e.body_text())
    })?;

    let outcome = state
        .gateway
        .login(&caller, &request.identity, &request.secret)
        .await
        .map_err(|e| ApiError::new(e, uri.path()))?;

    Ok(Json(LoginResponse {
        token: outcome.token,
        identity: outcome.identity,
        expires_in_seconds: outcome.expires_in_seconds,
        permissions: outcome.permissions,
    }))
}

pub async fn logout(
    State(state): State<AppState>,
    Caller(caller): Caller,
    uri: Uri,
) -> ApiResult<LogoutResponse> {
    let revoked = state
        .gateway
        .logout(&caller)
        .await
        .map_err(|e| ApiError::new(e, uri.path()))?;

    let message = if revoked {
        "Logged out; token revoked"
    } else {
        "Logged out; token remains valid until it expires"
    };
    Ok(Json(LogoutResponse {
        success: true,
        message: message.to_string(),
    }))
}

pub async fn validate(
    State(state): State<AppState>,
    Caller(caller): Caller,
) -> Json<ValidateResponse> {
    let outcome = state.gateway.validate(&caller).await;
    Json(ValidateResponse {
        valid: outcome.valid,
        identity: outcome.identity,
        remaining_seconds: outcome.remaining_seconds,
        message: outcome.message,
    })
}

// Archive handlers
pub async fn search(
    State(state): State<AppState>,
    Caller(caller): Caller,
    uri: Uri,
    params: Result<Query<SearchParams>, QueryRejection>,
) -> ApiResult<SearchResponse> {
    let Query(params) = params
        .map_err(|e| rejected(&state, &caller, AuditOperation::Search, &uri, e.body_text()))?;

    let started = Instant::now();
    let result = state
        .gateway
        .search_files(&caller, &params.path, &params.pattern)
        .await
        .map_err(|e| ApiError::new(e, uri.path()))?;

    Ok(Json(SearchResponse {
        total_count: result.total_count,
        truncated: result.truncated,
        files: result.entries,
        search_path: result.root.display().to_string(),
        search_pattern: params.pattern,
        search_time_ms: elapsed_ms(started),
    }))
}

/// Quote-safe ASCII file name for content-disposition
fn disposition_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub async fn download(
    State(state): State<AppState>,
    Caller(caller): Caller,
    uri: Uri,
    params: Result<Query<DownloadParams>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(params) = params
        .map_err(|e| rejected(&state, &caller, AuditOperation::Download, &uri, e.body_text()))?;

    let download = state
        .gateway
        .download(&caller, &params.file_path)
        .await
        .map_err(|e| ApiError::new(e, uri.path()))?;

    let disposition = format!(
        "attachment; filename=\"{}\"",
        disposition_name(&download.file_name)
    );

    Response::builder()
        .header(CONTENT_TYPE, download.content_type)
        .header(CONTENT_DISPOSITION, disposition)
        .header(CONTENT_LENGTH, download.size)
        .body(Body::from_stream(ReaderStream::new(download.reader)))
        .map_err(|e| ApiError::new(Error::Internal(e.to_string()), uri.path()))
}

pub async fn content_search(
    State(state): State<AppState>,
    Caller(caller): Caller,
    uri: Uri,
    payload: Result<Json<ContentSearchRequest>, JsonRejection>,
) -> ApiResult<ContentSearchResponse> {
    let Json(request) = payload.map_err(|e| {
        rejected(&state, &caller, AuditOperation::ContentSearch, &uri, e.body_text())
    })?;

    let query = ContentQuery {
        term: request.search_term,
        case_sensitive: request.case_sensitive,
        whole_word: request.whole_word,
    };

    let started = Instant::now();
    let result = state
        .gateway
        .content_search(&caller, &request.file_path, query)
        .await
        .map_err(|e| ApiError::new(e, uri.path()))?;

    Ok(Json(ContentSearchResponse {
        total_matches: result.total_matches,
        truncated: result.truncated,
        skipped_entries: result.skipped_entries,
        matches: result.matches,
        search_time_ms: elapsed_ms(started),
    }))
}

/// Fields of an upload form
#[derive(Debug, Default)]
struct UploadForm {
    file_name: Option<String>,
    data: Option<Bytes>,
    target_path: Option<String>,
    overwrite: bool,
    description: Option<String>,
}

async fn read_upload_form(mut multipart: Multipart) -> Result<UploadForm, String> {
    let mut form = UploadForm::default();
    while let Some(field) = multipart.next_field().await.map_err(|e| e.body_text())? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                form.file_name = field.file_name().map(str::to_string);
                form.data = Some(field.bytes().await.map_err(|e| e.body_text())?);
            }
            Some("targetPath") => {
                form.target_path = Some(field.text().await.map_err(|e| e.body_text())?);
            }
            Some("overwrite") => {
                let value = field.text().await.map_err(|e| e.body_text())?;
                form.overwrite = value.trim().eq_ignore_ascii_case("true");
            }
            Some("description") => {
                form.description = Some(field.text().await.map_err(|e| e.body_text())?);
            }
            _ => {}
        }
    }
    Ok(form)
}

pub async fn upload(
    State(state): State<AppState>,
    Caller(caller): Caller,
    uri: Uri,
    multipart: Result<Multipart, axum::extract::multipart::MultipartRejection>,
) -> ApiResult<UploadResponse> {
    let multipart = multipart
        .map_err(|e| rejected(&state, &caller, AuditOperation::Upload, &uri, e.body_text()))?;
    let form = read_upload_form(multipart)
        .await
        .map_err(|detail| rejected(&state, &caller, AuditOperation::Upload, &uri, detail))?;

    let (Some(file_name), Some(data)) = (form.file_name, form.data) else {
        return Err(rejected(
            &state,
            &caller,
            AuditOperation::Upload,
            &uri,
            "Multipart field \"file\" with a file name is required".to_string(),
        ));
    };

    let outcome = state
        .gateway
        .upload(
            &caller,
            UploadRequest {
                file_name,
                target_path: form.target_path,
                overwrite: form.overwrite,
                description: form.description,
                data,
            },
        )
        .await
        .map_err(|e| ApiError::new(e, uri.path()))?;

    Ok(Json(UploadResponse {
        success: true,
        message: format!("Uploaded {} bytes", outcome.file_size),
        file_name: outcome.file_name,
        target_path: outcome.target_path.display().to_string(),
        file_size: outcome.file_size,
        uploaded_by: outcome.uploaded_by,
        uploaded_at: outcome.uploaded_at,
    }))
}

pub async fn status(
    State(state): State<AppState>,
    Caller(caller): Caller,
    uri: Uri,
) -> ApiResult<StatusReport> {
    state
        .gateway
        .status(&caller)
        .await
        .map(Json)
        .map_err(|e| ApiError::new(e, uri.path()))
}
