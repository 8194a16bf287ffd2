use crate::error::AppError;
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use transfer_core::archive::writer::ExportedArchive;
use transfer_core::archive::ArchiveInfo;
use transfer_core::retention::RetentionResult;
use transfer_core::unlock::UNLOCK_COOKIE;
use transfer_core::{InspectReport, TransferApplyResult, UnlockStatus};

/// Header carrying the operator authenticated upstream.
pub const OPERATOR_HEADER: &str = "x-operator-id";

const COOKIE_PATH: &str = "/api/backups";

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_backups).post(create_backup))
        .route("/purge", post(purge_backups))
        .route(
            "/unlock",
            get(unlock_status).post(unlock).delete(lock),
        )
        .route("/{filename}/inspect", get(inspect_backup))
        .route("/{filename}/download", get(download_backup))
        .route("/{filename}/apply", post(apply_backup))
}

/// Operator identity forwarded by the platform's auth layer.
pub struct Operator(pub String);

impl<S: Send + Sync> FromRequestParts<S> for Operator {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(OPERATOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Operator(v.to_string()))
            .ok_or_else(|| AppError::Unauthorized("Operator authentication required".into()))
    }
}

/// Value of the unlock cookie, if the request carries one.
fn unlock_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == UNLOCK_COOKIE)
        .map(|(_, value)| value.to_string())
}

fn unlock_cookie(value: &str, max_age: i64, secure: bool) -> Result<HeaderValue, AppError> {
    let mut cookie = format!(
        "{}={}; HttpOnly; SameSite=Strict; Path={}; Max-Age={}",
        UNLOCK_COOKIE, value, COOKIE_PATH, max_age
    );
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie).map_err(|e| AppError::Internal(anyhow::anyhow!(e)))
}

async fn list_backups(
    State(state): State<Arc<AppState>>,
    _operator: Operator,
) -> Result<Json<Vec<ArchiveInfo>>, AppError> {
    let transfer = state.transfer.clone();
    let archives = tokio::task::spawn_blocking(move || transfer.list())
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(archives))
}

async fn create_backup(
    State(state): State<Arc<AppState>>,
    Operator(operator): Operator,
) -> Result<(StatusCode, Json<ExportedArchive>), AppError> {
    let transfer = state.transfer.clone();
    let exported = tokio::task::spawn_blocking(move || transfer.export(&operator))
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    Ok((StatusCode::CREATED, Json(exported)))
}

async fn inspect_backup(
    State(state): State<Arc<AppState>>,
    _operator: Operator,
    Path(filename): Path<String>,
) -> Result<Json<InspectReport>, AppError> {
    let transfer = state.transfer.clone();
    let report = tokio::task::spawn_blocking(move || transfer.inspect(&filename))
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(report))
}

async fn download_backup(
    State(state): State<Arc<AppState>>,
    Operator(operator): Operator,
    Path(filename): Path<String>,
) -> Result<Response, AppError> {
    let transfer = state.transfer.clone();
    let info = tokio::task::spawn_blocking(move || transfer.resolve_download(&filename))
        .await
        .map_err(|e| anyhow::anyhow!(e))??;

    let file = match tokio::fs::File::open(info.name.path()).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::NotFound(format!("Archive not found: {}", info.name)));
        }
        Err(e) => return Err(AppError::Internal(e.into())),
    };

    tracing::info!(filename = %info.name, operator = %operator, "Archive download started");

    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", info.name))
        .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
    let headers = [
        (
            header::CONTENT_TYPE,
            HeaderValue::from_static(transfer_core::archive::policy::ARCHIVE_CONTENT_TYPE),
        ),
        (header::CONTENT_DISPOSITION, disposition),
        (header::CONTENT_LENGTH, HeaderValue::from(info.size_bytes)),
    ];
    Ok((headers, Body::from_stream(ReaderStream::new(file))).into_response())
}

async fn apply_backup(
    State(state): State<Arc<AppState>>,
    Operator(operator): Operator,
    Path(filename): Path<String>,
    headers: HeaderMap,
) -> Result<Json<TransferApplyResult>, AppError> {
    let token = unlock_token(&headers);
    let transfer = state.transfer.clone();
    let result = tokio::task::spawn_blocking(move || {
        transfer.apply(&filename, &operator, token.as_deref())
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(result))
}

#[derive(Debug, Default, Deserialize)]
pub struct PurgeRequest {
    pub keep: Option<usize>,
}

async fn purge_backups(
    State(state): State<Arc<AppState>>,
    Operator(operator): Operator,
    body: Bytes,
) -> Result<Json<RetentionResult>, AppError> {
    let request: PurgeRequest = if body.iter().all(u8::is_ascii_whitespace) {
        PurgeRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::BadRequest(format!("Invalid purge request: {}", e)))?
    };

    let transfer = state.transfer.clone();
    let result = tokio::task::spawn_blocking(move || transfer.purge(request.keep, &operator))
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(result))
}

async fn unlock_status(
    State(state): State<Arc<AppState>>,
    _operator: Operator,
    headers: HeaderMap,
) -> Json<UnlockStatus> {
    Json(state.transfer.unlock_status(unlock_token(&headers).as_deref()))
}

async fn unlock(
    State(state): State<Arc<AppState>>,
    Operator(operator): Operator,
) -> Result<Response, AppError> {
    let issued = state.transfer.issue_unlock()?;
    tracing::info!(operator = %operator, "Restore unlocked");

    let cookie = unlock_cookie(
        &issued.token,
        state.transfer.unlock_ttl_secs(),
        state.config.cookie_secure,
    )?;
    let body = Json(json!({ "expiresAt": issued.expires_at }));
    Ok(([(header::SET_COOKIE, cookie)], body).into_response())
}

async fn lock(
    State(state): State<Arc<AppState>>,
    _operator: Operator,
) -> Result<Response, AppError> {
    let cookie = unlock_cookie("", 0, state.config.cookie_secure)?;
    Ok((StatusCode::NO_CONTENT, [(header::SET_COOKIE, cookie)]).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_unlock_token_from_cookie_header() {
        assert_eq!(
            unlock_token(&headers(&[("cookie", "a=1; restore_unlock=abc.def; b=2")])),
            Some("abc.def".to_string())
        );
        assert_eq!(
            unlock_token(&headers(&[("cookie", "a=1"), ("cookie", "restore_unlock=x.y")])),
            Some("x.y".to_string())
        );
        assert_eq!(unlock_token(&headers(&[("cookie", "restore_unlockx=1")])), None);
        assert_eq!(unlock_token(&HeaderMap::new()), None);
    }

    #[test]
    fn test_unlock_cookie_attributes() -> Result<(), AppError> {
        let cookie = unlock_cookie("tok", 600, true)?;
        let cookie = cookie.to_str().unwrap();
        assert!(cookie.starts_with("restore_unlock=tok;"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Strict"));
        assert!(cookie.contains("Path=/api/backups"));
        assert!(cookie.contains("Max-Age=600"));
        assert!(cookie.ends_with("; Secure"));
        Ok(())
    }
}
