//! Request middleware: correlation ids, the internal token check, and the
//! idempotency gate in front of the catalog upsert route.

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body, Bytes},
    extract::{Request, State},
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use futures::{future, stream, StreamExt};
use http_body_util::BodyExt;
use refsync_core::MAX_IDEMPOTENCY_KEY_LEN;
use refsync_storage::StoreError;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::AppState;

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";
pub const INTERNAL_TOKEN_HEADER: &str = "x-internal-token";
pub const IDEMPOTENCY_KEY_HEADER: &str = "x-idempotency-key";
pub const IDEMPOTENT_REPLAY_HEADER: &str = "x-idempotent-replay";

/// Route whose writes are deduplicated by idempotency key.
pub const IDEMPOTENT_ROUTE: &str = "/internal/upsert/items";
pub const INTERNAL_PREFIX: &str = "/internal";

/// Largest body the gate buffers before fingerprinting.
pub const MAX_GATED_BODY_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationId(pub String);

/// Segment-aware, case-insensitive prefix match: `/internal` covers
/// `/internal` and `/internal/x` but not `/internals`.
pub fn starts_with_segments(path: &str, prefix: &str) -> bool {
    let Some(head) = path.get(..prefix.len()) else {
        return false;
    };
    head.eq_ignore_ascii_case(prefix)
        && matches!(path.as_bytes().get(prefix.len()), None | Some(b'/'))
}

pub(crate) fn json_error(
    status: StatusCode,
    message: impl Into<String>,
    correlation_id: Option<&CorrelationId>,
) -> Response {
    let body = json!({
        "message": message.into(),
        "correlationId": correlation_id.map(|c| c.0.as_str()),
    });
    (status, Json(body)).into_response()
}

pub async fn correlation_id(mut request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
    request.extensions_mut().insert(CorrelationId(id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(CORRELATION_ID_HEADER, value);
    }
    response
}

pub async fn internal_token(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if !starts_with_segments(request.uri().path(), INTERNAL_PREFIX) {
        return next.run(request).await;
    }
    if state.internal_token.trim().is_empty() {
        warn!(path = %request.uri().path(), "internal call rejected: no token configured");
        return (StatusCode::UNAUTHORIZED, "Internal token not configured.").into_response();
    }
    let provided = request
        .headers()
        .get(INTERNAL_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    if provided != Some(state.internal_token.as_str()) {
        warn!(path = %request.uri().path(), "internal call rejected: bad token");
        return (StatusCode::UNAUTHORIZED, "Invalid internal token.").into_response();
    }
    next.run(request).await
}

/// The idempotency key, when this request is one the gate applies to.
fn gated_key(request: &Request) -> Option<String> {
    if !matches!(*request.method(), Method::POST | Method::PUT | Method::PATCH) {
        return None;
    }
    let is_json = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("application/json"));
    if !is_json || !starts_with_segments(request.uri().path(), IDEMPOTENT_ROUTE) {
        return None;
    }
    request
        .headers()
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .map(ToString::to_string)
}

fn replay(body: String) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/json"),
            (HeaderName::from_static(IDEMPOTENT_REPLAY_HEADER), "true"),
        ],
        body,
    )
        .into_response()
}

enum Buffered {
    Complete(Bytes),
    /// The cap was crossed; the body is rebuilt from the bytes read so far
    /// followed by the unread remainder.
    Overflow(Body),
}

async fn buffer_capped(mut body: Body, cap: usize) -> Result<Buffered, axum::Error> {
    let mut buf = Vec::new();
    while let Some(frame) = body.frame().await {
        let Ok(data) = frame?.into_data() else {
            continue;
        };
        buf.extend_from_slice(&data);
        if buf.len() > cap {
            let head = stream::once(future::ready(Ok::<_, axum::Error>(Bytes::from(buf))));
            return Ok(Buffered::Overflow(Body::from_stream(
                head.chain(body.into_data_stream()),
            )));
        }
    }
    Ok(Buffered::Complete(Bytes::from(buf)))
}

/// Replays, rejects, or runs a keyed write, then records the first
/// successful response under its key.
pub async fn idempotency_gate(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(key) = gated_key(&request) else {
        return next.run(request).await;
    };
    let correlation = request.extensions().get::<CorrelationId>().cloned();

    if key.chars().count() > MAX_IDEMPOTENCY_KEY_LEN {
        return json_error(
            StatusCode::BAD_REQUEST,
            format!("Idempotency key longer than {MAX_IDEMPOTENCY_KEY_LEN} characters."),
            correlation.as_ref(),
        );
    }

    let declared = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.is_some_and(|len| len > MAX_GATED_BODY_BYTES as u64) {
        debug!(%key, "body above the idempotency buffer cap; not gated");
        return next.run(request).await;
    }

    let (parts, body) = request.into_parts();
    let payload = match buffer_capped(body, MAX_GATED_BODY_BYTES).await {
        Ok(Buffered::Complete(bytes)) => bytes,
        Ok(Buffered::Overflow(body)) => {
            debug!(%key, "body outgrew the idempotency buffer cap; not gated");
            return next.run(Request::from_parts(parts, body)).await;
        }
        Err(err) => {
            warn!(%key, error = %err, "could not read keyed request body");
            return json_error(
                StatusCode::BAD_REQUEST,
                "Request body could not be read.",
                correlation.as_ref(),
            );
        }
    };

    match state.services.idempotency.check(&key, &payload).await {
        Ok(check) if check.exists && !check.same_payload => {
            warn!(%key, "idempotency key reused with a different payload");
            return json_error(
                StatusCode::CONFLICT,
                format!("Idempotency key '{key}' already used with a different payload."),
                correlation.as_ref(),
            );
        }
        Ok(check) if check.exists => {
            if let Some(prior) = check.prior_response {
                info!(%key, "replaying stored response");
                return replay(prior);
            }
        }
        Ok(_) => {}
        Err(err) => {
            error!(%key, error = %err, "idempotency lookup failed");
            return json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Idempotency store unavailable.",
                correlation.as_ref(),
            );
        }
    }

    let response = next
        .run(Request::from_parts(parts, Body::from(payload.clone())))
        .await;
    if !response.status().is_success() {
        return response;
    }

    let (parts, body) = response.into_parts();
    let produced = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => {
            error!(%key, error = %err, "could not buffer response body");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let stored = String::from_utf8_lossy(&produced).into_owned();
    match state.services.idempotency.save(&key, &payload, Some(stored)).await {
        Ok(()) => debug!(%key, "idempotency record saved"),
        Err(StoreError::DuplicateKey(_)) => debug!(%key, "idempotency record already present"),
        Err(err) => warn!(%key, error = %err, "could not save idempotency record"),
    }
    Response::from_parts(parts, Body::from(produced))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_prefix_matching() {
        assert!(starts_with_segments("/internal", "/internal"));
        assert!(starts_with_segments("/internal/upsert/tags", "/internal"));
        assert!(starts_with_segments("/Internal/Upsert/Items", IDEMPOTENT_ROUTE));
        assert!(!starts_with_segments("/internals", "/internal"));
        assert!(!starts_with_segments("/api/status", "/internal"));
        assert!(!starts_with_segments("/in", "/internal"));
    }
}
