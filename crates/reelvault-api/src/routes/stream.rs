//! Range-streaming of source media
//!
//! Admission is per (client IP, scene): parallel ranges for one asset
//! share a slot, and the slot is held until the response body finishes,
//! so it rides the stream as an RAII guard.

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use std::io::SeekFrom;
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use reelvault_core::stream::{
    content_type, parse_range, resolve_range, ResolvedRange, STREAM_BUFFER_SIZE,
};
use reelvault_core::{Error, SceneId};

/// Best client address we can get: X-Forwarded-For from a fronting
/// proxy, else the socket peer.
fn client_ip(headers: &HeaderMap, connect_info: Option<&ConnectInfo<SocketAddr>>) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse().ok())
        .or_else(|| connect_info.map(|info| info.0.ip()))
        .unwrap_or(IpAddr::from([127, 0, 0, 1]))
}

/// GET /stream/:scene_id
async fn stream_scene(
    State(state): State<AppState>,
    Path(scene_id): Path<SceneId>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> ApiResult<Response> {
    let ip = client_ip(&headers, connect_info.as_ref());
    let path = state.paths.path(scene_id).await?;

    // 503 before any file IO when the client is over its budget.
    let slot = state.admission.acquire(ip, scene_id)?;

    let mut file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| Error::internal(format!("cannot open {}: {}", path.display(), e)))?;
    let size = file
        .metadata()
        .await
        .map_err(|e| Error::internal(format!("cannot stat {}: {}", path.display(), e)))?
        .len();

    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_range);

    let resolved = match resolve_range(range, size) {
        Ok(resolved) => resolved,
        Err(Error::RangeUnsatisfiable) => {
            return Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(header::CONTENT_RANGE, format!("bytes */{}", size))
                .body(Body::empty())
                .map_err(|e| ApiError(Error::internal(e.to_string())));
        }
        Err(e) => return Err(e.into()),
    };

    let body_len = resolved.len(size);
    debug!(
        "Streaming: scene={}, ip={}, range={:?}, bytes={}",
        scene_id, ip, resolved, body_len
    );

    if let ResolvedRange::Partial { start, .. } = resolved {
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|e| Error::internal(format!("seek failed: {}", e)))?;
    }

    let reader = file.take(body_len);
    let stream = ReaderStream::with_capacity(reader, STREAM_BUFFER_SIZE);
    // The guard lives inside the stream; the slot frees when the body is
    // fully sent or the client goes away.
    let guarded = stream.map(move |chunk| {
        let _held = &slot;
        chunk
    });

    let mut response = Response::builder()
        .status(if resolved.is_partial() {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        })
        .header(header::CONTENT_TYPE, content_type(&path))
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CACHE_CONTROL, "public, max-age=86400")
        .header(header::CONTENT_LENGTH, body_len);

    if let ResolvedRange::Partial { start, end } = resolved {
        response = response.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, end, size),
        );
    }

    response
        .body(Body::from_stream(guarded))
        .map_err(|e| ApiError(Error::internal(e.to_string())))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/stream/:scene_id", get(stream_scene))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_ip_prefers_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.1.2.3, 172.16.0.1".parse().unwrap());
        let ip = client_ip(&headers, None);
        assert_eq!(ip, IpAddr::from([10, 1, 2, 3]));
    }

    #[test]
    fn test_client_ip_falls_back_to_peer() {
        let headers = HeaderMap::new();
        let peer = ConnectInfo(SocketAddr::from(([192, 168, 1, 5], 4444)));
        assert_eq!(client_ip(&headers, Some(&peer)), IpAddr::from([192, 168, 1, 5]));
    }
}
