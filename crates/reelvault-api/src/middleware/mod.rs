//! Subject resolution
//!
//! The handlers receive an already-resolved `Subject`; this middleware is
//! the only translator from transport auth to that subject. Credentials
//! ride a cookie or the Authorization header. A token in the query
//! string is rejected outright so it can never leak into access logs.

use axum::extract::Request;
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::ApiError;
use reelvault_core::{Error, Subject};

const FORBIDDEN_QUERY_KEYS: [&str; 4] = ["token", "apikey", "api_key", "access_token"];

/// Attach the resolved `Subject` to the request
pub async fn resolve_subject(mut request: Request, next: Next) -> Response {
    if let Some(query) = request.uri().query() {
        if query_carries_credentials(query) {
            return ApiError(Error::validation(
                "credentials are not accepted in the query string; use a cookie or header",
            ))
            .into_response();
        }
    }

    let subject = subject_from_headers(&request);
    request.extensions_mut().insert(subject);
    next.run(request).await
}

fn query_carries_credentials(query: &str) -> bool {
    query.split('&').any(|pair| {
        let key = pair.split('=').next().unwrap_or("");
        FORBIDDEN_QUERY_KEYS
            .iter()
            .any(|forbidden| key.eq_ignore_ascii_case(forbidden))
    })
}

fn subject_from_headers(request: &Request) -> Subject {
    if let Some(cookie_header) = request
        .headers()
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
    {
        for cookie in cookie_header.split(';') {
            if let Some((name, value)) = cookie.trim().split_once('=') {
                if name == "session" && !value.is_empty() {
                    return Subject::new(value);
                }
            }
        }
    }

    if let Some(bearer) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
    {
        if !bearer.is_empty() {
            return Subject::new(bearer);
        }
    }

    Subject::anonymous()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_credential_detection() {
        assert!(query_carries_credentials("token=abc"));
        assert!(query_carries_credentials("page=2&ApiKey=xyz"));
        assert!(query_carries_credentials("access_token=1"));
        assert!(!query_carries_credentials("page=2&limit=10"));
        assert!(!query_carries_credentials("status=pending"));
    }
}
