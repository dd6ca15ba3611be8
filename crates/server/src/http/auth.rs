//! HTTP Basic authentication.

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::Response;
use base64::Engine;
use tracing::debug;

use super::{ApiError, AppState};

/// Username and password from an `Authorization: Basic` header.
pub fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (username, password) = text.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Reject unauthenticated requests; otherwise attach the
/// [`Caller`](crate::accounts::Caller) as a request extension.
pub async fn require_caller(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let caller = basic_credentials(request.headers())
        .and_then(|(username, password)| state.accounts.authenticate(&username, &password));

    let Some(caller) = caller else {
        debug!(uri = %request.uri(), "Rejected unauthenticated request");
        return Err(ApiError::Unauthorized);
    };

    request.extensions_mut().insert(caller);
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_basic_credentials() {
        // "alice:s3cr:et"
        let creds = basic_credentials(&headers("Basic YWxpY2U6czNjcjpldA==")).unwrap();
        assert_eq!(creds, ("alice".to_string(), "s3cr:et".to_string()));
    }

    #[test]
    fn test_scheme_is_case_insensitive() {
        assert!(basic_credentials(&headers("basic YWxpY2U6eA==")).is_some());
    }

    #[test]
    fn test_rejects_other_schemes_and_garbage() {
        assert!(basic_credentials(&HeaderMap::new()).is_none());
        assert!(basic_credentials(&headers("Bearer abc")).is_none());
        assert!(basic_credentials(&headers("Basic !!!")).is_none());
        // "nocolon"
        assert!(basic_credentials(&headers("Basic bm9jb2xvbg==")).is_none());
    }
}
