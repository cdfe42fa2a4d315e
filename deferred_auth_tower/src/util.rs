//! Utilities for generating HTTP responses on authentication failures

use http::{header, HeaderValue, Response, StatusCode};

const INVALID_CREDENTIALS: &str = r#"Basic error="invalid_credentials""#;

/// Build a `401 Unauthorized` response with the appropriate `www-authenticate`
/// header
///
/// The description provided will be automatically escaped to make sure it
/// is header-friendly.
///
/// The prepared response will have the form:
///
/// ```http
/// HTTP/1.1 401 Unauthorized
/// www-authenticate: Basic error="invalid_credentials" error_description="{description}"
/// ```
///
/// `error_description` is omitted if `description` is empty.
pub fn unauthorized<Body: Default>(description: &str) -> Response<Body> {
    let mut resp = Response::new(Body::default());
    *resp.status_mut() = StatusCode::UNAUTHORIZED;
    resp.headers_mut()
        .insert(header::WWW_AUTHENTICATE, invalid_credentials(description));
    resp
}

/// Build an empty `500 Internal Server Error` response
pub fn internal_server_error<Body: Default>() -> Response<Body> {
    let mut resp = Response::new(Body::default());
    *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    resp
}

fn invalid_credentials(description: &str) -> HeaderValue {
    if description.is_empty() {
        return HeaderValue::from_static(INVALID_CREDENTIALS);
    }

    // `escape_default` only produces printable ASCII
    HeaderValue::try_from(format!(
        r#"{INVALID_CREDENTIALS} error_description="{}""#,
        description.escape_default()
    ))
    .unwrap_or_else(|_| HeaderValue::from_static(INVALID_CREDENTIALS))
}
