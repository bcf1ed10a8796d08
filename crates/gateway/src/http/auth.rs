//! Thin bearer-token check (§4.M): a constant-time comparison against the
//! configured shared secret. Real authorization/identity decisions are an
//! external collaborator's concern; this only gates the request.

use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use common::crypto::constant_time_eq;

use crate::config::settings;

fn extract_bearer(req: &Request) -> Option<String> {
    req.headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

pub async fn require_bearer(req: Request, next: Next) -> Result<Response, StatusCode> {
    let token = extract_bearer(&req).ok_or(StatusCode::UNAUTHORIZED)?;
    if !constant_time_eq(token.as_bytes(), settings().bearer_secret.as_bytes()) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

/// WS auth takes the token from `?token=` (query) or the
/// `Sec-WebSocket-Protocol` sub-protocol header, since browsers cannot set
/// arbitrary headers on the upgrade request.
pub fn token_is_valid(token: Option<&str>) -> bool {
    match token {
        Some(t) => constant_time_eq(t.as_bytes(), settings().bearer_secret.as_bytes()),
        None => false,
    }
}

/// Pull the bearer token out of the `Sec-WebSocket-Protocol` header, the
/// fallback auth channel for WS clients that can't set a query string
/// (the header is conventionally `bearer, <token>`).
pub fn token_from_protocol_header(req: &axum::extract::Request) -> Option<String> {
    req.headers()
        .get(axum::http::header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').map(str::trim).find(|p| *p != "bearer"))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_token() {
        assert!(!token_is_valid(None));
    }
}
