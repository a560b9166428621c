//! Server side of the WebSocket opening handshake.

use axum::body::Body;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Method, Response, StatusCode};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

pub const WEBSOCKET_VERSION: &str = "13";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("WebSocket upgrade requires GET, got {0}")]
    Method(String),
    #[error("missing 'Upgrade: websocket' header")]
    MissingUpgrade,
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,
    #[error("unsupported WebSocket version {0:?}")]
    Version(String),
}

/// `Sec-WebSocket-Accept` value for a client key.
pub fn server_accept_key(key: &str) -> String {
    derive_accept_key(key.trim().as_bytes())
}

fn header_has_token(headers: &HeaderMap, name: header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// Whether the request asks for a WebSocket upgrade at all.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    header_has_token(headers, header::UPGRADE, "websocket")
        && header_has_token(headers, header::CONNECTION, "upgrade")
}

/// Check an upgrade request and return the client key.
pub fn validate_request(method: &Method, headers: &HeaderMap) -> Result<String, HandshakeError> {
    if *method != Method::GET {
        return Err(HandshakeError::Method(method.to_string()));
    }
    if !is_websocket_upgrade(headers) {
        return Err(HandshakeError::MissingUpgrade);
    }
    let version = headers
        .get(header::SEC_WEBSOCKET_VERSION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if version.trim() != WEBSOCKET_VERSION {
        return Err(HandshakeError::Version(version.to_string()));
    }
    headers
        .get(header::SEC_WEBSOCKET_KEY)
        .and_then(|v| v.to_str().ok())
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .ok_or(HandshakeError::MissingKey)
}

/// First protocol the client offers that the server supports.
pub fn negotiate_protocol(headers: &HeaderMap, supported: &[String]) -> Option<String> {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .find(|offered| supported.iter().any(|s| s.eq_ignore_ascii_case(offered)))
        .map(str::to_string)
}

/// The `101 Switching Protocols` response for an accepted upgrade.
pub fn switching_protocols(key: &str, protocol: Option<&str>) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    if let Ok(accept) = HeaderValue::from_str(&server_accept_key(key)) {
        headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
    }
    if let Some(protocol) = protocol.and_then(|p| HeaderValue::from_str(p).ok()) {
        headers.insert(header::SEC_WEBSOCKET_PROTOCOL, protocol);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upgrade_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
        headers.insert(
            header::SEC_WEBSOCKET_KEY,
            HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="),
        );
        headers
    }

    #[test]
    fn test_accept_key_rfc_sample() {
        assert_eq!(
            server_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_validate_request() {
        let headers = upgrade_headers();
        assert_eq!(
            validate_request(&Method::GET, &headers).unwrap(),
            "dGhlIHNhbXBsZSBub25jZQ=="
        );
        assert!(matches!(
            validate_request(&Method::POST, &headers),
            Err(HandshakeError::Method(_))
        ));

        let mut old = upgrade_headers();
        old.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("8"));
        assert!(matches!(validate_request(&Method::GET, &old), Err(HandshakeError::Version(_))));

        let mut keyless = upgrade_headers();
        keyless.remove(header::SEC_WEBSOCKET_KEY);
        assert_eq!(validate_request(&Method::GET, &keyless), Err(HandshakeError::MissingKey));
    }

    #[test]
    fn test_protocol_negotiation() {
        let mut headers = upgrade_headers();
        headers.insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("chat, events"));
        let supported = vec!["events".to_string()];
        assert_eq!(negotiate_protocol(&headers, &supported), Some("events".to_string()));
        assert_eq!(negotiate_protocol(&headers, &[]), None);
    }

    #[test]
    fn test_switching_protocols_response() {
        let response = switching_protocols("dGhlIHNhbXBsZSBub25jZQ==", Some("events"));
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(
            response.headers()[header::SEC_WEBSOCKET_ACCEPT],
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
        assert_eq!(response.headers()[header::SEC_WEBSOCKET_PROTOCOL], "events");
    }
}
