//! WebSocket HTTP upgrade handling.
//!
//! Validates incoming upgrade requests per RFC 6455, applies the optional
//! origin check, resolves the client identity, and builds the switching
//! response. After the `101` has been written the caller hands the raw IO
//! stream to [`Upgrader::complete`] to wrap it as a server-side WebSocket
//! with the hub's protocol limits applied.

use base64::Engine;
use http::{header, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Bytes;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::client::ClientId;
use crate::config::HubConfig;
use crate::error::{HubError, HubResult};

/// The WebSocket magic GUID used in the handshake.
const HANDSHAKE_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Header a client may use to supply its own id at upgrade time.
pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// Query parameter fallback for the client id.
pub const CLIENT_ID_PARAM: &str = "client_id";

/// Performs the server side of the WebSocket handshake.
#[derive(Debug, Clone)]
pub struct Upgrader {
    config: HubConfig,
}

/// Outcome of negotiating an upgrade request.
///
/// Always carries a response to send; `accepted` tells the caller whether
/// the connection should then be handed to [`Upgrader::complete`].
#[derive(Debug)]
pub struct Negotiation {
    /// The HTTP response to send to the client.
    pub response: Response<Full<Bytes>>,
    /// The resolved client identity, present only on acceptance.
    pub client_id: Option<ClientId>,
    /// Whether the handshake was accepted.
    pub accepted: bool,
}

impl Upgrader {
    /// Create an upgrader with the given hub configuration.
    pub fn new(config: HubConfig) -> Self {
        Self { config }
    }

    /// The configuration this upgrader applies.
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Check whether a request looks like a WebSocket upgrade at all.
    ///
    /// A valid upgrade request must have:
    /// - `Connection: Upgrade` header
    /// - `Upgrade: websocket` header
    /// - `Sec-WebSocket-Key` header
    /// - `Sec-WebSocket-Version: 13` header
    pub fn is_upgrade_request<B>(request: &Request<B>) -> bool {
        has_upgrade_connection(request)
            && has_websocket_upgrade(request)
            && websocket_key(request).is_some()
            && has_websocket_version(request)
    }

    /// Validate an upgrade request and compute the accept key.
    pub fn validate<B>(&self, request: &Request<B>) -> HubResult<String> {
        if !has_upgrade_connection(request) {
            return Err(HubError::upgrade_rejected(
                "missing Connection: Upgrade header",
            ));
        }
        if !has_websocket_upgrade(request) {
            return Err(HubError::upgrade_rejected(
                "missing Upgrade: websocket header",
            ));
        }
        let key = websocket_key(request)
            .ok_or_else(|| HubError::upgrade_rejected("missing Sec-WebSocket-Key header"))?;
        if !has_websocket_version(request) {
            return Err(HubError::upgrade_rejected(
                "missing or invalid Sec-WebSocket-Version header (must be 13)",
            ));
        }
        if !self.check_origin(request) {
            return Err(HubError::upgrade_rejected("origin not allowed"));
        }
        Ok(compute_accept_key(key))
    }

    /// Negotiate an upgrade: validate the request and build the response.
    ///
    /// On acceptance the response is a `101 Switching Protocols` carrying
    /// the accept key, and the client identity is resolved from the
    /// request (header, then query parameter) or freshly generated. Origin
    /// rejections answer `403`; every other validation failure answers
    /// `400` with the reason in the body.
    pub fn negotiate<B>(&self, request: &Request<B>) -> Negotiation {
        match self.validate(request) {
            Ok(accept_key) => {
                let client_id = client_identity(request).unwrap_or_else(ClientId::generate);
                Negotiation {
                    response: switching_response(&accept_key),
                    client_id: Some(client_id),
                    accepted: true,
                }
            }
            Err(e) => {
                debug!(error = %e, "upgrade rejected");
                let status = if e.to_string().contains("origin") {
                    StatusCode::FORBIDDEN
                } else {
                    StatusCode::BAD_REQUEST
                };
                Negotiation {
                    response: rejection_response(status, &e.to_string()),
                    client_id: None,
                    accepted: false,
                }
            }
        }
    }

    /// Apply the configured origin check, if any. A missing `Origin`
    /// header is passed to the predicate as an empty string.
    fn check_origin<B>(&self, request: &Request<B>) -> bool {
        let Some(check) = self.config.origin_check.as_ref() else {
            return true;
        };
        let origin = request
            .headers()
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        check(origin)
    }

    /// Wrap an already-upgraded IO stream as a server-side WebSocket.
    ///
    /// Call after the `101` response has been written to the peer.
    pub async fn complete<S>(&self, stream: S) -> WebSocketStream<S>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        WebSocketStream::from_raw_socket(stream, Role::Server, Some(self.protocol_config())).await
    }

    /// Translate hub settings into the protocol-level limits.
    fn protocol_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.read_buffer_size = self.config.read_buffer_size;
        config.write_buffer_size = self.config.write_buffer_size;
        config.max_message_size = Some(self.config.max_message_size);
        config.max_frame_size = Some(self.config.max_message_size);
        config
    }
}

/// Resolve the client identity a request carries, if any.
///
/// The `x-client-id` header wins over the `client_id` query parameter.
pub fn client_identity<B>(request: &Request<B>) -> Option<ClientId> {
    let from_header = request
        .headers()
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(ClientId::from);
    if from_header.is_some() {
        return from_header;
    }

    request.uri().query().and_then(|query| {
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(name, value)| *name == CLIENT_ID_PARAM && !value.is_empty())
            .map(|(_, value)| ClientId::from(value))
    })
}

fn has_upgrade_connection<B>(request: &Request<B>) -> bool {
    request
        .headers()
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false)
}

fn has_websocket_upgrade<B>(request: &Request<B>) -> bool {
    request
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

fn has_websocket_version<B>(request: &Request<B>) -> bool {
    request
        .headers()
        .get("sec-websocket-version")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "13")
        .unwrap_or(false)
}

fn websocket_key<B>(request: &Request<B>) -> Option<&str> {
    request
        .headers()
        .get("sec-websocket-key")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// Compute the Sec-WebSocket-Accept value from the key.
fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(HANDSHAKE_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

fn switching_response(accept_key: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket")
        .header("Sec-WebSocket-Accept", accept_key)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

fn rejection_response(status: StatusCode, reason: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(reason.to_string())))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_upgrade_request() -> Request<()> {
        Request::builder()
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
            .header("Sec-WebSocket-Version", "13")
            .body(())
            .unwrap()
    }

    #[test]
    fn test_is_upgrade_request_valid() {
        assert!(Upgrader::is_upgrade_request(&make_upgrade_request()));
    }

    #[test]
    fn test_is_upgrade_request_missing_connection() {
        let request = Request::builder()
            .header(header::UPGRADE, "websocket")
            .header("Sec-WebSocket-Key", "key")
            .header("Sec-WebSocket-Version", "13")
            .body(())
            .unwrap();
        assert!(!Upgrader::is_upgrade_request(&request));
    }

    #[test]
    fn test_is_upgrade_request_wrong_version() {
        let request = Request::builder()
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .header("Sec-WebSocket-Key", "key")
            .header("Sec-WebSocket-Version", "12")
            .body(())
            .unwrap();
        assert!(!Upgrader::is_upgrade_request(&request));
    }

    #[test]
    fn test_compute_accept_key() {
        // RFC 6455 example
        let accept = compute_accept_key("dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_negotiate_success() {
        let upgrader = Upgrader::new(HubConfig::default());
        let negotiation = upgrader.negotiate(&make_upgrade_request());
        assert!(negotiation.accepted);
        assert_eq!(
            negotiation.response.status(),
            StatusCode::SWITCHING_PROTOCOLS
        );
        assert_eq!(
            negotiation
                .response
                .headers()
                .get("Sec-WebSocket-Accept")
                .unwrap(),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
        assert!(negotiation.client_id.is_some());
    }

    #[test]
    fn test_negotiate_missing_key_is_bad_request() {
        let upgrader = Upgrader::new(HubConfig::default());
        let request = Request::builder()
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .header("Sec-WebSocket-Version", "13")
            .body(())
            .unwrap();

        let negotiation = upgrader.negotiate(&request);
        assert!(!negotiation.accepted);
        assert_eq!(negotiation.response.status(), StatusCode::BAD_REQUEST);
        assert!(negotiation.client_id.is_none());
    }

    #[test]
    fn test_negotiate_rejected_origin_is_forbidden() {
        let config = HubConfig::new().origin_check(|origin| origin == "https://app.example.com");
        let upgrader = Upgrader::new(config);

        let request = Request::builder()
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
            .header("Sec-WebSocket-Version", "13")
            .header(header::ORIGIN, "https://evil.test")
            .body(())
            .unwrap();

        let negotiation = upgrader.negotiate(&request);
        assert!(!negotiation.accepted);
        assert_eq!(negotiation.response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_negotiate_allowed_origin() {
        let config = HubConfig::new().origin_check(|origin| origin == "https://app.example.com");
        let upgrader = Upgrader::new(config);

        let request = Request::builder()
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
            .header("Sec-WebSocket-Version", "13")
            .header(header::ORIGIN, "https://app.example.com")
            .body(())
            .unwrap();

        assert!(upgrader.negotiate(&request).accepted);
    }

    #[test]
    fn test_origin_check_sees_missing_header_as_empty() {
        let config = HubConfig::new().origin_check(str::is_empty);
        let upgrader = Upgrader::new(config);
        assert!(upgrader.negotiate(&make_upgrade_request()).accepted);
    }

    #[test]
    fn test_client_identity_from_header() {
        let request = Request::builder()
            .header(CLIENT_ID_HEADER, "client-7")
            .body(())
            .unwrap();
        assert_eq!(client_identity(&request), Some(ClientId::new("client-7")));
    }

    #[test]
    fn test_client_identity_from_query() {
        let request = Request::builder()
            .uri("/ws?client_id=client-9&v=2")
            .body(())
            .unwrap();
        assert_eq!(client_identity(&request), Some(ClientId::new("client-9")));
    }

    #[test]
    fn test_client_identity_header_wins_over_query() {
        let request = Request::builder()
            .uri("/ws?client_id=from-query")
            .header(CLIENT_ID_HEADER, "from-header")
            .body(())
            .unwrap();
        assert_eq!(client_identity(&request), Some(ClientId::new("from-header")));
    }

    #[test]
    fn test_client_identity_absent() {
        let request = Request::builder().uri("/ws").body(()).unwrap();
        assert_eq!(client_identity(&request), None);
    }
}
