//! One request/response exchange as seen by a site handler.
//!
//! # Responsibilities
//! - Expose the request: method, URL, query, headers, cookies, body
//! - Collect the response: status, headers, cookies, body
//! - Turn the exchange into a WebSocket or an event stream

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use bytes::Bytes;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode, Uri};
use tokio::sync::mpsc;

use crate::config::schema::WebSocketConfig;
use crate::events::sse::EventStream;
use crate::http::queue::ResponseHandle;
use crate::http::request::RequestId;
use crate::http::server::ServerError;
use crate::json::parser::MAX_NESTING_DEPTH;
use crate::json::JsonMessage;
use crate::websocket::handshake::{self, HandshakeError};
use crate::websocket::socket::{Outbound, WebSocket};

/// A WebSocket whose 101 response is queued; the connection is handed
/// over once hyper completes the upgrade.
pub struct PendingUpgrade {
    pub socket: Arc<WebSocket>,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
    pub on_upgrade: OnUpgrade,
}

pub struct HttpMessage {
    id: RequestId,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Option<Body>,
    content: Option<Bytes>,
    remote: Option<SocketAddr>,
    site_prefix: String,
    max_body_size: usize,
    max_json_depth: usize,
    on_upgrade: Option<OnUpgrade>,

    status: StatusCode,
    response_headers: HeaderMap,
    response_body: Option<Body>,
    reply: Option<ResponseHandle>,
    answered: bool,

    upgrade: Option<PendingUpgrade>,
    event_stream: Option<Arc<EventStream>>,
}

impl std::fmt::Debug for HttpMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpMessage")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("status", &self.status)
            .finish()
    }
}

impl HttpMessage {
    pub fn new(id: RequestId, mut request: Request<Body>, remote: Option<SocketAddr>) -> Self {
        let on_upgrade = Some(hyper::upgrade::on(&mut request));
        let (parts, body) = request.into_parts();
        Self {
            id,
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body: Some(body),
            content: None,
            remote,
            site_prefix: String::new(),
            max_body_size: 1024 * 1024,
            max_json_depth: MAX_NESTING_DEPTH,
            on_upgrade,
            status: StatusCode::OK,
            response_headers: HeaderMap::new(),
            response_body: None,
            reply: None,
            answered: false,
            upgrade: None,
            event_stream: None,
        }
    }

    pub(crate) fn attach(
        &mut self,
        reply: ResponseHandle,
        site_prefix: &str,
        max_body_size: usize,
        max_json_depth: usize,
    ) {
        self.reply = Some(reply);
        self.site_prefix = site_prefix.to_string();
        self.max_body_size = max_body_size;
        self.max_json_depth = max_json_depth;
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Path plus query string.
    pub fn path_and_query(&self) -> &str {
        self.uri.path_and_query().map(|p| p.as_str()).unwrap_or("/")
    }

    /// Prefix of the site that received this request.
    pub fn site_prefix(&self) -> &str {
        &self.site_prefix
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.uri.query()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// All cookies from every `Cookie` header, in order.
    pub fn cookies(&self) -> Vec<(String, String)> {
        self.headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| {
                let (name, value) = pair.split_once('=')?;
                let name = name.trim();
                (!name.is_empty())
                    .then(|| (name.to_string(), value.trim().trim_matches('"').to_string()))
            })
            .collect()
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        self.cookies()
            .into_iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Identity of the client: its IP address.
    pub fn sender(&self) -> String {
        self.remote
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Read the request body, at most `max_body_size` bytes.
    pub async fn body(&mut self) -> Result<Bytes, ServerError> {
        if let Some(content) = &self.content {
            return Ok(content.clone());
        }
        let body = self.body.take().unwrap_or_else(Body::empty);
        let content = axum::body::to_bytes(body, self.max_body_size)
            .await
            .map_err(|e| ServerError::Body(e.to_string()))?;
        self.content = Some(content.clone());
        Ok(content)
    }

    /// Body parsed as JSON. Parse errors stay on the returned message.
    pub async fn json_body(&mut self) -> Result<JsonMessage, ServerError> {
        let content = self.body().await?;
        Ok(JsonMessage::parse_bytes_with_depth(&content, self.max_json_depth))
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Returns false for names or values that are not valid in HTTP.
    pub fn set_header(&mut self, name: &str, value: &str) -> bool {
        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => {
                self.response_headers.insert(name, value);
                true
            }
            _ => false,
        }
    }

    pub fn response_headers(&self) -> &HeaderMap {
        &self.response_headers
    }

    pub fn set_cookie(&mut self, name: &str, value: &str, http_only: bool) -> bool {
        let mut cookie = format!("{name}={value}; Path=/");
        if http_only {
            cookie.push_str("; HttpOnly");
        }
        match HeaderValue::try_from(cookie) {
            Ok(value) => {
                self.response_headers.append(header::SET_COOKIE, value);
                true
            }
            Err(_) => false,
        }
    }

    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.response_body = Some(body.into());
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.response_headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        self.set_body(text.into());
    }

    pub fn set_json(&mut self, json: &JsonMessage) {
        self.response_headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        self.set_body(json.to_json_string());
    }

    pub fn is_answered(&self) -> bool {
        self.answered
    }

    /// Build the response from the collected status, headers and body.
    pub fn take_response(&mut self) -> Response<Body> {
        let mut response = Response::new(self.response_body.take().unwrap_or_else(Body::empty));
        *response.status_mut() = self.status;
        *response.headers_mut() = std::mem::take(&mut self.response_headers);
        response
    }

    /// Send the response now. Returns false if it was already sent or the
    /// client is gone.
    pub fn send_response(&mut self) -> bool {
        if self.answered {
            return false;
        }
        self.answered = true;
        let response = self.take_response();
        match self.reply.take() {
            Some(reply) => reply.send(response),
            None => false,
        }
    }

    /// Accept a WebSocket upgrade. The 101 response goes out when the
    /// handler returns; the socket starts serving right after.
    pub fn accept_websocket(&mut self, config: &WebSocketConfig) -> Result<Arc<WebSocket>, ServerError> {
        let key = handshake::validate_request(&self.method, &self.headers)?;
        let on_upgrade = self
            .on_upgrade
            .take()
            .ok_or(ServerError::Handshake(HandshakeError::MissingUpgrade))?;
        let protocol = handshake::negotiate_protocol(&self.headers, &config.protocols);
        let (socket, outbound) = WebSocket::new(
            self.path_and_query(),
            &self.sender(),
            protocol.clone(),
            config.clone(),
        );

        let response = handshake::switching_protocols(&key, protocol.as_deref());
        let (parts, _) = response.into_parts();
        self.status = parts.status;
        self.response_headers.extend(parts.headers);
        self.response_body = None;
        self.upgrade = Some(PendingUpgrade {
            socket: Arc::clone(&socket),
            outbound,
            on_upgrade,
        });
        Ok(socket)
    }

    /// Answer with an open `text/event-stream` body. Headers go out
    /// immediately so events can follow.
    pub fn start_event_stream(&mut self) -> Option<Arc<EventStream>> {
        if self.answered {
            return None;
        }
        let (stream, body) = EventStream::new(self.path_and_query(), &self.sender());
        self.status = StatusCode::OK;
        self.response_headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        self.response_headers
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        self.response_body = Some(body);
        self.send_response();
        self.event_stream = Some(Arc::clone(&stream));
        Some(stream)
    }

    /// Drop whatever response was prepared, pending upgrade included, and
    /// answer with `status` instead.
    pub fn reject(&mut self, status: StatusCode) {
        if let Some(upgrade) = self.upgrade.take() {
            upgrade.socket.close_socket(crate::websocket::frame::CLOSE_POLICY, "refused");
        }
        self.status = status;
        self.response_headers.clear();
        self.response_body = None;
    }

    pub fn take_upgrade(&mut self) -> Option<PendingUpgrade> {
        self.upgrade.take()
    }

    pub fn event_stream(&self) -> Option<&Arc<EventStream>> {
        self.event_stream.as_ref()
    }
}
