use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;

/// Maximum message size (10MB); the socket is local only
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Requests under this path prefix are served by the local API handler.
pub const LOCAL_API_PREFIX: &str = "/localapi/";

/// Status codes used on the control socket. Values follow HTTP so front-ends
/// can map them directly.
pub mod status {
    pub const OK: u16 = 200;
    pub const BAD_REQUEST: u16 = 400;
    pub const UNAUTHORIZED: u16 = 401;
    pub const FORBIDDEN: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const METHOD_NOT_ALLOWED: u16 = 405;
    pub const PAYLOAD_TOO_LARGE: u16 = 413;
    pub const INTERNAL_SERVER_ERROR: u16 = 500;
    pub const SERVICE_UNAVAILABLE: u16 = 503;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request sent from a local client to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub method: Method,
    /// Absolute path, e.g. `/localapi/v0/status`
    pub path: String,
    pub body: Vec<u8>,
}

impl Request {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            body: Vec::new(),
        }
    }

    pub fn post(path: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            body: body.into(),
        }
    }

    /// Path relative to [`LOCAL_API_PREFIX`], if this is a local API request.
    pub fn local_api_path(&self) -> Option<&str> {
        self.path.strip_prefix(LOCAL_API_PREFIX)
    }
}

/// Response sent from the daemon back to a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Create a 200 response with a plain body
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::new(status::OK, body)
    }

    /// Create a 200 response with a JSON body
    pub fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self::ok(body).with_header("Content-Type", "application/json"),
            Err(e) => Self::error(
                status::INTERNAL_SERVER_ERROR,
                format!("failed to encode response: {}", e),
            ),
        }
    }

    /// Create an error response with a plain-text message
    pub fn error(status: u16, msg: impl AsRef<str>) -> Self {
        let mut body = msg.as_ref().to_string();
        body.push('\n');
        Self::new(status, body).with_header("Content-Type", "text/plain; charset=utf-8")
    }

    pub fn not_found() -> Self {
        Self::error(status::NOT_FOUND, "404 page not found")
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First header value with the given name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Client-to-server message with request ID for multiplexing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    pub request: Request,
}

/// Server-to-client message answering the request with the same ID
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: u64,
    pub response: Response,
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let size = bincode::serialized_size(value).map_err(ProtocolError::Encode)?;
    if size > MAX_MESSAGE_SIZE as u64 {
        return Err(ProtocolError::MessageTooLarge);
    }
    let len = size as u32;
    let mut frame = Vec::with_capacity(4 + size as usize);
    frame.extend_from_slice(&len.to_be_bytes());
    bincode::serialize_into(&mut frame, value).map_err(ProtocolError::Encode)?;
    Ok(frame)
}

/// Encode a request envelope to length-prefixed bincode bytes
pub fn encode_envelope(envelope: &RequestEnvelope) -> Result<Vec<u8>> {
    encode_frame(envelope)
}

/// Decode a request envelope from raw bincode payload (framing already stripped)
pub fn decode_envelope(bytes: &[u8]) -> Result<RequestEnvelope> {
    bincode::deserialize(bytes).map_err(ProtocolError::Decode)
}

/// Encode a response envelope to length-prefixed bincode bytes
pub fn encode_response(envelope: &ResponseEnvelope) -> Result<Vec<u8>> {
    encode_frame(envelope)
}

/// Decode a response envelope from raw bincode payload (framing already stripped)
pub fn decode_response(bytes: &[u8]) -> Result<ResponseEnvelope> {
    bincode::deserialize(bytes).map_err(ProtocolError::Decode)
}
