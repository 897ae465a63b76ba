//! HTTP upgrade handshake.
//!
//! The request is accumulated in a [`RequestBuffer`] until `CRLF CRLF`
//! arrives, then parsed into an [`UpgradeRequest`]. Only the two headers the
//! server needs are looked at: `Sec-WebSocket-Key` and
//! `Sec-WebSocket-Protocol`.
//!
//! # Example
//!
//! ```
//! use websocketd::handshake::{RequestBuffer, UpgradeRequest};
//!
//! let mut buffer = RequestBuffer::new(512);
//! let request = b"GET / HTTP/1.1\r\n\
//!     Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
//!     Sec-WebSocket-Protocol: arduino, text\r\n\r\n";
//!
//! let head_len = buffer.push(request).unwrap().unwrap();
//! let upgrade = UpgradeRequest::parse(&buffer.as_bytes()[..head_len]).unwrap();
//!
//! assert_eq!(upgrade.protocol(), Some("arduino"));
//! assert_eq!(upgrade.accept_key(), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
//! ```

use base64::Engine;
use sha1::{Digest, Sha1};

use crate::error::{Result, WsError};

/// RFC 6455 GUID appended to the client key.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Sub-protocol that switches outgoing frames to binary.
pub const BINARY_PROTOCOL: &str = "arduino";

/// Reply to a malformed upgrade request.
pub const HTTP_400: &[u8] = b"HTTP/1.1 400\r\nStatus: 400 Bad Request\r\n\r\n";

/// Reply when a buffer could not be allocated.
pub const HTTP_500: &[u8] = b"HTTP/1.1 500\r\nStatus: 500 Internal Server Error\r\n\r\n";

const HEADER_END: &[u8] = b"\r\n\r\n";

/// Compute `Sec-WebSocket-Accept` for a client key.
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// First entry of a comma separated protocol list, trimmed.
pub fn first_protocol(offered: &str) -> &str {
    offered.split(',').next().unwrap_or("").trim()
}

/// Growable buffer for the upgrade request.
///
/// Grows in `initial`-sized steps and refuses requests past `2 * initial`
/// bytes that still lack the header terminator.
#[derive(Debug)]
pub struct RequestBuffer {
    buf: Vec<u8>,
    step: usize,
    cap: usize,
}

impl RequestBuffer {
    /// Create an empty buffer. Nothing is allocated until the first push.
    pub fn new(initial: usize) -> Self {
        Self {
            buf: Vec::new(),
            step: initial.max(1),
            cap: initial.max(1) * 2,
        }
    }

    /// Append received bytes.
    ///
    /// Returns `Some(head_len)` once the terminator is present, where
    /// `head_len` includes the terminator. Bytes past it belong to the first
    /// frames and are left in the buffer.
    ///
    /// # Errors
    ///
    /// - [`WsError::RequestTooLarge`] past the hard cap without a terminator
    /// - [`WsError::OutOfMemory`] if growing the buffer fails
    pub fn push(&mut self, data: &[u8]) -> Result<Option<usize>> {
        let needed = self.buf.len() + data.len();
        if needed > self.buf.capacity() {
            let target = needed.div_ceil(self.step) * self.step;
            self.buf
                .try_reserve_exact(target - self.buf.len())
                .map_err(|_| WsError::OutOfMemory(target))?;
        }

        // A terminator may straddle the previous push.
        let search_from = self.buf.len().saturating_sub(HEADER_END.len() - 1);
        self.buf.extend_from_slice(data);

        if let Some(pos) = find(&self.buf[search_from..], HEADER_END) {
            return Ok(Some(search_from + pos + HEADER_END.len()));
        }
        if self.buf.len() > self.cap {
            return Err(WsError::RequestTooLarge(self.cap));
        }
        Ok(None)
    }

    /// Bytes accumulated so far.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Number of bytes accumulated.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// `true` if nothing was received yet.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Release the allocation.
    pub fn clear(&mut self) {
        self.buf = Vec::new();
    }
}

/// Parsed upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    key: String,
    offered_protocols: Option<String>,
}

impl UpgradeRequest {
    /// Parse the request head (request line and headers).
    ///
    /// # Errors
    ///
    /// - [`WsError::MissingKey`] without a `Sec-WebSocket-Key` header
    /// - [`WsError::InvalidKey`] if the key is not base64 of 16 bytes
    pub fn parse(head: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(head);
        let key = header_value(&text, "sec-websocket-key").ok_or(WsError::MissingKey)?;

        match base64::engine::general_purpose::STANDARD.decode(key) {
            Ok(decoded) if decoded.len() == 16 => {}
            _ => return Err(WsError::InvalidKey(key.to_string())),
        }

        Ok(Self {
            key: key.to_string(),
            offered_protocols: header_value(&text, "sec-websocket-protocol")
                .filter(|value| !value.is_empty())
                .map(str::to_string),
        })
    }

    /// Trimmed `Sec-WebSocket-Key`.
    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Raw `Sec-WebSocket-Protocol` value, trimmed.
    #[inline]
    pub fn offered_protocols(&self) -> Option<&str> {
        self.offered_protocols.as_deref()
    }

    /// Default protocol choice: the first offered entry.
    pub fn protocol(&self) -> Option<&str> {
        self.offered_protocols
            .as_deref()
            .map(first_protocol)
            .filter(|p| !p.is_empty())
    }

    /// `Sec-WebSocket-Accept` for this request.
    pub fn accept_key(&self) -> String {
        compute_accept_key(&self.key)
    }
}

/// Build the `101 Switching Protocols` response.
pub fn response_101(accept_key: &str, protocol: Option<&str>) -> Vec<u8> {
    let mut response = String::with_capacity(160);
    response.push_str(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: ",
    );
    response.push_str(accept_key);
    if let Some(protocol) = protocol {
        response.push_str("\r\nSec-WebSocket-Protocol: ");
        response.push_str(protocol);
    }
    response.push_str("\r\n\r\n");
    response.into_bytes()
}

/// Case-insensitive header lookup with the value trimmed.
fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.split("\r\n").skip(1).find_map(|line| {
        let (field, value) = line.split_once(':')?;
        field
            .trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim())
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
