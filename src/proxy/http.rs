//! Minimal HTTP/1.1 framing for the intercepting proxy
//!
//! Only what the proxy needs: reading a request head plus a
//! `Content-Length` body from a byte stream, and writing responses back
//! with chunked transfer encoding.

use super::ProxyError;
use bytes::{Buf, Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest request (head plus body) the proxy accepts
pub const MAX_BUFFER_SIZE: usize = 10 * 1024 * 1024;

const READ_CHUNK_SIZE: usize = 64 * 1024;
const HEAD_END: &[u8] = b"\r\n\r\n";

/// Headers that describe a single connection and are never forwarded
pub const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authorization",
    "transfer-encoding",
    "upgrade",
    "te",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    /// Header lines in the order received
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// First value of a header, matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Result<usize, ProxyError> {
        match self.header("content-length") {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| ProxyError::BadRequest(format!("invalid Content-Length: {}", value))),
            None => Ok(0),
        }
    }

    /// Whether the client asked to close the connection after this exchange
    pub fn wants_close(&self) -> bool {
        match self.header("connection") {
            Some(value) => value.eq_ignore_ascii_case("close"),
            None => self.version == "HTTP/1.0",
        }
    }

    /// Request path without the leading slash, query kept
    pub fn path(&self) -> String {
        extract_path(&self.target)
    }
}

#[derive(Debug)]
pub struct Request {
    pub head: RequestHead,
    pub body: Bytes,
}

/// Path of a request target, without the leading slash
///
/// Absolute-form targets (`http://host/path?q`) keep only path and query.
pub fn extract_path(target: &str) -> String {
    let rest = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"));
    match rest {
        Some(rest) => match rest.find('/') {
            Some(pos) => rest[pos + 1..].to_string(),
            None => match rest.find('?') {
                Some(pos) => rest[pos..].to_string(),
                None => String::new(),
            },
        },
        None => target.trim_start_matches('/').to_string(),
    }
}

/// Parse a request head if `buf` holds a complete one
///
/// Returns the head and its length in bytes including the blank line.
pub fn parse_head(buf: &[u8]) -> Result<Option<(RequestHead, usize)>, ProxyError> {
    let Some(end) = buf.windows(HEAD_END.len()).position(|w| w == HEAD_END) else {
        return Ok(None);
    };

    let text = std::str::from_utf8(&buf[..end])
        .map_err(|_| ProxyError::BadRequest("request head is not UTF-8".to_string()))?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ProxyError::BadRequest(format!(
            "malformed request line: {}",
            request_line
        )));
    };
    if method.is_empty() || target.is_empty() || !version.starts_with("HTTP/") {
        return Err(ProxyError::BadRequest(format!(
            "malformed request line: {}",
            request_line
        )));
    }

    let headers = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect();

    let head = RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers,
    };
    Ok(Some((head, end + HEAD_END.len())))
}

/// A byte stream carrying HTTP/1.1 requests, with read-ahead buffering
pub struct HttpConnection<S> {
    stream: S,
    buffer: BytesMut,
}

impl<S> HttpConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
        }
    }

    /// Read the next request; `None` when the peer closed between requests
    pub async fn read_request(&mut self) -> Result<Option<Request>, ProxyError> {
        let (head, head_len) = loop {
            if let Some(parsed) = parse_head(&self.buffer)? {
                break parsed;
            }
            if self.buffer.len() > MAX_BUFFER_SIZE {
                return Err(ProxyError::TooLarge);
            }
            if self.fill().await? == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(ProxyError::BadRequest("connection closed mid-request".to_string()));
            }
        };

        if head
            .header("transfer-encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
        {
            return Err(ProxyError::BadRequest(
                "chunked request bodies are not supported".to_string(),
            ));
        }

        let body_len = head.content_length()?;
        if head_len + body_len > MAX_BUFFER_SIZE {
            return Err(ProxyError::TooLarge);
        }
        while self.buffer.len() < head_len + body_len {
            if self.fill().await? == 0 {
                return Err(ProxyError::BadRequest("connection closed mid-body".to_string()));
            }
        }

        self.buffer.advance(head_len);
        let body = self.buffer.split_to(body_len).freeze();
        Ok(Some(Request { head, body }))
    }

    async fn fill(&mut self) -> Result<usize, ProxyError> {
        self.buffer.reserve(READ_CHUNK_SIZE);
        Ok(self.stream.read_buf(&mut self.buffer).await?)
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<(), ProxyError> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn write_error(&mut self, status: u16, message: &str) -> Result<(), ProxyError> {
        let response = error_response(status, message);
        self.write_all(&response).await
    }

    /// Write a response head followed by a chunk-encoded body
    pub async fn write_chunked<B, E>(
        &mut self,
        status: u16,
        reason: &str,
        headers: &[(String, String)],
        mut body: B,
    ) -> Result<(), ProxyError>
    where
        B: Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        self.stream
            .write_all(&response_head(status, reason, headers, true))
            .await?;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| ProxyError::Upstream(e.to_string()))?;
            if chunk.is_empty() {
                continue;
            }
            self.stream.write_all(&encode_chunk(&chunk)).await?;
            self.stream.flush().await?;
        }
        self.stream.write_all(b"0\r\n\r\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Write a response that carries no body, keeping its length headers
    pub async fn write_head(
        &mut self,
        status: u16,
        reason: &str,
        headers: &[(String, String)],
    ) -> Result<(), ProxyError> {
        self.write_all(&response_head(status, reason, headers, false)).await
    }

    /// Hand back the raw stream with the bytes already read past the last request
    pub fn into_parts(self) -> (S, Bytes) {
        (self.stream, self.buffer.freeze())
    }
}

/// Whether a response to `method` with `status` has a message body
pub fn response_has_body(method: &str, status: u16) -> bool {
    !(method.eq_ignore_ascii_case("HEAD") || (100..200).contains(&status) || status == 204 || status == 304)
}

pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        413 => "Request Entity Too Large",
        502 => "Bad Gateway",
        _ => "Error",
    }
}

/// Plain-text error response with a fixed length
pub fn error_response(status: u16, message: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\n{}",
        status,
        status_text(status),
        message.len(),
        message
    )
    .into_bytes()
}

/// Response head without hop-by-hop headers
///
/// With `chunked` the upstream length is dropped and the body is announced
/// as chunk-encoded.
pub fn response_head(status: u16, reason: &str, headers: &[(String, String)], chunked: bool) -> Vec<u8> {
    let mut head = format!("HTTP/1.1 {} {}\r\n", status, reason);
    for (name, value) in headers {
        if (chunked && name.eq_ignore_ascii_case("content-length"))
            || HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
        {
            continue;
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    if chunked {
        head.push_str("Transfer-Encoding: chunked\r\n");
    }
    head.push_str("\r\n");
    head.into_bytes()
}

pub fn encode_chunk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("{:x}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}
