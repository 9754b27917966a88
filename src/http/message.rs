//! HTTP/1.1 heads and body framing, the minimum a proxy needs: request and
//! response heads via `httparse`, case-insensitive header access, hop-by-hop
//! stripping, and Content-Length / chunked body reading.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::address::Address;
use crate::error::{ProxyError, Result};

/// Upper bound on a message head.
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Maximum number of headers accepted per message.
pub(crate) const MAX_HEADERS: usize = 100;

/// Largest body the decoded-HTTP paths will buffer.
const MAX_BUFFERED_BODY: usize = 16 * 1024 * 1024;

/// Headers consumed by the immediate peer; a proxy strips them before
/// forwarding (RFC 2616 §13.5.1 plus the Proxy-* trio).
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "Proxy-Connection",
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "TE",
    "Trailer",
    "Transfer-Encoding",
    "Upgrade",
    "Connection",
];

/// Ordered header map with case-insensitive name lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value carried under `name`, in order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Replace all values of `name` with a single one.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.push(name.to_string(), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `name` contains `token` in a comma-separated value list.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Drop every hop-by-hop header.
    pub fn strip_hop_by_hop(&mut self) {
        self.entries.retain(|(n, _)| {
            !HOP_BY_HOP_HEADERS
                .iter()
                .any(|h| h.eq_ignore_ascii_case(n))
        });
    }
}

/// A parsed request line plus headers.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    /// Request target as sent: origin-form, absolute-form, or authority-form
    /// for CONNECT.
    pub target: String,
    /// HTTP minor version (1.0 or 1.1).
    pub version: u8,
    pub headers: Headers,
}

impl RequestHead {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Server hostname and port: `Host` header first, else the URI.
    /// The port defaults to 80.
    pub fn authority(&self) -> Result<Address> {
        if let Some(host) = self.headers.get("Host").filter(|h| !h.trim().is_empty()) {
            return Address::parse_authority(host, self.default_port());
        }
        if self.is_connect() {
            return Address::parse_authority(&self.target, self.default_port());
        }
        if let Some((_, authority, _)) = split_absolute_uri(&self.target) {
            return Address::parse_authority(authority, self.default_port());
        }
        Err(ProxyError::InvalidUrl(format!(
            "no Host header and no absolute URI in {}",
            self.target
        )))
    }

    fn default_port(&self) -> u16 {
        match split_absolute_uri(&self.target) {
            Some(("https", _, _)) => 443,
            _ => 80,
        }
    }

    /// The origin-form target to use toward the upstream server.
    pub fn origin_form_target(&self) -> String {
        match split_absolute_uri(&self.target) {
            Some((_, _, path)) if !path.is_empty() => path.to_string(),
            Some(_) => "/".to_string(),
            None => self.target.clone(),
        }
    }

    /// Serialize with an origin-form request line.
    pub fn encode_origin_form(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.origin_form_target().as_bytes());
        out.extend_from_slice(format!(" HTTP/1.{}\r\n", self.version).as_bytes());
        encode_headers(&self.headers, &mut out);
        out.extend_from_slice(b"\r\n");
        out
    }

    /// The request line as captured, for logging.
    pub fn start_line(&self) -> String {
        format!("{} {} HTTP/1.{}", self.method, self.target, self.version)
    }
}

/// A parsed status line plus headers.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: u8,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

impl ResponseHead {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            version: 1,
            status,
            reason: reason.into(),
            headers: Headers::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(
            format!("HTTP/1.{} {} {}\r\n", self.version, self.status, self.reason).as_bytes(),
        );
        encode_headers(&self.headers, &mut out);
        out.extend_from_slice(b"\r\n");
        out
    }

    pub fn start_line(&self) -> String {
        format!("HTTP/1.{} {} {}", self.version, self.status, self.reason)
    }
}

fn encode_headers(headers: &Headers, out: &mut Vec<u8>) {
    for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
}

/// Split an absolute-form URI into scheme, authority and path.
pub fn split_absolute_uri(target: &str) -> Option<(&str, &str, &str)> {
    let (scheme, rest) = target.split_once("://")?;
    match rest.find('/') {
        Some(idx) => Some((scheme, &rest[..idx], &rest[idx..])),
        None => Some((scheme, rest, "")),
    }
}

/// Read a request head, accumulating into `buf`. Returns `None` on a clean
/// EOF before the first byte (the idle end of a keep-alive connection).
pub async fn read_request_head<S>(stream: &mut S, buf: &mut BytesMut) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin + ?Sized,
{
    loop {
        if !buf.is_empty() {
            let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut parsed = httparse::Request::new(&mut header_storage);
            match parsed.parse(&buf[..]) {
                Ok(httparse::Status::Complete(consumed)) => {
                    let head = RequestHead {
                        method: parsed.method.unwrap_or_default().to_string(),
                        target: parsed.path.unwrap_or_default().to_string(),
                        version: parsed.version.unwrap_or(1),
                        headers: collect_headers(parsed.headers),
                    };
                    buf.advance(consumed);
                    return Ok(Some(head));
                }
                Ok(httparse::Status::Partial) => {}
                Err(e) => return Err(ProxyError::MalformedHttp(e.to_string())),
            }
            if buf.len() > MAX_HEAD_BYTES {
                return Err(ProxyError::MalformedHttp("request head too large".to_string()));
            }
        }
        if stream.read_buf(buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::MalformedHttp(
                "connection closed inside request head".to_string(),
            ));
        }
    }
}

/// Read a response head, accumulating into `buf`.
pub async fn read_response_head<S>(stream: &mut S, buf: &mut BytesMut) -> Result<ResponseHead>
where
    S: AsyncRead + Unpin + ?Sized,
{
    loop {
        if !buf.is_empty() {
            let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut parsed = httparse::Response::new(&mut header_storage);
            match parsed.parse(&buf[..]) {
                Ok(httparse::Status::Complete(consumed)) => {
                    let head = ResponseHead {
                        version: parsed.version.unwrap_or(1),
                        status: parsed.code.unwrap_or(0),
                        reason: parsed.reason.unwrap_or_default().to_string(),
                        headers: collect_headers(parsed.headers),
                    };
                    buf.advance(consumed);
                    return Ok(head);
                }
                Ok(httparse::Status::Partial) => {}
                Err(e) => return Err(ProxyError::MalformedHttp(e.to_string())),
            }
            if buf.len() > MAX_HEAD_BYTES {
                return Err(ProxyError::MalformedHttp("response head too large".to_string()));
            }
        }
        if stream.read_buf(buf).await? == 0 {
            return Err(ProxyError::MalformedHttp(
                "connection closed inside response head".to_string(),
            ));
        }
    }
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> Headers {
    let mut headers = Headers::new();
    for h in parsed {
        headers.push(h.name, String::from_utf8_lossy(h.value).into_owned());
    }
    headers
}

/// How a message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body bytes follow the head.
    None,
    ContentLength(u64),
    Chunked,
    /// Body runs until the peer closes (legacy responses).
    UntilClose,
}

/// Body framing for a request. Chunked wins over Content-Length.
pub fn request_body_framing(head: &RequestHead) -> Result<BodyFraming> {
    framing_from_headers(&head.headers)?.map_or(Ok(BodyFraming::None), Ok)
}

/// Body framing for a response to `request_method`.
pub fn response_body_framing(head: &ResponseHead, request_method: &str) -> Result<BodyFraming> {
    if request_method.eq_ignore_ascii_case("HEAD")
        || head.status / 100 == 1
        || head.status == 204
        || head.status == 304
    {
        return Ok(BodyFraming::None);
    }
    framing_from_headers(&head.headers)?.map_or(Ok(BodyFraming::UntilClose), Ok)
}

fn framing_from_headers(headers: &Headers) -> Result<Option<BodyFraming>> {
    // Repeated Content-Length headers must agree; a disagreement means two
    // competing body lengths, the classic smuggling shape.
    let mut content_length: Option<u64> = None;
    for value in headers.get_all("Content-Length") {
        let n: u64 = value
            .trim()
            .parse()
            .map_err(|_| ProxyError::MalformedHttp(format!("bad Content-Length: {}", value)))?;
        match content_length {
            Some(prev) if prev != n => {
                return Err(ProxyError::ProtocolMisuse(format!(
                    "conflicting Content-Length headers: {} and {}",
                    prev, n
                )));
            }
            _ => content_length = Some(n),
        }
    }

    if headers.has_token("Transfer-Encoding", "chunked") {
        if content_length.is_some() {
            return Err(ProxyError::ProtocolMisuse(
                "both Transfer-Encoding and Content-Length present".to_string(),
            ));
        }
        return Ok(Some(BodyFraming::Chunked));
    }
    Ok(content_length.map(BodyFraming::ContentLength))
}

/// A fully read body plus any chunked trailers.
#[derive(Debug, Default)]
pub struct Body {
    pub data: Vec<u8>,
    pub trailers: Headers,
}

/// Read a complete body per `framing`, consuming from `buf` first.
pub async fn read_body<S>(stream: &mut S, buf: &mut BytesMut, framing: BodyFraming) -> Result<Body>
where
    S: AsyncRead + Unpin + ?Sized,
{
    match framing {
        BodyFraming::None => Ok(Body::default()),
        BodyFraming::ContentLength(n) => {
            if n as usize > MAX_BUFFERED_BODY {
                return Err(ProxyError::MalformedHttp(format!(
                    "body of {} bytes exceeds the buffering limit",
                    n
                )));
            }
            let data = take_exact(stream, buf, n as usize).await?;
            Ok(Body {
                data,
                trailers: Headers::new(),
            })
        }
        BodyFraming::Chunked => read_chunked(stream, buf).await,
        BodyFraming::UntilClose => {
            let mut data = buf.split().to_vec();
            loop {
                if data.len() > MAX_BUFFERED_BODY {
                    return Err(ProxyError::MalformedHttp(
                        "unbounded body exceeds the buffering limit".to_string(),
                    ));
                }
                let before = data.len();
                data.resize(before + 8 * 1024, 0);
                let n = stream.read(&mut data[before..]).await?;
                data.truncate(before + n);
                if n == 0 {
                    return Ok(Body {
                        data,
                        trailers: Headers::new(),
                    });
                }
            }
        }
    }
}

async fn take_exact<S>(stream: &mut S, buf: &mut BytesMut, n: usize) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin + ?Sized,
{
    while buf.len() < n {
        if stream.read_buf(buf).await? == 0 {
            return Err(ProxyError::MalformedHttp(
                "connection closed inside body".to_string(),
            ));
        }
    }
    Ok(buf.split_to(n).to_vec())
}

/// Position of the first CRLF fully inside `buf`.
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

async fn read_line<S>(stream: &mut S, buf: &mut BytesMut) -> Result<String>
where
    S: AsyncRead + Unpin + ?Sized,
{
    loop {
        if let Some(idx) = find_crlf(&buf[..]) {
            let line = String::from_utf8_lossy(&buf[..idx]).into_owned();
            buf.advance(idx + 2);
            return Ok(line);
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(ProxyError::MalformedHttp("chunk line too long".to_string()));
        }
        if stream.read_buf(buf).await? == 0 {
            return Err(ProxyError::MalformedHttp(
                "connection closed inside chunked body".to_string(),
            ));
        }
    }
}

async fn read_chunked<S>(stream: &mut S, buf: &mut BytesMut) -> Result<Body>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut data = Vec::new();
    loop {
        let size_line = read_line(stream, buf).await?;
        let size_part = size_line
            .split(';')
            .next()
            .unwrap_or_default()
            .trim();
        let size = usize::from_str_radix(size_part, 16)
            .map_err(|_| ProxyError::MalformedHttp(format!("bad chunk size: {}", size_line)))?;

        if size == 0 {
            break;
        }
        if data.len() + size > MAX_BUFFERED_BODY {
            return Err(ProxyError::MalformedHttp(
                "chunked body exceeds the buffering limit".to_string(),
            ));
        }
        data.extend_from_slice(&take_exact(stream, buf, size).await?);
        let sep = take_exact(stream, buf, 2).await?;
        if sep != b"\r\n" {
            return Err(ProxyError::MalformedHttp("missing chunk terminator".to_string()));
        }
    }

    // Trailers run until the empty line
    let mut trailers = Headers::new();
    loop {
        let line = read_line(stream, buf).await?;
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            trailers.push(name.trim().to_string(), value.trim().to_string());
        }
    }

    Ok(Body { data, trailers })
}

/// Whether the sender of `headers` intends to close after this exchange.
pub fn wants_close(version: u8, headers: &Headers) -> bool {
    if headers.has_token("Connection", "close") {
        return true;
    }
    version == 0 && !headers.has_token("Connection", "keep-alive")
}
