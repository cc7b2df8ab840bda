//! HTTP/1.x framing for the acceptor's handlers.
//!
//! Heads are parsed with `httparse`; bodies are framed by `Content-Length`,
//! `Transfer-Encoding: chunked`, or (responses only) the end of the stream.
//! Everything this module writes carries a `Content-Length` that matches the
//! body and `Connection: close`, since each connection serves one exchange.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{ProxyError, Result, Stage};
use crate::{MAX_HEADERS, MAX_REQUEST_SIZE, MAX_RESPONSE_SIZE};

pub type Headers = Vec<(String, String)>;

/// Longest accepted chunk-size or trailer line.
const MAX_CHUNK_LINE: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StatusCode(u16);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    pub const CREATED: StatusCode = StatusCode(201);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
    pub const NOT_IMPLEMENTED: StatusCode = StatusCode(501);
    pub const BAD_GATEWAY: StatusCode = StatusCode(502);

    pub const fn new(code: u16) -> Self {
        StatusCode(code)
    }

    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Canonical reason phrase, or an empty string for unknown codes.
    pub fn reason(self) -> &'static str {
        match self.0 {
            100 => "Continue",
            101 => "Switching Protocols",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            204 => "No Content",
            206 => "Partial Content",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            413 => "Content Too Large",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            _ => "",
        }
    }

    fn has_body(self) -> bool {
        !(100..200).contains(&self.0) && self.0 != 204 && self.0 != 304
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.0, self.reason())
    }
}

/// A fully read inbound request.
#[derive(Clone, Debug)]
pub struct Request {
    pub method: String,
    /// The request target exactly as it appeared on the request line.
    pub target: String,
    pub headers: Headers,
    pub body: Bytes,
    head: Bytes,
    /// Body bytes exactly as they arrived, including any chunk framing.
    wire_body: Bytes,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// `host[:port]` of an absolute-form target, if the target has one.
    pub fn authority(&self) -> Option<&str> {
        let (_, rest) = self.target.split_once("://")?;
        let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
        let authority = &rest[..end];
        // Drop userinfo
        let authority = authority.rsplit('@').next().unwrap_or(authority);
        (!authority.is_empty()).then_some(authority)
    }

    /// Path component of the target, without scheme, authority or query.
    pub fn path(&self) -> &str {
        let target = match self.target.split_once("://") {
            Some((_, rest)) => rest.find('/').map_or("/", |i| &rest[i..]),
            None => self.target.as_str(),
        };
        let end = target.find(['?', '#']).unwrap_or(target.len());
        &target[..end]
    }

    /// Wire form of the request: the head and body bytes as they were read.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.head.len() + self.wire_body.len());
        out.extend_from_slice(&self.head);
        out.extend_from_slice(&self.wire_body);
        out.freeze()
    }
}

/// A complete response, either produced locally or buffered from an origin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub status: StatusCode,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Declared `Content-Type`, empty when the response has none.
    pub fn content_type(&self) -> &str {
        self.header("content-type").unwrap_or("")
    }

    /// Plain-text response whose body is `"<code> <reason>\n"`.
    pub fn plain(status: StatusCode) -> Self {
        Self::text(status, format!("{status}\n"))
    }

    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self::new(status, body.into()).with_header("Content-Type", "text/plain; charset=utf-8")
    }

    pub fn bad_request() -> Self {
        Self::plain(StatusCode::BAD_REQUEST)
    }

    pub fn not_implemented() -> Self {
        Self::plain(StatusCode::NOT_IMPLEMENTED)
    }

    pub fn bad_gateway() -> Self {
        Self::plain(StatusCode::BAD_GATEWAY)
    }

    pub fn internal_error() -> Self {
        Self::plain(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Canned response for a per-connection failure, if one is owed.
    pub fn for_error(err: &ProxyError) -> Option<Self> {
        err.status().map(Self::plain)
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        write_response(writer, self.status, &self.headers, &self.body).await
    }

    /// Serialized form, as written by [`write_response`].
    pub fn to_bytes(&self) -> Bytes {
        encode_response(self.status, &self.headers, &self.body).freeze()
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Read one request (head and body) from `reader`.
///
/// Any framing or syntax violation is a [`ProxyError::MalformedRequest`].
pub async fn read_request<R>(reader: &mut R) -> Result<Request>
where
    R: AsyncBufRead + Unpin,
{
    let head = read_head(reader, MAX_REQUEST_SIZE)
        .await
        .map_err(ProxyError::MalformedRequest)?;

    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut raw_headers);
    match req.parse(&head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(ProxyError::MalformedRequest("incomplete request head".into()))
        }
        Err(e) => return Err(ProxyError::MalformedRequest(e.to_string())),
    }

    let method = req.method.unwrap_or_default().to_string();
    let target = req.path.unwrap_or_default().to_string();
    let headers = collect_headers(req.headers);

    let framing = body_framing(&headers).map_err(ProxyError::MalformedRequest)?;
    let framing = match framing {
        // A request without framing headers has no body.
        Framing::UntilEof => Framing::Empty,
        other => other,
    };
    let (body, wire_body) = match framing {
        Framing::Chunked => {
            let mut wire = BytesMut::new();
            let body = read_chunked(reader, MAX_RESPONSE_SIZE, Some(&mut wire))
                .await
                .map_err(ProxyError::MalformedRequest)?;
            (body, wire.freeze())
        }
        other => {
            let body = read_body(reader, other, MAX_RESPONSE_SIZE)
                .await
                .map_err(ProxyError::MalformedRequest)?;
            (body.clone(), body)
        }
    };

    Ok(Request {
        method,
        target,
        headers,
        body,
        head: head.freeze(),
        wire_body,
    })
}

/// Read one request from `stream` within `read_timeout`, answer it with
/// `respond`, and write exactly one response.
///
/// Failures become the matching canned response. A failure to write the
/// response is logged and the connection is left to close.
pub async fn serve_one<S, H, Fut>(stream: S, read_timeout: Duration, respond: H)
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: FnOnce(Request) -> Fut,
    Fut: Future<Output = Result<Response>>,
{
    let mut stream = BufReader::new(stream);
    let outcome = match timeout(read_timeout, read_request(&mut stream)).await {
        Ok(Ok(request)) => respond(request).await,
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ProxyError::Timeout {
            stage: Stage::Request,
            after: read_timeout,
        }),
    };

    let response = match outcome {
        Ok(response) => response,
        Err(e) => {
            warn!("{}", e);
            match Response::for_error(&e) {
                Some(response) => response,
                None => return,
            }
        }
    };
    if let Err(e) = response.write_to(stream.get_mut()).await {
        debug!("{}", e);
    }
}

/// Status and headers of an origin response; the body is still on the wire.
#[derive(Clone, Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: Headers,
}

/// Read a response head. Failures are [`ProxyError::ForwardRead`].
pub async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead>
where
    R: AsyncBufRead + Unpin,
{
    let head = read_head(reader, MAX_REQUEST_SIZE)
        .await
        .map_err(ProxyError::ForwardRead)?;

    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut raw_headers);
    match resp.parse(&head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(ProxyError::ForwardRead("incomplete response head".into()))
        }
        Err(e) => return Err(ProxyError::ForwardRead(e.to_string())),
    }

    let status = resp
        .code
        .map(StatusCode::new)
        .ok_or_else(|| ProxyError::ForwardRead("missing status code".into()))?;

    Ok(ResponseHead {
        status,
        headers: collect_headers(resp.headers),
    })
}

/// Buffer the body that follows `head`. Failures are [`ProxyError::BodyRead`].
pub async fn read_response_body<R>(
    reader: &mut R,
    head: &ResponseHead,
    request_method: &str,
) -> Result<Bytes>
where
    R: AsyncBufRead + Unpin,
{
    let framing = if !head.status.has_body() || request_method.eq_ignore_ascii_case("HEAD") {
        Framing::Empty
    } else {
        body_framing(&head.headers).map_err(ProxyError::BodyRead)?
    };
    read_body(reader, framing, MAX_RESPONSE_SIZE)
        .await
        .map_err(ProxyError::BodyRead)
}

/// Serialize and flush a complete response.
pub async fn write_response<W>(
    writer: &mut W,
    status: StatusCode,
    headers: &[(String, String)],
    body: &[u8],
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let buf = encode_response(status, headers, body);
    writer
        .write_all(&buf)
        .await
        .map_err(ProxyError::WriteResponse)?;
    writer.flush().await.map_err(ProxyError::WriteResponse)
}

fn encode_response(status: StatusCode, headers: &[(String, String)], body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(128 + body.len());
    buf.put_slice(format!("HTTP/1.1 {status}\r\n").as_bytes());
    for (name, value) in headers {
        // Framing is always recomputed for the buffered body.
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
            || name.eq_ignore_ascii_case("connection")
        {
            continue;
        }
        buf.put_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    buf.put_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    buf.put_slice(b"Connection: close\r\n\r\n");
    buf.put_slice(body);
    buf
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> Headers {
    raw.iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).trim().to_string(),
            )
        })
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Framing {
    Empty,
    Fixed(usize),
    Chunked,
    UntilEof,
}

fn body_framing(headers: &[(String, String)]) -> std::result::Result<Framing, String> {
    if let Some(te) = find_header(headers, "transfer-encoding") {
        let last = te.rsplit(',').next().unwrap_or("").trim();
        if last.eq_ignore_ascii_case("chunked") {
            return Ok(Framing::Chunked);
        }
        return Err(format!("unsupported transfer-encoding: {te}"));
    }
    match find_header(headers, "content-length") {
        Some(value) => value
            .parse::<usize>()
            .map(|n| if n == 0 { Framing::Empty } else { Framing::Fixed(n) })
            .map_err(|_| format!("invalid content-length: {value}")),
        None => Ok(Framing::UntilEof),
    }
}

/// Read up to and including the blank line that ends a message head.
async fn read_head<R>(reader: &mut R, limit: usize) -> std::result::Result<BytesMut, String>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(1024);
    let mut skipped = 0usize;
    loop {
        let start = head.len();
        let n = read_line_bounded(reader, &mut head, limit - start - skipped)
            .await
            .map_err(|e| format!("head exceeds {limit} bytes: {e}"))?;
        if n == 0 {
            return Err(if head.is_empty() {
                "connection closed before request".to_string()
            } else {
                "connection closed mid-head".to_string()
            });
        }
        let line = &head[start..];
        if line == b"\r\n" || line == b"\n" {
            // Tolerate leading empty lines before the start line.
            if start == 0 {
                skipped += n;
                head.clear();
                continue;
            }
            return Ok(BytesMut::from(&head[..]));
        }
    }
}

async fn read_body<R>(
    reader: &mut R,
    framing: Framing,
    limit: usize,
) -> std::result::Result<Bytes, String>
where
    R: AsyncBufRead + Unpin,
{
    match framing {
        Framing::Empty => Ok(Bytes::new()),
        Framing::Fixed(len) => {
            if len > limit {
                return Err(format!("body of {len} bytes exceeds {limit}"));
            }
            let mut body = vec![0u8; len];
            reader
                .read_exact(&mut body)
                .await
                .map_err(|e| format!("short body: {e}"))?;
            Ok(Bytes::from(body))
        }
        Framing::UntilEof => {
            let mut body = Vec::new();
            let n = (&mut *reader)
                .take(limit as u64 + 1)
                .read_to_end(&mut body)
                .await
                .map_err(|e| e.to_string())?;
            if n > limit {
                return Err(format!("body exceeds {limit} bytes"));
            }
            Ok(Bytes::from(body))
        }
        Framing::Chunked => read_chunked(reader, limit, None).await,
    }
}

/// Append one `\n`-terminated line of at most `max` bytes to `buf`.
///
/// Never reads more than `max + 1` bytes; returns 0 at end of stream.
async fn read_line_bounded<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max: usize,
) -> std::result::Result<usize, String>
where
    R: AsyncBufRead + Unpin,
{
    let n = (&mut *reader)
        .take(max as u64 + 1)
        .read_until(b'\n', buf)
        .await
        .map_err(|e| e.to_string())?;
    if n > max {
        return Err(format!("line exceeds {max} bytes"));
    }
    Ok(n)
}

/// Decode a chunked body of at most `limit` bytes. When `wire` is given, the
/// undecoded bytes (sizes, extensions, trailers) are appended to it.
async fn read_chunked<R>(
    reader: &mut R,
    limit: usize,
    mut wire: Option<&mut BytesMut>,
) -> std::result::Result<Bytes, String>
where
    R: AsyncBufRead + Unpin,
{
    // Framing overhead on top of the decoded body.
    let wire_limit = limit.saturating_add(MAX_REQUEST_SIZE);
    let mut consumed = 0usize;
    let mut body = BytesMut::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        if read_line_bounded(reader, &mut line, MAX_CHUNK_LINE).await? == 0 {
            return Err("connection closed mid-chunk".into());
        }
        let size_str = std::str::from_utf8(&line)
            .map_err(|_| "invalid chunk size line".to_string())?
            .split(';')
            .next()
            .unwrap_or("")
            .trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| format!("invalid chunk size: {size_str:?}"))?;
        consumed += line.len();
        if let Some(wire) = wire.as_deref_mut() {
            wire.extend_from_slice(&line);
        }
        if size == 0 {
            break;
        }
        if size > limit - body.len() || consumed > wire_limit {
            return Err(format!("body exceeds {limit} bytes"));
        }
        let start = body.len();
        body.resize(start + size, 0);
        reader
            .read_exact(&mut body[start..])
            .await
            .map_err(|e| format!("short chunk: {e}"))?;
        let mut crlf = [0u8; 2];
        reader
            .read_exact(&mut crlf)
            .await
            .map_err(|e| e.to_string())?;
        if &crlf != b"\r\n" {
            return Err("missing CRLF after chunk".into());
        }
        consumed += size + 2;
        if let Some(wire) = wire.as_deref_mut() {
            wire.extend_from_slice(&body[start..]);
            wire.extend_from_slice(&crlf);
        }
    }
    // Trailers
    let mut trailers = 0usize;
    loop {
        line.clear();
        let n = read_line_bounded(reader, &mut line, MAX_CHUNK_LINE).await?;
        trailers += n;
        if trailers > MAX_REQUEST_SIZE {
            return Err(format!("trailers exceed {MAX_REQUEST_SIZE} bytes"));
        }
        if let Some(wire) = wire.as_deref_mut() {
            wire.extend_from_slice(&line);
        }
        if n == 0 || line == b"\r\n" || line == b"\n" {
            break;
        }
    }
    Ok(body.freeze())
}
