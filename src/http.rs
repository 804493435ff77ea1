//! The HTTP/1.1 message codec: status/method/version vocabularies, the
//! header map, in-memory and spill-to-disk content, and the blocking
//! receive/dispatch state machine shared by the server loop and the
//! forwarding endpoint (which runs the same codec in "read a response"
//! mode against a downstream child).

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use strum_macros::{Display, EnumString};

use crate::error::{ServerError, ServerResult};
use crate::uri::Uri;

macro_rules! define_status {
    ($($name:ident = ($code:expr, $desc:expr)),* $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum HttpStatus {
            $($name,)*
        }

        impl HttpStatus {
            pub fn code(&self) -> u16 {
                match *self {
                    $(HttpStatus::$name => $code,)*
                }
            }

            pub fn description(&self) -> &'static str {
                match *self {
                    $(HttpStatus::$name => $desc,)*
                }
            }

            pub fn from_code(code: u16) -> Option<Self> {
                match code {
                    $($code => Some(HttpStatus::$name),)*
                    _ => None,
                }
            }
        }
    }
}

// Only the status codes the codec is specified to emit.
define_status! {
    Continue = (100, "Continue"),
    SwitchingProtocols = (101, "Switching Protocols"),
    EarlyHints = (103, "Early Hints"),

    Ok = (200, "OK"),
    Created = (201, "Created"),
    Accepted = (202, "Accepted"),
    NonAuthoritativeInformation = (203, "Non-Authoritative Information"),
    NoContent = (204, "No Content"),
    ResetContent = (205, "Reset Content"),
    PartialContent = (206, "Partial Content"),

    MultipleChoices = (300, "Multiple Choices"),
    MovedPermanently = (301, "Moved Permanently"),
    Found = (302, "Found"),
    NotModified = (304, "Not Modified"),
    PermanentRedirect = (308, "Permanent Redirect"),

    BadRequest = (400, "Bad Request"),
    Unauthorized = (401, "Unauthorized"),
    Forbidden = (403, "Forbidden"),
    NotFound = (404, "Not Found"),
    MethodNotAllowed = (405, "Method Not Allowed"),
    RequestTimeout = (408, "Request Timeout"),
    Gone = (410, "Gone"),
    ImATeapot = (418, "I'm a teapot"),

    InternalServerError = (500, "Internal Server Error"),
    NotImplemented = (501, "Not Implemented"),
    BadGateway = (502, "Bad Gateway"),
    ServiceUnavailable = (503, "Service Unavailable"),
    GatewayTimeout = (504, "Gateway Timeout"),
    HttpVersionNotSupported = (505, "HTTP Version Not Supported"),
}

impl fmt::Display for HttpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.description())
    }
}

impl From<&ServerError> for HttpStatus {
    fn from(err: &ServerError) -> Self {
        err.status_code()
            .and_then(HttpStatus::from_code)
            .unwrap_or(HttpStatus::InternalServerError)
    }
}

/// HTTP method vocabulary, exactly the set spec.md §6 lists as accepted.
#[derive(Default, Debug, Clone, Copy, EnumString, Display, Eq, PartialEq, Hash)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

/// HTTP version, parsed from the start line but never used to pick a
/// framing strategy beyond Content-Length (no HTTP/2 multiplexing).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http09,
    Http10,
    Http11,
    Http2,
}

impl FromStr for HttpVersion {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "HTTP/0.9" => Ok(HttpVersion::Http09),
            "HTTP/1.0" => Ok(HttpVersion::Http10),
            "HTTP/1.1" => Ok(HttpVersion::Http11),
            "HTTP/2" | "HTTP/2.0" => Ok(HttpVersion::Http2),
            other => Err(ServerError::HttpUnsupportedVersion(other.to_string())),
        }
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HttpVersion::Http09 => "HTTP/0.9",
            HttpVersion::Http10 => "HTTP/1.0",
            HttpVersion::Http11 => "HTTP/1.1",
            HttpVersion::Http2 => "HTTP/2",
        };
        write!(f, "{s}")
    }
}

/// Lowercased-key header map; last write for a given key wins.
#[derive(Debug, Clone, Default)]
pub struct Headers(HashMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

/// Anything that can report its length, grow, and serve a byte range —
/// the common surface `InMemoryContent` and `SpilledContent` both offer.
pub trait Content: fmt::Debug + Send {
    fn size(&self) -> usize;
    fn append(&mut self, bytes: &[u8]) -> io::Result<()>;
    /// Copies as much of `[from, from+dest.len())` as is available into
    /// `dest`, returning the number of bytes written.
    fn copy_to(&self, dest: &mut [u8], from: usize) -> usize;
}

#[derive(Debug, Default)]
pub struct InMemoryContent(Vec<u8>);

impl InMemoryContent {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Content for InMemoryContent {
    fn size(&self) -> usize {
        self.0.len()
    }

    fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.0.extend_from_slice(bytes);
        Ok(())
    }

    fn copy_to(&self, dest: &mut [u8], from: usize) -> usize {
        if from >= self.0.len() {
            return 0;
        }
        let n = (self.0.len() - from).min(dest.len());
        dest[..n].copy_from_slice(&self.0[from..from + n]);
        n
    }
}

/// File-backed content, engaged once `Content-Length` exceeds the
/// server's `max_in_mem_content_len`. The source this codec is modeled
/// on leaves this path unimplemented; here it is a real temp file with
/// guaranteed cleanup on drop.
#[derive(Debug)]
pub struct SpilledContent {
    path: PathBuf,
    file: std::fs::File,
    len: usize,
}

impl SpilledContent {
    pub fn new() -> io::Result<Self> {
        let named = tempfile::NamedTempFile::new()?;
        let (file, path) = named.keep().map_err(|e| e.error)?;
        Ok(Self { path, file, len: 0 })
    }
}

impl Content for SpilledContent {
    fn size(&self) -> usize {
        self.len
    }

    fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(bytes)?;
        self.len += bytes.len();
        Ok(())
    }

    fn copy_to(&self, dest: &mut [u8], from: usize) -> usize {
        if from >= self.len {
            return 0;
        }
        let mut file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(_) => return 0,
        };
        if file.seek(SeekFrom::Start(from as u64)).is_err() {
            return 0;
        }
        let want = (self.len - from).min(dest.len());
        file.read(&mut dest[..want]).unwrap_or(0)
    }
}

impl Drop for SpilledContent {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[derive(Debug)]
pub struct RequestMsg {
    pub version: HttpVersion,
    pub headers: Headers,
    pub content: Option<Box<dyn Content>>,
    pub method: Method,
    pub raw_target: String,
    pub uri: Uri,
    pub client_ip: String,
}

impl RequestMsg {
    pub fn new(method: Method, raw_target: &str, version: HttpVersion) -> ServerResult<Self> {
        Ok(Self {
            version,
            headers: Headers::new(),
            content: None,
            method,
            raw_target: raw_target.to_string(),
            uri: Uri::parse(raw_target)?,
            client_ip: String::new(),
        })
    }

    pub fn content_len(&self) -> usize {
        self.content.as_ref().map(|c| c.size()).unwrap_or(0)
    }
}

#[derive(Debug)]
pub struct ResponseMsg {
    pub version: HttpVersion,
    pub status: HttpStatus,
    pub headers: Headers,
    pub content: Option<Box<dyn Content>>,
}

impl ResponseMsg {
    pub fn new(status: HttpStatus) -> Self {
        Self {
            version: HttpVersion::Http11,
            status,
            headers: Headers::new(),
            content: None,
        }
    }

    pub fn with_body(status: HttpStatus, content_type: &str, body: Vec<u8>) -> Self {
        let mut resp = Self::new(status);
        resp.headers.set("content-type", content_type);
        resp.content = Some(Box::new(InMemoryContent::from_bytes(body)));
        resp
    }

    /// `{"errors": [...]}`, the codec's one error body format.
    pub fn error_json(status: HttpStatus, messages: &[String]) -> Self {
        let body = serde_json::json!({ "errors": messages });
        Self::with_body(status, "application/json", body.to_string().into_bytes())
    }

    pub fn from_server_error(err: &ServerError) -> Self {
        Self::error_json(HttpStatus::from(err), &[err.to_string()])
    }

    /// Sets `Content-Length` from the current content, as the codec does
    /// immediately before writing the response out.
    pub fn finalize(&mut self) {
        let len = self.content.as_ref().map(|c| c.size()).unwrap_or(0);
        self.headers.set("content-length", len.to_string());
    }
}

static HEADER_LINE_RX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([A-Za-z0-9_\-]+)\s*:\s*(.+?)\s*$").unwrap());
static REQUEST_LINE_RX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([A-Z]+)\s+(\S+)\s+(HTTP\S+)\s*$").unwrap());
static RESPONSE_LINE_RX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(HTTP\S+)\s+(\d+)\s+(.+?)\s*$").unwrap());

/// Buffer-scanning limits shared by request and response reads.
#[derive(Debug, Clone, Copy)]
pub struct ReceiveConfig {
    pub io_buf_size: usize,
    pub max_in_mem_content_len: usize,
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    if let Some(pos) = find_subslice(buf, b"\r\n\r\n") {
        return Some(pos + 4);
    }
    find_subslice(buf, b"\n\n").map(|pos| pos + 2)
}

/// Retries on `WouldBlock`/`Interrupted` (the non-blocking EAGAIN path in
/// the original codec); gives up after enough spurious wakeups that it is
/// clearly not a transient condition.
fn read_with_retry<R: Read>(stream: &mut R, buf: &mut [u8]) -> ServerResult<usize> {
    let mut attempts = 0;
    loop {
        match stream.read(buf) {
            Ok(n) => return Ok(n),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                attempts += 1;
                if attempts > 64 {
                    return Err(ServerError::ClientSocketError(e.to_string()));
                }
            }
            Err(e) => return Err(ServerError::ClientSocketError(e.to_string())),
        }
    }
}

fn write_all_retrying<W: Write>(stream: &mut W, mut bytes: &[u8]) -> ServerResult<()> {
    while !bytes.is_empty() {
        match stream.write(bytes) {
            Ok(0) => return Err(ServerError::ClientSocketError("short write".into())),
            Ok(n) => bytes = &bytes[n..],
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(ServerError::ClientSocketError(e.to_string())),
        }
    }
    Ok(())
}

fn read_header_block<R: Read>(stream: &mut R, io_buf_size: usize) -> ServerResult<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; io_buf_size.max(1)];
    loop {
        if let Some(end) = find_header_end(&buf) {
            let body_start = buf.split_off(end);
            return Ok((buf, body_start));
        }
        if buf.len() >= io_buf_size {
            return Err(ServerError::RequestHeaderTooLong);
        }
        let n = read_with_retry(stream, &mut chunk)?;
        if n == 0 {
            return Err(if buf.is_empty() {
                ServerError::ClientClosedConnection
            } else {
                ServerError::ClientSocketError("connection closed while reading headers".into())
            });
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn parse_headers(lines: &[&str]) -> ServerResult<Headers> {
    let mut headers = Headers::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let caps = HEADER_LINE_RX
            .captures(line)
            .ok_or_else(|| ServerError::request(format!("malformed header line: {line:?}")))?;
        headers.set(&caps[1], caps[2].to_string());
    }
    Ok(headers)
}

fn content_length_of(headers: &Headers) -> ServerResult<usize> {
    match headers.get("content-length") {
        None => Ok(0),
        Some(v) => v
            .trim()
            .parse::<usize>()
            .map_err(|_| ServerError::request(format!("bad content-length: {v:?}"))),
    }
}

fn read_body<R: Read>(
    stream: &mut R,
    already_read: Vec<u8>,
    content_length: usize,
    max_in_mem: usize,
) -> ServerResult<Option<Box<dyn Content>>> {
    if content_length == 0 {
        return Ok(None);
    }
    let mut content: Box<dyn Content> = if content_length > max_in_mem {
        Box::new(SpilledContent::new()?)
    } else {
        Box::new(InMemoryContent::from_bytes(Vec::with_capacity(content_length)))
    };

    let take = already_read.len().min(content_length);
    content.append(&already_read[..take])?;
    let mut remaining = content_length - take;

    let mut chunk = vec![0u8; 8192];
    while remaining > 0 {
        let want = remaining.min(chunk.len());
        let n = read_with_retry(stream, &mut chunk[..want])?;
        if n == 0 {
            return Err(ServerError::ClientSocketError(
                "connection closed while reading body".into(),
            ));
        }
        content.append(&chunk[..n])?;
        remaining -= n;
    }
    Ok(Some(content))
}

impl RequestMsg {
    /// Blocking receive: header-then-body state machine per the codec's
    /// `READING_HEADERS -> READING_BODY -> DONE` model.
    pub fn receive<R: Read>(
        stream: &mut R,
        cfg: &ReceiveConfig,
        client_ip: &str,
    ) -> ServerResult<Self> {
        let (header_block, rest) = read_header_block(stream, cfg.io_buf_size)?;
        let text = String::from_utf8_lossy(&header_block);
        let mut lines = text.split_inclusive('\n').map(|l| l.trim_end_matches(['\r', '\n']));

        let start_line = lines
            .next()
            .ok_or_else(|| ServerError::request("empty request"))?;
        let caps = REQUEST_LINE_RX
            .captures(start_line)
            .ok_or_else(|| ServerError::request(format!("malformed request line: {start_line:?}")))?;

        let method = caps[1]
            .parse::<Method>()
            .map_err(|_| ServerError::HttpUnsupportedMethod(caps[1].to_string()))?;
        let raw_target = caps[2].to_string();
        let version = caps[3].parse::<HttpVersion>()?;

        let header_lines: Vec<&str> = lines.collect();
        let headers = parse_headers(&header_lines)?;
        let content_length = content_length_of(&headers)?;
        let content = read_body(stream, rest, content_length, cfg.max_in_mem_content_len)?;

        let mut req = RequestMsg::new(method, &raw_target, version)?;
        req.headers = headers;
        req.content = content;
        req.client_ip = client_ip.to_string();
        Ok(req)
    }

    /// Writes the request out (client role — used by the forwarding
    /// endpoint to relay onto a downstream child).
    pub fn dispatch<W: Write>(&mut self, stream: &mut W, io_buf_size: usize) -> ServerResult<()> {
        self.headers
            .set("content-length", self.content_len().to_string());
        let start = format!("{} {} {}", self.method, self.raw_target, self.version);
        write_message(stream, &start, &self.headers, self.content.as_deref(), io_buf_size)
    }
}

impl ResponseMsg {
    /// Blocking receive in "parse a response" mode — used by the
    /// forwarding endpoint reading a downstream child's reply.
    pub fn receive<R: Read>(stream: &mut R, cfg: &ReceiveConfig) -> ServerResult<Self> {
        let (header_block, rest) = read_header_block(stream, cfg.io_buf_size)?;
        let text = String::from_utf8_lossy(&header_block);
        let mut lines = text.split_inclusive('\n').map(|l| l.trim_end_matches(['\r', '\n']));

        let start_line = lines
            .next()
            .ok_or_else(|| ServerError::request("empty response"))?;
        let caps = RESPONSE_LINE_RX
            .captures(start_line)
            .ok_or_else(|| ServerError::request(format!("malformed response line: {start_line:?}")))?;

        let version = caps[1].parse::<HttpVersion>()?;
        let code: u16 = caps[2]
            .parse()
            .map_err(|_| ServerError::request(format!("bad status code: {:?}", &caps[2])))?;
        let status = HttpStatus::from_code(code)
            .ok_or_else(|| ServerError::request(format!("unknown status code: {code}")))?;

        let header_lines: Vec<&str> = lines.collect();
        let headers = parse_headers(&header_lines)?;
        let content_length = content_length_of(&headers)?;
        let content = read_body(stream, rest, content_length, cfg.max_in_mem_content_len)?;

        Ok(ResponseMsg {
            version,
            status,
            headers,
            content,
        })
    }

    /// Writes the response out to the client (or, when the forwarding
    /// endpoint is relaying a downstream reply, back to the original
    /// client socket).
    pub fn dispatch<W: Write>(&mut self, stream: &mut W, io_buf_size: usize) -> ServerResult<()> {
        self.finalize();
        let start = format!("{} {}", self.version, self.status);
        write_message(stream, &start, &self.headers, self.content.as_deref(), io_buf_size)
    }
}

fn write_message<W: Write>(
    stream: &mut W,
    start_line: &str,
    headers: &Headers,
    content: Option<&dyn Content>,
    io_buf_size: usize,
) -> ServerResult<()> {
    let mut head = String::new();
    head.push_str(start_line);
    head.push_str("\r\n");
    for (k, v) in headers.iter() {
        head.push_str(k);
        head.push_str(": ");
        head.push_str(v);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    write_all_retrying(stream, head.as_bytes())?;

    if let Some(content) = content {
        let total = content.size();
        let mut sent = 0;
        let mut buf = vec![0u8; io_buf_size.max(1)];
        while sent < total {
            let n = content.copy_to(&mut buf, sent);
            if n == 0 {
                break;
            }
            write_all_retrying(stream, &buf[..n])?;
            sent += n;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn cfg() -> ReceiveConfig {
        ReceiveConfig {
            io_buf_size: 4096,
            max_in_mem_content_len: 1024,
        }
    }

    #[test]
    fn receive_request_with_crlf_headers() {
        let raw = b"GET /api/proc HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhello";
        let mut cursor = Cursor::new(raw.to_vec());
        let req = RequestMsg::receive(&mut cursor, &cfg(), "127.0.0.1").unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.headers.get("host"), Some("localhost"));
        assert_eq!(req.content_len(), 5);
    }

    #[test]
    fn receive_request_accepts_bare_lf_headers() {
        let raw = b"GET / HTTP/1.1\nHost: x\n\nbody-ignored-since-no-length";
        let mut cursor = Cursor::new(raw.to_vec());
        let req = RequestMsg::receive(&mut cursor, &cfg(), "127.0.0.1").unwrap();
        assert_eq!(req.content_len(), 0);
    }

    #[test]
    fn oversized_header_block_yields_431() {
        let raw = vec![b'a'; 100];
        let mut cursor = Cursor::new(raw);
        let tiny = ReceiveConfig {
            io_buf_size: 32,
            max_in_mem_content_len: 1024,
        };
        let err = RequestMsg::receive(&mut cursor, &tiny, "127.0.0.1").unwrap_err();
        assert!(matches!(err, ServerError::RequestHeaderTooLong));
    }

    #[test]
    fn header_keys_are_case_insensitive_on_lookup() {
        let mut h = Headers::new();
        h.set("Content-Type", "application/json");
        assert_eq!(h.get("content-type"), Some("application/json"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("application/json"));
    }

    #[test]
    fn dispatch_round_trips_through_receive() {
        let mut resp = ResponseMsg::with_body(HttpStatus::Ok, "text/plain", b"hi".to_vec());
        let mut out = Vec::new();
        resp.dispatch(&mut out, 16).unwrap();

        let mut cursor = Cursor::new(out);
        let parsed = ResponseMsg::receive(&mut cursor, &cfg()).unwrap();
        assert_eq!(parsed.status.code(), 200);
        assert_eq!(parsed.content.unwrap().size(), 2);
    }

    #[test]
    fn unsupported_version_is_rejected() {
        assert!("HTTP/3".parse::<HttpVersion>().is_err());
    }
}
