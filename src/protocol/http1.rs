use memchr::memchr2;

/// HTTP/1.1 Request Parsing
///
/// This module provides the incremental request parser the connection
/// state machine drives. It includes:
/// - ReadBuf: fixed-capacity receive buffer with parse cursors
/// - RequestParser: line scanner plus the request-line/headers/body machine
/// - Helper functions for header matching and number parsing

// ============================================================================
// Parser States
// ============================================================================

/// Main state machine phase. Only ever moves forward within one request.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum CheckState {
    RequestLine,
    Headers,
    Content,
}

/// Result of the most recent line-extraction attempt.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LineStatus {
    Ok,
    Bad,
    Open,
}

/// Outcome of parsing and resolving a request. Everything except
/// `NoRequest` is terminal for the current request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HttpCode {
    /// Incomplete, more bytes must be read.
    NoRequest,
    GetRequest,
    BadRequest,
    NoResource,
    ForbiddenRequest,
    FileRequest,
    InternalError,
    ClosedConnection,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Method {
    #[default]
    Get,
    Post,
    Head,
    Put,
    Delete,
    Trace,
    Options,
    Connect,
    Patch,
}

impl Method {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        Some(match bytes.to_ascii_uppercase().as_slice() {
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            b"HEAD" => Method::Head,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"TRACE" => Method::Trace,
            b"OPTIONS" => Method::Options,
            b"CONNECT" => Method::Connect,
            b"PATCH" => Method::Patch,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Trace => "TRACE",
            Method::Options => "OPTIONS",
            Method::Connect => "CONNECT",
            Method::Patch => "PATCH",
        }
    }
}

/// Fields collected from the request line, headers and body.
#[derive(Debug, Default, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub url: String,
    pub version: String,
    pub host: Option<String>,
    pub content_length: usize,
    /// `Connection: keep-alive` was sent.
    pub linger: bool,
    /// POST request, routed through the credential-check handlers.
    pub cgi: bool,
    pub body: Option<String>,
}

// ============================================================================
// Read Buffer
// ============================================================================

/// Fixed-capacity receive buffer.
///
/// Cursors: `read_idx` ends the received data, `checked_idx` is the next
/// byte to scan, `start_line` opens the line being parsed.
/// `start_line <= checked_idx <= read_idx <= capacity` always holds.
pub struct ReadBuf {
    data: Vec<u8>,
    read_idx: usize,
    checked_idx: usize,
    start_line: usize,
}

impl ReadBuf {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            data: vec![0; cap],
            read_idx: 0,
            checked_idx: 0,
            start_line: 0,
        }
    }

    /// Free tail of the buffer for the next recv
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.read_idx..]
    }

    /// Mark that n bytes were written to the spare tail
    pub fn wrote(&mut self, n: usize) {
        debug_assert!(self.read_idx + n <= self.data.len());
        self.read_idx = (self.read_idx + n).min(self.data.len());
    }

    pub fn is_full(&self) -> bool {
        self.read_idx == self.data.len()
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn read_idx(&self) -> usize {
        self.read_idx
    }

    pub fn checked_idx(&self) -> usize {
        self.checked_idx
    }

    pub fn start_line(&self) -> usize {
        self.start_line
    }

    pub fn clear(&mut self) {
        self.data.fill(0);
        self.read_idx = 0;
        self.checked_idx = 0;
        self.start_line = 0;
    }
}

// ============================================================================
// Request Parser
// ============================================================================

pub struct RequestParser {
    buf: ReadBuf,
    state: CheckState,
    line_status: LineStatus,
    request: RequestHead,
}

impl RequestParser {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: ReadBuf::with_capacity(cap),
            state: CheckState::RequestLine,
            line_status: LineStatus::Open,
            request: RequestHead::default(),
        }
    }

    /// Forget the current request and all buffered bytes.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.state = CheckState::RequestLine;
        self.line_status = LineStatus::Open;
        self.request = RequestHead::default();
    }

    pub fn buffer(&self) -> &ReadBuf {
        &self.buf
    }

    pub fn buffer_mut(&mut self) -> &mut ReadBuf {
        &mut self.buf
    }

    pub fn state(&self) -> CheckState {
        self.state
    }

    pub fn line_status(&self) -> LineStatus {
        self.line_status
    }

    pub fn request(&self) -> &RequestHead {
        &self.request
    }

    /// Scan for the next CRLF between `checked_idx` and `read_idx`.
    ///
    /// On `LineStatus::Ok` the terminator is overwritten with NULs and
    /// `checked_idx` points past it. A `\r` that is the last buffered byte
    /// leaves `checked_idx` on it so the next call rescans it.
    pub fn parse_line(&mut self) -> LineStatus {
        let b = &mut self.buf;
        let status = match memchr2(b'\r', b'\n', &b.data[b.checked_idx..b.read_idx]) {
            None => {
                b.checked_idx = b.read_idx;
                LineStatus::Open
            }
            Some(rel) => {
                let pos = b.checked_idx + rel;
                if b.data[pos] == b'\r' {
                    if pos + 1 == b.read_idx {
                        b.checked_idx = pos;
                        LineStatus::Open
                    } else if b.data[pos + 1] == b'\n' {
                        b.data[pos] = 0;
                        b.data[pos + 1] = 0;
                        b.checked_idx = pos + 2;
                        LineStatus::Ok
                    } else {
                        b.checked_idx = pos;
                        LineStatus::Bad
                    }
                } else {
                    // a `\r` before this `\n` would have been found first
                    b.checked_idx = pos;
                    LineStatus::Bad
                }
            }
        };
        self.line_status = status;
        status
    }

    /// Consume buffered lines until the request is complete, malformed, or
    /// more bytes are needed.
    ///
    /// Returns `GetRequest` once the whole request (and its body, if any)
    /// is buffered; resolving it is up to the caller.
    pub fn process_read(&mut self) -> HttpCode {
        loop {
            if self.state == CheckState::Content {
                return self.parse_content();
            }

            match self.parse_line() {
                LineStatus::Ok => {}
                LineStatus::Bad => return HttpCode::BadRequest,
                LineStatus::Open => {
                    // a full buffer with no line end can never complete
                    return if self.buf.is_full() {
                        HttpCode::BadRequest
                    } else {
                        HttpCode::NoRequest
                    };
                }
            }

            let start = self.buf.start_line;
            let end = self.buf.checked_idx - 2;
            self.buf.start_line = self.buf.checked_idx;
            let line = &self.buf.data[start..end];

            let code = match self.state {
                CheckState::RequestLine => {
                    let code = parse_request_line(line, &mut self.request);
                    if code == HttpCode::NoRequest {
                        self.advance(CheckState::Headers);
                    }
                    code
                }
                CheckState::Headers => {
                    let code = parse_header(line, &mut self.request);
                    if code == HttpCode::NoRequest && line.is_empty() {
                        self.advance(CheckState::Content);
                    }
                    code
                }
                CheckState::Content => unreachable!("content is not line oriented"),
            };

            if code != HttpCode::NoRequest {
                return code;
            }
        }
    }

    fn parse_content(&mut self) -> HttpCode {
        let b = &mut self.buf;
        let len = self.request.content_length;
        if b.read_idx - b.checked_idx >= len {
            let body = &b.data[b.checked_idx..b.checked_idx + len];
            self.request.body = Some(String::from_utf8_lossy(body).into_owned());
            b.checked_idx += len;
            b.start_line = b.checked_idx;
            return HttpCode::GetRequest;
        }
        if len > b.data.len() - b.checked_idx {
            tracing::debug!(
                content_length = len,
                capacity = b.data.len(),
                "request body exceeds read buffer"
            );
            return HttpCode::BadRequest;
        }
        HttpCode::NoRequest
    }

    fn advance(&mut self, next: CheckState) {
        debug_assert!(next > self.state, "parse state regressed");
        self.state = next;
    }
}

/// Parse `METHOD URL VERSION`.
fn parse_request_line(line: &[u8], req: &mut RequestHead) -> HttpCode {
    let Some(method_end) = line.iter().position(|&b| b == b' ' || b == b'\t') else {
        return HttpCode::BadRequest;
    };
    let Some(method) = Method::from_bytes(&line[..method_end]) else {
        return HttpCode::BadRequest;
    };
    req.method = method;
    req.cgi = method == Method::Post;

    let rest = trim_ascii_whitespace(&line[method_end..]);
    let Some(url_end) = rest.iter().position(|&b| b == b' ' || b == b'\t') else {
        return HttpCode::BadRequest;
    };
    let mut url = &rest[..url_end];
    let version = trim_ascii_whitespace(&rest[url_end..]);
    if !ascii_equals_ignore_case(version, b"HTTP/1.1") {
        return HttpCode::BadRequest;
    }

    // absolute-form: drop scheme and authority
    for scheme in [&b"http://"[..], &b"https://"[..]] {
        if url.len() >= scheme.len() && ascii_equals_ignore_case(&url[..scheme.len()], scheme) {
            let authority_and_path = &url[scheme.len()..];
            url = match authority_and_path.iter().position(|&b| b == b'/') {
                Some(slash) => &authority_and_path[slash..],
                None => return HttpCode::BadRequest,
            };
            break;
        }
    }
    if url.first() != Some(&b'/') {
        return HttpCode::BadRequest;
    }
    let Ok(url) = std::str::from_utf8(url) else {
        return HttpCode::BadRequest;
    };

    req.url = if url == "/" {
        "/judge.html".to_string()
    } else {
        url.to_string()
    };
    req.version = String::from_utf8_lossy(version).into_owned();
    HttpCode::NoRequest
}

/// Parse one header line. An empty line ends the header block.
fn parse_header(line: &[u8], req: &mut RequestHead) -> HttpCode {
    if line.is_empty() {
        return if req.content_length != 0 {
            HttpCode::NoRequest
        } else {
            HttpCode::GetRequest
        };
    }

    let Some(colon_index) = line.iter().position(|&b| b == b':') else {
        tracing::debug!(header = %String::from_utf8_lossy(line), "ignoring malformed header");
        return HttpCode::NoRequest;
    };
    let (raw_name, raw_value) = line.split_at(colon_index);
    let name = trim_ascii_whitespace(raw_name);
    let value = trim_ascii_whitespace(&raw_value[1..]);

    if ascii_equals_ignore_case(name, b"Connection") {
        req.linger = ascii_equals_ignore_case(value, b"keep-alive");
    } else if ascii_equals_ignore_case(name, b"Content-Length") {
        match parse_usize_decimal_strict(value) {
            Some(n) => req.content_length = n,
            None => return HttpCode::BadRequest,
        }
    } else if ascii_equals_ignore_case(name, b"Host") {
        if !value.is_empty() {
            req.host = Some(String::from_utf8_lossy(value).into_owned());
        }
    } else {
        tracing::trace!(header = %String::from_utf8_lossy(name), "unknown header");
    }
    HttpCode::NoRequest
}

// ============================================================================
// Helper Functions
// ============================================================================

#[inline]
fn ascii_equals_ignore_case(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).all(|(&x, &y)| x.eq_ignore_ascii_case(&y))
}

#[inline]
fn trim_ascii_whitespace(mut bytes: &[u8]) -> &[u8] {
    while !bytes.is_empty() && (bytes[0] == b' ' || bytes[0] == b'\t') {
        bytes = &bytes[1..];
    }
    while !bytes.is_empty() && (bytes[bytes.len() - 1] == b' ' || bytes[bytes.len() - 1] == b'\t') {
        bytes = &bytes[..bytes.len() - 1];
    }
    bytes
}

#[inline]
fn parse_usize_decimal_strict(input: &[u8]) -> Option<usize> {
    let digits = trim_ascii_whitespace(input);
    if digits.is_empty() {
        return None;
    }
    let mut value: usize = 0;
    for &ch in digits {
        if !ch.is_ascii_digit() {
            return None;
        }
        let digit = (ch - b'0') as usize;
        value = value.checked_mul(10)?.checked_add(digit)?;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constants::READ_BUFFER_SIZE;

    fn feed(parser: &mut RequestParser, bytes: &[u8]) -> HttpCode {
        let spare = parser.buffer_mut().spare_mut();
        let n = bytes.len().min(spare.len());
        spare[..n].copy_from_slice(&bytes[..n]);
        parser.buffer_mut().wrote(n);
        parser.process_read()
    }

    fn parse_whole(input: &[u8]) -> (HttpCode, RequestParser) {
        let mut parser = RequestParser::with_capacity(READ_BUFFER_SIZE);
        let code = feed(&mut parser, input);
        (code, parser)
    }

    fn parse_chunked(input: &[u8], chunk: usize) -> HttpCode {
        let mut parser = RequestParser::with_capacity(READ_BUFFER_SIZE);
        let mut code = HttpCode::NoRequest;
        for piece in input.chunks(chunk) {
            code = feed(&mut parser, piece);
            if code != HttpCode::NoRequest {
                break;
            }
        }
        code
    }

    #[test]
    fn parses_simple_get() {
        let (code, parser) =
            parse_whole(b"GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n");
        assert_eq!(code, HttpCode::GetRequest);

        let req = parser.request();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.url, "/index.html");
        assert_eq!(req.version, "HTTP/1.1");
        assert_eq!(req.host.as_deref(), Some("x"));
        assert!(req.linger);
        assert!(!req.cgi);
    }

    #[test]
    fn root_url_maps_to_judge_page() {
        let (code, parser) = parse_whole(b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(code, HttpCode::GetRequest);
        assert_eq!(parser.request().url, "/judge.html");
    }

    #[test]
    fn absolute_url_is_stripped_to_path() {
        let (code, parser) = parse_whole(b"GET http://example.com/a/b.html HTTP/1.1\r\n\r\n");
        assert_eq!(code, HttpCode::GetRequest);
        assert_eq!(parser.request().url, "/a/b.html");

        let (code, _) = parse_whole(b"GET http://example.com HTTP/1.1\r\n\r\n");
        assert_eq!(code, HttpCode::BadRequest);
    }

    #[test]
    fn rejects_unknown_method_and_version() {
        assert_eq!(parse_whole(b"BREW /pot HTTP/1.1\r\n\r\n").0, HttpCode::BadRequest);
        assert_eq!(parse_whole(b"GET /index.html HTTP/1.0\r\n\r\n").0, HttpCode::BadRequest);
        assert_eq!(parse_whole(b"GET\r\n\r\n").0, HttpCode::BadRequest);
        assert_eq!(parse_whole(b"GET index.html HTTP/1.1\r\n\r\n").0, HttpCode::BadRequest);
    }

    #[test]
    fn other_methods_are_parsed() {
        let (code, parser) = parse_whole(b"delete /x HTTP/1.1\r\n\r\n");
        assert_eq!(code, HttpCode::GetRequest);
        assert_eq!(parser.request().method, Method::Delete);
    }

    #[test]
    fn unknown_headers_are_ignored() {
        let (code, parser) =
            parse_whole(b"GET /a HTTP/1.1\r\nUser-Agent: t\r\nAccept: */*\r\nConnection: close\r\n\r\n");
        assert_eq!(code, HttpCode::GetRequest);
        assert!(!parser.request().linger);
    }

    #[test]
    fn bad_content_length_is_rejected() {
        let (code, _) = parse_whole(b"POST /a HTTP/1.1\r\nContent-Length: ten\r\n\r\n");
        assert_eq!(code, HttpCode::BadRequest);
    }

    #[test]
    fn huge_content_length_is_rejected() {
        let max = format!(
            "POST /2 HTTP/1.1\r\nContent-Length: {}\r\n\r\nab",
            usize::MAX
        );
        let (code, parser) = parse_whole(max.as_bytes());
        assert_eq!(code, HttpCode::BadRequest);
        assert_eq!(parser.request().content_length, usize::MAX);

        // does not fit in a usize at all
        let (code, _) =
            parse_whole(b"POST /2 HTTP/1.1\r\nContent-Length: 99999999999999999999999\r\n\r\nab");
        assert_eq!(code, HttpCode::BadRequest);
    }

    #[test]
    fn crlf_split_across_reads_is_one_line_end() {
        let mut parser = RequestParser::with_capacity(READ_BUFFER_SIZE);
        assert_eq!(feed(&mut parser, b"GET /a HTTP/1.1\r"), HttpCode::NoRequest);
        assert_eq!(parser.line_status(), LineStatus::Open);
        assert_eq!(feed(&mut parser, b"\n\r"), HttpCode::NoRequest);
        assert_eq!(parser.state(), CheckState::Headers);
        assert_eq!(feed(&mut parser, b"\n"), HttpCode::GetRequest);
    }

    #[test]
    fn bare_line_feed_is_bad() {
        let (code, parser) = parse_whole(b"GET /a HTTP/1.1\nHost: x\r\n\r\n");
        assert_eq!(code, HttpCode::BadRequest);
        assert_eq!(parser.line_status(), LineStatus::Bad);

        let (code, _) = parse_whole(b"GET /a HTTP/1.1\rHost: x\r\n\r\n");
        assert_eq!(code, HttpCode::BadRequest);
    }

    #[test]
    fn post_waits_for_full_body() {
        let mut parser = RequestParser::with_capacity(READ_BUFFER_SIZE);
        let head = b"POST /2CGISQL.cgi HTTP/1.1\r\nContent-Length: 20\r\n\r\n";
        assert_eq!(feed(&mut parser, head), HttpCode::NoRequest);
        assert_eq!(parser.state(), CheckState::Content);

        assert_eq!(feed(&mut parser, b"user=alice&"), HttpCode::NoRequest);
        assert_eq!(feed(&mut parser, b"password"), HttpCode::NoRequest);
        assert_eq!(feed(&mut parser, b"="), HttpCode::GetRequest);

        let req = parser.request();
        assert!(req.cgi);
        assert_eq!(req.body.as_deref(), Some("user=alice&password="));
    }

    #[test]
    fn chunk_boundaries_do_not_change_outcome() {
        let inputs: [&[u8]; 5] = [
            b"GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n",
            b"POST /3CGISQL.cgi HTTP/1.1\r\nContent-Length: 22\r\n\r\nuser=bob&password=pass",
            b"PUT /a HTTP/1.1\r\nX-Thing: y\r\n\r\n",
            b"GET /a HTTP/1.1\r\nHost: x\n\r\n",
            b"GET /a HTTP/1.0\r\n\r\n",
        ];
        for input in inputs {
            let (whole, _) = parse_whole(input);
            for chunk in [1, 2, 3, 5, 7, 16, 64] {
                assert_eq!(
                    parse_chunked(input, chunk),
                    whole,
                    "chunk size {chunk} for {:?}",
                    String::from_utf8_lossy(input)
                );
            }
        }
    }

    #[test]
    fn state_never_regresses_and_cursors_hold() {
        let input = b"POST /2 HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\n\r\nabcd";
        let mut parser = RequestParser::with_capacity(READ_BUFFER_SIZE);
        let mut last = parser.state();
        for byte in input {
            let code = feed(&mut parser, std::slice::from_ref(byte));
            assert!(parser.state() >= last);
            last = parser.state();

            let b = parser.buffer();
            assert!(b.start_line() <= b.checked_idx());
            assert!(b.checked_idx() <= b.read_idx());
            assert!(b.read_idx() <= b.capacity());
            if code != HttpCode::NoRequest {
                assert_eq!(code, HttpCode::GetRequest);
            }
        }
        assert_eq!(parser.request().body.as_deref(), Some("abcd"));
    }

    #[test]
    fn oversized_line_is_bad_request() {
        let mut parser = RequestParser::with_capacity(64);
        let mut line = b"GET /".to_vec();
        line.resize(200, b'a');
        assert_eq!(feed(&mut parser, &line), HttpCode::BadRequest);
        assert!(parser.buffer().is_full());
        assert_eq!(parser.buffer().read_idx(), 64);
    }

    #[test]
    fn oversized_body_is_bad_request() {
        let mut parser = RequestParser::with_capacity(64);
        let code = feed(&mut parser, b"POST /a HTTP/1.1\r\nContent-Length: 500\r\n\r\n");
        assert_eq!(code, HttpCode::BadRequest);
    }

    #[test]
    fn reset_clears_request_and_cursors() {
        let (_, mut parser) = parse_whole(b"GET /a HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
        parser.reset();
        assert_eq!(parser.state(), CheckState::RequestLine);
        assert_eq!(parser.buffer().read_idx(), 0);
        assert!(!parser.request().linger);
    }
}
