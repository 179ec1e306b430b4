//! Incremental HTTP/1.x request parser.
//!
//! The parser is driven over whatever bytes are buffered and returns how
//! many it consumed; it never looks past a line it cannot complete.
//!
//! ```text
//! AwaitingRequestLine ──line──▶ AwaitingHeaders ──blank──▶ AwaitingBody ──▶ Complete
//!         │                          │                          │
//!         └──────────────────────────┴──────── malformed ───────┴──▶ Failed
//! ```
//!
//! Bodies are bounded by `Content-Length` and may span many reads. A
//! request without `Content-Length` completes at the blank line.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use ember_core::{log_debug, log_info, Logger};

use crate::credentials::CredentialStore;

/// Pages that are served with an implicit `.html` suffix
pub const DEFAULT_PAGES: [&str; 6] = [
    "/index", "/register", "/login", "/welcome", "/video", "/picture",
];

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
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
    pub fn as_str(&self) -> &'static str {
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

impl FromStr for Method {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "HEAD" => Ok(Method::Head),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "TRACE" => Ok(Method::Trace),
            "OPTIONS" => Ok(Method::Options),
            "CONNECT" => Ok(Method::Connect),
            "PATCH" => Ok(Method::Patch),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseState {
    #[default]
    AwaitingRequestLine,
    AwaitingHeaders,
    AwaitingBody,
    Complete,
    Failed,
}

impl ParseState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ParseState::Complete | ParseState::Failed)
    }
}

/// One parsed request
#[derive(Debug, Clone, Default)]
pub struct Request {
    method: Method,
    path: String,
    version: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    form: HashMap<String, String>,
}

impl Request {
    pub fn method(&self) -> Method {
        self.method
    }

    /// Path after default-page canonicalization
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Version digits after `HTTP/`, e.g. `1.1`
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Decoded urlencoded form fields (populated by `apply_form_action`)
    pub fn form_field(&self, name: &str) -> Option<&str> {
        self.form.get(name).map(String::as_str)
    }

    pub fn keep_alive(&self) -> bool {
        self.version == "1.1"
            && self
                .header("connection")
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("keep-alive"))
    }

    /// Handle the login/register form POST.
    ///
    /// On `/login.html` and `/register.html` the form is checked against
    /// `store` and the path rewritten to `/welcome.html` or `/error.html`.
    pub fn apply_form_action(&mut self, store: &dyn CredentialStore, logger: &Logger) {
        if self.method != Method::Post {
            return;
        }
        let is_form = self
            .header("content-type")
            .is_some_and(|ct| ct.trim().eq_ignore_ascii_case(FORM_URLENCODED));
        if !is_form {
            return;
        }
        self.form = parse_urlencoded(&self.body);

        let is_login = match self.path.as_str() {
            "/login.html" => true,
            "/register.html" => false,
            _ => return,
        };
        let name = self.form.get("username").map(String::as_str).unwrap_or("");
        let password = self.form.get("password").map(String::as_str).unwrap_or("");

        let verified = if name.is_empty() || password.is_empty() {
            false
        } else if is_login {
            log_info!(logger, "user login, name: {}", name);
            store.login(name, password)
        } else {
            log_info!(logger, "register new user, name: {}", name);
            store.register(name, password)
        };
        log_debug!(logger, "form {} for '{}': {}", self.path, name, verified);

        self.path = if verified { "/welcome.html" } else { "/error.html" }.to_string();
    }
}

/// Incremental parser over a byte buffer
#[derive(Debug, Default)]
pub struct RequestParser {
    state: ParseState,
    request: Request,
    content_length: usize,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Request fields parsed so far
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Move the parsed request out, leaving an empty one behind
    pub fn take_request(&mut self) -> Request {
        std::mem::take(&mut self.request)
    }

    /// Back to `AwaitingRequestLine` for the next request on a connection
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Consume as much of `buf` as possible; returns bytes consumed.
    ///
    /// Stops at the first incomplete line, at an incomplete body, or on
    /// reaching a terminal state.
    pub fn advance(&mut self, buf: &[u8]) -> usize {
        let mut consumed = 0;
        while !self.state.is_terminal() {
            let rest = &buf[consumed..];

            if self.state == ParseState::AwaitingBody {
                if rest.len() < self.content_length {
                    break;
                }
                self.request.body = rest[..self.content_length].to_vec();
                consumed += self.content_length;
                self.state = ParseState::Complete;
                break;
            }

            let Some(end) = find_crlf(rest) else { break };
            let line = &rest[..end];
            consumed += end + 2;

            self.state = match std::str::from_utf8(line) {
                Ok(line) => match self.state {
                    ParseState::AwaitingRequestLine => self.parse_request_line(line),
                    _ => self.parse_header_line(line),
                },
                Err(_) => ParseState::Failed,
            };
        }
        consumed
    }

    fn parse_request_line(&mut self, line: &str) -> ParseState {
        let mut parts = line.split(' ');
        let (Some(method), Some(path), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return ParseState::Failed;
        };
        let Ok(method) = method.parse::<Method>() else {
            return ParseState::Failed;
        };
        let Some(version) = version.strip_prefix("HTTP/") else {
            return ParseState::Failed;
        };
        if path.is_empty() || version.is_empty() {
            return ParseState::Failed;
        }

        self.request.method = method;
        self.request.version = version.to_string();
        self.request.path = canonical_path(path);
        ParseState::AwaitingHeaders
    }

    fn parse_header_line(&mut self, line: &str) -> ParseState {
        if line.is_empty() {
            return self.finish_headers();
        }
        let Some((name, value)) = line.split_once(':') else {
            return ParseState::Failed;
        };
        if name.is_empty() || name.contains(' ') {
            return ParseState::Failed;
        }
        let value = value.strip_prefix(' ').unwrap_or(value);
        self.request
            .headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        ParseState::AwaitingHeaders
    }

    fn finish_headers(&mut self) -> ParseState {
        match self.request.header("content-length") {
            None => ParseState::Complete,
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(0) => ParseState::Complete,
                Ok(n) => {
                    self.content_length = n;
                    ParseState::AwaitingBody
                }
                Err(_) => ParseState::Failed,
            },
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// `/` → `/index.html`, default pages gain `.html`, anything else as-is
pub fn canonical_path(path: &str) -> String {
    if path == "/" {
        return "/index.html".to_string();
    }
    if DEFAULT_PAGES.contains(&path) {
        return format!("{}.html", path);
    }
    path.to_string()
}

/// Split `a=1&b=2` into a map, decoding `+` and `%XX`
pub fn parse_urlencoded(body: &[u8]) -> HashMap<String, String> {
    let body = String::from_utf8_lossy(body);
    body.split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            if key.is_empty() {
                return None;
            }
            Some((url_decode(key), url_decode(value)))
        })
        .collect()
}

fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                match (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
