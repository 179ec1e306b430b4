//! Response resolution and serialization.
//!
//! `Response::for_request` decides the status from the filesystem:
//!
//! | resource                        | status |
//! |---------------------------------|--------|
//! | missing, a directory, or `..`   | 404    |
//! | no world-read permission        | 403    |
//! | otherwise                       | 200    |
//!
//! Error statuses are served from `/400.html`, `/403.html`, `/404.html`
//! under the same document root. `build` produces a `PendingWrite` whose
//! body is a read-only mapping of the resource.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::buffer::{Body, PendingWrite};
use crate::mapped::MappedFile;

const KEEP_ALIVE_PARAMS: &str = "max=6, timeout=120";

/// Suffix → MIME type; anything else is `text/plain`
const CONTENT_TYPES: &[(&str, &str)] = &[
    (".html", "text/html"),
    (".xml", "text/xml"),
    (".xhtml", "application/xhtml+xml"),
    (".txt", "text/plain"),
    (".rtf", "application/rtf"),
    (".pdf", "application/pdf"),
    (".word", "application/msword"),
    (".png", "image/png"),
    (".gif", "image/gif"),
    (".jpg", "image/jpeg"),
    (".jpeg", "image/jpeg"),
    (".au", "audio/basic"),
    (".mpeg", "video/mpeg"),
    (".mpg", "video/mpeg"),
    (".avi", "video/x-msvideo"),
    (".gz", "application/x-gzip"),
    (".tar", "application/x-tar"),
    (".css", "text/css"),
    (".js", "text/javascript"),
];

pub fn content_type_for(path: &str) -> &'static str {
    let Some(idx) = path.rfind('.') else {
        return "text/plain";
    };
    let suffix = &path[idx..];
    CONTENT_TYPES
        .iter()
        .find(|(s, _)| *s == suffix)
        .map_or("text/plain", |&(_, ct)| ct)
}

/// Reason phrase; unknown codes are reported as 400
pub fn status_reason(code: u16) -> Option<&'static str> {
    match code {
        200 => Some("OK"),
        400 => Some("Bad Request"),
        403 => Some("Forbidden"),
        404 => Some("Not Found"),
        _ => None,
    }
}

fn error_page(code: u16) -> Option<&'static str> {
    match code {
        400 => Some("/400.html"),
        403 => Some("/403.html"),
        404 => Some("/404.html"),
        _ => None,
    }
}

/// Resolved response, not yet serialized
#[derive(Debug, Clone)]
pub struct Response {
    code: u16,
    keep_alive: bool,
    path: String,
    doc_root: PathBuf,
    head_only: bool,
}

impl Response {
    /// Resolve `path` under `doc_root` and pick the status
    pub fn for_request(doc_root: &Path, path: &str, keep_alive: bool) -> Self {
        let code = resolve_status(doc_root, path);
        let path = error_page(code).unwrap_or(path).to_string();
        Self {
            code,
            keep_alive,
            path,
            doc_root: doc_root.to_path_buf(),
            head_only: false,
        }
    }

    /// 400 for a request that failed to parse; never keep-alive
    pub fn bad_request(doc_root: &Path) -> Self {
        Self::with_code(doc_root, 400, false)
    }

    /// Explicit status. Unknown codes become 400.
    pub fn with_code(doc_root: &Path, code: u16, keep_alive: bool) -> Self {
        let code = if status_reason(code).is_some() { code } else { 400 };
        let path = error_page(code).unwrap_or("/").to_string();
        Self {
            code,
            keep_alive,
            path,
            doc_root: doc_root.to_path_buf(),
            head_only: false,
        }
    }

    /// Answer a HEAD request: same headers, no body bytes
    pub fn head_only(mut self, head_only: bool) -> Self {
        self.head_only = head_only;
        self
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Path actually served (error page for non-200)
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn content_type(&self) -> &'static str {
        content_type_for(&self.path)
    }

    /// Serialize to header block plus body span.
    ///
    /// A resource that cannot be opened or mapped is replaced by an inline
    /// HTML error body appended to the header block.
    pub fn build(&self) -> PendingWrite {
        let reason = status_reason(self.code).unwrap_or("Bad Request");
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.code, reason);
        if self.keep_alive {
            head.push_str("Connection: keep-alive\r\n");
            head.push_str(&format!("Keep-Alive: {}\r\n", KEEP_ALIVE_PARAMS));
        } else {
            head.push_str("Connection: close\r\n");
        }

        let resource = resolve(&self.doc_root, &self.path);
        if self.head_only {
            let (content_type, len) = match fs::metadata(&resource) {
                Ok(meta) => (self.content_type(), meta.len() as usize),
                Err(_) => ("text/html", self.inline_error("File NotFound!").len()),
            };
            push_entity_headers(&mut head, content_type, len);
            return PendingWrite::new(head.into_bytes(), None);
        }

        match MappedFile::open(&resource) {
            Ok(map) => {
                let len = map.as_ref().map_or(0, MappedFile::len);
                push_entity_headers(&mut head, self.content_type(), len);
                PendingWrite::new(head.into_bytes(), map.map(Body::Mapped))
            }
            Err(_) => {
                let inline = self.inline_error("File NotFound!");
                push_entity_headers(&mut head, "text/html", inline.len());
                head.push_str(&inline);
                PendingWrite::new(head.into_bytes(), None)
            }
        }
    }

    fn inline_error(&self, message: &str) -> String {
        let reason = status_reason(self.code).unwrap_or("Bad Request");
        format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">{} : {}\n<p>{}</p><hr><em>ember</em></body></html>",
            self.code, reason, message
        )
    }
}

fn push_entity_headers(head: &mut String, content_type: &str, len: usize) {
    head.push_str(&format!(
        "Content-Type: {}\r\nContent-Length: {}\r\n\r\n",
        content_type, len
    ));
}

fn resolve(doc_root: &Path, path: &str) -> PathBuf {
    doc_root.join(path.trim_start_matches('/'))
}

fn resolve_status(doc_root: &Path, path: &str) -> u16 {
    if path.split('/').any(|seg| seg == "..") {
        return 404;
    }
    match fs::metadata(resolve(doc_root, path)) {
        Err(_) => 404,
        Ok(meta) if meta.is_dir() => 404,
        Ok(meta) if meta.permissions().mode() & libc::S_IROTH as u32 == 0 => 403,
        Ok(_) => 200,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::write_drain;
    use std::fs::Permissions;

    /// World-readable regardless of the test process umask
    fn write_public(path: &Path, bytes: &[u8]) {
        fs::write(path, bytes).unwrap();
        fs::set_permissions(path, Permissions::from_mode(0o644)).unwrap();
    }

    fn doc_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        write_public(&dir.path().join("index.html"), b"<h1>index</h1>");
        write_public(&dir.path().join("404.html"), b"<h1>missing</h1>");
        write_public(&dir.path().join("403.html"), b"<h1>forbidden</h1>");
        write_public(&dir.path().join("400.html"), b"<h1>bad</h1>");
        fs::create_dir(dir.path().join("sub")).unwrap();
        dir
    }

    /// Header block and body as one byte string
    fn wire(resp: &Response) -> String {
        let mut pending = resp.build();
        let mut out = Vec::new();
        assert!(matches!(
            write_drain(&mut pending, &mut out),
            crate::buffer::WriteOutcome::Complete
        ));
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_served_file_is_200_with_length() {
        let root = doc_root();
        let resp = Response::for_request(root.path(), "/index.html", true);
        assert_eq!(resp.code(), 200);

        let text = wire(&resp);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.contains("Keep-Alive: max=6, timeout=120\r\n"));
        assert!(text.contains("Content-Type: text/html\r\n"));
        assert!(text.contains("Content-Length: 14\r\n\r\n"));
        assert!(text.ends_with("<h1>index</h1>"));
    }

    #[test]
    fn test_missing_and_directory_are_404() {
        let root = doc_root();
        for path in ["/nope.html", "/sub", "/../index.html"] {
            let resp = Response::for_request(root.path(), path, false);
            assert_eq!(resp.code(), 404, "{}", path);
            assert_eq!(resp.path(), "/404.html");
            let text = wire(&resp);
            assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
            assert!(text.contains("Connection: close\r\n"));
            assert!(text.ends_with("<h1>missing</h1>"));
        }
    }

    #[test]
    fn test_unreadable_is_403() {
        let root = doc_root();
        let secret = root.path().join("secret.txt");
        fs::write(&secret, b"top secret").unwrap();
        fs::set_permissions(&secret, Permissions::from_mode(0o600)).unwrap();

        let resp = Response::for_request(root.path(), "/secret.txt", true);
        assert_eq!(resp.code(), 403);
        assert!(wire(&resp).ends_with("<h1>forbidden</h1>"));
    }

    #[test]
    fn test_missing_error_page_falls_back_inline() {
        let root = tempfile::tempdir().unwrap();
        let resp = Response::for_request(root.path(), "/gone.html", false);
        assert_eq!(resp.code(), 404);

        let pending = resp.build();
        assert!(pending.body().is_none());
        let text = String::from_utf8(pending.head().to_vec()).unwrap();
        assert!(text.contains("404 : Not Found"));
        assert!(text.contains("File NotFound!"));

        let (_, body) = text.split_once("\r\n\r\n").unwrap();
        assert!(text.contains(&format!("Content-Length: {}\r\n", body.len())));
    }

    #[test]
    fn test_empty_file_has_zero_length() {
        let root = doc_root();
        write_public(&root.path().join("empty.txt"), b"");

        let resp = Response::for_request(root.path(), "/empty.txt", false);
        assert_eq!(resp.code(), 200);
        let pending = resp.build();
        assert!(pending.body().is_none());
        let text = String::from_utf8(pending.head().to_vec()).unwrap();
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.ends_with("Content-Length: 0\r\n\r\n"));
    }

    #[test]
    fn test_bad_request_never_keeps_alive() {
        let root = doc_root();
        let resp = Response::bad_request(root.path());
        assert_eq!(resp.code(), 400);
        assert!(!resp.keep_alive());
        let text = wire(&resp);
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.ends_with("<h1>bad</h1>"));
    }

    #[test]
    fn test_head_keeps_length_but_sends_no_body() {
        let root = doc_root();
        let resp = Response::for_request(root.path(), "/index.html", true).head_only(true);
        let pending = resp.build();
        assert!(pending.body().is_none());
        assert_eq!(pending.total_len(), pending.head().len());

        let text = wire(&resp);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("Content-Length: 14\r\n\r\n"));
    }

    #[test]
    fn test_head_for_missing_page_has_no_inline_body() {
        let root = tempfile::tempdir().unwrap();
        let resp = Response::for_request(root.path(), "/gone.html", false).head_only(true);
        let text = wire(&resp);
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        assert!(!text.contains("File NotFound!"));
    }

    #[test]
    fn test_unknown_code_maps_to_400() {
        let root = doc_root();
        assert_eq!(Response::with_code(root.path(), 418, true).code(), 400);
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for("/a/b.css"), "text/css");
        assert_eq!(content_type_for("/clip.MPG"), "text/plain");
        assert_eq!(content_type_for("/movie.mpg"), "video/mpeg");
        assert_eq!(content_type_for("/README"), "text/plain");
        assert_eq!(content_type_for("/x.unknown"), "text/plain");
    }
}
