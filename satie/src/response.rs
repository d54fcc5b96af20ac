//! Response resolution and serialization.
//!
//! A request path resolves to a status code and a body: a memory-mapped
//! regular file on success, a canned error page (itself mapped when present
//! under the doc root), or generated fallback HTML. Headers and any inline
//! body are serialized into the connection's write buffer; a mapped file
//! stays external so the reactor can writev header and body in one call.

use std::fs::File;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::buffer::ByteBuffer;
use crate::syscalls;

/// Read-only private mapping of a regular file. Unmapped on drop.
pub struct MappedFile {
    ptr: *const u8,
    len: usize,
}

// The mapping is immutable and private; sharing the pointer across the
// worker/reactor handoff is sound.
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    pub fn map(path: &Path) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Ok(Self {
                ptr: std::ptr::NonNull::<u8>::dangling().as_ptr(),
                len: 0,
            });
        }
        let ptr = syscalls::mmap_readonly(file.as_raw_fd(), len)?;
        Ok(Self { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        if self.len > 0 {
            syscalls::munmap_file(self.ptr, self.len);
        }
    }
}

enum Body {
    Inline(String),
    File(MappedFile),
}

pub struct Response {
    code: u16,
    keep_alive: bool,
    content_type: &'static str,
    body: Body,
}

fn status_reason(code: u16) -> &'static str {
    match code {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        _ => "Bad Request",
    }
}

fn error_page(code: u16) -> &'static str {
    match code {
        400 => "/400.html",
        403 => "/403.html",
        _ => "/404.html",
    }
}

fn content_type_for(path: &Path) -> &'static str {
    let suffix = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");
    match suffix {
        "html" => "text/html",
        "xml" => "text/xml",
        "xhtml" => "application/xhtml+xml",
        "txt" => "text/plain",
        "rtf" => "application/rtf",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "gif" => "image/gif",
        "jpg" | "jpeg" => "image/jpeg",
        "au" => "audio/basic",
        "mpeg" | "mpg" => "video/mpeg",
        "avi" => "video/x-msvideo",
        "gz" => "application/x-gzip",
        "tar" => "application/x-tar",
        "css" => "text/css",
        "js" => "text/javascript",
        _ => "text/plain",
    }
}

fn fallback_html(code: u16) -> String {
    format!(
        "<html><head><title>{code} {reason}</title></head>\
         <body><h1>{code} {reason}</h1><hr><em>satie</em></body></html>",
        code = code,
        reason = status_reason(code),
    )
}

/// Map the request path to a file under the (already canonicalized) doc
/// root. Errors carry the status code to answer with: 403 for traversal or
/// unreadable files, 404 otherwise.
fn locate(root: &Path, req_path: &str) -> Result<PathBuf, u16> {
    let rel = if req_path == "/" {
        "index.html"
    } else {
        req_path.trim_start_matches('/')
    };
    let candidate = root.join(rel);
    let canonical = candidate.canonicalize().map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            403u16
        } else {
            404u16
        }
    })?;
    if !canonical.starts_with(root) {
        return Err(403);
    }
    let meta = canonical.metadata().map_err(|_| 404u16)?;
    if meta.is_dir() {
        return Err(404);
    }
    // World-readable bit gate, checked explicitly so the answer does not
    // depend on the server's own privileges.
    if meta.permissions().mode() & 0o004 == 0 {
        return Err(403);
    }
    Ok(canonical)
}

impl Response {
    /// Resolve `(doc_root, request_path, keep_alive, override_code)` to a
    /// ready-to-serialize response. Codes outside this core's response set
    /// collapse to 400.
    pub fn resolve(
        root: &Path,
        req_path: &str,
        keep_alive: bool,
        override_code: Option<u16>,
    ) -> Self {
        let mut located = None;
        let code = match override_code {
            Some(c) if c == 400 || c == 403 || c == 404 => c,
            Some(_) => 400,
            None => match locate(root, req_path) {
                Ok(path) => {
                    located = Some(path);
                    200
                }
                Err(c) => c,
            },
        };

        if let Some(path) = located {
            match MappedFile::map(&path) {
                Ok(mapped) => {
                    return Self {
                        code: 200,
                        keep_alive,
                        content_type: content_type_for(&path),
                        body: Body::File(mapped),
                    };
                }
                // Resolvable but not mappable is answered as not found.
                Err(_) => return Self::error(root, 404, keep_alive),
            }
        }
        Self::error(root, code, keep_alive)
    }

    fn error(root: &Path, code: u16, keep_alive: bool) -> Self {
        let canned = root.join(error_page(code).trim_start_matches('/'));
        let body = match MappedFile::map(&canned) {
            Ok(mapped) if mapped.len() > 0 => Body::File(mapped),
            _ => Body::Inline(fallback_html(code)),
        };
        Self {
            code,
            keep_alive,
            content_type: "text/html",
            body,
        }
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    fn body_len(&self) -> usize {
        match &self.body {
            Body::Inline(s) => s.len(),
            Body::File(m) => m.len(),
        }
    }

    /// The externally mapped region, when the body is a file.
    pub fn file(&self) -> Option<&[u8]> {
        match &self.body {
            Body::File(m) => Some(m.as_slice()),
            _ => None,
        }
    }

    /// Serialize the status line, headers, and any inline body into `buf`.
    pub fn make(&self, buf: &mut ByteBuffer) {
        buf.append_str(&format!(
            "HTTP/1.1 {} {}\r\n",
            self.code,
            status_reason(self.code)
        ));
        if self.keep_alive {
            buf.append_str("Connection: keep-alive\r\n");
            buf.append_str("keep-alive: max=6, timeout=120\r\n");
        } else {
            buf.append_str("Connection: close\r\n");
        }
        buf.append_str(&format!("Content-type: {}\r\n", self.content_type));
        buf.append_str(&format!("Content-length: {}\r\n\r\n", self.body_len()));
        if let Body::Inline(s) = &self.body {
            buf.append_str(s);
        }
    }
}
