//! Re-entrant HTTP/1.1 request parser.
//!
//! Each call consumes the maximal parseable prefix of the read buffer and
//! either asks for more bytes, completes a request, or fails with the status
//! code the response should carry. Once complete or failed the parser is
//! inert until `reset`.

use crate::buffer::ByteBuffer;
use crate::http::{Method, Request, Version, MAX_HEADER_BYTES, MAX_REQUEST_LINE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    NeedMore,
    Complete,
    Failed(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    RequestLine,
    Headers,
    Body { remaining: usize },
    Complete,
    Failed(u16),
}

pub struct HttpRequestParser {
    state: State,
    header_bytes: usize,
    body_limit: usize,
    request: Option<Request>,
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

impl HttpRequestParser {
    pub fn new(body_limit: usize) -> Self {
        Self {
            state: State::RequestLine,
            header_bytes: 0,
            body_limit,
            request: None,
        }
    }

    pub fn reset(&mut self) {
        self.state = State::RequestLine;
        self.header_bytes = 0;
        self.request = None;
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Complete
    }

    /// Move the parsed request out; the parser stays Complete until `reset`.
    pub fn take_request(&mut self) -> Option<Request> {
        self.request.take()
    }

    pub fn parse(&mut self, buf: &mut ByteBuffer) -> ParseStatus {
        loop {
            match self.state {
                State::RequestLine => match self.parse_request_line(buf) {
                    ParseStatus::NeedMore => return ParseStatus::NeedMore,
                    ParseStatus::Failed(code) => return self.fail(code),
                    ParseStatus::Complete => {}
                },
                State::Headers => match self.parse_header_line(buf) {
                    ParseStatus::NeedMore => return ParseStatus::NeedMore,
                    ParseStatus::Failed(code) => return self.fail(code),
                    ParseStatus::Complete => {}
                },
                State::Body { remaining } => {
                    let take = remaining.min(buf.readable_bytes());
                    if take > 0 {
                        if let Some(req) = self.request.as_mut() {
                            req.body.extend_from_slice(&buf.peek()[..take]);
                        }
                        buf.consume(take);
                    }
                    let remaining = remaining - take;
                    if remaining > 0 {
                        self.state = State::Body { remaining };
                        return ParseStatus::NeedMore;
                    }
                    self.state = State::Complete;
                }
                State::Complete => return ParseStatus::Complete,
                State::Failed(code) => return ParseStatus::Failed(code),
            }
        }
    }

    fn fail(&mut self, code: u16) -> ParseStatus {
        self.state = State::Failed(code);
        self.request = None;
        ParseStatus::Failed(code)
    }

    fn parse_request_line(&mut self, buf: &mut ByteBuffer) -> ParseStatus {
        let line_end = match find_crlf(buf.peek()) {
            Some(i) => i,
            None => {
                if buf.readable_bytes() > MAX_REQUEST_LINE {
                    return ParseStatus::Failed(414);
                }
                return ParseStatus::NeedMore;
            }
        };
        if line_end > MAX_REQUEST_LINE {
            return ParseStatus::Failed(414);
        }

        let line = &buf.peek()[..line_end];
        let mut parts = line.split(|&b| b == b' ');
        let (method_b, target_b, version_b) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(t), Some(v)) if parts.next().is_none() => (m, t, v),
            _ => return ParseStatus::Failed(400),
        };

        let method = Method::from_bytes(method_b);
        if method == Method::Unknown {
            return ParseStatus::Failed(400);
        }
        let version = match Version::from_bytes(version_b) {
            Some(v) => v,
            None => return ParseStatus::Failed(400),
        };
        let target = match std::str::from_utf8(target_b) {
            Ok(t) if t.starts_with('/') => t,
            _ => return ParseStatus::Failed(400),
        };
        let (path, query) = match target.find('?') {
            Some(i) => (target[..i].to_string(), Some(target[i + 1..].to_string())),
            None => (target.to_string(), None),
        };

        self.request = Some(Request::new(method, path, query, version));
        buf.consume(line_end + 2);
        self.state = State::Headers;
        self.header_bytes = 0;
        ParseStatus::Complete
    }

    fn parse_header_line(&mut self, buf: &mut ByteBuffer) -> ParseStatus {
        let line_end = match find_crlf(buf.peek()) {
            Some(i) => i,
            None => {
                if self.header_bytes + buf.readable_bytes() > MAX_HEADER_BYTES {
                    return ParseStatus::Failed(431);
                }
                return ParseStatus::NeedMore;
            }
        };

        // Bare CRLF ends the header section.
        if line_end == 0 {
            buf.consume(2);
            return self.finish_headers();
        }

        self.header_bytes += line_end + 2;
        if self.header_bytes > MAX_HEADER_BYTES {
            return ParseStatus::Failed(431);
        }

        let line = match std::str::from_utf8(&buf.peek()[..line_end]) {
            Ok(l) => l,
            Err(_) => return ParseStatus::Failed(400),
        };
        let (name, value) = match line.split_once(':') {
            Some((n, v)) => (n.trim(), v.trim()),
            None => return ParseStatus::Failed(400),
        };
        if name.is_empty() {
            return ParseStatus::Failed(400);
        }
        if let Some(req) = self.request.as_mut() {
            req.insert_header(name, value);
        }
        buf.consume(line_end + 2);
        ParseStatus::Complete
    }

    fn finish_headers(&mut self) -> ParseStatus {
        let req = match self.request.as_mut() {
            Some(r) => r,
            None => return ParseStatus::Failed(400),
        };
        let content_length = req.content_length().unwrap_or(0);
        if req.method == Method::Post && content_length > 0 {
            if content_length > self.body_limit {
                return ParseStatus::Failed(413);
            }
            req.body.reserve(content_length);
            self.state = State::Body {
                remaining: content_length,
            };
        } else {
            self.state = State::Complete;
        }
        ParseStatus::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::DEFAULT_BODY_LIMIT;

    fn feed(parser: &mut HttpRequestParser, bytes: &[u8]) -> ParseStatus {
        let mut buf = ByteBuffer::new();
        buf.append(bytes);
        parser.parse(&mut buf)
    }

    #[test]
    fn parses_basic_get() {
        let mut p = HttpRequestParser::new(DEFAULT_BODY_LIMIT);
        let status = feed(
            &mut p,
            b"GET /some/path?foo=bar HTTP/1.1\r\nHost: localhost\r\nAccept: */*\r\n\r\n",
        );
        assert_eq!(status, ParseStatus::Complete);

        let req = p.take_request().unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/some/path");
        assert_eq!(req.query.as_deref(), Some("foo=bar"));
        assert_eq!(req.header("host"), Some("localhost"));
        assert!(req.keep_alive());
        assert!(req.body.is_empty());
    }

    #[test]
    fn resumes_across_arbitrary_splits() {
        let raw = b"POST /login HTTP/1.1\r\nHost: x\r\nContent-Length: 9\r\n\r\nuser=satie";
        // Feed one byte at a time; the parser must never get stuck.
        let mut p = HttpRequestParser::new(DEFAULT_BODY_LIMIT);
        let mut buf = ByteBuffer::new();
        let mut last = ParseStatus::NeedMore;
        for &b in raw.iter() {
            buf.append(&[b]);
            last = p.parse(&mut buf);
            if last == ParseStatus::Complete {
                break;
            }
        }
        assert_eq!(last, ParseStatus::Complete);
        let req = p.take_request().unwrap();
        assert_eq!(req.method, Method::Post);
        // Content-Length bounds the body; the trailing byte is not taken.
        assert_eq!(req.body, b"user=sati");
    }

    #[test]
    fn garbage_request_line_fails_400() {
        let mut p = HttpRequestParser::new(DEFAULT_BODY_LIMIT);
        assert_eq!(feed(&mut p, b"GARBAGE\r\n\r\n"), ParseStatus::Failed(400));
        // Failure is sticky.
        assert_eq!(feed(&mut p, b"GET / HTTP/1.1\r\n\r\n"), ParseStatus::Failed(400));
    }

    #[test]
    fn unsupported_method_fails_400() {
        let mut p = HttpRequestParser::new(DEFAULT_BODY_LIMIT);
        assert_eq!(feed(&mut p, b"PUT /x HTTP/1.1\r\n\r\n"), ParseStatus::Failed(400));
    }

    #[test]
    fn bad_version_fails_400() {
        let mut p = HttpRequestParser::new(DEFAULT_BODY_LIMIT);
        assert_eq!(feed(&mut p, b"GET /x HTTP/2.0\r\n\r\n"), ParseStatus::Failed(400));
    }

    #[test]
    fn missing_colon_fails_400() {
        let mut p = HttpRequestParser::new(DEFAULT_BODY_LIMIT);
        assert_eq!(
            feed(&mut p, b"GET / HTTP/1.1\r\nBadHeader\r\n\r\n"),
            ParseStatus::Failed(400)
        );
    }

    #[test]
    fn oversized_request_line_fails_414() {
        let mut p = HttpRequestParser::new(DEFAULT_BODY_LIMIT);
        let long = vec![b'a'; MAX_REQUEST_LINE + 10];
        let mut raw = b"GET /".to_vec();
        raw.extend_from_slice(&long);
        assert_eq!(feed(&mut p, &raw), ParseStatus::Failed(414));
    }

    #[test]
    fn oversized_body_fails_413() {
        let mut p = HttpRequestParser::new(16);
        assert_eq!(
            feed(&mut p, b"POST / HTTP/1.1\r\nContent-Length: 64\r\n\r\n"),
            ParseStatus::Failed(413)
        );
    }

    #[test]
    fn post_without_body_completes_at_headers() {
        let mut p = HttpRequestParser::new(DEFAULT_BODY_LIMIT);
        assert_eq!(
            feed(&mut p, b"POST /submit HTTP/1.1\r\nHost: x\r\n\r\n"),
            ParseStatus::Complete
        );
    }

    #[test]
    fn http10_connection_header_drives_keep_alive() {
        let mut p = HttpRequestParser::new(DEFAULT_BODY_LIMIT);
        feed(
            &mut p,
            b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n",
        );
        assert!(p.take_request().unwrap().keep_alive());

        let mut p = HttpRequestParser::new(DEFAULT_BODY_LIMIT);
        feed(&mut p, b"GET / HTTP/1.0\r\n\r\n");
        assert!(!p.take_request().unwrap().keep_alive());
    }

    #[test]
    fn reset_allows_the_next_request() {
        let mut p = HttpRequestParser::new(DEFAULT_BODY_LIMIT);
        feed(&mut p, b"GET /a HTTP/1.1\r\n\r\n");
        assert!(p.is_complete());
        p.reset();
        assert_eq!(feed(&mut p, b"GET /b HTTP/1.1\r\n\r\n"), ParseStatus::Complete);
        assert_eq!(p.take_request().unwrap().path, "/b");
    }
}
