//! Request-line, header, query, and chunked-body parsing.

use std::collections::HashMap;

use thiserror::Error;

use crate::utils::{has_valid_percent_encoding, parse_query};

const CRLF: &[u8] = b"\r\n";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HttpError {
    #[error("malformed request line")]
    MalformedRequestLine,
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),
    #[error("path must start with '/'")]
    InvalidPath,
    #[error("unsupported HTTP version: {0}")]
    UnsupportedVersion(String),
    #[error("malformed header line")]
    MalformedHeader,
    #[error("malformed chunked body")]
    MalformedChunk,
}

impl HttpError {
    /// Every failure in this component maps to 400, per §4.3/§7.
    pub fn status_code(&self) -> u16 {
        400
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Delete,
    // declared for completeness; never produced by the request-line parser
    // below, and no handler dispatches on them.
    Put,
    Patch,
}

impl Method {
    fn from_str(s: &str) -> Option<Method> {
        match s {
            "GET" => Some(Method::Get),
            "HEAD" => Some(Method::Head),
            "POST" => Some(Method::Post),
            "DELETE" => Some(Method::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Delete => "DELETE",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }
}

/// Find the end of the header block (index just past the blank-line CRLFCRLF).
pub fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

pub fn parse_request(buf: &[u8]) -> Result<Request, HttpError> {
    let head_end = header_end(buf).ok_or(HttpError::MalformedRequestLine)?;
    let head = std::str::from_utf8(&buf[..head_end]).map_err(|_| HttpError::MalformedHeader)?;
    let mut lines = head.split("\r\n");

    let request_line = lines.next().ok_or(HttpError::MalformedRequestLine)?;
    let mut parts = request_line.split(' ').filter(|p| !p.is_empty());
    let method_str = parts.next().ok_or(HttpError::MalformedRequestLine)?;
    let raw_path = parts.next().ok_or(HttpError::MalformedRequestLine)?;
    let version = parts.next().ok_or(HttpError::MalformedRequestLine)?;
    if parts.next().is_some() {
        return Err(HttpError::MalformedRequestLine);
    }

    let method = Method::from_str(method_str).ok_or_else(|| HttpError::UnsupportedMethod(method_str.into()))?;
    if !raw_path.starts_with('/') {
        return Err(HttpError::InvalidPath);
    }
    if !has_valid_percent_encoding(raw_path) {
        return Err(HttpError::InvalidPath);
    }
    if version != "HTTP/1.0" && version != "HTTP/1.1" {
        return Err(HttpError::UnsupportedVersion(version.into()));
    }

    let (path, query_str) = match raw_path.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (raw_path.to_string(), String::new()),
    };
    let query = parse_query(&query_str);

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
        // lines without ':' are silently ignored, per §4.3.5
    }

    let mut request = Request {
        method,
        path,
        query,
        version: version.to_string(),
        headers,
        body: Vec::new(),
    };

    let rest = &buf[head_end..];
    request.body = if request.is_chunked() {
        decode_chunked(rest)?
    } else {
        rest.to_vec()
    };

    Ok(request)
}

/// Decode a chunked-transfer body. Expects the full chunked stream (through
/// the terminating zero-size chunk and final CRLF) to already be present.
pub fn decode_chunked(mut buf: &[u8]) -> Result<Vec<u8>, HttpError> {
    let mut out = Vec::new();
    loop {
        let line_end = find_subslice(buf, CRLF).ok_or(HttpError::MalformedChunk)?;
        let size_line = std::str::from_utf8(&buf[..line_end]).map_err(|_| HttpError::MalformedChunk)?;
        let size_str = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16).map_err(|_| HttpError::MalformedChunk)?;
        buf = &buf[line_end + CRLF.len()..];

        if size == 0 {
            // optional trailers, then a final CRLF
            let mut rest = buf;
            loop {
                let end = find_subslice(rest, CRLF).ok_or(HttpError::MalformedChunk)?;
                if end == 0 {
                    break;
                }
                rest = &rest[end + CRLF.len()..];
            }
            return Ok(out);
        }

        if buf.len() < size + CRLF.len() {
            return Err(HttpError::MalformedChunk);
        }
        out.extend_from_slice(&buf[..size]);
        if &buf[size..size + CRLF.len()] != CRLF {
            return Err(HttpError::MalformedChunk);
        }
        buf = &buf[size + CRLF.len()..];
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_get() {
        let raw = b"GET /index.html?a=1 HTTP/1.1\r\nHost: x\r\n\r\n";
        let req = parse_request(raw).unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/index.html");
        assert_eq!(req.query, vec![("a".to_string(), "1".to_string())]);
        assert_eq!(req.header("host"), Some("x"));
        assert!(req.body.is_empty());
    }

    #[test]
    fn rejects_bad_method() {
        let raw = b"TRACE / HTTP/1.1\r\n\r\n";
        assert!(matches!(parse_request(raw), Err(HttpError::UnsupportedMethod(_))));
    }

    #[test]
    fn rejects_path_without_leading_slash() {
        let raw = b"GET index.html HTTP/1.1\r\n\r\n";
        assert_eq!(parse_request(raw), Err(HttpError::InvalidPath));
    }

    #[test]
    fn rejects_bad_version() {
        let raw = b"GET / HTTP/2.0\r\n\r\n";
        assert!(matches!(parse_request(raw), Err(HttpError::UnsupportedVersion(_))));
    }

    #[test]
    fn content_length_body_is_appended_verbatim() {
        let raw = b"POST /up HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc";
        let req = parse_request(raw).unwrap();
        assert_eq!(req.body, b"abc");
    }

    #[test]
    fn decodes_chunked_body() {
        let body = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        assert_eq!(decode_chunked(body).unwrap(), b"Wikipedia");
    }

    #[test]
    fn malformed_chunk_size_is_rejected() {
        assert!(decode_chunked(b"zz\r\nabc\r\n0\r\n\r\n").is_err());
    }

    #[test]
    fn chunked_request_round_trips_through_parse_request() {
        let raw = b"POST /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n0\r\n\r\n";
        let req = parse_request(raw).unwrap();
        assert_eq!(req.body, b"Wiki");
    }
}
