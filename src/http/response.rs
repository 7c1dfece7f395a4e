//! Response assembly: status line, headers, Set-Cookie list, body, and the
//! configured-or-fallback error page rendering described in §4.5.

use std::fs;

use crate::config::{policy, Location, Server};

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        413 => "Payload Too Large",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Error",
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub version: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub set_cookies: Vec<String>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Response {
            version: "HTTP/1.0".to_string(),
            status,
            headers: Vec::new(),
            set_cookies: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn set_cookie(mut self, value: impl Into<String>) -> Self {
        self.set_cookies.push(value.into());
        self
    }

    pub fn body(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case("content-length"));
        self.headers.push(("Content-Length".into(), bytes.len().to_string()));
        self.body = bytes;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 256);
        out.extend_from_slice(
            format!("{} {} {}\r\n", self.version, self.status, reason_phrase(self.status)).as_bytes(),
        );
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        for cookie in &self.set_cookies {
            out.extend_from_slice(format!("Set-Cookie: {cookie}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

fn fallback_error_body(status: u16) -> Vec<u8> {
    format!("<html><body><h1>Error {status}</h1></body></html>").into_bytes()
}

/// Build an error response, preferring the configured error page for this
/// status over the built-in fallback HTML.
pub fn error_response(status: u16, location: Option<&Location>, server: &Server) -> Response {
    if let Some(page) = policy::effective_error_page(location, server, status) {
        let root = policy::effective_root(location, server);
        let full_path = format!("{}{}", root, page.trim_start_matches('/'));
        if let Ok(bytes) = fs::read(&full_path) {
            return Response::new(status).header("Content-Type", "text/html").body(bytes);
        }
    }
    Response::new(status)
        .header("Content-Type", "text/html")
        .body(fallback_error_body(status))
}

pub fn redirect_response(status: u16, url: &str) -> Response {
    let body = format!(
        "<html><body>Moved to <a href=\"{url}\">{url}</a></body></html>"
    )
    .into_bytes();
    Response::new(status)
        .header("Location", url)
        .header("Content-Type", "text/html")
        .body(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_produces_well_formed_bytes() {
        let resp = Response::new(200)
            .header("Content-Type", "text/plain")
            .body("hi".as_bytes());
        let bytes = resp.build();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.ends_with("\r\n\r\nhi"));
    }

    #[test]
    fn set_cookie_values_each_get_their_own_line() {
        let resp = Response::new(200).set_cookie("a=1").set_cookie("b=2").body("");
        let text = String::from_utf8(resp.build()).unwrap();
        assert_eq!(text.matches("Set-Cookie:").count(), 2);
    }

    #[test]
    fn fallback_error_page_used_when_none_configured() {
        let server = Server::default();
        let resp = error_response(404, None, &server);
        assert_eq!(resp.status, 404);
        assert!(String::from_utf8(resp.body).unwrap().contains("Error 404"));
    }
}
