//! Method-dispatched request handlers: GET/HEAD, POST, DELETE. Dispatch is a
//! match on the parsed [`Method`] rather than a subclass tree, per §9.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use nix::errno::Errno;

use crate::cgi;
use crate::config::{policy, Container, Location, Server};
use crate::utils::percent_decode;

use super::autoindex;
use super::request::{Method, Request};
use super::response::{self, Response};

/// Per-request binding to the selected server, matched location, and the
/// location's effective document root. Built once per HTTP message and
/// discarded with the response, per §3 "Lifecycle".
pub struct RequestContext<'a> {
    pub server: &'a Server,
    pub location: Option<&'a Location>,
    pub root: String,
}

impl<'a> RequestContext<'a> {
    /// Select the server by the accepted socket's local port/address, then
    /// the best-matching (longest-prefix) location for `path`.
    pub fn bind(container: &'a Container, local_port: u16, local_addr: &str, path: &str) -> Self {
        let server = container.select_server(local_port, local_addr);
        let location = server.match_location(path);
        let root = policy::effective_root(location, server).to_string();
        RequestContext { server, location, root }
    }

    fn error(&self, status: u16) -> Response {
        response::error_response(status, self.location, self.server)
    }

    /// The filesystem path a request path resolves to: `root + decoded path
    /// with its leading slash stripped`. `..` segments are not normalised
    /// here - individual handlers reject them where required.
    fn resolve(&self, request_path: &str) -> String {
        let decoded = percent_decode(request_path).unwrap_or_else(|| request_path.to_string());
        format!("{}{}", self.root, decoded.trim_start_matches('/'))
    }
}

/// Dispatch a parsed request to its method handler, honoring a configured
/// `return` short-circuit and the location's allowed-method set first, per
/// §4.4 "All handlers first consult hasReturn() ...".
pub fn dispatch(ctx: &RequestContext, request: &Request, client_ip: &str, local_port: u16) -> Response {
    if let Some((code, url)) = policy::effective_return(ctx.location, ctx.server) {
        if !url.is_empty() {
            return response::redirect_response(*code, url);
        }
    }

    // GET and HEAD share an allowed-method check: a location that allows GET
    // implicitly allows HEAD, since they share a handler (§3/§4.3).
    let method_for_check = match request.method {
        Method::Head => "GET",
        other => other.as_str(),
    };
    let allowed = ctx
        .location
        .map(|l| l.allows_method(method_for_check))
        .unwrap_or(true);
    if !allowed {
        return ctx.error(405);
    }

    match request.method {
        Method::Get => get_or_head(ctx, request, client_ip, local_port, false),
        Method::Head => get_or_head(ctx, request, client_ip, local_port, true),
        Method::Post => post(ctx, request, client_ip, local_port),
        Method::Delete => delete(ctx, request),
        // declared in the method set but never dispatched on the wire, per §9.
        Method::Put | Method::Patch => ctx.error(405),
    }
}

fn get_or_head(ctx: &RequestContext, request: &Request, client_ip: &str, local_port: u16, head: bool) -> Response {
    let full_path = ctx.resolve(&request.path);
    let path = Path::new(&full_path);
    let meta = match fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return ctx.error(404),
    };

    if meta.is_dir() {
        for name in policy::effective_index_files(ctx.location, ctx.server) {
            let candidate = join(&full_path, name);
            if Path::new(&candidate).is_file() {
                return serve(ctx, Path::new(&candidate), request, client_ip, local_port, head);
            }
        }
        if policy::effective_autoindex(ctx.location, ctx.server) {
            return match autoindex::render(path, &request.path) {
                Ok(html) => {
                    let bytes = if head { Vec::new() } else { html.into_bytes() };
                    Response::new(200).header("Content-Type", "text/html").body(bytes)
                }
                Err(_) => ctx.error(500),
            };
        }
        return ctx.error(404);
    }

    serve(ctx, path, request, client_ip, local_port, head)
}

/// Serve a resolved regular file: through the CGI gateway when CGI is
/// effectively enabled, otherwise as a static response (body omitted for
/// HEAD, per §4.4).
fn serve(ctx: &RequestContext, path: &Path, request: &Request, client_ip: &str, local_port: u16, head: bool) -> Response {
    let cgi_enabled = policy::effective_cgi_enabled(ctx.location, ctx.server);
    if cgi_enabled {
        return run_cgi_or_forbidden(ctx, path, request, client_ip, local_port);
    }

    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(_) => return ctx.error(404),
    };
    let content_type = mime_guess::from_path(path).first_or_octet_stream().to_string();
    if head {
        Response::new(200)
            .header("Content-Type", content_type)
            .header("Content-Length", bytes.len().to_string())
    } else {
        Response::new(200).header("Content-Type", content_type).body(bytes)
    }
}

fn run_cgi_or_forbidden(ctx: &RequestContext, path: &Path, request: &Request, client_ip: &str, local_port: u16) -> Response {
    let meta = match fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return ctx.error(404),
    };
    if meta.permissions().mode() & 0o100 == 0 {
        return ctx.error(403);
    }
    cgi::execute(path, request, ctx, client_ip, local_port)
}

fn join(root: &str, name: &str) -> String {
    format!("{}{}", ensure_trailing_slash(root), name)
}

fn ensure_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn post(ctx: &RequestContext, request: &Request, client_ip: &str, local_port: u16) -> Response {
    let cgi_enabled = policy::effective_cgi_enabled(ctx.location, ctx.server);
    if cgi_enabled {
        let full_path = ctx.resolve(&request.path);
        let path = Path::new(&full_path);
        if !path.exists() {
            return ctx.error(404);
        }
        return run_cgi_or_forbidden(ctx, path, request, client_ip, local_port);
    }

    let upload_dir = ctx
        .location
        .and_then(|l| l.upload_dir.clone())
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| ctx.root.clone());

    let decoded_path = percent_decode(&request.path).unwrap_or_else(|| request.path.clone());
    let filename = decoded_path
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("upload_{}.txt", epoch_secs()));

    if filename.contains("..") {
        return ctx.error(403);
    }

    let target = join(&upload_dir, &filename);
    let existed = Path::new(&target).exists();
    if fs::write(&target, &request.body).is_err() {
        return ctx.error(500);
    }

    if existed {
        Response::new(200)
            .header("Content-Type", "text/plain")
            .body(format!("File updated successfully: {filename}\n"))
    } else {
        Response::new(201)
    }
}

fn delete(ctx: &RequestContext, request: &Request) -> Response {
    if request.path.contains("..") {
        return ctx.error(403);
    }

    let full_path = ctx.resolve(&request.path);
    let path = Path::new(&full_path);

    if let (Ok(canon_root), Ok(canon_target)) = (fs::canonicalize(&ctx.root), fs::canonicalize(path)) {
        if !canon_target.starts_with(&canon_root) {
            return ctx.error(403);
        }
    }

    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(_) => return ctx.error(404),
    };

    let result = if meta.is_dir() {
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    };

    match result {
        Ok(()) => Response::new(204),
        Err(e) => match e.raw_os_error().map(Errno::from_raw) {
            Some(Errno::ENOTEMPTY) => Response::new(409)
                .header("Content-Type", "text/plain")
                .body("Cannot delete non-empty directory"),
            Some(Errno::EACCES) | Some(Errno::EPERM) => ctx.error(403),
            _ => ctx.error(500),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MatchType;
    use std::fs::File;
    use std::io::Write;

    fn server_with_root(root: &str) -> Server {
        let mut server = Server::default();
        server.base.root = Some(root.to_string());
        let mut loc = Location::new("/".into(), MatchType::Prefix);
        loc.base.index_files = Some(vec!["index.html".to_string()]);
        server.locations.push(loc);
        server
    }

    fn ctx_for<'a>(server: &'a Server, path: &str) -> RequestContext<'a> {
        let location = server.match_location(path);
        let root = policy::effective_root(location, server).to_string();
        RequestContext { server, location, root }
    }

    fn get_request(path: &str) -> Request {
        Request {
            method: Method::Get,
            path: path.to_string(),
            query: Vec::new(),
            version: "HTTP/1.1".to_string(),
            headers: Default::default(),
            body: Vec::new(),
        }
    }

    #[test]
    fn static_file_serves_200_with_content_length() {
        let dir = tempfile::tempdir().unwrap();
        let root = format!("{}/", dir.path().display());
        File::create(dir.path().join("index.html"))
            .unwrap()
            .write_all(b"hello")
            .unwrap();

        let server = server_with_root(&root);
        let ctx = ctx_for(&server, "/");
        let resp = dispatch(&ctx, &get_request("/"), "127.0.0.1", 4269);
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"hello");
    }

    #[test]
    fn missing_file_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let root = format!("{}/", dir.path().display());
        let server = server_with_root(&root);
        let ctx = ctx_for(&server, "/");
        let resp = dispatch(&ctx, &get_request("/missing.txt"), "127.0.0.1", 4269);
        assert_eq!(resp.status, 404);
    }

    #[test]
    fn head_omits_body_but_sets_content_length() {
        let dir = tempfile::tempdir().unwrap();
        let root = format!("{}/", dir.path().display());
        File::create(dir.path().join("index.html"))
            .unwrap()
            .write_all(b"hello")
            .unwrap();
        let server = server_with_root(&root);
        let ctx = ctx_for(&server, "/");
        let mut req = get_request("/");
        req.method = Method::Head;
        let resp = dispatch(&ctx, &req, "127.0.0.1", 4269);
        assert_eq!(resp.status, 200);
        assert!(resp.body.is_empty());
        assert!(resp
            .headers
            .iter()
            .any(|(k, v)| k == "Content-Length" && v == "5"));
    }

    #[test]
    fn post_upload_creates_then_updates() {
        let dir = tempfile::tempdir().unwrap();
        let root = format!("{}/", dir.path().display());
        let mut server = server_with_root(&root);
        server.locations[0].upload_dir = Some(root.clone());

        let ctx = ctx_for(&server, "/note.txt");
        let req = Request {
            method: Method::Post,
            path: "/note.txt".to_string(),
            query: Vec::new(),
            version: "HTTP/1.1".to_string(),
            headers: Default::default(),
            body: b"abc".to_vec(),
        };
        let resp = dispatch(&ctx, &req, "127.0.0.1", 4269);
        assert_eq!(resp.status, 201);
        assert_eq!(fs::read(dir.path().join("note.txt")).unwrap(), b"abc");

        let resp2 = dispatch(&ctx, &req, "127.0.0.1", 4269);
        assert_eq!(resp2.status, 200);
        assert_eq!(
            String::from_utf8(resp2.body).unwrap(),
            "File updated successfully: note.txt\n"
        );
    }

    #[test]
    fn delete_removes_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let root = format!("{}/", dir.path().display());
        fs::create_dir(dir.path().join("empty")).unwrap();
        let server = server_with_root(&root);
        let ctx = ctx_for(&server, "/empty/");

        let req = Request {
            method: Method::Delete,
            path: "/empty/".to_string(),
            query: Vec::new(),
            version: "HTTP/1.1".to_string(),
            headers: Default::default(),
            body: Vec::new(),
        };
        let resp = dispatch(&ctx, &req, "127.0.0.1", 4269);
        assert_eq!(resp.status, 204);
        assert!(!dir.path().join("empty").exists());
    }

    #[test]
    fn delete_non_empty_dir_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let root = format!("{}/", dir.path().display());
        fs::create_dir(dir.path().join("full")).unwrap();
        File::create(dir.path().join("full/a.txt")).unwrap();
        let server = server_with_root(&root);
        let ctx = ctx_for(&server, "/full/");

        let req = Request {
            method: Method::Delete,
            path: "/full/".to_string(),
            query: Vec::new(),
            version: "HTTP/1.1".to_string(),
            headers: Default::default(),
            body: Vec::new(),
        };
        let resp = dispatch(&ctx, &req, "127.0.0.1", 4269);
        assert_eq!(resp.status, 409);
        assert_eq!(
            String::from_utf8(resp.body).unwrap(),
            "Cannot delete non-empty directory"
        );
    }

    #[test]
    fn method_not_allowed_for_disallowed_verb() {
        let dir = tempfile::tempdir().unwrap();
        let root = format!("{}/", dir.path().display());
        let mut server = server_with_root(&root);
        server.locations[0].methods = vec!["GET".to_string()];
        let ctx = ctx_for(&server, "/x");

        let req = Request {
            method: Method::Delete,
            path: "/x".to_string(),
            query: Vec::new(),
            version: "HTTP/1.1".to_string(),
            headers: Default::default(),
            body: Vec::new(),
        };
        let resp = dispatch(&ctx, &req, "127.0.0.1", 4269);
        assert_eq!(resp.status, 405);
    }

    #[test]
    fn configured_return_short_circuits_to_redirect() {
        let dir = tempfile::tempdir().unwrap();
        let root = format!("{}/", dir.path().display());
        let mut server = server_with_root(&root);
        server.locations[0].base.return_data = Some((301, "https://example.com/".to_string()));
        let ctx = ctx_for(&server, "/");
        let resp = dispatch(&ctx, &get_request("/"), "127.0.0.1", 4269);
        assert_eq!(resp.status, 301);
        assert!(resp.headers.iter().any(|(k, v)| k == "Location" && v == "https://example.com/"));
    }
}
