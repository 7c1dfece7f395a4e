//! The in-memory policy tree: `BaseBlock`, `Server`, `Location`, `Container`,
//! and the effective-value resolution rules that walk Location -> Server.

use std::collections::HashMap;

use super::{DEFAULT_MAX_BODY_SIZE, DEFAULT_ROOT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Prefix,
    Exact,
    RegexCase,
    RegexICase,
    PriorityPrefix,
    Named,
}

/// The policy bag shared by `Server` and `Location`. Every field is `Option`
/// so that request-time resolution can tell "unset, inherit" apart from
/// "explicitly set to the default value".
#[derive(Debug, Clone, Default)]
pub struct BaseBlock {
    pub root: Option<String>,
    pub return_data: Option<(u16, String)>,
    pub client_max_body_size: Option<u64>,
    pub index_files: Option<Vec<String>>,
    pub error_pages: HashMap<u16, String>,
    pub autoindex: Option<bool>,
    pub cgi_enabled: Option<bool>,
    pub cgi_pass_map: HashMap<String, String>,
}

impl BaseBlock {
    pub fn insert_error_page(&mut self, code: u16, page: String) -> Result<(), String> {
        if !(300..=599).contains(&code) {
            return Err(format!("error_page code {code} out of range 300-599"));
        }
        self.error_pages.insert(code, page);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Server {
    pub base: BaseBlock,
    pub listens: Vec<(u16, String)>,
    pub server_names: Vec<String>,
    pub locations: Vec<Location>,
}

impl Server {
    pub fn insert_listen(&mut self, port: u16, addr: String) {
        if !self.listens.iter().any(|(p, a)| *p == port && a == &addr) {
            self.listens.push((port, addr));
        }
    }

    pub fn insert_server_name(&mut self, name: String) {
        if self.server_names.len() == 1 && self.server_names[0].is_empty() {
            self.server_names[0] = name;
        } else {
            self.server_names.push(name);
        }
    }

    /// Longest-prefix match over `locations`; ties keep the first (insertion-order) hit.
    pub fn match_location(&self, path: &str) -> Option<&Location> {
        let mut best: Option<&Location> = None;
        for loc in &self.locations {
            if path.starts_with(loc.path.as_str()) {
                match best {
                    Some(current) if current.path.len() >= loc.path.len() => {}
                    _ => best = Some(loc),
                }
            }
        }
        best
    }

    pub fn effective_cgi_pass(&self, ext: &str) -> Option<&str> {
        self.base.cgi_pass_map.get(ext).map(|s| s.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Location {
    pub base: BaseBlock,
    pub path: String,
    pub match_type: MatchType,
    pub methods: Vec<String>,
    pub upload_dir: Option<String>,
}

impl Default for Location {
    fn default() -> Self {
        Location {
            base: BaseBlock::default(),
            path: String::new(),
            match_type: MatchType::Prefix,
            methods: default_methods(),
            upload_dir: None,
        }
    }
}

pub fn default_methods() -> Vec<String> {
    vec!["GET".into(), "POST".into(), "DELETE".into()]
}

impl Location {
    pub fn new(path: String, match_type: MatchType) -> Self {
        Location {
            path,
            match_type,
            ..Default::default()
        }
    }

    /// Bake CGI inheritance at the moment the location block closes, per the
    /// config grammar's explicit inheritance rule (not the generic per-request walk).
    pub fn inherit_cgi_from(&mut self, server: &Server) {
        if self.base.cgi_enabled.is_none() {
            self.base.cgi_enabled = server.base.cgi_enabled;
        }
        for (ext, interp) in &server.base.cgi_pass_map {
            self.base
                .cgi_pass_map
                .entry(ext.clone())
                .or_insert_with(|| interp.clone());
        }
    }

    pub fn allows_method(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == method)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Container {
    pub servers: Vec<Server>,
}

impl Container {
    /// Select a server by the accepted socket's local port/address, falling
    /// back to the first configured server when nothing matches.
    pub fn select_server(&self, port: u16, addr: &str) -> &Server {
        self.servers
            .iter()
            .find(|s| {
                s.listens
                    .iter()
                    .any(|(p, a)| *p == port && (a == "0.0.0.0" || a == addr))
            })
            .unwrap_or(&self.servers[0])
    }
}

/// Resolve the effective document root for a request: location, then server, then default.
pub fn effective_root<'a>(loc: Option<&'a Location>, srv: &'a Server) -> &'a str {
    loc.and_then(|l| l.base.root.as_deref())
        .or(srv.base.root.as_deref())
        .unwrap_or(DEFAULT_ROOT)
}

pub fn effective_index_files<'a>(loc: Option<&'a Location>, srv: &'a Server) -> &'a [String] {
    static DEFAULT_INDEX: [String; 0] = [];
    let resolved = loc
        .and_then(|l| l.base.index_files.as_deref())
        .or(srv.base.index_files.as_deref())
        .unwrap_or(&DEFAULT_INDEX);
    if resolved.is_empty() {
        default_index_files()
    } else {
        resolved
    }
}

/// `["index.html"]`, used whenever no `index` directive (or an empty one)
/// is in effect, per §3 "indexFiles" default.
pub fn default_index_files() -> &'static [String] {
    static DEFAULT: std::sync::OnceLock<Vec<String>> = std::sync::OnceLock::new();
    DEFAULT.get_or_init(|| vec!["index.html".to_string()])
}

pub fn effective_autoindex(loc: Option<&Location>, srv: &Server) -> bool {
    loc.and_then(|l| l.base.autoindex)
        .or(srv.base.autoindex)
        .unwrap_or(false)
}

pub fn effective_max_body_size(loc: Option<&Location>, srv: &Server) -> u64 {
    loc.and_then(|l| l.base.client_max_body_size)
        .or(srv.base.client_max_body_size)
        .unwrap_or(DEFAULT_MAX_BODY_SIZE)
}

pub fn effective_error_page<'a>(
    loc: Option<&'a Location>,
    srv: &'a Server,
    code: u16,
) -> Option<&'a str> {
    loc.and_then(|l| l.base.error_pages.get(&code))
        .or_else(|| srv.base.error_pages.get(&code))
        .map(|s| s.as_str())
}

pub fn effective_cgi_enabled(loc: Option<&Location>, srv: &Server) -> bool {
    loc.and_then(|l| l.base.cgi_enabled)
        .unwrap_or_else(|| srv.base.cgi_enabled.unwrap_or(false))
}

pub fn effective_cgi_pass<'a>(loc: Option<&'a Location>, srv: &'a Server, ext: &str) -> Option<&'a str> {
    loc.and_then(|l| l.base.cgi_pass_map.get(ext))
        .or_else(|| srv.base.cgi_pass_map.get(ext))
        .map(|s| s.as_str())
}

pub fn effective_return<'a>(loc: Option<&'a Location>, srv: &'a Server) -> Option<&'a (u16, String)> {
    loc.and_then(|l| l.base.return_data.as_ref())
        .or(srv.base.return_data.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_with_locations(paths: &[&str]) -> Server {
        let mut server = Server::default();
        for p in paths {
            server
                .locations
                .push(Location::new(p.to_string(), MatchType::Prefix));
        }
        server
    }

    #[test]
    fn longest_prefix_wins() {
        let server = server_with_locations(&["/", "/a", "/a/b"]);
        assert_eq!(server.match_location("/a/b/c").unwrap().path, "/a/b");
        assert_eq!(server.match_location("/a/x").unwrap().path, "/a");
        assert_eq!(server.match_location("/z").unwrap().path, "/");
    }

    #[test]
    fn cgi_enabled_inherits_from_server() {
        let mut server = Server::default();
        server.base.cgi_enabled = Some(true);
        let mut loc = Location::new("/".into(), MatchType::Prefix);
        loc.inherit_cgi_from(&server);
        assert_eq!(loc.base.cgi_enabled, Some(true));
    }

    #[test]
    fn location_cgi_pass_wins_over_server() {
        let mut server = Server::default();
        server
            .base
            .cgi_pass_map
            .insert(".php".into(), "/usr/bin/php-cgi".into());
        let mut loc = Location::new("/".into(), MatchType::Prefix);
        loc.base
            .cgi_pass_map
            .insert(".php".into(), "/usr/local/bin/php".into());
        loc.inherit_cgi_from(&server);
        assert_eq!(
            loc.base.cgi_pass_map.get(".php").map(String::as_str),
            Some("/usr/local/bin/php")
        );
    }

    #[test]
    fn index_files_default_to_index_html() {
        let server = Server::default();
        assert_eq!(effective_index_files(None, &server), &["index.html".to_string()]);
    }

    #[test]
    fn server_mapping_visible_when_location_silent() {
        let mut server = Server::default();
        server
            .base
            .cgi_pass_map
            .insert(".py".into(), "/usr/bin/python3".into());
        let mut loc = Location::new("/".into(), MatchType::Prefix);
        loc.inherit_cgi_from(&server);
        assert_eq!(
            loc.base.cgi_pass_map.get(".py").map(String::as_str),
            Some("/usr/bin/python3")
        );
    }
}
