//! Builds the `Container` policy tree from a lexed token stream.

use super::lexer::{Token, TokenType};
use super::policy::{default_methods, Container, Location, MatchType, Server};
use super::ConfigError;

struct Cursor<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Cursor { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn peek_value(&self) -> Option<&'a str> {
        self.peek().map(|t| t.value.as_str())
    }

    fn next(&mut self) -> Option<&'a Token> {
        let tok = self.tokens.get(self.pos);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect_symbol(&mut self, sym: &str, ctx: &str) -> Result<(), ConfigError> {
        match self.next() {
            Some(t) if t.value == sym => Ok(()),
            _ => Err(ConfigError::Parse(format!("expected '{sym}' {ctx}"))),
        }
    }

    fn collect_until_semicolon(&mut self, ctx: &str) -> Result<Vec<&'a Token>, ConfigError> {
        let mut out = Vec::new();
        while let Some(tok) = self.peek() {
            if tok.value == ";" {
                break;
            }
            if matches!(tok.kind, TokenType::Attribute | TokenType::Level) {
                return Err(ConfigError::Parse(format!("expected ';' {ctx}")));
            }
            out.push(tok);
            self.pos += 1;
        }
        self.expect_symbol(";", ctx)?;
        Ok(out)
    }
}

fn parse_size(raw: &str) -> Result<u64, ConfigError> {
    if raw.is_empty() {
        return Err(ConfigError::Parse("empty client_max_body_size value".into()));
    }
    let (digits, mult) = match raw.chars().last().unwrap().to_ascii_lowercase() {
        'k' => (&raw[..raw.len() - 1], 1024u64),
        'm' => (&raw[..raw.len() - 1], 1024 * 1024),
        'g' => (&raw[..raw.len() - 1], 1024 * 1024 * 1024),
        _ => (raw, 1),
    };
    let base: u64 = digits
        .parse()
        .map_err(|_| ConfigError::Parse(format!("invalid client_max_body_size: {raw}")))?;
    base.checked_mul(mult)
        .ok_or_else(|| ConfigError::Parse(format!("client_max_body_size overflows: {raw}")))
}

fn parse_listen_value(value: &str, server: &mut Server) {
    let (addr, port) = match value.split_once(':') {
        Some((addr, port_str)) => {
            let port = port_str.parse().unwrap_or(80);
            (addr.to_string(), port)
        }
        None => {
            let port = value.parse().unwrap_or(80);
            ("0.0.0.0".to_string(), port)
        }
    };
    server.insert_listen(port, addr);
}

fn parse_error_page_tokens<'a>(cursor: &mut Cursor<'a>) -> Result<(Vec<u16>, Option<String>), ConfigError> {
    let mut codes = Vec::new();
    while let Some(tok) = cursor.peek() {
        if tok.value == ";" || tok.kind != TokenType::Number {
            break;
        }
        codes.push(tok.value.parse().unwrap_or(0));
        cursor.pos += 1;
    }
    let mut page = None;
    if let Some(tok) = cursor.peek() {
        if tok.value != ";" {
            page = Some(tok.value.clone());
            cursor.pos += 1;
        }
    }
    cursor.expect_symbol(";", "after 'error_page' directive")?;
    Ok((codes, page))
}

fn parse_base_directive(
    cursor: &mut Cursor,
    directive: &str,
    base: &mut super::policy::BaseBlock,
) -> Result<bool, ConfigError> {
    match directive {
        "root" => {
            let tok = cursor
                .next()
                .ok_or_else(|| ConfigError::Parse("expected path after 'root'".into()))?;
            let value = tok.value.clone();
            if value.is_empty() {
                return Err(ConfigError::Parse("'root' directive requires a non-empty path".into()));
            }
            if value.ends_with('/') {
                match std::fs::metadata(&value) {
                    Ok(meta) if meta.is_dir() => {}
                    Ok(_) => {
                        return Err(ConfigError::Parse(format!("'root' path is not a directory: {value}")))
                    }
                    Err(_) => {
                        return Err(ConfigError::Parse(format!("'root' path does not exist: {value}")))
                    }
                }
            }
            base.root = Some(value);
            cursor.expect_symbol(";", "after 'root' directive")?;
            Ok(true)
        }
        "index" => {
            let files: Vec<String> = cursor
                .collect_until_semicolon("after 'index' directive")?
                .into_iter()
                .map(|t| t.value.clone())
                .collect();
            base.index_files = Some(files);
            Ok(true)
        }
        "autoindex" => {
            let on = cursor.peek_value() == Some("on");
            cursor.pos += 1;
            base.autoindex = Some(on);
            cursor.expect_symbol(";", "after 'autoindex' directive")?;
            Ok(true)
        }
        "client_max_body_size" => {
            let tok = cursor
                .next()
                .ok_or_else(|| ConfigError::Parse("expected value after 'client_max_body_size'".into()))?;
            base.client_max_body_size = Some(parse_size(&tok.value)?);
            cursor.expect_symbol(";", "after 'client_max_body_size' directive")?;
            Ok(true)
        }
        "error_page" => {
            let (codes, page) = parse_error_page_tokens(cursor)?;
            if let Some(page) = page {
                if !codes.is_empty() {
                    for code in codes {
                        base.insert_error_page(code, page.clone())
                            .map_err(ConfigError::Parse)?;
                    }
                }
            }
            Ok(true)
        }
        "cgi_enabled" => {
            let value = cursor
                .next()
                .ok_or_else(|| ConfigError::Parse("expected value after 'cgi_enabled'".into()))?
                .value
                .clone();
            cursor.expect_symbol(";", "after 'cgi_enabled' directive")?;
            match value.as_str() {
                "on" => base.cgi_enabled = Some(true),
                "off" => base.cgi_enabled = Some(false),
                other => return Err(ConfigError::Parse(format!("invalid value for 'cgi_enabled': {other}"))),
            }
            Ok(true)
        }
        "cgi_pass" => {
            let ext = cursor
                .next()
                .ok_or_else(|| ConfigError::Parse("expected extension after 'cgi_pass'".into()))?
                .value
                .clone();
            let interp = cursor
                .next()
                .ok_or_else(|| ConfigError::Parse("expected interpreter after 'cgi_pass'".into()))?
                .value
                .clone();
            cursor.expect_symbol(";", "after 'cgi_pass' directive")?;
            base.cgi_pass_map.insert(ext, interp);
            Ok(true)
        }
        _ => Ok(false),
    }
}

fn parse_location_directive(cursor: &mut Cursor, location: &mut Location) -> Result<(), ConfigError> {
    let tok = cursor
        .next()
        .ok_or_else(|| ConfigError::Parse("expected location directive".into()))?;
    if !matches!(tok.kind, TokenType::Attribute | TokenType::Level) {
        return Err(ConfigError::Parse(format!(
            "expected location directive, got: {}",
            tok.value
        )));
    }
    let directive = tok.value.clone();

    if parse_base_directive(cursor, &directive, &mut location.base)? {
        return Ok(());
    }

    match directive.as_str() {
        "upload_dir" => {
            let tok = cursor
                .next()
                .ok_or_else(|| ConfigError::Parse("expected path after 'upload_dir'".into()))?;
            location.upload_dir = Some(tok.value.clone());
            cursor.expect_symbol(";", "after 'upload_dir' directive")?;
        }
        "allow_methods" => {
            let methods: Vec<String> = cursor
                .collect_until_semicolon("after 'allow_methods' directive")?
                .into_iter()
                .map(|t| t.value.clone())
                .collect();
            if !methods.is_empty() {
                location.methods = methods;
            }
        }
        "transfer_encoding" => {
            let value = cursor
                .next()
                .ok_or_else(|| ConfigError::Parse("expected value after 'transfer_encoding'".into()))?
                .value
                .clone();
            cursor.expect_symbol(";", "after 'transfer_encoding' directive")?;
            if value != "on" && value != "off" {
                return Err(ConfigError::Parse(format!(
                    "invalid value for 'transfer_encoding': {value}"
                )));
            }
        }
        "return" => {
            let code_tok = cursor
                .next()
                .ok_or_else(|| ConfigError::Parse("expected status code after 'return'".into()))?;
            if code_tok.kind != TokenType::Number {
                return Err(ConfigError::Parse("expected status code after 'return' directive".into()));
            }
            let code: u16 = code_tok.value.parse().unwrap_or(0);
            let mut url = String::new();
            if let Some(tok) = cursor.peek() {
                if tok.value != ";" {
                    url = tok.value.clone();
                    cursor.pos += 1;
                }
            }
            cursor.expect_symbol(";", "after 'return' directive")?;
            location.base.return_data = Some((code, url));
        }
        other => {
            // consume to the next ';' so the error message is still precise
            while let Some(tok) = cursor.peek() {
                cursor.pos += 1;
                if tok.value == ";" {
                    break;
                }
            }
            return Err(ConfigError::Parse(format!("unknown location directive: {other}")));
        }
    }
    Ok(())
}

fn parse_location(cursor: &mut Cursor, server: &mut Server) -> Result<(), ConfigError> {
    let first = cursor
        .peek_value()
        .ok_or_else(|| ConfigError::Parse("expected location path or modifier".into()))?
        .to_string();

    let (match_type, path) = match first.as_str() {
        "=" => {
            cursor.pos += 1;
            let path = cursor
                .next()
                .ok_or_else(|| ConfigError::Parse("expected path after '=' modifier".into()))?
                .value
                .clone();
            (MatchType::Exact, path)
        }
        "~" => {
            cursor.pos += 1;
            let path = cursor
                .next()
                .ok_or_else(|| ConfigError::Parse("expected pattern after '~' modifier".into()))?
                .value
                .clone();
            (MatchType::RegexCase, path)
        }
        "~*" => {
            cursor.pos += 1;
            let path = cursor
                .next()
                .ok_or_else(|| ConfigError::Parse("expected pattern after '~*' modifier".into()))?
                .value
                .clone();
            (MatchType::RegexICase, path)
        }
        "^~" => {
            cursor.pos += 1;
            let path = cursor
                .next()
                .ok_or_else(|| ConfigError::Parse("expected path after '^~' modifier".into()))?
                .value
                .clone();
            (MatchType::PriorityPrefix, path)
        }
        _ if first.starts_with('@') => {
            cursor.pos += 1;
            (MatchType::Named, first)
        }
        _ => {
            cursor.pos += 1;
            (MatchType::Prefix, first)
        }
    };

    if path.is_empty() {
        return Err(ConfigError::Parse("location path cannot be empty".into()));
    }

    let mut location = Location::new(path.clone(), match_type);

    cursor.expect_symbol("{", &format!("after location path '{path}'"))?;
    let mut depth = 1;
    while depth > 0 {
        match cursor.peek_value() {
            Some("{") => {
                depth += 1;
                cursor.pos += 1;
            }
            Some("}") => {
                depth -= 1;
                cursor.pos += 1;
            }
            None => return Err(ConfigError::Parse(format!("unclosed 'location' block for '{path}'"))),
            _ => parse_location_directive(cursor, &mut location)?,
        }
    }

    location.inherit_cgi_from(server);
    server.locations.push(location);
    Ok(())
}

fn parse_server_directive(cursor: &mut Cursor, server: &mut Server) -> Result<(), ConfigError> {
    let tok = cursor
        .next()
        .ok_or_else(|| ConfigError::Parse("expected server directive".into()))?;
    if !matches!(tok.kind, TokenType::Attribute | TokenType::Level) {
        return Ok(());
    }
    let directive = tok.value.clone();

    if directive == "location" {
        return parse_location(cursor, server);
    }
    if directive == "listen" {
        let values = cursor.collect_until_semicolon("after 'listen' directive")?;
        for v in values {
            parse_listen_value(&v.value, server);
        }
        return Ok(());
    }
    if directive == "server_name" {
        let values = cursor.collect_until_semicolon("after 'server_name' directive")?;
        for v in values {
            server.insert_server_name(v.value.clone());
        }
        return Ok(());
    }

    if parse_base_directive(cursor, &directive, &mut server.base)? {
        return Ok(());
    }

    // unknown server-level directives are parse errors, per §4.2
    while let Some(tok) = cursor.peek() {
        cursor.pos += 1;
        if tok.value == ";" {
            break;
        }
    }
    Err(ConfigError::Parse(format!("unknown server directive: {directive}")))
}

fn parse_server(cursor: &mut Cursor) -> Result<Server, ConfigError> {
    cursor.pos += 1; // consume "server"
    let mut server = Server::default();
    cursor.expect_symbol("{", "after 'server'")?;

    let mut depth = 1;
    while depth > 0 {
        match cursor.peek_value() {
            Some("{") => {
                depth += 1;
                cursor.pos += 1;
            }
            Some("}") => {
                depth -= 1;
                cursor.pos += 1;
            }
            None => return Err(ConfigError::Parse("unclosed 'server' block: missing '}'".into())),
            _ => parse_server_directive(cursor, &mut server)?,
        }
    }

    if server.listens.is_empty() {
        server.insert_listen(80, "0.0.0.0".to_string());
    }
    if server.locations.is_empty() {
        let mut root = Location::new("/".into(), MatchType::Prefix);
        root.methods = default_methods();
        server.locations.push(root);
    }
    Ok(server)
}

pub fn parse(tokens: &[Token]) -> Result<Container, ConfigError> {
    if tokens.is_empty() {
        return Err(ConfigError::Parse("empty configuration".into()));
    }

    let mut cursor = Cursor::new(tokens);
    let mut container = Container::default();

    let has_http_block = cursor.peek_value() == Some("http");
    if has_http_block {
        cursor.pos += 1;
        cursor.expect_symbol("{", "after 'http'")?;
        let mut depth = 1;
        while depth > 0 {
            match cursor.peek_value() {
                Some("{") => {
                    depth += 1;
                    cursor.pos += 1;
                }
                Some("}") => {
                    depth -= 1;
                    cursor.pos += 1;
                }
                None => return Err(ConfigError::Parse("unclosed 'http' block: missing '}'".into())),
                Some("server") => {
                    let server = parse_server(&mut cursor)?;
                    container.servers.push(server);
                }
                _ => cursor.pos += 1,
            }
        }
        while cursor.peek_value() == Some(";") {
            cursor.pos += 1;
        }
        if cursor.peek().is_some() {
            return Err(ConfigError::Parse("unexpected tokens after 'http' block".into()));
        }
    } else {
        while cursor.peek().is_some() {
            while cursor.peek_value() == Some(";") {
                cursor.pos += 1;
            }
            if cursor.peek().is_none() {
                break;
            }
            if cursor.peek_value() == Some("server") {
                let server = parse_server(&mut cursor)?;
                container.servers.push(server);
            } else {
                return Err(ConfigError::Parse("expected 'server' block at top level".into()));
            }
        }
    }

    if container.servers.is_empty() {
        return Err(ConfigError::NoServers);
    }

    Ok(container)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::lexer::lex;

    fn parse_text(text: &str) -> Result<Container, ConfigError> {
        parse(&lex(text).unwrap())
    }

    #[test]
    fn minimal_server_parses() {
        let container = parse_text("server { listen 4269; }").unwrap();
        assert_eq!(container.servers.len(), 1);
        assert_eq!(container.servers[0].listens, vec![(4269, "0.0.0.0".to_string())]);
    }

    #[test]
    fn root_ending_in_slash_must_exist() {
        assert!(parse_text("server { root /no/such/dir/; }").is_err());
        let dir = tempfile::tempdir().unwrap();
        let root = format!("{}/", dir.path().display());
        let container = parse_text(&format!("server {{ root {root}; }}")).unwrap();
        assert_eq!(container.servers[0].base.root.as_deref(), Some(root.as_str()));
    }

    #[test]
    fn root_without_trailing_slash_is_not_stat_checked() {
        let container = parse_text("server { root /no/such/dir; }").unwrap();
        assert_eq!(container.servers[0].base.root.as_deref(), Some("/no/such/dir"));
    }

    #[test]
    fn http_wrapper_parses() {
        let container = parse_text("http { server { listen 80; } }").unwrap();
        assert_eq!(container.servers.len(), 1);
    }

    #[test]
    fn missing_semicolon_is_fatal() {
        assert!(parse_text("server { listen 80 root /x/; }").is_err());
    }

    #[test]
    fn unclosed_block_is_fatal() {
        assert!(parse_text("server { listen 80;").is_err());
    }

    #[test]
    fn zero_servers_is_fatal() {
        assert!(parse_text("http { }").is_err());
    }

    #[test]
    fn client_max_body_size_suffix() {
        let container = parse_text("server { client_max_body_size 2m; }").unwrap();
        assert_eq!(container.servers[0].base.client_max_body_size, Some(2 * 1024 * 1024));
    }

    #[test]
    fn location_error_page_requires_page_and_codes() {
        let container =
            parse_text("server { location / { error_page 404 500 /err.html; } }").unwrap();
        let loc = &container.servers[0].locations[0];
        assert_eq!(loc.base.error_pages.get(&404).map(String::as_str), Some("/err.html"));
        assert_eq!(loc.base.error_pages.get(&500).map(String::as_str), Some("/err.html"));
    }

    #[test]
    fn location_modifiers_parse() {
        let container = parse_text("server { location = /exact { } }").unwrap();
        assert_eq!(container.servers[0].locations[0].match_type, MatchType::Exact);
    }

    #[test]
    fn default_listen_and_location_when_absent() {
        let container = parse_text("server { root /no/such/dir; }").unwrap();
        let server = &container.servers[0];
        assert_eq!(server.listens, vec![(80, "0.0.0.0".to_string())]);
        assert_eq!(server.locations.len(), 1);
        assert_eq!(server.locations[0].path, "/");
    }
}
