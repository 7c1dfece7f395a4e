//! Directive-block configuration: lexer, parser, and the resulting policy tree.

pub mod lexer;
pub mod parser;
pub mod policy;

use std::fs;
use std::path::Path;

use thiserror::Error;

pub use lexer::{Token, TokenType};
pub use policy::{BaseBlock, Container, Location, MatchType, Server};

/// Default byte budget for `client_max_body_size` when a server/location never sets it.
pub const DEFAULT_MAX_BODY_SIZE: u64 = 1024 * 1024;

/// Default document root used when nothing in the config overrides it.
pub const DEFAULT_ROOT: &str = "/var/lib/pginx/html/";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Lex(String),
    #[error("{0}")]
    Parse(String),
    #[error("no server blocks defined in configuration")]
    NoServers,
}

/// Read, lex and parse a configuration file into a [`Container`].
pub fn load(path: &Path) -> Result<Container, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let tokens = lexer::lex(&text)?;
    parser::parse(&tokens)
}
