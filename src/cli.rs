//! Command-line surface: a single optional config-path positional plus a
//! repeated verbosity flag, per §10.4.

use std::path::PathBuf;

use clap::Parser;

/// Minimal nginx-like HTTP/1.x origin server.
#[derive(Debug, Parser)]
#[command(name = "pginx", version, about)]
pub struct Cli {
    /// Path to the directive-block configuration file.
    ///
    /// Defaults to `config/default.conf` when omitted.
    pub config: Option<PathBuf>,

    /// Increase log verbosity; repeat for more detail.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

pub const DEFAULT_CONFIG_PATH: &str = "config/default.conf";

/// Enforce the `.conf` suffix and 5-30 character length rule from §6. Shape
/// validation (arity, flags) is already handled by `clap`; this is the
/// domain-specific check layered on top.
pub fn validate_config_path(path: &std::path::Path) -> Result<(), String> {
    let name = path
        .to_str()
        .ok_or_else(|| "config path must be valid UTF-8".to_string())?;
    if !name.ends_with(".conf") {
        return Err(format!("config path '{name}' must end with '.conf'"));
    }
    if !(5..=30).contains(&name.len()) {
        return Err(format!(
            "config path '{name}' must be between 5 and 30 characters"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn rejects_missing_suffix() {
        assert!(validate_config_path(Path::new("nginx.yaml")).is_err());
    }

    #[test]
    fn rejects_too_short_or_long_name() {
        assert!(validate_config_path(Path::new("a.conf")).is_err());
        let long = format!("{}.conf", "x".repeat(30));
        assert!(validate_config_path(Path::new(&long)).is_err());
    }

    #[test]
    fn accepts_well_formed_path() {
        assert!(validate_config_path(Path::new("default.conf")).is_ok());
    }
}
