//! Supervisor configuration: `remon.toml` merged with CLI arguments.
//!
//! # Sections
//!
//! | Section        | Purpose                                        |
//! |----------------|------------------------------------------------|
//! | `[app]`        | Run/build command lines, extra environment     |
//! | `[watch]`      | Additional ignore rules                        |
//! | `[diagnostic]` | Interface and port of the error page           |
//!
//! The file is optional; everything can be given on the command line.

mod error;
mod section;
mod util;

pub use error::ConfigError;
pub use section::{AppConfig, DiagnosticConfig, WatchConfig};

use crate::{cli::Cli, log, utils::path::normalize_path};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
};
use util::{expand_program, find_config_file};

/// Port used when neither the CLI, `$PORT` nor the config file set one.
pub const DEFAULT_PORT: u16 = 3000;

/// Root configuration structure representing remon.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Absolute path to the config file, if one was found (internal use only)
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    /// Watched project root (internal use only)
    #[serde(skip)]
    pub root: PathBuf,

    /// Resolved port shared by the application and the diagnostic page
    #[serde(skip)]
    pub port: u16,

    /// Print startup time after each successful start
    #[serde(skip)]
    pub profile: bool,

    #[serde(default)]
    pub app: AppConfig,

    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(default)]
    pub diagnostic: DiagnosticConfig,
}

impl MonitorConfig {
    /// Load configuration from CLI arguments.
    ///
    /// Searches upward from cwd for the config file; the project root is the
    /// config file's directory unless `--root` is given.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let cwd = std::env::current_dir().map_err(|e| ConfigError::Io(PathBuf::from("."), e))?;
        let config_path = find_config_file(&cli.config, &cwd);

        let mut config = match &config_path {
            Some(path) => Self::from_path(path)?,
            None => Self::default(),
        };

        let root = match (&cli.root, &config_path) {
            (Some(root), _) => cwd.join(root),
            (None, Some(path)) => path.parent().map(Path::to_path_buf).unwrap_or(cwd.clone()),
            (None, None) => cwd.clone(),
        };
        let root = normalize_path(&root);
        if !root.is_dir() {
            return Err(ConfigError::NotADirectory(root));
        }

        config.root = root;
        config.config_path = config_path;
        config.apply_cli(cli, std::env::var("PORT").ok().as_deref())?;
        Ok(config)
    }

    /// Parse configuration from TOML string
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let (config, _) = Self::parse_with_ignored(content)?;
        Ok(config)
    }

    /// Load configuration from file path with unknown field detection.
    fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|err| ConfigError::Io(path.to_path_buf(), err))?;

        let (config, ignored) = Self::parse_with_ignored(&content)?;
        if !ignored.is_empty() {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy())
                .unwrap_or_else(|| path.to_string_lossy());
            log!("warning"; "unknown fields in {} ignored: {}", name, ignored.join(", "));
        }
        Ok(config)
    }

    /// Parse TOML content, collecting any unknown fields.
    fn parse_with_ignored(content: &str) -> Result<(Self, Vec<String>), ConfigError> {
        let mut ignored = Vec::new();
        let deserializer = toml::Deserializer::new(content);
        let config = serde_ignored::deserialize(deserializer, |path: serde_ignored::Path| {
            ignored.push(path.to_string());
        })?;
        Ok((config, ignored))
    }

    /// Apply CLI overrides. `env_port` is the value of `$PORT`, if set.
    fn apply_cli(&mut self, cli: &Cli, env_port: Option<&str>) -> Result<(), ConfigError> {
        crate::logger::set_verbose(cli.verbose);
        self.profile = cli.profile;

        if !cli.command.is_empty() {
            self.app.run = cli.command.clone();
        }
        if let Some(build) = cli.build_command() {
            self.app.build = build;
        }
        if let Some(interface) = cli.interface {
            self.diagnostic.interface = interface;
        }
        self.watch.add_ignore.extend(cli.ignore.iter().cloned());

        if self.app.run.is_empty() {
            return Err(ConfigError::MissingCommand);
        }
        expand_program(&mut self.app.run);
        expand_program(&mut self.app.build);

        self.port = resolve_port(cli.port, env_port, self.diagnostic.port)?;
        Ok(())
    }

    /// Get the root directory path
    pub fn get_root(&self) -> &Path {
        &self.root
    }

    /// Address the diagnostic page binds to.
    pub fn diagnostic_addr(&self) -> SocketAddr {
        SocketAddr::new(self.diagnostic.interface, self.port)
    }

    /// The application's entry: the run program, resolved against the root.
    ///
    /// Bare program names (looked up on `PATH`) are returned unchanged.
    pub fn entry(&self) -> PathBuf {
        let program = Path::new(self.app.run.first().map(String::as_str).unwrap_or_default());
        if program.components().count() > 1 && program.is_relative() {
            self.root.join(program)
        } else {
            program.to_path_buf()
        }
    }
}

/// Port precedence: `--port` > `$PORT` > config file > 3000.
fn resolve_port(
    cli: Option<u16>,
    env: Option<&str>,
    file: Option<u16>,
) -> Result<u16, ConfigError> {
    if let Some(port) = cli {
        return Ok(port);
    }
    if let Some(raw) = env.map(str::trim).filter(|s| !s.is_empty()) {
        return raw
            .parse()
            .map_err(|_| ConfigError::InvalidPort(raw.to_string()));
    }
    Ok(file.unwrap_or(DEFAULT_PORT))
}

/// Parse a config for tests, asserting every field is known.
#[cfg(test)]
pub fn test_parse_config(content: &str) -> MonitorConfig {
    let (parsed, ignored) = MonitorConfig::parse_with_ignored(content).unwrap();
    assert!(
        ignored.is_empty(),
        "test config has unknown fields: {:?}",
        ignored
    );
    parsed
}

// ============================================================================
// tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::net::{IpAddr, Ipv4Addr};

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("remon").chain(args.iter().copied()))
    }

    #[test]
    fn test_full_config() {
        let config = test_parse_config(
            r#"
[app]
run = ["target/debug/app", "--dev"]
build = ["cargo", "build"]
env = { RUST_LOG = "debug" }

[watch]
add_ignore = ["/assets/**"]

[diagnostic]
interface = "127.0.0.1"
port = 8080
"#,
        );
        assert_eq!(config.app.run, vec!["target/debug/app", "--dev"]);
        assert_eq!(config.app.build, vec!["cargo", "build"]);
        assert_eq!(config.app.env["RUST_LOG"], "debug");
        assert_eq!(config.watch.add_ignore, vec!["/assets/**"]);
        assert_eq!(config.diagnostic.port, Some(8080));
        assert_eq!(
            config.diagnostic.interface,
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
        );
    }

    #[test]
    fn test_defaults() {
        let config = test_parse_config("");
        assert!(config.app.run.is_empty());
        assert!(config.app.build.is_empty());
        assert!(config.watch.add_ignore.is_empty());
        assert_eq!(config.diagnostic.interface, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.diagnostic.port, None);
    }

    #[test]
    fn test_unknown_fields_collected() {
        let (_, ignored) = MonitorConfig::parse_with_ignored("[app]\nrunn = []\n").unwrap();
        assert_eq!(ignored, vec!["app.runn"]);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            MonitorConfig::from_str("[app\nrun = 1"),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn test_port_precedence() {
        assert_eq!(resolve_port(Some(1), Some("2"), Some(3)).unwrap(), 1);
        assert_eq!(resolve_port(None, Some("2"), Some(3)).unwrap(), 2);
        assert_eq!(resolve_port(None, None, Some(3)).unwrap(), 3);
        assert_eq!(resolve_port(None, Some(" "), None).unwrap(), DEFAULT_PORT);
        assert_eq!(resolve_port(None, None, None).unwrap(), DEFAULT_PORT);
    }

    #[test]
    fn test_invalid_env_port() {
        assert!(matches!(
            resolve_port(None, Some("http"), None),
            Err(ConfigError::InvalidPort(p)) if p == "http"
        ));
    }

    #[test]
    fn test_cli_command_overrides_file() {
        let mut config = test_parse_config("[app]\nrun = [\"old\"]\nbuild = [\"make\"]");
        config
            .apply_cli(&cli(&["-b", "cargo build", "-x", "/tmp/**", "--", "new", "-q"]), None)
            .unwrap();
        assert_eq!(config.app.run, vec!["new", "-q"]);
        assert_eq!(config.app.build, vec!["cargo", "build"]);
        assert_eq!(config.watch.add_ignore, vec!["/tmp/**"]);
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn test_missing_command() {
        let mut config = test_parse_config("");
        assert!(matches!(
            config.apply_cli(&cli(&[]), None),
            Err(ConfigError::MissingCommand)
        ));
    }

    #[test]
    fn test_entry_resolution() {
        let mut config = test_parse_config("[app]\nrun = [\"target/debug/app\"]");
        config.root = PathBuf::from("/project");
        assert_eq!(config.entry(), PathBuf::from("/project/target/debug/app"));

        config.app.run = vec!["node".into(), "app.js".into()];
        assert_eq!(config.entry(), PathBuf::from("node"));

        config.app.run = vec!["/usr/bin/app".into()];
        assert_eq!(config.entry(), PathBuf::from("/usr/bin/app"));
    }

    #[test]
    fn test_diagnostic_addr() {
        let mut config = test_parse_config("[diagnostic]\ninterface = \"127.0.0.1\"");
        config.port = 4321;
        assert_eq!(config.diagnostic_addr().to_string(), "127.0.0.1:4321");
    }
}
