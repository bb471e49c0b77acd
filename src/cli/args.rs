//! Command-line interface definitions.

use clap::{ColorChoice, Parser};
use std::path::PathBuf;

/// Restart your server on every save, show the error while it is broken
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Control colored output (auto, always, never)
    #[arg(long, global = true, default_value = "auto")]
    pub color: ColorChoice,

    /// Config file path (default: remon.toml, searched upward from cwd)
    #[arg(short = 'C', long, default_value = "remon.toml", value_hint = clap::ValueHint::FilePath)]
    pub config: PathBuf,

    /// Project root to watch (default: directory of the config file, or cwd)
    #[arg(short, long, value_hint = clap::ValueHint::DirPath)]
    pub root: Option<PathBuf>,

    /// Port for the application and the diagnostic page (overrides $PORT)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Network interface the diagnostic page binds to
    #[arg(short, long)]
    pub interface: Option<std::net::IpAddr>,

    /// Build command run before each start when sources changed (e.g. "cargo build")
    #[arg(short, long, value_name = "COMMAND")]
    pub build: Option<String>,

    /// Additional ignore rule, relative to the project root (repeatable)
    #[arg(short = 'x', long = "ignore", value_name = "GLOB")]
    pub ignore: Vec<String>,

    /// Print startup time after every successful start
    #[arg(long)]
    pub profile: bool,

    /// Enable verbose output for debugging
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Application command line (e.g. `-- target/debug/my-app --flag`)
    #[arg(last = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

impl Cli {
    /// Build command split into program + arguments.
    pub fn build_command(&self) -> Option<Vec<String>> {
        self.build
            .as_deref()
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .filter(|v: &Vec<String>| !v.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_command() {
        let cli = Cli::parse_from(["remon", "-p", "4000", "--", "target/debug/app", "--fast"]);
        assert_eq!(cli.port, Some(4000));
        assert_eq!(cli.command, vec!["target/debug/app", "--fast"]);
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["remon"]);
        assert_eq!(cli.config, PathBuf::from("remon.toml"));
        assert!(cli.command.is_empty());
        assert!(cli.ignore.is_empty());
        assert!(!cli.profile);
        assert!(cli.build_command().is_none());
    }

    #[test]
    fn test_build_command_split() {
        let cli = Cli::parse_from(["remon", "-b", "cargo build  --bin app"]);
        assert_eq!(
            cli.build_command(),
            Some(vec!["cargo".into(), "build".into(), "--bin".into(), "app".into()])
        );
    }

    #[test]
    fn test_blank_build_command_is_none() {
        let cli = Cli::parse_from(["remon", "-b", "  "]);
        assert!(cli.build_command().is_none());
    }

    #[test]
    fn test_repeatable_ignore() {
        let cli = Cli::parse_from(["remon", "-x", "/assets/**", "--ignore", "/logs/**"]);
        assert_eq!(cli.ignore, vec!["/assets/**", "/logs/**"]);
    }
}
