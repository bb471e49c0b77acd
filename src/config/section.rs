//! Configuration sections of `remon.toml`.
//!
//! ```toml
//! [app]
//! run = ["target/debug/my-app"]   # application command line
//! build = ["cargo", "build"]      # run before a start when sources changed
//! env = { RUST_LOG = "info" }     # extra environment for both commands
//!
//! [watch]
//! add_ignore = ["/assets/generated/**"]
//!
//! [diagnostic]
//! interface = "0.0.0.0"
//! port = 3000
//! ```

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

/// `[app]` section: how to build and run the supervised application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application command line. Overridden by the trailing CLI command.
    pub run: Vec<String>,

    /// Optional build command.
    pub build: Vec<String>,

    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
}

/// `[watch]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Ignore rules added to the built-in defaults, relative to the root.
    pub add_ignore: Vec<String>,
}

/// `[diagnostic]` section: the error page shown while the app is down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticConfig {
    /// Network interface to bind.
    pub interface: IpAddr,

    /// Port; `$PORT` and `--port` take precedence.
    pub port: Option<u16>,
}

impl Default for DiagnosticConfig {
    fn default() -> Self {
        Self {
            interface: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: None,
        }
    }
}
