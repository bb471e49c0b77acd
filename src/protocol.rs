//! Control channel wire format.
//!
//! One JSON object per line over a loopback TCP connection opened by the
//! application. The application sends `hello` first, then `initialized`,
//! waits for `proceed`, binds its listener and reports `listening`.
//!
//! ```text
//! app → {"type":"hello","protocol":1,"generation":3,"pid":4242,"root":"/srv/app"}
//! app → {"type":"initialized"}
//!     ← {"type":"proceed"}
//! app → {"type":"listening","error":null}
//!     ← {"type":"shutdown"}
//! ```

use std::io::{self, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Protocol revision spoken by this crate.
pub const PROTOCOL_VERSION: u32 = 1;

/// Address of the supervisor's control listener.
pub const ENV_CONTROL: &str = "REMON_CONTROL";
/// Load generation the child belongs to.
pub const ENV_GENERATION: &str = "REMON_GENERATION";
/// Watched project root.
pub const ENV_ROOT: &str = "REMON_ROOT";

/// Messages sent by the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppMessage {
    Hello {
        protocol: u32,
        generation: u64,
        #[serde(default)]
        pid: Option<u32>,
        #[serde(default)]
        root: Option<PathBuf>,
    },
    Initialized,
    Listening {
        #[serde(default)]
        error: Option<String>,
    },
}

/// Messages sent by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorMessage {
    /// Diagnostic page is down; the port is free to bind.
    Proceed,
    /// Exit now, a restart is coming.
    Shutdown,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed control message `{line}`")]
    Malformed {
        line: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Write one message as a JSON line and flush.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> io::Result<()> {
    let mut line = serde_json::to_vec(message).map_err(io::Error::other)?;
    line.push(b'\n');
    writer.write_all(&line)?;
    writer.flush()
}

/// Parse one line into a message.
pub fn parse_message<T: DeserializeOwned>(line: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(line.trim()).map_err(|source| ProtocolError::Malformed {
        line: truncate(line.trim(), 120),
        source,
    })
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_wire_format() {
        let hello = AppMessage::Hello {
            protocol: PROTOCOL_VERSION,
            generation: 3,
            pid: Some(4242),
            root: Some(PathBuf::from("/srv/app")),
        };
        let json = serde_json::to_string(&hello).unwrap();
        assert_eq!(
            json,
            r#"{"type":"hello","protocol":1,"generation":3,"pid":4242,"root":"/srv/app"}"#
        );
    }

    #[test]
    fn test_hello_without_root() {
        let msg: AppMessage =
            parse_message(r#"{"type":"hello","protocol":1,"generation":1}"#).unwrap();
        assert_eq!(
            msg,
            AppMessage::Hello {
                protocol: 1,
                generation: 1,
                pid: None,
                root: None
            }
        );
    }

    #[test]
    fn test_listening_error() {
        let msg: AppMessage =
            parse_message("{\"type\":\"listening\",\"error\":\"address in use\"}\n").unwrap();
        assert_eq!(
            msg,
            AppMessage::Listening {
                error: Some("address in use".into())
            }
        );
    }

    #[test]
    fn test_write_message_is_one_line() {
        let mut buf = Vec::new();
        write_message(&mut buf, &SupervisorMessage::Proceed).unwrap();
        assert_eq!(buf, b"{\"type\":\"proceed\"}\n");
    }

    #[test]
    fn test_malformed() {
        let err = parse_message::<AppMessage>("GET / HTTP/1.1").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));
        assert!(err.to_string().contains("GET / HTTP/1.1"));
    }

    #[test]
    fn test_truncate_long_line() {
        let line = "x".repeat(300);
        let t = truncate(&line, 120);
        assert_eq!(t.chars().count(), 121);
    }
}
