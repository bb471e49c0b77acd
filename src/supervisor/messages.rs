//! Supervisor Message Definitions
//!
//! Everything that happens outside the supervisor task reaches it as one of
//! these messages:
//!
//! ```text
//! FsWatcher ──Changed──────┐
//! control readers ──App────┤
//! child monitors ──App─────┼──► Supervisor (owns RestartController)
//! destroy threads ──Destroyed
//! Ctrl+C ──Shutdown────────┘
//! ```

use std::path::PathBuf;

use tokio::sync::oneshot;

use crate::loader::{LoadError, Manifest, TeardownError};

/// Messages to the Supervisor
#[derive(Debug)]
pub enum SupervisorMsg {
    /// A watched path changed (`None` when the event carried no path)
    Changed(Option<PathBuf>),
    /// Lifecycle signal from an application instance
    App { generation: u64, signal: AppSignal },
    /// Teardown of an instance finished
    Destroyed {
        generation: u64,
        result: Result<(), TeardownError>,
    },
    /// Stop the application and exit
    Shutdown,
}

/// What an application instance reported.
#[derive(Debug)]
pub enum AppSignal {
    /// First control message: protocol and root
    Announce(Manifest),
    /// First control message was not an announcement
    Unrecognized(String),
    /// Initialization done; reply on the sender once the port is free
    Initialized(oneshot::Sender<()>),
    /// Listener bound, or the bind error
    Listening(Result<(), String>),
    /// Process exited on its own
    Exited(LoadError),
}
