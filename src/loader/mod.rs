//! Application loading and teardown.
//!
//! The restart controller only talks to these traits:
//!
//! ```text
//! AppLoader::invalidate(path)          mark sources stale
//! AppLoader::load(entry, hooks)  ────► AppHandle
//!                                       │  hooks.announce / after_init / after_listen / exited
//! AppHandle::destroy(done)  ◄───────────┘
//! ```
//!
//! [`ProcessLoader`] is the production implementation: it builds and spawns
//! the application as a child process and relays the child's control
//! messages into the [`LifecycleHooks`].

mod control;
mod process;

pub use process::ProcessLoader;

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::sync::{mpsc::UnboundedSender, oneshot};

use crate::supervisor::{AppSignal, SupervisorMsg};

// =============================================================================
// Traits
// =============================================================================

/// Loads the application and forgets stale state between loads.
pub trait AppLoader: Send {
    /// Forget anything derived from `path`, so the next load sees the file
    /// as it is on disk now. Invalidating twice is the same as once.
    fn invalidate(&mut self, path: &Path);

    /// Load the application. `hooks` are installed before any application
    /// code runs.
    fn load(&mut self, entry: &Path, hooks: LifecycleHooks)
    -> Result<Box<dyn AppHandle>, LoadFailure>;
}

/// A loaded application instance.
pub trait AppHandle: Send {
    /// Tear the application down in the background; `done` is invoked
    /// exactly once when it finished (or failed to).
    fn destroy(self: Box<Self>, done: DestroyCallback);

    /// Stop the application right now, blocking until it is gone.
    ///
    /// Used when the supervisor itself exits.
    fn terminate(&mut self);
}

/// Completion callback of [`AppHandle::destroy`].
pub type DestroyCallback = Box<dyn FnOnce(Result<(), TeardownError>) + Send + 'static>;

// =============================================================================
// Errors
// =============================================================================

/// A load or startup failure the developer can fix by editing code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct LoadError {
    pub message: String,
    /// Compiler output, stderr tail or backtrace
    pub stack: String,
}

impl LoadError {
    pub fn new(message: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: stack.into(),
        }
    }
}

/// The application does not honour the startup contract. Retrying cannot fix it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractViolation {
    #[error("cannot find application program `{0}`")]
    UnresolvedProgram(String),

    #[error("application did not announce itself: {0}")]
    Unrecognized(String),

    #[error("application speaks protocol {got}, expected {expected}")]
    Protocol { expected: u32, got: u32 },

    #[error("application did not declare its root")]
    MissingRoot,

    #[error("application root `{got}` is not the watched root `{expected}`")]
    RootMismatch { expected: PathBuf, got: PathBuf },
}

/// Result of a failed [`AppLoader::load`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadFailure {
    #[error(transparent)]
    Transient(#[from] LoadError),

    #[error(transparent)]
    Contract(#[from] ContractViolation),
}

/// Teardown failure; the supervisor cannot continue from an unknown state.
#[derive(Debug, Error)]
pub enum TeardownError {
    #[error("failed to stop the application")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

// =============================================================================
// Hooks
// =============================================================================

/// What an application declares about itself when it first connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub protocol: u32,
    pub pid: Option<u32>,
    /// Project root the application belongs to
    pub root: Option<PathBuf>,
}

/// Lifecycle callbacks handed to an application instance.
///
/// Each call becomes a message to the supervisor tagged with the load
/// generation, so signals from an instance that was already replaced are
/// recognised and ignored.
#[derive(Debug, Clone)]
pub struct LifecycleHooks {
    generation: u64,
    tx: UnboundedSender<SupervisorMsg>,
}

impl LifecycleHooks {
    pub fn new(generation: u64, tx: UnboundedSender<SupervisorMsg>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// First message of an instance: who it is and where its root is.
    pub fn announce(&self, manifest: Manifest) {
        self.send(AppSignal::Announce(manifest));
    }

    /// The instance sent something that is not an announcement.
    pub fn unrecognized(&self, reason: impl Into<String>) {
        self.send(AppSignal::Unrecognized(reason.into()));
    }

    /// Initialization finished. The instance must wait for the returned
    /// receiver before binding its listener.
    pub fn after_init(&self) -> oneshot::Receiver<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(AppSignal::Initialized(ack_tx));
        ack_rx
    }

    /// Listening started (`Ok`) or failed (`Err`).
    pub fn after_listen(&self, result: Result<(), String>) {
        self.send(AppSignal::Listening(result));
    }

    /// The instance is gone.
    pub fn exited(&self, error: LoadError) {
        self.send(AppSignal::Exited(error));
    }

    fn send(&self, signal: AppSignal) {
        // Supervisor gone means we are shutting down; nothing to tell.
        let _ = self.tx.send(SupervisorMsg::App {
            generation: self.generation,
            signal,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_hooks_tag_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let hooks = LifecycleHooks::new(7, tx);

        hooks.after_listen(Ok(()));
        match rx.try_recv().unwrap() {
            SupervisorMsg::App { generation, signal } => {
                assert_eq!(generation, 7);
                assert!(matches!(signal, AppSignal::Listening(Ok(()))));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_after_init_ack_roundtrip() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let hooks = LifecycleHooks::new(1, tx);

        let mut ack_rx = hooks.after_init();
        let Some(SupervisorMsg::App {
            signal: AppSignal::Initialized(ack),
            ..
        }) = rx.try_recv().ok()
        else {
            panic!("expected Initialized");
        };
        assert!(ack_rx.try_recv().is_err());
        ack.send(()).unwrap();
        assert!(ack_rx.try_recv().is_ok());
    }

    #[test]
    fn test_send_after_supervisor_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        // must not panic
        LifecycleHooks::new(1, tx).exited(LoadError::new("x", ""));
    }

    #[test]
    fn test_load_failure_from() {
        let failure: LoadFailure = LoadError::new("boom", "").into();
        assert_eq!(failure.to_string(), "boom");
        let failure: LoadFailure = ContractViolation::MissingRoot.into();
        assert!(matches!(failure, LoadFailure::Contract(_)));
    }
}
