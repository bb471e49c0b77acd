//! Restart controller: the state machine behind every restart.
//!
//! ```text
//!            load ok + ready                 change
//! STARTING ─────────────────► RUNNING ─────────────────► RESTARTING
//!    │  ▲                        │ exited                     │ destroyed
//!    │  │ retry (100ms)          ▼                            │
//!    │  └──────────────────── FAILED ◄──────── load error ────┤
//!    └── load error ────────────►                             │
//!    ▲                                                        │
//!    └────────────────────────────────────────────────────────┘
//!
//! contract violation / teardown error ──► EXITED
//! ```
//!
//! Every method runs inside the supervisor task, so transitions never
//! interleave. `restartable` is the mutual exclusion flag: it is true only
//! between readiness and the next teardown request.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

use super::messages::{AppSignal, SupervisorMsg};
use super::state::{Phase, ReloadState, TimerAction};
use crate::diagnostic::{DiagnosticServer, ErrorReport};
use crate::loader::{
    AppHandle, AppLoader, ContractViolation, LifecycleHooks, LoadError, LoadFailure, Manifest,
    TeardownError,
};
use crate::logger::{status_error, status_success};
use crate::protocol::PROTOCOL_VERSION;
use crate::utils::path::normalize_path;
use crate::{debug, log};

/// Errors that end the supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("application does not follow the startup contract")]
    Contract(#[from] ContractViolation),

    #[error("teardown failed")]
    Teardown(#[from] TeardownError),
}

pub struct RestartController<L: AppLoader> {
    state: ReloadState,
    loader: L,
    /// Application entry handed to the loader
    entry: PathBuf,
    /// Watched project root, normalized
    root: PathBuf,
    diagnostic: DiagnosticServer,
    app: Option<Box<dyn AppHandle>>,
    tx: UnboundedSender<SupervisorMsg>,
    /// Our own executable; changes to it never trigger a restart
    own_exe: Option<PathBuf>,
    profile: bool,
    load_started: Option<Instant>,
    /// Current generation passed validation
    validated: bool,
    /// The page was taken down so the current instance could bind the port
    page_released: bool,
    /// Serving the page failed for the current error
    page_failed: bool,
}

impl<L: AppLoader> RestartController<L> {
    pub fn new(
        loader: L,
        entry: PathBuf,
        root: &Path,
        diagnostic: DiagnosticServer,
        tx: UnboundedSender<SupervisorMsg>,
    ) -> Self {
        Self {
            state: ReloadState::new(),
            loader,
            entry,
            root: normalize_path(root),
            diagnostic,
            app: None,
            tx,
            own_exe: std::env::current_exe().ok().map(|p| normalize_path(&p)),
            profile: false,
            load_started: None,
            validated: false,
            page_released: false,
            page_failed: false,
        }
    }

    /// Print startup time after every successful start.
    pub fn with_profile(mut self, profile: bool) -> Self {
        self.profile = profile;
        self
    }

    pub fn state(&self) -> &ReloadState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.state.deadline()
    }

    pub fn diagnostic(&self) -> &DiagnosticServer {
        &self.diagnostic
    }

    /// First start.
    pub fn boot(&mut self) -> Result<(), SupervisorError> {
        debug!("app"; "root {}", self.root.display());
        self.start()
    }

    /// Dispatch one message. `Ok(false)` means stop.
    pub fn handle(&mut self, msg: SupervisorMsg) -> Result<bool, SupervisorError> {
        match msg {
            SupervisorMsg::Changed(path) => self.on_change(path)?,
            SupervisorMsg::App { generation, signal } => self.on_signal(generation, signal)?,
            SupervisorMsg::Destroyed { generation, result } => {
                self.on_destroyed(generation, result)?;
            }
            SupervisorMsg::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    // =========================================================================
    // Change debouncing
    // =========================================================================

    /// A watched path changed.
    pub fn on_change(&mut self, path: Option<PathBuf>) -> Result<(), SupervisorError> {
        let Some(path) = path else {
            return Ok(());
        };
        if self.own_exe.as_deref() == Some(path.as_path()) {
            debug!("watch"; "ignoring change to own executable");
            return Ok(());
        }

        self.loader.invalidate(&path);
        self.loader.invalidate(&self.entry);
        self.state.change_seq += 1;
        let seq = self.state.change_seq;

        if self.state.restartable {
            self.state.cancel_timer();
            log!("watch"; "{}", self.display_path(&path));
            self.restart()
        } else {
            if self.state.schedule_change(path, seq, Instant::now()) {
                debug!("watch"; "change deferred while {}", self.state.phase.label());
            }
            Ok(())
        }
    }

    /// The pending timer may be due.
    pub fn on_timer(&mut self, now: Instant) -> Result<(), SupervisorError> {
        match self.state.take_due(now) {
            Some(TimerAction::Change { path, seq }) => {
                self.loader.invalidate(&path);
                if !self.state.restartable {
                    self.state.schedule_change(path, seq, now);
                    Ok(())
                } else if seq > self.state.loaded_seq {
                    log!("watch"; "{}", self.display_path(&path));
                    self.restart()
                } else {
                    debug!("watch"; "change already picked up by the last start");
                    Ok(())
                }
            }
            Some(TimerAction::Start) if self.state.phase == Phase::Failed => self.start(),
            Some(TimerAction::Start) | None => Ok(()),
        }
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// RUNNING → RESTARTING: tear the current instance down.
    fn restart(&mut self) -> Result<(), SupervisorError> {
        self.state.restartable = false;
        self.state.phase = Phase::Restarting;

        let Some(app) = self.app.take() else {
            return self.start();
        };

        debug!("app"; "restarting");
        let generation = self.state.generation;
        let tx = self.tx.clone();
        app.destroy(Box::new(move |result| {
            let _ = tx.send(SupervisorMsg::Destroyed { generation, result });
        }));
        Ok(())
    }

    /// RESTARTING → STARTING once teardown finished.
    pub fn on_destroyed(
        &mut self,
        generation: u64,
        result: Result<(), TeardownError>,
    ) -> Result<(), SupervisorError> {
        if let Err(e) = result {
            log!("error"; "failed to stop the application: {}", e);
            return Err(self.exit(e.into()));
        }
        if self.state.phase != Phase::Restarting || generation != self.state.generation {
            debug!("app"; "ignoring teardown of generation {}", generation);
            return Ok(());
        }
        self.start()
    }

    /// → STARTING: load a new instance.
    fn start(&mut self) -> Result<(), SupervisorError> {
        self.state.phase = Phase::Starting;
        self.state.restartable = false;
        self.state.generation += 1;
        self.state.loaded_seq = self.state.change_seq;
        self.validated = false;
        self.load_started = Some(Instant::now());

        let hooks = LifecycleHooks::new(self.state.generation, self.tx.clone());
        match self.loader.load(&self.entry, hooks) {
            Ok(app) => {
                self.app = Some(app);
                Ok(())
            }
            Err(LoadFailure::Transient(err)) => {
                self.fail(err);
                Ok(())
            }
            Err(LoadFailure::Contract(violation)) => Err(self.violation(violation)),
        }
    }

    /// Lifecycle signal from an instance.
    pub fn on_signal(&mut self, generation: u64, signal: AppSignal) -> Result<(), SupervisorError> {
        if generation != self.state.generation || self.state.phase == Phase::Exited {
            debug!("app"; "ignoring signal from generation {}", generation);
            return Ok(());
        }

        match signal {
            AppSignal::Announce(manifest) => {
                self.validate(&manifest).map_err(|v| self.violation(v))?;
                self.validated = true;
                debug!("app"; "generation {} announced (pid {:?})", generation, manifest.pid);
            }
            AppSignal::Unrecognized(reason) => {
                return Err(self.violation(ContractViolation::Unrecognized(reason)));
            }
            AppSignal::Initialized(ack) => {
                if self.state.phase != Phase::Starting || !self.validated {
                    return Ok(());
                }
                // The port must be free before the app binds it.
                self.diagnostic.stop();
                self.page_released = true;
                let _ = ack.send(());
            }
            AppSignal::Listening(result) => {
                if self.state.phase != Phase::Starting {
                    return Ok(());
                }
                if let Err(e) = result {
                    log!("error"; "application failed to listen: {}", e);
                }
                self.ready();
            }
            AppSignal::Exited(err) => match self.state.phase {
                Phase::Starting | Phase::Running => {
                    self.app = None;
                    self.fail(err);
                }
                _ => {}
            },
        }
        Ok(())
    }

    /// STARTING → RUNNING.
    fn ready(&mut self) {
        self.diagnostic.stop();
        self.page_released = false;
        self.state.last_error.clear();
        self.state.restartable = true;
        self.state.phase = Phase::Running;

        if self.profile
            && let Some(started) = self.load_started
        {
            log!("profile"; "started in {:?}", started.elapsed());
        }
        status_success("waiting for changes");
    }

    /// → FAILED: report a new error, always schedule a retry.
    fn fail(&mut self, err: LoadError) {
        self.state.phase = Phase::Failed;
        self.state.restartable = false;

        let last = &mut self.state.last_error;
        if !last.is_same(&err.message, &err.stack) {
            last.set(&err.message, &err.stack);
            last.reported = true;
            self.page_failed = false;
            status_error(&err.message, &err.stack);
            self.show_error(&err);
        } else if self.page_released && !self.diagnostic.is_listening() {
            // Same error, but the page went down while the last instance started.
            self.show_error(&err);
        }
        self.page_released = false;

        self.state.schedule_start(Instant::now());
    }

    /// Serve `err`; a bind failure is logged once per error.
    fn show_error(&mut self, err: &LoadError) {
        if let Err(e) = self.diagnostic.start(ErrorReport::from(err)) {
            if !self.page_failed {
                log!("diagnostic"; "cannot serve the error page: {}", e);
            }
            self.page_failed = true;
        }
    }

    fn validate(&self, manifest: &Manifest) -> Result<(), ContractViolation> {
        if manifest.protocol != PROTOCOL_VERSION {
            return Err(ContractViolation::Protocol {
                expected: PROTOCOL_VERSION,
                got: manifest.protocol,
            });
        }
        let root = manifest.root.as_deref().ok_or(ContractViolation::MissingRoot)?;
        let root = normalize_path(root);
        if root != self.root {
            return Err(ContractViolation::RootMismatch {
                expected: self.root.clone(),
                got: root,
            });
        }
        Ok(())
    }

    fn violation(&mut self, violation: ContractViolation) -> SupervisorError {
        log!("fatal"; "{}", violation);
        self.exit(violation.into())
    }

    /// → EXITED.
    fn exit(&mut self, err: SupervisorError) -> SupervisorError {
        self.shutdown();
        err
    }

    /// Stop everything right now. Idempotent.
    pub fn shutdown(&mut self) {
        self.state.phase = Phase::Exited;
        self.state.restartable = false;
        self.state.cancel_timer();
        if let Some(mut app) = self.app.take() {
            app.terminate();
        }
        self.diagnostic.stop();
    }

    fn display_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .display()
            .to_string()
    }
}
