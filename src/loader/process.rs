//! Child-process implementation of [`AppLoader`].
//!
//! A load runs the build command (only when sources changed since the last
//! build), resolves the run program and spawns it with the control address
//! in its environment. Two helper threads follow each child:
//!
//! - stderr tee: echoes the child's stderr and keeps the last lines for the
//!   error page
//! - monitor: reaps the child, reports an unexpected exit and a child that
//!   never connects to the control channel

use std::collections::{BTreeMap, VecDeque};
use std::ffi::OsString;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use super::control::{ControlLink, ControlServer};
use super::{
    AppHandle, AppLoader, ContractViolation, DestroyCallback, LifecycleHooks, LoadError,
    LoadFailure, TeardownError,
};
use crate::config::MonitorConfig;
use crate::protocol::{ENV_CONTROL, ENV_GENERATION, ENV_ROOT, SupervisorMessage};
use crate::utils::exec::{Cmd, format_failure};
use crate::utils::path::unix_slashes;
use crate::debug;

/// How long a destroyed application may take to exit on its own.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);
/// Child status poll interval.
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// A child that has not said hello by then does not follow the contract.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);
/// Stderr lines kept for the error page.
const STDERR_TAIL: usize = 40;

/// Builds and spawns the application as a child process.
pub struct ProcessLoader {
    root: PathBuf,
    run: Vec<String>,
    build: Vec<String>,
    env: BTreeMap<String, String>,
    port: u16,
    /// Paths changed since the last build
    dirty: FxHashSet<PathBuf>,
    built_once: bool,
    /// Failure of the last build, returned again until something changes
    last_build_failure: Option<LoadError>,
    /// Echo stderr of the next spawn (cleared while a crash loop repeats)
    fresh: bool,
    hello_timeout: Duration,
    control: ControlServer,
}

impl ProcessLoader {
    /// Loader for `run`, started from `root`.
    pub fn new(root: &Path, run: Vec<String>) -> io::Result<Self> {
        Ok(Self {
            root: root.to_path_buf(),
            run,
            build: Vec::new(),
            env: BTreeMap::new(),
            port: crate::config::DEFAULT_PORT,
            dirty: FxHashSet::default(),
            built_once: false,
            last_build_failure: None,
            fresh: true,
            hello_timeout: HELLO_TIMEOUT,
            control: ControlServer::bind()?,
        })
    }

    pub fn from_config(config: &MonitorConfig) -> io::Result<Self> {
        Ok(Self::new(config.get_root(), config.app.run.clone())?
            .with_build(config.app.build.clone())
            .with_env(config.app.env.clone())
            .with_port(config.port))
    }

    pub fn with_build(mut self, build: Vec<String>) -> Self {
        self.build = build;
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_hello_timeout(mut self, timeout: Duration) -> Self {
        self.hello_timeout = timeout;
        self
    }

    /// Run the build command unless nothing changed since the last one.
    fn build_if_needed(&mut self) -> Result<(), LoadFailure> {
        if self.build.is_empty() {
            self.dirty.clear();
            return Ok(());
        }
        if self.built_once && self.dirty.is_empty() {
            return match &self.last_build_failure {
                Some(err) => Err(err.clone().into()),
                None => Ok(()),
            };
        }

        let changed = self.dirty.len();
        self.dirty.clear();
        self.built_once = true;

        let cmd = Cmd::from_slice(&self.build)
            .cwd(&self.root)
            .envs(&self.env);
        let display = cmd.display();
        debug!("build"; "running `{}` ({} changed paths)", display, changed);

        let started = Instant::now();
        let output = match cmd.run() {
            Ok(output) => output,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.built_once = false;
                return Err(ContractViolation::UnresolvedProgram(self.build[0].clone()).into());
            }
            Err(e) => {
                let err = LoadError::new(format!("failed to run `{display}`"), e.to_string());
                self.last_build_failure = Some(err.clone());
                return Err(err.into());
            }
        };

        if output.status.success() {
            debug!("build"; "finished in {:?}", started.elapsed());
            self.last_build_failure = None;
            Ok(())
        } else {
            let (summary, detail) = format_failure(&display, &output);
            let err = LoadError::new(summary, detail);
            self.last_build_failure = Some(err.clone());
            Err(err.into())
        }
    }

    fn resolve_program(&self, entry: &Path) -> Result<PathBuf, ContractViolation> {
        which::which_in(entry, std::env::var_os("PATH"), &self.root)
            .map_err(|_| ContractViolation::UnresolvedProgram(entry.display().to_string()))
    }
}

impl AppLoader for ProcessLoader {
    fn invalidate(&mut self, path: &Path) {
        self.dirty.insert(path.to_path_buf());
        self.fresh = true;
    }

    fn load(
        &mut self,
        entry: &Path,
        hooks: LifecycleHooks,
    ) -> Result<Box<dyn AppHandle>, LoadFailure> {
        self.build_if_needed()?;
        let program = self.resolve_program(entry)?;

        let generation = hooks.generation();
        let link = self.control.register(hooks.clone());

        let mut argv: Vec<OsString> = vec![program.into_os_string()];
        argv.extend(self.run.iter().skip(1).map(OsString::from));
        let cmd = Cmd::from_slice(&argv)
            .cwd(&self.root)
            .envs(&self.env)
            .env("PORT", self.port.to_string())
            .env(ENV_CONTROL, self.control.addr().to_string())
            .env(ENV_GENERATION, generation.to_string())
            .env(ENV_ROOT, unix_slashes(&self.root));
        let display = cmd.display();

        let mut child = cmd.spawn().map_err(|e| {
            LoadFailure::from(LoadError::new(
                format!("failed to start `{display}`"),
                e.to_string(),
            ))
        })?;
        debug!("app"; "spawned `{}` (pid {}, generation {})", display, child.id(), generation);

        let echo = std::mem::replace(&mut self.fresh, false) || crate::logger::is_verbose();
        let tail: Arc<Mutex<VecDeque<String>>> = Arc::default();
        let tee = child
            .stderr
            .take()
            .map(|stderr| spawn_tee(stderr, Arc::clone(&tail), echo));

        let child = Arc::new(Mutex::new(child));
        let stopping = Arc::new(AtomicBool::new(false));

        let monitor = Monitor {
            child: Arc::clone(&child),
            stopping: Arc::clone(&stopping),
            link: link.clone(),
            hooks,
            hello_timeout: self.hello_timeout,
            tail,
            tee,
        };
        thread::spawn(move || monitor.run());

        Ok(Box::new(ProcessHandle {
            child,
            link,
            stopping,
        }))
    }
}

fn spawn_tee(stderr: ChildStderr, tail: Arc<Mutex<VecDeque<String>>>, echo: bool) -> JoinHandle<()> {
    thread::spawn(move || {
        for line in BufReader::new(stderr).lines() {
            let Ok(line) = line else { break };
            if echo {
                crate::logger::status_interrupted();
                eprintln!("{line}");
            }
            let mut tail = tail.lock();
            if tail.len() == STDERR_TAIL {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    })
}

/// Follows one child until it exits.
struct Monitor {
    child: Arc<Mutex<Child>>,
    stopping: Arc<AtomicBool>,
    link: ControlLink,
    hooks: LifecycleHooks,
    hello_timeout: Duration,
    tail: Arc<Mutex<VecDeque<String>>>,
    tee: Option<JoinHandle<()>>,
}

impl Monitor {
    fn run(self) {
        let started = Instant::now();
        let mut silent_reported = false;

        let status = loop {
            match self.child.lock().try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => {
                    debug!("app"; "cannot poll child: {}", e);
                    return;
                }
            }
            if !silent_reported
                && !self.link.announced()
                && !self.stopping.load(Ordering::SeqCst)
                && started.elapsed() > self.hello_timeout
            {
                silent_reported = true;
                self.hooks.unrecognized(format!(
                    "no hello within {:?}; connect with remon::client::Readiness",
                    self.hello_timeout
                ));
            }
            thread::sleep(POLL_INTERVAL);
        };

        if self.stopping.load(Ordering::SeqCst) {
            return;
        }

        // Let the tee drain, but don't hang on a grandchild holding stderr.
        if let Some(tee) = self.tee {
            let deadline = Instant::now() + Duration::from_millis(200);
            while !tee.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
        }

        let stack = self
            .tail
            .lock()
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n");
        self.hooks
            .exited(LoadError::new(format!("application exited with {status}"), stack));
    }
}

/// A running child process.
struct ProcessHandle {
    child: Arc<Mutex<Child>>,
    link: ControlLink,
    stopping: Arc<AtomicBool>,
}

impl ProcessHandle {
    /// Ask nicely, wait out the grace period, then kill.
    fn stop(child: &Mutex<Child>, link: &ControlLink) -> Result<(), TeardownError> {
        if link.send(SupervisorMessage::Shutdown) {
            let deadline = Instant::now() + SHUTDOWN_GRACE;
            while Instant::now() < deadline {
                if child.lock().try_wait()?.is_some() {
                    return Ok(());
                }
                thread::sleep(POLL_INTERVAL);
            }
            debug!("app"; "no exit after {:?}, killing", SHUTDOWN_GRACE);
        }

        let mut child = child.lock();
        if child.try_wait()?.is_none() {
            child.kill()?;
        }
        child.wait()?;
        Ok(())
    }
}

impl AppHandle for ProcessHandle {
    fn destroy(self: Box<Self>, done: DestroyCallback) {
        self.stopping.store(true, Ordering::SeqCst);
        thread::spawn(move || {
            let result = Self::stop(&self.child, &self.link);
            done(result);
        });
    }

    fn terminate(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        let mut child = self.child.lock();
        let _ = child.kill();
        let _ = child.wait();
    }
}
