//! Readiness client for supervised applications.
//!
//! An application started by `remon` reports two moments: initialization
//! finished (it then waits until the error page released the port) and
//! listening started. Outside the supervisor every call is a no-op.
//!
//! ```no_run
//! use remon::client::Readiness;
//! use std::net::TcpListener;
//!
//! let readiness = Readiness::connect(env!("CARGO_MANIFEST_DIR")).unwrap();
//! readiness.on_shutdown(|| std::process::exit(0));
//!
//! // ... load configuration, open databases ...
//!
//! readiness.after_init().unwrap();
//! let port = std::env::var("PORT").unwrap_or_else(|_| "3000".into());
//! let listener = TcpListener::bind(("0.0.0.0", port.parse::<u16>().unwrap()));
//! readiness.after_listen(listener.as_ref().map(|_| ()));
//! ```

use std::fmt::Display;
use std::io::{self, BufRead, BufReader};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc as std_mpsc;
use std::thread;

use parking_lot::Mutex;
use thiserror::Error;

use crate::protocol::{
    AppMessage, ENV_CONTROL, ENV_GENERATION, PROTOCOL_VERSION, SupervisorMessage, parse_message,
    write_message,
};
use crate::utils::path::normalize_path;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid {name} `{value}`")]
    InvalidEnv { name: &'static str, value: String },

    #[error("cannot reach the supervisor")]
    Io(#[from] io::Error),
}

type ShutdownHandler = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct ShutdownState {
    handler: Option<ShutdownHandler>,
    requested: bool,
}

struct Attached {
    writer: Mutex<TcpStream>,
    proceed: Mutex<std_mpsc::Receiver<()>>,
    shutdown: Arc<Mutex<ShutdownState>>,
}

/// Connection to the supervisor, or a detached stand-in.
pub struct Readiness {
    attached: Option<Attached>,
}

impl Readiness {
    /// Connect using the supervisor's environment. `root` is the project
    /// root the application belongs to; it must be the watched root.
    ///
    /// Not started by `remon`: returns a detached client.
    pub fn connect(root: impl AsRef<Path>) -> Result<Self, ClientError> {
        let Ok(control) = std::env::var(ENV_CONTROL) else {
            return Ok(Self::detached());
        };
        let addr: SocketAddr = control.parse().map_err(|_| ClientError::InvalidEnv {
            name: ENV_CONTROL,
            value: control.clone(),
        })?;
        let generation = std::env::var(ENV_GENERATION).unwrap_or_default();
        let generation: u64 = generation.parse().map_err(|_| ClientError::InvalidEnv {
            name: ENV_GENERATION,
            value: generation.clone(),
        })?;
        Self::connect_to(addr, generation, root.as_ref())
    }

    /// Connect to a supervisor at `addr` as load `generation`.
    pub fn connect_to(addr: SocketAddr, generation: u64, root: &Path) -> Result<Self, ClientError> {
        let mut stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;

        write_message(
            &mut stream,
            &AppMessage::Hello {
                protocol: PROTOCOL_VERSION,
                generation,
                pid: Some(std::process::id()),
                root: Some(normalize_path(root)),
            },
        )?;

        let (proceed_tx, proceed_rx) = std_mpsc::channel();
        let shutdown: Arc<Mutex<ShutdownState>> = Arc::default();
        let reader = stream.try_clone()?;
        {
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || read_loop(reader, &proceed_tx, &shutdown));
        }

        Ok(Self {
            attached: Some(Attached {
                writer: Mutex::new(stream),
                proceed: Mutex::new(proceed_rx),
                shutdown,
            }),
        })
    }

    /// A client that is not connected to anything.
    pub fn detached() -> Self {
        Self { attached: None }
    }

    pub fn is_supervised(&self) -> bool {
        self.attached.is_some()
    }

    /// Initialization finished. Blocks until the port may be bound.
    pub fn after_init(&self) -> io::Result<()> {
        let Some(attached) = &self.attached else {
            return Ok(());
        };
        write_message(&mut *attached.writer.lock(), &AppMessage::Initialized)?;
        attached.proceed.lock().recv().map_err(|_| {
            io::Error::new(
                io::ErrorKind::BrokenPipe,
                "supervisor closed the control connection",
            )
        })
    }

    /// Report that listening started, or why it failed.
    pub fn after_listen<E: Display>(&self, result: Result<(), E>) {
        let Some(attached) = &self.attached else {
            return;
        };
        let message = AppMessage::Listening {
            error: result.err().map(|e| e.to_string()),
        };
        // Supervisor gone: nobody to tell.
        let _ = write_message(&mut *attached.writer.lock(), &message);
    }

    /// Run `f` on a background thread when the supervisor asks the
    /// application to stop (or goes away).
    pub fn on_shutdown(&self, f: impl FnOnce() + Send + 'static) {
        let Some(attached) = &self.attached else {
            return;
        };
        let mut state = attached.shutdown.lock();
        if state.requested {
            thread::spawn(f);
        } else {
            state.handler = Some(Box::new(f));
        }
    }
}

impl Drop for Readiness {
    fn drop(&mut self) {
        if let Some(attached) = &self.attached {
            let _ = attached.writer.lock().shutdown(Shutdown::Both);
        }
    }
}

fn read_loop(stream: TcpStream, proceed: &std_mpsc::Sender<()>, shutdown: &Mutex<ShutdownState>) {
    for line in BufReader::new(stream).lines() {
        let Ok(line) = line else { break };
        match parse_message::<SupervisorMessage>(&line) {
            Ok(SupervisorMessage::Proceed) => {
                let _ = proceed.send(());
            }
            Ok(SupervisorMessage::Shutdown) => break,
            Err(_) => {}
        }
    }

    let handler = {
        let mut state = shutdown.lock();
        state.requested = true;
        state.handler.take()
    };
    if let Some(handler) = handler {
        handler();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::time::Duration;

    struct FakeSupervisor {
        reader: BufReader<TcpStream>,
        writer: TcpStream,
    }

    impl FakeSupervisor {
        fn accept(listener: &TcpListener) -> Self {
            let (stream, _) = listener.accept().unwrap();
            Self {
                reader: BufReader::new(stream.try_clone().unwrap()),
                writer: stream,
            }
        }

        fn recv(&mut self) -> AppMessage {
            let mut line = String::new();
            self.reader.read_line(&mut line).unwrap();
            parse_message(&line).unwrap()
        }

        fn send(&mut self, msg: SupervisorMessage) {
            write_message(&mut self.writer, &msg).unwrap();
        }
    }

    #[test]
    fn test_detached_is_noop() {
        let readiness = Readiness::detached();
        assert!(!readiness.is_supervised());
        readiness.after_init().unwrap();
        readiness.after_listen(Ok::<(), &str>(()));
        readiness.on_shutdown(|| panic!("never called"));
    }

    #[test]
    fn test_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let root = tempfile::tempdir().unwrap();

        let supervisor = thread::spawn(move || {
            let mut sv = FakeSupervisor::accept(&listener);
            let hello = sv.recv();
            assert_eq!(sv.recv(), AppMessage::Initialized);
            sv.send(SupervisorMessage::Proceed);
            let listening = sv.recv();
            sv.send(SupervisorMessage::Shutdown);
            (hello, listening)
        });

        let readiness = Readiness::connect_to(addr, 4, root.path()).unwrap();
        assert!(readiness.is_supervised());
        let (done_tx, done_rx) = std_mpsc::channel();
        readiness.on_shutdown(move || done_tx.send(()).unwrap());

        readiness.after_init().unwrap();
        readiness.after_listen(Err("address in use"));
        done_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let (hello, listening) = supervisor.join().unwrap();
        match hello {
            AppMessage::Hello {
                protocol,
                generation,
                pid,
                root: announced,
            } => {
                assert_eq!(protocol, PROTOCOL_VERSION);
                assert_eq!(generation, 4);
                assert_eq!(pid, Some(std::process::id()));
                assert_eq!(announced, Some(normalize_path(root.path())));
            }
            other => panic!("expected hello, got {other:?}"),
        }
        assert_eq!(
            listening,
            AppMessage::Listening {
                error: Some("address in use".into())
            }
        );
    }

    #[test]
    fn test_after_init_fails_when_supervisor_leaves() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let supervisor = thread::spawn(move || {
            let mut sv = FakeSupervisor::accept(&listener);
            sv.recv();
            sv.recv();
            // drop without answering
        });

        let readiness = Readiness::connect_to(addr, 1, Path::new("/")).unwrap();
        assert!(readiness.after_init().is_err());
        supervisor.join().unwrap();
    }

    #[test]
    fn test_shutdown_before_handler_registered() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let supervisor = thread::spawn(move || {
            let mut sv = FakeSupervisor::accept(&listener);
            sv.recv();
            sv.send(SupervisorMessage::Shutdown);
            sv.writer.flush().unwrap();
        });

        let readiness = Readiness::connect_to(addr, 1, Path::new("/")).unwrap();
        supervisor.join().unwrap();
        thread::sleep(Duration::from_millis(50));

        let (done_tx, done_rx) = std_mpsc::channel();
        readiness.on_shutdown(move || done_tx.send(()).unwrap());
        done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    }
}
