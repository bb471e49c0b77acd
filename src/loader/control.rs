//! Control listener: accepts connections from spawned applications and
//! relays their messages into the current instance's [`LifecycleHooks`].
//!
//! Only one instance is registered at a time. Connections announcing any
//! other generation are dropped.

use std::io::{BufRead, BufReader};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::{LifecycleHooks, Manifest};
use crate::protocol::{AppMessage, SupervisorMessage, parse_message, write_message};

/// Writer half of an attached application, shared with its handle.
#[derive(Debug, Clone, Default)]
pub struct ControlLink {
    stream: Arc<Mutex<Option<TcpStream>>>,
    announced: Arc<AtomicBool>,
}

impl ControlLink {
    /// Send a message to the application. Returns `false` when it is not
    /// connected (never was, or closed the connection).
    pub fn send(&self, message: SupervisorMessage) -> bool {
        let mut guard = self.stream.lock();
        let Some(stream) = guard.as_mut() else {
            return false;
        };
        if write_message(stream, &message).is_err() {
            *guard = None;
            return false;
        }
        true
    }

    #[cfg(test)]
    fn is_connected(&self) -> bool {
        self.stream.lock().is_some()
    }

    /// Whether the application ever said hello.
    pub fn announced(&self) -> bool {
        self.announced.load(Ordering::SeqCst)
    }

    fn attach(&self, stream: TcpStream) {
        self.announced.store(true, Ordering::SeqCst);
        *self.stream.lock() = Some(stream);
    }

    fn detach(&self) {
        *self.stream.lock() = None;
    }
}

struct Registration {
    hooks: LifecycleHooks,
    link: ControlLink,
}

/// Loopback listener for application control connections.
pub struct ControlServer {
    addr: SocketAddr,
    current: Arc<Mutex<Option<Registration>>>,
}

impl ControlServer {
    /// Bind on an ephemeral loopback port and start accepting.
    pub fn bind() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let current: Arc<Mutex<Option<Registration>>> = Arc::default();

        let registry = Arc::clone(&current);
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let registry = Arc::clone(&registry);
                        std::thread::spawn(move || serve_connection(stream, &registry));
                    }
                    Err(e) => crate::debug!("control"; "accept error: {}", e),
                }
            }
        });

        crate::debug!("control"; "listening on {}", addr);
        Ok(Self { addr, current })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Make `hooks` the only instance allowed to connect.
    pub fn register(&self, hooks: LifecycleHooks) -> ControlLink {
        let link = ControlLink::default();
        *self.current.lock() = Some(Registration {
            hooks,
            link: link.clone(),
        });
        link
    }
}

/// Hooks and link of the registered instance, if it is `generation`.
fn lookup(
    registry: &Mutex<Option<Registration>>,
    generation: u64,
) -> Option<(LifecycleHooks, ControlLink)> {
    let guard = registry.lock();
    let reg = guard.as_ref().filter(|r| r.hooks.generation() == generation)?;
    Some((reg.hooks.clone(), reg.link.clone()))
}

fn serve_connection(stream: TcpStream, registry: &Mutex<Option<Registration>>) {
    let Ok(writer) = stream.try_clone() else {
        return;
    };
    let mut lines = BufReader::new(stream).lines();

    let first = match lines.next() {
        Some(Ok(line)) => line,
        _ => return,
    };

    let (hooks, link) = match parse_message::<AppMessage>(&first) {
        Ok(AppMessage::Hello {
            protocol,
            generation,
            pid,
            root,
        }) => {
            let Some((hooks, link)) = lookup(registry, generation) else {
                crate::debug!("control"; "dropping connection from stale generation {}", generation);
                return;
            };
            link.attach(writer);
            hooks.announce(Manifest {
                protocol,
                pid,
                root,
            });
            (hooks, link)
        }
        // Anyone on the machine can reach the port; without a hello nothing
        // ties the connection to an instance.
        Ok(other) => {
            crate::debug!("control"; "dropping connection: expected hello, got {:?}", other);
            return;
        }
        Err(e) => {
            crate::debug!("control"; "dropping connection: {}", e);
            return;
        }
    };

    for line in lines {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        match parse_message::<AppMessage>(&line) {
            Ok(AppMessage::Initialized) => {
                // Blocks this connection only; the supervisor answers once the
                // diagnostic page released the port.
                if hooks.after_init().blocking_recv().is_ok() {
                    link.send(SupervisorMessage::Proceed);
                }
            }
            Ok(AppMessage::Listening { error }) => {
                hooks.after_listen(error.map_or(Ok(()), Err));
            }
            Ok(AppMessage::Hello { .. }) => {
                crate::debug!("control"; "ignoring repeated hello");
            }
            Err(e) => crate::debug!("control"; "{}", e),
        }
    }

    link.detach();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PROTOCOL_VERSION;
    use crate::supervisor::{AppSignal, SupervisorMsg};
    use std::io::Write;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn recv(rx: &mut mpsc::UnboundedReceiver<SupervisorMsg>) -> AppSignal {
        for _ in 0..200 {
            if let Ok(SupervisorMsg::App { signal, .. }) = rx.try_recv() {
                return signal;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("no signal received");
    }

    fn hello(generation: u64) -> String {
        format!(
            "{{\"type\":\"hello\",\"protocol\":{PROTOCOL_VERSION},\"generation\":{generation},\"root\":\"/p\"}}\n"
        )
    }

    #[test]
    fn test_handshake_relays_signals() {
        let server = ControlServer::bind().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = server.register(LifecycleHooks::new(1, tx));

        let mut app = TcpStream::connect(server.addr()).unwrap();
        app.write_all(hello(1).as_bytes()).unwrap();

        match recv(&mut rx) {
            AppSignal::Announce(manifest) => {
                assert_eq!(manifest.protocol, PROTOCOL_VERSION);
                assert_eq!(manifest.root, Some("/p".into()));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(link.announced());

        app.write_all(b"{\"type\":\"initialized\"}\n").unwrap();
        let AppSignal::Initialized(ack) = recv(&mut rx) else {
            panic!("expected Initialized");
        };
        ack.send(()).unwrap();

        let mut reader = BufReader::new(app.try_clone().unwrap());
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "{\"type\":\"proceed\"}\n");

        app.write_all(b"{\"type\":\"listening\",\"error\":\"in use\"}\n")
            .unwrap();
        assert!(matches!(
            recv(&mut rx),
            AppSignal::Listening(Err(e)) if e == "in use"
        ));

        assert!(link.send(SupervisorMessage::Shutdown));
        line.clear();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "{\"type\":\"shutdown\"}\n");
    }

    #[test]
    fn test_stale_generation_dropped() {
        let server = ControlServer::bind().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = server.register(LifecycleHooks::new(2, tx));

        let mut app = TcpStream::connect(server.addr()).unwrap();
        app.write_all(hello(1).as_bytes()).unwrap();

        std::thread::sleep(Duration::from_millis(100));
        assert!(rx.try_recv().is_err());
        assert!(!link.announced());
        assert!(!link.is_connected());
    }

    #[test]
    fn test_connection_without_hello_dropped() {
        let server = ControlServer::bind().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = server.register(LifecycleHooks::new(1, tx));

        let mut stranger = TcpStream::connect(server.addr()).unwrap();
        stranger.write_all(b"GET / HTTP/1.1\r\n").unwrap();
        stranger
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut rest = String::new();
        match BufReader::new(stranger).read_line(&mut rest) {
            Ok(n) => assert_eq!(n, 0),
            Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
        }

        assert!(rx.try_recv().is_err());
        assert!(!link.announced());

        // the registered instance can still connect afterwards
        let mut app = TcpStream::connect(server.addr()).unwrap();
        app.write_all(hello(1).as_bytes()).unwrap();
        assert!(matches!(recv(&mut rx), AppSignal::Announce(_)));
    }

    #[test]
    fn test_link_not_connected_send_fails() {
        let link = ControlLink::default();
        assert!(!link.send(SupervisorMessage::Shutdown));
    }
}
