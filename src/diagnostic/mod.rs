//! Diagnostic server: the error page shown on the application's port while
//! the application is down.
//!
//! Every request, whatever its method or path, gets the same 500 page with
//! the latest error. Stopping does not drain clients; the listener is closed
//! and the port is probed until it can be bound again, so the application
//! can take it over right after [`DiagnosticServer::stop`] returns.

mod page;

pub use page::{ErrorReport, render};

use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwap;
use tiny_http::{Method, Request, Server};

use crate::{debug, log};

/// Release probe: attempts and interval.
const RELEASE_PROBES: u32 = 50;
const RELEASE_INTERVAL: Duration = Duration::from_millis(10);

struct Running {
    server: Arc<Server>,
    thread: JoinHandle<()>,
    addr: SocketAddr,
}

/// Error page listener, bound only while the application is down.
pub struct DiagnosticServer {
    addr: SocketAddr,
    report: Arc<ArcSwap<ErrorReport>>,
    running: Option<Running>,
}

impl DiagnosticServer {
    /// Server for `addr`; nothing is bound until [`start`](Self::start).
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            report: Arc::new(ArcSwap::from_pointee(ErrorReport::default())),
            running: None,
        }
    }

    pub fn is_listening(&self) -> bool {
        self.running.is_some()
    }

    /// Address actually bound, while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.addr)
    }

    /// Bind and serve `report`. Already listening: only the content changes.
    pub fn start(&mut self, report: ErrorReport) -> io::Result<()> {
        self.update(report);
        if self.running.is_some() {
            return Ok(());
        }

        let server = Server::http(self.addr).map_err(io::Error::other)?;
        let addr = server
            .server_addr()
            .to_ip()
            .unwrap_or(self.addr);
        let server = Arc::new(server);

        let thread = {
            let server = Arc::clone(&server);
            let report = Arc::clone(&self.report);
            thread::spawn(move || {
                for request in server.incoming_requests() {
                    if let Err(e) = respond(request, &report.load()) {
                        debug!("diagnostic"; "response error: {}", e);
                    }
                }
            })
        };

        log!("diagnostic"; "serving error page on http://{}", addr);
        self.running = Some(Running {
            server,
            thread,
            addr,
        });
        Ok(())
    }

    /// Replace the page content without re-binding.
    pub fn update(&self, report: ErrorReport) {
        self.report.store(Arc::new(report));
    }

    /// Close the listener and wait until the port is free. Idempotent.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        running.server.unblock();
        if running.thread.join().is_err() {
            debug!("diagnostic"; "request thread panicked");
        }
        drop(running.server);

        if running.addr.port() != 0 && !wait_released(running.addr) {
            log!("warning"; "port {} still busy after stopping the error page", running.addr.port());
        }
        debug!("diagnostic"; "stopped");
    }
}

impl Drop for DiagnosticServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Probe-bind `addr` until it succeeds.
fn wait_released(addr: SocketAddr) -> bool {
    for _ in 0..RELEASE_PROBES {
        if TcpListener::bind(addr).is_ok() {
            return true;
        }
        thread::sleep(RELEASE_INTERVAL);
    }
    false
}

/// Write the page by hand: tiny_http drops a `Connection` header set on a
/// `Response`, and no client may keep its socket across a stop.
fn respond(request: Request, report: &ErrorReport) -> io::Result<()> {
    let body = render(report);
    let head_only = *request.method() == Method::Head;

    let mut writer = request.into_writer();
    write!(
        writer,
        "HTTP/1.1 500 Internal Server Error\r\n\
         Content-Type: text/html; charset=utf-8\r\n\
         Cache-Control: no-store\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n",
        body.len()
    )?;
    if !head_only {
        writer.write_all(body.as_bytes())?;
    }
    writer.flush()
}
