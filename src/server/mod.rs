//! RTSP server shim.
//!
//! Serves one media stream over interleaved TCP: a non-blocking accept
//! loop hands each client to its own connection thread
//! ([`conn::Connection`]), which dispatches RTSP requests and, once the
//! client PLAYs, registers a [`crate::consumer::Consumer`] backed by the
//! connection's bounded outbound queue with the shared
//! [`StreamingScheduler`].

mod conn;

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{RelayError, Result};
use crate::scheduler::StreamingScheduler;

/// Server-level configuration used by the request dispatch.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Public host advertised in SDP `o=` and `c=` lines.
    /// When `None`, the listening address is used.
    pub public_host: Option<String>,
    /// SDP origin username field (`o=<username> ...`).
    pub sdp_username: String,
    /// SDP origin session id field (`o=... <session-id> ...`).
    pub sdp_session_id: String,
    /// SDP origin session version field (`o=... ... <session-version> ...`).
    pub sdp_session_version: String,
    /// SDP session name (`s=`).
    pub sdp_session_name: String,
    /// Session timeout advertised in the SETUP reply (`;timeout=`).
    pub session_timeout_secs: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            public_host: None,
            sdp_username: "-".to_string(),
            sdp_session_id: "0".to_string(),
            sdp_session_version: "0".to_string(),
            sdp_session_name: "Stream".to_string(),
            session_timeout_secs: 60,
        }
    }
}

/// High-level RTSP server orchestrator.
///
/// Owns the scheduler for its one stream and the accept loop; connection
/// handling lives in [`conn`].
pub struct Server {
    scheduler: Arc<StreamingScheduler>,
    running: Arc<AtomicBool>,
    bind_addr: String,
    config: Arc<ServerConfig>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    pub fn new(bind_addr: &str, scheduler: Arc<StreamingScheduler>) -> Self {
        Self::with_config(bind_addr, scheduler, ServerConfig::default())
    }

    pub fn with_config(
        bind_addr: &str,
        scheduler: Arc<StreamingScheduler>,
        config: ServerConfig,
    ) -> Self {
        Self {
            scheduler,
            running: Arc::new(AtomicBool::new(false)),
            bind_addr: bind_addr.to_string(),
            config: Arc::new(config),
            local_addr: Mutex::new(None),
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(RelayError::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.bind_addr)?;
        listener.set_nonblocking(true)?;
        *self.local_addr.lock() = Some(listener.local_addr()?);

        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let scheduler = self.scheduler.clone();
        let config = self.config.clone();

        tracing::info!(addr = %self.bind_addr, "RTSP server listening");

        thread::Builder::new()
            .name("rtsp-accept".to_string())
            .spawn(move || {
                accept_loop(listener, scheduler, config, running);
            })?;

        Ok(())
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("server stopping");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Actual bound address, once started. Useful when binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.local_addr.lock().ok_or(RelayError::NotStarted)
    }

    pub fn scheduler(&self) -> Arc<StreamingScheduler> {
        self.scheduler.clone()
    }
}

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`Server::stop`] can terminate it promptly.
fn accept_loop(
    listener: TcpListener,
    scheduler: Arc<StreamingScheduler>,
    config: Arc<ServerConfig>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let s = scheduler.clone();
                let c = config.clone();
                let r = running.clone();
                thread::spawn(move || {
                    conn::Connection::handle(stream, s, c, r);
                });
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}
