//! Per-client connection handling.
//!
//! Each accepted client gets two threads: the connection thread running
//! the RTSP request loop, and an outbound writer thread draining a
//! bounded queue to the socket. Everything written to the client, control
//! responses and interleaved RTP frames alike, goes through the queue, so
//! a frame is never interleaved into the middle of a response.
//!
//! The queue's high-water mark is what the scheduler observes as
//! writability: a full queue marks the consumer unwritable and throttles
//! the whole group, it never blocks the scheduler or drops the client.

use std::collections::VecDeque;
use std::io::{BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use parking_lot::{Condvar, Mutex};

use crate::consumer::{Consumer, next_consumer_id};
use crate::protocol::request::RtspRequest;
use crate::protocol::response::RtspResponse;
use crate::protocol::sdp::generate_sdp;
use crate::scheduler::StreamingScheduler;
use crate::server::ServerConfig;

/// Frames the outbound queue holds before the consumer reads as stalled.
const OUTBOUND_CAPACITY: usize = 64;

const INTERLEAVED_TRANSPORT: &str = "RTP/AVP/TCP;unicast;interleaved=0-1";

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_session_id() -> String {
    format!("{:016X}", SESSION_COUNTER.fetch_add(1, Ordering::SeqCst))
}

struct OutboundInner {
    queue: Mutex<VecDeque<Arc<Vec<u8>>>>,
    cond: Condvar,
    open: AtomicBool,
    stream: TcpStream,
}

/// Bounded outbound queue with its own writer thread.
#[derive(Clone)]
struct Outbound {
    inner: Arc<OutboundInner>,
}

impl Outbound {
    fn start(stream: TcpStream, peer_addr: SocketAddr) -> std::io::Result<Self> {
        let writer_stream = stream.try_clone()?;
        let inner = Arc::new(OutboundInner {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            open: AtomicBool::new(true),
            stream,
        });

        let writer_inner = inner.clone();
        thread::Builder::new()
            .name("rtsp-conn-writer".to_string())
            .spawn(move || {
                let mut stream = writer_stream;
                loop {
                    let frame = {
                        let mut queue = writer_inner.queue.lock();
                        while queue.is_empty() && writer_inner.open.load(Ordering::SeqCst) {
                            writer_inner.cond.wait(&mut queue);
                        }
                        match queue.pop_front() {
                            Some(frame) => frame,
                            // Closed and drained.
                            None => break,
                        }
                    };
                    if let Err(e) = stream.write_all(&frame).and_then(|()| stream.flush()) {
                        tracing::debug!(%peer_addr, error = %e, "outbound write failed");
                        writer_inner.close();
                        break;
                    }
                }
                tracing::trace!(%peer_addr, "outbound writer exited");
            })?;

        Ok(Self { inner })
    }

    /// Queue bytes for delivery. Never blocks; frames for a closed
    /// connection are dropped.
    fn enqueue(&self, frame: Arc<Vec<u8>>) {
        if !self.inner.open.load(Ordering::SeqCst) {
            return;
        }
        self.inner.queue.lock().push_back(frame);
        self.inner.cond.notify_one();
    }

    fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    fn is_writable(&self) -> bool {
        self.is_open() && self.inner.queue.lock().len() < OUTBOUND_CAPACITY
    }

    fn close(&self) {
        self.inner.close();
    }
}

impl OutboundInner {
    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.queue.lock().clear();
            self.cond.notify_all();
            // Unblocks the connection thread's request read as well.
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }
}

/// The scheduler-facing face of one connection in PLAY state.
struct TcpConsumer {
    id: u64,
    peer_addr: SocketAddr,
    outbound: Outbound,
}

impl Consumer for TcpConsumer {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.outbound.is_open()
    }

    fn is_writable(&self) -> bool {
        self.outbound.is_writable()
    }

    fn send(&self, frame: Arc<Vec<u8>>) {
        self.outbound.enqueue(frame);
    }

    fn close(&self) {
        tracing::debug!(peer = %self.peer_addr, "closing viewer connection");
        self.outbound.close();
    }
}

/// A single RTSP client connection with its own lifecycle.
pub(super) struct Connection {
    reader: BufReader<TcpStream>,
    outbound: Outbound,
    peer_addr: SocketAddr,
    scheduler: Arc<StreamingScheduler>,
    config: Arc<ServerConfig>,
    local_ip: String,
    session_id: Option<String>,
    consumer_id: Option<u64>,
    /// Set by a successful PLAY; the attach runs after the response is
    /// queued so no RTP frame precedes the reply on the wire.
    pending_play: bool,
}

impl Connection {
    /// Entry point: set up a connection and run its request loop.
    pub(super) fn handle(
        stream: TcpStream,
        scheduler: Arc<StreamingScheduler>,
        config: Arc<ServerConfig>,
        running: Arc<AtomicBool>,
    ) {
        let peer_addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(_) => return,
        };
        let local_ip = match &config.public_host {
            Some(host) => host.clone(),
            None => match stream.local_addr() {
                Ok(addr) => addr.ip().to_string(),
                Err(_) => return,
            },
        };

        tracing::info!(%peer_addr, "client connected");

        let reader_stream = match stream.try_clone() {
            Ok(s) => s,
            Err(_) => return,
        };
        let outbound = match Outbound::start(stream, peer_addr) {
            Ok(outbound) => outbound,
            Err(_) => return,
        };

        let mut conn = Connection {
            reader: BufReader::new(reader_stream),
            outbound,
            peer_addr,
            scheduler,
            config,
            local_ip,
            session_id: None,
            consumer_id: None,
            pending_play: false,
        };

        let reason = conn.run(&running);
        conn.cleanup();

        tracing::info!(%peer_addr, reason, "client disconnected");
    }

    /// RTSP request/response loop. Returns the reason for exiting.
    fn run(&mut self, running: &Arc<AtomicBool>) -> &'static str {
        while running.load(Ordering::SeqCst) {
            let request = match RtspRequest::read_from(&mut self.reader) {
                Ok(Some(request)) => request,
                Ok(None) => return "connection closed by client",
                Err(crate::error::RelayError::Io(_)) => return "read error",
                Err(e) => {
                    tracing::warn!(peer = %self.peer_addr, error = %e, "parse error");
                    continue;
                }
            };

            tracing::debug!(
                peer = %self.peer_addr,
                method = %request.method,
                uri = %request.uri,
                "request"
            );

            let response = self.dispatch(&request);

            tracing::debug!(peer = %self.peer_addr, status = response.status_code, "response");

            if !self.outbound.is_open() {
                return "write error";
            }
            self.outbound
                .enqueue(Arc::new(response.serialize().into_bytes()));

            if self.pending_play {
                self.pending_play = false;
                if let Err(reason) = self.start_playing() {
                    return reason;
                }
            }
        }
        "server shutting down"
    }

    fn dispatch(&mut self, request: &RtspRequest) -> RtspResponse {
        let Some(cseq) = request.cseq().map(|c| c.to_string()) else {
            return RtspResponse::bad_request();
        };

        let response = match request.method.as_str() {
            "OPTIONS" => RtspResponse::ok().add_header(
                "Public",
                "OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN, GET_PARAMETER, SET_PARAMETER",
            ),
            "DESCRIBE" => self.handle_describe(request),
            "SETUP" => self.handle_setup(request),
            "PLAY" => self.handle_play(request),
            "TEARDOWN" => self.handle_teardown(request),
            "GET_PARAMETER" | "SET_PARAMETER" => self.handle_parameter(request),
            method => {
                tracing::warn!(peer = %self.peer_addr, method, "unsupported method");
                RtspResponse::method_not_allowed()
            }
        };

        response.add_header("CSeq", &cseq)
    }

    fn handle_describe(&self, request: &RtspRequest) -> RtspResponse {
        let description = match self.scheduler.describe() {
            Ok(description) => description,
            Err(e) => {
                tracing::error!(peer = %self.peer_addr, error = %e, "describe failed");
                return RtspResponse::new(500, "Internal Server Error");
            }
        };
        let sdp = generate_sdp(
            &description,
            &self.local_ip,
            &self.config.sdp_session_id,
            &self.config.sdp_session_version,
            &self.config.sdp_username,
            &self.config.sdp_session_name,
        );
        RtspResponse::ok()
            .add_header("Content-Base", &format!("{}/", request.uri.trim_end_matches('/')))
            .add_header("Content-Type", "application/sdp")
            .with_body(sdp)
    }

    fn handle_setup(&mut self, request: &RtspRequest) -> RtspResponse {
        let transport = request.get_header("Transport").unwrap_or("");
        if !transport.contains("RTP/AVP/TCP") || !transport.contains("interleaved") {
            tracing::warn!(peer = %self.peer_addr, transport, "unsupported transport");
            return RtspResponse::unsupported_transport();
        }

        let session_id = next_session_id();
        tracing::info!(peer = %self.peer_addr, session_id, "session created");
        let session_header = format!(
            "{};timeout={}",
            session_id, self.config.session_timeout_secs
        );
        self.session_id = Some(session_id);

        RtspResponse::ok()
            .add_header("Transport", INTERLEAVED_TRANSPORT)
            .add_header("Session", &session_header)
    }

    fn handle_play(&mut self, request: &RtspRequest) -> RtspResponse {
        let Some(session_id) = self.matching_session(request) else {
            return RtspResponse::session_not_found();
        };

        self.pending_play = self.consumer_id.is_none();
        tracing::info!(peer = %self.peer_addr, session_id, "viewer playing");

        RtspResponse::ok()
            .add_header("Session", &session_id)
            .add_header("Range", "npt=0.000-")
    }

    /// Attach this connection to the scheduler, after the PLAY reply has
    /// been queued.
    fn start_playing(&mut self) -> std::result::Result<(), &'static str> {
        let consumer = Arc::new(TcpConsumer {
            id: next_consumer_id(),
            peer_addr: self.peer_addr,
            outbound: self.outbound.clone(),
        });
        let id = consumer.id;
        if let Err(e) = self.scheduler.attach(consumer) {
            tracing::error!(peer = %self.peer_addr, error = %e, "failed to start stream");
            return Err("stream start failed");
        }
        self.consumer_id = Some(id);
        Ok(())
    }

    fn handle_teardown(&mut self, request: &RtspRequest) -> RtspResponse {
        let Some(session_id) = self.matching_session(request) else {
            return RtspResponse::session_not_found();
        };

        if let Some(consumer_id) = self.consumer_id.take() {
            self.scheduler.detach(consumer_id);
        }
        self.session_id = None;
        tracing::info!(peer = %self.peer_addr, session_id, "session torn down");

        RtspResponse::ok().add_header("Session", &session_id)
    }

    fn handle_parameter(&self, request: &RtspRequest) -> RtspResponse {
        let Some(session_id) = self.matching_session(request) else {
            return RtspResponse::session_not_found();
        };
        RtspResponse::ok().add_header("Session", &session_id)
    }

    /// The request's session id, when it names this connection's session.
    fn matching_session(&self, request: &RtspRequest) -> Option<String> {
        let current = self.session_id.as_deref()?;
        let requested = request.session_id()?;
        (requested == current).then(|| current.to_string())
    }

    /// Detach from the scheduler on the way out. Covers client EOF, read
    /// and write errors, and server stop; a consumer that was already
    /// detached (TEARDOWN, group teardown) makes this a no-op.
    fn cleanup(&mut self) {
        if let Some(consumer_id) = self.consumer_id.take() {
            self.scheduler.detach(consumer_id);
        }
        self.outbound.close();
    }
}
