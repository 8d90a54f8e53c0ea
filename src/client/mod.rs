//! Client-side RTSP control session.
//!
//! [`RtspControlSession`] drives the control connection to an RTSP server:
//! it issues DESCRIBE/SETUP/PLAY/GET_PARAMETER/SET_PARAMETER requests,
//! correlates replies by CSeq, and keeps a PLAYing session alive with
//! periodic GET_PARAMETER pings.
//!
//! Every operation is asynchronous in the callback sense: it allocates the
//! next CSeq, registers the request in the pending table and returns as
//! soon as the bytes are written; the typed result (or error) arrives later
//! through the callback, invoked from the reply-reader thread. Each pending
//! request resolves exactly once: on its matching reply, on its optional
//! deadline, or on connection loss.

pub mod reply;

pub use reply::{ReplyKind, RtspReply};

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{RelayError, Result};
use crate::protocol::request::RtspRequest;
use crate::protocol::response::RtspResponse;
use crate::timer::{TickTimer, TimerHandle};

/// Keep-alive period; safely below the usual 60 s session timeout.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(55);

/// Upper bound on the timeout sweep period.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Callback receiving the typed result of one request.
pub type ReplyCallback = Box<dyn FnOnce(Result<RtspReply>) + Send + 'static>;

/// Connection lifecycle notifications.
///
/// `on_disconnected` fires exactly once per connection, before the pending
/// requests are resolved through their error paths, regardless of whether
/// the peer closed the connection or [`RtspControlSession::disconnect`]
/// did.
pub trait SessionObserver: Send + Sync {
    fn on_connected(&self);
    fn on_disconnected(&self);
}

/// Options for [`RtspControlSession::connect`].
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// When set, requests unanswered for this long resolve to
    /// [`RelayError::RequestTimeout`]. `None` waits indefinitely
    /// (connection loss still resolves everything).
    pub request_timeout: Option<Duration>,
}

struct PendingRequest {
    kind: ReplyKind,
    callback: ReplyCallback,
    issued_at: Instant,
}

struct ClientShared {
    url: String,
    observer: Arc<dyn SessionObserver>,
    /// Writer half; the reader thread owns its own clone of the stream.
    stream: Mutex<Option<TcpStream>>,
    pending: Mutex<HashMap<u32, PendingRequest>>,
    next_cseq: AtomicU32,
    connected: AtomicBool,
    keepalive: Mutex<Option<TimerHandle>>,
    sweeper: Mutex<Option<TimerHandle>>,
}

impl ClientShared {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn allocate_cseq(&self) -> u32 {
        self.next_cseq.fetch_add(1, Ordering::SeqCst)
    }

    /// Register the pending entry, then write. Registration happens first
    /// so a reply arriving before the write returns still finds its entry.
    fn send(
        &self,
        cseq: u32,
        kind: ReplyKind,
        request: RtspRequest,
        callback: ReplyCallback,
    ) -> Result<()> {
        self.pending.lock().insert(
            cseq,
            PendingRequest {
                kind,
                callback,
                issued_at: Instant::now(),
            },
        );
        tracing::debug!(cseq, method = %request.method, "sending request");
        if let Err(e) = self.write_all(request.serialize().as_bytes()) {
            self.pending.lock().remove(&cseq);
            tracing::error!(cseq, error = %e, "request write failed, closing connection");
            self.force_close();
            return Err(e);
        }
        Ok(())
    }

    fn write_all(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.stream.lock();
        let stream = guard.as_mut().ok_or(RelayError::ConnectionClosed)?;
        stream.write_all(bytes)?;
        stream.flush()?;
        Ok(())
    }

    /// Resolve one reply: remove the matching pending entry and run its
    /// decoder or error path. Replies with an unknown CSeq are ignored;
    /// they are expected after a timeout sweep already resolved the entry.
    fn handle_reply(&self, response: RtspResponse) {
        let Some(cseq) = response.cseq() else {
            tracing::warn!("discarding reply without CSeq");
            return;
        };
        let Some(entry) = self.pending.lock().remove(&cseq) else {
            tracing::debug!(cseq, "ignoring reply with no pending request");
            return;
        };

        if response.is_ok() {
            (entry.callback)(reply::decode(entry.kind, &response));
        } else {
            tracing::warn!(
                cseq,
                code = response.status_code,
                reason = %response.status_text,
                "request rejected by server"
            );
            (entry.callback)(Err(RelayError::Status {
                code: response.status_code,
                reason: response.status_text.clone(),
            }));
        }
    }

    /// One-shot connection teardown: notify the observer, then fail every
    /// pending request, then release the socket. Both the reader thread
    /// and explicit disconnect funnel through here; the `connected` swap
    /// makes it run at most once.
    fn handle_disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!(url = %self.url, "control connection closed");

        if let Some(handle) = self.keepalive.lock().take() {
            handle.cancel();
        }
        if let Some(handle) = self.sweeper.lock().take() {
            handle.cancel();
        }

        self.observer.on_disconnected();

        let orphaned: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in orphaned {
            (entry.callback)(Err(RelayError::ConnectionClosed));
        }

        *self.stream.lock() = None;
    }

    /// Shut the socket down and tear the session state down immediately,
    /// without waiting for the reader thread to notice EOF.
    fn force_close(&self) {
        if let Some(stream) = self.stream.lock().as_ref() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.handle_disconnect();
    }

    /// Keep-alive ping: GET_PARAMETER with a no-op callback.
    fn send_keepalive(&self, session_id: &str) -> Result<()> {
        let cseq = self.allocate_cseq();
        let request = RtspRequest::new("GET_PARAMETER", &self.url)
            .add_header("CSeq", &cseq.to_string())
            .add_header("Session", session_id);
        self.send(cseq, ReplyKind::Parameter, request, Box::new(|_| {}))
    }

    /// Fail every pending request older than `timeout`. Callbacks run
    /// outside the table lock.
    fn sweep_expired(&self, timeout: Duration) {
        let now = Instant::now();
        let expired: Vec<(u32, PendingRequest)> = {
            let mut pending = self.pending.lock();
            let cseqs: Vec<u32> = pending
                .iter()
                .filter(|(_, entry)| now.duration_since(entry.issued_at) >= timeout)
                .map(|(cseq, _)| *cseq)
                .collect();
            cseqs
                .into_iter()
                .filter_map(|cseq| pending.remove(&cseq).map(|entry| (cseq, entry)))
                .collect()
        };
        for (cseq, entry) in expired {
            tracing::warn!(cseq, "request deadline expired");
            (entry.callback)(Err(RelayError::RequestTimeout));
        }
    }
}

/// Consume one interleaved data frame: `$`, channel byte, u16 length,
/// then that many payload bytes.
fn skip_interleaved_frame<R: BufRead>(reader: &mut R) -> std::io::Result<()> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header)?;
    let len = usize::from(u16::from_be_bytes([header[2], header[3]]));
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(())
}

/// Parse `rtsp://host[:port]/...` into a socket address pair.
fn parse_rtsp_url(url: &str) -> Result<(String, u16)> {
    let rest = url
        .strip_prefix("rtsp://")
        .ok_or_else(|| RelayError::InvalidUrl(url.to_string()))?;
    let authority = rest.split('/').next().unwrap_or(rest);
    if authority.is_empty() {
        return Err(RelayError::InvalidUrl(url.to_string()));
    }
    match authority.split_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| RelayError::InvalidUrl(url.to_string()))?;
            Ok((host.to_string(), port))
        }
        None => Ok((authority.to_string(), 554)),
    }
}

/// Control-channel session against one RTSP server.
pub struct RtspControlSession {
    shared: Arc<ClientShared>,
}

impl RtspControlSession {
    /// Connect to the server named by `url` and start the reply reader.
    ///
    /// `on_connected` is reported before this returns. With a
    /// `request_timeout` configured, a sweep timer resolves overdue
    /// requests to [`RelayError::RequestTimeout`].
    pub fn connect(
        url: &str,
        observer: Arc<dyn SessionObserver>,
        options: ConnectOptions,
    ) -> Result<Self> {
        let (host, port) = parse_rtsp_url(url)?;
        let stream = TcpStream::connect((host.as_str(), port))?;
        stream.set_nodelay(true)?;
        let reader_stream = stream.try_clone()?;

        let shared = Arc::new(ClientShared {
            url: url.to_string(),
            observer,
            stream: Mutex::new(Some(stream)),
            pending: Mutex::new(HashMap::new()),
            next_cseq: AtomicU32::new(1),
            connected: AtomicBool::new(true),
            keepalive: Mutex::new(None),
            sweeper: Mutex::new(None),
        });
        tracing::info!(url, "control connection established");
        shared.observer.on_connected();

        let reader_shared = shared.clone();
        thread::Builder::new()
            .name("rtsp-client-reader".to_string())
            .spawn(move || {
                let mut reader = BufReader::new(reader_stream);
                loop {
                    // After PLAY the server interleaves RTP data frames on
                    // this connection (RFC 2326 §10.12); skip them, this
                    // session only speaks the control protocol.
                    match reader.fill_buf() {
                        Ok([]) => break,
                        Ok([b'$', ..]) => {
                            if skip_interleaved_frame(&mut reader).is_err() {
                                break;
                            }
                            continue;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(error = %e, "control read failed");
                            break;
                        }
                    }
                    match RtspResponse::read_from(&mut reader) {
                        Ok(Some(response)) => reader_shared.handle_reply(response),
                        Ok(None) => break,
                        Err(e) => {
                            tracing::error!(error = %e, "reply read failed");
                            break;
                        }
                    }
                }
                reader_shared.handle_disconnect();
            })?;

        if let Some(timeout) = options.request_timeout {
            let sweep_shared = shared.clone();
            let interval = timeout.min(MAX_SWEEP_INTERVAL);
            let handle = TickTimer::spawn("request-sweep", interval, move || {
                if !sweep_shared.is_connected() {
                    return None;
                }
                sweep_shared.sweep_expired(timeout);
                Some(interval)
            });
            *shared.sweeper.lock() = Some(handle);
        }

        Ok(Self { shared })
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// DESCRIBE: the reply decodes to the content base and the parsed SDP.
    pub fn describe<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(Result<RtspReply>) + Send + 'static,
    {
        let cseq = self.shared.allocate_cseq();
        let request = RtspRequest::new("DESCRIBE", &self.shared.url)
            .add_header("CSeq", &cseq.to_string())
            .add_header("Accept", "application/sdp");
        self.shared
            .send(cseq, ReplyKind::Describe, request, Box::new(callback))
    }

    /// SETUP for interleaved TCP transport on channel pair 0-1. The reply
    /// decodes to the server-assigned session id.
    ///
    /// `control_url` is the track control from the SDP; relative controls
    /// are joined onto the session URL.
    pub fn setup<F>(&self, control_url: &str, callback: F) -> Result<()>
    where
        F: FnOnce(Result<RtspReply>) + Send + 'static,
    {
        let uri = if control_url.starts_with("rtsp://") {
            control_url.to_string()
        } else {
            format!(
                "{}/{}",
                self.shared.url.trim_end_matches('/'),
                control_url
            )
        };
        let cseq = self.shared.allocate_cseq();
        let request = RtspRequest::new("SETUP", &uri)
            .add_header("CSeq", &cseq.to_string())
            .add_header("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1");
        self.shared
            .send(cseq, ReplyKind::Setup, request, Box::new(callback))
    }

    /// PLAY the given session. A successful send also arms the keep-alive
    /// chain: GET_PARAMETER every 55 s until the connection closes.
    pub fn play<F>(&self, session_id: &str, callback: F) -> Result<()>
    where
        F: FnOnce(Result<RtspReply>) + Send + 'static,
    {
        let cseq = self.shared.allocate_cseq();
        let request = RtspRequest::new("PLAY", &self.shared.url)
            .add_header("CSeq", &cseq.to_string())
            .add_header("Session", session_id)
            .add_header("Range", "npt=0.000-");
        self.shared
            .send(cseq, ReplyKind::Play, request, Box::new(callback))?;
        self.arm_keepalive(session_id);
        Ok(())
    }

    /// GET_PARAMETER, the protocol's keep-alive ping.
    pub fn get_parameter<F>(&self, session_id: &str, callback: F) -> Result<()>
    where
        F: FnOnce(Result<RtspReply>) + Send + 'static,
    {
        let cseq = self.shared.allocate_cseq();
        let request = RtspRequest::new("GET_PARAMETER", &self.shared.url)
            .add_header("CSeq", &cseq.to_string())
            .add_header("Session", session_id);
        self.shared
            .send(cseq, ReplyKind::Parameter, request, Box::new(callback))
    }

    /// SET_PARAMETER with `name: value` parameter lines in the body.
    pub fn set_parameter<F>(
        &self,
        session_id: &str,
        parameters: &[(&str, &str)],
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<RtspReply>) + Send + 'static,
    {
        let mut body = String::new();
        for (name, value) in parameters {
            body.push_str(&format!("{}: {}\r\n", name, value));
        }
        let cseq = self.shared.allocate_cseq();
        let request = RtspRequest::new("SET_PARAMETER", &self.shared.url)
            .add_header("CSeq", &cseq.to_string())
            .add_header("Session", session_id)
            .add_header("Content-Type", "text/parameters")
            .with_body(body);
        self.shared
            .send(cseq, ReplyKind::Parameter, request, Box::new(callback))
    }

    /// Close the connection. Pending requests resolve to
    /// [`RelayError::ConnectionClosed`] after the observer's
    /// `on_disconnected`.
    pub fn disconnect(&self) {
        self.shared.force_close();
    }

    fn arm_keepalive(&self, session_id: &str) {
        let mut guard = self.shared.keepalive.lock();
        if guard.is_some() {
            return;
        }
        let shared = self.shared.clone();
        let session_id = session_id.to_string();
        let handle = TickTimer::spawn("keepalive", KEEPALIVE_INTERVAL, move || {
            if !shared.is_connected() {
                return None;
            }
            match shared.send_keepalive(&session_id) {
                Ok(()) => Some(KEEPALIVE_INTERVAL),
                Err(e) => {
                    tracing::debug!(error = %e, "keep-alive send failed, stopping chain");
                    None
                }
            }
        });
        *guard = Some(handle);
    }
}
