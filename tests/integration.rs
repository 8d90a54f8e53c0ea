//! End-to-end tests: a real server on a localhost socket, exercised by a
//! raw RTSP viewer and by the crate's own control session.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use relay::protocol::request::RtspRequest;
use relay::protocol::response::RtspResponse;
use relay::{
    BatchLimits, ConnectOptions, MemorySourceFactory, RtspControlSession, RtspReply, Server,
    SessionObserver, StreamStats, StreamingScheduler,
};

struct NullObserver;

impl SessionObserver for NullObserver {
    fn on_connected(&self) {}
    fn on_disconnected(&self) {}
}

fn start_server(frames: usize, looping: bool) -> (Server, SocketAddr) {
    let factory = MemorySourceFactory::synthetic(frames, 25, 400);
    let scheduler = Arc::new(StreamingScheduler::new(
        Box::new(factory),
        BatchLimits::default(),
        looping,
        Arc::new(StreamStats::new()),
    ));
    let mut server = Server::new("127.0.0.1:0", scheduler);
    server.start().unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

fn send(writer: &mut TcpStream, request: RtspRequest) {
    writer.write_all(request.serialize().as_bytes()).unwrap();
    writer.flush().unwrap();
}

/// Read the next RTSP response, skipping any interleaved data frames that
/// arrive ahead of it.
fn read_response(reader: &mut BufReader<TcpStream>) -> RtspResponse {
    loop {
        let starts_with_frame = matches!(reader.fill_buf().unwrap(), [b'$', ..]);
        if starts_with_frame {
            skip_frame(reader);
            continue;
        }
        return RtspResponse::read_from(reader).unwrap().unwrap();
    }
}

fn skip_frame(reader: &mut BufReader<TcpStream>) {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).unwrap();
    let len = usize::from(u16::from_be_bytes([header[2], header[3]]));
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).unwrap();
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    check()
}

#[test]
fn full_viewer_handshake_delivers_interleaved_rtp() {
    let (mut server, addr) = start_server(100, true);
    let url = format!("rtsp://{addr}/stream");

    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);

    send(&mut writer, RtspRequest::new("OPTIONS", &url).add_header("CSeq", "1"));
    let response = read_response(&mut reader);
    assert_eq!(response.status_code, 200);
    assert_eq!(response.cseq(), Some(1));
    assert!(response.get_header("Public").unwrap().contains("DESCRIBE"));

    send(
        &mut writer,
        RtspRequest::new("DESCRIBE", &url)
            .add_header("CSeq", "2")
            .add_header("Accept", "application/sdp"),
    );
    let response = read_response(&mut reader);
    assert_eq!(response.status_code, 200);
    assert_eq!(response.get_header("Content-Type"), Some("application/sdp"));
    let body = response.body.as_deref().unwrap();
    assert!(body.contains("m=video 0 RTP/AVP 96"));
    assert!(body.contains("sprop-parameter-sets="));

    send(
        &mut writer,
        RtspRequest::new("SETUP", &format!("{url}/track1"))
            .add_header("CSeq", "3")
            .add_header("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1"),
    );
    let response = read_response(&mut reader);
    assert_eq!(response.status_code, 200);
    assert!(
        response
            .get_header("Session")
            .unwrap()
            .contains(";timeout=60")
    );
    let session_id = response.session_id().unwrap().to_string();
    assert_eq!(session_id.len(), 16);

    send(
        &mut writer,
        RtspRequest::new("PLAY", &url)
            .add_header("CSeq", "4")
            .add_header("Session", &session_id),
    );
    let response = read_response(&mut reader);
    assert_eq!(response.status_code, 200);
    assert_eq!(response.session_id(), Some(session_id.as_str()));

    // First interleaved frame: channel 0, then an RTP header with
    // version 2, marker set, payload type 96, sequence 0.
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).unwrap();
    assert_eq!(header[0], b'$');
    assert_eq!(header[1], 0);
    let len = usize::from(u16::from_be_bytes([header[2], header[3]]));
    let mut packet = vec![0u8; len];
    reader.read_exact(&mut packet).unwrap();
    assert_eq!(packet[0], 0x80);
    assert_eq!(packet[1], 0x80 | 96);
    assert_eq!(u16::from_be_bytes([packet[2], packet[3]]), 0);
    // 12-byte RTP header plus the 400-byte synthetic payload.
    assert_eq!(len, 412);

    send(
        &mut writer,
        RtspRequest::new("TEARDOWN", &url)
            .add_header("CSeq", "5")
            .add_header("Session", &session_id),
    );
    let response = read_response(&mut reader);
    assert_eq!(response.status_code, 200);

    server.stop();
}

#[test]
fn rejects_bad_transport_unknown_session_and_method() {
    let (mut server, addr) = start_server(10, true);
    let url = format!("rtsp://{addr}/stream");

    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);

    // UDP transport is not served.
    send(
        &mut writer,
        RtspRequest::new("SETUP", &url)
            .add_header("CSeq", "1")
            .add_header("Transport", "RTP/AVP;unicast;client_port=5000-5001"),
    );
    assert_eq!(read_response(&mut reader).status_code, 461);

    // PLAY without a session.
    send(
        &mut writer,
        RtspRequest::new("PLAY", &url)
            .add_header("CSeq", "2")
            .add_header("Session", "DEADBEEF00000000"),
    );
    assert_eq!(read_response(&mut reader).status_code, 454);

    // Unsupported method keeps the CSeq.
    send(&mut writer, RtspRequest::new("PAUSE", &url).add_header("CSeq", "3"));
    let response = read_response(&mut reader);
    assert_eq!(response.status_code, 405);
    assert_eq!(response.cseq(), Some(3));

    server.stop();
}

#[test]
fn control_session_drives_a_full_playback() {
    let (mut server, addr) = start_server(50, true);
    let url = format!("rtsp://{addr}/stream");
    let scheduler = server.scheduler();

    let session =
        RtspControlSession::connect(&url, Arc::new(NullObserver), ConnectOptions::default())
            .unwrap();

    let (tx, rx) = mpsc::channel();
    session.describe(move |reply| tx.send(reply).unwrap()).unwrap();
    let control = match rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap() {
        RtspReply::Describe { content_base, sdp } => {
            assert!(content_base.is_some());
            assert_eq!(sdp.media.len(), 1);
            assert_eq!(sdp.media[0].payload_type, 96);
            sdp.media[0].control.clone().unwrap()
        }
        other => panic!("unexpected reply: {other:?}"),
    };

    let (tx, rx) = mpsc::channel();
    session.setup(&control, move |reply| tx.send(reply).unwrap()).unwrap();
    let session_id = match rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap() {
        RtspReply::Setup { session_id } => session_id,
        other => panic!("unexpected reply: {other:?}"),
    };
    assert_eq!(session_id.len(), 16);

    let (tx, rx) = mpsc::channel();
    session.play(&session_id, move |reply| tx.send(reply).unwrap()).unwrap();
    assert!(matches!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap(),
        RtspReply::Play
    ));

    // Streaming is live: the scheduler is running and bits flow.
    let stats = scheduler.stats();
    assert!(wait_until(Duration::from_secs(5), || {
        stats.throughput_bits() > 0
    }));
    assert!(scheduler.is_running());

    // GET_PARAMETER keep-alive round-trips while playing.
    let (tx, rx) = mpsc::channel();
    session
        .get_parameter(&session_id, move |reply| tx.send(reply).unwrap())
        .unwrap();
    assert!(matches!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap(),
        RtspReply::Parameter
    ));

    // Dropping the viewer connection detaches the consumer and stops the
    // session.
    session.disconnect();
    assert!(wait_until(Duration::from_secs(5), || !scheduler.is_running()));

    server.stop();
}

#[test]
fn finite_stream_without_looping_closes_viewers() {
    let (mut server, addr) = start_server(3, false);
    let url = format!("rtsp://{addr}/stream");

    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);

    send(
        &mut writer,
        RtspRequest::new("SETUP", &url)
            .add_header("CSeq", "1")
            .add_header("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1"),
    );
    let session_id = read_response(&mut reader).session_id().unwrap().to_string();

    send(
        &mut writer,
        RtspRequest::new("PLAY", &url)
            .add_header("CSeq", "2")
            .add_header("Session", &session_id),
    );
    assert_eq!(read_response(&mut reader).status_code, 200);

    // Drain until the server exhausts the three-unit stream and closes
    // the connection.
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => panic!("unexpected read error: {e}"),
        }
    }

    server.stop();
}
