//! Socket-level transport tests: a real listener, real client sockets, an
//! echo handler. Covers framing over TCP and WebSocket, per-session FIFO,
//! protocol-violation teardown, and the exactly-once disconnect hook.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use ph_protocol::{
    ClientPacket, ResponsePacket, decode_response, encode_request, encode_request_body, error_codes,
};
use ph_transport::{SessionHandle, SessionHandler, SessionServer, TransportConfig};

// ---------------------------------------------------------------------------
// Echo handler
// ---------------------------------------------------------------------------

/// Replies to every request with the same msg_id/payload, and counts hook
/// invocations.
#[derive(Default)]
struct EchoHandler {
    disconnects: AtomicU32,
    violations: AtomicU32,
}

impl SessionHandler for EchoHandler {
    fn on_message(&self, session: &SessionHandle, packet: ClientPacket) {
        session.send_response(ResponsePacket {
            msg_id: packet.msg_id,
            msg_seq: packet.msg_seq,
            stage_id: packet.stage_id,
            error_code: error_codes::SUCCESS,
            original_size: 0,
            payload: packet.payload,
        });
    }

    fn on_disconnect(&self, _session: &SessionHandle) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_protocol_error(&self, _session: &SessionHandle, _error: &ph_protocol::WireError) {
        self.violations.fetch_add(1, Ordering::SeqCst);
    }
}

async fn start_tcp(handler: Arc<EchoHandler>) -> (SessionServer, std::net::SocketAddr) {
    let cfg = TransportConfig {
        tcp_bind: Some("127.0.0.1:0".to_owned()),
        heartbeat_timeout: Duration::from_secs(5),
        ..TransportConfig::default()
    };
    let server = SessionServer::start(cfg, handler).await.expect("start");
    let addr = server.tcp_addr().expect("tcp bound");
    (server, addr)
}

fn request(msg_id: &str, msg_seq: u16, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::new();
    encode_request(
        &ClientPacket {
            msg_id: msg_id.to_owned(),
            msg_seq,
            stage_id: 1001,
            payload: bytes::Bytes::copy_from_slice(payload),
        },
        &mut buf,
    )
    .expect("encode");
    buf
}

async fn read_one_response(stream: &mut TcpStream, buf: &mut BytesMut) -> ResponsePacket {
    loop {
        if let Some(pkt) =
            decode_response(buf, ph_protocol::DEFAULT_MAX_PACKET_SIZE).expect("decode")
        {
            return pkt;
        }
        let read = timeout(Duration::from_secs(5), stream.read_buf(buf))
            .await
            .expect("response within deadline")
            .expect("read");
        assert_ne!(read, 0, "server closed before responding");
    }
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tcp_request_is_echoed_back() {
    let handler = Arc::new(EchoHandler::default());
    let (_server, addr) = start_tcp(Arc::clone(&handler)).await;

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream.write_all(&request("Echo", 7, b"payload")).await.expect("write");

    let mut buf = BytesMut::new();
    let pkt = read_one_response(&mut stream, &mut buf).await;
    assert_eq!(pkt.msg_id, "Echo");
    assert_eq!(pkt.msg_seq, 7);
    assert_eq!(pkt.stage_id, 1001);
    assert_eq!(&pkt.payload[..], b"payload");
}

#[tokio::test]
async fn tcp_responses_come_back_in_request_order() {
    let handler = Arc::new(EchoHandler::default());
    let (_server, addr) = start_tcp(Arc::clone(&handler)).await;

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let mut all = BytesMut::new();
    for seq in 1..=20u16 {
        all.extend_from_slice(&request("Seq", seq, &seq.to_le_bytes()));
    }
    stream.write_all(&all).await.expect("write pipelined");

    let mut buf = BytesMut::new();
    for want in 1..=20u16 {
        let pkt = read_one_response(&mut stream, &mut buf).await;
        assert_eq!(pkt.msg_seq, want, "outbound order matches enqueue order");
    }
}

#[tokio::test]
async fn oversized_frame_closes_the_session_after_the_error_hook() {
    let handler = Arc::new(EchoHandler::default());
    let cfg = TransportConfig {
        tcp_bind: Some("127.0.0.1:0".to_owned()),
        max_packet_size: 128,
        ..TransportConfig::default()
    };
    let server = SessionServer::start(cfg, Arc::clone(&handler) as Arc<dyn SessionHandler>)
        .await
        .expect("start");
    let addr = server.tcp_addr().expect("tcp bound");

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&1_000u32.to_le_bytes()); // declares 1000 > 128
    stream.write_all(&buf).await.expect("write");

    // Peer should close; read drains to EOF.
    let mut sink = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut sink))
        .await
        .expect("close within deadline")
        .expect("clean close");
    assert_eq!(handler.violations.load(Ordering::SeqCst), 1);

    for _ in 0..100 {
        if handler.disconnects.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(handler.disconnects.load(Ordering::SeqCst), 1);
    assert!(server.registry().is_empty(), "violating session left the table");
}

#[tokio::test]
async fn disconnect_hook_fires_exactly_once_per_session() {
    let handler = Arc::new(EchoHandler::default());
    let (server, addr) = start_tcp(Arc::clone(&handler)).await;

    let stream = TcpStream::connect(addr).await.expect("connect");
    // Let the server accept and register.
    for _ in 0..100 {
        if server.registry().len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.registry().len(), 1);

    drop(stream);
    for _ in 0..100 {
        if handler.disconnects.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(handler.disconnects.load(Ordering::SeqCst), 1);
    assert!(server.registry().is_empty());
}

#[tokio::test]
async fn heartbeat_timeout_closes_an_idle_session() {
    let handler = Arc::new(EchoHandler::default());
    let cfg = TransportConfig {
        tcp_bind: Some("127.0.0.1:0".to_owned()),
        heartbeat_timeout: Duration::from_millis(100),
        ..TransportConfig::default()
    };
    let server = SessionServer::start(cfg, Arc::clone(&handler) as Arc<dyn SessionHandler>)
        .await
        .expect("start");
    let addr = server.tcp_addr().expect("tcp bound");

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let mut sink = Vec::new();
    // Send nothing: the idle session must be torn down by the server.
    timeout(Duration::from_secs(5), stream.read_to_end(&mut sink))
        .await
        .expect("timed-out session closed")
        .expect("clean close");
    for _ in 0..100 {
        if handler.disconnects.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(handler.disconnects.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

#[tokio::test]
async fn websocket_body_without_length_prefix_is_echoed() {
    let handler = Arc::new(EchoHandler::default());
    let cfg = TransportConfig {
        ws_bind: Some("127.0.0.1:0".to_owned()),
        ..TransportConfig::default()
    };
    let server = SessionServer::start(cfg, Arc::clone(&handler) as Arc<dyn SessionHandler>)
        .await
        .expect("start");
    let addr = server.ws_addr().expect("ws bound");

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("upgrade");

    let mut body = BytesMut::new();
    encode_request_body(
        &ClientPacket {
            msg_id: "WsEcho".to_owned(),
            msg_seq: 3,
            stage_id: 9,
            payload: bytes::Bytes::from_static(b"ws"),
        },
        &mut body,
    )
    .expect("encode");
    ws.send(tokio_tungstenite::tungstenite::Message::Binary(body.freeze()))
        .await
        .expect("send");

    let reply = timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("reply within deadline")
        .expect("stream open")
        .expect("frame");
    let tokio_tungstenite::tungstenite::Message::Binary(data) = reply else {
        panic!("expected binary reply, got {reply:?}");
    };
    let mut data = BytesMut::from(&data[..]);
    let pkt = ph_protocol::decode_response_body(&mut data).expect("decode");
    assert_eq!(pkt.msg_id, "WsEcho");
    assert_eq!(pkt.msg_seq, 3);
    assert_eq!(&pkt.payload[..], b"ws");
}

#[tokio::test]
async fn websocket_upgrade_on_wrong_path_is_refused() {
    let handler = Arc::new(EchoHandler::default());
    let cfg = TransportConfig {
        ws_bind: Some("127.0.0.1:0".to_owned()),
        ..TransportConfig::default()
    };
    let server = SessionServer::start(cfg, Arc::clone(&handler) as Arc<dyn SessionHandler>)
        .await
        .expect("start");
    let addr = server.ws_addr().expect("ws bound");

    let result = tokio_tungstenite::connect_async(format!("ws://{addr}/other")).await;
    assert!(result.is_err(), "upgrade outside the configured path must fail");
    assert!(server.registry().is_empty());
}
