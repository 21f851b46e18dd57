use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::{sleep, timeout};

use polynet::{
    BinaryCodec, Codec, CodecError, ConnError, ConnOption, ConnState, Connection, EndpointEvent,
    JsonCodec, Message, MsgDispatcher, MsgReceiver, RudpConfig, RudpEndpoint,
};

const WAIT: Duration = Duration::from_secs(5);

#[derive(
    Debug,
    Clone,
    PartialEq,
    Serialize,
    Deserialize,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
struct Ping {
    seq: u32,
    note: String,
}

polynet::message!(Ping = 1);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Pong {
    seq: u32,
}

polynet::message!(Pong = 2);

fn ping(seq: u32) -> Ping {
    Ping {
        seq,
        note: format!("ping #{seq}"),
    }
}

/// Large enough that a peer which stops reading fills the socket buffers
/// after a handful of frames.
fn big_ping() -> Ping {
    Ping {
        seq: 0,
        note: "x".repeat(900_000),
    }
}

fn json_codec() -> Arc<dyn Codec> {
    Arc::new(JsonCodec::new().with::<Ping>().unwrap())
}

fn option(addr: SocketAddr) -> ConnOption {
    ConnOption {
        host: addr.ip().to_string(),
        port: addr.port(),
        codec: json_codec(),
        connect_timeout: Duration::from_secs(2),
        timeout: Duration::from_secs(10),
        ..Default::default()
    }
}

#[derive(Debug, PartialEq)]
enum Event {
    Connected,
    Ping(u32),
    Exception(&'static str),
    Closed,
}

fn label(err: &ConnError) -> &'static str {
    match err {
        ConnError::Connect { .. } => "connect",
        ConnError::ConnectTimeout { .. } => "connect_timeout",
        ConnError::Encode(_) => "encode",
        ConnError::Decode(_) => "decode",
        ConnError::IdleTimeout(_) => "idle",
        ConnError::Transport(_) => "transport",
        ConnError::PeerClosed => "peer_closed",
        ConnError::QueueFull { .. } => "queue_full",
        ConnError::InvalidState(_) => "invalid_state",
        ConnError::NotConnected(_) => "not_connected",
        ConnError::NoRuntime => "no_runtime",
        ConnError::Panicked(_) => "panicked",
    }
}

fn record(conn: &Connection) -> UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();

    let events = tx.clone();
    conn.on_connected(move |_| {
        let _ = events.send(Event::Connected);
    });
    let events = tx.clone();
    conn.on_message(move |_, msg| {
        if let Some(ping) = msg.as_any().downcast_ref::<Ping>() {
            let _ = events.send(Event::Ping(ping.seq));
        }
    });
    let events = tx.clone();
    conn.on_exception(move |_, err| {
        let _ = events.send(Event::Exception(label(err)));
    });
    conn.on_closed(move |_| {
        let _ = tx.send(Event::Closed);
    });

    rx
}

async fn next(rx: &mut UnboundedReceiver<Event>) -> Event {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn assert_quiet(rx: &mut UnboundedReceiver<Event>) {
    sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "unexpected trailing event");
}

async fn wait_state(conn: &Connection, target: ConnState) {
    timeout(WAIT, conn.wait_for_state(|state| state == target))
        .await
        .expect("timed out waiting for state");
}

async fn tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

async fn ws_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    if (msg.is_binary() || msg.is_text()) && ws.send(msg).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

async fn rudp_echo() -> SocketAddr {
    let mut endpoint = RudpEndpoint::bind("127.0.0.1:0", RudpConfig::default())
        .await
        .unwrap();
    let addr = endpoint.local_addr();
    tokio::spawn(async move {
        while let Ok(events) = endpoint.poll().await {
            for event in events {
                if let EndpointEvent::Data { addr, payload } = event {
                    let _ = endpoint.send_to(addr, &payload).await;
                }
            }
        }
    });
    addr
}

/// Accepts one TCP connection and hands it to `serve`.
async fn tcp_peer<F, Fut>(serve: F) -> SocketAddr
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            serve(stream).await;
        }
    });
    addr
}

/// Accepts TCP connections and never reads from them.
async fn tcp_stalled() -> SocketAddr {
    tcp_peer(|stream| async move {
        sleep(Duration::from_secs(30)).await;
        drop(stream);
    })
    .await
}

/// Completes the WebSocket upgrade, then never reads.
async fn ws_stalled() -> SocketAddr {
    tcp_peer(|stream| async move {
        let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
            return;
        };
        sleep(Duration::from_secs(30)).await;
        drop(ws);
    })
    .await
}

/// Answers the reliable-UDP handshake, then goes silent without closing.
async fn rudp_silent_after_handshake() -> SocketAddr {
    let mut endpoint = RudpEndpoint::bind("127.0.0.1:0", RudpConfig::default())
        .await
        .unwrap();
    let addr = endpoint.local_addr();
    tokio::spawn(async move {
        while let Ok(events) = endpoint.poll().await {
            if events
                .iter()
                .any(|event| matches!(event, EndpointEvent::Connected { .. }))
            {
                break;
            }
        }
        sleep(Duration::from_secs(30)).await;
        drop(endpoint);
    });
    addr
}

async fn unused_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

async fn echo_round_trip(conn: Connection) {
    let mut events = record(&conn);
    conn.connect().unwrap();
    assert_eq!(next(&mut events).await, Event::Connected);
    assert_eq!(conn.state(), ConnState::Connected);

    for seq in 1..=3 {
        conn.send(&ping(seq)).unwrap();
    }
    for seq in 1..=3 {
        assert_eq!(next(&mut events).await, Event::Ping(seq));
    }

    conn.close();
    assert_eq!(next(&mut events).await, Event::Closed);
    assert_eq!(conn.state(), ConnState::Closed);

    conn.close();
    assert_quiet(&mut events).await;

    let stats = conn.stats();
    assert_eq!(stats.messages_sent, 3);
    assert_eq!(stats.messages_received, 3);
    assert_eq!(stats.bytes_sent, stats.bytes_received);
}

#[tokio::test]
async fn test_tcp_echo() {
    let addr = tcp_echo().await;
    echo_round_trip(Connection::tcp(option(addr))).await;
}

#[tokio::test]
async fn test_ws_echo() {
    let addr = ws_echo().await;
    echo_round_trip(Connection::ws(option(addr))).await;
}

#[tokio::test]
async fn test_rudp_echo() {
    let addr = rudp_echo().await;
    echo_round_trip(Connection::rudp(option(addr))).await;
}

#[tokio::test]
async fn test_rudp_large_message_is_reassembled() {
    let addr = rudp_echo().await;
    let conn = Connection::rudp(option(addr));
    let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = received.clone();
    conn.on_message(move |_, msg| {
        if let Some(ping) = msg.as_any().downcast_ref::<Ping>() {
            sink.lock().push(ping.clone());
        }
    });
    conn.connect().unwrap();
    wait_state(&conn, ConnState::Connected).await;

    let big = Ping {
        seq: 7,
        note: "x".repeat(20_000),
    };
    conn.send(&big).unwrap();

    timeout(WAIT, async {
        while received.lock().is_empty() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(received.lock()[0], big);
    conn.close();
}

#[tokio::test]
async fn test_binary_codec_over_tcp() {
    let addr = tcp_echo().await;
    let codec: Arc<dyn Codec> = Arc::new(BinaryCodec::new().with::<Ping>().unwrap());
    let conn = Connection::tcp(ConnOption {
        codec,
        ..option(addr)
    });
    echo_round_trip(conn).await;
}

#[tokio::test]
async fn test_unreachable_endpoint_faults() {
    let addr = unused_port().await;
    let conn = Connection::tcp(option(addr));
    let mut events = record(&conn);

    conn.connect().unwrap();
    assert_eq!(next(&mut events).await, Event::Exception("connect"));
    wait_state(&conn, ConnState::Faulted).await;

    conn.close();
    assert_eq!(conn.state(), ConnState::Closed);
    assert_quiet(&mut events).await;
}

#[tokio::test]
async fn test_silent_endpoint_times_out() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let conn = Connection::rudp(ConnOption {
        connect_timeout: Duration::from_millis(200),
        ..option(silent.local_addr().unwrap())
    });
    let mut events = record(&conn);

    conn.connect().unwrap();
    assert_eq!(next(&mut events).await, Event::Exception("connect_timeout"));
    wait_state(&conn, ConnState::Faulted).await;
    assert_quiet(&mut events).await;
}

#[tokio::test]
async fn test_close_while_connecting() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let conn = Connection::rudp(ConnOption {
        connect_timeout: Duration::from_secs(5),
        ..option(silent.local_addr().unwrap())
    });
    let mut events = record(&conn);

    conn.connect().unwrap();
    assert_eq!(conn.state(), ConnState::Connecting);
    conn.close();

    assert_eq!(next(&mut events).await, Event::Closed);
    assert_eq!(conn.state(), ConnState::Closed);
    assert_quiet(&mut events).await;
}

#[tokio::test]
async fn test_partial_and_coalesced_frames() {
    let codec = json_codec();
    let frames: Vec<Vec<u8>> = (1..=3).map(|seq| codec.encode(&ping(seq)).unwrap()).collect();

    let addr = tcp_peer(move |mut stream| async move {
        stream.set_nodelay(true).unwrap();
        for byte in &frames[0] {
            stream.write_all(&[*byte]).await.unwrap();
            sleep(Duration::from_millis(1)).await;
        }
        let coalesced = [frames[1].as_slice(), frames[2].as_slice()].concat();
        stream.write_all(&coalesced).await.unwrap();
        sleep(Duration::from_secs(5)).await;
    })
    .await;

    let conn = Connection::tcp(option(addr));
    let mut events = record(&conn);
    conn.connect().unwrap();

    assert_eq!(next(&mut events).await, Event::Connected);
    for seq in 1..=3 {
        assert_eq!(next(&mut events).await, Event::Ping(seq));
    }
    conn.close();
}

#[tokio::test]
async fn test_idle_timeout_closes() {
    let addr = tcp_peer(|stream| async move {
        sleep(Duration::from_secs(5)).await;
        drop(stream);
    })
    .await;

    let conn = Connection::tcp(ConnOption {
        timeout: Duration::from_millis(200),
        ..option(addr)
    });
    let mut events = record(&conn);
    conn.connect().unwrap();

    assert_eq!(next(&mut events).await, Event::Connected);
    assert_eq!(next(&mut events).await, Event::Exception("idle"));
    assert_eq!(next(&mut events).await, Event::Closed);
    assert_eq!(conn.state(), ConnState::Closed);
    assert_quiet(&mut events).await;
}

#[tokio::test]
async fn test_malformed_frame_is_fatal() {
    let codec = json_codec();
    let mut bytes = codec.encode(&ping(1)).unwrap();
    bytes.extend_from_slice(&[2, 0, 0, 0, 9, 9]);
    bytes.extend(codec.encode(&ping(2)).unwrap());

    let addr = tcp_peer(move |mut stream| async move {
        stream.write_all(&bytes).await.unwrap();
        sleep(Duration::from_secs(5)).await;
    })
    .await;

    let conn = Connection::tcp(option(addr));
    let mut events = record(&conn);
    conn.connect().unwrap();

    assert_eq!(next(&mut events).await, Event::Connected);
    assert_eq!(next(&mut events).await, Event::Ping(1));
    assert_eq!(next(&mut events).await, Event::Exception("decode"));
    assert_eq!(next(&mut events).await, Event::Closed);
    assert_quiet(&mut events).await;
}

#[tokio::test]
async fn test_peer_close_is_reported() {
    let addr = tcp_peer(|stream| async move {
        sleep(Duration::from_millis(50)).await;
        drop(stream);
    })
    .await;

    let conn = Connection::tcp(option(addr));
    let mut events = record(&conn);
    conn.connect().unwrap();

    assert_eq!(next(&mut events).await, Event::Connected);
    let event = next(&mut events).await;
    assert!(
        matches!(
            event,
            Event::Exception("peer_closed") | Event::Exception("transport")
        ),
        "unexpected {event:?}"
    );
    assert_eq!(next(&mut events).await, Event::Closed);
}

#[tokio::test]
async fn test_encode_failure_keeps_connection_open() {
    let addr = tcp_echo().await;
    let conn = Connection::tcp(option(addr));
    let mut events = record(&conn);
    conn.connect().unwrap();
    assert_eq!(next(&mut events).await, Event::Connected);

    let err = conn.send(&Pong { seq: 1 }).unwrap_err();
    assert!(matches!(err, ConnError::Encode(_)));
    assert_eq!(next(&mut events).await, Event::Exception("encode"));
    assert_eq!(conn.state(), ConnState::Connected);

    conn.send(&ping(2)).unwrap();
    assert_eq!(next(&mut events).await, Event::Ping(2));
    assert_eq!(conn.stats().encode_failures, 1);
    conn.close();
}

async fn overflow_closes(conn: Connection) {
    let mut events = record(&conn);
    conn.connect().unwrap();
    assert_eq!(next(&mut events).await, Event::Connected);

    // Nothing yields between sends, so the driver cannot drain the queue.
    let results: Vec<_> = (0..6).map(|seq| conn.send(&ping(seq))).collect();
    assert!(results[..4].iter().all(Result::is_ok));
    assert!(matches!(results[4], Err(ConnError::QueueFull { limit: 4 })));

    assert_eq!(next(&mut events).await, Event::Exception("queue_full"));
    assert_eq!(next(&mut events).await, Event::Closed);
    assert_eq!(conn.state(), ConnState::Closed);
}

fn limited(option: ConnOption) -> ConnOption {
    ConnOption {
        send_queue_limit: 4,
        ..option
    }
}

#[tokio::test]
async fn test_queue_overflow_closes() {
    let addr = tcp_echo().await;
    overflow_closes(Connection::tcp(limited(option(addr)))).await;
}

#[tokio::test]
async fn test_ws_queue_overflow_closes() {
    let addr = ws_echo().await;
    overflow_closes(Connection::ws(limited(option(addr)))).await;
}

#[tokio::test]
async fn test_rudp_queue_overflow_closes() {
    let addr = rudp_echo().await;
    overflow_closes(Connection::rudp(limited(option(addr)))).await;
}

/// Keeps sending large frames to a peer that never reads until the queue
/// pushes back.
async fn overflow_behind_blocked_write(conn: Connection) {
    let mut events = record(&conn);
    conn.connect().unwrap();
    assert_eq!(next(&mut events).await, Event::Connected);

    let big = big_ping();
    let mut rejected = false;
    for _ in 0..500 {
        match conn.send(&big) {
            Ok(()) => sleep(Duration::from_millis(5)).await,
            Err(ConnError::QueueFull { limit: 4 }) => {
                rejected = true;
                break;
            }
            Err(e) => panic!("unexpected send error: {e}"),
        }
    }
    assert!(rejected, "send queue never filled");

    assert_eq!(next(&mut events).await, Event::Exception("queue_full"));
    assert_eq!(next(&mut events).await, Event::Closed);
    assert_eq!(conn.state(), ConnState::Closed);
}

#[tokio::test]
async fn test_overflow_while_peer_stops_reading() {
    let addr = tcp_stalled().await;
    overflow_behind_blocked_write(Connection::tcp(limited(option(addr)))).await;
}

#[tokio::test]
async fn test_ws_overflow_while_peer_stops_reading() {
    let addr = ws_stalled().await;
    overflow_behind_blocked_write(Connection::ws(limited(option(addr)))).await;
}

/// Feeds an unbounded queue to a peer that never reads. Once the write
/// blocks nothing moves, so the idle timeout has to end the connection.
async fn idle_behind_blocked_write(conn: Connection) {
    let mut events = record(&conn);
    conn.connect().unwrap();
    assert_eq!(next(&mut events).await, Event::Connected);

    let big = big_ping();
    let first = timeout(WAIT, async {
        loop {
            if let Ok(event) = events.try_recv() {
                return event;
            }
            let _ = conn.send(&big);
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("idle timeout never fired");

    assert_eq!(first, Event::Exception("idle"));
    assert_eq!(next(&mut events).await, Event::Closed);
    assert_eq!(conn.state(), ConnState::Closed);
}

fn stalls_after(option: ConnOption) -> ConnOption {
    ConnOption {
        timeout: Duration::from_millis(300),
        send_queue_limit: 0,
        ..option
    }
}

#[tokio::test]
async fn test_idle_timeout_while_write_is_blocked() {
    let addr = tcp_stalled().await;
    idle_behind_blocked_write(Connection::tcp(stalls_after(option(addr)))).await;
}

#[tokio::test]
async fn test_ws_idle_timeout_while_write_is_blocked() {
    let addr = ws_stalled().await;
    idle_behind_blocked_write(Connection::ws(stalls_after(option(addr)))).await;
}

#[tokio::test]
async fn test_rudp_idle_timeout_with_unacked_data() {
    let addr = rudp_silent_after_handshake().await;
    let conn = Connection::rudp(ConnOption {
        timeout: Duration::from_millis(300),
        ..option(addr)
    });
    let mut events = record(&conn);
    conn.connect().unwrap();
    assert_eq!(next(&mut events).await, Event::Connected);

    conn.send(&ping(1)).unwrap();
    assert_eq!(next(&mut events).await, Event::Exception("idle"));
    assert_eq!(next(&mut events).await, Event::Closed);
    assert_quiet(&mut events).await;
}

#[tokio::test]
async fn test_unbounded_timeouts() {
    let addr = tcp_echo().await;
    let conn = Connection::tcp(ConnOption {
        connect_timeout: Duration::MAX,
        timeout: Duration::MAX,
        ..option(addr)
    });
    echo_round_trip(conn).await;
}

#[tokio::test]
async fn test_rudp_zero_intervals() {
    let addr = rudp_echo().await;
    let conn = Connection::rudp(ConnOption {
        rudp: RudpConfig {
            interval: Duration::ZERO,
            handshake_interval: Duration::ZERO,
            ..Default::default()
        },
        ..option(addr)
    });
    echo_round_trip(conn).await;
}

/// Encodes like JSON but blows up on every inbound frame.
struct PanickingCodec(JsonCodec);

impl Codec for PanickingCodec {
    fn encode(&self, msg: &dyn Message) -> Result<Vec<u8>, CodecError> {
        self.0.encode(msg)
    }

    fn decode(&self, _buf: &[u8]) -> Result<Option<(Box<dyn Message>, usize)>, CodecError> {
        panic!("decoder bug")
    }
}

#[tokio::test]
async fn test_codec_panic_is_reported_and_closes() {
    let addr = tcp_echo().await;
    let codec = PanickingCodec(JsonCodec::new().with::<Ping>().unwrap());
    let conn = Connection::tcp(ConnOption {
        codec: Arc::new(codec),
        ..option(addr)
    });
    let mut events = record(&conn);
    conn.connect().unwrap();
    assert_eq!(next(&mut events).await, Event::Connected);

    conn.send(&ping(1)).unwrap();
    assert_eq!(next(&mut events).await, Event::Exception("panicked"));
    assert_eq!(next(&mut events).await, Event::Closed);
    assert_eq!(conn.state(), ConnState::Closed);

    conn.close();
    assert_quiet(&mut events).await;
}

#[tokio::test]
async fn test_send_after_close_is_rejected() {
    let addr = tcp_echo().await;
    let conn = Connection::tcp(option(addr));
    conn.connect().unwrap();
    wait_state(&conn, ConnState::Connected).await;

    conn.close();
    wait_state(&conn, ConnState::Closed).await;
    assert!(matches!(
        conn.send(&ping(1)),
        Err(ConnError::NotConnected(ConnState::Closed))
    ));
    assert!(matches!(conn.connect(), Err(ConnError::InvalidState(_))));
}

#[tokio::test]
async fn test_messages_reach_dispatcher() {
    let addr = ws_echo().await;
    let dispatcher = Arc::new(MsgDispatcher::new());
    let handled = Arc::new(AtomicUsize::new(0));

    let counter = handled.clone();
    let on_ping = MsgReceiver::new(move |ping: &Ping| {
        assert_eq!(ping.note, format!("ping #{}", ping.seq));
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    dispatcher.register(&on_ping);

    let conn = Connection::ws(option(addr));
    let routes = dispatcher.clone();
    conn.on_message(move |_, msg| {
        routes.dispatch(msg);
    });
    conn.on_connected(|conn| {
        for seq in 1..=5 {
            conn.send(&ping(seq)).unwrap();
        }
    });
    conn.connect().unwrap();

    timeout(WAIT, async {
        while handled.load(Ordering::SeqCst) < 5 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    conn.close();
}
