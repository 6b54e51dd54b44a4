//! Server and client talking to each other over loopback.

use pollnet::dev_tracing::init_tracing;
use pollnet::prelude::*;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn loopback_config(max_sessions: usize) -> ServerConfig {
    ServerConfig::new(0)
        .with_bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .with_max_sessions(max_sessions)
}

/// Two-byte big-endian body length, then the body.
#[derive(Debug, Clone, Copy, Default)]
struct LengthPrefixed;

impl LengthPrefixed {
    fn total(msg: &Message) -> usize {
        let b = msg.as_slice();
        2 + usize::from(u16::from_be_bytes([b[0], b[1]]))
    }

    fn frame(msg: &mut Message, body: &[u8]) {
        let len = u16::try_from(body.len()).unwrap();
        msg.write(&len.to_be_bytes());
        msg.write(body);
    }
}

impl Framing for LengthPrefixed {
    fn is_message_complete(&self, msg: &Message) -> bool {
        self.is_header_complete(msg) && msg.len() >= Self::total(msg)
    }

    fn is_header_complete(&self, msg: &Message) -> bool {
        msg.len() >= 2
    }

    fn is_header_ok(&self, msg: &Message) -> bool {
        Self::total(msg) > 2
    }

    fn missing_length(&self, msg: &Message) -> usize {
        if self.is_header_complete(msg) {
            Self::total(msg) - msg.len()
        } else {
            2 - msg.len()
        }
    }
}

/// Replies to a two-byte request with four bytes: the request twice.
struct Doubler {
    requests: flume::Sender<(usize, Vec<u8>)>,
}

impl SessionHandler<RawSegment> for Doubler {
    fn on_session_message(&self, session: &Session<RawSegment, Self>, msg: &Message) {
        let _ = self.requests.send((session.id(), msg.as_slice().to_vec()));
        let mut reply = session.acquire().unwrap();
        reply.write(msg.as_slice());
        reply.write(msg.as_slice());
        assert!(session.send_tcp(reply));
    }
}

#[test]
fn test_stream_request_reply_single_slot() {
    init_tracing();
    let scheduler = Scheduler::new("e2e", 4).unwrap();
    let (tx, requests) = flume::unbounded();
    let server = Server::bind(
        loopback_config(1),
        Handlers::single(&scheduler.handle()),
        RawSegment,
        Doubler { requests: tx },
    )
    .unwrap();
    let monitor = server.monitor();
    assert_eq!(
        monitor.recv_timeout(WAIT).unwrap(),
        SocketEvent::Listening(server.local_addr())
    );

    let mut peer = TcpStream::connect(server.local_addr()).unwrap();
    peer.set_read_timeout(Some(WAIT)).unwrap();
    assert!(matches!(
        monitor.recv_timeout(WAIT).unwrap(),
        SocketEvent::Accepted { session: 0, .. }
    ));

    peer.write_all(&[0xAB, 0xCD]).unwrap();
    assert_eq!(requests.recv_timeout(WAIT).unwrap(), (0, vec![0xAB, 0xCD]));

    let mut reply = [0u8; 4];
    peer.read_exact(&mut reply).unwrap();
    assert_eq!(reply, [0xAB, 0xCD, 0xAB, 0xCD]);

    let session = server.session(0).unwrap();
    assert_eq!(session.stats().bytes_received, 2);
}

/// Raw-segment client: every read is one message.
struct RawClient {
    events: flume::Sender<ClientEvent>,
}

impl ClientHandler<RawSegment> for RawClient {
    fn on_connected(&self, _client: &Client<RawSegment, Self>) {
        let _ = self.events.send(ClientEvent::Connected);
    }

    fn on_disconnected(&self, _client: &Client<RawSegment, Self>) {
        let _ = self.events.send(ClientEvent::Disconnected);
    }

    fn on_message(&self, _client: &Client<RawSegment, Self>, msg: Message) -> Option<Message> {
        let _ = self.events.send(ClientEvent::Message(msg.as_slice().to_vec()));
        Some(msg)
    }
}

#[test]
fn test_client_request_reply_single_slot() {
    init_tracing();
    let scheduler = Scheduler::new("e2e-raw", 6).unwrap();
    let handlers = Handlers::single(&scheduler.handle());
    let (tx, requests) = flume::unbounded();
    let server = Server::bind(
        loopback_config(1),
        handlers.clone(),
        RawSegment,
        Doubler { requests: tx },
    )
    .unwrap();
    let monitor = server.monitor();
    assert_eq!(
        monitor.recv_timeout(WAIT).unwrap(),
        SocketEvent::Listening(server.local_addr())
    );

    let (tx, events) = flume::unbounded();
    let client = Client::new(
        ClientConfig::default(),
        handlers,
        RawSegment,
        RawClient { events: tx },
    )
    .unwrap();
    assert!(client.connect("127.0.0.1", server.local_addr().port()));
    assert!(matches!(
        events.recv_timeout(WAIT).unwrap(),
        ClientEvent::Connected
    ));
    assert!(matches!(
        monitor.recv_timeout(WAIT).unwrap(),
        SocketEvent::Accepted { session: 0, .. }
    ));

    let mut msg = client.acquire().unwrap();
    msg.write(&[0x12, 0x34]);
    assert!(client.send_tcp(msg));

    assert_eq!(requests.recv_timeout(WAIT).unwrap(), (0, vec![0x12, 0x34]));
    match events.recv_timeout(WAIT).unwrap() {
        ClientEvent::Message(reply) => assert_eq!(reply, [0x12, 0x34, 0x12, 0x34]),
        _ => panic!("expected the reply"),
    }

    // Exactly one message each way
    assert!(requests.recv_timeout(Duration::from_millis(300)).is_err());
    assert!(events.recv_timeout(Duration::from_millis(300)).is_err());
    assert_eq!(client.stats().bytes_received, 4);
    assert_eq!(server.session(0).unwrap().stats().bytes_received, 2);

    assert!(client.disconnect());
    assert!(matches!(
        events.recv_timeout(WAIT).unwrap(),
        ClientEvent::Disconnected
    ));
}

struct FramedEcho;

impl SessionHandler<LengthPrefixed> for FramedEcho {
    fn on_session_message(&self, session: &Session<LengthPrefixed, Self>, msg: &Message) {
        if let Some(mut reply) = session.acquire() {
            reply.write(msg.as_slice());
            session.send_tcp(reply);
        }
    }
}

enum ClientEvent {
    Connected,
    Message(Vec<u8>),
    Disconnected,
}

struct FramedClient {
    events: flume::Sender<ClientEvent>,
}

impl ClientHandler<LengthPrefixed> for FramedClient {
    fn on_connected(&self, _client: &Client<LengthPrefixed, Self>) {
        let _ = self.events.send(ClientEvent::Connected);
    }

    fn on_disconnected(&self, _client: &Client<LengthPrefixed, Self>) {
        let _ = self.events.send(ClientEvent::Disconnected);
    }

    fn on_message(&self, _client: &Client<LengthPrefixed, Self>, msg: Message) -> Option<Message> {
        let _ = self
            .events
            .send(ClientEvent::Message(msg.as_slice()[2..].to_vec()));
        Some(msg)
    }
}

fn framed_pair(
    scheduler: &Scheduler,
) -> (
    Arc<Server<LengthPrefixed, FramedEcho>>,
    Arc<Client<LengthPrefixed, FramedClient>>,
    flume::Receiver<ClientEvent>,
) {
    let handlers = Handlers::single(&scheduler.handle());
    let server = Server::bind(loopback_config(4), handlers.clone(), LengthPrefixed, FramedEcho)
        .unwrap();
    let (tx, events) = flume::unbounded();
    let client = Client::new(
        ClientConfig::default(),
        handlers,
        LengthPrefixed,
        FramedClient { events: tx },
    )
    .unwrap();

    assert!(client.connect("127.0.0.1", server.local_addr().port()));
    assert!(matches!(
        events.recv_timeout(WAIT).unwrap(),
        ClientEvent::Connected
    ));
    (server, client, events)
}

#[test]
fn test_framed_messages_keep_boundaries() {
    init_tracing();
    let scheduler = Scheduler::new("e2e-framed", 6).unwrap();
    let (server, client, events) = framed_pair(&scheduler);

    let bodies: Vec<Vec<u8>> = (0u8..20).map(|i| vec![i; usize::from(i) + 1]).collect();
    for body in &bodies {
        let mut msg = client.acquire().unwrap();
        LengthPrefixed::frame(&mut msg, body);
        assert!(client.send_tcp(msg));
    }

    for body in &bodies {
        match events.recv_timeout(WAIT).unwrap() {
            ClientEvent::Message(echoed) => assert_eq!(&echoed, body),
            _ => panic!("expected a message"),
        }
    }

    assert_eq!(server.active_sessions(), 1);
    client.disconnect();
    assert!(matches!(
        events.recv_timeout(WAIT).unwrap(),
        ClientEvent::Disconnected
    ));
}

#[test]
fn test_invalid_header_closes_session() {
    init_tracing();
    let scheduler = Scheduler::new("e2e-invalid", 6).unwrap();
    let (server, client, events) = framed_pair(&scheduler);
    let monitor = server.monitor();

    // A zero-length body is rejected by the header check
    let mut msg = client.acquire().unwrap();
    msg.write(&[0, 0]);
    assert!(client.send_tcp(msg));

    assert!(matches!(
        events.recv_timeout(WAIT).unwrap(),
        ClientEvent::Disconnected
    ));
    loop {
        if monitor.recv_timeout(WAIT).unwrap() == (SocketEvent::Closed { session: 0 }) {
            break;
        }
    }
    assert_eq!(server.free_sessions(), 4);
}
