//! Datagram transport against a loopback server speaking the same framing.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use voice_endpoint::protocol::packet::{PacketOpener, PacketSealer, SessionKeys};
use voice_endpoint::protocol::udp::{UdpProtocol, UdpProtocolOptions};
use voice_endpoint::protocol::{
    ControlChannel, ControlEvent, ControlHandler, Protocol, ProtocolEvent, messages,
};

const KEY: &str = "2b7e151628aed2a6abf7158809cf4f3c";
const NONCE: &str = "01000000000000000000000000000000";

/// How the fake server answers a client hello.
#[derive(Clone)]
enum Reply {
    Hello(String),
    Silent,
}

struct FakeControl {
    reachable: bool,
    reply: Reply,
    connected: AtomicBool,
    handler: Mutex<Option<ControlHandler>>,
    sent: Mutex<Vec<String>>,
}

impl FakeControl {
    fn new(reachable: bool, reply: Reply) -> Arc<Self> {
        Arc::new(Self {
            reachable,
            reply,
            connected: AtomicBool::new(false),
            handler: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn push(&self, event: ControlEvent) {
        let handler = self.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

impl ControlChannel for FakeControl {
    fn connect(&self, handler: ControlHandler) -> anyhow::Result<()> {
        if !self.reachable {
            anyhow::bail!("Connection refused");
        }
        *self.handler.lock().unwrap() = Some(handler);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send_text(&self, text: &str) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(text.to_string());
        if text.contains(r#""type":"hello""#) {
            if let Reply::Hello(hello) = self.reply.clone() {
                let handler = self.handler.lock().unwrap().clone();
                if let Some(handler) = handler {
                    // answer from another thread, like a socket reader would
                    thread::spawn(move || {
                        thread::sleep(Duration::from_millis(20));
                        handler(ControlEvent::Text(hello));
                    });
                }
            }
        }
        Ok(())
    }
}

struct AudioServer {
    socket: UdpSocket,
    opener: PacketOpener,
    sealer: PacketSealer,
}

impl AudioServer {
    fn bind() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let keys = SessionKeys::from_hex(KEY, NONCE).unwrap();
        Self {
            socket,
            opener: PacketOpener::new(&keys, None),
            sealer: PacketSealer::new(keys),
        }
    }

    fn port(&self) -> u16 {
        self.socket.local_addr().unwrap().port()
    }

    fn hello(&self, transport: &str) -> String {
        json!({
            "type": "hello",
            "transport": transport,
            "session_id": "sess-1",
            "audio_params": {"sample_rate": 24000},
            "udp": {"server": "127.0.0.1", "port": self.port(), "key": KEY, "nonce": NONCE}
        })
        .to_string()
    }

    fn recv(&mut self) -> (Vec<u8>, SocketAddr) {
        let mut buf = vec![0u8; 65536];
        let (len, from) = self.socket.recv_from(&mut buf).unwrap();
        (self.opener.open(&buf[..len]).unwrap(), from)
    }
}

fn recorder(protocol: &UdpProtocol) -> Arc<Mutex<Vec<ProtocolEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    protocol.on_event(Arc::new(move |event| sink.lock().unwrap().push(event)));
    events
}

fn incoming(events: &Mutex<Vec<ProtocolEvent>>) -> Vec<Vec<u8>> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            ProtocolEvent::IncomingAudio(data) => Some(data.clone()),
            _ => None,
        })
        .collect()
}

fn wait_for_incoming(events: &Mutex<Vec<ProtocolEvent>>, count: usize) -> Vec<Vec<u8>> {
    let deadline = Instant::now() + Duration::from_secs(2);
    while incoming(events).len() < count && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    incoming(events)
}

fn options() -> UdpProtocolOptions {
    UdpProtocolOptions {
        hello_timeout: Duration::from_millis(500),
        ..UdpProtocolOptions::default()
    }
}

#[test]
fn test_session_streams_both_ways() {
    let mut server = AudioServer::bind();
    let control = FakeControl::new(true, Reply::Hello(server.hello("udp")));
    let mut protocol = UdpProtocol::new(control.clone(), options());
    let events = recorder(&protocol);

    assert!(protocol.open_audio_channel());
    assert!(protocol.is_audio_channel_opened());
    assert_eq!(protocol.session_id(), "sess-1");
    assert_eq!(protocol.server_sample_rate(), 24000);
    assert_eq!(control.sent()[0], messages::hello(3, "udp"));
    assert_eq!(
        events.lock().unwrap()[0],
        ProtocolEvent::AudioChannelOpened { sample_rate: 24000 }
    );

    for i in 0..3u8 {
        protocol.send_audio(&[i; 40]);
    }
    let mut client_addr = None;
    for i in 0..3u8 {
        let (payload, from) = server.recv();
        assert_eq!(payload, vec![i; 40]);
        client_addr = Some(from);
    }
    assert_eq!(server.opener.remote_sequence(), 3);

    let client_addr = client_addr.unwrap();
    for payload in [b"first".as_slice(), b"second".as_slice()] {
        let packet = server.sealer.seal(payload).unwrap();
        server.socket.send_to(&packet, client_addr).unwrap();
    }
    assert_eq!(
        wait_for_incoming(&events, 2),
        [b"first".to_vec(), b"second".to_vec()]
    );

    protocol.close_audio_channel();
    protocol.close_audio_channel();
    assert!(!protocol.is_audio_channel_opened());
    assert_eq!(control.sent().last().unwrap(), &messages::goodbye("sess-1"));
    let closed = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| **e == ProtocolEvent::AudioChannelClosed)
        .count();
    assert_eq!(closed, 1);
}

#[test]
fn test_replayed_and_short_packets_dropped() {
    let mut server = AudioServer::bind();
    let control = FakeControl::new(true, Reply::Hello(server.hello("udp")));
    let mut protocol = UdpProtocol::new(control, options());
    let events = recorder(&protocol);
    assert!(protocol.open_audio_channel());

    protocol.send_audio(b"hi");
    let (_, client_addr) = server.recv();

    let first = server.sealer.seal(b"one").unwrap();
    let second = server.sealer.seal(b"two").unwrap();
    for packet in [&first[..], &[1u8, 0, 0, 0, 0][..], &second[..], &first[..]] {
        server.socket.send_to(packet, client_addr).unwrap();
    }

    assert_eq!(
        wait_for_incoming(&events, 2),
        [b"one".to_vec(), b"two".to_vec()]
    );
    // give any wrongly accepted replay time to show up
    thread::sleep(Duration::from_millis(100));
    assert_eq!(incoming(&events).len(), 2);
}

#[test]
fn test_large_packets_arrive_intact() {
    let mut server = AudioServer::bind();
    let control = FakeControl::new(true, Reply::Hello(server.hello("udp")));
    let mut protocol = UdpProtocol::new(control, options());
    let events = recorder(&protocol);
    assert!(protocol.open_audio_channel());

    let large: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
    protocol.send_audio(&large);
    let (payload, client_addr) = server.recv();
    assert_eq!(payload, large);

    let packet = server.sealer.seal(&large).unwrap();
    server.socket.send_to(&packet, client_addr).unwrap();
    assert_eq!(wait_for_incoming(&events, 1), [large]);
}

#[test]
fn test_unreachable_server_fails_once() {
    let control = FakeControl::new(false, Reply::Silent);
    let mut protocol = UdpProtocol::new(control.clone(), options());
    let events = recorder(&protocol);

    assert!(!protocol.open_audio_channel());
    assert!(!protocol.is_audio_channel_opened());
    assert!(control.sent().is_empty());

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], ProtocolEvent::NetworkError(_)));
}

#[test]
fn test_missing_hello_times_out() {
    let control = FakeControl::new(true, Reply::Silent);
    let mut protocol = UdpProtocol::new(control, options());
    let events = recorder(&protocol);

    let started = Instant::now();
    assert!(!protocol.open_audio_channel());
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(
        *events.lock().unwrap(),
        [ProtocolEvent::NetworkError("Server timeout".into())]
    );
}

#[test]
fn test_wrong_transport_rejected() {
    let server = AudioServer::bind();
    let control = FakeControl::new(true, Reply::Hello(server.hello("websocket")));
    let mut protocol = UdpProtocol::new(control, options());
    let events = recorder(&protocol);

    assert!(!protocol.open_audio_channel());
    assert!(matches!(
        events.lock().unwrap()[..],
        [ProtocolEvent::NetworkError(_)]
    ));
}

#[test]
fn test_bad_key_material_rejected() {
    let server = AudioServer::bind();
    let hello = json!({
        "type": "hello",
        "transport": "udp",
        "session_id": "sess-1",
        "udp": {"server": "127.0.0.1", "port": server.port(), "key": "abcd", "nonce": NONCE}
    })
    .to_string();
    let control = FakeControl::new(true, Reply::Hello(hello));
    let mut protocol = UdpProtocol::new(control, options());

    assert!(!protocol.open_audio_channel());
    assert!(!protocol.is_audio_channel_opened());
}

#[test]
fn test_goodbye_for_current_session_only() {
    let server = AudioServer::bind();
    let control = FakeControl::new(true, Reply::Hello(server.hello("udp")));
    let mut protocol = UdpProtocol::new(control.clone(), options());
    let events = recorder(&protocol);
    assert!(protocol.open_audio_channel());

    control.push(ControlEvent::Text(
        r#"{"type":"goodbye","session_id":"someone-else"}"#.into(),
    ));
    control.push(ControlEvent::Text("not json".into()));
    control.push(ControlEvent::Text(
        r#"{"type":"tts","state":"start"}"#.into(),
    ));
    control.push(ControlEvent::Text(
        r#"{"type":"goodbye","session_id":"sess-1"}"#.into(),
    ));

    let events = events.lock().unwrap();
    assert_eq!(
        events[1..],
        [
            ProtocolEvent::IncomingJson(json!({"type": "tts", "state": "start"})),
            ProtocolEvent::Goodbye,
        ]
    );
}

#[test]
fn test_control_disconnect_reported_as_goodbye() {
    let server = AudioServer::bind();
    let control = FakeControl::new(true, Reply::Hello(server.hello("udp")));
    let mut protocol = UdpProtocol::new(control.clone(), options());
    let events = recorder(&protocol);
    assert!(protocol.open_audio_channel());

    control.push(ControlEvent::Disconnected);
    assert_eq!(events.lock().unwrap().last(), Some(&ProtocolEvent::Goodbye));
}
