//! Single-connection transport against an in-process websocket server.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;

use voice_endpoint::protocol::websocket::{WebsocketOptions, WebsocketProtocol};
use voice_endpoint::protocol::ws_link::WsEndpoint;
use voice_endpoint::protocol::{Protocol, ProtocolEvent, messages};

#[derive(Clone, Copy)]
enum Behavior {
    /// Answer the hello, then echo every binary frame.
    Echo,
    /// Accept the connection and never answer.
    Silent,
    /// Answer the hello, then close from the server side.
    HangUp,
}

struct Server {
    runtime: Runtime,
    url: String,
    texts: Arc<Mutex<Vec<String>>>,
}

impl Server {
    fn start(behavior: Behavior) -> Self {
        let runtime = Runtime::new().unwrap();
        let listener = runtime
            .block_on(TcpListener::bind("127.0.0.1:0"))
            .unwrap();
        let url = format!("ws://{}/xiaozhi/v1/", listener.local_addr().unwrap());
        let texts = Arc::new(Mutex::new(Vec::new()));

        let seen = texts.clone();
        runtime.spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let seen = seen.clone();
                tokio::spawn(async move {
                    let Ok(mut ws) = accept_async(stream).await else {
                        return;
                    };
                    while let Some(Ok(msg)) = ws.next().await {
                        match msg {
                            Message::Text(text) => {
                                let text = text.to_string();
                                seen.lock().unwrap().push(text.clone());
                                if !text.contains(r#""type":"hello""#) {
                                    continue;
                                }
                                match behavior {
                                    Behavior::Silent => {}
                                    Behavior::Echo | Behavior::HangUp => {
                                        let hello = json!({
                                            "type": "hello",
                                            "transport": "websocket",
                                            "session_id": "ws-1",
                                            "audio_params": {"sample_rate": 16000}
                                        });
                                        let _ = ws.send(Message::Text(hello.to_string().into())).await;
                                    }
                                }
                                if let Behavior::HangUp = behavior {
                                    tokio::time::sleep(Duration::from_millis(50)).await;
                                    let _ = ws.close(None).await;
                                }
                            }
                            Message::Binary(data) => {
                                let _ = ws.send(Message::Binary(data)).await;
                            }
                            Message::Close(_) => break,
                            _ => {}
                        }
                    }
                });
            }
        });

        Self { runtime, url, texts }
    }

    fn endpoint(&self) -> WsEndpoint {
        WsEndpoint {
            url: self.url.clone(),
            token: "test-token".into(),
            device_id: "aa:bb:cc:dd:ee:ff".into(),
            client_id: "client-1".into(),
            protocol_version: 3,
        }
    }

    fn protocol(&self) -> WebsocketProtocol {
        WebsocketProtocol::new(
            self.runtime.handle().clone(),
            self.endpoint(),
            WebsocketOptions {
                hello_timeout: Duration::from_millis(300),
                ..WebsocketOptions::default()
            },
        )
    }

    fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }
}

fn recorder(protocol: &WebsocketProtocol) -> Arc<Mutex<Vec<ProtocolEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    protocol.on_event(Arc::new(move |event| sink.lock().unwrap().push(event)));
    events
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let until = Instant::now() + deadline;
    while Instant::now() < until {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn test_open_exchange_and_close() {
    let server = Server::start(Behavior::Echo);
    let mut protocol = server.protocol();
    let events = recorder(&protocol);

    assert!(protocol.open_audio_channel());
    assert!(protocol.is_audio_channel_opened());
    assert_eq!(protocol.session_id(), "ws-1");
    assert_eq!(server.texts()[0], messages::hello(3, "websocket"));
    assert_eq!(
        events.lock().unwrap()[0],
        ProtocolEvent::AudioChannelOpened { sample_rate: 16000 }
    );

    protocol.send_audio(b"opus-frame");
    let echoed = wait_until(Duration::from_secs(2), || {
        events
            .lock()
            .unwrap()
            .contains(&ProtocolEvent::IncomingAudio(b"opus-frame".to_vec()))
    });
    assert!(echoed);

    protocol.close_audio_channel();
    protocol.close_audio_channel();
    assert!(!protocol.is_audio_channel_opened());
    assert!(wait_until(Duration::from_secs(2), || {
        server.texts().contains(&messages::goodbye("ws-1"))
    }));

    let closed = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| **e == ProtocolEvent::AudioChannelClosed)
        .count();
    assert_eq!(closed, 1);
}

#[test]
fn test_missing_hello_times_out() {
    let server = Server::start(Behavior::Silent);
    let mut protocol = server.protocol();
    let events = recorder(&protocol);

    assert!(!protocol.open_audio_channel());
    assert!(!protocol.is_audio_channel_opened());
    assert_eq!(
        *events.lock().unwrap(),
        [ProtocolEvent::NetworkError("Server timeout".into())]
    );
}

#[test]
fn test_server_hang_up_closes_channel() {
    let server = Server::start(Behavior::HangUp);
    let mut protocol = server.protocol();
    let events = recorder(&protocol);

    assert!(protocol.open_audio_channel());
    assert!(wait_until(Duration::from_secs(2), || {
        !protocol.is_audio_channel_opened()
    }));
    assert_eq!(
        events.lock().unwrap().last(),
        Some(&ProtocolEvent::AudioChannelClosed)
    );

    // already reported by the hang-up
    protocol.close_audio_channel();
    let closed = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| **e == ProtocolEvent::AudioChannelClosed)
        .count();
    assert_eq!(closed, 1);
}

#[test]
fn test_unreachable_server_reports_error() {
    let server = Server::start(Behavior::Echo);
    let mut endpoint = server.endpoint();
    // nothing listens on the discard port
    endpoint.url = "ws://127.0.0.1:9/".into();
    let mut protocol = WebsocketProtocol::new(
        server.runtime.handle().clone(),
        endpoint,
        WebsocketOptions {
            connect_timeout: Duration::from_millis(500),
            ..WebsocketOptions::default()
        },
    );
    let events = recorder(&protocol);

    assert!(!protocol.open_audio_channel());
    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], ProtocolEvent::NetworkError(_)));
}
