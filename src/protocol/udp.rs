//! Realtime transport: JSON control channel plus an encrypted datagram
//! channel negotiated by the server hello.

use std::net::UdpSocket;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};

use super::messages::{self, ServerHello};
use super::packet::{NONCE_SIZE, PacketOpener, PacketSealer, SessionKeys};
use super::{ControlChannel, ControlEvent, ControlState, EventSink, Protocol, ProtocolEvent};

/// Room for the largest payload the 16-bit length field can describe, plus
/// one byte so a datagram that fills the buffer is known to be truncated.
const RECV_BUFFER_SIZE: usize = NONCE_SIZE + u16::MAX as usize + 1;
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct UdpProtocolOptions {
    pub version: u32,
    pub hello_timeout: Duration,
    pub max_sequence_gap: Option<u32>,
}

impl Default for UdpProtocolOptions {
    fn default() -> Self {
        Self {
            version: 3,
            hello_timeout: Duration::from_secs(10),
            max_sequence_gap: Some(1000),
        }
    }
}

/// Live datagram session. Dropping it stops the receiver thread.
struct AudioChannel {
    socket: Arc<UdpSocket>,
    sealer: PacketSealer,
    running: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
}

impl AudioChannel {
    fn open(hello: &ServerHello, max_gap: Option<u32>, events: EventSink) -> Result<Self> {
        let endpoint = hello
            .udp
            .as_ref()
            .context("Server hello has no udp endpoint")?;
        let keys = SessionKeys::from_hex(&endpoint.key, &endpoint.nonce)?;

        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket
            .connect((endpoint.server.as_str(), endpoint.port))
            .with_context(|| format!("Failed to connect udp {}:{}", endpoint.server, endpoint.port))?;
        socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;
        let socket = Arc::new(socket);

        let running = Arc::new(AtomicBool::new(true));
        let receiver = {
            let socket = socket.clone();
            let running = running.clone();
            let opener = PacketOpener::new(&keys, max_gap);
            thread::Builder::new()
                .name("udp-audio-recv".into())
                .spawn(move || receive_loop(&socket, opener, &running, &events))?
        };

        log::info!("Audio channel udp {}:{} ready", endpoint.server, endpoint.port);
        Ok(Self {
            socket,
            sealer: PacketSealer::new(keys),
            running,
            receiver: Some(receiver),
        })
    }
}

impl Drop for AudioChannel {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.receiver.take() {
            let _ = h.join();
        }
    }
}

fn receive_loop(socket: &UdpSocket, mut opener: PacketOpener, running: &AtomicBool, events: &EventSink) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    while running.load(Ordering::Relaxed) {
        let len = match socket.recv(&mut buf) {
            Ok(len) => len,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                // ICMP unreachable and friends; the session may recover
                log::debug!("udp recv error: {}", e);
                thread::sleep(RECV_POLL_INTERVAL);
                continue;
            }
        };
        if len == buf.len() {
            log::warn!("Dropping truncated audio packet of at least {} bytes", len);
            continue;
        }
        match opener.open(&buf[..len]) {
            Ok(payload) => events.emit(ProtocolEvent::IncomingAudio(payload)),
            Err(e) => log::warn!("Dropping audio packet: {}", e),
        }
    }
}

pub struct UdpProtocol {
    control: Arc<dyn ControlChannel>,
    state: Arc<ControlState>,
    options: UdpProtocolOptions,
    channel: Option<AudioChannel>,
    server_sample_rate: u32,
}

impl UdpProtocol {
    pub fn new(control: Arc<dyn ControlChannel>, options: UdpProtocolOptions) -> Self {
        Self {
            control,
            state: Arc::new(ControlState::new(EventSink::new())),
            options,
            channel: None,
            server_sample_rate: messages::WIRE_SAMPLE_RATE,
        }
    }

    fn ensure_control(&self) -> Result<()> {
        if self.control.is_connected() {
            return Ok(());
        }
        let state = self.state.clone();
        self.control.connect(Arc::new(move |event| match event {
            ControlEvent::Text(text) => state.dispatch(&text),
            ControlEvent::Disconnected => {
                log::warn!("Control channel disconnected");
                // the controller closes the audio channel in response
                state.events.emit(ProtocolEvent::Goodbye);
            }
        }))
    }

    fn handshake(&mut self) -> Result<AudioChannel> {
        self.ensure_control()?;

        self.state.handshake.reset();
        self.control
            .send_text(&messages::hello(self.options.version, "udp"))
            .context("Failed to send hello")?;

        let hello = self
            .state
            .handshake
            .wait(self.options.hello_timeout)
            .context("Server timeout")?;
        if hello.transport.as_deref() != Some("udp") {
            anyhow::bail!("Unsupported transport: {:?}", hello.transport);
        }

        let channel = AudioChannel::open(&hello, self.options.max_sequence_gap, self.state.events.clone())?;
        self.state.set_session_id(hello.session_id.clone().unwrap_or_default());
        if let Some(rate) = hello.sample_rate() {
            self.server_sample_rate = rate;
        }
        Ok(channel)
    }
}

impl Protocol for UdpProtocol {
    fn events(&self) -> &EventSink {
        &self.state.events
    }

    fn open_audio_channel(&mut self) -> bool {
        // a session never outlives its channel
        self.channel = None;

        match self.handshake() {
            Ok(channel) => {
                self.channel = Some(channel);
                self.state.events.emit(ProtocolEvent::AudioChannelOpened {
                    sample_rate: self.server_sample_rate,
                });
                true
            }
            Err(e) => {
                log::error!("Failed to open audio channel: {:#}", e);
                self.state.events.emit(ProtocolEvent::NetworkError(e.to_string()));
                false
            }
        }
    }

    fn close_audio_channel(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        drop(channel);

        let goodbye = messages::goodbye(&self.state.session_id());
        if let Err(e) = self.control.send_text(&goodbye) {
            log::warn!("Failed to send goodbye: {}", e);
        }
        self.state.events.emit(ProtocolEvent::AudioChannelClosed);
    }

    fn is_audio_channel_opened(&self) -> bool {
        self.channel.is_some()
    }

    fn send_audio(&mut self, frame: &[u8]) {
        let Some(channel) = self.channel.as_mut() else {
            return;
        };
        match channel.sealer.seal(frame) {
            Ok(packet) => {
                if let Err(e) = channel.socket.send(&packet) {
                    log::debug!("udp send error: {}", e);
                }
            }
            Err(e) => log::warn!("Dropping outbound audio: {}", e),
        }
    }

    fn send_text(&mut self, text: &str) -> bool {
        match self.control.send_text(text) {
            Ok(()) => true,
            Err(e) => {
                log::error!("Failed to send control message: {}", e);
                false
            }
        }
    }

    fn session_id(&self) -> String {
        self.state.session_id()
    }

    fn server_sample_rate(&self) -> u32 {
        self.server_sample_rate
    }
}
