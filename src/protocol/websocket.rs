//! Websocket transports.
//!
//! [`WebsocketProtocol`] carries control text and opus binary frames on one
//! connection opened per session. Ordering and delivery come from the
//! stream, so no nonce or sequence framing is applied.
//!
//! [`WsControlChannel`] is the text-only control link used by
//! [`UdpProtocol`](super::udp::UdpProtocol).

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::runtime::Handle;

use super::messages;
use super::ws_link::{LinkEvent, WsEndpoint, WsLink};
use super::{ControlChannel, ControlEvent, ControlHandler, ControlState, EventSink, Protocol, ProtocolEvent};

pub struct WsControlChannel {
    runtime: Handle,
    endpoint: WsEndpoint,
    connect_timeout: Duration,
    link: Mutex<Option<WsLink>>,
}

impl WsControlChannel {
    pub fn new(runtime: Handle, endpoint: WsEndpoint, connect_timeout: Duration) -> Self {
        Self {
            runtime,
            endpoint,
            connect_timeout,
            link: Mutex::new(None),
        }
    }
}

impl ControlChannel for WsControlChannel {
    fn connect(&self, handler: ControlHandler) -> Result<()> {
        let link = WsLink::connect_blocking(
            &self.runtime,
            &self.endpoint,
            self.connect_timeout,
            move |event| match event {
                LinkEvent::Text(text) => handler(ControlEvent::Text(text)),
                LinkEvent::Binary(data) => {
                    log::debug!("Ignoring {} binary bytes on control channel", data.len())
                }
                LinkEvent::Disconnected => handler(ControlEvent::Disconnected),
            },
        )?;
        *self.link.lock().unwrap_or_else(PoisonError::into_inner) = Some(link);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(WsLink::is_connected)
    }

    fn send_text(&self, text: &str) -> Result<()> {
        match self.link.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(link) => link.send_text(text),
            None => anyhow::bail!("Control channel is not connected"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebsocketOptions {
    pub version: u32,
    pub connect_timeout: Duration,
    pub hello_timeout: Duration,
}

impl Default for WebsocketOptions {
    fn default() -> Self {
        Self {
            version: 3,
            connect_timeout: Duration::from_secs(10),
            hello_timeout: Duration::from_secs(10),
        }
    }
}

pub struct WebsocketProtocol {
    runtime: Handle,
    endpoint: WsEndpoint,
    options: WebsocketOptions,
    state: Arc<ControlState>,
    link: Option<WsLink>,
    server_sample_rate: u32,
}

impl WebsocketProtocol {
    pub fn new(runtime: Handle, endpoint: WsEndpoint, options: WebsocketOptions) -> Self {
        Self {
            runtime,
            endpoint,
            options,
            state: Arc::new(ControlState::new(EventSink::new())),
            link: None,
            server_sample_rate: messages::WIRE_SAMPLE_RATE,
        }
    }

    fn connect(&mut self) -> Result<WsLink> {
        self.state.handshake.reset();

        let state = self.state.clone();
        let link = WsLink::connect_blocking(
            &self.runtime,
            &self.endpoint,
            self.options.connect_timeout,
            move |event| match event {
                LinkEvent::Text(text) => state.dispatch(&text),
                LinkEvent::Binary(data) => state.events.emit(ProtocolEvent::IncomingAudio(data)),
                LinkEvent::Disconnected => {
                    log::info!("Websocket disconnected");
                    state.events.emit(ProtocolEvent::AudioChannelClosed);
                }
            },
        )?;

        // 发送Hello消息进行初始化链接
        link.send_text(&messages::hello(self.options.version, "websocket"))
            .context("Failed to send hello")?;

        let hello = self
            .state
            .handshake
            .wait(self.options.hello_timeout)
            .context("Server timeout")?;
        if hello.transport.as_deref() != Some("websocket") {
            anyhow::bail!("Unsupported transport: {:?}", hello.transport);
        }
        self.state.set_session_id(hello.session_id.clone().unwrap_or_default());
        if let Some(rate) = hello.sample_rate() {
            self.server_sample_rate = rate;
        }
        Ok(link)
    }
}

impl Protocol for WebsocketProtocol {
    fn events(&self) -> &EventSink {
        &self.state.events
    }

    fn open_audio_channel(&mut self) -> bool {
        self.link = None;

        match self.connect() {
            Ok(link) => {
                self.link = Some(link);
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
        let Some(link) = self.link.take() else {
            return;
        };
        // a remote close has already reported the channel as closed
        if !link.is_connected() {
            return;
        }
        let goodbye = messages::goodbye(&self.state.session_id());
        if let Err(e) = link.send_text(&goodbye) {
            log::warn!("Failed to send goodbye: {}", e);
        }
        link.close();
        self.state.events.emit(ProtocolEvent::AudioChannelClosed);
    }

    fn is_audio_channel_opened(&self) -> bool {
        self.link.as_ref().is_some_and(WsLink::is_connected)
    }

    fn send_audio(&mut self, frame: &[u8]) {
        if let Some(link) = self.link.as_ref() {
            if let Err(e) = link.send_binary(frame.to_vec()) {
                log::debug!("Dropping outbound audio: {}", e);
            }
        }
    }

    fn send_text(&mut self, text: &str) -> bool {
        let Some(link) = self.link.as_ref() else {
            log::error!("Websocket is not connected");
            return false;
        };
        match link.send_text(text) {
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
