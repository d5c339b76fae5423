//! Websocket connection pump shared by both transports.
//!
//! The socket lives on the tokio runtime; callers on plain threads talk to
//! it through an unbounded command channel and receive [`LinkEvent`]s on the
//! runtime's worker threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use url::Url;

/// Where and as whom to connect.
#[derive(Debug, Clone)]
pub struct WsEndpoint {
    pub url: String,
    pub token: String,
    pub device_id: String,
    pub client_id: String,
    pub protocol_version: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Text(String),
    Binary(Vec<u8>),
    /// Remote close or socket error. Not sent after a local [`WsLink::close`].
    Disconnected,
}

pub struct WsLink {
    commands: mpsc::UnboundedSender<Message>,
    connected: Arc<AtomicBool>,
    local_close: Arc<AtomicBool>,
}

impl WsLink {
    pub async fn connect<F>(endpoint: &WsEndpoint, on_event: F) -> Result<Self>
    where
        F: Fn(LinkEvent) + Send + Sync + 'static,
    {
        let url = Url::parse(&endpoint.url).context("Invalid websocket url")?;

        // 根据配置构建WebSocket请求
        let mut request = url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", endpoint.token))?,
        );
        headers.insert("Device-Id", HeaderValue::from_str(&endpoint.device_id)?);
        headers.insert("Client-Id", HeaderValue::from_str(&endpoint.client_id)?);
        headers.insert(
            "Protocol-Version",
            HeaderValue::from_str(&endpoint.protocol_version.to_string())?,
        );

        log::info!("Connecting to {}...", url);
        let (ws_stream, _) = connect_async(request)
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;
        log::info!("Connected to {}", url.host_str().unwrap_or_default());

        let (commands, rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        let local_close = Arc::new(AtomicBool::new(false));

        tokio::spawn(pump(
            ws_stream,
            rx,
            connected.clone(),
            local_close.clone(),
            on_event,
        ));

        Ok(Self {
            commands,
            connected,
            local_close,
        })
    }

    /// Connect from a thread outside the runtime.
    pub fn connect_blocking<F>(
        runtime: &Handle,
        endpoint: &WsEndpoint,
        timeout: Duration,
        on_event: F,
    ) -> Result<Self>
    where
        F: Fn(LinkEvent) + Send + Sync + 'static,
    {
        runtime.block_on(async {
            tokio::time::timeout(timeout, Self::connect(endpoint, on_event))
                .await
                .context("Websocket connect timed out")?
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn send_text(&self, text: &str) -> Result<()> {
        self.send(Message::Text(text.to_string().into()))
    }

    pub fn send_binary(&self, data: Vec<u8>) -> Result<()> {
        self.send(Message::Binary(data.into()))
    }

    pub fn close(&self) {
        if self.local_close.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.commands.send(Message::Close(None));
        self.connected.store(false, Ordering::SeqCst);
    }

    fn send(&self, msg: Message) -> Result<()> {
        if !self.is_connected() {
            anyhow::bail!("Websocket is not connected");
        }
        self.commands
            .send(msg)
            .map_err(|_| anyhow::anyhow!("Websocket pump has stopped"))
    }
}

impl Drop for WsLink {
    fn drop(&mut self) {
        self.close();
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn pump<F>(
    ws_stream: WsStream,
    mut commands: mpsc::UnboundedReceiver<Message>,
    connected: Arc<AtomicBool>,
    local_close: Arc<AtomicBool>,
    on_event: F,
) where
    F: Fn(LinkEvent),
{
    let (mut write, mut read) = ws_stream.split();

    // 主循环，处理读取和写入
    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => on_event(LinkEvent::Text(text.to_string())),
                Some(Ok(Message::Binary(data))) => on_event(LinkEvent::Binary(data.to_vec())),
                Some(Ok(Message::Close(frame))) => {
                    log::info!("Server closed connection: {:?}", frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("Websocket read error: {}", e);
                    break;
                }
                None => break,
            },
            cmd = commands.recv() => match cmd {
                Some(Message::Close(frame)) => {
                    let _ = write.send(Message::Close(frame)).await;
                    break;
                }
                Some(msg) => {
                    if let Err(e) = write.send(msg).await {
                        log::warn!("Websocket write error: {}", e);
                        break;
                    }
                }
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }

    connected.store(false, Ordering::SeqCst);
    if !local_close.load(Ordering::SeqCst) {
        on_event(LinkEvent::Disconnected);
    }
}
