use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::signal;

use voice_endpoint::application::{AppHandle, Application};
#[cfg(feature = "alsa")]
use voice_endpoint::board::alsa_codec::AlsaAudioCodec;
use voice_endpoint::board::gui_display::{GuiCommand, GuiDisplay};
use voice_endpoint::board::linux::{LinuxBoard, LogDisplay};
use voice_endpoint::board::virtual_codec::{VirtualAudioCodec, VirtualCodecConfig};
use voice_endpoint::board::{AudioCodec, Board, Display};
use voice_endpoint::config::{AudioBackend, Settings, Transport};
use voice_endpoint::identity::Identity;
use voice_endpoint::iot::{NoThings, ThingRegistry, UdpThingBridge};
use voice_endpoint::ota::{self, HttpOta};
use voice_endpoint::protocol::Protocol;
use voice_endpoint::protocol::udp::{UdpProtocol, UdpProtocolOptions};
use voice_endpoint::protocol::websocket::{WebsocketOptions, WebsocketProtocol, WsControlChannel};
use voice_endpoint::protocol::ws_link::WsEndpoint;

/// Render pacing of the virtual codec: one wire frame.
const VIRTUAL_CLOCK: Duration = Duration::from_millis(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let settings = Settings::load()?;
    let identity = Identity::resolve(&settings.device);
    log::info!(
        "{} {} starting, Device-Id {}, Client-Id {}",
        Settings::app_name(),
        Settings::app_version(),
        identity.device_id,
        identity.client_id
    );

    // 启动GUI桥，优先启动，用于显示状态或者激活码
    let (display, gui) = match GuiDisplay::bind(&settings.gui).await {
        Ok(gui) => {
            let gui = Arc::new(gui);
            let display: Arc<dyn Display> = gui.clone();
            (display, Some(gui))
        }
        Err(e) => {
            log::warn!("GUI bridge unavailable, logging display instead: {:#}", e);
            (Arc::new(LogDisplay) as Arc<dyn Display>, None)
        }
    };

    let codec = open_codec(&settings)?;
    codec.set_output_volume(settings.audio.output_volume);
    let board: Arc<dyn Board> = Arc::new(LinuxBoard::new(
        codec.clone(),
        display.clone(),
        identity.client_id.clone(),
    ));

    let handle = AppHandle::new();

    if let Some(gui) = gui {
        let handle = handle.clone();
        tokio::spawn(async move {
            let result = gui
                .run(move |command| match command {
                    GuiCommand::ToggleChat => handle.toggle_chat_state(),
                    GuiCommand::StartListening => handle.start_listening(),
                    GuiCommand::StopListening => handle.stop_listening(),
                })
                .await;
            if let Err(e) = result {
                log::error!("GUI bridge error: {:#}", e);
            }
        });
    }

    // 启动IOT桥，与IOT进程通信
    let things: Arc<dyn ThingRegistry> = match UdpThingBridge::bind(&settings.iot).await {
        Ok(bridge) => {
            let bridge = Arc::new(bridge);
            let runner = bridge.clone();
            tokio::spawn(async move {
                if let Err(e) = runner.run().await {
                    log::error!("IoT bridge error: {:#}", e);
                }
            });
            bridge
        }
        Err(e) => {
            log::warn!("IoT bridge unavailable: {:#}", e);
            Arc::new(NoThings)
        }
    };

    let mut app = Application::new(
        handle.clone(),
        board.clone(),
        settings.session.clone(),
        settings.alerts.clone(),
    )?;
    app.set_protocol(build_protocol(&settings, &identity, Handle::current()));
    app.set_things(things);

    let controller = thread::Builder::new()
        .name("controller".into())
        .spawn(move || -> anyhow::Result<()> {
            app.start()?;
            app.run();
            Ok(())
        })?;

    let updater = Arc::new(HttpOta::new(
        &settings.ota,
        identity.device_id.clone(),
        identity.client_id.clone(),
        board.board_json(),
        Settings::app_version().to_string(),
    ));
    ota::spawn_version_check(updater, handle.clone(), display, codec, &settings.ota);

    {
        let handle = handle.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                log::info!("Received Ctrl+C, shutting down...");
                handle.shutdown();
            }
        });
    }

    match tokio::task::spawn_blocking(move || controller.join()).await? {
        Ok(result) => result,
        Err(_) => anyhow::bail!("Controller thread panicked"),
    }
}

fn open_codec(settings: &Settings) -> anyhow::Result<Arc<dyn AudioCodec>> {
    match settings.audio.backend {
        AudioBackend::Virtual => {
            let codec = Arc::new(VirtualAudioCodec::new(VirtualCodecConfig::from(
                &settings.audio,
            )));
            codec.start_clock(VIRTUAL_CLOCK)?;
            Ok(codec)
        }
        #[cfg(feature = "alsa")]
        AudioBackend::Alsa => Ok(Arc::new(AlsaAudioCodec::open(&settings.audio)?)),
        #[cfg(not(feature = "alsa"))]
        AudioBackend::Alsa => anyhow::bail!("Built without ALSA support, enable the `alsa` feature"),
    }
}

fn build_protocol(settings: &Settings, identity: &Identity, runtime: Handle) -> Box<dyn Protocol> {
    let protocol = &settings.protocol;
    let endpoint = WsEndpoint {
        url: protocol.ws_url.clone(),
        token: protocol.ws_token.clone(),
        device_id: identity.device_id.clone(),
        client_id: identity.client_id.clone(),
        protocol_version: protocol.version,
    };
    log::info!("Using {} transport", protocol.transport.as_str());

    match protocol.transport {
        Transport::Udp => {
            let control = Arc::new(WsControlChannel::new(
                runtime,
                endpoint,
                protocol.connect_timeout(),
            ));
            Box::new(UdpProtocol::new(
                control,
                UdpProtocolOptions {
                    version: protocol.version,
                    hello_timeout: protocol.hello_timeout(),
                    max_sequence_gap: protocol.sequence_gap_limit(),
                },
            ))
        }
        Transport::Websocket => Box::new(WebsocketProtocol::new(
            runtime,
            endpoint,
            WebsocketOptions {
                version: protocol.version,
                connect_timeout: protocol.connect_timeout(),
                hello_timeout: protocol.hello_timeout(),
            },
        )),
    }
}
