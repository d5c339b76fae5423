use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::UdpSocket;

use super::Display;
use crate::config::BridgeSettings;

/// Requests the GUI process may send back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuiCommand {
    ToggleChat,
    StartListening,
    StopListening,
}

// GUI进程和Core进程通过本地UDP通信，端口在配置中指定
pub struct GuiDisplay {
    socket: Arc<UdpSocket>,
    /// Display calls come from the controller thread and go out through this.
    sender: StdUdpSocket,
    target_addr: SocketAddr,
    buffer_size: usize,
}

impl GuiDisplay {
    pub async fn bind(settings: &BridgeSettings) -> anyhow::Result<Self> {
        let sender = StdUdpSocket::bind(settings.local_addr())
            .with_context(|| format!("Failed to bind GUI bridge on {}", settings.local_addr()))?;
        sender.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(sender.try_clone()?)?;
        let target_addr = settings
            .remote_addr()
            .parse()
            .with_context(|| format!("Invalid GUI address {}", settings.remote_addr()))?;

        Ok(Self {
            socket: Arc::new(socket),
            sender,
            target_addr,
            buffer_size: settings.buffer_size,
        })
    }

    /// Receive loop for commands from the GUI process.
    pub async fn run<F>(&self, on_command: F) -> anyhow::Result<()>
    where
        F: Fn(GuiCommand),
    {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let (len, _) = self.socket.recv_from(&mut buf).await?;
            match serde_json::from_slice::<GuiCommand>(&buf[..len]) {
                Ok(command) => on_command(command),
                Err(e) => log::warn!("Ignoring GUI message: {}", e),
            }
        }
    }

    fn send(&self, msg: Value) {
        if let Err(e) = self.sender.send_to(msg.to_string().as_bytes(), self.target_addr) {
            log::debug!("Failed to send GUI message: {}", e);
        }
    }
}

impl Display for GuiDisplay {
    fn set_status(&self, status: &str) {
        self.send(json!({"type": "status", "text": status}));
    }

    fn set_emotion(&self, emotion: &str) {
        self.send(json!({"type": "emotion", "emotion": emotion}));
    }

    fn set_chat_message(&self, role: &str, content: &str) {
        self.send(json!({"type": "chat", "role": role, "content": content}));
    }

    fn show_notification(&self, notification: &str) {
        self.send(json!({"type": "toast", "text": notification}));
    }

    fn set_icon(&self, icon: &str) {
        self.send(json!({"type": "icon", "icon": icon}));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn settings(local_port: u16, remote_port: u16) -> BridgeSettings {
        BridgeSettings {
            local_ip: "127.0.0.1".into(),
            local_port,
            remote_ip: "127.0.0.1".into(),
            remote_port,
            buffer_size: 1024,
        }
    }

    #[tokio::test]
    async fn test_display_calls_reach_gui_process() {
        let gui = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let gui_port = gui.local_addr().unwrap().port();
        let display = GuiDisplay::bind(&settings(0, gui_port)).await.unwrap();

        display.set_chat_message("user", "hello");
        let mut buf = [0u8; 256];
        let (len, _) = gui.recv_from(&mut buf).await.unwrap();
        let msg: Value = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(msg, json!({"type": "chat", "role": "user", "content": "hello"}));
    }

    #[tokio::test]
    async fn test_status_burst_arrives_in_order() {
        let gui = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let gui_port = gui.local_addr().unwrap().port();
        let display = GuiDisplay::bind(&settings(0, gui_port)).await.unwrap();

        for status in ["connecting", "listening", "speaking"] {
            display.set_status(status);
        }
        let mut buf = [0u8; 256];
        for status in ["connecting", "listening", "speaking"] {
            let (len, _) = tokio::time::timeout(std::time::Duration::from_secs(2), gui.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            let msg: Value = serde_json::from_slice(&buf[..len]).unwrap();
            assert_eq!(msg, json!({"type": "status", "text": status}));
        }
    }

    #[tokio::test]
    async fn test_commands_from_gui_process() {
        let display = Arc::new(GuiDisplay::bind(&settings(0, 9)).await.unwrap());
        let addr = display.socket.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let runner = {
            let display = display.clone();
            let seen = seen.clone();
            tokio::spawn(async move {
                let _ = display.run(move |c| seen.lock().unwrap().push(c)).await;
            })
        };

        let gui = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        gui.send_to(br#"{"type":"bogus"}"#, addr).await.unwrap();
        gui.send_to(br#"{"type":"toggle_chat"}"#, addr).await.unwrap();

        for _ in 0..100 {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        runner.abort();
        assert_eq!(*seen.lock().unwrap(), vec![GuiCommand::ToggleChat]);
    }
}
