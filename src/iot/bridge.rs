use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::UdpSocket;

use super::ThingRegistry;
use crate::config::BridgeSettings;

/// What the IoT process reports about its things.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum IotReport {
    Descriptors { descriptors: Value },
    States { states: Value },
}

/// Mirrors things owned by a separate IoT process over local UDP.
pub struct UdpThingBridge {
    socket: Arc<UdpSocket>,
    /// Same socket, for sends from threads outside the runtime.
    sender: StdUdpSocket,
    target_addr: SocketAddr,
    buffer_size: usize,
    descriptors: Mutex<Value>,
    states: Mutex<Value>,
}

impl UdpThingBridge {
    pub async fn bind(settings: &BridgeSettings) -> anyhow::Result<Self> {
        let sender = StdUdpSocket::bind(settings.local_addr())
            .with_context(|| format!("Failed to bind IoT bridge on {}", settings.local_addr()))?;
        sender.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(sender.try_clone()?)?;
        let target_addr = settings
            .remote_addr()
            .parse()
            .with_context(|| format!("Invalid IoT address {}", settings.remote_addr()))?;

        Ok(Self {
            socket: Arc::new(socket),
            sender,
            target_addr,
            buffer_size: settings.buffer_size,
            descriptors: Mutex::new(json!([])),
            states: Mutex::new(json!([])),
        })
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let (len, _) = self.socket.recv_from(&mut buf).await?;
            self.handle_report(&buf[..len]);
        }
    }

    fn handle_report(&self, data: &[u8]) {
        match serde_json::from_slice::<IotReport>(data) {
            Ok(IotReport::Descriptors { descriptors }) => {
                *self.descriptors.lock().unwrap_or_else(PoisonError::into_inner) = descriptors;
            }
            Ok(IotReport::States { states }) => {
                *self.states.lock().unwrap_or_else(PoisonError::into_inner) = states;
            }
            Err(e) => log::warn!("Ignoring IoT message: {}", e),
        }
    }
}

impl ThingRegistry for UdpThingBridge {
    fn descriptors_json(&self) -> Value {
        self.descriptors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn states_json(&self) -> Value {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn invoke(&self, command: &Value) -> anyhow::Result<()> {
        let msg = json!({"type": "command", "command": command});
        // a local datagram send does not wait on the reactor
        self.sender
            .send_to(msg.to_string().as_bytes(), self.target_addr)
            .context("Failed to forward IoT command")?;
        Ok(())
    }
}
