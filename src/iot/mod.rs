//! IoT things exposed to the assistant.

pub mod bridge;

use serde_json::{Value, json};

pub use bridge::UdpThingBridge;

pub trait ThingRegistry: Send + Sync {
    fn descriptors_json(&self) -> Value;
    fn states_json(&self) -> Value;
    fn invoke(&self, command: &Value) -> anyhow::Result<()>;
}

/// Registry for boards without things.
pub struct NoThings;

impl ThingRegistry for NoThings {
    fn descriptors_json(&self) -> Value {
        json!([])
    }

    fn states_json(&self) -> Value {
        json!([])
    }

    fn invoke(&self, command: &Value) -> anyhow::Result<()> {
        anyhow::bail!("No thing handles {}", command)
    }
}

/// States to push, if they differ from what was last sent.
pub fn diff_states(last_sent: Option<&Value>, current: &Value) -> Option<Value> {
    match last_sent {
        Some(last) if last == current => None,
        _ => Some(current.clone()),
    }
}
