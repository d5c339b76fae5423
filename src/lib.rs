//! Voice assistant endpoint: a single-threaded session controller driving
//! duplex Opus audio over an encrypted datagram or websocket session.

pub mod application;
pub mod audio;
pub mod background_task;
pub mod board;
pub mod config;
pub mod event_group;
pub mod frontend;
pub mod identity;
pub mod iot;
pub mod ota;
pub mod protocol;
pub mod scheduler;

pub use application::{AppHandle, Application, ChatState};
pub use config::Settings;
