use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use super::{Application, ChatState};
use crate::board::AudioSignals;
use crate::event_group::{EventGroup, SHUTDOWN_EVENT};
use crate::scheduler::TaskQueue;

pub type Task = Box<dyn FnOnce(&mut Application) + Send + 'static>;

/// Encoded frames waiting for the render path.
pub(crate) struct DecodeQueue {
    pub frames: VecDeque<Vec<u8>>,
    pub last_output: Instant,
}

struct Shared {
    events: Arc<EventGroup>,
    tasks: TaskQueue<Task>,
    /// Read-only mirror of the controller's state for other threads.
    state: AtomicU8,
    decode: Mutex<DecodeQueue>,
}

/// Thread-safe entry point into the controller. Everything that mutates
/// session state goes through [`AppHandle::schedule`].
#[derive(Clone)]
pub struct AppHandle {
    shared: Arc<Shared>,
}

impl Default for AppHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl AppHandle {
    pub fn new() -> Self {
        let events = Arc::new(EventGroup::new());
        Self {
            shared: Arc::new(Shared {
                tasks: TaskQueue::new(events.clone()),
                events,
                state: AtomicU8::new(ChatState::Unknown as u8),
                decode: Mutex::new(DecodeQueue {
                    frames: VecDeque::new(),
                    last_output: Instant::now(),
                }),
            }),
        }
    }

    pub fn events(&self) -> Arc<EventGroup> {
        self.shared.events.clone()
    }

    pub fn audio_signals(&self) -> AudioSignals {
        AudioSignals::new(self.shared.events.clone())
    }

    /// Run `task` on the controller thread. Never blocks.
    pub fn schedule<F>(&self, task: F)
    where
        F: FnOnce(&mut Application) + Send + 'static,
    {
        self.shared.tasks.schedule(Box::new(task));
    }

    pub fn toggle_chat_state(&self) {
        self.schedule(|app| app.toggle_chat_state());
    }

    pub fn start_listening(&self) {
        self.schedule(|app| app.start_listening());
    }

    pub fn stop_listening(&self) {
        self.schedule(|app| app.stop_listening());
    }

    pub fn chat_state(&self) -> ChatState {
        ChatState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    /// Server audio is only kept while speaking.
    pub fn enqueue_incoming_audio(&self, frame: Vec<u8>) {
        let mut decode = self.decode_queue();
        if self.chat_state() == ChatState::Speaking {
            decode.frames.push_back(frame);
        }
    }

    pub fn shutdown(&self) {
        self.shared.events.set(SHUTDOWN_EVENT);
    }

    pub(crate) fn publish_state(&self, state: ChatState) {
        self.shared.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn take_tasks(&self) -> VecDeque<Task> {
        self.shared.tasks.take_batch()
    }

    pub(crate) fn decode_queue(&self) -> MutexGuard<'_, DecodeQueue> {
        self.shared
            .decode
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pending_decode_frames(&self) -> usize {
        self.decode_queue().frames.len()
    }
}
