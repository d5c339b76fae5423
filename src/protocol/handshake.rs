use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use super::messages::ServerHello;

/// One-shot slot the control reader fills with the server hello while the
/// controller thread waits on it.
#[derive(Default)]
pub struct Handshake {
    slot: Mutex<Option<ServerHello>>,
    cond: Condvar,
}

impl Handshake {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget any hello left over from a previous session.
    pub fn reset(&self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn complete(&self, hello: ServerHello) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(hello);
        self.cond.notify_all();
    }

    pub fn wait(&self, timeout: Duration) -> Option<ServerHello> {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut slot, _) = self
            .cond
            .wait_timeout_while(slot, timeout, |s| s.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        slot.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn hello(id: &str) -> ServerHello {
        ServerHello {
            transport: Some("udp".into()),
            session_id: Some(id.into()),
            audio_params: None,
            udp: None,
        }
    }

    #[test]
    fn test_wait_times_out() {
        let handshake = Handshake::new();
        assert!(handshake.wait(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn test_completed_from_other_thread() {
        let handshake = Arc::new(Handshake::new());
        let reader = handshake.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            reader.complete(hello("s1"));
        });
        let got = handshake.wait(Duration::from_secs(5)).unwrap();
        assert_eq!(got.session_id.as_deref(), Some("s1"));
        t.join().unwrap();
    }

    #[test]
    fn test_reset_discards_stale_hello() {
        let handshake = Handshake::new();
        handshake.complete(hello("old"));
        handshake.reset();
        assert!(handshake.wait(Duration::from_millis(10)).is_none());
    }
}
