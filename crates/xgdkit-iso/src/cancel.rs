//! Cooperative cancellation for long-running conversions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::{Error, Result};

/// A token shared between a front-end and a running writer or extractor.
///
/// Writers poll [`CancelToken::checkpoint`] at least once per sector batch.
/// `cancel` makes the next checkpoint fail with [`Error::Cancelled`]; `pause`
/// makes checkpoints block in 100 ms sleeps until cleared.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Flags>,
}

#[derive(Debug, Default)]
struct Flags {
    cancelled: AtomicBool,
    paused: AtomicBool,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Relaxed)
    }

    pub fn set_paused(&self, paused: bool) {
        self.inner.paused.store(paused, Ordering::Relaxed);
    }

    /// Blocks while paused, then fails if cancelled.
    pub fn checkpoint(&self) -> Result<()> {
        while self.inner.paused.load(Ordering::Relaxed) {
            if self.inner.cancelled.load(Ordering::Relaxed) {
                return Err(Error::Cancelled);
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        if self.inner.cancelled.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_passes() {
        let token = CancelToken::new();
        assert!(token.checkpoint().is_ok());
    }

    #[test]
    fn cancelled_token_fails() {
        let token = CancelToken::new();
        token.cancel();
        assert!(matches!(token.checkpoint(), Err(Error::Cancelled)));
    }

    #[test]
    fn cancel_breaks_pause_loop() {
        let token = CancelToken::new();
        token.set_paused(true);
        let waiter = {
            let token = token.clone();
            std::thread::spawn(move || token.checkpoint())
        };
        std::thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert!(matches!(waiter.join().unwrap(), Err(Error::Cancelled)));
    }
}
