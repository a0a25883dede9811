//! Cancellable scheduled task for debounced input.
//!
//! Each new schedule supersedes any pending one, so a stale timer callback
//! can never act on old input. Polled from the cooperative loop; no timer
//! thread.

use crate::clock::WallClock;

pub struct Debouncer<T> {
    delay_ms: u64,
    pending: Option<(T, WallClock)>,
}

impl<T> Debouncer<T> {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            pending: None,
        }
    }

    /// Replace any pending task with this input, restarting the delay.
    pub fn schedule(&mut self, input: T, now: WallClock) {
        self.pending = Some((input, now.saturating_add_ms(self.delay_ms)));
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Yield the input once its delay has elapsed; at most once per schedule.
    pub fn poll(&mut self, now: WallClock) -> Option<T> {
        match &self.pending {
            Some((_, due)) if *due <= now => self.pending.take().map(|(input, _)| input),
            _ => None,
        }
    }
}
