use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct ClockState {
    seconds: u64,
    /// Bumped on every reset or stop so a ticker that lost the race cannot count.
    epoch: u64,
}

/// Elapsed-seconds counter for the current song, ticking once per second while running.
#[derive(Debug, Default)]
pub struct PositionClock {
    state: Arc<Mutex<ClockState>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl PositionClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> u64 {
        self.state.lock().seconds
    }

    /// Starts ticking, optionally from an explicit position. Without one the
    /// clock continues from its frozen value.
    pub fn start(&self, initial: Option<u64>) {
        let epoch = {
            let mut state = self.state.lock();
            state.epoch += 1;
            if let Some(seconds) = initial {
                state.seconds = seconds;
            }
            state.epoch
        };

        let state = self.state.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            // First tick fires immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let mut state = state.lock();
                if state.epoch != epoch {
                    break;
                }
                state.seconds += 1;
            }
        });

        if let Some(previous) = self.ticker.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Freezes the clock at its current value.
    pub fn stop(&self) {
        self.state.lock().epoch += 1;
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.abort();
        }
    }

    /// Stops the clock and sets it to `seconds`.
    pub fn reset(&self, seconds: u64) {
        self.stop();
        self.state.lock().seconds = seconds;
    }
}

impl Drop for PositionClock {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.get_mut().take() {
            ticker.abort();
        }
    }
}
