//! Sliding-window counter of end-of-stream responses.

use core::time::Duration;
use std::collections::VecDeque;

use tokio::time::Instant;

use crate::config::BlockStreamConfig;

/// Counts end-of-stream responses seen within a time window.
///
/// Entries older than the window are expired on every check, so a burst
/// straddling the window boundary can exceed the nominal rate by one.
#[derive(Debug)]
pub struct EndOfStreamLimiter {
    window: Duration,
    max_events: usize,
    events: VecDeque<Instant>,
}

impl EndOfStreamLimiter {
    #[must_use]
    pub const fn new(window: Duration, max_events: usize) -> Self {
        Self {
            window,
            max_events,
            events: VecDeque::new(),
        }
    }

    #[must_use]
    pub const fn from_config(config: &BlockStreamConfig) -> Self {
        Self::new(config.end_of_stream_window, config.max_end_of_streams)
    }

    /// Records an event at `now`, returns whether the limit is now exceeded.
    pub fn record(&mut self, now: Instant) -> bool {
        while let Some(&oldest) = self.events.front() {
            if now.saturating_duration_since(oldest) <= self.window {
                break;
            }
            let _expired = self.events.pop_front();
        }

        self.events.push_back(now);
        self.events.len() > self.max_events
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
