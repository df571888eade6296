use std::collections::VecDeque;
use std::time::Duration;

use bugtrail_core_types::LogRecord;
use serde::Serialize;

/// Connection lifecycle of the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected { recording: bool },
    /// Terminal: reconnect attempts were exhausted.
    Disabled,
}

/// Exponential reconnect delays: `base * 2^attempt`, capped, for a bounded number of attempts.
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or `None` when attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.attempt += 1;
        Some(self.base.saturating_mul(factor).min(self.max))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// Records waiting for the socket. Oldest entries are dropped once full.
#[derive(Debug)]
pub struct RingBuffer {
    items: VecDeque<LogRecord>,
    capacity: usize,
    dropped: u64,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    pub fn push(&mut self, record: LogRecord) {
        if self.items.len() >= self.capacity {
            self.items.pop_front();
            self.dropped += 1;
        }
        self.items.push_back(record);
    }

    pub fn pop(&mut self) -> Option<LogRecord> {
        self.items.pop_front()
    }

    /// Puts an unsent record back at the head. Respects the capacity by dropping the newest.
    pub fn requeue(&mut self, record: LogRecord) {
        if self.items.len() >= self.capacity {
            self.items.pop_back();
            self.dropped += 1;
        }
        self.items.push_front(record);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
