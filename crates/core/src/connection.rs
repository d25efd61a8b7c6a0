//! Connection-level policies that do not depend on a transport: the
//! lifecycle states, the handshake gate on outbound traffic, and the
//! reconnect backoff schedule.

use bytes::Bytes;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::warn;
use voice_protocol::ClientMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    Closing,
}

/// One unit of outbound traffic on a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ClientMessage),
    Audio(Bytes),
}

/// Holds application traffic back until the handshake is confirmed.
///
/// Confirmation gates traffic, it never drops it: queued messages are released
/// in submission order. The one exception is captured audio, which is bounded
/// so a long reconnect cannot grow the queue without limit; the oldest audio
/// frames go first.
#[derive(Debug)]
pub struct OutboundGate {
    confirmed: bool,
    queue: VecDeque<Outbound>,
    audio_queued: usize,
    audio_limit: usize,
    audio_dropped: u64,
}

impl OutboundGate {
    pub fn new(audio_limit: usize) -> Self {
        Self {
            confirmed: false,
            queue: VecDeque::new(),
            audio_queued: 0,
            audio_limit,
            audio_dropped: 0,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn audio_dropped(&self) -> u64 {
        self.audio_dropped
    }

    /// Submits traffic. Returns it back when it may be transmitted right away.
    pub fn submit(&mut self, item: Outbound) -> Option<Outbound> {
        if self.confirmed {
            return Some(item);
        }
        if matches!(item, Outbound::Audio(_)) {
            if self.audio_queued >= self.audio_limit {
                self.drop_oldest_audio();
            }
            if self.audio_limit == 0 {
                self.audio_dropped += 1;
                return None;
            }
            self.audio_queued += 1;
        }
        self.queue.push_back(item);
        None
    }

    /// Marks the handshake as confirmed and releases everything held, in order.
    pub fn confirm(&mut self) -> Vec<Outbound> {
        self.confirmed = true;
        self.audio_queued = 0;
        self.queue.drain(..).collect()
    }

    /// The transport went away: traffic is held again until the next confirmation.
    pub fn reset(&mut self) {
        self.confirmed = false;
    }

    /// Drops everything held. Used on explicit close.
    pub fn clear(&mut self) -> usize {
        let n = self.queue.len();
        self.queue.clear();
        self.audio_queued = 0;
        n
    }

    fn drop_oldest_audio(&mut self) {
        if let Some(pos) = self
            .queue
            .iter()
            .position(|item| matches!(item, Outbound::Audio(_)))
        {
            self.queue.remove(pos);
            self.audio_queued -= 1;
            self.audio_dropped += 1;
            if self.audio_dropped == 1 || self.audio_dropped % 100 == 0 {
                warn!(
                    dropped = self.audio_dropped,
                    "Outbound audio queue full while awaiting confirmation, dropping oldest frame"
                );
            }
        }
    }
}

/// Reconnect schedule: one immediate attempt, then bounded exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), or `None` once exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        if attempt == 1 {
            return Some(Duration::ZERO);
        }
        let factor = 1u32.checked_shl(attempt - 2).unwrap_or(u32::MAX);
        Some(self.base_delay.saturating_mul(factor).min(self.max_delay))
    }
}
