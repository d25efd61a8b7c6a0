//! Activity-driven idle timeout.
//!
//! A single deadline, pushed out by qualifying activity. While resets are
//! suppressed (the agent is thinking or speaking, or the user is mid-utterance)
//! the deadline is cleared entirely, so neither the agent's own turn nor a long
//! user utterance can expire the session. Lifting suppression starts a fresh
//! full-length countdown.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleExpired {
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct IdleTimer {
    timeout: Duration,
    enabled: bool,
    suppressed: bool,
    deadline: Option<Instant>,
}

impl IdleTimer {
    pub fn new(timeout: Duration, enabled: bool) -> Self {
        Self {
            timeout,
            enabled,
            suppressed: false,
            deadline: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    /// Starts (or restarts) the countdown unless disabled or suppressed.
    pub fn arm(&mut self, now: Instant) {
        if self.enabled && !self.suppressed {
            self.deadline = Some(now + self.timeout);
        }
    }

    /// Cancels any pending expiry.
    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    /// Qualifying activity. Returns whether the deadline moved.
    pub fn record_activity(&mut self, now: Instant) -> bool {
        if !self.enabled || self.suppressed {
            return false;
        }
        self.deadline = Some(now + self.timeout);
        true
    }

    pub fn set_suppressed(&mut self, suppressed: bool, now: Instant) {
        if suppressed == self.suppressed {
            return;
        }
        self.suppressed = suppressed;
        if suppressed {
            self.deadline = None;
        } else {
            self.arm(now);
        }
    }

    pub fn set_enabled(&mut self, enabled: bool, now: Instant) {
        if enabled == self.enabled {
            return;
        }
        self.enabled = enabled;
        if enabled {
            self.arm(now);
        } else {
            self.deadline = None;
        }
    }

    /// Reports expiry once; the timer stays disarmed until the next activity.
    pub fn poll(&mut self, now: Instant) -> Option<IdleExpired> {
        let deadline = self.deadline?;
        if !self.enabled || self.suppressed || now < deadline {
            return None;
        }
        self.deadline = None;
        Some(IdleExpired {
            timeout: self.timeout,
        })
    }
}
