//! Voice-activity reconciliation across the agent and transcription channels.
//!
//! Both channels may report the user starting and stopping; the transcription
//! channel additionally reports a word-timing based utterance end. The policy:
//!
//! - the first speech-start of an utterance opens it, later starts are duplicates;
//! - an utterance-end closes it immediately and is authoritative;
//! - an explicit speech-end only arms a fallback: if no utterance-end arrives
//!   within the fallback window the utterance is closed on its behalf;
//! - the agent taking its turn settles an armed fallback early, so speech that
//!   follows is a new utterance rather than a resumption of the old one;
//! - once an utterance is closed, further end signals for it are no-ops;
//! - opposing signals from different sources within the conflict window are
//!   reported, but never change the decision above.

use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VadSource {
    AgentChannel,
    TranscriptionChannel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VadSignalKind {
    SpeechStarted,
    SpeechEnded,
    UtteranceEnd,
}

impl VadSignalKind {
    fn is_start(&self) -> bool {
        matches!(self, VadSignalKind::SpeechStarted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VadSignal {
    pub source: VadSource,
    pub kind: VadSignalKind,
    pub at: Instant,
}

impl VadSignal {
    pub fn new(source: VadSource, kind: VadSignalKind, at: Instant) -> Self {
        Self { source, kind, at }
    }
}

/// How the end of an utterance was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndResolution {
    UtteranceEnd,
    SpeechEndFallback,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VadDecision {
    UserStartedSpeaking {
        utterance: u64,
        source: VadSource,
    },
    UserStoppedSpeaking {
        utterance: u64,
        source: VadSource,
        resolution: EndResolution,
    },
    Conflict {
        earlier: VadSignal,
        later: VadSignal,
    },
}

#[derive(Debug)]
struct Utterance {
    id: u64,
    ended: bool,
    /// Armed by an explicit speech-end: (source, deadline).
    fallback: Option<(VadSource, Instant)>,
}

#[derive(Debug)]
pub struct VadReconciler {
    fallback_window: Duration,
    conflict_window: Duration,
    current: Option<Utterance>,
    last_signal: Option<VadSignal>,
    next_id: u64,
}

impl VadReconciler {
    pub fn new(fallback_window: Duration, conflict_window: Duration) -> Self {
        Self {
            fallback_window,
            conflict_window,
            current: None,
            last_signal: None,
            next_id: 1,
        }
    }

    /// True from the first speech-start until the utterance is decided over.
    pub fn user_speaking(&self) -> bool {
        self.current.as_ref().is_some_and(|u| !u.ended)
    }

    /// When [`poll`](Self::poll) next has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.current
            .as_ref()
            .filter(|u| !u.ended)
            .and_then(|u| u.fallback.map(|(_, deadline)| deadline))
    }

    pub fn observe(&mut self, signal: VadSignal) -> Vec<VadDecision> {
        let mut decisions = Vec::new();

        if let Some(earlier) = self.last_signal {
            let opposing = earlier.kind.is_start() != signal.kind.is_start();
            let close = signal.at.saturating_duration_since(earlier.at) <= self.conflict_window;
            if opposing && close && earlier.source != signal.source {
                decisions.push(VadDecision::Conflict {
                    earlier,
                    later: signal,
                });
            }
        }
        self.last_signal = Some(signal);

        match signal.kind {
            VadSignalKind::SpeechStarted => match self.current.as_mut() {
                Some(utterance) if !utterance.ended => {
                    // Speech resumed before the fallback fired: same utterance.
                    utterance.fallback = None;
                }
                _ => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.current = Some(Utterance {
                        id,
                        ended: false,
                        fallback: None,
                    });
                    decisions.push(VadDecision::UserStartedSpeaking {
                        utterance: id,
                        source: signal.source,
                    });
                }
            },
            VadSignalKind::SpeechEnded => {
                if let Some(utterance) = self.current.as_mut().filter(|u| !u.ended) {
                    if utterance.fallback.is_none() {
                        utterance.fallback =
                            Some((signal.source, signal.at + self.fallback_window));
                    }
                }
            }
            VadSignalKind::UtteranceEnd => {
                if let Some(utterance) = self.current.as_mut().filter(|u| !u.ended) {
                    utterance.ended = true;
                    utterance.fallback = None;
                    decisions.push(VadDecision::UserStoppedSpeaking {
                        utterance: utterance.id,
                        source: signal.source,
                        resolution: EndResolution::UtteranceEnd,
                    });
                }
            }
        }
        decisions
    }

    /// Fires the speech-end fallback once its window has passed without an utterance-end.
    pub fn poll(&mut self, now: Instant) -> Option<VadDecision> {
        let utterance = self.current.as_mut().filter(|u| !u.ended)?;
        let (source, deadline) = utterance.fallback?;
        if now < deadline {
            return None;
        }
        utterance.ended = true;
        utterance.fallback = None;
        Some(VadDecision::UserStoppedSpeaking {
            utterance: utterance.id,
            source,
            resolution: EndResolution::SpeechEndFallback,
        })
    }

    /// Closes an utterance that is only waiting out its speech-end fallback.
    ///
    /// Called when the agent starts its reply: the user's turn is over even if
    /// the fallback window has not elapsed.
    pub fn settle(&mut self) -> Option<VadDecision> {
        let utterance = self.current.as_mut().filter(|u| !u.ended)?;
        let (source, _) = utterance.fallback?;
        utterance.ended = true;
        utterance.fallback = None;
        Some(VadDecision::UserStoppedSpeaking {
            utterance: utterance.id,
            source,
            resolution: EndResolution::SpeechEndFallback,
        })
    }

    pub fn reset(&mut self) {
        self.current = None;
        self.last_signal = None;
    }
}
