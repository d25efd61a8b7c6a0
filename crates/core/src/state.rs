//! The conversational state machine.
//!
//! It is the single writer of [`AgentState`]. Other components submit
//! [`Trigger`]s and receive back the transitions that actually happened.
//!
//! Speaking ends on *playback* completion, not on synthesis completion: the
//! service can finish synthesizing seconds before the last queued frame is
//! heard. Completions carry the utterance they belong to so that a stale one
//! cannot end a newer utterance.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Listening,
    Thinking,
    Speaking,
    EnteringSleep,
    Sleeping,
}

impl AgentState {
    /// States during which idle-timer resets are suppressed.
    pub fn suppresses_idle_reset(&self) -> bool {
        matches!(self, AgentState::Thinking | AgentState::Speaking)
    }

    pub fn is_asleep(&self) -> bool {
        matches!(self, AgentState::EnteringSleep | AgentState::Sleeping)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentState::Idle => "idle",
            AgentState::Listening => "listening",
            AgentState::Thinking => "thinking",
            AgentState::Speaking => "speaking",
            AgentState::EnteringSleep => "entering_sleep",
            AgentState::Sleeping => "sleeping",
        };
        f.write_str(name)
    }
}

/// An input that may move the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    UserSpeechStarted,
    AgentThinking,
    AgentSpeechStarted { utterance: u64 },
    /// The playback pipeline rendered the last frame of `utterance`.
    PlaybackCompleted { utterance: u64 },
    /// Accepted from any awake state, not only idle. Sleeping itself is only
    /// ever entered from entering_sleep, and only once `audio_outstanding` is
    /// false or [`AudioDrained`](Trigger::AudioDrained) follows, so a request
    /// mid-turn lets the agent finish its utterance instead of cutting it off.
    SleepRequested { audio_outstanding: bool },
    /// The last utterance has been synthesized and fully played.
    AudioDrained,
    Wake,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: AgentState,
    pub to: AgentState,
}

#[derive(Debug)]
pub struct StateMachine {
    state: AgentState,
    speaking_utterance: Option<u64>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: AgentState::Idle,
            speaking_utterance: None,
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// The utterance whose playback completion will end the current speaking state.
    pub fn speaking_utterance(&self) -> Option<u64> {
        self.speaking_utterance
    }

    /// Applies a trigger and returns every transition it caused, in order.
    pub fn apply(&mut self, trigger: Trigger) -> Vec<Transition> {
        use AgentState::*;

        let mut transitions = Vec::new();
        match (self.state, trigger) {
            (Sleeping | EnteringSleep, Trigger::Wake) => self.go(Idle, &mut transitions),
            // Asleep: nothing but a wake or the final drain moves us.
            (EnteringSleep, Trigger::AudioDrained) => self.go(Sleeping, &mut transitions),
            (Sleeping | EnteringSleep, _) => {}

            (_, Trigger::SleepRequested { audio_outstanding }) => {
                self.go(EnteringSleep, &mut transitions);
                if !audio_outstanding {
                    self.go(Sleeping, &mut transitions);
                }
            }

            (Listening, Trigger::UserSpeechStarted) => {}
            (_, Trigger::UserSpeechStarted) => self.go(Listening, &mut transitions),

            (Idle | Listening, Trigger::AgentThinking) => self.go(Thinking, &mut transitions),
            (_, Trigger::AgentThinking) => {}

            (Speaking, Trigger::AgentSpeechStarted { utterance }) => {
                self.speaking_utterance = Some(utterance);
            }
            (_, Trigger::AgentSpeechStarted { utterance }) => {
                self.go(Speaking, &mut transitions);
                self.speaking_utterance = Some(utterance);
            }

            (Speaking, Trigger::PlaybackCompleted { utterance })
                if self.speaking_utterance == Some(utterance) =>
            {
                self.go(Idle, &mut transitions)
            }
            (_, Trigger::PlaybackCompleted { .. }) => {}

            (_, Trigger::AudioDrained) | (_, Trigger::Wake) => {}
        }
        transitions
    }

    fn go(&mut self, to: AgentState, transitions: &mut Vec<Transition>) {
        if self.state == to {
            return;
        }
        if to != AgentState::Speaking {
            self.speaking_utterance = None;
        }
        transitions.push(Transition {
            from: self.state,
            to,
        });
        self.state = to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AgentState::*;

    fn states(transitions: &[Transition]) -> Vec<AgentState> {
        transitions.iter().map(|t| t.to).collect()
    }

    #[test]
    fn test_full_turn() {
        let mut machine = StateMachine::new();
        assert_eq!(machine.state(), Idle);

        assert_eq!(states(&machine.apply(Trigger::UserSpeechStarted)), vec![Listening]);
        assert_eq!(states(&machine.apply(Trigger::AgentThinking)), vec![Thinking]);
        assert_eq!(
            states(&machine.apply(Trigger::AgentSpeechStarted { utterance: 1 })),
            vec![Speaking]
        );
        assert_eq!(
            states(&machine.apply(Trigger::PlaybackCompleted { utterance: 1 })),
            vec![Idle]
        );
    }

    #[test]
    fn test_stale_completion_is_ignored() {
        let mut machine = StateMachine::new();
        machine.apply(Trigger::AgentSpeechStarted { utterance: 1 });
        machine.apply(Trigger::AgentSpeechStarted { utterance: 2 });

        assert!(machine.apply(Trigger::PlaybackCompleted { utterance: 1 }).is_empty());
        assert_eq!(machine.state(), Speaking);

        machine.apply(Trigger::PlaybackCompleted { utterance: 2 });
        assert_eq!(machine.state(), Idle);
    }

    #[test]
    fn test_thinking_does_not_rewind_speaking() {
        let mut machine = StateMachine::new();
        machine.apply(Trigger::AgentSpeechStarted { utterance: 1 });
        assert!(machine.apply(Trigger::AgentThinking).is_empty());
        assert_eq!(machine.state(), Speaking);
    }

    #[test]
    fn test_barge_in_moves_to_listening_and_drops_utterance() {
        let mut machine = StateMachine::new();
        machine.apply(Trigger::AgentSpeechStarted { utterance: 3 });
        assert_eq!(states(&machine.apply(Trigger::UserSpeechStarted)), vec![Listening]);
        assert_eq!(machine.speaking_utterance(), None);

        // The interrupted utterance's completion arrives late.
        assert!(machine.apply(Trigger::PlaybackCompleted { utterance: 3 }).is_empty());
        assert_eq!(machine.state(), Listening);
    }

    #[test]
    fn test_sleep_waits_for_outstanding_audio() {
        let mut machine = StateMachine::new();
        machine.apply(Trigger::AgentSpeechStarted { utterance: 1 });

        let t = machine.apply(Trigger::SleepRequested {
            audio_outstanding: true,
        });
        assert_eq!(states(&t), vec![EnteringSleep]);

        // Activity while entering sleep is ignored.
        assert!(machine.apply(Trigger::UserSpeechStarted).is_empty());
        assert!(machine.apply(Trigger::AgentThinking).is_empty());

        assert_eq!(states(&machine.apply(Trigger::AudioDrained)), vec![Sleeping]);
        assert_eq!(states(&machine.apply(Trigger::Wake)), vec![Idle]);
    }

    #[test]
    fn test_sleep_without_audio_goes_straight_through() {
        let mut machine = StateMachine::new();
        let t = machine.apply(Trigger::SleepRequested {
            audio_outstanding: false,
        });
        assert_eq!(
            t,
            vec![
                Transition { from: Idle, to: EnteringSleep },
                Transition { from: EnteringSleep, to: Sleeping },
            ]
        );
        // A second request while asleep changes nothing.
        assert!(machine
            .apply(Trigger::SleepRequested { audio_outstanding: false })
            .is_empty());
    }

    #[test]
    fn test_sleep_mid_turn_never_skips_entering_sleep() {
        for setup in [
            Trigger::UserSpeechStarted,
            Trigger::AgentThinking,
            Trigger::AgentSpeechStarted { utterance: 1 },
        ] {
            let mut machine = StateMachine::new();
            machine.apply(setup);
            let t = machine.apply(Trigger::SleepRequested {
                audio_outstanding: true,
            });
            assert_eq!(states(&t), vec![EnteringSleep]);
            assert!(machine.apply(Trigger::PlaybackCompleted { utterance: 1 }).is_empty());

            let t = machine.apply(Trigger::AudioDrained);
            assert_eq!(t, vec![Transition { from: EnteringSleep, to: Sleeping }]);
        }
    }

    #[test]
    fn test_wake_while_awake_is_noop() {
        let mut machine = StateMachine::new();
        assert!(machine.apply(Trigger::Wake).is_empty());
        assert_eq!(machine.state(), Idle);
    }

    #[test]
    fn test_suppression_states() {
        assert!(Thinking.suppresses_idle_reset());
        assert!(Speaking.suppresses_idle_reset());
        assert!(!Idle.suppresses_idle_reset());
        assert!(!Listening.suppresses_idle_reset());
        assert_eq!(EnteringSleep.to_string(), "entering_sleep");
    }
}
