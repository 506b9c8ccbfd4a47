//! The process-wide control-signal protocol and run-state machine.
//!
//! Control signals form a closed enumeration carried out-of-band on the
//! control bus. The numeric codes are part of the external interface: the
//! three runtime-internal signals use codes 100–102, the four signals with
//! an operating-system mapping reuse the corresponding signal numbers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed enumeration of control signals.
///
/// | code | signal | OS mapping |
/// |-----:|--------|------------|
/// | 100  | `continue_ok` (sentinel, never delivered) | — |
/// | 101  | `exit_ex_controlled` | — |
/// | 102  | `control_reset` | — |
/// | 9    | `exit_ex_immediate` | `SIGKILL` |
/// | 15   | `exit_ok_controlled` | `SIGTERM` |
/// | 10   | `control_pause` | `SIGUSR1` |
/// | 12   | `control_step` | `SIGUSR2` |
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlSignal {
    /// Sentinel returned by tick evaluation; never delivered on the bus.
    ContinueOk,
    /// Drain queues, then exit with failure.
    ExitExControlled,
    /// Re-run component initialization, queues left in place.
    ControlReset,
    /// Terminate now, no drain.
    ExitExImmediate,
    /// Drain queues, then exit with success.
    ExitOkControlled,
    /// Halt tick generation.
    ControlPause,
    /// Advance exactly one tick while paused.
    ControlStep,
}

impl ControlSignal {
    /// The signal's integer code on the control bus.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            ControlSignal::ContinueOk => 100,
            ControlSignal::ExitExControlled => 101,
            ControlSignal::ControlReset => 102,
            ControlSignal::ExitExImmediate => 9,
            ControlSignal::ExitOkControlled => 15,
            ControlSignal::ControlPause => 10,
            ControlSignal::ControlStep => 12,
        }
    }

    /// Decode a control-bus code. Unknown codes are not part of the closed
    /// enumeration and yield `None`.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            100 => Some(ControlSignal::ContinueOk),
            101 => Some(ControlSignal::ExitExControlled),
            102 => Some(ControlSignal::ControlReset),
            9 => Some(ControlSignal::ExitExImmediate),
            15 => Some(ControlSignal::ExitOkControlled),
            10 => Some(ControlSignal::ControlPause),
            12 => Some(ControlSignal::ControlStep),
            _ => None,
        }
    }

    /// True for the three `exit_*` signals.
    #[must_use]
    pub const fn is_exit(self) -> bool {
        matches!(
            self,
            ControlSignal::ExitOkControlled
                | ControlSignal::ExitExControlled
                | ControlSignal::ExitExImmediate
        )
    }

    /// True for exits that drain queues before terminating.
    #[must_use]
    pub const fn drains(self) -> bool {
        matches!(
            self,
            ControlSignal::ExitOkControlled | ControlSignal::ExitExControlled
        )
    }

    /// Process exit code derived from the signal.
    ///
    /// `exit_ok_controlled` → 0, `exit_ex_controlled` → 1,
    /// `exit_ex_immediate` → 137 (128 + SIGKILL). Non-exit signals map to 0.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            ControlSignal::ExitExControlled => 1,
            ControlSignal::ExitExImmediate => 137,
            _ => 0,
        }
    }

    /// Canonical snake_case name, matching the configuration surface.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            ControlSignal::ContinueOk => "continue_ok",
            ControlSignal::ExitExControlled => "exit_ex_controlled",
            ControlSignal::ControlReset => "control_reset",
            ControlSignal::ExitExImmediate => "exit_ex_immediate",
            ControlSignal::ExitOkControlled => "exit_ok_controlled",
            ControlSignal::ControlPause => "control_pause",
            ControlSignal::ControlStep => "control_step",
        }
    }
}

impl fmt::Display for ControlSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Exit code reported when configuration loading or validation fails.
pub const CONFIG_ERROR_EXIT_CODE: i32 = 2;

/// Lifecycle state of a running system (or of one process within it).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    #[default]
    Stopped,
    Running,
    Paused,
    Draining,
}

impl RunState {
    /// Start transition; only meaningful from `Stopped`.
    #[must_use]
    pub fn started(self) -> RunState {
        match self {
            RunState::Stopped => RunState::Running,
            other => other,
        }
    }

    /// Apply a control signal to the state machine.
    ///
    /// `control_pause` toggles between `Running` and `Paused` (the second
    /// pause is the resume that clears the pause flag). `control_step` keeps
    /// the system paused. Draining exits move to `Draining`;
    /// `exit_ex_immediate` goes straight to `Stopped`. `control_reset` from
    /// `Draining` returns to `Running`.
    #[must_use]
    pub fn apply(self, signal: ControlSignal) -> RunState {
        match (self, signal) {
            (_, ControlSignal::ExitExImmediate) => RunState::Stopped,
            (RunState::Running | RunState::Paused, s) if s.drains() => RunState::Draining,
            (RunState::Running, ControlSignal::ControlPause) => RunState::Paused,
            (RunState::Paused, ControlSignal::ControlPause) => RunState::Running,
            (RunState::Paused, ControlSignal::ControlStep) => RunState::Paused,
            (RunState::Draining, ControlSignal::ControlReset) => RunState::Running,
            (state, _) => state,
        }
    }

    /// Drain completed; only meaningful from `Draining`.
    #[must_use]
    pub fn drained(self) -> RunState {
        match self {
            RunState::Draining => RunState::Stopped,
            other => other,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunState::Stopped => "stopped",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Draining => "draining",
        };
        write!(f, "{label}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for signal in [
            ControlSignal::ContinueOk,
            ControlSignal::ExitExControlled,
            ControlSignal::ControlReset,
            ControlSignal::ExitExImmediate,
            ControlSignal::ExitOkControlled,
            ControlSignal::ControlPause,
            ControlSignal::ControlStep,
        ] {
            assert_eq!(ControlSignal::from_code(signal.code()), Some(signal));
        }
        assert_eq!(ControlSignal::from_code(0), None);
    }

    #[test]
    fn exit_codes_match_interface() {
        assert_eq!(ControlSignal::ExitOkControlled.exit_code(), 0);
        assert_eq!(ControlSignal::ExitExControlled.exit_code(), 1);
        assert_eq!(ControlSignal::ExitExImmediate.exit_code(), 137);
        assert_eq!(CONFIG_ERROR_EXIT_CODE, 2);
    }

    #[test]
    fn pause_toggles_and_step_stays_paused() {
        let state = RunState::Stopped.started();
        let state = state.apply(ControlSignal::ControlPause);
        assert_eq!(state, RunState::Paused);
        assert_eq!(state.apply(ControlSignal::ControlStep), RunState::Paused);
        assert_eq!(state.apply(ControlSignal::ControlPause), RunState::Running);
    }

    #[test]
    fn exits_drain_except_immediate() {
        let running = RunState::Running;
        assert_eq!(
            running.apply(ControlSignal::ExitOkControlled),
            RunState::Draining
        );
        assert_eq!(
            running.apply(ControlSignal::ExitExImmediate),
            RunState::Stopped
        );
        assert_eq!(
            RunState::Draining.apply(ControlSignal::ControlReset),
            RunState::Running
        );
        assert_eq!(RunState::Draining.drained(), RunState::Stopped);
    }
}
