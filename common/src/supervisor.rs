use crate::error::FaultKind;

/// Fixed pause before a transport fault escalates to a full restart.
pub const RECONNECT_BACKOFF_S: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    AwaitingBroker,
    Running,
    Faulted,
    Reconnecting,
}

/// One iteration's work, in execution order. The shell runs the actions
/// front to back and abandons the rest of the iteration on the first fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    FeedWatchdog,
    PollBroker,
    /// Read the sensor, build and stage the payload, publish it, pulse the
    /// indicator, then report back via `published`.
    PublishReading,
}

/// What the shell must do after a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Sleep for the given number of seconds, then perform a full restart
    /// and let the boot sequence redo everything.
    RestartAfter(u64),
    /// Unrecoverable; stop the node.
    Halt,
}

/// The sampling-publish loop as a state machine. The supervisor owns the
/// interval clock and the loop state; the shell owns the collaborators and
/// executes the actions each tick emits.
///
/// The interval clock starts at zero, so the first reading publishes on the
/// first due tick after the broker comes up.
#[derive(Debug)]
pub struct Supervisor {
    interval_s: u64,
    state: LoopState,
    last_publish_s: u64,
}

impl Supervisor {
    pub fn new(interval_s: u64) -> Self {
        Self {
            interval_s,
            state: LoopState::AwaitingBroker,
            last_publish_s: 0,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn last_publish(&self) -> u64 {
        self.last_publish_s
    }

    /// The broker session is connected; start (or resume) steady state.
    pub fn broker_ready(&mut self) {
        self.state = LoopState::Running;
    }

    /// Plans one iteration. The watchdog feed is unconditionally first:
    /// it must happen even while waiting for the broker or mid-recovery.
    pub fn tick(&mut self, now_s: u64) -> Vec<LoopAction> {
        let mut actions = vec![LoopAction::FeedWatchdog];

        if self.state != LoopState::Running {
            return actions;
        }

        actions.push(LoopAction::PollBroker);

        if now_s.saturating_sub(self.last_publish_s) >= self.interval_s {
            actions.push(LoopAction::PublishReading);
        }

        actions
    }

    /// Records a successful publish. Called only after the broker accepted
    /// the payload, so a failed publish never advances the interval clock.
    pub fn published(&mut self, now_s: u64) {
        self.last_publish_s = now_s;
    }

    /// Dispatches a fault by kind. Transport faults go through Faulted into
    /// Reconnecting and ask the shell for the backoff-then-restart cycle;
    /// anything else is unrecoverable.
    pub fn fault(&mut self, kind: FaultKind) -> Recovery {
        match kind {
            FaultKind::Transport => {
                self.state = LoopState::Reconnecting;
                Recovery::RestartAfter(RECONNECT_BACKOFF_S)
            }
            FaultKind::Fatal => {
                self.state = LoopState::Faulted;
                Recovery::Halt
            }
        }
    }
}
