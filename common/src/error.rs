use thiserror::Error;

/// Classification the supervisor uses to pick a recovery path. Transport
/// faults trigger the backoff-and-restart cycle; everything else halts boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Transport,
    Fatal,
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(String),

    /// A steady-state sensor read or payload build failed. Rides the same
    /// restart path as a lost link; sensor init failures never reach here,
    /// they fail the boot sequence directly.
    #[error("sensor failure: {0}")]
    Sensor(String),

    #[error("transport fault: {0}")]
    Transport(String),

    /// A session operation was attempted in a state that forbids it, e.g.
    /// publishing on a session that is not connected.
    #[error("session error: {0}")]
    Session(String),

    #[error("time sync failed: {0}")]
    TimeSync(String),

    #[error("wifi association failed after {attempts} attempt(s)")]
    Association { attempts: u32 },
}

impl NodeError {
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            NodeError::Transport(_) | NodeError::Sensor(_) => FaultKind::Transport,
            _ => FaultKind::Fatal,
        }
    }

    pub fn is_transport(&self) -> bool {
        self.fault_kind() == FaultKind::Transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_map_to_transport_faults() {
        let err = NodeError::Transport("broken pipe".into());
        assert_eq!(err.fault_kind(), FaultKind::Transport);
        assert!(err.is_transport());
    }

    #[test]
    fn sensor_read_fault_takes_the_restart_path() {
        use crate::supervisor::{Recovery, Supervisor, RECONNECT_BACKOFF_S};

        let err = NodeError::Sensor("bme280 read failed: i2c timeout".into());
        assert_eq!(err.fault_kind(), FaultKind::Transport);

        let mut supervisor = Supervisor::new(60);
        supervisor.broker_ready();
        assert_eq!(
            supervisor.fault(err.fault_kind()),
            Recovery::RestartAfter(RECONNECT_BACKOFF_S)
        );
    }

    #[test]
    fn everything_else_is_fatal() {
        let errors = [
            NodeError::Config("missing key".into()),
            NodeError::Session("not connected".into()),
            NodeError::TimeSync("bad datetime".into()),
            NodeError::Association { attempts: 5 },
        ];

        for err in errors {
            assert_eq!(err.fault_kind(), FaultKind::Fatal);
        }
    }
}
