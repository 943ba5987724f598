use crate::error::NodeError;

/// Join attempts before association is declared failed. The reference
/// firmware waited forever and leaned on the watchdog; a bounded budget
/// keeps the failure visible to the boot sequence instead.
pub const DEFAULT_JOIN_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Disconnected,
    Connecting,
    Connected,
}

/// How `ensure_connected` finished. A fresh join earns the confirmation
/// blink; an already-up link does not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Association {
    AlreadyUp(String),
    Joined(String),
}

impl Association {
    pub fn address(&self) -> &str {
        match self {
            Association::AlreadyUp(addr) | Association::Joined(addr) => addr,
        }
    }
}

/// Link-layer seam. `join` blocks for one bounded association attempt;
/// pacing between attempts is the implementation's concern.
pub trait WifiLink {
    fn is_associated(&self) -> bool;
    fn activate(&mut self) -> Result<(), NodeError>;
    fn join(&mut self, ssid: &str, password: &str) -> Result<(), NodeError>;
    fn address(&self) -> Result<String, NodeError>;
}

/// Owns the Wi-Fi association state. Reconnects are driven explicitly by
/// the caller; the manager never retries on its own after returning.
#[derive(Debug)]
pub struct ConnectivityManager {
    state: ConnectivityState,
    max_attempts: u32,
}

impl ConnectivityManager {
    pub fn new() -> Self {
        Self::with_attempts(DEFAULT_JOIN_ATTEMPTS)
    }

    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            state: ConnectivityState::Disconnected,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    /// Idempotent: an already-associated link returns its address without
    /// touching the radio. Otherwise the radio is activated and joined with
    /// the configured credentials, up to the attempt budget. Activation
    /// failure propagates fatally.
    pub fn ensure_connected<L: WifiLink>(
        &mut self,
        link: &mut L,
        ssid: &str,
        password: &str,
    ) -> Result<Association, NodeError> {
        if link.is_associated() {
            self.state = ConnectivityState::Connected;
            return Ok(Association::AlreadyUp(link.address()?));
        }

        link.activate()?;
        self.state = ConnectivityState::Connecting;

        for _attempt in 1..=self.max_attempts {
            if link.join(ssid, password).is_ok() {
                self.state = ConnectivityState::Connected;
                return Ok(Association::Joined(link.address()?));
            }
        }

        self.state = ConnectivityState::Disconnected;
        Err(NodeError::Association {
            attempts: self.max_attempts,
        })
    }
}

impl Default for ConnectivityManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    struct FakeLink {
        associated: bool,
        activated: u32,
        join_calls: u32,
        joins_until_success: Option<u32>,
        fail_activation: bool,
    }

    impl FakeLink {
        fn associated() -> Self {
            Self {
                associated: true,
                activated: 0,
                join_calls: 0,
                joins_until_success: Some(0),
                fail_activation: false,
            }
        }

        fn down(joins_until_success: Option<u32>) -> Self {
            Self {
                associated: false,
                activated: 0,
                join_calls: 0,
                joins_until_success,
                fail_activation: false,
            }
        }
    }

    impl WifiLink for FakeLink {
        fn is_associated(&self) -> bool {
            self.associated
        }

        fn activate(&mut self) -> Result<(), NodeError> {
            if self.fail_activation {
                return Err(NodeError::Transport("radio activation failed".into()));
            }
            self.activated += 1;
            Ok(())
        }

        fn join(&mut self, _ssid: &str, _password: &str) -> Result<(), NodeError> {
            self.join_calls += 1;
            match self.joins_until_success {
                Some(threshold) if self.join_calls > threshold => {
                    self.associated = true;
                    Ok(())
                }
                _ => Err(NodeError::Transport("association timed out".into())),
            }
        }

        fn address(&self) -> Result<String, NodeError> {
            Ok("192.168.1.42".to_string())
        }
    }

    #[test]
    fn already_associated_returns_immediately() {
        let mut manager = ConnectivityManager::new();
        let mut link = FakeLink::associated();

        let result = manager.ensure_connected(&mut link, "net", "pass").unwrap();

        // No radio activation, no join: the blink-worthy path was not taken.
        assert_eq!(result, Association::AlreadyUp("192.168.1.42".into()));
        assert_eq!(link.activated, 0);
        assert_eq!(link.join_calls, 0);
        assert_eq!(manager.state(), ConnectivityState::Connected);
    }

    #[test]
    fn joins_after_retries() {
        let mut manager = ConnectivityManager::new();
        let mut link = FakeLink::down(Some(2));

        let result = manager.ensure_connected(&mut link, "net", "pass").unwrap();

        assert_eq!(result, Association::Joined("192.168.1.42".into()));
        assert_eq!(link.activated, 1);
        assert_eq!(link.join_calls, 3);
        assert_eq!(manager.state(), ConnectivityState::Connected);
    }

    #[test]
    fn attempt_budget_is_bounded() {
        let mut manager = ConnectivityManager::with_attempts(3);
        let mut link = FakeLink::down(None);

        let err = manager.ensure_connected(&mut link, "net", "pass").unwrap_err();

        assert_eq!(link.join_calls, 3);
        assert!(matches!(err, NodeError::Association { attempts: 3 }));
        assert_eq!(manager.state(), ConnectivityState::Disconnected);
    }

    #[test]
    fn activation_failure_propagates() {
        let mut manager = ConnectivityManager::new();
        let mut link = FakeLink::down(Some(0));
        link.fail_activation = true;

        let err = manager.ensure_connected(&mut link, "net", "pass").unwrap_err();

        assert!(err.is_transport());
        assert_eq!(link.join_calls, 0);
    }
}
