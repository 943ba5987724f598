use crate::error::NodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerSessionState {
    Disconnected,
    Connected,
    Faulted,
}

/// Transport seam over the concrete MQTT client. Implementations report
/// every I/O error; the session decides what it means.
pub trait BrokerTransport {
    fn open(&mut self) -> Result<(), NodeError>;
    fn publish(&mut self, topic: &str, payload: &[u8], qos: u8) -> Result<(), NodeError>;
    /// Non-blocking check for inbound traffic and connection health.
    fn poll(&mut self) -> Result<(), NodeError>;
    fn close(&mut self) -> Result<(), NodeError>;
}

/// Broker session state machine. Publish and poll require a connected
/// session; any transport error moves the session to Faulted, which needs a
/// full `connect()` rather than a retry in place. The session never
/// reconnects on its own — the supervising loop is the sole authority.
#[derive(Debug)]
pub struct BrokerSession<T: BrokerTransport> {
    transport: T,
    state: BrokerSessionState,
}

impl<T: BrokerTransport> BrokerSession<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            state: BrokerSessionState::Disconnected,
        }
    }

    pub fn state(&self) -> BrokerSessionState {
        self.state
    }

    pub fn connect(&mut self) -> Result<(), NodeError> {
        self.transport.open()?;
        self.state = BrokerSessionState::Connected;
        Ok(())
    }

    pub fn publish(&mut self, topic: &str, payload: &[u8], qos: u8) -> Result<(), NodeError> {
        self.require_connected("publish")?;
        self.guard(|transport| transport.publish(topic, payload, qos))
    }

    pub fn poll(&mut self) -> Result<(), NodeError> {
        self.require_connected("poll")?;
        self.guard(|transport| transport.poll())
    }

    /// Best-effort close for shutdown; errors are swallowed so shutdown
    /// never blocks on the network.
    pub fn disconnect(&mut self) {
        let _ = self.transport.close();
        self.state = BrokerSessionState::Disconnected;
    }

    fn require_connected(&self, operation: &str) -> Result<(), NodeError> {
        if self.state != BrokerSessionState::Connected {
            return Err(NodeError::Session(format!(
                "{operation} requires a connected session (state: {:?})",
                self.state
            )));
        }
        Ok(())
    }

    fn guard(
        &mut self,
        op: impl FnOnce(&mut T) -> Result<(), NodeError>,
    ) -> Result<(), NodeError> {
        match op(&mut self.transport) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.state = BrokerSessionState::Faulted;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Default)]
    struct FakeTransport {
        opens: u32,
        publishes: u32,
        polls: u32,
        closes: u32,
        fail_next: bool,
    }

    impl FakeTransport {
        fn result(&mut self) -> Result<(), NodeError> {
            if self.fail_next {
                self.fail_next = false;
                Err(NodeError::Transport("connection reset".into()))
            } else {
                Ok(())
            }
        }
    }

    impl BrokerTransport for FakeTransport {
        fn open(&mut self) -> Result<(), NodeError> {
            self.opens += 1;
            self.result()
        }

        fn publish(&mut self, _topic: &str, _payload: &[u8], _qos: u8) -> Result<(), NodeError> {
            self.publishes += 1;
            self.result()
        }

        fn poll(&mut self) -> Result<(), NodeError> {
            self.polls += 1;
            self.result()
        }

        fn close(&mut self) -> Result<(), NodeError> {
            self.closes += 1;
            self.result()
        }
    }

    #[test]
    fn publish_refused_while_disconnected() {
        let mut session = BrokerSession::new(FakeTransport::default());

        let err = session.publish("t", b"{}", 0).unwrap_err();

        assert!(matches!(err, NodeError::Session(_)));
        // The transport was never touched.
        assert_eq!(session.transport.publishes, 0);
    }

    #[test]
    fn connect_surfaces_open_failure() {
        let mut session = BrokerSession::new(FakeTransport::default());
        session.transport.fail_next = true;

        let err = session.connect().unwrap_err();

        assert!(err.is_transport());
        // A failed open never yields a usable session.
        assert_eq!(session.state(), BrokerSessionState::Disconnected);
        assert!(session.publish("t", b"{}", 0).is_err());
        assert_eq!(session.transport.publishes, 0);
    }

    #[test]
    fn publish_flows_once_connected() {
        let mut session = BrokerSession::new(FakeTransport::default());
        session.connect().unwrap();

        session.publish("t", b"{}", 1).unwrap();
        session.poll().unwrap();

        assert_eq!(session.state(), BrokerSessionState::Connected);
        assert_eq!(session.transport.publishes, 1);
        assert_eq!(session.transport.polls, 1);
    }

    #[test]
    fn transport_error_faults_the_session() {
        let mut session = BrokerSession::new(FakeTransport::default());
        session.connect().unwrap();
        session.transport.fail_next = true;

        let err = session.publish("t", b"{}", 0).unwrap_err();

        assert!(err.is_transport());
        assert_eq!(session.state(), BrokerSessionState::Faulted);
        // Faulted means full reconnect, not retry in place.
        assert!(session.publish("t", b"{}", 0).is_err());
        assert_eq!(session.transport.publishes, 1);
    }

    #[test]
    fn faulted_session_recovers_via_connect() {
        let mut session = BrokerSession::new(FakeTransport::default());
        session.connect().unwrap();
        session.transport.fail_next = true;
        let _ = session.poll();
        assert_eq!(session.state(), BrokerSessionState::Faulted);

        session.connect().unwrap();

        assert_eq!(session.state(), BrokerSessionState::Connected);
        assert_eq!(session.transport.opens, 2);
    }

    #[test]
    fn disconnect_swallows_errors() {
        let mut session = BrokerSession::new(FakeTransport::default());
        session.connect().unwrap();
        session.transport.fail_next = true;

        session.disconnect();

        assert_eq!(session.state(), BrokerSessionState::Disconnected);
        assert_eq!(session.transport.closes, 1);
    }
}
