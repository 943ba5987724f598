/// On/off cycles driven on the onboard LED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlinkPattern {
    pub times: u32,
    pub interval_ms: u64,
}

/// Wi-Fi association succeeded.
pub const WIFI_CONFIRM: BlinkPattern = BlinkPattern {
    times: 3,
    interval_ms: 200,
};

/// Broker session established.
pub const BROKER_CONFIRM: BlinkPattern = BlinkPattern {
    times: 3,
    interval_ms: 200,
};

/// One reading published.
pub const PUBLISH_PULSE: BlinkPattern = BlinkPattern {
    times: 1,
    interval_ms: 100,
};

/// The loop exited on an interrupt signal.
pub const SHUTDOWN_BURST: BlinkPattern = BlinkPattern {
    times: 10,
    interval_ms: 100,
};

/// Onboard indicator seam. The LED is driven off at boot and otherwise only
/// through blink patterns.
pub trait Indicator {
    fn set(&mut self, on: bool);
    fn blink(&mut self, pattern: BlinkPattern);
}
