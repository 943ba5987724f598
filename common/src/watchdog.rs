/// Hardware watchdog timeout. Missing feeds for longer than this forces an
/// uncontrolled restart regardless of in-flight state.
pub const WATCHDOG_TIMEOUT_MS: u64 = 20_000;

/// Last-resort safety net. Once armed it cannot be suppressed; `feed` must
/// be the first statement of every loop iteration.
pub trait Watchdog {
    fn feed(&mut self);
}
