pub mod broker;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod indicator;
pub mod reading;
pub mod supervisor;
pub mod timesync;
pub mod watchdog;

pub use broker::{BrokerSession, BrokerSessionState, BrokerTransport};
pub use config::{derive_client_id, DeviceConfig, MqttSettings, NetworkSettings};
pub use connectivity::{Association, ConnectivityManager, ConnectivityState, WifiLink};
pub use error::{FaultKind, NodeError};
pub use indicator::{BlinkPattern, Indicator};
pub use reading::{format_timestamp, SensorReading, SensorSample, DEVICE_ID};
pub use supervisor::{LoopAction, LoopState, Recovery, Supervisor, RECONNECT_BACKOFF_S};
pub use timesync::{parse_time_api, ClockSetting, TimeApiResponse, TIME_API_URL};
pub use watchdog::{Watchdog, WATCHDOG_TIMEOUT_MS};
