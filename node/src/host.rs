use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use rumqttc::{Client, Event, MqttOptions, Packet, QoS};
use tracing::{debug, info, warn};

use marbian_common::{
    format_timestamp,
    indicator::{BROKER_CONFIRM, PUBLISH_PULSE, SHUTDOWN_BURST, WIFI_CONFIRM},
    Association, BlinkPattern, BrokerSession, BrokerTransport, ConnectivityManager, DeviceConfig,
    Indicator, LoopAction, NodeError, Recovery, SensorReading, SensorSample, Supervisor, Watchdog,
    WifiLink, WATCHDOG_TIMEOUT_MS,
};

const MQTT_PORT: u16 = 1883;
const BROKER_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const STAGED_READING_FILE: &str = "bme_data.json";

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path =
        std::env::var("MARBIAN_CONFIG").unwrap_or_else(|_| "config.json".to_string());
    let raw = std::fs::read_to_string(&config_path)
        .with_context(|| format!("failed to read config at {config_path}"))?;
    let config = DeviceConfig::from_json(&raw)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received; stopping after this iteration");
                shutdown.store(true, Ordering::Relaxed);
            }
        });
    }

    // The supervised loop is a single blocking cooperative control flow;
    // the shutdown flag is checked only between iterations.
    tokio::task::spawn_blocking(move || supervise(config, shutdown)).await?
}

fn supervise(config: DeviceConfig, shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    let mut indicator = LogIndicator;
    indicator.set(false);

    let mut connectivity = ConnectivityManager::new();
    let mut wifi = HostWifi;
    match connectivity.ensure_connected(
        &mut wifi,
        &config.network.ssid,
        &config.network.password,
    )? {
        Association::Joined(addr) => {
            info!("wifi associated at {addr}");
            indicator.blink(WIFI_CONFIRM);
        }
        Association::AlreadyUp(addr) => info!("wifi already associated at {addr}"),
    }

    // The device target fetches network time here; the host trusts the
    // system clock.
    info!("clock source: system time");

    let mut session = BrokerSession::new(HostBroker::start(&config)?);
    let mut supervisor = Supervisor::new(config.mqtt.msg_interval);

    if let Err(err) = session.connect() {
        warn!("broker connect failed: {err}");
        return recover(supervisor.fault(err.fault_kind()));
    }
    indicator.blink(BROKER_CONFIRM);
    supervisor.broker_ready();
    info!("broker session up; publishing to {}", config.mqtt.topic_pub);

    let mut watchdog = SoftWatchdog::new();
    let mut sensor = SimulatedBme280::new();
    let boot = Instant::now();

    while !shutdown.load(Ordering::Relaxed) {
        let now_s = boot.elapsed().as_secs();
        let mut fault = None;

        for action in supervisor.tick(now_s) {
            let result = match action {
                LoopAction::FeedWatchdog => {
                    watchdog.feed();
                    Ok(())
                }
                LoopAction::PollBroker => session.poll(),
                LoopAction::PublishReading => {
                    publish_reading(&config, &mut session, &mut sensor, &mut indicator)
                        .map(|()| supervisor.published(now_s))
                }
            };

            if let Err(err) = result {
                warn!("iteration fault: {err}");
                fault = Some(err.fault_kind());
                break;
            }
        }

        if let Some(kind) = fault {
            return recover(supervisor.fault(kind));
        }

        thread::sleep(Duration::from_secs(1));
    }

    // Interrupt path: best-effort close, then the distinctive stop pattern.
    session.disconnect();
    indicator.blink(SHUTDOWN_BURST);
    info!("logger stopped");
    Ok(())
}

fn publish_reading(
    config: &DeviceConfig,
    session: &mut BrokerSession<HostBroker>,
    sensor: &mut SimulatedBme280,
    indicator: &mut LogIndicator,
) -> Result<(), NodeError> {
    let sample = sensor.read()?;
    let timestamp = format_timestamp(&chrono::Local::now().naive_local());
    let reading = SensorReading::from_sample(sample, timestamp);
    let payload = reading.payload()?;

    stage_payload(&payload)?;
    session.publish(&config.mqtt.topic_pub, &payload, config.mqtt.qos)?;
    info!(
        "published {} bytes to {}",
        payload.len(),
        config.mqtt.topic_pub
    );
    indicator.blink(PUBLISH_PULSE);
    Ok(())
}

/// The last serialized reading is staged on disk before the publish, like
/// the flash staging file on the device. Staging I/O failures are
/// transport-class: they ride the same restart path.
fn stage_payload(payload: &[u8]) -> Result<(), NodeError> {
    std::fs::write(STAGED_READING_FILE, payload)
        .map_err(|err| NodeError::Transport(format!("failed to stage reading: {err}")))
}

fn recover(recovery: Recovery) -> anyhow::Result<()> {
    match recovery {
        Recovery::RestartAfter(backoff_s) => {
            warn!("transport fault; restarting in {backoff_s}s");
            thread::sleep(Duration::from_secs(backoff_s));
            // Hosted target: exit and let the process supervisor boot us
            // again, standing in for the device's hardware reset.
            anyhow::bail!("restart requested after transport fault")
        }
        Recovery::Halt => anyhow::bail!("unrecoverable fault"),
    }
}

/// The host has no radio; the link reports as already associated so the
/// boot sequence takes the idempotent path.
struct HostWifi;

impl WifiLink for HostWifi {
    fn is_associated(&self) -> bool {
        true
    }

    fn activate(&mut self) -> Result<(), NodeError> {
        Ok(())
    }

    fn join(&mut self, _ssid: &str, _password: &str) -> Result<(), NodeError> {
        Ok(())
    }

    fn address(&self) -> Result<String, NodeError> {
        Ok("127.0.0.1".to_string())
    }
}

/// Soft stand-in for the hardware watchdog: it cannot reset the host, but
/// it makes starvation visible in the logs.
struct SoftWatchdog {
    last_fed: Instant,
}

impl SoftWatchdog {
    fn new() -> Self {
        Self {
            last_fed: Instant::now(),
        }
    }
}

impl Watchdog for SoftWatchdog {
    fn feed(&mut self) {
        let starved_ms = self.last_fed.elapsed().as_millis() as u64;
        if starved_ms > WATCHDOG_TIMEOUT_MS {
            warn!("watchdog starved for {starved_ms}ms; hardware would have reset");
        }
        self.last_fed = Instant::now();
    }
}

struct LogIndicator;

impl Indicator for LogIndicator {
    fn set(&mut self, on: bool) {
        debug!("indicator {}", if on { "on" } else { "off" });
    }

    fn blink(&mut self, pattern: BlinkPattern) {
        debug!(
            "indicator blink {}x{}ms",
            pattern.times, pattern.interval_ms
        );
    }
}

// Hardware integration point: the ESP target reads a BME280 over I2C;
// the host synthesizes a slow drift around plausible indoor values.
struct SimulatedBme280 {
    tick: u64,
}

impl SimulatedBme280 {
    fn new() -> Self {
        Self { tick: 0 }
    }

    fn read(&mut self) -> Result<SensorSample, NodeError> {
        self.tick = self.tick.saturating_add(1);
        Ok(SensorSample {
            temperature: 21.0 + ((self.tick % 8) as f32 * 0.2),
            pressure: 1010.0 + ((self.tick % 5) as f32 * 0.5),
            humidity: 40.0 + ((self.tick % 6) as f32 * 0.5),
        })
    }
}

/// rumqttc-backed broker transport. The connection is driven by a
/// dedicated poll thread; transport errors it sees come back to the loop
/// through a channel drained by `poll`.
struct HostBroker {
    client: Client,
    connected: Arc<AtomicBool>,
    faults: mpsc::Receiver<String>,
}

impl HostBroker {
    fn start(config: &DeviceConfig) -> Result<Self, NodeError> {
        let mut options = MqttOptions::new(
            "marbian-host",
            config.mqtt.broker_ip.clone(),
            MQTT_PORT,
        );
        options.set_keep_alive(Duration::from_secs(25));
        if !config.mqtt.username.is_empty() {
            options.set_credentials(config.mqtt.username.clone(), config.mqtt.password.clone());
        }

        let (client, mut connection) = Client::new(options, 32);
        let connected = Arc::new(AtomicBool::new(false));
        let (fault_tx, faults) = mpsc::channel();

        {
            let connected = connected.clone();
            thread::Builder::new()
                .name("mqtt-poll".to_string())
                .spawn(move || {
                    for notification in connection.iter() {
                        match notification {
                            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                                connected.store(true, Ordering::Relaxed);
                            }
                            Ok(Event::Incoming(Packet::Publish(message))) => {
                                // Inbound control messages are only logged.
                                info!(
                                    "received message on {}: {} bytes",
                                    message.topic,
                                    message.payload.len()
                                );
                            }
                            Ok(_) => {}
                            Err(err) => {
                                connected.store(false, Ordering::Relaxed);
                                let _ = fault_tx.send(err.to_string());
                                thread::sleep(Duration::from_secs(2));
                            }
                        }
                    }
                })
                .map_err(|err| {
                    NodeError::Transport(format!("failed to spawn mqtt thread: {err}"))
                })?;
        }

        Ok(Self {
            client,
            connected,
            faults,
        })
    }

    fn drain_faults(&mut self) -> Result<(), NodeError> {
        match self.faults.try_recv() {
            Ok(message) => Err(NodeError::Transport(message)),
            Err(mpsc::TryRecvError::Empty) => Ok(()),
            Err(mpsc::TryRecvError::Disconnected) => {
                Err(NodeError::Transport("mqtt poll thread died".into()))
            }
        }
    }
}

impl BrokerTransport for HostBroker {
    fn open(&mut self) -> Result<(), NodeError> {
        let deadline = Instant::now() + BROKER_CONNECT_TIMEOUT;
        while !self.connected.load(Ordering::Relaxed) {
            self.drain_faults()?;
            if Instant::now() >= deadline {
                return Err(NodeError::Transport(format!(
                    "broker connect timed out after {}s",
                    BROKER_CONNECT_TIMEOUT.as_secs()
                )));
            }
            thread::sleep(Duration::from_millis(100));
        }
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8], qos: u8) -> Result<(), NodeError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(NodeError::Transport("broker link is down".into()));
        }
        self.client
            .publish(topic, qos_from(qos), false, payload)
            .map_err(|err| NodeError::Transport(format!("publish failed: {err}")))
    }

    fn poll(&mut self) -> Result<(), NodeError> {
        self.drain_faults()
    }

    fn close(&mut self) -> Result<(), NodeError> {
        self.client
            .disconnect()
            .map_err(|err| NodeError::Transport(format!("disconnect failed: {err}")))
    }
}

fn qos_from(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}
