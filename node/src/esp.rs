use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use bme280::i2c::BME280;
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::Read,
    mqtt::client::QoS,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::{Delay, FreeRtos},
    gpio::{Gpio2, Output, PinDriver},
    i2c::{I2cConfig, I2cDriver},
    prelude::*,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EventPayload, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use marbian_common::{
    derive_client_id, format_timestamp,
    indicator::{BROKER_CONFIRM, PUBLISH_PULSE, WIFI_CONFIRM},
    parse_time_api, Association, BlinkPattern, BrokerSession, BrokerTransport,
    ConnectivityManager, DeviceConfig, Indicator, LoopAction, NodeError, Recovery, SensorReading,
    SensorSample, Supervisor, Watchdog, WifiLink, TIME_API_URL, WATCHDOG_TIMEOUT_MS,
};

const NVS_NAMESPACE: &str = "marbian";
const NVS_CONFIG_KEY: &str = "config_json";
const MQTT_PORT: u16 = 1883;
const BROKER_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CADENCE_MS: u32 = 1_000;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    // Fatal-at-boot: a missing or malformed config document halts here.
    let config = load_config(nvs_partition.clone()).context("failed to load device config")?;

    let Peripherals {
        modem, pins, i2c0, ..
    } = Peripherals::take()?;

    let mut indicator = OnboardLed::new(pins.gpio2)?;
    indicator.set(false);

    // BME280 on the standard I2C pins (SDA 21, SCL 22).
    let i2c = I2cDriver::new(
        i2c0,
        pins.gpio21,
        pins.gpio22,
        &I2cConfig::new().baudrate(400.kHz().into()),
    )?;
    let mut sensor = Bme280Sensor::new(i2c).context("failed to initialize BME280")?;

    // Armed before the network phase: a wedged association or time fetch
    // resets the node instead of hanging it.
    init_watchdog(WATCHDOG_TIMEOUT_MS as u32)?;
    add_current_task_to_watchdog()?;
    let mut watchdog = TaskWatchdog;

    let mut wifi_link = EspWifiLink::new(modem, sys_loop, nvs_partition, &config)?;
    let mut connectivity = ConnectivityManager::new();
    match connectivity.ensure_connected(
        &mut wifi_link,
        &config.network.ssid,
        &config.network.password,
    ) {
        Ok(Association::Joined(addr)) => {
            info!("wifi associated at {addr}");
            indicator.blink(WIFI_CONFIRM);
        }
        Ok(Association::AlreadyUp(addr)) => info!("wifi already associated at {addr}"),
        Err(err) => return Err(anyhow!(err)).context("wifi startup failed"),
    }
    watchdog.feed();

    // One shot, no retry: a failed sync fails the boot sequence.
    sync_clock().context("time sync failed")?;
    watchdog.feed();

    let client_id = derive_client_id(&wifi_link.mac()?);
    info!("client id {client_id}");

    let mut session = BrokerSession::new(EspBroker::start(&config, &client_id)?);
    let mut supervisor = Supervisor::new(config.mqtt.msg_interval);

    if let Err(err) = session.connect() {
        warn!("broker connect failed: {err}");
        return recover(supervisor.fault(err.fault_kind()));
    }
    indicator.blink(BROKER_CONFIRM);
    supervisor.broker_ready();
    info!("broker session up; publishing to {}", config.mqtt.topic_pub);

    let boot = Instant::now();

    loop {
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

        FreeRtos::delay_ms(CADENCE_MS);
    }
}

fn publish_reading(
    config: &DeviceConfig,
    session: &mut BrokerSession<EspBroker>,
    sensor: &mut Bme280Sensor,
    indicator: &mut OnboardLed,
) -> Result<(), NodeError> {
    let sample = sensor.read()?;
    let timestamp = format_timestamp(&chrono::Local::now().naive_local());
    let reading = SensorReading::from_sample(sample, timestamp);
    let payload = reading.payload()?;

    session.publish(&config.mqtt.topic_pub, &payload, config.mqtt.qos)?;
    info!(
        "published {} bytes to {}",
        payload.len(),
        config.mqtt.topic_pub
    );
    indicator.blink(PUBLISH_PULSE);
    Ok(())
}

fn recover(recovery: Recovery) -> anyhow::Result<()> {
    match recovery {
        Recovery::RestartAfter(backoff_s) => {
            warn!("transport fault; restarting in {backoff_s}s");
            thread::sleep(Duration::from_secs(backoff_s));
            esp_idf_svc::hal::reset::restart();
        }
        Recovery::Halt => Err(anyhow!("unrecoverable fault")),
    }
}

/// The config document is a JSON string held in NVS under a single key,
/// same schema as the host's config.json.
fn load_config(partition: EspDefaultNvsPartition) -> anyhow::Result<DeviceConfig> {
    let mut nvs = EspNvs::new(partition, NVS_NAMESPACE, true)?;
    let mut buffer = vec![0_u8; 2048];

    let raw = nvs
        .get_str(NVS_CONFIG_KEY, &mut buffer)?
        .ok_or_else(|| anyhow!("no config document under {NVS_NAMESPACE}/{NVS_CONFIG_KEY}"))?;
    Ok(DeviceConfig::from_json(raw)?)
}

fn sync_clock() -> anyhow::Result<()> {
    let http_conf = HttpClientConfiguration {
        timeout: Some(Duration::from_secs(10)),
        ..Default::default()
    };
    let mut client = HttpClient::wrap(EspHttpConnection::new(&http_conf)?);

    let request = client.request(Method::Get, TIME_API_URL, &[])?;
    let mut response = request.submit().map_err(|err| anyhow!("{err:?}"))?;

    let status = response.status();
    if !(200..300).contains(&status) {
        return Err(anyhow!("time API returned HTTP {status}"));
    }

    let mut body = Vec::new();
    let mut chunk = [0_u8; 512];
    loop {
        let read = response.read(&mut chunk).map_err(|err| anyhow!("{err:?}"))?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
    }

    let clock = parse_time_api(std::str::from_utf8(&body)?)?;
    let tv = esp_idf_svc::sys::timeval {
        tv_sec: clock.epoch_seconds()? as _,
        tv_usec: 0,
    };
    let rc = unsafe { esp_idf_svc::sys::settimeofday(&tv, std::ptr::null()) };
    if rc != 0 {
        return Err(anyhow!("settimeofday failed with code {rc}"));
    }

    info!(
        "clock set to {:04}-{:02}-{:02} {:02}:{:02}:{:02} UTC (weekday {})",
        clock.year, clock.month, clock.day, clock.hour, clock.minute, clock.second, clock.weekday
    );
    Ok(())
}

struct EspWifiLink {
    wifi: BlockingWifi<EspWifi<'static>>,
}

impl EspWifiLink {
    fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: EspDefaultNvsPartition,
        config: &DeviceConfig,
    ) -> anyhow::Result<Self> {
        let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
        let mut wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;

        let auth_method = if config.network.password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        wifi.set_configuration(&Configuration::Client(ClientConfiguration {
            ssid: config
                .network
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi ssid too long"))?,
            password: config
                .network
                .password
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi password too long"))?,
            auth_method,
            ..Default::default()
        }))?;

        Ok(Self { wifi })
    }

    fn mac(&self) -> Result<[u8; 6], NodeError> {
        self.wifi
            .wifi()
            .sta_netif()
            .get_mac()
            .map_err(|err| NodeError::Config(format!("failed to read station mac: {err}")))
    }
}

impl WifiLink for EspWifiLink {
    fn is_associated(&self) -> bool {
        self.wifi.is_up().unwrap_or(false)
    }

    fn activate(&mut self) -> Result<(), NodeError> {
        self.wifi
            .start()
            .map_err(|err| NodeError::Transport(format!("wifi start failed: {err}")))
    }

    fn join(&mut self, _ssid: &str, _password: &str) -> Result<(), NodeError> {
        // Credentials were applied to the driver at construction; each call
        // is one bounded association attempt.
        self.wifi
            .connect()
            .and_then(|()| self.wifi.wait_netif_up())
            .map_err(|err| NodeError::Transport(format!("association attempt failed: {err}")))
    }

    fn address(&self) -> Result<String, NodeError> {
        let ip_info = self
            .wifi
            .wifi()
            .sta_netif()
            .get_ip_info()
            .map_err(|err| NodeError::Transport(format!("failed to read ip info: {err}")))?;
        Ok(ip_info.ip.to_string())
    }
}

struct OnboardLed {
    pin: PinDriver<'static, Gpio2, Output>,
}

impl OnboardLed {
    fn new(gpio2: Gpio2) -> anyhow::Result<Self> {
        Ok(Self {
            pin: PinDriver::output(gpio2)?,
        })
    }
}

impl Indicator for OnboardLed {
    fn set(&mut self, on: bool) {
        let result = if on {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
        if let Err(err) = result {
            warn!("failed to drive indicator led: {err}");
        }
    }

    fn blink(&mut self, pattern: BlinkPattern) {
        for _ in 0..pattern.times {
            self.set(true);
            FreeRtos::delay_ms(pattern.interval_ms as u32);
            self.set(false);
            FreeRtos::delay_ms(pattern.interval_ms as u32);
        }
    }
}

struct Bme280Sensor {
    driver: BME280<I2cDriver<'static>>,
    delay: Delay,
}

impl Bme280Sensor {
    fn new(i2c: I2cDriver<'static>) -> anyhow::Result<Self> {
        let mut delay = Delay::new_default();
        let mut driver = BME280::new_primary(i2c);
        driver
            .init(&mut delay)
            .map_err(|err| anyhow!("bme280 init failed: {err:?}"))?;
        Ok(Self { driver, delay })
    }

    fn read(&mut self) -> Result<SensorSample, NodeError> {
        let measurements = self
            .driver
            .measure(&mut self.delay)
            .map_err(|err| NodeError::Sensor(format!("bme280 read failed: {err:?}")))?;

        Ok(SensorSample {
            temperature: measurements.temperature,
            // The driver reports pascals; the payload carries hPa.
            pressure: measurements.pressure / 100.0,
            humidity: measurements.humidity,
        })
    }
}

/// Hardware task watchdog. Armed once at boot; nothing disarms it.
struct TaskWatchdog;

impl Watchdog for TaskWatchdog {
    fn feed(&mut self) {
        let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
    }
}

fn init_watchdog(timeout_ms: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms,
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {rc}"))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {rc}"))
}

/// EspMqttClient-backed transport. Connection events are drained on a
/// dedicated thread; errors it sees come back through a channel, and the
/// connected flag tracks the session's link state.
struct EspBroker {
    client: EspMqttClient<'static>,
    connected: Arc<AtomicBool>,
    faults: mpsc::Receiver<String>,
}

impl EspBroker {
    fn start(config: &DeviceConfig, client_id: &str) -> anyhow::Result<Self> {
        let url = format!("mqtt://{}:{}", config.mqtt.broker_ip, MQTT_PORT);
        let conf = MqttClientConfiguration {
            client_id: Some(client_id),
            username: if config.mqtt.username.is_empty() {
                None
            } else {
                Some(config.mqtt.username.as_str())
            },
            password: if config.mqtt.password.is_empty() {
                None
            } else {
                Some(config.mqtt.password.as_str())
            },
            keep_alive_interval: Some(Duration::from_secs(25)),
            ..Default::default()
        };

        let (client, mut conn) = EspMqttClient::new(&url, &conf)?;
        let connected = Arc::new(AtomicBool::new(false));
        let (fault_tx, faults) = mpsc::channel();

        {
            let connected = connected.clone();
            thread::Builder::new()
                .name("mqtt-poll".to_string())
                .stack_size(8192)
                .spawn(move || loop {
                    match conn.next() {
                        Ok(event) => match event.payload() {
                            EventPayload::Connected(_) => {
                                connected.store(true, Ordering::Relaxed);
                            }
                            EventPayload::Disconnected => {
                                connected.store(false, Ordering::Relaxed);
                                let _ = fault_tx.send("broker link dropped".to_string());
                            }
                            EventPayload::Error(err) => {
                                connected.store(false, Ordering::Relaxed);
                                let _ = fault_tx.send(format!("{err:?}"));
                                thread::sleep(Duration::from_secs(2));
                            }
                            // Inbound control messages are only logged.
                            other => info!("mqtt event: {other:?}"),
                        },
                        Err(err) => {
                            let _ = fault_tx.send(format!("{err:?}"));
                            thread::sleep(Duration::from_secs(2));
                        }
                    }
                })
                .context("failed to spawn mqtt thread")?;
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

impl BrokerTransport for EspBroker {
    fn open(&mut self) -> Result<(), NodeError> {
        // The client connects in the background; wait for the broker's
        // acknowledgment (or the first fault) before reporting the session
        // as established.
        let deadline = Instant::now() + BROKER_CONNECT_TIMEOUT;
        while !self.connected.load(Ordering::Relaxed) {
            self.drain_faults()?;
            if Instant::now() >= deadline {
                return Err(NodeError::Transport(format!(
                    "broker connect timed out after {}s",
                    BROKER_CONNECT_TIMEOUT.as_secs()
                )));
            }
            FreeRtos::delay_ms(100);
        }
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8], qos: u8) -> Result<(), NodeError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(NodeError::Transport("broker link is down".into()));
        }
        self.client
            .publish(topic, qos_from(qos), false, payload)
            .map(|_| ())
            .map_err(|err| NodeError::Transport(format!("publish failed: {err}")))
    }

    fn poll(&mut self) -> Result<(), NodeError> {
        self.drain_faults()
    }

    fn close(&mut self) -> Result<(), NodeError> {
        // Dropping the client tears the session down; nothing to flush.
        Ok(())
    }
}

fn qos_from(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}
