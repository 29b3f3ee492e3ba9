use core::convert::TryInto;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        mpsc, Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method, Status},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::{BLOCK, NON_BLOCK},
    gpio::{AnyIOPin, AnyOutputPin, Output, PinDriver},
    uart::{config::Config as UartConfig, UartDriver},
    units::Hertz,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, LwtConfiguration, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::{BlockingWifi, EspWifi},
};
use hasp_common::{
    config::NetworkConfig, protocol::PANEL_BAUD, topics::STATUS_OFFLINE, Clock, LinkError,
    NetworkQuiesce, Nextion, PanelLink, PlateCommand, PlateStatus, Publication, RuntimeConfig,
    Topics,
};
use log::{debug, info, warn};
use serde::Serialize;

use crate::bridge::{FirmwareSource, LoopCommand, Platform, PlateLoop};
use crate::form::{query_param, MultipartBody};

const NVS_NAMESPACE: &str = "hasp";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const MAX_MQTT_PAYLOAD_BYTES: usize = 2048;
const UPLOAD_CHUNK_BYTES: usize = 1024;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const PANEL_POWER_PIN: i32 = 4;
const RESET_PULSE_MS: u64 = 200;

#[derive(Clone)]
struct SharedState {
    commands: mpsc::Sender<LoopCommand>,
    tft_file_size: Arc<AtomicU32>,
    status: Arc<Mutex<Option<PlateStatus>>>,
    offline: Arc<AtomicBool>,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
}

/// Panel on UART2. The optional power pin switches the panel's supply for
/// a hard reset.
struct UartLink {
    uart: UartDriver<'static>,
    power: Option<PinDriver<'static, AnyOutputPin, Output>>,
}

struct EspClock;

struct EspPlatform {
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
    topics: Topics,
    status: Arc<Mutex<Option<PlateStatus>>>,
    offline: Arc<AtomicBool>,
}

struct HttpFirmware {
    conn: EspHttpConnection,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime
        .sanitize()
        .context("runtime config has unusable panel dimensions")?;
    ensure_wifi_defaults(&mut runtime);

    info!(
        "NVS config loaded: node=`{}`, pages={}, buttons={}, mqtt=`{}:{}`",
        runtime.network.node_name,
        runtime.nextion.page_count,
        runtime.nextion.button_count,
        runtime.network.mqtt_host,
        runtime.network.mqtt_port,
    );

    let peripherals = Peripherals::take()?;
    let uart = UartDriver::new(
        peripherals.uart2,
        peripherals.pins.gpio17,
        peripherals.pins.gpio16,
        Option::<AnyIOPin>::None,
        Option::<AnyIOPin>::None,
        &UartConfig::default().baudrate(Hertz(PANEL_BAUD)),
    )
    .context("failed to open panel UART")?;
    let link = UartLink {
        uart,
        power: init_panel_power(PANEL_POWER_PIN),
    };
    let nextion = Nextion::new(link, runtime.nextion.clone())
        .context("failed to set up the Nextion driver")?;

    let wifi = connect_wifi(peripherals.modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;

    let topics = Topics::new(&runtime.network.node_name, &runtime.network.group_name);
    let (mqtt_client, mqtt_conn) = create_mqtt_client(&runtime.network, &topics)?;
    let mqtt = Arc::new(Mutex::new(mqtt_client));

    let (commands, receiver) = mpsc::channel();
    let shared = SharedState {
        commands,
        tft_file_size: Arc::new(AtomicU32::new(0)),
        status: Arc::new(Mutex::new(None)),
        offline: Arc::new(AtomicBool::new(false)),
    };

    spawn_mqtt_receiver(shared.clone(), topics.clone(), mqtt_conn, mqtt.clone())?;

    let platform = EspPlatform {
        mqtt,
        topics,
        status: shared.status.clone(),
        offline: shared.offline.clone(),
    };
    let plate = PlateLoop::new(nextion, EspClock, platform, &runtime, receiver);
    thread::Builder::new()
        .name("hmi-loop".into())
        .stack_size(16 * 1024)
        .spawn(move || plate.run())
        .context("failed to spawn HMI loop")?;

    let server = create_http_server(shared)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }

    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }
}

fn init_panel_power(pin: i32) -> Option<PinDriver<'static, AnyOutputPin, Output>> {
    let driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) };
    match driver {
        Ok(mut pin) => {
            let _ = pin.set_high();
            Some(pin)
        }
        Err(err) => {
            warn!("panel power switch unavailable on GPIO{pin}: {err}");
            None
        }
    }
}

fn create_http_server(shared: SharedState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let shared = shared.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            let snapshot = shared.status.lock().ok().and_then(|status| status.clone());
            match snapshot {
                Some(status) => write_json(req, &status),
                None => write_error(req, 503, "panel status not reported yet"),
            }
        })?;
    }

    {
        let shared = shared.clone();
        server.fn_handler("/tftFileSize", Method::Get, move |req| {
            let uri = req.uri().to_string();
            let Some(size) =
                query_param(&uri, "tftFileSize").and_then(|value| value.parse::<u32>().ok())
            else {
                return write_error(req, 400, "Missing or invalid 'tftFileSize' parameter");
            };
            info!("LCD OTA: declared TFT size {size} bytes");
            shared.tft_file_size.store(size, Ordering::SeqCst);
            req.into_ok_response()?;
            Ok(())
        })?;
    }

    {
        let shared = shared.clone();
        server.fn_handler("/lcdupload", Method::Post, move |mut req| {
            let size = shared.tft_file_size.swap(0, Ordering::SeqCst);
            if size == 0 {
                return write_error(
                    req,
                    400,
                    "declare the file size via /tftFileSize before uploading",
                );
            }

            let (chunks, receiver) = mpsc::channel();
            if shared
                .commands
                .send(LoopCommand::Upload {
                    size,
                    chunks: receiver,
                })
                .is_err()
            {
                return write_error(req, 503, "HMI loop has stopped");
            }

            let mut body = MultipartBody::new(size);
            let mut buffer = [0_u8; UPLOAD_CHUNK_BYTES];
            while !body.is_complete() {
                let read = req.read(&mut buffer)?;
                if read == 0 {
                    break;
                }
                let payload = body.feed(&buffer[..read])?;
                if !payload.is_empty() && chunks.send(payload).is_err() {
                    break;
                }
            }
            drop(chunks);

            req.into_ok_response()?
                .write_all(b"LCD firmware received, restarting")?;
            Ok(())
        })?;
    }

    {
        let shared = shared.clone();
        server.fn_handler("/lcddownload", Method::Get, move |req| {
            let uri = req.uri().to_string();
            let url = query_param(&uri, "lcdFirmware").filter(|url| !url.trim().is_empty());
            if shared
                .commands
                .send(LoopCommand::Plate(PlateCommand::LcdDownload(url)))
                .is_err()
            {
                return write_error(req, 503, "HMI loop has stopped");
            }
            req.into_ok_response()?
                .write_all(b"LCD firmware download started")?;
            Ok(())
        })?;
    }

    server.fn_handler("/reboot", Method::Get, move |req| {
        if shared
            .commands
            .send(LoopCommand::Plate(PlateCommand::Reboot))
            .is_err()
        {
            return write_error(req, 503, "HMI loop has stopped");
        }
        req.into_ok_response()?.write_all(b"rebooting")?;
        Ok(())
    })?;

    Ok(server)
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    if network.wifi_ssid.is_empty() {
        return Err(anyhow!("wifi credentials missing"));
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    match last_err {
        None => Ok(esp_wifi),
        Some(err) => Err(anyhow!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; last error: {err:#}"
        )),
    }
}

fn create_mqtt_client(
    network: &NetworkConfig,
    topics: &Topics,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);
    let client_id = format!("hasp-{}", network.node_name);

    let conf = MqttClientConfiguration {
        client_id: Some(client_id.as_str()),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        lwt: Some(LwtConfiguration {
            topic: topics.status.as_str(),
            payload: STATUS_OFFLINE.as_bytes(),
            qos: QoS::AtLeastOnce,
            retain: true,
        }),
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn subscribe_topics(mqtt: &Mutex<EspMqttClient<'static>>, topics: &Topics) -> anyhow::Result<()> {
    let mut mqtt = mqtt
        .lock()
        .map_err(|_| anyhow!("mqtt client lock poisoned"))?;
    for topic in topics.subscriptions() {
        mqtt.subscribe(&topic, QoS::AtMostOnce)?;
    }
    Ok(())
}

fn spawn_mqtt_receiver(
    shared: SharedState,
    topics: Topics,
    mut conn: EspMqttConnection,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            let event = match conn.next() {
                Ok(event) => event,
                Err(err) => {
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                    continue;
                }
            };

            match event.payload() {
                EventPayload::Connected(_) => {
                    info!("mqtt connected");
                    if let Err(err) = subscribe_topics(&mqtt, &topics) {
                        warn!("mqtt subscribe failed: {err:#}");
                    }
                    let _ = shared
                        .commands
                        .send(LoopCommand::Plate(PlateCommand::StatusUpdate));
                }
                EventPayload::Received {
                    topic: Some(topic),
                    data,
                    details,
                    ..
                } => {
                    // We only process full MQTT payloads.
                    if !matches!(details, Details::Complete) || shared.offline.load(Ordering::Relaxed)
                    {
                        continue;
                    }

                    if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                        warn!(
                            "dropping oversized MQTT payload on topic {} ({} bytes)",
                            topic,
                            data.len()
                        );
                        continue;
                    }

                    let Ok(payload) = core::str::from_utf8(data) else {
                        continue;
                    };
                    if let Some(command) = topics.route(topic, payload) {
                        if shared.commands.send(LoopCommand::Plate(command)).is_err() {
                            warn!("HMI loop has stopped, dropping {topic}");
                        }
                    }
                }
                _ => {}
            }
        })
        .context("failed to spawn mqtt receiver thread")?;
    Ok(())
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

impl PanelLink for UartLink {
    fn read_byte(&mut self) -> Option<u8> {
        let mut byte = [0_u8; 1];
        match self.uart.read(&mut byte, NON_BLOCK) {
            Ok(1) => Some(byte[0]),
            _ => None,
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        let mut rest = bytes;
        while !rest.is_empty() {
            let written = self
                .uart
                .write(rest)
                .map_err(|err| LinkError::Write(err.to_string()))?;
            if written == 0 {
                return Err(LinkError::Write("UART accepted no bytes".to_string()));
            }
            rest = &rest[written..];
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), LinkError> {
        self.uart
            .wait_tx_done(BLOCK)
            .map_err(|err| LinkError::Write(err.to_string()))
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), LinkError> {
        self.uart
            .change_baudrate(Hertz(baud))
            .map(|_| ())
            .map_err(|err| LinkError::Configure(err.to_string()))
    }

    fn pulse_reset(&mut self) {
        let Some(power) = self.power.as_mut() else {
            return;
        };
        let pulse = power.set_low().and_then(|()| {
            thread::sleep(Duration::from_millis(RESET_PULSE_MS));
            power.set_high()
        });
        if let Err(err) = pulse {
            warn!("panel power cycle failed: {err}");
        }
    }
}

impl Clock for EspClock {
    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn sleep_ms(&self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }
}

impl EspPlatform {
    fn send(&self, publication: &Publication) -> anyhow::Result<()> {
        let mut mqtt = self
            .mqtt
            .lock()
            .map_err(|_| anyhow!("mqtt client lock poisoned"))?;
        mqtt.publish(
            &publication.topic,
            QoS::AtLeastOnce,
            publication.retain,
            publication.payload.as_bytes(),
        )?;
        Ok(())
    }
}

impl NetworkQuiesce for EspPlatform {
    fn quiesce(&mut self) {
        info!("LCD OTA: LCD firmware upload starting, closing MQTT connection");
        for publication in self.topics.goodbye() {
            self.publish(&publication);
        }
        self.offline.store(true, Ordering::Relaxed);
    }
}

impl Platform for EspPlatform {
    fn publish(&mut self, publication: &Publication) {
        if self.offline.load(Ordering::Relaxed) {
            debug!("mqtt offline, dropping publish to {}", publication.topic);
            return;
        }
        if let Err(err) = self.send(publication) {
            warn!("mqtt publish to {} failed: {err:#}", publication.topic);
        }
    }

    fn fetch_firmware(&mut self, url: &str) -> anyhow::Result<FirmwareSource> {
        HttpFirmware::open(url)
    }

    fn restart(&mut self) {
        info!("restarting");
        thread::sleep(Duration::from_millis(800));
        esp_idf_svc::hal::reset::restart();
    }

    fn status_changed(&mut self, status: &PlateStatus) {
        if let Ok(mut slot) = self.status.lock() {
            *slot = Some(status.clone());
        }
    }
}

impl HttpFirmware {
    fn open(url: &str) -> anyhow::Result<FirmwareSource> {
        let http_conf = HttpClientConfiguration {
            timeout: Some(Duration::from_secs(30)),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let mut conn = EspHttpConnection::new(&http_conf)?;
        conn.initiate_request(Method::Get, url, &[])
            .map_err(|e| anyhow!("{e:?}"))?;
        conn.initiate_response().map_err(|e| anyhow!("{e:?}"))?;

        let status = conn.status();
        if status != 200 {
            return Err(anyhow!("LCD firmware download failed with HTTP {status}"));
        }

        let size = conn
            .header("content-length")
            .or_else(|| conn.header("Content-Length"))
            .and_then(|value| value.trim().parse::<u32>().ok())
            .ok_or_else(|| anyhow!("server did not send a Content-Length"))?;

        Ok(FirmwareSource {
            size,
            reader: Box::new(Self { conn }),
        })
    }
}

impl std::io::Read for HttpFirmware {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Read::read(&mut self.conn, buf).map_err(|err| std::io::Error::other(format!("{err:?}")))
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
