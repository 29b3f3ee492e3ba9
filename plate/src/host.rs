use std::{
    io::{ErrorKind, Read, Write},
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicU32, Ordering},
        mpsc, Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use hasp_common::{
    topics::STATUS_OFFLINE, Clock, LinkError, NetworkQuiesce, Nextion, PanelLink, PlateCommand,
    PlateStatus, Publication, RuntimeConfig, Topics,
};
use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::bridge::{FirmwareSource, LoopCommand, Platform, PlateLoop};

const SERIAL_TIMEOUT_MS: u64 = 10;
const RESET_PULSE_MS: u64 = 200;
const MAX_TFT_BYTES: usize = 32 * 1024 * 1024;

#[derive(Clone)]
struct AppState {
    commands: mpsc::Sender<LoopCommand>,
    tft_file_size: Arc<AtomicU32>,
    status: Arc<Mutex<Option<PlateStatus>>>,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct TftFileSizeQuery {
    #[serde(rename = "tftFileSize")]
    tft_file_size: u32,
}

#[derive(Debug, Deserialize)]
struct LcdDownloadQuery {
    #[serde(rename = "lcdFirmware", default)]
    lcd_firmware: Option<String>,
}

/// Nextion on a USB serial adapter. DTR doubles as the panel reset line.
struct SerialLink {
    port: Box<dyn serialport::SerialPort>,
}

struct StdClock;

struct HostPlatform {
    mqtt: AsyncClient,
    topics: Topics,
    status: Arc<Mutex<Option<PlateStatus>>>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime
        .sanitize()
        .context("runtime config has unusable panel dimensions")?;

    let topics = Topics::new(&runtime.network.node_name, &runtime.network.group_name);

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(runtime.network.mqtt_host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.mqtt_port);

    let client_id = format!("hasp-{}", runtime.network.node_name);
    let mut mqtt_options = MqttOptions::new(client_id, mqtt_host, mqtt_port);
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(runtime.network.mqtt_user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(runtime.network.mqtt_pass.clone());
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }
    mqtt_options.set_last_will(LastWill::new(
        topics.status.clone(),
        STATUS_OFFLINE,
        QoS::AtLeastOnce,
        true,
    ));

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let serial_path =
        std::env::var("HASP_SERIAL_PORT").unwrap_or_else(|_| "/dev/ttyUSB0".to_string());
    let link = SerialLink::open(&serial_path, hasp_common::protocol::PANEL_BAUD)?;
    let nextion = Nextion::new(link, runtime.nextion.clone())
        .context("failed to set up the Nextion driver")?;

    let (commands, receiver) = mpsc::channel();
    let app_state = AppState {
        commands,
        tft_file_size: Arc::new(AtomicU32::new(0)),
        status: Arc::new(Mutex::new(None)),
    };

    let platform = HostPlatform {
        mqtt: mqtt.clone(),
        topics: topics.clone(),
        status: app_state.status.clone(),
    };
    let plate = PlateLoop::new(nextion, StdClock, platform, &runtime, receiver);
    thread::Builder::new()
        .name("hmi-loop".to_string())
        .spawn(move || plate.run())
        .context("failed to spawn HMI loop")?;

    subscribe_topics(&mqtt, &topics).await?;
    spawn_mqtt_loop(app_state.clone(), topics, eventloop);

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/tftFileSize", get(handle_tft_file_size))
        .route(
            "/lcdupload",
            post(handle_lcd_upload).layer(DefaultBodyLimit::max(MAX_TFT_BYTES)),
        )
        .route("/lcddownload", get(handle_lcd_download))
        .route("/reboot", get(handle_reboot))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let port = std::env::var("HASP_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind plate server at {addr}"))?;

    info!("plate listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn subscribe_topics(mqtt: &AsyncClient, topics: &Topics) -> anyhow::Result<()> {
    for topic in topics.subscriptions() {
        mqtt.subscribe(topic, QoS::AtMostOnce).await?;
    }
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, topics: Topics, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    let payload = String::from_utf8_lossy(&message.payload);
                    let Some(command) = topics.route(&message.topic, &payload) else {
                        continue;
                    };
                    if let PlateCommand::LcdDownload(_) = command {
                        warn!("LCD firmware download is only available in ESP32 builds");
                        continue;
                    }
                    if app_state.commands.send(LoopCommand::Plate(command)).is_err() {
                        warn!("HMI loop has stopped, dropping {}", message.topic);
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    let _ = app_state
                        .commands
                        .send(LoopCommand::Plate(PlateCommand::StatusUpdate));
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.status.lock().ok().and_then(|status| status.clone());
    match snapshot {
        Some(status) => Json(status).into_response(),
        None => error_response(StatusCode::SERVICE_UNAVAILABLE, "panel status not reported yet"),
    }
}

async fn handle_tft_file_size(
    State(state): State<AppState>,
    Query(query): Query<TftFileSizeQuery>,
) -> impl IntoResponse {
    info!("LCD OTA: declared TFT size {} bytes", query.tft_file_size);
    state
        .tft_file_size
        .store(query.tft_file_size, Ordering::SeqCst);
    StatusCode::OK
}

async fn handle_lcd_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> axum::response::Response {
    let size = state.tft_file_size.swap(0, Ordering::SeqCst);
    if size == 0 {
        return error_response(
            StatusCode::BAD_REQUEST,
            "declare the file size via /tftFileSize before uploading",
        );
    }

    let (chunks, receiver) = mpsc::channel();
    if state
        .commands
        .send(LoopCommand::Upload {
            size,
            chunks: receiver,
        })
        .is_err()
    {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "HMI loop has stopped");
    }

    // Dropping `chunks` on any exit tells the transfer the stream ended.
    loop {
        let mut field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                warn!("LCD OTA: upload stream failed: {err}");
                return error_response(StatusCode::BAD_REQUEST, &err.body_text());
            }
        };
        if field.file_name().is_none() {
            continue;
        }
        loop {
            match field.chunk().await {
                Ok(Some(bytes)) => {
                    if chunks.send(bytes.to_vec()).is_err() {
                        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "LCD OTA aborted");
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!("LCD OTA: upload stream failed: {err}");
                    return error_response(StatusCode::BAD_REQUEST, &err.body_text());
                }
            }
        }
    }

    (StatusCode::OK, "LCD firmware received, restarting").into_response()
}

async fn handle_lcd_download(Query(query): Query<LcdDownloadQuery>) -> impl IntoResponse {
    if let Some(url) = query.lcd_firmware {
        warn!("LCD OTA: download of {url} requested on a host build");
    }
    error_response(
        StatusCode::NOT_IMPLEMENTED,
        "LCD firmware download is only available in ESP32 builds",
    )
}

async fn handle_reboot(State(state): State<AppState>) -> impl IntoResponse {
    if state
        .commands
        .send(LoopCommand::Plate(PlateCommand::Reboot))
        .is_err()
    {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "HMI loop has stopped");
    }
    (StatusCode::OK, "rebooting").into_response()
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("HASP_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.hasp"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

impl SerialLink {
    fn open(path: &str, baud: u32) -> anyhow::Result<Self> {
        let port = serialport::new(path, baud)
            .timeout(Duration::from_millis(SERIAL_TIMEOUT_MS))
            .open()
            .with_context(|| format!("failed to open panel serial port {path}"))?;
        info!("panel serial port {path} open at {baud} bps");
        Ok(Self { port })
    }
}

impl PanelLink for SerialLink {
    fn read_byte(&mut self) -> Option<u8> {
        match self.port.bytes_to_read() {
            Ok(0) => return None,
            Ok(_) => {}
            Err(err) => {
                warn!("serial status read failed: {err}");
                return None;
            }
        }
        let mut byte = [0u8; 1];
        match self.port.read(&mut byte) {
            Ok(1) => Some(byte[0]),
            Ok(_) => None,
            Err(err) if err.kind() == ErrorKind::TimedOut => None,
            Err(err) => {
                warn!("serial read failed: {err}");
                None
            }
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        self.port
            .write_all(bytes)
            .map_err(|err| LinkError::Write(err.to_string()))
    }

    fn flush(&mut self) -> Result<(), LinkError> {
        self.port
            .flush()
            .map_err(|err| LinkError::Write(err.to_string()))
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), LinkError> {
        self.port
            .set_baud_rate(baud)
            .map_err(|err| LinkError::Configure(err.to_string()))
    }

    fn pulse_reset(&mut self) {
        let pulse = self
            .port
            .write_data_terminal_ready(false)
            .and_then(|()| {
                thread::sleep(Duration::from_millis(RESET_PULSE_MS));
                self.port.write_data_terminal_ready(true)
            });
        if let Err(err) = pulse {
            warn!("panel reset via DTR failed: {err}");
        }
    }
}

impl Clock for StdClock {
    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn sleep_ms(&self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }
}

impl HostPlatform {
    fn say_goodbye(&mut self) {
        for publication in self.topics.goodbye() {
            self.publish(&publication);
        }
    }
}

impl NetworkQuiesce for HostPlatform {
    fn quiesce(&mut self) {
        info!("LCD OTA: LCD firmware upload starting, closing MQTT connection");
        self.say_goodbye();
        if let Err(err) = self.mqtt.try_disconnect() {
            warn!("mqtt disconnect failed: {err}");
        }
    }
}

impl Platform for HostPlatform {
    fn publish(&mut self, publication: &Publication) {
        if let Err(err) = self.mqtt.try_publish(
            publication.topic.clone(),
            QoS::AtLeastOnce,
            publication.retain,
            publication.payload.clone(),
        ) {
            warn!("mqtt publish to {} failed: {err}", publication.topic);
        }
    }

    fn fetch_firmware(&mut self, _url: &str) -> anyhow::Result<FirmwareSource> {
        anyhow::bail!("LCD firmware download is only available in ESP32 builds")
    }

    fn restart(&mut self) {
        info!("restarting");
        // Give the event loop a moment to flush the offline notice.
        thread::sleep(Duration::from_millis(500));
        std::process::exit(0);
    }

    fn status_changed(&mut self, status: &PlateStatus) {
        if let Ok(mut slot) = self.status.lock() {
            *slot = Some(status.clone());
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
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
