use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
        Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::oneshot};
use tracing::{debug, info, warn};

use panel_common::{
    dispatch_channel, elapsed_ms, AgentError, AgentSnapshot, ConfigStore, ConnectivityMonitor,
    DeviceConfig, Display, EventOutcome, InboundStateUpdate, Millis, OutboundCommand, PanelAgent,
    PanelEvent, StoreError, SubmitOutcome, TimeSource, TimingConfig, TouchDisposition, Transport,
    TransportError,
};

const KNOWN_THEMES: [&str; 5] = ["light_mode", "dark_clean", "dark_mode", "neon_cyberpunk", "lcars"];

type EventResult = Result<EventReply, AgentError>;

enum ControlMessage {
    Event {
        event: PanelEvent,
        reply: Option<oneshot::Sender<EventResult>>,
    },
    ForceTimeSync(oneshot::Sender<bool>),
}

/// What the control loop exposes to everything else.
struct Published {
    snapshot: AgentSnapshot,
    config_document: String,
    report_interval_secs: u32,
}

#[derive(Clone)]
struct AppState {
    control: mpsc::Sender<ControlMessage>,
    published: Arc<Mutex<Published>>,
    input_blocked: Arc<AtomicBool>,
    server_connected: Arc<AtomicBool>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct EventReply {
    saved: bool,
    dispatch: Option<SubmitOutcome>,
    touch: Option<TouchDisposition>,
}

#[derive(Debug, Deserialize)]
struct ButtonRequest {
    id: u8,
    #[serde(default)]
    state: Option<bool>,
    #[serde(rename = "speedLevel", default)]
    speed_level: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct SceneRequest {
    id: u8,
}

#[derive(Debug, Default, Deserialize)]
struct TimeUpdate {
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    timezone: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DisplayUpdate {
    #[serde(default)]
    brightness: Option<u8>,
    #[serde(default)]
    theme: Option<String>,
}

#[derive(Debug, Serialize)]
struct TimeSyncReply {
    synced: bool,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let timing = TimingConfig::default();
    let mut store = FileStore::new();
    let mut config = load_config(&mut store);
    let device_id = std::env::var("PANEL_DEVICE_ID").unwrap_or_else(|_| "panel-sim".to_string());
    config.ensure_device_id(&device_id);

    let transport = SimTransport::from_env();
    let (dispatcher, worker) = dispatch_channel(&timing, transport.clone());
    worker
        .spawn()
        .context("failed to spawn dispatch worker")?;

    let now_ms = monotonic_ms();
    let mut agent = PanelAgent::new(config, &timing, SimDisplay::default(), dispatcher, now_ms);
    agent.start(now_ms);

    let published = Arc::new(Mutex::new(publish(&agent, now_ms)));
    let input_blocked = Arc::new(AtomicBool::new(false));
    let server_connected = Arc::new(AtomicBool::new(false));
    let (control_tx, control_rx) = mpsc::channel();

    spawn_control_loop(
        agent,
        store,
        control_rx,
        timing.clone(),
        published.clone(),
        input_blocked.clone(),
    )?;
    spawn_server_sync(
        transport,
        timing,
        device_id,
        control_tx.clone(),
        published.clone(),
        server_connected.clone(),
    )?;

    let app_state = AppState {
        control: control_tx,
        published,
        input_blocked,
        server_connected,
    };

    let app = Router::new()
        .route("/api/ping", get(handle_ping))
        .route("/api/info", get(handle_get_info))
        .route("/api/state", get(handle_get_state).post(handle_post_state))
        .route("/api/config", get(handle_get_config).post(handle_post_config))
        .route("/api/save", post(handle_save))
        .route("/api/time", post(handle_post_time))
        .route("/api/display", post(handle_post_display))
        .route("/api/button", post(handle_button))
        .route("/api/scene", post(handle_scene))
        .route("/api/touch", post(handle_touch))
        .with_state(app_state);

    let port = std::env::var("PANEL_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind panel server at {addr}"))?;

    info!("panel simulator listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn load_config(store: &mut FileStore) -> DeviceConfig {
    match store.load() {
        Ok(Some(raw)) => DeviceConfig::parse(&raw).unwrap_or_else(|err| {
            warn!("stored config rejected, using defaults: {err}");
            DeviceConfig::default()
        }),
        Ok(None) => {
            info!("no stored config; using defaults");
            DeviceConfig::default()
        }
        Err(err) => {
            warn!("failed to load config from store: {err}");
            DeviceConfig::default()
        }
    }
}

fn spawn_control_loop(
    mut agent: PanelAgent<SimDisplay>,
    mut store: FileStore,
    control_rx: mpsc::Receiver<ControlMessage>,
    timing: TimingConfig,
    published: Arc<Mutex<Published>>,
    input_blocked: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let mut time_source = SystemTimeSource::from_env();
    let interval = Duration::from_millis(u64::from(timing.control_loop_interval_ms));

    thread::Builder::new()
        .name("control-loop".into())
        .spawn(move || loop {
            match control_rx.recv_timeout(interval) {
                Ok(ControlMessage::Event { event, reply }) => {
                    let now_ms = monotonic_ms();
                    let result = agent
                        .handle_event(event, now_ms)
                        .map(|outcome| persist_if_requested(&agent, &mut store, outcome));
                    if let Err(err) = &result {
                        debug!("event rejected: {err}");
                    }
                    input_blocked.store(agent.input_blocked(now_ms), Ordering::Relaxed);
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
                Ok(ControlMessage::ForceTimeSync(reply)) => {
                    let synced = agent.force_time_sync(monotonic_ms(), &mut time_source);
                    let _ = reply.send(synced);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    info!("control channel closed; control loop exiting");
                    break;
                }
            }

            let now_ms = monotonic_ms();
            agent.tick(now_ms, &mut time_source);
            input_blocked.store(agent.input_blocked(now_ms), Ordering::Relaxed);
            *published.lock().unwrap() = publish(&agent, now_ms);
        })
        .context("failed to spawn control loop")?;
    Ok(())
}

fn persist_if_requested(
    agent: &PanelAgent<SimDisplay>,
    store: &mut FileStore,
    outcome: EventOutcome,
) -> EventReply {
    let saved = outcome.save_config
        && match agent
            .config_document()
            .map_err(|err| StoreError::Backend(err.to_string()))
            .and_then(|document| store.save(&document))
        {
            Ok(()) => true,
            Err(err) => {
                warn!("failed to persist config: {err}");
                false
            }
        };

    EventReply {
        saved,
        dispatch: outcome.dispatch,
        touch: outcome.touch,
    }
}

fn publish(agent: &PanelAgent<SimDisplay>, now_ms: Millis) -> Published {
    let config_document = agent.config_document().unwrap_or_else(|err| {
        warn!("config serialization failed: {err}");
        String::from("{}")
    });
    Published {
        snapshot: agent.snapshot(now_ms),
        config_document,
        report_interval_secs: agent.config().server.state_report_interval_secs,
    }
}

/// Health probing, periodic state reports and the one-shot remote config fetch.
fn spawn_server_sync(
    mut transport: SimTransport,
    timing: TimingConfig,
    device_id: String,
    control: mpsc::Sender<ControlMessage>,
    published: Arc<Mutex<Published>>,
    server_connected: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("server-sync".into())
        .spawn(move || {
            let mut monitor = ConnectivityMonitor::new(&timing);
            let mut last_report_ms: Option<Millis> = None;
            let mut fetched_config = false;

            loop {
                let now_ms = monotonic_ms();
                if let Some(connected) = monitor.poll(now_ms, &mut transport) {
                    server_connected.store(connected, Ordering::Relaxed);
                }

                if monitor.state().connected && !fetched_config {
                    fetched_config = true;
                    match transport.fetch_config(&device_id) {
                        Ok(Some(document)) => {
                            let _ = control.send(ControlMessage::Event {
                                event: PanelEvent::RemoteConfig(document),
                                reply: None,
                            });
                        }
                        Ok(None) => debug!("server has no config for `{device_id}`"),
                        Err(err) => warn!("remote config fetch failed: {err}"),
                    }
                }

                let (report, interval_ms) = {
                    let published = published.lock().unwrap();
                    let mut report = published.snapshot.state.clone();
                    report.server_connected = server_connected.load(Ordering::Relaxed);
                    (report, published.report_interval_secs.saturating_mul(1000))
                };
                let due = last_report_ms.map_or(true, |last| elapsed_ms(now_ms, last) >= interval_ms);
                if due && monitor.state().connected {
                    last_report_ms = Some(now_ms);
                    match serde_json::to_string(&report) {
                        Ok(body) => match transport.post_state(&report.device_id, &body) {
                            Ok(status) => debug!("state report sent: HTTP {status}"),
                            Err(err) => warn!("state report failed: {err}"),
                        },
                        Err(err) => warn!("state report serialization failed: {err}"),
                    }
                }

                thread::sleep(Duration::from_secs(1));
            }
        })
        .context("failed to spawn server sync")?;
    Ok(())
}

async fn handle_ping() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn handle_get_info(State(state): State<AppState>) -> impl IntoResponse {
    let mut snapshot = state.published.lock().unwrap().snapshot.clone();
    snapshot.state.server_connected = state.server_connected.load(Ordering::Relaxed);
    Json(snapshot)
}

async fn handle_get_state(State(state): State<AppState>) -> impl IntoResponse {
    let mut report = state.published.lock().unwrap().snapshot.state.clone();
    report.server_connected = state.server_connected.load(Ordering::Relaxed);
    Json(report)
}

async fn handle_post_state(
    State(state): State<AppState>,
    Json(update): Json<InboundStateUpdate>,
) -> impl IntoResponse {
    send_event(&state, PanelEvent::ServerState(update)).await
}

async fn handle_get_config(State(state): State<AppState>) -> impl IntoResponse {
    let document = state.published.lock().unwrap().config_document.clone();
    ([(header::CONTENT_TYPE, "application/json")], document)
}

async fn handle_post_config(State(state): State<AppState>, body: String) -> impl IntoResponse {
    send_event(&state, PanelEvent::ConfigDocument(body)).await
}

async fn handle_save(State(state): State<AppState>) -> impl IntoResponse {
    send_event(&state, PanelEvent::SaveRequested).await
}

async fn handle_post_time(State(state): State<AppState>, body: String) -> axum::response::Response {
    let update = if body.trim().is_empty() {
        TimeUpdate::default()
    } else {
        match serde_json::from_str::<TimeUpdate>(&body) {
            Ok(update) => update,
            Err(_) => return error_response(StatusCode::BAD_REQUEST, "Invalid JSON payload"),
        }
    };

    if let Some(timezone) = update.timezone {
        let response = send_event(&state, PanelEvent::SetTimezone(timezone)).await;
        if !response.status().is_success() || update.timestamp.is_none() {
            return response;
        }
    }

    if let Some(timestamp) = update.timestamp {
        return send_event(&state, PanelEvent::TimeFromServer(timestamp)).await;
    }

    let (reply, response) = oneshot::channel();
    if state.control.send(ControlMessage::ForceTimeSync(reply)).is_err() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Control loop stopped");
    }
    match response.await {
        Ok(synced) => Json(TimeSyncReply { synced }).into_response(),
        Err(_) => error_response(StatusCode::SERVICE_UNAVAILABLE, "Control loop stopped"),
    }
}

async fn handle_post_display(
    State(state): State<AppState>,
    Json(update): Json<DisplayUpdate>,
) -> axum::response::Response {
    if update.brightness.is_some_and(|value| value > 100) {
        return error_response(StatusCode::BAD_REQUEST, "brightness must be 0-100");
    }

    let mut response = error_response(StatusCode::BAD_REQUEST, "Nothing to update");
    if let Some(theme) = update.theme {
        response = send_event(&state, PanelEvent::SetTheme(theme)).await;
        if !response.status().is_success() {
            return response;
        }
    }
    if let Some(brightness) = update.brightness {
        response = send_event(&state, PanelEvent::SetBrightness(brightness)).await;
    }
    response
}

async fn handle_button(
    State(state): State<AppState>,
    Json(request): Json<ButtonRequest>,
) -> axum::response::Response {
    if state.input_blocked.load(Ordering::Relaxed) {
        return error_response(StatusCode::CONFLICT, "Input blocked while display wakes");
    }

    let event = match (request.speed_level, request.state) {
        (Some(level), _) => PanelEvent::FanSpeed {
            id: request.id,
            level,
        },
        (None, Some(on)) => PanelEvent::ButtonSet { id: request.id, on },
        (None, None) => PanelEvent::ButtonToggled { id: request.id },
    };
    send_event(&state, event).await
}

async fn handle_scene(
    State(state): State<AppState>,
    Json(request): Json<SceneRequest>,
) -> axum::response::Response {
    if state.input_blocked.load(Ordering::Relaxed) {
        return error_response(StatusCode::CONFLICT, "Input blocked while display wakes");
    }
    send_event(&state, PanelEvent::SceneActivated { id: request.id }).await
}

async fn handle_touch(State(state): State<AppState>) -> impl IntoResponse {
    send_event(&state, PanelEvent::Touch).await
}

async fn send_event(state: &AppState, event: PanelEvent) -> axum::response::Response {
    let (reply, response) = oneshot::channel();
    let message = ControlMessage::Event {
        event,
        reply: Some(reply),
    };
    if state.control.send(message).is_err() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Control loop stopped");
    }

    match response.await {
        Ok(Ok(reply)) => Json(reply).into_response(),
        Ok(Err(err)) => {
            let status = match err {
                AgentError::UnknownButton(_) | AgentError::UnknownScene(_) => StatusCode::NOT_FOUND,
                AgentError::InputBlocked => StatusCode::CONFLICT,
                AgentError::Config(_) | AgentError::Clock(_) | AgentError::ThemeRejected(_) => {
                    StatusCode::BAD_REQUEST
                }
            };
            error_response(status, &err.to_string())
        }
        Err(_) => error_response(StatusCode::SERVICE_UNAVAILABLE, "Control loop stopped"),
    }
}

/// Config document persisted as a single JSON file.
struct FileStore {
    path: PathBuf,
}

impl FileStore {
    fn new() -> Self {
        let data_dir = std::env::var("PANEL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.panel"));

        Self {
            path: data_dir.join("config.json"),
        }
    }
}

impl ConfigStore for FileStore {
    fn load(&mut self) -> Result<Option<String>, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::Backend(err.to_string())),
        }
    }

    fn save(&mut self, document: &str) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| StoreError::Backend(err.to_string()))?;
        }
        std::fs::write(&self.path, document).map_err(|err| StoreError::Backend(err.to_string()))?;
        info!("config saved to {}", self.path.display());
        Ok(())
    }
}

/// Stands in for the panel: remembers what it was told and logs it.
#[derive(Debug)]
struct SimDisplay {
    brightness: u8,
    theme: String,
}

impl Default for SimDisplay {
    fn default() -> Self {
        Self {
            brightness: 100,
            theme: String::new(),
        }
    }
}

impl Display for SimDisplay {
    fn apply_brightness(&mut self, percent: u8) {
        if percent != self.brightness {
            info!("display brightness {}% -> {percent}%", self.brightness);
        }
        self.brightness = percent;
    }

    fn apply_theme(&mut self, name: &str) -> bool {
        if !KNOWN_THEMES.contains(&name) {
            return false;
        }
        self.theme = name.to_string();
        true
    }

    fn request_rebuild(&mut self) {
        info!("display rebuilt with theme `{}`", self.theme);
    }

    fn current_brightness(&self) -> u8 {
        self.brightness
    }
}

/// Pretends to talk to the coordination server. Reachability comes from
/// `PANEL_SERVER_REACHABLE`.
#[derive(Debug, Clone)]
struct SimTransport {
    reachable: bool,
}

impl SimTransport {
    fn from_env() -> Self {
        let reachable = std::env::var("PANEL_SERVER_REACHABLE")
            .map(|value| !matches!(value.as_str(), "0" | "false" | "off"))
            .unwrap_or(true);
        Self { reachable }
    }

    fn check(&self) -> Result<(), TransportError> {
        if self.reachable {
            Ok(())
        } else {
            Err(TransportError::Request("server unreachable".to_string()))
        }
    }
}

impl Transport for SimTransport {
    fn post_command(&mut self, command: &OutboundCommand) -> Result<u16, TransportError> {
        self.check()?;
        info!("POST {} {}", command.path(), command.payload);
        Ok(200)
    }

    fn probe_health(&mut self) -> bool {
        self.reachable
    }

    fn post_state(&mut self, device_id: &str, body: &str) -> Result<u16, TransportError> {
        self.check()?;
        debug!("POST /api/devices/{device_id}/state ({} bytes)", body.len());
        Ok(200)
    }

    fn fetch_config(&mut self, _device_id: &str) -> Result<Option<String>, TransportError> {
        self.check()?;
        Ok(None)
    }
}

/// Host wall clock. `PANEL_HOST_TIME=off` simulates a missing time source.
struct SystemTimeSource {
    enabled: bool,
}

impl SystemTimeSource {
    fn from_env() -> Self {
        let enabled = std::env::var("PANEL_HOST_TIME")
            .map(|value| !matches!(value.as_str(), "0" | "false" | "off"))
            .unwrap_or(true);
        Self { enabled }
    }
}

impl TimeSource for SystemTimeSource {
    fn fetch_unix_time(&mut self) -> Option<i64> {
        self.enabled.then(|| Utc::now().timestamp())
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

/// Millisecond tick that wraps like the device counter.
fn monotonic_ms() -> Millis {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as Millis
}
