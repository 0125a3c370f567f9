use core::convert::TryInto;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
        Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution},
    modem::Modem,
    prelude::*,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::{EspSntp, SyncStatus},
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use panel_common::{
    dispatch_channel, elapsed_ms, AgentError, AgentSnapshot, ConfigStore, ConnectivityMonitor,
    DeviceConfig, Display, EventOutcome, InboundStateUpdate, Millis, OutboundCommand, PanelAgent,
    PanelEvent, StoreError, SubmitOutcome, TimeSource, TimingConfig, TouchDisposition, Transport,
    TransportError,
};

const NVS_NAMESPACE: &str = "panel";
const NVS_CONFIG_KEY: &str = "config_json";
const NVS_BUFFER_SIZE: usize = 4096;
const MAX_HTTP_BODY: usize = 4096;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const BACKLIGHT_PWM_HZ: u32 = 5_000;
/// The backlight goes dark below roughly half duty, so 1-100% maps onto 128-255.
const BACKLIGHT_MIN_DUTY: u32 = 128;
const THEMES: [&str; 5] = ["light_mode", "dark_clean", "dark_mode", "neon_cyberpunk", "lcars"];

type EventResult = Result<EventReply, AgentError>;

enum ControlMessage {
    Event {
        event: PanelEvent,
        reply: Option<mpsc::SyncSender<EventResult>>,
    },
}

struct Published {
    snapshot: AgentSnapshot,
    config_document: String,
    report_interval_secs: u32,
}

#[derive(Clone)]
struct SharedState {
    control: mpsc::Sender<ControlMessage>,
    published: Arc<Mutex<Published>>,
    input_blocked: Arc<AtomicBool>,
    server_connected: Arc<AtomicBool>,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
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

#[derive(Debug, Deserialize)]
struct TimeUpdate {
    timestamp: i64,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let mut nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut config = match nvs_store.load() {
        Ok(Some(raw)) => DeviceConfig::parse(&raw).unwrap_or_else(|err| {
            warn!("stored config rejected, using defaults: {err}");
            DeviceConfig::default()
        }),
        Ok(None) => DeviceConfig::default(),
        Err(err) => {
            warn!("failed to load config from NVS: {err}");
            DeviceConfig::default()
        }
    };
    let device_id = generate_device_id();
    config.ensure_device_id(&device_id);
    info!(
        "NVS config loaded: device=`{}`, server=`{}`",
        config.device.id,
        config.server.base_url()
    );

    let peripherals = Peripherals::take()?;
    let backlight = Backlight::new(
        LedcDriver::new(
            peripherals.ledc.channel0,
            LedcTimerDriver::new(
                peripherals.ledc.timer0,
                &TimerConfig::default()
                    .frequency(BACKLIGHT_PWM_HZ.Hz().into())
                    .resolution(Resolution::Bits8),
            )?,
            peripherals.pins.gpio38,
        )
        .context("failed to set up backlight PWM")?,
    );

    let wifi = match connect_wifi(peripherals.modem, sys_loop, nvs_partition) {
        Ok(wifi) => Some(wifi),
        Err(err) => {
            warn!("wifi unavailable, running offline: {err:#}");
            None
        }
    };
    let online = wifi.is_some();

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let timing = TimingConfig::default();
    let transport = EspHttpTransport::new(&timing, config.server.base_url());
    let (dispatcher, worker) = dispatch_channel(&timing, transport.clone());
    worker
        .spawn()
        .context("failed to spawn dispatch worker")?;

    let now_ms = monotonic_ms();
    let mut agent = PanelAgent::new(config, &timing, backlight, dispatcher, now_ms);
    agent.start(now_ms);

    let (control_tx, control_rx) = mpsc::channel();
    let shared_state = SharedState {
        control: control_tx,
        published: Arc::new(Mutex::new(publish(&agent, now_ms))),
        input_blocked: Arc::new(AtomicBool::new(false)),
        server_connected: Arc::new(AtomicBool::new(false)),
    };

    spawn_control_loop(
        agent,
        nvs_store.clone(),
        control_rx,
        timing.clone(),
        shared_state.clone(),
        transport.base_url.clone(),
        online,
    )?;
    if online {
        spawn_server_sync(transport, timing, device_id, shared_state.clone())?;
    }

    let server = create_http_server(shared_state)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
) -> anyhow::Result<EspWifi<'static>> {
    let (Some(ssid), pass) = (option_env!("WIFI_SSID"), option_env!("WIFI_PASS").unwrap_or(""))
    else {
        return Err(anyhow!("WIFI_SSID not set at build time"));
    };

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };
    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: ssid.try_into().map_err(|_| anyhow!("wifi ssid too long"))?,
        password: pass
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{ssid}`");

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

    if let Some(err) = last_err {
        let _ = wifi.stop();
        return Err(anyhow!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; last error: {err:#}"
        ));
    }
    Ok(esp_wifi)
}

fn spawn_control_loop(
    mut agent: PanelAgent<Backlight>,
    mut nvs_store: NvsStore,
    control_rx: mpsc::Receiver<ControlMessage>,
    timing: TimingConfig,
    state: SharedState,
    base_url: Arc<Mutex<String>>,
    online: bool,
) -> anyhow::Result<()> {
    let interval = Duration::from_millis(u64::from(timing.control_loop_interval_ms));

    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register control loop with watchdog: {err:#}");
            }

            let mut time_source = SntpTimeSource::start(online);

            loop {
                feed_watchdog();

                match control_rx.recv_timeout(interval) {
                    Ok(ControlMessage::Event { event, reply }) => {
                        let now_ms = monotonic_ms();
                        let result = agent.handle_event(event, now_ms).map(|outcome| {
                            persist_if_requested(&agent, &mut nvs_store, outcome)
                        });
                        *base_url.lock().unwrap() = agent.config().server.base_url();
                        state
                            .input_blocked
                            .store(agent.input_blocked(now_ms), Ordering::Relaxed);
                        if let Some(reply) = reply {
                            let _ = reply.send(result);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => thread::sleep(interval),
                }

                let now_ms = monotonic_ms();
                agent.tick(now_ms, &mut time_source);
                state
                    .input_blocked
                    .store(agent.input_blocked(now_ms), Ordering::Relaxed);
                *state.published.lock().unwrap() = publish(&agent, now_ms);
            }
        })
        .context("failed to spawn control loop thread")?;
    Ok(())
}

fn persist_if_requested(
    agent: &PanelAgent<Backlight>,
    nvs_store: &mut NvsStore,
    outcome: EventOutcome,
) -> EventReply {
    let saved = outcome.save_config
        && match agent
            .config_document()
            .map_err(|err| StoreError::Backend(err.to_string()))
            .and_then(|document| nvs_store.save(&document))
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

fn publish(agent: &PanelAgent<Backlight>, now_ms: Millis) -> Published {
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

fn spawn_server_sync(
    mut transport: EspHttpTransport,
    timing: TimingConfig,
    device_id: String,
    state: SharedState,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("server-sync".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            let mut monitor = ConnectivityMonitor::new(&timing);
            let mut last_report_ms: Option<Millis> = None;
            let mut fetched_config = false;

            loop {
                let now_ms = monotonic_ms();
                if let Some(connected) = monitor.poll(now_ms, &mut transport) {
                    state.server_connected.store(connected, Ordering::Relaxed);
                }

                if monitor.state().connected && !fetched_config {
                    fetched_config = true;
                    match transport.fetch_config(&device_id) {
                        Ok(Some(document)) => {
                            info!("configuration received from server");
                            let _ = state.control.send(ControlMessage::Event {
                                event: PanelEvent::RemoteConfig(document),
                                reply: None,
                            });
                        }
                        Ok(None) => debug!("server has no config for `{device_id}`"),
                        Err(err) => warn!("remote config fetch failed: {err}"),
                    }
                }

                let (report, interval_ms) = {
                    let published = state.published.lock().unwrap();
                    let mut report = published.snapshot.state.clone();
                    report.server_connected = state.server_connected.load(Ordering::Relaxed);
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
        .context("failed to spawn server sync thread")?;
    Ok(())
}

fn create_http_server(state: SharedState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/api/ping", Method::Get, move |req| {
        write_json(req, &serde_json::json!({ "status": "ok" }))
    })?;

    {
        let state = state.clone();
        server.fn_handler("/api/info", Method::Get, move |req| {
            let mut snapshot = state.published.lock().unwrap().snapshot.clone();
            snapshot.state.server_connected = state.server_connected.load(Ordering::Relaxed);
            write_json(req, &snapshot)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/state", Method::Get, move |req| {
            let mut report = state.published.lock().unwrap().snapshot.state.clone();
            report.server_connected = state.server_connected.load(Ordering::Relaxed);
            write_json(req, &report)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/state", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let Ok(update) = serde_json::from_slice::<InboundStateUpdate>(&body) else {
                return write_error(req, 400, "Invalid JSON payload");
            };
            respond_to_event(req, &state, PanelEvent::ServerState(update))
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/config", Method::Get, move |req| {
            let document = state.published.lock().unwrap().config_document.clone();
            req.into_response(
                200,
                Some("OK"),
                &[("Content-Type", "application/json; charset=utf-8")],
            )?
            .write_all(document.as_bytes())?;
            Ok(())
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/config", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let Ok(document) = String::from_utf8(body) else {
                return write_error(req, 400, "Config must be UTF-8 JSON");
            };
            respond_to_event(req, &state, PanelEvent::ConfigDocument(document))
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/save", Method::Post, move |req| {
            respond_to_event(req, &state, PanelEvent::SaveRequested)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/time", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let Ok(update) = serde_json::from_slice::<TimeUpdate>(&body) else {
                return write_error(req, 400, "Expected {\"timestamp\": <unix seconds>}");
            };
            respond_to_event(req, &state, PanelEvent::TimeFromServer(update.timestamp))
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/button", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let Ok(request) = serde_json::from_slice::<ButtonRequest>(&body) else {
                return write_error(req, 400, "Invalid JSON payload");
            };
            if state.input_blocked.load(Ordering::Relaxed) {
                return write_error(req, 409, "Input blocked while display wakes");
            }

            let event = match (request.speed_level, request.state) {
                (Some(level), _) => PanelEvent::FanSpeed {
                    id: request.id,
                    level,
                },
                (None, Some(on)) => PanelEvent::ButtonSet { id: request.id, on },
                (None, None) => PanelEvent::ButtonToggled { id: request.id },
            };
            respond_to_event(req, &state, event)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/scene", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let Ok(request) = serde_json::from_slice::<SceneRequest>(&body) else {
                return write_error(req, 400, "Invalid JSON payload");
            };
            if state.input_blocked.load(Ordering::Relaxed) {
                return write_error(req, 409, "Input blocked while display wakes");
            }
            respond_to_event(req, &state, PanelEvent::SceneActivated { id: request.id })
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/touch", Method::Post, move |req| {
            respond_to_event(req, &state, PanelEvent::Touch)
        })?;
    }

    Ok(server)
}

fn respond_to_event(
    req: esp_idf_svc::http::server::Request<&mut esp_idf_svc::http::server::EspHttpConnection<'_>>,
    state: &SharedState,
    event: PanelEvent,
) -> anyhow::Result<()> {
    let (reply, response) = mpsc::sync_channel(1);
    let message = ControlMessage::Event {
        event,
        reply: Some(reply),
    };
    if state.control.send(message).is_err() {
        return write_error(req, 503, "Control loop stopped");
    }

    match response.recv_timeout(Duration::from_secs(5)) {
        Ok(Ok(reply)) => write_json(req, &reply),
        Ok(Err(err)) => {
            let status = match err {
                AgentError::UnknownButton(_) | AgentError::UnknownScene(_) => 404,
                AgentError::InputBlocked => 409,
                AgentError::Config(_) | AgentError::Clock(_) | AgentError::ThemeRejected(_) => 400,
            };
            write_error(req, status, &err.to_string())
        }
        Err(_) => write_error(req, 503, "Control loop did not answer"),
    }
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
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

/// LEDC-driven backlight.
struct Backlight {
    driver: LedcDriver<'static>,
    brightness: u8,
    theme: String,
}

impl Backlight {
    fn new(driver: LedcDriver<'static>) -> Self {
        Self {
            driver,
            brightness: 0,
            theme: String::new(),
        }
    }
}

fn backlight_duty(percent: u8, max_duty: u32) -> u32 {
    match u32::from(percent.min(100)) {
        0 => 0,
        percent => BACKLIGHT_MIN_DUTY + (percent - 1) * max_duty.saturating_sub(BACKLIGHT_MIN_DUTY) / 99,
    }
}

impl Display for Backlight {
    fn apply_brightness(&mut self, percent: u8) {
        let duty = backlight_duty(percent, self.driver.get_max_duty());
        match self.driver.set_duty(duty) {
            Ok(()) => {
                debug!("backlight {percent}% (duty {duty})");
                self.brightness = percent;
            }
            Err(err) => warn!("failed to set backlight duty: {err}"),
        }
    }

    fn apply_theme(&mut self, name: &str) -> bool {
        if !THEMES.contains(&name) {
            return false;
        }
        self.theme = name.to_string();
        true
    }

    fn request_rebuild(&mut self) {
        info!("UI rebuild requested with theme `{}`", self.theme);
    }

    fn current_brightness(&self) -> u8 {
        self.brightness
    }
}

/// Unix time from SNTP once the first sync has completed.
struct SntpTimeSource {
    sntp: Option<EspSntp<'static>>,
}

impl SntpTimeSource {
    fn start(online: bool) -> Self {
        if !online {
            return Self { sntp: None };
        }
        match EspSntp::new_default() {
            Ok(sntp) => {
                info!("SNTP initialized");
                Self { sntp: Some(sntp) }
            }
            Err(err) => {
                warn!("failed to start SNTP: {err}");
                Self { sntp: None }
            }
        }
    }
}

impl TimeSource for SntpTimeSource {
    fn fetch_unix_time(&mut self) -> Option<i64> {
        let sntp = self.sntp.as_ref()?;
        if sntp.get_sync_status() != SyncStatus::Completed {
            return None;
        }
        let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?;
        now.as_secs().try_into().ok()
    }
}

/// Coordination server client. Opens a fresh connection per request.
#[derive(Clone)]
struct EspHttpTransport {
    base_url: Arc<Mutex<String>>,
    request_timeout: Duration,
    probe_timeout: Duration,
}

impl EspHttpTransport {
    fn new(timing: &TimingConfig, base_url: String) -> Self {
        Self {
            base_url: Arc::new(Mutex::new(base_url)),
            request_timeout: Duration::from_millis(u64::from(timing.request_timeout_ms)),
            probe_timeout: Duration::from_millis(u64::from(timing.probe_timeout_ms)),
        }
    }

    fn send(
        &self,
        method: Method,
        path: &str,
        body: &str,
        timeout: Duration,
    ) -> Result<(u16, Vec<u8>), TransportError> {
        let base_url = self.base_url.lock().unwrap().clone();
        if base_url.is_empty() {
            return Err(TransportError::NotConfigured);
        }
        let url = format!("{base_url}{path}");

        let http_conf = HttpClientConfiguration {
            timeout: Some(timeout),
            ..Default::default()
        };
        let mut client =
            HttpClient::wrap(EspHttpConnection::new(&http_conf).map_err(request_error)?);

        let content_length = body.len().to_string();
        let headers = [
            ("Content-Type", "application/json"),
            ("Content-Length", content_length.as_str()),
        ];
        let mut request = client
            .request(method, &url, &headers)
            .map_err(request_error)?;
        if !body.is_empty() {
            request.write_all(body.as_bytes()).map_err(request_error)?;
        }
        let mut response = request.submit().map_err(request_error)?;
        let status = response.status();

        let mut payload = Vec::new();
        let mut chunk = [0_u8; 512];
        loop {
            let read = response.read(&mut chunk).map_err(request_error)?;
            if read == 0 {
                break;
            }
            if payload.len() + read > MAX_HTTP_BODY {
                return Err(TransportError::Request("response body too large".to_string()));
            }
            payload.extend_from_slice(&chunk[..read]);
        }
        Ok((status, payload))
    }
}

fn request_error(err: impl core::fmt::Debug) -> TransportError {
    TransportError::Request(format!("{err:?}"))
}

impl Transport for EspHttpTransport {
    fn post_command(&mut self, command: &OutboundCommand) -> Result<u16, TransportError> {
        let (status, _) = self.send(
            Method::Post,
            &command.path(),
            &command.payload,
            self.request_timeout,
        )?;
        Ok(status)
    }

    fn probe_health(&mut self) -> bool {
        self.send(Method::Get, "/api/ping", "", self.probe_timeout)
            .is_ok_and(|(status, _)| (200..300).contains(&status))
    }

    fn post_state(&mut self, device_id: &str, body: &str) -> Result<u16, TransportError> {
        let path = format!("/api/devices/{device_id}/state");
        let (status, _) = self.send(Method::Post, &path, body, self.request_timeout)?;
        Ok(status)
    }

    fn fetch_config(&mut self, device_id: &str) -> Result<Option<String>, TransportError> {
        let path = format!("/api/devices/{device_id}/config");
        let (status, body) = self.send(Method::Get, &path, "", self.request_timeout)?;
        match status {
            200..=299 => String::from_utf8(body)
                .map(Some)
                .map_err(|_| TransportError::Request("config is not UTF-8".to_string())),
            404 => Ok(None),
            status => Err(TransportError::Status(status)),
        }
    }
}

impl ConfigStore for NvsStore {
    fn load(&mut self) -> Result<Option<String>, StoreError> {
        let _guard = self.lock.lock().unwrap();
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true).map_err(store_error)?;
        let mut buffer = vec![0_u8; NVS_BUFFER_SIZE];

        let value = nvs
            .get_str(NVS_CONFIG_KEY, &mut buffer)
            .map_err(store_error)?;
        Ok(value.map(str::to_string))
    }

    fn save(&mut self, document: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs =
            EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true).map_err(store_error)?;
        nvs.set_str(NVS_CONFIG_KEY, document).map_err(store_error)?;
        info!("config saved to NVS ({} bytes)", document.len());
        Ok(())
    }
}

fn store_error(err: esp_idf_sys::EspError) -> StoreError {
    StoreError::Backend(err.to_string())
}

/// `esp32-` followed by the last three bytes of the station MAC.
fn generate_device_id() -> String {
    let mut mac = [0_u8; 6];
    let rc = unsafe {
        esp_idf_sys::esp_read_mac(
            mac.as_mut_ptr(),
            esp_idf_sys::esp_mac_type_t_ESP_MAC_WIFI_STA,
        )
    };
    if rc != esp_idf_sys::ESP_OK {
        warn!("failed to read MAC address: esp_err_t={rc}");
    }
    format!("esp32-{:02x}{:02x}{:02x}", mac[3], mac[4], mac[5])
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_sys::ESP_OK || rc == esp_idf_sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_sys::ESP_OK || rc == esp_idf_sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_sys::esp_task_wdt_reset() };
}

fn monotonic_ms() -> Millis {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as Millis
}
