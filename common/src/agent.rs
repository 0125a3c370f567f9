//! Top-level device context owned by the control loop.
//!
//! `PanelAgent` ties the clock, both schedulers, the state store and the
//! outbound dispatcher together. It is driven by two entry points:
//! [`PanelAgent::tick`] on every loop iteration and
//! [`PanelAgent::handle_event`] for anything arriving from the UI or network.

use log::{info, warn};
use serde::Serialize;

use crate::{
    brightness::{BrightnessScheduler, WakeMode},
    clock::{elapsed_ms, ClockService, ClockState, Millis, TimeSource},
    collab::Display,
    config::{ButtonKind, DeviceConfig, TimingConfig},
    dispatch::{DispatchCounters, Dispatcher, OutboundCommand, SubmitOutcome},
    error::{AgentError, ConfigError},
    events::PanelEvent,
    state::{DeviceState, InboundStateUpdate, StateMutation, StateReport},
    theme::ThemeScheduler,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TouchDisposition {
    /// The touch woke the display and must not reach the UI.
    Consumed,
    /// The display is dim or inside the wake grace window.
    Blocked,
    Pass,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventOutcome {
    pub save_config: bool,
    pub dispatch: Option<SubmitOutcome>,
    pub touch: Option<TouchDisposition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleStatus {
    pub enabled: bool,
    pub mode: WakeMode,
    #[serde(rename = "currentPeriod")]
    pub current_period: Option<String>,
    #[serde(rename = "scheduledBrightness")]
    pub scheduled_brightness: u8,
    #[serde(rename = "targetBrightness")]
    pub target_brightness: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThemeStatus {
    pub enabled: bool,
    pub night: Option<bool>,
    #[serde(rename = "appliedTheme")]
    pub applied_theme: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentSnapshot {
    #[serde(rename = "localTime")]
    pub local_time: Option<String>,
    pub clock: ClockState,
    #[serde(rename = "inputBlocked")]
    pub input_blocked: bool,
    pub schedule: ScheduleStatus,
    #[serde(rename = "dayNight")]
    pub day_night: ThemeStatus,
    pub dispatch: DispatchCounters,
    pub state: StateReport,
}

pub struct PanelAgent<D> {
    config: DeviceConfig,
    display: D,
    clock: ClockService,
    brightness: BrightnessScheduler,
    theme: ThemeScheduler,
    state: DeviceState,
    dispatcher: Dispatcher,
    boot_ms: Millis,
}

impl<D: Display> PanelAgent<D> {
    pub fn new(
        config: DeviceConfig,
        timing: &TimingConfig,
        display: D,
        dispatcher: Dispatcher,
        now_ms: Millis,
    ) -> Self {
        let brightness = BrightnessScheduler::new(
            config.display.schedule.clone(),
            config.display.brightness,
            timing,
        );
        let theme = ThemeScheduler::new(config.display.day_night_mode.clone());
        let state = DeviceState::from_config(&config);

        Self {
            config,
            display,
            clock: ClockService::new(timing),
            brightness,
            theme,
            state,
            dispatcher,
            boot_ms: now_ms,
        }
    }

    /// Pushes the configured look to the display and primes both schedulers.
    pub fn start(&mut self, now_ms: Millis) {
        info!(
            "panel agent starting as `{}` ({} buttons, {} scenes)",
            self.config.device.id,
            self.config.buttons.len(),
            self.config.scenes.len()
        );
        self.apply_configured_look(now_ms);
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    pub fn clock(&self) -> &ClockService {
        &self.clock
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    /// Polls the clock and both schedulers. Returns true when anything changed.
    pub fn tick(&mut self, now_ms: Millis, source: &mut dyn TimeSource) -> bool {
        let synced = self.clock.poll(now_ms, source);

        let brightness_changed = self
            .brightness
            .tick(now_ms, &self.clock, &mut self.display);
        let theme_changed = self.theme.tick(now_ms, &self.clock, &mut self.display);
        self.record_scheduler_output(brightness_changed, theme_changed);

        synced || brightness_changed || theme_changed
    }

    pub fn force_time_sync(&mut self, now_ms: Millis, source: &mut dyn TimeSource) -> bool {
        self.clock.force_sync(now_ms, source)
    }

    pub fn handle_event(
        &mut self,
        event: PanelEvent,
        now_ms: Millis,
    ) -> Result<EventOutcome, AgentError> {
        let mut outcome = EventOutcome::default();

        if event.is_user_input() && self.input_blocked(now_ms) {
            return Err(AgentError::InputBlocked);
        }

        match event {
            PanelEvent::ButtonToggled { id } => {
                let on = !self.state.button(id).is_some_and(|button| button.on);
                outcome.dispatch = Some(self.press_button(id, on, now_ms)?);
            }
            PanelEvent::ButtonSet { id, on } => {
                outcome.dispatch = Some(self.press_button(id, on, now_ms)?);
            }
            PanelEvent::FanSpeed { id, level } => {
                if self.config.button(id).is_none() {
                    return Err(AgentError::UnknownButton(id));
                }
                self.state.apply(StateMutation::FanSpeed { id, level });
                let live = self.state.button(id).copied().unwrap_or_default();
                let command = OutboundCommand::button(
                    &self.config.device.id,
                    id,
                    live.on,
                    Some(live.speed_level),
                    now_ms,
                );
                outcome.dispatch = Some(self.dispatcher.submit(command, now_ms));
            }
            PanelEvent::SceneActivated { id } => {
                outcome.dispatch = Some(self.activate_scene(id, now_ms)?);
            }
            PanelEvent::Touch => {
                outcome.touch = Some(self.filter_touch(now_ms));
            }
            PanelEvent::ServerState(update) => self.apply_server_state(&update),
            PanelEvent::ConfigDocument(raw) => {
                self.apply_config_document(&raw, now_ms)?;
                outcome.save_config = true;
            }
            PanelEvent::RemoteConfig(raw) => {
                self.apply_remote_config(&raw, now_ms)?;
                outcome.save_config = true;
            }
            PanelEvent::TimeFromServer(unix_ts) => {
                self.clock.inject_authoritative_time(unix_ts, now_ms)?;
            }
            PanelEvent::SetBrightness(value) => self.set_manual_brightness(value),
            PanelEvent::SetTheme(name) => {
                if !self.display.apply_theme(&name) {
                    return Err(AgentError::ThemeRejected(name));
                }
                self.display.request_rebuild();
                self.config.display.theme = name.clone();
                self.state.apply(StateMutation::Theme(name));
            }
            PanelEvent::SetTimezone(name) => {
                self.clock.set_timezone(&name)?;
                if !name.trim().is_empty() {
                    self.config.display.schedule.timezone = name.trim().to_string();
                    self.brightness.reconfigure(
                        self.config.display.schedule.clone(),
                        self.config.display.brightness,
                    );
                }
            }
            PanelEvent::SaveRequested => outcome.save_config = true,
        }

        Ok(outcome)
    }

    /// Decides what happens to a touch before the UI sees it.
    pub fn filter_touch(&mut self, now_ms: Millis) -> TouchDisposition {
        let actual = self.display.current_brightness();
        if self.brightness.on_touch(now_ms, actual, &mut self.display) {
            let woke_to = self.display.current_brightness();
            self.state.apply(StateMutation::Brightness(woke_to));
            return TouchDisposition::Consumed;
        }
        if self.input_blocked(now_ms) {
            return TouchDisposition::Blocked;
        }
        TouchDisposition::Pass
    }

    pub fn input_blocked(&self, now_ms: Millis) -> bool {
        self.brightness
            .should_block_input(now_ms, self.display.current_brightness())
    }

    /// Replaces the configuration only when the whole document is valid.
    pub fn apply_config_document(&mut self, raw: &str, now_ms: Millis) -> Result<(), ConfigError> {
        let incoming = DeviceConfig::parse(raw).inspect_err(|err| {
            warn!("configuration rejected: {err}");
        })?;
        self.install(incoming, now_ms);
        Ok(())
    }

    /// Like [`Self::apply_config_document`] but keeps the locally set reporting URL.
    pub fn apply_remote_config(&mut self, raw: &str, now_ms: Millis) -> Result<(), ConfigError> {
        let mut incoming = DeviceConfig::parse(raw).inspect_err(|err| {
            warn!("server configuration rejected: {err}");
        })?;
        incoming.server.reporting_url = self.config.server.reporting_url.clone();
        self.install(incoming, now_ms);
        Ok(())
    }

    /// Current document with live button, theme and brightness values folded in.
    pub fn config_document(&self) -> Result<String, ConfigError> {
        let mut config = self.config.clone();
        self.state.write_back(&mut config);
        config.to_json()
    }

    pub fn state_report(&self, now_ms: Millis) -> StateReport {
        let uptime_secs = u64::from(elapsed_ms(now_ms, self.boot_ms) / 1000);
        StateReport::build(
            &self.config,
            &self.state,
            uptime_secs,
            self.clock.is_synced(),
        )
    }

    pub fn snapshot(&self, now_ms: Millis) -> AgentSnapshot {
        let local_time = if self.clock.is_synced() {
            self.clock
                .local_time(now_ms)
                .map(|local| local.format("%H:%M").to_string())
        } else {
            None
        };

        AgentSnapshot {
            local_time,
            clock: self.clock.state(),
            input_blocked: self.input_blocked(now_ms),
            schedule: ScheduleStatus {
                enabled: self.brightness.is_enabled(),
                mode: self.brightness.mode(),
                current_period: self
                    .brightness
                    .active_period()
                    .map(|period| period.name.clone()),
                scheduled_brightness: self.brightness.scheduled_brightness(),
                target_brightness: self.brightness.target_brightness(&self.clock),
            },
            day_night: ThemeStatus {
                enabled: self.theme.is_enabled(),
                night: self.theme.is_night(),
                applied_theme: self.theme.applied_theme().map(str::to_string),
            },
            dispatch: self.dispatcher.counters(),
            state: self.state_report(now_ms),
        }
    }

    fn press_button(&mut self, id: u8, on: bool, now_ms: Millis) -> Result<SubmitOutcome, AgentError> {
        let button = self.config.button(id).ok_or(AgentError::UnknownButton(id))?;
        let (kind, device_id) = (button.kind, self.config.device.id.clone());

        let command = match kind {
            // Scene buttons only fire a press; they hold no state of their own.
            ButtonKind::Scene => OutboundCommand::button(&device_id, id, true, None, now_ms),
            ButtonKind::Fan => {
                self.state.apply(StateMutation::Button { id, on });
                let level = self.state.button(id).map(|live| live.speed_level);
                OutboundCommand::button(&device_id, id, on, level, now_ms)
            }
            ButtonKind::Light | ButtonKind::Switch => {
                self.state.apply(StateMutation::Button { id, on });
                OutboundCommand::button(&device_id, id, on, None, now_ms)
            }
        };
        Ok(self.dispatcher.submit(command, now_ms))
    }

    fn activate_scene(&mut self, id: u8, now_ms: Millis) -> Result<SubmitOutcome, AgentError> {
        let scene = self.config.scene(id).ok_or(AgentError::UnknownScene(id))?;
        match scene.name.as_str() {
            "All Off" => {
                self.state.apply(StateMutation::AllButtons(false));
            }
            "All On" => {
                self.state.apply(StateMutation::AllButtons(true));
            }
            _ => {}
        }

        let command = OutboundCommand::scene(&self.config.device.id, id, now_ms);
        Ok(self.dispatcher.submit(command, now_ms))
    }

    fn apply_server_state(&mut self, update: &InboundStateUpdate) {
        for mutation in update.button_mutations() {
            self.state.apply(mutation);
        }
        if let Some(value) = update.brightness {
            self.set_manual_brightness(value);
        }
    }

    fn set_manual_brightness(&mut self, value: u8) {
        let value = value.min(100);
        self.display.apply_brightness(value);
        self.config.display.brightness = value;
        self.brightness.set_manual_brightness(value);
        self.state.apply(StateMutation::Brightness(value));
    }

    fn install(&mut self, mut incoming: DeviceConfig, now_ms: Millis) {
        incoming.ensure_device_id(&self.config.device.id);
        info!(
            "configuration accepted: {} buttons, {} scenes, schedule {}",
            incoming.buttons.len(),
            incoming.scenes.len(),
            if incoming.display.schedule.enabled { "on" } else { "off" }
        );

        self.config = incoming;
        self.state = DeviceState::from_config(&self.config);
        self.brightness.reconfigure(
            self.config.display.schedule.clone(),
            self.config.display.brightness,
        );
        self.theme
            .reconfigure(self.config.display.day_night_mode.clone());
        self.apply_configured_look(now_ms);
        self.display.request_rebuild();
    }

    fn apply_configured_look(&mut self, now_ms: Millis) {
        if let Err(err) = self
            .clock
            .set_timezone(&self.config.display.schedule.timezone)
        {
            warn!("configured timezone ignored: {err}");
        }

        if !self.config.display.day_night_mode.enabled
            && !self.display.apply_theme(&self.config.display.theme)
        {
            warn!("configured theme `{}` unavailable", self.config.display.theme);
        }
        if !self.config.display.schedule.is_active() {
            self.display.apply_brightness(self.config.display.brightness);
        }

        self.brightness
            .refresh(now_ms, &mut self.clock, &mut self.display);
        self.theme.refresh(now_ms, &self.clock, &mut self.display);
        self.record_scheduler_output(true, true);
    }

    fn record_scheduler_output(&mut self, brightness_changed: bool, theme_changed: bool) {
        if brightness_changed {
            let applied = self.display.current_brightness();
            self.state.apply(StateMutation::Brightness(applied));
        }
        if theme_changed {
            if let Some(theme) = self.theme.applied_theme() {
                self.state.apply(StateMutation::Theme(theme.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::tests::unix;
    use crate::collab::testing::{RecordingDisplay, RecordingTransport};
    use crate::config::{BrightnessScheduleConfig, SchedulePeriod};
    use crate::dispatch::{dispatch_channel, DispatchWorker};
    use pretty_assertions::assert_eq;

    type TestAgent = PanelAgent<RecordingDisplay>;

    fn scheduled_config() -> DeviceConfig {
        let mut config = DeviceConfig::default();
        config.device.id = "esp32-c0ffee".to_string();
        config.display.schedule = BrightnessScheduleConfig {
            enabled: true,
            periods: vec![
                SchedulePeriod {
                    name: "Day".to_string(),
                    start_hour: 6,
                    start_minute: 0,
                    brightness: 80,
                },
                SchedulePeriod {
                    name: "Night".to_string(),
                    start_hour: 22,
                    start_minute: 0,
                    brightness: 0,
                },
            ],
            touch_brightness: 90,
            display_timeout_secs: 30,
            timezone: "UTC".to_string(),
        };
        config
    }

    fn agent(config: DeviceConfig) -> (TestAgent, DispatchWorker<RecordingTransport>) {
        let timing = TimingConfig {
            dispatch_item_delay_ms: 0,
            ..TimingConfig::default()
        };
        let (dispatcher, worker) = dispatch_channel(&timing, RecordingTransport::default());
        let mut agent = PanelAgent::new(config, &timing, RecordingDisplay::at(100), dispatcher, 0);
        agent.start(0);
        (agent, worker)
    }

    fn no_time() -> impl FnMut() -> Option<i64> {
        || None
    }

    #[test]
    fn unsynced_start_holds_fallback_brightness() {
        let (mut agent, _worker) = agent(scheduled_config());
        agent.tick(50, &mut no_time());

        assert_eq!(agent.display().brightness, 50);
        assert_eq!(agent.state().brightness(), 50);
        assert_eq!(agent.snapshot(50).local_time, None);
    }

    #[test]
    fn sync_moves_display_to_scheduled_period() {
        let (mut agent, _worker) = agent(scheduled_config());
        let mut source = || Some(unix(12, 0));

        assert!(agent.tick(100, &mut source));

        assert_eq!(agent.display().brightness, 80);
        let snapshot = agent.snapshot(100);
        assert_eq!(snapshot.local_time.as_deref(), Some("12:00"));
        assert_eq!(snapshot.schedule.current_period.as_deref(), Some("Day"));
        assert_eq!(snapshot.state.brightness, 80);
    }

    #[test]
    fn touch_on_dark_display_is_consumed_then_blocked() {
        let (mut agent, _worker) = agent(scheduled_config());
        agent.handle_event(PanelEvent::TimeFromServer(unix(23, 0)), 10).unwrap();
        agent.tick(20, &mut no_time());
        assert_eq!(agent.display().brightness, 0);

        let first = agent.handle_event(PanelEvent::Touch, 1_000).unwrap();
        assert_eq!(first.touch, Some(TouchDisposition::Consumed));
        assert_eq!(agent.display().brightness, 90);

        assert_eq!(agent.filter_touch(1_200), TouchDisposition::Blocked);
        assert_eq!(agent.filter_touch(1_600), TouchDisposition::Pass);
    }

    #[test]
    fn toggling_a_light_updates_state_and_dispatches() {
        let (mut agent, worker) = agent(DeviceConfig::default());

        let outcome = agent
            .handle_event(PanelEvent::ButtonToggled { id: 2 }, 1_000)
            .unwrap();

        assert_eq!(outcome.dispatch, Some(SubmitOutcome::Queued));
        assert_eq!(agent.state().button(2).map(|b| b.on), Some(true));
        drop(worker);
    }

    #[test]
    fn rapid_presses_are_rate_limited_but_state_still_changes() {
        let (mut agent, _worker) = agent(DeviceConfig::default());

        agent
            .handle_event(PanelEvent::ButtonToggled { id: 1 }, 1_000)
            .unwrap();
        let second = agent
            .handle_event(PanelEvent::ButtonToggled { id: 3 }, 1_050)
            .unwrap();

        assert_eq!(second.dispatch, Some(SubmitOutcome::RateLimited));
        assert_eq!(agent.state().button(3).map(|b| b.on), Some(true));
        assert_eq!(agent.snapshot(1_050).dispatch.queued, 1);
    }

    #[test]
    fn all_on_scene_sets_every_button() {
        let (mut agent, _worker) = agent(DeviceConfig::default());

        agent
            .handle_event(PanelEvent::SceneActivated { id: 2 }, 1_000)
            .unwrap();
        assert!((1..=4).all(|id| agent.state().button(id).is_some_and(|b| b.on)));

        agent
            .handle_event(PanelEvent::SceneActivated { id: 1 }, 2_000)
            .unwrap();
        assert!((1..=4).all(|id| agent.state().button(id).is_some_and(|b| !b.on)));
    }

    #[test]
    fn unknown_targets_are_errors() {
        let (mut agent, _worker) = agent(DeviceConfig::default());

        assert!(matches!(
            agent.handle_event(PanelEvent::ButtonToggled { id: 9 }, 0),
            Err(AgentError::UnknownButton(9))
        ));
        assert!(matches!(
            agent.handle_event(PanelEvent::SceneActivated { id: 9 }, 0),
            Err(AgentError::UnknownScene(9))
        ));
    }

    #[test]
    fn invalid_config_leaves_everything_unchanged() {
        let (mut agent, _worker) = agent(scheduled_config());
        agent
            .handle_event(PanelEvent::ButtonSet { id: 1, on: true }, 1_000)
            .unwrap();
        let before_config = agent.config().clone();
        let before_state = agent.state().clone();

        let raw = r#"{"buttons": [{"id": 1, "name": "Only"}], "display": {"theme": "lcars",
            "schedule": {"periods": [{"startHour": 30}]}}}"#;
        let result = agent.handle_event(PanelEvent::ConfigDocument(raw.to_string()), 2_000);

        assert!(matches!(result, Err(AgentError::Config(_))));
        assert_eq!(agent.config(), &before_config);
        assert_eq!(agent.state(), &before_state);
    }

    #[test]
    fn valid_config_is_installed_and_saved() {
        let (mut agent, _worker) = agent(DeviceConfig::default());
        let rebuilds_before = agent.display().rebuilds;

        let raw = r#"{"display": {"theme": "lcars", "brightness": 40},
            "buttons": [{"id": 9, "name": "Porch", "type": "switch"}]}"#;
        let outcome = agent
            .handle_event(PanelEvent::ConfigDocument(raw.to_string()), 500)
            .unwrap();

        assert!(outcome.save_config);
        assert_eq!(agent.config().buttons.len(), 1);
        assert_eq!(agent.config().device.id, "");
        assert_eq!(agent.display().theme, "lcars");
        assert_eq!(agent.display().brightness, 40);
        assert!(agent.display().rebuilds > rebuilds_before);
        assert!(agent.state().button(9).is_some());
    }

    #[test]
    fn remote_config_keeps_local_reporting_url() {
        let mut config = DeviceConfig::default();
        config.server.reporting_url = "http://hub.lan:3000".to_string();
        let (mut agent, _worker) = agent(config);

        let raw = r#"{"server": {"reportingUrl": "http://elsewhere:1"}, "device": {"name": "Den"}}"#;
        agent
            .handle_event(PanelEvent::RemoteConfig(raw.to_string()), 0)
            .unwrap();

        assert_eq!(agent.config().server.reporting_url, "http://hub.lan:3000");
        assert_eq!(agent.config().device.name, "Den");
    }

    #[test]
    fn server_state_updates_buttons_and_brightness() {
        let (mut agent, _worker) = agent(DeviceConfig::default());
        let update = InboundStateUpdate::parse(
            r#"{"buttons": [{"id": 4, "state": true}], "brightness": 33}"#,
        )
        .unwrap();

        agent
            .handle_event(PanelEvent::ServerState(update), 0)
            .unwrap();

        assert_eq!(agent.state().button(4).map(|b| b.on), Some(true));
        assert_eq!(agent.display().brightness, 33);
        assert_eq!(agent.config().display.brightness, 33);
    }

    #[test]
    fn config_document_reflects_live_state() {
        let (mut agent, _worker) = agent(DeviceConfig::default());
        agent
            .handle_event(PanelEvent::ButtonSet { id: 4, on: true }, 1_000)
            .unwrap();

        let saved = DeviceConfig::parse(&agent.config_document().unwrap()).unwrap();

        assert!(saved.button(4).is_some_and(|b| b.state));
    }

    #[test]
    fn rejected_theme_is_reported() {
        let (mut agent, _worker) = agent(DeviceConfig::default());

        let result = agent.handle_event(PanelEvent::SetTheme("sepia".to_string()), 0);

        assert!(matches!(result, Err(AgentError::ThemeRejected(_))));
        assert_eq!(agent.state().theme(), "dark_clean");
    }

    #[test]
    fn presses_inside_wake_grace_are_refused() {
        let mut config = scheduled_config();
        config.display.schedule.periods[1].brightness = 3;
        let (mut agent, _worker) = agent(config);
        agent.handle_event(PanelEvent::TimeFromServer(unix(23, 0)), 10).unwrap();
        agent.tick(20, &mut no_time());
        assert_eq!(agent.display().brightness, 3);

        let touch = agent.handle_event(PanelEvent::Touch, 1_000).unwrap();
        assert_eq!(touch.touch, Some(TouchDisposition::Consumed));

        for event in [
            PanelEvent::ButtonToggled { id: 1 },
            PanelEvent::ButtonSet { id: 2, on: true },
            PanelEvent::FanSpeed { id: 4, level: 2 },
            PanelEvent::SceneActivated { id: 2 },
        ] {
            assert!(matches!(
                agent.handle_event(event, 1_200),
                Err(AgentError::InputBlocked)
            ));
        }
        assert!((1..=4).all(|id| agent.state().button(id).is_some_and(|b| !b.on)));
        assert_eq!(agent.snapshot(1_200).dispatch.queued, 0);

        let later = agent
            .handle_event(PanelEvent::ButtonToggled { id: 1 }, 1_600)
            .unwrap();
        assert_eq!(later.dispatch, Some(SubmitOutcome::Queued));
    }

    #[test]
    fn save_keeps_manual_brightness_under_dark_schedule() {
        let mut config = scheduled_config();
        config.display.brightness = 70;
        let (mut agent, _worker) = agent(config);
        agent.handle_event(PanelEvent::TimeFromServer(unix(23, 0)), 10).unwrap();
        agent.tick(20, &mut no_time());
        assert_eq!(agent.display().brightness, 0);
        assert_eq!(agent.state_report(20).brightness, 0);

        let outcome = agent.handle_event(PanelEvent::SaveRequested, 30).unwrap();
        let saved = DeviceConfig::parse(&agent.config_document().unwrap()).unwrap();

        assert!(outcome.save_config);
        assert_eq!(saved.display.brightness, 70);
    }

    #[test]
    fn out_of_range_server_time_is_rejected() {
        let (mut agent, _worker) = agent(scheduled_config());

        let result = agent.handle_event(PanelEvent::TimeFromServer(i64::MAX / 1000), 10);

        assert!(matches!(result, Err(AgentError::Clock(_))));
        assert!(!agent.clock().is_synced());
    }
}
