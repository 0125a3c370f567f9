use serde::{Deserialize, Serialize};

use crate::{
    clock::{Millis, DEFAULT_TIMEZONE},
    error::ConfigError,
};

pub const MAX_BUTTONS: usize = 6;
pub const MAX_SCENES: usize = 2;
pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimingConfig {
    pub sync_retry_interval_ms: Millis,
    pub resync_interval_ms: Millis,
    pub dispatch_min_interval_ms: Millis,
    pub dispatch_queue_capacity: usize,
    pub dispatch_item_delay_ms: Millis,
    pub request_timeout_ms: Millis,
    pub probe_interval_ms: Millis,
    pub probe_timeout_ms: Millis,
    pub wake_grace_ms: Millis,
    pub dim_threshold: u8,
    pub fallback_brightness: u8,
    pub control_loop_interval_ms: Millis,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            sync_retry_interval_ms: 60_000,
            resync_interval_ms: 3_600_000,
            dispatch_min_interval_ms: 100,
            dispatch_queue_capacity: 3,
            dispatch_item_delay_ms: 50,
            request_timeout_ms: 3_000,
            probe_interval_ms: 30_000,
            probe_timeout_ms: 2_000,
            wake_grace_ms: 500,
            dim_threshold: 5,
            fallback_brightness: 50,
            control_loop_interval_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulePeriod {
    pub name: String,
    #[serde(rename = "startHour")]
    pub start_hour: u8,
    #[serde(rename = "startMinute")]
    pub start_minute: u8,
    pub brightness: u8,
}

impl Default for SchedulePeriod {
    fn default() -> Self {
        Self {
            name: String::new(),
            start_hour: 0,
            start_minute: 0,
            brightness: 100,
        }
    }
}

impl SchedulePeriod {
    pub fn start_minute_of_day(&self) -> u16 {
        u16::from(self.start_hour) * 60 + u16::from(self.start_minute)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BrightnessScheduleConfig {
    pub enabled: bool,
    pub periods: Vec<SchedulePeriod>,
    #[serde(rename = "touchBrightness")]
    pub touch_brightness: u8,
    #[serde(rename = "displayTimeout")]
    pub display_timeout_secs: u32,
    pub timezone: String,
}

impl Default for BrightnessScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            periods: Vec::new(),
            touch_brightness: 80,
            display_timeout_secs: 30,
            timezone: DEFAULT_TIMEZONE.to_string(),
        }
    }
}

impl BrightnessScheduleConfig {
    pub fn is_active(&self) -> bool {
        self.enabled && !self.periods.is_empty()
    }

    pub fn display_timeout_ms(&self) -> Millis {
        self.display_timeout_secs.saturating_mul(1000)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DayNightConfig {
    pub enabled: bool,
    #[serde(rename = "dayTheme")]
    pub day_theme: String,
    #[serde(rename = "nightTheme")]
    pub night_theme: String,
    #[serde(rename = "dayStartHour")]
    pub day_start_hour: u8,
    #[serde(rename = "nightStartHour")]
    pub night_start_hour: u8,
}

impl Default for DayNightConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            day_theme: "light_mode".to_string(),
            night_theme: "dark_clean".to_string(),
            day_start_hour: 7,
            night_start_hour: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DisplayConfig {
    pub brightness: u8,
    pub theme: String,
    #[serde(rename = "dayNightMode")]
    pub day_night_mode: DayNightConfig,
    pub schedule: BrightnessScheduleConfig,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            brightness: 80,
            theme: "dark_clean".to_string(),
            day_night_mode: DayNightConfig::default(),
            schedule: BrightnessScheduleConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ButtonKind {
    #[default]
    Light,
    Switch,
    Fan,
    Scene,
}

impl ButtonKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Switch => "switch",
            Self::Fan => "fan",
            Self::Scene => "scene",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ButtonConfig {
    pub id: u8,
    #[serde(rename = "type")]
    pub kind: ButtonKind,
    pub name: String,
    pub icon: String,
    pub state: bool,
    pub subtitle: String,
    #[serde(rename = "speedSteps")]
    pub speed_steps: u8,
    #[serde(rename = "speedLevel")]
    pub speed_level: u8,
    #[serde(rename = "sceneId", skip_serializing_if = "Option::is_none")]
    pub scene_id: Option<u8>,
}

impl ButtonConfig {
    fn light(id: u8, name: &str) -> Self {
        Self {
            id,
            kind: ButtonKind::Light,
            name: name.to_string(),
            icon: "lightbulb".to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SceneConfig {
    pub id: u8,
    pub name: String,
    pub icon: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub location: String,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: "ESP32 Display".to_string(),
            location: "Unknown".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(rename = "reportingUrl")]
    pub reporting_url: String,
    #[serde(rename = "stateReportIntervalSecs")]
    pub state_report_interval_secs: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "10.0.1.250".to_string(),
            port: 3000,
            reporting_url: String::new(),
            state_report_interval_secs: 60,
        }
    }
}

impl ServerConfig {
    /// Base URL for outbound requests, without a trailing slash.
    pub fn base_url(&self) -> String {
        let url = if self.reporting_url.trim().is_empty() {
            format!("http://{}:{}", self.host, self.port)
        } else {
            self.reporting_url.trim().to_string()
        };
        url.trim_end_matches('/').to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceConfig {
    pub version: u32,
    pub device: DeviceInfo,
    pub display: DisplayConfig,
    pub buttons: Vec<ButtonConfig>,
    pub scenes: Vec<SceneConfig>,
    pub server: ServerConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            device: DeviceInfo::default(),
            display: DisplayConfig::default(),
            buttons: vec![
                ButtonConfig::light(1, "Living Room"),
                ButtonConfig::light(2, "Bedroom"),
                ButtonConfig::light(3, "Kitchen"),
                ButtonConfig::light(4, "Bathroom"),
            ],
            scenes: vec![
                SceneConfig {
                    id: 1,
                    name: "All Off".to_string(),
                    icon: "power".to_string(),
                },
                SceneConfig {
                    id: 2,
                    name: "All On".to_string(),
                    icon: "sun".to_string(),
                },
            ],
            server: ServerConfig::default(),
        }
    }
}

impl DeviceConfig {
    /// Parses, normalizes and validates a document. Nothing is returned on failure.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_json::from_str(raw)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn normalize(&mut self) {
        self.buttons.truncate(MAX_BUTTONS);
        self.scenes.truncate(MAX_SCENES);
        for button in &mut self.buttons {
            if button.kind != ButtonKind::Fan {
                button.speed_steps = 0;
                button.speed_level = 0;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_percent("display.brightness", self.display.brightness)?;
        check_percent(
            "display.schedule.touchBrightness",
            self.display.schedule.touch_brightness,
        )?;

        for (index, period) in self.display.schedule.periods.iter().enumerate() {
            if period.start_hour > 23 {
                return Err(ConfigError::invalid(
                    format!("display.schedule.periods[{index}].startHour"),
                    "must be 0-23",
                ));
            }
            if period.start_minute > 59 {
                return Err(ConfigError::invalid(
                    format!("display.schedule.periods[{index}].startMinute"),
                    "must be 0-59",
                ));
            }
            check_percent(
                &format!("display.schedule.periods[{index}].brightness"),
                period.brightness,
            )?;
        }

        let day_night = &self.display.day_night_mode;
        if day_night.day_start_hour > 23 || day_night.night_start_hour > 23 {
            return Err(ConfigError::invalid(
                "display.dayNightMode",
                "start hours must be 0-23",
            ));
        }

        for (index, button) in self.buttons.iter().enumerate() {
            if self.buttons[..index].iter().any(|other| other.id == button.id) {
                return Err(ConfigError::invalid(
                    format!("buttons[{index}].id"),
                    format!("duplicate id {}", button.id),
                ));
            }
            if button.kind == ButtonKind::Fan && button.speed_level > button.speed_steps {
                return Err(ConfigError::invalid(
                    format!("buttons[{index}].speedLevel"),
                    "exceeds speedSteps",
                ));
            }
        }

        Ok(())
    }

    pub fn button(&self, id: u8) -> Option<&ButtonConfig> {
        self.buttons.iter().find(|button| button.id == id)
    }

    pub fn scene(&self, id: u8) -> Option<&SceneConfig> {
        self.scenes.iter().find(|scene| scene.id == id)
    }

    pub fn ensure_device_id(&mut self, fallback: &str) {
        if self.device.id.trim().is_empty() {
            self.device.id = fallback.to_string();
        }
    }
}

fn check_percent(field: &str, value: u8) -> Result<(), ConfigError> {
    if value > 100 {
        return Err(ConfigError::invalid(field, "must be 0-100"));
    }
    Ok(())
}
