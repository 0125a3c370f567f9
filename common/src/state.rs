use std::collections::BTreeMap;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::{ButtonKind, DeviceConfig};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ButtonState {
    pub on: bool,
    #[serde(rename = "speedLevel")]
    pub speed_level: u8,
    #[serde(skip)]
    pub speed_steps: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateMutation {
    Button { id: u8, on: bool },
    FanSpeed { id: u8, level: u8 },
    AllButtons(bool),
    Brightness(u8),
    Theme(String),
}

/// Live device state. Every writer goes through [`DeviceState::apply`]; the
/// most recent write wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceState {
    buttons: BTreeMap<u8, ButtonState>,
    theme: String,
    brightness: u8,
}

impl DeviceState {
    pub fn from_config(config: &DeviceConfig) -> Self {
        let buttons = config
            .buttons
            .iter()
            .filter(|button| button.kind != ButtonKind::Scene)
            .map(|button| {
                (
                    button.id,
                    ButtonState {
                        on: button.state,
                        speed_level: button.speed_level,
                        speed_steps: button.speed_steps,
                    },
                )
            })
            .collect();

        Self {
            buttons,
            theme: config.display.theme.clone(),
            brightness: config.display.brightness,
        }
    }

    /// Returns true when the stored state changed.
    pub fn apply(&mut self, mutation: StateMutation) -> bool {
        match mutation {
            StateMutation::Button { id, on } => {
                let Some(button) = self.buttons.get_mut(&id) else {
                    debug!("ignoring state for unknown button {id}");
                    return false;
                };
                let before = *button;
                button.on = on;
                if button.speed_steps > 0 {
                    button.speed_level = match (on, button.speed_level) {
                        (false, _) => 0,
                        (true, 0) => 1,
                        (true, level) => level,
                    };
                }
                *button != before
            }
            StateMutation::FanSpeed { id, level } => {
                let Some(button) = self.buttons.get_mut(&id) else {
                    debug!("ignoring speed for unknown button {id}");
                    return false;
                };
                let before = *button;
                button.speed_level = if button.speed_steps > 0 {
                    level.min(button.speed_steps)
                } else {
                    level
                };
                button.on = button.speed_level > 0;
                *button != before
            }
            StateMutation::AllButtons(on) => {
                let ids: Vec<u8> = self.buttons.keys().copied().collect();
                ids.into_iter().fold(false, |changed, id| {
                    self.apply(StateMutation::Button { id, on }) || changed
                })
            }
            StateMutation::Brightness(value) => {
                let value = value.min(100);
                let changed = self.brightness != value;
                self.brightness = value;
                changed
            }
            StateMutation::Theme(name) => {
                let changed = self.theme != name;
                self.theme = name;
                changed
            }
        }
    }

    pub fn button(&self, id: u8) -> Option<&ButtonState> {
        self.buttons.get(&id)
    }

    pub fn theme(&self) -> &str {
        &self.theme
    }

    pub fn brightness(&self) -> u8 {
        self.brightness
    }

    /// Copies live button values into the document ahead of a save.
    ///
    /// Brightness and theme here track what the schedulers last applied, so the
    /// document keeps its own manual values for both.
    pub fn write_back(&self, config: &mut DeviceConfig) {
        for button in &mut config.buttons {
            if let Some(state) = self.buttons.get(&button.id) {
                button.state = state.on;
                button.speed_level = state.speed_level;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InboundButtonState {
    pub id: u8,
    #[serde(default)]
    pub state: Option<bool>,
    #[serde(rename = "speedLevel", default)]
    pub speed_level: Option<u8>,
}

/// State pushed by the coordination server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct InboundStateUpdate {
    #[serde(default)]
    pub buttons: Vec<InboundButtonState>,
    #[serde(default)]
    pub brightness: Option<u8>,
}

impl InboundStateUpdate {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Button mutations in document order. Brightness is handled separately
    /// because it also drives the display.
    pub fn button_mutations(&self) -> Vec<StateMutation> {
        self.buttons
            .iter()
            .filter_map(|button| match (button.speed_level, button.state) {
                (Some(level), _) => Some(StateMutation::FanSpeed {
                    id: button.id,
                    level,
                }),
                (None, Some(on)) => Some(StateMutation::Button { id: button.id, on }),
                (None, None) => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ButtonReport {
    pub id: u8,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ButtonKind,
    pub state: bool,
    #[serde(rename = "speedLevel")]
    pub speed_level: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SceneReport {
    pub id: u8,
    pub name: String,
}

/// Full-state document posted periodically so the server can catch up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateReport {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub name: String,
    pub location: String,
    pub uptime: u64,
    pub brightness: u8,
    pub theme: String,
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    #[serde(rename = "serverConnected")]
    pub server_connected: bool,
    pub buttons: Vec<ButtonReport>,
    pub scenes: Vec<SceneReport>,
}

impl StateReport {
    pub fn build(
        config: &DeviceConfig,
        state: &DeviceState,
        uptime_secs: u64,
        time_synced: bool,
    ) -> Self {
        let buttons = config
            .buttons
            .iter()
            .map(|button| {
                let live = state.button(button.id).copied().unwrap_or_default();
                ButtonReport {
                    id: button.id,
                    name: button.name.clone(),
                    kind: button.kind,
                    state: live.on,
                    speed_level: live.speed_level,
                }
            })
            .collect();
        let scenes = config
            .scenes
            .iter()
            .map(|scene| SceneReport {
                id: scene.id,
                name: scene.name.clone(),
            })
            .collect();

        Self {
            device_id: config.device.id.clone(),
            name: config.device.name.clone(),
            location: config.device.location.clone(),
            uptime: uptime_secs,
            brightness: state.brightness(),
            theme: state.theme().to_string(),
            time_synced,
            server_connected: false,
            buttons,
            scenes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ButtonConfig;
    use pretty_assertions::assert_eq;

    fn config_with_fan() -> DeviceConfig {
        let mut config = DeviceConfig::default();
        config.buttons.push(ButtonConfig {
            id: 5,
            kind: ButtonKind::Fan,
            name: "Ceiling Fan".to_string(),
            speed_steps: 3,
            ..Default::default()
        });
        config.buttons.push(ButtonConfig {
            id: 6,
            kind: ButtonKind::Scene,
            name: "Movie".to_string(),
            scene_id: Some(1),
            ..Default::default()
        });
        config
    }

    #[test]
    fn last_write_wins() {
        let mut state = DeviceState::from_config(&DeviceConfig::default());

        assert!(state.apply(StateMutation::Button { id: 1, on: true }));
        assert!(state.apply(StateMutation::Button { id: 1, on: false }));
        assert!(!state.apply(StateMutation::Button { id: 1, on: false }));
        assert_eq!(state.button(1).map(|b| b.on), Some(false));
    }

    #[test]
    fn unknown_and_scene_buttons_are_ignored() {
        let mut state = DeviceState::from_config(&config_with_fan());

        assert!(!state.apply(StateMutation::Button { id: 42, on: true }));
        assert!(!state.apply(StateMutation::Button { id: 6, on: true }));
        assert_eq!(state.button(6), None);
    }

    #[test]
    fn fan_speed_drives_power() {
        let mut state = DeviceState::from_config(&config_with_fan());

        assert!(state.apply(StateMutation::FanSpeed { id: 5, level: 9 }));
        assert_eq!(
            state.button(5).copied(),
            Some(ButtonState {
                on: true,
                speed_level: 3,
                speed_steps: 3
            })
        );

        assert!(state.apply(StateMutation::FanSpeed { id: 5, level: 0 }));
        assert_eq!(state.button(5).map(|b| b.on), Some(false));

        // Turning a fan on without a speed starts at the lowest step.
        assert!(state.apply(StateMutation::Button { id: 5, on: true }));
        assert_eq!(state.button(5).map(|b| b.speed_level), Some(1));
    }

    #[test]
    fn all_buttons_mutation_touches_every_button() {
        let mut state = DeviceState::from_config(&DeviceConfig::default());
        state.apply(StateMutation::Button { id: 2, on: true });

        assert!(state.apply(StateMutation::AllButtons(true)));
        assert!((1..=4).all(|id| state.button(id).is_some_and(|b| b.on)));
        assert!(!state.apply(StateMutation::AllButtons(true)));
    }

    #[test]
    fn inbound_update_maps_to_mutations() {
        let update = InboundStateUpdate::parse(
            r#"{"buttons": [
                {"id": 1, "state": true},
                {"id": 5, "state": false, "speedLevel": 2},
                {"id": 3}
            ], "brightness": 40}"#,
        )
        .unwrap();

        assert_eq!(
            update.button_mutations(),
            vec![
                StateMutation::Button { id: 1, on: true },
                StateMutation::FanSpeed { id: 5, level: 2 },
            ]
        );
        assert_eq!(update.brightness, Some(40));
    }

    #[test]
    fn write_back_updates_document() {
        let mut config = DeviceConfig::default();
        let mut state = DeviceState::from_config(&config);
        state.apply(StateMutation::Button { id: 3, on: true });
        state.apply(StateMutation::Theme("lcars".to_string()));
        state.apply(StateMutation::Brightness(35));

        state.write_back(&mut config);

        assert!(config.button(3).is_some_and(|b| b.state));
        assert_eq!(config.display.theme, DeviceConfig::default().display.theme);
        assert_eq!(
            config.display.brightness,
            DeviceConfig::default().display.brightness
        );
    }

    #[test]
    fn report_lists_buttons_and_scenes() {
        let mut config = DeviceConfig::default();
        config.device.id = "esp32-0a0b0c".to_string();
        let mut state = DeviceState::from_config(&config);
        state.apply(StateMutation::Button { id: 2, on: true });

        let report = StateReport::build(&config, &state, 120, true);
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["deviceId"], "esp32-0a0b0c");
        assert_eq!(json["buttons"][1]["state"], true);
        assert_eq!(json["buttons"][1]["type"], "light");
        assert_eq!(json["scenes"][0]["name"], "All Off");
        assert_eq!(json["timeSynced"], true);
    }
}
