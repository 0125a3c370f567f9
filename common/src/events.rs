use crate::state::InboundStateUpdate;

/// Everything that reaches the control loop from outside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelEvent {
    ButtonToggled { id: u8 },
    ButtonSet { id: u8, on: bool },
    FanSpeed { id: u8, level: u8 },
    SceneActivated { id: u8 },
    Touch,
    ServerState(InboundStateUpdate),
    /// Locally supplied configuration document.
    ConfigDocument(String),
    /// Document fetched from the server; keeps the local reporting URL.
    RemoteConfig(String),
    TimeFromServer(i64),
    SetBrightness(u8),
    SetTheme(String),
    SetTimezone(String),
    SaveRequested,
}

impl PanelEvent {
    /// Presses that come from the touch UI and fall under the input gate.
    pub fn is_user_input(&self) -> bool {
        matches!(
            self,
            Self::ButtonToggled { .. }
                | Self::ButtonSet { .. }
                | Self::FanSpeed { .. }
                | Self::SceneActivated { .. }
        )
    }
}
