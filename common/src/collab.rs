use crate::{
    dispatch::OutboundCommand,
    error::{StoreError, TransportError},
};

/// Rendering layer as seen by the schedulers.
pub trait Display {
    /// Brightness in percent, 0-100.
    fn apply_brightness(&mut self, percent: u8);
    /// Returns false when the theme name is unknown to the renderer.
    fn apply_theme(&mut self, name: &str) -> bool;
    fn request_rebuild(&mut self);
    fn current_brightness(&self) -> u8;
}

/// Network side of the agent. Implementations own their own timeouts.
pub trait Transport: Send {
    fn post_command(&mut self, command: &OutboundCommand) -> Result<u16, TransportError>;
    fn probe_health(&mut self) -> bool;
    fn post_state(&mut self, device_id: &str, body: &str) -> Result<u16, TransportError>;
    fn fetch_config(&mut self, device_id: &str) -> Result<Option<String>, TransportError>;
}

/// Opaque persistence for the configuration document.
pub trait ConfigStore {
    fn load(&mut self) -> Result<Option<String>, StoreError>;
    fn save(&mut self, document: &str) -> Result<(), StoreError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use super::*;

    pub(crate) const KNOWN_THEMES: [&str; 5] =
        ["light_mode", "dark_clean", "dark_mode", "neon_cyberpunk", "lcars"];

    #[derive(Debug, Default)]
    pub(crate) struct RecordingDisplay {
        pub brightness: u8,
        pub theme: String,
        pub brightness_writes: Vec<u8>,
        pub theme_writes: Vec<String>,
        pub rebuilds: usize,
    }

    impl RecordingDisplay {
        pub(crate) fn at(brightness: u8) -> Self {
            Self {
                brightness,
                ..Default::default()
            }
        }
    }

    impl Display for RecordingDisplay {
        fn apply_brightness(&mut self, percent: u8) {
            self.brightness = percent;
            self.brightness_writes.push(percent);
        }

        fn apply_theme(&mut self, name: &str) -> bool {
            if !KNOWN_THEMES.contains(&name) {
                return false;
            }
            self.theme = name.to_string();
            self.theme_writes.push(name.to_string());
            true
        }

        fn request_rebuild(&mut self) {
            self.rebuilds += 1;
        }

        fn current_brightness(&self) -> u8 {
            self.brightness
        }
    }

    #[derive(Debug, Clone, Default)]
    pub(crate) struct RecordingTransport {
        pub posted: Arc<Mutex<Vec<OutboundCommand>>>,
        pub fail: bool,
    }

    impl Transport for RecordingTransport {
        fn post_command(&mut self, command: &OutboundCommand) -> Result<u16, TransportError> {
            self.posted.lock().unwrap().push(command.clone());
            if self.fail {
                Err(TransportError::Request("connection refused".to_string()))
            } else {
                Ok(200)
            }
        }

        fn probe_health(&mut self) -> bool {
            !self.fail
        }

        fn post_state(&mut self, _device_id: &str, _body: &str) -> Result<u16, TransportError> {
            Ok(200)
        }

        fn fetch_config(&mut self, _device_id: &str) -> Result<Option<String>, TransportError> {
            Ok(None)
        }
    }
}
