pub mod agent;
pub mod brightness;
pub mod clock;
pub mod collab;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod state;
pub mod theme;

pub use agent::{AgentSnapshot, EventOutcome, PanelAgent, TouchDisposition};
pub use brightness::{BrightnessScheduler, WakeMode};
pub use clock::{elapsed_ms, ClockService, ClockState, Millis, TimeSource};
pub use collab::{ConfigStore, Display, Transport};
pub use config::{DeviceConfig, TimingConfig};
pub use dispatch::{
    dispatch_channel, ConnectivityMonitor, DispatchCounters, DispatchWorker, Dispatcher,
    OutboundCommand, SubmitOutcome,
};
pub use error::{AgentError, ClockError, ConfigError, StoreError, TransportError};
pub use events::PanelEvent;
pub use state::{DeviceState, InboundStateUpdate, StateReport};
pub use theme::ThemeScheduler;
