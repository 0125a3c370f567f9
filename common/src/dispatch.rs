//! Outbound command pipeline.
//!
//! Producers run on the control loop and must never block it, so commands go
//! through a small bounded channel with `try_send`. A single worker thread
//! drains the channel and posts one command at a time.

use std::{
    io,
    sync::{
        atomic::{AtomicU32, Ordering},
        mpsc::{self, Receiver, SyncSender, TrySendError},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    clock::{elapsed_ms, Millis},
    collab::Transport,
    config::TimingConfig,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandKind {
    ButtonAction,
    SceneAction,
}

impl CommandKind {
    /// Path segment under `/api/action/`.
    pub fn path_segment(self) -> &'static str {
        match self {
            Self::ButtonAction => "light",
            Self::SceneAction => "scene",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundCommand {
    pub kind: CommandKind,
    pub target_id: u8,
    pub payload: String,
    pub enqueued_at_ms: Millis,
}

impl OutboundCommand {
    pub fn button(
        device_id: &str,
        button_id: u8,
        state: bool,
        speed_level: Option<u8>,
        now_ms: Millis,
    ) -> Self {
        let mut payload = serde_json::json!({
            "deviceId": device_id,
            "buttonId": button_id,
            "state": state,
            "timestamp": now_ms,
        });
        if let Some(level) = speed_level {
            payload["speedLevel"] = level.into();
        }

        Self {
            kind: CommandKind::ButtonAction,
            target_id: button_id,
            payload: payload.to_string(),
            enqueued_at_ms: now_ms,
        }
    }

    pub fn scene(device_id: &str, scene_id: u8, now_ms: Millis) -> Self {
        let payload = serde_json::json!({
            "deviceId": device_id,
            "sceneId": scene_id,
            "timestamp": now_ms,
        });

        Self {
            kind: CommandKind::SceneAction,
            target_id: scene_id,
            payload: payload.to_string(),
            enqueued_at_ms: now_ms,
        }
    }

    /// Request path relative to the server base URL.
    pub fn path(&self) -> String {
        format!(
            "/api/action/{}/{}",
            self.kind.path_segment(),
            self.target_id
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SubmitOutcome {
    Queued,
    RateLimited,
    QueueFull,
    WorkerGone,
}

#[derive(Debug, Default)]
pub struct DispatchStats {
    queued: AtomicU32,
    rate_limited: AtomicU32,
    dropped_full: AtomicU32,
    delivered: AtomicU32,
    failed: AtomicU32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchCounters {
    pub queued: u32,
    #[serde(rename = "rateLimited")]
    pub rate_limited: u32,
    #[serde(rename = "droppedFull")]
    pub dropped_full: u32,
    pub delivered: u32,
    pub failed: u32,
}

impl DispatchStats {
    pub fn counters(&self) -> DispatchCounters {
        DispatchCounters {
            queued: self.queued.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            dropped_full: self.dropped_full.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Producer half. Owned by the control loop.
#[derive(Debug)]
pub struct Dispatcher {
    tx: SyncSender<OutboundCommand>,
    min_interval_ms: Millis,
    last_accepted_ms: Option<Millis>,
    stats: Arc<DispatchStats>,
}

/// Creates the producer and the worker sharing one bounded queue.
pub fn dispatch_channel<T: Transport>(
    timing: &TimingConfig,
    transport: T,
) -> (Dispatcher, DispatchWorker<T>) {
    let (tx, rx) = mpsc::sync_channel(timing.dispatch_queue_capacity);
    let stats = Arc::new(DispatchStats::default());

    let dispatcher = Dispatcher {
        tx,
        min_interval_ms: timing.dispatch_min_interval_ms,
        last_accepted_ms: None,
        stats: stats.clone(),
    };
    let worker = DispatchWorker {
        rx,
        transport,
        item_delay: Duration::from_millis(u64::from(timing.dispatch_item_delay_ms)),
        stats,
    };
    (dispatcher, worker)
}

impl Dispatcher {
    pub fn submit(&mut self, command: OutboundCommand, now_ms: Millis) -> SubmitOutcome {
        if let Some(last) = self.last_accepted_ms {
            if elapsed_ms(now_ms, last) < self.min_interval_ms {
                debug!("dropping {:?} {}: rate limited", command.kind, command.target_id);
                DispatchStats::bump(&self.stats.rate_limited);
                return SubmitOutcome::RateLimited;
            }
        }
        self.last_accepted_ms = Some(now_ms);

        match self.tx.try_send(command) {
            Ok(()) => {
                DispatchStats::bump(&self.stats.queued);
                SubmitOutcome::Queued
            }
            Err(TrySendError::Full(command)) => {
                warn!(
                    "dispatch queue full, dropping {:?} {}",
                    command.kind, command.target_id
                );
                DispatchStats::bump(&self.stats.dropped_full);
                SubmitOutcome::QueueFull
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("dispatch worker is gone; command dropped");
                SubmitOutcome::WorkerGone
            }
        }
    }

    pub fn counters(&self) -> DispatchCounters {
        self.stats.counters()
    }
}

/// Consumer half. Posts commands one at a time.
pub struct DispatchWorker<T> {
    rx: Receiver<OutboundCommand>,
    transport: T,
    item_delay: Duration,
    stats: Arc<DispatchStats>,
}

impl<T: Transport + 'static> DispatchWorker<T> {
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("dispatch-worker".into())
            .stack_size(8 * 1024)
            .spawn(move || self.run())
    }

    /// Runs until every producer has been dropped.
    pub fn run(mut self) {
        info!("dispatch worker started");
        while let Ok(command) = self.rx.recv() {
            self.deliver(&command);
            if !self.item_delay.is_zero() {
                thread::sleep(self.item_delay);
            }
        }
        info!("dispatch worker stopped");
    }

    fn deliver(&mut self, command: &OutboundCommand) {
        match self.transport.post_command(command) {
            Ok(status) if (200..300).contains(&status) => {
                debug!("{} delivered: HTTP {status}", command.path());
                DispatchStats::bump(&self.stats.delivered);
            }
            Ok(status) => {
                warn!("{} rejected: HTTP {status}", command.path());
                DispatchStats::bump(&self.stats.failed);
            }
            Err(err) => {
                warn!("{} failed: {err}", command.path());
                DispatchStats::bump(&self.stats.failed);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectivityState {
    pub connected: bool,
    #[serde(rename = "lastCheckMs")]
    pub last_check_ms: Option<Millis>,
}

/// Periodic health probe. Informational only; dispatch never consults it.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    interval_ms: Millis,
    state: ConnectivityState,
}

impl ConnectivityMonitor {
    pub fn new(timing: &TimingConfig) -> Self {
        Self {
            interval_ms: timing.probe_interval_ms,
            state: ConnectivityState {
                connected: false,
                last_check_ms: None,
            },
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn is_due(&self, now_ms: Millis) -> bool {
        self.state
            .last_check_ms
            .map_or(true, |last| elapsed_ms(now_ms, last) >= self.interval_ms)
    }

    /// Probes when due. Returns the new flag when it flipped.
    pub fn poll(&mut self, now_ms: Millis, transport: &mut dyn Transport) -> Option<bool> {
        if !self.is_due(now_ms) {
            return None;
        }
        let reachable = transport.probe_health();
        self.record(now_ms, reachable)
    }

    pub fn record(&mut self, now_ms: Millis, reachable: bool) -> Option<bool> {
        self.state.last_check_ms = Some(now_ms);
        if reachable == self.state.connected {
            return None;
        }

        self.state.connected = reachable;
        if reachable {
            info!("server connection established");
        } else {
            warn!("server connection lost");
        }
        Some(reachable)
    }
}
