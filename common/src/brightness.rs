//! Time-of-day brightness with touch-to-wake.
//!
//! The scheduler sits in `Scheduled` until a touch lands on a dimmed screen,
//! which moves it to `Awake` at the configured touch brightness. After the
//! display timeout it drops back to the scheduled level. While the clock is
//! unsynced the display is held at the fallback brightness.

use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    clock::{elapsed_ms, ClockService, Millis},
    collab::Display,
    config::{BrightnessScheduleConfig, SchedulePeriod, TimingConfig},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WakeMode {
    Scheduled,
    Awake,
}

/// Index of the period in effect at `minute_of_day`. Periods must be sorted by
/// start time; a time before the first start belongs to the last period.
pub fn find_active_period(periods: &[SchedulePeriod], minute_of_day: u16) -> Option<usize> {
    if periods.is_empty() {
        return None;
    }

    let mut active = periods.len() - 1;
    for (index, period) in periods.iter().enumerate() {
        if period.start_minute_of_day() <= minute_of_day {
            active = index;
        } else {
            break;
        }
    }
    Some(active)
}

#[derive(Debug, Clone)]
pub struct BrightnessScheduler {
    schedule: BrightnessScheduleConfig,
    manual_brightness: u8,
    fallback_brightness: u8,
    dim_threshold: u8,
    wake_grace_ms: Millis,

    mode: WakeMode,
    scheduled_brightness: u8,
    last_applied: Option<u8>,
    wake_started_ms: Option<Millis>,
    grace_started_ms: Option<Millis>,
    active_period: Option<usize>,
}

impl BrightnessScheduler {
    pub fn new(
        schedule: BrightnessScheduleConfig,
        manual_brightness: u8,
        timing: &TimingConfig,
    ) -> Self {
        Self {
            schedule,
            manual_brightness,
            fallback_brightness: timing.fallback_brightness,
            dim_threshold: timing.dim_threshold,
            wake_grace_ms: timing.wake_grace_ms,
            mode: WakeMode::Scheduled,
            scheduled_brightness: manual_brightness,
            last_applied: None,
            wake_started_ms: None,
            grace_started_ms: None,
            active_period: None,
        }
    }

    /// Replaces the schedule. Call [`Self::refresh`] afterwards to apply it.
    pub fn reconfigure(&mut self, schedule: BrightnessScheduleConfig, manual_brightness: u8) {
        self.schedule = schedule;
        self.manual_brightness = manual_brightness;
    }

    pub fn set_manual_brightness(&mut self, brightness: u8) {
        self.manual_brightness = brightness;
    }

    pub fn schedule(&self) -> &BrightnessScheduleConfig {
        &self.schedule
    }

    pub fn is_enabled(&self) -> bool {
        self.schedule.enabled
    }

    pub fn mode(&self) -> WakeMode {
        self.mode
    }

    pub fn scheduled_brightness(&self) -> u8 {
        self.scheduled_brightness
    }

    pub fn active_period(&self) -> Option<&SchedulePeriod> {
        self.active_period
            .and_then(|index| self.schedule.periods.get(index))
    }

    /// Returns true when a brightness write was issued.
    pub fn tick(
        &mut self,
        now_ms: Millis,
        clock: &ClockService,
        display: &mut dyn Display,
    ) -> bool {
        if !self.schedule.is_active() {
            return false;
        }

        if self.grace_expired(now_ms) {
            self.grace_started_ms = None;
        }

        if !clock.is_synced() {
            if self.last_applied == Some(self.fallback_brightness) {
                return false;
            }
            info!(
                "clock not synced; holding display at {}% brightness",
                self.fallback_brightness
            );
            self.write(self.fallback_brightness, display);
            return true;
        }

        if self.mode == WakeMode::Awake {
            let awake_for = self
                .wake_started_ms
                .map_or(Millis::MAX, |started| elapsed_ms(now_ms, started));
            if awake_for >= self.schedule.display_timeout_ms() {
                info!("wake timeout reached; returning to schedule");
                self.mode = WakeMode::Scheduled;
                self.wake_started_ms = None;
                self.last_applied = None;
            }
        }

        let Some(minute_of_day) = clock.minute_of_day(now_ms) else {
            return false;
        };
        self.update_period(minute_of_day);

        let target = match self.mode {
            WakeMode::Awake => self.schedule.touch_brightness,
            WakeMode::Scheduled => self.scheduled_brightness,
        };
        if self.last_applied == Some(target) {
            return false;
        }

        self.write(target, display);
        true
    }

    /// Returns true when the touch was consumed to wake the display.
    pub fn on_touch(
        &mut self,
        now_ms: Millis,
        actual_brightness: u8,
        display: &mut dyn Display,
    ) -> bool {
        if !self.schedule.enabled {
            return false;
        }

        if actual_brightness <= self.dim_threshold {
            info!(
                "touch at {actual_brightness}% brightness; waking display, input blocked for {}ms",
                self.wake_grace_ms
            );
            self.mode = WakeMode::Awake;
            self.wake_started_ms = Some(now_ms);
            self.grace_started_ms = Some(now_ms);
            self.write(self.schedule.touch_brightness, display);
            return true;
        }

        if self.mode == WakeMode::Awake {
            self.wake_started_ms = Some(now_ms);
        }
        false
    }

    pub fn should_block_input(&self, now_ms: Millis, actual_brightness: u8) -> bool {
        if !self.schedule.enabled {
            return false;
        }

        let in_grace = self.grace_started_ms.is_some() && !self.grace_expired(now_ms);
        in_grace || actual_brightness <= self.dim_threshold
    }

    pub fn target_brightness(&self, clock: &ClockService) -> u8 {
        if !self.schedule.enabled {
            return self.manual_brightness;
        }
        if self.mode == WakeMode::Awake {
            return self.schedule.touch_brightness;
        }
        if !clock.is_synced() {
            return self.fallback_brightness;
        }
        self.scheduled_brightness
    }

    /// Drops cached decisions and re-applies the schedule. Pushes the
    /// schedule's timezone into the clock.
    pub fn refresh(
        &mut self,
        now_ms: Millis,
        clock: &mut ClockService,
        display: &mut dyn Display,
    ) {
        if !self.schedule.enabled {
            debug!("brightness schedule disabled");
            return;
        }

        if let Err(err) = clock.set_timezone(&self.schedule.timezone) {
            warn!("brightness schedule timezone ignored: {err}");
        }

        self.mode = WakeMode::Scheduled;
        self.wake_started_ms = None;
        self.grace_started_ms = None;
        self.active_period = None;
        self.last_applied = None;

        info!(
            "brightness schedule enabled with {} periods, timeout={}s",
            self.schedule.periods.len(),
            self.schedule.display_timeout_secs
        );
        if self.schedule.periods.is_empty() {
            warn!("brightness schedule has no periods");
        }

        if !clock.is_synced() {
            info!(
                "clock not synced; applying {}% brightness until it is",
                self.fallback_brightness
            );
            self.write(self.fallback_brightness, display);
            return;
        }

        if let Some(minute_of_day) = clock.minute_of_day(now_ms) {
            if self.update_period(minute_of_day) {
                self.write(self.scheduled_brightness, display);
            }
        }
    }

    fn update_period(&mut self, minute_of_day: u16) -> bool {
        let index = find_active_period(&self.schedule.periods, minute_of_day);
        if index == self.active_period {
            return index.is_some();
        }

        self.active_period = index;
        self.scheduled_brightness = index
            .and_then(|index| self.schedule.periods.get(index))
            .map_or(self.manual_brightness, |period| period.brightness);
        if let Some(period) = self.active_period() {
            info!(
                "brightness period `{}` active, brightness={}%",
                period.name, self.scheduled_brightness
            );
        }
        index.is_some()
    }

    fn grace_expired(&self, now_ms: Millis) -> bool {
        self.grace_started_ms
            .is_some_and(|started| elapsed_ms(now_ms, started) >= self.wake_grace_ms)
    }

    fn write(&mut self, brightness: u8, display: &mut dyn Display) {
        debug!("setting brightness to {brightness}%");
        display.apply_brightness(brightness);
        self.last_applied = Some(brightness);
    }
}
