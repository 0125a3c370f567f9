use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use log::{debug, info, warn};
use serde::Serialize;

use crate::{config::TimingConfig, error::ClockError};

/// Wrapping millisecond tick counter supplied by the platform.
pub type Millis = u32;

pub const MIN_PLAUSIBLE_YEAR: i32 = 2024;
pub const DEFAULT_TIMEZONE: &str = "America/Denver";

/// Elapsed time between two tick readings, correct across one counter wrap.
pub fn elapsed_ms(now_ms: Millis, since_ms: Millis) -> Millis {
    now_ms.wrapping_sub(since_ms)
}

pub trait TimeSource {
    /// Current unix time in seconds, or `None` when the source has nothing yet.
    fn fetch_unix_time(&mut self) -> Option<i64>;
}

impl<F> TimeSource for F
where
    F: FnMut() -> Option<i64>,
{
    fn fetch_unix_time(&mut self) -> Option<i64> {
        self()
    }
}

#[derive(Debug, Clone, Copy)]
struct WallAnchor {
    unix_ms: i64,
    tick_ms: Millis,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClockState {
    pub synced: bool,
    pub timezone: String,
    #[serde(rename = "lastSyncAttemptMs")]
    pub last_sync_attempt_ms: Option<Millis>,
    #[serde(rename = "lastSuccessfulSyncMs")]
    pub last_successful_sync_ms: Option<Millis>,
}

#[derive(Debug, Clone)]
pub struct ClockService {
    timezone: Tz,
    synced: bool,
    anchor: Option<WallAnchor>,
    last_attempt_ms: Option<Millis>,
    last_success_ms: Option<Millis>,
    retry_interval_ms: Millis,
    resync_interval_ms: Millis,
}

impl ClockService {
    pub fn new(timing: &TimingConfig) -> Self {
        Self {
            timezone: chrono_tz::America::Denver,
            synced: false,
            anchor: None,
            last_attempt_ms: None,
            last_success_ms: None,
            retry_interval_ms: timing.sync_retry_interval_ms,
            resync_interval_ms: timing.resync_interval_ms,
        }
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Empty names keep the current zone. Returns whether the zone changed.
    pub fn set_timezone(&mut self, name: &str) -> Result<bool, ClockError> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(false);
        }

        let tz: Tz = name
            .parse()
            .map_err(|_| ClockError::UnknownTimezone(name.to_string()))?;
        if tz == self.timezone {
            return Ok(false);
        }

        info!("timezone set to {}", tz.name());
        self.timezone = tz;
        Ok(true)
    }

    pub fn is_sync_due(&self, now_ms: Millis) -> bool {
        let Some(last_attempt) = self.last_attempt_ms else {
            return true;
        };

        let since_attempt = elapsed_ms(now_ms, last_attempt);
        if !self.synced {
            return since_attempt >= self.retry_interval_ms;
        }

        // A failed hourly resync falls back to the retry cadence.
        let since_success = self
            .last_success_ms
            .map_or(Millis::MAX, |success| elapsed_ms(now_ms, success));
        since_success >= self.resync_interval_ms && since_attempt >= self.retry_interval_ms
    }

    /// Attempts a sync when the retry or resync interval has elapsed.
    pub fn poll(&mut self, now_ms: Millis, source: &mut dyn TimeSource) -> bool {
        self.advance_anchor(now_ms);
        if !self.is_sync_due(now_ms) {
            return false;
        }
        self.synchronize(now_ms, source)
    }

    pub fn force_sync(&mut self, now_ms: Millis, source: &mut dyn TimeSource) -> bool {
        self.synchronize(now_ms, source)
    }

    /// Returns true when the source produced a plausible time. Never reverts `synced`.
    pub fn synchronize(&mut self, now_ms: Millis, source: &mut dyn TimeSource) -> bool {
        self.last_attempt_ms = Some(now_ms);

        match source.fetch_unix_time().filter(|ts| is_plausible(*ts)) {
            Some(unix_ts) => {
                let first = !self.synced;
                self.anchor_to(unix_ts, now_ms);
                if first {
                    info!("clock synchronized: {}", self.describe(now_ms));
                } else {
                    debug!("clock resynchronized: {}", self.describe(now_ms));
                }
                true
            }
            None if self.synced => {
                warn!("clock resync failed; keeping previous time base");
                false
            }
            None => {
                debug!("clock sync pending; no plausible time yet");
                false
            }
        }
    }

    /// Sets the clock from a trusted timestamp and marks it synced immediately.
    ///
    /// Timestamps chrono cannot represent, or older than `MIN_PLAUSIBLE_YEAR`, are refused.
    pub fn inject_authoritative_time(
        &mut self,
        unix_ts: i64,
        now_ms: Millis,
    ) -> Result<(), ClockError> {
        if !is_plausible(unix_ts) {
            return Err(ClockError::ImplausibleTimestamp(unix_ts));
        }
        self.last_attempt_ms = Some(now_ms);
        self.anchor_to(unix_ts, now_ms);
        info!("clock set from server: {}", self.describe(now_ms));
        Ok(())
    }

    pub fn unix_time(&self, now_ms: Millis) -> Option<i64> {
        self.wall_ms(now_ms).map(|wall_ms| wall_ms.div_euclid(1000))
    }

    pub fn local_time(&self, now_ms: Millis) -> Option<DateTime<Tz>> {
        let utc = Utc.timestamp_millis_opt(self.wall_ms(now_ms)?).single()?;
        Some(utc.with_timezone(&self.timezone))
    }

    pub fn current_hour(&self, now_ms: Millis) -> Option<u8> {
        self.local_time(now_ms).map(|local| local.hour() as u8)
    }

    pub fn current_minute(&self, now_ms: Millis) -> Option<u8> {
        self.local_time(now_ms).map(|local| local.minute() as u8)
    }

    pub fn minute_of_day(&self, now_ms: Millis) -> Option<u16> {
        self.local_time(now_ms)
            .map(|local| (local.hour() * 60 + local.minute()) as u16)
    }

    pub fn state(&self) -> ClockState {
        ClockState {
            synced: self.synced,
            timezone: self.timezone.name().to_string(),
            last_sync_attempt_ms: self.last_attempt_ms,
            last_successful_sync_ms: self.last_success_ms,
        }
    }

    fn wall_ms(&self, now_ms: Millis) -> Option<i64> {
        let anchor = self.anchor?;
        anchor
            .unix_ms
            .checked_add(i64::from(elapsed_ms(now_ms, anchor.tick_ms)))
    }

    /// Moves the anchor up to `now_ms` so the tick delta stays far from a wrap.
    fn advance_anchor(&mut self, now_ms: Millis) {
        let Some(wall_ms) = self.wall_ms(now_ms) else {
            return;
        };
        self.anchor = Some(WallAnchor {
            unix_ms: wall_ms,
            tick_ms: now_ms,
        });
    }

    fn anchor_to(&mut self, unix_ts: i64, now_ms: Millis) {
        self.anchor = Some(WallAnchor {
            unix_ms: unix_ts.saturating_mul(1000),
            tick_ms: now_ms,
        });
        self.synced = true;
        self.last_success_ms = Some(now_ms);
    }

    fn describe(&self, now_ms: Millis) -> String {
        self.local_time(now_ms)
            .map(|local| local.format("%Y-%m-%d %H:%M:%S %Z").to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

fn is_plausible(unix_ts: i64) -> bool {
    Utc.timestamp_opt(unix_ts, 0)
        .single()
        .is_some_and(|time| time.year() >= MIN_PLAUSIBLE_YEAR)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    pub(crate) fn unix(hour: u32, minute: u32) -> i64 {
        // Jan 5, 2026 in UTC.
        Utc.with_ymd_and_hms(2026, 1, 5, hour, minute, 0)
            .unwrap()
            .timestamp()
    }

    pub(crate) fn synced_clock_at(hour: u32, minute: u32, now_ms: Millis) -> ClockService {
        let mut clock = ClockService::new(&TimingConfig::default());
        clock.set_timezone("UTC").unwrap();
        clock
            .inject_authoritative_time(unix(hour, minute), now_ms)
            .unwrap();
        clock
    }

    #[test]
    fn rejects_implausible_time() {
        let mut clock = ClockService::new(&TimingConfig::default());
        let mut source = || Some(86_400_i64);

        assert!(!clock.synchronize(0, &mut source));
        assert!(!clock.is_synced());
        assert_eq!(clock.current_hour(0), None);
    }

    #[test]
    fn accepts_plausible_time() {
        let mut clock = ClockService::new(&TimingConfig::default());
        clock.set_timezone("UTC").unwrap();
        let mut source = || Some(unix(15, 30));

        assert!(clock.synchronize(1_000, &mut source));
        assert!(clock.is_synced());
        assert_eq!(clock.current_hour(1_000), Some(15));
        assert_eq!(clock.current_minute(1_000), Some(30));
    }

    #[test]
    fn retries_every_minute_while_unsynced() {
        let mut clock = ClockService::new(&TimingConfig::default());
        let mut calls = 0;
        let mut source = || {
            calls += 1;
            None::<i64>
        };

        assert!(!clock.poll(0, &mut source));
        assert!(!clock.poll(59_999, &mut source));
        assert!(!clock.poll(60_000, &mut source));
        drop(source);
        assert_eq!(calls, 2);
    }

    #[test]
    fn resyncs_hourly_once_synced() {
        let mut clock = ClockService::new(&TimingConfig::default());
        let mut calls = 0;
        let mut source = || {
            calls += 1;
            Some(unix(8, 0))
        };

        assert!(clock.poll(0, &mut source));
        assert!(!clock.poll(60_000, &mut source));
        assert!(!clock.poll(3_599_999, &mut source));
        assert!(clock.poll(3_600_000, &mut source));
        drop(source);
        assert_eq!(calls, 2);
    }

    #[test]
    fn failed_resync_keeps_synced() {
        let mut clock = synced_clock_at(8, 0, 0);
        let mut source = || None::<i64>;

        assert!(!clock.poll(3_600_000, &mut source));
        assert!(clock.is_synced());
        assert_eq!(clock.current_hour(3_600_000), Some(9));

        // Next attempt waits for the retry interval, not another full hour.
        assert!(!clock.is_sync_due(3_659_999));
        assert!(clock.is_sync_due(3_660_000));
    }

    #[test]
    fn wall_time_advances_with_ticks() {
        let clock = synced_clock_at(23, 59, 10_000);

        assert_eq!(clock.current_hour(10_000 + 60_000), Some(0));
        assert_eq!(clock.minute_of_day(10_000 + 60_000), Some(0));
    }

    #[test]
    fn wall_time_survives_tick_wraparound() {
        let start = Millis::MAX - 30_000;
        let clock = synced_clock_at(10, 0, start);

        assert_eq!(clock.current_minute(start.wrapping_add(90_000)), Some(1));
        assert_eq!(elapsed_ms(10, Millis::MAX - 9), 20);
    }

    #[test]
    fn applies_timezone_offset() {
        let mut clock = synced_clock_at(15, 30, 0);
        assert!(clock.set_timezone("America/Denver").unwrap());

        // January is MST, UTC-7.
        assert_eq!(clock.current_hour(0), Some(8));
    }

    #[test]
    fn timezone_changes_are_validated() {
        let mut clock = ClockService::new(&TimingConfig::default());

        assert_eq!(clock.set_timezone(""), Ok(false));
        assert_eq!(
            clock.set_timezone("Mars/Olympus"),
            Err(ClockError::UnknownTimezone("Mars/Olympus".to_string()))
        );
        assert_eq!(clock.state().timezone, DEFAULT_TIMEZONE);
    }

    #[test]
    fn injected_time_out_of_range_is_refused() {
        let mut clock = synced_clock_at(10, 0, 0);

        assert_eq!(
            clock.inject_authoritative_time(i64::MAX / 1000, 1_000),
            Err(ClockError::ImplausibleTimestamp(i64::MAX / 1000))
        );
        assert_eq!(
            clock.inject_authoritative_time(86_400, 1_000),
            Err(ClockError::ImplausibleTimestamp(86_400))
        );
        assert_eq!(clock.current_hour(5_000), Some(10));
        assert_eq!(clock.state().last_sync_attempt_ms, Some(0));
    }

    #[test]
    fn wall_time_holds_through_weeks_of_failed_resyncs() {
        let mut clock = synced_clock_at(10, 0, 0);
        let mut source = || None::<i64>;
        let hour_ms: Millis = 3_600_000;

        let mut now: Millis = 0;
        for _ in 0..1201 {
            now = now.wrapping_add(hour_ms);
            clock.poll(now, &mut source);
        }

        // 1201 hours past 10:00 is 11:00, even though the tick counter wrapped.
        assert!(clock.is_synced());
        assert_eq!(clock.current_hour(now), Some(11));
        assert_eq!(clock.current_minute(now), Some(0));
    }
}
