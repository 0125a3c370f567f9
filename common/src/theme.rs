use log::{debug, info, warn};

use crate::{
    clock::{ClockService, Millis},
    collab::Display,
    config::DayNightConfig,
};

/// Day is `[day_start, night_start)`, wrapping past midnight when the start
/// hours are inverted. Equal hours count as day all the time.
pub fn is_day_time(hour: u8, day_start_hour: u8, night_start_hour: u8) -> bool {
    if day_start_hour < night_start_hour {
        hour >= day_start_hour && hour < night_start_hour
    } else if day_start_hour > night_start_hour {
        hour >= day_start_hour || hour < night_start_hour
    } else {
        true
    }
}

#[derive(Debug, Clone)]
pub struct ThemeScheduler {
    config: DayNightConfig,
    applied_theme: Option<String>,
    was_night: bool,
    initialized: bool,
}

impl ThemeScheduler {
    pub fn new(config: DayNightConfig) -> Self {
        Self {
            config,
            applied_theme: None,
            was_night: false,
            initialized: false,
        }
    }

    pub fn reconfigure(&mut self, config: DayNightConfig) {
        self.config = config;
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn applied_theme(&self) -> Option<&str> {
        self.applied_theme.as_deref()
    }

    pub fn is_night(&self) -> Option<bool> {
        self.initialized.then_some(self.was_night)
    }

    /// Returns true when a new theme was applied.
    pub fn tick(
        &mut self,
        now_ms: Millis,
        clock: &ClockService,
        display: &mut dyn Display,
    ) -> bool {
        if !self.config.enabled || !clock.is_synced() {
            return false;
        }
        let Some(hour) = clock.current_hour(now_ms) else {
            return false;
        };

        let is_night = !self.is_day(hour);
        if self.initialized && is_night == self.was_night {
            return false;
        }

        let target = self.target_for(is_night).to_string();
        self.was_night = is_night;
        self.initialized = true;
        if self.applied_theme.as_deref() == Some(target.as_str()) {
            return false;
        }

        info!(
            "{} begins at hour {hour}; switching theme to `{target}`",
            if is_night { "night" } else { "day" }
        );
        self.apply(&target, display)
    }

    /// Forgets the applied theme and re-evaluates right away when the clock is synced.
    pub fn refresh(&mut self, now_ms: Millis, clock: &ClockService, display: &mut dyn Display) {
        self.initialized = false;
        if !self.config.enabled {
            debug!("day/night theme switching disabled");
            return;
        }

        info!(
            "day/night themes enabled: `{}` from {}:00, `{}` from {}:00",
            self.config.day_theme,
            self.config.day_start_hour,
            self.config.night_theme,
            self.config.night_start_hour
        );
        self.applied_theme = None;

        let hour = match clock.current_hour(now_ms) {
            Some(hour) if clock.is_synced() => hour,
            _ => {
                debug!("clock not synced; theme will be applied once it is");
                return;
            }
        };

        let is_night = !self.is_day(hour);
        let target = self.target_for(is_night).to_string();
        self.apply(&target, display);
        self.was_night = is_night;
        self.initialized = true;
    }

    fn is_day(&self, hour: u8) -> bool {
        is_day_time(hour, self.config.day_start_hour, self.config.night_start_hour)
    }

    fn target_for(&self, is_night: bool) -> &str {
        if is_night {
            &self.config.night_theme
        } else {
            &self.config.day_theme
        }
    }

    fn apply(&mut self, name: &str, display: &mut dyn Display) -> bool {
        if !display.apply_theme(name) {
            warn!("display rejected theme `{name}`");
            return false;
        }
        self.applied_theme = Some(name.to_string());
        display.request_rebuild();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::tests::synced_clock_at;
    use crate::collab::testing::RecordingDisplay;
    use crate::config::TimingConfig;
    use pretty_assertions::assert_eq;

    fn day_night(day_start_hour: u8, night_start_hour: u8) -> DayNightConfig {
        DayNightConfig {
            enabled: true,
            day_theme: "light_mode".to_string(),
            night_theme: "dark_clean".to_string(),
            day_start_hour,
            night_start_hour,
        }
    }

    #[test]
    fn normal_range_boundaries() {
        assert!(!is_day_time(6, 7, 20));
        assert!(is_day_time(7, 7, 20));
        assert!(is_day_time(19, 7, 20));
        assert!(!is_day_time(20, 7, 20));
    }

    #[test]
    fn inverted_range_wraps_midnight() {
        assert!(!is_day_time(19, 20, 7));
        assert!(is_day_time(20, 20, 7));
        assert!(is_day_time(23, 20, 7));
        assert!(is_day_time(3, 20, 7));
        assert!(!is_day_time(7, 20, 7));
    }

    #[test]
    fn equal_hours_are_always_day() {
        assert!(is_day_time(0, 9, 9));
        assert!(is_day_time(9, 9, 9));
        assert!(is_day_time(23, 9, 9));
    }

    #[test]
    fn first_tick_applies_and_rebuilds_once() {
        let clock = synced_clock_at(12, 0, 0);
        let mut display = RecordingDisplay::default();
        let mut scheduler = ThemeScheduler::new(day_night(7, 20));

        assert!(scheduler.tick(0, &clock, &mut display));
        assert!(!scheduler.tick(1_000, &clock, &mut display));

        assert_eq!(display.theme_writes, vec!["light_mode".to_string()]);
        assert_eq!(display.rebuilds, 1);
        assert_eq!(scheduler.is_night(), Some(false));
    }

    #[test]
    fn switches_at_night_boundary() {
        let clock = synced_clock_at(19, 59, 0);
        let mut display = RecordingDisplay::default();
        let mut scheduler = ThemeScheduler::new(day_night(7, 20));
        scheduler.tick(0, &clock, &mut display);

        assert!(scheduler.tick(60_000, &clock, &mut display));
        assert_eq!(scheduler.applied_theme(), Some("dark_clean"));
        assert_eq!(display.rebuilds, 2);
    }

    #[test]
    fn walking_the_day_switches_once_at_seven() {
        let clock = synced_clock_at(6, 0, 0);
        let mut display = RecordingDisplay::default();
        let mut scheduler = ThemeScheduler::new(day_night(7, 20));
        let hour_ms: Millis = 3_600_000;

        assert!(scheduler.tick(0, &clock, &mut display));
        assert_eq!(scheduler.is_night(), Some(true));

        let switched: Vec<u32> = (1..=13)
            .filter(|step| scheduler.tick(step * hour_ms, &clock, &mut display))
            .collect();

        assert_eq!(switched, vec![1]);
        assert_eq!(
            display.theme_writes,
            vec!["dark_clean".to_string(), "light_mode".to_string()]
        );
        assert_eq!(display.rebuilds, 2);
        assert_eq!(clock.current_hour(13 * hour_ms), Some(19));
    }

    #[test]
    fn crossing_into_same_theme_skips_rebuild() {
        let clock = synced_clock_at(19, 59, 0);
        let mut display = RecordingDisplay::default();
        let mut config = day_night(7, 20);
        config.night_theme = config.day_theme.clone();
        let mut scheduler = ThemeScheduler::new(config);
        scheduler.tick(0, &clock, &mut display);

        assert!(!scheduler.tick(60_000, &clock, &mut display));
        assert_eq!(display.rebuilds, 1);
        assert_eq!(scheduler.is_night(), Some(true));
    }

    #[test]
    fn waits_for_clock_sync() {
        let clock = ClockService::new(&TimingConfig::default());
        let mut display = RecordingDisplay::default();
        let mut scheduler = ThemeScheduler::new(day_night(7, 20));

        assert!(!scheduler.tick(0, &clock, &mut display));
        scheduler.refresh(0, &clock, &mut display);
        assert!(display.theme_writes.is_empty());
        assert_eq!(scheduler.is_night(), None);
    }

    #[test]
    fn refresh_reapplies_current_theme() {
        let clock = synced_clock_at(22, 0, 0);
        let mut display = RecordingDisplay::default();
        let mut scheduler = ThemeScheduler::new(day_night(7, 20));
        scheduler.tick(0, &clock, &mut display);

        scheduler.refresh(10, &clock, &mut display);

        assert_eq!(
            display.theme_writes,
            vec!["dark_clean".to_string(), "dark_clean".to_string()]
        );
        assert_eq!(display.rebuilds, 2);
    }

    #[test]
    fn rejected_theme_is_retried_on_next_refresh() {
        let clock = synced_clock_at(12, 0, 0);
        let mut display = RecordingDisplay::default();
        let mut config = day_night(7, 20);
        config.day_theme = "sepia".to_string();
        let mut scheduler = ThemeScheduler::new(config);

        assert!(!scheduler.tick(0, &clock, &mut display));
        assert_eq!(scheduler.applied_theme(), None);
        assert_eq!(display.rebuilds, 0);

        let mut fixed = day_night(7, 20);
        fixed.day_theme = "lcars".to_string();
        scheduler.reconfigure(fixed);
        scheduler.refresh(10, &clock, &mut display);
        assert_eq!(scheduler.applied_theme(), Some("lcars"));
    }
}
