//! Trigger-window evaluation for the scheduled run loop.
//!
//! The daemon ticks this once a minute. A run fires when the policy is
//! enabled and the wall clock sits inside the configured day-of-month /
//! hour window; a window that already produced a run (same date and hour
//! as `last_run_at`) is suppressed so a restart mid-window does not
//! double-fire.

use chrono::{DateTime, Datelike, Timelike, Utc};

use arx_schemas::{SchedulerConfig, TargetPeriod};

/// True when a scheduled run should fire at `now` under `config`.
pub fn should_run(config: &SchedulerConfig, now: DateTime<Utc>) -> bool {
    if !config.enabled {
        return false;
    }
    if now.day() as i32 != config.day_of_month || now.hour() as i32 != config.hour {
        return false;
    }
    match config.last_run_at {
        Some(last) => !(last.date_naive() == now.date_naive() && last.hour() == now.hour()),
        None => true,
    }
}

/// The billing period a run fired at `now` should archive.
pub fn resolve_target_period(config: &SchedulerConfig, now: DateTime<Utc>) -> TargetPeriod {
    if config.snapshot_previous_month {
        TargetPeriod::previous(now)
    } else {
        TargetPeriod::current(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn config(day: i32, hour: i32) -> SchedulerConfig {
        SchedulerConfig {
            day_of_month: day,
            hour,
            ..SchedulerConfig::default()
        }
    }

    #[test]
    fn fires_inside_window() {
        assert!(should_run(&config(1, 2), at(2025, 11, 1, 2, 0)));
        assert!(should_run(&config(1, 2), at(2025, 11, 1, 2, 59)));
    }

    #[test]
    fn does_not_fire_outside_window() {
        assert!(!should_run(&config(1, 2), at(2025, 11, 1, 3, 0)));
        assert!(!should_run(&config(1, 2), at(2025, 11, 2, 2, 0)));
    }

    #[test]
    fn disabled_policy_never_fires() {
        let mut cfg = config(1, 2);
        cfg.enabled = false;
        assert!(!should_run(&cfg, at(2025, 11, 1, 2, 0)));
    }

    #[test]
    fn window_that_already_ran_is_suppressed() {
        let mut cfg = config(1, 2);
        cfg.last_run_at = Some(at(2025, 11, 1, 2, 5));
        assert!(!should_run(&cfg, at(2025, 11, 1, 2, 30)));
        // Next month's window fires again.
        assert!(should_run(&cfg, at(2025, 12, 1, 2, 0)));
    }

    #[test]
    fn previous_month_target_wraps_the_year() {
        let cfg = config(1, 2);
        let period = resolve_target_period(&cfg, at(2026, 1, 1, 2, 0));
        assert_eq!(period, TargetPeriod { year: 2025, month: 12 });
    }

    #[test]
    fn current_month_target_when_policy_disables_previous() {
        let mut cfg = config(1, 2);
        cfg.snapshot_previous_month = false;
        let period = resolve_target_period(&cfg, at(2025, 11, 1, 2, 0));
        assert_eq!(period, TargetPeriod { year: 2025, month: 11 });
    }
}
