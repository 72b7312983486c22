//! Login anomaly classification.
//!
//! Every password login is compared against the account's most recent
//! successful attempt. Each deviation yields a named pattern; one or more
//! patterns escalates the login to a step-up challenge, and three or more
//! temporarily locks the account.

pub mod geoip;

use chrono::{DateTime, FixedOffset, Offset, Timelike, Utc};

pub const PATTERN_ORIGIN_CHANGE: &str = "ORIGIN_CHANGE";
pub const PATTERN_DEVICE_CHANGE: &str = "DEVICE_CHANGE";
pub const PATTERN_LOCATION_CHANGE: &str = "LOCATION_CHANGE";
pub const PATTERN_UNUSUAL_TIME: &str = "UNUSUAL_TIME";
pub const PATTERN_FREQUENT_LOGINS: &str = "FREQUENT_LOGINS";

pub const ALERT_SUSPICIOUS_LOGIN: &str = "SUSPICIOUS_LOGIN";

/// Number of patterns that escalates a step-up challenge into a lock.
pub const SUSPICION_LOCK_THRESHOLD: usize = 3;

/// Attempts inside [`FREQUENT_LOGIN_WINDOW_SECONDS`] that count as a burst.
pub const FREQUENT_LOGIN_THRESHOLD: i64 = 5;
pub const FREQUENT_LOGIN_WINDOW_SECONDS: i64 = 300;

const USUAL_HOURS_START: u32 = 6;
const USUAL_HOURS_END: u32 = 22;

/// The attempt being classified.
#[derive(Debug, Clone)]
pub struct LoginObservation {
    pub origin: String,
    pub device: String,
    pub location: String,
    pub attempted_at: DateTime<Utc>,
    /// Offset of the account's local clock from UTC, in minutes.
    pub tz_offset_minutes: i32,
    /// Attempts of any outcome recorded inside the burst window.
    pub recent_attempts: i64,
}

/// Baseline drawn from the most recent successful attempt, when one exists.
#[derive(Debug, Clone)]
pub struct PriorLogin {
    pub origin: String,
    pub device: String,
    pub location: String,
}

/// Classify a login and return the patterns it triggers.
///
/// Origin, device and location comparisons need a baseline; the time and
/// frequency checks apply regardless. A location of `Unknown` on either
/// side never produces `LOCATION_CHANGE`.
#[must_use]
pub fn classify(observation: &LoginObservation, baseline: Option<&PriorLogin>) -> Vec<&'static str> {
    let mut patterns = Vec::new();

    if let Some(prior) = baseline {
        if observation.origin != prior.origin {
            patterns.push(PATTERN_ORIGIN_CHANGE);
        }
        if observation.device != prior.device {
            patterns.push(PATTERN_DEVICE_CHANGE);
        }
        if observation.location != geoip::UNKNOWN_LOCATION
            && prior.location != geoip::UNKNOWN_LOCATION
            && observation.location != prior.location
        {
            patterns.push(PATTERN_LOCATION_CHANGE);
        }
    }

    if is_unusual_hour(observation.attempted_at, observation.tz_offset_minutes) {
        patterns.push(PATTERN_UNUSUAL_TIME);
    }

    if observation.recent_attempts >= FREQUENT_LOGIN_THRESHOLD {
        patterns.push(PATTERN_FREQUENT_LOGINS);
    }

    patterns
}

/// Whether the instant falls outside the account's usual hours.
///
/// Usual hours are 06:00 inclusive to 22:00 exclusive in the account's
/// local clock. An unrepresentable offset falls back to UTC.
#[must_use]
pub fn is_unusual_hour(at: DateTime<Utc>, tz_offset_minutes: i32) -> bool {
    let offset =
        FixedOffset::east_opt(tz_offset_minutes.saturating_mul(60)).unwrap_or_else(|| Utc.fix());
    let hour = at.with_timezone(&offset).hour();
    !(USUAL_HOURS_START..USUAL_HOURS_END).contains(&hour)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::{
        classify, is_unusual_hour, LoginObservation, PriorLogin, PATTERN_DEVICE_CHANGE,
        PATTERN_FREQUENT_LOGINS, PATTERN_LOCATION_CHANGE, PATTERN_ORIGIN_CHANGE,
        PATTERN_UNUSUAL_TIME,
    };
    use chrono::{TimeZone, Utc};

    fn observation() -> LoginObservation {
        LoginObservation {
            origin: "203.0.113.7".to_string(),
            device: "Mozilla/5.0".to_string(),
            location: "Lisbon, Portugal".to_string(),
            attempted_at: Utc.with_ymd_and_hms(2024, 5, 14, 12, 0, 0).unwrap(),
            tz_offset_minutes: 0,
            recent_attempts: 0,
        }
    }

    fn baseline() -> PriorLogin {
        PriorLogin {
            origin: "203.0.113.7".to_string(),
            device: "Mozilla/5.0".to_string(),
            location: "Lisbon, Portugal".to_string(),
        }
    }

    #[test]
    fn matching_baseline_yields_no_patterns() {
        let patterns = classify(&observation(), Some(&baseline()));
        assert!(patterns.is_empty());
    }

    #[test]
    fn no_baseline_skips_comparisons() {
        let mut obs = observation();
        obs.origin = "198.51.100.1".to_string();
        let patterns = classify(&obs, None);
        assert!(patterns.is_empty());
    }

    #[test]
    fn origin_and_device_changes_flagged() {
        let mut obs = observation();
        obs.origin = "198.51.100.1".to_string();
        obs.device = "curl/8.5".to_string();
        let patterns = classify(&obs, Some(&baseline()));
        assert!(patterns.contains(&PATTERN_ORIGIN_CHANGE));
        assert!(patterns.contains(&PATTERN_DEVICE_CHANGE));
        assert_eq!(patterns.len(), 2);
    }

    #[test]
    fn location_change_flagged_when_both_resolved() {
        let mut obs = observation();
        obs.location = "Porto, Portugal".to_string();
        let patterns = classify(&obs, Some(&baseline()));
        assert_eq!(patterns, vec![PATTERN_LOCATION_CHANGE]);
    }

    #[test]
    fn unknown_location_never_flags() {
        let mut obs = observation();
        obs.location = "Unknown".to_string();
        assert!(classify(&obs, Some(&baseline())).is_empty());

        let mut prior = baseline();
        prior.location = "Unknown".to_string();
        let mut obs = observation();
        obs.location = "Porto, Portugal".to_string();
        assert!(classify(&obs, Some(&prior)).is_empty());
    }

    #[test]
    fn unusual_time_flagged_without_baseline() {
        let mut obs = observation();
        obs.attempted_at = Utc.with_ymd_and_hms(2024, 5, 14, 3, 30, 0).unwrap();
        let patterns = classify(&obs, None);
        assert_eq!(patterns, vec![PATTERN_UNUSUAL_TIME]);
    }

    #[test]
    fn frequent_logins_at_threshold() {
        let mut obs = observation();
        obs.recent_attempts = 5;
        let patterns = classify(&obs, Some(&baseline()));
        assert_eq!(patterns, vec![PATTERN_FREQUENT_LOGINS]);

        obs.recent_attempts = 4;
        assert!(classify(&obs, Some(&baseline())).is_empty());
    }

    #[test]
    fn usual_hours_boundaries() {
        let morning_edge = Utc.with_ymd_and_hms(2024, 5, 14, 6, 0, 0).unwrap();
        assert!(!is_unusual_hour(morning_edge, 0));

        let before_morning = Utc.with_ymd_and_hms(2024, 5, 14, 5, 59, 59).unwrap();
        assert!(is_unusual_hour(before_morning, 0));

        let last_usual = Utc.with_ymd_and_hms(2024, 5, 14, 21, 59, 59).unwrap();
        assert!(!is_unusual_hour(last_usual, 0));

        let night_edge = Utc.with_ymd_and_hms(2024, 5, 14, 22, 0, 0).unwrap();
        assert!(is_unusual_hour(night_edge, 0));
    }

    #[test]
    fn offset_shifts_local_hour() {
        // 23:00 UTC is 01:00 in UTC+2 and 18:00 in UTC-5.
        let at = Utc.with_ymd_and_hms(2024, 5, 14, 23, 0, 0).unwrap();
        assert!(is_unusual_hour(at, 120));
        assert!(!is_unusual_hour(at, -300));
    }
}
