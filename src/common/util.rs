use chrono::{DateTime, Local, Utc};
use std::sync::Arc;

// ===============================================================================================
// Time
// ===============================================================================================

/// Source of the current instant for log timestamps and time-to-live checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always reports the same instant. Used to make rendered logs reproducible.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

/// Formats a timestamp the way it appears in rendered log entries (`yyyy-MM-dd HH:mm:ss.SSS`,
/// local time).
pub fn format_log_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp
        .with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S%.3f")
        .to_string()
}

#[cfg(test)]
mod test {
    use crate::common::util::{format_log_timestamp, Clock, FixedClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn fixed_clock_is_stable() {
        let instant = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        let clock = FixedClock(instant);
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn log_timestamp_has_millisecond_precision() {
        // Arrange
        let instant = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();

        // Act
        let formatted = format_log_timestamp(&instant);

        // Assert
        assert_eq!(formatted.len(), "2023-11-14 22:13:20.123".len());
        assert!(formatted.ends_with(".123"));
    }
}
