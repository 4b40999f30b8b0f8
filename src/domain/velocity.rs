use super::transaction::CardFingerprint;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hourly buckets are kept for a week; non-standard windows are capped to it.
pub const MAX_BUCKET_HOURS: u32 = 168;
/// Daily buckets share the hourly retention.
pub const MAX_BUCKET_DAYS: u32 = MAX_BUCKET_HOURS / 24;

/// Who a counter belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Scope {
    Card(String),
    Merchant(String),
}

impl Scope {
    pub fn card(card: &CardFingerprint) -> Self {
        Scope::Card(card.as_str().to_string())
    }

    pub fn merchant(merchant_id: impl Into<String>) -> Self {
        Scope::Merchant(merchant_id.into())
    }

    pub fn id(&self) -> &str {
        match self {
            Scope::Card(id) | Scope::Merchant(id) => id,
        }
    }

    fn segment(&self) -> &'static str {
        match self {
            Scope::Card(_) => "pan",
            Scope::Merchant(_) => "merchant",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment(), self.id())
    }
}

/// Pre-aggregated rolling windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Window {
    OneHour,
    Day,
    Week,
    Month,
}

impl Window {
    pub const ALL: [Window; 4] = [Window::OneHour, Window::Day, Window::Week, Window::Month];

    pub fn label(self) -> &'static str {
        match self {
            Window::OneHour => "1h",
            Window::Day => "24h",
            Window::Week => "7d",
            Window::Month => "30d",
        }
    }

    pub fn hours(self) -> u32 {
        match self {
            Window::OneHour => 1,
            Window::Day => 24,
            Window::Week => 24 * 7,
            Window::Month => 24 * 30,
        }
    }

    pub fn duration(self) -> Duration {
        Duration::hours(i64::from(self.hours()))
    }

    /// Key lifetime. Slightly longer than the window so that a counter never
    /// disappears while its window is still open.
    pub fn ttl(self) -> Duration {
        match self {
            Window::OneHour => Duration::hours(2),
            Window::Day => Duration::hours(25),
            Window::Week => Duration::days(8),
            Window::Month => Duration::days(31),
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    Count,
    AmountSum,
    DistinctTerminals,
}

impl Dimension {
    pub fn label(self) -> &'static str {
        match self {
            Dimension::Count => "count",
            Dimension::AmountSum => "amount",
            Dimension::DistinctTerminals => "terminals",
        }
    }
}

/// Granularity of the raw buckets used for non-standard windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    Hour,
    Day,
}

impl Granularity {
    pub fn ttl(self) -> Duration {
        Duration::hours(i64::from(MAX_BUCKET_HOURS))
    }

    pub fn width_secs(self) -> i64 {
        match self {
            Granularity::Hour => 3_600,
            Granularity::Day => 86_400,
        }
    }

    /// Bucket start for `at`, as seconds since the epoch.
    pub fn bucket_start(self, at: DateTime<Utc>) -> i64 {
        let width = self.width_secs();
        at.timestamp().div_euclid(width) * width
    }
}

/// A single counter as seen by an observer of the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VelocityCounter {
    pub scope: Scope,
    pub dimension: Dimension,
    pub window: Window,
    pub value: i64,
    pub expires_at: DateTime<Utc>,
}

/// Stable textual key for a rolling-window counter, e.g. `vel:pan:ab12…:count:1h`.
pub fn counter_key(scope: &Scope, dimension: Dimension, window: Window) -> String {
    format!("vel:{}:{}:{}", scope, dimension.label(), window.label())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_ttl_exceeds_window() {
        for window in Window::ALL {
            assert!(window.ttl() > window.duration(), "{window}");
        }
        assert_eq!(Window::Day.ttl(), Duration::hours(25));
        assert_eq!(Window::Month.ttl(), Duration::days(31));
    }

    #[test]
    fn test_counter_key_layout() {
        let key = counter_key(&Scope::merchant("m-9"), Dimension::Count, Window::OneHour);
        assert_eq!(key, "vel:merchant:m-9:count:1h");
    }

    #[test]
    fn test_bucket_start_truncates() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 14, 37, 12).unwrap();
        let hour = Granularity::Hour.bucket_start(at);
        let day = Granularity::Day.bucket_start(at);
        assert_eq!(hour, Utc.with_ymd_and_hms(2024, 3, 5, 14, 0, 0).unwrap().timestamp());
        assert_eq!(day, Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap().timestamp());
    }
}
