//! Core data types used throughout the rollup engine
//!
//! # Key Types
//!
//! - **`Timestamp`**: Unix epoch milliseconds
//! - **`TimeRange`**: Half-open window `[start, end)`
//! - **`RawSample`**: One raw measurement with named fields
//! - **`TierKey`**: Identity of one materialized series (metric, tier, entity)
//!
//! # Example
//!
//! ```rust
//! use vitals_rollup::types::{align_down, parse_duration_ms, TimeRange};
//!
//! let range = TimeRange::new(60_000, 180_000).unwrap();
//! assert!(range.contains(60_000));
//! assert!(!range.contains(180_000));
//!
//! let hour = parse_duration_ms("1h").unwrap();
//! assert_eq!(align_down(5_400_000, hour), 3_600_000);
//! ```

use crate::error::RangeError;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Unix epoch milliseconds
pub type Timestamp = i64;

/// Identifier of a metric (e.g. `heart_rate`)
pub type MetricId = String;

/// Identifier of a tier within a metric (e.g. `1h`)
pub type TierId = String;

/// Identifier of the entity a series belongs to (user or device)
pub type EntityId = String;

/// One second in milliseconds
pub const SECOND_MS: i64 = 1_000;
/// One minute in milliseconds
pub const MINUTE_MS: i64 = 60 * SECOND_MS;
/// One hour in milliseconds
pub const HOUR_MS: i64 = 60 * MINUTE_MS;
/// One day in milliseconds
pub const DAY_MS: i64 = 24 * HOUR_MS;
/// One week in milliseconds
pub const WEEK_MS: i64 = 7 * DAY_MS;

/// Half-open time window `[start, end)` in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: Timestamp,

    /// End timestamp (exclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new non-empty time range
    ///
    /// # Example
    ///
    /// ```rust
    /// use vitals_rollup::types::TimeRange;
    ///
    /// assert!(TimeRange::new(1000, 2000).is_ok());
    /// assert!(TimeRange::new(1000, 1000).is_err());
    /// assert!(TimeRange::new(2000, 1000).is_err());
    /// ```
    pub fn new(start: Timestamp, end: Timestamp) -> Result<Self, RangeError> {
        if start > end {
            return Err(RangeError::Inverted { start, end });
        }
        if start == end {
            return Err(RangeError::Empty(start));
        }
        Ok(Self { start, end })
    }

    /// Create a range without validation
    ///
    /// Used internally for ranges derived from already validated bounds.
    /// An empty or inverted range produced this way reports `is_empty()`.
    pub fn new_unchecked(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Check if a timestamp falls within `[start, end)`
    pub fn contains(&self, timestamp: Timestamp) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// Duration in milliseconds (zero for empty ranges)
    pub fn duration_ms(&self) -> i64 {
        self.end.saturating_sub(self.start).max(0)
    }

    /// Whether the range covers no time at all
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Intersection of two ranges, `None` if they don't overlap
    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(TimeRange { start, end })
    }

    /// Widen both bounds to `width` bucket boundaries
    pub fn align_outward(&self, width: i64) -> TimeRange {
        TimeRange {
            start: align_down(self.start, width),
            end: align_up(self.end, width),
        }
    }

    /// Range of bucket starts at `width` that fall inside `[start, end)`
    ///
    /// The last bucket may extend past `end`.
    pub fn bucket_starts_within(&self, width: i64) -> TimeRange {
        TimeRange {
            start: align_up(self.start, width),
            end: align_up(self.end, width),
        }
    }

    /// Number of buckets of `width` needed to span the range
    pub fn bucket_count(&self, width: i64) -> u64 {
        if width <= 0 || self.is_empty() {
            return 0;
        }
        let duration = self.duration_ms();
        ((duration + width - 1) / width) as u64
    }

    /// Iterate over aligned bucket starts in the range
    pub fn buckets(&self, width: i64) -> impl Iterator<Item = Timestamp> {
        let first = align_down(self.start, width);
        let end = self.end;
        (0..)
            .map(move |i: i64| first + i * width)
            .take_while(move |b| *b < end)
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            format_timestamp(self.start),
            format_timestamp(self.end)
        )
    }
}

/// Monday 1970-01-05, origin of week-multiple buckets
pub const WEEK_ORIGIN_MS: i64 = 4 * DAY_MS;

/// Grid origin for buckets of `width`
///
/// Widths that are whole weeks start on Monday 00:00 UTC; every other
/// width is aligned to the epoch.
pub fn bucket_origin(width: i64) -> Timestamp {
    if width > 0 && width % WEEK_MS == 0 {
        WEEK_ORIGIN_MS
    } else {
        0
    }
}

/// Round a timestamp down to the start of its `width` bucket
pub fn align_down(timestamp: Timestamp, width: i64) -> Timestamp {
    timestamp - (timestamp - bucket_origin(width)).rem_euclid(width)
}

/// Round a timestamp up to the next `width` bucket boundary
pub fn align_up(timestamp: Timestamp, width: i64) -> Timestamp {
    let rem = (timestamp - bucket_origin(width)).rem_euclid(width);
    if rem == 0 {
        timestamp
    } else {
        timestamp + (width - rem)
    }
}

/// One raw measurement read from the raw series store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    /// Sample timestamp in milliseconds
    pub timestamp: Timestamp,

    /// Named field values (e.g. `value`, `resting_heart_rate`)
    pub fields: BTreeMap<String, f64>,
}

impl RawSample {
    /// Create a sample with a single `value` field
    pub fn single(timestamp: Timestamp, value: f64) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("value".to_string(), value);
        Self { timestamp, fields }
    }

    /// Create a sample from (name, value) pairs
    pub fn with_fields(timestamp: Timestamp, fields: &[(&str, f64)]) -> Self {
        Self {
            timestamp,
            fields: fields
                .iter()
                .map(|(name, value)| (name.to_string(), *value))
                .collect(),
        }
    }
}

/// Identity of one materialized series: (metric, tier, entity)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TierKey {
    /// Metric name
    pub metric: MetricId,

    /// Tier identifier
    pub tier: TierId,

    /// Entity identifier
    pub entity: EntityId,
}

impl TierKey {
    /// Create a new key
    pub fn new(
        metric: impl Into<MetricId>,
        tier: impl Into<TierId>,
        entity: impl Into<EntityId>,
    ) -> Self {
        Self {
            metric: metric.into(),
            tier: tier.into(),
            entity: entity.into(),
        }
    }
}

impl fmt::Display for TierKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.metric, self.tier, self.entity)
    }
}

/// Parse a duration such as `30s`, `1m`, `1h`, `1d`, `1w` or `250ms`
pub fn parse_duration_ms(input: &str) -> Result<i64, String> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("duration '{}' is missing a unit", input))?;
    let (digits, unit) = input.split_at(split);
    let amount: i64 = digits
        .parse()
        .map_err(|_| format!("duration '{}' has no numeric amount", input))?;
    if amount <= 0 {
        return Err(format!("duration '{}' must be positive", input));
    }
    let unit_ms = match unit {
        "ms" => 1,
        "s" => SECOND_MS,
        "m" | "min" => MINUTE_MS,
        "h" => HOUR_MS,
        "d" => DAY_MS,
        "w" => WEEK_MS,
        other => return Err(format!("unknown duration unit '{}' in '{}'", other, input)),
    };
    amount
        .checked_mul(unit_ms)
        .ok_or_else(|| format!("duration '{}' overflows", input))
}

/// Format milliseconds using the largest unit that divides them exactly
pub fn format_duration_ms(ms: i64) -> String {
    for (unit_ms, suffix) in [
        (WEEK_MS, "w"),
        (DAY_MS, "d"),
        (HOUR_MS, "h"),
        (MINUTE_MS, "m"),
        (SECOND_MS, "s"),
    ] {
        if ms != 0 && ms % unit_ms == 0 {
            return format!("{}{}", ms / unit_ms, suffix);
        }
    }
    format!("{}ms", ms)
}

/// Parse `YYYY-MM-DD`, RFC 3339, or epoch milliseconds
pub fn parse_timestamp(input: &str) -> Result<Timestamp, String> {
    let input = input.trim();
    if let Ok(ms) = input.parse::<i64>() {
        return Ok(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc).timestamp_millis());
    }
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| format!("invalid date '{}'", input))?;
        return Ok(midnight.and_utc().timestamp_millis());
    }
    Err(format!(
        "'{}' is not a date (YYYY-MM-DD), RFC 3339 timestamp, or epoch milliseconds",
        input
    ))
}

/// Render a timestamp as RFC 3339 in UTC
pub fn format_timestamp(ts: Timestamp) -> String {
    DateTime::<Utc>::from_timestamp_millis(ts)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| ts.to_string())
}

/// Current wall clock time in milliseconds
pub fn now_ms() -> Timestamp {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    #[test]
    fn test_time_range_validation() {
        assert!(TimeRange::new(0, 10).is_ok());
        assert_eq!(TimeRange::new(5, 5), Err(RangeError::Empty(5)));
        assert_eq!(
            TimeRange::new(10, 5),
            Err(RangeError::Inverted { start: 10, end: 5 })
        );
    }

    #[test]
    fn test_time_range_half_open() {
        let range = TimeRange::new(100, 200).unwrap();
        assert!(range.contains(100));
        assert!(range.contains(199));
        assert!(!range.contains(200));
        assert_eq!(range.duration_ms(), 100);
    }

    #[test]
    fn test_alignment_negative_timestamps() {
        assert_eq!(align_down(-1, 60), -60);
        assert_eq!(align_up(-1, 60), 0);
        assert_eq!(align_down(120, 60), 120);
        assert_eq!(align_up(121, 60), 180);
    }

    #[test]
    fn test_week_buckets_start_on_monday() {
        // The epoch was a Thursday
        assert_eq!(align_down(0, WEEK_MS), -3 * DAY_MS);
        assert_eq!(align_up(0, WEEK_MS), WEEK_ORIGIN_MS);
        assert_eq!(align_down(0, DAY_MS), 0);

        // Wednesday 2024-03-13 12:00 UTC
        let ts = parse_timestamp("2024-03-13T12:00:00Z").unwrap();
        for width in [WEEK_MS, 2 * WEEK_MS] {
            let start = DateTime::<Utc>::from_timestamp_millis(align_down(ts, width)).unwrap();
            assert_eq!(start.weekday(), chrono::Weekday::Mon);
            assert_eq!(start.timestamp_millis() % DAY_MS, 0);
        }
        assert_eq!(
            format_timestamp(align_down(ts, WEEK_MS)),
            "2024-03-11T00:00:00Z"
        );
        assert_eq!(TimeRange::new(ts, ts + 1).unwrap().buckets(WEEK_MS).count(), 1);
    }

    #[test]
    fn test_bucket_count_rounds_up() {
        let range = TimeRange::new(0, 2 * DAY_MS).unwrap();
        assert_eq!(range.bucket_count(HOUR_MS), 48);
        let range = TimeRange::new(0, 90 * SECOND_MS).unwrap();
        assert_eq!(range.bucket_count(MINUTE_MS), 2);
    }

    #[test]
    fn test_buckets_iterates_aligned_starts() {
        let range = TimeRange::new(30, 200).unwrap();
        let starts: Vec<_> = range.buckets(60).collect();
        assert_eq!(starts, vec![0, 60, 120, 180]);
    }

    #[test]
    fn test_bucket_starts_within() {
        let range = TimeRange::new(30, 200).unwrap();
        assert_eq!(range.bucket_starts_within(60), TimeRange::new_unchecked(60, 240));
    }

    #[test]
    fn test_intersect() {
        let a = TimeRange::new(0, 100).unwrap();
        let b = TimeRange::new(50, 150).unwrap();
        assert_eq!(a.intersect(&b), Some(TimeRange::new_unchecked(50, 100)));
        let c = TimeRange::new(100, 150).unwrap();
        assert_eq!(a.intersect(&c), None);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration_ms("1s"), Ok(SECOND_MS));
        assert_eq!(parse_duration_ms("5m"), Ok(5 * MINUTE_MS));
        assert_eq!(parse_duration_ms("1h"), Ok(HOUR_MS));
        assert_eq!(parse_duration_ms("1d"), Ok(DAY_MS));
        assert_eq!(parse_duration_ms("1w"), Ok(WEEK_MS));
        assert_eq!(parse_duration_ms("250ms"), Ok(250));
        assert!(parse_duration_ms("0h").is_err());
        assert!(parse_duration_ms("10").is_err());
        assert!(parse_duration_ms("1mo").is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration_ms(MINUTE_MS), "1m");
        assert_eq!(format_duration_ms(90 * SECOND_MS), "90s");
        assert_eq!(format_duration_ms(WEEK_MS), "1w");
        assert_eq!(format_duration_ms(1500), "1500ms");
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert_eq!(parse_timestamp("1700000000000"), Ok(1_700_000_000_000));
        assert_eq!(parse_timestamp("1970-01-02"), Ok(DAY_MS));
        assert_eq!(parse_timestamp("1970-01-01T01:00:00Z"), Ok(HOUR_MS));
        assert!(parse_timestamp("yesterday").is_err());
    }
}
