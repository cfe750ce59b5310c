//! Per-cluster time series, the unit of storage and merging.

use chrono::{NaiveDate, NaiveDateTime};

/// Index of a landscape cluster as written by the clustering step.
pub type ClusterId = u32;

/// Timestamp format used when writing tables (ISO-8601, second resolution).
pub const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Time series of one variable for one cluster.
///
/// `times` and `values` always have the same length. Series produced by the
/// store or the merger have strictly increasing timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSeries {
    pub cluster_id: ClusterId,
    pub variable: String,
    pub times: Vec<NaiveDateTime>,
    pub values: Vec<f64>,
}

impl ClusterSeries {
    /// Creates an empty series.
    pub fn empty(cluster_id: ClusterId, variable: &str) -> Self {
        Self {
            cluster_id,
            variable: variable.to_string(),
            times: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Creates a series from `(timestamp, value)` pairs, keeping their order.
    pub fn from_pairs<I>(cluster_id: ClusterId, variable: &str, pairs: I) -> Self
    where
        I: IntoIterator<Item = (NaiveDateTime, f64)>,
    {
        let (times, values) = pairs.into_iter().unzip();
        Self {
            cluster_id,
            variable: variable.to_string(),
            times,
            values,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.times.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// First timestamp, if any.
    #[inline]
    pub fn start(&self) -> Option<NaiveDateTime> {
        self.times.first().copied()
    }

    /// Last timestamp, if any.
    #[inline]
    pub fn end(&self) -> Option<NaiveDateTime> {
        self.times.last().copied()
    }

    /// Appends a sample at the end.
    #[inline]
    pub fn push(&mut self, time: NaiveDateTime, value: f64) {
        self.times.push(time);
        self.values.push(value);
    }

    /// Iterates over `(timestamp, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (NaiveDateTime, f64)> + '_ {
        self.times.iter().copied().zip(self.values.iter().copied())
    }

    /// Value at exactly `time`, found by binary search.
    pub fn value_at(&self, time: NaiveDateTime) -> Option<f64> {
        self.times
            .binary_search(&time)
            .ok()
            .map(|idx| self.values[idx])
    }

    /// Stable sort by timestamp. Duplicates keep their relative order.
    pub fn sort_by_time(&mut self) {
        if self.is_strictly_increasing() {
            return;
        }
        let mut pairs: Vec<(NaiveDateTime, f64)> = self.iter().collect();
        pairs.sort_by_key(|&(t, _)| t);
        let (times, values) = pairs.into_iter().unzip();
        self.times = times;
        self.values = values;
    }

    /// Returns the first timestamp that is not strictly after its predecessor.
    pub fn first_non_increasing(&self) -> Option<NaiveDateTime> {
        self.times
            .windows(2)
            .find(|w| w[1] <= w[0])
            .map(|w| w[1])
    }

    /// True when every timestamp is strictly after the previous one.
    #[inline]
    pub fn is_strictly_increasing(&self) -> bool {
        self.first_non_increasing().is_none()
    }

    /// Multiplies every value by `factor`.
    pub fn scaled(mut self, factor: f64) -> Self {
        if factor != 1.0 {
            for v in &mut self.values {
                *v *= factor;
            }
        }
        self
    }
}

/// Parse a timestamp written either as ISO-8601 date-time or as a bare date.
///
/// Accepts `2024-09-01T06:00:00`, `2024-09-01 06:00:00`, `2024-09-01 06:00`
/// and `2024-09-01` (midnight).
pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    const FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ];
    for fmt in FORMATS {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(t);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Format a timestamp the way the store writes it.
#[inline]
pub fn format_timestamp(t: NaiveDateTime) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Build a timestamp from the point model's `year month day hour` columns.
pub fn timestamp_from_parts(year: i32, month: u32, day: u32, hour: u32) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(year, month, day).and_then(|d| d.and_hms_opt(hour, 0, 0))
}


#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;

    #[test]
    fn test_series_basics() {
        let s = daily(3, day(2024, 9, 1), 5, 10.0);
        assert_eq!(s.len(), 5);
        assert_eq!(s.start(), Some(day(2024, 9, 1)));
        assert_eq!(s.end(), Some(day(2024, 9, 5)));
        assert_eq!(s.value_at(day(2024, 9, 3)), Some(12.0));
        assert_eq!(s.value_at(day(2024, 10, 3)), None);
        assert!(s.is_strictly_increasing());
    }

    #[test]
    fn test_sort_by_time_keeps_duplicates() {
        let mut s = ClusterSeries::from_pairs(
            1,
            "snd",
            vec![(day(2024, 1, 3), 3.0), (day(2024, 1, 1), 1.0), (day(2024, 1, 1), 1.5)],
        );
        s.sort_by_time();
        assert_eq!(s.values, vec![1.0, 1.5, 3.0]);
        assert_eq!(s.first_non_increasing(), Some(day(2024, 1, 1)));
    }

    #[test]
    fn test_parse_timestamp_variants() {
        let expected = day(2024, 11, 25) + chrono::Duration::hours(6);
        assert_eq!(parse_timestamp("2024-11-25T06:00:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-11-25 06:00:00"), Some(expected));
        assert_eq!(parse_timestamp(" 2024-11-25 06:00 "), Some(expected));
        assert_eq!(parse_timestamp("2024-11-25"), Some(day(2024, 11, 25)));
        assert_eq!(parse_timestamp("25/11/2024"), None);
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(day(2024, 12, 10)), "2024-12-10T00:00:00");
        assert_eq!(timestamp_from_parts(2024, 2, 30, 0), None);
    }

    #[test]
    fn test_scaled() {
        let s = daily(1, day(2024, 1, 1), 2, 1000.0).scaled(0.5);
        assert_eq!(s.values, vec![500.0, 500.5]);
    }
}
