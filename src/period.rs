//! Reporting windows and the inclusion test applied before aggregation.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigError;
use crate::record::DateRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimePeriod {
    Last30,
    Last90,
    Last180,
    Last360,
    All,
}

impl TimePeriod {
    pub const ALL_PERIODS: [TimePeriod; 5] = [
        TimePeriod::Last30,
        TimePeriod::Last90,
        TimePeriod::Last180,
        TimePeriod::Last360,
        TimePeriod::All,
    ];

    pub fn days(&self) -> Option<i64> {
        match self {
            TimePeriod::Last30 => Some(30),
            TimePeriod::Last90 => Some(90),
            TimePeriod::Last180 => Some(180),
            TimePeriod::Last360 => Some(360),
            TimePeriod::All => None,
        }
    }

    /// Token used on the command line and as the aggregate period label.
    pub fn label(&self) -> &'static str {
        match self {
            TimePeriod::Last30 => "30",
            TimePeriod::Last90 => "90",
            TimePeriod::Last180 => "180",
            TimePeriod::Last360 => "360",
            TimePeriod::All => "all",
        }
    }

    pub fn description(&self) -> String {
        match self.days() {
            Some(days) => format!("the last {days} days"),
            None => "all available data".to_string(),
        }
    }
}

impl fmt::Display for TimePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for TimePeriod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "30" => Ok(TimePeriod::Last30),
            "90" => Ok(TimePeriod::Last90),
            "180" => Ok(TimePeriod::Last180),
            "360" => Ok(TimePeriod::Last360),
            "all" => Ok(TimePeriod::All),
            _ => Err(ConfigError::InvalidPeriod(s.to_string())),
        }
    }
}

impl Serialize for TimePeriod {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

impl<'de> Deserialize<'de> for TimePeriod {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // YAML may hand us `30` as a number.
        let value = serde_yaml::Value::deserialize(deserializer)?;
        let token = match value {
            serde_yaml::Value::String(s) => s,
            serde_yaml::Value::Number(n) => n.to_string(),
            other => {
                return Err(serde::de::Error::custom(format!(
                    "invalid time period: {other:?}"
                )))
            }
        };
        token.parse().map_err(serde::de::Error::custom)
    }
}

/// Decides report inclusion for one window relative to an injected "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodFilter {
    pub period: TimePeriod,
    pub now: DateTime<Utc>,
}

impl PeriodFilter {
    pub fn new(period: TimePeriod, now: DateTime<Utc>) -> Self {
        Self { period, now }
    }

    /// Start of the window, `None` for `all`.
    pub fn window_start(&self) -> Option<DateTime<Utc>> {
        self.period.days().map(|days| self.now - Duration::days(days))
    }

    /// Inclusive overlap of the report range with `[now - window, now]`.
    pub fn includes(&self, range: &DateRange) -> bool {
        match self.window_start() {
            None => true,
            Some(start) => range.overlaps(start, self.now),
        }
    }
}

/// Where the period windows are anchored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeriodAnchor {
    /// Wall-clock time when the run starts.
    #[default]
    Clock,
    /// Latest end timestamp among the parsed reports.
    LatestReport,
    Fixed(DateTime<Utc>),
}

impl PeriodAnchor {
    pub fn resolve<'a, I>(&self, clock: DateTime<Utc>, ranges: I) -> DateTime<Utc>
    where
        I: IntoIterator<Item = &'a DateRange>,
    {
        match self {
            PeriodAnchor::Clock => clock,
            PeriodAnchor::Fixed(at) => *at,
            PeriodAnchor::LatestReport => ranges
                .into_iter()
                .map(|range| range.end)
                .max()
                .unwrap_or(clock),
        }
    }
}

/// Parse `--as-of`: RFC 3339, or a bare date taken as midnight UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, ConfigError> {
    let value = value.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(value) {
        return Ok(at.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| ConfigError::InvalidTimestamp(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::fixtures::range;
    use chrono::TimeZone;

    const DAY: i64 = 86_400;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_periods() {
        assert_eq!("30".parse::<TimePeriod>().unwrap(), TimePeriod::Last30);
        assert_eq!("ALL".parse::<TimePeriod>().unwrap(), TimePeriod::All);
        assert!(matches!(
            "45".parse::<TimePeriod>(),
            Err(ConfigError::InvalidPeriod(_))
        ));
        for period in TimePeriod::ALL_PERIODS {
            assert_eq!(period.label().parse::<TimePeriod>().unwrap(), period);
        }
    }

    #[test]
    fn test_periods_deserialize_from_yaml_numbers() {
        let periods: Vec<TimePeriod> = serde_yaml::from_str("[30, \"90\", all]").unwrap();
        assert_eq!(
            periods,
            vec![TimePeriod::Last30, TimePeriod::Last90, TimePeriod::All]
        );
    }

    #[test]
    fn test_window_boundaries() {
        let now = now().timestamp();
        let filter = PeriodFilter::new(TimePeriod::Last30, self::now());

        let ends_exactly_30_days_ago = range(now - 31 * DAY, now - 30 * DAY);
        assert!(filter.includes(&ends_exactly_30_days_ago));

        let ends_31_days_ago = range(now - 32 * DAY, now - 31 * DAY);
        assert!(!filter.includes(&ends_31_days_ago));

        let straddles_start = range(now - 40 * DAY, now - 20 * DAY);
        assert!(filter.includes(&straddles_start));

        let in_future = range(now + DAY, now + 2 * DAY);
        assert!(!filter.includes(&in_future));
    }

    #[test]
    fn test_all_includes_everything() {
        let filter = PeriodFilter::new(TimePeriod::All, now());
        assert!(filter.includes(&range(0, DAY)));
        assert_eq!(filter.window_start(), None);
    }

    #[test]
    fn test_anchor_resolution() {
        let clock = now();
        let ranges = [range(0, DAY), range(DAY, 5 * DAY), range(2 * DAY, 3 * DAY)];
        assert_eq!(PeriodAnchor::Clock.resolve(clock, &ranges), clock);
        assert_eq!(
            PeriodAnchor::LatestReport.resolve(clock, &ranges).timestamp(),
            5 * DAY
        );
        assert_eq!(
            PeriodAnchor::LatestReport.resolve(clock, std::iter::empty()),
            clock
        );
    }

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp("2024-06-01").unwrap(), now());
        assert_eq!(parse_timestamp("2024-06-01T02:00:00+02:00").unwrap(), now());
        assert!(parse_timestamp("June 1st").is_err());
    }
}
