//! The run's output structure, shared by every emitter.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::aggregate::{PeriodStats, SourceAggregate};
use crate::alignment::AlignmentSetting;
use crate::error::{LoadError, ParseError, ParseReason, ResolutionError};
use crate::period::TimePeriod;
use crate::recommendations::{recommend, DomainRecommendation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MalformedXml,
    MissingRequiredField,
    InvalidCount,
    Unreadable,
}

impl From<ParseReason> for SkipReason {
    fn from(reason: ParseReason) -> Self {
        match reason {
            ParseReason::MalformedXml => SkipReason::MalformedXml,
            ParseReason::MissingRequiredField => SkipReason::MissingRequiredField,
            ParseReason::InvalidCount => SkipReason::InvalidCount,
        }
    }
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::MalformedXml => "malformed_xml",
            SkipReason::MissingRequiredField => "missing_required_field",
            SkipReason::InvalidCount => "invalid_count",
            SkipReason::Unreadable => "unreadable",
        }
    }
}

/// A candidate file that contributed nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedReport {
    pub name: String,
    pub reason: SkipReason,
    pub detail: String,
}

impl SkippedReport {
    pub fn from_parse_error(name: impl Into<String>, error: &ParseError) -> Self {
        Self {
            name: name.into(),
            reason: error.reason.into(),
            detail: error.detail.clone(),
        }
    }

    pub fn from_load_error(name: impl Into<String>, error: &LoadError) -> Self {
        Self {
            name: name.into(),
            reason: SkipReason::Unreadable,
            detail: error.to_string(),
        }
    }
}

/// A parsed report that used result tokens outside the DMARC vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NonconformantReport {
    pub name: String,
    pub org_name: String,
    pub report_id: Option<String>,
    pub tokens: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnresolvedIp {
    pub ip: IpAddr,
    pub reason: String,
}

impl From<&ResolutionError> for UnresolvedIp {
    fn from(error: &ResolutionError) -> Self {
        let ip = match error {
            ResolutionError::Timeout { ip }
            | ResolutionError::NoRecord { ip }
            | ResolutionError::Lookup { ip, .. } => *ip,
        };
        Self {
            ip,
            reason: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunTotals {
    pub candidate_files: usize,
    pub parsed_reports: usize,
    pub skipped_reports: usize,
    /// Messages across every parsed report, before period filtering.
    pub total_messages: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisSummary {
    pub generated_at: DateTime<Utc>,
    /// The "now" the period windows were measured from.
    pub anchor: DateTime<Utc>,
    pub alignment: AlignmentSetting,
    pub default_period: TimePeriod,
    pub periods: Vec<PeriodStats>,
    /// Keyed by `(source_ip, period_label)`, sorted by that key.
    pub sources: Vec<SourceAggregate>,
    pub totals: RunTotals,
    pub skipped: Vec<SkippedReport>,
    pub nonconformant: Vec<NonconformantReport>,
    pub unresolved: Vec<UnresolvedIp>,
    pub resolved_ips: bool,
}

impl AnalysisSummary {
    pub fn period_stats(&self, period: TimePeriod) -> Option<&PeriodStats> {
        self.periods.iter().find(|stats| stats.period == period)
    }

    pub fn display_stats(&self) -> Option<&PeriodStats> {
        self.period_stats(self.default_period)
    }

    /// Sources for one period, busiest first.
    pub fn sources_for(&self, period: TimePeriod) -> Vec<&SourceAggregate> {
        let mut sources: Vec<&SourceAggregate> = self
            .sources
            .iter()
            .filter(|source| source.period == period)
            .collect();
        sources.sort_by(|a, b| {
            b.total_messages
                .cmp(&a.total_messages)
                .then_with(|| a.source_ip.cmp(&b.source_ip))
        });
        sources
    }

    pub fn recommendations(&self) -> Vec<DomainRecommendation> {
        self.display_stats().map(recommend).unwrap_or_default()
    }
}

/// 30 days if it saw mail, else the shortest requested period that did,
/// else `all` when requested, else the first requested period.
pub fn choose_default_period(periods: &[PeriodStats]) -> TimePeriod {
    let with_messages = |period: TimePeriod| {
        periods
            .iter()
            .any(|stats| stats.period == period && stats.has_messages())
    };
    if with_messages(TimePeriod::Last30) {
        return TimePeriod::Last30;
    }
    if let Some(stats) = periods
        .iter()
        .filter(|stats| stats.has_messages())
        .min_by_key(|stats| stats.period)
    {
        return stats.period;
    }
    if periods.iter().any(|stats| stats.period == TimePeriod::All) {
        return TimePeriod::All;
    }
    periods
        .iter()
        .map(|stats| stats.period)
        .min()
        .unwrap_or(TimePeriod::All)
}
