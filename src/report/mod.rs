//! Renderers for an [`AnalysisSummary`].

pub mod html;
pub mod text;

use serde::Serialize;

use crate::aggregate::at_least;
use crate::period::TimePeriod;
use crate::providers::ProviderGroup;
use crate::summary::AnalysisSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportOptions {
    pub verbose: bool,
    pub top_sources: usize,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            top_sources: 10,
        }
    }
}

pub fn to_json(summary: &AnalysisSummary) -> serde_json::Result<String> {
    serde_json::to_string_pretty(summary)
}

/// How a sending organization authenticates, by pass rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceCategory {
    Authenticated,
    Forwarded,
    Unauthenticated,
}

impl SourceCategory {
    /// At least 90% SPF or DKIM passes is authenticated; mostly DKIM with
    /// little SPF looks like forwarding.
    pub fn of(group: &ProviderGroup) -> Self {
        let total = group.total_messages;
        if at_least(group.dkim_pass, total, 90) || at_least(group.spf_pass, total, 90) {
            SourceCategory::Authenticated
        } else if at_least(group.dkim_pass, total, 80)
            && group.spf_pass.saturating_mul(100) <= total.saturating_mul(20)
        {
            SourceCategory::Forwarded
        } else {
            SourceCategory::Unauthenticated
        }
    }
}

pub(crate) fn period_title(period: TimePeriod) -> &'static str {
    match period {
        TimePeriod::Last30 => "Last 30 Days",
        TimePeriod::Last90 => "Last 90 Days",
        TimePeriod::Last180 => "Last 180 Days",
        TimePeriod::Last360 => "Last Year",
        TimePeriod::All => "All Time",
    }
}

pub(crate) fn pct(part: u64, whole: u64) -> String {
    format!("{:.1}%", crate::aggregate::percentage(part, whole))
}

pub(crate) fn truncate_string(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
