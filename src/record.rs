//! Normalized record model.
//!
//! Everything the parser hands downstream lives here; raw XML never leaves
//! the parser.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::alignment::AlignmentMode;

/// Raw SPF result as reported by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpfResult {
    Pass,
    Fail,
    SoftFail,
    Neutral,
    None,
    TempError,
    PermError,
}

impl SpfResult {
    pub const ALL: [SpfResult; 7] = [
        SpfResult::Pass,
        SpfResult::Fail,
        SpfResult::SoftFail,
        SpfResult::Neutral,
        SpfResult::None,
        SpfResult::TempError,
        SpfResult::PermError,
    ];

    /// Case-insensitive match against the fixed vocabulary.
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "pass" => Some(SpfResult::Pass),
            "fail" => Some(SpfResult::Fail),
            "softfail" => Some(SpfResult::SoftFail),
            "neutral" => Some(SpfResult::Neutral),
            "none" => Some(SpfResult::None),
            "temperror" => Some(SpfResult::TempError),
            "permerror" => Some(SpfResult::PermError),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SpfResult::Pass => "pass",
            SpfResult::Fail => "fail",
            SpfResult::SoftFail => "softfail",
            SpfResult::Neutral => "neutral",
            SpfResult::None => "none",
            SpfResult::TempError => "temperror",
            SpfResult::PermError => "permerror",
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, SpfResult::Pass)
    }

    pub(crate) fn strength(&self) -> u8 {
        match self {
            SpfResult::Pass => 6,
            SpfResult::Fail => 5,
            SpfResult::SoftFail => 4,
            SpfResult::PermError => 3,
            SpfResult::TempError => 2,
            SpfResult::Neutral => 1,
            SpfResult::None => 0,
        }
    }
}

impl fmt::Display for SpfResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw DKIM result for one signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DkimResult {
    Pass,
    Fail,
    Neutral,
    Policy,
    TempError,
    PermError,
    None,
}

impl DkimResult {
    pub const ALL: [DkimResult; 7] = [
        DkimResult::Pass,
        DkimResult::Fail,
        DkimResult::Neutral,
        DkimResult::Policy,
        DkimResult::TempError,
        DkimResult::PermError,
        DkimResult::None,
    ];

    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "pass" => Some(DkimResult::Pass),
            "fail" => Some(DkimResult::Fail),
            "neutral" => Some(DkimResult::Neutral),
            "policy" => Some(DkimResult::Policy),
            "temperror" => Some(DkimResult::TempError),
            "permerror" => Some(DkimResult::PermError),
            "none" => Some(DkimResult::None),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DkimResult::Pass => "pass",
            DkimResult::Fail => "fail",
            DkimResult::Neutral => "neutral",
            DkimResult::Policy => "policy",
            DkimResult::TempError => "temperror",
            DkimResult::PermError => "permerror",
            DkimResult::None => "none",
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, DkimResult::Pass)
    }

    fn strength(&self) -> u8 {
        match self {
            DkimResult::Pass => 6,
            DkimResult::Fail => 5,
            DkimResult::PermError => 4,
            DkimResult::TempError => 3,
            DkimResult::Policy => 2,
            DkimResult::Neutral => 1,
            DkimResult::None => 0,
        }
    }
}

impl fmt::Display for DkimResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `p=`/`sp=` values and the receiver's applied disposition share one vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    None,
    Quarantine,
    Reject,
}

impl PolicyAction {
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "none" => Some(PolicyAction::None),
            "quarantine" => Some(PolicyAction::Quarantine),
            "reject" => Some(PolicyAction::Reject),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyAction::None => "none",
            PolicyAction::Quarantine => "quarantine",
            PolicyAction::Reject => "reject",
        }
    }
}

impl fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyOverride {
    pub kind: String,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkimSignature {
    pub domain: String,
    pub selector: Option<String>,
    pub result: DkimResult,
}

/// Covering period of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DateRange {
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    /// Inclusive overlap with `[start, end]`.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.begin <= end && self.end >= start
    }
}

/// Policy the domain owner published, as echoed by the receiver.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyPublished {
    pub domain: String,
    pub adkim: Option<AlignmentMode>,
    pub aspf: Option<AlignmentMode>,
    pub policy: PolicyAction,
    pub subdomain_policy: PolicyAction,
    pub pct: u8,
}

impl Default for PolicyPublished {
    fn default() -> Self {
        Self {
            domain: "Unknown".to_string(),
            adkim: None,
            aspf: None,
            policy: PolicyAction::None,
            subdomain_policy: PolicyAction::None,
            pct: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub org_name: String,
    pub email: Option<String>,
    pub report_id: Option<String>,
    pub date_range: DateRange,
    pub policy: PolicyPublished,
    /// SPF/DKIM result tokens outside the vocabulary, normalized to `none`.
    pub unrecognized_results: Vec<String>,
}

/// One authentication evaluation for one (batch of) delivery attempt(s).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub source_ip: IpAddr,
    pub count: u64,
    pub header_from_domain: String,
    pub envelope_from: Option<String>,
    pub spf_domain: Option<String>,
    pub spf_result: SpfResult,
    pub dkim_signatures: Vec<DkimSignature>,
    pub disposition: Option<PolicyAction>,
    pub policy_override_reasons: Vec<PolicyOverride>,
    /// Receiver's own DMARC-level DKIM/SPF verdicts from `policy_evaluated`.
    pub evaluated_dkim: Option<String>,
    pub evaluated_spf: Option<String>,
    pub report_date_range: DateRange,
    pub org_name: String,
}

impl Record {
    /// Strongest signature: the first passing one, otherwise the first of the
    /// highest-ranked result.
    pub fn strongest_dkim(&self) -> Option<&DkimSignature> {
        self.dkim_signatures
            .iter()
            .fold(None, |best: Option<&DkimSignature>, sig| match best {
                Some(b) if b.result.strength() >= sig.result.strength() => Some(b),
                _ => Some(sig),
            })
    }

    pub fn dkim_result(&self) -> DkimResult {
        self.strongest_dkim()
            .map(|sig| sig.result)
            .unwrap_or(DkimResult::None)
    }

    pub fn dkim_domain(&self) -> Option<&str> {
        self.strongest_dkim().map(|sig| sig.domain.as_str())
    }

    pub fn disposition_label(&self) -> &'static str {
        self.disposition.map(|d| d.as_str()).unwrap_or("unknown")
    }
}
