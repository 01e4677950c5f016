//! DMARC aggregate report parsing.
//!
//! The XML is deserialized into permissive raw structs (every field optional,
//! unknown elements ignored) and then normalized into [`ReportMetadata`] and
//! [`Record`]s. Any structural problem rejects the whole document.

use std::collections::BTreeSet;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::alignment::AlignmentMode;
use crate::domain_utils::DomainUtils;
use crate::error::ParseError;
use crate::record::{
    DateRange, DkimResult, DkimSignature, PolicyAction, PolicyOverride,
    PolicyPublished, Record, ReportMetadata, SpfResult,
};

#[derive(Debug, Default, Deserialize)]
struct RawFeedback {
    #[serde(alias = "report-metadata")]
    report_metadata: Option<RawReportMetadata>,
    #[serde(alias = "policy-published")]
    policy_published: Option<RawPolicyPublished>,
    #[serde(default)]
    record: Vec<RawRecord>,
}

#[derive(Debug, Default, Deserialize)]
struct RawReportMetadata {
    #[serde(alias = "org-name")]
    org_name: Option<String>,
    email: Option<String>,
    #[serde(alias = "report-id")]
    report_id: Option<String>,
    #[serde(alias = "date-range")]
    date_range: Option<RawDateRange>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDateRange {
    begin: Option<String>,
    end: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPolicyPublished {
    domain: Option<String>,
    adkim: Option<String>,
    aspf: Option<String>,
    p: Option<String>,
    sp: Option<String>,
    pct: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRecord {
    row: Option<RawRow>,
    identifiers: Option<RawIdentifiers>,
    #[serde(alias = "auth-results")]
    auth_results: Option<RawAuthResults>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRow {
    #[serde(alias = "source-ip")]
    source_ip: Option<String>,
    count: Option<String>,
    #[serde(alias = "policy-evaluated")]
    policy_evaluated: Option<RawPolicyEvaluated>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPolicyEvaluated {
    disposition: Option<String>,
    dkim: Option<String>,
    spf: Option<String>,
    #[serde(default)]
    reason: Vec<RawReason>,
}

#[derive(Debug, Default, Deserialize)]
struct RawReason {
    #[serde(rename = "type")]
    kind: Option<String>,
    comment: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawIdentifiers {
    #[serde(alias = "header-from")]
    header_from: Option<String>,
    #[serde(alias = "envelope-from")]
    envelope_from: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawAuthResults {
    #[serde(default)]
    dkim: Vec<RawDkim>,
    #[serde(default)]
    spf: Vec<RawSpf>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDkim {
    domain: Option<String>,
    selector: Option<String>,
    result: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSpf {
    domain: Option<String>,
    scope: Option<String>,
    result: Option<String>,
}

/// One successfully parsed report file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedReport {
    pub name: String,
    pub metadata: ReportMetadata,
    pub records: Vec<Record>,
}

impl ParsedReport {
    pub fn parse(name: impl Into<String>, document: &[u8]) -> Result<Self, ParseError> {
        let (metadata, records) = parse_report(document)?;
        Ok(Self {
            name: name.into(),
            metadata,
            records,
        })
    }

    pub fn message_count(&self) -> u64 {
        self.records
            .iter()
            .fold(0u64, |total, r| total.saturating_add(r.count))
    }
}

/// Parse one aggregate report document.
pub fn parse_report(document: &[u8]) -> Result<(ReportMetadata, Vec<Record>), ParseError> {
    let xml = std::str::from_utf8(document)
        .map_err(|e| ParseError::malformed(format!("document is not UTF-8: {e}")))?;
    parse_report_str(xml)
}

pub fn parse_report_str(xml: &str) -> Result<(ReportMetadata, Vec<Record>), ParseError> {
    let xml = xml.trim_start_matches('\u{feff}');
    if xml.trim().is_empty() {
        return Err(ParseError::malformed("empty document"));
    }

    let raw: RawFeedback =
        quick_xml::de::from_str(xml).map_err(|e| ParseError::malformed(e.to_string()))?;

    let mut unrecognized = BTreeSet::new();
    let metadata_raw = raw
        .report_metadata
        .ok_or_else(|| ParseError::missing("report_metadata"))?;
    let date_range = normalize_date_range(metadata_raw.date_range)?;
    let policy = normalize_policy(raw.policy_published.unwrap_or_default());
    let org_name = text(&metadata_raw.org_name)
        .unwrap_or("Unknown")
        .to_string();

    let records = raw
        .record
        .into_iter()
        .map(|record| normalize_record(record, &date_range, &org_name, &mut unrecognized))
        .collect::<Result<Vec<_>, _>>()?;

    let metadata = ReportMetadata {
        org_name,
        email: text(&metadata_raw.email).map(str::to_string),
        report_id: text(&metadata_raw.report_id).map(str::to_string),
        date_range,
        policy,
        unrecognized_results: unrecognized.into_iter().collect(),
    };

    Ok((metadata, records))
}

/// Trimmed, non-empty element text.
fn text(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn parse_timestamp(value: Option<&str>, field: &str) -> Result<DateTime<Utc>, ParseError> {
    let value = value.ok_or_else(|| ParseError::missing(field))?;
    let secs: i64 = value.parse().map_err(|_| {
        ParseError::malformed(format!("<{field}> is not a unix timestamp: '{value}'"))
    })?;
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| ParseError::malformed(format!("<{field}> out of range: {secs}")))
}

fn normalize_date_range(raw: Option<RawDateRange>) -> Result<DateRange, ParseError> {
    let raw = raw.ok_or_else(|| ParseError::missing("date_range"))?;
    let begin = parse_timestamp(text(&raw.begin), "begin")?;
    let end = parse_timestamp(text(&raw.end), "end")?;
    if begin > end {
        return Err(ParseError::malformed("date_range begins after it ends"));
    }
    Ok(DateRange { begin, end })
}

fn normalize_policy(raw: RawPolicyPublished) -> PolicyPublished {
    let defaults = PolicyPublished::default();
    let policy = text(&raw.p)
        .and_then(PolicyAction::from_token)
        .unwrap_or(defaults.policy);
    PolicyPublished {
        domain: text(&raw.domain)
            .map(DomainUtils::normalize)
            .unwrap_or(defaults.domain),
        adkim: text(&raw.adkim).and_then(AlignmentMode::from_tag),
        aspf: text(&raw.aspf).and_then(AlignmentMode::from_tag),
        policy,
        subdomain_policy: text(&raw.sp)
            .and_then(PolicyAction::from_token)
            .unwrap_or(policy),
        pct: text(&raw.pct)
            .and_then(|pct| pct.parse::<u8>().ok())
            .map(|pct| pct.min(100))
            .unwrap_or(defaults.pct),
    }
}

/// Largest per-record message count accepted. Keeps run-wide sums far from
/// `u64` overflow.
pub const MAX_RECORD_COUNT: u64 = u32::MAX as u64;

fn parse_count(value: Option<&str>) -> Result<u64, ParseError> {
    let value = value.ok_or_else(|| ParseError::missing("count"))?;
    match value.parse::<u64>() {
        Ok(0) => Err(ParseError::invalid_count("count must be at least 1")),
        Ok(count) if count > MAX_RECORD_COUNT => Err(ParseError::invalid_count(format!(
            "count {count} exceeds {MAX_RECORD_COUNT}"
        ))),
        Ok(count) => Ok(count),
        Err(_) => Err(ParseError::invalid_count(format!(
            "count is not a positive integer: '{value}'"
        ))),
    }
}

fn normalize_record(
    raw: RawRecord,
    date_range: &DateRange,
    org_name: &str,
    unrecognized: &mut BTreeSet<String>,
) -> Result<Record, ParseError> {
    let row = raw.row.ok_or_else(|| ParseError::missing("row"))?;

    let ip_text = text(&row.source_ip).ok_or_else(|| ParseError::missing("source_ip"))?;
    let source_ip: IpAddr = ip_text
        .parse()
        .map_err(|_| ParseError::malformed(format!("invalid source_ip '{ip_text}'")))?;
    let count = parse_count(text(&row.count))?;

    let identifiers = raw
        .identifiers
        .ok_or_else(|| ParseError::missing("identifiers"))?;
    let header_from_domain = text(&identifiers.header_from)
        .map(DomainUtils::identifier_domain)
        .filter(|domain| !domain.is_empty())
        .ok_or_else(|| ParseError::missing("header_from"))?;
    let envelope_from = text(&identifiers.envelope_from).map(DomainUtils::identifier_domain);

    let evaluated = row.policy_evaluated.unwrap_or_default();
    let policy_override_reasons = evaluated
        .reason
        .iter()
        .filter_map(|reason| {
            text(&reason.kind).map(|kind| PolicyOverride {
                kind: kind.to_ascii_lowercase(),
                comment: text(&reason.comment).map(str::to_string),
            })
        })
        .collect();

    let auth = raw.auth_results.unwrap_or_default();

    // DMARC aligns on the MAIL FROM identity; HELO only counts when no
    // envelope result was reported.
    let (spf_domain, spf_result) = auth
        .spf
        .iter()
        .map(|spf| {
            let result = match text(&spf.result) {
                Some(token) => SpfResult::from_token(token).unwrap_or_else(|| {
                    unrecognized.insert(format!("spf={}", token.to_ascii_lowercase()));
                    SpfResult::None
                }),
                None => SpfResult::None,
            };
            let envelope = !text(&spf.scope)
                .is_some_and(|scope| scope.eq_ignore_ascii_case("helo"));
            let domain = text(&spf.domain).map(DomainUtils::identifier_domain);
            (envelope, result, domain)
        })
        .max_by(|a, b| {
            a.0.cmp(&b.0)
                .then(a.1.strength().cmp(&b.1.strength()))
                .then(a.2.is_some().cmp(&b.2.is_some()))
                .then_with(|| b.2.cmp(&a.2))
        })
        .map(|(_, result, domain)| (domain, result))
        .unwrap_or((None, SpfResult::None));

    let dkim_signatures = auth
        .dkim
        .iter()
        .filter_map(|dkim| {
            let domain = text(&dkim.domain)?;
            let result = match text(&dkim.result) {
                Some(token) => DkimResult::from_token(token).unwrap_or_else(|| {
                    unrecognized.insert(format!("dkim={}", token.to_ascii_lowercase()));
                    DkimResult::None
                }),
                None => DkimResult::None,
            };
            Some(DkimSignature {
                domain: DomainUtils::normalize(domain),
                selector: text(&dkim.selector).map(str::to_string),
                result,
            })
        })
        .collect();

    Ok(Record {
        source_ip,
        count,
        header_from_domain,
        envelope_from,
        spf_domain,
        spf_result,
        dkim_signatures,
        disposition: text(&evaluated.disposition).and_then(PolicyAction::from_token),
        policy_override_reasons,
        evaluated_dkim: text(&evaluated.dkim).map(str::to_ascii_lowercase),
        evaluated_spf: text(&evaluated.spf).map(str::to_ascii_lowercase),
        report_date_range: *date_range,
        org_name: org_name.to_string(),
    })
}
