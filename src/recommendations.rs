//! Policy progression advice per protected domain.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::aggregate::{at_least, percentage, DomainAggregate, PeriodStats};
use crate::record::{PolicyAction, PolicyPublished};

/// Alignment needed before leaving `p=none`, and to keep working toward it.
const NONE_UPGRADE: u64 = 95;
const NONE_MONITOR: u64 = 85;
const QUARANTINE_EXCELLENT: u64 = 98;
const QUARANTINE_GOOD: u64 = 90;
const REJECT_EXCELLENT: u64 = 98;
const REJECT_GOOD: u64 = 95;
const AUTH_ISSUE: u64 = 90;
const AUTH_CRITICAL: u64 = 70;
const MAX_QUIET_SOURCES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdviceKind {
    Info,
    NoData,
    PolicyUpgrade,
    PercentageIncrease,
    Maintain,
    Monitor,
    Optimal,
    Caution,
    ImprovementNeeded,
    DkimIssue,
    SpfIssue,
    Critical,
    SubdomainPolicy,
    DiversityWarning,
}

impl AdviceKind {
    pub fn label(&self) -> &'static str {
        match self {
            AdviceKind::Info => "INFO",
            AdviceKind::NoData => "NO DATA",
            AdviceKind::PolicyUpgrade => "POLICY UPGRADE",
            AdviceKind::PercentageIncrease => "PERCENTAGE INCREASE",
            AdviceKind::Maintain => "MAINTAIN",
            AdviceKind::Monitor => "MONITOR",
            AdviceKind::Optimal => "OPTIMAL",
            AdviceKind::Caution => "CAUTION",
            AdviceKind::ImprovementNeeded => "IMPROVEMENT NEEDED",
            AdviceKind::DkimIssue => "DKIM ISSUE",
            AdviceKind::SpfIssue => "SPF ISSUE",
            AdviceKind::Critical => "CRITICAL",
            AdviceKind::SubdomainPolicy => "SUBDOMAIN POLICY",
            AdviceKind::DiversityWarning => "DIVERSITY WARNING",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Advice {
    pub kind: AdviceKind,
    pub message: String,
}

impl Advice {
    fn new(kind: AdviceKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Advice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.label(), self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainRecommendation {
    pub domain: String,
    pub messages: u64,
    pub dkim_rate: f64,
    pub spf_rate: f64,
    pub alignment_rate: f64,
    pub policy: PolicyAction,
    pub pct: u8,
    pub subdomain_policy: PolicyAction,
    pub num_sources: usize,
    pub dispositions: BTreeMap<String, u64>,
    pub advice: Vec<Advice>,
}

/// `part / whole >= threshold%` without float rounding.
fn period_description(stats: &PeriodStats) -> String {
    if let Some(days) = stats.period.days() {
        return format!("the last {days} days");
    }
    match (stats.first_report, stats.last_report) {
        (Some(begin), Some(end)) => format!(
            "all available data ({} to {})",
            begin.format("%Y-%m-%d"),
            end.format("%Y-%m-%d")
        ),
        _ => "all available data".to_string(),
    }
}

/// Advice for every protected domain seen in `stats`.
pub fn recommend(stats: &PeriodStats) -> Vec<DomainRecommendation> {
    let description = period_description(stats);
    stats
        .domain_stats
        .values()
        .map(|domain| recommend_domain(domain, &description))
        .collect()
}

fn recommend_domain(domain: &DomainAggregate, period_description: &str) -> DomainRecommendation {
    let policy = domain
        .policy
        .as_ref()
        .map(|observed| observed.policy.clone())
        .unwrap_or_else(|| PolicyPublished {
            domain: domain.domain.clone(),
            ..PolicyPublished::default()
        });
    let mut advice = Vec::new();
    let messages = domain.messages;

    if messages == 0 {
        advice.push(Advice::new(
            AdviceKind::NoData,
            format!(
                "No data available for direct messages from {} in {period_description}.",
                domain.domain
            ),
        ));
    } else {
        advice.push(Advice::new(
            AdviceKind::Info,
            format!("Recommendations based on {period_description}."),
        ));
        policy_progression(domain, &policy, &mut advice);
        authentication_issues(domain, &mut advice);

        if policy.subdomain_policy != PolicyAction::Reject && policy.policy != PolicyAction::None {
            advice.push(Advice::new(
                AdviceKind::SubdomainPolicy,
                "Consider setting 'sp=reject' to protect against subdomain spoofing.",
            ));
        }

        let sources = domain.sending_sources.len();
        if sources > MAX_QUIET_SOURCES && policy.policy != PolicyAction::None && policy.pct > 50 {
            advice.push(Advice::new(
                AdviceKind::DiversityWarning,
                format!(
                    "You have {sources} sending sources, which increases risk during policy enforcement."
                ),
            ));
        }
    }

    DomainRecommendation {
        domain: domain.domain.clone(),
        messages,
        dkim_rate: percentage(domain.dkim_pass, messages),
        spf_rate: percentage(domain.spf_pass, messages),
        alignment_rate: percentage(domain.aligned, messages),
        policy: policy.policy,
        pct: policy.pct,
        subdomain_policy: policy.subdomain_policy,
        num_sources: domain.sending_sources.len(),
        dispositions: domain.dispositions.clone(),
        advice,
    }
}

fn policy_progression(
    domain: &DomainAggregate,
    policy: &PolicyPublished,
    advice: &mut Vec<Advice>,
) {
    let (aligned, messages) = (domain.aligned, domain.messages);
    let rate = percentage(aligned, messages);
    let pct = u64::from(policy.pct);

    match policy.policy {
        PolicyAction::None => {
            if at_least(aligned, messages, NONE_UPGRADE) {
                advice.push(Advice::new(
                    AdviceKind::PolicyUpgrade,
                    format!(
                        "Consider moving to 'p=quarantine' with pct=5 as alignment rate is excellent ({rate:.1}%)."
                    ),
                ));
            } else if at_least(aligned, messages, NONE_MONITOR) {
                advice.push(Advice::new(
                    AdviceKind::Monitor,
                    format!(
                        "Continue with 'p=none' but work toward 'p=quarantine' as alignment rate is good ({rate:.1}%)."
                    ),
                ));
            } else {
                advice.push(Advice::new(
                    AdviceKind::Caution,
                    format!(
                        "Maintain 'p=none' while improving alignment rate (currently {rate:.1}%)."
                    ),
                ));
                advice.push(Advice::new(
                    AdviceKind::ImprovementNeeded,
                    "Address authentication issues before considering enforcement policies.",
                ));
            }
        }
        PolicyAction::Quarantine => {
            if at_least(aligned, messages, QUARANTINE_EXCELLENT) {
                if pct < 100 {
                    advice.push(Advice::new(
                        AdviceKind::PercentageIncrease,
                        format!(
                            "Increase pct value from {pct}% to {}% as alignment is excellent.",
                            (pct + 25).min(100)
                        ),
                    ));
                } else {
                    advice.push(Advice::new(
                        AdviceKind::PolicyUpgrade,
                        format!(
                            "Consider moving to 'p=reject' with pct=5 as alignment rate is excellent ({rate:.1}%)."
                        ),
                    ));
                }
            } else if at_least(aligned, messages, QUARANTINE_GOOD) {
                if pct < 100 {
                    advice.push(Advice::new(
                        AdviceKind::PercentageIncrease,
                        format!(
                            "Consider increasing pct value from {pct}% to {}%.",
                            (pct + 10).min(100)
                        ),
                    ));
                } else {
                    advice.push(Advice::new(
                        AdviceKind::Maintain,
                        "Keep 'p=quarantine' at 100% while monitoring for any issues.",
                    ));
                }
            } else {
                if pct > 25 {
                    advice.push(Advice::new(
                        AdviceKind::Caution,
                        "Consider decreasing pct value to reduce potential legitimate email loss.",
                    ));
                }
                advice.push(Advice::new(
                    AdviceKind::ImprovementNeeded,
                    "Work on authentication issues before increasing enforcement.",
                ));
            }
        }
        PolicyAction::Reject => {
            if pct < 100 {
                if at_least(aligned, messages, REJECT_EXCELLENT) {
                    advice.push(Advice::new(
                        AdviceKind::PercentageIncrease,
                        format!(
                            "Consider increasing pct value from {pct}% to {}%.",
                            (pct + 20).min(100)
                        ),
                    ));
                } else if at_least(aligned, messages, REJECT_GOOD) {
                    advice.push(Advice::new(
                        AdviceKind::PercentageIncrease,
                        format!(
                            "Consider a modest increase from {pct}% to {}%.",
                            (pct + 10).min(100)
                        ),
                    ));
                } else {
                    advice.push(Advice::new(
                        AdviceKind::Caution,
                        format!(
                            "Maintain current pct={pct}% until alignment improves ({rate:.1}%)."
                        ),
                    ));
                }
            } else {
                advice.push(Advice::new(
                    AdviceKind::Optimal,
                    "DMARC policy is at maximum enforcement (p=reject, pct=100).",
                ));
                if !at_least(aligned, messages, REJECT_EXCELLENT) {
                    advice.push(Advice::new(
                        AdviceKind::Monitor,
                        "Watch for legitimate email loss with current strict policy.",
                    ));
                }
            }
        }
    }
}

fn authentication_issues(domain: &DomainAggregate, advice: &mut Vec<Advice>) {
    let messages = domain.messages;
    for (name, passed, kind) in [
        ("DKIM", domain.dkim_pass, AdviceKind::DkimIssue),
        ("SPF", domain.spf_pass, AdviceKind::SpfIssue),
    ] {
        if at_least(passed, messages, AUTH_ISSUE) {
            continue;
        }
        let verb = if name == "DKIM" { "signing" } else { "alignment" };
        advice.push(Advice::new(
            kind,
            format!(
                "Improve {name} {verb} (currently {:.1}% pass rate).",
                percentage(passed, messages)
            ),
        ));
        if !at_least(passed, messages, AUTH_CRITICAL) {
            advice.push(Advice::new(
                AdviceKind::Critical,
                format!("{name} failures are significant and require immediate attention."),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::ObservedPolicy;
    use crate::period::TimePeriod;
    use crate::record::fixtures::range;
    use std::net::IpAddr;

    fn domain(
        messages: u64,
        aligned: u64,
        dkim: u64,
        spf: u64,
        policy: PolicyAction,
        pct: u8,
    ) -> DomainAggregate {
        let mut d = DomainAggregate::new("example.com");
        d.messages = messages;
        d.aligned = aligned;
        d.dkim_pass = dkim;
        d.spf_pass = spf;
        d.sending_sources.insert("192.0.2.1".parse().unwrap());
        d.policy = Some(ObservedPolicy {
            as_of: range(0, 1).end,
            policy: PolicyPublished {
                domain: "example.com".to_string(),
                policy,
                subdomain_policy: policy,
                pct,
                ..PolicyPublished::default()
            },
        });
        d
    }

    fn kinds(rec: &DomainRecommendation) -> Vec<AdviceKind> {
        rec.advice.iter().map(|a| a.kind).collect()
    }

    #[test]
    fn test_none_policy_with_excellent_alignment() {
        let rec = recommend_domain(
            &domain(100, 95, 100, 100, PolicyAction::None, 100),
            "the last 30 days",
        );
        assert_eq!(kinds(&rec), vec![AdviceKind::Info, AdviceKind::PolicyUpgrade]);
        assert!(rec.advice[1].message.contains("p=quarantine"));
        assert_eq!(rec.alignment_rate, 95.0);
    }

    #[test]
    fn test_none_policy_with_poor_alignment() {
        let rec = recommend_domain(&domain(100, 50, 60, 95, PolicyAction::None, 100), "x");
        assert_eq!(
            kinds(&rec),
            vec![
                AdviceKind::Info,
                AdviceKind::Caution,
                AdviceKind::ImprovementNeeded,
                AdviceKind::DkimIssue,
                AdviceKind::Critical,
            ]
        );
    }

    #[test]
    fn test_quarantine_percentage_steps() {
        let rec = recommend_domain(&domain(100, 99, 100, 100, PolicyAction::Quarantine, 50), "x");
        assert!(rec.advice[1].message.contains("from 50% to 75%"));

        let rec = recommend_domain(&domain(100, 92, 100, 100, PolicyAction::Quarantine, 95), "x");
        assert!(rec.advice[1].message.contains("from 95% to 100%"));

        let rec = recommend_domain(&domain(100, 92, 100, 100, PolicyAction::Quarantine, 100), "x");
        assert_eq!(rec.advice[1].kind, AdviceKind::Maintain);
    }

    #[test]
    fn test_subdomain_policy_advice() {
        let mut d = domain(100, 100, 100, 100, PolicyAction::Quarantine, 100);
        if let Some(observed) = d.policy.as_mut() {
            observed.policy.subdomain_policy = PolicyAction::None;
        }
        let rec = recommend_domain(&d, "x");
        assert!(kinds(&rec).contains(&AdviceKind::SubdomainPolicy));
    }

    #[test]
    fn test_reject_at_full_enforcement() {
        let rec = recommend_domain(&domain(100, 97, 100, 100, PolicyAction::Reject, 100), "x");
        assert_eq!(
            kinds(&rec),
            vec![AdviceKind::Info, AdviceKind::Optimal, AdviceKind::Monitor]
        );
    }

    #[test]
    fn test_diversity_warning() {
        let mut d = domain(1000, 1000, 1000, 1000, PolicyAction::Reject, 100);
        for i in 0..11u8 {
            d.sending_sources.insert(IpAddr::from([10, 0, 0, i]));
        }
        let rec = recommend_domain(&d, "x");
        assert!(kinds(&rec).contains(&AdviceKind::DiversityWarning));
    }

    #[test]
    fn test_domain_without_messages() {
        let mut stats = PeriodStats::new(TimePeriod::Last30);
        stats
            .domain_stats
            .insert("example.com".to_string(), DomainAggregate::new("example.com"));
        let recs = recommend(&stats);
        assert_eq!(recs.len(), 1);
        assert_eq!(kinds(&recs[0]), vec![AdviceKind::NoData]);
        assert!(recs[0].advice[0].message.contains("the last 30 days"));
        assert_eq!(recs[0].policy, PolicyAction::None);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        assert!(at_least(95, 100, 95));
        assert!(!at_least(94, 100, 95));
        assert!(at_least(0, 0, 95));
    }
}
