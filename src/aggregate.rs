//! Folding classified records into per-source and per-period statistics.
//!
//! Every update is a sum, a set union, a min or a max, so folding reports in
//! any order, or merging partial results in any grouping, gives the same
//! totals.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::alignment::{AlignmentClassifier, AlignmentVerdict};
use crate::domain_utils::DomainUtils;
use crate::period::TimePeriod;
use crate::record::{PolicyPublished, Record, ReportMetadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregateKey {
    pub source_ip: IpAddr,
    pub period: TimePeriod,
}

impl AggregateKey {
    pub fn new(source_ip: IpAddr, period: TimePeriod) -> Self {
        Self { source_ip, period }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceAggregate {
    pub source_ip: IpAddr,
    pub resolved_hostname: Option<String>,
    #[serde(rename = "period_label")]
    pub period: TimePeriod,
    pub total_messages: u64,
    pub spf_pass_count: u64,
    pub dkim_pass_count: u64,
    pub aligned_count: u64,
    pub failed_count: u64,
    pub contributing_orgs: BTreeSet<String>,
    pub header_from_domains: BTreeSet<String>,
    pub dispositions: BTreeMap<String, u64>,
}

impl SourceAggregate {
    pub fn new(key: AggregateKey) -> Self {
        Self {
            source_ip: key.source_ip,
            resolved_hostname: None,
            period: key.period,
            total_messages: 0,
            spf_pass_count: 0,
            dkim_pass_count: 0,
            aligned_count: 0,
            failed_count: 0,
            contributing_orgs: BTreeSet::new(),
            header_from_domains: BTreeSet::new(),
            dispositions: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> AggregateKey {
        AggregateKey::new(self.source_ip, self.period)
    }

    pub fn period_label(&self) -> &'static str {
        self.period.label()
    }

    pub fn add_record(&mut self, record: &Record, verdict: AlignmentVerdict) {
        let count = record.count;
        self.total_messages += count;
        if record.spf_result.is_pass() {
            self.spf_pass_count += count;
        }
        if record.dkim_result().is_pass() {
            self.dkim_pass_count += count;
        }
        if verdict.is_aligned() {
            self.aligned_count += count;
        } else {
            self.failed_count += count;
        }
        self.contributing_orgs.insert(record.org_name.clone());
        self.header_from_domains
            .insert(record.header_from_domain.clone());
        *self
            .dispositions
            .entry(record.disposition_label().to_string())
            .or_insert(0) += count;
    }

    pub fn absorb(&mut self, other: &SourceAggregate) {
        self.total_messages += other.total_messages;
        self.spf_pass_count += other.spf_pass_count;
        self.dkim_pass_count += other.dkim_pass_count;
        self.aligned_count += other.aligned_count;
        self.failed_count += other.failed_count;
        self.contributing_orgs
            .extend(other.contributing_orgs.iter().cloned());
        self.header_from_domains
            .extend(other.header_from_domains.iter().cloned());
        for (disposition, count) in &other.dispositions {
            *self.dispositions.entry(disposition.clone()).or_insert(0) += count;
        }
        self.resolved_hostname = match (self.resolved_hostname.take(), &other.resolved_hostname) {
            (Some(a), Some(b)) => Some(a.min(b.clone())),
            (a, b) => a.or_else(|| b.clone()),
        };
    }

    pub fn alignment_rate(&self) -> f64 {
        percentage(self.aligned_count, self.total_messages)
    }
}

pub type AggregateMap = BTreeMap<AggregateKey, SourceAggregate>;

/// Merge two partial maps; commutative, associative, empty map is the identity.
pub fn merge(mut left: AggregateMap, right: AggregateMap) -> AggregateMap {
    for (key, aggregate) in right {
        match left.get_mut(&key) {
            Some(existing) => existing.absorb(&aggregate),
            None => {
                left.insert(key, aggregate);
            }
        }
    }
    left
}

/// Policy seen in the most recent report for a domain.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObservedPolicy {
    pub as_of: DateTime<Utc>,
    pub policy: PolicyPublished,
}

/// Messages whose From domain falls under one published policy domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainAggregate {
    pub domain: String,
    pub messages: u64,
    pub spf_pass: u64,
    pub dkim_pass: u64,
    pub aligned: u64,
    pub sending_sources: BTreeSet<IpAddr>,
    pub dispositions: BTreeMap<String, u64>,
    pub policy: Option<ObservedPolicy>,
}

impl DomainAggregate {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            messages: 0,
            spf_pass: 0,
            dkim_pass: 0,
            aligned: 0,
            sending_sources: BTreeSet::new(),
            dispositions: BTreeMap::new(),
            policy: None,
        }
    }

    fn observe_policy(&mut self, observed: ObservedPolicy) {
        if self.policy.as_ref().map_or(true, |current| observed > *current) {
            self.policy = Some(observed);
        }
    }

    fn absorb(&mut self, other: &DomainAggregate) {
        self.messages += other.messages;
        self.spf_pass += other.spf_pass;
        self.dkim_pass += other.dkim_pass;
        self.aligned += other.aligned;
        self.sending_sources.extend(other.sending_sources.iter().copied());
        for (disposition, count) in &other.dispositions {
            *self.dispositions.entry(disposition.clone()).or_insert(0) += count;
        }
        if let Some(policy) = &other.policy {
            self.observe_policy(policy.clone());
        }
    }
}

/// Report-level totals for one requested window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodStats {
    pub period: TimePeriod,
    pub report_count: usize,
    pub total_messages: u64,
    pub spf_pass: u64,
    pub dkim_pass: u64,
    pub aligned: u64,
    pub failed: u64,
    pub domains: BTreeSet<String>,
    pub reporting_orgs: BTreeSet<String>,
    pub dispositions: BTreeMap<String, u64>,
    pub failures_by_domain: BTreeMap<String, u64>,
    pub domain_stats: BTreeMap<String, DomainAggregate>,
    pub first_report: Option<DateTime<Utc>>,
    pub last_report: Option<DateTime<Utc>>,
}

impl PeriodStats {
    pub fn new(period: TimePeriod) -> Self {
        Self {
            period,
            report_count: 0,
            total_messages: 0,
            spf_pass: 0,
            dkim_pass: 0,
            aligned: 0,
            failed: 0,
            domains: BTreeSet::new(),
            reporting_orgs: BTreeSet::new(),
            dispositions: BTreeMap::new(),
            failures_by_domain: BTreeMap::new(),
            domain_stats: BTreeMap::new(),
            first_report: None,
            last_report: None,
        }
    }

    pub fn has_messages(&self) -> bool {
        self.total_messages > 0
    }

    pub fn merge(mut self, other: PeriodStats) -> Self {
        self.report_count += other.report_count;
        self.total_messages += other.total_messages;
        self.spf_pass += other.spf_pass;
        self.dkim_pass += other.dkim_pass;
        self.aligned += other.aligned;
        self.failed += other.failed;
        self.domains.extend(other.domains);
        self.reporting_orgs.extend(other.reporting_orgs);
        for (disposition, count) in other.dispositions {
            *self.dispositions.entry(disposition).or_insert(0) += count;
        }
        for (domain, count) in other.failures_by_domain {
            *self.failures_by_domain.entry(domain).or_insert(0) += count;
        }
        for (domain, stats) in other.domain_stats {
            match self.domain_stats.get_mut(&domain) {
                Some(existing) => existing.absorb(&stats),
                None => {
                    self.domain_stats.insert(domain, stats);
                }
            }
        }
        self.first_report = min_option(self.first_report, other.first_report);
        self.last_report = self.last_report.max(other.last_report);
        self
    }
}

fn min_option<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// `part` is at least `threshold` percent of `whole`, in integer arithmetic.
pub fn at_least(part: u64, whole: u64, threshold: u64) -> bool {
    part.saturating_mul(100) >= whole.saturating_mul(threshold)
}

pub fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// Classifies records and folds them into aggregates.
#[derive(Debug, Clone)]
pub struct Aggregator {
    classifier: AlignmentClassifier,
}

impl Aggregator {
    pub fn new(classifier: AlignmentClassifier) -> Self {
        Self { classifier }
    }

    pub fn classifier(&self) -> &AlignmentClassifier {
        &self.classifier
    }

    /// Fold one report's records into the per-source map for `period`.
    pub fn fold(
        &self,
        map: AggregateMap,
        period: TimePeriod,
        metadata: &ReportMetadata,
        records: &[Record],
    ) -> AggregateMap {
        let classifier = self.classifier.for_report(metadata);
        records.iter().fold(map, |mut map, record| {
            let verdict = classifier.classify(record);
            let key = AggregateKey::new(record.source_ip, period);
            map.entry(key)
                .or_insert_with(|| SourceAggregate::new(key))
                .add_record(record, verdict);
            map
        })
    }

    /// Fold one report into the period totals.
    pub fn fold_stats(
        &self,
        mut stats: PeriodStats,
        metadata: &ReportMetadata,
        records: &[Record],
    ) -> PeriodStats {
        let classifier = self.classifier.for_report(metadata);
        let policy_domain = metadata.policy.domain.clone();

        stats.report_count += 1;
        stats.domains.insert(policy_domain.clone());
        stats.reporting_orgs.insert(metadata.org_name.clone());
        stats.first_report = min_option(stats.first_report, Some(metadata.date_range.begin));
        stats.last_report = stats.last_report.max(Some(metadata.date_range.end));

        let domain_stats = stats
            .domain_stats
            .entry(policy_domain.clone())
            .or_insert_with(|| DomainAggregate::new(policy_domain.clone()));
        domain_stats.observe_policy(ObservedPolicy {
            as_of: metadata.date_range.end,
            policy: metadata.policy.clone(),
        });

        for record in records {
            let verdict = classifier.classify(record);
            let count = record.count;
            let spf_pass = record.spf_result.is_pass();
            let dkim_pass = record.dkim_result().is_pass();

            stats.total_messages += count;
            if spf_pass {
                stats.spf_pass += count;
            }
            if dkim_pass {
                stats.dkim_pass += count;
            }
            if verdict.is_aligned() {
                stats.aligned += count;
            } else {
                stats.failed += count;
                *stats
                    .failures_by_domain
                    .entry(record.header_from_domain.clone())
                    .or_insert(0) += count;
            }
            *stats
                .dispositions
                .entry(record.disposition_label().to_string())
                .or_insert(0) += count;

            if DomainUtils::is_same_or_subdomain(&record.header_from_domain, &policy_domain) {
                let domain_stats = stats
                    .domain_stats
                    .entry(policy_domain.clone())
                    .or_insert_with(|| DomainAggregate::new(policy_domain.clone()));
                domain_stats.messages += count;
                if spf_pass {
                    domain_stats.spf_pass += count;
                }
                if dkim_pass {
                    domain_stats.dkim_pass += count;
                }
                if verdict.is_aligned() {
                    domain_stats.aligned += count;
                }
                domain_stats.sending_sources.insert(record.source_ip);
                *domain_stats
                    .dispositions
                    .entry(record.disposition_label().to_string())
                    .or_insert(0) += count;
            }
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::{StaticSuffixTable, SuffixTable};
    use crate::record::fixtures::*;
    use crate::record::{DkimResult, SpfResult};
    use std::sync::Arc;

    fn aggregator() -> Aggregator {
        let table: Arc<dyn SuffixTable> = Arc::new(StaticSuffixTable::new(["com", "net", "org"]));
        Aggregator::new(AlignmentClassifier::relaxed(table))
    }

    fn metadata(org: &str, begin: i64, end: i64) -> ReportMetadata {
        ReportMetadata {
            org_name: org.to_string(),
            email: None,
            report_id: None,
            date_range: range(begin, end),
            policy: PolicyPublished {
                domain: "example.com".to_string(),
                ..PolicyPublished::default()
            },
            unrecognized_results: Vec::new(),
        }
    }

    fn mixed_records(org: &str) -> Vec<Record> {
        let mut a = with_spf(
            record("198.51.100.7", 4, "example.com"),
            "example.com",
            SpfResult::Pass,
        );
        a.org_name = org.to_string();
        let mut b = with_dkim(
            record("198.51.100.7", 2, "example.com"),
            "evil.net",
            DkimResult::Pass,
        );
        b.org_name = org.to_string();
        let mut c = with_spf(
            record("203.0.113.9", 6, "news.example.com"),
            "esp.net",
            SpfResult::Fail,
        );
        c.org_name = org.to_string();
        vec![a, b, c]
    }

    #[test]
    fn test_two_reports_same_source() {
        let agg = aggregator();
        let report_a = vec![with_spf(
            record("198.51.100.7", 10, "example.com"),
            "example.com",
            SpfResult::Pass,
        )];
        let report_b = vec![with_dkim(
            with_spf(record("198.51.100.7", 5, "example.com"), "example.com", SpfResult::Fail),
            "example.com",
            DkimResult::Pass,
        )];

        let map = agg.fold(
            AggregateMap::new(),
            TimePeriod::Last30,
            &metadata("google.com", 0, 1),
            &report_a,
        );
        let map = agg.fold(map, TimePeriod::Last30, &metadata("yahoo.com", 0, 1), &report_b);

        let key = AggregateKey::new("198.51.100.7".parse().unwrap(), TimePeriod::Last30);
        let source = &map[&key];
        assert_eq!(source.total_messages, 15);
        assert_eq!(source.aligned_count, 15);
        assert_eq!(source.failed_count, 0);
        assert_eq!(source.spf_pass_count, 10);
        assert_eq!(source.dkim_pass_count, 5);
        assert_eq!(source.period_label(), "30");
    }

    #[test]
    fn test_largest_counts_sum_without_overflow() {
        use crate::parser::MAX_RECORD_COUNT;

        let agg = aggregator();
        let big = vec![with_spf(
            record("198.51.100.7", MAX_RECORD_COUNT, "example.com"),
            "example.com",
            SpfResult::Pass,
        )];
        let small = vec![with_spf(
            record("198.51.100.7", 1, "example.com"),
            "example.com",
            SpfResult::Pass,
        )];
        let meta = metadata("google.com", 0, 1);

        let map = agg.fold(AggregateMap::new(), TimePeriod::All, &meta, &big);
        let map = agg.fold(map, TimePeriod::All, &meta, &big);
        let map = agg.fold(map, TimePeriod::All, &meta, &small);
        let key = AggregateKey::new("198.51.100.7".parse().unwrap(), TimePeriod::All);
        assert_eq!(map[&key].total_messages, 2 * MAX_RECORD_COUNT + 1);

        let stats = agg.fold_stats(PeriodStats::new(TimePeriod::All), &meta, &big);
        let stats = agg.fold_stats(stats, &meta, &big);
        assert_eq!(stats.total_messages, 2 * MAX_RECORD_COUNT);
        assert!(at_least(stats.aligned, stats.total_messages, 100));
        assert!(at_least(u64::MAX, u64::MAX, 100));
    }

    #[test]
    fn test_counts_pass_independent_of_alignment() {
        let agg = aggregator();
        let records = mixed_records("google.com");
        let map = agg.fold(
            AggregateMap::new(),
            TimePeriod::All,
            &metadata("google.com", 0, 1),
            &records,
        );

        let source = &map[&AggregateKey::new("198.51.100.7".parse().unwrap(), TimePeriod::All)];
        assert_eq!(source.total_messages, 6);
        assert_eq!(source.spf_pass_count, 4);
        // DKIM passed for evil.net but does not align with example.com.
        assert_eq!(source.dkim_pass_count, 2);
        assert_eq!(source.aligned_count, 4);
        assert_eq!(source.failed_count, 2);
        assert_eq!(source.contributing_orgs.len(), 1);
        assert!(source.contributing_orgs.contains("google.com"));
    }

    #[test]
    fn test_fold_is_order_independent() {
        let agg = aggregator();
        let meta = metadata("google.com", 0, 1);
        let records = mixed_records("google.com");
        let mut reversed = records.clone();
        reversed.reverse();

        let forward = agg.fold(AggregateMap::new(), TimePeriod::Last90, &meta, &records);
        let backward = agg.fold(AggregateMap::new(), TimePeriod::Last90, &meta, &reversed);
        assert_eq!(forward, backward);

        let stats_forward = agg.fold_stats(PeriodStats::new(TimePeriod::Last90), &meta, &records);
        let stats_backward = agg.fold_stats(PeriodStats::new(TimePeriod::Last90), &meta, &reversed);
        assert_eq!(stats_forward, stats_backward);
    }

    #[test]
    fn test_merge_is_commutative_and_associative() {
        let agg = aggregator();
        let a = agg.fold(
            AggregateMap::new(),
            TimePeriod::All,
            &metadata("google.com", 0, 1),
            &mixed_records("google.com"),
        );
        let b = agg.fold(
            AggregateMap::new(),
            TimePeriod::All,
            &metadata("yahoo.com", 0, 1),
            &mixed_records("yahoo.com"),
        );
        let mut c = agg.fold(
            AggregateMap::new(),
            TimePeriod::Last30,
            &metadata("mail.ru", 0, 1),
            &mixed_records("mail.ru"),
        );
        c.values_mut().for_each(|s| s.resolved_hostname = Some("mx.example.net".to_string()));

        assert_eq!(merge(a.clone(), b.clone()), merge(b.clone(), a.clone()));
        assert_eq!(
            merge(merge(a.clone(), b.clone()), c.clone()),
            merge(a.clone(), merge(b.clone(), c.clone()))
        );

        // Folding sequentially equals merging independent partial folds.
        let sequential = agg.fold(
            a.clone(),
            TimePeriod::All,
            &metadata("yahoo.com", 0, 1),
            &mixed_records("yahoo.com"),
        );
        assert_eq!(sequential, merge(a, b));
    }

    #[test]
    fn test_merge_with_empty_is_identity() {
        let agg = aggregator();
        let map = agg.fold(
            AggregateMap::new(),
            TimePeriod::All,
            &metadata("google.com", 0, 1),
            &mixed_records("google.com"),
        );
        assert_eq!(merge(map.clone(), AggregateMap::new()), map);
        assert_eq!(merge(AggregateMap::new(), map.clone()), map);
        assert_eq!(agg.fold(map.clone(), TimePeriod::All, &metadata("x", 0, 1), &[]), map);
    }

    #[test]
    fn test_period_stats() {
        let agg = aggregator();
        let stats = agg.fold_stats(
            PeriodStats::new(TimePeriod::All),
            &metadata("google.com", 100, 200),
            &mixed_records("google.com"),
        );
        let stats = agg.fold_stats(stats, &metadata("yahoo.com", 50, 150), &[]);

        assert_eq!(stats.report_count, 2);
        assert_eq!(stats.total_messages, 12);
        assert_eq!(stats.aligned, 4);
        assert_eq!(stats.failed, 8);
        assert_eq!(stats.failures_by_domain["example.com"], 2);
        assert_eq!(stats.failures_by_domain["news.example.com"], 6);
        assert_eq!(stats.dispositions["none"], 12);
        assert_eq!(stats.first_report.unwrap().timestamp(), 50);
        assert_eq!(stats.last_report.unwrap().timestamp(), 200);

        let domain = &stats.domain_stats["example.com"];
        // Subdomain mail counts toward the policy domain.
        assert_eq!(domain.messages, 12);
        assert_eq!(domain.sending_sources.len(), 2);
        assert_eq!(domain.policy.as_ref().unwrap().as_of.timestamp(), 200);
    }

    #[test]
    fn test_period_stats_merge_matches_sequential_fold() {
        let agg = aggregator();
        let meta_a = metadata("google.com", 100, 200);
        let meta_b = metadata("yahoo.com", 300, 400);
        let sequential = agg.fold_stats(
            agg.fold_stats(
                PeriodStats::new(TimePeriod::All),
                &meta_a,
                &mixed_records("google.com"),
            ),
            &meta_b,
            &mixed_records("yahoo.com"),
        );
        let left = agg.fold_stats(
            PeriodStats::new(TimePeriod::All),
            &meta_b,
            &mixed_records("yahoo.com"),
        );
        let right = agg.fold_stats(
            PeriodStats::new(TimePeriod::All),
            &meta_a,
            &mixed_records("google.com"),
        );
        assert_eq!(left.merge(right), sequential);
    }

    #[test]
    fn test_percentage() {
        assert_eq!(percentage(0, 0), 0.0);
        assert_eq!(percentage(1, 4), 25.0);
    }
}
