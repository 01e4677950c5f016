//! Sending-organization grouping from resolved hostnames.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use serde::Serialize;

use crate::aggregate::{percentage, SourceAggregate};

pub const UNKNOWN_PROVIDER: &str = "Unknown";

/// Hostname fragments checked in order; first hit wins.
const PROVIDER_PATTERNS: &[(&str, &str)] = &[
    ("google", "Google"),
    ("gmail", "Google"),
    ("googlemail", "Google"),
    ("amazon", "Amazon"),
    ("aws", "Amazon AWS"),
    ("microsoft", "Microsoft"),
    ("outlook", "Microsoft"),
    ("office365", "Microsoft Office 365"),
    ("sendgrid", "SendGrid"),
    ("mailchimp", "Mailchimp"),
    ("sparkpost", "SparkPost"),
    ("postmark", "Postmark"),
    ("mailgun", "Mailgun"),
    ("yandex", "Yandex"),
    ("yahoo", "Yahoo"),
    ("aol", "AOL"),
    ("protonmail", "ProtonMail"),
    ("zoho", "Zoho"),
    ("fastmail", "Fastmail"),
    ("comcast", "Comcast"),
    ("verizon", "Verizon"),
    ("att", "AT&T"),
    ("cloudflare", "Cloudflare"),
    ("nationbuilder", "NationBuilder"),
    ("nb-mail", "NationBuilder"),
    ("nationsend", "NationBuilder"),
];

/// Organization name for a hostname; `Unknown` without one.
pub fn provider_for_hostname(hostname: Option<&str>) -> String {
    let Some(hostname) = hostname.map(str::trim).filter(|h| !h.is_empty()) else {
        return UNKNOWN_PROVIDER.to_string();
    };
    let lower = hostname.to_ascii_lowercase();
    if let Some((_, name)) = PROVIDER_PATTERNS
        .iter()
        .find(|(pattern, _)| lower.contains(pattern))
    {
        return name.to_string();
    }

    let labels: Vec<&str> = lower.trim_end_matches('.').split('.').collect();
    if labels.len() < 2 {
        return UNKNOWN_PROVIDER.to_string();
    }
    capitalize(labels[labels.len() - 2])
}

fn capitalize(label: &str) -> String {
    let mut chars = label.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => UNKNOWN_PROVIDER.to_string(),
    }
}

/// Sources of one period merged under a provider name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderGroup {
    pub name: String,
    pub ips: BTreeSet<IpAddr>,
    pub total_messages: u64,
    pub spf_pass: u64,
    pub dkim_pass: u64,
    pub aligned: u64,
    pub failed: u64,
    pub header_from_domains: BTreeSet<String>,
    pub dispositions: BTreeMap<String, u64>,
}

impl ProviderGroup {
    fn new(name: String) -> Self {
        Self {
            name,
            ips: BTreeSet::new(),
            total_messages: 0,
            spf_pass: 0,
            dkim_pass: 0,
            aligned: 0,
            failed: 0,
            header_from_domains: BTreeSet::new(),
            dispositions: BTreeMap::new(),
        }
    }

    fn add(&mut self, source: &SourceAggregate) {
        self.ips.insert(source.source_ip);
        self.total_messages += source.total_messages;
        self.spf_pass += source.spf_pass_count;
        self.dkim_pass += source.dkim_pass_count;
        self.aligned += source.aligned_count;
        self.failed += source.failed_count;
        self.header_from_domains
            .extend(source.header_from_domains.iter().cloned());
        for (disposition, count) in &source.dispositions {
            *self.dispositions.entry(disposition.clone()).or_insert(0) += count;
        }
    }

    pub fn alignment_rate(&self) -> f64 {
        percentage(self.aligned, self.total_messages)
    }
}

/// Group sources by provider, largest senders first.
pub fn group_by_provider<'a, I>(sources: I) -> Vec<ProviderGroup>
where
    I: IntoIterator<Item = &'a SourceAggregate>,
{
    let mut groups: BTreeMap<String, ProviderGroup> = BTreeMap::new();
    for source in sources {
        let name = provider_for_hostname(source.resolved_hostname.as_deref());
        groups
            .entry(name.clone())
            .or_insert_with(|| ProviderGroup::new(name))
            .add(source);
    }
    let mut groups: Vec<ProviderGroup> = groups.into_values().collect();
    groups.sort_by(|a, b| {
        b.total_messages
            .cmp(&a.total_messages)
            .then_with(|| a.name.cmp(&b.name))
    });
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregateKey;
    use crate::period::TimePeriod;

    fn source(ip: &str, hostname: Option<&str>, total: u64, aligned: u64) -> SourceAggregate {
        let mut s = SourceAggregate::new(AggregateKey::new(ip.parse().unwrap(), TimePeriod::All));
        s.resolved_hostname = hostname.map(str::to_string);
        s.total_messages = total;
        s.aligned_count = aligned;
        s.failed_count = total - aligned;
        s
    }

    #[test]
    fn test_known_providers() {
        assert_eq!(provider_for_hostname(Some("mail-sor-f41.google.com")), "Google");
        assert_eq!(provider_for_hostname(Some("o1.ptr1234.SendGrid.net")), "SendGrid");
        assert_eq!(
            provider_for_hostname(Some("mail-db8eur05on2101.outbound.protection.outlook.com")),
            "Microsoft"
        );
        assert_eq!(provider_for_hostname(Some("a1-2.smtp-out.amazonses.com")), "Amazon");
        assert_eq!(provider_for_hostname(Some("nb-mail-3.example.org")), "NationBuilder");
    }

    #[test]
    fn test_fallback_to_second_level_label() {
        assert_eq!(provider_for_hostname(Some("mx1.hostinger.io")), "Hostinger");
        assert_eq!(provider_for_hostname(Some("localhost")), UNKNOWN_PROVIDER);
        assert_eq!(provider_for_hostname(None), UNKNOWN_PROVIDER);
        assert_eq!(provider_for_hostname(Some("  ")), UNKNOWN_PROVIDER);
    }

    #[test]
    fn test_group_by_provider() {
        let sources = [
            source("192.0.2.1", Some("mail-a.google.com"), 10, 10),
            source("192.0.2.2", Some("mail-b.google.com"), 5, 4),
            source("198.51.100.7", None, 30, 0),
            source("203.0.113.9", Some("o1.sendgrid.net"), 5, 5),
        ];
        let groups = group_by_provider(&sources);

        let names: Vec<&str> = groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["Unknown", "Google", "SendGrid"]);
        let google = &groups[1];
        assert_eq!(google.ips.len(), 2);
        assert_eq!(google.total_messages, 15);
        assert_eq!(google.failed, 1);
        assert!((google.alignment_rate() - 93.333).abs() < 0.01);
    }
}
