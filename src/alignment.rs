//! DMARC identifier alignment.
//!
//! A mechanism aligns when it passed and its authenticated domain matches the
//! From-header domain: exactly under strict mode, by organizational domain
//! under relaxed mode. The public suffix data behind organizational domains
//! is injected through [`SuffixTable`].

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain_utils::DomainUtils;
use crate::error::ConfigError;
use crate::record::{ReportMetadata, Record};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AlignmentMode {
    #[default]
    Relaxed,
    Strict,
}

impl AlignmentMode {
    /// Parse an `adkim=`/`aspf=` tag value.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "r" | "relaxed" => Some(AlignmentMode::Relaxed),
            "s" | "strict" => Some(AlignmentMode::Strict),
            _ => None,
        }
    }
}

/// How the classifier picks its mode per report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlignmentSetting {
    #[default]
    Relaxed,
    Strict,
    /// Follow each report's published `adkim`/`aspf` tags.
    Published,
}

impl FromStr for AlignmentSetting {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relaxed" | "r" => Ok(AlignmentSetting::Relaxed),
            "strict" | "s" => Ok(AlignmentSetting::Strict),
            "published" => Ok(AlignmentSetting::Published),
            _ => Err(ConfigError::InvalidAlignmentMode(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentVerdict {
    SpfAligned,
    DkimAligned,
    BothAligned,
    DmarcFail,
}

impl AlignmentVerdict {
    pub fn from_flags(spf_aligned: bool, dkim_aligned: bool) -> Self {
        match (spf_aligned, dkim_aligned) {
            (true, true) => AlignmentVerdict::BothAligned,
            (true, false) => AlignmentVerdict::SpfAligned,
            (false, true) => AlignmentVerdict::DkimAligned,
            (false, false) => AlignmentVerdict::DmarcFail,
        }
    }

    pub fn is_aligned(&self) -> bool {
        !matches!(self, AlignmentVerdict::DmarcFail)
    }
}

impl fmt::Display for AlignmentVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlignmentVerdict::SpfAligned => "spf_aligned",
            AlignmentVerdict::DkimAligned => "dkim_aligned",
            AlignmentVerdict::BothAligned => "both_aligned",
            AlignmentVerdict::DmarcFail => "dmarc_fail",
        };
        f.write_str(s)
    }
}

/// Public suffix data used to find registrable (organizational) domains.
pub trait SuffixTable: Send + Sync {
    /// Registrable domain for a normalized domain, or `None` when the domain
    /// is itself a public suffix.
    fn registrable_domain(&self, domain: &str) -> Option<String>;
}

/// The Public Suffix List compiled into the `psl` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct PublicSuffixList;

impl SuffixTable for PublicSuffixList {
    fn registrable_domain(&self, domain: &str) -> Option<String> {
        psl::domain_str(domain).map(str::to_string)
    }
}

/// Suffix table built from PSL-formatted rules (`com`, `*.ck`, `!www.ck`).
#[derive(Debug, Default, Clone)]
pub struct StaticSuffixTable {
    rules: HashSet<String>,
    wildcards: HashSet<String>,
    exceptions: HashSet<String>,
}

impl StaticSuffixTable {
    pub fn new<I, S>(rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut table = Self::default();
        for rule in rules {
            table.add_rule(rule.as_ref());
        }
        table
    }

    /// Parse the public_suffix_list.dat format: one rule per line, `//` comments.
    pub fn from_psl_text(text: &str) -> Self {
        Self::new(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with("//"))
                .filter_map(|line| line.split_whitespace().next()),
        )
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::SuffixList {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let table = Self::from_psl_text(&text);
        if table.is_empty() {
            return Err(ConfigError::SuffixList {
                path: path.to_path_buf(),
                message: "no rules found".to_string(),
            });
        }
        Ok(table)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.wildcards.is_empty() && self.exceptions.is_empty()
    }

    fn add_rule(&mut self, rule: &str) {
        let rule = DomainUtils::normalize(rule);
        if let Some(exception) = rule.strip_prefix('!') {
            self.exceptions.insert(exception.to_string());
        } else if let Some(parent) = rule.strip_prefix("*.") {
            self.wildcards.insert(parent.to_string());
        } else if !rule.is_empty() {
            self.rules.insert(rule);
        }
    }

    /// Number of trailing labels forming the public suffix.
    fn suffix_len(&self, labels: &[&str]) -> usize {
        let n = labels.len();
        for i in 0..n {
            let candidate = labels[i..].join(".");
            if self.exceptions.contains(&candidate) {
                return n - i - 1;
            }
            if self.rules.contains(&candidate) {
                return n - i;
            }
            if i + 1 < n && self.wildcards.contains(&labels[i + 1..].join(".")) {
                return n - i;
            }
        }
        1
    }
}

impl SuffixTable for StaticSuffixTable {
    fn registrable_domain(&self, domain: &str) -> Option<String> {
        let labels: Vec<&str> = domain.split('.').filter(|l| !l.is_empty()).collect();
        let suffix_len = self.suffix_len(&labels);
        if labels.len() <= suffix_len {
            return None;
        }
        Some(labels[labels.len() - suffix_len - 1..].join("."))
    }
}

/// Pure alignment classifier: modes and suffix data are fixed at construction.
#[derive(Clone)]
pub struct AlignmentClassifier {
    setting: AlignmentSetting,
    spf_mode: AlignmentMode,
    dkim_mode: AlignmentMode,
    suffixes: Arc<dyn SuffixTable>,
}

impl fmt::Debug for AlignmentClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignmentClassifier")
            .field("setting", &self.setting)
            .field("spf_mode", &self.spf_mode)
            .field("dkim_mode", &self.dkim_mode)
            .finish_non_exhaustive()
    }
}

impl AlignmentClassifier {
    pub fn new(setting: AlignmentSetting, suffixes: Arc<dyn SuffixTable>) -> Self {
        let mode = match setting {
            AlignmentSetting::Strict => AlignmentMode::Strict,
            AlignmentSetting::Relaxed | AlignmentSetting::Published => AlignmentMode::Relaxed,
        };
        Self {
            setting,
            spf_mode: mode,
            dkim_mode: mode,
            suffixes,
        }
    }

    pub fn relaxed(suffixes: Arc<dyn SuffixTable>) -> Self {
        Self::new(AlignmentSetting::Relaxed, suffixes)
    }

    pub fn strict(suffixes: Arc<dyn SuffixTable>) -> Self {
        Self::new(AlignmentSetting::Strict, suffixes)
    }

    pub fn setting(&self) -> AlignmentSetting {
        self.setting
    }

    pub fn modes(&self) -> (AlignmentMode, AlignmentMode) {
        (self.spf_mode, self.dkim_mode)
    }

    /// Classifier to use for one report. Only differs from `self` in
    /// published mode, where the report's `aspf`/`adkim` tags decide.
    pub fn for_report(&self, metadata: &ReportMetadata) -> Self {
        match self.setting {
            AlignmentSetting::Published => Self {
                setting: self.setting,
                spf_mode: metadata.policy.aspf.unwrap_or_default(),
                dkim_mode: metadata.policy.adkim.unwrap_or_default(),
                suffixes: Arc::clone(&self.suffixes),
            },
            _ => self.clone(),
        }
    }

    pub fn organizational_domain(&self, domain: &str) -> String {
        let normalized = DomainUtils::normalize(domain);
        self.suffixes
            .registrable_domain(&normalized)
            .unwrap_or(normalized)
    }

    pub fn domains_align(&self, mode: AlignmentMode, authenticated: &str, from: &str) -> bool {
        let authenticated = DomainUtils::normalize(authenticated);
        let from = DomainUtils::normalize(from);
        if authenticated.is_empty() || from.is_empty() {
            return false;
        }
        match mode {
            AlignmentMode::Strict => authenticated == from,
            AlignmentMode::Relaxed => {
                authenticated == from
                    || self.organizational_domain(&authenticated)
                        == self.organizational_domain(&from)
            }
        }
    }

    pub fn spf_aligned(&self, record: &Record) -> bool {
        record.spf_result.is_pass()
            && record.spf_domain.as_deref().is_some_and(|domain| {
                self.domains_align(self.spf_mode, domain, &record.header_from_domain)
            })
    }

    /// Any signature that both passes and aligns is enough.
    pub fn dkim_aligned(&self, record: &Record) -> bool {
        record.dkim_signatures.iter().any(|sig| {
            sig.result.is_pass()
                && self.domains_align(self.dkim_mode, &sig.domain, &record.header_from_domain)
        })
    }

    pub fn classify(&self, record: &Record) -> AlignmentVerdict {
        AlignmentVerdict::from_flags(self.spf_aligned(record), self.dkim_aligned(record))
    }
}
