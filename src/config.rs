use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::alignment::{AlignmentSetting, PublicSuffixList, StaticSuffixTable, SuffixTable};
use crate::error::ConfigError;
use crate::period::{PeriodAnchor, TimePeriod};
use crate::resolver::ResolverSettings;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub alignment: AlignmentSetting,
    pub time_periods: Vec<TimePeriod>,
    pub anchor: PeriodAnchor,
    /// PSL-format file; the bundled list is used when unset.
    pub suffix_list: Option<PathBuf>,
    pub output: OutputConfig,
    pub resolve: ResolveConfig,
    pub max_parallel_parses: usize,
    /// Per-file limit on reading and parsing.
    pub load_timeout_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub html_output: PathBuf,
    pub top_sources: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolveConfig {
    pub enabled: bool,
    pub timeout_seconds: u64,
    pub concurrency: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        AnalyzerConfig {
            alignment: AlignmentSetting::Relaxed,
            time_periods: TimePeriod::ALL_PERIODS.to_vec(),
            anchor: PeriodAnchor::Clock,
            suffix_list: None,
            output: OutputConfig::default(),
            resolve: ResolveConfig::default(),
            max_parallel_parses: 8,
            load_timeout_seconds: 30,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            html_output: PathBuf::from("dmarc_report.html"),
            top_sources: 10,
        }
    }
}

impl Default for ResolveConfig {
    fn default() -> Self {
        ResolveConfig {
            enabled: false,
            timeout_seconds: 5,
            concurrency: 16,
        }
    }
}

impl AnalyzerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: AnalyzerConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn to_file(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Load `path`, or fall back to defaults when it does not exist.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            log::warn!(
                "Configuration file '{}' not found, using default configuration",
                path.display()
            );
            Ok(AnalyzerConfig::default())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.time_periods.is_empty() {
            return Err(ConfigError::NoPeriods);
        }
        if self.max_parallel_parses == 0 {
            return Err(ConfigError::Invalid(
                "max_parallel_parses must be at least 1".to_string(),
            ));
        }
        if self.load_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "load_timeout_seconds must be at least 1".to_string(),
            ));
        }
        if self.resolve.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "resolve.concurrency must be at least 1".to_string(),
            ));
        }
        if self.resolve.timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "resolve.timeout_seconds must be at least 1".to_string(),
            ));
        }
        if self.output.top_sources == 0 {
            return Err(ConfigError::Invalid(
                "output.top_sources must be at least 1".to_string(),
            ));
        }
        if let Some(path) = &self.suffix_list {
            if !path.is_file() {
                return Err(ConfigError::SuffixList {
                    path: path.clone(),
                    message: "file not found".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Requested periods, deduplicated and ordered shortest first.
    pub fn periods(&self) -> Vec<TimePeriod> {
        self.time_periods
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn suffix_table(&self) -> Result<Arc<dyn SuffixTable>, ConfigError> {
        match &self.suffix_list {
            Some(path) => Ok(Arc::new(StaticSuffixTable::from_file(path)?)),
            None => Ok(Arc::new(PublicSuffixList)),
        }
    }

    pub fn resolver_settings(&self) -> ResolverSettings {
        ResolverSettings {
            timeout: Duration::from_secs(self.resolve.timeout_seconds),
            concurrency: self.resolve.concurrency,
        }
    }
}
