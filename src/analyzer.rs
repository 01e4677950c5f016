//! Run orchestration: load, parse, filter, aggregate, resolve.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::aggregate::{AggregateMap, Aggregator, PeriodStats};
use crate::alignment::AlignmentClassifier;
use crate::config::AnalyzerConfig;
use crate::error::{AnalyzerError, ConfigError, ResolutionError, Result};
use crate::loader::{discover_report_files, read_report};
use crate::parser::ParsedReport;
use crate::period::{PeriodAnchor, PeriodFilter, TimePeriod};
use crate::resolver::{resolve_all, HostnameLookup, Resolution, ResolverSettings, ReverseDnsLookup};
use crate::summary::{
    choose_default_period, AnalysisSummary, NonconformantReport, RunTotals, SkipReason,
    SkippedReport, UnresolvedIp,
};

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOptions {
    pub periods: Vec<TimePeriod>,
    pub anchor: PeriodAnchor,
    pub max_parallel_parses: usize,
    /// Upper bound on reading and parsing one file.
    pub load_timeout: Duration,
    /// Reverse DNS settings; `None` skips resolution.
    pub resolve: Option<ResolverSettings>,
}

impl AnalysisOptions {
    pub fn from_config(config: &AnalyzerConfig) -> Self {
        Self {
            periods: config.periods(),
            anchor: config.anchor,
            max_parallel_parses: config.max_parallel_parses,
            load_timeout: Duration::from_secs(config.load_timeout_seconds),
            resolve: config
                .resolve
                .enabled
                .then(|| config.resolver_settings()),
        }
    }
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self::from_config(&AnalyzerConfig::default())
    }
}

pub struct Analyzer {
    aggregator: Aggregator,
    options: AnalysisOptions,
}

impl Analyzer {
    pub fn new(classifier: AlignmentClassifier, options: AnalysisOptions) -> Self {
        Self {
            aggregator: Aggregator::new(classifier),
            options,
        }
    }

    pub fn from_config(config: &AnalyzerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let classifier = AlignmentClassifier::new(config.alignment, config.suffix_table()?);
        Ok(Self::new(classifier, AnalysisOptions::from_config(config)))
    }

    pub fn options(&self) -> &AnalysisOptions {
        &self.options
    }

    /// Full run over a directory or single report file.
    pub async fn analyze_path(&self, path: &Path) -> Result<AnalysisSummary> {
        if !path.exists() {
            return Err(ConfigError::MissingInput(path.to_path_buf()).into());
        }
        let files = discover_report_files(path)?;
        log::info!("Found {} potential DMARC report files", files.len());

        let (reports, skipped) = self.load_reports(&files).await;
        let mut summary = self.summarize(reports, skipped, files.len(), Utc::now())?;

        if let Some(settings) = self.options.resolve {
            match ReverseDnsLookup::from_system_conf() {
                Ok(lookup) => resolve_sources(&mut summary, Arc::new(lookup), settings).await,
                Err(e) => {
                    log::warn!("Failed to create DNS resolver: {e}");
                    let ips = source_ips(&summary);
                    let resolution = Resolution::all_failed(&ips, |ip| ResolutionError::Lookup {
                        ip,
                        message: e.to_string(),
                    });
                    apply_resolution(&mut summary, resolution);
                }
            }
        }
        Ok(summary)
    }

    /// Read and parse files on the blocking pool, keeping input order.
    pub async fn load_reports(&self, files: &[PathBuf]) -> (Vec<ParsedReport>, Vec<SkippedReport>) {
        self.load_reports_with(files, load_one).await
    }

    async fn load_reports_with<F>(
        &self,
        files: &[PathBuf],
        load: F,
    ) -> (Vec<ParsedReport>, Vec<SkippedReport>)
    where
        F: Fn(&Path) -> LoadOutcome + Send + Sync + Copy + 'static,
    {
        let permits = Arc::new(Semaphore::new(self.options.max_parallel_parses.max(1)));
        let timeout = self.options.load_timeout;
        let mut tasks = JoinSet::new();

        for (index, path) in files.iter().cloned().enumerate() {
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let name = display_name(&path);
                let handle = tokio::task::spawn_blocking(move || load(&path));
                let outcome = match tokio::time::timeout(timeout, handle).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(e)) => {
                        log::warn!("Parsing {name} panicked: {e}");
                        Err(unreadable(&name, e.to_string()))
                    }
                    Err(_) => {
                        log::warn!("Reading {name} timed out after {timeout:?}");
                        Err(unreadable(&name, "timed out".to_string()))
                    }
                };
                (index, outcome)
            });
        }

        let mut outcomes = Vec::with_capacity(files.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => log::warn!("Report loading task failed: {e}"),
            }
        }
        outcomes.sort_by_key(|(index, _)| *index);

        let mut reports = Vec::new();
        let mut skipped = Vec::new();
        for (_, outcome) in outcomes {
            match outcome {
                Ok(report) => reports.push(report),
                Err(skip) => skipped.push(skip),
            }
        }
        (reports, skipped)
    }

    /// Filter and aggregate already parsed reports. `clock` is the wall-clock
    /// time used when the anchor is `clock`.
    pub fn summarize(
        &self,
        mut reports: Vec<ParsedReport>,
        skipped: Vec<SkippedReport>,
        candidate_files: usize,
        clock: DateTime<Utc>,
    ) -> Result<AnalysisSummary> {
        if reports.is_empty() {
            return Err(AnalyzerError::NoValidInput {
                candidates: candidate_files,
                skipped: skipped.len(),
            });
        }
        reports.sort_by(|a, b| {
            a.metadata
                .date_range
                .begin
                .cmp(&b.metadata.date_range.begin)
                .then_with(|| a.name.cmp(&b.name))
        });

        let now = self
            .options
            .anchor
            .resolve(clock, reports.iter().map(|r| &r.metadata.date_range));
        log::debug!("Period windows anchored at {now}");

        let mut sources = AggregateMap::new();
        let mut periods = Vec::with_capacity(self.options.periods.len());
        for &period in &self.options.periods {
            let filter = PeriodFilter::new(period, now);
            let mut stats = PeriodStats::new(period);
            for report in reports
                .iter()
                .filter(|report| filter.includes(&report.metadata.date_range))
            {
                sources = self
                    .aggregator
                    .fold(sources, period, &report.metadata, &report.records);
                stats = self
                    .aggregator
                    .fold_stats(stats, &report.metadata, &report.records);
            }
            log::debug!(
                "Period {}: {} reports, {} messages",
                period,
                stats.report_count,
                stats.total_messages
            );
            periods.push(stats);
        }

        if periods.iter().all(|stats| stats.report_count == 0) {
            log::warn!("No report falls inside the requested time periods");
            return Err(AnalyzerError::NoValidInput {
                candidates: candidate_files,
                skipped: skipped.len(),
            });
        }

        let nonconformant: Vec<NonconformantReport> = reports
            .iter()
            .filter(|report| !report.metadata.unrecognized_results.is_empty())
            .map(|report| {
                log::info!(
                    "{} uses unrecognized result values: {}",
                    report.name,
                    report.metadata.unrecognized_results.join(", ")
                );
                NonconformantReport {
                    name: report.name.clone(),
                    org_name: report.metadata.org_name.clone(),
                    report_id: report.metadata.report_id.clone(),
                    tokens: report.metadata.unrecognized_results.clone(),
                }
            })
            .collect();

        let totals = RunTotals {
            candidate_files,
            parsed_reports: reports.len(),
            skipped_reports: skipped.len(),
            total_messages: reports.iter().map(ParsedReport::message_count).sum(),
        };

        Ok(AnalysisSummary {
            generated_at: clock,
            anchor: now,
            alignment: self.aggregator.classifier().setting(),
            default_period: choose_default_period(&periods),
            periods,
            sources: sources.into_values().collect(),
            totals,
            skipped,
            nonconformant,
            unresolved: Vec::new(),
            resolved_ips: false,
        })
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

type LoadOutcome = std::result::Result<ParsedReport, SkippedReport>;

fn unreadable(name: &str, detail: String) -> SkippedReport {
    SkippedReport {
        name: name.to_string(),
        reason: SkipReason::Unreadable,
        detail,
    }
}

fn load_one(path: &Path) -> LoadOutcome {
    let name = display_name(path);
    let bytes = read_report(path).map_err(|e| {
        log::info!("Skipping {name}: {e}");
        SkippedReport::from_load_error(name.clone(), &e)
    })?;
    ParsedReport::parse(name.clone(), &bytes).map_err(|e| {
        log::info!("Skipping {name}: {e}");
        SkippedReport::from_parse_error(name.clone(), &e)
    })
}

fn source_ips(summary: &AnalysisSummary) -> BTreeSet<std::net::IpAddr> {
    summary.sources.iter().map(|source| source.source_ip).collect()
}

/// Look up every distinct source IP and record the outcome on the summary.
pub async fn resolve_sources<L: HostnameLookup>(
    summary: &mut AnalysisSummary,
    lookup: Arc<L>,
    settings: ResolverSettings,
) {
    let ips = source_ips(summary);
    log::info!("Resolving {} source IPs", ips.len());
    let resolution = resolve_all(lookup, &ips, settings).await;
    apply_resolution(summary, resolution);
}

pub fn apply_resolution(summary: &mut AnalysisSummary, resolution: Resolution) {
    for source in &mut summary.sources {
        source.resolved_hostname = resolution.hostnames.get(&source.source_ip).cloned();
    }
    summary.unresolved = resolution.unresolved.values().map(UnresolvedIp::from).collect();
    summary.resolved_ips = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::{StaticSuffixTable, SuffixTable};
    use crate::parser::fixtures::{report_xml, Row};
    use crate::resolver::fixtures::StaticLookup;
    use chrono::TimeZone;
    use tempfile::TempDir;

    const DAY: i64 = 86_400;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn analyzer(periods: Vec<TimePeriod>) -> Analyzer {
        let table: Arc<dyn SuffixTable> = Arc::new(StaticSuffixTable::new(["com", "net"]));
        Analyzer::new(
            AlignmentClassifier::relaxed(table),
            AnalysisOptions {
                periods,
                anchor: PeriodAnchor::Clock,
                max_parallel_parses: 2,
                load_timeout: Duration::from_secs(30),
                resolve: None,
            },
        )
    }

    fn report(name: &str, org: &str, days_ago_end: i64, rows: &[Row<'_>]) -> ParsedReport {
        let end = now().timestamp() - days_ago_end * DAY;
        let xml = report_xml(org, end - DAY, end, rows);
        ParsedReport::parse(name, xml.as_bytes()).unwrap()
    }

    fn aligned_row(ip: &str, count: u64) -> Row<'_> {
        Row {
            ip,
            count,
            header_from: "example.com",
            spf: ("example.com", "pass"),
            dkim: None,
        }
    }

    #[test]
    fn test_summarize_filters_by_period() {
        let analyzer = analyzer(vec![TimePeriod::Last30, TimePeriod::All]);
        let reports = vec![
            report("recent.xml", "google.com", 5, &[aligned_row("198.51.100.7", 10)]),
            report("old.xml", "yahoo.com", 100, &[aligned_row("198.51.100.7", 4)]),
        ];

        let summary = analyzer.summarize(reports, Vec::new(), 2, now()).unwrap();

        assert_eq!(summary.period_stats(TimePeriod::Last30).unwrap().total_messages, 10);
        assert_eq!(summary.period_stats(TimePeriod::All).unwrap().total_messages, 14);
        assert_eq!(summary.default_period, TimePeriod::Last30);
        assert_eq!(summary.sources.len(), 2);
        assert_eq!(summary.sources_for(TimePeriod::All)[0].total_messages, 14);
        assert_eq!(summary.totals.total_messages, 14);
        assert_eq!(summary.anchor, now());
    }

    #[test]
    fn test_latest_report_anchor() {
        let mut analyzer = analyzer(vec![TimePeriod::Last30]);
        analyzer.options.anchor = PeriodAnchor::LatestReport;
        let reports = vec![
            report("a.xml", "google.com", 400, &[aligned_row("192.0.2.1", 3)]),
            report("b.xml", "google.com", 420, &[aligned_row("192.0.2.1", 2)]),
        ];

        let summary = analyzer.summarize(reports, Vec::new(), 2, now()).unwrap();
        assert_eq!(summary.period_stats(TimePeriod::Last30).unwrap().total_messages, 5);
    }

    #[test]
    fn test_no_reports_is_an_error() {
        let analyzer = analyzer(vec![TimePeriod::All]);
        let skipped = vec![SkippedReport {
            name: "bad.xml".to_string(),
            reason: SkipReason::MalformedXml,
            detail: "truncated".to_string(),
        }];
        let err = analyzer.summarize(Vec::new(), skipped, 1, now()).unwrap_err();
        assert!(matches!(err, AnalyzerError::NoValidInput { candidates: 1, skipped: 1 }));
    }

    #[test]
    fn test_nothing_inside_any_period_is_an_error() {
        let analyzer = analyzer(vec![TimePeriod::Last30]);
        let reports = vec![report("old.xml", "google.com", 200, &[aligned_row("192.0.2.1", 3)])];
        let err = analyzer.summarize(reports, Vec::new(), 1, now()).unwrap_err();
        assert!(matches!(err, AnalyzerError::NoValidInput { .. }));
    }

    #[test]
    fn test_nonconformant_reports_are_listed() {
        let analyzer = analyzer(vec![TimePeriod::All]);
        let row = Row {
            ip: "192.0.2.1",
            count: 1,
            header_from: "example.com",
            spf: ("example.com", "hardfail"),
            dkim: None,
        };
        let reports = vec![report("odd.xml", "mail.ru", 1, &[row])];
        let summary = analyzer.summarize(reports, Vec::new(), 1, now()).unwrap();
        assert_eq!(summary.nonconformant.len(), 1);
        assert_eq!(summary.nonconformant[0].tokens, vec!["spf=hardfail".to_string()]);
    }

    #[tokio::test]
    async fn test_load_reports_skips_bad_files() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("good.xml");
        let end = now().timestamp();
        let xml = report_xml("google.com", end - DAY, end, &[aligned_row("192.0.2.1", 2)]);
        std::fs::write(&good, xml).unwrap();
        let bad = dir.path().join("bad.xml");
        std::fs::write(&bad, "<feedback><report_metadata>").unwrap();
        let broken_zip = dir.path().join("broken.zip");
        std::fs::write(&broken_zip, "PK?").unwrap();

        let analyzer = analyzer(vec![TimePeriod::All]);
        let files = discover_report_files(dir.path()).unwrap();
        let (reports, skipped) = analyzer.load_reports(&files).await;

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].name, "good.xml");
        let reasons: Vec<_> = skipped.iter().map(|s| (s.name.as_str(), s.reason)).collect();
        assert_eq!(
            reasons,
            vec![("bad.xml", SkipReason::MalformedXml), ("broken.zip", SkipReason::Unreadable)]
        );
    }

    #[tokio::test]
    async fn test_stalled_read_is_skipped_after_timeout() {
        let dir = TempDir::new().unwrap();
        let end = now().timestamp();
        let xml = report_xml("google.com", end - DAY, end, &[aligned_row("192.0.2.1", 2)]);
        for name in ["fast.xml", "stalled.xml"] {
            std::fs::write(dir.path().join(name), &xml).unwrap();
        }

        let mut analyzer = analyzer(vec![TimePeriod::All]);
        analyzer.options.load_timeout = Duration::from_millis(50);
        let files = discover_report_files(dir.path()).unwrap();
        let (reports, skipped) = analyzer
            .load_reports_with(&files, |path| {
                if path.ends_with("stalled.xml") {
                    std::thread::sleep(Duration::from_millis(500));
                }
                load_one(path)
            })
            .await;

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].name, "fast.xml");
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].name, "stalled.xml");
        assert_eq!(skipped[0].reason, SkipReason::Unreadable);
        assert_eq!(skipped[0].detail, "timed out");
    }

    #[tokio::test]
    async fn test_resolve_sources_fills_hostnames() {
        let analyzer = analyzer(vec![TimePeriod::All]);
        let reports = vec![report(
            "r.xml",
            "google.com",
            1,
            &[aligned_row("192.0.2.1", 2), aligned_row("192.0.2.2", 1)],
        )];
        let mut summary = analyzer.summarize(reports, Vec::new(), 1, now()).unwrap();

        let lookup = StaticLookup::default().with("192.0.2.1", "mail-a.google.com");
        resolve_sources(&mut summary, Arc::new(lookup), ResolverSettings::default()).await;

        assert!(summary.resolved_ips);
        assert_eq!(
            summary.sources[0].resolved_hostname.as_deref(),
            Some("mail-a.google.com")
        );
        assert_eq!(summary.sources[1].resolved_hostname, None);
        assert_eq!(summary.unresolved.len(), 1);
        assert_eq!(summary.unresolved[0].ip.to_string(), "192.0.2.2");
    }

    #[tokio::test]
    async fn test_missing_input_path() {
        let analyzer = analyzer(vec![TimePeriod::All]);
        let err = analyzer
            .analyze_path(Path::new("/nonexistent/dmarc"))
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyzerError::Config(ConfigError::MissingInput(_))));
    }
}
