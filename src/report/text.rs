//! Plain-text report.

use std::fmt::{self, Write};

use super::{pct, period_title, truncate_string, ReportOptions};
use crate::aggregate::{at_least, PeriodStats, SourceAggregate};
use crate::providers::group_by_provider;
use crate::summary::AnalysisSummary;

/// Column-aligned table with a dashed rule under the header.
struct Table {
    headers: Vec<&'static str>,
    rows: Vec<Vec<String>>,
}

impl Table {
    fn new(headers: &[&'static str]) -> Self {
        Self {
            headers: headers.to_vec(),
            rows: Vec::new(),
        }
    }

    fn push(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    fn render(&self, out: &mut impl Write) -> fmt::Result {
        let mut widths: Vec<usize> = self.headers.iter().map(|h| h.chars().count()).collect();
        for row in &self.rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.chars().count());
            }
        }
        let line = |cells: Vec<&str>| {
            cells
                .iter()
                .zip(&widths)
                .map(|(cell, &width)| format!("{cell:<width$}"))
                .collect::<Vec<_>>()
                .join("  ")
                .trim_end()
                .to_string()
        };
        writeln!(out, "{}", line(self.headers.clone()))?;
        let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
        writeln!(out, "{}", line(rule.iter().map(String::as_str).collect()))?;
        for row in &self.rows {
            writeln!(out, "{}", line(row.iter().map(String::as_str).collect()))?;
        }
        Ok(())
    }
}

fn source_label(source: &SourceAggregate) -> String {
    match &source.resolved_hostname {
        Some(hostname) => format!("{} ({hostname})", source.source_ip),
        None => source.source_ip.to_string(),
    }
}

fn join<'a>(items: impl IntoIterator<Item = &'a String>) -> String {
    items
        .into_iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Text rendering of a summary; `to_string()` produces the report.
pub struct TextReport<'a> {
    summary: &'a AnalysisSummary,
    options: &'a ReportOptions,
}

impl<'a> TextReport<'a> {
    pub fn new(summary: &'a AnalysisSummary, options: &'a ReportOptions) -> Self {
        Self { summary, options }
    }
}

impl fmt::Display for TextReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_report(self.summary, self.options, f)
    }
}

pub fn render(summary: &AnalysisSummary, options: &ReportOptions) -> String {
    TextReport::new(summary, options).to_string()
}

fn write_report(
    summary: &AnalysisSummary,
    options: &ReportOptions,
    out: &mut impl Write,
) -> fmt::Result {
    let Some(stats) = summary.display_stats().filter(|stats| stats.has_messages()) else {
        writeln!(
            out,
            "No valid DMARC reports found or no messages reported for the analyzed period."
        )?;
        return render_diagnostics(summary, options, out);
    };
    let suffix = format!(" ({})", period_title(stats.period));
    let sources = summary.sources_for(stats.period);

    writeln!(out, "= DMARC Report Summary{suffix} =")?;
    writeln!(out, "Total Messages: {}", stats.total_messages)?;
    writeln!(out, "Domains Protected: {}", join(&stats.domains))?;
    writeln!(out, "Reporting Organizations: {}", join(&stats.reporting_orgs))?;
    if let (Some(first), Some(last)) = (stats.first_report, stats.last_report) {
        writeln!(
            out,
            "Report Dates: {} to {}",
            first.format("%Y-%m-%d"),
            last.format("%Y-%m-%d")
        )?;
    }
    writeln!(out, "Alignment Mode: {:?}", summary.alignment)?;
    writeln!(out)?;

    writeln!(out, "= Authentication Summary{suffix} =")?;
    writeln!(
        out,
        "DKIM: {}/{} passed ({})",
        stats.dkim_pass,
        stats.total_messages,
        pct(stats.dkim_pass, stats.total_messages)
    )?;
    writeln!(
        out,
        "SPF: {}/{} passed ({})",
        stats.spf_pass,
        stats.total_messages,
        pct(stats.spf_pass, stats.total_messages)
    )?;
    writeln!(
        out,
        "DMARC aligned: {}/{} ({})",
        stats.aligned,
        stats.total_messages,
        pct(stats.aligned, stats.total_messages)
    )?;
    writeln!(out)?;

    writeln!(out, "= Policy Enforcement{suffix} =")?;
    let mut dispositions: Vec<(&String, &u64)> = stats.dispositions.iter().collect();
    dispositions.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    let mut table = Table::new(&["Disposition", "Count", "%"]);
    for (disposition, count) in dispositions {
        table.push(vec![
            disposition.clone(),
            count.to_string(),
            pct(*count, stats.total_messages),
        ]);
    }
    table.render(out)?;
    writeln!(out)?;

    writeln!(out, "= IP Sources Grouped by Organization{suffix} =")?;
    let mut table = Table::new(&[
        "Source",
        "IPs",
        "Messages",
        "DKIM Pass",
        "SPF Pass",
        "Aligned",
        "Domains",
    ]);
    for group in group_by_provider(sources.iter().copied()) {
        table.push(vec![
            group.name.clone(),
            group.ips.len().to_string(),
            group.total_messages.to_string(),
            pct(group.dkim_pass, group.total_messages),
            pct(group.spf_pass, group.total_messages),
            pct(group.aligned, group.total_messages),
            truncate_string(&join(&group.header_from_domains), 50),
        ]);
    }
    table.render(out)?;
    writeln!(out)?;

    writeln!(out, "= Top IP Sources{suffix} =")?;
    let mut table =
        Table::new(&["IP", "Messages", "DKIM Pass", "SPF Pass", "Aligned", "Domains"]);
    for source in sources.iter().take(options.top_sources) {
        table.push(vec![
            source_label(source),
            source.total_messages.to_string(),
            pct(source.dkim_pass_count, source.total_messages),
            pct(source.spf_pass_count, source.total_messages),
            pct(source.aligned_count, source.total_messages),
            join(&source.header_from_domains),
        ]);
    }
    table.render(out)?;
    writeln!(out)?;

    if !stats.failures_by_domain.is_empty() {
        writeln!(out, "= Authentication Failures by Domain{suffix} =")?;
        let mut failures: Vec<(&String, &u64)> = stats.failures_by_domain.iter().collect();
        failures.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        let mut table = Table::new(&["Domain", "Failures"]);
        for (domain, count) in failures {
            table.push(vec![domain.clone(), count.to_string()]);
        }
        table.render(out)?;
        writeln!(out)?;
    }

    render_recommendations(summary, out)?;
    render_period_overview(&summary.periods, out)?;
    render_reference_guide(stats, out)?;

    if options.verbose {
        writeln!(out)?;
        writeln!(out, "= Detailed IP Information{suffix} =")?;
        for source in &sources {
            writeln!(out, "\nIP: {}", source_label(source))?;
            writeln!(out, "Message Count: {}", source.total_messages)?;
            writeln!(out, "Domains: {}", join(&source.header_from_domains))?;
            writeln!(out, "Reported by: {}", join(&source.contributing_orgs))?;
            writeln!(
                out,
                "DKIM: {} pass, {} fail",
                source.dkim_pass_count,
                source.total_messages.saturating_sub(source.dkim_pass_count)
            )?;
            writeln!(
                out,
                "SPF: {} pass, {} fail",
                source.spf_pass_count,
                source.total_messages.saturating_sub(source.spf_pass_count)
            )?;
            writeln!(out, "Fully Aligned: {}", source.aligned_count)?;
            writeln!(out, "Dispositions:")?;
            for (disposition, count) in &source.dispositions {
                writeln!(out, "  - {disposition}: {count}")?;
            }
        }
    }
    render_diagnostics(summary, options, out)
}

fn render_recommendations(summary: &AnalysisSummary, out: &mut impl Write) -> fmt::Result {
    writeln!(out, "= DMARC Policy Recommendations =")?;
    for rec in summary.recommendations() {
        writeln!(out, "\nDomain: {}", rec.domain)?;
        writeln!(
            out,
            "Current DMARC Policy: p={}, pct={}%, sp={}",
            rec.policy, rec.pct, rec.subdomain_policy
        )?;
        writeln!(
            out,
            "Messages: {} from {} source IPs",
            rec.messages, rec.num_sources
        )?;
        writeln!(
            out,
            "Authentication Rates: DKIM {:.1}%, SPF {:.1}%, Aligned {:.1}%",
            rec.dkim_rate, rec.spf_rate, rec.alignment_rate
        )?;
        if !rec.dispositions.is_empty() {
            writeln!(out, "Policy Application Results:")?;
            let mut table = Table::new(&["Disposition", "Count", "%"]);
            for (disposition, count) in &rec.dispositions {
                table.push(vec![
                    disposition.clone(),
                    count.to_string(),
                    pct(*count, rec.messages),
                ]);
            }
            table.render(out)?;
        }
        writeln!(out, "Recommendations:")?;
        for advice in &rec.advice {
            writeln!(out, "  - {advice}")?;
        }
    }
    writeln!(out)
}

fn render_period_overview(periods: &[PeriodStats], out: &mut impl Write) -> fmt::Result {
    writeln!(out, "= Period Overview =")?;
    let mut table = Table::new(&["Period", "Reports", "Messages", "Aligned", "Failed"]);
    for stats in periods {
        table.push(vec![
            period_title(stats.period).to_string(),
            stats.report_count.to_string(),
            stats.total_messages.to_string(),
            pct(stats.aligned, stats.total_messages),
            stats.failed.to_string(),
        ]);
    }
    table.render(out)?;
    writeln!(out)
}

fn render_reference_guide(stats: &PeriodStats, out: &mut impl Write) -> fmt::Result {
    out.write_str(
        "= DMARC Policy Reference Guide =\n\
         Policy Values (p=):\n\
         \x20 none - Monitor only, take no action on failures (monitoring mode)\n\
         \x20 quarantine - Mark or junk messages that fail authentication\n\
         \x20 reject - Block messages that fail authentication\n\
         \n\
         Percentage (pct=):\n\
         \x20 Controls what percentage of messages are subject to filtering\n\
         \x20 Start low (5-10%) and gradually increase as confidence grows\n\
         \n\
         Subdomain Policy (sp=):\n\
         \x20 Controls policy for subdomains (e.g., mail from sub.example.com when domain is example.com)\n\
         \x20 Often set to 'reject' to prevent subdomain spoofing\n\
         \n\
         DMARC Policy Progression Path:\n\
         \x20 1. p=none with RUA/RUF reporting enabled\n\
         \x20 2. p=quarantine with low pct value (5-25%)\n\
         \x20 3. Gradually increase pct value to 100%\n\
         \x20 4. p=reject with low pct value (5-25%)\n\
         \x20 5. Gradually increase pct value to 100%\n\
         \n\
         = General DMARC Implementation Tips =\n",
    )?;
    let weak = |passed: u64| !at_least(passed, stats.total_messages, 90);
    if weak(stats.dkim_pass) || weak(stats.spf_pass) {
        out.write_str("- Fix authentication issues before increasing enforcement levels\n")?;
    }
    out.write_str(
        "- Implement proper SPF, DKIM and DMARC for all domains, even non-sending domains\n\
         - Monitor reports regularly and adjust policies based on findings\n\
         - Coordinate with third-party senders to ensure they authenticate properly\n\
         - Consider using multiple DKIM selectors for different mail streams\n\
         - Implement a process to respond to authentication failures quickly\n",
    )
}

fn render_diagnostics(
    summary: &AnalysisSummary,
    options: &ReportOptions,
    out: &mut impl Write,
) -> fmt::Result {
    if !options.verbose {
        return Ok(());
    }
    if !summary.skipped.is_empty() {
        writeln!(out, "\n= Skipped Reports =")?;
        for skipped in &summary.skipped {
            writeln!(
                out,
                "{}: {} ({})",
                skipped.name,
                skipped.reason.as_str(),
                skipped.detail
            )?;
        }
    }
    if !summary.nonconformant.is_empty() {
        writeln!(out, "\n= Reports With Unrecognized Results =")?;
        for report in &summary.nonconformant {
            writeln!(
                out,
                "{} from {}: {}",
                report.name,
                report.org_name,
                report.tokens.join(", ")
            )?;
        }
    }
    if !summary.unresolved.is_empty() {
        writeln!(out, "\n= Unresolved IPs =")?;
        for unresolved in &summary.unresolved {
            writeln!(out, "{}: {}", unresolved.ip, unresolved.reason)?;
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};

    use crate::alignment::{AlignmentClassifier, StaticSuffixTable, SuffixTable};
    use crate::analyzer::{AnalysisOptions, Analyzer};
    use crate::parser::fixtures::{report_xml, Row};
    use crate::parser::ParsedReport;
    use crate::period::{PeriodAnchor, TimePeriod};
    use crate::summary::AnalysisSummary;

    /// Two reports inside the last 30 days with one aligned and one spoofing source.
    pub fn sample_summary() -> AnalysisSummary {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let end = now.timestamp() - 86_400;
        let rows = [
            Row {
                ip: "198.51.100.7",
                count: 40,
                header_from: "example.com",
                spf: ("example.com", "pass"),
                dkim: Some(("example.com", "pass")),
            },
            Row {
                ip: "203.0.113.9",
                count: 3,
                header_from: "example.com",
                spf: ("spoofer.net", "fail"),
                dkim: None,
            },
        ];
        let reports = vec![
            ParsedReport::parse(
                "a.xml",
                report_xml("google.com", end - 86_400, end, &rows).as_bytes(),
            )
            .unwrap(),
            ParsedReport::parse(
                "b.xml",
                report_xml("yahoo.com", end - 86_400, end, &rows[..1]).as_bytes(),
            )
            .unwrap(),
        ];
        let table: Arc<dyn SuffixTable> = Arc::new(StaticSuffixTable::new(["com", "net"]));
        let analyzer = Analyzer::new(
            AlignmentClassifier::relaxed(table),
            AnalysisOptions {
                periods: vec![TimePeriod::Last30, TimePeriod::All],
                anchor: PeriodAnchor::Fixed(now),
                ..AnalysisOptions::default()
            },
        );
        analyzer.summarize(reports, Vec::new(), 2, now).unwrap()
    }
}
