//! Self-contained HTML report with one tab per period.

use super::{period_title, SourceCategory};
use crate::aggregate::{percentage, PeriodStats};
use crate::period::TimePeriod;
use crate::providers::{group_by_provider, ProviderGroup};
use crate::recommendations::{recommend, AdviceKind};
use crate::summary::AnalysisSummary;

const STYLE: &str = r#"
body { font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Roboto, Helvetica, Arial, sans-serif; line-height: 1.6; color: #333; max-width: 860px; margin: 0 auto; padding: 20px; background-color: #f9f9f9; }
h1, h2 { color: #2c3e50; }
.tabs { margin: 16px 0; }
.tab-button { border: 1px solid #ccc; background: #fff; padding: 6px 14px; cursor: pointer; border-radius: 4px; }
.tab-button.active { background: #2c3e50; color: #fff; }
.summary-box { display: flex; gap: 16px; margin-bottom: 24px; }
.summary-item { flex: 1; background: #fff; padding: 16px; border-radius: 6px; text-align: center; }
.summary-number { font-size: 2em; font-weight: bold; }
.success { color: #27ae60; } .failure { color: #c0392b; } .neutral { color: #2c3e50; }
.section { background: #fff; padding: 16px; border-radius: 6px; margin-bottom: 20px; }
.source { border-top: 1px solid #eee; padding: 8px 0; }
.source-header { display: flex; justify-content: space-between; font-weight: bold; }
.ip-row { display: flex; justify-content: space-between; padding-left: 24px; font-family: monospace; color: #555; }
table { border-collapse: collapse; width: 100%; }
th, td { text-align: left; padding: 4px 8px; border-bottom: 1px solid #eee; }
"#;

const SCRIPT: &str = r#"
function showPeriod(periodId, button) {
  var contents = document.getElementsByClassName("period-content");
  for (var i = 0; i < contents.length; i++) { contents[i].style.display = "none"; }
  document.getElementById("period-" + periodId).style.display = "block";
  var buttons = document.getElementsByClassName("tab-button");
  for (var i = 0; i < buttons.length; i++) { buttons[i].classList.remove("active"); }
  button.classList.add("active");
}
"#;

/// Escape text for element content and double-quoted attributes.
pub fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Periods worth a tab: those with mail, plus `all` when requested.
fn tab_periods(summary: &AnalysisSummary) -> Vec<TimePeriod> {
    let periods: Vec<TimePeriod> = summary
        .periods
        .iter()
        .filter(|stats| stats.has_messages() || stats.period == TimePeriod::All)
        .map(|stats| stats.period)
        .collect();
    if periods.is_empty() {
        vec![summary.default_period]
    } else {
        periods
    }
}

fn date_range(stats: &PeriodStats) -> String {
    match (stats.first_report, stats.last_report) {
        (Some(begin), Some(end)) => format!(
            "{} - {}",
            begin.format("%b %-d, %Y"),
            end.format("%b %-d, %Y")
        ),
        _ => "no reports".to_string(),
    }
}

pub fn render(summary: &AnalysisSummary) -> String {
    let display_period = summary.default_period;
    let title_domain = summary
        .display_stats()
        .and_then(|stats| stats.domains.iter().next().cloned())
        .unwrap_or_else(|| "Domain".to_string());

    let mut tabs = String::new();
    let mut contents = String::new();
    let periods = tab_periods(summary);
    let active = if periods.contains(&display_period) {
        display_period
    } else {
        periods[0]
    };

    for period in periods {
        let Some(stats) = summary.period_stats(period) else {
            continue;
        };
        let is_active = period == active;
        tabs.push_str(&format!(
            r#"<button class="tab-button{}" onclick="showPeriod('{}', this)">{}</button>"#,
            if is_active { " active" } else { "" },
            period.label(),
            period_title(period)
        ));
        contents.push_str(&format!(
            r#"<div id="period-{}" class="period-content" style="display: {}">{}</div>"#,
            period.label(),
            if is_active { "block" } else { "none" },
            period_content(summary, stats)
        ));
    }

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>DMARC Report for {domain}</title>
<style>{STYLE}</style>
<script>{SCRIPT}</script>
</head>
<body>
<h1>DMARC Report for {domain}</h1>
<p>Generated {generated} from {parsed} report(s); {skipped} file(s) skipped.</p>
<div class="tabs">{tabs}</div>
{contents}
{diagnostics}
</body>
</html>
"#,
        domain = escape(&title_domain),
        generated = summary.generated_at.format("%Y-%m-%d %H:%M UTC"),
        parsed = summary.totals.parsed_reports,
        skipped = summary.totals.skipped_reports,
        diagnostics = diagnostics(summary),
    )
}

fn period_content(summary: &AnalysisSummary, stats: &PeriodStats) -> String {
    let groups = group_by_provider(summary.sources_for(stats.period));
    let mut out = String::new();

    out.push_str(&format!(
        r#"<p class="date-range">{}</p>
<div class="summary-box">
<div class="summary-item"><span class="summary-number neutral">{}</span><div>Emails processed</div></div>
<div class="summary-item"><span class="summary-number success">{}</span><div>Emails passed DMARC</div></div>
<div class="summary-item"><span class="summary-number failure">{}</span><div>Emails failed DMARC</div></div>
</div>
"#,
        escape(&date_range(stats)),
        stats.total_messages,
        stats.aligned,
        stats.failed
    ));

    for (category, title, description) in [
        (
            SourceCategory::Authenticated,
            "Authenticated sources",
            "Sources identified as legitimate senders for your domain based on authentication results.",
        ),
        (
            SourceCategory::Unauthenticated,
            "Unauthenticated sources",
            "Sources sending mail as your domain that could not be verified through authentication.",
        ),
        (
            SourceCategory::Forwarded,
            "Forwarded email sources",
            "Forwarding usually preserves DKIM signatures while failing SPF from the new IP.",
        ),
    ] {
        let members: Vec<&ProviderGroup> = groups
            .iter()
            .filter(|group| SourceCategory::of(group) == category)
            .collect();
        out.push_str(&source_section(
            summary,
            stats.period,
            title,
            description,
            &members,
        ));
    }

    if !stats.failures_by_domain.is_empty() {
        out.push_str(
            r#"<div class="section"><h2>Authentication failures by domain</h2><table><tr><th>Domain</th><th>Failures</th></tr>"#,
        );
        for (domain, count) in &stats.failures_by_domain {
            out.push_str(&format!("<tr><td>{}</td><td>{count}</td></tr>", escape(domain)));
        }
        out.push_str("</table></div>");
    }

    out.push_str(&recommendation_section(stats));
    out
}

fn source_section(
    summary: &AnalysisSummary,
    period: TimePeriod,
    title: &str,
    description: &str,
    groups: &[&ProviderGroup],
) -> String {
    let mut out = format!(
        r#"<div class="section"><h2>{}</h2><p>{}</p>"#,
        escape(title),
        escape(description)
    );
    if groups.is_empty() {
        out.push_str("<p>No sources found in this category.</p></div>");
        return out;
    }
    for group in groups {
        out.push_str(&format!(
            r#"<div class="source"><div class="source-header"><span class="name">{}</span><span class="stats">TOTAL {} &middot; SPF {:.0}% &middot; DKIM {:.0}% &middot; ALIGNED {:.0}%</span></div>"#,
            escape(&group.name),
            group.total_messages,
            percentage(group.spf_pass, group.total_messages),
            percentage(group.dkim_pass, group.total_messages),
            group.alignment_rate()
        ));
        for source in summary
            .sources_for(period)
            .into_iter()
            .filter(|source| group.ips.contains(&source.source_ip))
        {
            let host = source
                .resolved_hostname
                .as_deref()
                .map(|h| format!(" ({})", escape(h)))
                .unwrap_or_default();
            out.push_str(&format!(
                r#"<div class="ip-row"><span class="ip">{}{host}</span><span>{} msgs &middot; SPF {:.0}% &middot; DKIM {:.0}%</span></div>"#,
                source.source_ip,
                source.total_messages,
                percentage(source.spf_pass_count, source.total_messages),
                percentage(source.dkim_pass_count, source.total_messages)
            ));
        }
        out.push_str("</div>");
    }
    out.push_str("</div>");
    out
}

fn recommendation_section(stats: &PeriodStats) -> String {
    let mut items: Vec<String> = recommend(stats)
        .into_iter()
        .flat_map(|rec| rec.advice)
        .filter(|advice| !matches!(advice.kind, AdviceKind::Info | AdviceKind::NoData))
        .map(|advice| advice.to_string())
        .collect();
    items.sort();
    items.dedup();
    if items.is_empty() {
        items = vec![
            "Set up SPF and DKIM for all sending sources.".to_string(),
            "Configure a DMARC policy for better email deliverability.".to_string(),
        ];
    }
    let mut out = format!(
        r#"<div class="section recommendations"><h2>Recommendations for {}</h2><ul>"#,
        period_title(stats.period)
    );
    for item in items {
        out.push_str(&format!("<li>{}</li>", escape(&item)));
    }
    out.push_str("</ul></div>");
    out
}

fn diagnostics(summary: &AnalysisSummary) -> String {
    if summary.skipped.is_empty() && summary.nonconformant.is_empty() {
        return String::new();
    }
    let mut out = String::from(
        r#"<div class="section"><h2>Diagnostics</h2><table><tr><th>File</th><th>Issue</th></tr>"#,
    );
    for skipped in &summary.skipped {
        out.push_str(&format!(
            "<tr><td>{}</td><td>skipped: {} ({})</td></tr>",
            escape(&skipped.name),
            skipped.reason.as_str(),
            escape(&skipped.detail)
        ));
    }
    for report in &summary.nonconformant {
        out.push_str(&format!(
            "<tr><td>{}</td><td>unrecognized results: {}</td></tr>",
            escape(&report.name),
            escape(&report.tokens.join(", "))
        ));
    }
    out.push_str("</table></div>");
    out
}
