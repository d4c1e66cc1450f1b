//! Report generation and output formatting
//!
//! Renders scan reports, WAF verdicts and listings as human-readable text or
//! JSON, and writes them to stdout or a file.

use async_trait::async_trait;
use std::path::Path;
use tokio::{fs, io::AsyncWriteExt};

use crate::{
    catalog::ScriptCatalog,
    config::AppConfig,
    core::{ProbeStatus, ScanReport},
    error::{Result, ScannerError},
    persistence::RunSummary,
    session::{ActionReport, ManagedScan, PolicyTemplate},
    waf_detection::WafDetectionResult,
    waf_signatures::{PayloadCategory, WafSignature},
};

/// Anything the CLI can print
#[derive(Debug, Clone, Copy)]
pub enum Report<'a> {
    Scan(&'a ScanReport),
    Waf(&'a WafDetectionResult),
    Catalog(&'a ScriptCatalog),
    Signatures(&'a [WafSignature], &'a [PayloadCategory]),
    ManagedScans(&'a [ManagedScan]),
    Policies(&'a [PolicyTemplate]),
    Action(&'a ActionReport),
    Runs(&'a [RunSummary]),
}

#[async_trait]
pub trait ReportGenerator: Send + Sync {
    fn render(&self, report: &Report<'_>, format: &str) -> Result<String>;

    /// Write rendered content to `output_path`, or stdout when `None`
    async fn emit(&self, content: &str, output_path: Option<&Path>) -> Result<()>;
}

pub struct DefaultReportGenerator {
    pretty_json: bool,
}

impl DefaultReportGenerator {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            pretty_json: config.output.pretty_json,
        }
    }
}

#[async_trait]
impl ReportGenerator for DefaultReportGenerator {
    fn render(&self, report: &Report<'_>, format: &str) -> Result<String> {
        match format.to_lowercase().as_str() {
            "json" => self.generate_json_report(report),
            "human" => Ok(match report {
                Report::Scan(r) => human_scan_report(r),
                Report::Waf(r) => human_waf_report(r),
                Report::Catalog(c) => human_catalog(c),
                Report::Signatures(s, p) => human_signatures(s, p),
                Report::ManagedScans(s) => human_managed_scans(s),
                Report::Policies(p) => human_policies(p),
                Report::Action(a) => human_action(a),
                Report::Runs(r) => human_runs(r),
            }),
            _ => Err(ScannerError::output(format, "Unsupported output format")),
        }
    }

    async fn emit(&self, content: &str, output_path: Option<&Path>) -> Result<()> {
        match output_path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent).await?;
                }
                fs::write(path, content).await?;
                tracing::info!("Report written: {}", path.display());
            }
            None => {
                let mut stdout = tokio::io::stdout();
                stdout.write_all(content.as_bytes()).await?;
                if !content.ends_with('\n') {
                    stdout.write_all(b"\n").await?;
                }
                stdout.flush().await?;
            }
        }
        Ok(())
    }
}

impl DefaultReportGenerator {
    fn generate_json_report(&self, report: &Report<'_>) -> Result<String> {
        let value = match report {
            Report::Scan(r) => serde_json::to_value(r)?,
            Report::Waf(r) => serde_json::to_value(r)?,
            Report::Catalog(c) => serde_json::json!({
                "directory": c.directory(),
                "entries": c.entries(),
            }),
            Report::Signatures(s, p) => serde_json::json!({
                "signatures": s,
                "payload_categories": p,
            }),
            Report::ManagedScans(s) => serde_json::to_value(s)?,
            Report::Policies(p) => serde_json::to_value(p)?,
            Report::Action(a) => serde_json::to_value(a)?,
            Report::Runs(r) => serde_json::to_value(r)?,
        };
        let rendered = if self.pretty_json {
            serde_json::to_string_pretty(&value)
        } else {
            serde_json::to_string(&value)
        };
        rendered.map_err(|e| ScannerError::output("json", format!("JSON serialization failed: {}", e)))
    }
}

fn human_scan_report(report: &ScanReport) -> String {
    let mut out = String::new();

    out.push_str("# Reconnaissance Report\n\n");
    out.push_str(&format!("Scan ID: {}\n", report.id()));
    out.push_str(&format!("Target: {}\n", report.target()));
    out.push_str(&format!("Final state: {}\n", report.final_state().as_str()));
    out.push_str(&format!("Time budget: {}s\n", report.total_budget().as_secs()));
    out.push_str(&format!("Scan duration: {:.2}s\n", report.duration().as_secs_f64()));
    out.push_str(&format!(
        "Completed at: {}\n",
        report.completed_at().format("%Y-%m-%d %H:%M:%S UTC")
    ));
    if report.budget_exhausted() {
        out.push_str("Budget: exhausted before all scripts ran\n");
    }
    if let Some(folder) = report.scan_folder() {
        out.push_str(&format!("Result folder: {}\n", folder.display()));
    }
    out.push('\n');

    out.push_str("## Phases\n\n");
    for (phase, outcome) in [("OS scan", report.os_scan()), ("Port scan", report.port_scan())] {
        match outcome {
            Some(o) => out.push_str(&format!(
                "- {}: {} ({:.2}s)\n",
                phase,
                o.status.as_str(),
                o.elapsed.as_secs_f64()
            )),
            None => out.push_str(&format!("- {}: not run\n", phase)),
        }
    }
    out.push('\n');

    if !report.os_guesses().is_empty() {
        out.push_str("## OS Guesses\n\n");
        out.push_str("| Name | Vendor | Type | Accuracy |\n");
        out.push_str("|------|--------|------|----------|\n");
        for guess in report.os_guesses() {
            out.push_str(&format!(
                "| {} | {} | {} | {}% |\n",
                guess.name,
                guess.vendor.as_deref().unwrap_or("-"),
                guess.device_type,
                guess.accuracy
            ));
        }
        out.push('\n');
    }

    out.push_str("## Open Ports\n\n");
    if report.open_ports().is_empty() {
        out.push_str("No open ports found.\n\n");
    } else {
        out.push_str("| Port | Protocol | State | Service | Scripts |\n");
        out.push_str("|------|----------|-------|---------|---------|\n");
        for record in report.open_ports() {
            let scripts = report
                .script_matches()
                .iter()
                .find(|m| m.port == record.port)
                .map(|m| m.scripts.len())
                .unwrap_or(0);
            out.push_str(&format!(
                "| {} | {} | {} | {} | {} |\n",
                record.port,
                record.protocol.as_str(),
                record.state.as_str(),
                record.service.as_deref().unwrap_or("unknown"),
                scripts
            ));
        }
        out.push('\n');
    }

    if !report.script_results().is_empty() {
        out.push_str("## Script Results\n\n");
        for port in report.script_results() {
            out.push_str(&format!(
                "### {}/{} ({}), {}s per script\n\n",
                port.port,
                port.protocol.as_str(),
                port.service,
                port.per_script_timeout.as_secs()
            ));
            for outcome in &port.outcomes {
                out.push_str(&format!("- {}: {}\n", outcome.name, outcome.status.as_str()));
                let detail = match outcome.status {
                    ProbeStatus::Success => outcome.output.as_deref(),
                    _ => outcome.error.as_deref(),
                };
                if let Some(text) = detail.map(str::trim).filter(|t| !t.is_empty()) {
                    for line in text.lines().take(20) {
                        out.push_str(&format!("    {}\n", line));
                    }
                }
            }
            out.push('\n');
        }
    }

    if !report.warnings().is_empty() {
        out.push_str("## Warnings\n\n");
        for warning in report.warnings() {
            let port = warning.port.map(|p| format!(" port {}", p)).unwrap_or_default();
            out.push_str(&format!(
                "- [{}{}] {}\n",
                warning.phase.as_str(),
                port,
                warning.message
            ));
        }
    }

    out
}

fn human_waf_report(result: &WafDetectionResult) -> String {
    let mut out = String::new();
    let analysis = result.response_analysis();

    out.push_str("# WAF Detection Report\n\n");
    out.push_str(&format!("Target: {}\n", result.target()));
    out.push_str(&format!("WAF detected: {}\n", if result.detected() { "yes" } else { "no" }));
    if let Some(name) = result.waf_name() {
        out.push_str(&format!(
            "Identified: {} ({})\n",
            name,
            result.waf_type().unwrap_or("unknown")
        ));
    }
    out.push_str(&format!("Confidence: {:.0}%\n", result.confidence() * 100.0));
    out.push_str(&format!("Methods: {}\n", result.detection_methods().join(", ")));
    out.push_str(&format!("Duration: {:.2}s\n", result.duration().as_secs_f64()));
    if let Some(folder) = result.result_folder() {
        out.push_str(&format!("Result folder: {}\n", folder.display()));
    }
    out.push('\n');

    out.push_str("## Response Analysis\n\n");
    match &analysis.baseline {
        Some(baseline) => out.push_str(&format!("Baseline status: {}\n", baseline.status)),
        None => out.push_str("Baseline request failed\n"),
    }
    out.push_str(&format!(
        "Blocked payloads: {}/{} ({:.0}%)\n",
        analysis.blocked_payloads,
        analysis.total_payloads,
        analysis.block_ratio * 100.0
    ));
    for hit in &analysis.signature_hits {
        out.push_str(&format!(
            "- {} scored {:.1}: {}\n",
            hit.waf_name,
            hit.confidence,
            hit.indicators.join(", ")
        ));
    }
    for error in &analysis.errors {
        out.push_str(&format!("- error: {}\n", error));
    }
    out.push('\n');

    for (title, items) in [
        ("Known Weaknesses", result.weaknesses()),
        ("Bypass Techniques", result.bypass_techniques()),
        ("Recommendations", result.recommendations()),
    ] {
        if items.is_empty() {
            continue;
        }
        out.push_str(&format!("## {}\n\n", title));
        for item in items {
            out.push_str(&format!("- {}\n", item));
        }
        out.push('\n');
    }

    out
}

fn human_catalog(catalog: &ScriptCatalog) -> String {
    let mut out = format!(
        "{} scripts in {}\n\n",
        catalog.len(),
        catalog.directory().display()
    );
    for entry in catalog.entries() {
        out.push_str(entry);
        out.push('\n');
    }
    out
}

fn human_signatures(signatures: &[WafSignature], categories: &[PayloadCategory]) -> String {
    let mut out = String::from("| Type | Name | Indicators |\n|------|------|------------|\n");
    for signature in signatures {
        out.push_str(&format!(
            "| {} | {} | {} |\n",
            signature.key,
            signature.name,
            signature.indicator_count()
        ));
    }
    out.push_str("\nPayload categories:\n");
    for category in categories {
        out.push_str(&format!("- {} ({} payloads)\n", category.name, category.payloads.len()));
    }
    out
}

fn human_managed_scans(scans: &[ManagedScan]) -> String {
    if scans.is_empty() {
        return "No scans defined.\n".to_string();
    }
    let mut out = String::from("| ID | Name | Status |\n|----|------|--------|\n");
    for scan in scans {
        out.push_str(&format!("| {} | {} | {} |\n", scan.id, scan.name, scan.status));
    }
    out
}

fn human_policies(policies: &[PolicyTemplate]) -> String {
    let mut out = String::new();
    for policy in policies {
        out.push_str(&format!("{}  {}\n", policy.uuid, policy.title));
    }
    out
}

fn human_action(action: &ActionReport) -> String {
    let mut out = format!(
        "{} scan {} ({}), previously {}\n",
        action.action, action.scan_id, action.scan_name, action.previous_status
    );
    if let Some(job) = &action.job_id {
        out.push_str(&format!("Job: {}\n", job));
    }
    out
}

fn human_runs(runs: &[RunSummary]) -> String {
    if runs.is_empty() {
        return "No saved runs.\n".to_string();
    }
    let mut out = String::new();
    for run in runs {
        out.push_str(&format!(
            "{:<6} {}  {}{}\n",
            run.kind.map(|k| k.as_str()).unwrap_or("?"),
            run.modified_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
            run.folder.display(),
            if run.has_report { "" } else { "  (no report)" }
        ));
    }
    out
}

pub fn create_report_generator(config: &AppConfig) -> Box<dyn ReportGenerator> {
    Box::new(DefaultReportGenerator::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waf_signatures::{signatures, TEST_PAYLOADS};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn generator() -> DefaultReportGenerator {
        DefaultReportGenerator::new(&AppConfig::default())
    }

    #[test]
    fn test_signature_listing() {
        let text = generator()
            .render(&Report::Signatures(signatures(), TEST_PAYLOADS), "human")
            .unwrap();
        assert!(text.contains("| cloudflare | Cloudflare | 7 |"));
        assert!(text.contains("- sql_injection (5 payloads)"));
    }

    #[test]
    fn test_catalog_json() {
        let catalog = ScriptCatalog::from_entries(
            Path::new("/opt/scripts"),
            ["http-title.nse", "ssh-hostkey.nse"],
        );
        let json = generator().render(&Report::Catalog(&catalog), "JSON").unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["entries"][1], "ssh-hostkey.nse");
    }

    #[test]
    fn test_action_and_unknown_format() {
        let action = ActionReport {
            scan_id: 4,
            scan_name: "weekly".to_string(),
            action: "launch",
            previous_status: "completed".to_string(),
            job_id: Some("abc".to_string()),
        };
        let text = generator().render(&Report::Action(&action), "human").unwrap();
        assert!(text.starts_with("launch scan 4 (weekly)"));
        assert!(text.contains("Job: abc"));

        let err = generator().render(&Report::Action(&action), "yaml").unwrap_err();
        assert_eq!(err.code(), "OUTPUT_ERROR");
    }

    #[tokio::test]
    async fn test_emit_to_file() {
        let dir = TempDir::new().unwrap();
        let path: PathBuf = dir.path().join("nested/report.txt");
        generator().emit("hello", Some(&path)).await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "hello");
    }
}
