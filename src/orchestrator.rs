//! Reconnaissance orchestration
//!
//! Drives one run through the phase machine: OS fingerprint and port
//! discovery (concurrently), parsing, script matching and budgeted script
//! execution. Phase and script failures are folded into the report; only an
//! invalid target, a missing catalog or a zero budget abort the run.

use futures::stream::{self, StreamExt};
use std::{path::Path, sync::Arc, time::Duration};
use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    budget::{phase_deadline, Allocation, BudgetAllocator},
    catalog::ScriptCatalog,
    config::AppConfig,
    core::{
        EventBus, OrchestrationState, PortScriptResults, ProbeOutcome, ProbeStatus, ScanEvent,
        ScanReport, ScanReportBuilder, ScanWarning, ScriptMatch, WarningKind,
    },
    error::{Result, ScannerError},
    logging::ScanLogger,
    matcher::ScriptMatcher,
    parser::{DocumentLimits, ResultParser},
    persistence::{FileBasedDataStore, RunKind, ScanDataStore},
    probe::{ProbeCommand, ProbeRunner, ProcessProbeExecutor},
    target::Target,
};

const OS_DOCUMENT: &str = "os_scan.xml";
const PORT_DOCUMENT: &str = "port_scan.xml";

/// Outcome of one port's script run
#[derive(Debug, Default)]
struct PortRun {
    results: Option<PortScriptResults>,
    warnings: Vec<ScanWarning>,
    budget_exhausted: bool,
}

pub struct ReconOrchestrator {
    config: Arc<AppConfig>,
    runner: ProbeRunner,
    parser: ResultParser,
    matcher: ScriptMatcher,
    store: Arc<dyn ScanDataStore>,
    event_bus: Arc<EventBus>,
}

impl ReconOrchestrator {
    pub fn new(
        config: Arc<AppConfig>,
        runner: ProbeRunner,
        store: Arc<dyn ScanDataStore>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        let parser = ResultParser::new(DocumentLimits::from(&config.parser));
        let matcher = ScriptMatcher::new(config.matching.max_scripts_per_port);
        Self {
            config,
            runner,
            parser,
            matcher,
            store,
            event_bus,
        }
    }

    /// Run a full reconnaissance scan of `target` within `total_budget`
    pub async fn run_recon_scan(&self, target: &str, total_budget: Duration) -> Result<ScanReport> {
        let scan_id = Uuid::new_v4();
        let started = Instant::now();

        match self.execute(scan_id, target, total_budget, started).await {
            Ok(report) => {
                crate::log_scan_complete!("recon", report.target(), report.duration(), report.open_ports().len());
                crate::metrics::record_scan_completed("recon", report.duration(), report.open_ports().len());
                self.event_bus
                    .publish(ScanEvent::ScanCompleted {
                        scan_id,
                        open_ports: report.open_ports().len(),
                        duration: report.duration(),
                    })
                    .await;
                Ok(report)
            }
            Err(error) => {
                crate::log_error_with_context!(error, format!("recon scan of {}", target));
                crate::metrics::record_scan_aborted("recon", &error);
                self.event_bus
                    .publish(ScanEvent::ScanAborted {
                        scan_id,
                        error: error.clone(),
                    })
                    .await;
                Err(error)
            }
        }
    }

    async fn execute(&self, scan_id: Uuid, raw_target: &str, total_budget: Duration, started: Instant) -> Result<ScanReport> {
        let target = Target::parse(raw_target)?;
        if total_budget.is_zero() {
            return Err(ScannerError::budget_exhausted(
                "total budget is zero; no phase can start",
            ));
        }
        let deadline = started + total_budget;

        crate::log_scan_start!("recon", target);
        let scan_logger = ScanLogger::new(scan_id.to_string(), "recon".to_string(), target.to_string());

        let catalog = ScriptCatalog::load(
            &self.config.probe.script_dir,
            &self.config.probe.script_extension,
        )
        .await?;

        let mut report = ScanReportBuilder::new(scan_id, target.clone(), total_budget);
        let folder = self.prepare_folder(scan_id, &target, &mut report).await;
        report.set_scan_folder(folder.clone());

        let host = target.probe_host();
        let nmap = self.config.probe.nmap_path.as_str();

        // Mandatory phases run side by side; neither may abort the run.
        let phase_started = Instant::now();
        scan_logger.log_phase_start("discovery");
        self.advance(&mut report, OrchestrationState::OsScanning).await?;
        self.advance(&mut report, OrchestrationState::PortScanning).await?;

        let os_command = ProbeCommand::os_scan(nmap, &host, &folder.join(OS_DOCUMENT));
        let port_command = ProbeCommand::port_scan(nmap, &host, &folder.join(PORT_DOCUMENT));
        let os_deadline = clamp_to(phase_deadline(self.config.os_scan_timeout(), total_budget), deadline);
        let port_deadline = clamp_to(phase_deadline(self.config.port_scan_timeout(), total_budget), deadline);

        let (os_outcome, port_outcome) = tokio::join!(
            self.runner.run(&os_command, os_deadline),
            self.runner.run(&port_command, port_deadline),
        );
        scan_logger.log_phase_complete("discovery", phase_started.elapsed());

        if let Some(warning) = phase_warning(OrchestrationState::OsScanning, &os_outcome) {
            self.record_warning(&mut report, warning).await;
        }
        if let Some(warning) = phase_warning(OrchestrationState::PortScanning, &port_outcome) {
            self.record_warning(&mut report, warning).await;
        }
        report.set_os_scan(os_outcome);
        report.set_port_scan(port_outcome);

        // A failed probe may still have written a partial document.
        self.collect_os_guesses(&mut report, &folder.join(OS_DOCUMENT)).await;
        self.advance(&mut report, OrchestrationState::PortsParsed).await?;
        self.collect_open_ports(&mut report, &folder.join(PORT_DOCUMENT)).await;

        for record in report.open_ports().to_vec() {
            crate::log_port_discovery!(host, record.port, record.state.as_str(), record.service.as_deref());
            self.event_bus
                .publish(ScanEvent::PortDiscovered {
                    scan_id,
                    host: host.clone(),
                    record,
                })
                .await;
        }

        self.advance(&mut report, OrchestrationState::ScriptMatching).await?;
        let matched = self.matcher.match_ports(report.open_ports(), &catalog);
        for warning in matched.warnings {
            self.record_warning(&mut report, warning).await;
        }
        report.set_script_matches(matched.matches.clone());

        self.advance(&mut report, OrchestrationState::ScriptExecuting).await?;
        let phase_started = Instant::now();
        scan_logger.log_phase_start("script_execution");

        let budget = BudgetAllocator::new(
            total_budget,
            self.config.reserved_time(),
            self.config.max_script_timeout(),
        );
        let total_ports = matched.matches.len();
        let runs: Vec<PortRun> = stream::iter(matched.matches.into_iter())
            .map(|script_match| self.run_port_scripts(scan_id, &host, script_match, &budget, deadline))
            .buffered(self.config.performance.max_concurrent_ports.max(1))
            .collect()
            .await;

        for (index, run) in runs.into_iter().enumerate() {
            scan_logger.log_progress(index + 1, total_ports, "script_execution");
            if run.budget_exhausted {
                report.mark_budget_exhausted();
            }
            for warning in run.warnings {
                self.record_warning(&mut report, warning).await;
            }
            if let Some(results) = run.results {
                report.push_script_results(results);
            }
        }

        let snapshot = budget.snapshot().await;
        tracing::debug!(
            scan_id = %scan_id,
            pool_ms = snapshot.pool.as_millis() as u64,
            allocated_ms = snapshot.allocated.as_millis() as u64,
            consumed_ms = snapshot.consumed.as_millis() as u64,
            "Script budget settled"
        );
        scan_logger.log_phase_complete("script_execution", phase_started.elapsed());

        let final_report = report.finish()?;
        self.event_bus
            .publish(ScanEvent::StateChanged {
                scan_id,
                state: OrchestrationState::Completed,
            })
            .await;

        if self.config.persistence.auto_save {
            if let Err(e) = self.store.store_scan_report(&final_report).await {
                crate::log_error_with_context!(e, "saving scan report");
            }
        }

        Ok(final_report)
    }

    async fn advance(&self, report: &mut ScanReportBuilder, state: OrchestrationState) -> Result<()> {
        report.transition(state)?;
        tracing::debug!(state = state.as_str(), "Orchestration state changed");
        self.event_bus
            .publish(ScanEvent::StateChanged {
                scan_id: report.id(),
                state,
            })
            .await;
        Ok(())
    }

    async fn record_warning(&self, report: &mut ScanReportBuilder, warning: ScanWarning) {
        tracing::warn!(
            phase = warning.phase.as_str(),
            port = warning.port,
            "{}",
            warning.message
        );
        self.event_bus
            .publish(ScanEvent::Warning {
                scan_id: report.id(),
                warning: warning.clone(),
            })
            .await;
        report.warn(warning);
    }

    /// Run folder under the result root, or a temporary one when it cannot be created
    async fn prepare_folder(&self, scan_id: Uuid, target: &Target, report: &mut ScanReportBuilder) -> std::path::PathBuf {
        match self.store.create_scan_folder(RunKind::Recon, target, scan_id).await {
            Ok(folder) => folder,
            Err(e) => {
                let fallback = std::env::temp_dir().join(FileBasedDataStore::folder_name(
                    RunKind::Recon,
                    target,
                    chrono::Utc::now(),
                    scan_id,
                ));
                if let Err(io) = tokio::fs::create_dir_all(&fallback).await {
                    tracing::debug!("Fallback folder {} unavailable: {}", fallback.display(), io);
                }
                self.record_warning(
                    report,
                    ScanWarning::new(
                        OrchestrationState::Validated,
                        WarningKind::Persistence,
                        format!("Result folder unavailable ({}); using {}", e, fallback.display()),
                    ),
                )
                .await;
                fallback
            }
        }
    }

    async fn collect_os_guesses(&self, report: &mut ScanReportBuilder, path: &Path) {
        let phase = OrchestrationState::OsScanning;
        if tokio::fs::metadata(path).await.is_err() {
            self.record_warning(
                report,
                ScanWarning::new(phase, WarningKind::MissingDocument, "OS scan produced no result document"),
            )
            .await;
            return;
        }

        let parsed = match self.parser.load(path).await {
            Ok(document) => self.parser.parse_os_guesses(&document),
            Err(e) => Err(e),
        };
        match parsed {
            Ok(parsed) => {
                for warning in parsed.warnings {
                    self.record_warning(report, warning).await;
                }
                report.set_os_guesses(parsed.guesses);
            }
            Err(e) => {
                self.record_warning(
                    report,
                    ScanWarning::new(phase, WarningKind::MalformedDocument, e.to_string()),
                )
                .await;
            }
        }
    }

    async fn collect_open_ports(&self, report: &mut ScanReportBuilder, path: &Path) {
        let phase = OrchestrationState::PortsParsed;
        if tokio::fs::metadata(path).await.is_err() {
            self.record_warning(
                report,
                ScanWarning::new(phase, WarningKind::MissingDocument, "Port scan produced no result document"),
            )
            .await;
            return;
        }

        let parsed = match self.parser.load(path).await {
            Ok(document) => self.parser.parse_ports(&document),
            Err(e) => Err(e),
        };
        match parsed {
            Ok(parsed) => {
                let open_ports = parsed.open_ports();
                for warning in parsed.warnings {
                    self.record_warning(report, warning).await;
                }
                tracing::info!("Port scan found {} open ports", open_ports.len());
                report.set_open_ports(open_ports);
            }
            Err(e) => {
                self.record_warning(
                    report,
                    ScanWarning::new(phase, WarningKind::MalformedDocument, e.to_string()),
                )
                .await;
            }
        }
    }

    /// Sequentially run one port's scripts against its share of the budget
    async fn run_port_scripts(
        &self,
        scan_id: Uuid,
        host: &str,
        script_match: ScriptMatch,
        budget: &BudgetAllocator,
        deadline: Instant,
    ) -> PortRun {
        let phase = OrchestrationState::ScriptExecuting;
        let mut run = PortRun::default();
        let port = script_match.port;

        let allocation = match budget.allocate(script_match.scripts.len()).await {
            Allocation::Granted(allocation) => allocation,
            Allocation::Exhausted { first } => {
                run.budget_exhausted = true;
                if first {
                    crate::metrics::record_budget_exhausted();
                    run.warnings.push(ScanWarning::new(
                        phase,
                        WarningKind::BudgetExhausted,
                        "global timeout reached",
                    ));
                }
                tracing::debug!(port, "Skipping port; script budget exhausted");
                return run;
            }
        };

        if allocation.granted < allocation.requested {
            run.budget_exhausted = true;
            run.warnings.push(ScanWarning::for_port(
                phase,
                WarningKind::BudgetExhausted,
                port,
                format!(
                    "Budget covered {} of {} scripts on port {}",
                    allocation.granted, allocation.requested, port
                ),
            ));
        }

        tracing::info!(
            port,
            scripts = allocation.granted,
            per_script_ms = allocation.per_script.as_millis() as u64,
            "Running scripts for port {}",
            port
        );

        let nmap = self.config.probe.nmap_path.as_str();
        let mut outcomes = Vec::with_capacity(allocation.granted);
        for script in script_match.scripts.iter().take(allocation.granted) {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                run.warnings.push(ScanWarning::for_port(
                    phase,
                    WarningKind::DeadlineReached,
                    port,
                    format!("Overall deadline reached before {} on port {}", script, port),
                ));
                break;
            }

            let command = ProbeCommand::script(nmap, host, port, script_match.protocol, script);
            let outcome = self
                .runner
                .run(&command, allocation.per_script.min(left))
                .await;
            budget.record_consumed(outcome.elapsed).await;

            if let Some(kind) = failure_kind(&outcome) {
                run.warnings.push(ScanWarning::for_port(
                    phase,
                    kind,
                    port,
                    format!(
                        "{} on port {}: {}",
                        outcome.name,
                        port,
                        outcome.error.as_deref().unwrap_or(outcome.status.as_str())
                    ),
                ));
            }

            self.event_bus
                .publish(ScanEvent::ScriptCompleted {
                    scan_id,
                    port,
                    outcome: outcome.clone(),
                })
                .await;
            outcomes.push(outcome);
        }

        if !outcomes.is_empty() {
            run.results = Some(PortScriptResults {
                port,
                protocol: script_match.protocol,
                service: script_match.service,
                per_script_timeout: allocation.per_script,
                outcomes,
            });
        }
        run
    }
}

/// Never hand a probe more time than the run has left
fn clamp_to(requested: Duration, deadline: Instant) -> Duration {
    requested.min(deadline.saturating_duration_since(Instant::now()))
}

fn failure_kind(outcome: &ProbeOutcome) -> Option<WarningKind> {
    match outcome.status {
        ProbeStatus::Success => None,
        ProbeStatus::ToolError => Some(WarningKind::ToolError),
        ProbeStatus::Timeout => Some(WarningKind::Timeout),
    }
}

fn phase_warning(phase: OrchestrationState, outcome: &ProbeOutcome) -> Option<ScanWarning> {
    failure_kind(outcome).map(|kind| {
        ScanWarning::new(
            phase,
            kind,
            format!(
                "{} failed: {}",
                outcome.name,
                outcome.error.as_deref().unwrap_or(outcome.status.as_str())
            ),
        )
    })
}

/// Factory wiring the orchestrator to real child processes
pub fn create_orchestrator(
    config: Arc<AppConfig>,
    store: Arc<dyn ScanDataStore>,
    event_bus: Arc<EventBus>,
) -> ReconOrchestrator {
    let runner = ProbeRunner::new(Arc::new(ProcessProbeExecutor));
    ReconOrchestrator::new(config, runner, store, event_bus)
}
