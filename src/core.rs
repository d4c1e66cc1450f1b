//! Core application framework and shared data model
//!
//! Holds the types every component exchanges (port records, probe outcomes,
//! script matches, the aggregated scan report), the orchestration state
//! machine, the in-process event bus and the `Application` that wires the
//! components together.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::{
    catalog::ScriptCatalog,
    cli::{Cli, Command, SessionCommand},
    config::AppConfig,
    error::{Result, ScannerError},
    metrics::MetricsCollector,
    orchestrator::ReconOrchestrator,
    persistence::ScanDataStore,
    reporting::{Report, ReportGenerator},
    session::{NessusClient, ScanAction, SessionController},
    target::Target,
    waf_detection::WafDetector,
    waf_signatures::{signatures, TEST_PAYLOADS},
};

/// Transport protocol of a discovered port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// Unrecognized protocols yield `None` and are discarded by callers
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tcp" => Some(Self::Tcp),
            "udp" => Some(Self::Udp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortState {
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "closed")]
    Closed,
    #[serde(rename = "filtered")]
    Filtered,
    #[serde(rename = "open|filtered")]
    OpenFiltered,
    #[serde(rename = "unknown")]
    Unknown,
}

impl PortState {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "open" => Self::Open,
            "closed" => Self::Closed,
            "filtered" => Self::Filtered,
            "open|filtered" => Self::OpenFiltered,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Filtered => "filtered",
            Self::OpenFiltered => "open|filtered",
            Self::Unknown => "unknown",
        }
    }

    /// States retained downstream of the parser
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open | Self::OpenFiltered)
    }
}

/// One port entry from a result document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRecord {
    pub port: u16,
    pub protocol: Protocol,
    pub state: PortState,
    pub service: Option<String>,
}

impl PortRecord {
    pub fn new(port: u16, protocol: Protocol, state: PortState, service: Option<&str>) -> Self {
        Self {
            port,
            protocol,
            state,
            service: service
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(canonicalize_service),
        }
    }
}

/// Substring rules applied in priority order; the first hit wins.
const SERVICE_CANONICAL_RULES: &[(&str, &str)] = &[
    ("postgresql", "pgsql"),
    ("nfs", "nfs"),
    ("rpc", "rpc"),
    ("ajp", "ajp"),
];

/// Lowercase a service token and fold known families onto their script prefix
pub fn canonicalize_service(token: &str) -> String {
    let lower = token.trim().to_lowercase();
    SERVICE_CANONICAL_RULES
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(lower)
}

/// One operating-system classification reported by the OS phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsGuess {
    /// Lowercased family followed by lowercased generation, e.g. `linux5.x`
    pub name: String,
    pub family: String,
    pub generation: Option<String>,
    pub vendor: Option<String>,
    pub device_type: String,
    pub accuracy: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Success,
    ToolError,
    Timeout,
}

impl ProbeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::ToolError => "tool_error",
            Self::Timeout => "timeout",
        }
    }
}

/// Tagged result of a single probe invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    /// Script or phase name
    pub name: String,
    pub status: ProbeStatus,
    /// Captured standard output on success
    pub output: Option<String>,
    /// Diagnostic text on failure
    pub error: Option<String>,
    /// Hard deadline the probe ran under
    pub deadline: Duration,
    pub elapsed: Duration,
}

impl ProbeOutcome {
    pub fn success<S: Into<String>>(name: S, output: String, deadline: Duration, elapsed: Duration) -> Self {
        Self {
            name: name.into(),
            status: ProbeStatus::Success,
            output: Some(output),
            error: None,
            deadline,
            elapsed,
        }
    }

    pub fn tool_error<S: Into<String>>(name: S, error: String, deadline: Duration, elapsed: Duration) -> Self {
        Self {
            name: name.into(),
            status: ProbeStatus::ToolError,
            output: None,
            error: Some(error),
            deadline,
            elapsed,
        }
    }

    pub fn timeout<S: Into<String>>(name: S, deadline: Duration, elapsed: Duration) -> Self {
        Self {
            name: name.into(),
            status: ProbeStatus::Timeout,
            output: None,
            error: Some(format!("deadline of {}s exceeded", deadline.as_secs_f64())),
            deadline,
            elapsed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ProbeStatus::Success
    }
}

/// Scripts selected for one open port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptMatch {
    pub port: u16,
    pub protocol: Protocol,
    pub service: String,
    pub scripts: Vec<String>,
}

/// Ordered script outcomes for one port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortScriptResults {
    pub port: u16,
    pub protocol: Protocol,
    pub service: String,
    pub per_script_timeout: Duration,
    pub outcomes: Vec<ProbeOutcome>,
}

/// Orchestration state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationState {
    Validated,
    OsScanning,
    PortScanning,
    PortsParsed,
    ScriptMatching,
    ScriptExecuting,
    Completed,
    Aborted,
}

impl OrchestrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validated => "validated",
            Self::OsScanning => "os_scanning",
            Self::PortScanning => "port_scanning",
            Self::PortsParsed => "ports_parsed",
            Self::ScriptMatching => "script_matching",
            Self::ScriptExecuting => "script_executing",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }

    /// Forward edges of the machine; `Aborted` is reachable from any live state
    pub fn can_transition_to(&self, next: OrchestrationState) -> bool {
        use OrchestrationState::*;
        match (self, next) {
            (Completed | Aborted, _) => false,
            (_, Aborted) => true,
            (Validated, OsScanning)
            | (OsScanning, PortScanning)
            | (PortScanning, PortsParsed)
            | (PortsParsed, ScriptMatching)
            | (ScriptMatching, ScriptExecuting)
            | (ScriptExecuting, Completed) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    ToolError,
    Timeout,
    MissingDocument,
    MalformedDocument,
    MalformedEntry,
    DocumentTruncated,
    EntryLimitReached,
    ScriptCapExceeded,
    BudgetExhausted,
    DeadlineReached,
    Persistence,
}

/// Non-fatal condition recorded in a report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanWarning {
    pub phase: OrchestrationState,
    pub kind: WarningKind,
    pub port: Option<u16>,
    pub message: String,
}

impl ScanWarning {
    pub fn new<S: Into<String>>(phase: OrchestrationState, kind: WarningKind, message: S) -> Self {
        Self {
            phase,
            kind,
            port: None,
            message: message.into(),
        }
    }

    pub fn for_port<S: Into<String>>(
        phase: OrchestrationState,
        kind: WarningKind,
        port: u16,
        message: S,
    ) -> Self {
        Self {
            phase,
            kind,
            port: Some(port),
            message: message.into(),
        }
    }
}

/// Aggregated, finalized result of one reconnaissance run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    id: Uuid,
    target: Target,
    final_state: OrchestrationState,
    state_trace: Vec<OrchestrationState>,
    budget_exhausted: bool,
    os_scan: Option<ProbeOutcome>,
    port_scan: Option<ProbeOutcome>,
    os_guesses: Vec<OsGuess>,
    open_ports: Vec<PortRecord>,
    script_matches: Vec<ScriptMatch>,
    script_results: Vec<PortScriptResults>,
    warnings: Vec<ScanWarning>,
    total_budget: Duration,
    scan_folder: Option<PathBuf>,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
    duration: Duration,
}

impl ScanReport {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn final_state(&self) -> OrchestrationState {
        self.final_state
    }

    pub fn state_trace(&self) -> &[OrchestrationState] {
        &self.state_trace
    }

    pub fn budget_exhausted(&self) -> bool {
        self.budget_exhausted
    }

    pub fn os_scan(&self) -> Option<&ProbeOutcome> {
        self.os_scan.as_ref()
    }

    pub fn port_scan(&self) -> Option<&ProbeOutcome> {
        self.port_scan.as_ref()
    }

    pub fn os_guesses(&self) -> &[OsGuess] {
        &self.os_guesses
    }

    pub fn open_ports(&self) -> &[PortRecord] {
        &self.open_ports
    }

    /// Port number to service token, in discovery order
    pub fn open_port_map(&self) -> Vec<(u16, Option<&str>)> {
        self.open_ports
            .iter()
            .map(|r| (r.port, r.service.as_deref()))
            .collect()
    }

    pub fn script_matches(&self) -> &[ScriptMatch] {
        &self.script_matches
    }

    pub fn script_results(&self) -> &[PortScriptResults] {
        &self.script_results
    }

    pub fn outcomes_for_port(&self, port: u16) -> Option<&[ProbeOutcome]> {
        self.script_results
            .iter()
            .find(|r| r.port == port)
            .map(|r| r.outcomes.as_slice())
    }

    pub fn warnings(&self) -> &[ScanWarning] {
        &self.warnings
    }

    pub fn total_budget(&self) -> Duration {
        self.total_budget
    }

    pub fn scan_folder(&self) -> Option<&PathBuf> {
        self.scan_folder.as_ref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn completed_at(&self) -> DateTime<Utc> {
        self.completed_at
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}

/// Mutable accumulator for a report while the orchestration runs
#[derive(Debug)]
pub(crate) struct ScanReportBuilder {
    id: Uuid,
    target: Target,
    state: OrchestrationState,
    state_trace: Vec<OrchestrationState>,
    budget_exhausted: bool,
    os_scan: Option<ProbeOutcome>,
    port_scan: Option<ProbeOutcome>,
    os_guesses: Vec<OsGuess>,
    open_ports: Vec<PortRecord>,
    script_matches: Vec<ScriptMatch>,
    script_results: Vec<PortScriptResults>,
    warnings: Vec<ScanWarning>,
    total_budget: Duration,
    scan_folder: Option<PathBuf>,
    started_at: DateTime<Utc>,
    started: std::time::Instant,
}

impl ScanReportBuilder {
    pub(crate) fn new(id: Uuid, target: Target, total_budget: Duration) -> Self {
        Self {
            id,
            target,
            state: OrchestrationState::Validated,
            state_trace: vec![OrchestrationState::Validated],
            budget_exhausted: false,
            os_scan: None,
            port_scan: None,
            os_guesses: Vec::new(),
            open_ports: Vec::new(),
            script_matches: Vec::new(),
            script_results: Vec::new(),
            warnings: Vec::new(),
            total_budget,
            scan_folder: None,
            started_at: Utc::now(),
            started: std::time::Instant::now(),
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn transition(&mut self, next: OrchestrationState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ScannerError::internal(
                "state machine",
                format!("illegal transition {} -> {}", self.state.as_str(), next.as_str()),
            ));
        }
        self.state = next;
        self.state_trace.push(next);
        Ok(())
    }

    pub(crate) fn warn(&mut self, warning: ScanWarning) {
        self.warnings.push(warning);
    }

    pub(crate) fn mark_budget_exhausted(&mut self) {
        self.budget_exhausted = true;
    }

    pub(crate) fn set_scan_folder(&mut self, folder: PathBuf) {
        self.scan_folder = Some(folder);
    }

    pub(crate) fn set_os_scan(&mut self, outcome: ProbeOutcome) {
        self.os_scan = Some(outcome);
    }

    pub(crate) fn set_port_scan(&mut self, outcome: ProbeOutcome) {
        self.port_scan = Some(outcome);
    }

    pub(crate) fn set_os_guesses(&mut self, guesses: Vec<OsGuess>) {
        self.os_guesses = guesses;
    }

    pub(crate) fn set_open_ports(&mut self, ports: Vec<PortRecord>) {
        self.open_ports = ports;
    }

    pub(crate) fn open_ports(&self) -> &[PortRecord] {
        &self.open_ports
    }

    pub(crate) fn set_script_matches(&mut self, matches: Vec<ScriptMatch>) {
        self.script_matches = matches;
    }

    pub(crate) fn push_script_results(&mut self, results: PortScriptResults) {
        self.script_results.push(results);
    }

    pub(crate) fn finish(mut self) -> Result<ScanReport> {
        self.transition(OrchestrationState::Completed)?;
        Ok(ScanReport {
            id: self.id,
            target: self.target,
            final_state: self.state,
            state_trace: self.state_trace,
            budget_exhausted: self.budget_exhausted,
            os_scan: self.os_scan,
            port_scan: self.port_scan,
            os_guesses: self.os_guesses,
            open_ports: self.open_ports,
            script_matches: self.script_matches,
            script_results: self.script_results,
            warnings: self.warnings,
            total_budget: self.total_budget,
            scan_folder: self.scan_folder,
            started_at: self.started_at,
            completed_at: Utc::now(),
            duration: self.started.elapsed(),
        })
    }
}

/// Events published while an orchestration runs
#[derive(Debug, Clone)]
pub enum ScanEvent {
    StateChanged {
        scan_id: Uuid,
        state: OrchestrationState,
    },
    PortDiscovered {
        scan_id: Uuid,
        host: String,
        record: PortRecord,
    },
    ScriptCompleted {
        scan_id: Uuid,
        port: u16,
        outcome: ProbeOutcome,
    },
    Warning {
        scan_id: Uuid,
        warning: ScanWarning,
    },
    ScanCompleted {
        scan_id: Uuid,
        open_ports: usize,
        duration: Duration,
    },
    ScanAborted {
        scan_id: Uuid,
        error: ScannerError,
    },
}

/// Event bus for inter-component communication
pub struct EventBus {
    subscribers: RwLock<Vec<mpsc::Sender<ScanEvent>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub async fn subscribe(&self) -> mpsc::Receiver<ScanEvent> {
        let (tx, rx) = mpsc::channel(1000);
        self.subscribers.write().await.push(tx);
        rx
    }

    pub async fn publish(&self, event: ScanEvent) {
        let mut subscribers = self.subscribers.write().await;
        subscribers.retain(|sender| !sender.is_closed());
        for sender in subscribers.iter() {
            if sender.send(event.clone()).await.is_err() {
                tracing::debug!("Event subscriber disconnected");
            }
        }
    }
}

/// Wires the components together and dispatches CLI commands
pub struct Application {
    config: Arc<AppConfig>,
    orchestrator: ReconOrchestrator,
    waf_detector: WafDetector,
    report_generator: Box<dyn ReportGenerator>,
    data_store: Arc<dyn ScanDataStore>,
    metrics: MetricsCollector,
    event_bus: Arc<EventBus>,
}

impl Application {
    /// Create a new application instance with default implementations
    pub async fn new(config: AppConfig) -> Result<Self> {
        let config = Arc::new(config);
        let event_bus = Arc::new(EventBus::new());

        let data_store = crate::persistence::create_data_store(&config).await?;
        let orchestrator =
            crate::orchestrator::create_orchestrator(config.clone(), data_store.clone(), event_bus.clone());
        let waf_detector = crate::waf_detection::create_waf_detector(config.clone(), data_store.clone()).await?;
        let report_generator = crate::reporting::create_report_generator(&config);

        Ok(Self {
            config,
            orchestrator,
            waf_detector,
            report_generator,
            data_store,
            metrics: MetricsCollector::new(),
            event_bus,
        })
    }

    /// Run the application with CLI arguments
    pub async fn run(&self, cli: Cli) -> Result<()> {
        tracing::info!(command = cli.command_name(), "Starting application run");

        if cli.needs_privileges() {
            warn_if_unprivileged();
        }

        let format = cli
            .format
            .map(|f| f.to_string())
            .unwrap_or_else(|| self.config.output.default_format.clone());
        let output = cli.output.as_deref();

        match &cli.command {
            Command::Scan(args) => {
                let budget = Duration::from_secs(
                    args.timeout.unwrap_or(self.config.budget.default_total_timeout_secs),
                );
                let report = self.run_scan(&args.target, budget).await?;
                self.print(&Report::Scan(&report), &format, output).await?;
            }
            Command::Waf(args) => {
                let budget = Duration::from_secs(
                    args.timeout.unwrap_or(self.config.waf.default_total_timeout_secs),
                );
                let result = self
                    .waf_detector
                    .detect_waf(&args.target, budget, args.intensive)
                    .await?;
                self.print(&Report::Waf(&result), &format, output).await?;
            }
            Command::Scripts => {
                let catalog = ScriptCatalog::load(
                    &self.config.probe.script_dir,
                    &self.config.probe.script_extension,
                )
                .await?;
                self.print(&Report::Catalog(&catalog), &format, output).await?;
            }
            Command::Signatures => {
                self.print(&Report::Signatures(signatures(), TEST_PAYLOADS), &format, output)
                    .await?;
            }
            Command::Runs => {
                let runs = self.data_store.list_runs().await?;
                self.print(&Report::Runs(&runs), &format, output).await?;
            }
            Command::Show { path } => self.show_saved(path, &format, output).await?,
            Command::Session { action } => self.run_session(*action, &format, output).await?,
        }

        tracing::info!("Application run completed successfully");
        Ok(())
    }

    async fn run_scan(&self, target: &str, budget: Duration) -> Result<ScanReport> {
        let events = self.event_bus.subscribe().await;
        let (report, ()) = tokio::join!(
            self.orchestrator.run_recon_scan(target, budget),
            self.handle_events(events)
        );

        let stats = self.metrics.get_scan_stats();
        tracing::info!(
            ports = stats.ports_discovered,
            scripts = stats.scripts_run,
            script_failures = stats.script_failures,
            warnings = stats.warnings,
            "Run summary"
        );
        report
    }

    /// Log orchestration events until the run reaches a terminal state
    async fn handle_events(&self, mut receiver: mpsc::Receiver<ScanEvent>) {
        while let Some(event) = receiver.recv().await {
            self.metrics.observe(&event);
            match event {
                ScanEvent::StateChanged { scan_id, state } => {
                    tracing::info!(scan_id = %scan_id, state = state.as_str(), "Phase transition");
                }
                ScanEvent::PortDiscovered { .. } => {}
                ScanEvent::ScriptCompleted { scan_id, port, outcome } => {
                    if !outcome.is_success() {
                        tracing::debug!(
                            scan_id = %scan_id,
                            port,
                            script = %outcome.name,
                            status = outcome.status.as_str(),
                            "Script did not succeed"
                        );
                    }
                }
                ScanEvent::Warning { scan_id, warning } => {
                    tracing::debug!(scan_id = %scan_id, kind = ?warning.kind, "Warning recorded");
                }
                ScanEvent::ScanCompleted { scan_id, .. } | ScanEvent::ScanAborted { scan_id, .. } => {
                    tracing::debug!("Terminal event received for scan {}", scan_id);
                    break;
                }
            }
        }
    }

    async fn show_saved(&self, path: &Path, format: &str, output: Option<&Path>) -> Result<()> {
        match self.data_store.load_scan_report(path).await {
            Ok(report) => self.print(&Report::Scan(&report), format, output).await,
            Err(scan_error) => match self.data_store.load_waf_result(path).await {
                Ok(result) => self.print(&Report::Waf(&result), format, output).await,
                Err(_) => Err(scan_error),
            },
        }
    }

    async fn run_session(&self, command: SessionCommand, format: &str, output: Option<&Path>) -> Result<()> {
        let client = NessusClient::connect(&self.config.session).await?;
        let controller = SessionController::new(Arc::new(client));

        let outcome = match command {
            SessionCommand::List => {
                let scans = controller.list_scans().await?;
                self.print(&Report::ManagedScans(&scans), format, output).await
            }
            SessionCommand::Policies => {
                let policies = controller.list_policies().await?;
                self.print(&Report::Policies(&policies), format, output).await
            }
            SessionCommand::Launch { id } => self.session_action(&controller, ScanAction::Launch, id, format, output).await,
            SessionCommand::Pause { id } => self.session_action(&controller, ScanAction::Pause, id, format, output).await,
            SessionCommand::Resume { id } => self.session_action(&controller, ScanAction::Resume, id, format, output).await,
            SessionCommand::Stop { id } => self.session_action(&controller, ScanAction::Stop, id, format, output).await,
        };

        if let Err(e) = controller.close().await {
            tracing::warn!("Failed to close scan-management session: {}", e);
        }
        outcome
    }

    async fn session_action(
        &self,
        controller: &SessionController,
        action: ScanAction,
        scan_id: u64,
        format: &str,
        output: Option<&Path>,
    ) -> Result<()> {
        let report = controller.apply(action, scan_id).await?;
        self.print(&Report::Action(&report), format, output).await
    }

    async fn print(&self, report: &Report<'_>, format: &str, output: Option<&Path>) -> Result<()> {
        let content = self.report_generator.render(report, format)?;
        self.report_generator.emit(&content, output).await
    }
}

/// OS fingerprinting and SYN scans need raw sockets
fn warn_if_unprivileged() {
    #[cfg(unix)]
    if !nix::unistd::geteuid().is_root() {
        tracing::warn!("Not running as root; nmap OS detection and SYN scans will fail or degrade");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalization_rules() {
        assert_eq!(canonicalize_service("PostgreSQL"), "pgsql");
        assert_eq!(canonicalize_service("nfs_acl"), "nfs");
        assert_eq!(canonicalize_service("rpcbind"), "rpc");
        assert_eq!(canonicalize_service("ajp13"), "ajp");
        assert_eq!(canonicalize_service("HTTP"), "http");
    }

    #[test]
    fn test_canonicalization_is_idempotent() {
        for token in ["postgresql", "nfs", "rpcbind", "ajp13", "http", "ssh", "ms-wbt-server", "nfsrpc"] {
            let once = canonicalize_service(token);
            assert_eq!(canonicalize_service(&once), once, "token {}", token);
        }
    }

    #[test]
    fn test_port_state_parsing() {
        assert!(PortState::parse("open").is_open());
        assert!(PortState::parse("open|filtered").is_open());
        assert!(!PortState::parse("closed").is_open());
        assert!(!PortState::parse("filtered").is_open());
        assert_eq!(PortState::parse("closed|filtered"), PortState::Unknown);
    }

    #[test]
    fn test_state_machine_edges() {
        use OrchestrationState::*;
        let path = [Validated, OsScanning, PortScanning, PortsParsed, ScriptMatching, ScriptExecuting, Completed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]));
        }
        assert!(PortsParsed.can_transition_to(Aborted));
        assert!(!Completed.can_transition_to(Aborted));
        assert!(!Validated.can_transition_to(ScriptExecuting));
    }

    #[test]
    fn test_builder_rejects_skipped_phase() {
        let target = Target::parse("10.0.0.1").unwrap();
        let mut builder = ScanReportBuilder::new(Uuid::new_v4(), target, Duration::from_secs(600));
        assert!(builder.transition(OrchestrationState::ScriptExecuting).is_err());
        assert!(builder.transition(OrchestrationState::OsScanning).is_ok());
    }

    #[tokio::test]
    async fn test_event_bus_delivery() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe().await;
        let scan_id = Uuid::new_v4();
        bus.publish(ScanEvent::StateChanged {
            scan_id,
            state: OrchestrationState::OsScanning,
        })
        .await;

        match rx.recv().await {
            Some(ScanEvent::StateChanged { state, .. }) => assert_eq!(state, OrchestrationState::OsScanning),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    fn test_config(root: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.persistence.result_root = root.join("results");
        config.probe.script_dir = root.join("scripts");
        config
    }

    #[tokio::test]
    async fn test_application_lists_signatures_to_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let app = Application::new(test_config(dir.path())).await.unwrap();
        let out = dir.path().join("signatures.json");
        let cli = <Cli as clap::Parser>::parse_from([
            "recon_orchestrator",
            "signatures",
            "--format",
            "json",
            "-o",
            out.to_str().unwrap(),
        ]);
        app.run(cli).await.unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&tokio::fs::read_to_string(&out).await.unwrap()).unwrap();
        assert_eq!(value["signatures"][0]["key"], "cloudflare");
    }

    #[tokio::test]
    async fn test_application_shows_saved_report() {
        use OrchestrationState::*;
        let dir = tempfile::TempDir::new().unwrap();
        let app = Application::new(test_config(dir.path())).await.unwrap();

        let folder = dir.path().join("results/recon_run");
        tokio::fs::create_dir_all(&folder).await.unwrap();
        let mut builder = ScanReportBuilder::new(Uuid::new_v4(), Target::parse("10.0.0.1").unwrap(), Duration::from_secs(60));
        for state in [OsScanning, PortScanning, PortsParsed, ScriptMatching, ScriptExecuting] {
            builder.transition(state).unwrap();
        }
        builder.set_scan_folder(folder.clone());
        let report = builder.finish().unwrap();
        app.data_store.store_scan_report(&report).await.unwrap();

        let out = dir.path().join("shown.json");
        let cli = <Cli as clap::Parser>::parse_from([
            "recon_orchestrator",
            "show",
            folder.to_str().unwrap(),
            "--format",
            "json",
            "-o",
            out.to_str().unwrap(),
        ]);
        app.run(cli).await.unwrap();

        let shown: ScanReport =
            serde_json::from_str(&tokio::fs::read_to_string(&out).await.unwrap()).unwrap();
        assert_eq!(shown, report);
    }

    #[tokio::test]
    async fn test_scan_of_invalid_target_fails_before_probing() {
        let dir = tempfile::TempDir::new().unwrap();
        let app = Application::new(test_config(dir.path())).await.unwrap();
        let cli = <Cli as clap::Parser>::parse_from(["recon_orchestrator", "scan", "not a host!"]);
        let err = app.run(cli).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_TARGET");
        assert_eq!(app.metrics.get_scan_stats().scans_aborted, 1);
    }
}
