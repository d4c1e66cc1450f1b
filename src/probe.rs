//! Probe runner
//!
//! Every external tool invocation goes through here: a fully formed argument
//! vector is executed without a shell under a hard deadline, and the result is
//! folded into a tagged `ProbeOutcome`. Failures never escape as errors; the
//! caller decides how to aggregate them.

use async_trait::async_trait;
use std::{
    net::Ipv6Addr,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::process::Command;

use crate::{
    core::{ProbeOutcome, Protocol},
    error::{Result, ScannerError},
};

/// Raw result of a finished process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Executes an argument vector under a deadline
///
/// Implementations return `ScannerError::Timeout` when the deadline expires
/// (after terminating the process) and `ScannerError::ToolError` when the
/// process cannot be started.
#[async_trait]
pub trait ProbeExecutor: Send + Sync {
    async fn execute(&self, argv: &[String], deadline: Duration) -> Result<ProcessOutput>;
}

/// Runs probes as child processes
#[derive(Debug, Default, Clone)]
pub struct ProcessProbeExecutor;

#[async_trait]
impl ProbeExecutor for ProcessProbeExecutor {
    async fn execute(&self, argv: &[String], deadline: Duration) -> Result<ProcessOutput> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ScannerError::tool("probe", "empty argument vector"))?;

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ScannerError::tool(program.as_str(), format!("failed to spawn: {}", e)))?;

        // Dropping the wait future on expiry drops the child, which kills it.
        match tokio::time::timeout(deadline, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(ProcessOutput {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Ok(Err(e)) => Err(ScannerError::tool(
                program.as_str(),
                format!("failed to collect output: {}", e),
            )),
            Err(_) => Err(ScannerError::timeout(program.as_str(), deadline.as_secs())),
        }
    }
}

/// A named probe invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeCommand {
    pub name: String,
    pub argv: Vec<String>,
    /// Structured document the probe writes, if any
    pub output_document: Option<PathBuf>,
}

const BASE_TIMING: [&str; 5] = ["-T4", "--max-retries", "1", "--host-timeout", "60s"];

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Program name, plus `-6` when the host is an IPv6 literal
fn program_args(nmap: &str, host: &str) -> Vec<String> {
    let mut argv = vec![nmap.to_string()];
    if host.parse::<Ipv6Addr>().is_ok() {
        argv.push("-6".to_string());
    }
    argv
}

impl ProbeCommand {
    /// OS fingerprint writing an XML document
    pub fn os_scan(nmap: &str, host: &str, document: &Path) -> Self {
        let mut argv = program_args(nmap, host);
        argv.extend(BASE_TIMING.iter().map(|s| s.to_string()));
        argv.extend(["-O", "--osscan-guess", "-oX"].iter().map(|s| s.to_string()));
        argv.push(path_arg(document));
        argv.push(host.to_string());
        Self {
            name: "os_scan".to_string(),
            argv,
            output_document: Some(document.to_path_buf()),
        }
    }

    /// SYN scan of the top 1000 ports writing an XML document
    pub fn port_scan(nmap: &str, host: &str, document: &Path) -> Self {
        let mut argv = program_args(nmap, host);
        argv.extend(BASE_TIMING.iter().map(|s| s.to_string()));
        argv.extend(
            ["-sS", "--top-ports", "1000", "--script", "http-waf-detect", "-oX"]
                .iter()
                .map(|s| s.to_string()),
        );
        argv.push(path_arg(document));
        argv.push(host.to_string());
        Self {
            name: "port_scan".to_string(),
            argv,
            output_document: Some(document.to_path_buf()),
        }
    }

    /// One catalog script against one port
    pub fn script(nmap: &str, host: &str, port: u16, protocol: Protocol, script: &str) -> Self {
        let mut argv = program_args(nmap, host);
        argv.extend(["-T4", "--max-retries", "1", "-p"].iter().map(|s| s.to_string()));
        argv.push(port.to_string());
        if protocol == Protocol::Udp {
            argv.push("-sU".to_string());
        }
        argv.push("--script".to_string());
        argv.push(script.to_string());
        argv.push(host.to_string());
        Self {
            name: script.to_string(),
            argv,
            output_document: None,
        }
    }

    /// Aggressive `http-waf-detect` against the web ports
    pub fn waf_detect(nmap: &str, host: &str, document: &Path) -> Self {
        Self::waf_script(
            "nmap_waf_detect",
            nmap,
            host,
            document,
            "http-waf-detect",
            "http-waf-detect.aggro",
        )
    }

    /// Intensive `http-waf-fingerprint` against the web ports
    pub fn waf_fingerprint(nmap: &str, host: &str, document: &Path) -> Self {
        Self::waf_script(
            "nmap_waf_fingerprint",
            nmap,
            host,
            document,
            "http-waf-fingerprint",
            "http-waf-fingerprint.intensive=1",
        )
    }

    fn waf_script(name: &str, nmap: &str, host: &str, document: &Path, script: &str, args: &str) -> Self {
        let mut argv = program_args(nmap, host);
        argv.extend([
            "-p".to_string(),
            "80,443".to_string(),
            "--script".to_string(),
            script.to_string(),
            "--script-args".to_string(),
            args.to_string(),
            "-oX".to_string(),
            path_arg(document),
            host.to_string(),
        ]);
        Self {
            name: name.to_string(),
            argv,
            output_document: Some(document.to_path_buf()),
        }
    }
}

/// Turns executor results into tagged outcomes
#[derive(Clone)]
pub struct ProbeRunner {
    executor: Arc<dyn ProbeExecutor>,
}

impl ProbeRunner {
    pub fn new(executor: Arc<dyn ProbeExecutor>) -> Self {
        Self { executor }
    }

    /// Run one probe; never fails
    pub async fn run(&self, command: &ProbeCommand, deadline: Duration) -> ProbeOutcome {
        let started = Instant::now();
        tracing::debug!(probe = %command.name, deadline_ms = deadline.as_millis() as u64, argv = ?command.argv, "Running probe");

        let result = self.executor.execute(&command.argv, deadline).await;
        let elapsed = started.elapsed();

        let outcome = match result {
            Ok(output) if output.succeeded() => {
                ProbeOutcome::success(command.name.as_str(), output.stdout, deadline, elapsed)
            }
            Ok(output) => {
                let code = output
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                let stderr = output.stderr.trim();
                let message = if stderr.is_empty() {
                    format!("exit code {}", code)
                } else {
                    format!("exit code {}: {}", code, stderr)
                };
                ProbeOutcome::tool_error(command.name.as_str(), message, deadline, elapsed)
            }
            Err(ScannerError::Timeout { .. }) => {
                ProbeOutcome::timeout(command.name.as_str(), deadline, elapsed)
            }
            Err(e) => ProbeOutcome::tool_error(command.name.as_str(), e.to_string(), deadline, elapsed),
        };

        crate::log_probe_outcome!(outcome);
        crate::metrics::record_probe_outcome(&outcome);
        outcome
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::ProbeStatus;

    /// Executor returning a fixed result for every call
    pub(crate) struct FixedExecutor(pub Result<ProcessOutput>);

    #[async_trait]
    impl ProbeExecutor for FixedExecutor {
        async fn execute(&self, _argv: &[String], _deadline: Duration) -> Result<ProcessOutput> {
            self.0.clone()
        }
    }

    fn runner(result: Result<ProcessOutput>) -> ProbeRunner {
        ProbeRunner::new(Arc::new(FixedExecutor(result)))
    }

    #[test]
    fn test_script_command_shape() {
        let cmd = ProbeCommand::script("nmap", "10.0.0.5", 53, Protocol::Udp, "dns-recursion.nse");
        assert_eq!(
            cmd.argv,
            vec!["nmap", "-T4", "--max-retries", "1", "-p", "53", "-sU", "--script", "dns-recursion.nse", "10.0.0.5"]
        );
        assert_eq!(cmd.name, "dns-recursion.nse");
    }

    #[test]
    fn test_port_scan_command_writes_document() {
        let cmd = ProbeCommand::port_scan("nmap", "10.0.0.5", Path::new("/tmp/run/ports.xml"));
        assert_eq!(cmd.output_document.as_deref(), Some(Path::new("/tmp/run/ports.xml")));
        assert_eq!(cmd.argv.last().map(String::as_str), Some("10.0.0.5"));
        assert!(cmd.argv.contains(&"--top-ports".to_string()));
    }

    #[test]
    fn test_ipv6_hosts_select_address_family() {
        let doc = Path::new("/tmp/run/doc.xml");
        let commands = [
            ProbeCommand::os_scan("nmap", "2001:db8::1", doc),
            ProbeCommand::port_scan("nmap", "2001:db8::1", doc),
            ProbeCommand::script("nmap", "2001:db8::1", 22, Protocol::Tcp, "ssh-hostkey.nse"),
            ProbeCommand::waf_detect("nmap", "2001:db8::1", doc),
            ProbeCommand::waf_fingerprint("nmap", "2001:db8::1", doc),
        ];
        for cmd in &commands {
            assert_eq!(cmd.argv[1], "-6", "{} should scan over IPv6", cmd.name);
            assert_eq!(cmd.argv.last().map(String::as_str), Some("2001:db8::1"));
        }

        for cmd in [
            ProbeCommand::port_scan("nmap", "10.0.0.5", doc),
            ProbeCommand::waf_detect("nmap", "example.com", doc),
        ] {
            assert!(!cmd.argv.contains(&"-6".to_string()));
        }
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_tool_error() {
        let outcome = runner(Ok(ProcessOutput {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "requires root privileges\n".to_string(),
        }))
        .run(&ProbeCommand::script("nmap", "h", 80, Protocol::Tcp, "x.nse"), Duration::from_secs(5))
        .await;

        assert_eq!(outcome.status, ProbeStatus::ToolError);
        assert_eq!(outcome.error.as_deref(), Some("exit code 1: requires root privileges"));
    }

    #[tokio::test]
    async fn test_deadline_is_timeout_outcome() {
        let outcome = runner(Err(ScannerError::timeout("nmap", 5)))
            .run(&ProbeCommand::script("nmap", "h", 80, Protocol::Tcp, "x.nse"), Duration::from_secs(5))
            .await;
        assert_eq!(outcome.status, ProbeStatus::Timeout);
        assert_eq!(outcome.deadline, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_tool_error() {
        let outcome = ProbeRunner::new(Arc::new(ProcessProbeExecutor))
            .run(
                &ProbeCommand::script("/nonexistent/nmap-binary", "h", 80, Protocol::Tcp, "x.nse"),
                Duration::from_secs(5),
            )
            .await;
        assert_eq!(outcome.status, ProbeStatus::ToolError);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_executor_enforces_deadline() {
        let argv = vec!["sleep".to_string(), "5".to_string()];
        let result = ProcessProbeExecutor.execute(&argv, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(ScannerError::Timeout { .. })));
    }
}
