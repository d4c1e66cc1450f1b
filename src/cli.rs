//! Command-line interface definition
//!
//! Subcommands cover the reconnaissance scan, WAF detection, catalog and
//! signature listings, and the scan-management session client.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "recon_orchestrator",
    version,
    about = "Reconnaissance scan orchestrator and WAF detector",
    long_about = "Drives nmap through OS, port and script phases under one time budget, detects web application firewalls and controls a scan-management service"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short = 'c', long = "config", global = true, help = "Configuration file path", value_name = "FILE", default_value = "config.toml")]
    pub config_path: PathBuf,

    #[arg(long, global = true, help = "Output format", value_enum, value_name = "FORMAT")]
    pub format: Option<OutputFormat>,

    #[arg(short = 'o', long, global = true, help = "Write output to a file instead of stdout", value_name = "FILE")]
    pub output: Option<PathBuf>,

    #[arg(short = 'v', long, global = true, help = "Increase verbosity level", action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[arg(short = 'q', long, global = true, help = "Quiet mode (errors only)")]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the OS, port and script phases against one target
    Scan(ScanArgs),
    /// Detect a web application firewall in front of a target
    Waf(WafArgs),
    /// List the probe scripts available to the matcher
    Scripts,
    /// List the WAF signature table and payload categories
    Signatures,
    /// List saved run folders, newest first
    Runs,
    /// Print a saved scan report or WAF result
    Show {
        /// Run folder or result file
        path: PathBuf,
    },
    /// Talk to the scan-management service
    Session {
        #[command(subcommand)]
        action: SessionCommand,
    },
}

#[derive(Args, Debug)]
pub struct ScanArgs {
    /// Host name, IP address or URL
    pub target: String,

    #[arg(short = 't', long, help = "Total time budget in seconds", value_name = "SECS")]
    pub timeout: Option<u64>,
}

#[derive(Args, Debug)]
pub struct WafArgs {
    /// Host name, IP address or URL
    pub target: String,

    #[arg(short = 't', long, help = "Total time budget in seconds", value_name = "SECS")]
    pub timeout: Option<u64>,

    #[arg(short = 'i', long, help = "Also run the nmap WAF detection and fingerprint scripts")]
    pub intensive: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    /// List defined scans and their status
    List,
    /// List policy templates
    Policies,
    Launch { id: u64 },
    Pause { id: u64 },
    Resume { id: u64 },
    Stop { id: u64 },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON format
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Human => write!(f, "human"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl Cli {
    /// Validate CLI arguments and resolve conflicts
    pub fn validate(&self) -> Result<(), String> {
        if self.quiet && self.verbose > 0 {
            return Err("Cannot use both quiet and verbose modes".to_string());
        }

        let timeout = match &self.command {
            Command::Scan(args) => args.timeout,
            Command::Waf(args) => args.timeout,
            _ => None,
        };
        if timeout == Some(0) {
            return Err("Timeout must be at least one second".to_string());
        }

        let target = match &self.command {
            Command::Scan(args) => Some(args.target.as_str()),
            Command::Waf(args) => Some(args.target.as_str()),
            _ => None,
        };
        if target.is_some_and(|t| t.trim().is_empty()) {
            return Err("Target must not be empty".to_string());
        }

        Ok(())
    }

    /// Log level implied by -v/-q, if any
    pub fn log_level_override(&self) -> Option<&'static str> {
        if self.quiet {
            return Some("error");
        }
        match self.verbose {
            0 => None,
            1 => Some("debug"),
            _ => Some("trace"),
        }
    }

    pub fn command_name(&self) -> &'static str {
        match &self.command {
            Command::Scan(_) => "scan",
            Command::Waf(_) => "waf",
            Command::Scripts => "scripts",
            Command::Signatures => "signatures",
            Command::Runs => "runs",
            Command::Show { .. } => "show",
            Command::Session { .. } => "session",
        }
    }

    /// Whether the command drives nmap phases that need raw sockets
    pub fn needs_privileges(&self) -> bool {
        match &self.command {
            Command::Scan(_) => true,
            Command::Waf(args) => args.intensive,
            _ => false,
        }
    }
}
