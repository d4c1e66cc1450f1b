//! # Recon Orchestrator
//!
//! Drives an external network scanner (nmap) through OS fingerprinting, port
//! discovery and per-service script phases under one shared time budget, and
//! detects web application firewalls from passive fingerprints and active
//! payload probing.
//!
//! ## Features
//!
//! - **Scan orchestration**: state machine over OS scan, port scan, parsing,
//!   script matching and script execution; always yields a report
//! - **Time budget**: up-front reservation for mandatory phases, fair per-script
//!   deadlines for the remainder
//! - **WAF detection**: signature scoring, block-ratio classification and
//!   optional nmap WAF scripts
//! - **Scan management**: token session client for a Nessus-style service
//! - **Output**: human-readable or JSON, with per-run result folders
//!
//! ## Architecture
//!
//! Side effects sit behind traits (`ProbeExecutor`, `HttpProber`,
//! `ScanDataStore`, `ScanManagementClient`, `ReportGenerator`) so the
//! orchestration logic runs against in-memory fakes in tests.

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod persistence;
pub mod reporting;

// Reconnaissance pipeline
pub mod target;
pub mod probe;
pub mod parser;
pub mod catalog;
pub mod matcher;
pub mod budget;
pub mod orchestrator;

// WAF detection
pub mod waf_signatures;
pub mod waf_detection;

// Scan-management service
pub mod session;

// Re-exports for convenience
pub use crate::{
    config::AppConfig,
    core::{Application, ScanReport},
    error::{Result, ScannerError},
    orchestrator::ReconOrchestrator,
    waf_detection::{WafDetectionResult, WafDetector},
};
