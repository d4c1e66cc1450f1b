//! Script matching
//!
//! Maps each open port's service token onto catalog entries whose name
//! contains the token. Matching is deliberately broad; the per-port cap keeps
//! fan-out bounded.

use crate::{
    catalog::ScriptCatalog,
    core::{OrchestrationState, PortRecord, ScanWarning, ScriptMatch, WarningKind},
};

/// Result of matching every open port
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchResult {
    /// Ports with at least one script, in port discovery order
    pub matches: Vec<ScriptMatch>,
    /// One entry per truncated port
    pub warnings: Vec<ScanWarning>,
}

#[derive(Debug, Clone, Copy)]
pub struct ScriptMatcher {
    max_scripts_per_port: usize,
}

impl ScriptMatcher {
    pub fn new(max_scripts_per_port: usize) -> Self {
        Self {
            max_scripts_per_port,
        }
    }

    /// Scripts for one port, or `None` when the port has no token or no hit
    pub fn match_port(&self, record: &PortRecord, catalog: &ScriptCatalog) -> Option<(ScriptMatch, Option<ScanWarning>)> {
        let service = record.service.as_deref().filter(|s| !s.is_empty())?;

        let hits: Vec<&String> = catalog
            .entries()
            .iter()
            .filter(|entry| entry.contains(service))
            .collect();
        if hits.is_empty() {
            return None;
        }

        let warning = (hits.len() > self.max_scripts_per_port).then(|| {
            ScanWarning::for_port(
                OrchestrationState::ScriptMatching,
                WarningKind::ScriptCapExceeded,
                record.port,
                format!(
                    "Limited port {} to {} scripts ({} matched service '{}')",
                    record.port,
                    self.max_scripts_per_port,
                    hits.len(),
                    service
                ),
            )
        });

        let scripts = hits
            .into_iter()
            .take(self.max_scripts_per_port)
            .cloned()
            .collect();

        Some((
            ScriptMatch {
                port: record.port,
                protocol: record.protocol,
                service: service.to_string(),
                scripts,
            },
            warning,
        ))
    }

    pub fn match_ports(&self, ports: &[PortRecord], catalog: &ScriptCatalog) -> MatchResult {
        let mut result = MatchResult::default();
        for record in ports {
            if let Some((script_match, warning)) = self.match_port(record, catalog) {
                if let Some(warning) = warning {
                    tracing::warn!(port = record.port, "{}", warning.message);
                    result.warnings.push(warning);
                }
                result.matches.push(script_match);
            }
        }
        result
    }
}
