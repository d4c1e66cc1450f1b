//! WAF detection
//!
//! Two evidence channels are combined:
//! - passive scoring of one unmodified baseline response against the
//!   signature table (header or cookie 0.3, server 0.4, content 0.3, each at
//!   most once; candidates need more than 0.5)
//! - active probing with a bounded sample of malicious payloads, classified by
//!   the share of blocked responses
//!
//! A passive candidate always wins over the behavioral estimate. Optional
//! nmap WAF scripts run in intensive mode.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Duration};
use tokio::time::Instant;
use url::Url;

use crate::{
    config::{AppConfig, WafConfig},
    core::ProbeOutcome,
    error::{Result, ScannerError},
    logging::TimingLogger,
    persistence::{RunKind, ScanDataStore},
    probe::{ProbeCommand, ProbeRunner, ProcessProbeExecutor},
    target::Target,
    waf_signatures::{
        self, WafSignature, GENERIC_BYPASS_TECHNIQUES, GENERIC_WAF_NAME, GENERIC_WAF_TYPE,
        GENERIC_WEAKNESSES, POSSIBLE_WAF_NAME, POSSIBLE_WAF_TYPE, TEST_PAYLOADS,
    },
};

pub const METHOD_HTTP_ANALYSIS: &str = "HTTP Response Analysis";
pub const METHOD_NMAP_SCRIPTS: &str = "Nmap WAF Scripts";

/// Score points; a tenth of the confidence scale
const HEADER_OR_COOKIE_POINTS: u8 = 3;
const SERVER_POINTS: u8 = 4;
const CONTENT_POINTS: u8 = 3;
const CANDIDATE_THRESHOLD_POINTS: u8 = 5;

const BASELINE_BLOCK_CONFIDENCE: f64 = 0.8;

/// One HTTP response as seen by the scorer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpSnapshot {
    pub status: u16,
    /// Lowercased header names; repeated headers joined with ", "
    pub headers: BTreeMap<String, String>,
    /// Cookie names from every `Set-Cookie` header
    pub cookie_names: Vec<String>,
    /// Body text read up to the body cap
    pub body: String,
    pub content_length: Option<u64>,
}

impl HttpSnapshot {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Issues one GET under a deadline
///
/// Implementations return the response for every status; `ScannerError::Http`
/// with a status is reserved for transports that surface statuses as errors.
#[async_trait]
pub trait HttpProber: Send + Sync {
    async fn get(&self, url: &Url, timeout: Duration) -> Result<HttpSnapshot>;
}

/// `reqwest` backed prober; certificate checks are off so self-signed
/// endpoints can be fingerprinted
pub struct ReqwestProber {
    client: reqwest::Client,
    max_body_bytes: usize,
}

impl ReqwestProber {
    pub fn new(config: &WafConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            max_body_bytes: config.max_body_bytes,
        })
    }
}

#[async_trait]
impl HttpProber for ReqwestProber {
    async fn get(&self, url: &Url, timeout: Duration) -> Result<HttpSnapshot> {
        let mut response = self.client.get(url.clone()).timeout(timeout).send().await?;

        let status = response.status().as_u16();
        let content_length = response.content_length();

        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in response.headers() {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            headers
                .entry(name.as_str().to_ascii_lowercase())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert(value);
        }

        let cookie_names = response
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|value| {
                let text = String::from_utf8_lossy(value.as_bytes());
                text.split(['=', ';'])
                    .next()
                    .map(|name| name.trim().to_string())
                    .filter(|name| !name.is_empty())
            })
            .collect();

        let mut bytes: Vec<u8> = Vec::new();
        while bytes.len() < self.max_body_bytes {
            match response.chunk().await? {
                Some(chunk) => {
                    let room = self.max_body_bytes - bytes.len();
                    bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
                }
                None => break,
            }
        }

        Ok(HttpSnapshot {
            status,
            headers,
            cookie_names,
            body: String::from_utf8_lossy(&bytes).into_owned(),
            content_length,
        })
    }
}

/// A signature whose passive score passed the candidate threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureHit {
    pub waf_type: String,
    pub waf_name: String,
    pub confidence: f64,
    pub indicators: Vec<String>,
}

/// Passive points for one signature plus the indicators that fired
pub fn score_signature(signature: &WafSignature, snapshot: &HttpSnapshot) -> (u8, Vec<String>) {
    let mut points = 0u8;
    let mut indicators = Vec::new();

    let header_hits: Vec<&str> = signature
        .headers
        .iter()
        .copied()
        .filter(|h| snapshot.headers.contains_key(&h.to_ascii_lowercase()))
        .collect();
    let cookie_hits: Vec<&str> = signature
        .cookies
        .iter()
        .copied()
        .filter(|c| snapshot.cookie_names.iter().any(|name| name.starts_with(c)))
        .collect();
    if !header_hits.is_empty() || !cookie_hits.is_empty() {
        points += HEADER_OR_COOKIE_POINTS;
        indicators.extend(header_hits.iter().map(|h| format!("Header: {}", h)));
        indicators.extend(cookie_hits.iter().map(|c| format!("Cookie: {}", c)));
    }

    let server = snapshot.header("server").unwrap_or_default().to_lowercase();
    if let Some(pattern) = signature.server_patterns.iter().find(|p| server.contains(*p)) {
        points += SERVER_POINTS;
        indicators.push(format!("Server pattern: {}", pattern));
    }

    let body = snapshot.body.to_lowercase();
    if let Some(pattern) = signature.content_patterns.iter().find(|p| body.contains(*p)) {
        points += CONTENT_POINTS;
        indicators.push(format!("Content pattern: {}", pattern));
    }

    (points, indicators)
}

/// Every signature scoring above the threshold, in table order
pub fn passive_candidates(snapshot: &HttpSnapshot) -> Vec<SignatureHit> {
    waf_signatures::signatures()
        .iter()
        .filter_map(|signature| {
            let (points, indicators) = score_signature(signature, snapshot);
            (points > CANDIDATE_THRESHOLD_POINTS).then(|| SignatureHit {
                waf_type: signature.key.to_string(),
                waf_name: signature.name.to_string(),
                confidence: f64::from(points) / 10.0,
                indicators,
            })
        })
        .collect()
}

/// Highest confidence candidate; ties keep the earlier table entry
pub fn best_candidate(hits: &[SignatureHit]) -> Option<&SignatureHit> {
    hits.iter().fold(None, |best: Option<&SignatureHit>, hit| match best {
        Some(current) if current.confidence >= hit.confidence => Some(current),
        _ => Some(hit),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorClass {
    GenericWaf,
    PossibleWaf,
}

/// Behavioral classification from the share of blocked payload probes
pub fn classify_block_ratio(blocked: usize, total: usize) -> Option<(BehaviorClass, f64)> {
    if total == 0 {
        return None;
    }
    if blocked * 10 >= total * 7 {
        Some((BehaviorClass::GenericWaf, 0.9))
    } else if blocked * 2 >= total {
        Some((BehaviorClass::PossibleWaf, 0.7))
    } else {
        None
    }
}

pub fn recommendations(detected: bool, waf_name: Option<&str>) -> Vec<String> {
    let mut items: Vec<String> = [
        "Implement proper rate limiting and request throttling",
        "Use multiple layers of security (WAF + IDS/IPS)",
        "Regularly update WAF rules and signatures",
        "Monitor for WAF bypass attempts",
        "Implement proper logging and alerting",
        "Consider using multiple WAF vendors for redundancy",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    if detected {
        items.push(format!(
            "Review {} specific security configurations",
            waf_name.unwrap_or("WAF")
        ));
        items.extend(
            [
                "Implement custom rules to address identified weaknesses",
                "Test bypass techniques in a controlled environment",
                "Consider additional security controls for identified gaps",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
    } else {
        items.extend(
            [
                "Consider implementing a Web Application Firewall",
                "Ensure proper input validation at application level",
                "Implement comprehensive logging and monitoring",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
    }
    items
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineSummary {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub content_excerpt: String,
    /// The unmodified request was refused with 403
    pub waf_blocked: bool,
}

/// One payload request and how it was answered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadProbe {
    /// `<category>_<index>`
    pub key: String,
    pub category: String,
    pub payload: String,
    pub status: Option<u16>,
    pub content_length: Option<u64>,
    pub blocked: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NmapWafResults {
    pub outcomes: Vec<ProbeOutcome>,
    pub documents: Vec<PathBuf>,
    pub errors: Vec<String>,
}

/// Evidence gathered for one detection request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseAnalysis {
    pub url: String,
    pub baseline: Option<BaselineSummary>,
    pub signature_hits: Vec<SignatureHit>,
    pub payload_probes: Vec<PayloadProbe>,
    pub blocked_payloads: usize,
    pub total_payloads: usize,
    pub block_ratio: f64,
    pub behavior_class: Option<BehaviorClass>,
    pub behavioral_confidence: f64,
    pub waf_behavior_detected: bool,
    pub nmap: Option<NmapWafResults>,
    /// Failures that cut the analysis short
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WafDetectionResult {
    id: uuid::Uuid,
    target: Target,
    detected: bool,
    waf_type: Option<String>,
    waf_name: Option<String>,
    confidence: f64,
    detection_methods: Vec<String>,
    response_analysis: ResponseAnalysis,
    weaknesses: Vec<String>,
    bypass_techniques: Vec<String>,
    recommendations: Vec<String>,
    timestamp: DateTime<Utc>,
    duration: Duration,
    result_folder: Option<PathBuf>,
}

impl WafDetectionResult {
    pub fn id(&self) -> uuid::Uuid {
        self.id
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn detected(&self) -> bool {
        self.detected
    }

    pub fn waf_type(&self) -> Option<&str> {
        self.waf_type.as_deref()
    }

    pub fn waf_name(&self) -> Option<&str> {
        self.waf_name.as_deref()
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn detection_methods(&self) -> &[String] {
        &self.detection_methods
    }

    pub fn response_analysis(&self) -> &ResponseAnalysis {
        &self.response_analysis
    }

    pub fn weaknesses(&self) -> &[String] {
        &self.weaknesses
    }

    pub fn bypass_techniques(&self) -> &[String] {
        &self.bypass_techniques
    }

    pub fn recommendations(&self) -> &[String] {
        &self.recommendations
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn result_folder(&self) -> Option<&PathBuf> {
        self.result_folder.as_ref()
    }
}

/// Identity and confidence settled from the evidence
#[derive(Debug, Clone, PartialEq)]
struct Verdict {
    waf_type: String,
    waf_name: String,
    confidence: f64,
    weaknesses: Vec<String>,
    bypass_techniques: Vec<String>,
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn verdict(analysis: &ResponseAnalysis) -> Option<Verdict> {
    if let Some(hit) = best_candidate(&analysis.signature_hits) {
        let signature = waf_signatures::find_signature(&hit.waf_type);
        return Some(Verdict {
            waf_type: hit.waf_type.clone(),
            waf_name: hit.waf_name.clone(),
            confidence: hit.confidence,
            weaknesses: signature.map(|s| to_strings(s.weaknesses)).unwrap_or_default(),
            bypass_techniques: signature
                .map(|s| to_strings(s.bypass_techniques))
                .unwrap_or_default(),
        });
    }

    let baseline_blocked = analysis.baseline.as_ref().is_some_and(|b| b.waf_blocked);
    let (waf_type, waf_name, confidence) = match (baseline_blocked, analysis.behavior_class) {
        (true, _) => (
            GENERIC_WAF_TYPE,
            GENERIC_WAF_NAME,
            analysis.behavioral_confidence.max(BASELINE_BLOCK_CONFIDENCE),
        ),
        (false, Some(BehaviorClass::GenericWaf)) => {
            (GENERIC_WAF_TYPE, GENERIC_WAF_NAME, analysis.behavioral_confidence)
        }
        (false, Some(BehaviorClass::PossibleWaf)) => {
            (POSSIBLE_WAF_TYPE, POSSIBLE_WAF_NAME, analysis.behavioral_confidence)
        }
        (false, None) => return None,
    };

    Some(Verdict {
        waf_type: waf_type.to_string(),
        waf_name: waf_name.to_string(),
        confidence,
        weaknesses: to_strings(GENERIC_WEAKNESSES),
        bypass_techniques: to_strings(GENERIC_BYPASS_TECHNIQUES),
    })
}

pub struct WafDetector {
    config: Arc<AppConfig>,
    prober: Arc<dyn HttpProber>,
    runner: ProbeRunner,
    store: Arc<dyn ScanDataStore>,
}

impl WafDetector {
    pub fn new(
        config: Arc<AppConfig>,
        prober: Arc<dyn HttpProber>,
        runner: ProbeRunner,
        store: Arc<dyn ScanDataStore>,
    ) -> Self {
        Self {
            config,
            prober,
            runner,
            store,
        }
    }

    /// Detect and identify a WAF in front of `target` within `total_budget`
    pub async fn detect_waf(&self, target: &str, total_budget: Duration, intensive: bool) -> Result<WafDetectionResult> {
        let target = Target::parse(target)?;
        if total_budget.is_zero() {
            return Err(ScannerError::budget_exhausted(
                "total budget is zero; no request can be issued",
            ));
        }
        let url = target.http_url()?;
        let started = Instant::now();
        let deadline = started + total_budget;
        let id = uuid::Uuid::new_v4();
        let timestamp = Utc::now();
        crate::log_scan_start!("waf", target);
        let timer = TimingLogger::start(format!("waf detection of {}", target));

        let result_folder = match self.store.create_scan_folder(RunKind::Waf, &target, id).await {
            Ok(folder) => Some(folder),
            Err(e) => {
                crate::log_error_with_context!(e, "creating WAF result folder");
                None
            }
        };

        let mut analysis = self.analyze_http(&url, deadline).await;
        timer.checkpoint("http_analysis");

        let mut detection_methods = Vec::new();
        let verdict = verdict(&analysis);
        if verdict.is_some() {
            detection_methods.push(METHOD_HTTP_ANALYSIS.to_string());
        }

        if intensive {
            tracing::info!("Performing intensive nmap scans for {}", target);
            analysis.nmap = Some(
                self.run_nmap_scripts(&target.probe_host(), result_folder.as_ref(), deadline)
                    .await,
            );
            detection_methods.push(METHOD_NMAP_SCRIPTS.to_string());
        }

        let detected = verdict.is_some();
        let (waf_type, waf_name, confidence, weaknesses, bypass_techniques) = match verdict {
            Some(v) => (
                Some(v.waf_type),
                Some(v.waf_name),
                v.confidence,
                v.weaknesses,
                v.bypass_techniques,
            ),
            None => (None, None, 0.0, Vec::new(), Vec::new()),
        };
        let recommendations = recommendations(detected, waf_name.as_deref());

        crate::log_waf_verdict!(url, detected, waf_type.as_deref(), confidence);
        crate::metrics::record_waf_verdict(detected, confidence);

        let result = WafDetectionResult {
            id,
            target,
            detected,
            waf_type,
            waf_name,
            confidence,
            detection_methods,
            response_analysis: analysis,
            weaknesses,
            bypass_techniques,
            recommendations,
            timestamp,
            duration: started.elapsed(),
            result_folder,
        };

        crate::log_scan_complete!("waf", result.target, result.duration, usize::from(result.detected));
        crate::metrics::record_scan_completed("waf", result.duration, 0);

        if self.config.persistence.auto_save {
            if let Some(folder) = result.result_folder.as_ref() {
                if let Err(e) = self.store.store_waf_result(folder, &result).await {
                    crate::log_error_with_context!(e, "saving WAF result");
                }
            }
        }

        Ok(result)
    }

    fn request_timeout(&self, deadline: Instant) -> Duration {
        self.config
            .waf_request_timeout()
            .min(deadline.saturating_duration_since(Instant::now()))
    }

    async fn analyze_http(&self, url: &Url, deadline: Instant) -> ResponseAnalysis {
        let waf = &self.config.waf;
        let mut analysis = ResponseAnalysis {
            url: url.to_string(),
            ..Default::default()
        };

        match self.prober.get(url, self.request_timeout(deadline)).await {
            Ok(snapshot) => {
                analysis.signature_hits = passive_candidates(&snapshot);
                for hit in &analysis.signature_hits {
                    tracing::debug!(waf = %hit.waf_type, confidence = hit.confidence, indicators = ?hit.indicators, "Signature candidate");
                }
                let waf_blocked = snapshot.status == 403;
                analysis.waf_behavior_detected |= waf_blocked;
                analysis.baseline = Some(BaselineSummary {
                    status: snapshot.status,
                    headers: snapshot.headers,
                    content_excerpt: snapshot.body.chars().take(waf.content_excerpt_chars).collect(),
                    waf_blocked,
                });
            }
            Err(ScannerError::Http { status: Some(403), .. }) => {
                analysis.waf_behavior_detected = true;
                analysis.baseline = Some(BaselineSummary {
                    status: 403,
                    headers: BTreeMap::new(),
                    content_excerpt: "403 Forbidden - Likely WAF blocking".to_string(),
                    waf_blocked: true,
                });
            }
            Err(e) => {
                tracing::warn!("Baseline request to {} failed: {}", url, e);
                analysis.errors.push(format!("baseline request failed: {}", e));
                return analysis;
            }
        }

        'categories: for category in TEST_PAYLOADS {
            for (index, payload) in category.payloads.iter().take(waf.payloads_per_category).enumerate() {
                let timeout = self.request_timeout(deadline);
                if timeout.is_zero() {
                    analysis.errors.push(format!(
                        "WAF budget exhausted after {} payload probes",
                        analysis.total_payloads
                    ));
                    break 'categories;
                }

                let mut probe_url = url.clone();
                probe_url
                    .query_pairs_mut()
                    .append_pair(&format!("test_{}", category.name), payload);

                let mut probe = PayloadProbe {
                    key: format!("{}_{}", category.name, index),
                    category: category.name.to_string(),
                    payload: payload.to_string(),
                    status: None,
                    content_length: None,
                    blocked: false,
                    error: None,
                };
                match self.prober.get(&probe_url, timeout).await {
                    Ok(snapshot) => {
                        probe.status = Some(snapshot.status);
                        probe.content_length = snapshot.content_length;
                        probe.blocked = waf_signatures::is_block_code(snapshot.status);
                    }
                    Err(ScannerError::Http { status: Some(status), message }) => {
                        probe.status = Some(status);
                        probe.blocked = waf_signatures::is_block_code(status);
                        probe.error = Some(message);
                    }
                    Err(e) => probe.error = Some(e.to_string()),
                }

                analysis.total_payloads += 1;
                if probe.blocked {
                    analysis.blocked_payloads += 1;
                    analysis.waf_behavior_detected = true;
                }
                crate::metrics::record_http_probe(probe.blocked);
                analysis.payload_probes.push(probe);
            }
        }

        if analysis.total_payloads > 0 {
            analysis.block_ratio = analysis.blocked_payloads as f64 / analysis.total_payloads as f64;
        }
        if let Some((class, confidence)) =
            classify_block_ratio(analysis.blocked_payloads, analysis.total_payloads)
        {
            analysis.behavior_class = Some(class);
            analysis.behavioral_confidence = confidence;
        }
        tracing::debug!(
            blocked = analysis.blocked_payloads,
            total = analysis.total_payloads,
            "Payload probing finished"
        );
        analysis
    }

    async fn run_nmap_scripts(&self, host: &str, folder: Option<&PathBuf>, deadline: Instant) -> NmapWafResults {
        let folder = folder
            .cloned()
            .unwrap_or_else(std::env::temp_dir);
        let nmap = self.config.probe.nmap_path.as_str();
        let sanitized: String = host
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();

        let commands = [
            ProbeCommand::waf_detect(nmap, host, &folder.join(format!("waf_detect_{}.xml", sanitized))),
            ProbeCommand::waf_fingerprint(nmap, host, &folder.join(format!("waf_fingerprint_{}.xml", sanitized))),
        ];

        let mut results = NmapWafResults {
            outcomes: Vec::new(),
            documents: Vec::new(),
            errors: Vec::new(),
        };
        for command in commands.iter() {
            let limit = Duration::from_secs(self.config.waf.nmap_script_timeout_secs)
                .min(deadline.saturating_duration_since(Instant::now()));
            if limit.is_zero() {
                results
                    .errors
                    .push(format!("{} skipped: WAF budget exhausted", command.name));
                continue;
            }
            let outcome = self.runner.run(command, limit).await;
            if outcome.is_success() {
                results.documents.extend(command.output_document.iter().cloned());
            } else {
                results.errors.push(format!(
                    "{}: {}",
                    command.name,
                    outcome.error.as_deref().unwrap_or(outcome.status.as_str())
                ));
            }
            results.outcomes.push(outcome);
        }
        results
    }
}

/// Factory wiring the detector to `reqwest`, child processes and on-disk storage
pub async fn create_waf_detector(config: Arc<AppConfig>, store: Arc<dyn ScanDataStore>) -> Result<WafDetector> {
    let prober = ReqwestProber::new(&config.waf)?;
    Ok(WafDetector::new(
        config,
        Arc::new(prober),
        ProbeRunner::new(Arc::new(ProcessProbeExecutor)),
        store,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        persistence::FileBasedDataStore,
        probe::{tests::FixedExecutor, ProcessOutput},
    };
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn snapshot(status: u16, headers: &[(&str, &str)], body: &str) -> HttpSnapshot {
        HttpSnapshot {
            status,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
                .collect(),
            cookie_names: Vec::new(),
            body: body.to_string(),
            content_length: Some(body.len() as u64),
        }
    }

    /// Answers the baseline with a fixed response and blocks the first N payloads
    struct FakeProber {
        baseline: Result<HttpSnapshot>,
        blocked_payloads: usize,
        payload_error: bool,
        /// Latency of every payload request, cut short by its timeout
        payload_delay: Duration,
        requests: Mutex<Vec<String>>,
    }

    impl FakeProber {
        fn new(baseline: Result<HttpSnapshot>, blocked_payloads: usize) -> Self {
            Self {
                baseline,
                blocked_payloads,
                payload_error: false,
                payload_delay: Duration::ZERO,
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl HttpProber for FakeProber {
        async fn get(&self, url: &Url, timeout: Duration) -> Result<HttpSnapshot> {
            let request_count = {
                let mut requests = self.requests.lock().unwrap();
                requests.push(url.to_string());
                requests.len()
            };
            if url.query().is_none() {
                return self.baseline.clone();
            }
            tokio::time::sleep(self.payload_delay.min(timeout)).await;
            if self.payload_error {
                return Err(ScannerError::http(None, "connection reset"));
            }
            let payload_index = request_count - 2;
            if payload_index < self.blocked_payloads {
                Ok(snapshot(403, &[], "Forbidden"))
            } else {
                Ok(snapshot(200, &[], "ok"))
            }
        }
    }

    struct Fixture {
        _temp_dir: TempDir,
        config: AppConfig,
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.persistence.result_root = temp_dir.path().join("results");
        Fixture {
            _temp_dir: temp_dir,
            config,
        }
    }

    fn detector(fixture: &Fixture, prober: Arc<FakeProber>) -> WafDetector {
        let store: Arc<dyn ScanDataStore> = Arc::new(FileBasedDataStore::new(
            fixture.config.persistence.result_root.clone(),
            true,
        ));
        let executor = FixedExecutor(Ok(ProcessOutput {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        }));
        WafDetector::new(
            Arc::new(fixture.config.clone()),
            prober,
            ProbeRunner::new(Arc::new(executor)),
            store,
        )
    }

    #[test]
    fn test_cloudflare_header_and_server() {
        let response = snapshot(200, &[("CF-RAY", "8a1b2c"), ("Server", "cloudflare")], "<html></html>");
        let hits = passive_candidates(&response);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].waf_type, "cloudflare");
        assert_eq!(hits[0].confidence, 0.7);
    }

    #[test]
    fn test_each_term_counts_once() {
        let mut response = snapshot(
            200,
            &[("cf-ray", "1"), ("cf-cache-status", "HIT")],
            "",
        );
        response.cookie_names = vec!["__cf_bm".to_string()];
        let signature = waf_signatures::find_signature("cloudflare").unwrap();
        let (points, indicators) = score_signature(signature, &response);
        assert_eq!(points, 3);
        assert_eq!(indicators.len(), 3);
        assert!(passive_candidates(&response).is_empty());
    }

    #[test]
    fn test_cookie_prefix_and_content() {
        let mut response = snapshot(200, &[], "Attention Required! | Cloudflare");
        response.cookie_names = vec!["__cf_bm_session".to_string()];
        let hits = passive_candidates(&response);
        assert_eq!(hits[0].waf_type, "cloudflare");
        assert_eq!(hits[0].confidence, 0.6);
    }

    #[test]
    fn test_tie_keeps_table_order() {
        let mut response = snapshot(200, &[("x-iinfo", "1")], "incapsula imperva");
        response.cookie_names = vec!["incap_ses_123".to_string()];
        let hits = passive_candidates(&response);
        assert_eq!(hits.len(), 2);
        assert_eq!(best_candidate(&hits).unwrap().waf_type, "incapsula");
    }

    #[test]
    fn test_block_ratio_classification() {
        assert_eq!(classify_block_ratio(8, 10), Some((BehaviorClass::GenericWaf, 0.9)));
        assert_eq!(classify_block_ratio(7, 10), Some((BehaviorClass::GenericWaf, 0.9)));
        assert_eq!(classify_block_ratio(5, 10), Some((BehaviorClass::PossibleWaf, 0.7)));
        assert_eq!(classify_block_ratio(4, 10), None);
        assert_eq!(classify_block_ratio(0, 0), None);
    }

    #[test]
    fn test_recommendation_sets() {
        let detected = recommendations(true, Some("Cloudflare"));
        assert_eq!(detected.len(), 10);
        assert_eq!(detected[6], "Review Cloudflare specific security configurations");
        assert_eq!(recommendations(false, None).len(), 9);
    }

    #[tokio::test]
    async fn test_passive_candidate_overrides_behavior() {
        let fixture = fixture();
        let baseline = snapshot(200, &[("cf-ray", "1"), ("server", "cloudflare")], "");
        let prober = Arc::new(FakeProber::new(Ok(baseline), 8));

        let result = detector(&fixture, prober)
            .detect_waf("https://shop.example.com", Duration::from_secs(300), false)
            .await
            .unwrap();

        assert!(result.detected());
        assert_eq!(result.waf_type(), Some("cloudflare"));
        assert_eq!(result.confidence(), 0.7);
        assert_eq!(result.response_analysis().behavior_class, Some(BehaviorClass::GenericWaf));
        assert_eq!(result.detection_methods(), &[METHOD_HTTP_ANALYSIS.to_string()]);
        assert_eq!(result.weaknesses()[0], "Origin IP discovery via DNS records");
    }

    #[tokio::test]
    async fn test_mostly_blocked_is_generic_waf() {
        let fixture = fixture();
        let prober = Arc::new(FakeProber::new(Ok(snapshot(200, &[], "welcome")), 7));

        let result = detector(&fixture, prober.clone())
            .detect_waf("10.0.0.5", Duration::from_secs(300), false)
            .await
            .unwrap();

        assert_eq!(result.response_analysis().total_payloads, 8);
        assert_eq!(result.response_analysis().blocked_payloads, 7);
        assert_eq!(result.waf_type(), Some(GENERIC_WAF_TYPE));
        assert_eq!(result.waf_name(), Some(GENERIC_WAF_NAME));
        assert_eq!(result.confidence(), 0.9);

        let requests = prober.requests.lock().unwrap();
        assert_eq!(requests.len(), 9);
        assert!(requests[1].starts_with("http://10.0.0.5/?test_xss=%3Cscript%3E"));
    }

    #[tokio::test]
    async fn test_half_blocked_is_possible_waf() {
        let fixture = fixture();
        let prober = Arc::new(FakeProber::new(Ok(snapshot(200, &[], "")), 4));
        let result = detector(&fixture, prober)
            .detect_waf("10.0.0.5", Duration::from_secs(300), false)
            .await
            .unwrap();
        assert_eq!(result.waf_type(), Some(POSSIBLE_WAF_TYPE));
        assert_eq!(result.waf_name(), Some(POSSIBLE_WAF_NAME));
        assert_eq!(result.confidence(), 0.7);
        assert_eq!(result.weaknesses().len(), GENERIC_WEAKNESSES.len());
    }

    #[tokio::test]
    async fn test_baseline_403_without_candidate() {
        let fixture = fixture();
        let prober = Arc::new(FakeProber::new(Ok(snapshot(403, &[], "Forbidden")), 0));
        let result = detector(&fixture, prober)
            .detect_waf("10.0.0.5", Duration::from_secs(300), false)
            .await
            .unwrap();
        assert_eq!(result.waf_type(), Some(GENERIC_WAF_TYPE));
        assert_eq!(result.confidence(), 0.8);
        assert!(result.response_analysis().baseline.as_ref().unwrap().waf_blocked);
    }

    #[tokio::test]
    async fn test_transport_errors_are_not_blocks() {
        let fixture = fixture();
        let mut prober = FakeProber::new(Ok(snapshot(200, &[], "")), 0);
        prober.payload_error = true;
        let result = detector(&fixture, Arc::new(prober))
            .detect_waf("10.0.0.5", Duration::from_secs(300), false)
            .await
            .unwrap();

        let analysis = result.response_analysis();
        assert_eq!(analysis.blocked_payloads, 0);
        assert!(analysis.payload_probes.iter().all(|p| p.error.is_some() && !p.blocked));
        assert!(!result.detected());
        assert_eq!(result.confidence(), 0.0);
        assert_eq!(result.recommendations().len(), 9);
    }

    #[tokio::test]
    async fn test_unreachable_baseline_skips_payloads() {
        let fixture = fixture();
        let prober = Arc::new(FakeProber::new(Err(ScannerError::http(None, "connection refused")), 0));
        let result = detector(&fixture, prober.clone())
            .detect_waf("10.0.0.5", Duration::from_secs(300), false)
            .await
            .unwrap();
        assert!(!result.detected());
        assert_eq!(result.response_analysis().errors.len(), 1);
        assert_eq!(prober.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_budget_stops_payload_probing() {
        let fixture = fixture();
        let mut prober = FakeProber::new(Ok(snapshot(200, &[], "")), 0);
        prober.payload_delay = Duration::from_millis(400);
        let prober = Arc::new(prober);

        let result = detector(&fixture, prober.clone())
            .detect_waf("10.0.0.5", Duration::from_secs(1), false)
            .await
            .unwrap();

        let analysis = result.response_analysis();
        assert_eq!(analysis.total_payloads, 3);
        assert_eq!(analysis.payload_probes.len(), 3);
        assert_eq!(
            analysis.errors,
            vec!["WAF budget exhausted after 3 payload probes".to_string()]
        );
        assert_eq!(prober.requests.lock().unwrap().len(), 4);
        assert!(!result.detected());
        assert!(result.result_folder().is_some());
    }

    #[tokio::test]
    async fn test_intensive_runs_nmap_scripts_and_saves() {
        let fixture = fixture();
        let prober = Arc::new(FakeProber::new(Ok(snapshot(200, &[], "")), 0));
        let detector = detector(&fixture, prober);
        let result = detector
            .detect_waf("10.0.0.5", Duration::from_secs(300), true)
            .await
            .unwrap();

        let nmap = result.response_analysis().nmap.as_ref().unwrap();
        assert_eq!(nmap.outcomes.len(), 2);
        assert!(nmap.errors.is_empty());
        assert_eq!(result.detection_methods(), &[METHOD_NMAP_SCRIPTS.to_string()]);

        let loaded = detector
            .store
            .load_waf_result(result.result_folder().unwrap())
            .await
            .unwrap();
        assert_eq!(loaded, result);
    }

    #[tokio::test]
    async fn test_rejects_bad_input() {
        let fixture = fixture();
        let prober = Arc::new(FakeProber::new(Ok(snapshot(200, &[], "")), 0));
        let detector = detector(&fixture, prober);
        assert_eq!(
            detector.detect_waf("", Duration::from_secs(300), false).await.unwrap_err().code(),
            "INVALID_TARGET"
        );
        assert_eq!(
            detector.detect_waf("10.0.0.5", Duration::ZERO, false).await.unwrap_err().code(),
            "BUDGET_EXHAUSTED"
        );
    }
}
