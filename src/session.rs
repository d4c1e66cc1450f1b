//! Scan-management session client
//!
//! Token-authenticated client for a Nessus-style REST API plus a controller
//! that checks a scan's current status before changing it.

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::{
    config::SessionConfig,
    error::{Result, ScannerError},
    logging::log_audit_event,
};

/// A scan known to the management service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedScan {
    pub id: u64,
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyTemplate {
    pub title: String,
    pub uuid: String,
}

#[async_trait]
pub trait ScanManagementClient: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> Result<()>;
    async fn list_scans(&self) -> Result<Vec<ManagedScan>>;
    async fn list_policies(&self) -> Result<Vec<PolicyTemplate>>;
    /// Launch a scan; returns the job identifier
    async fn launch(&self, scan_id: u64) -> Result<String>;
    async fn pause(&self, scan_id: u64) -> Result<()>;
    async fn resume(&self, scan_id: u64) -> Result<()>;
    async fn stop(&self, scan_id: u64) -> Result<()>;
    async fn logout(&self) -> Result<()>;
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Deserialize)]
struct ScansResponse {
    #[serde(default)]
    scans: Option<Vec<ManagedScan>>,
}

#[derive(Deserialize)]
struct TemplatesResponse {
    #[serde(default)]
    templates: Vec<PolicyTemplate>,
}

#[derive(Deserialize)]
struct LaunchResponse {
    scan_uuid: String,
}

#[derive(Deserialize)]
struct UpstreamErrorBody {
    error: Option<String>,
}

/// Error for a non-2xx answer, using the service's `error` field when present
pub fn upstream_error(status: u16, body: &[u8]) -> ScannerError {
    let message = serde_json::from_slice::<UpstreamErrorBody>(body)
        .ok()
        .and_then(|b| b.error)
        .unwrap_or_else(|| format!("HTTP Error: {}", status));
    ScannerError::upstream(Some(status), message)
}

/// `reqwest` client for the Nessus REST API
pub struct NessusClient {
    client: reqwest::Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl NessusClient {
    pub fn new(config: &SessionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!config.verify_tls)
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: RwLock::new(None),
        })
    }

    /// Build a client and log in with the configured credentials
    pub async fn connect(config: &SessionConfig) -> Result<Self> {
        let (Some(username), Some(password)) = (config.username.as_deref(), config.password.as_deref()) else {
            return Err(ScannerError::config(
                "session credentials missing; set RECON_SESSION__USERNAME and RECON_SESSION__PASSWORD",
            ));
        };
        let client = Self::new(config)?;
        client.login(username, password).await?;
        Ok(client)
    }

    async fn call(&self, method: Method, resource: &str, body: Option<serde_json::Value>) -> Result<Vec<u8>> {
        let url = format!("{}{}", self.base_url, resource);
        let mut request = self
            .client
            .request(method.clone(), &url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(token) = self.token.read().await.as_deref() {
            request = request.header("X-Cookie", format!("token={}", token));
        }
        if let Some(body) = body {
            request = request.body(body.to_string());
        }

        tracing::debug!(%method, resource, "Scan-management request");
        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?.to_vec();

        if !status.is_success() {
            let error = upstream_error(status.as_u16(), &bytes);
            tracing::warn!(%method, resource, status = status.as_u16(), "{}", error);
            return Err(error);
        }
        Ok(bytes)
    }

    async fn call_json<T: DeserializeOwned>(&self, method: Method, resource: &str, body: Option<serde_json::Value>) -> Result<T> {
        let bytes = self.call(method, resource, body).await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            ScannerError::upstream(
                Some(StatusCode::OK.as_u16()),
                format!("unexpected response from {}: {}", resource, e),
            )
        })
    }

    async fn require_token(&self) -> Result<()> {
        if self.token.read().await.is_none() {
            return Err(ScannerError::upstream(
                None,
                "not logged in to the scan-management service",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ScanManagementClient for NessusClient {
    async fn login(&self, username: &str, password: &str) -> Result<()> {
        let body = serde_json::json!({ "username": username, "password": password });
        let response: TokenResponse = self.call_json(Method::POST, "/session", Some(body)).await?;
        *self.token.write().await = Some(response.token);
        log_audit_event(Some(username), "login", &self.base_url, "success");
        Ok(())
    }

    async fn list_scans(&self) -> Result<Vec<ManagedScan>> {
        self.require_token().await?;
        let response: ScansResponse = self.call_json(Method::GET, "/scans", None).await?;
        Ok(response.scans.unwrap_or_default())
    }

    async fn list_policies(&self) -> Result<Vec<PolicyTemplate>> {
        self.require_token().await?;
        let response: TemplatesResponse = self
            .call_json(Method::GET, "/editor/policy/templates", None)
            .await?;
        Ok(response.templates)
    }

    async fn launch(&self, scan_id: u64) -> Result<String> {
        self.require_token().await?;
        let response: LaunchResponse = self
            .call_json(Method::POST, &format!("/scans/{}/launch", scan_id), None)
            .await?;
        Ok(response.scan_uuid)
    }

    async fn pause(&self, scan_id: u64) -> Result<()> {
        self.require_token().await?;
        self.call(Method::POST, &format!("/scans/{}/pause", scan_id), None).await?;
        Ok(())
    }

    async fn resume(&self, scan_id: u64) -> Result<()> {
        self.require_token().await?;
        self.call(Method::POST, &format!("/scans/{}/resume", scan_id), None).await?;
        Ok(())
    }

    async fn stop(&self, scan_id: u64) -> Result<()> {
        self.require_token().await?;
        self.call(Method::POST, &format!("/scans/{}/stop", scan_id), None).await?;
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        if self.token.read().await.is_none() {
            return Ok(());
        }
        self.call(Method::DELETE, "/session", None).await?;
        *self.token.write().await = None;
        Ok(())
    }
}

/// State change requested for a managed scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanAction {
    Launch,
    Pause,
    Resume,
    Stop,
}

impl ScanAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Launch => "launch",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
        }
    }

    /// Statuses from which the action may be issued
    pub fn allowed_from(&self) -> &'static [&'static str] {
        match self {
            Self::Launch => &["stopped", "completed", "aborted", "canceled", "on demand", "empty"],
            Self::Pause => &["running"],
            Self::Resume => &["paused"],
            Self::Stop => &["running", "paused"],
        }
    }

    pub fn permits(&self, status: &str) -> bool {
        let status = status.trim().to_lowercase();
        self.allowed_from().contains(&status.as_str())
    }
}

/// What a guarded action did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionReport {
    pub scan_id: u64,
    pub scan_name: String,
    pub action: &'static str,
    pub previous_status: String,
    /// Job identifier returned by a launch
    pub job_id: Option<String>,
}

/// Applies status-aware guards before issuing scan actions
pub struct SessionController {
    client: Arc<dyn ScanManagementClient>,
}

impl SessionController {
    pub fn new(client: Arc<dyn ScanManagementClient>) -> Self {
        Self { client }
    }

    pub async fn list_scans(&self) -> Result<Vec<ManagedScan>> {
        self.client.list_scans().await
    }

    pub async fn list_policies(&self) -> Result<Vec<PolicyTemplate>> {
        self.client.list_policies().await
    }

    /// Check the scan's current status, then issue `action`
    pub async fn apply(&self, action: ScanAction, scan_id: u64) -> Result<ActionReport> {
        let scans = self.client.list_scans().await?;
        let scan = scans
            .into_iter()
            .find(|s| s.id == scan_id)
            .ok_or_else(|| ScannerError::validation("scan_id", format!("no scan with id {}", scan_id)))?;

        if !action.permits(&scan.status) {
            log_audit_event(None, action.as_str(), &scan_id.to_string(), "rejected");
            return Err(ScannerError::validation(
                "scan_id",
                format!(
                    "cannot {} scan {} ({}) while it is {}",
                    action.as_str(),
                    scan_id,
                    scan.name,
                    scan.status
                ),
            ));
        }

        let job_id = match action {
            ScanAction::Launch => Some(self.client.launch(scan_id).await?),
            ScanAction::Pause => {
                self.client.pause(scan_id).await?;
                None
            }
            ScanAction::Resume => {
                self.client.resume(scan_id).await?;
                None
            }
            ScanAction::Stop => {
                self.client.stop(scan_id).await?;
                None
            }
        };
        log_audit_event(None, action.as_str(), &scan_id.to_string(), "success");

        Ok(ActionReport {
            scan_id,
            scan_name: scan.name,
            action: action.as_str(),
            previous_status: scan.status,
            job_id,
        })
    }

    pub async fn close(&self) -> Result<()> {
        self.client.logout().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// In-memory service recording the calls it receives
    struct FakeService {
        scans: Vec<ManagedScan>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeService {
        fn with(scans: &[(u64, &str)]) -> Arc<Self> {
            Arc::new(Self {
                scans: scans
                    .iter()
                    .map(|(id, status)| ManagedScan {
                        id: *id,
                        name: format!("scan-{}", id),
                        status: status.to_string(),
                    })
                    .collect(),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl ScanManagementClient for FakeService {
        async fn login(&self, _username: &str, _password: &str) -> Result<()> {
            Ok(())
        }
        async fn list_scans(&self) -> Result<Vec<ManagedScan>> {
            Ok(self.scans.clone())
        }
        async fn list_policies(&self) -> Result<Vec<PolicyTemplate>> {
            Ok(vec![PolicyTemplate {
                title: "Basic Network Scan".to_string(),
                uuid: "731a8e52".to_string(),
            }])
        }
        async fn launch(&self, scan_id: u64) -> Result<String> {
            self.record(format!("launch {}", scan_id));
            Ok("job-1".to_string())
        }
        async fn pause(&self, scan_id: u64) -> Result<()> {
            self.record(format!("pause {}", scan_id));
            Ok(())
        }
        async fn resume(&self, scan_id: u64) -> Result<()> {
            self.record(format!("resume {}", scan_id));
            Ok(())
        }
        async fn stop(&self, scan_id: u64) -> Result<()> {
            self.record(format!("stop {}", scan_id));
            Ok(())
        }
        async fn logout(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_upstream_error_prefers_service_message() {
        let err = upstream_error(401, br#"{"error":"Invalid Credentials"}"#);
        assert_eq!(err, ScannerError::upstream(Some(401), "Invalid Credentials"));

        let err = upstream_error(502, b"<html>bad gateway</html>");
        assert_eq!(err, ScannerError::upstream(Some(502), "HTTP Error: 502"));
        assert_eq!(err.code(), "UPSTREAM_ERROR");
    }

    #[test]
    fn test_action_guards() {
        assert!(ScanAction::Launch.permits("On Demand"));
        assert!(ScanAction::Launch.permits("completed"));
        assert!(!ScanAction::Launch.permits("running"));
        assert!(ScanAction::Pause.permits("running"));
        assert!(!ScanAction::Pause.permits("paused"));
        assert!(ScanAction::Resume.permits("paused"));
        assert!(ScanAction::Stop.permits("paused"));
        assert!(!ScanAction::Stop.permits("completed"));
    }

    #[tokio::test]
    async fn test_launch_returns_job_id() {
        let service = FakeService::with(&[(7, "completed")]);
        let controller = SessionController::new(service.clone());
        let report = controller.apply(ScanAction::Launch, 7).await.unwrap();
        assert_eq!(report.job_id.as_deref(), Some("job-1"));
        assert_eq!(report.previous_status, "completed");
        assert_eq!(*service.calls.lock().unwrap(), vec!["launch 7".to_string()]);
    }

    #[tokio::test]
    async fn test_guard_violation_sends_nothing() {
        let service = FakeService::with(&[(3, "running")]);
        let controller = SessionController::new(service.clone());

        let err = controller.apply(ScanAction::Resume, 3).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(service.calls.lock().unwrap().is_empty());

        controller.apply(ScanAction::Pause, 3).await.unwrap();
        assert_eq!(*service.calls.lock().unwrap(), vec!["pause 3".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_scan_is_rejected() {
        let controller = SessionController::new(FakeService::with(&[(1, "paused")]));
        let err = controller.apply(ScanAction::Stop, 99).await.unwrap_err();
        assert!(matches!(err, ScannerError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_connect_requires_credentials() {
        let config = SessionConfig {
            base_url: "https://localhost:8834".to_string(),
            username: None,
            password: None,
            verify_tls: false,
            request_timeout_secs: 5,
        };
        let err = match NessusClient::connect(&config).await {
            Ok(_) => panic!("connect should fail without credentials"),
            Err(e) => e,
        };
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
    }

    #[tokio::test]
    async fn test_requests_need_login() {
        let config = SessionConfig {
            base_url: "https://localhost:8834".to_string(),
            username: None,
            password: None,
            verify_tls: false,
            request_timeout_secs: 5,
        };
        let client = NessusClient::new(&config).unwrap();
        assert!(matches!(
            client.list_scans().await,
            Err(ScannerError::Upstream { status: None, .. })
        ));
        assert!(client.logout().await.is_ok());
    }
}
