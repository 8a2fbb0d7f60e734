//! Backend controller push client.
//!
//! The runtime is the client: it registers its capabilities on startup,
//! pushes health snapshots on change and on heartbeat, and deregisters
//! on graceful shutdown. All calls are best-effort; a backend outage
//! never affects serving. Every call carries a correlation id for
//! tracing across the two processes.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::error::{ErrorCode, Result, RuntimeError};
use crate::reporting::FullCapabilityReport;

/// Push interface to the backend controller.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Register the runtime and its full capability report.
    async fn register_capabilities(
        &self,
        report: &FullCapabilityReport,
        correlation_id: &str,
    ) -> Result<()>;

    /// Push a health snapshot.
    async fn push_health(&self, report: &FullCapabilityReport, correlation_id: &str)
        -> Result<()>;

    /// Deregister on shutdown. Best effort.
    async fn deregister(&self, runtime_id: &str, correlation_id: &str) -> Result<()>;
}

/// Client used when no backend is configured. Accepts everything.
#[derive(Debug, Default)]
pub struct NoopBackendClient;

#[async_trait]
impl BackendClient for NoopBackendClient {
    async fn register_capabilities(
        &self,
        report: &FullCapabilityReport,
        correlation_id: &str,
    ) -> Result<()> {
        debug!(
            correlation_id,
            models = report.models.len(),
            "no backend configured, dropping registration"
        );
        Ok(())
    }

    async fn push_health(
        &self,
        _report: &FullCapabilityReport,
        correlation_id: &str,
    ) -> Result<()> {
        debug!(correlation_id, "no backend configured, dropping health push");
        Ok(())
    }

    async fn deregister(&self, _runtime_id: &str, correlation_id: &str) -> Result<()> {
        debug!(correlation_id, "no backend configured, dropping deregistration");
        Ok(())
    }
}

/// HTTP client for the backend's internal runtime endpoints.
pub struct HttpBackendClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    service_token: Option<String>,
}

impl HttpBackendClient {
    /// Build a client for `base_url` (no trailing slash required).
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        service_token: Option<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| {
                RuntimeError::new(ErrorCode::PipeGenericError, "failed to build backend client")
                    .with_cause(e)
            })?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            service_token,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str, correlation_id: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{path}", self.base_url))
            .header("X-Correlation-ID", correlation_id);
        if let Some(api_key) = &self.api_key {
            builder = builder.header("X-API-Key", api_key);
        }
        if let Some(token) = &self.service_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn send_checked(
        &self,
        builder: reqwest::RequestBuilder,
        what: &str,
        correlation_id: &str,
    ) -> Result<()> {
        let response = builder.send().await.map_err(|e| {
            warn!(correlation_id, what, error = %e, "backend call failed");
            RuntimeError::new(ErrorCode::PipeGenericError, format!("backend {what} failed"))
                .with_cause(e)
        })?;

        let status = response.status();
        if status.is_success() {
            debug!(correlation_id, what, "backend call succeeded");
            return Ok(());
        }
        warn!(correlation_id, what, status = %status, "backend rejected call");
        Err(RuntimeError::new(
            ErrorCode::PipeGenericError,
            format!("backend {what} returned {status}"),
        )
        .with_actual(status.as_str()))
    }
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn register_capabilities(
        &self,
        report: &FullCapabilityReport,
        correlation_id: &str,
    ) -> Result<()> {
        let builder = self
            .request(
                reqwest::Method::POST,
                "/internal/v1/ai-runtime/register",
                correlation_id,
            )
            .json(report);
        self.send_checked(builder, "registration", correlation_id).await
    }

    async fn push_health(
        &self,
        report: &FullCapabilityReport,
        correlation_id: &str,
    ) -> Result<()> {
        let builder = self
            .request(
                reqwest::Method::POST,
                "/internal/v1/ai-runtime/health",
                correlation_id,
            )
            .json(report);
        self.send_checked(builder, "health push", correlation_id).await
    }

    async fn deregister(&self, runtime_id: &str, correlation_id: &str) -> Result<()> {
        let builder = self
            .request(
                reqwest::Method::DELETE,
                "/internal/v1/ai-runtime/deregister",
                correlation_id,
            )
            .json(&serde_json::json!({ "runtime_id": runtime_id }));
        match self.send_checked(builder, "deregistration", correlation_id).await {
            Ok(()) => Ok(()),
            // A backend that never saw us is fine on the way out.
            Err(e) if e.context.actual.as_deref() == Some(StatusCode::NOT_FOUND.as_str()) => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalization() {
        let client = HttpBackendClient::new("http://backend:8080/", None, None).unwrap();
        assert_eq!(client.base_url, "http://backend:8080");
    }

    #[tokio::test]
    async fn test_noop_client_accepts_everything() {
        let client = NoopBackendClient;
        assert!(client.deregister("runtime-1", "corr-1").await.is_ok());
    }
}
