use super::ScanService;
use crate::settings::LedgerSettings;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

/// REST client for the scanning service's session status endpoint.
#[derive(Debug, Clone)]
pub struct HttpScanService {
    http: Client,
    base: String,
    api_key: String,
}

impl HttpScanService {
    pub fn new(settings: &LedgerSettings) -> Result<Self> {
        let base = settings
            .scan_endpoint
            .clone()
            .ok_or_else(|| {
                anyhow!(
                    "scanning service endpoint must be provided via {}",
                    LedgerSettings::ENDPOINT_ENV
                )
            })?;
        let api_key = settings.api_key.clone().unwrap_or_default();
        if api_key.trim().is_empty() {
            bail!(
                "scanning service API key must be provided via {}",
                LedgerSettings::API_KEY_ENV
            );
        }
        let http = Client::builder()
            .user_agent("scone-ledger/0.3")
            .timeout(settings.poll_timeout)
            .build()
            .context("failed to build scanning service HTTP client")?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn session_url(&self, external_ref: &str) -> String {
        format!("{}/v1/sessions/{}", self.base, external_ref.trim_start_matches('/'))
    }
}

#[async_trait]
impl ScanService for HttpScanService {
    async fn session_status(&self, external_ref: &str) -> Result<String> {
        let response = self
            .http
            .get(self.session_url(external_ref))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .context("failed to call scanning service")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("scanning service API error ({}): {}", status, body);
        }

        let status: SessionStatusResponse = response
            .json()
            .await
            .context("failed to parse scanning service response")?;
        status
            .state
            .filter(|state| !state.trim().is_empty())
            .ok_or_else(|| anyhow!("scanning service response missing session state"))
    }
}

#[derive(Deserialize)]
struct SessionStatusResponse {
    state: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use std::time::Duration;

    fn settings(url: String) -> LedgerSettings {
        LedgerSettings {
            scan_endpoint: Some(url),
            api_key: Some("test-key".into()),
            poll_timeout: Duration::from_secs(5),
            ..LedgerSettings::default()
        }
    }

    #[test]
    fn requires_endpoint_and_key() {
        let err = HttpScanService::new(&LedgerSettings::default()).unwrap_err();
        assert!(err.to_string().contains(LedgerSettings::ENDPOINT_ENV));

        let mut missing_key = settings("http://localhost".into());
        missing_key.api_key = None;
        let err = HttpScanService::new(&missing_key).unwrap_err();
        assert!(err.to_string().contains(LedgerSettings::API_KEY_ENV));
    }

    #[test]
    fn builds_session_url_without_double_slashes() {
        let service = HttpScanService::new(&settings("https://scan.example/".into())).unwrap();
        assert_eq!(
            service.session_url("jules-42"),
            "https://scan.example/v1/sessions/jules-42"
        );
    }

    #[tokio::test]
    #[ignore = "requires loopback networking"]
    async fn reads_session_state() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/v1/sessions/jules-42")
                .header("authorization", "Bearer test-key");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"state":"IN_PROGRESS","title":"audit"}"#);
        });

        let service = HttpScanService::new(&settings(server.base_url())).unwrap();
        let state = service.session_status("jules-42").await.unwrap();
        assert_eq!(state, "IN_PROGRESS");
        mock.assert();
    }

    #[tokio::test]
    #[ignore = "requires loopback networking"]
    async fn surfaces_api_errors() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/v1/sessions/jules-42");
            then.status(503).body("maintenance");
        });

        let service = HttpScanService::new(&settings(server.base_url())).unwrap();
        let err = service.session_status("jules-42").await.unwrap_err();
        assert!(err.to_string().contains("scanning service API error"));
        mock.assert_hits(1);
    }
}
