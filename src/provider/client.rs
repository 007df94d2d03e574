//! Provider API client.
//!
//! Read-only endpoints only: `/installs` and `/installs/<name>`, HTTP Basic
//! authentication, bounded retries on transient failures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, Retryable};
use rand::Rng;
use serde::Deserialize;

use super::http::reqwest_transport::ReqwestTransport;
use super::http::{HttpError, HttpMethod, HttpRequest, HttpResponse, HttpTransport};
use super::types::ProviderSite;
use crate::credentials::{CredentialField, Credentials};
use crate::error::{Result, StaxError};

/// Total attempts per request, including the first.
const MAX_ATTEMPTS: usize = 3;

/// Exponential backoff with symmetric jitter: base 500 ms, cap 8 s, ±25%.
#[derive(Debug, Clone)]
pub struct ApiBackoff {
    pub base: Duration,
    pub cap: Duration,
    pub retries: usize,
    pub jitter: f64,
}

impl Default for ApiBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(8),
            retries: MAX_ATTEMPTS - 1,
            jitter: 0.25,
        }
    }
}

impl ApiBackoff {
    /// Delays before each retry.
    pub fn delays(&self) -> Vec<Duration> {
        let mut rng = rand::thread_rng();
        (0..self.retries)
            .map(|attempt| {
                let exp = self.base.saturating_mul(1u32 << attempt.min(16));
                let capped = exp.min(self.cap).as_secs_f64();
                let factor = if self.jitter > 0.0 {
                    rng.gen_range((1.0 - self.jitter)..=(1.0 + self.jitter))
                } else {
                    1.0
                };
                Duration::from_secs_f64(capped * factor)
            })
            .collect()
    }
}

impl BackoffBuilder for ApiBackoff {
    type Backoff = std::vec::IntoIter<Duration>;

    fn build(self) -> Self::Backoff {
        self.delays().into_iter()
    }
}

/// One failed attempt, split by whether it is worth retrying.
#[derive(Debug)]
enum Attempt {
    Transient(String),
    Terminal(StaxError),
}

impl std::fmt::Display for Attempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Attempt::Transient(msg) => f.write_str(msg),
            Attempt::Terminal(e) => write!(f, "{}", e),
        }
    }
}

/// The read-only slice of the provider API stax consumes.
#[async_trait]
pub trait ProviderApi: Send + Sync {
    async fn list_installs(&self) -> Result<Vec<ProviderSite>>;
    async fn get_install(&self, name: &str) -> Result<ProviderSite>;
}

#[derive(Deserialize)]
struct InstallPage {
    results: Vec<ProviderSite>,
    #[serde(default)]
    next: Option<String>,
}

/// HTTP client for the provider API.
#[derive(Clone)]
pub struct ProviderClient {
    transport: Arc<dyn HttpTransport>,
    base: String,
    user: String,
    password: String,
    backoff: ApiBackoff,
}

impl std::fmt::Debug for ProviderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderClient")
            .field("base", &self.base)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl ProviderClient {
    /// Create a client backed by reqwest.
    pub fn new(base: &str, credentials: &Credentials) -> Result<Self> {
        let transport = ReqwestTransport::with_timeout(Duration::from_secs(60))
            .map_err(|e| StaxError::transport(e.to_string()))?;
        Self::new_with_transport(base, credentials, Arc::new(transport))
    }

    pub fn new_with_transport(
        base: &str,
        credentials: &Credentials,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self> {
        credentials.require(&[CredentialField::ApiUser, CredentialField::ApiPassword])?;
        Ok(Self {
            transport,
            base: base.trim_end_matches('/').to_string(),
            user: credentials.api_user.clone().unwrap_or_default(),
            password: credentials
                .api_password
                .as_ref()
                .map(|s| s.expose().to_string())
                .unwrap_or_default(),
            backoff: ApiBackoff::default(),
        })
    }

    /// Replace the retry schedule (tests use a zero-delay schedule).
    #[must_use]
    pub fn with_backoff(mut self, backoff: ApiBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    async fn get_once(&self, url: &str) -> std::result::Result<HttpResponse, Attempt> {
        let request = HttpRequest {
            method: HttpMethod::Get,
            url: url.to_string(),
            headers: vec![("Accept".to_string(), "application/json".to_string())],
            basic_auth: Some((self.user.clone(), self.password.clone())),
        };

        match self.transport.send(request).await {
            Ok(resp) => match resp.status {
                200..=299 => Ok(resp),
                401 | 403 => Err(Attempt::Terminal(StaxError::CredentialsRejected(format!(
                    "provider API returned {} for {}",
                    resp.status, url
                )))),
                404 => Err(Attempt::Terminal(StaxError::invalid(format!(
                    "provider API has no resource at {}",
                    url
                )))),
                500..=599 => Err(Attempt::Transient(format!(
                    "provider API returned {} for {}",
                    resp.status, url
                ))),
                other => Err(Attempt::Terminal(StaxError::Internal(format!(
                    "provider API returned unexpected status {} for {}",
                    other, url
                )))),
            },
            Err(HttpError::Connection(msg)) => Err(Attempt::Transient(msg)),
            Err(HttpError::Other(msg)) => Err(Attempt::Terminal(StaxError::transport(msg))),
        }
    }

    /// GET with retries on 5xx and connection failures.
    async fn get(&self, url: &str) -> Result<HttpResponse> {
        let result = (|| self.get_once(url))
            .retry(self.backoff.clone())
            .when(|e| matches!(e, Attempt::Transient(_)))
            .notify(|e, delay| {
                tracing::debug!(url, error = %e, ?delay, "retrying provider API request");
            })
            .await;

        result.map_err(|e| match e {
            Attempt::Transient(msg) => StaxError::TransportUnavailable(format!(
                "{} (after {} attempts)",
                msg,
                self.backoff.retries + 1
            )),
            Attempt::Terminal(e) => e,
        })
    }
}

#[async_trait]
impl ProviderApi for ProviderClient {
    async fn list_installs(&self) -> Result<Vec<ProviderSite>> {
        let mut installs = Vec::new();
        let mut next = Some(format!("{}/installs", self.base));

        while let Some(url) = next.take() {
            let resp = self.get(&url).await?;
            let page: InstallPage = serde_json::from_slice(&resp.body)?;
            installs.extend(page.results);
            next = page.next.filter(|n| !n.is_empty());
        }

        Ok(installs)
    }

    async fn get_install(&self, name: &str) -> Result<ProviderSite> {
        crate::transport::sanitize::check_token(name)?;
        let resp = self.get(&format!("{}/installs/{}", self.base, name)).await?;
        Ok(serde_json::from_slice(&resp.body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Secret;
    use crate::provider::http::MockTransport;

    const BASE: &str = "https://api.test/v1";

    fn creds() -> Credentials {
        Credentials {
            api_user: Some("u".into()),
            api_password: Some(Secret::new("p")),
            ..Default::default()
        }
    }

    fn client(mock: &MockTransport) -> ProviderClient {
        ProviderClient::new_with_transport(BASE, &creds(), Arc::new(mock.clone()))
            .unwrap()
            .with_backoff(ApiBackoff {
                base: Duration::ZERO,
                cap: Duration::ZERO,
                retries: 2,
                jitter: 0.0,
            })
    }

    const SITE: &str = r#"{"name":"mysite","environment":"production","primary_domain":"example.wpengine.com","php_version":"8.2"}"#;

    #[tokio::test]
    async fn retries_server_errors_then_succeeds() {
        let mock = MockTransport::new();
        let url = format!("{}/installs/mysite", BASE);
        mock.push_json(&url, 502, "bad gateway");
        mock.push(&url, Err(HttpError::Connection("reset".into())));
        mock.push_json(&url, 200, SITE);

        let site = client(&mock).get_install("mysite").await.unwrap();
        assert_eq!(site.primary_domain, "example.wpengine.com");
        assert_eq!(mock.requests().len(), 3);
        assert_eq!(
            mock.requests()[0].basic_auth,
            Some(("u".to_string(), "p".to_string()))
        );
    }

    #[tokio::test]
    async fn gives_up_after_three_attempts() {
        let mock = MockTransport::new();
        let url = format!("{}/installs/mysite", BASE);
        for _ in 0..4 {
            mock.push_json(&url, 503, "unavailable");
        }

        let err = client(&mock).get_install("mysite").await.unwrap_err();
        assert!(matches!(err, StaxError::TransportUnavailable(_)));
        assert_eq!(mock.requests().len(), 3);
    }

    #[tokio::test]
    async fn unauthorized_is_terminal() {
        let mock = MockTransport::new();
        let url = format!("{}/installs/mysite", BASE);
        mock.push_json(&url, 401, "nope");
        mock.push_json(&url, 200, SITE);

        let err = client(&mock).get_install("mysite").await.unwrap_err();
        assert!(matches!(err, StaxError::CredentialsRejected(_)));
        assert_eq!(mock.requests().len(), 1);
    }

    #[tokio::test]
    async fn list_follows_pagination() {
        let mock = MockTransport::new();
        let page2 = format!("{}/installs?offset=1", BASE);
        mock.push_json(
            format!("{}/installs", BASE),
            200,
            &format!(r#"{{"results":[{}],"next":"{}"}}"#, SITE, page2),
        );
        mock.push_json(
            &page2,
            200,
            r#"{"results":[{"name":"mysitestg","environment":"staging","primary_domain":"mysitestg.wpengine.com"}],"next":null}"#,
        );

        let installs = client(&mock).list_installs().await.unwrap();
        assert_eq!(installs.len(), 2);
        assert_eq!(installs[1].install_name, "mysitestg");
    }

    #[tokio::test]
    async fn rejects_unsafe_install_names() {
        let mock = MockTransport::new();
        let err = client(&mock).get_install("../admin").await.unwrap_err();
        assert!(matches!(err, StaxError::InvalidArgument(_)));
        assert!(mock.requests().is_empty());
    }

    #[test]
    fn backoff_stays_within_jitter_bounds() {
        let delays = ApiBackoff::default().delays();
        assert_eq!(delays.len(), 2);
        assert!(delays[0] >= Duration::from_millis(375) && delays[0] <= Duration::from_millis(625));
        assert!(delays[1] >= Duration::from_millis(750) && delays[1] <= Duration::from_millis(1250));

        let capped = ApiBackoff {
            retries: 8,
            jitter: 0.0,
            ..Default::default()
        }
        .delays();
        assert_eq!(capped[7], Duration::from_secs(8));
    }
}
