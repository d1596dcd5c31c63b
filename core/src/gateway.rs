//! Broadcast gateway.
//!
//! One payload, one attempt. The gateway never retries and never queues;
//! whatever happens on the wire is reported back once and the caller records
//! it in the ledger.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;
use vigil_protocol::BroadcastPayload;

use crate::config::BroadcastConfig;
use crate::error::Result;
use crate::error::SwitchError;

/// How much of a rejecting response body ends up in the error message.
const ERROR_BODY_LIMIT: usize = 256;

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Deliver the payload to the outside world. `Ok` carries the remote
    /// publication id. Called at most once per switch lifetime.
    async fn publish(&self, payload: &BroadcastPayload) -> Result<String>;
}

/// POSTs the payload as JSON to the configured webhook.
pub struct WebhookPublisher {
    client: reqwest::Client,
    endpoint: Option<String>,
    timeout: Duration,
}

impl WebhookPublisher {
    pub fn from_config(config: &BroadcastConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_seconds);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SwitchError::publish(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            timeout,
        })
    }
}

#[async_trait]
impl Publisher for WebhookPublisher {
    async fn publish(&self, payload: &BroadcastPayload) -> Result<String> {
        let Some(endpoint) = &self.endpoint else {
            return Err(SwitchError::publish("no broadcast endpoint configured"));
        };
        tracing::info!(endpoint, "delivering terminal broadcast");
        let response = self
            .client
            .post(endpoint)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SwitchError::publish(format!(
                        "publish timed out after {}s",
                        self.timeout.as_secs()
                    ))
                } else {
                    SwitchError::publish(format!("publish request failed: {e}"))
                }
            })?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            let mut body = body;
            body.truncate(ERROR_BODY_LIMIT);
            return Err(SwitchError::publish(format!(
                "endpoint returned {status}: {body}"
            )));
        }
        // Endpoints that echo a publication id get it recorded verbatim;
        // everything else gets a locally minted one.
        let id = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| {
                v.get("publication_id")
                    .and_then(|id| id.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Ok(id)
    }
}

/// In-memory publisher for tests: records every payload it is handed and
/// returns a canned outcome.
#[derive(Default)]
pub struct StubPublisher {
    calls: Mutex<Vec<BroadcastPayload>>,
    fail_with: Option<String>,
}

impl StubPublisher {
    pub fn succeeding() -> Self {
        Self::default()
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_with: Some(message.into()),
        }
    }

    pub fn publish_count(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or(0)
    }

    pub fn published(&self) -> Vec<BroadcastPayload> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Publisher for StubPublisher {
    async fn publish(&self, payload: &BroadcastPayload) -> Result<String> {
        let count = {
            let mut calls = self
                .calls
                .lock()
                .map_err(|_| SwitchError::publish("stub mutex poisoned"))?;
            calls.push(payload.clone());
            calls.len()
        };
        match &self.fail_with {
            Some(message) => Err(SwitchError::publish(message.clone())),
            None => Ok(format!("stub-{count}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    fn payload() -> BroadcastPayload {
        BroadcastPayload {
            text: "the operators have gone silent".to_string(),
            url: "https://example.com/last-words".to_string(),
        }
    }

    fn config(endpoint: Option<String>, timeout_seconds: u64) -> BroadcastConfig {
        BroadcastConfig {
            endpoint,
            timeout_seconds,
            candidates: vec![payload()],
        }
    }

    #[tokio::test]
    async fn returns_the_endpoint_publication_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "publication_id": "pub-42"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let publisher =
            WebhookPublisher::from_config(&config(Some(format!("{}/hook", server.uri())), 5))
                .unwrap();
        let id = publisher.publish(&payload()).await.unwrap();
        assert_eq!(id, "pub-42");
    }

    #[tokio::test]
    async fn posts_the_payload_as_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let publisher =
            WebhookPublisher::from_config(&config(Some(format!("{}/hook", server.uri())), 5))
                .unwrap();
        publisher.publish(&payload()).await.unwrap();

        let requests = server.received_requests().await.unwrap_or_default();
        assert_eq!(requests.len(), 1);
        let body: serde_json::Value = requests[0].body_json().unwrap();
        assert_eq!(body["text"], "the operators have gone silent");
        assert_eq!(body["url"], "https://example.com/last-words");
    }

    #[tokio::test]
    async fn mints_an_id_when_the_endpoint_returns_none() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let publisher =
            WebhookPublisher::from_config(&config(Some(server.uri()), 5)).unwrap();
        let id = publisher.publish(&payload()).await.unwrap();
        assert!(!id.is_empty());
    }

    #[tokio::test]
    async fn non_success_status_is_a_publish_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("draining"))
            .mount(&server)
            .await;

        let publisher =
            WebhookPublisher::from_config(&config(Some(server.uri()), 5)).unwrap();
        let err = publisher.publish(&payload()).await.unwrap_err();
        assert_eq!(err.kind(), "publish");
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn missing_endpoint_is_a_publish_error() {
        let publisher = WebhookPublisher::from_config(&config(None, 5)).unwrap();
        let err = publisher.publish(&payload()).await.unwrap_err();
        assert_eq!(err.kind(), "publish");
    }

    #[tokio::test]
    async fn slow_endpoint_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_delay(std::time::Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let publisher =
            WebhookPublisher::from_config(&config(Some(server.uri()), 1)).unwrap();
        let err = publisher.publish(&payload()).await.unwrap_err();
        assert_eq!(err.kind(), "publish");
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn stub_records_calls_and_can_fail() {
        let ok = StubPublisher::succeeding();
        assert_eq!(ok.publish(&payload()).await.unwrap(), "stub-1");
        assert_eq!(ok.publish_count(), 1);
        assert_eq!(ok.published()[0], payload());

        let bad = StubPublisher::failing("wire down");
        let err = bad.publish(&payload()).await.unwrap_err();
        assert_eq!(err.to_string(), "publish failed: wire down");
        assert_eq!(bad.publish_count(), 1);
    }
}
