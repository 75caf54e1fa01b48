//! HTTP transport with the retry/backoff contract.
//!
//! The transport owns everything between "serialized JSON payload" and
//! "parsed JSON response":
//!
//! - POST for payload-carrying requests, GET otherwise
//! - One manual redirect follow on 301/302 with an `https:` Location (GET only)
//! - HTTP 429 honoring `Retry-After` when it is a positive integer of seconds,
//!   otherwise exponential slot backoff `slot × rand(0, 2^attempt)`
//! - Connection-level failures retried with the same backoff
//! - A wall-clock deadline racing the entire attempt sequence
//! - Optional error pass-through and response processors
//!
//! Retries happen here and only here; the batch scheduler above treats every
//! transport error as final for the in-flight batch.

use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;
use reqwest::header::{LOCATION, RETRY_AFTER};
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use crate::config::ClientConfig;
use crate::error::{Result, RpcError};
use crate::types::{ProcessorVerdict, RequestOptions};

/// Maximum body length kept in error messages.
const ERROR_BODY_TRUNCATE: usize = 512;

/// Exponent ceiling for backoff so `2^attempt` cannot overflow.
const BACKOFF_EXPONENT_CAP: u32 = 16;

// ═══════════════════════════════════════════════════════════════════════════════
// HTTP TRANSPORT
// ═══════════════════════════════════════════════════════════════════════════════

/// Low-level HTTP carrier for JSON-RPC payloads.
#[derive(Debug)]
pub(crate) struct HttpTransport {
    /// Underlying HTTP client. Redirects are disabled; the transport follows
    /// one redirect manually so the https-only rule can be enforced.
    client: reqwest::Client,
    /// Endpoint URL.
    url: String,
    /// Client configuration (deadline, throttle limit, backoff slot).
    config: ClientConfig,
}

impl HttpTransport {
    /// Create a transport for the given endpoint.
    pub(crate) fn new(url: impl Into<String>, config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| RpcError::Connection(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: url.into(),
            config,
        })
    }

    /// Endpoint URL this transport talks to.
    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    /// Send a payload and return the parsed JSON body.
    ///
    /// `payload = None` issues a GET; anything else POSTs the JSON value.
    /// The configured wall-clock deadline races the whole attempt sequence;
    /// once it elapses the call is lost regardless of remaining attempts.
    pub(crate) async fn send(
        &self,
        payload: Option<&serde_json::Value>,
        options: &RequestOptions,
    ) -> Result<serde_json::Value> {
        tokio::time::timeout(self.config.timeout, self.attempt_sequence(payload, options))
            .await
            .map_err(|_| RpcError::Timeout(self.config.timeout))?
    }

    /// Run attempts until success, a fatal error, or the throttle limit.
    async fn attempt_sequence(
        &self,
        payload: Option<&serde_json::Value>,
        options: &RequestOptions,
    ) -> Result<serde_json::Value> {
        let mut url = self.url.clone();
        let mut redirected = false;
        let mut last_error: Option<RpcError> = None;

        for attempt in 0..self.config.throttle_limit {
            let request = match payload {
                Some(body) => self.client.post(&url).json(body),
                None => self.client.get(&url),
            };

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    // No response at all. Retry with backoff; surface as a
                    // server error once attempts run out.
                    let err = RpcError::ServerError(e.to_string());
                    debug!(attempt, error = %err, "connection-level failure");
                    last_error = Some(err);
                    sleep(self.backoff_delay(attempt)).await;
                    continue;
                }
            };

            let status = response.status();

            // Single https-only redirect follow, GET requests only.
            if (status == StatusCode::MOVED_PERMANENTLY || status == StatusCode::FOUND)
                && payload.is_none()
                && !redirected
            {
                if let Some(location) = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .filter(|loc| loc.starts_with("https:"))
                {
                    trace!(location, "following redirect");
                    url = location.to_string();
                    redirected = true;
                    continue;
                }
                return Err(RpcError::Http {
                    status: status.as_u16(),
                    body: "redirect without https location".into(),
                });
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                let delay = retry_after_seconds(&response)
                    .unwrap_or_else(|| self.backoff_delay(attempt));
                warn!(attempt, delay_ms = delay.as_millis() as u64, "rate limited, backing off");
                last_error = Some(RpcError::ThrottleExhausted {
                    attempts: attempt + 1,
                });
                sleep(delay).await;
                continue;
            }

            let success = status.is_success();
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    // Response started but the body never arrived intact.
                    let err = RpcError::ServerError(e.to_string());
                    debug!(attempt, error = %err, "body read failure");
                    last_error = Some(err);
                    sleep(self.backoff_delay(attempt)).await;
                    continue;
                }
            };

            if !success && !options.error_pass_through {
                return Err(RpcError::Http {
                    status: status.as_u16(),
                    body: truncate(&body),
                });
            }

            let value: serde_json::Value = serde_json::from_str(&body)
                .map_err(|e| RpcError::InvalidResponse(format!("{e}: {}", truncate(&body))))?;

            if let Some(processor) = &options.processor {
                if processor(&value) == ProcessorVerdict::Throttle {
                    debug!(attempt, "processor requested throttle");
                    last_error = Some(RpcError::ThrottleExhausted {
                        attempts: attempt + 1,
                    });
                    sleep(self.backoff_delay(attempt)).await;
                    continue;
                }
            }

            return Ok(value);
        }

        Err(last_error.unwrap_or(RpcError::ThrottleExhausted {
            attempts: self.config.throttle_limit,
        }))
    }

    /// Exponential slot backoff: `slot × rand(0, 2^attempt)` milliseconds.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let ceiling = 1u64 << attempt.min(BACKOFF_EXPONENT_CAP);
        let slots = rand::rng().random_range(0..=ceiling);
        let millis = (self.config.throttle_slot_interval.as_millis() as u64).saturating_mul(slots);
        Duration::from_millis(millis)
    }
}

/// Parse `Retry-After` when it is a positive integer of seconds.
///
/// Date-form values are ignored; the caller falls back to slot backoff.
fn retry_after_seconds(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|&secs| secs > 0)
        .map(Duration::from_secs)
}

fn truncate(body: &str) -> String {
    if body.len() <= ERROR_BODY_TRUNCATE {
        body.to_string()
    } else {
        let cut = body
            .char_indices()
            .take_while(|(i, _)| *i < ERROR_BODY_TRUNCATE)
            .last()
            .map_or(0, |(i, c)| i + c.len_utf8());
        format!("{}…", &body[..cut])
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    use super::*;

    fn fast_config() -> ClientConfig {
        ClientConfig::default()
            .with_timeout(Duration::from_secs(5))
            .with_throttle_slot_interval(Duration::from_millis(1))
            .with_throttle_limit(4)
    }

    #[tokio::test]
    async fn post_returns_parsed_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(server.uri(), fast_config()).expect("transport");
        let value = transport
            .send(Some(&serde_json::json!({"method": "x"})), &RequestOptions::default())
            .await
            .expect("send failed");

        assert_eq!(value, serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn rate_limit_retries_until_success() {
        struct FlakyResponder {
            calls: Arc<AtomicU32>,
        }

        impl Respond for FlakyResponder {
            fn respond(&self, _request: &Request) -> ResponseTemplate {
                if self.calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    ResponseTemplate::new(429).insert_header("Retry-After", "1")
                } else {
                    ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true}))
                }
            }
        }

        let server = MockServer::start().await;
        let calls = Arc::new(AtomicU32::new(0));
        Mock::given(method("POST"))
            .respond_with(FlakyResponder {
                calls: calls.clone(),
            })
            .mount(&server)
            .await;

        let config = fast_config().with_timeout(Duration::from_secs(10));
        let transport = HttpTransport::new(server.uri(), config).expect("transport");
        let value = transport
            .send(Some(&serde_json::json!({})), &RequestOptions::default())
            .await
            .expect("send failed");

        assert_eq!(value, serde_json::json!({"ok": true}));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rate_limit_exhausts_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(server.uri(), fast_config()).expect("transport");
        let result = transport
            .send(Some(&serde_json::json!({})), &RequestOptions::default())
            .await;

        assert!(matches!(result, Err(RpcError::ThrottleExhausted { .. })));
    }

    #[tokio::test]
    async fn non_success_raises_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(server.uri(), fast_config()).expect("transport");
        let result = transport
            .send(Some(&serde_json::json!({})), &RequestOptions::default())
            .await;

        match result {
            Err(RpcError::Http { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("expected Http error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pass_through_returns_error_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(serde_json::json!({"reason": "nope"})),
            )
            .mount(&server)
            .await;

        let transport = HttpTransport::new(server.uri(), fast_config()).expect("transport");
        let value = transport
            .send(Some(&serde_json::json!({})), &RequestOptions::pass_through())
            .await
            .expect("pass-through should not raise");

        assert_eq!(value, serde_json::json!({"reason": "nope"}));
    }

    #[tokio::test]
    async fn processor_throttle_retries() {
        struct CountingResponder {
            calls: Arc<AtomicU32>,
        }

        impl Respond for CountingResponder {
            fn respond(&self, _request: &Request) -> ResponseTemplate {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"attempt": n}))
            }
        }

        let server = MockServer::start().await;
        let calls = Arc::new(AtomicU32::new(0));
        Mock::given(method("POST"))
            .respond_with(CountingResponder {
                calls: calls.clone(),
            })
            .mount(&server)
            .await;

        let options = RequestOptions::default().with_processor(Arc::new(|value| {
            if value.get("attempt") == Some(&serde_json::json!(0)) {
                ProcessorVerdict::Throttle
            } else {
                ProcessorVerdict::Accept
            }
        }));

        let transport = HttpTransport::new(server.uri(), fast_config()).expect("transport");
        let value = transport
            .send(Some(&serde_json::json!({})), &options)
            .await
            .expect("send failed");

        assert_eq!(value, serde_json::json!({"attempt": 1}));
    }

    #[tokio::test]
    async fn deadline_wins_over_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
            .mount(&server)
            .await;

        let config = ClientConfig::default()
            .with_timeout(Duration::from_secs(1))
            .with_throttle_slot_interval(Duration::from_millis(1));
        let transport = HttpTransport::new(server.uri(), config).expect("transport");
        let result = transport
            .send(Some(&serde_json::json!({})), &RequestOptions::default())
            .await;

        assert!(matches!(result, Err(RpcError::Timeout(_))));
    }

    #[test]
    fn truncation_respects_utf8_boundaries() {
        let long = "é".repeat(ERROR_BODY_TRUNCATE);
        let truncated = truncate(&long);
        assert!(truncated.ends_with('…'));
    }
}
