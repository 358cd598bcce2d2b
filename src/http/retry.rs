//! Retrying HTTP client.
//!
//! Wraps a transport with the fixed retry discipline shared by every
//! outbound call in the engine: up to three attempts, exponential backoff
//! between them, and a hard split between transient failures (retried) and
//! permanent ones (surfaced immediately). The client never panics; callers
//! receive the last failure as a value and decide what it means for their
//! unit of work.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, TransportError};

/// Statuses worth a second try: rate limiting and server-side trouble.
const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

/// Attempt count and backoff base for one logical call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt after `attempt` (1-based): 1s, 2s, 4s, …
    fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// The terminal outcome of a call that did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("HTTP {status} from {url}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl HttpError {
    /// Status code, when the failure was an HTTP-level one.
    pub fn status(&self) -> Option<u16> {
        match self {
            HttpError::Status { status, .. } => Some(*status),
            HttpError::Transport(_) => None,
        }
    }
}

/// Transport wrapper applying [`RetryPolicy`] to every call.
pub struct RetryingClient {
    transport: Arc<dyn HttpTransport>,
    policy: RetryPolicy,
}

impl RetryingClient {
    pub fn new(transport: Arc<dyn HttpTransport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    /// Production client: `reqwest` transport, default policy.
    pub fn with_defaults() -> Self {
        Self::new(Arc::new(ReqwestTransport::new()), RetryPolicy::default())
    }

    /// Execute a request, retrying transient failures.
    ///
    /// Success is any 2xx. 429 and 5xx statuses, connection failures and
    /// timeouts are retried with exponential backoff; any other status
    /// (400, 401, 403, 404, …) and malformed URLs abort immediately.
    pub async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let mut last_error: Option<HttpError> = None;

        for attempt in 1..=self.policy.max_attempts {
            match self.transport.execute(request.clone()).await {
                Ok(response) if response.is_success() => return Ok(response),
                Ok(response) if is_retryable_status(response.status) => {
                    warn!(
                        url = %request.url,
                        status = response.status,
                        attempt,
                        "retryable HTTP status"
                    );
                    last_error = Some(HttpError::Status {
                        status: response.status,
                        url: request.url.clone(),
                        body: response.body,
                    });
                }
                Ok(response) => {
                    return Err(HttpError::Status {
                        status: response.status,
                        url: request.url.clone(),
                        body: response.body,
                    });
                }
                Err(TransportError::InvalidUrl(detail)) => {
                    return Err(HttpError::Transport(TransportError::InvalidUrl(detail)));
                }
                Err(e) => {
                    warn!(url = %request.url, error = %e, attempt, "transport failure");
                    last_error = Some(HttpError::Transport(e));
                }
            }

            if attempt < self.policy.max_attempts {
                tokio::time::sleep(self.policy.backoff(attempt)).await;
            }
        }

        Err(last_error.unwrap_or_else(|| {
            HttpError::Transport(TransportError::Connection(
                "no attempts were made".to_string(),
            ))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Transport that pops one scripted outcome per call.
    struct ScriptedTransport {
        script: Mutex<Vec<Result<HttpResponse, TransportError>>>,
        calls: AtomicU32,
    }

    impl ScriptedTransport {
        fn new(mut outcomes: Vec<Result<HttpResponse, TransportError>>) -> Self {
            outcomes.reverse();
            Self {
                script: Mutex::new(outcomes),
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn execute(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.script
                .lock()
                .pop()
                .unwrap_or_else(|| panic!("transport called more times than scripted"))
        }
    }

    fn status(code: u16) -> Result<HttpResponse, TransportError> {
        Ok(HttpResponse {
            status: code,
            body: format!("body-{}", code),
        })
    }

    fn client(outcomes: Vec<Result<HttpResponse, TransportError>>) -> (RetryingClient, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::new(outcomes));
        (
            RetryingClient::new(transport.clone(), RetryPolicy::default()),
            transport,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_attempt_after_backoff() {
        let (client, transport) = client(vec![status(503), status(503), status(200)]);

        let started = tokio::time::Instant::now();
        let response = client
            .execute(HttpRequest::get("https://api.example.com/x"))
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(transport.calls(), 3);
        // Backoff slept 1s after the first failure and 2s after the second.
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_status_aborts_without_retry() {
        let (client, transport) = client(vec![status(404)]);

        let err = client
            .execute(HttpRequest::get("https://api.example.com/x"))
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(404));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_aborts_without_retry() {
        let (client, transport) = client(vec![status(401)]);

        let err = client
            .execute(HttpRequest::get("https://api.example.com/x"))
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(401));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_return_last_failure() {
        let (client, transport) = client(vec![status(500), status(502), status(503)]);

        let err = client
            .execute(HttpRequest::get("https://api.example.com/x"))
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(503));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_errors_are_retried() {
        let (client, transport) = client(vec![
            Err(TransportError::Connection("refused".to_string())),
            status(200),
        ]);

        let response = client
            .execute(HttpRequest::get("https://api.example.com/x"))
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_are_retried() {
        let (client, transport) = client(vec![
            Err(TransportError::Timeout(Duration::from_secs(10))),
            status(200),
        ]);

        let response = client
            .execute(HttpRequest::get("https://api.example.com/x"))
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_url_is_permanent() {
        let (client, transport) = client(vec![Err(TransportError::InvalidUrl(
            "not-a-url".to_string(),
        ))]);

        let err = client
            .execute(HttpRequest::get("not-a-url"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            HttpError::Transport(TransportError::InvalidUrl(_))
        ));
        assert_eq!(transport.calls(), 1);
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
    }
}
