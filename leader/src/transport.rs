//! HTTP plumbing for talking to worker enclaves

use std::future::Future;
use std::time::Duration;

use reqwest::{Response, StatusCode};

use crate::observer::SyncObserver;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(60);

/// Bounded exponential backoff: the wait after a failed attempt `k`
/// (counting from zero) is `2^k` units, capped at `max_wait`.
#[derive(Debug, Copy, Clone)]
pub struct Backoff {
    pub max_attempts: u32,
    pub max_wait: Duration,
    /// Duration of one backoff unit, a second in production
    pub unit: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_wait: DEFAULT_MAX_WAIT,
            unit: Duration::from_secs(1),
        }
    }
}

impl Backoff {
    pub fn new(max_attempts: u32, max_wait: Duration) -> Self {
        Self {
            max_attempts,
            max_wait,
            ..Default::default()
        }
    }

    /// The wait following the failure of the zero-indexed `attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.unit.saturating_mul(factor).min(self.max_wait)
    }

    /// The longest time a full retry loop can spend sleeping
    pub fn worst_case_sleep(&self) -> Duration {
        (0..self.max_attempts.saturating_sub(1))
            .map(|attempt| self.delay(attempt))
            .sum()
    }
}

/// Anything carrying an HTTP status
pub trait HasStatus {
    fn status(&self) -> StatusCode;
}

impl HasStatus for Response {
    fn status(&self) -> StatusCode {
        Response::status(self)
    }
}

/// All attempts failed. Holds what the final attempt produced, so
/// callers can tell a bad response from no response at all.
#[derive(Debug)]
pub struct Exhausted<R, E> {
    pub attempts: u32,
    pub last_response: Option<R>,
    pub last_error: Option<E>,
}

/// Issue a request to `worker` up to `backoff.max_attempts` times until
/// it yields a response with status 200.
///
/// Transport errors and any other status are retryable. There is no
/// sleep after the final attempt.
pub async fn retry_with_backoff<R, E, F, Fut, O>(
    backoff: &Backoff,
    observer: &O,
    worker: &str,
    mut request: F,
) -> Result<R, Exhausted<R, E>>
where
    R: HasStatus,
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<R, E>>,
    O: SyncObserver + ?Sized,
{
    let mut exhausted = Exhausted {
        attempts: 0,
        last_response: None,
        last_error: None,
    };
    for attempt in 0..backoff.max_attempts {
        exhausted.attempts = attempt + 1;
        let reason = match request().await {
            Ok(resp) if resp.status() == StatusCode::OK => return Ok(resp),
            Ok(resp) => {
                let reason = format!("expected status code 200 but got {}", resp.status());
                exhausted.last_response = Some(resp);
                exhausted.last_error = None;
                reason
            }
            Err(e) => {
                let reason = e.to_string();
                exhausted.last_response = None;
                exhausted.last_error = Some(e);
                reason
            }
        };

        if attempt + 1 < backoff.max_attempts {
            let wait = backoff.delay(attempt);
            observer.attempt_failed(worker, attempt + 1, Some(wait), &reason);
            tokio::time::sleep(wait).await;
        } else {
            observer.attempt_failed(worker, attempt + 1, None, &reason);
        }
    }
    Err(exhausted)
}

/// Read a response body, stopping as soon as it grows beyond `limit`
/// bytes. Returns `Ok(None)` if the limit was exceeded.
pub async fn read_limited(mut resp: Response, limit: usize) -> reqwest::Result<Option<Vec<u8>>> {
    if resp.content_length().is_some_and(|len| len > limit as u64) {
        return Ok(None);
    }
    let mut body = Vec::new();
    while let Some(chunk) = resp.chunk().await? {
        if body.len() + chunk.len() > limit {
            return Ok(None);
        }
        body.extend_from_slice(&chunk);
    }
    Ok(Some(body))
}

/// A client for talking to workers. Their TLS certificates are not
/// checked, as trust is established through remote attestation alone.
pub fn unauthenticated_client(timeout: Option<Duration>) -> reqwest::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().danger_accept_invalid_certs(true);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build()
}
