//! Readiness Prober
//!
//! Polls a platform's health endpoint on a fixed interval until it answers
//! with an "alive" status or the time budget runs out. An answer counts
//! even when it is 401/403: the service is up, auth is a later concern.

use reqwest::Client;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ReadinessConfig;

/// Per-request ceiling when the poll interval is shorter
const MIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready { status: u16, attempts: u32 },
    TimedOut { attempts: u32, last_error: Option<String> },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready { .. })
    }
}

#[derive(Clone)]
pub struct ReadinessProber {
    http: Client,
    timeout: Duration,
    interval: Duration,
    alive_statuses: Vec<u16>,
}

impl ReadinessProber {
    pub fn new(http: Client, config: &ReadinessConfig) -> Self {
        Self {
            http,
            timeout: config.timeout(),
            interval: config.interval(),
            alive_statuses: config.alive_statuses.clone(),
        }
    }

    /// Same prober with a different time budget
    pub fn with_timing(mut self, timeout: Duration, interval: Duration) -> Self {
        self.timeout = timeout;
        self.interval = interval;
        self
    }

    /// Bounded attempt count derived from the time budget
    pub fn max_attempts(&self) -> u32 {
        if self.interval.is_zero() {
            return 1;
        }
        let attempts = self.timeout.as_millis() / self.interval.as_millis().max(1);
        (attempts as u32).max(1)
    }

    pub fn is_alive(&self, status: u16) -> bool {
        self.alive_statuses.contains(&status)
    }

    /// Poll `probe_url` until it answers with an alive status. The whole
    /// call, including slow requests, stays within the configured timeout.
    pub async fn await_ready(&self, probe_url: &str) -> Readiness {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let max_attempts = self.max_attempts();
        let per_request = self.interval.max(MIN_REQUEST_TIMEOUT);
        let mut attempts = 0;
        let mut last_error = None;

        while attempts < max_attempts {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            attempts += 1;

            let request = self.http.get(probe_url).timeout(per_request.min(remaining));
            match request.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if self.is_alive(status) {
                        info!(url = %probe_url, status, attempts, "Platform is ready");
                        return Readiness::Ready { status, attempts };
                    }
                    debug!(url = %probe_url, status, attempt = attempts, "Platform answered but is not ready");
                    last_error = Some(format!("status {}", status));
                }
                Err(e) => {
                    debug!(url = %probe_url, attempt = attempts, error = %e, "Platform not reachable yet");
                    last_error = Some(e.to_string());
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if attempts < max_attempts && !remaining.is_zero() {
                tokio::time::sleep(self.interval.min(remaining)).await;
            }
        }

        warn!(
            url = %probe_url,
            attempts,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Platform did not become ready in time"
        );
        Readiness::TimedOut {
            attempts,
            last_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Router};

    fn prober(timeout_ms: u64, interval_ms: u64) -> ReadinessProber {
        ReadinessProber::new(Client::new(), &ReadinessConfig::default()).with_timing(
            Duration::from_millis(timeout_ms),
            Duration::from_millis(interval_ms),
        )
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_attempt_budget() {
        assert_eq!(prober(1000, 100).max_attempts(), 10);
        assert_eq!(prober(50, 100).max_attempts(), 1);
    }

    #[test]
    fn test_default_alive_statuses() {
        let p = prober(1000, 100);
        assert!(p.is_alive(200));
        assert!(p.is_alive(302));
        assert!(p.is_alive(401));
        assert!(p.is_alive(403));
        assert!(!p.is_alive(500));
        assert!(!p.is_alive(502));
    }

    #[tokio::test]
    async fn test_unauthorized_counts_as_ready() {
        let base = serve(Router::new().route("/login", get(|| async { StatusCode::UNAUTHORIZED }))).await;

        let readiness = prober(1000, 50).await_ready(&format!("{}/login", base)).await;
        assert_eq!(
            readiness,
            Readiness::Ready {
                status: 401,
                attempts: 1
            }
        );
    }

    #[tokio::test]
    async fn test_server_error_times_out() {
        let base = serve(Router::new().route(
            "/health",
            get(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        ))
        .await;

        let readiness = prober(200, 50).await_ready(&format!("{}/health", base)).await;
        match readiness {
            Readiness::TimedOut { attempts, last_error } => {
                assert!((1..=4).contains(&attempts), "attempts: {}", attempts);
                assert_eq!(last_error.as_deref(), Some("status 503"));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hanging_endpoint_is_bounded_by_timeout() {
        let base = serve(Router::new().route(
            "/health",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                StatusCode::OK
            }),
        ))
        .await;

        let started = std::time::Instant::now();
        let readiness = prober(200, 50).await_ready(&format!("{}/health", base)).await;
        let elapsed = started.elapsed();

        assert!(!readiness.is_ready());
        assert!(elapsed < Duration::from_millis(800), "took {:?}", elapsed);
        assert!(matches!(readiness, Readiness::TimedOut { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_refused_connection_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let readiness = prober(100, 50).await_ready(&format!("http://{}/", addr)).await;
        assert!(!readiness.is_ready());
    }
}
