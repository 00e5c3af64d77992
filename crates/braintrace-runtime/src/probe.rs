//! Readiness polling under a hard deadline.
//!
//! A prober repeatedly checks a [`ReadinessTarget`] until it answers or the
//! deadline passes. Waiting is cooperative: between attempts the task sleeps on
//! the tokio timer, so other tasks on the same runtime keep making progress.
//! The deadline is enforced with `tokio::time::timeout` around the whole loop,
//! so a slow attempt cannot push the call past it. An HTTP attempt that is
//! still blocked on the network when the deadline fires is abandoned on its
//! blocking thread and ends at its own per-attempt timeout.

use async_trait::async_trait;
use braintrace_schema::ReadinessTarget;
use std::io;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Upper bound for a single connection attempt.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    pub target: ReadinessTarget,
    pub elapsed: Duration,
    pub attempts: u32,
}

/// Why a single attempt did not succeed. Every variant is retried until the
/// deadline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptError {
    #[error("connection refused")]
    Refused,
    #[error("attempt timed out")]
    TimedOut,
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("{0}")]
    Unreachable(String),
}

/// The target did not become reachable before the deadline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{target} not ready within {timeout:?} (waited {elapsed:?}, {attempts} attempts)")]
pub struct ReadinessTimeout {
    pub target: ReadinessTarget,
    pub timeout: Duration,
    pub elapsed: Duration,
    pub attempts: u32,
    pub last_error: Option<AttemptError>,
}

#[async_trait]
pub trait Prober: Send + Sync {
    /// Resolve once `target` accepts a connection or answers with a success
    /// status, or fail with [`ReadinessTimeout`] once `timeout` has elapsed.
    async fn wait_ready(
        &self,
        target: &ReadinessTarget,
        timeout: Duration,
    ) -> Result<Readiness, ReadinessTimeout>;
}

/// Polls TCP and HTTP targets over the network.
#[derive(Clone)]
pub struct NetworkProber {
    interval: Duration,
    attempt_timeout: Duration,
    agent: ureq::Agent,
}

impl NetworkProber {
    pub fn new(interval: Duration) -> Self {
        Self::with_attempt_timeout(interval, DEFAULT_ATTEMPT_TIMEOUT)
    }

    pub fn with_attempt_timeout(interval: Duration, attempt_timeout: Duration) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(attempt_timeout))
            .build()
            .into();
        Self {
            interval,
            attempt_timeout,
            agent,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// A single attempt against `target`.
    pub async fn probe_once(&self, target: &ReadinessTarget) -> Result<(), AttemptError> {
        match target {
            ReadinessTarget::Tcp { host, port } => self.probe_tcp(host, *port).await,
            ReadinessTarget::Http { url } => self.probe_http(url).await,
        }
    }

    async fn probe_tcp(&self, host: &str, port: u16) -> Result<(), AttemptError> {
        match tokio::time::timeout(self.attempt_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(classify_io(&e)),
            Err(_) => Err(AttemptError::TimedOut),
        }
    }

    async fn probe_http(&self, url: &str) -> Result<(), AttemptError> {
        let agent = self.agent.clone();
        let url = url.to_owned();
        let result = tokio::task::spawn_blocking(move || match agent.get(&url).call() {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    Ok(())
                } else {
                    Err(AttemptError::HttpStatus(status.as_u16()))
                }
            }
            Err(ureq::Error::StatusCode(code)) => Err(AttemptError::HttpStatus(code)),
            Err(ureq::Error::Timeout(_)) => Err(AttemptError::TimedOut),
            Err(ureq::Error::Io(e)) => Err(classify_io(&e)),
            Err(e) => Err(AttemptError::Unreachable(e.to_string())),
        })
        .await;

        match result {
            Ok(outcome) => outcome,
            Err(e) => Err(AttemptError::Unreachable(format!("probe task failed: {e}"))),
        }
    }
}

fn classify_io(e: &io::Error) -> AttemptError {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => AttemptError::Refused,
        io::ErrorKind::TimedOut => AttemptError::TimedOut,
        _ => AttemptError::Unreachable(e.to_string()),
    }
}

#[async_trait]
impl Prober for NetworkProber {
    async fn wait_ready(
        &self,
        target: &ReadinessTarget,
        timeout: Duration,
    ) -> Result<Readiness, ReadinessTimeout> {
        let start = Instant::now();
        let mut attempts = 0u32;
        let mut last_error = None;

        let polled = tokio::time::timeout(timeout, async {
            loop {
                attempts += 1;
                match self.probe_once(target).await {
                    Ok(()) => return,
                    Err(e) => {
                        debug!("{target} attempt {attempts}: {e}");
                        last_error = Some(e);
                    }
                }
                tokio::time::sleep(self.interval).await;
            }
        })
        .await;

        let elapsed = start.elapsed();
        match polled {
            Ok(()) => {
                info!("{target} ready after {elapsed:?} ({attempts} attempts)");
                Ok(Readiness {
                    target: target.clone(),
                    elapsed,
                    attempts,
                })
            }
            Err(_) => Err(ReadinessTimeout {
                target: target.clone(),
                timeout,
                elapsed,
                attempts,
                last_error,
            }),
        }
    }
}
