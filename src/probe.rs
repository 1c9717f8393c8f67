//! Readiness probing.
//!
//! A health check is polled on a fixed cadence until it reports ready or
//! its attempt budget runs out. The whole wait is bounded by
//! `max_attempts * interval`.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{net::TcpStream, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::util::CommandRunner;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeStrategy {
    Tcp { address: String },
    Http { url: String },
    Command { command: String },
}

impl std::fmt::Display for ProbeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeStrategy::Tcp { address } => write!(f, "tcp {}", address),
            ProbeStrategy::Http { url } => write!(f, "http {}", url),
            ProbeStrategy::Command { command } => write!(f, "command `{}`", command),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub target: String,
    pub strategy: ProbeStrategy,
    pub interval: Duration,
    pub timeout: Duration,
    pub max_attempts: u32,
}

impl HealthCheck {
    pub fn validate(&self) -> Result<(), ProbeError> {
        let malformed = |reason: String| ProbeError::Malformed {
            target: self.target.clone(),
            reason,
        };

        if self.timeout.is_zero() {
            return Err(malformed("timeout must be greater than zero".to_string()));
        }
        if self.interval.is_zero() {
            return Err(malformed("interval must be greater than zero".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(malformed("max_attempts must be at least 1".to_string()));
        }
        let in_range = self
            .interval
            .checked_mul(self.max_attempts)
            .and_then(|budget| Instant::now().checked_add(budget));
        if in_range.is_none() {
            return Err(malformed(format!(
                "interval {:?} times {} attempts is out of range",
                self.interval, self.max_attempts
            )));
        }

        match &self.strategy {
            ProbeStrategy::Tcp { address } => {
                let port = address.rsplit_once(':').map(|(host, port)| (host, port.parse::<u16>()));
                match port {
                    Some((host, Ok(_))) if !host.is_empty() => Ok(()),
                    _ => Err(malformed(format!("'{}' is not a host:port address", address))),
                }
            }
            ProbeStrategy::Http { url } => match reqwest::Url::parse(url) {
                Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
                Ok(parsed) => Err(malformed(format!(
                    "unsupported scheme '{}' in '{}'",
                    parsed.scheme(),
                    url
                ))),
                Err(e) => Err(malformed(format!("invalid url '{}': {}", url, e))),
            },
            ProbeStrategy::Command { command } if command.trim().is_empty() => {
                Err(malformed("probe command is empty".to_string()))
            }
            ProbeStrategy::Command { .. } => Ok(()),
        }
    }

    /// Upper bound on how long `wait_healthy` may take.
    pub fn budget(&self) -> Duration {
        self.interval.saturating_mul(self.max_attempts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Healthy { attempts: u32 },
    Timeout { attempts: u32 },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("health check for '{target}' is malformed: {reason}")]
    Malformed { target: String, reason: String },
    #[error("readiness wait for '{0}' was cancelled")]
    Cancelled(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    Ready,
    NotReady(String),
}

#[async_trait]
pub trait Probe: Send + Sync {
    async fn attempt(&self, strategy: &ProbeStrategy, timeout: Duration) -> Attempt;
}

pub struct LiveProbe {
    runner: Arc<dyn CommandRunner>,
    client: reqwest::Client,
}

impl LiveProbe {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Probe for LiveProbe {
    async fn attempt(&self, strategy: &ProbeStrategy, timeout: Duration) -> Attempt {
        match strategy {
            ProbeStrategy::Tcp { address } => {
                match tokio::time::timeout(timeout, TcpStream::connect(address.as_str())).await {
                    Ok(Ok(_)) => Attempt::Ready,
                    Ok(Err(e)) => Attempt::NotReady(e.to_string()),
                    Err(_) => Attempt::NotReady("connect timed out".to_string()),
                }
            }
            ProbeStrategy::Http { url } => {
                match self.client.get(url).timeout(timeout).send().await {
                    Ok(response) if response.status().is_success() => Attempt::Ready,
                    Ok(response) => Attempt::NotReady(format!("HTTP {}", response.status())),
                    Err(e) => Attempt::NotReady(e.to_string()),
                }
            }
            ProbeStrategy::Command { command } => {
                match self.runner.run(command, Some(timeout)).await {
                    Ok(output) if output.success() => Attempt::Ready,
                    Ok(output) => Attempt::NotReady(output.describe_status()),
                    Err(e) => Attempt::NotReady(e.to_string()),
                }
            }
        }
    }
}

pub struct Prober {
    probe: Arc<dyn Probe>,
}

impl Prober {
    pub fn new(probe: Arc<dyn Probe>) -> Self {
        Self { probe }
    }

    pub async fn wait_healthy(
        &self,
        check: &HealthCheck,
        cancel: &CancellationToken,
    ) -> Result<Readiness, ProbeError> {
        check.validate()?;

        let started = Instant::now();
        let deadline = started.checked_add(check.budget()).ok_or_else(|| ProbeError::Malformed {
            target: check.target.clone(),
            reason: "attempt budget is out of range".to_string(),
        })?;

        for attempt in 1..=check.max_attempts {
            let budget = check
                .timeout
                .min(deadline.saturating_duration_since(Instant::now()));

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(ProbeError::Cancelled(check.target.clone())),
                result = tokio::time::timeout(budget, self.probe.attempt(&check.strategy, budget)) => result,
            };

            match result {
                Ok(Attempt::Ready) => {
                    info!(
                        "'{}' is ready after {} attempt(s) ({:?})",
                        check.target,
                        attempt,
                        started.elapsed()
                    );
                    return Ok(Readiness::Healthy { attempts: attempt });
                }
                Ok(Attempt::NotReady(reason)) => {
                    debug!(
                        "'{}' not ready ({}), attempt {}/{}: {}",
                        check.target, check.strategy, attempt, check.max_attempts, reason
                    );
                }
                Err(_) => {
                    debug!(
                        "'{}' probe attempt {}/{} exceeded {:?}",
                        check.target, attempt, check.max_attempts, budget
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(ProbeError::Cancelled(check.target.clone())),
                _ = tokio::time::sleep_until(started + check.interval.saturating_mul(attempt)) => {}
            }
        }

        warn!(
            "'{}' did not become ready within {:?} ({} attempts)",
            check.target,
            check.budget(),
            check.max_attempts
        );
        Ok(Readiness::Timeout {
            attempts: check.max_attempts,
        })
    }
}
