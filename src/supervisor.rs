//! Start, stop, status and logs for named service units.
//!
//! Containers are driven entirely through commands (usually `docker
//! compose`). Local processes are spawned children owned here. Every unit
//! has its own lock, so unrelated units start and stop concurrently.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use serde::Deserialize;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, BufReader, Lines},
    process::{Child, ChildStdout},
    sync::Mutex,
};
use tracing::{debug, info, warn};

use crate::{
    probe::{Attempt, HealthCheck, Probe},
    util::{CommandError, CommandRunner},
};

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    Container,
    Process,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUnit {
    pub name: String,
    pub kind: UnitKind,
    pub start: String,
    pub stop: Option<String>,
    pub status: Option<String>,
    pub logs: Option<String>,
    pub logs_follow: Option<String>,
    pub health: Option<HealthCheck>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Healthy,
    Unhealthy,
    StoppedWithError(String),
}

impl ServiceState {
    fn is_live(&self) -> bool {
        matches!(
            self,
            ServiceState::Starting | ServiceState::Healthy | ServiceState::Unhealthy
        )
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Stopped => write!(f, "stopped"),
            ServiceState::Starting => write!(f, "starting"),
            ServiceState::Healthy => write!(f, "healthy"),
            ServiceState::Unhealthy => write!(f, "unhealthy"),
            ServiceState::StoppedWithError(reason) => write!(f, "stopped with error: {}", reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Service '{0}' is not defined")]
    UnknownUnit(String),
    #[error("Failed to start '{unit}': {reason}")]
    StartFailed { unit: String, reason: String },
    #[error("Failed to stop '{unit}': {reason}")]
    StopFailed { unit: String, reason: String },
    #[error("'{unit}' has no logs command (follow: {follow})")]
    NoLogSource { unit: String, follow: bool },
    #[error("Could not query '{unit}': {source}")]
    Status {
        unit: String,
        #[source]
        source: CommandError,
    },
    #[error("Could not read logs of '{unit}': {source}")]
    Logs {
        unit: String,
        #[source]
        source: CommandError,
    },
}

struct UnitSlot {
    state: ServiceState,
    child: Option<Child>,
}

pub struct Supervisor {
    runner: Arc<dyn CommandRunner>,
    probe: Arc<dyn Probe>,
    units: HashMap<String, ServiceUnit>,
    slots: HashMap<String, Arc<Mutex<UnitSlot>>>,
    command_timeout: Duration,
}

impl Supervisor {
    pub fn new(units: Vec<ServiceUnit>, runner: Arc<dyn CommandRunner>, probe: Arc<dyn Probe>) -> Self {
        let slots = units
            .iter()
            .map(|unit| {
                let slot = UnitSlot {
                    state: ServiceState::Stopped,
                    child: None,
                };
                (unit.name.clone(), Arc::new(Mutex::new(slot)))
            })
            .collect();

        Self {
            runner,
            probe,
            units: units.into_iter().map(|u| (u.name.clone(), u)).collect(),
            slots,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn unit(&self, name: &str) -> Option<&ServiceUnit> {
        self.units.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.units.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn lookup(&self, name: &str) -> Result<(&ServiceUnit, Arc<Mutex<UnitSlot>>), SupervisorError> {
        match (self.units.get(name), self.slots.get(name)) {
            (Some(unit), Some(slot)) => Ok((unit, Arc::clone(slot))),
            _ => Err(SupervisorError::UnknownUnit(name.to_string())),
        }
    }

    async fn is_running(
        &self,
        unit: &ServiceUnit,
        slot: &mut UnitSlot,
    ) -> Result<bool, SupervisorError> {
        if let Some(child) = slot.child.as_mut() {
            match child.try_wait() {
                Ok(None) => return Ok(true),
                Ok(Some(status)) => {
                    debug!("'{}' exited with {}", unit.name, status);
                    slot.child = None;
                    if !status.success() {
                        slot.state = ServiceState::StoppedWithError(format!("exited with {}", status));
                    } else {
                        slot.state = ServiceState::Stopped;
                    }
                    return Ok(false);
                }
                Err(e) => {
                    return Err(SupervisorError::Status {
                        unit: unit.name.clone(),
                        source: CommandError::Io(e),
                    });
                }
            }
        }

        match &unit.status {
            Some(command) => {
                let output = self
                    .runner
                    .run(command, Some(self.command_timeout))
                    .await
                    .map_err(|source| SupervisorError::Status {
                        unit: unit.name.clone(),
                        source,
                    })?;
                Ok(output.success() && !output.stdout_text().trim().is_empty())
            }
            None => Ok(slot.state.is_live()),
        }
    }

    pub async fn start(&self, name: &str) -> Result<StartOutcome, SupervisorError> {
        let (unit, slot) = self.lookup(name)?;
        let mut slot = slot.lock().await;

        if self.is_running(unit, &mut slot).await? {
            if !slot.state.is_live() {
                slot.state = ServiceState::Starting;
            }
            info!("'{}' is already running", unit.name);
            return Ok(StartOutcome::AlreadyRunning);
        }

        slot.state = ServiceState::Starting;
        info!("Starting '{}'", unit.name);

        let started = match unit.kind {
            UnitKind::Container => match self.runner.run(&unit.start, Some(self.command_timeout)).await {
                Ok(output) if output.success() => Ok(()),
                Ok(output) => Err(format!("{}: {}", output.describe_status(), output.combined().trim())),
                Err(e) => Err(e.to_string()),
            },
            UnitKind::Process => match self.runner.spawn(&unit.start, false) {
                Ok(child) => {
                    debug!("'{}' spawned with pid {:?}", unit.name, child.id());
                    slot.child = Some(child);
                    Ok(())
                }
                Err(e) => Err(e.to_string()),
            },
        };

        match started {
            Ok(()) => Ok(StartOutcome::Started),
            Err(reason) => {
                slot.state = ServiceState::StoppedWithError(reason.clone());
                Err(SupervisorError::StartFailed {
                    unit: unit.name.clone(),
                    reason,
                })
            }
        }
    }

    pub async fn stop(&self, name: &str) -> Result<StopOutcome, SupervisorError> {
        let (unit, slot) = self.lookup(name)?;
        let mut slot = slot.lock().await;

        if !self.is_running(unit, &mut slot).await? {
            if slot.state.is_live() {
                slot.state = ServiceState::Stopped;
            }
            debug!("'{}' is not running, nothing to stop", unit.name);
            return Ok(StopOutcome::NotRunning);
        }

        info!("Stopping '{}'", unit.name);

        let stopped = match (&unit.stop, slot.child.take()) {
            (Some(command), child) => {
                let result = match self.runner.run(command, Some(self.command_timeout)).await {
                    Ok(output) if output.success() => Ok(()),
                    Ok(output) => Err(format!("{}: {}", output.describe_status(), output.combined().trim())),
                    Err(e) => Err(e.to_string()),
                };
                match (child, result) {
                    (Some(mut child), Ok(())) => {
                        let reaped = self.reap(&unit.name, &mut child).await;
                        if reaped.is_err() {
                            slot.child = Some(child);
                        }
                        reaped
                    }
                    (Some(child), Err(reason)) => {
                        slot.child = Some(child);
                        Err(reason)
                    }
                    (None, result) => result,
                }
            }
            (None, Some(mut child)) => match child.kill().await {
                Ok(()) => Ok(()),
                Err(e) => {
                    let reason = e.to_string();
                    slot.child = Some(child);
                    Err(reason)
                }
            },
            (None, None) => Err("no stop command configured".to_string()),
        };

        match stopped {
            Ok(()) => {
                slot.state = ServiceState::Stopped;
                Ok(StopOutcome::Stopped)
            }
            Err(reason) => {
                slot.state = ServiceState::StoppedWithError(reason.clone());
                Err(SupervisorError::StopFailed {
                    unit: unit.name.clone(),
                    reason,
                })
            }
        }
    }

    /// Waits for a child whose stop command succeeded, killing it if it is
    /// still alive after the command timeout.
    async fn reap(&self, name: &str, child: &mut Child) -> Result<(), String> {
        match tokio::time::timeout(self.command_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                debug!("'{}' exited with {}", name, status);
                Ok(())
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => {
                warn!(
                    "'{}' is still running {} after its stop command, killing it",
                    name,
                    humantime::format_duration(self.command_timeout)
                );
                child
                    .kill()
                    .await
                    .map_err(|e| format!("still running after stop command, kill failed: {}", e))
            }
        }
    }

    /// Checks that a freshly started unit without a health check is actually
    /// up. A local process gets `grace` to exit early; any unit must then pass
    /// the same liveness test `start` and `stop` use.
    pub async fn confirm_running(
        &self,
        name: &str,
        grace: Duration,
    ) -> Result<ServiceState, SupervisorError> {
        let (unit, slot) = self.lookup(name)?;
        let mut slot = slot.lock().await;

        if let Some(child) = slot.child.as_mut() {
            if let Ok(exited) = tokio::time::timeout(grace, child.wait()).await {
                let status = exited.map_err(|e| SupervisorError::Status {
                    unit: unit.name.clone(),
                    source: CommandError::Io(e),
                })?;
                slot.child = None;
                slot.state = ServiceState::StoppedWithError(format!("exited with {}", status));
                return Ok(slot.state.clone());
            }
        }

        if !self.is_running(unit, &mut slot).await? {
            if !matches!(slot.state, ServiceState::StoppedWithError(_)) {
                slot.state = ServiceState::StoppedWithError("not running after start".to_string());
            }
            return Ok(slot.state.clone());
        }

        Ok(slot.state.clone())
    }

    /// Observed state of a unit. A running unit with a health check gets one
    /// bounded probe attempt to tell healthy from unhealthy.
    pub async fn status(&self, name: &str) -> Result<ServiceState, SupervisorError> {
        let (unit, slot) = self.lookup(name)?;
        let mut slot = slot.lock().await;

        if !self.is_running(unit, &mut slot).await? {
            if slot.state.is_live() {
                slot.state = ServiceState::Stopped;
            }
            return Ok(slot.state.clone());
        }

        if slot.state == ServiceState::Starting {
            return Ok(ServiceState::Starting);
        }

        slot.state = match &unit.health {
            Some(check) => {
                let attempt = match check.validate() {
                    Ok(()) => tokio::time::timeout(
                        check.timeout,
                        self.probe.attempt(&check.strategy, check.timeout),
                    )
                    .await
                    .unwrap_or_else(|_| Attempt::NotReady("probe timed out".to_string())),
                    Err(e) => Attempt::NotReady(e.to_string()),
                };
                match attempt {
                    Attempt::Ready => ServiceState::Healthy,
                    Attempt::NotReady(reason) => {
                        debug!("'{}' is running but not ready: {}", unit.name, reason);
                        ServiceState::Unhealthy
                    }
                }
            }
            None => ServiceState::Healthy,
        };

        Ok(slot.state.clone())
    }

    /// Records the result of a readiness wait.
    pub async fn mark(&self, name: &str, state: ServiceState) -> Result<(), SupervisorError> {
        let (_, slot) = self.lookup(name)?;
        slot.lock().await.state = state;
        Ok(())
    }

    pub async fn logs(&self, name: &str, follow: bool) -> Result<LogStream, SupervisorError> {
        let (unit, _) = self.lookup(name)?;
        let command = if follow { &unit.logs_follow } else { &unit.logs };
        let command = command.clone().ok_or_else(|| SupervisorError::NoLogSource {
            unit: unit.name.clone(),
            follow,
        })?;

        LogStream::open(Arc::clone(&self.runner), &unit.name, command, follow)
    }

    /// Best-effort stop of every unit left half-started, e.g. after cancellation.
    pub async fn stop_starting(&self) -> Vec<(String, Result<StopOutcome, SupervisorError>)> {
        let mut starting = Vec::new();
        for name in self.names() {
            if let Some(slot) = self.slots.get(name) {
                if slot.lock().await.state == ServiceState::Starting {
                    starting.push(name.to_string());
                }
            }
        }

        let mut results = Vec::new();
        for name in starting {
            warn!("Stopping '{}', it never became ready", name);
            let result = self.stop(&name).await;
            results.push((name, result));
        }
        results
    }

    /// Local processes this supervisor spawned that are still alive.
    pub async fn attached(&self) -> Vec<String> {
        let mut attached = Vec::new();
        for name in self.names() {
            let (Some(unit), Some(slot)) = (self.units.get(name), self.slots.get(name)) else {
                continue;
            };
            if unit.kind != UnitKind::Process {
                continue;
            }
            let mut slot = slot.lock().await;
            if slot.child.is_some() && self.is_running(unit, &mut slot).await.unwrap_or(false) {
                attached.push(name.to_string());
            }
        }
        attached
    }

    /// Local processes that have exited with an error, with the reason.
    pub async fn exited_with_error(&self) -> Vec<(String, String)> {
        let mut crashed = Vec::new();
        for name in self.names() {
            let (Some(unit), Some(slot)) = (self.units.get(name), self.slots.get(name)) else {
                continue;
            };
            if unit.kind != UnitKind::Process {
                continue;
            }
            let mut slot = slot.lock().await;
            if slot.child.is_some() {
                let _ = self.is_running(unit, &mut slot).await;
            }
            if let ServiceState::StoppedWithError(reason) = &slot.state {
                crashed.push((name.to_string(), reason.clone()));
            }
        }
        crashed
    }
}

/// Lines of a unit's log output, read lazily from a logs command.
pub struct LogStream {
    runner: Arc<dyn CommandRunner>,
    unit: String,
    command: String,
    follow: bool,
    lines: Lines<BufReader<ChildStdout>>,
    _child: Child,
}

impl LogStream {
    fn open(
        runner: Arc<dyn CommandRunner>,
        unit: &str,
        command: String,
        follow: bool,
    ) -> Result<Self, SupervisorError> {
        let logs_error = |source| SupervisorError::Logs {
            unit: unit.to_string(),
            source,
        };

        let mut child = runner.spawn(&command, true).map_err(logs_error)?;
        let stdout = child.stdout.take().ok_or_else(|| {
            logs_error(CommandError::Io(std::io::Error::other("stdout was not captured")))
        })?;

        Ok(Self {
            runner,
            unit: unit.to_string(),
            command,
            follow,
            lines: BufReader::new(stdout).lines(),
            _child: child,
        })
    }

    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.lines.next_line().await
    }

    pub fn is_follow(&self) -> bool {
        self.follow
    }

    /// A fresh stream over the same logs. Followed streams are unbounded and
    /// cannot be restarted.
    pub fn restart(&self) -> Result<Option<LogStream>, SupervisorError> {
        if self.follow {
            return Ok(None);
        }
        LogStream::open(Arc::clone(&self.runner), &self.unit, self.command.clone(), false).map(Some)
    }
}
