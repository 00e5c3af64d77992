use crate::locate::locate_program;
use crate::signal::{platform_graceful_stop, GracefulStop};
use crate::RuntimeError;
use async_trait::async_trait;
use braintrace_schema::SpawnCommand;
use chrono::{DateTime, Utc};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// How long to wait for the exit status after a forced kill.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// A dependency process started (or adopted) by this run.
///
/// The OS handle is exclusively owned. Dropping a record whose child is still
/// running force-stops the child's whole process group, so an unwinding
/// orchestrator leaves nothing behind. A process deliberately left running
/// after its grace period is detached first and survives the drop.
#[derive(Debug)]
pub struct ManagedProcess {
    name: String,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    started: Instant,
    child: Option<Child>,
    stop: Option<Arc<dyn GracefulStop>>,
}

impl ManagedProcess {
    fn spawned(name: &str, child: Child, stop: Arc<dyn GracefulStop>) -> Self {
        Self {
            name: name.to_owned(),
            pid: child.id(),
            started_at: Utc::now(),
            started: Instant::now(),
            child: Some(child),
            stop: Some(stop),
        }
    }

    /// A process record with no OS handle behind it, for test supervisors.
    pub(crate) fn synthetic(name: &str, pid: u32) -> Self {
        Self {
            name: name.to_owned(),
            pid: Some(pid),
            started_at: Utc::now(),
            started: Instant::now(),
            child: None,
            stop: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Give up the handle without stopping the process. The child is reaped
    /// in the background if it ever exits.
    fn detach(&mut self) {
        self.child = None;
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        let (Some(child), Some(stop)) = (self.child.as_mut(), &self.stop) else {
            return;
        };
        if matches!(child.try_wait(), Ok(None)) {
            warn!("{} still running on drop, force-stopping it", self.name);
            if let Err(e) = stop.force_stop(child) {
                warn!("failed to force-stop {}: {e}", self.name);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// Exited within the grace period after the stop request.
    Exited { code: Option<i32>, waited: Duration },
    /// Had already exited before the stop request.
    AlreadyExited { code: Option<i32> },
    /// Still running when the grace period ended.
    TimedOut { grace: Duration, killed: bool },
    /// No OS handle to act on.
    NotOwned,
}

impl TerminationOutcome {
    pub fn is_clean(self) -> bool {
        matches!(self, Self::Exited { .. } | Self::AlreadyExited { .. })
    }
}

#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Launch `command` as the dependency `name`. Returns once the OS has
    /// started the process, without waiting for readiness.
    fn spawn(&self, name: &str, command: &SpawnCommand) -> Result<ManagedProcess, RuntimeError>;

    /// Request a graceful stop and wait up to `grace` for the exit. At most
    /// one stop request is sent per call.
    async fn terminate(
        &self,
        process: &mut ManagedProcess,
        grace: Duration,
    ) -> Result<TerminationOutcome, RuntimeError>;
}

pub struct ProcessSupervisor {
    stop: Arc<dyn GracefulStop>,
    force_kill: bool,
}

impl ProcessSupervisor {
    /// With `force_kill`, a process still running after its grace period is
    /// killed. Without it, the process is detached and left running.
    pub fn new(force_kill: bool) -> Self {
        Self::with_stop(Arc::from(platform_graceful_stop()), force_kill)
    }

    pub fn with_stop(stop: Arc<dyn GracefulStop>, force_kill: bool) -> Self {
        Self { stop, force_kill }
    }
}

#[async_trait]
impl Supervisor for ProcessSupervisor {
    fn spawn(&self, name: &str, command: &SpawnCommand) -> Result<ManagedProcess, RuntimeError> {
        let program = locate_program(command)?;
        let mut cmd = Command::new(&program);
        cmd.args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::null());
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }
        self.stop.configure(&mut cmd);

        let child = cmd.spawn().map_err(|source| RuntimeError::SpawnFailed {
            name: name.to_owned(),
            program: program.display().to_string(),
            source,
        })?;
        let process = ManagedProcess::spawned(name, child, Arc::clone(&self.stop));
        info!(
            "spawned {name} (pid {}): {}",
            process.pid.map_or_else(|| "?".to_owned(), |p| p.to_string()),
            program.display()
        );
        Ok(process)
    }

    async fn terminate(
        &self,
        process: &mut ManagedProcess,
        grace: Duration,
    ) -> Result<TerminationOutcome, RuntimeError> {
        let name = process.name.clone();
        let Some(child) = process.child.as_mut() else {
            return Ok(TerminationOutcome::NotOwned);
        };

        if let Some(status) = child.try_wait()? {
            debug!("{name} already exited with {status}");
            return Ok(TerminationOutcome::AlreadyExited {
                code: status.code(),
            });
        }

        debug!("stopping {name} via {}", self.stop.name());
        let started = Instant::now();
        self.stop
            .request_stop(child)
            .map_err(|source| RuntimeError::SignalFailed {
                name: name.clone(),
                source,
            })?;

        let waited = tokio::time::timeout(grace, child.wait()).await;
        match waited {
            Ok(Ok(status)) => Ok(TerminationOutcome::Exited {
                code: status.code(),
                waited: started.elapsed(),
            }),
            Ok(Err(e)) => Err(e.into()),
            Err(_) if self.force_kill => {
                warn!("{name} still running {grace:?} after stop request");
                let killed = force(&*self.stop, &name, child).await;
                Ok(TerminationOutcome::TimedOut { grace, killed })
            }
            Err(_) => {
                warn!("{name} still running {grace:?} after stop request, leaving it running");
                process.detach();
                Ok(TerminationOutcome::TimedOut {
                    grace,
                    killed: false,
                })
            }
        }
    }
}

async fn force(stop: &dyn GracefulStop, name: &str, child: &mut Child) -> bool {
    if let Err(e) = stop.force_stop(child) {
        warn!("failed to kill {name}: {e}");
        return false;
    }
    match tokio::time::timeout(KILL_REAP_TIMEOUT, child.wait()).await {
        Ok(Ok(_)) => {
            info!("{name} killed after grace period");
            true
        }
        Ok(Err(e)) => {
            warn!("failed to reap {name} after kill: {e}");
            false
        }
        Err(_) => {
            warn!("{name} did not exit after kill");
            false
        }
    }
}
