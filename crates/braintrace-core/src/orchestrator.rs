use crate::lifecycle::{validate_transition, OrchestratorState};
use crate::report::{
    AnomalyKind, DependencyStatus, ShutdownAnomaly, ShutdownReport, StartupReport,
};
use crate::CoreError;
use braintrace_runtime::{
    Detect, DeploymentMode, EnvironmentDetector, ManagedProcess, NetworkProber, ProcessSupervisor,
    Prober, Readiness, Supervisor, TerminationOutcome,
};
use braintrace_schema::{Dependency, NormalizedConfig, Severity};
use braintrace_store::{MetadataStore, RunMarkers, StoreLayout};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Deadline of the quick probe for an already-running instance.
pub const REUSE_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Brings dependencies up before serving and tears them down afterwards.
///
/// Startup runs the metadata initializer, detects the deployment mode once,
/// then walks the dependencies in declaration order: attach-only dependencies
/// of a containerized deployment are only probed, all others are spawned and
/// then probed. Every process spawned here is terminated by [`shutdown`],
/// in reverse spawn order, however far startup got.
///
/// [`shutdown`]: Self::shutdown
pub struct Orchestrator {
    dependencies: Vec<Dependency>,
    grace: Duration,
    store: Box<dyn MetadataStore>,
    detector: Box<dyn Detect>,
    supervisor: Box<dyn Supervisor>,
    prober: Box<dyn Prober>,
    markers: Option<RunMarkers>,
    state: OrchestratorState,
    mode: Option<DeploymentMode>,
    managed: Vec<ManagedProcess>,
}

/// Result of [`Orchestrator::run`]: the serving window's result and the
/// shutdown that followed it.
#[derive(Debug)]
pub struct RunOutcome<T> {
    pub result: Result<T, CoreError>,
    pub shutdown: ShutdownReport,
}

impl Orchestrator {
    /// Wire the host collaborators for `config` over the data directory `layout`.
    pub fn new(config: &NormalizedConfig, layout: StoreLayout) -> Self {
        let markers = RunMarkers::new(&layout);
        Self::with_collaborators(
            config.dependencies.clone(),
            config.shutdown_grace,
            Box::new(layout),
            Box::new(EnvironmentDetector::new(&config.detection)),
            Box::new(ProcessSupervisor::new(config.force_kill_after_grace)),
            Box::new(NetworkProber::new(config.probe_interval)),
        )
        .with_markers(markers)
    }

    pub fn with_collaborators(
        dependencies: Vec<Dependency>,
        grace: Duration,
        store: Box<dyn MetadataStore>,
        detector: Box<dyn Detect>,
        supervisor: Box<dyn Supervisor>,
        prober: Box<dyn Prober>,
    ) -> Self {
        Self {
            dependencies,
            grace,
            store,
            detector,
            supervisor,
            prober,
            markers: None,
            state: OrchestratorState::Uninitialized,
            mode: None,
            managed: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_markers(mut self, markers: RunMarkers) -> Self {
        self.markers = Some(markers);
        self
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    /// The mode detected during startup, once detection has run.
    pub fn mode(&self) -> Option<DeploymentMode> {
        self.mode
    }

    /// Processes currently owned by this run.
    pub fn managed_count(&self) -> usize {
        self.managed.len()
    }

    fn transition(&mut self, to: OrchestratorState) -> Result<(), CoreError> {
        validate_transition(self.state, to)?;
        debug!("orchestrator {} -> {to}", self.state);
        self.state = to;
        Ok(())
    }

    /// Run the startup sequence.
    ///
    /// A Fatal failure is returned as soon as it happens. Processes spawned
    /// before it stay owned by the orchestrator until [`shutdown`](Self::shutdown).
    pub async fn start(&mut self) -> Result<StartupReport, CoreError> {
        if self.state != OrchestratorState::Uninitialized {
            return Err(CoreError::InvalidTransition {
                from: self.state.to_string(),
                to: OrchestratorState::Detecting.to_string(),
            });
        }

        info!("initializing metadata store");
        if let Err(e) = self.store.initialize() {
            error!("metadata store initialization failed: {e}");
            return Err(CoreError::MetadataInit(e));
        }
        self.sweep_stale_markers();

        self.transition(OrchestratorState::Detecting)?;
        let mode = self.detector.detect();
        self.mode = Some(mode);

        self.transition(OrchestratorState::StartingDependencies)?;
        let mut report = StartupReport::new(mode);
        let dependencies = self.dependencies.clone();
        for dep in &dependencies {
            match self.start_dependency(mode, dep).await {
                Ok(status) => report.push(&dep.name, status),
                Err(e) if e.severity() == Severity::Degraded => {
                    warn!("continuing without {}: {e}", dep.name);
                    report.push(
                        &dep.name,
                        DependencyStatus::Degraded {
                            error: e.to_string(),
                        },
                    );
                }
                Err(e) => {
                    error!("startup aborted: {e}");
                    return Err(e);
                }
            }
        }

        self.transition(OrchestratorState::Ready)?;
        info!(
            "{} dependencies processed in {mode} mode ({} spawned), ready to serve",
            dependencies.len(),
            self.managed.len()
        );
        Ok(report)
    }

    async fn start_dependency(
        &mut self,
        mode: DeploymentMode,
        dep: &Dependency,
    ) -> Result<DependencyStatus, CoreError> {
        if mode.is_containerized() && dep.attach_only {
            info!("{}: attaching to {}", dep.name, dep.readiness);
            let ready = self.wait_ready(dep).await?;
            return Ok(DependencyStatus::Attached {
                ready_after_ms: millis(ready.elapsed),
            });
        }

        if dep.reuse_running {
            let quick = REUSE_PROBE_TIMEOUT.min(dep.readiness_timeout);
            match self.prober.wait_ready(&dep.readiness, quick).await {
                Ok(ready) => {
                    info!("{}: already running at {}, reusing it", dep.name, dep.readiness);
                    return Ok(DependencyStatus::Reused {
                        ready_after_ms: millis(ready.elapsed),
                    });
                }
                Err(_) => debug!("{}: no running instance at {}", dep.name, dep.readiness),
            }
        }

        info!("{}: starting {}", dep.name, dep.spawn.display_line());
        let process = self
            .supervisor
            .spawn(&dep.name, &dep.spawn)
            .map_err(|source| CoreError::Spawn {
                name: dep.name.clone(),
                criticality: dep.criticality,
                source,
            })?;
        let pid = process.pid();
        let started_at = process.started_at();
        if let (Some(markers), Some(pid)) = (&self.markers, pid) {
            if let Err(e) = markers.record(&dep.name, pid) {
                warn!("failed to record pid marker for {}: {e}", dep.name);
            }
        }
        self.managed.push(process);

        let ready = self.wait_ready(dep).await?;
        Ok(DependencyStatus::Spawned {
            pid,
            started_at,
            ready_after_ms: millis(ready.elapsed),
        })
    }

    async fn wait_ready(&self, dep: &Dependency) -> Result<Readiness, CoreError> {
        self.prober
            .wait_ready(&dep.readiness, dep.readiness_timeout)
            .await
            .map_err(|source| CoreError::ReadinessTimeout {
                name: dep.name.clone(),
                criticality: dep.criticality,
                source,
            })
    }

    fn sweep_stale_markers(&self) {
        let Some(markers) = &self.markers else {
            return;
        };
        match markers.sweep() {
            Ok(stale) => {
                for m in stale {
                    let pid = m.pid.map_or_else(|| "?".to_owned(), |p| p.to_string());
                    if m.alive {
                        warn!(
                            "{} (pid {pid}) from a previous run may still be running",
                            m.name
                        );
                    } else {
                        info!("removed stale pid marker for {} (pid {pid})", m.name);
                    }
                }
            }
            Err(e) => warn!("failed to sweep pid markers: {e}"),
        }
    }

    /// Terminate every process spawned by this run, newest first.
    ///
    /// Never fails: each process gets exactly one termination attempt and
    /// anything short of a clean exit is collected as a [`ShutdownAnomaly`].
    /// Calling it again after the first shutdown is a no-op.
    pub async fn shutdown(&mut self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        if self.state == OrchestratorState::Stopped {
            return report;
        }
        if let Err(e) = self.transition(OrchestratorState::ShuttingDown) {
            warn!("{e}");
            self.state = OrchestratorState::ShuttingDown;
        }
        if !self.managed.is_empty() {
            info!(
                "stopping {} dependencies (grace {:?})",
                self.managed.len(),
                self.grace
            );
        }

        while let Some(mut process) = self.managed.pop() {
            let name = process.name().to_owned();
            let pid = process.pid();
            let mut left_running = false;
            match self.supervisor.terminate(&mut process, self.grace).await {
                Ok(
                    TerminationOutcome::Exited { .. }
                    | TerminationOutcome::AlreadyExited { .. }
                    | TerminationOutcome::NotOwned,
                ) => {
                    info!("{name} stopped after {:?} uptime", process.uptime());
                    report.stopped.push(name.clone());
                }
                Ok(TerminationOutcome::TimedOut { grace, killed }) => {
                    left_running = !killed;
                    report.anomalies.push(ShutdownAnomaly {
                        name: name.clone(),
                        pid,
                        kind: AnomalyKind::TimedOut { grace, killed },
                    });
                }
                Err(e) => {
                    report.anomalies.push(ShutdownAnomaly {
                        name: name.clone(),
                        pid,
                        kind: AnomalyKind::Failed(e.to_string()),
                    });
                }
            }
            // the marker of a process left running lets the next start report it
            if left_running {
                continue;
            }
            if let Some(markers) = &self.markers {
                if let Err(e) = markers.clear(&name) {
                    warn!("failed to clear pid marker for {name}: {e}");
                }
            }
        }

        for anomaly in &report.anomalies {
            warn!("shutdown {}: {anomaly}", anomaly.severity());
        }
        self.state = OrchestratorState::Stopped;
        info!(
            "shutdown complete ({} stopped, {} anomalies)",
            report.stopped.len(),
            report.anomalies.len()
        );
        report
    }

    /// Start, hand control to `serve`, and always shut down afterwards.
    ///
    /// `serve` is only called when startup succeeded. Shutdown runs whether
    /// startup failed, `serve` failed, or `serve` returned normally.
    pub async fn run<F, Fut, T>(&mut self, serve: F) -> RunOutcome<T>
    where
        F: FnOnce(StartupReport) -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let result = match self.start().await {
            Ok(report) => serve(report).await,
            Err(e) => Err(e),
        };
        let shutdown = self.shutdown().await;
        RunOutcome { result, shutdown }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if !self.managed.is_empty() {
            warn!(
                "orchestrator dropped with {} running dependencies, force-stopping their process groups",
                self.managed.len()
            );
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
