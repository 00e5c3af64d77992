//! In-memory collaborators for driving the orchestrator without touching the
//! host. Each mock is cheaply cloneable and clones share state, so a test can
//! hand one clone to the orchestrator and inspect the other afterwards.

use crate::detect::{Detect, DeploymentMode};
use crate::probe::{AttemptError, Prober, Readiness, ReadinessTimeout};
use crate::process::{ManagedProcess, Supervisor, TerminationOutcome};
use crate::RuntimeError;
use async_trait::async_trait;
use braintrace_schema::{ReadinessTarget, SpawnCommand};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Always reports the same mode and counts how often it was asked.
#[derive(Debug, Clone)]
pub struct StaticDetector {
    mode: DeploymentMode,
    calls: Arc<AtomicUsize>,
}

impl StaticDetector {
    pub fn new(mode: DeploymentMode) -> Self {
        Self {
            mode,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Detect for StaticDetector {
    fn detect(&self) -> DeploymentMode {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.mode
    }
}

/// What a mock termination reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockTermination {
    Exit,
    Timeout { killed: bool },
    Fail,
}

#[derive(Debug, Default)]
struct SupervisorState {
    spawned: Vec<String>,
    terminated: Vec<String>,
    failing: HashSet<String>,
    terminations: HashMap<String, MockTermination>,
    next_pid: u32,
}

/// Records spawn and terminate calls in order.
#[derive(Debug, Clone, Default)]
pub struct MockSupervisor {
    state: Arc<Mutex<SupervisorState>>,
}

impl MockSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every spawn of `name` fail.
    pub fn fail_spawn(&self, name: &str) -> &Self {
        lock(&self.state).failing.insert(name.to_owned());
        self
    }

    pub fn on_terminate(&self, name: &str, outcome: MockTermination) -> &Self {
        lock(&self.state)
            .terminations
            .insert(name.to_owned(), outcome);
        self
    }

    pub fn spawned(&self) -> Vec<String> {
        lock(&self.state).spawned.clone()
    }

    pub fn terminated(&self) -> Vec<String> {
        lock(&self.state).terminated.clone()
    }
}

#[async_trait]
impl Supervisor for MockSupervisor {
    fn spawn(&self, name: &str, command: &SpawnCommand) -> Result<ManagedProcess, RuntimeError> {
        let mut state = lock(&self.state);
        if state.failing.contains(name) {
            return Err(RuntimeError::SpawnFailed {
                name: name.to_owned(),
                program: command.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "mock spawn failure"),
            });
        }
        state.spawned.push(name.to_owned());
        state.next_pid += 1;
        Ok(ManagedProcess::synthetic(name, 10_000 + state.next_pid))
    }

    async fn terminate(
        &self,
        process: &mut ManagedProcess,
        grace: Duration,
    ) -> Result<TerminationOutcome, RuntimeError> {
        let outcome = {
            let mut state = lock(&self.state);
            state.terminated.push(process.name().to_owned());
            state
                .terminations
                .get(process.name())
                .copied()
                .unwrap_or(MockTermination::Exit)
        };
        match outcome {
            MockTermination::Exit => Ok(TerminationOutcome::Exited {
                code: Some(0),
                waited: Duration::ZERO,
            }),
            MockTermination::Timeout { killed } => {
                Ok(TerminationOutcome::TimedOut { grace, killed })
            }
            MockTermination::Fail => Err(RuntimeError::SignalFailed {
                name: process.name().to_owned(),
                source: std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "mock signal failure",
                ),
            }),
        }
    }
}

#[derive(Debug, Default)]
struct ProberState {
    ready: HashSet<ReadinessTarget>,
    probed: Vec<(ReadinessTarget, Duration)>,
}

/// Reports targets marked ready as reachable at once and every other target
/// as timed out, without waiting.
#[derive(Debug, Clone, Default)]
pub struct MockProber {
    state: Arc<Mutex<ProberState>>,
}

impl MockProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, target: &ReadinessTarget) -> &Self {
        lock(&self.state).ready.insert(target.clone());
        self
    }

    /// Every `wait_ready` call with the timeout it was given.
    pub fn probed(&self) -> Vec<(ReadinessTarget, Duration)> {
        lock(&self.state).probed.clone()
    }
}

#[async_trait]
impl Prober for MockProber {
    async fn wait_ready(
        &self,
        target: &ReadinessTarget,
        timeout: Duration,
    ) -> Result<Readiness, ReadinessTimeout> {
        let mut state = lock(&self.state);
        state.probed.push((target.clone(), timeout));
        if state.ready.contains(target) {
            Ok(Readiness {
                target: target.clone(),
                elapsed: Duration::ZERO,
                attempts: 1,
            })
        } else {
            Err(ReadinessTimeout {
                target: target.clone(),
                timeout,
                elapsed: timeout,
                attempts: 1,
                last_error: Some(AttemptError::Refused),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detector_counts_calls() {
        let detector = StaticDetector::new(DeploymentMode::Standalone);
        let shared = detector.clone();
        assert_eq!(detector.detect(), DeploymentMode::Standalone);
        assert_eq!(shared.calls(), 1);
    }

    #[tokio::test]
    async fn supervisor_records_calls_in_order() {
        let sup = MockSupervisor::new();
        sup.fail_spawn("broken");
        let cmd = SpawnCommand {
            program: "x".to_owned(),
            fallbacks: Vec::new(),
            args: Vec::new(),
            search_paths: Vec::new(),
            working_dir: None,
            env: std::collections::BTreeMap::new(),
            base_dir: std::path::PathBuf::new(),
        };
        let mut a = sup.spawn("a", &cmd).unwrap();
        let mut b = sup.spawn("b", &cmd).unwrap();
        assert!(sup.spawn("broken", &cmd).is_err());
        assert_ne!(a.pid(), b.pid());
        assert_eq!(a.pid(), Some(10001));

        sup.on_terminate("a", MockTermination::Timeout { killed: true });
        sup.terminate(&mut b, Duration::from_secs(1)).await.unwrap();
        let outcome = sup.terminate(&mut a, Duration::from_secs(1)).await.unwrap();
        assert!(matches!(outcome, TerminationOutcome::TimedOut { killed: true, .. }));
        assert_eq!(sup.spawned(), vec!["a", "b"]);
        assert_eq!(sup.terminated(), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn prober_answers_from_ready_set() {
        let ready = ReadinessTarget::Http {
            url: "http://localhost:11434/api/tags".to_owned(),
        };
        let down = ReadinessTarget::Tcp {
            host: "127.0.0.1".to_owned(),
            port: 7687,
        };
        let prober = MockProber::new();
        prober.set_ready(&ready);

        assert!(prober.wait_ready(&ready, Duration::from_secs(1)).await.is_ok());
        let err = prober
            .wait_ready(&down, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err.elapsed, Duration::from_secs(2));
        assert_eq!(prober.probed().len(), 2);
    }
}
