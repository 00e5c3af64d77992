//! Orchestrator startup and shutdown driven by mock collaborators.

use braintrace_core::{
    AnomalyKind, CoreError, DependencyStatus, Orchestrator, OrchestratorState, REUSE_PROBE_TIMEOUT,
};
use braintrace_runtime::mock::{MockProber, MockSupervisor, MockTermination, StaticDetector};
use braintrace_runtime::{DeploymentMode, EnvironmentDetector};
use braintrace_schema::{parse_config_str, Dependency, DetectionSettings, Severity};
use braintrace_store::{MetadataStore, RunMarkers, StoreError, StoreLayout};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const GRACE: Duration = Duration::from_secs(10);

fn dependencies(toml: &str) -> Vec<Dependency> {
    parse_config_str(&format!("config_version = 1\n{toml}"))
        .unwrap()
        .normalize_with_env(Path::new("/opt/braintrace"), |_| None)
        .unwrap()
        .dependencies
}

fn dependency(name: &str, port: u16, extra: &str) -> String {
    format!(
        r#"
[[dependency]]
name = "{name}"
readiness = {{ tcp = "127.0.0.1:{port}" }}
spawn = {{ program = "{name}-bin" }}
{extra}
"#
    )
}

#[derive(Clone, Default)]
struct CountingStore {
    calls: Arc<AtomicUsize>,
    fail: bool,
}

impl MetadataStore for CountingStore {
    fn initialize(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(StoreError::Init("database is locked".to_owned()))
        } else {
            Ok(())
        }
    }
}

struct Harness {
    orchestrator: Orchestrator,
    detector: StaticDetector,
    supervisor: MockSupervisor,
    prober: MockProber,
    deps: Vec<Dependency>,
}

impl Harness {
    fn new(toml: &str, mode: DeploymentMode) -> Self {
        Self::with_store(toml, mode, CountingStore::default())
    }

    fn with_store(toml: &str, mode: DeploymentMode, store: CountingStore) -> Self {
        let deps = dependencies(toml);
        let detector = StaticDetector::new(mode);
        let supervisor = MockSupervisor::new();
        let prober = MockProber::new();
        let orchestrator = Orchestrator::with_collaborators(
            deps.clone(),
            GRACE,
            Box::new(store),
            Box::new(detector.clone()),
            Box::new(supervisor.clone()),
            Box::new(prober.clone()),
        );
        Self {
            orchestrator,
            detector,
            supervisor,
            prober,
            deps,
        }
    }

    fn ready(&self, name: &str) {
        let dep = self.deps.iter().find(|d| d.name == name).unwrap();
        self.prober.set_ready(&dep.readiness);
    }
}

#[tokio::test]
async fn containerized_override_attaches_without_spawning() {
    // a unique variable so parallel tests never observe it
    let var = "BRAINTRACE_SCENARIO_OVERRIDE";
    std::env::set_var(var, "true");
    let dir = tempfile::tempdir().unwrap();
    let detector = EnvironmentDetector::new(&DetectionSettings {
        override_var: var.to_owned(),
        marker_file: dir.path().join("no-marker"),
        cgroup_file: dir.path().join("no-cgroup"),
        cgroup_markers: vec!["docker".to_owned()],
    });

    let toml = dependency("graph-engine", 7687, "");
    let deps = dependencies(&toml);
    let supervisor = MockSupervisor::new();
    let prober = MockProber::new();
    prober.set_ready(&deps[0].readiness);
    let mut orch = Orchestrator::with_collaborators(
        deps,
        GRACE,
        Box::new(CountingStore::default()),
        Box::new(detector),
        Box::new(supervisor.clone()),
        Box::new(prober),
    );

    let report = orch.start().await.unwrap();
    std::env::remove_var(var);
    assert_eq!(report.mode, DeploymentMode::Containerized);
    assert!(supervisor.spawned().is_empty());
    assert!(matches!(
        report.status("graph-engine"),
        Some(DependencyStatus::Attached { .. })
    ));
}

#[tokio::test]
async fn standalone_spawns_in_declaration_order() {
    let toml = dependency("graph-engine", 7687, "") + &dependency("inference-server", 11434, "");
    let mut h = Harness::new(&toml, DeploymentMode::Standalone);
    h.ready("graph-engine");
    h.ready("inference-server");

    let report = h.orchestrator.start().await.unwrap();
    assert_eq!(h.supervisor.spawned(), vec!["graph-engine", "inference-server"]);
    assert_eq!(h.detector.calls(), 1);
    assert_eq!(h.orchestrator.state(), OrchestratorState::Ready);
    assert!(matches!(
        report.status("inference-server"),
        Some(DependencyStatus::Spawned { pid: Some(_), .. })
    ));

    let shutdown = h.orchestrator.shutdown().await;
    assert!(shutdown.is_clean());
    assert_eq!(shutdown.stopped, vec!["inference-server", "graph-engine"]);
}

#[tokio::test]
async fn readiness_timeout_aborts_and_spawned_process_is_terminated() {
    let toml = dependency("graph-engine", 7687, "readiness_timeout_secs = 2")
        + &dependency("inference-server", 11434, "");
    let mut h = Harness::new(&toml, DeploymentMode::Standalone);

    let err = h.orchestrator.start().await.unwrap_err();
    let CoreError::ReadinessTimeout { name, source, .. } = &err else {
        panic!("expected ReadinessTimeout, got {err}");
    };
    assert_eq!(name, "graph-engine");
    assert!(source.elapsed >= Duration::from_secs(2));
    assert_eq!(err.severity(), Severity::Fatal);
    // the second dependency is never reached
    assert_eq!(h.supervisor.spawned(), vec!["graph-engine"]);

    let shutdown = h.orchestrator.shutdown().await;
    assert_eq!(h.supervisor.terminated(), vec!["graph-engine"]);
    assert_eq!(shutdown.attempted(), 1);
    assert_eq!(h.orchestrator.state(), OrchestratorState::Stopped);
}

#[tokio::test]
async fn containerized_attach_only_never_spawns() {
    let toml = dependency("graph-engine", 7687, "attach_only = true");
    let mut h = Harness::new(&toml, DeploymentMode::Containerized);
    h.ready("graph-engine");

    h.orchestrator.start().await.unwrap();
    assert!(h.supervisor.spawned().is_empty());
    assert_eq!(h.orchestrator.managed_count(), 0);
    assert!(h.orchestrator.shutdown().await.is_clean());
    assert!(h.supervisor.terminated().is_empty());
}

#[tokio::test]
async fn containerized_without_attach_only_still_spawns() {
    let toml = dependency("sidecar", 9000, "attach_only = false");
    let mut h = Harness::new(&toml, DeploymentMode::Containerized);
    h.ready("sidecar");

    h.orchestrator.start().await.unwrap();
    assert_eq!(h.supervisor.spawned(), vec!["sidecar"]);
}

#[tokio::test]
async fn metadata_failure_stops_before_detection() {
    let store = CountingStore {
        fail: true,
        ..CountingStore::default()
    };
    let calls = store.calls.clone();
    let toml = dependency("graph-engine", 7687, "");
    let mut h = Harness::with_store(&toml, DeploymentMode::Standalone, store);
    h.ready("graph-engine");

    let err = h.orchestrator.start().await.unwrap_err();
    assert!(matches!(err, CoreError::MetadataInit(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.detector.calls(), 0);
    assert!(h.supervisor.spawned().is_empty());
    assert!(h.prober.probed().is_empty());
    assert_eq!(h.orchestrator.mode(), None);
}

#[tokio::test]
async fn degraded_dependency_does_not_stop_startup() {
    let toml = dependency("inference-server", 11434, r#"criticality = "degraded""#)
        + &dependency("graph-engine", 7687, "");
    let mut h = Harness::new(&toml, DeploymentMode::Standalone);
    h.ready("graph-engine");

    let report = h.orchestrator.start().await.unwrap();
    assert!(report.is_degraded());
    let Some(DependencyStatus::Degraded { error }) = report.status("inference-server") else {
        panic!("expected degraded status");
    };
    assert!(error.contains("inference-server"));
    assert_eq!(h.supervisor.spawned(), vec!["inference-server", "graph-engine"]);

    // the unready process is still owned and stopped
    let shutdown = h.orchestrator.shutdown().await;
    assert_eq!(shutdown.stopped, vec!["graph-engine", "inference-server"]);
}

#[tokio::test]
async fn spawn_failure_after_partial_start_cleans_up() {
    let toml = dependency("graph-engine", 7687, "") + &dependency("inference-server", 11434, "");
    let mut h = Harness::new(&toml, DeploymentMode::Standalone);
    h.ready("graph-engine");
    h.supervisor.fail_spawn("inference-server");

    let err = h.orchestrator.start().await.unwrap_err();
    assert!(matches!(err, CoreError::Spawn { ref name, .. } if name == "inference-server"));
    assert_eq!(err.dependency(), Some("inference-server"));

    h.orchestrator.shutdown().await;
    assert_eq!(h.supervisor.terminated(), vec!["graph-engine"]);
}

#[tokio::test]
async fn degraded_spawn_failure_is_recorded() {
    let toml = dependency("inference-server", 11434, r#"criticality = "degraded""#);
    let mut h = Harness::new(&toml, DeploymentMode::Standalone);
    h.supervisor.fail_spawn("inference-server");

    let report = h.orchestrator.start().await.unwrap();
    assert!(report.is_degraded());
    assert_eq!(h.orchestrator.managed_count(), 0);
}

#[tokio::test]
async fn anomalies_never_stop_the_shutdown_sequence() {
    let toml = dependency("a", 7001, "") + &dependency("b", 7002, "") + &dependency("c", 7003, "");
    let mut h = Harness::new(&toml, DeploymentMode::Standalone);
    for name in ["a", "b", "c"] {
        h.ready(name);
    }
    h.supervisor
        .on_terminate("c", MockTermination::Fail)
        .on_terminate("b", MockTermination::Timeout { killed: true });

    h.orchestrator.start().await.unwrap();
    let shutdown = h.orchestrator.shutdown().await;

    assert_eq!(h.supervisor.terminated(), vec!["c", "b", "a"]);
    assert_eq!(shutdown.stopped, vec!["a"]);
    assert_eq!(shutdown.anomalies.len(), 2);
    assert!(matches!(shutdown.anomalies[0].kind, AnomalyKind::Failed(_)));
    assert_eq!(
        shutdown.anomalies[1].kind,
        AnomalyKind::TimedOut {
            grace: GRACE,
            killed: true
        }
    );
    assert_eq!(h.orchestrator.state(), OrchestratorState::Stopped);
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let toml = dependency("graph-engine", 7687, "");
    let mut h = Harness::new(&toml, DeploymentMode::Standalone);
    h.ready("graph-engine");

    h.orchestrator.start().await.unwrap();
    h.orchestrator.shutdown().await;
    let second = h.orchestrator.shutdown().await;
    assert_eq!(second.attempted(), 0);
    assert_eq!(h.supervisor.terminated(), vec!["graph-engine"]);
}

#[tokio::test]
async fn running_instance_is_reused() {
    let toml = dependency("inference-server", 11434, "reuse_running = true");
    let mut h = Harness::new(&toml, DeploymentMode::Standalone);
    h.ready("inference-server");

    let report = h.orchestrator.start().await.unwrap();
    assert!(matches!(
        report.status("inference-server"),
        Some(DependencyStatus::Reused { .. })
    ));
    assert!(h.supervisor.spawned().is_empty());
    assert_eq!(h.prober.probed()[0].1, REUSE_PROBE_TIMEOUT);
}

#[tokio::test]
async fn reuse_probe_miss_falls_back_to_spawn() {
    let toml = dependency(
        "inference-server",
        11434,
        "reuse_running = true\nreadiness_timeout_secs = 30",
    );
    let mut h = Harness::new(&toml, DeploymentMode::Standalone);

    let err = h.orchestrator.start().await.unwrap_err();
    assert!(matches!(err, CoreError::ReadinessTimeout { .. }));
    assert_eq!(h.supervisor.spawned(), vec!["inference-server"]);
    let probed: Vec<Duration> = h.prober.probed().into_iter().map(|(_, t)| t).collect();
    assert_eq!(probed, vec![REUSE_PROBE_TIMEOUT, Duration::from_secs(30)]);
}

#[tokio::test]
async fn run_serves_between_start_and_shutdown() {
    let toml = dependency("graph-engine", 7687, "");
    let mut h = Harness::new(&toml, DeploymentMode::Standalone);
    h.ready("graph-engine");
    let supervisor = h.supervisor.clone();

    let outcome = h
        .orchestrator
        .run(|report| async move {
            assert!(supervisor.terminated().is_empty());
            Ok(report.dependencies.len())
        })
        .await;
    assert_eq!(outcome.result.unwrap(), 1);
    assert_eq!(outcome.shutdown.stopped, vec!["graph-engine"]);
}

#[tokio::test]
async fn run_shuts_down_after_serving_failure() {
    let toml = dependency("graph-engine", 7687, "");
    let mut h = Harness::new(&toml, DeploymentMode::Standalone);
    h.ready("graph-engine");

    let outcome = h
        .orchestrator
        .run(|_| async { Err::<(), _>(CoreError::Serving("listener closed".to_owned())) })
        .await;
    assert!(matches!(outcome.result, Err(CoreError::Serving(_))));
    assert_eq!(h.supervisor.terminated(), vec!["graph-engine"]);
}

#[tokio::test]
async fn run_never_serves_after_fatal_startup() {
    let toml = dependency("graph-engine", 7687, "");
    let mut h = Harness::new(&toml, DeploymentMode::Standalone);
    let served = Arc::new(AtomicUsize::new(0));
    let counter = served.clone();

    let outcome = h
        .orchestrator
        .run(|_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
    assert!(matches!(outcome.result, Err(CoreError::ReadinessTimeout { .. })));
    assert_eq!(served.load(Ordering::SeqCst), 0);
    assert_eq!(outcome.shutdown.attempted(), 1);
}

#[tokio::test]
async fn pid_markers_follow_process_lifetime() {
    let dir = tempfile::tempdir().unwrap();
    let layout = StoreLayout::new(dir.path());
    let markers = RunMarkers::new(&layout);
    // leftover from a crashed run
    layout.initialize().unwrap();
    markers.record("ghost", 999_999).unwrap();

    let toml = dependency("graph-engine", 7687, "");
    let deps = dependencies(&toml);
    let prober = MockProber::new();
    prober.set_ready(&deps[0].readiness);
    let mut orch = Orchestrator::with_collaborators(
        deps,
        GRACE,
        Box::new(layout.clone()),
        Box::new(StaticDetector::new(DeploymentMode::Standalone)),
        Box::new(MockSupervisor::new()),
        Box::new(prober),
    )
    .with_markers(markers.clone());

    orch.start().await.unwrap();
    assert!(!markers.marker_path("ghost").exists());
    assert!(markers.marker_path("graph-engine").exists());

    orch.shutdown().await;
    assert!(!markers.marker_path("graph-engine").exists());
}
