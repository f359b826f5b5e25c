//! End-to-end provisioning flows against a scripted docker CLI
//!
//! Every test runs on a paused tokio clock, so health polling, retry pauses and
//! admission waits complete instantly while elapsed virtual time stays exact.

use mango_core::admission::mock::ScriptedLoad;
use mango_core::admission::AdmissionController;
use mango_core::config::TaskConfig;
use mango_core::errors::{
    MangoError, ProvisionError, EXIT_FAILURE, EXIT_INFRASTRUCTURE_UNAVAILABLE,
};
use mango_core::executor::mock::ScriptedExecutor;
use mango_core::orchestrator::{ContainerOrchestrator, OrchestratorState};
use mango_core::ports::mock::ScriptedProbe;
use mango_core::progress::{MemoryEmitter, ProgressEvent, ProgressTracker};
use mango_core::runtime::RuntimeClient;
use std::sync::Arc;

const LISTED: &str = r#"{"ID":"abc123","Names":"t1","Image":"img:latest","State":"running","Status":"Up 1 second","Ports":""}"#;
const STARTING: &str = r#"{"Status":"running","Health":{"Status":"starting"}}"#;
const HEALTHY: &str = r#"{"Status":"running","Health":{"Status":"healthy"}}"#;
const KVM_OK: &str = "INFO: /dev/kvm exists\nKVM acceleration can be used\n";
const KVM_MISSING: &str = "INFO: Your CPU does not support KVM extensions\nKVM acceleration can NOT be used\n";
const ATTACHED: &str = "List of devices attached\nemulator-5554\tdevice\n";
const NO_DEVICES: &str = "List of devices attached\n";

type TestOrchestrator<'a> = ContainerOrchestrator<&'a ScriptedExecutor, ScriptedProbe>;

/// Docker CLI with no leftovers: the name lookup finds nothing, a created
/// container lists as `abc123`, kvm works and adb sees the device.
fn docker() -> ScriptedExecutor {
    let executor = ScriptedExecutor::new();
    executor
        .respond_ok("docker ps -a", "")
        .respond_ok("docker ps -a", LISTED);
    executor.respond_ok("kvm-ok", KVM_OK);
    executor.respond_ok("adb devices", ATTACHED);
    executor
}

/// [`docker`] where `docker run` succeeds.
fn docker_created() -> ScriptedExecutor {
    let executor = docker();
    executor.respond_ok("docker run", "abc123\n");
    executor
}

fn config() -> TaskConfig {
    TaskConfig {
        container_name: Some("t1".to_string()),
        docker_image: "img:latest".to_string(),
        container_timeout: 10,
        poll_interval: 5,
        ..Default::default()
    }
}

fn orchestrator(
    executor: &ScriptedExecutor,
    config: TaskConfig,
) -> (TestOrchestrator<'_>, MemoryEmitter) {
    orchestrator_with_load(executor, config, Arc::new(ScriptedLoad::idle()))
}

fn orchestrator_with_load(
    executor: &ScriptedExecutor,
    config: TaskConfig,
    load: Arc<ScriptedLoad>,
) -> (TestOrchestrator<'_>, MemoryEmitter) {
    let memory = MemoryEmitter::new();
    let orchestrator = ContainerOrchestrator::new(
        config,
        RuntimeClient::new(executor),
        AdmissionController::new(load).with_enabled(true),
        ScriptedProbe::free(),
        ProgressTracker::new(Some(Box::new(memory.clone()))),
    )
    .with_workspace("/work");
    (orchestrator, memory)
}

fn run_invocations(executor: &ScriptedExecutor) -> Vec<Vec<String>> {
    executor
        .invocations()
        .into_iter()
        .filter(|argv| argv.get(1).map(String::as_str) == Some("run"))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_scenario_healthy_on_first_attempt() {
    let executor = docker_created();
    executor.respond_ok("docker inspect", HEALTHY);
    let (mut orchestrator, memory) = orchestrator(&executor, config());

    let handle = orchestrator.setup_container().await.unwrap();

    assert_eq!(handle.id, "abc123");
    assert_eq!(handle.name, "t1");
    assert!(handle.health.is_healthy());
    assert_eq!(orchestrator.state(), OrchestratorState::Ready);
    assert_eq!(orchestrator.port(), 6080);

    let runs = run_invocations(&executor);
    assert_eq!(runs.len(), 1);
    let run = &runs[0];
    assert!(!run.iter().any(|arg| arg.starts_with("--cpus")));
    assert!(run.windows(2).any(|w| w == ["-p", "6080:6080"]));
    assert!(run.windows(2).any(|w| w == ["-e", "DEVICE=Nexus 5X"]));
    assert!(run.windows(2).any(|w| w == ["--name", "t1"]));
    assert_eq!(run.last().map(String::as_str), Some("img:latest"));

    assert_eq!(executor.count("docker network disconnect -f bridge t1"), 1);
    assert_eq!(executor.count("docker inspect"), 1);
    assert_eq!(executor.count("adb devices"), 1);
    assert_eq!(executor.count("settings put global"), 3);
    assert_eq!(executor.count("adb logcat -G 16m"), 1);
    assert!(!memory.kinds().contains(&"container.recreate"));
    assert_eq!(memory.kinds().last(), Some(&"container.ready"));
}

#[tokio::test(start_paused = true)]
async fn test_scenario_single_recreate_after_health_timeout() {
    let executor = docker_created();
    executor
        .respond_ok("docker inspect", STARTING)
        .respond_ok("docker inspect", STARTING)
        .respond_ok("docker inspect", HEALTHY);
    let (mut orchestrator, memory) = orchestrator(&executor, config());

    orchestrator.setup_container().await.unwrap();

    assert_eq!(orchestrator.state(), OrchestratorState::Ready);
    assert_eq!(executor.count("docker run"), 2);
    assert_eq!(executor.count("docker rm -f t1"), 1);
    assert_eq!(
        memory
            .kinds()
            .iter()
            .filter(|kind| **kind == "container.recreate")
            .count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_scenario_never_healthy_is_infrastructure_failure() {
    let executor = docker_created();
    executor.respond_ok("docker inspect", STARTING);
    let (mut orchestrator, memory) = orchestrator(&executor, config());

    let err = orchestrator.setup_container().await.unwrap_err();

    assert!(matches!(
        err,
        MangoError::Provision(ProvisionError::InfrastructureUnavailable { attempts: 2, .. })
    ));
    assert_eq!(err.exit_code(), EXIT_INFRASTRUCTURE_UNAVAILABLE);
    assert_ne!(err.exit_code(), EXIT_FAILURE);
    assert_eq!(orchestrator.state(), OrchestratorState::Failed);
    assert!(orchestrator.handle().is_none());

    assert_eq!(executor.count("docker run"), 2);
    assert_eq!(executor.count("docker logs"), 1);
    assert_eq!(executor.count("docker rm -f t1"), 2);
    assert_eq!(memory.kinds().last(), Some(&"provision.failed"));
}

#[tokio::test(start_paused = true)]
async fn test_scenario_port_factor_evicts_publisher() {
    let executor = docker_created();
    executor.respond_ok(
        "docker ps --no-trunc",
        r#"{"ID":"f00d","Names":"other-run","State":"running","Ports":"0.0.0.0:6083->6080/tcp"}"#,
    );
    executor.respond_ok("docker inspect", HEALTHY);
    let config = TaskConfig {
        port_factor: Some(3),
        ..config()
    };
    let (mut orchestrator, memory) = orchestrator(&executor, config);

    orchestrator.setup_container().await.unwrap();

    assert_eq!(orchestrator.port(), 6083);
    assert_eq!(memory.kinds().first(), Some(&"port.assigned"));
    let stop = executor.position("docker stop f00d").unwrap();
    let run = executor.position("docker run").unwrap();
    assert!(stop < run);
    assert!(run_invocations(&executor)[0]
        .windows(2)
        .any(|w| w == ["-p", "6083:6080"]));
}

#[tokio::test(start_paused = true)]
async fn test_scenario_missing_kvm_is_fatal_without_retries() {
    let executor = ScriptedExecutor::new();
    executor
        .respond_ok("docker ps -a", "")
        .respond_ok("docker ps -a", LISTED);
    executor.respond_ok("docker run", "abc123\n");
    executor.respond_ok("kvm-ok", KVM_MISSING);
    let (mut orchestrator, memory) = orchestrator(&executor, config());

    let err = orchestrator.setup_container().await.unwrap_err();

    assert!(matches!(
        err,
        MangoError::Provision(ProvisionError::CapabilityUnavailable { .. })
    ));
    assert_eq!(err.exit_code(), EXIT_FAILURE);
    assert_eq!(executor.count("docker run"), 1);
    assert_eq!(executor.count("kvm-ok"), 1);
    assert_eq!(executor.count("docker inspect"), 0);
    assert!(!memory.kinds().contains(&"container.recreate"));
    // The container stays owned so the caller's cleanup removes it.
    assert_eq!(orchestrator.container_name(), Some("t1"));
}

#[tokio::test(start_paused = true)]
async fn test_unnamed_container_uses_runtime_id() {
    let executor = docker_created();
    executor.respond_ok("docker inspect", HEALTHY);
    let config = TaskConfig {
        container_name: None,
        ..config()
    };
    let (mut orchestrator, _) = orchestrator(&executor, config);

    let handle = orchestrator.setup_container().await.unwrap();

    assert_eq!(handle.name, "abc123");
    assert_eq!(executor.count("network disconnect"), 0);
    assert!(!run_invocations(&executor)[0].contains(&"--name".to_string()));
    assert_eq!(executor.count("docker exec -i abc123"), 6);
}

#[tokio::test(start_paused = true)]
async fn test_create_failure_retries_once_after_cleanup() {
    let executor = docker();
    executor
        .respond_err("docker run", 125, "Conflict. The container name \"/t1\" is already in use")
        .respond_ok("docker run", "abc123\n");
    executor.respond_ok("docker inspect", HEALTHY);
    let (mut orchestrator, _) = orchestrator(&executor, config());

    orchestrator.setup_container().await.unwrap();

    assert_eq!(executor.count("docker run"), 2);
    let first_run = executor.position("docker run").unwrap();
    let partial_rm = executor.position("docker rm t1").unwrap();
    assert!(first_run < partial_rm);
}

#[tokio::test(start_paused = true)]
async fn test_create_failing_twice_propagates() {
    let executor = docker();
    executor.respond_err("docker run", 125, "invalid reference format");
    let (mut orchestrator, _) = orchestrator(&executor, config());

    let err = orchestrator.setup_container().await.unwrap_err();
    assert!(matches!(err, MangoError::Command(_)));
    assert_eq!(executor.count("docker run"), 2);
    assert_eq!(err.exit_code(), EXIT_FAILURE);
}

#[tokio::test(start_paused = true)]
async fn test_existing_named_container_is_removed_first() {
    let executor = ScriptedExecutor::new();
    executor.respond_ok("docker ps -a", LISTED);
    executor.respond_ok("docker run", "abc123\n");
    executor.respond_ok("kvm-ok", KVM_OK);
    executor.respond_ok("adb devices", ATTACHED);
    executor.respond_ok("docker inspect", HEALTHY);
    let (mut orchestrator, _) = orchestrator(&executor, config());

    orchestrator.setup_container().await.unwrap();

    let removed = executor.position("docker rm -f t1").unwrap();
    let run = executor.position("docker run").unwrap();
    assert!(removed < run);
}

#[tokio::test(start_paused = true)]
async fn test_pull_latest_logs_in_and_strips_tag() {
    let executor = docker_created();
    executor.respond_ok("docker inspect", HEALTHY);
    let config = TaskConfig {
        pull_latest_image: true,
        docker_registry_login: Some("docker login -u ci registry.local".to_string()),
        ..config()
    };
    let (mut orchestrator, _) = orchestrator(&executor, config);

    orchestrator.setup_container().await.unwrap();

    let login = executor.position("docker login -u ci registry.local").unwrap();
    let pull = executor.position("docker pull img").unwrap();
    assert!(login < pull);
    assert_eq!(executor.count("docker pull img:latest"), 0);
    assert_eq!(
        run_invocations(&executor)[0].last().map(String::as_str),
        Some("img:latest")
    );
}

#[tokio::test(start_paused = true)]
async fn test_non_emulator_mode_skips_guest_steps() {
    let executor = docker_created();
    executor.respond_ok("docker inspect", r#"{"Status":"running"}"#);
    let config = TaskConfig {
        is_running_on_emulator: false,
        port_factor: Some(3),
        ..config()
    };
    let (mut orchestrator, _) = orchestrator(&executor, config);

    orchestrator.setup_container().await.unwrap();

    assert_eq!(orchestrator.port(), 6080);
    assert_eq!(executor.count("kvm-ok"), 0);
    assert_eq!(executor.count("adb"), 0);
    assert_eq!(executor.count("docker ps --no-trunc"), 0);
    assert!(!run_invocations(&executor)[0].contains(&"-p".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_pre_action_runs_inside_container() {
    let executor = docker_created();
    executor.respond_ok("docker inspect", HEALTHY);
    let config = TaskConfig {
        pre_action: Some("./scripts/seed.sh".to_string()),
        ..config()
    };
    let (mut orchestrator, _) = orchestrator(&executor, config);

    orchestrator.setup_container().await.unwrap();

    let expected: Vec<String> = ["docker", "exec", "-i", "t1", "bash", "-l", "-c", "./scripts/seed.sh"]
        .iter()
        .map(|arg| arg.to_string())
        .collect();
    assert!(executor.invocations().contains(&expected));
    let logcat = executor.position("adb logcat").unwrap();
    let pre_action = executor.position("seed.sh").unwrap();
    assert!(logcat < pre_action);
}

fn health_results(memory: &MemoryEmitter) -> Vec<bool> {
    memory
        .events()
        .into_iter()
        .filter_map(|event| match event {
            ProgressEvent::HealthWaitEnd { healthy, .. } => Some(healthy),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_connectivity_failure_triggers_single_recreate() {
    let executor = ScriptedExecutor::new();
    executor
        .respond_ok("docker ps -a", "")
        .respond_ok("docker ps -a", LISTED);
    executor.respond_ok("docker run", "abc123\n");
    executor.respond_ok("kvm-ok", KVM_OK);
    executor.respond_ok("docker inspect", HEALTHY);
    // One full round of connection attempts sees no device, the next succeeds.
    for _ in 0..6 {
        executor.respond_ok("adb devices", NO_DEVICES);
    }
    executor.respond_ok("adb devices", ATTACHED);
    let load = Arc::new(ScriptedLoad::idle());
    let (mut orchestrator, memory) = orchestrator_with_load(&executor, config(), load.clone());

    let handle = orchestrator.setup_container().await.unwrap();

    assert!(handle.health.is_healthy());
    assert_eq!(orchestrator.state(), OrchestratorState::Ready);
    assert_eq!(executor.count("docker run"), 2);
    assert_eq!(executor.count("adb devices"), 7);
    assert_eq!(load.samples(), 2);
    assert_eq!(health_results(&memory), vec![false, true]);
    assert_eq!(
        memory
            .kinds()
            .iter()
            .filter(|kind| **kind == "container.recreate")
            .count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_guest_never_connecting_is_infrastructure_failure() {
    let executor = ScriptedExecutor::new();
    executor
        .respond_ok("docker ps -a", "")
        .respond_ok("docker ps -a", LISTED);
    executor.respond_ok("docker run", "abc123\n");
    executor.respond_ok("kvm-ok", KVM_OK);
    executor.respond_ok("docker inspect", HEALTHY);
    executor.respond_ok("adb devices", NO_DEVICES);
    let load = Arc::new(ScriptedLoad::idle());
    let (mut orchestrator, memory) = orchestrator_with_load(&executor, config(), load.clone());

    let err = orchestrator.setup_container().await.unwrap_err();

    assert_eq!(err.exit_code(), EXIT_INFRASTRUCTURE_UNAVAILABLE);
    assert_eq!(executor.count("docker run"), 2);
    assert_eq!(load.samples(), 2);
    assert_eq!(health_results(&memory), vec![false, false]);
    assert!(!memory.kinds().contains(&"container.ready"));
}
