use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::net::TcpListener;

use conductor_lite::config::{HyperParameters, TrainingConfig};
use conductor_lite::controller::{LifecycleController, LifecycleOutcome};
use conductor_lite::engine::{ExperimentPlan, TrainingEngine};
use conductor_lite::session::{CustomerScript, Provided, RunSettings};
use conductor_lite::topology::TopologyDescriptor;
use conductor_lite::{ConductorError, Result};

/// Engine that records every call and fails on demand.
#[derive(Clone, Default)]
struct RecordingEngine {
    calls: Arc<Mutex<Vec<String>>>,
    fail_training: bool,
    fail_export: bool,
}

impl RecordingEngine {
    fn recorded(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TrainingEngine for RecordingEngine {
    type Input = ();
    type Serving = ();
    type KerasModel = ();
    type ModelFn = ();
    type Estimator = ();

    fn apply_topology(&mut self, descriptor: &TopologyDescriptor) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("apply_topology:{}", descriptor.task.task_type));
        Ok(())
    }

    fn model_to_estimator(&mut self, _model: (), _settings: &RunSettings) -> Result<()> {
        Ok(())
    }

    fn estimator_from_model_fn(
        &mut self,
        _model_fn: (),
        _settings: &RunSettings,
        _params: &HyperParameters,
    ) -> Result<()> {
        Ok(())
    }

    async fn run_experiment(
        &mut self,
        _estimator: &mut (),
        _plan: ExperimentPlan<(), ()>,
    ) -> Result<()> {
        self.calls.lock().unwrap().push("run_experiment".to_string());
        if self.fail_training {
            Err(ConductorError::Training("injected training failure".to_string()))
        } else {
            Ok(())
        }
    }

    async fn export_saved_model(&mut self, checkpoint: &str, model_dir: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("export:{checkpoint}->{model_dir}"));
        if self.fail_export {
            Err(ConductorError::Export("injected export failure".to_string()))
        } else {
            Ok(())
        }
    }
}

fn script() -> CustomerScript<RecordingEngine> {
    CustomerScript {
        train_input: Box::new(|_, _| Ok(Provided::Ready(()))),
        eval_input: Box::new(|_, _| Ok(Provided::Ready(()))),
        serving_input: Box::new(|_| Ok(Provided::Ready(()))),
        estimator_fn: Some(Box::new(|_, _| Ok(()))),
        keras_model_fn: None,
        model_fn: None,
    }
}

fn test_config(hosts: &[&str], current_host: &str, params: serde_json::Value) -> TrainingConfig {
    let hp = HyperParameters::from_json(&params.to_string()).unwrap();
    TrainingConfig::new(
        hosts.iter().map(|s| s.to_string()).collect(),
        current_host.to_string(),
        hp,
    )
    .with_heartbeat_interval(Duration::from_millis(25))
    // port 0 so simulated nodes in one process never collide
    .with_ps_bind_addr("127.0.0.1:0")
}

#[tokio::test]
async fn master_succeeds_without_export_when_checkpoint_is_model_dir() {
    let model_dir = tempfile::tempdir().unwrap();
    let config = test_config(&["algo-1"], "algo-1", json!({}))
        .with_model_dir(model_dir.path().to_str().unwrap());

    let engine = RecordingEngine::default();
    let calls = engine.clone();
    let mut controller = LifecycleController::new(config, engine);

    let outcome = controller.run(script()).await.unwrap();
    assert_eq!(outcome, LifecycleOutcome::Succeeded);

    let recorded = calls.recorded();
    assert_eq!(recorded[0], "apply_topology:master");
    assert_eq!(recorded[1], "run_experiment");
    assert!(!recorded.iter().any(|c| c.starts_with("export")));
}

#[tokio::test]
async fn master_exports_when_checkpoint_location_differs() {
    let model_dir = tempfile::tempdir().unwrap();
    let checkpoint_dir = tempfile::tempdir().unwrap();
    let checkpoint = checkpoint_dir.path().to_str().unwrap();

    let config = test_config(&["algo-1"], "algo-1", json!({ "checkpoint_path": checkpoint }))
        .with_model_dir(model_dir.path().to_str().unwrap());

    let engine = RecordingEngine::default();
    let calls = engine.clone();
    let mut controller = LifecycleController::new(config, engine);

    let outcome = controller.run(script()).await.unwrap();
    assert_eq!(outcome, LifecycleOutcome::Succeeded);

    let expected = format!(
        "export:{checkpoint}->{}",
        model_dir.path().to_str().unwrap()
    );
    assert!(calls.recorded().contains(&expected));
}

#[tokio::test]
async fn training_failure_bypasses_export_and_writes_failure_file() {
    let output_dir = tempfile::tempdir().unwrap();
    let config = test_config(
        &["algo-1"],
        "algo-1",
        json!({ "checkpoint_path": "/somewhere/else" }),
    )
    .with_output_dir(output_dir.path().to_str().unwrap());

    let engine = RecordingEngine {
        fail_training: true,
        ..Default::default()
    };
    let calls = engine.clone();
    let mut controller = LifecycleController::new(config, engine);

    let outcome = controller.run(script()).await.unwrap();
    assert_eq!(outcome, LifecycleOutcome::FailedTraining);
    assert!(!calls.recorded().iter().any(|c| c.starts_with("export")));

    let failure = std::fs::read_to_string(output_dir.path().join("failure")).unwrap();
    assert!(failure.contains("injected training failure"));
}

#[tokio::test]
async fn export_failure_is_fatal_despite_training_success() {
    let output_dir = tempfile::tempdir().unwrap();
    let config = test_config(
        &["algo-1"],
        "algo-1",
        json!({ "checkpoint_path": "/somewhere/else" }),
    )
    .with_output_dir(output_dir.path().to_str().unwrap());

    let engine = RecordingEngine {
        fail_export: true,
        ..Default::default()
    };
    let mut controller = LifecycleController::new(config, engine);

    let outcome = controller.run(script()).await.unwrap();
    assert_eq!(outcome, LifecycleOutcome::FailedExport);
    assert!(output_dir.path().join("failure").exists());
}

#[tokio::test]
async fn unknown_current_host_fails_before_training() {
    let config = test_config(&["algo-1", "algo-2"], "algo-9", json!({}));
    let engine = RecordingEngine::default();
    let calls = engine.clone();
    let mut controller = LifecycleController::new(config, engine);

    let err = controller.run(script()).await.unwrap_err();
    assert!(matches!(err, ConductorError::HostNotInCluster { .. }));
    assert!(calls.recorded().is_empty());
}

/// The end-to-end termination property: the master finishes while the
/// workers are still parked in their master-down wait, and each worker
/// detects it independently through the heartbeat port, with no signaling
/// between nodes.
#[tokio::test]
async fn workers_terminate_after_master_goes_down() {
    // Stand-in for the master's engine port. The workers' probe target is
    // derived from the host list, so the master must be "127.0.0.1".
    let master = TcpListener::bind("127.0.0.1:2222")
        .await
        .expect("heartbeat port 2222 must be free to run this test");

    let hosts = ["127.0.0.1", "algo-2", "algo-3"];
    let mut workers = Vec::new();
    for current in &hosts[1..] {
        let config = test_config(&hosts, current, json!({}));
        let engine = RecordingEngine::default();
        let mut controller = LifecycleController::new(config, engine);
        workers.push(tokio::spawn(async move {
            controller.run(script()).await.unwrap()
        }));
    }

    // Give both workers time to finish training and enter the wait.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(workers.iter().all(|w| !w.is_finished()));

    // Master completes; its port stops answering.
    drop(master);

    for worker in workers {
        let outcome = tokio::time::timeout(Duration::from_secs(2), worker)
            .await
            .expect("worker should detect the master going down")
            .unwrap();
        assert_eq!(outcome, LifecycleOutcome::TerminatedAfterMasterDown);
    }
}
