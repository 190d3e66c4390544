//! Process lifecycle controller.
//!
//! Sequences topology build, parameter-server start, training, export or
//! master-down wait, and termination. `execute` ends in an unconditional
//! hard process exit on every path: the background parameter server has no
//! join point, and cancelling its token is cooperative only, so process
//! death is the one stop mechanism that always works.

use std::path::Path;

use chrono::Utc;

use crate::config::{self, TrainingConfig};
use crate::engine::TrainingEngine;
use crate::error::Result;
use crate::liveness;
use crate::runtime;
use crate::session::{CustomerScript, SessionDriver};
use crate::topology;

/// Terminal state of a job on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOutcome {
    Succeeded,
    FailedTraining,
    FailedExport,
    TerminatedAfterMasterDown,
}

impl LifecycleOutcome {
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            LifecycleOutcome::FailedTraining | LifecycleOutcome::FailedExport
        )
    }

    /// Exit codes are not contractual; surrounding tooling reads the
    /// failure file, not the code.
    pub fn exit_code(self) -> i32 {
        if self.is_failure() {
            1
        } else {
            0
        }
    }
}

impl std::fmt::Display for LifecycleOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleOutcome::Succeeded => write!(f, "succeeded"),
            LifecycleOutcome::FailedTraining => write!(f, "failed_training"),
            LifecycleOutcome::FailedExport => write!(f, "failed_export"),
            LifecycleOutcome::TerminatedAfterMasterDown => {
                write!(f, "terminated_after_master_down")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    TopologyBuilt,
    PsStarted,
    Training,
    Exporting,
    AwaitingMasterDown,
    Terminated,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Init => "init",
            Phase::TopologyBuilt => "topology_built",
            Phase::PsStarted => "ps_started",
            Phase::Training => "training",
            Phase::Exporting => "exporting",
            Phase::AwaitingMasterDown => "awaiting_master_down",
            Phase::Terminated => "terminated",
        };
        write!(f, "{name}")
    }
}

pub struct LifecycleController<E> {
    config: TrainingConfig,
    engine: E,
}

impl<E: TrainingEngine> LifecycleController<E> {
    pub fn new(config: TrainingConfig, engine: E) -> Self {
        Self { config, engine }
    }

    /// Drive one job attempt to its terminal state.
    ///
    /// Errors are returned only for failures before training could start
    /// (bad topology, unpublishable descriptor); everything after that maps
    /// onto a [`LifecycleOutcome`].
    pub async fn run(&mut self, script: CustomerScript<E>) -> Result<LifecycleOutcome> {
        let run_id = self.config.run_id;
        enter(Phase::Init, run_id);

        let (assignment, descriptor) =
            topology::build(&self.config.hosts, &self.config.current_host)?;
        enter(Phase::TopologyBuilt, run_id);
        tracing::info!(
            task_type = %assignment.task_type,
            task_index = assignment.task_index,
            hosts = self.config.hosts.len(),
            "role assigned"
        );

        config::configure_s3_env(&self.config);

        // Parameter server first, then descriptor publication, then
        // training. The engine must find both in place.
        let job = runtime::start(assignment, &descriptor, &self.config)?;
        if job.assignment.runs_parameter_server() {
            enter(Phase::PsStarted, run_id);
        }
        self.engine.apply_topology(&descriptor)?;

        enter(Phase::Training, run_id);
        let driver = SessionDriver::new(&self.config);
        let outcome = match driver.run(&mut self.engine, script).await {
            Err(e) => {
                self.record_failure(&e.to_string());
                LifecycleOutcome::FailedTraining
            }
            Ok(()) => {
                if assignment.is_master() {
                    if self.config.export_required() {
                        enter(Phase::Exporting, run_id);
                        let checkpoint = self.config.checkpoint_path().to_string();
                        match self
                            .engine
                            .export_saved_model(&checkpoint, &self.config.model_dir)
                            .await
                        {
                            Ok(()) => LifecycleOutcome::Succeeded,
                            Err(e) => {
                                self.record_failure(&e.to_string());
                                LifecycleOutcome::FailedExport
                            }
                        }
                    } else {
                        LifecycleOutcome::Succeeded
                    }
                } else {
                    enter(Phase::AwaitingMasterDown, run_id);
                    liveness::wait_until_unreachable(
                        descriptor.master_address(),
                        self.config.heartbeat_interval,
                    )
                    .await;
                    LifecycleOutcome::TerminatedAfterMasterDown
                }
            }
        };

        job.shutdown_background();
        enter(Phase::Terminated, run_id);
        tracing::info!(run_id = %run_id, outcome = %outcome, "job reached terminal state");
        Ok(outcome)
    }

    /// Run the job and then terminate the process, unconditionally and
    /// exactly once, whatever happened before.
    pub async fn execute(mut self, script: CustomerScript<E>) -> ! {
        let code = match self.run(script).await {
            Ok(outcome) => outcome.exit_code(),
            Err(e) => {
                tracing::error!(error = %e, "job failed before training could start");
                self.record_failure(&e.to_string());
                1
            }
        };
        // The parameter-server task cannot be joined; killing the process
        // is the intended way to stop it.
        std::process::exit(code);
    }

    fn record_failure(&self, message: &str) {
        write_failure_file(&self.config.output_dir, message);
    }
}

/// Leave the failure reason where the surrounding tooling looks for it.
/// Best effort: a failing job must still reach its hard exit.
fn write_failure_file(output_dir: &str, message: &str) {
    let dir = Path::new(output_dir);
    if let Err(e) = std::fs::create_dir_all(dir) {
        tracing::warn!(output_dir, error = %e, "could not create output dir for failure file");
        return;
    }
    let body = format!("{}\n{}\n", Utc::now().to_rfc3339(), message);
    if let Err(e) = std::fs::write(dir.join("failure"), body) {
        tracing::warn!(output_dir, error = %e, "could not write failure file");
    }
}

fn enter(phase: Phase, run_id: uuid::Uuid) {
    tracing::info!(run_id = %run_id, phase = %phase, "entering phase");
}
