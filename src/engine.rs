//! Seam to the opaque distributed training engine.
//!
//! The core never looks inside training: it hands the engine a topology
//! descriptor, an estimator, and normalized input thunks, and waits for the
//! run to finish. [`CommandEngine`] is the engine shipped with the binary:
//! it delegates each phase to a customer-configured shell command.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

use crate::config::{is_s3_url, HyperParameters};
use crate::error::{ConductorError, Result};
use crate::runtime::TF_CONFIG_ENV;
use crate::session::{ExperimentSettings, RunSettings};
use crate::topology::TopologyDescriptor;

/// Normalized input producer: one call yields one input object, whether the
/// customer returned it ready-made or behind a nullary producer.
pub type InputThunk<I> = Box<dyn FnMut() -> Result<I> + Send>;
pub type ServingThunk<S> = Box<dyn FnMut() -> Result<S> + Send>;

/// Everything one training/evaluation run needs, assembled by the session
/// driver.
pub struct ExperimentPlan<I, S> {
    pub train_input: InputThunk<I>,
    pub eval_input: InputThunk<I>,
    pub serving_input: ServingThunk<S>,
    /// `None` means train until input is exhausted.
    pub train_steps: Option<u64>,
    pub eval_steps: Option<u64>,
    pub settings: ExperimentSettings,
}

/// The opaque training engine.
///
/// Associated types are the engine's own currency (input batches, serving
/// receivers, models); the orchestration layer only moves them around.
#[async_trait]
pub trait TrainingEngine {
    type Input: Send + 'static;
    type Serving: Send + 'static;
    type KerasModel: Send;
    type ModelFn: Send;
    type Estimator: Send;

    /// Explicit counterpart to the `TF_CONFIG` environment channel.
    fn apply_topology(&mut self, descriptor: &TopologyDescriptor) -> Result<()>;

    /// Wrap a customer-built Keras model into an estimator.
    fn model_to_estimator(
        &mut self,
        model: Self::KerasModel,
        settings: &RunSettings,
    ) -> Result<Self::Estimator>;

    /// Build a default estimator around a bare model function.
    fn estimator_from_model_fn(
        &mut self,
        model_fn: Self::ModelFn,
        settings: &RunSettings,
        params: &HyperParameters,
    ) -> Result<Self::Estimator>;

    /// Run training then evaluation. Any error is fatal to the job.
    async fn run_experiment(
        &mut self,
        estimator: &mut Self::Estimator,
        plan: ExperimentPlan<Self::Input, Self::Serving>,
    ) -> Result<()>;

    /// Export the trained model from the checkpoint location to the final
    /// model location. Master only, and only when the two differ.
    async fn export_saved_model(&mut self, checkpoint_path: &str, model_dir: &str) -> Result<()>;
}

/// Engine that runs the customer's training loop as external commands.
///
/// The topology reaches the child through the `TF_CONFIG` environment
/// variable; step budgets through `TRAINING_STEPS` / `EVALUATION_STEPS`.
#[derive(Debug, Default)]
pub struct CommandEngine {
    tf_config: Option<String>,
}

/// Estimator of the command engine: the commands to run per phase.
#[derive(Debug, Clone)]
pub struct CommandEstimator {
    pub train_command: String,
    pub eval_command: Option<String>,
}

impl CommandEngine {
    pub fn new() -> Self {
        Self::default()
    }

    async fn run_command(&self, label: &str, command: &str, steps: Option<(&str, u64)>) -> Result<()> {
        tracing::info!(label, command, "launching engine command");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        if let Some(tf_config) = &self.tf_config {
            cmd.env(TF_CONFIG_ENV, tf_config);
        }
        if let Some((key, value)) = steps {
            cmd.env(key, value.to_string());
        }

        let status = cmd.status().await?;
        if status.success() {
            Ok(())
        } else {
            Err(ConductorError::Training(format!(
                "{label} command exited with {status}"
            )))
        }
    }
}

#[async_trait]
impl TrainingEngine for CommandEngine {
    type Input = ();
    type Serving = ();
    type KerasModel = ();
    type ModelFn = ();
    type Estimator = CommandEstimator;

    fn apply_topology(&mut self, descriptor: &TopologyDescriptor) -> Result<()> {
        self.tf_config = Some(descriptor.to_json()?);
        Ok(())
    }

    fn model_to_estimator(
        &mut self,
        _model: Self::KerasModel,
        _settings: &RunSettings,
    ) -> Result<Self::Estimator> {
        Err(ConductorError::InvalidConfig(
            "the command engine builds estimators from commands; supply estimator_fn".to_string(),
        ))
    }

    fn estimator_from_model_fn(
        &mut self,
        _model_fn: Self::ModelFn,
        _settings: &RunSettings,
        _params: &HyperParameters,
    ) -> Result<Self::Estimator> {
        Err(ConductorError::InvalidConfig(
            "the command engine builds estimators from commands; supply estimator_fn".to_string(),
        ))
    }

    async fn run_experiment(
        &mut self,
        estimator: &mut Self::Estimator,
        mut plan: ExperimentPlan<Self::Input, Self::Serving>,
    ) -> Result<()> {
        // The external trainer produces its own inputs; the thunks are still
        // resolved so a misconfigured customer callable fails here, not
        // silently never.
        (plan.train_input)()?;
        (plan.eval_input)()?;
        (plan.serving_input)()?;

        self.run_command(
            "train",
            &estimator.train_command,
            plan.train_steps.map(|s| ("TRAINING_STEPS", s)),
        )
        .await?;

        if let Some(eval_command) = estimator.eval_command.clone() {
            self.run_command(
                "evaluation",
                &eval_command,
                plan.eval_steps.map(|s| ("EVALUATION_STEPS", s)),
            )
            .await?;
        }

        Ok(())
    }

    async fn export_saved_model(&mut self, checkpoint_path: &str, model_dir: &str) -> Result<()> {
        if is_s3_url(checkpoint_path) {
            return Err(ConductorError::Export(format!(
                "exporting from {checkpoint_path} requires the engine's object-store support"
            )));
        }
        copy_tree(Path::new(checkpoint_path), Path::new(model_dir)).map_err(|e| {
            ConductorError::Export(format!(
                "copying {checkpoint_path} to {model_dir} failed: {e}"
            ))
        })
    }
}

fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
