//! Training session driver.
//!
//! Wraps the customer-supplied callable set, normalizes its two return
//! shapes into single-call thunks, filters customer hyperparameters into
//! the engine's two settings groups, and drives the engine through one
//! training/evaluation run. Failures are logged and propagated; there is no
//! local recovery.

use serde_json::{json, Map, Value};

use crate::config::{HyperParameters, TrainingConfig};
use crate::engine::{ExperimentPlan, InputThunk, ServingThunk, TrainingEngine};
use crate::error::{ConductorError, Result};

/// Hyperparameter keys forwarded to the engine's run configuration.
pub const RUN_CONFIG_KEYS: &[&str] = &[
    "save_summary_steps",
    "save_checkpoints_secs",
    "save_checkpoints_steps",
    "keep_checkpoint_max",
    "keep_checkpoint_every_n_hours",
    "log_step_count_steps",
];

/// Hyperparameter keys forwarded to the experiment.
pub const EXPERIMENT_KEYS: &[&str] = &[
    "eval_metrics",
    "train_monitors",
    "eval_hooks",
    "local_eval_frequency",
    "eval_delay_secs",
    "continuous_eval_throttle_secs",
    "min_eval_frequency",
    "delay_workers_by_global_step",
    "train_steps_per_iteration",
];

const DEFAULT_MIN_EVAL_FREQUENCY: u64 = 1000;
const DEFAULT_SAVE_CHECKPOINTS_SECS: u64 = 300;

/// A customer callable may hand back the value itself or a nullary producer
/// of it. Resolved exactly once at the boundary.
pub enum Provided<T> {
    Ready(T),
    Producer(Box<dyn FnOnce() -> T + Send>),
}

impl<T> Provided<T> {
    pub fn resolve(self) -> T {
        match self {
            Provided::Ready(value) => value,
            Provided::Producer(produce) => produce(),
        }
    }
}

/// Engine run configuration assembled from the allow-listed customer keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSettings {
    /// Where the engine writes checkpoints during the run.
    pub model_dir: String,
    pub params: Map<String, Value>,
}

/// Experiment knobs assembled from the allow-listed customer keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExperimentSettings {
    pub params: Map<String, Value>,
}

type InputFn<I> = Box<dyn Fn(&str, &HyperParameters) -> Result<Provided<I>> + Send + Sync>;
type ServingFn<S> = Box<dyn Fn(&HyperParameters) -> Result<Provided<S>> + Send + Sync>;
type EstimatorFn<M> = Box<dyn Fn(&RunSettings, &HyperParameters) -> Result<M> + Send + Sync>;
type KerasModelFn<K> = Box<dyn Fn(&HyperParameters) -> Result<K> + Send + Sync>;

/// The customer-supplied callable set.
///
/// Exactly one of the model-construction capabilities must be present;
/// they are checked in the order `estimator_fn`, `keras_model_fn`,
/// `model_fn`.
pub struct CustomerScript<E: TrainingEngine> {
    pub train_input: InputFn<E::Input>,
    pub eval_input: InputFn<E::Input>,
    pub serving_input: ServingFn<E::Serving>,
    pub estimator_fn: Option<EstimatorFn<E::Estimator>>,
    pub keras_model_fn: Option<KerasModelFn<E::KerasModel>>,
    pub model_fn: Option<E::ModelFn>,
}

pub struct SessionDriver {
    config: TrainingConfig,
    customer_params: HyperParameters,
}

impl SessionDriver {
    pub fn new(config: &TrainingConfig) -> Self {
        let mut customer_params = config.hyperparameters.clone();
        customer_params.set_default("min_eval_frequency", json!(DEFAULT_MIN_EVAL_FREQUENCY));
        customer_params.set_default(
            "save_checkpoints_secs",
            json!(DEFAULT_SAVE_CHECKPOINTS_SECS),
        );

        Self {
            config: config.clone(),
            customer_params,
        }
    }

    pub fn run_settings(&self) -> RunSettings {
        let params = self.customer_params.filtered(RUN_CONFIG_KEYS);
        tracing::info!(params = ?params, "creating run settings");
        RunSettings {
            model_dir: self.config.checkpoint_path().to_string(),
            params,
        }
    }

    pub fn experiment_settings(&self) -> ExperimentSettings {
        let params = self.customer_params.filtered(EXPERIMENT_KEYS);
        tracing::info!(params = ?params, "creating experiment settings");
        ExperimentSettings { params }
    }

    /// Run training and evaluation to completion.
    pub async fn run<E: TrainingEngine>(
        &self,
        engine: &mut E,
        script: CustomerScript<E>,
    ) -> Result<()> {
        let mut script = script;
        let mut estimator = self.build_estimator(engine, &mut script)?;
        let plan = self.experiment_plan(script);

        if let Err(e) = engine.run_experiment(&mut estimator, plan).await {
            tracing::error!(error = %e, "uncaught exception during training");
            return Err(e);
        }
        Ok(())
    }

    /// Priority-ordered selection among the model-construction capabilities.
    fn build_estimator<E: TrainingEngine>(
        &self,
        engine: &mut E,
        script: &mut CustomerScript<E>,
    ) -> Result<E::Estimator> {
        let settings = self.run_settings();

        if let Some(estimator_fn) = &script.estimator_fn {
            tracing::info!("invoking estimator_fn");
            estimator_fn(&settings, &self.customer_params)
        } else if let Some(keras_model_fn) = &script.keras_model_fn {
            tracing::info!("invoking keras_model_fn");
            let model = keras_model_fn(&self.customer_params)?;
            engine.model_to_estimator(model, &settings)
        } else if let Some(model_fn) = script.model_fn.take() {
            tracing::info!("creating the estimator from model_fn");
            engine.estimator_from_model_fn(model_fn, &settings, &self.customer_params)
        } else {
            Err(ConductorError::MissingModelFunction)
        }
    }

    /// Normalize the input callables into thunks the engine can call as
    /// often as it likes; each call resolves the customer's value-or-producer
    /// shape once.
    fn experiment_plan<E: TrainingEngine>(
        &self,
        script: CustomerScript<E>,
    ) -> ExperimentPlan<E::Input, E::Serving> {
        let CustomerScript {
            train_input,
            eval_input,
            serving_input,
            ..
        } = script;

        let train: InputThunk<E::Input> = {
            let training_dir = self.config.training_dir.clone();
            let params = self.customer_params.clone();
            Box::new(move || Ok(train_input(&training_dir, &params)?.resolve()))
        };
        let eval: InputThunk<E::Input> = {
            let training_dir = self.config.training_dir.clone();
            let params = self.customer_params.clone();
            Box::new(move || Ok(eval_input(&training_dir, &params)?.resolve()))
        };
        let serving: ServingThunk<E::Serving> = {
            let params = self.customer_params.clone();
            Box::new(move || Ok(serving_input(&params)?.resolve()))
        };

        ExperimentPlan {
            train_input: train,
            eval_input: eval,
            serving_input: serving,
            train_steps: self.config.train_steps,
            eval_steps: self.config.eval_steps,
            settings: self.experiment_settings(),
        }
    }
}
