//! Job configuration: the immutable per-launch snapshot of customer
//! hyperparameters plus derived fields, and the S3 checkpoint settings the
//! training engine reads from the environment.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{ConductorError, Result};

/// Name of the channel holding the training data.
pub const TRAINING_CHANNEL: &str = "training";

pub const DEFAULT_TRAINING_DIR: &str = "/opt/ml/input/data/training";
pub const DEFAULT_MODEL_DIR: &str = "/opt/ml/model";
pub const DEFAULT_OUTPUT_DIR: &str = "/opt/ml/output";

const DEFAULT_TRAIN_STEPS: u64 = 1000;
const DEFAULT_EVAL_STEPS: u64 = 100;
const DEFAULT_S3_SAVE_TIMEOUT_MSEC: u64 = 60_000;

pub const S3_URL_SCHEME: &str = "s3://";

/// Customer-supplied hyperparameters, an arbitrary JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HyperParameters(Map<String, Value>);

impl HyperParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse hyperparameters from an inline JSON object.
    pub fn from_json(json: &str) -> Result<Self> {
        match serde_json::from_str(json)? {
            Value::Object(map) => Ok(Self(map)),
            other => Err(ConductorError::InvalidConfig(format!(
                "hyperparameters must be a JSON object, got: {other}"
            ))),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    /// Insert `value` only when `key` is not already set by the customer.
    pub fn set_default(&mut self, key: &str, value: Value) {
        self.0.entry(key.to_string()).or_insert(value);
    }

    /// Copy of the entries whose keys appear in `allow`. Unrecognized keys
    /// are silently dropped, never errored.
    pub fn filtered(&self, allow: &[&str]) -> Map<String, Value> {
        self.0
            .iter()
            .filter(|(k, _)| allow.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Step budget for a phase: key absent means the built-in default, an
/// explicit JSON `null` means unbounded.
fn step_budget(params: &HyperParameters, key: &str, default: u64) -> Option<u64> {
    match params.get(key) {
        None => Some(default),
        Some(Value::Null) => None,
        Some(value) => value.as_u64().or(Some(default)),
    }
}

/// Immutable snapshot combining customer hyperparameters with derived
/// fields. Created once per job launch and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    /// Correlation id for this launch, used in log output only.
    pub run_id: Uuid,
    pub hosts: Vec<String>,
    pub current_host: String,
    /// `None` means train until input is exhausted.
    pub train_steps: Option<u64>,
    pub eval_steps: Option<u64>,
    pub training_dir: String,
    pub model_dir: String,
    pub output_dir: String,
    pub heartbeat_interval: Duration,
    pub ps_bind_addr: String,
    pub hyperparameters: HyperParameters,
    checkpoint_override: Option<String>,
}

impl TrainingConfig {
    pub fn new(hosts: Vec<String>, current_host: String, hyperparameters: HyperParameters) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            hosts,
            current_host,
            train_steps: step_budget(&hyperparameters, "training_steps", DEFAULT_TRAIN_STEPS),
            eval_steps: step_budget(&hyperparameters, "evaluation_steps", DEFAULT_EVAL_STEPS),
            training_dir: DEFAULT_TRAINING_DIR.to_string(),
            model_dir: DEFAULT_MODEL_DIR.to_string(),
            output_dir: DEFAULT_OUTPUT_DIR.to_string(),
            heartbeat_interval: crate::liveness::DEFAULT_PROBE_INTERVAL,
            ps_bind_addr: format!("0.0.0.0:{}", crate::topology::PS_PORT),
            checkpoint_override: hyperparameters
                .get_str("checkpoint_path")
                .map(str::to_string),
            hyperparameters,
        }
    }

    pub fn with_training_dir(mut self, dir: impl Into<String>) -> Self {
        self.training_dir = dir.into();
        self
    }

    pub fn with_model_dir(mut self, dir: impl Into<String>) -> Self {
        self.model_dir = dir.into();
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<String>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_ps_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.ps_bind_addr = addr.into();
        self
    }

    /// Where checkpoints are written during training. Defaults to the model
    /// dir; the customer may point it elsewhere (including an `s3://` url)
    /// via the `checkpoint_path` hyperparameter.
    pub fn checkpoint_path(&self) -> &str {
        self.checkpoint_override.as_deref().unwrap_or(&self.model_dir)
    }

    /// The master must export the model only when checkpoints were written
    /// somewhere other than the final model location.
    pub fn export_required(&self) -> bool {
        self.checkpoint_path() != self.model_dir
    }

    pub fn is_distributed(&self) -> bool {
        self.hosts.len() > 1
    }
}

/// Host layout of the managed container environment, as found in the
/// resource-config file mounted into every container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub current_host: String,
    pub hosts: Vec<String>,
}

impl ResourceConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

pub fn is_s3_url(path: &str) -> bool {
    path.starts_with(S3_URL_SCHEME)
}

/// Split an `s3://bucket/key` url into bucket and key.
pub fn parse_s3_url(url: &str) -> Result<(String, String)> {
    let rest = url
        .strip_prefix(S3_URL_SCHEME)
        .ok_or_else(|| ConductorError::NotAnS3Url(url.to_string()))?;
    let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        return Err(ConductorError::NotAnS3Url(url.to_string()));
    }
    Ok((bucket.to_string(), key.to_string()))
}

/// Publish the S3 settings the engine's object-store filesystem reads from
/// the environment.
///
/// The engine's default S3 request timeout is too short for checkpoints of
/// larger sizes, so it is always raised (customer-overridable through the
/// `s3_checkpoint_save_timeout` hyperparameter). Region and HTTPS settings
/// are published only when checkpoints actually go to S3.
pub fn configure_s3_env(config: &TrainingConfig) {
    let timeout = config
        .hyperparameters
        .get_u64("s3_checkpoint_save_timeout")
        .unwrap_or(DEFAULT_S3_SAVE_TIMEOUT_MSEC);
    std::env::set_var("S3_REQUEST_TIMEOUT_MSEC", timeout.to_string());

    let checkpoint_path = config.checkpoint_path();
    if !is_s3_url(checkpoint_path) {
        return;
    }

    match parse_s3_url(checkpoint_path) {
        Ok((bucket, _)) => {
            if let Some(region) = config.hyperparameters.get_str("s3_region") {
                std::env::set_var("S3_REGION", region);
            }
            std::env::set_var("S3_USE_HTTPS", "1");
            tracing::info!(bucket = %bucket, "configured s3 filesystem for checkpoints");
        }
        Err(e) => {
            tracing::warn!(error = %e, "checkpoint path looks like s3 but did not parse");
        }
    }
}
