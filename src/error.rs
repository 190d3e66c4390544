use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConductorError {
    #[error("current host {current_host:?} is not in the cluster host list {hosts:?}")]
    HostNotInCluster {
        current_host: String,
        hosts: Vec<String>,
    },

    #[error(
        "customer script supplies no model function \
         (expected one of estimator_fn, keras_model_fn, model_fn)"
    )]
    MissingModelFunction,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("training failed: {0}")]
    Training(String),

    #[error("model export failed: {0}")]
    Export(String),

    #[error("not an s3 url: {0}")]
    NotAnS3Url(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConductorError>;
