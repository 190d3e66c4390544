pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod liveness;
pub mod parameter_server;
pub mod runtime;
pub mod session;
pub mod topology;

pub use error::{ConductorError, Result};
