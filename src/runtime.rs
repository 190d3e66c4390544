//! Role runtime: turns a role assignment into running work.
//!
//! Start order is load-bearing: the parameter server is spawned first, the
//! topology is published second, and only then may the engine start
//! training. Every node follows the same order.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::TrainingConfig;
use crate::error::Result;
use crate::parameter_server;
use crate::topology::{RoleAssignment, TopologyDescriptor};

/// Environment variable the training engine reads the serialized topology
/// descriptor from. The engine mandates this channel; [`crate::engine::TrainingEngine::apply_topology`]
/// is the explicit counterpart.
pub const TF_CONFIG_ENV: &str = "TF_CONFIG";

/// Handle to the work started for this node's role.
pub struct RunningJob {
    pub assignment: RoleAssignment,
    ps_task: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
    tf_config: String,
}

impl RunningJob {
    /// The serialized descriptor as published to the engine.
    pub fn published_config(&self) -> &str {
        &self.tf_config
    }

    pub fn is_master(&self) -> bool {
        self.assignment.is_master()
    }

    pub fn parameter_server_running(&self) -> bool {
        self.ps_task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Ask the background parameter server to stop. Cooperative only; the
    /// controller's hard process exit remains the guarantee.
    pub fn shutdown_background(&self) {
        self.shutdown.cancel();
    }
}

/// Start this node's role: spawn the parameter server when the job is
/// distributed, then publish the topology for the engine.
///
/// The parameter server is fire-and-forget: nothing joins it and the main
/// flow never blocks on it.
pub fn start(
    assignment: RoleAssignment,
    descriptor: &TopologyDescriptor,
    config: &TrainingConfig,
) -> Result<RunningJob> {
    let shutdown = CancellationToken::new();

    let ps_task = assignment.ps_task_index.map(|task_index| {
        tracing::info!(task_index, "starting parameter server task");
        tokio::spawn(parameter_server::serve(
            config.ps_bind_addr.clone(),
            task_index,
            shutdown.clone(),
        ))
    });

    let tf_config = publish_topology(descriptor)?;

    Ok(RunningJob {
        assignment,
        ps_task,
        shutdown,
        tf_config,
    })
}

/// Serialize the descriptor into the process environment for the engine.
fn publish_topology(descriptor: &TopologyDescriptor) -> Result<String> {
    let json = descriptor.to_json()?;
    std::env::set_var(TF_CONFIG_ENV, &json);

    tracing::info!("----------------------TF_CONFIG--------------------------");
    tracing::info!("{json}");
    tracing::info!("---------------------------------------------------------");

    Ok(json)
}
