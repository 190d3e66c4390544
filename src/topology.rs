//! Cluster topology derivation.
//!
//! Every node computes the topology locally from the same ordered host list;
//! nothing is broadcast. `build` must therefore stay pure and deterministic:
//! identical inputs produce identical descriptors on every node.

use serde::Serialize;

use crate::error::{ConductorError, Result};

/// Port the master (and workers) listen on. Also the heartbeat probe target.
pub const MASTER_PORT: u16 = 2222;

/// Port every parameter server listens on.
pub const PS_PORT: u16 = 2223;

/// Primary task type of a node. The parameter server is not a primary task:
/// on multi-host jobs every node additionally runs one, regardless of type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Master,
    Worker,
    Ps,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskType::Master => write!(f, "master"),
            TaskType::Worker => write!(f, "worker"),
            TaskType::Ps => write!(f, "ps"),
        }
    }
}

/// The current node's position in the cluster.
///
/// `task_index` is the index within the node's own role list (master list or
/// worker list), never within the parameter-server list. `ps_task_index` is
/// the node's index in the full host list and is present exactly when the
/// node also runs a parameter server (cluster size > 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleAssignment {
    pub task_type: TaskType,
    pub task_index: usize,
    pub ps_task_index: Option<usize>,
}

impl RoleAssignment {
    pub fn is_master(&self) -> bool {
        self.task_type == TaskType::Master
    }

    pub fn runs_parameter_server(&self) -> bool {
        self.ps_task_index.is_some()
    }
}

/// Host lists per role, each entry in `host:port` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterSpec {
    pub master: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub worker: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ps: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSpec {
    pub index: usize,
    #[serde(rename = "type")]
    pub task_type: TaskType,
}

/// The complete topology descriptor consumed by the training engine.
///
/// Serializes to the engine's JSON contract: `worker` is omitted when empty
/// and `ps` is omitted on single-host jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopologyDescriptor {
    pub cluster: ClusterSpec,
    pub task: TaskSpec,
    pub environment: String,
}

impl TopologyDescriptor {
    /// The master's `host:port` address, which doubles as the heartbeat
    /// probe target.
    pub fn master_address(&self) -> &str {
        &self.cluster.master[0]
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn with_port(hosts: &[String], port: u16) -> Vec<String> {
    hosts.iter().map(|h| format!("{h}:{port}")).collect()
}

/// Derive the current node's role and the cluster topology from the ordered
/// host list. The first host is always the master; the rest are workers.
/// On multi-host jobs every host additionally appears in the `ps` list.
///
/// Fails when `current_host` is not part of `hosts`.
pub fn build(hosts: &[String], current_host: &str) -> Result<(RoleAssignment, TopologyDescriptor)> {
    let Some(master) = hosts.first() else {
        return Err(ConductorError::HostNotInCluster {
            current_host: current_host.to_string(),
            hosts: hosts.to_vec(),
        });
    };
    let workers = &hosts[1..];
    let distributed = hosts.len() > 1;

    let (task_type, task_index) = if current_host == master {
        (TaskType::Master, 0)
    } else if let Some(index) = workers.iter().position(|h| h == current_host) {
        (TaskType::Worker, index)
    } else {
        return Err(ConductorError::HostNotInCluster {
            current_host: current_host.to_string(),
            hosts: hosts.to_vec(),
        });
    };

    let assignment = RoleAssignment {
        task_type,
        task_index,
        // position in the full host list; guaranteed present after the role
        // check above
        ps_task_index: distributed
            .then(|| hosts.iter().position(|h| h == current_host))
            .flatten(),
    };

    let descriptor = TopologyDescriptor {
        cluster: ClusterSpec {
            master: with_port(&hosts[..1], MASTER_PORT),
            worker: with_port(workers, MASTER_PORT),
            ps: distributed.then(|| with_port(hosts, PS_PORT)),
        },
        task: TaskSpec {
            index: task_index,
            task_type,
        },
        environment: "cloud".to_string(),
    };

    Ok((assignment, descriptor))
}
