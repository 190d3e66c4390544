use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use conductor_lite::config::{
    HyperParameters, ResourceConfig, TrainingConfig, DEFAULT_MODEL_DIR, DEFAULT_OUTPUT_DIR,
    DEFAULT_TRAINING_DIR,
};
use conductor_lite::controller::LifecycleController;
use conductor_lite::engine::{CommandEngine, CommandEstimator};
use conductor_lite::session::{CustomerScript, Provided};
use conductor_lite::{topology, ConductorError, Result};

#[derive(Parser, Debug)]
#[command(name = "conductor-lite")]
#[command(version)]
#[command(about = "Launches distributed training jobs inside managed containers")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the training job on this node
    Train(TrainArgs),

    /// Print the cluster topology this node would compute
    Topology(ClusterArgs),
}

#[derive(Parser, Debug)]
struct ClusterArgs {
    /// Ordered comma-separated host list; the first host is the master
    #[arg(long, value_delimiter = ',')]
    hosts: Vec<String>,

    /// Name of this node within the host list
    #[arg(long)]
    current_host: Option<String>,

    /// Resource-config JSON file ({"current_host": ..., "hosts": [...]}).
    /// Takes precedence over --hosts/--current-host.
    #[arg(long)]
    resource_config: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct TrainArgs {
    #[command(flatten)]
    cluster: ClusterArgs,

    /// Customer hyperparameters as an inline JSON object
    #[arg(long, default_value = "{}")]
    hyperparameters: String,

    /// Directory holding the training channel data
    #[arg(long, default_value = DEFAULT_TRAINING_DIR)]
    training_dir: String,

    /// Directory (or s3 url via the checkpoint_path hyperparameter) the
    /// final model is written to
    #[arg(long, default_value = DEFAULT_MODEL_DIR)]
    model_dir: String,

    /// Directory for job output, including the failure file
    #[arg(long, default_value = DEFAULT_OUTPUT_DIR)]
    output_dir: String,

    /// Shell command that runs the customer training loop
    #[arg(long)]
    train_command: String,

    /// Optional shell command that runs evaluation after training
    #[arg(long)]
    eval_command: Option<String>,
}

impl ClusterArgs {
    fn resolve(&self) -> Result<(Vec<String>, String)> {
        if let Some(path) = &self.resource_config {
            let rc = ResourceConfig::load(path)?;
            return Ok((rc.hosts, rc.current_host));
        }
        let current_host = self.current_host.clone().ok_or_else(|| {
            ConductorError::InvalidConfig(
                "either --resource-config or --current-host is required".to_string(),
            )
        })?;
        if self.hosts.is_empty() {
            return Err(ConductorError::InvalidConfig(
                "either --resource-config or --hosts is required".to_string(),
            ));
        }
        Ok((self.hosts.clone(), current_host))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Train(train) => run_train(train).await,
        Commands::Topology(cluster) => print_topology(&cluster),
    }
}

async fn run_train(args: TrainArgs) -> Result<()> {
    let (hosts, current_host) = args.cluster.resolve()?;
    let hyperparameters = HyperParameters::from_json(&args.hyperparameters)?;

    let config = TrainingConfig::new(hosts, current_host, hyperparameters)
        .with_training_dir(args.training_dir)
        .with_model_dir(args.model_dir)
        .with_output_dir(args.output_dir);

    let estimator = CommandEstimator {
        train_command: args.train_command,
        eval_command: args.eval_command,
    };
    let script: CustomerScript<CommandEngine> = CustomerScript {
        train_input: Box::new(|_, _| Ok(Provided::Ready(()))),
        eval_input: Box::new(|_, _| Ok(Provided::Ready(()))),
        serving_input: Box::new(|_| Ok(Provided::Ready(()))),
        estimator_fn: Some(Box::new(move |_, _| Ok(estimator.clone()))),
        keras_model_fn: None,
        model_fn: None,
    };

    let controller = LifecycleController::new(config, CommandEngine::new());
    controller.execute(script).await
}

fn print_topology(cluster: &ClusterArgs) -> Result<()> {
    let (hosts, current_host) = cluster.resolve()?;
    let (assignment, descriptor) = topology::build(&hosts, &current_host)?;
    println!("role: {}", assignment.task_type);
    println!("{}", serde_json::to_string_pretty(&descriptor)?);
    Ok(())
}
