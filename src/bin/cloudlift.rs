//! cloudlift: deploy, revert and operate ECS services
//!
//! ## Configuration
//! - `cloudlift.yaml` in the working directory, `--config`, or `CLOUDLIFT_CONFIG`
//! - `CLOUDLIFT__*` environment overrides, `CLOUDLIFT_DEPLOYMENT_CONCURRENCY`
//! - `CLOUDLIFT_LOG`: tracing filter (default: info)

use std::collections::BTreeMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use aws_config::SdkConfig;
use clap::{Args, Parser, Subcommand};
use tracing::info;

use cloudlift::collaborators::{
    repository_name, resolve_services, CloudFormationOutputs, EcrImageRegistry, ImageRegistry,
    ParameterStoreConfigSource, SecretsCache, SecretsManagerStore, ServiceTarget,
    SsmParameterStore, StackOutputs,
};
use cloudlift::config::Config;
use cloudlift::console;
use cloudlift::deployment::{
    Deployer, DeploymentAction, DeploymentCoordinator, NewVersion, PollSettings, RunTaskAction,
};
use cloudlift::ecs::{AwsEcsGateway, EcsGateway};
use cloudlift::error::{DeployError, Result};
use cloudlift::utils::bootstrap::{init_tracing, load_aws_config};
use cloudlift::utils::metrics::{CloudWatchMetrics, MetricsSink, NoopMetrics};
use cloudlift::utils::retry::RetryPolicy;

#[derive(Debug, Parser)]
#[command(name = "cloudlift", about = "Deploy and operate ECS services")]
struct Cli {
    /// Configuration file (YAML).
    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(short = 'e', long, global = true)]
    environment: Option<String>,

    #[arg(short = 'a', long, global = true)]
    application: Option<String>,

    /// Services rolled out at once.
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Roll out a new image version to every service.
    Deploy(DeployArgs),
    /// Roll every service back to an earlier task definition.
    Revert(RevertArgs),
    /// Run one-off tasks from a service's current task definition.
    RunTask(RunTaskArgs),
    /// Change a service's desired count.
    Scale(ScaleArgs),
}

#[derive(Debug, Args)]
struct DeployArgs {
    /// Image tag to deploy.
    #[arg(long)]
    version: String,

    /// Tag recorded on the new task definitions for later reverts.
    #[arg(long = "deployment-id")]
    deployment_id: Option<String>,

    /// Per-service timeout in seconds.
    #[arg(long)]
    timeout: Option<u64>,
}

#[derive(Debug, Args)]
struct RevertArgs {
    #[arg(long = "deployment-id", conflicts_with = "previous", required_unless_present = "previous")]
    deployment_id: Option<String>,

    /// Follow each service's previous task definition tag one hop back.
    #[arg(long)]
    previous: bool,

    #[arg(long)]
    timeout: Option<u64>,
}

#[derive(Debug, Args)]
struct RunTaskArgs {
    /// Logical service name.
    #[arg(long)]
    service: String,

    /// Command for the essential container.
    #[arg(long)]
    command: Option<String>,

    #[arg(long, default_value_t = 1)]
    count: i32,
}

#[derive(Debug, Args)]
struct ScaleArgs {
    #[arg(long)]
    service: String,

    #[arg(long)]
    count: i32,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            console::log_err(&e.to_string());
            let mut source = std::error::Error::source(&e);
            while let Some(cause) = source {
                console::log_intent_err(&cause.to_string());
                source = cause.source();
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(environment) = cli.environment {
        config.environment = environment;
    }
    if let Some(application) = cli.application {
        config.application = application;
    }
    if let Some(concurrency) = cli.concurrency {
        config.deployment.concurrency = concurrency;
    }
    config.validate()?;
    if config.environment.is_empty() || config.application.is_empty() {
        return Err(DeployError::Config(
            "environment and application are required".to_string(),
        ));
    }

    let sdk_config = load_aws_config(config.region.as_deref(), config.endpoint_url.as_deref()).await;
    let retry = RetryPolicy::from(&config.retry);
    let gateway: Arc<dyn EcsGateway> = Arc::new(AwsEcsGateway::new(&sdk_config, retry.clone()).await?);

    let outputs = CloudFormationOutputs::new(&sdk_config, retry.clone())
        .outputs(&config.stack_name())
        .await?;
    let services = resolve_services(&config.services, &outputs)?;
    info!(
        environment = %config.environment,
        application = %config.application,
        services = services.len(),
        "Resolved services"
    );

    match cli.command {
        Commands::Deploy(args) => {
            let image_uri = EcrImageRegistry::new(&sdk_config, retry.clone())
                .ensure_image_in_ecr(&repository_name(&config.application), &args.version)
                .await?;
            let mut version = NewVersion::tag(&args.version).with_image_uri(image_uri);
            if let Some(id) = args.deployment_id {
                version = version.with_deployment_identifier(id);
            }
            coordinator(&config, &sdk_config, gateway, retry, args.timeout)
                .deploy_all(&services, version)
                .await?;
        }
        Commands::Revert(args) => {
            let coordinator = coordinator(&config, &sdk_config, gateway, retry, args.timeout);
            match args.deployment_id {
                Some(id) => coordinator.revert_all(&services, &id).await?,
                None => coordinator.revert_all_to_previous(&services).await?,
            };
        }
        Commands::RunTask(args) => {
            let target = lookup(&services, &args.service)?;
            let action =
                DeploymentAction::new(gateway.clone(), &config.cluster_name(), &target.ecs_service_name)
                    .await?;
            let mut task_definition = action.get_current_task_definition().await?;
            if let Some(command) = args.command {
                let essential = task_definition.essential_container()?.to_string();
                task_definition.set_commands(&BTreeMap::from([(essential, command)]))?;
            }
            let started = RunTaskAction::new(gateway, config.cluster_name())
                .run(&task_definition, args.count, Some("cloudlift"))
                .await?;
            for arn in started {
                console::log_intent(&arn);
            }
        }
        Commands::Scale(args) => {
            let target = lookup(&services, &args.service)?;
            let mut action =
                DeploymentAction::new(gateway, &config.cluster_name(), &target.ecs_service_name).await?;
            action.scale(args.count).await?;
            console::log_bold(&format!("{} scaled to {}", target.ecs_service_name, args.count));
        }
    }

    Ok(())
}

fn lookup<'a>(services: &'a BTreeMap<String, ServiceTarget>, name: &str) -> Result<&'a ServiceTarget> {
    services
        .get(name)
        .ok_or_else(|| DeployError::unrecoverable(format!("Unknown service: {}", name)))
}

fn coordinator(
    config: &Config,
    sdk_config: &SdkConfig,
    gateway: Arc<dyn EcsGateway>,
    retry: RetryPolicy,
    timeout_secs: Option<u64>,
) -> DeploymentCoordinator {
    let metrics: Arc<dyn MetricsSink> = if config.metrics.enabled {
        Arc::new(CloudWatchMetrics::new(sdk_config, config.metrics.namespace.clone(), retry.clone()))
    } else {
        Arc::new(NoopMetrics)
    };

    let config_source = ParameterStoreConfigSource::new(
        Arc::new(SsmParameterStore::new(sdk_config, retry.clone())),
        Arc::new(SecretsManagerStore::new(sdk_config, retry)),
        Arc::new(SecretsCache::new()),
        config.env_sample_file(),
    );

    let deployer = Deployer::new(
        gateway,
        Arc::new(config_source),
        metrics,
        config.environment.clone(),
        config.application.clone(),
    )
    .with_poll_settings(PollSettings::from(&config.deployment));

    let timeout = timeout_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.deployment.timeout());

    DeploymentCoordinator::new(Arc::new(deployer), config.cluster_name(), timeout)
        .with_concurrency(config.deployment.concurrency)
}
