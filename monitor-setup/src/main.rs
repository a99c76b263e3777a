use clap::{Args, Parser, Subcommand};
use monitor_setup::{SetupError, SyntheticsClient};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "monitor-setup", version)]
#[command(about = "Provision a synthetic uptime monitor for a deployed status endpoint")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the monitor if it does not exist and upload its check script
    Create(SetupArgs),
    /// Update an existing monitor or alert policy
    Update(UpdateArgs),
}

#[derive(Args, Debug)]
struct SetupArgs {
    /// URL of the deployed status endpoint the monitor should call
    url: String,

    /// API key for the monitoring service
    #[arg(long, env = "MONITOR_API_KEY")]
    auth: String,

    /// Monitor name
    #[arg(long, env = "MONITOR_NAME", default_value = env!("CARGO_PKG_NAME"))]
    name: String,

    /// Email address to notify when checks fail
    #[arg(long)]
    email: Option<String>,
}

#[derive(Args, Debug)]
struct UpdateArgs {
    #[command(flatten)]
    setup: SetupArgs,

    /// Id of an existing monitor
    #[arg(long)]
    monitor_id: Option<String>,

    /// Id of an existing alert policy
    #[arg(long)]
    policy_id: Option<String>,
}

async fn provision(
    args: &SetupArgs,
    monitor_id: Option<&str>,
    policy_id: Option<&str>,
) -> anyhow::Result<()> {
    let client = SyntheticsClient::new(&args.auth);

    match client
        .update_or_create_monitor(&args.url, &args.name, monitor_id)
        .await
    {
        Ok(()) => {}
        // Only a failed creation is fatal; everything else is logged.
        Err(err @ SetupError::MonitorCreation { .. }) => {
            return Err(anyhow::Error::new(err).context("monitor provisioning aborted"));
        }
        Err(err) => error!("Monitor provisioning failed: {}", err),
    }

    let channel_id = match &args.email {
        Some(email) => match client.ensure_channel(&args.name, email).await {
            Ok(channel) => channel.id,
            Err(err) => {
                error!("Notification channel setup failed: {}", err);
                None
            }
        },
        None => None,
    };

    if let Err(err) = client
        .link_alert_policy(&args.name, monitor_id, policy_id, channel_id)
        .await
    {
        error!("Alert policy linkage failed: {}", err);
    }

    info!("done.");
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match &cli.command {
        Commands::Create(args) => provision(args, None, None).await,
        Commands::Update(args) => {
            provision(
                &args.setup,
                args.monitor_id.as_deref(),
                args.policy_id.as_deref(),
            )
            .await
        }
    };

    if let Err(err) = result {
        error!("{:#}", err);
        std::process::exit(1);
    }
}
