use anyhow::anyhow;
use campus::{cli_settings_path, load_cli_settings, Command, CommandContext};
use campus_core::{telemetry, CampusClient, ClientConfig};
use clap::Parser;
use tokio::runtime::Runtime;

#[derive(Parser, Debug)]
#[command(name = "campus", version, about = "School messaging from the terminal")]
struct Cli {
    /// Override the API base URL for this run.
    #[arg(long)]
    api_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

fn main() -> anyhow::Result<()> {
    telemetry::init_tracing(telemetry::env_filter())?;

    let cli = Cli::parse();
    let config = ClientConfig::load_overriding(cli.api_url)
        .map_err(|err| anyhow!(err.user_message()))?;

    let runtime = Runtime::new()?;
    runtime.block_on(async move {
        let settings_path = cli_settings_path();
        let settings = load_cli_settings(&settings_path).await?;
        let client = CampusClient::new(config)?;
        campus::run(
            cli.command,
            CommandContext {
                client,
                settings,
                settings_path,
            },
        )
        .await
    })
}
