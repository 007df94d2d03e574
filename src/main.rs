use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stax::cli::{Cli, Commands, ConfigCommands};
use stax::commands::{
    ProjectContext, handle_config, handle_doctor, handle_installs, handle_pull, handle_replace,
    handle_snapshot,
};
use stax::{Config, Result};

/// Environment variable holding a tracing filter, e.g. `stax=debug`.
const LOG_ENV: &str = "STAX_LOG";

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "stax=debug" } else { "stax=warn" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
                .unwrap_or_else(|_| fallback.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Cancel the token on the first Ctrl+C. A second one kills the process.
fn watch_interrupt(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        eprintln!("\nInterrupted; cleaning up (press Ctrl+C again to abort)");
        cancel.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
}

async fn run(cli: Cli, cancel: CancellationToken) -> Result<i32> {
    // Generating a config must work even when the current one does not parse
    if let Commands::Config {
        command: command @ ConfigCommands::Generate { .. },
    } = &cli.command
    {
        return handle_config(&Config::default(), None, command);
    }

    let config = Config::load(cli.global.config.as_deref())?;
    let project_id = cli.global.project.as_deref();

    match &cli.command {
        Commands::Config { command } => {
            let source = cli
                .global
                .config
                .clone()
                .or_else(Config::find_existing_config);
            handle_config(&config, source.as_deref(), command)
        }
        Commands::Doctor => {
            let ctx = ProjectContext::new(config.clone(), project_id, cancel).ok();
            handle_doctor(&config, ctx.as_ref())
        }
        Commands::Installs => {
            let project = config.project(project_id).ok();
            handle_installs(&config, project).await
        }
        Commands::Pull(args) => {
            let ctx = ProjectContext::new(config, project_id, cancel)?;
            handle_pull(&ctx, args).await
        }
        Commands::Snapshot { command } => {
            let ctx = ProjectContext::new(config, project_id, cancel)?;
            handle_snapshot(&ctx, command)
        }
        Commands::Replace(args) => {
            let ctx = ProjectContext::new(config, project_id, cancel)?;
            handle_replace(&ctx, args)
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.global.verbose);

    let cancel = CancellationToken::new();
    watch_interrupt(cancel.clone());

    let code = match run(cli, cancel).await {
        Ok(code) => code,
        Err(e) => {
            tracing::debug!(kind = e.kind(), "command failed");
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}
