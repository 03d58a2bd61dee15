//! Handler for the `run` command.

use tokio::sync::watch;
use tracing::info;

use crate::adapter::inbound::cli::command::RunArgs;
use crate::adapter::inbound::cli::output;
use crate::error::Result;
use crate::infrastructure::bootstrap;
use crate::infrastructure::config::Config;

/// Execute the run command. Returns after Ctrl-C.
pub async fn execute(args: &RunArgs) -> Result<()> {
    let mut config = Config::load(&args.config)?;
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    if args.json_logs || output::is_json() {
        config.logging.format = "json".into();
    }
    if args.no_deploy {
        config.bots.clear();
    }
    config.init_logging();

    print_startup(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    bootstrap::run_with_shutdown(config, shutdown_rx).await?;
    info!("botfleet stopped");
    Ok(())
}

fn print_startup(config: &Config) {
    output::header(env!("CARGO_PKG_VERSION"));
    output::field("Broker", &config.broker.url);
    output::field("Namespace", &config.broker.namespace);
    output::field("Bots", config.bots.len());
    output::field("Status file", config.status_file.display());
    if output::verbosity() > 0 {
        output::field("Program", &config.runtime.program);
        output::field("Instances", config.runtime.instances_dir.display());
        output::field("Archive", config.archive.local_dir.display());
    }
}
