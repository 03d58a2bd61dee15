use botfleet::adapter::inbound::cli::command::{CheckCommand, Cli, ColorChoice, Commands};
use botfleet::adapter::inbound::cli::output::{self, OutputConfig};
use botfleet::adapter::inbound::cli::{check, control, run, status};
use botfleet::application::ControlOp;
use clap::Parser;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    // reqwest and tokio-tungstenite both pull in rustls; pin one provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();
    match cli.color {
        ColorChoice::Always => owo_colors::set_override(true),
        ColorChoice::Never => owo_colors::set_override(false),
        ColorChoice::Auto => {}
    }
    output::configure(OutputConfig::new(cli.json, cli.quiet, cli.verbose));

    let result: anyhow::Result<()> = match &cli.command {
        Commands::Run(args) => run::execute(args).await.map_err(Into::into),
        Commands::Status(args) => status::execute(&args.status_file).map_err(Into::into),
        Commands::Stop(args) => control::execute(&args.target, ControlOp::Stop, |request| {
            request.skip_archive = args.no_archive;
            request.bucket.clone_from(&args.bucket);
        })
        .await
        .map_err(Into::into),
        Commands::Archive(args) => control::execute(&args.target, ControlOp::Archive, |request| {
            request.bucket.clone_from(&args.bucket);
        })
        .await
        .map_err(Into::into),
        Commands::Remove(target) => control::execute(target, ControlOp::Remove, |_| {}).await.map_err(Into::into),
        Commands::Retry(target) => control::execute(target, ControlOp::Retry, |_| {}).await.map_err(Into::into),
        Commands::Check(CheckCommand::Config(args)) => {
            check::execute_config(&args.config).map_err(Into::into)
        }
    };

    if let Err(e) = result {
        output::error(&format!("{e:#}"));
        std::process::exit(1);
    }
}
