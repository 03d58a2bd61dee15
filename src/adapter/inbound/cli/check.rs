//! Handler for `botfleet check config`.

use std::path::Path;

use serde_json::json;

use crate::adapter::inbound::cli::output;
use crate::error::Result;
use crate::infrastructure::config::Config;

/// Load and validate the configuration without starting anything.
pub fn execute_config(path: &Path) -> Result<()> {
    let config = Config::load(path)?;

    if output::is_json() {
        output::json_output(json!({
            "command": "check.config",
            "config": path.display().to_string(),
            "valid": true,
            "broker_url": config.broker.url,
            "namespace": config.broker.namespace,
            "bots": config.bots.iter().map(|b| b.name.to_string()).collect::<Vec<_>>(),
            "remote_archive": config.archive.remote.is_some(),
        }));
        return Ok(());
    }

    output::section("Configuration Check");
    output::field("Config", path.display());
    output::success("Configuration file is valid");

    output::section("Summary");
    output::field("Broker", &config.broker.url);
    output::field("Namespace", &config.broker.namespace);
    output::field("Program", &config.runtime.program);
    output::field("Bots", config.bots.len());
    if output::verbosity() > 0 {
        for entry in &config.bots {
            output::field("", &entry.name);
        }
    }

    if config.broker.username.is_some() && config.broker.password.is_some() {
        output::success("Broker credentials detected");
    } else {
        output::warning("Broker credentials not set (BROKER_USERNAME, BROKER_PASSWORD)");
    }

    match &config.archive.remote {
        Some(remote) if remote.access_token.is_some() => {
            output::success("Remote archive configured");
        }
        Some(_) => output::warning("Remote archive configured but ARCHIVE_ACCESS_TOKEN is not set"),
        None => output::field("Archive", config.archive.local_dir.display()),
    }

    output::success("Configuration check complete");
    Ok(())
}
