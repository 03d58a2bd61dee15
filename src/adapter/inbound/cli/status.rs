//! Handler for the `status` command.

use std::path::Path;

use chrono::{DateTime, Utc};
use owo_colors::OwoColorize;
use serde_json::json;
use tabled::{Table, Tabled};

use crate::adapter::inbound::cli::output;
use crate::domain::{BotState, FeedInfo};
use crate::error::Result;
use crate::infrastructure::status_file::{read_status_file, StatusBot, StatusFile};

#[derive(Tabled)]
struct BotRow {
    #[tabled(rename = "Bot")]
    name: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Desired")]
    desired: String,
    #[tabled(rename = "Heartbeat")]
    heartbeat: String,
    #[tabled(rename = "Deploys")]
    deploys: u32,
    #[tabled(rename = "Notes")]
    notes: String,
}

#[derive(Tabled)]
struct FeedRow {
    #[tabled(rename = "Feed")]
    key: String,
    #[tabled(rename = "Refs")]
    references: usize,
    #[tabled(rename = "Health")]
    health: String,
    #[tabled(rename = "Idle")]
    idle: String,
}

fn paint_state(state: BotState) -> String {
    let label = state.as_str();
    match state {
        BotState::Running => label.green().to_string(),
        BotState::Error => label.red().to_string(),
        BotState::Archived | BotState::Stopped => label.dimmed().to_string(),
        _ => label.yellow().to_string(),
    }
}

fn age(at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    match at {
        Some(at) => format!("{}s ago", (now - at).num_seconds().max(0)),
        None => "-".to_string(),
    }
}

fn notes(bot: &StatusBot) -> String {
    let mut notes = Vec::new();
    if let Some(error) = &bot.error {
        notes.push(error.clone());
    }
    if let Some(error) = &bot.archive_error {
        notes.push(format!("archive: {error}"));
    }
    if bot.unresponsive {
        notes.push("unresponsive".to_string());
    }
    if bot.cleanup_pending {
        notes.push("cleanup pending".to_string());
    }
    notes.join("; ")
}

fn bot_rows(status: &StatusFile, now: DateTime<Utc>) -> Vec<BotRow> {
    status
        .bots
        .iter()
        .map(|bot| BotRow {
            name: bot.name.clone(),
            state: paint_state(bot.state),
            desired: format!("{:?}", bot.desired).to_lowercase(),
            heartbeat: age(bot.last_heartbeat, now),
            deploys: bot.deploy_attempts,
            notes: notes(bot),
        })
        .collect()
}

fn feed_rows(feeds: &[FeedInfo]) -> Vec<FeedRow> {
    feeds
        .iter()
        .map(|feed| FeedRow {
            key: feed.key.to_string(),
            references: feed.references,
            health: if !feed.healthy {
                "unhealthy".red().to_string()
            } else if feed.degraded {
                "degraded".yellow().to_string()
            } else {
                "healthy".green().to_string()
            },
            idle: match feed.expires_in_secs {
                Some(expires) => format!("{}s (expires in {expires}s)", feed.seconds_since_access),
                None => format!("{}s", feed.seconds_since_access),
            },
        })
        .collect()
}

/// Execute the status command.
pub fn execute(path: &Path) -> Result<()> {
    if !path.exists() {
        if output::is_json() {
            output::json_output(json!({
                "command": "status",
                "status_file": path.display().to_string(),
                "status": "missing",
            }));
        } else {
            output::warning(&format!("Status file not found ({})", path.display()));
            println!("  Run `botfleet run` to start the control plane.");
        }
        return Ok(());
    }

    let status = read_status_file(path)?;

    if output::is_json() {
        output::json_output(json!({
            "command": "status",
            "status_file": path.display().to_string(),
            "status": "ok",
            "snapshot": status,
        }));
        return Ok(());
    }
    if output::is_quiet() {
        return Ok(());
    }

    let now = Utc::now();
    output::header(env!("CARGO_PKG_VERSION"));
    output::field("Broker", &status.broker.url);
    output::field("Namespace", &status.broker.namespace);
    output::field(
        "Connected",
        if status.broker.connected {
            "yes".green().to_string()
        } else {
            "no".red().to_string()
        },
    );
    output::field("PID", status.pid);
    output::field("Updated", age(Some(status.updated_at), now));

    output::section("Bots");
    if status.bots.is_empty() {
        output::field("", "no bots");
    } else {
        output::lines(&Table::new(bot_rows(&status, now)).to_string());
    }

    output::section("Feeds");
    if status.feeds.is_empty() {
        output::field("", "no active feeds");
    } else {
        output::lines(&Table::new(feed_rows(&status.feeds)).to_string());
    }

    Ok(())
}
