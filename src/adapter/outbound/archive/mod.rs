//! Archive store adapters.

mod http;
mod local;

pub use http::HttpObjectStore;
pub use local::LocalArchive;

pub(crate) use local::copy_tree;

use chrono::Utc;

use crate::domain::BotName;

/// Folder name for one archive of `bot`, unique per second.
fn archive_name(bot: &BotName) -> String {
    format!("{bot}-{}", Utc::now().format("%Y%m%dT%H%M%SZ"))
}
