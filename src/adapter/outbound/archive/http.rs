//! Archive to an HTTP object store.
//!
//! Every file is uploaded with `PUT {endpoint}/{bucket}/{name}-{ts}/{path}`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};

use super::archive_name;
use crate::error::{Error, Result};
use crate::port::{ArchiveJob, ArchiveReceipt, ArchiveStore};

pub struct HttpObjectStore {
    client: Client,
    endpoint: String,
    access_token: Option<String>,
}

/// Every file under `root`, with its path relative to `root` using `/`.
fn list_files(root: &Path) -> std::io::Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                pending.push(path);
            } else if let Ok(relative) = path.strip_prefix(root) {
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                files.push((key, path.clone()));
            }
        }
    }
    files.sort();
    Ok(files)
}

impl HttpObjectStore {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, access_token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            access_token,
        }
    }

    fn object_url(&self, bucket: &str, prefix: &str, key: &str) -> String {
        format!("{}/{bucket}/{prefix}/{key}", self.endpoint)
    }
}

#[async_trait]
impl ArchiveStore for HttpObjectStore {
    async fn archive(&self, job: &ArchiveJob) -> Result<ArchiveReceipt> {
        let bucket = job
            .bucket
            .as_deref()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| Error::Archive("remote archive needs a bucket".into()))?;
        let root = job.source.clone();
        let files = tokio::task::spawn_blocking(move || list_files(&root))
            .await
            .map_err(|e| Error::Archive(e.to_string()))??;

        let prefix = archive_name(&job.bot);
        let mut bytes = 0u64;
        for (key, path) in &files {
            let body = tokio::fs::read(path).await?;
            bytes += body.len() as u64;
            let url = self.object_url(bucket, &prefix, key);
            debug!(bot = %job.bot, url = %url, size = body.len(), "Uploading");

            let mut request = self.client.put(&url).body(body);
            if let Some(token) = &self.access_token {
                request = request.bearer_auth(token);
            }
            request.send().await?.error_for_status()?;
        }

        let location = format!("{}/{bucket}/{prefix}", self.endpoint);
        info!(bot = %job.bot, location = %location, files = files.len(), "Uploaded archive");
        Ok(ArchiveReceipt {
            location,
            files: files.len(),
            bytes,
        })
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
