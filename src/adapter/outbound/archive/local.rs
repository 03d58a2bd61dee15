//! Archive to a directory on the local filesystem.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::archive_name;
use crate::error::{Error, Result};
use crate::port::{ArchiveJob, ArchiveReceipt, ArchiveStore};

/// Recursively copy `src` into `dst`. Returns files and bytes copied.
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> io::Result<(usize, u64)> {
    fs::create_dir_all(dst)?;
    let mut files = 0;
    let mut bytes = 0;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            let (f, b) = copy_tree(&entry.path(), &target)?;
            files += f;
            bytes += b;
        } else {
            bytes += fs::copy(entry.path(), &target)?;
            files += 1;
        }
    }
    Ok((files, bytes))
}

pub struct LocalArchive {
    root: PathBuf,
}

impl LocalArchive {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ArchiveStore for LocalArchive {
    async fn archive(&self, job: &ArchiveJob) -> Result<ArchiveReceipt> {
        let source = job.source.clone();
        if !source.is_dir() {
            return Err(Error::Archive(format!(
                "source {} is not a directory",
                source.display()
            )));
        }
        let target = self.root.join(archive_name(&job.bot));
        debug!(bot = %job.bot, target = %target.display(), "Copying bot data");

        let destination = target.clone();
        let (files, bytes) = tokio::task::spawn_blocking(move || copy_tree(&source, &destination))
            .await
            .map_err(|e| Error::Archive(e.to_string()))??;

        Ok(ArchiveReceipt {
            location: target.display().to_string(),
            files,
            bytes,
        })
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
