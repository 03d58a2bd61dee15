//! Archival Worker: copies a stopped bot's data to cold storage.
//!
//! Attempts are retried with doubling backoff up to a bound. Every step is
//! reported through a callback so the orchestrator can reflect it on the bot
//! record; the worker itself never touches the sandbox.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::domain::BotName;
use crate::error::ControlError;
use crate::infrastructure::config::archive::ArchiveConfig;
use crate::port::{ArchiveDestination, ArchiveJob, ArchiveReceipt, ArchiveStore};

/// Progress of one archival run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveProgress {
    AttemptStarted {
        attempt: u32,
    },
    AttemptFailed {
        attempt: u32,
        error: String,
        will_retry: bool,
    },
    Succeeded(ArchiveReceipt),
    Exhausted {
        attempts: u32,
        error: String,
    },
}

/// Runs archival jobs against the configured stores.
#[derive(Clone)]
pub struct ArchivalWorker {
    local: Arc<dyn ArchiveStore>,
    remote: Option<Arc<dyn ArchiveStore>>,
    config: ArchiveConfig,
}

impl ArchivalWorker {
    pub fn new(
        local: Arc<dyn ArchiveStore>,
        remote: Option<Arc<dyn ArchiveStore>>,
        config: ArchiveConfig,
    ) -> Self {
        Self {
            local,
            remote,
            config,
        }
    }

    /// Reject destinations that have no configured store.
    ///
    /// # Errors
    ///
    /// [`ControlError::InvalidRequest`] for a remote destination when no
    /// remote store is configured.
    pub fn check_destination(&self, destination: &ArchiveDestination) -> Result<(), ControlError> {
        match destination {
            ArchiveDestination::Remote { bucket } if self.remote.is_none() => {
                Err(ControlError::InvalidRequest(format!(
                    "remote archive to bucket {bucket:?} requested but no remote store is configured"
                )))
            }
            ArchiveDestination::Remote { bucket } if bucket.is_empty() => Err(
                ControlError::InvalidRequest("remote archive bucket must not be empty".into()),
            ),
            _ => Ok(()),
        }
    }

    /// Archive `source` for `bot`, reporting every step through `report`.
    ///
    /// # Errors
    ///
    /// [`ControlError::PersistentFailure`] once every attempt has failed, or
    /// [`ControlError::InvalidRequest`] for an unusable destination.
    pub async fn run<F>(
        &self,
        bot: BotName,
        source: PathBuf,
        destination: ArchiveDestination,
        report: F,
    ) -> Result<ArchiveReceipt, ControlError>
    where
        F: Fn(ArchiveProgress) + Send,
    {
        self.check_destination(&destination)?;
        let (store, bucket) = match (destination, &self.remote) {
            (ArchiveDestination::Local, _) => (Arc::clone(&self.local), None),
            (ArchiveDestination::Remote { bucket }, Some(remote)) => {
                (Arc::clone(remote), Some(bucket))
            }
            (ArchiveDestination::Remote { .. }, None) => {
                return Err(ControlError::InvalidRequest(
                    "no remote archive store is configured".into(),
                ))
            }
        };
        let job = ArchiveJob {
            bot: bot.clone(),
            source,
            bucket,
        };

        let max_attempts = self.config.max_attempts;
        let mut attempt = 0;
        loop {
            attempt += 1;
            report(ArchiveProgress::AttemptStarted { attempt });
            info!(bot = %bot, attempt, store = store.name(), "Archiving bot data");

            match store.archive(&job).await {
                Ok(receipt) => {
                    info!(bot = %bot, location = %receipt.location, files = receipt.files, "Archive complete");
                    report(ArchiveProgress::Succeeded(receipt.clone()));
                    return Ok(receipt);
                }
                Err(e) => {
                    let will_retry = attempt < max_attempts;
                    let message = e.to_string();
                    report(ArchiveProgress::AttemptFailed {
                        attempt,
                        error: message.clone(),
                        will_retry,
                    });
                    if !will_retry {
                        error!(bot = %bot, attempts = attempt, error = %message, "Archive retries exhausted");
                        report(ArchiveProgress::Exhausted {
                            attempts: attempt,
                            error: message.clone(),
                        });
                        return Err(ControlError::PersistentFailure {
                            attempts: attempt,
                            reason: message,
                        });
                    }
                    let delay = self.config.backoff(attempt);
                    warn!(
                        bot = %bot,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Archive attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::archive::FlakyArchive;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn config(max_attempts: u32) -> ArchiveConfig {
        ArchiveConfig {
            max_attempts,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            ..ArchiveConfig::default()
        }
    }

    fn bot() -> BotName {
        BotName::new("bot1").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let store = FlakyArchive::failing(2);
        let worker = ArchivalWorker::new(Arc::new(store.clone()), None, config(3));
        let progress = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&progress);

        let started = tokio::time::Instant::now();
        let receipt = worker
            .run(bot(), PathBuf::from("/data/bot1"), ArchiveDestination::Local, move |p| {
                sink.lock().push(p)
            })
            .await
            .unwrap();

        assert_eq!(store.calls(), 3);
        assert_eq!(receipt.location, "flaky://bot1");
        // 100ms then 200ms of backoff.
        assert_eq!(started.elapsed(), Duration::from_millis(300));

        let progress = progress.lock();
        assert_eq!(progress.len(), 6);
        assert!(matches!(
            progress[1],
            ArchiveProgress::AttemptFailed {
                attempt: 1,
                will_retry: true,
                ..
            }
        ));
        assert!(matches!(progress[5], ArchiveProgress::Succeeded(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_bound() {
        let store = FlakyArchive::failing(u32::MAX);
        let worker = ArchivalWorker::new(Arc::new(store.clone()), None, config(2));
        let progress = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&progress);

        let err = worker
            .run(bot(), PathBuf::from("/data/bot1"), ArchiveDestination::Local, move |p| {
                sink.lock().push(p)
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ControlError::PersistentFailure { attempts: 2, .. }));
        assert_eq!(store.calls(), 2);
        assert!(matches!(
            progress.lock().last(),
            Some(ArchiveProgress::Exhausted { attempts: 2, .. })
        ));
    }

    #[tokio::test]
    async fn remote_without_store_is_rejected() {
        let worker = ArchivalWorker::new(Arc::new(FlakyArchive::failing(0)), None, config(3));
        let destination = ArchiveDestination::Remote {
            bucket: "cold".into(),
        };
        assert!(matches!(
            worker.check_destination(&destination),
            Err(ControlError::InvalidRequest(_))
        ));
        let err = worker
            .run(bot(), PathBuf::from("/data"), destination, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn remote_destination_passes_bucket() {
        let remote = FlakyArchive::failing(0);
        let worker = ArchivalWorker::new(
            Arc::new(FlakyArchive::failing(0)),
            Some(Arc::new(remote.clone())),
            config(1),
        );
        worker
            .run(
                bot(),
                PathBuf::from("/data"),
                ArchiveDestination::Remote {
                    bucket: "cold".into(),
                },
                |_| {},
            )
            .await
            .unwrap();
        assert_eq!(remote.jobs()[0].bucket.as_deref(), Some("cold"));
    }
}
