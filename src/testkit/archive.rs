//! [`ArchiveStore`] that fails a set number of times before succeeding.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Error;
use crate::port::{ArchiveJob, ArchiveReceipt, ArchiveStore};

#[derive(Default)]
struct State {
    remaining_failures: u32,
    jobs: Vec<ArchiveJob>,
}

#[derive(Clone, Default)]
pub struct FlakyArchive {
    state: Arc<Mutex<State>>,
}

impl FlakyArchive {
    /// Fail the first `n` attempts. `u32::MAX` never succeeds.
    #[must_use]
    pub fn failing(n: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                remaining_failures: n,
                jobs: Vec::new(),
            })),
        }
    }

    /// Make every following attempt succeed.
    pub fn heal(&self) {
        self.state.lock().remaining_failures = 0;
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.state.lock().jobs.len()
    }

    #[must_use]
    pub fn jobs(&self) -> Vec<ArchiveJob> {
        self.state.lock().jobs.clone()
    }
}

#[async_trait]
impl ArchiveStore for FlakyArchive {
    async fn archive(&self, job: &ArchiveJob) -> Result<ArchiveReceipt, Error> {
        let mut state = self.state.lock();
        state.jobs.push(job.clone());
        if state.remaining_failures > 0 {
            if state.remaining_failures != u32::MAX {
                state.remaining_failures -= 1;
            }
            return Err(Error::Archive("storage unavailable".into()));
        }
        Ok(ArchiveReceipt {
            location: format!("flaky://{}", job.bot),
            files: 1,
            bytes: 0,
        })
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}
