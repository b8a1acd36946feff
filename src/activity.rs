use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::broadcaster::ActivityHub;
use crate::db::ActivityRepository;
use crate::error::AppResult;
use crate::types::ActivityEvent;

/// Outcome of persisting one delivery's events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistSummary {
    pub processed: usize,
    pub skipped: usize,
}

/// Writes extracted events and fans out the ones that were new.
#[derive(Clone)]
pub struct ActivityStore {
    repo: Arc<dyn ActivityRepository>,
    hub: Arc<ActivityHub>,
}

impl ActivityStore {
    pub fn new(repo: Arc<dyn ActivityRepository>, hub: Arc<ActivityHub>) -> Self {
        Self { repo, hub }
    }

    /// Inserts the batch atomically. Only events that produced a row are
    /// broadcast, and only after the commit, so a retried delivery is silent.
    pub async fn persist(&self, events: Vec<ActivityEvent>) -> AppResult<PersistSummary> {
        if events.is_empty() {
            return Ok(PersistSummary::default());
        }

        let inserted = self.repo.insert_batch(&events).await?;

        let mut summary = PersistSummary::default();
        for (event, fresh) in events.into_iter().zip(inserted) {
            if fresh {
                summary.processed += 1;
                let delivered = self.hub.publish(event);
                debug!(delivered, "activity broadcast");
            } else {
                summary.skipped += 1;
            }
        }

        info!(
            processed = summary.processed,
            skipped = summary.skipped,
            "activity persisted"
        );
        Ok(summary)
    }
}
