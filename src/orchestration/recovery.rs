//! # Startup Recovery
//!
//! Re-submits every unfinished operation to the queue of its kind once at process
//! start, so work interrupted by a crash or restart resumes from its persisted
//! stage. A persisted requeue delay is honoured for whatever part of it has not
//! yet elapsed.

use crate::error::EngineResult;
use crate::models::OperationKind;
use crate::orchestration::queue::OperationQueue;
use crate::store::OperationStore;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// What a recovery scan did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    /// Operations queued immediately
    pub resubmitted: usize,
    /// Operations queued after their remaining requeue delay
    pub delayed: usize,
    /// Operations of a kind without a queue
    pub skipped: usize,
}

impl RecoverySummary {
    pub fn total(&self) -> usize {
        self.resubmitted + self.delayed + self.skipped
    }
}

pub struct RecoveryScan {
    store: Arc<dyn OperationStore>,
}

impl RecoveryScan {
    pub fn new(store: Arc<dyn OperationStore>) -> Self {
        Self { store }
    }

    pub async fn run(
        &self,
        queues: &HashMap<OperationKind, Arc<OperationQueue>>,
    ) -> EngineResult<RecoverySummary> {
        let operations = self.store.list_active_operations().await?;
        let now = Utc::now();
        let mut summary = RecoverySummary::default();

        for operation in operations {
            let Some(queue) = queues.get(&operation.kind) else {
                warn!(
                    operation_id = %operation.id,
                    kind = %operation.kind,
                    "No queue for operation kind, skipping recovery"
                );
                summary.skipped += 1;
                continue;
            };

            let remaining = operation.remaining_requeue_delay(now);
            if remaining.is_zero() {
                queue.add(operation.id);
                summary.resubmitted += 1;
            } else {
                queue.add_after(operation.id, remaining);
                summary.delayed += 1;
            }
        }

        info!(
            resubmitted = summary.resubmitted,
            delayed = summary.delayed,
            skipped = summary.skipped,
            "🔄 RECOVERY: Unfinished operations resubmitted"
        );
        Ok(summary)
    }
}
