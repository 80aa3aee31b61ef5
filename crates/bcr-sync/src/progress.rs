use std::sync::Arc;

use anyhow::Result;
use bcr_core::{ComparisonRun, CounterUpdate, ProgressUpdate, RunStatus};
use bcr_storage::RunStore;
use tracing::debug;
use uuid::Uuid;

pub const PARSED: f64 = 10.0;
pub const SOURCES_FETCHED: f64 = 15.0;
pub const INDEX_START: f64 = 20.0;
pub const INDEX_END: f64 = 25.0;
pub const INDEX_BUILT: f64 = 30.0;
pub const RECONCILE_END: f64 = 90.0;
pub const PERSISTING: f64 = 95.0;
pub const COMPLETED: f64 = 100.0;

/// Linear position of `done / total` inside `[start, end]`.
pub fn scaled(start: f64, end: f64, done: usize, total: usize) -> f64 {
    if total == 0 {
        return end;
    }
    start + (end - start) * (done.min(total) as f64 / total as f64)
}

/// Writes progress for one run through the store's merge rules.
#[derive(Clone)]
pub struct ProgressTracker {
    store: Arc<dyn RunStore>,
    run_id: Uuid,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn RunStore>, run_id: Uuid) -> Self {
        Self { store, run_id }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub async fn update(&self, update: ProgressUpdate) -> Result<ComparisonRun> {
        debug!(run_id = %self.run_id, step = ?update.step, pct = ?update.percentage, "progress");
        Ok(self.store.apply_progress(self.run_id, update).await?)
    }

    pub async fn step(&self, step: impl Into<String>, percentage: f64) -> Result<ComparisonRun> {
        self.update(ProgressUpdate::step(step, percentage)).await
    }

    pub async fn counters(
        &self,
        step: impl Into<String>,
        percentage: f64,
        counters: CounterUpdate,
    ) -> Result<ComparisonRun> {
        self.update(ProgressUpdate::step(step, percentage).with_counters(counters))
            .await
    }

    pub async fn complete(&self, counters: CounterUpdate) -> Result<ComparisonRun> {
        self.update(
            ProgressUpdate::step("Completed", COMPLETED)
                .with_counters(counters)
                .with_status(RunStatus::Completed),
        )
        .await
    }

    /// Terminal failure. The percentage stays where the run stopped.
    pub async fn fail(&self, message: impl Into<String>) -> Result<ComparisonRun> {
        self.update(ProgressUpdate {
            step: Some("Failed".to_string()),
            status: Some(RunStatus::Failed),
            error_message: Some(message.into()),
            ..ProgressUpdate::default()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bcr_core::NewComparisonRun;
    use bcr_storage::MemoryRunStore;

    #[test]
    fn slices_scale_linearly() {
        assert_eq!(scaled(30.0, 90.0, 0, 100), 30.0);
        assert_eq!(scaled(30.0, 90.0, 50, 100), 60.0);
        assert_eq!(scaled(30.0, 90.0, 150, 100), 90.0);
        assert_eq!(scaled(20.0, 25.0, 0, 0), 25.0);
    }

    #[tokio::test]
    async fn failure_keeps_percentage_and_freezes_run() {
        let store: Arc<dyn RunStore> = Arc::new(MemoryRunStore::new());
        let run = store
            .create_run(NewComparisonRun {
                name: "t".into(),
                source_file: "t.csv".into(),
            })
            .await
            .unwrap();
        let tracker = ProgressTracker::new(store.clone(), run.id);

        tracker.step("Indexing", 22.0).await.unwrap();
        let failed = tracker.fail("sources unavailable").await.unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.progress_percentage, 22);

        let after = tracker.complete(CounterUpdate::default()).await.unwrap();
        assert_eq!(after.status, RunStatus::Failed);
        assert_eq!(after.error_message.as_deref(), Some("sources unavailable"));
    }
}
