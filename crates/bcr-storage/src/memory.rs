use std::collections::HashMap;

use async_trait::async_trait;
use bcr_core::{
    ComparisonRun, MissingUserRecord, NewComparisonRun, NewMissingUser, ProgressUpdate,
    RunResults, RunStatus,
};
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{MissingUserFilter, Page, RunStore, StoreError};

/// Process-local [`RunStore`] for tests and dry runs without a database.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    runs: HashMap<Uuid, ComparisonRun>,
    results: HashMap<Uuid, RunResults>,
    users: Vec<MissingUserRecord>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_run(&self, new_run: NewComparisonRun) -> Result<ComparisonRun, StoreError> {
        let run = ComparisonRun::new(new_run, Utc::now());
        self.state.lock().await.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<ComparisonRun>, StoreError> {
        Ok(self.state.lock().await.runs.get(&run_id).cloned())
    }

    async fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: usize,
    ) -> Result<Vec<ComparisonRun>, StoreError> {
        let state = self.state.lock().await;
        let mut runs = state
            .runs
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect::<Vec<_>>();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn next_pending_run(&self) -> Result<Option<ComparisonRun>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Pending)
            .min_by_key(|r| r.created_at)
            .cloned())
    }

    async fn apply_progress(
        &self,
        run_id: Uuid,
        update: ProgressUpdate,
    ) -> Result<ComparisonRun, StoreError> {
        let mut state = self.state.lock().await;
        let run = state.runs.get_mut(&run_id).ok_or(StoreError::NotFound {
            kind: "comparison run",
            id: run_id,
        })?;
        run.apply_progress(update, Utc::now());
        Ok(run.clone())
    }

    async fn save_results(&self, run_id: Uuid, results: &RunResults) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.runs.contains_key(&run_id) {
            return Err(StoreError::NotFound {
                kind: "comparison run",
                id: run_id,
            });
        }
        state.results.insert(run_id, results.clone());
        Ok(())
    }

    async fn load_results(&self, run_id: Uuid) -> Result<Option<RunResults>, StoreError> {
        Ok(self.state.lock().await.results.get(&run_id).cloned())
    }

    async fn insert_missing_users(
        &self,
        run_id: Uuid,
        users: Vec<NewMissingUser>,
    ) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        if !state.runs.contains_key(&run_id) {
            return Err(StoreError::NotFound {
                kind: "comparison run",
                id: run_id,
            });
        }
        let count = users.len();
        state.users.extend(
            users
                .into_iter()
                .map(|user| MissingUserRecord::from_new(run_id, user, now)),
        );
        Ok(count)
    }

    async fn list_missing_users(
        &self,
        run_id: Uuid,
        filter: &MissingUserFilter,
    ) -> Result<Page<MissingUserRecord>, StoreError> {
        let state = self.state.lock().await;
        let matching = state
            .users
            .iter()
            .filter(|u| u.comparison_run_id == run_id && filter.matches(u))
            .collect::<Vec<_>>();
        let total = matching.len();
        let items = matching
            .into_iter()
            .skip(filter.offset())
            .take(filter.per_page())
            .cloned()
            .collect();
        Ok(Page::new(items, filter, total))
    }

    async fn get_missing_user(&self, id: Uuid) -> Result<Option<MissingUserRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .users
            .iter()
            .find(|u| u.id == id)
            .cloned())
    }

    async fn save_missing_user(&self, record: &MissingUserRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let slot = state
            .users
            .iter_mut()
            .find(|u| u.id == record.id)
            .ok_or(StoreError::NotFound {
                kind: "missing user",
                id: record.id,
            })?;
        *slot = record.clone();
        Ok(())
    }
}
