//! Persistence for BCR: comparison runs, missing-user records, the plan cache
//! and the content-addressed store for submitted CSV files.

use async_trait::async_trait;
use bcr_core::{
    ComparisonRun, ImportStatus, MissingUserRecord, NewComparisonRun, NewMissingUser,
    ProgressUpdate, RunResults, RunStatus,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod memory;
mod pg;
mod plan_cache;
mod uploads;

pub use memory::MemoryRunStore;
pub use pg::PgRunStore;
pub use plan_cache::PlanCache;
pub use uploads::{StoredUpload, UploadMetadata, UploadStore};

pub const DEFAULT_PER_PAGE: usize = 25;
pub const MAX_PER_PAGE: usize = 200;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Filters for listing the missing users of one run. Pages are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingUserFilter {
    pub status: Option<ImportStatus>,
    pub search: Option<String>,
    pub page: usize,
    pub per_page: usize,
}

impl Default for MissingUserFilter {
    fn default() -> Self {
        Self {
            status: None,
            search: None,
            page: 1,
            per_page: DEFAULT_PER_PAGE,
        }
    }
}

impl MissingUserFilter {
    pub fn with_status(status: ImportStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn per_page(&self) -> usize {
        self.per_page.clamp(1, MAX_PER_PAGE)
    }

    pub fn page(&self) -> usize {
        self.page.max(1)
    }

    pub fn offset(&self) -> usize {
        (self.page() - 1) * self.per_page()
    }

    fn search_term(&self) -> Option<String> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase)
    }

    pub fn matches(&self, record: &MissingUserRecord) -> bool {
        if let Some(status) = self.status {
            if record.import_status != status {
                return false;
            }
        }
        match self.search_term() {
            Some(term) => {
                record.contact.email.to_lowercase().contains(&term)
                    || record.contact.name.to_lowercase().contains(&term)
            }
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
    pub total_pages: usize,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, filter: &MissingUserFilter, total: usize) -> Self {
        let per_page = filter.per_page();
        Self {
            items,
            page: filter.page(),
            per_page,
            total,
            total_pages: total.max(1).div_ceil(per_page),
        }
    }
}

/// Storage contract consumed by the pipeline and the API surfaces.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, new_run: NewComparisonRun) -> Result<ComparisonRun, StoreError>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<ComparisonRun>, StoreError>;

    /// Most recent first.
    async fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: usize,
    ) -> Result<Vec<ComparisonRun>, StoreError>;

    /// Oldest run still waiting to be processed.
    async fn next_pending_run(&self) -> Result<Option<ComparisonRun>, StoreError>;

    /// Merge one progress write using [`ComparisonRun::apply_progress`] and return the stored run.
    async fn apply_progress(
        &self,
        run_id: Uuid,
        update: ProgressUpdate,
    ) -> Result<ComparisonRun, StoreError>;

    async fn save_results(&self, run_id: Uuid, results: &RunResults) -> Result<(), StoreError>;

    async fn load_results(&self, run_id: Uuid) -> Result<Option<RunResults>, StoreError>;

    /// Batch insert, preserving the given order. Returns the number of rows written.
    async fn insert_missing_users(
        &self,
        run_id: Uuid,
        users: Vec<NewMissingUser>,
    ) -> Result<usize, StoreError>;

    async fn list_missing_users(
        &self,
        run_id: Uuid,
        filter: &MissingUserFilter,
    ) -> Result<Page<MissingUserRecord>, StoreError>;

    async fn get_missing_user(&self, id: Uuid) -> Result<Option<MissingUserRecord>, StoreError>;

    async fn save_missing_user(&self, record: &MissingUserRecord) -> Result<(), StoreError>;
}
