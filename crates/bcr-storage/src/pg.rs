use async_trait::async_trait;
use bcr_core::{
    CanonicalContact, ClassifiedContact, ComparisonRun, MissingUserRecord, NewComparisonRun,
    NewMissingUser, ProgressUpdate, Provenance, RunCounters, RunResults, RunStatus,
};
use chrono::Utc;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Row};
use tracing::debug;
use uuid::Uuid;

use crate::{MissingUserFilter, Page, RunStore, StoreError};

const RUN_COLUMNS: &str = "id, name, source_file, status, total_local, total_remote, \
     found_count, missing_count, found_elsewhere_count, sync_percentage, current_step, \
     progress_percentage, last_progress_update, error_message, created_at, updated_at";

const USER_COLUMNS: &str = "id, comparison_run_id, name, email, phone, company, tags, \
     contact_created_on, last_activity_on, import_status, remote_customer_id, \
     customer_created, remote_subscription_id, import_error, import_notes, found_sources, imported_at, \
     created_at, updated_at";

/// Rows per multi-row INSERT; 20 binds each keeps us under the Postgres parameter limit.
const INSERT_CHUNK: usize = 1_000;

#[derive(Debug, Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn to_u64(value: i64) -> u64 {
    value.max(0) as u64
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn escape_like(term: &str) -> String {
    term.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn run_from_row(row: &PgRow) -> Result<ComparisonRun, StoreError> {
    let status: String = row.try_get("status")?;
    let progress: i16 = row.try_get("progress_percentage")?;
    Ok(ComparisonRun {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        source_file: row.try_get("source_file")?,
        status: status
            .parse::<RunStatus>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        counters: RunCounters {
            total_local: to_u64(row.try_get("total_local")?),
            total_remote: to_u64(row.try_get("total_remote")?),
            found: to_u64(row.try_get("found_count")?),
            missing: to_u64(row.try_get("missing_count")?),
            found_elsewhere: to_u64(row.try_get("found_elsewhere_count")?),
        },
        sync_percentage: row.try_get("sync_percentage")?,
        current_step: row.try_get("current_step")?,
        progress_percentage: progress.clamp(0, 100) as u8,
        last_progress_update: row.try_get("last_progress_update")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn user_from_row(row: &PgRow) -> Result<MissingUserRecord, StoreError> {
    let status: String = row.try_get("import_status")?;
    let found_sources: Json<Vec<Provenance>> = row.try_get("found_sources")?;
    Ok(MissingUserRecord {
        id: row.try_get("id")?,
        comparison_run_id: row.try_get("comparison_run_id")?,
        contact: CanonicalContact {
            name: row.try_get("name")?,
            email: row.try_get("email")?,
            phone: row.try_get("phone")?,
            company: row.try_get("company")?,
            tags: row.try_get("tags")?,
            created_on: row.try_get("contact_created_on")?,
            last_activity_on: row.try_get("last_activity_on")?,
        },
        import_status: status
            .parse()
            .map_err(|e: bcr_core::UnknownVariant| StoreError::Corrupt(e.to_string()))?,
        remote_customer_id: row.try_get("remote_customer_id")?,
        customer_created: row.try_get("customer_created")?,
        remote_subscription_id: row.try_get("remote_subscription_id")?,
        import_error: row.try_get("import_error")?,
        import_notes: row.try_get("import_notes")?,
        found_sources: found_sources.0,
        imported_at: row.try_get("imported_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

async fn write_run(conn: &mut PgConnection, run: &ComparisonRun) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE comparison_runs
           SET status = $2,
               total_local = $3,
               total_remote = $4,
               found_count = $5,
               missing_count = $6,
               found_elsewhere_count = $7,
               sync_percentage = $8,
               current_step = $9,
               progress_percentage = $10,
               last_progress_update = $11,
               error_message = $12,
               updated_at = $13
         WHERE id = $1
        "#,
    )
    .bind(run.id)
    .bind(run.status.as_str())
    .bind(to_i64(run.counters.total_local))
    .bind(to_i64(run.counters.total_remote))
    .bind(to_i64(run.counters.found))
    .bind(to_i64(run.counters.missing))
    .bind(to_i64(run.counters.found_elsewhere))
    .bind(run.sync_percentage)
    .bind(run.current_step.as_deref())
    .bind(i16::from(run.progress_percentage))
    .bind(run.last_progress_update)
    .bind(run.error_message.as_deref())
    .bind(run.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

fn push_user_filter(qb: &mut QueryBuilder<'_, Postgres>, run_id: Uuid, filter: &MissingUserFilter) {
    qb.push(" WHERE comparison_run_id = ").push_bind(run_id);
    if let Some(status) = filter.status {
        qb.push(" AND import_status = ").push_bind(status.as_str());
    }
    if let Some(term) = filter.search_term() {
        let pattern = format!("%{}%", escape_like(&term));
        qb.push(" AND (LOWER(email) LIKE ")
            .push_bind(pattern.clone())
            .push(" OR LOWER(name) LIKE ")
            .push_bind(pattern)
            .push(")");
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn create_run(&self, new_run: NewComparisonRun) -> Result<ComparisonRun, StoreError> {
        let run = ComparisonRun::new(new_run, Utc::now());
        sqlx::query(
            r#"
            INSERT INTO comparison_runs (id, name, source_file, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(run.id)
        .bind(&run.name)
        .bind(&run.source_file)
        .bind(run.status.as_str())
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await?;
        debug!(run_id = %run.id, "comparison run created");
        Ok(run)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<ComparisonRun>, StoreError> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM comparison_runs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: usize,
    ) -> Result<Vec<ComparisonRun>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {RUN_COLUMNS} FROM comparison_runs"));
        if let Some(status) = status {
            qb.push(" WHERE status = ").push_bind(status.as_str());
        }
        qb.push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn next_pending_run(&self) -> Result<Option<ComparisonRun>, StoreError> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM comparison_runs WHERE status = 'pending' ORDER BY created_at ASC LIMIT 1"
        );
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn apply_progress(
        &self,
        run_id: Uuid,
        update: ProgressUpdate,
    ) -> Result<ComparisonRun, StoreError> {
        let mut tx = self.pool.begin().await?;
        let sql = format!("SELECT {RUN_COLUMNS} FROM comparison_runs WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound {
                kind: "comparison run",
                id: run_id,
            })?;
        let mut run = run_from_row(&row)?;
        if run.apply_progress(update, Utc::now()) {
            write_run(&mut tx, &run).await?;
        }
        tx.commit().await?;
        Ok(run)
    }

    async fn save_results(&self, run_id: Uuid, results: &RunResults) -> Result<(), StoreError> {
        let outcome = sqlx::query(
            r#"
            UPDATE comparison_runs
               SET found_results = $2,
                   missing_results = $3,
                   found_elsewhere_results = $4,
                   updated_at = $5
             WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(Json(&results.found))
        .bind(Json(&results.missing))
        .bind(Json(&results.found_elsewhere))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if outcome.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "comparison run",
                id: run_id,
            });
        }
        Ok(())
    }

    async fn load_results(&self, run_id: Uuid) -> Result<Option<RunResults>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT found_results, missing_results, found_elsewhere_results
              FROM comparison_runs
             WHERE id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let found: Option<Json<Vec<ClassifiedContact>>> = row.try_get("found_results")?;
        let missing: Option<Json<Vec<CanonicalContact>>> = row.try_get("missing_results")?;
        let found_elsewhere: Option<Json<Vec<ClassifiedContact>>> =
            row.try_get("found_elsewhere_results")?;
        if found.is_none() && missing.is_none() && found_elsewhere.is_none() {
            return Ok(None);
        }
        Ok(Some(RunResults {
            found: found.map(|j| j.0).unwrap_or_default(),
            found_elsewhere: found_elsewhere.map(|j| j.0).unwrap_or_default(),
            missing: missing.map(|j| j.0).unwrap_or_default(),
        }))
    }

    async fn insert_missing_users(
        &self,
        run_id: Uuid,
        users: Vec<NewMissingUser>,
    ) -> Result<usize, StoreError> {
        let now = Utc::now();
        let records = users
            .into_iter()
            .map(|user| MissingUserRecord::from_new(run_id, user, now))
            .collect::<Vec<_>>();

        let mut tx = self.pool.begin().await?;
        let exists: Option<Uuid> = sqlx::query_scalar("SELECT id FROM comparison_runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StoreError::NotFound {
                kind: "comparison run",
                id: run_id,
            });
        }

        for (chunk_no, chunk) in records.chunks(INSERT_CHUNK).enumerate() {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO missing_users (id, comparison_run_id, position, name, email, phone, \
                 company, tags, contact_created_on, last_activity_on, import_status, \
                 remote_customer_id, customer_created, remote_subscription_id, import_error, \
                 import_notes, found_sources, imported_at, created_at, updated_at) ",
            );
            qb.push_values(chunk.iter().enumerate(), |mut b, (i, r)| {
                let position = i32::try_from(chunk_no * INSERT_CHUNK + i).unwrap_or(i32::MAX);
                b.push_bind(r.id)
                    .push_bind(r.comparison_run_id)
                    .push_bind(position)
                    .push_bind(r.contact.name.clone())
                    .push_bind(r.contact.email.clone())
                    .push_bind(r.contact.phone.clone())
                    .push_bind(r.contact.company.clone())
                    .push_bind(r.contact.tags.clone())
                    .push_bind(r.contact.created_on)
                    .push_bind(r.contact.last_activity_on)
                    .push_bind(r.import_status.as_str())
                    .push_bind(r.remote_customer_id.clone())
                    .push_bind(r.customer_created)
                    .push_bind(r.remote_subscription_id.clone())
                    .push_bind(r.import_error.clone())
                    .push_bind(r.import_notes.clone())
                    .push_bind(Json(r.found_sources.clone()))
                    .push_bind(r.imported_at)
                    .push_bind(r.created_at)
                    .push_bind(r.updated_at);
            });
            qb.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        debug!(%run_id, rows = records.len(), "missing users inserted");
        Ok(records.len())
    }

    async fn list_missing_users(
        &self,
        run_id: Uuid,
        filter: &MissingUserFilter,
    ) -> Result<Page<MissingUserRecord>, StoreError> {
        let mut count_qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM missing_users");
        push_user_filter(&mut count_qb, run_id, filter);
        let total: i64 = count_qb.build_query_scalar().fetch_one(&self.pool).await?;

        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {USER_COLUMNS} FROM missing_users"));
        push_user_filter(&mut qb, run_id, filter);
        qb.push(" ORDER BY position, created_at LIMIT ")
            .push_bind(i64::try_from(filter.per_page()).unwrap_or(i64::MAX))
            .push(" OFFSET ")
            .push_bind(i64::try_from(filter.offset()).unwrap_or(i64::MAX));
        let rows = qb.build().fetch_all(&self.pool).await?;
        let items = rows.iter().map(user_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(items, filter, to_u64(total) as usize))
    }

    async fn get_missing_user(&self, id: Uuid) -> Result<Option<MissingUserRecord>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM missing_users WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn save_missing_user(&self, record: &MissingUserRecord) -> Result<(), StoreError> {
        let outcome = sqlx::query(
            r#"
            UPDATE missing_users
               SET import_status = $2,
                   remote_customer_id = $3,
                   remote_subscription_id = $4,
                   import_error = $5,
                   import_notes = $6,
                   found_sources = $7,
                   imported_at = $8,
                   updated_at = $9,
                   customer_created = $10
             WHERE id = $1
            "#,
        )
        .bind(record.id)
        .bind(record.import_status.as_str())
        .bind(record.remote_customer_id.as_deref())
        .bind(record.remote_subscription_id.as_deref())
        .bind(record.import_error.as_deref())
        .bind(record.import_notes.as_deref())
        .bind(Json(&record.found_sources))
        .bind(record.imported_at)
        .bind(record.updated_at)
        .bind(record.customer_created)
        .execute(&self.pool)
        .await?;
        if outcome.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "missing user",
                id: record.id,
            });
        }
        Ok(())
    }
}
