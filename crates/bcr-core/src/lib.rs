//! Core domain model for BCR: comparison runs, contacts, the customer index
//! and the missing-user records produced by reconciliation.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Placeholder used when a CSV row carries neither a first nor a last name.
pub const UNKNOWN_NAME: &str = "Unknown";

/// Email matching key: trimmed and case-folded.
pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// `found / total_local` as a percentage rounded to two decimals.
pub fn sync_percentage(found: u64, total_local: u64) -> f64 {
    if total_local == 0 {
        return 0.0;
    }
    let pct = found as f64 / total_local as f64 * 100.0;
    (pct * 100.0).round() / 100.0
}

/// Clamp a progress value into `0..=100`; non-finite input counts as zero.
pub fn clamp_percentage(value: f64) -> u8 {
    if !value.is_finite() {
        return 0;
    }
    value.clamp(0.0, 100.0).round() as u8
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} `{}`", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for RunStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownVariant {
                kind: "run status",
                value: other.to_string(),
            }),
        }
    }
}

/// Running statistics attached to a comparison run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub total_local: u64,
    pub total_remote: u64,
    pub found: u64,
    pub missing: u64,
    pub found_elsewhere: u64,
}

/// Partial counter write. Fields left as `None` keep their stored value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterUpdate {
    pub total_local: Option<u64>,
    pub total_remote: Option<u64>,
    pub found: Option<u64>,
    pub missing: Option<u64>,
    pub found_elsewhere: Option<u64>,
}

impl RunCounters {
    pub fn merge(&mut self, update: &CounterUpdate) {
        if let Some(v) = update.total_local {
            self.total_local = v;
        }
        if let Some(v) = update.total_remote {
            self.total_remote = v;
        }
        if let Some(v) = update.found {
            self.found = v;
        }
        if let Some(v) = update.missing {
            self.missing = v;
        }
        if let Some(v) = update.found_elsewhere {
            self.found_elsewhere = v;
        }
    }
}

/// One progress write: step text, percentage, counters and optionally a status change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub step: Option<String>,
    pub percentage: Option<f64>,
    pub counters: CounterUpdate,
    pub status: Option<RunStatus>,
    pub error_message: Option<String>,
}

impl ProgressUpdate {
    pub fn step(step: impl Into<String>, percentage: f64) -> Self {
        Self {
            step: Some(step.into()),
            percentage: Some(percentage),
            ..Self::default()
        }
    }

    pub fn with_counters(mut self, counters: CounterUpdate) -> Self {
        self.counters = counters;
        self
    }

    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewComparisonRun {
    pub name: String,
    pub source_file: String,
}

/// One reconciliation job. Result sets live in [`RunResults`] and are loaded separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRun {
    pub id: Uuid,
    pub name: String,
    pub source_file: String,
    pub status: RunStatus,
    pub counters: RunCounters,
    pub sync_percentage: f64,
    pub current_step: Option<String>,
    pub progress_percentage: u8,
    pub last_progress_update: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ComparisonRun {
    pub fn new(new_run: NewComparisonRun, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: new_run.name,
            source_file: new_run.source_file,
            status: RunStatus::Pending,
            counters: RunCounters::default(),
            sync_percentage: 0.0,
            current_step: None,
            progress_percentage: 0,
            last_progress_update: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Merge a progress write into the run.
    ///
    /// The percentage is clamped and never moves backwards, counters are merged
    /// field by field, and a run in a terminal state is left untouched. Returns
    /// whether the update was applied.
    pub fn apply_progress(&mut self, update: ProgressUpdate, at: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if let Some(step) = update.step {
            self.current_step = Some(step);
        }
        if let Some(pct) = update.percentage {
            self.progress_percentage = self.progress_percentage.max(clamp_percentage(pct));
        }
        self.counters.merge(&update.counters);
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(message) = update.error_message {
            self.error_message = Some(message);
        }
        self.sync_percentage = sync_percentage(self.counters.found, self.counters.total_local);
        self.last_progress_update = Some(at);
        self.updated_at = at;
        true
    }

    pub fn progress_snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            run_id: self.id,
            status: self.status,
            progress_percentage: self.progress_percentage,
            current_step: self.current_step.clone(),
            counters: self.counters,
            sync_percentage: self.sync_percentage,
            is_completed: self.status == RunStatus::Completed,
            is_failed: self.status == RunStatus::Failed,
            error_message: self.error_message.clone(),
            last_progress_update: self.last_progress_update,
        }
    }
}

/// What a poller sees for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub progress_percentage: u8,
    pub current_step: Option<String>,
    pub counters: RunCounters,
    pub sync_percentage: f64,
    pub is_completed: bool,
    pub is_failed: bool,
    pub error_message: Option<String>,
    pub last_progress_update: Option<DateTime<Utc>>,
}

/// One valid row of the CRM export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalContact {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub tags: Option<String>,
    pub created_on: Option<NaiveDate>,
    pub last_activity_on: Option<NaiveDate>,
}

/// Where a remote customer was seen.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Provenance {
    pub source_id: String,
    pub provider: String,
    pub customer_oid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerIndexEntry {
    pub email: String,
    pub customer_oid: String,
    pub name: Option<String>,
    pub provenance: Vec<Provenance>,
}

impl CustomerIndexEntry {
    pub fn seen_in(&self, source_id: &str) -> bool {
        self.provenance.iter().any(|p| p.source_id == source_id)
    }

    fn add_provenance(&mut self, provenance: Provenance) {
        if !self.provenance.contains(&provenance) {
            self.provenance.push(provenance);
        }
    }
}

/// Deduplicated remote view keyed by normalized email.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomerIndex {
    entries: HashMap<String, CustomerIndexEntry>,
}

impl CustomerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a remote customer. An existing entry for the same email gains a
    /// provenance tuple instead of being replaced. Returns `true` when the email
    /// was not indexed before; blank emails are ignored.
    pub fn insert(&mut self, email: &str, name: Option<String>, provenance: Provenance) -> bool {
        let key = normalize_email(email);
        if key.is_empty() {
            return false;
        }
        match self.entries.get_mut(&key) {
            Some(entry) => {
                if entry.name.is_none() {
                    entry.name = name;
                }
                entry.add_provenance(provenance);
                false
            }
            None => {
                self.entries.insert(
                    key.clone(),
                    CustomerIndexEntry {
                        email: key,
                        customer_oid: provenance.customer_oid.clone(),
                        name,
                        provenance: vec![provenance],
                    },
                );
                true
            }
        }
    }

    pub fn get(&self, email: &str) -> Option<&CustomerIndexEntry> {
        self.entries.get(&normalize_email(email))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &CustomerIndexEntry> {
        self.entries.values()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "classification", rename_all = "snake_case")]
pub enum Classification {
    /// Present in the canonical source: correctly synced.
    InManualSource { customer_oid: String },
    /// Present only in other sources: needs manual reconciliation.
    InOtherSource { sources: Vec<Provenance> },
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationKind {
    InManualSource,
    InOtherSource,
    Missing,
}

impl Classification {
    pub fn kind(&self) -> ClassificationKind {
        match self {
            Self::InManualSource { .. } => ClassificationKind::InManualSource,
            Self::InOtherSource { .. } => ClassificationKind::InOtherSource,
            Self::Missing => ClassificationKind::Missing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedContact {
    pub contact: CanonicalContact,
    #[serde(flatten)]
    pub classification: Classification,
}

/// Classifications for one run, one per email. A later row for an email
/// replaces the earlier result in place, so CSV order is kept.
#[derive(Debug, Clone, Default)]
pub struct ClassificationSet {
    items: Vec<ClassifiedContact>,
    positions: HashMap<String, usize>,
    duplicates: usize,
    found: u64,
    found_elsewhere: u64,
    missing: u64,
}

impl ClassificationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, classified: ClassifiedContact) {
        let key = normalize_email(&classified.contact.email);
        self.bump(classified.classification.kind(), true);
        match self.positions.get(&key) {
            Some(&idx) => {
                let previous = self.items[idx].classification.kind();
                self.bump(previous, false);
                self.items[idx] = classified;
                self.duplicates += 1;
            }
            None => {
                self.positions.insert(key, self.items.len());
                self.items.push(classified);
            }
        }
    }

    fn bump(&mut self, kind: ClassificationKind, up: bool) {
        let slot = match kind {
            ClassificationKind::InManualSource => &mut self.found,
            ClassificationKind::InOtherSource => &mut self.found_elsewhere,
            ClassificationKind::Missing => &mut self.missing,
        };
        if up {
            *slot += 1;
        } else {
            *slot = slot.saturating_sub(1);
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    pub fn items(&self) -> &[ClassifiedContact] {
        &self.items
    }

    pub fn counter_update(&self) -> CounterUpdate {
        CounterUpdate {
            found: Some(self.found),
            missing: Some(self.missing),
            found_elsewhere: Some(self.found_elsewhere),
            ..CounterUpdate::default()
        }
    }

    /// Records to persist: everything not confirmed as correctly synced.
    pub fn missing_users(&self) -> Vec<NewMissingUser> {
        self.items
            .iter()
            .filter_map(|item| match &item.classification {
                Classification::InManualSource { .. } => None,
                Classification::InOtherSource { sources } => Some(NewMissingUser {
                    contact: item.contact.clone(),
                    import_status: ImportStatus::FoundInOtherSource,
                    found_sources: sources.clone(),
                    import_notes: Some(format!(
                        "found in other source(s): {}",
                        sources
                            .iter()
                            .map(|s| s.source_id.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    )),
                }),
                Classification::Missing => Some(NewMissingUser {
                    contact: item.contact.clone(),
                    import_status: ImportStatus::Pending,
                    found_sources: Vec::new(),
                    import_notes: None,
                }),
            })
            .collect()
    }

    pub fn into_results(self) -> RunResults {
        let mut results = RunResults::default();
        for item in self.items {
            match item.classification {
                Classification::InManualSource { .. } => results.found.push(item),
                Classification::InOtherSource { .. } => results.found_elsewhere.push(item),
                Classification::Missing => results.missing.push(item.contact),
            }
        }
        results
    }
}

/// The three persisted result sets of a completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResults {
    pub found: Vec<ClassifiedContact>,
    pub found_elsewhere: Vec<ClassifiedContact>,
    pub missing: Vec<CanonicalContact>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    Pending,
    Importing,
    Imported,
    Failed,
    FoundInOtherSource,
}

impl ImportStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Importing => "importing",
            Self::Imported => "imported",
            Self::Failed => "failed",
            Self::FoundInOtherSource => "found_in_other_source",
        }
    }

    /// Only `pending` and `failed` records may start an import.
    pub fn can_start_import(self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }
}

impl FromStr for ImportStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "importing" => Ok(Self::Importing),
            "imported" => Ok(Self::Imported),
            "failed" => Ok(Self::Failed),
            "found_in_other_source" => Ok(Self::FoundInOtherSource),
            other => Err(UnknownVariant {
                kind: "import status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMissingUser {
    pub contact: CanonicalContact,
    pub import_status: ImportStatus,
    pub found_sources: Vec<Provenance>,
    pub import_notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingUserRecord {
    pub id: Uuid,
    pub comparison_run_id: Uuid,
    pub contact: CanonicalContact,
    pub import_status: ImportStatus,
    pub remote_customer_id: Option<String>,
    /// True when this record's import created the customer rather than reusing one.
    #[serde(default)]
    pub customer_created: bool,
    pub remote_subscription_id: Option<String>,
    pub import_error: Option<String>,
    pub import_notes: Option<String>,
    pub found_sources: Vec<Provenance>,
    pub imported_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MissingUserRecord {
    pub fn from_new(comparison_run_id: Uuid, new_user: NewMissingUser, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            comparison_run_id,
            contact: new_user.contact,
            import_status: new_user.import_status,
            remote_customer_id: None,
            customer_created: false,
            remote_subscription_id: None,
            import_error: None,
            import_notes: new_user.import_notes,
            found_sources: new_user.found_sources,
            imported_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mark_importing(&mut self, now: DateTime<Utc>) {
        self.import_status = ImportStatus::Importing;
        self.import_error = None;
        self.updated_at = now;
    }

    /// An `importing` record untouched for `stale_after` was abandoned mid-import
    /// (crash, or a lost final write) and may be picked up again.
    pub fn is_stale_import(&self, now: DateTime<Utc>, stale_after: std::time::Duration) -> bool {
        self.import_status == ImportStatus::Importing
            && now
                .signed_duration_since(self.updated_at)
                .to_std()
                .is_ok_and(|idle| idle >= stale_after)
    }

    pub fn mark_imported(&mut self, notes: Option<String>, now: DateTime<Utc>) {
        self.import_status = ImportStatus::Imported;
        self.import_error = None;
        self.import_notes = notes;
        self.imported_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.import_status = ImportStatus::Failed;
        self.import_error = Some(error.into());
        self.updated_at = now;
    }

    /// Undo an import: back to `pending` with remote ids cleared, contact data kept.
    pub fn reset_to_pending(&mut self, now: DateTime<Utc>) {
        self.import_status = ImportStatus::Pending;
        self.remote_customer_id = None;
        self.customer_created = false;
        self.remote_subscription_id = None;
        self.import_error = None;
        self.imported_at = None;
        self.updated_at = now;
    }
}

/// Remote plan as resolved by find-or-create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanDescriptor {
    pub oid: String,
    pub name: String,
    pub interval: String,
    pub interval_count: u32,
    pub amount_cents: i64,
    pub currency: String,
}

/// Deterministic remote object id, so repeating a create cannot mint a second object.
pub fn deterministic_oid(prefix: &str, parts: &[&str]) -> String {
    let joined = parts.join(":");
    let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, joined.as_bytes());
    format!("{prefix}_{}", id.simple())
}
