//! Bulk provisioning of missing users into the canonical source.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bcr_aggregator::{
    find_customer_by_email, find_plan_by_name, find_subscription, AggregatorApi, AggregatorError, ListQuery,
    NewCustomer, NewPlan, NewSubscription, RemotePlan,
};
use bcr_core::{deterministic_oid, ImportStatus, MissingUserRecord, PlanDescriptor, UnknownVariant};
use bcr_storage::{MissingUserFilter, PlanCache, RunStore, StoreError, MAX_PER_PAGE};
use chrono::{NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportMode {
    /// Customer only.
    #[default]
    Simple,
    /// Customer, plan inferred from tags, and a subscription.
    WithPlan,
}

impl fmt::Display for ImportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Simple => "simple",
            Self::WithPlan => "with_plan",
        })
    }
}

impl FromStr for ImportMode {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "simple" => Ok(Self::Simple),
            "with_plan" | "plan" => Ok(Self::WithPlan),
            other => Err(UnknownVariant {
                kind: "import mode",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("missing user {0} not found")]
    NotFound(Uuid),
    #[error("missing user {0} exists in another source and is not imported")]
    FoundInOtherSource(Uuid),
    #[error("missing user {0} is already being imported")]
    InProgress(Uuid),
    #[error("import of missing user {id} failed: {source}")]
    Remote {
        id: Uuid,
        #[source]
        source: AggregatorError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn default_interval() -> String {
    "month".to_string()
}

fn default_interval_count() -> u32 {
    1
}

fn default_currency() -> String {
    "USD".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanRule {
    pub plan_name: String,
    pub contains_any: Vec<String>,
    #[serde(default = "default_interval")]
    pub interval: String,
    #[serde(default = "default_interval_count")]
    pub interval_count: u32,
    #[serde(default)]
    pub amount_cents: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

#[derive(Debug, Deserialize)]
struct PlanRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<PlanRule>,
}

/// Ordered tag-to-plan table; the first rule with a matching needle wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRules {
    rules: Vec<PlanRule>,
}

impl Default for PlanRules {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PlanRules {
    pub fn new(rules: Vec<PlanRule>) -> Self {
        Self { rules }
    }

    pub fn builtin() -> Self {
        let rule = |name: &str, needles: &[&str], interval: &str| PlanRule {
            plan_name: name.to_string(),
            contains_any: needles.iter().map(|n| n.to_string()).collect(),
            interval: interval.to_string(),
            interval_count: 1,
            amount_cents: 0,
            currency: default_currency(),
        };
        Self::new(vec![
            rule("Annual Membership", &["plan_annual", "annual", "yearly"], "year"),
            rule("Monthly Membership", &["plan_monthly", "monthly"], "month"),
        ])
    }

    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        let file: PlanRulesFile = serde_yaml::from_str(text).context("parsing plan rules")?;
        Ok(Self::new(file.rules))
    }

    /// Rules from `path`, or the built-in table when the file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::builtin());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn rules(&self) -> &[PlanRule] {
        &self.rules
    }

    pub fn infer(&self, tags: &str) -> Option<&PlanRule> {
        let tags = tags.to_lowercase();
        if tags.trim().is_empty() {
            return None;
        }
        self.rules.iter().find(|rule| {
            rule.contains_any
                .iter()
                .any(|needle| tags.contains(&needle.to_lowercase()))
        })
    }
}

fn descriptor(plan: RemotePlan, rule: &PlanRule) -> PlanDescriptor {
    let amount = plan.amounts.first();
    PlanDescriptor {
        amount_cents: amount.map(|a| a.amount).unwrap_or(rule.amount_cents),
        currency: amount
            .map(|a| a.currency.clone())
            .unwrap_or_else(|| rule.currency.clone()),
        interval: plan.interval.unwrap_or_else(|| rule.interval.clone()),
        interval_count: plan.interval_count.unwrap_or(rule.interval_count),
        oid: plan.oid,
        name: plan.name,
    }
}

/// Find-or-create for plans: cache, then remote lookup by name, then create.
#[derive(Clone)]
pub struct PlanResolver {
    api: Arc<dyn AggregatorApi>,
    cache: PlanCache,
}

impl PlanResolver {
    pub fn new(api: Arc<dyn AggregatorApi>, cache: PlanCache) -> Self {
        Self { api, cache }
    }

    pub async fn find_or_create(
        &self,
        source_id: &str,
        rule: &PlanRule,
    ) -> Result<PlanDescriptor, AggregatorError> {
        if let Some(plan) = self.cache.get(source_id, &rule.plan_name) {
            return Ok(plan);
        }

        let plan = match find_plan_by_name(self.api.as_ref(), source_id, &rule.plan_name).await? {
            Some(found) => descriptor(found, rule),
            None => {
                let key = rule.plan_name.trim().to_lowercase();
                let new_plan = NewPlan {
                    oid: deterministic_oid("plan", &[source_id, &key]),
                    name: rule.plan_name.trim().to_string(),
                    currency: rule.currency.clone(),
                    amount: rule.amount_cents,
                    interval: rule.interval.clone(),
                    interval_count: rule.interval_count,
                };
                match self.api.create_plan(source_id, &new_plan).await {
                    Ok(created) => {
                        info!(source_id, plan = %created.name, oid = %created.oid, "plan created");
                        descriptor(created, rule)
                    }
                    // Someone else created it between our lookup and create.
                    Err(err @ AggregatorError::Status { status: 409 | 422, .. }) => {
                        match find_plan_by_name(self.api.as_ref(), source_id, &rule.plan_name)
                            .await?
                        {
                            Some(found) => descriptor(found, rule),
                            None => return Err(err),
                        }
                    }
                    Err(err) => return Err(err),
                }
            }
        };
        self.cache.insert(source_id, plan.clone());
        Ok(plan)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionSettings {
    /// Source that receives created customers, plans and subscriptions.
    pub target_source_id: String,
    pub page_size: u32,
    pub max_pages: u32,
    /// An `importing` record idle this long is treated as abandoned and retried.
    pub stale_import_after: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

fn date_timestamp(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp()
}

fn join_notes(notes: Vec<String>) -> Option<String> {
    if notes.is_empty() {
        None
    } else {
        Some(notes.join("; "))
    }
}

fn ignore_not_found(result: Result<(), AggregatorError>) -> Result<(), AggregatorError> {
    match result {
        Err(AggregatorError::Status { status: 404, .. }) => Ok(()),
        other => other,
    }
}

pub struct Provisioner {
    api: Arc<dyn AggregatorApi>,
    store: Arc<dyn RunStore>,
    resolver: PlanResolver,
    rules: PlanRules,
    settings: ProvisionSettings,
}

impl Provisioner {
    pub fn new(
        api: Arc<dyn AggregatorApi>,
        store: Arc<dyn RunStore>,
        cache: PlanCache,
        rules: PlanRules,
        settings: ProvisionSettings,
    ) -> Self {
        Self {
            resolver: PlanResolver::new(api.clone(), cache),
            api,
            store,
            rules,
            settings,
        }
    }

    pub fn resolver(&self) -> &PlanResolver {
        &self.resolver
    }

    /// Import one record. A remote failure leaves the record `failed` with the
    /// aggregator's message and is also returned to the caller.
    pub async fn import_user(
        &self,
        id: Uuid,
        mode: ImportMode,
    ) -> Result<MissingUserRecord, ProvisionError> {
        let mut record = self
            .store
            .get_missing_user(id)
            .await?
            .ok_or(ProvisionError::NotFound(id))?;
        match record.import_status {
            ImportStatus::FoundInOtherSource => return Err(ProvisionError::FoundInOtherSource(id)),
            ImportStatus::Importing
                if !record.is_stale_import(Utc::now(), self.settings.stale_import_after) =>
            {
                return Err(ProvisionError::InProgress(id));
            }
            ImportStatus::Importing => {
                warn!(%id, since = %record.updated_at, "resuming abandoned import");
            }
            ImportStatus::Imported => {
                info!(%id, "already imported; skipping");
                return Ok(record);
            }
            ImportStatus::Pending | ImportStatus::Failed => {}
        }

        record.mark_importing(Utc::now());
        self.store.save_missing_user(&record).await?;

        let span = info_span!("import_user", %id, %mode, email = %record.contact.email);
        match self.provision(&mut record, mode).instrument(span).await {
            Ok(notes) => {
                record.mark_imported(notes, Utc::now());
                self.store.save_missing_user(&record).await?;
                info!(%id, customer = ?record.remote_customer_id, "imported");
                Ok(record)
            }
            Err(err) => {
                let message = match &err {
                    ProvisionError::Remote { source, .. } => source.to_string(),
                    other => other.to_string(),
                };
                warn!(%id, error = %message, "import failed");
                record.mark_failed(message, Utc::now());
                self.store.save_missing_user(&record).await?;
                Err(err)
            }
        }
    }

    fn new_customer(&self, record: &MissingUserRecord) -> NewCustomer {
        let contact = &record.contact;
        let details = [contact.company.as_deref(), contact.phone.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>();
        NewCustomer {
            oid: deterministic_oid("cust", &[&self.settings.target_source_id, &contact.email]),
            name: contact.name.clone(),
            email: contact.email.clone(),
            notes: (!details.is_empty()).then(|| details.join(" / ")),
            created: contact.created_on.map(date_timestamp),
        }
    }

    async fn provision(
        &self,
        record: &mut MissingUserRecord,
        mode: ImportMode,
    ) -> Result<Option<String>, ProvisionError> {
        let id = record.id;
        let remote = |source: AggregatorError| ProvisionError::Remote { id, source };
        let target = self.settings.target_source_id.as_str();
        let mut notes = Vec::new();

        let customer_oid = match record.remote_customer_id.clone() {
            Some(oid) => oid,
            None => {
                let existing = find_customer_by_email(self.api.as_ref(), target, &record.contact.email)
                    .await
                    .map_err(remote)?;
                let (oid, created) = match existing {
                    Some(customer) => {
                        notes.push(format!("reused existing customer {}", customer.oid));
                        (customer.oid, false)
                    }
                    None => {
                        let customer = self
                            .api
                            .create_customer(target, &self.new_customer(record))
                            .await
                            .map_err(remote)?;
                        (customer.oid, true)
                    }
                };
                record.remote_customer_id = Some(oid.clone());
                record.customer_created = created;
                self.store.save_missing_user(record).await?;
                oid
            }
        };

        if mode == ImportMode::Simple {
            return Ok(join_notes(notes));
        }

        let tags = record.contact.tags.as_deref().unwrap_or_default();
        let Some(rule) = self.rules.infer(tags) else {
            notes.push("no plan matched tags; imported without subscription".to_string());
            return Ok(join_notes(notes));
        };
        let plan = self
            .resolver
            .find_or_create(target, rule)
            .await
            .map_err(remote)?;

        let subscription = NewSubscription {
            oid: deterministic_oid("sub", &[target, &customer_oid, &plan.oid]),
            customer_oid,
            plan_oid: plan.oid.clone(),
            started_at: record
                .contact
                .created_on
                .map(date_timestamp)
                .unwrap_or_else(|| Utc::now().timestamp()),
        };
        let created = match self.api.create_subscription(target, &subscription).await {
            Ok(created) => created,
            // An earlier attempt may have reached the remote before failing locally.
            Err(err @ AggregatorError::Status { status: 409 | 422, .. }) => {
                let existing = find_subscription(
                    self.api.as_ref(),
                    target,
                    &subscription.oid,
                    self.settings.page_size,
                    self.settings.max_pages,
                )
                .await
                .map_err(remote)?;
                match existing {
                    Some(found) if found.customer_oid == subscription.customer_oid => {
                        info!(oid = %found.oid, "adopted subscription from an earlier attempt");
                        found
                    }
                    _ => return Err(remote(err)),
                }
            }
            Err(err) => return Err(remote(err)),
        };
        record.remote_subscription_id = Some(created.oid);
        notes.push(format!("subscribed to {}", plan.name));
        Ok(join_notes(notes))
    }

    async fn records_with_status(
        &self,
        run_id: Uuid,
        status: ImportStatus,
    ) -> Result<Vec<MissingUserRecord>, StoreError> {
        let mut filter = MissingUserFilter {
            per_page: MAX_PER_PAGE,
            ..MissingUserFilter::with_status(status)
        };
        let mut records = Vec::new();
        loop {
            let page = self.store.list_missing_users(run_id, &filter).await?;
            records.extend(page.items);
            if filter.page >= page.total_pages {
                break;
            }
            filter.page += 1;
        }
        Ok(records)
    }

    /// Import every pending record of a run, plus abandoned `importing` ones,
    /// one at a time, continuing past failures.
    pub async fn import_all_pending(
        &self,
        run_id: Uuid,
        mode: ImportMode,
    ) -> Result<BulkSummary, ProvisionError> {
        let mut pending = self
            .records_with_status(run_id, ImportStatus::Pending)
            .await?;
        let now = Utc::now();
        pending.extend(
            self.records_with_status(run_id, ImportStatus::Importing)
                .await?
                .into_iter()
                .filter(|r| r.is_stale_import(now, self.settings.stale_import_after)),
        );
        let mut summary = BulkSummary::default();
        for record in pending {
            summary.attempted += 1;
            match self.import_user(record.id, mode).await {
                Ok(_) => summary.succeeded += 1,
                Err(ProvisionError::Remote { .. }) => summary.failed += 1,
                Err(ProvisionError::Store(err)) => return Err(err.into()),
                Err(err) => {
                    warn!(id = %record.id, error = %err, "record skipped");
                    summary.skipped += 1;
                }
            }
        }
        info!(%run_id, ?summary, "bulk import finished");
        Ok(summary)
    }

    /// Subscriptions of the target source grouped by customer oid. Scan errors end the scan.
    async fn subscriptions_by_customer(&self) -> HashMap<String, Vec<String>> {
        let target = self.settings.target_source_id.as_str();
        let mut by_customer: HashMap<String, Vec<String>> = HashMap::new();
        for page in 0..self.settings.max_pages {
            let batch = match self
                .api
                .list_subscriptions(target, &ListQuery::page(page, self.settings.page_size))
                .await
            {
                Ok(batch) => batch,
                Err(err) => {
                    warn!(page, error = %err, "subscription scan stopped");
                    break;
                }
            };
            for sub in batch.items {
                by_customer.entry(sub.customer_oid).or_default().push(sub.oid);
            }
            if !batch.has_more {
                break;
            }
        }
        by_customer
    }

    /// Remote objects this record's import owns. A reused customer and its other
    /// subscriptions are left alone; only the recorded subscription goes.
    async fn revert(
        &self,
        record: &MissingUserRecord,
        subscriptions: &HashMap<String, Vec<String>>,
    ) -> Result<(), AggregatorError> {
        let target = self.settings.target_source_id.as_str();
        let owned_customer = record
            .remote_customer_id
            .as_ref()
            .filter(|_| record.customer_created);
        let mut sub_oids = record.remote_subscription_id.iter().cloned().collect::<Vec<_>>();
        if let Some(found) = owned_customer.and_then(|c| subscriptions.get(c)) {
            for oid in found {
                if !sub_oids.contains(oid) {
                    sub_oids.push(oid.clone());
                }
            }
        }
        for oid in &sub_oids {
            ignore_not_found(self.api.delete_subscription(target, oid).await)?;
        }
        if let Some(customer) = owned_customer {
            ignore_not_found(self.api.delete_customer(target, customer).await)?;
        }
        Ok(())
    }

    /// Undo every `imported` record of a run: remote subscriptions, then the
    /// customer when the import created it, then back to `pending`. Records whose undo fails stay
    /// `imported` with the failure noted in `import_error`.
    pub async fn delete_imported_users(&self, run_id: Uuid) -> Result<BulkSummary, ProvisionError> {
        let imported = self
            .records_with_status(run_id, ImportStatus::Imported)
            .await?;
        let mut summary = BulkSummary::default();
        if imported.is_empty() {
            return Ok(summary);
        }

        let subscriptions = if imported.iter().any(|r| r.customer_created) {
            self.subscriptions_by_customer().await
        } else {
            HashMap::new()
        };
        for mut record in imported {
            summary.attempted += 1;
            match self.revert(&record, &subscriptions).await {
                Ok(()) => {
                    record.reset_to_pending(Utc::now());
                    summary.succeeded += 1;
                }
                Err(err) => {
                    warn!(id = %record.id, error = %err, "undo failed");
                    record.import_error = Some(format!("undo failed: {err}"));
                    record.updated_at = Utc::now();
                    summary.failed += 1;
                }
            }
            self.store.save_missing_user(&record).await?;
        }
        info!(%run_id, ?summary, "imported users deleted");
        Ok(summary)
    }
}
