//! Customer index builder: one pass over every enumerable source.

use anyhow::{Context, Result};
use bcr_aggregator::{AggregatorApi, ListQuery, Source};
use bcr_core::{CounterUpdate, CustomerIndex, Provenance};
use tracing::{info, info_span, warn, Instrument};

use crate::progress::{self, ProgressTracker};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSettings {
    /// Providers resolved by per-email search instead of enumeration. Compared case-insensitively.
    pub bulk_unsuitable_providers: Vec<String>,
    pub page_size: u32,
    pub max_pages: u32,
    pub max_customers: usize,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            bulk_unsuitable_providers: vec!["stripe".to_string()],
            page_size: 100,
            max_pages: 100,
            max_customers: 10_000,
        }
    }
}

impl IndexSettings {
    pub fn is_bulk_unsuitable(&self, source: &Source) -> bool {
        self.bulk_unsuitable_providers
            .iter()
            .any(|p| p.trim().eq_ignore_ascii_case(source.provider.trim()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceOutcome {
    Exhausted,
    /// Stopped at the page or customer cap.
    Capped,
    /// A page failed; pages merged before it are kept.
    PageFailed { page: u32, error: String },
    /// Left for per-email search during reconciliation.
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceReport {
    pub source_id: String,
    pub provider: String,
    pub pages: u32,
    /// Every customer fetched; this is what the customer cap counts.
    pub customers: usize,
    /// Fetched customers with no email, left out of the index.
    pub without_email: usize,
    pub outcome: SourceOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct IndexOutcome {
    pub index: CustomerIndex,
    pub sources: Vec<Source>,
    pub deferred: Vec<Source>,
    pub reports: Vec<SourceReport>,
}

async fn index_source(
    api: &dyn AggregatorApi,
    settings: &IndexSettings,
    source: &Source,
    index: &mut CustomerIndex,
) -> SourceReport {
    let mut report = SourceReport {
        source_id: source.id.clone(),
        provider: source.provider.clone(),
        pages: 0,
        customers: 0,
        without_email: 0,
        outcome: SourceOutcome::Exhausted,
    };

    let mut page = 0u32;
    loop {
        if page >= settings.max_pages {
            warn!(pages = page, "page cap reached; treating source as exhausted");
            report.outcome = SourceOutcome::Capped;
            break;
        }
        let result = api
            .list_customers(&source.id, &ListQuery::page(page, settings.page_size))
            .await;
        let batch = match result {
            Ok(batch) => batch,
            Err(err) => {
                warn!(page, error = %err, "customer page failed; skipping rest of source");
                report.outcome = SourceOutcome::PageFailed {
                    page,
                    error: err.to_string(),
                };
                break;
            }
        };
        report.pages += 1;
        for customer in batch.items {
            report.customers += 1;
            let Some(email) = customer.email.as_deref() else {
                report.without_email += 1;
                continue;
            };
            index.insert(
                email,
                customer.name.clone(),
                Provenance {
                    source_id: source.id.clone(),
                    provider: source.provider.clone(),
                    customer_oid: customer.oid.clone(),
                },
            );
        }
        if report.customers >= settings.max_customers {
            warn!(
                customers = report.customers,
                "customer cap reached; treating source as exhausted"
            );
            report.outcome = SourceOutcome::Capped;
            break;
        }
        if !batch.has_more {
            break;
        }
        page += 1;
    }
    report
}

/// Enumerate every source except the bulk-unsuitable ones into a fresh index.
///
/// Failing to list sources fails the build. A failing page only ends its own
/// source.
pub async fn build_index(
    api: &dyn AggregatorApi,
    settings: &IndexSettings,
    tracker: &ProgressTracker,
) -> Result<IndexOutcome> {
    let sources = api.list_sources().await.context("listing aggregator sources")?;
    tracker
        .step(
            format!("Fetched {} sources", sources.len()),
            progress::SOURCES_FETCHED,
        )
        .await?;

    let mut outcome = IndexOutcome::default();
    let total = sources.len();
    for (i, source) in sources.iter().enumerate() {
        let span = info_span!("index_source", source_id = %source.id, provider = %source.provider);
        let report = if settings.is_bulk_unsuitable(source) {
            info!(parent: &span, "deferring bulk-unsuitable source to per-email search");
            outcome.deferred.push(source.clone());
            SourceReport {
                source_id: source.id.clone(),
                provider: source.provider.clone(),
                pages: 0,
                customers: 0,
                without_email: 0,
                outcome: SourceOutcome::Deferred,
            }
        } else {
            let report = index_source(api, settings, source, &mut outcome.index)
                .instrument(span.clone())
                .await;
            info!(
                parent: &span,
                pages = report.pages,
                customers = report.customers,
                without_email = report.without_email,
                outcome = ?report.outcome,
                "source indexed"
            );
            report
        };
        outcome.reports.push(report);

        tracker
            .counters(
                format!("Indexed source {} ({}/{})", source.id, i + 1, total),
                progress::scaled(progress::INDEX_START, progress::INDEX_END, i + 1, total),
                CounterUpdate {
                    total_remote: Some(outcome.index.len() as u64),
                    ..CounterUpdate::default()
                },
            )
            .await?;
    }
    outcome.sources = sources;

    tracker
        .counters(
            format!("Index built with {} customers", outcome.index.len()),
            progress::INDEX_BUILT,
            CounterUpdate {
                total_remote: Some(outcome.index.len() as u64),
                ..CounterUpdate::default()
            },
        )
        .await?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use bcr_aggregator::testing::{Call, FakeAggregator};
    use bcr_core::NewComparisonRun;
    use bcr_storage::{MemoryRunStore, RunStore};

    async fn tracker() -> (Arc<dyn RunStore>, ProgressTracker) {
        let store: Arc<dyn RunStore> = Arc::new(MemoryRunStore::new());
        let run = store
            .create_run(NewComparisonRun {
                name: "index".into(),
                source_file: "x.csv".into(),
            })
            .await
            .unwrap();
        let tracker = ProgressTracker::new(store.clone(), run.id);
        (store, tracker)
    }

    fn settings(page_size: u32) -> IndexSettings {
        IndexSettings {
            page_size,
            ..IndexSettings::default()
        }
    }

    #[tokio::test]
    async fn merges_provenance_across_sources() {
        let fake = FakeAggregator::new()
            .with_source("manual", "baremetrics")
            .with_source("src-2", "recurly")
            .with_customer("manual", "c1", "Alice@X.com", "Alice")
            .with_customer("src-2", "c9", "alice@x.com", "Alice B")
            .with_customer("src-2", "c10", "bob@x.com", "Bob");
        let (store, tracker) = tracker().await;

        let outcome = build_index(&fake, &settings(1), &tracker).await.unwrap();

        assert_eq!(outcome.index.len(), 2);
        let alice = outcome.index.get("alice@x.com").unwrap();
        assert_eq!(alice.provenance.len(), 2);
        assert_eq!(alice.customer_oid, "c1");
        assert!(outcome.deferred.is_empty());

        let run = store.get_run(tracker.run_id()).await.unwrap().unwrap();
        assert_eq!(run.counters.total_remote, 2);
        assert_eq!(run.progress_percentage, 30);
    }

    #[tokio::test]
    async fn bulk_unsuitable_sources_are_not_enumerated() {
        let fake = FakeAggregator::new()
            .with_source("manual", "baremetrics")
            .with_source("stripe-1", "Stripe")
            .with_customer("stripe-1", "s1", "carol@x.com", "Carol");
        let (_store, tracker) = tracker().await;

        let outcome = build_index(&fake, &settings(10), &tracker).await.unwrap();

        assert!(outcome.index.get("carol@x.com").is_none());
        assert_eq!(outcome.deferred.len(), 1);
        assert_eq!(outcome.reports[1].outcome, SourceOutcome::Deferred);
        assert_eq!(
            fake.count_calls(|c| matches!(c, Call::ListCustomers { source_id, .. } if source_id == "stripe-1")),
            0
        );
    }

    #[tokio::test]
    async fn caps_stop_a_source_without_failing() {
        let mut fake = FakeAggregator::new()
            .with_source("big", "baremetrics")
            .with_source("small", "baremetrics")
            .with_customer("small", "s1", "small@x.com", "S");
        for i in 0..10 {
            fake = fake.with_customer("big", &format!("b{i}"), &format!("b{i}@x.com"), "B");
        }
        let (_store, tracker) = tracker().await;

        let by_pages = IndexSettings {
            page_size: 2,
            max_pages: 3,
            ..IndexSettings::default()
        };
        let outcome = build_index(&fake, &by_pages, &tracker).await.unwrap();
        assert_eq!(outcome.reports[0].outcome, SourceOutcome::Capped);
        assert_eq!(outcome.reports[0].pages, 3);
        assert_eq!(outcome.index.len(), 7);

        let by_customers = IndexSettings {
            page_size: 4,
            max_customers: 4,
            ..IndexSettings::default()
        };
        let outcome = build_index(&fake, &by_customers, &tracker).await.unwrap();
        assert_eq!(outcome.reports[0].outcome, SourceOutcome::Capped);
        assert_eq!(outcome.reports[0].customers, 4);
        assert!(outcome.index.get("small@x.com").is_some());
    }

    #[tokio::test]
    async fn customers_without_email_count_toward_the_cap() {
        let mut fake = FakeAggregator::new().with_source("legacy", "baremetrics");
        for i in 0..20 {
            fake = fake.with_customer_without_email("legacy", &format!("anon{i}"));
        }
        fake = fake.with_customer("legacy", "late", "late@x.com", "Late");
        let (_store, tracker) = tracker().await;

        let capped = IndexSettings {
            page_size: 2,
            max_customers: 4,
            ..IndexSettings::default()
        };
        let outcome = build_index(&fake, &capped, &tracker).await.unwrap();

        let report = &outcome.reports[0];
        assert_eq!(report.outcome, SourceOutcome::Capped);
        assert_eq!(report.pages, 2);
        assert_eq!(report.customers, 4);
        assert_eq!(report.without_email, 4);
        assert!(outcome.index.is_empty());
    }

    #[tokio::test]
    async fn source_listing_failure_is_fatal() {
        let fake = FakeAggregator::new().failing_list_sources();
        let (_store, tracker) = tracker().await;
        let err = build_index(&fake, &settings(10), &tracker).await.unwrap_err();
        assert!(format!("{err:#}").contains("listing aggregator sources"));
    }
}
