use anyhow::Result;
use bcr_aggregator::{find_customer_by_email, AggregatorApi, Source};
use bcr_core::{
    CanonicalContact, Classification, ClassificationSet, ClassifiedContact, CounterUpdate,
    CustomerIndex, Provenance,
};
use tracing::{debug, warn};

use crate::progress::{self, ProgressTracker};

/// Canonical provenance wins; otherwise every sighting is reported, unordered by priority.
pub fn classify_provenance(canonical_source_id: &str, provenance: &[Provenance]) -> Classification {
    match provenance.iter().find(|p| p.source_id == canonical_source_id) {
        Some(p) => Classification::InManualSource {
            customer_oid: p.customer_oid.clone(),
        },
        None if provenance.is_empty() => Classification::Missing,
        None => Classification::InOtherSource {
            sources: provenance.to_vec(),
        },
    }
}

pub struct Reconciler<'a> {
    api: &'a dyn AggregatorApi,
    index: &'a CustomerIndex,
    deferred: &'a [Source],
    canonical_source_id: &'a str,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        api: &'a dyn AggregatorApi,
        index: &'a CustomerIndex,
        deferred: &'a [Source],
        canonical_source_id: &'a str,
    ) -> Self {
        Self {
            api,
            index,
            deferred,
            canonical_source_id,
        }
    }

    /// Index first, then a live search of each deferred source. A failed search
    /// counts as "not seen there".
    pub async fn classify(&self, contact: &CanonicalContact) -> Classification {
        if let Some(entry) = self.index.get(&contact.email) {
            return classify_provenance(self.canonical_source_id, &entry.provenance);
        }

        let mut seen = Vec::new();
        for source in self.deferred {
            match find_customer_by_email(self.api, &source.id, &contact.email).await {
                Ok(Some(customer)) => seen.push(Provenance {
                    source_id: source.id.clone(),
                    provider: source.provider.clone(),
                    customer_oid: customer.oid,
                }),
                Ok(None) => {}
                Err(err) => {
                    warn!(source_id = %source.id, email = %contact.email, error = %err, "live search failed");
                }
            }
        }
        classify_provenance(self.canonical_source_id, &seen)
    }

    /// Classify every contact in order, reporting progress every `batch` contacts.
    pub async fn run(
        &self,
        contacts: &[CanonicalContact],
        tracker: &ProgressTracker,
        batch: usize,
    ) -> Result<ClassificationSet> {
        let batch = batch.max(1);
        let total = contacts.len();
        let mut set = ClassificationSet::new();

        for (i, contact) in contacts.iter().enumerate() {
            let classification = self.classify(contact).await;
            debug!(email = %contact.email, kind = ?classification.kind(), "classified");
            set.record(ClassifiedContact {
                contact: contact.clone(),
                classification,
            });

            let done = i + 1;
            if done % batch == 0 || done == total {
                tracker
                    .counters(
                        format!("Reconciled {done}/{total} contacts"),
                        progress::scaled(progress::INDEX_BUILT, progress::RECONCILE_END, done, total),
                        set.counter_update(),
                    )
                    .await?;
            }
        }
        if set.duplicates() > 0 {
            warn!(duplicates = set.duplicates(), "duplicate emails in export; last row wins");
        }
        if total == 0 {
            tracker
                .counters(
                    "No contacts to reconcile",
                    progress::RECONCILE_END,
                    CounterUpdate::default(),
                )
                .await?;
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use bcr_aggregator::testing::{Call, FakeAggregator};
    use bcr_core::{ClassificationKind, NewComparisonRun};
    use bcr_storage::{MemoryRunStore, RunStore};

    fn contact(email: &str) -> CanonicalContact {
        CanonicalContact {
            name: "Someone".into(),
            email: email.into(),
            phone: None,
            company: None,
            tags: None,
            created_on: None,
            last_activity_on: None,
        }
    }

    fn prov(source_id: &str, oid: &str) -> Provenance {
        Provenance {
            source_id: source_id.into(),
            provider: "baremetrics".into(),
            customer_oid: oid.into(),
        }
    }

    #[test]
    fn canonical_provenance_wins() {
        let both = [prov("src-2", "c2"), prov("manual", "c1")];
        assert_eq!(
            classify_provenance("manual", &both),
            Classification::InManualSource {
                customer_oid: "c1".into()
            }
        );
        let others = [prov("src-2", "c2"), prov("src-3", "c3")];
        assert_eq!(
            classify_provenance("manual", &others),
            Classification::InOtherSource {
                sources: others.to_vec()
            }
        );
        assert_eq!(classify_provenance("manual", &[]), Classification::Missing);
    }

    #[tokio::test]
    async fn index_miss_falls_back_to_live_search() {
        let fake = FakeAggregator::new()
            .with_source("stripe-1", "stripe")
            .with_source("stripe-2", "stripe")
            .with_customer("stripe-1", "cus_1", "dana@x.com", "Dana")
            .failing_search("stripe-2");
        let mut index = CustomerIndex::new();
        index.insert("erin@x.com", None, prov("manual", "c5"));
        let deferred = vec![
            Source {
                id: "stripe-1".into(),
                provider: "stripe".into(),
            },
            Source {
                id: "stripe-2".into(),
                provider: "stripe".into(),
            },
        ];
        let reconciler = Reconciler::new(&fake, &index, &deferred, "manual");

        let dana = reconciler.classify(&contact("dana@x.com")).await;
        assert_eq!(
            dana,
            Classification::InOtherSource {
                sources: vec![Provenance {
                    source_id: "stripe-1".into(),
                    provider: "stripe".into(),
                    customer_oid: "cus_1".into(),
                }]
            }
        );

        let before = fake.calls().len();
        let erin = reconciler.classify(&contact("erin@x.com")).await;
        assert_eq!(erin.kind(), ClassificationKind::InManualSource);
        assert_eq!(fake.calls().len(), before, "index hits never search");

        let frank = reconciler.classify(&contact("frank@x.com")).await;
        assert_eq!(frank, Classification::Missing);
        assert!(fake
            .calls()
            .contains(&Call::ListCustomers {
                source_id: "stripe-2".into(),
                page: 0,
                search: Some("frank@x.com".into())
            }));
    }

    #[tokio::test]
    async fn every_contact_gets_one_classification() {
        let fake = FakeAggregator::new();
        let mut index = CustomerIndex::new();
        index.insert("a@x.com", None, prov("manual", "c1"));
        index.insert("b@x.com", None, prov("src-2", "c2"));
        let contacts = (0..120)
            .map(|i| match i % 3 {
                0 => contact("a@x.com"),
                1 => contact("b@x.com"),
                _ => contact(&format!("m{i}@x.com")),
            })
            .collect::<Vec<_>>();

        let store: Arc<dyn RunStore> = Arc::new(MemoryRunStore::new());
        let run = store
            .create_run(NewComparisonRun {
                name: "r".into(),
                source_file: "r.csv".into(),
            })
            .await
            .unwrap();
        let tracker = ProgressTracker::new(store.clone(), run.id);

        let set = Reconciler::new(&fake, &index, &[], "manual")
            .run(&contacts, &tracker, 50)
            .await
            .unwrap();

        assert_eq!(set.len(), 42);
        let counts = set.counter_update();
        assert_eq!(
            counts.found.unwrap() + counts.found_elsewhere.unwrap() + counts.missing.unwrap(),
            set.len() as u64
        );
        assert_eq!(counts.missing, Some(40));

        let run = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.progress_percentage, 90);
        assert_eq!(run.counters.missing, 40);
    }
}
