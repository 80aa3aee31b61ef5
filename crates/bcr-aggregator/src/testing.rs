//! In-memory aggregator that records every call.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::{
    AggregatorApi, AggregatorError, ListQuery, NewCustomer, NewPlan, NewSubscription, PlanAmount,
    Paged, RemoteCustomer, RemotePlan, RemoteSubscription, Source,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ListSources,
    ListCustomers {
        source_id: String,
        page: u32,
        search: Option<String>,
    },
    ListSubscriptions {
        source_id: String,
        page: u32,
    },
    ListPlans {
        source_id: String,
        search: Option<String>,
    },
    CreateCustomer {
        source_id: String,
        oid: String,
    },
    DeleteCustomer {
        source_id: String,
        oid: String,
    },
    CreatePlan {
        source_id: String,
        name: String,
    },
    CreateSubscription {
        source_id: String,
        oid: String,
    },
    DeleteSubscription {
        source_id: String,
        oid: String,
    },
}

#[derive(Debug, Default)]
struct FakeState {
    sources: Vec<Source>,
    customers: HashMap<String, Vec<RemoteCustomer>>,
    plans: HashMap<String, Vec<RemotePlan>>,
    subscriptions: HashMap<String, Vec<RemoteSubscription>>,
    failing_pages: HashSet<(String, u32)>,
    failing_searches: HashSet<String>,
    failing_ops: HashSet<&'static str>,
    fail_list_sources: bool,
    calls: Vec<Call>,
}

/// Aggregator double with configurable failures.
#[derive(Debug, Default)]
pub struct FakeAggregator {
    state: Mutex<FakeState>,
}

fn page_of<T: Clone>(items: &[T], query: &ListQuery) -> Paged<T> {
    let per_page = query.per_page.max(1) as usize;
    let start = query.page as usize * per_page;
    Paged {
        items: items.iter().skip(start).take(per_page).cloned().collect(),
        has_more: start + per_page < items.len(),
    }
}

fn failure(op: &'static str, status: u16, body: impl Into<String>) -> AggregatorError {
    AggregatorError::Status {
        op,
        status,
        body: body.into(),
    }
}

impl FakeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_source(self, id: &str, provider: &str) -> Self {
        self.lock().sources.push(Source {
            id: id.to_string(),
            provider: provider.to_string(),
        });
        self
    }

    pub fn with_customer(self, source_id: &str, oid: &str, email: &str, name: &str) -> Self {
        self.lock()
            .customers
            .entry(source_id.to_string())
            .or_default()
            .push(RemoteCustomer {
                oid: oid.to_string(),
                email: Some(email.to_string()),
                name: Some(name.to_string()),
                notes: None,
                created: None,
            });
        self
    }

    pub fn with_customer_without_email(self, source_id: &str, oid: &str) -> Self {
        self.lock()
            .customers
            .entry(source_id.to_string())
            .or_default()
            .push(RemoteCustomer {
                oid: oid.to_string(),
                email: None,
                name: None,
                notes: None,
                created: None,
            });
        self
    }

    pub fn with_subscription(self, source_id: &str, oid: &str, customer_oid: &str, plan_oid: &str) -> Self {
        self.lock()
            .subscriptions
            .entry(source_id.to_string())
            .or_default()
            .push(RemoteSubscription {
                oid: oid.to_string(),
                customer_oid: customer_oid.to_string(),
                plan_oid: plan_oid.to_string(),
                started_at: None,
            });
        self
    }

    /// Customer page `page` of `source_id` answers with http 500.
    pub fn failing_page(self, source_id: &str, page: u32) -> Self {
        self.lock()
            .failing_pages
            .insert((source_id.to_string(), page));
        self
    }

    /// Customer searches against `source_id` answer with http 500.
    pub fn failing_search(self, source_id: &str) -> Self {
        self.lock().failing_searches.insert(source_id.to_string());
        self
    }

    pub fn failing_list_sources(self) -> Self {
        self.lock().fail_list_sources = true;
        self
    }

    /// Make every call of `op` (for example `"create_plan"`) fail until cleared.
    pub fn fail_op(&self, op: &'static str) {
        self.lock().failing_ops.insert(op);
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.failing_ops.clear();
        state.failing_pages.clear();
        state.failing_searches.clear();
        state.fail_list_sources = false;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn count_calls(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn customers(&self, source_id: &str) -> Vec<RemoteCustomer> {
        self.lock().customers.get(source_id).cloned().unwrap_or_default()
    }

    pub fn plans(&self, source_id: &str) -> Vec<RemotePlan> {
        self.lock().plans.get(source_id).cloned().unwrap_or_default()
    }

    pub fn subscriptions(&self, source_id: &str) -> Vec<RemoteSubscription> {
        self.lock()
            .subscriptions
            .get(source_id)
            .cloned()
            .unwrap_or_default()
    }

    fn check_op(state: &FakeState, op: &'static str) -> Result<(), AggregatorError> {
        if state.failing_ops.contains(op) {
            return Err(failure(op, 500, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl AggregatorApi for FakeAggregator {
    async fn list_sources(&self) -> Result<Vec<Source>, AggregatorError> {
        let mut state = self.lock();
        state.calls.push(Call::ListSources);
        if state.fail_list_sources {
            return Err(failure("list_sources", 503, "unavailable"));
        }
        Ok(state.sources.clone())
    }

    async fn list_customers(
        &self,
        source_id: &str,
        query: &ListQuery,
    ) -> Result<Paged<RemoteCustomer>, AggregatorError> {
        let mut state = self.lock();
        state.calls.push(Call::ListCustomers {
            source_id: source_id.to_string(),
            page: query.page,
            search: query.search_term().map(str::to_string),
        });
        Self::check_op(&state, "list_customers")?;
        let customers = state.customers.get(source_id).cloned().unwrap_or_default();
        match query.search_term() {
            Some(term) => {
                if state.failing_searches.contains(source_id) {
                    return Err(failure("list_customers", 500, "search failed"));
                }
                let term = term.to_lowercase();
                let items = customers
                    .into_iter()
                    .filter(|c| {
                        c.email
                            .as_deref()
                            .is_some_and(|e| e.to_lowercase().contains(&term))
                            || c.name
                                .as_deref()
                                .is_some_and(|n| n.to_lowercase().contains(&term))
                    })
                    .collect();
                Ok(Paged {
                    items,
                    has_more: false,
                })
            }
            None => {
                if state
                    .failing_pages
                    .contains(&(source_id.to_string(), query.page))
                {
                    return Err(failure("list_customers", 500, "page failed"));
                }
                Ok(page_of(&customers, query))
            }
        }
    }

    async fn list_subscriptions(
        &self,
        source_id: &str,
        query: &ListQuery,
    ) -> Result<Paged<RemoteSubscription>, AggregatorError> {
        let mut state = self.lock();
        state.calls.push(Call::ListSubscriptions {
            source_id: source_id.to_string(),
            page: query.page,
        });
        Self::check_op(&state, "list_subscriptions")?;
        let subscriptions = state
            .subscriptions
            .get(source_id)
            .cloned()
            .unwrap_or_default();
        Ok(page_of(&subscriptions, query))
    }

    async fn list_plans(
        &self,
        source_id: &str,
        query: &ListQuery,
    ) -> Result<Paged<RemotePlan>, AggregatorError> {
        let mut state = self.lock();
        state.calls.push(Call::ListPlans {
            source_id: source_id.to_string(),
            search: query.search_term().map(str::to_string),
        });
        Self::check_op(&state, "list_plans")?;
        let plans = state.plans.get(source_id).cloned().unwrap_or_default();
        match query.search_term() {
            Some(term) => {
                let term = term.to_lowercase();
                Ok(Paged {
                    items: plans
                        .into_iter()
                        .filter(|p| p.name.to_lowercase().contains(&term))
                        .collect(),
                    has_more: false,
                })
            }
            None => Ok(page_of(&plans, query)),
        }
    }

    async fn create_customer(
        &self,
        source_id: &str,
        customer: &NewCustomer,
    ) -> Result<RemoteCustomer, AggregatorError> {
        let mut state = self.lock();
        state.calls.push(Call::CreateCustomer {
            source_id: source_id.to_string(),
            oid: customer.oid.clone(),
        });
        Self::check_op(&state, "create_customer")?;
        let existing = state.customers.entry(source_id.to_string()).or_default();
        if existing.iter().any(|c| c.oid == customer.oid) {
            return Err(failure("create_customer", 422, "oid has already been taken"));
        }
        let created = RemoteCustomer {
            oid: customer.oid.clone(),
            email: Some(customer.email.clone()),
            name: Some(customer.name.clone()),
            notes: customer.notes.clone(),
            created: customer.created,
        };
        existing.push(created.clone());
        Ok(created)
    }

    async fn delete_customer(&self, source_id: &str, oid: &str) -> Result<(), AggregatorError> {
        let mut state = self.lock();
        state.calls.push(Call::DeleteCustomer {
            source_id: source_id.to_string(),
            oid: oid.to_string(),
        });
        Self::check_op(&state, "delete_customer")?;
        let customers = state.customers.entry(source_id.to_string()).or_default();
        let before = customers.len();
        customers.retain(|c| c.oid != oid);
        if customers.len() == before {
            return Err(failure("delete_customer", 404, "customer not found"));
        }
        Ok(())
    }

    async fn create_plan(
        &self,
        source_id: &str,
        plan: &NewPlan,
    ) -> Result<RemotePlan, AggregatorError> {
        let mut state = self.lock();
        state.calls.push(Call::CreatePlan {
            source_id: source_id.to_string(),
            name: plan.name.clone(),
        });
        Self::check_op(&state, "create_plan")?;
        let plans = state.plans.entry(source_id.to_string()).or_default();
        if plans.iter().any(|p| p.oid == plan.oid) {
            return Err(failure("create_plan", 422, "oid has already been taken"));
        }
        let created = RemotePlan {
            oid: plan.oid.clone(),
            name: plan.name.clone(),
            interval: Some(plan.interval.clone()),
            interval_count: Some(plan.interval_count),
            amounts: vec![PlanAmount {
                currency: plan.currency.clone(),
                amount: plan.amount,
            }],
        };
        plans.push(created.clone());
        Ok(created)
    }

    async fn create_subscription(
        &self,
        source_id: &str,
        subscription: &NewSubscription,
    ) -> Result<RemoteSubscription, AggregatorError> {
        let mut state = self.lock();
        state.calls.push(Call::CreateSubscription {
            source_id: source_id.to_string(),
            oid: subscription.oid.clone(),
        });
        Self::check_op(&state, "create_subscription")?;
        let subscriptions = state.subscriptions.entry(source_id.to_string()).or_default();
        if subscriptions.iter().any(|s| s.oid == subscription.oid) {
            return Err(failure(
                "create_subscription",
                422,
                "oid has already been taken",
            ));
        }
        let created = RemoteSubscription {
            oid: subscription.oid.clone(),
            customer_oid: subscription.customer_oid.clone(),
            plan_oid: subscription.plan_oid.clone(),
            started_at: Some(subscription.started_at),
        };
        subscriptions.push(created.clone());
        Ok(created)
    }

    async fn delete_subscription(
        &self,
        source_id: &str,
        oid: &str,
    ) -> Result<(), AggregatorError> {
        let mut state = self.lock();
        state.calls.push(Call::DeleteSubscription {
            source_id: source_id.to_string(),
            oid: oid.to_string(),
        });
        Self::check_op(&state, "delete_subscription")?;
        let subscriptions = state.subscriptions.entry(source_id.to_string()).or_default();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.oid != oid);
        if subscriptions.len() == before {
            return Err(failure("delete_subscription", 404, "subscription not found"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pages_are_zero_based_with_has_more() {
        let mut fake = FakeAggregator::new().with_source("src-1", "baremetrics");
        for i in 0..5 {
            fake = fake.with_customer("src-1", &format!("c{i}"), &format!("u{i}@x.com"), "U");
        }
        let first = fake
            .list_customers("src-1", &ListQuery::page(0, 2))
            .await
            .unwrap();
        assert_eq!(first.items[0].oid, "c0");
        assert!(first.has_more);
        let last = fake
            .list_customers("src-1", &ListQuery::page(2, 2))
            .await
            .unwrap();
        assert_eq!(last.items.len(), 1);
        assert!(!last.has_more);
    }

    #[tokio::test]
    async fn injected_failures_surface_as_status_errors() {
        let fake = FakeAggregator::new()
            .with_source("src-1", "baremetrics")
            .failing_page("src-1", 1);
        assert!(fake
            .list_customers("src-1", &ListQuery::page(0, 10))
            .await
            .is_ok());
        let err = fake
            .list_customers("src-1", &ListQuery::page(1, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, AggregatorError::Status { status: 500, .. }));

        fake.fail_op("delete_customer");
        assert!(fake.delete_customer("src-1", "c1").await.is_err());
        fake.clear_failures();
        assert!(fake
            .list_customers("src-1", &ListQuery::page(1, 10))
            .await
            .is_ok());
    }
}
