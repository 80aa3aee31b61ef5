//! Typed client for the billing-data aggregator: sources, customers, plans and
//! subscriptions behind a paginated, rate-limited JSON API.

use async_trait::async_trait;
use bcr_core::normalize_email;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod http;
mod rate_limit;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use http::{AggregatorConfig, AggregatorEnvironment, HttpAggregatorClient};
pub use rate_limit::RequestLimiter;

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{op} returned http {status}: {body}")]
    Status {
        op: &'static str,
        status: u16,
        body: String,
    },
    #[error("{op} response did not match the expected schema: {message}")]
    Decode { op: &'static str, message: String },
    #[error("invalid aggregator url: {0}")]
    Url(String),
    #[error("invalid aggregator configuration: {0}")]
    Config(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub provider: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCustomer {
    pub oid: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub created: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanAmount {
    pub currency: String,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePlan {
    pub oid: String,
    pub name: String,
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub interval_count: Option<u32>,
    #[serde(default)]
    pub amounts: Vec<PlanAmount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSubscription {
    pub oid: String,
    pub customer_oid: String,
    pub plan_oid: String,
    #[serde(default)]
    pub started_at: Option<i64>,
}

/// One page of a list endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub has_more: bool,
}

/// Paging or search parameters for a list call. Pages are 0-based.
///
/// With a search term the remote filters server-side and page parameters are
/// not sent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListQuery {
    pub page: u32,
    pub per_page: u32,
    pub search: Option<String>,
}

impl ListQuery {
    pub fn page(page: u32, per_page: u32) -> Self {
        Self {
            page,
            per_page,
            search: None,
        }
    }

    pub fn search(term: impl Into<String>) -> Self {
        Self {
            search: Some(term.into()),
            ..Self::default()
        }
    }

    pub fn search_term(&self) -> Option<&str> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewCustomer {
    pub oid: String,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewPlan {
    pub oid: String,
    pub name: String,
    pub currency: String,
    pub amount: i64,
    pub interval: String,
    pub interval_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewSubscription {
    pub oid: String,
    pub customer_oid: String,
    pub plan_oid: String,
    pub started_at: i64,
}

/// Operations the reconciler needs from the aggregator.
///
/// HTTP failures come back as [`AggregatorError::Status`]; nothing is retried
/// here, callers decide whether to skip, abort or continue.
#[async_trait]
pub trait AggregatorApi: Send + Sync {
    async fn list_sources(&self) -> Result<Vec<Source>, AggregatorError>;

    async fn list_customers(
        &self,
        source_id: &str,
        query: &ListQuery,
    ) -> Result<Paged<RemoteCustomer>, AggregatorError>;

    async fn list_subscriptions(
        &self,
        source_id: &str,
        query: &ListQuery,
    ) -> Result<Paged<RemoteSubscription>, AggregatorError>;

    async fn list_plans(
        &self,
        source_id: &str,
        query: &ListQuery,
    ) -> Result<Paged<RemotePlan>, AggregatorError>;

    async fn create_customer(
        &self,
        source_id: &str,
        customer: &NewCustomer,
    ) -> Result<RemoteCustomer, AggregatorError>;

    async fn delete_customer(&self, source_id: &str, oid: &str) -> Result<(), AggregatorError>;

    async fn create_plan(&self, source_id: &str, plan: &NewPlan)
        -> Result<RemotePlan, AggregatorError>;

    async fn create_subscription(
        &self,
        source_id: &str,
        subscription: &NewSubscription,
    ) -> Result<RemoteSubscription, AggregatorError>;

    async fn delete_subscription(&self, source_id: &str, oid: &str)
        -> Result<(), AggregatorError>;
}

/// Search a source for a customer whose email equals `email` after normalization.
pub async fn find_customer_by_email<A>(
    api: &A,
    source_id: &str,
    email: &str,
) -> Result<Option<RemoteCustomer>, AggregatorError>
where
    A: AggregatorApi + ?Sized,
{
    let wanted = normalize_email(email);
    if wanted.is_empty() {
        return Ok(None);
    }
    let page = api
        .list_customers(source_id, &ListQuery::search(wanted.clone()))
        .await?;
    Ok(page.items.into_iter().find(|c| {
        c.email
            .as_deref()
            .is_some_and(|e| normalize_email(e) == wanted)
    }))
}

fn plan_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Search a source for a plan whose name equals `name`, ignoring case and surrounding space.
pub async fn find_plan_by_name<A>(
    api: &A,
    source_id: &str,
    name: &str,
) -> Result<Option<RemotePlan>, AggregatorError>
where
    A: AggregatorApi + ?Sized,
{
    let wanted = plan_key(name);
    if wanted.is_empty() {
        return Ok(None);
    }
    let page = api
        .list_plans(source_id, &ListQuery::search(name.trim()))
        .await?;
    Ok(page.items.into_iter().find(|p| plan_key(&p.name) == wanted))
}

/// Walk the subscription pages of a source looking for `oid`, at most `max_pages` pages.
pub async fn find_subscription<A>(
    api: &A,
    source_id: &str,
    oid: &str,
    per_page: u32,
    max_pages: u32,
) -> Result<Option<RemoteSubscription>, AggregatorError>
where
    A: AggregatorApi + ?Sized,
{
    for page in 0..max_pages {
        let batch = api
            .list_subscriptions(source_id, &ListQuery::page(page, per_page))
            .await?;
        if let Some(found) = batch.items.into_iter().find(|s| s.oid == oid) {
            return Ok(Some(found));
        }
        if !batch.has_more {
            break;
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, FakeAggregator};

    #[test]
    fn search_term_ignores_blank_input() {
        assert_eq!(ListQuery::search("  ").search_term(), None);
        assert_eq!(ListQuery::search(" a@x.com ").search_term(), Some("a@x.com"));
        assert_eq!(ListQuery::page(2, 50).search_term(), None);
    }

    #[tokio::test]
    async fn customer_lookup_requires_exact_email() {
        let fake = FakeAggregator::new()
            .with_source("src-1", "baremetrics")
            .with_customer("src-1", "c1", "alice@x.com.au", "Alice AU")
            .with_customer("src-1", "c2", "Alice@X.com", "Alice");

        let found = find_customer_by_email(&fake, "src-1", " ALICE@x.com ")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.oid, "c2");

        assert!(find_customer_by_email(&fake, "src-1", "bob@x.com")
            .await
            .unwrap()
            .is_none());
        assert!(fake.calls().iter().all(|c| matches!(
            c,
            Call::ListCustomers { search: Some(_), .. }
        )));
    }

    #[tokio::test]
    async fn plan_lookup_matches_whole_name() {
        let fake = FakeAggregator::new().with_source("src-1", "baremetrics");
        fake.create_plan(
            "src-1",
            &NewPlan {
                oid: "p1".into(),
                name: "Annual Membership Plus".into(),
                currency: "USD".into(),
                amount: 0,
                interval: "year".into(),
                interval_count: 1,
            },
        )
        .await
        .unwrap();

        assert!(find_plan_by_name(&fake, "src-1", "Annual Membership")
            .await
            .unwrap()
            .is_none());
        let plan = find_plan_by_name(&fake, "src-1", "annual membership plus ")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(plan.oid, "p1");
    }

    #[tokio::test]
    async fn subscription_lookup_pages_until_found() {
        let fake = FakeAggregator::new()
            .with_source("src-1", "baremetrics")
            .with_subscription("src-1", "s1", "c1", "p1")
            .with_subscription("src-1", "s2", "c1", "p1")
            .with_subscription("src-1", "s3", "c2", "p1");

        let found = find_subscription(&fake, "src-1", "s3", 2, 10).await.unwrap().unwrap();
        assert_eq!(found.customer_oid, "c2");
        assert_eq!(fake.count_calls(|c| matches!(c, Call::ListSubscriptions { .. })), 2);

        assert!(find_subscription(&fake, "src-1", "s3", 2, 1).await.unwrap().is_none());
        assert!(find_subscription(&fake, "src-1", "nope", 2, 10).await.unwrap().is_none());
    }
}
