use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::{
    AggregatorApi, AggregatorError, ListQuery, NewCustomer, NewPlan, NewSubscription, Paged,
    RemoteCustomer, RemotePlan, RemoteSubscription, RequestLimiter, Source,
};

pub const SANDBOX_BASE_URL: &str = "https://api-sandbox.baremetrics.com/v1";
pub const PRODUCTION_BASE_URL: &str = "https://api.baremetrics.com/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AggregatorEnvironment {
    #[default]
    Sandbox,
    Production,
}

impl AggregatorEnvironment {
    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::Sandbox => SANDBOX_BASE_URL,
            Self::Production => PRODUCTION_BASE_URL,
        }
    }
}

impl fmt::Display for AggregatorEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sandbox => "sandbox",
            Self::Production => "production",
        })
    }
}

impl FromStr for AggregatorEnvironment {
    type Err = AggregatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sandbox" => Ok(Self::Sandbox),
            "production" | "live" => Ok(Self::Production),
            other => Err(AggregatorError::Config(format!(
                "unknown aggregator environment `{other}`"
            ))),
        }
    }
}

/// Everything the HTTP client needs, fixed at construction.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub environment: AggregatorEnvironment,
    pub base_url: Option<String>,
    pub api_key: String,
    pub requests_per_second: u32,
    pub timeout: Duration,
    pub user_agent: String,
}

impl AggregatorConfig {
    pub fn new(environment: AggregatorEnvironment, api_key: impl Into<String>) -> Self {
        Self {
            environment,
            base_url: None,
            api_key: api_key.into(),
            requests_per_second: 4,
            timeout: Duration::from_secs(30),
            user_agent: "bcr/0.1".to_string(),
        }
    }

    pub fn effective_base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.environment.default_base_url())
    }
}

#[derive(Debug, Deserialize)]
struct SourcesResponse {
    sources: Vec<Source>,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct ResponseMeta {
    pagination: Pagination,
}

#[derive(Debug, Deserialize)]
struct CustomersResponse {
    customers: Vec<RemoteCustomer>,
    #[serde(default)]
    meta: Option<ResponseMeta>,
}

#[derive(Debug, Deserialize)]
struct PlansResponse {
    plans: Vec<RemotePlan>,
    #[serde(default)]
    meta: Option<ResponseMeta>,
}

#[derive(Debug, Deserialize)]
struct OidRef {
    oid: String,
}

#[derive(Debug, Deserialize)]
struct WireSubscription {
    oid: String,
    customer: OidRef,
    plan: OidRef,
    #[serde(default)]
    started_at: Option<i64>,
}

impl From<WireSubscription> for RemoteSubscription {
    fn from(wire: WireSubscription) -> Self {
        Self {
            oid: wire.oid,
            customer_oid: wire.customer.oid,
            plan_oid: wire.plan.oid,
            started_at: wire.started_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SubscriptionsResponse {
    subscriptions: Vec<WireSubscription>,
    #[serde(default)]
    meta: Option<ResponseMeta>,
}

#[derive(Debug, Deserialize)]
struct CustomerEnvelope {
    customer: RemoteCustomer,
}

#[derive(Debug, Deserialize)]
struct PlanEnvelope {
    plan: RemotePlan,
}

#[derive(Debug, Deserialize)]
struct SubscriptionEnvelope {
    subscription: WireSubscription,
}

fn has_more(meta: &Option<ResponseMeta>) -> bool {
    meta.as_ref().is_some_and(|m| m.pagination.has_more)
}

fn decode<T: DeserializeOwned>(op: &'static str, body: &str) -> Result<T, AggregatorError> {
    serde_json::from_str(body).map_err(|err| AggregatorError::Decode {
        op,
        message: err.to_string(),
    })
}

fn append_list_query(url: &mut Url, query: &ListQuery, sorted: bool) {
    let mut pairs = url.query_pairs_mut();
    match query.search_term() {
        Some(term) => {
            pairs.append_pair("search", term);
        }
        None => {
            pairs
                .append_pair("page", &query.page.to_string())
                .append_pair("per_page", &query.per_page.to_string());
        }
    }
    if sorted {
        pairs.append_pair("sort", "created").append_pair("order", "asc");
    }
}

#[derive(Debug)]
pub struct HttpAggregatorClient {
    client: reqwest::Client,
    base: Url,
    api_key: String,
    limiter: RequestLimiter,
}

impl HttpAggregatorClient {
    pub fn new(config: &AggregatorConfig) -> Result<Self, AggregatorError> {
        let base_url = config.effective_base_url();
        let base = Url::parse(base_url)
            .map_err(|err| AggregatorError::Url(format!("{base_url}: {err}")))?;
        if base.cannot_be_a_base() {
            return Err(AggregatorError::Url(format!("{base_url} cannot carry a path")));
        }
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            base,
            api_key: config.api_key.clone(),
            limiter: RequestLimiter::per_second(config.requests_per_second),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    async fn throttle(&self, op: &'static str) {
        let waited = self.limiter.acquire().await;
        if !waited.is_zero() {
            debug!(op, waited_ms = waited.as_millis() as u64, "rate limited");
        }
    }

    fn url(&self, segments: &[&str]) -> Result<Url, AggregatorError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| AggregatorError::Url(format!("{} cannot carry a path", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn list_url(
        &self,
        source_id: &str,
        resource: &str,
        query: &ListQuery,
        sorted: bool,
    ) -> Result<Url, AggregatorError> {
        let mut url = self.url(&[source_id, resource])?;
        append_list_query(&mut url, query, sorted);
        Ok(url)
    }

    async fn get(&self, op: &'static str, url: Url) -> Result<String, AggregatorError> {
        self.throttle(op).await;
        debug!(op, %url, "aggregator request");
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(AggregatorError::Status {
                op,
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    /// Send a mutating request. Any failure is logged with the full request and response.
    async fn mutate<B: Serialize + ?Sized>(
        &self,
        op: &'static str,
        source_id: &str,
        method: Method,
        url: Url,
        payload: Option<&B>,
    ) -> Result<String, AggregatorError> {
        self.throttle(op).await;
        let request_json = payload
            .and_then(|p| serde_json::to_string(p).ok())
            .unwrap_or_default();
        debug!(op, source_id, %url, "aggregator mutation");

        let mut request = self
            .client
            .request(method, url.clone())
            .bearer_auth(&self.api_key);
        if let Some(payload) = payload {
            request = request.json(payload);
        }
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                error!(op, source_id, %url, request = %request_json, error = %err, "aggregator mutation failed");
                return Err(err.into());
            }
        };
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            error!(
                op,
                source_id,
                %url,
                request = %request_json,
                status = status.as_u16(),
                response = %body,
                "aggregator mutation failed"
            );
            return Err(AggregatorError::Status {
                op,
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl AggregatorApi for HttpAggregatorClient {
    async fn list_sources(&self) -> Result<Vec<Source>, AggregatorError> {
        let body = self.get("list_sources", self.url(&["sources"])?).await?;
        Ok(decode::<SourcesResponse>("list_sources", &body)?.sources)
    }

    async fn list_customers(
        &self,
        source_id: &str,
        query: &ListQuery,
    ) -> Result<Paged<RemoteCustomer>, AggregatorError> {
        let url = self.list_url(source_id, "customers", query, true)?;
        let body = self.get("list_customers", url).await?;
        let parsed: CustomersResponse = decode("list_customers", &body)?;
        Ok(Paged {
            has_more: has_more(&parsed.meta),
            items: parsed.customers,
        })
    }

    async fn list_subscriptions(
        &self,
        source_id: &str,
        query: &ListQuery,
    ) -> Result<Paged<RemoteSubscription>, AggregatorError> {
        let url = self.list_url(source_id, "subscriptions", query, false)?;
        let body = self.get("list_subscriptions", url).await?;
        let parsed: SubscriptionsResponse = decode("list_subscriptions", &body)?;
        Ok(Paged {
            has_more: has_more(&parsed.meta),
            items: parsed.subscriptions.into_iter().map(Into::into).collect(),
        })
    }

    async fn list_plans(
        &self,
        source_id: &str,
        query: &ListQuery,
    ) -> Result<Paged<RemotePlan>, AggregatorError> {
        let url = self.list_url(source_id, "plans", query, false)?;
        let body = self.get("list_plans", url).await?;
        let parsed: PlansResponse = decode("list_plans", &body)?;
        Ok(Paged {
            has_more: has_more(&parsed.meta),
            items: parsed.plans,
        })
    }

    async fn create_customer(
        &self,
        source_id: &str,
        customer: &NewCustomer,
    ) -> Result<RemoteCustomer, AggregatorError> {
        let url = self.url(&[source_id, "customers"])?;
        let body = self
            .mutate("create_customer", source_id, Method::POST, url, Some(customer))
            .await?;
        Ok(decode::<CustomerEnvelope>("create_customer", &body)?.customer)
    }

    async fn delete_customer(&self, source_id: &str, oid: &str) -> Result<(), AggregatorError> {
        let url = self.url(&[source_id, "customers", oid])?;
        self.mutate::<()>("delete_customer", source_id, Method::DELETE, url, None)
            .await?;
        Ok(())
    }

    async fn create_plan(
        &self,
        source_id: &str,
        plan: &NewPlan,
    ) -> Result<RemotePlan, AggregatorError> {
        let url = self.url(&[source_id, "plans"])?;
        let body = self
            .mutate("create_plan", source_id, Method::POST, url, Some(plan))
            .await?;
        Ok(decode::<PlanEnvelope>("create_plan", &body)?.plan)
    }

    async fn create_subscription(
        &self,
        source_id: &str,
        subscription: &NewSubscription,
    ) -> Result<RemoteSubscription, AggregatorError> {
        let url = self.url(&[source_id, "subscriptions"])?;
        let body = self
            .mutate(
                "create_subscription",
                source_id,
                Method::POST,
                url,
                Some(subscription),
            )
            .await?;
        Ok(decode::<SubscriptionEnvelope>("create_subscription", &body)?
            .subscription
            .into())
    }

    async fn delete_subscription(
        &self,
        source_id: &str,
        oid: &str,
    ) -> Result<(), AggregatorError> {
        let url = self.url(&[source_id, "subscriptions", oid])?;
        self.mutate::<()>("delete_subscription", source_id, Method::DELETE, url, None)
            .await?;
        Ok(())
    }
}
