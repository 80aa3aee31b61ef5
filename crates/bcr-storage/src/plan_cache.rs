use std::time::Duration;

use bcr_core::PlanDescriptor;
use mini_moka::sync::Cache;

/// Resolved plans are reused for a day before the remote is asked again.
pub const DEFAULT_PLAN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Process-wide cache of resolved remote plans keyed by `(source_id, plan name)`.
///
/// Names are compared trimmed and case-folded. Cloning shares the same cache.
#[derive(Clone)]
pub struct PlanCache {
    inner: Cache<(String, String), PlanDescriptor>,
}

impl std::fmt::Debug for PlanCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanCache")
            .field("entries", &self.inner.entry_count())
            .finish()
    }
}

impl Default for PlanCache {
    fn default() -> Self {
        Self::new(DEFAULT_PLAN_TTL)
    }
}

fn key(source_id: &str, plan_name: &str) -> (String, String) {
    (source_id.to_string(), plan_name.trim().to_lowercase())
}

impl PlanCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Cache::builder().max_capacity(1_024).time_to_live(ttl).build(),
        }
    }

    pub fn get(&self, source_id: &str, plan_name: &str) -> Option<PlanDescriptor> {
        self.inner.get(&key(source_id, plan_name))
    }

    pub fn insert(&self, source_id: &str, plan: PlanDescriptor) {
        self.inner.insert(key(source_id, &plan.name), plan);
    }

    pub fn invalidate(&self, source_id: &str, plan_name: &str) {
        self.inner.invalidate(&key(source_id, plan_name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(name: &str) -> PlanDescriptor {
        PlanDescriptor {
            oid: format!("plan_{name}"),
            name: name.into(),
            interval: "month".into(),
            interval_count: 1,
            amount_cents: 0,
            currency: "USD".into(),
        }
    }

    #[test]
    fn lookups_ignore_case_and_whitespace() {
        let cache = PlanCache::default();
        cache.insert("src-1", plan("Monthly Membership"));

        assert_eq!(
            cache.get("src-1", "  monthly membership ").map(|p| p.oid),
            Some("plan_Monthly Membership".to_string())
        );
        assert!(cache.get("src-2", "Monthly Membership").is_none());

        cache.invalidate("src-1", "MONTHLY MEMBERSHIP");
        assert!(cache.get("src-1", "Monthly Membership").is_none());
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = PlanCache::new(Duration::from_millis(20));
        cache.insert("src-1", plan("Annual"));
        assert!(cache.get("src-1", "annual").is_some());
        std::thread::sleep(Duration::from_millis(60));
        assert!(cache.get("src-1", "annual").is_none());
    }
}
