use crate::error::Error;
use crate::quota::store::UsageStore;
use crate::quota::subscription::SubscriptionChecker;
use crate::quota::QuotaDecision;

/// Allow/deny decision for one request, composed from the subscription
/// checker and the usage counter.
///
/// Subscribed users are exempt: their counter is never read or written.
/// Everyone else is allowed while their lifetime count is below the free
/// limit. The caller owns the side effect: after a successful completion on
/// a metered allow, it must call `record_usage` exactly once.
pub struct QuotaGate {
    store: UsageStore,
    subscriptions: SubscriptionChecker,
    free_limit: u64,
}

impl QuotaGate {
    pub fn new(store: UsageStore, subscriptions: SubscriptionChecker, free_limit: u64) -> Self {
        Self {
            store,
            subscriptions,
            free_limit,
        }
    }

    pub fn free_limit(&self) -> u64 {
        self.free_limit
    }

    pub async fn evaluate(&self, user_id: &str) -> QuotaDecision {
        if self.subscriptions.is_active(user_id).await {
            tracing::debug!(user_id = %user_id, "quota check passed: active subscription");
            return QuotaDecision::Allow { metered: false };
        }

        match self.store.count(user_id).await {
            Ok(count) if count < self.free_limit => {
                tracing::debug!(
                    user_id = %user_id,
                    count,
                    free_limit = self.free_limit,
                    "quota check passed"
                );
                QuotaDecision::Allow { metered: true }
            }
            Ok(count) => {
                tracing::warn!(
                    user_id = %user_id,
                    count,
                    free_limit = self.free_limit,
                    "quota check denied"
                );
                QuotaDecision::Deny {
                    reason: "free request limit reached".to_string(),
                }
            }
            // Fail closed: an unreachable counter must not grant unlimited
            // usage. The error was logged on construction.
            Err(_) => QuotaDecision::Deny {
                reason: "unable to verify usage".to_string(),
            },
        }
    }

    /// Record one unit of usage for a metered user.
    pub async fn record_usage(&self, user_id: &str) -> Result<u64, Error> {
        self.store.increment(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use crate::quota::subscription::{SubscriptionRecord, SubscriptionSource};

    use super::*;

    fn checker_with(records: &[(&str, &str)]) -> SubscriptionChecker {
        let source = SubscriptionSource::new_ephemeral();
        for (user_id, status) in records {
            source.set_record(
                user_id,
                SubscriptionRecord {
                    status: status.to_string(),
                    current_period_end: None,
                },
            );
        }
        SubscriptionChecker::new(source, 30_000)
    }

    #[tokio::test]
    async fn test_metered_allow_below_limit() {
        let gate = QuotaGate::new(UsageStore::new_mock(true), checker_with(&[]), 5);

        assert_eq!(
            gate.evaluate("user_1").await,
            QuotaDecision::Allow { metered: true }
        );
    }

    #[tokio::test]
    async fn test_deny_at_limit_without_increment() {
        let store = UsageStore::new_mock(true);
        store.set_count("user_1", 5);
        let gate = QuotaGate::new(store.clone(), checker_with(&[]), 5);

        let decision = gate.evaluate("user_1").await;
        assert!(!decision.is_allowed());
        // Denied requests never mutate the count
        assert_eq!(store.count("user_1").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_subscriber_is_exempt_and_counter_untouched() {
        // The store is unhealthy, so any read or write of the counter would
        // error. A subscribed user must never reach it.
        let gate = QuotaGate::new(
            UsageStore::new_mock(false),
            checker_with(&[("user_pro", "active")]),
            5,
        );

        for _ in 0..20 {
            assert_eq!(
                gate.evaluate("user_pro").await,
                QuotaDecision::Allow { metered: false }
            );
        }
    }

    #[tokio::test]
    async fn test_subscriber_over_limit_is_still_allowed() {
        let store = UsageStore::new_mock(true);
        store.set_count("user_pro", 100);
        let gate = QuotaGate::new(store, checker_with(&[("user_pro", "active")]), 5);

        assert!(gate.evaluate("user_pro").await.is_allowed());
    }

    #[tokio::test]
    async fn test_store_failure_denies_unsubscribed_user() {
        let gate = QuotaGate::new(UsageStore::new_mock(false), checker_with(&[]), 5);

        let decision = gate.evaluate("user_1").await;
        assert_eq!(
            decision,
            QuotaDecision::Deny {
                reason: "unable to verify usage".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_record_usage_increments_once() {
        let store = UsageStore::new_mock(true);
        let gate = QuotaGate::new(store.clone(), checker_with(&[]), 5);

        assert_eq!(gate.record_usage("user_1").await.unwrap(), 1);
        assert_eq!(store.count("user_1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_gate_allows_up_to_limit_exactly() {
        let store = UsageStore::new_mock(true);
        let gate = QuotaGate::new(store, checker_with(&[]), 3);

        for _ in 0..3 {
            assert!(gate.evaluate("user_1").await.is_allowed());
            gate.record_usage("user_1").await.unwrap();
        }
        assert!(!gate.evaluate("user_1").await.is_allowed());
    }
}
