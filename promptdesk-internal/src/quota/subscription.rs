use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use moka::future::Cache;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};

/// Subscription statuses that exempt a user from the free-tier counter.
const ACTIVE_STATUSES: [&str; 2] = ["active", "trialing"];

/// Per-user subscription record, written to `subscription:{user_id}` by the
/// billing service and read-only here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub status: String,
    #[serde(default)]
    pub current_period_end: Option<DateTime<Utc>>,
}

impl SubscriptionRecord {
    /// Whether this record currently exempts the user from metering.
    pub fn is_active(&self) -> bool {
        if !ACTIVE_STATUSES.contains(&self.status.as_str()) {
            return false;
        }
        match self.current_period_end {
            Some(period_end) => period_end > Utc::now(),
            None => true,
        }
    }
}

fn subscription_key(user_id: &str) -> String {
    format!("subscription:{user_id}")
}

/// Where subscription records are read from.
#[derive(Clone)]
pub enum SubscriptionSource {
    Production {
        connection: redis::aio::MultiplexedConnection,
    },
    /// In-process records for development and tests.
    Ephemeral {
        records: Arc<DashMap<String, SubscriptionRecord>>,
    },
}

impl SubscriptionSource {
    pub fn new_ephemeral() -> Self {
        SubscriptionSource::Ephemeral {
            records: Arc::new(DashMap::new()),
        }
    }

    /// Insert a record into an ephemeral source. Test setup only.
    pub fn set_record(&self, user_id: &str, record: SubscriptionRecord) {
        if let SubscriptionSource::Ephemeral { records } = self {
            records.insert(user_id.to_string(), record);
        }
    }

    async fn fetch(&self, user_id: &str) -> Result<Option<SubscriptionRecord>, Error> {
        match self {
            SubscriptionSource::Production { connection } => {
                let mut connection = connection.clone();
                let data: Option<String> = connection
                    .get(subscription_key(user_id))
                    .await
                    .map_err(|e| {
                        Error::new(ErrorDetails::Subscription {
                            message: format!(
                                "Failed to read subscription record for {user_id}: {e}"
                            ),
                        })
                    })?;
                match data {
                    Some(data) => {
                        let record: SubscriptionRecord =
                            serde_json::from_str(&data).map_err(|e| {
                                Error::new(ErrorDetails::Subscription {
                                    message: format!(
                                        "Failed to parse subscription record for {user_id}: {e}"
                                    ),
                                })
                            })?;
                        Ok(Some(record))
                    }
                    None => Ok(None),
                }
            }
            SubscriptionSource::Ephemeral { records } => {
                Ok(records.get(user_id).map(|record| record.clone()))
            }
        }
    }
}

/// Determines whether a user's paid plan exempts them from metering.
///
/// Lookups go through a short-lived cache so a burst of requests from one
/// user costs a single record fetch. A plan change can therefore take up to
/// the cache TTL to be observed.
pub struct SubscriptionChecker {
    source: SubscriptionSource,
    cache: Cache<String, bool>,
}

impl SubscriptionChecker {
    pub fn new(source: SubscriptionSource, cache_ttl_ms: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(std::time::Duration::from_millis(cache_ttl_ms))
            .build();
        Self { source, cache }
    }

    /// Whether the user currently has an active subscription.
    ///
    /// Read failures degrade to "not subscribed" rather than failing the
    /// request; the usage counter then decides. Failures are not cached.
    pub async fn is_active(&self, user_id: &str) -> bool {
        if let Some(active) = self.cache.get(user_id).await {
            return active;
        }

        match self.source.fetch(user_id).await {
            Ok(record) => {
                let active = record.map(|record| record.is_active()).unwrap_or(false);
                self.cache.insert(user_id.to_string(), active).await;
                active
            }
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    "Treating user as unsubscribed after subscription lookup failure: {e}"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn record(status: &str, period_end: Option<DateTime<Utc>>) -> SubscriptionRecord {
        SubscriptionRecord {
            status: status.to_string(),
            current_period_end: period_end,
        }
    }

    #[test]
    fn test_record_active_within_period() {
        let rec = record("active", Some(Utc::now() + Duration::days(7)));
        assert!(rec.is_active());
    }

    #[test]
    fn test_record_trialing_counts_as_active() {
        let rec = record("trialing", None);
        assert!(rec.is_active());
    }

    #[test]
    fn test_record_expired_period_is_inactive() {
        let rec = record("active", Some(Utc::now() - Duration::days(1)));
        assert!(!rec.is_active());
    }

    #[test]
    fn test_record_canceled_is_inactive() {
        let rec = record("canceled", Some(Utc::now() + Duration::days(7)));
        assert!(!rec.is_active());
    }

    #[test]
    fn test_record_parses_billing_json() {
        let rec: SubscriptionRecord = serde_json::from_str(
            r#"{"status": "active", "current_period_end": "2099-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(rec.is_active());

        // Records without a period end are valid
        let rec: SubscriptionRecord = serde_json::from_str(r#"{"status": "canceled"}"#).unwrap();
        assert!(!rec.is_active());
    }

    #[tokio::test]
    async fn test_checker_without_record_is_inactive() {
        let checker = SubscriptionChecker::new(SubscriptionSource::new_ephemeral(), 30_000);
        assert!(!checker.is_active("user_1").await);
    }

    #[tokio::test]
    async fn test_checker_with_active_record() {
        let source = SubscriptionSource::new_ephemeral();
        source.set_record("user_1", record("active", None));

        let checker = SubscriptionChecker::new(source, 30_000);
        assert!(checker.is_active("user_1").await);
        assert!(!checker.is_active("user_2").await);
    }

    #[tokio::test]
    async fn test_checker_caches_lookups() {
        let source = SubscriptionSource::new_ephemeral();
        let checker = SubscriptionChecker::new(source.clone(), 30_000);

        // First lookup caches "inactive"; a record appearing later is not
        // observed until the TTL expires.
        assert!(!checker.is_active("user_1").await);
        source.set_record("user_1", record("active", None));
        assert!(!checker.is_active("user_1").await);
    }
}
