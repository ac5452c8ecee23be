use std::sync::Arc;

use dashmap::DashMap;
use redis::AsyncCommands;

use crate::error::{Error, ErrorDetails};

/// Connect to Redis for the quota stores.
///
/// The resulting connection is multiplexed and cheap to clone; the counter
/// store and the subscription source share one.
pub async fn connect(redis_url: &str) -> Result<redis::aio::MultiplexedConnection, Error> {
    let client = redis::Client::open(redis_url).map_err(|e| {
        Error::new(ErrorDetails::AppState {
            message: format!("Failed to create Redis client: {e}"),
        })
    })?;
    client
        .get_multiplexed_tokio_connection()
        .await
        .map_err(|e| {
            Error::new(ErrorDetails::AppState {
                message: format!("Failed to connect to Redis: {e}"),
            })
        })
}

/// Per-user request counter.
///
/// One integer per user, keyed `usage:{user_id}`, created implicitly on the
/// first increment and never deleted. The increment is a single Redis `INCR`,
/// so concurrent writers cannot lose counts. The check in the quota gate is a
/// separate read, so two in-flight requests from one user can both observe
/// `limit - 1` and pass; that race is a documented limitation.
#[derive(Clone)]
pub enum UsageStore {
    Production {
        connection: redis::aio::MultiplexedConnection,
    },
    /// In-process counters for development without Redis. Reset on restart.
    Ephemeral { counts: Arc<DashMap<String, u64>> },
    /// Test-only stand-in. `healthy: false` makes every operation fail to
    /// exercise the deny-on-store-failure path.
    Mock {
        counts: Arc<DashMap<String, u64>>,
        healthy: bool,
    },
}

fn usage_key(user_id: &str) -> String {
    format!("usage:{user_id}")
}

impl UsageStore {
    pub fn new_ephemeral() -> Self {
        UsageStore::Ephemeral {
            counts: Arc::new(DashMap::new()),
        }
    }

    pub fn new_mock(healthy: bool) -> Self {
        UsageStore::Mock {
            counts: Arc::new(DashMap::new()),
            healthy,
        }
    }

    /// Read the user's request count. Missing records read as zero.
    pub async fn count(&self, user_id: &str) -> Result<u64, Error> {
        match self {
            UsageStore::Production { connection } => {
                let mut connection = connection.clone();
                let count: Option<u64> =
                    connection.get(usage_key(user_id)).await.map_err(|e| {
                        Error::new(ErrorDetails::UsageStore {
                            message: format!("Failed to read usage record for {user_id}: {e}"),
                        })
                    })?;
                Ok(count.unwrap_or(0))
            }
            UsageStore::Ephemeral { counts } => {
                Ok(counts.get(user_id).map(|count| *count).unwrap_or(0))
            }
            UsageStore::Mock { counts, healthy } => {
                if !healthy {
                    return Err(Error::new(ErrorDetails::UsageStore {
                        message: "Mock usage store is unhealthy".to_string(),
                    }));
                }
                Ok(counts.get(user_id).map(|count| *count).unwrap_or(0))
            }
        }
    }

    /// Increment the user's request count by one and return the new count.
    pub async fn increment(&self, user_id: &str) -> Result<u64, Error> {
        match self {
            UsageStore::Production { connection } => {
                let mut connection = connection.clone();
                connection.incr(usage_key(user_id), 1u64).await.map_err(|e| {
                    Error::new(ErrorDetails::UsageStore {
                        message: format!("Failed to increment usage record for {user_id}: {e}"),
                    })
                })
            }
            UsageStore::Ephemeral { counts } => {
                let mut entry = counts.entry(user_id.to_string()).or_insert(0);
                *entry += 1;
                Ok(*entry)
            }
            UsageStore::Mock { counts, healthy } => {
                if !healthy {
                    return Err(Error::new(ErrorDetails::UsageStore {
                        message: "Mock usage store is unhealthy".to_string(),
                    }));
                }
                let mut entry = counts.entry(user_id.to_string()).or_insert(0);
                *entry += 1;
                Ok(*entry)
            }
        }
    }

    /// Seed a count directly. Test setup only.
    pub fn set_count(&self, user_id: &str, count: u64) {
        match self {
            UsageStore::Ephemeral { counts } | UsageStore::Mock { counts, .. } => {
                counts.insert(user_id.to_string(), count);
            }
            UsageStore::Production { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ephemeral_store_counts_from_zero() {
        let store = UsageStore::new_ephemeral();
        assert_eq!(store.count("user_1").await.unwrap(), 0);

        assert_eq!(store.increment("user_1").await.unwrap(), 1);
        assert_eq!(store.increment("user_1").await.unwrap(), 2);
        assert_eq!(store.count("user_1").await.unwrap(), 2);

        // Other users are unaffected
        assert_eq!(store.count("user_2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unhealthy_mock_fails_both_operations() {
        let store = UsageStore::new_mock(false);
        assert!(store.count("user_1").await.is_err());
        assert!(store.increment("user_1").await.is_err());
    }

    #[tokio::test]
    async fn test_set_count_seeds_reads() {
        let store = UsageStore::new_mock(true);
        store.set_count("user_1", 5);
        assert_eq!(store.count("user_1").await.unwrap(), 5);
        assert_eq!(store.increment("user_1").await.unwrap(), 6);
    }

    #[test]
    fn test_usage_key_format() {
        assert_eq!(usage_key("user_2abc"), "usage:user_2abc");
    }
}
