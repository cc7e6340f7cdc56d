use std::time::Duration;

use crate::firestore::local::{LruParams, QueryEngineSettings};
use crate::firestore::model::DatabaseId;
use crate::firestore::remote::RetrySettings;

/// Configuration for one [`FirestoreClient`](crate::firestore::core::FirestoreClient).
#[derive(Clone, Debug, PartialEq)]
pub struct SyncSettings {
    /// Used for document names on the wire and for bloom filter probes.
    pub database_id: DatabaseId,
    pub retry: RetrySettings,
    /// Time the listen stream may stay unconfirmed before listeners are told `Offline`.
    pub online_state_timeout: Duration,
    pub max_watch_stream_failures: u32,
    /// Streams with no targets or no pending writes close after this long.
    pub stream_idle_timeout: Duration,
    /// Batches sent ahead on the write stream.
    pub max_pending_writes: usize,
    pub max_concurrent_limbo_resolutions: usize,
    pub lru: LruParams,
    pub gc_initial_delay: Duration,
    pub gc_regular_delay: Duration,
    pub query_engine: QueryEngineSettings,
}

impl SyncSettings {
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            database_id,
            ..Self::default()
        }
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_online_state_timeout(mut self, timeout: Duration) -> Self {
        self.online_state_timeout = timeout;
        self
    }

    pub fn with_stream_idle_timeout(mut self, timeout: Duration) -> Self {
        self.stream_idle_timeout = timeout;
        self
    }

    pub fn with_max_pending_writes(mut self, max_pending_writes: usize) -> Self {
        self.max_pending_writes = max_pending_writes;
        self
    }

    pub fn with_max_concurrent_limbo_resolutions(mut self, limit: usize) -> Self {
        self.max_concurrent_limbo_resolutions = limit;
        self
    }

    pub fn with_lru(mut self, lru: LruParams) -> Self {
        self.lru = lru;
        self
    }

    pub fn with_gc_delays(mut self, initial: Duration, regular: Duration) -> Self {
        self.gc_initial_delay = initial;
        self.gc_regular_delay = regular;
        self
    }

    pub fn with_query_engine(mut self, query_engine: QueryEngineSettings) -> Self {
        self.query_engine = query_engine;
        self
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            database_id: DatabaseId::default("default"),
            retry: RetrySettings::default(),
            online_state_timeout: Duration::from_secs(10),
            max_watch_stream_failures: 1,
            stream_idle_timeout: Duration::from_secs(60),
            max_pending_writes: 10,
            max_concurrent_limbo_resolutions: 100,
            lru: LruParams::default(),
            gc_initial_delay: Duration::from_secs(60),
            gc_regular_delay: Duration::from_secs(5 * 60),
            query_engine: QueryEngineSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let settings = SyncSettings::new(DatabaseId::default("project"))
            .with_max_concurrent_limbo_resolutions(1)
            .with_lru(LruParams::disabled());
        assert_eq!(settings.database_id.project_id(), "project");
        assert_eq!(settings.max_concurrent_limbo_resolutions, 1);
        assert_eq!(settings.lru, LruParams::disabled());
        assert_eq!(settings.online_state_timeout, Duration::from_secs(10));
        assert_eq!(settings.retry.multiplier, 1.5);
    }
}
