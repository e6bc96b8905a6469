use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::schedule::error::TaskError;
use crate::schedule::types::TaskStats;
use crate::storage::task::TaskStore;

/// Dashboard figures, computed by the store in one snapshot read.
#[derive(Clone)]
pub struct StatsAggregator {
    store: Arc<dyn TaskStore>,
}

impl StatsAggregator {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    pub async fn snapshot(&self) -> Result<TaskStats, TaskError> {
        self.store.aggregate_stats(Utc::now() - Duration::hours(24)).await
    }
}
