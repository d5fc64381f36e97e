use std::time::Duration;

use serde_json::Value;

use crate::JsonMap;

/// Snapshot of one heap generation, taken from an isolate's `_heaps` entry.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HeapSpace {
    pub used: u64,
    pub capacity: u64,
    pub external: u64,
    pub collections: u64,
    pub total_collection_time_secs: f64,
    pub average_collection_period_millis: f64,
}

impl HeapSpace {
    pub fn from_map(map: &JsonMap) -> Self {
        let int = |key: &str| map.get(key).and_then(Value::as_u64).unwrap_or(0);
        let float = |key: &str| map.get(key).and_then(Value::as_f64).unwrap_or(0.0);
        Self {
            used: int("used"),
            capacity: int("capacity"),
            external: int("external"),
            collections: int("collections"),
            total_collection_time_secs: float("time"),
            average_collection_period_millis: float("avgCollectionPeriodMillis"),
        }
    }

    /// Mean duration of a single collection, rounded up to the microsecond.
    pub fn avg_collection_time(&self) -> Duration {
        let micros =
            self.total_collection_time_secs * 1_000_000.0 / self.collections.max(1) as f64;
        Duration::from_micros(micros.ceil().max(0.0) as u64)
    }

    pub fn avg_collection_period(&self) -> Duration {
        let micros = self.average_collection_period_millis * 1_000.0;
        Duration::from_micros(micros.ceil().max(0.0) as u64)
    }
}
