use serde::Serialize;

/// One periodic memory diagnostic. Sizes are bytes; deltas may be negative.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryReport {
    pub worker: String,
    pub exchange: String,
    pub delta_since_last: i64,
    pub delta_since_start: i64,
    pub window_processed: u64,
    pub total_processed: u64,
    pub per_message: f64,
}
