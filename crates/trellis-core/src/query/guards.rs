//! Shared guardrails for run configuration bounds and traversal limits.

pub const MAX_SHARD_COUNT: i64 = 256;
pub const MAX_WORKERS: i64 = 64;
pub const MAX_RESOLUTION_BATCH: i64 = 65_536;
pub const MIN_RESOLUTION_BATCH: i64 = 16;
pub const MAX_WRITE_RETRIES: i64 = 20;
pub const MAX_RETRY_BACKOFF_MS: i64 = 5_000;

// Dead-code analysis
pub const MAX_ENTRY_POINTS: i64 = 10_000;

// SQLite bound-parameter chunk for IN (...) lists.
pub const SQL_IN_CHUNK: usize = 500;

pub fn clamp_int(value: i64, minimum: i64, maximum: i64) -> i64 {
    value.max(minimum).min(maximum)
}

pub fn clamp_workers(value: i64) -> usize {
    clamp_int(value, 1, MAX_WORKERS) as usize
}

pub fn clamp_batch(value: i64) -> usize {
    clamp_int(value, MIN_RESOLUTION_BATCH, MAX_RESOLUTION_BATCH) as usize
}
