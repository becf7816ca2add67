//! Shared metrics recording for `SQLite` backends.

use std::time::Instant;

/// Records operation count and latency for a storage operation.
///
/// Emits `storage_operations_total` and `storage_operation_duration_ms`,
/// both labelled by backend, operation and status.
pub fn record_operation_metrics(
    backend: &'static str,
    operation: &'static str,
    start: Instant,
    status: &'static str,
) {
    metrics::counter!(
        "storage_operations_total",
        "backend" => backend,
        "operation" => operation,
        "status" => status
    )
    .increment(1);
    metrics::histogram!(
        "storage_operation_duration_ms",
        "backend" => backend,
        "operation" => operation,
        "status" => status
    )
    .record(start.elapsed().as_secs_f64() * 1000.0);
}

/// Records metrics for a finished operation from its result.
pub fn record_result<T, E>(
    backend: &'static str,
    operation: &'static str,
    start: Instant,
    result: &Result<T, E>,
) {
    let status = if result.is_ok() { "success" } else { "error" };
    record_operation_metrics(backend, operation, start, status);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_result_statuses() {
        let start = Instant::now();
        let ok: Result<(), ()> = Ok(());
        let err: Result<(), ()> = Err(());
        record_result("sqlite", "patch_entity", start, &ok);
        record_result("sqlite", "patch_entity", start, &err);
        record_operation_metrics("sqlite", "search", start, "success");
    }
}
