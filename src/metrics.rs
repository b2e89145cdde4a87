//! Metrics for the storage adapter.
//!
//! Metric names are defined here and recorded through the `metrics` facade.
//! Nothing is exported unless the host process installs a recorder, in which
//! case [`describe_metrics`] registers the descriptions with it.

use metrics::{describe_counter, describe_gauge};

// -- Metric name constants ----------------------------------------------------

/// Physical connect calls made by adapters (counter). Labels: outcome.
pub const CONNECTIONS_OPENED_TOTAL: &str = "gridstore_connections_opened_total";

/// Adapters that reused a cache slot instead of connecting (counter).
pub const CACHE_HITS_TOTAL: &str = "gridstore_cache_hits_total";

/// Live connection cache entries (gauge).
pub const CACHE_ENTRIES: &str = "gridstore_cache_entries";

/// Files stored successfully (counter). Labels: bucket.
pub const FILES_STORED_TOTAL: &str = "gridstore_files_stored_total";

/// Bytes stored across all files (counter).
pub const BYTES_STORED_TOTAL: &str = "gridstore_bytes_stored_total";

/// Files removed through rollback or explicit removal (counter).
pub const FILES_REMOVED_TOTAL: &str = "gridstore_files_removed_total";

/// Upload streams that failed (counter).
pub const STREAM_ERRORS_TOTAL: &str = "gridstore_stream_errors_total";

/// Register metric descriptions with the installed recorder.
pub fn describe_metrics() {
    describe_counter!(
        CONNECTIONS_OPENED_TOTAL,
        "Physical backend connect calls by outcome"
    );
    describe_counter!(CACHE_HITS_TOTAL, "Adapters that waited on a shared connection");
    describe_gauge!(CACHE_ENTRIES, "Live connection cache entries");
    describe_counter!(FILES_STORED_TOTAL, "Files stored successfully");
    describe_counter!(BYTES_STORED_TOTAL, "Total bytes stored");
    describe_counter!(FILES_REMOVED_TOTAL, "Files removed from the backend");
    describe_counter!(STREAM_ERRORS_TOTAL, "Failed upload streams");
}
