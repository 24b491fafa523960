pub const RECORDS_INGESTED: &str = "gf_records_ingested_total";
pub const RECORDS_PROCESSED: &str = "gf_records_processed_total";
pub const RECORDS_DROPPED: &str = "gf_records_dropped_total";
pub const RECORDS_DEDUPED: &str = "gf_records_deduped_total";
pub const RECORDS_JOINED: &str = "gf_records_joined_total";
pub const RECORDS_SUNK: &str = "gf_records_sunk_total";
pub const DLQ_WRITES: &str = "gf_dlq_writes_total";
pub const BATCH_SIZE: &str = "gf_batch_size";
pub const PROCESS_BATCH_TIME: &str = "gf_process_batch_ms";
pub const SINK_FLUSH_TIME: &str = "gf_sink_flush_ms";
pub const SINK_INSERT_FAILURES: &str = "gf_sink_insert_failures_total";
pub const BATCH_NAKS: &str = "gf_batch_naks_total";
