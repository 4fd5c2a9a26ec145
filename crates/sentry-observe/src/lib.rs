mod log;
mod metrics;

pub use log::{
    now_rfc3339, AccessLog, AccessLogRecord, LineSink, LogLevel, MemorySink, ProxyLog,
    ProxyLogRecord,
};
pub use metrics::{
    HistogramSnapshot, InboundConnectionGauge, MetricsRegistry, RESPONSE_TIME_BUCKETS_MS,
};
