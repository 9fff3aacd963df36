use std::fmt::Write as _;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub struct Metrics {
    // Example compilation
    pub examples_compiled_total: AtomicU64,
    pub restrictions_applied_total: AtomicU64,
    pub attributes_skipped_total: AtomicU64,

    // Query execution
    pub queries_executed_total: AtomicU64,
    pub query_duration_ms_total: AtomicU64,

    // CRUD service
    pub entities_written_total: AtomicU64,
    pub entities_deleted_total: AtomicU64,
    pub batch_deleted_rows_total: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            examples_compiled_total: AtomicU64::new(0),
            restrictions_applied_total: AtomicU64::new(0),
            attributes_skipped_total: AtomicU64::new(0),
            queries_executed_total: AtomicU64::new(0),
            query_duration_ms_total: AtomicU64::new(0),
            entities_written_total: AtomicU64::new(0),
            entities_deleted_total: AtomicU64::new(0),
            batch_deleted_rows_total: AtomicU64::new(0),
        }
    }
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::default)
}

pub(crate) fn record_example_compiled() {
    metrics()
        .examples_compiled_total
        .fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_restriction() {
    metrics()
        .restrictions_applied_total
        .fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_attribute_skipped() {
    metrics()
        .attributes_skipped_total
        .fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_query_duration(elapsed: Duration) {
    let m = metrics();
    m.queries_executed_total.fetch_add(1, Ordering::Relaxed);
    m.query_duration_ms_total
        .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
}

pub(crate) fn record_entity_write(count: u64) {
    metrics()
        .entities_written_total
        .fetch_add(count, Ordering::Relaxed);
}

pub(crate) fn record_entity_delete(count: u64) {
    metrics()
        .entities_deleted_total
        .fetch_add(count, Ordering::Relaxed);
}

pub(crate) fn record_batch_delete(rows: u64) {
    metrics()
        .batch_deleted_rows_total
        .fetch_add(rows, Ordering::Relaxed);
}

pub fn render_prometheus() -> String {
    let m = metrics();
    let mut s = String::new();
    let _ = writeln!(
        s,
        "# TYPE examples_compiled_total counter\nexamples_compiled_total {}",
        m.examples_compiled_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE restrictions_applied_total counter\nrestrictions_applied_total {}",
        m.restrictions_applied_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE attributes_skipped_total counter\nattributes_skipped_total {}",
        m.attributes_skipped_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE queries_executed_total counter\nqueries_executed_total {}",
        m.queries_executed_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE query_duration_ms_total counter\nquery_duration_ms_total {}",
        m.query_duration_ms_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE entities_written_total counter\nentities_written_total {}",
        m.entities_written_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE entities_deleted_total counter\nentities_deleted_total {}",
        m.entities_deleted_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE batch_deleted_rows_total counter\nbatch_deleted_rows_total {}",
        m.batch_deleted_rows_total.load(Ordering::Relaxed)
    );
    s
}
