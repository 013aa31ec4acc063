use once_cell::sync::Lazy;
use prometheus::{
    opts, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Registry, TextEncoder,
};

macro_rules! counter_vec {
    ($name:expr, $help:expr, $labels:expr) => {
        Lazy::new(|| IntCounterVec::new(opts!($name, $help), $labels).expect("valid metric"))
    };
}
macro_rules! histogram_vec {
    ($name:expr, $help:expr, $labels:expr, $buckets:expr) => {
        Lazy::new(|| {
            HistogramVec::new(HistogramOpts::new($name, $help).buckets($buckets.to_vec()), $labels)
                .expect("valid metric")
        })
    };
}
macro_rules! counter {
    ($name:expr, $help:expr) => {
        Lazy::new(|| IntCounter::new($name, $help).expect("valid metric"))
    };
}

const LATENCY_BUCKETS: [f64; 14] = [
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

const CONVERSION_BUCKETS: [f64; 9] = [0.5, 1.0, 2.0, 3.0, 5.0, 8.0, 13.0, 21.0, 30.0];

// ── HTTP ────────────────────────────────────────────────────────────────────
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> =
    counter_vec!("http_requests_total", "Total HTTP requests", &["method", "path", "status"]);
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = histogram_vec!(
    "http_request_duration_seconds",
    "HTTP request latency",
    &["method", "path"],
    LATENCY_BUCKETS
);

// ── Signatures ──────────────────────────────────────────────────────────────
pub static SIGNATURE_FLOWS_TOTAL: Lazy<IntCounterVec> = counter_vec!(
    "signature_flows_total",
    "Signature flows by party and outcome",
    &["party", "outcome"]
);

// ── Billing ─────────────────────────────────────────────────────────────────
pub static INVOICES_GENERATED: Lazy<IntCounter> =
    counter!("invoices_generated_total", "Invoices generated");
pub static INVOICES_FAILED: Lazy<IntCounter> =
    counter!("invoices_failed_total", "Invoice generations that failed");
pub static CONSUMPTION_RECORDS_INGESTED: Lazy<IntCounter> = counter!(
    "consumption_records_ingested_total",
    "Definitive consumption records stored"
);

// ── Documents ───────────────────────────────────────────────────────────────
pub static DOCUMENT_CONVERSION_SECONDS: Lazy<HistogramVec> = histogram_vec!(
    "document_conversion_seconds",
    "Office-to-PDF conversion latency",
    &["outcome"],
    CONVERSION_BUCKETS
);

// ── Post-commit jobs ────────────────────────────────────────────────────────
pub static POST_COMMIT_JOBS_TOTAL: Lazy<IntCounterVec> = counter_vec!(
    "post_commit_jobs_total",
    "Post-commit jobs by name and final outcome",
    &["job", "outcome"]
);
pub static POST_COMMIT_RETRIES: Lazy<IntCounter> =
    counter!("post_commit_retries_total", "Post-commit job retries");

pub fn register_all(r: &Registry) -> prometheus::Result<()> {
    r.register(Box::new(HTTP_REQUESTS_TOTAL.clone()))?;
    r.register(Box::new(HTTP_REQUEST_DURATION.clone()))?;
    r.register(Box::new(SIGNATURE_FLOWS_TOTAL.clone()))?;
    r.register(Box::new(INVOICES_GENERATED.clone()))?;
    r.register(Box::new(INVOICES_FAILED.clone()))?;
    r.register(Box::new(CONSUMPTION_RECORDS_INGESTED.clone()))?;
    r.register(Box::new(DOCUMENT_CONVERSION_SECONDS.clone()))?;
    r.register(Box::new(POST_COMMIT_JOBS_TOTAL.clone()))?;
    r.register(Box::new(POST_COMMIT_RETRIES.clone()))?;
    Ok(())
}

pub fn gather_metrics(r: &Registry) -> String {
    let encoder = TextEncoder::new();
    let families = r.gather();
    let mut buf = Vec::new();
    encoder.encode(&families, &mut buf).unwrap_or_default();
    String::from_utf8(buf).unwrap_or_default()
}

pub fn observe_http(method: &str, path: &str, status: u16, duration_secs: f64) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();
    HTTP_REQUEST_DURATION
        .with_label_values(&[method, path])
        .observe(duration_secs);
}

pub fn record_signature(party: &str, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    SIGNATURE_FLOWS_TOTAL
        .with_label_values(&[party, outcome])
        .inc();
}

pub fn observe_conversion(success: bool, duration_secs: f64) {
    let outcome = if success { "success" } else { "failure" };
    DOCUMENT_CONVERSION_SECONDS
        .with_label_values(&[outcome])
        .observe(duration_secs);
}

pub fn record_post_commit(job: &str, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    POST_COMMIT_JOBS_TOTAL
        .with_label_values(&[job, outcome])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_registry() -> Registry {
        let r = Registry::new_custom(Some("test".into()), None).unwrap();
        register_all(&r).unwrap();
        r
    }

    #[test]
    fn test_http_request_counter() {
        let r = fresh_registry();
        observe_http("POST", "/generate", 200, 0.4);
        let out = gather_metrics(&r);
        assert!(out.contains("test_http_requests_total"));
        assert!(out.contains("path=\"/generate\""));
    }

    #[test]
    fn test_signature_outcomes() {
        let r = fresh_registry();
        record_signature("producteur", false);
        let out = gather_metrics(&r);
        assert!(out.contains("test_signature_flows_total"));
        assert!(out.contains("outcome=\"failure\""));
    }

    #[test]
    fn test_conversion_histogram() {
        let r = fresh_registry();
        observe_conversion(true, 2.5);
        let out = gather_metrics(&r);
        assert!(out.contains("test_document_conversion_seconds_bucket"));
    }

    #[test]
    fn test_post_commit_jobs() {
        let r = fresh_registry();
        record_post_commit("notify_producer", true);
        let out = gather_metrics(&r);
        assert!(out.contains("test_post_commit_jobs_total"));
        assert!(out.contains("job=\"notify_producer\""));
    }

    #[test]
    fn test_gather_returns_valid_prometheus_format() {
        let r = fresh_registry();
        INVOICES_GENERATED.inc();
        let out = gather_metrics(&r);
        assert!(out.contains("# HELP"));
        assert!(out.contains("# TYPE"));
    }
}
