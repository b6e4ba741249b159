//! Observability sidecar: process-local prometheus series the core writes
//! and never reads, plus tracing setup. Exposing them over a transport is a
//! host concern.

use once_cell::sync::Lazy;
use prometheus::{Histogram, IntCounter, IntGauge};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

static REQUESTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    prometheus::register_int_counter!("spate_requests_total", "Requests admitted").expect("counter")
});
static REQUESTS_REJECTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    prometheus::register_int_counter!("spate_requests_rejected_total", "Requests rejected at admission")
        .expect("counter")
});
static REQUESTS_CANCELLED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    prometheus::register_int_counter!("spate_requests_cancelled_total", "Requests cancelled").expect("counter")
});
static TOKENS_GENERATED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    prometheus::register_int_counter!("spate_tokens_generated_total", "Sampled tokens").expect("counter")
});
static PREEMPTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    prometheus::register_int_counter!("spate_preemptions_total", "Requests preempted for KV space")
        .expect("counter")
});
static ENGINE_ERRORS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    prometheus::register_int_counter!("spate_engine_errors_total", "Failed engine steps").expect("counter")
});
static WAITING_REQUESTS: Lazy<IntGauge> = Lazy::new(|| {
    prometheus::register_int_gauge!("spate_waiting_requests", "Requests awaiting prefill").expect("gauge")
});
static RUNNING_SEQS: Lazy<IntGauge> = Lazy::new(|| {
    prometheus::register_int_gauge!("spate_running_seqs", "Sequences in the running pool").expect("gauge")
});
static KV_FREE_BLOCKS: Lazy<IntGauge> = Lazy::new(|| {
    prometheus::register_int_gauge!("spate_kv_free_blocks", "Free KV blocks").expect("gauge")
});
static KV_TOTAL_BLOCKS: Lazy<IntGauge> = Lazy::new(|| {
    prometheus::register_int_gauge!("spate_kv_total_blocks", "KV block pool size").expect("gauge")
});
static STEP_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    prometheus::register_histogram!("spate_step_seconds", "Scheduler step latency").expect("histogram")
});

pub fn init() {
    // Touch statics so the series register even before the first step.
    let _ = &*REQUESTS_TOTAL;
    let _ = &*REQUESTS_REJECTED_TOTAL;
    let _ = &*REQUESTS_CANCELLED_TOTAL;
    let _ = &*TOKENS_GENERATED_TOTAL;
    let _ = &*PREEMPTIONS_TOTAL;
    let _ = &*ENGINE_ERRORS_TOTAL;
    let _ = &*WAITING_REQUESTS;
    let _ = &*RUNNING_SEQS;
    let _ = &*KV_FREE_BLOCKS;
    let _ = &*KV_TOTAL_BLOCKS;
    let _ = &*STEP_SECONDS;
}

pub fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    );
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

pub fn request_admitted() {
    REQUESTS_TOTAL.inc();
}

pub fn request_rejected() {
    REQUESTS_REJECTED_TOTAL.inc();
}

pub fn request_cancelled() {
    REQUESTS_CANCELLED_TOTAL.inc();
}

pub fn tokens_generated(n: u64) {
    TOKENS_GENERATED_TOTAL.inc_by(n);
}

pub fn preemption() {
    PREEMPTIONS_TOTAL.inc();
}

pub fn engine_error() {
    ENGINE_ERRORS_TOTAL.inc();
}

pub fn observe_step(seconds: f64) {
    STEP_SECONDS.observe(seconds);
}

pub fn set_pool_gauges(waiting: usize, running: usize) {
    WAITING_REQUESTS.set(waiting as i64);
    RUNNING_SEQS.set(running as i64);
}

pub fn set_kv_gauges(free: usize, total: usize) {
    KV_FREE_BLOCKS.set(free as i64);
    KV_TOTAL_BLOCKS.set(total as i64);
}

pub fn preemptions_total() -> u64 {
    PREEMPTIONS_TOTAL.get()
}

pub fn requests_cancelled_total() -> u64 {
    REQUESTS_CANCELLED_TOTAL.get()
}
