//! Prometheus metrics exposed on the health/metrics HTTP surface (spec.md §9,
//! SPEC_FULL.md §4.9), mirroring `examples/original_source/.../metrics.py`
//! name-for-name and bucket-for-bucket: external dashboards built against the
//! original service must keep working unmodified.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_gauge, register_histogram, Counter, Encoder, Gauge, Histogram,
    TextEncoder,
};

const SESSION_DURATION_BINS: &[f64] = &[1.0, 10.0, 30.0, 60.0, 120.0, 240.0, 480.0, 960.0, 1920.0];
const GENERATION_DURATION_BINS: &[f64] = &[0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0];
const PING_BINS: &[f64] = &[0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.200];
const TTFT_BINS_STT: &[f64] = &[0.010, 0.015, 0.025, 0.050, 0.075, 0.100];
const TTFT_BINS_VLLM: &[f64] = &[
    0.050, 0.075, 0.100, 0.150, 0.200, 0.250, 0.300, 0.400, 0.500, 0.750, 1.000,
];
const NUM_WORDS_REQUEST_BINS: &[f64] =
    &[50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0, 4000.0, 6000.0, 8000.0];
const NUM_WORDS_STT_BINS: &[f64] = &[0.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0, 4000.0];
const NUM_WORDS_REPLY_BINS: &[f64] = &[5.0, 10.0, 25.0, 50.0, 100.0, 200.0];

fn histogram(name: &str, buckets: &[f64]) -> Histogram {
    register_histogram!(name, " ", buckets.to_vec()).expect("metric registration cannot fail")
}

fn counter(name: &str) -> Counter {
    register_counter!(name, " ").expect("metric registration cannot fail")
}

fn gauge(name: &str) -> Gauge {
    register_gauge!(name, " ").expect("metric registration cannot fail")
}

pub static SESSIONS: Lazy<Counter> = Lazy::new(|| counter("worker_sessions"));
pub static SERVICE_MISSES: Lazy<Counter> = Lazy::new(|| counter("worker_service_misses"));
pub static HARD_SERVICE_MISSES: Lazy<Counter> = Lazy::new(|| counter("worker_hard_service_misses"));
pub static FORCE_DISCONNECTS: Lazy<Counter> = Lazy::new(|| counter("worker_force_disconnects"));
pub static FATAL_SERVICE_MISSES: Lazy<Counter> = Lazy::new(|| counter("worker_fatal_service_misses"));
pub static HARD_ERRORS: Lazy<Counter> = Lazy::new(|| counter("worker_hard_errors"));
pub static ACTIVE_SESSIONS: Lazy<Gauge> = Lazy::new(|| gauge("worker_active_sessions"));
pub static SESSION_DURATION: Lazy<Histogram> =
    Lazy::new(|| histogram("worker_session_duration", SESSION_DURATION_BINS));

pub static STT_SESSIONS: Lazy<Counter> = Lazy::new(|| counter("worker_stt_sessions"));
pub static STT_ACTIVE_SESSIONS: Lazy<Gauge> = Lazy::new(|| gauge("worker_stt_active_sessions"));
pub static STT_MISSES: Lazy<Counter> = Lazy::new(|| counter("worker_stt_misses"));
pub static STT_HARD_MISSES: Lazy<Counter> = Lazy::new(|| counter("worker_stt_hard_misses"));
pub static STT_SENT_FRAMES: Lazy<Counter> = Lazy::new(|| counter("worker_stt_sent_frames"));
pub static STT_RECV_FRAMES: Lazy<Counter> = Lazy::new(|| counter("worker_stt_recv_frames"));
pub static STT_RECV_WORDS: Lazy<Counter> = Lazy::new(|| counter("worker_stt_recv_words"));
pub static STT_PING_TIME: Lazy<Histogram> = Lazy::new(|| histogram("worker_stt_ping_time", PING_BINS));
pub static STT_FIND_TIME: Lazy<Histogram> = Lazy::new(|| histogram("worker_stt_find_time", PING_BINS));
pub static STT_SESSION_DURATION: Lazy<Histogram> =
    Lazy::new(|| histogram("worker_stt_session_duration", SESSION_DURATION_BINS));
pub static STT_AUDIO_DURATION: Lazy<Histogram> =
    Lazy::new(|| histogram("worker_stt_audio_duration", SESSION_DURATION_BINS));
pub static STT_NUM_WORDS: Lazy<Histogram> =
    Lazy::new(|| histogram("worker_stt_num_words", NUM_WORDS_STT_BINS));
pub static STT_TTFT: Lazy<Histogram> = Lazy::new(|| histogram("worker_stt_ttft", TTFT_BINS_STT));

pub static VLLM_SESSIONS: Lazy<Counter> = Lazy::new(|| counter("worker_vllm_sessions"));
pub static VLLM_ACTIVE_SESSIONS: Lazy<Gauge> = Lazy::new(|| gauge("worker_vllm_active_sessions"));
pub static VLLM_INTERRUPTS: Lazy<Counter> = Lazy::new(|| counter("worker_vllm_interrupt"));
pub static VLLM_HARD_ERRORS: Lazy<Counter> = Lazy::new(|| counter("worker_vllm_hard_errors"));
pub static VLLM_SENT_WORDS: Lazy<Counter> = Lazy::new(|| counter("worker_vllm_sent_words"));
pub static VLLM_RECV_WORDS: Lazy<Counter> = Lazy::new(|| counter("worker_vllm_recv_words"));
pub static VLLM_TTFT: Lazy<Histogram> = Lazy::new(|| histogram("worker_vllm_ttft", TTFT_BINS_VLLM));
pub static VLLM_REQUEST_LENGTH: Lazy<Histogram> =
    Lazy::new(|| histogram("worker_vllm_request_length", NUM_WORDS_REQUEST_BINS));
pub static VLLM_REPLY_LENGTH: Lazy<Histogram> =
    Lazy::new(|| histogram("worker_vllm_reply_length", NUM_WORDS_REPLY_BINS));
pub static VLLM_GEN_DURATION: Lazy<Histogram> =
    Lazy::new(|| histogram("worker_vllm_gen_duration", GENERATION_DURATION_BINS));

/// Force every metric to register with the default registry at startup, so
/// `/metrics` reports a zero-valued line for each one even before traffic.
pub fn init() {
    Lazy::force(&SESSIONS);
    Lazy::force(&SERVICE_MISSES);
    Lazy::force(&HARD_SERVICE_MISSES);
    Lazy::force(&FORCE_DISCONNECTS);
    Lazy::force(&FATAL_SERVICE_MISSES);
    Lazy::force(&HARD_ERRORS);
    Lazy::force(&ACTIVE_SESSIONS);
    Lazy::force(&SESSION_DURATION);
    Lazy::force(&STT_SESSIONS);
    Lazy::force(&STT_ACTIVE_SESSIONS);
    Lazy::force(&STT_MISSES);
    Lazy::force(&STT_HARD_MISSES);
    Lazy::force(&STT_SENT_FRAMES);
    Lazy::force(&STT_RECV_FRAMES);
    Lazy::force(&STT_RECV_WORDS);
    Lazy::force(&STT_PING_TIME);
    Lazy::force(&STT_FIND_TIME);
    Lazy::force(&STT_SESSION_DURATION);
    Lazy::force(&STT_AUDIO_DURATION);
    Lazy::force(&STT_NUM_WORDS);
    Lazy::force(&STT_TTFT);
    Lazy::force(&VLLM_SESSIONS);
    Lazy::force(&VLLM_ACTIVE_SESSIONS);
    Lazy::force(&VLLM_INTERRUPTS);
    Lazy::force(&VLLM_HARD_ERRORS);
    Lazy::force(&VLLM_SENT_WORDS);
    Lazy::force(&VLLM_RECV_WORDS);
    Lazy::force(&VLLM_TTFT);
    Lazy::force(&VLLM_REQUEST_LENGTH);
    Lazy::force(&VLLM_REPLY_LENGTH);
    Lazy::force(&VLLM_GEN_DURATION);
}

/// Render the default registry in Prometheus text exposition format.
pub fn render() -> String {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&metric_families, &mut buffer)
        .expect("prometheus text encoding cannot fail");
    String::from_utf8(buffer).expect("prometheus output is always valid utf-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_registers_every_metric_without_panicking() {
        init();
        let rendered = render();
        assert!(rendered.contains("worker_sessions"));
        assert!(rendered.contains("worker_vllm_gen_duration"));
    }
}
