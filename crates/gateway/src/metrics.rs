use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static VERDICTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static EXECUTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static EXECUTION_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static POOL_ACQUIRE_RETRIES_TOTAL: OnceLock<IntCounter> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn verdicts_total() -> &'static IntCounterVec {
    VERDICTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "sqlgate_verdicts_total",
                    "Statements approved or rejected, by pipeline stage.",
                ),
                &["stage", "outcome"],
            )
            .expect("create sqlgate_verdicts_total"),
        )
    })
}

fn executions_total() -> &'static IntCounterVec {
    EXECUTIONS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "sqlgate_executions_total",
                    "Executions by terminal state.",
                ),
                &["outcome"],
            )
            .expect("create sqlgate_executions_total"),
        )
    })
}

fn execution_duration_seconds() -> &'static HistogramVec {
    EXECUTION_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "sqlgate_execution_duration_seconds",
                    "Time from pool acquisition to terminal state, in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
                &["outcome"],
            )
            .expect("create sqlgate_execution_duration_seconds"),
        )
    })
}

fn pool_acquire_retries_total() -> &'static IntCounter {
    POOL_ACQUIRE_RETRIES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "sqlgate_pool_acquire_retries_total",
                "Connection acquisitions retried after pool exhaustion.",
            )
            .expect("create sqlgate_pool_acquire_retries_total"),
        )
    })
}

pub fn observe_verdict(stage: &str, outcome: &str) {
    verdicts_total().with_label_values(&[stage, outcome]).inc();
}

pub fn observe_execution(outcome: &str, duration: Duration) {
    executions_total().with_label_values(&[outcome]).inc();
    execution_duration_seconds()
        .with_label_values(&[outcome])
        .observe(duration.as_secs_f64());
}

pub fn inc_pool_acquire_retry() {
    pool_acquire_retries_total().inc();
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = pool_acquire_retries_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_observed_series() {
        observe_verdict("validate", "rejected");
        observe_execution("completed", Duration::from_millis(12));

        let (body, content_type) = render().expect("render should succeed");
        let text = String::from_utf8(body).expect("metrics should be utf-8");
        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains("sqlgate_verdicts_total{"));
        assert!(text.contains("stage=\"validate\""));
        assert!(text.contains("sqlgate_execution_duration_seconds_bucket"));
        assert!(text.contains("sqlgate_pool_acquire_retries_total"));
    }
}
