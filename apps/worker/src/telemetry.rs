use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::{KeyValue, global};
use std::sync::Arc;

#[derive(Clone)]
pub struct WorkerTelemetry {
    inner: Arc<Inner>,
}

struct Inner {
    jobs_total: Counter<u64>,
    job_errors_total: Counter<u64>,
    job_retries_total: Counter<u64>,
    render_cancellations_total: Counter<u64>,
    render_timeouts_total: Counter<u64>,
    cache_writes_total: Counter<u64>,

    job_ms: Histogram<u64>,
    render_ms: Histogram<u64>,
}

impl WorkerTelemetry {
    pub fn new() -> Self {
        let meter = global::meter("worker");

        let jobs_total = meter
            .u64_counter("worker.jobs_total")
            .with_description("Total jobs processed")
            .build();
        let job_errors_total = meter
            .u64_counter("worker.job_errors_total")
            .with_description("Total jobs that ended in a failure path")
            .build();
        let job_retries_total = meter
            .u64_counter("worker.job_retries_total")
            .with_description("Total transient failures re-enqueued")
            .build();
        let render_cancellations_total = meter
            .u64_counter("worker.render_cancellations_total")
            .with_description("Total renders stopped by a cancel request")
            .build();
        let render_timeouts_total = meter
            .u64_counter("worker.render_timeouts_total")
            .with_description("Total renders killed by the wall-clock timeout")
            .build();
        let cache_writes_total = meter
            .u64_counter("worker.cache_writes_total")
            .with_description("Total result cache inserts attempted")
            .build();

        let job_ms = meter
            .u64_histogram("worker.job_ms")
            .with_description("End-to-end job runtime")
            .with_unit("ms")
            .build();
        let render_ms = meter
            .u64_histogram("worker.render_ms")
            .with_description("Renderer subprocess runtime")
            .with_unit("ms")
            .build();

        Self {
            inner: Arc::new(Inner {
                jobs_total,
                job_errors_total,
                job_retries_total,
                render_cancellations_total,
                render_timeouts_total,
                cache_writes_total,
                job_ms,
                render_ms,
            }),
        }
    }

    pub fn job_ok(&self, gpu_class: &'static str, ms: u64) {
        let attrs = [KeyValue::new("gpu_class", gpu_class)];
        self.inner.jobs_total.add(1, &attrs);
        self.inner.job_ms.record(ms, &attrs);
    }

    pub fn job_err(&self, gpu_class: &'static str, ms: u64) {
        let attrs = [KeyValue::new("gpu_class", gpu_class)];
        self.inner.jobs_total.add(1, &attrs);
        self.inner.job_errors_total.add(1, &attrs);
        self.inner.job_ms.record(ms, &attrs);
    }

    pub fn retry(&self) {
        self.inner.job_retries_total.add(1, &[]);
    }

    pub fn cancelled(&self) {
        self.inner.render_cancellations_total.add(1, &[]);
    }

    pub fn timed_out(&self) {
        self.inner.render_timeouts_total.add(1, &[]);
    }

    pub fn cache_write(&self) {
        self.inner.cache_writes_total.add(1, &[]);
    }

    pub fn render_ms(&self, ms: u64) {
        self.inner.render_ms.record(ms, &[]);
    }
}
