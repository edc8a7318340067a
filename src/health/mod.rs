use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};

const NAMESPACE: &str = "statsnap";

/// Sink label used in `dispatch_errors_total` for the rule-output sink.
pub const SINK_RULE: &str = "rule";
/// Sink label used in `dispatch_errors_total` for the file sink.
pub const SINK_FILE: &str = "file";

/// Prometheus metrics describing the sampling engine itself.
///
/// All metrics use the "statsnap" namespace and live in a private registry,
/// so several writers can coexist in one process. Embedders expose them by
/// serving [`WriterMetrics::encode_text`] or by gathering [`WriterMetrics::registry`].
pub struct WriterMetrics {
    registry: Registry,

    /// Samples accepted by the handoff queue.
    pub samples_enqueued: Counter,
    /// Samples delivered to at least one configured sink.
    pub samples_dispatched: Counter,
    /// Samples dropped by the dispatcher before the first tick elapsed.
    pub samples_discarded: Counter,
    /// Distinct tick periods observed by the dispatcher.
    pub ticks_observed: Counter,
    /// Sink failures during dispatch, by sink.
    pub dispatch_errors: CounterVec,
    /// Handoff queue capacity.
    pub queue_capacity: Gauge,
}

impl std::fmt::Debug for WriterMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterMetrics")
            .field("samples_enqueued", &self.samples_enqueued.get())
            .field("samples_dispatched", &self.samples_dispatched.get())
            .finish()
    }
}

impl WriterMetrics {
    /// Creates the metrics and registers them in a fresh registry.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let samples_enqueued = Counter::with_opts(
            Opts::new(
                "samples_enqueued_total",
                "Total metrics samples accepted by the handoff queue.",
            )
            .namespace(NAMESPACE),
        )?;
        let samples_dispatched = Counter::with_opts(
            Opts::new(
                "samples_dispatched_total",
                "Total metrics samples delivered to at least one configured sink.",
            )
            .namespace(NAMESPACE),
        )?;
        let samples_discarded = Counter::with_opts(
            Opts::new(
                "samples_discarded_total",
                "Total metrics samples discarded before the first tick period elapsed.",
            )
            .namespace(NAMESPACE),
        )?;
        let ticks_observed = Counter::with_opts(
            Opts::new(
                "ticks_observed_total",
                "Distinct tick periods observed by the dispatcher.",
            )
            .namespace(NAMESPACE),
        )?;
        let dispatch_errors = CounterVec::new(
            Opts::new(
                "dispatch_errors_total",
                "Sink failures while dispatching a sample, by sink.",
            )
            .namespace(NAMESPACE),
            &["sink"],
        )?;
        let queue_capacity = Gauge::with_opts(
            Opts::new("queue_capacity", "Handoff queue capacity.").namespace(NAMESPACE),
        )?;

        registry.register(Box::new(samples_enqueued.clone()))?;
        registry.register(Box::new(samples_dispatched.clone()))?;
        registry.register(Box::new(samples_discarded.clone()))?;
        registry.register(Box::new(ticks_observed.clone()))?;
        registry.register(Box::new(dispatch_errors.clone()))?;
        registry.register(Box::new(queue_capacity.clone()))?;

        Ok(Self {
            registry,
            samples_enqueued,
            samples_dispatched,
            samples_discarded,
            ticks_observed,
            dispatch_errors,
            queue_capacity,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Records one sink failure.
    pub fn record_dispatch_error(&self, sink: &str) {
        self.dispatch_errors.with_label_values(&[sink]).inc();
    }

    /// Renders all metrics in the Prometheus text exposition format.
    pub fn encode_text(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;

        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
