pub mod collector;
mod dispatcher;
pub mod queue;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{error, info};

use crate::config::MetricsConfig;
use crate::health::WriterMetrics;
use crate::sink::{FileSink, RuleSink};
use crate::ticker::{TickSource, Ticker, TickerError};

use self::dispatcher::Dispatcher;
use self::queue::{PushError, QueueSender};

pub use self::collector::Collector;

/// Snapshot fields, keyed by namespaced metric name, in insertion order.
pub type OutputFields = serde_json::Map<String, serde_json::Value>;

/// One snapshot travelling from a collector to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Wall-clock capture time, nanoseconds since the Unix epoch.
    pub ts: u64,
    /// Event source the snapshot was taken for (e.g. "syscall").
    pub source: String,
    pub output_fields: OutputFields,
}

/// Entry of the handoff queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Sample(Sample),
    /// Ends the dispatcher loop once everything queued before it is delivered.
    Stop,
}

/// Errors raised by the stats writer.
#[derive(Error, Debug)]
pub enum WriterError {
    /// The dispatcher cannot keep up. Fatal: see [`fatal_overflow`].
    #[error("stats queue reached maximum capacity ({capacity})")]
    QueueFull { capacity: usize },

    #[error("stats dispatcher is no longer running")]
    DispatcherStopped,

    #[error("metrics queue capacity must be > 0")]
    ZeroCapacity,

    #[error("metrics queue capacity {capacity} exceeds the maximum of {max}")]
    CapacityTooLarge { capacity: usize, max: usize },

    #[error("could not open metrics output file {path}: {source}")]
    OpenOutputFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not spawn stats dispatcher: {0}")]
    SpawnDispatcher(#[source] std::io::Error),

    #[error(transparent)]
    Ticker(#[from] TickerError),

    #[error("registering writer metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl WriterError {
    /// Whether this error must terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WriterError::QueueFull { .. })
    }
}

impl From<PushError> for WriterError {
    fn from(e: PushError) -> Self {
        match e {
            PushError::Full { capacity } => WriterError::QueueFull { capacity },
            PushError::Closed => WriterError::DispatcherStopped,
        }
    }
}

/// Terminates the process after a handoff queue overflow.
///
/// Overflow means the dispatcher cannot keep up; continuing would hide data
/// loss, so sampling fails fast instead of dropping snapshots.
pub fn fatal_overflow(err: &WriterError) -> ! {
    error!(error = %err, "stats queue overflow");
    eprintln!("Fatal error: Stats queue reached maximum capacity. Exiting.");
    std::process::exit(1);
}

/// Owns the dispatcher thread, the file sink and the tick source.
///
/// Collectors hold an `Arc<StatsWriter>` and push through it; the last
/// reference going away shuts the writer down.
pub struct StatsWriter {
    cfg: MetricsConfig,
    rule_sink: Arc<dyn RuleSink>,
    ticker: Ticker,
    ticks: Mutex<TickSource>,
    queue: Option<QueueSender>,
    worker: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<WriterMetrics>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for StatsWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsWriter")
            .field("has_output", &self.has_output())
            .field("tick", &self.ticker.read())
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

impl StatsWriter {
    /// Creates the writer around an existing tick source.
    ///
    /// The dispatcher thread is only started when at least one sink is
    /// configured. Failing to open the output file is a startup error.
    pub fn new(
        cfg: MetricsConfig,
        rule_sink: Arc<dyn RuleSink>,
        ticks: TickSource,
    ) -> Result<Arc<Self>, WriterError> {
        let metrics = Arc::new(WriterMetrics::new()?);
        let ticker = ticks.ticker();

        let mut sender = None;
        let mut worker = None;

        if cfg.has_output() {
            if cfg.queue_capacity == 0 {
                return Err(WriterError::ZeroCapacity);
            }
            if cfg.queue_capacity > queue::MAX_CAPACITY {
                return Err(WriterError::CapacityTooLarge {
                    capacity: cfg.queue_capacity,
                    max: queue::MAX_CAPACITY,
                });
            }

            let file_sink = if cfg.output_file.is_empty() {
                None
            } else {
                let sink = FileSink::open(Path::new(&cfg.output_file)).map_err(|source| {
                    WriterError::OpenOutputFile {
                        path: cfg.output_file.clone(),
                        source,
                    }
                })?;
                Some(sink)
            };

            let (tx, rx) = queue::bounded(cfg.queue_capacity);
            metrics.queue_capacity.set(cfg.queue_capacity as f64);

            let rule_output = cfg.rule_output.then(|| Arc::clone(&rule_sink));
            let dispatcher = Dispatcher::new(
                rx,
                ticker.clone(),
                rule_output,
                file_sink,
                Arc::clone(&metrics),
            );

            let handle = thread::Builder::new()
                .name("statsnap-dispatcher".to_string())
                .spawn(move || dispatcher.run())
                .map_err(WriterError::SpawnDispatcher)?;

            info!(
                rule_output = cfg.rule_output,
                output_file = %cfg.output_file,
                queue_capacity = cfg.queue_capacity,
                "stats writer started",
            );

            sender = Some(tx);
            worker = Some(handle);
        }

        Ok(Arc::new(Self {
            cfg,
            rule_sink,
            ticker,
            ticks: Mutex::new(ticks),
            queue: sender,
            worker: Mutex::new(worker),
            metrics,
            stopped: AtomicBool::new(false),
        }))
    }

    /// Creates the writer and, if it has output, installs a periodic timer
    /// firing every `cfg.interval`.
    pub fn with_timer(
        cfg: MetricsConfig,
        rule_sink: Arc<dyn RuleSink>,
    ) -> Result<Arc<Self>, WriterError> {
        let mut ticks = TickSource::new();
        if cfg.has_output() {
            ticks.init(cfg.interval)?;
        }
        Self::new(cfg, rule_sink, ticks)
    }

    /// Whether at least one sink receives snapshots.
    pub fn has_output(&self) -> bool {
        self.queue.is_some()
    }

    /// Whether collectors should still build and push snapshots.
    pub fn is_accepting(&self) -> bool {
        self.has_output() && !self.stopped.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.cfg
    }

    pub fn ticker(&self) -> Ticker {
        self.ticker.clone()
    }

    pub fn metrics(&self) -> &WriterMetrics {
        &self.metrics
    }

    pub fn rule_sink(&self) -> &dyn RuleSink {
        self.rule_sink.as_ref()
    }

    /// Creates a collector bound to this writer. Use one per producer thread.
    pub fn collector(self: &Arc<Self>) -> Collector {
        Collector::new(Arc::clone(self))
    }

    /// Enqueues a message without blocking.
    pub(crate) fn push(&self, msg: Message) -> Result<(), WriterError> {
        let Some(queue) = &self.queue else {
            return Ok(());
        };

        queue.try_push(msg)?;
        Ok(())
    }

    /// Stops the dispatcher after everything already queued is delivered,
    /// then tears down the tick source. Idempotent once it has succeeded.
    ///
    /// If the stop request cannot be enqueued the tick source is still torn
    /// down, the writer stays accepting, and a later call retries the stop.
    pub fn shutdown(&self) -> Result<(), WriterError> {
        let mut worker = self.worker.lock();
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(queue) = &self.queue {
            match queue.try_push(Message::Stop) {
                Ok(()) => {}
                // Dispatcher already gone; nothing left to stop.
                Err(PushError::Closed) => {}
                Err(e) => {
                    self.ticks.lock().teardown();
                    return Err(e.into());
                }
            }
        }
        self.stopped.store(true, Ordering::SeqCst);

        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                error!("stats dispatcher panicked");
            }
        }

        self.ticks.lock().teardown();

        if self.has_output() {
            info!(
                samples_dispatched = self.metrics.samples_dispatched.get(),
                "stats writer stopped",
            );
        }

        Ok(())
    }
}

impl Drop for StatsWriter {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            if e.is_fatal() {
                fatal_overflow(&e);
            }
            error!(error = %e, "stats writer shutdown failed");
        }
    }
}
