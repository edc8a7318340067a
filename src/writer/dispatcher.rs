use std::sync::Arc;

use tracing::{debug, error, info};

use crate::health::{WriterMetrics, SINK_FILE, SINK_RULE};
use crate::sink::{FileSink, Priority, RuleSink, SNAPSHOT_MESSAGE, SNAPSHOT_RULE};
use crate::ticker::{Tick, Ticker};

use super::queue::QueueReceiver;
use super::{Message, Sample};

/// Single consumer draining the handoff queue into the sinks.
///
/// Runs on its own thread until it pops a stop request. Sink failures are
/// logged and counted; they never end the loop.
pub(crate) struct Dispatcher {
    rx: QueueReceiver,
    ticker: Ticker,
    /// Tick at startup. Samples seen before the counter moves past it are
    /// discarded, since no full period has elapsed yet.
    first_tick: Tick,
    warmed_up: bool,
    last_tick: Tick,
    total_samples: u64,
    rule_sink: Option<Arc<dyn RuleSink>>,
    file_sink: Option<FileSink>,
    metrics: Arc<WriterMetrics>,
}

impl Dispatcher {
    /// Captures the startup tick on the calling thread.
    pub(crate) fn new(
        rx: QueueReceiver,
        ticker: Ticker,
        rule_sink: Option<Arc<dyn RuleSink>>,
        file_sink: Option<FileSink>,
        metrics: Arc<WriterMetrics>,
    ) -> Self {
        let first_tick = ticker.read();
        Self {
            rx,
            ticker,
            first_tick,
            warmed_up: false,
            last_tick: first_tick,
            total_samples: 0,
            rule_sink,
            file_sink,
            metrics,
        }
    }

    pub(crate) fn run(mut self) {
        debug!(
            first_tick = self.first_tick,
            rule_output = self.rule_sink.is_some(),
            file_output = self.file_sink.is_some(),
            "stats dispatcher started",
        );

        loop {
            match self.rx.pop() {
                Some(Message::Sample(sample)) => self.handle(&sample),
                Some(Message::Stop) => break,
                None => {
                    debug!("stats queue closed");
                    break;
                }
            }
        }

        if let Some(file) = &self.file_sink {
            debug!(path = %file.path().display(), "closing metrics output file");
        }

        info!(
            total_samples = self.total_samples,
            "stats dispatcher stopped"
        );
    }

    fn handle(&mut self, sample: &Sample) {
        let tick = self.ticker.read();

        if !self.warmed_up {
            if tick == self.first_tick {
                self.metrics.samples_discarded.inc();
                debug!(
                    source = %sample.source,
                    "discarding sample taken before the first tick"
                );
                return;
            }
            self.warmed_up = true;
        }

        if tick != self.last_tick {
            self.total_samples += 1;
            self.metrics.ticks_observed.inc();
        }
        self.last_tick = tick;

        self.dispatch(sample);
    }

    fn dispatch(&mut self, sample: &Sample) {
        let mut delivered = false;

        if let Some(rule_sink) = &self.rule_sink {
            match rule_sink.handle_msg(
                sample.ts,
                Priority::Informational,
                SNAPSHOT_MESSAGE,
                SNAPSHOT_RULE,
                &sample.output_fields,
            ) {
                Ok(()) => delivered = true,
                Err(e) => {
                    self.metrics.record_dispatch_error(SINK_RULE);
                    error!(
                        sink = SINK_RULE,
                        source = %sample.source,
                        error = %e,
                        "stats dispatch failed",
                    );
                }
            }
        }

        if let Some(file_sink) = &mut self.file_sink {
            match file_sink.write_sample(self.total_samples, &sample.output_fields) {
                Ok(()) => delivered = true,
                Err(e) => {
                    self.metrics.record_dispatch_error(SINK_FILE);
                    error!(
                        sink = SINK_FILE,
                        source = %sample.source,
                        error = %format_args!("{e:#}"),
                        "stats dispatch failed",
                    );
                }
            }
        }

        if delivered {
            self.metrics.samples_dispatched.inc();
        }
    }

    #[cfg(test)]
    pub(crate) fn total_samples(&self) -> u64 {
        self.total_samples
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{bail, Result};
    use parking_lot::Mutex;
    use serde_json::Value;

    use super::*;
    use crate::ticker::TickSource;
    use crate::writer::queue;
    use crate::writer::OutputFields;

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<(u64, Priority, String, OutputFields)>>,
        fail: bool,
    }

    impl RuleSink for RecordingSink {
        fn handle_msg(
            &self,
            ts: u64,
            priority: Priority,
            _msg: &str,
            rule: &str,
            fields: &OutputFields,
        ) -> Result<()> {
            if self.fail {
                bail!("rule channel unavailable");
            }
            self.seen
                .lock()
                .push((ts, priority, rule.to_string(), fields.clone()));
            Ok(())
        }
    }

    fn sample(ts: u64) -> Sample {
        let mut output_fields = OutputFields::new();
        output_fields.insert("evt.time".to_string(), Value::from(ts));
        Sample {
            ts,
            source: "syscall".to_string(),
            output_fields,
        }
    }

    fn dispatcher(
        ticker: Ticker,
        rule_sink: Option<Arc<dyn RuleSink>>,
        file_sink: Option<FileSink>,
    ) -> (Dispatcher, Arc<WriterMetrics>) {
        let (_tx, rx) = queue::bounded(1);
        let metrics = Arc::new(WriterMetrics::new().expect("metrics"));
        let d = Dispatcher::new(rx, ticker, rule_sink, file_sink, Arc::clone(&metrics));
        (d, metrics)
    }

    #[test]
    fn test_discards_samples_before_first_tick() {
        let source = TickSource::new();
        let sink = Arc::new(RecordingSink::default());
        let (mut d, metrics) = dispatcher(source.ticker(), Some(sink.clone()), None);

        d.handle(&sample(1));
        d.handle(&sample(2));

        assert!(sink.seen.lock().is_empty());
        assert_eq!(d.total_samples(), 0);
        assert_eq!(metrics.samples_discarded.get(), 2.0);
        assert_eq!(metrics.samples_dispatched.get(), 0.0);
    }

    #[test]
    fn test_total_samples_counts_distinct_ticks() {
        let source = TickSource::new();
        let ticker = source.ticker();
        let sink = Arc::new(RecordingSink::default());
        let (mut d, metrics) = dispatcher(ticker.clone(), Some(sink.clone()), None);

        ticker.advance();
        d.handle(&sample(1));
        d.handle(&sample(2));
        d.handle(&sample(3));
        assert_eq!(d.total_samples(), 1);

        ticker.advance();
        d.handle(&sample(4));
        assert_eq!(d.total_samples(), 2);

        assert_eq!(sink.seen.lock().len(), 4);
        assert_eq!(metrics.ticks_observed.get(), 2.0);
        assert_eq!(metrics.samples_dispatched.get(), 4.0);
    }

    #[test]
    fn test_no_rediscard_after_counter_wraps_to_first_tick() {
        let source = TickSource::new();
        let ticker = source.ticker();
        let (mut d, metrics) = dispatcher(ticker.clone(), None, None);

        ticker.advance();
        d.handle(&sample(1));
        for _ in 0..u32::from(Tick::MAX) {
            ticker.advance();
        }
        assert_eq!(ticker.read(), 0);
        d.handle(&sample(2));

        assert_eq!(d.total_samples(), 2);
        assert_eq!(metrics.samples_discarded.get(), 0.0);
    }

    #[test]
    fn test_rule_sink_receives_informational_snapshot() {
        let source = TickSource::new();
        let ticker = source.ticker();
        let sink = Arc::new(RecordingSink::default());
        let (mut d, _) = dispatcher(ticker.clone(), Some(sink.clone()), None);

        ticker.advance();
        d.handle(&sample(42));

        let seen = sink.seen.lock();
        assert_eq!(seen.len(), 1);
        let (ts, priority, rule, fields) = &seen[0];
        assert_eq!(*ts, 42);
        assert_eq!(*priority, Priority::Informational);
        assert_eq!(rule, SNAPSHOT_RULE);
        assert_eq!(fields.get("evt.time"), Some(&Value::from(42u64)));
    }

    #[test]
    fn test_sink_failure_does_not_stop_other_sinks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("metrics.jsonl");
        let file = FileSink::open(&path).expect("open");

        let source = TickSource::new();
        let ticker = source.ticker();
        let failing = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let (mut d, metrics) = dispatcher(ticker.clone(), Some(failing), Some(file));

        ticker.advance();
        d.handle(&sample(1));
        ticker.advance();
        d.handle(&sample(2));

        let contents = std::fs::read_to_string(&path).expect("read back");
        assert_eq!(contents.lines().count(), 2);
        assert_eq!(
            metrics
                .dispatch_errors
                .with_label_values(&[SINK_RULE])
                .get(),
            2.0
        );
        assert_eq!(metrics.samples_dispatched.get(), 2.0);
    }

    #[test]
    fn test_sample_rejected_by_every_sink_is_not_counted_as_dispatched() {
        let source = TickSource::new();
        let ticker = source.ticker();
        let failing = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let (mut d, metrics) = dispatcher(ticker.clone(), Some(failing), None);

        ticker.advance();
        d.handle(&sample(1));

        assert_eq!(d.total_samples(), 1);
        assert_eq!(metrics.samples_dispatched.get(), 0.0);
        assert_eq!(
            metrics
                .dispatch_errors
                .with_label_values(&[SINK_RULE])
                .get(),
            1.0
        );
    }

    #[test]
    fn test_run_exits_on_stop_after_draining() {
        let source = TickSource::new();
        let ticker = source.ticker();
        let sink = Arc::new(RecordingSink::default());
        let (tx, rx) = queue::bounded(4);
        let metrics = Arc::new(WriterMetrics::new().expect("metrics"));
        let d = Dispatcher::new(rx, ticker.clone(), Some(sink.clone()), None, metrics);

        ticker.advance();
        tx.try_push(Message::Sample(sample(1))).expect("push");
        tx.try_push(Message::Sample(sample(2))).expect("push");
        tx.try_push(Message::Stop).expect("push");

        let handle = std::thread::spawn(move || d.run());
        handle.join().expect("dispatcher thread");

        let seen = sink.seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, 1);
        assert_eq!(seen[1].0, 2);
    }
}
