//! Tick-gated snapshot producer called from hot-path threads.
//!
//! Each producer thread owns its own [`Collector`]. `collect` is cheap to call
//! at any frequency: it compares the shared tick with the last one it saw and
//! returns immediately unless a new period has started. On a new period it
//! builds the snapshot fields and pushes them to the handoff queue.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tracing::warn;

use crate::provider::{MetricsFlags, MetricsProvider, Stat, StatValue};
use crate::ticker::{Tick, Ticker};
use crate::version;

use super::{fatal_overflow, Message, OutputFields, Sample, StatsWriter, WriterError};

/// Event source whose snapshots also carry kernel-side capture counters.
pub const SYSCALL_SOURCE: &str = "syscall";

const AGENT_PREFIX: &str = "agent.";
const KERNEL_PREFIX: &str = "kernel.";

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Per-producer sampling state.
///
/// Deliberately not `Clone`: rate baselines are only meaningful for the one
/// stream that produced them.
pub struct Collector {
    writer: Arc<StatsWriter>,
    ticker: Ticker,
    last_tick: Tick,
    /// Wall time of the previous sample in ns, 0 before the first one.
    last_now: u64,
    last_num_evts: u64,
    last_kernel_evts: u64,
    last_kernel_drops: u64,
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("last_tick", &self.last_tick)
            .field("last_num_evts", &self.last_num_evts)
            .finish()
    }
}

impl Collector {
    /// Creates a collector whose baseline is tick zero.
    ///
    /// A collector created after the first tick samples on its first call.
    pub fn new(writer: Arc<StatsWriter>) -> Self {
        let ticker = writer.ticker();
        Self {
            writer,
            ticker,
            last_tick: Tick::default(),
            last_now: 0,
            last_num_evts: 0,
            last_kernel_evts: 0,
            last_kernel_drops: 0,
        }
    }

    /// Takes a snapshot if a new tick period started since the last call.
    ///
    /// `num_evts` is the running count of events this producer processed.
    /// A `WriterError::QueueFull` must be treated as fatal by the caller; see
    /// [`Collector::collect_or_exit`].
    pub fn collect(
        &mut self,
        provider: &dyn MetricsProvider,
        source: &str,
        num_evts: u64,
    ) -> Result<(), WriterError> {
        if !self.writer.is_accepting() {
            return Ok(());
        }

        let tick = self.ticker.read();
        if tick == self.last_tick {
            return Ok(());
        }
        self.last_tick = tick;

        let now = now_ns();
        let output_fields = self.snapshot(provider, source, num_evts, now);

        self.writer.push(Message::Sample(Sample {
            ts: now,
            source: source.to_string(),
            output_fields,
        }))?;
        self.writer.metrics().samples_enqueued.inc();

        Ok(())
    }

    /// Like [`Collector::collect`], but terminates the process on queue
    /// overflow and logs any other failure.
    pub fn collect_or_exit(&mut self, provider: &dyn MetricsProvider, source: &str, num_evts: u64) {
        if let Err(e) = self.collect(provider, source, num_evts) {
            if e.is_fatal() {
                fatal_overflow(&e);
            }
            warn!(error = %e, source, "metrics sample not enqueued");
        }
    }

    fn snapshot(
        &mut self,
        provider: &dyn MetricsProvider,
        source: &str,
        num_evts: u64,
        now: u64,
    ) -> OutputFields {
        let elapsed_sec = if self.last_now != 0 {
            now.saturating_sub(self.last_now) as f64 / NANOS_PER_SEC as f64
        } else {
            0.0
        };
        self.last_now = now;

        let mut fields = OutputFields::new();
        self.wrapper_fields(&mut fields, provider, source, num_evts, now, elapsed_sec);
        self.additional_fields(&mut fields, provider, source, elapsed_sec);
        fields
    }

    /// Fields present in every snapshot, used for attribution.
    fn wrapper_fields(
        &mut self,
        fields: &mut OutputFields,
        provider: &dyn MetricsProvider,
        source: &str,
        num_evts: u64,
        now: u64,
        elapsed_sec: f64,
    ) {
        let agent = provider.agent_info();
        let machine = provider.machine_info();

        put(fields, "evt.time", now);
        put(fields, "agent.version", version::RELEASE);
        put(fields, "agent.commit", version::git_commit());
        put(fields, "agent.start_ts", agent.start_ts_epoch);
        put(
            fields,
            "agent.duration_sec",
            now.saturating_sub(agent.start_ts_epoch) / NANOS_PER_SEC,
        );
        put(fields, "agent.kernel_release", agent.uname_r.as_str());
        put(fields, "agent.host_boot_ts", machine.boot_ts_epoch);
        put(fields, "agent.hostname", machine.hostname.as_str());
        put(fields, "agent.host_num_cpus", machine.num_cpus);
        put(
            fields,
            "agent.outputs_queue_num_drops",
            self.writer.rule_sink().queue_num_drops(),
        );
        put(fields, "evt.source", source);
        if let Some(engine) = provider.engine() {
            put(fields, "kernel.engine_name", engine.as_str());
        }

        if self.last_num_evts != 0 && elapsed_sec > 0.0 {
            put(
                fields,
                "agent.evts_rate_sec",
                per_second(num_evts.saturating_sub(self.last_num_evts), elapsed_sec),
            );
        }
        put(fields, "agent.num_evts", num_evts);
        put(fields, "agent.num_evts_prev", self.last_num_evts);
        self.last_num_evts = num_evts;
    }

    /// Engine counters, plus kernel capture counters for the syscall source.
    fn additional_fields(
        &mut self,
        fields: &mut OutputFields,
        provider: &dyn MetricsProvider,
        source: &str,
        elapsed_sec: f64,
    ) {
        let cfg = self.writer.config();
        let mut flags = cfg.flags;

        match provider.engine_stats(flags) {
            Ok(stats) => {
                for stat in stats.iter().take_while(|s| !s.is_sentinel()) {
                    put_engine_stat(
                        fields,
                        stat,
                        cfg.include_empty_values,
                        cfg.convert_memory_to_mb,
                    );
                }
            }
            Err(e) => warn!(error = %e, source, "engine stats unavailable"),
        }

        if source != SYSCALL_SOURCE {
            return;
        }

        if !provider.engine().is_some_and(|e| e.is_ebpf()) {
            flags.remove(MetricsFlags::LIBBPF_STATS);
        }

        let include_empty = cfg.include_empty_values;
        let mut evts_delta = 0u64;
        let mut drops_delta = 0u64;

        match provider.kernel_stats(flags) {
            Ok(stats) => {
                for stat in stats.iter().take_while(|s| !s.is_sentinel()) {
                    let StatValue::U64(value) = stat.value else {
                        continue;
                    };
                    let key = format!("{KERNEL_PREFIX}{}", stat.name);

                    // Event and drop totals are always sent, even if zero.
                    match stat.name.as_str() {
                        "n_evts" => {
                            evts_delta = value.saturating_sub(self.last_kernel_evts);
                            put(fields, &key, value);
                            put(fields, "kernel.n_evts_prev", self.last_kernel_evts);
                            put(
                                fields,
                                "kernel.evts_rate_sec",
                                per_second(evts_delta, elapsed_sec),
                            );
                            self.last_kernel_evts = value;
                        }
                        "n_drops" => {
                            drops_delta = value.saturating_sub(self.last_kernel_drops);
                            put(fields, &key, value);
                            put(fields, "kernel.n_drops_prev", self.last_kernel_drops);
                            put(
                                fields,
                                "kernel.evts_drop_rate_sec",
                                per_second(drops_delta, elapsed_sec),
                            );
                            self.last_kernel_drops = value;
                        }
                        _ => {
                            if value != 0 || include_empty {
                                put(fields, &key, value);
                            }
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "kernel capture stats unavailable"),
        }

        // Primary health signal; always sent.
        put(
            fields,
            "kernel.n_drops_perc",
            drop_percentage(drops_delta, evts_delta),
        );
    }
}

fn put(fields: &mut OutputFields, key: &str, value: impl Into<Value>) {
    fields.insert(key.to_string(), value.into());
}

fn put_engine_stat(
    fields: &mut OutputFields,
    stat: &Stat,
    include_empty: bool,
    convert_memory: bool,
) {
    if stat.value.is_zero() && !include_empty {
        return;
    }

    let key = format!("{AGENT_PREFIX}{}", stat.name);
    let name = stat.name.as_str();

    match stat.value {
        StatValue::U64(v) => {
            let v = if !convert_memory {
                v
            } else if name == "container_memory_used" {
                v / (1024 * 1024)
            } else if name.starts_with("memory_") {
                v / 1024
            } else {
                v
            };
            put(fields, &key, v);
        }
        StatValue::U32(v) => {
            let v = if convert_memory && name.starts_with("memory_") {
                v / 1024
            } else {
                v
            };
            put(fields, &key, v);
        }
        StatValue::F64(v) => put(fields, &key, v),
    }
}

/// Rate over the elapsed interval, rounded to one decimal place.
///
/// Zero when nothing changed or no time has elapsed.
pub fn per_second(delta: u64, elapsed_sec: f64) -> f64 {
    if delta == 0 || elapsed_sec <= 0.0 {
        return 0.0;
    }
    ((delta as f64 / elapsed_sec) * 10.0).round() / 10.0
}

/// Share of dropped events over the interval, in percent.
pub fn drop_percentage(drops_delta: u64, evts_delta: u64) -> f64 {
    if evts_delta == 0 {
        return 0.0;
    }
    100.0 * drops_delta as f64 / evts_delta as f64
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}
