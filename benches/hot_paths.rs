use std::sync::Arc;

use anyhow::Result;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use statsnap::config::MetricsConfig;
use statsnap::provider::{
    AgentInfo, Engine, MachineInfo, MetricsFlags, MetricsProvider, Stat,
};
use statsnap::sink::NoopRuleSink;
use statsnap::ticker::TickSource;
use statsnap::writer::StatsWriter;

struct BenchProvider {
    agent: AgentInfo,
    machine: MachineInfo,
    engine_stats: Vec<Stat>,
    kernel_stats: Vec<Stat>,
}

impl BenchProvider {
    fn new() -> Self {
        let engine_stats = (0..48)
            .map(|i| match i % 3 {
                0 => Stat::u64(format!("n_counter_{i}"), 1_000 + i),
                1 => Stat::u32(format!("memory_region_{i}"), 4_096 * i as u32),
                _ => Stat::f64(format!("cpu_usage_{i}"), 0.5 * i as f64),
            })
            .chain(std::iter::once(Stat::sentinel()))
            .collect();

        let kernel_stats = vec![
            Stat::u64("n_evts", 9_000_000),
            Stat::u64("n_drops_buffer_total", 12),
            Stat::u64("n_drops", 12),
            Stat::u64("n_preemptions", 0),
        ];

        Self {
            agent: AgentInfo {
                start_ts_epoch: 1,
                uname_r: "6.8.0-bench".to_string(),
            },
            machine: MachineInfo {
                boot_ts_epoch: 1,
                hostname: "bench-node".to_string(),
                num_cpus: 16,
            },
            engine_stats,
            kernel_stats,
        }
    }
}

impl MetricsProvider for BenchProvider {
    fn agent_info(&self) -> &AgentInfo {
        &self.agent
    }

    fn machine_info(&self) -> &MachineInfo {
        &self.machine
    }

    fn engine(&self) -> Option<Engine> {
        Some(Engine::ModernBpf)
    }

    fn engine_stats(&self, _flags: MetricsFlags) -> Result<Vec<Stat>> {
        Ok(self.engine_stats.clone())
    }

    fn kernel_stats(&self, _flags: MetricsFlags) -> Result<Vec<Stat>> {
        Ok(self.kernel_stats.clone())
    }
}

fn writer(capacity: usize) -> Arc<StatsWriter> {
    let cfg = MetricsConfig {
        enabled: true,
        queue_capacity: capacity,
        ..Default::default()
    };
    StatsWriter::new(cfg, Arc::new(NoopRuleSink), TickSource::new()).expect("writer")
}

fn bench_throttled_collect(c: &mut Criterion) {
    let writer = writer(16);
    let provider = BenchProvider::new();
    let mut collector = writer.collector();

    c.bench_function("collector/collect_same_tick", |b| {
        b.iter(|| {
            collector
                .collect(black_box(&provider), "syscall", black_box(42))
                .expect("collect")
        })
    });

    writer.shutdown().expect("shutdown");
}

fn bench_snapshot(c: &mut Criterion) {
    let writer = writer(1 << 16);
    let ticker = writer.ticker();
    let provider = BenchProvider::new();
    let mut collector = writer.collector();
    let mut n = 0u64;

    c.bench_function("collector/collect_new_tick", |b| {
        b.iter(|| {
            n += 1_000;
            ticker.advance();
            // The dispatcher may fall behind under criterion's loop.
            black_box(collector.collect(black_box(&provider), "syscall", n).is_ok())
        })
    });

    writer.shutdown().expect("shutdown");
}

fn bench_suite(c: &mut Criterion) {
    bench_throttled_collect(c);
    bench_snapshot(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
