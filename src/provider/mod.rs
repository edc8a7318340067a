//! Interface to the instrumentation engine whose counters get sampled.
//!
//! The engine itself lives outside this crate. A [`MetricsProvider`] exposes
//! host/agent identity and two typed counter tables (engine-level and
//! kernel-level) that the collector merges into each snapshot.

use std::fmt;
use std::ops::BitOr;

use anyhow::Result;
use serde::Deserialize;

/// Agent process identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentInfo {
    /// Agent start time, nanoseconds since the Unix epoch.
    pub start_ts_epoch: u64,
    /// Kernel release string (`uname -r`).
    pub uname_r: String,
}

/// Host identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineInfo {
    /// Host boot time, nanoseconds since the Unix epoch.
    pub boot_ts_epoch: u64,
    pub hostname: String,
    pub num_cpus: u32,
}

/// Capture engine currently driving the instrumentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    Kmod,
    Bpf,
    ModernBpf,
    SourcePlugin,
    NoDriver,
    Gvisor,
}

impl Engine {
    pub const ALL: [Engine; 6] = [
        Engine::Bpf,
        Engine::Kmod,
        Engine::ModernBpf,
        Engine::SourcePlugin,
        Engine::NoDriver,
        Engine::Gvisor,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Engine::Kmod => "kmod",
            Engine::Bpf => "bpf",
            Engine::ModernBpf => "modern_bpf",
            Engine::SourcePlugin => "source_plugin",
            Engine::NoDriver => "nodriver",
            Engine::Gvisor => "gvisor",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.as_str() == name)
    }

    /// Whether the engine runs eBPF programs and can report libbpf stats.
    pub fn is_ebpf(self) -> bool {
        matches!(self, Engine::Bpf | Engine::ModernBpf)
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed counter value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatValue {
    U64(u64),
    U32(u32),
    F64(f64),
}

impl StatValue {
    pub fn is_zero(self) -> bool {
        match self {
            StatValue::U64(v) => v == 0,
            StatValue::U32(v) => v == 0,
            StatValue::F64(v) => v == 0.0,
        }
    }
}

/// One named counter in a provider table.
///
/// An entry with an empty name terminates the table; anything after it is
/// ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct Stat {
    pub name: String,
    pub value: StatValue,
}

impl Stat {
    pub fn u64(name: impl Into<String>, value: u64) -> Self {
        Self {
            name: name.into(),
            value: StatValue::U64(value),
        }
    }

    pub fn u32(name: impl Into<String>, value: u32) -> Self {
        Self {
            name: name.into(),
            value: StatValue::U32(value),
        }
    }

    pub fn f64(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value: StatValue::F64(value),
        }
    }

    /// The empty-name entry that ends a table.
    pub fn sentinel() -> Self {
        Self::u64("", 0)
    }

    pub fn is_sentinel(&self) -> bool {
        self.name.is_empty()
    }
}

/// Bitset of metric categories requested from the provider.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "Vec<String>")]
pub struct MetricsFlags(u32);

impl MetricsFlags {
    pub const NONE: Self = Self(0);
    pub const RESOURCE_UTILIZATION: Self = Self(1 << 0);
    pub const STATE_COUNTERS: Self = Self(1 << 1);
    pub const KERNEL_COUNTERS: Self = Self(1 << 2);
    pub const LIBBPF_STATS: Self = Self(1 << 3);
    pub const PLUGINS: Self = Self(1 << 4);

    const NAMED: [(&'static str, Self); 5] = [
        ("resource_utilization", Self::RESOURCE_UTILIZATION),
        ("state_counters", Self::STATE_COUNTERS),
        ("kernel_counters", Self::KERNEL_COUNTERS),
        ("libbpf_stats", Self::LIBBPF_STATS),
        ("plugins", Self::PLUGINS),
    ];

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::NAMED
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, flag)| *flag)
    }
}

impl Default for MetricsFlags {
    fn default() -> Self {
        Self::RESOURCE_UTILIZATION
            | Self::STATE_COUNTERS
            | Self::KERNEL_COUNTERS
            | Self::LIBBPF_STATS
    }
}

impl BitOr for MetricsFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for MetricsFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMED
            .iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(name, _)| *name)
            .collect();
        f.debug_tuple("MetricsFlags").field(&names).finish()
    }
}

impl TryFrom<Vec<String>> for MetricsFlags {
    type Error = String;

    fn try_from(names: Vec<String>) -> Result<Self, Self::Error> {
        names.iter().try_fold(Self::NONE, |acc, name| {
            Self::from_name(name)
                .map(|flag| acc | flag)
                .ok_or_else(|| format!("unknown metrics flag: {name}"))
        })
    }
}

/// Source of the counters merged into every snapshot.
///
/// Implementations are called from hot-path threads, but only once per tick
/// period per collector.
pub trait MetricsProvider {
    fn agent_info(&self) -> &AgentInfo;

    fn machine_info(&self) -> &MachineInfo;

    /// Active capture engine, if any.
    fn engine(&self) -> Option<Engine>;

    /// Engine-level (userspace) counters for the requested categories.
    fn engine_stats(&self, flags: MetricsFlags) -> Result<Vec<Stat>>;

    /// Kernel-side capture counters for the requested categories.
    fn kernel_stats(&self, flags: MetricsFlags) -> Result<Vec<Stat>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_names_round_trip() {
        for engine in Engine::ALL {
            assert_eq!(Engine::from_name(engine.as_str()), Some(engine));
        }
        assert_eq!(Engine::from_name("ebpf"), None);
    }

    #[test]
    fn test_ebpf_engines() {
        assert!(Engine::Bpf.is_ebpf());
        assert!(Engine::ModernBpf.is_ebpf());
        assert!(!Engine::Kmod.is_ebpf());
        assert!(!Engine::Gvisor.is_ebpf());
    }

    #[test]
    fn test_stat_value_is_zero() {
        assert!(StatValue::U64(0).is_zero());
        assert!(StatValue::U32(0).is_zero());
        assert!(StatValue::F64(0.0).is_zero());
        assert!(!StatValue::F64(0.1).is_zero());
        assert!(!StatValue::U64(7).is_zero());
    }

    #[test]
    fn test_sentinel() {
        assert!(Stat::sentinel().is_sentinel());
        assert!(!Stat::u32("n_threads", 0).is_sentinel());
    }

    #[test]
    fn test_default_flags_exclude_plugins() {
        let flags = MetricsFlags::default();
        assert!(flags.contains(MetricsFlags::RESOURCE_UTILIZATION));
        assert!(flags.contains(MetricsFlags::LIBBPF_STATS));
        assert!(!flags.contains(MetricsFlags::PLUGINS));
    }

    #[test]
    fn test_flags_remove() {
        let mut flags = MetricsFlags::KERNEL_COUNTERS | MetricsFlags::LIBBPF_STATS;
        flags.remove(MetricsFlags::LIBBPF_STATS);
        assert_eq!(flags, MetricsFlags::KERNEL_COUNTERS);
    }

    #[test]
    fn test_flags_from_names() {
        let flags = MetricsFlags::try_from(vec![
            "kernel_counters".to_string(),
            "plugins".to_string(),
        ])
        .expect("valid names");
        assert_eq!(flags, MetricsFlags::KERNEL_COUNTERS | MetricsFlags::PLUGINS);
        assert_eq!(flags.bits(), 0b10100);
    }

    #[test]
    fn test_flags_reject_unknown_name() {
        let err = MetricsFlags::try_from(vec!["cpu".to_string()]).expect_err("should fail");
        assert!(err.contains("unknown metrics flag: cpu"));
    }
}
