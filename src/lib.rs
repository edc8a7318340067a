//! Tick-gated metrics snapshot sampling for runtime security monitors.
//!
//! Hot-path threads each own a [`writer::collector::Collector`] and call
//! `collect` as often as they like; at most one snapshot per tick period is
//! built and handed to a single background dispatcher, which delivers it to
//! the rule-output sink and/or an append-only NDJSON file.

pub mod config;
pub mod health;
pub mod provider;
pub mod sink;
pub mod ticker;
pub mod writer;

/// Build-time version info.
pub mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }
}
