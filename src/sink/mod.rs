pub mod file;

use std::fmt;

use anyhow::Result;

use crate::writer::OutputFields;

pub use self::file::FileSink;

/// Rule name attached to snapshot notifications.
pub const SNAPSHOT_RULE: &str = "Internal: metrics snapshot";
/// Message text attached to snapshot notifications.
pub const SNAPSHOT_MESSAGE: &str = "Metrics snapshot";

/// Severity of a rule-output notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Emergency,
    Alert,
    Critical,
    Error,
    Warning,
    Notice,
    Informational,
    Debug,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Emergency => "Emergency",
            Priority::Alert => "Alert",
            Priority::Critical => "Critical",
            Priority::Error => "Error",
            Priority::Warning => "Warning",
            Priority::Notice => "Notice",
            Priority::Informational => "Informational",
            Priority::Debug => "Debug",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rule-based alerting channel that snapshots can be routed through.
///
/// The channel owns its own formatting and delivery; the dispatcher only hands
/// over the fields. Errors are logged by the dispatcher and never retried.
pub trait RuleSink: Send + Sync {
    /// Deliver one notification.
    fn handle_msg(
        &self,
        ts: u64,
        priority: Priority,
        msg: &str,
        rule: &str,
        fields: &OutputFields,
    ) -> Result<()>;

    /// Notifications the channel dropped so far, reported in every snapshot.
    fn queue_num_drops(&self) -> u64 {
        0
    }
}

/// Rule sink that delivers nothing, for writers that only use the file sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRuleSink;

impl RuleSink for NoopRuleSink {
    fn handle_msg(
        &self,
        _ts: u64,
        _priority: Priority,
        _msg: &str,
        _rule: &str,
        _fields: &OutputFields,
    ) -> Result<()> {
        Ok(())
    }
}
