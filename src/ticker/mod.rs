use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Value of the shared tick counter.
///
/// Wraps silently on overflow. Readers only ever compare two observed values
/// for inequality, so wraparound is harmless.
pub type Tick = u16;

/// Errors raised while installing or replacing the periodic timer.
#[derive(Error, Debug)]
pub enum TickerError {
    #[error("periodic timer interval must be > 0")]
    ZeroInterval,

    #[error("could not set up periodic timer: {0}")]
    Setup(#[source] std::io::Error),

    #[error("could not create periodic timer: {0}")]
    Create(#[source] std::io::Error),

    #[error("could not delete previous timer: timer thread panicked")]
    Delete,
}

/// Cheap, cloneable read handle on the shared tick counter.
#[derive(Debug, Clone, Default)]
pub struct Ticker {
    counter: Arc<AtomicU16>,
}

impl Ticker {
    /// Return the current tick without blocking.
    pub fn read(&self) -> Tick {
        self.counter.load(Ordering::Relaxed)
    }

    /// Advance the counter by one, exactly as a timer firing does.
    ///
    /// Lets an embedder that already owns a periodic callback drive sampling
    /// without installing a timer.
    pub fn advance(&self) {
        self.counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct Timer {
    interval: Duration,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodic clock that increments a [`Ticker`] once per interval.
///
/// The timer is an owned resource: `init` tears down any previously installed
/// timer before creating a new one, and `teardown` of a source that never had
/// a timer is a no-op.
#[derive(Default)]
pub struct TickSource {
    ticker: Ticker,
    timer: Option<Timer>,
}

impl std::fmt::Debug for TickSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickSource")
            .field("tick", &self.ticker.read())
            .field("interval", &self.timer.as_ref().map(|t| t.interval))
            .finish()
    }
}

impl TickSource {
    /// Create an idle tick source with no timer installed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a read handle on the tick counter.
    pub fn ticker(&self) -> Ticker {
        self.ticker.clone()
    }

    /// Return the current tick.
    pub fn read(&self) -> Tick {
        self.ticker.read()
    }

    /// Whether a periodic timer is currently installed.
    pub fn is_running(&self) -> bool {
        self.timer.is_some()
    }

    /// Install a periodic timer firing every `interval`.
    ///
    /// The first increment happens one full interval after this call.
    pub fn init(&mut self, interval: Duration) -> Result<(), TickerError> {
        if interval.is_zero() {
            return Err(TickerError::ZeroInterval);
        }

        self.stop_timer()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(TickerError::Setup)?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let ticker = self.ticker.clone();

        let handle = thread::Builder::new()
            .name("statsnap-ticker".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let start = tokio::time::Instant::now() + interval;
                    let mut periodic = tokio::time::interval_at(start, interval);
                    periodic.set_missed_tick_behavior(MissedTickBehavior::Skip);

                    loop {
                        tokio::select! {
                            _ = token.cancelled() => {
                                debug!("ticker stopped");
                                break;
                            }
                            _ = periodic.tick() => {
                                ticker.advance();
                            }
                        }
                    }
                });
            })
            .map_err(TickerError::Create)?;

        info!(interval = ?interval, "periodic ticker started");

        self.timer = Some(Timer {
            interval,
            cancel,
            handle,
        });

        Ok(())
    }

    /// Remove the installed timer, if any.
    pub fn teardown(&mut self) {
        if let Err(e) = self.stop_timer() {
            warn!(error = %e, "ticker teardown failed");
        }
    }

    fn stop_timer(&mut self) -> Result<(), TickerError> {
        let Some(timer) = self.timer.take() else {
            return Ok(());
        };

        timer.cancel.cancel();
        timer.handle.join().map_err(|_| TickerError::Delete)
    }
}

impl Drop for TickSource {
    fn drop(&mut self) {
        self.teardown();
    }
}
