//! Keep-alive and idle-timeout monitoring.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use subwire_protocol::SubProtocol;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::outbound::OutboundQueue;

/// Tracks when the peer was last heard from.
#[derive(Debug)]
pub struct Liveness {
    last_seen: Mutex<Instant>,
}

impl Liveness {
    /// Start tracking from now.
    pub fn new() -> Self {
        Self {
            last_seen: Mutex::new(Instant::now()),
        }
    }

    /// Record inbound traffic.
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// When the peer was last heard from.
    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock()
    }

    /// Time since the peer was last heard from.
    pub fn idle_for(&self) -> Duration {
        self.last_seen().elapsed()
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of the keep-alive loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepAliveResult {
    /// No inbound traffic within the idle timeout.
    TimedOut,
    /// The monitor was cancelled externally.
    Cancelled,
    /// The outbound writer is gone.
    WriterClosed,
}

/// Timing parameters of the monitor.
#[derive(Clone, Copy, Debug)]
pub(crate) struct KeepAliveTiming {
    pub interval: Duration,
    pub idle_timeout: Duration,
    pub send_pings: bool,
}

/// Run the keep-alive monitor for an acknowledged connection.
///
/// On every `interval` tick the sub-protocol's keep-alive message (if any)
/// is queued. Legacy responders also send one immediately. If the local end
/// enforces the idle timeout and nothing arrives for `idle_timeout`,
/// returns [`KeepAliveResult::TimedOut`].
pub(crate) async fn run_keep_alive(
    protocol: Arc<dyn SubProtocol>,
    liveness: Arc<Liveness>,
    outbound: OutboundQueue,
    timing: KeepAliveTiming,
    cancel: CancellationToken,
) -> KeepAliveResult {
    let message = protocol.keep_alive_message(timing.send_pings);
    let enforce = protocol.enforces_idle_timeout();
    let immediate = matches!(
        protocol.keep_alive_style(),
        subwire_protocol::KeepAliveStyle::ResponderKeepAlive
    );

    let start = if immediate {
        Instant::now()
    } else {
        Instant::now() + timing.interval
    };
    let mut ticker = time::interval_at(start, timing.interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        let deadline = liveness.last_seen() + timing.idle_timeout;
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(message) = &message {
                    if !outbound.send(message.clone()).await {
                        return KeepAliveResult::WriterClosed;
                    }
                }
            }
            () = time::sleep_until(deadline), if enforce => {
                // Traffic may have arrived while sleeping; re-check.
                if liveness.idle_for() >= timing.idle_timeout {
                    warn!(idle_ms = u64::try_from(timing.idle_timeout.as_millis()).unwrap_or(u64::MAX), "peer idle beyond timeout");
                    return KeepAliveResult::TimedOut;
                }
            }
            () = cancel.cancelled() => {
                debug!("keep-alive monitor cancelled");
                return KeepAliveResult::Cancelled;
            }
        }
    }
}
