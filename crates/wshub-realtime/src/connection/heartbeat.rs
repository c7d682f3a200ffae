//! Ping/pong heartbeat for WebSocket liveness.
//!
//! One sweep per interval covers every registered connection. A connection
//! still awaiting the pong for the previous sweep's ping is terminated;
//! every other open connection is pinged. An unresponsive peer is therefore
//! evicted between one and two intervals after it goes silent.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::handle::{Connection, HeartbeatState};
use super::registry::ConnectionRegistry;
use crate::metrics::EngineMetrics;
use crate::transport::ReadyState;

/// What a sweep did to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// A ping was sent.
    Pinged,
    /// The connection missed the previous ping and was terminated.
    Evicted,
    /// Nothing to do (not open, or already closed).
    Skipped,
}

/// Totals for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Connections pinged.
    pub pinged: usize,
    /// Connections terminated.
    pub evicted: usize,
}

/// Advance one connection's heartbeat state machine.
pub fn check(connection: &Connection, metrics: &EngineMetrics) -> Verdict {
    if connection.ready_state() == ReadyState::Closed {
        return Verdict::Skipped;
    }

    match connection.heartbeat_state() {
        HeartbeatState::AwaitingPong => {
            warn!(
                conn_id = %connection.id,
                remote_addr = ?connection.remote_addr(),
                "Connection missed heartbeat, terminating"
            );
            connection.terminate();
            metrics.eviction();
            Verdict::Evicted
        }
        HeartbeatState::Idle if !connection.is_open() => Verdict::Skipped,
        HeartbeatState::Idle => {
            // Flag first so a fast pong cannot be overwritten.
            let _ = connection.begin_ping();
            match connection.socket().ping() {
                Ok(()) => {
                    metrics.ping_sent();
                    Verdict::Pinged
                }
                Err(e) => {
                    debug!(conn_id = %connection.id, error = %e, "Heartbeat ping failed");
                    connection.report(e);
                    Verdict::Skipped
                }
            }
        }
    }
}

/// Run one sweep over every registered connection.
pub fn sweep(registry: &ConnectionRegistry, metrics: &EngineMetrics) -> SweepReport {
    let mut report = SweepReport::default();
    for connection in registry.snapshot() {
        match check(&connection, metrics) {
            Verdict::Pinged => report.pinged += 1,
            Verdict::Evicted => report.evicted += 1,
            Verdict::Skipped => {}
        }
    }
    report
}

/// Run the heartbeat loop until `shutdown` fires.
///
/// The first sweep happens one full `interval` after start.
pub async fn run_heartbeat(
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<EngineMetrics>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let report = sweep(&registry, &metrics);
                trace!(pinged = report.pinged, evicted = report.evicted, "Heartbeat sweep");
            }
        }
    }

    debug!("Heartbeat loop ended");
}
