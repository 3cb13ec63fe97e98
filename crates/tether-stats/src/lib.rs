//! Runtime statistics for Tether.
//!
//! Two halves:
//!
//! - [`StatsRecorder`] is a cheap, cloneable set of counters. The
//!   correlator records round-trip times and outbound bytes; the node
//!   records inbound bytes and peer changes.
//! - [`StatsMonitor`] samples the recorder on a fixed cadence and publishes
//!   a fresh [`NetworkStats`] snapshot each time. Sampling only runs while
//!   the lifecycle reports the link as connected.
//!
//! # Integration
//!
//! The monitor runs its own task around a `tokio::select!` loop:
//!
//! ```ignore
//! loop {
//!     tokio::select! {
//!         event = lifecycle_events.recv() => { /* gate sampling */ }
//!         _ = ticker.tick(), if sampling => { /* publish snapshot */ }
//!     }
//! }
//! ```

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_session::LifecycleEvent;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Sampling settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// How often a snapshot is published.
    pub sample_interval: Duration,
    /// Weight of the newest round-trip sample in the smoothed ping
    /// (0.0–1.0). 1.0 means "latest sample only".
    pub ping_smoothing: f64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(1),
            ping_smoothing: 0.1,
        }
    }
}

impl StatsConfig {
    /// Clamp and fix any out-of-range values so the config is safe to use.
    ///
    /// - A zero `sample_interval` becomes 100 ms.
    /// - `ping_smoothing` outside `(0.0, 1.0]` falls back to 0.1.
    pub fn validated(mut self) -> Self {
        if self.sample_interval.is_zero() {
            warn!("stats sample_interval is zero, using 100ms");
            self.sample_interval = Duration::from_millis(100);
        }
        if !(self.ping_smoothing > 0.0 && self.ping_smoothing <= 1.0) {
            warn!(
                ping_smoothing = self.ping_smoothing,
                "ping_smoothing out of range, using 0.1"
            );
            self.ping_smoothing = 0.1;
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// One published sample. Always replaced as a whole.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkStats {
    /// Smoothed round-trip time in milliseconds.
    pub ping_ms: f64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Messages (both directions) per second over the last interval.
    pub packets_per_second: f64,
    /// Remote peers currently linked.
    pub connection_count: usize,
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

/// Shared counters fed by the messaging layers.
#[derive(Clone, Debug)]
pub struct StatsRecorder {
    inner: Arc<Counters>,
}

#[derive(Debug)]
struct Counters {
    smoothing: f64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets: AtomicU64,
    connections: AtomicUsize,
    /// Exponential moving average of RTT in ms, `None` before the first sample.
    ping_ms: Mutex<Option<f64>>,
}

impl StatsRecorder {
    /// Creates a recorder whose ping average gives the newest sample
    /// weight `smoothing`.
    pub fn new(smoothing: f64) -> Self {
        Self {
            inner: Arc::new(Counters {
                smoothing,
                bytes_sent: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
                packets: AtomicU64::new(0),
                connections: AtomicUsize::new(0),
                ping_ms: Mutex::new(None),
            }),
        }
    }

    pub fn record_sent(&self, bytes: usize) {
        self.inner.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.inner.packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.inner.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.inner.packets.fetch_add(1, Ordering::Relaxed);
    }

    /// Folds one request/response round trip into the smoothed ping.
    pub fn record_rtt(&self, rtt: Duration) {
        let sample = rtt.as_secs_f64() * 1000.0;
        let alpha = self.inner.smoothing;
        let mut ping = self.ping();
        *ping = Some(match *ping {
            Some(prev) => prev * (1.0 - alpha) + sample * alpha,
            None => sample,
        });
        trace!(rtt_ms = sample, "round trip recorded");
    }

    pub fn peer_connected(&self) {
        self.inner.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peer_disconnected(&self) {
        // Saturating: a stray disconnect must not wrap the gauge.
        let _ = self
            .inner
            .connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn set_connection_count(&self, count: usize) {
        self.inner.connections.store(count, Ordering::Relaxed);
    }

    /// Total messages counted so far, both directions.
    pub fn packets(&self) -> u64 {
        self.inner.packets.load(Ordering::Relaxed)
    }

    /// A snapshot of the counters with `packets_per_second` left at 0.
    pub fn totals(&self) -> NetworkStats {
        NetworkStats {
            ping_ms: self.ping().unwrap_or(0.0),
            bytes_sent: self.inner.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.inner.bytes_received.load(Ordering::Relaxed),
            packets_per_second: 0.0,
            connection_count: self.inner.connections.load(Ordering::Relaxed),
        }
    }

    /// Zeroes every counter and forgets the ping average.
    pub fn reset(&self) {
        self.inner.bytes_sent.store(0, Ordering::Relaxed);
        self.inner.bytes_received.store(0, Ordering::Relaxed);
        self.inner.packets.store(0, Ordering::Relaxed);
        self.inner.connections.store(0, Ordering::Relaxed);
        *self.ping() = None;
    }

    fn ping(&self) -> MutexGuard<'_, Option<f64>> {
        self.inner.ping_ms.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for StatsRecorder {
    fn default() -> Self {
        Self::new(StatsConfig::default().ping_smoothing)
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Background sampler publishing [`NetworkStats`] on a fixed cadence.
///
/// Dropping the monitor stops its task.
pub struct StatsMonitor {
    recorder: StatsRecorder,
    stats: watch::Sender<NetworkStats>,
    task: JoinHandle<()>,
}

impl StatsMonitor {
    /// Spawns the sampling task.
    ///
    /// `connected` says whether the link is already up; after that,
    /// [`LifecycleEvent::Connected`] and [`LifecycleEvent::Disconnected`]
    /// switch sampling on and off.
    pub fn spawn(
        config: StatsConfig,
        recorder: StatsRecorder,
        events: broadcast::Receiver<LifecycleEvent>,
        connected: bool,
    ) -> Self {
        let config = config.validated();
        let (stats, _) = watch::channel(NetworkStats::default());
        debug!(interval = ?config.sample_interval, connected, "stats monitor started");

        let task = tokio::spawn(run(
            config.sample_interval,
            recorder.clone(),
            stats.clone(),
            events,
            connected,
        ));
        Self {
            recorder,
            stats,
            task,
        }
    }

    /// The latest published snapshot.
    pub fn current(&self) -> NetworkStats {
        self.stats.borrow().clone()
    }

    /// Watches every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<NetworkStats> {
        self.stats.subscribe()
    }

    pub fn recorder(&self) -> &StatsRecorder {
        &self.recorder
    }

    /// Zeroes the counters and publishes an empty snapshot.
    pub fn reset(&self) {
        self.recorder.reset();
        self.stats.send_replace(NetworkStats::default());
        debug!("stats reset");
    }
}

impl Drop for StatsMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    interval: Duration,
    recorder: StatsRecorder,
    stats: watch::Sender<NetworkStats>,
    mut events: broadcast::Receiver<LifecycleEvent>,
    mut sampling: bool,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick of `interval` completes immediately.
    ticker.tick().await;
    let mut rate = PacketRate::new(recorder.packets());

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(LifecycleEvent::Connected) => {
                    trace!("sampling resumed");
                    sampling = true;
                    ticker.reset();
                    rate = PacketRate::new(recorder.packets());
                }
                Ok(LifecycleEvent::Disconnected) => {
                    trace!("sampling paused");
                    sampling = false;
                }
                Ok(LifecycleEvent::StateChanged { .. }) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "stats monitor lagged behind lifecycle events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("lifecycle gone, stats monitor stopping");
                    return;
                }
            },
            _ = ticker.tick(), if sampling => {
                let mut snapshot = recorder.totals();
                snapshot.packets_per_second = rate.sample(recorder.packets());
                trace!(?snapshot, "stats sampled");
                stats.send_replace(snapshot);
            }
        }
    }
}

/// Packets-per-second over successive samples.
struct PacketRate {
    last_packets: u64,
    last_at: Instant,
}

impl PacketRate {
    fn new(packets: u64) -> Self {
        Self {
            last_packets: packets,
            last_at: Instant::now(),
        }
    }

    fn sample(&mut self, packets: u64) -> f64 {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_at).as_secs_f64();
        // Counters may have been reset since the last sample.
        let delta = packets.saturating_sub(self.last_packets);
        self.last_packets = packets;
        self.last_at = now;
        if elapsed > 0.0 {
            delta as f64 / elapsed
        } else {
            0.0
        }
    }
}
