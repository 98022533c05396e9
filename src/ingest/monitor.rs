//! StatusMonitor: periodic telemetry snapshots on a low-priority thread.
//!
//! Every interval the monitor samples each registered loop, logs the
//! snapshot at debug level and offers it on a bounded channel. A receiver
//! that falls behind loses snapshots rather than slowing anything down; the
//! losses are counted.

use crate::config::MIN_MONITOR_INTERVAL_MS;
use crate::ingest::source::RawSource;
use crate::ingest::worker::IngestShared;
use crate::types::IngestStats;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Longest single sleep, so a stop request is noticed promptly
const STOP_POLL: Duration = Duration::from_millis(50);

struct Watched {
    shared: Arc<IngestShared>,
    source: Arc<dyn RawSource>,
}

/// Builder for the status thread.
pub struct StatusMonitor {
    interval: Duration,
    channel_depth: usize,
    watched: Vec<Watched>,
}

impl StatusMonitor {
    /// Intervals below the minimum are raised to it.
    pub fn new(interval: Duration, channel_depth: usize) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(MIN_MONITOR_INTERVAL_MS)),
            channel_depth: channel_depth.max(1),
            watched: Vec::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn watch(mut self, shared: Arc<IngestShared>, source: Arc<dyn RawSource>) -> Self {
        self.watched.push(Watched { shared, source });
        self
    }

    /// Start the `pktflow-status` thread.
    pub fn spawn(self) -> std::io::Result<MonitorHandle> {
        let (tx, rx) = bounded(self.channel_depth);
        let running = Arc::new(AtomicBool::new(true));
        let dropped = Arc::new(AtomicU64::new(0));

        let thread = {
            let running = Arc::clone(&running);
            let dropped = Arc::clone(&dropped);
            std::thread::Builder::new()
                .name("pktflow-status".to_string())
                .spawn(move || self.run(tx, running, dropped))?
        };

        Ok(MonitorHandle {
            rx,
            running,
            dropped,
            thread,
        })
    }

    fn run(self, tx: Sender<IngestStats>, running: Arc<AtomicBool>, dropped: Arc<AtomicU64>) {
        tracing::debug!(interval = ?self.interval, sources = self.watched.len(), "status monitor started");
        let mut next = Instant::now() + self.interval;

        'outer: while running.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now < next {
                std::thread::sleep((next - now).min(STOP_POLL));
                continue;
            }
            next += self.interval;

            for watched in &self.watched {
                let stats = watched.shared.stats(watched.source.as_ref());
                tracing::debug!(
                    source_id = %stats.source_id,
                    status = %stats.status,
                    received = stats.counters.packets_received,
                    processed = stats.counters.packets_processed,
                    dropped = stats.counters.packets_dropped,
                    push_rate = stats.push_rate,
                    read_rate = stats.read_rate,
                    fill = %format!("{:.1}%", stats.buffer_fill()),
                    "status"
                );
                match tx.try_send(stats) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TrySendError::Disconnected(_)) => break 'outer,
                }
            }
        }
        tracing::debug!("status monitor stopped");
    }
}

/// Handle to the status thread.
pub struct MonitorHandle {
    rx: Receiver<IngestStats>,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    thread: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn receiver(&self) -> &Receiver<IngestStats> {
        &self.rx
    }

    /// Snapshots lost because the receiver lagged.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn join(self) {
        self.stop();
        if self.thread.join().is_err() {
            tracing::error!("status thread panicked");
        }
    }
}
