//! Per-transfer statistics collection and round reporting.
//!
//! Workers record a [`TransferStats`] at completion through a cloneable
//! [`StatsSink`]; after the round's join barrier the single
//! [`StatsCollector`] drains the queue FIFO and hands one formatted line per
//! record to an injected [`Reporter`]. Collection is decoupled from
//! formatting so callers can swap the output sink.

use std::fmt;

use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// TransferStats
// ---------------------------------------------------------------------------

/// Which transfer path produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Tcp,
    Udp,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKind::Tcp => write!(f, "TCP"),
            TransferKind::Udp => write!(f, "UDP"),
        }
    }
}

/// Outcome of one completed transfer worker.
///
/// Created exactly once per worker that finishes its transfer; workers that
/// abort emit nothing.
#[derive(Debug, Clone)]
pub struct TransferStats {
    pub kind: TransferKind,
    /// 1-based position of the worker within its round.
    pub transfer_num: u32,
    pub elapsed_secs: f64,
    /// Speed against the nominal file size, in bits per second.
    pub bits_per_second: f64,
    /// Share of distinct segments that arrived. UDP only.
    pub packets_received_percent: Option<f64>,
}

/// Format one record the way the round report prints it.
pub fn format_summary(stats: &TransferStats) -> String {
    let mut line = format!(
        "{} transfer #{} finished, total time: {:.2} seconds, total speed: {:.1} bits/second",
        stats.kind, stats.transfer_num, stats.elapsed_secs, stats.bits_per_second,
    );
    if let Some(percent) = stats.packets_received_percent {
        line.push_str(&format!(
            ", percentage of packets received successfully: {:.1}%",
            percent
        ));
    }
    line
}

// ---------------------------------------------------------------------------
// Reporter
// ---------------------------------------------------------------------------

/// Sink receiving one formatted line per drained record.
pub trait Reporter: Send + Sync {
    fn report(&self, line: &str);
}

/// Default reporter: one tracing line per record.
pub struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn report(&self, line: &str) {
        tracing::info!("{line}");
    }
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

/// Producer half of the statistics queue. Cheap to clone; one per worker.
#[derive(Clone)]
pub struct StatsSink {
    tx: mpsc::UnboundedSender<TransferStats>,
}

impl StatsSink {
    /// Record one completed transfer. A closed collector means the process
    /// is shutting down, so the record is silently dropped.
    pub fn record(&self, stats: TransferStats) {
        let _ = self.tx.send(stats);
    }
}

/// Consumer half of the statistics queue. Drained once per round, after the
/// join barrier, so the queue is empty entering the next round.
pub struct StatsCollector {
    rx: mpsc::UnboundedReceiver<TransferStats>,
}

impl StatsCollector {
    /// Create a connected sink/collector pair.
    pub fn channel() -> (StatsSink, StatsCollector) {
        let (tx, rx) = mpsc::unbounded_channel();
        (StatsSink { tx }, StatsCollector { rx })
    }

    /// Drain every queued record in FIFO order through `reporter`.
    ///
    /// Returns the number of records reported. Only called after all of the
    /// round's workers have terminated, so nothing races the drain.
    pub fn drain(&mut self, reporter: &dyn Reporter) -> usize {
        let mut drained = 0;
        while let Ok(stats) = self.rx.try_recv() {
            reporter.report(&format_summary(&stats));
            drained += 1;
        }
        drained
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
