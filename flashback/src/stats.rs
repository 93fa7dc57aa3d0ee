//! Streaming latency statistics for the replay run.
//!
//! One ingest task drains the stats channel and folds each record into two
//! windows per op type: a lifetime window that is never reset and an
//! interval window covering the period since the most recent snapshot.
//! Latency distributions live in `DDSketch` streaming quantile estimators,
//! so percentile queries are constant-space and approximate; counts and max
//! latency are exact. All windows sit behind one mutex that is held only
//! for a single record fold or a single snapshot copy, never across I/O.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ddsketch_agent::DDSketch;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::op::OpType;

/// The percentiles reported for every op type, in array order.
pub const LATENCY_PERCENTILES: [f64; 5] = [0.5, 0.7, 0.9, 0.95, 0.99];
/// Index of the 50th percentile in a latency array.
pub const P50: usize = 0;
/// Index of the 70th percentile in a latency array.
pub const P70: usize = 1;
/// Index of the 90th percentile in a latency array.
pub const P90: usize = 2;
/// Index of the 95th percentile in a latency array.
pub const P95: usize = 3;
/// Index of the 99th percentile in a latency array.
pub const P99: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// One executed op's outcome, as emitted by the executor.
pub struct OpStat {
    /// The canonicalized type of the op.
    pub op_type: OpType,
    /// Wall-clock duration of the attempt(s), combined.
    pub latency: Duration,
    /// Whether the op ultimately failed.
    pub error: bool,
}

/// Per-window accumulation state.
struct Window {
    epoch: Instant,
    sketches: FxHashMap<OpType, DDSketch>,
    max_latency: FxHashMap<OpType, f64>,
    counts: FxHashMap<OpType, u64>,
    ops_executed: u64,
    ops_errors: u64,
}

impl fmt::Debug for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Window")
            .field("ops_executed", &self.ops_executed)
            .field("ops_errors", &self.ops_errors)
            .field("op_types", &self.counts.len())
            .finish_non_exhaustive()
    }
}

impl Window {
    fn starting_at(epoch: Instant) -> Self {
        Self {
            epoch,
            sketches: FxHashMap::default(),
            max_latency: FxHashMap::default(),
            counts: FxHashMap::default(),
            ops_executed: 0,
            ops_errors: 0,
        }
    }

    fn record(&mut self, stat: &OpStat) {
        *self.counts.entry(stat.op_type).or_default() += 1;
        self.ops_executed += 1;
        if stat.error {
            self.ops_errors += 1;
        }

        let millis = stat.latency.as_secs_f64() * 1_000.0;
        // Filter infinity and NaN. DDSketch panics on infinite values.
        if millis.is_finite() {
            self.sketches.entry(stat.op_type).or_default().insert(millis);
            let max = self.max_latency.entry(stat.op_type).or_default();
            if *max < millis {
                *max = millis;
            }
        }
    }

    fn percentiles(&self, op_type: OpType) -> Vec<f64> {
        let sketch = self.sketches.get(&op_type);
        LATENCY_PERCENTILES
            .iter()
            .map(|&percentile| {
                sketch
                    .and_then(|sketch| sketch.quantile(percentile))
                    .unwrap_or_default()
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
/// A deep-copied snapshot of both statistic windows. Holding one never
/// blocks or aliases the analyzer.
pub struct ExecutionStatus {
    /// Ops executed since the run began.
    pub ops_executed: u64,
    /// Ops executed since the previous snapshot.
    pub interval_ops_executed: u64,
    /// Failed ops since the run began.
    pub ops_errors: u64,
    /// Failed ops since the previous snapshot.
    pub interval_ops_errors: u64,
    /// Lifetime throughput; zero-duration windows report zero.
    pub ops_per_sec: f64,
    /// Interval throughput.
    pub interval_ops_per_sec: f64,
    /// Wall-clock length of the interval window.
    pub interval_duration: Duration,
    /// Lifetime latency percentiles per op type, ordered as
    /// [`LATENCY_PERCENTILES`], in milliseconds.
    pub latencies: FxHashMap<OpType, Vec<f64>>,
    /// Interval latency percentiles per op type.
    pub interval_latencies: FxHashMap<OpType, Vec<f64>>,
    /// Exact lifetime maximum latency per op type, milliseconds.
    pub max_latency: FxHashMap<OpType, f64>,
    /// Exact interval maximum latency per op type.
    pub interval_max_latency: FxHashMap<OpType, f64>,
    /// Lifetime op count per type.
    pub counts: FxHashMap<OpType, u64>,
    /// Interval op count per type.
    pub interval_counts: FxHashMap<OpType, u64>,
    /// Lifetime throughput per type.
    pub type_ops_sec: FxHashMap<OpType, f64>,
    /// Interval throughput per type.
    pub interval_type_ops_sec: FxHashMap<OpType, f64>,
}

fn rate(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 { count as f64 / secs } else { 0.0 }
}

fn snapshot(lifetime: &Window, interval: &Window, now: Instant) -> ExecutionStatus {
    let elapsed = now.saturating_duration_since(lifetime.epoch);
    let interval_duration = now.saturating_duration_since(interval.epoch);

    let mut status = ExecutionStatus {
        ops_executed: lifetime.ops_executed,
        interval_ops_executed: interval.ops_executed,
        ops_errors: lifetime.ops_errors,
        interval_ops_errors: interval.ops_errors,
        ops_per_sec: rate(lifetime.ops_executed, elapsed),
        interval_ops_per_sec: rate(interval.ops_executed, interval_duration),
        interval_duration,
        latencies: FxHashMap::default(),
        interval_latencies: FxHashMap::default(),
        max_latency: FxHashMap::default(),
        interval_max_latency: FxHashMap::default(),
        counts: FxHashMap::default(),
        interval_counts: FxHashMap::default(),
        type_ops_sec: FxHashMap::default(),
        interval_type_ops_sec: FxHashMap::default(),
    };

    for op_type in OpType::ALL {
        let count = lifetime.counts.get(&op_type).copied().unwrap_or_default();
        let interval_count = interval.counts.get(&op_type).copied().unwrap_or_default();

        status.latencies.insert(op_type, lifetime.percentiles(op_type));
        status
            .interval_latencies
            .insert(op_type, interval.percentiles(op_type));
        status.max_latency.insert(
            op_type,
            lifetime.max_latency.get(&op_type).copied().unwrap_or_default(),
        );
        status.interval_max_latency.insert(
            op_type,
            interval.max_latency.get(&op_type).copied().unwrap_or_default(),
        );
        status.counts.insert(op_type, count);
        status.interval_counts.insert(op_type, interval_count);
        status.type_ops_sec.insert(op_type, rate(count, elapsed));
        status
            .interval_type_ops_sec
            .insert(op_type, rate(interval_count, interval_duration));
    }
    status
}

#[derive(Debug)]
struct State {
    lifetime: Window,
    interval: Window,
}

#[derive(Debug)]
/// Consumes op stats in the background and serves snapshots on demand.
pub struct StatsAnalyzer {
    state: Arc<Mutex<State>>,
    ingest: JoinHandle<()>,
}

impl StatsAnalyzer {
    /// Start the analyzer and its ingest task over `stats`. The task exits
    /// when every sender has been dropped.
    #[must_use]
    pub fn new(mut stats: mpsc::UnboundedReceiver<OpStat>) -> Self {
        let now = Instant::now();
        let state = Arc::new(Mutex::new(State {
            lifetime: Window::starting_at(now),
            interval: Window::starting_at(now),
        }));

        let ingest_state = Arc::clone(&state);
        let ingest = tokio::spawn(async move {
            while let Some(stat) = stats.recv().await {
                let mut state = ingest_state.lock().expect("stats state lock poisoned");
                state.lifetime.record(&stat);
                state.interval.record(&stat);
            }
            debug!("stats channel closed, ingest finished");
        });

        Self { state, ingest }
    }

    /// Snapshot both windows and atomically reset the interval window.
    #[must_use]
    pub fn status(&self) -> ExecutionStatus {
        let mut state = self.state.lock().expect("stats state lock poisoned");
        let now = Instant::now();
        let status = snapshot(&state.lifetime, &state.interval, now);
        state.interval = Window::starting_at(now);
        status
    }

    /// Wait for the ingest task to drain (all stat senders dropped), then
    /// return the final snapshot.
    pub async fn wait(self) -> ExecutionStatus {
        let Self { state, ingest } = self;
        if let Err(panic) = ingest.await {
            error!(error = %panic, "stats ingest task panicked");
        }
        let state = state.lock().expect("stats state lock poisoned");
        snapshot(&state.lifetime, &state.interval, Instant::now())
    }
}
