//! Pacing producers between the reader and the worker pool.
//!
//! Both dispatchers expose the same surface: a bounded channel of
//! operations that closes once the source is exhausted. They differ only in
//! pacing. [`best_effort`] preloads the ops into memory and then drains
//! them as fast as workers will accept, keeping reader latency out of the
//! measurement window. [`by_time`] reads lazily and sleeps to reproduce the
//! capture's inter-arrival gaps; a full channel stretches those gaps, which
//! is the documented backpressure behavior, and since only one op is ever
//! in flight from the producer the skew stays bounded.
//!
//! Closing the reader (its stop handle, or plain EOF) terminates either
//! producer task and closes the channel, draining the pipeline downstream.

use std::time::Duration;

use metrics::counter;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::op::Op;
use crate::ops_reader::OpsReader;

/// Channel capacity when draining a preloaded queue.
const BEST_EFFORT_CAPACITY: usize = 10_000;
/// Channel capacity under original-timing pacing; sleeps do most of the
/// pacing, the bound only catches workers falling far behind.
const BY_TIME_CAPACITY: usize = 5_000;
/// Preload progress is logged every this many loaded records.
const PRELOAD_LOG_EVERY: usize = 30_000;
/// By-time progress is logged every this many records read.
const BY_TIME_LOG_EVERY: u64 = 10_000;

/// Preload up to `ops_size` ops, then dispatch them as fast as workers
/// accept. The returned channel closes when the queue is drained.
pub async fn best_effort(mut reader: Box<dyn OpsReader>, ops_size: usize) -> mpsc::Receiver<Op> {
    info!("started preloading ops: as fast as possible");
    let epoch = Instant::now();

    // Grow past this on demand; a huge configured budget must not
    // preallocate the moon.
    let mut queue = Vec::with_capacity(ops_size.min(1 << 20));
    while queue.len() < ops_size && !reader.all_loaded() {
        let Some(op) = reader.next().await else { break };
        queue.push(op);
        if queue.len() % PRELOAD_LOG_EVERY == 0 {
            report_preload(reader.ops_read(), epoch);
        }
    }
    report_preload(reader.ops_read(), epoch);

    let (tx, rx) = mpsc::channel(BEST_EFFORT_CAPACITY);
    tokio::spawn(async move {
        info!("started dispatching ops: as fast as workers accept");
        for op in queue {
            counter!("ops_dispatched").increment(1);
            if tx.send(op).await.is_err() {
                warn!("op channel closed before dispatching finished");
                break;
            }
        }
        info!("dispatching ended");
    });
    rx
}

/// Dispatch up to `ops_size` ops lazily, sleeping to preserve the
/// capture's original inter-arrival timing. The returned channel closes
/// when the source is exhausted.
pub fn by_time(mut reader: Box<dyn OpsReader>, ops_size: usize) -> mpsc::Receiver<Op> {
    let (tx, rx) = mpsc::channel(BY_TIME_CAPACITY);
    tokio::spawn(async move {
        info!("started dispatching ops: preserving original timing");
        let wall_epoch = Instant::now();
        let mut recording_epoch: Option<i64> = None;

        let mut dispatched = 0;
        while dispatched < ops_size && !reader.all_loaded() {
            let Some(op) = reader.next().await else { break };
            let millis = op.timestamp.timestamp_millis();
            let epoch = *recording_epoch.get_or_insert(millis);

            // Negative deltas (out-of-order capture) collapse to zero sleep.
            let delta = Duration::from_millis(u64::try_from(millis - epoch).unwrap_or(0));
            let elapsed = wall_epoch.elapsed();
            if delta > elapsed {
                sleep(delta - elapsed).await;
            }

            counter!("ops_dispatched").increment(1);
            if tx.send(op).await.is_err() {
                warn!("op channel closed before dispatching finished");
                break;
            }
            dispatched += 1;
            if reader.ops_read() % BY_TIME_LOG_EVERY == 0 {
                debug!(latest_op_millis = millis, "dispatch progress");
            }
        }
        info!("dispatching ended");
    });
    rx
}

fn report_preload(ops_read: u64, epoch: Instant) {
    let elapsed_secs = epoch.elapsed().as_secs_f64();
    let ops_per_sec = if elapsed_secs > 0.0 {
        ops_read as f64 / elapsed_secs
    } else {
        0.0
    };
    info!(ops_loaded = ops_read, elapsed_secs, ops_per_sec, "preload progress");
}
