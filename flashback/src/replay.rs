//! Wiring the pipeline together.
//!
//! [`Replay::start`] builds the reader stack described by the config,
//! positions it (seek to the start time first, then skip a record count),
//! hands it to the chosen dispatcher, and spawns the worker pool and stats
//! analyzer. The calling thread keeps the [`Replay`] handle: poll
//! [`Replay::status`] for periodic reporting, trip [`Replay::stop`] to end
//! the run early, and [`Replay::wait`] for the final drained snapshot.
//!
//! Shutdown is entirely flow-driven: the reader reports end (EOF, the
//! configured op budget, or the stop handle), the dispatcher closes its
//! channel, workers drain and exit, and only then does the stats channel
//! close, so no late stat is ever dropped on the floor.

use tokio::sync::mpsc;
use tracing::info;

use crate::client::Session;
use crate::config::{Config, Style};
use crate::dispatcher;
use crate::executor::Pool;
use crate::ops_reader::cyclic::{CyclicOpsReader, ReaderFactory};
use crate::ops_reader::{BsonOpsReader, OpsReader, StopHandle};
use crate::stats::{ExecutionStatus, OpStat, StatsAnalyzer};

#[derive(Debug, thiserror::Error)]
/// Errors produced while starting a replay.
pub enum Error {
    /// The reader stack could not be built or positioned.
    #[error(transparent)]
    Reader(#[from] crate::ops_reader::Error),
}

#[derive(Debug)]
/// A running replay pipeline.
pub struct Replay {
    analyzer: StatsAnalyzer,
    pool: Pool,
    stats_tx: mpsc::UnboundedSender<OpStat>,
    stop: StopHandle,
}

impl Replay {
    /// Build and start the whole pipeline.
    ///
    /// # Errors
    ///
    /// Fails when the capture cannot be opened, the filter spec is invalid,
    /// or positioning (`start_time`, `skip_ops`) runs past the end of the
    /// capture.
    pub async fn start<S>(config: &Config, session: S) -> Result<Self, Error>
    where
        S: Session + 'static,
    {
        let (mut reader, stop) = build_reader(config).await?;

        if let Some(start_time) = config.start_time {
            let skipped = reader.seek_to_timestamp(start_time).await?;
            info!(skipped, start_time, "positioned at start time");
        }
        if config.skip_ops > 0 {
            reader.skip(config.skip_ops).await?;
        }

        let ops = match config.style {
            Style::BestEffort => dispatcher::best_effort(reader, config.ops_size).await,
            Style::ByTime => dispatcher::by_time(reader, config.ops_size),
        };

        let (stats_tx, stats_rx) = mpsc::unbounded_channel();
        let analyzer = StatsAnalyzer::new(stats_rx);
        let pool = Pool::spawn(&session, config.workers, ops, Some(stats_tx.clone()));

        Ok(Self {
            analyzer,
            pool,
            stats_tx,
            stop,
        })
    }

    /// Snapshot the run's statistics, resetting the interval window.
    #[must_use]
    pub fn status(&self) -> ExecutionStatus {
        self.analyzer.status()
    }

    /// End the run early: the reader reports end of stream and the
    /// pipeline drains in order.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Wait for the pipeline to drain and return the final snapshot.
    pub async fn wait(self) -> ExecutionStatus {
        let Self {
            analyzer,
            pool,
            stats_tx,
            stop: _stop,
        } = self;

        pool.wait().await;
        // Workers are done emitting; closing the stats channel now lets the
        // ingest task drain and exit.
        drop(stats_tx);
        let status = analyzer.wait().await;
        info!(
            ops_executed = status.ops_executed,
            ops_errors = status.ops_errors,
            "replay finished"
        );
        status
    }
}

async fn build_reader(config: &Config) -> Result<(Box<dyn OpsReader>, StopHandle), Error> {
    if config.cyclic {
        let stop = StopHandle::default();
        let path = config.ops_filename.clone();
        let filter = config.op_filter.clone();
        let cycle_stop = stop.clone();
        let maker: ReaderFactory = Box::new(move || {
            let path = path.clone();
            let filter = filter.clone();
            let stop = cycle_stop.clone();
            Box::pin(async move {
                let reader = BsonOpsReader::open(path, &filter)
                    .await?
                    .with_stop_handle(stop);
                Ok(Box::new(reader) as Box<dyn OpsReader>)
            })
        });
        let reader = CyclicOpsReader::new(maker).await?;
        Ok((Box::new(reader), stop))
    } else {
        let reader = BsonOpsReader::open(&config.ops_filename, &config.op_filter).await?;
        let stop = reader.stop_handle();
        Ok((Box::new(reader), stop))
    }
}
