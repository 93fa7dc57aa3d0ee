//! Canonicalization, per-type dispatch, retry, and the worker pool.
//!
//! Each worker owns an [`OpsExecutor`] wrapping a child session copied from
//! the pool's parent. Per op, the executor canonicalizes raw commands,
//! dispatches to the sub-executor for the op's type, retries exactly once
//! over a refreshed session when the failure looks transport-shaped, and
//! emits one latency/outcome record. Per-op failures never take a worker
//! down; the stat record is the failure's whole story.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, trace, warn};

use crate::client::{self, Collection, Session};
use crate::op::{Op, OpType};
use crate::stats::OpStat;

#[derive(Debug, thiserror::Error)]
/// Errors produced while executing one op.
pub enum Error {
    /// A command whose first key is neither `count` nor `findandmodify`.
    #[error("op type not supported")]
    NotSupported,
    /// A `findandmodify` command missing a required sub-document.
    #[error("missing {field} document in findandmodify operation")]
    MissingField {
        /// Name of the absent sub-document.
        field: &'static str,
    },
    /// A `findandmodify` sub-document with the wrong shape.
    #[error("bad {field} document in findandmodify operation")]
    BadField {
        /// Name of the malformed sub-document.
        field: &'static str,
    },
    /// A recognized command whose operand is not a collection name.
    #[error("command operand for {command:?} is not a collection name")]
    BadOperand {
        /// The command name.
        command: String,
    },
    /// A driver failure; see [`client::Error`] for the kinds.
    #[error(transparent)]
    Client(#[from] client::Error),
}

impl Error {
    fn is_retryable(&self) -> bool {
        matches!(self, Error::Client(error) if error.is_retryable())
    }
}

/// Rewrite a raw `command` op into its typed form.
///
/// `count` and `findandmodify` commands become [`OpType::Count`] and
/// [`OpType::FindAndModify`], with `collection` rewritten to the command's
/// operand. Non-command ops pass through untouched, which also makes the
/// rewrite idempotent.
///
/// # Errors
///
/// [`Error::NotSupported`] for any other command; [`Error::BadOperand`]
/// when the operand is not a string.
pub fn canonicalize(op: &mut Op) -> Result<(), Error> {
    if op.op_type != OpType::Command {
        return Ok(());
    }
    let (rewritten, collection) = {
        let Some((name, operand)) = op.command_head() else {
            return Err(Error::NotSupported);
        };
        let rewritten = match name {
            "count" => OpType::Count,
            "findandmodify" => OpType::FindAndModify,
            _ => return Err(Error::NotSupported),
        };
        let Some(collection) = operand.as_str() else {
            return Err(Error::BadOperand {
                command: name.to_string(),
            });
        };
        (rewritten, collection.to_string())
    };
    op.collection = collection;
    op.op_type = rewritten;
    Ok(())
}

/// What happened to an op that produced no error.
enum Outcome {
    /// Dispatched to the target.
    Done,
    /// Recognized and deliberately not replayed (`getmore`); emits no stat.
    Skipped,
}

#[derive(Debug)]
/// Executes ops against one child session.
pub struct OpsExecutor<S: Session> {
    session: S,
    stats: Option<mpsc::UnboundedSender<OpStat>>,
    last_latency: Duration,
}

impl<S: Session> OpsExecutor<S> {
    /// Wrap a child session. When `stats` is given, one record per executed
    /// op is emitted on it.
    pub fn new(session: S, stats: Option<mpsc::UnboundedSender<OpStat>>) -> Self {
        Self {
            session,
            stats,
            last_latency: Duration::ZERO,
        }
    }

    /// Execute one op end to end: canonicalize, dispatch, retry per policy,
    /// emit the stat.
    ///
    /// # Errors
    ///
    /// The final failure after the retry policy ran its course. Callers in
    /// the pool log and move on; the error never aborts a worker.
    pub async fn execute(&mut self, mut op: Op) -> Result<(), Error> {
        let start = Instant::now();
        let outcome = self.execute_inner(&mut op).await;
        let latency = start.elapsed();
        self.last_latency = latency;

        match &outcome {
            Ok(Outcome::Skipped) => {}
            Ok(Outcome::Done) | Err(_) => {
                if let Some(stats) = &self.stats {
                    // A dropped receiver means the run is over; late stats
                    // are deliberately discarded.
                    let _ = stats.send(OpStat {
                        op_type: op.op_type,
                        latency,
                        error: outcome.is_err(),
                    });
                }
            }
        }
        outcome.map(|_| ())
    }

    /// Wall-clock duration of the most recent `execute`, retries included.
    #[must_use]
    pub fn last_latency(&self) -> Duration {
        self.last_latency
    }

    async fn execute_inner(&mut self, op: &mut Op) -> Result<Outcome, Error> {
        canonicalize(op)?;
        if op.op_type == OpType::GetMore {
            // Cursor continuations are not replayable standalone.
            return Ok(Outcome::Skipped);
        }

        match self.dispatch(op).await {
            Err(failure) if failure.is_retryable() => {
                warn!(error = %failure, op_type = %op.op_type, "retrying op on a refreshed session");
                self.session.refresh().await;
                self.dispatch(op).await.map(|()| Outcome::Done)
            }
            other => other.map(|()| Outcome::Done),
        }
    }

    async fn dispatch(&self, op: &Op) -> Result<(), Error> {
        let collection = self.session.collection(&op.database, &op.collection);
        match op.op_type {
            OpType::Query => Self::exec_query(op, &collection).await,
            OpType::Insert => Self::exec_insert(op, &collection).await,
            OpType::Update => Self::exec_update(op, &collection).await,
            OpType::Remove => Self::exec_remove(op, &collection).await,
            OpType::Count => {
                collection.count().await?;
                Ok(())
            }
            OpType::FindAndModify => Self::exec_find_and_modify(op, &collection).await,
            OpType::Command | OpType::GetMore => Err(Error::NotSupported),
        }
    }

    async fn exec_query(op: &Op, collection: &S::Collection) -> Result<(), Error> {
        let query = op.query_doc.clone().unwrap_or_default();
        let results = collection.find(query, op.n_to_skip, op.n_to_return).await?;
        trace!(returned = results.len(), "query result set materialized");
        Ok(())
    }

    async fn exec_insert(op: &Op, collection: &S::Collection) -> Result<(), Error> {
        let doc = op.insert_doc.clone().unwrap_or_default();
        collection.insert(doc).await?;
        Ok(())
    }

    async fn exec_update(op: &Op, collection: &S::Collection) -> Result<(), Error> {
        let query = op.query_doc.clone().unwrap_or_default();
        let update = op.update_doc.clone().unwrap_or_default();
        collection.update(query, update).await?;
        Ok(())
    }

    async fn exec_remove(op: &Op, collection: &S::Collection) -> Result<(), Error> {
        let query = op.query_doc.clone().unwrap_or_default();
        collection.remove(query).await?;
        Ok(())
    }

    async fn exec_find_and_modify(op: &Op, collection: &S::Collection) -> Result<(), Error> {
        let Some(command) = op.command_doc.as_ref() else {
            return Err(Error::MissingField { field: "command" });
        };
        let query = sub_document(command, "query")?;
        let update = sub_document(command, "update")?;
        collection.find_and_modify(query, update).await?;
        Ok(())
    }
}

fn sub_document(command: &bson::Document, field: &'static str) -> Result<bson::Document, Error> {
    match command.get(field) {
        Some(bson::Bson::Document(doc)) => Ok(doc.clone()),
        Some(_) => Err(Error::BadField { field }),
        None => Err(Error::MissingField { field }),
    }
}

#[derive(Debug)]
/// A fixed set of replay workers draining the dispatcher's channel.
pub struct Pool {
    workers: JoinSet<()>,
}

impl Pool {
    /// Spawn `workers` workers, each with a child session copied from
    /// `parent`. Workers exit when the op channel closes.
    #[must_use]
    pub fn spawn<S>(
        parent: &S,
        workers: NonZeroUsize,
        ops: mpsc::Receiver<Op>,
        stats: Option<mpsc::UnboundedSender<OpStat>>,
    ) -> Self
    where
        S: Session + 'static,
    {
        let ops = Arc::new(Mutex::new(ops));
        let mut set = JoinSet::new();
        for worker in 0..workers.get() {
            let mut executor = OpsExecutor::new(parent.copy(), stats.clone());
            let ops = Arc::clone(&ops);
            set.spawn(async move {
                loop {
                    let received = { ops.lock().await.recv().await };
                    let Some(op) = received else { break };
                    let op_type = op.op_type;
                    match executor.execute(op).await {
                        Ok(()) => counter!("ops_replayed").increment(1),
                        Err(failure) => {
                            counter!("op_failures").increment(1);
                            debug!(worker, %op_type, error = %failure, "op failed");
                        }
                    }
                }
                trace!(worker, "worker finished");
            });
        }
        Self { workers: set }
    }

    /// Wait for every worker to finish draining the channel.
    pub async fn wait(mut self) {
        while let Some(joined) = self.workers.join_next().await {
            if let Err(panic) = joined {
                error!(error = %panic, "replay worker panicked");
            }
        }
    }
}
