//! Infinite adapter over a finite capture.
//!
//! Long-running load tests frequently outlast their capture file. The
//! cyclic adapter wraps a reader factory and, whenever the current reader
//! is exhausted, closes it, carries its record count forward, re-opens a
//! fresh one and resumes. The stream is conceptually infinite, so
//! [`OpsReader::all_loaded`] never reports true.

use std::fmt;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::info;

use super::{Error, OpsReader};
use crate::op::Op;

/// Factory producing a fresh reader for each cycle.
pub type ReaderFactory =
    Box<dyn FnMut() -> BoxFuture<'static, Result<Box<dyn OpsReader>, Error>> + Send>;

/// Reader adapter that loops its source indefinitely.
pub struct CyclicOpsReader {
    maker: ReaderFactory,
    reader: Box<dyn OpsReader>,
    previous_read: u64,
    error: Option<Error>,
}

impl fmt::Debug for CyclicOpsReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CyclicOpsReader")
            .field("previous_read", &self.previous_read)
            .field("current_read", &self.reader.ops_read())
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl CyclicOpsReader {
    /// Build the adapter, opening the first cycle's reader right away.
    ///
    /// # Errors
    ///
    /// Propagates the factory's failure to produce the initial reader.
    pub async fn new(mut maker: ReaderFactory) -> Result<Self, Error> {
        let reader = maker().await?;
        Ok(Self {
            maker,
            reader,
            previous_read: 0,
            error: None,
        })
    }
}

#[async_trait]
impl OpsReader for CyclicOpsReader {
    async fn next(&mut self) -> Option<Op> {
        if self.error.is_some() {
            return None;
        }
        if let Some(op) = self.reader.next().await {
            return Some(op);
        }

        info!(
            ops_read = self.ops_read(),
            "ops stream exhausted, recycling from the start"
        );
        self.previous_read += self.reader.ops_read();
        self.reader.close();
        match (self.maker)().await {
            Ok(reader) => self.reader = reader,
            Err(error) => {
                self.error = Some(error);
                return None;
            }
        }

        let op = self.reader.next().await;
        if op.is_none() {
            self.error = Some(Error::EmptyCycle);
        }
        op
    }

    async fn skip(&mut self, n: u64) -> Result<(), Error> {
        self.reader.skip(n).await
    }

    async fn seek_to_timestamp(&mut self, start_time: i64) -> Result<u64, Error> {
        self.reader.seek_to_timestamp(start_time).await
    }

    fn ops_read(&self) -> u64 {
        self.previous_read + self.reader.ops_read()
    }

    fn all_loaded(&self) -> bool {
        false
    }

    fn last_error(&self) -> Option<&Error> {
        self.error.as_ref().or_else(|| self.reader.last_error())
    }

    fn close(&mut self) {
        self.reader.close();
    }
}
