//! The seam between the executor pool and the database driver.
//!
//! The replay core never talks to a driver directly; it goes through
//! [`Session`] and [`Collection`]. A session is copied once per worker so
//! each worker owns an independent child it may refresh after transport
//! failures without disturbing its siblings. Collection handles expose
//! exactly the operations the replay dispatch table needs.
//!
//! Driver failures collapse into the four kinds the retry policy
//! distinguishes: server-side query and write errors (never retried),
//! missing documents (never retried), and transport-class failures (one
//! session refresh and one more attempt).

use async_trait::async_trait;
use bson::Document;

pub mod mongo;

#[derive(Debug, thiserror::Error)]
/// Errors surfaced by driver adapters.
pub enum Error {
    /// The server rejected a query or command.
    #[error("query error: {0}")]
    Query(String),
    /// The server failed to acknowledge a write.
    #[error("write error: {0}")]
    LastError(String),
    /// No document matched a single-document operation.
    #[error("not found")]
    NotFound,
    /// A connection-level failure; the session is suspect.
    #[error("transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Whether refreshing the session and retrying once is worthwhile.
    /// Only transport-class failures qualify; logical errors would simply
    /// repeat.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

/// A replayer's connection to the target deployment.
///
/// The parent session is configured once at startup and treated read-only
/// afterwards; workers call [`Session::copy`] to obtain children.
#[async_trait]
pub trait Session: Send + Sync {
    /// The collection handle type this session produces.
    type Collection: Collection;

    /// Derive an independent child session sharing the parent's
    /// configuration. Refreshing the child must not affect the parent or
    /// any sibling.
    fn copy(&self) -> Self
    where
        Self: Sized;

    /// Re-establish this session's connections after a transport failure.
    /// Best effort: a refresh that fails leaves the session as it was.
    async fn refresh(&mut self);

    /// A handle on `database`.`name`.
    fn collection(&self, database: &str, name: &str) -> Self::Collection;
}

/// The per-collection operations the replay dispatch table needs.
///
/// Handles are owned values a worker may hold across its database round
/// trips. Single-document operations follow the original driver's
/// semantics: an update, removal or find-and-modify that matches nothing
/// is [`Error::NotFound`].
#[async_trait]
pub trait Collection: Send + Sync + 'static {
    /// Run a find and materialize the full result set. `skip` and `limit`
    /// apply only when positive. The results force the driver round-trip;
    /// callers do not inspect them.
    async fn find(&self, query: Document, skip: i32, limit: i32) -> Result<Vec<Document>, Error>;

    /// Insert one document.
    async fn insert(&self, doc: Document) -> Result<(), Error>;

    /// Update a single document matching `query`, no upsert.
    async fn update(&self, query: Document, update: Document) -> Result<(), Error>;

    /// Remove a single document matching `query`.
    async fn remove(&self, query: Document) -> Result<(), Error>;

    /// Count the collection's documents, unfiltered.
    async fn count(&self) -> Result<u64, Error>;

    /// Find a single document matching `query` and apply `update` to it,
    /// returning the document.
    async fn find_and_modify(
        &self,
        query: Document,
        update: Document,
    ) -> Result<Document, Error>;
}
