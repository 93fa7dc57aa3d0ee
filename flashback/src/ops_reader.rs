//! Ordered, lazy readers over captured operation streams.
//!
//! A capture file is a plain concatenation of length-prefixed BSON
//! documents, one per recorded operation. [`BsonOpsReader`] decodes one
//! document per [`OpsReader::next`] call, applies the op-type keep-filter,
//! and normalizes every returned op: the namespace is split into database
//! and collection, and empty `$set`/`$unset` blocks are pruned from update
//! mutations because the target server rejects them as recorded.
//!
//! Decode failures are fatal to a reader: the error is retained for
//! [`OpsReader::last_error`] and the stream reports end. Skipped and
//! filtered records still advance `ops_read`, so the count always reflects
//! records decoded, not records returned.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bson::{Bson, Document};
use rustc_hash::FxHashSet;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tracing::info;

use crate::op::{Op, OpType, UnknownOpType};

pub mod cyclic;

/// Sized to keep the decoder fed from spinning disks during preload.
const READ_BUFFER_BYTES: usize = 5 * 1024 * 1024;
/// An empty BSON document is five bytes: length prefix plus terminator.
const MIN_DOCUMENT_BYTES: i32 = 5;
/// The server-side document cap; anything larger is a framing corruption.
const MAX_DOCUMENT_BYTES: i32 = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
/// Errors produced by readers.
pub enum Error {
    /// IO failure on the underlying source.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// A record failed BSON decoding.
    #[error("malformed op record: {0}")]
    Decode(#[from] bson::de::Error),
    /// A length prefix outside the valid document range.
    #[error("op record framing: document length {length} out of range")]
    Framing {
        /// The length prefix as read.
        length: i32,
    },
    /// A record whose `ts` field is missing or not a datetime.
    #[error("op record has no usable ts field")]
    MissingTimestamp,
    /// A namespace without the `<database>.<collection>` shape.
    #[error("invalid namespace {ns:?}")]
    Namespace {
        /// The namespace as recorded.
        ns: String,
    },
    /// A filter spec named an unknown op type.
    #[error(transparent)]
    Filter(#[from] UnknownOpType),
    /// Clean end of the ops stream.
    #[error("end of ops stream")]
    Eof,
    /// `seek_to_timestamp` exhausted the stream before any record matched.
    #[error("no ops found at or after {start_time}ms, {skipped} records skipped")]
    StartTimeNotFound {
        /// The requested start time, milliseconds since the epoch.
        start_time: i64,
        /// Records consumed before the stream ended.
        skipped: u64,
    },
    /// The cyclic adapter found the underlying source empty on a fresh
    /// cycle.
    #[error("the underlying ops reader is empty or invalid")]
    EmptyCycle,
}

/// Ordered, lazy source of captured operations.
///
/// Implementations are single-pass: records are decoded on demand and never
/// buffered beyond the op being returned.
#[async_trait]
pub trait OpsReader: Send {
    /// Decode and return the next op, or `None` once the stream is
    /// exhausted or a fatal error occurred. The error, if any, is
    /// retrievable via [`OpsReader::last_error`].
    async fn next(&mut self) -> Option<Op>;

    /// Advance past `n` records without decoding them. Does not count
    /// toward [`OpsReader::ops_read`].
    ///
    /// # Errors
    ///
    /// Propagates IO failures; reaching the end of the stream before `n`
    /// records yields [`Error::Eof`].
    async fn skip(&mut self, n: u64) -> Result<(), Error>;

    /// Discard records until one stamped at or after `start_time`
    /// (milliseconds since the epoch) is found, returning the number of
    /// records consumed. The first matching record is consumed too, not
    /// returned: callers positioning at an exact boundary lose one record.
    /// When combined with [`OpsReader::skip`], seek first.
    ///
    /// # Errors
    ///
    /// [`Error::StartTimeNotFound`] if the stream ends before any record
    /// matches; the error carries the count of records consumed.
    async fn seek_to_timestamp(&mut self, start_time: i64) -> Result<u64, Error>;

    /// Count of records decoded so far, whether or not the filter returned
    /// them.
    fn ops_read(&self) -> u64;

    /// True once the end of the stream has been observed.
    fn all_loaded(&self) -> bool;

    /// The most recent fatal reader error, if any.
    fn last_error(&self) -> Option<&Error>;

    /// Release the stream: subsequent `next` calls report end. Idempotent.
    /// The underlying OS handle is released when the reader drops.
    fn close(&mut self);
}

#[derive(Debug, Clone, Default)]
/// Cloneable switch that closes a reader from outside the task that owns
/// it. Tripping the handle makes the reader report end of stream, which
/// drains the whole replay pipeline (dispatcher, workers, analyzer) in
/// order.
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
}

impl StopHandle {
    /// Trip the switch. The owning reader reports end on its next read.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
/// Reader over a raw stream of length-prefixed BSON op records.
pub struct BsonOpsReader<R> {
    source: R,
    filter: FxHashSet<OpType>,
    ops_read: u64,
    eof: bool,
    error: Option<Error>,
    stop: StopHandle,
}

impl BsonOpsReader<BufReader<File>> {
    /// Open a capture file with a keep-filter parsed from `filter_spec`
    /// (comma-separated op type tags; empty keeps everything).
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be opened or the filter spec names an
    /// unknown op type.
    pub async fn open(path: impl AsRef<Path>, filter_spec: &str) -> Result<Self, Error> {
        let file = File::open(path).await?;
        let source = BufReader::with_capacity(READ_BUFFER_BYTES, file);
        Ok(Self::from_reader(source, filter_spec)?)
    }
}

impl<R> BsonOpsReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    /// Wrap any byte source carrying concatenated op records.
    ///
    /// # Errors
    ///
    /// Fails if the filter spec names an unknown op type.
    pub fn from_reader(source: R, filter_spec: &str) -> Result<Self, UnknownOpType> {
        Ok(Self {
            source,
            filter: OpType::parse_filter(filter_spec)?,
            ops_read: 0,
            eof: false,
            error: None,
            stop: StopHandle::default(),
        })
    }

    /// A handle that closes this reader from another task.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Replace the stop handle, so several readers (the cyclic adapter's
    /// successive cycles) share one switch.
    #[must_use]
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    /// Read one whole framed document, prefix included. `Ok(None)` is clean
    /// end of stream (or a tripped stop handle).
    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, Error> {
        if self.stop.is_stopped() {
            return Ok(None);
        }
        let mut prefix = [0_u8; 4];
        match self.source.read_exact(&mut prefix).await {
            Ok(_) => {}
            Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(error) => return Err(error.into()),
        }
        let length = i32::from_le_bytes(prefix);
        if !(MIN_DOCUMENT_BYTES..=MAX_DOCUMENT_BYTES).contains(&length) {
            return Err(Error::Framing { length });
        }
        #[allow(clippy::cast_sign_loss)]
        let mut frame = vec![0_u8; length as usize];
        frame[..4].copy_from_slice(&prefix);
        self.source.read_exact(&mut frame[4..]).await?;
        Ok(Some(frame))
    }
}

#[async_trait]
impl<R> OpsReader for BsonOpsReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn next(&mut self) -> Option<Op> {
        loop {
            if self.eof || self.error.is_some() {
                return None;
            }
            let frame = match self.read_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    self.eof = true;
                    return None;
                }
                Err(error) => {
                    self.error = Some(error);
                    return None;
                }
            };
            let mut op: Op = match bson::from_slice(&frame) {
                Ok(op) => op,
                Err(error) => {
                    self.error = Some(error.into());
                    return None;
                }
            };
            self.ops_read += 1;
            if !self.filter.is_empty() && !self.filter.contains(&op.op_type) {
                continue;
            }
            if let Err(error) = normalize_op(&mut op) {
                self.error = Some(error);
                return None;
            }
            return Some(op);
        }
    }

    async fn skip(&mut self, n: u64) -> Result<(), Error> {
        for _ in 0..n {
            if self.stop.is_stopped() {
                self.eof = true;
                return Err(Error::Eof);
            }
            let mut prefix = [0_u8; 4];
            match self.source.read_exact(&mut prefix).await {
                Ok(_) => {}
                Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => {
                    self.eof = true;
                    return Err(Error::Eof);
                }
                Err(error) => {
                    // Fatal, same as in `next`: the reader must not resume
                    // from a desynchronized position.
                    let kind = error.kind();
                    let message = error.to_string();
                    self.error = Some(Error::Io(error));
                    return Err(Error::Io(io::Error::new(kind, message)));
                }
            }
            let length = i32::from_le_bytes(prefix);
            if !(MIN_DOCUMENT_BYTES..=MAX_DOCUMENT_BYTES).contains(&length) {
                self.error = Some(Error::Framing { length });
                return Err(Error::Framing { length });
            }
            let body = u64::from(length.unsigned_abs()) - 4;
            let copied = tokio::io::copy(&mut (&mut self.source).take(body), &mut tokio::io::sink())
                .await?;
            if copied < body {
                self.eof = true;
                return Err(Error::Eof);
            }
        }
        info!(skipped = n, "done skipping ops");
        Ok(())
    }

    async fn seek_to_timestamp(&mut self, start_time: i64) -> Result<u64, Error> {
        let mut skipped: u64 = 0;
        loop {
            let Some(frame) = self.read_frame().await? else {
                self.eof = true;
                return Err(Error::StartTimeNotFound {
                    start_time,
                    skipped,
                });
            };
            skipped += 1;
            let record = Document::from_reader(frame.as_slice())?;
            let timestamp = record
                .get_datetime("ts")
                .map_err(|_| Error::MissingTimestamp)?;
            if timestamp.timestamp_millis() >= start_time {
                info!(
                    skipped,
                    start_time = timestamp.timestamp_millis(),
                    "seek reached start time"
                );
                return Ok(skipped);
            }
        }
    }

    fn ops_read(&self) -> u64 {
        self.ops_read
    }

    fn all_loaded(&self) -> bool {
        self.eof
    }

    fn last_error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    fn close(&mut self) {
        self.stop.stop();
    }
}

/// Normalize a freshly decoded op in place: derive `database`/`collection`
/// from the namespace and prune degenerate update blocks. Idempotent.
///
/// # Errors
///
/// [`Error::Namespace`] when the namespace does not split into a non-empty
/// database and collection; callers treat this as a decode failure.
pub fn normalize_op(op: &mut Op) -> Result<(), Error> {
    let (database, collection) = op
        .ns
        .split_once('.')
        .ok_or_else(|| Error::Namespace { ns: op.ns.clone() })?;
    if database.is_empty() || collection.is_empty() {
        return Err(Error::Namespace { ns: op.ns.clone() });
    }
    op.database = database.to_string();
    op.collection = collection.to_string();

    match op.op_type {
        OpType::Update => {
            if let Some(update) = op.update_doc.as_mut() {
                prune_empty_update_operators(update);
            }
        }
        OpType::Command => {
            if let Some(command) = op.command_doc.as_mut() {
                prune_findandmodify_update(command);
            }
        }
        _ => {}
    }
    Ok(())
}

/// Some operations are recorded with empty `$set`/`$unset` blocks; replayed
/// verbatim they make the target server reject the whole update. Drop
/// exactly those keys, nothing else.
fn prune_empty_update_operators(update: &mut Document) {
    for operator in ["$set", "$unset"] {
        let empty = matches!(update.get(operator), Some(Bson::Document(block)) if block.is_empty());
        if empty {
            update.remove(operator);
        }
    }
}

fn prune_findandmodify_update(command: &mut Document) {
    let is_findandmodify = command
        .iter()
        .next()
        .is_some_and(|(name, _)| name == "findandmodify");
    if !is_findandmodify {
        return;
    }
    if let Ok(update) = command.get_document_mut("update") {
        prune_empty_update_operators(update);
    }
}

#[cfg(test)]
mod tests {
    use bson::{DateTime, doc};
    use proptest::prelude::*;

    use super::*;

    fn insert_op(n: i64) -> Document {
        doc! {
            "ts": DateTime::from_millis(1_396_456_709_420 + n),
            "ns": "db.coll",
            "op": "insert",
            "o": { format!("logType{n}"): "warning", "message": format!("m{n}") },
        }
    }

    fn capture(records: &[Document]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for record in records {
            bytes.extend(bson::to_vec(record).expect("record serializes"));
        }
        bytes
    }

    fn five_inserts() -> Vec<u8> {
        capture(&(1..=5).map(insert_op).collect::<Vec<_>>())
    }

    #[tokio::test]
    async fn reads_every_record_in_order() {
        let bytes = five_inserts();
        let mut reader = BsonOpsReader::from_reader(bytes.as_slice(), "").expect("reader");

        let mut seen: u64 = 0;
        while let Some(op) = reader.next().await {
            seen += 1;
            assert_eq!(reader.ops_read(), seen);
            let millis = 1_396_456_709_420 + i64::try_from(seen).expect("small count");
            assert_eq!(op.timestamp.timestamp_millis(), millis);
            assert_eq!(op.database, "db");
            assert_eq!(op.collection, "coll");

            let insert = op.insert_doc.as_ref().expect("insert doc");
            for n in 1..=5_u64 {
                let key = format!("logType{n}");
                assert_eq!(insert.get(&key).is_some(), n == seen);
            }
            assert_eq!(insert.get_str("message").expect("message"), format!("m{seen}"));
        }
        assert_eq!(seen, 5);
        assert!(reader.all_loaded());
        assert!(reader.last_error().is_none());
    }

    #[tokio::test]
    async fn skip_advances_without_counting() {
        let bytes = five_inserts();
        let mut reader = BsonOpsReader::from_reader(bytes.as_slice(), "").expect("reader");

        reader.skip(1).await.expect("skip one");
        let first = reader.next().await.expect("op after skip");
        assert_eq!(
            first.insert_doc.expect("insert doc").get_str("message").expect("message"),
            "m2"
        );

        let mut remaining = 1;
        while reader.next().await.is_some() {
            remaining += 1;
        }
        assert_eq!(remaining, 4);
        assert_eq!(reader.ops_read(), 4);
    }

    #[tokio::test]
    async fn skip_past_end_reports_eof() {
        let bytes = five_inserts();
        let mut reader = BsonOpsReader::from_reader(bytes.as_slice(), "").expect("reader");

        let err = reader.skip(9).await.expect_err("skip past end");
        assert!(matches!(err, Error::Eof));
        assert!(reader.all_loaded());
    }

    #[tokio::test]
    async fn seek_consumes_the_first_matching_record() {
        let bytes = five_inserts();
        let mut reader = BsonOpsReader::from_reader(bytes.as_slice(), "").expect("reader");

        let skipped = reader
            .seek_to_timestamp(1_396_456_709_424)
            .await
            .expect("seek");
        assert_eq!(skipped, 4);

        let op = reader.next().await.expect("op after seek");
        assert_eq!(
            op.insert_doc.expect("insert doc").get_str("message").expect("message"),
            "m5"
        );
        assert!(reader.next().await.is_none());
        assert_eq!(reader.ops_read(), 1);
    }

    #[tokio::test]
    async fn seek_past_end_carries_the_count() {
        let bytes = five_inserts();
        let mut reader = BsonOpsReader::from_reader(bytes.as_slice(), "").expect("reader");

        let err = reader
            .seek_to_timestamp(2_000_000_000_000)
            .await
            .expect_err("seek past end");
        match err {
            Error::StartTimeNotFound { skipped, .. } => assert_eq!(skipped, 5),
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn filter_keeps_only_named_types() {
        let records = vec![
            insert_op(1),
            doc! {
                "ts": DateTime::from_millis(1_396_456_709_421),
                "ns": "db.coll",
                "op": "update",
                "query": { "_id": "foo" },
                "updateobj": { "$set": { "a": 1 } },
            },
            doc! {
                "ts": DateTime::from_millis(1_396_456_709_421),
                "ns": "db.$cmd",
                "op": "command",
                "command": { "findandmodify": "coll", "query": { "_id": "foo" } },
            },
        ];
        let bytes = capture(&records);

        for (spec, expected) in [("", 3), ("update", 1), ("update,insert", 2), ("update,insert,command", 3)] {
            let mut reader =
                BsonOpsReader::from_reader(bytes.as_slice(), spec).expect("reader");
            let mut returned = 0;
            while reader.next().await.is_some() {
                returned += 1;
            }
            assert_eq!(returned, expected, "filter spec {spec:?}");
            assert_eq!(reader.ops_read(), 3, "filters do not hide reads, spec {spec:?}");
        }

        assert!(BsonOpsReader::from_reader(bytes.as_slice(), "bogus").is_err());
    }

    #[tokio::test]
    async fn update_pruning_drops_only_empty_blocks() {
        let records = vec![doc! {
            "ts": DateTime::from_millis(1_396_457_119_032),
            "ns": "foo.bar",
            "op": "update",
            "query": { "_id": "foo" },
            "updateobj": { "$set": { "a": 1 }, "$unset": {} },
        }];
        let mut reader =
            BsonOpsReader::from_reader(capture(&records).as_slice(), "").expect("reader");

        let op = reader.next().await.expect("update op");
        let update = op.update_doc.expect("update doc");
        assert_eq!(update.get_document("$set").expect("$set intact"), &doc! { "a": 1 });
        assert!(!update.contains_key("$unset"));
    }

    #[tokio::test]
    async fn findandmodify_pruning_reaches_the_nested_update() {
        let records = vec![doc! {
            "ts": DateTime::from_millis(1_396_457_119_032),
            "ns": "foo.$cmd",
            "op": "command",
            "command": {
                "findandmodify": "bar",
                "query": { "_id": "foo" },
                "update": { "$set": { "b": 1 }, "$unset": {} },
            },
        }];
        let mut reader =
            BsonOpsReader::from_reader(capture(&records).as_slice(), "").expect("reader");

        let op = reader.next().await.expect("command op");
        let command = op.command_doc.expect("command doc");
        let update = command.get_document("update").expect("nested update");
        assert!(update.contains_key("$set"));
        assert!(!update.contains_key("$unset"));
    }

    #[tokio::test]
    async fn empty_stream_is_immediately_loaded() {
        let mut reader = BsonOpsReader::from_reader(&[][..], "").expect("reader");
        assert!(reader.next().await.is_none());
        assert_eq!(reader.ops_read(), 0);
        assert!(reader.all_loaded());
        assert!(reader.last_error().is_none());
    }

    #[tokio::test]
    async fn bad_framing_is_fatal() {
        let bytes = vec![1_u8, 0, 0, 0];
        let mut reader = BsonOpsReader::from_reader(bytes.as_slice(), "").expect("reader");
        assert!(reader.next().await.is_none());
        assert!(matches!(reader.last_error(), Some(Error::Framing { length: 1 })));
        assert!(!reader.all_loaded());
    }

    #[tokio::test]
    async fn bad_framing_during_skip_is_fatal() {
        let bytes = vec![1_u8, 0, 0, 0];
        let mut reader = BsonOpsReader::from_reader(bytes.as_slice(), "").expect("reader");

        let err = reader.skip(1).await.expect_err("corrupt prefix");
        assert!(matches!(err, Error::Framing { length: 1 }));
        assert!(matches!(reader.last_error(), Some(Error::Framing { length: 1 })));
        assert!(reader.next().await.is_none(), "reader does not resume");
    }

    #[tokio::test]
    async fn stop_handle_closes_the_stream() {
        let bytes = five_inserts();
        let mut reader = BsonOpsReader::from_reader(bytes.as_slice(), "").expect("reader");
        let stop = reader.stop_handle();

        assert!(reader.next().await.is_some());
        stop.stop();
        assert!(reader.next().await.is_none());
        assert!(reader.all_loaded());
    }

    #[test]
    fn normalization_is_idempotent() {
        let mut op = Op {
            ns: "foo.bar".to_string(),
            database: String::new(),
            collection: String::new(),
            op_type: OpType::Update,
            timestamp: DateTime::from_millis(0),
            n_to_skip: 0,
            n_to_return: 0,
            insert_doc: None,
            query_doc: Some(doc! { "_id": 1 }),
            update_doc: Some(doc! { "$set": { "a": 1 }, "$unset": {} }),
            command_doc: None,
        };

        normalize_op(&mut op).expect("first pass");
        let once = op.clone();
        normalize_op(&mut op).expect("second pass");
        assert_eq!(op, once);
        assert_eq!(op.database, "foo");
        assert_eq!(op.collection, "bar");
    }

    #[test]
    fn degenerate_namespaces_are_rejected() {
        for ns in ["nodot", ".coll", "db."] {
            let mut op = Op {
                ns: ns.to_string(),
                database: String::new(),
                collection: String::new(),
                op_type: OpType::Insert,
                timestamp: DateTime::from_millis(0),
                n_to_skip: 0,
                n_to_return: 0,
                insert_doc: Some(doc! { "a": 1 }),
                query_doc: None,
                update_doc: None,
                command_doc: None,
            };
            assert!(normalize_op(&mut op).is_err(), "namespace {ns:?}");
        }
    }

    proptest! {
        #[test]
        fn pruning_touches_nothing_else(
            set_values in proptest::collection::btree_map("[a-z]{1,6}", 0_i32..100, 0..4),
            keep_inc in any::<bool>(),
        ) {
            let mut set_block = Document::new();
            for (key, value) in &set_values {
                set_block.insert(key.clone(), *value);
            }
            let mut update = doc! { "$set": set_block.clone(), "$unset": {} };
            if keep_inc {
                update.insert("$inc", doc! {});
            }

            prune_empty_update_operators(&mut update);

            // Empty $unset always goes; $inc is never pruned, empty or not.
            prop_assert!(!update.contains_key("$unset"));
            prop_assert_eq!(update.contains_key("$inc"), keep_inc);
            if set_values.is_empty() {
                prop_assert!(!update.contains_key("$set"));
            } else {
                prop_assert_eq!(update.get_document("$set").expect("$set"), &set_block);
            }
        }
    }
}
