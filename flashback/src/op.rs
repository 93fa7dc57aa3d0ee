//! The captured-operation data model.
//!
//! One [`Op`] is a single request recorded against the source deployment,
//! decoded from one BSON document of the capture file. Documents ride along
//! as [`bson::Document`] values because key order is significant: the first
//! key of a command document names the command, and canonicalization in the
//! executor depends on it.

use std::fmt;
use std::str::FromStr;

use bson::{DateTime, Document};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown op type {0:?}")]
/// A filter spec named an op type that does not exist.
pub struct UnknownOpType(
    /// The offending name as it appeared in the spec string.
    pub String,
);

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
/// The kind of a captured operation.
///
/// `command.count` and `command.findandmodify` never appear in raw capture
/// files; they are produced by canonicalizing `command` ops. `getmore` is
/// recognized so the executor can skip it: a cursor continuation is not
/// replayable on its own.
pub enum OpType {
    /// Document insertion.
    #[serde(rename = "insert")]
    Insert,
    /// Single-document update.
    #[serde(rename = "update")]
    Update,
    /// Single-document removal.
    #[serde(rename = "remove")]
    Remove,
    /// A find, optionally paged by `ntoskip`/`ntoreturn`.
    #[serde(rename = "query")]
    Query,
    /// A raw server command, not yet canonicalized.
    #[serde(rename = "command")]
    Command,
    /// A canonicalized `count` command.
    #[serde(rename = "command.count")]
    Count,
    /// A canonicalized `findandmodify` command.
    #[serde(rename = "command.findandmodify")]
    FindAndModify,
    /// A cursor continuation; recognized and skipped.
    #[serde(rename = "getmore")]
    GetMore,
}

impl OpType {
    /// Every op type, in report order.
    pub const ALL: [OpType; 8] = [
        OpType::Insert,
        OpType::Update,
        OpType::Remove,
        OpType::Query,
        OpType::Command,
        OpType::Count,
        OpType::FindAndModify,
        OpType::GetMore,
    ];

    /// The wire tag for this op type, as it appears in capture files and
    /// filter specs.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            OpType::Insert => "insert",
            OpType::Update => "update",
            OpType::Remove => "remove",
            OpType::Query => "query",
            OpType::Command => "command",
            OpType::Count => "command.count",
            OpType::FindAndModify => "command.findandmodify",
            OpType::GetMore => "getmore",
        }
    }

    /// Parse a comma-separated filter spec into the set of op types to keep.
    ///
    /// An empty spec yields an empty set, which disables filtering.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownOpType`] if any element of the spec is not a known
    /// op type tag.
    pub fn parse_filter(spec: &str) -> Result<FxHashSet<OpType>, UnknownOpType> {
        spec.split(',')
            .map(str::trim)
            .filter(|element| !element.is_empty())
            .map(OpType::from_str)
            .collect()
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for OpType {
    type Err = UnknownOpType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OpType::ALL
            .into_iter()
            .find(|op_type| op_type.tag() == s)
            .ok_or_else(|| UnknownOpType(s.to_string()))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
/// One captured operation, with enough detail to be replayed.
///
/// The serde field names match the capture-file record format. `database`
/// and `collection` are not part of the record; the reader derives them from
/// `ns` during normalization, and canonicalization may later rewrite
/// `collection` to a command's operand.
pub struct Op {
    /// Namespace of the op, `"<database>.<collection>"`. Commands carry the
    /// sentinel collection `$cmd`.
    #[serde(rename = "ns")]
    pub ns: String,
    /// Database part of `ns`, populated by normalization.
    #[serde(skip)]
    pub database: String,
    /// Collection part of `ns`, populated by normalization and rewritten by
    /// canonicalization for `count`/`findandmodify` commands.
    #[serde(skip)]
    pub collection: String,
    /// The kind of this op.
    #[serde(rename = "op")]
    pub op_type: OpType,
    /// When the op was originally performed.
    #[serde(rename = "ts")]
    pub timestamp: DateTime,
    /// Paging hint for queries; zero means absent.
    #[serde(rename = "ntoskip", default)]
    pub n_to_skip: i32,
    /// Paging hint for queries; zero means absent.
    #[serde(rename = "ntoreturn", default)]
    pub n_to_return: i32,
    /// The document inserted by an `insert` op.
    #[serde(rename = "o", default, skip_serializing_if = "Option::is_none")]
    pub insert_doc: Option<Document>,
    /// Selector for `query`, `update` and `remove` ops.
    #[serde(rename = "query", default, skip_serializing_if = "Option::is_none")]
    pub query_doc: Option<Document>,
    /// Mutation applied by an `update` op.
    #[serde(rename = "updateobj", default, skip_serializing_if = "Option::is_none")]
    pub update_doc: Option<Document>,
    /// Full command document of a `command` op; the first key is the
    /// command name.
    #[serde(rename = "command", default, skip_serializing_if = "Option::is_none")]
    pub command_doc: Option<Document>,
}

impl Op {
    /// The first element of the command document, which names the command
    /// and carries its operand.
    #[must_use]
    pub fn command_head(&self) -> Option<(&str, &bson::Bson)> {
        self.command_doc
            .as_ref()
            .and_then(|command| command.iter().next())
            .map(|(name, operand)| (name.as_str(), operand))
    }
}
