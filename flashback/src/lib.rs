//! Flashback replays captured MongoDB-style workloads against a target
//! deployment while measuring latency and throughput.
//!
//! A capture file is an ordered concatenation of BSON op records. The
//! pipeline reads it lazily ([`ops_reader`]), paces it under a best-effort
//! or original-timing policy ([`dispatcher`]), executes it over a pool of
//! workers with independent child sessions ([`executor`]), and folds every
//! op's outcome into streaming percentile statistics ([`stats`]). The
//! [`replay`] module wires the pieces together for hosts that want the
//! whole pipeline rather than the parts.
//!
//! Side effects are not verified against the capture, and concurrent
//! workers may reorder dependent ops; this is a load-fidelity tool, not a
//! consistency checker.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::perf)]
#![deny(clippy::suspicious)]
#![deny(clippy::complexity)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::mod_module_files)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![warn(missing_copy_implementations)]
#![allow(clippy::cast_precision_loss)]

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod executor;
pub mod op;
pub mod ops_reader;
pub mod replay;
pub mod stats;
