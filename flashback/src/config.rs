//! Replay configuration.
//!
//! The host owns parsing (CLI, files, whatever); this is the deserialized
//! knob set the replay core consumes.

use std::num::NonZeroUsize;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
/// How dispatch paces the captured ops.
pub enum Style {
    /// Preload, then emit as fast as workers accept.
    #[default]
    BestEffort,
    /// Sleep to preserve the capture's inter-arrival gaps.
    ByTime,
}

fn default_ops_size() -> usize {
    100_000
}

fn default_workers() -> NonZeroUsize {
    NonZeroUsize::new(10).expect("literal is non-zero")
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
/// Configuration of one replay run.
pub struct Config {
    /// Path to the captured ops file.
    pub ops_filename: PathBuf,
    /// Comma-separated op types to keep; empty replays everything.
    #[serde(default)]
    pub op_filter: String,
    /// Pacing policy.
    #[serde(default)]
    pub style: Style,
    /// Maximum number of ops to replay.
    #[serde(default = "default_ops_size")]
    pub ops_size: usize,
    /// Number of replay workers, each owning a child session.
    #[serde(default = "default_workers")]
    pub workers: NonZeroUsize,
    /// Records to skip before replay begins; applied after `start_time`.
    #[serde(default)]
    pub skip_ops: u64,
    /// Millisecond timestamp to seek to before replay begins. The seek
    /// consumes the first record at or after this time.
    #[serde(default)]
    pub start_time: Option<i64>,
    /// Re-open and replay the capture indefinitely.
    #[serde(default)]
    pub cyclic: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{ "ops_filename": "workload.bson" }"#).expect("parses");

        assert_eq!(config.ops_filename, PathBuf::from("workload.bson"));
        assert_eq!(config.op_filter, "");
        assert_eq!(config.style, Style::BestEffort);
        assert_eq!(config.ops_size, 100_000);
        assert_eq!(config.workers.get(), 10);
        assert_eq!(config.skip_ops, 0);
        assert_eq!(config.start_time, None);
        assert!(!config.cyclic);
    }

    #[test]
    fn full_config_round_trips() {
        let config: Config = serde_json::from_str(
            r#"{
                "ops_filename": "workload.bson",
                "op_filter": "insert,query",
                "style": "by_time",
                "ops_size": 500,
                "workers": 4,
                "skip_ops": 100,
                "start_time": 1396456709424,
                "cyclic": true
            }"#,
        )
        .expect("parses");

        assert_eq!(config.style, Style::ByTime);
        assert_eq!(config.workers.get(), 4);
        assert_eq!(config.start_time, Some(1_396_456_709_424));

        let text = serde_json::to_string(&config).expect("serializes");
        let back: Config = serde_json::from_str(&text).expect("round trips");
        assert_eq!(back, config);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result = serde_json::from_str::<Config>(
            r#"{ "ops_filename": "workload.bson", "verbosity": 3 }"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn zero_workers_is_rejected() {
        let result =
            serde_json::from_str::<Config>(r#"{ "ops_filename": "w.bson", "workers": 0 }"#);
        assert!(result.is_err());
    }
}
