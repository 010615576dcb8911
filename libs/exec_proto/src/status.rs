//! Status-pipe payload interpretation.
//!
//! A worker finishes a DirectExec by writing at most one payload to the
//! status pipe and closing it. The payload is tri-modal and is decoded here,
//! once, into a tagged variant; "empty means success" must not leak past
//! this boundary as raw bytes.

use serde::{Deserialize, Serialize};

/// Execution telemetry a worker may report on success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecStats {
    #[serde(default)]
    pub cache_hits: u64,
    #[serde(default)]
    pub cache_misses: u64,
    #[serde(default)]
    pub bytes_scanned: u64,
    #[serde(default)]
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Zero bytes: the query finished cleanly with no telemetry.
    Success,
    /// A serialized stats record: success with telemetry.
    Stats(ExecStats),
    /// An encoded string (or an unparseable payload such as the literal
    /// `panic!` marker): the query failed with this message.
    Error(String),
}

pub fn parse_outcome(payload: &[u8]) -> Outcome {
    if payload.is_empty() {
        return Outcome::Success;
    }
    if let Ok(msg) = serde_json::from_slice::<String>(payload) {
        return Outcome::Error(msg);
    }
    if let Ok(stats) = serde_json::from_slice::<ExecStats>(payload) {
        return Outcome::Stats(stats);
    }
    Outcome::Error(String::from_utf8_lossy(payload).into_owned())
}

pub fn encode_error(msg: &str) -> Vec<u8> {
    serde_json::to_vec(msg).expect("string serialization is infallible")
}

pub fn encode_stats(stats: &ExecStats) -> Vec<u8> {
    serde_json::to_vec(stats).expect("stats serialization is infallible")
}
