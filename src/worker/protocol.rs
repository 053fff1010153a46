//! Wire format of a result channel.
//!
//! A worker writes exactly one JSON-serialized, newline-terminated message.

use crate::error::Failure;
use crate::runtime::ResolutionReport;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The single message a worker delivers to its initiator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChannelMessage {
    /// The argument resolved to `value`; `report` covers the worker's subtree.
    #[serde(rename = "value")]
    Value {
        value: Value,
        #[serde(default)]
        report: ResolutionReport,
    },

    /// Resolution failed inside the worker.
    #[serde(rename = "failure")]
    Failure { failure: Failure },
}

impl ChannelMessage {
    pub fn value(value: Value, report: ResolutionReport) -> Self {
        Self::Value { value, report }
    }

    pub fn failure(failure: Failure) -> Self {
        Self::Failure { failure }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}
