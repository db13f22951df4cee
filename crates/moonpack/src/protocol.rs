//! The worker's single stdout report
//!
//! A worker writes exactly one JSON document: either
//! `{"status":"success","bundle":{..}}` or
//! `{"status":"failure","diagnostic":".."}`.

use std::io::Write;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::bundle::BundleOutput;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerReport {
    Success { bundle: BundleOutput },
    Failure { diagnostic: String },
}

impl WorkerReport {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Process exit status a worker uses for this report
    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 1 }
    }

    pub fn write_to(&self, mut out: impl Write) -> Result<()> {
        serde_json::to_writer(&mut out, self).context("Failed to serialize worker report")?;
        out.write_all(b"\n")
            .and_then(|()| out.flush())
            .context("Failed to write worker report")
    }

    /// Parse a report from captured stdout; surrounding whitespace is ignored
    pub fn parse(stdout: &str) -> Result<Self> {
        serde_json::from_str(stdout.trim()).context("Worker output is not a valid report")
    }
}
