//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::probe::{Outcome, ProbeResult, ProtocolKind};

/// A monitored endpoint or host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub kind: ProtocolKind,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            address: String::new(),
            kind: ProtocolKind::Https,
            is_active: true,
            created_at: Utc::now(),
        }
    }
}

/// A probe result persisted against its target.
///
/// Never updated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRecord {
    pub id: i64,
    pub target_id: i64,
    pub checked_at: DateTime<Utc>,
    pub outcome: Outcome,
    pub response_time_ms: Option<u64>,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
}

impl CheckRecord {
    /// Build an unsaved record for `result`; the store assigns the id.
    pub fn new(target_id: i64, checked_at: DateTime<Utc>, result: &ProbeResult) -> Self {
        Self {
            id: 0,
            target_id,
            checked_at,
            outcome: result.outcome,
            response_time_ms: result.response_time_ms,
            status_code: result.status_code,
            error_message: result.error_message.clone(),
        }
    }

    #[cfg(test)]
    pub fn probe_result(&self) -> ProbeResult {
        ProbeResult {
            outcome: self.outcome,
            response_time_ms: self.response_time_ms,
            status_code: self.status_code,
            error_message: self.error_message.clone(),
        }
    }
}

/// A target together with its most recent check, if any.
///
/// `latest_check` is `None` when the target has never been checked, which is
/// "no data" rather than down.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetStatus {
    #[serde(flatten)]
    pub target: Target,
    pub latest_check: Option<CheckRecord>,
}
