// src/model/checkpoint.rs
//! Per-turn snapshots used to resume interrupted runs

use crate::model::ids::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Checkpoint captured at a runner-significant event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: RunId,

    /// Turn during which the checkpoint was written
    pub turn: u32,

    /// Runner-defined payload (e.g. the agent's session id)
    pub payload: serde_json::Value,

    pub created_at: DateTime<Utc>,
}
