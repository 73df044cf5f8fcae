// src/model/idempotency.rs
//! Idempotency records for retried submissions

use crate::model::ids::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Maps an idempotency key to the run it produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,

    /// Hash of the request that first used the key
    pub fingerprint: String,

    pub run_id: RunId,
    pub created_at: DateTime<Utc>,
}

/// Stable SHA-256 fingerprint over the request fields, in order
pub fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
