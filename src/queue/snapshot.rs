//! Reconciliation snapshots over recently processed items.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Content fingerprint over a window of recently processed items.
///
/// Produced by the outgoing-active side of a handover and recomputed by the
/// incoming-active side. It detects divergence; it cannot replay messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoverSnapshot {
    /// SHA-256 over the canonical JSON of the window, in order, as hex.
    pub reference_hash: String,
    /// Number of items actually hashed, possibly fewer than requested.
    pub batch_size: usize,
}

impl HandoverSnapshot {
    /// Snapshot of an empty window; accepting it resumes from scratch.
    pub fn empty() -> Self {
        snapshot_of::<()>(&VecDeque::new(), 0)
    }

    /// True when the window held no items.
    pub fn is_empty(&self) -> bool {
        self.batch_size == 0
    }
}

/// Hashes the last `window` entries of `recent` in order.
pub(crate) fn snapshot_of<S: Serialize>(recent: &VecDeque<S>, window: usize) -> HandoverSnapshot {
    let skip = recent.len().saturating_sub(window);
    let mut hasher = Sha256::new();
    let mut batch_size = 0;
    for stored in recent.iter().skip(skip) {
        let canonical =
            serde_json::to_string(stored).expect("stored item serialization must succeed");
        hasher.update(canonical.as_bytes());
        batch_size += 1;
    }
    HandoverSnapshot {
        reference_hash: to_hex(&hasher.finalize()),
        batch_size,
    }
}

fn to_hex(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        encoded.push_str(&format!("{byte:02x}"));
    }
    encoded
}
