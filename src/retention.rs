//! Retention classification & eviction (§4.6)

use crate::types::{Memory, Retention, EPHEMERAL_DEFAULT_TTL_SECONDS};

/// Inputs to retention classification (§4.6)
pub struct RetentionInputs {
    pub provided: Option<Retention>,
    pub pinned: bool,
    pub ttl_seconds: Option<i64>,
}

/// Classify retention from `{provided, pinned, ttl}` (§4.6)
pub fn resolve_retention(inputs: RetentionInputs) -> Retention {
    if let Some(provided) = inputs.provided {
        return provided;
    }
    if inputs.pinned {
        return Retention::Irreplaceable;
    }
    if let Some(ttl) = inputs.ttl_seconds {
        if ttl > 0 && ttl <= 3 * 86_400 {
            return Retention::Ephemeral;
        }
    }
    Retention::Replaceable
}

/// Apply retention invariants to a (ttl, expires_at) pair, returning the
/// possibly-adjusted TTL (§4.1 step 6, §3 invariants 3-4).
pub fn apply_retention_invariants(retention: Retention, ttl_seconds: Option<i64>) -> Option<i64> {
    if retention.is_protected() {
        return None;
    }
    if retention == Retention::Ephemeral && ttl_seconds.is_none() {
        return Some(EPHEMERAL_DEFAULT_TTL_SECONDS);
    }
    ttl_seconds
}

/// Outcome of an eviction scan (§4.6)
pub struct EvictionOutcome {
    pub evicted_id: Option<uuid::Uuid>,
    pub explanation: String,
}

/// Maximum number of oldest unpinned memories scanned for eviction (§4.6)
pub const EVICTION_SCAN_LIMIT: usize = 200;

/// Pick the eviction candidate among a caller-provided scan window of the
/// oldest unpinned memories in `(orgId, projectId, subjectId)`, ascending by
/// `createdAt` (§4.6). The caller is responsible for producing that window
/// (via the storage layer) and excluding pinned memories.
pub fn pick_eviction_candidate(oldest_unpinned_ascending: &[Memory]) -> EvictionOutcome {
    let mut best: Option<&Memory> = None;

    for candidate in oldest_unpinned_ascending.iter().take(EVICTION_SCAN_LIMIT) {
        if candidate.retention.is_protected() {
            continue;
        }
        best = match best {
            None => Some(candidate),
            Some(current) => {
                if candidate.retention.priority() < current.retention.priority() {
                    Some(candidate)
                } else {
                    Some(current)
                }
            }
        };
    }

    match best {
        Some(m) => EvictionOutcome {
            evicted_id: Some(m.id),
            explanation: format!("evicted lowest-priority unpinned memory {}", m.id),
        },
        None => EvictionOutcome {
            evicted_id: None,
            explanation: "no eviction candidate found".to_string(),
        },
    }
}
