//! Consecutive-failure tracking per (agent, profile) routing pair.
//!
//! A sustained run of counting failures signals that the routing
//! configuration has drifted (a model renamed, deprecated, or withdrawn).
//! The consumer that acts on the signal lives outside the core; this module
//! only keeps the counters honest:
//!
//! - success resets a pair's count to zero
//! - `model_not_available`, `output_invalid`, `other_failure` increment
//! - `timeout_or_probe`, `access_or_auth`, `billing_or_quota` neither
//!   increment nor reset — an auth or quota outage must never look like
//!   model drift, and must not mask one either

use crate::routing::Profile;
use crate::task::FailureClass;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PairKey {
    agent: String,
    profile: Profile,
}

/// In-memory consecutive-failure counters.
#[derive(Debug, Default)]
pub struct DriftTracker {
    counts: HashMap<PairKey, u32>,
}

impl DriftTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful attempt for the pair.
    pub fn record_success(&mut self, agent: &str, profile: Profile) {
        self.counts.insert(
            PairKey {
                agent: agent.to_string(),
                profile,
            },
            0,
        );
    }

    /// Record a failed attempt. Returns the pair's count after the update.
    pub fn record_failure(&mut self, agent: &str, profile: Profile, class: FailureClass) -> u32 {
        let key = PairKey {
            agent: agent.to_string(),
            profile,
        };
        if class.counts_toward_drift() {
            let count = self.counts.entry(key).or_insert(0);
            *count += 1;
            *count
        } else {
            self.counts.get(&key).copied().unwrap_or(0)
        }
    }

    /// Current consecutive-failure count for the pair.
    pub fn consecutive_failures(&self, agent: &str, profile: Profile) -> u32 {
        self.counts
            .get(&PairKey {
                agent: agent.to_string(),
                profile,
            })
            .copied()
            .unwrap_or(0)
    }
}
