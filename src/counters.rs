//! Rendezvous use-count state.
//!
//! The attack-detection component compares how often each relay actually
//! serves as a rendezvous point against how often its bandwidth weight says
//! it should. That comparison only means something if the expected weights
//! come from the same weighting pass the guard selection used, so after
//! every reconciliation the engine hands the freshly built sampler to
//! [`UseCounters::absorb`].
//!
//! This module owns the counter *state* only: it records uses, carries
//! counts across consensus changes, and exposes observed and expected
//! shares. Thresholds and the decision to act on an anomaly belong to the
//! external detection component.
//!
//! The counters travel inside [`GuardSet`](crate::GuardSet) and are
//! persisted with it as a single unit.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::sampler::RelaySampler;

/// Bucket identity for uses of relays absent from the current consensus.
///
/// Consensus churn means a rendezvous request can name a relay we have no
/// entry for; those uses are pooled here instead of being dropped.
pub const NOT_IN_CONSENSUS_ID: &str = "NOT_IN_CONSENSUS";

/// Observed and expected use of a single relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UseCount {
    /// The relay's fingerprint, or [`NOT_IN_CONSENSUS_ID`].
    pub identity: String,
    /// Number of observed uses.
    pub used: f64,
    /// Expected share of uses, from the relay's weight in the last pass.
    pub weight: f64,
}

impl UseCount {
    fn new(identity: String, weight: f64) -> Self {
        Self {
            identity,
            used: 0.0,
            weight,
        }
    }
}

/// Per-relay use counts plus the running total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UseCounters {
    /// Counts keyed by relay fingerprint.
    pub counts: HashMap<String, UseCount>,
    /// Total observed uses across all relays.
    pub total_uses: f64,
}

impl UseCounters {
    /// Creates empty counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one use of a relay.
    ///
    /// Unknown identities are pooled under [`NOT_IN_CONSENSUS_ID`].
    pub fn record_use(&mut self, identity: &str) {
        let key = if self.counts.contains_key(identity) {
            identity.to_string()
        } else {
            NOT_IN_CONSENSUS_ID.to_string()
        };

        self.counts
            .entry(key.clone())
            .or_insert_with(|| UseCount::new(key, 0.0))
            .used += 1.0;
        self.total_uses += 1.0;
    }

    /// Rebuilds the counter table from a fresh weighting pass.
    ///
    /// Every relay in the sampler's eligible population gets an entry
    /// carrying its normalized weight share. Counts observed under the
    /// previous consensus carry over for relays that are still present (and
    /// for the not-in-consensus bucket); counts for vanished relays are
    /// dropped and the total is recomputed from what remains.
    pub fn absorb<S: RelaySampler>(&mut self, sampler: &S) {
        let old_counts = std::mem::take(&mut self.counts);

        for (i, relay) in sampler.eligible().iter().enumerate() {
            self.counts.insert(
                relay.fingerprint.clone(),
                UseCount::new(relay.fingerprint.clone(), sampler.weight_share(i)),
            );
        }
        self.counts.insert(
            NOT_IN_CONSENSUS_ID.to_string(),
            UseCount::new(NOT_IN_CONSENSUS_ID.to_string(), 0.0),
        );

        for (identity, old) in old_counts {
            if let Some(current) = self.counts.get_mut(&identity) {
                current.used = old.used;
            }
        }

        self.total_uses = self.counts.values().map(|c| c.used).sum();
    }

    /// Observed share of total uses for a relay, as a fraction.
    pub fn usage_share(&self, identity: &str) -> f64 {
        if self.total_uses <= 0.0 {
            return 0.0;
        }
        self.counts
            .get(identity)
            .map(|c| c.used / self.total_uses)
            .unwrap_or(0.0)
    }

    /// Expected share of uses for a relay, as a fraction.
    pub fn expected_share(&self, identity: &str) -> f64 {
        self.counts.get(identity).map(|c| c.weight).unwrap_or(0.0)
    }
}
