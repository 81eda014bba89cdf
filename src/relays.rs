//! Relay ranking and indexing.
//!
//! Each consensus refresh hands the engine an unordered relay population.
//! [`RelayIndex::build`] turns it into the structure the rest of the crate
//! works from: relays sorted by descending effective bandwidth with a dense
//! rank equal to their position, plus a fingerprint lookup used for
//! down-relay detection.
//!
//! Effective bandwidth is the measured value from the bandwidth
//! authorities, falling back to the relay's advertised bandwidth when no
//! measurement exists. The fallback over-trusts self-reported figures for
//! unmeasured relays; it matches what the rest of the network does and is
//! accepted here as an approximation.

use std::collections::HashMap;

use stem_rs::descriptor::router_status::RouterStatusEntry;

/// Consensus bandwidth-weight table, keyed by weight name (`Wmm`, `Wmg`, ...).
pub type WeightTable = HashMap<String, i64>;

/// Returns true if `s` is a 40-character hexadecimal relay fingerprint.
pub fn is_valid_fingerprint(s: &str) -> bool {
    s.len() == 40 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Returns the bandwidth used for ranking and weighting a relay.
pub(crate) fn effective_bandwidth(relay: &RouterStatusEntry) -> u64 {
    relay.measured.or(relay.bandwidth).unwrap_or(0)
}

/// Relay population sorted and indexed for one reconciliation pass.
///
/// The sort is stable, so relays with equal bandwidth keep their input
/// order. Rank 0 is the highest-bandwidth relay.
#[derive(Debug, Default)]
pub struct RelayIndex {
    sorted: Vec<RouterStatusEntry>,
    rank_by_identity: HashMap<String, usize>,
}

impl RelayIndex {
    /// Builds the index from a raw relay population.
    pub fn build(relays: Vec<RouterStatusEntry>) -> Self {
        let mut sorted = relays;
        sorted.sort_by(|a, b| effective_bandwidth(b).cmp(&effective_bandwidth(a)));

        let rank_by_identity = sorted
            .iter()
            .enumerate()
            .map(|(rank, relay)| (relay.fingerprint.clone(), rank))
            .collect();

        Self {
            sorted,
            rank_by_identity,
        }
    }

    /// Returns true if a relay with this fingerprint is in the population.
    pub fn contains(&self, identity: &str) -> bool {
        self.rank_by_identity.contains_key(identity)
    }

    /// Returns the dense bandwidth rank of a relay, if present.
    pub fn rank_of(&self, identity: &str) -> Option<usize> {
        self.rank_by_identity.get(identity).copied()
    }

    /// Returns the relays in descending bandwidth order.
    pub fn relays(&self) -> &[RouterStatusEntry] {
        &self.sorted
    }

    /// Returns the number of relays in the population.
    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    /// Returns true if the population is empty.
    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }
}
