//! Bandwidth-weighted relay sampling.
//!
//! Guard candidates are drawn with probability proportional to their
//! bandwidth weight, so an attacker cannot cheaply position a low-capacity
//! relay into a vanguard slot. The weight of each relay is its effective
//! bandwidth multiplied by the consensus weight for its flag combination at
//! the requested path position:
//!
//! | Flags | Middle | Guard | Exit |
//! |-------|--------|-------|------|
//! | neither Guard nor Exit | Wmm | Wgm | Wem |
//! | Guard only | Wmg | Wgg | Weg |
//! | Exit only | Wme | Wge | Wee |
//! | Guard and Exit | Wmd | Wgd | Wed |
//!
//! The [`RelaySampler`] trait exposes exactly one pull operation: each call
//! to [`pick`](RelaySampler::pick) returns one eligible relay, and the
//! sequence is unbounded and may repeat. Duplicate avoidance and draw
//! budgets belong to the caller ([`crate::engine`]); the sampler itself
//! stays stateless across draws.

use rand::Rng;
use stem_rs::descriptor::router_status::RouterStatusEntry;

use crate::error::{Error, Result};
use crate::relays::{effective_bandwidth, RelayIndex, WeightTable};

/// Circuit position whose consensus weights apply to a draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathPosition {
    /// Entry position, `Wg*` weights.
    Guard,
    /// Middle position, `Wm*` weights. Vanguard layers are middle hops.
    Middle,
    /// Exit position, `We*` weights.
    Exit,
}

impl PathPosition {
    fn weight_key_prefix(&self) -> char {
        match self {
            PathPosition::Guard => 'g',
            PathPosition::Middle => 'm',
            PathPosition::Exit => 'e',
        }
    }
}

/// Flag restriction applied to the relay population before weighting.
///
/// A relay is eligible when it carries every mandatory flag and none of the
/// forbidden ones.
#[derive(Debug, Clone, Default)]
pub struct FlagFilter {
    /// Flags a relay must carry.
    pub mandatory: Vec<String>,
    /// Flags that disqualify a relay.
    pub forbidden: Vec<String>,
}

impl FlagFilter {
    /// Creates a filter from mandatory and forbidden flag lists.
    pub fn new(mandatory: Vec<String>, forbidden: Vec<String>) -> Self {
        Self {
            mandatory,
            forbidden,
        }
    }

    /// Returns true if the relay satisfies the filter.
    pub fn permits(&self, relay: &RouterStatusEntry) -> bool {
        self.mandatory.iter().all(|f| relay.flags.contains(f))
            && !self.forbidden.iter().any(|f| relay.flags.contains(f))
    }
}

/// One-pull interface over a weighted, restricted relay population.
///
/// Implementations return a single relay per [`pick`](RelaySampler::pick)
/// call, weighted by the supplied table. The accessors expose the eligible
/// population and its normalized weight shares so the use-count transfer can
/// stay consistent with the same weighting pass.
pub trait RelaySampler {
    /// Draws one eligible relay, weighted by bandwidth.
    fn pick(&self) -> Result<&RouterStatusEntry>;

    /// Returns the eligible population after restrictions.
    fn eligible(&self) -> &[RouterStatusEntry];

    /// Returns the fraction of total weight held by the relay at `index`
    /// into [`eligible`](RelaySampler::eligible).
    fn weight_share(&self, index: usize) -> f64;
}

/// Weight scale used by consensus weight values (parts per 10000).
const WEIGHT_SCALE: f64 = 10000.0;

/// Draw-by-cumulative-weight sampler over a restricted relay population.
pub struct BandwidthWeightedSampler {
    relays: Vec<RouterStatusEntry>,
    weights: Vec<f64>,
    weight_total: f64,
}

impl BandwidthWeightedSampler {
    /// Builds a sampler from an indexed population.
    ///
    /// Relays failing the flag filter are dropped; the survivors are
    /// weighted by effective bandwidth times the consensus multiplier for
    /// their flags at `position`. Missing weight keys default to the full
    /// scale value, matching how Tor treats an absent weight.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoEligibleRelays`] if the filter rejects the entire
    /// population or the total weight is zero.
    pub fn new(
        index: &RelayIndex,
        filter: &FlagFilter,
        table: &WeightTable,
        position: PathPosition,
    ) -> Result<Self> {
        let relays: Vec<RouterStatusEntry> = index
            .relays()
            .iter()
            .filter(|r| filter.permits(r))
            .cloned()
            .collect();

        if relays.is_empty() {
            return Err(Error::NoEligibleRelays);
        }

        let mut weights = Vec::with_capacity(relays.len());
        let mut weight_total = 0.0;
        for relay in &relays {
            let weight =
                effective_bandwidth(relay) as f64 * flag_multiplier(relay, position, table);
            weights.push(weight);
            weight_total += weight;
        }

        if weight_total <= 0.0 {
            return Err(Error::NoEligibleRelays);
        }

        Ok(Self {
            relays,
            weights,
            weight_total,
        })
    }
}

impl RelaySampler for BandwidthWeightedSampler {
    fn pick(&self) -> Result<&RouterStatusEntry> {
        let mut rng = rand::thread_rng();
        let choice = rng.gen_range(0.0..self.weight_total);

        let mut cumulative = 0.0;
        for (i, weight) in self.weights.iter().enumerate() {
            cumulative += weight;
            if cumulative > choice {
                return Ok(&self.relays[i]);
            }
        }

        // Floating point accumulation can land exactly on the total.
        Ok(self.relays.last().expect("population is non-empty"))
    }

    fn eligible(&self) -> &[RouterStatusEntry] {
        &self.relays
    }

    fn weight_share(&self, index: usize) -> f64 {
        self.weights[index] / self.weight_total
    }
}

/// Consensus weight multiplier for a relay's flag combination at a position.
fn flag_multiplier(relay: &RouterStatusEntry, position: PathPosition, table: &WeightTable) -> f64 {
    let has_guard = relay.flags.iter().any(|f| f == "Guard");
    let has_exit = relay.flags.iter().any(|f| f == "Exit");
    let pos = position.weight_key_prefix();

    let key = if has_guard && has_exit {
        format!("W{}d", pos)
    } else if has_exit {
        format!("W{}e", pos)
    } else if has_guard {
        format!("W{}g", pos)
    } else {
        format!("W{}m", pos)
    };

    table.get(&key).copied().unwrap_or(10000) as f64 / WEIGHT_SCALE
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashSet;
    use stem_rs::descriptor::router_status::RouterStatusEntryType;

    fn relay(fingerprint: &str, bandwidth: u64, flags: &[&str]) -> RouterStatusEntry {
        let mut r = RouterStatusEntry::new(
            RouterStatusEntryType::V3,
            format!("relay{}", &fingerprint[..4]),
            fingerprint.to_string(),
            Utc::now(),
            "192.0.2.1".parse().unwrap(),
            9001,
        );
        r.measured = Some(bandwidth);
        r.flags = flags.iter().map(|s| s.to_string()).collect();
        r
    }

    fn stable_fast(fingerprint: &str, bandwidth: u64) -> RouterStatusEntry {
        relay(fingerprint, bandwidth, &["Fast", "Stable"])
    }

    #[test]
    fn test_flag_filter() {
        let r = relay(&"A".repeat(40), 100, &["Fast", "Stable", "Valid"]);
        let filter = FlagFilter::new(
            vec!["Fast".to_string(), "Stable".to_string()],
            vec!["Authority".to_string()],
        );
        assert!(filter.permits(&r));

        let authority = relay(&"B".repeat(40), 100, &["Fast", "Stable", "Authority"]);
        assert!(!filter.permits(&authority));

        let slow = relay(&"C".repeat(40), 100, &["Stable"]);
        assert!(!filter.permits(&slow));
    }

    #[test]
    fn test_filter_drops_ineligible_relays() {
        let index = RelayIndex::build(vec![
            stable_fast(&"A".repeat(40), 100),
            relay(&"B".repeat(40), 900, &["Fast"]),
        ]);
        let filter = FlagFilter::new(vec!["Fast".to_string(), "Stable".to_string()], vec![]);
        let sampler =
            BandwidthWeightedSampler::new(&index, &filter, &WeightTable::new(), PathPosition::Middle)
                .unwrap();

        assert_eq!(sampler.eligible().len(), 1);
        assert_eq!(sampler.eligible()[0].fingerprint, "A".repeat(40));
    }

    #[test]
    fn test_empty_population_is_an_error() {
        let index = RelayIndex::build(vec![relay(&"A".repeat(40), 100, &["Exit"])]);
        let filter = FlagFilter::new(vec!["Fast".to_string()], vec![]);
        let result =
            BandwidthWeightedSampler::new(&index, &filter, &WeightTable::new(), PathPosition::Middle);
        assert!(matches!(result, Err(Error::NoEligibleRelays)));
    }

    #[test]
    fn test_zero_total_weight_is_an_error() {
        let index = RelayIndex::build(vec![stable_fast(&"A".repeat(40), 0)]);
        let filter = FlagFilter::default();
        let result =
            BandwidthWeightedSampler::new(&index, &filter, &WeightTable::new(), PathPosition::Middle);
        assert!(matches!(result, Err(Error::NoEligibleRelays)));
    }

    #[test]
    fn test_pick_returns_eligible_members() {
        let index = RelayIndex::build(vec![
            stable_fast(&"A".repeat(40), 100),
            stable_fast(&"B".repeat(40), 200),
            stable_fast(&"C".repeat(40), 300),
        ]);
        let filter = FlagFilter::new(vec!["Fast".to_string(), "Stable".to_string()], vec![]);
        let sampler =
            BandwidthWeightedSampler::new(&index, &filter, &WeightTable::new(), PathPosition::Middle)
                .unwrap();

        let members: HashSet<String> = sampler
            .eligible()
            .iter()
            .map(|r| r.fingerprint.clone())
            .collect();
        for _ in 0..200 {
            let picked = sampler.pick().unwrap();
            assert!(members.contains(&picked.fingerprint));
        }
    }

    #[test]
    fn test_weight_shares_sum_to_one() {
        let index = RelayIndex::build(vec![
            stable_fast(&"A".repeat(40), 100),
            stable_fast(&"B".repeat(40), 300),
        ]);
        let sampler = BandwidthWeightedSampler::new(
            &index,
            &FlagFilter::default(),
            &WeightTable::new(),
            PathPosition::Middle,
        )
        .unwrap();

        let total: f64 = (0..sampler.eligible().len())
            .map(|i| sampler.weight_share(i))
            .sum();
        assert!((total - 1.0).abs() < 1e-9);
        // B carries three quarters of the weight.
        let b_index = sampler
            .eligible()
            .iter()
            .position(|r| r.fingerprint == "B".repeat(40))
            .unwrap();
        assert!((sampler.weight_share(b_index) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_consensus_weight_multiplier_applies() {
        let mut table = WeightTable::new();
        table.insert("Wmg".to_string(), 0);
        table.insert("Wmm".to_string(), 10000);

        // A guard-flagged relay with Wmg=0 gets zero weight at the middle
        // position, so only B is ever drawn.
        let index = RelayIndex::build(vec![
            relay(&"A".repeat(40), 900, &["Fast", "Stable", "Guard"]),
            stable_fast(&"B".repeat(40), 100),
        ]);
        let sampler = BandwidthWeightedSampler::new(
            &index,
            &FlagFilter::default(),
            &table,
            PathPosition::Middle,
        )
        .unwrap();

        for _ in 0..50 {
            assert_eq!(sampler.pick().unwrap().fingerprint, "B".repeat(40));
        }
    }
}
