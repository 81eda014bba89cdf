//! Guard-set data model.
//!
//! [`GuardSet`] is the full mutable state of the rotation engine: the
//! layer2 and layer3 vanguard lists plus the use-counter state persisted
//! alongside them. It is created empty on first run, loaded from the
//! [`StateStore`](crate::StateStore) afterwards, and mutated only by the
//! [`Reconciler`](crate::Reconciler) in response to consensus refreshes.
//!
//! Invariants the engine maintains:
//!
//! - no two guards in the same layer share an identity (layers may overlap
//!   with each other);
//! - `expires_at > chosen_at` for every guard;
//! - after a completed reconciliation pass each layer holds exactly its
//!   configured number of guards, provided the eligible population is large
//!   enough.
//!
//! A guard leaves a layer for exactly two reasons: its relay is absent from
//! the current consensus, or its lifetime ran out. Both evictions live here
//! as retain-based primitives; the surviving guards keep their original
//! timestamps.

use serde::{Deserialize, Serialize};

use crate::counters::UseCounters;
use crate::error::{Error, Result};
use crate::relays::{is_valid_fingerprint, RelayIndex};

/// Current on-disk schema revision, embedded in every persisted blob.
pub const SCHEMA_REVISION: u32 = 1;

/// One relay currently serving as a vanguard at a given layer.
///
/// Timestamps are Unix seconds. The expiry is drawn at selection time, so a
/// guard's remaining tenure never changes once it is chosen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guard {
    /// The relay's 40-character hex fingerprint.
    pub identity: String,
    /// Unix timestamp when this guard was selected.
    pub chosen_at: f64,
    /// Unix timestamp after which this guard must be replaced.
    pub expires_at: f64,
}

impl Guard {
    /// Creates a guard record.
    pub fn new(identity: String, chosen_at: f64, expires_at: f64) -> Self {
        Self {
            identity,
            chosen_at,
            expires_at,
        }
    }

    /// Returns true if the guard's lifetime ran out before `now`.
    pub fn is_expired(&self, now: f64) -> bool {
        self.expires_at < now
    }
}

/// The persisted engine state: both vanguard layers plus use counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardSet {
    /// Layer2 vanguards (second hop).
    pub layer2: Vec<Guard>,
    /// Layer3 vanguards (third hop).
    pub layer3: Vec<Guard>,
    /// Use-count state kept consistent with the latest weighting pass.
    pub counters: UseCounters,
    /// On-disk schema revision tag.
    pub schema_revision: u32,
}

impl Default for GuardSet {
    fn default() -> Self {
        Self::new()
    }
}

impl GuardSet {
    /// Creates an empty guard set.
    pub fn new() -> Self {
        Self {
            layer2: Vec::new(),
            layer3: Vec::new(),
            counters: UseCounters::new(),
            schema_revision: SCHEMA_REVISION,
        }
    }

    /// Returns the layer2 identities as a comma-joined list.
    pub fn layer2_csv(&self) -> String {
        joined_identities(&self.layer2)
    }

    /// Returns the layer3 identities as a comma-joined list.
    pub fn layer3_csv(&self) -> String {
        joined_identities(&self.layer3)
    }

    /// Removes guards whose relay is absent from the current population.
    ///
    /// Returns how many guards were evicted across both layers.
    pub fn evict_down(&mut self, index: &RelayIndex) -> usize {
        let before = self.layer2.len() + self.layer3.len();
        self.layer2.retain(|g| index.contains(&g.identity));
        self.layer3.retain(|g| index.contains(&g.identity));
        before - self.layer2.len() - self.layer3.len()
    }

    /// Removes guards whose lifetime ran out before `now`.
    ///
    /// Expiry overrides presence: a relay still in the consensus is evicted
    /// all the same once its time is up. Returns how many guards were
    /// evicted across both layers.
    pub fn evict_expired(&mut self, now: f64) -> usize {
        let before = self.layer2.len() + self.layer3.len();
        self.layer2.retain(|g| !g.is_expired(now));
        self.layer3.retain(|g| !g.is_expired(now));
        before - self.layer2.len() - self.layer3.len()
    }

    /// Trims layers that somehow exceed their targets.
    ///
    /// Should not trigger under normal operation; it protects against a
    /// state file written with larger configured counts.
    pub fn truncate_layers(&mut self, layer2_target: usize, layer3_target: usize) {
        self.layer2.truncate(layer2_target);
        self.layer3.truncate(layer3_target);
    }

    /// Checks structural integrity of a loaded guard set.
    ///
    /// Rejects malformed fingerprints, inverted lifetimes, duplicate
    /// identities within a layer, and timestamps that could not have been
    /// produced by a sane clock (selection more than an hour in the future,
    /// expiry more than a year past that).
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptState`] describing the first violation.
    pub fn validate(&self, now: f64) -> Result<()> {
        if self.schema_revision != SCHEMA_REVISION {
            return Err(Error::CorruptState(format!(
                "unknown schema revision {}",
                self.schema_revision
            )));
        }
        validate_layer("layer2", &self.layer2, now)?;
        validate_layer("layer3", &self.layer3, now)?;
        Ok(())
    }
}

fn joined_identities(layer: &[Guard]) -> String {
    layer
        .iter()
        .map(|g| g.identity.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

fn validate_layer(name: &str, layer: &[Guard], now: f64) -> Result<()> {
    // Clock-skew tolerance of one hour on chosen_at, one year on expiry.
    let max_chosen = now + 3600.0;
    let max_expiry = max_chosen + 86400.0 * 365.0;

    for (i, guard) in layer.iter().enumerate() {
        if !is_valid_fingerprint(&guard.identity) {
            return Err(Error::CorruptState(format!(
                "invalid fingerprint in {}: {}",
                name, guard.identity
            )));
        }
        if guard.expires_at <= guard.chosen_at {
            return Err(Error::CorruptState(format!(
                "guard {} in {} expires before it was chosen",
                guard.identity, name
            )));
        }
        if guard.chosen_at > max_chosen {
            return Err(Error::CorruptState(format!(
                "future selection timestamp in {}: {}",
                name, guard.chosen_at
            )));
        }
        if guard.expires_at > max_expiry {
            return Err(Error::CorruptState(format!(
                "unreasonable expiry in {}: {}",
                name, guard.expires_at
            )));
        }
        if layer[..i].iter().any(|g| g.identity == guard.identity) {
            return Err(Error::CorruptState(format!(
                "duplicate identity in {}: {}",
                name, guard.identity
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stem_rs::descriptor::router_status::{RouterStatusEntry, RouterStatusEntryType};

    const NOW: f64 = 1_700_000_000.0;

    fn relay(fingerprint: &str) -> RouterStatusEntry {
        let mut r = RouterStatusEntry::new(
            RouterStatusEntryType::V3,
            "test".to_string(),
            fingerprint.to_string(),
            Utc::now(),
            "192.0.2.1".parse().unwrap(),
            9001,
        );
        r.measured = Some(100);
        r
    }

    fn live_guard(fingerprint: &str) -> Guard {
        Guard::new(fingerprint.to_string(), NOW - 1000.0, NOW + 86400.0)
    }

    #[test]
    fn test_guard_expiry() {
        let guard = Guard::new("A".repeat(40), NOW - 1000.0, NOW - 1.0);
        assert!(guard.is_expired(NOW));

        let guard = Guard::new("B".repeat(40), NOW, NOW + 86400.0);
        assert!(!guard.is_expired(NOW));
        // Expiry is strict: a guard is live at its exact expiry instant.
        assert!(!guard.is_expired(NOW + 86400.0));
    }

    #[test]
    fn test_new_set_is_empty() {
        let set = GuardSet::new();
        assert!(set.layer2.is_empty());
        assert!(set.layer3.is_empty());
        assert_eq!(set.schema_revision, SCHEMA_REVISION);
        assert_eq!(set.layer2_csv(), "");
    }

    #[test]
    fn test_csv_joins_identities() {
        let mut set = GuardSet::new();
        set.layer2.push(live_guard(&"A".repeat(40)));
        set.layer2.push(live_guard(&"B".repeat(40)));
        assert_eq!(
            set.layer2_csv(),
            format!("{},{}", "A".repeat(40), "B".repeat(40))
        );
    }

    #[test]
    fn test_evict_down_removes_only_missing_relays() {
        let mut set = GuardSet::new();
        set.layer2.push(live_guard(&"A".repeat(40)));
        set.layer2.push(live_guard(&"B".repeat(40)));
        set.layer3.push(live_guard(&"C".repeat(40)));

        let index = RelayIndex::build(vec![relay(&"A".repeat(40)), relay(&"C".repeat(40))]);
        let evicted = set.evict_down(&index);

        assert_eq!(evicted, 1);
        assert_eq!(set.layer2.len(), 1);
        assert_eq!(set.layer2[0].identity, "A".repeat(40));
        assert_eq!(set.layer3.len(), 1);
    }

    #[test]
    fn test_evict_down_keeps_timestamps() {
        let mut set = GuardSet::new();
        let survivor = live_guard(&"A".repeat(40));
        set.layer2.push(survivor.clone());
        set.layer2.push(live_guard(&"B".repeat(40)));

        let index = RelayIndex::build(vec![relay(&"A".repeat(40))]);
        set.evict_down(&index);

        assert_eq!(set.layer2, vec![survivor]);
    }

    #[test]
    fn test_evict_expired() {
        let mut set = GuardSet::new();
        set.layer2.push(live_guard(&"A".repeat(40)));
        set.layer2
            .push(Guard::new("B".repeat(40), NOW - 10_000.0, NOW - 100.0));
        set.layer3
            .push(Guard::new("C".repeat(40), NOW - 10_000.0, NOW - 1.0));

        let evicted = set.evict_expired(NOW);

        assert_eq!(evicted, 2);
        assert_eq!(set.layer2.len(), 1);
        assert!(set.layer3.is_empty());
    }

    #[test]
    fn test_truncate_layers() {
        let mut set = GuardSet::new();
        for i in 0..6 {
            set.layer2.push(live_guard(&format!("{:0>40X}", i)));
            set.layer3.push(live_guard(&format!("{:0>40X}", 100 + i)));
        }
        set.truncate_layers(4, 5);
        assert_eq!(set.layer2.len(), 4);
        assert_eq!(set.layer3.len(), 5);
    }

    #[test]
    fn test_validate_accepts_sane_state() {
        let mut set = GuardSet::new();
        set.layer2.push(live_guard(&"A".repeat(40)));
        set.layer3.push(live_guard(&"B".repeat(40)));
        assert!(set.validate(NOW).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_fingerprint() {
        let mut set = GuardSet::new();
        set.layer2
            .push(Guard::new("not-hex".to_string(), NOW, NOW + 1.0));
        assert!(matches!(set.validate(NOW), Err(Error::CorruptState(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_lifetime() {
        let mut set = GuardSet::new();
        set.layer2
            .push(Guard::new("A".repeat(40), NOW, NOW - 100.0));
        assert!(set.validate(NOW).is_err());
    }

    #[test]
    fn test_validate_rejects_future_selection() {
        let mut set = GuardSet::new();
        set.layer2
            .push(Guard::new("A".repeat(40), NOW + 7200.0, NOW + 9000.0));
        assert!(set.validate(NOW).is_err());
    }

    #[test]
    fn test_validate_rejects_duplicates_within_layer() {
        let mut set = GuardSet::new();
        set.layer2.push(live_guard(&"A".repeat(40)));
        set.layer2.push(live_guard(&"A".repeat(40)));
        assert!(set.validate(NOW).is_err());
    }

    #[test]
    fn test_validate_allows_cross_layer_overlap() {
        let mut set = GuardSet::new();
        set.layer2.push(live_guard(&"A".repeat(40)));
        set.layer3.push(live_guard(&"A".repeat(40)));
        assert!(set.validate(NOW).is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_schema() {
        let mut set = GuardSet::new();
        set.schema_revision = 99;
        assert!(set.validate(NOW).is_err());
    }
}
