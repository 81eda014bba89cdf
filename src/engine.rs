//! The guard-set reconciliation engine.
//!
//! [`Reconciler::reconcile`] is the one mutation path for a
//! [`GuardSet`]. It runs once per consensus refresh, as a single unit, and
//! converges both vanguard layers to their configured sizes:
//!
//! 1. Build a bandwidth-weighted sampler over relays carrying the `Fast`
//!    and `Stable` flags, weighted for the middle path position.
//! 2. Evict guards whose relay vanished from the consensus, then top each
//!    layer back up to its target size.
//! 3. Evict guards whose lifetime ran out, trim any layer that somehow
//!    exceeds its target, and top up again.
//! 4. Hand the sampler context to the use counters so the expected-usage
//!    weights match this exact weighting pass.
//!
//! Top-up draws come from the sampler's unbounded pick sequence; the engine
//! owns duplicate skipping and the termination budget. If the eligible
//! population cannot fill a layer the pass fails with
//! [`Error::PopulationExhausted`] instead of under-filling quietly: a
//! half-empty vanguard layer silently weakens the protection it exists to
//! provide.
//!
//! The engine performs no I/O. Persistence and the control-plane push
//! happen in [`crate::control`] after a pass succeeds, so a failed pass
//! never leaks a partial guard set out of process.

use std::collections::HashSet;

use rand::Rng;
use tracing::{debug, info};

use crate::config::RotationConfig;
use crate::error::{Error, Result};
use crate::relays::{RelayIndex, WeightTable};
use crate::sampler::{BandwidthWeightedSampler, FlagFilter, PathPosition, RelaySampler};
use crate::state::{Guard, GuardSet};

const SEC_PER_HOUR: f64 = 3600.0;

/// Draw budget per guard slot before declaring the population exhausted.
///
/// Reached only when the sampler keeps returning identities already in the
/// layer, which a population-size precheck makes astronomically unlikely.
const MAX_DRAWS_PER_SLOT: usize = 1000;

/// Rotation targets and lifetime bounds for one vanguard layer.
#[derive(Debug, Clone, Copy)]
struct LayerSpec {
    name: &'static str,
    target: usize,
    min_lifetime_hours: u32,
    max_lifetime_hours: u32,
}

/// Converges guard sets against consensus snapshots.
///
/// Holds only the immutable rotation tunables; all mutable state lives in
/// the [`GuardSet`] passed to each pass.
#[derive(Debug, Clone)]
pub struct Reconciler {
    rotation: RotationConfig,
}

impl Reconciler {
    /// Creates a reconciler with the given rotation tunables.
    pub fn new(rotation: RotationConfig) -> Self {
        Self { rotation }
    }

    fn layer2_spec(&self) -> LayerSpec {
        LayerSpec {
            name: "layer2",
            target: self.rotation.num_layer2_guards as usize,
            min_lifetime_hours: self.rotation.min_layer2_lifetime_hours,
            max_lifetime_hours: self.rotation.max_layer2_lifetime_hours,
        }
    }

    fn layer3_spec(&self) -> LayerSpec {
        LayerSpec {
            name: "layer3",
            target: self.rotation.num_layer3_guards as usize,
            min_lifetime_hours: self.rotation.min_layer3_lifetime_hours,
            max_lifetime_hours: self.rotation.max_layer3_lifetime_hours,
        }
    }

    /// Runs one full reconciliation pass against a consensus snapshot.
    ///
    /// `now` is the pass's single notion of current time; every expiry
    /// check and every new lifetime in the pass uses it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoEligibleRelays`] if no relay passes the flag
    /// restrictions, or [`Error::PopulationExhausted`] if a layer cannot be
    /// filled. The guard set may have been mutated when an error is
    /// returned; callers must not persist or apply it in that case.
    pub fn reconcile(
        &self,
        set: &mut GuardSet,
        index: &RelayIndex,
        weights: &WeightTable,
        now: f64,
    ) -> Result<()> {
        let filter = FlagFilter::new(
            vec!["Fast".to_string(), "Stable".to_string()],
            Vec::new(),
        );
        let sampler =
            BandwidthWeightedSampler::new(index, &filter, weights, PathPosition::Middle)?;

        info!(
            layer2 = %set.layer2_csv(),
            layer3 = %set.layer3_csv(),
            "Reconciling vanguard layers"
        );

        let down = set.evict_down(index);
        if down > 0 {
            info!("Evicted {} vanguards missing from the consensus", down);
        }
        self.top_up(&mut set.layer2, self.layer2_spec(), &sampler, now)?;
        self.top_up(&mut set.layer3, self.layer3_spec(), &sampler, now)?;

        let expired = set.evict_expired(now);
        if expired > 0 {
            info!("Rotating {} expired vanguards", expired);
        }
        set.truncate_layers(self.layer2_spec().target, self.layer3_spec().target);
        self.top_up(&mut set.layer2, self.layer2_spec(), &sampler, now)?;
        self.top_up(&mut set.layer3, self.layer3_spec(), &sampler, now)?;

        set.counters.absorb(&sampler);

        info!(
            layer2 = %set.layer2_csv(),
            layer3 = %set.layer3_csv(),
            "Vanguard layers reconciled"
        );

        Ok(())
    }

    /// Adds guards until `layer` reaches the spec's target size.
    fn top_up<S: RelaySampler>(
        &self,
        layer: &mut Vec<Guard>,
        spec: LayerSpec,
        sampler: &S,
        now: f64,
    ) -> Result<()> {
        if sampler.eligible().len() < spec.target {
            return Err(Error::PopulationExhausted {
                layer: spec.name,
                eligible: sampler.eligible().len(),
                target: spec.target,
            });
        }

        while layer.len() < spec.target {
            self.add_guard(layer, spec, sampler, now)?;
        }
        Ok(())
    }

    /// Draws one new guard for `layer`, skipping identities already held.
    fn add_guard<S: RelaySampler>(
        &self,
        layer: &mut Vec<Guard>,
        spec: LayerSpec,
        sampler: &S,
        now: f64,
    ) -> Result<()> {
        let held: HashSet<&str> = layer.iter().map(|g| g.identity.as_str()).collect();

        for _ in 0..MAX_DRAWS_PER_SLOT {
            let relay = sampler.pick()?;
            if held.contains(relay.fingerprint.as_str()) {
                continue;
            }

            let lifetime =
                Self::draw_lifetime(spec.min_lifetime_hours, spec.max_lifetime_hours);
            debug!(
                "New {} vanguard {} for {:.1} hours",
                spec.name,
                relay.fingerprint,
                lifetime / SEC_PER_HOUR
            );
            layer.push(Guard::new(relay.fingerprint.clone(), now, now + lifetime));
            return Ok(());
        }

        Err(Error::PopulationExhausted {
            layer: spec.name,
            eligible: sampler.eligible().len(),
            target: spec.target,
        })
    }

    /// Draws a guard lifetime in seconds from the layer's hour bounds.
    ///
    /// Takes the larger of two independent uniform draws. The skew toward
    /// the upper bound lengthens average tenure, which widens the
    /// observation window an attacker needs to enumerate guards.
    pub fn draw_lifetime(min_hours: u32, max_hours: u32) -> f64 {
        let min_secs = min_hours as f64 * SEC_PER_HOUR;
        let max_secs = max_hours as f64 * SEC_PER_HOUR;
        let mut rng = rand::thread_rng();
        let first = rng.gen_range(min_secs..=max_secs);
        let second = rng.gen_range(min_secs..=max_secs);
        first.max(second)
    }
}
