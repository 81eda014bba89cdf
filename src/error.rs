//! Error types for guardshift.
//!
//! All fallible operations in this crate return [`Result`], built on the
//! [`enum@Error`] enum below. The variants split along the recovery
//! boundaries that matter to the reconciliation loop:
//!
//! - Per-relay anomalies (a guard missing from the consensus, an expired
//!   guard, a duplicate sampler draw) never become errors at all. They are
//!   handled inside the reconciliation pass.
//! - [`CorruptState`](Error::CorruptState) is recoverable by discarding the
//!   state file and starting from an empty guard set.
//! - [`FeatureUnsupported`](Error::FeatureUnsupported) is recoverable by
//!   skipping the offending configuration parameter.
//! - [`Io`](Error::Io), [`Control`](Error::Control),
//!   [`Consensus`](Error::Consensus) and
//!   [`DescriptorUnavailable`](Error::DescriptorUnavailable) are retryable on
//!   the next refresh cycle or reconnect.
//! - [`NoEligibleRelays`](Error::NoEligibleRelays) and
//!   [`PopulationExhausted`](Error::PopulationExhausted) are fatal
//!   configuration problems: the network view cannot satisfy the configured
//!   guard counts, and under-filling a guard layer silently is not an option.

use thiserror::Error;

/// Errors that can occur during guardshift operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during file or network operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration values or unparseable configuration input.
    #[error("configuration error: {0}")]
    Config(String),

    /// Tor control protocol error surfaced by stem-rs.
    #[error("Tor control error: {0}")]
    Control(#[from] stem_rs::Error),

    /// The persisted guard-set file is unreadable or structurally invalid.
    ///
    /// Callers recover by starting from an empty [`GuardSet`](crate::GuardSet)
    /// rather than crashing; see
    /// [`StateStore::load_or_default`](crate::StateStore::load_or_default).
    #[error("corrupt state file: {0}")]
    CorruptState(String),

    /// The cached consensus document could not be read or parsed.
    #[error("consensus parse error: {0}")]
    Consensus(String),

    /// Every relay was rejected by the sampler's flag restrictions.
    #[error("no relays remain after flag restrictions")]
    NoEligibleRelays,

    /// The eligible relay population cannot fill a guard layer.
    ///
    /// Either fewer distinct eligible relays exist than the layer's target
    /// size, or the draw budget ran out before the layer filled. Both mean
    /// the configured guard counts cannot be satisfied by the current
    /// network view.
    #[error("cannot fill {layer}: {eligible} eligible relays for a target of {target}")]
    PopulationExhausted {
        /// Name of the layer that could not be filled.
        layer: &'static str,
        /// Number of distinct eligible relays available.
        eligible: usize,
        /// Configured target size of the layer.
        target: usize,
    },

    /// The running Tor daemon does not understand a configuration parameter.
    ///
    /// Older daemons reject newer option names. The configuration push
    /// logs and skips these unless escalation is configured.
    #[error("control parameter not supported by this Tor version: {0}")]
    FeatureUnsupported(String),

    /// Tor does not have the required descriptors cached yet.
    #[error("descriptor unavailable: {0}")]
    DescriptorUnavailable(String),
}

/// Result type alias for guardshift operations.
pub type Result<T> = std::result::Result<T, Error>;
