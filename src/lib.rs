//! # guardshift
//!
//! Guard-discovery protection for Tor onion services through rotating
//! vanguard relay layers.
//!
//! An onion service that builds circuits through ever-changing middle
//! relays leaks its entry guard to any adversary patient enough to run
//! relays and wait. guardshift narrows that exposure by pinning two extra
//! relay layers between the entry guard and the rest of the circuit:
//!
//! ```text
//!   service ──▶ layer1 (entry) ──▶ layer2 ──▶ layer3 ──▶ ...
//!               Tor's guards       4 guards    8 guards
//!                                  days-weeks  hours-days
//! ```
//!
//! On every new consensus the daemon re-derives bandwidth weights, evicts
//! guards that vanished or expired, tops the layers back up with
//! bandwidth-weighted draws, pushes the result into Tor's `HSLayer2Nodes`
//! and `HSLayer3Nodes` options, and persists the whole guard set
//! atomically so a restart never forgets its guards.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | configuration from TOML file, CLI and environment |
//! | [`control`] | Tor control connection, configuration push, event loop |
//! | [`counters`] | rendezvous use-count state carried across consensuses |
//! | [`engine`] | the reconciliation pass converging layers to their targets |
//! | [`error`] | error types and [`Result`] alias |
//! | [`logger`] | tracing subscriber setup |
//! | [`relays`] | relay ranking and indexing per consensus |
//! | [`sampler`] | bandwidth-weighted relay sampling |
//! | [`state`] | [`Guard`] and [`GuardSet`] data model |
//! | [`store`] | atomic state-file persistence with corruption detection |
//!
//! ## Library use
//!
//! ```rust,no_run
//! use guardshift::{config::Config, control};
//!
//! #[tokio::main]
//! async fn main() -> guardshift::Result<()> {
//!     let config = Config::default();
//!     control::run_main(config).await
//! }
//! ```
//!
//! The engine itself has no I/O and can be driven directly against a relay
//! population for testing or embedding:
//!
//! ```rust,no_run
//! use guardshift::{GuardSet, Reconciler, RelayIndex};
//! use guardshift::config::RotationConfig;
//! use guardshift::relays::WeightTable;
//!
//! # fn relays() -> Vec<stem_rs::descriptor::router_status::RouterStatusEntry> { Vec::new() }
//! # fn main() -> guardshift::Result<()> {
//! let reconciler = Reconciler::new(RotationConfig::default());
//! let mut set = GuardSet::new();
//! let index = RelayIndex::build(relays());
//! reconciler.reconcile(&mut set, &index, &WeightTable::new(), 1_700_000_000.0)?;
//! println!("layer2: {}", set.layer2_csv());
//! # Ok(())
//! # }
//! ```
//!
//! ## Security notes
//!
//! - Guard lifetimes take the larger of two uniform draws, skewing tenure
//!   toward the configured maximum.
//! - State files hold guard fingerprints and are written with mode 0600.
//! - A guard layer is never silently under-filled; an insufficient relay
//!   population stops the daemon instead.
//!
//! ## See also
//!
//! - [Vanguards proposal](https://github.com/torproject/torspec/blob/main/proposals/292-mesh-vanguards.txt)
//! - [Python vanguards](https://github.com/mikeperry-tor/vanguards)

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod control;
pub mod counters;
pub mod engine;
pub mod error;
pub mod logger;
pub mod relays;
pub mod sampler;
pub mod state;
pub mod store;

pub use config::{CliArgs, Config, LogLevel, RotationConfig};
pub use control::{ControlPlane, SecurePassword, TorControlPlane, VERSION};
pub use counters::{UseCount, UseCounters, NOT_IN_CONSENSUS_ID};
pub use engine::Reconciler;
pub use error::{Error, Result};
pub use relays::{is_valid_fingerprint, RelayIndex, WeightTable};
pub use sampler::{BandwidthWeightedSampler, FlagFilter, PathPosition, RelaySampler};
pub use state::{Guard, GuardSet};
pub use store::StateStore;
