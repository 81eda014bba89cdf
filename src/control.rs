//! Tor control-port integration and the main event loop.
//!
//! Everything that talks to the running Tor daemon lives here: connecting
//! and authenticating over the control port (via stem-rs), pulling the
//! relay view (`GETINFO ns/all` plus the `bandwidth-weights` line of the
//! cached consensus document), pushing the reconciled guard layers into
//! Tor's live configuration, and the NEWCONSENSUS-driven loop that ties a
//! [`Reconciler`](crate::Reconciler) pass to persistence and the
//! configuration push.
//!
//! The loop is a single task consuming events sequentially from one
//! control connection, so reconciliation passes never overlap. A pass that
//! fails for a retryable reason (dropped connection, unwritable state
//! file) leaves the in-memory guard set authoritative and is retried on
//! the next consensus event; a pass that fails for a configuration reason
//! (eligible population smaller than a layer target) terminates the
//! daemon, because continuing would mean running with an under-filled
//! guard layer.
//!
//! # Configuration push
//!
//! The guard layers reach Tor as the `HSLayer2Nodes` / `HSLayer3Nodes`
//! options, with the optional entry-guard overrides alongside them. Older
//! daemons reject option names they predate; those rejections surface as
//! [`Error::FeatureUnsupported`] and are skipped with a warning unless
//! `halt_on_config_errors` is set. The push goes through the
//! [`ControlPlane`] trait so tests can substitute a recording fake for a
//! live controller.

use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use stem_rs::controller::Controller;
use stem_rs::descriptor::router_status::{RouterStatusEntry, RouterStatusEntryType};
use stem_rs::events::ParsedEvent;
use stem_rs::EventType;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::config::Config;
use crate::engine::Reconciler;
use crate::error::{Error, Result};
use crate::relays::{RelayIndex, WeightTable};
use crate::state::GuardSet;
use crate::store::StateStore;

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Password wrapper that clears its contents on drop.
///
/// Keeps a prompted control-port password from lingering in memory and
/// from appearing in debug output.
#[derive(Clone)]
pub struct SecurePassword(String);

impl SecurePassword {
    /// Wraps a password string.
    pub fn new(password: String) -> Self {
        Self(password)
    }

    /// Returns the wrapped password.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Drop for SecurePassword {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SecurePassword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecurePassword([REDACTED])")
    }
}

/// Configuration surface of the anonymity-network daemon.
///
/// One method to set a named value, one to persist the daemon's own
/// configuration. Implementations map "this daemon does not know that
/// option" onto [`Error::FeatureUnsupported`] so the caller can skip the
/// option instead of abandoning the pass.
#[allow(async_fn_in_trait)]
pub trait ControlPlane {
    /// Sets one named configuration value.
    async fn set_config_value(&mut self, name: &str, value: &str) -> Result<()>;

    /// Persists the daemon's configuration to its own storage.
    async fn save_config(&mut self) -> Result<()>;
}

/// [`ControlPlane`] backed by a live stem-rs controller.
pub struct TorControlPlane<'a> {
    controller: &'a mut Controller,
}

impl<'a> TorControlPlane<'a> {
    /// Wraps an authenticated controller.
    pub fn new(controller: &'a mut Controller) -> Self {
        Self { controller }
    }
}

impl ControlPlane for TorControlPlane<'_> {
    async fn set_config_value(&mut self, name: &str, value: &str) -> Result<()> {
        self.controller.set_conf(name, value).await.map_err(|e| {
            let message = e.to_string();
            // Tor answers unknown option names with a 552 reply.
            if message.contains("552") || message.contains("Unrecognized option") {
                Error::FeatureUnsupported(name.to_string())
            } else {
                Error::Control(e)
            }
        })
    }

    async fn save_config(&mut self) -> Result<()> {
        // The stem-rs client does not expose SAVECONF. Report it as an
        // unsupported feature so the pass completes with a warning and the
        // operator can persist torrc changes out of band.
        Err(Error::FeatureUnsupported("SAVECONF".to_string()))
    }
}

/// Pushes the reconciled guard layers into the daemon's configuration.
///
/// Always sets `HSLayer2Nodes`; sets `HSLayer3Nodes` when layer3 is
/// enabled; applies the entry-guard count and lifetime overrides when
/// configured; finally asks the adapter to persist the daemon config.
/// Unsupported option names are logged and skipped, or escalated when
/// `halt_on_config_errors` is set. An unsupported `SAVECONF` is never
/// escalated, since nothing was partially applied by it.
///
/// # Errors
///
/// Returns [`Error::FeatureUnsupported`] under the escalation policy, or
/// any transport-level [`Error::Control`] unchanged.
pub async fn apply_guard_config<C: ControlPlane>(
    plane: &mut C,
    set: &GuardSet,
    config: &Config,
) -> Result<()> {
    let rotation = &config.rotation;
    let halt = config.halt_on_config_errors;

    if rotation.num_layer1_guards > 0 {
        let count = rotation.num_layer1_guards.to_string();
        push_value(plane, "NumEntryGuards", &count, halt).await?;
        // Rejected by daemons predating primary-guard support.
        push_value(plane, "NumPrimaryGuards", &count, halt).await?;
        push_value(plane, "NumDirectoryGuards", &count, halt).await?;
    }

    if rotation.layer1_lifetime_days > 0 {
        let lifetime = format!("{} days", rotation.layer1_lifetime_days);
        push_value(plane, "GuardLifetime", &lifetime, halt).await?;
    }

    push_value(plane, "HSLayer2Nodes", &set.layer2_csv(), halt).await?;
    if rotation.num_layer3_guards > 0 {
        push_value(plane, "HSLayer3Nodes", &set.layer3_csv(), halt).await?;
    }

    match plane.save_config().await {
        Ok(()) => {}
        Err(Error::FeatureUnsupported(what)) => {
            debug!("Daemon config not persisted ({} unsupported)", what);
        }
        Err(e) => return Err(e),
    }

    info!("Applied layer2 guards: {}", set.layer2_csv());
    if rotation.num_layer3_guards > 0 {
        info!("Applied layer3 guards: {}", set.layer3_csv());
    }

    Ok(())
}

async fn push_value<C: ControlPlane>(
    plane: &mut C,
    name: &str,
    value: &str,
    halt: bool,
) -> Result<()> {
    match plane.set_config_value(name, value).await {
        Ok(()) => Ok(()),
        Err(Error::FeatureUnsupported(option)) if !halt => {
            warn!(
                "This Tor version does not support {}; skipping it",
                option
            );
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Parses the `bandwidth-weights` line of a cached consensus document.
///
/// The line carries space-separated `key=value` pairs:
///
/// ```text
/// bandwidth-weights Wbd=0 Wbe=0 Wgg=4194 Wmm=10000 ...
/// ```
///
/// # Errors
///
/// Returns [`Error::Consensus`] if the file cannot be read or carries no
/// `bandwidth-weights` line.
pub fn parse_bandwidth_weights(consensus_path: &Path) -> Result<WeightTable> {
    let file = std::fs::File::open(consensus_path).map_err(|e| {
        Error::Consensus(format!("cannot read {}: {}", consensus_path.display(), e))
    })?;
    let reader = BufReader::new(file);

    let mut weights = WeightTable::new();
    for line in reader.lines() {
        let line = line.map_err(|e| Error::Consensus(format!("read error: {}", e)))?;
        if let Some(rest) = line.strip_prefix("bandwidth-weights ") {
            for pair in rest.split_whitespace() {
                if let Some((key, value)) = pair.split_once('=') {
                    if let Ok(v) = value.parse::<i64>() {
                        weights.insert(key.to_string(), v);
                    }
                }
            }
            break;
        }
    }

    if weights.is_empty() {
        return Err(Error::Consensus(
            "no bandwidth-weights found in consensus".to_string(),
        ));
    }
    Ok(weights)
}

/// Fetches the live relay population over the control connection.
async fn get_relay_statuses(controller: &mut Controller) -> Result<Vec<RouterStatusEntry>> {
    let response = controller
        .get_info("ns/all")
        .await
        .map_err(|e| Error::DescriptorUnavailable(format!("cannot get network statuses: {}", e)))?;
    Ok(parse_status_entries(&response))
}

/// Parses router status entries out of a `GETINFO ns/all` response.
///
/// Only the fields the engine consumes are kept: fingerprint, address,
/// flags (`s` line) and bandwidth figures (`w` line).
fn parse_status_entries(response: &str) -> Vec<RouterStatusEntry> {
    use chrono::Utc;

    let mut relays = Vec::new();
    let mut current: Option<RouterStatusEntry> = None;

    for line in response.lines() {
        if line.starts_with("r ") {
            if let Some(relay) = current.take() {
                relays.push(relay);
            }

            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 8 {
                let address = parts[5]
                    .parse()
                    .unwrap_or_else(|_| "0.0.0.0".parse().unwrap());
                current = Some(RouterStatusEntry::new(
                    RouterStatusEntryType::V3,
                    parts[1].to_string(),
                    base64_fingerprint_to_hex(parts[2]),
                    Utc::now(),
                    address,
                    parts[6].parse().unwrap_or(9001),
                ));
            }
        } else if let Some(flags) = line.strip_prefix("s ") {
            if let Some(ref mut relay) = current {
                relay.flags = flags.split_whitespace().map(str::to_string).collect();
            }
        } else if let Some(bandwidths) = line.strip_prefix("w ") {
            if let Some(ref mut relay) = current {
                for pair in bandwidths.split_whitespace() {
                    if let Some((key, value)) = pair.split_once('=') {
                        if let Ok(v) = value.parse::<u64>() {
                            match key {
                                "Bandwidth" => relay.bandwidth = Some(v),
                                "Measured" => relay.measured = Some(v),
                                _ => {}
                            }
                        }
                    }
                }
            }
        }
    }
    if let Some(relay) = current {
        relays.push(relay);
    }

    relays
}

/// Converts a consensus base64 identity to an uppercase hex fingerprint.
fn base64_fingerprint_to_hex(b64: &str) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

    let trimmed = b64.trim_end_matches('=');
    let mut bytes = Vec::with_capacity(trimmed.len() * 3 / 4);
    let mut buffer = 0u32;
    let mut bits = 0;

    for c in trimmed.bytes() {
        let value = match ALPHABET.iter().position(|&x| x == c) {
            Some(v) => v as u32,
            None => return String::new(),
        };
        buffer = (buffer << 6) | value;
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            bytes.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }

    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

/// Mutable daemon state threaded through the event loop.
pub struct App {
    /// The guard set, authoritative in memory between saves.
    pub set: GuardSet,
    /// Persistence for the guard set.
    pub store: StateStore,
    /// The reconciliation engine.
    pub reconciler: Reconciler,
    /// Daemon configuration.
    pub config: Config,
}

impl App {
    /// Builds daemon state from configuration, loading any persisted guards.
    pub fn from_config(config: Config) -> Self {
        let store = StateStore::new(config.state_file.clone());
        let set = store.load_or_default();
        let reconciler = Reconciler::new(config.rotation.clone());
        Self {
            set,
            store,
            reconciler,
            config,
        }
    }
}

/// How one connection's event loop ended.
pub enum LoopExit {
    /// The connection dropped or setup failed; reconnect and retry.
    Retry(String),
    /// An unrecoverable configuration problem; stop the daemon.
    Fatal(Error),
    /// One-shot mode finished its single pass.
    Done,
}

fn is_fatal(error: &Error) -> bool {
    matches!(
        error,
        Error::Config(_)
            | Error::NoEligibleRelays
            | Error::PopulationExhausted { .. }
            | Error::FeatureUnsupported(_)
    )
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Runs one reconciliation pass against the current consensus.
///
/// Fetches the relay view and weight table, reconciles the guard set,
/// pushes the result into Tor and persists it. Push and persistence
/// failures are logged and left for the next refresh; the in-memory guard
/// set stays authoritative until a save succeeds.
pub async fn consensus_refresh(controller: &mut Controller, app: &mut App) -> Result<()> {
    let relays = get_relay_statuses(controller).await?;

    let data_dir = controller
        .get_conf("DataDirectory")
        .await?
        .first()
        .cloned()
        .ok_or_else(|| {
            Error::Config("the Tor daemon must have a DataDirectory configured".to_string())
        })?;
    let consensus_path = Path::new(&data_dir).join("cached-microdesc-consensus");
    let weights = parse_bandwidth_weights(&consensus_path)?;

    let index = RelayIndex::build(relays);
    app.reconciler
        .reconcile(&mut app.set, &index, &weights, unix_now())?;

    let mut plane = TorControlPlane::new(controller);
    match apply_guard_config(&mut plane, &app.set, &app.config).await {
        Ok(()) => {}
        Err(Error::FeatureUnsupported(option)) => {
            return Err(Error::FeatureUnsupported(option));
        }
        Err(e) => warn!("Configuration push failed, retrying next refresh: {}", e),
    }

    if let Err(e) = app.store.save(&app.set) {
        warn!(
            "Cannot persist guard state to {}: {}",
            app.store.path().display(),
            e
        );
    }

    Ok(())
}

/// Connects to the Tor control interface.
///
/// Tries the configured socket, then the configured TCP port, then the
/// conventional defaults (`/run/tor/control`, port 9051).
async fn connect(config: &Config) -> Result<Controller> {
    if let Some(ref socket_path) = config.control_socket {
        let controller = Controller::from_socket_file(socket_path.as_path()).await?;
        info!("Connected to Tor via socket {}", socket_path.display());
        return Ok(controller);
    }

    if let Some(port) = config.control_port {
        let addr = format!("{}:{}", config.control_ip, port);
        let controller = Controller::from_port(
            addr.parse()
                .map_err(|e| Error::Config(format!("invalid control address: {}", e)))?,
        )
        .await?;
        info!("Connected to Tor via control port {}", addr);
        return Ok(controller);
    }

    if let Ok(controller) = Controller::from_socket_file(Path::new("/run/tor/control")).await {
        info!("Connected to Tor via /run/tor/control socket");
        return Ok(controller);
    }

    let addr = format!("{}:9051", config.control_ip);
    let controller = Controller::from_port(
        addr.parse()
            .map_err(|e| Error::Config(format!("invalid control address: {}", e)))?,
    )
    .await?;
    info!("Connected to Tor via {} control port", addr);
    Ok(controller)
}

/// Authenticates against the control port.
///
/// Uses cookie or open-port authentication when possible, the configured
/// password otherwise, and prompts interactively as a last resort.
async fn authenticate(controller: &mut Controller, password: Option<&str>) -> Result<()> {
    match controller.authenticate(password).await {
        Ok(()) => {}
        Err(stem_rs::Error::Authentication(stem_rs::AuthError::MissingPassword)) => {
            let prompted = SecurePassword::new(prompt_password()?);
            controller.authenticate(Some(prompted.as_str())).await?;
        }
        Err(e) => return Err(Error::Control(e)),
    }

    let version = controller.get_version().await?;
    info!("guardshift {} connected to Tor {}", VERSION, version);
    Ok(())
}

fn prompt_password() -> Result<String> {
    eprint!("Controller password: ");
    let mut password = String::new();
    std::io::stdin().read_line(&mut password)?;
    Ok(password.trim().to_string())
}

/// Processes events on one control connection until it drops.
pub async fn control_loop(app: &mut App) -> LoopExit {
    let mut controller = match connect(&app.config).await {
        Ok(c) => c,
        Err(e) => return LoopExit::Retry(e.to_string()),
    };
    if let Err(e) = authenticate(&mut controller, app.config.control_pass.as_deref()).await {
        return LoopExit::Retry(e.to_string());
    }

    // Bring the guard set up to date before waiting for the next consensus.
    match consensus_refresh(&mut controller, app).await {
        Ok(()) => {}
        Err(Error::DescriptorUnavailable(msg)) => {
            info!("Tor needs descriptors: {}. Trying again shortly.", msg);
            return LoopExit::Retry(msg);
        }
        Err(e) if is_fatal(&e) => return LoopExit::Fatal(e),
        Err(e) => return LoopExit::Retry(e.to_string()),
    }

    if app.config.one_shot {
        info!("Guard configuration applied; exiting (one-shot mode)");
        return LoopExit::Done;
    }

    let events = [EventType::NewConsensus, EventType::Signal];
    if let Err(e) = controller.set_events(&events).await {
        return LoopExit::Retry(e.to_string());
    }

    loop {
        match controller.recv_event().await {
            Ok(ParsedEvent::Signal(ref event)) => {
                let signal = format!("{:?}", event.signal);
                if signal.eq_ignore_ascii_case("reload") {
                    info!("Tor got SIGHUP; reapplying guard configuration");
                    let mut plane = TorControlPlane::new(&mut controller);
                    match apply_guard_config(&mut plane, &app.set, &app.config).await {
                        Ok(()) => {}
                        Err(e) if is_fatal(&e) => return LoopExit::Fatal(e),
                        Err(e) => warn!("Reload reapply failed: {}", e),
                    }
                }
            }
            Ok(ParsedEvent::Unknown {
                ref event_type, ..
            }) if event_type == "NEWCONSENSUS" => {
                match consensus_refresh(&mut controller, app).await {
                    Ok(()) => {}
                    Err(e) if is_fatal(&e) => return LoopExit::Fatal(e),
                    Err(e) => warn!("Consensus refresh failed: {}", e),
                }
            }
            Ok(_) => {}
            Err(e) => {
                debug!("Event receive error: {}", e);
                return LoopExit::Retry("connection closed".to_string());
            }
        }
    }
}

/// Runs the daemon: load state, connect, process events, reconnect.
///
/// Returns when one-shot mode completes, on CTRL+C, when the retry limit
/// is exhausted, or with an error on a fatal configuration problem.
pub async fn run_main(config: Config) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Got CTRL+C. Exiting.");
            shutdown_flag.store(true, Ordering::SeqCst);
        }
    });

    let mut app = App::from_config(config);
    if !app.set.layer2.is_empty() || !app.set.layer3.is_empty() {
        info!("Current layer2 guards: {}", app.set.layer2_csv());
        info!("Current layer3 guards: {}", app.set.layer3_csv());
    }

    let mut attempts = 0u32;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(limit) = app.config.retry_limit {
            if attempts > limit {
                return Err(Error::Config(format!(
                    "giving up after {} connection attempts",
                    attempts
                )));
            }
        }

        match control_loop(&mut app).await {
            LoopExit::Done => return Ok(()),
            LoopExit::Fatal(e) => return Err(e),
            LoopExit::Retry(reason) => {
                warn!("Control connection lost ({}); reconnecting", reason);
                attempts += 1;
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RotationConfig;
    use crate::state::Guard;
    use std::collections::HashSet;

    const NOW: f64 = 1_700_000_000.0;

    /// Records pushes; reports configured option names as unsupported.
    #[derive(Default)]
    struct FakePlane {
        pushed: Vec<(String, String)>,
        unsupported: HashSet<String>,
        saved: bool,
        save_unsupported: bool,
    }

    impl ControlPlane for FakePlane {
        async fn set_config_value(&mut self, name: &str, value: &str) -> Result<()> {
            if self.unsupported.contains(name) {
                return Err(Error::FeatureUnsupported(name.to_string()));
            }
            self.pushed.push((name.to_string(), value.to_string()));
            Ok(())
        }

        async fn save_config(&mut self) -> Result<()> {
            if self.save_unsupported {
                return Err(Error::FeatureUnsupported("SAVECONF".to_string()));
            }
            self.saved = true;
            Ok(())
        }
    }

    fn guard_set() -> GuardSet {
        let mut set = GuardSet::new();
        set.layer2
            .push(Guard::new("A".repeat(40), NOW, NOW + 86400.0));
        set.layer2
            .push(Guard::new("B".repeat(40), NOW, NOW + 86400.0));
        set.layer3
            .push(Guard::new("C".repeat(40), NOW, NOW + 3600.0));
        set
    }

    fn config(rotation: RotationConfig) -> Config {
        Config {
            rotation,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_apply_pushes_guard_layers() {
        let mut plane = FakePlane::default();
        let set = guard_set();
        let cfg = config(RotationConfig::default());

        apply_guard_config(&mut plane, &set, &cfg).await.unwrap();

        let names: Vec<&str> = plane.pushed.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"HSLayer2Nodes"));
        assert!(names.contains(&"HSLayer3Nodes"));
        let layer2 = plane
            .pushed
            .iter()
            .find(|(n, _)| n == "HSLayer2Nodes")
            .unwrap();
        assert_eq!(layer2.1, format!("{},{}", "A".repeat(40), "B".repeat(40)));
        assert!(plane.saved);
    }

    #[tokio::test]
    async fn test_apply_layer1_overrides() {
        let mut plane = FakePlane::default();
        let set = guard_set();
        let mut rotation = RotationConfig::default();
        rotation.num_layer1_guards = 2;
        rotation.layer1_lifetime_days = 30;

        apply_guard_config(&mut plane, &set, &config(rotation))
            .await
            .unwrap();

        assert!(plane
            .pushed
            .contains(&("NumEntryGuards".to_string(), "2".to_string())));
        assert!(plane
            .pushed
            .contains(&("NumPrimaryGuards".to_string(), "2".to_string())));
        assert!(plane
            .pushed
            .contains(&("GuardLifetime".to_string(), "30 days".to_string())));
    }

    #[tokio::test]
    async fn test_apply_skips_layer1_when_unconfigured() {
        let mut plane = FakePlane::default();
        let set = guard_set();
        let mut rotation = RotationConfig::default();
        rotation.num_layer1_guards = 0;
        rotation.layer1_lifetime_days = 0;

        apply_guard_config(&mut plane, &set, &config(rotation))
            .await
            .unwrap();

        assert!(!plane.pushed.iter().any(|(n, _)| n == "NumEntryGuards"));
        assert!(!plane.pushed.iter().any(|(n, _)| n == "GuardLifetime"));
    }

    #[tokio::test]
    async fn test_apply_skips_layer3_when_disabled() {
        let mut plane = FakePlane::default();
        let set = guard_set();
        let mut rotation = RotationConfig::default();
        rotation.num_layer3_guards = 0;

        apply_guard_config(&mut plane, &set, &config(rotation))
            .await
            .unwrap();

        assert!(!plane.pushed.iter().any(|(n, _)| n == "HSLayer3Nodes"));
    }

    #[tokio::test]
    async fn test_unsupported_option_is_skipped() {
        let mut plane = FakePlane::default();
        plane.unsupported.insert("NumPrimaryGuards".to_string());
        let set = guard_set();
        let mut rotation = RotationConfig::default();
        rotation.num_layer1_guards = 2;

        apply_guard_config(&mut plane, &set, &config(rotation))
            .await
            .unwrap();

        // The rest of the pass still ran.
        assert!(plane.pushed.iter().any(|(n, _)| n == "HSLayer2Nodes"));
        assert!(plane.saved);
    }

    #[tokio::test]
    async fn test_unsupported_option_escalates_under_halt_policy() {
        let mut plane = FakePlane::default();
        plane.unsupported.insert("NumPrimaryGuards".to_string());
        let set = guard_set();
        let mut rotation = RotationConfig::default();
        rotation.num_layer1_guards = 2;
        let mut cfg = config(rotation);
        cfg.halt_on_config_errors = true;

        let result = apply_guard_config(&mut plane, &set, &cfg).await;
        assert!(matches!(result, Err(Error::FeatureUnsupported(_))));
    }

    #[tokio::test]
    async fn test_unsupported_saveconf_is_tolerated() {
        let mut plane = FakePlane {
            save_unsupported: true,
            ..FakePlane::default()
        };
        let set = guard_set();
        let mut cfg = config(RotationConfig::default());
        cfg.halt_on_config_errors = true;

        apply_guard_config(&mut plane, &set, &cfg).await.unwrap();
        assert!(!plane.saved);
    }

    #[test]
    fn test_parse_bandwidth_weights() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cached-microdesc-consensus");
        std::fs::write(
            &path,
            "network-status-version 3 microdesc\n\
             bandwidth-weights Wbd=0 Wbe=0 Wgg=4194 Wmm=10000 Wmg=5806\n\
             directory-footer\n",
        )
        .unwrap();

        let weights = parse_bandwidth_weights(&path).unwrap();
        assert_eq!(weights.get("Wgg"), Some(&4194));
        assert_eq!(weights.get("Wmm"), Some(&10000));
        assert_eq!(weights.get("Wbd"), Some(&0));
    }

    #[test]
    fn test_parse_bandwidth_weights_missing_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cached-microdesc-consensus");
        std::fs::write(&path, "network-status-version 3 microdesc\n").unwrap();

        assert!(matches!(
            parse_bandwidth_weights(&path),
            Err(Error::Consensus(_))
        ));
    }

    #[test]
    fn test_parse_bandwidth_weights_missing_file() {
        assert!(matches!(
            parse_bandwidth_weights(Path::new("/nonexistent/consensus")),
            Err(Error::Consensus(_))
        ));
    }

    #[test]
    fn test_base64_fingerprint_to_hex() {
        // 20 zero bytes, unpadded consensus form.
        assert_eq!(
            base64_fingerprint_to_hex("AAAAAAAAAAAAAAAAAAAAAAAAAAA"),
            "0".repeat(40)
        );
        assert_eq!(base64_fingerprint_to_hex("QUJD"), "414243");
        assert_eq!(base64_fingerprint_to_hex("!!!"), "");
    }

    #[test]
    fn test_parse_status_entries() {
        let response = "\
r relayA AAAAAAAAAAAAAAAAAAAAAAAAAAA 2026-01-01 12:00:00 192.0.2.10 9001 0
s Fast Running Stable Valid
w Bandwidth=2000 Measured=1800
r relayB /////////////////////////// 2026-01-01 12:00:00 192.0.2.11 443 0
s Running Valid
w Bandwidth=500
";
        let relays = parse_status_entries(response);
        assert_eq!(relays.len(), 2);

        assert_eq!(relays[0].nickname, "relayA");
        assert_eq!(relays[0].fingerprint, "0".repeat(40));
        assert_eq!(relays[0].or_port, 9001);
        assert!(relays[0].flags.contains(&"Stable".to_string()));
        assert_eq!(relays[0].bandwidth, Some(2000));
        assert_eq!(relays[0].measured, Some(1800));

        assert_eq!(relays[1].fingerprint, "F".repeat(40));
        assert_eq!(relays[1].measured, None);
        assert_eq!(relays[1].bandwidth, Some(500));
    }

    #[test]
    fn test_secure_password_redacts_debug() {
        let password = SecurePassword::new("hunter2".to_string());
        let debug = format!("{:?}", password);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("hunter2"));
        assert_eq!(password.as_str(), "hunter2");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(is_fatal(&Error::PopulationExhausted {
            layer: "layer3",
            eligible: 3,
            target: 4,
        }));
        assert!(is_fatal(&Error::NoEligibleRelays));
        assert!(!is_fatal(&Error::Consensus("x".to_string())));
        assert!(!is_fatal(&Error::CorruptState("x".to_string())));
    }
}
