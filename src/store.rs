//! Durable persistence for the guard set.
//!
//! The whole [`GuardSet`] (both layers plus use counters) is serialized as
//! one opaque binary blob. Writes go to a temp file in the same directory
//! and are renamed over the target, so a crash mid-write never leaves a
//! half-written file for the next load to trip over. On Unix the file is
//! created with mode 0600; it contains the service's guard fingerprints.
//!
//! Loads treat every failure mode the same way: unreadable bytes, an
//! unknown schema revision, or content that fails
//! [`GuardSet::validate`] all come back as
//! [`Error::CorruptState`](crate::Error::CorruptState), and
//! [`StateStore::load_or_default`] recovers by starting from an empty set.
//! There is no field-level migration; a schema change means a fresh start.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::state::GuardSet;

/// Reads and writes the persisted guard set at a fixed path.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Creates a store bound to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the path this store persists to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads and validates the persisted guard set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptState`] if the file cannot be read, parsed,
    /// or fails structural validation.
    pub fn load(&self) -> Result<GuardSet> {
        let file = File::open(&self.path)
            .map_err(|e| Error::CorruptState(format!("cannot open state file: {}", e)))?;
        let reader = BufReader::new(file);
        let set: GuardSet = serde_pickle::from_reader(reader, Default::default())
            .map_err(|e| Error::CorruptState(format!("cannot parse state file: {}", e)))?;

        set.validate(unix_now())?;
        Ok(set)
    }

    /// Loads the guard set, falling back to an empty one.
    ///
    /// A missing file is the normal first run. Anything else that prevents
    /// loading is logged and discarded; the engine rebuilds the guard set
    /// from the next consensus rather than refusing to start.
    pub fn load_or_default(&self) -> GuardSet {
        match self.load() {
            Ok(set) => set,
            Err(e) => {
                if self.path.exists() {
                    warn!(
                        "Discarding unusable state file {}: {}",
                        self.path.display(),
                        e
                    );
                } else {
                    info!("Creating new guard state at {}", self.path.display());
                }
                GuardSet::new()
            }
        }
    }

    /// Atomically persists the guard set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the temp file cannot be written or renamed
    /// into place. The previously persisted state is untouched on failure.
    pub fn save(&self, set: &GuardSet) -> Result<()> {
        let temp_path = self.path.with_extension("tmp");

        #[cfg(unix)]
        let file = {
            use std::os::unix::fs::OpenOptionsExt;
            std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&temp_path)?
        };

        #[cfg(not(unix))]
        let file = File::create(&temp_path)?;

        let mut writer = BufWriter::new(file);
        serde_pickle::to_writer(&mut writer, set, Default::default())
            .map_err(|e| Error::CorruptState(format!("cannot serialize state: {}", e)))?;
        writer.flush()?;
        drop(writer);

        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
