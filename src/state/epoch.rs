//! Epoch Store
//!
//! Durable storage for the two epoch counters a quorum peer keeps in its
//! snapshot directory: `currentEpoch` and `acceptedEpoch`. Each counter is a
//! single decimal line in its own file.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::zxid::{epoch_of, zxid_to_string, Epoch, Zxid};
use crate::error::{Error, Result};

/// File holding the epoch of the data this node has accepted from a confirmed leader
pub const CURRENT_EPOCH_FILENAME: &str = "currentEpoch";

/// File holding the highest epoch this node has promised to accept
pub const ACCEPTED_EPOCH_FILENAME: &str = "acceptedEpoch";

/// The two persisted counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochFile {
    Current,
    Accepted,
}

impl EpochFile {
    /// Name of the backing file in the snapshot directory
    pub fn file_name(&self) -> &'static str {
        match self {
            EpochFile::Current => CURRENT_EPOCH_FILENAME,
            EpochFile::Accepted => ACCEPTED_EPOCH_FILENAME,
        }
    }
}

impl std::fmt::Display for EpochFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.file_name())
    }
}

/// Both epochs as loaded at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochPair {
    pub current: Epoch,
    pub accepted: Epoch,
}

#[derive(Debug, Default)]
struct EpochCache {
    current: Option<Epoch>,
    accepted: Option<Epoch>,
}

impl EpochCache {
    fn slot(&mut self, file: EpochFile) -> &mut Option<Epoch> {
        match file {
            EpochFile::Current => &mut self.current,
            EpochFile::Accepted => &mut self.accepted,
        }
    }
}

/// Durable epoch counters with an in-memory cache.
///
/// The cache lock is held across the durable write, so other tasks only
/// ever observe values that are already on disk.
pub struct EpochStore {
    /// Snapshot directory
    snap_dir: PathBuf,
    /// Cached values (None until first read)
    cache: Mutex<EpochCache>,
}

impl EpochStore {
    /// Open the epoch store rooted at the given snapshot directory
    pub fn new(snap_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&snap_dir)?;
        Ok(Self {
            snap_dir,
            cache: Mutex::new(EpochCache::default()),
        })
    }

    /// Get the snapshot directory
    pub fn snap_dir(&self) -> &Path {
        &self.snap_dir
    }

    fn path(&self, file: EpochFile) -> PathBuf {
        self.snap_dir.join(file.file_name())
    }

    /// Read one counter straight from disk.
    ///
    /// A missing file is reported as [`Error::EpochNotFound`], any other
    /// read failure as [`Error::EpochUnreadable`], content that does not
    /// parse as [`Error::EpochFormat`].
    pub fn read(&self, file: EpochFile) -> Result<Epoch> {
        let path = self.path(file);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::EpochNotFound(path.display().to_string()));
            }
            Err(e) => {
                return Err(Error::EpochUnreadable {
                    file: path.display().to_string(),
                    source: e,
                });
            }
        };

        let line = content.lines().next().unwrap_or("").trim();
        line.parse::<Epoch>().map_err(|_| Error::EpochFormat {
            file: path.display().to_string(),
            content: line.to_string(),
        })
    }

    /// Write one counter and force it to durable media.
    ///
    /// The value goes to a temporary file which is synced and then renamed
    /// over the old one, so a crash leaves either the old or the new value.
    pub fn write(&self, file: EpochFile, value: Epoch) -> Result<()> {
        let path = self.path(file);
        let tmp_path = self.snap_dir.join(format!("{}.tmp", file.file_name()));

        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        write!(writer, "{}", value)?;
        writer.flush()?;
        let out = writer
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))?;
        out.sync_all()?;
        drop(out);

        fs::rename(&tmp_path, &path)?;

        // Persist the rename itself
        if let Ok(dir) = File::open(&self.snap_dir) {
            if let Err(e) = dir.sync_all() {
                tracing::debug!("Could not sync snapshot directory {:?}: {}", self.snap_dir, e);
            }
        }

        tracing::debug!("Persisted {} = {}", file, value);
        Ok(())
    }

    /// Load both epochs, deriving missing ones from the last processed zxid.
    ///
    /// Fails when `currentEpoch < epoch(lastProcessedZxid)` or
    /// `acceptedEpoch < currentEpoch`; such a node must not serve.
    pub async fn load(&self, last_processed_zxid: Zxid) -> Result<EpochPair> {
        let epoch_of_zxid = epoch_of(last_processed_zxid);
        let mut cache = self.cache.lock().await;

        let current = match self.read(EpochFile::Current) {
            Ok(epoch) => epoch,
            Err(Error::EpochNotFound(_)) => {
                tracing::info!(
                    "{} missing, deriving {} from the last processed zxid",
                    CURRENT_EPOCH_FILENAME,
                    epoch_of_zxid
                );
                self.write(EpochFile::Current, epoch_of_zxid)?;
                epoch_of_zxid
            }
            Err(e) => return Err(e),
        };

        if epoch_of_zxid > current {
            return Err(Error::EpochInconsistent(format!(
                "The current epoch, {}, is older than the last zxid, {}",
                zxid_to_string(current),
                zxid_to_string(last_processed_zxid)
            )));
        }

        let accepted = match self.read(EpochFile::Accepted) {
            Ok(epoch) => epoch,
            Err(Error::EpochNotFound(_)) => {
                if epoch_of_zxid < current {
                    return Err(Error::EpochInconsistent(format!(
                        "{} missing and the derived value {} is less than the current epoch {}",
                        ACCEPTED_EPOCH_FILENAME,
                        zxid_to_string(epoch_of_zxid),
                        zxid_to_string(current)
                    )));
                }
                tracing::info!(
                    "{} missing, deriving {} from the last processed zxid",
                    ACCEPTED_EPOCH_FILENAME,
                    epoch_of_zxid
                );
                self.write(EpochFile::Accepted, epoch_of_zxid)?;
                epoch_of_zxid
            }
            Err(e) => return Err(e),
        };

        if accepted < current {
            return Err(Error::EpochInconsistent(format!(
                "The accepted epoch, {} is less than the current epoch, {}",
                zxid_to_string(accepted),
                zxid_to_string(current)
            )));
        }

        cache.current = Some(current);
        cache.accepted = Some(accepted);

        Ok(EpochPair { current, accepted })
    }

    async fn get(&self, file: EpochFile) -> Result<Epoch> {
        let mut cache = self.cache.lock().await;
        let slot = cache.slot(file);
        if let Some(epoch) = *slot {
            return Ok(epoch);
        }
        let epoch = self.read(file)?;
        *slot = Some(epoch);
        Ok(epoch)
    }

    async fn set(&self, file: EpochFile, epoch: Epoch) -> Result<()> {
        let mut cache = self.cache.lock().await;
        self.write(file, epoch)?;
        *cache.slot(file) = Some(epoch);
        Ok(())
    }

    /// Get the current epoch (read from disk on first access)
    pub async fn current_epoch(&self) -> Result<Epoch> {
        self.get(EpochFile::Current).await
    }

    /// Get the accepted epoch (read from disk on first access)
    pub async fn accepted_epoch(&self) -> Result<Epoch> {
        self.get(EpochFile::Accepted).await
    }

    /// Persist a new current epoch; returns once it is durable
    pub async fn set_current_epoch(&self, epoch: Epoch) -> Result<()> {
        self.set(EpochFile::Current, epoch).await
    }

    /// Persist a new accepted epoch; returns once it is durable
    pub async fn set_accepted_epoch(&self, epoch: Epoch) -> Result<()> {
        self.set(EpochFile::Accepted, epoch).await
    }
}
