use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use super::coin::Coin;

/// File name of the share/block ledger inside the data directory
pub const LEDGER_FILE: &str = "ledger.json";

/// Directory holding one file per coin inside the data directory
pub const COIN_DIR: &str = "coins";

/// Extension of coin files
const COIN_EXTENSION: &str = "coin";

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Corrupt file {path}: {reason}")]
    Corrupt { path: String, reason: String },
}

/// Durably replaces the contents of `path`
///
/// The previous file, if any, is copied to `<path>.bak`. The new contents go
/// to `<path>.tmp`, are fsynced, and are then renamed over `path`, so a crash
/// leaves either the old or the new document, never a torn one.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    if path.exists() {
        if let Err(e) = fs::copy(path, with_suffix(path, "bak")) {
            warn!("Failed to back up {}: {}", path.display(), e);
        }
    }

    let tmp = with_suffix(path, "tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(&tmp, path)?;

    // persist the rename itself
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

/// Serializes `value` as pretty JSON and writes it atomically
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| StorageError::SerializationError(e.to_string()))?;
    write_atomic(path, &bytes)
}

/// Reads a JSON document, `None` if the file does not exist
///
/// A file that exists but does not parse is reported as `Corrupt`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    serde_json::from_slice(&bytes).map(Some).map_err(|e| StorageError::Corrupt {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// The share/block ledger document
#[derive(Debug, Clone)]
pub struct LedgerFile {
    path: PathBuf,
}

impl LedgerFile {
    /// Creates a handle for the ledger inside `data_dir`
    ///
    /// # Arguments
    ///
    /// * `data_dir` - The node's data directory
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        LedgerFile {
            path: data_dir.as_ref().join(LEDGER_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the ledger, `None` when no ledger has been written yet
    pub fn load<T: DeserializeOwned>(&self) -> Result<Option<T>, StorageError> {
        read_json(&self.path)
    }

    /// Atomically rewrites the ledger
    pub fn save<T: Serialize + ?Sized>(&self, state: &T) -> Result<(), StorageError> {
        write_json(&self.path, state)?;
        debug!("Saved ledger to {}", self.path.display());
        Ok(())
    }
}

/// One JSON document per coin record
#[derive(Debug, Clone)]
pub struct CoinStore {
    dir: PathBuf,
}

impl CoinStore {
    /// Opens (creating if needed) the coin directory inside `data_dir`
    ///
    /// # Arguments
    ///
    /// * `data_dir` - The node's data directory
    ///
    /// # Returns
    ///
    /// A CoinStore rooted at `<data_dir>/coins`
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, StorageError> {
        let dir = data_dir.as_ref().join(COIN_DIR);
        fs::create_dir_all(&dir)?;
        Ok(CoinStore { dir })
    }

    fn coin_path(&self, coin_id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", coin_id, COIN_EXTENSION))
    }

    /// Writes a coin record
    pub fn save(&self, coin: &Coin) -> Result<(), StorageError> {
        write_json(&self.coin_path(&coin.coin_id), coin)
    }

    /// Deletes a coin record and its backup
    pub fn remove(&self, coin_id: &str) -> Result<(), StorageError> {
        let path = self.coin_path(coin_id);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let _ = fs::remove_file(with_suffix(&path, "bak"));
        Ok(())
    }

    /// Loads every coin record in the directory
    ///
    /// Any unreadable record fails the whole load: a ledger with holes could
    /// let a spent coin be spent again.
    pub fn load_all(&self) -> Result<Vec<Coin>, StorageError> {
        let mut coins = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(COIN_EXTENSION) {
                continue;
            }

            if let Some(coin) = read_json::<Coin>(&path)? {
                coins.push(coin);
            }
        }

        Ok(coins)
    }

    /// Deletes every coin record
    pub fn clear(&self) -> Result<(), StorageError> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}
