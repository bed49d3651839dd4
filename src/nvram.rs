//! Persisted configuration.
//!
//! The record on the backing store is `{version, digest, data}` in JSON,
//! where `digest` is the hex MD5 of the serialised `data`. A record that
//! fails either check is discarded in favour of defaults.

use crate::error::{Error, Result};
use crate::subsystems::SatelliteMode;
use crate::utils;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

pub const NVRAM_VERSION: u32 = 1;
pub const DEFAULT_MAC_KEY: &[u8] = b"satcore-default-key";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvramData {
    pub boot_count: u32,
    #[serde(with = "serde_bytes")]
    pub mac_key: Vec<u8>,
    /// Highest uplink sequence number accepted so far.
    pub last_sequence_number: u32,
    pub power_save: bool,
    pub heater: bool,
    pub last_mode: SatelliteMode,
}

impl Default for NvramData {
    fn default() -> Self {
        Self {
            boot_count: 0,
            mac_key: DEFAULT_MAC_KEY.to_vec(),
            last_sequence_number: 0,
            power_save: false,
            heater: false,
            last_mode: SatelliteMode::Booting,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct NvramRecord {
    version: u32,
    digest: String,
    data: NvramData,
}

fn digest(data: &NvramData) -> Result<String> {
    let bytes = serde_json::to_vec(data).map_err(|_| Error::Error)?;
    Ok(hex::encode(md5::compute(bytes).0))
}

pub trait NvramBackend: Send {
    /// `None` if nothing was ever stored.
    fn load(&mut self) -> Result<Option<Vec<u8>>>;
    fn store(&mut self, bytes: &[u8]) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl NvramBackend for FileBackend {
    fn load(&mut self) -> Result<Option<Vec<u8>>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&mut self, bytes: &[u8]) -> Result<()> {
        let staging = self.path.with_extension("tmp");
        std::fs::write(&staging, bytes)?;
        std::fs::rename(&staging, &self.path)?;
        Ok(())
    }
}

/// Volatile backend; clones share the stored bytes.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    bytes: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Option<Vec<u8>> {
        utils::lock(&self.bytes).clone()
    }

    pub fn overwrite(&self, bytes: &[u8]) {
        *utils::lock(&self.bytes) = Some(bytes.to_vec());
    }
}

impl NvramBackend for MemoryBackend {
    fn load(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.contents())
    }

    fn store(&mut self, bytes: &[u8]) -> Result<()> {
        self.overwrite(bytes);
        Ok(())
    }
}

pub struct Nvram {
    data: Mutex<NvramData>,
    dirty: AtomicBool,
    backend: Mutex<Box<dyn NvramBackend>>,
}

impl Nvram {
    /// Defaults, not yet loaded from `backend`.
    pub fn new(backend: impl NvramBackend + 'static) -> Self {
        Self {
            data: Mutex::new(NvramData::default()),
            dirty: AtomicBool::new(false),
            backend: Mutex::new(Box::new(backend)),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new())
    }

    /// Replaces the in-memory copy with the stored record. An empty store
    /// yields defaults. A corrupt, foreign-version or tampered record also
    /// yields defaults, reported as `Error::Error`.
    pub fn reload(&self) -> Result<()> {
        let stored = utils::lock(&self.backend).load()?;
        let (data, result) = match stored {
            None => (NvramData::default(), Ok(())),
            Some(bytes) => match Self::decode(&bytes) {
                Ok(data) => (data, Ok(())),
                Err(e) => {
                    warn!("nvram record rejected, using defaults");
                    (NvramData::default(), Err(e))
                }
            },
        };
        *utils::lock(&self.data) = data;
        self.dirty.store(false, Ordering::Release);
        result
    }

    fn decode(bytes: &[u8]) -> Result<NvramData> {
        let record: NvramRecord = serde_json::from_slice(bytes).map_err(|_| Error::Error)?;
        if record.version != NVRAM_VERSION {
            return Err(Error::Error);
        }
        if digest(&record.data)? != record.digest {
            return Err(Error::Error);
        }
        Ok(record.data)
    }

    pub fn read<R>(&self, f: impl FnOnce(&NvramData) -> R) -> R {
        f(&*utils::lock(&self.data))
    }

    pub fn snapshot(&self) -> NvramData {
        self.read(NvramData::clone)
    }

    /// Mutates the in-memory copy; persisted on the next [`Nvram::flush`].
    pub fn save(&self, f: impl FnOnce(&mut NvramData)) {
        f(&mut *utils::lock(&self.data));
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Writes the record if anything changed since the last flush.
    pub fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let data = self.snapshot();
        let record = NvramRecord {
            version: NVRAM_VERSION,
            digest: digest(&data)?,
            data,
        };
        let bytes = serde_json::to_vec(&record).map_err(|_| Error::Error)?;
        if let Err(e) = utils::lock(&self.backend).store(&bytes) {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        debug!("nvram flushed ({} bytes)", bytes.len());
        Ok(())
    }
}

impl core::fmt::Debug for Nvram {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Nvram")
            .field("data", &*utils::lock(&self.data))
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_then_reload() {
        let backend = MemoryBackend::new();
        let nvram = Nvram::new(backend.clone());
        nvram.save(|d| {
            d.boot_count = 3;
            d.last_sequence_number = 77;
        });
        assert!(nvram.is_dirty());
        nvram.flush().unwrap();
        assert!(!nvram.is_dirty());

        let restored = Nvram::new(backend);
        restored.reload().unwrap();
        assert_eq!(restored.read(|d| (d.boot_count, d.last_sequence_number)), (3, 77));
    }

    #[test]
    fn test_tampered_record_falls_back_to_defaults() {
        let backend = MemoryBackend::new();
        let nvram = Nvram::new(backend.clone());
        nvram.save(|d| d.boot_count = 9);
        nvram.flush().unwrap();

        let text = String::from_utf8(backend.contents().unwrap()).unwrap();
        backend.overwrite(text.replace("\"boot_count\":9", "\"boot_count\":10").as_bytes());

        assert_eq!(nvram.reload().unwrap_err(), Error::Error);
        assert_eq!(nvram.snapshot(), NvramData::default());
    }

    #[test]
    fn test_empty_store_is_fresh() {
        let nvram = Nvram::in_memory();
        nvram.reload().unwrap();
        assert_eq!(nvram.read(|d| d.mac_key.clone()), DEFAULT_MAC_KEY);
    }
}
