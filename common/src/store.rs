use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ConfigurationRecord;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to mount storage: {0}")]
    Mount(String),
    #[error("failed to read configuration: {0}")]
    Read(String),
    #[error("failed to write configuration: {0}")]
    Write(String),
    #[error("failed to erase storage: {0}")]
    Erase(String),
}

/// Non-volatile medium holding the single configuration blob.
pub trait BlobStorage {
    fn mount(&mut self) -> Result<(), StorageError>;
    /// `Ok(None)` when nothing has ever been written.
    fn read(&mut self) -> Result<Option<Vec<u8>>, StorageError>;
    fn write(&mut self, blob: &[u8]) -> Result<(), StorageError>;
    fn erase(&mut self) -> Result<(), StorageError>;
}

pub struct ConfigStore<S> {
    storage: S,
}

impl<S: BlobStorage> ConfigStore<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// The only storage failure the node cannot run without.
    pub fn mount(&mut self) -> Result<(), StorageError> {
        info!("mounting configuration storage");
        self.storage.mount()?;
        info!("configuration storage mounted");
        Ok(())
    }

    pub fn load(&mut self) -> ConfigurationRecord {
        let raw = match self.storage.read() {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                info!("no stored configuration; using defaults");
                return ConfigurationRecord::default();
            }
            Err(err) => {
                warn!("{err}; using defaults");
                return ConfigurationRecord::default();
            }
        };

        debug!("stored configuration: {} bytes", raw.len());

        let record = match ConfigurationRecord::decode_lenient(&raw) {
            Ok((record, rejected)) => {
                for rejection in rejected {
                    warn!(
                        "stored field `{}` ignored ({}); using default",
                        rejection.key, rejection.error
                    );
                }
                record
            }
            Err(err) => {
                warn!("failed to parse stored configuration ({err}); using defaults");
                ConfigurationRecord::default()
            }
        };

        info!(
            "configuration loaded: broker=`{}:{}`, topic=`{}`, static_ip={}, api_token_set={}",
            record.broker_host,
            record.broker_port,
            record.topic,
            record
                .static_ip
                .map(|config| config.ip.to_string())
                .unwrap_or_else(|| "none".to_string()),
            record.has_api_token(),
        );
        record
    }

    /// Overwrites the stored blob. Failures are logged and leave the previous blob in place.
    pub fn save(&mut self, record: &ConfigurationRecord) -> bool {
        let payload = match record.encode() {
            Ok(payload) => payload,
            Err(err) => {
                warn!("failed to serialize configuration: {err}");
                return false;
            }
        };

        match self.storage.write(&payload) {
            Ok(()) => {
                info!("configuration saved ({} bytes)", payload.len());
                true
            }
            Err(err) => {
                warn!("{err}");
                false
            }
        }
    }

    pub fn reset(&mut self) -> bool {
        match self.storage.erase() {
            Ok(()) => {
                warn!("configuration storage erased");
                true
            }
            Err(err) => {
                warn!("{err}");
                false
            }
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }
}
