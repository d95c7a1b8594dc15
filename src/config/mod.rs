//! Configuration Management Module
//!
//! Paired devices, the registry file that persists them, and the pairing
//! descriptor that creates them.
//!
//! Registry file: `<config_dir>/tether/config.json`
//! Conversation context: `<config_dir>/tether/context/<device>.json`

pub mod pairing;
pub mod storage;
pub mod types;

pub use pairing::{pair_url, parse_pair_url, PairingError, PAIR_SCHEME};
pub use storage::{
    config_dir, context_dir, write_private, ConfigStorage, StorageError, CONFIG_DIR_ENV,
};
pub use types::{Device, DeviceLookupError, DeviceRegistry};
