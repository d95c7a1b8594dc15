//! Configuration Types
//!
//! Paired devices and the registry file that holds them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::DEFAULT_PORT;

/// A paired agent.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Display name (from the pairing descriptor, defaults to host)
    pub name: String,

    /// Agent host or IP
    pub host: String,

    /// Agent port (default 8765)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Shared secret presented in `auth`
    pub token: String,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Device {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        token: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            token: token.into(),
        }
    }

    /// `host:port` dial target
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            // bare IPv6 literal
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Errors resolving a device from the registry
#[derive(Debug, Error, PartialEq)]
pub enum DeviceLookupError {
    #[error("no devices paired, run: tether pair")]
    NoDevices,

    #[error("device {0:?} not found, run: tether devices")]
    NotFound(String),

    #[error("several devices paired and none is the default, pass --device")]
    NoDefault,
}

/// Root registry file structure (`config.json`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceRegistry {
    /// Paired devices
    #[serde(default)]
    pub devices: Vec<Device>,

    /// Name of the device used when none is given
    #[serde(default)]
    pub default_device: String,

    /// Language model API key (the environment takes precedence)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anthropic_key: Option<String>,
}

impl DeviceRegistry {
    /// Add a device, replacing in place any entry with the same name or host.
    ///
    /// The first device ever added becomes the default.
    pub fn add_or_update(&mut self, device: Device) {
        if let Some(existing) = self
            .devices
            .iter_mut()
            .find(|d| d.name == device.name || d.host == device.host)
        {
            if existing.name == self.default_device {
                self.default_device = device.name.clone();
            }
            *existing = device;
            return;
        }

        if self.default_device.is_empty() {
            self.default_device = device.name.clone();
        }
        self.devices.push(device);
    }

    /// Resolve a device: explicit name, then the default, then the only one.
    pub fn get_device(&self, name: Option<&str>) -> Result<&Device, DeviceLookupError> {
        let name = name
            .filter(|n| !n.is_empty())
            .unwrap_or(self.default_device.as_str());

        if name.is_empty() {
            return match self.devices.as_slice() {
                [only] => Ok(only),
                [] => Err(DeviceLookupError::NoDevices),
                _ => Err(DeviceLookupError::NoDefault),
            };
        }

        self.devices
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| DeviceLookupError::NotFound(name.to_string()))
    }

    /// Remove a device by name
    pub fn remove_device(&mut self, name: &str) -> Option<Device> {
        let pos = self.devices.iter().position(|d| d.name == name)?;
        let removed = self.devices.remove(pos);
        if self.default_device == name {
            self.default_device = self
                .devices
                .first()
                .map(|d| d.name.clone())
                .unwrap_or_default();
        }
        Some(removed)
    }

    pub fn is_default(&self, device: &Device) -> bool {
        self.default_device == device.name
    }
}
