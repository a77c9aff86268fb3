use std::io;
use std::str::Utf8Error;
use thiserror::Error;
use btleplug;
use serde_json;

use crate::device::types::DeviceId;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

impl ConfigError {
    pub fn is_file_not_found_error(&self) -> bool {
        match self {
            ConfigError::IOError { source } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Error communicating with adapter (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("No bluetooth adapter is present")]
    NoAdapter,

    #[error("Permission to use bluetooth was denied")]
    PermissionDenied,

    #[error("Adapter rejected the request: {reason}")]
    Rejected { reason: String },
}

impl DeviceError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(
            self,
            DeviceError::PermissionDenied | DeviceError::Btle { source: btleplug::Error::PermissionDenied }
        )
    }
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("No bluetooth adapter is available")]
    AdapterUnavailable,

    #[error("Bluetooth is disabled")]
    AdapterDisabled,

    #[error("Permission to scan for bluetooth devices was denied")]
    PermissionDenied,

    #[error("A discovery session is already active")]
    AlreadyScanning,

    #[error("Unknown device {id}")]
    UnknownDevice { id: DeviceId },

    #[error("Adapter failure: {source}")]
    Adapter { source: DeviceError },
}

impl From<DeviceError> for DiscoveryError {
    fn from(source: DeviceError) -> Self {
        if source.is_permission_denied() {
            return DiscoveryError::PermissionDenied;
        }

        match source {
            DeviceError::NoAdapter => DiscoveryError::AdapterUnavailable,
            source => DiscoveryError::Adapter { source },
        }
    }
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start application (adapter): {source}")]
    DeviceError { #[from] source: DeviceError },

    #[error("Discovery failed: {source}")]
    Discovery { #[from] source: DiscoveryError },

    #[error("Failed to write output: {source}")]
    Output { #[from] source: io::Error },

    #[error("Failed to encode output: {source}")]
    Json { #[from] source: serde_json::Error },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_failures_map_to_permission_denied() {
        let err: DiscoveryError = DeviceError::Btle { source: btleplug::Error::PermissionDenied }.into();
        assert!(matches!(err, DiscoveryError::PermissionDenied));

        let err: DiscoveryError = DeviceError::PermissionDenied.into();
        assert!(matches!(err, DiscoveryError::PermissionDenied));
    }

    #[test]
    fn missing_adapter_maps_to_unavailable() {
        let err: DiscoveryError = DeviceError::NoAdapter.into();
        assert!(matches!(err, DiscoveryError::AdapterUnavailable));

        let err: DiscoveryError = DeviceError::Rejected { reason: "busy".to_string() }.into();
        assert!(matches!(err, DiscoveryError::Adapter { .. }));
    }
}
