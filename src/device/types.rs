use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;
use serde::{Serialize, Serializer};
use thiserror::Error;

/// Hardware address of a peripheral, normalized so that equality is case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceIdError {
    #[error("Device id is empty")]
    Empty,

    #[error("Device id contains control characters: {raw:?}")]
    ControlCharacters { raw: String },
}

impl DeviceId {
    pub fn parse(raw: &str) -> Result<Self, DeviceIdError> {
        let trimmed = raw.trim();

        if trimmed.is_empty() {
            return Err(DeviceIdError::Empty);
        }

        if trimmed.chars().any(char::is_control) {
            return Err(DeviceIdError::ControlCharacters { raw: raw.to_string() });
        }

        Ok(DeviceId(trimmed.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DeviceId {
    type Err = DeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceId::parse(s)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for DeviceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BondState {
    NotBonded,
    Bonding,
    Bonded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

impl ConnectionState {
    pub fn from_connected(connected: bool) -> Self {
        if connected { ConnectionState::Connected } else { ConnectionState::Disconnected }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Category {
    Connected,
    PreviouslyConnected,
    Available,
}

impl Category {
    pub fn derive(bond_state: BondState, connection_state: ConnectionState) -> Self {
        match (bond_state, connection_state) {
            (BondState::Bonded, ConnectionState::Connected) => Category::Connected,
            (BondState::Bonded, ConnectionState::Disconnected) => Category::PreviouslyConnected,
            (BondState::NotBonded | BondState::Bonding, _) => Category::Available,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            Category::Connected => "Currently connected",
            Category::PreviouslyConnected => "Previously connected",
            Category::Available => "Available",
        };

        write!(f, "{}", result)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub display_name: Option<String>,
    pub bond_state: BondState,
    pub connection_state: ConnectionState,
    pub last_seen_at: Option<SystemTime>,
}

impl DeviceRecord {
    pub fn category(&self) -> Category {
        Category::derive(self.bond_state, self.connection_state)
    }

    pub fn label(&self) -> &str {
        match self.display_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => "Unnamed device",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub address: String,
    pub name: Option<String>,
}

impl DeviceHandle {
    pub fn new(address: impl Into<String>, name: Option<&str>) -> Self {
        DeviceHandle {
            address: address.into(),
            name: name.map(String::from),
        }
    }
}

// Raw notification from the adapter. Ids are unvalidated until the reconciler normalizes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    DeviceFound { id: String, name: Option<String> },
    ScanStarted,
    ScanFinished,
    BondStateChanged { id: String, state: BondState },
    ConnectionStateChanged { id: String, connected: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ScanState {
    #[default]
    Idle,
    Scanning,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_is_case_insensitive() {
        let lower = DeviceId::parse("aa:bb:cc:dd:ee:ff").unwrap();
        let upper = DeviceId::parse(" AA:BB:CC:DD:EE:FF ").unwrap();
        assert_eq!(lower, upper);
        assert_eq!(lower.as_str(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn device_id_rejects_malformed() {
        assert_eq!(DeviceId::parse("   "), Err(DeviceIdError::Empty));
        assert!(matches!(DeviceId::parse("AA\u{0}BB"), Err(DeviceIdError::ControlCharacters { .. })));
    }

    #[test]
    fn category_table() {
        use BondState::*;
        use ConnectionState::*;

        assert_eq!(Category::derive(Bonded, Connected), Category::Connected);
        assert_eq!(Category::derive(Bonded, Disconnected), Category::PreviouslyConnected);
        assert_eq!(Category::derive(NotBonded, Disconnected), Category::Available);
        assert_eq!(Category::derive(Bonding, Disconnected), Category::Available);
        assert_eq!(Category::derive(Bonding, Connected), Category::Available);
    }

    #[test]
    fn label_falls_back_for_missing_or_empty_names() {
        let mut record = DeviceRecord {
            id: DeviceId::parse("01").unwrap(),
            display_name: None,
            bond_state: BondState::NotBonded,
            connection_state: ConnectionState::Disconnected,
            last_seen_at: None,
        };
        assert_eq!(record.label(), "Unnamed device");

        record.display_name = Some(String::new());
        assert_eq!(record.label(), "Unnamed device");

        record.display_name = Some("Speaker".to_string());
        assert_eq!(record.label(), "Speaker");
    }
}
