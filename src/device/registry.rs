use std::time::SystemTime;
use indexmap::IndexMap;

use crate::device::types::{BondState, Category, ConnectionState, DeviceId, DeviceRecord, ScanState};

/// Deduplicated set of device records for one discovery session.
///
/// Records are keyed by [`DeviceId`] and keep their insertion order, which is used as the
/// tie-break whenever two records compare equal.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    devices: IndexMap<DeviceId, DeviceRecord>,
    scan_state: ScanState,
    revision: u64,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, id: &DeviceId) -> Option<&DeviceRecord> {
        self.devices.get(id)
    }

    pub fn records(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.values()
    }

    pub fn scan_state(&self) -> ScanState {
        self.scan_state
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn touch(&mut self) {
        self.revision += 1;
    }

    pub(crate) fn bump_revision_to(&mut self, revision: u64) {
        self.revision = self.revision.max(revision);
    }

    pub fn set_scan_state(&mut self, scan_state: ScanState) -> bool {
        if self.scan_state == scan_state {
            return false;
        }

        self.scan_state = scan_state;
        self.touch();
        true
    }

    pub fn seed_bonded(&mut self, id: DeviceId, name: Option<String>, connected: bool) {
        let record = self.devices.entry(id.clone()).or_insert_with(|| DeviceRecord {
            id,
            display_name: None,
            bond_state: BondState::Bonded,
            connection_state: ConnectionState::Disconnected,
            last_seen_at: None,
        });

        if let Some(name) = name.filter(|name| !name.is_empty()) {
            record.display_name = Some(name);
        }
        record.bond_state = BondState::Bonded;
        record.connection_state = ConnectionState::from_connected(connected);
        self.touch();
    }

    // Record a discovery sighting. Returns true if the id was not known before.
    pub fn upsert_found(&mut self, id: DeviceId, name: Option<String>, now: SystemTime) -> bool {
        let name = name.filter(|name| !name.is_empty());

        let created = match self.devices.get_mut(&id) {
            Some(record) => {
                if name.is_some() {
                    record.display_name = name;
                }
                record.last_seen_at = Some(now);
                false
            },
            None => {
                self.devices.insert(id.clone(), DeviceRecord {
                    id,
                    display_name: name,
                    bond_state: BondState::NotBonded,
                    connection_state: ConnectionState::Disconnected,
                    last_seen_at: Some(now),
                });
                true
            },
        };

        self.touch();
        created
    }

    // losing the bond also drops the connection
    pub fn set_bond_state(&mut self, id: DeviceId, bond_state: BondState) {
        let record = self.devices.entry(id.clone()).or_insert_with(|| DeviceRecord {
            id,
            display_name: None,
            bond_state,
            connection_state: ConnectionState::Disconnected,
            last_seen_at: None,
        });

        record.bond_state = bond_state;
        if bond_state != BondState::Bonded {
            record.connection_state = ConnectionState::Disconnected;
        }
        self.touch();
    }

    // Returns false (and changes nothing) if the update would break the bonded invariant.
    pub fn set_connection_state(&mut self, id: &DeviceId, connection_state: ConnectionState) -> bool {
        let Some(record) = self.devices.get_mut(id) else {
            return connection_state == ConnectionState::Disconnected;
        };

        if connection_state == ConnectionState::Connected && record.bond_state != BondState::Bonded {
            return false;
        }

        if record.connection_state != connection_state {
            record.connection_state = connection_state;
            self.touch();
        }
        true
    }

    // Ids in `category`, ordered by last sighting (bond-only records first), then insertion.
    pub fn ids_in(&self, category: Category) -> Vec<DeviceId> {
        let mut records: Vec<&DeviceRecord> = self.devices.values()
            .filter(|record| record.category() == category)
            .collect();

        // stable sort keeps insertion order for equal timestamps; None sorts before Some
        records.sort_by_key(|record| record.last_seen_at);
        records.into_iter().map(|record| record.id.clone()).collect()
    }

    pub fn connected_ids(&self) -> Vec<DeviceId> {
        self.devices.values()
            .filter(|record| record.category() == Category::Connected)
            .map(|record| record.id.clone())
            .collect()
    }

    pub fn bonded_ids(&self) -> Vec<DeviceId> {
        self.devices.values()
            .filter(|record| record.bond_state == BondState::Bonded)
            .map(|record| record.id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use super::*;

    fn id(raw: &str) -> DeviceId {
        DeviceId::parse(raw).unwrap()
    }

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn repeated_finds_keep_one_record_per_id() {
        let mut registry = Registry::new();
        let sightings = ["aa", "bb", "AA", "cc", "bb", "aA", "cc"];

        for (i, raw) in sightings.iter().enumerate() {
            registry.upsert_found(id(raw), None, at(i as u64));
        }

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.get(&id("aa")).unwrap().last_seen_at, Some(at(5)));
    }

    #[test]
    fn empty_name_never_overwrites() {
        let mut registry = Registry::new();
        registry.upsert_found(id("z"), Some(String::new()), at(1));
        assert_eq!(registry.get(&id("z")).unwrap().display_name, None);

        registry.upsert_found(id("z"), Some("Speaker".to_string()), at(2));
        registry.upsert_found(id("z"), Some(String::new()), at(3));
        registry.upsert_found(id("z"), None, at(4));
        assert_eq!(registry.get(&id("z")).unwrap().display_name.as_deref(), Some("Speaker"));
    }

    #[test]
    fn connection_requires_bond() {
        let mut registry = Registry::new();
        registry.upsert_found(id("a"), None, at(1));

        assert!(!registry.set_connection_state(&id("a"), ConnectionState::Connected));
        assert!(!registry.set_connection_state(&id("unknown"), ConnectionState::Connected));
        assert!(registry.set_connection_state(&id("unknown"), ConnectionState::Disconnected));
        assert_eq!(registry.len(), 1);

        registry.set_bond_state(id("a"), BondState::Bonded);
        assert!(registry.set_connection_state(&id("a"), ConnectionState::Connected));
        assert_eq!(registry.get(&id("a")).unwrap().category(), Category::Connected);
    }

    #[test]
    fn losing_bond_drops_connection() {
        let mut registry = Registry::new();
        registry.seed_bonded(id("a"), Some("Headset".to_string()), true);
        assert_eq!(registry.get(&id("a")).unwrap().category(), Category::Connected);

        registry.set_bond_state(id("a"), BondState::NotBonded);
        let record = registry.get(&id("a")).unwrap();
        assert_eq!(record.connection_state, ConnectionState::Disconnected);
        assert_eq!(record.category(), Category::Available);
    }

    #[test]
    fn ordering_puts_bond_only_records_first_then_by_last_seen() {
        let mut registry = Registry::new();
        registry.upsert_found(id("late"), None, at(20));
        registry.upsert_found(id("early"), None, at(10));
        registry.set_bond_state(id("bonding"), BondState::Bonding);
        registry.upsert_found(id("tie-1"), None, at(15));
        registry.upsert_found(id("tie-2"), None, at(15));

        assert_eq!(
            registry.ids_in(Category::Available),
            vec![id("bonding"), id("early"), id("tie-1"), id("tie-2"), id("late")],
        );
    }

    #[test]
    fn revision_tracks_mutations() {
        let mut registry = Registry::new();
        assert_eq!(registry.revision(), 0);

        registry.upsert_found(id("a"), None, at(1));
        assert_eq!(registry.revision(), 1);

        assert!(registry.set_scan_state(ScanState::Scanning));
        assert!(!registry.set_scan_state(ScanState::Scanning));
        assert_eq!(registry.revision(), 2);
    }
}
