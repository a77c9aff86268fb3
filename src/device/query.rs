use std::sync::{Arc, RwLock};
use log::debug;
use serde::Serialize;
use tokio::sync::watch;

use crate::device::registry::Registry;
use crate::device::types::{Category, DeviceId, DeviceRecord, ScanState};

// Writers are serialized by the reconciler task; readers take the read lock and therefore see
// either the state before or after an event, never something in between.
pub struct SharedRegistry {
    registry: RwLock<Registry>,
    changes: watch::Sender<u64>,
}

impl SharedRegistry {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);

        SharedRegistry {
            registry: RwLock::new(Registry::new()),
            changes,
        }
    }

    pub fn read<T>(&self, f: impl FnOnce(&Registry) -> T) -> T {
        let registry = self.registry.read().expect("Failed to lock registry for reading");
        f(&registry)
    }

    pub fn update<T>(&self, f: impl FnOnce(&mut Registry) -> T) -> T {
        let mut registry = self.registry.write().expect("Failed to lock registry for writing");
        let before = registry.revision();
        let result = f(&mut registry);
        let after = registry.revision();
        drop(registry);

        if after != before {
            self.publish(after);
        }
        result
    }

    pub fn replace(&self, fresh: Registry) {
        let mut registry = self.registry.write().expect("Failed to lock registry for writing");
        // keep revisions monotonic across sessions so that watchers never miss a reset
        let revision = registry.revision() + fresh.revision() + 1;
        *registry = fresh;
        registry.bump_revision_to(revision);
        drop(registry);

        self.publish(revision);
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn publish(&self, revision: u64) {
        self.changes.send_replace(revision);
    }
}

impl Default for SharedRegistry {
    fn default() -> Self {
        SharedRegistry::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub connected_device: Option<DeviceId>,
    pub additional_connected: Vec<DeviceId>,
    pub previously_connected: Vec<DeviceId>,
    pub available: Vec<DeviceId>,
    pub scan_state: ScanState,
    pub revision: u64,
}

impl Snapshot {
    pub fn from_registry(registry: &Registry) -> Self {
        let mut connected = registry.connected_ids().into_iter();
        let connected_device = connected.next();
        let additional_connected: Vec<DeviceId> = connected.collect();

        if !additional_connected.is_empty() {
            debug!(
                "More than one device reports being connected; showing {} and also {:?}",
                connected_device.as_ref().map(DeviceId::as_str).unwrap_or_default(),
                additional_connected,
            );
        }

        Snapshot {
            connected_device,
            additional_connected,
            previously_connected: registry.ids_in(Category::PreviouslyConnected),
            available: registry.ids_in(Category::Available),
            scan_state: registry.scan_state(),
            revision: registry.revision(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.connected_device.is_none() && self.previously_connected.is_empty() && self.available.is_empty()
    }
}

#[derive(Clone)]
pub struct DeviceQuery {
    shared: Arc<SharedRegistry>,
}

impl DeviceQuery {
    pub fn new(shared: Arc<SharedRegistry>) -> Self {
        DeviceQuery { shared }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.shared.read(Snapshot::from_registry)
    }

    pub fn device(&self, id: &DeviceId) -> Option<DeviceRecord> {
        self.shared.read(|registry| registry.get(id).cloned())
    }

    pub fn devices(&self, ids: &[DeviceId]) -> Vec<DeviceRecord> {
        self.shared.read(|registry| {
            ids.iter().filter_map(|id| registry.get(id).cloned()).collect()
        })
    }

    pub fn scan_state(&self) -> ScanState {
        self.shared.read(|registry| registry.scan_state())
    }

    pub fn changes(&self) -> watch::Receiver<u64> {
        self.shared.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};
    use crate::device::types::BondState;
    use super::*;

    fn id(raw: &str) -> DeviceId {
        DeviceId::parse(raw).unwrap()
    }

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn every_device_lands_in_exactly_one_bucket() {
        let shared = Arc::new(SharedRegistry::new());
        shared.update(|registry| {
            registry.seed_bonded(id("x"), Some("Headphones".to_string()), true);
            registry.seed_bonded(id("y"), None, false);
            registry.upsert_found(id("z"), Some("Speaker".to_string()), at(1));
            registry.set_bond_state(id("w"), BondState::Bonding);
        });

        let snapshot = DeviceQuery::new(shared).snapshot();
        let mut all: Vec<DeviceId> = snapshot.connected_device.iter().cloned().collect();
        all.extend(snapshot.additional_connected.iter().cloned());
        all.extend(snapshot.previously_connected.iter().cloned());
        all.extend(snapshot.available.iter().cloned());
        all.sort();

        assert_eq!(all, vec![id("w"), id("x"), id("y"), id("z")]);
        assert_eq!(snapshot.connected_device, Some(id("x")));
        assert_eq!(snapshot.previously_connected, vec![id("y")]);
        assert_eq!(snapshot.available, vec![id("w"), id("z")]);
    }

    #[test]
    fn several_connected_devices_are_surfaced() {
        let shared = Arc::new(SharedRegistry::new());
        shared.update(|registry| {
            registry.seed_bonded(id("first"), None, true);
            registry.seed_bonded(id("second"), None, true);
        });

        let query = DeviceQuery::new(shared.clone());
        let snapshot = query.snapshot();
        assert_eq!(snapshot.connected_device, Some(id("first")));
        assert_eq!(snapshot.additional_connected, vec![id("second")]);
        assert_eq!(shared.read(|registry| registry.len()), 2);
    }

    #[test]
    fn replace_discards_devices_and_notifies() {
        let shared = Arc::new(SharedRegistry::new());
        let query = DeviceQuery::new(shared.clone());
        let changes = query.changes();

        shared.update(|registry| registry.upsert_found(id("a"), None, at(1)));
        let before = *changes.borrow();
        assert_eq!(before, 1);

        shared.replace(Registry::new());
        assert!(query.snapshot().is_empty());
        assert!(*changes.borrow() > before);
        assert!(query.device(&id("a")).is_none());
    }

    #[test]
    fn unchanged_update_does_not_notify() {
        let shared = SharedRegistry::new();
        let changes = shared.subscribe();

        shared.update(|registry| registry.set_scan_state(ScanState::Idle));
        assert!(!changes.has_changed().unwrap());
    }
}
