use std::sync::Arc;
use std::time::SystemTime;
use futures::StreamExt;
use futures::channel::mpsc::Receiver;
use log::{debug, info, warn};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::device::query::SharedRegistry;
use crate::device::registry::Registry;
use crate::device::types::{AdapterEvent, ConnectionState, DeviceId, ScanState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Ignored,
    Dropped,
}

fn normalize_id(raw: &str, kind: &str) -> Option<DeviceId> {
    match DeviceId::parse(raw) {
        Ok(id) => Some(id),
        Err(err) => {
            warn!("Dropping malformed {} event: {}", kind, err);
            None
        },
    }
}

pub fn apply_event(registry: &mut Registry, event: AdapterEvent, now: SystemTime) -> Outcome {
    match event {
        AdapterEvent::DeviceFound { id, name } => {
            let Some(id) = normalize_id(&id, "DeviceFound") else { return Outcome::Dropped };

            if registry.upsert_found(id.clone(), name, now) {
                debug!("Device found: {}", id);
            }
            Outcome::Applied
        },
        AdapterEvent::ScanStarted => {
            if registry.set_scan_state(ScanState::Scanning) {
                info!("Discovery started");
                Outcome::Applied
            } else {
                Outcome::Ignored
            }
        },
        AdapterEvent::ScanFinished => {
            if registry.set_scan_state(ScanState::Idle) {
                info!("Discovery finished");
                Outcome::Applied
            } else {
                Outcome::Ignored
            }
        },
        AdapterEvent::BondStateChanged { id, state } => {
            let Some(id) = normalize_id(&id, "BondStateChanged") else { return Outcome::Dropped };

            debug!("Bond state of {} is now {:?}", id, state);
            registry.set_bond_state(id, state);
            Outcome::Applied
        },
        AdapterEvent::ConnectionStateChanged { id, connected } => {
            let Some(id) = normalize_id(&id, "ConnectionStateChanged") else { return Outcome::Dropped };

            if registry.get(&id).is_none() && !connected {
                return Outcome::Ignored;
            }

            let was_connected = registry.get(&id).map(|record| record.connection_state) == Some(ConnectionState::Connected);

            if registry.set_connection_state(&id, ConnectionState::from_connected(connected)) {
                debug!("Connection state of {} is now {}", id, if connected { "connected" } else { "disconnected" });
                if connected && !was_connected {
                    let others = connected_alongside(registry, &id);
                    if !others.is_empty() {
                        warn!("{} connected while {:?} also report being connected", id, others);
                    }
                }
                Outcome::Applied
            } else {
                warn!("Dropping connection event for {}: device is unknown or not bonded", id);
                Outcome::Dropped
            }
        },
    }
}

fn connected_alongside(registry: &Registry, id: &DeviceId) -> Vec<DeviceId> {
    registry.connected_ids().into_iter().filter(|other| other != id).collect()
}

pub fn reconcile_task(cancel: CancellationToken, mut events: Receiver<AdapterEvent>, shared: Arc<SharedRegistry>) -> JoinHandle<()> {
    spawn(async move {
        'mainloop: loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                event = events.next() => match event {
                    Some(event) => {
                        shared.update(|registry| apply_event(registry, event, SystemTime::now()));
                    },
                    None => {
                        debug!("Adapter event channel closed");
                        break 'mainloop;
                    },
                },
            }
        }

        events.close();
    })
}
