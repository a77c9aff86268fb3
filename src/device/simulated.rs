use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::device::adapter::{Adapter, EventSink, SubscriptionHandle};
use crate::device::types::{AdapterEvent, BondState, DeviceHandle};
use crate::error::DeviceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterFailure {
    PermissionDenied,
    Rejected(String),
}

impl AdapterFailure {
    fn to_error(&self) -> DeviceError {
        match self {
            AdapterFailure::PermissionDenied => DeviceError::PermissionDenied,
            AdapterFailure::Rejected(reason) => DeviceError::Rejected { reason: reason.clone() },
        }
    }
}

#[derive(Default)]
struct SimulatedState {
    available: bool,
    enabled: bool,
    bonded: Vec<DeviceHandle>,
    // keyed by upper-cased address
    connected: HashMap<String, bool>,
    subscribers: HashMap<SubscriptionHandle, EventSink>,
    next_subscription: u64,
    scanning: bool,
    scan_starts: usize,
    scan_failure: Option<AdapterFailure>,
    subscribe_failure: Option<AdapterFailure>,
    connection_check_delay: Option<Duration>,
}

/// In-memory adapter. Everything the platform would report is set by hand, and events can be
/// injected from any thread the way a platform callback would deliver them.
#[derive(Clone)]
pub struct SimulatedAdapter {
    inner: Arc<Mutex<SimulatedState>>,
}

impl SimulatedAdapter {
    pub fn new() -> Self {
        let state = SimulatedState {
            available: true,
            enabled: true,
            ..SimulatedState::default()
        };

        SimulatedAdapter { inner: Arc::new(Mutex::new(state)) }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SimulatedState> {
        self.inner.lock().expect("Failed to lock SimulatedAdapter state")
    }

    pub fn set_available(&self, available: bool) {
        self.state().available = available;
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state().enabled = enabled;
    }

    pub fn add_bonded(&self, address: &str, name: Option<&str>, connected: bool) {
        let mut state = self.state();
        state.bonded.push(DeviceHandle::new(address, name));
        state.connected.insert(address.to_ascii_uppercase(), connected);
    }

    pub fn set_connected(&self, address: &str, connected: bool) {
        self.state().connected.insert(address.to_ascii_uppercase(), connected);
    }

    // makes is_device_connected hang for this long before answering
    pub fn set_connection_check_delay(&self, delay: Option<Duration>) {
        self.state().connection_check_delay = delay;
    }

    pub fn fail_subscribe_with(&self, failure: Option<AdapterFailure>) {
        self.state().subscribe_failure = failure;
    }

    pub fn fail_scan_with(&self, failure: Option<AdapterFailure>) {
        self.state().scan_failure = failure;
    }

    pub fn is_scanning(&self) -> bool {
        self.state().scanning
    }

    pub fn scan_starts(&self) -> usize {
        self.state().scan_starts
    }

    pub fn subscriber_count(&self) -> usize {
        self.state().subscribers.len()
    }

    // Deliver `event` to every subscriber. Returns how many subscribers accepted it.
    pub fn emit(&self, event: AdapterEvent) -> usize {
        let mut state = self.state();
        let mut delivered = 0;

        for (handle, sink) in state.subscribers.iter_mut() {
            match sink.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => warn!("Subscriber {:?} did not accept event: {}", handle, err),
            }
        }

        delivered
    }

    pub fn emit_found(&self, address: &str, name: &str) -> usize {
        self.emit(AdapterEvent::DeviceFound {
            id: address.to_string(),
            name: Some(name.to_string()),
        })
    }

    pub fn emit_bond(&self, address: &str, state: BondState) -> usize {
        self.emit(AdapterEvent::BondStateChanged { id: address.to_string(), state })
    }

    pub fn emit_connection(&self, address: &str, connected: bool) -> usize {
        self.set_connected(address, connected);
        self.emit(AdapterEvent::ConnectionStateChanged { id: address.to_string(), connected })
    }

    pub fn demo() -> Self {
        let adapter = SimulatedAdapter::new();
        adapter.add_bonded("00:1B:66:0A:11:01", Some("Headphones"), true);
        adapter.add_bonded("00:1B:66:0A:11:02", Some("Car Kit"), false);
        adapter
    }

    pub fn replay(&self, cancel: CancellationToken, script: Vec<(Duration, AdapterEvent)>) -> JoinHandle<()> {
        let adapter = self.clone();

        spawn(async move {
            for (delay, event) in script {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Replay cancelled");
                        return;
                    },
                    _ = sleep(delay) => {
                        adapter.emit(event);
                    },
                }
            }
        })
    }

    pub fn demo_script() -> Vec<(Duration, AdapterEvent)> {
        let found = |id: &str, name: Option<&str>| AdapterEvent::DeviceFound {
            id: id.to_string(),
            name: name.map(String::from),
        };

        vec![
            (Duration::from_millis(300), found("5C:F3:70:21:9A:10", None)),
            (Duration::from_millis(300), found("5C:F3:70:21:9A:10", Some("Speaker"))),
            (Duration::from_millis(500), found("00:1b:66:0a:11:02", Some("Car Kit"))),
            (Duration::from_millis(400), found("D4:81:D7:3C:02:7E", Some("Fitness Band"))),
            (Duration::from_millis(600), AdapterEvent::BondStateChanged {
                id: "5C:F3:70:21:9A:10".to_string(),
                state: BondState::Bonding,
            }),
            (Duration::from_millis(600), AdapterEvent::BondStateChanged {
                id: "5C:F3:70:21:9A:10".to_string(),
                state: BondState::Bonded,
            }),
            (Duration::from_millis(200), AdapterEvent::ConnectionStateChanged {
                id: "5C:F3:70:21:9A:10".to_string(),
                connected: true,
            }),
            (Duration::from_millis(100), AdapterEvent::ConnectionStateChanged {
                id: "00:1B:66:0A:11:01".to_string(),
                connected: false,
            }),
        ]
    }
}

impl Default for SimulatedAdapter {
    fn default() -> Self {
        SimulatedAdapter::new()
    }
}

#[async_trait]
impl Adapter for SimulatedAdapter {
    async fn is_available(&self) -> bool {
        self.state().available
    }

    async fn is_enabled(&self) -> bool {
        self.state().enabled
    }

    async fn bonded_devices(&self) -> Result<Vec<DeviceHandle>, DeviceError> {
        Ok(self.state().bonded.clone())
    }

    async fn is_device_connected(&self, device: &DeviceHandle) -> Result<bool, DeviceError> {
        let delay = self.state().connection_check_delay;
        if let Some(delay) = delay {
            sleep(delay).await;
        }

        Ok(self.state().connected.get(&device.address.to_ascii_uppercase()).copied().unwrap_or(false))
    }

    async fn subscribe(&self, sink: EventSink) -> Result<SubscriptionHandle, DeviceError> {
        let mut state = self.state();
        if let Some(failure) = &state.subscribe_failure {
            return Err(failure.to_error());
        }
        let handle = SubscriptionHandle(state.next_subscription);
        state.next_subscription += 1;
        state.subscribers.insert(handle, sink);
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.state().subscribers.remove(&handle);
    }

    async fn start_scan(&self) -> Result<(), DeviceError> {
        {
            let mut state = self.state();
            if let Some(failure) = &state.scan_failure {
                return Err(failure.to_error());
            }
            state.scanning = true;
            state.scan_starts += 1;
        }

        info!("Simulated scan started");
        self.emit(AdapterEvent::ScanStarted);
        Ok(())
    }

    async fn cancel_scan(&self) -> Result<(), DeviceError> {
        let was_scanning = std::mem::replace(&mut self.state().scanning, false);

        if was_scanning {
            info!("Simulated scan cancelled");
            self.emit(AdapterEvent::ScanFinished);
        }
        Ok(())
    }
}
