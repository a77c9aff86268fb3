use std::future::Future;
use std::sync::Arc;
use futures::SinkExt;
use futures::channel::mpsc::channel;
use log::{debug, info, warn};
use tokio::runtime::Handle;
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::device::adapter::{Adapter, EventSink, SubscriptionHandle};
use crate::device::constants::{EVENT_BUFFER_SIZE, IS_CONNECTED_DEADLINE, MIN_POLL_INTERVAL};
use crate::device::query::{DeviceQuery, SharedRegistry};
use crate::device::reconciler::reconcile_task;
use crate::device::registry::Registry;
use crate::device::types::{AdapterEvent, DeviceHandle, DeviceId, DeviceRecord, ScanState};
use crate::error::DiscoveryError;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub connection_poll_interval: Option<Duration>,
    pub event_buffer_size: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            connection_poll_interval: None,
            event_buffer_size: EVENT_BUFFER_SIZE,
        }
    }
}

struct ActiveSession {
    subscription: SubscriptionHandle,
    cancel: CancellationToken,
    // internal path into the reconciler, used for connection re-polls
    sink: EventSink,
    reconciler: JoinHandle<()>,
    poller: Option<JoinHandle<()>>,
}

pub struct DiscoveryController {
    adapter: Arc<dyn Adapter>,
    shared: Arc<SharedRegistry>,
    options: SessionOptions,
    session: Option<ActiveSession>,
}

async fn check_connected(adapter: &dyn Adapter, device: &DeviceHandle) -> bool {
    tokio::select! {
        _ = sleep(Duration::from_millis(IS_CONNECTED_DEADLINE)) => {
            warn!("Checking connection state of {} took too long", device.address);
            false
        }
        result = adapter.is_device_connected(device) => match result {
            Ok(connected) => connected,
            Err(err) => {
                warn!("Error checking connection state of {}: {}", device.address, err);
                false
            },
        }
    }
}

async fn seed_registry(adapter: &dyn Adapter) -> Result<Registry, DiscoveryError> {
    let mut registry = Registry::new();

    for device in adapter.bonded_devices().await? {
        let id = match DeviceId::parse(&device.address) {
            Ok(id) => id,
            Err(err) => {
                warn!("Skipping bonded device with malformed address: {}", err);
                continue;
            },
        };

        let connected = check_connected(adapter, &device).await;
        debug!("Bonded device {} ({})", id, if connected { "connected" } else { "not connected" });
        registry.seed_bonded(id, device.name, connected);
    }

    Ok(registry)
}

async fn poll_connections(adapter: &dyn Adapter, shared: &SharedRegistry, sink: &mut EventSink) -> usize {
    let bonded = shared.read(|registry| registry.bonded_ids());
    let mut polled = 0;

    for id in bonded {
        let connected = check_connected(adapter, &DeviceHandle::new(id.as_str(), None)).await;
        let event = AdapterEvent::ConnectionStateChanged { id: id.to_string(), connected };

        if sink.send(event).await.is_err() {
            debug!("Reconciler is gone, stopping connection poll");
            break;
        }
        polled += 1;
    }

    polled
}

fn poll_task(cancel: CancellationToken, adapter: Arc<dyn Adapter>, shared: Arc<SharedRegistry>, mut sink: EventSink, interval: Duration) -> JoinHandle<()> {
    spawn(async move {
        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                _ = sleep(interval) => {
                    // a slow adapter must not hold up stop()
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            break 'mainloop;
                        },
                        _ = poll_connections(adapter.as_ref(), &shared, &mut sink) => {},
                    }
                },
            }
        }
    })
}

impl DiscoveryController {
    pub fn new(adapter: Arc<dyn Adapter>) -> Self {
        DiscoveryController::with_options(adapter, SessionOptions::default())
    }

    pub fn with_options(adapter: Arc<dyn Adapter>, options: SessionOptions) -> Self {
        DiscoveryController {
            adapter,
            shared: Arc::new(SharedRegistry::new()),
            options,
            session: None,
        }
    }

    pub fn query(&self) -> DeviceQuery {
        DeviceQuery::new(self.shared.clone())
    }

    pub fn is_scanning(&self) -> bool {
        self.session.is_some()
    }

    pub async fn start(&mut self) -> Result<(), DiscoveryError> {
        if self.session.is_some() {
            return Err(DiscoveryError::AlreadyScanning);
        }

        if !self.adapter.is_available().await {
            return Err(DiscoveryError::AdapterUnavailable);
        }

        if !self.adapter.is_enabled().await {
            return Err(DiscoveryError::AdapterDisabled);
        }

        let registry = seed_registry(self.adapter.as_ref()).await?;
        info!("Seeded registry with {} bonded device(s)", registry.len());
        self.shared.replace(registry);

        let (sink, events) = channel::<AdapterEvent>(self.options.event_buffer_size.max(1));
        let cancel = CancellationToken::new();
        let reconciler = reconcile_task(cancel.clone(), events, self.shared.clone());

        let subscription = match self.adapter.subscribe(sink.clone()).await {
            Ok(subscription) => subscription,
            Err(err) => {
                warn!("Subscribing to adapter events failed: {}", err);
                cancel.cancel();
                let _ = reconciler.await;
                return Err(err.into());
            },
        };

        if let Err(err) = self.adapter.start_scan().await {
            warn!("Starting scan failed: {}", err);
            self.adapter.unsubscribe(subscription).await;
            cancel.cancel();
            let _ = reconciler.await;
            return Err(err.into());
        }

        let poller = self.options.connection_poll_interval.map(|interval| {
            let interval = interval.max(Duration::from_millis(MIN_POLL_INTERVAL));
            poll_task(cancel.clone(), self.adapter.clone(), self.shared.clone(), sink.clone(), interval)
        });

        self.session = Some(ActiveSession { subscription, cancel, sink, reconciler, poller });
        info!("Discovery session started");
        Ok(())
    }

    // End the session. Once this returns no further adapter event reaches the registry.
    pub async fn stop(&mut self) {
        let Some(session) = self.session.take() else {
            debug!("Stop requested while idle");
            return;
        };

        self.adapter.unsubscribe(session.subscription).await;
        session.cancel.cancel();

        if let Err(err) = session.reconciler.await {
            warn!("Reconciler task ended abnormally: {}", err);
        }
        if let Some(poller) = session.poller {
            if let Err(err) = poller.await {
                warn!("Connection poll task ended abnormally: {}", err);
            }
        }

        if let Err(err) = self.adapter.cancel_scan().await {
            warn!("Cancelling scan failed: {}", err);
        }

        // the ScanFinished event, if any, arrives after we unsubscribed
        self.shared.update(|registry| registry.set_scan_state(ScanState::Idle));
        info!("Discovery session stopped");
    }

    pub async fn run_session<F, Fut, T>(&mut self, body: F) -> Result<T, DiscoveryError>
    where
        F: FnOnce(DeviceQuery) -> Fut,
        Fut: Future<Output = T>,
    {
        self.start().await?;
        let result = body(self.query()).await;
        self.stop().await;
        Ok(result)
    }

    pub async fn refresh_connections(&self) -> usize {
        let Some(session) = &self.session else {
            return 0;
        };

        let mut sink = session.sink.clone();
        poll_connections(self.adapter.as_ref(), &self.shared, &mut sink).await
    }

    pub fn view_details(&self, id: &DeviceId) -> Result<DeviceRecord, DiscoveryError> {
        self.query().device(id).ok_or_else(|| DiscoveryError::UnknownDevice { id: id.clone() })
    }

    pub fn connect(&self, id: &DeviceId) -> Result<(), DiscoveryError> {
        let record = self.view_details(id)?;
        info!("Connect requested for {} ({}); connection management is handled outside the tracker", record.id, record.label());
        Ok(())
    }
}

impl Drop for DiscoveryController {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        session.cancel.cancel();
        let subscription = session.subscription;
        warn!("Discovery controller dropped while scanning, releasing adapter");

        match Handle::try_current() {
            Ok(handle) => {
                let adapter = self.adapter.clone();
                handle.spawn(async move {
                    adapter.unsubscribe(subscription).await;
                    if let Err(err) = adapter.cancel_scan().await {
                        warn!("Cancelling scan failed: {}", err);
                    }
                });
            },
            Err(_) => warn!("No async runtime available; adapter subscription could not be released"),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::device::simulated::{AdapterFailure, SimulatedAdapter};
    use crate::device::types::BondState;
    use super::*;

    fn id(raw: &str) -> DeviceId {
        DeviceId::parse(raw).unwrap()
    }

    async fn wait_for(query: &DeviceQuery, predicate: impl Fn(&DeviceQuery) -> bool) {
        let mut changes = query.changes();
        while !predicate(query) {
            changes.changed().await.unwrap();
        }
    }

    #[tokio::test]
    async fn failed_scan_releases_subscription() {
        let adapter = SimulatedAdapter::new();
        adapter.fail_scan_with(Some(AdapterFailure::PermissionDenied));
        let mut controller = DiscoveryController::new(Arc::new(adapter.clone()));

        let result = controller.start().await;
        assert!(matches!(result, Err(DiscoveryError::PermissionDenied)));
        assert_eq!(adapter.subscriber_count(), 0);
        assert!(!controller.is_scanning());

        adapter.fail_scan_with(Some(AdapterFailure::Rejected("busy".to_string())));
        assert!(matches!(controller.start().await, Err(DiscoveryError::Adapter { .. })));
        assert_eq!(adapter.subscriber_count(), 0);

        adapter.fail_scan_with(None);
        controller.start().await.unwrap();
        assert_eq!(adapter.subscriber_count(), 1);
        controller.stop().await;
    }

    #[tokio::test]
    async fn failed_subscribe_is_reported_and_never_scans() {
        let adapter = SimulatedAdapter::new();
        adapter.add_bonded("aa:01", Some("Headset"), true);
        adapter.fail_subscribe_with(Some(AdapterFailure::Rejected("event stream unavailable".to_string())));
        let mut controller = DiscoveryController::new(Arc::new(adapter.clone()));

        assert!(matches!(controller.start().await, Err(DiscoveryError::Adapter { .. })));
        assert!(!controller.is_scanning());
        assert_eq!(adapter.scan_starts(), 0);
        assert_eq!(adapter.subscriber_count(), 0);

        adapter.fail_subscribe_with(Some(AdapterFailure::PermissionDenied));
        assert!(matches!(controller.start().await, Err(DiscoveryError::PermissionDenied)));
        assert!(!adapter.is_scanning());
    }

    #[tokio::test]
    async fn unavailable_adapter_is_rejected_before_anything_else() {
        let adapter = SimulatedAdapter::new();
        adapter.set_available(false);
        let mut controller = DiscoveryController::new(Arc::new(adapter.clone()));

        assert!(matches!(controller.start().await, Err(DiscoveryError::AdapterUnavailable)));
        assert_eq!(adapter.subscriber_count(), 0);
        assert_eq!(adapter.scan_starts(), 0);
    }

    #[tokio::test]
    async fn refresh_picks_up_connection_changes_without_events() {
        let adapter = SimulatedAdapter::new();
        adapter.add_bonded("aa:01", Some("Headset"), false);
        let mut controller = DiscoveryController::new(Arc::new(adapter.clone()));
        let query = controller.query();

        assert_eq!(controller.refresh_connections().await, 0);
        controller.start().await.unwrap();
        assert_eq!(query.snapshot().previously_connected, vec![id("AA:01")]);

        adapter.set_connected("aa:01", true);
        assert_eq!(controller.refresh_connections().await, 1);
        wait_for(&query, |query| query.snapshot().connected_device.is_some()).await;
        assert_eq!(query.snapshot().connected_device, Some(id("aa:01")));

        controller.stop().await;
    }

    #[tokio::test]
    async fn periodic_poll_updates_connection_state() {
        let adapter = SimulatedAdapter::new();
        adapter.add_bonded("bb:02", None, true);
        let options = SessionOptions {
            connection_poll_interval: Some(Duration::from_millis(MIN_POLL_INTERVAL)),
            ..SessionOptions::default()
        };
        let mut controller = DiscoveryController::with_options(Arc::new(adapter.clone()), options);
        let query = controller.query();

        controller.start().await.unwrap();
        assert_eq!(query.snapshot().connected_device, Some(id("bb:02")));

        adapter.set_connected("bb:02", false);
        wait_for(&query, |query| query.snapshot().connected_device.is_none()).await;
        assert_eq!(query.snapshot().previously_connected, vec![id("bb:02")]);

        controller.stop().await;
    }

    #[tokio::test]
    async fn stop_does_not_wait_for_a_slow_connection_poll() {
        let adapter = SimulatedAdapter::new();
        adapter.add_bonded("bb:02", None, true);
        let options = SessionOptions {
            connection_poll_interval: Some(Duration::from_millis(MIN_POLL_INTERVAL)),
            ..SessionOptions::default()
        };
        let mut controller = DiscoveryController::with_options(Arc::new(adapter.clone()), options);
        controller.start().await.unwrap();

        adapter.set_connection_check_delay(Some(Duration::from_secs(60)));
        sleep(Duration::from_millis(MIN_POLL_INTERVAL + 50)).await;

        let started = std::time::Instant::now();
        controller.stop().await;
        assert!(started.elapsed() < Duration::from_millis(IS_CONNECTED_DEADLINE / 4));
        assert_eq!(adapter.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn commands_need_a_known_device() {
        let adapter = SimulatedAdapter::new();
        adapter.add_bonded("cc:03", Some("Watch"), false);
        let mut controller = DiscoveryController::new(Arc::new(adapter.clone()));
        controller.start().await.unwrap();

        assert_eq!(controller.view_details(&id("cc:03")).unwrap().label(), "Watch");
        assert!(controller.connect(&id("cc:03")).is_ok());
        assert!(matches!(controller.connect(&id("dd:04")), Err(DiscoveryError::UnknownDevice { .. })));

        controller.stop().await;
    }

    #[tokio::test]
    async fn run_session_always_stops() {
        let adapter = SimulatedAdapter::new();
        let mut controller = DiscoveryController::new(Arc::new(adapter.clone()));

        let seen = controller.run_session(|query| async move {
            adapter.emit_bond("ee:05", BondState::Bonding);
            wait_for(&query, |query| !query.snapshot().available.is_empty()).await;
            query.snapshot().available
        }).await.unwrap();

        assert_eq!(seen, vec![id("ee:05")]);
        assert!(!controller.is_scanning());
    }

    #[tokio::test]
    async fn dropping_an_active_controller_releases_the_adapter() {
        let adapter = SimulatedAdapter::new();
        let mut controller = DiscoveryController::new(Arc::new(adapter.clone()));
        controller.start().await.unwrap();
        assert!(adapter.is_scanning());

        drop(controller);

        for _ in 0..100 {
            if !adapter.is_scanning() && adapter.subscriber_count() == 0 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(!adapter.is_scanning());
        assert_eq!(adapter.subscriber_count(), 0);
    }
}
