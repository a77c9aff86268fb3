use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter as PlatformAdapter, Manager, Peripheral, PeripheralId};
use futures::{SinkExt, Stream, StreamExt};
use log::{debug, info, warn};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::device::adapter::{Adapter, EventSink, SubscriptionHandle};
use crate::device::types::{AdapterEvent, DeviceHandle};
use crate::error::DeviceError;

struct Subscription {
    sink: EventSink,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

// btleplug has no notion of bonding, so the peripherals the platform already knows about before
// a scan starts are reported as the bonded set.
pub struct BtleAdapter {
    // the manager owns the platform session on some backends, keep it alive with the adapter
    _manager: Manager,
    central: Option<PlatformAdapter>,
    subscriptions: Arc<Mutex<HashMap<SubscriptionHandle, Subscription>>>,
    next_subscription: AtomicU64,
}

// CoreBluetooth hides hardware addresses and reports all zeros, fall back to the platform id
fn address_of(peripheral: &Peripheral) -> String {
    let address = peripheral.address().to_string();

    if address == "00:00:00:00:00:00" {
        format!("{:?}", peripheral.id())
    } else {
        address
    }
}

async fn translate_event(central: &PlatformAdapter, event: CentralEvent) -> Option<AdapterEvent> {
    let (id, connected) = match event {
        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => (id, None),
        CentralEvent::DeviceConnected(id) => (id, Some(true)),
        CentralEvent::DeviceDisconnected(id) => (id, Some(false)),
        _ => return None,
    };

    let peripheral = lookup_peripheral(central, &id).await?;
    let address = address_of(&peripheral);

    match connected {
        Some(connected) => Some(AdapterEvent::ConnectionStateChanged { id: address, connected }),
        None => {
            let name = match peripheral.properties().await {
                Ok(Some(properties)) => properties.local_name,
                Ok(None) => None,
                Err(err) => {
                    warn!("Could not query peripheral for properties: {:?}", err);
                    None
                },
            };

            Some(AdapterEvent::DeviceFound { id: address, name })
        },
    }
}

async fn lookup_peripheral(central: &PlatformAdapter, id: &PeripheralId) -> Option<Peripheral> {
    match central.peripheral(id).await {
        Ok(peripheral) => Some(peripheral),
        Err(err) => {
            warn!("Event for peripheral {:?} that could not be looked up: {}", id, err);
            None
        },
    }
}

type CentralEvents = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

fn forward_events_task(cancel: CancellationToken, central: PlatformAdapter, mut event_stream: CentralEvents, mut sink: EventSink) -> JoinHandle<()> {
    spawn(async move {
        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                event = event_stream.next() => {
                    let Some(event) = event else {
                        info!("Adapter event stream has ended");
                        break 'mainloop;
                    };

                    debug!("Central event: {:?}", event);
                    if let Some(event) = translate_event(&central, event).await {
                        if sink.send(event).await.is_err() {
                            debug!("Subscriber went away");
                            break 'mainloop;
                        }
                    }
                },
            }
        }
    })
}

impl BtleAdapter {
    pub async fn new() -> Result<Self, DeviceError> {
        let manager = Manager::new().await?;
        let central = manager.adapters().await?.into_iter().next();

        match &central {
            Some(central) => info!("Using adapter {}", central.adapter_info().await.unwrap_or("UNKNOWN".to_string())),
            None => warn!("No bluetooth adapter found"),
        }

        Ok(BtleAdapter {
            _manager: manager,
            central,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            next_subscription: AtomicU64::new(0),
        })
    }

    fn central(&self) -> Result<&PlatformAdapter, DeviceError> {
        self.central.as_ref().ok_or(DeviceError::NoAdapter)
    }

    async fn find_peripheral(&self, address: &str) -> Result<Option<Peripheral>, DeviceError> {
        let peripherals = self.central()?.peripherals().await?;

        Ok(peripherals.into_iter().find(|peripheral| address_of(peripheral).eq_ignore_ascii_case(address)))
    }

    fn broadcast(&self, event: AdapterEvent) {
        let sinks: Vec<EventSink> = {
            let subscriptions = self.subscriptions.lock().expect("Failed to lock subscriptions");
            subscriptions.values().map(|subscription| subscription.sink.clone()).collect()
        };

        for mut sink in sinks {
            if let Err(err) = sink.try_send(event.clone()) {
                warn!("Failed to deliver {:?}: {}", event, err);
            }
        }
    }
}

#[async_trait]
impl Adapter for BtleAdapter {
    async fn is_available(&self) -> bool {
        self.central.is_some()
    }

    async fn is_enabled(&self) -> bool {
        let Ok(central) = self.central() else { return false };

        match central.adapter_info().await {
            Ok(_) => true,
            Err(err) => {
                warn!("Adapter did not respond: {}", err);
                false
            },
        }
    }

    async fn bonded_devices(&self) -> Result<Vec<DeviceHandle>, DeviceError> {
        let mut devices = Vec::new();

        // btleplug can not tell bonded peripherals apart from merely cached ones (BlueZ keeps
        // every device it has seen), so everything the platform knows counts as bonded
        for peripheral in self.central()?.peripherals().await? {
            let name = match peripheral.properties().await {
                Ok(properties) => properties.and_then(|properties| properties.local_name),
                Err(err) => {
                    warn!("Could not query peripheral for properties: {:?}", err);
                    None
                },
            };

            devices.push(DeviceHandle { address: address_of(&peripheral), name });
        }

        Ok(devices)
    }

    async fn is_device_connected(&self, device: &DeviceHandle) -> Result<bool, DeviceError> {
        match self.find_peripheral(&device.address).await? {
            Some(peripheral) => Ok(peripheral.is_connected().await?),
            None => Ok(false),
        }
    }

    async fn subscribe(&self, sink: EventSink) -> Result<SubscriptionHandle, DeviceError> {
        let central = self.central()?.clone();
        // opened here so a scan started right after subscribing can not outrun the stream
        let event_stream = central.events().await?;
        let handle = SubscriptionHandle(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let cancel = CancellationToken::new();
        let task = forward_events_task(cancel.clone(), central, event_stream, sink.clone());

        self.subscriptions.lock().expect("Failed to lock subscriptions")
            .insert(handle, Subscription { sink, cancel, task });

        debug!("Subscribed {:?}", handle);
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        let subscription = self.subscriptions.lock().expect("Failed to lock subscriptions").remove(&handle);

        if let Some(subscription) = subscription {
            subscription.cancel.cancel();
            if let Err(err) = subscription.task.await {
                warn!("Event forwarding task for {:?} ended abnormally: {}", handle, err);
            }
            debug!("Unsubscribed {:?}", handle);
        }
    }

    async fn start_scan(&self) -> Result<(), DeviceError> {
        let central = self.central()?;
        info!("Scanning using adapter {}...", central.adapter_info().await.unwrap_or("UNKNOWN".to_string()));
        central.start_scan(ScanFilter::default()).await?;

        self.broadcast(AdapterEvent::ScanStarted);
        Ok(())
    }

    async fn cancel_scan(&self) -> Result<(), DeviceError> {
        self.central()?.stop_scan().await?;

        self.broadcast(AdapterEvent::ScanFinished);
        Ok(())
    }
}

impl Drop for BtleAdapter {
    fn drop(&mut self) {
        if let Ok(subscriptions) = self.subscriptions.lock() {
            for subscription in subscriptions.values() {
                subscription.cancel.cancel();
            }
        }
    }
}
