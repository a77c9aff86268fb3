use async_trait::async_trait;
use futures::channel::mpsc::Sender;

use crate::device::types::{AdapterEvent, DeviceHandle};
use crate::error::DeviceError;

pub type EventSink = Sender<AdapterEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

/// The platform radio stack. It performs hardware scanning and bonding; the tracker only
/// consumes what it reports.
#[async_trait]
pub trait Adapter: Send + Sync {
    async fn is_available(&self) -> bool;

    async fn is_enabled(&self) -> bool;

    async fn bonded_devices(&self) -> Result<Vec<DeviceHandle>, DeviceError>;

    async fn is_device_connected(&self, device: &DeviceHandle) -> Result<bool, DeviceError>;

    async fn subscribe(&self, sink: EventSink) -> Result<SubscriptionHandle, DeviceError>;

    // Stop delivering events for `handle`. Unknown handles are ignored.
    async fn unsubscribe(&self, handle: SubscriptionHandle);

    async fn start_scan(&self) -> Result<(), DeviceError>;

    async fn cancel_scan(&self) -> Result<(), DeviceError>;
}
