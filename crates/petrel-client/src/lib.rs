// Client library: subscription bookkeeping per worker, publishes to the
// pilot, and snapshot save/restore. All network work happens on the client's
// worker loops; the public API only validates and enqueues.
use std::sync::Arc;

use bytes::Bytes;
use petrel_common::{
    MsgId, NamespaceId, SequenceNumber, Status, SubscriptionHandle, TenantId, Topic,
};
use petrel_wire::GapType;

mod client;
mod config;
mod id_allocator;
mod publisher;
mod subscriptions_map;
mod worker;

pub use client::Client;
pub use config::ClientConfig;
pub use subscriptions_map::{
    MapCallbacks, SubscriptionData, SubscriptionEntry, SubscriptionsMap,
};

/// Message received on a subscription.
#[derive(Debug, Clone)]
pub struct MessageReceived {
    /// Handle of the subscription this arrived on; feed it back to
    /// `acknowledge`.
    pub handle: SubscriptionHandle,
    pub namespace: NamespaceId,
    pub topic: Topic,
    pub seqno: SequenceNumber,
    pub contents: Bytes,
}

/// Status notification for a subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionStatusEvent {
    pub handle: SubscriptionHandle,
    pub tenant: TenantId,
    pub namespace: NamespaceId,
    pub topic: Topic,
    pub seqno: SequenceNumber,
    pub status: Status,
}

/// Information about sequence numbers that will never be delivered.
#[derive(Debug, Clone)]
pub struct DataLossInfo {
    pub handle: SubscriptionHandle,
    pub kind: GapType,
    /// First lost sequence number, inclusive.
    pub first_seqno: SequenceNumber,
    /// Last lost sequence number, inclusive.
    pub last_seqno: SequenceNumber,
}

/// Outcome of a publish acknowledgement.
#[derive(Debug, Clone)]
pub struct ResultStatus {
    pub status: Status,
    pub msg_id: MsgId,
    pub seqno: SequenceNumber,
    pub namespace: NamespaceId,
    pub topic: Topic,
    pub contents: Bytes,
}

/// Immediate outcome of a publish call; the callback carries the rest.
#[derive(Debug, Clone)]
pub struct PublishStatus {
    pub status: Status,
    pub msg_id: MsgId,
}

/// Per-message publish options. Placeholder for compression and checksum
/// hints; currently empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOptions;

pub type PublishCallback = Box<dyn FnOnce(ResultStatus) + Send>;
pub type SaveCallback = Box<dyn FnOnce(Status) + Send>;
pub type TailCallback = Box<dyn FnOnce(Status, SequenceNumber) + Send>;

/// Process-wide observers installed at start.
#[derive(Clone)]
pub struct ClientObservers {
    pub on_data: Arc<dyn Fn(MessageReceived) + Send + Sync>,
    pub on_status: Arc<dyn Fn(SubscriptionStatusEvent) + Send + Sync>,
    pub on_data_loss: Arc<dyn Fn(DataLossInfo) + Send + Sync>,
}

impl ClientObservers {
    pub fn new(
        on_data: impl Fn(MessageReceived) + Send + Sync + 'static,
        on_status: impl Fn(SubscriptionStatusEvent) + Send + Sync + 'static,
    ) -> Self {
        ClientObservers {
            on_data: Arc::new(on_data),
            on_status: Arc::new(on_status),
            on_data_loss: Arc::new(|info: DataLossInfo| {
                tracing::warn!(
                    handle = info.handle,
                    kind = ?info.kind,
                    first = info.first_seqno,
                    last = info.last_seqno,
                    "data loss on subscription"
                );
            }),
        }
    }

    pub fn with_data_loss(
        mut self,
        on_data_loss: impl Fn(DataLossInfo) + Send + Sync + 'static,
    ) -> Self {
        self.on_data_loss = Arc::new(on_data_loss);
        self
    }
}

/// Optional per-subscription overrides of the process-wide observers.
#[derive(Clone, Default)]
pub struct SubscriptionObserver {
    pub on_data: Option<Arc<dyn Fn(MessageReceived) + Send + Sync>>,
    pub on_status: Option<Arc<dyn Fn(SubscriptionStatusEvent) + Send + Sync>>,
}
