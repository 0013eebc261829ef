// Shared data types and small helpers used across crates.
pub mod hash;
pub mod host;
pub mod logging;
pub mod status;

pub use host::HostId;
pub use status::{Status, StatusCode};

use serde::{Deserialize, Serialize};

/// Tenant identifier carried by every wire message.
///
/// Tenancy is advisory: it exists for quota accounting, not as an access
/// boundary. Ids at or below [`TenantId::MAX_RESERVED`] are reserved, with the
/// exception of the guest tenant used during development.
///
/// ```
/// use petrel_common::TenantId;
///
/// assert!(TenantId::GUEST.is_valid_for_publish());
/// assert!(!TenantId(50).is_valid_for_publish());
/// assert!(TenantId(101).is_valid_for_publish());
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct TenantId(pub u16);

impl TenantId {
    /// Catches callers that never set a tenant.
    pub const INVALID: TenantId = TenantId(0);
    /// Lightweight development tenant; not for production use.
    pub const GUEST: TenantId = TenantId(1);
    /// Internal system work keeping the deployment alive.
    pub const SYSTEM: TenantId = TenantId(2);
    /// Ids 2..=100 are reserved; applications get ids above this.
    pub const MAX_RESERVED: u16 = 100;

    pub fn is_valid_for_publish(self) -> bool {
        self == Self::GUEST || self.0 > Self::MAX_RESERVED
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Namespace of a topic. Names beginning with an underscore are reserved for
/// system usage.
pub type NamespaceId = String;

/// The invalid namespace; catches callers that never set one.
pub const INVALID_NAMESPACE: &str = "";
/// Namespace for lightweight development.
pub const GUEST_NAMESPACE: &str = "guest";
/// System namespace for transient metadata; entries may be purged.
pub const SYSTEM_NAMESPACE_TRANSIENT: &str = "_transient";
/// System namespace for permanent metadata.
pub const SYSTEM_NAMESPACE_PERMANENT: &str = "_permanent";

/// Tests whether a namespace is reserved for system usage.
pub fn is_reserved_namespace(ns: &str) -> bool {
    ns.starts_with('_')
}

/// Topic name; `(namespace, topic)` identifies a logical stream of records.
pub type Topic = String;

/// Per-topic monotonic sequence number. Zero means "from the next record".
pub type SequenceNumber = u64;

/// Opaque identifier returned to the application for a subscription. Not the
/// on-wire subscription id, which can change when a subscription is rewound.
pub type SubscriptionHandle = u64;

/// 16-byte globally unique message identifier. The all-zero value is the
/// "empty" sentinel.
///
/// ```
/// use petrel_common::MsgId;
///
/// assert!(MsgId::empty().is_empty());
/// assert!(!MsgId::generate().is_empty());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MsgId(pub [u8; 16]);

impl MsgId {
    pub fn empty() -> Self {
        MsgId([0u8; 16])
    }

    pub fn generate() -> Self {
        MsgId(*uuid::Uuid::new_v4().as_bytes())
    }

    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; 16]
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        MsgId(bytes)
    }
}

impl std::fmt::Debug for MsgId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl std::fmt::Display for MsgId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Parameters needed to create or restore a subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionParameters {
    pub tenant_id: TenantId,
    pub namespace_id: NamespaceId,
    pub topic_name: Topic,
    pub start_seqno: SequenceNumber,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_namespaces_start_with_underscore() {
        assert!(is_reserved_namespace(SYSTEM_NAMESPACE_TRANSIENT));
        assert!(is_reserved_namespace(SYSTEM_NAMESPACE_PERMANENT));
        assert!(!is_reserved_namespace(GUEST_NAMESPACE));
        assert!(!is_reserved_namespace("orders"));
    }

    #[test]
    fn tenant_publish_validation() {
        assert!(!TenantId::INVALID.is_valid_for_publish());
        assert!(TenantId::GUEST.is_valid_for_publish());
        assert!(!TenantId::SYSTEM.is_valid_for_publish());
        assert!(!TenantId(100).is_valid_for_publish());
        assert!(TenantId(101).is_valid_for_publish());
    }

    #[test]
    fn msg_id_empty_sentinel() {
        assert!(MsgId::empty().is_empty());
        let id = MsgId::generate();
        assert!(!id.is_empty());
        assert_ne!(id, MsgId::generate());
    }

    #[test]
    fn msg_id_formats_as_hex() {
        let id = MsgId::from_bytes([0xab; 16]);
        assert_eq!(format!("{id}"), "ab".repeat(16));
    }
}
