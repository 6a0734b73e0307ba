//! Host integration
//!
//! The pipeline does not capture packets itself. It registers with a host,
//! subscribes a [`PacketProcessor`] to a [`PacketSource`], and asks the source
//! for the traffic it wants with a [`TrafficSelector`]. In-process
//! implementations live in [`local`].

pub mod local;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;
use crate::packet::{ethertype, DecodedPacket};

pub use local::{LocalHost, LocalPacketSource};

/// Identity the host assigns to a registered application
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ApplicationId {
    id: Uuid,
    name: String,
}

impl ApplicationId {
    /// Create an ID with a fresh random UUID
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
        }
    }

    /// Get the UUID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Get the registered name
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Handle of a processor added to a packet source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ProcessorId(pub u64);

/// Which packets an application asks the source for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TrafficSelector {
    /// Required ether type, `None` for every packet
    pub ether_type: Option<u16>,
}

impl TrafficSelector {
    /// Match every packet
    pub fn any() -> Self {
        Self { ether_type: None }
    }

    /// Match packets with the given ether type
    pub fn ether_type(ether_type: u16) -> Self {
        Self {
            ether_type: Some(ether_type),
        }
    }

    /// Match IPv4 packets
    pub fn ipv4() -> Self {
        Self::ether_type(ethertype::IPV4)
    }

    /// Check if `packet` matches
    pub fn matches(&self, packet: &DecodedPacket) -> bool {
        self.ether_type.map_or(true, |t| t == packet.ether_type)
    }
}

/// Receives every packet the source delivers
///
/// Called concurrently from the source's worker threads.
pub trait PacketProcessor: Send + Sync {
    fn process(&self, packet: &DecodedPacket);
}

/// Delivers packets to subscribed processors
pub trait PacketSource: Send + Sync {
    /// Subscribe `processor`; lower priorities run first
    fn add_processor(&self, processor: Arc<dyn PacketProcessor>, priority: u32) -> Result<ProcessorId>;

    /// Unsubscribe a processor; it sees no packets once this returns
    fn remove_processor(&self, id: ProcessorId) -> Result<()>;

    /// Ask for packets matching `selector` on behalf of `app`
    fn request_packets(&self, selector: TrafficSelector, app: &ApplicationId) -> Result<()>;

    /// Withdraw an earlier request
    fn cancel_packets(&self, selector: TrafficSelector, app: &ApplicationId) -> Result<()>;
}

/// Application registry of the host
pub trait HostServices: Send + Sync {
    fn register_application(&self, name: &str) -> Result<ApplicationId>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_selector_matching() {
        let ipv4 = DecodedPacket::other(ethertype::IPV4, Instant::now());
        let arp = DecodedPacket::other(ethertype::ARP, Instant::now());

        assert!(TrafficSelector::ipv4().matches(&ipv4));
        assert!(!TrafficSelector::ipv4().matches(&arp));
        assert!(TrafficSelector::any().matches(&arp));
    }

    #[test]
    fn test_application_id() {
        let a = ApplicationId::new("org.netcap.test");
        let b = ApplicationId::new("org.netcap.test");

        assert_eq!(a.name(), "org.netcap.test");
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("org.netcap.test ("));
    }
}
