use serde::{Deserialize, Serialize};
use crate::types::ServiceInstance;

/// mDNS service type each sidecar advertises for peer discovery
pub const SIDECAR_SERVICE_TYPE: &str = "_sidecar._udp.local.";

/// TXT record keys used in sidecar self-advertisement
pub const TXT_CLUSTER: &str = "cluster";
pub const TXT_GOSSIP_PORT: &str = "gossip";

/// API path prefix
pub const API_PREFIX: &str = "/v1";

/// Upper bound on records carried by a single gossip datagram
pub const MAX_RECORDS_PER_MESSAGE: usize = 64;

/// Upper bound on the encoded size of a single gossip datagram, kept well
/// below the 65507-byte UDP payload limit
pub const MAX_MESSAGE_BYTES: usize = 48 * 1024;

/// Envelope for every gossip datagram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipMessage {
    /// Cluster the sender belongs to; messages for other clusters are dropped
    pub cluster: String,

    /// Hostname of the sending node
    pub from: String,

    /// Set on a push/pull exchange: the receiver answers with its full catalog
    #[serde(default)]
    pub push_pull: bool,

    pub records: Vec<ServiceInstance>,
}
