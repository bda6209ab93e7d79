//! Cluster membership and routing: the consistent-hash ring, gossip-backed
//! membership service, the coordinator that glues ring + membership + local
//! stores together, and the replication handler that applies inbound
//! mutation events.

pub mod coordinator;
pub mod gossip;
pub mod member;
pub mod replication;
pub mod ring;

pub use coordinator::Coordinator;
pub use gossip::{
    DataMutation, GossipEvent, GossipTransport, InMemoryTransport, MembershipService, MutationOp,
    UdpGossipTransport,
};
pub use member::{ClusterMember, MemberStatus};
pub use replication::ReplicationHandler;
pub use ring::{DistributionStats, HashRing, DEFAULT_VIRTUAL_NODES};
