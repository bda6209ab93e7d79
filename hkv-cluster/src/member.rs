//! # Cluster Member
//!
//! Purpose: The identity and liveness record for one physical node, shared
//! by the hash ring (routing) and the membership service (gossip).

use std::fmt;

/// Liveness state of a member as tracked by gossip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberStatus {
    Alive,
    Suspect,
    Dead,
    Leaving,
    Updating,
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemberStatus::Alive => "alive",
            MemberStatus::Suspect => "suspect",
            MemberStatus::Dead => "dead",
            MemberStatus::Leaving => "leaving",
            MemberStatus::Updating => "updating",
        };
        f.write_str(s)
    }
}

/// One entry in the cluster's membership table.
///
/// `node_id` is the invariant the ring and membership table both key on:
/// exactly one member per node-id.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterMember {
    pub node_id: String,
    pub advertise_addr: String,
    pub gossip_port: u16,
    pub resp_port: u16,
    pub http_port: u16,
    pub status: MemberStatus,
    pub last_seen_unix_ms: u64,
}

impl ClusterMember {
    pub fn new(
        node_id: impl Into<String>,
        advertise_addr: impl Into<String>,
        gossip_port: u16,
        resp_port: u16,
        http_port: u16,
    ) -> Self {
        ClusterMember {
            node_id: node_id.into(),
            advertise_addr: advertise_addr.into(),
            gossip_port,
            resp_port,
            http_port,
            status: MemberStatus::Alive,
            last_seen_unix_ms: 0,
        }
    }

    pub fn resp_addr(&self) -> String {
        format!("{}:{}", self.advertise_addr, self.resp_port)
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.advertise_addr, self.http_port)
    }

    pub fn gossip_addr(&self) -> String {
        format!("{}:{}", self.advertise_addr, self.gossip_port)
    }

    pub fn is_routable(&self) -> bool {
        !matches!(self.status, MemberStatus::Dead)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_combine_advertise_and_port() {
        let member = ClusterMember::new("node-1", "10.0.0.1", 7946, 6380, 8080);
        assert_eq!(member.resp_addr(), "10.0.0.1:6380");
        assert_eq!(member.http_addr(), "10.0.0.1:8080");
        assert_eq!(member.gossip_addr(), "10.0.0.1:7946");
    }

    #[test]
    fn only_dead_members_are_unroutable() {
        let mut member = ClusterMember::new("node-1", "10.0.0.1", 7946, 6380, 8080);
        assert!(member.is_routable());
        member.status = MemberStatus::Suspect;
        assert!(member.is_routable());
        member.status = MemberStatus::Dead;
        assert!(!member.is_routable());
    }
}
