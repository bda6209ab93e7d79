//! # Gossip Membership
//!
//! Purpose: Maintain an eventually-consistent view of cluster membership and
//! carry the replication event bus, without committing the rest of the
//! workspace to one concrete wire protocol.
//!
//! ## Design Principles
//! 1. **Transport Is a Seam, Not a Requirement**: `GossipTransport` is the
//!    only contract; the concrete SWIM-ish heartbeat protocol is a reference
//!    implementation, not something callers depend on directly.
//! 2. **At-Least-Once, Best-Effort Order**: events may be delivered more
//!    than once or slightly out of order across different origins;
//!    subscribers (the replication handler) are required to be idempotent.
//! 3. **Single Delivery Thread**: the listener drains incoming datagrams on
//!    one dedicated thread so events from the same origin are dispatched to
//!    callbacks in the order they arrive.

use std::collections::HashMap;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use hkv_common::{HkvError, HkvResult};

use crate::member::{ClusterMember, MemberStatus};
use crate::ring::HashRing;

/// The mutation kind carried by a `data-mutation` gossip event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOp {
    Set,
    Del,
    Clear,
}

/// One replicated mutation, tagged with its origin and a stable
/// correlation-id for cross-node tracing.
#[derive(Debug, Clone, PartialEq)]
pub struct DataMutation {
    pub op: MutationOp,
    pub store: String,
    pub key: Vec<u8>,
    /// Tagged-value encoded bytes (`hkv_common::Value::encode`); empty for
    /// `Del`/`Clear`.
    pub value: Vec<u8>,
    pub ttl_secs: u64,
    pub session: String,
    pub origin_node_id: String,
    pub correlation_id: String,
}

/// Events carried on the membership bus.
#[derive(Debug, Clone, PartialEq)]
pub enum GossipEvent {
    MemberJoined(ClusterMember),
    MemberLeft(String),
    MemberSuspect(String),
    DataMutation(DataMutation),
}

/// Pluggable gossip wire transport. The concrete protocol is out of scope;
/// this is the only contract `MembershipService` depends on.
pub trait GossipTransport: Send + Sync {
    /// Sends an already-encoded event payload to `addr` (host:port).
    fn send(&self, addr: &str, payload: &[u8]) -> HkvResult<()>;

    /// Blocks until a payload arrives, returning it alongside the sender's
    /// address. Returns `Cancelled` once the transport has been shut down.
    fn recv(&self) -> HkvResult<Vec<u8>>;

    /// Requests that a blocked `recv` return promptly with `Cancelled`.
    fn shutdown(&self);
}

/// Reference transport: best-effort gossip over UDP datagrams.
///
/// Each event is encoded standalone (see [`encode_event`]) and sent as one
/// datagram; loss is tolerated because membership and replication events are
/// both delivered at-least-once on a timer/retry basis by the caller.
pub struct UdpGossipTransport {
    socket: UdpSocket,
}

impl UdpGossipTransport {
    pub fn bind(local_addr: &str) -> HkvResult<Self> {
        let socket = UdpSocket::bind(local_addr).map_err(HkvError::from)?;
        socket
            .set_read_timeout(Some(Duration::from_millis(250)))
            .map_err(HkvError::from)?;
        Ok(UdpGossipTransport { socket })
    }
}

impl GossipTransport for UdpGossipTransport {
    fn send(&self, addr: &str, payload: &[u8]) -> HkvResult<()> {
        self.socket.send_to(payload, addr).map_err(HkvError::from)?;
        Ok(())
    }

    fn recv(&self) -> HkvResult<Vec<u8>> {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, _from)) => return Ok(buf[..len].to_vec()),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(err) if err.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(err) => return Err(HkvError::from(err)),
            }
        }
    }

    fn shutdown(&self) {
        // The read-timeout loop above notices a shutdown flag on its own;
        // nothing to interrupt at the socket level.
    }
}

/// In-process transport used by tests to simulate a cluster without binding
/// real sockets: every registered peer shares a `crossbeam_channel`.
pub struct InMemoryTransport {
    inbox_rx: crossbeam_channel::Receiver<Vec<u8>>,
    inbox_tx: crossbeam_channel::Sender<Vec<u8>>,
    peers: Mutex<HashMap<String, crossbeam_channel::Sender<Vec<u8>>>>,
    shutdown: Arc<AtomicBool>,
}

impl InMemoryTransport {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        Arc::new(InMemoryTransport {
            inbox_rx: rx,
            inbox_tx: tx,
            peers: Mutex::new(HashMap::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Registers `addr` as deliverable to `peer`'s inbox; used by tests to
    /// wire up a simulated cluster.
    pub fn register_peer(&self, addr: &str, peer: &Arc<InMemoryTransport>) {
        self.peers
            .lock()
            .insert(addr.to_string(), peer.inbox_tx.clone());
    }
}

impl GossipTransport for InMemoryTransport {
    fn send(&self, addr: &str, payload: &[u8]) -> HkvResult<()> {
        let peers = self.peers.lock();
        if let Some(tx) = peers.get(addr) {
            let _ = tx.send(payload.to_vec());
        }
        Ok(())
    }

    fn recv(&self) -> HkvResult<Vec<u8>> {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return Err(HkvError::Cancelled);
            }
            match self.inbox_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(payload) => return Ok(payload),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    return Err(HkvError::Cancelled)
                }
            }
        }
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

fn read_varint(buf: &[u8], pos: &mut usize) -> HkvResult<u64> {
    let mut result = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *buf.get(*pos).ok_or(HkvError::DeserializeError)?;
        *pos += 1;
        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift >= 64 {
            return Err(HkvError::DeserializeError);
        }
    }
    Ok(result)
}

fn write_bytes(out: &mut Vec<u8>, data: &[u8]) {
    write_varint(out, data.len() as u64);
    out.extend_from_slice(data);
}

fn read_bytes<'a>(buf: &'a [u8], pos: &mut usize) -> HkvResult<&'a [u8]> {
    let len = read_varint(buf, pos)? as usize;
    let slice = buf.get(*pos..*pos + len).ok_or(HkvError::DeserializeError)?;
    *pos += len;
    Ok(slice)
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    write_bytes(out, s.as_bytes());
}

fn read_str(buf: &[u8], pos: &mut usize) -> HkvResult<String> {
    String::from_utf8(read_bytes(buf, pos)?.to_vec()).map_err(|_| HkvError::DeserializeError)
}

/// Encodes a gossip event into a standalone wire payload. The format is
/// private to this crate; it exists only so the reference transports have
/// something concrete to send.
pub fn encode_event(event: &GossipEvent) -> Vec<u8> {
    let mut out = Vec::new();
    match event {
        GossipEvent::MemberJoined(member) => {
            out.push(0);
            write_str(&mut out, &member.node_id);
            write_str(&mut out, &member.advertise_addr);
            out.extend_from_slice(&member.gossip_port.to_le_bytes());
            out.extend_from_slice(&member.resp_port.to_le_bytes());
            out.extend_from_slice(&member.http_port.to_le_bytes());
        }
        GossipEvent::MemberLeft(node_id) => {
            out.push(1);
            write_str(&mut out, node_id);
        }
        GossipEvent::MemberSuspect(node_id) => {
            out.push(2);
            write_str(&mut out, node_id);
        }
        GossipEvent::DataMutation(mutation) => {
            out.push(3);
            out.push(mutation.op as u8);
            write_str(&mut out, &mutation.store);
            write_bytes(&mut out, &mutation.key);
            write_bytes(&mut out, &mutation.value);
            out.extend_from_slice(&mutation.ttl_secs.to_le_bytes());
            write_str(&mut out, &mutation.session);
            write_str(&mut out, &mutation.origin_node_id);
            write_str(&mut out, &mutation.correlation_id);
        }
    }
    out
}

/// Decodes a payload produced by [`encode_event`].
pub fn decode_event(buf: &[u8]) -> HkvResult<GossipEvent> {
    let mut pos = 0usize;
    let tag = *buf.first().ok_or(HkvError::DeserializeError)?;
    pos += 1;
    Ok(match tag {
        0 => {
            let node_id = read_str(buf, &mut pos)?;
            let advertise_addr = read_str(buf, &mut pos)?;
            let gossip_port = u16::from_le_bytes(
                buf.get(pos..pos + 2)
                    .ok_or(HkvError::DeserializeError)?
                    .try_into()
                    .unwrap(),
            );
            pos += 2;
            let resp_port = u16::from_le_bytes(
                buf.get(pos..pos + 2)
                    .ok_or(HkvError::DeserializeError)?
                    .try_into()
                    .unwrap(),
            );
            pos += 2;
            let http_port = u16::from_le_bytes(
                buf.get(pos..pos + 2)
                    .ok_or(HkvError::DeserializeError)?
                    .try_into()
                    .unwrap(),
            );
            GossipEvent::MemberJoined(ClusterMember::new(
                node_id,
                advertise_addr,
                gossip_port,
                resp_port,
                http_port,
            ))
        }
        1 => GossipEvent::MemberLeft(read_str(buf, &mut pos)?),
        2 => GossipEvent::MemberSuspect(read_str(buf, &mut pos)?),
        3 => {
            let op = match buf.get(pos).copied().ok_or(HkvError::DeserializeError)? {
                0 => MutationOp::Set,
                1 => MutationOp::Del,
                2 => MutationOp::Clear,
                _ => return Err(HkvError::DeserializeError),
            };
            pos += 1;
            let store = read_str(buf, &mut pos)?;
            let key = read_bytes(buf, &mut pos)?.to_vec();
            let value = read_bytes(buf, &mut pos)?.to_vec();
            let ttl_secs = u64::from_le_bytes(
                buf.get(pos..pos + 8)
                    .ok_or(HkvError::DeserializeError)?
                    .try_into()
                    .unwrap(),
            );
            pos += 8;
            let session = read_str(buf, &mut pos)?;
            let origin_node_id = read_str(buf, &mut pos)?;
            let correlation_id = read_str(buf, &mut pos)?;
            GossipEvent::DataMutation(DataMutation {
                op,
                store,
                key,
                value,
                ttl_secs,
                session,
                origin_node_id,
                correlation_id,
            })
        }
        _ => return Err(HkvError::DeserializeError),
    })
}

type EventCallback = Box<dyn Fn(GossipEvent) + Send + Sync>;

/// How often the heartbeat thread re-announces this node to its peers.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
/// A peer not heard from in this many missed heartbeats is marked suspect.
const SUSPECT_AFTER_MISSED_HEARTBEATS: u32 = 3;

/// Gossip-backed membership and event bus for one node.
///
/// Holds the authoritative ring updates: membership changes (join/leave/
/// suspect) are applied to the shared `HashRing` from the single listener
/// thread, so ring mutations never race with each other.
pub struct MembershipService {
    local: ClusterMember,
    ring: Arc<HashRing>,
    transport: Arc<dyn GossipTransport>,
    callbacks: RwLock<Vec<EventCallback>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    last_seen: Mutex<HashMap<String, Instant>>,
    stop: Arc<AtomicBool>,
}

impl MembershipService {
    pub fn new(local: ClusterMember, ring: Arc<HashRing>, transport: Arc<dyn GossipTransport>) -> Arc<Self> {
        ring.add_node(local.clone());
        let mut last_seen = HashMap::new();
        last_seen.insert(local.node_id.clone(), Instant::now());
        Arc::new(MembershipService {
            local,
            ring,
            transport,
            callbacks: RwLock::new(Vec::new()),
            listener: Mutex::new(None),
            heartbeat: Mutex::new(None),
            last_seen: Mutex::new(last_seen),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_node_id(&self) -> &str {
        &self.local.node_id
    }

    /// Registers a callback invoked (on the listener thread) for every
    /// decoded event, in arrival order.
    pub fn on_event(&self, callback: impl Fn(GossipEvent) + Send + Sync + 'static) {
        self.callbacks.write().push(Box::new(callback));
    }

    /// Joins the cluster: announces this node to `seeds` and starts the
    /// listener thread that applies membership changes to the ring and
    /// fans events out to subscribers.
    pub fn join(self: &Arc<Self>, seeds: &[String]) {
        let announce = GossipEvent::MemberJoined(self.local.clone());
        let payload = encode_event(&announce);
        for seed in seeds {
            if let Err(err) = self.transport.send(seed, &payload) {
                warn!(seed = %seed, error = %err, "failed to announce to gossip seed");
            }
        }

        let service = Arc::clone(self);
        let listener = std::thread::Builder::new()
            .name(format!("hkv-gossip-{}", service.local.node_id))
            .spawn(move || service.listen_loop())
            .expect("failed to spawn gossip listener");
        *self.listener.lock() = Some(listener);

        let service = Arc::clone(self);
        let heartbeat = std::thread::Builder::new()
            .name(format!("hkv-heartbeat-{}", service.local.node_id))
            .spawn(move || service.heartbeat_loop())
            .expect("failed to spawn gossip heartbeat");
        *self.heartbeat.lock() = Some(heartbeat);
    }

    fn listen_loop(self: Arc<Self>) {
        while !self.stop.load(Ordering::Acquire) {
            match self.transport.recv() {
                Ok(payload) => match decode_event(&payload) {
                    Ok(event) => self.apply_and_dispatch(event),
                    Err(err) => debug!(error = %err, "discarding malformed gossip payload"),
                },
                Err(HkvError::Cancelled) => break,
                Err(err) => {
                    warn!(error = %err, "gossip transport recv failed");
                }
            }
        }
    }

    /// Re-announces this node to every known peer on a timer, and promotes
    /// peers that have missed too many heartbeats to `Suspect`. This is the
    /// crate's (best-effort, SWIM-ish) failure detector.
    fn heartbeat_loop(self: Arc<Self>) {
        let suspect_after = HEARTBEAT_INTERVAL * SUSPECT_AFTER_MISSED_HEARTBEATS;
        while !self.stop.load(Ordering::Acquire) {
            std::thread::sleep(HEARTBEAT_INTERVAL);
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            self.last_seen
                .lock()
                .insert(self.local.node_id.clone(), Instant::now());

            let announce = GossipEvent::MemberJoined(self.local.clone());
            let payload = encode_event(&announce);
            let now = Instant::now();
            let last_seen = self.last_seen.lock().clone();
            for member in self.ring.members() {
                if member.node_id == self.local.node_id {
                    continue;
                }
                if let Err(err) = self.transport.send(&member.gossip_addr(), &payload) {
                    debug!(peer = %member.node_id, error = %err, "heartbeat send failed");
                }
                if member.status == MemberStatus::Alive {
                    let stale = last_seen
                        .get(&member.node_id)
                        .map(|seen| now.duration_since(*seen) > suspect_after)
                        .unwrap_or(true);
                    if stale {
                        self.ring.set_status(&member.node_id, MemberStatus::Suspect);
                    }
                }
            }
        }
    }

    fn apply_and_dispatch(&self, event: GossipEvent) {
        match &event {
            GossipEvent::MemberJoined(member) => {
                self.last_seen
                    .lock()
                    .insert(member.node_id.clone(), Instant::now());
                self.ring.add_node(member.clone());
            }
            GossipEvent::MemberLeft(node_id) => self.ring.remove_node(node_id),
            GossipEvent::MemberSuspect(node_id) => {
                self.ring.set_status(node_id, MemberStatus::Suspect)
            }
            GossipEvent::DataMutation(mutation) => {
                self.last_seen
                    .lock()
                    .insert(mutation.origin_node_id.clone(), Instant::now());
            }
        }
        for callback in self.callbacks.read().iter() {
            callback(event.clone());
        }
    }

    /// Publishes an event to every known peer and to local subscribers
    /// (the coordinator relies on this to drive its own ReplicationHandler
    /// subscription, which drops events whose origin is this node).
    pub fn publish(&self, event: GossipEvent) {
        let payload = encode_event(&event);
        for member in self.ring.members() {
            if member.node_id == self.local.node_id {
                continue;
            }
            if let Err(err) = self.transport.send(&member.gossip_addr(), &payload) {
                debug!(peer = %member.node_id, error = %err, "gossip send failed");
            }
        }
        for callback in self.callbacks.read().iter() {
            callback(event.clone());
        }
    }

    pub fn members(&self) -> Vec<ClusterMember> {
        self.ring.members()
    }

    /// Announces departure and stops the listener thread.
    pub fn leave(&self) {
        self.publish(GossipEvent::MemberLeft(self.local.node_id.clone()));
        self.stop.store(true, Ordering::Release);
        self.transport.shutdown();
        if let Some(handle) = self.listener.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.heartbeat.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str, port: u16) -> ClusterMember {
        ClusterMember::new(id, "127.0.0.1", port, port + 1, port + 2)
    }

    #[test]
    fn event_round_trips_through_encode_decode() {
        let event = GossipEvent::DataMutation(DataMutation {
            op: MutationOp::Set,
            store: "default".into(),
            key: b"k".to_vec(),
            value: vec![0, b'v'],
            ttl_secs: 30,
            session: "s1".into(),
            origin_node_id: "node-1".into(),
            correlation_id: "corr-1".into(),
        });
        let encoded = encode_event(&event);
        assert_eq!(decode_event(&encoded).unwrap(), event);
    }

    #[test]
    fn member_events_round_trip() {
        for event in [
            GossipEvent::MemberJoined(member("node-1", 7946)),
            GossipEvent::MemberLeft("node-1".into()),
            GossipEvent::MemberSuspect("node-1".into()),
        ] {
            let encoded = encode_event(&event);
            assert_eq!(decode_event(&encoded).unwrap(), event);
        }
    }

    #[test]
    fn in_memory_transport_delivers_between_two_peers() {
        let a = InMemoryTransport::new();
        let b = InMemoryTransport::new();
        a.register_peer("b", &b);
        b.register_peer("a", &a);

        a.send("b", b"hello").unwrap();
        assert_eq!(b.recv().unwrap(), b"hello");
    }

    #[test]
    fn join_installs_local_node_in_ring() {
        let ring = Arc::new(HashRing::new(2));
        let transport = InMemoryTransport::new();
        let service = MembershipService::new(member("node-1", 7946), Arc::clone(&ring), transport);
        assert_eq!(ring.members().len(), 1);
        assert_eq!(service.local_node_id(), "node-1");
    }

    #[test]
    fn two_node_cluster_converges_via_gossip() {
        let ring_a = Arc::new(HashRing::new(2));
        let ring_b = Arc::new(HashRing::new(2));
        let transport_a = InMemoryTransport::new();
        let transport_b = InMemoryTransport::new();
        transport_a.register_peer("b", &transport_b);
        transport_b.register_peer("a", &transport_a);

        let service_a = MembershipService::new(member("node-a", 1), ring_a, transport_a);
        let service_b = MembershipService::new(member("node-b", 2), ring_b, transport_b);

        service_b.join(&["a".to_string()]);
        service_a.join(&[]);

        // Give the listener thread a moment to apply the announcement.
        for _ in 0..50 {
            if service_a.members().len() == 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(service_a.members().len(), 2);

        service_a.leave();
        service_b.leave();
    }
}
