//! Connection registry: live sessions, broadcast rooms, the machine
//! snapshot map and the heartbeat latency map.
//!
//! One registry per process, owned by the gateway and shared by reference
//! with the scheduler and pipeline call sites. All mutation goes through
//! these methods; nothing else touches the maps.

use crate::events::OutboundEvent;
use crate::report::CanonicalReport;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use uuid::Uuid;

pub const ROOM_REPORTERS: &str = "reporter";
pub const ROOM_CLIENTS: &str = "client";

/// Identity-specific room a machine's reporter (and any observer relaying
/// to it) sits in.
pub fn machine_room(uuid: &str) -> String {
    format!("reporter-{uuid}")
}

pub type SessionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Reporter,
    Client,
}

/// A live connection. Created on connect, destroyed on disconnect, owned
/// exclusively by the registry in between.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub identity: String,
    pub role: Role,
    /// Write handle to the session's socket pump. Sends are best-effort:
    /// a closed or slow receiver degrades only itself.
    pub tx: mpsc::UnboundedSender<OutboundEvent>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, Session>,
    rooms: HashMap<String, HashSet<SessionId>>,
    snapshot: HashMap<String, CanonicalReport>,
    latency: HashMap<String, f64>,
    /// machine uuid -> client session holding its terminal open
    terminals: HashMap<String, SessionId>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Session) {
        self.inner.lock().sessions.insert(session.id, session);
    }

    /// Removes the session, its room memberships and any terminal it held.
    /// Deterministic: runs synchronously when the socket closes.
    pub fn unregister(&self, id: SessionId) {
        let mut inner = self.inner.lock();
        if let Some(session) = inner.sessions.remove(&id) {
            tracing::debug!(identity = %session.identity, role = ?session.role, "session unregistered");
        }
        for members in inner.rooms.values_mut() {
            members.remove(&id);
        }
        inner.rooms.retain(|_, members| !members.is_empty());
        inner.terminals.retain(|_, holder| *holder != id);
    }

    pub fn join_room(&self, id: SessionId, room: &str) {
        self.inner.lock().rooms.entry(room.to_string()).or_default().insert(id);
    }

    /// Send to every member of a room. No-op for empty rooms; send errors
    /// (receiver gone) are ignored.
    pub fn broadcast(&self, room: &str, event: &OutboundEvent) {
        let inner = self.inner.lock();
        let Some(members) = inner.rooms.get(room) else { return };
        for id in members {
            if let Some(session) = inner.sessions.get(id) {
                let _ = session.tx.send(event.clone());
            }
        }
    }

    /// Send to a single session, best-effort.
    pub fn send_to(&self, id: SessionId, event: OutboundEvent) {
        let inner = self.inner.lock();
        if let Some(session) = inner.sessions.get(&id) {
            let _ = session.tx.send(event);
        }
    }

    pub fn snapshot_set(&self, uuid: String, report: CanonicalReport) {
        self.inner.lock().snapshot.insert(uuid, report);
    }

    pub fn snapshot_all(&self) -> HashMap<String, CanonicalReport> {
        self.inner.lock().snapshot.clone()
    }

    /// Wholesale stale-data eviction; the scheduler calls this on a fixed
    /// interval rather than tracking per-entry TTLs.
    pub fn snapshot_clear(&self) {
        self.inner.lock().snapshot.clear();
    }

    pub fn latency_update(&self, uuid: String, ms: f64) {
        self.inner.lock().latency.insert(uuid, ms);
    }

    pub fn latency_get(&self, uuid: &str) -> Option<f64> {
        self.inner.lock().latency.get(uuid).copied()
    }

    pub fn latency_all(&self) -> HashMap<String, f64> {
        self.inner.lock().latency.clone()
    }

    /// Claim a machine's terminal for a client. Fails when the client
    /// already holds one (single terminal at a time) or the machine's
    /// terminal is already taken.
    pub fn terminal_open(&self, client: SessionId, machine_uuid: String) -> bool {
        let mut inner = self.inner.lock();
        if inner.terminals.values().any(|holder| *holder == client)
            || inner.terminals.contains_key(&machine_uuid)
        {
            return false;
        }
        inner.terminals.insert(machine_uuid, client);
        true
    }

    pub fn terminal_close(&self, machine_uuid: &str) {
        self.inner.lock().terminals.remove(machine_uuid);
    }

    /// The client session attached to a machine's terminal, if any.
    pub fn terminal_client_for(&self, machine_uuid: &str) -> Option<SessionId> {
        self.inner.lock().terminals.get(machine_uuid).copied()
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// (reporters, clients) currently connected.
    pub fn role_counts(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        let reporters = inner.sessions.values().filter(|s| s.role == Role::Reporter).count();
        (reporters, inner.sessions.len() - reporters)
    }

    pub fn snapshot_count(&self) -> usize {
        self.inner.lock().snapshot.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{normalize, RawReport};

    fn make_session(role: Role, identity: &str) -> (Session, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session {
            id: Uuid::new_v4(),
            identity: identity.to_string(),
            role,
            tx,
        };
        (session, rx)
    }

    fn dummy_report() -> CanonicalReport {
        normalize(RawReport::default(), &HashMap::new())
    }

    #[test]
    fn test_room_broadcast_reaches_members_only() {
        let registry = ConnectionRegistry::new();
        let (reporter, mut reporter_rx) = make_session(Role::Reporter, "m1");
        let (client, mut client_rx) = make_session(Role::Client, "u1");
        let reporter_id = reporter.id;
        let client_id = client.id;
        registry.register(reporter);
        registry.register(client);
        registry.join_room(reporter_id, ROOM_REPORTERS);
        registry.join_room(client_id, ROOM_CLIENTS);

        registry.broadcast(ROOM_REPORTERS, &OutboundEvent::Heartbeat(1));
        assert!(matches!(reporter_rx.try_recv(), Ok(OutboundEvent::Heartbeat(1))));
        assert!(client_rx.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_empty_room_is_noop() {
        let registry = ConnectionRegistry::new();
        registry.broadcast("nobody-here", &OutboundEvent::RunSpeedtest);
    }

    #[test]
    fn test_dead_session_does_not_block_broadcast() {
        let registry = ConnectionRegistry::new();
        let (dead, dead_rx) = make_session(Role::Client, "u1");
        let (live, mut live_rx) = make_session(Role::Client, "u2");
        let dead_id = dead.id;
        let live_id = live.id;
        registry.register(dead);
        registry.register(live);
        registry.join_room(dead_id, ROOM_CLIENTS);
        registry.join_room(live_id, ROOM_CLIENTS);
        drop(dead_rx);

        registry.broadcast(ROOM_CLIENTS, &OutboundEvent::Points(5));
        assert!(matches!(live_rx.try_recv(), Ok(OutboundEvent::Points(5))));
    }

    #[test]
    fn test_unregister_leaves_all_rooms() {
        let registry = ConnectionRegistry::new();
        let (session, _rx) = make_session(Role::Reporter, "m1");
        let id = session.id;
        registry.register(session);
        registry.join_room(id, ROOM_REPORTERS);
        registry.join_room(id, &machine_room("m1"));
        registry.unregister(id);

        registry.broadcast(ROOM_REPORTERS, &OutboundEvent::Heartbeat(1));
        assert_eq!(registry.session_count(), 0);
    }

    #[test]
    fn test_snapshot_set_overwrite_and_clear() {
        let registry = ConnectionRegistry::new();
        registry.snapshot_set("m1".into(), dummy_report());
        registry.snapshot_set("m1".into(), dummy_report());
        registry.snapshot_set("m2".into(), dummy_report());
        assert_eq!(registry.snapshot_all().len(), 2);
        registry.snapshot_clear();
        assert!(registry.snapshot_all().is_empty());
    }

    #[test]
    fn test_latency_map() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.latency_get("m1"), None);
        registry.latency_update("m1".into(), 30.0);
        assert_eq!(registry.latency_get("m1"), Some(30.0));
    }

    #[test]
    fn test_single_terminal_guard() {
        let registry = ConnectionRegistry::new();
        let client = Uuid::new_v4();
        assert!(registry.terminal_open(client, "m1".into()));
        // same client cannot open a second terminal
        assert!(!registry.terminal_open(client, "m2".into()));
        // another client cannot steal an open terminal
        assert!(!registry.terminal_open(Uuid::new_v4(), "m1".into()));
        assert_eq!(registry.terminal_client_for("m1"), Some(client));
        registry.terminal_close("m1");
        assert_eq!(registry.terminal_client_for("m1"), None);
    }

    #[test]
    fn test_unregister_releases_terminal() {
        let registry = ConnectionRegistry::new();
        let (client, _rx) = make_session(Role::Client, "u1");
        let id = client.id;
        registry.register(client);
        assert!(registry.terminal_open(id, "m1".into()));
        registry.unregister(id);
        assert_eq!(registry.terminal_client_for("m1"), None);
    }
}
