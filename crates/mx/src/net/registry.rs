use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use crate::config::TransportConfig;
use crate::error::TransportError;

use super::group::SessionGroup;
use super::reliability::ReliabilityOverlay;
use super::session::{ConnectionState, Session, SessionId};

/// What the dispatcher knows about a remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Unconnected,
    Connecting(SessionId),
    Connected(SessionId),
    /// Explicitly disconnected; inbound datagrams are dropped until the next
    /// explicit connect.
    Disconnected,
}

/// A session together with its reliability overlay. They always move as one.
#[derive(Debug)]
pub struct Slot {
    pub session: Session,
    pub reliability: ReliabilityOverlay,
}

#[derive(Debug)]
pub struct Registry {
    sessions: HashMap<SessionId, Slot>,
    by_addr: HashMap<SocketAddr, SessionId>,
    disconnected: HashSet<SocketAddr>,
    groups: HashMap<String, SessionGroup>,
    next_session_id: u32,
    config: TransportConfig,
}

impl Registry {
    pub fn new(config: TransportConfig) -> Self {
        let mut groups = HashMap::new();
        groups.insert(
            SessionGroup::UNGROUPED.to_string(),
            SessionGroup::new(SessionGroup::UNGROUPED),
        );

        Self {
            sessions: HashMap::new(),
            by_addr: HashMap::new(),
            disconnected: HashSet::new(),
            groups,
            next_session_id: 1,
            config,
        }
    }

    /// Looks up the session for `addr`, creating one unless the endpoint was
    /// explicitly disconnected. The flag is `true` for a new session.
    pub fn get_or_create(&mut self, addr: SocketAddr) -> Option<(SessionId, bool)> {
        if let Some(&id) = self.by_addr.get(&addr) {
            return Some((id, false));
        }
        if self.disconnected.contains(&addr) {
            return None;
        }
        Some((self.create(addr), true))
    }

    /// Explicit connect: lifts any blacklist entry for `addr` first.
    pub fn connect(&mut self, addr: SocketAddr) -> (SessionId, bool) {
        self.disconnected.remove(&addr);
        match self.by_addr.get(&addr) {
            Some(&id) => (id, false),
            None => (self.create(addr), true),
        }
    }

    fn create(&mut self, addr: SocketAddr) -> SessionId {
        let id = SessionId(self.next_session_id);
        self.next_session_id = self.next_session_id.wrapping_add(1);

        let session = Session::new(id, addr, self.config.clone());
        self.sessions.insert(
            id,
            Slot {
                session,
                reliability: ReliabilityOverlay::new(),
            },
        );
        self.by_addr.insert(addr, id);
        self.groups
            .entry(SessionGroup::UNGROUPED.to_string())
            .or_insert_with(|| SessionGroup::new(SessionGroup::UNGROUPED))
            .attach(id);

        id
    }

    /// Removes a session from every index and its group.
    pub fn remove(&mut self, id: SessionId) -> Option<Slot> {
        let slot = self.sessions.remove(&id)?;
        self.by_addr.remove(&slot.session.addr());
        self.leave_group(id, slot.session.group().to_string());
        Some(slot)
    }

    pub fn blacklist(&mut self, addr: SocketAddr) {
        self.disconnected.insert(addr);
    }

    pub fn get(&self, id: SessionId) -> Option<&Slot> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Slot> {
        self.sessions.get_mut(&id)
    }

    pub fn id_for(&self, addr: &SocketAddr) -> Option<SessionId> {
        self.by_addr.get(addr).copied()
    }

    /// Session ids in creation order.
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn group(&self, identifier: &str) -> Option<&SessionGroup> {
        self.groups.get(identifier)
    }

    pub fn group_identifiers(&self) -> Vec<String> {
        let mut identifiers: Vec<String> = self.groups.keys().cloned().collect();
        identifiers.sort();
        identifiers
    }

    /// Moves a session into `identifier`, creating the group if needed.
    /// Returns `false` when the session already was a member.
    pub fn place_in_group(
        &mut self,
        id: SessionId,
        identifier: &str,
    ) -> Result<bool, TransportError> {
        let slot = self
            .sessions
            .get_mut(&id)
            .ok_or(TransportError::UnknownSession(id))?;

        let current = slot.session.group().to_string();
        if current == identifier {
            return Ok(false);
        }
        slot.session.set_group(identifier);

        self.leave_group(id, current);
        self.groups
            .entry(identifier.to_string())
            .or_insert_with(|| SessionGroup::new(identifier))
            .attach(id);
        Ok(true)
    }

    fn leave_group(&mut self, id: SessionId, identifier: String) {
        let Some(group) = self.groups.get_mut(&identifier) else {
            return;
        };
        group.detach(id);
        if group.is_empty() && !group.is_ungrouped() {
            self.groups.remove(&identifier);
        }
    }

    pub fn endpoint_state(&self, addr: &SocketAddr) -> EndpointState {
        if let Some(slot) = self.id_for(addr).and_then(|id| self.sessions.get(&id)) {
            return match slot.session.state() {
                ConnectionState::Connecting => EndpointState::Connecting(slot.session.id()),
                ConnectionState::Connected => EndpointState::Connected(slot.session.id()),
            };
        }
        if self.disconnected.contains(addr) {
            EndpointState::Disconnected
        } else {
            EndpointState::Unconnected
        }
    }
}
