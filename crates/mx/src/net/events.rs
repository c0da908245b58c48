use std::collections::VecDeque;
use std::net::SocketAddr;

use super::flow::FlowMode;
use super::protocol::Protocol;
use super::session::SessionId;

/// Something a session reports while it is being updated.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Sent { protocol: Protocol, payload: Vec<u8> },
    Received { protocol: Protocol, payload: Vec<u8> },
    Acknowledged { protocol: Protocol, payload: Vec<u8> },
    Lost { protocol: Protocol, payload: Vec<u8> },
    DisconnectWarning {
        accumulator: u32,
        limit: u32,
        disconnected: bool,
    },
    FlowControlChanged { mode: FlowMode, penalty_secs: f64 },
}

/// Receives session events and may veto inbound payloads.
pub trait SessionHandler {
    fn handle(&mut self, event: SessionEvent);

    /// Called before a received payload is delivered. Returning `false` drops
    /// it and the wire message is not acknowledged.
    fn accept(&mut self, _protocol: Protocol, _payload: &[u8]) -> bool {
        true
    }
}

impl SessionHandler for VecDeque<SessionEvent> {
    fn handle(&mut self, event: SessionEvent) {
        self.push_back(event);
    }
}

impl SessionHandler for Vec<SessionEvent> {
    fn handle(&mut self, event: SessionEvent) {
        self.push(event);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Explicit,
    TimedOut,
    Isolated,
    Closed,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Explicit => "disconnected",
            DisconnectReason::TimedOut => "timed out",
            DisconnectReason::Isolated => "isolated",
            DisconnectReason::Closed => "closed",
        }
    }
}

/// Progress of one reliable transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub current_fragments: u32,
    pub total_fragments: u32,
    /// Payload length when sending, bytes received so far when receiving.
    pub total_size: usize,
    pub is_sending: bool,
}

impl TransferProgress {
    pub fn is_complete(&self) -> bool {
        self.current_fragments >= self.total_fragments
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatcherEvent {
    Connected {
        session: SessionId,
        addr: SocketAddr,
    },
    Disconnected {
        session: SessionId,
        addr: SocketAddr,
        reason: DisconnectReason,
    },
    DisconnectWarning {
        session: SessionId,
        accumulator: u32,
        limit: u32,
        disconnected: bool,
    },
    MessageSent {
        session: SessionId,
        payload: Vec<u8>,
    },
    MessageReceived {
        session: SessionId,
        payload: Vec<u8>,
        reliable: bool,
    },
    MessageAcknowledged {
        session: SessionId,
        payload: Vec<u8>,
        reliable: bool,
    },
    MessageLost {
        session: SessionId,
        payload: Vec<u8>,
    },
    ReliableSendProgress {
        session: SessionId,
        progress: TransferProgress,
    },
    ReliableReceiveProgress {
        session: SessionId,
        progress: TransferProgress,
    },
    FlowControlChanged {
        session: SessionId,
        mode: FlowMode,
        penalty_secs: f64,
    },
}

impl DispatcherEvent {
    pub fn session(&self) -> SessionId {
        match self {
            DispatcherEvent::Connected { session, .. }
            | DispatcherEvent::Disconnected { session, .. }
            | DispatcherEvent::DisconnectWarning { session, .. }
            | DispatcherEvent::MessageSent { session, .. }
            | DispatcherEvent::MessageReceived { session, .. }
            | DispatcherEvent::MessageAcknowledged { session, .. }
            | DispatcherEvent::MessageLost { session, .. }
            | DispatcherEvent::ReliableSendProgress { session, .. }
            | DispatcherEvent::ReliableReceiveProgress { session, .. }
            | DispatcherEvent::FlowControlChanged { session, .. } => *session,
        }
    }
}
