use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};

use super::endpoint::{bind_nonblocking, is_transient};
use super::events::{DisconnectReason, DispatcherEvent, SessionEvent, SessionHandler};
use super::flow::FlowMode;
use super::group::SessionGroup;
use super::protocol::{PROBE_REQUEST, PROBE_RESPONSE, Protocol};
use super::registry::{EndpointState, Registry};
use super::reliability::{ReliabilityOverlay, ReliableEvent, check_payload};
use super::session::{ConnectionState, DatagramSink, SessionId, SessionStatus};
use super::stats::NetworkStats;

type ReceiveFilter = Box<dyn FnMut(SessionId, Protocol, &[u8]) -> bool + Send>;

/// Where [`Dispatcher::send`] delivers a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<'a> {
    Session(SessionId),
    /// Every member of a named group.
    Group(&'a str),
}

/// Snapshot of one session's transport state.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub addr: SocketAddr,
    pub group: String,
    pub state: ConnectionState,
    pub latency: Duration,
    pub mean_rtt_ms: f64,
    pub flow_mode: FlowMode,
    pub penalty_secs: f64,
    pub disconnect_accumulator: u32,
    pub has_received_packet: bool,
    pub in_flight: usize,
    pub reliable_queued: usize,
}

struct Inner {
    registry: Registry,
    events: VecDeque<DispatcherEvent>,
    stats: NetworkStats,
    filter: Option<ReceiveFilter>,
    recv_buffer: Vec<u8>,
}

/// Owns the UDP socket and every session talking through it.
///
/// All methods take `&self`; the dispatcher can be shared between threads
/// through an `Arc`. Nothing happens on the wire until [`Dispatcher::update`]
/// is called, normally once per game tick.
pub struct Dispatcher {
    socket: UdpSocket,
    local_addr: SocketAddr,
    config: TransportConfig,
    inner: Mutex<Inner>,
    closed: AtomicBool,
}

impl Dispatcher {
    pub fn bind<A: ToSocketAddrs>(addr: A, config: TransportConfig) -> Result<Self> {
        let socket = bind_nonblocking(addr)?;
        Self::from_socket(socket, config)
    }

    /// Takes over an already bound socket.
    pub fn from_socket(socket: UdpSocket, config: TransportConfig) -> Result<Self> {
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        let inner = Inner {
            registry: Registry::new(config.clone()),
            events: VecDeque::new(),
            stats: NetworkStats::default(),
            filter: None,
            recv_buffer: vec![0u8; config.receive_buffer_size.max(PROBE_REQUEST.len())],
        };

        log::debug!("Dispatcher bound to {}", local_addr);

        Ok(Self {
            socket,
            local_addr,
            config,
            inner: Mutex::new(inner),
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(self.inner.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Opens a session to `addr`, or returns the live one.
    pub fn connect(&self, addr: SocketAddr) -> Result<SessionId> {
        let mut inner = self.lock()?;
        let (id, created) = inner.registry.connect(addr);
        if created {
            log::info!("Session {} connecting to {}", id, addr);
            inner
                .events
                .push_back(DispatcherEvent::Connected { session: id, addr });
        }
        Ok(id)
    }

    /// Drops a session and ignores its endpoint until the next [`connect`].
    ///
    /// [`connect`]: Dispatcher::connect
    pub fn disconnect(&self, session: SessionId) -> Result<()> {
        let mut inner = self.lock()?;
        disconnect_session(&mut inner, session, DisconnectReason::Explicit)
            .ok_or(TransportError::UnknownSession(session))
    }

    /// Like [`Dispatcher::disconnect`] but by address. The endpoint is
    /// blacklisted even when no session exists for it.
    pub fn disconnect_endpoint(&self, addr: SocketAddr) -> Result<bool> {
        let mut inner = self.lock()?;
        match inner.registry.id_for(&addr) {
            Some(id) => Ok(disconnect_session(&mut inner, id, DisconnectReason::Explicit).is_some()),
            None => {
                inner.registry.blacklist(addr);
                Ok(false)
            }
        }
    }

    pub fn send(&self, target: Target<'_>, payload: &[u8], reliable: bool) -> Result<()> {
        let mut inner = self.lock()?;

        let recipients = match target {
            Target::Session(id) => {
                if inner.registry.get(id).is_none() {
                    return Err(TransportError::UnknownSession(id));
                }
                vec![id]
            }
            Target::Group(identifier) if identifier == SessionGroup::UNGROUPED => {
                return Err(TransportError::UngroupedTarget);
            }
            Target::Group(identifier) => inner
                .registry
                .group(identifier)
                .map(|group| group.members().to_vec())
                .ok_or_else(|| TransportError::UnknownGroup(identifier.to_string()))?,
        };

        if reliable {
            check_payload(payload)?;
        }

        for id in recipients {
            let Some(slot) = inner.registry.get_mut(id) else {
                continue;
            };
            if reliable {
                slot.reliability.send(payload.to_vec())?;
            } else {
                slot.session.enqueue_send(payload.to_vec(), Protocol::Realtime);
            }
        }

        Ok(())
    }

    pub fn place_in_group(&self, session: SessionId, group: &str) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.registry.place_in_group(session, group)? {
            log::debug!("Session {} joined group {:?}", session, group);
        }
        Ok(())
    }

    /// Keeps the most recently heard member of `group` that has received a
    /// packet and disconnects every other member. Does nothing when no member
    /// has received anything yet.
    pub fn isolate(&self, group: &str) -> Result<Option<SessionId>> {
        if group == SessionGroup::UNGROUPED {
            return Err(TransportError::UngroupedTarget);
        }

        let mut inner = self.lock()?;
        let members = inner
            .registry
            .group(group)
            .map(|g| g.members().to_vec())
            .ok_or_else(|| TransportError::UnknownGroup(group.to_string()))?;

        let keeper = members
            .iter()
            .filter_map(|&id| inner.registry.get(id).map(|slot| (id, &slot.session)))
            .filter(|(_, session)| session.has_received_packet())
            .min_by_key(|(_, session)| session.disconnect_accumulator())
            .map(|(id, _)| id);

        let Some(keeper) = keeper else {
            return Ok(None);
        };

        for id in members.into_iter().filter(|&id| id != keeper) {
            disconnect_session(&mut inner, id, DisconnectReason::Isolated);
        }
        log::info!("Group {:?} isolated to session {}", group, keeper);

        Ok(Some(keeper))
    }

    /// Runs one tick: drains the socket, then updates every session and its
    /// reliability overlay.
    ///
    /// A corrupt reliable fragment does not stop the tick; the first error
    /// seen is returned once every session has been updated.
    pub fn update(&self) -> Result<()> {
        let mut guard = self.lock()?;
        let Inner {
            registry,
            events,
            stats,
            filter,
            recv_buffer,
        } = &mut *guard;

        let mut first_error = None;

        loop {
            match self.socket.recv_from(recv_buffer) {
                Ok((size, from)) => {
                    stats.record_received(size);
                    let datagram = &recv_buffer[..size];

                    if datagram == PROBE_REQUEST {
                        match self.socket.send_to(&PROBE_RESPONSE, from) {
                            Ok(sent) => {
                                stats.record_sent(sent);
                                stats.probes_answered += 1;
                            }
                            Err(err) => log::debug!("Probe reply to {} failed: {}", from, err),
                        }
                        continue;
                    }

                    let Some((id, created)) = registry.get_or_create(from) else {
                        log::trace!("Dropped datagram from disconnected endpoint {}", from);
                        continue;
                    };
                    if created {
                        log::info!("Session {} connected from {}", id, from);
                        events.push_back(DispatcherEvent::Connected {
                            session: id,
                            addr: from,
                        });
                    }
                    if let Some(slot) = registry.get_mut(id) {
                        slot.session.enqueue_receive(datagram.to_vec());
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if is_transient(&err) => {
                    log::trace!("Ignoring receive error: {}", err);
                }
                Err(err) => {
                    first_error = Some(TransportError::Io(err));
                    break;
                }
            }
        }

        let mut timed_out = Vec::new();
        for id in registry.ids() {
            let Some(slot) = registry.get_mut(id) else {
                continue;
            };

            slot.reliability.update(&mut slot.session);

            let mut handler = SlotHandler {
                session: id,
                overlay: &mut slot.reliability,
                events: &mut *events,
                filter: &mut *filter,
                lost: 0,
                corrupt: None,
            };
            let mut sink = CountingSink {
                socket: &self.socket,
                stats: &mut *stats,
            };
            let status = slot.session.update(&mut sink, &mut handler);

            let SlotHandler { lost, corrupt, .. } = handler;
            stats.messages_lost += lost;
            if let Some(err) = corrupt {
                stats.corrupt_messages += 1;
                first_error.get_or_insert(err);
            }

            for event in slot.reliability.drain_events() {
                events.push_back(reliable_event(id, event));
            }

            if status == SessionStatus::TimedOut {
                timed_out.push(id);
            }
        }

        for id in timed_out {
            disconnect_session(&mut guard, id, DisconnectReason::TimedOut);
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Takes every event raised since the last call. Still works after
    /// [`Dispatcher::close`] so the final disconnects can be observed.
    pub fn drain_events(&self) -> Vec<DispatcherEvent> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.events.drain(..).collect()
    }

    /// Disconnects every session and disables the dispatcher for good.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock()?;
        self.closed.store(true, Ordering::SeqCst);

        for id in inner.registry.ids() {
            disconnect_session(&mut inner, id, DisconnectReason::Closed);
        }
        log::info!("Dispatcher on {} closed", self.local_addr);
        Ok(())
    }

    /// Installs a callback consulted for every received payload. Returning
    /// `false` drops the payload and withholds the acknowledgement of the
    /// datagram that carried it. Reliable payloads are seen as fragments.
    pub fn set_receive_filter<F>(&self, filter: F) -> Result<()>
    where
        F: FnMut(SessionId, Protocol, &[u8]) -> bool + Send + 'static,
    {
        self.lock()?.filter = Some(Box::new(filter));
        Ok(())
    }

    pub fn clear_receive_filter(&self) -> Result<()> {
        self.lock()?.filter = None;
        Ok(())
    }

    pub fn sessions(&self) -> Result<Vec<SessionId>> {
        Ok(self.lock()?.registry.ids())
    }

    pub fn endpoints(&self) -> Result<Vec<SocketAddr>> {
        let inner = self.lock()?;
        Ok(inner
            .registry
            .ids()
            .into_iter()
            .filter_map(|id| inner.registry.get(id).map(|slot| slot.session.addr()))
            .collect())
    }

    pub fn latencies(&self) -> Result<Vec<(SessionId, Duration)>> {
        let inner = self.lock()?;
        Ok(inner
            .registry
            .ids()
            .into_iter()
            .filter_map(|id| inner.registry.get(id).map(|slot| (id, slot.session.latency())))
            .collect())
    }

    pub fn session_info(&self, session: SessionId) -> Result<SessionInfo> {
        let inner = self.lock()?;
        let slot = inner
            .registry
            .get(session)
            .ok_or(TransportError::UnknownSession(session))?;
        let s = &slot.session;

        Ok(SessionInfo {
            id: session,
            addr: s.addr(),
            group: s.group().to_string(),
            state: s.state(),
            latency: s.latency(),
            mean_rtt_ms: s.mean_rtt_ms(),
            flow_mode: s.flow_mode(),
            penalty_secs: s.penalty_secs(),
            disconnect_accumulator: s.disconnect_accumulator(),
            has_received_packet: s.has_received_packet(),
            in_flight: s.in_flight(),
            reliable_queued: slot.reliability.queued(),
        })
    }

    pub fn group_members(&self, group: &str) -> Result<Vec<SessionId>> {
        let inner = self.lock()?;
        inner
            .registry
            .group(group)
            .map(|g| g.members().to_vec())
            .ok_or_else(|| TransportError::UnknownGroup(group.to_string()))
    }

    pub fn groups(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.registry.group_identifiers())
    }

    pub fn endpoint_state(&self, addr: SocketAddr) -> Result<EndpointState> {
        Ok(self.lock()?.registry.endpoint_state(&addr))
    }

    pub fn stats(&self) -> Result<NetworkStats> {
        Ok(self.lock()?.stats.clone())
    }

    /// Bytes sent since the previous call.
    pub fn take_bytes_sent(&self) -> Result<u64> {
        Ok(std::mem::take(&mut self.lock()?.stats.bytes_sent))
    }

    /// Bytes received since the previous call.
    pub fn take_bytes_received(&self) -> Result<u64> {
        Ok(std::mem::take(&mut self.lock()?.stats.bytes_received))
    }
}

fn disconnect_session(inner: &mut Inner, id: SessionId, reason: DisconnectReason) -> Option<()> {
    let slot = inner.registry.remove(id)?;
    let addr = slot.session.addr();
    inner.registry.blacklist(addr);

    log::info!("Session {} ({}) {}", id, addr, reason.as_str());
    inner.events.push_back(DispatcherEvent::Disconnected {
        session: id,
        addr,
        reason,
    });
    Some(())
}

fn reliable_event(session: SessionId, event: ReliableEvent) -> DispatcherEvent {
    match event {
        ReliableEvent::Received(payload) => DispatcherEvent::MessageReceived {
            session,
            payload,
            reliable: true,
        },
        ReliableEvent::Acknowledged(payload) => DispatcherEvent::MessageAcknowledged {
            session,
            payload,
            reliable: true,
        },
        ReliableEvent::SendProgress(progress) => {
            DispatcherEvent::ReliableSendProgress { session, progress }
        }
        ReliableEvent::ReceiveProgress(progress) => {
            DispatcherEvent::ReliableReceiveProgress { session, progress }
        }
    }
}

struct CountingSink<'a> {
    socket: &'a UdpSocket,
    stats: &'a mut NetworkStats,
}

impl DatagramSink for CountingSink<'_> {
    fn send_datagram(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        let sent = self.socket.send_to(data, addr)?;
        self.stats.record_sent(sent);
        Ok(sent)
    }
}

/// Routes one session's events: realtime traffic goes straight to the
/// dispatcher queue, reliable fragments go through the overlay.
struct SlotHandler<'a> {
    session: SessionId,
    overlay: &'a mut ReliabilityOverlay,
    events: &'a mut VecDeque<DispatcherEvent>,
    filter: &'a mut Option<ReceiveFilter>,
    lost: u64,
    corrupt: Option<TransportError>,
}

impl SessionHandler for SlotHandler<'_> {
    fn handle(&mut self, event: SessionEvent) {
        let session = self.session;
        match event {
            SessionEvent::Sent {
                protocol: Protocol::Realtime,
                payload,
            } => self
                .events
                .push_back(DispatcherEvent::MessageSent { session, payload }),
            SessionEvent::Sent { .. } => {}
            SessionEvent::Received {
                protocol: Protocol::Realtime,
                payload,
            } => self.events.push_back(DispatcherEvent::MessageReceived {
                session,
                payload,
                reliable: false,
            }),
            SessionEvent::Received { payload, .. } => {
                if let Err(err) = self.overlay.on_received(&payload) {
                    log::warn!("Session {} discarded reliable message: {}", session, err);
                    self.corrupt.get_or_insert(err);
                }
            }
            SessionEvent::Acknowledged {
                protocol: Protocol::Realtime,
                payload,
            } => self.events.push_back(DispatcherEvent::MessageAcknowledged {
                session,
                payload,
                reliable: false,
            }),
            SessionEvent::Acknowledged { payload, .. } => self.overlay.on_acknowledged(&payload),
            SessionEvent::Lost {
                protocol: Protocol::Realtime,
                payload,
            } => {
                self.lost += 1;
                self.events
                    .push_back(DispatcherEvent::MessageLost { session, payload });
            }
            SessionEvent::Lost { payload, .. } => {
                self.lost += 1;
                self.overlay.on_lost(&payload);
            }
            SessionEvent::DisconnectWarning {
                accumulator,
                limit,
                disconnected,
            } => {
                log::debug!(
                    "Session {} silent for {} of {} ticks",
                    session,
                    accumulator,
                    limit
                );
                self.events.push_back(DispatcherEvent::DisconnectWarning {
                    session,
                    accumulator,
                    limit,
                    disconnected,
                });
            }
            SessionEvent::FlowControlChanged { mode, penalty_secs } => {
                self.events.push_back(DispatcherEvent::FlowControlChanged {
                    session,
                    mode,
                    penalty_secs,
                });
            }
        }
    }

    fn accept(&mut self, protocol: Protocol, payload: &[u8]) -> bool {
        match self.filter.as_mut() {
            Some(filter) => filter(self.session, protocol, payload),
            None => true,
        }
    }
}
