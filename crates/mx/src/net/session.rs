use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use crate::config::TransportConfig;

use super::endpoint::is_transient;
use super::events::{SessionEvent, SessionHandler};
use super::flow::{FlowControl, FlowMode};
use super::protocol::{Protocol, WireMessage};
use super::sequence::{ACK_WINDOW, sequence_distance};
use super::tracking::{AckOutcome, InFlight, ReceiveHistory, RttWindow, SendLedger};

/// Sends owed after a stall are capped at this many intervals.
const MAX_SEND_BURST: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created by an explicit connect, nothing heard back yet.
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Alive,
    TimedOut,
}

/// Where a session writes its encoded wire messages.
pub trait DatagramSink {
    fn send_datagram(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize>;
}

impl DatagramSink for UdpSocket {
    fn send_datagram(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.send_to(data, addr)
    }
}

/// Per-endpoint transport state: sequencing, acknowledgement bookkeeping,
/// flow control and the disconnect timeout.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    addr: SocketAddr,
    group: String,
    state: ConnectionState,
    config: TransportConfig,
    epoch: u32,
    remote_epoch: Option<u32>,
    local_sequence: u32,
    remote_sequence: u32,
    pending_realtime: VecDeque<Vec<u8>>,
    pending_reliable: VecDeque<Vec<u8>>,
    ledger: SendLedger,
    rtt: RttWindow,
    receive_history: ReceiveHistory,
    received: VecDeque<Vec<u8>>,
    disconnect_accumulator: u32,
    flow: FlowControl,
    send_accumulator: Duration,
    last_update: Option<Instant>,
    latency: Duration,
    has_received_packet: bool,
}

impl Session {
    pub fn new(id: SessionId, addr: SocketAddr, config: TransportConfig) -> Self {
        let flow = FlowControl::new(&config);
        Self {
            id,
            addr,
            group: String::new(),
            state: ConnectionState::Connecting,
            epoch: rand::random(),
            remote_epoch: None,
            local_sequence: 0,
            remote_sequence: u32::MAX,
            pending_realtime: VecDeque::new(),
            pending_reliable: VecDeque::new(),
            ledger: SendLedger::new(),
            rtt: RttWindow::new(),
            receive_history: ReceiveHistory::new(),
            received: VecDeque::new(),
            disconnect_accumulator: 0,
            // The first update sends straight away.
            send_accumulator: flow.send_interval(),
            flow,
            last_update: None,
            latency: Duration::ZERO,
            has_received_packet: false,
            config,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub(crate) fn set_group(&mut self, group: &str) {
        self.group = group.to_string();
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn latency(&self) -> Duration {
        self.latency
    }

    pub fn mean_rtt_ms(&self) -> f64 {
        self.rtt.mean_ms()
    }

    pub fn flow_mode(&self) -> FlowMode {
        self.flow.mode()
    }

    pub fn penalty_secs(&self) -> f64 {
        self.flow.penalty_secs()
    }

    pub fn disconnect_accumulator(&self) -> u32 {
        self.disconnect_accumulator
    }

    pub fn has_received_packet(&self) -> bool {
        self.has_received_packet
    }

    pub fn local_sequence(&self) -> u32 {
        self.local_sequence
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn remote_sequence(&self) -> u32 {
        self.remote_sequence
    }

    pub fn in_flight(&self) -> usize {
        self.ledger.len()
    }

    pub fn pending_reliable(&self) -> usize {
        self.pending_reliable.len()
    }

    /// Buffers a raw datagram for the next update.
    pub fn enqueue_receive(&mut self, datagram: Vec<u8>) {
        self.received.push_back(datagram);
    }

    pub fn enqueue_send(&mut self, payload: Vec<u8>, protocol: Protocol) {
        match protocol {
            Protocol::Realtime => self.pending_realtime.push_back(payload),
            Protocol::Reliable => self.pending_reliable.push_back(payload),
        }
    }

    pub fn update(
        &mut self,
        sink: &mut impl DatagramSink,
        handler: &mut impl SessionHandler,
    ) -> SessionStatus {
        self.update_at(Instant::now(), sink, handler)
    }

    pub fn update_at(
        &mut self,
        now: Instant,
        sink: &mut impl DatagramSink,
        handler: &mut impl SessionHandler,
    ) -> SessionStatus {
        let delta = self
            .last_update
            .map_or(Duration::ZERO, |last| now.saturating_duration_since(last));
        self.last_update = Some(now);

        let limit = self.config.disconnect_limit;
        if self.disconnect_accumulator > self.config.disconnect_warning_limit {
            handler.handle(SessionEvent::DisconnectWarning {
                accumulator: self.disconnect_accumulator,
                limit,
                disconnected: self.disconnect_accumulator > limit,
            });
        }
        if self.disconnect_accumulator > limit {
            return SessionStatus::TimedOut;
        }

        if let Some(change) = self.flow.update(self.rtt.mean_ms(), delta) {
            log::debug!(
                "Session {} flow control now {:?} (penalty {}s)",
                self.id,
                change.mode,
                change.penalty_secs
            );
            handler.handle(SessionEvent::FlowControlChanged {
                mode: change.mode,
                penalty_secs: change.penalty_secs,
            });
        }

        for (sequence, message) in self.ledger.expire(now, self.config.message_timeout) {
            log::trace!("Session {} message {} timed out", self.id, sequence);
            report_lost(message, handler);
        }

        self.perform_send(now, delta, sink, handler);
        self.perform_receive(now, handler);

        SessionStatus::Alive
    }

    fn perform_send(
        &mut self,
        now: Instant,
        delta: Duration,
        sink: &mut impl DatagramSink,
        handler: &mut impl SessionHandler,
    ) {
        let interval = self.flow.send_interval();
        self.send_accumulator = (self.send_accumulator + delta).min(interval * MAX_SEND_BURST);

        while self.send_accumulator >= interval {
            self.send_accumulator -= interval;

            let payloads: Vec<Vec<u8>> = self.pending_realtime.drain(..).collect();
            if let Err(payloads) = self.send_message(Protocol::Realtime, payloads, now, sink, handler)
            {
                for payload in payloads.into_iter().rev() {
                    self.pending_realtime.push_front(payload);
                }
                return;
            }

            if let Some(head) = self.pending_reliable.front().cloned() {
                if self
                    .send_message(Protocol::Reliable, vec![head], now, sink, handler)
                    .is_err()
                {
                    return;
                }
                self.pending_reliable.pop_front();
            }
        }
    }

    /// Encodes and writes one wire message. On a transient socket error the
    /// payloads are handed back so the caller can keep them queued.
    fn send_message(
        &mut self,
        protocol: Protocol,
        payloads: Vec<Vec<u8>>,
        now: Instant,
        sink: &mut impl DatagramSink,
        handler: &mut impl SessionHandler,
    ) -> Result<(), Vec<Vec<u8>>> {
        let message = WireMessage::new(
            protocol,
            self.local_sequence,
            self.remote_sequence,
            self.receive_history.bitfield(),
        )
        .with_epoch(self.epoch)
        .with_payloads(payloads);

        let data = match message.serialize() {
            Ok(data) => data,
            Err(err) => {
                log::warn!("Session {} failed to encode message: {}", self.id, err);
                report_lost(into_in_flight(message, now), handler);
                return Ok(());
            }
        };

        if protocol == Protocol::Realtime && data.len() > self.config.safe_datagram_size {
            log::warn!(
                "Session {} realtime message is {} bytes, above the safe size of {}",
                self.id,
                data.len(),
                self.config.safe_datagram_size
            );
        }

        match sink.send_datagram(&data, self.addr) {
            Ok(_) => {}
            Err(err) if is_transient(&err) => {
                log::debug!("Session {} send deferred: {}", self.id, err);
                return Err(message.payloads);
            }
            Err(err) => {
                log::warn!("Session {} send to {} failed: {}", self.id, self.addr, err);
                if protocol == Protocol::Realtime {
                    report_lost(into_in_flight(message, now), handler);
                    return Ok(());
                }
                return Err(message.payloads);
            }
        }

        let sequence = self.local_sequence;
        self.local_sequence = self.local_sequence.wrapping_add(1);

        for payload in &message.payloads {
            handler.handle(SessionEvent::Sent {
                protocol,
                payload: payload.clone(),
            });
        }
        self.ledger.track(sequence, into_in_flight(message, now));
        Ok(())
    }

    fn perform_receive(&mut self, now: Instant, handler: &mut impl SessionHandler) {
        if self.received.is_empty() {
            self.disconnect_accumulator = self.disconnect_accumulator.saturating_add(1);
            return;
        }

        while let Some(datagram) = self.received.pop_front() {
            self.disconnect_accumulator = 0;
            self.has_received_packet = true;
            self.state = ConnectionState::Connected;

            let message = match WireMessage::deserialize(&datagram) {
                Ok(message) => message,
                Err(err) => {
                    log::warn!("Session {} dropped undecodable datagram: {}", self.id, err);
                    continue;
                }
            };
            // Validated by deserialize.
            let Ok(protocol) = message.protocol() else {
                continue;
            };

            if self.remote_epoch != Some(message.epoch) {
                if self.remote_epoch.is_some() {
                    log::info!("Session {} peer at {} started a new session", self.id, self.addr);
                    self.remote_sequence = u32::MAX;
                    self.receive_history = ReceiveHistory::new();
                }
                self.remote_epoch = Some(message.epoch);
            }

            let distance = sequence_distance(message.sequence, self.remote_sequence);
            if distance <= 0 {
                log::trace!(
                    "Session {} ignored stale message {} (remote {})",
                    self.id,
                    message.sequence,
                    self.remote_sequence
                );
                continue;
            }

            for _ in 1..distance.min(ACK_WINDOW as i32 + 1) {
                self.receive_history.push(false);
            }

            for outcome in self.ledger.process_ack(message.ack, message.ack_bitfield, now) {
                match outcome {
                    AckOutcome::Acknowledged { rtt, message, .. } => {
                        self.rtt.push(rtt);
                        self.latency = rtt;
                        for payload in message.payloads {
                            handler.handle(SessionEvent::Acknowledged {
                                protocol: message.protocol,
                                payload,
                            });
                        }
                    }
                    AckOutcome::Lost { message, .. } => report_lost(message, handler),
                }
            }

            self.remote_sequence = message.sequence;

            let mut accepted = true;
            for payload in message.payloads {
                if handler.accept(protocol, &payload) {
                    handler.handle(SessionEvent::Received { protocol, payload });
                } else {
                    accepted = false;
                }
            }
            self.receive_history.push(accepted);
        }
    }
}

fn into_in_flight(message: WireMessage, now: Instant) -> InFlight {
    let protocol = message.protocol().unwrap_or(Protocol::Realtime);
    InFlight {
        send_time: now,
        protocol,
        payloads: message.payloads,
    }
}

fn report_lost(message: InFlight, handler: &mut impl SessionHandler) {
    for payload in message.payloads {
        handler.handle(SessionEvent::Lost {
            protocol: message.protocol,
            payload,
        });
    }
}
