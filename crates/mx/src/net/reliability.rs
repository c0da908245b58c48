use std::collections::VecDeque;

use crate::error::TransportError;

use super::events::TransferProgress;
use super::protocol::{Protocol, SAFE_DATAGRAM_SIZE};
use super::sequence::sequence_distance;
use super::session::Session;

pub const FRAGMENT_HEADER_LEN: usize = 12;
pub const MAX_FRAGMENT_DATA: usize = SAFE_DATAGRAM_SIZE - FRAGMENT_HEADER_LEN;
pub const MAX_FRAGMENTS: usize = 254;
pub const MAX_RELIABLE_PAYLOAD: usize = MAX_FRAGMENT_DATA * MAX_FRAGMENTS;

/// Fragment header: sender epoch (u32 LE), message id (u32 LE), data length
/// (u16 LE), index, total.
///
/// The epoch is picked per overlay, so message ids from a reconnected peer
/// never collide with ids already completed for its previous overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub epoch: u32,
    pub message_id: u32,
    pub length: u16,
    pub index: u8,
    pub total: u8,
}

impl FragmentHeader {
    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.epoch.to_le_bytes());
        out.extend_from_slice(&self.message_id.to_le_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
        out.push(self.index);
        out.push(self.total);
    }

    /// Parses and validates a fragment, returning its header and data.
    pub fn parse(fragment: &[u8]) -> Result<(Self, &[u8]), TransportError> {
        if fragment.len() < FRAGMENT_HEADER_LEN {
            return Err(corrupt("fragment shorter than its header"));
        }

        let header = Self {
            epoch: u32::from_le_bytes([fragment[0], fragment[1], fragment[2], fragment[3]]),
            message_id: u32::from_le_bytes([fragment[4], fragment[5], fragment[6], fragment[7]]),
            length: u16::from_le_bytes([fragment[8], fragment[9]]),
            index: fragment[10],
            total: fragment[11],
        };

        if header.total == 0 {
            return Err(corrupt("fragment total is zero"));
        }
        if header.index >= header.total {
            return Err(corrupt("fragment index out of bounds"));
        }

        let body = &fragment[FRAGMENT_HEADER_LEN..];
        let length = header.length as usize;
        if length > body.len() {
            return Err(corrupt("fragment length exceeds its body"));
        }

        Ok((header, &body[..length]))
    }
}

fn corrupt(reason: &'static str) -> TransportError {
    TransportError::CorruptMessage { reason }
}

/// Splits `payload` into header-prefixed fragments of at most
/// [`SAFE_DATAGRAM_SIZE`] bytes. An empty payload becomes one empty fragment.
pub fn fragment(epoch: u32, message_id: u32, payload: &[u8]) -> Result<Vec<Vec<u8>>, TransportError> {
    check_payload(payload)?;

    let chunks: Vec<&[u8]> = if payload.is_empty() {
        vec![payload]
    } else {
        payload.chunks(MAX_FRAGMENT_DATA).collect()
    };
    let total = chunks.len() as u8;

    Ok(chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| {
            let mut out = Vec::with_capacity(FRAGMENT_HEADER_LEN + chunk.len());
            FragmentHeader {
                epoch,
                message_id,
                length: chunk.len() as u16,
                index: index as u8,
                total,
            }
            .write(&mut out);
            out.extend_from_slice(chunk);
            out
        })
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentStatus {
    WaitingOnSend,
    WaitingOnAck,
    Acknowledged,
}

#[derive(Debug)]
struct OutgoingMessage {
    id: u32,
    payload: Vec<u8>,
    fragments: Vec<Vec<u8>>,
    status: Vec<FragmentStatus>,
}

impl OutgoingMessage {
    fn acknowledged(&self) -> usize {
        self.status
            .iter()
            .filter(|s| **s == FragmentStatus::Acknowledged)
            .count()
    }

    fn progress(&self) -> TransferProgress {
        TransferProgress {
            current_fragments: self.acknowledged() as u32,
            total_fragments: self.fragments.len() as u32,
            total_size: self.payload.len(),
            is_sending: true,
        }
    }
}

#[derive(Debug)]
struct IncomingMessage {
    id: u32,
    slots: Vec<Option<Vec<u8>>>,
}

impl IncomingMessage {
    fn new(id: u32, total: u8) -> Self {
        Self {
            id,
            slots: vec![None; total as usize],
        }
    }

    fn received(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn received_bytes(&self) -> usize {
        self.slots.iter().flatten().map(Vec::len).sum()
    }

    fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    fn reconstruct(self) -> Vec<u8> {
        self.slots.into_iter().flatten().flatten().collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReliableEvent {
    Received(Vec<u8>),
    Acknowledged(Vec<u8>),
    SendProgress(TransferProgress),
    ReceiveProgress(TransferProgress),
}

/// Reliable delivery on top of one session's reliable channel.
///
/// Outgoing payloads are fragmented and sent one message at a time. Every
/// fragment is resent until the session reports its wire message as
/// acknowledged. Incoming fragments are reassembled per message id; a new
/// sender epoch starts reassembly and duplicate tracking over.
#[derive(Debug)]
pub struct ReliabilityOverlay {
    epoch: u32,
    remote_epoch: Option<u32>,
    next_message_id: u32,
    queue: VecDeque<Vec<u8>>,
    current: Option<OutgoingMessage>,
    incoming: Option<IncomingMessage>,
    last_completed: Option<u32>,
    events: VecDeque<ReliableEvent>,
}

impl Default for ReliabilityOverlay {
    fn default() -> Self {
        Self::new()
    }
}

impl ReliabilityOverlay {
    pub fn new() -> Self {
        Self::with_epoch(rand::random())
    }

    pub fn with_epoch(epoch: u32) -> Self {
        Self {
            epoch,
            remote_epoch: None,
            next_message_id: 0,
            queue: VecDeque::new(),
            current: None,
            incoming: None,
            last_completed: None,
            events: VecDeque::new(),
        }
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Queues a payload for reliable delivery.
    pub fn send(&mut self, payload: Vec<u8>) -> Result<(), TransportError> {
        check_payload(&payload)?;
        self.queue.push_back(payload);
        Ok(())
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none() && self.queue.is_empty()
    }

    pub fn queued(&self) -> usize {
        self.queue.len() + usize::from(self.current.is_some())
    }

    pub fn fragment_status(&self) -> Vec<FragmentStatus> {
        self.current
            .as_ref()
            .map(|m| m.status.clone())
            .unwrap_or_default()
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ReliableEvent> + '_ {
        self.events.drain(..)
    }

    /// Starts the next queued message if idle and hands every fragment that
    /// is waiting on a send to the session.
    pub fn update(&mut self, session: &mut Session) {
        if self.current.is_none() {
            self.activate_next();
        }

        let Some(current) = self.current.as_mut() else {
            return;
        };

        for (fragment, status) in current.fragments.iter().zip(current.status.iter_mut()) {
            if *status == FragmentStatus::WaitingOnSend {
                session.enqueue_send(fragment.clone(), Protocol::Reliable);
                *status = FragmentStatus::WaitingOnAck;
            }
        }
    }

    fn activate_next(&mut self) {
        let Some(payload) = self.queue.pop_front() else {
            return;
        };

        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);

        // Size was checked on send.
        let fragments = match fragment(self.epoch, id, &payload) {
            Ok(fragments) => fragments,
            Err(err) => {
                log::warn!("Dropping reliable message {}: {}", id, err);
                return;
            }
        };

        let message = OutgoingMessage {
            id,
            status: vec![FragmentStatus::WaitingOnSend; fragments.len()],
            fragments,
            payload,
        };
        log::trace!(
            "Reliable message {} started with {} fragments",
            id,
            message.fragments.len()
        );
        self.events.push_back(ReliableEvent::SendProgress(message.progress()));
        self.current = Some(message);
    }

    pub fn on_acknowledged(&mut self, fragment: &[u8]) {
        let Ok((header, _)) = FragmentHeader::parse(fragment) else {
            return;
        };
        let Some(current) = self.current.as_mut() else {
            return;
        };
        if header.epoch != self.epoch || current.id != header.message_id {
            return;
        }
        let Some(status) = current.status.get_mut(header.index as usize) else {
            return;
        };
        if *status == FragmentStatus::Acknowledged {
            return;
        }

        *status = FragmentStatus::Acknowledged;
        let progress = current.progress();
        self.events.push_back(ReliableEvent::SendProgress(progress));

        if progress.is_complete() {
            if let Some(done) = self.current.take() {
                log::trace!("Reliable message {} acknowledged", done.id);
                self.events.push_back(ReliableEvent::Acknowledged(done.payload));
            }
        }
    }

    pub fn on_lost(&mut self, fragment: &[u8]) {
        let Ok((header, _)) = FragmentHeader::parse(fragment) else {
            return;
        };
        let Some(current) = self.current.as_mut() else {
            return;
        };
        if header.epoch != self.epoch || current.id != header.message_id {
            return;
        }
        if let Some(status) = current.status.get_mut(header.index as usize) {
            if *status == FragmentStatus::WaitingOnAck {
                *status = FragmentStatus::WaitingOnSend;
            }
        }
    }

    pub fn on_received(&mut self, fragment: &[u8]) -> Result<(), TransportError> {
        let (header, data) = match FragmentHeader::parse(fragment) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.incoming = None;
                return Err(err);
            }
        };

        if self.remote_epoch != Some(header.epoch) {
            if self.remote_epoch.is_some() {
                log::debug!("Reliable sender epoch changed to {:#010x}", header.epoch);
            }
            self.remote_epoch = Some(header.epoch);
            self.last_completed = None;
            self.incoming = None;
        }

        if self
            .last_completed
            .is_some_and(|done| sequence_distance(header.message_id, done) <= 0)
        {
            return Ok(());
        }

        let incoming = match self.incoming.take() {
            Some(incoming) if incoming.id == header.message_id => {
                if incoming.slots.len() != header.total as usize {
                    return Err(corrupt("fragment total changed mid-message"));
                }
                incoming
            }
            Some(incoming) if sequence_distance(header.message_id, incoming.id) < 0 => {
                self.incoming = Some(incoming);
                return Ok(());
            }
            _ => IncomingMessage::new(header.message_id, header.total),
        };
        let incoming = self.incoming.insert(incoming);

        let slot = &mut incoming.slots[header.index as usize];
        if slot.is_some() {
            return Ok(());
        }
        *slot = Some(data.to_vec());

        self.events.push_back(ReliableEvent::ReceiveProgress(TransferProgress {
            current_fragments: incoming.received() as u32,
            total_fragments: incoming.slots.len() as u32,
            total_size: incoming.received_bytes(),
            is_sending: false,
        }));

        if incoming.is_complete() {
            if let Some(done) = self.incoming.take() {
                self.last_completed = Some(done.id);
                self.events.push_back(ReliableEvent::Received(done.reconstruct()));
            }
        }

        Ok(())
    }
}

/// Rejects payloads that cannot be carried in [`MAX_FRAGMENTS`] fragments.
pub fn check_payload(payload: &[u8]) -> Result<(), TransportError> {
    if payload.len() > MAX_RELIABLE_PAYLOAD {
        return Err(TransportError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_RELIABLE_PAYLOAD,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::net::session::SessionId;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn session() -> Session {
        Session::new(
            SessionId(1),
            "127.0.0.1:9100".parse().unwrap(),
            TransportConfig::default(),
        )
    }

    fn events(overlay: &mut ReliabilityOverlay) -> Vec<ReliableEvent> {
        overlay.drain_events().collect()
    }

    #[test]
    fn test_fragment_sizes() {
        let fragments = fragment(9, 3, &payload(1200)).unwrap();

        assert_eq!(fragments.len(), 3);
        assert!(fragments.iter().all(|f| f.len() <= SAFE_DATAGRAM_SIZE));
        assert_eq!(fragments[2].len(), FRAGMENT_HEADER_LEN + 1200 - 2 * MAX_FRAGMENT_DATA);

        let (header, data) = FragmentHeader::parse(&fragments[1]).unwrap();
        assert_eq!(header.epoch, 9);
        assert_eq!(header.message_id, 3);
        assert_eq!(header.index, 1);
        assert_eq!(header.total, 3);
        assert_eq!(data.len(), MAX_FRAGMENT_DATA);
    }

    #[test]
    fn test_empty_payload_is_one_fragment() {
        let fragments = fragment(1, 0, &[]).unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].len(), FRAGMENT_HEADER_LEN);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut overlay = ReliabilityOverlay::new();
        assert!(overlay.send(payload(MAX_RELIABLE_PAYLOAD)).is_ok());
        assert!(matches!(
            overlay.send(payload(MAX_RELIABLE_PAYLOAD + 1)),
            Err(TransportError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_header_validation() {
        let mut fragment = Vec::new();
        FragmentHeader {
            epoch: 1,
            message_id: 1,
            length: 4,
            index: 2,
            total: 2,
        }
        .write(&mut fragment);
        fragment.extend_from_slice(b"data");

        assert!(matches!(
            FragmentHeader::parse(&fragment),
            Err(TransportError::CorruptMessage { .. })
        ));
        assert!(FragmentHeader::parse(&[1, 2, 3]).is_err());

        fragment[10] = 0;
        fragment[8] = 9;
        assert!(FragmentHeader::parse(&fragment).is_err());
    }

    #[test]
    fn test_reassembly_out_of_order() {
        let data = payload(1500);
        let fragments = fragment(1, 0, &data).unwrap();
        let mut overlay = ReliabilityOverlay::new();

        for fragment in fragments.iter().rev() {
            overlay.on_received(fragment).unwrap();
        }

        let events = events(&mut overlay);
        assert_eq!(events.len(), 4);
        let ReliableEvent::ReceiveProgress(progress) = &events[2] else {
            panic!("expected progress, got {:?}", events[2]);
        };
        assert_eq!(progress.current_fragments, 3);
        assert_eq!(progress.total_size, data.len());
        assert_eq!(events[3], ReliableEvent::Received(data));
    }

    #[test]
    fn test_duplicates_ignored_after_completion() {
        let fragments = fragment(1, 0, b"hello-world").unwrap();
        let mut overlay = ReliabilityOverlay::new();

        overlay.on_received(&fragments[0]).unwrap();
        overlay.on_received(&fragments[0]).unwrap();

        let received = events(&mut overlay)
            .into_iter()
            .filter(|e| matches!(e, ReliableEvent::Received(_)))
            .count();
        assert_eq!(received, 1);
    }

    #[test]
    fn test_newer_message_discards_partial() {
        let old = fragment(1, 0, &payload(1100)).unwrap();
        let new = fragment(1, 1, b"fresh").unwrap();
        let mut overlay = ReliabilityOverlay::new();

        overlay.on_received(&old[0]).unwrap();
        overlay.on_received(&new[0]).unwrap();
        overlay.on_received(&old[1]).unwrap();

        let received: Vec<_> = events(&mut overlay)
            .into_iter()
            .filter_map(|e| match e {
                ReliableEvent::Received(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(received, vec![b"fresh".to_vec()]);
    }

    #[test]
    fn test_total_mismatch_is_corrupt() {
        let first = fragment(1, 4, &payload(1100)).unwrap();
        let mut overlay = ReliabilityOverlay::new();
        overlay.on_received(&first[0]).unwrap();

        let mut forged = first[1].clone();
        forged[11] = 5;
        forged[10] = 1;

        assert!(matches!(
            overlay.on_received(&forged),
            Err(TransportError::CorruptMessage { .. })
        ));

        // The partial was discarded, so the rest never completes.
        overlay.on_received(&first[1]).unwrap();
        overlay.on_received(&first[2]).unwrap();
        assert!(
            !events(&mut overlay)
                .iter()
                .any(|e| matches!(e, ReliableEvent::Received(_)))
        );
    }

    #[test]
    fn test_send_flow_with_loss() {
        let data = payload(1200);
        let mut overlay = ReliabilityOverlay::new();
        let mut session = session();

        overlay.send(data.clone()).unwrap();
        overlay.send(b"next".to_vec()).unwrap();
        overlay.update(&mut session);

        assert_eq!(session.pending_reliable(), 3);
        assert_eq!(overlay.fragment_status(), vec![FragmentStatus::WaitingOnAck; 3]);

        let fragments = fragment(overlay.epoch(), 0, &data).unwrap();
        overlay.on_acknowledged(&fragments[0]);
        overlay.on_lost(&fragments[1]);
        overlay.on_acknowledged(&fragments[2]);
        assert_eq!(
            overlay.fragment_status(),
            vec![
                FragmentStatus::Acknowledged,
                FragmentStatus::WaitingOnSend,
                FragmentStatus::Acknowledged,
            ]
        );

        overlay.update(&mut session);
        assert_eq!(session.pending_reliable(), 4);

        overlay.on_acknowledged(&fragments[1]);
        let events = events(&mut overlay);
        assert!(matches!(
            events.first(),
            Some(ReliableEvent::SendProgress(TransferProgress { current_fragments: 0, total_fragments: 3, .. }))
        ));
        assert_eq!(events.last(), Some(&ReliableEvent::Acknowledged(data)));
        assert_eq!(overlay.queued(), 1);

        overlay.update(&mut session);
        assert_eq!(overlay.fragment_status(), vec![FragmentStatus::WaitingOnAck]);
    }

    #[test]
    fn test_stale_acknowledgement_ignored() {
        let mut overlay = ReliabilityOverlay::new();
        let mut session = session();
        overlay.send(b"a".to_vec()).unwrap();
        overlay.update(&mut session);

        let other = fragment(overlay.epoch(), 7, b"a").unwrap();
        overlay.on_acknowledged(&other[0]);

        assert_eq!(overlay.fragment_status(), vec![FragmentStatus::WaitingOnAck]);
    }

    #[test]
    fn test_acknowledgement_from_other_epoch_ignored() {
        let mut overlay = ReliabilityOverlay::with_epoch(5);
        let mut session = session();
        overlay.send(b"a".to_vec()).unwrap();
        overlay.update(&mut session);

        let foreign = fragment(6, 0, b"a").unwrap();
        overlay.on_acknowledged(&foreign[0]);
        assert_eq!(overlay.fragment_status(), vec![FragmentStatus::WaitingOnAck]);

        let own = fragment(5, 0, b"a").unwrap();
        overlay.on_acknowledged(&own[0]);
        assert!(overlay.is_idle());
    }

    #[test]
    fn test_new_epoch_restarts_message_ids() {
        let mut overlay = ReliabilityOverlay::new();

        let before = fragment(100, 0, b"one").unwrap();
        overlay.on_received(&before[0]).unwrap();
        // Same id from a reconnected sender.
        let after = fragment(200, 0, b"two").unwrap();
        overlay.on_received(&after[0]).unwrap();
        // A late duplicate from the new sender is still suppressed.
        overlay.on_received(&after[0]).unwrap();

        let received: Vec<_> = events(&mut overlay)
            .into_iter()
            .filter_map(|e| match e {
                ReliableEvent::Received(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(received, vec![b"one".to_vec(), b"two".to_vec()]);
    }
}
