use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

use super::sequence::ack_offset;

pub const REALTIME_PROTOCOL: u32 = 0x4D58_5254;
pub const RELIABLE_PROTOCOL: u32 = 0x4D58_524C;

/// Datagrams above this size risk IP fragmentation on the way.
pub const SAFE_DATAGRAM_SIZE: usize = 512;
pub const MAX_DATAGRAM_SIZE: usize = 65_507;
pub const DEFAULT_PORT: u16 = 27015;

pub const PROBE_REQUEST: [u8; 2] = [0x12, 0x34];
pub const PROBE_RESPONSE: [u8; 2] = [0x56, 0x78];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Realtime,
    Reliable,
}

impl Protocol {
    pub fn tag(self) -> u32 {
        match self {
            Protocol::Realtime => REALTIME_PROTOCOL,
            Protocol::Reliable => RELIABLE_PROTOCOL,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            REALTIME_PROTOCOL => Some(Protocol::Realtime),
            RELIABLE_PROTOCOL => Some(Protocol::Reliable),
            _ => None,
        }
    }

    pub fn is_reliable(self) -> bool {
        matches!(self, Protocol::Reliable)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct WireMessage {
    pub protocol: u32,
    /// Random per sending session; a change means the peer started over.
    pub epoch: u32,
    pub sequence: u32,
    pub ack: u32,
    pub ack_bitfield: u32,
    pub payloads: Vec<Vec<u8>>,
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
    #[error("unknown protocol tag {0:#010x}")]
    UnknownProtocol(u32),
}

impl WireMessage {
    pub fn new(protocol: Protocol, sequence: u32, ack: u32, ack_bitfield: u32) -> Self {
        Self {
            protocol: protocol.tag(),
            epoch: 0,
            sequence,
            ack,
            ack_bitfield,
            payloads: Vec::new(),
        }
    }

    pub fn with_epoch(mut self, epoch: u32) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn with_payloads(mut self, payloads: Vec<Vec<u8>>) -> Self {
        self.payloads = payloads;
        self
    }

    pub fn protocol(&self) -> Result<Protocol, PacketError> {
        Protocol::from_tag(self.protocol).ok_or(PacketError::UnknownProtocol(self.protocol))
    }

    /// Whether `sequence` falls inside the window acknowledged by this message.
    pub fn has_ack(&self, sequence: u32) -> bool {
        ack_offset(self.ack, sequence).is_some()
    }

    /// Acknowledgement state of `sequence`, `None` when outside the window.
    pub fn did_ack(&self, sequence: u32) -> Option<bool> {
        ack_offset(self.ack, sequence).map(|offset| self.ack_bitfield & (1 << offset) != 0)
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(PacketError::Serialize)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, PacketError> {
        // Receive buffers carry no alignment guarantee.
        let mut aligned = AlignedVec::<16>::with_capacity(data.len());
        aligned.extend_from_slice(data);

        let message = rkyv::from_bytes::<Self, rancor::Error>(&aligned)
            .map_err(PacketError::Deserialize)?;
        message.protocol()?;
        Ok(message)
    }
}
