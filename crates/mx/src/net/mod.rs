mod dispatcher;
mod endpoint;
mod events;
mod flow;
mod group;
mod protocol;
mod registry;
mod reliability;
mod sequence;
mod session;
mod stats;
mod tracking;

pub use dispatcher::{Dispatcher, SessionInfo, Target};
pub use endpoint::{bind_nonblocking, is_transient, probe, probe_with};
pub use events::{
    DisconnectReason, DispatcherEvent, SessionEvent, SessionHandler, TransferProgress,
};
pub use flow::{FlowControl, FlowControlChange, FlowMode};
pub use group::SessionGroup;
pub use protocol::{
    DEFAULT_PORT, MAX_DATAGRAM_SIZE, PROBE_REQUEST, PROBE_RESPONSE, PacketError, Protocol,
    RELIABLE_PROTOCOL, REALTIME_PROTOCOL, SAFE_DATAGRAM_SIZE, WireMessage,
};
pub use registry::EndpointState;
pub use reliability::{
    FRAGMENT_HEADER_LEN, FragmentHeader, FragmentStatus, MAX_FRAGMENT_DATA, MAX_FRAGMENTS,
    MAX_RELIABLE_PAYLOAD, ReliabilityOverlay, ReliableEvent, fragment,
};
pub use sequence::{ACK_WINDOW, ack_offset, sequence_distance, sequence_greater_than};
pub use session::{ConnectionState, DatagramSink, Session, SessionId, SessionStatus};
pub use stats::NetworkStats;
pub use tracking::{AckOutcome, InFlight, ReceiveHistory, RttWindow, SendLedger};
