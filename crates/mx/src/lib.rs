pub mod codec;
pub mod config;
pub mod error;
pub mod net;
pub mod sync;

pub use codec::{CodecError, DecodedMessage, MessageCodec, NetworkMessage, archive, unarchive};
pub use config::TransportConfig;
pub use error::TransportError;
pub use net::{
    ConnectionState, DEFAULT_PORT, DisconnectReason, Dispatcher, DispatcherEvent, EndpointState,
    FlowMode, NetworkStats, Protocol, SessionGroup, SessionId, SessionInfo, Target,
    TransferProgress, WireMessage, probe,
};
pub use sync::{
    Angle, InputPrediction, InterpolatedTimeMachine, Interpolate, PredictionError, TimeMachine,
    Transform,
};
