use std::io;

use thiserror::Error;

use crate::net::SessionId;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("dispatcher is closed")]
    Closed,
    #[error("the ungrouped group cannot be targeted")]
    UngroupedTarget,
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("unknown group {0:?}")]
    UnknownGroup(String),
    #[error("corrupt reliable message: {reason}")]
    CorruptMessage { reason: &'static str },
    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T, E = TransportError> = std::result::Result<T, E>;
