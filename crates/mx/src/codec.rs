//! Tagged encoding of application messages, independent of the transport.
//!
//! An encoded message is one byte holding the tag length, the ASCII tag, then
//! the message body produced by [`NetworkMessage::encode`].

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;

use rkyv::api::high::{HighDeserializer, HighSerializer, HighValidator};
use rkyv::bytecheck::CheckBytes;
use rkyv::rancor;
use rkyv::ser::allocator::ArenaHandle;
use rkyv::util::AlignedVec;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("message type {type_name} is not registered")]
    NotRegistered { type_name: &'static str },
    #[error("unknown message type {0:?}")]
    UnknownMessageType(String),
    #[error("message is truncated")]
    Truncated,
    #[error("invalid message tag {0:?}")]
    InvalidTag(String),
    #[error("message type {0:?} is already registered")]
    Duplicate(&'static str),
    #[error("decoded {actual:?} but expected {expected}")]
    UnexpectedType {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("archive error: {0}")]
    Archive(#[from] rancor::Error),
}

/// An application message that can travel as a transport payload.
pub trait NetworkMessage: Any + Send + Sized {
    /// Wire tag, at most 255 ASCII bytes.
    const MESSAGE_TYPE: &'static str;

    fn encode(&self) -> Result<Vec<u8>, CodecError>;

    fn decode(bytes: &[u8]) -> Result<Self, CodecError>;
}

/// Encodes `value` as an rkyv archive.
pub fn archive<T>(value: &T) -> Result<Vec<u8>, CodecError>
where
    T: for<'a> rkyv::Serialize<HighSerializer<AlignedVec, ArenaHandle<'a>, rancor::Error>>,
{
    Ok(rkyv::to_bytes::<rancor::Error>(value)?.into_vec())
}

/// Validates and decodes an archive written by [`archive`].
pub fn unarchive<T>(bytes: &[u8]) -> Result<T, CodecError>
where
    T: rkyv::Archive,
    T::Archived: for<'a> CheckBytes<HighValidator<'a, rancor::Error>>
        + rkyv::Deserialize<T, HighDeserializer<rancor::Error>>,
{
    let mut aligned = AlignedVec::<16>::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);
    Ok(rkyv::from_bytes::<T, rancor::Error>(&aligned)?)
}

type Decoder = fn(&[u8]) -> Result<Box<dyn Any + Send>, CodecError>;

fn decode_boxed<T: NetworkMessage>(bytes: &[u8]) -> Result<Box<dyn Any + Send>, CodecError> {
    Ok(Box::new(T::decode(bytes)?))
}

/// A decoded message whose concrete type is known only by its tag.
pub struct DecodedMessage {
    tag: &'static str,
    type_name: &'static str,
    value: Box<dyn Any + Send>,
}

impl std::fmt::Debug for DecodedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedMessage")
            .field("tag", &self.tag)
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

impl DecodedMessage {
    pub fn tag(&self) -> &'static str {
        self.tag
    }

    pub fn is<T: NetworkMessage>(&self) -> bool {
        self.value.is::<T>()
    }

    pub fn downcast<T: NetworkMessage>(self) -> Result<T, CodecError> {
        match self.value.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(_) => Err(CodecError::UnexpectedType {
                expected: type_name::<T>(),
                actual: self.type_name,
            }),
        }
    }
}

#[derive(Clone, Copy)]
struct Registration {
    decoder: Decoder,
    type_name: &'static str,
}

#[derive(Default)]
pub struct MessageCodec {
    by_tag: HashMap<&'static str, Registration>,
    by_type: HashMap<TypeId, &'static str>,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: NetworkMessage>(&mut self) -> Result<(), CodecError> {
        let tag = T::MESSAGE_TYPE;
        if tag.is_empty() || tag.len() > u8::MAX as usize || !tag.is_ascii() {
            return Err(CodecError::InvalidTag(tag.to_string()));
        }
        if self.by_tag.contains_key(tag) || self.by_type.contains_key(&TypeId::of::<T>()) {
            return Err(CodecError::Duplicate(tag));
        }

        self.by_tag.insert(
            tag,
            Registration {
                decoder: decode_boxed::<T>,
                type_name: type_name::<T>(),
            },
        );
        self.by_type.insert(TypeId::of::<T>(), tag);
        Ok(())
    }

    pub fn is_registered<T: NetworkMessage>(&self) -> bool {
        self.by_type.contains_key(&TypeId::of::<T>())
    }

    pub fn serialize<T: NetworkMessage>(&self, message: &T) -> Result<Vec<u8>, CodecError> {
        let tag = self
            .by_type
            .get(&TypeId::of::<T>())
            .ok_or(CodecError::NotRegistered {
                type_name: type_name::<T>(),
            })?;

        let body = message.encode()?;
        let mut bytes = Vec::with_capacity(1 + tag.len() + body.len());
        bytes.push(tag.len() as u8);
        bytes.extend_from_slice(tag.as_bytes());
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    pub fn deserialize(&self, bytes: &[u8]) -> Result<DecodedMessage, CodecError> {
        let (&len, rest) = bytes.split_first().ok_or(CodecError::Truncated)?;
        let len = len as usize;
        if rest.len() < len {
            return Err(CodecError::Truncated);
        }

        let (tag, body) = rest.split_at(len);
        let tag = std::str::from_utf8(tag)
            .ok()
            .filter(|tag| tag.is_ascii())
            .ok_or_else(|| CodecError::InvalidTag(String::from_utf8_lossy(tag).into_owned()))?;

        let (&tag, registration) = self
            .by_tag
            .get_key_value(tag)
            .ok_or_else(|| CodecError::UnknownMessageType(tag.to_string()))?;

        Ok(DecodedMessage {
            tag,
            type_name: registration.type_name,
            value: (registration.decoder)(body)?,
        })
    }

    /// Decodes and checks the message is a `T` in one go.
    pub fn deserialize_as<T: NetworkMessage>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        self.deserialize(bytes)?.downcast::<T>()
    }
}
