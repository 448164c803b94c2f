//! Binary encoding of wire messages.
use std::io;
use std::mem;
use std::string::FromUtf8Error;

use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};

use tempest::clock::Timestamp;
use tempest::node::NodeId;
use tempest::policy::{ClearHistory, ReaderConfig};
use tempest::sample::{SampleEvent, WireSample};
use tempest::topic::Key;
use tempest::LocalDuration;

use crate::service::message::{Message, NodeRef};

/// The default type we use to represent sizes on the wire.
///
/// Wire messages are limited to 64KB by the transport layer, so two bytes
/// is enough for any list; sample payloads get a wider prefix.
pub type Size = u16;

/// Maximum accepted sample payload size.
pub const MAX_PAYLOAD: usize = 1 << 20;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("UTF-8 error: {0}")]
    FromUtf8(#[from] FromUtf8Error),
    #[error("invalid node id")]
    InvalidNodeId(#[from] tempest::node::NodeIdError),
    #[error("invalid timestamp `{0}`")]
    InvalidTimestamp(u64),
    #[error("invalid size: at most {expected}, got {actual}")]
    InvalidSize { expected: usize, actual: usize },
    #[error("unknown message type `{0}`")]
    UnknownMessageType(u16),
    #[error("unknown sample event `{0}`")]
    UnknownSampleEvent(u8),
    #[error("unknown clear-history policy `{0}`")]
    UnknownClearHistory(u8),
    #[error("invalid option discriminant `{0}`")]
    InvalidOption(u8),
    #[error("unexpected bytes")]
    UnexpectedBytes,
}

impl Error {
    /// Whether we've reached the end of file. This will be true when we
    /// fail to decode a message because there's not enough data in the
    /// stream.
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Io(err) if err.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// Things that can be encoded as binary.
pub trait Encode {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error>;
}

/// Things that can be decoded from binary.
pub trait Decode: Sized {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error>;
}

/// Encode an object into a byte vector.
pub fn serialize<T: Encode + ?Sized>(data: &T) -> Vec<u8> {
    let mut buffer = Vec::new();
    let len = data
        .encode(&mut buffer)
        .expect("in-memory writes never fail");

    debug_assert_eq!(len, buffer.len());

    buffer
}

/// Decode an object from a byte vector.
pub fn deserialize<T: Decode>(data: &[u8]) -> Result<T, Error> {
    let mut cursor = io::Cursor::new(data);
    let obj = T::decode(&mut cursor)?;

    if cursor.position() as usize != cursor.get_ref().len() {
        return Err(Error::UnexpectedBytes);
    }
    Ok(obj)
}

impl Encode for u8 {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_u8(*self)?;

        Ok(mem::size_of::<Self>())
    }
}

impl Encode for u16 {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_u16::<NetworkEndian>(*self)?;

        Ok(mem::size_of::<Self>())
    }
}

impl Encode for u32 {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_u32::<NetworkEndian>(*self)?;

        Ok(mem::size_of::<Self>())
    }
}

impl Encode for u64 {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_u64::<NetworkEndian>(*self)?;

        Ok(mem::size_of::<Self>())
    }
}

impl Encode for i64 {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_i64::<NetworkEndian>(*self)?;

        Ok(mem::size_of::<Self>())
    }
}

impl Encode for str {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        debug_assert!(self.len() <= Size::MAX as usize);

        let n = (self.len() as Size).encode(writer)?;
        writer.write_all(self.as_bytes())?;

        Ok(n + self.len())
    }
}

impl Encode for String {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.as_str().encode(writer)
    }
}

impl<T: Encode> Encode for [T] {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = (self.len() as Size).encode(writer)?;

        for item in self {
            n += item.encode(writer)?;
        }
        Ok(n)
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.as_slice().encode(writer)
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        match self {
            None => 0u8.encode(writer),
            Some(v) => Ok(1u8.encode(writer)? + v.encode(writer)?),
        }
    }
}

impl Encode for NodeId {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = self.category().encode(writer)?;
        n += self.name().encode(writer)?;

        Ok(n)
    }
}

impl Encode for NodeRef {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = self.id.encode(writer)?;
        n += self.via.encode(writer)?;

        Ok(n)
    }
}

impl Encode for Key {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let bytes = self.as_bytes();
        let n = (bytes.len() as Size).encode(writer)?;
        writer.write_all(bytes)?;

        Ok(n + bytes.len())
    }
}

impl Encode for Timestamp {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        (**self).encode(writer)
    }
}

impl Encode for LocalDuration {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        (self.as_millis() as u64).encode(writer)
    }
}

impl Encode for SampleEvent {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let code: u8 = match self {
            Self::Add => 0,
            Self::Update => 1,
            Self::PartialUpdate => 2,
            Self::Remove => 3,
        };
        code.encode(writer)
    }
}

impl Encode for ClearHistory {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let code: u8 = match self {
            Self::Never => 0,
            Self::OnAdd => 1,
            Self::OnRemove => 2,
            Self::OnAll => 3,
            Self::OnAllExceptPartialUpdate => 4,
        };
        code.encode(writer)
    }
}

impl Encode for ReaderConfig {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = self.sample_count.encode(writer)?;
        n += self.sample_lifetime.encode(writer)?;
        n += self.clear_history.encode(writer)?;

        Ok(n)
    }
}

impl Encode for WireSample {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = self.event.encode(writer)?;
        n += self.tag.encode(writer)?;
        n += self.timestamp.encode(writer)?;
        n += self.origin.encode(writer)?;
        n += self.seq.encode(writer)?;
        n += (self.payload.len() as u32).encode(writer)?;
        writer.write_all(&self.payload)?;

        Ok(n + self.payload.len())
    }
}

impl Encode for Message {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        match self {
            Self::CreateSession { node } => {
                Ok(1u16.encode(writer)? + node.encode(writer)?)
            }
            Self::SessionCreated { node, agent } => {
                Ok(2u16.encode(writer)? + node.encode(writer)? + agent.encode(writer)?)
            }
            Self::AnnounceReader { topic, node } => {
                Ok(4u16.encode(writer)? + topic.encode(writer)? + node.encode(writer)?)
            }
            Self::AnnounceWriter { topic, node } => {
                Ok(5u16.encode(writer)? + topic.encode(writer)? + node.encode(writer)?)
            }
            Self::AnnounceTopics {
                readers,
                writers,
                node,
            } => Ok(6u16.encode(writer)?
                + readers.encode(writer)?
                + writers.encode(writer)?
                + node.encode(writer)?),
            Self::AttachTopic { topic, from } => {
                Ok(8u16.encode(writer)? + topic.encode(writer)? + from.encode(writer)?)
            }
            Self::DetachTopic { topic, from } => {
                Ok(9u16.encode(writer)? + topic.encode(writer)? + from.encode(writer)?)
            }
            Self::AnnounceKeys { topic, from, keys } => Ok(10u16.encode(writer)?
                + topic.encode(writer)?
                + from.encode(writer)?
                + keys.encode(writer)?),
            Self::AttachElements {
                topic,
                from,
                keys,
                spec,
            } => Ok(11u16.encode(writer)?
                + topic.encode(writer)?
                + from.encode(writer)?
                + keys.encode(writer)?
                + spec.encode(writer)?),
            Self::Samples {
                topic,
                key,
                samples,
            } => Ok(12u16.encode(writer)?
                + topic.encode(writer)?
                + key.encode(writer)?
                + samples.encode(writer)?),
            Self::Forward { from, to, body } => Ok(14u16.encode(writer)?
                + from.encode(writer)?
                + to.encode(writer)?
                + body.encode(writer)?),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

impl Decode for u8 {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        reader.read_u8().map_err(Error::from)
    }
}

impl Decode for u16 {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        reader.read_u16::<NetworkEndian>().map_err(Error::from)
    }
}

impl Decode for u32 {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        reader.read_u32::<NetworkEndian>().map_err(Error::from)
    }
}

impl Decode for u64 {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        reader.read_u64::<NetworkEndian>().map_err(Error::from)
    }
}

impl Decode for i64 {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        reader.read_i64::<NetworkEndian>().map_err(Error::from)
    }
}

impl Decode for String {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let len = Size::decode(reader)?;
        let mut bytes = vec![0; len as usize];

        reader.read_exact(&mut bytes)?;

        String::from_utf8(bytes).map_err(Error::from)
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let len = Size::decode(reader)? as usize;
        let mut items = Vec::with_capacity(len.min(1024));

        for _ in 0..len {
            items.push(T::decode(reader)?);
        }
        Ok(items)
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        match u8::decode(reader)? {
            0 => Ok(None),
            1 => Ok(Some(T::decode(reader)?)),
            n => Err(Error::InvalidOption(n)),
        }
    }
}

impl Decode for NodeId {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let category = String::decode(reader)?;
        let name = String::decode(reader)?;

        NodeId::new(category, name).map_err(Error::from)
    }
}

impl Decode for NodeRef {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let id = NodeId::decode(reader)?;
        let via = Option::<NodeId>::decode(reader)?;

        Ok(Self { id, via })
    }
}

impl Decode for Key {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let len = Size::decode(reader)?;
        let mut bytes = vec![0; len as usize];

        reader.read_exact(&mut bytes)?;

        Ok(Key::from(bytes))
    }
}

impl Decode for Timestamp {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let millis = u64::decode(reader)?;

        Timestamp::try_from(millis).map_err(Error::InvalidTimestamp)
    }
}

impl Decode for LocalDuration {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let millis = u64::decode(reader)?;

        Ok(LocalDuration::from_millis(millis as u128))
    }
}

impl Decode for SampleEvent {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        match u8::decode(reader)? {
            0 => Ok(Self::Add),
            1 => Ok(Self::Update),
            2 => Ok(Self::PartialUpdate),
            3 => Ok(Self::Remove),
            n => Err(Error::UnknownSampleEvent(n)),
        }
    }
}

impl Decode for ClearHistory {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        match u8::decode(reader)? {
            0 => Ok(Self::Never),
            1 => Ok(Self::OnAdd),
            2 => Ok(Self::OnRemove),
            3 => Ok(Self::OnAll),
            4 => Ok(Self::OnAllExceptPartialUpdate),
            n => Err(Error::UnknownClearHistory(n)),
        }
    }
}

impl Decode for ReaderConfig {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let sample_count = Option::<i64>::decode(reader)?;
        let sample_lifetime = Option::<LocalDuration>::decode(reader)?;
        let clear_history = Option::<ClearHistory>::decode(reader)?;

        Ok(Self {
            sample_count,
            sample_lifetime,
            clear_history,
        })
    }
}

impl Decode for WireSample {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let event = SampleEvent::decode(reader)?;
        let tag = Option::<String>::decode(reader)?;
        let timestamp = Timestamp::decode(reader)?;
        let origin = NodeId::decode(reader)?;
        let seq = u64::decode(reader)?;
        let len = u32::decode(reader)? as usize;
        if len > MAX_PAYLOAD {
            return Err(Error::InvalidSize {
                expected: MAX_PAYLOAD,
                actual: len,
            });
        }
        let mut payload = vec![0; len];
        reader.read_exact(&mut payload)?;

        Ok(Self {
            event,
            tag,
            timestamp,
            origin,
            seq,
            payload,
        })
    }
}

impl Decode for Message {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        match u16::decode(reader)? {
            1 => Ok(Self::CreateSession {
                node: NodeRef::decode(reader)?,
            }),
            2 => Ok(Self::SessionCreated {
                node: NodeRef::decode(reader)?,
                agent: String::decode(reader)?,
            }),
            4 => Ok(Self::AnnounceReader {
                topic: String::decode(reader)?,
                node: NodeRef::decode(reader)?,
            }),
            5 => Ok(Self::AnnounceWriter {
                topic: String::decode(reader)?,
                node: NodeRef::decode(reader)?,
            }),
            6 => Ok(Self::AnnounceTopics {
                readers: Vec::<String>::decode(reader)?,
                writers: Vec::<String>::decode(reader)?,
                node: NodeRef::decode(reader)?,
            }),
            8 => Ok(Self::AttachTopic {
                topic: String::decode(reader)?,
                from: NodeId::decode(reader)?,
            }),
            9 => Ok(Self::DetachTopic {
                topic: String::decode(reader)?,
                from: NodeId::decode(reader)?,
            }),
            10 => Ok(Self::AnnounceKeys {
                topic: String::decode(reader)?,
                from: NodeId::decode(reader)?,
                keys: Vec::<Key>::decode(reader)?,
            }),
            11 => Ok(Self::AttachElements {
                topic: String::decode(reader)?,
                from: NodeId::decode(reader)?,
                keys: Vec::<Key>::decode(reader)?,
                spec: ReaderConfig::decode(reader)?,
            }),
            12 => Ok(Self::Samples {
                topic: String::decode(reader)?,
                key: Key::decode(reader)?,
                samples: Vec::<WireSample>::decode(reader)?,
            }),
            14 => Ok(Self::Forward {
                from: NodeId::decode(reader)?,
                to: NodeId::decode(reader)?,
                body: Box::new(Message::decode(reader)?),
            }),
            other => Err(Error::UnknownMessageType(other)),
        }
    }
}
