//! Wire format of the tunnel channel.
//!
//! Each frame travels as one length-delimited unit:
//!
//! ```text
//! [len: u32 BE][kind: u8][id: u64 BE, absent for identify][payload]
//! ```
//!
//! Payloads are carried byte-for-byte. Bodies are split into chunk frames of at
//! most [`CHUNK_SIZE`] bytes and terminated by an end frame.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use n0_error::{e, stack_error};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Maximum size of a single wire unit.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Maximum payload of one chunk frame.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Identifies one exchange on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
pub struct CorrelationId(pub u64);

/// Which end of a channel allocates an id.
///
/// The server allocates even ids and the client odd ones, so exchanges started
/// by the two ends of one channel never share an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Server,
    Client,
}

impl Side {
    pub(crate) fn first_id(self) -> u64 {
        match self {
            Side::Server => 2,
            Side::Client => 1,
        }
    }

    pub fn owns(self, id: CorrelationId) -> bool {
        id.0 % 2 == self.first_id() % 2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Identify = 0,
    RequestHead = 1,
    RequestChunk = 2,
    RequestEnd = 3,
    ResponseHead = 4,
    ResponseChunk = 5,
    ResponseEnd = 6,
    Error = 7,
}

impl FrameKind {
    fn has_id(self) -> bool {
        self != FrameKind::Identify
    }

    /// Whether this frame belongs to the request half of an exchange.
    pub fn is_request(self) -> bool {
        matches!(
            self,
            FrameKind::RequestHead | FrameKind::RequestChunk | FrameKind::RequestEnd
        )
    }

    /// Whether this frame belongs to the response half of an exchange.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            FrameKind::ResponseHead | FrameKind::ResponseChunk | FrameKind::ResponseEnd
        )
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        Ok(match value {
            0 => FrameKind::Identify,
            1 => FrameKind::RequestHead,
            2 => FrameKind::RequestChunk,
            3 => FrameKind::RequestEnd,
            4 => FrameKind::ResponseHead,
            5 => FrameKind::ResponseChunk,
            6 => FrameKind::ResponseEnd,
            7 => FrameKind::Error,
            kind => return Err(e!(FrameError::UnknownKind { kind })),
        })
    }
}

/// Unit of channel traffic.
#[derive(derive_more::Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    /// Absent only for [`FrameKind::Identify`].
    pub id: Option<CorrelationId>,
    #[debug("{} bytes", payload.len())]
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, id: CorrelationId, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            id: Some(id),
            payload: payload.into(),
        }
    }

    pub fn identify(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Identify,
            id: None,
            payload: payload.into(),
        }
    }

    pub fn error(id: CorrelationId, message: impl ToString) -> Self {
        Self::new(FrameKind::Error, id, message.to_string())
    }

    /// Splits `bytes` into chunk frames of at most [`CHUNK_SIZE`] without copying.
    pub fn chunks(kind: FrameKind, id: CorrelationId, bytes: Bytes) -> impl Iterator<Item = Frame> {
        (0..bytes.len()).step_by(CHUNK_SIZE).map(move |start| {
            let part = bytes.slice(start..(start + CHUNK_SIZE).min(bytes.len()));
            Frame::new(kind, id, part)
        })
    }

    /// Chunk frames for a complete body, followed by the end frame.
    pub fn body(
        chunk: FrameKind,
        end: FrameKind,
        id: CorrelationId,
        body: Bytes,
    ) -> impl Iterator<Item = Frame> {
        Self::chunks(chunk, id, body).chain(std::iter::once(Frame::new(end, id, Bytes::new())))
    }
}

#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum FrameError {
    #[error("io error")]
    Io {
        #[error(source, std_err)]
        source: io::Error,
    },
    #[error("unknown frame kind {kind}")]
    UnknownKind { kind: u8 },
    #[error("frame too short")]
    Truncated,
    /// The correlation id does not fit the frame kind.
    #[error("correlation id mismatch for {kind:?} frame")]
    IdMismatch { kind: FrameKind },
}

impl From<io::Error> for FrameError {
    #[track_caller]
    fn from(source: io::Error) -> Self {
        e!(FrameError::Io { source })
    }
}

/// Codec for [`Frame`]s on top of a 4-byte length prefix.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(mut unit) = self.inner.decode(src)? else {
            return Ok(None);
        };
        if unit.is_empty() {
            return Err(e!(FrameError::Truncated));
        }
        let kind = FrameKind::try_from(unit.get_u8())?;
        let id = if kind.has_id() {
            if unit.len() < 8 {
                return Err(e!(FrameError::Truncated));
            }
            Some(CorrelationId(unit.get_u64()))
        } else {
            None
        };
        Ok(Some(Frame {
            kind,
            id,
            payload: unit.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut unit = BytesMut::with_capacity(9 + frame.payload.len());
        unit.put_u8(frame.kind as u8);
        match (frame.kind.has_id(), frame.id) {
            (true, Some(id)) => unit.put_u64(id.0),
            (false, None) => {}
            _ => return Err(e!(FrameError::IdMismatch { kind: frame.kind })),
        }
        unit.put_slice(&frame.payload);
        self.inner.encode(unit.freeze(), dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_all(frames: &[Frame]) -> BytesMut {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        for frame in frames {
            codec.encode(frame.clone(), &mut buf).unwrap();
        }
        buf
    }

    /// Feeds `wire` to a fresh decoder in pieces of `step` bytes.
    fn decode_in_steps(wire: &[u8], step: usize) -> Vec<Frame> {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        for piece in wire.chunks(step) {
            buf.extend_from_slice(piece);
            while let Some(frame) = codec.decode(&mut buf).unwrap() {
                frames.push(frame);
            }
        }
        assert!(buf.is_empty());
        frames
    }

    #[test]
    fn body_survives_arbitrary_chunking() {
        // irregular JSON formatting must be carried as-is
        let body = Bytes::from_static(b"{\n     \"some\": {\n          \"example\": \"json\"\n     }\n}");
        let id = CorrelationId(7);
        let mut frames = vec![Frame::new(FrameKind::RequestHead, id, "POST / HTTP/1.1\r\n\r\n")];
        frames.extend(Frame::body(
            FrameKind::RequestChunk,
            FrameKind::RequestEnd,
            id,
            body.clone(),
        ));
        let wire = encode_all(&frames);
        for step in [1, 3, 7, 64, wire.len()] {
            let decoded = decode_in_steps(&wire, step);
            assert_eq!(decoded, frames);
            let rebuilt: Vec<u8> = decoded
                .iter()
                .filter(|f| f.kind == FrameKind::RequestChunk)
                .flat_map(|f| f.payload.iter().copied())
                .collect();
            assert_eq!(rebuilt, body);
        }
    }

    #[test]
    fn large_body_is_split_into_chunks() {
        let body = Bytes::from((0..(CHUNK_SIZE * 2 + 10)).map(|i| i as u8).collect::<Vec<_>>());
        let frames: Vec<_> = Frame::body(
            FrameKind::ResponseChunk,
            FrameKind::ResponseEnd,
            CorrelationId(2),
            body.clone(),
        )
        .collect();
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[2].payload.len(), 10);
        assert_eq!(frames[3].kind, FrameKind::ResponseEnd);
        let joined: Vec<u8> = frames.iter().flat_map(|f| f.payload.to_vec()).collect();
        assert_eq!(joined, body);
    }

    #[test]
    fn empty_body_is_just_end() {
        let frames: Vec<_> = Frame::body(
            FrameKind::RequestChunk,
            FrameKind::RequestEnd,
            CorrelationId(1),
            Bytes::new(),
        )
        .collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, FrameKind::RequestEnd);
    }

    #[test]
    fn identify_has_no_id() {
        let frame = Frame::identify(r#"{"token":"t"}"#);
        let wire = encode_all(std::slice::from_ref(&frame));
        assert_eq!(wire.len(), 4 + 1 + frame.payload.len());
        assert_eq!(decode_in_steps(&wire, 2), vec![frame]);

        let bad = Frame {
            kind: FrameKind::Error,
            id: None,
            payload: Bytes::new(),
        };
        assert!(FrameCodec::default().encode(bad, &mut BytesMut::new()).is_err());
    }

    #[test]
    fn rejects_unknown_kind_and_truncated_units() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[0, 0, 0, 1, 42][..]);
        assert!(codec.decode(&mut buf).is_err());

        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[0, 0, 0, 3, 1, 0, 0][..]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
