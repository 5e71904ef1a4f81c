use std::ops::Range;
use std::{fmt, io, mem};

use bytes::{Buf, BufMut, Bytes};
use slog;

use coding::{self, BufExt, BufMutExt, Codec};
use packet::ConnectionId;
use range_set::RangeSet;
use {StreamId, TransportError, MAX_CID_SIZE, MIN_CID_SIZE, RESET_TOKEN_SIZE};

/// A frame type byte.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Type(u8);

impl From<Type> for u8 {
    fn from(x: Type) -> u8 {
        x.0
    }
}

impl Codec for Type {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        Ok(Type(buf.get::<u8>()?))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write(self.0);
    }
}

macro_rules! frame_types {
    {$($name:ident = $val:expr,)*} => {
        impl Type {
            $(pub const $name: Type = Type($val);)*
        }

        impl fmt::Debug for Type {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    x if x >= 0x10 && x <= 0x17 => f.write_str("STREAM"),
                    _ => write!(f, "<unknown {:02x}>", self.0),
                }
            }
        }
    }
}

frame_types! {
    PADDING = 0x00,
    RST_STREAM = 0x01,
    CONNECTION_CLOSE = 0x02,
    APPLICATION_CLOSE = 0x03,
    MAX_DATA = 0x04,
    MAX_STREAM_DATA = 0x05,
    MAX_STREAM_ID = 0x06,
    PING = 0x07,
    BLOCKED = 0x08,
    STREAM_BLOCKED = 0x09,
    STREAM_ID_BLOCKED = 0x0a,
    NEW_CONNECTION_ID = 0x0b,
    STOP_SENDING = 0x0c,
    RETIRE_CONNECTION_ID = 0x0d,
    PATH_CHALLENGE = 0x0e,
    PATH_RESPONSE = 0x0f,
    CRYPTO = 0x18,
    NEW_TOKEN = 0x19,
    ACK = 0x1a,
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl slog::Value for Type {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{:?}", self))
    }
}

const STREAM_TY_MIN: u8 = 0x10;
const STREAM_TY_MAX: u8 = 0x17;
const STREAM_FLAG_FIN: u8 = 0x01;
const STREAM_FLAG_LEN: u8 = 0x02;
const STREAM_FLAG_OFF: u8 = 0x04;

#[derive(Debug, Clone)]
pub enum Frame {
    Padding,
    Ping,
    Ack(Ack),
    RstStream(RstStream),
    StopSending { id: StreamId, error_code: u16 },
    ConnectionClose(ConnectionClose),
    ApplicationClose(ApplicationClose),
    MaxData(u64),
    MaxStreamData { id: StreamId, offset: u64 },
    MaxStreamId(StreamId),
    Blocked { offset: u64 },
    StreamBlocked { id: StreamId, offset: u64 },
    StreamIdBlocked { id: StreamId },
    NewConnectionId(NewConnectionId),
    RetireConnectionId { sequence: u64 },
    PathChallenge(u64),
    PathResponse(u64),
    Stream(Stream),
    Crypto(Crypto),
    NewToken { token: Bytes },
    Invalid(u8),
}

impl Frame {
    pub fn ty(&self) -> Type {
        use self::Frame::*;
        match *self {
            Padding => Type::PADDING,
            Ping => Type::PING,
            Ack(_) => Type::ACK,
            RstStream(_) => Type::RST_STREAM,
            StopSending { .. } => Type::STOP_SENDING,
            ConnectionClose(_) => Type::CONNECTION_CLOSE,
            ApplicationClose(_) => Type::APPLICATION_CLOSE,
            MaxData(_) => Type::MAX_DATA,
            MaxStreamData { .. } => Type::MAX_STREAM_DATA,
            MaxStreamId(_) => Type::MAX_STREAM_ID,
            Blocked { .. } => Type::BLOCKED,
            StreamBlocked { .. } => Type::STREAM_BLOCKED,
            StreamIdBlocked { .. } => Type::STREAM_ID_BLOCKED,
            NewConnectionId(_) => Type::NEW_CONNECTION_ID,
            RetireConnectionId { .. } => Type::RETIRE_CONNECTION_ID,
            PathChallenge(_) => Type::PATH_CHALLENGE,
            PathResponse(_) => Type::PATH_RESPONSE,
            Stream(ref x) => {
                let mut ty = STREAM_TY_MIN;
                if x.fin {
                    ty |= STREAM_FLAG_FIN;
                }
                if x.offset != 0 {
                    ty |= STREAM_FLAG_OFF;
                }
                Type(ty)
            }
            Crypto(_) => Type::CRYPTO,
            NewToken { .. } => Type::NEW_TOKEN,
            Invalid(ty) => Type(ty),
        }
    }

    /// Whether loss of this frame obliges a retransmission.
    pub fn is_ack_eliciting(&self) -> bool {
        match *self {
            Frame::Ack(_) | Frame::Padding => false,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RstStream {
    pub id: StreamId,
    pub error_code: u16,
    pub final_offset: u64,
}

impl RstStream {
    pub fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(Type::RST_STREAM);
        out.write_var(self.id.0);
        out.write(self.error_code);
        out.write_var(self.final_offset);
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionClose {
    pub error_code: TransportError,
    /// Type of the frame that provoked the close, when attributable.
    pub frame_type: u64,
    pub reason: Bytes,
}

impl fmt::Display for ConnectionClose {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.error_code.fmt(f)?;
        if !self.reason.is_empty() {
            f.write_str(": ")?;
            f.write_str(&String::from_utf8_lossy(&self.reason))?;
        }
        Ok(())
    }
}

impl From<TransportError> for ConnectionClose {
    fn from(x: TransportError) -> Self {
        ConnectionClose {
            error_code: x,
            frame_type: 0,
            reason: Bytes::new(),
        }
    }
}

impl ConnectionClose {
    /// Write the frame, truncating the reason to fit in `max_len` bytes.
    pub fn encode(&self, out: &mut Vec<u8>, max_len: usize) {
        out.write(Type::CONNECTION_CLOSE);
        out.write(self.error_code.0);
        out.write_var(self.frame_type);
        let max_reason = max_len.saturating_sub(1 + 2 + 8 + 8);
        let reason = &self.reason[..self.reason.len().min(max_reason)];
        out.write_var(reason.len() as u64);
        out.extend_from_slice(reason);
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ApplicationClose {
    pub error_code: u16,
    pub reason: Bytes,
}

impl fmt::Display for ApplicationClose {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if !self.reason.is_empty() {
            f.write_str(&String::from_utf8_lossy(&self.reason))
        } else {
            write!(f, "application error {}", self.error_code)
        }
    }
}

impl ApplicationClose {
    pub fn encode(&self, out: &mut Vec<u8>, max_len: usize) {
        out.write(Type::APPLICATION_CLOSE);
        out.write(self.error_code);
        let max_reason = max_len.saturating_sub(1 + 2 + 8);
        let reason = &self.reason[..self.reason.len().min(max_reason)];
        out.write_var(reason.len() as u64);
        out.extend_from_slice(reason);
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NewConnectionId {
    pub sequence: u64,
    pub cid: ConnectionId,
    pub reset_token: [u8; RESET_TOKEN_SIZE],
}

impl NewConnectionId {
    pub fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(Type::NEW_CONNECTION_ID);
        out.write_var(self.sequence);
        out.write(self.cid.len as u8);
        out.put_slice(&self.cid);
        out.put_slice(&self.reset_token);
    }
}

/// Application data carried at a particular offset of a stream.
#[derive(Debug, Clone)]
pub struct Stream {
    pub id: StreamId,
    pub offset: u64,
    pub fin: bool,
    pub data: Bytes,
}

impl Stream {
    /// Write the frame; a length field is included unless the frame is known
    /// to extend to the end of the packet.
    pub fn encode<W: BufMut>(&self, length: bool, out: &mut W) {
        let mut ty = STREAM_TY_MIN;
        if self.offset != 0 {
            ty |= STREAM_FLAG_OFF;
        }
        if length {
            ty |= STREAM_FLAG_LEN;
        }
        if self.fin {
            ty |= STREAM_FLAG_FIN;
        }
        out.write(ty);
        out.write_var(self.id.0);
        if self.offset != 0 {
            out.write_var(self.offset);
        }
        if length {
            out.write_var(self.data.len() as u64);
        }
        out.put_slice(&self.data);
    }
}

/// Handshake bytes at an offset within an encryption level's stream.
#[derive(Debug, Clone)]
pub struct Crypto {
    pub offset: u64,
    pub data: Bytes,
}

impl Crypto {
    pub fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(Type::CRYPTO);
        out.write_var(self.offset);
        out.write_var(self.data.len() as u64);
        out.put_slice(&self.data);
    }

    /// Wire size for a payload of `len` bytes at `offset`.
    pub fn size(offset: u64, len: usize) -> usize {
        1 + coding::varint_size(offset) + coding::varint_size(len as u64) + len
    }
}

/// Acknowledged packet number ranges in one packet number space.
#[derive(Clone, Eq, PartialEq)]
pub struct Ack {
    pub largest: u64,
    /// Scaled per the sender's ack_delay_exponent.
    pub delay: u64,
    /// Encoded block count, first block, and (gap, block) pairs.
    additional: Bytes,
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Ack")
            .field("largest", &self.largest)
            .field("delay", &self.delay)
            .field("ranges", &self.iter().collect::<Vec<_>>())
            .finish()
    }
}

impl<'a> IntoIterator for &'a Ack {
    type Item = Range<u64>;
    type IntoIter = AckIter;
    fn into_iter(self) -> AckIter {
        AckIter::new(self.largest, self.additional.clone())
    }
}

impl Ack {
    fn new(largest: u64, delay: u64, additional: Bytes) -> Result<Self, ()> {
        let x = Ack {
            largest,
            delay,
            additional,
        };
        // Walk the blocks once so iteration can't underflow past zero later.
        let mut iter = x.iter();
        let mut n = 0;
        while let Some(_) = iter.next() {
            n += 1;
        }
        if iter.malformed || n == 0 {
            return Err(());
        }
        Ok(x)
    }

    /// Encode the ranges in `acks`, which must be nonempty.
    pub fn encode<W: BufMut>(delay: u64, acks: &RangeSet, out: &mut W) {
        let mut rest = acks.iter().rev();
        let first = rest.next().unwrap();
        let largest = first.end - 1;
        out.write(Type::ACK);
        out.write_var(largest);
        out.write_var(delay);
        out.write_var(acks.len() as u64 - 1);
        out.write_var(first.end - first.start - 1);
        let mut prev = first.start;
        for block in rest {
            out.write_var(prev - block.end - 1); // gap
            out.write_var(block.end - block.start - 1);
            prev = block.start;
        }
    }

    /// Ranges in descending packet number order.
    pub fn iter(&self) -> AckIter {
        self.into_iter()
    }
}

/// Decodes ACK blocks lazily, largest range first.
pub struct AckIter {
    data: io::Cursor<Bytes>,
    next_largest: u64,
    blocks_remaining: u64,
    first: bool,
    malformed: bool,
}

impl AckIter {
    fn new(largest: u64, additional: Bytes) -> Self {
        Self {
            data: io::Cursor::new(additional),
            next_largest: largest,
            blocks_remaining: 0,
            first: true,
            malformed: false,
        }
    }

    fn fail(&mut self) -> Option<Range<u64>> {
        self.malformed = true;
        self.blocks_remaining = 0;
        None
    }
}

impl Iterator for AckIter {
    type Item = Range<u64>;
    fn next(&mut self) -> Option<Range<u64>> {
        if self.malformed {
            return None;
        }
        if self.first {
            self.first = false;
            self.blocks_remaining = match self.data.get_var() {
                Ok(x) => x,
                Err(_) => return self.fail(),
            };
            let len = match self.data.get_var() {
                Ok(x) => x,
                Err(_) => return self.fail(),
            };
            let start = match self.next_largest.checked_sub(len) {
                Some(x) => x,
                None => return self.fail(),
            };
            let largest = self.next_largest;
            self.next_largest = start;
            return Some(start..largest + 1);
        }
        if self.blocks_remaining == 0 {
            return None;
        }
        self.blocks_remaining -= 1;
        let gap = match self.data.get_var() {
            Ok(x) => x,
            Err(_) => return self.fail(),
        };
        let len = match self.data.get_var() {
            Ok(x) => x,
            Err(_) => return self.fail(),
        };
        // The next block's largest lies `gap + 2` below the previous
        // block's smallest.
        let largest = match self.next_largest.checked_sub(gap + 2) {
            Some(x) => x,
            None => return self.fail(),
        };
        let start = match largest.checked_sub(len) {
            Some(x) => x,
            None => return self.fail(),
        };
        self.next_largest = start;
        Some(start..largest + 1)
    }
}

/// Iterator over the frames in a packet payload.
///
/// A malformed frame yields `Frame::Invalid` carrying the offending type
/// byte and ends iteration.
pub struct Iter {
    bytes: io::Cursor<Bytes>,
    last_ty: u8,
}

impl Iter {
    pub fn new(payload: Bytes) -> Self {
        Iter {
            bytes: io::Cursor::new(payload),
            last_ty: 0,
        }
    }

    fn take_len(&mut self) -> coding::Result<Bytes> {
        let len = self.bytes.get_var()? as usize;
        if self.bytes.remaining() < len {
            return Err(coding::UnexpectedEnd);
        }
        let start = self.bytes.position() as usize;
        self.bytes.advance(len);
        Ok(self.bytes.get_ref().slice(start, start + len))
    }

    fn take_remaining(&mut self) -> Bytes {
        let start = self.bytes.position() as usize;
        let rest = self.bytes.get_ref().slice_from(start);
        let len = rest.len();
        self.bytes.advance(len);
        rest
    }

    fn try_next(&mut self) -> coding::Result<Frame> {
        let ty = self.bytes.get::<u8>()?;
        self.last_ty = ty;
        Ok(match ty {
            0x00 => Frame::Padding,
            0x01 => Frame::RstStream(RstStream {
                id: StreamId(self.bytes.get_var()?),
                error_code: self.bytes.get()?,
                final_offset: self.bytes.get_var()?,
            }),
            0x02 => Frame::ConnectionClose(ConnectionClose {
                error_code: TransportError(self.bytes.get()?),
                frame_type: self.bytes.get_var()?,
                reason: self.take_len()?,
            }),
            0x03 => Frame::ApplicationClose(ApplicationClose {
                error_code: self.bytes.get()?,
                reason: self.take_len()?,
            }),
            0x04 => Frame::MaxData(self.bytes.get_var()?),
            0x05 => Frame::MaxStreamData {
                id: StreamId(self.bytes.get_var()?),
                offset: self.bytes.get_var()?,
            },
            0x06 => Frame::MaxStreamId(StreamId(self.bytes.get_var()?)),
            0x07 => Frame::Ping,
            0x08 => Frame::Blocked {
                offset: self.bytes.get_var()?,
            },
            0x09 => Frame::StreamBlocked {
                id: StreamId(self.bytes.get_var()?),
                offset: self.bytes.get_var()?,
            },
            0x0a => Frame::StreamIdBlocked {
                id: StreamId(self.bytes.get_var()?),
            },
            0x0b => {
                let sequence = self.bytes.get_var()?;
                let len = self.bytes.get::<u8>()? as usize;
                if len < MIN_CID_SIZE || len > MAX_CID_SIZE {
                    return Err(coding::UnexpectedEnd);
                }
                if self.bytes.remaining() < len + RESET_TOKEN_SIZE {
                    return Err(coding::UnexpectedEnd);
                }
                let mut cid_bytes = [0; MAX_CID_SIZE];
                self.bytes.copy_to_slice(&mut cid_bytes[..len]);
                let mut reset_token = [0; RESET_TOKEN_SIZE];
                self.bytes.copy_to_slice(&mut reset_token);
                Frame::NewConnectionId(NewConnectionId {
                    sequence,
                    cid: ConnectionId::new(&cid_bytes[..len]),
                    reset_token,
                })
            }
            0x0c => Frame::StopSending {
                id: StreamId(self.bytes.get_var()?),
                error_code: self.bytes.get()?,
            },
            0x0d => Frame::RetireConnectionId {
                sequence: self.bytes.get_var()?,
            },
            0x0e => Frame::PathChallenge(self.bytes.get()?),
            0x0f => Frame::PathResponse(self.bytes.get()?),
            x if x >= STREAM_TY_MIN && x <= STREAM_TY_MAX => {
                let id = StreamId(self.bytes.get_var()?);
                let offset = if x & STREAM_FLAG_OFF != 0 {
                    self.bytes.get_var()?
                } else {
                    0
                };
                let data = if x & STREAM_FLAG_LEN != 0 {
                    self.take_len()?
                } else {
                    self.take_remaining()
                };
                Frame::Stream(Stream {
                    id,
                    offset,
                    fin: x & STREAM_FLAG_FIN != 0,
                    data,
                })
            }
            0x18 => Frame::Crypto(Crypto {
                offset: self.bytes.get_var()?,
                data: self.take_len()?,
            }),
            0x19 => Frame::NewToken {
                token: self.take_len()?,
            },
            0x1a => {
                let largest = self.bytes.get_var()?;
                let delay = self.bytes.get_var()?;
                // The remaining block fields are length-implicit, so scan
                // them to find where the frame ends.
                let start = self.bytes.position() as usize;
                let count = self.bytes.get_var()?;
                self.bytes.get_var()?; // first block
                for _ in 0..count {
                    self.bytes.get_var()?;
                    self.bytes.get_var()?;
                }
                let end = self.bytes.position() as usize;
                let additional = self.bytes.get_ref().slice(start, end);
                Frame::Ack(Ack::new(largest, delay, additional).map_err(|()| {
                    coding::UnexpectedEnd
                })?)
            }
            _ => return Err(coding::UnexpectedEnd),
        })
    }
}

impl Iterator for Iter {
    type Item = Frame;
    fn next(&mut self) -> Option<Frame> {
        if !self.bytes.has_remaining() {
            return None;
        }
        match self.try_next() {
            Ok(x) => Some(x),
            Err(_) => {
                // Make sure we don't emit further frames after failure.
                let remaining = self.bytes.remaining();
                self.bytes.advance(remaining);
                Some(Frame::Invalid(self.last_ty))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn frames(buf: Vec<u8>) -> Vec<Frame> {
        Iter::new(Bytes::from(buf)).collect()
    }

    #[test]
    fn stream_roundtrip() {
        let frame = Stream {
            id: StreamId(5),
            offset: 1300,
            fin: true,
            data: Bytes::from(&b"fragment"[..]),
        };
        let mut explicit = Vec::new();
        frame.encode(true, &mut explicit);
        match &frames(explicit)[..] {
            [Frame::Stream(ref x)] => {
                assert_eq!((x.id, x.offset, x.fin), (StreamId(5), 1300, true));
                assert_eq!(&x.data[..], b"fragment");
            }
            x => panic!("unexpected frames {:?}", x),
        }
        // Without a length field the data runs to the end of the packet.
        let mut implicit = Vec::new();
        frame.encode(false, &mut implicit);
        match &frames(implicit)[..] {
            [Frame::Stream(ref x)] => assert_eq!(&x.data[..], b"fragment"),
            x => panic!("unexpected frames {:?}", x),
        }
    }

    #[test]
    fn ack_roundtrip() {
        let mut ranges = RangeSet::new();
        ranges.insert(1..3);
        ranges.insert(5..7);
        ranges.insert(9..10);
        let mut buf = Vec::new();
        Ack::encode(42, &ranges, &mut buf);
        match &frames(buf)[..] {
            [Frame::Ack(ref ack)] => {
                assert_eq!(ack.largest, 9);
                assert_eq!(ack.delay, 42);
                assert_eq!(ack.iter().collect::<Vec<_>>(), vec![9..10, 5..7, 1..3]);
            }
            x => panic!("unexpected frames {:?}", x),
        }
    }

    #[test]
    fn ack_blocks_below_zero_rejected() {
        let mut buf = Vec::new();
        buf.write(Type::ACK);
        buf.write_var(3); // largest
        buf.write_var(0); // delay
        buf.write_var(1); // block count
        buf.write_var(1); // first block: covers 2..=3
        buf.write_var(0); // gap: next largest = 0
        buf.write_var(5); // extends below zero
        assert_matches!(&frames(buf)[..], [Frame::Invalid(0x1a)]);
    }

    #[test]
    fn rst_stream_roundtrip() {
        let mut buf = Vec::new();
        RstStream {
            id: StreamId(8),
            error_code: 0x23,
            final_offset: 70_000,
        }
        .encode(&mut buf);
        assert_matches!(
            &frames(buf)[..],
            [Frame::RstStream(RstStream {
                id: StreamId(8),
                error_code: 0x23,
                final_offset: 70_000,
            })]
        );
    }

    #[test]
    fn close_roundtrip() {
        let mut buf = Vec::new();
        ConnectionClose {
            error_code: TransportError::FLOW_CONTROL_ERROR,
            frame_type: 0x04,
            reason: Bytes::from(&b"out of credit"[..]),
        }
        .encode(&mut buf, 1200);
        match &frames(buf)[..] {
            [Frame::ConnectionClose(ref x)] => {
                assert_eq!(x.error_code, TransportError::FLOW_CONTROL_ERROR);
                assert_eq!(&x.reason[..], b"out of credit");
            }
            x => panic!("unexpected frames {:?}", x),
        }
    }

    #[test]
    fn close_reason_truncated_to_fit() {
        let mut buf = Vec::new();
        ApplicationClose {
            error_code: 7,
            reason: Bytes::from(vec![b'x'; 300]),
        }
        .encode(&mut buf, 64);
        assert!(buf.len() <= 64);
        assert_matches!(&frames(buf)[..], [Frame::ApplicationClose(_)]);
    }

    #[test]
    fn new_connection_id_roundtrip() {
        let mut buf = Vec::new();
        let frame = NewConnectionId {
            sequence: 3,
            cid: ConnectionId::new(&[0xfa; 9]),
            reset_token: [0xaa; RESET_TOKEN_SIZE],
        };
        frame.encode(&mut buf);
        match &frames(buf)[..] {
            [Frame::NewConnectionId(ref x)] => assert_eq!(*x, frame),
            x => panic!("unexpected frames {:?}", x),
        }
    }

    #[test]
    fn crypto_and_small_frames() {
        let mut buf = Vec::new();
        Crypto {
            offset: 600,
            data: Bytes::from(&b"clienthello"[..]),
        }
        .encode(&mut buf);
        buf.write(Type::PING);
        buf.write(Type::PATH_CHALLENGE);
        buf.write(0xdead_beef_dead_beefu64);
        buf.write(Type::PADDING);
        let frames = frames(buf);
        assert_matches!(frames[0], Frame::Crypto(ref x) if x.offset == 600);
        assert_matches!(frames[1], Frame::Ping);
        assert_matches!(frames[2], Frame::PathChallenge(0xdead_beef_dead_beef));
        assert_matches!(frames[3], Frame::Padding);
    }

    #[test]
    fn unknown_type_is_invalid() {
        assert_matches!(&frames(vec![0x1f])[..], [Frame::Invalid(0x1f)]);
    }
}
