use std::fmt;
use std::io;

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::Rng;
use slog;

use coding::{self, BufExt, BufMutExt, Codec};
use {MAX_CID_SIZE, MIN_CID_SIZE, RESET_TOKEN_SIZE, VERSION};

/// Long header packet types, other than Initial and Retry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LongType {
    Handshake,
    ZeroRtt,
}

const LONG_TYPE_INITIAL: u8 = 0x7f;
const LONG_TYPE_RETRY: u8 = 0x7e;
const LONG_TYPE_HANDSHAKE: u8 = 0x7d;
const LONG_TYPE_ZERO_RTT: u8 = 0x7c;

/// Number of payload bytes sampled for packet number protection.
pub const PN_SAMPLE_SIZE: usize = 16;

#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct ConnectionId {
    pub len: u8,
    pub bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    pub fn new(data: &[u8]) -> Self {
        debug_assert!(
            data.is_empty() || (data.len() >= MIN_CID_SIZE && data.len() <= MAX_CID_SIZE)
        );
        let mut x = ConnectionId {
            len: data.len() as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        x.bytes[..data.len()].copy_from_slice(data);
        x
    }

    pub fn random<R: Rng>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut x = ConnectionId {
            len: len as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        rng.fill_bytes(&mut x.bytes[..len]);
        x
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }
}

impl ::std::ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[0..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.bytes[0..self.len as usize].fmt(f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl slog::Value for ConnectionId {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{}", self))
    }
}

/// Encode a CID length in the 4-bit form used by DCIL/SCIL and ODCIL.
fn cid_len_nibble(cid: &ConnectionId) -> u8 {
    if cid.len == 0 {
        0
    } else {
        cid.len - 3
    }
}

fn decode_cid_len(nibble: u8) -> usize {
    if nibble == 0 {
        0
    } else {
        nibble as usize + 3
    }
}

fn decode_cid<B: Buf>(buf: &mut B, len: usize) -> coding::Result<ConnectionId> {
    if buf.remaining() < len {
        return Err(coding::UnexpectedEnd);
    }
    let mut bytes = [0; MAX_CID_SIZE];
    buf.copy_to_slice(&mut bytes[..len]);
    Ok(ConnectionId::new(&bytes[..len]))
}

/// A packet number truncated for the wire.
///
/// The first byte's top bits select 7, 14, or 30 significant bits.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketNumber {
    U8(u8),
    U16(u16),
    U32(u32),
}

impl PacketNumber {
    /// Truncate `n` for transmission, given the largest acknowledged packet.
    pub fn new(n: u64, largest_acked: u64) -> Self {
        let range = (n - largest_acked) * 2;
        if range < 1 << 7 {
            PacketNumber::U8((n & 0x7f) as u8)
        } else if range < 1 << 14 {
            PacketNumber::U16((n & 0x3fff) as u16)
        } else {
            assert!(range < 1 << 30, "packet number too far ahead of acks");
            PacketNumber::U32((n & 0x3fff_ffff) as u32)
        }
    }

    pub fn len(self) -> usize {
        match self {
            PacketNumber::U8(_) => 1,
            PacketNumber::U16(_) => 2,
            PacketNumber::U32(_) => 4,
        }
    }

    fn bits(self) -> u64 {
        match self {
            PacketNumber::U8(_) => 7,
            PacketNumber::U16(_) => 14,
            PacketNumber::U32(_) => 30,
        }
    }

    fn value(self) -> u64 {
        match self {
            PacketNumber::U8(x) => u64::from(x),
            PacketNumber::U16(x) => u64::from(x),
            PacketNumber::U32(x) => u64::from(x),
        }
    }

    pub fn encode<W: BufMut>(self, w: &mut W) {
        match self {
            PacketNumber::U8(x) => w.write(x),
            PacketNumber::U16(x) => w.write(0b10 << 14 | x),
            PacketNumber::U32(x) => w.write(0b11 << 30 | x),
        }
    }

    /// Decode from plaintext packet number bytes; `bytes` must contain at
    /// least `decode_len(bytes[0])` bytes.
    pub fn decode(bytes: &[u8]) -> Self {
        let mut buf = io::Cursor::new(bytes);
        let first = buf.get_u8();
        if first & 0x80 == 0 {
            PacketNumber::U8(first & 0x7f)
        } else if first & 0x40 == 0 {
            PacketNumber::U16(u16::from(first & 0x3f) << 8 | u16::from(buf.get_u8()))
        } else {
            let mut x = u32::from(first & 0x3f) << 24;
            x |= u32::from(buf.get_u8()) << 16;
            x |= u32::from(buf.get_u8()) << 8;
            x |= u32::from(buf.get_u8());
            PacketNumber::U32(x)
        }
    }

    /// Number of bytes occupied on the wire, judged from the first byte.
    pub fn decode_len(first: u8) -> usize {
        if first & 0x80 == 0 {
            1
        } else if first & 0x40 == 0 {
            2
        } else {
            4
        }
    }

    /// Recover the full packet number relative to the largest seen.
    pub fn expand(self, largest: u64) -> u64 {
        let win = 1u64 << self.bits();
        let hwin = win / 2;
        let mask = win - 1;
        // The incoming packet number should be greater than largest - hwin
        // and less than or equal to largest + hwin; select the candidate
        // with matching low bits closest to that range.
        let expected = largest.wrapping_add(1);
        let candidate = (expected & !mask) | self.value();
        if candidate.wrapping_add(hwin) <= expected {
            candidate + win
        } else if candidate > expected.wrapping_add(hwin) && candidate >= win {
            candidate - win
        } else {
            candidate
        }
    }
}

#[derive(Debug, Clone)]
pub enum Header {
    Initial {
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        token: Bytes,
        number: PacketNumber,
    },
    Long {
        ty: LongType,
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        number: PacketNumber,
    },
    Retry {
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        orig_dst_cid: ConnectionId,
        token: Bytes,
    },
    Short {
        dst_cid: ConnectionId,
        number: PacketNumber,
        key_phase: bool,
    },
    VersionNegotiate {
        random: u8,
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
    },
}

impl Header {
    /// Write the header, leaving packet number protection and, for long
    /// headers, the payload length to be fixed up later.
    pub fn encode(&self, w: &mut Vec<u8>) -> PartialEncode {
        use self::Header::*;
        match *self {
            Initial {
                ref src_cid,
                ref dst_cid,
                ref token,
                number,
            } => {
                w.write(0x80 | LONG_TYPE_INITIAL);
                w.write(VERSION);
                Self::encode_cids(w, dst_cid, src_cid);
                w.write_var(token.len() as u64);
                w.extend_from_slice(token);
                w.write::<u16>(0b01 << 14); // length; patched by set_payload_length
                let pn_offset = w.len();
                number.encode(w);
                PartialEncode {
                    pn: Some((pn_offset, number.len())),
                }
            }
            Long {
                ty,
                ref src_cid,
                ref dst_cid,
                number,
            } => {
                let ty = match ty {
                    LongType::Handshake => LONG_TYPE_HANDSHAKE,
                    LongType::ZeroRtt => LONG_TYPE_ZERO_RTT,
                };
                w.write(0x80 | ty);
                w.write(VERSION);
                Self::encode_cids(w, dst_cid, src_cid);
                w.write::<u16>(0b01 << 14);
                let pn_offset = w.len();
                number.encode(w);
                PartialEncode {
                    pn: Some((pn_offset, number.len())),
                }
            }
            Retry {
                ref src_cid,
                ref dst_cid,
                ref orig_dst_cid,
                ref token,
            } => {
                w.write(0x80 | LONG_TYPE_RETRY);
                w.write(VERSION);
                Self::encode_cids(w, dst_cid, src_cid);
                w.write(cid_len_nibble(orig_dst_cid));
                w.extend_from_slice(orig_dst_cid);
                w.extend_from_slice(token);
                PartialEncode { pn: None }
            }
            Short {
                ref dst_cid,
                number,
                key_phase,
            } => {
                w.write(0x30 | (key_phase as u8) << 6);
                w.extend_from_slice(dst_cid);
                let pn_offset = w.len();
                number.encode(w);
                PartialEncode {
                    pn: Some((pn_offset, number.len())),
                }
            }
            VersionNegotiate {
                random,
                ref src_cid,
                ref dst_cid,
            } => {
                w.write(0x80 | random & 0x7f);
                w.write::<u32>(0);
                Self::encode_cids(w, dst_cid, src_cid);
                PartialEncode { pn: None }
            }
        }
    }

    fn encode_cids(w: &mut Vec<u8>, dst_cid: &ConnectionId, src_cid: &ConnectionId) {
        w.write(cid_len_nibble(dst_cid) << 4 | cid_len_nibble(src_cid));
        w.extend_from_slice(dst_cid);
        w.extend_from_slice(src_cid);
    }

    pub fn number(&self) -> Option<PacketNumber> {
        use self::Header::*;
        match *self {
            Initial { number, .. } | Long { number, .. } | Short { number, .. } => Some(number),
            _ => None,
        }
    }

    pub fn key_phase(&self) -> bool {
        match *self {
            Header::Short { key_phase, .. } => key_phase,
            _ => false,
        }
    }
}

/// Handle for applying packet number protection once the payload is sealed.
#[must_use]
pub struct PartialEncode {
    /// Offset and length of the packet number, when the packet has one.
    pn: Option<(usize, usize)>,
}

impl PartialEncode {
    /// Protect the packet number in `buf`, a complete encrypted packet.
    ///
    /// `encrypt_pn` is the host's symmetric packet number cipher, applied in
    /// place to the packet number bytes given the sample.
    pub fn finish<F>(self, buf: &mut [u8], encrypt_pn: F) -> Result<(), ()>
    where
        F: FnOnce(&[u8], &mut [u8]) -> Result<(), ()>,
    {
        let (pn_offset, pn_len) = match self.pn {
            Some(x) => x,
            None => return Ok(()),
        };
        let sample_offset = pn_sample_offset(buf.len(), pn_offset)?;
        let mut sample = [0; PN_SAMPLE_SIZE];
        sample.copy_from_slice(&buf[sample_offset..sample_offset + PN_SAMPLE_SIZE]);
        encrypt_pn(&sample, &mut buf[pn_offset..pn_offset + pn_len])
    }
}

/// Locate the protection sample: 4 bytes past the packet number start,
/// pulled back when the packet is too short to sample there.
fn pn_sample_offset(packet_len: usize, pn_offset: usize) -> Result<usize, ()> {
    if packet_len < pn_offset + 1 + PN_SAMPLE_SIZE {
        return Err(());
    }
    Ok((pn_offset + 4).min(packet_len - PN_SAMPLE_SIZE))
}

/// Patch a long header's length field once the payload size is known.
///
/// The field covers the packet number, the payload, and the AEAD tag.
pub fn set_payload_length(packet: &mut [u8], header_len: usize, pn_len: usize, tag_len: usize) {
    let len = packet.len() - header_len + pn_len + tag_len;
    assert!(len < 2usize.pow(14)); // Fits in reserved two bytes
    BigEndian::write_u16(
        &mut packet[header_len - pn_len - 2..],
        len as u16 | 0b01 << 14,
    );
}

#[derive(Debug)]
pub struct Packet {
    pub header: Header,
    /// Bytes covered by header protection, used as AEAD associated data.
    pub header_data: Bytes,
    /// Encrypted payload, including the AEAD tag.
    pub payload: BytesMut,
}

/// A packet header parsed up to, but not including, packet number removal.
///
/// Splitting decoding in two lets the connection select keys for the
/// packet's encryption level before the protected fields are touched, and
/// yields the remainder of the datagram for coalesced packets.
#[derive(Debug)]
pub struct PartialDecode {
    buf: BytesMut,
    header: PlainHeader,
    /// End of the visible header; packet number bytes follow, when present.
    header_len: usize,
    /// End of this packet within `buf`.
    end: usize,
}

#[derive(Debug)]
enum PlainHeader {
    Initial {
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        token: Bytes,
    },
    Long {
        ty: LongType,
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
    },
    Retry {
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        orig_dst_cid: ConnectionId,
        token: Bytes,
    },
    Short {
        dst_cid: ConnectionId,
        key_phase: bool,
    },
    VersionNegotiate {
        random: u8,
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
    },
}

impl PartialDecode {
    pub fn new(bytes: BytesMut, local_cid_len: usize) -> Result<Self, PacketDecodeError> {
        let mut buf = io::Cursor::new(&bytes[..]);
        let first = buf.get::<u8>()?;
        if first & 0x80 != 0 {
            let version = buf.get::<u32>()?;
            let ci_lengths = buf.get::<u8>()?;
            let dst_cid = decode_cid(&mut buf, decode_cid_len(ci_lengths >> 4))?;
            let src_cid = decode_cid(&mut buf, decode_cid_len(ci_lengths & 0xf))?;
            if version == 0 {
                let header_len = buf.position() as usize;
                let end = bytes.len();
                if (end - header_len) % 4 != 0 {
                    return Err(PacketDecodeError::InvalidHeader(
                        "malformed version negotiation",
                    ));
                }
                return Ok(Self {
                    buf: bytes,
                    header: PlainHeader::VersionNegotiate {
                        random: first & 0x7f,
                        src_cid,
                        dst_cid,
                    },
                    header_len,
                    end,
                });
            }
            if version != VERSION {
                return Err(PacketDecodeError::UnsupportedVersion {
                    source: src_cid,
                    destination: dst_cid,
                });
            }
            match first & 0x7f {
                LONG_TYPE_INITIAL => {
                    let token_len = buf.get_var()? as usize;
                    if buf.remaining() < token_len {
                        return Err(coding::UnexpectedEnd.into());
                    }
                    let token_start = buf.position() as usize;
                    buf.advance(token_len);
                    let token = Bytes::from(&bytes[token_start..token_start + token_len]);
                    let (header_len, end) = Self::finish_long(&mut buf, bytes.len())?;
                    Ok(Self {
                        buf: bytes,
                        header: PlainHeader::Initial {
                            src_cid,
                            dst_cid,
                            token,
                        },
                        header_len,
                        end,
                    })
                }
                LONG_TYPE_RETRY => {
                    let odcil = buf.get::<u8>()?;
                    let orig_dst_cid = decode_cid(&mut buf, decode_cid_len(odcil & 0xf))?;
                    let header_len = buf.position() as usize;
                    let token = Bytes::from(&bytes[header_len..]);
                    let end = bytes.len();
                    Ok(Self {
                        buf: bytes,
                        header: PlainHeader::Retry {
                            src_cid,
                            dst_cid,
                            orig_dst_cid,
                            token,
                        },
                        header_len,
                        end,
                    })
                }
                LONG_TYPE_HANDSHAKE | LONG_TYPE_ZERO_RTT => {
                    let ty = if first & 0x7f == LONG_TYPE_HANDSHAKE {
                        LongType::Handshake
                    } else {
                        LongType::ZeroRtt
                    };
                    let (header_len, end) = Self::finish_long(&mut buf, bytes.len())?;
                    Ok(Self {
                        buf: bytes,
                        header: PlainHeader::Long {
                            ty,
                            src_cid,
                            dst_cid,
                        },
                        header_len,
                        end,
                    })
                }
                _ => Err(PacketDecodeError::UnknownType),
            }
        } else {
            if first & 0x30 != 0x30 {
                return Err(PacketDecodeError::InvalidHeader("malformed short header"));
            }
            let dst_cid = decode_cid(&mut buf, local_cid_len)?;
            let header_len = buf.position() as usize;
            let end = bytes.len();
            Ok(Self {
                buf: bytes,
                header: PlainHeader::Short {
                    dst_cid,
                    key_phase: first & 0x40 != 0,
                },
                header_len,
                end,
            })
        }
    }

    /// Read a long header's length field and bound the packet within the
    /// datagram.
    fn finish_long(
        buf: &mut io::Cursor<&[u8]>,
        total: usize,
    ) -> Result<(usize, usize), PacketDecodeError> {
        let len = buf.get_var()? as usize;
        let header_len = buf.position() as usize;
        if total - header_len < len {
            return Err(coding::UnexpectedEnd.into());
        }
        Ok((header_len, header_len + len))
    }

    pub fn dst_cid(&self) -> ConnectionId {
        use self::PlainHeader::*;
        match self.header {
            Initial { dst_cid, .. }
            | Long { dst_cid, .. }
            | Retry { dst_cid, .. }
            | Short { dst_cid, .. }
            | VersionNegotiate { dst_cid, .. } => dst_cid,
        }
    }

    pub fn has_long_header(&self) -> bool {
        match self.header {
            PlainHeader::Short { .. } => false,
            _ => true,
        }
    }

    pub fn is_initial(&self) -> bool {
        match self.header {
            PlainHeader::Initial { .. } => true,
            _ => false,
        }
    }

    pub fn is_handshake(&self) -> bool {
        match self.header {
            PlainHeader::Long {
                ty: LongType::Handshake,
                ..
            } => true,
            _ => false,
        }
    }

    pub fn is_0rtt(&self) -> bool {
        match self.header {
            PlainHeader::Long {
                ty: LongType::ZeroRtt,
                ..
            } => true,
            _ => false,
        }
    }

    pub fn is_short(&self) -> bool {
        match self.header {
            PlainHeader::Short { .. } => true,
            _ => false,
        }
    }

    /// Whether packet number protection must be removed to finish decoding.
    pub fn is_protected(&self) -> bool {
        match self.header {
            PlainHeader::Retry { .. } | PlainHeader::VersionNegotiate { .. } => false,
            _ => true,
        }
    }

    /// Complete decoding, removing packet number protection with the host's
    /// symmetric cipher.
    ///
    /// Returns the packet and any bytes of the datagram that belong to
    /// coalesced packets following this one.
    pub fn finish<F>(
        self,
        decrypt_pn: F,
    ) -> Result<(Packet, Option<BytesMut>), PacketDecodeError>
    where
        F: FnOnce(&[u8], &mut [u8]) -> Result<(), ()>,
    {
        let Self {
            mut buf,
            header,
            header_len,
            end,
        } = self;
        let mut packet = buf.split_to(end);
        let rest = if buf.is_empty() { None } else { Some(buf) };

        let header = match header {
            PlainHeader::Retry {
                src_cid,
                dst_cid,
                orig_dst_cid,
                token,
            } => {
                let header_data = packet.split_to(header_len).freeze();
                return Ok((
                    Packet {
                        header: Header::Retry {
                            src_cid,
                            dst_cid,
                            orig_dst_cid,
                            token,
                        },
                        header_data,
                        payload: packet,
                    },
                    rest,
                ));
            }
            PlainHeader::VersionNegotiate {
                random,
                src_cid,
                dst_cid,
            } => {
                let header_data = packet.split_to(header_len).freeze();
                return Ok((
                    Packet {
                        header: Header::VersionNegotiate {
                            random,
                            src_cid,
                            dst_cid,
                        },
                        header_data,
                        payload: packet,
                    },
                    rest,
                ));
            }
            other => other,
        };

        let sample_offset = pn_sample_offset(packet.len(), header_len)
            .map_err(|()| PacketDecodeError::InvalidHeader("packet too short to sample"))?;
        let mut sample = [0; PN_SAMPLE_SIZE];
        sample.copy_from_slice(&packet[sample_offset..sample_offset + PN_SAMPLE_SIZE]);
        // Decrypt up to four candidate bytes; the keystream prefix property
        // of the packet number cipher makes the unused tail harmless.
        let avail = (packet.len() - PN_SAMPLE_SIZE - header_len).min(4);
        let mut pn_bytes = [0; 4];
        pn_bytes[..avail].copy_from_slice(&packet[header_len..header_len + avail]);
        decrypt_pn(&sample, &mut pn_bytes[..avail])
            .map_err(|()| PacketDecodeError::InvalidHeader("packet number unprotect failed"))?;
        let pn_len = PacketNumber::decode_len(pn_bytes[0]);
        if pn_len > avail {
            return Err(PacketDecodeError::InvalidHeader("truncated packet number"));
        }
        let number = PacketNumber::decode(&pn_bytes);
        packet[header_len..header_len + pn_len].copy_from_slice(&pn_bytes[..pn_len]);

        let header = match header {
            PlainHeader::Initial {
                src_cid,
                dst_cid,
                token,
            } => Header::Initial {
                src_cid,
                dst_cid,
                token,
                number,
            },
            PlainHeader::Long {
                ty,
                src_cid,
                dst_cid,
            } => Header::Long {
                ty,
                src_cid,
                dst_cid,
                number,
            },
            PlainHeader::Short { dst_cid, key_phase } => Header::Short {
                dst_cid,
                number,
                key_phase,
            },
            _ => unreachable!(),
        };
        let header_data = packet.split_to(header_len + pn_len).freeze();
        Ok((
            Packet {
                header,
                header_data,
                payload: packet,
            },
            rest,
        ))
    }
}

#[derive(Debug, Fail, Clone, PartialEq, Eq)]
pub enum PacketDecodeError {
    #[fail(display = "unsupported version")]
    UnsupportedVersion {
        source: ConnectionId,
        destination: ConnectionId,
    },
    #[fail(display = "invalid header: {}", _0)]
    InvalidHeader(&'static str),
    #[fail(display = "unknown long packet type")]
    UnknownType,
}

impl From<coding::UnexpectedEnd> for PacketDecodeError {
    fn from(_: coding::UnexpectedEnd) -> Self {
        PacketDecodeError::InvalidHeader("unexpected end of packet")
    }
}

/// Build a Version Negotiation packet listing `supported`, preceded by a
/// reserved version to exercise peers' handling of unknown versions.
pub fn write_version_negotiation(
    random: u8,
    dst_cid: &ConnectionId,
    src_cid: &ConnectionId,
    supported: &[u32],
    buf: &mut Vec<u8>,
) {
    Header::VersionNegotiate {
        random,
        src_cid: *src_cid,
        dst_cid: *dst_cid,
    }
    .encode(buf);
    buf.write(::RESERVED_VERSION);
    for &version in supported {
        buf.write(version);
    }
}

/// Build a Retry packet carrying a fresh source CID and an address
/// validation token, echoing the client's original destination CID.
pub fn write_retry(
    dst_cid: &ConnectionId,
    src_cid: &ConnectionId,
    orig_dst_cid: &ConnectionId,
    token: &[u8],
    buf: &mut Vec<u8>,
) {
    Header::Retry {
        src_cid: *src_cid,
        dst_cid: *dst_cid,
        orig_dst_cid: *orig_dst_cid,
        token: token.into(),
    }
    .encode(buf);
}

/// Build a Stateless Reset: an unintelligible short packet whose final 16
/// bytes are the reset token for the connection being reset.
pub fn write_stateless_reset<R: Rng>(
    rng: &mut R,
    token: &[u8; RESET_TOKEN_SIZE],
    padding: usize,
    buf: &mut Vec<u8>,
) {
    buf.write(0x30u8);
    let start = buf.len();
    buf.resize(start + padding.max(4), 0);
    rng.fill_bytes(&mut buf[start..]);
    buf.extend_from_slice(token);
}

#[cfg(test)]
mod test {
    use super::*;

    fn identity_pn(_sample: &[u8], _pn: &mut [u8]) -> Result<(), ()> {
        Ok(())
    }

    #[test]
    fn pn_encode_decode() {
        for &(pn, len) in &[
            (PacketNumber::U8(0x7f), 1),
            (PacketNumber::U16(0x3fff), 2),
            (PacketNumber::U32(0x3fff_ffff), 4),
        ] {
            let mut buf = Vec::new();
            pn.encode(&mut buf);
            assert_eq!(buf.len(), len);
            assert_eq!(PacketNumber::decode_len(buf[0]), len);
            assert_eq!(PacketNumber::decode(&buf), pn);
        }
    }

    #[test]
    fn pn_expand_window() {
        // Candidates must land within the half-window around largest + 1.
        assert_eq!(PacketNumber::U8(0).expand(0x7f), 0x80);
        assert_eq!(PacketNumber::U8(0x10).expand(0x7f), 0x90);
        assert_eq!(PacketNumber::U16(0x100).expand(0xa81f), 0xc100);
        assert_eq!(PacketNumber::U32(0x23).expand(0x3fff_fff0), 0x4000_0023);
        // Reordered packets resolve backwards.
        assert_eq!(PacketNumber::U8(0x7e).expand(0x80), 0x7e);
    }

    #[test]
    fn short_header_roundtrip() {
        let dcid = ConnectionId::new(&[0xab; 8]);
        let number = PacketNumber::U16(0x1234);
        let mut buf = Vec::new();
        let partial = Header::Short {
            dst_cid: dcid,
            number,
            key_phase: true,
        }
        .encode(&mut buf);
        buf.extend_from_slice(&[0; 32]); // stand-in payload + tag
        partial.finish(&mut buf, identity_pn).unwrap();

        let decode = PartialDecode::new(buf[..].into(), 8).unwrap();
        assert!(decode.is_short());
        assert_eq!(decode.dst_cid(), dcid);
        let (packet, rest) = decode.finish(identity_pn).unwrap();
        assert!(rest.is_none());
        match packet.header {
            Header::Short {
                dst_cid,
                number: got,
                key_phase,
            } => {
                assert_eq!(dst_cid, dcid);
                assert_eq!(got, number);
                assert!(key_phase);
            }
            _ => panic!("wrong header variant"),
        }
    }

    #[test]
    fn initial_roundtrip_and_length() {
        let dcid = ConnectionId::new(&hex!("0011223344556677"));
        let scid = ConnectionId::new(&hex!("8899aabbccddeeff"));
        let mut buf = Vec::new();
        let header = Header::Initial {
            src_cid: scid,
            dst_cid: dcid,
            token: Bytes::from(&b"tok"[..]),
            number: PacketNumber::U8(0x21),
        };
        let partial = header.encode(&mut buf);
        let header_len = buf.len();
        // 48 bytes standing in for the sealed payload, tag included.
        buf.extend_from_slice(&[0; 48]);
        set_payload_length(&mut buf, header_len, 1, 0);
        partial.finish(&mut buf, identity_pn).unwrap();
        // A coalesced packet's bytes follow the declared length.
        let trailing = [0xffu8; 3];
        let mut datagram = buf.clone();
        datagram.extend_from_slice(&trailing);

        let decode = PartialDecode::new(datagram[..].into(), 8).unwrap();
        assert!(decode.is_initial());
        let (packet, rest) = decode.finish(identity_pn).unwrap();
        // Length covered pn + payload; the remainder is handed back.
        assert_eq!(packet.payload.len(), 48);
        assert_eq!(&rest.unwrap()[..], &trailing[..]);
        match packet.header {
            Header::Initial {
                src_cid,
                dst_cid,
                ref token,
                number,
            } => {
                assert_eq!((src_cid, dst_cid), (scid, dcid));
                assert_eq!(&token[..], b"tok");
                assert_eq!(number, PacketNumber::U8(0x21));
            }
            _ => panic!("wrong header variant"),
        }
    }

    #[test]
    fn retry_roundtrip() {
        let mut buf = Vec::new();
        let dcid = ConnectionId::new(&[1; 8]);
        let scid = ConnectionId::new(&[2; 8]);
        let odcid = ConnectionId::new(&[3; 18]);
        write_retry(&dcid, &scid, &odcid, b"address-token", &mut buf);
        let decode = PartialDecode::new(buf[..].into(), 8).unwrap();
        assert!(!decode.is_protected());
        let (packet, rest) = decode.finish(identity_pn).unwrap();
        assert!(rest.is_none());
        match packet.header {
            Header::Retry {
                orig_dst_cid,
                ref token,
                ..
            } => {
                assert_eq!(orig_dst_cid, odcid);
                assert_eq!(&token[..], b"address-token");
            }
            _ => panic!("wrong header variant"),
        }
    }

    #[test]
    fn version_negotiation_detected_by_zero_version() {
        let mut buf = Vec::new();
        write_version_negotiation(
            0x5a,
            &ConnectionId::new(&[7; 8]),
            &ConnectionId::new(&[8; 8]),
            &[::VERSION],
            &mut buf,
        );
        let decode = PartialDecode::new(buf[..].into(), 8).unwrap();
        let (packet, _) = decode.finish(identity_pn).unwrap();
        match packet.header {
            Header::VersionNegotiate { random, .. } => assert_eq!(random, 0x5a),
            _ => panic!("wrong header variant"),
        }
        assert_eq!(packet.payload.len(), 8); // reserved + our version
    }

    #[test]
    fn stateless_reset_tail_is_token() {
        let mut rng = ::rand::thread_rng();
        let token = [0x5c; RESET_TOKEN_SIZE];
        let mut buf = Vec::new();
        write_stateless_reset(&mut rng, &token, 23, &mut buf);
        assert_eq!(&buf[buf.len() - RESET_TOKEN_SIZE..], &token[..]);
        assert_eq!(buf[0] & 0x80, 0);
    }

    #[test]
    fn unknown_long_type_rejected() {
        let mut buf = vec![0x80 | 0x60, 0xff, 0, 0, 0x0f, 0];
        buf.extend_from_slice(&[0; 24]);
        assert_matches!(
            PartialDecode::new(buf[..].into(), 0),
            Err(PacketDecodeError::UnknownType)
        );
    }
}
