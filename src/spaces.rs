use std::collections::{BTreeMap, VecDeque};
use std::ops::{AddAssign, Range};

use bytes::Bytes;
use fnv::FnvHashSet;

use assembler::Assembler;
use crypto::KeyPair;
use frame;
use range_set::RangeSet;
use {Error, StreamId, MAX_PACKET_NUMBER};

/// The three packet number spaces. 0-RTT and 1-RTT share `Data`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum SpaceId {
    Initial = 0,
    Handshake = 1,
    Data = 2,
}

impl SpaceId {
    pub const VALUES: [SpaceId; 3] = [SpaceId::Initial, SpaceId::Handshake, SpaceId::Data];
}

/// Per-space transmission state: the reliable transmission buffer, pending
/// acknowledgements, and the space's handshake byte stream.
pub struct PacketSpace {
    pub crypto: CryptoStream,
    pub pending: Retransmits,
    /// Packet numbers to acknowledge.
    pub pending_acks: RangeSet,
    /// Set iff we have received an ack-eliciting frame since the last
    /// ack-only packet we sent.
    pub permit_ack_only: bool,
    /// Largest packet number received.
    pub rx_packet: u64,
    /// Receipt time of `rx_packet`.
    pub rx_packet_time: u64,
    /// Every packet number ever accepted, for replay rejection.
    pub dedup: RangeSet,
    pub next_packet_number: u64,
    pub largest_acked_packet: u64,
    /// Transmitted but not acknowledged or lost.
    pub sent_packets: BTreeMap<u64, SentPacket>,
    /// Keys protecting this space's packets, absent until installed.
    pub keys: Option<KeyPair>,
}

impl PacketSpace {
    pub fn new() -> Self {
        Self {
            crypto: CryptoStream::default(),
            pending: Retransmits::default(),
            pending_acks: RangeSet::new(),
            permit_ack_only: false,
            rx_packet: 0,
            rx_packet_time: 0,
            dedup: RangeSet::new(),
            next_packet_number: 0,
            largest_acked_packet: 0,
            sent_packets: BTreeMap::new(),
            keys: None,
        }
    }

    pub fn get_tx_number(&mut self) -> Result<u64, Error> {
        if self.next_packet_number >= MAX_PACKET_NUMBER {
            return Err(Error::PktNumExhausted);
        }
        let x = self.next_packet_number;
        self.next_packet_number += 1;
        Ok(x)
    }

    /// Whether any ack-eliciting packet is awaiting acknowledgement.
    pub fn retransmittable_in_flight(&self) -> bool {
        self.sent_packets.values().any(|x| x.ack_eliciting)
    }
}

/// Record of one transmitted packet, retained until acknowledged or lost.
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub time: u64,
    /// Size on the wire; 0 iff the packet does not count toward bytes in
    /// flight.
    pub bytes: u16,
    pub pn_len: u8,
    pub ack_eliciting: bool,
    /// Acknowledgement ranges the packet carried, so they can stop being
    /// re-sent once this packet is acknowledged.
    pub acks: RangeSet,
    /// Control frames to reinstate on loss.
    pub retransmits: Retransmits,
    /// Stream data carried, held by reference for release or requeueing.
    pub stream_frames: Vec<frame::Stream>,
    pub crypto_frames: Vec<frame::Crypto>,
}

impl SentPacket {
    pub fn ack_only(&self) -> bool {
        !self.ack_eliciting
    }
}

/// Control frames waiting to be sent, or re-sent after loss.
#[derive(Debug, Clone)]
pub struct Retransmits {
    pub ping: bool,
    pub max_data: bool,
    pub max_stream_data: FnvHashSet<StreamId>,
    pub max_uni_stream_id: bool,
    pub max_bi_stream_id: bool,
    pub blocked: Option<u64>,
    pub stream_blocked: VecDeque<(StreamId, u64)>,
    pub uni_stream_id_blocked: bool,
    pub bi_stream_id_blocked: bool,
    pub rst_stream: Vec<(StreamId, u16)>,
    pub stop_sending: Vec<(StreamId, u16)>,
    pub retire_connection_id: Vec<u64>,
    pub path_challenge: Option<u64>,
    /// Packet number that most recently carried a challenge, and the token
    /// to echo.
    pub path_response: Option<(u64, u64)>,
}

impl Retransmits {
    pub fn is_empty(&self) -> bool {
        !self.ping
            && !self.max_data
            && self.max_stream_data.is_empty()
            && !self.max_uni_stream_id
            && !self.max_bi_stream_id
            && self.blocked.is_none()
            && self.stream_blocked.is_empty()
            && !self.uni_stream_id_blocked
            && !self.bi_stream_id_blocked
            && self.rst_stream.is_empty()
            && self.stop_sending.is_empty()
            && self.retire_connection_id.is_empty()
            && self.path_challenge.is_none()
            && self.path_response.is_none()
    }

    /// Record a PATH_CHALLENGE to be answered, superseding any older one.
    pub fn path_challenged(&mut self, packet: u64, token: u64) {
        match self.path_response {
            Some((existing, _)) if packet <= existing => {}
            _ => {
                self.path_response = Some((packet, token));
            }
        }
    }
}

impl Default for Retransmits {
    fn default() -> Self {
        Self {
            ping: false,
            max_data: false,
            max_stream_data: FnvHashSet::default(),
            max_uni_stream_id: false,
            max_bi_stream_id: false,
            blocked: None,
            stream_blocked: VecDeque::new(),
            uni_stream_id_blocked: false,
            bi_stream_id_blocked: false,
            rst_stream: Vec::new(),
            stop_sending: Vec::new(),
            retire_connection_id: Vec::new(),
            path_challenge: None,
            path_response: None,
        }
    }
}

impl AddAssign for Retransmits {
    fn add_assign(&mut self, rhs: Self) {
        self.ping |= rhs.ping;
        self.max_data |= rhs.max_data;
        self.max_stream_data.extend(&rhs.max_stream_data);
        self.max_uni_stream_id |= rhs.max_uni_stream_id;
        self.max_bi_stream_id |= rhs.max_bi_stream_id;
        if let Some(x) = rhs.blocked {
            self.blocked = Some(x);
        }
        self.stream_blocked.extend(rhs.stream_blocked);
        self.uni_stream_id_blocked |= rhs.uni_stream_id_blocked;
        self.bi_stream_id_blocked |= rhs.bi_stream_id_blocked;
        self.rst_stream.extend_from_slice(&rhs.rst_stream);
        self.stop_sending.extend_from_slice(&rhs.stop_sending);
        self.retire_connection_id
            .extend_from_slice(&rhs.retire_connection_id);
        if let Some(x) = rhs.path_challenge {
            self.path_challenge = Some(x);
        }
        if let Some((packet, token)) = rhs.path_response {
            self.path_challenged(packet, token);
        }
    }
}

/// One encryption level's ordered handshake byte stream.
///
/// Outgoing data is queued by offset for (re)transmission; incoming CRYPTO
/// frames reassemble here and drain to the TLS collaborator in order.
#[derive(Default)]
pub struct CryptoStream {
    pub rx: Assembler,
    /// Offset assigned to the next submitted byte.
    pub tx_offset: u64,
    pending: BTreeMap<u64, Bytes>,
    acked: RangeSet,
    acked_prefix: u64,
    /// Everything ever submitted, in production order, so the first flight
    /// can be replayed after a Retry.
    history: Vec<Bytes>,
}

impl CryptoStream {
    /// Queue handshake bytes produced by the TLS stack.
    pub fn submit(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.pending.insert(self.tx_offset, data.clone());
        self.tx_offset += data.len() as u64;
        self.history.push(data);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pop(&mut self, max_len: usize) -> Option<(u64, Bytes)> {
        let &offset = self.pending.keys().next()?;
        if max_len == 0 {
            return None;
        }
        let mut data = self.pending.remove(&offset).unwrap();
        if data.len() > max_len {
            let rest = data.split_off(max_len);
            self.pending.insert(offset + max_len as u64, rest);
        }
        Some((offset, data))
    }

    pub fn requeue(&mut self, offset: u64, data: Bytes) {
        if !data.is_empty() {
            self.pending.insert(offset, data);
        }
    }

    /// Record acknowledged bytes; returns the newly contiguous range for
    /// monotone release reporting.
    pub fn ack(&mut self, offset: u64, len: u64) -> Option<Range<u64>> {
        if len > 0 {
            self.acked.insert(offset..offset + len);
        }
        let prev = self.acked_prefix;
        self.acked_prefix = self.acked.prefix_end(0);
        if self.acked_prefix > prev {
            Some(prev..self.acked_prefix)
        } else {
            None
        }
    }

    /// Requeue every submitted byte from offset zero, forgetting
    /// acknowledgement state. Used when a Retry voids the first flight.
    pub fn rewind(&mut self) {
        self.pending.clear();
        self.acked = RangeSet::new();
        self.acked_prefix = 0;
        let mut offset = 0;
        for chunk in &self.history {
            self.pending.insert(offset, chunk.clone());
            offset += chunk.len() as u64;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tx_numbers_are_strictly_increasing() {
        let mut space = PacketSpace::new();
        assert_eq!(space.get_tx_number().unwrap(), 0);
        assert_eq!(space.get_tx_number().unwrap(), 1);
        assert_eq!(space.get_tx_number().unwrap(), 2);
    }

    #[test]
    fn tx_number_exhaustion_is_fatal() {
        let mut space = PacketSpace::new();
        space.next_packet_number = MAX_PACKET_NUMBER;
        assert_matches!(space.get_tx_number(), Err(Error::PktNumExhausted));
    }

    #[test]
    fn crypto_stream_offsets_accumulate() {
        let mut crypto = CryptoStream::default();
        crypto.submit(Bytes::from(&b"hello"[..]));
        crypto.submit(Bytes::from(&b"world"[..]));
        assert_eq!(crypto.pop(3), Some((0, Bytes::from(&b"hel"[..]))));
        assert_eq!(crypto.pop(usize::max_value()), Some((3, Bytes::from(&b"lo"[..]))));
        assert_eq!(crypto.pop(usize::max_value()), Some((5, Bytes::from(&b"world"[..]))));
        assert_eq!(crypto.pop(usize::max_value()), None);
    }

    #[test]
    fn crypto_rewind_replays_history() {
        let mut crypto = CryptoStream::default();
        crypto.submit(Bytes::from(&b"clienthello"[..]));
        let _ = crypto.pop(usize::max_value()).unwrap();
        assert!(crypto.ack(0, 5).is_some());
        crypto.rewind();
        assert_eq!(
            crypto.pop(usize::max_value()),
            Some((0, Bytes::from(&b"clienthello"[..])))
        );
        // Prior acks were voided.
        assert!(crypto.ack(0, 11).is_some());
    }

    #[test]
    fn path_response_prefers_newest_challenge() {
        let mut pending = Retransmits::default();
        pending.path_challenged(1, 0xaaaa);
        pending.path_challenged(3, 0xcccc);
        pending.path_challenged(2, 0xbbbb);
        assert_eq!(pending.path_response, Some((3, 0xcccc)));
    }
}
