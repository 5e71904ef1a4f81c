use std::collections::BTreeMap;
use std::ops::Range;

use bytes::Bytes;
use fnv::FnvHashMap;

use assembler::Assembler;
use range_set::RangeSet;
use {Directionality, Error, Side, StreamId};

/// Application error code reserved for RST_STREAM sent in answer to
/// STOP_SENDING. Public shutdown interfaces reject it.
pub const STOPPING: u16 = 0;

#[derive(Debug)]
pub struct Stream {
    pub send: Option<Send>,
    pub recv: Option<Recv>,
}

impl Stream {
    pub fn new_bi(send_credit: u64, recv_window: u64) -> Self {
        Stream {
            send: Some(Send::new(send_credit)),
            recv: Some(Recv::new(recv_window)),
        }
    }

    pub fn new_uni_out(send_credit: u64) -> Self {
        Stream {
            send: Some(Send::new(send_credit)),
            recv: None,
        }
    }

    pub fn new_uni_in(recv_window: u64) -> Self {
        Stream {
            send: None,
            recv: Some(Recv::new(recv_window)),
        }
    }

    /// Both halves, where present, have reached a terminal state.
    pub fn is_closed(&self) -> bool {
        self.send.as_ref().map_or(true, |x| x.is_closed())
            && self.recv.as_ref().map_or(true, |x| x.is_closed())
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendState {
    /// Open for new data, none queued yet.
    Ready,
    /// Data queued or in flight.
    Send,
    /// All data and fin transmitted.
    DataSent,
    /// All data and fin acknowledged.
    DataRecvd,
    ResetSent {
        stop_reason: Option<u16>,
    },
    ResetRecvd {
        stop_reason: Option<u16>,
    },
}

impl SendState {
    pub fn was_reset(self) -> bool {
        match self {
            SendState::ResetSent { .. } | SendState::ResetRecvd { .. } => true,
            _ => false,
        }
    }
}

/// The outgoing half of a stream.
#[derive(Debug)]
pub struct Send {
    pub state: SendState,
    /// Next fresh byte to accept from the application.
    pub offset: u64,
    /// Credit received from the peer.
    pub max_data: u64,
    /// Bytes queued for transmission or retransmission, keyed by offset.
    pending: BTreeMap<u64, Bytes>,
    /// Ranges the peer has acknowledged.
    acked: RangeSet,
    /// End of the contiguous acknowledged prefix already reported.
    acked_prefix: u64,
    pub fin_offset: Option<u64>,
    fin_pending: bool,
    fin_acked: bool,
    pub bytes_in_flight: u64,
    /// Offset at which a STREAM_BLOCKED was last signalled, to advise at
    /// most once per blocker.
    pub blocked_at: Option<u64>,
}

impl Send {
    pub fn new(max_data: u64) -> Self {
        Self {
            state: SendState::Ready,
            offset: 0,
            max_data,
            pending: BTreeMap::new(),
            acked: RangeSet::new(),
            acked_prefix: 0,
            fin_offset: None,
            fin_pending: false,
            fin_acked: false,
            bytes_in_flight: 0,
            blocked_at: None,
        }
    }

    /// How much new data may currently be accepted.
    pub fn write_budget(&mut self) -> Result<u64, WriteError> {
        if let SendState::ResetSent {
            stop_reason: Some(error_code),
        } = self.state
        {
            return Err(WriteError::Stopped { error_code });
        }
        if self.fin_offset.is_some() || self.state.was_reset() {
            return Err(WriteError::Finished);
        }
        if self.offset >= self.max_data {
            return Err(WriteError::Blocked);
        }
        Ok(self.max_data - self.offset)
    }

    /// Accept fresh application data.
    pub fn queue(&mut self, data: Bytes) {
        debug_assert!(self.fin_offset.is_none());
        self.requeue(self.offset, data.clone());
        self.offset += data.len() as u64;
        if let SendState::Ready = self.state {
            self.state = SendState::Send;
        }
    }

    /// Put bytes back on the queue, e.g. after their packet was lost.
    pub fn requeue(&mut self, offset: u64, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.pending.insert(offset, data);
    }

    pub fn requeue_fin(&mut self) {
        if self.fin_offset.is_some() && !self.fin_acked {
            self.fin_pending = true;
        }
    }

    /// Mark the end of the stream at the current offset.
    pub fn finish(&mut self) {
        debug_assert!(self.fin_offset.is_none());
        self.fin_offset = Some(self.offset);
        self.fin_pending = true;
        if let SendState::Ready = self.state {
            self.state = SendState::Send;
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty() || self.fin_pending
    }

    /// Take up to `max_len` queued bytes from the front of the queue.
    ///
    /// Returns the frame's offset, data, and fin flag.
    pub fn pop(&mut self, max_len: usize) -> Option<(u64, Bytes, bool)> {
        if let Some(&offset) = self.pending.keys().next() {
            if max_len == 0 {
                return None;
            }
            let mut data = self.pending.remove(&offset).unwrap();
            if data.len() > max_len {
                let rest = data.split_off(max_len);
                self.pending.insert(offset + max_len as u64, rest);
            }
            let end = offset + data.len() as u64;
            let fin =
                self.fin_pending && self.pending.is_empty() && Some(end) == self.fin_offset;
            if fin {
                self.fin_pending = false;
            }
            self.bytes_in_flight += data.len() as u64;
            Some((offset, data, fin))
        } else if self.fin_pending {
            self.fin_pending = false;
            Some((self.fin_offset.unwrap(), Bytes::new(), true))
        } else {
            None
        }
    }

    /// Record an acknowledged frame; returns the newly contiguous range of
    /// acknowledged bytes, if the prefix advanced.
    pub fn ack_frame(&mut self, offset: u64, len: u64, fin: bool) -> Option<Range<u64>> {
        if fin {
            self.fin_acked = true;
        }
        if len > 0 {
            self.acked.insert(offset..offset + len);
        }
        let prev = self.acked_prefix;
        self.acked_prefix = self.acked.prefix_end(0);
        if self.fin_acked && Some(self.acked_prefix) == self.fin_offset {
            if let SendState::DataSent = self.state {
                self.state = SendState::DataRecvd;
            }
        }
        if self.acked_prefix > prev {
            Some(prev..self.acked_prefix)
        } else {
            None
        }
    }

    /// Whether every transmitted byte and the fin are acknowledged.
    pub fn is_fully_acked(&self) -> bool {
        self.fin_acked && Some(self.acked_prefix) == self.fin_offset
    }

    /// Abandon transmission, dropping queued data.
    pub fn reset(&mut self, stop_reason: Option<u16>) {
        self.pending.clear();
        self.fin_pending = false;
        self.state = SendState::ResetSent { stop_reason };
    }

    pub fn is_closed(&self) -> bool {
        match self.state {
            SendState::DataRecvd | SendState::ResetRecvd { .. } => true,
            _ => false,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RecvState {
    /// Receiving data, final size unknown.
    Recv,
    /// Fin seen; the final offset is fixed.
    SizeKnown { size: u64 },
    /// All bytes up to the final offset received.
    DataRecvd { size: u64 },
    /// Everything delivered to the application.
    DataRead,
    ResetRecvd { size: u64, error_code: u16 },
    ResetRead,
}

/// The incoming half of a stream.
#[derive(Debug)]
pub struct Recv {
    pub state: RecvState,
    /// Ranges received, whether or not contiguous.
    pub recvd: RangeSet,
    pub assembler: Assembler,
    /// Absolute credit advertised to the peer.
    pub max_data: u64,
    /// Credit accrued from consumption but not yet advertised.
    pub unsent_max_data: u64,
    /// Advertised window size, fixing the re-advertise threshold.
    window: u64,
    /// One past the highest offset seen.
    pub last_rx_offset: u64,
    /// STOP_SENDING has been issued locally.
    pub stopped: bool,
}

impl Recv {
    pub fn new(window: u64) -> Self {
        Self {
            state: RecvState::Recv,
            recvd: RangeSet::new(),
            assembler: Assembler::new(),
            max_data: window,
            unsent_max_data: window,
            window,
            last_rx_offset: 0,
            stopped: false,
        }
    }

    pub fn final_offset(&self) -> Option<u64> {
        match self.state {
            RecvState::SizeKnown { size }
            | RecvState::DataRecvd { size }
            | RecvState::ResetRecvd { size, .. } => Some(size),
            _ => None,
        }
    }

    /// Account for consumed bytes; returns true when enough of the window
    /// has been freed that fresh credit should be advertised.
    pub fn consumed(&mut self, len: u64) -> bool {
        self.unsent_max_data += len;
        !self.stopped
            && self.final_offset().is_none()
            && self.unsent_max_data - self.max_data >= self.window / 2
    }

    pub fn is_finished(&self) -> bool {
        match self.state {
            RecvState::Recv | RecvState::SizeKnown { .. } => false,
            _ => true,
        }
    }

    pub fn is_closed(&self) -> bool {
        match self.state {
            RecvState::DataRead | RecvState::ResetRead => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Fail)]
pub enum WriteError {
    /// The application must wait for flow control credit or less
    /// congestion before retrying.
    #[fail(display = "unable to accept further writes")]
    Blocked,
    /// The peer abandoned reading via STOP_SENDING.
    #[fail(display = "stopped by peer: error {}", error_code)]
    Stopped { error_code: u16 },
    /// The stream was finished or reset locally; no further data may be
    /// written.
    #[fail(display = "stream finished")]
    Finished,
}

/// All streams of a connection, keyed by id, with the open/accept
/// watermarks for each class.
pub struct Streams {
    pub streams: FnvHashMap<StreamId, Stream>,
    /// Next index to assign for locally initiated streams.
    next_uni: u64,
    next_bi: u64,
    /// Stream count budgets granted by the peer.
    pub max_uni: u64,
    pub max_bi: u64,
    /// Highest remotely initiated index implicitly or explicitly opened,
    /// plus one.
    next_remote_uni: u64,
    next_remote_bi: u64,
    /// Stream count budgets we granted the peer.
    pub max_remote_uni: u64,
    pub max_remote_bi: u64,
}

impl Streams {
    pub fn new(max_remote_uni: u64, max_remote_bi: u64) -> Self {
        Self {
            streams: FnvHashMap::default(),
            next_uni: 0,
            next_bi: 0,
            max_uni: 0,
            max_bi: 0,
            next_remote_uni: 0,
            next_remote_bi: 0,
            max_remote_uni,
            max_remote_bi,
        }
    }

    /// Open a locally initiated stream within the peer's stream budget.
    pub fn open(
        &mut self,
        side: Side,
        direction: Directionality,
        send_credit: u64,
        recv_window: u64,
    ) -> Result<StreamId, Error> {
        let (next, max) = match direction {
            Directionality::Uni => (&mut self.next_uni, self.max_uni),
            Directionality::Bi => (&mut self.next_bi, self.max_bi),
        };
        if *next >= max {
            return Err(Error::StreamIdBlocked);
        }
        let id = StreamId::new(side, direction, *next);
        *next += 1;
        let stream = match direction {
            Directionality::Uni => Stream::new_uni_out(send_credit),
            Directionality::Bi => Stream::new_bi(send_credit, recv_window),
        };
        let old = self.streams.insert(id, stream);
        debug_assert!(old.is_none());
        Ok(id)
    }

    /// Validate a remotely referenced stream id, implicitly opening every
    /// skipped id of its class in order.
    ///
    /// Returns the indices newly opened so the caller can fire open
    /// notifications before touching the target stream.
    pub fn ensure_remote(
        &mut self,
        side: Side,
        id: StreamId,
        send_credit: u64,
        recv_window: u64,
    ) -> Result<Range<u64>, Error> {
        if id.initiator() == side {
            // Our own stream: it must exist now or have existed before.
            let next = match id.directionality() {
                Directionality::Uni => self.next_uni,
                Directionality::Bi => self.next_bi,
            };
            if id.index() >= next || id.directionality() == Directionality::Uni {
                return Err(Error::StreamState);
            }
            return Ok(0..0);
        }
        let (next, max) = match id.directionality() {
            Directionality::Uni => (&mut self.next_remote_uni, self.max_remote_uni),
            Directionality::Bi => (&mut self.next_remote_bi, self.max_remote_bi),
        };
        if id.index() >= max {
            return Err(Error::StreamId);
        }
        let newly = *next..id.index() + 1;
        for index in newly.clone() {
            let stream = match id.directionality() {
                Directionality::Uni => Stream::new_uni_in(recv_window),
                Directionality::Bi => Stream::new_bi(send_credit, recv_window),
            };
            self.streams
                .insert(StreamId::new(!side, id.directionality(), index), stream);
        }
        if newly.end > *next {
            *next = newly.end;
        }
        Ok(newly)
    }

    pub fn get_mut(&mut self, id: &StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(id)
    }

    pub fn get_send_mut(&mut self, id: &StreamId) -> Option<&mut Send> {
        self.streams.get_mut(id)?.send.as_mut()
    }

    pub fn get_recv_mut(&mut self, id: &StreamId) -> Option<&mut Recv> {
        self.streams.get_mut(id)?.recv.as_mut()
    }

    /// The largest stream id currently usable by the peer in `direction`.
    pub fn max_remote_id(&self, side: Side, direction: Directionality) -> StreamId {
        let max = match direction {
            Directionality::Uni => self.max_remote_uni,
            Directionality::Bi => self.max_remote_bi,
        };
        StreamId::new(!side, direction, max.saturating_sub(1))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn send_queue_splits_at_budget() {
        let mut send = Send::new(1000);
        send.queue(Bytes::from(&b"hello world"[..]));
        send.finish();
        let (offset, data, fin) = send.pop(5).unwrap();
        assert_eq!((offset, &data[..], fin), (0, &b"hello"[..], false));
        let (offset, data, fin) = send.pop(100).unwrap();
        assert_eq!((offset, &data[..], fin), (5, &b" world"[..], true));
        assert!(!send.has_pending());
    }

    #[test]
    fn pure_fin_frame() {
        let mut send = Send::new(100);
        send.queue(Bytes::from(&b"x"[..]));
        let _ = send.pop(16).unwrap();
        send.finish();
        assert_matches!(send.pop(16), Some((1, ref data, true)) if data.is_empty());
    }

    #[test]
    fn ack_prefix_is_monotone_and_merges() {
        let mut send = Send::new(1000);
        send.queue(Bytes::from(vec![0; 30]));
        assert_eq!(send.ack_frame(10, 10, false), None);
        assert_eq!(send.ack_frame(0, 10, false), Some(0..20));
        // Duplicate ack does not re-report.
        assert_eq!(send.ack_frame(0, 20, false), None);
        assert_eq!(send.ack_frame(20, 10, false), Some(20..30));
    }

    #[test]
    fn fully_acked_fin_closes_send_half() {
        let mut send = Send::new(100);
        send.queue(Bytes::from(&b"ab"[..]));
        send.finish();
        let _ = send.pop(16).unwrap();
        send.state = SendState::DataSent;
        assert_eq!(send.ack_frame(0, 2, true), Some(0..2));
        assert_eq!(send.state, SendState::DataRecvd);
        assert!(send.is_fully_acked());
    }

    #[test]
    fn implicit_open_reports_skipped_ids() {
        let mut streams = Streams::new(0, 5);
        let id = StreamId::new(Side::Client, Directionality::Bi, 3);
        let newly = streams
            .ensure_remote(Side::Server, id, 1000, 1000)
            .unwrap();
        assert_eq!(newly, 0..4);
        assert!(streams.get_mut(&id).is_some());
        // Already-open ids do not reopen.
        let newly = streams
            .ensure_remote(Side::Server, id, 1000, 1000)
            .unwrap();
        assert_eq!(newly, 4..4);
    }

    #[test]
    fn remote_stream_past_limit_rejected() {
        let mut streams = Streams::new(0, 2);
        let id = StreamId::new(Side::Client, Directionality::Bi, 2);
        assert_matches!(
            streams.ensure_remote(Side::Server, id, 1000, 1000),
            Err(Error::StreamId)
        );
    }

    #[test]
    fn local_open_respects_peer_budget() {
        let mut streams = Streams::new(0, 0);
        streams.max_bi = 1;
        assert_matches!(
            streams.open(Side::Client, Directionality::Bi, 100, 100),
            Ok(StreamId(0))
        );
        assert_matches!(
            streams.open(Side::Client, Directionality::Bi, 100, 100),
            Err(Error::StreamIdBlocked)
        );
    }

    #[test]
    fn recv_readvertises_at_half_window() {
        let mut recv = Recv::new(100);
        assert!(!recv.consumed(49));
        assert!(recv.consumed(1));
    }
}
