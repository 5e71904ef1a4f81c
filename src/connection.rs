use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddrV6;
use std::sync::Arc;
use std::{cmp, mem};

use bytes::{Buf, Bytes, BytesMut};
use constant_time_eq::constant_time_eq;
use slog::{self, Logger};

use coding::BufExt;
use config::Config;
use crypto::{self, EncryptionLevel, KeyPair, Keys, RandContext, Session};
use frame::{self, Frame};
use packet::{
    set_payload_length, ConnectionId, Header, LongType, Packet, PacketDecodeError, PacketNumber,
    PartialDecode,
};
use path::PathValidator;
use range_set::RangeSet;
use spaces::{PacketSpace, Retransmits, SentPacket, SpaceId};
use stream::{RecvState, SendState, Streams, WriteError, STOPPING};
use transport_parameters::TransportParameters;
use {
    Directionality, Error, Side, StreamId, MICROSECONDS, MILLISECONDS, MIN_INITIAL_SIZE, MIN_MTU,
    RESET_TOKEN_SIZE, SECONDS, VERSION,
};

/// Timers the host must schedule on the connection's behalf.
///
/// Expiry timestamps are queried with [`Connection::timer_expiry`]; the host
/// calls [`Connection::handle_timeout`] at or after the reported time.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub enum Timer {
    LossDetection,
    AckDelay,
    Idle,
    /// Ends the closing and draining periods.
    Close,
}

impl Timer {
    pub const VALUES: [Timer; 4] = [
        Timer::LossDetection,
        Timer::AckDelay,
        Timer::Idle,
        Timer::Close,
    ];
}

impl slog::Value for Timer {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{:?}", self))
    }
}

/// A QUIC connection's complete transport state.
///
/// The connection performs no I/O: feed inbound datagrams to `recv`, drain
/// outbound datagrams from `next_packet`, and invoke the timers it exposes.
/// All operations are synchronous, and none may be called from within a
/// collaborator callback.
pub struct Connection<S: Session> {
    log: Logger,
    session: S,
    config: Arc<Config>,
    side: Side,
    state: State,
    /// Destination CID of the very first Initial, which Initial keys and
    /// any Retry are bound to.
    init_cid: ConnectionId,
    loc_cid: ConnectionId,
    rem_cid: ConnectionId,
    remote: SocketAddrV6,
    rem_cid_set: bool,
    /// Whether any packet has been successfully authenticated from the
    /// peer; Retry and Version Negotiation only matter before that.
    got_peer_packet: bool,
    /// Address validation token to carry in Initial headers after Retry.
    retry_token: Bytes,
    /// Token received in a NEW_TOKEN frame, held for the host.
    new_token: Option<Bytes>,
    mtu: u16,
    key_phase: bool,
    /// The peer's transport parameters, once known.
    params: TransportParameters,
    params_set: bool,
    handshake_completed: bool,
    /// Peer-issued connection ids: (sequence, cid, reset token).
    rem_cids: Vec<(u64, ConnectionId, [u8; RESET_TOKEN_SIZE])>,

    spaces: [PacketSpace; 3],
    zero_rtt_keys: Option<KeyPair>,

    //
    // Streams and flow control
    //
    streams: Streams,
    /// Streams with data queued for transmission, drained round-robin.
    pending_streams: VecDeque<StreamId>,
    /// Limit on outgoing data, dictated by peer.
    max_data: u64,
    data_sent: u64,
    /// Sum of end offsets of all streams. Includes gaps, so it's an upper
    /// bound.
    data_recvd: u64,
    /// Limit on incoming data we have advertised.
    local_max_data: u64,
    /// Incoming data limit accrued from consumption but not yet advertised.
    unsent_max_data: u64,
    /// Offset at which a connection-level BLOCKED was last signalled.
    blocked_at: Option<u64>,

    //
    // Loss detection
    //
    /// The number of times all unacknowledged handshake data has been
    /// retransmitted without receiving an ack.
    handshake_count: u32,
    /// The number of times a tail loss probe has been sent without
    /// receiving an ack.
    tlp_count: u32,
    /// The number of times an rto has been sent without receiving an ack.
    rto_count: u32,
    /// The largest packet number gap between the largest acked
    /// retransmittable packet and an unacknowledged retransmittable packet
    /// before it is declared lost.
    reordering_threshold: u32,
    /// The time at which the next packet will be considered lost based on
    /// exceeding the reordering window in time.
    loss_time: u64,
    /// The packet number space `loss_time` was armed for.
    loss_space: SpaceId,
    /// The most recent RTT measurement made when receiving an ack for a
    /// previously unacked packet.
    latest_rtt: u64,
    /// The smoothed RTT of the connection.
    smoothed_rtt: u64,
    /// The RTT variance.
    rttvar: u64,
    /// The minimum RTT seen in the connection, ignoring ack delay.
    min_rtt: u64,
    /// The last packet number sent prior to the first retransmission
    /// timeout.
    largest_sent_before_rto: u64,
    /// The time the most recently sent ack-eliciting packet was sent.
    time_of_last_sent_ack_eliciting_packet: u64,
    /// The time the most recently sent handshake-space packet was sent.
    time_of_last_sent_handshake_packet: u64,
    /// Probe packets that may bypass congestion control.
    probe_pkt_left: u32,
    loss_detection_alarm: Option<u64>,

    //
    // Congestion control
    //
    /// The sum of the size in bytes of all sent packets that contain at
    /// least one ack-eliciting frame, and have not been acked or declared
    /// lost.
    ///
    /// The size does not include IP or UDP overhead. Packets only
    /// containing ACK frames do not count towards this to ensure congestion
    /// control does not impede congestion feedback.
    bytes_in_flight: u64,
    /// Maximum number of bytes in flight that may be sent.
    congestion_window: u64,
    /// Packets sent at or before this time are in the current recovery
    /// epoch, if one is active.
    recovery_start_time: u64,
    /// Slow start threshold in bytes. When the congestion window is below
    /// ssthresh, the mode is slow start and the window grows by the number
    /// of bytes acknowledged.
    ssthresh: u64,

    //
    // Timers
    //
    idle_alarm: Option<u64>,
    ack_alarm: Option<u64>,
    close_alarm: Option<u64>,

    //
    // Path validation
    //
    path_validator: Option<PathValidator>,
    path_validated: bool,

    /// A close frame needs to go out.
    close_pending: bool,
}

enum State {
    Handshake,
    Established,
    Closing(CloseReason),
    Draining,
    Drained,
}

/// Why the connection is being closed.
#[derive(Clone)]
pub enum CloseReason {
    Connection(frame::ConnectionClose),
    Application(frame::ApplicationClose),
}

impl From<::TransportError> for CloseReason {
    fn from(x: ::TransportError) -> Self {
        CloseReason::Connection(x.into())
    }
}

impl<S: Session> Connection<S> {
    /// Initiate a connection to a server reachable at `remote`.
    ///
    /// `rem_cid` is the randomized destination CID Initial protection is
    /// derived from; `loc_cid` is the source CID we will accept replies on.
    pub fn new_client(
        log: Logger,
        config: Arc<Config>,
        mut session: S,
        loc_cid: ConnectionId,
        rem_cid: ConnectionId,
        remote: SocketAddrV6,
    ) -> Result<Self, Error> {
        let keys = session.client_initial(&rem_cid)?;
        let mut this = Self::new(log, config, session, Side::Client, loc_cid, rem_cid, remote);
        this.spaces[SpaceId::Initial as usize].keys = Some(keys);
        this.drive_session()?;
        Ok(this)
    }

    /// Accept a connection from a client.
    ///
    /// Initial keys are derived through the collaborator when the client's
    /// first packet is processed.
    pub fn new_server(
        log: Logger,
        config: Arc<Config>,
        session: S,
        loc_cid: ConnectionId,
        remote: SocketAddrV6,
    ) -> Self {
        Self::new(
            log,
            config,
            session,
            Side::Server,
            loc_cid,
            ConnectionId::new(&[]),
            remote,
        )
    }

    fn new(
        log: Logger,
        config: Arc<Config>,
        session: S,
        side: Side,
        loc_cid: ConnectionId,
        rem_cid: ConnectionId,
        remote: SocketAddrV6,
    ) -> Self {
        let streams = Streams::new(
            u64::from(config.max_remote_uni_streams),
            u64::from(config.max_remote_bi_streams),
        );
        let local_max_data = u64::from(config.receive_window);
        let reordering_threshold = config.reordering_threshold;
        let congestion_window = config.initial_window;
        Self {
            log,
            session,
            side,
            state: State::Handshake,
            init_cid: rem_cid,
            loc_cid,
            rem_cid,
            remote,
            rem_cid_set: side == Side::Server,
            got_peer_packet: false,
            retry_token: Bytes::new(),
            new_token: None,
            mtu: MIN_MTU,
            key_phase: false,
            params: TransportParameters::default(),
            params_set: false,
            handshake_completed: false,
            rem_cids: Vec::new(),

            spaces: [PacketSpace::new(), PacketSpace::new(), PacketSpace::new()],
            zero_rtt_keys: None,

            streams,
            pending_streams: VecDeque::new(),
            max_data: 0,
            data_sent: 0,
            data_recvd: 0,
            local_max_data,
            unsent_max_data: local_max_data,
            blocked_at: None,

            handshake_count: 0,
            tlp_count: 0,
            rto_count: 0,
            reordering_threshold,
            loss_time: 0,
            loss_space: SpaceId::Data,
            latest_rtt: 0,
            smoothed_rtt: 0,
            rttvar: 0,
            min_rtt: u64::max_value(),
            largest_sent_before_rto: 0,
            time_of_last_sent_ack_eliciting_packet: 0,
            time_of_last_sent_handshake_packet: 0,
            probe_pkt_left: 0,
            loss_detection_alarm: None,

            bytes_in_flight: 0,
            congestion_window,
            recovery_start_time: 0,
            ssthresh: u64::max_value(),

            idle_alarm: None,
            ack_alarm: None,
            close_alarm: None,

            path_validator: None,
            path_validated: false,

            close_pending: false,
            config,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn local_id(&self) -> ConnectionId {
        self.loc_cid
    }

    pub fn remote_id(&self) -> ConnectionId {
        self.rem_cid
    }

    pub fn remote_address(&self) -> &SocketAddrV6 {
        &self.remote
    }

    pub fn is_handshaking(&self) -> bool {
        match self.state {
            State::Handshake => true,
            _ => false,
        }
    }

    pub fn is_established(&self) -> bool {
        match self.state {
            State::Established => true,
            _ => false,
        }
    }

    pub fn is_closing(&self) -> bool {
        match self.state {
            State::Closing(_) => true,
            _ => false,
        }
    }

    pub fn is_draining(&self) -> bool {
        match self.state {
            State::Draining => true,
            _ => false,
        }
    }

    pub fn is_drained(&self) -> bool {
        match self.state {
            State::Drained => true,
            _ => false,
        }
    }

    /// The number of bytes of packets containing ack-eliciting frames that
    /// have not been acknowledged or declared lost.
    pub fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    /// Number of bytes worth of non-ack-only packets that may be sent.
    pub fn congestion_state(&self) -> u64 {
        self.congestion_window.saturating_sub(self.bytes_in_flight)
    }

    /// Address validation token received in a NEW_TOKEN frame, for the
    /// host's session cache.
    pub fn take_new_token(&mut self) -> Option<Bytes> {
        self.new_token.take()
    }

    /// Whether the current path passed validation.
    pub fn path_validated(&self) -> bool {
        self.path_validated
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    /// Absolute expiry of `timer`, if armed.
    pub fn timer_expiry(&self, timer: Timer) -> Option<u64> {
        match timer {
            Timer::LossDetection => self.loss_detection_alarm,
            Timer::AckDelay => self.ack_alarm,
            Timer::Idle => self.idle_alarm,
            Timer::Close => self.close_alarm,
        }
    }

    /// Invoke an expired timer, at or after the timestamp reported by
    /// `timer_expiry`.
    pub fn handle_timeout(&mut self, now: u64, timer: Timer) {
        match timer {
            Timer::LossDetection => {
                self.on_loss_detection_timeout(now);
            }
            Timer::AckDelay => {
                // The pending acknowledgements ride the next drained packet.
                self.ack_alarm = None;
            }
            Timer::Idle => {
                trace!(self.log, "idle timeout; draining");
                self.idle_alarm = None;
                self.enter_draining(now);
            }
            Timer::Close => {
                self.close_alarm = None;
                self.state = State::Drained;
            }
        }
    }

    // ---------------------------------------------------------------------
    // Inbound
    // ---------------------------------------------------------------------

    /// Process a UDP datagram received from the peer, including every
    /// coalesced packet it carries.
    pub fn recv(&mut self, now: u64, remote: SocketAddrV6, data: BytesMut) -> Result<(), Error> {
        match self.state {
            State::Drained => return Err(Error::InvalidState),
            State::Draining => return Err(Error::Draining),
            _ => {}
        }
        // Remember the datagram tail for the stateless reset check, which
        // only applies once decryption has failed.
        let reset_tail = if data.len() >= RESET_TOKEN_SIZE {
            let mut tail = [0; RESET_TOKEN_SIZE];
            tail.copy_from_slice(&data[data.len() - RESET_TOKEN_SIZE..]);
            Some(tail)
        } else {
            None
        };

        let mut rest = Some(data);
        while let Some(data) = rest.take() {
            match PartialDecode::new(data, self.config.local_cid_len) {
                Ok(partial_decode) => {
                    match self.handle_decode(now, remote, partial_decode, reset_tail) {
                        Ok(x) => {
                            rest = x;
                        }
                        Err(Error::DiscardPkt) => {
                            // Plausibly corruption or somebody else's
                            // packet; drop the rest of the datagram.
                            return Ok(());
                        }
                        Err(e) => {
                            self.handle_error(now, &e);
                            return Err(e);
                        }
                    }
                }
                Err(PacketDecodeError::UnsupportedVersion { .. }) => {
                    debug!(self.log, "dropping packet with unsupported version");
                    return Ok(());
                }
                Err(e) => {
                    trace!(self.log, "unable to decode packet header"; "reason" => %e);
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Put the connection on the appropriate terminal path for `error`.
    fn handle_error(&mut self, now: u64, error: &Error) {
        if error.is_fatal() {
            self.state = State::Drained;
            return;
        }
        match self.state {
            State::Closing(_) | State::Draining | State::Drained => {}
            _ => {
                debug!(self.log, "closing on protocol error"; "error" => %error);
                self.initiate_close(now, error.transport_error_code().into());
            }
        }
    }

    fn initiate_close(&mut self, now: u64, reason: CloseReason) {
        self.state = State::Closing(reason);
        self.close_pending = true;
        self.arm_close_timer(now);
    }

    fn enter_draining(&mut self, now: u64) {
        self.state = State::Draining;
        self.arm_close_timer(now);
        self.loss_detection_alarm = None;
        self.ack_alarm = None;
    }

    fn arm_close_timer(&mut self, now: u64) {
        // Retain state long enough for a peer missing our close to give up.
        self.close_alarm = Some(now + 3 * self.rto());
    }

    fn handle_decode(
        &mut self,
        now: u64,
        remote: SocketAddrV6,
        partial_decode: PartialDecode,
        reset_tail: Option<[u8; RESET_TOKEN_SIZE]>,
    ) -> Result<Option<BytesMut>, Error> {
        if !partial_decode.is_protected() {
            let (packet, rest) = partial_decode
                .finish(|_, _| Ok(()))
                .map_err(|_| Error::DiscardPkt)?;
            self.handle_unprotected(now, packet)?;
            return Ok(rest);
        }

        let level = if partial_decode.is_initial() {
            EncryptionLevel::Initial
        } else if partial_decode.is_handshake() {
            EncryptionLevel::Handshake
        } else if partial_decode.is_0rtt() {
            EncryptionLevel::ZeroRtt
        } else {
            EncryptionLevel::OneRtt
        };

        // A server's very first Initial is what Initial keys derive from.
        if self.side == Side::Server
            && level == EncryptionLevel::Initial
            && self.spaces[SpaceId::Initial as usize].keys.is_none()
        {
            let dcid = partial_decode.dst_cid();
            let keys = self.session.recv_client_initial(&dcid)?;
            self.spaces[SpaceId::Initial as usize].keys = Some(keys);
        }

        let is_short = partial_decode.is_short();
        let rx = match self.rx_keys(level) {
            Some(x) => x,
            None => {
                trace!(self.log, "dropping packet with no keys"; "level" => level);
                return Err(Error::DiscardPkt);
            }
        };

        let decode_result = {
            let session = &mut self.session;
            let in_level = level.is_handshake();
            partial_decode.finish(|sample, pn| {
                let r = if in_level {
                    session.in_encrypt_pn(pn, &rx.pn, sample)
                } else {
                    session.encrypt_pn(pn, &rx.pn, sample)
                };
                r.map_err(|_| ())
            })
        };
        let (packet, rest) = match decode_result {
            Ok(x) => x,
            Err(e) => {
                trace!(self.log, "unable to complete packet decoding"; "reason" => %e);
                return self.on_undecryptable(is_short, reset_tail).map(|()| None);
            }
        };

        let space_id = match level {
            EncryptionLevel::Initial => SpaceId::Initial,
            EncryptionLevel::Handshake => SpaceId::Handshake,
            EncryptionLevel::ZeroRtt | EncryptionLevel::OneRtt => SpaceId::Data,
        };
        let number = packet
            .header
            .number()
            .expect("protected packets carry a number")
            .expand(self.spaces[space_id as usize].rx_packet);

        if is_short && packet.header.key_phase() != self.key_phase {
            // Key updates are not negotiated at this draft; a flipped
            // phase is either corruption or a peer we can't follow.
            debug!(self.log, "dropping packet with unexpected key phase");
            return Err(Error::DiscardPkt);
        }

        let plaintext = {
            let nonce = crypto::nonce_for(number, &rx.iv);
            let mut plaintext = Vec::with_capacity(packet.payload.len());
            let r = if level.is_handshake() {
                self.session.in_decrypt(
                    &mut plaintext,
                    &packet.payload,
                    &rx.key,
                    &nonce,
                    &packet.header_data,
                )
            } else {
                self.session.decrypt(
                    &mut plaintext,
                    &packet.payload,
                    &rx.key,
                    &nonce,
                    &packet.header_data,
                )
            };
            match r {
                Ok(()) => plaintext,
                Err(Error::TlsDecrypt) => {
                    debug!(self.log, "failed to authenticate packet"; "pn" => number);
                    return self.on_undecryptable(is_short, reset_tail).map(|()| None);
                }
                Err(e) => return Err(e),
            }
        };

        if !self.spaces[space_id as usize].dedup.insert_one(number) {
            trace!(self.log, "discarding duplicate packet"; "pn" => number);
            // Coalesced packets behind a duplicate are still fresh.
            return Ok(rest);
        }

        self.got_peer_packet = true;
        if self.side == Side::Client && !self.rem_cid_set {
            if let Header::Long { src_cid, .. } = packet.header {
                trace!(self.log, "got remote connection id"; "rem_cid" => %src_cid);
                self.rem_cid = src_cid;
                self.rem_cid_set = true;
            }
        }
        // A handshake-level packet proves the peer got our Initial flight.
        if space_id == SpaceId::Handshake && self.side == Side::Client {
            self.implicitly_ack_space(SpaceId::Initial)?;
        }

        self.on_packet_authenticated(now, space_id, number);
        self.process_payload(now, remote, space_id, level, number, plaintext.into())?;
        self.drive_session()?;
        self.set_loss_detection_alarm();
        Ok(rest)
    }

    /// AEAD failure on an application packet is unremarkable unless the
    /// datagram ends in the peer's stateless reset token.
    fn on_undecryptable(
        &mut self,
        is_short: bool,
        reset_tail: Option<[u8; RESET_TOKEN_SIZE]>,
    ) -> Result<(), Error> {
        if is_short {
            if let Some(tail) = reset_tail {
                if self.is_stateless_reset(&tail) {
                    debug!(self.log, "got stateless reset");
                    self.session.recv_stateless_reset()?;
                    self.state = State::Draining;
                    self.loss_detection_alarm = None;
                    self.ack_alarm = None;
                    self.idle_alarm = None;
                    return Ok(());
                }
            }
        }
        Err(Error::DiscardPkt)
    }

    fn is_stateless_reset(&self, tail: &[u8; RESET_TOKEN_SIZE]) -> bool {
        let mut matched = false;
        if let Some(ref token) = self.params.stateless_reset_token {
            matched |= constant_time_eq(token, tail);
        }
        for &(_, _, ref token) in &self.rem_cids {
            matched |= constant_time_eq(token, tail);
        }
        matched
    }

    fn rx_keys(&self, level: EncryptionLevel) -> Option<Keys> {
        let pair = match level {
            EncryptionLevel::Initial => self.spaces[SpaceId::Initial as usize].keys.as_ref(),
            EncryptionLevel::Handshake => self.spaces[SpaceId::Handshake as usize].keys.as_ref(),
            EncryptionLevel::ZeroRtt => self.zero_rtt_keys.as_ref(),
            EncryptionLevel::OneRtt => self.spaces[SpaceId::Data as usize].keys.as_ref(),
        };
        pair.map(|x| x.rx.clone())
    }

    fn handle_unprotected(&mut self, now: u64, packet: Packet) -> Result<(), Error> {
        match packet.header {
            Header::Retry {
                src_cid,
                orig_dst_cid,
                ref token,
                ..
            } => self.handle_retry(src_cid, orig_dst_cid, token.clone()),
            Header::VersionNegotiate { .. } => {
                self.handle_version_negotiation(now, &packet.payload)
            }
            _ => unreachable!(),
        }
    }

    fn handle_retry(
        &mut self,
        src_cid: ConnectionId,
        orig_dst_cid: ConnectionId,
        token: Bytes,
    ) -> Result<(), Error> {
        if self.side != Side::Client || self.got_peer_packet || token.is_empty() {
            trace!(self.log, "ignoring spurious retry");
            return Err(Error::DiscardPkt);
        }
        if orig_dst_cid != self.init_cid {
            debug!(self.log, "retry does not echo our original dcid");
            return Err(Error::DiscardPkt);
        }
        trace!(self.log, "got retry"; "rem_cid" => %src_cid);
        self.session.recv_retry(&src_cid)?;

        self.rem_cid = src_cid;
        self.retry_token = token;

        // The first flight is void; rewind Initial transmission state while
        // keeping packet numbers monotonic.
        let sent = mem::replace(
            &mut self.spaces[SpaceId::Initial as usize].sent_packets,
            BTreeMap::new(),
        );
        for (_, info) in sent {
            self.bytes_in_flight -= u64::from(info.bytes);
        }
        {
            let space = &mut self.spaces[SpaceId::Initial as usize];
            space.pending_acks = RangeSet::new();
            space.dedup = RangeSet::new();
            space.crypto.rewind();
        }

        // 0-RTT data already sent queues again behind the fresh flight.
        self.requeue_all_in_flight(SpaceId::Data);

        let keys = self.session.client_initial(&self.rem_cid)?;
        self.spaces[SpaceId::Initial as usize].keys = Some(keys);
        self.drive_session()?;
        self.set_loss_detection_alarm();
        Ok(())
    }

    fn handle_version_negotiation(&mut self, now: u64, payload: &[u8]) -> Result<(), Error> {
        if self.side != Side::Client || self.got_peer_packet {
            return Err(Error::DiscardPkt);
        }
        let mut versions = Vec::with_capacity(payload.len() / 4);
        let mut buf = ::std::io::Cursor::new(payload);
        while buf.has_remaining() {
            versions.push(buf.get::<u32>().map_err(|_| Error::DiscardPkt)?);
        }
        if versions.contains(&VERSION) {
            // Our version is supported, so this packet is spurious.
            return Ok(());
        }
        debug!(self.log, "remote doesn't support our version");
        self.session.recv_version_negotiation(&versions)?;
        self.enter_draining(now);
        Err(Error::RecvVersionNegotiation)
    }

    fn on_packet_authenticated(&mut self, now: u64, space_id: SpaceId, number: u64) {
        trace!(self.log, "packet authenticated"; "pn" => number, "space" => ?space_id);
        self.reset_idle_timeout(now);
        let space = &mut self.spaces[space_id as usize];
        space.pending_acks.insert_one(number);
        if space.pending_acks.len() > MAX_ACK_BLOCKS {
            space.pending_acks.pop_min();
        }
        if number >= space.rx_packet {
            space.rx_packet = number;
            space.rx_packet_time = now;
        }
    }

    fn reset_idle_timeout(&mut self, now: u64) {
        let local = self.config.idle_timeout;
        let peer = self.params.idle_timeout;
        let dt = if local == 0 || peer == 0 {
            cmp::max(local, peer)
        } else {
            cmp::min(local, peer)
        };
        if dt != 0 {
            self.idle_alarm = Some(now + u64::from(dt) * SECONDS);
        }
    }

    fn process_payload(
        &mut self,
        now: u64,
        remote: SocketAddrV6,
        space_id: SpaceId,
        level: EncryptionLevel,
        number: u64,
        payload: Bytes,
    ) -> Result<(), Error> {
        let close_recvd = self.is_closing();
        if close_recvd {
            // Remind a peer that missed our close frame.
            self.close_pending = true;
        }
        let mut ack_eliciting = false;
        for quic_frame in frame::Iter::new(payload) {
            match quic_frame {
                Frame::Padding => {}
                _ => {
                    trace!(self.log, "got frame"; "type" => quic_frame.ty());
                }
            }
            if quic_frame.is_ack_eliciting() {
                ack_eliciting = true;
            }
            if close_recvd {
                // While closing we only care whether the peer has started
                // draining too.
                match quic_frame {
                    Frame::ConnectionClose(_) | Frame::ApplicationClose(_) => {
                        trace!(self.log, "draining");
                        self.enter_draining(now);
                        return Ok(());
                    }
                    _ => continue,
                }
            }
            if space_id != SpaceId::Data || level == EncryptionLevel::ZeroRtt {
                self.check_frame_permitted(level, &quic_frame)?;
            }
            match quic_frame {
                Frame::Padding | Frame::Ping => {}
                Frame::Ack(ack) => {
                    self.on_ack_received(now, space_id, ack)?;
                }
                Frame::Crypto(f) => {
                    self.process_crypto_frame(space_id, level, f)?;
                }
                Frame::Stream(f) => {
                    self.process_stream_frame(f)?;
                }
                Frame::ConnectionClose(reason) => {
                    debug!(self.log, "connection closed by peer"; "reason" => %reason);
                    self.enter_draining(now);
                    return Ok(());
                }
                Frame::ApplicationClose(reason) => {
                    debug!(self.log, "connection closed by peer application"; "reason" => %reason);
                    self.enter_draining(now);
                    return Ok(());
                }
                Frame::Invalid(ty) => {
                    debug!(self.log, "received malformed frame"; "type" => ty);
                    return Err(if ty == frame::Type::ACK.into() {
                        Error::AckFrame
                    } else {
                        Error::FrameEncoding
                    });
                }
                Frame::PathChallenge(token) => {
                    self.spaces[space_id as usize]
                        .pending
                        .path_challenged(number, token);
                }
                Frame::PathResponse(token) => {
                    self.process_path_response(now, remote, token)?;
                }
                Frame::MaxData(bytes) => {
                    if bytes > self.max_data {
                        trace!(self.log, "connection limit increased"; "max_data" => bytes);
                        self.max_data = bytes;
                        self.blocked_at = None;
                    }
                }
                Frame::MaxStreamData { id, offset } => {
                    self.process_max_stream_data(id, offset)?;
                }
                Frame::MaxStreamId(id) => {
                    let limit = match id.directionality() {
                        Directionality::Uni => &mut self.streams.max_uni,
                        Directionality::Bi => &mut self.streams.max_bi,
                    };
                    let update = id.index() + 1;
                    if update > *limit {
                        *limit = update;
                        self.session.extend_max_stream_id(id)?;
                    }
                }
                Frame::RstStream(f) => {
                    self.process_rst_stream(f)?;
                }
                Frame::StopSending { id, error_code } => {
                    self.process_stop_sending(id, error_code)?;
                }
                Frame::Blocked { offset } => {
                    debug!(self.log, "peer claims to be blocked at connection level"; "offset" => offset);
                }
                Frame::StreamBlocked { id, offset } => {
                    debug!(self.log, "peer claims to be blocked at stream level";
                           "stream" => id, "offset" => offset);
                }
                Frame::StreamIdBlocked { id } => {
                    debug!(self.log, "peer claims to be blocked at stream id level"; "stream" => id);
                }
                Frame::NewConnectionId(f) => {
                    self.process_new_connection_id(f)?;
                }
                Frame::RetireConnectionId { sequence } => {
                    // We never rotate the CID we issued during the
                    // handshake, so there is nothing to retire yet.
                    debug!(self.log, "peer retired unissued CID"; "sequence" => sequence);
                }
                Frame::NewToken { token } => {
                    if self.side != Side::Client {
                        debug!(self.log, "got NEW_TOKEN as server");
                        return Err(Error::Proto);
                    }
                    trace!(self.log, "got address validation token");
                    self.new_token = Some(token);
                }
            }
        }
        if ack_eliciting {
            self.spaces[space_id as usize].permit_ack_only = true;
            if space_id == SpaceId::Data && self.ack_alarm.is_none() {
                self.ack_alarm = Some(now + self.config.delayed_ack_timeout);
            }
        }
        Ok(())
    }

    /// Frames legal outside 1-RTT packets are a small subset.
    fn check_frame_permitted(
        &self,
        level: EncryptionLevel,
        quic_frame: &Frame,
    ) -> Result<(), Error> {
        let ok = match *quic_frame {
            Frame::Padding
            | Frame::Ping
            | Frame::ConnectionClose(_)
            | Frame::ApplicationClose(_)
            | Frame::Invalid(_) => true,
            // 0-RTT packets carry application data, not handshake plumbing;
            // acks for them arrive under 1-RTT keys.
            Frame::Ack(_) | Frame::Crypto(_) => level != EncryptionLevel::ZeroRtt,
            Frame::Stream(_)
            | Frame::RstStream(_)
            | Frame::StopSending { .. }
            | Frame::MaxData(_)
            | Frame::MaxStreamData { .. }
            | Frame::MaxStreamId(_)
            | Frame::Blocked { .. }
            | Frame::StreamBlocked { .. }
            | Frame::StreamIdBlocked { .. }
            | Frame::PathChallenge(_)
            | Frame::PathResponse(_) => level == EncryptionLevel::ZeroRtt,
            Frame::NewConnectionId(_)
            | Frame::RetireConnectionId { .. }
            | Frame::NewToken { .. } => false,
        };
        if ok {
            Ok(())
        } else {
            debug!(self.log, "frame type not permitted at encryption level";
                   "type" => quic_frame.ty(), "level" => level);
            Err(Error::Proto)
        }
    }

    fn process_crypto_frame(
        &mut self,
        space_id: SpaceId,
        level: EncryptionLevel,
        quic_frame: frame::Crypto,
    ) -> Result<(), Error> {
        {
            let space = &mut self.spaces[space_id as usize];
            space.crypto.rx.insert(quic_frame.offset, quic_frame.data);
        }
        loop {
            let chunk = match self.spaces[space_id as usize].crypto.rx.pop() {
                Some((_, chunk)) => chunk,
                None => break,
            };
            self.session.recv_crypto_data(level, &chunk)?;
        }
        Ok(())
    }

    fn process_stream_frame(&mut self, quic_frame: frame::Stream) -> Result<(), Error> {
        trace!(self.log, "got stream"; "id" => quic_frame.id.0, "offset" => quic_frame.offset,
               "len" => quic_frame.data.len(), "fin" => quic_frame.fin);
        let id = quic_frame.id;
        self.ensure_remote_stream(id)?;
        let new_bytes = {
            let rs = match self.streams.get_recv_mut(&id) {
                Some(x) => x,
                None => {
                    trace!(self.log, "dropping frame for closed stream");
                    return Ok(());
                }
            };
            let end = quic_frame.offset + quic_frame.data.len() as u64;
            if let Some(final_offset) = rs.final_offset() {
                if end > final_offset || (quic_frame.fin && end != final_offset) {
                    debug!(self.log, "final offset error";
                           "frame end" => end, "final offset" => final_offset);
                    return Err(Error::FinalOffset);
                }
            }
            let prev_end = rs.last_rx_offset;
            let new_bytes = end.saturating_sub(prev_end);
            if end > rs.max_data || self.data_recvd + new_bytes > self.local_max_data {
                debug!(self.log, "flow control error";
                       "stream" => id.0, "recvd" => self.data_recvd, "new bytes" => new_bytes,
                       "max data" => self.local_max_data, "end" => end,
                       "stream max data" => rs.max_data);
                return Err(Error::FlowControl);
            }
            if quic_frame.fin {
                if let RecvState::Recv = rs.state {
                    rs.state = RecvState::SizeKnown { size: end };
                }
            }
            rs.recvd.insert(quic_frame.offset..end);
            rs.last_rx_offset = cmp::max(rs.last_rx_offset, end);
            if !rs.stopped {
                rs.assembler.insert(quic_frame.offset, quic_frame.data);
            }
            if let RecvState::SizeKnown { size } = rs.state {
                if rs.recvd.prefix_end(0) == size {
                    rs.state = RecvState::DataRecvd { size };
                }
            }
            new_bytes
        };
        self.data_recvd += new_bytes;
        self.deliver_stream_data(id)?;
        Ok(())
    }

    /// Push freshly contiguous data up to the application, in order, with
    /// fin riding on the final bytes.
    fn deliver_stream_data(&mut self, id: StreamId) -> Result<(), Error> {
        let mut delivered = 0u64;
        let mut readvertise_stream = false;
        let mut done = false;
        loop {
            let (offset, chunk, fin) = {
                let rs = match self.streams.get_recv_mut(&id) {
                    Some(x) => x,
                    None => return Ok(()),
                };
                if rs.stopped || rs.is_closed() {
                    break;
                }
                let size = rs.final_offset();
                match rs.assembler.pop() {
                    Some((offset, chunk)) => {
                        let fin = size == Some(offset + chunk.len() as u64);
                        (offset, chunk, fin)
                    }
                    None => {
                        // A zero-length fin still has to be reported.
                        if let RecvState::DataRecvd { size } = rs.state {
                            if size == rs.assembler.offset() {
                                (size, Bytes::new(), true)
                            } else {
                                break;
                            }
                        } else {
                            break;
                        }
                    }
                }
            };
            self.session.recv_stream_data(id, offset, fin, &chunk)?;
            delivered += chunk.len() as u64;
            {
                let rs = self.streams.get_recv_mut(&id).unwrap();
                if rs.consumed(chunk.len() as u64) {
                    readvertise_stream = true;
                }
                if fin {
                    if let RecvState::DataRecvd { .. } = rs.state {
                        rs.state = RecvState::DataRead;
                    }
                    done = true;
                }
            }
            if fin {
                break;
            }
        }
        if delivered > 0 {
            self.unsent_max_data += delivered;
            if self.unsent_max_data - self.local_max_data
                >= u64::from(self.config.receive_window) / 2
            {
                self.spaces[SpaceId::Data as usize].pending.max_data = true;
            }
        }
        if readvertise_stream {
            self.spaces[SpaceId::Data as usize]
                .pending
                .max_stream_data
                .insert(id);
        }
        if done {
            self.maybe_cleanup(id, 0)?;
        }
        Ok(())
    }

    fn ensure_remote_stream(&mut self, id: StreamId) -> Result<(), Error> {
        let send_credit = self.peer_initial_stream_credit(id);
        let newly = self.streams.ensure_remote(
            self.side,
            id,
            send_credit,
            u64::from(self.config.stream_receive_window),
        )?;
        for index in newly {
            let opened = StreamId::new(!self.side, id.directionality(), index);
            trace!(self.log, "stream opened by peer"; "stream" => opened);
            self.session.stream_open(opened)?;
        }
        Ok(())
    }

    /// Flow credit the peer has granted for our sending on `id`.
    fn peer_initial_stream_credit(&self, id: StreamId) -> u64 {
        u64::from(match (id.initiator() == self.side, id.directionality()) {
            (_, Directionality::Uni) => self.params.initial_max_stream_data_uni,
            (true, Directionality::Bi) => self.params.initial_max_stream_data_bidi_remote,
            (false, Directionality::Bi) => self.params.initial_max_stream_data_bidi_local,
        })
    }

    fn process_max_stream_data(&mut self, id: StreamId, offset: u64) -> Result<(), Error> {
        if id.initiator() != self.side {
            if id.directionality() == Directionality::Uni {
                debug!(self.log, "got MAX_STREAM_DATA on recv-only stream");
                return Err(Error::Proto);
            }
            self.ensure_remote_stream(id)?;
        }
        match self.streams.get_send_mut(&id) {
            Some(ss) => {
                if offset > ss.max_data {
                    trace!(self.log, "stream limit increased"; "stream" => id.0,
                           "old" => ss.max_data, "new" => offset, "current offset" => ss.offset);
                    ss.max_data = offset;
                    ss.blocked_at = None;
                }
            }
            None => {
                trace!(self.log, "got MAX_STREAM_DATA on closed stream");
            }
        }
        Ok(())
    }

    fn process_rst_stream(&mut self, quic_frame: frame::RstStream) -> Result<(), Error> {
        let id = quic_frame.id;
        if id.initiator() == self.side && id.directionality() == Directionality::Uni {
            debug!(self.log, "got RST_STREAM on send-only stream");
            return Err(Error::Proto);
        }
        self.ensure_remote_stream(id)?;
        let (new_bytes, error_code) = {
            let rs = match self.streams.get_recv_mut(&id) {
                Some(x) => x,
                None => {
                    trace!(self.log, "got RST_STREAM on closed stream");
                    return Ok(());
                }
            };
            if let Some(offset) = rs.final_offset() {
                if offset != quic_frame.final_offset {
                    return Err(Error::FinalOffset);
                }
            }
            if quic_frame.final_offset < rs.last_rx_offset {
                return Err(Error::FinalOffset);
            }
            let new_bytes = quic_frame.final_offset.saturating_sub(rs.last_rx_offset);
            if self.data_recvd + new_bytes > self.local_max_data {
                return Err(Error::FlowControl);
            }
            rs.assembler.clear();
            rs.last_rx_offset = quic_frame.final_offset;
            rs.state = RecvState::ResetRecvd {
                size: quic_frame.final_offset,
                error_code: quic_frame.error_code,
            };
            (new_bytes, quic_frame.error_code)
        };
        self.data_recvd += new_bytes;
        // Surfacing the reset through stream_close counts as reading it.
        if let Some(rs) = self.streams.get_recv_mut(&id) {
            rs.state = RecvState::ResetRead;
        }
        self.maybe_cleanup(id, error_code)?;
        Ok(())
    }

    fn process_stop_sending(&mut self, id: StreamId, error_code: u16) -> Result<(), Error> {
        if id.initiator() != self.side {
            if id.directionality() == Directionality::Uni {
                debug!(self.log, "got STOP_SENDING on recv-only stream");
                return Err(Error::Proto);
            }
            self.ensure_remote_stream(id)?;
        }
        let stopped = {
            let ss = match self.streams.get_send_mut(&id) {
                Some(x) => x,
                None => {
                    trace!(self.log, "got STOP_SENDING on closed stream");
                    return Ok(());
                }
            };
            if ss.state.was_reset() {
                false
            } else {
                ss.reset(Some(error_code));
                true
            }
        };
        if stopped {
            // Answer with a reset carrying the reserved STOPPING code.
            self.spaces[SpaceId::Data as usize]
                .pending
                .rst_stream
                .push((id, STOPPING));
        }
        Ok(())
    }

    fn process_new_connection_id(
        &mut self,
        quic_frame: frame::NewConnectionId,
    ) -> Result<(), Error> {
        if self.rem_cid.is_empty() {
            debug!(self.log, "got NEW_CONNECTION_ID from peer using the empty CID");
            return Err(Error::Proto);
        }
        for &(seq, cid, _) in &self.rem_cids {
            if seq == quic_frame.sequence {
                if cid != quic_frame.cid {
                    return Err(Error::Proto);
                }
                return Ok(());
            }
        }
        trace!(self.log, "peer issued new CID";
               "sequence" => quic_frame.sequence, "cid" => %quic_frame.cid);
        self.rem_cids
            .push((quic_frame.sequence, quic_frame.cid, quic_frame.reset_token));
        Ok(())
    }

    fn process_path_response(
        &mut self,
        now: u64,
        _remote: SocketAddrV6,
        token: u64,
    ) -> Result<(), Error> {
        let (ok, retire) = match self.path_validator {
            Some(ref mut pv) => {
                if pv.verify(token, now) {
                    (true, pv.retire_dcid_on_finish)
                } else if pv.dont_care {
                    (false, false)
                } else {
                    debug!(self.log, "unsolicited PATH_RESPONSE");
                    return Err(Error::Proto);
                }
            }
            None => {
                debug!(self.log, "unsolicited PATH_RESPONSE");
                return Err(Error::Proto);
            }
        };
        if ok {
            trace!(self.log, "path validated");
            self.path_validated = true;
            self.path_validator = None;
            if retire {
                self.retire_rem_cid();
            }
        }
        Ok(())
    }

    /// Rotate to the next peer-issued CID, retiring the one in use.
    fn retire_rem_cid(&mut self) {
        let replacement = self
            .rem_cids
            .iter()
            .find(|&&(_, cid, _)| cid != self.rem_cid)
            .map(|&(_, cid, _)| cid);
        if let Some(cid) = replacement {
            let old_seq = self
                .rem_cids
                .iter()
                .find(|&&(_, c, _)| c == self.rem_cid)
                .map(|&(s, _, _)| s)
                .unwrap_or(0);
            trace!(self.log, "rotating remote CID"; "new" => %cid);
            self.rem_cid = cid;
            self.spaces[SpaceId::Data as usize]
                .pending
                .retire_connection_id
                .push(old_seq);
        }
    }

    // ---------------------------------------------------------------------
    // Acknowledgement processing, loss detection, congestion
    // ---------------------------------------------------------------------

    fn on_ack_received(
        &mut self,
        now: u64,
        space_id: SpaceId,
        ack: frame::Ack,
    ) -> Result<(), Error> {
        trace!(self.log, "got ack"; "ranges" => ?ack.iter().collect::<Vec<_>>());
        if ack.largest >= self.spaces[space_id as usize].next_packet_number {
            debug!(self.log, "peer acknowledged unsent packet");
            return Err(Error::Proto);
        }
        let newly_largest = ack.largest > self.spaces[space_id as usize].largest_acked_packet
            || self.spaces[space_id as usize].largest_acked_packet == 0;
        self.spaces[space_id as usize].largest_acked_packet = cmp::max(
            self.spaces[space_id as usize].largest_acked_packet,
            ack.largest,
        );

        if newly_largest {
            if let Some(info) = self.spaces[space_id as usize]
                .sent_packets
                .get(&ack.largest)
                .cloned()
            {
                if info.ack_eliciting {
                    self.latest_rtt = now.saturating_sub(info.time);
                    let delay = self.peer_ack_delay(ack.delay);
                    self.update_rtt(delay);
                }
            }
        }

        let mut rto_verified = false;
        for range in &ack {
            let packets = self.spaces[space_id as usize]
                .sent_packets
                .range(range)
                .map(|(&n, _)| n)
                .collect::<Vec<_>>();
            for packet in packets {
                if space_id == SpaceId::Data
                    && self.rto_count > 0
                    && packet > self.largest_sent_before_rto
                {
                    rto_verified = true;
                }
                self.on_packet_acked(space_id, packet)?;
            }
        }
        if rto_verified {
            // An RTO probe got through; everything older is gone for good.
            let threshold = self.largest_sent_before_rto;
            self.collapse_below(SpaceId::Data, threshold);
            self.congestion_window = self.config.minimum_window;
        }
        self.detect_lost_packets(now, space_id);
        self.set_loss_detection_alarm();
        Ok(())
    }

    /// Scale a wire ACK delay to ticks using the peer's exponent, clamped
    /// by its advertised maximum.
    fn peer_ack_delay(&self, delay: u64) -> u64 {
        let scaled = (delay << self.params.ack_delay_exponent) * MICROSECONDS;
        cmp::min(scaled, self.max_ack_delay())
    }

    fn update_rtt(&mut self, ack_delay: u64) {
        self.latest_rtt = self.latest_rtt.saturating_sub(ack_delay);
        self.min_rtt = cmp::min(self.min_rtt, self.latest_rtt);
        if self.smoothed_rtt == 0 {
            self.smoothed_rtt = self.latest_rtt;
            self.rttvar = self.latest_rtt / 2;
        } else {
            let rttvar_sample = (self.smoothed_rtt as i64 - self.latest_rtt as i64).abs() as u64;
            self.rttvar = (3 * self.rttvar + rttvar_sample) / 4;
            self.smoothed_rtt = (7 * self.smoothed_rtt + self.latest_rtt) / 8;
        }
    }

    // Not timing-aware, so it's safe to call this for inferred acks, such
    // as arise from handshake completion.
    fn on_packet_acked(&mut self, space_id: SpaceId, packet: u64) -> Result<(), Error> {
        let info = match self.spaces[space_id as usize].sent_packets.remove(&packet) {
            Some(x) => x,
            None => return Ok(()),
        };
        if info.bytes != 0 {
            self.bytes_in_flight -= u64::from(info.bytes);
            // Do not increase congestion window in recovery period.
            if !self.in_recovery(info.time) {
                if self.congestion_window < self.ssthresh {
                    // Slow start.
                    self.congestion_window += u64::from(info.bytes);
                } else {
                    // Congestion avoidance.
                    self.congestion_window +=
                        self.config.default_mss * u64::from(info.bytes) / self.congestion_window;
                }
            }
        }

        self.handshake_count = 0;
        self.tlp_count = 0;
        self.rto_count = 0;

        // Update state for confirmed delivery of frames
        for (id, _) in info.retransmits.rst_stream {
            let code = {
                let ss = match self.streams.get_send_mut(&id) {
                    Some(x) => x,
                    None => continue,
                };
                if let SendState::ResetSent { stop_reason } = ss.state {
                    ss.state = SendState::ResetRecvd { stop_reason };
                    Some(stop_reason.unwrap_or(0))
                } else {
                    None
                }
            };
            if let Some(code) = code {
                self.maybe_cleanup(id, code)?;
            }
        }
        for quic_frame in info.stream_frames {
            let (released, finished) = {
                let ss = match self.streams.get_send_mut(&quic_frame.id) {
                    Some(x) => x,
                    None => continue,
                };
                ss.bytes_in_flight -= quic_frame.data.len() as u64;
                let released = ss.ack_frame(
                    quic_frame.offset,
                    quic_frame.data.len() as u64,
                    quic_frame.fin,
                );
                (released, ss.is_closed())
            };
            if let Some(range) = released {
                self.session.acked_stream_data_offset(
                    quic_frame.id,
                    range.start,
                    range.end - range.start,
                )?;
            }
            if finished {
                self.maybe_cleanup(quic_frame.id, 0)?;
            }
        }
        for quic_frame in info.crypto_frames {
            let released = self.spaces[space_id as usize]
                .crypto
                .ack(quic_frame.offset, quic_frame.data.len() as u64);
            if let Some(range) = released {
                self.session.acked_crypto_offset(
                    space_level(space_id),
                    range.start,
                    range.end - range.start,
                )?;
            }
        }
        self.spaces[space_id as usize]
            .pending_acks
            .subtract(&info.acks);
        Ok(())
    }

    /// Consider every transmitted packet of `space_id` delivered. Called
    /// when receipt of a higher-level packet proves them moot.
    fn implicitly_ack_space(&mut self, space_id: SpaceId) -> Result<(), Error> {
        let packets = self.spaces[space_id as usize]
            .sent_packets
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        for packet in packets {
            self.on_packet_acked(space_id, packet)?;
        }
        Ok(())
    }

    fn detect_lost_packets(&mut self, now: u64, space_id: SpaceId) {
        self.loss_time = 0;
        self.loss_space = space_id;
        let largest_acked = self.spaces[space_id as usize].largest_acked_packet;
        let rtt = cmp::max(self.latest_rtt, self.smoothed_rtt);
        let delay_until_lost = rtt + rtt / 8;

        let mut lost_packets = Vec::<u64>::new();
        let mut largest_lost_time = 0;
        for (&packet, info) in self.spaces[space_id as usize]
            .sent_packets
            .range(0..largest_acked)
        {
            let time_since_sent = now.saturating_sub(info.time);
            let delta = largest_acked - packet;
            // Use of >= for time comparison here is critical so that we
            // successfully detect lost packets in testing when rtt = 0
            if time_since_sent >= delay_until_lost
                || delta >= u64::from(self.reordering_threshold)
            {
                lost_packets.push(packet);
                largest_lost_time = info.time;
            } else if self.loss_time == 0 {
                self.loss_time = info.time + delay_until_lost;
            }
        }

        if !lost_packets.is_empty() {
            let old_bytes_in_flight = self.bytes_in_flight;
            for packet in lost_packets {
                debug!(self.log, "packet lost"; "pn" => packet, "space" => ?space_id);
                self.on_packet_lost(space_id, packet);
            }
            // Don't apply a congestion penalty for lost ack-only packets
            let lost_nonack = old_bytes_in_flight != self.bytes_in_flight;
            // Start a new recovery epoch if the lost packet is more recent
            // than the start of the previous one.
            if lost_nonack && !self.in_recovery(largest_lost_time) {
                self.recovery_start_time = now;
                self.congestion_window =
                    (self.congestion_window * u64::from(self.config.loss_reduction_factor)) >> 16;
                self.congestion_window =
                    cmp::max(self.congestion_window, self.config.minimum_window);
                self.ssthresh = self.congestion_window;
            }
        }
    }

    fn on_packet_lost(&mut self, space_id: SpaceId, packet: u64) {
        let info = match self.spaces[space_id as usize].sent_packets.remove(&packet) {
            Some(x) => x,
            None => return,
        };
        self.bytes_in_flight -= u64::from(info.bytes);
        self.requeue_sent_packet(space_id, info);
    }

    /// Return a lost or voided packet's frames to the send queues.
    fn requeue_sent_packet(&mut self, space_id: SpaceId, info: SentPacket) {
        {
            let space = &mut self.spaces[space_id as usize];
            for quic_frame in info.crypto_frames {
                space.crypto.requeue(quic_frame.offset, quic_frame.data);
            }
            space.pending += info.retransmits;
        }
        for quic_frame in info.stream_frames {
            let requeued = {
                let ss = match self.streams.get_send_mut(&quic_frame.id) {
                    Some(x) => x,
                    None => continue,
                };
                ss.bytes_in_flight -= quic_frame.data.len() as u64;
                if ss.state.was_reset() {
                    false
                } else {
                    ss.requeue(quic_frame.offset, quic_frame.data);
                    if quic_frame.fin {
                        ss.requeue_fin();
                    }
                    true
                }
            };
            if requeued && !self.pending_streams.contains(&quic_frame.id) {
                self.pending_streams.push_back(quic_frame.id);
            }
        }
    }

    fn collapse_below(&mut self, space_id: SpaceId, threshold: u64) {
        let packets = self.spaces[space_id as usize]
            .sent_packets
            .range(0..threshold + 1)
            .map(|(&n, _)| n)
            .collect::<Vec<_>>();
        for packet in packets {
            self.on_packet_lost(space_id, packet);
        }
    }

    fn requeue_all_in_flight(&mut self, space_id: SpaceId) {
        let packets = mem::replace(
            &mut self.spaces[space_id as usize].sent_packets,
            BTreeMap::new(),
        );
        for (_, info) in packets {
            self.bytes_in_flight -= u64::from(info.bytes);
            self.requeue_sent_packet(space_id, info);
        }
    }

    fn in_recovery(&self, sent_time: u64) -> bool {
        sent_time <= self.recovery_start_time
    }

    fn handshake_in_flight(&self) -> bool {
        self.spaces[SpaceId::Initial as usize].retransmittable_in_flight()
            || self.spaces[SpaceId::Handshake as usize].retransmittable_in_flight()
    }

    fn set_loss_detection_alarm(&mut self) {
        if self.bytes_in_flight == 0 || self.is_closing() || self.is_draining() {
            self.loss_detection_alarm = None;
            return;
        }

        if self.handshake_in_flight() {
            // Handshake retransmission alarm.
            let mut alarm_duration = if self.smoothed_rtt == 0 {
                2 * self.config.default_initial_rtt
            } else {
                2 * self.smoothed_rtt
            };
            alarm_duration = cmp::max(alarm_duration, self.config.min_tlp_timeout);
            alarm_duration *= 2u64.pow(self.handshake_count);
            self.loss_detection_alarm =
                Some(self.time_of_last_sent_handshake_packet + alarm_duration);
            return;
        }

        let alarm = if self.loss_time != 0 {
            // Early retransmit timer or time loss detection.
            self.loss_time
        } else if self.tlp_count < self.config.max_tlps {
            // Tail loss probe.
            let duration = cmp::max(
                (3 * self.smoothed_rtt) / 2 + self.max_ack_delay(),
                self.config.min_tlp_timeout,
            );
            self.time_of_last_sent_ack_eliciting_packet + duration
        } else {
            self.time_of_last_sent_ack_eliciting_packet + self.rto()
        };
        self.loss_detection_alarm = Some(alarm);
    }

    /// Retransmission timeout.
    fn rto(&self) -> u64 {
        let computed = self.smoothed_rtt + 4 * self.rttvar + self.max_ack_delay();
        cmp::max(computed, self.config.min_rto_timeout) * 2u64.pow(self.rto_count)
    }

    fn max_ack_delay(&self) -> u64 {
        u64::from(self.params.max_ack_delay) * MILLISECONDS
    }

    fn on_loss_detection_timeout(&mut self, now: u64) {
        if self.handshake_in_flight() {
            trace!(self.log, "retransmitting handshake packets");
            for &space_id in &[SpaceId::Initial, SpaceId::Handshake] {
                self.requeue_all_in_flight(space_id);
            }
            self.handshake_count += 1;
        } else if self.loss_time != 0 {
            // Early retransmit or time loss detection.
            let space_id = self.loss_space;
            self.detect_lost_packets(now, space_id);
        } else if self.tlp_count < self.config.max_tlps {
            trace!(self.log, "sending TLP"; "number" => self.tlp_count,
                   "in flight" => self.bytes_in_flight);
            // Tail loss probe.
            self.probe_pkt_left = 1;
            self.spaces[SpaceId::Data as usize].pending.ping = true;
            self.tlp_count += 1;
        } else {
            trace!(self.log, "RTO fired"; "in flight" => self.bytes_in_flight);
            if self.rto_count == 0 {
                self.largest_sent_before_rto = self.spaces[SpaceId::Data as usize]
                    .next_packet_number
                    .saturating_sub(1);
            }
            self.probe_pkt_left = 2;
            self.spaces[SpaceId::Data as usize].pending.ping = true;
            self.rto_count += 1;
        }
        self.set_loss_detection_alarm();
    }

    // ---------------------------------------------------------------------
    // Handshake driving
    // ---------------------------------------------------------------------

    /// Pump the TLS collaborator: install fresh keys, queue produced
    /// handshake bytes, absorb transport parameters, and notice completion.
    fn drive_session(&mut self) -> Result<(), Error> {
        while let Some((level, keys)) = self.session.take_keys() {
            self.install_keys(level, keys)?;
        }
        for &(space_id, level) in &[
            (SpaceId::Initial, EncryptionLevel::Initial),
            (SpaceId::Handshake, EncryptionLevel::Handshake),
            (SpaceId::Data, EncryptionLevel::OneRtt),
        ] {
            let mut buf = Vec::new();
            self.session.write_crypto_data(level, &mut buf)?;
            if !buf.is_empty() {
                self.spaces[space_id as usize].crypto.submit(buf.into());
            }
        }
        if !self.params_set {
            if let Some(params) = self.session.transport_parameters()? {
                self.set_params(params)?;
            }
        }
        if !self.handshake_completed && !self.session.is_handshaking() {
            if !self.params_set {
                debug!(self.log, "peer didn't send transport parameters");
                return Err(Error::RequiredTransportParam);
            }
            trace!(self.log, "handshake complete");
            self.handshake_completed = true;
            if let State::Handshake = self.state {
                self.state = State::Established;
            }
            self.session.handshake_completed()?;
        }
        Ok(())
    }

    fn install_keys(&mut self, level: EncryptionLevel, keys: KeyPair) -> Result<(), Error> {
        trace!(self.log, "installing keys"; "level" => level);
        match level {
            // Initial keys may be replaced after a Retry.
            EncryptionLevel::Initial => {
                self.spaces[SpaceId::Initial as usize].keys = Some(keys);
            }
            EncryptionLevel::Handshake => {
                let slot = &mut self.spaces[SpaceId::Handshake as usize].keys;
                if slot.is_some() {
                    return Err(Error::InvalidState);
                }
                *slot = Some(keys);
            }
            EncryptionLevel::ZeroRtt => {
                if self.zero_rtt_keys.is_some() {
                    return Err(Error::InvalidState);
                }
                self.zero_rtt_keys = Some(keys);
            }
            EncryptionLevel::OneRtt => {
                let slot = &mut self.spaces[SpaceId::Data as usize].keys;
                if slot.is_some() {
                    return Err(Error::InvalidState);
                }
                *slot = Some(keys);
            }
        }
        Ok(())
    }

    /// Arm 0-RTT protection in both directions before the handshake
    /// finishes.
    pub fn install_early_keys(&mut self, keys: KeyPair) -> Result<(), Error> {
        self.install_keys(EncryptionLevel::ZeroRtt, keys)
    }

    /// Seed limits from transport parameters remembered out of a prior
    /// session, so 0-RTT data can flow before the peer's fresh parameters
    /// arrive. Client only. The fresh parameters replace these on arrival.
    pub fn set_early_transport_params(
        &mut self,
        params: TransportParameters,
    ) -> Result<(), Error> {
        if self.side != Side::Client || self.params_set {
            return Err(Error::InvalidState);
        }
        self.set_params(params)?;
        self.params_set = false;
        Ok(())
    }

    fn set_params(&mut self, params: TransportParameters) -> Result<(), Error> {
        if self.side == Side::Client && !self.retry_token.is_empty() {
            // A server that sent Retry must prove it by echoing our very
            // first DCID.
            match params.original_connection_id {
                Some(cid) if cid == self.init_cid => {}
                Some(_) => return Err(Error::TransportParam),
                None => return Err(Error::RequiredTransportParam),
            }
        }
        self.streams.max_bi = u64::from(params.initial_max_bidi_streams);
        self.streams.max_uni = u64::from(params.initial_max_uni_streams);
        self.max_data = u64::from(params.initial_max_data);
        if params.max_packet_size < self.mtu {
            self.mtu = cmp::max(1200, params.max_packet_size);
        }
        self.params = params;
        self.params_set = true;
        // Streams the peer touched before its parameters arrived now get
        // their true send credit.
        let ids = self.streams.streams.keys().cloned().collect::<Vec<_>>();
        for id in ids {
            let credit = self.peer_initial_stream_credit(id);
            if let Some(ss) = self.streams.get_send_mut(&id) {
                if ss.max_data == 0 {
                    ss.max_data = credit;
                }
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Application operations
    // ---------------------------------------------------------------------

    /// Create a new stream toward the peer.
    ///
    /// Fails with `Error::StreamIdBlocked` when the peer's stream budget is
    /// exhausted, additionally advising the peer of the stall.
    pub fn open(&mut self, direction: Directionality) -> Result<StreamId, Error> {
        let send_credit = u64::from(match direction {
            Directionality::Uni => self.params.initial_max_stream_data_uni,
            Directionality::Bi => self.params.initial_max_stream_data_bidi_remote,
        });
        match self.streams.open(
            self.side,
            direction,
            send_credit,
            u64::from(self.config.stream_receive_window),
        ) {
            Ok(id) => Ok(id),
            Err(e) => {
                if let Error::StreamIdBlocked = e {
                    let pending = &mut self.spaces[SpaceId::Data as usize].pending;
                    match direction {
                        Directionality::Uni => pending.uni_stream_id_blocked = true,
                        Directionality::Bi => pending.bi_stream_id_blocked = true,
                    }
                }
                Err(e)
            }
        }
    }

    /// Queue stream data for transmission.
    ///
    /// Returns the number of bytes accepted, bounded by stream- and
    /// connection-level flow control. Submitted buffers are released by the
    /// matching `acked_stream_data_offset` callbacks.
    pub fn write(&mut self, id: StreamId, data: &[u8]) -> Result<usize, WriteError> {
        assert!(id.directionality() == Directionality::Bi || id.initiator() == self.side);
        match self.state {
            State::Handshake | State::Established => {}
            _ => return Err(WriteError::Blocked),
        }

        if self.data_sent >= self.max_data {
            trace!(self.log, "write blocked by connection-level flow control"; "stream" => id.0);
            if self.blocked_at != Some(self.max_data) {
                self.blocked_at = Some(self.max_data);
                self.spaces[SpaceId::Data as usize].pending.blocked = Some(self.max_data);
            }
            return Err(WriteError::Blocked);
        }
        let conn_budget = self.max_data - self.data_sent;

        let stream_budget = {
            let mut blocked_signal = None;
            let ss = self
                .streams
                .get_send_mut(&id)
                .expect("unknown or recv-only stream");
            let budget = match ss.write_budget() {
                Ok(x) => Some(x),
                Err(e) => {
                    if let WriteError::Blocked = e {
                        if ss.blocked_at != Some(ss.max_data) {
                            ss.blocked_at = Some(ss.max_data);
                            blocked_signal = Some((id, ss.max_data));
                        }
                    }
                    if blocked_signal.is_none() {
                        return Err(e);
                    }
                    None
                }
            };
            match budget {
                Some(x) => x,
                None => {
                    let (id, offset) = blocked_signal.unwrap();
                    trace!(self.log, "write blocked by stream flow control"; "stream" => id.0);
                    self.spaces[SpaceId::Data as usize]
                        .pending
                        .stream_blocked
                        .push_back((id, offset));
                    return Err(WriteError::Blocked);
                }
            }
        };

        let n = cmp::min(conn_budget.min(stream_budget), data.len() as u64) as usize;
        {
            let ss = self.streams.get_send_mut(&id).unwrap();
            ss.queue(Bytes::from(&data[..n]));
        }
        self.data_sent += n as u64;
        if !self.pending_streams.contains(&id) {
            self.pending_streams.push_back(id);
        }
        trace!(self.log, "write"; "stream" => id.0, "len" => n);
        Ok(n)
    }

    /// Indicate that no more data will be sent on a stream.
    ///
    /// All previously transmitted data will still be delivered. Incoming
    /// data on bidirectional streams is unaffected.
    pub fn finish(&mut self, id: StreamId) -> Result<(), Error> {
        {
            let ss = match self.streams.get_send_mut(&id) {
                Some(x) => x,
                None => return Err(Error::StreamNotFound),
            };
            if ss.state.was_reset() || ss.fin_offset.is_some() {
                return Err(Error::StreamState);
            }
            ss.finish();
        }
        if !self.pending_streams.contains(&id) {
            self.pending_streams.push_back(id);
        }
        Ok(())
    }

    /// Abandon transmitting data on a stream, discarding unacknowledged
    /// bytes.
    ///
    /// Application error code 0 is reserved and rejected.
    pub fn reset(&mut self, id: StreamId, error_code: u16) -> Result<(), Error> {
        if error_code == STOPPING {
            return Err(Error::InvalidArgument);
        }
        if id.directionality() == Directionality::Uni && id.initiator() != self.side {
            return Err(Error::InvalidArgument);
        }
        {
            let ss = match self.streams.get_send_mut(&id) {
                Some(x) => x,
                // Reset is a no-op on a closed stream.
                None => return Ok(()),
            };
            match ss.state {
                SendState::DataRecvd
                | SendState::ResetSent { .. }
                | SendState::ResetRecvd { .. } => {
                    return Ok(());
                }
                _ => {}
            }
            ss.reset(None);
        }
        self.spaces[SpaceId::Data as usize]
            .pending
            .rst_stream
            .push((id, error_code));
        Ok(())
    }

    /// Ask the peer to stop transmitting on a stream.
    ///
    /// Application error code 0 is reserved and rejected.
    pub fn stop_sending(&mut self, id: StreamId, error_code: u16) -> Result<(), Error> {
        if error_code == STOPPING {
            return Err(Error::InvalidArgument);
        }
        if id.directionality() == Directionality::Uni && id.initiator() == self.side {
            return Err(Error::InvalidArgument);
        }
        let finished = {
            let rs = match self.streams.get_recv_mut(&id) {
                Some(x) => x,
                None => return Err(Error::StreamNotFound),
            };
            if rs.is_finished() {
                true
            } else {
                rs.stopped = true;
                rs.assembler.clear();
                false
            }
        };
        if !finished {
            self.spaces[SpaceId::Data as usize]
                .pending
                .stop_sending
                .push((id, error_code));
        }
        Ok(())
    }

    /// Ping the remote endpoint, e.g. to keep an otherwise idle connection
    /// alive.
    pub fn ping(&mut self) {
        self.spaces[SpaceId::Data as usize].pending.ping = true;
    }

    /// Begin validating the current network path.
    pub fn validate_path(&mut self, now: u64) {
        if self.path_validator.is_some() {
            return;
        }
        let mut pv = PathValidator::new(self.config.path_challenge_timeout);
        pv.ensure_started(now);
        self.path_validator = Some(pv);
        self.path_validated = false;
    }

    /// Close the connection immediately.
    ///
    /// This does not ensure delivery of outstanding data. It is the
    /// application's responsibility to call this only when all important
    /// communications have been completed.
    pub fn close(&mut self, now: u64, error_code: u16, reason: Bytes) {
        match self.state {
            State::Closing(_) | State::Draining | State::Drained => return,
            _ => {}
        }
        trace!(self.log, "connection closed by application");
        self.initiate_close(
            now,
            CloseReason::Application(frame::ApplicationClose { error_code, reason }),
        );
        self.loss_detection_alarm = None;
        self.ack_alarm = None;
    }

    /// Discard a stream once both halves are done with it.
    fn maybe_cleanup(&mut self, id: StreamId, error_code: u16) -> Result<(), Error> {
        let closed = self
            .streams
            .streams
            .get(&id)
            .map_or(false, |x| x.is_closed());
        if !closed {
            return Ok(());
        }
        self.streams.streams.remove(&id);
        self.session.stream_close(id, error_code)?;
        if id.initiator() != self.side {
            // Completing a remote stream frees budget for another.
            let pending = &mut self.spaces[SpaceId::Data as usize].pending;
            match id.directionality() {
                Directionality::Uni => {
                    self.streams.max_remote_uni += 1;
                    pending.max_uni_stream_id = true;
                }
                Directionality::Bi => {
                    self.streams.max_remote_bi += 1;
                    pending.max_bi_stream_id = true;
                }
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Outbound
    // ---------------------------------------------------------------------

    /// Build the next outgoing datagram, coalescing packets of ascending
    /// encryption levels.
    ///
    /// Returns `Ok(None)` when there is nothing to send. Hosts call this in
    /// a loop after any operation that may have produced work.
    pub fn next_packet(&mut self, now: u64) -> Result<Option<Vec<u8>>, Error> {
        match self.state {
            State::Draining | State::Drained => return Ok(None),
            State::Closing(_) => {
                if !self.close_pending {
                    return Ok(None);
                }
                self.close_pending = false;
                return self.build_close_packet();
            }
            _ => {}
        }

        let mut datagram = Vec::new();
        for &space_id in &SpaceId::VALUES {
            let level = match self.level_for_sending(space_id) {
                Some(x) => x,
                None => continue,
            };
            if let Some(packet) = self.build_packet(now, space_id, level, datagram.len())? {
                datagram.extend_from_slice(&packet);
            }
        }
        if datagram.is_empty() {
            Ok(None)
        } else {
            self.reset_idle_timeout(now);
            Ok(Some(datagram))
        }
    }

    /// The encryption level this space's traffic currently uses, given the
    /// keys on hand.
    fn level_for_sending(&self, space_id: SpaceId) -> Option<EncryptionLevel> {
        match space_id {
            SpaceId::Initial => self.spaces[SpaceId::Initial as usize]
                .keys
                .as_ref()
                .map(|_| EncryptionLevel::Initial),
            SpaceId::Handshake => self.spaces[SpaceId::Handshake as usize]
                .keys
                .as_ref()
                .map(|_| EncryptionLevel::Handshake),
            SpaceId::Data => {
                if self.spaces[SpaceId::Data as usize].keys.is_some() {
                    Some(EncryptionLevel::OneRtt)
                } else if self.side == Side::Client && self.zero_rtt_keys.is_some() {
                    Some(EncryptionLevel::ZeroRtt)
                } else {
                    None
                }
            }
        }
    }

    fn congestion_blocked(&self) -> bool {
        self.congestion_window.saturating_sub(self.bytes_in_flight) < u64::from(self.mtu)
    }

    fn build_packet(
        &mut self,
        now: u64,
        space_id: SpaceId,
        level: EncryptionLevel,
        datagram_len: usize,
    ) -> Result<Option<Vec<u8>>, Error> {
        let overhead = self.session.aead_overhead();
        let datagram_budget = u64::from(self.mtu) as usize;
        // Too little room left to be worth a packet.
        if datagram_len + 64 > datagram_budget {
            return Ok(None);
        }

        // Queue a fresh path challenge first so its transmission is
        // accounted like any other control frame.
        if space_id == SpaceId::Data && self.path_validator.is_some() {
            self.prepare_path_challenge(now)?;
        }

        // A blocking path validation starves everything but its own frames.
        let path_blocked = self
            .path_validator
            .as_ref()
            .map_or(false, |pv| pv.blocking);
        let can_send_data = space_id == SpaceId::Data
            && (level == EncryptionLevel::ZeroRtt || self.is_established())
            && !path_blocked;
        let stream_work = can_send_data
            && self.pending_streams.iter().any(|id| {
                self.streams
                    .streams
                    .get(id)
                    .and_then(|s| s.send.as_ref())
                    .map_or(false, |ss| ss.has_pending())
            });
        let probing = space_id == SpaceId::Data && self.probe_pkt_left > 0;
        let elicited_work = {
            let space = &self.spaces[space_id as usize];
            space.crypto.has_pending() || !space.pending.is_empty() || stream_work
        };
        let acks_ready = {
            let space = &self.spaces[space_id as usize];
            space.permit_ack_only && !space.pending_acks.is_empty()
        };
        if !elicited_work && !acks_ready && !probing {
            return Ok(None);
        }
        // Congestion control: ack-only packets are always allowed, probes
        // bypass the window, and handshake progress is never starved.
        let congestion_limited =
            space_id == SpaceId::Data && !probing && self.congestion_blocked();
        if congestion_limited && !acks_ready {
            return Ok(None);
        }
        let include_elicited = elicited_work && !congestion_limited;

        let number = self.spaces[space_id as usize].get_tx_number()?;
        let pn = PacketNumber::new(number, self.spaces[space_id as usize].largest_acked_packet);
        let header = match level {
            EncryptionLevel::Initial => Header::Initial {
                src_cid: self.loc_cid,
                dst_cid: self.rem_cid,
                token: self.retry_token.clone(),
                number: pn,
            },
            EncryptionLevel::Handshake => Header::Long {
                ty: LongType::Handshake,
                src_cid: self.loc_cid,
                dst_cid: self.rem_cid,
                number: pn,
            },
            EncryptionLevel::ZeroRtt => Header::Long {
                ty: LongType::ZeroRtt,
                src_cid: self.loc_cid,
                dst_cid: self.rem_cid,
                number: pn,
            },
            EncryptionLevel::OneRtt => Header::Short {
                dst_cid: self.rem_cid,
                number: pn,
                key_phase: self.key_phase,
            },
        };
        trace!(self.log, "sending packet"; "pn" => number, "space" => ?space_id);

        let mut buf = Vec::with_capacity(datagram_budget - datagram_len);
        let partial_encode = header.encode(&mut buf);
        let header_len = buf.len();
        let max_size = datagram_budget - datagram_len - overhead;

        let mut sent = Retransmits::default();
        let mut stream_frames = Vec::new();
        let mut crypto_frames = Vec::new();

        // ACK
        let acks = {
            let space = &mut self.spaces[space_id as usize];
            if !space.pending_acks.is_empty() {
                let exponent = u32::from(self.config.ack_delay_exponent);
                let delay = (now.saturating_sub(space.rx_packet_time) / MICROSECONDS) >> exponent;
                trace!(self.log, "ACK";
                       "ranges" => ?space.pending_acks.iter().collect::<Vec<_>>(),
                       "delay" => delay);
                frame::Ack::encode(delay, &space.pending_acks, &mut buf);
                space.pending_acks.clone()
            } else {
                RangeSet::new()
            }
        };

        // CRYPTO
        while include_elicited && buf.len() + 24 < max_size {
            let (offset, data) = {
                let space = &mut self.spaces[space_id as usize];
                let budget = max_size - buf.len() - 24;
                match space.crypto.pop(budget) {
                    Some(x) => x,
                    None => break,
                }
            };
            trace!(self.log, "CRYPTO"; "off" => offset, "len" => data.len());
            let quic_frame = frame::Crypto { offset, data };
            quic_frame.encode(&mut buf);
            crypto_frames.push(quic_frame);
        }

        if include_elicited {
            self.populate_control_frames(space_id, &mut buf, max_size, &mut sent);
        }

        // STREAM
        if can_send_data && include_elicited {
            let mut remaining = self.pending_streams.len();
            while buf.len() + 25 < max_size && remaining > 0 {
                remaining -= 1;
                let id = match self.pending_streams.pop_front() {
                    Some(x) => x,
                    None => break,
                };
                let budget = max_size - buf.len() - 25;
                let popped = match self.streams.get_send_mut(&id) {
                    Some(ss) => {
                        if ss.state.was_reset() {
                            continue;
                        }
                        ss.pop(budget)
                    }
                    None => continue,
                };
                let (offset, data, fin) = match popped {
                    Some(x) => x,
                    None => continue,
                };
                trace!(self.log, "STREAM"; "id" => id.0, "off" => offset,
                       "len" => data.len(), "fin" => fin);
                let quic_frame = frame::Stream {
                    id,
                    offset,
                    fin,
                    data,
                };
                quic_frame.encode(true, &mut buf);
                {
                    let ss = self.streams.get_send_mut(&id).unwrap();
                    if fin {
                        if let SendState::Send = ss.state {
                            ss.state = SendState::DataSent;
                        }
                    }
                    if ss.has_pending() {
                        self.pending_streams.push_back(id);
                        remaining += 1;
                    }
                }
                stream_frames.push(quic_frame);
            }
        }

        let mut ack_eliciting =
            !crypto_frames.is_empty() || !stream_frames.is_empty() || !sent.is_empty();

        if buf.len() == header_len && acks.is_empty() && !probing {
            // Nothing fit after all; the unused packet number leaves a
            // harmless gap.
            return Ok(None);
        }

        // Probes must elicit acknowledgement.
        if probing && !ack_eliciting {
            trace!(self.log, "PING (probe)");
            buf.push(frame::Type::PING.into());
            ack_eliciting = true;
        }

        // The client's Initial packets ride in padded datagrams.
        if level == EncryptionLevel::Initial && self.side == Side::Client {
            let target = MIN_INITIAL_SIZE.saturating_sub(overhead + datagram_len);
            if buf.len() < target {
                buf.resize(target, frame::Type::PADDING.into());
            }
        }

        if level != EncryptionLevel::OneRtt {
            set_payload_length(&mut buf, header_len, pn.len(), overhead);
        }

        // Seal and protect.
        let keys = match level {
            EncryptionLevel::ZeroRtt => self.zero_rtt_keys.as_ref().unwrap().tx.clone(),
            _ => self.spaces[space_id as usize]
                .keys
                .as_ref()
                .unwrap()
                .tx
                .clone(),
        };
        self.seal_packet(level, number, &keys, header_len, partial_encode, &mut buf)?;

        if probing && ack_eliciting {
            self.probe_pkt_left -= 1;
        }
        {
            // Having acked once, don't immediately volunteer to ack again.
            let space = &mut self.spaces[space_id as usize];
            space.permit_ack_only &= acks.is_empty();
        }
        if space_id == SpaceId::Data && !acks.is_empty() {
            self.ack_alarm = None;
        }

        let bytes = if ack_eliciting { buf.len() as u16 } else { 0 };
        self.on_packet_sent(
            now,
            space_id,
            number,
            SentPacket {
                time: now,
                bytes,
                pn_len: pn.len() as u8,
                ack_eliciting,
                acks,
                retransmits: sent,
                stream_frames,
                crypto_frames,
            },
        );
        Ok(Some(buf))
    }

    /// Encrypt the payload in place and apply packet number protection.
    fn seal_packet(
        &mut self,
        level: EncryptionLevel,
        number: u64,
        keys: &Keys,
        header_len: usize,
        partial_encode: ::packet::PartialEncode,
        buf: &mut Vec<u8>,
    ) -> Result<(), Error> {
        let payload = buf.split_off(header_len);
        let header_data = buf.clone();
        let nonce = crypto::nonce_for(number, &keys.iv);
        if level.is_handshake() {
            self.session
                .in_encrypt(buf, &payload, &keys.key, &nonce, &header_data)?;
        } else {
            self.session
                .encrypt(buf, &payload, &keys.key, &nonce, &header_data)?;
        }
        let session = &mut self.session;
        let in_level = level.is_handshake();
        partial_encode
            .finish(buf, |sample, pn_bytes| {
                let r = if in_level {
                    session.in_encrypt_pn(pn_bytes, &keys.pn, sample)
                } else {
                    session.encrypt_pn(pn_bytes, &keys.pn, sample)
                };
                r.map_err(|_| ())
            })
            .map_err(|()| Error::Internal)
    }

    fn prepare_path_challenge(&mut self, now: u64) -> Result<(), Error> {
        let timed_out = self
            .path_validator
            .as_ref()
            .map_or(false, |pv| pv.timed_out(now));
        if timed_out {
            debug!(self.log, "path validation timed out");
            self.path_validator = None;
            self.path_validated = false;
            return Ok(());
        }
        let pending_challenge = self.spaces[SpaceId::Data as usize]
            .pending
            .path_challenge
            .is_some();
        let want = {
            let pv = self.path_validator.as_mut().unwrap();
            !pending_challenge && pv.can_send(now)
        };
        if want {
            let mut token_bytes = [0; 8];
            self.session
                .rand(&mut token_bytes, RandContext::PathChallenge)?;
            let token = u64::from_be_bytes(token_bytes);
            let expiry = now + self.rto();
            let pv = self.path_validator.as_mut().unwrap();
            pv.add_challenge(token, now, expiry);
            self.spaces[SpaceId::Data as usize].pending.path_challenge = Some(token);
        }
        Ok(())
    }

    fn populate_control_frames(
        &mut self,
        space_id: SpaceId,
        buf: &mut Vec<u8>,
        max_size: usize,
        sent: &mut Retransmits,
    ) {
        use coding::BufMutExt;

        // PATH_RESPONSE
        if buf.len() + 9 < max_size {
            // No need to retransmit these, so we don't save the value after
            // encoding it.
            if let Some((_, token)) = self.spaces[space_id as usize].pending.path_response.take() {
                trace!(self.log, "PATH_RESPONSE"; "value" => format!("{:016x}", token));
                buf.write(frame::Type::PATH_RESPONSE);
                buf.write(token);
            }
        }

        // PATH_CHALLENGE
        if buf.len() + 9 < max_size {
            if let Some(token) = self.spaces[space_id as usize].pending.path_challenge.take() {
                trace!(self.log, "PATH_CHALLENGE"; "value" => format!("{:016x}", token));
                buf.write(frame::Type::PATH_CHALLENGE);
                buf.write(token);
                sent.path_challenge = Some(token);
            }
        }

        if space_id != SpaceId::Data {
            return;
        }

        // PING
        if self.spaces[space_id as usize].pending.ping && buf.len() + 1 < max_size {
            trace!(self.log, "PING");
            self.spaces[space_id as usize].pending.ping = false;
            sent.ping = true;
            buf.write(frame::Type::PING);
        }

        // RST_STREAM
        while buf.len() + 19 < max_size {
            let (id, error_code) = match self.spaces[space_id as usize].pending.rst_stream.pop() {
                Some(x) => x,
                None => break,
            };
            let final_offset = match self.streams.get_send_mut(&id) {
                Some(ss) => ss.offset,
                None => continue,
            };
            trace!(self.log, "RST_STREAM"; "stream" => id.0);
            sent.rst_stream.push((id, error_code));
            frame::RstStream {
                id,
                error_code,
                final_offset,
            }
            .encode(buf);
        }

        // STOP_SENDING
        while buf.len() + 11 < max_size {
            let (id, error_code) = match self.spaces[space_id as usize].pending.stop_sending.pop() {
                Some(x) => x,
                None => break,
            };
            let live = self
                .streams
                .get_recv_mut(&id)
                .map_or(false, |rs| !rs.is_finished());
            if !live {
                continue;
            }
            trace!(self.log, "STOP_SENDING"; "stream" => id.0);
            sent.stop_sending.push((id, error_code));
            buf.write(frame::Type::STOP_SENDING);
            buf.write_var(id.0);
            buf.write(error_code);
        }

        // MAX_DATA
        if self.spaces[space_id as usize].pending.max_data && buf.len() + 9 < max_size {
            self.spaces[space_id as usize].pending.max_data = false;
            self.local_max_data = self.unsent_max_data;
            trace!(self.log, "MAX_DATA"; "value" => self.local_max_data);
            sent.max_data = true;
            buf.write(frame::Type::MAX_DATA);
            buf.write_var(self.local_max_data);
        }

        // MAX_STREAM_DATA
        loop {
            if buf.len() + 17 >= max_size {
                break;
            }
            let id = match self.spaces[space_id as usize]
                .pending
                .max_stream_data
                .iter()
                .next()
            {
                Some(&x) => x,
                None => break,
            };
            self.spaces[space_id as usize]
                .pending
                .max_stream_data
                .remove(&id);
            let value = match self.streams.get_recv_mut(&id) {
                Some(rs) => {
                    if rs.is_finished() {
                        continue;
                    }
                    rs.max_data = rs.unsent_max_data;
                    rs.max_data
                }
                None => continue,
            };
            trace!(self.log, "MAX_STREAM_DATA"; "stream" => id.0, "value" => value);
            sent.max_stream_data.insert(id);
            buf.write(frame::Type::MAX_STREAM_DATA);
            buf.write_var(id.0);
            buf.write_var(value);
        }

        // MAX_STREAM_ID uni
        if self.spaces[space_id as usize].pending.max_uni_stream_id && buf.len() + 9 < max_size {
            self.spaces[space_id as usize].pending.max_uni_stream_id = false;
            sent.max_uni_stream_id = true;
            let id = self.streams.max_remote_id(self.side, Directionality::Uni);
            trace!(self.log, "MAX_STREAM_ID (unidirectional)"; "value" => id);
            buf.write(frame::Type::MAX_STREAM_ID);
            buf.write_var(id.0);
        }

        // MAX_STREAM_ID bi
        if self.spaces[space_id as usize].pending.max_bi_stream_id && buf.len() + 9 < max_size {
            self.spaces[space_id as usize].pending.max_bi_stream_id = false;
            sent.max_bi_stream_id = true;
            let id = self.streams.max_remote_id(self.side, Directionality::Bi);
            trace!(self.log, "MAX_STREAM_ID (bidirectional)"; "value" => id);
            buf.write(frame::Type::MAX_STREAM_ID);
            buf.write_var(id.0);
        }

        // BLOCKED
        if buf.len() + 9 < max_size {
            if let Some(offset) = self.spaces[space_id as usize].pending.blocked.take() {
                trace!(self.log, "BLOCKED"; "offset" => offset);
                sent.blocked = Some(offset);
                buf.write(frame::Type::BLOCKED);
                buf.write_var(offset);
            }
        }

        // STREAM_BLOCKED
        while buf.len() + 17 < max_size {
            let (id, offset) = match self.spaces[space_id as usize]
                .pending
                .stream_blocked
                .pop_front()
            {
                Some(x) => x,
                None => break,
            };
            trace!(self.log, "STREAM_BLOCKED"; "stream" => id.0, "offset" => offset);
            sent.stream_blocked.push_back((id, offset));
            buf.write(frame::Type::STREAM_BLOCKED);
            buf.write_var(id.0);
            buf.write_var(offset);
        }

        // STREAM_ID_BLOCKED
        if self.spaces[space_id as usize].pending.uni_stream_id_blocked && buf.len() + 9 < max_size
        {
            self.spaces[space_id as usize].pending.uni_stream_id_blocked = false;
            sent.uni_stream_id_blocked = true;
            let id = StreamId::new(
                self.side,
                Directionality::Uni,
                self.streams.max_uni.saturating_sub(1),
            );
            trace!(self.log, "STREAM_ID_BLOCKED (unidirectional)");
            buf.write(frame::Type::STREAM_ID_BLOCKED);
            buf.write_var(id.0);
        }
        if self.spaces[space_id as usize].pending.bi_stream_id_blocked && buf.len() + 9 < max_size {
            self.spaces[space_id as usize].pending.bi_stream_id_blocked = false;
            sent.bi_stream_id_blocked = true;
            let id = StreamId::new(
                self.side,
                Directionality::Bi,
                self.streams.max_bi.saturating_sub(1),
            );
            trace!(self.log, "STREAM_ID_BLOCKED (bidirectional)");
            buf.write(frame::Type::STREAM_ID_BLOCKED);
            buf.write_var(id.0);
        }

        // RETIRE_CONNECTION_ID
        while buf.len() + 9 < max_size {
            let sequence = match self.spaces[space_id as usize]
                .pending
                .retire_connection_id
                .pop()
            {
                Some(x) => x,
                None => break,
            };
            trace!(self.log, "RETIRE_CONNECTION_ID"; "sequence" => sequence);
            sent.retire_connection_id.push(sequence);
            buf.write(frame::Type::RETIRE_CONNECTION_ID);
            buf.write_var(sequence);
        }
    }

    /// Emit a packet carrying only the close frame, at the highest
    /// encryption level available.
    fn build_close_packet(&mut self) -> Result<Option<Vec<u8>>, Error> {
        let reason = match self.state {
            State::Closing(ref x) => x.clone(),
            _ => return Ok(None),
        };
        let overhead = self.session.aead_overhead();
        let (space_id, level) = if self.spaces[SpaceId::Data as usize].keys.is_some() {
            (SpaceId::Data, EncryptionLevel::OneRtt)
        } else if self.spaces[SpaceId::Handshake as usize].keys.is_some() {
            (SpaceId::Handshake, EncryptionLevel::Handshake)
        } else if self.spaces[SpaceId::Initial as usize].keys.is_some() {
            (SpaceId::Initial, EncryptionLevel::Initial)
        } else {
            return Ok(None);
        };

        let number = self.spaces[space_id as usize].get_tx_number()?;
        let pn = PacketNumber::new(number, self.spaces[space_id as usize].largest_acked_packet);
        let header = match level {
            EncryptionLevel::OneRtt => Header::Short {
                dst_cid: self.rem_cid,
                number: pn,
                key_phase: self.key_phase,
            },
            EncryptionLevel::Handshake => Header::Long {
                ty: LongType::Handshake,
                src_cid: self.loc_cid,
                dst_cid: self.rem_cid,
                number: pn,
            },
            _ => Header::Initial {
                src_cid: self.loc_cid,
                dst_cid: self.rem_cid,
                token: self.retry_token.clone(),
                number: pn,
            },
        };
        let mut buf = Vec::new();
        let partial_encode = header.encode(&mut buf);
        let header_len = buf.len();
        let max_len = u64::from(self.mtu) as usize - header_len - overhead;
        match reason {
            CloseReason::Application(ref x) => x.encode(&mut buf, max_len),
            CloseReason::Connection(ref x) => x.encode(&mut buf, max_len),
        }
        if level != EncryptionLevel::OneRtt {
            set_payload_length(&mut buf, header_len, pn.len(), overhead);
        }
        let keys = self.spaces[space_id as usize]
            .keys
            .as_ref()
            .unwrap()
            .tx
            .clone();
        self.seal_packet(level, number, &keys, header_len, partial_encode, &mut buf)?;
        Ok(Some(buf))
    }

    fn on_packet_sent(&mut self, now: u64, space_id: SpaceId, number: u64, packet: SentPacket) {
        let bytes = packet.bytes;
        let ack_eliciting = packet.ack_eliciting;
        self.spaces[space_id as usize]
            .sent_packets
            .insert(number, packet);
        if bytes != 0 {
            if ack_eliciting {
                self.time_of_last_sent_ack_eliciting_packet = now;
                if space_id != SpaceId::Data {
                    self.time_of_last_sent_handshake_packet = now;
                }
            }
            self.bytes_in_flight += u64::from(bytes);
            self.set_loss_detection_alarm();
        }
    }
}

fn space_level(space_id: SpaceId) -> EncryptionLevel {
    match space_id {
        SpaceId::Initial => EncryptionLevel::Initial,
        SpaceId::Handshake => EncryptionLevel::Handshake,
        SpaceId::Data => EncryptionLevel::OneRtt,
    }
}

/// Ensures we can always fit all our ACKs in a single minimum-MTU packet
/// with room to spare
const MAX_ACK_BLOCKS: usize = 64;
