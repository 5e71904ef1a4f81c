use std::collections::VecDeque;
use std::net::{Ipv6Addr, SocketAddrV6};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use slog::{Drain, Logger};
use slog_term;

use config::Config;
use connection::{Connection, Timer};
use crypto::{EncryptionLevel, KeyPair, Keys, RandContext};
use packet::{self, ConnectionId};
use stream::WriteError;
use transport_parameters::TransportParameters;
use {ConnectionHandler, Directionality, Error, Session, Side, StreamId, RESET_TOKEN_SIZE,
     VERSION};

fn logger() -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(::std::io::stderr());
    let drain = slog_term::FullFormat::new(decorator)
        .use_original_order()
        .build()
        .fuse();
    Logger::root(drain, o!())
}

fn addr(port: u16) -> SocketAddrV6 {
    SocketAddrV6::new(Ipv6Addr::LOCALHOST, port, 0, 0)
}

const AEAD_TAG: usize = 16;

// ---------------------------------------------------------------------------
// A deterministic stand-in for the TLS collaborator.
//
// The "handshake" is four framed messages: ClientHello and ServerHello at the
// Initial level, EncryptedExtensions and Finished at the Handshake level,
// with transport parameters riding in ClientHello and EncryptedExtensions.
// Packet protection appends a key-and-nonce-derived tag so that decryption
// under the wrong keys genuinely fails.
// ---------------------------------------------------------------------------

const MSG_CLIENT_HELLO: u8 = 1;
const MSG_SERVER_HELLO: u8 = 2;
const MSG_ENCRYPTED_EXTENSIONS: u8 = 3;
const MSG_FINISHED: u8 = 4;

#[derive(Debug, Clone, PartialEq)]
enum Event {
    HandshakeCompleted,
    StreamOpen(StreamId),
    StreamData {
        id: StreamId,
        offset: u64,
        fin: bool,
        data: Vec<u8>,
    },
    AckedStream {
        id: StreamId,
        offset: u64,
        len: u64,
    },
    AckedCrypto {
        level: EncryptionLevel,
        offset: u64,
        len: u64,
    },
    StreamClose(StreamId, u16),
    Retry,
    StatelessReset,
    VersionNegotiation(Vec<u32>),
}

struct TestSession {
    side: Side,
    params: TransportParameters,
    peer_params: Option<TransportParameters>,
    handshaking: bool,
    hello_sent: bool,
    outgoing: [Vec<u8>; 3],
    incoming: [Vec<u8>; 3],
    new_keys: VecDeque<(EncryptionLevel, KeyPair)>,
    events: Vec<Event>,
    rng_state: u64,
}

impl TestSession {
    fn new(side: Side, params: TransportParameters) -> Self {
        Self {
            side,
            params,
            peer_params: None,
            handshaking: true,
            hello_sent: false,
            outgoing: [Vec::new(), Vec::new(), Vec::new()],
            incoming: [Vec::new(), Vec::new(), Vec::new()],
            new_keys: VecDeque::new(),
            events: Vec::new(),
            rng_state: 0x9e37_79b9_7f4a_7c15,
        }
    }

    fn level_index(level: EncryptionLevel) -> usize {
        match level {
            EncryptionLevel::Initial => 0,
            EncryptionLevel::Handshake => 1,
            EncryptionLevel::ZeroRtt | EncryptionLevel::OneRtt => 2,
        }
    }

    fn queue_message(&mut self, level: EncryptionLevel, ty: u8, body: &[u8]) {
        let out = &mut self.outgoing[Self::level_index(level)];
        out.push(ty);
        out.push((body.len() >> 8) as u8);
        out.push(body.len() as u8);
        out.extend_from_slice(body);
    }

    fn handle_message(&mut self, level: EncryptionLevel, ty: u8, body: &[u8]) -> Result<(), Error> {
        match (self.side, ty, level) {
            (Side::Server, MSG_CLIENT_HELLO, EncryptionLevel::Initial) => {
                let params =
                    TransportParameters::read(self.side, &mut ::std::io::Cursor::new(body))
                        .map_err(|_| Error::Crypto { alert: 47 })?;
                self.peer_params = Some(params);
                self.queue_message(EncryptionLevel::Initial, MSG_SERVER_HELLO, &[]);
                self.new_keys
                    .push_back((EncryptionLevel::Handshake, handshake_keys(self.side)));
                let mut ee = Vec::new();
                let local = self.params.clone();
                local.write(self.side, &mut ee);
                self.queue_message(EncryptionLevel::Handshake, MSG_ENCRYPTED_EXTENSIONS, &ee);
                self.new_keys
                    .push_back((EncryptionLevel::OneRtt, one_rtt_keys(self.side)));
            }
            (Side::Client, MSG_SERVER_HELLO, EncryptionLevel::Initial) => {
                self.new_keys
                    .push_back((EncryptionLevel::Handshake, handshake_keys(self.side)));
            }
            (Side::Client, MSG_ENCRYPTED_EXTENSIONS, EncryptionLevel::Handshake) => {
                let params =
                    TransportParameters::read(self.side, &mut ::std::io::Cursor::new(body))
                        .map_err(|_| Error::Crypto { alert: 47 })?;
                self.peer_params = Some(params);
                self.queue_message(EncryptionLevel::Handshake, MSG_FINISHED, &[]);
                self.new_keys
                    .push_back((EncryptionLevel::OneRtt, one_rtt_keys(self.side)));
                self.handshaking = false;
            }
            (Side::Server, MSG_FINISHED, EncryptionLevel::Handshake) => {
                self.handshaking = false;
            }
            _ => return Err(Error::Crypto { alert: 10 }),
        }
        Ok(())
    }
}

fn material(label: &[u8], len: usize) -> Vec<u8> {
    (0..len).map(|i| label[i % label.len()] ^ i as u8).collect()
}

fn keys_from(label: &[u8]) -> Keys {
    Keys {
        key: material(label, 16),
        iv: material(label, 12),
        pn: material(label, 16),
    }
}

/// Initial key material is a pure function of the client's destination CID,
/// so both sides derive the same pair independently.
fn initial_keys(dcid: &ConnectionId, side: Side) -> KeyPair {
    let mut client_label = b"initial client ".to_vec();
    client_label.extend_from_slice(dcid);
    let mut server_label = b"initial server ".to_vec();
    server_label.extend_from_slice(dcid);
    let client = keys_from(&client_label);
    let server = keys_from(&server_label);
    match side {
        Side::Client => KeyPair {
            tx: client,
            rx: server,
        },
        Side::Server => KeyPair {
            tx: server,
            rx: client,
        },
    }
}

fn directional_pair(client_label: &[u8], server_label: &[u8], side: Side) -> KeyPair {
    let client = keys_from(client_label);
    let server = keys_from(server_label);
    match side {
        Side::Client => KeyPair {
            tx: client,
            rx: server,
        },
        Side::Server => KeyPair {
            tx: server,
            rx: client,
        },
    }
}

fn handshake_keys(side: Side) -> KeyPair {
    directional_pair(b"hs client", b"hs server", side)
}

fn one_rtt_keys(side: Side) -> KeyPair {
    directional_pair(b"1rtt client", b"1rtt server", side)
}

fn tag_for(key: &[u8], nonce: &[u8]) -> [u8; AEAD_TAG] {
    let mut tag = [0; AEAD_TAG];
    for i in 0..AEAD_TAG {
        tag[i] = key[i % key.len()] ^ nonce[i % nonce.len()] ^ 0x5a;
    }
    tag
}

impl ConnectionHandler for TestSession {
    fn stream_open(&mut self, id: StreamId) -> Result<(), Error> {
        self.events.push(Event::StreamOpen(id));
        Ok(())
    }

    fn stream_close(&mut self, id: StreamId, app_error_code: u16) -> Result<(), Error> {
        self.events.push(Event::StreamClose(id, app_error_code));
        Ok(())
    }

    fn recv_stream_data(
        &mut self,
        id: StreamId,
        offset: u64,
        fin: bool,
        data: &[u8],
    ) -> Result<(), Error> {
        self.events.push(Event::StreamData {
            id,
            offset,
            fin,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn acked_stream_data_offset(
        &mut self,
        id: StreamId,
        offset: u64,
        len: u64,
    ) -> Result<(), Error> {
        self.events.push(Event::AckedStream { id, offset, len });
        Ok(())
    }

    fn acked_crypto_offset(
        &mut self,
        level: EncryptionLevel,
        offset: u64,
        len: u64,
    ) -> Result<(), Error> {
        self.events.push(Event::AckedCrypto { level, offset, len });
        Ok(())
    }

    fn handshake_completed(&mut self) -> Result<(), Error> {
        self.events.push(Event::HandshakeCompleted);
        Ok(())
    }

    fn recv_retry(&mut self, _src_cid: &ConnectionId) -> Result<(), Error> {
        self.events.push(Event::Retry);
        Ok(())
    }

    fn recv_stateless_reset(&mut self) -> Result<(), Error> {
        self.events.push(Event::StatelessReset);
        Ok(())
    }

    fn recv_version_negotiation(&mut self, versions: &[u32]) -> Result<(), Error> {
        self.events.push(Event::VersionNegotiation(versions.to_vec()));
        Ok(())
    }
}

impl Session for TestSession {
    fn client_initial(&mut self, dst_cid: &ConnectionId) -> Result<KeyPair, Error> {
        if !self.hello_sent {
            self.hello_sent = true;
            let mut ch = Vec::new();
            let local = self.params.clone();
            local.write(self.side, &mut ch);
            self.queue_message(EncryptionLevel::Initial, MSG_CLIENT_HELLO, &ch);
        }
        Ok(initial_keys(dst_cid, self.side))
    }

    fn recv_client_initial(&mut self, dst_cid: &ConnectionId) -> Result<KeyPair, Error> {
        Ok(initial_keys(dst_cid, self.side))
    }

    fn recv_crypto_data(&mut self, level: EncryptionLevel, data: &[u8]) -> Result<(), Error> {
        self.incoming[Self::level_index(level)].extend_from_slice(data);
        loop {
            let (ty, body) = {
                let buf = &self.incoming[Self::level_index(level)];
                if buf.len() < 3 {
                    return Ok(());
                }
                let len = (buf[1] as usize) << 8 | buf[2] as usize;
                if buf.len() < 3 + len {
                    return Ok(());
                }
                (buf[0], buf[3..3 + len].to_vec())
            };
            let consumed = 3 + body.len();
            self.incoming[Self::level_index(level)].drain(..consumed);
            self.handle_message(level, ty, &body)?;
        }
    }

    fn write_crypto_data(
        &mut self,
        level: EncryptionLevel,
        buf: &mut Vec<u8>,
    ) -> Result<(), Error> {
        buf.append(&mut self.outgoing[Self::level_index(level)]);
        Ok(())
    }

    fn take_keys(&mut self) -> Option<(EncryptionLevel, KeyPair)> {
        self.new_keys.pop_front()
    }

    fn is_handshaking(&self) -> bool {
        self.handshaking
    }

    fn transport_parameters(&self) -> Result<Option<TransportParameters>, Error> {
        Ok(self.peer_params.clone())
    }

    fn aead_overhead(&self) -> usize {
        AEAD_TAG
    }

    fn in_encrypt(
        &mut self,
        out: &mut Vec<u8>,
        plaintext: &[u8],
        key: &[u8],
        nonce: &[u8],
        _ad: &[u8],
    ) -> Result<(), Error> {
        out.extend_from_slice(plaintext);
        out.extend_from_slice(&tag_for(key, nonce));
        Ok(())
    }

    fn in_decrypt(
        &mut self,
        out: &mut Vec<u8>,
        ciphertext: &[u8],
        key: &[u8],
        nonce: &[u8],
        _ad: &[u8],
    ) -> Result<(), Error> {
        if ciphertext.len() < AEAD_TAG {
            return Err(Error::TlsDecrypt);
        }
        let split = ciphertext.len() - AEAD_TAG;
        if ciphertext[split..] != tag_for(key, nonce)[..] {
            return Err(Error::TlsDecrypt);
        }
        out.extend_from_slice(&ciphertext[..split]);
        Ok(())
    }

    fn encrypt(
        &mut self,
        out: &mut Vec<u8>,
        plaintext: &[u8],
        key: &[u8],
        nonce: &[u8],
        ad: &[u8],
    ) -> Result<(), Error> {
        self.in_encrypt(out, plaintext, key, nonce, ad)
    }

    fn decrypt(
        &mut self,
        out: &mut Vec<u8>,
        ciphertext: &[u8],
        key: &[u8],
        nonce: &[u8],
        ad: &[u8],
    ) -> Result<(), Error> {
        self.in_decrypt(out, ciphertext, key, nonce, ad)
    }

    fn in_encrypt_pn(&mut self, pn: &mut [u8], key: &[u8], sample: &[u8]) -> Result<(), Error> {
        for (i, byte) in pn.iter_mut().enumerate() {
            *byte ^= key[i % key.len()] ^ sample[i % sample.len()];
        }
        Ok(())
    }

    fn encrypt_pn(&mut self, pn: &mut [u8], key: &[u8], sample: &[u8]) -> Result<(), Error> {
        self.in_encrypt_pn(pn, key, sample)
    }

    fn rand(&mut self, dest: &mut [u8], _context: RandContext) -> Result<(), Error> {
        for byte in dest.iter_mut() {
            self.rng_state ^= self.rng_state << 13;
            self.rng_state ^= self.rng_state >> 7;
            self.rng_state ^= self.rng_state << 17;
            *byte = self.rng_state as u8;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Lock-step client/server harness
// ---------------------------------------------------------------------------

struct Pair {
    client: Connection<TestSession>,
    server: Connection<TestSession>,
    time: u64,
    client_dcid: ConnectionId,
}

impl Pair {
    fn new(client_config: Config, server_config: Config) -> Self {
        let client_config = Arc::new(client_config);
        let server_config = Arc::new(server_config);
        let client_dcid = ConnectionId::new(&[0xc1; 8]);
        let client_scid = ConnectionId::new(&[0x1c; 8]);
        let server_scid = ConnectionId::new(&[0x5e; 8]);

        let client_session = TestSession::new(
            Side::Client,
            TransportParameters::new(&client_config),
        );
        let mut server_params = TransportParameters::new(&server_config);
        server_params.stateless_reset_token = server_config.stateless_reset_token;
        let server_session = TestSession::new(Side::Server, server_params);

        let client = Connection::new_client(
            logger(),
            client_config,
            client_session,
            client_scid,
            client_dcid,
            addr(4433),
        )
        .unwrap();
        let server = Connection::new_server(
            logger(),
            server_config,
            server_session,
            server_scid,
            addr(7000),
        );
        Self {
            client,
            server,
            time: ::SECONDS,
            client_dcid,
        }
    }

    fn default_config() -> Config {
        Config {
            max_remote_bi_streams: 8,
            max_remote_uni_streams: 8,
            ..Config::default()
        }
    }

    fn basic() -> Self {
        Self::new(Self::default_config(), Self::default_config())
    }

    /// Shuttle datagrams both ways until neither side has anything to send.
    /// `keep` may drop individual datagrams: it sees (sender, index, bytes).
    fn drive_filtered<F: FnMut(Side, usize, &[u8]) -> bool>(&mut self, mut keep: F) {
        let mut idle_rounds = 0;
        let mut index = 0;
        while idle_rounds < 2 {
            let mut sent_any = false;
            while let Some(datagram) = self.client.next_packet(self.time).unwrap() {
                sent_any = true;
                if keep(Side::Client, index, &datagram) {
                    self.server
                        .recv(self.time, addr(4433), BytesMut::from(&datagram[..]))
                        .unwrap();
                }
                index += 1;
            }
            while let Some(datagram) = self.server.next_packet(self.time).unwrap() {
                sent_any = true;
                if keep(Side::Server, index, &datagram) {
                    self.client
                        .recv(self.time, addr(7000), BytesMut::from(&datagram[..]))
                        .unwrap();
                }
                index += 1;
            }
            if sent_any {
                idle_rounds = 0;
            } else {
                idle_rounds += 1;
            }
            self.time += ::MILLISECONDS;
        }
    }

    fn drive(&mut self) {
        self.drive_filtered(|_, _, _| true);
    }

    fn handshake(&mut self) {
        self.drive();
        assert!(self.client.is_established());
        assert!(self.server.is_established());
    }

    fn fire_loss_timer(&mut self, side: Side) {
        let (conn, time) = match side {
            Side::Client => {
                let t = self.client.timer_expiry(Timer::LossDetection).unwrap();
                (&mut self.client, t)
            }
            Side::Server => {
                let t = self.server.timer_expiry(Timer::LossDetection).unwrap();
                (&mut self.server, t)
            }
        };
        self.time = self.time.max(time);
        conn.handle_timeout(self.time, Timer::LossDetection);
    }
}

fn count<F: Fn(&Event) -> bool>(events: &[Event], f: F) -> usize {
    events.iter().filter(|e| f(e)).count()
}

// ---------------------------------------------------------------------------
// End-to-end scenarios
// ---------------------------------------------------------------------------

#[test]
fn handshake_completes() {
    let mut pair = Pair::basic();
    pair.drive();
    assert!(pair.client.is_established());
    assert!(pair.server.is_established());
    assert_eq!(
        count(&pair.client.session().events, |e| *e
            == Event::HandshakeCompleted),
        1
    );
    assert_eq!(
        count(&pair.server.session().events, |e| *e
            == Event::HandshakeCompleted),
        1
    );
    // Handshake data was released through monotone per-level acks.
    assert!(pair
        .client
        .session()
        .events
        .iter()
        .any(|e| match *e {
            Event::AckedCrypto {
                level: EncryptionLevel::Initial,
                offset: 0,
                ..
            } => true,
            _ => false,
        }));
}

#[test]
fn bidirectional_stream_echo() {
    let mut pair = Pair::basic();
    pair.handshake();

    let id = pair.client.open(Directionality::Bi).unwrap();
    assert_eq!(id, StreamId(0));
    assert_eq!(pair.client.write(id, b"hello").unwrap(), 5);
    pair.client.finish(id).unwrap();
    pair.drive();

    {
        let events = &pair.server.session().events;
        assert!(events.contains(&Event::StreamOpen(id)));
        assert!(events.contains(&Event::StreamData {
            id,
            offset: 0,
            fin: true,
            data: b"hello".to_vec(),
        }));
        let open = events.iter().position(|e| *e == Event::StreamOpen(id));
        let data = events.iter().position(|e| match *e {
            Event::StreamData { id: x, .. } => x == id,
            _ => false,
        });
        assert!(open.unwrap() < data.unwrap());
    }
    assert!(pair.client.session().events.contains(&Event::AckedStream {
        id,
        offset: 0,
        len: 5,
    }));

    // Echo
    assert_eq!(pair.server.write(id, b"hello").unwrap(), 5);
    pair.server.finish(id).unwrap();
    pair.drive();

    assert!(pair.client.session().events.contains(&Event::StreamData {
        id,
        offset: 0,
        fin: true,
        data: b"hello".to_vec(),
    }));
    assert!(pair.server.session().events.contains(&Event::AckedStream {
        id,
        offset: 0,
        len: 5,
    }));
}

#[test]
fn loss_and_retransmission() {
    let mut pair = Pair::basic();
    pair.handshake();

    let id = pair.client.open(Directionality::Bi).unwrap();
    pair.client.write(id, b"irreplaceable").unwrap();
    pair.client.finish(id).unwrap();

    // Swallow every datagram the client sends this round.
    let mut dropped = 0;
    while let Some(_) = pair.client.next_packet(pair.time).unwrap() {
        dropped += 1;
    }
    assert!(dropped > 0);
    assert!(pair.client.bytes_in_flight() > 0);

    // The loss detection timer recovers the data.
    pair.fire_loss_timer(Side::Client);
    pair.drive();

    assert!(pair.server.session().events.contains(&Event::StreamData {
        id,
        offset: 0,
        fin: true,
        data: b"irreplaceable".to_vec(),
    }));
    assert!(pair.client.session().events.contains(&Event::AckedStream {
        id,
        offset: 0,
        len: 13,
    }));
    assert_eq!(pair.client.bytes_in_flight(), 0);
}

#[test]
fn flow_control_stall_and_release() {
    let mut server_config = Pair::default_config();
    server_config.receive_window = 100;
    server_config.stream_receive_window = 1000;
    let mut pair = Pair::new(Pair::default_config(), server_config);
    pair.handshake();

    let id = pair.client.open(Directionality::Bi).unwrap();
    assert_eq!(pair.client.write(id, &[0x42; 200]).unwrap(), 100);
    // The connection-level window is exhausted.
    assert_matches!(pair.client.write(id, &[0x42; 1]), Err(WriteError::Blocked));
    pair.drive();

    // Delivery freed the window, so fresh credit was advertised.
    assert_eq!(pair.client.write(id, &[0x43; 1]).unwrap(), 1);
    pair.drive();
    let total: u64 = pair
        .server
        .session()
        .events
        .iter()
        .filter_map(|e| match *e {
            Event::StreamData { id: x, ref data, .. } if x == id => Some(data.len() as u64),
            _ => None,
        })
        .sum();
    assert_eq!(total, 101);
}

#[test]
fn retry_rebinds_cids_and_token() {
    let mut pair = Pair::basic();

    // Swallow the client's first flight, standing in for a server that
    // demands address validation.
    let first_flight = pair.client.next_packet(pair.time).unwrap().unwrap();
    assert!(first_flight.len() >= ::MIN_INITIAL_SIZE);
    while let Some(_) = pair.client.next_packet(pair.time).unwrap() {}

    let new_scid = ConnectionId::new(&[0x44; 8]);
    let token = b"validation-token";
    let mut retry = Vec::new();
    packet::write_retry(
        &pair.client.local_id(),
        &new_scid,
        &pair.client_dcid,
        token,
        &mut retry,
    );
    pair.client
        .recv(pair.time, addr(7000), BytesMut::from(&retry[..]))
        .unwrap();
    assert!(pair.client.session().events.contains(&Event::Retry));
    assert_eq!(pair.client.remote_id(), new_scid);

    // The resubmitted Initial must target the retry CID and carry the token.
    let datagram = pair.client.next_packet(pair.time).unwrap().unwrap();
    let decode = packet::PartialDecode::new(BytesMut::from(&datagram[..]), 8).unwrap();
    assert!(decode.is_initial());
    assert_eq!(&decode.dst_cid()[..], &new_scid[..]);
    let rx = initial_keys(&new_scid, Side::Server).rx;
    let (parsed, _) = decode
        .finish(|sample, pn| {
            for (i, byte) in pn.iter_mut().enumerate() {
                *byte ^= rx.pn[i % rx.pn.len()] ^ sample[i % sample.len()];
            }
            Ok(())
        })
        .unwrap();
    match parsed.header {
        packet::Header::Initial { token: ref t, .. } => {
            assert_eq!(&t[..], &token[..]);
        }
        ref x => panic!("expected initial, got {:?}", x),
    }
}

#[test]
fn retry_handshake_checks_original_cid() {
    let mut pair = Pair::basic();
    let client_dcid = pair.client_dcid;

    while let Some(_) = pair.client.next_packet(pair.time).unwrap() {}
    let new_scid = ConnectionId::new(&[0x44; 8]);
    let mut retry = Vec::new();
    packet::write_retry(
        &pair.client.local_id(),
        &new_scid,
        &client_dcid,
        b"tok",
        &mut retry,
    );
    pair.client
        .recv(pair.time, addr(7000), BytesMut::from(&retry[..]))
        .unwrap();

    // Rebuild the server side the way a host that issued the Retry would:
    // fresh connection under the new CID, advertising the original DCID.
    let mut server_config = Pair::default_config();
    server_config.local_cid_len = 8;
    let server_config = Arc::new(server_config);
    let mut server_params = TransportParameters::new(&server_config);
    server_params.original_connection_id = Some(client_dcid);
    let session = TestSession::new(Side::Server, server_params);
    pair.server = Connection::new_server(logger(), server_config, session, new_scid, addr(7000));

    pair.drive();
    assert!(pair.client.is_established());
    assert!(pair.server.is_established());
}

#[test]
fn stateless_reset_drains_connection() {
    let token = [0x3d; RESET_TOKEN_SIZE];
    let mut server_config = Pair::default_config();
    server_config.stateless_reset_token = Some(token);
    let mut pair = Pair::new(Pair::default_config(), server_config);
    pair.handshake();

    let mut reset = Vec::new();
    packet::write_stateless_reset(&mut ::rand::thread_rng(), &token, 40, &mut reset);
    pair.client
        .recv(pair.time, addr(7000), BytesMut::from(&reset[..]))
        .unwrap();

    assert!(pair.client.is_draining());
    assert!(pair
        .client
        .session()
        .events
        .contains(&Event::StatelessReset));
    assert_matches!(pair.client.next_packet(pair.time), Ok(None));
}

#[test]
fn version_negotiation_without_our_version_fails() {
    let mut pair = Pair::basic();
    while let Some(_) = pair.client.next_packet(pair.time).unwrap() {}

    let mut vn = Vec::new();
    packet::write_version_negotiation(
        0x2a,
        &pair.client.local_id(),
        &ConnectionId::new(&[9; 8]),
        &[0xff00_0001],
        &mut vn,
    );
    let err = pair
        .client
        .recv(pair.time, addr(7000), BytesMut::from(&vn[..]))
        .unwrap_err();
    assert_eq!(err, Error::RecvVersionNegotiation);
    assert!(pair.client.is_draining());
    assert!(pair.client.session().events.iter().any(|e| match *e {
        Event::VersionNegotiation(ref v) => v.contains(&0xff00_0001),
        _ => false,
    }));
}

#[test]
fn version_negotiation_listing_our_version_is_ignored() {
    let mut pair = Pair::basic();

    let mut vn = Vec::new();
    packet::write_version_negotiation(
        0x2a,
        &pair.client.local_id(),
        &ConnectionId::new(&[9; 8]),
        &[VERSION],
        &mut vn,
    );
    pair.client
        .recv(pair.time, addr(7000), BytesMut::from(&vn[..]))
        .unwrap();
    assert!(pair.client.is_handshaking());
    pair.drive();
    assert!(pair.client.is_established());
}

#[test]
fn close_and_drain() {
    let mut pair = Pair::basic();
    pair.handshake();

    pair.client
        .close(pair.time, 7, Bytes::from(&b"goodbye"[..]));
    assert!(pair.client.is_closing());
    let close = pair.client.next_packet(pair.time).unwrap().unwrap();
    pair.server
        .recv(pair.time, addr(4433), BytesMut::from(&close[..]))
        .unwrap();
    assert!(pair.server.is_draining());
    // A draining endpoint emits nothing further.
    assert_matches!(pair.server.next_packet(pair.time), Ok(None));

    // The close timer retires the connection entirely.
    let expiry = pair.client.timer_expiry(Timer::Close).unwrap();
    pair.client.handle_timeout(expiry, Timer::Close);
    assert!(pair.client.is_drained());
}

#[test]
fn idle_timeout_drains() {
    let mut pair = Pair::basic();
    pair.handshake();
    let expiry = pair.client.timer_expiry(Timer::Idle).unwrap();
    pair.client.handle_timeout(expiry, Timer::Idle);
    assert!(pair.client.is_draining());
}

#[test]
fn reset_aborts_stream() {
    let mut pair = Pair::basic();
    pair.handshake();

    let id = pair.client.open(Directionality::Uni).unwrap();
    pair.client.write(id, b"partial").unwrap();
    pair.drive();

    // Code 0 is the reserved STOPPING sentinel.
    assert_matches!(pair.client.reset(id, 0), Err(Error::InvalidArgument));
    pair.client.reset(id, 9).unwrap();
    pair.drive();

    // The receive half was the stream's only half, so the reset retires it.
    assert!(pair
        .server
        .session()
        .events
        .iter()
        .any(|e| *e == Event::StreamClose(id, 9)));
}

#[test]
fn stop_sending_elicits_reset() {
    let mut pair = Pair::basic();
    pair.handshake();

    let id = pair.client.open(Directionality::Uni).unwrap();
    pair.client.write(id, b"unwanted").unwrap();
    pair.drive();

    pair.server.stop_sending(id, 5).unwrap();
    pair.drive();

    // The sender answers with RST_STREAM carrying the STOPPING code, which
    // completes the stream on the receiver.
    assert!(pair
        .server
        .session()
        .events
        .iter()
        .any(|e| *e == Event::StreamClose(id, 0)));
    assert_matches!(
        pair.client.write(id, b"more"),
        Err(WriteError::Stopped { error_code: 5 })
    );
}

#[test]
fn path_challenge_is_echoed_exactly() {
    let mut pair = Pair::basic();
    pair.handshake();

    pair.client.validate_path(pair.time);
    pair.drive();
    assert!(pair.client.path_validated());
}

#[test]
fn stream_id_budget_enforced() {
    let mut server_config = Pair::default_config();
    server_config.max_remote_bi_streams = 1;
    let mut pair = Pair::new(Pair::default_config(), server_config);
    pair.handshake();

    assert_matches!(pair.client.open(Directionality::Bi), Ok(StreamId(0)));
    assert_matches!(
        pair.client.open(Directionality::Bi),
        Err(Error::StreamIdBlocked)
    );
}

#[test]
fn large_transfer_respects_order() {
    let mut pair = Pair::basic();
    pair.handshake();

    let id = pair.client.open(Directionality::Bi).unwrap();
    let payload: Vec<u8> = (0..20_000u32).map(|i| i as u8).collect();
    let mut written = 0;
    while written < payload.len() {
        match pair.client.write(id, &payload[written..]) {
            Ok(n) => {
                written += n;
                pair.drive();
            }
            Err(WriteError::Blocked) => {
                pair.drive();
            }
            Err(e) => panic!("write failed: {}", e),
        }
    }
    pair.client.finish(id).unwrap();
    pair.drive();

    let mut received = Vec::new();
    let mut expected_offset = 0;
    for event in &pair.server.session().events {
        if let Event::StreamData {
            id: x,
            offset,
            ref data,
            ..
        } = *event
        {
            if x == id {
                assert_eq!(offset, expected_offset);
                expected_offset += data.len() as u64;
                received.extend_from_slice(data);
            }
        }
    }
    assert_eq!(received, payload);
}
