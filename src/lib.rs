//! Protocol state machine for QUIC draft 15.
//!
//! This crate performs no I/O and owns no cryptography. Each `Connection`
//! consumes datagrams and timer expirations supplied by the host, produces
//! datagrams on demand, and reports everything else through the
//! collaborator traits in the `crypto` module. The host is responsible for
//! sockets, the TLS stack, and scheduling the expiry timestamps the
//! connection exposes.

extern crate byteorder;
extern crate bytes;
extern crate constant_time_eq;
#[macro_use]
extern crate failure;
extern crate fnv;
extern crate rand;
#[macro_use]
extern crate slog;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;
#[cfg(test)]
#[macro_use]
extern crate hex_literal;
#[cfg(test)]
extern crate slog_term;

use std::fmt;
use std::ops;

mod assembler;
mod coding;
mod range_set;
mod spaces;
mod stream;

pub mod config;
pub mod connection;
pub mod crypto;
pub mod frame;
pub mod packet;
pub mod path;
pub mod transport_parameters;

#[cfg(test)]
mod tests;

pub use config::Config;
pub use connection::{Connection, Timer};
pub use stream::WriteError;
pub use crypto::{ConnectionHandler, EncryptionLevel, KeyPair, Keys, RandContext, Session};
pub use frame::Frame;
pub use packet::ConnectionId;

/// The QUIC protocol version implemented, draft 15.
pub const VERSION: u32 = 0xff00_000f;

/// Reserved version advertised first in Version Negotiation packets to
/// exercise peers' version handling.
pub const RESERVED_VERSION: u32 = 0x0a1a_2a3a;

/// One second in the nanosecond ticks used for all timestamps and durations.
pub const SECONDS: u64 = 1_000_000_000;
/// One millisecond in ticks.
pub const MILLISECONDS: u64 = 1_000_000;
/// One microsecond in ticks.
pub const MICROSECONDS: u64 = 1_000;

pub const MIN_CID_SIZE: usize = 4;
pub const MAX_CID_SIZE: usize = 18;
pub const RESET_TOKEN_SIZE: usize = 16;

/// Minimum size of a client Initial datagram.
pub const MIN_INITIAL_SIZE: usize = 1200;
/// Conservative datagram budget before the peer's max_packet_size is known.
pub const MIN_MTU: u16 = 1232;
/// Largest payload a peer may advertise via max_packet_size.
pub const MAX_PKT_SIZE: u16 = 65527;

/// Largest usable packet number in any packet number space.
pub const MAX_PACKET_NUMBER: u64 = (1 << 62) - 1;

/// Whether this peer initiated the connection or accepted it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Side {
    Client,
    Server,
}

impl ops::Not for Side {
    type Output = Side;
    fn not(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

impl slog::Value for Side {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{:?}", self))
    }
}

/// Whether a stream carries data in one direction or both.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Directionality {
    /// Data flows in both directions.
    Bi,
    /// Data flows only from the stream's initiator.
    Uni,
}

impl fmt::Display for Directionality {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match *self {
            Directionality::Bi => "bidirectional",
            Directionality::Uni => "unidirectional",
        };
        f.write_str(s)
    }
}

/// Identifier for a stream within a particular connection.
///
/// The low two bits encode the initiating side and the directionality; the
/// remaining bits are a per-class index.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(pub u64);

impl StreamId {
    pub fn new(initiator: Side, directionality: Directionality, index: u64) -> Self {
        let mut id = index << 2;
        if let Side::Server = initiator {
            id |= 0x1;
        }
        if let Directionality::Uni = directionality {
            id |= 0x2;
        }
        StreamId(id)
    }

    /// Which side of the connection initiated the stream.
    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    pub fn directionality(self) -> Directionality {
        if self.0 & 0x2 == 0 {
            Directionality::Bi
        } else {
            Directionality::Uni
        }
    }

    /// Position of the stream within its class.
    pub fn index(self) -> u64 {
        self.0 >> 2
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} stream {}",
            self.initiator(),
            self.directionality(),
            self.index()
        )
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match *self {
            Side::Client => "client",
            Side::Server => "server",
        };
        f.write_str(s)
    }
}

impl slog::Value for StreamId {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{}", self.0))
    }
}

/// Transport-level error code carried by CONNECTION_CLOSE frames.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TransportError(pub u16);

impl From<TransportError> for u16 {
    fn from(x: TransportError) -> u16 {
        x.0
    }
}

macro_rules! transport_errors {
    {$($name:ident($val:expr) $desc:expr;)*} => {
        impl TransportError {
            $(pub const $name: TransportError = TransportError($val);)*
        }

        impl fmt::Display for TransportError {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str($desc),)*
                    x if x >= 0x100 && x < 0x200 => {
                        write!(f, "TLS alert {}", x as u8)
                    }
                    _ => write!(f, "<unknown {:x}>", self.0),
                }
            }
        }
    }
}

transport_errors! {
    NO_ERROR(0x0) "the connection is being closed abruptly in the absence of any error";
    INTERNAL_ERROR(0x1) "the endpoint encountered an internal error and cannot continue with the connection";
    SERVER_BUSY(0x2) "the server is currently busy and does not accept any new connections";
    FLOW_CONTROL_ERROR(0x3) "received more data than permitted in advertised data limits";
    STREAM_ID_ERROR(0x4) "received a frame for a stream identifier that exceeded advertised the stream limit for the corresponding stream type";
    STREAM_STATE_ERROR(0x5) "received a frame for a stream that was not in a state that permitted that frame";
    FINAL_OFFSET_ERROR(0x6) "received a STREAM frame containing data that exceeded the previously established final offset";
    FRAME_ENCODING_ERROR(0x7) "received a frame that was badly formatted";
    TRANSPORT_PARAMETER_ERROR(0x8) "received transport parameters that were badly formatted, included an invalid value, was absent even though it is mandatory, was present though it is forbidden, or is otherwise in error";
    VERSION_NEGOTIATION_ERROR(0x9) "received transport parameters that contradicted version negotiation";
    PROTOCOL_VIOLATION(0xA) "detected an error with protocol compliance that was not covered by more specific error codes";
    UNSOLICITED_PATH_RESPONSE(0xB) "received a PATH_RESPONSE frame that did not correspond to any PATH_CHALLENGE frame that it sent";
    TLS_HANDSHAKE_FAILED(0x201) "the TLS handshake failed";
    TLS_FATAL_ALERT_GENERATED(0x202) "a TLS fatal alert was sent, causing the TLS connection to end prematurely";
    TLS_FATAL_ALERT_RECEIVED(0x203) "a TLS fatal alert was received, causing the TLS connection to end prematurely";
}

impl TransportError {
    /// The code reported when a frame of type `ty` is malformed.
    pub fn frame(_ty: u8) -> Self {
        TransportError::FRAME_ENCODING_ERROR
    }

    /// The code carrying TLS alert `alert`.
    pub fn crypto(alert: u8) -> Self {
        TransportError(0x100 | u16::from(alert))
    }
}

impl slog::Value for TransportError {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{}", self))
    }
}

/// Errors surfaced by library operations.
///
/// Anything for which `is_fatal` returns true tears the connection down;
/// further calls on it are rejected with `InvalidState`.
#[derive(Debug, Clone, Eq, PartialEq, Fail)]
pub enum Error {
    #[fail(display = "invalid argument")]
    InvalidArgument,
    #[fail(display = "output buffer too small")]
    NoBuffer,
    #[fail(display = "unknown packet type")]
    UnknownPacketType,
    #[fail(display = "protocol violation")]
    Proto,
    #[fail(display = "operation not allowed in the current state")]
    InvalidState,
    #[fail(display = "malformed ACK frame")]
    AckFrame,
    #[fail(display = "no stream id available within the peer's limit")]
    StreamIdBlocked,
    #[fail(display = "stream already in use")]
    StreamInUse,
    #[fail(display = "stream write blocked on flow control")]
    StreamDataBlocked,
    #[fail(display = "flow control limits violated")]
    FlowControl,
    #[fail(display = "stream id exceeds advertised limit")]
    StreamId,
    #[fail(display = "final offset violated")]
    FinalOffset,
    #[fail(display = "TLS stack reported failure: alert {}", alert)]
    Crypto { alert: u8 },
    #[fail(display = "packet number space exhausted")]
    PktNumExhausted,
    #[fail(display = "required transport parameter missing")]
    RequiredTransportParam,
    #[fail(display = "malformed transport parameter")]
    MalformedTransportParam,
    #[fail(display = "malformed frame encoding")]
    FrameEncoding,
    #[fail(display = "packet failed decryption")]
    TlsDecrypt,
    #[fail(display = "stream is shut down for writing")]
    StreamShutWr,
    #[fail(display = "stream not found")]
    StreamNotFound,
    #[fail(display = "version negotiation failed")]
    VersionNegotiation,
    #[fail(display = "frame not permitted in the current stream state")]
    StreamState,
    #[fail(display = "no key available at the required encryption level")]
    NoKey,
    #[fail(display = "early data was rejected by the peer")]
    EarlyDataRejected,
    #[fail(display = "received an applicable version negotiation packet")]
    RecvVersionNegotiation,
    #[fail(display = "connection is closing")]
    Closing,
    #[fail(display = "connection is draining")]
    Draining,
    #[fail(display = "invalid transport parameter")]
    TransportParam,
    #[fail(display = "packet was discarded")]
    DiscardPkt,
    /// Allocation failed. Hosts using Rust's default abort-on-failure
    /// allocator never observe this.
    #[fail(display = "out of memory")]
    OutOfMemory,
    #[fail(display = "user callback failed")]
    CallbackFailure,
    #[fail(display = "internal error")]
    Internal,
}

impl Error {
    /// Whether the error leaves the connection unusable.
    pub fn is_fatal(&self) -> bool {
        match *self {
            Error::OutOfMemory
            | Error::CallbackFailure
            | Error::Internal
            | Error::PktNumExhausted => true,
            _ => false,
        }
    }

    /// The QUIC transport error code reported to the peer when this error
    /// closes the connection.
    pub fn transport_error_code(&self) -> TransportError {
        match *self {
            Error::AckFrame | Error::FrameEncoding => TransportError::FRAME_ENCODING_ERROR,
            Error::FlowControl => TransportError::FLOW_CONTROL_ERROR,
            Error::StreamId => TransportError::STREAM_ID_ERROR,
            Error::StreamState => TransportError::STREAM_STATE_ERROR,
            Error::FinalOffset => TransportError::FINAL_OFFSET_ERROR,
            Error::RequiredTransportParam
            | Error::MalformedTransportParam
            | Error::TransportParam => TransportError::TRANSPORT_PARAMETER_ERROR,
            Error::VersionNegotiation => TransportError::VERSION_NEGOTIATION_ERROR,
            Error::Crypto { alert } => TransportError::crypto(alert),
            _ => TransportError::PROTOCOL_VIOLATION,
        }
    }
}

impl From<coding::UnexpectedEnd> for Error {
    fn from(_: coding::UnexpectedEnd) -> Self {
        Error::FrameEncoding
    }
}
