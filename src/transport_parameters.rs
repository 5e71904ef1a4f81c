use bytes::{Buf, BufMut, Bytes};

use coding::{BufExt, BufMutExt, UnexpectedEnd};
use config::Config;
use packet::ConnectionId;
use {Side, TransportError, MAX_CID_SIZE, MIN_CID_SIZE, RESET_TOKEN_SIZE, VERSION};

// Parameter ids from the quic_transport_parameters extension (0xffa5).
const PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u16 = 0x00;
const PARAM_INITIAL_MAX_DATA: u16 = 0x01;
const PARAM_INITIAL_MAX_BIDI_STREAMS: u16 = 0x02;
const PARAM_IDLE_TIMEOUT: u16 = 0x03;
const PARAM_PREFERRED_ADDRESS: u16 = 0x04;
const PARAM_MAX_PACKET_SIZE: u16 = 0x05;
const PARAM_STATELESS_RESET_TOKEN: u16 = 0x06;
const PARAM_ACK_DELAY_EXPONENT: u16 = 0x07;
const PARAM_INITIAL_MAX_UNI_STREAMS: u16 = 0x08;
const PARAM_DISABLE_MIGRATION: u16 = 0x09;
const PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u16 = 0x0a;
const PARAM_INITIAL_MAX_STREAM_DATA_UNI: u16 = 0x0b;
const PARAM_MAX_ACK_DELAY: u16 = 0x0c;
const PARAM_ORIGINAL_CONNECTION_ID: u16 = 0x0d;

/// Transport parameters used to negotiate connection-level limits with the
/// peer.
///
/// Clients carry these in the ClientHello alongside their initial version;
/// servers answer in EncryptedExtensions with the negotiated version and the
/// list of versions they support.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TransportParameters {
    pub initial_max_stream_data_bidi_local: u32,
    pub initial_max_stream_data_bidi_remote: u32,
    pub initial_max_stream_data_uni: u32,
    pub initial_max_data: u32,
    pub initial_max_bidi_streams: u16,
    pub initial_max_uni_streams: u16,
    /// Seconds. Zero disables the idle timer.
    pub idle_timeout: u16,
    pub max_packet_size: u16,
    pub ack_delay_exponent: u8,
    /// Milliseconds.
    pub max_ack_delay: u8,
    pub disable_migration: bool,
    pub stateless_reset_token: Option<[u8; RESET_TOKEN_SIZE]>,
    /// Mandatory from a server whose client answered a Retry; echoes the
    /// client's very first destination CID.
    pub original_connection_id: Option<ConnectionId>,
    /// Opaque server preferred-address blob, preserved but not interpreted.
    pub preferred_address: Option<Bytes>,
}

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_data: 0,
            initial_max_bidi_streams: 0,
            initial_max_uni_streams: 0,
            idle_timeout: 0,
            max_packet_size: ::MAX_PKT_SIZE,
            ack_delay_exponent: 3,
            max_ack_delay: 25,
            disable_migration: false,
            stateless_reset_token: None,
            original_connection_id: None,
            preferred_address: None,
        }
    }
}

impl TransportParameters {
    pub fn new(config: &Config) -> Self {
        TransportParameters {
            initial_max_stream_data_bidi_local: config.stream_receive_window,
            initial_max_stream_data_bidi_remote: config.stream_receive_window,
            initial_max_stream_data_uni: config.stream_receive_window,
            initial_max_data: config.receive_window,
            initial_max_bidi_streams: config.max_remote_bi_streams,
            initial_max_uni_streams: config.max_remote_uni_streams,
            idle_timeout: config.idle_timeout,
            max_packet_size: config.max_packet_size,
            ack_delay_exponent: config.ack_delay_exponent,
            ..Self::default()
        }
    }

    /// Encode for transmission by `side`.
    pub fn write<W: BufMut>(&self, side: Side, w: &mut W) {
        match side {
            Side::Client => {
                w.write::<u32>(VERSION); // initial version
            }
            Side::Server => {
                w.write::<u32>(VERSION); // negotiated version
                w.write::<u8>(4); // length of supported versions
                w.write::<u32>(VERSION);
            }
        }

        let mut buf = Vec::new();
        macro_rules! param {
            ($id:expr, $ty:ty, $value:expr) => {{
                buf.write::<u16>($id);
                buf.write::<u16>(::std::mem::size_of::<$ty>() as u16);
                buf.write::<$ty>($value);
            }};
        }
        param!(
            PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
            u32,
            self.initial_max_stream_data_bidi_local
        );
        param!(PARAM_INITIAL_MAX_DATA, u32, self.initial_max_data);
        param!(
            PARAM_INITIAL_MAX_BIDI_STREAMS,
            u16,
            self.initial_max_bidi_streams
        );
        param!(PARAM_IDLE_TIMEOUT, u16, self.idle_timeout);
        if let Some(ref x) = self.preferred_address {
            buf.write::<u16>(PARAM_PREFERRED_ADDRESS);
            buf.write::<u16>(x.len() as u16);
            buf.extend_from_slice(x);
        }
        param!(PARAM_MAX_PACKET_SIZE, u16, self.max_packet_size);
        if let Some(ref token) = self.stateless_reset_token {
            buf.write::<u16>(PARAM_STATELESS_RESET_TOKEN);
            buf.write::<u16>(RESET_TOKEN_SIZE as u16);
            buf.extend_from_slice(token);
        }
        param!(PARAM_ACK_DELAY_EXPONENT, u8, self.ack_delay_exponent);
        param!(
            PARAM_INITIAL_MAX_UNI_STREAMS,
            u16,
            self.initial_max_uni_streams
        );
        if self.disable_migration {
            buf.write::<u16>(PARAM_DISABLE_MIGRATION);
            buf.write::<u16>(0);
        }
        param!(
            PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
            u32,
            self.initial_max_stream_data_bidi_remote
        );
        param!(
            PARAM_INITIAL_MAX_STREAM_DATA_UNI,
            u32,
            self.initial_max_stream_data_uni
        );
        param!(PARAM_MAX_ACK_DELAY, u8, self.max_ack_delay);
        if let Some(ref cid) = self.original_connection_id {
            buf.write::<u16>(PARAM_ORIGINAL_CONNECTION_ID);
            buf.write::<u16>(cid.len() as u16);
            buf.extend_from_slice(cid);
        }

        w.write::<u16>(buf.len() as u16);
        w.put_slice(&buf);
    }

    /// Decode parameters sent by the peer of `side`.
    pub fn read<R: Buf>(side: Side, r: &mut R) -> Result<Self, Error> {
        match side {
            Side::Server => {
                // We are the server, so the peer's parameters rode in the
                // ClientHello.
                let initial_version = r.get::<u32>()?;
                if initial_version != VERSION {
                    return Err(Error::VersionNegotiation);
                }
            }
            Side::Client => {
                let negotiated = r.get::<u32>()?;
                let versions_len = r.get::<u8>()? as usize;
                if versions_len % 4 != 0 || versions_len == 0 || r.remaining() < versions_len {
                    return Err(Error::Malformed);
                }
                let mut negotiated_listed = false;
                for _ in 0..versions_len / 4 {
                    if r.get::<u32>()? == negotiated {
                        negotiated_listed = true;
                    }
                }
                if negotiated != VERSION || !negotiated_listed {
                    return Err(Error::VersionNegotiation);
                }
            }
        }

        let params_len = r.get::<u16>()? as usize;
        if r.remaining() < params_len {
            return Err(Error::Malformed);
        }

        let mut params = TransportParameters::default();
        // Any parameter may appear at most once.
        let mut got = [false; 14];
        let mut remaining = params_len;
        while remaining > 0 {
            if remaining < 4 {
                return Err(Error::Malformed);
            }
            let id = r.get::<u16>()?;
            let len = r.get::<u16>()? as usize;
            remaining -= 4;
            if len > remaining {
                return Err(Error::Malformed);
            }
            remaining -= len;
            if (id as usize) < got.len() {
                if got[id as usize] {
                    return Err(Error::Malformed);
                }
                got[id as usize] = true;
            }
            macro_rules! value {
                ($ty:ty) => {{
                    if len != ::std::mem::size_of::<$ty>() {
                        return Err(Error::Malformed);
                    }
                    r.get::<$ty>()?
                }};
            }
            match id {
                PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = value!(u32);
                }
                PARAM_INITIAL_MAX_DATA => {
                    params.initial_max_data = value!(u32);
                }
                PARAM_INITIAL_MAX_BIDI_STREAMS => {
                    params.initial_max_bidi_streams = value!(u16);
                }
                PARAM_IDLE_TIMEOUT => {
                    params.idle_timeout = value!(u16);
                }
                PARAM_PREFERRED_ADDRESS => {
                    params.preferred_address = Some(take(r, len)?);
                }
                PARAM_MAX_PACKET_SIZE => {
                    let x = value!(u16);
                    if x < 1200 {
                        return Err(Error::IllegalValue);
                    }
                    params.max_packet_size = x;
                }
                PARAM_STATELESS_RESET_TOKEN => {
                    if len != RESET_TOKEN_SIZE {
                        return Err(Error::Malformed);
                    }
                    let mut token = [0; RESET_TOKEN_SIZE];
                    r.copy_to_slice(&mut token);
                    params.stateless_reset_token = Some(token);
                }
                PARAM_ACK_DELAY_EXPONENT => {
                    let x = value!(u8);
                    if x > 20 {
                        return Err(Error::IllegalValue);
                    }
                    params.ack_delay_exponent = x;
                }
                PARAM_INITIAL_MAX_UNI_STREAMS => {
                    params.initial_max_uni_streams = value!(u16);
                }
                PARAM_DISABLE_MIGRATION => {
                    if len != 0 {
                        return Err(Error::Malformed);
                    }
                    params.disable_migration = true;
                }
                PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = value!(u32);
                }
                PARAM_INITIAL_MAX_STREAM_DATA_UNI => {
                    params.initial_max_stream_data_uni = value!(u32);
                }
                PARAM_MAX_ACK_DELAY => {
                    params.max_ack_delay = value!(u8);
                }
                PARAM_ORIGINAL_CONNECTION_ID => {
                    if len < MIN_CID_SIZE || len > MAX_CID_SIZE {
                        return Err(Error::Malformed);
                    }
                    let mut bytes = [0; MAX_CID_SIZE];
                    r.copy_to_slice(&mut bytes[..len]);
                    params.original_connection_id = Some(ConnectionId::new(&bytes[..len]));
                }
                _ => {
                    // Unknown parameters must be skipped.
                    take(r, len)?;
                }
            }
        }
        Ok(params)
    }
}

fn take<R: Buf>(r: &mut R, len: usize) -> Result<Bytes, UnexpectedEnd> {
    if r.remaining() < len {
        return Err(UnexpectedEnd);
    }
    let mut buf = vec![0; len];
    r.copy_to_slice(&mut buf);
    Ok(buf.into())
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Fail)]
pub enum Error {
    #[fail(display = "version negotiation was tampered with")]
    VersionNegotiation,
    #[fail(display = "parameter had illegal value")]
    IllegalValue,
    #[fail(display = "parameters were malformed")]
    Malformed,
}

impl From<Error> for TransportError {
    fn from(e: Error) -> Self {
        match e {
            Error::VersionNegotiation => TransportError::VERSION_NEGOTIATION_ERROR,
            Error::IllegalValue | Error::Malformed => TransportError::TRANSPORT_PARAMETER_ERROR,
        }
    }
}

impl From<Error> for ::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::VersionNegotiation => ::Error::VersionNegotiation,
            Error::IllegalValue => ::Error::TransportParam,
            Error::Malformed => ::Error::MalformedTransportParam,
        }
    }
}

impl From<UnexpectedEnd> for Error {
    fn from(_: UnexpectedEnd) -> Self {
        Error::Malformed
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    fn sample() -> TransportParameters {
        TransportParameters {
            initial_max_stream_data_bidi_local: 300_000,
            initial_max_stream_data_bidi_remote: 300_000,
            initial_max_stream_data_uni: 100_000,
            initial_max_data: 1_000_000,
            initial_max_bidi_streams: 16,
            initial_max_uni_streams: 8,
            idle_timeout: 30,
            max_packet_size: 1452,
            ack_delay_exponent: 8,
            max_ack_delay: 50,
            disable_migration: true,
            stateless_reset_token: Some([0xab; RESET_TOKEN_SIZE]),
            original_connection_id: Some(ConnectionId::new(&[0x11; 8])),
            preferred_address: None,
        }
    }

    #[test]
    fn roundtrip_server_params() {
        let params = sample();
        let mut buf = Vec::new();
        params.write(Side::Server, &mut buf);
        let decoded = TransportParameters::read(Side::Client, &mut Cursor::new(&buf)).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn roundtrip_client_params() {
        let params = TransportParameters {
            stateless_reset_token: None,
            original_connection_id: None,
            ..sample()
        };
        let mut buf = Vec::new();
        params.write(Side::Client, &mut buf);
        let decoded = TransportParameters::read(Side::Server, &mut Cursor::new(&buf)).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn duplicate_rejected() {
        let mut buf = Vec::new();
        buf.write::<u32>(VERSION);
        buf.write::<u16>(12);
        for _ in 0..2 {
            buf.write::<u16>(PARAM_IDLE_TIMEOUT);
            buf.write::<u16>(2);
            buf.write::<u16>(60);
        }
        assert_eq!(
            TransportParameters::read(Side::Server, &mut Cursor::new(&buf)),
            Err(Error::Malformed)
        );
    }

    #[test]
    fn unknown_id_skipped() {
        let mut buf = Vec::new();
        buf.write::<u32>(VERSION);
        buf.write::<u16>(13);
        buf.write::<u16>(0x7fee); // unrecognized id
        buf.write::<u16>(3);
        buf.put_slice(b"???");
        buf.write::<u16>(PARAM_IDLE_TIMEOUT);
        buf.write::<u16>(2);
        buf.write::<u16>(60);
        let params = TransportParameters::read(Side::Server, &mut Cursor::new(&buf)).unwrap();
        assert_eq!(params.idle_timeout, 60);
    }

    #[test]
    fn truncated_value_rejected() {
        let mut buf = Vec::new();
        buf.write::<u32>(VERSION);
        buf.write::<u16>(5);
        buf.write::<u16>(PARAM_INITIAL_MAX_DATA);
        buf.write::<u16>(4);
        buf.write::<u8>(1); // three bytes short
        assert_eq!(
            TransportParameters::read(Side::Server, &mut Cursor::new(&buf)),
            Err(Error::Malformed)
        );
    }

    #[test]
    fn bad_version_context_rejected() {
        let mut buf = Vec::new();
        buf.write::<u32>(0xdead_beef);
        buf.write::<u16>(0);
        assert_eq!(
            TransportParameters::read(Side::Server, &mut Cursor::new(&buf)),
            Err(Error::VersionNegotiation)
        );
    }
}
