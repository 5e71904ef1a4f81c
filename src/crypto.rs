//! The host collaborator interface.
//!
//! The library owns no cryptography: the TLS stack, the AEAD, and the packet
//! number cipher all live behind [`Session`]. Key material produced by the
//! TLS stack is installed into the connection and handed back to the seal
//! and open callbacks alongside each packet, so the callbacks themselves
//! stay stateless with respect to key selection.

use slog;

use packet::ConnectionId;
use transport_parameters::TransportParameters;
use {Error, StreamId};

/// Salt for deriving Initial secrets from the client's first destination
/// CID, fixed by the draft.
pub const INITIAL_SALT: [u8; 20] = [
    0x9c, 0x10, 0x8f, 0x98, 0x52, 0x0a, 0x5c, 0x5c, 0x32, 0x96, 0x8e, 0x95, 0x0e, 0x8a, 0x2c,
    0x5f, 0xe0, 0x6d, 0x6c, 0x38,
];

/// The protection context a packet was sent under.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EncryptionLevel {
    Initial,
    Handshake,
    ZeroRtt,
    OneRtt,
}

impl EncryptionLevel {
    /// Whether the level is protected by handshake-derived rather than
    /// application keys, selecting the `in_*` callback family.
    pub fn is_handshake(self) -> bool {
        match self {
            EncryptionLevel::Initial | EncryptionLevel::Handshake => true,
            EncryptionLevel::ZeroRtt | EncryptionLevel::OneRtt => false,
        }
    }
}

impl slog::Value for EncryptionLevel {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{:?}", self))
    }
}

/// Key material for one direction at one encryption level.
#[derive(Clone)]
pub struct Keys {
    /// AEAD key.
    pub key: Vec<u8>,
    /// AEAD IV; combined with the packet number to form each nonce.
    pub iv: Vec<u8>,
    /// Packet number protection key.
    pub pn: Vec<u8>,
}

impl ::std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        // Key material stays out of logs.
        f.write_str("Keys { .. }")
    }
}

/// Both directions of key material for one encryption level.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub tx: Keys,
    pub rx: Keys,
}

/// Compute the AEAD nonce for a packet number: the IV XORed with the
/// left-padded packet number.
pub fn nonce_for(packet_number: u64, iv: &[u8]) -> Vec<u8> {
    let mut nonce = iv.to_vec();
    let len = nonce.len();
    for i in 0..8 {
        nonce[len - 1 - i] ^= (packet_number >> (8 * i)) as u8;
    }
    nonce
}

/// What a requested random value will be used for.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RandContext {
    None,
    PathChallenge,
}

/// Application-facing connection callbacks.
///
/// The connection invokes these synchronously from within its public
/// operations; implementations must not call back into the connection. Any
/// `Err` tears the connection down with `Error::CallbackFailure`.
pub trait ConnectionHandler {
    /// A stream was opened by the peer. Fired exactly once per stream,
    /// before any data for it is delivered.
    fn stream_open(&mut self, id: StreamId) -> Result<(), Error> {
        let _ = id;
        Ok(())
    }

    /// A stream was fully closed and its state is being released.
    fn stream_close(&mut self, id: StreamId, app_error_code: u16) -> Result<(), Error> {
        let _ = (id, app_error_code);
        Ok(())
    }

    /// Ordered stream data. Offsets are strictly increasing per stream and
    /// gap-free; `fin` accompanies the final contiguous bytes.
    fn recv_stream_data(
        &mut self,
        id: StreamId,
        offset: u64,
        fin: bool,
        data: &[u8],
    ) -> Result<(), Error> {
        let _ = (id, offset, fin, data);
        Ok(())
    }

    /// The peer acknowledged stream bytes `[offset, offset + len)`; buffers
    /// backing them may be released. Offsets are strictly increasing per
    /// stream.
    fn acked_stream_data_offset(
        &mut self,
        id: StreamId,
        offset: u64,
        len: u64,
    ) -> Result<(), Error> {
        let _ = (id, offset, len);
        Ok(())
    }

    /// Same as `acked_stream_data_offset` for an encryption level's
    /// handshake byte stream.
    fn acked_crypto_offset(
        &mut self,
        level: EncryptionLevel,
        offset: u64,
        len: u64,
    ) -> Result<(), Error> {
        let _ = (level, offset, len);
        Ok(())
    }

    /// The handshake finished. Fired exactly once.
    fn handshake_completed(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// The peer raised our stream budget; streams up to and including `id`
    /// may now be opened.
    fn extend_max_stream_id(&mut self, id: StreamId) -> Result<(), Error> {
        let _ = id;
        Ok(())
    }

    /// A Version Negotiation packet arrived and none of `versions` is ours.
    /// The connection is unusable afterwards.
    fn recv_version_negotiation(&mut self, versions: &[u32]) -> Result<(), Error> {
        let _ = versions;
        Ok(())
    }

    /// A Retry arrived. The connection rewinds its Initial state and
    /// resubmits the first flight with the server's token automatically.
    fn recv_retry(&mut self, src_cid: &ConnectionId) -> Result<(), Error> {
        let _ = src_cid;
        Ok(())
    }

    /// A stateless reset matching the peer's advertised token arrived; the
    /// connection is draining.
    fn recv_stateless_reset(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// The TLS and packet-protection collaborator.
///
/// Handshake bytes flow in via `recv_crypto_data`, strictly in order per
/// encryption level, and out via `write_crypto_data`. Fresh key material is
/// surfaced through `take_keys` and installed by the connection one-shot
/// per level. The same re-entrancy rule as [`ConnectionHandler`] applies.
pub trait Session: ConnectionHandler {
    /// Produce Initial keys on the client from the chosen destination CID.
    /// Invoked at connection setup and again after a Retry; the first
    /// flight must be queued for `write_crypto_data` as a side effect.
    fn client_initial(&mut self, dst_cid: &ConnectionId) -> Result<KeyPair, Error>;

    /// Produce Initial keys on the server from the client's destination CID.
    fn recv_client_initial(&mut self, dst_cid: &ConnectionId) -> Result<KeyPair, Error>;

    /// Consume ordered handshake bytes received at `level`.
    ///
    /// A TLS-reported failure is surfaced as `Error::Crypto`.
    fn recv_crypto_data(&mut self, level: EncryptionLevel, data: &[u8]) -> Result<(), Error>;

    /// Append handshake bytes awaiting transmission at `level` to `buf`.
    fn write_crypto_data(&mut self, level: EncryptionLevel, buf: &mut Vec<u8>)
        -> Result<(), Error>;

    /// Key material that became available since the last call, if any.
    fn take_keys(&mut self) -> Option<(EncryptionLevel, KeyPair)>;

    /// Whether the TLS handshake is still in progress.
    fn is_handshaking(&self) -> bool;

    /// The peer's transport parameters, once the TLS extension carrying
    /// them has been processed.
    fn transport_parameters(&self) -> Result<Option<TransportParameters>, Error>;

    /// AEAD tag length, added to every sealed payload.
    fn aead_overhead(&self) -> usize;

    /// Seal `plaintext` under handshake-level keys, appending ciphertext
    /// and tag to `out`.
    fn in_encrypt(
        &mut self,
        out: &mut Vec<u8>,
        plaintext: &[u8],
        key: &[u8],
        nonce: &[u8],
        ad: &[u8],
    ) -> Result<(), Error>;

    /// Open a handshake-level payload, appending the plaintext to `out`.
    /// Authentication failure is `Error::TlsDecrypt`.
    fn in_decrypt(
        &mut self,
        out: &mut Vec<u8>,
        ciphertext: &[u8],
        key: &[u8],
        nonce: &[u8],
        ad: &[u8],
    ) -> Result<(), Error>;

    /// Seal an application-level (0-RTT or 1-RTT) payload.
    fn encrypt(
        &mut self,
        out: &mut Vec<u8>,
        plaintext: &[u8],
        key: &[u8],
        nonce: &[u8],
        ad: &[u8],
    ) -> Result<(), Error>;

    /// Open an application-level payload.
    fn decrypt(
        &mut self,
        out: &mut Vec<u8>,
        ciphertext: &[u8],
        key: &[u8],
        nonce: &[u8],
        ad: &[u8],
    ) -> Result<(), Error>;

    /// Apply the packet number cipher in place under handshake-level keys.
    ///
    /// The cipher is a keystream XOR, so the one operation serves both
    /// protect and unprotect, and a prefix of the output is valid even when
    /// fewer bytes than sampled turn out to be packet number.
    fn in_encrypt_pn(&mut self, pn: &mut [u8], key: &[u8], sample: &[u8]) -> Result<(), Error>;

    /// Apply the packet number cipher in place under application keys.
    fn encrypt_pn(&mut self, pn: &mut [u8], key: &[u8], sample: &[u8]) -> Result<(), Error>;

    /// Fill `dest` with random bytes.
    fn rand(&mut self, dest: &mut [u8], context: RandContext) -> Result<(), Error>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nonce_is_iv_xor_pn() {
        let iv = [0x10u8; 12];
        let nonce = nonce_for(0x0102, &iv);
        assert_eq!(nonce.len(), 12);
        assert_eq!(&nonce[..10], &iv[..10]);
        assert_eq!(nonce[10], 0x10 ^ 0x01);
        assert_eq!(nonce[11], 0x10 ^ 0x02);
    }
}
