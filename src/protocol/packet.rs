//! Encrypted, sequenced datagram framing for the audio channel.
//!
//! ```text
//! [nonce: 16 bytes][ciphertext: payload_size bytes]
//! nonce[0]      packet type marker (0x01)
//! nonce[2..4)   payload size, big endian
//! nonce[12..16) sequence number, big endian
//! ```
//! The nonce doubles as the AES-128-CTR counter block.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use thiserror::Error;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

pub const NONCE_SIZE: usize = 16;
pub const KEY_SIZE: usize = 16;
pub const AUDIO_PACKET_TYPE: u8 = 0x01;

const LENGTH_RANGE: std::ops::Range<usize> = 2..4;
const SEQUENCE_RANGE: std::ops::Range<usize> = 12..16;

#[derive(Debug, Error, PartialEq)]
pub enum KeyError {
    /// Key or nonce was not valid hex
    #[error("invalid hex in {field}: {source}")]
    Hex {
        field: &'static str,
        source: hex::FromHexError,
    },
    /// Decoded key or nonce has the wrong size
    #[error("{field} must be {expected} bytes, got {actual}")]
    Length {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// Shorter than the nonce header
    #[error("packet too short: {0} bytes")]
    TooShort(usize),
    /// Leading byte is not the audio marker
    #[error("unexpected packet type 0x{0:02x}")]
    BadType(u8),
    /// Sequence behind the last accepted one
    #[error("stale packet: sequence {sequence} < {remote}")]
    Stale { sequence: u32, remote: u32 },
    /// Sequence implausibly far ahead of the last accepted one
    #[error("sequence {sequence} too far ahead of {remote}")]
    TooFarAhead { sequence: u32, remote: u32 },
    /// Payload too large for the 16-bit length field
    #[error("payload of {0} bytes does not fit a packet")]
    PayloadTooLarge(usize),
    /// Keystream could not be applied
    #[error("decrypt failed")]
    Decrypt,
}

/// Session key material from the server hello.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    key: [u8; KEY_SIZE],
    nonce: [u8; NONCE_SIZE],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

impl SessionKeys {
    pub fn new(key: [u8; KEY_SIZE], nonce: [u8; NONCE_SIZE]) -> Self {
        Self { key, nonce }
    }

    pub fn from_hex(key: &str, nonce: &str) -> Result<Self, KeyError> {
        Ok(Self {
            key: decode_fixed::<KEY_SIZE>("key", key)?,
            nonce: decode_fixed::<NONCE_SIZE>("nonce", nonce)?,
        })
    }
}

fn decode_fixed<const N: usize>(field: &'static str, text: &str) -> Result<[u8; N], KeyError> {
    let bytes = hex::decode(text).map_err(|source| KeyError::Hex { field, source })?;
    bytes.try_into().map_err(|b: Vec<u8>| KeyError::Length {
        field,
        expected: N,
        actual: b.len(),
    })
}

/// Sender half: owns `local_sequence`.
pub struct PacketSealer {
    keys: SessionKeys,
    local_sequence: u32,
}

impl PacketSealer {
    pub fn new(keys: SessionKeys) -> Self {
        Self {
            keys,
            local_sequence: 0,
        }
    }

    pub fn local_sequence(&self) -> u32 {
        self.local_sequence
    }

    pub fn seal(&mut self, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
        let size = u16::try_from(payload.len())
            .map_err(|_| PacketError::PayloadTooLarge(payload.len()))?;
        self.local_sequence = self.local_sequence.wrapping_add(1);

        let mut nonce = self.keys.nonce;
        nonce[LENGTH_RANGE].copy_from_slice(&size.to_be_bytes());
        nonce[SEQUENCE_RANGE].copy_from_slice(&self.local_sequence.to_be_bytes());

        let mut packet = Vec::with_capacity(NONCE_SIZE + payload.len());
        packet.extend_from_slice(&nonce);
        packet.extend_from_slice(payload);

        let mut cipher = Aes128Ctr::new(&self.keys.key.into(), &nonce.into());
        cipher
            .try_apply_keystream(&mut packet[NONCE_SIZE..])
            .map_err(|_| PacketError::Decrypt)?;
        Ok(packet)
    }
}

/// Receiver half: owns `remote_sequence`, which only moves forward.
pub struct PacketOpener {
    key: [u8; KEY_SIZE],
    remote_sequence: u32,
    max_gap: Option<u32>,
}

impl PacketOpener {
    pub fn new(keys: &SessionKeys, max_gap: Option<u32>) -> Self {
        Self {
            key: keys.key,
            remote_sequence: 0,
            max_gap,
        }
    }

    pub fn remote_sequence(&self) -> u32 {
        self.remote_sequence
    }

    /// Validate and decrypt one datagram. Any error leaves the opener untouched.
    pub fn open(&mut self, packet: &[u8]) -> Result<Vec<u8>, PacketError> {
        let nonce: [u8; NONCE_SIZE] = packet
            .get(..NONCE_SIZE)
            .and_then(|n| n.try_into().ok())
            .ok_or(PacketError::TooShort(packet.len()))?;
        if nonce[0] != AUDIO_PACKET_TYPE {
            return Err(PacketError::BadType(nonce[0]));
        }

        let mut seq = [0u8; 4];
        seq.copy_from_slice(&nonce[SEQUENCE_RANGE]);
        let sequence = u32::from_be_bytes(seq);
        let remote = self.remote_sequence;

        if sequence < remote {
            return Err(PacketError::Stale { sequence, remote });
        }
        if let Some(max_gap) = self.max_gap {
            if sequence - remote > max_gap {
                return Err(PacketError::TooFarAhead { sequence, remote });
            }
        }
        if sequence != remote.wrapping_add(1) {
            log::warn!("Received audio packet with wrong sequence: {sequence}, expected: {}", remote.wrapping_add(1));
        }

        let mut payload = packet[NONCE_SIZE..].to_vec();
        let mut cipher = Aes128Ctr::new(&self.key.into(), &nonce.into());
        cipher
            .try_apply_keystream(&mut payload)
            .map_err(|_| PacketError::Decrypt)?;

        self.remote_sequence = sequence;
        Ok(payload)
    }
}
