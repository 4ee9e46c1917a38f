//! Turns an arbitrary-length stream of BLE notification chunks into
//! complete, decrypted inner packets.
//!
//! Grounded on `EcoflowProtocol.cpp`'s `parsePackets`/`parseSimple`: a
//! sliding byte buffer that resyncs one byte at a time on any CRC or
//! preamble mismatch, rather than requiring notification boundaries to
//! line up with frame boundaries.

use crate::codec::{CodecError, InnerPacket, OuterFrame};
use crate::crypto::{aes_cbc_decrypt, CryptoError};

/// Errors a caller might want to distinguish from "keep feeding more bytes".
#[derive(Debug, thiserror::Error)]
pub enum ReassemblyError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// The session key material needed to decrypt a completed outer frame.
pub struct DecryptKey<'a> {
    pub key: &'a [u8; 16],
    pub iv: &'a [u8; 16],
}

/// A sliding-window byte buffer that accumulates radio notification chunks
/// and yields completed, decrypted inner packets.
///
/// One instance per session; reassembly state is never shared across
/// sessions.
#[derive(Default)]
pub struct ReassemblyBuffer {
    buf: Vec<u8>,
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk as it arrives from the radio notification path.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Drains as many complete inner packets as the buffer currently holds.
    ///
    /// `key` is `None` during the pre-authenticated handshake, where the
    /// outer-frame payload is plaintext and is returned as-is (the
    /// handshake-only path from the original spec's simplified parser).
    /// `xor_deobfuscate` should be set for V3 battery-variant traffic.
    pub fn drain_packets(
        &mut self,
        key: Option<DecryptKey<'_>>,
        xor_deobfuscate: bool,
    ) -> Vec<Result<InnerPacket, ReassemblyError>> {
        let mut out = Vec::new();
        loop {
            if self.buf.len() < 8 {
                break;
            }
            if self.buf[0] != 0x5A || self.buf[1] != 0x5A {
                self.buf.remove(0);
                continue;
            }
            let Some(total_len) = OuterFrame::declared_total_len(&self.buf) else {
                break;
            };
            if self.buf.len() < total_len {
                break;
            }

            match OuterFrame::decode(&self.buf[..total_len]) {
                Ok(frame) => {
                    self.buf.drain(..total_len);
                    out.push(self.resolve_frame(frame, &key, xor_deobfuscate));
                }
                Err(_) => {
                    self.buf.remove(0);
                }
            }
        }
        out
    }

    fn resolve_frame(
        &self,
        frame: OuterFrame,
        key: &Option<DecryptKey<'_>>,
        xor_deobfuscate: bool,
    ) -> Result<InnerPacket, ReassemblyError> {
        let inner_bytes = match key {
            Some(DecryptKey { key, iv }) => aes_cbc_decrypt(key, iv, &frame.payload)?,
            None => frame.payload,
        };
        Ok(InnerPacket::decode(&inner_bytes, xor_deobfuscate)?)
    }
}
