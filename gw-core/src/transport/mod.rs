//! Inter-MCU binary transport: UART frame parsing and the OTA streaming
//! protocol between the network co-processor and the display co-processor.
//!
//! Grounded on `Stm32Serial.cpp`'s receive state machine and
//! `ecoflow_protocol.c`'s frame CRC, and on `OtaManager.cpp`'s
//! start/chunk/end/apply sequencing.

pub mod ota;

use crate::codec::crc::crc8_inter_mcu;

pub use ota::{ChunkOutcome, OtaError, OtaProgress, OtaSession, OtaState, OtaStep};

const START_BYTE: u8 = 0xAA;
const MAX_PAYLOAD_LEN: usize = 250;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("inter-MCU frame length {0} exceeds the 250-byte maximum")]
    PayloadTooLarge(usize),

    #[error("CRC-8 mismatch: expected {expected:#04x}, got {actual:#04x}")]
    CrcMismatch { expected: u8, actual: u8 },
}

/// One inter-MCU frame: `0xAA | command | length | payload | crc8`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterMcuFrame {
    pub command: u8,
    pub payload: Vec<u8>,
}

impl InterMcuFrame {
    pub fn new(command: u8, payload: Vec<u8>) -> Result<Self, TransportError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(TransportError::PayloadTooLarge(payload.len()));
        }
        Ok(InterMcuFrame { command, payload })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + self.payload.len() + 1);
        out.push(START_BYTE);
        out.push(self.command);
        out.push(self.payload.len() as u8);
        out.extend_from_slice(&self.payload);
        let crc = crc8_inter_mcu(&out[1..]);
        out.push(crc);
        out
    }
}

/// States of the byte-at-a-time receiver described in the source design:
/// any byte arriving outside the expected state resyncs to `SeekingStart`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiveState {
    SeekingStart,
    GotStart,
    GotCommand { command: u8 },
    GotLength { command: u8, length: u8 },
    Accumulating { command: u8, length: u8 },
}

/// Byte-at-a-time inter-MCU frame receiver.
pub struct FrameReceiver {
    state: ReceiveState,
    payload: Vec<u8>,
}

impl Default for FrameReceiver {
    fn default() -> Self {
        FrameReceiver { state: ReceiveState::SeekingStart, payload: Vec::new() }
    }
}

impl FrameReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one byte. Returns `Some(frame)` once a complete, CRC-valid
    /// frame has been accumulated; on CRC mismatch the frame is discarded
    /// and the receiver resyncs, returning `None`.
    pub fn push_byte(&mut self, byte: u8) -> Option<InterMcuFrame> {
        match self.state {
            ReceiveState::SeekingStart => {
                if byte == START_BYTE {
                    self.state = ReceiveState::GotStart;
                }
                None
            }
            ReceiveState::GotStart => {
                self.state = ReceiveState::GotCommand { command: byte };
                None
            }
            ReceiveState::GotCommand { command } => {
                self.state = ReceiveState::GotLength { command, length: byte };
                None
            }
            ReceiveState::GotLength { command, length } => {
                self.payload.clear();
                if length == 0 {
                    self.state = ReceiveState::Accumulating { command, length };
                    self.check_crc(byte, command, length)
                } else {
                    self.payload.push(byte);
                    self.state = ReceiveState::Accumulating { command, length };
                    None
                }
            }
            ReceiveState::Accumulating { command, length } => {
                if self.payload.len() < length as usize {
                    self.payload.push(byte);
                    None
                } else {
                    self.check_crc(byte, command, length)
                }
            }
        }
    }

    fn check_crc(&mut self, crc_byte: u8, command: u8, length: u8) -> Option<InterMcuFrame> {
        let mut body = Vec::with_capacity(2 + self.payload.len());
        body.push(command);
        body.push(length);
        body.extend_from_slice(&self.payload);
        let expected = crc8_inter_mcu(&body);
        self.state = ReceiveState::SeekingStart;
        if expected == crc_byte {
            Some(InterMcuFrame { command, payload: std::mem::take(&mut self.payload) })
        } else {
            self.payload.clear();
            None
        }
    }
}
