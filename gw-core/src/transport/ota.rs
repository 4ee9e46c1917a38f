//! OTA image streaming: `OTA_START` → N × `OTA_CHUNK` → `OTA_END` →
//! `OTA_APPLY`, each step gated on an ACK/NACK from the display
//! co-processor with its own timeout and retry budget.
//!
//! This module only decides *what to send next* and *how to interpret an
//! ack*; actual timeout waiting and retransmission scheduling lives in the
//! binary crate's inter-MCU task, which is the only place that owns a
//! clock and the UART mutex.

use super::{InterMcuFrame, TransportError};
use crate::codec::crc::crc32_ota;

pub const OTA_START: u8 = 0x60;
pub const OTA_CHUNK: u8 = 0x61;
pub const OTA_END: u8 = 0x62;
pub const OTA_APPLY: u8 = 0x63;

const CHUNK_SIZE: usize = 200;
const MAX_RETRIES: u8 = 3;

#[derive(Debug, thiserror::Error)]
pub enum OtaError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("step {0:?} exhausted its retry budget")]
    RetriesExhausted(OtaStep),

    #[error("receiver NACKed the final image checksum")]
    ChecksumRejected,

    #[error("operation attempted in state {0:?}")]
    WrongState(OtaState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaStep {
    Start,
    Chunk,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaState {
    AwaitingStartAck,
    AwaitingChunkAck,
    AwaitingEndAck,
    Applying,
    Success,
    Failed,
}

/// Bytes streamed vs. total, polled by the (out-of-scope) web UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtaProgress {
    pub bytes_sent: u32,
    pub total_bytes: u32,
}

impl OtaProgress {
    pub fn percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 100;
        }
        ((self.bytes_sent as u64 * 100) / self.total_bytes as u64) as u8
    }
}

/// Drives one OTA transfer of a staged image already held in memory (or
/// mapped from the staging file) by the caller.
pub struct OtaSession {
    total_len: u32,
    offset: u32,
    last_chunk_len: u32,
    state: OtaState,
    retries_used: u8,
}

impl OtaSession {
    /// Begins a new transfer. Returns the session and the first frame to
    /// send (`OTA_START`).
    pub fn begin(total_len: u32) -> (Self, InterMcuFrame) {
        let session = OtaSession { total_len, offset: 0, last_chunk_len: 0, state: OtaState::AwaitingStartAck, retries_used: 0 };
        let frame = InterMcuFrame::new(OTA_START, total_len.to_le_bytes().to_vec()).expect("4-byte payload is well under the frame limit");
        (session, frame)
    }

    pub fn state(&self) -> OtaState {
        self.state
    }

    pub fn progress(&self) -> OtaProgress {
        OtaProgress { bytes_sent: self.offset, total_bytes: self.total_len }
    }

    /// Rebuilds the frame for whatever step is currently pending, for a
    /// timeout-triggered retry.
    pub fn retry_frame(&self, image: &[u8]) -> Option<InterMcuFrame> {
        match self.state {
            OtaState::AwaitingStartAck => Some(InterMcuFrame::new(OTA_START, self.total_len.to_le_bytes().to_vec()).unwrap()),
            OtaState::AwaitingChunkAck => Some(self.chunk_frame(image, self.offset, self.last_chunk_len as usize)),
            OtaState::AwaitingEndAck => Some(InterMcuFrame::new(OTA_END, crc32_ota(image).to_le_bytes().to_vec()).unwrap()),
            _ => None,
        }
    }

    fn chunk_frame(&self, image: &[u8], offset: u32, len: usize) -> InterMcuFrame {
        let mut payload = offset.to_le_bytes().to_vec();
        payload.extend_from_slice(&image[offset as usize..offset as usize + len]);
        InterMcuFrame::new(OTA_CHUNK, payload).expect("chunk size is bounded by CHUNK_SIZE")
    }

    /// Call after sending `OTA_START`. On ack, advances to streaming the
    /// first chunk and returns it; on retry exhaustion, fails the session.
    pub fn on_start_ack(&mut self, acked: bool, image: &[u8]) -> Result<InterMcuFrame, OtaError> {
        if self.state != OtaState::AwaitingStartAck {
            return Err(OtaError::WrongState(self.state));
        }
        if acked {
            self.retries_used = 0;
            self.state = OtaState::AwaitingChunkAck;
            Ok(self.next_chunk(image))
        } else {
            self.bump_retry(OtaStep::Start)
        }
    }

    fn next_chunk(&mut self, image: &[u8]) -> InterMcuFrame {
        let remaining = self.total_len - self.offset;
        let len = remaining.min(CHUNK_SIZE as u32) as usize;
        self.last_chunk_len = len as u32;
        self.chunk_frame(image, self.offset, len)
    }

    /// Call after sending an `OTA_CHUNK`. Does not advance the offset
    /// until the ack arrives, per the retry scenario's requirement.
    pub fn on_chunk_ack(&mut self, acked: bool, image: &[u8]) -> Result<ChunkOutcome, OtaError> {
        if self.state != OtaState::AwaitingChunkAck {
            return Err(OtaError::WrongState(self.state));
        }
        if acked {
            self.offset += self.last_chunk_len;
            self.retries_used = 0;
            if self.offset >= self.total_len {
                self.state = OtaState::AwaitingEndAck;
                let crc = crc32_ota(image);
                Ok(ChunkOutcome::ImageComplete(InterMcuFrame::new(OTA_END, crc.to_le_bytes().to_vec()).unwrap()))
            } else {
                Ok(ChunkOutcome::NextChunk(self.next_chunk(image)))
            }
        } else {
            self.retries_used += 1;
            if self.retries_used >= MAX_RETRIES {
                self.state = OtaState::Failed;
                return Err(OtaError::RetriesExhausted(OtaStep::Chunk));
            }
            Ok(ChunkOutcome::Retry(self.chunk_frame(image, self.offset, self.last_chunk_len as usize)))
        }
    }

    /// Call after sending `OTA_END`. A NACK here means a checksum
    /// mismatch on the receiver and is not retried — the image itself is
    /// presumed corrupt in transit.
    pub fn on_end_ack(&mut self, acked: bool) -> Result<InterMcuFrame, OtaError> {
        if self.state != OtaState::AwaitingEndAck {
            return Err(OtaError::WrongState(self.state));
        }
        if acked {
            self.state = OtaState::Applying;
            Ok(InterMcuFrame::new(OTA_APPLY, Vec::new()).unwrap())
        } else {
            self.state = OtaState::Failed;
            Err(OtaError::ChecksumRejected)
        }
    }

    pub fn on_applied(&mut self) {
        self.state = OtaState::Success;
    }

    fn bump_retry(&mut self, step: OtaStep) -> Result<InterMcuFrame, OtaError> {
        self.retries_used += 1;
        if self.retries_used >= MAX_RETRIES {
            self.state = OtaState::Failed;
            return Err(OtaError::RetriesExhausted(step));
        }
        match step {
            OtaStep::Start => Ok(InterMcuFrame::new(OTA_START, self.total_len.to_le_bytes().to_vec()).unwrap()),
            OtaStep::Chunk | OtaStep::End => unreachable!("handled directly by their callers"),
        }
    }
}

/// What to do next after an `OTA_CHUNK` ack/nack.
pub enum ChunkOutcome {
    NextChunk(InterMcuFrame),
    ImageComplete(InterMcuFrame),
    Retry(InterMcuFrame),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_streams_small_image_in_one_chunk() {
        let image = vec![0xABu8; 64];
        let (mut session, start_frame) = OtaSession::begin(image.len() as u32);
        assert_eq!(start_frame.command, OTA_START);

        let first_chunk = session.on_start_ack(true, &image).unwrap();
        assert_eq!(first_chunk.command, OTA_CHUNK);

        let outcome = session.on_chunk_ack(true, &image).unwrap();
        let end_frame = match outcome {
            ChunkOutcome::ImageComplete(frame) => frame,
            _ => panic!("64-byte image should complete after the first chunk"),
        };
        assert_eq!(end_frame.command, OTA_END);
        assert_eq!(session.progress().bytes_sent, 64);

        let apply_frame = session.on_end_ack(true).unwrap();
        assert_eq!(apply_frame.command, OTA_APPLY);
        session.on_applied();
        assert_eq!(session.state(), OtaState::Success);
    }

    #[test]
    fn chunk_offset_does_not_advance_until_acked() {
        let image = vec![0x11u8; 500];
        let (mut session, _start) = OtaSession::begin(image.len() as u32);
        session.on_start_ack(true, &image).unwrap();

        for _ in 0..2 {
            let outcome = session.on_chunk_ack(false, &image);
            assert!(matches!(outcome, Ok(ChunkOutcome::Retry(_))));
            assert_eq!(session.progress().bytes_sent, 0);
        }
        // Third attempt exhausts the retry budget.
        let outcome = session.on_chunk_ack(false, &image);
        assert!(matches!(outcome, Err(OtaError::RetriesExhausted(OtaStep::Chunk))));
        assert_eq!(session.state(), OtaState::Failed);
    }

    #[test]
    fn end_nack_fails_without_retry() {
        let image = vec![0x22u8; 10];
        let (mut session, _start) = OtaSession::begin(image.len() as u32);
        session.on_start_ack(true, &image).unwrap();
        session.on_chunk_ack(true, &image).unwrap();
        let result = session.on_end_ack(false);
        assert!(matches!(result, Err(OtaError::ChecksumRejected)));
        assert_eq!(session.state(), OtaState::Failed);
    }

    #[test]
    fn progress_percent_is_bytes_over_total() {
        let progress = OtaProgress { bytes_sent: 50, total_bytes: 200 };
        assert_eq!(progress.percent(), 25);
    }

    #[test]
    fn large_image_streams_multiple_chunks() {
        let image = vec![0x33u8; 450];
        let (mut session, _start) = OtaSession::begin(image.len() as u32);
        let mut frame = session.on_start_ack(true, &image).unwrap();
        assert_eq!(frame.command, OTA_CHUNK);

        let mut chunks_sent = 1;
        loop {
            match session.on_chunk_ack(true, &image).unwrap() {
                ChunkOutcome::NextChunk(next) => {
                    frame = next;
                    chunks_sent += 1;
                }
                ChunkOutcome::ImageComplete(end_frame) => {
                    frame = end_frame;
                    break;
                }
                ChunkOutcome::Retry(_) => unreachable!("test always acks"),
            }
        }
        assert_eq!(chunks_sent, 3); // 200 + 200 + 50
        assert_eq!(frame.command, OTA_END);
        assert_eq!(session.progress().bytes_sent, 450);
    }
}
