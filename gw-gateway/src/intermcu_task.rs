//! Inter-MCU context: owns the UART link to the display co-processor from
//! a single task, so framed reads and writes (OTA streaming, in particular)
//! are never interleaved from two call sites.
//!
//! The ack/nack shape for each OTA step isn't itemized beyond "gated on an
//! ack from the display co-processor"; this task reads it back as the same
//! command byte echoed with a one-byte status payload (`0x01` ack, anything
//! else nack), the simplest encoding consistent with the rest of the
//! inter-MCU frame format.

use std::sync::Arc;
use std::time::Duration;

use gw_core::transport::{ChunkOutcome, FrameReceiver, InterMcuFrame, OtaError, OtaProgress, OtaSession, OtaState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::{timeout, Instant};

use crate::uart::UartPort;

/// How long to wait for an ack/nack of one OTA step before treating it as
/// a nack (start/chunk retry; fatal for the end-of-image checksum step).
const ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// One staged image to stream to the display co-processor.
pub struct OtaRequest {
    pub image: Vec<u8>,
    pub done: oneshot::Sender<Result<(), OtaError>>,
}

/// Services OTA requests one at a time for as long as `ota_rx` stays open.
/// `progress_tx` is how the (out-of-scope) web UI polls transfer progress.
pub async fn run_inter_mcu<P: UartPort + 'static>(
    port: Arc<Mutex<P>>,
    mut ota_rx: mpsc::Receiver<OtaRequest>,
    progress_tx: watch::Sender<Option<OtaProgress>>,
) {
    while let Some(request) = ota_rx.recv().await {
        let result = stream_ota(&port, &request.image, &progress_tx).await;
        if let Err(err) = &result {
            tracing::warn!(error = %err, "OTA transfer failed");
        }
        progress_tx.send_replace(None);
        let _ = request.done.send(result);
    }
}

async fn stream_ota<P: UartPort>(
    port: &Arc<Mutex<P>>,
    image: &[u8],
    progress_tx: &watch::Sender<Option<OtaProgress>>,
) -> Result<(), OtaError> {
    let (mut session, mut frame) = OtaSession::begin(image.len() as u32);

    loop {
        let state_before = session.state();
        send_frame(port, &frame).await;
        let acked = await_ack(port, frame.command).await;

        match state_before {
            OtaState::AwaitingStartAck => frame = session.on_start_ack(acked, image)?,
            OtaState::AwaitingChunkAck => {
                frame = match session.on_chunk_ack(acked, image)? {
                    ChunkOutcome::NextChunk(next) | ChunkOutcome::Retry(next) => next,
                    ChunkOutcome::ImageComplete(end_frame) => end_frame,
                }
            }
            OtaState::AwaitingEndAck => frame = session.on_end_ack(acked)?,
            OtaState::Applying => {
                session.on_applied();
                progress_tx.send_replace(Some(session.progress()));
                return Ok(());
            }
            OtaState::Success | OtaState::Failed => return Ok(()),
        }
        progress_tx.send_replace(Some(session.progress()));
    }
}

async fn send_frame<P: UartPort>(port: &Arc<Mutex<P>>, frame: &InterMcuFrame) {
    let encoded = frame.encode();
    let mut guard = port.lock().await;
    if let Err(err) = guard.write_all(&encoded).await {
        tracing::warn!(error = %err, command = frame.command, "inter-MCU write failed");
    }
}

/// Reads bytes one at a time until a frame carrying `command` arrives or
/// `ACK_TIMEOUT` elapses (treated as a nack either way — the session's own
/// retry budget covers a lost ack).
async fn await_ack<P: UartPort>(port: &Arc<Mutex<P>>, command: u8) -> bool {
    let mut receiver = FrameReceiver::new();
    let mut byte = [0u8; 1];
    let deadline = Instant::now() + ACK_TIMEOUT;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }

        let mut guard = port.lock().await;
        let read = timeout(remaining, guard.read(&mut byte)).await;
        drop(guard);

        match read {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => return false,
            Ok(Ok(_)) => {
                if let Some(frame) = receiver.push_byte(byte[0]) {
                    if frame.command == command {
                        return frame.payload.first().copied() == Some(1);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gw_core::transport::ota::OTA_APPLY;
    use tokio::io::duplex;

    #[tokio::test]
    async fn streams_small_image_end_to_end_with_an_acking_peer() {
        let (gateway_port, mut device_port) = duplex(4096);
        let gateway_port = Arc::new(Mutex::new(gateway_port));

        let device = tokio::spawn(async move {
            let mut receiver = FrameReceiver::new();
            let mut byte = [0u8; 1];
            loop {
                if device_port.read(&mut byte).await.unwrap() == 0 {
                    break;
                }
                if let Some(frame) = receiver.push_byte(byte[0]) {
                    let ack = InterMcuFrame::new(frame.command, vec![1]).unwrap();
                    device_port.write_all(&ack.encode()).await.unwrap();
                    if frame.command == OTA_APPLY {
                        break;
                    }
                }
            }
        });

        let (ota_tx, ota_rx) = mpsc::channel(1);
        let (progress_tx, _progress_rx) = watch::channel(None);
        let inter_mcu = tokio::spawn(run_inter_mcu(gateway_port, ota_rx, progress_tx));

        let (done_tx, done_rx) = oneshot::channel();
        ota_tx.send(OtaRequest { image: vec![0xABu8; 64], done: done_tx }).await.unwrap();
        drop(ota_tx);

        let result = done_rx.await.unwrap();
        assert!(result.is_ok());

        inter_mcu.await.unwrap();
        device.await.unwrap();
    }
}
