//! UART trait seam for the inter-MCU link.
//!
//! Any full-duplex async byte stream satisfies this — a real serial port
//! via `tokio`'s `AsyncRead`/`AsyncWrite`, or an in-memory duplex pipe in
//! tests. 115 200 baud / 8N1 and the RX/TX pin assignment are a platform
//! driver concern outside this crate's scope; only the framing in
//! `gw_core::transport` matters here.

use tokio::io::{AsyncRead, AsyncWrite};

pub trait UartPort: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> UartPort for T {}
