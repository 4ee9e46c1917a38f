//! BLE central trait seam.
//!
//! The core never talks to a radio directly (platform drivers are out of
//! scope); this trait is what the radio task drives, and what a mock
//! implementation satisfies in tests.

use futures_util::stream::BoxStream;

/// Service UUID the gateway writes commands to and subscribes for
/// notifications on.
pub const SERVICE_UUID: &str = "00000001-0000-1000-8000-00805f9b34fb";
pub const WRITE_CHARACTERISTIC_UUID: &str = "00000002-0000-1000-8000-00805f9b34fb";
pub const NOTIFY_CHARACTERISTIC_UUID: &str = "00000003-0000-1000-8000-00805f9b34fb";

#[derive(Debug, Clone)]
pub struct ScanResult {
    pub mac: String,
    pub manufacturer_data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub mac: String,
    pub data: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum BleError {
    #[error("BLE adapter error: {0}")]
    Adapter(String),

    #[error("not connected to {0}")]
    NotConnected(String),
}

/// Everything the gateway needs from a BLE central: scanning, connecting,
/// writing, and a stream of notifications.
#[async_trait::async_trait]
pub trait BleCentral: Send + Sync {
    async fn start_scan(&self) -> Result<(), BleError>;
    async fn stop_scan(&self) -> Result<(), BleError>;
    async fn connect(&self, mac: &str) -> Result<(), BleError>;
    async fn disconnect(&self, mac: &str) -> Result<(), BleError>;
    async fn write(&self, mac: &str, bytes: &[u8]) -> Result<(), BleError>;

    /// A stream of scan results; only consumed while a scan is active.
    fn scan_results(&self) -> BoxStream<'static, ScanResult>;

    /// A stream of notification bytes from all connected peripherals,
    /// possibly fragmented relative to outer-frame boundaries.
    fn notifications(&self) -> BoxStream<'static, Notification>;
}

/// An in-memory [`BleCentral`] that records calls and replays canned scan
/// results and notifications, rather than talking to a radio.
///
/// Used by this crate's own tests, and by `main` as the default central
/// when no platform adapter is supplied — scanning and writes are no-ops
/// and the notification/scan-result streams are empty, so the task
/// topology runs and idles rather than the binary being a no-op shell.
pub mod mock {
    use super::*;
    use futures_util::stream;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockCentral {
        pub scan_results: Mutex<Vec<ScanResult>>,
        pub notifications: Mutex<Vec<Notification>>,
        pub connected: Mutex<Vec<String>>,
        pub writes: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait::async_trait]
    impl BleCentral for MockCentral {
        async fn start_scan(&self) -> Result<(), BleError> {
            Ok(())
        }

        async fn stop_scan(&self) -> Result<(), BleError> {
            Ok(())
        }

        async fn connect(&self, mac: &str) -> Result<(), BleError> {
            self.connected.lock().unwrap().push(mac.to_string());
            Ok(())
        }

        async fn disconnect(&self, mac: &str) -> Result<(), BleError> {
            self.connected.lock().unwrap().retain(|m| m != mac);
            Ok(())
        }

        async fn write(&self, mac: &str, bytes: &[u8]) -> Result<(), BleError> {
            self.writes.lock().unwrap().push((mac.to_string(), bytes.to_vec()));
            Ok(())
        }

        fn scan_results(&self) -> BoxStream<'static, ScanResult> {
            let results = self.scan_results.lock().unwrap().clone();
            Box::pin(stream::iter(results))
        }

        fn notifications(&self) -> BoxStream<'static, Notification> {
            let notifications = self.notifications.lock().unwrap().clone();
            Box::pin(stream::iter(notifications))
        }
    }
}
