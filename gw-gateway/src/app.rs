//! Task topology: the four execution contexts from the concurrency model,
//! realized as tokio tasks communicating over bounded channels rather than
//! back-pointers, per the core's "sessions report to the manager" design.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::StreamExt;
use gw_core::devices::DeviceVariant;
use gw_core::manager::{DeviceManager, ManagerAction, PairingStore, SessionEvent};
use tokio::sync::{mpsc, Mutex};
use tokio::time::interval;

use crate::ble::{BleCentral, Notification, ScanResult};
use crate::session_task::SessionTask;

/// Bounded queue depth for radio→session notifications, matching the
/// stated queue capacity. A full queue drops the oldest observation
/// rather than blocking the radio callback.
pub const RADIO_QUEUE_CAPACITY: usize = 10;

/// Manager supervisor tick cadence (~100 Hz).
const MANAGER_TICK: Duration = Duration::from_millis(10);

/// Placeholder product identifier stamped on every outbound inner packet.
/// Never itemized per device family; treated as a fixed value until a
/// device-reported product id is wired in.
const PRODUCT_ID: u8 = 0x01;

/// Routing table from a connected device's variant to the inbox of the
/// session task driving it. Populated by the manager task as sessions are
/// spawned, drained by the radio dispatcher as notifications arrive.
pub type SessionInboxes = Arc<StdMutex<HashMap<DeviceVariant, mpsc::Sender<Vec<u8>>>>>;

/// A raw event off the BLE central's scan-result or notification stream,
/// queued between the radio pump and the dispatcher so a slow dispatch
/// (locking the manager, looking up a session inbox) never blocks the
/// central adapter's own stream.
pub enum RadioEvent {
    ScanResult(ScanResult),
    Notification(Notification),
}

/// Runs the manager supervisor loop until `shutdown` resolves. Owns the
/// only direct handle to the BLE central's scan lifecycle and is the only
/// place a session task gets spawned, keyed off `ManagerAction::Connect`.
pub async fn run_manager<S: PairingStore + Send + 'static>(
    manager: Arc<Mutex<DeviceManager<S>>>,
    central: Arc<dyn BleCentral>,
    session_inboxes: SessionInboxes,
    user_id: String,
    mut shutdown: tokio::sync::oneshot::Receiver<()>,
) {
    let mut ticker = interval(MANAGER_TICK);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let actions = {
                    let mut manager = manager.lock().await;
                    manager.update(std::time::Instant::now())
                };
                for action in actions {
                    apply_action(&central, &manager, &session_inboxes, &user_id, action).await;
                }
            }
            _ = &mut shutdown => {
                tracing::info!("manager task shutting down");
                break;
            }
        }
    }
}

async fn apply_action<S: PairingStore + Send + 'static>(
    central: &Arc<dyn BleCentral>,
    manager: &Arc<Mutex<DeviceManager<S>>>,
    session_inboxes: &SessionInboxes,
    user_id: &str,
    action: ManagerAction,
) {
    match action {
        ManagerAction::StartScan => {
            if let Err(err) = central.start_scan().await {
                tracing::warn!(error = %err, "failed to start scan");
            }
        }
        ManagerAction::StopScan => {
            if let Err(err) = central.stop_scan().await {
                tracing::warn!(error = %err, "failed to stop scan");
            }
        }
        ManagerAction::Connect { variant, mac } => {
            tracing::info!(?variant, %mac, "spawning session for matched device");
            let (tx, rx) = mpsc::channel(RADIO_QUEUE_CAPACITY);
            session_inboxes.lock().unwrap().insert(variant, tx);

            let task = SessionTask::new(variant, mac, PRODUCT_ID, user_id.to_string(), central.clone(), manager.clone(), rx);
            tokio::spawn(task.run());
        }
    }
}

/// Pumps the central's scan-result and notification streams into a bounded
/// [`RadioEvent`] queue, then dispatches each event: scan results go to the
/// manager, notifications are routed to the matching session's inbox by the
/// manager's current mac→variant mapping. The two halves run concurrently so
/// a full dispatch path (locking the manager, a session inbox backed up)
/// never blocks the central adapter's own stream, only the queue between
/// them.
pub async fn run_radio<S: PairingStore + Send + 'static>(
    central: Arc<dyn BleCentral>,
    manager: Arc<Mutex<DeviceManager<S>>>,
    session_inboxes: SessionInboxes,
) {
    let (tx, mut rx) = mpsc::channel(RADIO_QUEUE_CAPACITY);

    let pump = async {
        let mut scan_results = central.scan_results();
        let mut notifications = central.notifications();
        loop {
            tokio::select! {
                Some(result) = scan_results.next() => {
                    if tx.try_send(RadioEvent::ScanResult(result)).is_err() {
                        tracing::warn!("radio event queue full, dropping scan result");
                    }
                }
                Some(notification) = notifications.next() => {
                    if tx.try_send(RadioEvent::Notification(notification)).is_err() {
                        tracing::warn!("radio event queue full, dropping notification");
                    }
                }
                else => break,
            }
        }
    };

    let dispatch = async {
        while let Some(event) = rx.recv().await {
            match event {
                RadioEvent::ScanResult(result) => {
                    manager.lock().await.on_scan_result(&result.manufacturer_data, &result.mac);
                }
                RadioEvent::Notification(notification) => {
                    let variant = {
                        let manager = manager.lock().await;
                        manager.list().iter().find(|s| s.mac.as_deref() == Some(notification.mac.as_str())).map(|s| s.variant)
                    };
                    let Some(variant) = variant else { continue };
                    let inbox = session_inboxes.lock().unwrap().get(&variant).cloned();
                    if let Some(inbox) = inbox {
                        if inbox.try_send(notification.data).is_err() {
                            tracing::warn!(?variant, "session inbox full, dropping notification");
                        }
                    }
                }
            }
        }
    };

    tokio::join!(pump, dispatch);
}

/// Reports a variant's connection transition to the manager. Session
/// tasks call this instead of reaching into the manager's slot state
/// directly.
pub async fn report_session_event<S: PairingStore + Send + 'static>(
    manager: &Arc<Mutex<DeviceManager<S>>>,
    variant: DeviceVariant,
    event: SessionEvent,
) {
    manager.lock().await.on_session_event(variant, event);
}
