//! The singleton that arbitrates one BLE radio across four device slots:
//! scan arbitration, connection queueing, and pairing persistence.
//!
//! Per the source design notes, this is modeled as a single owning value
//! threaded through the application root rather than a mutable global, and
//! sessions report back to it through a message channel
//! ([`SessionEvent`]) rather than a back-pointer — the manager owns all
//! sessions and pumps their inboxes.

use std::time::{Duration, Instant};

use crate::devices::{DeviceVariant, TelemetrySnapshot};

/// Absolute scan timeout: stop scanning if no match arrives within this
/// window.
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("device variant {0:?} is not paired")]
    NotPaired(DeviceVariant),
}

/// A device's persisted identity: the BLE address it was last seen at and
/// its serial number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedDevice {
    pub mac: String,
    pub serial: String,
}

/// Backs slot persistence. A flat file-backed implementation lives in the
/// binary crate; tests use an in-memory double.
pub trait PairingStore {
    fn get(&self, variant: DeviceVariant) -> Option<PairedDevice>;
    fn set(&mut self, variant: DeviceVariant, device: PairedDevice);
    fn clear(&mut self, variant: DeviceVariant);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
}

/// An update a session reports back to the manager about one of its
/// slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Authenticated,
    Disconnected,
}

/// One of the four preallocated device containers.
#[derive(Debug, Clone)]
pub struct DeviceSlot {
    pub variant: DeviceVariant,
    pub display_name: String,
    pub mac: Option<String>,
    pub serial: Option<String>,
    pub connection: ConnectionState,
    pub telemetry: Option<TelemetrySnapshot>,
    /// Set by [`DeviceManager::scan_and_connect`] to force a scan for this
    /// slot even if it isn't paired yet (new-pairing mode).
    armed_for_scan: bool,
}

impl DeviceSlot {
    fn new(variant: DeviceVariant, display_name: &str) -> Self {
        DeviceSlot {
            variant,
            display_name: display_name.to_string(),
            mac: None,
            serial: None,
            connection: ConnectionState::Disconnected,
            telemetry: None,
            armed_for_scan: false,
        }
    }

    pub fn is_paired(&self) -> bool {
        self.mac.is_some()
    }
}

/// Action the manager wants the radio task to perform. The manager never
/// touches the radio directly; it only decides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerAction {
    StartScan,
    StopScan,
    Connect { variant: DeviceVariant, mac: String },
}

struct PendingFound {
    variant: DeviceVariant,
    mac: String,
    serial: String,
}

/// Coordinates the four device slots and the single BLE scan resource.
pub struct DeviceManager<S: PairingStore> {
    slots: [DeviceSlot; 4],
    store: S,
    scanning: bool,
    scan_started_at: Option<Instant>,
    pending_found: Option<PendingFound>,
}

impl<S: PairingStore> DeviceManager<S> {
    pub fn new(store: S) -> Self {
        let mut slots = [
            DeviceSlot::new(DeviceVariant::Battery, "Battery"),
            DeviceSlot::new(DeviceVariant::AirConditioner, "Air Conditioner"),
            DeviceSlot::new(DeviceVariant::HighPowerBattery, "High-Power Battery"),
            DeviceSlot::new(DeviceVariant::AlternatorCharger, "Alternator Charger"),
        ];
        for slot in &mut slots {
            if let Some(paired) = store.get(slot.variant) {
                slot.mac = Some(paired.mac);
                slot.serial = Some(paired.serial);
            }
        }
        DeviceManager { slots, store, scanning: false, scan_started_at: None, pending_found: None }
    }

    pub fn get(&self, variant: DeviceVariant) -> &DeviceSlot {
        self.slots.iter().find(|s| s.variant == variant).expect("all four variants are preallocated")
    }

    pub fn list(&self) -> &[DeviceSlot] {
        &self.slots
    }

    fn slot_mut(&mut self, variant: DeviceVariant) -> &mut DeviceSlot {
        self.slots.iter_mut().find(|s| s.variant == variant).expect("all four variants are preallocated")
    }

    /// Arms a slot for pairing: clears its persisted MAC so the next scan
    /// match is accepted unconditionally, and marks it disconnected so
    /// `update()` schedules a scan for it.
    pub fn scan_and_connect(&mut self, variant: DeviceVariant) {
        let slot = self.slot_mut(variant);
        slot.mac = None;
        slot.connection = ConnectionState::Disconnected;
        slot.armed_for_scan = true;
    }

    /// Marks a slot disconnected, e.g. on a UI-driven "disconnect" request.
    /// Errors if the slot was never paired, since there is nothing to
    /// disconnect from.
    pub fn disconnect(&mut self, variant: DeviceVariant) -> Result<(), ManagerError> {
        let slot = self.slot_mut(variant);
        if !slot.is_paired() {
            return Err(ManagerError::NotPaired(variant));
        }
        slot.connection = ConnectionState::Disconnected;
        Ok(())
    }

    /// Clears a slot's persisted pairing. Errors if the slot was never
    /// paired.
    pub fn forget(&mut self, variant: DeviceVariant) -> Result<(), ManagerError> {
        if !self.get(variant).is_paired() {
            return Err(ManagerError::NotPaired(variant));
        }
        self.store.clear(variant);
        let slot = self.slot_mut(variant);
        slot.mac = None;
        slot.serial = None;
        slot.connection = ConnectionState::Disconnected;
        slot.telemetry = None;
        slot.armed_for_scan = false;
        Ok(())
    }

    /// Feeds one scanned advertisement's manufacturer data and MAC. Runs on
    /// the radio task; only records a pending match under the manager's
    /// ownership, never connects directly.
    pub fn on_scan_result(&mut self, manufacturer_data: &[u8], mac: &str) {
        if self.pending_found.is_some() {
            return; // only one pending match is held at a time
        }
        let Some(serial) = extract_serial(manufacturer_data) else {
            return;
        };
        let Some(variant) = DeviceVariant::from_serial(&serial) else {
            return;
        };
        let slot = self.get(variant);
        let matches = match &slot.mac {
            Some(known_mac) => known_mac == mac,
            None => true, // empty MAC: new-pairing mode targeting this variant
        };
        if slot.variant == variant && matches {
            self.pending_found = Some(PendingFound { variant, mac: mac.to_string(), serial });
        }
    }

    pub fn on_session_event(&mut self, variant: DeviceVariant, event: SessionEvent) {
        let slot = self.slot_mut(variant);
        slot.connection = match event {
            SessionEvent::Connected => ConnectionState::Connected,
            SessionEvent::Authenticated => ConnectionState::Authenticated,
            SessionEvent::Disconnected => ConnectionState::Disconnected,
        };
    }

    pub fn update_telemetry(&mut self, variant: DeviceVariant, snapshot: TelemetrySnapshot) {
        self.slot_mut(variant).telemetry = Some(snapshot);
    }

    fn any_slot_connecting(&self) -> bool {
        self.slots.iter().any(|s| s.connection == ConnectionState::Connecting)
    }

    /// Runs one supervisor tick, returning the actions (if any) the radio
    /// task should carry out. Never blocks.
    pub fn update(&mut self, now: Instant) -> Vec<ManagerAction> {
        let mut actions = Vec::new();

        if let Some(found) = self.pending_found.take() {
            if !self.any_slot_connecting() {
                self.store.set(found.variant, PairedDevice { mac: found.mac.clone(), serial: found.serial.clone() });
                let slot = self.slot_mut(found.variant);
                slot.mac = Some(found.mac.clone());
                slot.serial = Some(found.serial.clone());
                slot.connection = ConnectionState::Connecting;
                slot.armed_for_scan = false;
                actions.push(ManagerAction::Connect { variant: found.variant, mac: found.mac });
            } else {
                self.pending_found = Some(found);
            }
        }

        if self.scanning && self.any_slot_connecting() {
            self.scanning = false;
            self.scan_started_at = None;
            actions.push(ManagerAction::StopScan);
        } else if self.scanning {
            if let Some(started) = self.scan_started_at {
                if now.duration_since(started) > SCAN_TIMEOUT {
                    self.scanning = false;
                    self.scan_started_at = None;
                    actions.push(ManagerAction::StopScan);
                }
            }
        } else if !self.any_slot_connecting() {
            let scan_candidate = self.slots.iter().any(|s| s.connection == ConnectionState::Disconnected && (s.armed_for_scan || s.is_paired()));
            if scan_candidate {
                self.scanning = true;
                self.scan_started_at = Some(now);
                actions.push(ManagerAction::StartScan);
            }
        }

        actions
    }
}

/// Extracts the 16-byte device serial starting at offset 3 of the
/// manufacturer-data field.
fn extract_serial(manufacturer_data: &[u8]) -> Option<String> {
    let bytes = manufacturer_data.get(3..19)?;
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8(bytes[..end].to_vec()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MemoryStore(HashMap<DeviceVariant, PairedDevice>);
    impl PairingStore for MemoryStore {
        fn get(&self, variant: DeviceVariant) -> Option<PairedDevice> {
            self.0.get(&variant).cloned()
        }
        fn set(&mut self, variant: DeviceVariant, device: PairedDevice) {
            self.0.insert(variant, device);
        }
        fn clear(&mut self, variant: DeviceVariant) {
            self.0.remove(&variant);
        }
    }

    fn manufacturer_data_for(serial: &str) -> Vec<u8> {
        let mut data = vec![0u8; 3];
        data.extend_from_slice(serial.as_bytes());
        data.resize(19, 0);
        data
    }

    #[test]
    fn scan_result_matches_new_pairing_with_empty_mac() {
        let mut manager = DeviceManager::new(MemoryStore::default());
        manager.on_scan_result(&manufacturer_data_for("KT-000001"), "AA:BB:CC:DD:EE:FF");
        let actions = manager.update(Instant::now());
        assert!(actions.iter().any(|a| matches!(a, ManagerAction::Connect { variant: DeviceVariant::AirConditioner, mac } if mac == "AA:BB:CC:DD:EE:FF")));
    }

    #[test]
    fn only_one_pending_match_is_held() {
        let mut manager = DeviceManager::new(MemoryStore::default());
        manager.on_scan_result(&manufacturer_data_for("KT-000001"), "AA:AA:AA:AA:AA:AA");
        manager.on_scan_result(&manufacturer_data_for("P2-000002"), "BB:BB:BB:BB:BB:BB");
        let actions = manager.update(Instant::now());
        let connects = actions.iter().filter(|a| matches!(a, ManagerAction::Connect { .. })).count();
        assert_eq!(connects, 1);
    }

    #[test]
    fn at_most_one_slot_connecting_at_once() {
        let mut manager = DeviceManager::new(MemoryStore::default());
        manager.on_scan_result(&manufacturer_data_for("KT-000001"), "AA:AA:AA:AA:AA:AA");
        manager.update(Instant::now());
        assert_eq!(manager.get(DeviceVariant::AirConditioner).connection, ConnectionState::Connecting);

        manager.on_scan_result(&manufacturer_data_for("P2-000002"), "BB:BB:BB:BB:BB:BB");
        let actions = manager.update(Instant::now());
        assert!(!actions.iter().any(|a| matches!(a, ManagerAction::Connect { .. })));
    }

    #[test]
    fn pairing_persists_across_manager_recreation() {
        let mut store = MemoryStore::default();
        store.set(DeviceVariant::AirConditioner, PairedDevice { mac: "AA:AA:AA:AA:AA:AA".into(), serial: "KT-000001".into() });
        let manager = DeviceManager::new(store);
        assert_eq!(manager.get(DeviceVariant::AirConditioner).mac.as_deref(), Some("AA:AA:AA:AA:AA:AA"));
    }

    #[test]
    fn forget_clears_persisted_pairing() {
        let mut store = MemoryStore::default();
        store.set(DeviceVariant::AirConditioner, PairedDevice { mac: "AA:AA:AA:AA:AA:AA".into(), serial: "KT-000001".into() });
        let mut manager = DeviceManager::new(store);
        manager.forget(DeviceVariant::AirConditioner).unwrap();
        assert!(manager.get(DeviceVariant::AirConditioner).mac.is_none());
    }

    #[test]
    fn forgetting_an_unpaired_slot_errors() {
        let mut manager = DeviceManager::new(MemoryStore::default());
        assert!(matches!(manager.forget(DeviceVariant::Battery), Err(ManagerError::NotPaired(DeviceVariant::Battery))));
    }

    #[test]
    fn scan_starts_when_a_paired_slot_is_disconnected() {
        let mut store = MemoryStore::default();
        store.set(DeviceVariant::Battery, PairedDevice { mac: "AA:AA:AA:AA:AA:AA".into(), serial: "P2-0001".into() });
        let mut manager = DeviceManager::new(store);
        let actions = manager.update(Instant::now());
        assert!(actions.contains(&ManagerAction::StartScan));
    }

    #[test]
    fn scan_stops_after_timeout_with_no_match() {
        let mut manager = DeviceManager::new(MemoryStore::default());
        manager.scan_and_connect(DeviceVariant::Battery);
        let start = Instant::now();
        manager.update(start);
        assert!(manager.scanning);
        let later = start + SCAN_TIMEOUT + Duration::from_secs(1);
        let actions = manager.update(later);
        assert!(actions.contains(&ManagerAction::StopScan));
    }
}
