//! Flat-file `PairingStore` implementation: one TOML file under the
//! configured data directory, namespaced the way the original firmware's
//! key-value store uses a single `"ecoflow"` namespace with per-variant
//! `<v>_mac`/`<v>_sn` keys.

use std::collections::HashMap;
use std::path::PathBuf;

use gw_core::manager::{PairedDevice, PairingStore};
use serde::{Deserialize, Serialize};

use gw_core::devices::DeviceVariant;

fn variant_key(variant: DeviceVariant) -> &'static str {
    match variant {
        DeviceVariant::Battery => "d3",
        DeviceVariant::AirConditioner => "w2",
        DeviceVariant::HighPowerBattery => "d3p",
        DeviceVariant::AlternatorCharger => "ac",
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(flatten)]
    entries: HashMap<String, PairedDeviceRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PairedDeviceRecord {
    mac: String,
    serial: String,
}

/// Loads and persists pairing state to a single TOML file, rewriting the
/// whole file on every mutation (state changes here are rare: only on
/// successful pairing or an explicit forget).
pub struct FilePairingStore {
    path: PathBuf,
    file: StoreFile,
}

impl FilePairingStore {
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            toml::from_str(&contents).unwrap_or_default()
        } else {
            StoreFile::default()
        };
        Ok(FilePairingStore { path, file })
    }

    fn persist(&self) {
        if let Ok(contents) = toml::to_string_pretty(&self.file) {
            if let Err(err) = std::fs::write(&self.path, contents) {
                tracing::warn!(error = %err, path = %self.path.display(), "failed to persist pairing store");
            }
        }
    }
}

impl PairingStore for FilePairingStore {
    fn get(&self, variant: DeviceVariant) -> Option<PairedDevice> {
        self.file.entries.get(variant_key(variant)).map(|r| PairedDevice { mac: r.mac.clone(), serial: r.serial.clone() })
    }

    fn set(&mut self, variant: DeviceVariant, device: PairedDevice) {
        self.file.entries.insert(variant_key(variant).to_string(), PairedDeviceRecord { mac: device.mac, serial: device.serial });
        self.persist();
    }

    fn clear(&mut self, variant: DeviceVariant) {
        self.file.entries.remove(variant_key(variant));
        self.persist();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn persists_and_reloads_a_pairing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pairing.toml");

        {
            let mut store = FilePairingStore::open(&path).unwrap();
            store.set(DeviceVariant::AirConditioner, PairedDevice { mac: "AA:BB".into(), serial: "KT-1".into() });
        }

        let reloaded = FilePairingStore::open(&path).unwrap();
        let paired = reloaded.get(DeviceVariant::AirConditioner).unwrap();
        assert_eq!(paired.mac, "AA:BB");
        assert_eq!(paired.serial, "KT-1");
    }

    #[test]
    fn clear_removes_the_entry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pairing.toml");
        let mut store = FilePairingStore::open(&path).unwrap();
        store.set(DeviceVariant::Battery, PairedDevice { mac: "CC:DD".into(), serial: "P2-1".into() });
        store.clear(DeviceVariant::Battery);
        assert!(store.get(DeviceVariant::Battery).is_none());
    }
}
