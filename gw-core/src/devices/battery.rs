//! Battery-family adaptors: the standard battery, the dual-AC-bus
//! high-power battery, and the alternator charger. All three speak the
//! same structured configuration-write and tagged-field telemetry schema.

use byteorder::{ByteOrder, LittleEndian};
use std::collections::HashMap;

use super::BATTERY_CONFIG_COMMAND;

/// A single telemetry or configuration field, tagged as in the wire
/// payload. The tag space is shared across the three battery-family
/// variants; a given variant's telemetry push only populates the tags
/// relevant to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatteryConfigField {
    MaxChargeSoc,
    MinDischargeSoc,
    AcChargeWatts,
    DcChargeWatts,
    ScreenTimeoutSeconds,
    StandbyTimeoutMinutes,
    BeepEnabled,
    AcOutputEnabled,
    DcOutputEnabled,
}

impl BatteryConfigField {
    fn tag(self) -> u8 {
        match self {
            BatteryConfigField::MaxChargeSoc => 0x01,
            BatteryConfigField::MinDischargeSoc => 0x02,
            BatteryConfigField::AcChargeWatts => 0x03,
            BatteryConfigField::DcChargeWatts => 0x04,
            BatteryConfigField::ScreenTimeoutSeconds => 0x05,
            BatteryConfigField::StandbyTimeoutMinutes => 0x06,
            BatteryConfigField::BeepEnabled => 0x07,
            BatteryConfigField::AcOutputEnabled => 0x08,
            BatteryConfigField::DcOutputEnabled => 0x09,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0x01 => BatteryConfigField::MaxChargeSoc,
            0x02 => BatteryConfigField::MinDischargeSoc,
            0x03 => BatteryConfigField::AcChargeWatts,
            0x04 => BatteryConfigField::DcChargeWatts,
            0x05 => BatteryConfigField::ScreenTimeoutSeconds,
            0x06 => BatteryConfigField::StandbyTimeoutMinutes,
            0x07 => BatteryConfigField::BeepEnabled,
            0x08 => BatteryConfigField::AcOutputEnabled,
            0x09 => BatteryConfigField::DcOutputEnabled,
            _ => return None,
        })
    }
}

/// A structured configuration write: a set of (field, value) pairs, each
/// carried with an explicit field-set presence flag so that setting one
/// parameter doesn't implicitly reset the others.
///
/// Serializes to the payload of an inner packet with command-set `0xFE`,
/// command-id `0x11`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatteryConfigWrite {
    fields: Vec<(BatteryConfigField, u32)>,
}

impl BatteryConfigWrite {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `field` present with `value`; all other fields remain absent.
    pub fn set(mut self, field: BatteryConfigField, value: u32) -> Self {
        self.fields.retain(|(f, _)| *f != field);
        self.fields.push((field, value));
        self
    }

    pub fn command(&self) -> (u8, u8) {
        BATTERY_CONFIG_COMMAND
    }

    /// Each present field is serialized as `tag(1) | present(1)=1 | value(4, LE)`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.fields.len() * 6);
        for (field, value) in &self.fields {
            out.push(field.tag());
            out.push(1); // present
            let mut value_bytes = [0u8; 4];
            LittleEndian::write_u32(&mut value_bytes, *value);
            out.extend_from_slice(&value_bytes);
        }
        out
    }
}

fn parse_tagged_fields(payload: &[u8]) -> HashMap<u8, u32> {
    let mut fields = HashMap::new();
    let mut i = 0;
    while i + 6 <= payload.len() {
        let tag = payload[i];
        let present = payload[i + 1];
        let value = LittleEndian::read_u32(&payload[i + 2..i + 6]);
        if present == 1 {
            fields.insert(tag, value);
        }
        i += 6;
    }
    fields
}

/// Telemetry for the standard single-AC-bus battery variant.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatteryTelemetry {
    pub state_of_charge_percent: u32,
    pub ac_output_watts: u32,
    pub dc_output_watts: u32,
    pub input_watts: u32,
    pub cell_voltages_mv: [u32; 4],
    pub temperature_celsius: i32,
    pub ac_output_enabled: bool,
    pub dc_output_enabled: bool,
}

pub(super) fn parse_battery(payload: &[u8], previous: Option<&BatteryTelemetry>) -> Option<BatteryTelemetry> {
    if payload.is_empty() {
        return None;
    }
    let fields = parse_tagged_fields(payload);
    let mut snapshot = previous.copied().unwrap_or_default();
    apply_common_battery_fields(&fields, &mut snapshot);
    Some(snapshot)
}

fn apply_common_battery_fields(fields: &HashMap<u8, u32>, snapshot: &mut BatteryTelemetry) {
    if let Some(&v) = fields.get(&0x10) {
        snapshot.state_of_charge_percent = v;
    }
    if let Some(&v) = fields.get(&0x11) {
        snapshot.ac_output_watts = v;
    }
    if let Some(&v) = fields.get(&0x12) {
        snapshot.dc_output_watts = v;
    }
    if let Some(&v) = fields.get(&0x13) {
        snapshot.input_watts = v;
    }
    for (i, tag) in [0x14u8, 0x15, 0x16, 0x17].into_iter().enumerate() {
        if let Some(&v) = fields.get(&tag) {
            snapshot.cell_voltages_mv[i] = v;
        }
    }
    if let Some(&v) = fields.get(&0x18) {
        snapshot.temperature_celsius = v as i32;
    }
    if let Some(&v) = fields.get(&BatteryConfigField::AcOutputEnabled.tag()) {
        snapshot.ac_output_enabled = v != 0;
    }
    if let Some(&v) = fields.get(&BatteryConfigField::DcOutputEnabled.tag()) {
        snapshot.dc_output_enabled = v != 0;
    }
}

/// Telemetry for the high-power battery, which exposes dual AC buses.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HighPowerBatteryTelemetry {
    pub state_of_charge_percent: u32,
    pub ac_bus_a_watts: u32,
    pub ac_bus_b_watts: u32,
    pub dc_output_watts: u32,
    pub input_watts: u32,
    pub cell_voltages_mv: [u32; 4],
    pub temperature_celsius: i32,
}

pub(super) fn parse_high_power_battery(payload: &[u8], previous: Option<&HighPowerBatteryTelemetry>) -> Option<HighPowerBatteryTelemetry> {
    if payload.is_empty() {
        return None;
    }
    let fields = parse_tagged_fields(payload);
    let mut snapshot = previous.copied().unwrap_or_default();
    if let Some(&v) = fields.get(&0x10) {
        snapshot.state_of_charge_percent = v;
    }
    if let Some(&v) = fields.get(&0x20) {
        snapshot.ac_bus_a_watts = v;
    }
    if let Some(&v) = fields.get(&0x21) {
        snapshot.ac_bus_b_watts = v;
    }
    if let Some(&v) = fields.get(&0x12) {
        snapshot.dc_output_watts = v;
    }
    if let Some(&v) = fields.get(&0x13) {
        snapshot.input_watts = v;
    }
    for (i, tag) in [0x14u8, 0x15, 0x16, 0x17].into_iter().enumerate() {
        if let Some(&v) = fields.get(&tag) {
            snapshot.cell_voltages_mv[i] = v;
        }
    }
    if let Some(&v) = fields.get(&0x18) {
        snapshot.temperature_celsius = v as i32;
    }
    Some(snapshot)
}

/// Telemetry for the alternator charger.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AlternatorChargerTelemetry {
    pub input_voltage_mv: u32,
    pub output_watts: u32,
    pub alternator_rpm: u32,
    pub temperature_celsius: i32,
    pub charging_active: bool,
}

pub(super) fn parse_alternator_charger(payload: &[u8], previous: Option<&AlternatorChargerTelemetry>) -> Option<AlternatorChargerTelemetry> {
    if payload.is_empty() {
        return None;
    }
    let fields = parse_tagged_fields(payload);
    let mut snapshot = previous.copied().unwrap_or_default();
    if let Some(&v) = fields.get(&0x30) {
        snapshot.input_voltage_mv = v;
    }
    if let Some(&v) = fields.get(&0x31) {
        snapshot.output_watts = v;
    }
    if let Some(&v) = fields.get(&0x32) {
        snapshot.alternator_rpm = v;
    }
    if let Some(&v) = fields.get(&0x33) {
        snapshot.temperature_celsius = v as i32;
    }
    if let Some(&v) = fields.get(&0x34) {
        snapshot.charging_active = v != 0;
    }
    Some(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_write_serializes_only_set_fields() {
        let write = BatteryConfigWrite::new().set(BatteryConfigField::MaxChargeSoc, 90);
        let encoded = write.encode();
        assert_eq!(encoded.len(), 6);
        assert_eq!(encoded[0], BatteryConfigField::MaxChargeSoc.tag());
        assert_eq!(encoded[1], 1);
        assert_eq!(LittleEndian::read_u32(&encoded[2..6]), 90);
    }

    #[test]
    fn config_write_set_replaces_prior_value_for_same_field() {
        let write = BatteryConfigWrite::new().set(BatteryConfigField::MaxChargeSoc, 80).set(BatteryConfigField::MaxChargeSoc, 95);
        let encoded = write.encode();
        assert_eq!(encoded.len(), 6);
        assert_eq!(LittleEndian::read_u32(&encoded[2..6]), 95);
    }

    #[test]
    fn telemetry_merges_onto_previous_snapshot() {
        let mut payload = Vec::new();
        payload.push(0x10);
        payload.push(1);
        payload.extend_from_slice(&42u32.to_le_bytes());

        let first = parse_battery(&payload, None).unwrap();
        assert_eq!(first.state_of_charge_percent, 42);
        assert_eq!(first.ac_output_watts, 0);

        let mut second_payload = Vec::new();
        second_payload.push(0x11);
        second_payload.push(1);
        second_payload.extend_from_slice(&500u32.to_le_bytes());
        let second = parse_battery(&second_payload, Some(&first)).unwrap();
        assert_eq!(second.state_of_charge_percent, 42, "untouched field retains previous value");
        assert_eq!(second.ac_output_watts, 500);
    }

    #[test]
    fn field_tag_round_trips() {
        for tag in 0x01u8..=0x09 {
            let field = BatteryConfigField::from_tag(tag).unwrap();
            assert_eq!(field.tag(), tag);
        }
        assert!(BatteryConfigField::from_tag(0xFF).is_none());
    }
}
