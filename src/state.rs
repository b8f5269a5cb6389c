use crate::protocol::{OilLevel, StatusReport};
use crate::types::{DeviceIdentity, OilRecord, Schedule};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;

/// Live state of a diffuser as reconciled from its telemetry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    /// Diffuser running
    pub power: bool,
    /// Current intensity, 0 until reported
    pub current_intensity: u8,
    /// Fan running
    pub fan_on: bool,
    /// Active schedule slot, 0 for none
    pub active_schedule: u8,
    /// Reservoirs in slot order
    pub oils: Vec<OilRecord>,
    /// Battery level, only for devices reporting battery support
    pub battery_level: Option<u8>,
    /// PCB firmware version
    pub pcb_version: Option<String>,
    /// Equipment firmware version
    pub equipment_version: Option<String>,
    /// Schedule slots ordered by index
    pub schedules: Vec<Schedule>,
    /// Signal strength (RSSI), last known value while disconnected
    pub rssi: Option<i16>,
    /// Most recent successful exchange with the device
    pub last_seen: Option<SystemTime>,
    /// Transport link held
    pub connected: bool,
}

/// Identity facts that gate how telemetry is merged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MergeContext {
    pub battery_support: bool,
    pub max_intensity: u8,
}

impl From<&DeviceIdentity> for MergeContext {
    fn from(identity: &DeviceIdentity) -> Self {
        Self {
            battery_support: identity.capabilities.battery_support,
            max_intensity: identity.max_intensity,
        }
    }
}

impl DeviceState {
    /// Merge the fields a report carries, leaving everything else untouched
    pub(crate) fn apply_report(&mut self, report: &StatusReport, ctx: MergeContext) {
        // slot 1, or the first slot ever seen, mirrors what the device is doing
        let live = report
            .schedule
            .as_ref()
            .is_none_or(|schedule| schedule.index == 1 || self.schedules.is_empty());
        if live {
            self.apply_live(report, ctx);
        }
        if let Some(schedule) = &report.schedule {
            self.merge_schedule(schedule);
        }
        if let Some(names) = &report.oil_names {
            for (idx, name) in names.iter().enumerate() {
                self.oil_mut(idx).name.clone_from(name);
            }
        }
        if let Some(levels) = &report.oil_levels {
            for (idx, level) in levels.iter().enumerate() {
                self.merge_oil_level(idx, *level);
            }
        }
        if ctx.battery_support {
            if let Some(battery) = report.battery_level {
                self.battery_level = Some(battery);
            }
        }
        if let Some(pcb) = &report.pcb_version {
            self.pcb_version = Some(pcb.clone());
        }
        if let Some(equipment) = &report.equipment_version {
            self.equipment_version = Some(equipment.clone());
        }
    }

    fn apply_live(&mut self, report: &StatusReport, ctx: MergeContext) {
        if let Some(power) = report.power {
            self.power = power;
        }
        if let Some(intensity) = report.intensity {
            self.current_intensity = intensity.min(ctx.max_intensity);
        }
        if let Some(fan_on) = report.fan_on {
            self.fan_on = fan_on;
        }
        if let Some(active) = report.active_schedule {
            self.active_schedule = active;
        }
    }

    /// Record a successful exchange; ignored while disconnected
    pub(crate) fn record_contact(&mut self, at: SystemTime, rssi: Option<i16>) {
        if !self.connected {
            return;
        }
        self.last_seen = Some(self.last_seen.map_or(at, |prev| prev.max(at)));
        if rssi.is_some() {
            self.rssi = rssi;
        }
    }

    pub(crate) fn mark_connected(&mut self) {
        self.connected = true;
    }

    /// Flip to disconnected, freezing `last_seen` and `rssi`
    pub(crate) fn mark_disconnected(&mut self) {
        self.connected = false;
    }

    /// Keep the intensity within a newly learned maximum
    pub(crate) fn clamp_intensity(&mut self, max_intensity: u8) {
        self.current_intensity = self.current_intensity.min(max_intensity);
    }

    fn oil_mut(&mut self, idx: usize) -> &mut OilRecord {
        while self.oils.len() <= idx {
            let name = OilRecord::default_name(self.oils.len());
            self.oils.push(OilRecord {
                name,
                total: 0,
                remaining: 0,
            });
        }
        &mut self.oils[idx]
    }

    fn merge_oil_level(&mut self, idx: usize, level: OilLevel) {
        let oil = self.oil_mut(idx);
        // a frame without capacity does not erase a known one
        if level.total > 0 {
            oil.total = level.total;
        }
        oil.remaining = level.remaining;
    }

    fn merge_schedule(&mut self, schedule: &Schedule) {
        match self
            .schedules
            .binary_search_by_key(&schedule.index, |s| s.index)
        {
            Ok(pos) => self.schedules[pos] = schedule.clone(),
            Err(pos) => self.schedules.insert(pos, schedule.clone()),
        }
    }
}

/// A single attribute value
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Flag
    Bool(bool),
    /// Number
    Int(i64),
    /// Text
    Text(String),
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<u8> for AttributeValue {
    fn from(value: u8) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u16> for AttributeValue {
    fn from(value: u16) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<i16> for AttributeValue {
    fn from(value: i16) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Read-only view handed to consumers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSnapshot {
    /// Identity of the current connection, `None` before the first handshake
    pub identity: Option<DeviceIdentity>,
    /// Live state
    pub state: DeviceState,
}

impl DeviceSnapshot {
    /// Flat attribute table
    ///
    /// Reservoir keys are `oil_name`, `oil_total`, `oil_remaining` and
    /// `oil_percentage` for single-reservoir devices, and numbered from 1
    /// (`oil_1_name`, ...) for multi-aroma devices.
    #[must_use]
    pub fn attributes(&self) -> BTreeMap<String, AttributeValue> {
        let mut attrs = BTreeMap::new();
        let mut put = |key: &str, value: AttributeValue| {
            attrs.insert(key.to_string(), value);
        };
        let state = &self.state;

        put("connected", state.connected.into());
        put("power", state.power.into());
        put("current_intensity", state.current_intensity.into());
        put("fan_on", state.fan_on.into());

        let multi_aroma = match &self.identity {
            Some(identity) => {
                put("device_name", identity.device_name.clone().into());
                put("product_name", identity.product_name.clone().into());
                put("protocol_version", identity.protocol_version.to_string().into());
                put("max_intensity", identity.max_intensity.into());
                let caps = identity.capabilities;
                put("oil_support", caps.oil_support.into());
                put("battery_support", caps.battery_support.into());
                put("custom_intensity_support", caps.custom_intensity_support.into());
                put("fan_control_support", caps.fan_control_support.into());
                put("multiple_aroma_support", caps.multi_aroma.into());
                caps.multi_aroma
            }
            None => false,
        };

        if let Some(battery) = state.battery_level {
            put("battery_level", battery.into());
        }
        if let Some(pcb) = &state.pcb_version {
            put("pcb_version", pcb.clone().into());
        }
        if let Some(equipment) = &state.equipment_version {
            put("equipment_version", equipment.clone().into());
        }
        if let Some(rssi) = state.rssi {
            put("rssi", rssi.into());
        }
        if let Some(last_seen) = state.last_seen {
            put("last_seen", DateTime::<Utc>::from(last_seen).to_rfc3339().into());
        }

        let oils: Vec<(String, &OilRecord)> = if multi_aroma {
            state
                .oils
                .iter()
                .enumerate()
                .map(|(idx, oil)| (format!("oil_{}_", idx + 1), oil))
                .collect()
        } else {
            state
                .oils
                .first()
                .map(|oil| ("oil_".to_string(), oil))
                .into_iter()
                .collect()
        };
        for (prefix, oil) in oils {
            put(&format!("{prefix}name"), oil.name.clone().into());
            put(&format!("{prefix}total"), oil.total.into());
            put(&format!("{prefix}remaining"), oil.remaining.into());
            if let Some(pct) = oil.percentage() {
                put(&format!("{prefix}percentage"), pct.into());
            }
        }

        attrs
    }
}
