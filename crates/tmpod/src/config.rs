//! Sensor registry configuration.
//!
//! The registry maps device serials to their sensor slots and sensor ids to
//! sensor parameters. It is populated once at startup from a YAML file and
//! is read-only to the core afterwards, with one documented exception: the
//! ingest path overwrites a sensor's `unit` with the unit carried by the
//! reading, so the `cfg` snapshot written into a block reflects what the
//! sensor actually reported.

use crate::block::{Rid, Sid};
use crate::error::{Result, TmpoError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

/// Sensor slot indices carried by an uplink frame, in payload order.
///
/// A frame is nine big-endian u32 counters; counter `k` belongs to the
/// sensor configured at slot `UPLINK_SLOTS[k]` of the sending device.
pub const UPLINK_SLOTS: [u8; 9] = [1, 2, 13, 14, 25, 26, 37, 38, 39];

/// Parameters of a single sensor.
///
/// A clone of this struct is snapshotted into every block header (`cfg`),
/// so a reconfiguration mid-stream is visible in the data itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorParams {
    /// Sensor id, a hex string.
    pub id: Sid,
    /// Reset id; incremented by external config whenever the physical
    /// counter is reset.
    #[serde(default)]
    pub rid: Rid,
    /// Data type of the readings, e.g. `counter`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    /// Unit of the readings, e.g. `Wh`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Whether the sensor is enabled. Absent counts as enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<u8>,
    /// Whether the sensor participates in block logging. 1 or absent
    /// means yes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmpo: Option<u8>,
}

impl SensorParams {
    /// Fallback params for a sensor id the registry does not know.
    ///
    /// Readings for unknown sensors are still logged under `rid` 0 so no
    /// data is lost while the fleet config catches up.
    pub fn unregistered(sid: &str, unit: &str) -> Self {
        Self {
            id: sid.to_string(),
            rid: 0,
            data_type: None,
            unit: Some(unit.to_string()),
            enable: None,
            tmpo: None,
        }
    }

    fn is_enabled(&self) -> bool {
        self.enable != Some(0)
    }

    fn is_logged(&self) -> bool {
        matches!(self.tmpo, None | Some(1))
    }
}

#[derive(Debug, Deserialize)]
struct RawDevice {
    #[serde(default)]
    sensors: BTreeMap<u8, SensorParams>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    devices: HashMap<String, RawDevice>,
}

/// The sensor registry.
///
/// Holds the filtered sensor view (enabled sensors that participate in
/// block logging) and, per device serial, the slot → sensor id mapping
/// needed to decode inbound uplinks.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    sensors: HashMap<Sid, SensorParams>,
    devices: HashMap<String, BTreeMap<u8, Sid>>,
}

impl Registry {
    /// Loads the registry from a YAML config file.
    ///
    /// # Errors
    ///
    /// Returns `TmpoError::Config` if the file cannot be read or parsed.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())
            .map_err(|err| TmpoError::Config(format!("{}: {err}", path.as_ref().display())))?;
        Self::from_yaml(&text)
    }

    /// Parses the registry from YAML text.
    ///
    /// Disabled sensors and sensors opted out of block logging are dropped
    /// from the sensor view but keep their device slot, so an uplink for
    /// them is skipped rather than misattributed.
    ///
    /// # Errors
    ///
    /// Returns `TmpoError::Config` on malformed YAML.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let raw: RawConfig =
            serde_yaml::from_str(text).map_err(|err| TmpoError::Config(err.to_string()))?;

        let mut sensors = HashMap::new();
        let mut devices = HashMap::new();
        for (serial, device) in raw.devices {
            let mut slots = BTreeMap::new();
            for (slot, params) in device.sensors {
                slots.insert(slot, params.id.clone());
                if params.is_enabled() && params.is_logged() {
                    sensors.insert(params.id.clone(), params);
                }
            }
            devices.insert(serial, slots);
        }

        Ok(Self { sensors, devices })
    }

    /// Builds a registry directly from sensor params, for tests and
    /// embedded callers that bypass the YAML loader.
    pub fn from_sensors(params: impl IntoIterator<Item = SensorParams>) -> Self {
        let sensors = params
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect::<HashMap<_, _>>();
        Self {
            sensors,
            devices: HashMap::new(),
        }
    }

    /// Returns the current reset id for a sensor, 0 if unknown.
    pub fn rid_of(&self, sid: &str) -> Rid {
        self.sensors.get(sid).map(|p| p.rid).unwrap_or(0)
    }

    /// Returns the params for a sensor in the filtered view.
    pub fn params(&self, sid: &str) -> Option<&SensorParams> {
        self.sensors.get(sid)
    }

    /// Snapshots a sensor's params for a block header, overwriting the
    /// unit with the one carried by the reading. The registry copy keeps
    /// the new unit too.
    pub fn snapshot(&mut self, sid: &str, unit: &str) -> SensorParams {
        match self.sensors.get_mut(sid) {
            Some(params) => {
                if !unit.is_empty() {
                    params.unit = Some(unit.to_string());
                }
                params.clone()
            }
            None => SensorParams::unregistered(sid, unit),
        }
    }

    /// Returns the slot → sensor id map for a device serial.
    pub fn device_slots(&self, serial: &str) -> Option<&BTreeMap<u8, Sid>> {
        self.devices.get(serial)
    }

    /// Number of sensors in the filtered view.
    pub fn sensor_count(&self) -> usize {
        self.sensors.len()
    }
}
