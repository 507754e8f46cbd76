//! Inbound sensor uplink decoding.
//!
//! Gateways forward LoRa uplinks as JSON: a device serial, an ISO-8601
//! receive time, and a base64 payload of nine big-endian u32 counters. Each
//! counter position maps to a fixed sensor slot of the sending device; a
//! zero counter means "no reading this interval" and is skipped.

use crate::block::Sample;
use crate::config::{Registry, UPLINK_SLOTS};
use crate::error::{Result, TmpoError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::DateTime;
use serde::Deserialize;
use tracing::debug;

/// Payload size: nine big-endian u32 counters.
const FRAME_LEN: usize = UPLINK_SLOTS.len() * 4;

#[derive(Debug, Deserialize)]
struct UplinkMetadata {
    time: String,
}

#[derive(Debug, Deserialize)]
struct Uplink {
    dev_id: String,
    metadata: UplinkMetadata,
    payload_raw: String,
}

/// One decoded counter reading, ready for the ingest buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Sensor id resolved from the device's slot table.
    pub sid: String,
    /// UNIX timestamp of the reading.
    pub t: u32,
    /// Counter value.
    pub v: Sample,
    /// Unit from the sensor config, carried into the block's cfg snapshot.
    pub unit: String,
}

/// Decodes an uplink payload into readings.
///
/// # Errors
///
/// An unparseable payload or an unknown device serial drops the whole
/// uplink ([`TmpoError::BadUplink`] / [`TmpoError::UnknownDevice`]). Slots
/// without an enabled sensor are skipped individually so one disabled
/// channel does not silence the rest of the frame.
pub fn decode(payload: &[u8], registry: &Registry) -> Result<Vec<Reading>> {
    let uplink: Uplink =
        serde_json::from_slice(payload).map_err(|err| TmpoError::BadUplink(err.to_string()))?;

    let t = DateTime::parse_from_rfc3339(&uplink.metadata.time)
        .map_err(|err| TmpoError::BadUplink(format!("bad time: {err}")))?
        .timestamp();
    let t = u32::try_from(t).map_err(|_| TmpoError::BadUplink(format!("time out of range: {t}")))?;

    let frame = STANDARD
        .decode(&uplink.payload_raw)
        .map_err(|err| TmpoError::BadUplink(format!("bad payload: {err}")))?;
    if frame.len() != FRAME_LEN {
        return Err(TmpoError::BadUplink(format!(
            "payload is {} bytes, expected {FRAME_LEN}",
            frame.len()
        )));
    }

    let slots = registry
        .device_slots(&uplink.dev_id)
        .ok_or_else(|| TmpoError::UnknownDevice(uplink.dev_id.clone()))?;

    let mut readings = Vec::new();
    for (k, &slot) in UPLINK_SLOTS.iter().enumerate() {
        let counter = u32::from_be_bytes(frame[k * 4..k * 4 + 4].try_into().unwrap());
        if counter == 0 {
            continue;
        }
        let Some(params) = slots.get(&slot).and_then(|sid| registry.params(sid)) else {
            debug!(dev_id = %uplink.dev_id, slot, "uplink: no enabled sensor at slot");
            continue;
        };
        readings.push(Reading {
            sid: params.id.clone(),
            t,
            v: Sample::Int(counter as i64),
            unit: params.unit.clone().unwrap_or_default(),
        });
    }
    Ok(readings)
}
