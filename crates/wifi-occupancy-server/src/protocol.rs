//! Device wire protocol.
//!
//! One WebSocket carries both streams from the ESP32 node:
//!
//! - **binary** frames: a JPEG image from the camera
//! - **text** frames: JSON, dispatched on shape
//!   - `{"type":"csi","timestamp":..,"rssi":..,"len":..,"amplitudes":[..]}`
//!   - `{"type":"ping"}`
//!   - `{"status":"ok"|"error","message":..}` (device reply to a command)
//!   - `{"brightness":..,"contrast":..,"saturation":..,"quality":..}` (camera control)
//!
//! Messages may interleave in any order. Decoding never panics and never
//! returns a transport-level error: anything unusable becomes a
//! [`ProtocolError`] that the session acknowledges and moves past.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;

/// Raw message as received from the socket.
#[derive(Debug, Clone)]
pub enum RawMessage {
    /// Binary frame
    Binary(Bytes),
    /// Text frame
    Text(String),
}

/// Encoded camera frame, latest-wins per session.
#[derive(Debug, Clone)]
pub struct FrameMessage {
    /// Encoded image bytes (JPEG from the device)
    pub data: Bytes,
    /// Server arrival time
    pub received_at: DateTime<Utc>,
}

/// One CSI telemetry sample, latest-wins per session.
#[derive(Debug, Clone, PartialEq)]
pub struct CsiSample {
    /// Device-side timestamp (microseconds since boot on the ESP32)
    pub device_timestamp: u64,
    /// Received signal strength, dBm
    pub rssi: i32,
    /// Amplitude per subcarrier
    pub amplitudes: Vec<i32>,
    /// Server arrival time
    pub received_at: DateTime<Utc>,
}

impl CsiSample {
    /// Amplitudes as `f64` for feature extraction.
    pub fn amplitudes_f64(&self) -> Vec<f64> {
        self.amplitudes.iter().map(|&a| f64::from(a)).collect()
    }

    /// Number of subcarriers in this sample.
    pub fn subcarrier_count(&self) -> usize {
        self.amplitudes.len()
    }
}

/// Camera sensor adjustment. Absent fields are left unchanged on the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraControl {
    /// Brightness, -2..=2
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<i32>,
    /// Contrast, -2..=2
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contrast: Option<i32>,
    /// Saturation, -2..=2
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saturation: Option<i32>,
    /// JPEG quality, 0..=63 (lower is better)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<i32>,
}

impl CameraControl {
    /// Field names recognised on the wire.
    pub const FIELDS: [&'static str; 4] = ["brightness", "contrast", "saturation", "quality"];

    /// Settings pushed to a device when it connects.
    pub fn handshake_default() -> Self {
        Self {
            brightness: Some(1),
            contrast: Some(1),
            saturation: Some(1),
            quality: Some(8),
        }
    }

    /// `true` when no field is set.
    pub fn is_empty(&self) -> bool {
        self.brightness.is_none()
            && self.contrast.is_none()
            && self.saturation.is_none()
            && self.quality.is_none()
    }

    /// Check the values against the OV2640 sensor ranges.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.is_empty() {
            return Err(ProtocolError::NoSupportedFields);
        }
        let levels = [
            ("brightness", self.brightness),
            ("contrast", self.contrast),
            ("saturation", self.saturation),
        ];
        for (field, value) in levels {
            if let Some(v) = value {
                if !(-2..=2).contains(&v) {
                    return Err(ProtocolError::invalid_field(field, format!("{v} not in -2..=2")));
                }
            }
        }
        if let Some(q) = self.quality {
            if !(0..=63).contains(&q) {
                return Err(ProtocolError::invalid_field("quality", format!("{q} not in 0..=63")));
            }
        }
        Ok(())
    }

    /// Overlay the fields set in `other` on top of `self`.
    pub fn merge(&mut self, other: &CameraControl) {
        self.brightness = other.brightness.or(self.brightness);
        self.contrast = other.contrast.or(self.contrast);
        self.saturation = other.saturation.or(self.saturation);
        self.quality = other.quality.or(self.quality);
    }
}

/// Outcome field of replies in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    /// Success
    Ok,
    /// Failure
    Error,
}

/// Device acknowledgement of a command the server sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceReply {
    /// Outcome reported by the device
    pub status: String,
    /// Optional human-readable detail
    #[serde(default)]
    pub message: Option<String>,
}

impl DeviceReply {
    /// `true` when the device reported success.
    pub fn is_ok(&self) -> bool {
        self.status.eq_ignore_ascii_case("ok")
    }
}

/// A decoded inbound message.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// Camera frame
    Frame(FrameMessage),
    /// CSI telemetry
    Csi(CsiSample),
    /// Camera-control command
    Control(CameraControl),
    /// Reply to an earlier server command
    DeviceReply(DeviceReply),
    /// Application-level keepalive
    Ping,
}

impl Inbound {
    /// Short kind name for logs and counters.
    pub fn kind(&self) -> &'static str {
        match self {
            Inbound::Frame(_) => "frame",
            Inbound::Csi(_) => "csi",
            Inbound::Control(_) => "control",
            Inbound::DeviceReply(_) => "device_reply",
            Inbound::Ping => "ping",
        }
    }
}

/// Server → device text message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    /// `{"status":..,"message":..}`
    Ack {
        /// Outcome
        status: ReplyStatus,
        /// Detail
        message: String,
    },
    /// Camera settings for the device to apply
    Control(CameraControl),
    /// `{"type":"pong"}`
    Pong {
        /// Always `"pong"`
        #[serde(rename = "type")]
        kind: &'static str,
    },
}

impl Outbound {
    /// Success acknowledgement.
    pub fn ok(message: impl Into<String>) -> Self {
        Outbound::Ack {
            status: ReplyStatus::Ok,
            message: message.into(),
        }
    }

    /// Error acknowledgement.
    pub fn error(message: impl Into<String>) -> Self {
        Outbound::Ack {
            status: ReplyStatus::Error,
            message: message.into(),
        }
    }

    /// Keepalive reply.
    pub fn pong() -> Self {
        Outbound::Pong { kind: "pong" }
    }

    /// Encode as a JSON text frame body.
    pub fn to_json(&self) -> String {
        // Serialization of these shapes cannot fail; fall back to a fixed
        // error body rather than panicking.
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"status":"error","message":"encoding failed"}"#.to_string())
    }
}

/// Stateless decoder for device messages.
#[derive(Debug, Clone, Copy)]
pub struct WireCodec {
    max_subcarriers: usize,
}

impl WireCodec {
    /// Create a codec that rejects CSI samples longer than `max_subcarriers`.
    pub fn new(max_subcarriers: usize) -> Self {
        Self { max_subcarriers }
    }

    /// Decode one raw message received at `now`.
    pub fn decode(&self, raw: RawMessage, now: DateTime<Utc>) -> Result<Inbound, ProtocolError> {
        match raw {
            RawMessage::Binary(data) => Ok(Inbound::Frame(FrameMessage {
                data,
                received_at: now,
            })),
            RawMessage::Text(text) => self.decode_text(&text, now),
        }
    }

    /// Decode a text frame.
    pub fn decode_text(&self, text: &str, now: DateTime<Utc>) -> Result<Inbound, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson {
            detail: e.to_string(),
        })?;
        let obj = value.as_object().ok_or(ProtocolError::NotAnObject)?;

        if let Some(kind) = obj.get("type") {
            let kind = kind
                .as_str()
                .ok_or_else(|| ProtocolError::invalid_field("type", "must be a string"))?;
            return match kind {
                "csi" => self.decode_csi(obj, now).map(Inbound::Csi),
                "ping" => Ok(Inbound::Ping),
                other => Err(ProtocolError::UnknownType(other.to_string())),
            };
        }

        if let Some(status) = obj.get("status") {
            let status = status
                .as_str()
                .ok_or_else(|| ProtocolError::invalid_field("status", "must be a string"))?;
            return Ok(Inbound::DeviceReply(DeviceReply {
                status: status.to_string(),
                message: obj.get("message").and_then(Value::as_str).map(str::to_string),
            }));
        }

        decode_control(obj).map(Inbound::Control)
    }

    fn decode_csi(&self, obj: &Map<String, Value>, now: DateTime<Utc>) -> Result<CsiSample, ProtocolError> {
        let device_timestamp = match obj.get("timestamp") {
            None | Some(Value::Null) => 0,
            Some(v) => v
                .as_u64()
                .ok_or_else(|| ProtocolError::invalid_field("timestamp", "must be an unsigned integer"))?,
        };

        let rssi = obj
            .get("rssi")
            .ok_or(ProtocolError::MissingField("rssi"))?
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .ok_or_else(|| ProtocolError::invalid_field("rssi", "must be an integer"))?;

        let raw_amps = obj
            .get("amplitudes")
            .ok_or(ProtocolError::MissingField("amplitudes"))?
            .as_array()
            .ok_or_else(|| ProtocolError::invalid_field("amplitudes", "must be an array"))?;

        if raw_amps.is_empty() {
            return Err(ProtocolError::EmptyAmplitudes);
        }
        if raw_amps.len() > self.max_subcarriers {
            return Err(ProtocolError::TooManySubcarriers {
                actual: raw_amps.len(),
                max: self.max_subcarriers,
            });
        }

        let amplitudes = raw_amps
            .iter()
            .map(|v| v.as_i64().and_then(|a| i32::try_from(a).ok()))
            .collect::<Option<Vec<i32>>>()
            .ok_or_else(|| ProtocolError::invalid_field("amplitudes", "entries must be integers"))?;

        if let Some(len) = obj.get("len") {
            let declared = len
                .as_u64()
                .ok_or_else(|| ProtocolError::invalid_field("len", "must be an unsigned integer"))?
                as usize;
            if declared != amplitudes.len() {
                return Err(ProtocolError::LengthMismatch {
                    declared,
                    actual: amplitudes.len(),
                });
            }
        }

        Ok(CsiSample {
            device_timestamp,
            rssi,
            amplitudes,
            received_at: now,
        })
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Camera-control decoding follows the firmware: fields are checked in a
/// fixed order, the first non-numeric one is reported, and fractional values
/// are truncated.
fn decode_control(obj: &Map<String, Value>) -> Result<CameraControl, ProtocolError> {
    let mut control = CameraControl::default();
    for field in CameraControl::FIELDS {
        let Some(value) = obj.get(field) else {
            continue;
        };
        let number = value.as_f64().ok_or(ProtocolError::NonNumericField(field))?;
        let number = number.trunc().clamp(f64::from(i32::MIN), f64::from(i32::MAX)) as i32;
        match field {
            "brightness" => control.brightness = Some(number),
            "contrast" => control.contrast = Some(number),
            "saturation" => control.saturation = Some(number),
            _ => control.quality = Some(number),
        }
    }
    if control.is_empty() {
        return Err(ProtocolError::NoSupportedFields);
    }
    Ok(control)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> WireCodec {
        WireCodec::new(128)
    }

    fn text(s: &str) -> Result<Inbound, ProtocolError> {
        codec().decode(RawMessage::Text(s.to_string()), Utc::now())
    }

    #[test]
    fn test_binary_is_frame() {
        let msg = codec()
            .decode(RawMessage::Binary(Bytes::from_static(&[0xFF, 0xD8])), Utc::now())
            .unwrap();
        match msg {
            Inbound::Frame(f) => assert_eq!(f.data.len(), 2),
            other => panic!("expected frame, got {}", other.kind()),
        }
    }

    #[test]
    fn test_csi_sample() {
        let msg = text(r#"{"type":"csi","timestamp":123456,"rssi":-48,"len":4,"amplitudes":[3,9,12,7]}"#)
            .unwrap();
        let Inbound::Csi(sample) = msg else {
            panic!("expected csi");
        };
        assert_eq!(sample.device_timestamp, 123456);
        assert_eq!(sample.rssi, -48);
        assert_eq!(sample.amplitudes, vec![3, 9, 12, 7]);
        assert_eq!(sample.subcarrier_count(), 4);
    }

    #[test]
    fn test_csi_len_mismatch() {
        let err = text(r#"{"type":"csi","rssi":-48,"len":5,"amplitudes":[1,2]}"#).unwrap_err();
        assert_eq!(err, ProtocolError::LengthMismatch { declared: 5, actual: 2 });
    }

    #[test]
    fn test_csi_bounds() {
        assert_eq!(
            text(r#"{"type":"csi","rssi":-48,"amplitudes":[]}"#).unwrap_err(),
            ProtocolError::EmptyAmplitudes
        );
        let long = format!(
            r#"{{"type":"csi","rssi":-48,"amplitudes":[{}]}}"#,
            vec!["1"; 129].join(",")
        );
        assert!(matches!(
            text(&long).unwrap_err(),
            ProtocolError::TooManySubcarriers { actual: 129, max: 128 }
        ));
        assert_eq!(
            text(r#"{"type":"csi","amplitudes":[1]}"#).unwrap_err(),
            ProtocolError::MissingField("rssi")
        );
        assert!(matches!(
            text(r#"{"type":"csi","rssi":-40,"amplitudes":[1.5]}"#).unwrap_err(),
            ProtocolError::InvalidField { field: "amplitudes", .. }
        ));
    }

    #[test]
    fn test_malformed_json() {
        let err = text("{not json").unwrap_err();
        assert_eq!(err.to_string(), "Invalid JSON payload");
        assert_eq!(text("[1,2,3]").unwrap_err(), ProtocolError::NotAnObject);
    }

    #[test]
    fn test_unknown_type() {
        assert_eq!(
            text(r#"{"type":"telemetry"}"#).unwrap_err(),
            ProtocolError::UnknownType("telemetry".into())
        );
    }

    #[test]
    fn test_control_fields() {
        let Inbound::Control(c) = text(r#"{"brightness":2,"quality":10.9}"#).unwrap() else {
            panic!("expected control");
        };
        assert_eq!(c.brightness, Some(2));
        assert_eq!(c.quality, Some(10));
        assert_eq!(c.contrast, None);

        assert_eq!(
            text(r#"{"brightness":"high"}"#).unwrap_err().to_string(),
            "Field 'brightness' must be numeric"
        );
        assert_eq!(text(r#"{"zoom":3}"#).unwrap_err(), ProtocolError::NoSupportedFields);
    }

    #[test]
    fn test_device_reply_and_ping() {
        let Inbound::DeviceReply(r) =
            text(r#"{"status":"ok","message":"Camera parameters updated"}"#).unwrap()
        else {
            panic!("expected reply");
        };
        assert!(r.is_ok());
        assert!(matches!(text(r#"{"type":"ping"}"#).unwrap(), Inbound::Ping));
    }

    #[test]
    fn test_outbound_encoding() {
        assert_eq!(
            Outbound::error("Invalid JSON payload").to_json(),
            r#"{"status":"error","message":"Invalid JSON payload"}"#
        );
        assert_eq!(Outbound::pong().to_json(), r#"{"type":"pong"}"#);
        assert_eq!(
            Outbound::Control(CameraControl::handshake_default()).to_json(),
            r#"{"brightness":1,"contrast":1,"saturation":1,"quality":8}"#
        );
    }

    #[test]
    fn test_control_validation() {
        assert!(CameraControl::handshake_default().validate().is_ok());
        let bad = CameraControl {
            quality: Some(70),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        assert_eq!(
            CameraControl::default().validate().unwrap_err(),
            ProtocolError::NoSupportedFields
        );
    }
}
