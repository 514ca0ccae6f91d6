//! Outbound telemetry records and the collaborator traits the core calls.

use crate::metrics::GatewayMetrics;
use crate::registry::Device;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TelemetryValue {
    F64(f64),
    Text(String),
}

/// One telemetry record as it goes on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UplinkRecord {
    pub timestamp: String,
    pub deviceid: String,
    #[serde(flatten)]
    pub fields: BTreeMap<String, TelemetryValue>,
}

fn rfc3339(at: OffsetDateTime) -> String {
    at.format(&Rfc3339)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

/// Key for one sensor value: `<prefix><ADDRESS HEX>_<ordinal>`.
pub fn telemetry_key(prefix: &str, device: &Device, ordinal: u8) -> String {
    format!("{prefix}{:X}_{ordinal}", device.address().raw())
}

/// Build the record for every enabled sensor holding a displayed value.
pub fn build_record(
    device: &Device,
    device_id: &str,
    key_prefix: &str,
    at: OffsetDateTime,
) -> UplinkRecord {
    let mut fields = BTreeMap::new();
    for sensor in device.sensors().iter().filter(|s| s.enabled()) {
        let Some(value) = sensor.displayed() else {
            continue;
        };
        let key = telemetry_key(key_prefix, device, sensor.kind().ordinal());
        fields.insert(
            format!("{key}_meta"),
            TelemetryValue::Text(device.description().to_string()),
        );
        fields.insert(key, TelemetryValue::F64(value));
    }
    UplinkRecord {
        timestamp: rfc3339(at.to_offset(time::UtcOffset::UTC)),
        deviceid: device_id.to_string(),
        fields,
    }
}

/// Free-text message published under a topic key (`config`, `alarm`).
#[derive(Debug, Clone, PartialEq)]
pub struct CloudMessage {
    pub time: OffsetDateTime,
    pub device_id: String,
    pub topic: String,
    pub text: String,
}

impl CloudMessage {
    pub fn new(device_id: &str, topic: &str, text: impl Into<String>) -> Self {
        Self {
            time: OffsetDateTime::now_utc(),
            device_id: device_id.to_string(),
            topic: topic.to_string(),
            text: text.into(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert("time".into(), rfc3339(self.time).into());
        map.insert("deviceId".into(), self.device_id.clone().into());
        map.insert(self.topic.clone(), self.text.clone().into());
        serde_json::Value::Object(map)
    }
}

#[derive(Debug, Error)]
pub enum UplinkError {
    #[error("uplink send failed: {0}")]
    Send(String),
    #[error("encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cloud side of the gateway.
pub trait UplinkSender: Send + Sync {
    fn send_telemetry(&self, record: &UplinkRecord) -> Result<(), UplinkError>;
    fn send_message(&self, message: &CloudMessage) -> Result<(), UplinkError>;
}

/// Human-readable notices for whoever is watching the gateway.
pub trait MessageSink: Send + Sync {
    fn event(&self, text: &str);
    fn telemetry(&self, text: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MessageSink for TracingSink {
    fn event(&self, text: &str) {
        info!(target: "bgw::event", "{text}");
    }

    fn telemetry(&self, text: &str) {
        info!(target: "bgw::telemetry", "{text}");
    }
}

/// Keeps every notice in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<String>>,
    telemetry: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn telemetry_notices(&self) -> Vec<String> {
        self.telemetry.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

impl MessageSink for RecordingSink {
    fn event(&self, text: &str) {
        if let Ok(mut g) = self.events.lock() {
            g.push(text.to_string());
        }
    }

    fn telemetry(&self, text: &str) {
        if let Ok(mut g) = self.telemetry.lock() {
            g.push(text.to_string());
        }
    }
}

/// In-memory uplink; can be switched into a failing mode.
#[derive(Debug, Default)]
pub struct RecordingUplink {
    records: Mutex<Vec<UplinkRecord>>,
    messages: Mutex<Vec<CloudMessage>>,
    failing: AtomicBool,
}

impl RecordingUplink {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<UplinkRecord> {
        self.records.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn messages(&self) -> Vec<CloudMessage> {
        self.messages.lock().map(|g| g.clone()).unwrap_or_default()
    }

    fn check(&self) -> Result<(), UplinkError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(UplinkError::Send("connection refused".into()));
        }
        Ok(())
    }
}

impl UplinkSender for RecordingUplink {
    fn send_telemetry(&self, record: &UplinkRecord) -> Result<(), UplinkError> {
        self.check()?;
        if let Ok(mut g) = self.records.lock() {
            g.push(record.clone());
        }
        Ok(())
    }

    fn send_message(&self, message: &CloudMessage) -> Result<(), UplinkError> {
        self.check()?;
        if let Ok(mut g) = self.messages.lock() {
            g.push(message.clone());
        }
        Ok(())
    }
}

/// Writes each record or message as one JSON line.
pub struct JsonLinesUplink<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesUplink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_line(&self, value: &serde_json::Value) -> Result<(), UplinkError> {
        let line = serde_json::to_string(value)?;
        let mut out = self
            .out
            .lock()
            .map_err(|_| UplinkError::Send("writer poisoned".into()))?;
        writeln!(out, "{line}")?;
        out.flush()?;
        Ok(())
    }
}

impl<W: Write + Send> UplinkSender for JsonLinesUplink<W> {
    fn send_telemetry(&self, record: &UplinkRecord) -> Result<(), UplinkError> {
        self.write_line(&serde_json::to_value(record)?)
    }

    fn send_message(&self, message: &CloudMessage) -> Result<(), UplinkError> {
        self.write_line(&message.to_json())
    }
}

/// Sends gated telemetry records and reports the outcome on the side channel.
#[derive(Clone)]
pub struct TelemetryEmitter {
    sender: Arc<dyn UplinkSender>,
    sink: Arc<dyn MessageSink>,
    device_id: String,
    key_prefix: String,
    metrics: Option<GatewayMetrics>,
}

impl TelemetryEmitter {
    pub fn new(
        sender: Arc<dyn UplinkSender>,
        sink: Arc<dyn MessageSink>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            sender,
            sink,
            device_id: device_id.into(),
            key_prefix: String::new(),
            metrics: None,
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_metrics(mut self, metrics: GatewayMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn sender(&self) -> &Arc<dyn UplinkSender> {
        &self.sender
    }

    pub fn sink(&self) -> &Arc<dyn MessageSink> {
        &self.sink
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Send one record for `device`. Failures are reported, never returned.
    pub fn emit(&self, device: &Device, at: OffsetDateTime) -> bool {
        let record = build_record(device, &self.device_id, &self.key_prefix, at);
        match self.sender.send_telemetry(&record) {
            Ok(()) => {
                if let Some(m) = &self.metrics {
                    m.uplink_sent.inc();
                }
                self.sink.telemetry(&format!(
                    "Success SendSensorData BLE {}",
                    device.name()
                ));
                true
            }
            Err(e) => {
                warn!(address = %device.address(), error = %e, "telemetry send failed");
                if let Some(m) = &self.metrics {
                    m.uplink_failed.inc();
                }
                self.sink.event(&format!("Exception SendSensorData {e}"));
                false
            }
        }
    }

    /// Publish a message under `topic`; a failure is reported on the sink only.
    pub fn publish(&self, topic: &str, text: &str) -> bool {
        let message = CloudMessage::new(&self.device_id, topic, text);
        match self.sender.send_message(&message) {
            Ok(()) => {
                self.sink
                    .event(&format!("Success Send topic {topic} message {text}"));
                true
            }
            Err(e) => {
                warn!(topic, error = %e, "message send failed");
                if let Some(m) = &self.metrics {
                    m.uplink_failed.inc();
                }
                self.sink
                    .event(&format!("Error Send topic {topic} message {text}"));
                self.sink.event(&e.to_string());
                false
            }
        }
    }
}
