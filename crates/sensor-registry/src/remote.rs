//! Inbound remote methods: `config`, `sensor` and `deviceupdate`.

use crate::command::{dispatch, resolve_device_command, resolve_sensor_command, CommandDecodeError};
use crate::metrics::GatewayMetrics;
use crate::registry::Registry;
use crate::uplink::TelemetryEmitter;
use serde::Deserialize;
use std::cmp::Ordering;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

pub const CONFIG_TOPIC: &str = "config";
pub const ALARM_TOPIC: &str = "alarm";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodResponse {
    pub status: u16,
}

impl MethodResponse {
    pub const OK: MethodResponse = MethodResponse { status: 200 };
    pub const NOT_IMPLEMENTED: MethodResponse = MethodResponse { status: 501 };
}

#[derive(Debug, Default, Deserialize)]
struct CommandPayload {
    #[serde(default)]
    bluetoothaddress: Option<String>,
    #[serde(default)]
    sensortype: Option<String>,
    #[serde(default)]
    action: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConfigPayload {
    version: serde_json::Value,
}

/// Compare dotted versions numerically when both sides are all digits, else as text.
pub fn is_newer_version(candidate: &str, current: &str) -> bool {
    fn numeric(v: &str) -> Option<Vec<u64>> {
        v.trim().split('.').map(|p| p.parse::<u64>().ok()).collect()
    }
    match (numeric(candidate), numeric(current)) {
        (Some(a), Some(b)) => {
            let len = a.len().max(b.len());
            for i in 0..len {
                let x = a.get(i).copied().unwrap_or(0);
                let y = b.get(i).copied().unwrap_or(0);
                match x.cmp(&y) {
                    Ordering::Equal => continue,
                    other => return other == Ordering::Greater,
                }
            }
            false
        }
        _ => candidate.trim() > current.trim(),
    }
}

/// Handles remote method calls against the registry.
///
/// Every known method answers 200; anything that goes wrong is relayed on the alarm
/// topic instead of the response.
pub struct CommandHandler {
    registry: Arc<Registry>,
    emitter: TelemetryEmitter,
    version: Mutex<String>,
    metrics: Option<GatewayMetrics>,
}

impl CommandHandler {
    pub fn new(
        registry: Arc<Registry>,
        emitter: TelemetryEmitter,
        version: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            emitter,
            version: Mutex::new(version.into()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: GatewayMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn version(&self) -> String {
        match self.version.lock() {
            Ok(v) => v.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn handle(&self, method: &str, payload: &str) -> MethodResponse {
        debug!(method, payload, "remote method");
        match method {
            "config" => {
                self.on_config(payload);
                MethodResponse::OK
            }
            "sensor" => {
                self.on_command(payload, true);
                MethodResponse::OK
            }
            "deviceupdate" => {
                self.on_command(payload, false);
                MethodResponse::OK
            }
            other => {
                warn!(method = other, "unknown remote method");
                MethodResponse::NOT_IMPLEMENTED
            }
        }
    }

    fn on_config(&self, payload: &str) {
        self.emitter
            .sink()
            .event("Receiving cloud to device message OnConfigchanged");
        let parsed: ConfigPayload = match serde_json::from_str(payload) {
            Ok(p) => p,
            Err(e) => {
                self.alarm(&format!("Exception OnConfigchanged {e} data {payload}"));
                return;
            }
        };
        let candidate = match parsed.version {
            serde_json::Value::String(s) => s,
            serde_json::Value::Number(n) => n.to_string(),
            other => {
                self.alarm(&format!(
                    "Exception OnConfigchanged unsupported version {other} data {payload}"
                ));
                return;
            }
        };

        let text = {
            let mut current = match self.version.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            if is_newer_version(&candidate, &current) {
                info!(from = %current.as_str(), to = %candidate, "configuration version updated");
                *current = candidate.clone();
                format!("Configuration updated to version {candidate}")
            } else {
                format!("no update required, already on {}", *current)
            }
        };
        self.emitter.sink().event(&text);
        self.emitter.publish(CONFIG_TOPIC, &text);
    }

    fn on_command(&self, payload: &str, with_sensor: bool) {
        let label = if with_sensor {
            "OnSensorChanged"
        } else {
            "OnDeviceChanged"
        };
        self.emitter
            .sink()
            .event(&format!("Receiving cloud to device message {label}"));
        let parsed: CommandPayload = match serde_json::from_str(payload) {
            Ok(p) => p,
            Err(e) => {
                self.reject();
                self.alarm(&format!("Exception {label} {e} data {payload}"));
                return;
            }
        };
        let address = parsed.bluetoothaddress.unwrap_or_default();
        let action = parsed.action.unwrap_or_default();
        let resolved = if with_sensor {
            let sensor = parsed.sensortype.unwrap_or_default();
            resolve_sensor_command(&self.registry, &address, &sensor, &action)
        } else {
            resolve_device_command(&self.registry, &address, &action)
        };
        match resolved {
            Ok(command) => {
                let outcome = dispatch(&command);
                info!(?command, ?outcome, "remote command applied");
            }
            Err(e) => self.report(&e),
        }
    }

    fn report(&self, error: &CommandDecodeError) {
        self.reject();
        let text = error.to_string();
        warn!(problems = error.problems.len(), "remote command rejected");
        self.emitter.sink().event(&text);
        self.alarm(&text);
    }

    fn reject(&self) {
        if let Some(m) = &self.metrics {
            m.commands_rejected.inc();
        }
    }

    fn alarm(&self, text: &str) {
        self.emitter.publish(ALARM_TOPIC, text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::two_sensor_registry;
    use crate::uplink::{RecordingSink, RecordingUplink};
    use crate::{InlineDispatcher, MetricsHub, SensorKind};

    struct Fixture {
        handler: CommandHandler,
        registry: Arc<Registry>,
        uplink: Arc<RecordingUplink>,
        hub: MetricsHub,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(two_sensor_registry(Arc::new(InlineDispatcher)));
        let uplink = Arc::new(RecordingUplink::default());
        let sink = Arc::new(RecordingSink::default());
        let hub = MetricsHub::new().unwrap();
        let emitter = TelemetryEmitter::new(uplink.clone(), sink, "gw");
        let handler = CommandHandler::new(registry.clone(), emitter, "1.1.5")
            .with_metrics(hub.gw.clone());
        Fixture {
            handler,
            registry,
            uplink,
            hub,
        }
    }

    #[test]
    fn versions() {
        assert!(is_newer_version("1.1.6", "1.1.5"));
        assert!(is_newer_version("1.10", "1.9"));
        assert!(is_newer_version("2", "1.9.9"));
        assert!(!is_newer_version("1.1.5", "1.1.5"));
        assert!(!is_newer_version("1.1.5.0", "1.1.5"));
        assert!(!is_newer_version("1.1.4", "1.1.5"));
        assert!(is_newer_version("beta", "alpha"));
    }

    #[test]
    fn config_updates_only_to_newer_versions() {
        let f = fixture();
        assert_eq!(f.handler.handle("config", r#"{"version":"1.2.0"}"#), MethodResponse::OK);
        assert_eq!(f.handler.version(), "1.2.0");
        assert_eq!(f.handler.handle("config", r#"{"version":"1.1.9"}"#), MethodResponse::OK);
        assert_eq!(f.handler.version(), "1.2.0");

        let msgs = f.uplink.messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].topic, "config");
        assert_eq!(msgs[0].text, "Configuration updated to version 1.2.0");
        assert_eq!(msgs[1].text, "no update required, already on 1.2.0");
    }

    #[test]
    fn numeric_config_version_is_accepted() {
        let f = fixture();
        f.handler.handle("config", r#"{"version":2}"#);
        assert_eq!(f.handler.version(), "2");
    }

    #[test]
    fn malformed_payload_raises_alarm_but_succeeds() {
        let f = fixture();
        assert_eq!(f.handler.handle("config", "not json"), MethodResponse::OK);
        assert_eq!(f.handler.version(), "1.1.5");
        let msgs = f.uplink.messages();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].topic, "alarm");
        assert!(msgs[0].text.starts_with("Exception OnConfigchanged"));
    }

    #[test]
    fn sensor_command_is_applied() {
        let f = fixture();
        let payload = r#"{"bluetoothaddress":"0xE832C0E3AA0F","sensortype":"temp","action":"dis"}"#;
        assert_eq!(f.handler.handle("sensor", payload), MethodResponse::OK);
        let dev = &f.registry.devices()[0];
        assert!(!dev.sensor(SensorKind::Temperature).unwrap().enabled());
        assert!(dev.sensor(SensorKind::BatteryVoltage).unwrap().enabled());
        assert!(f.uplink.messages().is_empty());
    }

    #[test]
    fn device_update_cascades() {
        let f = fixture();
        let payload = r#"{"bluetoothaddress":"E832C0E3AA0F","action":"disable"}"#;
        assert_eq!(f.handler.handle("deviceupdate", payload), MethodResponse::OK);
        let dev = &f.registry.devices()[0];
        assert!(!dev.enabled());
        assert!(dev.sensors().iter().all(|s| !s.enabled()));
    }

    #[test]
    fn unresolved_command_goes_to_alarm_topic() {
        let f = fixture();
        let payload = r#"{"bluetoothaddress":"0x1234","action":"enable"}"#;
        assert_eq!(f.handler.handle("deviceupdate", payload), MethodResponse::OK);
        let msgs = f.uplink.messages();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].topic, "alarm");
        assert_eq!(
            msgs[0].text,
            "Error decoding sensor changed command:\nNo device for bluetooth address 0x1234\n"
        );
        assert_eq!(f.hub.gw.commands_rejected.get(), 1);
    }

    #[test]
    fn missing_fields_are_reported_as_empty() {
        let f = fixture();
        f.handler.handle("sensor", "{}");
        let msgs = f.uplink.messages();
        assert!(msgs[0].text.contains("Argument bluetooth address is empty"));
        assert!(msgs[0].text.contains("Argument action is empty"));
    }

    #[test]
    fn unknown_method() {
        let f = fixture();
        assert_eq!(f.handler.handle("reboot", "{}").status, 501);
    }
}
