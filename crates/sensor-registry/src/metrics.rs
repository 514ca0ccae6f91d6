use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

#[derive(Clone)]
pub struct GatewayMetrics {
    pub frames_received: IntCounter,
    pub frames_decoded: IntCounter,
    pub uplink_sent: IntCounter,
    pub uplink_failed: IntCounter,
    pub commands_rejected: IntCounter,
    pub acquisition_cycles: IntCounter,
    pub devices_loaded: IntGauge,
}

#[derive(Clone)]
pub struct MetricsHub {
    pub registry: Registry,
    pub gw: GatewayMetrics,
}

fn counter(name: &str, help: &str) -> Result<IntCounter, String> {
    IntCounter::new(name, help).map_err(|e| format!("metrics init error: {e}"))
}

impl MetricsHub {
    pub fn new() -> Result<Self, String> {
        let registry = Registry::new();
        let gw = GatewayMetrics {
            frames_received: counter("bgw_frames_received", "Advertisement frames received")?,
            frames_decoded: counter("bgw_frames_decoded", "Frames decoded into readings")?,
            uplink_sent: counter("bgw_uplink_sent", "Telemetry records sent")?,
            uplink_failed: counter("bgw_uplink_failed", "Uplink send failures")?,
            commands_rejected: counter("bgw_commands_rejected", "Remote commands that failed to resolve")?,
            acquisition_cycles: counter("bgw_acquisition_cycles", "Polled acquisition cycles completed")?,
            devices_loaded: IntGauge::new("bgw_devices_loaded", "Number of configured devices")
                .map_err(|e| format!("metrics init error: {e}"))?,
        };
        let _ = registry.register(Box::new(gw.frames_received.clone()));
        let _ = registry.register(Box::new(gw.frames_decoded.clone()));
        let _ = registry.register(Box::new(gw.uplink_sent.clone()));
        let _ = registry.register(Box::new(gw.uplink_failed.clone()));
        let _ = registry.register(Box::new(gw.commands_rejected.clone()));
        let _ = registry.register(Box::new(gw.acquisition_cycles.clone()));
        let _ = registry.register(Box::new(gw.devices_loaded.clone()));
        Ok(Self { registry, gw })
    }

    pub fn encode_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            return format!("error encoding metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
