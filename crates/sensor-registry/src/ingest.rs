//! Broadcast path: frame -> decoder -> registry -> completeness gate -> uplink.

use crate::decode::decode_section;
use crate::metrics::GatewayMetrics;
use crate::registry::{Device, Registry};
use crate::uplink::TelemetryEmitter;
use ble_transport::AdvertisementFrame;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    UnknownDevice,
    DeviceDisabled,
    /// No section matched the device's frame format.
    Unrecognized,
    /// Number of values written into the registry.
    Applied { readings: usize },
}

/// Schedule a display refresh for `device` on its UI context, then emit a record if
/// the completeness gate lets one through.
pub fn refresh_and_emit(device: &Arc<Device>, emitter: &TelemetryEmitter, at: OffsetDateTime) {
    let d = Arc::clone(device);
    let emitter = emitter.clone();
    device.ui().dispatch(Box::new(move |ui| {
        d.update_ui(ui, at);
        if d.claim_uplink(ui) {
            emitter.emit(&d, at);
        }
    }));
}

pub struct BroadcastIngest {
    registry: Arc<Registry>,
    emitter: TelemetryEmitter,
    metrics: Option<GatewayMetrics>,
}

impl BroadcastIngest {
    pub fn new(registry: Arc<Registry>, emitter: TelemetryEmitter) -> Self {
        Self {
            registry,
            emitter,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: GatewayMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Handle one received advertisement. Never fails; the outcome says what happened.
    pub fn on_frame(&self, frame: &AdvertisementFrame) -> FrameOutcome {
        if let Some(m) = &self.metrics {
            m.frames_received.inc();
        }
        let Some(device) = self.registry.device(frame.address) else {
            trace!(address = %frame.address, "frame from unconfigured device");
            return FrameOutcome::UnknownDevice;
        };
        // device flag gates every sensor regardless of their own flags
        if !device.enabled() {
            return FrameOutcome::DeviceDisabled;
        }

        let mut recognized = false;
        let mut applied = 0;
        for section in &frame.sections {
            let Some(readings) = decode_section(device.kind(), section) else {
                continue;
            };
            recognized = true;
            for reading in readings {
                match reading.value {
                    Some(v) if device.set_data(reading.kind, v) => applied += 1,
                    Some(_) => {}
                    None => debug!(address = %frame.address, sensor = ?reading.kind, "field missing from payload"),
                }
            }
        }
        if !recognized {
            return FrameOutcome::Unrecognized;
        }
        if let Some(m) = &self.metrics {
            m.frames_decoded.inc();
        }
        debug!(address = %frame.address, rssi = frame.rssi, applied, "frame decoded");
        if applied > 0 {
            refresh_and_emit(device, &self.emitter, frame.timestamp.0);
        }
        FrameOutcome::Applied { readings: applied }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::{addr, two_sensor_registry};
    use crate::uplink::{RecordingSink, RecordingUplink, TelemetryValue};
    use crate::{ui_queue, CommandAction, InlineDispatcher, MetricsHub, SensorKind, UiDispatcher};
    use ble_transport::DataSection;

    const ICE_BLUE: u64 = 0xE832_C0E3_AA0F;

    fn tlm(battery: u16, temp: i16) -> DataSection {
        let mut p = vec![0xAA, 0xFE, 0x20, 0x00];
        p.extend_from_slice(&battery.to_be_bytes());
        p.extend_from_slice(&temp.to_be_bytes());
        DataSection::new(0x16, &p)
    }

    fn battery_only(battery: u16) -> DataSection {
        let mut p = vec![0xAA, 0xFE, 0x20, 0x00];
        p.extend_from_slice(&battery.to_be_bytes());
        DataSection::new(0x16, &p)
    }

    fn frame(section: DataSection) -> AdvertisementFrame {
        AdvertisementFrame::new(addr(ICE_BLUE), vec![section])
    }

    fn setup(ui: Arc<dyn UiDispatcher>) -> (BroadcastIngest, Arc<RecordingUplink>) {
        let registry = Arc::new(two_sensor_registry(ui));
        let uplink = Arc::new(RecordingUplink::default());
        let emitter = TelemetryEmitter::new(uplink.clone(), Arc::new(RecordingSink::default()), "gw");
        (BroadcastIngest::new(registry, emitter), uplink)
    }

    #[test]
    fn end_to_end_gate_waits_for_every_field() {
        let (ingest, uplink) = setup(Arc::new(InlineDispatcher));

        let out = ingest.on_frame(&frame(tlm(3200, 0x0190)));
        assert_eq!(out, FrameOutcome::Applied { readings: 2 });
        let records = uplink.records();
        assert_eq!(records.len(), 1);
        let fields = &records[0].fields;
        assert_eq!(fields.get("E832C0E3AA0F_4"), Some(&TelemetryValue::F64(3200.0)));
        assert_eq!(fields.get("E832C0E3AA0F_0"), Some(&TelemetryValue::F64(1.5625)));
        assert_eq!(
            fields.get("E832C0E3AA0F_4_meta"),
            Some(&TelemetryValue::Text("Left side height 1m from floor".into()))
        );

        let out = ingest.on_frame(&frame(battery_only(3100)));
        assert_eq!(out, FrameOutcome::Applied { readings: 1 });
        assert_eq!(uplink.records().len(), 1);

        ingest.on_frame(&frame(tlm(3100, 0x0200)));
        let records = uplink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].fields.get("E832C0E3AA0F_0"), Some(&TelemetryValue::F64(2.0)));
    }

    #[test]
    fn short_payload_writes_nothing() {
        let (ingest, uplink) = setup(Arc::new(InlineDispatcher));
        let short = DataSection::new(0x16, &[0xAA, 0xFE, 0x20, 0x00, 0x0C]);
        assert_eq!(ingest.on_frame(&frame(short)), FrameOutcome::Applied { readings: 0 });
        let dev = &ingest.registry().devices()[0];
        assert!(dev.sensors().iter().all(|s| s.received().is_none()));
        assert!(dev.last_update().is_none());
        assert!(uplink.records().is_empty());
    }

    #[test]
    fn unknown_disabled_and_foreign_frames() {
        let (ingest, _) = setup(Arc::new(InlineDispatcher));
        let stranger = AdvertisementFrame::new(addr(0x1234), vec![tlm(3200, 0)]);
        assert_eq!(ingest.on_frame(&stranger), FrameOutcome::UnknownDevice);

        let foreign = DataSection::new(0xFF, &[0u8; 22]);
        assert_eq!(ingest.on_frame(&frame(foreign)), FrameOutcome::Unrecognized);

        ingest.registry().devices()[0].perform_action(CommandAction::Disable);
        assert_eq!(ingest.on_frame(&frame(tlm(3200, 0))), FrameOutcome::DeviceDisabled);
    }

    #[test]
    fn disabled_device_gates_individually_enabled_sensors() {
        let (ingest, uplink) = setup(Arc::new(InlineDispatcher));
        let dev = Arc::clone(&ingest.registry().devices()[0]);
        dev.perform_action(CommandAction::Disable);
        dev.sensor(SensorKind::Temperature)
            .unwrap()
            .perform_action(CommandAction::Enable);
        assert!(dev.sensor(SensorKind::Temperature).unwrap().enabled());

        assert_eq!(ingest.on_frame(&frame(tlm(3200, 0x0190))), FrameOutcome::DeviceDisabled);
        assert!(uplink.records().is_empty());

        dev.perform_action(CommandAction::Enable);
        assert_eq!(
            ingest.on_frame(&frame(tlm(3200, 0x0190))),
            FrameOutcome::Applied { readings: 2 }
        );
        assert_eq!(uplink.records().len(), 1);
    }

    #[test]
    fn display_waits_for_the_ui_loop() {
        let (dispatcher, queue) = ui_queue();
        let (ingest, uplink) = setup(Arc::new(dispatcher));
        ingest.on_frame(&frame(tlm(3200, 0x0190)));
        let dev = Arc::clone(&ingest.registry().devices()[0]);
        assert_eq!(dev.sensor(SensorKind::BatteryVoltage).unwrap().received(), Some(3200.0));
        assert_eq!(dev.sensor(SensorKind::BatteryVoltage).unwrap().displayed(), None);
        assert!(uplink.records().is_empty());

        assert_eq!(queue.run_pending(), 1);
        assert_eq!(dev.sensor(SensorKind::BatteryVoltage).unwrap().displayed(), Some(3200.0));
        assert_eq!(uplink.records().len(), 1);
    }

    #[test]
    fn uplink_failure_does_not_undo_the_update() {
        let (ingest, uplink) = setup(Arc::new(InlineDispatcher));
        let hub = MetricsHub::new().unwrap();
        let ingest = BroadcastIngest::new(
            Arc::clone(ingest.registry()),
            TelemetryEmitter::new(uplink.clone(), Arc::new(RecordingSink::default()), "gw")
                .with_metrics(hub.gw.clone()),
        )
        .with_metrics(hub.gw.clone());
        uplink.set_failing(true);
        let out = ingest.on_frame(&frame(tlm(3200, 0x0190)));
        assert_eq!(out, FrameOutcome::Applied { readings: 2 });
        let dev = &ingest.registry().devices()[0];
        assert_eq!(dev.sensor(SensorKind::Temperature).unwrap().displayed(), Some(1.5625));
        assert_eq!(hub.gw.uplink_failed.get(), 1);
        assert_eq!(hub.gw.frames_decoded.get(), 1);
    }
}
