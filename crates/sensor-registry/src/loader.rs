use crate::command::decode_address;
use crate::registry::{DeviceSpec, Registry};
use crate::types::{DeviceDescriptor, GatewayConfig, PolledChannel};
use crate::ui::UiDispatcher;
use anyhow::{bail, Context};
use ble_transport::{BleAddress, ChannelId, ServiceId};
use serde_yaml::Value;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub fn load_gateway_file(path: impl AsRef<Path>) -> anyhow::Result<GatewayConfig> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading gateway config: {}", path.display()))?;
    parse_gateway_str(&raw).with_context(|| format!("loading gateway config: {}", path.display()))
}

pub fn parse_gateway_str(raw: &str) -> anyhow::Result<GatewayConfig> {
    let val: Value = serde_yaml::from_str(raw).context("parsing yaml")?;
    let cfg: GatewayConfig = serde_yaml::from_value(val).context("decoding gateway config")?;
    validate(&cfg)?;
    Ok(cfg)
}

pub fn device_address(desc: &DeviceDescriptor) -> anyhow::Result<BleAddress> {
    match BleAddress::new(decode_address(&desc.address)) {
        Some(a) => Ok(a),
        None => bail!("device '{}': invalid address '{}'", desc.name, desc.address),
    }
}

fn validate(cfg: &GatewayConfig) -> anyhow::Result<()> {
    if cfg.polling.attempts == 0 {
        bail!("polling.attempts must be at least 1");
    }
    if cfg.polling.interval_secs == 0 {
        bail!("polling.interval_secs must be at least 1");
    }
    let mut seen = HashSet::new();
    for desc in &cfg.devices {
        let address = device_address(desc)?;
        if !seen.insert(address) {
            bail!("device '{}': duplicate address {address}", desc.name);
        }
        let mut kinds = HashSet::new();
        for s in &desc.sensors {
            if !kinds.insert(s.kind) {
                bail!("device '{}': sensor {:?} declared twice", desc.name, s.kind);
            }
        }
        polled_channels(desc)?;
    }
    Ok(())
}

fn parse_service(s: &str) -> Option<ServiceId> {
    ServiceId::parse(s).or_else(|| parse_short(s).map(ServiceId::from_short))
}

fn parse_channel(s: &str) -> Option<ChannelId> {
    ChannelId::parse(s).or_else(|| parse_short(s).map(ChannelId::from_short))
}

/// 16-bit assigned numbers such as `180F` or `0x2A19`.
fn parse_short(s: &str) -> Option<u16> {
    let s = s.trim();
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    if digits.len() != 4 {
        return None;
    }
    u16::from_str_radix(digits, 16).ok()
}

/// Resolve the polled channel table of one device.
pub fn polled_channels(desc: &DeviceDescriptor) -> anyhow::Result<Vec<PolledChannel>> {
    let mut out = Vec::with_capacity(desc.polled.len());
    for p in &desc.polled {
        if !desc.sensors.iter().any(|s| s.kind == p.sensor) {
            bail!(
                "device '{}': polled channel for undeclared sensor {:?}",
                desc.name,
                p.sensor
            );
        }
        let service = parse_service(&p.service).with_context(|| {
            format!("device '{}': bad service id '{}'", desc.name, p.service)
        })?;
        let data = parse_channel(&p.data)
            .with_context(|| format!("device '{}': bad data channel '{}'", desc.name, p.data))?;
        let config = match &p.config {
            Some(c) => Some(parse_channel(c).with_context(|| {
                format!("device '{}': bad config channel '{c}'", desc.name)
            })?),
            None => None,
        };
        out.push(PolledChannel {
            sensor: p.sensor,
            service,
            data,
            config,
            converter: p.converter,
        });
    }
    Ok(out)
}

pub fn build_registry(cfg: &GatewayConfig, ui: Arc<dyn UiDispatcher>) -> anyhow::Result<Registry> {
    let mut builder = Registry::builder(ui);
    for desc in &cfg.devices {
        let spec = DeviceSpec {
            address: device_address(desc)?,
            name: desc.name.clone(),
            description: desc.description.clone(),
            kind: desc.kind,
            sensors: desc
                .sensors
                .iter()
                .map(|s| {
                    let name = if s.name.is_empty() {
                        s.kind.name().to_string()
                    } else {
                        s.name.clone()
                    };
                    (s.kind, name)
                })
                .collect(),
        };
        builder = builder.device(spec)?;
    }
    let registry = builder.build();
    info!(devices = registry.devices().len(), "registry built");
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConverterKind, DeviceKind, InlineDispatcher, SensorKind};

    const SAMPLE: &str = r#"
device_id: lab-gateway
devices:
  - name: Ice blue
    description: Left side height 1m from floor
    address: "0xE832C0E3AA0F"
    kind: eddystone_tlm
    sensors:
      - { kind: battery_voltage, name: Battery level in mV }
      - { kind: temperature }
  - name: SensorBug
    description: On the floor
    address: "EC:FE:7E:10:9D:7E"
    kind: generic_polled
    sensors:
      - { kind: battery_percent }
      - { kind: temperature }
    polled:
      - sensor: temperature
        service: 9dc84838-7619-4f09-a1ce-ddcf63225b30
        data: 9dc84838-7619-4f09-a1ce-ddcf63225b32
        config: 9dc84838-7619-4f09-a1ce-ddcf63225b31
        converter: temperature
      - sensor: battery_percent
        service: "180F"
        data: "2A19"
        converter: battery_level
"#;

    #[test]
    fn parses_sample_with_defaults() {
        let cfg = parse_gateway_str(SAMPLE).unwrap();
        assert_eq!(cfg.device_id, "lab-gateway");
        assert_eq!(cfg.config_version, "1.1.5");
        assert_eq!(cfg.polling.interval_secs, 30);
        assert_eq!(cfg.polling.attempts, 5);
        assert_eq!(cfg.polling.spacing_ms, 100);
        assert_eq!(cfg.devices.len(), 2);
        assert_eq!(cfg.devices[1].kind, DeviceKind::GenericPolled);

        let channels = polled_channels(&cfg.devices[1]).unwrap();
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].converter, ConverterKind::Temperature);
        assert!(channels[0].config.is_some());
        assert_eq!(channels[1].service, ServiceId::from_short(0x180F));
        assert_eq!(
            channels[1].data.to_string(),
            "00002a19-0000-1000-8000-00805f9b34fb"
        );
        assert!(channels[1].config.is_none());
    }

    #[test]
    fn builds_registry_with_default_sensor_names() {
        let cfg = parse_gateway_str(SAMPLE).unwrap();
        let reg = build_registry(&cfg, Arc::new(InlineDispatcher)).unwrap();
        let bug = reg
            .device(BleAddress::new(0xECFE_7E10_9D7E).unwrap())
            .unwrap();
        assert_eq!(bug.description(), "On the floor");
        assert_eq!(bug.sensor(SensorKind::Temperature).unwrap().name(), "Temperature");
        let ice = &reg.devices()[0];
        assert_eq!(
            ice.sensor(SensorKind::BatteryVoltage).unwrap().name(),
            "Battery level in mV"
        );
    }

    #[test]
    fn rejects_bad_configs() {
        let dup = SAMPLE.replace("EC:FE:7E:10:9D:7E", "0xE832C0E3AA0F");
        let err = parse_gateway_str(&dup).unwrap_err();
        assert!(format!("{err:#}").contains("duplicate address"));

        let bad = SAMPLE.replace("\"0xE832C0E3AA0F\"", "\"not-an-address\"");
        assert!(parse_gateway_str(&bad).is_err());

        let orphan = SAMPLE.replace("sensor: battery_percent", "sensor: humidity");
        let err = parse_gateway_str(&orphan).unwrap_err();
        assert!(format!("{err:#}").contains("undeclared sensor"));

        let twice = SAMPLE.replace("{ kind: battery_percent }", "{ kind: temperature }");
        assert!(parse_gateway_str(&twice).is_err());

        assert!(parse_gateway_str("devices: [ { name: x } ]").is_err());
    }

    #[test]
    fn shipped_config_loads() {
        let cfg = parse_gateway_str(include_str!("../../../configs/gateway.yaml")).unwrap();
        assert_eq!(cfg.devices.len(), 3);
        let reg = build_registry(&cfg, Arc::new(InlineDispatcher)).unwrap();
        let blukii = reg
            .device(BleAddress::new(0x2471_894D_AF5A).unwrap())
            .unwrap();
        assert_eq!(blukii.sensors().len(), 5);
        let bug = cfg.devices.iter().find(|d| d.name == "SensorBug").unwrap();
        let channels = polled_channels(bug).unwrap();
        assert_eq!(channels[1].converter, ConverterKind::RangeScaled);
    }

    #[test]
    fn missing_file_has_context() {
        let err = load_gateway_file("/nonexistent/gateway.yaml").unwrap_err();
        assert!(format!("{err:#}").contains("reading gateway config"));
    }
}
