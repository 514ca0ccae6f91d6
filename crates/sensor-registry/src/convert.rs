//! Value converters for polled GATT channels.

use crate::decode::{read_i16_le, round_half_even};
use crate::ConverterKind;
use ble_transport::{to_hex_string, TransportError};
use tracing::debug;

/// Access to the configuration channel that belongs to a data channel.
pub trait ConfigChannel {
    fn read_config(&mut self) -> Result<Vec<u8>, TransportError>;
    fn write_config(&mut self, data: &[u8]) -> Result<(), TransportError>;
}

/// Fails closed on a missing or short buffer and logs what was received.
pub fn validate(min_bytes: usize, data: Option<&[u8]>) -> bool {
    match data {
        None => {
            debug!("converter: no buffer");
            false
        }
        Some(d) if d.len() < min_bytes => {
            debug!(
                "converter: expected {min_bytes} bytes received {} bytes ({})",
                d.len(),
                to_hex_string(d)
            );
            false
        }
        Some(_) => true,
    }
}

pub trait ValueConverter: Send {
    /// One-time device setup before the first read. Returns whether the converter
    /// is now configured; `Ok(false)` means "try again next activation".
    fn configure(&mut self, _channel: &mut dyn ConfigChannel) -> Result<bool, TransportError> {
        Ok(true)
    }

    fn decode(&self, data: &[u8]) -> Option<f64>;
}

pub fn converter_for(kind: ConverterKind) -> Box<dyn ValueConverter> {
    match kind {
        ConverterKind::Temperature => Box::new(TemperatureConverter),
        ConverterKind::RangeScaled => Box::new(RangeScaledConverter::default()),
        ConverterKind::BatteryLevel => Box::new(BatteryLevelConverter),
    }
}

/// Signed LE count in units of 1/16 °C (count / 10 * 0.625).
#[derive(Debug, Default, Clone, Copy)]
pub struct TemperatureConverter;

impl ValueConverter for TemperatureConverter {
    fn decode(&self, data: &[u8]) -> Option<f64> {
        if !validate(1, Some(data)) {
            return None;
        }
        let raw = read_i16_le(data, 0)?;
        Some(round_half_even(f64::from(raw) / 10.0 * 0.625, 1))
    }
}

/// Battery service level: first byte is percent.
#[derive(Debug, Default, Clone, Copy)]
pub struct BatteryLevelConverter;

impl ValueConverter for BatteryLevelConverter {
    fn decode(&self, data: &[u8]) -> Option<f64> {
        if !validate(1, Some(data)) {
            return None;
        }
        Some(f64::from(data[0]))
    }
}

const RANGE_TABLE: [u32; 4] = [1000, 4000, 16000, 64000];
const RESOLUTION_MAX_TABLE: [u32; 4] = [65535, 4095, 255, 15];
const RANGE_SELECTOR_OFFSET: usize = 14;
const RANGE_SELECTOR: u8 = 3;
const RESOLUTION_SELECTOR_OFFSET: usize = 15;
const RESOLUTION_SELECTOR: u8 = 0;

/// Luminosity-style converter whose scale comes from a leading status byte.
///
/// Status byte layout: bits 0-1 data byte count, bits 2-3 range index, bits 4-5
/// resolution index. The indices are taken from the sample's status byte, not from
/// the selectors written during [`configure`](ValueConverter::configure).
#[derive(Debug, Default)]
pub struct RangeScaledConverter {
    configured: bool,
}

impl RangeScaledConverter {
    pub fn is_configured(&self) -> bool {
        self.configured
    }
}

impl ValueConverter for RangeScaledConverter {
    fn configure(&mut self, channel: &mut dyn ConfigChannel) -> Result<bool, TransportError> {
        if self.configured {
            return Ok(true);
        }
        let mut record = channel.read_config()?;
        if record.len() <= RESOLUTION_SELECTOR_OFFSET {
            debug!(
                "range converter: config record too short ({})",
                to_hex_string(&record)
            );
            return Ok(false);
        }
        record[RANGE_SELECTOR_OFFSET] = RANGE_SELECTOR;
        record[RESOLUTION_SELECTOR_OFFSET] = RESOLUTION_SELECTOR;
        channel.write_config(&record)?;
        self.configured = true;
        Ok(true)
    }

    fn decode(&self, data: &[u8]) -> Option<f64> {
        if !validate(2, Some(data)) {
            return None;
        }
        let status = data[0];
        let count = usize::from(status & 0b11);
        let range = RANGE_TABLE[usize::from((status >> 2) & 0b11)];
        let resolution = RESOLUTION_MAX_TABLE[usize::from((status >> 4) & 0b11)];
        if !(1..=2).contains(&count) {
            debug!("range converter: unsupported byte count in status {status:#04x}");
            return None;
        }
        let bytes = data.get(1..1 + count)?;
        let raw = bytes
            .iter()
            .rev()
            .fold(0u32, |acc, b| (acc << 8) | u32::from(*b));
        let scaled = f64::from(raw) * f64::from(range) / f64::from(resolution);
        Some(round_half_even(scaled, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeConfig {
        record: Vec<u8>,
        reads: usize,
        writes: Vec<Vec<u8>>,
    }

    impl ConfigChannel for FakeConfig {
        fn read_config(&mut self) -> Result<Vec<u8>, TransportError> {
            self.reads += 1;
            Ok(self.record.clone())
        }

        fn write_config(&mut self, data: &[u8]) -> Result<(), TransportError> {
            self.writes.push(data.to_vec());
            self.record = data.to_vec();
            Ok(())
        }
    }

    #[test]
    fn validate_fails_closed() {
        assert!(!validate(1, None));
        assert!(!validate(2, Some(&[1])));
        assert!(validate(2, Some(&[1, 2])));
    }

    #[test]
    fn temperature_scaling() {
        let c = TemperatureConverter;
        assert_eq!(c.decode(&400i16.to_le_bytes()), Some(25.0));
        assert_eq!(c.decode(&(-160i16).to_le_bytes()), Some(-10.0));
        assert_eq!(c.decode(&37i16.to_le_bytes()), Some(2.3));
        assert_eq!(c.decode(&[0x90]), None);
        assert_eq!(c.decode(&[]), None);
    }

    #[test]
    fn battery_level_is_first_byte() {
        assert_eq!(BatteryLevelConverter.decode(&[93, 1]), Some(93.0));
        assert_eq!(BatteryLevelConverter.decode(&[]), None);
    }

    #[test]
    fn range_scaled_uses_status_byte_tables() {
        let c = RangeScaledConverter::default();
        // 2 data bytes, range 1000, resolution 65535
        assert_eq!(c.decode(&[0b0000_0010, 0xFF, 0xFF]), Some(1000.0));
        // 2 data bytes, range 4000, resolution 4095
        assert_eq!(c.decode(&[0b0001_0110, 0xFF, 0x0F]), Some(4000.0));
        assert_eq!(c.decode(&[0b0001_0110, 100, 0]), Some(98.0));
        // 1 data byte, range 64000, resolution 15
        assert_eq!(c.decode(&[0b0011_1101, 1]), Some(4267.0));
        assert_eq!(c.decode(&[0b0011_1101, 15, 0xAA]), Some(64000.0));
    }

    #[test]
    fn range_scaled_rejects_bad_samples() {
        let c = RangeScaledConverter::default();
        assert_eq!(c.decode(&[0b0000_0010]), None);
        assert_eq!(c.decode(&[0b0000_0010, 0xFF]), None);
        assert_eq!(c.decode(&[0b0000_0000, 0xFF]), None);
        assert_eq!(c.decode(&[0b0000_0011, 0xFF, 0xFF, 0xFF]), None);
    }

    #[test]
    fn range_scaled_configures_once() {
        let mut cfg = FakeConfig {
            record: vec![0xEE; 18],
            ..Default::default()
        };
        let mut c = RangeScaledConverter::default();
        assert!(c.configure(&mut cfg).unwrap());
        assert!(c.configure(&mut cfg).unwrap());
        assert_eq!(cfg.reads, 1);
        assert_eq!(cfg.writes.len(), 1);
        let written = &cfg.writes[0];
        assert_eq!(written.len(), 18);
        assert_eq!(written[14], 3);
        assert_eq!(written[15], 0);
        assert_eq!(written[13], 0xEE);
        assert_eq!(written[16], 0xEE);
        assert!(c.is_configured());
    }

    #[test]
    fn range_scaled_retries_configuration_after_short_record() {
        let mut cfg = FakeConfig::default();
        let mut c = RangeScaledConverter::default();
        assert!(!c.configure(&mut cfg).unwrap());
        assert!(cfg.writes.is_empty());
        cfg.record = vec![0; 16];
        assert!(c.configure(&mut cfg).unwrap());
        assert_eq!(cfg.writes.len(), 1);
    }
}
