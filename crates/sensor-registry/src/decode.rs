//! Advertisement payload decoders.
//!
//! Every function here is pure and total: short or foreign payloads produce `None`
//! rather than an error, and the caller simply skips the write.

use crate::{DeviceKind, SensorKind};
use ble_transport::DataSection;

/// AD type "Service Data - 16-bit UUID"
pub const SERVICE_DATA_SECTION: u8 = 0x16;
/// AD type "Manufacturer Specific Data"
pub const MANUFACTURER_SECTION: u8 = 0xFF;

const EDDYSTONE_TLM_SIGNATURE: [u8; 3] = [0xAA, 0xFE, 0x20];
const VENDOR_ENV_MIN_LEN: usize = 22;
const VENDOR_ENV_FRAME_ID: u8 = 0x10;

/// One decoded value; `None` when the payload was too short for this field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub kind: SensorKind,
    pub value: Option<f64>,
}

impl Reading {
    fn new(kind: SensorKind, value: Option<f64>) -> Self {
        Self { kind, value }
    }
}

fn window<const N: usize>(data: &[u8], offset: usize) -> Option<[u8; N]> {
    let end = offset.checked_add(N)?;
    let mut out = [0u8; N];
    out.copy_from_slice(data.get(offset..end)?);
    Some(out)
}

/// Two bytes at `offset`, most significant first.
pub fn read_u16_be(data: &[u8], offset: usize) -> Option<u16> {
    window::<2>(data, offset).map(u16::from_be_bytes)
}

/// Two bytes at `offset`, least significant first.
pub fn read_u16_le(data: &[u8], offset: usize) -> Option<u16> {
    window::<2>(data, offset).map(u16::from_le_bytes)
}

pub fn read_i16_be(data: &[u8], offset: usize) -> Option<i16> {
    window::<2>(data, offset).map(i16::from_be_bytes)
}

pub fn read_i16_le(data: &[u8], offset: usize) -> Option<i16> {
    window::<2>(data, offset).map(i16::from_le_bytes)
}

/// Round to `decimals` places, ties to even.
pub fn round_half_even(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round_ties_even() / scale
}

/// Eddystone TLM: battery mV (BE u16 @4) and temperature in 8.8 fixed point (BE i16 @6).
pub fn decode_eddystone_tlm(section: &DataSection) -> Option<Vec<Reading>> {
    if section.data_type != SERVICE_DATA_SECTION
        || section.data.get(..3) != Some(&EDDYSTONE_TLM_SIGNATURE[..])
    {
        return None;
    }
    let data = &section.data;
    let battery = read_u16_be(data, 4).map(f64::from);
    let temperature = read_i16_be(data, 6).map(|t| f64::from(t) / 256.0);
    Some(vec![
        Reading::new(SensorKind::BatteryVoltage, battery),
        Reading::new(SensorKind::Temperature, temperature),
    ])
}

/// Temperature carried as two bytes holding the integer and fractional digits.
pub fn decimal_digits_temperature(data: &[u8], offset: usize) -> Option<f64> {
    let [whole, frac] = window::<2>(data, offset)?;
    let text = format!("{whole}.{frac}");
    text.parse::<f64>().ok().map(|t| round_half_even(t, 1))
}

/// Vendor environmental manufacturer frame (frame id 0x10 at offset 14).
pub fn decode_vendor_environmental(section: &DataSection) -> Option<Vec<Reading>> {
    let data = &section.data;
    if section.data_type != MANUFACTURER_SECTION
        || data.len() < VENDOR_ENV_MIN_LEN
        || data[14] != VENDOR_ENV_FRAME_ID
    {
        return None;
    }
    Some(vec![
        Reading::new(SensorKind::BatteryPercent, Some(f64::from(data[12]))),
        Reading::new(SensorKind::Temperature, decimal_digits_temperature(data, 20)),
        Reading::new(SensorKind::Humidity, Some(f64::from(data[19]))),
        Reading::new(SensorKind::Luminosity, read_u16_be(data, 17).map(f64::from)),
        Reading::new(SensorKind::Pressure, read_u16_be(data, 15).map(f64::from)),
    ])
}

/// Route a section to the decoder for the device's family. `None` means the section
/// is not a frame this family understands.
pub fn decode_section(kind: DeviceKind, section: &DataSection) -> Option<Vec<Reading>> {
    match kind {
        DeviceKind::EddystoneTlm => decode_eddystone_tlm(section),
        DeviceKind::VendorEnvironmental => decode_vendor_environmental(section),
        DeviceKind::GenericPolled => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(readings: &[Reading], kind: SensorKind) -> Option<f64> {
        readings.iter().find(|r| r.kind == kind).and_then(|r| r.value)
    }

    fn vendor_payload() -> Vec<u8> {
        let mut p = vec![0u8; 22];
        p[12] = 87;
        p[14] = 0x10;
        p[15] = 0x27;
        p[16] = 0x8D; // pressure 10125
        p[17] = 0x01;
        p[18] = 0x2C; // luminosity 300
        p[19] = 45;
        p[20] = 2;
        p[21] = 5;
        p
    }

    #[test]
    fn u16_extractors() {
        let buf = [0x12, 0x34, 0x56];
        assert_eq!(read_u16_be(&buf, 0), Some(0x1234));
        assert_eq!(read_u16_le(&buf, 0), Some(0x3412));
        assert_eq!(read_u16_be(&buf, 1), Some(0x3456));
        assert_eq!(read_u16_be(&buf, 2), None);
        assert_eq!(read_u16_be(&buf, usize::MAX), None);
        assert_eq!(read_i16_be(&[0xFF, 0x00], 0), Some(-256));
    }

    #[test]
    fn eddystone_tlm_frame() {
        let section = DataSection::new(0x16, &[0xAA, 0xFE, 0x20, 0x00, 0x0C, 0x80, 0x01, 0x90]);
        let r = decode_eddystone_tlm(&section).unwrap();
        assert_eq!(value(&r, SensorKind::BatteryVoltage), Some(3200.0));
        assert_eq!(value(&r, SensorKind::Temperature), Some(1.5625));
    }

    #[test]
    fn eddystone_negative_temperature() {
        let section = DataSection::new(0x16, &[0xAA, 0xFE, 0x20, 0x00, 0x0B, 0xB8, 0xFE, 0x80]);
        let r = decode_eddystone_tlm(&section).unwrap();
        assert_eq!(value(&r, SensorKind::Temperature), Some(-1.5));
    }

    #[test]
    fn eddystone_short_payload_yields_no_values() {
        let section = DataSection::new(0x16, &[0xAA, 0xFE, 0x20, 0x00, 0x0C]);
        let r = decode_eddystone_tlm(&section).unwrap();
        assert!(r.iter().all(|x| x.value.is_none()));

        let partial = DataSection::new(0x16, &[0xAA, 0xFE, 0x20, 0x00, 0x0C, 0x80, 0x01]);
        let r = decode_eddystone_tlm(&partial).unwrap();
        assert_eq!(value(&r, SensorKind::BatteryVoltage), Some(3200.0));
        assert_eq!(value(&r, SensorKind::Temperature), None);
    }

    #[test]
    fn eddystone_rejects_foreign_sections() {
        assert!(decode_eddystone_tlm(&DataSection::new(0x16, &[0xAA, 0xFE, 0x10])).is_none());
        assert!(decode_eddystone_tlm(&DataSection::new(0xFF, &[0xAA, 0xFE, 0x20])).is_none());
        assert!(decode_eddystone_tlm(&DataSection::new(0x16, &[0xAA])).is_none());
    }

    #[test]
    fn vendor_environmental_frame() {
        let r = decode_vendor_environmental(&DataSection::new(0xFF, &vendor_payload())).unwrap();
        assert_eq!(value(&r, SensorKind::BatteryPercent), Some(87.0));
        assert_eq!(value(&r, SensorKind::Humidity), Some(45.0));
        assert_eq!(value(&r, SensorKind::Luminosity), Some(300.0));
        assert_eq!(value(&r, SensorKind::Pressure), Some(10125.0));
        assert_eq!(value(&r, SensorKind::Temperature), Some(2.5));
    }

    #[test]
    fn vendor_environmental_guards() {
        let mut p = vendor_payload();
        p[14] = 0x11;
        assert!(decode_vendor_environmental(&DataSection::new(0xFF, &p)).is_none());
        let short = &vendor_payload()[..21];
        assert!(decode_vendor_environmental(&DataSection::new(0xFF, short)).is_none());
        assert!(decode_vendor_environmental(&DataSection::new(0x16, &vendor_payload())).is_none());
    }

    #[test]
    fn decimal_digit_temperature_rounds_half_even() {
        assert_eq!(decimal_digits_temperature(&[21, 7], 0), Some(21.7));
        assert_eq!(decimal_digits_temperature(&[2, 25], 0), Some(2.2));
        assert_eq!(decimal_digits_temperature(&[2, 35], 0), Some(2.4));
        assert_eq!(decimal_digits_temperature(&[2], 0), None);
    }

    #[test]
    fn polled_devices_have_no_frame_decoder() {
        let s = DataSection::new(0x16, &[0xAA, 0xFE, 0x20, 0x00, 0x0C, 0x80, 0x01, 0x90]);
        assert!(decode_section(DeviceKind::GenericPolled, &s).is_none());
        assert!(decode_section(DeviceKind::EddystoneTlm, &s).is_some());
        assert!(decode_section(DeviceKind::VendorEnvironmental, &s).is_none());
    }
}
