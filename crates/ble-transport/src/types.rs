use core::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

const ADDRESS_MASK: u64 = 0xFFFF_FFFF_FFFF;
const SIG_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// 48-bit Bluetooth device address
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct BleAddress(u64);

impl BleAddress {
    /// Zero is reserved as "no address" and anything wider than 48 bits is rejected.
    pub fn new(raw: u64) -> Option<Self> {
        if raw != 0 && raw <= ADDRESS_MASK {
            Some(Self(raw))
        } else {
            None
        }
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    /// `EC:FE:7E:10:9D:7E` style rendering.
    pub fn to_colon_string(&self) -> String {
        let b = self.0.to_be_bytes();
        format!(
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

impl fmt::Display for BleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{raw:X}", raw = self.0)
    }
}

/// GATT service identifier
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ServiceId(pub Uuid);

/// GATT characteristic ("channel") identifier
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ChannelId(pub Uuid);

macro_rules! gatt_id {
    ($ty:ident) => {
        impl $ty {
            pub fn parse(s: &str) -> Option<Self> {
                Uuid::parse_str(s.trim()).ok().map(Self)
            }

            /// Expand a 16-bit assigned number onto the Bluetooth base UUID.
            pub fn from_short(short: u16) -> Self {
                Self(Uuid::from_u128(SIG_BASE_UUID | (u128::from(short) << 96)))
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.hyphenated())
            }
        }
    };
}

gatt_id!(ServiceId);
gatt_id!(ChannelId);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// One advertising data section: AD type tag plus its payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DataSection {
    pub data_type: u8,
    pub data: Vec<u8>,
}

impl DataSection {
    pub fn new(data_type: u8, data: &[u8]) -> Self {
        Self {
            data_type,
            data: data.to_vec(),
        }
    }
}

/// A received advertisement
#[derive(Clone, Debug, PartialEq)]
pub struct AdvertisementFrame {
    pub address: BleAddress,
    pub sections: Vec<DataSection>,
    pub timestamp: Timestamp,
    pub rssi: i16,
}

impl AdvertisementFrame {
    pub fn new(address: BleAddress, sections: Vec<DataSection>) -> Self {
        Self {
            address,
            sections,
            timestamp: Timestamp(OffsetDateTime::now_utc()),
            rssi: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timestamp(pub OffsetDateTime);

/// `"AA FE 20 "` style dump used in diagnostics.
pub fn to_hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for b in bytes {
        out.push_str(&format!("{b:02X} "));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_range_is_48_bits() {
        assert!(BleAddress::new(0).is_none());
        assert!(BleAddress::new(0x1_0000_0000_0000).is_none());
        let a = BleAddress::new(0xECFE_7E10_9D7E).unwrap();
        assert_eq!(a.to_string(), "0xECFE7E109D7E");
        assert_eq!(a.to_colon_string(), "EC:FE:7E:10:9D:7E");
    }

    #[test]
    fn short_uuid_expands_on_base() {
        let battery = ServiceId::from_short(0x180F);
        let parsed = ServiceId::parse("0000180F-0000-1000-8000-00805F9B34FB").unwrap();
        assert_eq!(battery, parsed);
    }

    #[test]
    fn hex_dump() {
        assert_eq!(to_hex_string(&[0xAA, 0xFE, 0x20]), "AA FE 20 ");
        assert_eq!(to_hex_string(&[]), "");
    }
}
