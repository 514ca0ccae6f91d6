use ble_transport::{ChannelId, ServiceId};
use serde::{Deserialize, Serialize};

/// Closed set of measurements a device can carry. Declaration order is the wire ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Temperature,
    Humidity,
    Pressure,
    Luminosity,
    BatteryVoltage,
    BatteryPercent,
}

const SENSOR_NAMES: [(&str, SensorKind); 6] = [
    ("Temperature", SensorKind::Temperature),
    ("Humidity", SensorKind::Humidity),
    ("Pressure", SensorKind::Pressure),
    ("Luminosity", SensorKind::Luminosity),
    ("BatteryVoltage", SensorKind::BatteryVoltage),
    ("BatteryPercent", SensorKind::BatteryPercent),
];

impl SensorKind {
    pub fn name(self) -> &'static str {
        match self {
            SensorKind::Temperature => "Temperature",
            SensorKind::Humidity => "Humidity",
            SensorKind::Pressure => "Pressure",
            SensorKind::Luminosity => "Luminosity",
            SensorKind::BatteryVoltage => "BatteryVoltage",
            SensorKind::BatteryPercent => "BatteryPercent",
        }
    }

    pub fn ordinal(self) -> u8 {
        match self {
            SensorKind::Temperature => 0,
            SensorKind::Humidity => 1,
            SensorKind::Pressure => 2,
            SensorKind::Luminosity => 3,
            SensorKind::BatteryVoltage => 4,
            SensorKind::BatteryPercent => 5,
        }
    }

    /// Case-insensitive prefix match against the variant names, first hit wins.
    pub fn resolve(input: &str) -> Option<SensorKind> {
        resolve_prefix(&SENSOR_NAMES, input)
    }
}

/// Remote command action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    New,
    Update,
    Enable,
    Disable,
    None,
}

const ACTION_NAMES: [(&str, CommandAction); 4] = [
    ("New", CommandAction::New),
    ("Update", CommandAction::Update),
    ("Enable", CommandAction::Enable),
    ("Disable", CommandAction::Disable),
];

impl CommandAction {
    /// Same matching rule as [`SensorKind::resolve`]; no match yields `None`.
    pub fn resolve(input: &str) -> CommandAction {
        resolve_prefix(&ACTION_NAMES, input).unwrap_or(CommandAction::None)
    }
}

fn resolve_prefix<T: Copy>(table: &[(&str, T)], input: &str) -> Option<T> {
    let needle = input.to_ascii_lowercase();
    table
        .iter()
        .find(|(name, _)| {
            needle.len() <= name.len() && name.to_ascii_lowercase().starts_with(&needle)
        })
        .map(|(_, v)| *v)
}

/// Which decoder family a device speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    EddystoneTlm,
    VendorEnvironmental,
    GenericPolled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum ConverterKind {
    Temperature,
    RangeScaled,
    BatteryLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct GatewayConfig {
    #[serde(default = "default_device_id")]
    pub device_id: String,
    #[serde(default = "default_config_version")]
    pub config_version: String,
    #[serde(default)]
    pub key_prefix: String,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub devices: Vec<DeviceDescriptor>,
}

fn default_device_id() -> String {
    "gateway".to_string()
}

fn default_config_version() -> String {
    "1.1.5".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct PollingConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_spacing_ms")]
    pub spacing_ms: u64,
}

fn default_interval_secs() -> u64 {
    30
}

fn default_attempts() -> u32 {
    5
}

fn default_spacing_ms() -> u64 {
    100
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            attempts: default_attempts(),
            spacing_ms: default_spacing_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct DeviceDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub address: String,
    pub kind: DeviceKind,
    #[serde(default)]
    pub sensors: Vec<SensorDescriptor>,
    #[serde(default)]
    pub polled: Vec<PolledChannelDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct SensorDescriptor {
    pub kind: SensorKind,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct PolledChannelDescriptor {
    pub sensor: SensorKind,
    pub service: String,
    pub data: String,
    #[serde(default)]
    pub config: Option<String>,
    pub converter: ConverterKind,
}

/// A polled channel with its identifiers resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolledChannel {
    pub sensor: SensorKind,
    pub service: ServiceId,
    pub data: ChannelId,
    pub config: Option<ChannelId>,
    pub converter: ConverterKind,
}
