//! sensor-registry: device/sensor model, frame decoding and command handling for BLE sensors

mod types;
pub use types::*;

mod ui;
pub use ui::{ui_queue, InlineDispatcher, QueuedDispatcher, UiContext, UiDispatcher, UiJob, UiQueue};

mod registry;
pub use registry::{
    ActionOutcome, ChangeEvent, ChangeHook, Device, DeviceSpec, Registry, RegistryBuilder,
    RegistryError, Sensor, NO_DATA, VALID_EPSILON,
};

pub mod decode;
pub use decode::{decode_section, Reading};

pub mod convert;
pub use convert::{converter_for, ConfigChannel, ValueConverter};

pub mod command;
pub use command::{
    decode_address, dispatch, resolve_device_command, resolve_sensor_command, Command,
    CommandDecodeError, CommandProblem, CommandTarget,
};

mod uplink;
pub use uplink::{
    build_record, telemetry_key, CloudMessage, JsonLinesUplink, MessageSink, RecordingSink,
    RecordingUplink, TelemetryEmitter, TelemetryValue, TracingSink, UplinkError, UplinkRecord,
    UplinkSender,
};

mod remote;
pub use remote::{is_newer_version, CommandHandler, MethodResponse, ALARM_TOPIC, CONFIG_TOPIC};

mod ingest;
pub use ingest::{refresh_and_emit, BroadcastIngest, FrameOutcome};

mod loader;
pub use loader::{
    build_registry, device_address, load_gateway_file, parse_gateway_str, polled_channels,
};

mod metrics;
pub use metrics::{GatewayMetrics, MetricsHub};
