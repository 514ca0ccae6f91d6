use crate::ui::{UiContext, UiDispatcher};
use crate::{CommandAction, DeviceKind, SensorKind};
use ble_transport::BleAddress;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;

/// Legacy "no data" marker. Readings are `Option<f64>`; this value is never stored.
pub const NO_DATA: f64 = f64::MIN;

/// A displayed value closer than this to [`NO_DATA`] does not count as a reading.
pub const VALID_EPSILON: f64 = 0.001;

const DISPLAY_HYSTERESIS: f64 = 0.01;

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    SensorValue {
        address: BleAddress,
        kind: SensorKind,
        value: Option<f64>,
    },
    SensorEnabled {
        address: BleAddress,
        kind: SensorKind,
        enabled: bool,
    },
    DeviceEnabled {
        address: BleAddress,
        enabled: bool,
    },
    DeviceTimestamp {
        address: BleAddress,
        at: OffsetDateTime,
    },
}

pub type ChangeHook = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

#[derive(Default)]
struct HookSlot(RwLock<Option<ChangeHook>>);

impl HookSlot {
    fn emit(&self, event: ChangeEvent) {
        let hook = match self.0.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(hook) = hook {
            hook(&event);
        }
    }

    fn set(&self, hook: Option<ChangeHook>) {
        match self.0.write() {
            Ok(mut g) => *g = hook,
            Err(poisoned) => *poisoned.into_inner() = hook,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What a dispatched action did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Enable/disable scheduled on the UI context.
    Applied,
    /// Accepted without effect (`New`, `Update`).
    Acknowledged,
    Ignored,
}

#[derive(Debug, Clone, Copy)]
struct SensorState {
    enabled: bool,
    received: Option<f64>,
    pending: bool,
    displayed: Option<f64>,
    refreshed: bool,
}

pub struct Sensor {
    kind: SensorKind,
    name: String,
    address: BleAddress,
    state: Mutex<SensorState>,
    hooks: Arc<HookSlot>,
    ui: Arc<dyn UiDispatcher>,
}

impl Sensor {
    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enabled(&self) -> bool {
        lock(&self.state).enabled
    }

    /// Last raw value written by a producer.
    pub fn received(&self) -> Option<f64> {
        lock(&self.state).received
    }

    /// Value as shown to the user, refreshed only on the UI context.
    pub fn displayed(&self) -> Option<f64> {
        lock(&self.state).displayed
    }

    fn has_reading(&self) -> bool {
        matches!(self.displayed(), Some(v) if (v - NO_DATA).abs() > VALID_EPSILON)
    }

    /// Store a raw value from any thread. Ignored while disabled.
    pub(crate) fn receive(&self, value: f64) -> bool {
        if (value - NO_DATA).abs() <= VALID_EPSILON || value.is_nan() {
            return false;
        }
        let mut s = lock(&self.state);
        if !s.enabled {
            return false;
        }
        s.received = Some(value);
        s.pending = true;
        true
    }

    /// Copy the raw value into the displayed value.
    pub fn update_ui(&self, _ui: &UiContext) {
        let changed = {
            let mut s = lock(&self.state);
            if !s.pending {
                return;
            }
            s.pending = false;
            s.refreshed = true;
            if display_differs(s.displayed, s.received) {
                s.displayed = s.received;
                Some(s.displayed)
            } else {
                None
            }
        };
        if let Some(value) = changed {
            self.hooks.emit(ChangeEvent::SensorValue {
                address: self.address,
                kind: self.kind,
                value,
            });
        }
    }

    /// Disabling clears both values; enabling does not bring them back.
    pub fn set_enabled(&self, _ui: &UiContext, enabled: bool) {
        {
            let mut s = lock(&self.state);
            if s.enabled == enabled {
                return;
            }
            s.enabled = enabled;
            if !enabled {
                s.received = None;
                s.displayed = None;
                s.pending = false;
                s.refreshed = false;
            }
        }
        self.hooks.emit(ChangeEvent::SensorEnabled {
            address: self.address,
            kind: self.kind,
            enabled,
        });
    }

    pub fn perform_action(self: &Arc<Self>, action: CommandAction) -> ActionOutcome {
        match action {
            CommandAction::Enable | CommandAction::Disable => {
                let enabled = action == CommandAction::Enable;
                let sensor = Arc::clone(self);
                self.ui
                    .dispatch(Box::new(move |ui| sensor.set_enabled(ui, enabled)));
                ActionOutcome::Applied
            }
            CommandAction::New | CommandAction::Update => ActionOutcome::Acknowledged,
            CommandAction::None => ActionOutcome::Ignored,
        }
    }
}

fn display_differs(old: Option<f64>, new: Option<f64>) -> bool {
    match (old, new) {
        (Some(a), Some(b)) => (a - b).abs() > DISPLAY_HYSTERESIS,
        (None, None) => false,
        _ => true,
    }
}

#[derive(Debug, Clone, Copy)]
struct DeviceState {
    enabled: bool,
    last_update: Option<OffsetDateTime>,
}

pub struct Device {
    address: BleAddress,
    name: String,
    description: String,
    kind: DeviceKind,
    sensors: Vec<Arc<Sensor>>,
    state: Mutex<DeviceState>,
    hooks: Arc<HookSlot>,
    ui: Arc<dyn UiDispatcher>,
}

impl Device {
    pub fn address(&self) -> BleAddress {
        self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// Sensors in configuration order.
    pub fn sensors(&self) -> &[Arc<Sensor>] {
        &self.sensors
    }

    pub fn sensor(&self, kind: SensorKind) -> Option<&Arc<Sensor>> {
        self.sensors.iter().find(|s| s.kind == kind)
    }

    pub fn enabled(&self) -> bool {
        lock(&self.state).enabled
    }

    pub fn last_update(&self) -> Option<OffsetDateTime> {
        lock(&self.state).last_update
    }

    pub fn ui(&self) -> &Arc<dyn UiDispatcher> {
        &self.ui
    }

    /// Write a raw value for one sensor. Unknown or disabled sensors are ignored.
    pub fn set_data(&self, kind: SensorKind, value: f64) -> bool {
        match self.sensor(kind) {
            Some(sensor) => sensor.receive(value),
            None => {
                debug!(address = %self.address, sensor = ?kind, "no such sensor on device");
                false
            }
        }
    }

    /// True when every enabled sensor shows a real value.
    pub fn all_data_valid(&self) -> bool {
        self.sensors
            .iter()
            .filter(|s| s.enabled())
            .all(|s| s.has_reading())
    }

    /// Stamp the device and refresh every sensor's displayed value.
    pub fn update_ui(&self, ui: &UiContext, at: OffsetDateTime) {
        lock(&self.state).last_update = Some(at);
        self.hooks.emit(ChangeEvent::DeviceTimestamp {
            address: self.address,
            at,
        });
        for sensor in &self.sensors {
            sensor.update_ui(ui);
        }
    }

    pub fn set_enabled(&self, _ui: &UiContext, enabled: bool) {
        {
            let mut s = lock(&self.state);
            if s.enabled == enabled {
                return;
            }
            s.enabled = enabled;
        }
        self.hooks.emit(ChangeEvent::DeviceEnabled {
            address: self.address,
            enabled,
        });
    }

    /// Apply an action to the device and cascade it to every sensor.
    pub fn perform_action(self: &Arc<Self>, action: CommandAction) -> ActionOutcome {
        let outcome = match action {
            CommandAction::Enable | CommandAction::Disable => {
                let enabled = action == CommandAction::Enable;
                let device = Arc::clone(self);
                self.ui
                    .dispatch(Box::new(move |ui| device.set_enabled(ui, enabled)));
                ActionOutcome::Applied
            }
            CommandAction::New | CommandAction::Update => ActionOutcome::Acknowledged,
            CommandAction::None => ActionOutcome::Ignored,
        };
        for sensor in &self.sensors {
            sensor.perform_action(action);
        }
        outcome
    }

    /// Decide whether a telemetry record should go out now.
    ///
    /// Requires an enabled device with at least one enabled sensor, all of them valid
    /// and refreshed since the previous record. A successful claim consumes the
    /// refresh flags.
    pub fn claim_uplink(&self, _ui: &UiContext) -> bool {
        if !self.enabled() {
            return false;
        }
        let enabled: Vec<&Arc<Sensor>> = self.sensors.iter().filter(|s| s.enabled()).collect();
        if enabled.is_empty() || !self.all_data_valid() {
            return false;
        }
        if !enabled.iter().all(|s| lock(&s.state).refreshed) {
            return false;
        }
        for s in enabled {
            lock(&s.state).refreshed = false;
        }
        true
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate device address {0}")]
    DuplicateAddress(BleAddress),
    #[error("device {address} declares sensor {kind:?} twice")]
    DuplicateSensor {
        address: BleAddress,
        kind: SensorKind,
    },
}

/// Static description of one device for [`RegistryBuilder::device`].
#[derive(Debug, Clone)]
pub struct DeviceSpec {
    pub address: BleAddress,
    pub name: String,
    pub description: String,
    pub kind: DeviceKind,
    pub sensors: Vec<(SensorKind, String)>,
}

pub struct RegistryBuilder {
    ui: Arc<dyn UiDispatcher>,
    hooks: Arc<HookSlot>,
    devices: Vec<Arc<Device>>,
}

impl RegistryBuilder {
    pub fn device(mut self, spec: DeviceSpec) -> Result<Self, RegistryError> {
        if self.devices.iter().any(|d| d.address == spec.address) {
            return Err(RegistryError::DuplicateAddress(spec.address));
        }
        let mut sensors: Vec<Arc<Sensor>> = Vec::with_capacity(spec.sensors.len());
        for (kind, name) in spec.sensors {
            if sensors.iter().any(|s| s.kind == kind) {
                return Err(RegistryError::DuplicateSensor {
                    address: spec.address,
                    kind,
                });
            }
            sensors.push(Arc::new(Sensor {
                kind,
                name,
                address: spec.address,
                state: Mutex::new(SensorState {
                    enabled: true,
                    received: None,
                    pending: false,
                    displayed: None,
                    refreshed: false,
                }),
                hooks: Arc::clone(&self.hooks),
                ui: Arc::clone(&self.ui),
            }));
        }
        self.devices.push(Arc::new(Device {
            address: spec.address,
            name: spec.name,
            description: spec.description,
            kind: spec.kind,
            sensors,
            state: Mutex::new(DeviceState {
                enabled: true,
                last_update: None,
            }),
            hooks: Arc::clone(&self.hooks),
            ui: Arc::clone(&self.ui),
        }));
        Ok(self)
    }

    pub fn build(self) -> Registry {
        Registry {
            devices: self.devices,
            hooks: self.hooks,
            ui: self.ui,
        }
    }
}

/// Owns every configured device for the process lifetime.
pub struct Registry {
    devices: Vec<Arc<Device>>,
    hooks: Arc<HookSlot>,
    ui: Arc<dyn UiDispatcher>,
}

impl Registry {
    pub fn builder(ui: Arc<dyn UiDispatcher>) -> RegistryBuilder {
        RegistryBuilder {
            ui,
            hooks: Arc::new(HookSlot::default()),
            devices: Vec::new(),
        }
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    pub fn device(&self, address: BleAddress) -> Option<&Arc<Device>> {
        self.devices.iter().find(|d| d.address == address)
    }

    pub fn set_data(&self, address: BleAddress, kind: SensorKind, value: f64) -> bool {
        self.device(address)
            .map(|d| d.set_data(kind, value))
            .unwrap_or(false)
    }

    pub fn ui(&self) -> &Arc<dyn UiDispatcher> {
        &self.ui
    }

    /// Install (or clear) the hook invoked synchronously after each state change.
    pub fn set_change_hook(&self, hook: Option<ChangeHook>) {
        self.hooks.set(hook);
    }
}
