//! Polled acquisition state machine for one device.
//!
//! A cycle walks `Discovering -> (Enabling -> Reading -> Disabling)* -> Idle`.
//! Discovery runs until it succeeds once; later cycles only read. Every wait is a
//! bounded, blocking sleep local to the device, checked against a [`CancelToken`].

use crate::AcquisitionError;
use ble_transport::{ChannelId, GattLink, ServiceId, TransportError, WriteMode};
use sensor_registry::{
    converter_for, refresh_and_emit, ConfigChannel, Device, GatewayMetrics, PollingConfig,
    PolledChannel, SensorKind, TelemetryEmitter, ValueConverter,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

const ENABLE: [u8; 1] = [1];
const DISABLE: [u8; 1] = [0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionConfig {
    /// Attempts for both discovery and each channel read.
    pub attempts: u32,
    /// Pause between attempts.
    pub spacing: Duration,
    /// Period of the re-trigger timer.
    pub interval: Duration,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            spacing: Duration::from_millis(100),
            interval: Duration::from_secs(30),
        }
    }
}

impl From<&PollingConfig> for AcquisitionConfig {
    fn from(p: &PollingConfig) -> Self {
        Self {
            attempts: p.attempts.max(1),
            spacing: Duration::from_millis(p.spacing_ms),
            interval: Duration::from_secs(p.interval_secs.max(1)),
        }
    }
}

/// Shared stop flag, checked before every attempt.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Discovering,
    Enabling,
    Reading,
    Disabling,
}

/// Values produced by one cycle, in channel order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub values: Vec<(SensorKind, Option<f64>)>,
    pub written: usize,
}

struct Slot {
    channel: PolledChannel,
    converter: Box<dyn ValueConverter>,
}

/// Config-channel access for a converter, bound to one service.
struct LinkConfig<'a, L> {
    link: &'a mut L,
    service: ServiceId,
    channel: ChannelId,
}

impl<L: GattLink> ConfigChannel for LinkConfig<'_, L> {
    fn read_config(&mut self) -> Result<Vec<u8>, TransportError> {
        self.link.read(self.service, self.channel)
    }

    fn write_config(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.link
            .write(self.service, self.channel, data, WriteMode::WithResponse)
    }
}

pub struct Acquisition<L: GattLink> {
    link: L,
    device: Arc<Device>,
    slots: Vec<Slot>,
    config: AcquisitionConfig,
    cancel: CancelToken,
    state: CycleState,
    discovered: bool,
    emitter: Option<TelemetryEmitter>,
    metrics: Option<GatewayMetrics>,
}

impl<L: GattLink> Acquisition<L> {
    pub fn new(
        link: L,
        device: Arc<Device>,
        channels: &[PolledChannel],
        config: AcquisitionConfig,
    ) -> Self {
        let slots = channels
            .iter()
            .map(|c| Slot {
                channel: *c,
                converter: converter_for(c.converter),
            })
            .collect();
        Self {
            link,
            device,
            slots,
            config,
            cancel: CancelToken::default(),
            state: CycleState::Idle,
            discovered: false,
            emitter: None,
            metrics: None,
        }
    }

    pub fn with_emitter(mut self, emitter: TelemetryEmitter) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn with_metrics(mut self, metrics: GatewayMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn is_discovered(&self) -> bool {
        self.discovered
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn check_cancel(&self) -> Result<(), AcquisitionError> {
        if self.cancel.is_cancelled() {
            return Err(AcquisitionError::Cancelled);
        }
        Ok(())
    }

    fn pause(&self, attempt: u32) {
        if attempt + 1 < self.config.attempts && !self.config.spacing.is_zero() {
            thread::sleep(self.config.spacing);
        }
    }

    /// Access check, then enumerate services until one we poll shows up.
    pub fn discover(&mut self) -> Result<Vec<ServiceId>, AcquisitionError> {
        self.state = CycleState::Discovering;
        let address = self.device.address();
        let result = self.discover_inner();
        self.state = CycleState::Idle;
        match &result {
            Ok(services) => {
                self.discovered = true;
                info!(%address, services = services.len(), "services discovered");
            }
            Err(e) => warn!(%address, error = %e, "device not ready"),
        }
        result
    }

    fn discover_inner(&mut self) -> Result<Vec<ServiceId>, AcquisitionError> {
        let address = self.device.address();
        self.link
            .request_access()
            .map_err(|e| AcquisitionError::AccessDenied {
                address,
                reason: e.to_string(),
            })?;

        for attempt in 0..self.config.attempts {
            self.check_cancel()?;
            let found = match self.link.discover_services() {
                Ok(services) => services,
                Err(e) => {
                    debug!(%address, attempt, error = %e, "service enumeration failed");
                    Vec::new()
                }
            };
            let wanted: Vec<ServiceId> = found
                .into_iter()
                .filter(|s| self.slots.iter().any(|slot| slot.channel.service == *s))
                .collect();
            if !wanted.is_empty() {
                return Ok(wanted);
            }
            self.pause(attempt);
        }
        Err(AcquisitionError::ServiceUnavailable {
            address,
            attempts: self.config.attempts,
        })
    }

    /// Enable, read and disable one channel. `Ok(None)` means no usable value.
    pub fn read_channel(&mut self, index: usize) -> Result<Option<f64>, AcquisitionError> {
        let Some(channel) = self.slots.get(index).map(|s| s.channel) else {
            return Ok(None);
        };
        let result = self.read_channel_inner(index, channel);
        self.state = CycleState::Idle;
        result
    }

    fn read_channel_inner(
        &mut self,
        index: usize,
        channel: PolledChannel,
    ) -> Result<Option<f64>, AcquisitionError> {
        let address = self.device.address();
        let mut ready = true;

        if let Some(config) = channel.config {
            self.state = CycleState::Enabling;
            if let Err(e) =
                self.link
                    .write(channel.service, config, &ENABLE, WriteMode::WithResponse)
            {
                warn!(%address, sensor = ?channel.sensor, error = %e, "enable write failed");
                ready = false;
            }
            if ready {
                let mut cfg = LinkConfig {
                    link: &mut self.link,
                    service: channel.service,
                    channel: config,
                };
                match self.slots[index].converter.configure(&mut cfg) {
                    Ok(true) => {}
                    Ok(false) => debug!(%address, sensor = ?channel.sensor, "converter not configured yet"),
                    Err(e) => {
                        warn!(%address, sensor = ?channel.sensor, error = %e, "converter configuration failed");
                        ready = false;
                    }
                }
            }
        }

        let value = if ready {
            self.state = CycleState::Reading;
            self.read_with_retry(index, channel)
        } else {
            Ok(None)
        };

        if let Some(config) = channel.config {
            self.state = CycleState::Disabling;
            if let Err(e) =
                self.link
                    .write(channel.service, config, &DISABLE, WriteMode::WithoutResponse)
            {
                debug!(%address, sensor = ?channel.sensor, error = %e, "disable write failed");
            }
        }
        value
    }

    fn read_with_retry(
        &mut self,
        index: usize,
        channel: PolledChannel,
    ) -> Result<Option<f64>, AcquisitionError> {
        let address = self.device.address();
        for attempt in 0..self.config.attempts {
            self.check_cancel()?;
            match self.link.read(channel.service, channel.data) {
                Ok(data) if !data.is_empty() => {
                    let value = self.slots[index].converter.decode(&data);
                    debug!(%address, sensor = ?channel.sensor, attempt, ?value, "channel read");
                    return Ok(value);
                }
                Ok(_) => {}
                Err(e) => debug!(%address, sensor = ?channel.sensor, attempt, error = %e, "read failed"),
            }
            self.pause(attempt);
        }
        debug!(%address, sensor = ?channel.sensor, "no data after retries");
        Ok(None)
    }

    /// One full cycle: discovery if still needed, then every enabled channel, then
    /// registry update and the completeness gate.
    pub fn run_cycle(&mut self) -> Result<CycleReport, AcquisitionError> {
        if !self.discovered {
            self.discover()?;
        }
        let mut report = CycleReport::default();
        if !self.device.enabled() {
            debug!(address = %self.device.address(), "device disabled, skipping cycle");
            return Ok(report);
        }
        let at = OffsetDateTime::now_utc();
        for index in 0..self.slots.len() {
            self.check_cancel()?;
            let kind = self.slots[index].channel.sensor;
            if !self.device.sensor(kind).is_some_and(|s| s.enabled()) {
                continue;
            }
            let value = self.read_channel(index)?;
            report.values.push((kind, value));
        }

        for (kind, value) in &report.values {
            if let Some(v) = value {
                if self.device.set_data(*kind, *v) {
                    report.written += 1;
                }
            }
        }
        if report.written > 0 {
            if let Some(emitter) = &self.emitter {
                refresh_and_emit(&self.device, emitter, at);
            }
        }
        if let Some(m) = &self.metrics {
            m.acquisition_cycles.inc();
        }
        Ok(report)
    }
}
