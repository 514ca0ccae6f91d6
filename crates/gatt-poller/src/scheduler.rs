use crate::{Acquisition, AcquisitionError, CancelToken, CycleReport};
use ble_transport::{BleAddress, GattLink};
use std::sync::{Arc, Mutex, TryLockError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// An acquisition shared between the timer and manual triggers.
pub struct DevicePoller<L: GattLink> {
    address: BleAddress,
    inner: Mutex<Acquisition<L>>,
}

impl<L: GattLink> DevicePoller<L> {
    pub fn new(acquisition: Acquisition<L>) -> Self {
        Self {
            address: acquisition.device().address(),
            inner: Mutex::new(acquisition),
        }
    }

    pub fn address(&self) -> BleAddress {
        self.address
    }

    /// Run one cycle unless another one already holds the device.
    pub fn try_run_cycle(&self) -> Result<CycleReport, AcquisitionError> {
        let mut guard = match self.inner.try_lock() {
            Ok(g) => g,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(AcquisitionError::Busy(self.address)),
        };
        guard.run_cycle()
    }
}

/// Handle to a running per-device poller.
pub struct PollerHandle {
    trigger: mpsc::Sender<()>,
    cancel: CancelToken,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Request an immediate cycle. Dropped when one is already pending.
    pub fn trigger(&self) {
        if self.trigger.try_send(()).is_err() {
            debug!("trigger already pending");
        }
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        drop(self.trigger);
        if let Err(e) = self.task.await {
            warn!("poller task ended abnormally: {e}");
        }
    }
}

/// Spawn the periodic poller for one device.
///
/// The first tick fires immediately and performs discovery. Each tick or manual
/// trigger starts a cycle on the blocking pool; a trigger that finds a cycle still
/// running is ignored.
pub fn spawn_poller<L: GattLink + 'static>(acquisition: Acquisition<L>) -> PollerHandle {
    let interval = acquisition.config().interval;
    let cancel = acquisition.cancel_token();
    let poller = Arc::new(DevicePoller::new(acquisition));
    let address = poller.address();
    let (tx, mut rx) = mpsc::channel::<()>(1);
    let stop = cancel.clone();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(%address, ?interval, "poller started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                msg = rx.recv() => {
                    if msg.is_none() {
                        break;
                    }
                }
            }
            if stop.is_cancelled() {
                break;
            }
            let poller = Arc::clone(&poller);
            tokio::task::spawn_blocking(move || match poller.try_run_cycle() {
                Ok(report) => debug!(%address, written = report.written, "cycle complete"),
                Err(AcquisitionError::Busy(_)) => debug!(%address, "cycle in flight, trigger ignored"),
                Err(e) => warn!(%address, error = %e, "cycle aborted"),
            });
        }
        info!(%address, "poller stopped");
    });

    PollerHandle {
        trigger: tx,
        cancel,
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AcquisitionConfig;
    use ble_transport::{ChannelId, MockGattLink, ServiceId};
    use sensor_registry::{
        ConverterKind, DeviceKind, DeviceSpec, InlineDispatcher, PolledChannel, RecordingSink,
        RecordingUplink, Registry, SensorKind, TelemetryEmitter,
    };
    use std::time::Duration;

    fn setup() -> (Registry, MockGattLink, Vec<PolledChannel>) {
        let address = BleAddress::new(0xECFE_7E10_9D7E).unwrap();
        let registry = Registry::builder(Arc::new(InlineDispatcher))
            .device(DeviceSpec {
                address,
                name: "SensorBug".into(),
                description: "On the floor".into(),
                kind: DeviceKind::GenericPolled,
                sensors: vec![(SensorKind::BatteryPercent, "Battery level in %".into())],
            })
            .unwrap()
            .build();
        let channels = vec![PolledChannel {
            sensor: SensorKind::BatteryPercent,
            service: ServiceId::from_short(0x180F),
            data: ChannelId::from_short(0x2A19),
            config: None,
            converter: ConverterKind::BatteryLevel,
        }];
        let link = MockGattLink::new(address).with_services(&[channels[0].service]);
        link.set_value(channels[0].service, channels[0].data, &[64]);
        (registry, link, channels)
    }

    fn config(interval: Duration) -> AcquisitionConfig {
        AcquisitionConfig {
            attempts: 5,
            spacing: Duration::ZERO,
            interval,
        }
    }

    #[test]
    fn second_trigger_is_ignored_while_a_cycle_runs() {
        let (registry, link, channels) = setup();
        let acq = Acquisition::new(
            link,
            registry.devices()[0].clone(),
            &channels,
            config(Duration::from_secs(30)),
        );
        let poller = DevicePoller::new(acq);
        let held = poller.inner.lock().unwrap();
        assert!(matches!(
            poller.try_run_cycle(),
            Err(AcquisitionError::Busy(a)) if a == poller.address()
        ));
        drop(held);
        assert_eq!(poller.try_run_cycle().unwrap().written, 1);
    }

    #[tokio::test]
    async fn poller_runs_on_start_and_on_trigger() {
        let (registry, link, channels) = setup();
        let probe = link.clone();
        let uplink = Arc::new(RecordingUplink::default());
        let emitter =
            TelemetryEmitter::new(uplink.clone(), Arc::new(RecordingSink::default()), "gw");
        let acq = Acquisition::new(
            link,
            registry.devices()[0].clone(),
            &channels,
            config(Duration::from_secs(3600)),
        )
        .with_emitter(emitter);

        let handle = spawn_poller(acq);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(probe.discovery_count(), 1);
        assert_eq!(uplink.records().len(), 1);

        probe.set_value(channels[0].service, channels[0].data, &[63]);
        handle.trigger();
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.shutdown().await;

        assert_eq!(probe.discovery_count(), 1);
        assert_eq!(probe.read_count(), 2);
        assert_eq!(
            registry.devices()[0]
                .sensor(SensorKind::BatteryPercent)
                .unwrap()
                .displayed(),
            Some(63.0)
        );
        assert_eq!(uplink.records().len(), 2);
    }

    #[tokio::test]
    async fn interval_re_triggers_without_manual_triggers() {
        let (registry, link, channels) = setup();
        let probe = link.clone();
        let acq = Acquisition::new(
            link,
            registry.devices()[0].clone(),
            &channels,
            config(Duration::from_millis(100)),
        );

        let handle = spawn_poller(acq);
        tokio::time::sleep(Duration::from_millis(450)).await;
        handle.shutdown().await;

        assert!(probe.read_count() >= 3, "reads: {}", probe.read_count());
        assert_eq!(probe.discovery_count(), 1);
    }
}
