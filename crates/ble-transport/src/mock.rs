use crate::{BleAddress, ChannelId, GattLink, Result, ServiceId, TransportError, WriteMode};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// A write observed by the mock link.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WriteRecord {
    pub service: ServiceId,
    pub channel: ChannelId,
    pub data: Vec<u8>,
    pub mode: WriteMode,
}

#[derive(Default)]
struct MockState {
    access_allowed: bool,
    empty_discoveries: usize,
    services: Vec<ServiceId>,
    queued: HashMap<(ServiceId, ChannelId), VecDeque<Vec<u8>>>,
    stored: HashMap<(ServiceId, ChannelId), Vec<u8>>,
    fail_writes: bool,
    writes: Vec<WriteRecord>,
    reads: usize,
    discoveries: usize,
}

/// A scripted in-process GATT link.
///
/// Clones share state, so a test can keep a handle for inspection after moving the
/// link into a poller. Reads pop scripted responses first and then fall back to the
/// last stored or written value; a channel with neither returns an empty payload.
#[derive(Clone)]
pub struct MockGattLink {
    address: BleAddress,
    state: Arc<Mutex<MockState>>,
}

impl MockGattLink {
    pub fn new(address: BleAddress) -> Self {
        let state = MockState {
            access_allowed: true,
            ..Default::default()
        };
        Self {
            address,
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MockState>> {
        self.state
            .lock()
            .map_err(|_| TransportError::Io("mock state poisoned".to_string()))
    }

    pub fn with_services(self, services: &[ServiceId]) -> Self {
        if let Ok(mut s) = self.lock() {
            s.services = services.to_vec();
        }
        self
    }

    pub fn deny_access(self) -> Self {
        if let Ok(mut s) = self.lock() {
            s.access_allowed = false;
        }
        self
    }

    /// The first `n` discovery attempts report no services.
    pub fn with_empty_discoveries(self, n: usize) -> Self {
        if let Ok(mut s) = self.lock() {
            s.empty_discoveries = n;
        }
        self
    }

    pub fn with_failing_writes(self) -> Self {
        if let Ok(mut s) = self.lock() {
            s.fail_writes = true;
        }
        self
    }

    /// Persistent channel value, e.g. a configuration record.
    pub fn set_value(&self, service: ServiceId, channel: ChannelId, data: &[u8]) {
        if let Ok(mut s) = self.lock() {
            s.stored.insert((service, channel), data.to_vec());
        }
    }

    /// Queue one-shot read responses, consumed in order.
    pub fn push_reads(&self, service: ServiceId, channel: ChannelId, responses: &[&[u8]]) {
        if let Ok(mut s) = self.lock() {
            let q = s.queued.entry((service, channel)).or_default();
            for r in responses {
                q.push_back(r.to_vec());
            }
        }
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.lock().map(|s| s.writes.clone()).unwrap_or_default()
    }

    pub fn read_count(&self) -> usize {
        self.lock().map(|s| s.reads).unwrap_or_default()
    }

    pub fn discovery_count(&self) -> usize {
        self.lock().map(|s| s.discoveries).unwrap_or_default()
    }
}

impl GattLink for MockGattLink {
    fn address(&self) -> BleAddress {
        self.address
    }

    fn request_access(&mut self) -> Result<()> {
        if self.lock()?.access_allowed {
            Ok(())
        } else {
            debug!(address = %self.address, "mock: access denied");
            Err(TransportError::AccessDenied(self.address.to_string()))
        }
    }

    fn discover_services(&mut self) -> Result<Vec<ServiceId>> {
        let mut s = self.lock()?;
        s.discoveries += 1;
        if s.empty_discoveries > 0 {
            s.empty_discoveries -= 1;
            return Ok(Vec::new());
        }
        Ok(s.services.clone())
    }

    fn read(&mut self, service: ServiceId, channel: ChannelId) -> Result<Vec<u8>> {
        let mut s = self.lock()?;
        s.reads += 1;
        if !s.services.contains(&service) {
            debug!(address = %self.address, %service, "mock: read from unknown service");
            return Err(TransportError::ServiceNotFound(service.to_string()));
        }
        if let Some(next) = s.queued.get_mut(&(service, channel)).and_then(|q| q.pop_front()) {
            return Ok(next);
        }
        Ok(s.stored.get(&(service, channel)).cloned().unwrap_or_default())
    }

    fn write(
        &mut self,
        service: ServiceId,
        channel: ChannelId,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<()> {
        let mut s = self.lock()?;
        if s.fail_writes {
            debug!(address = %self.address, %channel, len = data.len(), "mock: write rejected");
            return Err(TransportError::Io("write rejected".to_string()));
        }
        s.writes.push(WriteRecord {
            service,
            channel,
            data: data.to_vec(),
            mode,
        });
        s.stored.insert((service, channel), data.to_vec());
        Ok(())
    }
}
