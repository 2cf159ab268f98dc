//! Device Scanner
//!
//! Polls the configured device locations, resolves aliases to canonical
//! identities and opens devices as they appear. Each opened device is handed
//! to an [`OpenHandler`]; a closure watcher untracks it again once it closes
//! so that it is picked up on a later tick.
//!
//! # Pacing
//!
//! After every tick the scanner sleeps for `scan_interval` while fewer than
//! `expected_ports` devices are open, and for `idle_scan_interval` otherwise
//! (or while paused). The sleep is cut short by [`DeviceScanner::resume`] and
//! by the closure of a device that the handler accepted. Such a wake-up that
//! arrives while a tick is still running starts the next tick right away.

use std::collections::HashMap;
use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::config::{PortConfig, ScannerConfig};
use crate::serial::{self, Device, DeviceIdentity, DeviceOpener};
use crate::sleep::InterruptibleSleep;


/// Receives every device the scanner opens
#[async_trait]
pub trait OpenHandler: Send + Sync {
    /// Take up a freshly opened device.
    ///
    /// Returning an error makes the scanner force-close the device; it is
    /// offered again on a later tick.
    async fn device_opened(
        &self,
        device: &Device,
        port: &PortConfig,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// A device the scanner currently holds open
struct PortRecord {
    port: PortConfig,
    device: Device,
    /// Set once the handler accepted the device
    announced: Arc<AtomicBool>,
}

type Tracked = Arc<Mutex<HashMap<DeviceIdentity, PortRecord>>>;

/// Discovers, opens and reclaims serial devices
pub struct DeviceScanner {
    ports: Vec<PortConfig>,
    settings: ScannerConfig,
    opener: Arc<dyn DeviceOpener>,
    handler: Arc<dyn OpenHandler>,
    tracked: Tracked,
    paused: AtomicBool,
    wake: Arc<Wake>,
}

/// Wake-up requests for the scan loop.
///
/// A request made while a tick is running is remembered and honored
/// before the loop goes back to sleep.
#[derive(Default)]
struct Wake {
    requested: AtomicBool,
    sleep: InterruptibleSleep,
}

impl Wake {
    fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.sleep.interrupt();
    }

    fn clear(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }

    async fn sleep(&self, interval: Duration) {
        let outcome = self
            .sleep
            .sleep_unless(interval, || self.requested.load(Ordering::SeqCst))
            .await;
        trace!("Scanner: woke up ({:?})", outcome);
    }
}

impl DeviceScanner {
    pub fn new(
        ports: Vec<PortConfig>,
        settings: ScannerConfig,
        opener: Arc<dyn DeviceOpener>,
        handler: Arc<dyn OpenHandler>,
    ) -> Self {
        Self {
            ports,
            settings,
            opener,
            handler,
            tracked: Arc::new(Mutex::new(HashMap::new())),
            paused: AtomicBool::new(false),
            wake: Arc::new(Wake::default()),
        }
    }

    /// Stop scanning until [`resume`](Self::resume)
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            debug!("Scanner: paused");
        }
    }

    /// Resume scanning and cut the pending sleep short
    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            debug!("Scanner: resumed");
        }
        self.wake.request();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Number of devices currently held open
    pub fn tracked_count(&self) -> usize {
        self.tracked.lock().len()
    }

    pub fn tracked_identities(&self) -> Vec<DeviceIdentity> {
        let mut identities: Vec<_> = self.tracked.lock().keys().cloned().collect();
        identities.sort();
        identities
    }

    /// Configured location behind a tracked identity
    pub fn tracked_port(&self, identity: &DeviceIdentity) -> Option<PortConfig> {
        self.tracked.lock().get(identity).map(|record| record.port.clone())
    }

    /// Run the scan loop. Never returns.
    pub async fn run(&self) {
        info!(
            "Scanner: watching {} location(s), expecting {} device(s)",
            self.ports.len(),
            self.settings.expected_ports
        );

        loop {
            self.wake.clear();
            if !self.is_paused() {
                self.tick().await;
            }

            let interval = self.next_interval();
            trace!("Scanner: next scan in {:?}", interval);
            self.wake.sleep(interval).await;
        }
    }

    /// Sleep to take before the next tick
    pub fn next_interval(&self) -> Duration {
        if !self.is_paused() && self.tracked_count() < self.settings.expected_ports {
            self.settings.scan_interval
        } else {
            self.settings.idle_scan_interval
        }
    }

    /// One discovery pass: resolve, reclaim vanished devices, open new ones
    pub async fn tick(&self) {
        let present = self.resolve_all().await;
        self.reclaim_vanished(&present);

        for (identity, port) in present {
            if self.tracked.lock().contains_key(&identity) {
                continue;
            }
            self.open(identity, port).await;
        }
    }

    /// Resolve every location; the first location to claim an identity wins
    async fn resolve_all(&self) -> Vec<(DeviceIdentity, &PortConfig)> {
        let mut present: Vec<(DeviceIdentity, &PortConfig)> = Vec::new();

        for port in &self.ports {
            match serial::resolve(&port.path).await {
                Ok(identity) => {
                    if let Some((_, first)) = present.iter().find(|(i, _)| *i == identity) {
                        trace!(
                            "Scanner: {} is an alias of {}, using options of {}",
                            port.path.display(),
                            identity,
                            first.path.display()
                        );
                        continue;
                    }
                    present.push((identity, port));
                }
                Err(e) => trace!("Scanner: {} not available: {}", port.path.display(), e),
            }
        }

        present
    }

    fn reclaim_vanished(&self, present: &[(DeviceIdentity, &PortConfig)]) {
        let vanished: Vec<PortRecord> = {
            let mut tracked = self.tracked.lock();
            let gone: Vec<DeviceIdentity> = tracked
                .keys()
                .filter(|identity| !present.iter().any(|(p, _)| p == *identity))
                .cloned()
                .collect();
            gone.iter().filter_map(|i| tracked.remove(i)).collect()
        };

        for record in vanished {
            info!(
                "Scanner: {} ({}) disappeared",
                record.device.identity(),
                record.port.path.display()
            );
            record.device.close();
        }
    }

    async fn open(&self, identity: DeviceIdentity, port: &PortConfig) {
        let settings = port.serial_settings();
        let device = match self.opener.open(&identity, &settings, port.framing()).await {
            Ok(device) => device,
            Err(e) => {
                warn!("Scanner: cannot open {}: {}", identity, e);
                return;
            }
        };
        info!("Scanner: opened {} at {}", identity, settings);

        let announced = Arc::new(AtomicBool::new(false));
        self.tracked.lock().insert(
            identity.clone(),
            PortRecord {
                port: port.clone(),
                device: device.clone(),
                announced: announced.clone(),
            },
        );
        self.watch_closure(device.clone(), announced.clone());

        match self.handler.device_opened(&device, port).await {
            Ok(()) => announced.store(true, Ordering::SeqCst),
            Err(e) => {
                warn!("Scanner: {} was not taken up: {}", identity, e);
                untrack(&self.tracked, &identity, device.id());
                device.close();
            }
        }
    }

    /// Untrack the device once it closes; wake the loop if it had been announced
    fn watch_closure(&self, device: Device, announced: Arc<AtomicBool>) {
        let tracked = self.tracked.clone();
        let wake = self.wake.clone();

        tokio::spawn(async move {
            device.closed().await;
            if untrack(&tracked, device.identity(), device.id()) {
                info!("Scanner: {} closed", device.identity());
            }
            if announced.load(Ordering::SeqCst) {
                wake.request();
            }
        });
    }
}

/// Remove the record for `identity` if it still belongs to device `id`
fn untrack(
    tracked: &Mutex<HashMap<DeviceIdentity, PortRecord>>,
    identity: &DeviceIdentity,
    id: u64,
) -> bool {
    let mut tracked = tracked.lock();
    match tracked.get(identity) {
        Some(record) if record.device.id() == id => {
            tracked.remove(identity);
            true
        }
        _ => false,
    }
}
