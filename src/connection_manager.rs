//! Finds the radios attached to this machine and keeps their links open.

use crate::config::SerialConfig;
use crate::device::{DeviceClassifier, PortInfo, SerialBackend, SerialLink};
use log::{info, warn};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::sleep,
};

/// One open radio. Cloning shares the link and every flag.
#[derive(Clone)]
pub struct DeviceConnection {
    port: String,
    link: Arc<dyn SerialLink>,
    alive: Arc<AtomicBool>,
    listening: Arc<AtomicBool>,
    reader_claimed: Arc<AtomicBool>,
}

impl DeviceConnection {
    /// Wrap an already opened link.
    pub fn new(port: impl Into<String>, link: Arc<dyn SerialLink>) -> Self {
        Self {
            port: port.into(),
            link,
            alive: Arc::new(AtomicBool::new(true)),
            listening: Arc::new(AtomicBool::new(false)),
            reader_claimed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The port identifier the link was opened on.
    pub fn port(&self) -> &str {
        &self.port
    }

    /// The byte link.
    pub fn link(&self) -> &Arc<dyn SerialLink> {
        &self.link
    }

    /// False once the read loop gave up on the device.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Record that the device stopped responding.
    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// The read-loop control flag of this device.
    pub fn listening_flag(&self) -> Arc<AtomicBool> {
        self.listening.clone()
    }

    /// Ask the read loop of this device to exit.
    pub fn request_stop(&self) {
        self.listening.store(false, Ordering::SeqCst);
    }

    /// Take the single read-loop slot of this device. False while an earlier
    /// loop is still running.
    pub(crate) fn claim_reader(&self) -> bool {
        self.reader_claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn release_reader(&self) {
        self.reader_claimed.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("port", &self.port)
            .field("alive", &self.is_alive())
            .field("listening", &self.listening.load(Ordering::SeqCst))
            .finish()
    }
}

/// Owns every [DeviceConnection]. Discovery never fails: ports that cannot be
/// listed or opened are logged and skipped.
pub struct ConnectionManager {
    backend: Box<dyn SerialBackend>,
    classifier: Box<dyn DeviceClassifier>,
    config: SerialConfig,
    devices: Mutex<BTreeMap<String, DeviceConnection>>,
}

impl ConnectionManager {
    /// A manager with no open devices; call [ConnectionManager::discover] to
    /// populate it.
    pub fn new(
        backend: Box<dyn SerialBackend>,
        classifier: Box<dyn DeviceClassifier>,
        config: SerialConfig,
    ) -> Self {
        Self {
            backend,
            classifier,
            config,
            devices: Mutex::new(BTreeMap::new()),
        }
    }

    /// Compatible ports present on the host, opened or not.
    pub fn scan(&self) -> Vec<PortInfo> {
        match self.backend.list_ports() {
            Ok(ports) => ports
                .into_iter()
                .filter(|p| self.classifier.is_compatible(p))
                .collect(),
            Err(e) => {
                warn!("Could not enumerate serial ports: {}", e);
                Vec::new()
            }
        }
    }

    /// Open every compatible port that is not open yet, and return the names
    /// of all connected devices.
    ///
    /// Each fresh port gets a settle delay, a lone newline to wake the
    /// console, and a second delay before it is considered ready.
    pub fn discover(&self) -> Vec<String> {
        let candidates = self.scan();
        if candidates.is_empty() {
            info!("No compatible radio found");
        }

        for port in candidates {
            if self.devices().contains_key(&port.name) {
                continue;
            }
            match self.open(&port) {
                Ok(connection) => {
                    info!("Connected to {} ({})", port.name, port.description);
                    self.devices().insert(port.name.clone(), connection);
                }
                Err(e) => warn!("Failed to connect to {}: {}", port.name, e),
            }
        }

        self.connected()
    }

    fn open(&self, port: &PortInfo) -> std::io::Result<DeviceConnection> {
        let link = self.backend.open(port, &self.config)?;
        sleep(self.config.settle_delay());
        link.write_all(b"\n")?;
        sleep(self.config.probe_delay());
        Ok(DeviceConnection::new(port.name.clone(), link))
    }

    /// Drop devices whose read loop gave up, then discover again. Devices
    /// that are still open are left alone, so this is safe to call before
    /// every session.
    pub fn reconnect(&self) -> Vec<String> {
        self.devices().retain(|name, connection| {
            let keep = connection.is_alive();
            if !keep {
                info!("Forgetting {}, it stopped responding", name);
            }
            keep
        });
        self.discover()
    }

    /// Names of the connected devices.
    pub fn connected(&self) -> Vec<String> {
        self.devices().keys().cloned().collect()
    }

    /// True if at least one connected device is still alive. Devices whose
    /// read loop gave up stay listed until the next [Self::reconnect], but
    /// do not count here.
    pub fn is_connected(&self) -> bool {
        self.devices().values().any(DeviceConnection::is_alive)
    }

    /// Handles to every connected device.
    pub fn connections(&self) -> Vec<DeviceConnection> {
        self.devices().values().cloned().collect()
    }

    /// Close one device. Returns false if it was not connected.
    pub fn disconnect(&self, port: &str) -> bool {
        match self.devices().remove(port) {
            Some(connection) => {
                connection.request_stop();
                info!("Disconnected {}", port);
                true
            }
            None => false,
        }
    }

    /// Close every device.
    pub fn disconnect_all(&self) {
        let drained = std::mem::take(&mut *self.devices());
        for (port, connection) in drained {
            connection.request_stop();
            info!("Disconnected {}", port);
        }
    }

    fn devices(&self) -> MutexGuard<'_, BTreeMap<String, DeviceConnection>> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }
}
