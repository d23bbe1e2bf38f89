//! Sends ASCII commands to every connected radio, and optionally watches the
//! replies for an acknowledgement.

use crate::config::{AckPolicy, CommandSet};
use crate::connection_manager::{ConnectionManager, DeviceConnection};
use log::{debug, info, warn};
use std::{
    collections::HashMap,
    io::ErrorKind,
    sync::Arc,
    thread::sleep,
    time::Duration,
};

/// What came of an acknowledged command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Some device printed the expected text.
    Acknowledged,
    /// The command went out but nobody confirmed it within the policy.
    Unconfirmed,
    /// No device accepted the write.
    NotSent,
}

/// The write side of the serial protocol.
pub struct CommandChannel {
    devices: Arc<ConnectionManager>,
    commands: CommandSet,
    ack: AckPolicy,
}

impl CommandChannel {
    /// A channel writing to the devices of `devices`.
    pub fn new(devices: Arc<ConnectionManager>, commands: CommandSet, ack: AckPolicy) -> Self {
        Self {
            devices,
            commands,
            ack,
        }
    }

    /// The connection manager this channel writes through.
    pub fn devices(&self) -> &Arc<ConnectionManager> {
        &self.devices
    }

    /// The command codes in use.
    pub fn commands(&self) -> &CommandSet {
        &self.commands
    }

    /// Write `command` and a newline to every connected device. True if at
    /// least one device took the write; one failing device does not stop the
    /// others.
    pub fn send(&self, command: &str) -> bool {
        let connections = self.devices.connections();
        if connections.is_empty() {
            warn!("No device connected, '{}' not sent", command);
            return false;
        }

        let bytes = format!("{}\n", command);
        let mut accepted = 0;
        for connection in &connections {
            let link = connection.link();
            match link.write_all(bytes.as_bytes()).and_then(|_| link.flush()) {
                Ok(()) => {
                    debug!("Sent '{}' to {}", command, connection.port());
                    accepted += 1;
                }
                Err(e) => warn!("Failed to send '{}' to {}: {}", command, connection.port(), e),
            }
        }
        accepted > 0
    }

    /// Send `command` and watch the inbound lines of every device for
    /// `expected`, re-sending up to the policy's attempt count. Must only be
    /// used while no read loop is running, since it consumes inbound bytes.
    pub fn send_and_confirm(&self, command: &str, expected: &str) -> AckOutcome {
        let mut sent_any = false;
        let mut partial: HashMap<String, Vec<u8>> = HashMap::new();

        for attempt in 1..=self.ack.attempts {
            if self.send(command) {
                sent_any = true;
                sleep(Duration::from_millis(self.ack.settle_ms));
                for _ in 0..self.ack.checks {
                    if self.poll_for(&mut partial, expected) {
                        info!("'{}' acknowledged on attempt {}", command, attempt);
                        return AckOutcome::Acknowledged;
                    }
                    sleep(Duration::from_millis(self.ack.check_interval_ms));
                }
            }
            sleep(Duration::from_millis(self.ack.retry_delay_ms));
        }

        if sent_any {
            warn!("'{}' was not acknowledged, continuing anyway", command);
            AckOutcome::Unconfirmed
        } else {
            AckOutcome::NotSent
        }
    }

    fn poll_for(&self, partial: &mut HashMap<String, Vec<u8>>, expected: &str) -> bool {
        let mut buf = [0u8; 512];
        for connection in self.devices.connections() {
            let pending = partial.entry(connection.port().to_owned()).or_default();
            match connection.link().read(&mut buf) {
                Ok(n) => pending.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::TimedOut => continue,
                Err(e) => {
                    debug!("Read from {} during ack probe failed: {}", connection.port(), e);
                    continue;
                }
            }
            while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                if String::from_utf8_lossy(&line).contains(expected) {
                    return true;
                }
            }
        }
        false
    }

    /// Put every radio into serial CSI output and start capture. If nothing
    /// is connected, reconnect once first. The acknowledgement is best
    /// effort; the result is false only if no device could be written to.
    pub fn arm(&self) -> bool {
        if !self.devices.is_connected() {
            info!("No device connected, attempting reconnection");
            if self.devices.reconnect().is_empty() {
                warn!("Reconnection found no device");
                return false;
            }
        }

        let outcome = self.send_and_confirm(&self.commands.serial_mode, &self.commands.serial_mode_ack);
        debug!("Serial mode command: {:?}", outcome);
        self.send(&self.commands.start_listen)
    }

    /// Tell every radio to stop capturing.
    pub fn disarm(&self) -> bool {
        if !self.devices.is_connected() {
            debug!("No device connected during stop");
            return false;
        }
        self.send(&self.commands.stop_listen)
    }

    /// Handles to the devices the channel currently writes to.
    pub fn connections(&self) -> Vec<DeviceConnection> {
        self.devices.connections()
    }
}
