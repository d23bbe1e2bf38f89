//! A software stand-in for ESP32 CSI radios.
//!
//! [DummyBackend] enumerates a configurable number of fake USB-serial ports.
//! Each opened [DummyRadio] behaves like the firmware: it echoes commands,
//! prints the serial-mode acknowledgement, and while listening emits one
//! `CSI_DATA` line per period with a slowly wandering RSSI. Diagnostic text
//! and invalid UTF-8 are mixed in so the ingestion path sees what real radios
//! send, and read failures can be injected to exercise device loss.

use crate::config::{CommandSet, SerialConfig};
use crate::device::{PortInfo, SerialBackend, SerialLink};
use rand::prelude::*;
use std::{
    collections::{HashSet, VecDeque},
    io,
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::{Duration, Instant},
};

const SUBCARRIER_WORDS: usize = 128;

/// A [SerialBackend] full of simulated radios.
#[derive(Debug)]
pub struct DummyBackend {
    ports: Mutex<Vec<PortInfo>>,
    refused: HashSet<String>,
    radio: RadioSettings,
    opened: Mutex<Vec<Arc<DummyRadio>>>,
}

/// How every radio of a [DummyBackend] behaves.
#[derive(Debug, Clone)]
pub struct RadioSettings {
    /// Delay between two CSI lines while listening.
    pub period: Duration,
    /// How long an empty read blocks before timing out.
    pub read_timeout: Duration,
    /// Emit a diagnostic line every this many packets; zero disables it.
    pub noise_every: u64,
    /// Fail every read once this many packets were emitted.
    pub fail_after: Option<u64>,
    /// Command codes the radio reacts to.
    pub commands: CommandSet,
}

impl Default for RadioSettings {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(10),
            read_timeout: Duration::from_millis(5),
            noise_every: 25,
            fail_after: None,
            commands: CommandSet::default(),
        }
    }
}

impl DummyBackend {
    /// A backend with `n` compatible radios on `/dev/ttySIM0..n`.
    pub fn new(n: usize) -> Self {
        Self::with_settings(n, RadioSettings::default())
    }

    /// A backend with `n` radios that all behave according to `radio`.
    pub fn with_settings(n: usize, radio: RadioSettings) -> Self {
        let ports = (0..n)
            .map(|i| PortInfo {
                name: format!("/dev/ttySIM{}", i),
                description: "CP2102 USB to UART Bridge Controller (simulated)".to_owned(),
                usb_id: Some((0x10c4, 0xea60)),
            })
            .collect();
        Self {
            ports: Mutex::new(ports),
            refused: HashSet::new(),
            radio,
            opened: Mutex::new(Vec::new()),
        }
    }

    /// A backend that finds nothing at all.
    pub fn empty() -> Self {
        Self::new(0)
    }

    /// Add a port that is not a radio, such as a built-in modem.
    pub fn with_foreign_port(self, name: &str, description: &str) -> Self {
        lock(&self.ports).push(PortInfo {
            name: name.to_owned(),
            description: description.to_owned(),
            usb_id: None,
        });
        self
    }

    /// Make opening `name` fail, as if another program held it.
    pub fn refuse(mut self, name: &str) -> Self {
        self.refused.insert(name.to_owned());
        self
    }

    /// Plug in another radio while running.
    pub fn plug(&self) -> String {
        let mut ports = lock(&self.ports);
        let name = format!("/dev/ttySIM{}", ports.len());
        ports.push(PortInfo {
            name: name.clone(),
            description: "CP2102 USB to UART Bridge Controller (simulated)".to_owned(),
            usb_id: Some((0x10c4, 0xea60)),
        });
        name
    }

    /// Every radio opened so far, in opening order.
    pub fn radios(&self) -> Vec<Arc<DummyRadio>> {
        lock(&self.opened).clone()
    }
}

impl SerialBackend for DummyBackend {
    fn list_ports(&self) -> io::Result<Vec<PortInfo>> {
        Ok(lock(&self.ports).clone())
    }

    fn open(&self, port: &PortInfo, _config: &SerialConfig) -> io::Result<Arc<dyn SerialLink>> {
        if self.refused.contains(&port.name) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is busy", port.name),
            ));
        }
        let radio = Arc::new(DummyRadio::new(&port.name, self.radio.clone()));
        lock(&self.opened).push(radio.clone());
        Ok(radio)
    }
}

/// One simulated radio.
#[derive(Debug)]
pub struct DummyRadio {
    name: String,
    settings: RadioSettings,
    state: Mutex<RadioState>,
}

#[derive(Debug)]
struct RadioState {
    outbox: VecDeque<u8>,
    inbox: Vec<u8>,
    received: Vec<String>,
    listening: bool,
    next_packet: Instant,
    emitted: u64,
    rssi: i32,
}

impl DummyRadio {
    fn new(name: &str, settings: RadioSettings) -> Self {
        Self {
            name: name.to_owned(),
            settings,
            state: Mutex::new(RadioState {
                outbox: VecDeque::new(),
                inbox: Vec::new(),
                received: Vec::new(),
                listening: false,
                next_packet: Instant::now(),
                emitted: 0,
                rssi: -60,
            }),
        }
    }

    /// The port this radio pretends to sit on.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Every newline-terminated command received so far.
    pub fn received_commands(&self) -> Vec<String> {
        lock(&self.state).received.clone()
    }

    /// Whether the radio is currently streaming.
    pub fn is_listening(&self) -> bool {
        lock(&self.state).listening
    }

    /// Queue raw bytes as if the firmware had printed them.
    pub fn inject(&self, bytes: &[u8]) {
        lock(&self.state).outbox.extend(bytes);
    }

    /// Number of CSI lines produced so far.
    pub fn emitted(&self) -> u64 {
        lock(&self.state).emitted
    }

    fn handle_command(&self, state: &mut RadioState, command: &str) {
        let commands = &self.settings.commands;
        state.received.push(command.to_owned());
        if command == commands.serial_mode {
            state
                .outbox
                .extend(format!("{}\n", commands.serial_mode_ack).as_bytes());
        } else if command == commands.start_listen {
            state.listening = true;
            state.next_packet = Instant::now();
            state.outbox.extend(b"I (1234) csi_recv: listening\n");
        } else if command == commands.stop_listen {
            state.listening = false;
            state.outbox.extend(b"I (1235) csi_recv: stopped\n");
        } else if !command.is_empty() {
            state
                .outbox
                .extend(format!("W (1236) console: unknown command '{}'\n", command).as_bytes());
        }
    }

    fn produce(&self, state: &mut RadioState) {
        if !state.listening {
            return;
        }
        let now = Instant::now();
        let mut rng = thread_rng();
        while state.next_packet <= now {
            state.emitted += 1;
            state.rssi = (state.rssi + rng.gen_range(-2..=2)).clamp(-95, -20);
            let line = csi_line(state.emitted, state.rssi, &mut rng);
            state.outbox.extend(line.as_bytes());
            let noise_every = self.settings.noise_every;
            if noise_every > 0 && state.emitted % noise_every == 0 {
                state.outbox.extend(b"I (5678) wifi: beacon timeout\n");
                state.outbox.extend([0xFF, 0xFE, b'\n']);
            }
            state.next_packet += self.settings.period;
        }
    }
}

impl SerialLink for DummyRadio {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        {
            let mut state = lock(&self.state);
            if let Some(limit) = self.settings.fail_after {
                if state.emitted >= limit {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        format!("{} unplugged", self.name),
                    ));
                }
            }
            self.produce(&mut state);
            if !state.outbox.is_empty() {
                let n = buf.len().min(state.outbox.len());
                for (slot, byte) in buf.iter_mut().zip(state.outbox.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
        }
        thread::sleep(self.settings.read_timeout);
        Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"))
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut state = lock(&self.state);
        state.inbox.extend_from_slice(buf);
        while let Some(pos) = state.inbox.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = state.inbox.drain(..=pos).collect();
            let command = String::from_utf8_lossy(&line).trim().to_owned();
            self.handle_command(&mut state, &command);
        }
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

/// A well-formed CSI line as the ESP32 `csi_recv` firmware prints it.
pub fn csi_line(id: u64, rssi: i32, rng: &mut impl Rng) -> String {
    let data: Vec<String> = (0..SUBCARRIER_WORDS)
        .map(|_| rng.gen_range(-64..64).to_string())
        .collect();
    format!(
        "CSI_DATA,{},c0:5d:89:de:0d:85,{},11,1,4,0,1,1,1,0,0,0,-97,1,1,2,30198,0,89,0,{},0,[{}]\n",
        id,
        rssi,
        SUBCARRIER_WORDS,
        data.join(",")
    )
}

// The simulated firmware keeps no invariants across a panic worth protecting.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
