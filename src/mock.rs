//! Scripted in-memory transport for tests

use crate::ble::{DiscoveryFilter, Link, Notification, Transport};
use crate::error::{AromaTechError, Result};
use crate::protocol::{decode_command, CommandIntent, OIL_NAME_LEN};
use crate::types::{DiscoveredDevice, ProtocolVersion};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

pub(crate) const MOCK_ADDRESS: &str = "C0:FF:EE:00:00:01";

/// Behaviour of the simulated diffuser
#[derive(Debug, Clone)]
pub(crate) struct ScriptedDevice {
    pub version: ProtocolVersion,
    pub password: &'static str,
    pub feature_bits: u8,
    pub max_intensity: u8,
    pub name: &'static str,
    pub oil_names: Vec<&'static str>,
    pub rssi: Option<i16>,
    pub answers_login: bool,
    /// Level the diffuser runs at before the first command
    pub intensity: u8,
    /// Send the schedule ahead of the limits in the login burst
    pub status_first: bool,
}

impl ScriptedDevice {
    /// Single-reservoir V3.0 diffuser with oil and battery reporting
    pub fn v3() -> Self {
        Self {
            version: ProtocolVersion::V3,
            password: "8888",
            feature_bits: 0x03,
            max_intensity: 5,
            name: "Lobby",
            oil_names: vec!["Lavender"],
            rssi: Some(-58),
            answers_login: true,
            intensity: 2,
            status_first: false,
        }
    }

    /// Legacy V2.0 diffuser
    pub fn v2() -> Self {
        Self {
            version: ProtocolVersion::V2,
            name: "Hallway",
            oil_names: Vec::new(),
            feature_bits: 0,
            ..Self::v3()
        }
    }
}

#[derive(Debug, Default)]
struct Sim {
    power: bool,
    intensity: u8,
}

struct Shared {
    device: ScriptedDevice,
    sim: Mutex<Sim>,
    writes: Mutex<Vec<Bytes>>,
    notify: Mutex<Option<mpsc::Sender<Notification>>>,
    connected: AtomicBool,
    connects: AtomicUsize,
    acks: AtomicBool,
    refuse_connect: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Transport that answers writes like a real diffuser would
#[derive(Clone)]
pub(crate) struct MockTransport {
    shared: Arc<Shared>,
}

impl MockTransport {
    pub fn new(device: ScriptedDevice) -> Self {
        let sim = Sim {
            power: true,
            intensity: device.intensity,
        };
        Self {
            shared: Arc::new(Shared {
                device,
                sim: Mutex::new(sim),
                writes: Mutex::new(Vec::new()),
                notify: Mutex::new(None),
                connected: AtomicBool::new(false),
                connects: AtomicUsize::new(0),
                acks: AtomicBool::new(true),
                refuse_connect: AtomicBool::new(false),
            }),
        }
    }

    pub fn writes(&self) -> Vec<Bytes> {
        lock(&self.shared.writes).clone()
    }

    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn is_link_up(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Stop acknowledging control commands
    pub fn set_acks(&self, enabled: bool) {
        self.shared.acks.store(enabled, Ordering::SeqCst);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    /// Simulate the radio link going away
    pub fn drop_link(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        lock(&self.shared.notify).take();
    }

    /// Deliver an unsolicited frame
    pub fn push(&self, frame: &[u8]) {
        self.shared.deliver(vec![frame.to_vec()]);
    }
}

impl Shared {
    fn deliver(&self, frames: Vec<Vec<u8>>) {
        let sender = lock(&self.notify).clone();
        if let Some(sender) = sender {
            for frame in frames {
                let _ = sender.try_send(Notification {
                    data: Bytes::from(frame),
                    rssi: self.device.rssi,
                });
            }
        }
    }

    fn respond(&self, frame: &[u8]) -> Vec<Vec<u8>> {
        let device = &self.device;
        if frame.first() == Some(&0x8F) {
            return self.respond_login(frame);
        }

        let intent = decode_command(&[Bytes::copy_from_slice(frame)], device.version);
        match intent {
            Some(CommandIntent::Drive { power, intensity }) => {
                if !self.acks.load(Ordering::SeqCst) {
                    return Vec::new();
                }
                match device.version {
                    ProtocolVersion::V3 => {
                        let mut sim = lock(&self.sim);
                        sim.power = power;
                        match intensity {
                            Some(level) => {
                                sim.intensity = level;
                                vec![schedule_v3(&sim)]
                            }
                            // quick power frames are never answered
                            None => Vec::new(),
                        }
                    }
                    ProtocolVersion::V2 => {
                        let index = frame[1] >> 1;
                        let enabled = frame[1] & 0x01 != 0;
                        if index == 1 {
                            let mut sim = lock(&self.sim);
                            sim.power = enabled;
                            sim.intensity = frame[7];
                        }
                        vec![schedule_v2(index, enabled, frame[7])]
                    }
                }
            }
            Some(CommandIntent::ReadName) => match device.version {
                ProtocolVersion::V3 => vec![tagged(0x42, device.name.as_bytes())],
                ProtocolVersion::V2 => {
                    let mut body = vec![0x00];
                    body.extend_from_slice(device.name.as_bytes());
                    vec![tagged(0x81, &body)]
                }
            },
            Some(CommandIntent::ReadVersion) => vec![versions()],
            Some(CommandIntent::ReadLimits) => match device.version {
                ProtocolVersion::V3 => vec![vec![0x46, device.max_intensity]],
                ProtocolVersion::V2 => vec![vec![0x84]],
            },
            _ => Vec::new(),
        }
    }

    fn respond_login(&self, frame: &[u8]) -> Vec<Vec<u8>> {
        let device = &self.device;
        if !device.answers_login {
            return Vec::new();
        }
        let form = if frame.len() > 5 {
            ProtocolVersion::V3
        } else {
            ProtocolVersion::V2
        };
        if form != device.version {
            return Vec::new();
        }
        if frame.get(1..5) != Some(device.password.as_bytes()) {
            return vec![b"\x8FERROR".to_vec()];
        }

        let sim = lock(&self.sim);
        match device.version {
            ProtocolVersion::V2 => vec![
                vec![0x8F, b'O', b'K'],
                schedule_v2(1, sim.power, sim.intensity),
            ],
            ProtocolVersion::V3 => {
                let mut login = b"\x8FAT013.0OK01\x00".to_vec();
                login.push(device.feature_bits);

                let mut names = vec![0x48];
                for name in &device.oil_names {
                    let mut padded = name.as_bytes().to_vec();
                    padded.resize(OIL_NAME_LEN, 0);
                    names.extend_from_slice(&padded);
                }
                // 300 capacity, 150 left per reservoir
                let mut amounts = vec![0x4B, 90];
                for _ in &device.oil_names {
                    amounts.extend_from_slice(&[0x01, 0x2C, 0x00, 0x96]);
                }

                let limits = vec![0x46, device.max_intensity, 0, 5, 0, 60, 0, 30, 1, 44];
                let mut burst = vec![
                    login,
                    vec![0x40],
                    limits,
                    tagged(0x42, device.name.as_bytes()),
                    tagged(0x45, b"AROMINI BT PLUS"),
                    names,
                    amounts,
                    schedule_v3(&sim),
                    versions(),
                    vec![0x4D, 0x00],
                ];
                if device.status_first {
                    burst[2..8].rotate_right(1);
                }
                burst
            }
        }
    }
}

fn tagged(opcode: u8, body: &[u8]) -> Vec<u8> {
    let mut frame = vec![opcode];
    frame.extend_from_slice(body);
    frame
}

fn versions() -> Vec<u8> {
    let mut frame = vec![0x44];
    let mut pcb = b"PCB-2.1".to_vec();
    pcb.resize(16, 0);
    frame.extend_from_slice(&pcb);
    frame.extend_from_slice(b"EQ-1.7");
    frame
}

fn schedule_v3(sim: &Sim) -> Vec<u8> {
    let (total, slot) = if sim.power { (0x03, 0x03) } else { (0x00, 0x01) };
    vec![
        0x4A, 1, 0x02, total, 1, 1, slot, 0, 0, 23, 59, 0x7F, 0, sim.intensity,
    ]
}

fn schedule_v2(index: u8, enabled: bool, intensity: u8) -> Vec<u8> {
    let repeat = if enabled { 0x7F } else { 0x00 };
    vec![
        0x83,
        u8::from(enabled) | (index << 1),
        0,
        0,
        23,
        59,
        repeat,
        intensity,
        0,
        0,
        0x00,
        0x4B,
        0x00,
        0x96,
        87,
    ]
}

/// Connection handed out by [`MockTransport`]
pub(crate) struct MockLink {
    shared: Arc<Shared>,
}

#[async_trait]
impl Transport for MockTransport {
    type Link = MockLink;

    async fn scan(
        &self,
        filter: &DiscoveryFilter,
        _window: Duration,
    ) -> Result<Vec<DiscoveredDevice>> {
        let name = "AroMini BT";
        if !filter.matches(Some(name), &HashMap::new()) {
            return Ok(Vec::new());
        }
        Ok(vec![DiscoveredDevice {
            name: name.to_string(),
            address: MOCK_ADDRESS.to_string(),
            rssi: self.shared.device.rssi,
        }])
    }

    async fn connect(&self, address: &str, _timeout: Duration) -> Result<MockLink> {
        if address != MOCK_ADDRESS || self.shared.refuse_connect.load(Ordering::SeqCst) {
            return Err(AromaTechError::Transport("device unreachable".to_string()));
        }
        self.shared.connected.store(true, Ordering::SeqCst);
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MockLink {
            shared: Arc::clone(&self.shared),
        })
    }
}

#[async_trait]
impl Link for MockLink {
    async fn write(&self, data: &[u8]) -> Result<()> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(AromaTechError::Transport("link down".to_string()));
        }
        lock(&self.shared.writes).push(Bytes::copy_from_slice(data));
        let replies = self.shared.respond(data);
        self.shared.deliver(replies);
        Ok(())
    }

    async fn subscribe(&self, queue: usize) -> Result<mpsc::Receiver<Notification>> {
        let (tx, rx) = mpsc::channel(queue.max(1));
        *lock(&self.shared.notify) = Some(tx);
        Ok(rx)
    }

    async fn rssi(&self) -> Option<i16> {
        self.shared.device.rssi
    }

    async fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<()> {
        self.shared.connected.store(false, Ordering::SeqCst);
        lock(&self.shared.notify).take();
        Ok(())
    }
}
