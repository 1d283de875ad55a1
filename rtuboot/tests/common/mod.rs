//! In-memory bootloader used by the integration tests.
//!
//! `SimulatedDevice` implements [`Port`], so the real `Session` and frame
//! codec run unchanged against it. Clones share state, which lets one clone
//! serve as the listener's reader while another writes.

#![allow(dead_code)]

use rtuboot::error::Result;
use rtuboot::port::Port;
use rtuboot::protocol::frame;
use rtuboot::{FLASH_BASE, MAGIC};
use std::collections::{HashMap, VecDeque};
use std::io::{self, ErrorKind, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

/// Size of the simulated flash.
pub const FLASH_SIZE: usize = 0x2_0000;

/// One request as seen by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    /// Opcode byte.
    pub opcode: u8,
    /// Address argument for read/write requests.
    pub address: Option<u32>,
}

#[derive(Debug)]
pub struct DeviceState {
    pub address: u8,
    pub flash: Vec<u8>,
    pub requests: Vec<Request>,
    pub in_bootloader: bool,
    rx: VecDeque<u8>,
    /// Remaining requests to leave unanswered, per opcode.
    drop: HashMap<u8, usize>,
    /// Remaining responses to corrupt, per opcode.
    garble: HashMap<u8, usize>,
    /// Remaining responses echoing the wrong address, per opcode.
    misecho: HashMap<u8, usize>,
    /// Status word answered for writes to an address.
    write_status: HashMap<u32, u32>,
}

#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl SimulatedDevice {
    /// Device at slave `address` with erased flash.
    pub fn new(address: u8) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                address,
                flash: vec![0xFF; FLASH_SIZE],
                requests: Vec::new(),
                in_bootloader: false,
                rx: VecDeque::new(),
                drop: HashMap::new(),
                garble: HashMap::new(),
                misecho: HashMap::new(),
                write_status: HashMap::new(),
            })),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap()
    }

    /// Leave the next `count` requests with `opcode` unanswered.
    pub fn drop_requests(&self, opcode: u8, count: usize) {
        self.state().drop.insert(opcode, count);
    }

    /// Corrupt the CRC of the next `count` responses to `opcode`.
    pub fn garble_responses(&self, opcode: u8, count: usize) {
        self.state().garble.insert(opcode, count);
    }

    /// Echo the next chunk's address instead of the requested one in the
    /// next `count` responses to `opcode`.
    pub fn misecho_responses(&self, opcode: u8, count: usize) {
        self.state().misecho.insert(opcode, count);
    }

    /// Answer every write to `address` with `status` and keep flash unchanged.
    pub fn fail_writes_at(&self, address: u32, status: u32) {
        self.state().write_status.insert(address, status);
    }

    /// Copy `data` into flash at the absolute `address`.
    pub fn load(&self, address: u32, data: &[u8]) {
        let start = (address - FLASH_BASE) as usize;
        self.state().flash[start..start + data.len()].copy_from_slice(data);
    }

    /// Flash contents at the absolute `address`.
    pub fn flash(&self, address: u32, len: usize) -> Vec<u8> {
        let start = (address - FLASH_BASE) as usize;
        self.state().flash[start..start + len].to_vec()
    }

    pub fn requests(&self) -> Vec<Request> {
        self.state().requests.clone()
    }

    pub fn count(&self, opcode: u8) -> usize {
        self.state()
            .requests
            .iter()
            .filter(|r| r.opcode == opcode)
            .count()
    }
}

fn take_one(counts: &mut HashMap<u8, usize>, opcode: u8) -> bool {
    match counts.get_mut(&opcode) {
        Some(n) if *n > 0 => {
            *n -= 1;
            true
        },
        _ => false,
    }
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

impl DeviceState {
    fn handle(&mut self, data: &[u8]) {
        // A real slave stays silent on frames for others or with a bad CRC
        if data.len() < 2 {
            return;
        }
        let opcode = data[1];
        let Ok(payload) = frame::decode(data, self.address, opcode) else {
            return;
        };

        let address = (payload.len() >= 4).then(|| le_u32(payload));
        self.requests.push(Request { opcode, address });

        if take_one(&mut self.drop, opcode) {
            return;
        }

        let wrong_echo = take_one(&mut self.misecho, opcode);
        let echo = |addr: u32| {
            if wrong_echo {
                addr.wrapping_add(128)
            } else {
                addr
            }
        };

        let reply = match opcode {
            100 => {
                self.in_bootloader = true;
                MAGIC.to_le_bytes().to_vec()
            },
            102 => {
                self.in_bootloader = false;
                Vec::new()
            },
            101 => {
                let Some(addr) = address else { return };
                let mut out = echo(addr).to_le_bytes().to_vec();
                out.extend(self.read_flash(addr));
                out
            },
            103 => {
                let Some(addr) = address else { return };
                let status = self.write_status.get(&addr).copied().unwrap_or(0);
                if status == 0 {
                    self.write_flash(addr, &payload[4..]);
                }
                let mut out = echo(addr).to_le_bytes().to_vec();
                out.extend(status.to_le_bytes());
                out
            },
            _ => return,
        };

        let mut response = frame::encode(self.address, opcode, &reply);
        if take_one(&mut self.garble, opcode) {
            let last = response.len() - 1;
            response[last] ^= 0xFF;
        }
        self.rx.extend(response);
    }

    fn read_flash(&self, address: u32) -> Vec<u8> {
        (0..128u32)
            .map(|i| {
                address
                    .checked_sub(FLASH_BASE)
                    .map(|off| (off + i) as usize)
                    .and_then(|off| self.flash.get(off).copied())
                    .unwrap_or(0xFF)
            })
            .collect()
    }

    fn write_flash(&mut self, address: u32, data: &[u8]) {
        let start = (address - FLASH_BASE) as usize;
        self.flash[start..start + data.len()].copy_from_slice(data);
    }
}

impl Read for SimulatedDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state();
        if state.rx.is_empty() {
            drop(state);
            thread::sleep(Duration::from_millis(1));
            return Err(io::Error::new(ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for SimulatedDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.state().handle(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for SimulatedDevice {
    fn clear_input(&mut self) -> Result<()> {
        self.state().rx.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "simulated"
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Route library logs to the test harness; `RUST_LOG=debug` shows retries.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Application image: vector table (sp, entry) followed by a byte pattern.
pub fn app_image(len: usize) -> Vec<u8> {
    let mut data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
    data[..4].copy_from_slice(&0x2000_1000u32.to_le_bytes());
    data[4..8].copy_from_slice(&0x0800_1000u32.to_le_bytes());
    data
}
