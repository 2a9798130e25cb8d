//! In-memory stand-ins for the bridge and the clock.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use omiflash::frame::FrameFormat;
use omiflash::register::explorer;
use omiflash::transport::{Delay, Transport, TransportError};

const STATUS_MARKER: u8 = 0x04;
const ACK: u64 = 0;
/// Status with a non-zero busy byte (bits 8..15).
const BUSY: u64 = 0x0000_0100;

/// Emulates one device persona behind the bridge.
///
/// The status register holds the last response only: selects and writes
/// leave an acknowledge in it, fetches leave the register content. Every
/// read returns whatever it holds, so a missing drain is harmless, the same
/// as on hardware.
pub struct SimDevice {
    pub format: FrameFormat,
    pub device: u8,
    /// Narrow slots (or FPGA registers) by physical address.
    pub registers: HashMap<u64, u64>,
    /// Physical addresses answering with a "not mapped" sentinel.
    pub unmapped: HashMap<u64, u64>,
    /// Physical addresses that silently ignore writes.
    pub read_only: HashSet<u64>,
    /// Addresses acknowledging a probe.
    pub alive: Vec<u8>,

    pub write_faults: VecDeque<TransportError>,
    pub read_faults: VecDeque<TransportError>,
    /// Once this many doorbell rounds happened, every write fails for good.
    pub unplug_after_round: Option<usize>,
    /// Status reads answering "busy" after each frame the register
    /// protocol does not use.
    pub call_busy_reads: u32,

    /// Every frame written, in order.
    pub frames: Vec<Vec<u8>>,
    /// Every decoded register write as (physical address, data).
    pub register_writes: Vec<(u64, u64)>,

    /// Halves written into the staging window, in order.
    pub staged: Vec<u32>,
    /// Command buffers present when the inbound doorbell was rung.
    pub commands: Vec<[u32; 16]>,
    /// Not-ready reads answered before ready, per doorbell round.
    pub ready_delays: HashMap<usize, u32>,
    /// Scripted sanity status values; once empty the status is 0, or the
    /// completion code after a commit.
    pub sanity_values: VecDeque<u64>,
    pub sanity_reads: usize,
    pub outbound_clears: usize,
    pub inbound_clears: usize,
    pub doorbell_reads: usize,
    /// Frames with an opcode the register protocol does not use.
    pub calls: Vec<Vec<u8>>,

    status: u64,
    command: [u32; 16],
    rounds: usize,
    armed: bool,
    not_ready_left: u32,
    commit_seen: bool,
    busy_left: u32,
}

impl SimDevice {
    pub fn new(format: FrameFormat, device: u8) -> Self {
        Self {
            format,
            device,
            registers: HashMap::new(),
            unmapped: HashMap::new(),
            read_only: HashSet::new(),
            alive: vec![device],
            write_faults: VecDeque::new(),
            read_faults: VecDeque::new(),
            unplug_after_round: None,
            call_busy_reads: 0,
            frames: Vec::new(),
            register_writes: Vec::new(),
            staged: Vec::new(),
            commands: Vec::new(),
            ready_delays: HashMap::new(),
            sanity_values: VecDeque::new(),
            sanity_reads: 0,
            outbound_clears: 0,
            inbound_clears: 0,
            doorbell_reads: 0,
            calls: Vec::new(),
            status: ACK,
            command: [0; 16],
            rounds: 0,
            armed: false,
            not_ready_left: 0,
            commit_seen: false,
            busy_left: 0,
        }
    }

    pub fn explorer() -> Self {
        Self::new(FrameFormat::EXPLORER, 0x20)
    }

    pub fn ice() -> Self {
        Self::new(FrameFormat::ICE, 0x20)
    }

    pub fn fpga() -> Self {
        Self::new(FrameFormat::FPGA, 0x38)
    }

    /// Doorbell rounds so far (bursts plus commit during an upload).
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    fn be(bytes: &[u8]) -> u64 {
        bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
    }

    fn physical(&self, wire: u64) -> u64 {
        wire.wrapping_sub(self.format.window)
    }

    fn fetch(&mut self, phys: u64) -> u64 {
        if let Some(&sentinel) = self.unmapped.get(&phys) {
            return sentinel;
        }
        if self.format.opcodes.is_none() {
            return self.registers.get(&phys).copied().unwrap_or(0);
        }
        let outbound = explorer::OUTBOUND_DOORBELL.physical().raw();
        let sanity = explorer::SANITY_STATUS.physical().raw();
        if phys == outbound {
            self.doorbell_reads += 1;
            if !self.armed {
                return 0;
            }
            if self.not_ready_left > 0 {
                self.not_ready_left -= 1;
                return 0;
            }
            return explorer::RESPONSE_READY;
        }
        if phys == sanity {
            self.sanity_reads += 1;
            return self.sanity_values.pop_front().unwrap_or(if self.commit_seen {
                explorer::UPLOAD_COMPLETE
            } else {
                0
            });
        }
        self.registers.get(&phys).copied().unwrap_or(0)
    }

    fn store(&mut self, phys: u64, data: u64) {
        self.register_writes.push((phys, data));
        if self.read_only.contains(&phys) {
            return;
        }
        if self.format.opcodes.is_some() {
            let staging = explorer::STAGING_WINDOW.raw();
            let command = explorer::COMMAND_WINDOW.raw();
            let (set_msb, _) = explorer::INBOUND_DOORBELL_SET.halves();
            let (clear_msb, _) = explorer::INBOUND_DOORBELL_CLEAR.halves();

            if phys == explorer::OUTBOUND_DOORBELL.raw() {
                if data == 1 {
                    self.outbound_clears += 1;
                    self.armed = false;
                }
                return;
            }
            if phys == set_msb.raw() {
                if data & 0x8000_0000 != 0 {
                    self.ring();
                }
                return;
            }
            if phys == clear_msb.raw() {
                if data & 0x8000_0000 != 0 {
                    self.inbound_clears += 1;
                }
                return;
            }
            if (command..command + 64).contains(&phys) {
                self.command[((phys - command) / 4) as usize] = data as u32;
                return;
            }
            if (staging..staging + 256).contains(&phys) {
                self.staged.push(data as u32);
            }
        }
        self.registers.insert(phys, data);
    }

    fn ring(&mut self) {
        let round = self.rounds;
        self.rounds += 1;
        self.commands.push(self.command);
        if self.command[0] & 0xFFFF == 0x0008 {
            self.commit_seen = true;
        }
        self.armed = true;
        self.not_ready_left = self.ready_delays.get(&round).copied().unwrap_or(0);
    }

    fn handle_frame(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let Some(op) = self.format.opcodes else {
            return match bytes.len() {
                8 => {
                    let phys = self.physical(Self::be(bytes));
                    self.status = self.fetch(phys);
                    Ok(())
                }
                16 => {
                    let phys = self.physical(Self::be(&bytes[..8]));
                    self.store(phys, Self::be(&bytes[8..]));
                    self.status = ACK;
                    Ok(())
                }
                n => Err(TransportError::protocol(format!("{n}-byte FPGA frame"))),
            };
        };

        match bytes {
            [cmd] if *cmd == op.status_register => Ok(()),
            [code, 4, addr @ ..] if addr.len() == 4 && *code == op.select => {
                self.status = ACK;
                Ok(())
            }
            [code, 4, addr @ ..] if addr.len() == 4 && *code == op.fetch => {
                let phys = self.physical(Self::be(addr));
                self.status = self.fetch(phys);
                Ok(())
            }
            [code, 8, rest @ ..] if rest.len() == 8 && *code == op.write => {
                let phys = self.physical(Self::be(&rest[..4]));
                self.store(phys, Self::be(&rest[4..]));
                self.status = ACK;
                Ok(())
            }
            [_, len, rest @ ..] if rest.len() == *len as usize => {
                self.calls.push(bytes.to_vec());
                self.busy_left = self.call_busy_reads;
                self.status = if self.busy_left > 0 { BUSY } else { ACK };
                Ok(())
            }
            other => Err(TransportError::protocol(format!(
                "unexpected frame {other:02X?}"
            ))),
        }
    }
}

impl Transport for SimDevice {
    fn write(&mut self, device: u8, bytes: &[u8]) -> Result<(), TransportError> {
        if device != self.device {
            return Err(TransportError::NotPresent { device });
        }
        if let Some(fault) = self.write_faults.pop_front() {
            return Err(fault);
        }
        if self.unplug_after_round.is_some_and(|n| self.rounds >= n) {
            return Err(TransportError::protocol("adapter gone"));
        }
        self.frames.push(bytes.to_vec());
        self.handle_frame(bytes)
    }

    fn read(&mut self, device: u8, len: usize) -> Result<Vec<u8>, TransportError> {
        if device != self.device {
            return Err(TransportError::NotPresent { device });
        }
        if let Some(fault) = self.read_faults.pop_front() {
            return Err(fault);
        }
        let reply = match self.format.opcodes {
            Some(_) => {
                let mut reply = vec![STATUS_MARKER];
                reply.extend_from_slice(&(self.status as u32).to_be_bytes());
                reply
            }
            None => self.status.to_be_bytes().to_vec(),
        };
        if self.busy_left > 0 {
            self.busy_left -= 1;
            if self.busy_left == 0 {
                self.status = ACK;
            }
        }
        reply.get(..len).map(<[u8]>::to_vec).ok_or_else(|| {
            TransportError::protocol(format!("cannot supply {len} bytes"))
        })
    }

    fn probe(&mut self, device: u8) -> Result<bool, TransportError> {
        Ok(self.alive.contains(&device))
    }
}

/// Zero-time delay that remembers every requested sleep.
#[derive(Debug, Default)]
pub struct RecordingDelay {
    pub sleeps: Vec<Duration>,
}

impl RecordingDelay {
    pub fn total(&self) -> Duration {
        self.sleeps.iter().sum()
    }

    pub fn count(&self, duration: Duration) -> usize {
        self.sleeps.iter().filter(|&&d| d == duration).count()
    }
}

impl Delay for RecordingDelay {
    fn delay(&mut self, duration: Duration) {
        self.sleeps.push(duration);
    }
}
