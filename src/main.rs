use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use omiflash::bridge::SerialBridge;
use omiflash::diagnostics;
use omiflash::frame::minimal_be_bytes;
use omiflash::image::FirmwareImage;
use omiflash::persona::{self, Persona};
use omiflash::register::{Readout, RegisterAddress};
use omiflash::sequence::{self, Sequence, parse_hex, parse_hex_u64};
use omiflash::transaction::RegisterBus;
use omiflash::transport::Transport;
use omiflash::upload::{ProgressCallbacks, UploadConfig, upload_firmware};

#[derive(Parser, Debug)]
#[command(name = "omiflash", about = "OMI memory-buffer bring-up and firmware upload client")]
struct Args {
    /// I2C bus number (/dev/i2c-N)
    #[arg(
        short,
        long,
        value_name = "N",
        env = "OMIFLASH_BUS",
        default_value_t = omiflash::i2c::DEFAULT_BUS,
        global = true
    )]
    bus: u32,

    /// Go through a serial-attached I2C bridge on this port instead
    #[arg(long, value_name = "PORT", env = "OMIFLASH_PORT", global = true)]
    port: Option<String>,

    /// Baud rate of the serial bridge
    #[arg(
        long,
        value_name = "BAUD",
        env = "OMIFLASH_BAUD",
        default_value_t = 1_000_000u32,
        global = true
    )]
    baud: u32,

    /// Device personality to talk to
    #[arg(
        long,
        value_enum,
        env = "OMIFLASH_PERSONA",
        default_value_t = Persona::Explorer,
        global = true
    )]
    persona: Persona,

    /// Bus address override (hex), defaults to the persona's address
    #[arg(long, value_name = "ADDR", value_parser = parse_device, global = true)]
    device: Option<u8>,

    /// Log session milestones (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Upload a firmware image to the memory buffer.
    Upload {
        /// Firmware file path
        #[arg(value_name = "FIRMWARE")]
        firmware: PathBuf,
        /// Seconds to wait after the commit before polling
        #[arg(long, default_value_t = 30)]
        settle_secs: u64,
        /// Milliseconds between readiness polls
        #[arg(long, default_value_t = 50)]
        poll_ms: u64,
    },
    /// Read a register.
    Read {
        /// Logical register address (hex)
        address: String,
    },
    /// Write a register and check the read-back.
    Write {
        /// Logical register address (hex)
        address: String,
        /// Value (hex)
        value: String,
        /// Do not drain the status queue or read back
        #[arg(long)]
        posted: bool,
    },
    /// Send a raw frame, given as one hex number.
    Send {
        frame: String,
        /// Read this many bytes back afterwards
        #[arg(long, value_name = "N")]
        read: Option<usize>,
    },
    /// Probe the bus once and list what answered.
    Scan,
    /// Identify the FPGA bitstream and its link clock.
    Id {
        /// Clock (MHz) assumed for bitstreams that do not report one
        #[arg(long, default_value_t = 333)]
        freq: u32,
    },
    /// Print the memory-buffer firmware information block.
    Fwinfo,
    /// Run the OMI link setup on the memory buffer.
    Init {
        /// Link clock in MHz; read from the FPGA when omitted
        #[arg(long)]
        freq: Option<u32>,
    },
    /// Print the memory buffer's chip id, enterprise mode and card id.
    Info,
    /// Check whether link training finished and list error bits.
    SyncStatus,
    /// Decode the ICE identification register.
    IceInfo {
        /// Wide register holding the ICE id (hex)
        #[arg(long, value_name = "ADDR")]
        register: String,
    },
    /// Replay a JSON register sequence.
    Replay {
        /// Sequence file path
        sequence: PathBuf,
    },
}

fn parse_device(text: &str) -> std::result::Result<u8, String> {
    let value = parse_hex(text).map_err(|e| e.to_string())?;
    match u8::try_from(value) {
        Ok(addr) if addr < 0x80 => Ok(addr),
        _ => Err(format!("{text} is not a 7-bit bus address")),
    }
}

struct CliProgress {
    total: usize,
}

impl ProgressCallbacks for CliProgress {
    fn init(&mut self, total_bursts: usize) {
        self.total = total_bursts;
        println!("Sending firmware in {} bursts...", total_bursts);
    }

    fn update(&mut self, current: usize) {
        println!("Burst {}/{} accepted", current, self.total);
    }

    fn committing(&mut self) {
        println!("All bursts sent, committing image. The firmware now programs the flash...");
    }

    fn finish(&mut self) {
        println!("Firmware upload complete.");
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()),
        )
        .init();

    let transport = open_transport(&args)?;
    let device = args.device.unwrap_or(args.persona.device());
    let mut bus = RegisterBus::new(transport, device, args.persona.format());

    match args.command {
        Cmd::Upload {
            firmware,
            settle_secs,
            poll_ms,
        } => cmd_upload(&mut bus, args.persona, &firmware, settle_secs, poll_ms),
        Cmd::Read { address } => cmd_read(&mut bus, &address),
        Cmd::Write {
            address,
            value,
            posted,
        } => cmd_write(&mut bus, &address, &value, posted),
        Cmd::Send { frame, read } => cmd_send(&mut bus, &frame, read),
        Cmd::Scan => cmd_scan(&mut bus),
        Cmd::Id { freq } => cmd_id(&mut bus, args.persona, freq),
        Cmd::Fwinfo => cmd_fwinfo(&mut bus, args.persona),
        Cmd::Init { freq } => cmd_init(&mut bus, args.persona, freq),
        Cmd::Info => cmd_info(&mut bus, args.persona),
        Cmd::SyncStatus => cmd_sync_status(&mut bus, args.persona),
        Cmd::IceInfo { register } => cmd_ice_info(&mut bus, args.persona, &register),
        Cmd::Replay { sequence } => cmd_replay(&mut bus, &sequence),
    }
}

type Bus = RegisterBus<Box<dyn Transport>>;

fn open_transport(args: &Args) -> Result<Box<dyn Transport>> {
    if let Some(port) = &args.port {
        let bridge = SerialBridge::open(port, args.baud)
            .with_context(|| format!("failed to open bridge on {port}"))?;
        return Ok(Box::new(bridge));
    }
    open_i2c(args.bus)
}

#[cfg(target_os = "linux")]
fn open_i2c(bus: u32) -> Result<Box<dyn Transport>> {
    let i2c = omiflash::i2c::open_linux(bus).with_context(|| format!("failed to open I2C bus {bus}"))?;
    Ok(Box::new(i2c))
}

#[cfg(not(target_os = "linux"))]
fn open_i2c(bus: u32) -> Result<Box<dyn Transport>> {
    bail!("direct access to I2C bus {bus} needs Linux i2c-dev; use --port with a serial bridge")
}

fn cmd_upload(
    bus: &mut Bus,
    selected: Persona,
    firmware: &Path,
    settle_secs: u64,
    poll_ms: u64,
) -> Result<()> {
    if selected != Persona::Explorer {
        bail!("firmware upload needs the explorer persona, not {selected}");
    }
    let image = FirmwareImage::load(firmware)
        .with_context(|| format!("cannot load firmware '{}'", firmware.display()))?;
    println!(
        "Uploading '{}' ({} bytes, {} padding bytes)...",
        firmware.display(),
        image.len(),
        image.padding()
    );

    let config = UploadConfig {
        settle_delay: Duration::from_secs(settle_secs),
        poll_interval: Duration::from_millis(poll_ms),
        ..UploadConfig::default()
    };
    let mut progress = CliProgress { total: 0 };
    let report = upload_firmware(bus, &image, config, &mut progress)?;
    println!(
        "{} bursts, {} sanity checks, final status {:#x}",
        report.bursts, report.sanity_checks, report.final_status
    );
    Ok(())
}

fn cmd_read(bus: &mut Bus, address: &str) -> Result<()> {
    let address = RegisterAddress(parse_hex_u64(address)?);
    match bus.read(address)? {
        Readout::Value(value) => println!("{address}: {value:#x}"),
        Readout::Unmapped { sentinel } => {
            println!("{address}: not mapped (sentinel {sentinel:#010x})")
        }
    }
    Ok(())
}

fn cmd_write(bus: &mut Bus, address: &str, value: &str, posted: bool) -> Result<()> {
    let address = RegisterAddress(parse_hex_u64(address)?);
    let value = parse_hex_u64(value)?;
    if posted {
        bus.post(address, value)?;
        println!("{address} <- {value:#x} (posted)");
    } else if bus.write(address, value)? {
        println!("{address} <- {value:#x} verified");
    } else {
        bail!("{address} did not read back {value:#x}");
    }
    Ok(())
}

fn cmd_send(bus: &mut Bus, frame: &str, read: Option<usize>) -> Result<()> {
    let bytes = minimal_be_bytes(parse_hex(frame)?);
    bus.send_raw(&bytes)?;
    println!("Sent {:02X?}", bytes);
    if let Some(len) = read {
        let reply = bus.receive_raw(len)?;
        println!("Received {:02X?}", reply);
    }
    Ok(())
}

fn cmd_scan(bus: &mut Bus) -> Result<()> {
    let report = persona::scan(bus.transport_mut())?;
    if report.alive.is_empty() {
        println!("No devices found on the bus.");
        return Ok(());
    }
    for (address, name) in report.components() {
        println!("  --{:#04x}: {}", address, name.unwrap_or("unknown device"));
    }
    println!("Card type: {}", report.card());
    Ok(())
}

fn cmd_id(bus: &mut Bus, selected: Persona, freq: u32) -> Result<()> {
    if selected != Persona::Fpga {
        bail!("identification reads the FPGA version register; use --persona fpga");
    }
    let id = persona::identify(bus)?;
    println!("FPGA revision {}", id);
    match id.clock_mhz() {
        Some(mhz) => println!("Link clock {} MHz", mhz),
        None => println!("Link clock {} MHz (unknown bitstream, assumed)", id.clock_or(freq)),
    }
    Ok(())
}

fn cmd_fwinfo(bus: &mut Bus, selected: Persona) -> Result<()> {
    if selected != Persona::Explorer {
        bail!("firmware information is only published by the explorer persona");
    }
    for entry in persona::firmware_info(bus)? {
        match entry.readout {
            Readout::Value(value) => println!("{:<32} {:#010x}", entry.label, value),
            Readout::Unmapped { .. } => println!("{:<32} not available", entry.label),
        }
    }
    Ok(())
}

fn cmd_replay(bus: &mut Bus, path: &Path) -> Result<()> {
    let seq = Sequence::load(path)
        .with_context(|| format!("cannot load sequence '{}'", path.display()))?;
    let report = sequence::replay(bus, &seq)?;
    for read in &report.reads {
        let label = read.label.as_deref().unwrap_or("");
        match read.readout {
            Readout::Value(value) => println!("{} {:#x} {}", read.address, value, label),
            Readout::Unmapped { sentinel } => {
                println!("{} not mapped ({:#010x}) {}", read.address, sentinel, label)
            }
        }
    }
    println!(
        "{} steps, {} mismatched reads, {} rejected writes, {} unmapped reads",
        report.steps, report.mismatches, report.rejected_writes, report.unmapped
    );
    if !report.is_clean() {
        bail!("sequence '{}' did not complete cleanly", seq.name);
    }
    Ok(())
}

fn cmd_init(bus: &mut Bus, selected: Persona, freq: Option<u32>) -> Result<()> {
    if selected != Persona::Explorer {
        bail!("link setup runs on the explorer persona, not {selected}");
    }
    let mhz = match freq {
        Some(mhz) => mhz,
        None => {
            let mut fpga = Persona::Fpga.bus(bus.transport_mut());
            let id = persona::identify(&mut fpga).context("cannot read the FPGA clock, pass --freq")?;
            match id.clock_mhz() {
                Some(mhz) => mhz,
                None => {
                    println!("FPGA {} does not report its clock, assuming 333 MHz", id);
                    333
                }
            }
        }
    };
    let code = diagnostics::init_link(bus, mhz)?;
    println!("OMI setup done for {} MHz (code {:#x})", mhz, code);
    Ok(())
}

fn cmd_info(bus: &mut Bus, selected: Persona) -> Result<()> {
    if selected != Persona::Explorer {
        bail!("chip identity is read from the explorer persona, not {selected}");
    }
    let info = diagnostics::explorer_info(bus).context("run `init` first (after a reset)")?;
    println!("ECID:                   {}", info.ecid);
    println!("Enterprise mode status: {:#x}", info.enterprise_mode);
    println!("Card ID:                {:#x}", info.card_id);
    Ok(())
}

fn cmd_sync_status(bus: &mut Bus, selected: Persona) -> Result<()> {
    if selected != Persona::Explorer {
        bail!("training status is read from the explorer persona, not {selected}");
    }
    let status = diagnostics::training_status(bus)?;
    println!("{:#018x}", status.0);
    if status.done() {
        println!("Training successfully done.");
        return Ok(());
    }
    for (bit, label) in status.errors() {
        println!("  bit {:2}: {}", bit, label);
    }
    bail!("link training did not complete");
}

fn cmd_ice_info(bus: &mut Bus, selected: Persona, register: &str) -> Result<()> {
    if selected != Persona::Ice {
        bail!("ICE identification needs --persona ice");
    }
    let register = RegisterAddress(parse_hex_u64(register)?);
    let id = diagnostics::ice_identify(bus, register)?;
    println!("ID            = {:#x}", id.raw);
    println!("ICE git rev   = {:#x}", id.revision);
    println!("ICE dirty bit = {}", id.dirty as u8);
    println!("ICE frequency = {} MHz", id.clock_mhz());
    println!("Release       = {}.{}", id.major, id.minor);
    println!("Chip ID       = {:#x}", id.chip_id);
    Ok(())
}
