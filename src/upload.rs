//! Firmware upload to the memory buffer.
//!
//! The image is staged 256 bytes at a time into a small window of device
//! memory, each burst followed by a checksummed command buffer and a doorbell
//! handshake. A failed session cannot be resumed: burst ordering and buffer
//! identifiers are sequential on the device side, so the caller must start
//! over from the first byte.

use std::time::Duration;

use tracing::{debug, info};

use crate::command::CommandBuffer;
use crate::crc::crc32_words;
use crate::error::{Error, Result};
use crate::image::{FirmwareImage, WORDS_PER_BURST, split_word};
use crate::register::explorer;
use crate::transaction::RegisterBus;
use crate::transport::{Delay, Transport};

/// 32-bit halves staged per burst.
pub const HALVES_PER_BURST: usize = WORDS_PER_BURST * 2;

/// Timing and budget knobs of an upload session.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Sleep between two readiness polls.
    pub poll_interval: Duration,
    /// Failed readiness polls tolerated after each burst.
    pub burst_poll_limit: u32,
    /// Failed readiness polls tolerated after the commit.
    pub boot_poll_limit: u32,
    /// Wait after the commit before polling; the firmware verifies and
    /// programs the whole image during this time.
    pub settle_delay: Duration,
    /// Run a sanity check after every n-th burst (and the first). One more
    /// always runs right before the commit.
    pub sanity_interval: usize,
    /// Identifier of the first command buffer.
    pub first_buffer_id: u16,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            burst_poll_limit: 10,
            boot_poll_limit: 5,
            settle_delay: Duration::from_secs(30),
            sanity_interval: 16,
            first_buffer_id: 0x4244,
        }
    }
}

/// Progress update callbacks
pub trait ProgressCallbacks {
    /// Initialize with the number of bursts to transfer
    fn init(&mut self, total_bursts: usize);
    /// Called after each accepted burst with its 1-based count
    fn update(&mut self, current: usize);
    /// Called once the commit buffer went out and the device is settling
    fn committing(&mut self) {}
    /// Called when the upload is accepted
    fn finish(&mut self);
}

/// Progress sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressCallbacks for NoProgress {
    fn init(&mut self, _total_bursts: usize) {}
    fn update(&mut self, _current: usize) {}
    fn finish(&mut self) {}
}

/// Summary of an accepted upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub bytes: usize,
    pub padding: usize,
    pub bursts: usize,
    pub sanity_checks: usize,
    pub final_status: u64,
}

/// Where a session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    StagingBurst,
    CommitBurst,
    AwaitReady,
    SanityCheck,
    CommitFinal,
    Done,
    Aborted,
}

/// State carried across the bursts of one upload.
pub struct UploadSession<'a, T, D> {
    bus: &'a mut RegisterBus<T, D>,
    config: UploadConfig,
    phase: Phase,
    /// Identifier of the next command buffer.
    buffer_id: u16,
    /// Index of the burst being staged.
    burst: usize,
    total_bursts: usize,
    /// Offset of the next half inside the staging window.
    cursor: u64,
    /// Halves staged so far in this burst, kept for the data CRC.
    staged: [u32; HALVES_PER_BURST],
    staged_len: usize,
    sanity_checks: usize,
}

impl<'a, T: Transport, D: Delay> UploadSession<'a, T, D> {
    pub fn new(bus: &'a mut RegisterBus<T, D>, config: UploadConfig) -> Self {
        let buffer_id = config.first_buffer_id;
        Self {
            bus,
            config,
            phase: Phase::Idle,
            buffer_id,
            burst: 0,
            total_bursts: 0,
            cursor: 0,
            staged: [0; HALVES_PER_BURST],
            staged_len: 0,
            sanity_checks: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Index of the burst currently in flight.
    pub fn burst(&self) -> usize {
        self.burst
    }

    pub fn total_bursts(&self) -> usize {
        self.total_bursts
    }

    pub fn buffer_id(&self) -> u16 {
        self.buffer_id
    }

    /// Run the whole upload. Any error leaves the session in
    /// [`Phase::Aborted`] and names the burst it happened at, either in the
    /// error itself or wrapped in [`Error::Upload`].
    pub fn run(
        &mut self,
        image: &FirmwareImage,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<UploadReport> {
        match self.transfer(image, progress) {
            Ok(report) => {
                self.phase = Phase::Done;
                Ok(report)
            }
            Err(e) => {
                self.phase = Phase::Aborted;
                Err(match e {
                    e if e.burst().is_some() => e,
                    e => Error::Upload {
                        burst: self.burst,
                        source: Box::new(e),
                    },
                })
            }
        }
    }

    fn transfer(
        &mut self,
        image: &FirmwareImage,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<UploadReport> {
        self.total_bursts = image.burst_count();
        info!(
            "uploading {} bytes in {} bursts ({} padding bytes)",
            image.len(),
            self.total_bursts,
            image.padding()
        );
        progress.init(self.total_bursts);

        for words in image.bursts() {
            self.phase = Phase::StagingBurst;
            for word in words {
                self.stage_word(word)?;
            }
            self.commit_burst()?;
            self.await_ready(self.config.burst_poll_limit)?;
            if self.burst % self.config.sanity_interval == 0 {
                self.sanity_check()?;
            }
            self.clear_outbound()?;

            progress.update(self.burst + 1);
            self.next_burst();
        }

        self.sanity_check()?;

        self.commit_final()?;
        progress.committing();
        info!(
            "commit sent, waiting {:?} for the firmware to settle",
            self.config.settle_delay
        );
        self.bus.pause(self.config.settle_delay);
        self.await_ready(self.config.boot_poll_limit)?;
        let final_status = self.completion_check()?;
        progress.finish();

        Ok(UploadReport {
            bytes: image.len(),
            padding: image.padding(),
            bursts: self.total_bursts,
            sanity_checks: self.sanity_checks,
            final_status,
        })
    }

    /// Stage one 8-byte word as two posted writes, low half first.
    pub fn stage_word(&mut self, word: u64) -> Result<()> {
        let (low, high) = split_word(word);
        for half in [low, high] {
            if self.staged_len == HALVES_PER_BURST {
                return Err(Error::frame(format!(
                    "burst {} already holds {HALVES_PER_BURST} halves",
                    self.burst
                )));
            }
            self.bus
                .post(explorer::STAGING_WINDOW.offset(self.cursor), half as u64)?;
            self.staged[self.staged_len] = half;
            self.staged_len += 1;
            self.cursor += 4;
        }
        Ok(())
    }

    /// Close the staged burst: command buffer plus doorbell handshake.
    pub fn commit_burst(&mut self) -> Result<()> {
        self.phase = Phase::CommitBurst;
        if self.staged_len != HALVES_PER_BURST {
            return Err(Error::frame(format!(
                "burst {} committed with {} of {HALVES_PER_BURST} halves staged",
                self.burst, self.staged_len
            )));
        }
        let data_crc = crc32_words(&self.staged);
        debug!(
            "burst {}: id {:#06x}, data crc {data_crc:#010x}",
            self.burst, self.buffer_id
        );

        let buffer = CommandBuffer::regular(self.buffer_id, self.burst, data_crc);
        self.clear_inbound()?;
        self.clear_outbound()?;
        self.send_command(&buffer)?;
        self.set_inbound()
    }

    /// Poll the outbound doorbell until the device reports a response.
    ///
    /// The first read plus up to `limit` retries; each failed read is
    /// followed by one poll interval of sleep.
    pub fn await_ready(&mut self, limit: u32) -> Result<()> {
        self.phase = Phase::AwaitReady;
        let register = explorer::OUTBOUND_DOORBELL;
        let mut failures = 0;
        loop {
            let readout = self.bus.read(register)?;
            if readout.value() == Some(explorer::RESPONSE_READY) {
                return Ok(());
            }
            failures += 1;
            let last = readout.raw();
            if failures > limit {
                return Err(Error::ReadyTimeout {
                    burst: self.burst,
                    register: register.raw(),
                    attempts: failures,
                    last,
                });
            }
            debug!("burst {}: waiting for response ({failures}/{limit})", self.burst);
            self.bus.pause(self.config.poll_interval);
        }
    }

    /// Mid-transfer integrity check: the status low byte must be zero.
    pub fn sanity_check(&mut self) -> Result<()> {
        self.phase = Phase::SanityCheck;
        let status = self.bus.read_value(explorer::SANITY_STATUS)?;
        self.sanity_checks += 1;
        debug!("burst {}: sanity status {status:#x}", self.burst);
        if status & 0xFF != 0 {
            return Err(Error::SanityCheck {
                burst: self.burst,
                status,
            });
        }
        Ok(())
    }

    /// Send the commit buffer that closes the image.
    pub fn commit_final(&mut self) -> Result<()> {
        self.phase = Phase::CommitFinal;
        let buffer = CommandBuffer::commit(self.buffer_id);
        debug!("commit: id {:#06x}", self.buffer_id);
        self.clear_inbound()?;
        self.clear_outbound()?;
        self.send_command(&buffer)?;
        self.set_inbound()
    }

    fn completion_check(&mut self) -> Result<u64> {
        self.phase = Phase::SanityCheck;
        let status = self.bus.read_value(explorer::SANITY_STATUS)?;
        self.sanity_checks += 1;
        if status != explorer::UPLOAD_COMPLETE {
            return Err(Error::UploadIncomplete {
                burst: self.burst,
                status,
            });
        }
        info!("firmware upload accepted (status {status:#x})");
        Ok(status)
    }

    fn next_burst(&mut self) {
        self.burst += 1;
        self.buffer_id = self.buffer_id.wrapping_add(1);
        self.cursor = 0;
        self.staged = [0; HALVES_PER_BURST];
        self.staged_len = 0;
    }

    fn send_command(&mut self, buffer: &CommandBuffer) -> Result<()> {
        for (i, &word) in buffer.words().iter().enumerate() {
            let address = explorer::COMMAND_WINDOW.offset(4 * i as u64);
            self.bus.post(address, word as u64)?;
        }
        Ok(())
    }

    fn clear_inbound(&mut self) -> Result<()> {
        self.bus
            .post(explorer::INBOUND_DOORBELL_CLEAR, explorer::DOORBELL_BIT)
    }

    fn set_inbound(&mut self) -> Result<()> {
        self.bus
            .post(explorer::INBOUND_DOORBELL_SET, explorer::DOORBELL_BIT)
    }

    fn clear_outbound(&mut self) -> Result<()> {
        self.bus.post(explorer::OUTBOUND_DOORBELL, 1)
    }
}

/// Upload `image` with a fresh session.
pub fn upload_firmware<T: Transport, D: Delay>(
    bus: &mut RegisterBus<T, D>,
    image: &FirmwareImage,
    config: UploadConfig,
    progress: &mut dyn ProgressCallbacks,
) -> Result<UploadReport> {
    UploadSession::new(bus, config).run(image, progress)
}
