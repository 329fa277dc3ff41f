//! Bootloader session: handshake, command/response correlation, flash writes.
//!
//! A [`Session`] owns one [`Transport`] and drives the ESP ROM serial
//! protocol over it:
//!
//! ```text
//!  Disconnected --connect()--> Handshaking --sync ok--> Ready
//!       ^                           |                    |  ^
//!       |                     HandshakeTimeout    write_flash() |
//!       |                           v                    v  |
//!       +------------------- disconnect() <------- Flashing
//!                                                       |
//!                                         desync / I/O  v
//!                                                    Faulted
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use dezflash::{FlashJob, FlashRequest, LoaderConfig, Session, SerialConfig};
//!
//! fn main() -> dezflash::Result<()> {
//!     let config = LoaderConfig::default().with_target_baud(Some(460_800));
//!     let mut session = Session::new(SerialConfig::new("/dev/ttyUSB0", 115_200), config);
//!     let chip = session.connect()?;
//!     println!("Connected to {chip}");
//!
//!     let job = FlashJob::new(vec![FlashRequest::new(std::fs::read("app.bin")?, 0x10000)]);
//!     session.write_flash(&job, |index, written, total| {
//!         println!("request {index}: {written}/{total}");
//!     })?;
//!     session.hard_reset()
//! }
//! ```

use {
    crate::{
        error::{Error, Result},
        job::{FlashJob, FlashOptions, FlashRequest},
        port::PortOpener,
        protocol::{
            command::{CommandFrame, FLASH_WRITE_SIZE, Opcode, Response, rom_error_reason},
            slip::SlipDecoder,
        },
        target::{
            CHIP_DETECT_MAGIC_REG_ADDR, Chip, FlashSize, check_image_header, patch_image_header,
        },
        transport::{AbortHandle, Transport},
    },
    flate2::{Compression, write::ZlibEncoder},
    log::{debug, info, trace, warn},
    std::{
        fmt,
        io::Write,
        thread,
        time::{Duration, Instant},
    },
};

/// Initial baud rate of every ESP ROM loader.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Maximum number of SYNC attempts.
pub const MAX_CONNECT_ATTEMPTS: usize = 5;

/// Wait for a SYNC reply.
const SYNC_TIMEOUT: Duration = Duration::from_millis(100);

/// Backoff unit between SYNC attempts (multiplied by the attempt number).
const SYNC_BACKOFF: Duration = Duration::from_millis(50);

/// Quiet period that ends the drain of duplicate SYNC replies.
const SYNC_DRAIN_TIMEOUT: Duration = Duration::from_millis(20);

/// Wait for a flash block acknowledgement.
const BLOCK_TIMEOUT: Duration = Duration::from_secs(3);

/// Wait for an ordinary command reply.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

/// Erase budget per megabyte of flash.
const ERASE_TIMEOUT_PER_MB: Duration = Duration::from_secs(30);

/// How long EN is held low during the bootloader-entry reset.
const RESET_HOLD: Duration = Duration::from_millis(100);

/// How long IO0 is held low after EN is released.
const BOOT_STRAP_DELAY: Duration = Duration::from_millis(50);

/// Delay after changing baud rate.
const BAUD_CHANGE_DELAY: Duration = Duration::from_millis(50);

/// Flash erase sector size.
const SECTOR_SIZE: u32 = 0x1000;

/// SPI controller bits used to run a raw flash command.
const SPI_USR_COMMAND: u32 = 1 << 31;
const SPI_USR_MISO: u32 = 1 << 28;
const SPI_CMD_USR: u32 = 1 << 18;
const SPI_USR2_COMMAND_LEN_SHIFT: u32 = 28;
const SPI_MISO_BITLEN_SHIFT: u32 = 8;
const SPI_POLL_ATTEMPTS: usize = 10;

/// JEDEC "read identification" flash opcode.
const SPIFLASH_RDID: u32 = 0x9F;

/// Lifecycle of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SessionState {
    /// No port is open.
    Disconnected,
    /// The port is open and the SYNC sequence is running.
    Handshaking,
    /// Synced with the ROM loader; commands are accepted.
    Ready,
    /// A flash write or erase is in progress.
    Flashing,
    /// The stream desynchronized; only `disconnect` is meaningful.
    Faulted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
            Self::Flashing => "flashing",
            Self::Faulted => "faulted",
        })
    }
}

/// How the chip is put into download mode before syncing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ResetMode {
    /// Classic DTR/RTS sequence through the USB-UART bridge.
    #[default]
    DefaultReset,
    /// The chip is already in download mode.
    NoReset,
}

/// Tunables of the bootloader session.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Baud rate the port is opened at.
    pub baud_rate: u32,
    /// Baud rate to switch to after the handshake.
    pub target_baud: Option<u32>,
    /// Reset sequence run before each SYNC attempt.
    pub reset_mode: ResetMode,
    /// Number of SYNC attempts before giving up.
    pub connect_attempts: usize,
    /// Wait for each SYNC reply.
    pub sync_timeout: Duration,
    /// Backoff unit between SYNC attempts.
    pub sync_backoff: Duration,
    /// Wait for each flash block acknowledgement.
    pub block_timeout: Duration,
    /// Wait for ordinary command replies.
    pub command_timeout: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD,
            target_baud: None,
            reset_mode: ResetMode::default(),
            connect_attempts: MAX_CONNECT_ATTEMPTS,
            sync_timeout: SYNC_TIMEOUT,
            sync_backoff: SYNC_BACKOFF,
            block_timeout: BLOCK_TIMEOUT,
            command_timeout: COMMAND_TIMEOUT,
        }
    }
}

impl LoaderConfig {
    /// Set the initial baud rate.
    #[must_use]
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set the baud rate used after the handshake.
    #[must_use]
    pub fn with_target_baud(mut self, target_baud: Option<u32>) -> Self {
        self.target_baud = target_baud;
        self
    }

    /// Set the reset sequence.
    #[must_use]
    pub fn with_reset_mode(mut self, reset_mode: ResetMode) -> Self {
        self.reset_mode = reset_mode;
        self
    }

    /// Set the number of SYNC attempts.
    #[must_use]
    pub fn with_connect_attempts(mut self, attempts: usize) -> Self {
        self.connect_attempts = attempts;
        self
    }

    /// Set the SYNC reply timeout.
    #[must_use]
    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Set the backoff unit between SYNC attempts.
    #[must_use]
    pub fn with_sync_backoff(mut self, backoff: Duration) -> Self {
        self.sync_backoff = backoff;
        self
    }

    /// Set the per-block acknowledgement timeout.
    #[must_use]
    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    /// Set the command reply timeout.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }
}

/// Outcome of [`Session::write_flash`].
///
/// Only carries failures when the job ran with `continue_on_error`.
#[derive(Debug, Default)]
pub struct FlashReport {
    /// Indices of the requests written completely.
    pub completed: Vec<usize>,
    /// Requests that failed, with their error.
    pub failed: Vec<(usize, Error)>,
}

impl FlashReport {
    /// Whether every request was written.
    pub fn is_success(&self) -> bool {
        self.failed
            .is_empty()
    }
}

/// Session with the ROM bootloader of one chip.
pub struct Session<O: PortOpener> {
    transport: Transport<O>,
    config: LoaderConfig,
    state: SessionState,
    chip: Option<Chip>,
    flash_id: Option<u32>,
    decoder: SlipDecoder,
}

impl<O: PortOpener> Session<O> {
    /// Create a disconnected session that opens its port through `opener`.
    pub fn new(opener: O, config: LoaderConfig) -> Self {
        Self {
            transport: Transport::new(opener),
            config,
            state: SessionState::Disconnected,
            chip: None,
            flash_id: None,
            decoder: SlipDecoder::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Chip detected by the last handshake.
    pub fn chip(&self) -> Option<Chip> {
        self.chip
    }

    /// JEDEC flash id read during the last handshake.
    pub fn detected_flash_id(&self) -> Option<u32> {
        self.flash_id
    }

    /// Baud rate currently in use on the port.
    pub fn baud_rate(&self) -> u32 {
        self.transport
            .baud_rate()
    }

    /// Session tunables.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Handle that cancels the in-flight operation from another thread.
    pub fn abort_handle(&self) -> AbortHandle {
        self.transport
            .abort_handle()
    }

    /// Underlying transport.
    pub fn transport(&self) -> &Transport<O> {
        &self.transport
    }

    /// Open the port, sync with the ROM loader and identify the chip.
    ///
    /// Returns immediately when the session is already `Ready`. Any failure
    /// releases the port and leaves the session `Disconnected`.
    pub fn connect(&mut self) -> Result<Chip> {
        match (self.state, self.chip) {
            (SessionState::Ready, Some(chip)) => return Ok(chip),
            (SessionState::Flashing, _) => return Err(Error::SessionBusy),
            _ => {},
        }

        self.disconnect();
        match self.establish() {
            Ok(chip) => {
                self.state = SessionState::Ready;
                Ok(chip)
            },
            Err(e) => {
                self.disconnect();
                Err(e)
            },
        }
    }

    fn establish(&mut self) -> Result<Chip> {
        self.transport
            .connect(
                self.config
                    .baud_rate,
            )?;
        self.state = SessionState::Handshaking;
        info!(
            "Connecting to {}...",
            self.transport
                .port_name()
                .unwrap_or("serial port")
        );

        self.sync()?;

        let magic = self.read_reg_raw(CHIP_DETECT_MAGIC_REG_ADDR)?;
        let chip = Chip::from_magic(magic)
            .ok_or_else(|| Error::Unsupported(format!("unknown chip magic value 0x{magic:08X}")))?;
        self.chip = Some(chip);
        info!("Detected chip: {chip}");

        if chip.needs_spi_attach() {
            self.command(&CommandFrame::spi_attach(), self.config.command_timeout)?;
        }

        let flash_id = self.read_flash_id(chip)?;
        self.flash_id = Some(flash_id);
        debug!("Flash id: 0x{flash_id:06X}");
        match FlashSize::from_jedec_id(flash_id) {
            Some(size) => {
                if let Err(e) = self.command(
                    &CommandFrame::spi_set_params(size.bytes()),
                    self.config
                        .command_timeout,
                ) {
                    warn!("Could not configure {size} flash geometry: {e}");
                }
            },
            None => warn!("Unrecognized flash size in id 0x{flash_id:06X}"),
        }

        if let Some(target) = self
            .config
            .target_baud
        {
            if target
                != self
                    .transport
                    .baud_rate()
            {
                self.switch_baud(target)?;
            }
        }

        Ok(chip)
    }

    fn sync(&mut self) -> Result<()> {
        let attempts = self
            .config
            .connect_attempts
            .max(1);

        for attempt in 1..=attempts {
            if attempt > 1 {
                debug!("Sync attempt {attempt}/{attempts}");
                let factor = u32::try_from(attempt - 1).unwrap_or(u32::MAX);
                thread::sleep(
                    self.config
                        .sync_backoff
                        * factor,
                );
            }

            if self
                .config
                .reset_mode
                == ResetMode::DefaultReset
            {
                self.enter_bootloader()?;
            }
            self.transport
                .clear_input()?;
            self.decoder
                .reset();
            self.state = SessionState::Handshaking;

            match self.command(&CommandFrame::sync(), self.config.sync_timeout) {
                Ok(_) => {
                    self.drain_sync_replies()?;
                    debug!("Synced after {attempt} attempt(s)");
                    return Ok(());
                },
                Err(e @ (Error::Cancelled | Error::StreamClosed | Error::TransportIo(_))) => {
                    return Err(e);
                },
                Err(e) => trace!("Sync attempt {attempt} failed: {e}"),
            }
        }

        Err(Error::HandshakeTimeout { attempts })
    }

    /// The ROM answers one SYNC with several identical replies.
    fn drain_sync_replies(&mut self) -> Result<()> {
        loop {
            match self.read_response(Opcode::Sync, SYNC_DRAIN_TIMEOUT) {
                Ok(_) => {},
                Err(Error::ReadTimeout(_)) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Pulse EN low with IO0 held low so the chip boots into download mode.
    fn enter_bootloader(&mut self) -> Result<()> {
        debug!("Resetting into bootloader via DTR/RTS");
        self.transport
            .set_dtr(false)?;
        self.transport
            .set_rts(true)?;
        thread::sleep(RESET_HOLD);
        self.transport
            .set_dtr(true)?;
        self.transport
            .set_rts(false)?;
        thread::sleep(BOOT_STRAP_DELAY);
        self.transport
            .set_dtr(false)
    }

    /// Read the JEDEC id of the attached flash chip.
    pub fn flash_id(&mut self) -> Result<u32> {
        let chip = self.ensure_ready()?;
        let flash_id = self.read_flash_id(chip)?;
        self.flash_id = Some(flash_id);
        Ok(flash_id)
    }

    /// Run RDID through the SPI controller registers.
    fn read_flash_id(&mut self, chip: Chip) -> Result<u32> {
        const READ_BITS: u32 = 24;
        let regs = chip.spi_registers();

        let old_usr = self.read_reg_raw(regs.usr())?;
        let old_usr2 = self.read_reg_raw(regs.usr2())?;

        match regs.miso_dlen() {
            Some(miso_dlen) => self.write_reg_raw(miso_dlen, READ_BITS - 1)?,
            // Bit lengths live in USR1 on controllers without DLEN registers.
            None => self.write_reg_raw(regs.usr1(), (READ_BITS - 1) << SPI_MISO_BITLEN_SHIFT)?,
        }
        self.write_reg_raw(regs.usr(), SPI_USR_COMMAND | SPI_USR_MISO)?;
        self.write_reg_raw(
            regs.usr2(),
            (7 << SPI_USR2_COMMAND_LEN_SHIFT) | SPIFLASH_RDID,
        )?;
        self.write_reg_raw(regs.w0(), 0)?;
        self.write_reg_raw(regs.cmd(), SPI_CMD_USR)?;

        let mut done = false;
        for _ in 0..SPI_POLL_ATTEMPTS {
            if self.read_reg_raw(regs.cmd())? & SPI_CMD_USR == 0 {
                done = true;
                break;
            }
        }
        if !done {
            return Err(Error::Protocol("SPI flash command did not complete".into()));
        }

        let flash_id = self.read_reg_raw(regs.w0())? & 0x00FF_FFFF;
        self.write_reg_raw(regs.usr(), old_usr)?;
        self.write_reg_raw(regs.usr2(), old_usr2)?;
        Ok(flash_id)
    }

    /// Read a 32-bit register.
    pub fn read_reg(&mut self, address: u32) -> Result<u32> {
        self.ensure_ready()?;
        self.read_reg_raw(address)
    }

    /// Write a 32-bit register through `mask`.
    pub fn write_reg(&mut self, address: u32, value: u32, mask: u32) -> Result<()> {
        self.ensure_ready()?;
        self.command(
            &CommandFrame::write_reg(address, value, mask),
            self.config
                .command_timeout,
        )
        .map(drop)
    }

    fn read_reg_raw(&mut self, address: u32) -> Result<u32> {
        self.command(
            &CommandFrame::read_reg(address),
            self.config
                .command_timeout,
        )
        .map(|response| response.value)
    }

    fn write_reg_raw(&mut self, address: u32, value: u32) -> Result<()> {
        self.command(
            &CommandFrame::write_reg(address, value, u32::MAX),
            self.config
                .command_timeout,
        )
        .map(drop)
    }

    /// Tell the loader the flash geometry for a chip of `total_size` bytes.
    pub fn spi_set_params(&mut self, total_size: u32) -> Result<()> {
        self.ensure_ready()?;
        self.command(
            &CommandFrame::spi_set_params(total_size),
            self.config
                .command_timeout,
        )
        .map(drop)
    }

    /// Switch both sides of the link to `baud_rate`.
    pub fn change_baud(&mut self, baud_rate: u32) -> Result<()> {
        self.ensure_ready()?;
        self.switch_baud(baud_rate)
    }

    fn switch_baud(&mut self, baud_rate: u32) -> Result<()> {
        info!("Changing baud rate to {baud_rate}");
        // The ROM loader expects 0 as the prior rate.
        self.command(
            &CommandFrame::change_baudrate(baud_rate, 0),
            self.config
                .command_timeout,
        )?;
        self.transport
            .set_baud_rate(baud_rate)?;
        thread::sleep(BAUD_CHANGE_DELAY);
        self.transport
            .clear_input()?;
        self.decoder
            .reset();
        debug!("Baud rate changed to {baud_rate}");
        Ok(())
    }

    /// Erase the whole flash chip. No timeout applies.
    pub fn erase_flash(&mut self) -> Result<()> {
        self.ensure_ready()?;
        self.state = SessionState::Flashing;
        let result = self.bulk_erase();
        self.finish_operation(result)
    }

    /// Erase `size` bytes at `offset`; both must be sector aligned.
    pub fn erase_region(&mut self, offset: u32, size: u32) -> Result<()> {
        self.ensure_ready()?;
        if offset % SECTOR_SIZE != 0 || size % SECTOR_SIZE != 0 {
            return Err(Error::InvalidJobLayout(format!(
                "erase region 0x{offset:08X}+0x{size:X} is not aligned to 0x{SECTOR_SIZE:X}"
            )));
        }

        self.state = SessionState::Flashing;
        let result = self.erase_region_inner(offset, size);
        self.finish_operation(result)
    }

    fn erase_region_inner(&mut self, offset: u32, size: u32) -> Result<()> {
        info!("Erasing 0x{size:X} bytes at 0x{offset:08X}");
        match self.command(
            &CommandFrame::erase_region(offset, size),
            self.erase_timeout(size),
        ) {
            Err(Error::CommandFailed { code: 0x05, .. }) => {
                debug!("ERASE_REGION unsupported, erasing through FLASH_BEGIN");
                self.erase_with_begin(offset, size)
            },
            other => other.map(drop),
        }
    }

    fn bulk_erase(&mut self) -> Result<()> {
        info!("Erasing flash (this may take a while)...");
        let started = Instant::now();
        match self.command(&CommandFrame::erase_flash(), Duration::ZERO) {
            Ok(_) => {},
            Err(Error::CommandFailed { code: 0x05, .. }) => {
                let size = self
                    .flash_id
                    .and_then(FlashSize::from_jedec_id)
                    .ok_or_else(|| {
                        Error::Unsupported(
                            "loader has no ERASE_FLASH and the flash size is unknown".into(),
                        )
                    })?;
                debug!("ERASE_FLASH unsupported, erasing {size} through FLASH_BEGIN");
                self.erase_with_begin(0, size.bytes())?;
            },
            Err(e) => return Err(e),
        }
        info!(
            "Flash erased in {:.1}s",
            started
                .elapsed()
                .as_secs_f32()
        );
        Ok(())
    }

    /// FLASH_BEGIN with zero blocks erases the range and writes nothing.
    #[allow(clippy::cast_possible_truncation)]
    fn erase_with_begin(&mut self, offset: u32, size: u32) -> Result<()> {
        let chip = self.ensure_chip()?;
        let frame = CommandFrame::flash_begin(
            false,
            size,
            0,
            FLASH_WRITE_SIZE as u32,
            offset,
            chip.begin_has_encryption_flag()
                .then_some(false),
        );
        self.command(&frame, self.erase_timeout(size))
            .map(drop)
    }

    fn erase_timeout(&self, size: u32) -> Duration {
        let megabytes = size
            .div_ceil(1024 * 1024)
            .max(1);
        (ERASE_TIMEOUT_PER_MB * megabytes).max(
            self.config
                .command_timeout,
        )
    }

    /// Write every request of `job`, in order.
    ///
    /// `progress` receives `(request_index, bytes_written, total_bytes)`
    /// after each acknowledged block, in uncompressed bytes.
    pub fn write_flash<F>(&mut self, job: &FlashJob, mut progress: F) -> Result<FlashReport>
    where
        F: FnMut(usize, usize, usize),
    {
        let chip = self.ensure_ready()?;
        job.validate()?;
        // Header settings the chip cannot take fail before the bulk erase
        let settings = job
            .options()
            .settings();
        for request in job.requests() {
            check_image_header(chip, request.address, &request.data, &settings)?;
        }

        self.state = SessionState::Flashing;
        let result = self.write_requests(chip, job, &mut progress);
        self.finish_operation(result)
    }

    fn write_requests<F>(
        &mut self,
        chip: Chip,
        job: &FlashJob,
        progress: &mut F,
    ) -> Result<FlashReport>
    where
        F: FnMut(usize, usize, usize),
    {
        let options = job.options();
        if options.erase_all {
            self.bulk_erase()?;
        }

        let mut report = FlashReport::default();
        for (index, request) in job
            .requests()
            .iter()
            .enumerate()
        {
            match self.write_request(chip, index, request, options, progress) {
                Ok(()) => report
                    .completed
                    .push(index),
                Err(e @ (Error::FlashWrite { .. } | Error::CommandFailed { .. }))
                    if options.continue_on_error =>
                {
                    warn!("Request {index} failed: {e}; continuing");
                    report
                        .failed
                        .push((index, e));
                },
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write_request<F>(
        &mut self,
        chip: Chip,
        index: usize,
        request: &FlashRequest,
        options: &FlashOptions,
        progress: &mut F,
    ) -> Result<()>
    where
        F: FnMut(usize, usize, usize),
    {
        let address = request.address;
        let mut image = request
            .data
            .clone();
        if patch_image_header(chip, address, &mut image, &options.settings())? {
            info!("Updated flash parameters in image header at 0x{address:08X}");
        }

        let total = image.len();
        let (payload, erase_size) = if options.compress {
            let compressed = deflate(&image);
            debug!("Compressed {total} bytes to {}", compressed.len());
            // The ROM erases whole blocks of uncompressed data.
            (compressed, total.div_ceil(FLASH_WRITE_SIZE) * FLASH_WRITE_SIZE)
        } else {
            (image, total)
        };
        let blocks = payload
            .len()
            .div_ceil(FLASH_WRITE_SIZE);

        info!("Writing {total} bytes at 0x{address:08X} ({blocks} blocks)");
        // Safe casts: job validation keeps every range inside the 32-bit address space
        let begin = CommandFrame::flash_begin(
            options.compress,
            erase_size as u32,
            blocks as u32,
            FLASH_WRITE_SIZE as u32,
            address,
            chip.begin_has_encryption_flag()
                .then_some(false),
        );
        self.command(&begin, self.erase_timeout(erase_size as u32))?;

        for (seq, chunk) in payload
            .chunks(FLASH_WRITE_SIZE)
            .enumerate()
        {
            let frame = if options.compress {
                CommandFrame::flash_data(true, seq as u32, chunk)
            } else {
                let mut block = chunk.to_vec();
                block.resize(FLASH_WRITE_SIZE, 0xFF);
                CommandFrame::flash_data(false, seq as u32, &block)
            };

            self.command(
                &frame,
                self.config
                    .block_timeout,
            )
            .map_err(|e| match e {
                Error::CommandFailed { code, reason, .. } => Error::FlashWrite {
                    request: index,
                    block: seq + 1,
                    blocks,
                    reason: format!("device rejected block (0x{code:02x}: {reason})"),
                },
                Error::ReadTimeout(timeout) => Error::FlashWrite {
                    request: index,
                    block: seq + 1,
                    blocks,
                    reason: format!("no acknowledgement within {timeout:?}"),
                },
                other => other,
            })?;

            let written = if options.compress {
                (total as u64 * (seq as u64 + 1) / blocks as u64) as usize
            } else {
                ((seq + 1) * FLASH_WRITE_SIZE).min(total)
            };
            progress(index, written, total);
        }

        debug!("Request {index} written");
        Ok(())
    }

    /// Leave the loader and run the flashed application, then release the port.
    ///
    /// The port is released even when the reset itself fails.
    pub fn hard_reset(&mut self) -> Result<()> {
        if !self
            .transport
            .is_connected()
        {
            self.disconnect();
            return Ok(());
        }

        info!("Hard resetting via RTS pin...");
        if self.state == SessionState::Ready {
            if let Err(e) = self.command(
                &CommandFrame::flash_end(false, true),
                self.config
                    .command_timeout,
            ) {
                debug!("FLASH_END before reset: {e}");
            }
        }

        let result = self.pulse_reset();
        self.disconnect();
        result
    }

    fn pulse_reset(&mut self) -> Result<()> {
        self.transport
            .set_dtr(false)?;
        self.transport
            .set_rts(true)?;
        thread::sleep(RESET_HOLD);
        self.transport
            .set_rts(false)
    }

    /// Release the port from any state. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        self.transport
            .disconnect();
        self.decoder
            .reset();
        self.chip = None;
        self.flash_id = None;
        self.state = SessionState::Disconnected;
    }

    fn ensure_ready(&self) -> Result<Chip> {
        match (self.state, self.chip) {
            (SessionState::Ready, Some(chip)) => Ok(chip),
            (SessionState::Flashing, _) => Err(Error::SessionBusy),
            (state, _) => Err(Error::NotReady(state)),
        }
    }

    fn ensure_chip(&self) -> Result<Chip> {
        self.chip
            .ok_or(Error::NotReady(self.state))
    }

    /// Settle the state after a flash-mutating operation.
    fn finish_operation<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_)
            | Err(
                Error::FlashWrite { .. }
                | Error::CommandFailed { .. }
                | Error::Unsupported(_)
                | Error::Config(_)
                | Error::InvalidJobLayout(_),
            ) => {
                self.state = SessionState::Ready;
            },
            Err(Error::Cancelled) => {
                warn!("Operation cancelled; flash contents at the target are partially written");
                self.disconnect();
            },
            Err(_) => self.state = SessionState::Faulted,
        }
        result
    }

    /// Send one command and wait for its successful reply.
    fn command(&mut self, frame: &CommandFrame, timeout: Duration) -> Result<Response> {
        trace!(
            "Sending {} ({} bytes)",
            frame.opcode(),
            frame
                .data()
                .len()
        );
        self.transport
            .write(&frame.encode())?;

        let response = self.read_response(frame.opcode(), timeout)?;
        let (status, code) = response.status(
            self.chip
                .map(Chip::status_len),
        )?;
        if status != 0 {
            return Err(Error::CommandFailed {
                command: frame.opcode(),
                code,
                reason: rom_error_reason(code),
            });
        }
        Ok(response)
    }

    /// Read frames until the reply to `expected` arrives.
    ///
    /// Late SYNC replies are skipped. Any other opcode is a desync and faults
    /// the session. Bytes after the matching frame stay buffered in the
    /// transport. A zero `timeout` waits indefinitely.
    fn read_response(&mut self, expected: Opcode, timeout: Duration) -> Result<Response> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);

        'chunks: loop {
            let remaining = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(Error::ReadTimeout(timeout));
                    }
                    remaining
                },
                None => Duration::ZERO,
            };

            let chunk = self
                .transport
                .read(remaining)
                .map_err(|e| match e {
                    Error::ReadTimeout(_) => Error::ReadTimeout(timeout),
                    other => other,
                })?;

            for (i, &byte) in chunk
                .iter()
                .enumerate()
            {
                let frame = match self
                    .decoder
                    .push(byte)
                {
                    Ok(Some(frame)) => frame,
                    Ok(None) => continue,
                    Err(e) => {
                        self.state = SessionState::Faulted;
                        return Err(e);
                    },
                };
                self.transport
                    .unread(&chunk[i + 1..]);

                let response = match Response::parse(&frame) {
                    Ok(response) => response,
                    Err(e) => {
                        self.state = SessionState::Faulted;
                        return Err(e);
                    },
                };
                if response.opcode == expected as u8 {
                    return Ok(response);
                }
                if response.opcode == Opcode::Sync as u8 {
                    trace!("Skipping late SYNC reply");
                    continue 'chunks;
                }

                self.state = SessionState::Faulted;
                return Err(Error::Protocol(format!(
                    "expected reply to {expected}, got opcode 0x{:02X}",
                    response.opcode
                )));
            }
        }
    }
}

impl<O: PortOpener> fmt::Debug for Session<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("chip", &self.chip)
            .field("flash_id", &self.flash_id)
            .field("baud_rate", &self.baud_rate())
            .finish_non_exhaustive()
    }
}

#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder
        .write_all(data)
        .unwrap();
    encoder
        .finish()
        .unwrap()
}
