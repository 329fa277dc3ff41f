//! In-memory ROM loader used by the unit tests.
//!
//! [`MockDevice`] decodes the SLIP frames the host writes, answers them the
//! way an ESP ROM loader does, and records everything it saw. [`MockPort`]
//! is the [`Port`] handed to a [`Transport`](crate::transport::Transport)
//! through [`MockPort::opener`].

use {
    crate::{
        error::Result,
        port::Port,
        protocol::{
            command::{DIR_REQUEST, DIR_RESPONSE, FLASH_WRITE_SIZE, Opcode, checksum},
            slip::{self, SlipDecoder},
        },
        target::{CHIP_DETECT_MAGIC_REG_ADDR, Chip},
    },
    flate2::read::ZlibDecoder,
    std::{
        collections::{HashMap, VecDeque},
        io::{self, Read, Write},
        sync::{Arc, Mutex},
        thread,
        time::Duration,
    },
};

const STATUS_INVALID_MESSAGE: u8 = 0x05;
const STATUS_BAD_CHECKSUM: u8 = 0x07;

/// Flash range opened by a FLASH_BEGIN / FLASH_DEFL_BEGIN.
#[derive(Debug, Clone)]
pub struct Region {
    pub address: u32,
    pub size: u32,
    pub compressed: bool,
    pub data: Vec<u8>,
    blocks_seen: u32,
}

/// Scriptable ROM loader.
#[derive(Debug)]
pub struct MockDevice {
    pub chip_magic: u32,
    pub status_len: usize,
    pub flash_id: u32,
    /// Number of initial SYNC commands left unanswered.
    pub ignore_syncs: usize,
    /// Replies sent per answered SYNC.
    pub sync_replies: usize,
    /// 1-based block ordinal rejected within every write.
    pub reject_block: Option<usize>,
    /// 1-based block ordinal whose payload is damaged in transit.
    pub corrupt_block: Option<usize>,
    /// 1-based block ordinal accepted without an acknowledgement.
    pub silent_block: Option<usize>,
    /// Opcode answered with a different opcode.
    pub mismatch_opcode_on: Option<u8>,
    /// Whether ERASE_FLASH / ERASE_REGION are implemented.
    pub stub_erase: bool,
    pub chunk_size: usize,
    pub end_of_stream: bool,

    pub registers: HashMap<u32, u32>,
    pub commands: Vec<(u8, Vec<u8>)>,
    pub regions: Vec<Region>,
    pub erased: Vec<(u32, u32)>,
    pub erase_all_count: usize,
    pub syncs_seen: usize,
    pub dtr_log: Vec<bool>,
    pub rts_log: Vec<bool>,
    pub bauds: Vec<u32>,
    pub opens: usize,
    pub closes: usize,

    spi_cmd: u32,
    spi_w0: u32,
    rx: SlipDecoder,
    tx: VecDeque<u8>,
}

impl MockDevice {
    pub fn new(chip: Chip) -> Self {
        let regs = chip.spi_registers();
        Self {
            chip_magic: chip.magic_values()[0],
            status_len: chip.status_len(),
            flash_id: 0x16_4020,
            ignore_syncs: 0,
            sync_replies: 3,
            reject_block: None,
            corrupt_block: None,
            silent_block: None,
            mismatch_opcode_on: None,
            stub_erase: true,
            chunk_size: 256,
            end_of_stream: false,
            registers: HashMap::new(),
            commands: Vec::new(),
            regions: Vec::new(),
            erased: Vec::new(),
            erase_all_count: 0,
            syncs_seen: 0,
            dtr_log: Vec::new(),
            rts_log: Vec::new(),
            bauds: Vec::new(),
            opens: 0,
            closes: 0,
            spi_cmd: regs.cmd(),
            spi_w0: regs.w0(),
            rx: SlipDecoder::new(),
            tx: VecDeque::new(),
        }
    }

    pub fn esp32() -> Self {
        Self::new(Chip::Esp32)
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn into_shared(self) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(self))
    }

    /// Queue raw bytes for the host to read.
    pub fn inject(&mut self, bytes: &[u8]) {
        self.tx
            .extend(bytes);
    }

    /// Bytes written at `address`, decompressed and trimmed to the size
    /// announced by FLASH_BEGIN.
    pub fn written_image(&self, address: u32) -> Option<Vec<u8>> {
        let region = self
            .regions
            .iter()
            .rev()
            .find(|r| r.address == address)?;
        if region.compressed {
            let mut out = Vec::new();
            ZlibDecoder::new(region.data.as_slice())
                .read_to_end(&mut out)
                .ok()?;
            Some(out)
        } else {
            let mut out = region
                .data
                .clone();
            out.truncate(region.size as usize);
            Some(out)
        }
    }

    fn receive(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            if let Ok(Some(frame)) = self
                .rx
                .push(byte)
            {
                self.handle(&frame);
            }
        }
    }

    fn handle(&mut self, packet: &[u8]) {
        if packet.len() < 8 || packet[0] != DIR_REQUEST {
            return;
        }
        let opcode = packet[1];
        let declared_checksum = word(&packet[4..8]);
        let data = packet[8..].to_vec();
        self.commands
            .push((opcode, data.clone()));

        if self.mismatch_opcode_on == Some(opcode) {
            let wrong = if opcode == Opcode::ReadReg as u8 {
                Opcode::WriteReg as u8
            } else {
                Opcode::ReadReg as u8
            };
            self.reply(wrong, 0, 0, 0);
            return;
        }

        match opcode {
            op if op == Opcode::Sync as u8 => {
                self.syncs_seen += 1;
                if self.syncs_seen > self.ignore_syncs {
                    for _ in 0..self.sync_replies {
                        self.reply(opcode, 0x2012_0707, 0, 0);
                    }
                }
            },
            op if op == Opcode::ReadReg as u8 => {
                let address = word(&data[0..4]);
                let value = if address == CHIP_DETECT_MAGIC_REG_ADDR {
                    self.chip_magic
                } else {
                    self.registers
                        .get(&address)
                        .copied()
                        .unwrap_or(0)
                };
                self.reply(opcode, value, 0, 0);
            },
            op if op == Opcode::WriteReg as u8 => {
                let (address, value) = (word(&data[0..4]), word(&data[4..8]));
                self.registers
                    .insert(address, value);
                if address == self.spi_cmd && value & (1 << 18) != 0 {
                    self.registers
                        .insert(self.spi_w0, self.flash_id);
                    self.registers
                        .insert(self.spi_cmd, 0);
                }
                self.reply(opcode, 0, 0, 0);
            },
            op if op == Opcode::FlashBegin as u8 || op == Opcode::FlashDeflBegin as u8 => {
                let (size, blocks, offset) = (word(&data[0..4]), word(&data[4..8]), word(&data[12..16]));
                self.erased
                    .push((offset, size));
                if blocks > 0 {
                    self.regions
                        .push(Region {
                            address: offset,
                            size,
                            compressed: op == Opcode::FlashDeflBegin as u8,
                            data: Vec::new(),
                            blocks_seen: 0,
                        });
                }
                self.reply(opcode, 0, 0, 0);
            },
            op if op == Opcode::FlashData as u8 || op == Opcode::FlashDeflData as u8 => {
                self.flash_data(opcode, declared_checksum, &data);
            },
            op if op == Opcode::EraseFlash as u8 => {
                if self.stub_erase {
                    self.erase_all_count += 1;
                    self.reply(opcode, 0, 0, 0);
                } else {
                    self.reply(opcode, 0, 1, STATUS_INVALID_MESSAGE);
                }
            },
            op if op == Opcode::EraseRegion as u8 => {
                if self.stub_erase {
                    self.erased
                        .push((word(&data[0..4]), word(&data[4..8])));
                    self.reply(opcode, 0, 0, 0);
                } else {
                    self.reply(opcode, 0, 1, STATUS_INVALID_MESSAGE);
                }
            },
            _ => self.reply(opcode, 0, 0, 0),
        }
    }

    fn flash_data(&mut self, opcode: u8, declared_checksum: u32, data: &[u8]) {
        let len = word(&data[0..4]) as usize;
        let seq = word(&data[4..8]);
        let mut block = data[16..].to_vec();
        let ordinal = Some(seq as usize + 1);
        if self.silent_block == ordinal {
            return;
        }
        if self.corrupt_block == ordinal {
            if let Some(first) = block.first_mut() {
                *first ^= 0xFF;
            }
        }
        let reject = self.reject_block == ordinal;

        let Some(region) = self
            .regions
            .last_mut()
        else {
            self.reply(opcode, 0, 1, STATUS_INVALID_MESSAGE);
            return;
        };
        let ok = len == block.len()
            && seq == region.blocks_seen
            && checksum(&block) == declared_checksum
            && (region.compressed || block.len() == FLASH_WRITE_SIZE)
            && !reject;
        if ok {
            region
                .data
                .extend_from_slice(&block);
            region.blocks_seen += 1;
            self.reply(opcode, 0, 0, 0);
        } else {
            self.reply(opcode, 0, 1, STATUS_BAD_CHECKSUM);
        }
    }

    fn reply(&mut self, opcode: u8, value: u32, status: u8, error: u8) {
        let mut trailer = vec![status, error];
        trailer.resize(self.status_len, 0);

        let mut packet = vec![DIR_RESPONSE, opcode];
        packet.extend_from_slice(&(trailer.len() as u16).to_le_bytes());
        packet.extend_from_slice(&value.to_le_bytes());
        packet.extend_from_slice(&trailer);
        self.tx
            .extend(slip::encode(&packet));
    }
}

fn word(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Port end of a [`MockDevice`].
pub struct MockPort {
    device: Arc<Mutex<MockDevice>>,
    name: String,
    baud_rate: u32,
    timeout: Duration,
}

impl MockPort {
    /// Opener producing ports attached to `device`.
    pub fn opener(
        device: &Arc<Mutex<MockDevice>>,
    ) -> impl FnMut(u32) -> Result<MockPort> + use<> {
        let device = Arc::clone(device);
        move |baud_rate| {
            device
                .lock()
                .unwrap()
                .opens += 1;
            Ok(MockPort {
                device: Arc::clone(&device),
                name: "mock".into(),
                baud_rate,
                timeout: Duration::from_millis(10),
            })
        }
    }

    fn device(&self) -> std::sync::MutexGuard<'_, MockDevice> {
        self.device
            .lock()
            .unwrap()
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut device = self.device();
        if device
            .tx
            .is_empty()
        {
            if device.end_of_stream {
                return Ok(0);
            }
            drop(device);
            thread::sleep(Duration::from_millis(1));
            return Err(io::ErrorKind::TimedOut.into());
        }

        let n = buf
            .len()
            .min(device.chunk_size)
            .min(
                device
                    .tx
                    .len(),
            );
        for slot in &mut buf[..n] {
            *slot = device
                .tx
                .pop_front()
                .unwrap();
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.device()
            .receive(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for MockPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.baud_rate = baud_rate;
        self.device()
            .bauds
            .push(baud_rate);
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.device()
            .tx
            .clear();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.device()
            .dtr_log
            .push(level);
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.device()
            .rts_log
            .push(level);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.device()
            .closes += 1;
        Ok(())
    }
}
