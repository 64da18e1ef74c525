//! Dual cascaded 8237A-compatible DMA controllers — §4.6.
//!
//! Modeled as one flat 8-channel abstraction (channels 0-3 byte-wide, 4-7
//! word-wide, channel 4 reserved for cascade) rather than two separate chip
//! objects, since nothing in the bus-level contract (`dma_channel_read`/
//! `dma_channel_write`, page registers, address/count programming) depends on
//! which physical chip a channel lives on — only its width and port offset
//! do, and those are per-channel properties here.

use pcbus_mem::MemoryMap;

pub type PhysAddr = u32;

/// No in-flight transfer occurred (channel masked or never programmed).
/// Matches the "open bus" convention used elsewhere in the core.
pub const DMA_NO_DATA_SENTINEL: u8 = 0xFF;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferType {
    Verify,
    Write,
    Read,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaMode {
    pub transfer_type: TransferType,
    pub auto_init: bool,
    pub address_decrement: bool,
}

impl Default for DmaMode {
    fn default() -> Self {
        Self { transfer_type: TransferType::Verify, auto_init: false, address_decrement: false }
    }
}

impl DmaMode {
    /// Decodes an 8237 mode-register byte (`DDMMTTCC`-ish layout: bits
    /// 7:6 transfer type, bit 5 auto-init, bit 4 address decrement, bits 3:2
    /// mode select [demand/single/block/cascade, not separately modeled]).
    pub fn from_byte(value: u8) -> Self {
        let transfer_type = match (value >> 2) & 0b11 {
            0b01 => TransferType::Write,
            0b10 => TransferType::Read,
            _ => TransferType::Verify,
        };
        Self { transfer_type, auto_init: value & 0b0001_0000 != 0, address_decrement: value & 0b0010_0000 != 0 }
    }
}

/// One DMA channel's programmed state — `spec.md` §3's `DmaChannel`.
#[derive(Clone, Copy, Debug, Default)]
pub struct DmaChannel {
    pub base_addr: u16,
    pub current_addr: u16,
    pub base_count: u16,
    pub current_count: u16,
    pub page: u8,
    pub masked: bool,
    pub mode: DmaMode,
    programmed: bool,
}

impl DmaChannel {
    fn physical_address(&self, word_wide: bool) -> PhysAddr {
        let page = (self.page as u32) << 16;
        if word_wide {
            page | ((self.current_addr as u32) << 1)
        } else {
            page | self.current_addr as u32
        }
    }

    fn step_address(&mut self) {
        if self.mode.address_decrement {
            self.current_addr = self.current_addr.wrapping_sub(1);
        } else {
            self.current_addr = self.current_addr.wrapping_add(1);
        }
    }

    fn reload(&mut self) {
        self.current_addr = self.base_addr;
        self.current_count = self.base_count;
    }
}

/// Outcome of a single-unit DMA transfer request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmaOutcome {
    /// A real unit was moved at `addr`.
    Transferred { addr: PhysAddr },
    /// Channel is masked or its count has run out; no transfer occurred.
    /// `terminal_count` is set the first time this is observed after the
    /// channel that just counted down to zero (§3: "DMA transfers stop
    /// exactly at `current_count == 0` and set the terminal-count flag").
    NoData { terminal_count: bool },
}

/// Eight channels, 0-3 byte-wide (cascaded-controller chip 1), 4-7 word-wide
/// (chip 2); channel 4 is reserved for the cascade connection between the
/// two chips and is never driven directly by `dma_channel_read`/`write`.
pub struct DmaControllers {
    pub channels: [DmaChannel; 8],
}

impl Default for DmaControllers {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaControllers {
    pub fn new() -> Self {
        Self { channels: [DmaChannel { masked: true, ..Default::default() }; 8] }
    }

    fn word_wide(ch: usize) -> bool {
        ch >= 4
    }

    pub fn program(&mut self, ch: usize, base_addr: u16, base_count: u16, page: u8, mode: DmaMode) {
        let c = &mut self.channels[ch];
        c.base_addr = base_addr;
        c.current_addr = base_addr;
        c.base_count = base_count;
        c.current_count = base_count;
        c.page = page;
        c.mode = mode;
        c.programmed = true;
        c.masked = false;
    }

    pub fn mask(&mut self, ch: usize) {
        self.channels[ch].masked = true;
    }

    pub fn unmask(&mut self, ch: usize) {
        if self.channels[ch].programmed {
            self.channels[ch].masked = false;
        }
    }

    /// Checks the stop condition (masked, unprogrammed, or exhausted count)
    /// that's shared between read and write before either touches memory.
    /// Returns `Some(outcome)` to short-circuit, or `None` to proceed with a
    /// real transfer this call.
    fn precheck(&mut self, ch: usize) -> Option<DmaOutcome> {
        let c = &mut self.channels[ch];
        if c.masked || !c.programmed {
            return Some(DmaOutcome::NoData { terminal_count: false });
        }
        if c.current_count == 0 {
            // Terminal count was reached by the previous transfer on this
            // channel. Auto-init channels reload and keep running
            // transparently; single-cycle channels mask and report TC here,
            // one call after the last real transfer (§9 open question:
            // decrement-then-test, never reload "early").
            if c.mode.auto_init {
                c.reload();
                None
            } else {
                c.masked = true;
                Some(DmaOutcome::NoData { terminal_count: true })
            }
        } else {
            None
        }
    }

    fn commit_transfer(&mut self, ch: usize) -> PhysAddr {
        let word_wide = Self::word_wide(ch);
        let c = &mut self.channels[ch];
        let addr = c.physical_address(word_wide);
        c.step_address();
        c.current_count = c.current_count.wrapping_sub(1);
        addr
    }

    /// Device pulls one unit from memory. `ch` in `0..8`, excluding 4
    /// (cascade). For byte channels this is one byte at `addr`; for word
    /// channels it is the low byte of the 16-bit word at `addr` (word-mode
    /// devices call this twice, high byte included via the caller's own
    /// width handling — bus-level byte granularity matches `pcbus-mem`).
    pub fn dma_channel_read(&mut self, ch: usize, mem: &MemoryMap) -> (DmaOutcome, u8) {
        if let Some(outcome) = self.precheck(ch) {
            return (outcome, DMA_NO_DATA_SENTINEL);
        }
        let addr = self.commit_transfer(ch);
        (DmaOutcome::Transferred { addr }, mem.read8(addr))
    }

    /// Device pushes one unit into memory.
    pub fn dma_channel_write(&mut self, ch: usize, mem: &mut MemoryMap, value: u8) -> DmaOutcome {
        if let Some(outcome) = self.precheck(ch) {
            return outcome;
        }
        let addr = self.commit_transfer(ch);
        mem.write8(addr, value);
        DmaOutcome::Transferred { addr }
    }
}
