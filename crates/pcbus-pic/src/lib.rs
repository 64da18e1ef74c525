//! Cascaded 8259A-compatible interrupt controllers — §4.4.
//!
//! Each [`Pic8259`] is a single chip's ICW1-4/OCW1-3 state machine. [`PicPair`]
//! wires two of them at the fixed cascade point (master IRQ line 2) and
//! exposes the bus-level `raise`/`lower`/`ack`/`eoi` surface that the rest of
//! the platform (PCI PIRQ steering, device models) actually calls.

use bitflags::bitflags;
use pcbus_io::{Port, PortHandler};

bitflags! {
    struct Icw1: u8 {
        const ICW4_NEEDED = 0b0000_0001;
        const SINGLE      = 0b0000_0010;
        const LEVEL_TRIGGERED = 0b0000_1000;
        const INIT        = 0b0001_0000;
    }
}

bitflags! {
    struct Ocw3: u8 {
        const READ_REG_SELECT = 0b0000_0010; // 1 = the RR bit below selects ISR vs IRR
        const READ_ISR        = 0b0000_0001;
        const POLL            = 0b0000_0100;
        const SMM_ENABLE      = 0b0010_0000;
        const SMM_SET         = 0b0100_0000;
        const IS_OCW3         = 0b0000_1000;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum InitState {
    Ready,
    AwaitingIcw2,
    AwaitingIcw3,
    AwaitingIcw4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReadSelect {
    Irr,
    Isr,
}

/// One 8259A chip. Register-level access mirrors the real command/data port
/// pair; `raise`/`ack_local`/`eoi_local` are the higher-level operations the
/// rest of the bus uses once a chip is past its init sequence.
pub struct Pic8259 {
    state: InitState,
    icw1: Icw1,
    needs_icw3: bool,
    vector_base: u8,
    irr: u8,
    isr: u8,
    imr: u8,
    /// The lowest-priority IRQ line; the line after it (mod 8) is highest
    /// priority. Rotated by OCW2 "rotate on EOI" variants.
    priority_base: u8,
    auto_eoi: bool,
    special_mask_mode: bool,
    read_select: ReadSelect,
}

impl Default for Pic8259 {
    fn default() -> Self {
        Self::new()
    }
}

impl Pic8259 {
    pub fn new() -> Self {
        Self {
            state: InitState::Ready,
            icw1: Icw1::empty(),
            needs_icw3: false,
            vector_base: 0,
            irr: 0,
            isr: 0,
            imr: 0xFF,
            priority_base: 7,
            auto_eoi: false,
            special_mask_mode: false,
            read_select: ReadSelect::Irr,
        }
    }

    pub fn vector_base(&self) -> u8 {
        self.vector_base
    }

    pub fn write_cmd(&mut self, value: u8) {
        let bits = Icw1::from_bits_truncate(value);
        if bits.contains(Icw1::INIT) {
            self.icw1 = bits;
            self.needs_icw3 = !bits.contains(Icw1::SINGLE);
            self.irr = 0;
            self.isr = 0;
            self.imr = 0;
            self.auto_eoi = false;
            self.special_mask_mode = false;
            self.priority_base = 7;
            self.state = InitState::AwaitingIcw2;
            return;
        }
        if self.state != InitState::Ready {
            tracing::warn!("OCW write to PIC command port while mid-init, ignored");
            return;
        }
        let ocw3 = Ocw3::from_bits_truncate(value);
        if ocw3.contains(Ocw3::IS_OCW3) {
            self.write_ocw3(ocw3);
        } else {
            self.write_ocw2(value);
        }
    }

    fn write_ocw2(&mut self, value: u8) {
        let rotate = value & 0x80 != 0;
        let specific = value & 0x40 != 0;
        let eoi = value & 0x20 != 0;
        let level = value & 0x07;

        if eoi {
            let serviced = if specific {
                self.isr &= !(1 << level);
                Some(level)
            } else {
                self.eoi_local(None)
            };
            if rotate {
                if let Some(line) = serviced {
                    self.priority_base = line;
                }
            }
        } else if !specific {
            // R=1/R=0 with SL=0, EOI=0: set/clear rotate-in-automatic-EOI mode.
            self.auto_eoi = rotate;
        }
    }

    fn write_ocw3(&mut self, ocw3: Ocw3) {
        if ocw3.contains(Ocw3::READ_REG_SELECT) {
            self.read_select = if ocw3.contains(Ocw3::READ_ISR) { ReadSelect::Isr } else { ReadSelect::Irr };
        }
        if ocw3.contains(Ocw3::SMM_ENABLE) {
            self.special_mask_mode = ocw3.contains(Ocw3::SMM_SET);
        }
        // POLL bit: a real chip arms the next command-port read to return the
        // poll byte instead of IRR/ISR. Exposed directly as `poll()` instead.
    }

    pub fn write_data(&mut self, value: u8) {
        match self.state {
            InitState::AwaitingIcw2 => {
                self.vector_base = value & 0xF8;
                self.state = if self.needs_icw3 { InitState::AwaitingIcw3 } else { InitState::AwaitingIcw4 };
                self.advance_if_no_icw4();
            }
            InitState::AwaitingIcw3 => {
                // Cascade wiring byte; fixed cascade-at-line-2 topology means
                // we don't need to interpret it beyond consuming the init step.
                self.state = InitState::AwaitingIcw4;
                self.advance_if_no_icw4();
            }
            InitState::AwaitingIcw4 => {
                self.auto_eoi = value & 0x02 != 0;
                self.state = InitState::Ready;
            }
            InitState::Ready => {
                self.imr = value; // OCW1
            }
        }
    }

    fn advance_if_no_icw4(&mut self) {
        if self.state == InitState::AwaitingIcw4 && !self.icw1.contains(Icw1::ICW4_NEEDED) {
            self.state = InitState::Ready;
        }
    }

    pub fn read_data(&self) -> u8 {
        self.imr
    }

    pub fn read_cmd(&self) -> u8 {
        match self.read_select {
            ReadSelect::Irr => self.irr,
            ReadSelect::Isr => self.isr,
        }
    }

    /// OCW3 poll command: returns `(valid, irq)` — `valid` mirrors the
    /// datasheet's bit 7, set only when some unmasked line is pending.
    pub fn poll(&mut self) -> (bool, u8) {
        match self.ack_local() {
            Some(irq) => (true, irq),
            None => (false, 0),
        }
    }

    fn priority_order(&self) -> [u8; 8] {
        let mut order = [0u8; 8];
        for (i, slot) in order.iter_mut().enumerate() {
            *slot = (self.priority_base + 1 + i as u8) % 8;
        }
        order
    }

    pub fn raise(&mut self, line: u8) {
        debug_assert!(line < 8);
        self.irr |= 1 << line;
    }

    pub fn lower(&mut self, line: u8) {
        debug_assert!(line < 8);
        self.irr &= !(1 << line);
    }

    /// Highest-priority unmasked pending line not blocked by a
    /// higher-or-equal priority line already in service.
    fn highest_eligible(&self) -> Option<u8> {
        let highest_isr = self.priority_order().iter().position(|&l| self.isr & (1 << l) != 0);
        for (pos, &line) in self.priority_order().iter().enumerate() {
            if self.irr & (1 << line) == 0 || self.imr & (1 << line) != 0 {
                continue;
            }
            if self.special_mask_mode {
                return Some(line);
            }
            match highest_isr {
                Some(isr_pos) if pos >= isr_pos => continue,
                _ => return Some(line),
            }
        }
        None
    }

    pub fn has_pending_unmasked(&self) -> bool {
        self.highest_eligible().is_some()
    }

    fn ack_local(&mut self) -> Option<u8> {
        let line = self.highest_eligible()?;
        self.irr &= !(1 << line);
        if !self.auto_eoi {
            self.isr |= 1 << line;
        }
        Some(line)
    }

    /// Clears an in-service bit, returning which line was cleared (if any).
    fn eoi_local(&mut self, specific: Option<u8>) -> Option<u8> {
        match specific {
            Some(line) => {
                self.isr &= !(1 << line);
                Some(line)
            }
            None => {
                let line = *self.priority_order().iter().rev().find(|&l| self.isr & (1 << l) != 0)?;
                self.isr &= !(1 << line);
                Some(line)
            }
        }
    }
}

const MASTER_CASCADE_LINE: u8 = 2;

/// Two cascaded 8259As wired at master IRQ line 2, addressed as a flat
/// 0..=15 IRQ space.
pub struct PicPair {
    pub master: Pic8259,
    pub slave: Pic8259,
}

impl Default for PicPair {
    fn default() -> Self {
        Self::new()
    }
}

impl PicPair {
    pub fn new() -> Self {
        Self { master: Pic8259::new(), slave: Pic8259::new() }
    }

    fn split(irq: u8) -> (bool, u8) {
        debug_assert!(irq < 16);
        if irq < 8 {
            (true, irq)
        } else {
            (false, irq - 8)
        }
    }

    pub fn raise(&mut self, irq: u8) {
        let (is_master, line) = Self::split(irq);
        if is_master {
            self.master.raise(line);
        } else {
            self.slave.raise(line);
            self.sync_cascade_line();
        }
    }

    pub fn lower(&mut self, irq: u8) {
        let (is_master, line) = Self::split(irq);
        if is_master {
            self.master.lower(line);
        } else {
            self.slave.lower(line);
            self.sync_cascade_line();
        }
    }

    fn sync_cascade_line(&mut self) {
        if self.slave.has_pending_unmasked() {
            self.master.raise(MASTER_CASCADE_LINE);
        } else {
            self.master.lower(MASTER_CASCADE_LINE);
        }
    }

    /// CPU interrupt acknowledgment: resolves through the cascade and
    /// returns the final interrupt vector.
    pub fn ack(&mut self) -> Option<u8> {
        let master_line = self.master.highest_eligible()?;
        if master_line == MASTER_CASCADE_LINE {
            self.master.ack_local(); // commits master's cascade-line in-service bit
            let slave_line = self.slave.ack_local()?;
            Some(self.slave.vector_base() + slave_line)
        } else {
            self.master.ack_local();
            Some(self.master.vector_base() + master_line)
        }
    }

    /// `specific` is a global IRQ number (0..=15), matching the bus-level
    /// addressing the rest of the platform uses.
    pub fn eoi(&mut self, specific: Option<u8>) {
        match specific {
            Some(irq) => {
                let (is_master, line) = Self::split(irq);
                if is_master {
                    self.master.eoi_local(Some(line));
                } else {
                    self.slave.eoi_local(Some(line));
                    self.sync_cascade_line();
                }
            }
            None => {
                // Non-specific EOI clears whichever chip currently has the
                // highest-priority in-service bit; if that's the cascade
                // line, the slave's own top-of-stack line clears too.
                if self.master.isr & (1 << MASTER_CASCADE_LINE) != 0 && self.master_isr_top_is_cascade() {
                    self.slave.eoi_local(None);
                    self.sync_cascade_line();
                } else {
                    self.master.eoi_local(None);
                }
            }
        }
    }

    fn master_isr_top_is_cascade(&self) -> bool {
        self.master
            .priority_order()
            .iter()
            .rev()
            .find(|&&l| self.master.isr & (1 << l) != 0)
            .map(|&l| l == MASTER_CASCADE_LINE)
            .unwrap_or(false)
    }
}

/// `Pic8259` answers directly at the conventional IBM PC command/data port
/// pairs (`0x20`/`0x21` master, `0xA0`/`0xA1` slave) — register each chip with
/// `pcbus-io::PortIoTable::sethandler` at its own base, length 2.
impl PortHandler for Pic8259 {
    fn read8(&mut self, port: Port) -> Option<u8> {
        Some(if port & 1 == 0 { self.read_cmd() } else { self.read_data() })
    }
    fn write8(&mut self, port: Port, value: u8) -> bool {
        if port & 1 == 0 {
            self.write_cmd(value);
        } else {
            self.write_data(value);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init(pic: &mut Pic8259, base: u8) {
        pic.write_cmd(0x11); // ICW1: edge, cascade, ICW4 needed
        pic.write_data(base); // ICW2: vector base
        pic.write_data(0x04); // ICW3
        pic.write_data(0x01); // ICW4: 8086 mode
    }

    #[test]
    fn init_sequence_reaches_ready_and_accepts_ocw1() {
        let mut pic = Pic8259::new();
        init(&mut pic, 0x20);
        pic.write_data(0x00); // OCW1: unmask everything
        assert_eq!(pic.read_data(), 0x00);
    }

    /// Literal scenario from §8: PIRQ steering resolves to vector
    /// `master_base + 10`.
    #[test]
    fn pirq_steering_resolves_through_cascade() {
        let mut pair = PicPair::new();
        init(&mut pair.master, 0x20);
        init(&mut pair.slave, 0x28);
        pair.master.write_data(0x00);
        pair.slave.write_data(0x00);

        pair.raise(10); // IRQ10 lives on the slave, local line 2
        let vector = pair.ack().expect("irq10 pending");
        assert_eq!(vector, 0x28 + 2);
    }

    #[test]
    fn ack_without_eoi_blocks_same_priority_reack() {
        let mut pic = Pic8259::new();
        init(&mut pic, 0x20);
        pic.write_data(0x00);

        pic.raise(1);
        let first = pic.ack_local();
        assert_eq!(first, Some(1));
        pic.raise(1);
        // IRQ1 is already in service; a lower-or-equal priority line can't
        // preempt itself until EOI.
        assert_eq!(pic.highest_eligible(), None);

        pic.eoi_local(Some(1));
        pic.raise(1);
        assert_eq!(pic.ack_local(), Some(1));
    }

    #[test]
    fn masked_line_never_acks() {
        let mut pic = Pic8259::new();
        init(&mut pic, 0x20);
        pic.write_data(0xFF & !(1 << 3)); // unmask only IRQ3
        pic.raise(0);
        pic.raise(3);
        assert_eq!(pic.ack_local(), Some(3));
    }

    #[test]
    fn lower_priority_cannot_preempt_in_service_higher_priority() {
        let mut pic = Pic8259::new();
        init(&mut pic, 0x20);
        pic.write_data(0x00);

        pic.raise(0);
        assert_eq!(pic.ack_local(), Some(0));
        pic.raise(5);
        // IRQ0 is still in service and is the highest-priority line; no
        // lower-priority request can be granted until it's EOI'd.
        assert_eq!(pic.highest_eligible(), None);

        pic.eoi_local(Some(0));
        assert_eq!(pic.highest_eligible(), Some(5));
    }
}
